pub mod manager;
pub mod types;
pub mod validation;

pub use manager::{load_config, parse_config, ConfigEvent, ConfigFormat, ConfigManager};
pub use types::*;
pub use validation::{ConfigValidator, ValidationError};
