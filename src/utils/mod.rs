pub mod errors;
pub mod logging;
pub mod shutdown;

pub use errors::{HubError, HubResult};
pub use logging::init_tracing;
pub use shutdown::{ShutdownCoordinator, ShutdownReason};
