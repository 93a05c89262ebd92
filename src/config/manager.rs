use crate::config::HubConfig;
use crate::utils::errors::{HubError, HubResult};
use notify::{Event, RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::RwLock;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, error, info};

/// Supported config file formats
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFormat {
    Toml,
    Json,
    Yaml,
}

impl ConfigFormat {
    /// Detect format from file extension, falling back to the content
    pub fn detect(path: &Path, content: &str) -> Self {
        match path.extension().and_then(|ext| ext.to_str()) {
            Some("toml") => ConfigFormat::Toml,
            Some("json") => ConfigFormat::Json,
            Some("yml") | Some("yaml") => ConfigFormat::Yaml,
            _ => {
                let trimmed = content.trim_start();
                if trimmed.starts_with('{') {
                    ConfigFormat::Json
                } else if toml::from_str::<toml::Table>(content).is_ok() {
                    ConfigFormat::Toml
                } else {
                    ConfigFormat::Yaml
                }
            }
        }
    }
}

#[derive(Debug, Clone)]
pub enum ConfigEvent {
    Reloaded,
    Error(String),
}

/// Parse hub configuration text in the given format
pub fn parse_config(content: &str, format: ConfigFormat) -> HubResult<HubConfig> {
    match format {
        ConfigFormat::Toml => toml::from_str(content)
            .map_err(|e| HubError::Configuration(format!("Failed to parse TOML config: {}", e))),
        ConfigFormat::Json => serde_json::from_str(content)
            .map_err(|e| HubError::Configuration(format!("Failed to parse JSON config: {}", e))),
        ConfigFormat::Yaml => serde_yaml::from_str(content)
            .map_err(|e| HubError::Configuration(format!("Failed to parse YAML config: {}", e))),
    }
}

/// `~` and `$VAR` expanded path
pub fn expand_path(path: impl AsRef<Path>) -> PathBuf {
    let raw = path.as_ref().to_string_lossy();
    match shellexpand::full(&raw) {
        Ok(expanded) => PathBuf::from(expanded.as_ref()),
        Err(_) => PathBuf::from(shellexpand::tilde(&raw).as_ref()),
    }
}

/// Read and parse a config file once, without watching it
pub async fn load_config(path: impl AsRef<Path>) -> HubResult<(HubConfig, ConfigFormat)> {
    let path = expand_path(path);
    let content = tokio::fs::read_to_string(&path).await.map_err(|e| {
        HubError::Configuration(format!("Failed to read config {}: {}", path.display(), e))
    })?;
    let format = ConfigFormat::detect(&path, &content);
    debug!("Detected config format: {:?}", format);
    Ok((parse_config(&content, format)?, format))
}

/// State shared between the manager and its file watcher
struct Shared {
    path: PathBuf,
    config: RwLock<HubConfig>,
    events: broadcast::Sender<ConfigEvent>,
}

impl Shared {
    /// Re-read the file; a failed parse keeps the previous config live.
    async fn refresh(&self) -> HubResult<()> {
        match load_config(&self.path).await {
            Ok((config, _)) => {
                *self.config.write() = config;
                let _ = self.events.send(ConfigEvent::Reloaded);
                Ok(())
            }
            Err(e) => {
                let _ = self.events.send(ConfigEvent::Error(e.to_string()));
                Err(e)
            }
        }
    }
}

/// Holds the current config and reloads it whenever the file changes
pub struct ConfigManager {
    shared: Arc<Shared>,
    format: ConfigFormat,
    _watcher: RecommendedWatcher,
}

impl ConfigManager {
    pub async fn new(path: impl AsRef<Path>) -> HubResult<Self> {
        let path = expand_path(path);
        let (config, format) = load_config(&path).await?;
        let (events, _) = broadcast::channel(16);
        let shared = Arc::new(Shared {
            path: path.clone(),
            config: RwLock::new(config),
            events,
        });

        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| HubError::Configuration(format!("No Tokio runtime available: {}", e)))?;
        let watched = Arc::downgrade(&shared);
        let mut watcher = notify::recommended_watcher(move |res: Result<Event, notify::Error>| {
            let event = match res {
                Ok(event) => event,
                Err(e) => {
                    error!("Config watcher error: {}", e);
                    return;
                }
            };
            if !(event.kind.is_modify() || event.kind.is_create()) {
                return;
            }
            let Some(shared) = watched.upgrade() else {
                return;
            };
            info!("Config file {} changed, reloading", shared.path.display());
            runtime.spawn(async move {
                if let Err(e) = shared.refresh().await {
                    error!("Failed to reload config: {}", e);
                }
            });
        })
        .map_err(|e| HubError::Configuration(format!("Failed to create config watcher: {}", e)))?;

        watcher
            .watch(&path, RecursiveMode::NonRecursive)
            .map_err(|e| HubError::Configuration(format!("Failed to watch {}: {}", path.display(), e)))?;

        Ok(Self {
            shared,
            format,
            _watcher: watcher,
        })
    }

    pub fn path(&self) -> &Path {
        &self.shared.path
    }

    pub fn format(&self) -> ConfigFormat {
        self.format
    }

    /// Snapshot of the live configuration
    pub fn get_config(&self) -> HubConfig {
        self.shared.config.read().clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConfigEvent> {
        self.shared.events.subscribe()
    }

    /// Re-read the file now instead of waiting for the watcher
    pub async fn reload(&self) -> HubResult<()> {
        self.shared.refresh().await
    }
}
