use crate::mqtt::config::{DisplayConfig, MqttConfig};
use crate::topics::{GroupCatalog, GroupTopics};
use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn, Level};

const CONFIG_DIR: &str = ".config/mqttdeck";
const CONFIG_FILE: &str = "config.toml";

/// Application configuration, one TOML file
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    pub log_level: String,
    pub broker: MqttConfig,
    pub display: DisplayConfig,
    /// Static group catalog for topic resolution
    pub groups: Vec<GroupTopics>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            broker: MqttConfig::default(),
            display: DisplayConfig::default(),
            groups: default_groups(),
        }
    }
}

fn default_groups() -> Vec<GroupTopics> {
    let suffixes = |list: &[&str]| list.iter().map(|s| s.to_string()).collect();
    vec![
        GroupTopics {
            group: "g1".to_string(),
            topics: suffixes(&["EEG", "status", "command"]),
        },
        GroupTopics {
            group: "g2".to_string(),
            topics: suffixes(&["EEG", "status"]),
        },
    ]
}

impl AppConfig {
    /// `~/.config/mqttdeck/config.toml`
    pub fn default_path() -> PathBuf {
        let mut path = dirs::home_dir().unwrap_or_else(|| {
            warn!("Could not determine home directory, using current directory");
            PathBuf::from(".")
        });
        path.push(CONFIG_DIR);
        path.push(CONFIG_FILE);
        path
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| eyre!("Failed to parse config file: {}", e))
    }

    /// Reads `path`, falling back to defaults when the file does not exist.
    pub async fn load_or_default(path: &Path) -> Result<Self> {
        if !tokio::fs::try_exists(path)
            .await
            .map_err(|e| eyre!("Failed to check if config file exists: {}", e))?
        {
            warn!("No config at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;
        let config = Self::from_toml_str(&content)?;
        info!("Loaded config from {}", path.display());
        Ok(config)
    }

    /// Writes the default configuration to `path` unless a file is already there.
    pub async fn ensure_default_config(path: &Path) -> Result<()> {
        if tokio::fs::try_exists(path)
            .await
            .map_err(|e| eyre!("Failed to check if config file exists: {}", e))?
        {
            debug!("Config file {} exists", path.display());
            return Ok(());
        }

        if let Some(dir) = path.parent() {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|e| eyre!("Failed to create config directory: {}", e))?;
        }
        let content = toml::to_string_pretty(&Self::default())
            .map_err(|e| eyre!("Failed to serialize default config: {}", e))?;
        tokio::fs::write(path, content)
            .await
            .map_err(|e| eyre!("Failed to write default config: {}", e))?;
        info!("Wrote default config to {}", path.display());
        Ok(())
    }

    pub fn catalog(&self) -> GroupCatalog {
        GroupCatalog::new(self.groups.clone())
    }

    /// Maximum log level; unknown names fall back to `INFO`
    pub fn level(&self) -> Level {
        match self.log_level.to_ascii_lowercase().as_str() {
            "error" => Level::ERROR,
            "warn" => Level::WARN,
            "info" => Level::INFO,
            "debug" => Level::DEBUG,
            "trace" => Level::TRACE,
            other => {
                warn!("Unknown log level {:?}, using info", other);
                Level::INFO
            }
        }
    }
}
