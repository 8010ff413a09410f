use std::collections::HashMap;
use std::path::Path;

use mc_rs_invsee::EngineConfig;
use serde::Deserialize;

#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    pub logging: LoggingSection,
    #[serde(default)]
    pub storage: StorageSection,
    #[serde(default)]
    pub engine: EngineConfig,
    /// Localisation key to title template; `%player%` is replaced with the
    /// target's name.
    #[serde(default)]
    pub titles: HashMap<String, String>,
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
}

fn default_tick_interval_ms() -> u64 {
    50
}

#[derive(Debug, Deserialize)]
pub struct LoggingSection {
    pub level: String,
}

#[derive(Debug, Deserialize)]
pub struct StorageSection {
    /// Root of the player data; player files live in `<directory>/players`.
    #[serde(default = "default_storage_directory")]
    pub directory: String,
}

fn default_storage_directory() -> String {
    "data".into()
}

impl Default for StorageSection {
    fn default() -> Self {
        Self {
            directory: default_storage_directory(),
        }
    }
}

impl ServerConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, Box<dyn std::error::Error>> {
        let contents = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&contents)?;
        Ok(config)
    }
}
