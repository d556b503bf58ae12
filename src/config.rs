use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

const CONFIG_ENV: &str = "TIMER_META_CONFIG";

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreKind {
    #[default]
    Sqlite,
    Memory,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AppConfig {
    pub data_dir: PathBuf,
    pub store: StoreKind,
    pub poll_interval_ms: u64,
    /// Zone for CLI-created schedules that name none.
    pub default_zone: Option<String>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            data_dir: home_dir().join(".timer-meta"),
            store: StoreKind::Sqlite,
            poll_interval_ms: 1000,
            default_zone: None,
        }
    }
}

impl AppConfig {
    pub fn load() -> Result<Self> {
        Self::load_from(&config_path())
    }

    /// Reads the config at `path`; a missing file yields the defaults.
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = fs::read_to_string(path)?;
        serde_json::from_str(&content)
            .map_err(|e| anyhow!("failed to parse config at {}: {e}", path.display()))
    }
}

pub fn config_path() -> PathBuf {
    match std::env::var_os(CONFIG_ENV) {
        Some(path) => PathBuf::from(path),
        None => home_dir().join(".timer-meta").join("config.json"),
    }
}

fn home_dir() -> PathBuf {
    dirs::home_dir().unwrap_or_else(|| PathBuf::from("."))
}
