use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use anyhow::{Context, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub zoom: ZoomConfig,
    pub drive: DriveConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub transfer: TransferConfig,
    #[serde(default)]
    pub naming: NamingConfig,
    #[serde(default)]
    pub verify: VerifyConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ZoomConfig {
    pub account_id: String,
    pub client_id: String,
    pub client_secret: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriveConfig {
    /// Authorized-user JSON with client id/secret and a refresh token.
    pub credentials_file: PathBuf,
    #[serde(default = "default_root_folder")]
    pub root_folder: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub staging_dir: PathBuf,
    pub ledger_path: PathBuf,
    pub daily_cap_gb: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferConfig {
    pub max_retries: u32,
    pub retry_delay_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NamingConfig {
    /// Format the manifest's "Start Time" column is written in.
    pub start_time_format: String,
    /// Format used when the start time appears in destination names.
    pub time_format: String,
    pub folder_template: String,
    pub file_template: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VerifyConfig {
    /// File types counted toward the expected-file total. `None` counts
    /// everything Zoom reports, including transcript-only artifacts.
    pub count_file_types: Option<Vec<String>>,
}

fn default_root_folder() -> String {
    "zoom-recordings".to_string()
}

fn default_data_dir() -> PathBuf {
    directories::ProjectDirs::from("com", "zoomdrive", "zoom-drive-migrator")
        .map(|dirs| dirs.data_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from("."))
}

impl Default for StorageConfig {
    fn default() -> Self {
        let data_dir = default_data_dir();
        Self {
            staging_dir: data_dir.join("staging"),
            ledger_path: data_dir.join("ledger.jsonl"),
            daily_cap_gb: 700.0,
        }
    }
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay_secs: 5,
        }
    }
}

impl Default for NamingConfig {
    fn default() -> Self {
        Self {
            // Matches the Zoom admin console CSV export, e.g. "Aug 07, 2025 10:30:00 AM"
            start_time_format: "%b %d, %Y %I:%M:%S %p".to_string(),
            time_format: "%Y.%m.%d - %I.%M %p".to_string(),
            folder_template: "{topic} - {meeting_time}".to_string(),
            file_template: "{meeting_time} - {topic} - {rec_type} - {file_id}.{ext}".to_string(),
        }
    }
}

impl Config {
    /// Loads the configuration, trying the explicit path first, then
    /// `config.toml` in the working directory, then the platform config dir.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let path = Self::resolve_path(explicit)?;
        let raw = std::fs::read_to_string(&path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        let config: Config = toml::from_str(&raw)
            .with_context(|| format!("parsing config file {}", path.display()))?;
        Ok(config)
    }

    fn resolve_path(explicit: Option<&Path>) -> Result<PathBuf> {
        if let Some(path) = explicit {
            return Ok(path.to_path_buf());
        }

        let local = PathBuf::from("config.toml");
        if local.exists() {
            return Ok(local);
        }

        if let Some(dirs) = directories::ProjectDirs::from("com", "zoomdrive", "zoom-drive-migrator") {
            let candidate = dirs.config_dir().join("config.toml");
            if candidate.exists() {
                return Ok(candidate);
            }
        }

        anyhow::bail!(
            "no config file found; pass --config or create config.toml in the working directory"
        )
    }

    pub fn cap_bytes(&self, override_gb: Option<f64>) -> u64 {
        let gb = override_gb.unwrap_or(self.storage.daily_cap_gb);
        (gb * 1024.0 * 1024.0 * 1024.0) as u64
    }
}
