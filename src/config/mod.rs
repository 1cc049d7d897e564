mod bytesize;

pub use bytesize::ByteSize;

use crate::global;
use crate::live::StaticRoom;
use crate::recorders::ProcessRecorderSettings;
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub api: ApiConfig,
    pub recorder: RecorderConfig,
    pub rooms: Vec<StaticRoom>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub bind: String,
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecorderConfig {
    /// Where recordings are written. Defaults to `<data dir>/liverec/recordings`.
    pub output_dir: Option<PathBuf>,
    /// Capture command; `{url}` and `{output}` are substituted per argument.
    pub command: Vec<String>,
    /// File extension of produced recordings
    pub extension: String,
    /// How long a capture process gets to finalize its output before it is killed
    pub close_timeout_seconds: u64,
    /// Free space required on the output volume before a room starts
    /// recording, e.g. "1GB". Restarts are not rechecked; "0" disables it.
    pub min_free_space: ByteSize,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1".to_string(),
            port: 8372,
        }
    }
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            output_dir: None,
            command: [
                "ffmpeg",
                "-nostdin",
                "-hide_banner",
                "-loglevel",
                "error",
                "-i",
                "{url}",
                "-c",
                "copy",
                "-f",
                "flv",
                "{output}",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            extension: "flv".to_string(),
            close_timeout_seconds: 10,
            min_free_space: ByteSize::gb(1),
        }
    }
}

impl RecorderConfig {
    /// Resolve into the settings shared by every process recorder.
    pub fn settings(&self) -> Result<ProcessRecorderSettings> {
        let output_dir = match &self.output_dir {
            Some(dir) => dir.clone(),
            None => global::recordings_dir()?,
        };

        Ok(ProcessRecorderSettings {
            output_dir,
            command: self.command.clone(),
            extension: self.extension.clone(),
            close_timeout: Duration::from_secs(self.close_timeout_seconds),
            min_free_space: self.min_free_space,
        })
    }
}

impl Config {
    /// Load from `path`, or from the default location when `None`.
    ///
    /// A missing file is created with defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config_path = match path {
            Some(path) => path.to_path_buf(),
            None => Self::config_path()?,
        };

        if !config_path.exists() {
            info!(
                "Config file not found, creating default at {:?}",
                config_path
            );
            let config = Self::default();
            config.save_to(&config_path)?;
            return Ok(config);
        }

        let content =
            std::fs::read_to_string(&config_path).context("Failed to read config file")?;

        let config = Self::parse(&content)?;

        info!("Loaded config from {:?}", config_path);
        Ok(config)
    }

    pub fn parse(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content).context("Failed to parse config file")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.recorder.command.is_empty() {
            bail!("recorder.command must not be empty");
        }

        let mut seen = HashSet::new();
        for room in &self.rooms {
            if room.id.as_str().trim().is_empty() {
                bail!("Room ids must not be empty");
            }
            if room.url.trim().is_empty() {
                bail!("Room {} has no url", room.id);
            }
            if !seen.insert(&room.id) {
                bail!("Room {} is configured more than once", room.id);
            }
        }

        Ok(())
    }

    pub fn save_to(&self, config_path: &Path) -> Result<()> {
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create config directory")?;
        }

        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;

        std::fs::write(config_path, content).context("Failed to write config file")?;

        Ok(())
    }

    fn config_path() -> Result<PathBuf> {
        global::config_file()
    }
}
