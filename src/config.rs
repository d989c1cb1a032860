//! Player configuration (config.toml in the platform config directory)

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::audio::format::PcmFormat;
use crate::constants::{
    DEFAULT_ASSET_DIR, DEFAULT_BUFFER_COUNT, DEFAULT_BUFFER_MS, MAX_BUFFER_COUNT,
    MIN_BUFFER_COUNT,
};
use crate::error::ConfigError;

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PlayerConfig {
    #[serde(default)]
    pub format: PcmFormat,
    #[serde(default)]
    pub buffers: BufferConfig,
    #[serde(default)]
    pub output: OutputConfig,
    #[serde(default)]
    pub assets: AssetConfig,
}

/// Buffer pool sizing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BufferConfig {
    #[serde(default = "default_buffer_count")]
    pub count: usize,
    #[serde(default = "default_buffer_ms")]
    pub duration_ms: u32,
    /// Explicit capacity in bytes, overrides `duration_ms`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bytes: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct OutputConfig {
    /// Output device name, `None` for the system default
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssetConfig {
    #[serde(default = "default_asset_root")]
    pub root: PathBuf,
}

fn default_buffer_count() -> usize {
    DEFAULT_BUFFER_COUNT
}

fn default_buffer_ms() -> u32 {
    DEFAULT_BUFFER_MS
}

fn default_asset_root() -> PathBuf {
    PathBuf::from(DEFAULT_ASSET_DIR)
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            count: DEFAULT_BUFFER_COUNT,
            duration_ms: DEFAULT_BUFFER_MS,
            bytes: None,
        }
    }
}

impl Default for AssetConfig {
    fn default() -> Self {
        Self {
            root: default_asset_root(),
        }
    }
}

impl BufferConfig {
    pub fn new(count: usize, duration_ms: u32) -> Self {
        Self {
            count,
            duration_ms,
            bytes: None,
        }
    }

    /// Fixed byte capacity per buffer instead of a duration
    pub fn with_bytes(count: usize, bytes: usize) -> Self {
        Self {
            count,
            duration_ms: DEFAULT_BUFFER_MS,
            bytes: Some(bytes),
        }
    }

    /// Bytes per buffer for `format`: whole frames, never less than one frame
    pub fn capacity_for(&self, format: &PcmFormat) -> usize {
        let raw = self.bytes.unwrap_or_else(|| {
            format.bytes_for_duration(Duration::from_millis(self.duration_ms as u64))
        });
        format.align_to_frame(raw).max(format.frame_size().max(1))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(MIN_BUFFER_COUNT..=MAX_BUFFER_COUNT).contains(&self.count) {
            return Err(ConfigError::Invalid(format!(
                "buffers.count must be between {} and {}, got {}",
                MIN_BUFFER_COUNT, MAX_BUFFER_COUNT, self.count
            )));
        }
        match self.bytes {
            Some(0) => Err(ConfigError::Invalid(
                "buffers.bytes must be non-zero".to_string(),
            )),
            None if self.duration_ms == 0 => Err(ConfigError::Invalid(
                "buffers.duration_ms must be non-zero".to_string(),
            )),
            _ => Ok(()),
        }
    }
}

impl PlayerConfig {
    /// `config.toml` in the platform config directory
    pub fn default_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("io", "pcm-stream", "pcm-stream-player")
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let config: Self = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load `path`, falling back to defaults when the file does not exist
    pub fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        if path.exists() {
            Self::load(path)
        } else {
            tracing::debug!(path = %path.display(), "No config file, using defaults");
            Ok(Self::default())
        }
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self)?;
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir).map_err(|source| ConfigError::Read {
                path: dir.display().to_string(),
                source,
            })?;
        }
        std::fs::write(path, content).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.format
            .validate()
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;
        self.buffers.validate()
    }
}
