//! TOML configuration file loading
//!
//! Supports `~/.config/neural-link/config.toml` as a persistent config source.
//! All fields are optional; the file is a partial overlay on top of defaults.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::Result;

/// Top-level TOML configuration file schema
#[derive(Debug, Default, Clone, PartialEq, Deserialize, Serialize)]
pub struct LinkConfigFile {
    /// Credential for the live endpoint
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    /// How long a finished transcript stays visible
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transcript_linger_ms: Option<u64>,

    /// Live session configuration
    #[serde(default)]
    pub live: LiveFileConfig,

    /// Audio configuration
    #[serde(default)]
    pub audio: AudioFileConfig,

    /// Reconnect configuration
    #[serde(default)]
    pub retry: RetryFileConfig,

    /// Board server configuration
    #[serde(default)]
    pub board: BoardFileConfig,
}

/// Live endpoint configuration
#[derive(Debug, Default, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct LiveFileConfig {
    /// WebSocket endpoint URL
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,

    /// Model identifier (e.g. "models/gemini-2.5-flash-native-audio-preview-12-2025")
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    /// Prebuilt voice name (e.g. "Kore")
    #[serde(skip_serializing_if = "Option::is_none")]
    pub voice: Option<String>,

    /// Replacement assistant instruction
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_instruction: Option<String>,
}

/// Audio configuration
#[derive(Debug, Default, Clone, PartialEq, Deserialize, Serialize)]
pub struct AudioFileConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_sample_rate: Option<u32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_sample_rate: Option<u32>,

    /// Samples per captured frame
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frame_size: Option<usize>,

    /// Initial output volume (0.0 to 1.0)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub volume: Option<f32>,
}

/// Reconnect configuration
#[derive(Debug, Default, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct RetryFileConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_attempts: Option<u32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_delay_ms: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_delay_ms: Option<u64>,
}

/// Board server configuration
#[derive(Debug, Default, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct BoardFileConfig {
    /// Local port for the board page
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,

    /// Serve the board page at all
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
}

/// Load the TOML config file from the standard path
///
/// Returns `LinkConfigFile::default()` if the file doesn't exist or can't be parsed.
pub fn load_config_file() -> LinkConfigFile {
    config_file_path().map_or_else(LinkConfigFile::default, |path| load_config_from(&path))
}

/// Load a TOML config file from an explicit path
///
/// Missing or invalid files yield defaults; problems are logged, not returned.
pub fn load_config_from(path: &Path) -> LinkConfigFile {
    if !path.exists() {
        return LinkConfigFile::default();
    }

    match std::fs::read_to_string(path) {
        Ok(content) => match toml::from_str(&content) {
            Ok(config) => {
                tracing::info!(path = %path.display(), "loaded config file");
                config
            }
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "failed to parse config file, using defaults"
                );
                LinkConfigFile::default()
            }
        },
        Err(e) => {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                "failed to read config file"
            );
            LinkConfigFile::default()
        }
    }
}

/// Serialize and write the config file, creating parent directories
///
/// # Errors
///
/// Returns error if the file cannot be serialized or written
pub fn write_config_file(path: &Path, config: &LinkConfigFile) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let toml = toml::to_string_pretty(config)
        .map_err(|e| crate::Error::Config(format!("failed to serialize config: {e}")))?;
    std::fs::write(path, toml)?;

    Ok(())
}

/// Return the config file path: `~/.config/neural-link/config.toml`
pub fn config_file_path() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|d| d.config_dir().join("neural-link").join("config.toml"))
}
