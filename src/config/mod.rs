//! Configuration management for the neural link
//!
//! Layering: built-in defaults, then the TOML file, then environment variables.

pub mod file;

use std::path::PathBuf;
use std::time::Duration;

use secrecy::SecretString;

use crate::live::gemini::DEFAULT_ENDPOINT;
use crate::session::RetryPolicy;
use crate::{Error, Result};

pub use file::{LinkConfigFile, config_file_path, load_config_file, write_config_file};

/// Default live model
pub const DEFAULT_MODEL: &str = "models/gemini-2.5-flash-native-audio-preview-12-2025";

/// Default prebuilt voice
pub const DEFAULT_VOICE: &str = "Kore";

/// Default board server port
pub const DEFAULT_BOARD_PORT: u16 = 18790;

/// Assistant instruction sent at connect time
pub const DEFAULT_SYSTEM_INSTRUCTION: &str = "You are JARVIS.\n\
NEURAL BOARD PROTOCOLS:\n\
1. NEVER output code blocks (```) in your text response.\n\
2. ALWAYS use 'display_content' for technical visuals.\n\
3. The user will see your core on the left and data on the right.\n\
4. When \"listening\", pulse cyan. Be efficient and predictive.";

/// Neural link configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Credential for the live endpoint (never logged)
    pub api_key: Option<SecretString>,

    /// Live session configuration
    pub live: LiveConfig,

    /// Audio configuration
    pub audio: AudioConfig,

    /// Reconnect policy
    pub retry: RetryPolicy,

    /// How long a finished transcript stays visible
    pub transcript_linger: Duration,

    /// Board server configuration
    pub board: BoardConfig,

    /// Where the config file lives (used when persisting a credential)
    pub config_path: Option<PathBuf>,
}

/// Live endpoint configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiveConfig {
    pub endpoint: String,
    pub model: String,
    pub voice: String,
    pub system_instruction: String,
}

impl Default for LiveConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            model: DEFAULT_MODEL.to_string(),
            voice: DEFAULT_VOICE.to_string(),
            system_instruction: DEFAULT_SYSTEM_INSTRUCTION.to_string(),
        }
    }
}

/// Audio configuration
#[derive(Debug, Clone, PartialEq)]
pub struct AudioConfig {
    /// Capture rate sent to the endpoint
    pub input_sample_rate: u32,
    /// Rate of synthesized speech
    pub output_sample_rate: u32,
    /// Samples per captured frame
    pub frame_size: usize,
    /// Initial output volume (0.0 to 1.0)
    pub volume: f32,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            input_sample_rate: crate::voice::SAMPLE_RATE,
            output_sample_rate: crate::voice::PLAYBACK_SAMPLE_RATE,
            frame_size: crate::voice::FRAME_SIZE,
            volume: 0.8,
        }
    }
}

/// Board server configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoardConfig {
    pub enabled: bool,
    pub port: u16,
}

impl Default for BoardConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: DEFAULT_BOARD_PORT,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_key: None,
            live: LiveConfig::default(),
            audio: AudioConfig::default(),
            retry: RetryPolicy::default(),
            transcript_linger: Duration::from_secs(3),
            board: BoardConfig::default(),
            config_path: None,
        }
    }
}

impl Config {
    /// Load configuration from the config file and the process environment
    ///
    /// # Errors
    ///
    /// Returns error if a configured value is out of range
    pub fn load() -> Result<Self> {
        let mut config = Self::from_sources(load_config_file(), |key| std::env::var(key).ok())?;
        config.config_path = config_file_path();
        Ok(config)
    }

    /// Build configuration from a parsed file and an environment lookup
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if a sample rate or frame size is zero
    pub fn from_sources<F>(fc: LinkConfigFile, env: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let non_empty = |key: &str| env(key).filter(|v| !v.trim().is_empty());

        // Credential (env > toml)
        let api_key = non_empty("GEMINI_API_KEY")
            .or_else(|| non_empty("API_KEY"))
            .or(fc.api_key.filter(|k| !k.trim().is_empty()))
            .map(SecretString::from);

        // Live endpoint (env > toml > default)
        let live = LiveConfig {
            endpoint: non_empty("NEURAL_LINK_ENDPOINT")
                .or(fc.live.endpoint)
                .unwrap_or(defaults.live.endpoint),
            model: non_empty("NEURAL_LINK_MODEL")
                .or(fc.live.model)
                .map(qualify_model)
                .unwrap_or(defaults.live.model),
            voice: non_empty("NEURAL_LINK_VOICE")
                .or(fc.live.voice)
                .unwrap_or(defaults.live.voice),
            system_instruction: fc
                .live
                .system_instruction
                .unwrap_or(defaults.live.system_instruction),
        };

        // Audio (env > toml > default)
        let volume = non_empty("NEURAL_LINK_VOLUME")
            .and_then(|s| s.parse::<f32>().ok())
            .or(fc.audio.volume)
            .unwrap_or(defaults.audio.volume);
        let audio = AudioConfig {
            input_sample_rate: fc
                .audio
                .input_sample_rate
                .unwrap_or(defaults.audio.input_sample_rate),
            output_sample_rate: fc
                .audio
                .output_sample_rate
                .unwrap_or(defaults.audio.output_sample_rate),
            frame_size: fc.audio.frame_size.unwrap_or(defaults.audio.frame_size),
            volume: clamp_volume(volume),
        };

        if audio.input_sample_rate == 0 || audio.output_sample_rate == 0 {
            return Err(Error::Config("sample rates must be non-zero".to_string()));
        }
        if audio.frame_size == 0 {
            return Err(Error::Config("frame size must be non-zero".to_string()));
        }

        let retry = RetryPolicy {
            max_attempts: fc.retry.max_attempts.unwrap_or(defaults.retry.max_attempts),
            base_delay: fc
                .retry
                .base_delay_ms
                .map_or(defaults.retry.base_delay, Duration::from_millis),
            max_delay: fc
                .retry
                .max_delay_ms
                .map_or(defaults.retry.max_delay, Duration::from_millis),
        };

        let board = BoardConfig {
            enabled: fc.board.enabled.unwrap_or(defaults.board.enabled),
            port: non_empty("NEURAL_LINK_BOARD_PORT")
                .and_then(|s| s.parse().ok())
                .or(fc.board.port)
                .unwrap_or(defaults.board.port),
        };

        Ok(Self {
            api_key,
            live,
            audio,
            retry,
            transcript_linger: fc
                .transcript_linger_ms
                .map_or(defaults.transcript_linger, Duration::from_millis),
            board,
            config_path: None,
        })
    }

    /// Whether a credential is configured
    #[must_use]
    pub const fn has_api_key(&self) -> bool {
        self.api_key.is_some()
    }
}

/// Clamp a volume into [0, 1]; NaN becomes silence
#[must_use]
pub fn clamp_volume(volume: f32) -> f32 {
    if volume.is_nan() {
        0.0
    } else {
        volume.clamp(0.0, 1.0)
    }
}

/// Model names go on the wire as `models/<name>`
fn qualify_model(model: String) -> String {
    if model.starts_with("models/") {
        model
    } else {
        format!("models/{model}")
    }
}
