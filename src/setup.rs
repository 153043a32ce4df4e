//! Credential provisioning and the interactive setup command (`neural-link setup`)

use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use dialoguer::{Confirm, Input, Password};
use secrecy::SecretString;

use crate::config::file::{LinkConfigFile, load_config_from, write_config_file};
use crate::config::{DEFAULT_VOICE, config_file_path};
use crate::{Error, Result};

/// Capability check consulted before every session start
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    /// Whether a credential is available right now
    fn has_credential(&self) -> bool;

    /// Ask the user for a credential
    ///
    /// # Errors
    ///
    /// Returns error if the prompt fails or the credential cannot be stored
    async fn prompt(&self) -> Result<()>;

    /// The current credential
    fn credential(&self) -> Option<SecretString>;
}

/// Credential read from configuration, prompted for on a terminal when absent
#[derive(Debug, Clone)]
pub struct ConfigCredentials {
    key: Arc<RwLock<Option<SecretString>>>,
    config_path: Option<PathBuf>,
    interactive: bool,
}

impl ConfigCredentials {
    /// Wrap a configured credential; `config_path` receives prompted keys
    #[must_use]
    pub fn new(key: Option<SecretString>, config_path: Option<PathBuf>, interactive: bool) -> Self {
        Self {
            key: Arc::new(RwLock::new(key)),
            config_path,
            interactive,
        }
    }

    /// A view over the same credential that reports instead of prompting
    ///
    /// Used once something else owns the terminal.
    #[must_use]
    pub fn non_interactive(&self) -> Self {
        Self {
            key: self.key.clone(),
            config_path: self.config_path.clone(),
            interactive: false,
        }
    }

    fn store(&self, key: SecretString) {
        let mut slot = self
            .key
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        *slot = Some(key);
    }
}

#[async_trait]
impl CredentialProvider for ConfigCredentials {
    fn has_credential(&self) -> bool {
        self.credential().is_some()
    }

    async fn prompt(&self) -> Result<()> {
        if !self.interactive {
            return Err(Error::Config(
                "no API key configured (set GEMINI_API_KEY or run `neural-link setup`)".to_string(),
            ));
        }

        let path = self.config_path.clone();
        let key = tokio::task::spawn_blocking(move || prompt_and_persist(path))
            .await
            .map_err(|e| Error::Config(format!("credential prompt failed: {e}")))??;

        self.store(key);
        Ok(())
    }

    fn credential(&self) -> Option<SecretString> {
        self.key
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }
}

/// Ask for the key with hidden input and write it to the config file
fn prompt_and_persist(path: Option<PathBuf>) -> Result<SecretString> {
    let key: String = Password::new()
        .with_prompt("Gemini API key")
        .interact()
        .map_err(|e| Error::Config(e.to_string()))?;

    let key = key.trim().to_string();
    if key.is_empty() {
        return Err(Error::Config("empty API key".to_string()));
    }

    if let Some(path) = path {
        let mut file = load_config_from(&path);
        file.api_key = Some(key.clone());
        write_config_file(&path, &file)?;
        tracing::info!(path = %path.display(), "credential saved");
    }

    Ok(SecretString::from(key))
}

/// Run the interactive setup wizard
///
/// # Errors
///
/// Returns error if user input fails or config cannot be written
pub fn run_setup() -> anyhow::Result<()> {
    println!("Neural Link Setup\n");

    let config_path = config_file_path()
        .unwrap_or_else(|| PathBuf::from("~/.config/neural-link/config.toml"));
    let existing = load_config_from(&config_path);

    if config_path.exists() {
        println!("Existing config found at {}\n", config_path.display());
    }

    // 1. API key
    let masked = existing.api_key.as_deref().map(mask_key);
    let prompt = masked.as_ref().map_or_else(
        || "Gemini API key (GEMINI_API_KEY)".to_string(),
        |m| format!("Gemini API key (current: {m}, leave blank to keep)"),
    );

    let key_input = Password::new()
        .with_prompt(&prompt)
        .allow_empty_password(true)
        .interact()?;
    let api_key = if key_input.trim().is_empty() {
        existing.api_key.clone()
    } else {
        Some(key_input.trim().to_string())
    };

    // 2. Voice
    let default_voice = existing
        .live
        .voice
        .clone()
        .unwrap_or_else(|| DEFAULT_VOICE.to_string());
    let voice: String = Input::new()
        .with_prompt("Voice")
        .default(default_voice)
        .interact_text()?;

    // 3. Board
    let board_enabled = Confirm::new()
        .with_prompt("Serve the board page in the browser?")
        .default(existing.board.enabled.unwrap_or(true))
        .interact()?;

    let mut config_file: LinkConfigFile = existing;
    config_file.api_key = api_key;
    config_file.live.voice = Some(voice);
    config_file.board.enabled = Some(board_enabled);

    write_config_file(&config_path, &config_file)?;
    println!("\nConfig written to {}", config_path.display());
    println!("\nSetup complete! Run `neural-link -v` to start.");

    Ok(())
}

/// Show only the edges of a key
fn mask_key(key: &str) -> String {
    let chars: Vec<char> = key.chars().collect();
    if chars.len() > 8 {
        let head: String = chars[..4].iter().collect();
        let tail: String = chars[chars.len() - 4..].iter().collect();
        format!("{head}...{tail}")
    } else {
        "****".to_string()
    }
}
