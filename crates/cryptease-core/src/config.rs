use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{CrypteaseError, CrypteaseResult};
use crate::paths::{expand_tilde, home_dir};

/// Default upper bound on a single streamed chunk (100 MB).
pub const DEFAULT_CHUNK_SIZE: usize = 100_000_000;

/// Top-level configuration (loaded from config.toml)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CrypteaseConfig {
    pub envelope: EnvelopeConfig,
    pub passphrase: PassphraseConfig,
    pub keyring: KeyringConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EnvelopeConfig {
    /// Maximum bytes read from the source per chunk (default: 100 MB)
    pub chunk_size: usize,
    /// Temp-file prefix used while writing encrypted output
    pub temp_prefix_encrypt: String,
    /// Temp-file prefix used while writing decrypted output
    pub temp_prefix_decrypt: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PassphraseConfig {
    /// Environment variable consulted before prompting
    pub env_var: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KeyringConfig {
    /// Encrypted JSON keyring file (default: ~/.nrg-keyring.enc)
    pub path: PathBuf,
    /// Environment variable holding the keyring passphrase
    pub passphrase_env: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (default: info)
    pub level: String,
    /// Log format: "json" or "text"
    pub format: String,
}

impl Default for EnvelopeConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            temp_prefix_encrypt: ".encrypt".into(),
            temp_prefix_decrypt: ".decrypt".into(),
        }
    }
}

impl Default for PassphraseConfig {
    fn default() -> Self {
        Self {
            env_var: "ENCRYPT_PASS".into(),
        }
    }
}

impl Default for KeyringConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("~/.nrg-keyring.enc"),
            passphrase_env: "NRG_KEYRING_PASS".into(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: "text".into(),
        }
    }
}

impl CrypteaseConfig {
    /// Parse and validate a TOML document.
    pub fn from_toml(content: &str) -> CrypteaseResult<Self> {
        let config: Self =
            toml::from_str(content).map_err(|e| CrypteaseError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from `path`, falling back to defaults when the file does not exist.
    pub fn load(path: &Path) -> CrypteaseResult<Self> {
        let path = expand_tilde(path);
        if !path.exists() {
            tracing::debug!("config file not found: {} (using defaults)", path.display());
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(&path)?;
        Self::from_toml(&content).map_err(|e| match e {
            CrypteaseError::Config(msg) => {
                CrypteaseError::Config(format!("{}: {msg}", path.display()))
            }
            other => other,
        })
    }

    pub fn validate(&self) -> CrypteaseResult<()> {
        if self.envelope.chunk_size == 0 {
            return Err(CrypteaseError::Config(
                "envelope.chunk_size must be at least 1".into(),
            ));
        }
        match self.logging.format.as_str() {
            "json" | "text" => Ok(()),
            other => Err(CrypteaseError::Config(format!(
                "logging.format must be \"json\" or \"text\", got \"{other}\""
            ))),
        }
    }

    /// Keyring path with home-directory shorthand expanded.
    pub fn keyring_path(&self) -> PathBuf {
        expand_tilde(&self.keyring.path)
    }
}

/// Default location of the configuration file.
pub fn default_config_path() -> PathBuf {
    home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config/cryptease/config.toml")
}
