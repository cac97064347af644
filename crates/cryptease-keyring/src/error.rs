use cryptease_envelope::EnvelopeError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, KeyringError>;

#[derive(Debug, Error)]
pub enum KeyringError {
    #[error(transparent)]
    Envelope(#[from] EnvelopeError),

    /// Decrypted bytes are not JSON; almost always a wrong passphrase.
    #[error("keyring did not decode as JSON (wrong passphrase?): {0}")]
    Json(#[from] serde_json::Error),

    #[error("key not found: {0}")]
    NotFound(String),

    #[error("value at {0} is not a string")]
    NotAString(String),
}
