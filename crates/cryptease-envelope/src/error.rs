use thiserror::Error;

pub type Result<T> = std::result::Result<T, EnvelopeError>;

#[derive(Debug, Error)]
pub enum EnvelopeError {
    /// Malformed or truncated header, unreasonable length field, or unknown metadata shape.
    #[error("malformed envelope: {0}")]
    Format(String),

    /// Entropy source or hashing primitive failure.
    #[error("key derivation failed: {0}")]
    KeyDerivation(String),

    /// The header records a random key, so there is no salt to re-derive from.
    #[error(
        "file was encrypted with a random key (source: {source_tag}) \
         and cannot be decrypted by passphrase"
    )]
    UnsupportedOrigin { source_tag: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl EnvelopeError {
    pub(crate) fn format(msg: impl Into<String>) -> Self {
        Self::Format(msg.into())
    }
}

impl From<EnvelopeError> for std::io::Error {
    fn from(err: EnvelopeError) -> Self {
        match err {
            EnvelopeError::Io(e) => e,
            other => std::io::Error::new(std::io::ErrorKind::InvalidData, other),
        }
    }
}
