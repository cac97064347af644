use thiserror::Error;

pub type CrypteaseResult<T> = Result<T, CrypteaseError>;

#[derive(Debug, Error)]
pub enum CrypteaseError {
    #[error("config error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
