pub mod config;
pub mod error;
pub mod paths;

pub use config::{CrypteaseConfig, DEFAULT_CHUNK_SIZE};
pub use error::{CrypteaseError, CrypteaseResult};
pub use paths::expand_tilde;
