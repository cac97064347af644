//! cryptease-keyring: study passphrases kept in an encrypted JSON document
//!
//! The keyring is an ordinary cryptease envelope (PBKDF2 passphrase key)
//! whose plaintext is a JSON object. Secrets are addressed by `/`-separated
//! paths into that object:
//!
//! ```text
//! {
//!   "kitchen": { "SECRETS": { "STUDY_A": "..." } },   // PHOENIX studies
//!   "beiwe":   { "SECRETS": { "STUDY_B": "..." } }
//! }
//! ```

pub mod error;
pub mod store;

pub use error::{KeyringError, Result};
pub use store::Keyring;

