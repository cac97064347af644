//! cryptease-envelope: passphrase-based file encryption envelope
//!
//! Pipeline: passphrase → PBKDF2-HMAC-SHA256 (salt persisted) → AES-256-CFB8 keystream
//!
//! On-disk layout:
//! ```text
//! [u32 LE metadata length L][L bytes metadata][16-byte IV][ciphertext ...]
//! ```
//!
//! The metadata block records the key origin (PBKDF2 hash, iterations, salt,
//! or the tag of a random source) and cipher parameters, so anyone holding
//! the passphrase can rebuild the key from the file alone. There is no MAC:
//! the envelope gives confidentiality only, and tampering goes undetected.

pub mod atomic;
pub mod error;
pub mod header;
pub mod kdf;
pub mod keys;
pub mod reader;
pub mod stream;

pub use atomic::{decrypt_to_file, encrypt_to_file, write_atomically};
pub use error::{EnvelopeError, Result};
pub use header::{read_header, read_header_prefix, CipherParameters, EnvelopeHeader};
pub use kdf::{
    derive_key, derive_key_from_header, derive_key_with, key_from_source, salt_from_latin1,
    KdfParams,
};
pub use keys::{random_key, Key, KeyOrigin};
pub use reader::ChunkReader;
pub use stream::{
    decrypt_after_header, decrypt_stream, decrypt_unseekable, encrypt_stream, CipherStream,
    DecryptStream, EncryptStream, StreamState,
};

pub use cryptease_core::DEFAULT_CHUNK_SIZE;

/// Size of an AES-256 key in bytes
pub const KEY_SIZE: usize = 32;

/// Size of a PBKDF2 salt in bytes
pub const SALT_SIZE: usize = 32;

/// Size of the CFB8 initialization vector (one AES block)
pub const IV_SIZE: usize = 16;
