//! Key derivation: PBKDF2-HMAC-SHA256 passphrase → 256-bit key

use std::io::{Read, Seek};

use hmac::Hmac;
use secrecy::{ExposeSecret, SecretString};
use sha2::Sha256;

use crate::error::{EnvelopeError, Result};
use crate::header::{read_header, EnvelopeHeader};
use crate::keys::{fill_random, Key, KeyOrigin};
use crate::{KEY_SIZE, SALT_SIZE};

/// Hash tag recorded in the header for PBKDF2-HMAC-SHA256.
pub const HASH_SHA256: &str = "sha256";

/// Iteration count used for every newly derived key.
pub const DEFAULT_ITERATIONS: u32 = 100_000;

/// Upper bound accepted when re-deriving from a header, so a corrupt or
/// hostile header cannot pin the CPU.
pub const MAX_ITERATIONS: u32 = 10_000_000;

/// PBKDF2 parameters
#[derive(Debug, Clone)]
pub struct KdfParams {
    pub iterations: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        Self {
            iterations: DEFAULT_ITERATIONS,
        }
    }
}

/// Derive a key from `passphrase` with the default 100,000 iterations.
///
/// When `salt` is `None` (or empty) a fresh 32-byte salt is drawn from the
/// OS. The same passphrase and salt always yield the same key bytes.
pub fn derive_key(passphrase: &SecretString, salt: Option<&[u8]>) -> Result<Key> {
    derive_key_with(passphrase, salt, &KdfParams::default())
}

/// Derive a key with explicit parameters.
pub fn derive_key_with(
    passphrase: &SecretString,
    salt: Option<&[u8]>,
    params: &KdfParams,
) -> Result<Key> {
    let salt = match salt {
        Some(s) if !s.is_empty() => s.to_vec(),
        _ => {
            let mut fresh = vec![0u8; SALT_SIZE];
            fill_random(&mut fresh)?;
            fresh
        }
    };
    if salt.len() != SALT_SIZE {
        return Err(EnvelopeError::KeyDerivation(format!(
            "salt must be {SALT_SIZE} bytes, got {}",
            salt.len()
        )));
    }
    if params.iterations == 0 {
        return Err(EnvelopeError::KeyDerivation(
            "iteration count must be at least 1".into(),
        ));
    }

    let mut bytes = [0u8; KEY_SIZE];
    pbkdf2::pbkdf2::<Hmac<Sha256>>(
        passphrase.expose_secret().as_bytes(),
        &salt,
        params.iterations,
        &mut bytes,
    )
    .map_err(|e| EnvelopeError::KeyDerivation(format!("PBKDF2 failed: {e}")))?;

    Ok(Key::new(
        bytes,
        KeyOrigin::Pbkdf2 {
            hash_algorithm: HASH_SHA256.into(),
            iterations: params.iterations,
            salt,
        },
    ))
}

/// Re-derive the key for an existing envelope from its header.
///
/// Fails with [`EnvelopeError::UnsupportedOrigin`] when the header records a
/// random key, and with [`EnvelopeError::Format`] when the recorded KDF
/// parameters are not ones this implementation can reproduce.
pub fn derive_key_from_header(header: &EnvelopeHeader, passphrase: &SecretString) -> Result<Key> {
    match &header.kdf {
        KeyOrigin::Random { source_tag } => Err(EnvelopeError::UnsupportedOrigin {
            source_tag: source_tag.clone(),
        }),
        KeyOrigin::Pbkdf2 {
            hash_algorithm,
            iterations,
            salt,
        } => {
            if hash_algorithm != HASH_SHA256 {
                return Err(EnvelopeError::format(format!(
                    "unsupported KDF hash algorithm \"{hash_algorithm}\""
                )));
            }
            if *iterations == 0 || *iterations > MAX_ITERATIONS {
                return Err(EnvelopeError::format(format!(
                    "KDF iteration count {iterations} outside 1..={MAX_ITERATIONS}"
                )));
            }
            derive_key_with(
                passphrase,
                Some(salt.as_slice()),
                &KdfParams {
                    iterations: *iterations,
                },
            )
        }
    }
}

/// Rebuild the key for the envelope at the current position of `source`.
///
/// The cursor is left where it was, so the same handle can be passed
/// straight to [`crate::decrypt_stream`].
pub fn key_from_source<R: Read + Seek>(source: &mut R, passphrase: &SecretString) -> Result<Key> {
    let (header, _) = read_header(source)?;
    derive_key_from_header(&header, passphrase)
}

/// Convert a legacy textual salt to bytes, one byte per code point (Latin-1).
pub fn salt_from_latin1(text: &str) -> Result<Vec<u8>> {
    text.chars()
        .map(|c| {
            u8::try_from(u32::from(c)).map_err(|_| {
                EnvelopeError::KeyDerivation(format!(
                    "salt character U+{:04X} is not representable in Latin-1",
                    u32::from(c)
                ))
            })
        })
        .collect()
}
