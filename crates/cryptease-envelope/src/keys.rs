//! Symmetric keys and the metadata recording where they came from

use rand::rngs::OsRng;
use rand::RngCore;
use zeroize::Zeroize;

use crate::error::{EnvelopeError, Result};
use crate::KEY_SIZE;

/// Source tag recorded for keys drawn straight from the OS entropy pool.
pub const RANDOM_SOURCE_TAG: &str = "urandom";

/// How a [`Key`] was produced. Persisted in the envelope header in place of
/// the key itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyOrigin {
    /// Generated without a passphrase; must be shared out of band.
    Random { source_tag: String },
    /// Derived from a passphrase with PBKDF2-HMAC.
    Pbkdf2 {
        hash_algorithm: String,
        iterations: u32,
        salt: Vec<u8>,
    },
}

impl KeyOrigin {
    /// The `kdf.kind` discriminant: `"pbkdf2"` or `"random"`.
    pub fn kind(&self) -> &'static str {
        match self {
            KeyOrigin::Random { .. } => "random",
            KeyOrigin::Pbkdf2 { .. } => "pbkdf2",
        }
    }

    pub fn salt(&self) -> Option<&[u8]> {
        match self {
            KeyOrigin::Pbkdf2 { salt, .. } => Some(salt),
            KeyOrigin::Random { .. } => None,
        }
    }
}

/// A 256-bit symmetric key plus its origin. Zeroized on drop.
#[derive(Clone)]
pub struct Key {
    bytes: [u8; KEY_SIZE],
    origin: KeyOrigin,
}

impl Key {
    pub fn new(bytes: [u8; KEY_SIZE], origin: KeyOrigin) -> Self {
        Self { bytes, origin }
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.bytes
    }

    pub fn origin(&self) -> &KeyOrigin {
        &self.origin
    }
}

impl Drop for Key {
    fn drop(&mut self) {
        self.bytes.zeroize();
    }
}

impl std::fmt::Debug for Key {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Key")
            .field("bytes", &"[REDACTED]")
            .field("origin", &self.origin)
            .finish()
    }
}

/// Generate a random 256-bit key. It cannot be reconstructed from a
/// passphrase, so the caller must retain the bytes.
pub fn random_key() -> Result<Key> {
    let mut bytes = [0u8; KEY_SIZE];
    fill_random(&mut bytes)?;
    Ok(Key::new(
        bytes,
        KeyOrigin::Random {
            source_tag: RANDOM_SOURCE_TAG.into(),
        },
    ))
}

/// Fill `buf` from the OS CSPRNG. Entropy failure is surfaced, never papered over.
pub(crate) fn fill_random(buf: &mut [u8]) -> Result<()> {
    OsRng
        .try_fill_bytes(buf)
        .map_err(|e| EnvelopeError::KeyDerivation(format!("OS entropy source failed: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_random_key_generation() {
        let k1 = random_key().unwrap();
        let k2 = random_key().unwrap();
        assert_ne!(k1.as_bytes(), k2.as_bytes(), "random keys must differ");
    }

    #[test]
    fn test_random_key_origin() {
        let key = random_key().unwrap();
        assert_eq!(key.origin().kind(), "random");
        assert_eq!(key.origin().salt(), None);
        assert_eq!(
            key.origin(),
            &KeyOrigin::Random {
                source_tag: "urandom".into()
            }
        );
    }

    #[test]
    fn test_debug_redacts_key_bytes() {
        let key = Key::new([0x5Au8; KEY_SIZE], KeyOrigin::Random {
            source_tag: "test".into(),
        });
        let rendered = format!("{key:?}");
        assert!(rendered.contains("[REDACTED]"));
        assert!(!rendered.contains("90"), "raw byte values must not leak: {rendered}");
    }
}
