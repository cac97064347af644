//! Open, query and seal a keyring

use std::fs::File;
use std::io::{Cursor, Read, Seek};
use std::path::{Path, PathBuf};

use cryptease_core::expand_tilde;
use cryptease_envelope::{
    decrypt_stream, derive_key, encrypt_to_file, key_from_source, ChunkReader, EnvelopeError,
    DEFAULT_CHUNK_SIZE,
};
use secrecy::SecretString;
use serde_json::Value;

use crate::error::{KeyringError, Result};

/// A decrypted keyring document held in memory.
#[derive(Clone)]
pub struct Keyring {
    doc: Value,
    path: Option<PathBuf>,
}

impl Keyring {
    /// Decrypt the keyring at `path` (`~` is expanded) with `passphrase`.
    pub fn open(path: &Path, passphrase: &SecretString) -> Result<Self> {
        let path = expand_tilde(path);
        let file = File::open(&path).map_err(EnvelopeError::Io)?;
        let mut keyring = Self::from_reader(file, passphrase)?;
        tracing::debug!(path = %path.display(), "keyring opened");
        keyring.path = Some(path);
        Ok(keyring)
    }

    /// Decrypt a keyring envelope from any seekable source.
    ///
    /// The plaintext is streamed straight into the JSON parser.
    pub fn from_reader<R: Read + Seek>(mut source: R, passphrase: &SecretString) -> Result<Self> {
        let key = key_from_source(&mut source, passphrase)?;
        let stream = decrypt_stream(source, &key, DEFAULT_CHUNK_SIZE)?;
        let doc = serde_json::from_reader(ChunkReader::new(stream))?;
        Ok(Self { doc, path: None })
    }

    pub fn from_value(doc: Value) -> Self {
        Self { doc, path: None }
    }

    pub fn document(&self) -> &Value {
        &self.doc
    }

    /// Where this keyring was loaded from, if it came from disk.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Resolve a `/`-separated path to a string secret.
    ///
    /// Example: `kitchen/SECRETS/STUDY_A`
    pub fn lookup(&self, query: &str) -> Result<&str> {
        let segments: Vec<&str> = query.split('/').filter(|s| !s.is_empty()).collect();
        self.walk(&segments)
    }

    /// Passphrase for a PHOENIX study (`kitchen/SECRETS/<study>`).
    pub fn phoenix_study(&self, study: &str) -> Result<&str> {
        self.walk(&["kitchen", "SECRETS", study])
    }

    /// Passphrase for a Beiwe study (`beiwe/SECRETS/<study>`).
    pub fn beiwe_study(&self, study: &str) -> Result<&str> {
        self.walk(&["beiwe", "SECRETS", study])
    }

    fn walk(&self, segments: &[&str]) -> Result<&str> {
        let joined = || segments.join("/");
        if segments.is_empty() {
            return Err(KeyringError::NotFound(String::new()));
        }

        let mut node = &self.doc;
        for segment in segments {
            node = node
                .get(*segment)
                .ok_or_else(|| KeyringError::NotFound(joined()))?;
        }
        node.as_str().ok_or_else(|| KeyringError::NotAString(joined()))
    }

    /// Encrypt `doc` under a fresh passphrase key and atomically write it to `path`.
    pub fn seal(path: &Path, doc: &Value, passphrase: &SecretString) -> Result<u64> {
        let plaintext = serde_json::to_vec_pretty(doc)?;
        let key = derive_key(passphrase, None)?;
        let written = encrypt_to_file(path, Cursor::new(plaintext), &key, DEFAULT_CHUNK_SIZE)?;
        tracing::info!(path = %path.display(), "keyring sealed");
        Ok(written)
    }
}

impl std::fmt::Debug for Keyring {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Keyring")
            .field("doc", &"[REDACTED]")
            .field("path", &self.path)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> Value {
        json!({
            "kitchen": { "SECRETS": { "STUDY_A": "phoenix-pass", "nested": { "x": 1 } } },
            "beiwe": { "SECRETS": { "STUDY_B": "beiwe-pass" } }
        })
    }

    #[test]
    fn test_lookup_path() {
        let keyring = Keyring::from_value(sample());
        assert_eq!(keyring.lookup("kitchen/SECRETS/STUDY_A").unwrap(), "phoenix-pass");
        assert_eq!(keyring.lookup("/beiwe/SECRETS/STUDY_B").unwrap(), "beiwe-pass");
    }

    #[test]
    fn test_study_shortcuts() {
        let keyring = Keyring::from_value(sample());
        assert_eq!(keyring.phoenix_study("STUDY_A").unwrap(), "phoenix-pass");
        assert_eq!(keyring.beiwe_study("STUDY_B").unwrap(), "beiwe-pass");
    }

    #[test]
    fn test_missing_key() {
        let keyring = Keyring::from_value(sample());
        let err = keyring.phoenix_study("NOPE").unwrap_err();
        assert!(matches!(err, KeyringError::NotFound(ref p) if p == "kitchen/SECRETS/NOPE"));

        let err = keyring.lookup("").unwrap_err();
        assert!(matches!(err, KeyringError::NotFound(_)));
    }

    #[test]
    fn test_non_string_leaf() {
        let keyring = Keyring::from_value(sample());
        assert!(matches!(
            keyring.lookup("kitchen/SECRETS/nested").unwrap_err(),
            KeyringError::NotAString(_)
        ));
        assert!(matches!(
            keyring.lookup("kitchen/SECRETS/nested/x").unwrap_err(),
            KeyringError::NotAString(_)
        ));
    }

    #[test]
    fn test_seal_then_open() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keyring.enc");
        let passphrase = SecretString::from("keyring-pass");

        Keyring::seal(&path, &sample(), &passphrase).unwrap();
        let keyring = Keyring::open(&path, &passphrase).unwrap();

        assert_eq!(keyring.document(), &sample());
        assert_eq!(keyring.path(), Some(path.as_path()));
        assert_eq!(keyring.beiwe_study("STUDY_B").unwrap(), "beiwe-pass");
    }

    #[test]
    fn test_wrong_passphrase_is_json_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keyring.enc");
        Keyring::seal(&path, &sample(), &SecretString::from("right")).unwrap();

        let err = Keyring::open(&path, &SecretString::from("wrong")).unwrap_err();
        assert!(matches!(err, KeyringError::Json(_)), "got {err:?}");
    }

    #[test]
    fn test_open_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("absent.enc");
        let err = Keyring::open(&missing, &SecretString::from("x")).unwrap_err();
        assert!(matches!(err, KeyringError::Envelope(EnvelopeError::Io(_))));
    }
}
