//! Crash-safe persistence: write to a temp file beside the target, then rename

use std::io::{Read, Seek, Write};
use std::path::{Path, PathBuf};

use cryptease_core::expand_tilde;

use crate::error::{EnvelopeError, Result};
use crate::keys::Key;
use crate::stream::{decrypt_stream, encrypt_stream};

/// Temp-file prefix used while an encrypted file is being written.
pub const ENCRYPT_TEMP_PREFIX: &str = ".encrypt";

/// Temp-file prefix used while a decrypted file is being written.
pub const DECRYPT_TEMP_PREFIX: &str = ".decrypt";

const TEMP_SUFFIX: &str = ".tmp";

/// Write every chunk of `chunks` to `dest`, replacing any existing file atomically.
///
/// The temp file is created in the destination's own directory so the final
/// rename never crosses a filesystem. If the sequence or a write fails, the
/// temp file is removed and `dest` keeps its prior content (or stays absent).
///
/// Returns the number of bytes written.
pub fn write_atomically<I>(dest: &Path, chunks: I, temp_prefix: &str) -> Result<u64>
where
    I: IntoIterator<Item = Result<Vec<u8>>>,
{
    let dest = expand_tilde(dest);
    let dir = parent_dir(&dest);

    let mut tmp = tempfile::Builder::new()
        .prefix(temp_prefix)
        .suffix(TEMP_SUFFIX)
        .tempfile_in(&dir)?;
    tracing::debug!(tmp = %tmp.path().display(), "writing temp file");

    let mut written = 0u64;
    for chunk in chunks {
        let chunk = chunk?;
        tmp.write_all(&chunk)?;
        written += chunk.len() as u64;
    }
    tmp.as_file().sync_all()?;

    tmp.persist(&dest).map_err(|e| EnvelopeError::Io(e.error))?;
    tracing::info!(path = %dest.display(), bytes = written, "file persisted");
    Ok(written)
}

/// Encrypt `source` under `key` straight into `dest`.
pub fn encrypt_to_file<R: Read>(
    dest: &Path,
    source: R,
    key: &Key,
    chunk_size: usize,
) -> Result<u64> {
    let stream = encrypt_stream(source, key, chunk_size)?;
    write_atomically(dest, stream, ENCRYPT_TEMP_PREFIX)
}

/// Decrypt the envelope in `source` with `key` straight into `dest`.
pub fn decrypt_to_file<R: Read + Seek>(
    dest: &Path,
    source: R,
    key: &Key,
    chunk_size: usize,
) -> Result<u64> {
    let stream = decrypt_stream(source, key, chunk_size)?;
    write_atomically(dest, stream, DECRYPT_TEMP_PREFIX)
}

fn parent_dir(path: &Path) -> PathBuf {
    match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    }
}
