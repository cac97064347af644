//! Envelope header: self-describing metadata prepended to every ciphertext
//!
//! Wire format (all multi-byte integers unsigned little-endian):
//! ```text
//! [4 bytes: metadata length L][L bytes: metadata block][16 bytes: IV][ciphertext...]
//! ```
//!
//! Metadata block, version 1:
//! ```text
//! u8   version (= 1)
//! u16  cipher key size in bits
//! u8   n, n bytes: cipher mode tag ("CFB8")
//! u8   KeyOrigin discriminant
//!        0x01 pbkdf2: u8 n, n bytes hash tag; u32 iterations; u8 n (= 32), n bytes salt
//!        0x02 random: u8 n, n bytes source tag
//! u8   n (= 16), n bytes IV
//! ```
//! Every field is validated before use; trailing bytes are rejected.

use std::io::{Read, Seek, SeekFrom};

use crate::error::{EnvelopeError, Result};
use crate::keys::KeyOrigin;
use crate::{IV_SIZE, SALT_SIZE};

/// Size of the length prefix in bytes.
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Largest metadata block accepted when reading. Real headers are < 128 bytes.
pub const MAX_METADATA_LEN: u32 = 64 * 1024;

pub const METADATA_VERSION: u8 = 1;

pub const CIPHER_KEY_BITS: u16 = 256;
pub const CIPHER_MODE_CFB8: &str = "CFB8";

const TAG_PBKDF2: u8 = 0x01;
const TAG_RANDOM: u8 = 0x02;

/// Cipher choice recorded in the header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CipherParameters {
    pub key_size_bits: u16,
    pub mode: String,
}

impl Default for CipherParameters {
    /// AES-256 in 8-bit cipher feedback mode, the only supported cipher.
    fn default() -> Self {
        Self {
            key_size_bits: CIPHER_KEY_BITS,
            mode: CIPHER_MODE_CFB8.into(),
        }
    }
}

impl CipherParameters {
    pub fn is_supported(&self) -> bool {
        self.key_size_bits == CIPHER_KEY_BITS && self.mode == CIPHER_MODE_CFB8
    }
}

/// Parameters needed to rebuild the key and cipher for one envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvelopeHeader {
    pub cipher: CipherParameters,
    pub kdf: KeyOrigin,
    pub iv: [u8; IV_SIZE],
}

impl EnvelopeHeader {
    pub fn new(cipher: CipherParameters, kdf: KeyOrigin, iv: [u8; IV_SIZE]) -> Self {
        Self { cipher, kdf, iv }
    }

    /// Encode the metadata block (without the length prefix).
    pub fn encode_metadata(&self) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(96);
        out.push(METADATA_VERSION);
        out.extend_from_slice(&self.cipher.key_size_bits.to_le_bytes());
        put_short_bytes(&mut out, "cipher.mode", self.cipher.mode.as_bytes())?;

        match &self.kdf {
            KeyOrigin::Pbkdf2 {
                hash_algorithm,
                iterations,
                salt,
            } => {
                if salt.len() != SALT_SIZE {
                    return Err(EnvelopeError::format(format!(
                        "kdf.salt must be {SALT_SIZE} bytes, got {}",
                        salt.len()
                    )));
                }
                out.push(TAG_PBKDF2);
                put_short_bytes(&mut out, "kdf.hashAlgorithm", hash_algorithm.as_bytes())?;
                out.extend_from_slice(&iterations.to_le_bytes());
                put_short_bytes(&mut out, "kdf.salt", salt)?;
            }
            KeyOrigin::Random { source_tag } => {
                out.push(TAG_RANDOM);
                put_short_bytes(&mut out, "kdf.source", source_tag.as_bytes())?;
            }
        }

        put_short_bytes(&mut out, "iv", &self.iv)?;
        Ok(out)
    }

    /// Decode and validate a metadata block.
    pub fn decode_metadata(buf: &[u8]) -> Result<Self> {
        let mut r = FieldReader::new(buf);

        let version = r.u8("version")?;
        if version != METADATA_VERSION {
            return Err(EnvelopeError::format(format!(
                "unsupported metadata version {version}"
            )));
        }

        let key_size_bits = r.u16("cipher.bits")?;
        let mode = r.short_str("cipher.mode")?;

        let kdf = match r.u8("kdf.kind")? {
            TAG_PBKDF2 => {
                let hash_algorithm = r.short_str("kdf.hashAlgorithm")?;
                let iterations = r.u32("kdf.iterations")?;
                let salt = r.short_bytes("kdf.salt")?;
                if salt.len() != SALT_SIZE {
                    return Err(EnvelopeError::format(format!(
                        "kdf.salt must be {SALT_SIZE} bytes, got {}",
                        salt.len()
                    )));
                }
                KeyOrigin::Pbkdf2 {
                    hash_algorithm,
                    iterations,
                    salt: salt.to_vec(),
                }
            }
            TAG_RANDOM => KeyOrigin::Random {
                source_tag: r.short_str("kdf.source")?,
            },
            other => {
                return Err(EnvelopeError::format(format!(
                    "unknown kdf.kind tag 0x{other:02x}"
                )))
            }
        };

        let iv_bytes = r.short_bytes("iv")?;
        let iv: [u8; IV_SIZE] = iv_bytes.try_into().map_err(|_| {
            EnvelopeError::format(format!("iv must be {IV_SIZE} bytes, got {}", iv_bytes.len()))
        })?;

        if r.remaining() != 0 {
            return Err(EnvelopeError::format(format!(
                "{} trailing bytes after metadata",
                r.remaining()
            )));
        }

        Ok(Self {
            cipher: CipherParameters {
                key_size_bits,
                mode,
            },
            kdf,
            iv,
        })
    }

    /// `[4-byte LE length][metadata block]`
    pub fn serialize(&self) -> Result<Vec<u8>> {
        let metadata = self.encode_metadata()?;
        let len = u32::try_from(metadata.len())
            .ok()
            .filter(|&l| l <= MAX_METADATA_LEN)
            .ok_or_else(|| {
                EnvelopeError::format(format!("metadata block too large: {} bytes", metadata.len()))
            })?;

        let mut out = Vec::with_capacity(LENGTH_PREFIX_SIZE + metadata.len());
        out.extend_from_slice(&len.to_le_bytes());
        out.extend_from_slice(&metadata);
        Ok(out)
    }

    /// The two chunks that open every envelope, in wire order: the serialized
    /// header, then the raw IV.
    pub fn envelope_prefix(&self) -> Result<[Vec<u8>; 2]> {
        Ok([self.serialize()?, self.iv.to_vec()])
    }
}

/// Parse the header at the current position of `source`, then rewind the
/// cursor to where it started.
///
/// Returns the header and the payload offset (`4 + L`) relative to that
/// starting position. The IV occupies the 16 bytes at the payload offset and
/// ciphertext begins right after it.
///
/// Non-seekable sources (pipes, network streams) cannot be rewound; use
/// [`read_header_prefix`] there, or buffer / re-open the source.
pub fn read_header<R: Read + Seek>(source: &mut R) -> Result<(EnvelopeHeader, u64)> {
    let start = source.stream_position()?;
    let parsed = read_header_prefix(source);
    source.seek(SeekFrom::Start(start))?;
    parsed
}

/// Parse the header by consuming it from `source`, leaving the cursor at the
/// payload offset (the start of the IV).
pub fn read_header_prefix<R: Read>(source: &mut R) -> Result<(EnvelopeHeader, u64)> {
    let mut len_buf = [0u8; LENGTH_PREFIX_SIZE];
    read_exact_or_format(source, &mut len_buf, "length prefix")?;

    let len = u32::from_le_bytes(len_buf);
    if len > MAX_METADATA_LEN {
        return Err(EnvelopeError::format(format!(
            "metadata length {len} exceeds maximum {MAX_METADATA_LEN}"
        )));
    }

    let mut metadata = vec![0u8; len as usize];
    read_exact_or_format(source, &mut metadata, "metadata block")?;

    let header = EnvelopeHeader::decode_metadata(&metadata)?;
    tracing::debug!(
        metadata_len = len,
        kdf = header.kdf.kind(),
        mode = %header.cipher.mode,
        "envelope header parsed"
    );
    Ok((header, LENGTH_PREFIX_SIZE as u64 + u64::from(len)))
}

/// `read_exact`, reporting a short read as a truncated envelope.
pub(crate) fn read_exact_or_format<R: Read>(
    source: &mut R,
    buf: &mut [u8],
    what: &str,
) -> Result<()> {
    source.read_exact(buf).map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            EnvelopeError::format(format!("truncated envelope: {what} incomplete"))
        } else {
            EnvelopeError::Io(e)
        }
    })
}

fn put_short_bytes(out: &mut Vec<u8>, field: &str, bytes: &[u8]) -> Result<()> {
    let len = u8::try_from(bytes.len()).map_err(|_| {
        EnvelopeError::format(format!("{field} too long: {} bytes (max 255)", bytes.len()))
    })?;
    out.push(len);
    out.extend_from_slice(bytes);
    Ok(())
}

/// Bounds-checked little-endian cursor over a metadata block.
struct FieldReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> FieldReader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn take(&mut self, n: usize, field: &str) -> Result<&'a [u8]> {
        if self.remaining() < n {
            return Err(EnvelopeError::format(format!(
                "metadata truncated at {field}: need {n} bytes, have {}",
                self.remaining()
            )));
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn u8(&mut self, field: &str) -> Result<u8> {
        Ok(self.take(1, field)?[0])
    }

    fn u16(&mut self, field: &str) -> Result<u16> {
        let b = self.take(2, field)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn u32(&mut self, field: &str) -> Result<u32> {
        let b = self.take(4, field)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn short_bytes(&mut self, field: &str) -> Result<&'a [u8]> {
        let len = self.u8(field)? as usize;
        self.take(len, field)
    }

    fn short_str(&mut self, field: &str) -> Result<String> {
        let bytes = self.short_bytes(field)?;
        std::str::from_utf8(bytes)
            .map(str::to_owned)
            .map_err(|_| EnvelopeError::format(format!("{field} is not valid UTF-8")))
    }
}
