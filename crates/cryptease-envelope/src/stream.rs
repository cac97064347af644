//! Streaming AES-256-CFB8 encryption and decryption
//!
//! Both directions are pull-based: [`CipherStream`] is an iterator of byte
//! chunks and all work (reading the source, advancing the keystream) happens
//! inside `next()`. Memory use is bounded by the chunk size, never by the
//! input length.
//!
//! CFB8 feeds back one byte at a time, so chunk boundaries never change the
//! output: any chunk size >= 1 produces byte-identical ciphertext for the
//! same key and IV.
//!
//! Streams are single-pass. Once a chunk is yielded the source cursor and
//! cipher state have moved on; re-reading needs a fresh call on a re-opened
//! or re-seeked source.

use std::collections::VecDeque;
use std::io::{Read, Seek, SeekFrom};

use aes::Aes256;
use cfb8::cipher::generic_array::GenericArray;
use cfb8::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};

use crate::error::{EnvelopeError, Result};
use crate::header::{
    read_exact_or_format, read_header, read_header_prefix, CipherParameters, EnvelopeHeader,
};
use crate::keys::{fill_random, Key};
use crate::IV_SIZE;

type Aes256Cfb8Enc = cfb8::Encryptor<Aes256>;
type Aes256Cfb8Dec = cfb8::Decryptor<Aes256>;

/// Cap on the buffer reserved up front for one chunk; larger chunks grow on demand.
const INITIAL_CHUNK_CAPACITY: usize = 8 * 1024 * 1024;

/// Lifecycle of one stream operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// Constructed, nothing pulled yet (encryption).
    Init,
    /// Header and/or IV chunk handed to the consumer (encryption).
    HeaderEmitted,
    /// Header and IV read from the source (decryption).
    HeaderConsumed,
    /// At least one payload chunk produced.
    Streaming,
    /// Source exhausted or an error occurred; cipher state released.
    Finalized,
}

enum Keystream {
    Encrypt(Aes256Cfb8Enc),
    Decrypt(Aes256Cfb8Dec),
}

impl Keystream {
    fn apply(&mut self, buf: &mut [u8]) {
        match self {
            Keystream::Encrypt(c) => {
                for b in buf.chunks_exact_mut(1) {
                    c.encrypt_block_mut(GenericArray::from_mut_slice(b));
                }
            }
            Keystream::Decrypt(c) => {
                for b in buf.chunks_exact_mut(1) {
                    c.decrypt_block_mut(GenericArray::from_mut_slice(b));
                }
            }
        }
    }
}

/// Pull-based chunk producer shared by encryption and decryption.
pub struct CipherStream<R> {
    source: R,
    keystream: Option<Keystream>,
    prefix: VecDeque<Vec<u8>>,
    chunk_size: usize,
    state: StreamState,
    bytes_processed: u64,
}

/// Yields `[serialized header]`, `[IV]`, then ciphertext chunks.
pub type EncryptStream<R> = CipherStream<R>;

/// Yields plaintext chunks.
pub type DecryptStream<R> = CipherStream<R>;

impl<R: Read> CipherStream<R> {
    pub fn state(&self) -> StreamState {
        self.state
    }

    /// Payload bytes read from the source so far (excludes header and IV).
    pub fn bytes_processed(&self) -> u64 {
        self.bytes_processed
    }

    /// Hand back the underlying source, e.g. to close or re-seek it.
    pub fn into_inner(self) -> R {
        self.source
    }

    fn finalize(&mut self) {
        if self.state != StreamState::Finalized {
            self.keystream = None;
            self.state = StreamState::Finalized;
            tracing::debug!(bytes = self.bytes_processed, "cipher stream finalized");
        }
    }
}

impl<R: Read> Iterator for CipherStream<R> {
    type Item = Result<Vec<u8>>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(chunk) = self.prefix.pop_front() {
            self.state = StreamState::HeaderEmitted;
            return Some(Ok(chunk));
        }

        let keystream = self.keystream.as_mut()?;

        let mut buf = Vec::with_capacity(self.chunk_size.min(INITIAL_CHUNK_CAPACITY));
        let limit = self.chunk_size as u64;
        let read = self.source.by_ref().take(limit).read_to_end(&mut buf);
        match read {
            Ok(0) => {
                self.finalize();
                None
            }
            Ok(n) => {
                keystream.apply(&mut buf);
                self.bytes_processed += n as u64;
                self.state = StreamState::Streaming;
                Some(Ok(buf))
            }
            Err(e) => {
                self.finalize();
                Some(Err(EnvelopeError::Io(e)))
            }
        }
    }
}

/// Encrypt `source` under `key` with a fresh random IV.
///
/// The stream yields the header chunk, the IV chunk, then ciphertext chunks
/// of at most `chunk_size` bytes (a `chunk_size` of 0 is treated as 1).
pub fn encrypt_stream<R: Read>(
    source: R,
    key: &Key,
    chunk_size: usize,
) -> Result<EncryptStream<R>> {
    let mut iv = [0u8; IV_SIZE];
    fill_random(&mut iv)?;
    encrypt_stream_with_iv(source, key, iv, chunk_size)
}

pub(crate) fn encrypt_stream_with_iv<R: Read>(
    source: R,
    key: &Key,
    iv: [u8; IV_SIZE],
    chunk_size: usize,
) -> Result<EncryptStream<R>> {
    let header = EnvelopeHeader::new(CipherParameters::default(), key.origin().clone(), iv);
    let [head, iv_chunk] = header.envelope_prefix()?;
    tracing::debug!(
        kdf = key.origin().kind(),
        header_len = head.len(),
        "encrypt stream opened"
    );

    Ok(CipherStream {
        source,
        keystream: Some(Keystream::Encrypt(Aes256Cfb8Enc::new(
            key.as_bytes().into(),
            (&iv).into(),
        ))),
        prefix: VecDeque::from([head, iv_chunk]),
        chunk_size: chunk_size.max(1),
        state: StreamState::Init,
        bytes_processed: 0,
    })
}

/// Decrypt an envelope read from a seekable `source`.
///
/// The header is parsed from the current position, the cursor is moved to
/// the payload offset, and the IV is read before the first chunk is pulled.
pub fn decrypt_stream<R: Read + Seek>(
    mut source: R,
    key: &Key,
    chunk_size: usize,
) -> Result<DecryptStream<R>> {
    let start = source.stream_position()?;
    let (header, payload_offset) = read_header(&mut source)?;
    source.seek(SeekFrom::Start(start + payload_offset))?;
    decrypt_after_header(source, &header, key, chunk_size)
}

/// Decrypt an envelope from a source that cannot seek (pipe, socket).
///
/// The header is consumed in place; nothing is re-read.
pub fn decrypt_unseekable<R: Read>(
    mut source: R,
    key: &Key,
    chunk_size: usize,
) -> Result<DecryptStream<R>> {
    let (header, _) = read_header_prefix(&mut source)?;
    decrypt_after_header(source, &header, key, chunk_size)
}

/// Decrypt the payload of an envelope whose header was already parsed.
///
/// `source` must be positioned at the IV, as left by
/// [`read_header_prefix`]. Lets a caller derive the key from the header
/// before any ciphertext is read.
pub fn decrypt_after_header<R: Read>(
    mut source: R,
    header: &EnvelopeHeader,
    key: &Key,
    chunk_size: usize,
) -> Result<DecryptStream<R>> {
    if !header.cipher.is_supported() {
        return Err(EnvelopeError::Format(format!(
            "unsupported cipher: {}-bit {}",
            header.cipher.key_size_bits, header.cipher.mode
        )));
    }

    let mut iv = [0u8; IV_SIZE];
    read_exact_or_format(&mut source, &mut iv, "initialization vector")?;
    if iv != header.iv {
        return Err(EnvelopeError::Format(
            "initialization vector does not match header".into(),
        ));
    }

    Ok(CipherStream {
        source,
        keystream: Some(Keystream::Decrypt(Aes256Cfb8Dec::new(
            key.as_bytes().into(),
            (&iv).into(),
        ))),
        prefix: VecDeque::new(),
        chunk_size: chunk_size.max(1),
        state: StreamState::HeaderConsumed,
        bytes_processed: 0,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::{random_key, KeyOrigin};
    use std::io::Cursor;

    fn collect<I: Iterator<Item = Result<Vec<u8>>>>(stream: I) -> Vec<u8> {
        stream.collect::<Result<Vec<_>>>().unwrap().concat()
    }

    fn unhex(s: &str) -> Vec<u8> {
        (0..s.len())
            .step_by(2)
            .map(|i| u8::from_str_radix(&s[i..i + 2], 16).unwrap())
            .collect()
    }

    fn fixed_key() -> Key {
        Key::new([0x42; 32], KeyOrigin::Random {
            source_tag: "urandom".into(),
        })
    }

    #[test]
    fn test_hello_world_roundtrip() {
        let key = random_key().unwrap();
        let original = b"Hello, World!";

        let encrypted = collect(encrypt_stream(Cursor::new(original), &key, 100_000_000).unwrap());
        let decrypted = collect(decrypt_stream(Cursor::new(encrypted), &key, 100_000_000).unwrap());

        assert_eq!(decrypted, original);
    }

    #[test]
    fn test_empty_input_roundtrip() {
        let key = random_key().unwrap();

        let encrypted = collect(encrypt_stream(Cursor::new(Vec::new()), &key, 16).unwrap());
        let decrypted = collect(decrypt_stream(Cursor::new(encrypted), &key, 16).unwrap());

        assert!(decrypted.is_empty());
    }

    #[test]
    fn test_prefix_chunks_then_ciphertext() {
        let key = fixed_key();
        let iv = [9u8; IV_SIZE];
        let chunks: Vec<Vec<u8>> = encrypt_stream_with_iv(Cursor::new(vec![0u8; 10]), &key, iv, 4)
            .unwrap()
            .collect::<Result<_>>()
            .unwrap();

        let header = EnvelopeHeader::new(CipherParameters::default(), key.origin().clone(), iv);
        assert_eq!(chunks[0], header.serialize().unwrap());
        assert_eq!(chunks[1], iv.to_vec());
        let sizes: Vec<usize> = chunks[2..].iter().map(Vec::len).collect();
        assert_eq!(sizes, vec![4, 4, 2]);
    }

    #[test]
    fn test_nist_cfb8_aes256_vector() {
        // NIST SP 800-38A, F.3.11 CFB8-AES256.Encrypt
        let key_bytes: [u8; 32] =
            unhex("603deb1015ca71be2b73aef0857d77811f352c073b6108d72d9810a30914dff4")
                .try_into()
                .unwrap();
        let iv: [u8; IV_SIZE] = unhex("000102030405060708090a0b0c0d0e0f").try_into().unwrap();
        let plaintext = unhex("6bc1bee22e409f96e93d7e117393172aae2d");
        let expected = unhex("dc1f1a8520a64db55fcc8ac554844e889700");

        let key = Key::new(key_bytes, KeyOrigin::Random {
            source_tag: "test".into(),
        });
        let chunks: Vec<Vec<u8>> = encrypt_stream_with_iv(Cursor::new(plaintext), &key, iv, 5)
            .unwrap()
            .collect::<Result<_>>()
            .unwrap();

        assert_eq!(chunks[2..].concat(), expected);
    }

    #[test]
    fn test_chunk_size_invariance() {
        let key = fixed_key();
        let iv = [3u8; IV_SIZE];
        let data: Vec<u8> = (0..5000u32).map(|i| (i.wrapping_mul(31) >> 2) as u8).collect();

        let reference =
            collect(encrypt_stream_with_iv(Cursor::new(&data), &key, iv, 1_000_000).unwrap());
        for chunk_size in [1, 16, 17, 4096] {
            let out =
                collect(encrypt_stream_with_iv(Cursor::new(&data), &key, iv, chunk_size).unwrap());
            assert_eq!(out, reference, "chunk size {chunk_size} changed the ciphertext");
        }
    }

    #[test]
    fn test_decrypt_chunk_size_invariance() {
        let key = random_key().unwrap();
        let data: Vec<u8> = (0..3000u32).map(|i| i as u8).collect();
        let encrypted = collect(encrypt_stream(Cursor::new(&data), &key, 7).unwrap());

        for chunk_size in [1, 13, 1_000_000] {
            let out = collect(decrypt_stream(Cursor::new(&encrypted), &key, chunk_size).unwrap());
            assert_eq!(out, data);
        }
    }

    #[test]
    fn test_zero_chunk_size_treated_as_one() {
        let key = random_key().unwrap();
        let stream = encrypt_stream(Cursor::new(b"abc".to_vec()), &key, 0).unwrap();
        let chunks: Vec<Vec<u8>> = stream.collect::<Result<_>>().unwrap();
        assert_eq!(chunks.len(), 2 + 3);
    }

    #[test]
    fn test_fresh_iv_per_encryption() {
        let key = random_key().unwrap();
        let a = collect(encrypt_stream(Cursor::new(b"same".to_vec()), &key, 64).unwrap());
        let b = collect(encrypt_stream(Cursor::new(b"same".to_vec()), &key, 64).unwrap());
        assert_ne!(a, b, "identical plaintexts must not produce identical envelopes");
    }

    #[test]
    fn test_state_machine_encrypt() {
        let key = random_key().unwrap();
        let mut stream = encrypt_stream(Cursor::new(b"data".to_vec()), &key, 2).unwrap();
        assert_eq!(stream.state(), StreamState::Init);

        stream.next().unwrap().unwrap();
        assert_eq!(stream.state(), StreamState::HeaderEmitted);
        stream.next().unwrap().unwrap();
        assert_eq!(stream.state(), StreamState::HeaderEmitted);
        stream.next().unwrap().unwrap();
        assert_eq!(stream.state(), StreamState::Streaming);
        stream.next().unwrap().unwrap();
        assert!(stream.next().is_none());
        assert_eq!(stream.state(), StreamState::Finalized);
        assert_eq!(stream.bytes_processed(), 4);

        // Fused once finalized.
        assert!(stream.next().is_none());
    }

    #[test]
    fn test_state_machine_decrypt() {
        let key = random_key().unwrap();
        let encrypted = collect(encrypt_stream(Cursor::new(b"data".to_vec()), &key, 64).unwrap());

        let mut stream = decrypt_stream(Cursor::new(encrypted), &key, 64).unwrap();
        assert_eq!(stream.state(), StreamState::HeaderConsumed);
        assert_eq!(stream.next().unwrap().unwrap(), b"data");
        assert_eq!(stream.state(), StreamState::Streaming);
        assert!(stream.next().is_none());
        assert_eq!(stream.state(), StreamState::Finalized);
    }

    #[test]
    fn test_wrong_key_yields_garbage_not_error() {
        let key = random_key().unwrap();
        let other = random_key().unwrap();
        let original = b"confidential but not authenticated".to_vec();
        let encrypted = collect(encrypt_stream(Cursor::new(&original), &key, 64).unwrap());

        let decrypted = collect(decrypt_stream(Cursor::new(encrypted), &other, 64).unwrap());
        assert_eq!(decrypted.len(), original.len());
        assert_ne!(decrypted, original);
    }

    #[test]
    fn test_tampered_ciphertext_is_not_detected() {
        let key = random_key().unwrap();
        let original = vec![0x55u8; 64];
        let mut encrypted = collect(encrypt_stream(Cursor::new(&original), &key, 64).unwrap());

        let last = encrypted.len() - 1;
        encrypted[last] ^= 0x01;

        let decrypted = collect(decrypt_stream(Cursor::new(encrypted), &key, 64).unwrap());
        assert_eq!(&decrypted[..63], &original[..63]);
        assert_ne!(decrypted[63], original[63]);
    }

    #[test]
    fn test_decrypt_truncated_iv() {
        let key = random_key().unwrap();
        let encrypted = collect(encrypt_stream(Cursor::new(b"x".to_vec()), &key, 64).unwrap());
        let header_len = encrypted.len() - IV_SIZE - 1;

        let err = decrypt_stream(Cursor::new(&encrypted[..header_len + 8]), &key, 64)
            .err()
            .unwrap();
        assert!(matches!(err, EnvelopeError::Format(_)), "got {err:?}");
    }

    #[test]
    fn test_decrypt_iv_mismatch() {
        let key = random_key().unwrap();
        let mut encrypted =
            collect(encrypt_stream(Cursor::new(b"xyz".to_vec()), &key, 64).unwrap());
        let iv_pos = encrypted.len() - 3 - IV_SIZE;
        encrypted[iv_pos] ^= 0xFF;

        let err = decrypt_stream(Cursor::new(encrypted), &key, 64).err().unwrap();
        assert!(err.to_string().contains("initialization vector"));
    }

    #[test]
    fn test_decrypt_unsupported_cipher() {
        let key = fixed_key();
        let iv = [1u8; IV_SIZE];
        let header = EnvelopeHeader::new(
            CipherParameters {
                key_size_bits: 128,
                mode: "CFB8".into(),
            },
            key.origin().clone(),
            iv,
        );
        let mut bytes = header.serialize().unwrap();
        bytes.extend_from_slice(&iv);

        let err = decrypt_stream(Cursor::new(bytes), &key, 64).err().unwrap();
        assert!(err.to_string().contains("unsupported cipher"));
    }

    #[test]
    fn test_decrypt_from_nonzero_position() {
        let key = random_key().unwrap();
        let encrypted =
            collect(encrypt_stream(Cursor::new(b"payload".to_vec()), &key, 64).unwrap());
        let mut framed = b"junk-before-envelope".to_vec();
        let skip = framed.len() as u64;
        framed.extend_from_slice(&encrypted);

        let mut cursor = Cursor::new(framed);
        cursor.set_position(skip);
        let decrypted = collect(decrypt_stream(cursor, &key, 64).unwrap());
        assert_eq!(decrypted, b"payload");
    }

    #[test]
    fn test_decrypt_unseekable_matches_seekable() {
        let key = random_key().unwrap();
        let data: Vec<u8> = (0..1000u32).map(|i| (i % 251) as u8).collect();
        let encrypted = collect(encrypt_stream(Cursor::new(&data), &key, 100).unwrap());

        // A bare `&[u8]` implements Read but not Seek.
        let decrypted = collect(decrypt_unseekable(encrypted.as_slice(), &key, 33).unwrap());
        assert_eq!(decrypted, data);
    }

    #[test]
    fn test_source_error_finalizes_stream() {
        struct Failing;
        impl Read for Failing {
            fn read(&mut self, _buf: &mut [u8]) -> std::io::Result<usize> {
                Err(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "transport dropped"))
            }
        }

        let key = random_key().unwrap();
        let mut stream = encrypt_stream(Failing, &key, 64).unwrap();
        stream.next().unwrap().unwrap();
        stream.next().unwrap().unwrap();

        let err = stream.next().unwrap().unwrap_err();
        assert!(matches!(err, EnvelopeError::Io(_)));
        assert_eq!(stream.state(), StreamState::Finalized);
        assert!(stream.next().is_none());
    }
}
