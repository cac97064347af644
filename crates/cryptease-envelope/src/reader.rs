//! `Read` adapter over a chunk iterator

use std::io::{self, Read};

use crate::error::Result;

/// Presents a sequence of byte chunks as a contiguous [`Read`] stream.
///
/// Only one chunk is buffered at a time; bytes the caller did not ask for
/// are kept until the next `read`. Errors from the underlying sequence are
/// returned as `io::Error`; a fused stream such as [`crate::CipherStream`]
/// reads as EOF after that.
pub struct ChunkReader<I> {
    chunks: I,
    pending: Vec<u8>,
    pos: usize,
}

impl<I> ChunkReader<I>
where
    I: Iterator<Item = Result<Vec<u8>>>,
{
    pub fn new(chunks: I) -> Self {
        Self {
            chunks,
            pending: Vec::new(),
            pos: 0,
        }
    }

    pub fn into_inner(self) -> I {
        self.chunks
    }
}

impl<I> Read for ChunkReader<I>
where
    I: Iterator<Item = Result<Vec<u8>>>,
{
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }

        while self.pos >= self.pending.len() {
            match self.chunks.next() {
                None => return Ok(0),
                Some(Ok(chunk)) => {
                    self.pending = chunk;
                    self.pos = 0;
                }
                Some(Err(e)) => return Err(e.into()),
            }
        }

        let available = &self.pending[self.pos..];
        let n = available.len().min(buf.len());
        buf[..n].copy_from_slice(&available[..n]);
        self.pos += n;
        Ok(n)
    }
}
