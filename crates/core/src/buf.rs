//! Byte-level reading for the object codec.
//!
//! Writers are plain `Vec<u8>`s; readers are a borrowing cursor. Decoding is
//! total: every failure mode maps to a [`DecodeError`] rather than a panic,
//! because decoded bytes come (via authenticated decryption) from storage.

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("unexpected end of input")]
    Eof,

    #[error("unknown frame type {0:#04x}")]
    UnknownFrame(u8),

    #[error("unknown column type {0:#04x}")]
    UnknownColumn(u8),

    #[error("varint is too wide for its type")]
    VarintOverflow,

    #[error("malformed payload: {0}")]
    Malformed(&'static str),
}

/// A borrowing read cursor over a decoded payload.
pub struct Reader<'a> {
    buf: &'a [u8],
}

impl<'a> Reader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn remaining(&self) -> usize {
        self.buf.len()
    }

    pub fn get_u8(&mut self) -> Result<u8, DecodeError> {
        let (&first, rest) = self.buf.split_first().ok_or(DecodeError::Eof)?;
        self.buf = rest;
        Ok(first)
    }

    pub fn get_slice(&mut self, len: usize) -> Result<&'a [u8], DecodeError> {
        if len > self.buf.len() {
            return Err(DecodeError::Eof);
        }
        let (head, rest) = self.buf.split_at(len);
        self.buf = rest;
        Ok(head)
    }
}
