//! Fixed-size chunking of file contents.
//!
//! Files below the `min_chunkable` threshold are carried as one chunk (the
//! payload-per-object overhead isn't worth paying for small files), and
//! everything else is split at fixed `chunk_size` boundaries. Boundaries are
//! a pure function of the length tunables, so identical contents always
//! produce identical chunks (and therefore identical blob identifiers).
//!
//! A zero-length file yields no chunks at all: empty files become inodes
//! with an empty chunk list rather than a zero-length blob.

use std::io::{self, Read};

/// Lazy iterator of `(offset, bytes)` chunks over a reader of known length.
pub struct Chunks<R> {
    reader: R,
    total_len: u64,
    chunk_size: usize,
    offset: u64,
    done: bool,
}

/// Split `reader` (of known `total_len`) into deterministic chunks.
///
/// Offsets start at zero and are contiguous; every chunk is `chunk_size`
/// bytes except possibly the last. If `total_len < min_chunkable` the whole
/// content is one chunk.
pub fn chunks<R: Read>(reader: R, total_len: u64, chunk_size: u64, min_chunkable: u64) -> Chunks<R> {
    let effective = if total_len < min_chunkable {
        total_len.max(1)
    } else {
        chunk_size.max(1)
    };
    Chunks {
        reader,
        total_len,
        chunk_size: usize::try_from(effective).unwrap_or(usize::MAX),
        offset: 0,
        done: total_len == 0,
    }
}

impl<R: Read> Iterator for Chunks<R> {
    type Item = io::Result<(u64, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        let remaining = self.total_len - self.offset;
        let want = (remaining.min(self.chunk_size as u64)) as usize;
        let mut buf = vec![0u8; want];
        if let Err(e) = self.reader.read_exact(&mut buf) {
            self.done = true;
            return Some(Err(e));
        }

        let offset = self.offset;
        self.offset += want as u64;
        if self.offset == self.total_len {
            self.done = true;
        }
        Some(Ok((offset, buf)))
    }
}
