//! Newline framing for incoming bytes.
//!
//! A record is every byte up to and including a `\n`. Bytes without a
//! terminator stay buffered across reads until one arrives; they are
//! never handed to the log on their own.

use std::collections::TryReserveError;
use tracing::{error, trace};

const TERMINATOR: u8 = b'\n';

/// Failure to grow the in-flight record
#[derive(Debug)]
pub enum RecordError {
    /// The allocator refused the extra capacity.
    Reserve(TryReserveError),
    /// The record would exceed the buffer's length ceiling.
    TooLong { len: usize, max_len: usize },
}

impl std::fmt::Display for RecordError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RecordError::Reserve(e) => write!(f, "failed to grow record buffer: {}", e),
            RecordError::TooLong { len, max_len } => {
                write!(f, "record of {} bytes exceeds limit of {} bytes", len, max_len)
            }
        }
    }
}

impl std::error::Error for RecordError {}

/// Accumulates bytes of the record currently being received
#[derive(Debug)]
pub struct RecordBuffer {
    buf: Vec<u8>,
    max_len: usize,
}

impl Default for RecordBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordBuffer {
    pub fn new() -> Self {
        Self::with_max_len(isize::MAX as usize)
    }

    /// Buffer whose in-flight record may not grow past `max_len` bytes.
    /// Breaching the ceiling is handled exactly like an allocation failure.
    pub fn with_max_len(max_len: usize) -> Self {
        RecordBuffer {
            buf: Vec::new(),
            max_len,
        }
    }

    /// Bytes buffered for a record whose terminator has not arrived yet.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    /// Consume a chunk of received bytes.
    ///
    /// `on_record` is called once per completed record, terminator
    /// included, in arrival order. The buffer is empty again when it runs.
    ///
    /// If the in-flight record cannot grow, the whole record is dropped
    /// and whatever follows in the chunk starts a fresh record. Returns the
    /// number of records dropped this way.
    pub fn feed<F>(&mut self, mut chunk: &[u8], mut on_record: F) -> usize
    where
        F: FnMut(&[u8]),
    {
        let mut dropped = 0;

        while !chunk.is_empty() {
            let (segment, rest, complete) = match chunk.iter().position(|&b| b == TERMINATOR) {
                Some(pos) => (&chunk[..=pos], &chunk[pos + 1..], true),
                None => (chunk, &chunk[chunk.len()..], false),
            };
            chunk = rest;

            if let Err(e) = self.extend(segment) {
                error!(error = %e, discarded = self.buf.len() + segment.len(), "Dropping in-flight record");
                self.buf.clear();
                dropped += 1;
                continue;
            }

            if complete {
                trace!(bytes = self.buf.len(), "Record complete");
                on_record(&self.buf);
                self.buf.clear();
            }
        }

        dropped
    }

    fn extend(&mut self, bytes: &[u8]) -> Result<(), RecordError> {
        let len = self
            .buf
            .len()
            .checked_add(bytes.len())
            .filter(|&len| len <= self.max_len)
            .ok_or(RecordError::TooLong {
                len: self.buf.len().saturating_add(bytes.len()),
                max_len: self.max_len,
            })?;
        self.buf
            .try_reserve(len - self.buf.len())
            .map_err(RecordError::Reserve)?;
        self.buf.extend_from_slice(bytes);
        Ok(())
    }
}
