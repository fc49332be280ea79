//! Growable read buffer for bodies of hinted but untrusted size
//!
//! Doubling growth over-allocates for large bodies and pushes medium ones past
//! the allocator's large-allocation threshold early. This buffer stays below
//! that threshold until the data actually needs more room, then grows by a
//! fixed increment over the required size.

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::debug;

/// Allocations at or above this size take the allocator's large-object path
pub const LARGE_ALLOCATION_THRESHOLD: usize = 128 * 1024;
/// Largest capacity chosen from a size hint while below the threshold
pub const SMALL_GROWTH_CEILING: usize = 64 * 1024;
/// Headroom added to the required size once above the threshold
pub const LARGE_GROWTH_INCREMENT: usize = 1024 * 1024;
/// Default maximum buffer length
pub const DEFAULT_MAX_LENGTH: usize = i32::MAX as usize;

const INITIAL_CAPACITY: usize = 4096;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BufferError {
    #[error("buffer would grow to {requested} bytes, limit is {limit}")]
    CapacityExceeded { requested: usize, limit: usize },
}

/// Append-only accumulation buffer
#[derive(Debug)]
pub struct GrowableReadBuffer {
    data: Vec<u8>,
    size_hint: Option<usize>,
    max_length: usize,
}

impl Default for GrowableReadBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl GrowableReadBuffer {
    pub fn new() -> Self {
        Self::with_limit(DEFAULT_MAX_LENGTH)
    }

    /// Creates a buffer that refuses to grow past `max_length` bytes
    pub fn with_limit(max_length: usize) -> Self {
        Self {
            data: Vec::new(),
            size_hint: None,
            max_length,
        }
    }

    /// Records the expected total size (e.g. from Content-Length)
    ///
    /// The hint only shapes growth below [`LARGE_ALLOCATION_THRESHOLD`]; writes
    /// are always checked against their actual size.
    pub fn set_size_hint(&mut self, hint: usize) {
        self.size_hint = Some(hint);
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.data.capacity()
    }

    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    /// Appends `bytes`, growing per the buffer's policy
    pub fn write(&mut self, bytes: &[u8]) -> Result<(), BufferError> {
        self.ensure_room(bytes.len())?;
        self.data.extend_from_slice(bytes);
        Ok(())
    }

    /// Reads once from `reader` into spare room, returning the byte count
    ///
    /// Returns `Ok(0)` on end of stream or when `max_read` is 0. A full buffer
    /// yields `CapacityExceeded` wrapped in `io::ErrorKind::OutOfMemory`.
    pub async fn fill_from<R>(&mut self, reader: &mut R, max_read: usize) -> std::io::Result<usize>
    where
        R: AsyncRead + Unpin,
    {
        if max_read == 0 {
            return Ok(0);
        }
        let want = max_read.min(self.max_length - self.data.len());
        if want == 0 {
            let err = BufferError::CapacityExceeded {
                requested: self.data.len().saturating_add(max_read),
                limit: self.max_length,
            };
            return Err(std::io::Error::new(std::io::ErrorKind::OutOfMemory, err));
        }

        self.ensure_room(want)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::OutOfMemory, e))?;

        let start = self.data.len();
        self.data.resize(start + want, 0);
        match reader.read(&mut self.data[start..]).await {
            Ok(n) => {
                self.data.truncate(start + n);
                Ok(n)
            }
            Err(e) => {
                self.data.truncate(start);
                Err(e)
            }
        }
    }

    /// Removes and returns everything from `at` onward
    ///
    /// Used to hand bytes belonging to the next message back to a pipe.
    pub fn split_off_tail(&mut self, at: usize) -> Vec<u8> {
        if at >= self.data.len() {
            return Vec::new();
        }
        self.data.split_off(at)
    }

    /// Empties the buffer, keeping its allocation
    pub fn clear(&mut self) {
        self.data.clear();
        self.size_hint = None;
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.data
    }

    fn ensure_room(&mut self, additional: usize) -> Result<(), BufferError> {
        let required = self
            .data
            .len()
            .checked_add(additional)
            .filter(|r| *r <= self.max_length)
            .ok_or(BufferError::CapacityExceeded {
                requested: self.data.len().saturating_add(additional),
                limit: self.max_length,
            })?;

        if required <= self.data.capacity() {
            return Ok(());
        }

        let target = self.next_capacity(required);
        debug!(
            len = self.data.len(),
            from = self.data.capacity(),
            to = target,
            "Growing read buffer"
        );
        self.data.reserve_exact(target - self.data.len());
        Ok(())
    }

    fn next_capacity(&self, required: usize) -> usize {
        let doubled = self
            .data
            .capacity()
            .max(INITIAL_CAPACITY / 2)
            .saturating_mul(2);

        let target = if required <= SMALL_GROWTH_CEILING {
            let preferred = match self.size_hint {
                Some(hint) if hint >= required => hint.min(SMALL_GROWTH_CEILING),
                _ => doubled.min(SMALL_GROWTH_CEILING),
            };
            preferred.max(required)
        } else if required < LARGE_ALLOCATION_THRESHOLD {
            // Past the ceiling: keep doubling, but stop just short of the threshold
            doubled.min(LARGE_ALLOCATION_THRESHOLD - 1).max(required)
        } else {
            required.saturating_add(LARGE_GROWTH_INCREMENT)
        };

        target.min(self.max_length)
    }
}
