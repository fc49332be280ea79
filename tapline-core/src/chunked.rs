//! Resumable decoder for HTTP/1.1 chunked transfer coding
//!
//! The decoder never buffers body data. It walks the framing one byte at a time
//! (payload runs are skipped in bulk), remembers where it stopped, and reports
//! when the terminating zero-size chunk and trailers have been seen. Input may be
//! split at arbitrary points; the final result does not depend on where.

use thiserror::Error;
use tracing::debug;

/// Parse state of a [`ChunkDecoder`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkState {
    /// Expecting the first hex digit of a chunk size
    ReadStartOfSize,
    /// Accumulating hex digits of the chunk size
    ReadingSize,
    /// Skipping a chunk extension up to CR
    ReadingChunkExtToCR,
    /// Expecting the LF that ends the chunk-size line
    ReadLFAfterChunkHeader,
    /// Consuming chunk payload
    ReadingBlock,
    /// Expecting the CR after chunk payload
    ReadCRAfterBlock,
    /// Expecting the LF after chunk payload
    ReadLFAfterBlock,
    /// At the start of a trailer line (or the final CRLF)
    ReadStartOfTrailer,
    /// Skipping a trailer line up to CR
    ReadToTrailerCR,
    /// Expecting the LF that ends a trailer line
    ReadTrailerLF,
    /// Expecting the LF of the final CRLF
    ReadFinalLF,
    /// The body ended exactly at the end of the input seen so far
    Completed,
    /// The body ended and more bytes followed; see [`ChunkDecoder::overage`]
    Overread,
    /// An unexpected byte was seen; terminal
    Malformed,
}

impl ChunkState {
    /// Returns true once the end of the chunked body has been found
    #[inline]
    pub fn is_finished(&self) -> bool {
        matches!(self, ChunkState::Completed | ChunkState::Overread)
    }

    /// Returns a string representation for logging
    pub fn as_str(&self) -> &'static str {
        match self {
            ChunkState::ReadStartOfSize => "read_start_of_size",
            ChunkState::ReadingSize => "reading_size",
            ChunkState::ReadingChunkExtToCR => "reading_chunk_ext",
            ChunkState::ReadLFAfterChunkHeader => "read_lf_after_chunk_header",
            ChunkState::ReadingBlock => "reading_block",
            ChunkState::ReadCRAfterBlock => "read_cr_after_block",
            ChunkState::ReadLFAfterBlock => "read_lf_after_block",
            ChunkState::ReadStartOfTrailer => "read_start_of_trailer",
            ChunkState::ReadToTrailerCR => "read_to_trailer_cr",
            ChunkState::ReadTrailerLF => "read_trailer_lf",
            ChunkState::ReadFinalLF => "read_final_lf",
            ChunkState::Completed => "completed",
            ChunkState::Overread => "overread",
            ChunkState::Malformed => "malformed",
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ChunkError {
    #[error("malformed chunked body at byte {offset}")]
    Malformed { offset: usize },
    #[error("chunked body ended before the terminating chunk")]
    Truncated,
}

/// Forward-only state machine over chunked framing (RFC 7230 section 4.1)
#[derive(Debug, Clone)]
pub struct ChunkDecoder {
    state: ChunkState,
    chunk_remaining: u64,
    entity_length: u64,
    overage: usize,
}

impl Default for ChunkDecoder {
    fn default() -> Self {
        Self::new()
    }
}

#[inline]
fn hex_value(byte: u8) -> Option<u64> {
    match byte {
        b'0'..=b'9' => Some((byte - b'0') as u64),
        b'a'..=b'f' => Some((byte - b'a' + 10) as u64),
        b'A'..=b'F' => Some((byte - b'A' + 10) as u64),
        _ => None,
    }
}

impl ChunkDecoder {
    pub fn new() -> Self {
        Self {
            state: ChunkState::ReadStartOfSize,
            chunk_remaining: 0,
            entity_length: 0,
            overage: 0,
        }
    }

    /// Current parse state
    #[inline]
    pub fn state(&self) -> ChunkState {
        self.state
    }

    /// Decoded payload bytes seen so far (excludes size lines, CRLFs, trailers)
    #[inline]
    pub fn entity_length(&self) -> u64 {
        self.entity_length
    }

    /// Trailing bytes of the last buffer that are not part of this body
    ///
    /// Only meaningful in [`ChunkState::Overread`].
    #[inline]
    pub fn overage(&self) -> usize {
        self.overage
    }

    /// Feeds a buffer and returns the state after it
    pub fn push_bytes(&mut self, buf: &[u8]) -> ChunkState {
        self.push_bytes_with(buf, |_| {})
    }

    /// Feeds a buffer, handing every run of payload bytes to `on_payload`
    pub fn push_bytes_with<F>(&mut self, buf: &[u8], mut on_payload: F) -> ChunkState
    where
        F: FnMut(&[u8]),
    {
        let mut pos = 0;

        while pos < buf.len() {
            let byte = buf[pos];

            match self.state {
                ChunkState::Malformed => return ChunkState::Malformed,

                ChunkState::Completed | ChunkState::Overread => {
                    self.state = ChunkState::Overread;
                    self.overage = buf.len() - pos;
                    return self.state;
                }

                ChunkState::ReadStartOfSize => match hex_value(byte) {
                    Some(digit) => {
                        self.chunk_remaining = digit;
                        self.state = ChunkState::ReadingSize;
                    }
                    None => return self.malformed(byte),
                },

                ChunkState::ReadingSize => match hex_value(byte) {
                    Some(digit) => {
                        match self
                            .chunk_remaining
                            .checked_mul(16)
                            .and_then(|v| v.checked_add(digit))
                        {
                            Some(size) => self.chunk_remaining = size,
                            None => return self.malformed(byte),
                        }
                    }
                    None => match byte {
                        b';' => self.state = ChunkState::ReadingChunkExtToCR,
                        b'\r' => self.state = ChunkState::ReadLFAfterChunkHeader,
                        _ => return self.malformed(byte),
                    },
                },

                ChunkState::ReadingChunkExtToCR => {
                    if byte == b'\r' {
                        self.state = ChunkState::ReadLFAfterChunkHeader;
                    }
                }

                ChunkState::ReadLFAfterChunkHeader => {
                    if byte != b'\n' {
                        return self.malformed(byte);
                    }
                    self.state = if self.chunk_remaining == 0 {
                        ChunkState::ReadStartOfTrailer
                    } else {
                        ChunkState::ReadingBlock
                    };
                }

                ChunkState::ReadingBlock => {
                    let available = (buf.len() - pos) as u64;
                    let take = available.min(self.chunk_remaining) as usize;
                    on_payload(&buf[pos..pos + take]);
                    self.chunk_remaining -= take as u64;
                    self.entity_length += take as u64;
                    if self.chunk_remaining == 0 {
                        self.state = ChunkState::ReadCRAfterBlock;
                    }
                    pos += take;
                    continue;
                }

                ChunkState::ReadCRAfterBlock => {
                    if byte != b'\r' {
                        return self.malformed(byte);
                    }
                    self.state = ChunkState::ReadLFAfterBlock;
                }

                ChunkState::ReadLFAfterBlock => {
                    if byte != b'\n' {
                        return self.malformed(byte);
                    }
                    self.state = ChunkState::ReadStartOfSize;
                }

                ChunkState::ReadStartOfTrailer => {
                    self.state = if byte == b'\r' {
                        ChunkState::ReadFinalLF
                    } else {
                        ChunkState::ReadToTrailerCR
                    };
                }

                // Trailer content is not validated
                ChunkState::ReadToTrailerCR => {
                    if byte == b'\r' {
                        self.state = ChunkState::ReadTrailerLF;
                    }
                }

                ChunkState::ReadTrailerLF => {
                    if byte != b'\n' {
                        return self.malformed(byte);
                    }
                    self.state = ChunkState::ReadStartOfTrailer;
                }

                ChunkState::ReadFinalLF => {
                    if byte != b'\n' {
                        return self.malformed(byte);
                    }
                    self.state = ChunkState::Completed;
                }
            }

            pos += 1;
        }

        self.state
    }

    fn malformed(&mut self, byte: u8) -> ChunkState {
        debug!(
            state = self.state.as_str(),
            byte = format_args!("{:02x}", byte),
            entity_length = self.entity_length,
            "Malformed chunked encoding"
        );
        self.state = ChunkState::Malformed;
        ChunkState::Malformed
    }
}

/// Returns true when `body` holds a complete chunked body (possibly followed by more bytes)
pub fn is_chunked_body_complete(body: &[u8]) -> bool {
    ChunkDecoder::new().push_bytes(body).is_finished()
}

/// Decodes a whole chunked body, returning the payload
///
/// Bytes after the terminating chunk are ignored.
pub fn dechunk(body: &[u8]) -> Result<Vec<u8>, ChunkError> {
    let mut decoder = ChunkDecoder::new();
    let mut payload = Vec::with_capacity(body.len());

    let state = decoder.push_bytes_with(body, |run| payload.extend_from_slice(run));
    match state {
        ChunkState::Completed | ChunkState::Overread => Ok(payload),
        ChunkState::Malformed => Err(ChunkError::Malformed {
            offset: malformed_offset(body),
        }),
        _ => Err(ChunkError::Truncated),
    }
}

/// Locates the byte that drove the decoder to `Malformed`
fn malformed_offset(body: &[u8]) -> usize {
    let mut decoder = ChunkDecoder::new();
    for (i, byte) in body.iter().enumerate() {
        if decoder.push_bytes(std::slice::from_ref(byte)) == ChunkState::Malformed {
            return i;
        }
    }
    body.len()
}
