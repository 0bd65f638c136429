//! Bulk transfers: assemble data sets larger than one response by reading chunk after chunk.
//!
//! Every chunk response starts with a small sub-header reporting how many bytes
//! follow and whether the end of the data set was reached. The engine advances by
//! the reported size, never by the requested one.

use crate::transaction::{Controller, Request, RequestFlags, TransactionError, Transport};

/// One parsed chunk response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Chunk<'r> {
    /// Bytes of data in this chunk, as reported by the controller.
    pub size: u32,
    /// No further chunks follow.
    pub end: bool,
    /// Bytes after the sub-header.
    pub data: &'r [u8],
}

/// Malformed chunk response.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChunkError {
    #[error("chunk response of {len} bytes is shorter than its {needed} byte header")]
    Short { len: usize, needed: usize },
    #[error("chunk reports {reported} data bytes but carries only {available}")]
    SizeMismatch { reported: u32, available: usize },
}

/// A data set that can be read in chunks.
pub trait ChunkSource {
    /// Request for up to `len` bytes starting at `offset`.
    fn request(&self, offset: u32, len: u16) -> Request;

    /// Split a chunk response into sub-header fields and data.
    fn parse<'r>(&self, response: &'r [u8]) -> Result<Chunk<'r>, ChunkError>;
}

/// Block transfer sub-header (`<HIHB`, 9 bytes).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockChunk {
    /// Buffer or stream identifier.
    pub id: u16,
    pub offset: u32,
    /// Bytes requested (outgoing) or returned (incoming).
    pub size: u16,
    pub end: bool,
}

impl BlockChunk {
    pub const LEN: usize = 9;

    pub fn to_bytes(&self) -> [u8; Self::LEN] {
        let mut b = [0u8; Self::LEN];
        b[0..2].copy_from_slice(&self.id.to_le_bytes());
        b[2..6].copy_from_slice(&self.offset.to_le_bytes());
        b[6..8].copy_from_slice(&self.size.to_le_bytes());
        b[8] = u8::from(self.end);
        b
    }

    pub fn parse(b: &[u8]) -> Result<(Self, &[u8]), ChunkError> {
        if b.len() < Self::LEN {
            return Err(ChunkError::Short {
                len: b.len(),
                needed: Self::LEN,
            });
        }
        let chunk = Self {
            id: u16::from_le_bytes([b[0], b[1]]),
            offset: u32::from_le_bytes([b[2], b[3], b[4], b[5]]),
            size: u16::from_le_bytes([b[6], b[7]]),
            end: b[8] != 0,
        };
        Ok((chunk, &b[Self::LEN..]))
    }
}

/// Trace buffer of a controller subsystem, read with block transfers.
#[derive(Debug, Clone, Copy)]
pub struct TraceBuffer {
    pub instance_id: u8,
    pub buffer_id: u16,
}

impl TraceBuffer {
    pub const TARGET_CATEGORY: u8 = 0x0c;
    pub const TARGET_ID: u8 = 0x01;
    pub const COMMAND_ID: u8 = 0x0c;
    /// Chunk size the controller is known to serve.
    pub const DEFAULT_CHUNK_SIZE: u16 = 0x20;
}

impl ChunkSource for TraceBuffer {
    fn request(&self, offset: u32, len: u16) -> Request {
        let header = BlockChunk {
            id: self.buffer_id,
            offset,
            size: len,
            end: false,
        };
        Request::new(
            Self::TARGET_CATEGORY,
            Self::TARGET_ID,
            Self::COMMAND_ID,
            self.instance_id,
        )
        .with_flags(RequestFlags::HAS_RESPONSE)
        .with_payload(header.to_bytes())
    }

    fn parse<'r>(&self, response: &'r [u8]) -> Result<Chunk<'r>, ChunkError> {
        let (header, data) = BlockChunk::parse(response)?;
        Ok(Chunk {
            size: u32::from(header.size),
            end: header.end,
            data,
        })
    }
}

/// Bounds on retries and chunk count. Unbounded by default.
#[derive(Debug, Clone, Copy, Default)]
pub struct RetryPolicy {
    /// Timeouts tolerated in a row at one offset; `None` retries forever.
    pub max_timeout_retries: Option<u32>,
    /// Chunks read before giving up; `None` trusts the controller to set `end`.
    pub max_chunks: Option<usize>,
}

impl RetryPolicy {
    pub fn unbounded() -> Self {
        Self::default()
    }
}

/// Error aborting a bulk transfer. Partial data is discarded.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("transaction at offset {offset} failed: {source}")]
    Transaction {
        offset: u32,
        #[source]
        source: TransactionError,
    },
    #[error("no response for chunk at offset {offset}")]
    NoResponse { offset: u32 },
    #[error("bad chunk at offset {offset}: {source}")]
    Chunk {
        offset: u32,
        #[source]
        source: ChunkError,
    },
    #[error("chunk at offset {offset} timed out {attempts} time(s), giving up")]
    RetriesExhausted { offset: u32, attempts: u32 },
    #[error("no end of data after {chunks} chunk(s)")]
    ChunkLimit { chunks: usize },
    #[error("controller returned an empty non-final chunk at offset {offset}")]
    Stalled { offset: u32 },
    #[error("offset overflow after {offset} bytes")]
    OffsetOverflow { offset: u32 },
}

/// Progress of a bulk transfer.
#[derive(Debug, Default)]
pub struct TransferState {
    offset: u32,
    chunks: usize,
    done: bool,
    data: Vec<u8>,
}

impl TransferState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn offset(&self) -> u32 {
        self.offset
    }

    pub fn chunks(&self) -> usize {
        self.chunks
    }

    pub fn is_complete(&self) -> bool {
        self.done
    }

    /// Append one chunk and advance by its reported size.
    pub fn apply(&mut self, chunk: Chunk<'_>) -> Result<(), TransferError> {
        let size = chunk.size as usize;
        if chunk.data.len() < size {
            return Err(TransferError::Chunk {
                offset: self.offset,
                source: ChunkError::SizeMismatch {
                    reported: chunk.size,
                    available: chunk.data.len(),
                },
            });
        }
        if size == 0 && !chunk.end {
            return Err(TransferError::Stalled {
                offset: self.offset,
            });
        }
        if chunk.data.len() > size {
            log::debug!(
                "ignoring {} byte(s) past reported chunk size at offset {}",
                chunk.data.len() - size,
                self.offset
            );
        }
        self.data.extend_from_slice(&chunk.data[..size]);
        self.offset = self
            .offset
            .checked_add(chunk.size)
            .ok_or(TransferError::OffsetOverflow {
                offset: self.offset,
            })?;
        self.chunks += 1;
        self.done = chunk.end;
        Ok(())
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }
}

/// Read a complete data set from `source`, requesting `chunk_size` bytes at a time.
///
/// Timeout-class failures are retried at the same offset (bounded by `policy`);
/// any other failure aborts the transfer.
pub fn read_all<T, S>(
    ctrl: &mut Controller<T>,
    source: &S,
    chunk_size: u16,
    policy: &RetryPolicy,
) -> Result<Vec<u8>, TransferError>
where
    T: Transport,
    S: ChunkSource + ?Sized,
{
    let mut state = TransferState::new();
    let mut timeouts = 0u32;

    while !state.is_complete() {
        if policy.max_chunks.is_some_and(|max| state.chunks() >= max) {
            return Err(TransferError::ChunkLimit {
                chunks: state.chunks(),
            });
        }

        let offset = state.offset();
        log::debug!("reading {offset}:{chunk_size}");
        let response = match ctrl.request(&source.request(offset, chunk_size)) {
            Ok(Some(response)) => response,
            Ok(None) => return Err(TransferError::NoResponse { offset }),
            Err(e) if e.is_timeout() => {
                timeouts += 1;
                if policy.max_timeout_retries.is_some_and(|max| timeouts > max) {
                    return Err(TransferError::RetriesExhausted {
                        offset,
                        attempts: timeouts,
                    });
                }
                log::debug!("timeout at offset {offset}, retrying ({timeouts})");
                continue;
            }
            Err(e) => return Err(TransferError::Transaction { offset, source: e }),
        };
        timeouts = 0;

        let chunk = source
            .parse(&response)
            .map_err(|e| TransferError::Chunk { offset, source: e })?;
        log::debug!("read {offset}:{}{}", chunk.size, if chunk.end { " (end)" } else { "" });
        state.apply(chunk)?;
    }

    Ok(state.into_bytes())
}
