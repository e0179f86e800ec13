//! Append-only commit journal.
//!
//! Every committed cache transaction is written as one frame:
//!
//! ```text
//! | magic (4) | version (2) | type (1) | length (4) | payload (N) | crc32 (4) |
//! ```
//!
//! The payload is the CBOR encoding of a [`CommitFrame`]. The CRC covers
//! header and payload.
//!
//! ## Recovery Policy
//!
//! - A truncated header or payload at the end of the journal is a commit
//!   that never finished; it is discarded and the file is cut back to the
//!   last complete frame.
//! - A checksum mismatch, bad magic or unknown frame type is corruption
//!   and fails the open.

use crate::backend::JournalBackend;
use crate::error::{CacheError, CacheResult};
use crate::feed::CommitOrigin;
use crate::model::{EntityRow, LocalRecord, RowId, SyncMetadata};
use cloudstore_codec::{from_cbor, to_cbor};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Magic bytes at the start of every frame.
pub const JOURNAL_MAGIC: [u8; 4] = *b"CSJL";

/// Current frame format version.
pub const JOURNAL_VERSION: u16 = 1;

const FRAME_TYPE_COMMIT: u8 = 1;
const HEADER_SIZE: usize = 11;
const CRC_SIZE: usize = 4;

/// A single change inside a commit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum JournalOp {
    /// Insert or replace a local record.
    PutRecord(LocalRecord),
    /// Remove a local record by name.
    RemoveRecord(String),
    /// Insert or replace an entity row.
    PutRow(EntityRow),
    /// Remove an entity row.
    RemoveRow(RowId),
    /// Replace the sync metadata.
    SetMetadata(SyncMetadata),
}

/// All changes of one committed transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommitFrame {
    /// Commit sequence number.
    pub sequence: u64,
    /// Who committed.
    pub origin: CommitOrigin,
    /// Changes in application order.
    pub ops: Vec<JournalOp>,
}

/// Writes and replays commit frames on a backend.
pub struct Journal {
    backend: Box<dyn JournalBackend>,
}

impl Journal {
    /// Opens a journal and returns every complete frame in it.
    ///
    /// A torn tail is cut off so later appends start on a frame boundary.
    pub fn open(mut backend: Box<dyn JournalBackend>) -> CacheResult<(Self, Vec<CommitFrame>)> {
        let bytes = backend.read_all()?;
        let (frames, valid_len) = decode_frames(&bytes)?;
        if valid_len < bytes.len() {
            warn!(
                discarded = bytes.len() - valid_len,
                "discarding incomplete journal tail"
            );
            backend.truncate(valid_len as u64)?;
        }
        Ok((Self { backend }, frames))
    }

    /// Appends a frame and syncs it.
    pub fn append(&mut self, frame: &CommitFrame) -> CacheResult<u64> {
        let data = encode_frame(frame)?;
        let offset = self.backend.append(&data)?;
        self.backend.sync()?;
        Ok(offset)
    }

    /// Returns the journal size in bytes.
    pub fn size(&self) -> CacheResult<u64> {
        self.backend.size()
    }
}

/// Encodes one frame with envelope and checksum.
pub fn encode_frame(frame: &CommitFrame) -> CacheResult<Vec<u8>> {
    let payload = to_cbor(frame)?;
    let len = u32::try_from(payload.len())
        .map_err(|_| CacheError::corrupted("journal frame payload too large"))?;

    let mut data = Vec::with_capacity(HEADER_SIZE + payload.len() + CRC_SIZE);
    data.extend_from_slice(&JOURNAL_MAGIC);
    data.extend_from_slice(&JOURNAL_VERSION.to_le_bytes());
    data.push(FRAME_TYPE_COMMIT);
    data.extend_from_slice(&len.to_le_bytes());
    data.extend_from_slice(&payload);

    let crc = compute_crc32(&data);
    data.extend_from_slice(&crc.to_le_bytes());
    Ok(data)
}

/// Decodes all complete frames; returns them and the length they cover.
pub fn decode_frames(bytes: &[u8]) -> CacheResult<(Vec<CommitFrame>, usize)> {
    let mut frames = Vec::new();
    let mut pos = 0usize;

    while bytes.len() - pos >= HEADER_SIZE {
        let header = &bytes[pos..pos + HEADER_SIZE];
        if header[0..4] != JOURNAL_MAGIC {
            return Err(CacheError::corrupted(format!("invalid magic at offset {pos}")));
        }
        let version = u16::from_le_bytes([header[4], header[5]]);
        if version > JOURNAL_VERSION {
            return Err(CacheError::corrupted(format!(
                "unsupported journal version {version} at offset {pos}"
            )));
        }
        if header[6] != FRAME_TYPE_COMMIT {
            return Err(CacheError::corrupted(format!(
                "unknown frame type {} at offset {pos}",
                header[6]
            )));
        }
        let payload_len =
            u32::from_le_bytes([header[7], header[8], header[9], header[10]]) as usize;
        let total = HEADER_SIZE + payload_len + CRC_SIZE;
        if bytes.len() - pos < total {
            break;
        }

        let payload_end = pos + HEADER_SIZE + payload_len;
        let stored = u32::from_le_bytes([
            bytes[payload_end],
            bytes[payload_end + 1],
            bytes[payload_end + 2],
            bytes[payload_end + 3],
        ]);
        let computed = compute_crc32(&bytes[pos..payload_end]);
        if stored != computed {
            return Err(CacheError::ChecksumMismatch {
                offset: pos as u64,
                expected: stored,
                actual: computed,
            });
        }

        frames.push(from_cbor(&bytes[pos + HEADER_SIZE..payload_end])?);
        pos += total;
    }

    Ok((frames, pos))
}

/// Computes the IEEE CRC32 of `data`.
pub fn compute_crc32(data: &[u8]) -> u32 {
    const CRC32_TABLE: [u32; 256] = {
        let mut table = [0u32; 256];
        let mut i = 0;
        while i < 256 {
            let mut crc = i as u32;
            let mut j = 0;
            while j < 8 {
                crc = if crc & 1 != 0 {
                    (crc >> 1) ^ 0xEDB8_8320
                } else {
                    crc >> 1
                };
                j += 1;
            }
            table[i] = crc;
            i += 1;
        }
        table
    };

    let mut crc = 0xFFFF_FFFF_u32;
    for &byte in data {
        crc = (crc >> 8) ^ CRC32_TABLE[((crc ^ u32::from(byte)) & 0xFF) as usize];
    }
    !crc
}
