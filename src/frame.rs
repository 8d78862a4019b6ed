//! Diff File Wire Format
//!
//! A diff file is a simple framed binary stream, not a structured container:
//!
//! ```text
//! ┌──────────────────────────────────┐
//! │ Header (16 bytes)                │
//! │ - magic: "CDIF" (4 bytes)        │
//! │ - version: u8                    │
//! │ - flags: u8                      │
//! │ - reserved: 2 bytes              │
//! │ - record_count: u64 LE           │
//! ├──────────────────────────────────┤
//! │ Record 0                         │
//! │ - tag: u8                        │
//! │ - data_length: u32 LE            │
//! │ - checksum: u32 LE (CRC32)       │
//! │ - data: bincode, [u8; length]    │
//! ├──────────────────────────────────┤
//! │ Record 1 ...                     │
//! └──────────────────────────────────┘
//! ```
//!
//! Records of unknown type never occur implicitly: each frame carries a
//! discriminator byte and decoding dispatches on it with a variant match.
//! The first record of a valid diff file is always the upper-bound
//! checkpoint; manifests follow, each ahead of its own mutations.

use crate::checkpoint::Checkpoint;
use crate::commitlog::{ManifestRecord, MutationRecord};

/// Diff file magic number
pub const DIFF_MAGIC: [u8; 4] = *b"CDIF";
/// Current diff format version
pub const DIFF_VERSION: u8 = 1;
/// Header size in bytes
pub const DIFF_HEADER_SIZE: usize = 16;
/// Frame overhead: tag(1) + data_length(4) + checksum(4) = 9 bytes
pub const FRAME_OVERHEAD: usize = 9;

const TAG_CHECKPOINT: u8 = 0;
const TAG_MANIFEST: u8 = 1;
const TAG_MUTATION: u8 = 2;

/// One record in a diff stream.
#[derive(Debug, Clone, PartialEq)]
pub enum DiffRecord {
    Checkpoint(Checkpoint),
    Manifest(ManifestRecord),
    Mutation(MutationRecord),
}

impl DiffRecord {
    fn tag(&self) -> u8 {
        match self {
            DiffRecord::Checkpoint(_) => TAG_CHECKPOINT,
            DiffRecord::Manifest(_) => TAG_MANIFEST,
            DiffRecord::Mutation(_) => TAG_MUTATION,
        }
    }

    fn payload(&self) -> Result<Vec<u8>, FrameError> {
        let result = match self {
            DiffRecord::Checkpoint(c) => bincode::serialize(c),
            DiffRecord::Manifest(m) => bincode::serialize(m),
            DiffRecord::Mutation(m) => bincode::serialize(m),
        };
        result.map_err(|e| FrameError::Encode(e.to_string()))
    }
}

/// Error type for diff framing
#[derive(Debug)]
pub enum FrameError {
    /// Data too short for the fixed header
    TooShort,
    /// Invalid magic bytes
    BadMagic([u8; 4]),
    /// Unsupported format version
    UnsupportedVersion(u8),
    /// A frame extends past the end of the data
    Truncated { offset: usize },
    /// CRC32 mismatch on a frame payload
    ChecksumMismatch { expected: u32, actual: u32 },
    /// Unknown discriminator byte
    UnknownTag(u8),
    /// Fewer records than the header promised
    MissingRecords { expected: u64, actual: u64 },
    /// bincode encode failure
    Encode(String),
    /// bincode decode failure
    Decode(String),
}

impl std::fmt::Display for FrameError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FrameError::TooShort => write!(f, "Diff data too short for header"),
            FrameError::BadMagic(magic) => write!(f, "Invalid diff magic: {:?}", magic),
            FrameError::UnsupportedVersion(v) => write!(f, "Unsupported diff version: {}", v),
            FrameError::Truncated { offset } => {
                write!(f, "Truncated frame at offset {}", offset)
            }
            FrameError::ChecksumMismatch { expected, actual } => write!(
                f,
                "Frame checksum mismatch: expected {:08x}, got {:08x}",
                expected, actual
            ),
            FrameError::UnknownTag(tag) => write!(f, "Unknown record tag: {}", tag),
            FrameError::MissingRecords { expected, actual } => write!(
                f,
                "Diff header promised {} records, found {}",
                expected, actual
            ),
            FrameError::Encode(msg) => write!(f, "Encode error: {}", msg),
            FrameError::Decode(msg) => write!(f, "Decode error: {}", msg),
        }
    }
}

impl std::error::Error for FrameError {}

/// Serializes diff records into a framed byte stream.
pub struct DiffWriter {
    buf: Vec<u8>,
    record_count: u64,
}

impl Default for DiffWriter {
    fn default() -> Self {
        Self::new()
    }
}

impl DiffWriter {
    /// Create a writer with a placeholder header; `finish` patches it.
    pub fn new() -> Self {
        let mut buf = Vec::with_capacity(DIFF_HEADER_SIZE);
        buf.extend_from_slice(&DIFF_MAGIC);
        buf.push(DIFF_VERSION);
        buf.push(0); // flags
        buf.extend_from_slice(&[0u8; 2]); // reserved
        buf.extend_from_slice(&0u64.to_le_bytes()); // record_count placeholder
        DiffWriter {
            buf,
            record_count: 0,
        }
    }

    /// Append one framed record.
    pub fn push(&mut self, record: &DiffRecord) -> Result<(), FrameError> {
        let payload = record.payload()?;
        let checksum = crc32fast::hash(&payload);

        self.buf.push(record.tag());
        self.buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        self.buf.extend_from_slice(&checksum.to_le_bytes());
        self.buf.extend_from_slice(&payload);

        self.record_count = self
            .record_count
            .checked_add(1)
            .expect("record count overflow is unreachable");
        Ok(())
    }

    pub fn record_count(&self) -> u64 {
        self.record_count
    }

    pub fn bytes_written(&self) -> usize {
        self.buf.len()
    }

    /// Patch the header and return the finished stream.
    pub fn finish(mut self) -> Vec<u8> {
        self.buf[8..16].copy_from_slice(&self.record_count.to_le_bytes());

        debug_assert!(
            self.buf.len() >= DIFF_HEADER_SIZE,
            "Postcondition: finished diff must include the header"
        );

        self.buf
    }
}

/// Decodes a framed diff stream.
pub struct DiffReader<'a> {
    data: &'a [u8],
    offset: usize,
    record_count: u64,
    records_read: u64,
}

impl<'a> DiffReader<'a> {
    /// Open a diff stream, validating the header.
    pub fn open(data: &'a [u8]) -> Result<Self, FrameError> {
        if data.len() < DIFF_HEADER_SIZE {
            return Err(FrameError::TooShort);
        }

        let magic: [u8; 4] = data[0..4]
            .try_into()
            .expect("slice of length 4 converts to [u8; 4]");
        if magic != DIFF_MAGIC {
            return Err(FrameError::BadMagic(magic));
        }

        let version = data[4];
        if version != DIFF_VERSION {
            return Err(FrameError::UnsupportedVersion(version));
        }

        let record_count = u64::from_le_bytes(
            data[8..16]
                .try_into()
                .expect("slice of length 8 converts to [u8; 8]"),
        );

        Ok(DiffReader {
            data,
            offset: DIFF_HEADER_SIZE,
            record_count,
            records_read: 0,
        })
    }

    /// Records the header promised.
    pub fn record_count(&self) -> u64 {
        self.record_count
    }

    /// Decode the next record, or `None` at a clean end of stream.
    ///
    /// Unlike crash-tolerant log readers, a diff blob was written in one
    /// piece: truncation or corruption mid-stream is an error, not an
    /// end-of-data signal.
    pub fn next_record(&mut self) -> Result<Option<DiffRecord>, FrameError> {
        if self.offset == self.data.len() {
            if self.records_read != self.record_count {
                return Err(FrameError::MissingRecords {
                    expected: self.record_count,
                    actual: self.records_read,
                });
            }
            return Ok(None);
        }

        let remaining = &self.data[self.offset..];
        if remaining.len() < FRAME_OVERHEAD {
            return Err(FrameError::Truncated {
                offset: self.offset,
            });
        }

        let tag = remaining[0];
        let data_len = u32::from_le_bytes([remaining[1], remaining[2], remaining[3], remaining[4]])
            as usize;
        let checksum = u32::from_le_bytes([remaining[5], remaining[6], remaining[7], remaining[8]]);

        let frame_len = FRAME_OVERHEAD
            .checked_add(data_len)
            .ok_or(FrameError::Truncated {
                offset: self.offset,
            })?;
        if remaining.len() < frame_len {
            return Err(FrameError::Truncated {
                offset: self.offset,
            });
        }

        let payload = &remaining[FRAME_OVERHEAD..frame_len];
        let actual = crc32fast::hash(payload);
        if actual != checksum {
            return Err(FrameError::ChecksumMismatch {
                expected: checksum,
                actual,
            });
        }

        let record = match tag {
            TAG_CHECKPOINT => DiffRecord::Checkpoint(
                bincode::deserialize(payload).map_err(|e| FrameError::Decode(e.to_string()))?,
            ),
            TAG_MANIFEST => DiffRecord::Manifest(
                bincode::deserialize(payload).map_err(|e| FrameError::Decode(e.to_string()))?,
            ),
            TAG_MUTATION => DiffRecord::Mutation(
                bincode::deserialize(payload).map_err(|e| FrameError::Decode(e.to_string()))?,
            ),
            other => return Err(FrameError::UnknownTag(other)),
        };

        self.offset += frame_len;
        self.records_read += 1;
        Ok(Some(record))
    }
}
