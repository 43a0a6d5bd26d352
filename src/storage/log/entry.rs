use serde::{Deserialize, Serialize};

use crate::error::StorageError;
use crate::message::{self, LogEntry};
use crate::traits::StorageResult;

/// Location of a live entry inside the segment files.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct EntryMeta {
    pub index: u64,
    pub term: u64,
    pub segment: u64,
    /// Offset of the record header.
    pub offset: u64,
    pub size: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordType {
    Entry,
    TruncateAfter,
    PruneBefore,
    Reset,
}

impl RecordType {
    fn code(self) -> u32 {
        match self {
            RecordType::Entry => 1,
            RecordType::TruncateAfter => 2,
            RecordType::PruneBefore => 3,
            RecordType::Reset => 4,
        }
    }

    fn from_code(code: u32) -> Option<Self> {
        match code {
            1 => Some(RecordType::Entry),
            2 => Some(RecordType::TruncateAfter),
            3 => Some(RecordType::PruneBefore),
            4 => Some(RecordType::Reset),
            _ => None,
        }
    }
}

/// A record of the append-only segment files. Truncations and pruning are
/// logged as records of their own and replayed in order on startup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogRecord {
    Entry(LogEntry),
    TruncateAfter { index: u64 },
    PruneBefore { index: u64, prev_term: u64 },
    Reset { prev_index: u64, prev_term: u64 },
}

impl LogRecord {
    pub fn record_type(&self) -> RecordType {
        match self {
            LogRecord::Entry(_) => RecordType::Entry,
            LogRecord::TruncateAfter { .. } => RecordType::TruncateAfter,
            LogRecord::PruneBefore { .. } => RecordType::PruneBefore,
            LogRecord::Reset { .. } => RecordType::Reset,
        }
    }

    /// Header followed by the bincode payload.
    pub fn serialize(&self) -> StorageResult<Vec<u8>> {
        let payload = message::encode(self)?;
        let header = EntryHeader::new(payload.len() as u32, self.record_type(), crc32fast::hash(&payload));
        let mut buf = Vec::with_capacity(ENTRY_HEADER_SIZE as usize + payload.len());
        buf.extend_from_slice(&header.serialize());
        buf.extend_from_slice(&payload);
        Ok(buf)
    }

    pub fn deserialize(header: &EntryHeader, payload: &[u8]) -> StorageResult<Self> {
        if crc32fast::hash(payload) != header.crc {
            return Err(StorageError::Consistency("record checksum mismatch".into()));
        }
        let record: LogRecord = message::decode(payload)?;
        if record.record_type() != header.record_type {
            return Err(StorageError::Consistency("record type mismatch".into()));
        }
        Ok(record)
    }
}

pub const ENTRY_MAGIC_NUM: u32 = 0x_5241_4654;
pub const ENTRY_HEADER_SIZE: u32 = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryHeader {
    pub size: u32,
    pub record_type: RecordType,
    pub magic_num: u32,
    pub crc: u32,
}

impl EntryHeader {
    pub fn new(size: u32, record_type: RecordType, crc: u32) -> Self {
        Self {
            size,
            record_type,
            magic_num: ENTRY_MAGIC_NUM,
            crc,
        }
    }

    pub fn serialize(&self) -> [u8; ENTRY_HEADER_SIZE as usize] {
        let mut buf = [0u8; ENTRY_HEADER_SIZE as usize];
        buf[0..4].copy_from_slice(&self.size.to_le_bytes());
        buf[4..8].copy_from_slice(&self.record_type.code().to_le_bytes());
        buf[8..12].copy_from_slice(&self.magic_num.to_le_bytes());
        buf[12..16].copy_from_slice(&self.crc.to_le_bytes());
        buf
    }

    /// Returns `None` for anything that is not a well formed header, which
    /// replay treats as the end of the written data.
    pub fn deserialize(data: &[u8]) -> Option<Self> {
        if data.len() < ENTRY_HEADER_SIZE as usize {
            return None;
        }
        let word = |at: usize| u32::from_le_bytes([data[at], data[at + 1], data[at + 2], data[at + 3]]);
        let magic_num = word(8);
        if magic_num != ENTRY_MAGIC_NUM {
            return None;
        }
        Some(Self {
            size: word(0),
            record_type: RecordType::from_code(word(4))?,
            magic_num,
            crc: word(12),
        })
    }
}
