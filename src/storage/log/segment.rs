use std::{
    fs::{self, File, OpenOptions},
    io::Write,
    os::unix::fs::FileExt,
    path::{Path, PathBuf},
};

use tracing::warn;

use crate::traits::StorageResult;

use super::entry::{ENTRY_HEADER_SIZE, EntryHeader, LogRecord};

// Segment file format:
// | EntryHeader | payload | EntryHeader | payload | ...
// A segment is only ever appended to; the store rotates to a new file once
// `max_segment_size` is reached.

const SEGMENT_PREFIX: &str = "segment-";
const SEGMENT_SUFFIX: &str = ".log";

pub struct LogSegment {
    pub(crate) seq: u64,
    pub(crate) path: PathBuf,
    file: File,
    size: u64,
}

impl LogSegment {
    pub fn file_name(seq: u64) -> String {
        format!("{}{:010}{}", SEGMENT_PREFIX, seq, SEGMENT_SUFFIX)
    }

    pub fn parse_seq(name: &str) -> Option<u64> {
        name.strip_prefix(SEGMENT_PREFIX)?
            .strip_suffix(SEGMENT_SUFFIX)?
            .parse()
            .ok()
    }

    pub fn create(dir: &Path, seq: u64) -> StorageResult<Self> {
        let path = dir.join(Self::file_name(seq));
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&path)?;
        let size = file.metadata()?.len();
        Ok(Self {
            seq,
            path,
            file,
            size,
        })
    }

    /// Opens an existing segment and returns every intact record with its
    /// offset. A torn or corrupt tail is cut off.
    pub fn open(dir: &Path, seq: u64) -> StorageResult<(Self, Vec<(u64, u32, LogRecord)>)> {
        let path = dir.join(Self::file_name(seq));
        let bytes = fs::read(&path)?;
        let mut records = Vec::new();
        let mut offset = 0usize;
        while offset < bytes.len() {
            let Some(header) = EntryHeader::deserialize(&bytes[offset..]) else {
                break;
            };
            let start = offset + ENTRY_HEADER_SIZE as usize;
            let end = start + header.size as usize;
            if end > bytes.len() {
                break;
            }
            match LogRecord::deserialize(&header, &bytes[start..end]) {
                Ok(record) => records.push((offset as u64, header.size, record)),
                Err(e) => {
                    warn!("Segment {} offset {}: {}", seq, offset, e);
                    break;
                }
            }
            offset = end;
        }

        let mut segment = Self::create(dir, seq)?;
        if offset < bytes.len() {
            warn!(
                "Segment {} has {} trailing bytes that do not form a record, cutting them off",
                seq,
                bytes.len() - offset
            );
            segment.file.set_len(offset as u64)?;
            segment.file.sync_all()?;
            segment.size = offset as u64;
        }
        Ok((segment, records))
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// Appends serialized records and returns the offset they start at.
    pub fn append(&mut self, buf: &[u8]) -> StorageResult<u64> {
        let offset = self.size;
        self.file.write_all(buf).map_err(|e| {
            warn!("Failed to write to log segment {}: {}", self.seq, e);
            e
        })?;
        self.size += buf.len() as u64;
        Ok(offset)
    }

    pub fn sync_data(&self) -> StorageResult<()> {
        self.file.sync_data().map_err(|e| {
            warn!("Failed to sync log segment {}: {}", self.seq, e);
            e.into()
        })
    }

    pub fn read_record(&self, offset: u64, size: u32) -> StorageResult<LogRecord> {
        let mut buf = vec![0u8; ENTRY_HEADER_SIZE as usize + size as usize];
        self.file.read_exact_at(&mut buf, offset)?;
        let header = EntryHeader::deserialize(&buf).ok_or(crate::error::StorageError::DataCorruption {
            segment: self.seq,
            offset,
        })?;
        LogRecord::deserialize(&header, &buf[ENTRY_HEADER_SIZE as usize..])
    }
}
