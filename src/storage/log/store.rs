use std::{
    collections::{BTreeMap, VecDeque},
    fs,
    path::PathBuf,
};

use tracing::{debug, info, warn};

use crate::error::StorageError;
use crate::message::LogEntry;
use crate::storage::LogWatermarks;
use crate::traits::{LogStorage, StorageResult};

use super::entry::{EntryMeta, LogRecord};
use super::segment::LogSegment;

#[derive(Debug, Clone)]
pub struct SegmentedLogOptions {
    pub dir: PathBuf,
    pub max_segment_size: u64,
    pub sync_on_write: bool,
}

impl SegmentedLogOptions {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            max_segment_size: 16 * 1024 * 1024,
            sync_on_write: true,
        }
    }
}

/// Append-only log split over numbered segment files.
///
/// The live index (`metas`) is rebuilt on open by replaying every record in
/// segment order. `metas[0]` is always the entry at `prev_index + 1`.
pub struct SegmentedLog {
    options: SegmentedLogOptions,
    segments: BTreeMap<u64, LogSegment>,
    current: u64,
    metas: VecDeque<EntryMeta>,
    prev_index: u64,
    prev_term: u64,
    watermarks: LogWatermarks,
}

impl SegmentedLog {
    pub fn open(options: SegmentedLogOptions) -> StorageResult<Self> {
        fs::create_dir_all(&options.dir)?;
        let mut seqs: Vec<u64> = fs::read_dir(&options.dir)?
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| LogSegment::parse_seq(&entry.file_name().to_string_lossy()))
            .collect();
        seqs.sort_unstable();

        let mut log = Self {
            options,
            segments: BTreeMap::new(),
            current: 0,
            metas: VecDeque::new(),
            prev_index: 0,
            prev_term: 0,
            watermarks: LogWatermarks::default(),
        };

        for seq in seqs {
            let (segment, records) = LogSegment::open(&log.options.dir, seq)?;
            for (offset, size, record) in records {
                log.replay(seq, offset, size, record);
            }
            log.segments.insert(seq, segment);
            log.current = seq;
        }
        if log.segments.is_empty() {
            let segment = LogSegment::create(&log.options.dir, 1)?;
            log.segments.insert(1, segment);
            log.current = 1;
        }

        info!(
            "Opened log at {:?}: {} segments, entries {}..={}",
            log.options.dir,
            log.segments.len(),
            log.first_index(),
            log.last_index()
        );
        Ok(log)
    }

    fn replay(&mut self, segment: u64, offset: u64, size: u32, record: LogRecord) {
        match record {
            LogRecord::Entry(entry) => {
                let expected = self.last_index() + 1;
                if entry.index < expected {
                    if entry.index <= self.prev_index {
                        return;
                    }
                    self.pop_after(entry.index - 1);
                } else if entry.index > expected {
                    if !self.metas.is_empty() {
                        warn!(
                            "Gap in log replay: expected {}, found {} in segment {}",
                            expected, entry.index, segment
                        );
                        self.metas.clear();
                    }
                    // older segments were deleted; a later prune record
                    // restores the boundary term
                    self.prev_index = entry.index - 1;
                }
                self.metas.push_back(EntryMeta {
                    index: entry.index,
                    term: entry.term,
                    segment,
                    offset,
                    size,
                });
            }
            LogRecord::TruncateAfter { index } => self.pop_after(index),
            LogRecord::PruneBefore { index, prev_term } => self.pop_before(index, prev_term),
            LogRecord::Reset {
                prev_index,
                prev_term,
            } => {
                self.metas.clear();
                self.prev_index = prev_index;
                self.prev_term = prev_term;
            }
        }
    }

    fn pop_after(&mut self, index: u64) {
        while self.metas.back().is_some_and(|m| m.index > index) {
            self.metas.pop_back();
        }
    }

    fn pop_before(&mut self, index: u64, prev_term: u64) {
        if index <= self.prev_index {
            return;
        }
        while self.metas.front().is_some_and(|m| m.index < index) {
            self.metas.pop_front();
        }
        self.prev_index = index - 1;
        self.prev_term = prev_term;
    }

    fn meta(&self, index: u64) -> Option<&EntryMeta> {
        if index <= self.prev_index {
            return None;
        }
        self.metas.get((index - self.prev_index - 1) as usize)
    }

    fn current_segment(&mut self) -> StorageResult<&mut LogSegment> {
        let current = self.current;
        self.segments
            .get_mut(&current)
            .ok_or_else(|| StorageError::Consistency(format!("segment {} missing", current)))
    }

    fn rotate(&mut self) -> StorageResult<()> {
        self.current_segment()?.sync_data()?;
        let seq = self.current + 1;
        let segment = LogSegment::create(&self.options.dir, seq)?;
        debug!("Rotated log to segment {}", seq);
        self.segments.insert(seq, segment);
        self.current = seq;
        Ok(())
    }

    fn write_record(&mut self, record: &LogRecord) -> StorageResult<(u64, u64, u32)> {
        if self.current_segment()?.size() >= self.options.max_segment_size {
            self.rotate()?;
        }
        let buf = record.serialize()?;
        let size = (buf.len() - super::ENTRY_HEADER_SIZE as usize) as u32;
        let seq = self.current;
        let offset = self.current_segment()?.append(&buf)?;
        Ok((seq, offset, size))
    }

    fn sync(&mut self) -> StorageResult<()> {
        if self.options.sync_on_write {
            self.current_segment()?.sync_data()?;
        }
        Ok(())
    }

    /// Deletes old segments, oldest first, as long as no live entry is left
    /// in them.
    fn delete_dead_segments(&mut self) -> StorageResult<()> {
        let first_live = self.metas.front().map(|m| m.segment).unwrap_or(self.current);
        let dead: Vec<u64> = self
            .segments
            .keys()
            .copied()
            .take_while(|seq| *seq < first_live && *seq < self.current)
            .collect();
        for seq in dead {
            if let Some(segment) = self.segments.remove(&seq) {
                fs::remove_file(&segment.path)?;
                debug!("Deleted log segment {}", seq);
            }
        }
        Ok(())
    }

    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }
}

impl LogStorage for SegmentedLog {
    fn append(&mut self, entries: &[LogEntry]) -> StorageResult<u64> {
        for entry in entries {
            let expected = self.last_index() + 1;
            if entry.index != expected {
                return Err(StorageError::NonContiguous {
                    expected,
                    got: entry.index,
                });
            }
            let (segment, offset, size) = self.write_record(&LogRecord::Entry(entry.clone()))?;
            self.metas.push_back(EntryMeta {
                index: entry.index,
                term: entry.term,
                segment,
                offset,
                size,
            });
        }
        self.sync()?;
        Ok(self.last_index())
    }

    fn entry(&self, index: u64) -> StorageResult<Option<LogEntry>> {
        let Some(meta) = self.meta(index) else {
            return Ok(None);
        };
        let segment = self
            .segments
            .get(&meta.segment)
            .ok_or(StorageError::LogNotFound(index))?;
        match segment.read_record(meta.offset, meta.size)? {
            LogRecord::Entry(entry) if entry.index == index => Ok(Some(entry)),
            _ => Err(StorageError::DataCorruption {
                segment: meta.segment,
                offset: meta.offset,
            }),
        }
    }

    fn entries(&self, low: u64, high: u64) -> StorageResult<Vec<LogEntry>> {
        if low < self.first_index() {
            return Err(StorageError::Compacted {
                index: low,
                first: self.first_index(),
            });
        }
        let high = high.min(self.last_index() + 1);
        let mut out = Vec::with_capacity(high.saturating_sub(low) as usize);
        for index in low..high {
            match self.entry(index)? {
                Some(entry) => out.push(entry),
                None => return Err(StorageError::LogNotFound(index)),
            }
        }
        Ok(out)
    }

    fn truncate_after(&mut self, index: u64) -> StorageResult<()> {
        self.watermarks.check_truncate(index)?;
        if index >= self.last_index() {
            return Ok(());
        }
        self.write_record(&LogRecord::TruncateAfter { index })?;
        self.sync()?;
        self.pop_after(index);
        Ok(())
    }

    fn prune_before(&mut self, index: u64) -> StorageResult<u64> {
        self.watermarks.check_prune(index)?;
        let index = index.min(self.last_index() + 1);
        if index <= self.first_index() {
            return Ok(self.first_index());
        }
        let prev_term = self
            .term_at(index - 1)?
            .ok_or(StorageError::LogNotFound(index - 1))?;
        self.write_record(&LogRecord::PruneBefore { index, prev_term })?;
        self.sync()?;
        self.pop_before(index, prev_term);
        self.delete_dead_segments()?;
        Ok(self.first_index())
    }

    fn reset(&mut self, prev_index: u64, prev_term: u64) -> StorageResult<()> {
        self.rotate()?;
        self.write_record(&LogRecord::Reset {
            prev_index,
            prev_term,
        })?;
        self.current_segment()?.sync_data()?;
        self.metas.clear();
        self.prev_index = prev_index;
        self.prev_term = prev_term;
        self.watermarks.reset(prev_index);
        self.delete_dead_segments()
    }

    fn first_index(&self) -> u64 {
        self.prev_index + 1
    }

    fn last_index(&self) -> u64 {
        self.metas.back().map(|m| m.index).unwrap_or(self.prev_index)
    }

    fn prev_index(&self) -> u64 {
        self.prev_index
    }

    fn prev_term(&self) -> u64 {
        self.prev_term
    }

    fn term_at(&self, index: u64) -> StorageResult<Option<u64>> {
        if index == 0 {
            return Ok(Some(0));
        }
        if index == self.prev_index {
            return Ok(Some(self.prev_term));
        }
        Ok(self.meta(index).map(|m| m.term))
    }

    fn mark_committed(&mut self, index: u64) {
        self.watermarks.mark_committed(index);
    }

    fn mark_applied(&mut self, index: u64) {
        self.watermarks.mark_applied(index);
    }

    fn mark_majority_applied(&mut self, index: u64) {
        self.watermarks.mark_majority_applied(index);
    }
}
