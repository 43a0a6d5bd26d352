mod entry;
mod segment;
mod store;


pub use entry::{ENTRY_HEADER_SIZE, ENTRY_MAGIC_NUM, EntryHeader, EntryMeta, LogRecord, RecordType};
pub use segment::LogSegment;
pub use store::{SegmentedLog, SegmentedLogOptions};
