//! File based snapshot storage.
//!
//! ```text
//! {dir}/
//! ├── CURRENT                          # name of the live snapshot directory
//! └── snapshot-{index:020}/
//!     ├── meta.json   # SnapshotMeta (index, term, membership, store identity, checksum)
//!     └── data.bin    # state machine image
//! ```
//!
//! A new snapshot is staged in `snapshot-{index}.tmp/`, renamed into place and
//! only then published by replacing `CURRENT`. A crash at any point leaves
//! `CURRENT` naming one complete directory; leftovers are removed on open.

mod store;

#[cfg(test)]
mod tests;

pub use store::{FileSnapshotStore, calculate_checksum};
