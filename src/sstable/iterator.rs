//! Reader-side range scan over a memory-mapped table.

use std::sync::Arc;

use tracing::error;

use super::{SsTable, SsTableEntry, decode_entry};

/// Ascending scan over `[start, end]` (both inclusive), tombstones included.
///
/// Holds an `Arc` to its table, so it stays valid while the engine swaps the
/// live table set underneath it. Positioning starts at the sparse-index
/// offset nearest below `start`; entries before `start` are skipped during
/// iteration.
pub struct SsTableScanIter {
    table: Arc<SsTable>,
    pos: usize,
    start: String,
    /// Inclusive upper bound; `None` scans to the end of the data section.
    end: Option<String>,
    done: bool,
}

impl SsTableScanIter {
    pub(crate) fn new(table: Arc<SsTable>, pos: usize, start: String, end: Option<String>) -> Self {
        Self {
            table,
            pos,
            start,
            end,
            done: false,
        }
    }
}

impl Iterator for SsTableScanIter {
    type Item = SsTableEntry;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let data_end = self.table.meta.index_offset as usize;

        while self.pos < data_end {
            let entry = match decode_entry(self.table.data(), &mut self.pos) {
                Ok(entry) => entry,
                Err(e) => {
                    // An immutable file that fails to decode mid-scan is
                    // corrupt; surface what we can and stop.
                    error!(
                        path = %self.table.meta.file_path.display(),
                        error = %e,
                        "aborting scan over corrupt table"
                    );
                    self.done = true;
                    return None;
                }
            };

            if entry.key.as_str() < self.start.as_str() {
                continue;
            }
            if let Some(end) = &self.end {
                if entry.key.as_str() > end.as_str() {
                    self.done = true;
                    return None;
                }
            }
            return Some(entry);
        }

        self.done = true;
        None
    }
}
