//! Sorting progress observers.

use log;

/// Splitting phase summary.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SplitStats {
    /// Number of input lines read.
    pub lines_read: u64,
    /// Number of records written to chunks.
    pub records: u64,
    /// Number of unparseable lines that were skipped.
    pub skipped: u64,
    /// Number of created chunks.
    pub chunks: usize,
}

/// Sorting progress observer. All methods do nothing by default.
///
/// Observers must be cheap: they are called from the splitting loop and the merge coordinator.
pub trait SortObserver: Send + Sync {
    /// Called for every input line the parser rejected.
    fn line_skipped(&self, _line_number: u64, _line: &str) {}

    /// Called after a chunk is persisted.
    fn chunk_written(&self, _chunk: &str, _records: u64) {}

    /// Called once the input is completely split.
    fn split_finished(&self, _stats: &SplitStats) {}

    /// Called once the merged stream is exhausted.
    fn merge_finished(&self, _records: u64, _chunks: usize) {}
}

/// Observer reporting progress through the `log` facade.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogObserver;

impl SortObserver for LogObserver {
    fn line_skipped(&self, line_number: u64, line: &str) {
        log::warn!("failed to parse line {}: {:?}", line_number, line);
    }

    fn chunk_written(&self, chunk: &str, records: u64) {
        log::info!("chunk {} written ({} records)", chunk, records);
    }

    fn split_finished(&self, stats: &SplitStats) {
        log::info!(
            "total lines read while splitting: {} ({} records, {} skipped, {} chunks)",
            stats.lines_read,
            stats.records,
            stats.skipped,
            stats.chunks
        );
    }

    fn merge_finished(&self, records: u64, chunks: usize) {
        log::info!("total records merged from {} chunks: {}", chunks, records);
    }
}
