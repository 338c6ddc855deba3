use serde::{Deserialize, Serialize};

/// Summary of one resync run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncStats {
    /// Rows returned by the catalog
    pub fetched: usize,

    /// Documents written to the store
    pub processed: usize,

    /// Rows that could not be embedded or written
    pub skipped: usize,

    /// Stale documents deleted by the sweep
    pub removed: usize,

    /// Time taken in milliseconds
    pub time_ms: u64,

    /// Per-item and sweep errors, in the order they happened
    pub errors: Vec<String>,
}

impl SyncStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_skipped(&mut self, error: String) {
        self.skipped += 1;
        self.errors.push(error);
    }

    pub fn add_error(&mut self, error: String) {
        self.errors.push(error);
    }
}
