use parking_lot::RwLock;
use std::collections::VecDeque;
use std::sync::Arc;

use crate::events::LogLine;

/// Thread-safe circular buffer of recent log lines.
///
/// Lets a subscriber that attaches late catch up on what was logged before it existed.
#[derive(Debug, Clone)]
pub struct LogHistory {
    entries: Arc<RwLock<VecDeque<LogLine>>>,
    max_entries: usize,
}

impl Default for LogHistory {
    fn default() -> Self {
        Self::new(5000)
    }
}

impl LogHistory {
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: Arc::new(RwLock::new(VecDeque::with_capacity(max_entries.min(1024)))),
            max_entries: max_entries.max(1),
        }
    }

    pub fn push(&self, entry: LogLine) {
        let mut entries = self.entries.write();
        if entries.len() >= self.max_entries {
            entries.pop_front();
        }
        entries.push_back(entry);
    }

    pub fn entries(&self) -> Vec<LogLine> {
        self.entries.read().iter().cloned().collect()
    }

    /// Hand every buffered line, oldest first, to `handler`.
    pub fn replay(&self, mut handler: impl FnMut(&LogLine)) {
        for entry in self.entries() {
            handler(&entry);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}
