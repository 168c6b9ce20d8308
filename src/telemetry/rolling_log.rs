//! Bounded rolling text log fed by orchestrator narration and engine
//! progress chatter.

use std::collections::VecDeque;
use std::sync::Mutex;

/// Append-only line log bounded to the most recent `capacity` lines.
/// Eviction is pure FIFO: when full, the oldest line is dropped, nothing
/// is reordered.
pub struct RollingLog {
    lines: Mutex<VecDeque<String>>,
    capacity: usize,
}

impl RollingLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            lines: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            capacity: capacity.max(1),
        }
    }

    pub fn push(&self, line: impl Into<String>) {
        let mut lines = self.lines.lock().unwrap();
        if lines.len() == self.capacity {
            lines.pop_front();
        }
        lines.push_back(line.into());
    }

    /// Current contents, oldest first.
    pub fn snapshot(&self) -> Vec<String> {
        self.lines.lock().unwrap().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lines.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.lock().unwrap().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
