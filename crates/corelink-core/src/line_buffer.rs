//! Bounded line history with oldest-first eviction.

use std::collections::VecDeque;

/// Default number of retained lines (client-visible log cap).
pub const DEFAULT_LINE_CAPACITY: usize = 5000;

/// Bounded buffer of the most recent lines.
///
/// This is a display-memory bound: lines evicted here are gone and are
/// never replayed by the server.
#[derive(Debug, Clone)]
pub struct LineBuffer {
    lines: VecDeque<String>,
    capacity: usize,
    evicted: u64,
}

impl Default for LineBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_LINE_CAPACITY)
    }
}

impl LineBuffer {
    /// Create a buffer retaining at most `capacity` lines.
    ///
    /// A zero capacity is treated as one.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            lines: VecDeque::with_capacity(capacity.min(1024)),
            capacity,
            evicted: 0,
        }
    }

    /// Append a line, evicting and returning the oldest one when full.
    pub fn push<S: Into<String>>(&mut self, line: S) -> Option<String> {
        let dropped = if self.lines.len() == self.capacity {
            self.evicted += 1;
            self.lines.pop_front()
        } else {
            None
        };
        self.lines.push_back(line.into());
        dropped
    }

    /// Number of retained lines.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lines.len()
    }

    /// Whether no lines are retained.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// Maximum number of retained lines.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Total lines evicted since creation or the last `clear`.
    #[must_use]
    pub const fn evicted(&self) -> u64 {
        self.evicted
    }

    /// Retained lines, oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.lines.iter().map(String::as_str)
    }

    /// Most recently pushed line.
    #[must_use]
    pub fn last(&self) -> Option<&str> {
        self.lines.back().map(String::as_str)
    }

    /// Drop all retained lines.
    pub fn clear(&mut self) {
        self.lines.clear();
        self.evicted = 0;
    }
}

impl<S: Into<String>> Extend<S> for LineBuffer {
    fn extend<T: IntoIterator<Item = S>>(&mut self, iter: T) {
        for line in iter {
            self.push(line);
        }
    }
}
