//! Completion map
//!
//! One entry per discovered file, moving from pending to completed exactly
//! once. The pending count and failure flag are kept alongside so the "are we
//! done" check is answered under the same lock as the write.

use std::collections::HashMap;

use crate::models::{Completion, ReportEntry, TestResult};

/// Outcome of [`CompletionMap::record`]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Recorded {
    Accepted,
    /// The file already has a result; the first one is kept
    Duplicate,
    /// The path was never discovered
    Unknown,
}

#[derive(Debug, Default)]
pub struct CompletionMap {
    order: Vec<String>,
    entries: HashMap<String, Completion>,
    pending: usize,
    failed: bool,
    seeded: bool,
}

impl CompletionMap {
    /// Map with a pending entry for every path; duplicates collapse
    pub fn new<I, S>(paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut map = Self::unseeded();
        map.seed(paths);
        map
    }

    /// Empty map waiting for an agent-submitted file list
    pub fn unseeded() -> Self {
        Self::default()
    }

    /// Fill the map once; later calls are ignored and return false
    pub fn seed<I, S>(&mut self, paths: I) -> bool
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        if self.seeded {
            return false;
        }
        for path in paths {
            let path = path.into();
            if !self.entries.contains_key(&path) {
                self.entries.insert(path.clone(), Completion::Pending);
                self.order.push(path);
                self.pending += 1;
            }
        }
        self.seeded = true;
        true
    }

    pub fn record(&mut self, path: &str, result: TestResult) -> Recorded {
        match self.entries.get_mut(path) {
            None => Recorded::Unknown,
            Some(Completion::Completed(_)) => Recorded::Duplicate,
            Some(entry) => {
                self.failed |= !result.ok;
                *entry = Completion::Completed(result);
                self.pending -= 1;
                Recorded::Accepted
            }
        }
    }

    pub fn is_complete(&self) -> bool {
        self.seeded && self.pending == 0
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn pending(&self) -> usize {
        self.pending
    }

    /// Files in discovery order
    pub fn paths(&self) -> &[String] {
        &self.order
    }

    /// 0 iff every entry completed ok
    #[cfg(test)]
    pub fn exit_code(&self) -> i32 {
        if self.failed || self.pending > 0 {
            1
        } else {
            0
        }
    }

    /// Snapshot for the formatter, in discovery order
    pub fn entries(&self) -> Vec<ReportEntry> {
        self.order
            .iter()
            .map(|path| {
                let state = self.entries.get(path).cloned().unwrap_or(Completion::Pending);
                ReportEntry::new(path.clone(), state)
            })
            .collect()
    }
}
