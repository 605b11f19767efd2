//! Bounded undo/redo history.

use crate::types::Snapshot;
use std::collections::VecDeque;
use tracing::debug;

/// Default number of retained snapshots.
pub const DEFAULT_HISTORY_LIMIT: usize = 100;

/// Direction of a history navigation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HistoryDirection {
    Undo,
    Redo,
}

impl HistoryDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            HistoryDirection::Undo => "undo",
            HistoryDirection::Redo => "redo",
        }
    }
}

/// A bounded list of snapshots with a cursor.
///
/// The cursor always satisfies `-1 <= cursor < len`; `-1` only when the
/// list is empty.
#[derive(Debug)]
pub struct History {
    entries: VecDeque<Snapshot>,
    cursor: isize,
    limit: usize,
    replaying: bool,
}

impl History {
    pub fn new(limit: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            cursor: -1,
            limit: limit.max(1),
            replaying: false,
        }
    }

    /// Append a snapshot as the newest entry.
    ///
    /// Ignored while an undo/redo is being applied. Any redo branch beyond
    /// the cursor is discarded first; the oldest entries are trimmed when
    /// over the limit.
    pub fn record(&mut self, snapshot: Snapshot) {
        if self.replaying {
            return;
        }

        let keep = (self.cursor + 1) as usize;
        if keep < self.entries.len() {
            self.entries.truncate(keep);
        }

        self.entries.push_back(snapshot);
        self.cursor = self.entries.len() as isize - 1;

        let overflow = self.entries.len().saturating_sub(self.limit);
        if overflow > 0 {
            self.entries.drain(..overflow);
            self.cursor = (self.cursor - overflow as isize).max(0);
            debug!(trimmed = overflow, limit = self.limit, "history trimmed");
        }
    }

    /// Move the cursor back `steps` entries.
    pub fn undo(&mut self, steps: usize) -> Option<Snapshot> {
        let target = self.target(HistoryDirection::Undo, steps)?;
        self.cursor = target;
        self.entries.get(target as usize).cloned()
    }

    /// Move the cursor forward `steps` entries.
    pub fn redo(&mut self, steps: usize) -> Option<Snapshot> {
        let target = self.target(HistoryDirection::Redo, steps)?;
        self.cursor = target;
        self.entries.get(target as usize).cloned()
    }

    /// Cursor position after moving `steps`, if it stays in `[0, len)`.
    fn target(&self, direction: HistoryDirection, steps: usize) -> Option<isize> {
        if steps == 0 {
            return None;
        }
        let steps = isize::try_from(steps).ok()?;
        let target = match direction {
            HistoryDirection::Undo => self.cursor.checked_sub(steps)?,
            HistoryDirection::Redo => self.cursor.checked_add(steps)?,
        };
        (target >= 0 && (target as usize) < self.entries.len()).then_some(target)
    }

    pub fn can_undo(&self, steps: usize) -> bool {
        self.target(HistoryDirection::Undo, steps).is_some()
    }

    pub fn can_redo(&self, steps: usize) -> bool {
        self.target(HistoryDirection::Redo, steps).is_some()
    }

    /// Snapshot at the cursor.
    pub fn current(&self) -> Option<&Snapshot> {
        if self.cursor < 0 {
            return None;
        }
        self.entries.get(self.cursor as usize)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn cursor(&self) -> isize {
        self.cursor
    }

    pub fn entries(&self) -> impl Iterator<Item = &Snapshot> {
        self.entries.iter()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.cursor = -1;
    }

    /// Clear and start over from a single snapshot.
    pub fn reseed(&mut self, snapshot: Snapshot) {
        self.clear();
        self.entries.push_back(snapshot);
        self.cursor = 0;
    }

    pub fn begin_replay(&mut self) {
        self.replaying = true;
    }

    pub fn end_replay(&mut self) {
        self.replaying = false;
    }
}
