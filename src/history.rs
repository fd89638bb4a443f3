//! Append-only, time-stamped value history for mutable session fields.
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::{Error, Result};

/// Source of timestamps for [`MutableHistory`].
///
/// Injectable so tests can control ordering and boundary ties instead of racing the wall clock.
pub trait Clock: Send + Sync {
    /// The current time.
    fn now(&self) -> DateTime<Utc>;
}

/// The wall clock.
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// One span in a value's history. `end_time` is `None` while the entry is still current.
#[derive(Debug, Clone, Serialize)]
pub struct HistoryEntry<T> {
    /// The value held over the span.
    pub value: T,
    /// When the value was set.
    #[serde(rename = "startTime")]
    pub start_time: DateTime<Utc>,
    /// When the value was superseded or the session closed. Open-ended while `None`.
    #[serde(rename = "endTime", skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
}

/// The changing value of a mutable session field over time.
///
/// Entries are only ever appended or closed, never deleted, so the history doubles as an audit
/// log. At most one entry is open-ended at a time.
pub struct MutableHistory<T> {
    entries: Vec<HistoryEntry<T>>,
    clock: Arc<dyn Clock>,
}

impl<T: PartialEq> MutableHistory<T> {
    /// Create an empty history on the wall clock.
    pub fn new() -> MutableHistory<T> {
        MutableHistory::with_clock(Arc::new(SystemClock))
    }

    /// Create an empty history on the given clock.
    pub fn with_clock(clock: Arc<dyn Clock>) -> MutableHistory<T> {
        MutableHistory {
            entries: Vec::new(),
            clock,
        }
    }

    /// Record a new value.
    ///
    /// Setting a value equal to the current one is a no-op — no new entry is appended.
    /// Otherwise the open entry (if any) is closed at now and a new open entry begins at now.
    pub fn set_value(&mut self, value: T) {
        let now = self.clock.now();
        if let Some(last) = self.entries.last_mut() {
            if last.value == value {
                return;
            }
            if last.end_time.is_none() {
                last.end_time = Some(now);
            }
        }
        self.entries.push(HistoryEntry {
            value,
            start_time: now,
            end_time: None,
        });
    }

    /// The most recent value.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ValueUnset`] if no value has ever been set.
    pub fn value(&self) -> Result<&T> {
        self.entries
            .last()
            .map(|entry| &entry.value)
            .ok_or(Error::ValueUnset)
    }

    /// Has a value ever been set?
    pub fn is_set(&self) -> bool {
        !self.entries.is_empty()
    }

    /// Close the open entry at `end_time` without appending. Used when the session ends.
    pub fn close_at(&mut self, end_time: DateTime<Utc>) {
        if let Some(last) = self.entries.last_mut() {
            if last.end_time.is_none() {
                last.end_time = Some(end_time);
            }
        }
    }

    /// The full history, oldest first.
    pub fn entries(&self) -> &[HistoryEntry<T>] {
        &self.entries
    }
}

impl<T: PartialEq> Default for MutableHistory<T> {
    fn default() -> MutableHistory<T> {
        MutableHistory::new()
    }
}

impl<T: std::fmt::Debug> std::fmt::Debug for MutableHistory<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MutableHistory")
            .field("entries", &self.entries)
            .finish_non_exhaustive()
    }
}
