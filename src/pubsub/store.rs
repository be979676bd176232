//! Append-only, name-indexed record log.
//!
//! The [`DataStore`] keeps every inserted [`Datum`] in one insertion-ordered log plus a
//! per-name list of log positions. Subscribers keep a [`Cursor`] into the log and ask for the
//! [`Delta`] beyond it; entries are handed out as shared [`Arc`]s, so an append never disturbs
//! what a reader already holds.
//!
//! By default nothing is ever evicted. [`DataStore::bounded`] keeps only the newest entries;
//! a cursor pointing at evicted positions resumes at the oldest retained entry.
use std::{
    collections::{BTreeSet, HashMap, VecDeque},
    sync::{Arc, Condvar, Mutex, PoisonError},
    time::Duration,
};

use log::trace;

use crate::socket::lock;

use super::Datum;

/// Number of log entries a reader has already seen.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Cursor(u64);

impl Cursor {
    pub const START: Cursor = Cursor(0);

    pub fn new(position: u64) -> Self {
        Self(position)
    }

    pub fn position(&self) -> u64 {
        self.0
    }
}

/// Entries beyond a cursor, and the cursor to resume from next time.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Delta {
    pub data: Vec<Arc<Datum>>,
    pub cursor: Cursor,
}

#[derive(Debug, Default)]
struct Log {
    entries: VecDeque<Arc<Datum>>,
    // Absolute position of entries[0].
    offset: u64,
    index: HashMap<String, VecDeque<u64>>,
}

impl Log {
    fn end(&self) -> u64 {
        self.offset + self.entries.len() as u64
    }

    fn get(&self, position: u64) -> Option<&Arc<Datum>> {
        let slot = position.checked_sub(self.offset)?;
        self.entries.get(slot as usize)
    }

    /// Appends `datum`, evicting beyond `limit`. Returns its position.
    fn append(&mut self, datum: Datum, limit: Option<usize>) -> u64 {
        let position = self.end();
        self.index
            .entry(datum.name().to_string())
            .or_default()
            .push_back(position);
        self.entries.push_back(Arc::new(datum));

        if let Some(limit) = limit {
            while self.entries.len() > limit {
                self.evict_front();
            }
        }
        position
    }

    fn evict_front(&mut self) {
        let Some(datum) = self.entries.pop_front() else {
            return;
        };
        if let Some(positions) = self.index.get_mut(datum.name()) {
            positions.pop_front();
            if positions.is_empty() {
                self.index.remove(datum.name());
            }
        }
        self.offset += 1;
    }
}

#[derive(Debug, Default)]
pub struct DataStore {
    log: Mutex<Log>,
    appended: Condvar,
    limit: Option<usize>,
}

impl DataStore {
    /// Unbounded store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Store retaining at most `limit` entries, evicting the oldest first.
    pub fn bounded(limit: usize) -> Self {
        Self {
            limit: Some(limit.max(1)),
            ..Self::default()
        }
    }

    pub fn limit(&self) -> Option<usize> {
        self.limit
    }

    /// Appends a datum, returning the cursor just past it.
    pub fn insert(&self, datum: Datum) -> Cursor {
        let mut log = lock(&self.log);
        let position = log.append(datum, self.limit);
        let end = Cursor(log.end());
        drop(log);

        trace!("inserted entry at position {position}");
        self.appended.notify_all();
        end
    }

    pub fn insert_all<I: IntoIterator<Item = Datum>>(&self, data: I) -> Cursor {
        let mut end = self.cursor();
        for datum in data {
            end = self.insert(datum);
        }
        end
    }

    /// Entries after `cursor`, optionally limited to one name, in insertion order.
    pub fn since(&self, name: Option<&str>, cursor: Cursor) -> Delta {
        let log = lock(&self.log);
        let from = cursor.0.max(log.offset);
        let end = log.end();

        let data = match name {
            Some(name) => match log.index.get(name) {
                Some(positions) => {
                    let start = positions.partition_point(|&p| p < from);
                    positions
                        .range(start..)
                        .filter_map(|&p| log.get(p).cloned())
                        .collect()
                }
                None => Vec::new(),
            },
            None => (from..end).filter_map(|p| log.get(p).cloned()).collect(),
        };

        Delta {
            data,
            cursor: Cursor(end.max(cursor.0)),
        }
    }

    /// Entries after `cursor` whose name is in `names`, in insertion order.
    pub fn since_any(&self, names: &BTreeSet<String>, cursor: Cursor) -> Delta {
        let log = lock(&self.log);
        let from = cursor.0.max(log.offset);
        let end = log.end();

        let data = (from..end)
            .filter_map(|p| log.get(p))
            .filter(|datum| names.contains(datum.name()))
            .cloned()
            .collect();

        Delta {
            data,
            cursor: Cursor(end.max(cursor.0)),
        }
    }

    pub fn latest(&self, name: &str) -> Option<Arc<Datum>> {
        let log = lock(&self.log);
        let position = *log.index.get(name)?.back()?;
        log.get(position).cloned()
    }

    /// Newest entry for `name` that a reader at `cursor` has already passed.
    pub fn latest_before(&self, name: &str, cursor: Cursor) -> Option<Arc<Datum>> {
        let log = lock(&self.log);
        let positions = log.index.get(name)?;
        let seen = positions.partition_point(|&p| p < cursor.0);
        let position = *positions.get(seen.checked_sub(1)?)?;
        log.get(position).cloned()
    }

    /// Cursor at the current end of the log.
    pub fn cursor(&self) -> Cursor {
        Cursor(lock(&self.log).end())
    }

    /// Entries currently retained.
    pub fn len(&self) -> usize {
        lock(&self.log).entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn names(&self) -> BTreeSet<String> {
        lock(&self.log).index.keys().cloned().collect()
    }

    /// Blocks until the log extends beyond `cursor` or `timeout` elapses. Returns whether new
    /// entries are available.
    pub fn wait_for(&self, cursor: Cursor, timeout: Duration) -> bool {
        let log = lock(&self.log);
        let (log, _) = self
            .appended
            .wait_timeout_while(log, timeout, |log| log.end() <= cursor.0)
            .unwrap_or_else(PoisonError::into_inner);
        log.end() > cursor.0
    }

    /// Holds the log lock until dropped. Readers block meanwhile; the holder may still append.
    #[cfg(test)]
    pub(crate) fn hold(&self) -> Held<'_> {
        Held {
            store: self,
            log: lock(&self.log),
        }
    }
}

#[cfg(test)]
pub(crate) struct Held<'a> {
    store: &'a DataStore,
    log: std::sync::MutexGuard<'a, Log>,
}

#[cfg(test)]
impl Held<'_> {
    pub(crate) fn insert(&mut self, datum: Datum) {
        self.log.append(datum, self.store.limit);
    }
}

#[cfg(test)]
impl Drop for Held<'_> {
    fn drop(&mut self) {
        self.store.appended.notify_all();
    }
}
