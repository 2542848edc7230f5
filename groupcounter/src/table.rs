//! The shared counter table.
//!
//! One [`CounterTable`] instance is owned for the lifetime of the engine and
//! shared between the ingest path and the flush scheduler. All mutation goes
//! through a single table-wide mutex. Ingest callers aggregate each batch
//! into a local map first, outside the lock, and merge it in with one lock
//! acquisition -- lock hold time is bounded by the number of distinct group
//! keys in the batch, not the batch size.
//!
//! [`CounterTable::drain`] swaps the live contents for an empty table in one
//! critical section. Every concurrently ingested record therefore lands
//! wholly in either the pre-drain snapshot or the post-drain table, never
//! split across both.

use std::sync::{Mutex, PoisonError};

use rustc_hash::FxHashMap;

use crate::accumulator::Stats;

/// Scope -> group key -> statistics. The shape shared by drain snapshots and
/// persisted state.
pub type Table = FxHashMap<String, FxHashMap<String, Stats>>;

/// Concurrent container for per-scope, per-group statistics.
#[derive(Debug, Default)]
pub struct CounterTable {
    inner: Mutex<Table>,
}

impl CounterTable {
    /// Create an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a table seeded with restored contents.
    #[must_use]
    pub fn restore(contents: Table) -> Self {
        Self {
            inner: Mutex::new(contents),
        }
    }

    /// Merge a batch-local aggregate into the scope `scope`.
    pub fn merge_batch(&self, scope: &str, batch: FxHashMap<String, Stats>) {
        let mut table = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let groups = table.entry(scope.to_owned()).or_default();
        for (group_key, delta) in batch {
            groups.entry(group_key).or_default().merge(&delta);
        }
    }

    /// Take ownership of the current contents, leaving the table empty.
    #[must_use]
    pub fn drain(&self) -> Table {
        let mut table = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        std::mem::take(&mut *table)
    }

    /// Copy of the current contents. Used by persistence, which must capture
    /// in-flight counters without flushing them.
    #[must_use]
    pub fn snapshot(&self) -> Table {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use super::*;

    fn one(key: &str) -> FxHashMap<String, Stats> {
        let mut batch = FxHashMap::default();
        batch.insert(key.to_owned(), Stats::single(None, None, None));
        batch
    }

    #[test]
    fn merge_creates_and_accumulates() {
        let table = CounterTable::new();
        table.merge_batch("app.web", one("200_GET"));
        table.merge_batch("app.web", one("200_GET"));
        table.merge_batch("app.web", one("404_GET"));

        let snapshot = table.snapshot();
        let groups = &snapshot["app.web"];
        assert_eq!(groups["200_GET"].count, 2);
        assert_eq!(groups["404_GET"].count, 1);
    }

    #[test]
    fn drain_empties_the_table() {
        let table = CounterTable::new();
        table.merge_batch("a", one("k"));

        let drained = table.drain();
        assert_eq!(drained["a"]["k"].count, 1);
        assert!(table.snapshot().is_empty());
    }

    // Every record ingested concurrently with a drain must land in exactly
    // one generation: totals across the drained snapshot and whatever is left
    // in the live table must be conserved.
    #[test]
    fn drain_is_atomic_under_concurrent_ingest() {
        const WRITERS: usize = 4;
        const BATCHES_PER_WRITER: u64 = 250;

        let table = Arc::new(CounterTable::new());
        let mut handles = Vec::new();
        for _ in 0..WRITERS {
            let table = Arc::clone(&table);
            handles.push(thread::spawn(move || {
                for _ in 0..BATCHES_PER_WRITER {
                    table.merge_batch("scope", one("group"));
                }
            }));
        }

        let mut drained_total = 0_u64;
        for _ in 0..10 {
            let snapshot = table.drain();
            drained_total += snapshot
                .get("scope")
                .and_then(|groups| groups.get("group"))
                .map_or(0, |stats| stats.count);
            thread::yield_now();
        }

        for handle in handles {
            handle.join().expect("writer panicked");
        }

        let remaining = table
            .drain()
            .get("scope")
            .and_then(|groups| groups.get("group"))
            .map_or(0, |stats| stats.count);
        assert_eq!(
            drained_total + remaining,
            WRITERS as u64 * BATCHES_PER_WRITER
        );
    }
}
