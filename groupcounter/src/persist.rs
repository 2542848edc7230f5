//! Snapshot persistence across restarts.
//!
//! On shutdown the scheduler writes the live counter table plus enough
//! metadata to resume the interrupted flush window. A snapshot records the
//! grouping configuration it was taken under; a restart with a different
//! aggregation mode or group-by field list would mix incompatible group keys
//! into one table, so such snapshots are discarded with a warning rather
//! than loaded.

use std::fs;
use std::io::{BufReader, BufWriter, Write};
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::config::Aggregate;
use crate::table::Table;

/// Errors produced when reading or writing a [`Snapshot`].
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Wrapper around [`std::io::Error`].
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// Wrapper around [`serde_json::Error`].
    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

/// A counter table frozen at shutdown, with resume metadata.
#[derive(Debug, Serialize, Deserialize)]
pub struct Snapshot {
    /// The full scope-to-groups table.
    pub counters: Table,
    /// Clock reading when the snapshot was written.
    pub saved_at: u64,
    /// Seconds that had elapsed in the flush window at `saved_at`. On load
    /// the window is rewound by this much so the interrupted interval still
    /// flushes a full interval after it began.
    pub saved_duration: u64,
    /// Aggregation mode the table was built under.
    pub aggregate: Aggregate,
    /// Group-by field list the table was built under, if that mode was used.
    pub group_by_keys: Option<Vec<String>>,
}

/// Handle on the configured snapshot location.
#[derive(Debug, Clone)]
pub struct StateFile {
    path: PathBuf,
}

impl StateFile {
    pub(crate) fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub(crate) fn path(&self) -> &PathBuf {
        &self.path
    }

    /// Write `snapshot` to the configured path, replacing any previous one.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be created or serialization fails.
    pub fn save(&self, snapshot: &Snapshot) -> Result<(), Error> {
        let mut writer = BufWriter::new(fs::File::create(&self.path)?);
        serde_json::to_writer(&mut writer, snapshot)?;
        writer.flush()?;
        Ok(())
    }

    /// Load the stored snapshot if there is one and it matches the current
    /// grouping configuration.
    ///
    /// Any failure to read or decode, and any configuration mismatch, logs a
    /// warning and yields `None`; the engine then starts empty.
    pub fn load(
        &self,
        aggregate: Aggregate,
        group_by_keys: Option<&Vec<String>>,
    ) -> Option<Snapshot> {
        if !self.path.exists() {
            return None;
        }
        let snapshot = match self.read() {
            Ok(snapshot) => snapshot,
            Err(error) => {
                warn!(
                    path = %self.path.display(),
                    %error,
                    "could not load stored snapshot, starting empty"
                );
                return None;
            }
        };
        if snapshot.aggregate != aggregate || snapshot.group_by_keys.as_ref() != group_by_keys {
            warn!(
                path = %self.path.display(),
                "stored snapshot was written under a different grouping configuration, ignoring"
            );
            return None;
        }
        Some(snapshot)
    }

    fn read(&self) -> Result<Snapshot, Error> {
        let reader = BufReader::new(fs::File::open(&self.path)?);
        Ok(serde_json::from_reader(reader)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accumulator::Stats;

    fn sample_table() -> Table {
        let mut table = Table::default();
        table.entry(String::from("app.web")).or_default().insert(
            String::from("200_GET"),
            Stats {
                count: 3,
                sum: Some(1.5),
                max: Some(1.0),
                min: Some(0.1),
            },
        );
        table
    }

    fn sample_snapshot() -> Snapshot {
        Snapshot {
            counters: sample_table(),
            saved_at: 1_000,
            saved_duration: 42,
            aggregate: Aggregate::Tag,
            group_by_keys: Some(vec![String::from("code"), String::from("method")]),
        }
    }

    #[test]
    fn save_then_load_round_trips() -> Result<(), Error> {
        let dir = tempfile::tempdir().expect("tempdir");
        let state = StateFile::new(dir.path().join("state.json"));
        state.save(&sample_snapshot())?;

        let keys = vec![String::from("code"), String::from("method")];
        let loaded = state
            .load(Aggregate::Tag, Some(&keys))
            .expect("snapshot should load");
        assert_eq!(loaded.saved_duration, 42);
        assert_eq!(loaded.counters["app.web"]["200_GET"].count, 3);
        assert_eq!(loaded.counters["app.web"]["200_GET"].min, Some(0.1));
        Ok(())
    }

    #[test]
    fn missing_file_loads_nothing() {
        let dir = tempfile::tempdir().expect("tempdir");
        let state = StateFile::new(dir.path().join("absent.json"));
        assert!(state.load(Aggregate::Tag, None).is_none());
    }

    #[test]
    fn mismatched_aggregate_is_discarded() -> Result<(), Error> {
        let dir = tempfile::tempdir().expect("tempdir");
        let state = StateFile::new(dir.path().join("state.json"));
        state.save(&sample_snapshot())?;

        let keys = vec![String::from("code"), String::from("method")];
        assert!(state.load(Aggregate::All, Some(&keys)).is_none());
        Ok(())
    }

    #[test]
    fn mismatched_group_by_keys_are_discarded() -> Result<(), Error> {
        let dir = tempfile::tempdir().expect("tempdir");
        let state = StateFile::new(dir.path().join("state.json"));
        state.save(&sample_snapshot())?;

        let other = vec![String::from("path")];
        assert!(state.load(Aggregate::Tag, Some(&other)).is_none());
        assert!(state.load(Aggregate::Tag, None).is_none());
        Ok(())
    }

    #[test]
    fn corrupt_file_loads_nothing() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("state.json");
        fs::write(&path, b"not json at all").expect("write");
        let state = StateFile::new(path);
        assert!(state.load(Aggregate::Tag, None).is_none());
    }
}
