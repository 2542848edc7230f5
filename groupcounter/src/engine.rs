//! Assembly of the aggregation engine and its record intake path.
//!
//! [`Engine::new`] validates the configuration, compiles the group-key
//! resolver, restores any stored snapshot and wires the pieces together. The
//! host then splits it with [`Engine::into_parts`]: the [`Ingestor`] goes
//! wherever records arrive, the scheduler is spawned onto a task, and the
//! shutdown controller is kept for teardown.

use std::env;
use std::fs;
use std::sync::Arc;

use rustc_hash::FxHashMap;
use tracing::{info, warn};

use crate::accumulator::{numeric, Stats};
use crate::clock::Clock;
use crate::config::{Aggregate, Config};
use crate::group_key::GroupKeyResolver;
use crate::output::{OutputFormatter, ALL_SCOPE};
use crate::persist::StateFile;
use crate::scheduler::FlushScheduler;
use crate::shutdown;
use crate::table::CounterTable;

/// An incoming record: field names mapped to JSON values.
pub type Record = FxHashMap<String, serde_json::Value>;

/// A flattened output record: field names mapped to numeric values.
pub type FieldMap = FxHashMap<String, f64>;

/// Error type carried back from an [`EmitSink`].
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Destination for flushed records, supplied by the host.
pub trait EmitSink: Send {
    /// Deliver one output record.
    ///
    /// # Errors
    ///
    /// Returns an error if delivery fails; the record's window is then lost.
    fn emit(&mut self, tag: &str, timestamp: u64, fields: &FieldMap) -> Result<(), BoxError>;
}

/// Accepts batches of tagged records and folds them into the counter table.
///
/// Cheap to clone; every intake thread or task can hold its own.
#[derive(Debug, Clone)]
pub struct Ingestor {
    table: Arc<CounterTable>,
    resolver: Arc<GroupKeyResolver>,
    config: Arc<Config>,
}

impl Ingestor {
    /// Aggregate one batch of `(event time, record)` pairs arriving under
    /// `tag`.
    ///
    /// The whole batch is folded locally and merged into the shared table
    /// with a single lock acquisition. A record whose group key cannot be
    /// evaluated is logged and skipped; the rest of the batch is unaffected.
    pub fn ingest(&self, tag: &str, events: &[(u64, Record)]) {
        let mut local: FxHashMap<String, Stats> = FxHashMap::default();
        for (time, record) in events {
            let group_key = match self.resolver.resolve(tag, *time, record) {
                Ok(key) => key,
                Err(error) => {
                    warn!(tag, %error, "dropping record, group key evaluation failed");
                    continue;
                }
            };
            let stats = self.record_stats(record);
            local
                .entry(group_key)
                .and_modify(|entry| entry.merge(&stats))
                .or_insert(stats);
        }
        if local.is_empty() {
            return;
        }
        let scope = match self.config.aggregate {
            Aggregate::All => ALL_SCOPE,
            Aggregate::Tag => tag,
        };
        self.table.merge_batch(scope, local);
    }

    fn record_stats(&self, record: &Record) -> Stats {
        let pick = |key: &Option<String>| {
            key.as_deref()
                .and_then(|field| record.get(field))
                .and_then(numeric)
        };
        Stats::single(
            pick(&self.config.avg_key),
            pick(&self.config.max_key),
            pick(&self.config.min_key),
        )
    }
}

/// The assembled engine, ready to be split into its running parts.
pub struct Engine<C> {
    ingestor: Ingestor,
    scheduler: FlushScheduler<C>,
    controller: shutdown::Controller,
}

impl<C> std::fmt::Debug for Engine<C>
where
    C: std::fmt::Debug,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("ingestor", &self.ingestor)
            .field("scheduler", &self.scheduler)
            .field("controller", &self.controller)
            .finish()
    }
}

impl<C> Engine<C>
where
    C: Clock,
{
    /// Validate `config` and assemble an engine around `clock` and `sink`.
    ///
    /// If a stored snapshot matches the grouping configuration its counters
    /// are restored and the interrupted flush window is rewound, so it still
    /// flushes a full interval after it originally began.
    ///
    /// # Errors
    ///
    /// Returns an error if validation fails or the group-key template or
    /// rewrite patterns do not compile.
    pub fn new(config: Config, clock: C, sink: Box<dyn EmitSink>) -> Result<Self, crate::config::Error> {
        config.validate()?;
        let resolver = GroupKeyResolver::new(
            config.group_by_keys.clone(),
            config.group_by_expression.as_deref(),
            &config.delimiter,
            &config.patterns,
            hostname(),
        )?;
        let config = Arc::new(config);

        let store = config.store_file.clone().map(StateFile::new);
        let now = clock.now();
        let mut last_flush = now;
        let mut table = CounterTable::new();
        if let Some(store) = &store {
            if let Some(snapshot) = store.load(config.aggregate, config.group_by_keys.as_ref()) {
                last_flush = now.saturating_sub(snapshot.saved_duration);
                info!(
                    elapsed_in_window = snapshot.saved_duration,
                    "restored counters from stored snapshot"
                );
                table = CounterTable::restore(snapshot.counters);
            }
        }
        let table = Arc::new(table);

        let (controller, watcher) = shutdown::pair();
        let scheduler = FlushScheduler::new(
            Arc::clone(&table),
            OutputFormatter::new(Arc::clone(&config)),
            sink,
            clock,
            watcher,
            Arc::clone(&config),
            last_flush,
            store,
        );
        let ingestor = Ingestor {
            table,
            resolver: Arc::new(resolver),
            config,
        };
        Ok(Self {
            ingestor,
            scheduler,
            controller,
        })
    }

    /// Split into the intake handle, the flush loop and the shutdown
    /// controller. The scheduler must be driven, typically via
    /// `tokio::spawn(scheduler.spin())`.
    #[must_use]
    pub fn into_parts(self) -> (Ingestor, FlushScheduler<C>, shutdown::Controller) {
        (self.ingestor, self.scheduler, self.controller)
    }
}

/// Best-effort hostname for `${hostname}` template slots.
fn hostname() -> String {
    fs::read_to_string("/proc/sys/kernel/hostname")
        .map(|contents| contents.trim().to_owned())
        .ok()
        .filter(|name| !name.is_empty())
        .or_else(|| env::var("HOSTNAME").ok())
        .unwrap_or_else(|| String::from("localhost"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::RealClock;
    use serde_json::json;

    struct NullSink;

    impl EmitSink for NullSink {
        fn emit(&mut self, _: &str, _: u64, _: &FieldMap) -> Result<(), BoxError> {
            Ok(())
        }
    }

    fn record(entries: &[(&str, serde_json::Value)]) -> Record {
        entries
            .iter()
            .map(|(k, v)| ((*k).to_owned(), v.clone()))
            .collect()
    }

    fn ingestor(config: Config) -> Ingestor {
        let engine =
            Engine::new(config, RealClock, Box::new(NullSink)).expect("engine should build");
        let (ingestor, _scheduler, _controller) = engine.into_parts();
        ingestor
    }

    #[test]
    fn batch_aggregates_by_group_key() {
        let ingestor = ingestor(Config {
            group_by_keys: Some(vec![String::from("code"), String::from("method")]),
            ..Config::default()
        });
        ingestor.ingest(
            "app.web",
            &[
                (0, record(&[("code", json!(200)), ("method", json!("GET"))])),
                (1, record(&[("code", json!(200)), ("method", json!("GET"))])),
                (2, record(&[("code", json!(404)), ("method", json!("GET"))])),
            ],
        );
        let table = ingestor.table.snapshot();
        assert_eq!(table["app.web"]["200_GET"].count, 2);
        assert_eq!(table["app.web"]["404_GET"].count, 1);
    }

    #[test]
    fn all_mode_collapses_tags_into_one_scope() {
        let ingestor = ingestor(Config {
            aggregate: Aggregate::All,
            group_by_keys: Some(vec![String::from("code")]),
            ..Config::default()
        });
        ingestor.ingest("foo.bar", &[(0, record(&[("code", json!(200))]))]);
        ingestor.ingest("foo.baz", &[(0, record(&[("code", json!(200))]))]);
        let table = ingestor.table.snapshot();
        assert_eq!(table.len(), 1);
        assert_eq!(table["all"]["200"].count, 2);
    }

    #[test]
    fn unresolvable_record_is_dropped_not_fatal() {
        let ingestor = ingestor(Config {
            group_by_expression: Some(String::from("${missing}")),
            ..Config::default()
        });
        ingestor.ingest(
            "t",
            &[
                (0, record(&[("other", json!(1))])),
                (1, record(&[("missing", json!("here"))])),
            ],
        );
        let table = ingestor.table.snapshot();
        assert_eq!(table["t"]["here"].count, 1);
        assert_eq!(table["t"].len(), 1);
    }

    #[test]
    fn statistics_come_from_configured_fields() {
        let ingestor = ingestor(Config {
            group_by_keys: Some(vec![String::from("code")]),
            avg_key: Some(String::from("reqtime")),
            max_key: Some(String::from("reqtime")),
            min_key: Some(String::from("reqtime")),
            ..Config::default()
        });
        ingestor.ingest(
            "t",
            &[
                (0, record(&[("code", json!(200)), ("reqtime", json!(0.5))])),
                (1, record(&[("code", json!(200)), ("reqtime", json!("1.5"))])),
                (2, record(&[("code", json!(200)), ("reqtime", json!("bogus"))])),
            ],
        );
        let table = ingestor.table.snapshot();
        let stats = table["t"]["200"];
        assert_eq!(stats.count, 3);
        assert_eq!(stats.sum, Some(2.0));
        assert_eq!(stats.max, Some(1.5));
        assert_eq!(stats.min, Some(0.5));
    }

    #[test]
    fn conflicting_group_by_fails_construction() {
        let config = Config {
            group_by_keys: Some(vec![String::from("code")]),
            group_by_expression: Some(String::from("${code}")),
            ..Config::default()
        };
        assert!(Engine::new(config, RealClock, Box::new(NullSink)).is_err());
    }
}
