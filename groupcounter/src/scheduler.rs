//! The flush loop that turns accumulated counters into emitted records.
//!
//! Scheduling is poll-based. Every half second the scheduler reads the clock
//! and flushes if at least one full interval has passed since the previous
//! flush, so a stalled or suspended process flushes once on resume rather
//! than replaying missed windows. Emission failures are logged and the loop
//! carries on; the failed window's counters are gone, but subsequent windows
//! are unaffected.

use std::sync::Arc;

use tokio::time::Duration;
use tracing::{info, warn};

use crate::clock::Clock;
use crate::config::Config;
use crate::engine::{BoxError, EmitSink};
use crate::output::OutputFormatter;
use crate::persist::{Snapshot, StateFile};
use crate::shutdown;
use crate::table::CounterTable;

/// How often the clock is polled between flushes.
const POLL_PERIOD: Duration = Duration::from_millis(500);

/// Errors produced by one flush attempt.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The downstream sink rejected an emitted record.
    #[error("emission failed: {0}")]
    Emit(#[source] BoxError),
}

/// Periodically drains the counter table and emits the formatted result.
pub struct FlushScheduler<C> {
    table: Arc<CounterTable>,
    formatter: OutputFormatter,
    sink: Box<dyn EmitSink>,
    clock: C,
    shutdown: shutdown::Watcher,
    config: Arc<Config>,
    interval: u64,
    last_flush: u64,
    store: Option<StateFile>,
}

impl<C> std::fmt::Debug for FlushScheduler<C>
where
    C: std::fmt::Debug,
{
    // Written by hand as the sink is an opaque trait object.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlushScheduler")
            .field("clock", &self.clock)
            .field("interval", &self.interval)
            .field("last_flush", &self.last_flush)
            .field("store", &self.store)
            .finish_non_exhaustive()
    }
}

impl<C> FlushScheduler<C>
where
    C: Clock,
{
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        table: Arc<CounterTable>,
        formatter: OutputFormatter,
        sink: Box<dyn EmitSink>,
        clock: C,
        shutdown: shutdown::Watcher,
        config: Arc<Config>,
        last_flush: u64,
        store: Option<StateFile>,
    ) -> Self {
        let interval = config.interval();
        Self {
            table,
            formatter,
            sink,
            clock,
            shutdown,
            config,
            interval,
            last_flush,
            store,
        }
    }

    /// Run the flush loop until shutdown is signaled.
    ///
    /// On exit the live table is persisted to the configured store, if any.
    /// No final flush is forced; unemitted counters travel in the snapshot
    /// instead.
    pub async fn spin(mut self) {
        info!(interval_seconds = self.interval, "flush scheduler running");
        let mut shutdown = self.shutdown.clone();
        loop {
            let poll = self.clock.wait(POLL_PERIOD);
            tokio::select! {
                () = shutdown.recv() => {
                    info!("shutdown signal received");
                    break;
                }
                () = poll => {}
            }
            if let Err(error) = self.maybe_flush() {
                warn!(%error, "flush failed, counters for this window are lost");
            }
        }
        self.persist_on_exit();
    }

    /// Flush if a full interval has elapsed, otherwise do nothing.
    fn maybe_flush(&mut self) -> Result<(), Error> {
        let now = self.clock.now();
        if now.saturating_sub(self.last_flush) < self.interval {
            return Ok(());
        }
        // The new window starts at the actual flush time, not on a fixed
        // grid, so a long stall costs one oversized window and nothing more.
        self.last_flush = now;

        let snapshot = self.table.drain();
        for (tag, fields) in self.formatter.format(&snapshot) {
            if fields.is_empty() {
                continue;
            }
            self.sink.emit(&tag, now, &fields).map_err(Error::Emit)?;
        }
        Ok(())
    }

    fn persist_on_exit(&self) {
        let Some(store) = &self.store else {
            return;
        };
        let now = self.clock.now();
        let snapshot = Snapshot {
            counters: self.table.snapshot(),
            saved_at: now,
            saved_duration: now.saturating_sub(self.last_flush),
            aggregate: self.config.aggregate,
            group_by_keys: self.config.group_by_keys.clone(),
        };
        match store.save(&snapshot) {
            Ok(()) => info!(path = %store.path().display(), "snapshot persisted"),
            Err(error) => {
                warn!(path = %store.path().display(), %error, "failed to persist snapshot");
            }
        }
    }
}
