//! Streaming group aggregation over tagged event records.
//!
//! Records flow in as `(tag, time, fields)` batches, are bucketed by a
//! configurable group key and scope, and counters accumulate per bucket:
//! occurrence counts always, max/min/average over configured numeric fields
//! when asked for. A background scheduler flushes the table on a fixed
//! interval and hands the flattened result to a host-supplied sink. State
//! can optionally survive restarts through a snapshot file.
//!
//! Typical wiring:
//!
//! ```no_run
//! use groupcounter::{Config, Engine, EmitSink, FieldMap, RealClock};
//!
//! struct PrintSink;
//!
//! impl EmitSink for PrintSink {
//!     fn emit(
//!         &mut self,
//!         tag: &str,
//!         timestamp: u64,
//!         fields: &FieldMap,
//!     ) -> Result<(), groupcounter::BoxError> {
//!         tracing::info!(tag, timestamp, ?fields, "flush");
//!         Ok(())
//!     }
//! }
//!
//! # async fn run() -> Result<(), groupcounter::ConfigError> {
//! let config = groupcounter::config::load_config_from_str("group_by_keys: [code]")?;
//! let engine = Engine::new(config, RealClock, Box::new(PrintSink))?;
//! let (ingestor, scheduler, controller) = engine.into_parts();
//! let flusher = tokio::spawn(scheduler.spin());
//! // ... feed batches through `ingestor.ingest(...)` ...
//! controller.signal();
//! let _ = flusher.await;
//! # Ok(())
//! # }
//! ```

#![deny(clippy::all)]
#![deny(clippy::cargo)]
#![deny(clippy::pedantic)]
#![deny(clippy::print_stdout)]
#![deny(clippy::print_stderr)]
#![deny(clippy::dbg_macro)]
#![deny(clippy::unwrap_used)]
#![deny(unused_extern_crates)]
#![deny(unused_allocation)]
#![deny(unused_assignments)]
#![deny(unused_comparisons)]
#![deny(unreachable_pub)]
#![deny(missing_docs)]
#![deny(missing_copy_implementations)]
#![deny(missing_debug_implementations)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::multiple_crate_versions)]

pub mod accumulator;
pub mod clock;
pub mod config;
pub mod engine;
pub mod group_key;
pub mod output;
pub mod persist;
pub mod scheduler;
pub mod shutdown;
pub mod table;

pub use accumulator::Stats;
pub use clock::{Clock, RealClock};
pub use config::{Aggregate, Config, Error as ConfigError, Unit};
pub use engine::{BoxError, EmitSink, Engine, FieldMap, Ingestor, Record};
pub use group_key::GroupKeyResolver;
pub use output::OutputFormatter;
pub use persist::{Snapshot, StateFile};
pub use scheduler::FlushScheduler;
pub use table::{CounterTable, Table};
