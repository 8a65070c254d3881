//! Coordination store shared by the buzzard agent tasks.
//!
//! The store keeps two tables: an append-only log of every container
//! lifecycle event the agent observed, and one compacted row per container
//! derived from that log. Every task opens its own [`Store`]; SQLite in WAL
//! mode with a busy timeout serializes the writers.

mod compact;
mod error;
mod event;
mod state;
mod store;

pub use compact::{CompactionReport, StateChange, plan_compaction};
pub use error::Error;
pub use event::{Action, Interfaces, LifecycleEvent, RecordedEvent, short_id};
pub use state::ContainerState;
pub use store::{DEFAULT_BUSY_TIMEOUT, Store};

pub type Result<T, E = Error> = std::result::Result<T, E>;
