//! chainledger-core — foundation for the exactly-once event ingestion engine.
//!
//! # Architecture
//!
//! ```text
//! SourceWorker (chainledger-engine)
//!     ├── CheckpointManager   (per-source cursors + cycle mutual exclusion)
//!     ├── ReorgDetector       (stored vs canonical block identifiers)
//!     ├── Reconciler          (invalidate + replay non-finalized history)
//!     ├── ConfirmationTracker (finalization below the confirmation horizon)
//!     ├── EventProcessor      (exactly-once apply in stream order)
//!     └── StateStore / EventStore backends (memory / SQLite / Postgres)
//! ```
//!
//! The engine turns at-least-once delivery from an unreliable, reorg-capable
//! log source into exactly-once application of side effects, using only local
//! invariants: idempotent persistence, confirmation-based finalization, and
//! contiguous-prefix cursor commits.

pub mod apply;
pub mod checkpoint;
pub mod confirm;
pub mod error;
pub mod event;
pub mod processor;
pub mod reconcile;
pub mod reorg;
pub mod source;
pub mod state;
pub mod store;

pub use apply::{ApplierRegistry, EventApplier};
pub use checkpoint::{CheckpointManager, CycleToken, ScanRange};
pub use confirm::ConfirmationTracker;
pub use error::IngestError;
pub use event::{IndexedEvent, PersistOutcome, RawLog};
pub use processor::{BatchOutcome, EventProcessor, ExhaustedEvent};
pub use reconcile::{ReconcileReport, Reconciler};
pub use reorg::ReorgDetector;
pub use source::{LogFilter, LogSource, SourceId};
pub use state::{IndexingState, SourceConfig, SourceStatus};
pub use store::{EventStore, MemoryStore, StateStore};
