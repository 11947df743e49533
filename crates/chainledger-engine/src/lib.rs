//! chainledger-engine — per-source worker loop, builder API, and admin surface.
//!
//! One [`SourceWorker`] per source runs the ingestion cycle against any
//! [`LogSource`] and storage backend pair; [`AdminApi`] exposes the read-only
//! and operator-facing surface consumed downstream.
//!
//! [`LogSource`]: chainledger_core::source::LogSource

pub mod admin;
pub mod builder;
pub mod worker;

pub use admin::AdminApi;
pub use builder::WorkerBuilder;
pub use worker::{CycleOutcome, CycleStats, SourceWorker, WorkerConfig};
