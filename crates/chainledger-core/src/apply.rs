//! Apply-function dispatch — the pluggable business mutation per event type.
//!
//! The engine does not know what an event means; it guarantees the applier
//! for a source's event type is invoked at most once per stored event, in
//! stream order. Appliers own the derived application state (balances,
//! claims, distributions) and its schema.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::IngestError;
use crate::event::{IndexedEvent, RawLog};

/// A business mutation for one event type.
#[async_trait]
pub trait EventApplier: Send + Sync {
    /// The event type this applier owns (e.g. `"Transfer"`).
    fn event_type(&self) -> &str;

    /// Decode a raw log into the stored `parsed_data` payload.
    ///
    /// The default keeps the raw topics/data untouched.
    fn decode(&self, raw: &RawLog) -> Result<Value, IngestError> {
        Ok(raw.payload())
    }

    /// Apply the mutation for one finalized event.
    ///
    /// Invoked at most once per stored event; a returned error is retried up
    /// to the source's retry budget, so the implementation must either commit
    /// fully or leave no trace.
    async fn apply(&self, event: &IndexedEvent) -> Result<(), IngestError>;
}

impl std::fmt::Debug for dyn EventApplier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventApplier")
            .field("event_type", &self.event_type())
            .finish_non_exhaustive()
    }
}

/// Fixed dispatch table from event type to applier.
///
/// Populated once at startup; workers resolve their applier at construction
/// and never consult the table again.
#[derive(Default)]
pub struct ApplierRegistry {
    appliers: HashMap<String, Arc<dyn EventApplier>>,
}

impl ApplierRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an applier; replaces any previous applier for the same type.
    pub fn register(&mut self, applier: Arc<dyn EventApplier>) {
        self.appliers
            .insert(applier.event_type().to_string(), applier);
    }

    pub fn get(&self, event_type: &str) -> Option<Arc<dyn EventApplier>> {
        self.appliers.get(event_type).cloned()
    }

    /// Resolve an applier or fail — called when a worker is built.
    pub fn resolve(&self, event_type: &str) -> Result<Arc<dyn EventApplier>, IngestError> {
        self.get(event_type)
            .ok_or_else(|| IngestError::MissingApplier(event_type.to_string()))
    }

    pub fn len(&self) -> usize {
        self.appliers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.appliers.is_empty()
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
