//! # Pipeline Events
//!
//! Domain events leave the core through the `EventSink` seam after the
//! transaction that caused them has committed. Delivery is fire-and-forget:
//! the `Pipeline` logs a failed `publish` and carries on.
//!
//! On the wire an event is `{"event": "supply_posted", "flask_id": 12}`.

use crate::types::{CrucibleError, FlaskId};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Mutex, PoisonError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    MetalPrepPosted,
    SupplyPosted,
    CastingComplete,
    QuenchingPosted,
    QuenchingAutoPosted,
    CuttingStaged,
    ReconciliationConfirmed,
}

impl EventKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::MetalPrepPosted => "metal_prep_posted",
            Self::SupplyPosted => "supply_posted",
            Self::CastingComplete => "casting_complete",
            Self::QuenchingPosted => "quenching_posted",
            Self::QuenchingAutoPosted => "quenching_auto_posted",
            Self::CuttingStaged => "cutting_staged",
            Self::ReconciliationConfirmed => "reconciliation_confirmed",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineEvent {
    pub event: EventKind,
    pub flask_id: FlaskId,
}

impl PipelineEvent {
    #[must_use]
    pub const fn new(event: EventKind, flask_id: FlaskId) -> Self {
        Self { event, flask_id }
    }
}

/// Receives committed pipeline events.
pub trait EventSink: Send + Sync {
    fn publish(&self, event: &PipelineEvent) -> Result<(), CrucibleError>;
}

/// Drops every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

impl EventSink for NullSink {
    fn publish(&self, _event: &PipelineEvent) -> Result<(), CrucibleError> {
        Ok(())
    }
}

/// Keeps every event in memory, in publish order.
#[derive(Debug, Default)]
pub struct MemorySink {
    events: Mutex<Vec<PipelineEvent>>,
}

impl MemorySink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of everything published so far.
    #[must_use]
    pub fn events(&self) -> Vec<PipelineEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Remove and return everything published so far.
    pub fn drain(&self) -> Vec<PipelineEvent> {
        std::mem::take(&mut *self.events.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

impl EventSink for MemorySink {
    fn publish(&self, event: &PipelineEvent) -> Result<(), CrucibleError> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(*event);
        Ok(())
    }
}
