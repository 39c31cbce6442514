//! # crucible-core
//!
//! The casting-floor engine for Crucible - THE LOGIC.
//!
//! This crate tracks casting trees and flasks through a fixed production
//! pipeline and keeps the shared scrap reserve for every metal:
//!
//! ```text
//! tree: transit ──► flask: metal_prep ► supply ► casting ► quenching
//!                                                            │
//!                         done ◄ reconciliation ◄ cutting ◄──┘
//! ```
//!
//! ## Layers
//!
//! - `types` / `metal`: entity model, fixed-point quantities, metal catalogue
//! - `composition`: pure tolerance rules that gate Supply, Metal-Prep,
//!   Cutting and Reconciliation
//! - `ledger`: scrap reserve balances plus the append-only movement log
//! - `machine`: the stage machine (`Pipeline`)
//! - `sweep`: automatic promotion of quenched flasks
//! - `storage`: redb tables and transaction helpers
//!
//! ## Architectural Constraints
//!
//! - Every stage transition is exactly one redb write transaction
//! - Reserve balances change only together with a movement row
//! - Integer arithmetic only (milligrams, parts-per-million)
//! - No async, no network dependencies; events leave through `EventSink`

// =============================================================================
// MODULES
// =============================================================================

pub mod clock;
pub mod composition;
pub mod events;
pub mod ledger;
pub mod machine;
pub mod metal;
pub mod primitives;
pub mod storage;
pub mod sweep;
pub mod types;

// =============================================================================
// RE-EXPORTS: Core Types (from types module)
// =============================================================================

pub use types::{
    Actor, Bag, CastingRecord, CrucibleError, CutLosses, CuttingRecord, Flask, FlaskDossier,
    FlaskId, Fraction, MetalPrepRecord, MovementId, MovementSource, QuenchingRecord,
    ReconciliationRecord, ScrapMovement, ScrapReserve, Stage, StageKind, SupplyRecord, Tree,
    TreeId, TreeStatus, UnitRef, WaxingRecord, Weight,
};

// =============================================================================
// RE-EXPORTS: Engine
// =============================================================================

pub use clock::{Clock, ManualClock, SystemClock};
pub use composition::{Composition, CompositionRule, Quantity, ToleranceCheck};
pub use events::{EventKind, EventSink, MemorySink, NullSink, PipelineEvent};
pub use ledger::{AdjustAction, AuditEntry, Ledger, LedgerAudit, MovementFilter, WithdrawalKind};
pub use machine::{
    CastingCompletion, CuttingInput, MetalPrepInput, NewTree, Pipeline, ReconciliationInput,
    SupplyInput, Transition, WaxingInput,
};
pub use metal::{Metal, ready_at};
pub use storage::Store;
pub use sweep::SweepReport;
