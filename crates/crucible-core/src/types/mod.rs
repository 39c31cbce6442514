//! # Core Type Definitions
//!
//! This module contains the entity model of the casting floor:
//! - Identifiers (`TreeId`, `FlaskId`, `MovementId`) and the operator `Actor`
//! - Fixed-point quantities (`Weight`, `Fraction`)
//! - Pipeline positions (`Stage`, `TreeStatus`, `StageKind`)
//! - Units (`Tree`, `Flask`, `Bag`) and one record type per stage
//! - Ledger rows (`ScrapReserve`, `ScrapMovement`)
//! - Error types (`CrucibleError`)
//!
//! Every type here is stored with postcard, so none of them use
//! `#[serde(flatten)]` or conditional field skipping.

mod quantity;

pub use quantity::{Fraction, Weight};

use crate::composition::{Quantity, ToleranceCheck};
use crate::metal::Metal;
use crate::primitives::{AUTO_ACTOR, MAX_ACTOR_LENGTH};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

// =============================================================================
// IDENTIFIERS
// =============================================================================

/// Store-assigned identifier of a casting tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TreeId(pub u64);

/// Store-assigned identifier of a flask.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FlaskId(pub u64);

/// Sequence number of a scrap movement. Strictly increasing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MovementId(pub u64);

impl fmt::Display for TreeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for FlaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for MovementId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A reference to either kind of production unit, for error reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitRef {
    Tree(TreeId),
    Flask(FlaskId),
}

impl fmt::Display for UnitRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tree(id) => write!(f, "tree {id}"),
            Self::Flask(id) => write!(f, "flask {id}"),
        }
    }
}

// =============================================================================
// ACTOR
// =============================================================================

/// The operator (or `"auto"`) responsible for a posted record or movement.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Actor(String);

impl Actor {
    /// Validate and wrap an operator name.
    ///
    /// The name is trimmed; it must be non-empty and at most
    /// `MAX_ACTOR_LENGTH` characters.
    pub fn new(name: impl Into<String>) -> Result<Self, CrucibleError> {
        let name = name.into();
        let trimmed = name.trim();
        if trimmed.is_empty() {
            return Err(CrucibleError::ValidationError(
                "actor must not be empty".to_string(),
            ));
        }
        if trimmed.chars().count() > MAX_ACTOR_LENGTH {
            return Err(CrucibleError::ValidationError(format!(
                "actor exceeds {MAX_ACTOR_LENGTH} characters"
            )));
        }
        Ok(Self(trimmed.to_string()))
    }

    /// The actor stamped on rows written by the promotion sweep.
    #[must_use]
    pub fn auto() -> Self {
        Self(AUTO_ACTOR.to_string())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for Actor {
    type Error = CrucibleError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl FromStr for Actor {
    type Err = CrucibleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl From<Actor> for String {
    fn from(actor: Actor) -> Self {
        actor.0
    }
}

impl fmt::Display for Actor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// =============================================================================
// PIPELINE POSITIONS
// =============================================================================

/// Position of a flask in the production pipeline.
///
/// The order of the variants is the only order a flask may move in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    MetalPrep,
    Supply,
    Casting,
    Quenching,
    Cutting,
    Reconciliation,
    Done,
}

impl Stage {
    /// Every stage in pipeline order.
    pub const ALL: [Stage; 7] = [
        Stage::MetalPrep,
        Stage::Supply,
        Stage::Casting,
        Stage::Quenching,
        Stage::Cutting,
        Stage::Reconciliation,
        Stage::Done,
    ];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::MetalPrep => "metal_prep",
            Self::Supply => "supply",
            Self::Casting => "casting",
            Self::Quenching => "quenching",
            Self::Cutting => "cutting",
            Self::Reconciliation => "reconciliation",
            Self::Done => "done",
        }
    }

    /// The stage that follows this one, or `None` for `Done`.
    #[must_use]
    pub const fn next(self) -> Option<Stage> {
        match self {
            Self::MetalPrep => Some(Self::Supply),
            Self::Supply => Some(Self::Casting),
            Self::Casting => Some(Self::Quenching),
            Self::Quenching => Some(Self::Cutting),
            Self::Cutting => Some(Self::Reconciliation),
            Self::Reconciliation => Some(Self::Done),
            Self::Done => None,
        }
    }

    /// Stable one-byte tag used in storage keys.
    #[must_use]
    pub const fn ordinal(self) -> u8 {
        self as u8
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = CrucibleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().replace('-', "_").to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|stage| stage.as_str() == wanted)
            .ok_or_else(|| CrucibleError::ValidationError(format!("unknown stage '{}'", s.trim())))
    }
}

/// Lifecycle of a tree before it is turned into a flask.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TreeStatus {
    InTransit,
    Consumed,
}

impl TreeStatus {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::InTransit => "in_transit",
            Self::Consumed => "consumed",
        }
    }
}

impl fmt::Display for TreeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The kinds of per-flask stage records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    Waxing,
    MetalPrep,
    Supply,
    Casting,
    Quenching,
    Cutting,
    Reconciliation,
}

impl StageKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Waxing => "waxing",
            Self::MetalPrep => "metal_prep",
            Self::Supply => "supply",
            Self::Casting => "casting",
            Self::Quenching => "quenching",
            Self::Cutting => "cutting",
            Self::Reconciliation => "reconciliation",
        }
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// UNITS
// =============================================================================

/// A wax tree received from the waxing room, not yet invested in a flask.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tree {
    pub id: TreeId,
    /// Operator-facing number, unique across all trees.
    pub number: String,
    pub metal: Metal,
    pub gasket: Weight,
    pub total: Weight,
    /// `total - gasket`.
    pub tree_weight: Weight,
    /// Metal required to cast this tree.
    pub estimated_metal_weight: Weight,
    pub status: TreeStatus,
    pub bags: BTreeSet<String>,
    pub created_at: DateTime<Utc>,
    pub created_by: Actor,
}

/// A flask travelling through the pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Flask {
    pub id: FlaskId,
    /// Operator-facing number, unique per calendar date.
    pub number: String,
    pub date: NaiveDate,
    pub metal: Metal,
    pub status: Stage,
    /// The tree this flask was invested from.
    pub tree: Option<TreeId>,
    pub bags: BTreeSet<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A bag tag attached to a tree and, later, to the flask derived from it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bag {
    pub label: String,
    pub tree: TreeId,
    pub flask: Option<FlaskId>,
}

// =============================================================================
// STAGE RECORDS
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WaxingRecord {
    pub gasket: Weight,
    pub tree_weight: Weight,
    /// Required metal weight, derived from the tree weight and the metal.
    pub metal_weight: Weight,
    pub posted_at: DateTime<Utc>,
    pub posted_by: Actor,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetalPrepRecord {
    /// When false the plan is informational and nothing is held.
    pub prepared: bool,
    pub scrap_planned: Weight,
    pub fine_planned: Weight,
    pub alloy_planned: Weight,
    /// Scrap currently held from the reserve for this flask.
    pub held: Weight,
    pub posted_at: DateTime<Utc>,
    pub posted_by: Actor,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SupplyRecord {
    pub required: Weight,
    pub scrap: Weight,
    pub fine: Weight,
    pub alloy: Weight,
    /// `fine + alloy`.
    pub fresh: Weight,
    pub posted_at: DateTime<Utc>,
    pub posted_by: Actor,
}

impl SupplyRecord {
    /// Total metal that went into the flask.
    #[must_use]
    pub fn supplied(&self) -> Weight {
        self.scrap + self.fresh
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CastingRecord {
    /// Degrees Celsius.
    pub casting_temp: u16,
    /// Degrees Celsius.
    pub oven_temp: u16,
    pub completed_at: DateTime<Utc>,
    pub posted_by: Actor,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuenchingRecord {
    pub minutes: u32,
    pub ready_at: DateTime<Utc>,
    pub posted_at: DateTime<Utc>,
    pub posted_by: Actor,
    pub promoted_at: Option<DateTime<Utc>>,
    /// Operator who moved the flask on, or `"auto"` for the sweep.
    pub promoted_by: Option<Actor>,
}

/// The three loss figures derived from cut weights.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CutLosses {
    /// `supplied - before_cut`
    pub loss_i: Weight,
    /// `before_cut - (after_cast + after_scrap)`
    pub loss_ii: Weight,
    /// `supplied - after_cast - after_scrap`
    pub loss_total: Weight,
}

impl CutLosses {
    #[must_use]
    pub fn compute(
        supplied: Weight,
        before_cut: Weight,
        after_cast: Weight,
        after_scrap: Weight,
    ) -> Self {
        Self {
            loss_i: supplied - before_cut,
            loss_ii: before_cut - (after_cast + after_scrap),
            loss_total: supplied - after_cast - after_scrap,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CuttingRecord {
    pub before_cut: Weight,
    pub after_cast: Weight,
    pub after_scrap: Weight,
    pub loss: Weight,
    pub posted_at: DateTime<Utc>,
    pub posted_by: Actor,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconciliationRecord {
    pub supplied: Weight,
    pub before_cut: Weight,
    pub after_cast: Weight,
    pub after_scrap: Weight,
    pub losses: CutLosses,
    /// False while staged by Cutting, true once confirmed.
    pub confirmed: bool,
    pub posted_at: DateTime<Utc>,
    pub posted_by: Actor,
    pub confirmed_at: Option<DateTime<Utc>>,
    pub confirmed_by: Option<Actor>,
}

/// A flask together with every stage record it has so far.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlaskDossier {
    pub flask: Flask,
    pub waxing: Option<WaxingRecord>,
    pub metal_prep: Option<MetalPrepRecord>,
    pub supply: Option<SupplyRecord>,
    pub casting: Option<CastingRecord>,
    pub quenching: Option<QuenchingRecord>,
    pub cutting: Option<CuttingRecord>,
    pub reconciliation: Option<ReconciliationRecord>,
}

// =============================================================================
// LEDGER ROWS
// =============================================================================

/// Scrap on hand for one metal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScrapReserve {
    pub metal: Metal,
    pub quantity: Weight,
}

/// Why a reserve balance changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MovementSource {
    #[serde(rename = "prep.hold")]
    PrepHold,
    #[serde(rename = "prep.release")]
    PrepRelease,
    #[serde(rename = "supply.consume_delta")]
    SupplyConsumeDelta,
    #[serde(rename = "reconciliation.credit")]
    ReconciliationCredit,
    #[serde(rename = "adjust.add")]
    AdjustAdd,
    #[serde(rename = "adjust.remove")]
    AdjustRemove,
}

impl MovementSource {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::PrepHold => "prep.hold",
            Self::PrepRelease => "prep.release",
            Self::SupplyConsumeDelta => "supply.consume_delta",
            Self::ReconciliationCredit => "reconciliation.credit",
            Self::AdjustAdd => "adjust.add",
            Self::AdjustRemove => "adjust.remove",
        }
    }
}

impl fmt::Display for MovementSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One append-only row of the scrap movement log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScrapMovement {
    pub id: MovementId,
    pub metal: Metal,
    pub flask: Option<FlaskId>,
    /// Signed change: negative for hold/consume, positive for release/credit.
    pub delta: Weight,
    pub source: MovementSource,
    pub actor: Actor,
    pub at: DateTime<Utc>,
    /// Reserve balance after this movement was applied.
    pub balance_after: Weight,
}

// =============================================================================
// ERROR TYPES
// =============================================================================

/// Errors that can occur on the casting floor.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CrucibleError {
    /// The unit is not in the stage the operation requires.
    #[error("{unit} is in stage '{actual}', expected '{expected}'")]
    PreconditionFailed {
        unit: UnitRef,
        expected: &'static str,
        actual: &'static str,
    },

    /// A hold, consume or removal would drive the reserve negative.
    #[error("insufficient {metal} scrap: requested {requested} g, available {available} g")]
    InsufficientReserve {
        metal: Metal,
        requested: Weight,
        available: Weight,
    },

    /// A weight or ratio fell outside its ±5 % band.
    #[error("{check} out of tolerance: {computed} not within {low}..={high} (expected {expected})")]
    ToleranceExceeded {
        check: ToleranceCheck,
        computed: Quantity,
        expected: Quantity,
        low: Quantity,
        high: Quantity,
    },

    /// A stage record this operation derives from does not exist.
    #[error("flask {flask} has no {stage} record")]
    MissingUpstreamRecord { flask: FlaskId, stage: StageKind },

    /// Malformed or out-of-range input.
    #[error("Validation error: {0}")]
    ValidationError(String),

    /// The referenced tree or flask does not exist.
    #[error("{0} not found")]
    NotFound(UnitRef),

    /// A uniqueness rule was violated (tree number, flask number, bag label).
    #[error("Conflict: {0}")]
    Conflict(String),

    /// A serialization or deserialization error occurred.
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// A storage or I/O error occurred.
    #[error("I/O error: {0}")]
    IoError(String),
}

impl CrucibleError {
    /// Stable machine-readable name of the variant.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::PreconditionFailed { .. } => "precondition_failed",
            Self::InsufficientReserve { .. } => "insufficient_reserve",
            Self::ToleranceExceeded { .. } => "tolerance_exceeded",
            Self::MissingUpstreamRecord { .. } => "missing_upstream_record",
            Self::ValidationError(_) => "validation_error",
            Self::NotFound(_) => "not_found",
            Self::Conflict(_) => "conflict",
            Self::SerializationError(_) => "serialization_error",
            Self::IoError(_) => "io_error",
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================
