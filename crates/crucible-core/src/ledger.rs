//! # Scrap Ledger
//!
//! The shared scrap reserve of every metal and its append-only movement log.
//!
//! A `Ledger` borrows the write transaction of the stage transition that
//! motivated it, so reserve changes commit or roll back together with the
//! stage record. Every balance change writes exactly one `ScrapMovement`
//! carrying the resulting balance; a zero change writes nothing.
//!
//! ## Invariants
//!
//! - A balance never goes below zero (`InsufficientReserve` instead)
//! - A balance always equals the signed sum of its movements
//!   (`Store::audit` recomputes this from the log)

use crate::metal::Metal;
use crate::storage::{
    MOVEMENTS, NEXT_MOVEMENT_ID, RESERVES, Store, all_rows, encode, io_err, next_id,
};
use crate::types::{
    Actor, CrucibleError, FlaskId, MovementId, MovementSource, ScrapMovement, ScrapReserve, Weight,
};
use chrono::{DateTime, Utc};
use redb::{ReadableTable, WriteTransaction};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use tracing::debug;

// =============================================================================
// OPERATION KINDS
// =============================================================================

/// What a flask's withdrawal from the reserve is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WithdrawalKind {
    /// Set aside during Metal-Prep.
    Hold,
    /// Melted during Supply.
    Consume,
}

/// Direction of a manual reserve correction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AdjustAction {
    Add,
    Remove,
}

impl fmt::Display for AdjustAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Add => "add",
            Self::Remove => "remove",
        })
    }
}

impl FromStr for AdjustAction {
    type Err = CrucibleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "add" => Ok(Self::Add),
            "remove" => Ok(Self::Remove),
            other => Err(CrucibleError::ValidationError(format!(
                "action must be 'add' or 'remove', got '{other}'"
            ))),
        }
    }
}

// =============================================================================
// LEDGER (write side)
// =============================================================================

/// Reserve operations bound to one open write transaction.
pub struct Ledger<'txn> {
    txn: &'txn WriteTransaction,
    actor: Actor,
    at: DateTime<Utc>,
    flask: Option<FlaskId>,
}

impl<'txn> Ledger<'txn> {
    pub(crate) fn new(txn: &'txn WriteTransaction, actor: Actor, at: DateTime<Utc>) -> Self {
        Self {
            txn,
            actor,
            at,
            flask: None,
        }
    }

    /// Attribute subsequent movements to a flask.
    #[must_use]
    pub(crate) fn for_flask(mut self, flask: FlaskId) -> Self {
        self.flask = Some(flask);
        self
    }

    /// Set scrap aside for a flask being prepared.
    pub fn hold(&self, metal: Metal, amount: Weight) -> Result<Option<ScrapMovement>, CrucibleError> {
        let amount = non_negative(amount)?;
        self.apply(metal, -amount, MovementSource::PrepHold)
    }

    /// Melt scrap into a flask.
    pub fn consume(
        &self,
        metal: Metal,
        amount: Weight,
    ) -> Result<Option<ScrapMovement>, CrucibleError> {
        let amount = non_negative(amount)?;
        self.apply(metal, -amount, MovementSource::SupplyConsumeDelta)
    }

    /// Return scrap previously held or consumed.
    pub fn release(
        &self,
        metal: Metal,
        amount: Weight,
        from: WithdrawalKind,
    ) -> Result<Option<ScrapMovement>, CrucibleError> {
        let amount = non_negative(amount)?;
        let source = match from {
            WithdrawalKind::Hold => MovementSource::PrepRelease,
            WithdrawalKind::Consume => MovementSource::SupplyConsumeDelta,
        };
        self.apply(metal, amount, source)
    }

    /// Add reclaimed scrap after a cast has been reconciled.
    pub fn credit(
        &self,
        metal: Metal,
        amount: Weight,
    ) -> Result<Option<ScrapMovement>, CrucibleError> {
        let amount = non_negative(amount)?;
        self.apply(metal, amount, MovementSource::ReconciliationCredit)
    }

    /// Move a flask's withdrawal from `previous` to `target`, applying only
    /// the difference.
    pub fn rebalance(
        &self,
        metal: Metal,
        kind: WithdrawalKind,
        previous: Weight,
        target: Weight,
    ) -> Result<Option<ScrapMovement>, CrucibleError> {
        let previous = non_negative(previous)?;
        let target = non_negative(target)?;
        let delta = target - previous;
        if delta.is_positive() {
            match kind {
                WithdrawalKind::Hold => self.hold(metal, delta),
                WithdrawalKind::Consume => self.consume(metal, delta),
            }
        } else if delta.is_negative() {
            self.release(metal, -delta, kind)
        } else {
            Ok(None)
        }
    }

    /// Manual correction by an operator.
    pub fn adjust(
        &self,
        metal: Metal,
        action: AdjustAction,
        amount: Weight,
    ) -> Result<Option<ScrapMovement>, CrucibleError> {
        let amount = non_negative(amount)?;
        match action {
            AdjustAction::Add => self.apply(metal, amount, MovementSource::AdjustAdd),
            AdjustAction::Remove => self.apply(metal, -amount, MovementSource::AdjustRemove),
        }
    }

    /// The single place a balance changes.
    fn apply(
        &self,
        metal: Metal,
        delta: Weight,
        source: MovementSource,
    ) -> Result<Option<ScrapMovement>, CrucibleError> {
        if delta.is_zero() {
            return Ok(None);
        }

        let balance_after = {
            let mut reserves = self.txn.open_table(RESERVES).map_err(io_err)?;
            let current = reserves
                .get(metal.ordinal())
                .map_err(io_err)?
                .map(|v| v.value())
                .unwrap_or(0);
            let next = current.checked_add(delta.milligrams()).ok_or_else(|| {
                CrucibleError::ValidationError(format!("{metal} reserve would overflow"))
            })?;
            if next < 0 {
                return Err(CrucibleError::InsufficientReserve {
                    metal,
                    requested: -delta,
                    available: Weight::from_milligrams(current),
                });
            }
            reserves.insert(metal.ordinal(), next).map_err(io_err)?;
            Weight::from_milligrams(next)
        };

        let movement = ScrapMovement {
            id: MovementId(next_id(self.txn, NEXT_MOVEMENT_ID)?),
            metal,
            flask: self.flask,
            delta,
            source,
            actor: self.actor.clone(),
            at: self.at,
            balance_after,
        };
        let bytes = encode(&movement)?;
        {
            let mut log = self.txn.open_table(MOVEMENTS).map_err(io_err)?;
            log.insert(movement.id.0, bytes.as_slice()).map_err(io_err)?;
        }

        debug!(
            metal = %metal,
            delta = %delta,
            balance = %balance_after,
            source = %source,
            flask = ?self.flask.map(|f| f.0),
            "scrap movement"
        );
        Ok(Some(movement))
    }
}

fn non_negative(amount: Weight) -> Result<Weight, CrucibleError> {
    if amount.is_negative() {
        return Err(CrucibleError::ValidationError(format!(
            "amount must not be negative (got {amount})"
        )));
    }
    Ok(amount)
}

// =============================================================================
// READ SIDE
// =============================================================================

/// Which movements to list.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MovementFilter {
    pub metal: Option<Metal>,
    pub flask: Option<FlaskId>,
    /// Keep only the most recent `limit` matches.
    pub limit: Option<usize>,
}

impl MovementFilter {
    fn matches(&self, movement: &ScrapMovement) -> bool {
        self.metal.is_none_or(|m| m == movement.metal)
            && self.flask.is_none_or(|f| movement.flask == Some(f))
    }
}

/// Ledger consistency for one metal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub metal: Metal,
    /// Balance stored in the reserve table.
    pub recorded: Weight,
    /// Signed sum of the metal's movements.
    pub computed: Weight,
    pub movements: usize,
    /// Every movement's `balance_after` follows from the one before it.
    pub chain_intact: bool,
}

impl AuditEntry {
    #[must_use]
    pub fn is_consistent(&self) -> bool {
        self.recorded == self.computed && self.chain_intact && !self.recorded.is_negative()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerAudit {
    pub entries: Vec<AuditEntry>,
}

impl LedgerAudit {
    #[must_use]
    pub fn is_consistent(&self) -> bool {
        self.entries.iter().all(AuditEntry::is_consistent)
    }
}

impl Store {
    /// Scrap on hand for every metal, in catalogue order.
    pub fn reserves(&self) -> Result<Vec<ScrapReserve>, CrucibleError> {
        let txn = self.read()?;
        let table = txn.open_table(RESERVES).map_err(io_err)?;
        let mut reserves = Vec::with_capacity(Metal::ALL.len());
        for metal in Metal::ALL {
            let mg = table
                .get(metal.ordinal())
                .map_err(io_err)?
                .map(|v| v.value())
                .unwrap_or(0);
            reserves.push(ScrapReserve {
                metal,
                quantity: Weight::from_milligrams(mg),
            });
        }
        Ok(reserves)
    }

    pub fn reserve(&self, metal: Metal) -> Result<Weight, CrucibleError> {
        let txn = self.read()?;
        let table = txn.open_table(RESERVES).map_err(io_err)?;
        let mg = table
            .get(metal.ordinal())
            .map_err(io_err)?
            .map(|v| v.value())
            .unwrap_or(0);
        Ok(Weight::from_milligrams(mg))
    }

    /// Movements in log order (oldest first).
    pub fn movements(&self, filter: &MovementFilter) -> Result<Vec<ScrapMovement>, CrucibleError> {
        let txn = self.read()?;
        let table = txn.open_table(MOVEMENTS).map_err(io_err)?;
        let mut matched: Vec<ScrapMovement> = all_rows(&table)?
            .into_iter()
            .filter(|m| filter.matches(m))
            .collect();
        if let Some(limit) = filter.limit {
            let skip = matched.len().saturating_sub(limit);
            matched.drain(..skip);
        }
        Ok(matched)
    }

    /// Recompute every balance from the movement log.
    pub fn audit(&self) -> Result<LedgerAudit, CrucibleError> {
        let movements = self.movements(&MovementFilter::default())?;
        let mut per_metal: BTreeMap<Metal, (Weight, usize, bool)> = BTreeMap::new();
        for movement in &movements {
            let (sum, count, intact) = per_metal
                .entry(movement.metal)
                .or_insert((Weight::ZERO, 0, true));
            *sum += movement.delta;
            *count += 1;
            *intact = *intact && *sum == movement.balance_after;
        }

        let entries = self
            .reserves()?
            .into_iter()
            .map(|reserve| {
                let (computed, movements, chain_intact) = per_metal
                    .get(&reserve.metal)
                    .copied()
                    .unwrap_or((Weight::ZERO, 0, true));
                AuditEntry {
                    metal: reserve.metal,
                    recorded: reserve.quantity,
                    computed,
                    movements,
                    chain_intact,
                }
            })
            .collect();
        Ok(LedgerAudit { entries })
    }
}

// =============================================================================
// TESTS
// =============================================================================
