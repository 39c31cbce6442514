//! # Stage Machine
//!
//! `Pipeline` owns the floor database and moves units through the fixed
//! stage order. Every transition:
//!
//! 1. loads the flask and checks it is in the required stage
//! 2. loads or derives its inputs (upstream records, metal formulas)
//! 3. upserts the stage record
//! 4. performs ledger work through a `Ledger` bound to the same transaction
//! 5. advances the status and stamps `updated_at`
//! 6. commits (any error aborts all of the above)
//! 7. publishes one event through the `EventSink`, best effort
//!
//! Operators correct mistakes by re-posting; records are keyed by flask and
//! overwritten, and ledger work is always the delta against what the flask
//! already holds or consumed.

use crate::clock::{Clock, SystemClock};
use crate::composition::{Composition, require_weight, validate_composition, validate_cut};
use crate::events::{EventKind, EventSink, NullSink, PipelineEvent};
use crate::ledger::{AdjustAction, Ledger, WithdrawalKind};
use crate::metal::{Metal, ready_at};
use crate::primitives::{
    DEFAULT_PROMOTION_GRACE_SECS, MAX_BAG_LABEL_LENGTH, MAX_BAGS_PER_UNIT, MAX_NUMBER_LENGTH,
};
use crate::storage::{
    NEXT_FLASK_ID, NEXT_TREE_ID, Store, attach_bag_to_flask, claim_bag, claim_flask_number,
    claim_tree_number, load_flask, load_record, load_tree, next_id, require_record, save_flask,
    save_record, save_tree,
};
use crate::types::{
    Actor, CastingRecord, CrucibleError, CuttingRecord, Flask, FlaskId, MetalPrepRecord,
    QuenchingRecord, ReconciliationRecord, ScrapMovement, Stage, SupplyRecord, Tree, TreeId,
    TreeStatus, UnitRef, WaxingRecord, Weight,
};
use chrono::{DateTime, Duration, NaiveDate, Utc};
use redb::WriteTransaction;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

// =============================================================================
// INPUTS
// =============================================================================

/// A tree arriving from the waxing room.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewTree {
    pub number: String,
    pub metal: Metal,
    pub gasket: Weight,
    pub total: Weight,
    #[serde(default)]
    pub bags: Vec<String>,
    pub actor: Actor,
}

/// Invest a tree into a new flask.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WaxingInput {
    pub tree: TreeId,
    pub flask_number: String,
    pub date: NaiveDate,
    pub actor: Actor,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetalPrepInput {
    pub prepared: bool,
    #[serde(default)]
    pub scrap: Weight,
    #[serde(default)]
    pub fine: Weight,
    #[serde(default)]
    pub alloy: Weight,
    pub actor: Actor,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SupplyInput {
    #[serde(default)]
    pub scrap: Weight,
    #[serde(default)]
    pub fine: Weight,
    #[serde(default)]
    pub alloy: Weight,
    pub actor: Actor,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CuttingInput {
    pub before_cut: Weight,
    pub after_cast: Weight,
    pub after_scrap: Weight,
    pub actor: Actor,
}

/// Final figures. Omitted weights fall back to the values staged by Cutting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconciliationInput {
    #[serde(default)]
    pub supplied: Option<Weight>,
    #[serde(default)]
    pub before_cut: Option<Weight>,
    #[serde(default)]
    pub after_cast: Option<Weight>,
    #[serde(default)]
    pub after_scrap: Option<Weight>,
    pub actor: Actor,
}

// =============================================================================
// OUTPUTS
// =============================================================================

/// Result of a committed transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Transition<R> {
    /// The flask after the transition.
    pub flask: Flask,
    /// The record that was upserted.
    pub record: R,
    /// Ledger movements written by the transition, in order.
    pub movements: Vec<ScrapMovement>,
}

/// Both records written when casting completes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CastingCompletion {
    pub casting: CastingRecord,
    pub quenching: QuenchingRecord,
}

// =============================================================================
// PIPELINE
// =============================================================================

/// The stage machine.
///
/// `Send + Sync`; share it behind an `Arc`.
pub struct Pipeline {
    store: Store,
    sink: Arc<dyn EventSink>,
    clock: Arc<dyn Clock>,
    grace: Duration,
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field("store", &self.store)
            .field("grace_secs", &self.grace.num_seconds())
            .finish_non_exhaustive()
    }
}

impl Pipeline {
    /// Open the floor database at `path` with a wall clock and no event sink.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, CrucibleError> {
        Ok(Self::new(Store::open(path)?))
    }

    #[must_use]
    pub fn new(store: Store) -> Self {
        Self {
            store,
            sink: Arc::new(NullSink),
            clock: Arc::new(SystemClock),
            grace: Duration::seconds(DEFAULT_PROMOTION_GRACE_SECS),
        }
    }

    #[must_use]
    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// How long a flask must have been ready before the sweep promotes it.
    #[must_use]
    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    #[must_use]
    pub fn store(&self) -> &Store {
        &self.store
    }

    #[must_use]
    pub fn grace(&self) -> Duration {
        self.grace
    }

    #[must_use]
    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    // =========================================================================
    // TREE INTAKE AND WAXING
    // =========================================================================

    /// Register a tree in transit.
    pub fn intake_tree(&self, input: NewTree) -> Result<Tree, CrucibleError> {
        let number = unit_number("tree number", &input.number)?;
        let gasket = require_weight("gasket", input.gasket)?;
        let total = require_weight("total", input.total)?;
        let tree_weight = total - gasket;
        if tree_weight.is_negative() {
            return Err(CrucibleError::ValidationError(format!(
                "total ({total}) must not be less than gasket ({gasket})"
            )));
        }
        let bags = bag_labels(&input.bags)?;
        let now = self.clock.now();

        let tree = self.store.write(|txn| {
            let id = TreeId(next_id(txn, NEXT_TREE_ID)?);
            claim_tree_number(txn, &number, id)?;
            for label in &bags {
                claim_bag(txn, label, id)?;
            }
            let tree = Tree {
                id,
                number: number.clone(),
                metal: input.metal,
                gasket,
                total,
                tree_weight,
                estimated_metal_weight: input.metal.estimated_metal_weight(tree_weight),
                status: TreeStatus::InTransit,
                bags: bags.clone(),
                created_at: now,
                created_by: input.actor.clone(),
            };
            save_tree(txn, &tree)?;
            Ok(tree)
        })?;

        info!(
            tree = tree.id.0,
            number = %tree.number,
            metal = %tree.metal,
            estimated = %tree.estimated_metal_weight,
            "tree received"
        );
        Ok(tree)
    }

    /// Turn a tree in transit into a flask waiting for metal prep.
    pub fn post_waxing(&self, input: WaxingInput) -> Result<Transition<WaxingRecord>, CrucibleError> {
        let number = unit_number("flask number", &input.flask_number)?;
        let now = self.clock.now();

        let transition = self.store.write(|txn| {
            let mut tree = load_tree(txn, input.tree)?;
            if tree.status != TreeStatus::InTransit {
                return Err(CrucibleError::PreconditionFailed {
                    unit: UnitRef::Tree(tree.id),
                    expected: TreeStatus::InTransit.as_str(),
                    actual: tree.status.as_str(),
                });
            }

            let id = FlaskId(next_id(txn, NEXT_FLASK_ID)?);
            claim_flask_number(txn, input.date, &number, id)?;

            let flask = Flask {
                id,
                number: number.clone(),
                date: input.date,
                metal: tree.metal,
                status: Stage::MetalPrep,
                tree: Some(tree.id),
                bags: tree.bags.clone(),
                created_at: now,
                updated_at: now,
            };
            save_flask(txn, &flask, None)?;

            let record = WaxingRecord {
                gasket: tree.gasket,
                tree_weight: tree.tree_weight,
                metal_weight: tree.estimated_metal_weight,
                posted_at: now,
                posted_by: input.actor.clone(),
            };
            save_record(txn, id, &record)?;

            for label in &tree.bags {
                attach_bag_to_flask(txn, label, id)?;
            }
            tree.status = TreeStatus::Consumed;
            save_tree(txn, &tree)?;

            Ok(Transition {
                flask,
                record,
                movements: Vec::new(),
            })
        })?;

        info!(
            tree = input.tree.0,
            flask = transition.flask.id.0,
            number = %transition.flask.number,
            date = %transition.flask.date,
            "tree invested into flask"
        );
        Ok(transition)
    }

    // =========================================================================
    // FLASK STAGES
    // =========================================================================

    /// Plan the metal for a flask and hold the planned scrap.
    ///
    /// With `prepared == false` the plan is recorded without validation and
    /// any earlier hold is released.
    pub fn post_metal_prep(
        &self,
        id: FlaskId,
        input: MetalPrepInput,
    ) -> Result<Transition<MetalPrepRecord>, CrucibleError> {
        let composition = Composition::new(input.scrap, input.fine, input.alloy);
        composition.ensure_in_range()?;

        self.transition(id, Stage::MetalPrep, EventKind::MetalPrepPosted, |txn, flask, now| {
            let waxing: WaxingRecord = require_record(txn, id)?;
            if input.prepared {
                validate_composition(flask.metal.composition_rule(), &composition, waxing.metal_weight)?;
            }

            let previous = load_record::<MetalPrepRecord>(txn, id)?
                .map(|r| r.held)
                .unwrap_or(Weight::ZERO);
            let target = if input.prepared { input.scrap } else { Weight::ZERO };
            let movements = Ledger::new(txn, input.actor.clone(), now)
                .for_flask(id)
                .rebalance(flask.metal, WithdrawalKind::Hold, previous, target)?
                .into_iter()
                .collect();

            let record = MetalPrepRecord {
                prepared: input.prepared,
                scrap_planned: input.scrap,
                fine_planned: input.fine,
                alloy_planned: input.alloy,
                held: target,
                posted_at: now,
                posted_by: input.actor.clone(),
            };
            save_record(txn, id, &record)?;
            Ok((record, movements))
        })
    }

    /// Declare what actually went into the crucible and consume the scrap.
    ///
    /// Only the difference against what this flask already withdrew (an
    /// earlier Supply, otherwise the Metal-Prep hold) touches the reserve.
    pub fn post_supply(
        &self,
        id: FlaskId,
        input: SupplyInput,
    ) -> Result<Transition<SupplyRecord>, CrucibleError> {
        let composition = Composition::new(input.scrap, input.fine, input.alloy);

        self.transition(id, Stage::Supply, EventKind::SupplyPosted, |txn, flask, now| {
            let waxing: WaxingRecord = require_record(txn, id)?;
            validate_composition(flask.metal.composition_rule(), &composition, waxing.metal_weight)?;

            let previous = match load_record::<SupplyRecord>(txn, id)? {
                Some(supply) => supply.scrap,
                None => load_record::<MetalPrepRecord>(txn, id)?
                    .map(|prep| prep.held)
                    .unwrap_or(Weight::ZERO),
            };
            let movements = Ledger::new(txn, input.actor.clone(), now)
                .for_flask(id)
                .rebalance(flask.metal, WithdrawalKind::Consume, previous, input.scrap)?
                .into_iter()
                .collect();

            let record = SupplyRecord {
                required: waxing.metal_weight,
                scrap: input.scrap,
                fine: input.fine,
                alloy: input.alloy,
                fresh: composition.fresh(),
                posted_at: now,
                posted_by: input.actor.clone(),
            };
            save_record(txn, id, &record)?;
            Ok((record, movements))
        })
    }

    /// Record the pour and start the quench timer.
    pub fn complete_casting(
        &self,
        id: FlaskId,
        actor: Actor,
    ) -> Result<Transition<CastingCompletion>, CrucibleError> {
        self.transition(id, Stage::Casting, EventKind::CastingComplete, |txn, flask, now| {
            let metal = flask.metal;
            let casting = CastingRecord {
                casting_temp: metal.casting_temperature(),
                oven_temp: metal.oven_temperature(),
                completed_at: now,
                posted_by: actor.clone(),
            };
            let minutes = metal.quench_minutes();
            let quenching = QuenchingRecord {
                minutes,
                ready_at: ready_at(now, minutes),
                posted_at: now,
                posted_by: actor.clone(),
                promoted_at: None,
                promoted_by: None,
            };
            save_record(txn, id, &casting)?;
            save_record(txn, id, &quenching)?;
            Ok((CastingCompletion { casting, quenching }, Vec::new()))
        })
    }

    /// Move a quenched flask on to cutting by hand.
    pub fn post_quenching(
        &self,
        id: FlaskId,
        actor: Actor,
    ) -> Result<Transition<QuenchingRecord>, CrucibleError> {
        self.promote_quenched(id, actor, EventKind::QuenchingPosted)
    }

    /// Shared by manual posting and the promotion sweep; whichever commits
    /// second sees `PreconditionFailed`.
    pub(crate) fn promote_quenched(
        &self,
        id: FlaskId,
        actor: Actor,
        event: EventKind,
    ) -> Result<Transition<QuenchingRecord>, CrucibleError> {
        self.transition(id, Stage::Quenching, event, |txn, _flask, now| {
            let mut record: QuenchingRecord = require_record(txn, id)?;
            record.promoted_at = Some(now);
            record.promoted_by = Some(actor.clone());
            save_record(txn, id, &record)?;
            Ok((record, Vec::new()))
        })
    }

    /// Record cut weights and stage them for reconciliation.
    ///
    /// Losses are computed and both tolerance checks run, but the ledger is
    /// not touched until the figures are confirmed.
    pub fn stage_cutting(
        &self,
        id: FlaskId,
        input: CuttingInput,
    ) -> Result<Transition<ReconciliationRecord>, CrucibleError> {
        self.transition(id, Stage::Cutting, EventKind::CuttingStaged, |txn, _flask, now| {
            let supply: SupplyRecord = require_record(txn, id)?;
            let supplied = supply.supplied();
            let losses = validate_cut(supplied, input.before_cut, input.after_cast, input.after_scrap)?;

            let cutting = CuttingRecord {
                before_cut: input.before_cut,
                after_cast: input.after_cast,
                after_scrap: input.after_scrap,
                loss: losses.loss_total,
                posted_at: now,
                posted_by: input.actor.clone(),
            };
            let staged = ReconciliationRecord {
                supplied,
                before_cut: input.before_cut,
                after_cast: input.after_cast,
                after_scrap: input.after_scrap,
                losses,
                confirmed: false,
                posted_at: now,
                posted_by: input.actor.clone(),
                confirmed_at: None,
                confirmed_by: None,
            };
            save_record(txn, id, &cutting)?;
            save_record(txn, id, &staged)?;
            Ok((staged, Vec::new()))
        })
    }

    /// Finalise the cut figures, credit the reclaimed scrap and close the flask.
    pub fn confirm_reconciliation(
        &self,
        id: FlaskId,
        input: ReconciliationInput,
    ) -> Result<Transition<ReconciliationRecord>, CrucibleError> {
        self.transition(
            id,
            Stage::Reconciliation,
            EventKind::ReconciliationConfirmed,
            |txn, flask, now| {
                let staged: ReconciliationRecord = require_record(txn, id)?;
                let supplied = require_weight("supplied", input.supplied.unwrap_or(staged.supplied))?;
                let before_cut = input.before_cut.unwrap_or(staged.before_cut);
                let after_cast = input.after_cast.unwrap_or(staged.after_cast);
                let after_scrap = input.after_scrap.unwrap_or(staged.after_scrap);
                let losses = validate_cut(supplied, before_cut, after_cast, after_scrap)?;

                if let Some(mut cutting) = load_record::<CuttingRecord>(txn, id)? {
                    cutting.before_cut = before_cut;
                    cutting.after_cast = after_cast;
                    cutting.after_scrap = after_scrap;
                    cutting.loss = losses.loss_total;
                    cutting.posted_at = now;
                    cutting.posted_by = input.actor.clone();
                    save_record(txn, id, &cutting)?;
                }

                let movements = Ledger::new(txn, input.actor.clone(), now)
                    .for_flask(id)
                    .credit(flask.metal, after_scrap)?
                    .into_iter()
                    .collect();

                let record = ReconciliationRecord {
                    supplied,
                    before_cut,
                    after_cast,
                    after_scrap,
                    losses,
                    confirmed: true,
                    posted_at: staged.posted_at,
                    posted_by: staged.posted_by,
                    confirmed_at: Some(now),
                    confirmed_by: Some(input.actor.clone()),
                };
                save_record(txn, id, &record)?;
                Ok((record, movements))
            },
        )
    }

    // =========================================================================
    // RESERVE MAINTENANCE
    // =========================================================================

    /// Manual correction of a metal's scrap reserve.
    pub fn adjust_reserve(
        &self,
        metal: Metal,
        action: AdjustAction,
        amount: Weight,
        actor: Actor,
    ) -> Result<ScrapMovement, CrucibleError> {
        let amount = require_weight("amount", amount)?;
        if amount.is_zero() {
            return Err(CrucibleError::ValidationError(
                "amount must be greater than zero".to_string(),
            ));
        }
        let now = self.clock.now();
        let movement = self
            .store
            .write(|txn| Ledger::new(txn, actor.clone(), now).adjust(metal, action, amount))?
            .ok_or_else(|| CrucibleError::ValidationError("amount must be greater than zero".to_string()))?;

        info!(
            metal = %metal,
            action = %action,
            amount = %amount,
            balance = %movement.balance_after,
            actor = %actor,
            "scrap reserve adjusted"
        );
        Ok(movement)
    }

    // =========================================================================
    // INTERNALS
    // =========================================================================

    /// Run one guarded transition out of `required` into the next stage.
    fn transition<R>(
        &self,
        id: FlaskId,
        required: Stage,
        event: EventKind,
        apply: impl FnOnce(
            &WriteTransaction,
            &Flask,
            DateTime<Utc>,
        ) -> Result<(R, Vec<ScrapMovement>), CrucibleError>,
    ) -> Result<Transition<R>, CrucibleError> {
        let now = self.clock.now();
        debug!(flask = id.0, stage = %required, "transition requested");

        let transition = self.store.write(|txn| {
            let mut flask = load_flask(txn, id)?;
            let next = match (flask.status == required, required.next()) {
                (true, Some(next)) => next,
                _ => {
                    return Err(CrucibleError::PreconditionFailed {
                        unit: UnitRef::Flask(id),
                        expected: required.as_str(),
                        actual: flask.status.as_str(),
                    });
                }
            };

            let (record, movements) = apply(txn, &flask, now)?;

            flask.status = next;
            flask.updated_at = now;
            save_flask(txn, &flask, Some(required))?;
            Ok(Transition {
                flask,
                record,
                movements,
            })
        })?;

        info!(
            flask = id.0,
            from = %required,
            to = %transition.flask.status,
            movements = transition.movements.len(),
            "stage transition committed"
        );
        self.publish(PipelineEvent::new(event, id));
        Ok(transition)
    }

    fn publish(&self, event: PipelineEvent) {
        if let Err(e) = self.sink.publish(&event) {
            warn!(event = %event.event, flask = event.flask_id.0, error = %e, "event delivery failed");
        }
    }
}

// =============================================================================
// INPUT NORMALISATION
// =============================================================================

fn unit_number(field: &str, raw: &str) -> Result<String, CrucibleError> {
    let number = raw.trim();
    if number.is_empty() {
        return Err(CrucibleError::ValidationError(format!("{field} must not be empty")));
    }
    if number.chars().count() > MAX_NUMBER_LENGTH {
        return Err(CrucibleError::ValidationError(format!(
            "{field} exceeds {MAX_NUMBER_LENGTH} characters"
        )));
    }
    Ok(number.to_string())
}

fn bag_labels(raw: &[String]) -> Result<BTreeSet<String>, CrucibleError> {
    let mut labels = BTreeSet::new();
    for label in raw {
        let label = label.trim();
        if label.is_empty() {
            continue;
        }
        if label.chars().count() > MAX_BAG_LABEL_LENGTH {
            return Err(CrucibleError::ValidationError(format!(
                "bag label '{label}' exceeds {MAX_BAG_LABEL_LENGTH} characters"
            )));
        }
        labels.insert(label.to_string());
    }
    if labels.len() > MAX_BAGS_PER_UNIT {
        return Err(CrucibleError::ValidationError(format!(
            "at most {MAX_BAGS_PER_UNIT} bags per tree"
        )));
    }
    Ok(labels)
}
