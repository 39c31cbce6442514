//! # Pipeline Scenarios
//!
//! End-to-end behaviour of the stage machine, the scrap ledger and the
//! promotion sweep against a real database file.

use chrono::{Duration, NaiveDate, TimeZone, Utc};
use crucible_core::{
    Actor, AdjustAction, Clock, CrucibleError, CuttingInput, EventKind, FlaskId, ManualClock, MemorySink,
    Metal, MetalPrepInput, MovementFilter, MovementSource, NewTree, Pipeline, ReconciliationInput,
    Stage, Store, SupplyInput, ToleranceCheck, Tree, TreeStatus, WaxingInput, Weight,
};
use std::sync::Arc;
use tempfile::TempDir;

// =============================================================================
// FIXTURES
// =============================================================================

struct Floor {
    _temp: TempDir,
    pipeline: Pipeline,
    clock: Arc<ManualClock>,
    events: Arc<MemorySink>,
}

fn floor() -> Floor {
    let temp = tempfile::tempdir().expect("temp dir");
    let store = Store::open(temp.path().join("floor.redb")).expect("open db");
    let start = Utc.with_ymd_and_hms(2026, 5, 4, 8, 0, 0).single().expect("time");
    let clock = Arc::new(ManualClock::new(start));
    let events = Arc::new(MemorySink::new());
    let pipeline = Pipeline::new(store)
        .with_clock(clock.clone())
        .with_sink(events.clone());
    Floor {
        _temp: temp,
        pipeline,
        clock,
        events,
    }
}

fn g(text: &str) -> Weight {
    text.parse().expect("weight literal")
}

fn actor(name: &str) -> Actor {
    Actor::new(name).expect("actor")
}

fn cast_date() -> NaiveDate {
    NaiveDate::from_ymd_opt(2026, 5, 4).expect("date")
}

impl Floor {
    fn stock(&self, metal: Metal, grams: &str) {
        self.pipeline
            .adjust_reserve(metal, AdjustAction::Add, g(grams), actor("stores"))
            .expect("stock reserve");
    }

    fn reserve(&self, metal: Metal) -> Weight {
        self.pipeline.store().reserve(metal).expect("reserve")
    }

    fn status(&self, id: FlaskId) -> Stage {
        self.pipeline.store().flask(id).expect("flask").status
    }

    fn event_kinds(&self) -> Vec<EventKind> {
        self.events.events().into_iter().map(|e| e.event).collect()
    }

    /// A 14Y tree of 7.548 g wax, which needs 100.011 g of metal.
    fn tree(&self, number: &str, bags: &[&str]) -> Tree {
        self.pipeline
            .intake_tree(NewTree {
                number: number.to_string(),
                metal: Metal::Gold14Yellow,
                gasket: g("2"),
                total: g("9.548"),
                bags: bags.iter().map(|b| b.to_string()).collect(),
                actor: actor("wax room"),
            })
            .expect("intake")
    }

    fn flask(&self, tree: &Tree, number: &str) -> FlaskId {
        self.pipeline
            .post_waxing(WaxingInput {
                tree: tree.id,
                flask_number: number.to_string(),
                date: cast_date(),
                actor: actor("investor"),
            })
            .expect("waxing")
            .flask
            .id
    }

    fn prep(&self, id: FlaskId, prepared: bool, scrap: &str, fine: &str, alloy: &str) {
        self.pipeline
            .post_metal_prep(
                id,
                MetalPrepInput {
                    prepared,
                    scrap: g(scrap),
                    fine: g(fine),
                    alloy: g(alloy),
                    actor: actor("prep"),
                },
            )
            .expect("metal prep");
    }

    fn supply(&self, id: FlaskId, scrap: &str, fine: &str, alloy: &str) -> Result<(), CrucibleError> {
        self.pipeline
            .post_supply(
                id,
                SupplyInput {
                    scrap: g(scrap),
                    fine: g(fine),
                    alloy: g(alloy),
                    actor: actor("caster"),
                },
            )
            .map(|_| ())
    }

    /// Walk a fresh flask to the supply stage with 10 g of scrap held.
    fn flask_at_supply(&self, number: &str) -> FlaskId {
        let tree = self.tree(&format!("T-{number}"), &[]);
        let id = self.flask(&tree, number);
        self.prep(id, true, "10", "52.83", "37.17");
        id
    }

    fn flask_at_cutting(&self, number: &str) -> FlaskId {
        let id = self.flask_at_supply(number);
        self.supply(id, "40", "35.22", "24.78").expect("supply");
        self.pipeline.complete_casting(id, actor("caster")).expect("casting");
        self.pipeline.post_quenching(id, actor("caster")).expect("quenching");
        id
    }
}

// =============================================================================
// FULL LIFECYCLE
// =============================================================================

mod lifecycle {
    use super::*;

    #[test]
    fn tree_to_done_keeps_the_ledger_balanced() {
        let floor = floor();
        floor.stock(Metal::Gold14Yellow, "50");

        let tree = floor.tree("T-100", &["B-1"]);
        assert_eq!(tree.tree_weight, g("7.548"));
        assert_eq!(tree.estimated_metal_weight, g("100.011"));

        let id = floor.flask(&tree, "12");
        assert_eq!(floor.status(id), Stage::MetalPrep);
        assert_eq!(
            floor.pipeline.store().tree(tree.id).expect("tree").status,
            TreeStatus::Consumed
        );

        floor.prep(id, true, "10", "52.83", "37.17");
        assert_eq!(floor.reserve(Metal::Gold14Yellow), g("40"));

        // Supply declares less scrap than was held: the difference goes back.
        floor.supply(id, "7", "54.591", "38.409").expect("supply");
        assert_eq!(floor.reserve(Metal::Gold14Yellow), g("43"));

        let casting = floor
            .pipeline
            .complete_casting(id, actor("caster"))
            .expect("casting");
        assert_eq!(casting.record.casting.casting_temp, 1030);
        assert_eq!(casting.record.casting.oven_temp, 1050);
        assert_eq!(casting.record.quenching.minutes, 15);
        assert_eq!(
            casting.record.quenching.ready_at,
            floor.clock.now() + Duration::minutes(15)
        );

        let quench = floor
            .pipeline
            .post_quenching(id, actor("caster"))
            .expect("quenching");
        assert_eq!(quench.record.promoted_by, Some(actor("caster")));

        let staged = floor
            .pipeline
            .stage_cutting(
                id,
                CuttingInput {
                    before_cut: g("96"),
                    after_cast: g("80"),
                    after_scrap: g("14"),
                    actor: actor("cutter"),
                },
            )
            .expect("cutting");
        assert!(!staged.record.confirmed);
        assert_eq!(staged.record.supplied, g("100"));
        assert_eq!(staged.record.losses.loss_total, g("6"));
        assert!(staged.movements.is_empty());
        assert_eq!(floor.reserve(Metal::Gold14Yellow), g("43"));

        let done = floor
            .pipeline
            .confirm_reconciliation(
                id,
                ReconciliationInput {
                    supplied: None,
                    before_cut: None,
                    after_cast: None,
                    after_scrap: None,
                    actor: actor("lead"),
                },
            )
            .expect("reconciliation");
        assert_eq!(done.flask.status, Stage::Done);
        assert!(done.record.confirmed);
        assert_eq!(done.movements.len(), 1);
        assert_eq!(done.movements[0].source, MovementSource::ReconciliationCredit);
        assert_eq!(floor.reserve(Metal::Gold14Yellow), g("57"));

        assert_eq!(
            floor.event_kinds(),
            vec![
                EventKind::MetalPrepPosted,
                EventKind::SupplyPosted,
                EventKind::CastingComplete,
                EventKind::QuenchingPosted,
                EventKind::CuttingStaged,
                EventKind::ReconciliationConfirmed,
            ]
        );

        let dossier = floor.pipeline.store().dossier(id).expect("dossier");
        assert!(dossier.waxing.is_some());
        assert_eq!(dossier.cutting.map(|c| c.loss), Some(g("6")));

        let bag = floor.pipeline.store().bag("B-1").expect("read").expect("bag");
        assert_eq!(bag.flask, Some(id));

        assert!(floor.pipeline.store().audit().expect("audit").is_consistent());
    }

    #[test]
    fn reconciliation_overrides_are_credited_and_copied_to_cutting() {
        let floor = floor();
        floor.stock(Metal::Gold14Yellow, "50");
        let id = floor.flask_at_cutting("20");
        floor
            .pipeline
            .stage_cutting(
                id,
                CuttingInput {
                    before_cut: g("96"),
                    after_cast: g("80"),
                    after_scrap: g("14"),
                    actor: actor("cutter"),
                },
            )
            .expect("cutting");
        let before = floor.reserve(Metal::Gold14Yellow);

        let done = floor
            .pipeline
            .confirm_reconciliation(
                id,
                ReconciliationInput {
                    supplied: None,
                    before_cut: None,
                    after_cast: Some(g("79")),
                    after_scrap: Some(g("15")),
                    actor: actor("lead"),
                },
            )
            .expect("reconciliation");

        assert_eq!(done.record.losses.loss_total, g("6"));
        assert_eq!(floor.reserve(Metal::Gold14Yellow), before + g("15"));
        let cutting = floor
            .pipeline
            .store()
            .dossier(id)
            .expect("dossier")
            .cutting
            .expect("cutting");
        assert_eq!(cutting.after_scrap, g("15"));
        assert_eq!(cutting.after_cast, g("79"));
    }

    #[test]
    fn unprepared_plan_holds_nothing_and_supply_consumes_in_full() {
        let floor = floor();
        floor.stock(Metal::Gold14Yellow, "50");
        let tree = floor.tree("T-1", &[]);
        let id = floor.flask(&tree, "1");

        // Unvalidated numbers are accepted when not prepared.
        floor.prep(id, false, "999", "0", "0");
        assert_eq!(floor.reserve(Metal::Gold14Yellow), g("50"));

        floor.supply(id, "40", "35.22", "24.78").expect("supply");
        assert_eq!(floor.reserve(Metal::Gold14Yellow), g("10"));
    }
}

// =============================================================================
// GUARDS
// =============================================================================

mod guards {
    use super::*;

    #[test]
    fn out_of_order_transition_is_rejected_without_changes() {
        let floor = floor();
        let tree = floor.tree("T-1", &[]);
        let id = floor.flask(&tree, "1");

        let err = floor
            .pipeline
            .complete_casting(id, actor("caster"))
            .expect_err("not in casting");
        assert!(matches!(
            err,
            CrucibleError::PreconditionFailed {
                expected: "casting",
                actual: "metal_prep",
                ..
            }
        ));
        assert_eq!(floor.status(id), Stage::MetalPrep);
        assert!(floor.pipeline.store().dossier(id).expect("dossier").casting.is_none());
        assert!(floor.event_kinds().is_empty());
    }

    #[test]
    fn reposting_an_identical_supply_changes_nothing() {
        let floor = floor();
        floor.stock(Metal::Gold14Yellow, "50");
        let id = floor.flask_at_supply("3");
        floor.supply(id, "7", "54.591", "38.409").expect("supply");

        let reserve = floor.reserve(Metal::Gold14Yellow);
        let log = floor
            .pipeline
            .store()
            .movements(&MovementFilter::default())
            .expect("log");
        let dossier = floor.pipeline.store().dossier(id).expect("dossier");

        let err = floor
            .supply(id, "7", "54.591", "38.409")
            .expect_err("already in casting");
        assert_eq!(err.kind(), "precondition_failed");

        assert_eq!(floor.reserve(Metal::Gold14Yellow), reserve);
        assert_eq!(
            floor
                .pipeline
                .store()
                .movements(&MovementFilter::default())
                .expect("log"),
            log
        );
        assert_eq!(floor.pipeline.store().dossier(id).expect("dossier"), dossier);
    }

    #[test]
    fn consumed_tree_cannot_be_waxed_twice() {
        let floor = floor();
        let tree = floor.tree("T-1", &[]);
        floor.flask(&tree, "1");

        let err = floor
            .pipeline
            .post_waxing(WaxingInput {
                tree: tree.id,
                flask_number: "2".to_string(),
                date: cast_date(),
                actor: actor("investor"),
            })
            .expect_err("tree consumed");
        assert!(matches!(
            err,
            CrucibleError::PreconditionFailed {
                actual: "consumed",
                ..
            }
        ));
    }

    #[test]
    fn flask_number_is_unique_per_date() {
        let floor = floor();
        let first = floor.tree("T-1", &[]);
        let second = floor.tree("T-2", &[]);
        floor.flask(&first, "5");

        let err = floor
            .pipeline
            .post_waxing(WaxingInput {
                tree: second.id,
                flask_number: "5".to_string(),
                date: cast_date(),
                actor: actor("investor"),
            })
            .expect_err("duplicate flask number");
        assert_eq!(
            err,
            CrucibleError::Conflict("Flask #5 is already used on 05-04-2026".to_string())
        );
        // Rolled back: the tree is still waiting.
        assert_eq!(
            floor.pipeline.store().tree(second.id).expect("tree").status,
            TreeStatus::InTransit
        );
    }

    #[test]
    fn flask_number_check_matches_waxing() {
        let floor = floor();
        let store = floor.pipeline.store();
        assert_eq!(store.check_flask_number(cast_date(), "5"), Ok(()));

        let tree = floor.tree("T-1", &[]);
        floor.flask(&tree, "5");

        assert_eq!(
            store.check_flask_number(cast_date(), " 5 "),
            Err(CrucibleError::Conflict(
                "Flask #5 is already used on 05-04-2026".to_string()
            ))
        );
        let next_day = cast_date().succ_opt().expect("date");
        assert_eq!(store.check_flask_number(next_day, "5"), Ok(()));
        assert_eq!(
            store
                .check_flask_number(cast_date(), "  ")
                .map_err(|e| e.kind()),
            Err("validation_error")
        );
    }

    #[test]
    fn tree_numbers_and_bags_are_unique() {
        let floor = floor();
        floor.tree("T-1", &["B-1"]);

        let duplicate_number = floor.pipeline.intake_tree(NewTree {
            number: " T-1 ".to_string(),
            metal: Metal::Silver,
            gasket: g("1"),
            total: g("2"),
            bags: Vec::new(),
            actor: actor("wax room"),
        });
        assert_eq!(duplicate_number.map(|_| ()).map_err(|e| e.kind()), Err("conflict"));

        let duplicate_bag = floor.pipeline.intake_tree(NewTree {
            number: "T-2".to_string(),
            metal: Metal::Silver,
            gasket: g("1"),
            total: g("2"),
            bags: vec!["B-1".to_string()],
            actor: actor("wax room"),
        });
        assert_eq!(duplicate_bag.map(|_| ()).map_err(|e| e.kind()), Err("conflict"));
        assert!(floor.pipeline.store().trees_in_transit().expect("trees").len() == 1);
    }

    #[test]
    fn gasket_heavier_than_total_is_rejected() {
        let floor = floor();
        let err = floor
            .pipeline
            .intake_tree(NewTree {
                number: "T-9".to_string(),
                metal: Metal::Platinum,
                gasket: g("5"),
                total: g("4.999"),
                bags: Vec::new(),
                actor: actor("wax room"),
            })
            .expect_err("negative tree weight");
        assert_eq!(err.kind(), "validation_error");
    }

    #[test]
    fn hold_beyond_reserve_writes_no_record() {
        let floor = floor();
        floor.stock(Metal::Gold14Yellow, "5");
        let tree = floor.tree("T-1", &[]);
        let id = floor.flask(&tree, "1");

        let err = floor
            .pipeline
            .post_metal_prep(
                id,
                MetalPrepInput {
                    prepared: true,
                    scrap: g("10"),
                    fine: g("52.83"),
                    alloy: g("37.17"),
                    actor: actor("prep"),
                },
            )
            .expect_err("insufficient scrap");
        assert!(matches!(err, CrucibleError::InsufficientReserve { .. }));
        assert_eq!(floor.status(id), Stage::MetalPrep);
        assert!(floor.pipeline.store().dossier(id).expect("dossier").metal_prep.is_none());
        assert_eq!(floor.reserve(Metal::Gold14Yellow), g("5"));
    }
}

// =============================================================================
// COMPOSITION AND TOLERANCE GATES
// =============================================================================

mod gates {
    use super::*;

    #[test]
    fn exact_fourteen_yellow_supply_passes() {
        let floor = floor();
        floor.stock(Metal::Gold14Yellow, "50");
        let id = floor.flask_at_supply("1");
        floor.supply(id, "40", "35.22", "24.78").expect("supply");
        assert_eq!(floor.status(id), Stage::Casting);
    }

    #[test]
    fn even_fine_and_alloy_fails_the_ratio() {
        let floor = floor();
        floor.stock(Metal::Gold14Yellow, "50");
        let id = floor.flask_at_supply("1");
        let reserve = floor.reserve(Metal::Gold14Yellow);

        let err = floor.supply(id, "0", "50", "50").expect_err("ratio");
        assert!(matches!(
            err,
            CrucibleError::ToleranceExceeded {
                check: ToleranceCheck::FineFraction,
                ..
            }
        ));
        assert_eq!(floor.status(id), Stage::Supply);
        assert_eq!(floor.reserve(Metal::Gold14Yellow), reserve);
        assert!(floor.pipeline.store().dossier(id).expect("dossier").supply.is_none());
    }

    #[test]
    fn supply_requires_total_near_the_waxing_requirement() {
        let floor = floor();
        floor.stock(Metal::Gold14Yellow, "50");
        let id = floor.flask_at_supply("1");
        let err = floor.supply(id, "40", "17.61", "12.39").expect_err("short");
        assert!(matches!(
            err,
            CrucibleError::ToleranceExceeded {
                check: ToleranceCheck::SupplyTotal,
                ..
            }
        ));
    }

    #[test]
    fn cut_weights_out_of_band_leave_the_flask_in_cutting() {
        let floor = floor();
        floor.stock(Metal::Gold14Yellow, "50");
        let id = floor.flask_at_cutting("1");

        let err = floor
            .pipeline
            .stage_cutting(
                id,
                CuttingInput {
                    before_cut: g("94.9"),
                    after_cast: g("80"),
                    after_scrap: g("14"),
                    actor: actor("cutter"),
                },
            )
            .expect_err("before cut too light");
        assert!(matches!(
            err,
            CrucibleError::ToleranceExceeded {
                check: ToleranceCheck::BeforeCut,
                ..
            }
        ));
        assert_eq!(floor.status(id), Stage::Cutting);
        assert!(floor.pipeline.store().dossier(id).expect("dossier").reconciliation.is_none());
    }
}

// =============================================================================
// AUTOMATIC PROMOTION
// =============================================================================

mod sweep {
    use super::*;

    fn quenching_flask(floor: &Floor) -> FlaskId {
        floor.stock(Metal::Gold14Yellow, "50");
        let id = floor.flask_at_supply("1");
        floor.supply(id, "40", "35.22", "24.78").expect("supply");
        floor
            .pipeline
            .complete_casting(id, actor("caster"))
            .expect("casting");
        let _ = floor.events.drain();
        id
    }

    #[test]
    fn waits_for_the_grace_period() {
        let floor = floor();
        let id = quenching_flask(&floor);

        floor.clock.advance(Duration::minutes(15));
        let report = floor.pipeline.promote_ready().expect("sweep");
        assert_eq!(report.examined, 0);
        assert_eq!(floor.status(id), Stage::Quenching);

        floor.clock.advance(Duration::seconds(60));
        let report = floor.pipeline.promote_ready().expect("sweep");
        assert_eq!(report.promoted, vec![id]);
        assert_eq!(floor.status(id), Stage::Cutting);

        let record = floor
            .pipeline
            .store()
            .dossier(id)
            .expect("dossier")
            .quenching
            .expect("quenching");
        assert_eq!(record.promoted_by, Some(Actor::auto()));
    }

    #[test]
    fn second_pass_is_a_silent_no_op() {
        let floor = floor();
        let id = quenching_flask(&floor);
        floor.clock.advance(Duration::minutes(20));

        let first = floor.pipeline.promote_ready().expect("sweep");
        let second = floor.pipeline.promote_ready().expect("sweep");
        assert_eq!(first.promoted, vec![id]);
        assert!(second.promoted.is_empty());

        // Even when handed the flask directly, it is skipped rather than failed.
        let forced = floor.pipeline.promote_candidates(&[id]);
        assert_eq!(forced.skipped, vec![id]);
        assert!(forced.failed.is_empty());

        assert_eq!(floor.event_kinds(), vec![EventKind::QuenchingAutoPosted]);
    }

    #[test]
    fn manual_promotion_wins_the_race() {
        let floor = floor();
        let id = quenching_flask(&floor);
        floor
            .pipeline
            .post_quenching(id, actor("caster"))
            .expect("manual");

        let report = floor.pipeline.promote_candidates(&[id]);
        assert_eq!(report.skipped, vec![id]);
        assert_eq!(floor.event_kinds(), vec![EventKind::QuenchingPosted]);
    }

    #[test]
    fn one_bad_candidate_does_not_stop_the_pass() {
        let floor = floor();
        let id = quenching_flask(&floor);
        let report = floor.pipeline.promote_candidates(&[FlaskId(999), id]);
        assert_eq!(report.failed, vec![FlaskId(999)]);
        assert_eq!(report.promoted, vec![id]);
    }

    #[test]
    fn grace_past_the_calendar_is_an_error_not_a_panic() {
        let floor = floor();
        let id = quenching_flask(&floor);
        let pipeline = floor
            .pipeline
            .with_grace(Duration::seconds(9_000_000_000_000));

        let err = pipeline.promote_ready().expect_err("cutoff overflows");
        assert_eq!(err.kind(), "validation_error");
        assert_eq!(
            pipeline.store().flask(id).expect("flask").status,
            Stage::Quenching
        );
    }
}

// =============================================================================
// CONCURRENT WRITERS
// =============================================================================

mod concurrency {
    use super::*;

    #[test]
    fn concurrent_writers_on_different_metals_all_commit() {
        let floor = floor();
        let metals = [Metal::Silver, Metal::Gold14Yellow, Metal::Platinum, Metal::Gold18Rose];

        std::thread::scope(|scope| {
            for metal in metals {
                for worker in 0..2 {
                    let pipeline = &floor.pipeline;
                    scope.spawn(move || {
                        for _ in 0..25 {
                            pipeline
                                .adjust_reserve(
                                    metal,
                                    AdjustAction::Add,
                                    g("1.5"),
                                    actor(&format!("worker-{worker}")),
                                )
                                .expect("adjust");
                        }
                    });
                }
            }
        });

        for metal in metals {
            assert_eq!(floor.reserve(metal), g("75"));
            let movements = floor
                .pipeline
                .store()
                .movements(&MovementFilter {
                    metal: Some(metal),
                    ..MovementFilter::default()
                })
                .expect("movements");
            assert_eq!(movements.len(), 50);
            // Balances step by exactly one adjustment in commit order.
            for (n, movement) in movements.iter().enumerate() {
                assert_eq!(
                    movement.balance_after,
                    Weight::from_milligrams(1_500 * (n as i64 + 1))
                );
            }
        }
        assert!(floor.pipeline.store().audit().expect("audit").is_consistent());
    }
}

// =============================================================================
// EVENT DELIVERY
// =============================================================================

mod delivery {
    use super::*;
    use crucible_core::{EventSink, PipelineEvent};

    struct UnreachableSink;

    impl EventSink for UnreachableSink {
        fn publish(&self, _event: &PipelineEvent) -> Result<(), CrucibleError> {
            Err(CrucibleError::IoError("listener gone".to_string()))
        }
    }

    #[test]
    fn sink_failure_does_not_roll_back_the_transition() {
        let temp = tempfile::tempdir().expect("temp dir");
        let pipeline = Pipeline::open(temp.path().join("floor.redb"))
            .expect("open db")
            .with_sink(Arc::new(UnreachableSink));
        pipeline
            .adjust_reserve(Metal::Gold14Yellow, AdjustAction::Add, g("50"), actor("stores"))
            .expect("stock");

        let tree = pipeline
            .intake_tree(NewTree {
                number: "T-9".to_string(),
                metal: Metal::Gold14Yellow,
                gasket: g("2"),
                total: g("9.548"),
                bags: Vec::new(),
                actor: actor("wax"),
            })
            .expect("tree");
        let flask = pipeline
            .post_waxing(WaxingInput {
                tree: tree.id,
                flask_number: "9".to_string(),
                date: cast_date(),
                actor: actor("investor"),
            })
            .expect("waxing")
            .flask;

        let posted = pipeline
            .post_metal_prep(
                flask.id,
                MetalPrepInput {
                    prepared: true,
                    scrap: g("10"),
                    fine: g("52.83"),
                    alloy: g("37.17"),
                    actor: actor("prep"),
                },
            )
            .expect("posting survives a failed delivery");
        assert_eq!(posted.flask.status, Stage::Supply);
        assert_eq!(
            pipeline.store().reserve(Metal::Gold14Yellow).expect("reserve"),
            g("40")
        );
    }
}
