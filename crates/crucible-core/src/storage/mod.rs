//! # redb-backed Floor Storage
//!
//! One redb file holds the whole floor: units, stage records, the scrap
//! reserve and its movement log. redb provides:
//! - ACID transactions (a stage transition is exactly one write transaction)
//! - Crash safety (copy-on-write B-trees)
//! - MVCC (concurrent readers, single writer)
//!
//! The single-writer rule is what serializes reserve updates: every
//! read-modify-write of a balance happens inside a write transaction, so two
//! ledger operations on the same metal can never interleave.
//!
//! Rows are postcard-encoded. Secondary indexes (tree numbers, per-date
//! flask numbers, flasks by stage) are kept in their own tables and updated
//! in the same transaction as the row they index.

mod queries;

use crate::metal::Metal;
use crate::types::{
    Bag, CastingRecord, CrucibleError, CuttingRecord, Flask, FlaskId, MetalPrepRecord,
    QuenchingRecord, ReconciliationRecord, Stage, StageKind, SupplyRecord, Tree, TreeId, UnitRef,
    WaxingRecord,
};
use chrono::{Datelike, NaiveDate};
use redb::{Database, ReadTransaction, ReadableDatabase, ReadableTable, TableDefinition, WriteTransaction};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fmt;
use std::path::Path;
use tracing::{debug, warn};

// =============================================================================
// TABLES
// =============================================================================

/// Trees: TreeId(u64) -> postcard Tree
pub(crate) const TREES: TableDefinition<u64, &[u8]> = TableDefinition::new("trees");

/// Tree number index: number -> TreeId
pub(crate) const TREE_NUMBERS: TableDefinition<&str, u64> = TableDefinition::new("tree_numbers");

/// Flasks: FlaskId(u64) -> postcard Flask
pub(crate) const FLASKS: TableDefinition<u64, &[u8]> = TableDefinition::new("flasks");

/// Flask number index: (days since CE, number) -> FlaskId
pub(crate) const FLASK_NUMBERS: TableDefinition<(i32, &str), u64> =
    TableDefinition::new("flask_numbers");

/// Flasks by stage: (Stage ordinal, FlaskId) -> ()
pub(crate) const STAGE_INDEX: TableDefinition<(u8, u64), ()> = TableDefinition::new("stage_index");

/// Bags: label -> postcard Bag
pub(crate) const BAGS: TableDefinition<&str, &[u8]> = TableDefinition::new("bags");

/// Metal catalogue: Metal ordinal -> canonical code
pub(crate) const METALS: TableDefinition<u8, &str> = TableDefinition::new("metals");

/// Scrap on hand: Metal ordinal -> milligrams
pub(crate) const RESERVES: TableDefinition<u8, i64> = TableDefinition::new("scrap_reserves");

/// Movement log: MovementId(u64) -> postcard ScrapMovement
pub(crate) const MOVEMENTS: TableDefinition<u64, &[u8]> = TableDefinition::new("scrap_movements");

/// Metadata: key -> u64 (id sequences, schema version)
pub(crate) const METADATA: TableDefinition<&str, u64> = TableDefinition::new("metadata");

const WAXING: TableDefinition<u64, &[u8]> = TableDefinition::new("stage_waxing");
const METAL_PREP: TableDefinition<u64, &[u8]> = TableDefinition::new("stage_metal_prep");
const SUPPLY: TableDefinition<u64, &[u8]> = TableDefinition::new("stage_supply");
const CASTING: TableDefinition<u64, &[u8]> = TableDefinition::new("stage_casting");
const QUENCHING: TableDefinition<u64, &[u8]> = TableDefinition::new("stage_quenching");
const CUTTING: TableDefinition<u64, &[u8]> = TableDefinition::new("stage_cutting");
const RECONCILIATION: TableDefinition<u64, &[u8]> = TableDefinition::new("stage_reconciliation");

const SCHEMA_VERSION: u64 = 1;

pub(crate) const NEXT_TREE_ID: &str = "next_tree_id";
pub(crate) const NEXT_FLASK_ID: &str = "next_flask_id";
pub(crate) const NEXT_MOVEMENT_ID: &str = "next_movement_id";

// =============================================================================
// STAGE RECORDS
// =============================================================================

/// A per-flask stage record with its own table. At most one row per flask.
pub(crate) trait StageRecord: Serialize + DeserializeOwned {
    const KIND: StageKind;
    const TABLE: TableDefinition<'static, u64, &'static [u8]>;
}

macro_rules! stage_record {
    ($ty:ty, $kind:expr, $table:expr) => {
        impl StageRecord for $ty {
            const KIND: StageKind = $kind;
            const TABLE: TableDefinition<'static, u64, &'static [u8]> = $table;
        }
    };
}

stage_record!(WaxingRecord, StageKind::Waxing, WAXING);
stage_record!(MetalPrepRecord, StageKind::MetalPrep, METAL_PREP);
stage_record!(SupplyRecord, StageKind::Supply, SUPPLY);
stage_record!(CastingRecord, StageKind::Casting, CASTING);
stage_record!(QuenchingRecord, StageKind::Quenching, QUENCHING);
stage_record!(CuttingRecord, StageKind::Cutting, CUTTING);
stage_record!(ReconciliationRecord, StageKind::Reconciliation, RECONCILIATION);

// =============================================================================
// STORE
// =============================================================================

/// The floor database.
pub struct Store {
    db: Database,
}

impl fmt::Debug for Store {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Store").finish_non_exhaustive()
    }
}

impl Store {
    /// Open or create a floor database at the given path.
    ///
    /// Creates every table, records the metal catalogue and makes sure each
    /// metal has a reserve row (starting at zero).
    pub fn open(path: impl AsRef<Path>) -> Result<Self, CrucibleError> {
        let db = Database::create(path.as_ref()).map_err(io_err)?;
        let store = Self { db };
        store.initialize()?;
        debug!(path = %path.as_ref().display(), "floor database opened");
        Ok(store)
    }

    fn initialize(&self) -> Result<(), CrucibleError> {
        self.write(|txn| {
            for def in [
                TREES,
                FLASKS,
                MOVEMENTS,
                WAXING,
                METAL_PREP,
                SUPPLY,
                CASTING,
                QUENCHING,
                CUTTING,
                RECONCILIATION,
            ] {
                let _ = txn.open_table(def).map_err(io_err)?;
            }
            let _ = txn.open_table(TREE_NUMBERS).map_err(io_err)?;
            let _ = txn.open_table(FLASK_NUMBERS).map_err(io_err)?;
            let _ = txn.open_table(STAGE_INDEX).map_err(io_err)?;
            let _ = txn.open_table(BAGS).map_err(io_err)?;

            {
                let mut metals = txn.open_table(METALS).map_err(io_err)?;
                for metal in Metal::ALL {
                    metals.insert(metal.ordinal(), metal.code()).map_err(io_err)?;
                }
            }
            {
                let mut reserves = txn.open_table(RESERVES).map_err(io_err)?;
                for metal in Metal::ALL {
                    let missing = reserves.get(metal.ordinal()).map_err(io_err)?.is_none();
                    if missing {
                        reserves.insert(metal.ordinal(), 0i64).map_err(io_err)?;
                    }
                }
            }
            {
                let mut meta = txn.open_table(METADATA).map_err(io_err)?;
                let stored = meta.get("schema_version").map_err(io_err)?.map(|v| v.value());
                match stored {
                    None => {
                        meta.insert("schema_version", SCHEMA_VERSION).map_err(io_err)?;
                    }
                    Some(version) if version == SCHEMA_VERSION => {}
                    Some(version) => {
                        return Err(CrucibleError::IoError(format!(
                            "unsupported schema version {version} (expected {SCHEMA_VERSION})"
                        )));
                    }
                }
            }
            Ok(())
        })
    }

    /// Run `f` inside one write transaction.
    ///
    /// Commits when `f` returns `Ok`; aborts (discarding every write made by
    /// `f`) when it returns `Err`.
    pub(crate) fn write<T>(
        &self,
        f: impl FnOnce(&WriteTransaction) -> Result<T, CrucibleError>,
    ) -> Result<T, CrucibleError> {
        let txn = self.db.begin_write().map_err(io_err)?;
        match f(&txn) {
            Ok(value) => {
                txn.commit().map_err(io_err)?;
                Ok(value)
            }
            Err(err) => {
                if let Err(abort) = txn.abort() {
                    warn!(error = %abort, "write transaction abort failed");
                }
                Err(err)
            }
        }
    }

    pub(crate) fn read(&self) -> Result<ReadTransaction, CrucibleError> {
        self.db.begin_read().map_err(io_err)
    }
}

// =============================================================================
// CODEC HELPERS
// =============================================================================

pub(crate) fn io_err<E: fmt::Display>(e: E) -> CrucibleError {
    CrucibleError::IoError(e.to_string())
}

pub(crate) fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, CrucibleError> {
    postcard::to_allocvec(value).map_err(|e| CrucibleError::SerializationError(e.to_string()))
}

pub(crate) fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, CrucibleError> {
    postcard::from_bytes(bytes).map_err(|e| CrucibleError::SerializationError(e.to_string()))
}

pub(crate) fn get_row<T, Tb>(table: &Tb, key: u64) -> Result<Option<T>, CrucibleError>
where
    T: DeserializeOwned,
    Tb: ReadableTable<u64, &'static [u8]>,
{
    match table.get(key).map_err(io_err)? {
        Some(data) => decode(data.value()).map(Some),
        None => Ok(None),
    }
}

pub(crate) fn all_rows<T, Tb>(table: &Tb) -> Result<Vec<T>, CrucibleError>
where
    T: DeserializeOwned,
    Tb: ReadableTable<u64, &'static [u8]>,
{
    let mut rows = Vec::new();
    for entry in table.iter().map_err(io_err)? {
        let (_, value) = entry.map_err(io_err)?;
        rows.push(decode(value.value())?);
    }
    Ok(rows)
}

fn date_key(date: NaiveDate) -> i32 {
    date.num_days_from_ce()
}

// =============================================================================
// WRITE-SIDE ROW ACCESS
// =============================================================================

/// Take the next value of an id sequence. Sequences start at 1.
pub(crate) fn next_id(txn: &WriteTransaction, key: &str) -> Result<u64, CrucibleError> {
    let mut meta = txn.open_table(METADATA).map_err(io_err)?;
    let next = meta.get(key).map_err(io_err)?.map(|v| v.value()).unwrap_or(1);
    meta.insert(key, next.saturating_add(1)).map_err(io_err)?;
    Ok(next)
}

pub(crate) fn load_tree(txn: &WriteTransaction, id: TreeId) -> Result<Tree, CrucibleError> {
    let table = txn.open_table(TREES).map_err(io_err)?;
    get_row(&table, id.0)?.ok_or(CrucibleError::NotFound(UnitRef::Tree(id)))
}

pub(crate) fn save_tree(txn: &WriteTransaction, tree: &Tree) -> Result<(), CrucibleError> {
    let bytes = encode(tree)?;
    let mut table = txn.open_table(TREES).map_err(io_err)?;
    table.insert(tree.id.0, bytes.as_slice()).map_err(io_err)?;
    Ok(())
}

/// Reserve a tree number. Numbers are unique across all trees.
pub(crate) fn claim_tree_number(
    txn: &WriteTransaction,
    number: &str,
    id: TreeId,
) -> Result<(), CrucibleError> {
    let mut table = txn.open_table(TREE_NUMBERS).map_err(io_err)?;
    if table.get(number).map_err(io_err)?.is_some() {
        return Err(CrucibleError::Conflict(format!(
            "Tree #{number} already exists"
        )));
    }
    table.insert(number, id.0).map_err(io_err)?;
    Ok(())
}

pub(crate) fn load_flask(txn: &WriteTransaction, id: FlaskId) -> Result<Flask, CrucibleError> {
    let table = txn.open_table(FLASKS).map_err(io_err)?;
    get_row(&table, id.0)?.ok_or(CrucibleError::NotFound(UnitRef::Flask(id)))
}

/// Store a flask and move it in the stage index if its status changed.
pub(crate) fn save_flask(
    txn: &WriteTransaction,
    flask: &Flask,
    previous: Option<Stage>,
) -> Result<(), CrucibleError> {
    let bytes = encode(flask)?;
    {
        let mut table = txn.open_table(FLASKS).map_err(io_err)?;
        table.insert(flask.id.0, bytes.as_slice()).map_err(io_err)?;
    }
    if previous != Some(flask.status) {
        let mut index = txn.open_table(STAGE_INDEX).map_err(io_err)?;
        if let Some(stage) = previous {
            index.remove((stage.ordinal(), flask.id.0)).map_err(io_err)?;
        }
        index.insert((flask.status.ordinal(), flask.id.0), ()).map_err(io_err)?;
    }
    Ok(())
}

pub(crate) fn flask_number_conflict(number: &str, date: NaiveDate) -> CrucibleError {
    CrucibleError::Conflict(format!(
        "Flask #{number} is already used on {}",
        date.format("%m-%d-%Y")
    ))
}

/// Reserve a flask number on a date. Numbers are unique per calendar date.
pub(crate) fn claim_flask_number(
    txn: &WriteTransaction,
    date: NaiveDate,
    number: &str,
    id: FlaskId,
) -> Result<(), CrucibleError> {
    let mut table = txn.open_table(FLASK_NUMBERS).map_err(io_err)?;
    let key = (date_key(date), number);
    if table.get(key).map_err(io_err)?.is_some() {
        return Err(flask_number_conflict(number, date));
    }
    table.insert(key, id.0).map_err(io_err)?;
    Ok(())
}

/// Attach a new bag label to a tree. Labels are globally unique.
pub(crate) fn claim_bag(
    txn: &WriteTransaction,
    label: &str,
    tree: TreeId,
) -> Result<(), CrucibleError> {
    let mut table = txn.open_table(BAGS).map_err(io_err)?;
    if let Some(existing) = table.get(label).map_err(io_err)? {
        let bag: Bag = decode(existing.value())?;
        return Err(CrucibleError::Conflict(format!(
            "bag '{label}' is already attached to tree {}",
            bag.tree
        )));
    }
    let bag = Bag {
        label: label.to_string(),
        tree,
        flask: None,
    };
    let bytes = encode(&bag)?;
    table.insert(label, bytes.as_slice()).map_err(io_err)?;
    Ok(())
}

/// Point an existing bag at the flask derived from its tree.
pub(crate) fn attach_bag_to_flask(
    txn: &WriteTransaction,
    label: &str,
    flask: FlaskId,
) -> Result<(), CrucibleError> {
    let mut table = txn.open_table(BAGS).map_err(io_err)?;
    let existing = table.get(label).map_err(io_err)?.map(|v| v.value().to_vec());
    let Some(bytes) = existing else {
        return Err(CrucibleError::ValidationError(format!(
            "bag '{label}' is not registered"
        )));
    };
    let mut bag: Bag = decode(&bytes)?;
    bag.flask = Some(flask);
    let bytes = encode(&bag)?;
    table.insert(label, bytes.as_slice()).map_err(io_err)?;
    Ok(())
}

pub(crate) fn load_record<R: StageRecord>(
    txn: &WriteTransaction,
    flask: FlaskId,
) -> Result<Option<R>, CrucibleError> {
    let table = txn.open_table(R::TABLE).map_err(io_err)?;
    get_row(&table, flask.0)
}

/// Like `load_record`, but a missing record is `MissingUpstreamRecord`.
pub(crate) fn require_record<R: StageRecord>(
    txn: &WriteTransaction,
    flask: FlaskId,
) -> Result<R, CrucibleError> {
    load_record(txn, flask)?.ok_or(CrucibleError::MissingUpstreamRecord {
        flask,
        stage: R::KIND,
    })
}

/// Insert or replace the flask's record of this kind.
pub(crate) fn save_record<R: StageRecord>(
    txn: &WriteTransaction,
    flask: FlaskId,
    record: &R,
) -> Result<(), CrucibleError> {
    let bytes = encode(record)?;
    let mut table = txn.open_table(R::TABLE).map_err(io_err)?;
    table.insert(flask.0, bytes.as_slice()).map_err(io_err)?;
    Ok(())
}

fn read_record<R: StageRecord>(
    txn: &ReadTransaction,
    flask: FlaskId,
) -> Result<Option<R>, CrucibleError> {
    let table = txn.open_table(R::TABLE).map_err(io_err)?;
    get_row(&table, flask.0)
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::types::{Actor, TreeStatus, Weight};
    use chrono::{TimeZone, Utc};
    use std::collections::BTreeSet;
    use tempfile::tempdir;

    fn sample_tree(id: u64, number: &str) -> Tree {
        let at = Utc.with_ymd_and_hms(2026, 2, 2, 7, 30, 0).single().expect("time");
        Tree {
            id: TreeId(id),
            number: number.to_string(),
            metal: Metal::Gold14Yellow,
            gasket: Weight::from_grams(2),
            total: Weight::from_grams(12),
            tree_weight: Weight::from_grams(10),
            estimated_metal_weight: Weight::from_milligrams(132_500),
            status: TreeStatus::InTransit,
            bags: BTreeSet::from(["B-1".to_string()]),
            created_at: at,
            created_by: Actor::new("ana").expect("actor"),
        }
    }

    #[test]
    fn id_sequences_start_at_one() {
        let temp = tempdir().expect("temp dir");
        let store = Store::open(temp.path().join("floor.redb")).expect("open db");
        let ids = store
            .write(|txn| Ok((next_id(txn, NEXT_TREE_ID)?, next_id(txn, NEXT_TREE_ID)?)))
            .expect("write");
        assert_eq!(ids, (1, 2));
    }

    #[test]
    fn failed_write_is_rolled_back() {
        let temp = tempdir().expect("temp dir");
        let store = Store::open(temp.path().join("floor.redb")).expect("open db");
        let result: Result<(), _> = store.write(|txn| {
            save_tree(txn, &sample_tree(1, "T-1"))?;
            Err(CrucibleError::ValidationError("boom".to_string()))
        });
        assert!(result.is_err());
        assert!(matches!(store.tree(TreeId(1)), Err(CrucibleError::NotFound(_))));
    }

    #[test]
    fn tree_numbers_are_unique() {
        let temp = tempdir().expect("temp dir");
        let store = Store::open(temp.path().join("floor.redb")).expect("open db");
        store
            .write(|txn| claim_tree_number(txn, "T-1", TreeId(1)))
            .expect("first claim");
        let err = store
            .write(|txn| claim_tree_number(txn, "T-1", TreeId(2)))
            .expect_err("duplicate");
        assert_eq!(err.kind(), "conflict");
    }

    #[test]
    fn flask_numbers_are_unique_per_date() {
        let temp = tempdir().expect("temp dir");
        let store = Store::open(temp.path().join("floor.redb")).expect("open db");
        let monday = NaiveDate::from_ymd_opt(2026, 3, 2).expect("date");
        let tuesday = NaiveDate::from_ymd_opt(2026, 3, 3).expect("date");

        store
            .write(|txn| claim_flask_number(txn, monday, "7", FlaskId(1)))
            .expect("claim");
        store
            .write(|txn| claim_flask_number(txn, tuesday, "7", FlaskId(2)))
            .expect("other date is fine");
        let err = store
            .write(|txn| claim_flask_number(txn, monday, "7", FlaskId(3)))
            .expect_err("duplicate");
        assert_eq!(
            err,
            CrucibleError::Conflict("Flask #7 is already used on 03-02-2026".to_string())
        );
    }

    #[test]
    fn persistence_after_reopen() {
        let temp = tempdir().expect("temp dir");
        let db_path = temp.path().join("floor.redb");

        {
            let store = Store::open(&db_path).expect("open db");
            store
                .write(|txn| {
                    save_tree(txn, &sample_tree(1, "T-1"))?;
                    claim_bag(txn, "B-1", TreeId(1))
                })
                .expect("write");
        }

        {
            let store = Store::open(&db_path).expect("reopen db");
            let tree = store.tree(TreeId(1)).expect("tree");
            assert_eq!(tree.number, "T-1");
            let bag = store.bag("B-1").expect("read").expect("bag");
            assert_eq!(bag.tree, TreeId(1));
            assert_eq!(store.metals().expect("metals"), Metal::ALL.to_vec());
        }
    }
}
