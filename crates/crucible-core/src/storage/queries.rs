//! Read-side queries. Each call runs in its own read transaction and sees
//! a consistent snapshot.

use super::{
    BAGS, FLASK_NUMBERS, FLASKS, METALS, STAGE_INDEX, Store, TREES, all_rows, date_key, decode,
    flask_number_conflict, get_row, io_err, read_record,
};
use crate::metal::Metal;
use crate::types::{
    Bag, CrucibleError, Flask, FlaskDossier, FlaskId, QuenchingRecord, Stage, Tree, TreeId,
    TreeStatus, UnitRef,
};
use chrono::{DateTime, NaiveDate, Utc};
use redb::{ReadTransaction, ReadableTable, ReadableTableMetadata};
use std::cmp::Reverse;

impl Store {
    pub fn tree(&self, id: TreeId) -> Result<Tree, CrucibleError> {
        let txn = self.read()?;
        let table = txn.open_table(TREES).map_err(io_err)?;
        get_row(&table, id.0)?.ok_or(CrucibleError::NotFound(UnitRef::Tree(id)))
    }

    pub fn flask(&self, id: FlaskId) -> Result<Flask, CrucibleError> {
        let txn = self.read()?;
        flask_in(&txn, id)
    }

    /// A flask and every stage record posted for it, from one snapshot.
    pub fn dossier(&self, id: FlaskId) -> Result<FlaskDossier, CrucibleError> {
        let txn = self.read()?;
        Ok(FlaskDossier {
            flask: flask_in(&txn, id)?,
            waxing: read_record(&txn, id)?,
            metal_prep: read_record(&txn, id)?,
            supply: read_record(&txn, id)?,
            casting: read_record(&txn, id)?,
            quenching: read_record(&txn, id)?,
            cutting: read_record(&txn, id)?,
            reconciliation: read_record(&txn, id)?,
        })
    }

    /// The work queue of one stage: newest date first, then metal, then
    /// flask number.
    pub fn flasks_in_stage(&self, stage: Stage) -> Result<Vec<Flask>, CrucibleError> {
        let txn = self.read()?;
        let mut flasks = Vec::new();
        for id in flask_ids_in(&txn, stage)? {
            flasks.push(flask_in(&txn, id)?);
        }
        flasks.sort_by(|a, b| {
            (Reverse(a.date), a.metal, number_key(&a.number))
                .cmp(&(Reverse(b.date), b.metal, number_key(&b.number)))
        });
        Ok(flasks)
    }

    /// Trees received but not yet invested, oldest first.
    pub fn trees_in_transit(&self) -> Result<Vec<Tree>, CrucibleError> {
        let txn = self.read()?;
        let table = txn.open_table(TREES).map_err(io_err)?;
        let trees: Vec<Tree> = all_rows(&table)?;
        Ok(trees
            .into_iter()
            .filter(|tree| tree.status == TreeStatus::InTransit)
            .collect())
    }

    /// Fails with the `Conflict` a waxing post would raise if `number` is
    /// already used on `date`.
    pub fn check_flask_number(&self, date: NaiveDate, number: &str) -> Result<(), CrucibleError> {
        let number = number.trim();
        if number.is_empty() {
            return Err(CrucibleError::ValidationError(
                "flask number must not be empty".to_string(),
            ));
        }
        let txn = self.read()?;
        let table = txn.open_table(FLASK_NUMBERS).map_err(io_err)?;
        if table.get((date_key(date), number)).map_err(io_err)?.is_some() {
            return Err(flask_number_conflict(number, date));
        }
        Ok(())
    }

    pub fn bag(&self, label: &str) -> Result<Option<Bag>, CrucibleError> {
        let txn = self.read()?;
        let table = txn.open_table(BAGS).map_err(io_err)?;
        match table.get(label.trim()).map_err(io_err)? {
            Some(data) => decode(data.value()).map(Some),
            None => Ok(None),
        }
    }

    /// Number of flasks currently in each stage, in pipeline order.
    pub fn stage_counts(&self) -> Result<Vec<(Stage, usize)>, CrucibleError> {
        let txn = self.read()?;
        let mut counts = Vec::with_capacity(Stage::ALL.len());
        for stage in Stage::ALL {
            counts.push((stage, flask_ids_in(&txn, stage)?.len()));
        }
        Ok(counts)
    }

    /// Total number of flasks ever created.
    pub fn flask_count(&self) -> Result<u64, CrucibleError> {
        let txn = self.read()?;
        let table = txn.open_table(FLASKS).map_err(io_err)?;
        table.len().map_err(io_err)
    }

    /// The metal catalogue recorded in this database.
    pub fn metals(&self) -> Result<Vec<Metal>, CrucibleError> {
        let txn = self.read()?;
        let table = txn.open_table(METALS).map_err(io_err)?;
        let mut metals = Vec::new();
        for entry in table.iter().map_err(io_err)? {
            let (key, code) = entry.map_err(io_err)?;
            let metal = Metal::from_ordinal(key.value()).ok_or_else(|| {
                CrucibleError::SerializationError(format!(
                    "unknown metal '{}' in catalogue",
                    code.value()
                ))
            })?;
            metals.push(metal);
        }
        Ok(metals)
    }

    /// Flasks in quenching whose ready time is at or before `cutoff`.
    pub fn quenched_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<FlaskId>, CrucibleError> {
        let txn = self.read()?;
        let mut ready = Vec::new();
        for id in flask_ids_in(&txn, Stage::Quenching)? {
            let record: Option<QuenchingRecord> = read_record(&txn, id)?;
            if record.is_some_and(|r| r.ready_at <= cutoff) {
                ready.push(id);
            }
        }
        Ok(ready)
    }
}

fn flask_in(txn: &ReadTransaction, id: FlaskId) -> Result<Flask, CrucibleError> {
    let table = txn.open_table(FLASKS).map_err(io_err)?;
    get_row(&table, id.0)?.ok_or(CrucibleError::NotFound(UnitRef::Flask(id)))
}

fn flask_ids_in(txn: &ReadTransaction, stage: Stage) -> Result<Vec<FlaskId>, CrucibleError> {
    let index = txn.open_table(STAGE_INDEX).map_err(io_err)?;
    let key = stage.ordinal();
    let mut ids = Vec::new();
    for entry in index
        .range((key, 0u64)..=(key, u64::MAX))
        .map_err(io_err)?
    {
        let (k, _) = entry.map_err(io_err)?;
        ids.push(FlaskId(k.value().1));
    }
    Ok(ids)
}

/// Numeric flask numbers sort numerically, anything else after them as text.
fn number_key(number: &str) -> (u64, &str) {
    (number.parse::<u64>().unwrap_or(u64::MAX), number)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numbers_sort_naturally() {
        let mut numbers = vec!["10", "9", "A2", "100"];
        numbers.sort_by(|a, b| number_key(a).cmp(&number_key(b)));
        assert_eq!(numbers, vec!["9", "10", "100", "A2"]);
    }
}
