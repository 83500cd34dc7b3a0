use crate::error::PersistenceError;
use crate::model::pivot::PivotSchema;
use crate::model::registry::TableDef;
use crate::storage::{
    check_columns, indexed_values, pivot_pair, pivot_row, row_id, unique_violation, Catalog, PersistenceEngine,
    TableKind, Write,
};
use crate::value::Row;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

#[derive(Debug, Clone, Default)]
struct State {
    catalog: Catalog,
    rows: HashMap<String, BTreeMap<u64, Row>>,
    pairs: HashMap<String, BTreeSet<(u64, u64)>>,
    sequences: HashMap<String, u64>,
}

/// Engine keeping everything in process memory. A batch is applied to a copy of the state
/// which replaces the original only when every write succeeded.
#[derive(Debug, Default)]
pub struct MemoryEngine {
    state: Mutex<State>,
    failures: AtomicUsize,
    read_failures: AtomicUsize,
    batches: AtomicUsize,
}

impl MemoryEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// The next `n` calls to `write_batch` fail without touching any table.
    pub fn fail_next_writes(&self, n: usize) {
        self.failures.store(n, Ordering::SeqCst);
    }

    /// The next `n` reads (`get_by_id`, `get_many`, `query_by_foreign_key`, `scan`) fail.
    pub fn fail_next_reads(&self, n: usize) {
        self.read_failures.store(n, Ordering::SeqCst);
    }

    /// Number of batches committed so far.
    pub fn committed_batches(&self) -> usize {
        self.batches.load(Ordering::SeqCst)
    }

    fn take_failure(&self) -> bool {
        take_one(&self.failures)
    }

    fn check_read(&self) -> Result<(), PersistenceError> {
        if take_one(&self.read_failures) {
            Err(PersistenceError::Rejected("injected read failure".to_string()))
        } else {
            Ok(())
        }
    }
}

fn take_one(counter: &AtomicUsize) -> bool {
    counter.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1)).is_ok()
}

impl State {
    fn apply(&mut self, write: &Write) -> Result<(), PersistenceError> {
        let table = write.table();
        match self.catalog.kind(table)? {
            TableKind::Entity(def) => {
                let def = def.clone();
                self.apply_entity(&def, write)
            }
            TableKind::Pivot(pivot) => {
                let pivot = pivot.clone();
                self.apply_pivot(&pivot, write)
            }
        }
    }

    fn apply_entity(&mut self, def: &TableDef, write: &Write) -> Result<(), PersistenceError> {
        let rows = self.rows.entry(def.name.clone()).or_default();
        match write {
            Write::Insert { row, .. } => {
                check_columns(def, row)?;
                let id = row_id(&def.name, row)?;
                if rows.contains_key(&id) {
                    return Err(PersistenceError::Rejected(format!("{} already holds id {}", def.name, id)));
                }
                check_unique(def, rows, id, row)?;
                rows.insert(id, row.clone());
            }
            Write::Update { id, row, .. } => {
                check_columns(def, row)?;
                if !rows.contains_key(id) {
                    return Err(PersistenceError::Rejected(format!("{} has no row {}", def.name, id)));
                }
                check_unique(def, rows, *id, row)?;
                let mut stored = row.clone();
                stored.insert("id".to_string(), crate::value::Value::Id(*id));
                rows.insert(*id, stored);
            }
            Write::Delete { row, .. } => {
                let id = row_id(&def.name, row)?;
                rows.remove(&id);
            }
        }
        Ok(())
    }

    fn apply_pivot(&mut self, pivot: &PivotSchema, write: &Write) -> Result<(), PersistenceError> {
        let pairs = self.pairs.entry(pivot.table.clone()).or_default();
        match write {
            Write::Insert { row, .. } => {
                let pair = pivot_pair(pivot, row)?;
                if !pairs.insert(pair) {
                    return Err(PersistenceError::Rejected(format!(
                        "duplicate row ({}, {}) in {}",
                        pair.0, pair.1, pivot.table
                    )));
                }
            }
            Write::Delete { row, .. } => {
                pairs.remove(&pivot_pair(pivot, row)?);
            }
            Write::Update { .. } => {
                return Err(PersistenceError::Rejected(format!("pivot table {} rows cannot be updated", pivot.table)));
            }
        }
        Ok(())
    }
}

fn check_unique(def: &TableDef, rows: &BTreeMap<u64, Row>, id: u64, row: &Row) -> Result<(), PersistenceError> {
    for column in &def.unique_columns {
        let Some(value) = row.get(column).filter(|v| !v.is_null()) else { continue };
        let taken = rows.iter().any(|(other, stored)| *other != id && stored.get(column) == Some(value));
        if taken {
            return Err(unique_violation(def, column, value));
        }
    }
    Ok(())
}

impl PersistenceEngine for MemoryEngine {
    fn ensure_table(&self, table: &TableDef) -> Result<(), PersistenceError> {
        let mut state = self.state.lock()?;
        state.catalog.add_entity(table)?;
        state.rows.entry(table.name.clone()).or_default();
        Ok(())
    }

    fn ensure_pivot_table(&self, pivot: &PivotSchema) -> Result<(), PersistenceError> {
        let mut state = self.state.lock()?;
        state.catalog.add_pivot(pivot)?;
        state.pairs.entry(pivot.table.clone()).or_default();
        Ok(())
    }

    fn next_id(&self, table: &str) -> Result<u64, PersistenceError> {
        let mut state = self.state.lock()?;
        state.catalog.entity(table)?;
        let seq = state.sequences.entry(table.to_string()).or_insert(0);
        *seq += 1;
        Ok(*seq)
    }

    fn write_batch(&self, batch: &[Write]) -> Result<(), PersistenceError> {
        if self.take_failure() {
            return Err(PersistenceError::Rejected("injected write failure".to_string()));
        }
        let mut state = self.state.lock()?;
        let mut next = state.clone();
        for write in batch {
            next.apply(write)?;
        }
        *state = next;
        self.batches.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn get_by_id(&self, table: &str, id: u64) -> Result<Option<Row>, PersistenceError> {
        self.check_read()?;
        let state = self.state.lock()?;
        let def = state.catalog.entity(table)?;
        Ok(state.rows.get(&def.name).and_then(|rows| rows.get(&id)).cloned())
    }

    fn get_many(&self, table: &str, ids: &[u64]) -> Result<Vec<Row>, PersistenceError> {
        self.check_read()?;
        let state = self.state.lock()?;
        let def = state.catalog.entity(table)?;
        let Some(rows) = state.rows.get(&def.name) else { return Ok(Vec::new()) };
        Ok(ids.iter().filter_map(|id| rows.get(id).cloned()).collect())
    }

    fn query_by_foreign_key(&self, table: &str, column: &str, id: u64) -> Result<Vec<Row>, PersistenceError> {
        self.check_read()?;
        let state = self.state.lock()?;
        match state.catalog.kind(table)? {
            TableKind::Entity(def) => {
                let wanted = crate::value::Value::Id(id);
                Ok(state
                    .rows
                    .get(&def.name)
                    .map(|rows| rows.values().filter(|row| row.get(column) == Some(&wanted)).cloned().collect())
                    .unwrap_or_default())
            }
            TableKind::Pivot(pivot) => {
                let pairs = state.pairs.get(&pivot.table).cloned().unwrap_or_default();
                if column == pivot.owner_column {
                    Ok(pairs.iter().filter(|(o, _)| *o == id).map(|(o, t)| pivot_row(pivot, *o, *t)).collect())
                } else if column == pivot.target_column {
                    let mut owners: Vec<(u64, u64)> = pairs.into_iter().filter(|(_, t)| *t == id).collect();
                    owners.sort();
                    Ok(owners.into_iter().map(|(o, t)| pivot_row(pivot, o, t)).collect())
                } else {
                    Err(PersistenceError::Rejected(format!("{} has no column {}", pivot.table, column)))
                }
            }
        }
    }

    fn scan(&self, table: &str) -> Result<Vec<Row>, PersistenceError> {
        self.check_read()?;
        let state = self.state.lock()?;
        match state.catalog.kind(table)? {
            TableKind::Entity(def) => {
                Ok(state.rows.get(&def.name).map(|rows| rows.values().cloned().collect()).unwrap_or_default())
            }
            TableKind::Pivot(pivot) => Ok(state
                .pairs
                .get(&pivot.table)
                .map(|pairs| pairs.iter().map(|(o, t)| pivot_row(pivot, *o, *t)).collect())
                .unwrap_or_default()),
        }
    }
}

#[cfg(all(test, not(feature = "integration")))]
mod tests {
    use super::*;
    use crate::test_utils::{privilege_pivot, user_table};
    use crate::value::Value;

    fn user(id: u64, email: &str) -> Row {
        let mut row = Row::new();
        row.insert("id".into(), Value::Id(id));
        row.insert("type".into(), Value::from("user"));
        row.insert("email".into(), Value::from(email));
        row
    }

    fn engine() -> MemoryEngine {
        let engine = MemoryEngine::new();
        engine.ensure_table(&user_table()).unwrap();
        engine.ensure_pivot_table(&privilege_pivot()).unwrap();
        engine
    }

    #[test]
    fn failed_batch_leaves_no_trace() {
        let engine = engine();
        let pivot = privilege_pivot();
        let batch = vec![
            Write::Insert { table: "user".into(), row: user(1, "a@x") },
            Write::Insert { table: pivot.table.clone(), row: pivot_row(&pivot, 1, 7) },
            Write::Insert { table: pivot.table.clone(), row: pivot_row(&pivot, 1, 7) },
        ];
        assert!(engine.write_batch(&batch).is_err());
        assert!(engine.scan("user").unwrap().is_empty());
        assert!(engine.scan(&pivot.table).unwrap().is_empty());
        assert_eq!(engine.committed_batches(), 0);
    }

    #[test]
    fn injected_failures_are_consumed_one_batch_at_a_time() {
        let engine = engine();
        engine.fail_next_writes(1);
        assert!(engine.insert_row("user", user(1, "a@x")).is_err());
        engine.insert_row("user", user(1, "a@x")).unwrap();
        assert_eq!(engine.scan("user").unwrap().len(), 1);
    }

    #[test]
    fn unique_columns_are_enforced() {
        let engine = engine();
        engine.insert_row("user", user(1, "a@x")).unwrap();
        assert!(matches!(engine.insert_row("user", user(2, "a@x")), Err(PersistenceError::Rejected(_))));
        engine
            .write_batch(&[Write::Update { table: "user".into(), id: 1, row: user(1, "a@x") }])
            .unwrap();
    }

    #[test]
    fn pivot_rows_are_readable_from_both_sides() {
        let engine = engine();
        let pivot = privilege_pivot();
        for (user, privilege) in [(1, 10), (1, 11), (2, 10)] {
            engine.insert_row(&pivot.table, pivot_row(&pivot, user, privilege)).unwrap();
        }
        let of_user = engine.query_by_foreign_key(&pivot.table, "user_id", 1).unwrap();
        assert_eq!(of_user, vec![pivot_row(&pivot, 1, 10), pivot_row(&pivot, 1, 11)]);
        let of_privilege = engine.query_by_foreign_key(&pivot.table, "privilege_id", 10).unwrap();
        assert_eq!(of_privilege.len(), 2);
        engine.delete_row(&pivot.table, pivot_row(&pivot, 1, 10)).unwrap();
        assert_eq!(engine.scan(&pivot.table).unwrap().len(), 2);
    }

    #[test]
    fn rows_are_read_by_primary_key() {
        let engine = engine();
        engine.insert_row("user", user(1, "a@x")).unwrap();
        engine.insert_row("user", user(3, "c@x")).unwrap();
        assert_eq!(engine.get_by_id("user", 3).unwrap(), Some(user(3, "c@x")));
        assert_eq!(engine.get_by_id("user", 2).unwrap(), None);
        assert_eq!(engine.get_many("user", &[3, 2, 1]).unwrap(), vec![user(3, "c@x"), user(1, "a@x")]);
        assert!(engine.get_by_id("privilege_user", 1).is_err());
    }

    #[test]
    fn injected_read_failures_are_consumed_one_read_at_a_time() {
        let engine = engine();
        engine.insert_row("user", user(1, "a@x")).unwrap();
        engine.fail_next_reads(2);
        assert!(matches!(engine.scan("user"), Err(PersistenceError::Rejected(_))));
        assert!(engine.get_by_id("user", 1).is_err());
        assert_eq!(engine.get_by_id("user", 1).unwrap(), Some(user(1, "a@x")));
    }

    #[test]
    fn sequences_are_per_table() {
        let engine = engine();
        assert_eq!(engine.next_id("user").unwrap(), 1);
        assert_eq!(engine.next_id("user").unwrap(), 2);
        assert!(engine.next_id("privilege_user").is_err());
    }
}
