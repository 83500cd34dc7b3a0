use crate::error::PersistenceError;
use crate::info;
use crate::model::pivot::PivotSchema;
use crate::model::registry::TableDef;
use crate::storage::{
    check_columns, indexed_values, pivot_pair, pivot_row, row_id, unique_violation, Catalog, PersistenceEngine,
    TableKind, Write,
};
use crate::value::{Row, Value};
use bincode::config::standard;
use redb::{
    Database, DatabaseError, MultimapTableDefinition, ReadableMultimapTable, ReadableTable, TableDefinition,
    ReadTransaction, TableError, WriteTransaction,
};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::{env, fmt, fs};

const SEQUENCES: TableDefinition<&str, u64> = TableDefinition::new("__sequences");

fn rows_def(name: &str) -> TableDefinition<'_, u64, &'static [u8]> {
    TableDefinition::new(name)
}

fn multimap_def<K: redb::Key + 'static>(name: &str) -> MultimapTableDefinition<'_, K, u64> {
    MultimapTableDefinition::new(name)
}

fn index_name(table: &str, column: &str) -> String {
    format!("{table}.{column}.index")
}

fn reverse_name(pivot: &str) -> String {
    format!("{pivot}.reverse")
}

fn encode_row(row: &Row) -> Result<Vec<u8>, PersistenceError> {
    Ok(bincode::encode_to_vec(row, standard())?)
}

fn decode_row(bytes: &[u8]) -> Result<Row, PersistenceError> {
    Ok(bincode::decode_from_slice::<Row, _>(bytes, standard())?.0)
}

fn encode_value(value: &Value) -> Result<Vec<u8>, PersistenceError> {
    Ok(bincode::encode_to_vec(value, standard())?)
}

/// Engine backed by a single redb database file.
///
/// Entity rows are bincode-encoded under their id, every indexed column gets a multimap
/// `{table}.{column}.index` from encoded value to ids, and each pivot is stored twice:
/// owner to targets under its own name and target to owners under `{table}.reverse`.
pub struct RedbEngine {
    db: Database,
    path: PathBuf,
    catalog: RwLock<Catalog>,
}

impl fmt::Debug for RedbEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedbEngine").field("path", &self.path).finish()
    }
}

impl RedbEngine {
    /// Creates the database file or opens an existing one.
    pub async fn open(path: PathBuf, cache_size_mb: usize) -> Result<Arc<RedbEngine>, PersistenceError> {
        if let Some(dir) = path.parent() {
            if !dir.exists() {
                fs::create_dir_all(dir)?;
            }
        }
        if path.exists() {
            info!("Opening existing db at {:?}", path);
        }
        let db_path = path.clone();
        let db = tokio::task::spawn_blocking(move || -> Result<Database, DatabaseError> {
            Database::builder().set_cache_size(cache_size_mb * 1024 * 1024).create(db_path)
        })
        .await??;
        Ok(Arc::new(RedbEngine { db, path, catalog: RwLock::new(Catalog::default()) }))
    }

    /// Fresh database under the system temp dir.
    pub async fn temp(name: &str) -> Result<Arc<RedbEngine>, PersistenceError> {
        let db_name = format!("{}_{}", name, rand::random::<u64>());
        let path = env::temp_dir().join("relbit").join(db_name).join("relbit.redb");
        Self::open(path, 16).await
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn apply(&self, tx: &WriteTransaction, catalog: &Catalog, write: &Write) -> Result<(), PersistenceError> {
        match catalog.kind(write.table())? {
            TableKind::Entity(def) => apply_entity(tx, def, write),
            TableKind::Pivot(pivot) => apply_pivot(tx, pivot, write),
        }
    }
}

fn apply_entity(tx: &WriteTransaction, def: &TableDef, write: &Write) -> Result<(), PersistenceError> {
    let mut rows = tx.open_table(rows_def(&def.name))?;
    match write {
        Write::Insert { row, .. } => {
            check_columns(def, row)?;
            let id = row_id(&def.name, row)?;
            if rows.get(id)?.is_some() {
                return Err(PersistenceError::Rejected(format!("{} already holds id {}", def.name, id)));
            }
            index_row(tx, def, id, row)?;
            rows.insert(id, encode_row(row)?.as_slice())?;
        }
        Write::Update { id, row, .. } => {
            check_columns(def, row)?;
            let old = match rows.get(*id)? {
                Some(guard) => decode_row(guard.value())?,
                None => return Err(PersistenceError::Rejected(format!("{} has no row {}", def.name, id))),
            };
            unindex_row(tx, def, *id, &old)?;
            let mut stored = row.clone();
            stored.insert("id".to_string(), Value::Id(*id));
            index_row(tx, def, *id, &stored)?;
            rows.insert(*id, encode_row(&stored)?.as_slice())?;
        }
        Write::Delete { row, .. } => {
            let id = row_id(&def.name, row)?;
            let old = match rows.remove(id)? {
                Some(guard) => Some(decode_row(guard.value())?),
                None => None,
            };
            if let Some(old) = old {
                unindex_row(tx, def, id, &old)?;
            }
        }
    }
    Ok(())
}

fn index_row(tx: &WriteTransaction, def: &TableDef, id: u64, row: &Row) -> Result<(), PersistenceError> {
    for (column, value) in indexed_values(def, row) {
        let mut index = tx.open_multimap_table(multimap_def::<&'static [u8]>(&index_name(&def.name, column)))?;
        let key = encode_value(value)?;
        if def.unique_columns.iter().any(|c| c == column) {
            for existing in index.get(key.as_slice())? {
                if existing?.value() != id {
                    return Err(unique_violation(def, column, value));
                }
            }
        }
        index.insert(key.as_slice(), id)?;
    }
    Ok(())
}

fn unindex_row(tx: &WriteTransaction, def: &TableDef, id: u64, row: &Row) -> Result<(), PersistenceError> {
    for (column, value) in indexed_values(def, row) {
        let mut index = tx.open_multimap_table(multimap_def::<&'static [u8]>(&index_name(&def.name, column)))?;
        index.remove(encode_value(value)?.as_slice(), id)?;
    }
    Ok(())
}

fn apply_pivot(tx: &WriteTransaction, pivot: &PivotSchema, write: &Write) -> Result<(), PersistenceError> {
    let reverse_table = reverse_name(&pivot.table);
    let mut forward = tx.open_multimap_table(multimap_def::<u64>(&pivot.table))?;
    let mut reverse = tx.open_multimap_table(multimap_def::<u64>(&reverse_table))?;
    match write {
        Write::Insert { row, .. } => {
            let (owner, target) = pivot_pair(pivot, row)?;
            if forward.insert(owner, target)? {
                return Err(PersistenceError::Rejected(format!(
                    "duplicate row ({}, {}) in {}",
                    owner, target, pivot.table
                )));
            }
            reverse.insert(target, owner)?;
        }
        Write::Delete { row, .. } => {
            let (owner, target) = pivot_pair(pivot, row)?;
            forward.remove(owner, target)?;
            reverse.remove(target, owner)?;
        }
        Write::Update { .. } => {
            return Err(PersistenceError::Rejected(format!("pivot table {} rows cannot be updated", pivot.table)));
        }
    }
    Ok(())
}

/// Missing tables read as empty; they are only created by the first write.
fn tolerate_missing<T: Default>(result: Result<T, PersistenceError>) -> Result<T, PersistenceError> {
    match result {
        Err(PersistenceError::RedbTable(TableError::TableDoesNotExist(_))) => Ok(T::default()),
        other => other,
    }
}

impl PersistenceEngine for RedbEngine {
    fn ensure_table(&self, table: &TableDef) -> Result<(), PersistenceError> {
        self.catalog.write()?.add_entity(table)?;
        let tx = self.db.begin_write()?;
        {
            tx.open_table(rows_def(&table.name))?;
            for column in &table.indexed_columns {
                tx.open_multimap_table(multimap_def::<&'static [u8]>(&index_name(&table.name, column)))?;
            }
        }
        tx.commit()?;
        log::debug!("ensured table {} with indexes {:?}", table.name, table.indexed_columns);
        Ok(())
    }

    fn ensure_pivot_table(&self, pivot: &PivotSchema) -> Result<(), PersistenceError> {
        self.catalog.write()?.add_pivot(pivot)?;
        let tx = self.db.begin_write()?;
        {
            tx.open_multimap_table(multimap_def::<u64>(&pivot.table))?;
            tx.open_multimap_table(multimap_def::<u64>(&reverse_name(&pivot.table)))?;
        }
        tx.commit()?;
        log::debug!("ensured pivot table {}", pivot);
        Ok(())
    }

    fn next_id(&self, table: &str) -> Result<u64, PersistenceError> {
        self.catalog.read()?.entity(table)?;
        let tx = self.db.begin_write()?;
        let next = {
            let mut sequences = tx.open_table(SEQUENCES)?;
            let next = sequences.get(table)?.map(|g| g.value()).unwrap_or(0) + 1;
            sequences.insert(table, next)?;
            next
        };
        tx.commit()?;
        Ok(next)
    }

    fn write_batch(&self, batch: &[Write]) -> Result<(), PersistenceError> {
        let catalog = self.catalog.read()?;
        let tx = self.db.begin_write()?;
        let applied = batch.iter().try_for_each(|write| self.apply(&tx, &catalog, write));
        match applied {
            Ok(()) => {
                tx.commit()?;
                Ok(())
            }
            Err(e) => {
                tx.abort()?;
                Err(e)
            }
        }
    }

    fn get_by_id(&self, table: &str, id: u64) -> Result<Option<Row>, PersistenceError> {
        let catalog = self.catalog.read()?;
        let def = catalog.entity(table)?;
        let tx = self.db.begin_read()?;
        Ok(tolerate_missing(read_by_ids(&tx, def, &[id]))?.pop())
    }

    fn get_many(&self, table: &str, ids: &[u64]) -> Result<Vec<Row>, PersistenceError> {
        let catalog = self.catalog.read()?;
        let def = catalog.entity(table)?;
        let tx = self.db.begin_read()?;
        tolerate_missing(read_by_ids(&tx, def, ids))
    }

    fn query_by_foreign_key(&self, table: &str, column: &str, id: u64) -> Result<Vec<Row>, PersistenceError> {
        let catalog = self.catalog.read()?;
        let tx = self.db.begin_read()?;
        match catalog.kind(table)? {
            TableKind::Entity(def) if def.indexed_columns.iter().any(|c| c == column) => {
                tolerate_missing(read_indexed(&tx, def, column, &Value::Id(id)))
            }
            TableKind::Entity(def) => {
                let wanted = Value::Id(id);
                let rows = tolerate_missing(read_rows(&tx, def))?;
                Ok(rows.into_iter().filter(|row| row.get(column) == Some(&wanted)).collect())
            }
            TableKind::Pivot(pivot) => {
                if column == pivot.owner_column {
                    tolerate_missing(read_pivot_side(&tx, pivot, &pivot.table, id, true))
                } else if column == pivot.target_column {
                    tolerate_missing(read_pivot_side(&tx, pivot, &reverse_name(&pivot.table), id, false))
                } else {
                    Err(PersistenceError::Rejected(format!("{} has no column {}", pivot.table, column)))
                }
            }
        }
    }

    fn scan(&self, table: &str) -> Result<Vec<Row>, PersistenceError> {
        let catalog = self.catalog.read()?;
        let tx = self.db.begin_read()?;
        match catalog.kind(table)? {
            TableKind::Entity(def) => tolerate_missing(read_rows(&tx, def)),
            TableKind::Pivot(pivot) => tolerate_missing(read_pairs(&tx, pivot)),
        }
    }
}

fn read_rows(tx: &ReadTransaction, def: &TableDef) -> Result<Vec<Row>, PersistenceError> {
    let rows = tx.open_table(rows_def(&def.name))?;
    let mut found = Vec::new();
    for entry in rows.iter()? {
        let (_, bytes) = entry?;
        found.push(decode_row(bytes.value())?);
    }
    Ok(found)
}

fn read_by_ids(tx: &ReadTransaction, def: &TableDef, ids: &[u64]) -> Result<Vec<Row>, PersistenceError> {
    let rows = tx.open_table(rows_def(&def.name))?;
    let mut found = Vec::with_capacity(ids.len());
    for id in ids {
        if let Some(guard) = rows.get(*id)? {
            found.push(decode_row(guard.value())?);
        }
    }
    Ok(found)
}

fn read_indexed(tx: &ReadTransaction, def: &TableDef, column: &str, value: &Value) -> Result<Vec<Row>, PersistenceError> {
    let index = tx.open_multimap_table(multimap_def::<&'static [u8]>(&index_name(&def.name, column)))?;
    let rows = tx.open_table(rows_def(&def.name))?;
    let mut found = Vec::new();
    for pk in index.get(encode_value(value)?.as_slice())? {
        if let Some(guard) = rows.get(pk?.value())? {
            found.push(decode_row(guard.value())?);
        }
    }
    Ok(found)
}

fn read_pivot_side(
    tx: &ReadTransaction,
    pivot: &PivotSchema,
    name: &str,
    id: u64,
    forward: bool,
) -> Result<Vec<Row>, PersistenceError> {
    let pairs = tx.open_multimap_table(multimap_def::<u64>(name))?;
    let mut found = Vec::new();
    for other in pairs.get(id)? {
        let other = other?.value();
        found.push(if forward { pivot_row(pivot, id, other) } else { pivot_row(pivot, other, id) });
    }
    Ok(found)
}

fn read_pairs(tx: &ReadTransaction, pivot: &PivotSchema) -> Result<Vec<Row>, PersistenceError> {
    let pairs = tx.open_multimap_table(multimap_def::<u64>(&pivot.table))?;
    let mut found = Vec::new();
    for entry in pairs.iter()? {
        let (owner, targets) = entry?;
        let owner = owner.value();
        for target in targets {
            found.push(pivot_row(pivot, owner, target?.value()));
        }
    }
    Ok(found)
}

#[cfg(all(test, not(feature = "integration")))]
mod tests {
    use super::*;
    use crate::test_utils::{privilege_pivot, user_table};

    fn user(id: u64, email: &str) -> Row {
        let mut row = Row::new();
        row.insert("id".into(), Value::Id(id));
        row.insert("type".into(), Value::from("super_user"));
        row.insert("email".into(), Value::from(email));
        row
    }

    async fn engine(name: &str) -> Arc<RedbEngine> {
        let engine = RedbEngine::temp(name).await.unwrap();
        engine.ensure_table(&user_table()).unwrap();
        engine.ensure_pivot_table(&privilege_pivot()).unwrap();
        engine
    }

    #[tokio::test]
    async fn rows_survive_reopening() {
        let engine = engine("redb_reopen").await;
        let path = engine.path().to_path_buf();
        engine.insert_row("user", user(1, "a@x")).unwrap();
        assert_eq!(engine.next_id("user").unwrap(), 1);
        drop(engine);

        let reopened = RedbEngine::open(path, 16).await.unwrap();
        reopened.ensure_table(&user_table()).unwrap();
        assert_eq!(reopened.scan("user").unwrap(), vec![user(1, "a@x")]);
        assert_eq!(reopened.next_id("user").unwrap(), 2);
    }

    #[tokio::test]
    async fn aborted_batch_keeps_previous_state() {
        let engine = engine("redb_abort").await;
        let pivot = privilege_pivot();
        engine.insert_row(&pivot.table, pivot_row(&pivot, 1, 10)).unwrap();
        let batch = vec![
            Write::Insert { table: pivot.table.clone(), row: pivot_row(&pivot, 1, 11) },
            Write::Insert { table: pivot.table.clone(), row: pivot_row(&pivot, 1, 10) },
        ];
        assert!(matches!(engine.write_batch(&batch), Err(PersistenceError::Rejected(_))));
        assert_eq!(engine.scan(&pivot.table).unwrap(), vec![pivot_row(&pivot, 1, 10)]);
    }

    #[tokio::test]
    async fn unique_index_rejects_second_owner() {
        let engine = engine("redb_unique").await;
        engine.insert_row("user", user(1, "a@x")).unwrap();
        assert!(engine.insert_row("user", user(2, "a@x")).is_err());
        engine.write_batch(&[Write::Update { table: "user".into(), id: 1, row: user(1, "b@x") }]).unwrap();
        engine.insert_row("user", user(2, "a@x")).unwrap();
        assert_eq!(engine.scan("user").unwrap().len(), 2);
    }

    #[tokio::test]
    async fn rows_are_read_by_primary_key() {
        let engine = engine("redb_get").await;
        engine.insert_row("user", user(1, "a@x")).unwrap();
        engine.insert_row("user", user(3, "c@x")).unwrap();
        assert_eq!(engine.get_by_id("user", 3).unwrap(), Some(user(3, "c@x")));
        assert_eq!(engine.get_by_id("user", 2).unwrap(), None);
        assert_eq!(engine.get_many("user", &[3, 2, 1]).unwrap(), vec![user(3, "c@x"), user(1, "a@x")]);
        assert!(engine.get_by_id(&privilege_pivot().table, 1).is_err());
    }

    #[tokio::test]
    async fn pivot_lookups_work_in_both_directions() {
        let engine = engine("redb_pivot").await;
        let pivot = privilege_pivot();
        for (user, privilege) in [(1, 10), (1, 11), (2, 10)] {
            engine.insert_row(&pivot.table, pivot_row(&pivot, user, privilege)).unwrap();
        }
        assert_eq!(
            engine.query_by_foreign_key(&pivot.table, "user_id", 1).unwrap(),
            vec![pivot_row(&pivot, 1, 10), pivot_row(&pivot, 1, 11)]
        );
        assert_eq!(
            engine.query_by_foreign_key(&pivot.table, "privilege_id", 10).unwrap(),
            vec![pivot_row(&pivot, 1, 10), pivot_row(&pivot, 2, 10)]
        );
        engine.delete_row(&pivot.table, pivot_row(&pivot, 2, 10)).unwrap();
        assert_eq!(engine.query_by_foreign_key(&pivot.table, "privilege_id", 10).unwrap().len(), 1);
    }
}
