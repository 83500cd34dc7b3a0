//! Persistence engines the unit of work writes through.
//!
//! Engines only know two kinds of tables: entity tables keyed by `id` with secondary indexes
//! on the columns listed in their [`TableDef`], and pivot tables holding `(owner, target)` id
//! pairs readable from either side. Both have to be ensured before use.

pub mod memory;
pub mod redb_engine;

use crate::error::PersistenceError;
use crate::model::pivot::PivotSchema;
use crate::model::registry::TableDef;
use crate::value::{Row, Value};
use std::collections::HashMap;
use std::fmt;

pub use memory::MemoryEngine;
pub use redb_engine::RedbEngine;

/// One storage mutation. A batch of them is applied atomically.
#[derive(Debug, Clone, PartialEq)]
pub enum Write {
    /// Entity rows carry their `id`; pivot rows carry both pivot columns.
    Insert { table: String, row: Row },
    /// Replaces the whole entity row stored under `id`.
    Update { table: String, id: u64, row: Row },
    /// Entity rows are matched by `id`, pivot rows by both columns.
    Delete { table: String, row: Row },
}

impl Write {
    pub fn table(&self) -> &str {
        match self {
            Write::Insert { table, .. } | Write::Update { table, .. } | Write::Delete { table, .. } => table,
        }
    }
}

impl fmt::Display for Write {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let render = |row: &Row| row.iter().map(|(c, v)| format!("{c}={v}")).collect::<Vec<_>>().join(", ");
        match self {
            Write::Insert { table, row } => write!(f, "INSERT {table} ({})", render(row)),
            Write::Update { table, id, row } => write!(f, "UPDATE {table} #{id} ({})", render(row)),
            Write::Delete { table, row } => write!(f, "DELETE {table} ({})", render(row)),
        }
    }
}

pub trait PersistenceEngine: Send + Sync + fmt::Debug {
    fn ensure_table(&self, table: &TableDef) -> Result<(), PersistenceError>;

    fn ensure_pivot_table(&self, pivot: &PivotSchema) -> Result<(), PersistenceError>;

    /// Next primary key of an entity table; ids start at 1 and are never reused.
    fn next_id(&self, table: &str) -> Result<u64, PersistenceError>;

    /// All or nothing, in order.
    fn write_batch(&self, batch: &[Write]) -> Result<(), PersistenceError>;

    fn insert_row(&self, table: &str, row: Row) -> Result<(), PersistenceError> {
        self.write_batch(&[Write::Insert { table: table.to_string(), row }])
    }

    fn delete_row(&self, table: &str, row: Row) -> Result<(), PersistenceError> {
        self.write_batch(&[Write::Delete { table: table.to_string(), row }])
    }

    /// Entity row stored under primary key `id`.
    fn get_by_id(&self, table: &str, id: u64) -> Result<Option<Row>, PersistenceError>;

    /// Rows of the ids that exist, in the order of `ids`.
    fn get_many(&self, table: &str, ids: &[u64]) -> Result<Vec<Row>, PersistenceError> {
        let mut found = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(row) = self.get_by_id(table, *id)? {
                found.push(row);
            }
        }
        Ok(found)
    }

    /// Rows whose `column` holds `id`. Entity rows come back ordered by id, pivot rows by the
    /// opposite column.
    fn query_by_foreign_key(&self, table: &str, column: &str, id: u64) -> Result<Vec<Row>, PersistenceError>;

    /// Every row of a table, ordered by id (entity tables) or by pair (pivot tables).
    fn scan(&self, table: &str) -> Result<Vec<Row>, PersistenceError>;
}

/// Table layouts an engine has been asked to ensure.
#[derive(Debug, Clone, Default)]
pub(crate) struct Catalog {
    entities: HashMap<String, TableDef>,
    pivots: HashMap<String, PivotSchema>,
}

pub(crate) enum TableKind<'a> {
    Entity(&'a TableDef),
    Pivot(&'a PivotSchema),
}

impl Catalog {
    pub(crate) fn add_entity(&mut self, table: &TableDef) -> Result<(), PersistenceError> {
        if self.pivots.contains_key(&table.name) {
            return Err(PersistenceError::Rejected(format!("{} is already a pivot table", table.name)));
        }
        self.entities.insert(table.name.clone(), table.clone());
        Ok(())
    }

    pub(crate) fn add_pivot(&mut self, pivot: &PivotSchema) -> Result<(), PersistenceError> {
        if self.entities.contains_key(&pivot.table) {
            return Err(PersistenceError::Rejected(format!("{} is already an entity table", pivot.table)));
        }
        self.pivots.insert(pivot.table.clone(), pivot.clone());
        Ok(())
    }

    pub(crate) fn kind(&self, table: &str) -> Result<TableKind<'_>, PersistenceError> {
        if let Some(def) = self.entities.get(table) {
            Ok(TableKind::Entity(def))
        } else if let Some(pivot) = self.pivots.get(table) {
            Ok(TableKind::Pivot(pivot))
        } else {
            Err(PersistenceError::Rejected(format!("unknown table {table}")))
        }
    }

    pub(crate) fn entity(&self, table: &str) -> Result<&TableDef, PersistenceError> {
        match self.kind(table)? {
            TableKind::Entity(def) => Ok(def),
            TableKind::Pivot(_) => Err(PersistenceError::Rejected(format!("{table} is a pivot table"))),
        }
    }
}

pub(crate) fn row_id(table: &str, row: &Row) -> Result<u64, PersistenceError> {
    row.get("id")
        .and_then(Value::as_id)
        .ok_or_else(|| PersistenceError::Rejected(format!("row of {table} has no id")))
}

/// `(owner, target)` of a pivot row.
pub(crate) fn pivot_pair(pivot: &PivotSchema, row: &Row) -> Result<(u64, u64), PersistenceError> {
    let column = |name: &str| {
        row.get(name)
            .and_then(Value::as_id)
            .ok_or_else(|| PersistenceError::Rejected(format!("pivot row of {} has no {}", pivot.table, name)))
    };
    Ok((column(&pivot.owner_column)?, column(&pivot.target_column)?))
}

pub(crate) fn pivot_row(pivot: &PivotSchema, owner: u64, target: u64) -> Row {
    let mut row = Row::new();
    row.insert(pivot.owner_column.clone(), Value::Id(owner));
    row.insert(pivot.target_column.clone(), Value::Id(target));
    row
}

/// Indexed columns with a non-null value in `row`.
pub(crate) fn indexed_values<'r>(def: &'r TableDef, row: &'r Row) -> impl Iterator<Item = (&'r str, &'r Value)> {
    def.indexed_columns
        .iter()
        .filter_map(move |column| row.get(column).filter(|v| !v.is_null()).map(|v| (column.as_str(), v)))
}

pub(crate) fn check_columns(def: &TableDef, row: &Row) -> Result<(), PersistenceError> {
    match row.keys().find(|c| !def.has_column(c)) {
        Some(column) => Err(PersistenceError::Rejected(format!("{} has no column {}", def.name, column))),
        None => Ok(()),
    }
}

pub(crate) fn unique_violation(def: &TableDef, column: &str, value: &Value) -> PersistenceError {
    PersistenceError::Rejected(format!("unique constraint {}.{} violated by {}", def.name, column, value))
}
