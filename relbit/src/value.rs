use bincode::{Decode, Encode};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;

/// A single stored cell.
#[derive(Debug, Clone, PartialEq, Encode, Decode, Serialize)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Id(u64),
}

impl Value {
    pub fn as_id(&self) -> Option<u64> {
        match self {
            Value::Id(id) => Some(*id),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int(i) => write!(f, "{i}"),
            Value::Float(x) => write!(f, "{x}"),
            Value::Text(s) => write!(f, "'{s}'"),
            Value::Id(id) => write!(f, "#{id}"),
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self { Value::Text(s.to_string()) }
}
impl From<String> for Value {
    fn from(s: String) -> Self { Value::Text(s) }
}
impl From<i64> for Value {
    fn from(i: i64) -> Self { Value::Int(i) }
}
impl From<i32> for Value {
    fn from(i: i32) -> Self { Value::Int(i as i64) }
}
impl From<f64> for Value {
    fn from(x: f64) -> Self { Value::Float(x) }
}
impl From<bool> for Value {
    fn from(b: bool) -> Self { Value::Bool(b) }
}

/// Column name to value, ordered so encoded rows are deterministic.
pub type Row = BTreeMap<String, Value>;

/// A managed instance handle: concrete type plus id within the root table.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntityRef {
    pub entity: String,
    pub id: u64,
}

impl EntityRef {
    pub fn new(entity: &str, id: u64) -> Self {
        EntityRef { entity: entity.to_string(), id }
    }
}

impl fmt::Display for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.entity, self.id)
    }
}

/// Initial values for `EntityManager::create`.
#[derive(Debug, Clone, Default)]
pub struct Values {
    pub(crate) properties: Vec<(String, Value)>,
    pub(crate) links: Vec<(String, EntityRef)>,
}

impl Values {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, property: &str, value: impl Into<Value>) -> Self {
        self.properties.push((property.to_string(), value.into()));
        self
    }

    /// Points a many-to-one relation at `target`.
    pub fn link(mut self, relation: &str, target: &EntityRef) -> Self {
        self.links.push((relation.to_string(), target.clone()));
        self
    }
}

/// Equality filters combined with AND.
#[derive(Debug, Clone, Default)]
pub struct Criteria {
    pub(crate) filters: Vec<(String, Value)>,
}

impl Criteria {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn eq(mut self, column: &str, value: impl Into<Value>) -> Self {
        self.filters.push((column.to_string(), value.into()));
        self
    }

    pub fn id(self, id: u64) -> Self {
        self.eq("id", Value::Id(id))
    }

    pub fn matches(&self, row: &Row) -> bool {
        self.filters.iter().all(|(column, expected)| row.get(column).unwrap_or(&Value::Null) == expected)
    }
}

#[cfg(all(test, not(feature = "integration")))]
mod tests {
    use super::*;

    #[test]
    fn criteria_matches_all_filters() {
        let mut row = Row::new();
        row.insert("id".into(), Value::Id(3));
        row.insert("name".into(), Value::from("group"));

        assert!(Criteria::new().matches(&row));
        assert!(Criteria::new().eq("name", "group").id(3).matches(&row));
        assert!(!Criteria::new().eq("name", "other").matches(&row));
        assert!(Criteria::new().eq("missing", Value::Null).matches(&row));
    }

    #[test]
    fn rows_encode_deterministically() {
        let mut a = Row::new();
        a.insert("b".into(), Value::Int(1));
        a.insert("a".into(), Value::from("x"));
        let mut b = Row::new();
        b.insert("a".into(), Value::from("x"));
        b.insert("b".into(), Value::Int(1));
        let cfg = bincode::config::standard();
        assert_eq!(bincode::encode_to_vec(&a, cfg).unwrap(), bincode::encode_to_vec(&b, cfg).unwrap());
    }
}
