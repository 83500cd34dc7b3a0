//! Entity and relationship declarations.
//!
//! Declarations are plain values built with chained calls and handed to
//! [`Registry::register`](crate::model::registry::Registry::register). Nothing here is validated;
//! `finalize` does that once every type is known.

use crate::value::Value;
use serde::Serialize;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PropertyType {
    Int,
    Float,
    Text,
    Bool,
}

impl PropertyType {
    /// `Null` is accepted for every type.
    pub fn accepts(&self, value: &Value) -> bool {
        matches!(
            (self, value),
            (_, Value::Null)
                | (PropertyType::Int, Value::Int(_))
                | (PropertyType::Float, Value::Float(_))
                | (PropertyType::Text, Value::Text(_))
                | (PropertyType::Bool, Value::Bool(_))
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Property {
    pub name: String,
    pub tpe: PropertyType,
    pub unique: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum RelationKind {
    OneToMany,
    ManyToOne,
    ManyToMany,
}

impl RelationKind {
    /// The kind `mapped_by` has to point at on the other side.
    pub fn complement(&self) -> RelationKind {
        match self {
            RelationKind::OneToMany => RelationKind::ManyToOne,
            RelationKind::ManyToOne => RelationKind::OneToMany,
            RelationKind::ManyToMany => RelationKind::ManyToMany,
        }
    }
}

impl fmt::Display for RelationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RelationKind::OneToMany => write!(f, "one-to-many"),
            RelationKind::ManyToOne => write!(f, "many-to-one"),
            RelationKind::ManyToMany => write!(f, "many-to-many"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RelationDef {
    pub name: String,
    pub kind: RelationKind,
    /// Type the relation is written on; filled in by `EntityDef`.
    pub declared_on: String,
    pub target: String,
    pub mapped_by: Option<String>,
    pub pivot_table: Option<String>,
}

impl RelationDef {
    pub fn is_owning(&self) -> bool {
        self.mapped_by.is_none()
    }

    /// Two declarations describe the same physical relationship when everything but the
    /// declaring type matches.
    pub fn same_shape(&self, other: &RelationDef) -> bool {
        self.name == other.name
            && self.kind == other.kind
            && self.target == other.target
            && self.mapped_by == other.mapped_by
            && self.pivot_table == other.pivot_table
    }

    /// Human readable summary used in error messages.
    pub fn shape(&self) -> String {
        let mut s = format!("{} {} on {}", self.kind, self.target, self.declared_on);
        if let Some(mapped_by) = &self.mapped_by {
            s.push_str(&format!(" mapped by {mapped_by}"));
        }
        if let Some(table) = &self.pivot_table {
            s.push_str(&format!(" via {table}"));
        }
        s
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EntityDef {
    pub name: String,
    pub properties: Vec<Property>,
    pub relations: Vec<RelationDef>,
    pub base: Option<String>,
    pub discriminator_column: Option<String>,
    pub discriminator_value: Option<String>,
    pub table: Option<String>,
}

impl EntityDef {
    pub fn new(name: &str) -> Self {
        EntityDef {
            name: name.to_string(),
            properties: Vec::new(),
            relations: Vec::new(),
            base: None,
            discriminator_column: None,
            discriminator_value: None,
            table: None,
        }
    }

    pub fn property(mut self, name: &str, tpe: PropertyType) -> Self {
        self.properties.push(Property { name: name.to_string(), tpe, unique: false });
        self
    }

    pub fn unique(mut self, name: &str, tpe: PropertyType) -> Self {
        self.properties.push(Property { name: name.to_string(), tpe, unique: true });
        self
    }

    pub fn extends(mut self, base: &str) -> Self {
        self.base = Some(base.to_string());
        self
    }

    /// Marks this type as the root of a single-table hierarchy.
    pub fn discriminator(mut self, column: &str) -> Self {
        self.discriminator_column = Some(column.to_string());
        self
    }

    pub fn discriminator_value(mut self, value: &str) -> Self {
        self.discriminator_value = Some(value.to_string());
        self
    }

    pub fn table(mut self, table: &str) -> Self {
        self.table = Some(table.to_string());
        self
    }

    pub fn many_to_many(self, name: &str, target: &str) -> Self {
        self.relation(name, RelationKind::ManyToMany, target, None)
    }

    pub fn many_to_many_mapped_by(self, name: &str, target: &str, mapped_by: &str) -> Self {
        self.relation(name, RelationKind::ManyToMany, target, Some(mapped_by))
    }

    pub fn one_to_many(self, name: &str, target: &str, mapped_by: &str) -> Self {
        self.relation(name, RelationKind::OneToMany, target, Some(mapped_by))
    }

    pub fn many_to_one(self, name: &str, target: &str) -> Self {
        self.relation(name, RelationKind::ManyToOne, target, None)
    }

    /// Overrides the pivot table name of the most recently declared relation.
    pub fn pivot_table(mut self, table: &str) -> Self {
        if let Some(last) = self.relations.last_mut() {
            last.pivot_table = Some(table.to_string());
        }
        self
    }

    fn relation(mut self, name: &str, kind: RelationKind, target: &str, mapped_by: Option<&str>) -> Self {
        self.relations.push(RelationDef {
            name: name.to_string(),
            kind,
            declared_on: self.name.clone(),
            target: target.to_string(),
            mapped_by: mapped_by.map(str::to_string),
            pivot_table: None,
        });
        self
    }

    pub fn property_named(&self, name: &str) -> Option<&Property> {
        self.properties.iter().find(|p| p.name == name)
    }

    pub fn relation_named(&self, name: &str) -> Option<&RelationDef> {
        self.relations.iter().find(|r| r.name == name)
    }
}
