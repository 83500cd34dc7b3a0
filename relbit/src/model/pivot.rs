//! Physical schema of many-to-many relationships.
//!
//! A relationship is identified by its owner's inheritance root, its name and its target's
//! root. Every subtype that declares (or inherits) `privileges -> Privilege` below `User`
//! therefore shares one cache slot and one `PivotSchema`, named after `User`.

use crate::error::AppError;
use crate::model::entity::{RelationDef, RelationKind};
use crate::model::inheritance::shared_declaration;
use crate::model::naming;
use crate::model::registry::Metadata;
use once_cell::sync::OnceCell;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct PivotSchema {
    pub table: String,
    pub owner_column: String,
    pub target_column: String,
}

impl fmt::Display for PivotSchema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({}, {})", self.table, self.owner_column, self.target_column)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct RelationKey {
    pub owner_root: String,
    pub name: String,
    pub target_root: String,
}

impl fmt::Display for RelationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{} -> {}", self.owner_root, self.name, self.target_root)
    }
}

/// A pivot seen from one side of the relationship.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PivotJoin {
    pub schema: PivotSchema,
    /// Key of the owning declaration, shared by both sides.
    pub key: RelationKey,
    /// Column holding the id of the entity the collection belongs to.
    pub local_column: String,
    /// Column holding the ids of the collection members.
    pub foreign_column: String,
    pub inverse: bool,
}

type Slot = Arc<OnceCell<PivotSchema>>;

/// Memoized pivot resolution. Shared by every session of one `Orm`.
#[derive(Debug)]
pub struct PivotResolver {
    metadata: Arc<Metadata>,
    slots: Mutex<HashMap<RelationKey, Slot>>,
}

impl PivotResolver {
    pub fn new(metadata: Arc<Metadata>) -> Self {
        PivotResolver { metadata, slots: Mutex::new(HashMap::new()) }
    }

    pub fn metadata(&self) -> &Arc<Metadata> {
        &self.metadata
    }

    /// Schema of `entity.relation`; inverse sides resolve to their owning side's schema.
    pub fn pivot_schema_for(&self, entity: &str, relation: &str) -> Result<PivotSchema, AppError> {
        Ok(self.join_for(entity, relation)?.schema)
    }

    pub fn join_for(&self, entity: &str, relation: &str) -> Result<PivotJoin, AppError> {
        let rel = self.metadata.relation(entity, relation)?;
        if rel.kind != RelationKind::ManyToMany {
            return Err(AppError::configuration(format!(
                "{entity}.{relation} is {}, only many-to-many relations have a pivot table",
                rel.kind
            )));
        }
        match &rel.mapped_by {
            None => {
                let (key, schema) = self.resolve_owning(entity, rel)?;
                Ok(PivotJoin {
                    local_column: schema.owner_column.clone(),
                    foreign_column: schema.target_column.clone(),
                    schema,
                    key,
                    inverse: false,
                })
            }
            Some(mapped_by) => {
                let owning = self.metadata.relation(&rel.target, mapped_by)?;
                let (key, schema) = self.resolve_owning(&rel.target, owning)?;
                Ok(PivotJoin {
                    local_column: schema.target_column.clone(),
                    foreign_column: schema.owner_column.clone(),
                    schema,
                    key,
                    inverse: true,
                })
            }
        }
    }

    /// Number of relationship identities resolved so far.
    pub fn cached(&self) -> Result<usize, AppError> {
        Ok(self.slots.lock()?.len())
    }

    fn resolve_owning(&self, entity: &str, rel: &RelationDef) -> Result<(RelationKey, PivotSchema), AppError> {
        let key = relation_key(&self.metadata, entity, rel)?;
        let slot = {
            let mut slots = self.slots.lock()?;
            slots.entry(key.clone()).or_default().clone()
        };
        let schema = slot.get_or_try_init(|| {
            let schema = resolve_uncached(&self.metadata, entity, rel)?;
            log::debug!("resolved pivot {} as {}", key, schema);
            Ok::<_, AppError>(schema)
        })?;
        Ok((key, schema.clone()))
    }
}

pub fn relation_key(metadata: &Metadata, entity: &str, rel: &RelationDef) -> Result<RelationKey, AppError> {
    let hierarchy = metadata.hierarchy();
    Ok(RelationKey {
        owner_root: hierarchy.root_of(entity)?.to_string(),
        name: rel.name.clone(),
        target_root: hierarchy
            .root_of(&rel.target)
            .map_err(|_| AppError::UnresolvedType(format!("{} (target of {}.{})", rel.target, entity, rel.name)))?
            .to_string(),
    })
}

/// Side identifier used in names: the group root when the group has more than one member,
/// the type itself otherwise.
fn side_identifier<'a>(metadata: &'a Metadata, entity: &'a str) -> Result<&'a str, AppError> {
    let group = metadata.group_of(entity)?;
    if group.is_shared() {
        Ok(group.root.as_str())
    } else {
        Ok(entity)
    }
}

fn resolve_uncached(metadata: &Metadata, entity: &str, rel: &RelationDef) -> Result<PivotSchema, AppError> {
    let group = metadata.group_of(entity)?;
    let shared = shared_declaration(group, |name| metadata.get(name).ok(), &rel.name)?;
    if let Some(shared) = shared {
        if !shared.same_shape(rel) {
            return Err(AppError::ambiguous(
                entity,
                &rel.name,
                format!("{} disagrees with {}", rel.shape(), shared.shape()),
            ));
        }
    }

    let owner = side_identifier(metadata, entity)?;
    let target = side_identifier(metadata, &rel.target)
        .map_err(|_| AppError::UnresolvedType(format!("{} (target of {}.{})", rel.target, entity, rel.name)))?;
    let (owner_column, target_column) = naming::pivot_columns(owner, target);
    Ok(PivotSchema {
        table: rel.pivot_table.clone().unwrap_or_else(|| naming::pivot_table(owner, target)),
        owner_column,
        target_column,
    })
}

/// Every owning many-to-many once, keyed by relationship identity.
pub fn owning_pivots(metadata: &Metadata) -> Result<Vec<(RelationKey, PivotSchema)>, AppError> {
    let mut seen: HashMap<RelationKey, PivotSchema> = HashMap::new();
    for entity in metadata.entities() {
        for rel in metadata.list_relationships(&entity.name)? {
            if rel.kind != RelationKind::ManyToMany || !rel.is_owning() {
                continue;
            }
            let key = relation_key(metadata, &entity.name, rel)?;
            if !seen.contains_key(&key) {
                let schema = resolve_uncached(metadata, &entity.name, rel)?;
                seen.insert(key, schema);
            }
        }
    }
    let mut pivots: Vec<_> = seen.into_iter().collect();
    pivots.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(pivots)
}

/// Two distinct relationships must not share a pivot table, and no pivot may shadow an entity
/// table.
pub(crate) fn check_pivot_tables(metadata: &Metadata) -> Result<(), AppError> {
    let mut by_table: HashMap<String, RelationKey> = HashMap::new();
    for (key, schema) in owning_pivots(metadata)? {
        if metadata.tables().any(|t| t.name == schema.table) {
            return Err(AppError::configuration(format!(
                "pivot table {} of {} collides with an entity table",
                schema.table, key
            )));
        }
        if let Some(other) = by_table.insert(schema.table.clone(), key.clone()) {
            return Err(AppError::configuration(format!(
                "{} and {} would share pivot table {}; give one of them an explicit pivot_table",
                other, key, schema.table
            )));
        }
    }
    Ok(())
}
