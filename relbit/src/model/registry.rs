use crate::error::AppError;
use crate::model::entity::{EntityDef, Property, PropertyType, RelationDef, RelationKind};
use crate::model::inheritance::{shared_declaration, Hierarchy, InheritanceGroup};
use crate::model::naming;
use crate::model::pivot;
use serde::Serialize;
use std::collections::{HashMap, HashSet};

/// Physical table shared by every member of one inheritance group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TableDef {
    pub name: String,
    pub root: String,
    pub columns: Vec<String>,
    pub discriminator_column: Option<String>,
    pub unique_columns: Vec<String>,
    /// Columns with a secondary index: unique columns and many-to-one join columns.
    pub indexed_columns: Vec<String>,
}

impl TableDef {
    pub fn has_column(&self, column: &str) -> bool {
        self.columns.iter().any(|c| c == column)
    }
}

/// Accumulates declarations until `finalize`.
#[derive(Debug, Default)]
pub struct Registry {
    entities: Vec<EntityDef>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, entity: EntityDef) -> &mut Self {
        self.entities.push(entity);
        self
    }

    pub fn with(mut self, entity: EntityDef) -> Self {
        self.entities.push(entity);
        self
    }

    /// Closes registration. Every dangling, ambiguous or conflicting declaration is reported
    /// here rather than turning into a wrong schema later.
    pub fn finalize(self) -> Result<Metadata, AppError> {
        let entities = self.entities;
        let mut index = HashMap::with_capacity(entities.len());
        for (i, entity) in entities.iter().enumerate() {
            if index.insert(entity.name.clone(), i).is_some() {
                return Err(AppError::configuration(format!("entity {} registered twice", entity.name)));
            }
            check_member_names(entity)?;
        }

        let hierarchy = Hierarchy::build(&entities)?;
        let mut metadata = Metadata {
            entities,
            index,
            hierarchy,
            tables: HashMap::new(),
            effective: HashMap::new(),
            discriminator_values: HashMap::new(),
        };

        metadata.check_inheritance_declarations()?;
        metadata.check_targets()?;
        metadata.effective = metadata.compute_effective_relations()?;
        metadata.check_mapped_by()?;
        metadata.check_group_consistency()?;
        metadata.discriminator_values = metadata.assign_discriminator_values()?;
        metadata.tables = metadata.build_tables()?;
        pivot::check_pivot_tables(&metadata)?;
        Ok(metadata)
    }
}

fn check_member_names(entity: &EntityDef) -> Result<(), AppError> {
    let mut seen = HashSet::new();
    for property in &entity.properties {
        if property.name == "id" {
            return Err(AppError::configuration(format!("{}.id is implicit and cannot be declared", entity.name)));
        }
        if !seen.insert(property.name.as_str()) {
            return Err(AppError::configuration(format!("property {}.{} declared twice", entity.name, property.name)));
        }
    }
    for relation in &entity.relations {
        if !seen.insert(relation.name.as_str()) {
            return Err(AppError::configuration(format!(
                "ambiguous member {}.{}: declared more than once",
                entity.name, relation.name
            )));
        }
    }
    Ok(())
}

/// Finalized, read-only view of every declaration.
#[derive(Debug, Clone)]
pub struct Metadata {
    entities: Vec<EntityDef>,
    index: HashMap<String, usize>,
    hierarchy: Hierarchy,
    tables: HashMap<String, TableDef>,
    effective: HashMap<String, Vec<RelationDef>>,
    discriminator_values: HashMap<String, String>,
}

impl Metadata {
    pub fn get(&self, entity: &str) -> Result<&EntityDef, AppError> {
        self.index
            .get(entity)
            .map(|i| &self.entities[*i])
            .ok_or_else(|| AppError::UnresolvedType(entity.to_string()))
    }

    pub fn contains(&self, entity: &str) -> bool {
        self.index.contains_key(entity)
    }

    /// Registration order.
    pub fn entities(&self) -> impl Iterator<Item = &EntityDef> {
        self.entities.iter()
    }

    pub fn hierarchy(&self) -> &Hierarchy {
        &self.hierarchy
    }

    pub fn group_of(&self, entity: &str) -> Result<&InheritanceGroup, AppError> {
        self.hierarchy.group_of(entity)
    }

    /// Inherited relations first, re-declarations replacing them in place.
    pub fn list_relationships(&self, entity: &str) -> Result<&[RelationDef], AppError> {
        self.effective
            .get(entity)
            .map(Vec::as_slice)
            .ok_or_else(|| AppError::UnresolvedType(entity.to_string()))
    }

    pub fn relation(&self, entity: &str, relation: &str) -> Result<&RelationDef, AppError> {
        self.list_relationships(entity)?
            .iter()
            .find(|r| r.name == relation)
            .ok_or_else(|| AppError::InvalidValue(format!("{entity} has no relation {relation}")))
    }

    /// Property declared on `entity` or one of its ancestors.
    pub fn property(&self, entity: &str, property: &str) -> Result<Option<&Property>, AppError> {
        self.get(entity)?;
        for member in self.hierarchy.lineage_of(entity).iter().rev() {
            if let Some(p) = self.get(member)?.property_named(property) {
                return Ok(Some(p));
            }
        }
        Ok(None)
    }

    pub fn table_of(&self, entity: &str) -> Result<&TableDef, AppError> {
        let root = self.hierarchy.root_of(entity)?;
        self.tables.get(root).ok_or_else(|| AppError::UnresolvedType(entity.to_string()))
    }

    pub fn tables(&self) -> impl Iterator<Item = &TableDef> {
        self.tables.values()
    }

    pub fn discriminator_value_of(&self, entity: &str) -> Option<&str> {
        self.discriminator_values.get(entity).map(String::as_str)
    }

    /// Concrete type stored under `value` in the group rooted at `root`.
    pub fn entity_for_discriminator(&self, root: &str, value: &str) -> Option<&str> {
        let group = self.hierarchy.group_of(root).ok()?;
        group.members.iter().map(String::as_str).find(|m| self.discriminator_value_of(m) == Some(value))
    }

    pub fn join_column_of(&self, relation: &RelationDef) -> String {
        naming::join_column(&relation.name)
    }

    fn check_inheritance_declarations(&self) -> Result<(), AppError> {
        for entity in &self.entities {
            if entity.base.is_some() && entity.discriminator_column.is_some() {
                return Err(AppError::configuration(format!(
                    "{} extends {} and cannot declare its own discriminator column",
                    entity.name,
                    entity.base.as_deref().unwrap_or_default()
                )));
            }
            if entity.base.is_some() && entity.table.is_some() {
                return Err(AppError::configuration(format!(
                    "{} is stored in its root's table and cannot override the table name",
                    entity.name
                )));
            }
        }
        for group in self.hierarchy.groups() {
            if group.is_shared() && group.discriminator_column.is_none() {
                return Err(AppError::configuration(format!(
                    "{} has subtypes ({}) but declares no discriminator column",
                    group.root,
                    group.members[1..].join(", ")
                )));
            }
        }
        Ok(())
    }

    fn check_targets(&self) -> Result<(), AppError> {
        for entity in &self.entities {
            for rel in &entity.relations {
                if !self.contains(&rel.target) {
                    return Err(AppError::UnresolvedType(format!(
                        "{} (target of {}.{})",
                        rel.target, entity.name, rel.name
                    )));
                }
                match rel.kind {
                    RelationKind::OneToMany if rel.mapped_by.is_none() => {
                        return Err(AppError::configuration(format!(
                            "one-to-many {}.{} needs mapped_by",
                            entity.name, rel.name
                        )));
                    }
                    RelationKind::ManyToOne if rel.mapped_by.is_some() => {
                        return Err(AppError::configuration(format!(
                            "many-to-one {}.{} always owns its join column and cannot be mapped_by",
                            entity.name, rel.name
                        )));
                    }
                    _ => {}
                }
                if rel.pivot_table.is_some() && !(rel.kind == RelationKind::ManyToMany && rel.is_owning()) {
                    return Err(AppError::configuration(format!(
                        "{}.{}: only the owning side of a many-to-many names a pivot table",
                        entity.name, rel.name
                    )));
                }
            }
        }
        Ok(())
    }

    fn compute_effective_relations(&self) -> Result<HashMap<String, Vec<RelationDef>>, AppError> {
        let mut effective = HashMap::with_capacity(self.entities.len());
        for entity in &self.entities {
            let mut relations: Vec<RelationDef> = Vec::new();
            for member in self.hierarchy.lineage_of(&entity.name) {
                for rel in &self.get(&member)?.relations {
                    match relations.iter_mut().find(|r| r.name == rel.name) {
                        Some(existing) => *existing = rel.clone(),
                        None => relations.push(rel.clone()),
                    }
                }
            }
            effective.insert(entity.name.clone(), relations);
        }
        Ok(effective)
    }

    fn check_mapped_by(&self) -> Result<(), AppError> {
        for entity in &self.entities {
            for rel in &entity.relations {
                let Some(mapped_by) = &rel.mapped_by else { continue };
                let inverse = self.list_relationships(&rel.target)?.iter().find(|r| &r.name == mapped_by);
                let Some(inverse) = inverse else {
                    return Err(AppError::configuration(format!(
                        "{}.{} is mapped by {}.{} which does not exist",
                        entity.name, rel.name, rel.target, mapped_by
                    )));
                };
                if inverse.kind != rel.kind.complement() {
                    return Err(AppError::configuration(format!(
                        "{}.{} ({}) is mapped by {}.{} which is {}, expected {}",
                        entity.name, rel.name, rel.kind, rel.target, mapped_by, inverse.kind, rel.kind.complement()
                    )));
                }
                if !inverse.is_owning() {
                    return Err(AppError::configuration(format!(
                        "{}.{} and {}.{} are both inverse sides; exactly one side must own the relationship",
                        entity.name, rel.name, rel.target, mapped_by
                    )));
                }
                if self.hierarchy.root_of(&inverse.target)? != self.hierarchy.root_of(&entity.name)? {
                    return Err(AppError::configuration(format!(
                        "{}.{} is mapped by {}.{} which points at {}, not at {}",
                        entity.name, rel.name, rel.target, mapped_by, inverse.target, entity.name
                    )));
                }
            }
        }
        Ok(())
    }

    fn check_group_consistency(&self) -> Result<(), AppError> {
        let lookup = |name: &str| self.index.get(name).map(|i| &self.entities[*i]);
        for group in self.hierarchy.groups() {
            let names: HashSet<&str> = group
                .members
                .iter()
                .flat_map(|m| self.entities[self.index[m]].relations.iter().map(|r| r.name.as_str()))
                .collect();
            for name in names {
                shared_declaration(group, lookup, name)?;
            }
        }
        Ok(())
    }

    fn assign_discriminator_values(&self) -> Result<HashMap<String, String>, AppError> {
        let mut values = HashMap::new();
        for group in self.hierarchy.groups() {
            if group.discriminator_column.is_none() {
                continue;
            }
            let mut taken: HashMap<String, &str> = HashMap::new();
            for member in &group.members {
                let entity = self.get(member)?;
                let value = entity.discriminator_value.clone().unwrap_or_else(|| naming::discriminator_value(member));
                if let Some(other) = taken.insert(value.clone(), member.as_str()) {
                    return Err(AppError::configuration(format!(
                        "{} and {} share discriminator value '{}'",
                        other, member, value
                    )));
                }
                values.insert(member.clone(), value);
            }
        }
        Ok(values)
    }

    fn build_tables(&self) -> Result<HashMap<String, TableDef>, AppError> {
        let mut tables = HashMap::new();
        let mut table_names: HashMap<String, &str> = HashMap::new();
        for group in self.hierarchy.groups() {
            let root = self.get(&group.root)?;
            let name = root.table.clone().unwrap_or_else(|| naming::entity_table(&group.root));
            if let Some(other) = table_names.insert(name.clone(), group.root.as_str()) {
                return Err(AppError::configuration(format!(
                    "{} and {} both map to table {}",
                    other, group.root, name
                )));
            }

            let mut columns = vec!["id".to_string()];
            if let Some(discriminator) = &group.discriminator_column {
                columns.push(discriminator.clone());
            }
            let mut types: HashMap<&str, (PropertyType, &str)> = HashMap::new();
            let mut unique_columns = Vec::new();
            let mut join_columns = Vec::new();
            for member in &group.members {
                let entity = self.get(member)?;
                for property in &entity.properties {
                    match types.get(property.name.as_str()) {
                        Some((tpe, owner)) if *tpe != property.tpe => {
                            return Err(AppError::configuration(format!(
                                "{}.{} is {:?} but {}.{} is {:?}; both live in table {}",
                                member, property.name, property.tpe, owner, property.name, tpe, name
                            )));
                        }
                        Some(_) => {}
                        None => {
                            types.insert(property.name.as_str(), (property.tpe, member.as_str()));
                            if columns.contains(&property.name) {
                                return Err(AppError::configuration(format!(
                                    "{}.{} collides with a reserved column of table {}",
                                    member, property.name, name
                                )));
                            }
                            columns.push(property.name.clone());
                        }
                    }
                    if property.unique && !unique_columns.contains(&property.name) {
                        unique_columns.push(property.name.clone());
                    }
                }
                for rel in entity.relations.iter().filter(|r| r.kind == RelationKind::ManyToOne) {
                    let column = self.join_column_of(rel);
                    if columns.contains(&column) && !join_columns.contains(&column) {
                        return Err(AppError::configuration(format!(
                            "join column {} of {}.{} collides with an existing column of table {}",
                            column, member, rel.name, name
                        )));
                    }
                    if !join_columns.contains(&column) {
                        columns.push(column.clone());
                        join_columns.push(column);
                    }
                }
            }

            let mut indexed_columns = unique_columns.clone();
            indexed_columns.extend(join_columns);
            tables.insert(
                group.root.clone(),
                TableDef {
                    name,
                    root: group.root.clone(),
                    columns,
                    discriminator_column: group.discriminator_column.clone(),
                    unique_columns,
                    indexed_columns,
                },
            );
        }
        Ok(tables)
    }
}
