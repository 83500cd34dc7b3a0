use crate::error::AppError;
use crate::model::entity::{EntityDef, RelationDef};
use serde::Serialize;
use std::collections::HashMap;

/// All types stored in one table: the root plus every type whose base chain ends there.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InheritanceGroup {
    pub root: String,
    /// Root first, then registration order.
    pub members: Vec<String>,
    pub discriminator_column: Option<String>,
}

impl InheritanceGroup {
    /// More than one registered member, i.e. naming must go through the root.
    pub fn is_shared(&self) -> bool {
        self.members.len() > 1
    }

    pub fn contains(&self, entity: &str) -> bool {
        self.members.iter().any(|m| m == entity)
    }
}

/// Root and group index built once over all registered types.
#[derive(Debug, Clone)]
pub struct Hierarchy {
    parent_by_type: HashMap<String, Option<String>>,
    root_by_type: HashMap<String, String>,
    groups: HashMap<String, InheritanceGroup>,
}

impl Hierarchy {
    /// Every chain is walked at most once; already resolved suffixes are reused, so the
    /// whole build is linear in the number of types.
    pub fn build(entities: &[EntityDef]) -> Result<Self, AppError> {
        let parent_by_type: HashMap<String, Option<String>> =
            entities.iter().map(|e| (e.name.clone(), e.base.clone())).collect();
        let mut root_by_type: HashMap<String, String> = HashMap::with_capacity(entities.len());

        for entity in entities {
            let mut chain: Vec<&str> = Vec::new();
            let mut current: &str = &entity.name;
            let root = loop {
                if let Some(root) = root_by_type.get(current) {
                    break root.clone();
                }
                if chain.contains(&current) {
                    return Err(AppError::configuration(format!(
                        "inheritance cycle through {}",
                        chain.join(" -> ")
                    )));
                }
                chain.push(current);
                match parent_by_type.get(current) {
                    Some(Some(base)) => {
                        if !parent_by_type.contains_key(base) {
                            return Err(AppError::UnresolvedType(format!("{base} (base type of {current})")));
                        }
                        current = base;
                    }
                    _ => break current.to_string(),
                }
            };
            for name in chain {
                root_by_type.insert(name.to_string(), root.clone());
            }
        }

        let mut groups: HashMap<String, InheritanceGroup> = HashMap::new();
        for entity in entities {
            let root = &root_by_type[&entity.name];
            let group = groups.entry(root.clone()).or_insert_with(|| InheritanceGroup {
                root: root.clone(),
                members: Vec::new(),
                discriminator_column: None,
            });
            if &entity.name == root {
                group.members.insert(0, entity.name.clone());
                group.discriminator_column = entity.discriminator_column.clone();
            } else {
                group.members.push(entity.name.clone());
            }
        }

        Ok(Hierarchy { parent_by_type, root_by_type, groups })
    }

    pub fn root_of(&self, entity: &str) -> Result<&str, AppError> {
        self.root_by_type
            .get(entity)
            .map(String::as_str)
            .ok_or_else(|| AppError::UnresolvedType(entity.to_string()))
    }

    pub fn group_of(&self, entity: &str) -> Result<&InheritanceGroup, AppError> {
        let root = self.root_of(entity)?;
        self.groups.get(root).ok_or_else(|| AppError::UnresolvedType(entity.to_string()))
    }

    pub fn groups(&self) -> impl Iterator<Item = &InheritanceGroup> {
        self.groups.values()
    }

    pub fn base_of(&self, entity: &str) -> Option<&str> {
        self.parent_by_type.get(entity).and_then(|p| p.as_deref())
    }

    /// Chain from the root down to `entity`, both included.
    pub fn lineage_of(&self, entity: &str) -> Vec<String> {
        let mut lineage = vec![entity.to_string()];
        let mut current = entity;
        while let Some(base) = self.base_of(current) {
            lineage.push(base.to_string());
            current = base;
        }
        lineage.reverse();
        lineage
    }

    pub fn is_same_or_descendant(&self, entity: &str, ancestor: &str) -> bool {
        let mut current = Some(entity);
        while let Some(name) = current {
            if name == ancestor {
                return true;
            }
            current = self.base_of(name);
        }
        false
    }

    /// `entity` and everything below it, in group order.
    pub fn descendants_of(&self, entity: &str) -> Result<Vec<String>, AppError> {
        let group = self.group_of(entity)?;
        Ok(group.members.iter().filter(|m| self.is_same_or_descendant(m, entity)).cloned().collect())
    }
}

/// Collects every declaration of `relation` inside `group` and returns the root-most one.
/// Declarations that disagree on shape cannot share one physical relationship.
pub fn shared_declaration<'a>(
    group: &InheritanceGroup,
    lookup: impl Fn(&str) -> Option<&'a EntityDef>,
    relation: &str,
) -> Result<Option<&'a RelationDef>, AppError> {
    let mut canonical: Option<&'a RelationDef> = None;
    for member in &group.members {
        let Some(rel) = lookup(member.as_str()).and_then(|e| e.relation_named(relation)) else {
            continue;
        };
        match canonical {
            None => canonical = Some(rel),
            Some(first) if !first.same_shape(rel) => {
                return Err(AppError::ambiguous(
                    &group.root,
                    relation,
                    format!("{} disagrees with {}", rel.shape(), first.shape()),
                ));
            }
            Some(_) => {}
        }
    }
    Ok(canonical)
}
