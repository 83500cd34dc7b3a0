//! Unit of work over one persistence engine.
//!
//! An `EntityManager` tracks every instance it has created or read in an identity map, keeps
//! one [`Collection`] per owner row and relationship identity, and stages every change until
//! [`EntityManager::flush`] hands them to the engine as a single atomic batch.
//!
//! Every engine call runs on tokio's blocking pool, so the methods reaching storage are
//! `async`; resolution and staging never suspend.

use crate::collection::{Change, ChangeStatus, Collection, CollectionKey, CollectionState, Link, Staged};
use crate::error::{AppError, PersistenceError};
use crate::model::entity::{RelationDef, RelationKind};
use crate::model::pivot::{relation_key, PivotResolver, PivotSchema, RelationKey};
use crate::model::registry::{Metadata, TableDef};
use crate::query;
use crate::settings::{FlushMode, OrmSettings};
use crate::storage::{pivot_row, row_id, PersistenceEngine, Write};
use crate::value::{Criteria, EntityRef, Row, Value, Values};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityState {
    /// Created in this session, not yet inserted.
    New,
    Clean,
    /// Has a staged update.
    Dirty,
    /// Has a staged delete.
    Removed,
}

#[derive(Debug, Clone)]
struct Managed {
    entity: String,
    row: Row,
    state: EntityState,
}

/// Identity map key: inheritance root and id.
type Identity = (String, u64);

pub struct EntityManager {
    metadata: Arc<Metadata>,
    resolver: Arc<PivotResolver>,
    engine: Arc<dyn PersistenceEngine>,
    pivots: Arc<Vec<(RelationKey, PivotSchema)>>,
    flush_mode: FlushMode,
    debug_queries: bool,
    identity: HashMap<Identity, Managed>,
    collections: HashMap<CollectionKey, Collection>,
    staged: Vec<Staged>,
}

impl EntityManager {
    pub(crate) fn new(
        metadata: Arc<Metadata>,
        resolver: Arc<PivotResolver>,
        engine: Arc<dyn PersistenceEngine>,
        pivots: Arc<Vec<(RelationKey, PivotSchema)>>,
        settings: &OrmSettings,
    ) -> Self {
        EntityManager {
            metadata,
            resolver,
            engine,
            pivots,
            flush_mode: settings.flush_mode,
            debug_queries: settings.debug_queries,
            identity: HashMap::new(),
            collections: HashMap::new(),
            staged: Vec::new(),
        }
    }

    pub fn metadata(&self) -> &Arc<Metadata> {
        &self.metadata
    }

    pub fn flush_mode(&self) -> FlushMode {
        self.flush_mode
    }

    /// Entries of the unit of work, in staging order.
    pub fn staged(&self) -> &[Staged] {
        &self.staged
    }

    pub fn has_pending_changes(&self) -> bool {
        self.staged.iter().any(|s| s.status == ChangeStatus::Pending)
    }

    pub fn state_of(&self, entity: &EntityRef) -> Result<Option<EntityState>, AppError> {
        let key = self.identity_of(entity)?;
        Ok(self.identity.get(&key).map(|m| m.state))
    }

    pub async fn create(&mut self, entity: &str, values: Values) -> Result<EntityRef, AppError> {
        let metadata = Arc::clone(&self.metadata);
        let table = metadata.table_of(entity)?;

        let mut row = Row::new();
        for member in metadata.hierarchy().lineage_of(entity) {
            for property in &metadata.get(&member)?.properties {
                row.insert(property.name.clone(), Value::Null);
            }
        }
        let relations = metadata.list_relationships(entity)?;
        for rel in relations.iter().filter(|r| r.kind == RelationKind::ManyToOne) {
            row.insert(metadata.join_column_of(rel), Value::Null);
        }
        if let Some(column) = &table.discriminator_column {
            let value = metadata
                .discriminator_value_of(entity)
                .ok_or_else(|| AppError::configuration(format!("{entity} has no discriminator value")))?;
            row.insert(column.clone(), Value::from(value));
        }

        for (name, value) in values.properties {
            self.check_property(entity, &name, &value)?;
            row.insert(name, value);
        }
        let mut links = Vec::new();
        for (name, target) in values.links {
            let rel = metadata.relation(entity, &name)?;
            if rel.kind != RelationKind::ManyToOne {
                return Err(AppError::InvalidValue(format!("{entity}.{name} is {}, only many-to-one can be linked", rel.kind)));
            }
            self.check_target(rel, &target).await?;
            row.insert(metadata.join_column_of(rel), Value::Id(target.id));
            links.push((name, target.id));
        }

        let table_name = table.name.clone();
        let id = self.storage(move |engine| engine.next_id(&table_name)).await?;
        row.insert("id".to_string(), Value::Id(id));
        let reference = EntityRef::new(entity, id);
        self.identity.insert(
            (table.root.clone(), id),
            Managed { entity: entity.to_string(), row, state: EntityState::New },
        );
        self.staged.push(Staged::pending(Change::Insert(reference.clone())));
        for (name, owner) in links {
            self.sync_join_column(&table.root, id, &name, None, Some(owner));
        }
        log::debug!("created {}", reference);
        Ok(reference)
    }

    /// Current row of `entity`, including unflushed changes.
    pub async fn get(&mut self, entity: &EntityRef) -> Result<Row, AppError> {
        let key = self.ensure_managed(entity).await?;
        Ok(self.managed(&key)?.row.clone())
    }

    pub async fn value(&mut self, entity: &EntityRef, property: &str) -> Result<Value, AppError> {
        let key = self.ensure_managed(entity).await?;
        let managed = self.managed(&key)?;
        if property != "id" && self.metadata.property(&managed.entity, property)?.is_none() {
            return Err(AppError::InvalidValue(format!("{} has no property {}", managed.entity, property)));
        }
        Ok(managed.row.get(property).cloned().unwrap_or(Value::Null))
    }

    pub async fn set(&mut self, entity: &EntityRef, property: &str, value: impl Into<Value>) -> Result<(), AppError> {
        let value = value.into();
        let key = self.ensure_managed(entity).await?;
        let concrete = self.managed(&key)?.entity.clone();
        self.check_property(&concrete, property, &value)?;
        if let Some(managed) = self.identity.get_mut(&key) {
            managed.row.insert(property.to_string(), value);
        }
        self.mark_dirty(&key)
    }

    /// Stages the delete of `entity` together with every pivot row referencing it.
    pub async fn remove_entity(&mut self, entity: &EntityRef) -> Result<(), AppError> {
        let key = self.ensure_managed(entity).await?;
        let (root, id) = key.clone();
        let (concrete, state) = {
            let managed = self.managed(&key)?;
            (managed.entity.clone(), managed.state)
        };

        let pivots = Arc::clone(&self.pivots);
        let metadata = Arc::clone(&self.metadata);
        let touches_pivot = |table: &str, owner: u64, target: u64| {
            pivots.iter().any(|(k, schema)| {
                schema.table == table
                    && ((k.owner_root == root && owner == id) || (k.target_root == root && target == id))
            })
        };
        self.staged.retain(|s| match &s.change {
            Change::Insert(e) | Change::Update(e) => {
                !(e.id == id && metadata.hierarchy().root_of(&e.entity).map(|r| r == root).unwrap_or(false))
            }
            Change::Link { table, owner, target } | Change::Unlink { table, owner, target } => {
                !touches_pivot(table, *owner, *target)
            }
            Change::Delete(_) => true,
        });

        if state == EntityState::New {
            self.identity.remove(&key);
        } else {
            if let Some(managed) = self.identity.get_mut(&key) {
                managed.state = EntityState::Removed;
            }
            self.staged.push(Staged::pending(Change::Delete(EntityRef::new(&concrete, id))));
        }

        self.collections.retain(|k, _| !(k.owner_root() == root && k.owner_id == id));
        for (k, collection) in self.collections.iter_mut() {
            if k.target_root() == root {
                collection.remove(id);
            }
        }
        log::debug!("removed {}#{}", concrete, id);
        Ok(())
    }

    /// Members of `owner.relation`, reading them on first access.
    pub async fn load(&mut self, owner: &EntityRef, relation: &str) -> Result<Vec<EntityRef>, AppError> {
        let (key, concrete) = self.collection_key(owner, relation).await?;
        self.materialize(&key, &concrete, relation).await?;
        self.members_of(&key)
    }

    pub async fn collection_state(&mut self, owner: &EntityRef, relation: &str) -> Result<CollectionState, AppError> {
        let (key, _) = self.collection_key(owner, relation).await?;
        Ok(self.collection(&key)?.state())
    }

    pub async fn add(&mut self, owner: &EntityRef, relation: &str, target: &EntityRef) -> Result<(), AppError> {
        self.change_membership(owner, relation, target, true).await
    }

    pub async fn remove(&mut self, owner: &EntityRef, relation: &str, target: &EntityRef) -> Result<(), AppError> {
        self.change_membership(owner, relation, target, false).await
    }

    /// Writes every pending change as one batch. On failure nothing is written, the entries
    /// stay pending and the engine's error is returned.
    pub async fn flush(&mut self) -> Result<(), AppError> {
        if !self.has_pending_changes() {
            return Ok(());
        }
        let batch = self.build_batch().await?;
        if self.debug_queries {
            for write in &batch {
                query!("{}", write);
            }
        }
        let writes = batch.len();
        self.storage(move |engine| engine.write_batch(&batch)).await?;

        for staged in self.staged.iter_mut() {
            staged.status = ChangeStatus::Committed;
        }
        for staged in &self.staged {
            match &staged.change {
                Change::Insert(e) | Change::Update(e) => {
                    let key = self.identity_of(e)?;
                    if let Some(managed) = self.identity.get_mut(&key) {
                        managed.state = EntityState::Clean;
                    }
                }
                Change::Delete(e) => {
                    let key = self.identity_of(e)?;
                    self.identity.remove(&key);
                }
                Change::Link { .. } | Change::Unlink { .. } => {}
            }
        }
        self.staged.retain(|s| s.status == ChangeStatus::Pending);
        log::debug!("flushed {} writes", writes);
        Ok(())
    }

    /// Lowest-id instance of `entity` (or a subtype) matching `criteria`, with the relations
    /// named in `populate` loaded.
    pub async fn find_one(&mut self, entity: &str, criteria: Criteria, populate: &[&str]) -> Result<Option<EntityRef>, AppError> {
        for relation in populate {
            self.metadata.relation(entity, relation)?;
        }
        if self.flush_mode == FlushMode::Auto {
            self.flush().await?;
        }
        let Some((found, unmanaged)) = self.matching(entity, &criteria).await?.into_iter().next() else {
            return Ok(None);
        };
        if let Some(row) = unmanaged {
            let key = self.identity_of(&found)?;
            self.identity.insert(key, Managed { entity: found.entity.clone(), row, state: EntityState::Clean });
        }
        for relation in populate {
            self.populate(&found, relation).await?;
        }
        Ok(Some(found))
    }

    pub async fn find_one_or_fail(&mut self, entity: &str, criteria: Criteria, populate: &[&str]) -> Result<EntityRef, AppError> {
        let description = format!("{entity} matching {:?}", criteria.filters);
        self.find_one(entity, criteria, populate).await?.ok_or(AppError::NotFound(description))
    }

    pub async fn count(&mut self, entity: &str, criteria: Criteria) -> Result<usize, AppError> {
        if self.flush_mode == FlushMode::Auto {
            self.flush().await?;
        }
        Ok(self.matching(entity, &criteria).await?.len())
    }

    /// Forgets every managed instance, collection and staged change.
    pub fn clear(&mut self) {
        self.identity.clear();
        self.collections.clear();
        self.staged.clear();
    }

    /// Runs one engine call on the blocking pool.
    async fn storage<T, F>(&self, op: F) -> Result<T, AppError>
    where
        T: Send + 'static,
        F: FnOnce(&dyn PersistenceEngine) -> Result<T, PersistenceError> + Send + 'static,
    {
        let engine = Arc::clone(&self.engine);
        let result = tokio::task::spawn_blocking(move || op(&*engine)).await.map_err(PersistenceError::from)?;
        Ok(result?)
    }

    fn identity_of(&self, entity: &EntityRef) -> Result<Identity, AppError> {
        Ok((self.metadata.hierarchy().root_of(&entity.entity)?.to_string(), entity.id))
    }

    fn managed(&self, key: &Identity) -> Result<&Managed, AppError> {
        self.identity
            .get(key)
            .ok_or_else(|| AppError::NotFound(format!("{}#{}", key.0, key.1)))
    }

    fn collection(&self, key: &CollectionKey) -> Result<&Collection, AppError> {
        self.collections.get(key).ok_or_else(|| AppError::Custom(format!("{key} is not tracked")))
    }

    fn concrete_type(&self, table: &TableDef, row: &Row) -> Result<String, AppError> {
        let Some(column) = &table.discriminator_column else {
            return Ok(table.root.clone());
        };
        let value = row
            .get(column)
            .and_then(Value::as_text)
            .ok_or_else(|| AppError::Custom(format!("row of {} has no {}", table.name, column)))?;
        self.metadata
            .entity_for_discriminator(&table.root, value)
            .map(str::to_string)
            .ok_or_else(|| AppError::Custom(format!("unknown discriminator '{}' in {}", value, table.name)))
    }

    /// Puts `entity` into the identity map, reading its row by primary key if needed.
    async fn ensure_managed(&mut self, entity: &EntityRef) -> Result<Identity, AppError> {
        let key = self.identity_of(entity)?;
        let metadata = Arc::clone(&self.metadata);
        let hierarchy = metadata.hierarchy();
        if let Some(managed) = self.identity.get(&key) {
            if managed.state == EntityState::Removed {
                return Err(AppError::NotFound(format!("{entity} has been removed")));
            }
            if !hierarchy.is_same_or_descendant(&managed.entity, &entity.entity) {
                return Err(AppError::NotFound(format!("{entity} is a {}", managed.entity)));
            }
            return Ok(key);
        }
        let table = metadata.table_of(&entity.entity)?;
        let (table_name, id) = (table.name.clone(), entity.id);
        let row = self
            .storage(move |engine| engine.get_by_id(&table_name, id))
            .await?
            .ok_or_else(|| AppError::NotFound(entity.to_string()))?;
        let concrete = self.concrete_type(table, &row)?;
        if !hierarchy.is_same_or_descendant(&concrete, &entity.entity) {
            return Err(AppError::NotFound(format!("{entity} is a {concrete}")));
        }
        self.identity.insert(key.clone(), Managed { entity: concrete, row, state: EntityState::Clean });
        Ok(key)
    }

    /// Registers the rows of `ids` in the root table of `root` that are not managed yet.
    async fn fetch_many(&mut self, root: &str, ids: &[u64]) -> Result<(), AppError> {
        let missing: Vec<u64> =
            ids.iter().copied().filter(|id| !self.identity.contains_key(&(root.to_string(), *id))).collect();
        if missing.is_empty() {
            return Ok(());
        }
        let metadata = Arc::clone(&self.metadata);
        let table = metadata.table_of(root)?;
        let table_name = table.name.clone();
        let rows = self.storage(move |engine| engine.get_many(&table_name, &missing)).await?;
        for row in rows {
            let id = row_id(&table.name, &row)?;
            let concrete = self.concrete_type(table, &row)?;
            self.identity.insert((root.to_string(), id), Managed { entity: concrete, row, state: EntityState::Clean });
        }
        Ok(())
    }

    fn check_property(&self, entity: &str, property: &str, value: &Value) -> Result<(), AppError> {
        let table = self.metadata.table_of(entity)?;
        if property == "id" || table.discriminator_column.as_deref() == Some(property) {
            return Err(AppError::InvalidValue(format!("{entity}.{property} is managed by the mapper")));
        }
        let Some(declared) = self.metadata.property(entity, property)? else {
            return Err(AppError::InvalidValue(format!("{entity} has no property {property}")));
        };
        if !declared.tpe.accepts(value) {
            return Err(AppError::InvalidValue(format!(
                "{entity}.{property} is {:?}, got {value}",
                declared.tpe
            )));
        }
        Ok(())
    }

    /// `target` must exist and be an instance of the relation's target type.
    async fn check_target(&mut self, rel: &RelationDef, target: &EntityRef) -> Result<Identity, AppError> {
        let key = self.ensure_managed(target).await?;
        let concrete = &self.managed(&key)?.entity;
        if !self.metadata.hierarchy().is_same_or_descendant(concrete, &rel.target) {
            return Err(AppError::InvalidValue(format!(
                "{target} is a {concrete}, {}.{} expects {}",
                rel.declared_on, rel.name, rel.target
            )));
        }
        Ok(key)
    }

    fn mark_dirty(&mut self, key: &Identity) -> Result<(), AppError> {
        let Some(managed) = self.identity.get_mut(key) else {
            return Err(AppError::NotFound(format!("{}#{}", key.0, key.1)));
        };
        if managed.state == EntityState::Clean {
            managed.state = EntityState::Dirty;
            let reference = EntityRef::new(&managed.entity, key.1);
            self.staged.push(Staged::pending(Change::Update(reference)));
        }
        Ok(())
    }

    /// Key of `owner.relation`, tracking an unloaded collection for it if there is none yet.
    /// Also returns the owner's concrete type.
    async fn collection_key(&mut self, owner: &EntityRef, relation: &str) -> Result<(CollectionKey, String), AppError> {
        let owner_key = self.ensure_managed(owner).await?;
        let concrete = self.managed(&owner_key)?.entity.clone();
        let metadata = Arc::clone(&self.metadata);
        let rel = metadata.relation(&concrete, relation)?;
        if rel.kind == RelationKind::ManyToOne {
            return Err(AppError::InvalidValue(format!("{concrete}.{relation} is many-to-one, not a collection")));
        }
        let key = CollectionKey::new(owner.id, relation_key(&metadata, &concrete, rel)?);
        if !self.collections.contains_key(&key) {
            let link = match (&rel.kind, &rel.mapped_by) {
                (RelationKind::ManyToMany, _) => Link::Pivot(self.resolver.join_for(&concrete, relation)?),
                (_, Some(mapped_by)) => {
                    let inverse = metadata.relation(&rel.target, mapped_by)?;
                    Link::JoinColumn { mapped_by: mapped_by.clone(), column: metadata.join_column_of(inverse) }
                }
                (_, None) => {
                    return Err(AppError::configuration(format!("{concrete}.{relation} has no mapped_by")));
                }
            };
            self.collections.insert(key.clone(), Collection::new(rel.kind, link, &rel.target));
        }
        Ok((key, concrete))
    }

    async fn materialize(&mut self, key: &CollectionKey, owner_entity: &str, relation: &str) -> Result<(), AppError> {
        let link = {
            let Some(collection) = self.collections.get_mut(key) else {
                return Err(AppError::Custom(format!("{key} is not tracked")));
            };
            if collection.state() == CollectionState::Loaded {
                return Ok(());
            }
            collection.begin_load(key)?;
            collection.link().clone()
        };
        let metadata = Arc::clone(&self.metadata);
        let read = match metadata.relation(owner_entity, relation) {
            Ok(rel) => self.read_members(key, rel, &link).await,
            Err(e) => Err(e),
        };
        let collection = self
            .collections
            .get_mut(key)
            .ok_or_else(|| AppError::Custom(format!("{key} is not tracked")))?;
        match read {
            Ok(ids) => {
                collection.finish_load(ids);
                log::debug!("loaded {} with {} members", key, collection.len());
                Ok(())
            }
            Err(e) => {
                collection.abort_load();
                Err(e)
            }
        }
    }

    async fn read_members(&mut self, key: &CollectionKey, rel: &RelationDef, link: &Link) -> Result<Vec<u64>, AppError> {
        let metadata = Arc::clone(&self.metadata);
        let target_root = metadata.hierarchy().root_of(&rel.target)?.to_string();
        let ids = match link {
            Link::Pivot(join) => {
                let (table, column, owner) = (join.schema.table.clone(), join.local_column.clone(), key.owner_id);
                let rows = self.storage(move |engine| engine.query_by_foreign_key(&table, &column, owner)).await?;
                let mut ids: Vec<u64> =
                    rows.iter().filter_map(|row| row.get(&join.foreign_column).and_then(Value::as_id)).collect();
                for staged in self.staged.iter().filter(|s| s.status == ChangeStatus::Pending) {
                    let Some((table, owner, target)) = staged.change.pair() else { continue };
                    let (local, foreign) = if join.inverse { (target, owner) } else { (owner, target) };
                    if table != join.schema.table || local != key.owner_id {
                        continue;
                    }
                    match staged.change {
                        Change::Link { .. } if !ids.contains(&foreign) => ids.push(foreign),
                        Change::Unlink { .. } => ids.retain(|id| *id != foreign),
                        _ => {}
                    }
                }
                self.fetch_many(&target_root, &ids).await?;
                ids
            }
            Link::JoinColumn { column, .. } => {
                let table = metadata.table_of(&rel.target)?;
                let (table_name, join_column, owner) = (table.name.clone(), column.clone(), key.owner_id);
                let rows = self
                    .storage(move |engine| engine.query_by_foreign_key(&table_name, &join_column, owner))
                    .await?;
                for row in rows {
                    let id = row_id(&table.name, &row)?;
                    let identity = (target_root.clone(), id);
                    if !self.identity.contains_key(&identity) {
                        let concrete = self.concrete_type(table, &row)?;
                        self.identity.insert(identity, Managed { entity: concrete, row, state: EntityState::Clean });
                    }
                }
                let owner = Value::Id(key.owner_id);
                let mut ids: Vec<u64> = self
                    .identity
                    .iter()
                    .filter(|((root, _), m)| *root == target_root && m.row.get(column) == Some(&owner))
                    .map(|((_, id), _)| *id)
                    .collect();
                ids.sort_unstable();
                ids
            }
        };
        let hierarchy = metadata.hierarchy();
        Ok(ids
            .into_iter()
            .filter(|id| {
                self.identity.get(&(target_root.clone(), *id)).is_some_and(|m| {
                    m.state != EntityState::Removed && hierarchy.is_same_or_descendant(&m.entity, &rel.target)
                })
            })
            .collect())
    }

    fn members_of(&self, key: &CollectionKey) -> Result<Vec<EntityRef>, AppError> {
        self.collection(key)?
            .iter()
            .map(|id| {
                let managed = self.managed(&(key.target_root().to_string(), id))?;
                Ok(EntityRef::new(&managed.entity, id))
            })
            .collect()
    }

    async fn change_membership(&mut self, owner: &EntityRef, relation: &str, target: &EntityRef, linked: bool) -> Result<(), AppError> {
        let (key, concrete) = self.collection_key(owner, relation).await?;
        let metadata = Arc::clone(&self.metadata);
        let rel = metadata.relation(&concrete, relation)?;
        let target_key = self.check_target(rel, target).await?;
        self.materialize(&key, &concrete, relation).await?;

        let collection = self.collection(&key)?;
        if collection.contains(target.id) == linked {
            return Ok(());
        }
        match collection.link().clone() {
            Link::Pivot(join) => {
                let (o, t) = if join.inverse { (target.id, owner.id) } else { (owner.id, target.id) };
                self.stage_pair(&join.schema.table, o, t, linked);
            }
            Link::JoinColumn { mapped_by, column } => {
                let new_owner = if linked { Some(owner.id) } else { None };
                let old_owner = {
                    let Some(child) = self.identity.get_mut(&target_key) else {
                        return Err(AppError::NotFound(target.to_string()));
                    };
                    let old = child.row.get(&column).and_then(Value::as_id);
                    child.row.insert(column.clone(), new_owner.map(Value::Id).unwrap_or(Value::Null));
                    old
                };
                self.mark_dirty(&target_key)?;
                self.sync_join_column(&target_key.0, target.id, &mapped_by, old_owner, new_owner);
            }
        }
        Ok(())
    }

    /// Stages a pivot change, cancelling an opposite pending one for the same pair, and
    /// mirrors it into loaded collections whose target type fits the new member.
    fn stage_pair(&mut self, table: &str, owner: u64, target: u64, linked: bool) {
        let opposite = self.staged.iter().position(|s| {
            s.status == ChangeStatus::Pending
                && s.change.pair() == Some((table, owner, target))
                && matches!(s.change, Change::Link { .. }) != linked
        });
        match opposite {
            Some(i) => {
                self.staged.remove(i);
            }
            None => {
                let (table, change_owner, change_target) = (table.to_string(), owner, target);
                let change = if linked {
                    Change::Link { table, owner: change_owner, target: change_target }
                } else {
                    Change::Unlink { table, owner: change_owner, target: change_target }
                };
                self.staged.push(Staged::pending(change));
            }
        }
        let hierarchy = self.metadata.hierarchy();
        for (key, collection) in self.collections.iter_mut() {
            if collection.state() != CollectionState::Loaded {
                continue;
            }
            let Some(join) = collection.pivot() else { continue };
            if join.schema.table != table {
                continue;
            }
            let (local, foreign) = if join.inverse { (target, owner) } else { (owner, target) };
            if key.owner_id != local {
                continue;
            }
            if !linked {
                collection.remove(foreign);
                continue;
            }
            let fits = self
                .identity
                .get(&(key.target_root().to_string(), foreign))
                .is_some_and(|m| hierarchy.is_same_or_descendant(&m.entity, collection.target()));
            if fits {
                collection.insert(foreign);
            }
        }
    }

    /// Moves a child between loaded one-to-many collections after its join column changed.
    fn sync_join_column(&mut self, child_root: &str, child: u64, mapped_by: &str, old: Option<u64>, new: Option<u64>) {
        let hierarchy = self.metadata.hierarchy();
        let child_type = self.identity.get(&(child_root.to_string(), child)).map(|m| m.entity.as_str());
        for (key, collection) in self.collections.iter_mut() {
            let Link::JoinColumn { mapped_by: m, .. } = collection.link() else { continue };
            if collection.state() != CollectionState::Loaded || m != mapped_by || key.target_root() != child_root {
                continue;
            }
            if Some(key.owner_id) == old {
                collection.remove(child);
            }
            let fits = child_type.is_some_and(|t| hierarchy.is_same_or_descendant(t, collection.target()));
            if Some(key.owner_id) == new && fits {
                collection.insert(child);
            }
        }
    }

    async fn populate(&mut self, found: &EntityRef, relation: &str) -> Result<(), AppError> {
        let metadata = Arc::clone(&self.metadata);
        let rel = metadata.relation(&found.entity, relation)?;
        if rel.kind == RelationKind::ManyToOne {
            let column = metadata.join_column_of(rel);
            if let Some(id) = self.value_of_column(found, &column).await?.as_id() {
                self.ensure_managed(&EntityRef::new(&rel.target, id)).await?;
            }
            Ok(())
        } else {
            self.load(found, relation).await.map(|_| ())
        }
    }

    async fn value_of_column(&mut self, entity: &EntityRef, column: &str) -> Result<Value, AppError> {
        let key = self.ensure_managed(entity).await?;
        Ok(self.managed(&key)?.row.get(column).cloned().unwrap_or(Value::Null))
    }

    /// Instances of `entity` or its subtypes matching `criteria`, ordered by id. Rows not yet in
    /// the identity map are returned alongside.
    async fn matching(&self, entity: &str, criteria: &Criteria) -> Result<Vec<(EntityRef, Option<Row>)>, AppError> {
        let table = self.metadata.table_of(entity)?;
        if let Some((column, _)) = criteria.filters.iter().find(|(c, _)| !table.has_column(c)) {
            return Err(AppError::InvalidValue(format!("{} has no column {}", table.name, column)));
        }
        let accepted = self.metadata.hierarchy().descendants_of(entity)?;
        let mut found: BTreeMap<u64, (String, Option<Row>)> = BTreeMap::new();

        let table_name = table.name.clone();
        for row in self.storage(move |engine| engine.scan(&table_name)).await? {
            let id = row_id(&table.name, &row)?;
            let (concrete, current, unmanaged) = match self.identity.get(&(table.root.clone(), id)) {
                Some(m) if m.state == EntityState::Removed => continue,
                Some(m) => (m.entity.clone(), m.row.clone(), false),
                None => (self.concrete_type(table, &row)?, row, true),
            };
            if accepted.contains(&concrete) && criteria.matches(&current) {
                found.insert(id, (concrete, unmanaged.then_some(current)));
            }
        }
        for ((root, id), managed) in &self.identity {
            if *root == table.root
                && managed.state == EntityState::New
                && accepted.contains(&managed.entity)
                && criteria.matches(&managed.row)
            {
                found.insert(*id, (managed.entity.clone(), None));
            }
        }
        Ok(found.into_iter().map(|(id, (concrete, row))| (EntityRef::new(&concrete, id), row)).collect())
    }

    async fn build_batch(&self) -> Result<Vec<Write>, AppError> {
        let mut pending: Vec<&Staged> = self.staged.iter().filter(|s| s.status == ChangeStatus::Pending).collect();
        pending.sort_by_key(|s| s.change.phase());

        let mut batch = Vec::with_capacity(pending.len());
        let mut unlinked: HashSet<(String, u64, u64)> = HashSet::new();
        for staged in pending {
            match &staged.change {
                Change::Insert(e) => {
                    let table = self.metadata.table_of(&e.entity)?;
                    let row = self.managed(&self.identity_of(e)?)?.row.clone();
                    batch.push(Write::Insert { table: table.name.clone(), row });
                }
                Change::Update(e) => {
                    let table = self.metadata.table_of(&e.entity)?;
                    let row = self.managed(&self.identity_of(e)?)?.row.clone();
                    batch.push(Write::Update { table: table.name.clone(), id: e.id, row });
                }
                Change::Link { table, owner, target } => {
                    batch.push(Write::Insert { table: table.clone(), row: pivot_row(self.pivot(table)?, *owner, *target) });
                }
                Change::Unlink { table, owner, target } => {
                    unlinked.insert((table.clone(), *owner, *target));
                    batch.push(Write::Delete { table: table.clone(), row: pivot_row(self.pivot(table)?, *owner, *target) });
                }
                Change::Delete(e) => {
                    let root = self.metadata.hierarchy().root_of(&e.entity)?;
                    for (key, schema) in self.pivots.iter() {
                        let mut columns = Vec::new();
                        if key.owner_root == root {
                            columns.push(schema.owner_column.clone());
                        }
                        if key.target_root == root {
                            columns.push(schema.target_column.clone());
                        }
                        for column in columns {
                            let (table, id) = (schema.table.clone(), e.id);
                            let rows = self.storage(move |engine| engine.query_by_foreign_key(&table, &column, id)).await?;
                            for row in rows {
                                let (Some(o), Some(t)) = (
                                    row.get(&schema.owner_column).and_then(Value::as_id),
                                    row.get(&schema.target_column).and_then(Value::as_id),
                                ) else {
                                    continue;
                                };
                                if unlinked.insert((schema.table.clone(), o, t)) {
                                    batch.push(Write::Delete { table: schema.table.clone(), row });
                                }
                            }
                        }
                    }
                    let table = self.metadata.table_of(&e.entity)?;
                    let mut row = Row::new();
                    row.insert("id".to_string(), Value::Id(e.id));
                    batch.push(Write::Delete { table: table.name.clone(), row });
                }
            }
        }
        Ok(batch)
    }

    fn pivot(&self, table: &str) -> Result<&PivotSchema, AppError> {
        self.pivots
            .iter()
            .map(|(_, schema)| schema)
            .find(|schema| schema.table == table)
            .ok_or_else(|| AppError::configuration(format!("unknown pivot table {table}")))
    }
}

#[cfg(all(test, not(feature = "integration")))]
mod tests {
    use super::*;
    use crate::model::entity::{EntityDef, PropertyType};
    use crate::model::registry::Registry;
    use crate::orm::Orm;
    use crate::storage::MemoryEngine;
    use crate::test_utils::privilege_registry;

    fn orm_with(flush_mode: FlushMode) -> (Orm, Arc<MemoryEngine>) {
        let engine = Arc::new(MemoryEngine::new());
        let settings = OrmSettings::default().with_flush_mode(flush_mode);
        let orm = Orm::init(privilege_registry(), engine.clone(), settings).unwrap();
        (orm, engine)
    }

    async fn privilege(em: &mut EntityManager, name: &str) -> EntityRef {
        em.create("Privilege", Values::new().set("name", name)).await.unwrap()
    }

    /// Privileges expose every holder and, separately, their super user holders.
    fn registry_with_super_user_holders() -> Registry {
        Registry::new()
            .with(
                EntityDef::new("User")
                    .discriminator("type")
                    .property("name", PropertyType::Text)
                    .many_to_many("privileges", "Privilege"),
            )
            .with(EntityDef::new("SuperUser").extends("User"))
            .with(EntityDef::new("AdminUser").extends("User"))
            .with(
                EntityDef::new("Privilege")
                    .property("name", PropertyType::Text)
                    .many_to_many_mapped_by("users", "User", "privileges")
                    .many_to_many_mapped_by("super_users", "SuperUser", "privileges"),
            )
    }

    #[tokio::test]
    async fn create_fills_discriminator_and_defaults() {
        let (orm, _) = orm_with(FlushMode::Commit);
        let mut em = orm.em();
        let admin = em.create("AdminUser", Values::new().set("name", "root")).await.unwrap();
        let row = em.get(&admin).await.unwrap();
        assert_eq!(row["type"], Value::from("admin_user"));
        assert_eq!(row["email"], Value::Null);
        assert_eq!(row["id"], Value::Id(admin.id));
        assert_eq!(em.state_of(&admin).unwrap(), Some(EntityState::New));
    }

    #[tokio::test]
    async fn create_rejects_unknown_and_mistyped_properties() {
        let (orm, _) = orm_with(FlushMode::Commit);
        let mut em = orm.em();
        assert!(matches!(em.create("User", Values::new().set("nickname", "x")).await, Err(AppError::InvalidValue(_))));
        assert!(matches!(em.create("User", Values::new().set("name", 3)).await, Err(AppError::InvalidValue(_))));
        assert!(matches!(em.create("User", Values::new().set("type", "user")).await, Err(AppError::InvalidValue(_))));
        assert!(matches!(em.create("Ghost", Values::new()).await, Err(AppError::UnresolvedType(_))));
    }

    #[tokio::test]
    async fn add_is_idempotent_and_flushes_one_pivot_row() {
        let (orm, engine) = orm_with(FlushMode::Commit);
        let mut em = orm.em();
        let user = em.create("SuperUser", Values::new().set("name", "su")).await.unwrap();
        let read = privilege(&mut em, "read").await;
        em.add(&user, "privileges", &read).await.unwrap();
        em.add(&user, "privileges", &read).await.unwrap();
        em.flush().await.unwrap();
        assert_eq!(engine.scan("privilege_user").unwrap().len(), 1);
        assert!(!em.has_pending_changes());
    }

    #[tokio::test]
    async fn add_then_remove_cancels_out() {
        let (orm, engine) = orm_with(FlushMode::Commit);
        let mut em = orm.em();
        let user = em.create("AdminUser", Values::new()).await.unwrap();
        let read = privilege(&mut em, "read").await;
        em.flush().await.unwrap();

        em.add(&user, "privileges", &read).await.unwrap();
        em.remove(&user, "privileges", &read).await.unwrap();
        assert!(!em.has_pending_changes());
        em.flush().await.unwrap();
        assert!(engine.scan("privilege_user").unwrap().is_empty());
        assert!(em.load(&user, "privileges").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn inverse_side_stages_owning_row_and_syncs_loaded_side() {
        let (orm, engine) = orm_with(FlushMode::Commit);
        let mut em = orm.em();
        let user = em.create("SuperUser", Values::new()).await.unwrap();
        let read = privilege(&mut em, "read").await;
        assert!(em.load(&user, "privileges").await.unwrap().is_empty());

        em.add(&read, "users", &user).await.unwrap();
        assert_eq!(em.load(&user, "privileges").await.unwrap(), vec![read.clone()]);
        em.add(&user, "privileges", &read).await.unwrap();
        em.flush().await.unwrap();

        let rows = engine.scan("privilege_user").unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["user_id"], Value::Id(user.id));
        assert_eq!(rows[0]["privilege_id"], Value::Id(read.id));
    }

    #[tokio::test]
    async fn loaded_inverse_side_only_takes_members_of_its_target_type() {
        let settings = OrmSettings::default().with_flush_mode(FlushMode::Commit);
        let orm = Orm::init(registry_with_super_user_holders(), Arc::new(MemoryEngine::new()), settings).unwrap();
        let mut em = orm.em();
        let admin = em.create("AdminUser", Values::new()).await.unwrap();
        let su = em.create("SuperUser", Values::new()).await.unwrap();
        let read = privilege(&mut em, "read").await;
        assert!(em.load(&read, "super_users").await.unwrap().is_empty());
        assert!(em.load(&read, "users").await.unwrap().is_empty());

        em.add(&admin, "privileges", &read).await.unwrap();
        em.add(&su, "privileges", &read).await.unwrap();
        let in_session = em.load(&read, "super_users").await.unwrap();
        assert_eq!(in_session, vec![su.clone()]);
        assert_eq!(em.load(&read, "users").await.unwrap(), vec![admin.clone(), su.clone()]);
        em.flush().await.unwrap();

        let mut fresh = orm.em();
        assert_eq!(fresh.load(&read, "super_users").await.unwrap(), in_session);
        assert_eq!(fresh.load(&read, "users").await.unwrap(), vec![admin, su]);
    }

    #[tokio::test]
    async fn collections_load_lazily_through_the_state_machine() {
        let (orm, _) = orm_with(FlushMode::Commit);
        let mut em = orm.em();
        let user = em.create("User", Values::new()).await.unwrap();
        assert_eq!(em.collection_state(&user, "privileges").await.unwrap(), CollectionState::Unloaded);
        em.load(&user, "privileges").await.unwrap();
        assert_eq!(em.collection_state(&user, "privileges").await.unwrap(), CollectionState::Loaded);
        assert!(matches!(em.load(&user, "nope").await, Err(AppError::InvalidValue(_))));
    }

    #[tokio::test]
    async fn failed_load_returns_the_collection_to_unloaded() {
        let (orm, engine) = orm_with(FlushMode::Commit);
        let mut em = orm.em();
        let user = em.create("SuperUser", Values::new()).await.unwrap();
        let read = privilege(&mut em, "read").await;
        em.add(&user, "privileges", &read).await.unwrap();
        em.flush().await.unwrap();

        let mut other = orm.em();
        other.get(&user).await.unwrap();
        engine.fail_next_reads(1);
        assert!(matches!(
            other.load(&user, "privileges").await,
            Err(AppError::Persistence(PersistenceError::Rejected(_)))
        ));
        assert_eq!(other.collection_state(&user, "privileges").await.unwrap(), CollectionState::Unloaded);
        assert_eq!(other.load(&user, "privileges").await.unwrap(), vec![read]);
        assert_eq!(other.collection_state(&user, "privileges").await.unwrap(), CollectionState::Loaded);
    }

    #[tokio::test]
    async fn one_to_many_add_rewrites_the_join_column() {
        let (orm, engine) = orm_with(FlushMode::Commit);
        let mut em = orm.em();
        let admin = em.create("PrivilegeGroup", Values::new().set("name", "admin")).await.unwrap();
        let audit = em.create("PrivilegeGroup", Values::new().set("name", "audit")).await.unwrap();
        let read = em.create("Privilege", Values::new().set("name", "read").link("group", &admin)).await.unwrap();
        assert_eq!(em.load(&admin, "privileges").await.unwrap(), vec![read.clone()]);
        em.flush().await.unwrap();

        assert_eq!(em.load(&audit, "privileges").await.unwrap(), vec![]);
        em.add(&audit, "privileges", &read).await.unwrap();
        assert_eq!(em.value(&read, "name").await.unwrap(), Value::from("read"));
        assert!(em.load(&admin, "privileges").await.unwrap().is_empty());
        assert_eq!(em.load(&audit, "privileges").await.unwrap(), vec![read.clone()]);
        em.flush().await.unwrap();

        let stored = engine.query_by_foreign_key("privilege", "group_id", audit.id).unwrap();
        assert_eq!(stored.len(), 1);
        em.clear();
        assert_eq!(em.load(&audit, "privileges").await.unwrap(), vec![read]);
    }

    #[tokio::test]
    async fn failed_flush_keeps_entries_pending() {
        let (orm, engine) = orm_with(FlushMode::Commit);
        let mut em = orm.em();
        let user = em.create("SuperUser", Values::new()).await.unwrap();
        let read = privilege(&mut em, "read").await;
        em.add(&user, "privileges", &read).await.unwrap();

        engine.fail_next_writes(1);
        assert!(matches!(em.flush().await, Err(AppError::Persistence(_))));
        assert_eq!(em.staged().len(), 3);
        assert!(em.staged().iter().all(|s| s.status == ChangeStatus::Pending));

        em.flush().await.unwrap();
        assert!(em.staged().is_empty());
        assert_eq!(engine.scan("privilege_user").unwrap().len(), 1);
        assert_eq!(em.state_of(&user).unwrap(), Some(EntityState::Clean));
    }

    #[tokio::test]
    async fn find_one_filters_by_subtype_and_flushes_in_auto_mode() {
        let (orm, engine) = orm_with(FlushMode::Auto);
        let mut em = orm.em();
        em.create("SuperUser", Values::new().set("name", "a")).await.unwrap();
        let admin = em.create("AdminUser", Values::new().set("name", "a")).await.unwrap();

        let found = em.find_one("AdminUser", Criteria::new().eq("name", "a"), &[]).await.unwrap();
        assert_eq!(found, Some(admin));
        assert_eq!(engine.scan("user").unwrap().len(), 2);
        assert_eq!(em.count("User", Criteria::new().eq("name", "a")).await.unwrap(), 2);
        assert!(em.find_one("SuperUser", Criteria::new().eq("name", "b"), &[]).await.unwrap().is_none());
        assert!(matches!(
            em.find_one_or_fail("SuperUser", Criteria::new().eq("name", "b"), &[]).await,
            Err(AppError::NotFound(_))
        ));
        assert!(matches!(em.find_one("User", Criteria::new(), &["nope"]).await, Err(AppError::InvalidValue(_))));
        assert!(matches!(em.find_one("User", Criteria::new().eq("nope", 1), &[]).await, Err(AppError::InvalidValue(_))));
    }

    #[tokio::test]
    async fn commit_mode_queries_see_the_identity_map() {
        let (orm, engine) = orm_with(FlushMode::Commit);
        let mut em = orm.em();
        let user = em.create("User", Values::new().set("name", "new")).await.unwrap();
        assert_eq!(em.find_one("User", Criteria::new().eq("name", "new"), &[]).await.unwrap(), Some(user));
        assert!(engine.scan("user").unwrap().is_empty());
    }

    #[tokio::test]
    async fn set_stages_one_update() {
        let (orm, engine) = orm_with(FlushMode::Commit);
        let mut em = orm.em();
        let user = em.create("User", Values::new().set("name", "a")).await.unwrap();
        em.flush().await.unwrap();
        em.set(&user, "name", "b").await.unwrap();
        em.set(&user, "email", "b@x").await.unwrap();
        assert_eq!(em.staged().len(), 1);
        em.flush().await.unwrap();
        let rows = engine.scan("user").unwrap();
        assert_eq!(rows[0]["name"], Value::from("b"));
        assert_eq!(rows[0]["email"], Value::from("b@x"));
    }

    #[tokio::test]
    async fn remove_entity_deletes_its_pivot_rows() {
        let (orm, engine) = orm_with(FlushMode::Commit);
        let mut em = orm.em();
        let user = em.create("SuperUser", Values::new()).await.unwrap();
        let read = privilege(&mut em, "read").await;
        let write = privilege(&mut em, "write").await;
        em.add(&user, "privileges", &read).await.unwrap();
        em.add(&user, "privileges", &write).await.unwrap();
        em.flush().await.unwrap();

        em.remove_entity(&read).await.unwrap();
        assert_eq!(em.load(&user, "privileges").await.unwrap(), vec![write.clone()]);
        em.flush().await.unwrap();
        assert_eq!(engine.scan("privilege_user").unwrap().len(), 1);
        assert_eq!(engine.scan("privilege").unwrap().len(), 1);
        assert!(matches!(em.get(&read).await, Err(AppError::NotFound(_))));
    }

    #[tokio::test]
    async fn removing_a_new_entity_drops_its_staged_changes() {
        let (orm, engine) = orm_with(FlushMode::Commit);
        let mut em = orm.em();
        let user = em.create("SuperUser", Values::new()).await.unwrap();
        let read = privilege(&mut em, "read").await;
        em.add(&user, "privileges", &read).await.unwrap();
        em.remove_entity(&user).await.unwrap();
        assert_eq!(em.staged().len(), 1);
        em.flush().await.unwrap();
        assert!(engine.scan("user").unwrap().is_empty());
        assert!(engine.scan("privilege_user").unwrap().is_empty());
    }

    #[tokio::test]
    async fn wrong_target_type_is_rejected() {
        let (orm, _) = orm_with(FlushMode::Commit);
        let mut em = orm.em();
        let user = em.create("SuperUser", Values::new()).await.unwrap();
        let group = em.create("PrivilegeGroup", Values::new()).await.unwrap();
        assert!(matches!(em.add(&user, "privileges", &group).await, Err(AppError::InvalidValue(_))));
        assert!(matches!(em.load(&group, "missing").await, Err(AppError::InvalidValue(_))));
    }
}
