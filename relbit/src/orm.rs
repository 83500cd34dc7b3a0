use crate::error::AppError;
use crate::model::inheritance::InheritanceGroup;
use crate::model::pivot::{owning_pivots, PivotResolver, PivotSchema, RelationKey};
use crate::model::registry::{Metadata, Registry, TableDef};
use crate::session::EntityManager;
use crate::settings::OrmSettings;
use crate::storage::{PersistenceEngine, RedbEngine};
use crate::{info, warn};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Debug, Clone, Serialize)]
pub struct PivotReport {
    pub relation: RelationKey,
    pub schema: PivotSchema,
}

/// Physical layout derived from the registered entities.
#[derive(Debug, Clone, Serialize)]
pub struct SchemaReport {
    pub groups: Vec<InheritanceGroup>,
    pub tables: Vec<TableDef>,
    pub pivots: Vec<PivotReport>,
}

/// Finalized metadata, a pivot resolver and an engine. Every `EntityManager` forked from one
/// `Orm` shares its resolver cache; a new `Orm` starts with an empty one.
pub struct Orm {
    metadata: Arc<Metadata>,
    resolver: Arc<PivotResolver>,
    engine: Arc<dyn PersistenceEngine>,
    pivots: Arc<Vec<(RelationKey, PivotSchema)>>,
    settings: OrmSettings,
}

impl Orm {
    pub fn init(registry: Registry, engine: Arc<dyn PersistenceEngine>, settings: OrmSettings) -> Result<Orm, AppError> {
        let metadata = Arc::new(registry.finalize()?);
        let resolver = Arc::new(PivotResolver::new(Arc::clone(&metadata)));
        let pivots = Arc::new(owning_pivots(&metadata)?);
        let orm = Orm { metadata, resolver, engine, pivots, settings };
        orm.refresh_schema()?;
        match orm.schema_json() {
            Ok(json) => info!("Schema of {} entities:\n{}", orm.metadata.entities().count(), json),
            Err(e) => warn!("Unable to render schema: {}", e),
        }
        Ok(orm)
    }

    /// Opens (or creates) `relbit.redb` under `settings.db_path`.
    pub async fn open(registry: Registry, settings: OrmSettings) -> Result<Orm, AppError> {
        let path = PathBuf::from(&settings.db_path).join("relbit.redb");
        let engine = RedbEngine::open(path, settings.db_cache_size_mb).await?;
        Orm::init(registry, engine, settings)
    }

    /// Makes sure every entity table and every pivot table exists in the engine.
    pub fn refresh_schema(&self) -> Result<(), AppError> {
        let mut tables: Vec<&TableDef> = self.metadata.tables().collect();
        tables.sort_by(|a, b| a.name.cmp(&b.name));
        for table in tables {
            self.engine.ensure_table(table)?;
        }
        for (_, pivot) in self.pivots.iter() {
            self.engine.ensure_pivot_table(pivot)?;
        }
        Ok(())
    }

    pub fn em(&self) -> EntityManager {
        EntityManager::new(
            Arc::clone(&self.metadata),
            Arc::clone(&self.resolver),
            Arc::clone(&self.engine),
            Arc::clone(&self.pivots),
            &self.settings,
        )
    }

    pub fn metadata(&self) -> &Arc<Metadata> {
        &self.metadata
    }

    pub fn resolver(&self) -> &Arc<PivotResolver> {
        &self.resolver
    }

    pub fn settings(&self) -> &OrmSettings {
        &self.settings
    }

    pub fn pivot_schema_for(&self, entity: &str, relation: &str) -> Result<PivotSchema, AppError> {
        self.resolver.pivot_schema_for(entity, relation)
    }

    pub fn schema_report(&self) -> SchemaReport {
        let mut groups: Vec<InheritanceGroup> = self.metadata.hierarchy().groups().cloned().collect();
        groups.sort_by(|a, b| a.root.cmp(&b.root));
        let mut tables: Vec<TableDef> = self.metadata.tables().cloned().collect();
        tables.sort_by(|a, b| a.name.cmp(&b.name));
        let pivots = self
            .pivots
            .iter()
            .map(|(relation, schema)| PivotReport { relation: relation.clone(), schema: schema.clone() })
            .collect();
        SchemaReport { groups, tables, pivots }
    }

    pub fn schema_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(&self.schema_report())
    }
}

#[cfg(all(test, not(feature = "integration")))]
mod tests {
    use super::*;
    use crate::model::entity::EntityDef;
    use crate::storage::MemoryEngine;
    use crate::test_utils::privilege_registry;

    #[test]
    fn init_ensures_every_table() {
        let engine = Arc::new(MemoryEngine::new());
        let orm = Orm::init(privilege_registry(), engine.clone(), OrmSettings::default()).unwrap();
        for table in ["user", "privilege", "privilege_group", "privilege_user"] {
            assert!(engine.scan(table).unwrap().is_empty(), "{table} should exist");
        }
        assert!(engine.scan("super_user_privilege").is_err());
        assert_eq!(orm.schema_report().pivots.len(), 1);
    }

    #[test]
    fn schema_report_names_the_shared_pivot() {
        let orm = Orm::init(privilege_registry(), Arc::new(MemoryEngine::new()), OrmSettings::default()).unwrap();
        let json: serde_json::Value = serde_json::from_str(&orm.schema_json().unwrap()).unwrap();
        let pivot = &json["pivots"][0]["schema"];
        assert_eq!(pivot["table"], "privilege_user");
        assert_eq!(pivot["owner_column"], "user_id");
        assert_eq!(pivot["target_column"], "privilege_id");
        assert_eq!(json["pivots"][0]["relation"]["owner_root"], "User");
    }

    #[test]
    fn invalid_registry_fails_init() {
        let registry = Registry::new().with(EntityDef::new("User").many_to_many("privileges", "Privilege"));
        let result = Orm::init(registry, Arc::new(MemoryEngine::new()), OrmSettings::default());
        assert!(matches!(result, Err(AppError::UnresolvedType(_))));
    }

    #[test]
    fn each_orm_has_its_own_resolver_cache() {
        let first = Orm::init(privilege_registry(), Arc::new(MemoryEngine::new()), OrmSettings::default()).unwrap();
        first.pivot_schema_for("SuperUser", "privileges").unwrap();
        assert_eq!(first.resolver().cached().unwrap(), 1);
        let second = Orm::init(privilege_registry(), Arc::new(MemoryEngine::new()), OrmSettings::default()).unwrap();
        assert_eq!(second.resolver().cached().unwrap(), 0);
    }

    #[tokio::test]
    async fn open_creates_a_redb_database() {
        let dir = std::env::temp_dir().join(format!("relbit_orm_{}", rand::random::<u64>()));
        let settings = OrmSettings { db_path: dir.to_string_lossy().into_owned(), ..OrmSettings::default() };
        let orm = Orm::open(privilege_registry(), settings).await.unwrap();
        let mut em = orm.em();
        em.create("User", crate::value::Values::new().set("name", "x")).await.unwrap();
        em.flush().await.unwrap();
        assert!(dir.join("relbit.redb").exists());
    }
}
