//! relbit maps entities with single-table inheritance and their relationships onto
//! [Redb](https://github.com/cberner/redb) or an in-memory engine.
//!
//! Subtypes share their root's table and their root's pivot tables: `SuperUser` and `AdminUser`
//! extending `User` both keep their `privileges` in `privilege_user(privilege_id, user_id)`.
//! Declarations are registered with [`Registry`], finalized into [`Metadata`] and served by an
//! [`Orm`], which forks [`EntityManager`] units of work.

pub mod collection;
pub mod error;
pub mod logger;
pub mod model;
pub mod orm;
pub mod session;
pub mod settings;
pub mod storage;
pub mod value;

#[cfg(test)]
pub(crate) mod test_utils;

pub use bincode::{Decode, Encode};
pub use collection::{Change, ChangeStatus, Collection, CollectionKey, CollectionState, Staged};
pub use error::{AppError, PersistenceError};
pub use model::entity::{EntityDef, Property, PropertyType, RelationDef, RelationKind};
pub use model::inheritance::{Hierarchy, InheritanceGroup};
pub use model::pivot::{PivotJoin, PivotResolver, PivotSchema, RelationKey};
pub use model::registry::{Metadata, Registry, TableDef};
pub use orm::{Orm, SchemaReport};
pub use redb;
pub use serde_json;
pub use session::{EntityManager, EntityState};
pub use settings::{FlushMode, OrmSettings};
pub use storage::{MemoryEngine, PersistenceEngine, RedbEngine, Write};
pub use value::{Criteria, EntityRef, Row, Value, Values};
