//! Per-instance relationship collections and the changes staged against them.

use crate::error::AppError;
use crate::model::entity::RelationKind;
use crate::model::pivot::{PivotJoin, RelationKey};
use crate::value::EntityRef;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectionState {
    Unloaded,
    Loading,
    Loaded,
}

/// A collection belongs to one owner row and one relationship identity. Subtypes sharing a
/// root share the key, so `SuperUser#1.privileges` and `User#1.privileges` are one collection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CollectionKey {
    pub owner_id: u64,
    pub relation: RelationKey,
}

impl CollectionKey {
    pub fn new(owner_id: u64, relation: RelationKey) -> Self {
        CollectionKey { owner_id, relation }
    }

    pub fn owner_root(&self) -> &str {
        &self.relation.owner_root
    }

    pub fn target_root(&self) -> &str {
        &self.relation.target_root
    }
}

impl fmt::Display for CollectionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}.{}", self.relation.owner_root, self.owner_id, self.relation.name)
    }
}

/// How members of a collection are stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Link {
    /// Rows of a pivot table.
    Pivot(PivotJoin),
    /// The join column written by the many-to-one named `mapped_by` on the member side.
    JoinColumn { mapped_by: String, column: String },
}

#[derive(Debug, Clone)]
pub struct Collection {
    state: CollectionState,
    kind: RelationKind,
    link: Link,
    target: String,
    members: Vec<u64>,
}

impl Collection {
    /// `target` is the declared member type; members must be of it or a subtype.
    pub fn new(kind: RelationKind, link: Link, target: &str) -> Self {
        Collection { state: CollectionState::Unloaded, kind, link, target: target.to_string(), members: Vec::new() }
    }

    pub fn state(&self) -> CollectionState {
        self.state
    }

    pub fn kind(&self) -> RelationKind {
        self.kind
    }

    pub fn link(&self) -> &Link {
        &self.link
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn pivot(&self) -> Option<&PivotJoin> {
        match &self.link {
            Link::Pivot(join) => Some(join),
            Link::JoinColumn { .. } => None,
        }
    }

    pub(crate) fn begin_load(&mut self, key: &CollectionKey) -> Result<(), AppError> {
        match self.state {
            CollectionState::Unloaded => {
                self.state = CollectionState::Loading;
                Ok(())
            }
            CollectionState::Loading => Err(AppError::Custom(format!("{key} is already being loaded"))),
            CollectionState::Loaded => Err(AppError::Custom(format!("{key} is already loaded"))),
        }
    }

    pub(crate) fn finish_load(&mut self, ids: impl IntoIterator<Item = u64>) {
        self.members.clear();
        for id in ids {
            self.insert(id);
        }
        self.state = CollectionState::Loaded;
    }

    /// Back to `Unloaded` after a failed read.
    pub(crate) fn abort_load(&mut self) {
        self.members.clear();
        self.state = CollectionState::Unloaded;
    }

    pub fn contains(&self, id: u64) -> bool {
        self.members.contains(&id)
    }

    /// Appends unless present; returns whether the member was new.
    pub(crate) fn insert(&mut self, id: u64) -> bool {
        if self.contains(id) {
            false
        } else {
            self.members.push(id);
            true
        }
    }

    pub(crate) fn remove(&mut self, id: u64) -> bool {
        let before = self.members.len();
        self.members.retain(|m| *m != id);
        before != self.members.len()
    }

    /// Member ids in insertion order. Every call starts from the first member.
    pub fn iter(&self) -> impl Iterator<Item = u64> + '_ {
        self.members.iter().copied()
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

/// A unit-of-work entry. Pivot pairs are always in owning orientation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Change {
    Insert(EntityRef),
    Update(EntityRef),
    Delete(EntityRef),
    Link { table: String, owner: u64, target: u64 },
    Unlink { table: String, owner: u64, target: u64 },
}

impl Change {
    /// Position of the change inside a flushed batch.
    pub(crate) fn phase(&self) -> u8 {
        match self {
            Change::Insert(_) => 0,
            Change::Update(_) => 1,
            Change::Link { .. } | Change::Unlink { .. } => 2,
            Change::Delete(_) => 3,
        }
    }

    pub(crate) fn pair(&self) -> Option<(&str, u64, u64)> {
        match self {
            Change::Link { table, owner, target } | Change::Unlink { table, owner, target } => {
                Some((table.as_str(), *owner, *target))
            }
            _ => None,
        }
    }
}

impl fmt::Display for Change {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Change::Insert(e) => write!(f, "insert {e}"),
            Change::Update(e) => write!(f, "update {e}"),
            Change::Delete(e) => write!(f, "delete {e}"),
            Change::Link { table, owner, target } => write!(f, "link {table}({owner}, {target})"),
            Change::Unlink { table, owner, target } => write!(f, "unlink {table}({owner}, {target})"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeStatus {
    Pending,
    Committed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Staged {
    pub change: Change,
    pub status: ChangeStatus,
}

impl Staged {
    pub fn pending(change: Change) -> Self {
        Staged { change, status: ChangeStatus::Pending }
    }
}

#[cfg(all(test, not(feature = "integration")))]
mod tests {
    use super::*;

    fn key() -> CollectionKey {
        CollectionKey::new(
            1,
            RelationKey { owner_root: "User".into(), name: "privileges".into(), target_root: "Privilege".into() },
        )
    }

    fn collection() -> Collection {
        Collection::new(
            RelationKind::OneToMany,
            Link::JoinColumn { mapped_by: "group".into(), column: "group_id".into() },
            "Privilege",
        )
    }

    #[test]
    fn load_walks_the_state_machine_once() {
        let mut c = collection();
        assert_eq!(c.state(), CollectionState::Unloaded);
        c.begin_load(&key()).unwrap();
        assert_eq!(c.state(), CollectionState::Loading);
        assert!(c.begin_load(&key()).is_err());
        c.finish_load([3, 1, 3]);
        assert_eq!(c.state(), CollectionState::Loaded);
        assert_eq!(c.iter().collect::<Vec<_>>(), vec![3, 1]);
        assert!(c.begin_load(&key()).is_err());
    }

    #[test]
    fn aborted_load_can_be_retried() {
        let mut c = collection();
        c.begin_load(&key()).unwrap();
        c.abort_load();
        assert_eq!(c.state(), CollectionState::Unloaded);
        c.begin_load(&key()).unwrap();
    }

    #[test]
    fn members_stay_unique_and_iteration_restarts() {
        let mut c = collection();
        c.finish_load([]);
        assert!(c.insert(5));
        assert!(!c.insert(5));
        assert!(c.insert(2));
        assert_eq!(c.iter().count(), 2);
        assert_eq!(c.iter().collect::<Vec<_>>(), vec![5, 2]);
        assert!(c.remove(5));
        assert!(!c.remove(5));
        assert_eq!(c.len(), 1);
    }

    #[test]
    fn changes_are_ordered_by_phase() {
        let mut changes = vec![
            Change::Delete(EntityRef::new("User", 1)),
            Change::Link { table: "privilege_user".into(), owner: 1, target: 2 },
            Change::Insert(EntityRef::new("User", 2)),
            Change::Update(EntityRef::new("User", 3)),
        ];
        changes.sort_by_key(Change::phase);
        assert!(matches!(changes[0], Change::Insert(_)));
        assert!(matches!(changes[3], Change::Delete(_)));
        assert_eq!(changes[2].pair(), Some(("privilege_user", 1, 2)));
    }
}
