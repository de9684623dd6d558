//! Storage trait definitions for the commit queue
//!
//! - `Entity`: a serde type stored under a `(kind, key)` pair
//! - `Backend`: versioned rows with an atomic, conditional multi-row commit
//!
//! Every stored row carries a revision. A revision of `0` means "absent".
//! `commit` applies all mutations only if every precondition still holds,
//! which is what optimistic transactions are built on.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::StorageError;

/// Result type for storage operations
pub type StorageResult<T> = std::result::Result<T, StorageError>;

// ---------------------------------------------------------------------------
// Keys and rows
// ---------------------------------------------------------------------------

/// Address of a stored entity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntityKey {
    pub kind: String,
    pub key: String,
}

impl EntityKey {
    pub fn new(kind: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            key: key.into(),
        }
    }

    /// Key for an entity type `E` with the given key string.
    pub fn of<E: Entity>(key: impl Into<String>) -> Self {
        Self::new(E::KIND, key)
    }
}

impl std::fmt::Display for EntityKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.kind, self.key)
    }
}

/// A row as returned by a backend.
#[derive(Debug, Clone, PartialEq)]
pub struct Versioned {
    pub key: EntityKey,
    pub rev: u64,
    pub body: serde_json::Value,
}

impl Versioned {
    pub fn decode<E: Entity>(&self) -> StorageResult<E> {
        Ok(serde_json::from_value(self.body.clone())?)
    }
}

/// Commit precondition: the row at `key` must currently have revision `rev`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Precondition {
    pub key: EntityKey,
    pub rev: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Mutation {
    Put {
        key: EntityKey,
        body: serde_json::Value,
    },
    Delete {
        key: EntityKey,
    },
}

impl Mutation {
    pub fn key(&self) -> &EntityKey {
        match self {
            Mutation::Put { key, .. } | Mutation::Delete { key } => key,
        }
    }
}

// ---------------------------------------------------------------------------
// Entity
// ---------------------------------------------------------------------------

/// A type persisted as one row.
pub trait Entity: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Row kind, one per entity type.
    const KIND: &'static str;

    /// Row key, unique within `KIND`.
    fn entity_key(&self) -> String;
}

// ---------------------------------------------------------------------------
// Backend
// ---------------------------------------------------------------------------

/// Versioned row store.
///
/// Guarantees:
/// - `commit` is atomic: either every mutation is applied or none is.
/// - `commit` fails with `StorageError::Conflict` if any precondition does
///   not hold at commit time.
/// - Every `Put` gives the row a revision different from any revision the
///   row had before.
#[async_trait]
pub trait Backend: Send + Sync {
    async fn get(&self, key: &EntityKey) -> StorageResult<Option<Versioned>>;

    /// All rows of one kind, ordered by key.
    async fn list(&self, kind: &str) -> StorageResult<Vec<Versioned>>;

    async fn commit(
        &self,
        checks: Vec<Precondition>,
        mutations: Vec<Mutation>,
    ) -> StorageResult<()>;

    /// Allocate the next value of a named sequence, starting at 1.
    ///
    /// Not transactional: an allocated value is never handed out twice even
    /// if the caller's transaction later fails.
    async fn allocate_id(&self, sequence: &str) -> StorageResult<i64>;
}
