//! In-memory backend (tests and single-process deployments)
//!
//! `MemoryBackend` satisfies the [`Backend`] contract with a mutex-guarded
//! map. Revisions come from one counter shared by all rows, so a revision is
//! never reused even across delete and re-create.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::error::StorageError;
use crate::storage_traits::*;

#[derive(Debug, Default)]
struct Tables {
    rows: BTreeMap<EntityKey, (u64, serde_json::Value)>,
    last_rev: u64,
    sequences: HashMap<String, i64>,
}

#[derive(Debug, Default)]
pub struct MemoryBackend {
    tables: Mutex<Tables>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored rows of one kind.
    pub fn count(&self, kind: &str) -> usize {
        let tables = self.tables.lock().unwrap();
        tables.rows.keys().filter(|k| k.kind == kind).count()
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn get(&self, key: &EntityKey) -> StorageResult<Option<Versioned>> {
        let tables = self.tables.lock().unwrap();
        Ok(tables.rows.get(key).map(|(rev, body)| Versioned {
            key: key.clone(),
            rev: *rev,
            body: body.clone(),
        }))
    }

    async fn list(&self, kind: &str) -> StorageResult<Vec<Versioned>> {
        let tables = self.tables.lock().unwrap();
        Ok(tables
            .rows
            .iter()
            .filter(|(k, _)| k.kind == kind)
            .map(|(k, (rev, body))| Versioned {
                key: k.clone(),
                rev: *rev,
                body: body.clone(),
            })
            .collect())
    }

    async fn commit(
        &self,
        checks: Vec<Precondition>,
        mutations: Vec<Mutation>,
    ) -> StorageResult<()> {
        let mut tables = self.tables.lock().unwrap();
        for check in &checks {
            let current = tables.rows.get(&check.key).map_or(0, |(rev, _)| *rev);
            if current != check.rev {
                return Err(StorageError::Conflict {
                    key: check.key.to_string(),
                });
            }
        }
        for mutation in mutations {
            match mutation {
                Mutation::Put { key, body } => {
                    tables.last_rev += 1;
                    let rev = tables.last_rev;
                    tables.rows.insert(key, (rev, body));
                }
                Mutation::Delete { key } => {
                    tables.rows.remove(&key);
                }
            }
        }
        Ok(())
    }

    async fn allocate_id(&self, sequence: &str) -> StorageResult<i64> {
        let mut tables = self.tables.lock().unwrap();
        let next = tables.sequences.entry(sequence.to_string()).or_insert(0);
        *next += 1;
        Ok(*next)
    }
}
