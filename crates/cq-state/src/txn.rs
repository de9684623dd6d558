//! Optimistic transactions over a [`Backend`].
//!
//! A [`Transaction`] records the revision of every entity it reads and
//! buffers every write. `commit` hands both to the backend, which applies the
//! writes only if none of the reads changed in the meantime. Callers retry a
//! conflicted transaction from scratch, at most [`MAX_TXN_ATTEMPTS`] times.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Notify;
use tracing::{debug, trace};

use crate::clock::Clock;
use crate::error::StorageError;
use crate::fakes::MemoryBackend;
use crate::outbox::OutboxRecord;
use crate::storage_traits::{
    Backend, Entity, EntityKey, Mutation, Precondition, StorageResult, Versioned,
};

/// Attempts made by retry loops before a conflict is surfaced to the caller.
pub const MAX_TXN_ATTEMPTS: u32 = 5;

const BACKOFF_BASE_MS: u64 = 10;
const BACKOFF_MAX_MS: u64 = 1_000;

/// Sleep before retrying attempt `attempt` (1-based) of a conflicted transaction.
pub async fn conflict_backoff(attempt: u32) {
    let exp = attempt.saturating_sub(1).min(16);
    let delay = BACKOFF_BASE_MS
        .saturating_mul(1u64 << exp)
        .min(BACKOFF_MAX_MS);
    tokio::time::sleep(Duration::from_millis(delay)).await;
}

/// Shared handle to a backend plus the clock used for transaction time.
#[derive(Clone)]
pub struct Datastore {
    backend: Arc<dyn Backend>,
    clock: Arc<dyn Clock>,
    committed: Arc<Notify>,
    next_txn_id: Arc<AtomicU64>,
}

impl Datastore {
    pub fn new(backend: Arc<dyn Backend>, clock: Arc<dyn Clock>) -> Self {
        Self {
            backend,
            clock,
            committed: Arc::new(Notify::new()),
            next_txn_id: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Datastore over a fresh [`MemoryBackend`].
    pub fn in_memory(clock: Arc<dyn Clock>) -> Self {
        Self::new(Arc::new(MemoryBackend::new()), clock)
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn clock(&self) -> Arc<dyn Clock> {
        self.clock.clone()
    }

    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    /// Woken after every successful commit.
    pub fn committed(&self) -> Arc<Notify> {
        self.committed.clone()
    }

    /// Start a transaction. Its logical time is the clock's current time.
    pub fn begin(&self) -> Transaction {
        let id = self.next_txn_id.fetch_add(1, Ordering::Relaxed);
        trace!(txn_id = id, "transaction started");
        Transaction {
            id,
            now: self.clock.now(),
            store: self.clone(),
            reads: BTreeMap::new(),
            writes: BTreeMap::new(),
        }
    }

    /// Non-transactional read.
    pub async fn get<E: Entity>(&self, key: &str) -> StorageResult<Option<E>> {
        match self.backend.get(&EntityKey::of::<E>(key)).await? {
            Some(row) => Ok(Some(row.decode()?)),
            None => Ok(None),
        }
    }

    /// Non-transactional read of every entity of kind `E`, ordered by key.
    pub async fn list<E: Entity>(&self) -> StorageResult<Vec<E>> {
        self.backend
            .list(E::KIND)
            .await?
            .iter()
            .map(Versioned::decode)
            .collect()
    }

    pub async fn allocate_id(&self, sequence: &str) -> StorageResult<i64> {
        self.backend.allocate_id(sequence).await
    }

    /// Outbox rows whose `eta` has passed, oldest first, with their revisions.
    pub async fn due_outbox(&self, now: DateTime<Utc>) -> StorageResult<Vec<(u64, OutboxRecord)>> {
        let mut due = Vec::new();
        for row in self.backend.list(OutboxRecord::KIND).await? {
            let record: OutboxRecord = row.decode()?;
            if record.is_due(now) {
                due.push((row.rev, record));
            }
        }
        due.sort_by(|a, b| (a.1.eta, &a.1.id).cmp(&(b.1.eta, &b.1.id)));
        Ok(due)
    }

    /// Earliest `eta` among pending outbox rows.
    pub async fn next_outbox_eta(&self) -> StorageResult<Option<DateTime<Utc>>> {
        let mut next: Option<DateTime<Utc>> = None;
        for row in self.backend.list(OutboxRecord::KIND).await? {
            let record: OutboxRecord = row.decode()?;
            next = Some(next.map_or(record.eta, |n| n.min(record.eta)));
        }
        Ok(next)
    }

    /// Delete a delivered outbox row if nobody else already did.
    pub async fn ack_outbox(&self, rev: u64, record: &OutboxRecord) -> StorageResult<()> {
        let key = EntityKey::of::<OutboxRecord>(record.id.clone());
        let res = self
            .backend
            .commit(
                vec![Precondition {
                    key: key.clone(),
                    rev,
                }],
                vec![Mutation::Delete { key }],
            )
            .await;
        match res {
            Err(e) if e.is_conflict() => {
                debug!(outbox_id = %record.id, "outbox row already acknowledged");
                Ok(())
            }
            other => other,
        }
    }
}

/// One optimistic transaction.
///
/// Reads go to the backend (or to this transaction's own pending writes) and
/// remember the observed revision. Nothing is visible to others until
/// [`Transaction::commit`] succeeds.
pub struct Transaction {
    id: u64,
    now: DateTime<Utc>,
    store: Datastore,
    reads: BTreeMap<EntityKey, u64>,
    writes: BTreeMap<EntityKey, Option<serde_json::Value>>,
}

impl Transaction {
    /// Process-unique transaction identifier.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Logical time of the transaction.
    pub fn now(&self) -> DateTime<Utc> {
        self.now
    }

    pub async fn get<E: Entity>(&mut self, key: &str) -> StorageResult<Option<E>> {
        let key = EntityKey::of::<E>(key);
        if let Some(pending) = self.writes.get(&key) {
            return match pending {
                Some(body) => Ok(Some(serde_json::from_value(body.clone())?)),
                None => Ok(None),
            };
        }
        let row = self.store.backend.get(&key).await?;
        let rev = row.as_ref().map_or(0, |r| r.rev);
        match self.reads.get(&key) {
            Some(seen) if *seen != rev => {
                return Err(StorageError::Conflict {
                    key: key.to_string(),
                })
            }
            _ => {
                self.reads.insert(key, rev);
            }
        }
        match row {
            Some(row) => Ok(Some(row.decode()?)),
            None => Ok(None),
        }
    }

    /// Like [`Transaction::get`], failing with `NotFound` when absent.
    pub async fn must_get<E: Entity>(&mut self, key: &str) -> StorageResult<E> {
        self.get(key).await?.ok_or_else(|| StorageError::NotFound {
            key: EntityKey::of::<E>(key).to_string(),
        })
    }

    pub fn put<E: Entity>(&mut self, entity: &E) -> StorageResult<()> {
        let body = serde_json::to_value(entity)?;
        self.writes
            .insert(EntityKey::of::<E>(entity.entity_key()), Some(body));
        Ok(())
    }

    pub fn delete<E: Entity>(&mut self, key: &str) {
        self.writes.insert(EntityKey::of::<E>(key), None);
    }

    /// Record a task for delivery after commit, not before `eta`
    /// (immediately when `None`).
    pub fn enqueue<T: Serialize>(&mut self, eta: Option<DateTime<Utc>>, task: &T) -> StorageResult<()> {
        let record = OutboxRecord::new(self.now, eta.unwrap_or(self.now), serde_json::to_value(task)?);
        self.put(&record)
    }

    /// Number of pending outbox rows written by this transaction.
    pub fn enqueued(&self) -> usize {
        self.writes
            .keys()
            .filter(|k| k.kind == OutboxRecord::KIND)
            .count()
    }

    /// Apply all buffered writes atomically.
    ///
    /// Fails with [`StorageError::Conflict`] if any entity read by this
    /// transaction changed since it was read.
    pub async fn commit(self) -> StorageResult<()> {
        if self.writes.is_empty() {
            return Ok(());
        }
        let checks = self
            .reads
            .into_iter()
            .map(|(key, rev)| Precondition { key, rev })
            .collect();
        let mutations = self
            .writes
            .into_iter()
            .map(|(key, body)| match body {
                Some(body) => Mutation::Put { key, body },
                None => Mutation::Delete { key },
            })
            .collect();
        self.store.backend.commit(checks, mutations).await?;
        trace!(txn_id = self.id, "transaction committed");
        self.store.committed.notify_waiters();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::TestClock;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Counter {
        name: String,
        value: u32,
    }

    impl Entity for Counter {
        const KIND: &'static str = "counter";
        fn entity_key(&self) -> String {
            self.name.clone()
        }
    }

    fn store() -> Datastore {
        Datastore::in_memory(Arc::new(TestClock::new(Utc::now())))
    }

    #[tokio::test]
    async fn reads_own_writes() {
        let ds = store();
        let mut txn = ds.begin();
        assert!(txn.get::<Counter>("a").await.unwrap().is_none());
        txn.put(&Counter { name: "a".into(), value: 1 }).unwrap();
        let seen = txn.get::<Counter>("a").await.unwrap().unwrap();
        assert_eq!(seen.value, 1);

        // Not visible outside before commit.
        assert!(ds.get::<Counter>("a").await.unwrap().is_none());
        txn.commit().await.unwrap();
        assert_eq!(ds.get::<Counter>("a").await.unwrap().unwrap().value, 1);
    }

    #[tokio::test]
    async fn stale_read_conflicts() {
        let ds = store();
        let mut t1 = ds.begin();
        let mut t2 = ds.begin();
        assert!(t1.get::<Counter>("a").await.unwrap().is_none());
        assert!(t2.get::<Counter>("a").await.unwrap().is_none());

        t1.put(&Counter { name: "a".into(), value: 1 }).unwrap();
        t2.put(&Counter { name: "a".into(), value: 2 }).unwrap();
        t1.commit().await.unwrap();

        let err = t2.commit().await.unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(ds.get::<Counter>("a").await.unwrap().unwrap().value, 1);
    }

    #[tokio::test]
    async fn delete_is_buffered() {
        let ds = store();
        let mut txn = ds.begin();
        txn.put(&Counter { name: "a".into(), value: 1 }).unwrap();
        txn.commit().await.unwrap();

        let mut txn = ds.begin();
        txn.delete::<Counter>("a");
        assert!(txn.get::<Counter>("a").await.unwrap().is_none());
        txn.commit().await.unwrap();
        assert!(ds.get::<Counter>("a").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn outbox_rows_respect_eta() {
        let clock = Arc::new(TestClock::new(Utc::now()));
        let ds = Datastore::in_memory(clock.clone());
        let mut txn = ds.begin();
        let later = txn.now() + chrono::Duration::minutes(1);
        txn.enqueue(None, &"now").unwrap();
        txn.enqueue(Some(later), &"later").unwrap();
        assert_eq!(txn.enqueued(), 2);
        txn.commit().await.unwrap();

        let due = ds.due_outbox(clock.now()).await.unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].1.task, serde_json::json!("now"));
        assert_eq!(ds.next_outbox_eta().await.unwrap(), Some(clock.now()));

        ds.ack_outbox(due[0].0, &due[0].1).await.unwrap();
        // A second ack is a no-op.
        ds.ack_outbox(due[0].0, &due[0].1).await.unwrap();

        clock.advance(chrono::Duration::minutes(1));
        let due = ds.due_outbox(clock.now()).await.unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].1.task, serde_json::json!("later"));
    }
}
