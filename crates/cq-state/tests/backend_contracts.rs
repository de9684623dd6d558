//! Contract tests for the `Backend` trait.
//!
//! Every backend must pass the same checks; each test runs once against
//! `MemoryBackend` and once against an in-memory `SurrealBackend`.

use std::sync::Arc;

use chrono::Utc;
use cq_state::fakes::MemoryBackend;
use cq_state::storage_traits::*;
use cq_state::{Datastore, StorageError, SurrealBackend, TestClock};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Doc {
    id: String,
    value: i64,
    tags: Vec<String>,
}

impl Entity for Doc {
    const KIND: &'static str = "doc";
    fn entity_key(&self) -> String {
        self.id.clone()
    }
}

fn doc(id: &str, value: i64) -> Doc {
    Doc {
        id: id.to_string(),
        value,
        tags: vec!["x".to_string()],
    }
}

async fn backends() -> Vec<(&'static str, Arc<dyn Backend>)> {
    vec![
        ("memory", Arc::new(MemoryBackend::new()) as Arc<dyn Backend>),
        (
            "surreal",
            Arc::new(SurrealBackend::in_memory().await.unwrap()) as Arc<dyn Backend>,
        ),
    ]
}

fn put(d: &Doc) -> Mutation {
    Mutation::Put {
        key: EntityKey::of::<Doc>(d.id.clone()),
        body: serde_json::to_value(d).unwrap(),
    }
}

#[tokio::test]
async fn get_missing_is_none() {
    for (name, backend) in backends().await {
        let got = backend.get(&EntityKey::of::<Doc>("nope")).await.unwrap();
        assert!(got.is_none(), "{name}");
    }
}

#[tokio::test]
async fn put_then_get_round_trip() {
    for (name, backend) in backends().await {
        let d = doc("a", 7);
        backend.commit(vec![], vec![put(&d)]).await.unwrap();
        let row = backend
            .get(&EntityKey::of::<Doc>("a"))
            .await
            .unwrap()
            .unwrap();
        assert!(row.rev > 0, "{name}");
        assert_eq!(row.decode::<Doc>().unwrap(), d, "{name}");
    }
}

#[tokio::test]
async fn every_put_changes_revision() {
    for (name, backend) in backends().await {
        backend.commit(vec![], vec![put(&doc("a", 1))]).await.unwrap();
        let r1 = backend.get(&EntityKey::of::<Doc>("a")).await.unwrap().unwrap().rev;
        backend.commit(vec![], vec![put(&doc("a", 2))]).await.unwrap();
        let r2 = backend.get(&EntityKey::of::<Doc>("a")).await.unwrap().unwrap().rev;
        assert_ne!(r1, r2, "{name}");
    }
}

#[tokio::test]
async fn failed_precondition_applies_nothing() {
    for (name, backend) in backends().await {
        backend.commit(vec![], vec![put(&doc("a", 1))]).await.unwrap();
        let rev = backend.get(&EntityKey::of::<Doc>("a")).await.unwrap().unwrap().rev;

        // Expect "absent" for an existing row: must fail and write nothing.
        let err = backend
            .commit(
                vec![Precondition {
                    key: EntityKey::of::<Doc>("a"),
                    rev: 0,
                }],
                vec![put(&doc("a", 99)), put(&doc("b", 99))],
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::Conflict { .. }), "{name}: {err}");
        assert!(backend.get(&EntityKey::of::<Doc>("b")).await.unwrap().is_none(), "{name}");

        // Correct revision succeeds.
        backend
            .commit(
                vec![Precondition {
                    key: EntityKey::of::<Doc>("a"),
                    rev,
                }],
                vec![put(&doc("a", 2))],
            )
            .await
            .unwrap();
        let row = backend.get(&EntityKey::of::<Doc>("a")).await.unwrap().unwrap();
        assert_eq!(row.decode::<Doc>().unwrap().value, 2, "{name}");
    }
}

#[tokio::test]
async fn list_filters_by_kind_and_orders_by_key() {
    for (name, backend) in backends().await {
        backend
            .commit(vec![], vec![put(&doc("b", 2)), put(&doc("a", 1))])
            .await
            .unwrap();
        backend
            .commit(
                vec![],
                vec![Mutation::Put {
                    key: EntityKey::new("other", "a"),
                    body: serde_json::json!({"x": 1}),
                }],
            )
            .await
            .unwrap();
        let rows = backend.list("doc").await.unwrap();
        let keys: Vec<_> = rows.iter().map(|r| r.key.key.as_str()).collect();
        assert_eq!(keys, vec!["a", "b"], "{name}");
    }
}

#[tokio::test]
async fn delete_removes_row() {
    for (name, backend) in backends().await {
        backend.commit(vec![], vec![put(&doc("a", 1))]).await.unwrap();
        backend
            .commit(
                vec![],
                vec![Mutation::Delete {
                    key: EntityKey::of::<Doc>("a"),
                }],
            )
            .await
            .unwrap();
        assert!(backend.get(&EntityKey::of::<Doc>("a")).await.unwrap().is_none(), "{name}");
    }
}

#[tokio::test]
async fn recreated_row_never_reuses_a_revision() {
    for (name, backend) in backends().await {
        let key = EntityKey::of::<Doc>("a");
        backend.commit(vec![], vec![put(&doc("a", 1))]).await.unwrap();
        let first = backend.get(&key).await.unwrap().unwrap().rev;

        backend
            .commit(vec![], vec![Mutation::Delete { key: key.clone() }])
            .await
            .unwrap();
        backend
            .commit(
                vec![Precondition {
                    key: key.clone(),
                    rev: 0,
                }],
                vec![put(&doc("a", 2))],
            )
            .await
            .unwrap();
        let second = backend.get(&key).await.unwrap().unwrap().rev;
        assert!(second > first, "{name}: {first} then {second}");

        // A reader holding the pre-delete revision must lose.
        let err = backend
            .commit(
                vec![Precondition {
                    key: key.clone(),
                    rev: first,
                }],
                vec![put(&doc("a", 3))],
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::Conflict { .. }), "{name}: {err}");
        let row = backend.get(&key).await.unwrap().unwrap();
        assert_eq!(row.decode::<Doc>().unwrap().value, 2, "{name}");
    }
}

#[tokio::test]
async fn sequences_are_monotonic() {
    for (name, backend) in backends().await {
        let a = backend.allocate_id("cl").await.unwrap();
        let b = backend.allocate_id("cl").await.unwrap();
        let other = backend.allocate_id("run").await.unwrap();
        assert_eq!(a, 1, "{name}");
        assert_eq!(b, 2, "{name}");
        assert_eq!(other, 1, "{name}");
    }
}

#[tokio::test]
async fn transactions_conflict_over_surreal() {
    let backend: Arc<dyn Backend> = Arc::new(SurrealBackend::in_memory().await.unwrap());
    let ds = Datastore::new(backend, Arc::new(TestClock::new(Utc::now())));

    let mut t1 = ds.begin();
    let mut t2 = ds.begin();
    assert!(t1.get::<Doc>("a").await.unwrap().is_none());
    assert!(t2.get::<Doc>("a").await.unwrap().is_none());
    t1.put(&doc("a", 1)).unwrap();
    t2.put(&doc("a", 2)).unwrap();

    t1.commit().await.unwrap();
    assert!(t2.commit().await.unwrap_err().is_conflict());
    assert_eq!(ds.get::<Doc>("a").await.unwrap().unwrap().value, 1);
}
