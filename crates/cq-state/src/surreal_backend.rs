//! SurrealDB-backed [`Backend`]
//!
//! Rows live in the `entities` table keyed `entities:⟨kind/key⟩`. A commit is
//! a single SurrealQL transaction: each precondition is re-read and compared
//! with `THROW` on mismatch, then every mutation is applied. A thrown
//! mismatch (or SurrealDB's own write conflict) surfaces as
//! `StorageError::Conflict`.

use async_trait::async_trait;
use serde::Deserialize;
use surrealdb::engine::any::Any;
use surrealdb::opt::auth::{Database, Root};
use surrealdb::Surreal;
use tracing::{debug, info, instrument};

use crate::error::{StateError, StorageError};
use crate::migrations;
use crate::storage_traits::{
    Backend, EntityKey, Mutation, Precondition, StorageResult, Versioned,
};

const CONFLICT_MARKER: &str = "cq_precondition_failed";

/// Store-wide counter stamped on every written row, so a key that is
/// deleted and re-created never reuses an old revision.
const REVISION_SEQUENCE: &str = "__entity_rev";

/// Configuration for a remote SurrealDB connection
#[derive(Debug, Clone)]
pub struct CloudConfig {
    /// WebSocket endpoint URL (e.g., "wss://xxx.aws-use1.surrealdb.cloud")
    pub endpoint: String,
    pub username: String,
    pub password: String,
    /// Namespace (default: "cq")
    pub namespace: String,
    /// Database name (default: "main")
    pub database: String,
    /// Whether this is a root user (true) or database user (false)
    pub is_root: bool,
}

impl CloudConfig {
    /// Create from environment variables
    ///
    /// Reads:
    /// - SURREALDB_ENDPOINT (required)
    /// - SURREALDB_USERNAME (required)
    /// - SURREALDB_PASSWORD (required)
    /// - SURREALDB_NAMESPACE (optional, default: "cq")
    /// - SURREALDB_DATABASE (optional, default: "main")
    /// - SURREALDB_ROOT (optional, default: "false")
    pub fn from_env() -> std::result::Result<Self, String> {
        let endpoint =
            std::env::var("SURREALDB_ENDPOINT").map_err(|_| "SURREALDB_ENDPOINT not set")?;
        let username =
            std::env::var("SURREALDB_USERNAME").map_err(|_| "SURREALDB_USERNAME not set")?;
        let password =
            std::env::var("SURREALDB_PASSWORD").map_err(|_| "SURREALDB_PASSWORD not set")?;
        let namespace = std::env::var("SURREALDB_NAMESPACE").unwrap_or_else(|_| "cq".to_string());
        let database = std::env::var("SURREALDB_DATABASE").unwrap_or_else(|_| "main".to_string());
        let is_root = std::env::var("SURREALDB_ROOT")
            .map(|v| v.to_lowercase() == "true")
            .unwrap_or(false);

        Ok(Self {
            endpoint,
            username,
            password,
            namespace,
            database,
            is_root,
        })
    }
}

#[derive(Debug, Deserialize)]
struct EntityRow {
    kind: String,
    key: String,
    rev: i64,
    body: String,
}

impl EntityRow {
    fn into_versioned(self) -> StorageResult<Versioned> {
        Ok(Versioned {
            key: EntityKey::new(self.kind, self.key),
            rev: self.rev.max(0) as u64,
            body: serde_json::from_str(&self.body)?,
        })
    }
}

#[derive(Debug, Deserialize)]
struct SequenceRow {
    counter: i64,
}

fn record_id(key: &EntityKey) -> String {
    format!("{}/{}", key.kind, key.key)
}

/// SurrealDB-backed implementation of [`Backend`].
#[derive(Clone)]
pub struct SurrealBackend {
    db: Surreal<Any>,
}

impl SurrealBackend {
    /// Connect to `mem://`, select `cq/main` and initialize the schema.
    pub async fn in_memory() -> crate::Result<Self> {
        Self::connect("mem://").await
    }

    /// Connect to any SurrealDB URL (`mem://`, `surrealkv://path`, `ws://...`).
    #[instrument]
    pub async fn connect(url: &str) -> crate::Result<Self> {
        let db = surrealdb::engine::any::connect(url)
            .await
            .map_err(|e| StateError::Connection(format!("Failed to connect to {url}: {e}")))?;

        db.use_ns("cq")
            .use_db("main")
            .await
            .map_err(|e| StateError::Connection(e.to_string()))?;

        migrations::init_schema(&db).await?;
        info!(url, "SurrealBackend connected");
        Ok(Self { db })
    }

    /// Connect with credentials.
    #[instrument(skip(config), fields(endpoint = %config.endpoint, namespace = %config.namespace))]
    pub async fn connect_cloud(config: CloudConfig) -> crate::Result<Self> {
        let db = surrealdb::engine::any::connect(&config.endpoint)
            .await
            .map_err(|e| {
                StateError::Connection(format!("Failed to connect to {}: {}", config.endpoint, e))
            })?;

        if config.is_root {
            db.signin(Root {
                username: &config.username,
                password: &config.password,
            })
            .await
            .map_err(|e| StateError::Connection(format!("Root auth failed: {e}")))?;
        } else {
            db.signin(Database {
                namespace: &config.namespace,
                database: &config.database,
                username: &config.username,
                password: &config.password,
            })
            .await
            .map_err(|e| StateError::Connection(format!("DB auth failed: {e}")))?;
        }

        db.use_ns(&config.namespace)
            .use_db(&config.database)
            .await
            .map_err(|e| StateError::Connection(e.to_string()))?;

        migrations::init_schema(&db).await?;
        info!("SurrealBackend connected (cloud)");
        Ok(Self { db })
    }

    /// Create from environment variables.
    ///
    /// Tries [`CloudConfig::from_env`], then `SURREALDB_URL`, then falls back
    /// to local persistence under `.cq/db`.
    pub async fn from_env() -> crate::Result<Self> {
        if let Ok(config) = CloudConfig::from_env() {
            return Self::connect_cloud(config).await;
        }
        if let Ok(url) = std::env::var("SURREALDB_URL") {
            return Self::connect(&url).await;
        }
        let path = ".cq/db";
        std::fs::create_dir_all(path).map_err(|e| {
            StateError::Connection(format!("Failed to create database directory {path}: {e}"))
        })?;
        Self::connect(&format!("surrealkv://{path}")).await
    }
}

fn backend_err(e: surrealdb::Error) -> StorageError {
    StorageError::Backend(e.to_string())
}

#[async_trait]
impl Backend for SurrealBackend {
    async fn get(&self, key: &EntityKey) -> StorageResult<Option<Versioned>> {
        let mut res = self
            .db
            .query("SELECT kind, key, rev, body FROM type::thing('entities', $id)")
            .bind(("id", record_id(key)))
            .await
            .map_err(backend_err)?;
        let rows: Vec<EntityRow> = res.take(0).map_err(backend_err)?;
        rows.into_iter()
            .next()
            .map(EntityRow::into_versioned)
            .transpose()
    }

    async fn list(&self, kind: &str) -> StorageResult<Vec<Versioned>> {
        let mut res = self
            .db
            .query("SELECT kind, key, rev, body FROM entities WHERE kind = $kind ORDER BY key")
            .bind(("kind", kind.to_string()))
            .await
            .map_err(backend_err)?;
        let rows: Vec<EntityRow> = res.take(0).map_err(backend_err)?;
        rows.into_iter().map(EntityRow::into_versioned).collect()
    }

    async fn commit(
        &self,
        checks: Vec<Precondition>,
        mutations: Vec<Mutation>,
    ) -> StorageResult<()> {
        let mut sql = String::from("BEGIN TRANSACTION;\n");
        let mut binds: Vec<(String, serde_json::Value)> = Vec::new();

        for (i, check) in checks.iter().enumerate() {
            sql.push_str(&format!(
                "LET $cur{i} = (SELECT VALUE rev FROM type::thing('entities', $cid{i}))[0] ?? 0;\n\
                 IF $cur{i} != $crev{i} {{ THROW \"{CONFLICT_MARKER}\"; }};\n"
            ));
            binds.push((format!("cid{i}"), record_id(&check.key).into()));
            binds.push((format!("crev{i}"), (check.rev as i64).into()));
        }

        if mutations.iter().any(|m| matches!(m, Mutation::Put { .. })) {
            sql.push_str(
                "LET $rev = (UPSERT type::thing('sequences', $revseq) \
                 SET counter = (counter ?? 0) + 1 RETURN AFTER)[0].counter;\n",
            );
            binds.push(("revseq".to_string(), REVISION_SEQUENCE.into()));
        }
        for (i, mutation) in mutations.iter().enumerate() {
            match mutation {
                Mutation::Put { key, body } => {
                    sql.push_str(&format!(
                        "UPSERT type::thing('entities', $wid{i}) CONTENT {{ \
                         kind: $wkind{i}, key: $wkey{i}, rev: $rev, body: $wbody{i} }};\n"
                    ));
                    binds.push((format!("wid{i}"), record_id(key).into()));
                    binds.push((format!("wkind{i}"), key.kind.clone().into()));
                    binds.push((format!("wkey{i}"), key.key.clone().into()));
                    binds.push((format!("wbody{i}"), serde_json::to_string(body)?.into()));
                }
                Mutation::Delete { key } => {
                    sql.push_str(&format!("DELETE type::thing('entities', $wid{i});\n"));
                    binds.push((format!("wid{i}"), record_id(key).into()));
                }
            }
        }
        sql.push_str("COMMIT TRANSACTION;\n");

        let mut query = self.db.query(sql);
        for bind in binds {
            query = query.bind(bind);
        }
        let mut res = query.await.map_err(backend_err)?;
        let errors = res.take_errors();
        if errors.is_empty() {
            debug!(
                checks = checks.len(),
                mutations = mutations.len(),
                "surreal commit applied"
            );
            return Ok(());
        }
        let messages: Vec<String> = errors.values().map(|e| e.to_string()).collect();
        if messages
            .iter()
            .any(|m| m.contains(CONFLICT_MARKER) || m.to_lowercase().contains("conflict"))
        {
            let key = checks
                .first()
                .map(|c| c.key.to_string())
                .unwrap_or_else(|| "transaction".to_string());
            return Err(StorageError::Conflict { key });
        }
        Err(StorageError::Backend(messages.join("; ")))
    }

    async fn allocate_id(&self, sequence: &str) -> StorageResult<i64> {
        let mut res = self
            .db
            .query("UPSERT type::thing('sequences', $name) SET counter = (counter ?? 0) + 1 RETURN AFTER")
            .bind(("name", sequence.to_string()))
            .await
            .map_err(backend_err)?;
        let rows: Vec<SequenceRow> = res.take(0).map_err(backend_err)?;
        rows.into_iter()
            .next()
            .map(|r| r.counter)
            .ok_or_else(|| StorageError::Backend(format!("sequence {sequence} returned no value")))
    }
}
