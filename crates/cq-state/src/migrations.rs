//! SurrealDB schema initialization
//!
//! Safe to call on every connection: definitions use `IF NOT EXISTS`.

use crate::error::StateError;
use crate::Result;
use surrealdb::engine::any::Any;
use surrealdb::Surreal;
use tracing::{debug, info};

/// Define the `entities` and `sequences` tables.
///
/// ```text
/// TABLE entities {
///   id:    entities:⟨kind/key⟩
///   kind:  STRING (indexed)
///   key:   STRING
///   rev:   INT    (bumped on every write)
///   body:  STRING (JSON document)
/// }
/// TABLE sequences {
///   id:      sequences:⟨name⟩
///   counter: INT
/// }
/// ```
pub async fn init_schema(db: &Surreal<Any>) -> Result<()> {
    info!("Initializing commit queue SurrealDB schema");

    debug!("Initializing entities table");
    let sql = r#"
        DEFINE TABLE IF NOT EXISTS entities SCHEMALESS;
        DEFINE INDEX IF NOT EXISTS idx_entities_kind ON TABLE entities COLUMNS kind;
        DEFINE TABLE IF NOT EXISTS sequences SCHEMALESS;
    "#;
    db.query(sql)
        .await
        .map_err(|e| StateError::SchemaSetup(e.to_string()))?
        .check()
        .map_err(|e| StateError::SchemaSetup(e.to_string()))?;

    info!("Commit queue schema initialization complete");
    Ok(())
}
