//! CQ-State: transactional entity store for the commit queue
//!
//! Every piece of shared mutable state the commit queue owns (CL entities,
//! project state, Runs, per-project submit queue records, outbox rows) lives
//! behind the [`Backend`] trait and is read and written through a
//! [`Transaction`].
//!
//! ## Layer 0 - Data/Persistence
//!
//! Focus: optimistic concurrency, atomic conditional commits, durable outbox.
//!
//! ## Key Components
//!
//! - `Datastore`: backend + clock handle, starts transactions
//! - `Transaction`: read tracking, buffered writes, outbox enqueue
//! - `MemoryBackend` / `SurrealBackend`: interchangeable storage engines

pub mod clock;
mod error;
pub mod fakes;
mod migrations;
pub mod outbox;
pub mod storage_traits;
pub mod surreal_backend;
pub mod txn;

pub use clock::{Clock, SystemClock, TestClock};
pub use error::{StateError, StorageError};
pub use outbox::OutboxRecord;
pub use storage_traits::{
    Backend, Entity, EntityKey, Mutation, Precondition, StorageResult, Versioned,
};
pub use surreal_backend::{CloudConfig, SurrealBackend};
pub use txn::{conflict_backoff, Datastore, Transaction, MAX_TXN_ATTEMPTS};

/// Result type for connection and schema operations
pub type Result<T> = std::result::Result<T, StateError>;
