//! Local state store - SQLite-backed persistence for the inode graph
//!
//! Backs the four logical buckets of the node/content model:
//! - `metadata`: one row per inode (the in-memory graph's durable shadow)
//! - `content`: cached file bytes, keyed by the same id as `metadata`
//! - `delta_cursor`: the single `@odata.deltaLink` cursor for resuming sync
//! - `uploads`: pending/in-flight upload sessions
//!
//! Plus a `node_ids` counter table backing atomic inode-number assignment.

pub mod pool;
pub mod repository;

pub use pool::DatabasePool;
pub use repository::SqliteStore;

/// Errors surfaced by the store layer.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database connection failed: {0}")]
    ConnectionFailed(String),

    #[error("schema migration failed: {0}")]
    MigrationFailed(String),

    #[error("serialization error: {0}")]
    SerializationError(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}
