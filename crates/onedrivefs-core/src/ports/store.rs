//! Persistent store port (driven/secondary port)
//!
//! Covers the four logical buckets §4.3 names — `metadata`, `content`,
//! `delta`, `uploads` — plus the node-ID assignment operation the inode
//! graph needs at startup (§4.1).
//!
//! ## Design notes
//!
//! - `anyhow::Result` for the same reason as [`super::remote_client`]:
//!   storage errors are adapter-specific (SQLite, filesystem) and the
//!   caller only needs to propagate or surface `EIO` (§7).
//! - Content moves (`move_content`) must be atomic within a single
//!   implementation call — see §4.3 "Content moves".

use async_trait::async_trait;

use crate::domain::{DeltaToken, Inode, RemoteId, UploadSession};

/// Port trait for persistent storage of filesystem state.
#[async_trait]
pub trait Store: Send + Sync {
    // --- metadata bucket ---

    /// Upserts a serialised inode.
    async fn save_inode(&self, inode: &Inode) -> anyhow::Result<()>;

    async fn get_inode(&self, id: &RemoteId) -> anyhow::Result<Option<Inode>>;

    async fn delete_inode(&self, id: &RemoteId) -> anyhow::Result<()>;

    /// Atomically rekeys a metadata row from `old` to `new` (§4.1 `move_id`).
    async fn move_inode(&self, old: &RemoteId, new: &RemoteId) -> anyhow::Result<()>;

    /// All inodes currently in the metadata bucket (used to rehydrate the
    /// in-memory graph on startup).
    async fn all_inodes(&self) -> anyhow::Result<Vec<Inode>>;

    // --- content bucket ---

    async fn save_content(&self, id: &RemoteId, data: &[u8]) -> anyhow::Result<()>;

    async fn get_content(&self, id: &RemoteId) -> anyhow::Result<Option<Vec<u8>>>;

    async fn delete_content(&self, id: &RemoteId) -> anyhow::Result<()>;

    /// Atomically re-keys `content[old]` to `content[new]`, removing the
    /// old entry (§4.3 "Content moves"). Implementations must perform this
    /// in one transaction with the corresponding [`Store::move_inode`].
    async fn move_content(&self, old: &RemoteId, new: &RemoteId) -> anyhow::Result<()>;

    // --- delta bucket ---

    async fn get_delta_cursor(&self) -> anyhow::Result<Option<DeltaToken>>;

    async fn save_delta_cursor(&self, cursor: &DeltaToken) -> anyhow::Result<()>;

    // --- uploads bucket (§4.4 "Queue persistence") ---

    async fn save_upload_session(&self, session: &UploadSession) -> anyhow::Result<()>;

    async fn delete_upload_session(&self, id: &RemoteId) -> anyhow::Result<()>;

    async fn all_upload_sessions(&self) -> anyhow::Result<Vec<UploadSession>>;

    // --- node-ID assignment (§4.1) ---

    /// Atomically allocates the next unused node ID. Node 1 is reserved
    /// for the root and never returned here.
    async fn next_node_id(&self) -> anyhow::Result<u64>;
}
