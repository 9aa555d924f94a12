//! Remote client port (driven/secondary port)
//!
//! Abstracts the Microsoft Graph HTTP API into the typed operations §2
//! lists: `get_item`, `get_children`, `get_content`, `mkdir`, `rename`,
//! `remove`, `put_small`, `create_upload_session`, `put_chunk`, `delta`,
//! plus transparent OAuth2 token refresh and an offline detector.
//!
//! ## Design notes
//!
//! - Uses `anyhow::Result` for the same reason the teacher's port traits
//!   do: errors here are adapter-specific (HTTP status, transport) and the
//!   use-case layer only needs to propagate or classify them (§7), not
//!   match every adapter-internal variant.
//! - The interactive OAuth2 login flow (authorization URL, local callback
//!   server) is out of scope (§1); only `refresh_tokens` is part of this
//!   port.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{DeltaToken, DriveItem, RemoteId, RemotePath};

/// OAuth tokens held for the authenticated account.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tokens {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: DateTime<Utc>,
}

impl Tokens {
    pub fn is_expired(&self) -> bool {
        Utc::now() >= self.expires_at
    }

    pub fn expires_within(&self, duration: chrono::Duration) -> bool {
        Utc::now() + duration >= self.expires_at
    }
}

/// One page of a `get_children`/`delta` response plus its continuation.
#[derive(Debug, Clone)]
pub struct Page<T> {
    pub items: Vec<T>,
    /// `@odata.nextLink` — set when more pages remain.
    pub next_link: Option<String>,
    /// `@odata.deltaLink` — set only on the final page of a delta query.
    pub delta_link: Option<String>,
}

/// A server-reported drive quota (for `statfs`, §4.6).
#[derive(Debug, Clone, Copy, Default)]
pub struct Quota {
    pub used: u64,
    pub total: u64,
}

/// Metadata returned after a completed upload, used to verify integrity
/// (§4.4 "Completion").
#[derive(Debug, Clone)]
pub struct UploadResult {
    pub item: DriveItem,
    pub etag: Option<String>,
}

/// Port trait for all remote-store operations. Implementations own HTTP
/// transport, retry policy (§7) and rate limiting.
#[async_trait]
pub trait RemoteClient: Send + Sync {
    /// Refreshes an expired access token using a refresh token. Safe
    /// against concurrent callers (§5 "Shared resource policy").
    async fn refresh_tokens(&self, refresh_token: &str) -> anyhow::Result<Tokens>;

    /// `GET /me/drive/root` or `/me/drive/items/{id}`.
    async fn get_item(&self, id: &RemoteId) -> anyhow::Result<DriveItem>;

    /// `GET /me/drive/items/{id}/children`, one page per call; follow
    /// `next_link` to page through (§4.2).
    async fn get_children(&self, id: &RemoteId) -> anyhow::Result<Page<DriveItem>>;

    async fn get_children_page(&self, next_link: &str) -> anyhow::Result<Page<DriveItem>>;

    /// `GET /me/drive/items/{id}/content`.
    async fn get_content(&self, id: &RemoteId) -> anyhow::Result<Vec<u8>>;

    /// `POST /me/drive/items/{parent}/children` with a folder facet.
    async fn mkdir(&self, parent_id: &RemoteId, name: &str) -> anyhow::Result<DriveItem>;

    /// `PATCH /me/drive/items/{id}` with a new name and/or parent.
    async fn rename(
        &self,
        id: &RemoteId,
        new_parent_id: &RemoteId,
        new_name: &str,
    ) -> anyhow::Result<DriveItem>;

    /// `DELETE /me/drive/items/{id}`.
    async fn remove(&self, id: &RemoteId) -> anyhow::Result<()>;

    /// Single-PUT small upload (`< 4 MiB`). `parent_path` addresses the
    /// destination by path (used for local-ID inodes without a remote ID
    /// yet); pass [`RemotePath::root`]'s child via `parent_path` and the
    /// target file `name`.
    async fn put_small(
        &self,
        parent_path: &RemotePath,
        name: &str,
        data: &[u8],
    ) -> anyhow::Result<UploadResult>;

    /// `POST …/createUploadSession`; returns the session's `uploadUrl`.
    async fn create_upload_session(
        &self,
        parent_path: &RemotePath,
        name: &str,
    ) -> anyhow::Result<String>;

    /// `PUT {upload_url}` with `Content-Range: bytes {offset}-{end}/{total}`.
    /// Returns `Some(UploadResult)` once the server reports the upload
    /// complete (typically on the final chunk), `None` for intermediate
    /// `202 Accepted` responses.
    async fn put_chunk(
        &self,
        upload_url: &str,
        data: &[u8],
        offset: u64,
        total: u64,
    ) -> anyhow::Result<Option<UploadResult>>;

    /// Best-effort cancellation of a resumable upload session (§5
    /// "Cancellation").
    async fn cancel_upload_session(&self, upload_url: &str) -> anyhow::Result<()>;

    /// `GET /me/drive/root/delta?token=...` (or the continuation of one),
    /// `token = None` performs an initial full sync.
    async fn delta(&self, token: Option<&DeltaToken>) -> anyhow::Result<Page<DriveItem>>;

    async fn delta_page(&self, next_link: &str) -> anyhow::Result<Page<DriveItem>>;

    async fn get_quota(&self) -> anyhow::Result<Quota>;
}
