//! Upload session — snapshot of an in-flight background upload (§4.4).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::newtypes::{FileHash, RemoteId};

/// Upload session state machine: `NotStarted → Started → (Complete | Errored)`.
/// From `Errored` the manager retries back to `NotStarted` until the retry
/// count is exhausted (§4.4).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadState {
    NotStarted,
    Started,
    Complete,
    Errored,
}

/// A snapshot of one inode's pending upload, taken at enqueue time so that
/// subsequent local edits do not corrupt the in-flight transfer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadSession {
    /// Current ID; mutates to the server-assigned ID on completion.
    pub id: RemoteId,
    /// ID at enqueue time, always local for a brand-new item.
    pub old_id: RemoteId,
    pub parent_id: RemoteId,
    pub name: String,
    pub size: u64,
    #[serde(with = "serde_bytes_as_base64")]
    pub data: Vec<u8>,
    pub hash: FileHash,
    pub mtime: DateTime<Utc>,
    pub node_id: u64,
    pub retry_count: u32,
    pub state: UploadState,
    pub last_error: Option<String>,
    /// Set once a resumable session has been created server-side, so a
    /// cooperative cancel (§5 "Cancellation") knows what to tear down.
    pub server_upload_url: Option<String>,
}

/// Maximum retry attempts before a session is abandoned (§4.4, Open
/// Question decision recorded in DESIGN.md: 6).
pub const MAX_UPLOAD_ATTEMPTS: u32 = 6;

/// Files at or above this size use the chunked resumable protocol (§4.4).
pub const LARGE_FILE_THRESHOLD: u64 = 4 * 1024 * 1024;

/// Recommended chunk size for large-file uploads (§4.4).
pub const UPLOAD_CHUNK_SIZE: u64 = 10 * 1024 * 1024;

impl UploadSession {
    pub fn new(
        id: RemoteId,
        parent_id: RemoteId,
        name: String,
        data: Vec<u8>,
        hash: FileHash,
        mtime: DateTime<Utc>,
        node_id: u64,
    ) -> Self {
        let size = data.len() as u64;
        Self {
            old_id: id.clone(),
            id,
            parent_id,
            name,
            size,
            data,
            hash,
            mtime,
            node_id,
            retry_count: 0,
            state: UploadState::NotStarted,
            last_error: None,
            server_upload_url: None,
        }
    }

    /// Whether this session's content requires the chunked protocol.
    pub fn is_large(&self) -> bool {
        self.size >= LARGE_FILE_THRESHOLD
    }

    /// Whether local→remote ID promotion happened during this upload.
    pub fn was_promoted(&self) -> bool {
        self.id != self.old_id
    }

    /// Records a failed attempt; returns `true` if the session should be
    /// abandoned (retry budget exhausted).
    pub fn record_failure(&mut self, error: impl Into<String>) -> bool {
        self.retry_count += 1;
        self.last_error = Some(error.into());
        self.state = if self.retry_count >= MAX_UPLOAD_ATTEMPTS {
            UploadState::Errored
        } else {
            UploadState::NotStarted
        };
        self.retry_count >= MAX_UPLOAD_ATTEMPTS
    }
}

/// Upload sessions persist their byte payload as Base64 in the JSON
/// representation used by the `uploads` bucket (§4.3); raw bytes do not
/// round-trip through `serde_json` directly.
mod serde_bytes_as_base64 {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(d)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}
