//! Upload operations for Microsoft Graph API (OneDrive)
//!
//! - [`upload_small`] - single-request upload for files under 4 MiB
//! - [`create_upload_session`] - creates a resumable upload session
//! - [`upload_chunk`] - uploads a single chunk within a session
//! - [`upload_large`] - orchestrates the full chunked upload (§4.4)
//!
//! ## Microsoft Graph API references
//!
//! - [Upload small files](https://learn.microsoft.com/en-us/graph/api/driveitem-put-content)
//! - [Upload large files](https://learn.microsoft.com/en-us/graph/api/driveitem-createuploadsession)

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use onedrivefs_core::domain::{
    DeletedFacet, DriveItem, FileFacet, FileHash, FolderFacet, RemoteId, RemotePath,
};
use onedrivefs_core::ports::UploadResult;
use reqwest::Method;
use serde::Deserialize;
use tracing::{debug, info};

use crate::client::GraphClient;

/// Chunk size for large file uploads: 10 MiB. Microsoft requires chunk sizes
/// that are multiples of 320 KiB; 10 MiB = 320 KiB * 32.
const CHUNK_SIZE: usize = 10 * 1024 * 1024;

// ============================================================================
// Graph API DriveItem response types for deserialization
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GraphDriveItem {
    id: String,
    name: String,
    size: Option<u64>,
    last_modified_date_time: Option<String>,
    e_tag: Option<String>,
    file: Option<FileInfo>,
    folder: Option<serde_json::Value>,
    deleted: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct FileInfo {
    hashes: Option<FileHashes>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FileHashes {
    sha1_hash: Option<String>,
    quick_xor_hash: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UploadSessionResponse {
    upload_url: String,
}

// ============================================================================
// GraphDriveItem -> DriveItem / UploadResult conversion
// ============================================================================

fn parse_hash(hashes: &Option<FileHashes>) -> Option<FileHash> {
    let hashes = hashes.as_ref()?;
    if let Some(sha1) = hashes.sha1_hash.as_deref() {
        if let Ok(hash) = FileHash::sha1(sha1) {
            return Some(hash);
        }
    }
    hashes
        .quick_xor_hash
        .as_deref()
        .and_then(|qx| FileHash::quick_xor(qx).ok())
}

fn drive_item_to_result(item: GraphDriveItem) -> Result<UploadResult> {
    let id = RemoteId::new(item.id).context("upload response carried an empty item id")?;

    let is_directory = item.folder.is_some();
    let is_deleted = item.deleted.is_some();

    let modified = item
        .last_modified_date_time
        .as_deref()
        .and_then(|s| s.parse::<DateTime<Utc>>().ok())
        .unwrap_or_else(Utc::now);

    let hash = parse_hash(&item.file.as_ref().and_then(|f| f.hashes.clone()));

    let file = (!is_directory).then(|| {
        let is_sha1 = hash
            .as_ref()
            .map(|h| h.kind() == onedrivefs_core::domain::HashKind::Sha1)
            .unwrap_or(false);
        FileFacet {
            sha1: if is_sha1 { hash.clone() } else { None },
            quick_xor: if is_sha1 { None } else { hash.clone() },
        }
    });

    let drive_item = DriveItem {
        id,
        name: item.name,
        size: item.size.unwrap_or(0),
        last_modified: modified,
        parent: None,
        folder: is_directory.then_some(FolderFacet::default()),
        file,
        deleted: is_deleted.then_some(DeletedFacet::default()),
        etag: item.e_tag.clone(),
    };

    Ok(UploadResult {
        item: drive_item,
        etag: item.e_tag,
    })
}

// ============================================================================
// API path construction helper
// ============================================================================

/// Builds the Graph API path for file operations using the item-by-path
/// pattern.
///
/// - Root: `/me/drive/root:/{name}:/{suffix}`
/// - Subfolder: `/me/drive/root:{parent_path}/{name}:/{suffix}`
fn build_item_path(parent_path: &RemotePath, name: &str, suffix: &str) -> String {
    if parent_path.is_root() {
        format!("/me/drive/root:/{}:/{}", name, suffix)
    } else {
        format!(
            "/me/drive/root:{}/{}:/{}",
            parent_path.as_str(),
            name,
            suffix
        )
    }
}

// ============================================================================
// upload_small
// ============================================================================

/// Uploads a small file (< 4 MiB) in a single PUT request.
///
/// `PUT /me/drive/root:{path}:/content` with the file bytes as the body.
pub async fn upload_small(
    client: &GraphClient,
    parent_path: &RemotePath,
    name: &str,
    data: &[u8],
) -> Result<UploadResult> {
    let path = build_item_path(parent_path, name, "content");
    debug!(
        "Uploading small file ({} bytes): {} -> {}",
        data.len(),
        name,
        path
    );

    let build = |c: &GraphClient| {
        c.request(Method::PUT, &path)
            .header("Content-Type", "application/octet-stream")
            .body(data.to_vec())
    };

    let response = client
        .execute_with_retry(&build, "upload")
        .await
        .context("Failed to send small upload request")?;

    let response = if matches!(
        response.status(),
        reqwest::StatusCode::CONFLICT | reqwest::StatusCode::PRECONDITION_FAILED
    ) {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if GraphClient::is_resource_modified_error(&body) {
            debug!(%status, "small upload hit resourceModified, retrying once after 1s");
            tokio::time::sleep(std::time::Duration::from_secs(1)).await;
            client
                .execute_with_retry(&build, "upload")
                .await
                .context("Failed to send small upload retry request")?
        } else {
            anyhow::bail!("Small upload returned error status {}: {}", status, body);
        }
    } else {
        response
    };

    let item: GraphDriveItem = response
        .error_for_status()
        .context("Small upload returned error status")?
        .json()
        .await
        .context("Failed to parse upload response")?;

    debug!("Small upload completed: id={}, name={}", item.id, item.name);
    drive_item_to_result(item)
}

// ============================================================================
// create_upload_session
// ============================================================================

/// Creates a resumable upload session for large files.
///
/// `POST /me/drive/root:{path}:/createUploadSession`. The returned URL is
/// valid for a limited time (typically 15 minutes of inactivity).
pub async fn create_upload_session(
    client: &GraphClient,
    parent_path: &RemotePath,
    name: &str,
) -> Result<String> {
    let path = build_item_path(parent_path, name, "createUploadSession");
    debug!("Creating upload session for: {}", name);

    let response: UploadSessionResponse = client
        .request(Method::POST, &path)
        .header("Content-Type", "application/json")
        .body("{}")
        .send()
        .await
        .context("Failed to create upload session")?
        .error_for_status()
        .context("Create upload session returned error status")?
        .json()
        .await
        .context("Failed to parse upload session response")?;

    debug!("Upload session created: {}", response.upload_url);
    Ok(response.upload_url)
}

// ============================================================================
// upload_chunk
// ============================================================================

/// Uploads a single chunk of data to a resumable upload session.
///
/// Returns `Some` with the completed item on the final chunk (HTTP 200/201),
/// `None` for intermediate chunks (HTTP 202 Accepted).
pub async fn upload_chunk(
    client: &reqwest::Client,
    upload_url: &str,
    access_token: &str,
    data: &[u8],
    offset: u64,
    total: u64,
) -> Result<Option<UploadResult>> {
    let chunk_len = data.len() as u64;
    let range_end = offset + chunk_len - 1;
    let content_range = format!("bytes {}-{}/{}", offset, range_end, total);

    debug!("Uploading chunk: {} ({} bytes)", content_range, chunk_len);

    let response = client
        .put(upload_url)
        .bearer_auth(access_token)
        .header("Content-Length", chunk_len.to_string())
        .header("Content-Range", &content_range)
        .body(data.to_vec())
        .send()
        .await
        .context("Failed to send chunk upload request")?;

    let status = response.status();

    if status.is_success() {
        if status == reqwest::StatusCode::OK || status == reqwest::StatusCode::CREATED {
            let item: GraphDriveItem = response
                .json()
                .await
                .context("Failed to parse chunk completion response body")?;
            debug!("Upload session completed (status {})", status);
            Ok(Some(drive_item_to_result(item)?))
        } else {
            debug!("Chunk accepted (status {})", status);
            Ok(None)
        }
    } else {
        let error_body = response
            .text()
            .await
            .unwrap_or_else(|_| "unable to read error body".to_string());
        anyhow::bail!("Chunk upload failed with status {}: {}", status, error_body);
    }
}

/// Cancels a resumable upload session by issuing `DELETE` to its URL
/// (best-effort — §5 "Cancellation").
pub async fn cancel_upload_session(client: &reqwest::Client, upload_url: &str) -> Result<()> {
    let _ = client.delete(upload_url).send().await;
    Ok(())
}

// ============================================================================
// upload_large
// ============================================================================

/// Uploads a large file using a resumable upload session with 10 MiB chunks.
///
/// Orchestrates: session creation, chunked PUTs, and parsing of the final
/// response into an [`UploadResult`].
pub async fn upload_large(
    client: &GraphClient,
    parent_path: &RemotePath,
    name: &str,
    data: &[u8],
    progress: Option<Box<dyn Fn(u64, u64) + Send>>,
) -> Result<UploadResult> {
    let total = data.len() as u64;
    info!(
        "Starting large file upload: {} ({} bytes, {} chunks)",
        name,
        total,
        (total + CHUNK_SIZE as u64 - 1) / CHUNK_SIZE as u64
    );

    let upload_url = create_upload_session(client, parent_path, name).await?;

    let http_client = client.http_client();
    let access_token = client.access_token();
    let mut offset: u64 = 0;
    let mut final_result: Option<UploadResult> = None;

    while offset < total {
        let end = std::cmp::min(offset + CHUNK_SIZE as u64, total);
        let chunk = &data[offset as usize..end as usize];

        let result = upload_chunk(http_client, &upload_url, access_token, chunk, offset, total)
            .await
            .with_context(|| {
                format!(
                    "Failed to upload chunk at offset {}/{} for {}",
                    offset, total, name
                )
            })?;

        offset = end;

        if let Some(ref cb) = progress {
            cb(offset, total);
        }

        if let Some(r) = result {
            final_result = Some(r);
        }
    }

    let result = final_result
        .context("Upload session completed without receiving a final item response")?;

    info!(
        "Large upload completed: id={}, name={}, size={}",
        result.item.id, result.item.name, result.item.size
    );

    Ok(result)
}
