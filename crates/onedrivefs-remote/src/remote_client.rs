//! `RemoteClient` port implementation backed by Microsoft Graph
//!
//! Wraps [`GraphClient`] and delegates to the `delta` and `upload` modules,
//! making direct requests for the operations neither covers (item lookup,
//! directory listing, `mkdir`, `rename`, `remove`).
//!
//! Uses `tokio::sync::Mutex` around the `GraphClient` because `RemoteClient`
//! methods take `&self` while token refresh needs `&mut self` on the
//! underlying client.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::debug;

use onedrivefs_core::domain::{
    DeletedFacet, DeletedState, DeltaToken, DriveItem, DriveType, FileFacet, FileHash,
    FolderFacet, ParentReference, RemoteId, RemotePath,
};
use onedrivefs_core::ports::{Page, Quota, RemoteClient, Tokens, UploadResult};

use crate::auth::{OAuth2Config, TokenRefresher};
use crate::client::GraphClient;
use crate::delta;
use crate::upload;

// ============================================================================
// Wire types shared by get_item / get_children / mkdir / rename
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GraphItem {
    id: String,
    #[serde(default)]
    name: String,
    size: Option<u64>,
    last_modified_date_time: Option<DateTime<Utc>>,
    e_tag: Option<String>,
    parent_reference: Option<GraphParentRef>,
    file: Option<GraphFileFacet>,
    folder: Option<GraphFolderFacet>,
    deleted: Option<GraphDeletedFacet>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GraphParentRef {
    id: Option<String>,
    drive_id: Option<String>,
    drive_type: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GraphFileFacet {
    hashes: Option<GraphHashes>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GraphHashes {
    sha1_hash: Option<String>,
    quick_xor_hash: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GraphFolderFacet {
    child_count: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct GraphDeletedFacet {
    #[allow(dead_code)]
    state: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GraphChildrenResponse {
    #[serde(default)]
    value: Vec<GraphItem>,
    #[serde(rename = "@odata.nextLink")]
    next_link: Option<String>,
}

fn parse_drive_type(s: Option<&str>) -> DriveType {
    match s {
        Some("business") => DriveType::Business,
        Some("documentLibrary") => DriveType::SharePoint,
        _ => DriveType::Personal,
    }
}

fn parse_hash(hashes: &Option<GraphHashes>) -> Option<FileHash> {
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

/// Converts a Graph API item response into the domain [`DriveItem`].
///
/// Returns an error if the item's `id` is empty, which the Graph API never
/// sends in practice but which would otherwise construct an invalid
/// [`RemoteId`].
fn parse_item(item: GraphItem) -> Result<DriveItem> {
    let id = RemoteId::new(item.id.clone())
        .with_context(|| format!("Graph item had invalid id: {:?}", item.id))?;

    let folder = item.folder.map(|f| FolderFacet {
        child_count: f.child_count.unwrap_or(0) as u32,
    });

    let file = item.file.map(|f| {
        let hash = parse_hash(&f.hashes);
        FileFacet {
            sha1: hash
                .clone()
                .filter(|h| h.kind() == onedrivefs_core::domain::HashKind::Sha1),
            quick_xor: hash.filter(|h| h.kind() == onedrivefs_core::domain::HashKind::QuickXor),
        }
    });

    let deleted = item.deleted.map(|_| DeletedFacet {
        state: DeletedState::Deleted,
    });

    let parent = item.parent_reference.map(|pr| ParentReference {
        id: pr.id.and_then(|s| RemoteId::new(s).ok()),
        path: None,
        drive_id: pr.drive_id.unwrap_or_default(),
        drive_type: parse_drive_type(pr.drive_type.as_deref()),
    });

    Ok(DriveItem {
        id,
        name: item.name,
        size: item.size.unwrap_or(0),
        last_modified: item.last_modified_date_time.unwrap_or_else(Utc::now),
        parent,
        folder,
        file,
        deleted,
        etag: item.e_tag,
    })
}

// ============================================================================
// GraphRemoteClient
// ============================================================================

/// `RemoteClient` implementation backed by the Microsoft Graph API.
pub struct GraphRemoteClient {
    client: Mutex<GraphClient>,
    token_refresher: TokenRefresher,
    /// Current refresh token, used to reactively recover from a 401 mid-
    /// session. `refresh_tokens` keeps this in sync whenever Microsoft
    /// rotates it.
    refresh_token: Mutex<Option<String>>,
}

/// Checks whether `err`'s display chain mentions an HTTP 401, the shape
/// `reqwest::Response::error_for_status` leaves behind once the body has
/// already been consumed elsewhere in the call chain.
fn is_unauthorized_error(err: &anyhow::Error) -> bool {
    format!("{err:#}").contains("401")
}

impl GraphRemoteClient {
    /// Creates a new client, wrapping `client` and configuring the token
    /// refresher from `oauth_config`. `refresh_token`, if known at startup,
    /// lets a later 401 be recovered from without an external caller in the
    /// loop; pass `None` when none is available yet.
    pub fn new(
        client: GraphClient,
        oauth_config: &OAuth2Config,
        refresh_token: Option<String>,
    ) -> Result<Self> {
        Ok(Self {
            client: Mutex::new(client),
            token_refresher: TokenRefresher::new(oauth_config)?,
            refresh_token: Mutex::new(refresh_token),
        })
    }

    /// Sends the request `build` constructs, reactively refreshing the
    /// access token and retrying once on a 401 (§6/§7). 429 and 5xx are
    /// already handled a layer down by [`GraphClient::execute_with_retry`].
    async fn send<F>(&self, build: &F, endpoint_category: &str) -> Result<Response>
    where
        F: Fn(&GraphClient) -> RequestBuilder,
    {
        let response = {
            let client = self.client.lock().await;
            client.execute_with_retry(build, endpoint_category).await?
        };

        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }

        self.reauth().await.context("token refresh after 401 failed")?;
        let client = self.client.lock().await;
        client.execute_with_retry(build, endpoint_category).await
    }

    /// If `response` failed with the `resourceModified` client subcode
    /// (409 or 412), waits one second and retries the request once more
    /// (§7). Otherwise returns the original error.
    async fn retry_on_resource_modified<F>(
        &self,
        response: Response,
        build: &F,
        endpoint_category: &str,
    ) -> Result<Response>
    where
        F: Fn(&GraphClient) -> RequestBuilder,
    {
        if !matches!(
            response.status(),
            StatusCode::CONFLICT | StatusCode::PRECONDITION_FAILED
        ) {
            return Ok(response);
        }

        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if !GraphClient::is_resource_modified_error(&body) {
            anyhow::bail!("request returned error status {}: {}", status, body);
        }

        debug!(%status, "resourceModified, retrying once after 1s");
        tokio::time::sleep(Duration::from_secs(1)).await;
        self.send(build, endpoint_category).await
    }

    /// Reactively refreshes the access token using the last refresh token
    /// seen, for recovery from a 401 with no external caller driving it.
    async fn reauth(&self) -> Result<()> {
        let refresh_token = self
            .refresh_token
            .lock()
            .await
            .clone()
            .context("received 401 but no refresh token is available to recover")?;
        self.refresh_tokens(&refresh_token).await?;
        Ok(())
    }
}

#[async_trait]
impl RemoteClient for GraphRemoteClient {
    async fn refresh_tokens(&self, refresh_token: &str) -> Result<Tokens> {
        let tokens = self.token_refresher.refresh(refresh_token).await?;
        {
            let mut client = self.client.lock().await;
            client.set_access_token(tokens.access_token.clone());
        }
        *self.refresh_token.lock().await = tokens.refresh_token.clone();
        Ok(tokens)
    }

    async fn get_item(&self, id: &RemoteId) -> Result<DriveItem> {
        let path = format!("/me/drive/items/{}", id.as_str());
        debug!(id = %id, "get_item");

        let build = |c: &GraphClient| c.request(Method::GET, &path);
        let item: GraphItem = self
            .send(&build, "metadata")
            .await?
            .error_for_status()
            .context("get_item returned error status")?
            .json()
            .await
            .context("Failed to parse get_item response")?;

        parse_item(item)
    }

    async fn get_children(&self, id: &RemoteId) -> Result<Page<DriveItem>> {
        let path = format!("/me/drive/items/{}/children", id.as_str());
        debug!(id = %id, "get_children");

        let build = |c: &GraphClient| c.request(Method::GET, &path);
        let response: GraphChildrenResponse = self
            .send(&build, "metadata")
            .await?
            .error_for_status()
            .context("get_children returned error status")?
            .json()
            .await
            .context("Failed to parse get_children response")?;

        let items = response
            .value
            .into_iter()
            .filter_map(|item| parse_item(item).ok())
            .collect();

        Ok(Page {
            items,
            next_link: response.next_link,
            delta_link: None,
        })
    }

    async fn get_children_page(&self, next_link: &str) -> Result<Page<DriveItem>> {
        let build = |c: &GraphClient| {
            reqwest::Client::new()
                .get(next_link)
                .bearer_auth(c.access_token())
        };
        let response: GraphChildrenResponse = self
            .send(&build, "metadata")
            .await?
            .error_for_status()
            .context("get_children_page returned error status")?
            .json()
            .await
            .context("Failed to parse get_children_page response")?;

        let items = response
            .value
            .into_iter()
            .filter_map(|item| parse_item(item).ok())
            .collect();

        Ok(Page {
            items,
            next_link: response.next_link,
            delta_link: None,
        })
    }

    async fn get_content(&self, id: &RemoteId) -> Result<Vec<u8>> {
        let first = {
            let client = self.client.lock().await;
            client.download_file(id).await
        };
        match first {
            Ok(bytes) => Ok(bytes),
            Err(e) if is_unauthorized_error(&e) => {
                self.reauth().await.context("token refresh after 401 failed")?;
                let client = self.client.lock().await;
                client.download_file(id).await
            }
            Err(e) => Err(e),
        }
    }

    async fn mkdir(&self, parent_id: &RemoteId, name: &str) -> Result<DriveItem> {
        let path = format!("/me/drive/items/{}/children", parent_id.as_str());
        debug!(parent = %parent_id, name, "mkdir");

        let body = serde_json::json!({
            "name": name,
            "folder": {},
            "@microsoft.graph.conflictBehavior": "fail",
        });

        let build = |c: &GraphClient| c.request(Method::POST, &path).json(&body);
        let item: GraphItem = self
            .send(&build, "metadata")
            .await?
            .error_for_status()
            .context("mkdir returned error status")?
            .json()
            .await
            .context("Failed to parse mkdir response")?;

        parse_item(item)
    }

    async fn rename(
        &self,
        id: &RemoteId,
        new_parent_id: &RemoteId,
        new_name: &str,
    ) -> Result<DriveItem> {
        let path = format!("/me/drive/items/{}", id.as_str());
        debug!(id = %id, new_parent = %new_parent_id, new_name, "rename");

        let body = serde_json::json!({
            "name": new_name,
            "parentReference": { "id": new_parent_id.as_str() },
        });

        let build = |c: &GraphClient| c.request(Method::PATCH, &path).json(&body);
        let response = self.send(&build, "metadata").await?;
        let response = self
            .retry_on_resource_modified(response, &build, "metadata")
            .await?;

        let item: GraphItem = response
            .error_for_status()
            .context("rename returned error status")?
            .json()
            .await
            .context("Failed to parse rename response")?;

        parse_item(item)
    }

    async fn remove(&self, id: &RemoteId) -> Result<()> {
        let path = format!("/me/drive/items/{}", id.as_str());
        debug!(id = %id, "remove");

        let build = |c: &GraphClient| c.request(Method::DELETE, &path);
        self.send(&build, "metadata")
            .await?
            .error_for_status()
            .context("remove returned error status")?;

        Ok(())
    }

    async fn put_small(
        &self,
        parent_path: &RemotePath,
        name: &str,
        data: &[u8],
    ) -> Result<UploadResult> {
        let first = {
            let client = self.client.lock().await;
            upload::upload_small(&client, parent_path, name, data).await
        };
        match first {
            Ok(result) => Ok(result),
            Err(e) if is_unauthorized_error(&e) => {
                self.reauth().await.context("token refresh after 401 failed")?;
                let client = self.client.lock().await;
                upload::upload_small(&client, parent_path, name, data).await
            }
            Err(e) => Err(e),
        }
    }

    async fn create_upload_session(&self, parent_path: &RemotePath, name: &str) -> Result<String> {
        let client = self.client.lock().await;
        upload::create_upload_session(&client, parent_path, name).await
    }

    async fn put_chunk(
        &self,
        upload_url: &str,
        data: &[u8],
        offset: u64,
        total: u64,
    ) -> Result<Option<UploadResult>> {
        let client = self.client.lock().await;
        let http_client = client.http_client();
        let access_token = client.access_token();
        upload::upload_chunk(http_client, upload_url, access_token, data, offset, total).await
    }

    async fn cancel_upload_session(&self, upload_url: &str) -> Result<()> {
        let client = self.client.lock().await;
        upload::cancel_upload_session(client.http_client(), upload_url).await
    }

    async fn delta(&self, token: Option<&DeltaToken>) -> Result<Page<DriveItem>> {
        let first = {
            let client = self.client.lock().await;
            delta::get_delta(&client, token).await
        };
        match first {
            Ok(page) => Ok(page),
            Err(e) if is_unauthorized_error(&e) => {
                self.reauth().await.context("token refresh after 401 failed")?;
                let client = self.client.lock().await;
                delta::get_delta(&client, token).await
            }
            Err(e) => Err(e),
        }
    }

    async fn delta_page(&self, next_link: &str) -> Result<Page<DriveItem>> {
        let first = {
            let client = self.client.lock().await;
            delta::get_delta_page(&client, next_link).await
        };
        match first {
            Ok(page) => Ok(page),
            Err(e) if is_unauthorized_error(&e) => {
                self.reauth().await.context("token refresh after 401 failed")?;
                let client = self.client.lock().await;
                delta::get_delta_page(&client, next_link).await
            }
            Err(e) => Err(e),
        }
    }

    async fn get_quota(&self) -> Result<Quota> {
        let first = {
            let client = self.client.lock().await;
            client.get_drive_quota().await
        };
        let (used, total) = match first {
            Ok(quota) => quota,
            Err(e) if is_unauthorized_error(&e) => {
                self.reauth().await.context("token refresh after 401 failed")?;
                let client = self.client.lock().await;
                client.get_drive_quota().await?
            }
            Err(e) => return Err(e),
        };
        Ok(Quota { used, total })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_graph_remote_client_creation() {
        let client = GraphClient::new("test-token");
        let config = OAuth2Config::new("test-app-id");
        assert!(GraphRemoteClient::new(client, &config, None).is_ok());
    }

    #[test]
    fn test_parse_item_file() {
        let item = GraphItem {
            id: "FILE001".to_string(),
            name: "test.txt".to_string(),
            size: Some(1024),
            last_modified_date_time: Some("2025-06-15T10:30:00Z".parse().unwrap()),
            e_tag: Some("\"etag1\"".to_string()),
            parent_reference: Some(GraphParentRef {
                id: Some("PARENT001".to_string()),
                drive_id: Some("drive1".to_string()),
                drive_type: Some("personal".to_string()),
            }),
            file: Some(GraphFileFacet {
                hashes: Some(GraphHashes {
                    sha1_hash: Some("A".repeat(40)),
                    quick_xor_hash: None,
                }),
            }),
            folder: None,
            deleted: None,
        };

        let parsed = parse_item(item).unwrap();
        assert_eq!(parsed.id.as_str(), "FILE001");
        assert_eq!(parsed.name, "test.txt");
        assert!(!parsed.is_directory());
        assert!(parsed.hash().is_some());
        assert_eq!(parsed.parent.unwrap().drive_id, "drive1");
    }

    #[test]
    fn test_parse_item_folder() {
        let item = GraphItem {
            id: "FOLDER001".to_string(),
            name: "Photos".to_string(),
            size: Some(0),
            last_modified_date_time: None,
            e_tag: None,
            parent_reference: None,
            file: None,
            folder: Some(GraphFolderFacet {
                child_count: Some(5),
            }),
            deleted: None,
        };

        let parsed = parse_item(item).unwrap();
        assert!(parsed.is_directory());
        assert_eq!(parsed.folder.unwrap().child_count, 5);
    }

    #[test]
    fn test_parse_item_rejects_empty_id() {
        let item = GraphItem {
            id: String::new(),
            name: "bad.txt".to_string(),
            size: None,
            last_modified_date_time: None,
            e_tag: None,
            parent_reference: None,
            file: None,
            folder: None,
            deleted: None,
        };

        assert!(parse_item(item).is_err());
    }

    #[test]
    fn test_children_response_deserialization() {
        let json = r#"{
            "value": [
                { "id": "A", "name": "a.txt", "size": 1 },
                { "id": "B", "name": "b.txt", "size": 2 }
            ],
            "@odata.nextLink": "https://graph.microsoft.com/v1.0/me/drive/items/X/children?$skiptoken=abc"
        }"#;

        let response: GraphChildrenResponse = serde_json::from_str(json).unwrap();
        assert_eq!(response.value.len(), 2);
        assert!(response.next_link.is_some());
    }

    #[test]
    fn test_is_unauthorized_error_detects_401() {
        let err = anyhow::anyhow!("get_item returned error status: HTTP status client error (401 Unauthorized)");
        assert!(is_unauthorized_error(&err));
    }

    #[test]
    fn test_is_unauthorized_error_ignores_other_statuses() {
        let err = anyhow::anyhow!("get_item returned error status: HTTP status client error (404 Not Found)");
        assert!(!is_unauthorized_error(&err));
    }
}
