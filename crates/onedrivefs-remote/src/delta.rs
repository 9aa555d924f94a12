//! Microsoft Graph Delta API for incremental synchronization
//!
//! Implements the delta query pattern for OneDrive, which provides efficient
//! incremental sync by returning only items that have changed since the last
//! query.
//!
//! ## Delta Query Flow
//!
//! 1. **Initial sync**: call [`get_delta`] with `token = None` to get all items
//! 2. **Follow pages**: the function automatically follows `@odata.nextLink`
//! 3. **Save token**: the final page's `delta_link` carries the token for the
//!    next sync cycle (§4.5)
//!
//! ## Usage
//!
//! ```rust,no_run
//! use onedrivefs_remote::client::GraphClient;
//! use onedrivefs_remote::delta;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let client = GraphClient::new("access-token");
//! let response = delta::get_delta(&client, None).await?;
//! println!("Got {} items", response.items.len());
//! # Ok(())
//! # }
//! ```

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use reqwest::{Client, Method};
use serde::Deserialize;
use tracing::{debug, warn};

use onedrivefs_core::domain::{
    DeletedFacet, DeletedState, DriveItem, DriveType, FileFacet, FileHash, FolderFacet,
    ParentReference,
};
use onedrivefs_core::ports::Page;

use crate::client::GraphClient;

/// Path for the delta endpoint relative to the Graph API base URL.
const DELTA_PATH: &str = "/me/drive/root/delta";

// ============================================================================
// Microsoft Graph API response types (JSON deserialization)
// ============================================================================

/// Raw response from the Microsoft Graph delta API.
///
/// See: <https://learn.microsoft.com/en-us/graph/api/driveitem-delta>
#[derive(Debug, Deserialize)]
struct GraphDeltaResponse {
    #[serde(default)]
    value: Vec<GraphDriveItem>,

    #[serde(rename = "@odata.nextLink")]
    next_link: Option<String>,

    #[serde(rename = "@odata.deltaLink")]
    delta_link: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GraphDriveItem {
    id: String,
    #[serde(default)]
    name: String,
    size: Option<u64>,
    last_modified_date_time: Option<DateTime<Utc>>,
    e_tag: Option<String>,
    parent_reference: Option<GraphParentReference>,
    file: Option<GraphFileFacet>,
    folder: Option<GraphFolderFacet>,
    deleted: Option<GraphDeletedFacet>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GraphParentReference {
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

// ============================================================================
// DeltaParser - converts Graph API responses to domain types
// ============================================================================

/// Converts Microsoft Graph wire types into the domain [`DriveItem`].
pub struct DeltaParser;

impl DeltaParser {
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
        if let Some(qx) = hashes.quick_xor_hash.as_deref() {
            if let Ok(hash) = FileHash::quick_xor(qx) {
                return Some(hash);
            }
        }
        None
    }

    /// Returns `None` (and logs) for entries whose `id` cannot be parsed as
    /// a [`onedrivefs_core::domain::RemoteId`] — in practice, never, since
    /// the Graph API never returns an empty item ID.
    fn parse_item(item: GraphDriveItem) -> Option<DriveItem> {
        let id = match onedrivefs_core::domain::RemoteId::new(item.id.clone()) {
            Ok(id) => id,
            Err(e) => {
                warn!(id = item.id, error = %e, "Skipping delta item with invalid id");
                return None;
            }
        };

        let folder = item.folder.map(|f| FolderFacet {
            child_count: f.child_count.unwrap_or(0) as u32,
        });

        let file = item.file.map(|f| {
            let hash = Self::parse_hash(&f.hashes);
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
            id: pr.id.and_then(|s| onedrivefs_core::domain::RemoteId::new(s).ok()),
            path: None,
            drive_id: pr.drive_id.unwrap_or_default(),
            drive_type: Self::parse_drive_type(pr.drive_type.as_deref()),
        });

        Some(DriveItem {
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

    fn parse_response(response: GraphDeltaResponse) -> Page<DriveItem> {
        let items = response
            .value
            .into_iter()
            .filter_map(Self::parse_item)
            .collect();

        Page {
            items,
            next_link: response.next_link,
            delta_link: response.delta_link,
        }
    }

    /// Extracts the delta token value from a `@odata.deltaLink` URL.
    pub fn extract_delta_token(delta_link: &str) -> Option<String> {
        url::Url::parse(delta_link).ok().and_then(|u| {
            u.query_pairs()
                .find(|(key, _)| key == "token")
                .map(|(_, value)| value.into_owned())
        })
    }
}

// ============================================================================
// Delta query functions
// ============================================================================

/// Fetches all delta changes from OneDrive, automatically following
/// pagination via `@odata.nextLink`, until the final page's
/// `@odata.deltaLink` is reached.
///
/// `token = None` performs an initial full delta query.
pub async fn get_delta(
    client: &GraphClient,
    token: Option<&onedrivefs_core::domain::DeltaToken>,
) -> Result<Page<DriveItem>> {
    let path = match token {
        Some(t) => format!("{}?token={}", DELTA_PATH, t.as_str()),
        None => DELTA_PATH.to_string(),
    };

    debug!(has_token = token.is_some(), "Starting delta query");

    let build = |c: &GraphClient| c.request(Method::GET, &path);
    let http_response = client
        .execute_with_retry(&build, "metadata")
        .await
        .context("Failed to send delta request")?;

    // A 410 Gone means the delta token has expired; the caller must start a
    // fresh full sync without a token (§4.5 "Delta token expiry").
    if http_response.status() == reqwest::StatusCode::GONE {
        anyhow::bail!("Delta token expired (410 Gone)");
    }

    let raw_response: GraphDeltaResponse = http_response
        .error_for_status()
        .context("Delta request returned error status")?
        .json()
        .await
        .context("Failed to parse delta response JSON")?;

    let mut response = DeltaParser::parse_response(raw_response);

    debug!(
        items = response.items.len(),
        has_next = response.next_link.is_some(),
        "Received initial delta page"
    );

    let mut page_count: u32 = 1;
    while let Some(next_link) = response.next_link.take() {
        page_count += 1;
        debug!(page = page_count, "Following delta nextLink");

        let page = get_delta_page(client, &next_link).await?;

        debug!(
            page = page_count,
            items = page.items.len(),
            has_next = page.next_link.is_some(),
            "Received delta page"
        );

        response.items.extend(page.items);
        response.next_link = page.next_link;
        response.delta_link = page.delta_link;
    }

    debug!(
        total_items = response.items.len(),
        total_pages = page_count,
        has_delta_link = response.delta_link.is_some(),
        "Delta query complete"
    );

    if response.delta_link.is_none() {
        warn!("Delta query completed without a deltaLink; next sync may require full re-scan");
    }

    Ok(response)
}

/// Fetches a single page of delta results from an absolute `@odata.nextLink`
/// URL. Uses a direct request rather than [`GraphClient::request`], which
/// prepends the base URL.
pub async fn get_delta_page(client: &GraphClient, next_link: &str) -> Result<Page<DriveItem>> {
    let build = |c: &GraphClient| Client::new().get(next_link).bearer_auth(c.access_token());

    let raw_response: GraphDeltaResponse = client
        .execute_with_retry(&build, "metadata")
        .await
        .context("Failed to send delta page request")?
        .error_for_status()
        .context("Delta page request returned error status")?
        .json()
        .await
        .context("Failed to parse delta page response JSON")?;

    Ok(DeltaParser::parse_response(raw_response))
}
