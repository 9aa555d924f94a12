//! Drive item — the wire-shaped representation of a remote filesystem
//! entity (§3 "Drive item (wire type)").
//!
//! This is what the remote client deserialises Graph API responses into,
//! and what the delta loop hands to the inode graph. It intentionally
//! mirrors the remote JSON shape rather than the richer runtime [`Inode`]
//! type defined alongside it: a `DriveItem` has no node ID, no children
//! list, no resident content buffer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::newtypes::{FileHash, RemoteId};

/// The drive type a OneDrive account can be backed by. Determines which
/// hash algorithm the remote reports (§6 "Content integrity").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DriveType {
    Personal,
    Business,
    SharePoint,
}

impl DriveType {
    /// Whether this drive type reports SHA-1 (true) or quickXorHash (false).
    pub fn uses_sha1(self) -> bool {
        matches!(self, DriveType::Personal)
    }
}

/// Reference to an item's parent, as embedded in Graph API responses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParentReference {
    pub id: Option<RemoteId>,
    pub path: Option<String>,
    pub drive_id: String,
    pub drive_type: DriveType,
}

/// Presence of this facet marks the item a folder.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FolderFacet {
    pub child_count: u32,
}

/// Presence of this facet marks the item a regular file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileFacet {
    pub sha1: Option<FileHash>,
    pub quick_xor: Option<FileHash>,
}

impl FileFacet {
    /// The hash appropriate to `drive_type`, preferring whichever the
    /// facet actually carries.
    pub fn hash(&self) -> Option<&FileHash> {
        self.sha1.as_ref().or(self.quick_xor.as_ref())
    }
}

/// Presence of this facet marks the item removed server-side.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeletedFacet {
    pub state: DeletedState,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeletedState {
    #[default]
    Deleted,
}

/// A single remote filesystem entity, as returned by `get_item`,
/// `get_children`, or a delta entry (§3).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriveItem {
    pub id: RemoteId,
    pub name: String,
    pub size: u64,
    pub last_modified: DateTime<Utc>,
    pub parent: Option<ParentReference>,
    pub folder: Option<FolderFacet>,
    pub file: Option<FileFacet>,
    pub deleted: Option<DeletedFacet>,
    pub etag: Option<String>,
}

impl DriveItem {
    pub fn is_directory(&self) -> bool {
        self.folder.is_some()
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted.is_some()
    }

    pub fn parent_id(&self) -> Option<&RemoteId> {
        self.parent.as_ref().and_then(|p| p.id.as_ref())
    }

    pub fn hash(&self) -> Option<&FileHash> {
        self.file.as_ref().and_then(|f| f.hash())
    }
}
