//! Inode — the runtime entity the filesystem engine operates on (§3
//! "Inode (runtime entity)").
//!
//! Unlike [`super::drive_item::DriveItem`], which is a snapshot of what the
//! remote last reported, an `Inode` also carries everything the kernel
//! needs between calls: the node ID the kernel addresses it by, whatever
//! content bytes are resident, and the dirty flag that drives the upload
//! manager. The inode graph (`onedrivefs-fuse::graph`) owns the concurrent
//! map of these; this type only encodes the data and the invariants that
//! apply to a single instance in isolation.

use chrono::{DateTime, Utc};

use super::errors::DomainError;
use super::newtypes::{FileHash, RemoteId};

/// POSIX mode bits. `0` means "derive from the folder/file facet" (§3).
pub const MODE_DERIVE: u32 = 0;

/// One filesystem object: a file or a directory.
#[derive(Debug, Clone)]
pub struct Inode {
    /// The active ID. `local-`-prefixed until the remote assigns a
    /// permanent one (§3 "Identity").
    pub id: RemoteId,
    pub name: String,
    pub size: u64,
    pub mtime: DateTime<Utc>,
    /// `None` only for the root.
    pub parent_id: Option<RemoteId>,
    pub hash: Option<FileHash>,
    pub etag: Option<String>,
    pub is_directory: bool,

    /// Stable kernel handle, assigned once by the node-ID mapper (§4.1).
    /// Zero until assigned.
    pub node_id: u64,
    /// `None` until the directory has been listed at least once (§4.2).
    pub children: Option<Vec<RemoteId>>,
    /// `None` when content is not resident in RAM (§3).
    pub data: Option<Vec<u8>>,
    /// Dirty flag: set by `write`/`setattr`-truncate, cleared by a
    /// completed upload.
    pub has_changes: bool,
    /// Count of `children` whose inode is a directory; drives `nlink`.
    pub subdir_count: u32,
    /// `0` ([`MODE_DERIVE`]) means "derive from `is_directory`".
    pub mode: u32,
}

impl Inode {
    /// Builds a new local (not-yet-uploaded) inode, e.g. for `mknod`/`create`.
    pub fn new_local(name: String, parent_id: RemoteId, is_directory: bool) -> Self {
        Self {
            id: RemoteId::new_local(),
            name,
            size: 0,
            mtime: Utc::now(),
            parent_id: Some(parent_id),
            hash: None,
            etag: None,
            is_directory,
            node_id: 0,
            children: is_directory.then(Vec::new),
            data: is_directory.then_some(Vec::new()).or(Some(Vec::new())),
            has_changes: false,
            subdir_count: 0,
            mode: MODE_DERIVE,
        }
    }

    /// Builds an inode from a freshly fetched or delta-supplied drive item.
    pub fn from_drive_item(item: super::drive_item::DriveItem) -> Self {
        Self {
            id: item.id,
            name: item.name,
            size: item.size,
            mtime: item.last_modified,
            parent_id: item.parent.and_then(|p| p.id),
            hash: item.file.and_then(|f| f.hash().cloned()),
            etag: item.etag,
            is_directory: item.folder.is_some(),
            node_id: 0,
            children: None,
            data: None,
            has_changes: false,
            subdir_count: 0,
            mode: MODE_DERIVE,
        }
    }

    /// Whether this inode has never been uploaded (§3 invariant 5).
    pub fn is_local_only(&self) -> bool {
        self.id.is_local()
    }

    /// Case-folded name, used as the child-map key (§6 "Case-sensitivity").
    pub fn folded_name(&self) -> String {
        self.name.to_lowercase()
    }

    /// Validates invariant 6: `has_changes` implies `data.is_some()`.
    pub fn check_invariants(&self) -> Result<(), DomainError> {
        if self.has_changes && self.data.is_none() {
            return Err(DomainError::ValidationFailed(
                "has_changes is set but no content is resident".to_string(),
            ));
        }
        Ok(())
    }

    /// POSIX `nlink`: files report 1, directories report `2 + subdir_count`
    /// (§4.6 `getattr`).
    pub fn nlink(&self) -> u32 {
        if self.is_directory {
            2 + self.subdir_count
        } else {
            1
        }
    }
}
