//! FUSE filesystem implementation.
//!
//! Implements `fuser::Filesystem`, bridging the kernel's synchronous
//! callbacks onto the async `InodeGraph`/`RemoteClient`/`Store` ports
//! via a stored `tokio::runtime::Handle` and `.block_on(...)` (§4.6).

use std::ffi::OsStr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use fuser::{
    FileAttr, FileType, Filesystem, KernelConfig, ReplyAttr, ReplyCreate, ReplyData,
    ReplyDirectory, ReplyEmpty, ReplyEntry, ReplyOpen, ReplyStatfs, ReplyWrite, Request,
    TimeOrNow,
};
use onedrivefs_core::domain::{FileHash, HashKind, Inode, RemoteId, RemotePath, UploadSession};
use onedrivefs_core::ports::{RemoteClient, Store};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::FuseError;
use crate::graph::{InodeGraph, ROOT_NODE_ID, ROOT_REMOTE_ID};
use crate::write_serializer::WriteSerializerHandle;

/// TTL for FUSE attribute caching.
const TTL: Duration = Duration::from_secs(1);

/// Tells the kernel cached data from a prior open is still valid.
const FOPEN_KEEP_CACHE: u32 = 1 << 1;

/// POSIX `NAME_MAX`.
const NAME_MAX: usize = 255;

/// Shared online/offline state (§4.6 "Online/Offline state machine").
/// The delta loop in `onedrivefs-sync` flips this; the filesystem only
/// reads it to decide whether to reject writes with `EROFS`.
#[derive(Clone)]
pub struct OnlineFlag(Arc<AtomicBool>);

impl OnlineFlag {
    pub fn new(online: bool) -> Self {
        Self(Arc::new(AtomicBool::new(online)))
    }

    pub fn is_online(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn set(&self, online: bool) {
        self.0.store(online, Ordering::SeqCst);
    }
}

/// A `readdir` snapshot taken at `opendir` time, so a concurrent mutation
/// doesn't shift entries out from under a kernel that is paging through
/// a listing via repeated `offset`-based calls.
#[derive(Clone)]
struct DirEntrySnapshot {
    node_id: u64,
    name: String,
    kind: FileType,
}

/// Main FUSE filesystem implementation.
///
/// Everything needed to answer a kernel request lives behind one of these
/// fields:
/// - [`InodeGraph`] resolves node IDs to inodes and back (§4.1).
/// - [`RemoteClient`] is only consulted for directory population on a
///   cache miss (§4.2); reads and writes never touch it directly.
/// - [`WriteSerializerHandle`] funnels every store mutation through one
///   task (§4.3 "Writes are batched").
/// - `upload_tx` hands off newly-dirty content to the upload manager in
///   `onedrivefs-sync` without this crate depending on that one.
pub struct OneDriveFs {
    rt_handle: Handle,
    graph: Arc<InodeGraph>,
    remote: Arc<dyn RemoteClient>,
    store: Arc<dyn Store>,
    write_handle: WriteSerializerHandle,
    upload_tx: mpsc::UnboundedSender<RemoteId>,
    online: OnlineFlag,
    dir_handles: DashMap<u64, Vec<DirEntrySnapshot>>,
    next_fh: AtomicU64,
    root_id: RemoteId,
}

impl OneDriveFs {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        rt_handle: Handle,
        graph: Arc<InodeGraph>,
        remote: Arc<dyn RemoteClient>,
        store: Arc<dyn Store>,
        write_handle: WriteSerializerHandle,
        upload_tx: mpsc::UnboundedSender<RemoteId>,
        online: OnlineFlag,
    ) -> Self {
        Self {
            rt_handle,
            graph,
            remote,
            store,
            write_handle,
            upload_tx,
            online,
            dir_handles: DashMap::new(),
            next_fh: AtomicU64::new(1),
            root_id: RemoteId::new(ROOT_REMOTE_ID.to_string()).expect("sentinel id is non-empty"),
        }
    }

    fn alloc_fh(&self) -> u64 {
        self.next_fh.fetch_add(1, Ordering::SeqCst)
    }

    fn online(&self) -> bool {
        self.online.is_online()
    }

    fn validate_name(name: &OsStr) -> Result<String, FuseError> {
        let name = name
            .to_str()
            .ok_or_else(|| FuseError::InvalidArgument("name is not valid UTF-8".to_string()))?;
        if name.len() > NAME_MAX {
            return Err(FuseError::NameTooLong(name.to_string()));
        }
        Ok(name.to_string())
    }

    fn require_online(&self) -> Result<(), FuseError> {
        if self.online() {
            Ok(())
        } else {
            Err(FuseError::ReadOnly(
                "no successful delta poll since mount or last disconnect".to_string(),
            ))
        }
    }

    async fn node_id_of(&self, ino: u64) -> Result<RemoteId, FuseError> {
        if ino == ROOT_NODE_ID {
            return Ok(self.root_id.clone());
        }
        self.graph
            .map(ino)
            .ok_or_else(|| FuseError::NotFound(format!("no remote id for inode {ino}")))
    }

    async fn do_lookup(&self, parent: u64, name: &str) -> Result<Inode, FuseError> {
        let parent_id = self.node_id_of(parent).await?;
        let child = self
            .graph
            .get_child(self.remote.as_ref(), &parent_id, name, self.online())
            .await?
            .ok_or_else(|| FuseError::NotFound(name.to_string()))?;
        Ok(child.read().unwrap().clone())
    }

    /// Resolves the node id `readdir` should report for `..`: the parent's
    /// `node_id`, or the root itself if `ino` has no parent.
    async fn parent_node_id(&self, ino: u64) -> Result<u64, FuseError> {
        if ino == ROOT_NODE_ID {
            return Ok(ROOT_NODE_ID);
        }
        let id = self.node_id_of(ino).await?;
        let entry = self
            .graph
            .get(&id)
            .await?
            .ok_or_else(|| FuseError::NotFound(format!("inode {ino}")))?;
        let parent_id = entry.read().unwrap().parent_id.clone();
        match parent_id {
            Some(parent_id) => {
                let parent = self
                    .graph
                    .get(&parent_id)
                    .await?
                    .ok_or_else(|| FuseError::NotFound(format!("parent of inode {ino}")))?;
                Ok(parent.read().unwrap().node_id)
            }
            None => Ok(ROOT_NODE_ID),
        }
    }

    async fn do_getattr(&self, ino: u64) -> Result<Inode, FuseError> {
        let id = self.node_id_of(ino).await?;
        let entry = self
            .graph
            .get(&id)
            .await?
            .ok_or_else(|| FuseError::NotFound(format!("inode {ino}")))?;
        Ok(entry.read().unwrap().clone())
    }

    async fn do_setattr(
        &self,
        ino: u64,
        size: Option<u64>,
        mode: Option<u32>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
    ) -> Result<Inode, FuseError> {
        let id = self.node_id_of(ino).await?;
        let entry = self
            .graph
            .get(&id)
            .await?
            .ok_or_else(|| FuseError::NotFound(format!("inode {ino}")))?;

        let changed_size = size.is_some();
        let snapshot = {
            let mut inode = entry.write().unwrap();
            if let Some(size) = size {
                if inode.is_directory {
                    return Err(FuseError::IsADirectory(inode.name.clone()));
                }
                let data = inode.data.get_or_insert_with(Vec::new);
                data.resize(size as usize, 0);
                inode.size = size;
                inode.has_changes = true;
            }
            if let Some(mode) = mode {
                inode.mode = mode;
            }
            if let Some(time) = mtime {
                inode.mtime = to_chrono(time);
            } else if changed_size {
                inode.mtime = chrono::Utc::now();
            }
            // atime is not tracked on Inode; accepted and ignored, matching
            // the remote API's own lack of an atime facet.
            let _ = atime;
            inode.clone()
        };

        self.write_handle.save_inode(snapshot.clone()).await?;
        if changed_size {
            let _ = self.upload_tx.send(snapshot.id.clone());
        }
        Ok(snapshot)
    }

    async fn do_opendir(&self, ino: u64) -> Result<u64, FuseError> {
        let id = self.node_id_of(ino).await?;
        let entry = self
            .graph
            .get(&id)
            .await?
            .ok_or_else(|| FuseError::NotFound(format!("inode {ino}")))?;
        if !entry.read().unwrap().is_directory {
            return Err(FuseError::NotADirectory(format!("inode {ino}")));
        }

        self.graph
            .ensure_children(self.remote.as_ref(), &id, self.online())
            .await?;
        let child_ids = entry.read().unwrap().children.clone().unwrap_or_default();

        let mut snapshot = Vec::with_capacity(child_ids.len());
        for child_id in child_ids {
            if let Some(child) = self.graph.get(&child_id).await? {
                let child = child.read().unwrap();
                snapshot.push(DirEntrySnapshot {
                    node_id: child.node_id,
                    name: child.name.clone(),
                    kind: kind_of(&child),
                });
            }
        }

        let fh = self.alloc_fh();
        self.dir_handles.insert(fh, snapshot);
        Ok(fh)
    }

    /// Loads content into `entry.data` on a cache miss (disk cache, then
    /// remote), used by `open` and by `read`/`write`'s auto-reopen when a
    /// prior `flush` evicted resident content (§4.6).
    async fn ensure_resident(
        &self,
        id: &RemoteId,
        entry: &Arc<std::sync::RwLock<Inode>>,
    ) -> Result<(), FuseError> {
        let needs_fetch = {
            let inode = entry.read().unwrap();
            if inode.is_directory {
                return Err(FuseError::IsADirectory(inode.name.clone()));
            }
            inode.data.is_none()
        };
        if !needs_fetch {
            return Ok(());
        }

        let cached = self.store.get_content(id).await?;
        match cached {
            Some(data) => {
                verify_hash(entry, &data)?;
                entry.write().unwrap().data = Some(data);
            }
            None => {
                if !self.online() {
                    return Err(FuseError::IoError(
                        "content not cached and filesystem is offline".to_string(),
                    ));
                }
                let data = self.remote.get_content(id).await?;
                verify_hash(entry, &data)?;
                self.write_handle
                    .save_content(id.clone(), data.clone())
                    .await?;
                entry.write().unwrap().data = Some(data);
            }
        }
        Ok(())
    }

    async fn do_open(&self, ino: u64, flags: i32) -> Result<(u64, u32), FuseError> {
        let id = self.node_id_of(ino).await?;
        let entry = self
            .graph
            .get(&id)
            .await?
            .ok_or_else(|| FuseError::NotFound(format!("inode {ino}")))?;
        match self.ensure_resident(&id, &entry).await {
            Ok(()) => {}
            Err(FuseError::IoError(msg)) if !self.online() && wants_write(flags) => {
                return Err(FuseError::ReadOnly(msg));
            }
            Err(e) => return Err(e),
        }
        Ok((self.alloc_fh(), FOPEN_KEEP_CACHE))
    }

    async fn do_read(&self, ino: u64, offset: u64, size: u32) -> Result<Vec<u8>, FuseError> {
        let id = self.node_id_of(ino).await?;
        let entry = self
            .graph
            .get(&id)
            .await?
            .ok_or_else(|| FuseError::NotFound(format!("inode {ino}")))?;
        self.ensure_resident(&id, &entry).await?;
        let inode = entry.read().unwrap();
        let data = inode
            .data
            .as_ref()
            .ok_or_else(|| FuseError::IoError(format!("no resident content for inode {ino}")))?;

        let start = offset as usize;
        if start > data.len() {
            return Err(FuseError::InvalidArgument(format!(
                "read offset {start} past end of inode {ino} (size {})",
                data.len()
            )));
        }
        let end = start.saturating_add(size as usize).min(data.len());
        Ok(data[start..end].to_vec())
    }

    async fn do_write(&self, ino: u64, offset: u64, data: &[u8]) -> Result<u32, FuseError> {
        let id = self.node_id_of(ino).await?;
        let entry = self
            .graph
            .get(&id)
            .await?
            .ok_or_else(|| FuseError::NotFound(format!("inode {ino}")))?;
        self.ensure_resident(&id, &entry).await?;

        let snapshot = {
            let mut inode = entry.write().unwrap();
            let buf = inode.data.get_or_insert_with(Vec::new);
            let end = offset as usize + data.len();
            if buf.len() < end {
                buf.resize(end, 0);
            }
            buf[offset as usize..end].copy_from_slice(data);
            inode.size = buf.len() as u64;
            inode.has_changes = true;
            inode.mtime = chrono::Utc::now();
            inode.clone()
        };

        self.write_handle.save_inode(snapshot).await?;
        Ok(data.len() as u32)
    }

    /// Computes the on-disk content hash, persists an upload session
    /// snapshot, and clears the dirty flag (§4.4 "Queue persistence",
    /// §4.6 `fsync`). The actual network upload is the sync crate's job;
    /// this only hands the snapshot off via `upload_tx`.
    async fn do_fsync(&self, ino: u64) -> Result<(), FuseError> {
        let id = self.node_id_of(ino).await?;
        let entry = self
            .graph
            .get(&id)
            .await?
            .ok_or_else(|| FuseError::NotFound(format!("inode {ino}")))?;

        let (data, dirty, parent_id, name, node_id, mtime) = {
            let inode = entry.read().unwrap();
            (
                inode.data.clone(),
                inode.has_changes,
                inode.parent_id.clone(),
                inode.name.clone(),
                inode.node_id,
                inode.mtime,
            )
        };

        if !dirty {
            return Ok(());
        }
        let data = data.unwrap_or_default();
        let parent_id = parent_id.ok_or_else(|| {
            FuseError::InvalidArgument("root cannot be written to".to_string())
        })?;

        let hash = sha1_hex_upper(&data);
        let hash = FileHash::sha1(hash).map_err(|e| FuseError::IoError(e.to_string()))?;

        self.write_handle.save_content(id.clone(), data.clone()).await?;

        let session =
            UploadSession::new(id.clone(), parent_id, name, data, hash.clone(), mtime, node_id);
        self.write_handle.save_upload_session(session).await?;

        {
            let mut inode = entry.write().unwrap();
            inode.has_changes = false;
            inode.hash = Some(hash);
        }
        self.write_handle.save_inode(entry.read().unwrap().clone()).await?;

        let _ = self.upload_tx.send(id);
        Ok(())
    }

    /// Runs `fsync`, then persists resident content to the disk cache and
    /// evicts it from RAM (§4.6 `flush`): the kernel may not `read` or
    /// `write` this inode again for a while, but `getattr`/`lookup` still
    /// need its metadata, so only the content buffer is dropped.
    async fn do_flush(&self, ino: u64) -> Result<(), FuseError> {
        self.do_fsync(ino).await?;
        let id = self.node_id_of(ino).await?;
        let entry = self
            .graph
            .get(&id)
            .await?
            .ok_or_else(|| FuseError::NotFound(format!("inode {ino}")))?;
        let data = entry.read().unwrap().data.clone();
        if let Some(data) = data {
            self.write_handle.save_content(id, data).await?;
            entry.write().unwrap().data = None;
        }
        Ok(())
    }

    async fn do_create(
        &self,
        parent: u64,
        name: &str,
        mode: u32,
    ) -> Result<Inode, FuseError> {
        let parent_id = self.node_id_of(parent).await?;
        if self
            .graph
            .get_child(self.remote.as_ref(), &parent_id, name, self.online())
            .await?
            .is_some()
        {
            return Err(FuseError::AlreadyExists(name.to_string()));
        }

        let mut inode = Inode::new_local(name.to_string(), parent_id, false);
        inode.mode = mode;
        let entry = self.graph.insert(inode).await?;
        Ok(entry.read().unwrap().clone())
    }

    /// Unlike `create` (content uploads asynchronously via `fsync`),
    /// directory creation round-trips the remote immediately: a folder
    /// carries no content payload to defer, and later creates nested
    /// under it need a resolvable parent id right away.
    async fn do_mkdir(&self, parent: u64, name: &str, mode: u32) -> Result<Inode, FuseError> {
        let parent_id = self.node_id_of(parent).await?;
        if self
            .graph
            .get_child(self.remote.as_ref(), &parent_id, name, true)
            .await?
            .is_some()
        {
            return Err(FuseError::AlreadyExists(name.to_string()));
        }

        let item = self.remote.mkdir(&parent_id, name).await?;
        let remote_id = item.id.clone();
        let entry = self.graph.upsert_remote(item).await?;
        {
            let mut inode = entry.write().unwrap();
            inode.mode = mode;
        }
        self.write_handle.save_inode(entry.read().unwrap().clone()).await?;
        self.graph.attach_child(&parent_id, &remote_id, true).await?;
        Ok(entry.read().unwrap().clone())
    }

    async fn do_unlink(&self, parent: u64, name: &str) -> Result<(), FuseError> {
        let parent_id = self.node_id_of(parent).await?;
        let child = self
            .graph
            .get_child(self.remote.as_ref(), &parent_id, name, self.online())
            .await?
            .ok_or_else(|| FuseError::NotFound(name.to_string()))?;
        let (id, is_dir) = {
            let inode = child.read().unwrap();
            (inode.id.clone(), inode.is_directory)
        };
        if is_dir {
            return Err(FuseError::IsADirectory(name.to_string()));
        }

        if self.online() && !id.is_local() {
            self.remote.remove(&id).await?;
        }
        self.graph.delete(&id).await?;
        self.write_handle.delete_inode(id.clone()).await?;
        self.write_handle.delete_content(id).await?;
        Ok(())
    }

    async fn do_rmdir(&self, parent: u64, name: &str) -> Result<(), FuseError> {
        let parent_id = self.node_id_of(parent).await?;
        let child = self
            .graph
            .get_child(self.remote.as_ref(), &parent_id, name, self.online())
            .await?
            .ok_or_else(|| FuseError::NotFound(name.to_string()))?;
        let (id, is_dir, has_children) = {
            let inode = child.read().unwrap();
            (
                inode.id.clone(),
                inode.is_directory,
                inode.children.as_ref().is_some_and(|c| !c.is_empty()),
            )
        };
        if !is_dir {
            return Err(FuseError::NotADirectory(name.to_string()));
        }
        if has_children {
            return Err(FuseError::NotEmpty(name.to_string()));
        }

        if self.online() && !id.is_local() {
            self.remote.remove(&id).await?;
        }
        self.graph.delete(&id).await?;
        self.write_handle.delete_inode(id).await?;
        Ok(())
    }

    /// Reconstructs the remote path of an inode by walking `parent_id`
    /// up to the root. Needed wherever a path-addressed remote call (a
    /// small upload of a not-yet-promoted local-ID inode) has to name a
    /// parent that itself may not have a resolvable ID yet.
    fn remote_path_of<'a>(
        &'a self,
        id: &'a RemoteId,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<RemotePath, FuseError>> + 'a>>
    {
        Box::pin(async move {
            if *id == self.root_id {
                return Ok(RemotePath::root());
            }
            let entry = self
                .graph
                .get(id)
                .await?
                .ok_or_else(|| FuseError::NotFound(format!("remote path lookup: {id}")))?;
            let (parent_id, name) = {
                let inode = entry.read().unwrap();
                (inode.parent_id.clone(), inode.name.clone())
            };
            let parent_id = parent_id.ok_or_else(|| {
                FuseError::InvalidArgument(format!("inode {id} has no parent"))
            })?;
            let parent_path = self.remote_path_of(&parent_id).await?;
            parent_path
                .join(&name)
                .map_err(|e| FuseError::InvalidArgument(e.to_string()))
        })
    }

    /// Promotes a still-local-ID inode to a real remote ID by uploading
    /// its resident content (zero bytes if none yet). `rename` requires
    /// every renamed item to already have a remote ID to address the
    /// move to (§4.6 "ensure the source has a remote ID").
    async fn promote_local(&self, entry: &Arc<std::sync::RwLock<Inode>>) -> Result<RemoteId, FuseError> {
        let (old_id, parent_id, name, data) = {
            let inode = entry.read().unwrap();
            (
                inode.id.clone(),
                inode.parent_id.clone(),
                inode.name.clone(),
                inode.data.clone().unwrap_or_default(),
            )
        };
        let parent_id = parent_id
            .ok_or_else(|| FuseError::InvalidArgument("root cannot be renamed".to_string()))?;
        let parent_path = self.remote_path_of(&parent_id).await?;
        let result = self.remote.put_small(&parent_path, &name, &data).await?;
        let new_id = result.item.id.clone();
        self.graph.move_id(&old_id, &new_id).await?;
        self.write_handle.move_content(old_id, new_id.clone()).await?;
        Ok(new_id)
    }

    async fn do_rename(
        &self,
        parent: u64,
        name: &str,
        new_parent: u64,
        new_name: &str,
    ) -> Result<(), FuseError> {
        let parent_id = self.node_id_of(parent).await?;
        let new_parent_id = self.node_id_of(new_parent).await?;

        let child = self
            .graph
            .get_child(self.remote.as_ref(), &parent_id, name, self.online())
            .await?
            .ok_or_else(|| FuseError::NotFound(name.to_string()))?;
        let id = child.read().unwrap().id.clone();

        if let Some(existing) = self
            .graph
            .get_child(self.remote.as_ref(), &new_parent_id, new_name, self.online())
            .await?
        {
            let existing_id = existing.read().unwrap().id.clone();
            if existing_id != id {
                self.graph.delete(&existing_id).await?;
                self.write_handle.delete_inode(existing_id).await?;
            }
        }

        let id = if id.is_local() {
            self.promote_local(&child).await?
        } else {
            id
        };
        self.remote.rename(&id, &new_parent_id, new_name).await?;
        self.graph.move_path(&id, &new_parent_id, new_name).await?;
        let moved = self
            .graph
            .get(&id)
            .await?
            .ok_or_else(|| FuseError::NotFound(format!("inode vanished after move: {id}")))?;
        self.write_handle.save_inode(moved.read().unwrap().clone()).await?;
        Ok(())
    }

    async fn do_statfs(&self) -> Result<(u64, u64, u64), FuseError> {
        if self.online() {
            if let Ok(quota) = self.remote.get_quota().await {
                let used_blocks = quota.used / 4096;
                let total_blocks = quota.total / 4096;
                let free_blocks = total_blocks.saturating_sub(used_blocks);
                return Ok((total_blocks, free_blocks, free_blocks));
            }
        }
        Ok((0, 0, 0))
    }
}

fn to_chrono(time: TimeOrNow) -> chrono::DateTime<chrono::Utc> {
    match time {
        TimeOrNow::Now => chrono::Utc::now(),
        TimeOrNow::SpecificTime(t) => {
            let secs = t.duration_since(UNIX_EPOCH).unwrap_or_default();
            chrono::DateTime::from_timestamp(secs.as_secs() as i64, secs.subsec_nanos())
                .unwrap_or_else(chrono::Utc::now)
        }
    }
}

fn wants_write(flags: i32) -> bool {
    let access_mode = flags & libc::O_ACCMODE;
    access_mode == libc::O_WRONLY || access_mode == libc::O_RDWR
}

fn kind_of(inode: &Inode) -> FileType {
    if inode.is_directory {
        FileType::Directory
    } else {
        FileType::RegularFile
    }
}

fn perm_of(inode: &Inode) -> u16 {
    if inode.mode != onedrivefs_core::domain::MODE_DERIVE {
        return (inode.mode & 0o7777) as u16;
    }
    if inode.is_directory {
        0o755
    } else {
        0o644
    }
}

fn to_file_attr(inode: &Inode) -> FileAttr {
    let mtime = SystemTime::UNIX_EPOCH + Duration::from_secs(inode.mtime.timestamp().max(0) as u64);
    // Directories report a nominal 4096-byte size; OneDrive folders carry
    // no meaningful size facet of their own (§4.6 getattr).
    let size = if inode.is_directory { 4096 } else { inode.size };
    FileAttr {
        ino: inode.node_id,
        size,
        blocks: size.div_ceil(512),
        atime: mtime,
        mtime,
        ctime: mtime,
        crtime: mtime,
        kind: kind_of(inode),
        perm: perm_of(inode),
        nlink: inode.nlink(),
        uid: unsafe { libc::getuid() },
        gid: unsafe { libc::getgid() },
        rdev: 0,
        blksize: 4096,
        flags: 0,
    }
}

fn sha1_hex_upper(data: &[u8]) -> String {
    use sha1::{Digest, Sha1};
    let digest = Sha1::digest(data);
    digest.iter().map(|b| format!("{b:02X}")).collect()
}

/// Validates resident content against the inode's last known hash
/// (§4.6 `open` "validate with the drive-type-appropriate hash"). Only
/// SHA-1 (personal drives) can be recomputed locally with a crate this
/// corpus actually grounds; quickXorHash (business/sharepoint) has no
/// groundable implementation anywhere in the retrieval pack, so a
/// QuickXor-kind hash is accepted unconditionally and the disk cache is
/// trusted instead (see DESIGN.md Open Question decisions).
fn verify_hash(entry: &std::sync::Arc<std::sync::RwLock<Inode>>, data: &[u8]) -> Result<(), FuseError> {
    let expected = entry.read().unwrap().hash.clone();
    let Some(expected) = expected else {
        return Ok(());
    };
    if expected.kind() != HashKind::Sha1 {
        return Ok(());
    }
    let actual = sha1_hex_upper(data);
    if actual != expected.as_str() {
        return Err(FuseError::IoError(format!(
            "content hash mismatch: expected {}, got {actual}",
            expected.as_str()
        )));
    }
    Ok(())
}

impl Filesystem for OneDriveFs {
    fn init(&mut self, _req: &Request<'_>, config: &mut KernelConfig) -> Result<(), std::ffi::c_int> {
        tracing::info!("initializing onedrivefs");

        const FUSE_EXPORT_SUPPORT: u64 = 1 << 4;
        if let Err(unsupported) = config.add_capabilities(FUSE_EXPORT_SUPPORT) {
            debug!(unsupported_bits = unsupported, "FUSE_EXPORT_SUPPORT unavailable");
        }

        if let Err(e) = self.rt_handle.block_on(self.graph.load_all()) {
            tracing::error!(error = %e, "failed to load inode graph from store");
            return Err(libc::EIO);
        }

        let root_id = self.root_id.clone();
        if let Err(e) = self
            .rt_handle
            .block_on(self.graph.ensure_root(self.remote.as_ref(), &root_id))
        {
            warn!(error = %e, "failed to fetch drive root, starting offline");
        }

        Ok(())
    }

    fn destroy(&mut self) {
        tracing::info!("onedrivefs shutting down");
    }

    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let name = match Self::validate_name(name) {
            Ok(n) => n,
            Err(e) => {
                reply.error(e.into());
                return;
            }
        };
        match self.rt_handle.block_on(self.do_lookup(parent, &name)) {
            Ok(inode) => reply.entry(&TTL, &to_file_attr(&inode), 0),
            Err(e) => reply.error(e.into()),
        }
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, _fh: Option<u64>, reply: ReplyAttr) {
        match self.rt_handle.block_on(self.do_getattr(ino)) {
            Ok(inode) => reply.attr(&TTL, &to_file_attr(&inode)),
            Err(e) => reply.error(e.into()),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn setattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        mode: Option<u32>,
        _uid: Option<u32>,
        _gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        _fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        // Truncation is a write; mode-only changes are allowed offline
        // since they never touch content.
        if size.is_some() {
            if let Err(e) = self.require_online() {
                reply.error(e.into());
                return;
            }
        }
        match self
            .rt_handle
            .block_on(self.do_setattr(ino, size, mode, atime, mtime))
        {
            Ok(inode) => reply.attr(&TTL, &to_file_attr(&inode)),
            Err(e) => reply.error(e.into()),
        }
    }

    fn opendir(&mut self, _req: &Request<'_>, ino: u64, _flags: i32, reply: ReplyOpen) {
        match self.rt_handle.block_on(self.do_opendir(ino)) {
            Ok(fh) => reply.opened(fh, FOPEN_KEEP_CACHE),
            Err(e) => reply.error(e.into()),
        }
    }

    fn releasedir(&mut self, _req: &Request<'_>, _ino: u64, fh: u64, _flags: i32, reply: ReplyEmpty) {
        self.dir_handles.remove(&fh);
        reply.ok();
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        let Some(entries) = self.dir_handles.get(&fh).map(|e| e.clone()) else {
            reply.error(libc::EBADF);
            return;
        };

        let parent_ino = match self.rt_handle.block_on(self.parent_node_id(ino)) {
            Ok(parent_ino) => parent_ino,
            Err(e) => {
                reply.error(e.into());
                return;
            }
        };

        let mut current_offset: i64 = 0;
        let mut emit = |ino: u64, kind: FileType, name: &str| -> bool {
            current_offset += 1;
            if offset < current_offset {
                reply.add(ino, current_offset, kind, OsStr::new(name))
            } else {
                false
            }
        };

        if emit(ino, FileType::Directory, ".") {
            reply.ok();
            return;
        }
        if emit(parent_ino, FileType::Directory, "..") {
            reply.ok();
            return;
        }
        for entry in entries {
            if emit(entry.node_id, entry.kind, &entry.name) {
                reply.ok();
                return;
            }
        }
        reply.ok();
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        match self.rt_handle.block_on(self.do_open(ino, flags)) {
            Ok((fh, open_flags)) => reply.opened(fh, open_flags),
            Err(e) => reply.error(e.into()),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn read(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        match self.rt_handle.block_on(self.do_read(ino, offset as u64, size)) {
            Ok(data) => reply.data(&data),
            Err(e) => reply.error(e.into()),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn write(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        if let Err(e) = self.require_online() {
            reply.error(e.into());
            return;
        }
        match self.rt_handle.block_on(self.do_write(ino, offset as u64, data)) {
            Ok(written) => reply.written(written),
            Err(e) => reply.error(e.into()),
        }
    }

    fn release(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        _fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        reply.ok();
    }

    fn flush(&mut self, _req: &Request<'_>, ino: u64, fh: u64, _lock_owner: u64, reply: ReplyEmpty) {
        debug!(ino, fh, "flush: fsyncing and evicting resident content");
        match self.rt_handle.block_on(self.do_flush(ino)) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.into()),
        }
    }

    fn fsync(&mut self, _req: &Request<'_>, ino: u64, _fh: u64, _datasync: bool, reply: ReplyEmpty) {
        match self.rt_handle.block_on(self.do_fsync(ino)) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.into()),
        }
    }

    fn mkdir(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        reply: ReplyEntry,
    ) {
        if let Err(e) = self.require_online() {
            reply.error(e.into());
            return;
        }
        let name = match Self::validate_name(name) {
            Ok(n) => n,
            Err(e) => {
                reply.error(e.into());
                return;
            }
        };
        let perm = (mode & !umask) | 0o111;
        match self.rt_handle.block_on(self.do_mkdir(parent, &name, perm)) {
            Ok(inode) => reply.entry(&TTL, &to_file_attr(&inode), 0),
            Err(e) => reply.error(e.into()),
        }
    }

    fn rmdir(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        if let Err(e) = self.require_online() {
            reply.error(e.into());
            return;
        }
        let name = match Self::validate_name(name) {
            Ok(n) => n,
            Err(e) => {
                reply.error(e.into());
                return;
            }
        };
        match self.rt_handle.block_on(self.do_rmdir(parent, &name)) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.into()),
        }
    }

    fn rename(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        _flags: u32,
        reply: ReplyEmpty,
    ) {
        if let Err(e) = self.require_online() {
            reply.error(e.into());
            return;
        }
        let name = match Self::validate_name(name) {
            Ok(n) => n,
            Err(e) => {
                reply.error(e.into());
                return;
            }
        };
        let newname = match Self::validate_name(newname) {
            Ok(n) => n,
            Err(e) => {
                reply.error(e.into());
                return;
            }
        };
        match self
            .rt_handle
            .block_on(self.do_rename(parent, &name, newparent, &newname))
        {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.into()),
        }
    }

    fn create(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        flags: i32,
        reply: ReplyCreate,
    ) {
        if let Err(e) = self.require_online() {
            reply.error(e.into());
            return;
        }
        let name = match Self::validate_name(name) {
            Ok(n) => n,
            Err(e) => {
                reply.error(e.into());
                return;
            }
        };
        let perm = mode & !umask;
        match self.rt_handle.block_on(self.do_create(parent, &name, perm)) {
            Ok(inode) => {
                let fh = self.alloc_fh();
                reply.created(&TTL, &to_file_attr(&inode), 0, fh, flags as u32)
            }
            Err(e) => reply.error(e.into()),
        }
    }

    fn unlink(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        if let Err(e) = self.require_online() {
            reply.error(e.into());
            return;
        }
        let name = match Self::validate_name(name) {
            Ok(n) => n,
            Err(e) => {
                reply.error(e.into());
                return;
            }
        };
        match self.rt_handle.block_on(self.do_unlink(parent, &name)) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.into()),
        }
    }

    fn statfs(&mut self, _req: &Request<'_>, _ino: u64, reply: ReplyStatfs) {
        const BLOCK_SIZE: u32 = 4096;
        let (total_blocks, free_blocks, avail_blocks) =
            self.rt_handle.block_on(self.do_statfs()).unwrap_or((0, 0, 0));
        reply.statfs(
            total_blocks,
            free_blocks,
            avail_blocks,
            0,
            u64::MAX / 2,
            BLOCK_SIZE,
            NAME_MAX as u32,
            BLOCK_SIZE,
        );
    }
}
