//! Delta reconciliation loop (§4.5).
//!
//! A single background worker that polls the change feed at a configured
//! interval, folds the accumulated changes into the inode graph, and
//! flips the shared [`OnlineFlag`] the VFS adapter gates writes on.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use onedrivefs_core::domain::{DeltaToken, DriveItem, RemoteId};
use onedrivefs_core::ports::{RemoteClient, Store};
use onedrivefs_fuse::{InodeGraph, OnlineFlag, WriteSerializerHandle};
use tracing::{info, warn};

use crate::retry::with_retry;

/// Default poll interval while online (§4.5).
const DEFAULT_INTERVAL_ONLINE: Duration = Duration::from_secs(30);
/// Default retry interval while a poll has failed (§4.5).
const DEFAULT_INTERVAL_OFFLINE: Duration = Duration::from_secs(2);

pub struct DeltaLoop {
    remote: Arc<dyn RemoteClient>,
    store: Arc<dyn Store>,
    graph: Arc<InodeGraph>,
    write_handle: WriteSerializerHandle,
    online: OnlineFlag,
    interval_online: Duration,
    interval_offline: Duration,
}

impl DeltaLoop {
    pub fn new(
        remote: Arc<dyn RemoteClient>,
        store: Arc<dyn Store>,
        graph: Arc<InodeGraph>,
        write_handle: WriteSerializerHandle,
        online: OnlineFlag,
    ) -> Self {
        Self {
            remote,
            store,
            graph,
            write_handle,
            online,
            interval_online: DEFAULT_INTERVAL_ONLINE,
            interval_offline: DEFAULT_INTERVAL_OFFLINE,
        }
    }

    pub fn with_intervals(mut self, online: Duration, offline: Duration) -> Self {
        self.interval_online = online;
        self.interval_offline = offline;
        self
    }

    /// Runs forever, alternating between the online and offline-retry
    /// interval depending on the last poll's outcome.
    pub async fn run(self) {
        info!("delta loop starting");
        loop {
            match self.tick().await {
                Ok(()) => {
                    self.online.set(true);
                    tokio::time::sleep(self.interval_online).await;
                }
                Err(e) => {
                    self.online.set(false);
                    warn!(error = %e, "delta poll failed, filesystem is now offline");
                    tokio::time::sleep(self.interval_offline).await;
                }
            }
        }
    }

    /// One reconciliation pass: pull the feed to its `delta_link`,
    /// dedupe by ID, apply each change, then apply deferred non-empty
    /// directory deletions, then persist the new cursor.
    async fn tick(&self) -> anyhow::Result<()> {
        let cursor = self.store.get_delta_cursor().await?;
        let mut page = with_retry("delta", || self.remote.delta(cursor.as_ref())).await?;

        let mut changes: HashMap<RemoteId, DriveItem> = HashMap::new();
        let mut new_cursor: Option<DeltaToken> = None;
        loop {
            for item in page.items.drain(..) {
                // Last wins: a later page's entry for the same ID
                // supersedes an earlier one (§4.5).
                changes.insert(item.id.clone(), item);
            }
            if let Some(link) = page.delta_link.take() {
                new_cursor = Some(DeltaToken::new(link)?);
            }
            match page.next_link.take() {
                Some(next) => {
                    page = with_retry("delta_page", || self.remote.delta_page(&next)).await?
                }
                None => break,
            }
        }

        let mut deferred = Vec::new();
        for item in changes.into_values() {
            if let Err(e) = self.apply_item(item, &mut deferred).await {
                warn!(error = %e, "failed to apply a delta item, skipping it");
            }
        }
        for id in deferred {
            // Ignoring errors here matches the API's own contract: a
            // directory that still isn't empty by the second pass is left
            // for the next tick (§4.5).
            let _ = self.graph.delete(&id).await;
        }

        if let Some(cursor) = new_cursor {
            self.write_handle.save_delta_cursor(cursor).await?;
        }
        Ok(())
    }

    /// Classifies and applies a single delta item (§4.5 "Per-delta
    /// classification"). Items with no parent reference (the drive root
    /// itself) never reach here meaningfully and are skipped.
    async fn apply_item(
        &self,
        item: DriveItem,
        deferred: &mut Vec<RemoteId>,
    ) -> anyhow::Result<()> {
        let Some(parent_id) = item.parent_id().cloned() else {
            return Ok(());
        };
        if self.graph.get(&parent_id).await?.is_none() {
            // Parent isn't cached locally: irrelevant until something
            // fetches it on demand.
            return Ok(());
        }

        if item.is_deleted() {
            return self.apply_deletion(&item, deferred).await;
        }

        match self.graph.get(&item.id).await? {
            None => self.apply_new_item(item, &parent_id).await,
            Some(existing) => self.apply_update(item, &parent_id, &existing).await,
        }
    }

    async fn apply_deletion(
        &self,
        item: &DriveItem,
        deferred: &mut Vec<RemoteId>,
    ) -> anyhow::Result<()> {
        let Some(existing) = self.graph.get(&item.id).await? else {
            return Ok(());
        };
        let (is_dir, has_children) = {
            let inode = existing.read().unwrap();
            (
                inode.is_directory,
                inode.children.as_ref().map(|c| !c.is_empty()).unwrap_or(false),
            )
        };
        if is_dir && has_children {
            deferred.push(item.id.clone());
        } else {
            self.graph.delete(&item.id).await?;
        }
        Ok(())
    }

    async fn apply_new_item(&self, item: DriveItem, parent_id: &RemoteId) -> anyhow::Result<()> {
        if let Some(local_child) = self.graph.find_local_child(parent_id, &item.name).await? {
            let local_id = local_child.read().unwrap().id.clone();
            self.graph.move_id(&local_id, &item.id).await?;
            self.overwrite_metadata(&item.id, &item).await?;
            return Ok(());
        }

        let is_dir = item.is_directory();
        let id = item.id.clone();
        self.graph.upsert_remote(item).await?;
        self.graph.attach_child(parent_id, &id, is_dir).await?;
        Ok(())
    }

    async fn apply_update(
        &self,
        item: DriveItem,
        parent_id: &RemoteId,
        existing: &Arc<std::sync::RwLock<onedrivefs_core::domain::Inode>>,
    ) -> anyhow::Result<()> {
        let (cur_parent, cur_name, cur_mtime, cur_etag, cur_hash) = {
            let inode = existing.read().unwrap();
            (
                inode.parent_id.clone(),
                inode.name.clone(),
                inode.mtime,
                inode.etag.clone(),
                inode.hash.clone(),
            )
        };

        if cur_parent.as_ref() != Some(parent_id) || cur_name != item.name {
            self.graph.move_path(&item.id, parent_id, &item.name).await?;
        }

        let mtime_is_newer = item.last_modified > cur_mtime;
        let etag_differs = item.etag != cur_etag;
        if mtime_is_newer && etag_differs {
            let content_changed = item.is_directory() || item.hash() != cur_hash.as_ref();
            if content_changed {
                self.overwrite_metadata(&item.id, &item).await?;
            }
            // Hash unchanged: skip, so an application's lock-file mtime
            // churn doesn't evict resident content or bump the inode's
            // own mtime (§4.5).
        }
        Ok(())
    }

    async fn overwrite_metadata(&self, id: &RemoteId, item: &DriveItem) -> anyhow::Result<()> {
        let Some(entry) = self.graph.get(id).await? else {
            return Ok(());
        };
        let snapshot = {
            let mut inode = entry.write().unwrap();
            inode.size = item.size;
            inode.mtime = item.last_modified;
            inode.etag = item.etag.clone();
            inode.hash = item.hash().cloned();
            inode.data = None;
            inode.has_changes = false;
            inode.clone()
        };
        self.write_handle.save_inode(snapshot).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use onedrivefs_core::domain::{FileFacet, FolderFacet, Inode, ParentReference, RemotePath};
    use onedrivefs_core::ports::{Page, Quota, Tokens, UploadResult};
    use onedrivefs_fuse::ROOT_REMOTE_ID;
    use onedrivefs_fuse::WriteSerializer;
    use onedrivefs_store::{DatabasePool, SqliteStore};
    use std::sync::Mutex;

    struct StubRemote {
        pages: Mutex<Vec<Page<DriveItem>>>,
    }

    #[async_trait]
    impl RemoteClient for StubRemote {
        async fn refresh_tokens(&self, _refresh_token: &str) -> anyhow::Result<Tokens> {
            unimplemented!()
        }
        async fn get_item(&self, _id: &RemoteId) -> anyhow::Result<DriveItem> {
            unimplemented!()
        }
        async fn get_children(&self, _id: &RemoteId) -> anyhow::Result<Page<DriveItem>> {
            unimplemented!()
        }
        async fn get_children_page(&self, _next_link: &str) -> anyhow::Result<Page<DriveItem>> {
            unimplemented!()
        }
        async fn get_content(&self, _id: &RemoteId) -> anyhow::Result<Vec<u8>> {
            unimplemented!()
        }
        async fn mkdir(&self, _parent_id: &RemoteId, _name: &str) -> anyhow::Result<DriveItem> {
            unimplemented!()
        }
        async fn rename(&self, _id: &RemoteId, _new_parent_id: &RemoteId, _new_name: &str) -> anyhow::Result<DriveItem> {
            unimplemented!()
        }
        async fn remove(&self, _id: &RemoteId) -> anyhow::Result<()> {
            unimplemented!()
        }
        async fn put_small(&self, _parent_path: &RemotePath, _name: &str, _data: &[u8]) -> anyhow::Result<UploadResult> {
            unimplemented!()
        }
        async fn create_upload_session(&self, _parent_path: &RemotePath, _name: &str) -> anyhow::Result<String> {
            unimplemented!()
        }
        async fn put_chunk(&self, _upload_url: &str, _data: &[u8], _offset: u64, _total: u64) -> anyhow::Result<Option<UploadResult>> {
            unimplemented!()
        }
        async fn cancel_upload_session(&self, _upload_url: &str) -> anyhow::Result<()> {
            unimplemented!()
        }
        async fn delta(&self, _token: Option<&DeltaToken>) -> anyhow::Result<Page<DriveItem>> {
            Ok(self.pages.lock().unwrap().remove(0))
        }
        async fn delta_page(&self, _next_link: &str) -> anyhow::Result<Page<DriveItem>> {
            Ok(self.pages.lock().unwrap().remove(0))
        }
        async fn get_quota(&self) -> anyhow::Result<Quota> {
            unimplemented!()
        }
    }

    fn file_item(id: &str, parent: &RemoteId, name: &str, mtime: DateTime<Utc>) -> DriveItem {
        DriveItem {
            id: RemoteId::new(id.to_string()).unwrap(),
            name: name.to_string(),
            size: 4,
            last_modified: mtime,
            parent: Some(ParentReference {
                id: Some(parent.clone()),
                path: None,
                drive_id: "drive-1".to_string(),
                drive_type: onedrivefs_core::domain::DriveType::Personal,
            }),
            folder: None,
            file: Some(FileFacet::default()),
            deleted: None,
            etag: Some("etag-a".to_string()),
        }
    }

    async fn setup() -> (Arc<InodeGraph>, Arc<dyn Store>, WriteSerializerHandle, RemoteId) {
        let pool = DatabasePool::in_memory().await.unwrap();
        let store: Arc<dyn Store> = Arc::new(SqliteStore::new(pool.pool().clone()));
        let graph = Arc::new(InodeGraph::new(Arc::clone(&store)));
        let (serializer, handle) = WriteSerializer::new(Arc::clone(&store));
        tokio::spawn(serializer.run());

        let root_id = RemoteId::new(ROOT_REMOTE_ID.to_string()).unwrap();
        let mut root = Inode::new_local("root".to_string(), root_id.clone(), true);
        root.id = root_id.clone();
        root.parent_id = None;
        root.node_id = 1;
        graph.insert(root).await.unwrap();

        (graph, store, handle, root_id)
    }

    #[tokio::test]
    async fn new_item_under_cached_parent_is_inserted() {
        let (graph, store, write_handle, root_id) = setup().await;
        let item = file_item("remote-1", &root_id, "report.docx", Utc::now());
        let remote = Arc::new(StubRemote {
            pages: Mutex::new(vec![Page {
                items: vec![item],
                next_link: None,
                delta_link: Some("cursor-1".to_string()),
            }]),
        }) as Arc<dyn RemoteClient>;

        let loop_ = DeltaLoop::new(remote, store, graph.clone(), write_handle, OnlineFlag::new(false));
        loop_.tick().await.unwrap();

        let root = graph.get(&root_id).await.unwrap().unwrap();
        assert_eq!(root.read().unwrap().children.as_ref().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn item_under_uncached_parent_is_skipped() {
        let (graph, store, write_handle, root_id) = setup().await;
        let ghost_parent = RemoteId::new("not-cached".to_string()).unwrap();
        let item = file_item("remote-2", &ghost_parent, "orphan.txt", Utc::now());
        let remote = Arc::new(StubRemote {
            pages: Mutex::new(vec![Page {
                items: vec![item],
                next_link: None,
                delta_link: Some("cursor-1".to_string()),
            }]),
        }) as Arc<dyn RemoteClient>;

        let loop_ = DeltaLoop::new(remote, store, graph.clone(), write_handle, OnlineFlag::new(false));
        loop_.tick().await.unwrap();

        assert!(graph.get(&RemoteId::new("remote-2".to_string()).unwrap()).await.unwrap().is_none());
        let root = graph.get(&root_id).await.unwrap().unwrap();
        assert!(root.read().unwrap().children.as_ref().unwrap().is_empty());
    }

    #[tokio::test]
    async fn promotes_local_id_to_matching_remote_item() {
        let (graph, store, write_handle, root_id) = setup().await;
        let local = Inode::new_local("draft.txt".to_string(), root_id.clone(), false);
        let local_id = local.id.clone();
        graph.insert(local).await.unwrap();

        let item = file_item("remote-9", &root_id, "draft.txt", Utc::now());
        let remote = Arc::new(StubRemote {
            pages: Mutex::new(vec![Page {
                items: vec![item],
                next_link: None,
                delta_link: Some("cursor-1".to_string()),
            }]),
        }) as Arc<dyn RemoteClient>;

        let loop_ = DeltaLoop::new(remote, store, graph.clone(), write_handle, OnlineFlag::new(false));
        loop_.tick().await.unwrap();

        assert!(graph.get(&local_id).await.unwrap().is_none());
        let promoted = graph
            .get(&RemoteId::new("remote-9".to_string()).unwrap())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(promoted.read().unwrap().name, "draft.txt");
    }

    #[tokio::test]
    async fn deletion_of_empty_item_removes_it_immediately() {
        let (graph, store, write_handle, root_id) = setup().await;
        let file = Inode::new_local("gone.txt".to_string(), root_id.clone(), false);
        let file_id = file.id.clone();
        graph.insert(file).await.unwrap();
        graph.move_id(&file_id, &RemoteId::new("remote-5".to_string()).unwrap()).await.unwrap();

        let mut deleted_item = file_item("remote-5", &root_id, "gone.txt", Utc::now());
        deleted_item.deleted = Some(onedrivefs_core::domain::DeletedFacet::default());
        let remote = Arc::new(StubRemote {
            pages: Mutex::new(vec![Page {
                items: vec![deleted_item],
                next_link: None,
                delta_link: Some("cursor-1".to_string()),
            }]),
        }) as Arc<dyn RemoteClient>;

        let loop_ = DeltaLoop::new(remote, store, graph.clone(), write_handle, OnlineFlag::new(false));
        loop_.tick().await.unwrap();

        assert!(graph
            .get(&RemoteId::new("remote-5".to_string()).unwrap())
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn deletion_of_non_empty_directory_is_deferred_then_applied() {
        let (graph, store, write_handle, root_id) = setup().await;
        let dir = Inode::new_local("dir".to_string(), root_id.clone(), true);
        let dir = graph.insert(dir).await.unwrap();
        let dir_id = dir.read().unwrap().id.clone();
        graph.move_id(&dir_id, &RemoteId::new("remote-dir".to_string()).unwrap()).await.unwrap();
        let remote_dir_id = RemoteId::new("remote-dir".to_string()).unwrap();

        let child = Inode::new_local("inside.txt".to_string(), remote_dir_id.clone(), false);
        graph.insert(child).await.unwrap();

        let mut deleted_item = file_item("remote-dir", &root_id, "dir", Utc::now());
        deleted_item.folder = Some(FolderFacet::default());
        deleted_item.file = None;
        deleted_item.deleted = Some(onedrivefs_core::domain::DeletedFacet::default());
        let remote = Arc::new(StubRemote {
            pages: Mutex::new(vec![Page {
                items: vec![deleted_item],
                next_link: None,
                delta_link: Some("cursor-1".to_string()),
            }]),
        }) as Arc<dyn RemoteClient>;

        let loop_ = DeltaLoop::new(remote, store, graph.clone(), write_handle, OnlineFlag::new(false));
        // Has a child, so first-pass deletion defers it; the second pass
        // within the same tick applies it regardless (local op, no
        // remote round-trip, so there's nothing to actually fail on).
        loop_.tick().await.unwrap();
        assert!(graph.get(&remote_dir_id).await.unwrap().is_none());
    }
}
