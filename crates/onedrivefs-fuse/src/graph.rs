//! Inode graph — the in-memory mirror of the metadata bucket, and the
//! node-ID mapper the VFS adapter addresses inodes by (§4.1).
//!
//! Every [`Inode`] live in the mount is reachable two ways: by its
//! [`RemoteId`] (stable identity used by the store and the delta loop)
//! and by its `node_id` (the `u64` the kernel knows as an inode number).
//! Node 1 is reserved for the mount root and is never handed out by
//! [`onedrivefs_store`]'s `next_node_id`.
//!
//! Mutations that touch more than one node (attaching a child, rekeying
//! an ID) always take the parent's lock before the child's, matching
//! §4.1's parent-before-child ordering. Lock guards are never held
//! across an `.await` point: every write is snapshotted to an owned
//! `Inode` before the corresponding store call.

use std::sync::{Arc, RwLock};

use dashmap::DashMap;

use onedrivefs_core::domain::{DriveItem, Inode, RemoteId};
use onedrivefs_core::ports::{RemoteClient, Store};

pub const ROOT_NODE_ID: u64 = 1;

/// Sentinel remote ID for the drive root item. The root has no parent and
/// is always addressed the same way regardless of account.
pub const ROOT_REMOTE_ID: &str = "root";

/// Live inode graph, backed by a [`Store`] for everything not currently
/// resident in memory.
pub struct InodeGraph {
    by_id: DashMap<RemoteId, Arc<RwLock<Inode>>>,
    by_node_id: DashMap<u64, RemoteId>,
    store: Arc<dyn Store>,
}

impl InodeGraph {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            by_id: DashMap::new(),
            by_node_id: DashMap::new(),
            store,
        }
    }

    /// Rehydrates the graph from the store's metadata bucket. Called once
    /// at mount time, before the first kernel request is served.
    pub async fn load_all(&self) -> anyhow::Result<()> {
        for inode in self.store.all_inodes().await? {
            self.promote(inode);
        }
        Ok(())
    }

    fn promote(&self, inode: Inode) -> Arc<RwLock<Inode>> {
        let node_id = inode.node_id;
        let id = inode.id.clone();
        let entry = Arc::new(RwLock::new(inode));
        self.by_id.insert(id.clone(), Arc::clone(&entry));
        if node_id != 0 {
            self.by_node_id.insert(node_id, id);
        }
        entry
    }

    fn snapshot(entry: &Arc<RwLock<Inode>>) -> Inode {
        entry.read().unwrap().clone()
    }

    /// Looks up an inode by its remote/local id, falling back to the
    /// store on a cache miss and promoting what it finds into memory.
    pub async fn get(&self, id: &RemoteId) -> anyhow::Result<Option<Arc<RwLock<Inode>>>> {
        if let Some(entry) = self.by_id.get(id) {
            return Ok(Some(Arc::clone(&entry)));
        }
        match self.store.get_inode(id).await? {
            Some(inode) => Ok(Some(self.promote(inode))),
            None => Ok(None),
        }
    }

    /// Node-ID mapper: `map(node_id) -> id` (§4.1).
    pub fn map(&self, node_id: u64) -> Option<RemoteId> {
        self.by_node_id.get(&node_id).map(|e| e.clone())
    }

    pub async fn get_by_node_id(&self, node_id: u64) -> anyhow::Result<Option<Arc<RwLock<Inode>>>> {
        let Some(id) = self.map(node_id) else {
            return Ok(None);
        };
        self.get(&id).await
    }

    /// Inserts a newly created, locally-originated inode (`mkdir`,
    /// `create`): assigns a node ID if unset, wires it into the parent's
    /// child list. Idempotent if the same id is inserted twice.
    pub async fn insert(&self, mut inode: Inode) -> anyhow::Result<Arc<RwLock<Inode>>> {
        if let Some(existing) = self.by_id.get(&inode.id) {
            return Ok(Arc::clone(&existing));
        }
        if inode.node_id == 0 {
            inode.node_id = self.store.next_node_id().await?;
        }

        let parent_id = inode.parent_id.clone();
        let id = inode.id.clone();
        let is_dir = inode.is_directory;

        self.store.save_inode(&inode).await?;
        let entry = self.promote(inode);

        if let Some(parent_id) = parent_id {
            self.attach_child(&parent_id, &id, is_dir).await?;
        }

        Ok(entry)
    }

    /// Materialises a [`DriveItem`] fetched from the remote into the
    /// graph without wiring it into any parent's child list — callers
    /// populating a directory listing or applying a delta page own that
    /// wiring themselves (§4.2, §4.5).
    pub async fn upsert_remote(&self, item: DriveItem) -> anyhow::Result<Arc<RwLock<Inode>>> {
        let existing_children = match self.by_id.get(&item.id) {
            Some(existing) => existing.read().unwrap().children.clone(),
            None => None,
        };
        let node_id = match self.by_id.get(&item.id) {
            Some(existing) => existing.read().unwrap().node_id,
            None => match self.store.get_inode(&item.id).await? {
                Some(existing) => existing.node_id,
                None => self.store.next_node_id().await?,
            },
        };

        let mut inode = Inode::from_drive_item(item);
        inode.node_id = node_id;
        inode.children = existing_children;

        self.store.save_inode(&inode).await?;
        Ok(self.promote(inode))
    }

    /// Appends `child_id` to `parent_id`'s child list if not already
    /// present, bumping `subdir_count` for directories.
    pub async fn attach_child(
        &self,
        parent_id: &RemoteId,
        child_id: &RemoteId,
        child_is_dir: bool,
    ) -> anyhow::Result<()> {
        let Some(parent) = self.get(parent_id).await? else {
            return Ok(());
        };
        let changed = {
            let mut parent = parent.write().unwrap();
            match parent.children.as_mut() {
                Some(children) if !children.contains(child_id) => {
                    children.push(child_id.clone());
                    if child_is_dir {
                        parent.subdir_count += 1;
                    }
                    true
                }
                Some(_) => false,
                None => {
                    parent.children = Some(vec![child_id.clone()]);
                    if child_is_dir {
                        parent.subdir_count += 1;
                    }
                    true
                }
            }
        };
        if changed {
            self.store.save_inode(&Self::snapshot(&parent)).await?;
        }
        Ok(())
    }

    /// Detaches `child_id` from `parent_id`'s child list. Decrements
    /// `subdir_count` when `child_is_dir` is set.
    pub async fn detach_child(
        &self,
        parent_id: &RemoteId,
        child_id: &RemoteId,
        child_is_dir: bool,
    ) -> anyhow::Result<()> {
        let Some(parent) = self.get(parent_id).await? else {
            return Ok(());
        };
        {
            let mut parent = parent.write().unwrap();
            if let Some(children) = parent.children.as_mut() {
                children.retain(|c| c != child_id);
            }
            if child_is_dir {
                parent.subdir_count = parent.subdir_count.saturating_sub(1);
            }
        }
        self.store.save_inode(&Self::snapshot(&parent)).await?;
        Ok(())
    }

    /// Removes an inode from the graph and its parent's child list
    /// (`unlink`/`rmdir`), and drops any cached content for it.
    pub async fn delete(&self, id: &RemoteId) -> anyhow::Result<()> {
        let removed = self.by_id.remove(id).map(|(_, entry)| entry);

        if let Some(entry) = removed {
            let (parent_id, is_dir, node_id) = {
                let inode = entry.read().unwrap();
                (inode.parent_id.clone(), inode.is_directory, inode.node_id)
            };
            self.by_node_id.remove(&node_id);

            if let Some(parent_id) = parent_id {
                self.detach_child(&parent_id, id, is_dir).await?;
            }
        }

        self.store.delete_inode(id).await?;
        self.store.delete_content(id).await?;
        Ok(())
    }

    /// Rewrites an inode's identity in place (local-to-remote promotion,
    /// or any other id rekey), updating the parent's child list and the
    /// node-ID mapper, and rekeying the content bucket in lockstep
    /// (§4.1 `move_id`).
    pub async fn move_id(&self, old: &RemoteId, new: &RemoteId) -> anyhow::Result<()> {
        let Some((_, entry)) = self.by_id.remove(old) else {
            self.store.move_inode(old, new).await?;
            self.store.move_content(old, new).await?;
            return Ok(());
        };

        let (node_id, parent_id) = {
            let mut inode = entry.write().unwrap();
            inode.id = new.clone();
            (inode.node_id, inode.parent_id.clone())
        };

        self.by_id.insert(new.clone(), Arc::clone(&entry));
        self.by_node_id.insert(node_id, new.clone());

        if let Some(parent_id) = parent_id {
            if let Some(parent) = self.by_id.get(&parent_id) {
                let mut parent = parent.write().unwrap();
                if let Some(children) = parent.children.as_mut() {
                    for child in children.iter_mut() {
                        if child == old {
                            *child = new.clone();
                        }
                    }
                }
            }
        }

        self.store.move_inode(old, new).await?;
        self.store.move_content(old, new).await?;
        Ok(())
    }

    /// Graph-only rename/reparent: updates `name` and `parent_id` on the
    /// inode itself and moves it between the old and new parents' child
    /// lists (§4.1 `move_path`). Does not touch the remote.
    pub async fn move_path(
        &self,
        id: &RemoteId,
        new_parent_id: &RemoteId,
        new_name: &str,
    ) -> anyhow::Result<()> {
        let Some(entry) = self.get(id).await? else {
            anyhow::bail!("move_path: unknown inode {id}");
        };

        let (old_parent_id, is_dir) = {
            let mut inode = entry.write().unwrap();
            let old_parent_id = inode.parent_id.clone();
            inode.parent_id = Some(new_parent_id.clone());
            inode.name = new_name.to_string();
            (old_parent_id, inode.is_directory)
        };

        if let Some(old_parent_id) = &old_parent_id {
            if old_parent_id != new_parent_id {
                self.detach_child(old_parent_id, id, is_dir).await?;
            }
        }
        self.attach_child(new_parent_id, id, is_dir).await?;
        self.store.save_inode(&Self::snapshot(&entry)).await?;
        Ok(())
    }

    /// Looks up a named child of `parent_id`, lazily populating the
    /// parent's children from the remote first if it's never been
    /// listed (§4.2). While offline, an unlisted directory is treated
    /// as having no children rather than failing the lookup.
    pub async fn get_child(
        &self,
        remote: &dyn RemoteClient,
        parent_id: &RemoteId,
        name: &str,
        online: bool,
    ) -> anyhow::Result<Option<Arc<RwLock<Inode>>>> {
        self.ensure_children(remote, parent_id, online).await?;

        let Some(parent) = self.get(parent_id).await? else {
            return Ok(None);
        };
        let child_ids = parent.read().unwrap().children.clone().unwrap_or_default();

        let folded = name.to_lowercase();
        for child_id in child_ids {
            if let Some(child) = self.get(&child_id).await? {
                if child.read().unwrap().folded_name() == folded {
                    return Ok(Some(child));
                }
            }
        }
        Ok(None)
    }

    /// Looks up a named child of `parent_id` using only what's already
    /// resident or in the store — never triggers a remote fetch. Returns
    /// `None` if `parent_id` is uncached or its children have never been
    /// listed. Used by the delta loop (§4.5), which already has the full
    /// picture of what changed and must not fetch a listing mid-reconcile.
    pub async fn find_local_child(
        &self,
        parent_id: &RemoteId,
        name: &str,
    ) -> anyhow::Result<Option<Arc<RwLock<Inode>>>> {
        let Some(parent) = self.get(parent_id).await? else {
            return Ok(None);
        };
        let Some(child_ids) = parent.read().unwrap().children.clone() else {
            return Ok(None);
        };

        let folded = name.to_lowercase();
        for child_id in child_ids {
            if let Some(child) = self.get(&child_id).await? {
                if child.read().unwrap().folded_name() == folded {
                    return Ok(Some(child));
                }
            }
        }
        Ok(None)
    }

    /// Ensures the root inode is present and pinned to
    /// [`ROOT_NODE_ID`], fetching it from the remote on a fresh store
    /// with no prior mount history. A no-op once the root is resident.
    pub async fn ensure_root(
        &self,
        remote: &dyn RemoteClient,
        root_id: &RemoteId,
    ) -> anyhow::Result<()> {
        if self.get(root_id).await?.is_some() {
            return Ok(());
        }

        let item = remote.get_item(root_id).await?;
        let mut inode = Inode::from_drive_item(item);
        inode.id = root_id.clone();
        inode.parent_id = None;
        inode.node_id = ROOT_NODE_ID;

        self.store.save_inode(&inode).await?;
        self.promote(inode);
        Ok(())
    }

    /// Ensures `parent_id`'s child list is populated, paging through the
    /// remote's `children` endpoint via `next_link` on first listing
    /// (§4.2). A no-op once a directory has been listed.
    pub async fn ensure_children(
        &self,
        remote: &dyn RemoteClient,
        parent_id: &RemoteId,
        online: bool,
    ) -> anyhow::Result<()> {
        let Some(parent) = self.get(parent_id).await? else {
            return Ok(());
        };
        if parent.read().unwrap().children.is_some() {
            return Ok(());
        }

        if !online {
            // Offline miss: present as empty rather than failing the
            // caller; nothing durable is written so the real listing is
            // fetched once connectivity returns.
            parent.write().unwrap().children = Some(Vec::new());
            return Ok(());
        }

        let mut child_ids = Vec::new();
        let mut page = remote.get_children(parent_id).await?;
        loop {
            for item in page.items {
                let child = self.upsert_remote(item).await?;
                child_ids.push(child.read().unwrap().id.clone());
            }
            match page.next_link {
                Some(next) => page = remote.get_children_page(&next).await?,
                None => break,
            }
        }

        parent.write().unwrap().children = Some(child_ids);
        self.store.save_inode(&Self::snapshot(&parent)).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use onedrivefs_core::domain::{DeltaToken, RemotePath};
    use onedrivefs_core::ports::{Page, Quota, Tokens, UploadResult};
    use onedrivefs_store::{DatabasePool, SqliteStore};

    struct NoopRemote;

    #[async_trait]
    impl RemoteClient for NoopRemote {
        async fn refresh_tokens(&self, _refresh_token: &str) -> anyhow::Result<Tokens> {
            unimplemented!()
        }
        async fn get_item(&self, _id: &RemoteId) -> anyhow::Result<DriveItem> {
            unimplemented!()
        }
        async fn get_children(&self, _id: &RemoteId) -> anyhow::Result<Page<DriveItem>> {
            Ok(Page {
                items: Vec::new(),
                next_link: None,
                delta_link: None,
            })
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
        async fn rename(
            &self,
            _id: &RemoteId,
            _new_parent_id: &RemoteId,
            _new_name: &str,
        ) -> anyhow::Result<DriveItem> {
            unimplemented!()
        }
        async fn remove(&self, _id: &RemoteId) -> anyhow::Result<()> {
            unimplemented!()
        }
        async fn put_small(
            &self,
            _parent_path: &RemotePath,
            _name: &str,
            _data: &[u8],
        ) -> anyhow::Result<UploadResult> {
            unimplemented!()
        }
        async fn create_upload_session(
            &self,
            _parent_path: &RemotePath,
            _name: &str,
        ) -> anyhow::Result<String> {
            unimplemented!()
        }
        async fn put_chunk(
            &self,
            _upload_url: &str,
            _data: &[u8],
            _offset: u64,
            _total: u64,
        ) -> anyhow::Result<Option<UploadResult>> {
            unimplemented!()
        }
        async fn cancel_upload_session(&self, _upload_url: &str) -> anyhow::Result<()> {
            unimplemented!()
        }
        async fn delta(&self, _token: Option<&DeltaToken>) -> anyhow::Result<Page<DriveItem>> {
            unimplemented!()
        }
        async fn delta_page(&self, _next_link: &str) -> anyhow::Result<Page<DriveItem>> {
            unimplemented!()
        }
        async fn get_quota(&self) -> anyhow::Result<Quota> {
            unimplemented!()
        }
    }

    async fn setup() -> (InodeGraph, RemoteId) {
        let pool = DatabasePool::in_memory().await.unwrap();
        let store: Arc<dyn Store> = Arc::new(SqliteStore::new(pool.pool().clone()));
        let graph = InodeGraph::new(store);

        let root_id = RemoteId::new("root".to_string()).unwrap();
        let mut root = Inode::new_local("root".to_string(), root_id.clone(), true);
        root.node_id = ROOT_NODE_ID;
        root.parent_id = None;
        root.id = root_id.clone();
        graph.insert(root).await.unwrap();

        (graph, root_id)
    }

    #[tokio::test]
    async fn insert_assigns_node_id_and_wires_parent() {
        let (graph, root_id) = setup().await;
        let child = Inode::new_local("file.txt".to_string(), root_id.clone(), false);
        let child_id = child.id.clone();

        let entry = graph.insert(child).await.unwrap();
        assert_ne!(entry.read().unwrap().node_id, 0);

        let root = graph.get(&root_id).await.unwrap().unwrap();
        assert_eq!(root.read().unwrap().children.as_ref().unwrap(), &vec![child_id]);
    }

    #[tokio::test]
    async fn insert_is_idempotent_for_same_id() {
        let (graph, root_id) = setup().await;
        let child = Inode::new_local("file.txt".to_string(), root_id.clone(), false);

        let first = graph.insert(child.clone()).await.unwrap();
        let second = graph.insert(child).await.unwrap();
        assert_eq!(first.read().unwrap().node_id, second.read().unwrap().node_id);

        let root = graph.get(&root_id).await.unwrap().unwrap();
        assert_eq!(root.read().unwrap().children.as_ref().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn delete_detaches_from_parent() {
        let (graph, root_id) = setup().await;
        let child = Inode::new_local("file.txt".to_string(), root_id.clone(), false);
        let child_id = child.id.clone();
        graph.insert(child).await.unwrap();

        graph.delete(&child_id).await.unwrap();

        assert!(graph.get(&child_id).await.unwrap().is_none());
        let root = graph.get(&root_id).await.unwrap().unwrap();
        assert!(root.read().unwrap().children.as_ref().unwrap().is_empty());
    }

    #[tokio::test]
    async fn move_id_rewrites_identity_and_parent_pointer() {
        let (graph, root_id) = setup().await;
        let child = Inode::new_local("file.txt".to_string(), root_id.clone(), false);
        let old_id = child.id.clone();
        graph.insert(child).await.unwrap();

        let new_id = RemoteId::new("remote-1".to_string()).unwrap();
        graph.move_id(&old_id, &new_id).await.unwrap();

        assert!(graph.get(&old_id).await.unwrap().is_none());
        let moved = graph.get(&new_id).await.unwrap().unwrap();
        assert_eq!(moved.read().unwrap().id, new_id);

        let root = graph.get(&root_id).await.unwrap().unwrap();
        assert_eq!(root.read().unwrap().children.as_ref().unwrap(), &vec![new_id]);
    }

    #[tokio::test]
    async fn move_path_reparents_between_two_directories() {
        let (graph, root_id) = setup().await;
        let dir_a = Inode::new_local("a".to_string(), root_id.clone(), true);
        let dir_a = graph.insert(dir_a).await.unwrap();
        let dir_a_id = dir_a.read().unwrap().id.clone();

        let dir_b = Inode::new_local("b".to_string(), root_id.clone(), true);
        let dir_b = graph.insert(dir_b).await.unwrap();
        let dir_b_id = dir_b.read().unwrap().id.clone();

        let file = Inode::new_local("file.txt".to_string(), dir_a_id.clone(), false);
        let file_id = file.id.clone();
        graph.insert(file).await.unwrap();

        graph
            .move_path(&file_id, &dir_b_id, "renamed.txt")
            .await
            .unwrap();

        let a = graph.get(&dir_a_id).await.unwrap().unwrap();
        assert!(a.read().unwrap().children.as_ref().unwrap().is_empty());
        let b = graph.get(&dir_b_id).await.unwrap().unwrap();
        assert_eq!(b.read().unwrap().children.as_ref().unwrap(), &vec![file_id.clone()]);

        let moved = graph.get(&file_id).await.unwrap().unwrap();
        assert_eq!(moved.read().unwrap().name, "renamed.txt");
    }

    #[tokio::test]
    async fn ensure_children_offline_miss_yields_empty_not_error() {
        let (graph, root_id) = setup().await;
        let dir = Inode::new_local("empty-dir".to_string(), root_id.clone(), true);
        let dir = graph.insert(dir).await.unwrap();
        let dir_id = dir.read().unwrap().id.clone();

        let remote = NoopRemote;
        graph
            .ensure_children(&remote, &dir_id, false)
            .await
            .unwrap();

        let dir = graph.get(&dir_id).await.unwrap().unwrap();
        assert_eq!(dir.read().unwrap().children, Some(Vec::new()));
    }

    #[tokio::test]
    async fn get_child_is_case_insensitive() {
        let (graph, root_id) = setup().await;
        let child = Inode::new_local("Report.PDF".to_string(), root_id.clone(), false);
        graph.insert(child).await.unwrap();

        let remote = NoopRemote;
        let found = graph
            .get_child(&remote, &root_id, "report.pdf", true)
            .await
            .unwrap();
        assert!(found.is_some());
    }

    #[tokio::test]
    async fn map_resolves_node_id_to_remote_id() {
        let (graph, root_id) = setup().await;
        assert_eq!(graph.map(ROOT_NODE_ID), Some(root_id));
    }

    #[tokio::test]
    async fn find_local_child_never_touches_remote() {
        let (graph, root_id) = setup().await;
        let child = Inode::new_local("notes.txt".to_string(), root_id.clone(), false);
        graph.insert(child).await.unwrap();

        let found = graph.find_local_child(&root_id, "NOTES.TXT").await.unwrap();
        assert!(found.is_some());
    }

    #[tokio::test]
    async fn find_local_child_is_none_when_children_never_listed() {
        let (graph, root_id) = setup().await;
        let dir = Inode::new_local("dir".to_string(), root_id.clone(), true);
        let dir = graph.insert(dir).await.unwrap();
        let dir_id = dir.read().unwrap().id.clone();
        {
            dir.write().unwrap().children = None;
        }

        assert!(graph
            .find_local_child(&dir_id, "anything")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn ensure_root_is_a_noop_once_present() {
        let (graph, root_id) = setup().await;
        let remote = NoopRemote;
        graph.ensure_root(&remote, &root_id).await.unwrap();
        assert_eq!(graph.map(ROOT_NODE_ID), Some(root_id));
    }
}
