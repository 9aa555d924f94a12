//! Upload manager (§4.4).
//!
//! Consumes the `RemoteId`s the FUSE adapter's `upload_tx` hands off
//! whenever `fsync` persists a dirty inode, and drives each through to
//! completion: protocol selection (single PUT vs chunked resumable),
//! integrity verification, local-to-remote ID promotion, and queue
//! persistence so an in-flight transfer survives a restart. At most
//! [`MAX_CONCURRENT_UPLOADS`] run at once.

use std::sync::Arc;
use std::time::Duration;

use onedrivefs_core::domain::{
    DriveItem, RemoteId, RemotePath, UploadSession, UploadState, UPLOAD_CHUNK_SIZE,
};
use onedrivefs_core::ports::{RemoteClient, Store, UploadResult};
use onedrivefs_fuse::{InodeGraph, WriteSerializerHandle, ROOT_REMOTE_ID};
use tokio::sync::{mpsc, Semaphore};
use tracing::{error, info, warn};

use crate::retry::with_retry;

const MAX_CONCURRENT_UPLOADS: usize = 5;

pub struct UploadManager {
    remote: Arc<dyn RemoteClient>,
    store: Arc<dyn Store>,
    graph: Arc<InodeGraph>,
    write_handle: WriteSerializerHandle,
    upload_rx: mpsc::UnboundedReceiver<RemoteId>,
    semaphore: Arc<Semaphore>,
}

impl UploadManager {
    pub fn new(
        remote: Arc<dyn RemoteClient>,
        store: Arc<dyn Store>,
        graph: Arc<InodeGraph>,
        write_handle: WriteSerializerHandle,
        upload_rx: mpsc::UnboundedReceiver<RemoteId>,
    ) -> Self {
        Self {
            remote,
            store,
            graph,
            write_handle,
            upload_rx,
            semaphore: Arc::new(Semaphore::new(MAX_CONCURRENT_UPLOADS)),
        }
    }

    /// Loads not-yet-complete sessions left over from a prior run, cancels
    /// any partially-established server-side session (treated as
    /// non-resumable) and re-queues them from the beginning (§4.4 "Queue
    /// persistence"). Must run to completion before `run`'s channel loop
    /// starts competing for the same semaphore.
    pub async fn resume(&self) -> anyhow::Result<()> {
        let sessions = self.store.all_upload_sessions().await?;
        let pending: Vec<_> = sessions
            .into_iter()
            .filter(|s| s.state != UploadState::Complete)
            .collect();
        info!(count = pending.len(), "resuming pending uploads from a prior run");

        for mut session in pending {
            if let Some(url) = session.server_upload_url.take() {
                if let Err(e) = self.remote.cancel_upload_session(&url).await {
                    warn!(id = %session.id, error = %e, "failed to cancel stale upload session, ignoring");
                }
            }
            session.state = UploadState::NotStarted;
            self.write_handle.save_upload_session(session.clone()).await?;
            self.spawn_upload(session);
        }
        Ok(())
    }

    /// Runs until `upload_rx` closes, dispatching each enqueued id to the
    /// bounded pool of concurrent upload tasks.
    pub async fn run(mut self) {
        info!("upload manager starting");
        while let Some(id) = self.upload_rx.recv().await {
            match self.load_session(&id).await {
                Ok(Some(session)) => self.spawn_upload(session),
                Ok(None) => warn!(%id, "upload enqueued but no matching session found"),
                Err(e) => error!(%id, error = %e, "failed to load upload session"),
            }
        }
        info!("upload manager stopped (channel closed)");
    }

    async fn load_session(&self, id: &RemoteId) -> anyhow::Result<Option<UploadSession>> {
        let sessions = self.store.all_upload_sessions().await?;
        Ok(sessions.into_iter().find(|s| &s.id == id || &s.old_id == id))
    }

    fn spawn_upload(&self, session: UploadSession) {
        let remote = Arc::clone(&self.remote);
        let graph = Arc::clone(&self.graph);
        let write_handle = self.write_handle.clone();
        let semaphore = Arc::clone(&self.semaphore);
        tokio::spawn(async move {
            let _permit = semaphore.acquire().await.expect("semaphore is never closed");
            if let Err(e) = drive_to_completion(&remote, &graph, &write_handle, session).await {
                error!(error = %e, "upload abandoned");
            }
        });
    }
}

/// Drives one session through retries until it completes or is abandoned
/// (retry budget exhausted, §4.4 "Upload session" state machine).
async fn drive_to_completion(
    remote: &Arc<dyn RemoteClient>,
    graph: &Arc<InodeGraph>,
    write_handle: &WriteSerializerHandle,
    mut session: UploadSession,
) -> anyhow::Result<()> {
    loop {
        match try_upload(remote.as_ref(), graph.as_ref(), &session).await {
            Ok(result) => {
                apply_completion(graph, write_handle, &mut session, result).await?;
                write_handle.delete_upload_session(session.id.clone()).await?;
                info!(id = %session.id, name = %session.name, "upload complete");
                return Ok(());
            }
            Err(e) => {
                let abandoned = session.record_failure(e.to_string());
                write_handle.save_upload_session(session.clone()).await?;
                if abandoned {
                    return Err(e.context(format!(
                        "upload of {} abandoned after {} attempts",
                        session.name, session.retry_count
                    )));
                }
                let delay = Duration::from_secs(2u64.saturating_pow(session.retry_count.min(5)));
                warn!(
                    id = %session.id,
                    attempt = session.retry_count,
                    delay_secs = delay.as_secs(),
                    error = %e,
                    "upload attempt failed, retrying"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

async fn try_upload(
    remote: &dyn RemoteClient,
    graph: &InodeGraph,
    session: &UploadSession,
) -> anyhow::Result<UploadResult> {
    if session.is_large() {
        upload_large(remote, graph, session).await
    } else {
        upload_small(remote, graph, session).await
    }
}

async fn upload_small(
    remote: &dyn RemoteClient,
    graph: &InodeGraph,
    session: &UploadSession,
) -> anyhow::Result<UploadResult> {
    let parent_path = remote_path_of(graph, &session.parent_id).await?;
    let put = with_retry("put_small", || {
        remote.put_small(&parent_path, &session.name, &session.data)
    })
    .await;
    match put {
        Ok(result) => Ok(result),
        Err(e) => {
            let msg = format!("{e:#}").to_lowercase();
            if session.old_id.is_local() && msg.contains("namealreadyexists") {
                recover_from_name_collision(remote, session).await
            } else {
                Err(e)
            }
        }
    }
}

/// §4.4 "Small-upload name-collision recovery": the parent already has an
/// item by this name (created concurrently, or a retried upload whose
/// prior attempt actually succeeded server-side but the response was
/// lost). Adopt its ID instead of re-uploading.
async fn recover_from_name_collision(
    remote: &dyn RemoteClient,
    session: &UploadSession,
) -> anyhow::Result<UploadResult> {
    let mut page =
        with_retry("get_children", || remote.get_children(&session.parent_id)).await?;
    loop {
        if let Some(item) = page
            .items
            .iter()
            .find(|i| i.name.eq_ignore_ascii_case(&session.name))
        {
            info!(
                name = %session.name,
                id = %item.id,
                "adopted existing remote item after a name collision"
            );
            return Ok(UploadResult {
                item: item.clone(),
                etag: item.etag.clone(),
            });
        }
        match page.next_link {
            Some(next) => {
                page = with_retry("get_children_page", || remote.get_children_page(&next)).await?
            }
            None => break,
        }
    }
    anyhow::bail!(
        "nameAlreadyExists but no matching child named {} was found",
        session.name
    )
}

async fn upload_large(
    remote: &dyn RemoteClient,
    graph: &InodeGraph,
    session: &UploadSession,
) -> anyhow::Result<UploadResult> {
    let parent_path = remote_path_of(graph, &session.parent_id).await?;
    let upload_url = with_retry("create_upload_session", || {
        remote.create_upload_session(&parent_path, &session.name)
    })
    .await?;

    let total = session.size;
    let mut offset = 0u64;
    let mut last_result = None;
    while offset < total {
        let end = (offset + UPLOAD_CHUNK_SIZE).min(total);
        let chunk = &session.data[offset as usize..end as usize];
        match put_chunk_with_retry(remote, &upload_url, chunk, offset, total).await {
            Ok(result) => last_result = result,
            Err(e) => {
                let _ = remote.cancel_upload_session(&upload_url).await;
                return Err(e);
            }
        }
        offset = end;
    }

    match last_result {
        Some(result) => Ok(result),
        // The server sometimes answers the final chunk with an empty body;
        // refetching only works once the item already has a remote ID, so
        // a brand-new (local-ID) large file with no reported result is an
        // upload-manager error rather than something to paper over.
        None if !session.old_id.is_local() => {
            let item = with_retry("get_item", || remote.get_item(&session.id)).await?;
            Ok(UploadResult {
                etag: item.etag.clone(),
                item,
            })
        }
        None => anyhow::bail!(
            "upload session for new item {} completed without reporting a remote id",
            session.name
        ),
    }
}

/// Retries a single chunk PUT on a 5xx response only, with unbounded
/// exponential backoff (1, 2, 4, 8 … seconds) — a 4xx fails the session
/// immediately (§4.4 "Protocol selection").
async fn put_chunk_with_retry(
    remote: &dyn RemoteClient,
    upload_url: &str,
    chunk: &[u8],
    offset: u64,
    total: u64,
) -> anyhow::Result<Option<UploadResult>> {
    let mut attempt: u32 = 0;
    loop {
        match remote.put_chunk(upload_url, chunk, offset, total).await {
            Ok(result) => return Ok(result),
            Err(e) => {
                let msg = format!("{e:#}").to_lowercase();
                let is_5xx = msg.contains("500")
                    || msg.contains("502")
                    || msg.contains("503")
                    || msg.contains("504")
                    || msg.contains("server error");
                if !is_5xx {
                    return Err(e);
                }
                let delay = Duration::from_secs(2u64.saturating_pow(attempt.min(6)));
                warn!(offset, attempt, delay_secs = delay.as_secs(), error = %e, "chunk upload hit a 5xx, retrying");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

/// §4.4 "Completion": verify integrity, promote the local ID if the
/// server assigned a new one, and write the new etag into the inode.
async fn apply_completion(
    graph: &InodeGraph,
    write_handle: &WriteSerializerHandle,
    session: &mut UploadSession,
    result: UploadResult,
) -> anyhow::Result<()> {
    verify_integrity(session, &result.item)?;

    let new_id = result.item.id.clone();
    if session.old_id != new_id {
        graph.move_id(&session.old_id, &new_id).await?;
        write_handle
            .move_content(session.old_id.clone(), new_id.clone())
            .await?;
    }
    session.id = new_id.clone();

    if let Some(entry) = graph.get(&new_id).await? {
        let snapshot = {
            let mut inode = entry.write().unwrap();
            inode.etag = result.etag.clone();
            inode.has_changes = false;
            if let Some(hash) = result.item.hash() {
                inode.hash = Some(hash.clone());
            }
            inode.clone()
        };
        write_handle.save_inode(snapshot).await?;
    }
    Ok(())
}

fn verify_integrity(session: &UploadSession, item: &DriveItem) -> anyhow::Result<()> {
    match item.hash() {
        Some(remote_hash) => {
            if remote_hash.kind() == session.hash.kind() && remote_hash != &session.hash {
                anyhow::bail!("uploaded content hash mismatch for {}", session.name);
            }
            Ok(())
        }
        None => {
            if item.size != session.size {
                anyhow::bail!(
                    "uploaded content size mismatch for {}: expected {} bytes, server reports {}",
                    session.name,
                    session.size,
                    item.size
                );
            }
            Ok(())
        }
    }
}

/// Walks parent pointers up to the root to build the path a local-ID
/// inode needs for `put_small`/`create_upload_session`, both of which
/// address an as-yet-unassigned item by path rather than by ID. Mirrors
/// the VFS adapter's own rename-promotion helper.
fn remote_path_of<'a>(
    graph: &'a InodeGraph,
    id: &'a RemoteId,
) -> std::pin::Pin<Box<dyn std::future::Future<Output = anyhow::Result<RemotePath>> + Send + 'a>> {
    Box::pin(async move {
        if id.as_str() == ROOT_REMOTE_ID {
            return Ok(RemotePath::root());
        }
        let entry = graph
            .get(id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("remote path lookup: unknown inode {id}"))?;
        let (parent_id, name) = {
            let inode = entry.read().unwrap();
            (inode.parent_id.clone(), inode.name.clone())
        };
        let parent_id =
            parent_id.ok_or_else(|| anyhow::anyhow!("inode {id} has no parent"))?;
        let parent_path = remote_path_of(graph, &parent_id).await?;
        parent_path
            .join(&name)
            .map_err(|e| anyhow::anyhow!(e.to_string()))
    })
}
