//! Write operation serialization.
//!
//! Batches every mutation against the persistent store through a single
//! channel, processed by one dedicated task. This keeps SQLite writes
//! serialized even though the kernel may invoke several `Filesystem`
//! methods concurrently from different threads (§4.3 "Writes are
//! batched").

use std::sync::Arc;

use onedrivefs_core::domain::{DeltaToken, Inode, RemoteId, UploadSession};
use onedrivefs_core::ports::Store;
use tokio::sync::{mpsc, oneshot};

use crate::error::FuseError;

pub type Result<T> = std::result::Result<T, FuseError>;

// ============================================================================
// WriteOp enum
// ============================================================================

/// A single store mutation plus a oneshot sender for its result.
#[derive(Debug)]
pub enum WriteOp {
    SaveInode {
        inode: Box<Inode>,
        reply: oneshot::Sender<Result<()>>,
    },
    DeleteInode {
        id: RemoteId,
        reply: oneshot::Sender<Result<()>>,
    },
    MoveInode {
        old: RemoteId,
        new: RemoteId,
        reply: oneshot::Sender<Result<()>>,
    },
    SaveContent {
        id: RemoteId,
        data: Vec<u8>,
        reply: oneshot::Sender<Result<()>>,
    },
    DeleteContent {
        id: RemoteId,
        reply: oneshot::Sender<Result<()>>,
    },
    MoveContent {
        old: RemoteId,
        new: RemoteId,
        reply: oneshot::Sender<Result<()>>,
    },
    SaveUploadSession {
        session: Box<UploadSession>,
        reply: oneshot::Sender<Result<()>>,
    },
    DeleteUploadSession {
        id: RemoteId,
        reply: oneshot::Sender<Result<()>>,
    },
    SaveDeltaCursor {
        cursor: DeltaToken,
        reply: oneshot::Sender<Result<()>>,
    },
    NextNodeId {
        reply: oneshot::Sender<Result<u64>>,
    },
}

// ============================================================================
// WriteSerializerHandle
// ============================================================================

/// Handle for sending write operations to the serializer task. Cheaply
/// cloneable and shared across the FUSE thread pool and the sync crate's
/// upload/delta workers.
#[derive(Clone)]
pub struct WriteSerializerHandle {
    tx: mpsc::Sender<WriteOp>,
}

impl WriteSerializerHandle {
    async fn roundtrip<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<Result<T>>) -> WriteOp,
    ) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.tx.send(build(tx)).await.map_err(|_| {
            FuseError::DatabaseError("write serializer task has stopped".to_string())
        })?;
        rx.await
            .map_err(|_| FuseError::DatabaseError("write serializer response lost".to_string()))?
    }

    pub async fn save_inode(&self, inode: Inode) -> Result<()> {
        self.roundtrip(|reply| WriteOp::SaveInode {
            inode: Box::new(inode),
            reply,
        })
        .await
    }

    pub async fn delete_inode(&self, id: RemoteId) -> Result<()> {
        self.roundtrip(|reply| WriteOp::DeleteInode { id, reply }).await
    }

    pub async fn move_inode(&self, old: RemoteId, new: RemoteId) -> Result<()> {
        self.roundtrip(|reply| WriteOp::MoveInode { old, new, reply })
            .await
    }

    pub async fn save_content(&self, id: RemoteId, data: Vec<u8>) -> Result<()> {
        self.roundtrip(|reply| WriteOp::SaveContent { id, data, reply })
            .await
    }

    pub async fn delete_content(&self, id: RemoteId) -> Result<()> {
        self.roundtrip(|reply| WriteOp::DeleteContent { id, reply })
            .await
    }

    pub async fn move_content(&self, old: RemoteId, new: RemoteId) -> Result<()> {
        self.roundtrip(|reply| WriteOp::MoveContent { old, new, reply })
            .await
    }

    pub async fn save_upload_session(&self, session: UploadSession) -> Result<()> {
        self.roundtrip(|reply| WriteOp::SaveUploadSession {
            session: Box::new(session),
            reply,
        })
        .await
    }

    pub async fn delete_upload_session(&self, id: RemoteId) -> Result<()> {
        self.roundtrip(|reply| WriteOp::DeleteUploadSession { id, reply })
            .await
    }

    pub async fn save_delta_cursor(&self, cursor: DeltaToken) -> Result<()> {
        self.roundtrip(|reply| WriteOp::SaveDeltaCursor { cursor, reply })
            .await
    }

    pub async fn next_node_id(&self) -> Result<u64> {
        self.roundtrip(|reply| WriteOp::NextNodeId { reply }).await
    }
}

// ============================================================================
// WriteSerializer
// ============================================================================

/// Runs as a dedicated tokio task, draining `WriteOp`s from its channel
/// and applying them to the store one at a time.
pub struct WriteSerializer {
    rx: mpsc::Receiver<WriteOp>,
    store: Arc<dyn Store>,
}

impl WriteSerializer {
    /// Buffer size of 256 allows bursts of directory-listing writes to
    /// queue up without the caller blocking on every single insert.
    pub fn new(store: Arc<dyn Store>) -> (Self, WriteSerializerHandle) {
        let (tx, rx) = mpsc::channel(256);
        (Self { rx, store }, WriteSerializerHandle { tx })
    }

    pub async fn run(mut self) {
        tracing::info!("write serializer task started");
        while let Some(op) = self.rx.recv().await {
            self.process_operation(op).await;
        }
        tracing::info!("write serializer task stopped (all senders dropped)");
    }

    async fn process_operation(&self, op: WriteOp) {
        match op {
            WriteOp::SaveInode { inode, reply } => {
                tracing::trace!(id = %inode.id, "processing SaveInode");
                let result = self
                    .store
                    .save_inode(&inode)
                    .await
                    .map_err(|e| FuseError::DatabaseError(e.to_string()));
                let _ = reply.send(result);
            }

            WriteOp::DeleteInode { id, reply } => {
                tracing::trace!(%id, "processing DeleteInode");
                let result = self
                    .store
                    .delete_inode(&id)
                    .await
                    .map_err(|e| FuseError::DatabaseError(e.to_string()));
                let _ = reply.send(result);
            }

            WriteOp::MoveInode { old, new, reply } => {
                tracing::trace!(%old, %new, "processing MoveInode");
                let result = self
                    .store
                    .move_inode(&old, &new)
                    .await
                    .map_err(|e| FuseError::DatabaseError(e.to_string()));
                let _ = reply.send(result);
            }

            WriteOp::SaveContent { id, data, reply } => {
                tracing::trace!(%id, bytes = data.len(), "processing SaveContent");
                let result = self
                    .store
                    .save_content(&id, &data)
                    .await
                    .map_err(|e| FuseError::DatabaseError(e.to_string()));
                let _ = reply.send(result);
            }

            WriteOp::DeleteContent { id, reply } => {
                tracing::trace!(%id, "processing DeleteContent");
                let result = self
                    .store
                    .delete_content(&id)
                    .await
                    .map_err(|e| FuseError::DatabaseError(e.to_string()));
                let _ = reply.send(result);
            }

            WriteOp::MoveContent { old, new, reply } => {
                tracing::trace!(%old, %new, "processing MoveContent");
                let result = self
                    .store
                    .move_content(&old, &new)
                    .await
                    .map_err(|e| FuseError::DatabaseError(e.to_string()));
                let _ = reply.send(result);
            }

            WriteOp::SaveUploadSession { session, reply } => {
                tracing::trace!(old_id = %session.old_id, "processing SaveUploadSession");
                let result = self
                    .store
                    .save_upload_session(&session)
                    .await
                    .map_err(|e| FuseError::DatabaseError(e.to_string()));
                let _ = reply.send(result);
            }

            WriteOp::DeleteUploadSession { id, reply } => {
                tracing::trace!(%id, "processing DeleteUploadSession");
                let result = self
                    .store
                    .delete_upload_session(&id)
                    .await
                    .map_err(|e| FuseError::DatabaseError(e.to_string()));
                let _ = reply.send(result);
            }

            WriteOp::SaveDeltaCursor { cursor, reply } => {
                tracing::trace!("processing SaveDeltaCursor");
                let result = self
                    .store
                    .save_delta_cursor(&cursor)
                    .await
                    .map_err(|e| FuseError::DatabaseError(e.to_string()));
                let _ = reply.send(result);
            }

            WriteOp::NextNodeId { reply } => {
                tracing::trace!("processing NextNodeId");
                let result = self
                    .store
                    .next_node_id()
                    .await
                    .map_err(|e| FuseError::DatabaseError(e.to_string()));
                let _ = reply.send(result);
            }
        }
    }
}
