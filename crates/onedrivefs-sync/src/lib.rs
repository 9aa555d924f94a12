//! Background synchronization: the upload manager and the delta
//! reconciliation loop.
//!
//! Neither module talks to the kernel. They orchestrate the same
//! `RemoteClient`/`Store` ports and `InodeGraph` the FUSE adapter uses,
//! reached through `onedrivefs-fuse`'s `WriteSerializerHandle` so every
//! mutation still funnels through one writer task (§4.3).

pub mod delta;
pub mod retry;
pub mod upload;

pub use delta::DeltaLoop;
pub use upload::UploadManager;
