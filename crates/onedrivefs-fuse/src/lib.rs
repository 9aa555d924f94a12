//! FUSE low-level filesystem adapter.
//!
//! Bridges the kernel's synchronous `fuser::Filesystem` callbacks onto
//! the async inode graph and the `RemoteClient`/`Store` ports, with all
//! store mutations funneled through a single serialized writer task.

pub mod error;
pub mod graph;
pub mod filesystem;
pub mod write_serializer;

pub use error::FuseError;
pub use filesystem::{OneDriveFs, OnlineFlag};
pub use graph::{InodeGraph, ROOT_NODE_ID, ROOT_REMOTE_ID};
pub use write_serializer::{WriteSerializer, WriteSerializerHandle};
