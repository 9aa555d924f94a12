//! Domain entities and business logic
//!
//! - Newtypes for type-safe identifiers and validated domain values
//! - `DriveItem`: the remote's wire shape for a filesystem entity
//! - `Inode`: the runtime entity the filesystem engine operates on
//! - Domain-specific error types

pub mod drive_item;
pub mod errors;
pub mod inode;
pub mod newtypes;
pub mod upload_session;

pub use drive_item::{DeletedFacet, DeletedState, DriveItem, DriveType, FileFacet, FolderFacet, ParentReference};
pub use errors::DomainError;
pub use inode::{Inode, MODE_DERIVE};
pub use newtypes::*;
pub use upload_session::{
    UploadSession, UploadState, LARGE_FILE_THRESHOLD, MAX_UPLOAD_ATTEMPTS, UPLOAD_CHUNK_SIZE,
};
