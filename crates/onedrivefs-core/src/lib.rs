//! onedrivefs-core — domain model and port definitions
//!
//! - **Domain entities** — `DriveItem`, `Inode`, `UploadSession`
//! - **Port definitions** — `RemoteClient`, `Store`
//! - **Configuration** — the typed `Config` shared by every binary
//!
//! # Architecture
//!
//! This crate follows the hexagonal (ports & adapters) architecture
//! pattern. The domain module has no network or disk dependency of its
//! own; the ports it defines are implemented in `onedrivefs-remote` and
//! `onedrivefs-store` respectively.

pub mod config;
pub mod domain;
pub mod ports;
