//! onedrivefs-remote — Microsoft Graph API client
//!
//! Implements `onedrivefs_core::ports::RemoteClient` against the Microsoft
//! Graph REST API:
//!
//! - OAuth2 token refresh (Authorization Code with PKCE, refresh leg only)
//! - OneDrive file and folder operations
//! - Delta queries for incremental synchronization
//! - Small and chunked large-file upload
//!
//! ## Modules
//!
//! - [`auth`] - OAuth2 token refresh and on-disk token storage
//! - [`client`] - Microsoft Graph API HTTP client plumbing and retry
//! - [`delta`] - delta queries for incremental synchronization
//! - [`upload`] - file upload operations (small and large/chunked)
//! - [`rate_limit`] - adaptive per-endpoint throttling
//! - [`remote_client`] - the `RemoteClient` port implementation

pub mod auth;
pub mod client;
pub mod delta;
pub mod rate_limit;
pub mod remote_client;
pub mod upload;

use std::time::Duration;
use thiserror::Error;

/// Errors that can occur when communicating with the Microsoft Graph API.
///
/// Maps onto the transport/auth/server/client buckets of the error
/// classification at the filesystem boundary.
#[derive(Debug, Error)]
pub enum GraphError {
    /// Authentication credentials are invalid or expired
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Insufficient permissions for the requested operation
    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// The requested resource does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// A conflict was detected (e.g., concurrent modification, name collision)
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Rate limit exceeded; retry after the specified duration
    #[error("Too many requests, retry after {retry_after:?}")]
    TooManyRequests {
        /// Duration to wait before retrying
        retry_after: Duration,
    },

    /// A server-side error occurred (5xx)
    #[error("Server error: {0}")]
    ServerError(String),

    /// A network-level error occurred
    #[error("Network error: {0}")]
    NetworkError(#[from] reqwest::Error),

    /// The OAuth2 token has expired and must be refreshed
    #[error("Token expired")]
    TokenExpired,

    /// The API response could not be parsed or was malformed
    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}
