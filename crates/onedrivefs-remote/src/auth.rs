//! OAuth2 token refresh for Microsoft Graph API
//!
//! Interactive login (the Authorization Code + PKCE browser flow) happens
//! once, outside this crate, and is out of scope here. What this module
//! owns is what the daemon needs at every subsequent start: refreshing an
//! expired access token from a stored refresh token, and keeping that
//! refresh token on disk between runs.
//!
//! ## Components
//!
//! - [`OAuth2Config`] - configuration for the token endpoint
//! - [`FileTokenStorage`] - token persistence in a `0600` file
//! - [`TokenRefresher`] - wraps the `oauth2` crate's refresh-token grant

use std::io::Write as _;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{Duration, Utc};
use onedrivefs_core::ports::Tokens;
use oauth2::{
    basic::BasicClient, ClientId, EndpointNotSet, EndpointSet, RefreshToken, TokenResponse,
    TokenUrl,
};
use tracing::{debug, info};

/// Default Microsoft OAuth2 token endpoint (consumers tenant).
const TOKEN_URL: &str = "https://login.microsoftonline.com/consumers/oauth2/v2.0/token";

/// Default OAuth2 scopes for OneDrive access.
const DEFAULT_SCOPES: &[&str] = &["Files.ReadWrite.All", "User.Read", "offline_access"];

// ============================================================================
// OAuth2Config
// ============================================================================

/// Configuration for the OAuth2 token refresh flow.
#[derive(Debug, Clone)]
pub struct OAuth2Config {
    /// Application (client) ID from the Azure AD app registration.
    pub app_id: String,
    /// OAuth scopes associated with the stored refresh token.
    pub scopes: Vec<String>,
}

impl OAuth2Config {
    pub fn new(app_id: impl Into<String>) -> Self {
        Self {
            app_id: app_id.into(),
            scopes: DEFAULT_SCOPES.iter().map(|s| s.to_string()).collect(),
        }
    }

    pub fn with_scopes(mut self, scopes: Vec<String>) -> Self {
        self.scopes = scopes;
        self
    }
}

// ============================================================================
// FileTokenStorage
// ============================================================================

/// Reads and writes OAuth tokens from a companion token file (§6).
///
/// The file is JSON-serialized [`Tokens`], created with `0600` permissions
/// so it is readable only by the owning user. No OS keyring is involved —
/// the daemon is expected to run unattended (as a systemd user service)
/// where a keyring session may not be unlocked.
pub struct FileTokenStorage;

impl FileTokenStorage {
    /// Writes tokens to `path`, creating the file with `0600` permissions if
    /// it does not already exist.
    pub fn store(path: &Path, tokens: &Tokens) -> Result<()> {
        let json = serde_json::to_string_pretty(tokens).context("Failed to serialize tokens")?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create token file directory")?;
        }

        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            let mut file = std::fs::OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .mode(0o600)
                .open(path)
                .context("Failed to open token file")?;
            file.write_all(json.as_bytes())
                .context("Failed to write token file")?;
        }
        #[cfg(not(unix))]
        {
            std::fs::write(path, json.as_bytes()).context("Failed to write token file")?;
        }

        debug!(path = %path.display(), "Stored tokens");
        Ok(())
    }

    /// Loads tokens from `path`. Returns `Ok(None)` if the file does not
    /// exist yet (first run, not yet authenticated).
    pub fn load(path: &Path) -> Result<Option<Tokens>> {
        match std::fs::read_to_string(path) {
            Ok(content) => {
                let tokens: Tokens =
                    serde_json::from_str(&content).context("Failed to deserialize token file")?;
                debug!(path = %path.display(), "Loaded tokens");
                Ok(Some(tokens))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).context("Failed to read token file"),
        }
    }

    /// Removes the token file, if present.
    pub fn clear(path: &Path) -> Result<()> {
        match std::fs::remove_file(path) {
            Ok(()) => {
                info!(path = %path.display(), "Cleared token file");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).context("Failed to remove token file"),
        }
    }
}

// ============================================================================
// TokenRefresher
// ============================================================================

/// Performs the OAuth2 refresh-token grant against Microsoft identity
/// platform using the `oauth2` crate.
pub struct TokenRefresher {
    client: BasicClient<EndpointNotSet, EndpointNotSet, EndpointNotSet, EndpointNotSet, EndpointSet>,
}

impl TokenRefresher {
    pub fn new(config: &OAuth2Config) -> Result<Self> {
        let client = BasicClient::new(ClientId::new(config.app_id.clone()))
            .set_token_uri(TokenUrl::new(TOKEN_URL.to_string()).context("Invalid token URL")?);

        Ok(Self { client })
    }

    /// Exchanges a refresh token for a new access token. Microsoft may
    /// rotate the refresh token on each call; the caller must persist
    /// whatever comes back, not just the access token.
    pub async fn refresh(&self, refresh_token: &str) -> Result<Tokens> {
        info!("Refreshing access token");

        let http_client = reqwest::Client::new();
        let token_result = self
            .client
            .exchange_refresh_token(&RefreshToken::new(refresh_token.to_string()))
            .request_async(&http_client)
            .await
            .context("Failed to refresh token")?;

        let expires_at = token_result
            .expires_in()
            .map(|d| Utc::now() + Duration::seconds(d.as_secs() as i64))
            .unwrap_or_else(|| Utc::now() + Duration::hours(1));

        let tokens = Tokens {
            access_token: token_result.access_token().secret().to_string(),
            refresh_token: token_result
                .refresh_token()
                .map(|t| t.secret().to_string())
                .or_else(|| Some(refresh_token.to_string())),
            expires_at,
        };

        info!("Successfully refreshed access token");
        Ok(tokens)
    }
}
