//! onedrivefs daemon — composition root.
//!
//! Parses CLI flags, loads configuration, authenticates, wires the
//! `RemoteClient`/`Store` ports to the inode graph, starts the delta
//! loop and upload manager as background tasks, then mounts the FUSE
//! filesystem and blocks until unmount or Ctrl+C (§10.5).
//!
//! Interactive login (authorization-code/PKCE browser flow), D-Bus,
//! and systemd unit templating are out of scope (§1) — this binary
//! expects a token file already populated by some other means and is
//! meant to be invoked by a service manager or directly in a terminal.

use std::io::IsTerminal;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use onedrivefs_core::config::Config;
use onedrivefs_core::domain::RemoteId;
use onedrivefs_fuse::{InodeGraph, OneDriveFs, OnlineFlag, WriteSerializer, ROOT_REMOTE_ID};
use onedrivefs_remote::auth::{FileTokenStorage, OAuth2Config, TokenRefresher};
use onedrivefs_remote::client::GraphClient;
use onedrivefs_remote::rate_limit::{AdaptiveRateLimiter, RateLimitConfig};
use onedrivefs_remote::remote_client::GraphRemoteClient;
use onedrivefs_store::{DatabasePool, SqliteStore};
use onedrivefs_sync::{DeltaLoop, UploadManager};

/// Mount the onedrivefs filesystem.
#[derive(Debug, Parser)]
#[command(name = "onedrivefsd", about = "OneDrive FUSE filesystem daemon")]
struct Cli {
    /// Override the configured mount point.
    #[arg(long, value_name = "PATH")]
    mount_point: Option<PathBuf>,

    /// Path to the configuration file.
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Run attached to the terminal; Ctrl+C unmounts and exits. Without
    /// this flag the daemon still runs in the foreground (process
    /// daemonization is left to the service manager) but expects no
    /// interactive signal besides Ctrl+C or SIGTERM.
    #[arg(long)]
    foreground: bool,
}

fn init_tracing(config: &Config) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.logging.level.clone()));

    let human_readable = !config.logging.json && std::io::stdout().is_terminal();

    let subscriber = tracing_subscriber::fmt().with_env_filter(filter);
    if human_readable {
        subscriber.init();
    } else {
        subscriber.json().init();
    }
}

fn token_path(cache_dir: &std::path::Path) -> PathBuf {
    cache_dir.join("tokens.json")
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config_path = cli.config.clone().unwrap_or_else(Config::default_path);
    let mut config = Config::load_or_default(&config_path);
    if let Some(mount_point) = cli.mount_point.clone() {
        config.fuse.mount_point = mount_point;
    }

    init_tracing(&config);

    let errors = config.validate();
    if !errors.is_empty() {
        for err in &errors {
            tracing::error!(%err, "invalid configuration");
        }
        bail!("configuration at {} is invalid", config_path.display());
    }

    info!(config_path = %config_path.display(), mount_point = %config.fuse.mount_point.display(), "loaded configuration");

    std::fs::create_dir_all(&config.fuse.cache_dir)
        .context("failed to create cache directory")?;
    if !config.fuse.mount_point.exists() {
        std::fs::create_dir_all(&config.fuse.mount_point)
            .context("failed to create mount point directory")?;
    }

    // --- authentication ---

    let app_id = config
        .auth
        .app_id
        .clone()
        .context("auth.app_id is not set in configuration; register an Azure AD app and set it")?;
    let oauth_config = if config.auth.scopes.is_empty() {
        OAuth2Config::new(app_id)
    } else {
        OAuth2Config::new(app_id).with_scopes(config.auth.scopes.clone())
    };

    let token_path = token_path(&config.fuse.cache_dir);
    let stored_tokens = FileTokenStorage::load(&token_path)
        .context("failed to read token file")?
        .context(
            "no token file found; authenticate out-of-band and place the tokens at the \
             configured cache directory before starting the daemon",
        )?;

    let refresher = TokenRefresher::new(&oauth_config)?;
    let tokens = if stored_tokens.is_expired() {
        info!("stored access token is expired, refreshing");
        let refresh_token = stored_tokens
            .refresh_token
            .as_deref()
            .context("stored tokens have no refresh token")?;
        let refreshed = refresher.refresh(refresh_token).await?;
        FileTokenStorage::store(&token_path, &refreshed)?;
        refreshed
    } else {
        stored_tokens
    };

    // --- rate-limited Graph client ---

    let rate_limit_config = RateLimitConfig {
        default_capacity: config.rate_limiting.metadata_requests_per_minute,
        default_refill_rate: config.rate_limiting.metadata_requests_per_minute as f64 / 60.0,
        endpoint_overrides: Default::default(),
        max_retries: 5,
    };
    let rate_limiter = Arc::new(AdaptiveRateLimiter::new(rate_limit_config));

    let graph_client =
        GraphClient::new(tokens.access_token.clone()).with_rate_limiter(rate_limiter);
    let remote: Arc<dyn onedrivefs_core::ports::RemoteClient> = Arc::new(GraphRemoteClient::new(
        graph_client,
        &oauth_config,
        tokens.refresh_token.clone(),
    )?);

    // --- persistent store ---

    let db_path = config.fuse.cache_dir.join("onedrivefs.db");
    let pool = DatabasePool::new(&db_path)
        .await
        .context("failed to open database")?;
    let store: Arc<dyn onedrivefs_core::ports::Store> =
        Arc::new(SqliteStore::new(pool.pool().clone()));

    // --- offline boot guard (§4.3) ---

    let online = match remote.get_quota().await {
        Ok(_) => true,
        Err(err) => {
            warn!(error = %err, "could not reach the remote at startup, starting offline");
            false
        }
    };
    if !online && store.get_delta_cursor().await?.is_none() {
        bail!(
            "offline on a fresh install with no prior delta cursor; refusing to present an \
             empty tree as authoritative. Start once while online to establish a baseline"
        );
    }
    let online_flag = OnlineFlag::new(online);

    // --- inode graph ---

    let graph = Arc::new(InodeGraph::new(store.clone()));
    graph.load_all().await?;
    let root_id = RemoteId::new(ROOT_REMOTE_ID.to_string())?;
    if online {
        graph.ensure_root(remote.as_ref(), &root_id).await?;
    }

    // --- write serializer, upload channel ---

    let (write_serializer, write_handle) = WriteSerializer::new(store.clone());
    tokio::spawn(write_serializer.run());

    let (upload_tx, upload_rx) = tokio::sync::mpsc::unbounded_channel();

    let upload_manager = UploadManager::new(
        remote.clone(),
        store.clone(),
        graph.clone(),
        write_handle.clone(),
        upload_rx,
    );
    upload_manager.resume().await?;
    tokio::spawn(upload_manager.run());

    let delta_loop = DeltaLoop::new(
        remote.clone(),
        store.clone(),
        graph.clone(),
        write_handle.clone(),
        online_flag.clone(),
    );
    tokio::spawn(delta_loop.run());

    // --- mount ---

    let rt_handle = tokio::runtime::Handle::current();
    let fs = OneDriveFs::new(
        rt_handle,
        graph,
        remote,
        store,
        write_handle,
        upload_tx,
        online_flag,
    );

    let mount_options = vec![
        fuser::MountOption::FSName("onedrivefs".to_string()),
        fuser::MountOption::AutoUnmount,
        fuser::MountOption::DefaultPermissions,
    ];

    info!(mount_point = %config.fuse.mount_point.display(), "mounting filesystem");
    let session = fuser::spawn_mount2(fs, &config.fuse.mount_point, &mount_options)
        .context("failed to mount FUSE filesystem")?;

    if cli.foreground {
        info!("running in foreground; press Ctrl+C to unmount and exit");
    }

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl+C")?;

    info!("received shutdown signal, unmounting");
    session.join();

    Ok(())
}
