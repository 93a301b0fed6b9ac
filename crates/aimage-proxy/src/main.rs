//! aimage proxy - serves images through the two-tier image loader
//!
//! Every image is fetched at most once concurrently, kept in memory and in
//! a journal-indexed disk cache, and served from there afterwards.

mod error;
mod server;
mod types;

use crate::error::{ProxyError, Result};
use crate::server::{start_server, ServerState, SharedState};
use crate::types::ProxyConfig;
use aimage::{HttpTransport, InlineNotifier, Loader, LoaderConfig, RawDecoder};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    let env_filter = EnvFilter::from_default_env()
        .add_directive("aimage=info".parse()?)
        .add_directive("aimage_proxy=info".parse()?);

    // Use JSON format for GCP Cloud Logging when LOG_FORMAT=json
    if std::env::var("LOG_FORMAT")
        .map(|v| v == "json")
        .unwrap_or(false)
    {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_stackdriver::layer())
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(env_filter).init();
    };

    info!("Starting aimage proxy...");

    let config = load_config();
    info!("Port: {}", config.port);
    info!("Cache dir: {:?}", config.loader.cache_dir);
    info!("Pool size: {}", config.loader.pool_size);
    info!(
        "Disk cache size: {} MB",
        config.loader.disk_max_size / (1024 * 1024)
    );
    info!("Load timeout: {:?}", config.loader.load_timeout);

    let transport = HttpTransport::with_timeout(config.loader.load_timeout)?;
    let loader = Loader::open(
        config.loader,
        Arc::new(transport),
        RawDecoder,
        Arc::new(InlineNotifier),
    )
    .await?;

    let state: SharedState = Arc::new(ServerState::new(loader));

    // Start HTTP server (blocking)
    let served = start_server(Arc::clone(&state), config.port)
        .await
        .map_err(|e| ProxyError::Config(format!("Server error: {}", e)));

    if let Err(e) = state.loader.flush().await {
        warn!(error = %e, "Disk cache flush did not finish");
    }
    served
}

fn load_config() -> ProxyConfig {
    let port = std::env::var("PORT")
        .ok()
        .and_then(|s| s.parse::<u16>().ok())
        .unwrap_or(3001);

    ProxyConfig {
        port,
        loader: LoaderConfig::from_env(),
    }
}
