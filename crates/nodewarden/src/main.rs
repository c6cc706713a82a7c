// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! nodewarden - Docker fleet healer
//!
//! A service responsible for:
//! - Replacing failing nodes with fresh IaaS machines
//! - Moving unresponsive application containers
//! - Keeping node containers running on every node
//! - Serving the HTTP API for node agents and operators

use std::sync::Arc;
use tracing::{info, warn};

use nodewarden::config::Config;
use nodewarden::runtime::NodewardenRuntime;
use nodewarden::storage::{SqliteStorage, Stores};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "nodewarden=info".into()),
        )
        .init();

    // Load .env file if present
    if let Err(e) = dotenvy::dotenv() {
        warn!("No .env file loaded: {}", e);
    }

    let config = Config::from_env()?;

    info!(
        http_addr = %config.http_addr,
        host = %config.host,
        bs_image = %config.bs_image,
        "Starting nodewarden"
    );

    if let Some(path) = config
        .database_url
        .strip_prefix("sqlite:")
        .map(|rest| rest.split('?').next().unwrap_or_default())
        .filter(|p| !p.is_empty() && !p.starts_with(':'))
        && let Some(parent) = std::path::Path::new(path).parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)?;
    }

    let storage = SqliteStorage::connect(&config.database_url).await?;
    info!("Database schema verified");

    let http_addr = config.http_addr;
    let runtime = NodewardenRuntime::builder()
        .config(config)
        .stores(Stores::from_backend(Arc::new(storage)))
        .build()?
        .start()
        .await?;

    info!(addr = %http_addr, "nodewarden ready");

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    runtime.shutdown().await?;

    info!("nodewarden shut down");

    Ok(())
}
