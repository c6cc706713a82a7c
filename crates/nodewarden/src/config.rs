// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration for nodewarden.

use std::net::SocketAddr;
use std::time::Duration;

/// Default sidecar image when none is configured.
pub const DEFAULT_BS_IMAGE: &str = "tsuru/bs:v1";

/// Process configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// sqlx connection string for the state store
    pub database_url: String,
    /// Bind address for the HTTP API
    pub http_addr: SocketAddr,
    /// Public API endpoint handed to sidecars as `TSURU_ENDPOINT`
    pub host: String,
    /// Sidecar image used when bootstrapping the big-sibling container
    pub bs_image: String,
    /// Docker socket mounted into the sidecar, if any
    pub bs_socket: Option<String>,
    /// UDP port the sidecar listens on for syslog
    pub bs_syslog_port: u16,
    /// How long to wait for a new machine's Docker API
    pub docker_api_timeout: Duration,
    /// Fan-out bound for the node-container reconciler (None = node count)
    pub nodecontainer_max_workers: Option<usize>,
    /// Scheme used to address freshly created machines
    pub iaas_node_protocol: String,
    /// Docker port used to address freshly created machines
    pub iaas_node_port: u16,
    /// Registry endpoint for image pulls
    pub registry: Option<String>,
    /// Active monitoring tick
    pub monitoring_interval: Duration,
    /// Consecutive failures before a node is replaced
    pub failures_before_healing: u32,
    /// Temporary disable period after a node failure
    pub disabled_time: Duration,
    /// Deadline for the replacement machine to come up
    pub wait_new_time: Duration,
    /// Container healer threshold (None disables the container healer)
    pub container_max_unresponsive: Option<Duration>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: "sqlite:.data/nodewarden.db?mode=rwc".to_string(),
            http_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            host: "localhost:8080".to_string(),
            bs_image: DEFAULT_BS_IMAGE.to_string(),
            bs_socket: None,
            bs_syslog_port: 1514,
            docker_api_timeout: Duration::from_secs(600),
            nodecontainer_max_workers: None,
            iaas_node_protocol: "http".to_string(),
            iaas_node_port: 2375,
            registry: None,
            monitoring_interval: Duration::from_secs(30),
            failures_before_healing: 5,
            disabled_time: Duration::from_secs(30),
            wait_new_time: Duration::from_secs(300),
            container_max_unresponsive: None,
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let database_url =
            std::env::var("NODEWARDEN_DATABASE_URL").unwrap_or(defaults.database_url);

        let http_addr = match std::env::var("NODEWARDEN_HTTP_ADDR") {
            Ok(v) => v
                .parse()
                .map_err(|_| ConfigError::Invalid("NODEWARDEN_HTTP_ADDR", v))?,
            Err(_) => defaults.http_addr,
        };

        let host = std::env::var("NODEWARDEN_HOST").unwrap_or(defaults.host);

        let bs_image = std::env::var("NODEWARDEN_BS_IMAGE")
            .ok()
            .filter(|v| !v.is_empty())
            .unwrap_or(defaults.bs_image);

        let bs_socket = std::env::var("NODEWARDEN_BS_SOCKET")
            .ok()
            .filter(|v| !v.is_empty());

        let registry = std::env::var("NODEWARDEN_REGISTRY")
            .ok()
            .filter(|v| !v.is_empty());

        let iaas_node_protocol = std::env::var("NODEWARDEN_IAAS_NODE_PROTOCOL")
            .ok()
            .filter(|v| !v.is_empty())
            .unwrap_or(defaults.iaas_node_protocol);

        Ok(Self {
            database_url,
            http_addr,
            host,
            bs_image,
            bs_socket,
            bs_syslog_port: parse_var("NODEWARDEN_BS_SYSLOG_PORT")?
                .unwrap_or(defaults.bs_syslog_port),
            docker_api_timeout: parse_secs("NODEWARDEN_DOCKER_API_TIMEOUT")?
                .unwrap_or(defaults.docker_api_timeout),
            nodecontainer_max_workers: parse_var("NODEWARDEN_NODECONTAINER_MAX_WORKERS")?
                .filter(|n: &usize| *n > 0),
            iaas_node_protocol,
            iaas_node_port: parse_var("NODEWARDEN_IAAS_NODE_PORT")?
                .unwrap_or(defaults.iaas_node_port),
            registry,
            monitoring_interval: parse_secs("NODEWARDEN_MONITORING_INTERVAL")?
                .unwrap_or(defaults.monitoring_interval),
            failures_before_healing: parse_var("NODEWARDEN_FAILURES_BEFORE_HEALING")?
                .unwrap_or(defaults.failures_before_healing),
            disabled_time: parse_secs("NODEWARDEN_DISABLED_TIME")?
                .unwrap_or(defaults.disabled_time),
            wait_new_time: parse_secs("NODEWARDEN_WAIT_NEW_TIME")?
                .unwrap_or(defaults.wait_new_time),
            container_max_unresponsive: parse_secs("NODEWARDEN_CONTAINER_MAX_UNRESPONSIVE")?,
        })
    }
}

fn parse_var<T: std::str::FromStr>(name: &'static str) -> Result<Option<T>, ConfigError> {
    match std::env::var(name) {
        Ok(v) if v.is_empty() => Ok(None),
        Ok(v) => v
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Invalid(name, v)),
        Err(_) => Ok(None),
    }
}

fn parse_secs(name: &'static str) -> Result<Option<Duration>, ConfigError> {
    Ok(parse_var::<u64>(name)?.map(Duration::from_secs))
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A variable is present but cannot be parsed.
    #[error("Invalid value for {0}: {1:?}")]
    Invalid(&'static str, String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_documented_values() {
        let config = Config::default();
        assert_eq!(config.bs_image, "tsuru/bs:v1");
        assert_eq!(config.docker_api_timeout, Duration::from_secs(600));
        assert_eq!(config.iaas_node_port, 2375);
        assert_eq!(config.iaas_node_protocol, "http");
        assert!(config.nodecontainer_max_workers.is_none());
        assert!(config.container_max_unresponsive.is_none());
    }
}
