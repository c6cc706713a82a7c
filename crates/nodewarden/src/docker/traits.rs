// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Docker client trait definitions.
//!
//! Defines the per-node engine interface and the container/host config
//! types shared by the reconciler and the cluster facade.

use std::collections::BTreeMap;
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::scopedconfig::{Merge, MergeOptions, merge_field};

/// Timeout for monitoring pings.
pub const MONITORING_TIMEOUT: Duration = Duration::from_secs(5);

/// Timeout for client calls made while healing.
pub const HEALER_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Errors from engine calls.
#[derive(Debug, Clone, Error)]
#[non_exhaustive]
pub enum DockerError {
    /// Container does not exist.
    #[error("No such container: {0}")]
    NoSuchContainer(String),

    /// Image does not exist.
    #[error("No such image: {0}")]
    NoSuchImage(String),

    /// Start requested on a running container.
    #[error("Container already running: {0}")]
    AlreadyRunning(String),

    /// Stop requested on a stopped container.
    #[error("Container not running: {0}")]
    NotRunning(String),

    /// Create requested with a name already in use.
    #[error("container already exists")]
    AlreadyExists(String),

    /// Engine refused the connection.
    #[error("cannot connect to Docker endpoint {0}: connection refused")]
    ConnectionRefused(String),

    /// Transport failure.
    #[error("Network error: {0}")]
    Network(String),

    /// Call did not finish in time.
    #[error("Timeout talking to {0}")]
    Timeout(String),

    /// Any other engine reply.
    #[error("Docker API error ({status}): {message}")]
    Api {
        /// HTTP status.
        status: u16,
        /// Engine message.
        message: String,
    },
}

impl DockerError {
    /// Whether the target container or image is absent.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            DockerError::NoSuchContainer(_) | DockerError::NoSuchImage(_)
        )
    }

    /// Whether the error comes from the transport rather than the engine.
    pub fn is_network(&self) -> bool {
        matches!(
            self,
            DockerError::ConnectionRefused(_) | DockerError::Network(_) | DockerError::Timeout(_)
        )
    }
}

/// Result type for engine calls.
pub type DockerResult<T> = std::result::Result<T, DockerError>;

/// Container restart policy.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RestartPolicy {
    /// `no`, `always`, `unless-stopped` or `on-failure`.
    #[serde(default)]
    pub name: String,
    /// Retries for `on-failure`.
    #[serde(default)]
    pub maximum_retry_count: i64,
}

impl RestartPolicy {
    /// `always`.
    pub fn always() -> Self {
        Self {
            name: "always".to_string(),
            maximum_retry_count: 0,
        }
    }
}

impl Merge for RestartPolicy {
    fn is_empty_value(&self, opts: &MergeOptions) -> bool {
        !opts.allow_empty && self.name.is_empty()
    }
}

/// Logging driver configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogConfig {
    /// Driver name.
    #[serde(default, rename = "type")]
    pub kind: String,
    /// Driver options.
    #[serde(default)]
    pub config: BTreeMap<String, String>,
}

impl Merge for LogConfig {
    fn is_empty_value(&self, opts: &MergeOptions) -> bool {
        !opts.allow_empty && self.kind.is_empty() && self.config.is_empty()
    }

    fn merge_from(&mut self, over: &Self, opts: &MergeOptions) -> bool {
        let kind = merge_field(&mut self.kind, &over.kind, opts);
        let config = self.config.merge_from(&over.config, opts);
        kind || config
    }
}

/// Host side of a published port.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortBinding {
    /// Host interface.
    #[serde(default)]
    pub host_ip: String,
    /// Host port.
    #[serde(default)]
    pub host_port: String,
}

impl Merge for BTreeMap<String, Vec<PortBinding>> {
    fn is_empty_value(&self, _opts: &MergeOptions) -> bool {
        self.is_empty()
    }

    fn merge_from(&mut self, over: &Self, _opts: &MergeOptions) -> bool {
        for (port, bindings) in over {
            if bindings.is_empty() {
                self.remove(port);
            } else {
                self.insert(port.clone(), bindings.clone());
            }
        }
        !over.is_empty()
    }
}

/// Process-level container configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerConfig {
    /// Image reference.
    #[serde(default)]
    pub image: String,
    /// `KEY=value` environment entries.
    #[serde(default)]
    pub env: Vec<String>,
    /// Command.
    #[serde(default)]
    pub cmd: Vec<String>,
    /// Entrypoint.
    #[serde(default)]
    pub entrypoint: Vec<String>,
    /// Labels.
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    /// Exposed ports such as `8080/tcp`.
    #[serde(default)]
    pub exposed_ports: Vec<String>,
    /// User.
    #[serde(default)]
    pub user: String,
    /// Working directory.
    #[serde(default)]
    pub working_dir: String,
}

impl Merge for ContainerConfig {
    fn is_empty_value(&self, opts: &MergeOptions) -> bool {
        !opts.allow_empty && *self == ContainerConfig::default()
    }

    fn merge_from(&mut self, over: &Self, opts: &MergeOptions) -> bool {
        let mut merged = merge_field(&mut self.image, &over.image, opts);
        merged |= self.env.merge_from(&over.env, opts);
        if opts.slice_add {
            self.env = dedup_env(&self.env, opts.allow_map_empty);
        }
        merged |= merge_field(&mut self.cmd, &over.cmd, opts);
        merged |= merge_field(&mut self.entrypoint, &over.entrypoint, opts);
        merged |= self.labels.merge_from(&over.labels, opts);
        merged |= merge_field(&mut self.exposed_ports, &over.exposed_ports, opts);
        merged |= merge_field(&mut self.user, &over.user, opts);
        merged |= merge_field(&mut self.working_dir, &over.working_dir, opts);
        merged
    }
}

/// Collapse `KEY=value` entries so each key appears once, at its first
/// position, with its last value. Entries with an empty value are dropped
/// unless `keep_empty`.
pub fn dedup_env(env: &[String], keep_empty: bool) -> Vec<String> {
    let mut order: Vec<&str> = Vec::new();
    let mut values: BTreeMap<&str, &String> = BTreeMap::new();
    for entry in env {
        let key = entry.split_once('=').map(|(k, _)| k).unwrap_or(entry);
        if values.insert(key, entry).is_none() {
            order.push(key);
        }
    }
    order
        .into_iter()
        .filter_map(|key| values.get(key).copied())
        .filter(|entry| {
            keep_empty || entry.split_once('=').is_some_and(|(_, v)| !v.is_empty())
        })
        .cloned()
        .collect()
}

/// Host-level container configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostConfig {
    /// Bind mounts, `src:dst[:mode]`.
    #[serde(default)]
    pub binds: Vec<String>,
    /// Published ports.
    #[serde(default)]
    pub port_bindings: BTreeMap<String, Vec<PortBinding>>,
    /// Restart policy.
    #[serde(default)]
    pub restart_policy: RestartPolicy,
    /// Privileged mode.
    #[serde(default)]
    pub privileged: bool,
    /// Network mode.
    #[serde(default)]
    pub network_mode: String,
    /// PID namespace mode.
    #[serde(default)]
    pub pid_mode: String,
    /// Logging driver.
    #[serde(default)]
    pub log_config: LogConfig,
}

impl Merge for HostConfig {
    fn is_empty_value(&self, opts: &MergeOptions) -> bool {
        !opts.allow_empty && *self == HostConfig::default()
    }

    fn merge_from(&mut self, over: &Self, opts: &MergeOptions) -> bool {
        let mut merged = merge_field(&mut self.binds, &over.binds, opts);
        merged |= self.port_bindings.merge_from(&over.port_bindings, opts);
        merged |= merge_field(&mut self.restart_policy, &over.restart_policy, opts);
        merged |= merge_field(&mut self.privileged, &over.privileged, opts);
        merged |= merge_field(&mut self.network_mode, &over.network_mode, opts);
        merged |= merge_field(&mut self.pid_mode, &over.pid_mode, opts);
        merged |= self.log_config.merge_from(&over.log_config, opts);
        merged
    }
}

/// Parameters for container creation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CreateContainerOptions {
    /// Container name; empty lets the engine pick one.
    pub name: String,
    /// Process config.
    pub config: ContainerConfig,
    /// Host config.
    pub host_config: HostConfig,
}

/// Parameters for an image pull.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PullOptions {
    /// Repository, possibly with registry and digest.
    pub repository: String,
    /// Tag; empty for digest references.
    pub tag: String,
}

impl PullOptions {
    /// Pull options for a full image reference.
    pub fn for_image(image: &str) -> Self {
        let (repository, tag) = parse_image(image);
        Self { repository, tag }
    }

    /// Reference as passed to the engine.
    pub fn reference(&self) -> String {
        if self.tag.is_empty() {
            self.repository.clone()
        } else {
            format!("{}:{}", self.repository, self.tag)
        }
    }
}

/// Registry credentials.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryAuth {
    /// User name.
    pub username: String,
    /// Password.
    pub password: String,
    /// Registry address.
    pub server_address: String,
}

/// Runtime state of a container.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerInspect {
    /// Container id.
    pub id: String,
    /// Container name, without the leading `/`.
    pub name: String,
    /// Image reference.
    pub image: String,
    /// Process is running.
    pub running: bool,
    /// Engine is restarting the container.
    pub restarting: bool,
    /// Container is dead.
    pub dead: bool,
    /// Removal is in progress.
    pub removal_in_progress: bool,
}

/// Entry of a container listing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerSummary {
    /// Container id.
    pub id: String,
    /// Names, without the leading `/`.
    pub names: Vec<String>,
    /// Image reference.
    pub image: String,
    /// Engine state name.
    pub state: String,
    /// Labels.
    pub labels: BTreeMap<String, String>,
}

/// Engine API of one node.
#[async_trait]
pub trait DockerClient: Send + Sync {
    /// Endpoint URL this client talks to.
    fn endpoint(&self) -> &str;

    /// Check the engine answers.
    async fn ping(&self) -> DockerResult<()>;

    /// Pull an image, returning the progress output one status per line.
    async fn pull_image(&self, opts: &PullOptions, auth: Option<&RegistryAuth>) -> DockerResult<String>;

    /// Create a container, returning its id.
    async fn create_container(&self, opts: &CreateContainerOptions) -> DockerResult<String>;

    /// Start a container.
    async fn start_container(&self, id: &str) -> DockerResult<()>;

    /// Stop a container, waiting `grace` before killing it.
    async fn stop_container(&self, id: &str, grace: Duration) -> DockerResult<()>;

    /// Remove a container.
    async fn remove_container(&self, id: &str, force: bool) -> DockerResult<()>;

    /// Inspect a container.
    async fn inspect_container(&self, id: &str) -> DockerResult<ContainerInspect>;

    /// List every container, running or not.
    async fn list_containers(&self) -> DockerResult<Vec<ContainerSummary>>;
}

/// Factory for per-node clients.
pub trait DockerConnector: Send + Sync {
    /// Client for `endpoint` whose calls give up after `timeout`.
    fn connect(&self, endpoint: &str, timeout: Duration) -> DockerResult<Arc<dyn DockerClient>>;
}

static DIGEST_RE: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"(?m)^Digest: (.*)$").ok());

/// Extract the digest reported by a pull.
pub fn parse_digest(pull_output: &str) -> Option<String> {
    DIGEST_RE
        .as_ref()?
        .captures(pull_output)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim().to_string())
        .filter(|d| !d.is_empty())
}

/// Split an image reference into repository and tag.
///
/// Digest references are returned whole with an empty tag. A missing tag
/// becomes `latest`.
pub fn parse_image(image: &str) -> (String, String) {
    if image.contains('@') {
        return (image.to_string(), String::new());
    }
    let last_segment_start = image.rfind('/').map(|i| i + 1).unwrap_or(0);
    match image[last_segment_start..].rfind(':') {
        Some(i) => {
            let split = last_segment_start + i;
            (image[..split].to_string(), image[split + 1..].to_string())
        }
        None => (image.to_string(), "latest".to_string()),
    }
}

/// Whether a pulled image should be pinned to its digest: only references
/// whose last path segment carries no tag.
pub fn should_pin_image(image: &str) -> bool {
    let last = image.rsplit('/').next().unwrap_or(image);
    !last.contains(':')
}

/// Whether the reference names an explicit registry (`host.tld/...`,
/// `host:port/...` or `localhost/...`).
pub fn has_explicit_registry(image: &str) -> bool {
    match image.split_once('/') {
        Some((first, _)) => first.contains('.') || first.contains(':') || first == "localhost",
        None => false,
    }
}
