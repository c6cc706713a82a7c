// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Big-sibling bootstrap.
//!
//! `big-sibling` is the node container that reports node status and
//! forwards logs. [`BsInitializer`] declares it once for the whole fleet,
//! and [`RunBsTask`] brings a freshly provisioned node into service.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use tracing::{debug, info};

use crate::auth::{AuthService, INTERNAL_APP_NAME};
use crate::cluster::Cluster;
use crate::config::Config;
use crate::docker::{HostConfig, MONITORING_TIMEOUT, RestartPolicy};
use crate::error::{Error, Result};
use crate::node::CreationStatus;
use crate::nodecontainer::{NodeContainerConfig, NodeContainerStore, Reconciler};
use crate::provisioner::LogBuffer;
use crate::queue::Task;

/// Name of the big-sibling node container.
pub const BS_CONTAINER_NAME: &str = "big-sibling";

/// Queue name of [`RunBsTask`].
pub const RUN_BS_TASK: &str = "run-bs";

const DOCKER_SOCKET_PATH: &str = "/var/run/docker.sock";
const PING_INTERVAL: Duration = Duration::from_secs(1);

/// Settings for the big-sibling definition.
#[derive(Debug, Clone)]
pub struct BsSettings {
    /// API endpoint the container reports to.
    pub api_host: String,
    /// Image to run.
    pub image: String,
    /// Host Docker socket to mount, if any.
    pub socket: Option<String>,
    /// Syslog port the container listens on.
    pub syslog_port: u16,
}

impl From<&Config> for BsSettings {
    fn from(config: &Config) -> Self {
        Self {
            api_host: config.host.clone(),
            image: config.bs_image.clone(),
            socket: config.bs_socket.clone(),
            syslog_port: config.bs_syslog_port,
        }
    }
}

/// Declares the big-sibling container.
pub struct BsInitializer {
    store: NodeContainerStore,
    auth: Arc<dyn AuthService>,
    settings: BsSettings,
}

impl BsInitializer {
    /// Initializer writing to `store`.
    pub fn new(store: NodeContainerStore, auth: Arc<dyn AuthService>, settings: BsSettings) -> Self {
        Self {
            store,
            auth,
            settings,
        }
    }

    async fn is_initialized(&self) -> Result<bool> {
        match self.store.load_node_container("", BS_CONTAINER_NAME).await {
            Ok(config) => Ok(!config.config.image.is_empty()),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Declare big-sibling unless it already exists.
    ///
    /// Concurrent callers race on the token field; only the winner writes
    /// the definition and returns true. Losers revoke the token they got.
    pub async fn initialize(&self) -> Result<bool> {
        if self.is_initialized().await? {
            return Ok(false);
        }
        let token = self.auth.login_app(INTERNAL_APP_NAME).await?;
        let token_env = format!("TSURU_TOKEN={}", token);
        let claimed = self
            .store
            .claim_field("", BS_CONTAINER_NAME, "config.env", json!([token_env]))
            .await?;
        if !claimed {
            debug!("big-sibling token already set, discarding ours");
            self.auth.logout(&token).await?;
            return Ok(false);
        }

        let config = self.definition(token_env);
        self.store.add_new_container("", &config).await?;
        info!(image = %config.config.image, "big-sibling node container declared");
        Ok(true)
    }

    fn definition(&self, token_env: String) -> NodeContainerConfig {
        let settings = &self.settings;
        let mut config = NodeContainerConfig::new(BS_CONTAINER_NAME, settings.image.clone());
        config.config.env = vec![
            token_env,
            format!("TSURU_ENDPOINT={}", api_endpoint(&settings.api_host)),
            "HOST_PROC=/prochost".to_string(),
            format!("SYSLOG_LISTEN_ADDRESS=udp://0.0.0.0:{}", settings.syslog_port),
        ];
        config.host_config = HostConfig {
            restart_policy: RestartPolicy::always(),
            privileged: true,
            network_mode: "host".to_string(),
            binds: vec!["/proc:/prochost:ro".to_string()],
            ..Default::default()
        };
        if let Some(socket) = settings.socket.as_deref().filter(|s| !s.is_empty()) {
            config
                .host_config
                .binds
                .push(format!("{}:{}:rw", socket, DOCKER_SOCKET_PATH));
            config
                .config
                .env
                .push(format!("DOCKER_ENDPOINT=unix://{}", DOCKER_SOCKET_PATH));
        }
        config
    }
}

/// API endpoint with a scheme and a trailing slash.
pub fn api_endpoint(host: &str) -> String {
    let mut endpoint = if host.contains("://") {
        host.to_string()
    } else {
        format!("http://{}", host)
    };
    if !endpoint.ends_with('/') {
        endpoint.push('/');
    }
    endpoint
}

/// Brings a newly created node into service: waits for its Docker API,
/// marks it created and starts every node container on it.
pub struct RunBsTask {
    cluster: Arc<Cluster>,
    reconciler: Arc<Reconciler>,
    api_timeout: Duration,
}

impl RunBsTask {
    /// Task giving each node `api_timeout` to answer.
    pub fn new(cluster: Arc<Cluster>, reconciler: Arc<Reconciler>, api_timeout: Duration) -> Self {
        Self {
            cluster,
            reconciler,
            api_timeout,
        }
    }

    async fn wait_docker(&self, endpoint: &str) -> Result<()> {
        let ping = async {
            loop {
                if let Ok(client) = self.cluster.client(endpoint, MONITORING_TIMEOUT) {
                    if client.ping().await.is_ok() {
                        return;
                    }
                }
                tokio::time::sleep(PING_INTERVAL).await;
            }
        };
        tokio::time::timeout(self.api_timeout, ping)
            .await
            .map_err(|_| {
                Error::Other(format!(
                    "Docker API at {:?} didn't respond after {} seconds",
                    endpoint,
                    self.api_timeout.as_secs()
                ))
            })
    }
}

#[async_trait]
impl Task for RunBsTask {
    fn name(&self) -> &str {
        RUN_BS_TASK
    }

    async fn run(&self, params: Value) -> Result<()> {
        let endpoint = params["endpoint"]
            .as_str()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| Error::Validation("missing endpoint".to_string()))?;
        self.cluster.registry().get(endpoint).await?;
        self.wait_docker(endpoint).await?;
        let node = self
            .cluster
            .registry()
            .set_creation_status(endpoint, CreationStatus::Created)
            .await?;
        info!(node = %endpoint, machine = %params["machine"], "Node is up, starting node containers");
        self.reconciler
            .ensure_containers_started(&LogBuffer::new(), true, &[], &[node])
            .await
    }
}
