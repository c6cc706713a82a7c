// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embeddable runtime for nodewarden.
//!
//! [`NodewardenRuntime`] wires every component together and runs the
//! background loops inside an existing tokio application.
//!
//! ```rust,ignore
//! use nodewarden::config::Config;
//! use nodewarden::runtime::NodewardenRuntime;
//! use nodewarden::storage::{SqliteStorage, Stores};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::from_env()?;
//!     let storage = SqliteStorage::connect(&config.database_url).await?;
//!
//!     let runtime = NodewardenRuntime::builder()
//!         .config(config)
//!         .stores(Stores::from_backend(std::sync::Arc::new(storage)))
//!         .build()?
//!         .start()
//!         .await?;
//!
//!     // ... run your application ...
//!
//!     runtime.shutdown().await?;
//!     Ok(())
//! }
//! ```

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::api::{self, ApiState};
use crate::auth::{AuthService, LocalAuth};
use crate::bs::{BsInitializer, BsSettings, RunBsTask};
use crate::cluster::Cluster;
use crate::config::Config;
use crate::docker::{DockerConnector, EngineConnector, RegistryAuth};
use crate::error::{Error, Result};
use crate::events::EventJournal;
use crate::healer::{ContainerHealer, ContainerHealerConfig, NodeHealer, NodeHealerSettings};
use crate::iaas::{IaasProvider, IaasRegistry};
use crate::nodecontainer::{NodeContainerStore, Reconciler};
use crate::provisioner::Provisioner;
use crate::queue::TaskQueue;
use crate::registry::{HealerPolicy, HookEvent, NodeRegistry};
use crate::storage::Stores;

/// Builder for a [`NodewardenRuntime`].
pub struct NodewardenRuntimeBuilder {
    config: Config,
    stores: Option<Stores>,
    docker: Option<Arc<dyn DockerConnector>>,
    auth: Option<Arc<dyn AuthService>>,
    iaas_providers: Vec<(String, Arc<dyn IaasProvider>)>,
    default_iaas: Option<String>,
    serve_http: bool,
}

impl Default for NodewardenRuntimeBuilder {
    fn default() -> Self {
        Self {
            config: Config::default(),
            stores: None,
            docker: None,
            auth: None,
            iaas_providers: Vec::new(),
            default_iaas: None,
            serve_http: true,
        }
    }
}

impl NodewardenRuntimeBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Process configuration.
    ///
    /// Default: [`Config::default()`]
    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    /// State stores (required).
    pub fn stores(mut self, stores: Stores) -> Self {
        self.stores = Some(stores);
        self
    }

    /// Docker client factory.
    ///
    /// Default: [`EngineConnector`]
    pub fn docker(mut self, docker: Arc<dyn DockerConnector>) -> Self {
        self.docker = Some(docker);
        self
    }

    /// Token issuer for the big-sibling container.
    ///
    /// Default: [`LocalAuth`]
    pub fn auth(mut self, auth: Arc<dyn AuthService>) -> Self {
        self.auth = Some(auth);
        self
    }

    /// Register an IaaS provider. Without any, failing nodes are never
    /// replaced.
    pub fn iaas_provider(mut self, name: impl Into<String>, provider: Arc<dyn IaasProvider>) -> Self {
        self.iaas_providers.push((name.into(), provider));
        self
    }

    /// Provider used for nodes with no `iaas` metadata.
    pub fn default_iaas(mut self, name: impl Into<String>) -> Self {
        self.default_iaas = Some(name.into());
        self
    }

    /// Whether to bind the HTTP API.
    ///
    /// Default: `true`
    pub fn serve_http(mut self, serve: bool) -> Self {
        self.serve_http = serve;
        self
    }

    /// Validate the builder.
    pub fn build(self) -> Result<NodewardenRuntimeConfig> {
        let stores = self
            .stores
            .ok_or_else(|| Error::Other("stores are required".to_string()))?;
        if let Some(name) = &self.default_iaas
            && !self.iaas_providers.iter().any(|(n, _)| n == name)
        {
            return Err(Error::Validation(format!(
                "default iaas {:?} is not registered",
                name
            )));
        }

        Ok(NodewardenRuntimeConfig {
            config: self.config,
            stores,
            docker: self.docker.unwrap_or_else(|| Arc::new(EngineConnector)),
            auth: self.auth.unwrap_or_else(|| Arc::new(LocalAuth::new())),
            iaas_providers: self.iaas_providers,
            default_iaas: self.default_iaas,
            serve_http: self.serve_http,
        })
    }
}

/// Validated runtime configuration.
pub struct NodewardenRuntimeConfig {
    config: Config,
    stores: Stores,
    docker: Arc<dyn DockerConnector>,
    auth: Arc<dyn AuthService>,
    iaas_providers: Vec<(String, Arc<dyn IaasProvider>)>,
    default_iaas: Option<String>,
    serve_http: bool,
}

impl NodewardenRuntimeConfig {
    /// Wire the components and spawn the background loops.
    pub async fn start(self) -> Result<NodewardenRuntime> {
        let config = self.config;
        let stores = self.stores;
        let registry_auth = config.registry.as_ref().map(|server| RegistryAuth {
            server_address: server.clone(),
            ..Default::default()
        });

        let registry = Arc::new(NodeRegistry::new(stores.nodes.clone()));
        let cluster = Arc::new(Cluster::new(registry.clone(), &stores, self.docker));
        let provisioner = Arc::new(
            Provisioner::new(cluster.clone(), stores.containers.clone())
                .with_registry_auth(registry_auth.clone()),
        );
        let journal = EventJournal::new(stores.events.clone());

        let node_containers = NodeContainerStore::new(stores.scoped.clone());
        let reconciler = Arc::new(
            Reconciler::new(cluster.clone(), node_containers.clone())
                .with_max_workers(config.nodecontainer_max_workers)
                .with_registry_auth(registry_auth),
        );
        cluster
            .add_hook(HookEvent::BeforeContainerCreate, reconciler.clone())
            .await;

        let queue = Arc::new(TaskQueue::new());
        queue
            .register(Arc::new(RunBsTask::new(
                cluster.clone(),
                reconciler.clone(),
                config.docker_api_timeout,
            )))
            .await;

        let mut node_healer = NodeHealer::new(
            provisioner.clone(),
            journal.clone(),
            queue,
            &stores,
            NodeHealerSettings {
                poll_interval: config.monitoring_interval,
                ..NodeHealerSettings::from(&config)
            },
        );
        if !self.iaas_providers.is_empty() {
            let mut iaas = IaasRegistry::new(stores.machines.clone());
            for (name, provider) in self.iaas_providers {
                iaas.register(&name, provider);
            }
            if let Some(name) = &self.default_iaas {
                iaas.set_default(name);
            }
            node_healer = node_healer.with_iaas(Arc::new(iaas));
        }
        let node_healer = Arc::new(node_healer);
        let policy: Arc<dyn HealerPolicy> = node_healer.clone();
        registry.set_healer(&policy).await;

        let bs = BsInitializer::new(node_containers, self.auth, BsSettings::from(&config));
        if let Err(e) = bs.initialize().await {
            warn!(error = %e, "Failed to declare big-sibling node container");
        }

        cluster
            .start_active_monitoring(config.monitoring_interval)
            .await;

        let mut workers = Vec::new();

        let node_healer_shutdown = node_healer.shutdown_handle();
        let healer = node_healer.clone();
        workers.push(Worker {
            name: "node healer",
            shutdown: node_healer_shutdown,
            handle: tokio::spawn(async move { healer.run().await }),
        });

        if let Some(max_unresponsive) = config.container_max_unresponsive {
            let container_healer = ContainerHealer::new(
                provisioner,
                journal.clone(),
                ContainerHealerConfig {
                    max_unresponsive,
                    ..Default::default()
                },
            );
            workers.push(Worker {
                name: "container healer",
                shutdown: container_healer.shutdown_handle(),
                handle: tokio::spawn(async move { container_healer.run().await }),
            });
        }

        let state = ApiState {
            registry,
            node_healer: node_healer.clone(),
            journal,
            reconciler,
        };

        let server = if self.serve_http {
            let shutdown = Arc::new(Notify::new());
            let handle = tokio::spawn(api::serve(config.http_addr, state.clone(), shutdown.clone()));
            Some((shutdown, handle))
        } else {
            None
        };

        info!(
            http_addr = %config.http_addr,
            http = server.is_some(),
            container_healer = config.container_max_unresponsive.is_some(),
            "NodewardenRuntime started"
        );

        Ok(NodewardenRuntime {
            cluster,
            node_healer,
            state,
            workers,
            server,
            http_addr: config.http_addr,
        })
    }
}

struct Worker {
    name: &'static str,
    shutdown: Arc<Notify>,
    handle: JoinHandle<()>,
}

/// A running nodewarden instance.
///
/// Runs active monitoring, the node healer scan, the container healer
/// (when configured) and the HTTP API. Call [`shutdown`](Self::shutdown)
/// for graceful termination.
pub struct NodewardenRuntime {
    cluster: Arc<Cluster>,
    node_healer: Arc<NodeHealer>,
    state: ApiState,
    workers: Vec<Worker>,
    server: Option<(Arc<Notify>, JoinHandle<Result<()>>)>,
    http_addr: SocketAddr,
}

impl NodewardenRuntime {
    /// Create a new builder for configuring the runtime.
    pub fn builder() -> NodewardenRuntimeBuilder {
        NodewardenRuntimeBuilder::new()
    }

    /// HTTP API bind address.
    pub fn http_addr(&self) -> SocketAddr {
        self.http_addr
    }

    /// Shared handler state.
    pub fn state(&self) -> &ApiState {
        &self.state
    }

    /// Docker cluster facade.
    pub fn cluster(&self) -> &Arc<Cluster> {
        &self.cluster
    }

    /// Node healer.
    pub fn node_healer(&self) -> &Arc<NodeHealer> {
        &self.node_healer
    }

    /// Signal every loop to stop and wait for them.
    pub async fn shutdown(self) -> Result<()> {
        info!("NodewardenRuntime shutting down...");

        if let Some((shutdown, _)) = &self.server {
            shutdown.notify_one();
        }
        for worker in &self.workers {
            worker.shutdown.notify_one();
        }
        self.cluster.stop_active_monitoring().await;

        for worker in self.workers {
            if let Err(e) = worker.handle.await {
                error!(worker = worker.name, error = %e, "Worker task panicked");
            }
        }

        // Passive heals started by monitoring or container creates.
        self.cluster.registry().drain_failures().await;

        if let Some((_, handle)) = self.server {
            match handle.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!(error = %e, "HTTP server error"),
                Err(e) => error!(error = %e, "HTTP server task panicked"),
            }
        }

        info!("NodewardenRuntime shutdown complete");
        Ok(())
    }
}
