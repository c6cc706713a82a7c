// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Cluster facade.
//!
//! Fans Docker operations out over the registered nodes and feeds their
//! outcome back into the registry: a node that fails a network call or a
//! container create gets a failure recorded, a node that succeeds gets its
//! failures cleared. Active monitoring does the same on a timer with a
//! plain ping.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::StreamExt;
use futures::future::join_all;
use rand::seq::SliceRandom;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::container::{Container, ContainerStateChange};
use crate::docker::{
    ContainerInspect, ContainerSummary, CreateContainerOptions, DockerClient, DockerConnector,
    DockerError, DockerResult, HEALER_TIMEOUT, MONITORING_TIMEOUT, PullOptions, RegistryAuth,
    has_explicit_registry, parse_digest,
};
use crate::error::{Error, MultiError, Result};
use crate::node::Node;
use crate::registry::{ClusterHook, HookEvent, NodeRegistry};
use crate::storage::{ContainerStorage, ImageStorage, Stores};

/// Nodes tried by one container create.
pub const MAX_CREATE_TRIES: usize = 5;

/// Pull attempts per node.
pub const MAX_PULL_TRIES: usize = 3;

/// Concurrent pings per monitoring tick.
const MONITORING_WORKERS: usize = 32;

/// Scheduling hints for a container create.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchedulerOptions {
    /// App the container belongs to.
    pub app_name: String,
    /// Process the container runs.
    pub process_name: String,
}

/// Chooses the node for a new container.
pub trait Scheduler: Send + Sync {
    /// Address of the node that should run the container, out of `nodes`.
    fn schedule(
        &self,
        opts: &CreateContainerOptions,
        sched: &SchedulerOptions,
        nodes: &[Node],
    ) -> Result<String>;
}

/// Picks any enabled node.
#[derive(Debug, Clone, Copy, Default)]
pub struct RandomScheduler;

impl Scheduler for RandomScheduler {
    fn schedule(
        &self,
        _opts: &CreateContainerOptions,
        _sched: &SchedulerOptions,
        nodes: &[Node],
    ) -> Result<String> {
        nodes
            .choose(&mut rand::thread_rng())
            .map(|n| n.address.clone())
            .ok_or_else(|| Error::Other("No nodes available".to_string()))
    }
}

enum NodeFailure {
    Pull(DockerError),
    Create(DockerError),
}

struct Monitor {
    shutdown: Arc<Notify>,
    task: JoinHandle<()>,
}

/// Docker operations across the fleet.
pub struct Cluster {
    registry: Arc<NodeRegistry>,
    containers: Arc<dyn ContainerStorage>,
    images: Arc<dyn ImageStorage>,
    docker: Arc<dyn DockerConnector>,
    scheduler: Arc<dyn Scheduler>,
    monitor: Mutex<Option<Monitor>>,
}

impl Cluster {
    /// Cluster over `registry`, using `stores` for container and image
    /// records and `docker` to reach nodes.
    pub fn new(registry: Arc<NodeRegistry>, stores: &Stores, docker: Arc<dyn DockerConnector>) -> Self {
        Self {
            registry,
            containers: stores.containers.clone(),
            images: stores.images.clone(),
            docker,
            scheduler: Arc::new(RandomScheduler),
            monitor: Mutex::new(None),
        }
    }

    /// Replace the scheduler.
    pub fn with_scheduler(mut self, scheduler: Arc<dyn Scheduler>) -> Self {
        self.scheduler = scheduler;
        self
    }

    /// Node registry.
    pub fn registry(&self) -> &Arc<NodeRegistry> {
        &self.registry
    }

    /// Attach a hook.
    pub async fn add_hook(&self, event: HookEvent, hook: Arc<dyn ClusterHook>) {
        self.registry.add_hook(event, hook).await;
    }

    /// Client for one node.
    pub fn client(&self, address: &str, timeout: Duration) -> Result<Arc<dyn DockerClient>> {
        Ok(self.docker.connect(address, timeout)?)
    }

    async fn node_failed(&self, address: &str, err: &(dyn std::fmt::Display + Sync), increment: bool) {
        match self
            .registry
            .handle_error(address, &err.to_string(), increment)
            .await
        {
            Ok(_) => {}
            Err(e) => debug!(node = %address, error = %e, "Node failure not recorded"),
        }
    }

    async fn node_succeeded(&self, address: &str) {
        if let Err(e) = self.registry.handle_success(address).await {
            debug!(node = %address, error = %e, "Node success not recorded");
        }
    }

    /// Create a container on a scheduled node.
    ///
    /// Up to [`MAX_CREATE_TRIES`] nodes are tried. A node is picked at
    /// random from `candidates` when given, otherwise by the scheduler.
    /// A failing create hook moves on to another node without counting
    /// against it; a failing create always counts, a failing pull counts
    /// only for images without an explicit registry.
    ///
    /// Returns the chosen address and the new container id.
    pub async fn create_container(
        &self,
        opts: &CreateContainerOptions,
        auth: Option<&RegistryAuth>,
        sched: &SchedulerOptions,
        candidates: &[String],
    ) -> Result<(String, String)> {
        let mut last_err: Option<Error> = None;
        for attempt in 1..=MAX_CREATE_TRIES {
            let address = if candidates.is_empty() {
                let nodes = self.registry.list().await?;
                match self.scheduler.schedule(opts, sched, &nodes) {
                    Ok(address) => address,
                    Err(e) => {
                        last_err = Some(e);
                        break;
                    }
                }
            } else {
                pick_random(candidates)
            };
            if address.is_empty() {
                return Err(Error::Other(
                    "CreateContainer needs a non empty node addr".to_string(),
                ));
            }

            let node = match self.registry.get(&address).await {
                Ok(node) => node,
                Err(e) if e.is_not_found() => Node::new(address.clone()),
                Err(e) => return Err(e),
            };
            if let Err(e) = self
                .registry
                .run_hooks(HookEvent::BeforeContainerCreate, &node)
                .await
            {
                warn!(node = %address, attempt, error = %e, "Create hook failed, trying another node");
                last_err = Some(e);
                continue;
            }

            match self.create_in_node(&address, opts, auth).await {
                Ok(id) => {
                    self.node_succeeded(&address).await;
                    debug!(node = %address, container = %id, "Container created");
                    return Ok((address, id));
                }
                Err(NodeFailure::Create(DockerError::AlreadyExists(name))) => {
                    return Err(DockerError::AlreadyExists(name).into());
                }
                Err(NodeFailure::Pull(e)) => {
                    let counts = e.is_network() || !has_explicit_registry(&opts.config.image);
                    warn!(node = %address, attempt, error = %e, "Image pull failed");
                    self.node_failed(&address, &e, counts).await;
                    last_err = Some(e.into());
                }
                Err(NodeFailure::Create(e)) => {
                    warn!(node = %address, attempt, error = %e, "Container create failed");
                    self.node_failed(&address, &e, true).await;
                    last_err = Some(e.into());
                }
            }
        }
        Err(last_err.unwrap_or_else(|| Error::Other("No nodes available".to_string())))
    }

    async fn create_in_node(
        &self,
        address: &str,
        opts: &CreateContainerOptions,
        auth: Option<&RegistryAuth>,
    ) -> std::result::Result<String, NodeFailure> {
        let client = self
            .docker
            .connect(address, HEALER_TIMEOUT)
            .map_err(NodeFailure::Create)?;
        if !opts.config.image.is_empty() {
            let pull = PullOptions::for_image(&opts.config.image);
            let output = pull_with_retry(&*client, &pull, auth)
                .await
                .map_err(NodeFailure::Pull)?;
            self.record_digest(&opts.config.image, &output).await;
        }
        client
            .create_container(opts)
            .await
            .map_err(NodeFailure::Create)
    }

    async fn record_digest(&self, image: &str, pull_output: &str) -> Option<String> {
        let digest = parse_digest(pull_output)?;
        if let Err(e) = self.images.store_image_digest(image, &digest).await {
            warn!(image = %image, error = %e, "Failed to store image digest");
        }
        Some(digest)
    }

    /// Pull an image on `nodes` (every enabled node when empty), in
    /// parallel. Returns the last digest reported.
    pub async fn pull_image(
        &self,
        opts: &PullOptions,
        auth: Option<&RegistryAuth>,
        nodes: &[String],
    ) -> Result<Option<String>> {
        let addresses: Vec<String> = if nodes.is_empty() {
            self.registry
                .list()
                .await?
                .into_iter()
                .map(|n| n.address)
                .collect()
        } else {
            nodes.to_vec()
        };
        let image = opts.reference();
        let results = join_all(addresses.iter().map(|address| async move {
            let client = self.docker.connect(address, HEALER_TIMEOUT)?;
            let output = client.pull_image(opts, auth).await?;
            Ok::<_, DockerError>(output)
        }))
        .await;

        let mut errors = MultiError::new();
        let mut digest = None;
        for (address, result) in addresses.iter().zip(results) {
            match result {
                Ok(output) => {
                    if let Some(d) = self.record_digest(&image, &output).await {
                        digest = Some(d);
                    }
                }
                Err(e) => {
                    warn!(node = %address, image = %image, error = %e, "Image pull failed");
                    errors.add(e.into());
                }
            }
        }
        errors.into_result()?;
        Ok(digest)
    }

    /// Node a container runs on, matched by host.
    pub async fn node_for_container(&self, container: &Container) -> Result<Node> {
        self.registry
            .unfiltered_list()
            .await?
            .into_iter()
            .find(|n| n.host() == container.host_addr)
            .ok_or_else(|| Error::NodeNotFound(container.host_addr.clone()))
    }

    async fn container_client(&self, container: &Container) -> Result<Arc<dyn DockerClient>> {
        let node = self.node_for_container(container).await?;
        self.client(&node.address, HEALER_TIMEOUT)
    }

    /// Inspect a container on its node.
    pub async fn inspect_container(&self, container: &Container) -> Result<ContainerInspect> {
        let client = self.container_client(container).await?;
        Ok(client.inspect_container(&container.id).await?)
    }

    /// Start a container on its node.
    pub async fn start_container(&self, container: &Container) -> Result<()> {
        let client = self.container_client(container).await?;
        Ok(client.start_container(&container.id).await?)
    }

    /// Stop a container on its node.
    pub async fn stop_container(&self, container: &Container, grace: Duration) -> Result<()> {
        let client = self.container_client(container).await?;
        Ok(client.stop_container(&container.id, grace).await?)
    }

    /// Remove a container from its node.
    pub async fn remove_container(&self, container: &Container, force: bool) -> Result<()> {
        let client = self.container_client(container).await?;
        Ok(client.remove_container(&container.id, force).await?)
    }

    /// Containers on one node.
    pub async fn list_containers(&self, address: &str) -> Result<Vec<ContainerSummary>> {
        let client = self.client(address, HEALER_TIMEOUT)?;
        Ok(client.list_containers().await?)
    }

    /// Apply a state change to a container record. Status changes are
    /// ignored while the container is building.
    pub async fn set_container_state(
        &self,
        container: &Container,
        change: ContainerStateChange,
    ) -> Result<()> {
        match change {
            ContainerStateChange::NewStatus(status) => {
                let applied = self
                    .containers
                    .set_container_status(&container.id, status, Utc::now())
                    .await?;
                if !applied {
                    debug!(container = %container.short_id(), %status, "Status ignored while building");
                }
                Ok(())
            }
            ContainerStateChange::Removed => self.containers.remove_container(&container.id).await,
        }
    }

    /// Start pinging every node each `interval`. Restarts monitoring if it
    /// is already running.
    pub async fn start_active_monitoring(self: &Arc<Self>, interval: Duration) {
        self.stop_active_monitoring().await;
        let shutdown = Arc::new(Notify::new());
        let cluster = self.clone();
        let signal = shutdown.clone();
        let task = tokio::spawn(async move {
            info!(interval_secs = interval.as_secs(), "Active monitoring started");
            loop {
                cluster.ping_nodes().await;
                tokio::select! {
                    biased;

                    _ = signal.notified() => break,

                    _ = tokio::time::sleep(interval) => {}
                }
            }
            info!("Active monitoring stopped");
        });
        *self.monitor.lock().await = Some(Monitor { shutdown, task });
    }

    /// Stop active monitoring and wait for the current tick to finish.
    pub async fn stop_active_monitoring(&self) {
        let Some(monitor) = self.monitor.lock().await.take() else {
            return;
        };
        monitor.shutdown.notify_one();
        if let Err(e) = monitor.task.await {
            error!(error = %e, "Active monitoring task failed");
        }
    }

    /// Ping every node once and record the outcome.
    pub async fn ping_nodes(&self) {
        let nodes = match self.registry.unfiltered_list().await {
            Ok(nodes) => nodes,
            Err(e) => {
                error!(error = %e, "Failed to list nodes for monitoring");
                return;
            }
        };
        futures::stream::iter(nodes)
            .for_each_concurrent(MONITORING_WORKERS, |node| async move {
                match self.ping(&node.address).await {
                    Ok(()) => self.node_succeeded(&node.address).await,
                    Err(e) => {
                        debug!(node = %node.address, error = %e, "Ping failed");
                        self.node_failed(&node.address, &e, true).await;
                    }
                }
            })
            .await;
    }

    async fn ping(&self, address: &str) -> DockerResult<()> {
        let client = self.docker.connect(address, MONITORING_TIMEOUT)?;
        match tokio::time::timeout(MONITORING_TIMEOUT, client.ping()).await {
            Ok(result) => result,
            Err(_) => Err(DockerError::Timeout(address.to_string())),
        }
    }
}

fn pick_random(candidates: &[String]) -> String {
    candidates
        .choose(&mut rand::thread_rng())
        .cloned()
        .unwrap_or_default()
}

/// Pull an image, retrying up to [`MAX_PULL_TRIES`] times.
pub async fn pull_with_retry(
    client: &dyn DockerClient,
    opts: &PullOptions,
    auth: Option<&RegistryAuth>,
) -> DockerResult<String> {
    let mut tries = 1;
    loop {
        match client.pull_image(opts, auth).await {
            Ok(output) => return Ok(output),
            Err(e) if tries < MAX_PULL_TRIES => {
                debug!(node = %client.endpoint(), image = %opts.reference(), tries, error = %e, "Retrying pull");
                tries += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
