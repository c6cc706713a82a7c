// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Brings nodes in line with the declared node containers.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use tracing::{debug, info, warn};

use super::NodeContainerStore;
use crate::cluster::{Cluster, pull_with_retry};
use crate::docker::{
    CreateContainerOptions, DockerError, HEALER_TIMEOUT, PullOptions, RegistryAuth, parse_digest,
};
use crate::error::{Error, MultiError, Result};
use crate::node::Node;
use crate::provisioner::{LogBuffer, node_container_labels};
use crate::registry::{ClusterHook, HookEvent};

const STOP_GRACE: Duration = Duration::from_secs(10);

/// Creates, relaunches and removes node containers on nodes.
pub struct Reconciler {
    cluster: Arc<Cluster>,
    store: NodeContainerStore,
    max_workers: Option<usize>,
    auth: Option<RegistryAuth>,
}

impl Reconciler {
    /// Reconciler using `store` for definitions.
    pub fn new(cluster: Arc<Cluster>, store: NodeContainerStore) -> Self {
        Self {
            cluster,
            store,
            max_workers: None,
            auth: None,
        }
    }

    /// Cap the number of nodes handled at once. `None` or zero handles all
    /// nodes in parallel.
    pub fn with_max_workers(mut self, max_workers: Option<usize>) -> Self {
        self.max_workers = max_workers.filter(|n| *n > 0);
        self
    }

    /// Credentials for private registries.
    pub fn with_registry_auth(mut self, auth: Option<RegistryAuth>) -> Self {
        self.auth = auth;
        self
    }

    /// Definitions used by this reconciler.
    pub fn store(&self) -> &NodeContainerStore {
        &self.store
    }

    /// Make sure the named node containers run on `nodes`.
    ///
    /// Empty `names` means every declared container and empty `nodes`
    /// means every registered node. With `relaunch` an existing container
    /// is replaced; otherwise it is only started. Failures on one node do
    /// not stop the others and are returned together.
    pub async fn ensure_containers_started(
        &self,
        log: &LogBuffer,
        relaunch: bool,
        names: &[String],
        nodes: &[Node],
    ) -> Result<()> {
        let names = if names.is_empty() {
            self.store.all_names().await?
        } else {
            names.to_vec()
        };
        if names.is_empty() {
            return Ok(());
        }
        let nodes = if nodes.is_empty() {
            self.cluster.registry().unfiltered_list().await?
        } else {
            nodes.to_vec()
        };
        if nodes.is_empty() {
            return Ok(());
        }

        let workers = self.max_workers.unwrap_or(nodes.len()).min(nodes.len());
        let step = nodes.len().div_ceil(workers);
        let groups = nodes.chunks(step).map(|group| {
            let names = &names;
            async move {
                let mut errors = MultiError::new();
                for node in group {
                    for name in names {
                        if let Err(e) = self.create_on_node(log, relaunch, name, node).await {
                            warn!(node = %node.address, name = %name, error = %e, "Node container not started");
                            log.log(format!(
                                "Error starting node container {} in {}: {}",
                                name, node.address, e
                            ));
                            errors.add(e);
                        }
                    }
                }
                errors
            }
        });

        let mut errors = MultiError::new();
        for group_errors in join_all(groups).await {
            errors.add(Error::Multi(group_errors));
        }
        errors.into_result()
    }

    async fn create_on_node(
        &self,
        log: &LogBuffer,
        relaunch: bool,
        name: &str,
        node: &Node,
    ) -> Result<()> {
        let pool = node.pool();
        let config = self.store.load_node_container(pool, name).await?;
        if !config.valid() {
            debug!(node = %node.address, name = %name, "Node container disabled or without image");
            return Ok(());
        }

        let client = self.cluster.client(&node.address, HEALER_TIMEOUT)?;
        let image = config.image().to_string();
        let output = pull_with_retry(&*client, &PullOptions::for_image(&image), self.auth.as_ref()).await?;
        if let Some(digest) = parse_digest(&output) {
            self.store
                .pin_image_if_needed(name, &image, &digest, pool)
                .await?;
        }

        let mut opts = CreateContainerOptions {
            name: config.name.clone(),
            config: config.config.clone(),
            host_config: config.host_config.clone(),
        };
        opts.config.image = image;
        opts.config
            .env
            .insert(0, format!("DOCKER_ENDPOINT={}", node.address));
        opts.config
            .labels
            .extend(node_container_labels(name, pool, &node.address));

        match client.create_container(&opts).await {
            Ok(_) => {}
            Err(DockerError::AlreadyExists(_)) if relaunch => {
                log.log(format!("Relaunching node container {} in {}", name, node.address));
                remove_from_client(&*client, name).await?;
                client.create_container(&opts).await?;
            }
            Err(DockerError::AlreadyExists(_)) => {}
            Err(e) => return Err(e.into()),
        }
        match client.start_container(name).await {
            Ok(()) | Err(DockerError::AlreadyRunning(_)) => {}
            Err(e) => return Err(e.into()),
        }
        info!(node = %node.address, name = %name, "Node container running");
        Ok(())
    }

    /// Stop and remove the named container from every node, or only from
    /// the nodes of `pool`. Nodes without the container are skipped.
    pub async fn remove_named_containers(
        &self,
        name: &str,
        pool: Option<&str>,
        log: &LogBuffer,
    ) -> Result<()> {
        let nodes = self.nodes_in_pool(pool).await?;
        let removals = nodes.iter().map(|node| async move {
            let client = self.cluster.client(&node.address, HEALER_TIMEOUT)?;
            log.log(format!("Removing node container {} from {}", name, node.address));
            remove_from_client(&*client, name).await
        });
        join_all(removals)
            .await
            .into_iter()
            .filter_map(|r| r.err())
            .collect::<MultiError>()
            .into_result()
    }

    /// Replace the named container on every node, or on the nodes of
    /// `pool`.
    pub async fn recreate_named_containers(
        &self,
        name: &str,
        pool: Option<&str>,
        log: &LogBuffer,
    ) -> Result<()> {
        let nodes = self.nodes_in_pool(pool).await?;
        if nodes.is_empty() {
            return Ok(());
        }
        self.ensure_containers_started(log, true, &[name.to_string()], &nodes)
            .await
    }

    async fn nodes_in_pool(&self, pool: Option<&str>) -> Result<Vec<Node>> {
        let mut nodes = self.cluster.registry().unfiltered_list().await?;
        if let Some(pool) = pool.filter(|p| !p.is_empty()) {
            nodes.retain(|n| n.pool() == pool);
        }
        Ok(nodes)
    }
}

async fn remove_from_client(client: &dyn crate::docker::DockerClient, name: &str) -> Result<()> {
    match client.stop_container(name, STOP_GRACE).await {
        Ok(()) | Err(DockerError::NotRunning(_)) => {}
        Err(DockerError::NoSuchContainer(_)) => return Ok(()),
        Err(e) => return Err(e.into()),
    }
    match client.remove_container(name, true).await {
        Ok(()) | Err(DockerError::NoSuchContainer(_)) => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[async_trait]
impl ClusterHook for Reconciler {
    async fn run_hook(&self, event: HookEvent, node: &Node) -> Result<()> {
        if event != HookEvent::BeforeContainerCreate {
            return Ok(());
        }
        self.ensure_containers_started(&LogBuffer::new(), false, &[], std::slice::from_ref(node))
            .await
    }
}
