// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Mock Docker engines for testing.
//!
//! A [`MockDocker`] simulates a set of engines keyed by endpoint. Hosts are
//! added explicitly; calls to unknown or downed hosts fail with
//! `ConnectionRefused`, like an unreachable daemon.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;

use super::traits::*;

/// One simulated container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockContainer {
    /// Container id.
    pub id: String,
    /// Container name.
    pub name: String,
    /// Creation options.
    pub opts: CreateContainerOptions,
    /// Process state.
    pub running: bool,
}

#[derive(Debug, Default)]
struct MockHost {
    down: bool,
    containers: Vec<MockContainer>,
    pulls: Vec<String>,
    pings: usize,
    fail_create: Option<DockerError>,
    fail_start: Option<DockerError>,
}

#[derive(Debug, Default)]
struct MockState {
    hosts: BTreeMap<String, MockHost>,
    digests: BTreeMap<String, String>,
    next_id: u64,
}

/// Scriptable fleet of fake engines.
#[derive(Clone, Default)]
pub struct MockDocker {
    state: Arc<Mutex<MockState>>,
}

impl MockDocker {
    /// Empty fleet.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Bring up an engine at `endpoint`.
    pub fn add_host(&self, endpoint: &str) {
        self.lock().hosts.entry(endpoint.to_string()).or_default();
    }

    /// Make an engine unreachable (or reachable again).
    pub fn set_down(&self, endpoint: &str, down: bool) {
        if let Some(host) = self.lock().hosts.get_mut(endpoint) {
            host.down = down;
        }
    }

    /// Make the next creates on `endpoint` fail with `err`.
    pub fn fail_create(&self, endpoint: &str, err: Option<DockerError>) {
        if let Some(host) = self.lock().hosts.get_mut(endpoint) {
            host.fail_create = err;
        }
    }

    /// Make starts on `endpoint` fail with `err`.
    pub fn fail_start(&self, endpoint: &str, err: Option<DockerError>) {
        if let Some(host) = self.lock().hosts.get_mut(endpoint) {
            host.fail_start = err;
        }
    }

    /// Digest reported when pulling `image` (repository, with or without tag).
    pub fn set_digest(&self, image: &str, digest: &str) {
        self.lock()
            .digests
            .insert(image.to_string(), digest.to_string());
    }

    /// Containers on `endpoint`.
    pub fn containers(&self, endpoint: &str) -> Vec<MockContainer> {
        self.lock()
            .hosts
            .get(endpoint)
            .map(|h| h.containers.clone())
            .unwrap_or_default()
    }

    /// Images pulled on `endpoint`, in order.
    pub fn pulls(&self, endpoint: &str) -> Vec<String> {
        self.lock()
            .hosts
            .get(endpoint)
            .map(|h| h.pulls.clone())
            .unwrap_or_default()
    }

    /// Pings answered by `endpoint`.
    pub fn pings(&self, endpoint: &str) -> usize {
        self.lock().hosts.get(endpoint).map(|h| h.pings).unwrap_or(0)
    }

    /// Insert a container directly, bypassing create.
    pub fn insert_container(&self, endpoint: &str, id: &str, name: &str, image: &str, running: bool) {
        let mut state = self.lock();
        let host = state.hosts.entry(endpoint.to_string()).or_default();
        let mut opts = CreateContainerOptions {
            name: name.to_string(),
            ..Default::default()
        };
        opts.config.image = image.to_string();
        host.containers.push(MockContainer {
            id: id.to_string(),
            name: name.to_string(),
            opts,
            running,
        });
    }

    /// Flip the running flag of a container.
    pub fn set_running(&self, endpoint: &str, id_or_name: &str, running: bool) {
        if let Some(c) = self
            .lock()
            .hosts
            .get_mut(endpoint)
            .and_then(|h| h.containers.iter_mut().find(|c| c.id == id_or_name || c.name == id_or_name))
        {
            c.running = running;
        }
    }
}

impl DockerConnector for MockDocker {
    fn connect(&self, endpoint: &str, _timeout: Duration) -> DockerResult<Arc<dyn DockerClient>> {
        Ok(Arc::new(MockClient {
            endpoint: endpoint.to_string(),
            docker: self.clone(),
        }))
    }
}

/// Client bound to one fake engine.
pub struct MockClient {
    endpoint: String,
    docker: MockDocker,
}

impl MockClient {
    fn with_host<T>(&self, f: impl FnOnce(&mut MockHost, &mut u64) -> DockerResult<T>) -> DockerResult<T> {
        let mut state = self.docker.lock();
        let MockState { hosts, next_id, .. } = &mut *state;
        match hosts.get_mut(&self.endpoint) {
            Some(host) if !host.down => f(host, next_id),
            _ => Err(DockerError::ConnectionRefused(self.endpoint.clone())),
        }
    }
}

fn find<'a>(host: &'a mut MockHost, id_or_name: &str) -> DockerResult<&'a mut MockContainer> {
    host.containers
        .iter_mut()
        .find(|c| c.id == id_or_name || c.name == id_or_name)
        .ok_or_else(|| DockerError::NoSuchContainer(id_or_name.to_string()))
}

#[async_trait]
impl DockerClient for MockClient {
    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn ping(&self) -> DockerResult<()> {
        self.with_host(|host, _| {
            host.pings += 1;
            Ok(())
        })
    }

    async fn pull_image(&self, opts: &PullOptions, _auth: Option<&RegistryAuth>) -> DockerResult<String> {
        let reference = opts.reference();
        let digest = {
            let state = self.docker.lock();
            state
                .digests
                .get(&reference)
                .or_else(|| state.digests.get(&opts.repository))
                .cloned()
        };
        self.with_host(|host, _| {
            host.pulls.push(reference.clone());
            let mut output = format!("Pulling from {}\n", opts.repository);
            if let Some(digest) = &digest {
                output.push_str(&format!("Digest: {}\n", digest));
            }
            output.push_str(&format!("Status: Downloaded newer image for {}\n", reference));
            Ok(output)
        })
    }

    async fn create_container(&self, opts: &CreateContainerOptions) -> DockerResult<String> {
        self.with_host(|host, next_id| {
            if let Some(err) = host.fail_create.clone() {
                return Err(err);
            }
            if !opts.name.is_empty() && host.containers.iter().any(|c| c.name == opts.name) {
                return Err(DockerError::AlreadyExists(opts.name.clone()));
            }
            *next_id += 1;
            let id = format!("{:064x}", *next_id);
            let name = if opts.name.is_empty() {
                format!("mock-{}", next_id)
            } else {
                opts.name.clone()
            };
            host.containers.push(MockContainer {
                id: id.clone(),
                name,
                opts: opts.clone(),
                running: false,
            });
            Ok(id)
        })
    }

    async fn start_container(&self, id: &str) -> DockerResult<()> {
        self.with_host(|host, _| {
            if let Some(err) = host.fail_start.clone() {
                return Err(err);
            }
            let c = find(host, id)?;
            if c.running {
                return Err(DockerError::AlreadyRunning(id.to_string()));
            }
            c.running = true;
            Ok(())
        })
    }

    async fn stop_container(&self, id: &str, _grace: Duration) -> DockerResult<()> {
        self.with_host(|host, _| {
            let c = find(host, id)?;
            if !c.running {
                return Err(DockerError::NotRunning(id.to_string()));
            }
            c.running = false;
            Ok(())
        })
    }

    async fn remove_container(&self, id: &str, force: bool) -> DockerResult<()> {
        self.with_host(|host, _| {
            let c = find(host, id)?;
            if c.running && !force {
                return Err(DockerError::Api {
                    status: 409,
                    message: format!("container {} is running", id),
                });
            }
            host.containers.retain(|c| c.id != id && c.name != id);
            Ok(())
        })
    }

    async fn inspect_container(&self, id: &str) -> DockerResult<ContainerInspect> {
        self.with_host(|host, _| {
            let c = find(host, id)?;
            Ok(ContainerInspect {
                id: c.id.clone(),
                name: c.name.clone(),
                image: c.opts.config.image.clone(),
                running: c.running,
                ..Default::default()
            })
        })
    }

    async fn list_containers(&self) -> DockerResult<Vec<ContainerSummary>> {
        self.with_host(|host, _| {
            Ok(host
                .containers
                .iter()
                .map(|c| ContainerSummary {
                    id: c.id.clone(),
                    names: vec![c.name.clone()],
                    image: c.opts.config.image.clone(),
                    state: if c.running { "running" } else { "exited" }.to_string(),
                    labels: c.opts.config.labels.clone(),
                })
                .collect())
        })
    }
}
