// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Container moves.
//!
//! A move recreates an application container on another node (or on the
//! same one) and then removes the original. Moves of one app are
//! serialised through an app lock so two healers never shuffle the same
//! app at once.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::Utc;
use futures::future::join_all;
use tracing::{debug, error, info, warn};

use crate::cluster::{Cluster, SchedulerOptions};
use crate::container::{Container, ContainerStateChange, ContainerStatus};
use crate::docker::{CreateContainerOptions, DockerError, RegistryAuth};
use crate::error::{Error, MultiError, Result};
use crate::node::url_to_host;
use crate::storage::ContainerStorage;

/// Label carrying the app name.
pub const LABEL_APP_NAME: &str = "app-name";
/// Label carrying the process name.
pub const LABEL_APP_PROCESS: &str = "app-process";
/// Label set on every node container.
pub const LABEL_NODE_CONTAINER: &str = "is-node-container";
/// Label carrying the node container name.
pub const LABEL_NODE_CONTAINER_NAME: &str = "node-container-name";
/// Label carrying the node container pool.
pub const LABEL_NODE_CONTAINER_POOL: &str = "node-container-pool";
/// Label carrying the node address.
pub const LABEL_NODE_ADDR: &str = "node-addr";

/// Grace period when stopping a replaced container.
const STOP_GRACE: Duration = Duration::from_secs(10);

/// Labels identifying a node container.
pub fn node_container_labels(name: &str, pool: &str, node_addr: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (LABEL_NODE_CONTAINER.to_string(), "true".to_string()),
        (LABEL_NODE_CONTAINER_NAME.to_string(), name.to_string()),
        (LABEL_NODE_CONTAINER_POOL.to_string(), pool.to_string()),
        (LABEL_NODE_ADDR.to_string(), node_addr.to_string()),
    ])
}

/// Line buffer handed to long operations. Every line is also traced.
#[derive(Clone, Default)]
pub struct LogBuffer {
    lines: Arc<Mutex<Vec<String>>>,
}

impl LogBuffer {
    /// Empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    fn lines(&self) -> MutexGuard<'_, Vec<String>> {
        self.lines.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append a line.
    pub fn log(&self, line: impl Into<String>) {
        let line = line.into();
        debug!(target: "nodewarden::progress", "{}", line);
        self.lines().push(line);
    }

    /// Everything written so far, one entry per line.
    pub fn contents(&self) -> String {
        self.lines().iter().map(|l| format!("{}\n", l)).collect()
    }

    /// Whether nothing was written.
    pub fn is_empty(&self) -> bool {
        self.lines().is_empty()
    }
}

impl fmt::Debug for LogBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LogBuffer")
            .field("lines", &self.lines().len())
            .finish()
    }
}

/// Process-wide app locks.
#[derive(Clone, Default)]
pub struct AppLocks {
    held: Arc<Mutex<HashSet<String>>>,
}

impl AppLocks {
    /// No app locked.
    pub fn new() -> Self {
        Self::default()
    }

    fn held(&self) -> MutexGuard<'_, HashSet<String>> {
        self.held.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Whether `app` is locked by anyone.
    pub fn is_locked(&self, app: &str) -> bool {
        self.held().contains(app)
    }

    /// New locker drawing from these locks.
    pub fn locker(&self) -> AppLocker {
        AppLocker {
            locks: self.clone(),
            counts: Mutex::new(HashMap::new()),
        }
    }
}

/// Reentrant view over [`AppLocks`] for one operation: locking an app it
/// already holds succeeds and is counted.
pub struct AppLocker {
    locks: AppLocks,
    counts: Mutex<HashMap<String, usize>>,
}

impl AppLocker {
    fn counts(&self) -> MutexGuard<'_, HashMap<String, usize>> {
        self.counts.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Take the lock on `app`. Returns false when another locker holds it.
    pub fn lock(&self, app: &str) -> bool {
        let mut counts = self.counts();
        if let Some(n) = counts.get_mut(app) {
            *n += 1;
            return true;
        }
        if !self.locks.held().insert(app.to_string()) {
            return false;
        }
        counts.insert(app.to_string(), 1);
        true
    }

    /// Drop one hold on `app`, releasing the shared lock with the last one.
    pub fn unlock(&self, app: &str) {
        let mut counts = self.counts();
        let Some(n) = counts.get_mut(app) else {
            return;
        };
        *n -= 1;
        if *n == 0 {
            counts.remove(app);
            self.locks.held().remove(app);
        }
    }
}

impl Drop for AppLocker {
    fn drop(&mut self) {
        let counts = std::mem::take(&mut *self.counts());
        let mut held = self.locks.held();
        for app in counts.into_keys() {
            held.remove(&app);
        }
    }
}

/// Where a moved container goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Destination {
    /// Recreate on the node it runs on.
    InPlace,
    /// Any enabled node except the one it runs on.
    Anywhere,
    /// The node with this host.
    Host(String),
}

/// Recreates application containers across nodes.
pub struct Provisioner {
    cluster: Arc<Cluster>,
    containers: Arc<dyn ContainerStorage>,
    locks: AppLocks,
    auth: Option<RegistryAuth>,
}

impl Provisioner {
    /// Provisioner over `cluster`, recording containers in `containers`.
    pub fn new(cluster: Arc<Cluster>, containers: Arc<dyn ContainerStorage>) -> Self {
        Self {
            cluster,
            containers,
            locks: AppLocks::new(),
            auth: None,
        }
    }

    /// Credentials used for image pulls.
    pub fn with_registry_auth(mut self, auth: Option<RegistryAuth>) -> Self {
        self.auth = auth;
        self
    }

    /// Shared app locks.
    pub fn app_locks(&self) -> &AppLocks {
        &self.locks
    }

    /// Cluster facade.
    pub fn cluster(&self) -> &Arc<Cluster> {
        &self.cluster
    }

    /// Container records.
    pub fn containers(&self) -> &Arc<dyn ContainerStorage> {
        &self.containers
    }

    /// Application containers whose last successful status report is
    /// older than `max_unresponsive`.
    pub async fn list_unresponsive_containers(
        &self,
        max_unresponsive: Duration,
    ) -> Result<Vec<Container>> {
        let cutoff = Utc::now() - crate::storage::chrono_duration(max_unresponsive);
        self.containers.list_unresponsive_containers(cutoff).await
    }

    async fn candidates(&self, container: &Container, dest: &Destination) -> Result<Vec<String>> {
        let nodes = self.cluster.registry().list().await?;
        let candidates: Vec<String> = nodes
            .into_iter()
            .filter(|n| match dest {
                Destination::InPlace => n.host() == container.host_addr,
                Destination::Anywhere => n.host() != container.host_addr,
                Destination::Host(host) => n.host() == *host,
            })
            .map(|n| n.address)
            .collect();
        if candidates.is_empty() {
            return Err(Error::Other(format!(
                "no nodes available to receive container {}",
                container.short_id()
            )));
        }
        Ok(candidates)
    }

    /// Recreate `container` at `dest` and remove the original.
    ///
    /// The app is locked through `locker` for the duration of the move.
    pub async fn move_one_container(
        &self,
        container: &Container,
        dest: Destination,
        log: &LogBuffer,
        locker: &AppLocker,
    ) -> Result<Container> {
        if !locker.lock(&container.app_name) {
            return Err(Error::Other(format!(
                "couldn't lock app {} to move container {}",
                container.app_name,
                container.short_id()
            )));
        }
        let result = self.move_locked(container, &dest, log).await;
        locker.unlock(&container.app_name);
        result
    }

    async fn move_locked(
        &self,
        container: &Container,
        dest: &Destination,
        log: &LogBuffer,
    ) -> Result<Container> {
        let candidates = self.candidates(container, dest).await?;
        log.log(format!(
            "Moving unit {} for {:?} from {}...",
            container.short_id(),
            container.app_name,
            container.host_addr
        ));

        let mut opts = CreateContainerOptions {
            name: format!(
                "{}-{}-{}",
                container.app_name,
                if container.process_name.is_empty() {
                    "web"
                } else {
                    container.process_name.as_str()
                },
                &uuid::Uuid::new_v4().simple().to_string()[..8]
            ),
            ..Default::default()
        };
        opts.config.image = container.image.clone();
        opts.config.user = container.user.clone();
        opts.config
            .labels
            .insert(LABEL_APP_NAME.to_string(), container.app_name.clone());
        opts.config
            .labels
            .insert(LABEL_APP_PROCESS.to_string(), container.process_name.clone());
        if !container.exposed_port.is_empty() {
            opts.config.exposed_ports.push(container.exposed_port.clone());
        }
        let sched = SchedulerOptions {
            app_name: container.app_name.clone(),
            process_name: container.process_name.clone(),
        };

        let (address, id) = self
            .cluster
            .create_container(&opts, self.auth.as_ref(), &sched, &candidates)
            .await?;
        let now = Utc::now();
        let mut moved = Container {
            id,
            name: opts.name.clone(),
            app_name: container.app_name.clone(),
            process_name: container.process_name.clone(),
            host_addr: url_to_host(&address),
            created_at: now,
            exposed_port: container.exposed_port.clone(),
            image: container.image.clone(),
            user: container.user.clone(),
            version: container.version.clone(),
            kind: container.kind.clone(),
            private_key: container.private_key.clone(),
            ..Default::default()
        };
        moved.set_status(ContainerStatus::Starting, now);
        self.containers.store_container(&moved).await?;

        if let Err(e) = self.cluster.start_container(&moved).await {
            warn!(container = %moved.short_id(), node = %address, error = %e, "Moved container failed to start");
            if let Err(rm) = self.cluster.remove_container(&moved, true).await {
                warn!(container = %moved.short_id(), error = %rm, "Failed to remove unstarted container");
            }
            if let Err(rm) = self.containers.remove_container(&moved.id).await {
                warn!(container = %moved.short_id(), error = %rm, "Failed to remove record of unstarted container");
            }
            return Err(e);
        }
        moved.set_status(ContainerStatus::Started, Utc::now());
        self.containers.store_container(&moved).await?;

        self.remove_old(container, log).await?;
        log.log(format!(
            "Finished moving unit {} for {:?}: new unit {} on {}",
            container.short_id(),
            container.app_name,
            moved.short_id(),
            moved.host_addr
        ));
        info!(
            app = %container.app_name,
            from = %container.short_id(),
            to = %moved.short_id(),
            host = %moved.host_addr,
            "Container moved"
        );
        Ok(moved)
    }

    async fn remove_old(&self, container: &Container, log: &LogBuffer) -> Result<()> {
        match self.cluster.stop_container(container, STOP_GRACE).await {
            Ok(()) | Err(Error::Docker(DockerError::NotRunning(_))) => {}
            Err(e) => debug!(container = %container.short_id(), error = %e, "Stop before removal failed"),
        }
        match self.cluster.remove_container(container, true).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => {
                log.log(format!(
                    "Error removing old unit {} from {}: {}",
                    container.short_id(),
                    container.host_addr,
                    e
                ));
                warn!(container = %container.short_id(), error = %e, "Failed to remove moved container");
            }
        }
        match self
            .cluster
            .set_container_state(container, ContainerStateChange::Removed)
            .await
        {
            Err(e) if !e.is_not_found() => Err(e),
            _ => Ok(()),
        }
    }

    /// Move every container on `from_host` to `dest`, in parallel.
    pub async fn move_containers(&self, from_host: &str, dest: Destination, log: &LogBuffer) -> Result<()> {
        let containers = self.containers.list_containers_by_host(from_host).await?;
        if containers.is_empty() {
            log.log(format!("No units to move in {}", from_host));
            return Ok(());
        }
        log.log(format!("Moving {} units...", containers.len()));
        let locker = self.locks.locker();
        let results = join_all(
            containers
                .iter()
                .map(|c| self.move_one_container(c, dest.clone(), log, &locker)),
        )
        .await;
        let errors = results.into_iter().filter_map(|r| r.err()).collect();
        handle_move_errors(errors, log)
    }
}

/// Report move errors to the log and fold them into one.
pub fn handle_move_errors(errors: Vec<Error>, log: &LogBuffer) -> Result<()> {
    let mut multi = MultiError::new();
    for err in errors {
        let msg = format!("Error moving container: {}", err);
        error!("{}", msg);
        log.log(msg);
        multi.add(err);
    }
    multi.into_result()
}
