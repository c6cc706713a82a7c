// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Node healer.
//!
//! A node is replaced when it keeps failing Docker calls (reported by the
//! registry through [`HealerPolicy`]) or when its agent stops reporting
//! healthy status (found by the periodic scan). Replacement means a new
//! IaaS machine registered in its place, the containers moved over, and
//! the old machine destroyed.
//!
//! Per-pool thresholds live in the `node-healer` scoped config:
//!
//! | Field | Meaning |
//! |-------|---------|
//! | `enabled` | Scan the pool at all |
//! | `maxtimesincesuccess` | Seconds without a fully successful report |
//! | `maxunresponsivetime` | Seconds without any report |

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use super::is_event_locked;
use crate::bs::RUN_BS_TASK;
use crate::config::Config;
use crate::error::{Error, MultiError, Result};
use crate::events::{EventJournal, HEALER_KIND, NewEventOptions, NodeHealingData, Target};
use crate::iaas::{IaasError, IaasRegistry, Machine};
use crate::node::{CreationStatus, META_IAAS, Node, NodeCheckResult, NodeChecks, url_to_host};
use crate::provisioner::{Destination, LogBuffer, Provisioner};
use crate::queue::TaskQueue;
use crate::registry::{HealerPolicy, NodeRegistry};
use crate::scopedconfig::{Merge, MergeOptions, ScopedConfig, merge_field};
use crate::storage::{NodeStatusStorage, StaleQuery, Stores};

/// Scoped config collection with healer thresholds.
pub const HEALER_CONFIG_COLLECTION: &str = "node-healer";

/// Thresholds for one pool. Durations are in seconds.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeHealerConfig {
    /// Scan this pool.
    #[serde(default)]
    pub enabled: Option<bool>,
    /// Heal after this long without a fully successful report.
    #[serde(default, rename = "maxtimesincesuccess")]
    pub max_time_since_success: Option<u64>,
    /// Heal after this long without any report.
    #[serde(default, rename = "maxunresponsivetime")]
    pub max_unresponsive_time: Option<u64>,
    /// `enabled` came from the base entry.
    #[serde(default, rename = "enabledinherited")]
    pub enabled_inherited: bool,
    /// `max_time_since_success` came from the base entry.
    #[serde(default, rename = "maxtimesincesuccessinherited")]
    pub max_time_since_success_inherited: bool,
    /// `max_unresponsive_time` came from the base entry.
    #[serde(default, rename = "maxunresponsivetimeinherited")]
    pub max_unresponsive_time_inherited: bool,
}

impl Merge for NodeHealerConfig {
    fn is_empty_value(&self, opts: &MergeOptions) -> bool {
        !opts.allow_empty && *self == NodeHealerConfig::default()
    }

    fn merge_from(&mut self, over: &Self, opts: &MergeOptions) -> bool {
        let enabled = merge_field(&mut self.enabled, &over.enabled, opts);
        let since_success =
            merge_field(&mut self.max_time_since_success, &over.max_time_since_success, opts);
        let unresponsive =
            merge_field(&mut self.max_unresponsive_time, &over.max_unresponsive_time, opts);
        if opts.set_inherited {
            self.enabled_inherited = !enabled;
            self.max_time_since_success_inherited = !since_success;
            self.max_unresponsive_time_inherited = !unresponsive;
        }
        enabled || since_success || unresponsive
    }
}

/// Process-level healer settings.
#[derive(Debug, Clone)]
pub struct NodeHealerSettings {
    /// Consecutive failures before a node is replaced.
    pub failures_before_healing: u32,
    /// How long a failing node is kept out of scheduling.
    pub disabled_time: Duration,
    /// How long a new machine gets to come up.
    pub wait_new_time: Duration,
    /// Scheme for new node addresses.
    pub node_protocol: String,
    /// Docker port for new node addresses.
    pub node_port: u16,
    /// Interval between scans.
    pub poll_interval: Duration,
}

impl Default for NodeHealerSettings {
    fn default() -> Self {
        Self {
            failures_before_healing: 5,
            disabled_time: Duration::from_secs(30),
            wait_new_time: Duration::from_secs(5 * 60),
            node_protocol: "http".to_string(),
            node_port: 2375,
            poll_interval: Duration::from_secs(30),
        }
    }
}

impl From<&Config> for NodeHealerSettings {
    fn from(config: &Config) -> Self {
        Self {
            failures_before_healing: config.failures_before_healing,
            disabled_time: config.disabled_time,
            wait_new_time: config.wait_new_time,
            node_protocol: config.iaas_node_protocol.clone(),
            node_port: config.iaas_node_port,
            ..Default::default()
        }
    }
}

/// Health report sent by a node agent.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeStatusReport {
    /// Addresses the agent sees on its host.
    #[serde(default)]
    pub addrs: Vec<String>,
    /// Container ids or names running on the host.
    #[serde(default)]
    pub units: Vec<String>,
    /// Check results.
    #[serde(default)]
    pub checks: Vec<NodeCheckResult>,
}

/// Replaces failing nodes.
pub struct NodeHealer {
    registry: Arc<NodeRegistry>,
    provisioner: Arc<Provisioner>,
    journal: EventJournal,
    queue: Arc<TaskQueue>,
    iaas: Option<Arc<IaasRegistry>>,
    node_status: Arc<dyn NodeStatusStorage>,
    config: ScopedConfig<NodeHealerConfig>,
    settings: NodeHealerSettings,
    started: DateTime<Utc>,
    rotation: AtomicU64,
    shutdown: Arc<Notify>,
}

impl NodeHealer {
    /// Create a healer. Without [`with_iaas`](Self::with_iaas) failing nodes
    /// are never replaced.
    pub fn new(
        provisioner: Arc<Provisioner>,
        journal: EventJournal,
        queue: Arc<TaskQueue>,
        stores: &Stores,
        settings: NodeHealerSettings,
    ) -> Self {
        let config = ScopedConfig::new(stores.scoped.clone(), HEALER_CONFIG_COLLECTION)
            .with_options(MergeOptions {
                allow_empty: true,
                ..Default::default()
            });
        Self {
            registry: provisioner.cluster().registry().clone(),
            provisioner,
            journal,
            queue,
            iaas: None,
            node_status: stores.node_status.clone(),
            config,
            settings,
            started: Utc::now(),
            rotation: AtomicU64::new(0),
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Provision replacements through `iaas`.
    pub fn with_iaas(mut self, iaas: Arc<IaasRegistry>) -> Self {
        self.iaas = Some(iaas);
        self
    }

    /// Override the start instant used for the scan warm-up.
    pub fn with_start_time(mut self, started: DateTime<Utc>) -> Self {
        self.started = started;
        self
    }

    /// Handle used to stop [`run`](Self::run).
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Scan for stale nodes until shutdown, starting with an immediate pass.
    pub async fn run(&self) {
        info!(
            poll_interval_secs = self.settings.poll_interval.as_secs(),
            "Node healer started"
        );

        loop {
            self.run_active_healing().await;

            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("Node healer received shutdown signal");
                    break;
                }

                _ = tokio::time::sleep(self.settings.poll_interval) => {}
            }
        }

        info!("Node healer stopped");
    }

    /// Merge `partial` into the thresholds of `pool` (`""` for the base).
    pub async fn update_config(&self, pool: &str, partial: &NodeHealerConfig) -> Result<()> {
        let partial = NodeHealerConfig {
            enabled_inherited: false,
            max_time_since_success_inherited: false,
            max_unresponsive_time_inherited: false,
            ..partial.clone()
        };
        self.config.save_merge(pool, &partial).await
    }

    /// Drop the thresholds of `pool`, or only one field of them.
    pub async fn remove_config(&self, pool: &str, field: Option<&str>) -> Result<()> {
        match field.filter(|f| !f.is_empty()) {
            Some(field) => self.config.remove_field(pool, field).await,
            None => {
                self.config.remove(pool).await?;
                Ok(())
            }
        }
    }

    /// Effective thresholds per pool, base under `""`.
    pub async fn get_config(&self) -> Result<BTreeMap<String, NodeHealerConfig>> {
        self.config.load_all().await
    }

    /// Record a health report from a node agent.
    pub async fn update_node_data(&self, report: &NodeStatusReport) -> Result<()> {
        let address = self.find_node_for_report(report).await?;
        let success = report.checks.iter().all(|c| c.successful);
        let now = Utc::now();
        let checks = NodeChecks {
            time: now,
            checks: report.checks.clone(),
        };
        self.node_status
            .push_node_status(&address, now, success, checks)
            .await?;
        debug!(node = %address, success, "Node status recorded");
        Ok(())
    }

    async fn find_node_for_report(&self, report: &NodeStatusReport) -> Result<String> {
        let nodes = self.registry.unfiltered_list().await?;

        let mut hosts: Vec<String> = Vec::new();
        for unit in &report.units {
            match self.provisioner.containers().get_container(unit).await {
                Ok(c) if !c.host_addr.is_empty() && !hosts.contains(&c.host_addr) => {
                    hosts.push(c.host_addr)
                }
                Ok(_) | Err(Error::UnitNotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }
        if hosts.len() > 1 {
            return Err(Error::Validation(format!(
                "containers match multiple nodes: {}",
                hosts.join(" and ")
            )));
        }
        if let Some(host) = hosts.first() {
            if let Some(node) = nodes.iter().find(|n| n.host() == *host) {
                return Ok(node.address.clone());
            }
        }

        let report_hosts: Vec<String> = report.addrs.iter().map(|a| url_to_host(a)).collect();
        let matched: Vec<&Node> = nodes
            .iter()
            .filter(|n| report.addrs.contains(&n.address) || report_hosts.contains(&n.host()))
            .collect();
        match matched.as_slice() {
            [node] => Ok(node.address.clone()),
            [] => Err(Error::NodeNotFound(format!(
                "node not found for addrs {:?}",
                report.addrs
            ))),
            many => Err(Error::Validation(format!(
                "addrs match multiple nodes: {}",
                many.iter()
                    .map(|n| n.address.as_str())
                    .collect::<Vec<_>>()
                    .join(" and ")
            ))),
        }
    }

    fn query_for(&self, config: &NodeHealerConfig) -> Option<StaleQuery> {
        if config.enabled != Some(true) {
            return None;
        }
        let now = Utc::now();
        let cutoff = |secs: Option<u64>| {
            let threshold = chrono::Duration::seconds(i64::try_from(secs.filter(|s| *s > 0)?).ok()?);
            let cutoff = now - threshold;
            (self.started + threshold < cutoff).then_some(cutoff)
        };
        let query = StaleQuery {
            last_success_before: cutoff(config.max_time_since_success),
            last_update_before: cutoff(config.max_unresponsive_time),
        };
        (!query.is_empty()).then_some(query)
    }

    async fn should_heal_node(&self, node: &Node) -> Result<bool> {
        let config = self.config.load(node.pool()).await?;
        let Some(query) = self.query_for(&config) else {
            return Ok(false);
        };
        let stale = self
            .node_status
            .find_stale_node_status(std::slice::from_ref(&node.address), &query)
            .await?;
        Ok(!stale.is_empty())
    }

    /// One scan over every node.
    pub async fn run_active_healing(&self) {
        let (statuses, mut nodes) = match self.find_nodes_for_healing().await {
            Ok(found) => found,
            Err(e) => {
                error!(error = %e, "Failed to find nodes for healing");
                return;
            }
        };
        let now = Utc::now();
        for status in statuses {
            let Some(mut node) = nodes.remove(&status.address) else {
                continue;
            };
            let since_update = since(now, Some(status.last_update));
            let since_success = since(now, status.last_success);
            let reason = format!("last update {} ago, last success {} ago", since_update, since_success);
            let last_check = status.checks.last().cloned();
            if let Err(e) = self.try_healing_node(&mut node, &reason, last_check).await {
                error!(node = %status.address, error = %e, "Active node healing failed");
            }
        }
    }

    async fn find_nodes_for_healing(
        &self,
    ) -> Result<(Vec<crate::node::NodeStatusData>, BTreeMap<String, Node>)> {
        let nodes = self.registry.unfiltered_list().await?;
        let mut by_pool: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for node in &nodes {
            by_pool
                .entry(node.pool().to_string())
                .or_default()
                .push(node.address.clone());
        }
        let by_address: BTreeMap<String, Node> =
            nodes.into_iter().map(|n| (n.address.clone(), n)).collect();

        let entries = self.config.load_all().await?;
        let mut statuses = Vec::new();
        for (pool, entry) in &entries {
            if pool.is_empty() {
                continue;
            }
            let addresses = by_pool.remove(pool).unwrap_or_default();
            if let Some(query) = self.query_for(entry).filter(|_| !addresses.is_empty()) {
                statuses.extend(self.node_status.find_stale_node_status(&addresses, &query).await?);
            }
        }
        let remaining: Vec<String> = by_pool.into_values().flatten().collect();
        if let Some(base) = entries.get("") {
            if let Some(query) = self.query_for(base).filter(|_| !remaining.is_empty()) {
                statuses.extend(self.node_status.find_stale_node_status(&remaining, &query).await?);
            }
        }

        if !statuses.is_empty() {
            let pivot = self.rotation.fetch_add(1, Ordering::Relaxed) % statuses.len() as u64;
            statuses.rotate_left(pivot as usize);
        }
        Ok((statuses, by_address))
    }

    /// Heal `node` unless another healing already owns it.
    ///
    /// Nodes without IaaS metadata are skipped. The node is re-checked
    /// against the registry and the thresholds once the healing event is
    /// held; when either check says no, the event is dropped.
    pub async fn try_healing_node(
        &self,
        node: &mut Node,
        reason: &str,
        last_check: Option<NodeChecks>,
    ) -> Result<()> {
        let Some(iaas) = self.iaas.clone() else {
            debug!(node = %node.address, "No IaaS configured, node healing disabled");
            return Ok(());
        };
        if node.iaas().is_none() {
            debug!(node = %node.address, reason = %reason, "Node has no IaaS information, healing won't run on it");
            return Ok(());
        }

        let data = NodeHealingData {
            node: node.clone(),
            reason: reason.to_string(),
            last_check,
        };
        let handle = match self
            .journal
            .new_internal(NewEventOptions {
                target: Target::node(&node.address),
                kind: HEALER_KIND.to_string(),
                custom_data: serde_json::to_value(&data)?,
            })
            .await
        {
            Ok(handle) => handle,
            Err(e) if is_event_locked(&e) => return Ok(()),
            Err(e) => {
                return Err(Error::Other(format!(
                    "Error trying to insert node healing event for node {:?}, healing aborted: {}",
                    node.address, e
                )));
            }
        };

        let outcome: Result<Option<(Node, Option<Error>)>> = async {
            match self.registry.get(&node.address).await {
                Ok(_) => {}
                Err(e) if e.is_not_found() => return Ok(None),
                Err(e) => {
                    return Err(Error::Other(format!(
                        "unable to check if node {:?} still exists: {}",
                        node.address, e
                    )));
                }
            }
            let should_heal = self.should_heal_node(node).await.map_err(|e| {
                Error::Other(format!(
                    "unable to check if node {:?} should be healed: {}",
                    node.address, e
                ))
            })?;
            if !should_heal {
                return Ok(None);
            }
            error!(node = %node.address, reason = %reason, "Initiating healing process");
            self.heal_node(&iaas, node).await.map(Some)
        }
        .await;

        let (finish, result) = match outcome {
            Ok(None) => (handle.abort().await, Ok(())),
            Ok(Some((created, err))) => {
                let data = serde_json::to_value(&created)?;
                let finish = handle.done_custom_data(err.as_ref(), data).await;
                (finish, err.map_or(Ok(()), Err))
            }
            Err(e) => (handle.done_custom_data(Some(&e), Value::Null).await, Err(e)),
        };
        if let Err(e) = finish {
            error!(node = %node.address, error = %e, "Failed to update healing event");
        }
        result
    }

    async fn restore_failing(&self, node: &mut Node) {
        node.reset_failures();
        if let Err(e) = self.registry.register(node.clone()).await {
            error!(node = %node.address, error = %e, "Failed to re-register failing node");
        }
    }

    async fn destroy_quietly(&self, iaas: &IaasRegistry, machine: &Machine) {
        if let Err(e) = iaas.destroy(machine).await {
            error!(machine = %machine.id, error = %e, "Failed to destroy machine");
        }
    }

    /// Replace `node` with a new machine. Returns the new node and any
    /// non-fatal error from cleaning up the old machine.
    async fn heal_node(&self, iaas: &IaasRegistry, node: &mut Node) -> Result<(Node, Option<Error>)> {
        let failing_addr = node.address.clone();
        let failing_host = node.host();
        let failures = node.failure_count();
        let mut metadata = node.clean_metadata();
        let iaas_name = metadata.get(META_IAAS).cloned().unwrap_or_default();
        let fail = |step: &str, e: &dyn std::fmt::Display| {
            Error::Other(format!(
                "Can't auto-heal after {} failures for node {}: {}: {}",
                failures, failing_host, step, e
            ))
        };

        let machine = match iaas.create_machine_for_iaas(&iaas_name, &mut metadata).await {
            Ok(machine) => machine,
            Err(e) => {
                node.reset_failures();
                return Err(fail("error creating new machine", &e));
            }
        };

        if let Err(e) = self.registry.unregister(&failing_addr).await {
            self.destroy_quietly(iaas, &machine).await;
            return Err(fail("error unregistering old node", &e));
        }

        let new_addr =
            machine.format_node_address(&self.settings.node_protocol, self.settings.node_port);
        let mut new_node = Node::new(&new_addr).with_creation_status(CreationStatus::Pending);
        new_node.metadata = metadata.clone();
        if let Err(e) = self.registry.register(new_node.clone()).await {
            self.restore_failing(node).await;
            self.destroy_quietly(iaas, &machine).await;
            return Err(fail("error registering new node", &e));
        }
        debug!(node = %new_addr, "New machine created during healing process, waiting for docker to start");

        let params = json!({
            "endpoint": new_addr,
            "machine": machine.id,
            "metadata": metadata,
        });
        if let Err(e) = self
            .queue
            .enqueue_wait(RUN_BS_TASK, params, self.settings.wait_new_time)
            .await
        {
            if let Err(e) = self.registry.unregister(&new_addr).await {
                warn!(node = %new_addr, error = %e, "Failed to unregister new node");
            }
            self.restore_failing(node).await;
            self.destroy_quietly(iaas, &machine).await;
            return Err(fail("error waiting for new node", &e));
        }

        let log = LogBuffer::new();
        if let Err(e) = self
            .provisioner
            .move_containers(&failing_host, Destination::Anywhere, &log)
            .await
        {
            error!(
                "Unable to move containers, skipping containers healing {:?} -> {:?}: {}: {}",
                failing_host,
                new_addr,
                e,
                log.contents()
            );
        }
        if let Err(e) = self.node_status.remove_node_status(&failing_addr).await {
            error!(node = %failing_addr, error = %e, "Unable to remove node status");
        }

        let mut errors = MultiError::new();
        match iaas
            .find_machine_by_id_or_address(node.iaas_id(), &failing_host)
            .await
        {
            Ok(failing_machine) => {
                if let Err(e) = iaas.destroy(&failing_machine).await {
                    errors.add(Error::Other(format!(
                        "Unable to destroy machine {} from IaaS: {}",
                        failing_host, e
                    )));
                }
            }
            Err(Error::Iaas(IaasError::MachineNotFound)) => {}
            Err(e) => errors.add(Error::Other(format!(
                "Unable to find failing machine {} in IaaS: {}",
                failing_host, e
            ))),
        }
        info!(failing = %failing_host, created = %new_addr, "Done auto-healing node");

        let created = self.registry.get(&new_addr).await.unwrap_or(new_node);
        Ok((created, errors.into_result().err()))
    }
}

fn since(now: DateTime<Utc>, t: Option<DateTime<Utc>>) -> String {
    match t {
        Some(t) => format!("{}s", (now - t).num_seconds().max(0)),
        None => "never".to_string(),
    }
}

#[async_trait]
impl HealerPolicy for NodeHealer {
    async fn handle_error(&self, node: &mut Node) -> Duration {
        let failures = node.failure_count();
        if failures < self.settings.failures_before_healing {
            debug!(node = %node.address, failures, "Waiting for more failures before healing");
            return self.settings.disabled_time;
        }
        if !node.has_success() {
            debug!(node = %node.address, "Node never reached, healing won't run on it");
            return self.settings.disabled_time;
        }
        let reason = format!("{} consecutive failures", failures);
        if let Err(e) = self.try_healing_node(node, &reason, None).await {
            error!(node = %node.address, error = %e, "Node healing on error failed");
        }
        self.settings.disabled_time
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::Cluster;
    use crate::container::Container;
    use crate::docker::MockDocker;

    fn healer(stores: &Stores) -> NodeHealer {
        let registry = Arc::new(NodeRegistry::new(stores.nodes.clone()));
        let cluster = Arc::new(Cluster::new(registry, stores, Arc::new(MockDocker::new())));
        let provisioner = Arc::new(Provisioner::new(cluster, stores.containers.clone()));
        NodeHealer::new(
            provisioner,
            EventJournal::new(stores.events.clone()),
            Arc::new(TaskQueue::new()),
            stores,
            NodeHealerSettings::default(),
        )
    }

    #[tokio::test]
    async fn test_config_inheritance_and_removal() {
        let stores = Stores::memory();
        let healer = healer(&stores);
        healer
            .update_config(
                "",
                &NodeHealerConfig {
                    enabled: Some(true),
                    max_unresponsive_time: Some(60),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        healer
            .update_config(
                "p1",
                &NodeHealerConfig {
                    enabled: Some(false),
                    enabled_inherited: true,
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let config = healer.get_config().await.unwrap();
        assert_eq!(config[""].enabled, Some(true));
        assert!(!config[""].enabled_inherited);
        let p1 = &config["p1"];
        assert_eq!(p1.enabled, Some(false));
        assert!(!p1.enabled_inherited);
        assert_eq!(p1.max_unresponsive_time, Some(60));
        assert!(p1.max_unresponsive_time_inherited);

        healer.remove_config("", Some("MaxUnresponsiveTime")).await.unwrap();
        let config = healer.get_config().await.unwrap();
        assert_eq!(config[""].max_unresponsive_time, None);

        healer.remove_config("p1", None).await.unwrap();
        assert!(!healer.get_config().await.unwrap().contains_key("p1"));
    }

    #[tokio::test]
    async fn test_query_respects_warm_up() {
        let stores = Stores::memory();
        let config = NodeHealerConfig {
            enabled: Some(true),
            max_unresponsive_time: Some(60),
            ..Default::default()
        };
        let fresh = healer(&stores);
        assert!(fresh.query_for(&config).is_none());

        let warm = healer(&stores).with_start_time(Utc::now() - chrono::Duration::hours(1));
        let query = warm.query_for(&config).unwrap();
        assert!(query.last_update_before.is_some());
        assert!(query.last_success_before.is_none());

        let disabled = NodeHealerConfig {
            enabled: Some(false),
            ..config
        };
        assert!(warm.query_for(&disabled).is_none());
    }

    #[tokio::test]
    async fn test_update_node_data_by_unit_and_addr() {
        let stores = Stores::memory();
        let healer = healer(&stores);
        healer.registry.register(Node::new("http://10.0.0.1:2375")).await.unwrap();
        healer.registry.register(Node::new("http://10.0.0.2:2375")).await.unwrap();
        stores
            .containers
            .store_container(&Container {
                id: "c1".into(),
                app_name: "app".into(),
                host_addr: "10.0.0.2".into(),
                ..Default::default()
            })
            .await
            .unwrap();

        healer
            .update_node_data(&NodeStatusReport {
                addrs: vec!["10.0.0.9".into()],
                units: vec!["c1".into()],
                checks: vec![NodeCheckResult {
                    name: "ok".into(),
                    successful: true,
                    err: String::new(),
                }],
            })
            .await
            .unwrap();
        let status = stores
            .node_status
            .get_node_status("http://10.0.0.2:2375")
            .await
            .unwrap()
            .unwrap();
        assert!(status.last_success.is_some());
        assert_eq!(status.checks.len(), 1);

        healer
            .update_node_data(&NodeStatusReport {
                addrs: vec!["172.17.0.1".into(), "10.0.0.1".into()],
                units: vec![],
                checks: vec![NodeCheckResult {
                    name: "disk".into(),
                    successful: false,
                    err: "full".into(),
                }],
            })
            .await
            .unwrap();
        let status = stores
            .node_status
            .get_node_status("http://10.0.0.1:2375")
            .await
            .unwrap()
            .unwrap();
        assert!(status.last_success.is_none());

        let err = healer
            .update_node_data(&NodeStatusReport {
                addrs: vec!["192.168.0.1".into()],
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_handle_error_below_threshold_disables() {
        let stores = Stores::memory();
        let healer = healer(&stores);
        let mut node = Node::new("http://10.0.0.1:2375");
        node.update_error("boom", true);
        assert_eq!(healer.handle_error(&mut node).await, Duration::from_secs(30));
    }
}
