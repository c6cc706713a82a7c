// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-memory storage backend.
//!
//! Each store is a map behind a tokio mutex. Every compare-and-set runs
//! under the lock, so the backend gives the same guarantees as the SQLite
//! one within a single process.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::Mutex;

use super::{
    ContainerStorage, EventStorage, ImageStorage, MachineStorage, NodeStatusStorage, NodeStorage,
    ScopedConfigStorage, StaleQuery, chrono_duration,
};
use crate::container::{Container, ContainerStatus};
use crate::error::{Error, Result};
use crate::events::{Event, EventFilter, Target, TargetKind};
use crate::iaas::Machine;
use crate::node::{MAX_NODE_CHECKS, Node, NodeChecks, NodeStatusData};
use crate::scopedconfig::{json_get, json_remove, json_set};

type ScopedKey = (String, String, String);

/// Storage backend keeping everything in process memory.
#[derive(Default)]
pub struct MemoryStorage {
    nodes: Mutex<BTreeMap<String, Node>>,
    containers: Mutex<BTreeMap<String, Container>>,
    node_status: Mutex<BTreeMap<String, NodeStatusData>>,
    scoped: Mutex<BTreeMap<ScopedKey, Value>>,
    events: Mutex<Vec<Event>>,
    images: Mutex<BTreeMap<String, String>>,
    machines: Mutex<BTreeMap<String, Machine>>,
}

impl MemoryStorage {
    /// Empty storage.
    pub fn new() -> Self {
        Self::default()
    }
}

fn scoped_key(collection: &str, name: &str, pool: &str) -> ScopedKey {
    (collection.to_string(), name.to_string(), pool.to_string())
}

fn is_empty_field(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => true,
        Some(Value::String(s)) => s.is_empty(),
        Some(_) => false,
    }
}

#[async_trait]
impl NodeStorage for MemoryStorage {
    async fn store_node(&self, node: &Node) -> Result<()> {
        let mut nodes = self.nodes.lock().await;
        if nodes.contains_key(&node.address) {
            return Err(Error::DuplicateNode(node.address.clone()));
        }
        nodes.insert(node.address.clone(), node.clone());
        Ok(())
    }

    async fn retrieve_nodes(&self) -> Result<Vec<Node>> {
        Ok(self.nodes.lock().await.values().cloned().collect())
    }

    async fn retrieve_node(&self, address: &str) -> Result<Node> {
        self.nodes
            .lock()
            .await
            .get(address)
            .cloned()
            .ok_or_else(|| Error::NodeNotFound(address.to_string()))
    }

    async fn update_node(&self, node: &Node) -> Result<()> {
        let mut nodes = self.nodes.lock().await;
        let stored = nodes
            .get_mut(&node.address)
            .ok_or_else(|| Error::NodeNotFound(node.address.clone()))?;
        stored.metadata = node.metadata.clone();
        stored.creation_status = node.creation_status;
        Ok(())
    }

    async fn remove_node(&self, address: &str) -> Result<()> {
        self.nodes
            .lock()
            .await
            .remove(address)
            .map(|_| ())
            .ok_or_else(|| Error::NodeNotFound(address.to_string()))
    }

    async fn lock_node_for_healing(
        &self,
        address: &str,
        is_failure: bool,
        timeout: Duration,
    ) -> Result<bool> {
        let now = Utc::now();
        let mut nodes = self.nodes.lock().await;
        let node = nodes
            .get_mut(address)
            .ok_or_else(|| Error::NodeNotFound(address.to_string()))?;
        if node.healing.locked_until.is_some_and(|until| until > now) {
            return Ok(false);
        }
        node.healing.locked_until = Some(now + chrono_duration(timeout));
        node.healing.is_failure = is_failure;
        Ok(true)
    }

    async fn extend_node_lock(&self, address: &str, timeout: Duration) -> Result<()> {
        let mut nodes = self.nodes.lock().await;
        if let Some(node) = nodes.get_mut(address) {
            node.healing.locked_until = Some(Utc::now() + chrono_duration(timeout));
        }
        Ok(())
    }

    async fn unlock_node(&self, address: &str) -> Result<()> {
        let mut nodes = self.nodes.lock().await;
        if let Some(node) = nodes.get_mut(address) {
            node.healing = Default::default();
        }
        Ok(())
    }
}

#[async_trait]
impl ContainerStorage for MemoryStorage {
    async fn store_container(&self, container: &Container) -> Result<()> {
        self.containers
            .lock()
            .await
            .insert(container.id.clone(), container.clone());
        Ok(())
    }

    async fn get_container(&self, id_or_name: &str) -> Result<Container> {
        let containers = self.containers.lock().await;
        if let Some(c) = containers.get(id_or_name) {
            return Ok(c.clone());
        }
        containers
            .values()
            .find(|c| c.name == id_or_name)
            .cloned()
            .ok_or_else(|| Error::UnitNotFound(id_or_name.to_string()))
    }

    async fn remove_container(&self, id: &str) -> Result<()> {
        self.containers
            .lock()
            .await
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| Error::UnitNotFound(id.to_string()))
    }

    async fn list_containers_by_host(&self, host_addr: &str) -> Result<Vec<Container>> {
        Ok(self
            .containers
            .lock()
            .await
            .values()
            .filter(|c| c.host_addr == host_addr)
            .cloned()
            .collect())
    }

    async fn list_all_containers(&self) -> Result<Vec<Container>> {
        Ok(self.containers.lock().await.values().cloned().collect())
    }

    async fn list_unresponsive_containers(&self, cutoff: DateTime<Utc>) -> Result<Vec<Container>> {
        Ok(self
            .containers
            .lock()
            .await
            .values()
            .filter(|c| {
                !c.id.is_empty()
                    && !c.app_name.is_empty()
                    && c.last_success_status_update.is_none_or(|t| t < cutoff)
                    && (!c.host_port.is_empty() || !c.process_name.is_empty())
                    && !matches!(c.status, ContainerStatus::Building | ContainerStatus::Asleep)
            })
            .cloned()
            .collect())
    }

    async fn set_container_status(
        &self,
        id: &str,
        status: ContainerStatus,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let mut containers = self.containers.lock().await;
        match containers.get_mut(id) {
            Some(c) if c.status != ContainerStatus::Building => {
                c.set_status(status, now);
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Err(Error::UnitNotFound(id.to_string())),
        }
    }
}

#[async_trait]
impl NodeStatusStorage for MemoryStorage {
    async fn push_node_status(
        &self,
        address: &str,
        now: DateTime<Utc>,
        success: bool,
        checks: NodeChecks,
    ) -> Result<()> {
        let mut all = self.node_status.lock().await;
        let entry = all
            .entry(address.to_string())
            .or_insert_with(|| NodeStatusData {
                address: address.to_string(),
                last_update: now,
                last_success: None,
                checks: vec![],
            });
        entry.last_update = now;
        if success {
            entry.last_success = Some(now);
        }
        entry.checks.push(checks);
        if entry.checks.len() > MAX_NODE_CHECKS {
            let excess = entry.checks.len() - MAX_NODE_CHECKS;
            entry.checks.drain(..excess);
        }
        Ok(())
    }

    async fn get_node_status(&self, address: &str) -> Result<Option<NodeStatusData>> {
        Ok(self.node_status.lock().await.get(address).cloned())
    }

    async fn find_stale_node_status(
        &self,
        addresses: &[String],
        query: &StaleQuery,
    ) -> Result<Vec<NodeStatusData>> {
        let all = self.node_status.lock().await;
        Ok(addresses
            .iter()
            .filter_map(|addr| all.get(addr))
            .filter(|status| query.matches(status))
            .cloned()
            .collect())
    }

    async fn remove_node_status(&self, address: &str) -> Result<()> {
        self.node_status.lock().await.remove(address);
        Ok(())
    }
}

#[async_trait]
impl ScopedConfigStorage for MemoryStorage {
    async fn get_entry(&self, collection: &str, name: &str, pool: &str) -> Result<Option<Value>> {
        Ok(self
            .scoped
            .lock()
            .await
            .get(&scoped_key(collection, name, pool))
            .cloned())
    }

    async fn list_entries(&self, collection: &str, name: &str) -> Result<Vec<(String, Value)>> {
        Ok(self
            .scoped
            .lock()
            .await
            .iter()
            .filter(|((c, n, _), _)| c == collection && n == name)
            .map(|((_, _, pool), v)| (pool.clone(), v.clone()))
            .collect())
    }

    async fn list_names(&self, collection: &str) -> Result<Vec<String>> {
        let mut names: Vec<String> = self
            .scoped
            .lock()
            .await
            .keys()
            .filter(|(c, _, _)| c == collection)
            .map(|(_, n, _)| n.clone())
            .collect();
        names.dedup();
        Ok(names)
    }

    async fn put_entry(
        &self,
        collection: &str,
        name: &str,
        pool: &str,
        value: Value,
    ) -> Result<()> {
        self.scoped
            .lock()
            .await
            .insert(scoped_key(collection, name, pool), value);
        Ok(())
    }

    async fn set_field(
        &self,
        collection: &str,
        name: &str,
        pool: &str,
        path: &str,
        value: Value,
    ) -> Result<()> {
        let mut scoped = self.scoped.lock().await;
        let doc = scoped
            .entry(scoped_key(collection, name, pool))
            .or_insert_with(|| Value::Object(Default::default()));
        json_set(doc, path, value);
        Ok(())
    }

    async fn set_field_if_empty(
        &self,
        collection: &str,
        name: &str,
        pool: &str,
        path: &str,
        value: Value,
    ) -> Result<bool> {
        let mut scoped = self.scoped.lock().await;
        let doc = scoped
            .entry(scoped_key(collection, name, pool))
            .or_insert_with(|| Value::Object(Default::default()));
        if !is_empty_field(json_get(doc, path)) {
            return Ok(false);
        }
        json_set(doc, path, value);
        Ok(true)
    }

    async fn remove_entry(&self, collection: &str, name: &str, pool: &str) -> Result<bool> {
        Ok(self
            .scoped
            .lock()
            .await
            .remove(&scoped_key(collection, name, pool))
            .is_some())
    }

    async fn remove_field(
        &self,
        collection: &str,
        name: &str,
        pool: &str,
        path: &str,
    ) -> Result<()> {
        if let Some(doc) = self
            .scoped
            .lock()
            .await
            .get_mut(&scoped_key(collection, name, pool))
        {
            json_remove(doc, path);
        }
        Ok(())
    }
}

#[async_trait]
impl EventStorage for MemoryStorage {
    async fn insert_event(&self, event: &Event) -> Result<bool> {
        let mut events = self.events.lock().await;
        if events
            .iter()
            .any(|e| e.is_running() && e.target == event.target)
        {
            return Ok(false);
        }
        events.push(event.clone());
        Ok(true)
    }

    async fn running_event(&self, target: &Target) -> Result<Option<Event>> {
        Ok(self
            .events
            .lock()
            .await
            .iter()
            .find(|e| e.is_running() && &e.target == target)
            .cloned())
    }

    async fn count_events_since(
        &self,
        target_kind: TargetKind,
        target_value: Option<&str>,
        kind: &str,
        since: DateTime<Utc>,
    ) -> Result<u64> {
        let count = self
            .events
            .lock()
            .await
            .iter()
            .filter(|e| {
                e.target.kind == target_kind
                    && target_value.is_none_or(|v| e.target.value == v)
                    && e.kind == kind
                    && e.start_time >= since
            })
            .count();
        Ok(count as u64)
    }

    async fn finish_event(&self, event: &Event) -> Result<()> {
        let mut events = self.events.lock().await;
        if let Some(stored) = events.iter_mut().find(|e| e.id == event.id) {
            *stored = event.clone();
        }
        Ok(())
    }

    async fn remove_event(&self, id: &str) -> Result<()> {
        self.events.lock().await.retain(|e| e.id != id);
        Ok(())
    }

    async fn list_events(&self, filter: &EventFilter) -> Result<Vec<Event>> {
        let mut found: Vec<Event> = self
            .events
            .lock()
            .await
            .iter()
            .filter(|e| filter.matches(e))
            .cloned()
            .collect();
        found.sort_by(|a, b| b.start_time.cmp(&a.start_time));
        if filter.limit > 0 {
            found.truncate(filter.limit);
        }
        Ok(found)
    }
}

#[async_trait]
impl ImageStorage for MemoryStorage {
    async fn store_image_digest(&self, image: &str, digest: &str) -> Result<()> {
        self.images
            .lock()
            .await
            .insert(image.to_string(), digest.to_string());
        Ok(())
    }

    async fn image_digest(&self, image: &str) -> Result<Option<String>> {
        Ok(self.images.lock().await.get(image).cloned())
    }
}

#[async_trait]
impl MachineStorage for MemoryStorage {
    async fn insert_machine(&self, machine: &Machine) -> Result<()> {
        self.machines
            .lock()
            .await
            .insert(machine.id.clone(), machine.clone());
        Ok(())
    }

    async fn find_machine_by_id(&self, id: &str) -> Result<Option<Machine>> {
        Ok(self.machines.lock().await.get(id).cloned())
    }

    async fn find_machine_by_address(&self, address: &str) -> Result<Option<Machine>> {
        Ok(self
            .machines
            .lock()
            .await
            .values()
            .find(|m| m.address == address)
            .cloned())
    }

    async fn list_machines(&self) -> Result<Vec<Machine>> {
        Ok(self.machines.lock().await.values().cloned().collect())
    }

    async fn remove_machine(&self, id: &str) -> Result<()> {
        self.machines.lock().await.remove(id);
        Ok(())
    }
}
