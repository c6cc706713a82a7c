// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Persistence layer.
//!
//! Every component talks to storage through one of the traits below. Two
//! backends implement all of them:
//!
//! - [`sqlite::SqliteStorage`]: sqlx + SQLite, used by the server binary
//! - [`memory::MemoryStorage`]: in-process maps, used by tests and embedders
//!
//! Compare-and-set operations (node locks, atomic field writes, in-flight
//! event uniqueness) are implemented as single conditional writes so that
//! several processes can share one database.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::container::{Container, ContainerStatus};
use crate::error::Result;
use crate::events::{Event, EventFilter, Target, TargetKind};
use crate::iaas::Machine;
use crate::node::{Node, NodeChecks, NodeStatusData};

/// In-memory backend.
pub mod memory;

/// SQLite backend.
pub mod sqlite;

pub use memory::MemoryStorage;
pub use sqlite::SqliteStorage;

/// Node registry records.
#[async_trait]
pub trait NodeStorage: Send + Sync {
    /// Insert a node; fails with `DuplicateNode` if the address exists.
    async fn store_node(&self, node: &Node) -> Result<()>;

    /// All nodes, ordered by address.
    async fn retrieve_nodes(&self) -> Result<Vec<Node>>;

    /// One node; fails with `NodeNotFound`.
    async fn retrieve_node(&self, address: &str) -> Result<Node>;

    /// Replace metadata and creation status. The healing lock is untouched.
    async fn update_node(&self, node: &Node) -> Result<()>;

    /// Delete a node; fails with `NodeNotFound`.
    async fn remove_node(&self, address: &str) -> Result<()>;

    /// Take the healing lock iff it is free. Fails with `NodeNotFound`.
    async fn lock_node_for_healing(
        &self,
        address: &str,
        is_failure: bool,
        timeout: Duration,
    ) -> Result<bool>;

    /// Push the lock expiry to `now + timeout` unconditionally.
    async fn extend_node_lock(&self, address: &str, timeout: Duration) -> Result<()>;

    /// Clear the healing lock.
    async fn unlock_node(&self, address: &str) -> Result<()>;
}

/// Application container records.
#[async_trait]
pub trait ContainerStorage: Send + Sync {
    /// Insert or replace a container by id.
    async fn store_container(&self, container: &Container) -> Result<()>;

    /// Container by id or name; fails with `UnitNotFound`.
    async fn get_container(&self, id_or_name: &str) -> Result<Container>;

    /// Delete a container by id; fails with `UnitNotFound`.
    async fn remove_container(&self, id: &str) -> Result<()>;

    /// Containers on one host, ordered by id.
    async fn list_containers_by_host(&self, host_addr: &str) -> Result<Vec<Container>>;

    /// Every container, ordered by id.
    async fn list_all_containers(&self) -> Result<Vec<Container>>;

    /// Containers whose last success is older than `cutoff`, that expose a
    /// port or run a process, have an id and an app, and are neither
    /// building nor asleep.
    async fn list_unresponsive_containers(&self, cutoff: DateTime<Utc>) -> Result<Vec<Container>>;

    /// Apply a status unless the container is building. Returns whether the
    /// record was changed.
    async fn set_container_status(
        &self,
        id: &str,
        status: ContainerStatus,
        now: DateTime<Utc>,
    ) -> Result<bool>;
}

/// Per-node rolling health records.
#[async_trait]
pub trait NodeStatusStorage: Send + Sync {
    /// Upsert the record: `last_update = now`, `last_success = now` when
    /// `success`, and push `checks` keeping the newest `MAX_NODE_CHECKS`.
    async fn push_node_status(
        &self,
        address: &str,
        now: DateTime<Utc>,
        success: bool,
        checks: NodeChecks,
    ) -> Result<()>;

    /// One record.
    async fn get_node_status(&self, address: &str) -> Result<Option<NodeStatusData>>;

    /// Records among `addresses` that match any of the query's thresholds.
    async fn find_stale_node_status(
        &self,
        addresses: &[String],
        query: &StaleQuery,
    ) -> Result<Vec<NodeStatusData>>;

    /// Delete a record. Missing records are ignored.
    async fn remove_node_status(&self, address: &str) -> Result<()>;
}

/// Thresholds selecting node status records for healing. Conditions are
/// OR'ed; a query with no condition matches nothing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StaleQuery {
    /// Match records whose last success is older than this (or absent).
    pub last_success_before: Option<DateTime<Utc>>,
    /// Match records whose last update is older than this.
    pub last_update_before: Option<DateTime<Utc>>,
}

impl StaleQuery {
    /// Whether the query has no condition.
    pub fn is_empty(&self) -> bool {
        self.last_success_before.is_none() && self.last_update_before.is_none()
    }

    /// Evaluate the query against one record.
    pub fn matches(&self, status: &NodeStatusData) -> bool {
        let success = self
            .last_success_before
            .is_some_and(|cutoff| status.last_success.is_none_or(|t| t < cutoff));
        let update = self
            .last_update_before
            .is_some_and(|cutoff| status.last_update < cutoff);
        success || update
    }
}

/// Scoped config entries, stored as JSON documents.
#[async_trait]
pub trait ScopedConfigStorage: Send + Sync {
    /// Raw entry.
    async fn get_entry(&self, collection: &str, name: &str, pool: &str) -> Result<Option<Value>>;

    /// All `(pool, value)` entries for one name.
    async fn list_entries(&self, collection: &str, name: &str) -> Result<Vec<(String, Value)>>;

    /// Distinct entry names in a collection, sorted.
    async fn list_names(&self, collection: &str) -> Result<Vec<String>>;

    /// Insert or overwrite an entry.
    async fn put_entry(&self, collection: &str, name: &str, pool: &str, value: Value)
    -> Result<()>;

    /// Upsert a dotted field path.
    async fn set_field(
        &self,
        collection: &str,
        name: &str,
        pool: &str,
        path: &str,
        value: Value,
    ) -> Result<()>;

    /// Upsert a dotted field path only if it is absent or `""`.
    async fn set_field_if_empty(
        &self,
        collection: &str,
        name: &str,
        pool: &str,
        path: &str,
        value: Value,
    ) -> Result<bool>;

    /// Delete an entry. Returns whether it existed.
    async fn remove_entry(&self, collection: &str, name: &str, pool: &str) -> Result<bool>;

    /// Delete a dotted field path. Missing entries are ignored.
    async fn remove_field(&self, collection: &str, name: &str, pool: &str, path: &str)
    -> Result<()>;
}

/// Event journal records.
#[async_trait]
pub trait EventStorage: Send + Sync {
    /// Insert a running event. Returns false, without writing, when another
    /// running event exists for the same target.
    async fn insert_event(&self, event: &Event) -> Result<bool>;

    /// The running event for a target, if any.
    async fn running_event(&self, target: &Target) -> Result<Option<Event>>;

    /// Count events of `kind` against `target_kind` (and `target_value`
    /// when given) started at or after `since`.
    async fn count_events_since(
        &self,
        target_kind: TargetKind,
        target_value: Option<&str>,
        kind: &str,
        since: DateTime<Utc>,
    ) -> Result<u64>;

    /// Persist the outcome of a finished event.
    async fn finish_event(&self, event: &Event) -> Result<()>;

    /// Delete an event.
    async fn remove_event(&self, id: &str) -> Result<()>;

    /// Events matching the filter, newest first.
    async fn list_events(&self, filter: &EventFilter) -> Result<Vec<Event>>;
}

/// Last pulled digest per image.
#[async_trait]
pub trait ImageStorage: Send + Sync {
    /// Record the digest produced by the latest pull of `image`.
    async fn store_image_digest(&self, image: &str, digest: &str) -> Result<()>;

    /// Digest recorded for `image`.
    async fn image_digest(&self, image: &str) -> Result<Option<String>>;
}

/// IaaS machine records.
#[async_trait]
pub trait MachineStorage: Send + Sync {
    /// Insert a machine.
    async fn insert_machine(&self, machine: &Machine) -> Result<()>;

    /// Machine by provider id.
    async fn find_machine_by_id(&self, id: &str) -> Result<Option<Machine>>;

    /// Machine by address.
    async fn find_machine_by_address(&self, address: &str) -> Result<Option<Machine>>;

    /// Every machine.
    async fn list_machines(&self) -> Result<Vec<Machine>>;

    /// Delete a machine record.
    async fn remove_machine(&self, id: &str) -> Result<()>;
}

/// A backend implementing every store.
pub trait Storage:
    NodeStorage
    + ContainerStorage
    + NodeStatusStorage
    + ScopedConfigStorage
    + EventStorage
    + ImageStorage
    + MachineStorage
{
}

impl<S> Storage for S where
    S: NodeStorage
        + ContainerStorage
        + NodeStatusStorage
        + ScopedConfigStorage
        + EventStorage
        + ImageStorage
        + MachineStorage
{
}

/// Handles to every store, usually all backed by the same object.
#[derive(Clone)]
pub struct Stores {
    /// Node registry.
    pub nodes: Arc<dyn NodeStorage>,
    /// Application containers.
    pub containers: Arc<dyn ContainerStorage>,
    /// Node health records.
    pub node_status: Arc<dyn NodeStatusStorage>,
    /// Scoped config entries.
    pub scoped: Arc<dyn ScopedConfigStorage>,
    /// Event journal.
    pub events: Arc<dyn EventStorage>,
    /// Image digests.
    pub images: Arc<dyn ImageStorage>,
    /// IaaS machines.
    pub machines: Arc<dyn MachineStorage>,
}

impl Stores {
    /// Use one backend for every store.
    pub fn from_backend<S: Storage + 'static>(backend: Arc<S>) -> Self {
        Self {
            nodes: backend.clone(),
            containers: backend.clone(),
            node_status: backend.clone(),
            scoped: backend.clone(),
            events: backend.clone(),
            images: backend.clone(),
            machines: backend,
        }
    }

    /// Fresh in-memory stores.
    pub fn memory() -> Self {
        Self::from_backend(Arc::new(memory::MemoryStorage::new()))
    }
}

pub(crate) fn to_millis(t: DateTime<Utc>) -> i64 {
    t.timestamp_millis()
}

pub(crate) fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

pub(crate) fn chrono_duration(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or(chrono::Duration::MAX)
}
