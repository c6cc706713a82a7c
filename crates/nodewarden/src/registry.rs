// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Node registry.
//!
//! Source of truth for nodes. Every mutation that touches a node's health
//! (failures, success, metadata updates) runs under the node's healing lock,
//! a TTL lease stored with the node record:
//!
//! ```text
//!   lock_node_for_healing ──► keeper task ──(every 30s)──► extend_node_lock
//!            │                                                  │
//!            └──────── critical section ──► release ──► unlock_node
//! ```
//!
//! A holder that dies without releasing stops extending the lease, so the
//! node becomes lockable again once the TTL runs out.

use std::collections::BTreeMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::node::{CreationStatus, Node};
use crate::storage::{NodeStorage, chrono_duration};

/// Lease granted by a healing lock.
pub const LOCK_TTL: Duration = Duration::from_secs(3 * 60);

/// How often a held lock is extended.
pub const LOCK_EXTEND_INTERVAL: Duration = Duration::from_secs(30);

/// Points where hooks run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookEvent {
    /// Before a container is created on a node.
    BeforeContainerCreate,
    /// Before a node is stored.
    BeforeNodeRegister,
    /// Before a node is deleted.
    BeforeNodeUnregister,
}

/// Callback attached to a [`HookEvent`]. An error aborts the operation.
#[async_trait]
pub trait ClusterHook: Send + Sync {
    /// Run for `node`.
    async fn run_hook(&self, event: HookEvent, node: &Node) -> Result<()>;
}

/// Decides what happens to a node that just failed.
#[async_trait]
pub trait HealerPolicy: Send + Sync {
    /// Called under the node's lock with the failure already recorded.
    /// Returns how long the node should be disabled; zero leaves it enabled.
    async fn handle_error(&self, node: &mut Node) -> Duration;
}

/// A held healing lock.
///
/// Dropping the guard stops the keeper but leaves the lease to expire;
/// call [`release`](Self::release) to free the node immediately.
pub struct HealingLock {
    storage: Arc<dyn NodeStorage>,
    address: String,
    keeper: Option<JoinHandle<()>>,
}

impl HealingLock {
    /// Locked node.
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Stop the keeper and unlock the node.
    pub async fn release(mut self) -> Result<()> {
        if let Some(keeper) = self.keeper.take() {
            keeper.abort();
        }
        self.storage.unlock_node(&self.address).await
    }
}

impl Drop for HealingLock {
    fn drop(&mut self) {
        if let Some(keeper) = self.keeper.take() {
            keeper.abort();
        }
    }
}

/// Node registry with hooks and health tracking.
pub struct NodeRegistry {
    storage: Arc<dyn NodeStorage>,
    hooks: RwLock<Vec<(HookEvent, Arc<dyn ClusterHook>)>>,
    healer: RwLock<Option<Weak<dyn HealerPolicy>>>,
    failures: TaskTracker,
}

impl NodeRegistry {
    /// Registry over `storage`, with no hooks and no healer.
    pub fn new(storage: Arc<dyn NodeStorage>) -> Self {
        Self {
            storage,
            hooks: RwLock::new(Vec::new()),
            healer: RwLock::new(None),
            failures: TaskTracker::new(),
        }
    }

    /// Underlying storage.
    pub fn storage(&self) -> &Arc<dyn NodeStorage> {
        &self.storage
    }

    /// Attach a hook.
    pub async fn add_hook(&self, event: HookEvent, hook: Arc<dyn ClusterHook>) {
        self.hooks.write().await.push((event, hook));
    }

    /// Install the failure policy. The registry keeps a weak reference; the
    /// caller owns the healer.
    pub async fn set_healer(&self, healer: &Arc<dyn HealerPolicy>) {
        *self.healer.write().await = Some(Arc::downgrade(healer));
    }

    async fn healer(&self) -> Option<Arc<dyn HealerPolicy>> {
        self.healer.read().await.as_ref().and_then(Weak::upgrade)
    }

    /// Run every hook attached to `event`, stopping at the first error.
    pub async fn run_hooks(&self, event: HookEvent, node: &Node) -> Result<()> {
        let hooks: Vec<_> = self
            .hooks
            .read()
            .await
            .iter()
            .filter(|(e, _)| *e == event)
            .map(|(_, h)| h.clone())
            .collect();
        for hook in hooks {
            hook.run_hook(event, node).await?;
        }
        Ok(())
    }

    /// Store a new node after the register hooks accept it.
    pub async fn register(&self, mut node: Node) -> Result<()> {
        if node.address.is_empty() {
            return Err(Error::Validation("Invalid address".to_string()));
        }
        node.healing = Default::default();
        self.run_hooks(HookEvent::BeforeNodeRegister, &node).await?;
        self.storage.store_node(&node).await?;
        info!(node = %node.address, "Node registered");
        Ok(())
    }

    /// Merge `node` into the stored record, under the node's lock.
    ///
    /// An absent creation status keeps the stored one. Metadata is merged
    /// key by key; an empty value removes the key.
    pub async fn update(&self, node: Node) -> Result<Node> {
        let lock = self.lock(&node.address, false).await?;
        let result = self.update_locked(&node).await;
        if let Err(e) = lock.release().await {
            warn!(node = %node.address, error = %e, "Failed to unlock node");
        }
        result
    }

    async fn update_locked(&self, node: &Node) -> Result<Node> {
        let mut stored = self.storage.retrieve_node(&node.address).await?;
        if let Some(status) = node.creation_status {
            stored.creation_status = Some(status);
        }
        for (key, value) in &node.metadata {
            if value.is_empty() {
                stored.metadata.remove(key);
            } else {
                stored.metadata.insert(key.clone(), value.clone());
            }
        }
        self.storage.update_node(&stored).await?;
        Ok(stored)
    }

    /// Delete a node after the unregister hooks accept it.
    pub async fn unregister(&self, address: &str) -> Result<()> {
        let node = self.storage.retrieve_node(address).await?;
        self.run_hooks(HookEvent::BeforeNodeUnregister, &node).await?;
        self.storage.remove_node(address).await?;
        info!(node = %address, "Node unregistered");
        Ok(())
    }

    /// One node.
    pub async fn get(&self, address: &str) -> Result<Node> {
        self.storage.retrieve_node(address).await
    }

    /// Nodes that may receive work: not disabled, not healing, not
    /// temporarily disabled.
    pub async fn list(&self) -> Result<Vec<Node>> {
        let now = Utc::now();
        Ok(self
            .storage
            .retrieve_nodes()
            .await?
            .into_iter()
            .filter(|n| n.is_enabled_at(now))
            .collect())
    }

    /// Every node.
    pub async fn unfiltered_list(&self) -> Result<Vec<Node>> {
        self.storage.retrieve_nodes().await
    }

    /// Enabled nodes whose metadata contains every pair in `selector`.
    pub async fn list_by_metadata(&self, selector: &BTreeMap<String, String>) -> Result<Vec<Node>> {
        Ok(self
            .list()
            .await?
            .into_iter()
            .filter(|n| selector.iter().all(|(k, v)| n.metadata.get(k) == Some(v)))
            .collect())
    }

    /// Take the node's healing lock, refusing with `HealerInProgress` when
    /// it is held.
    pub async fn lock(&self, address: &str, is_failure: bool) -> Result<HealingLock> {
        if !self
            .storage
            .lock_node_for_healing(address, is_failure, LOCK_TTL)
            .await?
        {
            return Err(Error::HealerInProgress(address.to_string()));
        }
        let storage = self.storage.clone();
        let addr = address.to_string();
        let keeper = tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval_at(Instant::now() + LOCK_EXTEND_INTERVAL, LOCK_EXTEND_INTERVAL);
            loop {
                ticker.tick().await;
                if let Err(e) = storage.extend_node_lock(&addr, LOCK_TTL).await {
                    warn!(node = %addr, error = %e, "Failed to extend node lock");
                }
            }
        });
        Ok(HealingLock {
            storage: self.storage.clone(),
            address: address.to_string(),
            keeper: Some(keeper),
        })
    }

    /// Record a failure on `address`.
    ///
    /// The lock is taken here, with `is_failure` set, so the node reports
    /// `healing` while the healer policy runs. The rest happens in the
    /// returned task, which holds the lock until done.
    pub async fn handle_error(
        &self,
        address: &str,
        err: &str,
        increment_failures: bool,
    ) -> Result<JoinHandle<()>> {
        let lock = self.lock(address, true).await?;
        let storage = self.storage.clone();
        let healer = self.healer().await;
        let address = address.to_string();
        let err = err.to_string();
        Ok(self.failures.spawn(async move {
            match record_error(&*storage, healer, &address, &err, increment_failures).await {
                Ok(()) => {}
                Err(e) if e.is_not_found() => {
                    debug!(node = %address, "Node gone while recording failure");
                }
                Err(e) => warn!(node = %address, error = %e, "Failed to record node failure"),
            }
            if let Err(e) = lock.release().await {
                warn!(node = %address, error = %e, "Failed to unlock node");
            }
        }))
    }

    /// Wait for every failure task started by [`handle_error`](Self::handle_error),
    /// including heals the policy runs inside them.
    pub async fn drain_failures(&self) {
        self.failures.close();
        self.failures.wait().await;
        self.failures.reopen();
    }

    /// Record a successful check on `address`.
    pub async fn handle_success(&self, address: &str) -> Result<()> {
        let lock = self.lock(address, false).await?;
        let result = async {
            let mut node = self.storage.retrieve_node(address).await?;
            node.update_success();
            self.storage.update_node(&node).await
        }
        .await;
        if let Err(e) = lock.release().await {
            warn!(node = %address, error = %e, "Failed to unlock node");
        }
        result
    }

    /// Set the creation status of `address`.
    pub async fn set_creation_status(&self, address: &str, status: CreationStatus) -> Result<Node> {
        self.update(Node::new(address).with_creation_status(status)).await
    }
}

async fn record_error(
    storage: &dyn NodeStorage,
    healer: Option<Arc<dyn HealerPolicy>>,
    address: &str,
    err: &str,
    increment_failures: bool,
) -> Result<()> {
    let mut node = storage.retrieve_node(address).await?;
    node.update_error(err, increment_failures);
    let disable_for = match healer {
        Some(healer) => healer.handle_error(&mut node).await,
        None => Duration::ZERO,
    };
    if !disable_for.is_zero() {
        node.update_disabled(Utc::now() + chrono_duration(disable_for));
    }
    storage.update_node(&node).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::{META_FAILURES, META_LAST_ERROR, NodeStatus};
    use crate::storage::memory::MemoryStorage;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn registry() -> NodeRegistry {
        NodeRegistry::new(Arc::new(MemoryStorage::new()))
    }

    struct DisableFor(Duration);

    #[async_trait]
    impl HealerPolicy for DisableFor {
        async fn handle_error(&self, _node: &mut Node) -> Duration {
            self.0
        }
    }

    struct CountingHook {
        calls: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl ClusterHook for CountingHook {
        async fn run_hook(&self, _event: HookEvent, _node: &Node) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(Error::Other("hook refused".into()));
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_register_validates_and_rejects_duplicates() {
        let registry = registry();
        assert!(matches!(
            registry.register(Node::new("")).await,
            Err(Error::Validation(_))
        ));
        registry.register(Node::new("http://a:2375")).await.unwrap();
        assert!(matches!(
            registry.register(Node::new("http://a:2375")).await,
            Err(Error::DuplicateNode(_))
        ));
    }

    #[tokio::test]
    async fn test_failing_register_hook_blocks_store() {
        let registry = registry();
        let hook = Arc::new(CountingHook {
            calls: AtomicUsize::new(0),
            fail: true,
        });
        registry.add_hook(HookEvent::BeforeNodeRegister, hook.clone()).await;
        assert!(registry.register(Node::new("http://a:2375")).await.is_err());
        assert_eq!(hook.calls.load(Ordering::SeqCst), 1);
        assert!(registry.unfiltered_list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_update_merges_metadata_and_keeps_status() {
        let registry = registry();
        registry
            .register(
                Node::new("http://a:2375")
                    .with_creation_status(CreationStatus::Pending)
                    .with_metadata("pool", "p1")
                    .with_metadata("zone", "z1"),
            )
            .await
            .unwrap();
        let updated = registry
            .update(
                Node::new("http://a:2375")
                    .with_metadata("zone", "")
                    .with_metadata("team", "t1"),
            )
            .await
            .unwrap();
        assert_eq!(updated.creation_status, Some(CreationStatus::Pending));
        assert!(!updated.metadata.contains_key("zone"));
        assert_eq!(updated.metadata["team"], "t1");
        assert_eq!(updated.metadata["pool"], "p1");

        let node = registry.get("http://a:2375").await.unwrap();
        assert!(node.healing.locked_until.is_none());
    }

    #[tokio::test]
    async fn test_lock_refuses_second_holder() {
        let registry = registry();
        registry.register(Node::new("http://a:2375")).await.unwrap();
        let lock = registry.lock("http://a:2375", true).await.unwrap();
        assert_eq!(
            registry.get("http://a:2375").await.unwrap().status(),
            NodeStatus::Healing
        );
        assert!(matches!(
            registry.lock("http://a:2375", false).await,
            Err(Error::HealerInProgress(_))
        ));
        assert!(matches!(
            registry.update(Node::new("http://a:2375")).await,
            Err(Error::HealerInProgress(_))
        ));
        lock.release().await.unwrap();
        registry.lock("http://a:2375", false).await.unwrap().release().await.unwrap();
    }

    #[tokio::test]
    async fn test_handle_error_disables_node() {
        let registry = registry();
        registry.register(Node::new("http://a:2375")).await.unwrap();
        let healer: Arc<dyn HealerPolicy> = Arc::new(DisableFor(Duration::from_secs(30)));
        registry.set_healer(&healer).await;

        registry
            .handle_error("http://a:2375", "connection refused", true)
            .await
            .unwrap()
            .await
            .unwrap();
        let node = registry.get("http://a:2375").await.unwrap();
        assert_eq!(node.metadata[META_FAILURES], "1");
        assert_eq!(node.metadata[META_LAST_ERROR], "connection refused");
        assert_eq!(node.status(), NodeStatus::DisabledTemporarily);
        assert!(registry.list().await.unwrap().is_empty());
        assert_eq!(registry.unfiltered_list().await.unwrap().len(), 1);

        registry.handle_success("http://a:2375").await.unwrap();
        let node = registry.get("http://a:2375").await.unwrap();
        assert_eq!(node.status(), NodeStatus::Ready);
        assert_eq!(registry.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_handle_error_without_healer_only_counts() {
        let registry = registry();
        registry.register(Node::new("http://a:2375")).await.unwrap();
        for _ in 0..2 {
            registry
                .handle_error("http://a:2375", "boom", true)
                .await
                .unwrap()
                .await
                .unwrap();
        }
        let node = registry.get("http://a:2375").await.unwrap();
        assert_eq!(node.failure_count(), 2);
        assert_eq!(node.status(), NodeStatus::Retry);
    }

    struct SlowHealer {
        gate: Arc<tokio::sync::Notify>,
    }

    #[async_trait]
    impl HealerPolicy for SlowHealer {
        async fn handle_error(&self, _node: &mut Node) -> Duration {
            self.gate.notified().await;
            Duration::ZERO
        }
    }

    #[tokio::test]
    async fn test_drain_failures_waits_for_running_policy() {
        let registry = Arc::new(registry());
        registry.register(Node::new("http://a:2375")).await.unwrap();
        let gate = Arc::new(tokio::sync::Notify::new());
        let healer: Arc<dyn HealerPolicy> = Arc::new(SlowHealer { gate: gate.clone() });
        registry.set_healer(&healer).await;

        registry
            .handle_error("http://a:2375", "boom", true)
            .await
            .unwrap();
        let drain = tokio::spawn({
            let registry = registry.clone();
            async move { registry.drain_failures().await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!drain.is_finished());
        assert_eq!(
            registry.get("http://a:2375").await.unwrap().status(),
            NodeStatus::Healing
        );

        gate.notify_one();
        tokio::time::timeout(Duration::from_secs(5), drain)
            .await
            .unwrap()
            .unwrap();
        let node = registry.get("http://a:2375").await.unwrap();
        assert_eq!(node.failure_count(), 1);
        assert!(node.healing.locked_until.is_none());
    }

    #[tokio::test]
    async fn test_list_by_metadata() {
        let registry = registry();
        registry
            .register(Node::new("http://a:2375").with_metadata("pool", "p1"))
            .await
            .unwrap();
        registry
            .register(Node::new("http://b:2375").with_metadata("pool", "p2"))
            .await
            .unwrap();
        let selector = BTreeMap::from([("pool".to_string(), "p2".to_string())]);
        let nodes = registry.list_by_metadata(&selector).await.unwrap();
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].address, "http://b:2375");
    }
}
