// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Event journal.
//!
//! Every healing attempt is recorded as an event against a target (a node
//! address or a container id). The journal doubles as a distributed lock:
//! at most one running event exists per target, and a throttling table caps
//! how many events of a kind may start against a target within a window.
//!
//! ```text
//! new_internal ──► throttle check ──► insert (unique running per target)
//!                      │                    │
//!                 Throttled             Locked
//!
//! EventHandle::done / done_custom_data ──► end_time, error, successful
//! EventHandle::abort                   ──► record removed
//! ```

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::container::Container;
use crate::error::{Error, Result};
use crate::node::{Node, NodeChecks};
use crate::storage::{EventStorage, chrono_duration};

/// Event kind used by both healers.
pub const HEALER_KIND: &str = "healer";

/// Maximum number of entries returned by the healing history.
pub const HEALING_HISTORY_LIMIT: usize = 200;

/// What an event is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetKind {
    /// A node, identified by address.
    Node,
    /// An application container, identified by id.
    Container,
}

impl TargetKind {
    /// Stable lowercase name.
    pub fn as_str(&self) -> &'static str {
        match self {
            TargetKind::Node => "node",
            TargetKind::Container => "container",
        }
    }
}

impl fmt::Display for TargetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TargetKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "node" => Ok(TargetKind::Node),
            "container" => Ok(TargetKind::Container),
            _ => Err(format!("Unknown event target: {}", s)),
        }
    }
}

/// Event target.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Target {
    /// Target kind.
    #[serde(rename = "type")]
    pub kind: TargetKind,
    /// Target identifier.
    pub value: String,
}

impl Target {
    /// Node target.
    pub fn node(address: impl Into<String>) -> Self {
        Self {
            kind: TargetKind::Node,
            value: address.into(),
        }
    }

    /// Container target.
    pub fn container(id: impl Into<String>) -> Self {
        Self {
            kind: TargetKind::Container,
            value: id.into(),
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.kind, self.value)
    }
}

/// One journal entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    /// Unique id.
    pub id: String,
    /// What the event is about.
    pub target: Target,
    /// Event kind.
    pub kind: String,
    /// Allocation instant.
    pub start_time: DateTime<Utc>,
    /// Completion instant; `None` while running.
    pub end_time: Option<DateTime<Utc>>,
    /// Data attached at allocation.
    pub custom_data: Value,
    /// Data attached at completion.
    pub end_custom_data: Value,
    /// Failure message, empty on success.
    pub error: String,
    /// Whether the event finished without error.
    pub successful: bool,
}

impl Event {
    /// Whether the event has not finished yet.
    pub fn is_running(&self) -> bool {
        self.end_time.is_none()
    }
}

/// Event query.
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    /// Exact target.
    pub target: Option<Target>,
    /// Any target of this kind.
    pub target_kind: Option<TargetKind>,
    /// Event kind.
    pub kind: Option<String>,
    /// Running state.
    pub running: Option<bool>,
    /// Maximum results, 0 for no limit.
    pub limit: usize,
}

impl EventFilter {
    /// Evaluate the filter against one event (limit excluded).
    pub fn matches(&self, event: &Event) -> bool {
        self.target.as_ref().is_none_or(|t| &event.target == t)
            && self.target_kind.is_none_or(|k| event.target.kind == k)
            && self.kind.as_ref().is_none_or(|k| &event.kind == k)
            && self.running.is_none_or(|r| event.is_running() == r)
    }
}

/// Throttling rule: at most `max` events of `kind_name` against targets of
/// `target_kind` within `window`, counted per target value unless
/// `all_targets` is set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThrottlingSpec {
    /// Target kind the rule applies to.
    pub target_kind: TargetKind,
    /// Event kind the rule applies to.
    pub kind_name: String,
    /// Events allowed per window.
    pub max: usize,
    /// Sliding window.
    pub window: Duration,
    /// Count across every target of the kind.
    pub all_targets: bool,
}

/// Rules installed by default: three healings per target every five
/// minutes, for nodes and containers.
pub fn default_throttling() -> Vec<ThrottlingSpec> {
    [TargetKind::Container, TargetKind::Node]
        .into_iter()
        .map(|target_kind| ThrottlingSpec {
            target_kind,
            kind_name: HEALER_KIND.to_string(),
            max: 3,
            window: Duration::from_secs(5 * 60),
            all_targets: false,
        })
        .collect()
}

/// Journal refusals.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum EventError {
    /// Another event is running for the same target.
    #[error("event locked: {target} running {running_kind:?}")]
    Locked {
        /// Contended target.
        target: Target,
        /// Kind of the running event.
        running_kind: String,
    },

    /// The throttling cap for the target was reached.
    #[error("event throttled, limit for {kind} on the same {target_kind} is {max} every {window:?}")]
    Throttled {
        /// Target kind of the rule.
        target_kind: TargetKind,
        /// Event kind of the rule.
        kind: String,
        /// Cap.
        max: usize,
        /// Window.
        window: Duration,
    },
}

/// Parameters for [`EventJournal::new_internal`].
#[derive(Debug, Clone)]
pub struct NewEventOptions {
    /// Event target.
    pub target: Target,
    /// Event kind.
    pub kind: String,
    /// Data attached at allocation.
    pub custom_data: Value,
}

/// Journal front-end.
#[derive(Clone)]
pub struct EventJournal {
    storage: Arc<dyn EventStorage>,
    throttling: Arc<Vec<ThrottlingSpec>>,
}

impl EventJournal {
    /// Journal with the default throttling table.
    pub fn new(storage: Arc<dyn EventStorage>) -> Self {
        Self::with_throttling(storage, default_throttling())
    }

    /// Journal with an explicit throttling table.
    pub fn with_throttling(storage: Arc<dyn EventStorage>, throttling: Vec<ThrottlingSpec>) -> Self {
        Self {
            storage,
            throttling: Arc::new(throttling),
        }
    }

    /// Allocate a running event.
    ///
    /// Fails with [`EventError::Throttled`] when a throttling rule is at its
    /// cap and with [`EventError::Locked`] when another event is running for
    /// the same target.
    pub async fn new_internal(&self, opts: NewEventOptions) -> Result<EventHandle> {
        let now = Utc::now();
        for rule in self
            .throttling
            .iter()
            .filter(|s| s.target_kind == opts.target.kind && s.kind_name == opts.kind)
        {
            let value = (!rule.all_targets).then_some(opts.target.value.as_str());
            let count = self
                .storage
                .count_events_since(
                    rule.target_kind,
                    value,
                    &rule.kind_name,
                    now - chrono_duration(rule.window),
                )
                .await?;
            if count >= rule.max as u64 {
                debug!(target = %opts.target, kind = %opts.kind, count, "Event throttled");
                return Err(EventError::Throttled {
                    target_kind: rule.target_kind,
                    kind: rule.kind_name.clone(),
                    max: rule.max,
                    window: rule.window,
                }
                .into());
            }
        }

        let event = Event {
            id: uuid::Uuid::new_v4().to_string(),
            target: opts.target,
            kind: opts.kind,
            start_time: now,
            end_time: None,
            custom_data: opts.custom_data,
            end_custom_data: Value::Null,
            error: String::new(),
            successful: false,
        };
        if !self.storage.insert_event(&event).await? {
            let running_kind = self
                .storage
                .running_event(&event.target)
                .await?
                .map(|e| e.kind)
                .unwrap_or_default();
            return Err(EventError::Locked {
                target: event.target,
                running_kind,
            }
            .into());
        }
        Ok(EventHandle {
            storage: self.storage.clone(),
            event,
        })
    }

    /// Events matching `filter`, newest first.
    pub async fn list(&self, filter: &EventFilter) -> Result<Vec<Event>> {
        self.storage.list_events(filter).await
    }

    /// Healer events as healing records, newest first.
    pub async fn list_healing_history(
        &self,
        filter: Option<TargetKind>,
    ) -> Result<Vec<HealingEvent>> {
        let events = self
            .list(&EventFilter {
                target_kind: filter,
                kind: Some(HEALER_KIND.to_string()),
                limit: HEALING_HISTORY_LIMIT,
                ..Default::default()
            })
            .await?;
        Ok(events.iter().map(HealingEvent::from_event).collect())
    }
}

/// A running event owned by the caller that allocated it.
pub struct EventHandle {
    storage: Arc<dyn EventStorage>,
    event: Event,
}

impl EventHandle {
    /// The event as allocated.
    pub fn event(&self) -> &Event {
        &self.event
    }

    /// Event id.
    pub fn id(&self) -> &str {
        &self.event.id
    }

    /// Finish the event.
    pub async fn done(self, err: Option<&Error>) -> Result<()> {
        self.done_custom_data(err, Value::Null).await
    }

    /// Finish the event, attaching completion data.
    pub async fn done_custom_data(mut self, err: Option<&Error>, data: Value) -> Result<()> {
        self.event.end_time = Some(Utc::now());
        self.event.error = err.map(ToString::to_string).unwrap_or_default();
        self.event.successful = err.is_none();
        self.event.end_custom_data = data;
        self.storage.finish_event(&self.event).await
    }

    /// Drop the event without recording an outcome.
    pub async fn abort(self) -> Result<()> {
        if let Err(e) = self.storage.remove_event(&self.event.id).await {
            warn!(event = %self.event.id, error = %e, "Failed to abort event");
            return Err(e);
        }
        Ok(())
    }
}

/// Data attached to node healing events.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeHealingData {
    /// The failing node as seen when healing started.
    pub node: Node,
    /// Why the node is being healed.
    pub reason: String,
    /// Latest status report, for scan-triggered healings.
    #[serde(default)]
    pub last_check: Option<NodeChecks>,
}

/// Healing kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HealingAction {
    /// A node was replaced.
    NodeHealing,
    /// A container was moved.
    ContainerHealing,
}

/// One healing attempt, as reported by the history API.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealingEvent {
    /// Event id.
    pub id: String,
    /// Start.
    pub start_time: DateTime<Utc>,
    /// End, absent while running.
    pub end_time: Option<DateTime<Utc>>,
    /// Healing kind.
    pub action: HealingAction,
    /// Why healing started.
    pub reason: String,
    /// Extra context (the last node check, for node healings).
    pub extra: Value,
    /// Node being replaced.
    pub failing_node: Option<Node>,
    /// Replacement node.
    pub created_node: Option<Node>,
    /// Container being moved.
    pub failing_container: Option<Container>,
    /// Container created by the move.
    pub created_container: Option<Container>,
    /// Failure message.
    pub error: String,
    /// Whether healing succeeded.
    pub successful: bool,
}

impl HealingEvent {
    /// Convert a healer journal event.
    pub fn from_event(event: &Event) -> Self {
        let mut healing = HealingEvent {
            id: event.id.clone(),
            start_time: event.start_time,
            end_time: event.end_time,
            action: HealingAction::NodeHealing,
            reason: String::new(),
            extra: Value::Null,
            failing_node: None,
            created_node: None,
            failing_container: None,
            created_container: None,
            error: event.error.clone(),
            successful: event.successful,
        };
        match event.target.kind {
            TargetKind::Node => {
                if let Ok(data) = serde_json::from_value::<NodeHealingData>(event.custom_data.clone())
                {
                    healing.reason = data.reason;
                    healing.extra = serde_json::to_value(&data.last_check).unwrap_or(Value::Null);
                    healing.failing_node = Some(data.node);
                }
                healing.created_node = serde_json::from_value(event.end_custom_data.clone()).ok();
            }
            TargetKind::Container => {
                healing.action = HealingAction::ContainerHealing;
                healing.failing_container =
                    serde_json::from_value(event.custom_data.clone()).ok();
                healing.created_container =
                    serde_json::from_value(event.end_custom_data.clone()).ok();
            }
        }
        healing
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::MemoryStorage;
    use serde_json::json;

    fn journal() -> EventJournal {
        EventJournal::new(Arc::new(MemoryStorage::new()))
    }

    fn healer_event(target: Target) -> NewEventOptions {
        NewEventOptions {
            target,
            kind: HEALER_KIND.to_string(),
            custom_data: Value::Null,
        }
    }

    #[tokio::test]
    async fn test_running_event_locks_target() {
        let journal = journal();
        let first = journal
            .new_internal(healer_event(Target::node("http://a:2375")))
            .await
            .unwrap();
        let err = journal
            .new_internal(healer_event(Target::node("http://a:2375")))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, Error::Event(EventError::Locked { .. })));

        // Another target is independent.
        journal
            .new_internal(healer_event(Target::node("http://b:2375")))
            .await
            .unwrap();

        first.done(None).await.unwrap();
        journal
            .new_internal(healer_event(Target::node("http://a:2375")))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_throttling_per_target() {
        let journal = journal();
        for _ in 0..3 {
            let evt = journal
                .new_internal(healer_event(Target::container("c1")))
                .await
                .unwrap();
            evt.done(None).await.unwrap();
        }
        let err = journal
            .new_internal(healer_event(Target::container("c1")))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, Error::Event(EventError::Throttled { max: 3, .. })));
        assert!(err.to_string().contains("event throttled"));

        journal
            .new_internal(healer_event(Target::container("c2")))
            .await
            .unwrap();

        // Other kinds are not throttled.
        for _ in 0..4 {
            let evt = journal
                .new_internal(NewEventOptions {
                    target: Target::container("c1"),
                    kind: "restart".into(),
                    custom_data: Value::Null,
                })
                .await
                .unwrap();
            evt.done(None).await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_abort_removes_event() {
        let journal = journal();
        let evt = journal
            .new_internal(healer_event(Target::node("n1")))
            .await
            .unwrap();
        evt.abort().await.unwrap();
        assert!(journal.list(&EventFilter::default()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_healing_history_conversion() {
        let journal = journal();
        let data = NodeHealingData {
            node: Node::new("http://a:2375"),
            reason: "2 consecutive failures".into(),
            last_check: None,
        };
        let evt = journal
            .new_internal(NewEventOptions {
                target: Target::node("http://a:2375"),
                kind: HEALER_KIND.into(),
                custom_data: serde_json::to_value(&data).unwrap(),
            })
            .await
            .unwrap();
        evt.done_custom_data(None, serde_json::to_value(Node::new("http://b:2375")).unwrap())
            .await
            .unwrap();

        let container = Container {
            id: "c1".into(),
            ..Default::default()
        };
        let evt = journal
            .new_internal(NewEventOptions {
                target: Target::container("c1"),
                kind: HEALER_KIND.into(),
                custom_data: serde_json::to_value(&container).unwrap(),
            })
            .await
            .unwrap();
        let err = Error::Other("boom".into());
        evt.done_custom_data(Some(&err), json!(null)).await.unwrap();

        let all = journal.list_healing_history(None).await.unwrap();
        assert_eq!(all.len(), 2);

        let nodes = journal
            .list_healing_history(Some(TargetKind::Node))
            .await
            .unwrap();
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].action, HealingAction::NodeHealing);
        assert_eq!(nodes[0].reason, "2 consecutive failures");
        assert!(nodes[0].successful);
        assert_eq!(
            nodes[0].created_node.as_ref().map(|n| n.address.as_str()),
            Some("http://b:2375")
        );

        let containers = journal
            .list_healing_history(Some(TargetKind::Container))
            .await
            .unwrap();
        assert_eq!(containers[0].action, HealingAction::ContainerHealing);
        assert_eq!(containers[0].error, "boom");
        assert!(!containers[0].successful);
        assert!(containers[0].created_container.is_none());
    }
}
