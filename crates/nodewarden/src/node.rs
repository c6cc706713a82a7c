// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Node model.
//!
//! A node is a Docker host identified by its URL. Besides user metadata
//! (`pool`, `iaas`, `iaas-id`, free-form tags) the registry keeps a few
//! reserved keys in the same map to track health:
//!
//! | Key | Content |
//! |-----|---------|
//! | `Failures` | consecutive failure count |
//! | `LastError` | message of the last failure |
//! | `LastSuccess` | RFC3339 instant of the last successful check |
//! | `DisabledUntil` | RFC3339 instant until which the node is skipped |
//!
//! The node status is never stored; it is derived from creation status,
//! the healing lock and the reserved keys.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

/// Metadata key holding the consecutive failure counter.
pub const META_FAILURES: &str = "Failures";
/// Metadata key holding the last error message.
pub const META_LAST_ERROR: &str = "LastError";
/// Metadata key holding the last success instant.
pub const META_LAST_SUCCESS: &str = "LastSuccess";
/// Metadata key holding the end of a temporary disable.
pub const META_DISABLED_UNTIL: &str = "DisabledUntil";
/// Metadata key holding the node pool.
pub const META_POOL: &str = "pool";
/// Metadata key naming the IaaS provider that created the node.
pub const META_IAAS: &str = "iaas";
/// Metadata key holding the provider machine id.
pub const META_IAAS_ID: &str = "iaas-id";

const RESERVED_KEYS: [&str; 4] = [
    META_FAILURES,
    META_LAST_ERROR,
    META_LAST_SUCCESS,
    META_DISABLED_UNTIL,
];

/// Lifecycle of a node's provisioning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CreationStatus {
    /// Machine created, Docker not yet confirmed.
    Pending,
    /// Ready for workloads.
    Created,
    /// Provisioning failed.
    Error,
    /// Administratively disabled.
    Disabled,
}

impl CreationStatus {
    /// Stable lowercase name.
    pub fn as_str(&self) -> &'static str {
        match self {
            CreationStatus::Pending => "pending",
            CreationStatus::Created => "created",
            CreationStatus::Error => "error",
            CreationStatus::Disabled => "disabled",
        }
    }
}

impl std::str::FromStr for CreationStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(CreationStatus::Pending),
            "created" => Ok(CreationStatus::Created),
            "error" => Ok(CreationStatus::Error),
            "disabled" => Ok(CreationStatus::Disabled),
            _ => Err(format!("Unknown creation status: {}", s)),
        }
    }
}

/// Healing lock state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealingData {
    /// Lock expiry; the lock is free once this is in the past.
    pub locked_until: Option<DateTime<Utc>>,
    /// Whether the lock was taken to handle a failure.
    pub is_failure: bool,
}

/// Derived node status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NodeStatus {
    /// Creation still pending.
    Pending,
    /// Creation failed.
    Error,
    /// Administratively disabled.
    Disabled,
    /// A failure-driven healing holds the lock.
    Healing,
    /// Skipped until `DisabledUntil`.
    DisabledTemporarily,
    /// Recent failures, still in rotation.
    Retry,
    /// Never reported a success.
    Waiting,
    /// Healthy.
    Ready,
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NodeStatus::Pending => "pending",
            NodeStatus::Error => "error",
            NodeStatus::Disabled => "disabled",
            NodeStatus::Healing => "healing",
            NodeStatus::DisabledTemporarily => "disabled-temporarily",
            NodeStatus::Retry => "retry",
            NodeStatus::Waiting => "waiting",
            NodeStatus::Ready => "ready",
        };
        f.write_str(s)
    }
}

/// A Docker host.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Node {
    /// Docker endpoint URL, unique key.
    pub address: String,
    /// User tags plus the reserved health keys.
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    /// Provisioning state; `None` is treated like `created`.
    #[serde(default)]
    pub creation_status: Option<CreationStatus>,
    /// Healing lock.
    #[serde(default)]
    pub healing: HealingData,
}

impl Node {
    /// Create a node with no metadata.
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            ..Default::default()
        }
    }

    /// Builder-style metadata setter.
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Builder-style creation status setter.
    pub fn with_creation_status(mut self, status: CreationStatus) -> Self {
        self.creation_status = Some(status);
        self
    }

    /// Derived status at the current instant.
    pub fn status(&self) -> NodeStatus {
        self.status_at(Utc::now())
    }

    /// Derived status at `now`.
    pub fn status_at(&self, now: DateTime<Utc>) -> NodeStatus {
        match self.creation_status {
            Some(CreationStatus::Pending) => return NodeStatus::Pending,
            Some(CreationStatus::Error) => return NodeStatus::Error,
            Some(CreationStatus::Disabled) => return NodeStatus::Disabled,
            Some(CreationStatus::Created) | None => {}
        }
        if self.is_healing_at(now) {
            return NodeStatus::Healing;
        }
        if self.disabled_until().is_some_and(|until| until > now) {
            return NodeStatus::DisabledTemporarily;
        }
        if self.failure_count() > 0 {
            return NodeStatus::Retry;
        }
        if !self.has_success() {
            return NodeStatus::Waiting;
        }
        NodeStatus::Ready
    }

    /// Whether a failure-driven healing currently holds the lock.
    pub fn is_healing_at(&self, now: DateTime<Utc>) -> bool {
        self.healing.is_failure && self.healing.locked_until.is_some_and(|until| until > now)
    }

    /// Whether the node takes part in scheduling.
    pub fn is_enabled_at(&self, now: DateTime<Utc>) -> bool {
        if self.creation_status == Some(CreationStatus::Disabled) {
            return false;
        }
        if self.is_healing_at(now) {
            return false;
        }
        !self.disabled_until().is_some_and(|until| until > now)
    }

    /// Consecutive failures recorded in metadata.
    pub fn failure_count(&self) -> u32 {
        self.metadata
            .get(META_FAILURES)
            .and_then(|v| v.parse().ok())
            .unwrap_or(0)
    }

    /// Whether a success was ever recorded.
    pub fn has_success(&self) -> bool {
        self.metadata.contains_key(META_LAST_SUCCESS)
    }

    /// Last success instant, if recorded and parseable.
    pub fn last_success(&self) -> Option<DateTime<Utc>> {
        parse_instant(self.metadata.get(META_LAST_SUCCESS)?)
    }

    /// End of the temporary disable, if any.
    pub fn disabled_until(&self) -> Option<DateTime<Utc>> {
        parse_instant(self.metadata.get(META_DISABLED_UNTIL)?)
    }

    /// Last recorded error.
    pub fn last_error(&self) -> Option<&str> {
        self.metadata.get(META_LAST_ERROR).map(String::as_str)
    }

    /// Pool tag.
    pub fn pool(&self) -> &str {
        self.metadata.get(META_POOL).map(String::as_str).unwrap_or("")
    }

    /// IaaS provider name, if the node was machine-created.
    pub fn iaas(&self) -> Option<&str> {
        self.metadata
            .get(META_IAAS)
            .map(String::as_str)
            .filter(|v| !v.is_empty())
    }

    /// Provider machine id.
    pub fn iaas_id(&self) -> &str {
        self.metadata.get(META_IAAS_ID).map(String::as_str).unwrap_or("")
    }

    /// User metadata without the reserved health keys.
    pub fn clean_metadata(&self) -> BTreeMap<String, String> {
        self.metadata
            .iter()
            .filter(|(k, _)| !RESERVED_KEYS.contains(&k.as_str()))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Host part of the address (no scheme, no port).
    pub fn host(&self) -> String {
        url_to_host(&self.address)
    }

    /// Record a failure.
    pub fn update_error(&mut self, err: &str, increment_failures: bool) {
        if increment_failures {
            let failures = self.failure_count() + 1;
            self.metadata
                .insert(META_FAILURES.to_string(), failures.to_string());
        }
        self.metadata
            .insert(META_LAST_ERROR.to_string(), err.to_string());
    }

    /// Record a success, clearing failure state.
    pub fn update_success(&mut self) {
        self.reset_failures();
        self.metadata.remove(META_LAST_ERROR);
        self.metadata.insert(
            META_LAST_SUCCESS.to_string(),
            format_instant(Utc::now()),
        );
    }

    /// Skip the node until `until`.
    pub fn update_disabled(&mut self, until: DateTime<Utc>) {
        self.metadata
            .insert(META_DISABLED_UNTIL.to_string(), format_instant(until));
    }

    /// Clear the failure counter and temporary disable.
    pub fn reset_failures(&mut self) {
        self.metadata.remove(META_FAILURES);
        self.metadata.remove(META_DISABLED_UNTIL);
    }
}

/// RFC3339 with second precision, as stored in metadata.
pub fn format_instant(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn parse_instant(v: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(v)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

/// Extract the host from a node URL. Inputs without a scheme are accepted.
pub fn url_to_host(address: &str) -> String {
    let parsed = url::Url::parse(address)
        .ok()
        .filter(|u| u.host_str().is_some())
        .or_else(|| url::Url::parse(&format!("http://{}", address)).ok());
    match parsed.as_ref().and_then(|u| u.host_str()) {
        Some(host) => host.to_string(),
        None => address.to_string(),
    }
}

/// Result of one named health check reported by a node agent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeCheckResult {
    /// Check name.
    pub name: String,
    /// Whether the check passed.
    pub successful: bool,
    /// Failure message.
    #[serde(default)]
    pub err: String,
}

/// One batch of checks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeChecks {
    /// When the batch was received.
    pub time: DateTime<Utc>,
    /// Individual results.
    pub checks: Vec<NodeCheckResult>,
}

/// Rolling health record per node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeStatusData {
    /// Node address.
    pub address: String,
    /// Last report received.
    pub last_update: DateTime<Utc>,
    /// Last report in which every check succeeded.
    pub last_success: Option<DateTime<Utc>>,
    /// Most recent check batches, oldest first.
    pub checks: Vec<NodeChecks>,
}

/// Number of check batches kept per node.
pub const MAX_NODE_CHECKS: usize = 10;

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_status_derivation() {
        let now = Utc::now();
        let node = Node::new("http://a:2375");
        assert_eq!(node.status_at(now), NodeStatus::Waiting);

        let node = Node::new("x").with_creation_status(CreationStatus::Error);
        assert_eq!(node.status_at(now), NodeStatus::Error);

        let node = Node::new("x").with_creation_status(CreationStatus::Pending);
        assert_eq!(node.status_at(now), NodeStatus::Pending);

        let node = Node::new("x").with_metadata(META_FAILURES, "1");
        assert_eq!(node.status_at(now), NodeStatus::Retry);

        let node = Node::new("x").with_metadata(META_LAST_SUCCESS, "xxx");
        assert_eq!(node.status_at(now), NodeStatus::Ready);

        let node = Node::new("x")
            .with_metadata(META_DISABLED_UNTIL, format_instant(now + Duration::minutes(1)))
            .with_metadata(META_FAILURES, "1");
        assert_eq!(node.status_at(now), NodeStatus::DisabledTemporarily);
    }

    #[test]
    fn test_healing_status_requires_failure_lock() {
        let now = Utc::now();
        let mut node = Node::new("x").with_metadata(META_LAST_SUCCESS, "date");
        node.healing.locked_until = Some(now + Duration::minutes(1));
        assert_eq!(node.status_at(now), NodeStatus::Ready);

        node.healing.is_failure = true;
        assert_eq!(node.status_at(now), NodeStatus::Healing);

        node.creation_status = Some(CreationStatus::Disabled);
        assert_eq!(node.status_at(now), NodeStatus::Disabled);
    }

    #[test]
    fn test_update_error_and_success() {
        let mut node = Node::new("x");
        node.update_error("first", true);
        assert_eq!(node.failure_count(), 1);
        assert_eq!(node.last_error(), Some("first"));
        node.update_error("second", true);
        assert_eq!(node.failure_count(), 2);
        node.update_error("not counted", false);
        assert_eq!(node.failure_count(), 2);
        assert_eq!(node.last_error(), Some("not counted"));

        node.update_disabled(Utc::now() + Duration::seconds(30));
        node.update_success();
        assert_eq!(node.failure_count(), 0);
        assert!(node.last_error().is_none());
        assert!(node.disabled_until().is_none());
        assert!(node.last_success().is_some());
    }

    #[test]
    fn test_clean_metadata_drops_reserved_keys() {
        let node = Node::new("x")
            .with_metadata(META_FAILURES, "9")
            .with_metadata(META_DISABLED_UNTIL, "something")
            .with_metadata(META_LAST_ERROR, "some error")
            .with_metadata(META_POOL, "p1")
            .with_metadata("iaas", "ec2");
        let clean = node.clean_metadata();
        assert_eq!(clean.len(), 2);
        assert_eq!(clean.get("pool").map(String::as_str), Some("p1"));
    }

    #[test]
    fn test_url_to_host() {
        assert_eq!(url_to_host("http://a.b.c:4243"), "a.b.c");
        assert_eq!(url_to_host("https://10.0.0.1:2376/"), "10.0.0.1");
        assert_eq!(url_to_host("10.0.0.2:2375"), "10.0.0.2");
    }
}
