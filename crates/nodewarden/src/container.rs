// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Application container model and status state machine.
//!
//! ```text
//!   created ──► building ──► starting ──► started ◄──► stopped
//!                                            │            │
//!                                            └──► error ◄─┘
//!                                                   │
//!                                                   ▼
//!                                                 asleep
//! ```
//!
//! `building` is a write barrier: status updates pushed from outside are
//! ignored while a build is in progress.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Container status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerStatus {
    /// Record exists, nothing started.
    #[default]
    Created,
    /// Image build in progress.
    Building,
    /// Start requested.
    Starting,
    /// Running.
    Started,
    /// Stopped on purpose.
    Stopped,
    /// Failed.
    Error,
    /// Scaled to zero, waiting for traffic.
    Asleep,
}

impl ContainerStatus {
    /// Stable lowercase name.
    pub fn as_str(&self) -> &'static str {
        match self {
            ContainerStatus::Created => "created",
            ContainerStatus::Building => "building",
            ContainerStatus::Starting => "starting",
            ContainerStatus::Started => "started",
            ContainerStatus::Stopped => "stopped",
            ContainerStatus::Error => "error",
            ContainerStatus::Asleep => "asleep",
        }
    }

    /// Statuses that prove the container is reachable.
    pub fn is_success(&self) -> bool {
        matches!(
            self,
            ContainerStatus::Started | ContainerStatus::Starting | ContainerStatus::Stopped
        )
    }
}

impl fmt::Display for ContainerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ContainerStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created" => Ok(ContainerStatus::Created),
            "building" => Ok(ContainerStatus::Building),
            "starting" => Ok(ContainerStatus::Starting),
            "started" => Ok(ContainerStatus::Started),
            "stopped" => Ok(ContainerStatus::Stopped),
            "error" => Ok(ContainerStatus::Error),
            "asleep" => Ok(ContainerStatus::Asleep),
            _ => Err(format!("Unknown container status: {}", s)),
        }
    }
}

/// One application container instance.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Container {
    /// Docker container id.
    pub id: String,
    /// Docker container name.
    pub name: String,
    /// Owning application.
    pub app_name: String,
    /// Process (from the app's Procfile) this unit runs.
    #[serde(default)]
    pub process_name: String,
    /// Host (no scheme, no port) of the node running the container.
    pub host_addr: String,
    /// Current status.
    pub status: ContainerStatus,
    /// Status preceding the most recent error.
    #[serde(default)]
    pub status_before_error: Option<ContainerStatus>,
    /// When the status last changed.
    pub last_status_update: Option<DateTime<Utc>>,
    /// When a success status was last recorded.
    pub last_success_status_update: Option<DateTime<Utc>>,
    /// When the record was first stored.
    pub created_at: DateTime<Utc>,
    /// Published host port.
    #[serde(default)]
    pub host_port: String,
    /// Port exposed inside the container.
    #[serde(default)]
    pub exposed_port: String,
    /// Image the container runs.
    #[serde(default)]
    pub image: String,
    /// Image being built, if any.
    #[serde(default)]
    pub building_image: String,
    /// User the process runs as.
    #[serde(default)]
    pub user: String,
    /// App version deployed in the container.
    #[serde(default)]
    pub version: String,
    /// Platform type.
    #[serde(default, rename = "type")]
    pub kind: String,
    /// SSH private key for the unit.
    #[serde(default)]
    pub private_key: String,
}

impl Container {
    /// Status the container is supposed to be in, ignoring a transient error.
    pub fn expected_status(&self) -> ContainerStatus {
        self.status_before_error.unwrap_or(self.status)
    }

    /// Apply a new status, maintaining the bookkeeping timestamps.
    pub fn set_status(&mut self, status: ContainerStatus, now: DateTime<Utc>) {
        self.status = status;
        self.last_status_update = Some(now);
        if status != ContainerStatus::Error {
            self.status_before_error = Some(status);
        }
        if status.is_success() {
            self.last_success_status_update = Some(now);
        }
    }

    /// Short id for log lines.
    pub fn short_id(&self) -> &str {
        let end = self.id.len().min(12);
        &self.id[..end]
    }
}

/// State change pushed into the container store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerStateChange {
    /// Status update; refused while the container is building.
    NewStatus(ContainerStatus),
    /// Record deletion.
    Removed,
}
