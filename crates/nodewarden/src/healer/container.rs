// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Background worker moving unresponsive containers.
//!
//! Every pass lists application containers whose last successful status
//! report is older than `max_unresponsive`, checks each against Docker,
//! and recreates the ones that are really gone on another node.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use super::{is_event_locked, is_event_throttled};
use crate::container::{Container, ContainerStateChange, ContainerStatus};
use crate::error::{Error, Result};
use crate::events::{EventJournal, HEALER_KIND, NewEventOptions, Target};
use crate::provisioner::{AppLocker, Destination, LogBuffer, Provisioner};
use crate::storage::chrono_duration;

/// Configuration for the container healer.
#[derive(Debug, Clone)]
pub struct ContainerHealerConfig {
    /// How often to run a pass.
    pub poll_interval: Duration,
    /// Silence after which a container is considered unresponsive.
    pub max_unresponsive: Duration,
}

impl Default for ContainerHealerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(30),
            max_unresponsive: Duration::from_secs(5 * 60),
        }
    }
}

/// Moves containers that stopped reporting.
pub struct ContainerHealer {
    provisioner: Arc<Provisioner>,
    journal: EventJournal,
    config: ContainerHealerConfig,
    shutdown: Arc<Notify>,
}

impl ContainerHealer {
    /// Create a healer.
    pub fn new(provisioner: Arc<Provisioner>, journal: EventJournal, config: ContainerHealerConfig) -> Self {
        Self {
            provisioner,
            journal,
            config,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Handle used to stop [`run`](Self::run).
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Run passes until shutdown, the first one right away. A pass in
    /// progress finishes first.
    pub async fn run(&self) {
        info!(
            poll_interval_secs = self.config.poll_interval.as_secs(),
            max_unresponsive_secs = self.config.max_unresponsive.as_secs(),
            "Container healer started"
        );

        loop {
            if let Err(e) = self.run_once().await {
                error!(error = %e, "Container healing pass failed");
            }

            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("Container healer received shutdown signal");
                    break;
                }

                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }
        }

        info!("Container healer stopped");
    }

    /// One pass over the unresponsive containers.
    pub async fn run_once(&self) -> Result<()> {
        let containers = self
            .provisioner
            .list_unresponsive_containers(self.config.max_unresponsive)
            .await?;
        if containers.is_empty() {
            debug!("No unresponsive containers");
            return Ok(());
        }
        let locker = self.provisioner.app_locks().locker();
        for container in &containers {
            if let Err(e) = self.heal_if_needed(container, &locker).await {
                error!(container = %container.short_id(), error = %e, "Container healing failed");
            }
        }
        Ok(())
    }

    /// Whether the container is in the state its record expects. The record
    /// is refreshed when it is.
    async fn is_as_expected(&self, container: &Container) -> Result<bool> {
        let inspect = self.provisioner.cluster().inspect_container(container).await?;
        if inspect.dead || inspect.removal_in_progress {
            return Ok(false);
        }
        let expected = container.expected_status();
        let running = inspect.running || inspect.restarting;
        let matches = match expected {
            ContainerStatus::Stopped => !running,
            _ => running,
        };
        if !matches {
            return Ok(false);
        }
        self.provisioner
            .cluster()
            .set_container_state(container, ContainerStateChange::NewStatus(expected))
            .await?;
        Ok(true)
    }

    async fn heal_if_needed(&self, container: &Container, locker: &AppLocker) -> Result<()> {
        let grace_start = Utc::now() - chrono_duration(self.config.max_unresponsive);
        if container.last_success_status_update.is_none() && container.created_at > grace_start {
            return Ok(());
        }

        match self.is_as_expected(container).await {
            Ok(true) => {
                debug!(container = %container.short_id(), "Container running as expected");
                return Ok(());
            }
            Ok(false) => {}
            Err(e) => {
                warn!(container = %container.short_id(), error = %e, "Container state unknown, healing anyway");
            }
        }

        if !locker.lock(&container.app_name) {
            return Err(Error::Other(format!(
                "Error trying to heal containers {}: couldn't lock app {}",
                container.id, container.app_name
            )));
        }
        let result = self.heal_locked(container, locker).await;
        locker.unlock(&container.app_name);
        result
    }

    async fn heal_locked(&self, container: &Container, locker: &AppLocker) -> Result<()> {
        match self.provisioner.containers().get_container(&container.id).await {
            Ok(_) => {}
            Err(Error::UnitNotFound(_)) => return Ok(()),
            Err(e) => {
                return Err(Error::Other(format!(
                    "Error trying to heal containers {}: couldn't verify it still exists: {}",
                    container.id, e
                )));
            }
        }

        let handle = match self
            .journal
            .new_internal(NewEventOptions {
                target: Target::container(&container.id),
                kind: HEALER_KIND.to_string(),
                custom_data: serde_json::to_value(container)?,
            })
            .await
        {
            Ok(handle) => handle,
            Err(e) if is_event_locked(&e) => {
                debug!(container = %container.short_id(), "Container already being healed");
                return Ok(());
            }
            Err(e) if is_event_throttled(&e) => {
                warn!(container = %container.short_id(), error = %e, "Container healing throttled");
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        info!(container = %container.short_id(), app = %container.app_name, host = %container.host_addr, "Healing unresponsive container");
        let log = LogBuffer::new();
        let (err, created) = match self
            .provisioner
            .move_one_container(container, Destination::Anywhere, &log, locker)
            .await
        {
            Ok(created) => (None, serde_json::to_value(&created)?),
            Err(e) => (
                Some(Error::Other(format!(
                    "Error trying to heal containers {}: couldn't move container: {} - log: {}",
                    container.id,
                    e,
                    log.contents()
                ))),
                Value::Null,
            ),
        };
        if let Err(e) = handle.done_custom_data(err.as_ref(), created).await {
            warn!(container = %container.short_id(), error = %e, "Failed to finish healing event");
        }
        match err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
