// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-process task queue.
//!
//! Tasks are registered by name and run on the tokio runtime. Callers that
//! need the outcome use [`TaskQueue::enqueue_wait`], which gives up after a
//! deadline while the task itself keeps running.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::error::Result;

/// Errors raised by the queue itself.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum QueueError {
    /// No task registered under the name.
    #[error("task not found: {0}")]
    TaskNotFound(String),

    /// The task did not finish in time.
    #[error("timeout waiting for task {name} after {timeout:?}")]
    Timeout {
        /// Task name.
        name: String,
        /// Deadline.
        timeout: Duration,
    },

    /// The task panicked or was cancelled.
    #[error("task {name} aborted: {message}")]
    Aborted {
        /// Task name.
        name: String,
        /// Join error.
        message: String,
    },
}

/// A named unit of background work.
#[async_trait]
pub trait Task: Send + Sync {
    /// Registration name.
    fn name(&self) -> &str;

    /// Run with JSON parameters.
    async fn run(&self, params: Value) -> Result<()>;
}

/// Registry of tasks.
#[derive(Default)]
pub struct TaskQueue {
    tasks: RwLock<HashMap<String, Arc<dyn Task>>>,
}

impl TaskQueue {
    /// Empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a task under its name, replacing any previous one.
    pub async fn register(&self, task: Arc<dyn Task>) {
        let name = task.name().to_string();
        self.tasks.write().await.insert(name, task);
    }

    async fn task(&self, name: &str) -> Result<Arc<dyn Task>> {
        Ok(self
            .tasks
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| QueueError::TaskNotFound(name.to_string()))?)
    }

    /// Run a task in the background without waiting.
    pub async fn enqueue(&self, name: &str, params: Value) -> Result<()> {
        let task = self.task(name).await?;
        let name = name.to_string();
        tokio::spawn(async move {
            if let Err(e) = task.run(params).await {
                warn!(task = %name, error = %e, "Task failed");
            }
        });
        Ok(())
    }

    /// Run a task and wait up to `timeout` for its result.
    pub async fn enqueue_wait(&self, name: &str, params: Value, timeout: Duration) -> Result<()> {
        let task = self.task(name).await?;
        debug!(task = %name, "Task enqueued");
        let handle = tokio::spawn(async move { task.run(params).await });
        match tokio::time::timeout(timeout, handle).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => Err(QueueError::Aborted {
                name: name.to_string(),
                message: e.to_string(),
            }
            .into()),
            Err(_) => Err(QueueError::Timeout {
                name: name.to_string(),
                timeout,
            }
            .into()),
        }
    }
}
