// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for nodewarden.

use std::fmt;

use thiserror::Error;

/// Nodewarden errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Configuration loading failed.
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// Database operation failed.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Database migration failed.
    #[error("Migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Docker engine call failed.
    #[error(transparent)]
    Docker(#[from] crate::docker::DockerError),

    /// Event journal refused or failed an operation.
    #[error(transparent)]
    Event(#[from] crate::events::EventError),

    /// Infrastructure provider failed.
    #[error(transparent)]
    Iaas(#[from] crate::iaas::IaasError),

    /// Task queue failed.
    #[error(transparent)]
    Queue(#[from] crate::queue::QueueError),

    /// Node is not registered.
    #[error("No such node in storage: {0}")]
    NodeNotFound(String),

    /// Node address is already registered.
    #[error("Duplicate node: {0}")]
    DuplicateNode(String),

    /// Another healer holds the node lock.
    #[error("Healer already running for node {0}")]
    HealerInProgress(String),

    /// Container (unit) is not known.
    #[error("unit not found: {0}")]
    UnitNotFound(String),

    /// No digest or image record exists.
    #[error("No such image in storage: {0}")]
    ImageNotFound(String),

    /// Node container definition does not exist.
    #[error("node container not found")]
    NodeContainerNotFound,

    /// Input rejected before touching storage.
    #[error("{0}")]
    Validation(String),

    /// Several independent operations failed.
    #[error(transparent)]
    Multi(#[from] MultiError),

    /// Other error.
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Whether the error means the target was absent.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Error::NodeNotFound(_)
                | Error::UnitNotFound(_)
                | Error::ImageNotFound(_)
                | Error::NodeContainerNotFound
        ) || matches!(self, Error::Docker(e) if e.is_not_found())
    }
}

/// Result type using nodewarden Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Aggregate of independent failures, reported together at the end of a
/// fan-out so one dead node does not hide the state of its peers.
#[derive(Debug, Default)]
pub struct MultiError {
    errors: Vec<Error>,
}

impl MultiError {
    /// Create an empty aggregate.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an error.
    pub fn add(&mut self, err: Error) {
        match err {
            Error::Multi(inner) => self.errors.extend(inner.errors),
            other => self.errors.push(other),
        }
    }

    /// Number of collected errors.
    pub fn len(&self) -> usize {
        self.errors.len()
    }

    /// True if nothing was collected.
    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    /// Collected errors in insertion order.
    pub fn errors(&self) -> &[Error] {
        &self.errors
    }

    /// `Ok(())` when empty, the single error when there is one,
    /// the aggregate otherwise.
    pub fn into_result(mut self) -> Result<()> {
        match self.errors.len() {
            0 => Ok(()),
            1 => Err(self.errors.remove(0)),
            _ => Err(Error::Multi(self)),
        }
    }
}

impl fmt::Display for MultiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.errors.len() {
            0 => write!(f, "no errors"),
            1 => write!(f, "{}", self.errors[0]),
            n => {
                write!(f, "multiple errors reported ({}):", n)?;
                for (i, e) in self.errors.iter().enumerate() {
                    write!(f, "\nerror #{}: {}", i, e)?;
                }
                Ok(())
            }
        }
    }
}

impl std::error::Error for MultiError {}

impl FromIterator<Error> for MultiError {
    fn from_iter<I: IntoIterator<Item = Error>>(iter: I) -> Self {
        let mut multi = MultiError::new();
        for e in iter {
            multi.add(e);
        }
        multi
    }
}
