// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Healers.
//!
//! - [`ContainerHealer`] moves application containers that stopped
//!   reporting to other nodes.
//! - [`NodeHealer`] replaces failing nodes with fresh IaaS machines.
//!
//! Both record each attempt in the event journal under the `healer` kind,
//! which keeps a single healing per target and throttles repeated ones.

pub mod container;
pub mod node;

pub use container::{ContainerHealer, ContainerHealerConfig};
pub use node::{NodeHealer, NodeHealerConfig, NodeHealerSettings, NodeStatusReport};

use crate::error::Error;
use crate::events::EventError;

fn is_event_locked(err: &Error) -> bool {
    matches!(err, Error::Event(EventError::Locked { .. }))
}

fn is_event_throttled(err: &Error) -> bool {
    matches!(err, Error::Event(EventError::Throttled { .. }))
}
