// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Per-node Docker Engine access.
//!
//! Components never talk to bollard directly; they obtain a
//! [`DockerClient`] for a node address from a [`DockerConnector`]. The
//! production connector is [`EngineConnector`]; tests use [`MockDocker`].

pub mod engine;
pub mod mock;
mod traits;

pub use engine::{EngineClient, EngineConnector};
pub use mock::MockDocker;
pub use traits::*;
