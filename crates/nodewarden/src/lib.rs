// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! nodewarden - Docker Fleet Healing
//!
//! This crate keeps a fleet of Docker nodes healthy. It replaces failing
//! nodes with fresh IaaS machines, moves application containers that stopped
//! reporting, and keeps the per-node infrastructure containers ("node
//! containers") running everywhere.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │               Node agents (big-sibling) and operators                    │
//! └─────────────────────────────────────────────────────────────────────────┘
//!                                    │ HTTP
//!                                    ▼
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        nodewarden (This Crate)                           │
//! │  ┌─────────────┐  ┌─────────────┐  ┌─────────────┐  ┌─────────────┐     │
//! │  │    Node     │  │  Container  │  │    Node     │  │   Event     │     │
//! │  │   Healer    │  │   Healer    │  │ Containers  │  │  Journal    │     │
//! │  └─────────────┘  └─────────────┘  └─────────────┘  └─────────────┘     │
//! │  ┌───────────────────────────────┐  ┌───────────────────────────────┐   │
//! │  │  Cluster (registry + Docker)  │  │  Scoped config (pool layers)  │   │
//! │  └───────────────────────────────┘  └───────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//!           │                                        │
//!           ▼                                        ▼
//! ┌───────────────────────────┐        ┌───────────────────────────────────┐
//! │  Docker Engine per node   │        │              SQLite               │
//! │  (bollard)                │        │  (nodes, events, config, status)  │
//! └───────────────────────────┘        └───────────────────────────────────┘
//! ```
//!
//! # Node Healing
//!
//! A node is replaced when it fails `failures_before_healing` consecutive
//! Docker calls after having succeeded at least once, or when its agent
//! stops reporting for longer than the pool's healer thresholds.
//!
//! ```text
//!    failing node ──► lock ──► create machine ──► register new node
//!                                                        │
//!                                                        ▼
//!    destroy old machine ◄── move containers ◄── run-bs task (wait Docker,
//!                                                  start node containers)
//! ```
//!
//! # Configuration
//!
//! Configuration is loaded from environment variables:
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `NODEWARDEN_DATABASE_URL` | `sqlite:.data/nodewarden.db?mode=rwc` | SQLite connection string |
//! | `NODEWARDEN_HTTP_ADDR` | `0.0.0.0:8080` | HTTP API bind address |
//! | `NODEWARDEN_HOST` | `localhost:8080` | Public API endpoint for agents |
//! | `NODEWARDEN_BS_IMAGE` | `tsuru/bs:v1` | big-sibling image |
//! | `NODEWARDEN_BS_SOCKET` | - | Docker socket mounted into big-sibling |
//! | `NODEWARDEN_DOCKER_API_TIMEOUT` | `600` | Seconds to wait for a new node |
//! | `NODEWARDEN_FAILURES_BEFORE_HEALING` | `5` | Node failure threshold |
//! | `NODEWARDEN_CONTAINER_MAX_UNRESPONSIVE` | - | Enables the container healer |
//!
//! See [`config::Config`] for the full list.

#![deny(missing_docs)]

/// Server configuration loaded from environment variables.
pub mod config;

/// Error types.
pub mod error;

/// Node model and health bookkeeping.
pub mod node;

/// Application container records.
pub mod container;

/// Pool-layered configuration documents.
pub mod scopedconfig;

/// Storage traits and backends.
pub mod storage;

/// Event journal with per-target locking and throttling.
pub mod events;

/// Docker Engine clients.
pub mod docker;

/// Node registry with healing locks and hooks.
pub mod registry;

/// Docker cluster facade over the registered nodes.
pub mod cluster;

/// IaaS machine management.
pub mod iaas;

/// In-process task queue.
pub mod queue;

/// Container moves between nodes.
pub mod provisioner;

/// Node container definitions and reconciliation.
pub mod nodecontainer;

/// big-sibling bootstrap.
pub mod bs;

/// Application token issuing.
pub mod auth;

/// Node and container healers.
pub mod healer;

/// HTTP API.
pub mod api;

/// Embeddable runtime for nodewarden.
pub mod runtime;

pub use config::Config;
pub use error::Error;
