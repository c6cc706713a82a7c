// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! HTTP API.
//!
//! JSON endpoints for node agents and operators:
//!
//! | Method | Path | Action |
//! |--------|------|--------|
//! | POST | `/node/status` | Record an agent health report |
//! | GET | `/nodes` | Registered nodes with their status |
//! | GET | `/healing` | Healing history (`?filter=node\|container`) |
//! | GET/POST/DELETE | `/healer/node` | Node healer thresholds |
//! | GET/POST | `/nodecontainers` | List or declare node containers |
//! | GET/POST/DELETE | `/nodecontainers/{name}` | One node container |
//! | POST | `/nodecontainers/{name}/upgrade` | Re-pull and relaunch |

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::error::Error;
use crate::events::{EventError, EventJournal, HealingEvent, TargetKind};
use crate::healer::{NodeHealer, NodeHealerConfig, NodeStatusReport};
use crate::node::Node;
use crate::nodecontainer::{NodeContainerConfig, NodeContainerConfigGroup, Reconciler};
use crate::provisioner::LogBuffer;
use crate::registry::NodeRegistry;

/// Shared handler state.
#[derive(Clone)]
pub struct ApiState {
    /// Node registry.
    pub registry: Arc<NodeRegistry>,
    /// Node healer.
    pub node_healer: Arc<NodeHealer>,
    /// Event journal.
    pub journal: EventJournal,
    /// Node container reconciler, with its definitions.
    pub reconciler: Arc<Reconciler>,
}

/// Error rendered as `{"error": "..."}` with a matching status code.
#[derive(Debug)]
pub struct ApiError(Error);

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        Self(err)
    }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match &self.0 {
            Error::Validation(_) => StatusCode::BAD_REQUEST,
            Error::Event(EventError::Locked { .. } | EventError::Throttled { .. })
            | Error::HealerInProgress(_) => StatusCode::CONFLICT,
            e if e.is_not_found() => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            warn!(error = %self.0, "Request failed");
        }
        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

/// Build the router.
pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/node/status", post(post_node_status))
        .route("/nodes", get(list_nodes))
        .route("/healing", get(list_healing))
        .route(
            "/healer/node",
            get(get_healer_config)
                .post(update_healer_config)
                .delete(remove_healer_config),
        )
        .route("/nodecontainers", get(list_node_containers).post(add_node_container))
        .route(
            "/nodecontainers/{name}",
            get(get_node_container)
                .post(update_node_container)
                .delete(remove_node_container),
        )
        .route("/nodecontainers/{name}/upgrade", post(upgrade_node_container))
        .with_state(state)
}

/// Serve the API on `addr` until `shutdown` is notified.
pub async fn serve(addr: SocketAddr, state: ApiState, shutdown: Arc<Notify>) -> crate::error::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| Error::Other(format!("failed to bind {}: {}", addr, e)))?;
    info!(addr = %addr, "HTTP API listening");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.notified().await })
        .await
        .map_err(|e| Error::Other(format!("HTTP server error: {}", e)))?;
    info!("HTTP API stopped");
    Ok(())
}

#[derive(Debug, Default, Deserialize)]
struct PoolQuery {
    #[serde(default)]
    pool: String,
}

#[derive(Debug, Default, Deserialize)]
struct HealerRemoveQuery {
    #[serde(default)]
    pool: String,
    #[serde(default)]
    name: String,
}

#[derive(Debug, Default, Deserialize)]
struct ContainerRemoveQuery {
    #[serde(default)]
    pool: String,
    #[serde(default)]
    kill: bool,
}

#[derive(Debug, Default, Deserialize)]
struct HealingQuery {
    #[serde(default)]
    filter: String,
}

#[derive(Debug, Serialize)]
struct NodeView {
    #[serde(flatten)]
    node: Node,
    status: String,
}

#[derive(Debug, Serialize)]
struct LogOutput {
    log: String,
}

async fn post_node_status(
    State(state): State<ApiState>,
    Json(report): Json<NodeStatusReport>,
) -> ApiResult<StatusCode> {
    state.node_healer.update_node_data(&report).await?;
    Ok(StatusCode::OK)
}

async fn list_nodes(State(state): State<ApiState>) -> ApiResult<Json<Vec<NodeView>>> {
    let now = Utc::now();
    let nodes = state
        .registry
        .unfiltered_list()
        .await?
        .into_iter()
        .map(|node| NodeView {
            status: node.status_at(now).to_string(),
            node,
        })
        .collect();
    Ok(Json(nodes))
}

async fn list_healing(
    State(state): State<ApiState>,
    Query(query): Query<HealingQuery>,
) -> ApiResult<Json<Vec<HealingEvent>>> {
    let filter = match query.filter.as_str() {
        "" => None,
        "node" => Some(TargetKind::Node),
        "container" => Some(TargetKind::Container),
        other => {
            return Err(Error::Validation(format!("invalid filter {:?}", other)).into());
        }
    };
    Ok(Json(state.journal.list_healing_history(filter).await?))
}

async fn get_healer_config(
    State(state): State<ApiState>,
) -> ApiResult<Json<BTreeMap<String, NodeHealerConfig>>> {
    Ok(Json(state.node_healer.get_config().await?))
}

async fn update_healer_config(
    State(state): State<ApiState>,
    Query(query): Query<PoolQuery>,
    Json(config): Json<NodeHealerConfig>,
) -> ApiResult<StatusCode> {
    state.node_healer.update_config(&query.pool, &config).await?;
    Ok(StatusCode::OK)
}

async fn remove_healer_config(
    State(state): State<ApiState>,
    Query(query): Query<HealerRemoveQuery>,
) -> ApiResult<StatusCode> {
    state
        .node_healer
        .remove_config(&query.pool, Some(query.name.as_str()))
        .await?;
    Ok(StatusCode::OK)
}

async fn list_node_containers(
    State(state): State<ApiState>,
) -> ApiResult<Json<Vec<NodeContainerConfigGroup>>> {
    Ok(Json(state.reconciler.store().all_node_containers().await?))
}

async fn add_node_container(
    State(state): State<ApiState>,
    Query(query): Query<PoolQuery>,
    Json(config): Json<NodeContainerConfig>,
) -> ApiResult<StatusCode> {
    state
        .reconciler
        .store()
        .add_new_container(&query.pool, &config)
        .await?;
    Ok(StatusCode::CREATED)
}

async fn get_node_container(
    State(state): State<ApiState>,
    Path(name): Path<String>,
) -> ApiResult<Json<BTreeMap<String, NodeContainerConfig>>> {
    Ok(Json(
        state
            .reconciler
            .store()
            .load_node_containers_for_pools(&name)
            .await?,
    ))
}

async fn update_node_container(
    State(state): State<ApiState>,
    Path(name): Path<String>,
    Query(query): Query<PoolQuery>,
    Json(mut config): Json<NodeContainerConfig>,
) -> ApiResult<StatusCode> {
    config.name = name;
    state
        .reconciler
        .store()
        .update_container(&query.pool, &config)
        .await?;
    Ok(StatusCode::OK)
}

async fn remove_node_container(
    State(state): State<ApiState>,
    Path(name): Path<String>,
    Query(query): Query<ContainerRemoveQuery>,
) -> ApiResult<Json<LogOutput>> {
    state
        .reconciler
        .store()
        .remove_container(&query.pool, &name)
        .await?;
    let log = LogBuffer::new();
    if query.kill {
        debug!(name = %name, pool = %query.pool, "Removing node containers from nodes");
        state
            .reconciler
            .remove_named_containers(&name, Some(&query.pool), &log)
            .await?;
    }
    Ok(Json(LogOutput {
        log: log.contents(),
    }))
}

async fn upgrade_node_container(
    State(state): State<ApiState>,
    Path(name): Path<String>,
    Query(query): Query<PoolQuery>,
) -> ApiResult<Json<LogOutput>> {
    state
        .reconciler
        .store()
        .upgrade_container(&query.pool, &name)
        .await?;
    let log = LogBuffer::new();
    state
        .reconciler
        .recreate_named_containers(&name, Some(&query.pool), &log)
        .await?;
    Ok(Json(LogOutput {
        log: log.contents(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_status_mapping() {
        let status = |e: Error| ApiError::from(e).status();
        assert_eq!(status(Error::Validation("bad".into())), StatusCode::BAD_REQUEST);
        assert_eq!(status(Error::NodeContainerNotFound), StatusCode::NOT_FOUND);
        assert_eq!(status(Error::NodeNotFound("x".into())), StatusCode::NOT_FOUND);
        assert_eq!(
            status(Error::HealerInProgress("x".into())),
            StatusCode::CONFLICT
        );
        assert_eq!(
            status(Error::Other("boom".into())),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
