// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! HTTP API tests against the router, without a listening socket.

mod common;

use std::sync::Arc;

use axum::Router;
use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use chrono::Utc;
use serde_json::{Value, json};
use tower::ServiceExt;

use common::{FakeIaas, Harness, app_container};
use nodewarden::api::{ApiState, router};
use nodewarden::healer::NodeHealerSettings;
use nodewarden::node::Node;

fn app(h: &Harness) -> Router {
    let node_healer = h.node_healer(
        NodeHealerSettings::default(),
        Arc::new(FakeIaas::new("localhost")),
    );
    router(ApiState {
        registry: h.registry.clone(),
        node_healer: Arc::new(node_healer),
        journal: h.journal.clone(),
        reconciler: h.reconciler.clone(),
    })
}

async fn call(app: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let mut request = Request::builder().method(method).uri(uri);
    let body = match body {
        Some(value) => {
            request = request.header("content-type", "application/json");
            Body::from(value.to_string())
        }
        None => Body::empty(),
    };
    let response = app
        .clone()
        .oneshot(request.body(body).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}

#[tokio::test]
async fn test_node_container_lifecycle() {
    let h = Harness::new().await;
    let app = app(&h);

    let (status, _) = call(
        &app,
        Method::POST,
        "/nodecontainers",
        Some(json!({"name": "bs", "config": {"image": "tsuru/bs:v1", "env": ["A=1"]}})),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);

    let (status, _) = call(
        &app,
        Method::POST,
        "/nodecontainers?pool=p1",
        Some(json!({"name": "bs", "config": {"env": ["B=2"]}})),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);

    let (status, body) = call(&app, Method::GET, "/nodecontainers", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body[0]["name"], "bs");
    assert_eq!(body[0]["configPools"][""]["config"]["image"], "tsuru/bs:v1");
    assert_eq!(body[0]["configPools"]["p1"]["config"]["env"], json!(["B=2"]));

    let (status, body) = call(&app, Method::GET, "/nodecontainers/bs", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["p1"]["config"]["image"], "tsuru/bs:v1");

    let (status, _) = call(
        &app,
        Method::POST,
        "/nodecontainers/bs",
        Some(json!({"config": {"env": ["A=5"]}})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let base = h.node_containers.load_node_container("", "bs").await.unwrap();
    assert_eq!(base.config.env, vec!["A=5"]);

    let (status, body) = call(&app, Method::DELETE, "/nodecontainers/bs?pool=p1", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["log"], "");
    let (status, body) = call(&app, Method::DELETE, "/nodecontainers/bs?pool=p1", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(body["error"].is_string());
}

#[tokio::test]
async fn test_node_container_validation_errors() {
    let h = Harness::new().await;
    let app = app(&h);

    let (status, body) = call(
        &app,
        Method::POST,
        "/nodecontainers",
        Some(json!({"name": "bs"})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "node container config image cannot be empty");

    let (status, _) = call(
        &app,
        Method::POST,
        "/nodecontainers/missing",
        Some(json!({"config": {"env": ["A=1"]}})),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_remove_with_kill_clears_nodes() {
    let h = Harness::new().await;
    h.docker.add_host("http://n1:2375");
    h.registry.register(Node::new("http://n1:2375")).await.unwrap();
    let app = app(&h);

    call(
        &app,
        Method::POST,
        "/nodecontainers",
        Some(json!({"name": "bs", "config": {"image": "tsuru/bs:v1"}})),
    )
    .await;
    h.reconciler
        .ensure_containers_started(&nodewarden::provisioner::LogBuffer::new(), false, &[], &[])
        .await
        .unwrap();
    assert_eq!(h.docker.containers("http://n1:2375").len(), 1);

    let (status, _) = call(&app, Method::DELETE, "/nodecontainers/bs?kill=true", None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(h.docker.containers("http://n1:2375").is_empty());
    assert!(h.node_containers.all_names().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_healer_config_round_trip() {
    let h = Harness::new().await;
    let app = app(&h);

    let (status, _) = call(
        &app,
        Method::POST,
        "/healer/node",
        Some(json!({"enabled": true, "maxunresponsivetime": 30})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let (status, _) = call(
        &app,
        Method::POST,
        "/healer/node?pool=p1",
        Some(json!({"enabled": false})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = call(&app, Method::GET, "/healer/node", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body[""]["enabled"], true);
    assert_eq!(body["p1"]["enabled"], false);
    assert_eq!(body["p1"]["maxunresponsivetime"], 30);
    assert_eq!(body["p1"]["maxunresponsivetimeinherited"], true);

    let (status, _) = call(&app, Method::DELETE, "/healer/node?pool=p1", None).await;
    assert_eq!(status, StatusCode::OK);
    let (_, body) = call(&app, Method::GET, "/healer/node", None).await;
    assert!(body.get("p1").is_none());
}

#[tokio::test]
async fn test_node_status_report_and_listing() {
    let h = Harness::new().await;
    h.registry.register(Node::new("http://a:4243")).await.unwrap();
    h.add_app_container(&app_container("u1", "myapp", "a", Utc::now()))
        .await;
    let app = app(&h);

    let (status, _) = call(
        &app,
        Method::POST,
        "/node/status",
        Some(json!({
            "units": ["u1"],
            "checks": [{"name": "ping", "successful": true}]
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let record = h
        .stores
        .node_status
        .get_node_status("http://a:4243")
        .await
        .unwrap()
        .unwrap();
    assert!(record.last_success.is_some());

    let (status, _) = call(
        &app,
        Method::POST,
        "/node/status",
        Some(json!({"addrs": ["10.9.9.9"]})),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, body) = call(&app, Method::GET, "/nodes", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body[0]["address"], "http://a:4243");
    assert_eq!(body[0]["status"], "waiting");
}

#[tokio::test]
async fn test_healing_filter() {
    let h = Harness::new().await;
    let app = app(&h);

    let (status, body) = call(&app, Method::GET, "/healing?filter=node", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!([]));

    let (status, body) = call(&app, Method::GET, "/healing?filter=bogus", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "invalid filter \"bogus\"");
}
