// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Container healer integration tests.

mod common;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use common::{Harness, app_container};
use nodewarden::docker::DockerError;
use nodewarden::events::{HealingAction, TargetKind};
use nodewarden::healer::{ContainerHealer, ContainerHealerConfig};
use nodewarden::node::Node;

fn healer(h: &Harness) -> ContainerHealer {
    ContainerHealer::new(
        h.provisioner.clone(),
        h.journal.clone(),
        ContainerHealerConfig {
            max_unresponsive: Duration::from_secs(60),
            ..Default::default()
        },
    )
}

#[tokio::test]
async fn test_running_container_is_not_moved() {
    let h = Harness::new().await;
    h.docker.add_host("http://n1:2375");
    h.docker.add_host("http://n2:2375");
    h.registry.register(Node::new("http://n1:2375")).await.unwrap();
    h.registry.register(Node::new("http://n2:2375")).await.unwrap();

    let stale = Utc::now() - chrono::Duration::minutes(5);
    h.docker
        .insert_container("http://n1:2375", "c1", "myapp-web-c1", "tsuru/app-myapp", true);
    h.docker
        .insert_container("http://n1:2375", "c2", "myapp-web-c2", "tsuru/app-myapp", true);
    h.add_app_container(&app_container("c1", "myapp", "n1", stale))
        .await;
    h.add_app_container(&app_container("c2", "myapp", "n1", Utc::now()))
        .await;

    healer(&h).run_once().await.unwrap();

    assert!(h.journal.list_healing_history(None).await.unwrap().is_empty());
    assert!(h.docker.containers("http://n2:2375").is_empty());
    let c1 = h.stores.containers.get_container("c1").await.unwrap();
    assert_eq!(c1.host_addr, "n1");
    assert!(c1.last_success_status_update.unwrap() > stale);
}

#[tokio::test]
async fn test_dead_container_is_moved() {
    let h = Harness::new().await;
    h.docker.add_host("http://n1:2375");
    h.docker.add_host("http://n2:2375");
    h.registry.register(Node::new("http://n1:2375")).await.unwrap();
    h.registry.register(Node::new("http://n2:2375")).await.unwrap();

    let stale = Utc::now() - chrono::Duration::minutes(5);
    h.docker
        .insert_container("http://n1:2375", "c1", "myapp-web-c1", "tsuru/app-myapp", false);
    h.add_app_container(&app_container("c1", "myapp", "n1", stale))
        .await;

    healer(&h).run_once().await.unwrap();

    let containers = h.stores.containers.list_all_containers().await.unwrap();
    assert_eq!(containers.len(), 1);
    assert_ne!(containers[0].id, "c1");
    assert_eq!(containers[0].host_addr, "n2");
    assert_eq!(containers[0].app_name, "myapp");
    let moved = h.docker.containers("http://n2:2375");
    assert_eq!(moved.len(), 1);
    assert!(moved[0].running);
    assert!(h.docker.containers("http://n1:2375").is_empty());

    let history = h
        .journal
        .list_healing_history(Some(TargetKind::Container))
        .await
        .unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].action, HealingAction::ContainerHealing);
    assert!(history[0].successful, "{}", history[0].error);
    assert_eq!(history[0].failing_container.as_ref().unwrap().id, "c1");
    assert_eq!(
        history[0].created_container.as_ref().unwrap().id,
        containers[0].id
    );
}

#[tokio::test]
async fn test_new_container_within_grace_is_skipped() {
    let h = Harness::new().await;
    h.docker.add_host("http://n1:2375");
    h.docker.add_host("http://n2:2375");
    h.registry.register(Node::new("http://n1:2375")).await.unwrap();
    h.registry.register(Node::new("http://n2:2375")).await.unwrap();

    let mut container = app_container("c1", "myapp", "n1", Utc::now());
    container.last_success_status_update = None;
    container.last_status_update = None;
    container.created_at = Utc::now();
    h.add_app_container(&container).await;

    healer(&h).run_once().await.unwrap();

    assert!(h.journal.list_healing_history(None).await.unwrap().is_empty());
    assert_eq!(
        h.stores.containers.get_container("c1").await.unwrap().host_addr,
        "n1"
    );
}

#[tokio::test]
async fn test_failed_start_leaves_no_moved_record() {
    let h = Harness::new().await;
    h.docker.add_host("http://n1:2375");
    h.docker.add_host("http://n2:2375");
    h.registry.register(Node::new("http://n1:2375")).await.unwrap();
    h.registry.register(Node::new("http://n2:2375")).await.unwrap();
    h.docker.fail_start(
        "http://n2:2375",
        Some(DockerError::Network("start refused".to_string())),
    );

    let stale = Utc::now() - chrono::Duration::minutes(5);
    h.docker
        .insert_container("http://n1:2375", "c1", "myapp-web-c1", "tsuru/app-myapp", false);
    h.add_app_container(&app_container("c1", "myapp", "n1", stale))
        .await;

    healer(&h).run_once().await.unwrap();

    let containers = h.stores.containers.list_all_containers().await.unwrap();
    assert_eq!(containers.len(), 1);
    assert_eq!(containers[0].id, "c1");
    assert!(h.docker.containers("http://n2:2375").is_empty());

    let history = h.journal.list_healing_history(None).await.unwrap();
    assert_eq!(history.len(), 1);
    assert!(!history[0].successful);
    assert!(history[0].error.contains("start refused"), "{}", history[0].error);
}

#[tokio::test]
async fn test_run_heals_before_first_sleep() {
    let h = Harness::new().await;
    h.docker.add_host("http://n1:2375");
    h.docker.add_host("http://n2:2375");
    h.registry.register(Node::new("http://n1:2375")).await.unwrap();
    h.registry.register(Node::new("http://n2:2375")).await.unwrap();

    let stale = Utc::now() - chrono::Duration::minutes(5);
    h.docker
        .insert_container("http://n1:2375", "c1", "myapp-web-c1", "tsuru/app-myapp", false);
    h.add_app_container(&app_container("c1", "myapp", "n1", stale))
        .await;

    let healer = Arc::new(ContainerHealer::new(
        h.provisioner.clone(),
        h.journal.clone(),
        ContainerHealerConfig {
            max_unresponsive: Duration::from_secs(60),
            poll_interval: Duration::from_secs(3600),
        },
    ));
    let runner = healer.clone();
    let handle = tokio::spawn(async move { runner.run().await });

    tokio::time::timeout(Duration::from_secs(5), async {
        while h.journal.list_healing_history(None).await.unwrap().is_empty() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .unwrap();

    healer.shutdown_handle().notify_one();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(h.docker.containers("http://n2:2375").len(), 1);
}
