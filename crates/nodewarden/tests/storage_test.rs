// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! File-backed SQLite storage survives a restart.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use nodewarden::node::{META_POOL, Node, NodeChecks};
use nodewarden::nodecontainer::{NodeContainerConfig, NodeContainerStore};
use nodewarden::storage::{SqliteStorage, Stores};

#[tokio::test]
async fn test_state_persists_across_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("state").join("nodewarden.db");

    {
        let stores = Stores::from_backend(Arc::new(SqliteStorage::from_path(&path).await.unwrap()));
        stores
            .nodes
            .store_node(&Node::new("http://n1:2375").with_metadata(META_POOL, "p1"))
            .await
            .unwrap();
        stores
            .node_status
            .push_node_status(
                "http://n1:2375",
                Utc::now(),
                true,
                NodeChecks {
                    time: Utc::now(),
                    checks: vec![],
                },
            )
            .await
            .unwrap();
        NodeContainerStore::new(stores.scoped.clone())
            .add_new_container("", &NodeContainerConfig::new("bs", "tsuru/bs:v1"))
            .await
            .unwrap();
    }

    let stores = Stores::from_backend(Arc::new(SqliteStorage::from_path(&path).await.unwrap()));
    let node = stores.nodes.retrieve_node("http://n1:2375").await.unwrap();
    assert_eq!(node.pool(), "p1");
    let status = stores
        .node_status
        .get_node_status("http://n1:2375")
        .await
        .unwrap()
        .unwrap();
    assert!(status.last_success.is_some());
    let bs = NodeContainerStore::new(stores.scoped.clone())
        .load_node_container("", "bs")
        .await
        .unwrap();
    assert_eq!(bs.config.image, "tsuru/bs:v1");
}

#[tokio::test]
async fn test_healing_lock_is_exclusive_on_disk() {
    let dir = tempfile::tempdir().unwrap();
    let stores = Stores::from_backend(Arc::new(
        SqliteStorage::from_path(dir.path().join("nodewarden.db"))
            .await
            .unwrap(),
    ));
    stores
        .nodes
        .store_node(&Node::new("http://n1:2375"))
        .await
        .unwrap();

    let timeout = Duration::from_secs(30);
    assert!(
        stores
            .nodes
            .lock_node_for_healing("http://n1:2375", true, timeout)
            .await
            .unwrap()
    );
    assert!(
        !stores
            .nodes
            .lock_node_for_healing("http://n1:2375", true, timeout)
            .await
            .unwrap()
    );
    stores.nodes.unlock_node("http://n1:2375").await.unwrap();
    assert!(
        stores
            .nodes
            .lock_node_for_healing("http://n1:2375", false, timeout)
            .await
            .unwrap()
    );
}
