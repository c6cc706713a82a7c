// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for nodewarden integration tests.
//!
//! Provides [`Harness`], a fully wired set of components over in-memory
//! storage and a [`MockDocker`] fleet, plus fake IaaS and auth services.

#![allow(dead_code)]

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Notify;

use nodewarden::auth::AuthService;
use nodewarden::bs::RunBsTask;
use nodewarden::cluster::Cluster;
use nodewarden::container::{Container, ContainerStatus};
use nodewarden::docker::MockDocker;
use nodewarden::error::Result;
use nodewarden::events::EventJournal;
use nodewarden::healer::{NodeHealer, NodeHealerSettings};
use nodewarden::iaas::{IaasProvider, IaasRegistry, IaasResult, Machine};
use nodewarden::nodecontainer::{NodeContainerStore, Reconciler};
use nodewarden::provisioner::Provisioner;
use nodewarden::queue::TaskQueue;
use nodewarden::registry::{HookEvent, NodeRegistry};
use nodewarden::storage::Stores;

/// Every component wired over in-memory storage.
pub struct Harness {
    pub stores: Stores,
    pub docker: MockDocker,
    pub registry: Arc<NodeRegistry>,
    pub cluster: Arc<Cluster>,
    pub provisioner: Arc<Provisioner>,
    pub journal: EventJournal,
    pub node_containers: NodeContainerStore,
    pub reconciler: Arc<Reconciler>,
    pub queue: Arc<TaskQueue>,
}

impl Harness {
    /// Build the harness. The reconciler is installed as the create hook
    /// and the `run-bs` task is registered with a short Docker timeout.
    pub async fn new() -> Self {
        let stores = Stores::memory();
        let docker = MockDocker::new();
        let registry = Arc::new(NodeRegistry::new(stores.nodes.clone()));
        let cluster = Arc::new(Cluster::new(
            registry.clone(),
            &stores,
            Arc::new(docker.clone()),
        ));
        let provisioner = Arc::new(Provisioner::new(cluster.clone(), stores.containers.clone()));
        let journal = EventJournal::new(stores.events.clone());
        let node_containers = NodeContainerStore::new(stores.scoped.clone());
        let reconciler = Arc::new(Reconciler::new(cluster.clone(), node_containers.clone()));
        cluster
            .add_hook(HookEvent::BeforeContainerCreate, reconciler.clone())
            .await;
        let queue = Arc::new(TaskQueue::new());
        queue
            .register(Arc::new(RunBsTask::new(
                cluster.clone(),
                reconciler.clone(),
                Duration::from_secs(5),
            )))
            .await;

        Self {
            stores,
            docker,
            registry,
            cluster,
            provisioner,
            journal,
            node_containers,
            reconciler,
            queue,
        }
    }

    /// Node healer over this harness, provisioning through `iaas`.
    pub fn node_healer(&self, settings: NodeHealerSettings, iaas: Arc<dyn IaasProvider>) -> NodeHealer {
        let mut registry = IaasRegistry::new(self.stores.machines.clone());
        registry.register("my-iaas", iaas);
        NodeHealer::new(
            self.provisioner.clone(),
            self.journal.clone(),
            self.queue.clone(),
            &self.stores,
            settings,
        )
        .with_iaas(Arc::new(registry))
        .with_start_time(Utc::now() - chrono::Duration::hours(1))
    }

    /// Store an application container record.
    pub async fn add_app_container(&self, container: &Container) {
        self.stores
            .containers
            .store_container(container)
            .await
            .expect("store container");
    }
}

/// Started application container on `host`, last heard from at `last_success`.
pub fn app_container(id: &str, app: &str, host: &str, last_success: DateTime<Utc>) -> Container {
    Container {
        id: id.to_string(),
        name: format!("{}-web-{}", app, id),
        app_name: app.to_string(),
        process_name: "web".to_string(),
        host_addr: host.to_string(),
        host_port: "32768".to_string(),
        image: format!("tsuru/app-{}", app),
        status: ContainerStatus::Started,
        last_status_update: Some(last_success),
        last_success_status_update: Some(last_success),
        created_at: last_success - chrono::Duration::hours(1),
        ..Default::default()
    }
}

/// IaaS returning machines at a fixed address.
pub struct FakeIaas {
    address: String,
    created: AtomicUsize,
    deleted: Mutex<Vec<String>>,
    gate: Option<Arc<Notify>>,
}

impl FakeIaas {
    /// Provider creating machines at `address`.
    pub fn new(address: &str) -> Self {
        Self {
            address: address.to_string(),
            created: AtomicUsize::new(0),
            deleted: Mutex::new(Vec::new()),
            gate: None,
        }
    }

    /// Hold every create until `gate` is notified.
    pub fn with_gate(mut self, gate: Arc<Notify>) -> Self {
        self.gate = Some(gate);
        self
    }

    /// Machines created so far.
    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    /// Ids of deleted machines.
    pub fn deleted(&self) -> Vec<String> {
        self.deleted.lock().unwrap().clone()
    }
}

#[async_trait]
impl IaasProvider for FakeIaas {
    async fn create_machine(&self, params: &BTreeMap<String, String>) -> IaasResult<Machine> {
        if let Some(gate) = &self.gate {
            gate.notified().await;
        }
        let n = self.created.fetch_add(1, Ordering::SeqCst);
        Ok(Machine {
            id: format!("m-{}", n),
            status: "running".to_string(),
            address: self.address.clone(),
            creation_params: params.clone(),
            ..Default::default()
        })
    }

    async fn delete_machine(&self, machine: &Machine) -> IaasResult<()> {
        self.deleted.lock().unwrap().push(machine.id.clone());
        Ok(())
    }
}

/// Auth service issuing sequential tokens.
#[derive(Default)]
pub struct StaticAuth {
    issued: AtomicUsize,
    active: Mutex<BTreeSet<String>>,
}

impl StaticAuth {
    /// Tokens issued and not revoked.
    pub fn active(&self) -> Vec<String> {
        self.active.lock().unwrap().iter().cloned().collect()
    }

    /// Total logins.
    pub fn issued(&self) -> usize {
        self.issued.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AuthService for StaticAuth {
    async fn login_app(&self, app: &str) -> Result<String> {
        let n = self.issued.fetch_add(1, Ordering::SeqCst);
        let token = format!("{}-token-{}", app, n);
        self.active.lock().unwrap().insert(token.clone());
        Ok(token)
    }

    async fn logout(&self, token: &str) -> Result<()> {
        self.active.lock().unwrap().remove(token);
        Ok(())
    }
}
