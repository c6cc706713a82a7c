// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! IaaS machine management.
//!
//! Providers create and delete machines; the [`IaasRegistry`] resolves a
//! provider by name and keeps a record of every machine it created, so the
//! node healer can later destroy a machine knowing only its id or address.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::error::Result;
use crate::node::{META_IAAS, META_IAAS_ID};
use crate::storage::MachineStorage;

/// Default scheme for machine addresses.
pub const DEFAULT_NODE_PROTOCOL: &str = "http";

/// Default Docker port for machine addresses.
pub const DEFAULT_NODE_PORT: u16 = 2375;

/// Errors from machine management.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum IaasError {
    /// No provider registered under the name.
    #[error("IaaS not found: {0}")]
    ProviderNotFound(String),

    /// No name given and no default provider.
    #[error("no IaaS specified and no default IaaS configured")]
    NoDefault,

    /// No machine record matches.
    #[error("machine not found")]
    MachineNotFound,

    /// The provider failed.
    #[error("IaaS error: {0}")]
    Provider(String),
}

/// Result of provider calls.
pub type IaasResult<T> = std::result::Result<T, IaasError>;

/// A machine created through a provider.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Machine {
    /// Provider-assigned id.
    pub id: String,
    /// Provider name.
    #[serde(default)]
    pub iaas: String,
    /// Provider-reported status.
    #[serde(default)]
    pub status: String,
    /// Host name or IP.
    pub address: String,
    /// Docker port, 0 when the provider does not know it.
    #[serde(default)]
    pub port: u16,
    /// Docker scheme, empty when the provider does not know it.
    #[serde(default)]
    pub protocol: String,
    /// Parameters the machine was created with.
    #[serde(default)]
    pub creation_params: BTreeMap<String, String>,
}

impl Machine {
    /// Docker URL of the machine.
    ///
    /// The machine's own protocol and port win over the fallbacks; empty
    /// fallbacks resolve to `http` and 2375.
    pub fn format_node_address(&self, protocol: &str, port: u16) -> String {
        let protocol = [self.protocol.as_str(), protocol]
            .into_iter()
            .find(|p| !p.is_empty())
            .unwrap_or(DEFAULT_NODE_PROTOCOL);
        let port = [self.port, port]
            .into_iter()
            .find(|p| *p != 0)
            .unwrap_or(DEFAULT_NODE_PORT);
        format!("{}://{}:{}", protocol, self.address, port)
    }
}

/// Infrastructure provider.
#[async_trait]
pub trait IaasProvider: Send + Sync {
    /// Create a machine. `id` and `address` must be filled in.
    async fn create_machine(&self, params: &BTreeMap<String, String>) -> IaasResult<Machine>;

    /// Delete a machine.
    async fn delete_machine(&self, machine: &Machine) -> IaasResult<()>;
}

/// Named providers plus the machine records they produced.
pub struct IaasRegistry {
    providers: BTreeMap<String, Arc<dyn IaasProvider>>,
    default: Option<String>,
    machines: Arc<dyn MachineStorage>,
}

impl IaasRegistry {
    /// Registry without providers.
    pub fn new(machines: Arc<dyn MachineStorage>) -> Self {
        Self {
            providers: BTreeMap::new(),
            default: None,
            machines,
        }
    }

    /// Register a provider.
    pub fn register(&mut self, name: &str, provider: Arc<dyn IaasProvider>) {
        self.providers.insert(name.to_string(), provider);
    }

    /// Provider used when none is named.
    pub fn set_default(&mut self, name: &str) {
        self.default = Some(name.to_string());
    }

    fn provider(&self, name: &str) -> IaasResult<Arc<dyn IaasProvider>> {
        self.providers
            .get(name)
            .cloned()
            .ok_or_else(|| IaasError::ProviderNotFound(name.to_string()))
    }

    /// Create a machine on `iaas_name` (or `params["iaas"]`, or the default)
    /// and record it.
    ///
    /// On return `params` carries `iaas` and `iaas-id`, ready to become node
    /// metadata.
    pub async fn create_machine_for_iaas(
        &self,
        iaas_name: &str,
        params: &mut BTreeMap<String, String>,
    ) -> Result<Machine> {
        let name = [iaas_name, params.get(META_IAAS).map(String::as_str).unwrap_or("")]
            .into_iter()
            .find(|n| !n.is_empty())
            .map(str::to_string)
            .or_else(|| self.default.clone())
            .ok_or(IaasError::NoDefault)?;
        let provider = self.provider(&name)?;
        params.insert(META_IAAS.to_string(), name.clone());

        let mut machine = provider.create_machine(params).await?;
        machine.iaas = name.clone();
        machine.creation_params = params.clone();
        params.insert(META_IAAS_ID.to_string(), machine.id.clone());

        if let Err(e) = self.machines.insert_machine(&machine).await {
            warn!(machine = %machine.id, error = %e, "Failed to record machine, deleting it");
            if let Err(del) = provider.delete_machine(&machine).await {
                warn!(machine = %machine.id, error = %del, "Failed to delete unrecorded machine");
            }
            return Err(e);
        }
        info!(iaas = %name, machine = %machine.id, address = %machine.address, "Machine created");
        Ok(machine)
    }

    /// Machine by id, falling back to address.
    pub async fn find_machine_by_id_or_address(&self, id: &str, address: &str) -> Result<Machine> {
        if !id.is_empty() {
            if let Some(machine) = self.machines.find_machine_by_id(id).await? {
                return Ok(machine);
            }
        }
        if !address.is_empty() {
            if let Some(machine) = self.machines.find_machine_by_address(address).await? {
                return Ok(machine);
            }
        }
        Err(IaasError::MachineNotFound.into())
    }

    /// Delete a machine through its provider and drop its record.
    pub async fn destroy(&self, machine: &Machine) -> Result<()> {
        let provider = self.provider(&machine.iaas)?;
        provider.delete_machine(machine).await?;
        self.machines.remove_machine(&machine.id).await?;
        info!(iaas = %machine.iaas, machine = %machine.id, "Machine destroyed");
        Ok(())
    }

    /// Every recorded machine.
    pub async fn list_machines(&self) -> Result<Vec<Machine>> {
        self.machines.list_machines().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::MemoryStorage;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingIaas {
        created: AtomicUsize,
        deleted: AtomicUsize,
    }

    #[async_trait]
    impl IaasProvider for CountingIaas {
        async fn create_machine(&self, params: &BTreeMap<String, String>) -> IaasResult<Machine> {
            let n = self.created.fetch_add(1, Ordering::SeqCst);
            Ok(Machine {
                id: format!("m-{}", n),
                address: params.get("address").cloned().unwrap_or_else(|| "10.0.0.9".into()),
                status: "running".into(),
                ..Default::default()
            })
        }

        async fn delete_machine(&self, _machine: &Machine) -> IaasResult<()> {
            self.deleted.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_create_find_destroy() {
        let provider = Arc::new(CountingIaas::default());
        let mut registry = IaasRegistry::new(Arc::new(MemoryStorage::new()));
        registry.register("my-iaas", provider.clone());

        let mut params = BTreeMap::new();
        params.insert("pool".to_string(), "p1".to_string());
        let machine = registry
            .create_machine_for_iaas("my-iaas", &mut params)
            .await
            .unwrap();
        assert_eq!(machine.iaas, "my-iaas");
        assert_eq!(params.get(META_IAAS_ID), Some(&machine.id));
        assert_eq!(params.get(META_IAAS).map(String::as_str), Some("my-iaas"));

        let by_address = registry
            .find_machine_by_id_or_address("", "10.0.0.9")
            .await
            .unwrap();
        assert_eq!(by_address.id, machine.id);

        registry.destroy(&machine).await.unwrap();
        assert_eq!(provider.deleted.load(Ordering::SeqCst), 1);
        assert!(registry.list_machines().await.unwrap().is_empty());
        assert!(matches!(
            registry.find_machine_by_id_or_address(&machine.id, "").await,
            Err(crate::error::Error::Iaas(IaasError::MachineNotFound))
        ));
    }

    #[tokio::test]
    async fn test_default_provider() {
        let mut registry = IaasRegistry::new(Arc::new(MemoryStorage::new()));
        let mut params = BTreeMap::new();
        assert!(matches!(
            registry.create_machine_for_iaas("", &mut params).await,
            Err(crate::error::Error::Iaas(IaasError::NoDefault))
        ));
        registry.register("ec2", Arc::new(CountingIaas::default()));
        registry.set_default("ec2");
        let machine = registry.create_machine_for_iaas("", &mut params).await.unwrap();
        assert_eq!(machine.iaas, "ec2");
    }

    #[test]
    fn test_format_node_address() {
        let mut machine = Machine {
            address: "localhost".into(),
            ..Default::default()
        };
        assert_eq!(machine.format_node_address("", 0), "http://localhost:2375");
        assert_eq!(machine.format_node_address("https", 4243), "https://localhost:4243");
        machine.port = 5000;
        machine.protocol = "tcp".into();
        assert_eq!(machine.format_node_address("https", 4243), "tcp://localhost:5000");
    }
}
