// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Node containers.
//!
//! A node container is a privileged sidecar that must run once on every
//! node. Its definition lives in the `nodeContainer` scoped config, one
//! entry name per container: the base entry (pool `""`) carries the full
//! definition and per-pool entries override parts of it.
//!
//! After a pull the reconciler pins untagged images to the digest it got,
//! so every node runs the same bits until the image is reset.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use crate::docker::{ContainerConfig, HostConfig, dedup_env, should_pin_image};
use crate::error::{Error, Result};
use crate::scopedconfig::{Merge, MergeOptions, ScopedConfig, filter_pools, merge_field};
use crate::storage::ScopedConfigStorage;

pub mod reconciler;

pub use reconciler::Reconciler;

/// Scoped config collection holding node containers.
pub const COLLECTION: &str = "nodeContainer";

const PINNED_IMAGE_FIELD: &str = "pinnedImage";

const OPTIONS: MergeOptions = MergeOptions {
    jsonfy: true,
    shallow_merge: false,
    allow_empty: false,
    slice_add: true,
    allow_map_empty: false,
    set_inherited: false,
};

/// Declared state of one node container, for one pool.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeContainerConfig {
    /// Container name, unique in the collection.
    #[serde(default)]
    pub name: String,
    /// `image@digest` recorded after a pull.
    #[serde(default)]
    pub pinned_image: String,
    /// Skip this container.
    #[serde(default)]
    pub disabled: Option<bool>,
    /// Process config.
    #[serde(default)]
    pub config: ContainerConfig,
    /// Host config.
    #[serde(default)]
    pub host_config: HostConfig,
}

impl NodeContainerConfig {
    /// Config with just a name and an image.
    pub fn new(name: impl Into<String>, image: impl Into<String>) -> Self {
        let mut config = Self {
            name: name.into(),
            ..Default::default()
        };
        config.config.image = image.into();
        config
    }

    /// Image to run: the pinned one when set.
    pub fn image(&self) -> &str {
        if self.pinned_image.is_empty() {
            &self.config.image
        } else {
            &self.pinned_image
        }
    }

    /// Whether the container should be deployed.
    pub fn valid(&self) -> bool {
        self.disabled != Some(true) && !self.image().is_empty()
    }

    fn validate(&self, image_required: bool) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::Validation(
                "node container config name cannot be empty".to_string(),
            ));
        }
        if image_required && self.config.image.is_empty() {
            return Err(Error::Validation(
                "node container config image cannot be empty".to_string(),
            ));
        }
        Ok(())
    }
}

impl Merge for NodeContainerConfig {
    fn is_empty_value(&self, opts: &MergeOptions) -> bool {
        !opts.allow_empty && *self == NodeContainerConfig::default()
    }

    fn merge_from(&mut self, over: &Self, opts: &MergeOptions) -> bool {
        let mut merged = merge_field(&mut self.name, &over.name, opts);
        merged |= merge_field(&mut self.pinned_image, &over.pinned_image, opts);
        merged |= merge_field(&mut self.disabled, &over.disabled, opts);
        merged |= self.config.merge_from(&over.config, opts);
        merged |= self.host_config.merge_from(&over.host_config, opts);
        merged
    }
}

/// One node container with its entry for each pool.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeContainerConfigGroup {
    /// Container name.
    pub name: String,
    /// Raw entry per pool, base under `""`.
    pub config_pools: BTreeMap<String, NodeContainerConfig>,
}

/// Node container definitions.
#[derive(Clone)]
pub struct NodeContainerStore {
    storage: Arc<dyn ScopedConfigStorage>,
}

impl NodeContainerStore {
    /// Store over `storage`.
    pub fn new(storage: Arc<dyn ScopedConfigStorage>) -> Self {
        Self { storage }
    }

    fn config_for(&self, name: &str) -> ScopedConfig<NodeContainerConfig> {
        ScopedConfig::for_name(self.storage.clone(), COLLECTION, name).with_options(OPTIONS)
    }

    async fn load_raw(&self, pool: &str, name: &str) -> Result<NodeContainerConfig> {
        let pools = [pool.to_string()];
        Ok(self
            .config_for(name)
            .load_pools_merge(&pools, false, true)
            .await?
            .remove(pool)
            .unwrap_or_default())
    }

    /// Write `field` of the `pool` entry only if it is still unset.
    pub(crate) async fn claim_field(
        &self,
        pool: &str,
        name: &str,
        field: &str,
        value: Value,
    ) -> Result<bool> {
        self.config_for(name).set_field_atomic(pool, field, value).await
    }

    /// Names of every declared node container, sorted.
    pub async fn all_names(&self) -> Result<Vec<String>> {
        crate::scopedconfig::all_names(&*self.storage, COLLECTION).await
    }

    /// Declare a node container, or merge into an existing declaration.
    ///
    /// The base entry needs an image; a pool entry may leave it out when
    /// the base has one.
    pub async fn add_new_container(&self, pool: &str, config: &NodeContainerConfig) -> Result<()> {
        config.validate(pool.is_empty())?;
        let conf = self.config_for(&config.name);
        if !pool.is_empty() && config.config.image.is_empty() {
            let base = conf.load_base().await?;
            if base.config.image.is_empty() {
                return Err(Error::Validation(
                    "node container config image cannot be empty".to_string(),
                ));
            }
        }
        conf.save_merge(pool, config).await?;
        info!(name = %config.name, pool = %pool, "Node container saved");
        Ok(())
    }

    /// Merge `config` into an existing entry for `pool`.
    ///
    /// Environment entries are combined with the stored ones, the newest
    /// value winning; `KEY=` removes a variable. Other lists are replaced.
    pub async fn update_container(&self, pool: &str, config: &NodeContainerConfig) -> Result<()> {
        config.validate(false)?;
        let conf = self.config_for(&config.name);
        if !conf.has_entry(pool).await? {
            return Err(Error::NodeContainerNotFound);
        }
        let old = self.load_raw(pool, &config.name).await?;
        let mut update = config.clone();
        update.config.env = dedup_env(&[old.config.env, config.config.env.clone()].concat(), false);
        let conf = conf.with_options(MergeOptions {
            slice_add: false,
            ..OPTIONS
        });
        conf.save_merge(pool, &update).await?;
        if update.config.env.is_empty() {
            conf.set_field(pool, "config.env", Value::Array(vec![])).await?;
        }
        Ok(())
    }

    /// Delete the entry for `pool`.
    pub async fn remove_container(&self, pool: &str, name: &str) -> Result<()> {
        if !self.config_for(name).remove(pool).await? {
            return Err(Error::NodeContainerNotFound);
        }
        info!(name = %name, pool = %pool, "Node container removed");
        Ok(())
    }

    /// Effective config for `pool`.
    pub async fn load_node_container(&self, pool: &str, name: &str) -> Result<NodeContainerConfig> {
        self.config_for(name).load(pool).await
    }

    /// Effective config for every pool, base under `""`.
    pub async fn load_node_containers_for_pools(
        &self,
        name: &str,
    ) -> Result<BTreeMap<String, NodeContainerConfig>> {
        self.load_node_containers_for_pools_merge(name, false).await
    }

    /// Configs for every pool; pool entries are returned raw when
    /// `skip_default`, otherwise merged over the base.
    pub async fn load_node_containers_for_pools_merge(
        &self,
        name: &str,
        skip_default: bool,
    ) -> Result<BTreeMap<String, NodeContainerConfig>> {
        let configs = self
            .config_for(name)
            .load_pools_merge(&[], !skip_default, false)
            .await?;
        if configs.is_empty() {
            return Err(Error::NodeContainerNotFound);
        }
        Ok(configs)
    }

    /// Configs of `name` for the given pools only.
    pub async fn load_node_containers_for(
        &self,
        name: &str,
        pools: &[String],
    ) -> Result<BTreeMap<String, NodeContainerConfig>> {
        let mut configs = self.load_node_containers_for_pools(name).await?;
        filter_pools(&mut configs, pools);
        Ok(configs)
    }

    /// Every node container with its raw pool entries, sorted by name.
    pub async fn all_node_containers(&self) -> Result<Vec<NodeContainerConfigGroup>> {
        let mut groups = Vec::new();
        for name in self.all_names().await? {
            let config_pools = self
                .config_for(&name)
                .load_pools_merge(&[], false, false)
                .await?;
            groups.push(NodeContainerConfigGroup { name, config_pools });
        }
        groups.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(groups)
    }

    /// Clear the pinned image so the next reconcile pulls again.
    ///
    /// A pool with its own image is cleared alone. Otherwise the base is
    /// cleared along with every pool pinned to the same image as the base.
    pub async fn reset_image(&self, pool: &str, name: &str) -> Result<()> {
        let conf = self.config_for(name);
        let (base, effective) = conf.load_with_base(pool).await?;
        if !pool.is_empty() && effective.config.image != base.config.image {
            return conf
                .set_field(pool, PINNED_IMAGE_FIELD, Value::String(String::new()))
                .await;
        }
        conf.set_field("", PINNED_IMAGE_FIELD, Value::String(String::new()))
            .await?;
        if base.pinned_image.is_empty() {
            return Ok(());
        }
        let raw = conf.load_pools_merge(&[], false, false).await?;
        for (entry_pool, entry) in raw {
            if !entry_pool.is_empty() && entry.pinned_image == base.pinned_image {
                conf.set_field(&entry_pool, PINNED_IMAGE_FIELD, Value::String(String::new()))
                    .await?;
            }
        }
        Ok(())
    }

    /// Make sure `pool` has an entry, then reset its image.
    pub async fn upgrade_container(&self, pool: &str, name: &str) -> Result<()> {
        let conf = self.config_for(name);
        if !conf.has_entry(pool).await? {
            if pool.is_empty() || !conf.has_entry("").await? {
                return Err(Error::NodeContainerNotFound);
            }
            conf.save(pool, &NodeContainerConfig {
                name: name.to_string(),
                ..Default::default()
            })
            .await?;
        }
        self.reset_image(pool, name).await
    }

    /// Record `image@digest` as the pinned image, on the base when `image`
    /// is the base image and on `pool` otherwise. Tagged or already pinned
    /// references are left alone.
    pub async fn pin_image_if_needed(
        &self,
        name: &str,
        image: &str,
        digest: &str,
        pool: &str,
    ) -> Result<()> {
        if digest.is_empty() || !should_pin_image(image) {
            return Ok(());
        }
        let conf = self.config_for(name);
        let base = conf.load_base().await?;
        let target = if base.image() == image { "" } else { pool };
        let pinned = format!("{}@{}", image, digest);
        debug!(name = %name, pool = %target, pinned = %pinned, "Pinning node container image");
        conf.set_field(target, PINNED_IMAGE_FIELD, Value::String(pinned))
            .await
    }
}
