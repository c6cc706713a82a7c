// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Scoped configuration store.
//!
//! A scoped config is a table of entries keyed by `(collection, name, pool)`.
//! The entry with pool `""` is the base; per-pool entries override it. Reads
//! through [`ScopedConfig::load`] merge the base with the pool entry, writes
//! through [`ScopedConfig::save_merge`] merge a partial value into whatever is
//! stored for that pool.
//!
//! # Merge rules
//!
//! | Value kind | Rule |
//! |------------|------|
//! | struct | each field merged recursively (or replaced when `shallow_merge`) |
//! | scalar | override replaces base unless empty |
//! | `Option` | `Some` replaces, `None` is empty |
//! | list | replaced, or appended with `slice_add` |
//! | string map | element-wise; an empty override value deletes the key unless `allow_map_empty` |
//!
//! "Empty" is the type's zero value; with `allow_empty` only `None` counts
//! as empty.
//!
//! Types carrying `*_inherited` flags set them at load time to tell which
//! values came from the base entry.

use std::collections::BTreeMap;
use std::marker::PhantomData;
use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::Result;
use crate::storage::ScopedConfigStorage;

/// Collection-level merge flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeOptions {
    /// Store the value as an opaque JSON document; field paths are used
    /// verbatim. Otherwise field paths are lowercased.
    pub jsonfy: bool,
    /// Replace top-level fields instead of recursing into them.
    pub shallow_merge: bool,
    /// Only absent values count as empty.
    pub allow_empty: bool,
    /// Append lists instead of replacing them.
    pub slice_add: bool,
    /// Keep empty map values instead of deleting the key.
    pub allow_map_empty: bool,
    /// Set `*_inherited` flags while merging.
    pub set_inherited: bool,
}

/// A value that can be merged over a base of the same type.
pub trait Merge: Clone {
    /// Whether this value counts as unset for merging.
    fn is_empty_value(&self, opts: &MergeOptions) -> bool;

    /// Merge `over` into `self`. Returns true when anything from `over` was
    /// taken.
    fn merge_from(&mut self, over: &Self, opts: &MergeOptions) -> bool {
        if over.is_empty_value(opts) {
            return false;
        }
        *self = over.clone();
        true
    }
}

/// Merge one struct field, honouring `shallow_merge`.
pub fn merge_field<T: Merge>(base: &mut T, over: &T, opts: &MergeOptions) -> bool {
    if opts.shallow_merge {
        if over.is_empty_value(opts) {
            return false;
        }
        *base = over.clone();
        return true;
    }
    base.merge_from(over, opts)
}

impl Merge for String {
    fn is_empty_value(&self, opts: &MergeOptions) -> bool {
        !opts.allow_empty && self.is_empty()
    }
}

impl Merge for bool {
    fn is_empty_value(&self, opts: &MergeOptions) -> bool {
        !opts.allow_empty && !*self
    }
}

macro_rules! numeric_merge {
    ($($t:ty),*) => {
        $(
            impl Merge for $t {
                fn is_empty_value(&self, opts: &MergeOptions) -> bool {
                    !opts.allow_empty && *self == 0
                }
            }
        )*
    };
}

numeric_merge!(i32, i64, u16, u32, u64, usize);

impl<T: Clone> Merge for Option<T> {
    fn is_empty_value(&self, _opts: &MergeOptions) -> bool {
        self.is_none()
    }
}

impl<T: Clone> Merge for Vec<T> {
    fn is_empty_value(&self, _opts: &MergeOptions) -> bool {
        self.is_empty()
    }

    fn merge_from(&mut self, over: &Self, opts: &MergeOptions) -> bool {
        if opts.slice_add {
            self.extend(over.iter().cloned());
            return !over.is_empty();
        }
        if over.is_empty() {
            return false;
        }
        *self = over.clone();
        true
    }
}

impl Merge for BTreeMap<String, String> {
    fn is_empty_value(&self, _opts: &MergeOptions) -> bool {
        self.is_empty()
    }

    fn merge_from(&mut self, over: &Self, opts: &MergeOptions) -> bool {
        let mut merged = false;
        for (k, v) in over {
            if opts.allow_map_empty || !v.is_empty() {
                merged = true;
                self.insert(k.clone(), v.clone());
            } else {
                self.remove(k);
            }
        }
        merged
    }
}

/// Typed view over one named scoped config.
pub struct ScopedConfig<T> {
    storage: Arc<dyn ScopedConfigStorage>,
    collection: String,
    name: String,
    opts: MergeOptions,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for ScopedConfig<T> {
    fn clone(&self) -> Self {
        Self {
            storage: self.storage.clone(),
            collection: self.collection.clone(),
            name: self.name.clone(),
            opts: self.opts,
            _marker: PhantomData,
        }
    }
}

impl<T> ScopedConfig<T>
where
    T: Merge + Default + Serialize + DeserializeOwned + Send,
{
    /// Config named after its collection.
    pub fn new(storage: Arc<dyn ScopedConfigStorage>, collection: &str) -> Self {
        Self::for_name(storage, collection, collection)
    }

    /// Config with an explicit entry name inside the collection.
    pub fn for_name(storage: Arc<dyn ScopedConfigStorage>, collection: &str, name: &str) -> Self {
        Self {
            storage,
            collection: collection.to_string(),
            name: name.to_string(),
            opts: MergeOptions::default(),
            _marker: PhantomData,
        }
    }

    /// Replace the merge flags.
    pub fn with_options(mut self, opts: MergeOptions) -> Self {
        self.opts = opts;
        self
    }

    /// Current merge flags.
    pub fn options(&self) -> MergeOptions {
        self.opts
    }

    /// Entry name.
    pub fn name(&self) -> &str {
        &self.name
    }

    fn field_path(&self, field: &str) -> String {
        if self.opts.jsonfy {
            field.to_string()
        } else {
            field.to_lowercase()
        }
    }

    fn decode(&self, raw: Value) -> Result<T> {
        Ok(serde_json::from_value(raw)?)
    }

    /// Overwrite the entry for `pool`.
    pub async fn save(&self, pool: &str, value: &T) -> Result<()> {
        let raw = serde_json::to_value(value)?;
        self.storage
            .put_entry(&self.collection, &self.name, pool, raw)
            .await
    }

    /// Overwrite the base entry.
    pub async fn save_base(&self, value: &T) -> Result<()> {
        self.save("", value).await
    }

    /// Merge `partial` into the stored entry for `pool` (creating it if
    /// needed). Inherited flags are left untouched. Pool entries keep empty
    /// map values so they still remove the key from the base on load.
    pub async fn save_merge(&self, pool: &str, partial: &T) -> Result<()> {
        let mut previous = match self
            .storage
            .get_entry(&self.collection, &self.name, pool)
            .await?
        {
            Some(raw) => self.decode(raw)?,
            None => T::default(),
        };
        let opts = MergeOptions {
            set_inherited: false,
            allow_map_empty: self.opts.allow_map_empty || !pool.is_empty(),
            ..self.opts
        };
        previous.merge_from(partial, &opts);
        self.save(pool, &previous).await
    }

    /// Write one field of the entry for `pool`, creating the entry if needed.
    pub async fn set_field(&self, pool: &str, field: &str, value: Value) -> Result<()> {
        self.storage
            .set_field(
                &self.collection,
                &self.name,
                pool,
                &self.field_path(field),
                value,
            )
            .await
    }

    /// Write one field only if it is absent or the empty string. Returns
    /// whether this call performed the write.
    pub async fn set_field_atomic(&self, pool: &str, field: &str, value: Value) -> Result<bool> {
        self.storage
            .set_field_if_empty(
                &self.collection,
                &self.name,
                pool,
                &self.field_path(field),
                value,
            )
            .await
    }

    /// Whether an entry exists for `pool`.
    pub async fn has_entry(&self, pool: &str) -> Result<bool> {
        Ok(self
            .storage
            .get_entry(&self.collection, &self.name, pool)
            .await?
            .is_some())
    }

    /// Effective value for `pool`: base merged with the pool entry.
    pub async fn load(&self, pool: &str) -> Result<T> {
        let (_, value) = self.load_with_base(pool).await?;
        Ok(value)
    }

    /// Raw base entry (default when absent).
    pub async fn load_base(&self) -> Result<T> {
        self.load("").await
    }

    /// Base entry and effective value for `pool`.
    pub async fn load_with_base(&self, pool: &str) -> Result<(T, T)> {
        let base = match self
            .storage
            .get_entry(&self.collection, &self.name, "")
            .await?
        {
            Some(raw) => self.decode(raw)?,
            None => T::default(),
        };
        if pool.is_empty() {
            let value = base.clone();
            return Ok((base, value));
        }
        let pool_value = match self
            .storage
            .get_entry(&self.collection, &self.name, pool)
            .await?
        {
            Some(raw) => self.decode(raw)?,
            None => T::default(),
        };
        let mut merged = base.clone();
        let opts = MergeOptions {
            set_inherited: true,
            ..self.opts
        };
        merged.merge_from(&pool_value, &opts);
        Ok((base, merged))
    }

    /// Every entry, each pool merged over the base. The base is included
    /// under `""`.
    pub async fn load_all(&self) -> Result<BTreeMap<String, T>> {
        self.load_pools_merge(&[], true, true).await
    }

    /// Entries for the given pools (all pools when empty), merged over the
    /// base.
    pub async fn load_pools(&self, pools: &[String]) -> Result<BTreeMap<String, T>> {
        self.load_pools_merge(pools, true, true).await
    }

    /// General form of [`load_all`](Self::load_all).
    ///
    /// With `merge = false` pool entries are returned raw. The base entry is
    /// included when `include_default` is set or when it exists.
    pub async fn load_pools_merge(
        &self,
        pools: &[String],
        merge: bool,
        include_default: bool,
    ) -> Result<BTreeMap<String, T>> {
        let entries = self.storage.list_entries(&self.collection, &self.name).await?;
        let mut base_raw = None;
        let mut pool_raw = Vec::new();
        for (pool, raw) in entries {
            if pool.is_empty() {
                base_raw = Some(raw);
            } else if pools.is_empty() || pools.contains(&pool) {
                pool_raw.push((pool, raw));
            }
        }
        let base = match &base_raw {
            Some(raw) => self.decode(raw.clone())?,
            None => T::default(),
        };
        let mut result = BTreeMap::new();
        if include_default || base_raw.is_some() {
            result.insert(String::new(), base.clone());
        }
        let opts = MergeOptions {
            set_inherited: true,
            ..self.opts
        };
        for (pool, raw) in pool_raw {
            let pool_value = self.decode(raw)?;
            if merge {
                let mut merged = base.clone();
                merged.merge_from(&pool_value, &opts);
                result.insert(pool, merged);
            } else {
                result.insert(pool, pool_value);
            }
        }
        Ok(result)
    }

    /// Delete the entry for `pool`. Returns whether it existed.
    pub async fn remove(&self, pool: &str) -> Result<bool> {
        self.storage
            .remove_entry(&self.collection, &self.name, pool)
            .await
    }

    /// Delete one field of the entry for `pool`. Missing entries are ignored.
    pub async fn remove_field(&self, pool: &str, field: &str) -> Result<()> {
        self.storage
            .remove_field(&self.collection, &self.name, pool, &self.field_path(field))
            .await
    }
}

/// Keep only the given pools (and the base) in a loaded map.
pub fn filter_pools<T>(all: &mut BTreeMap<String, T>, pools: &[String]) {
    if pools.is_empty() {
        return;
    }
    all.retain(|pool, _| pool.is_empty() || pools.contains(pool));
}

/// Names of every entry stored in `collection`.
pub async fn all_names(storage: &dyn ScopedConfigStorage, collection: &str) -> Result<Vec<String>> {
    storage.list_names(collection).await
}

/// Read a dotted path out of a JSON document.
pub(crate) fn json_get<'a>(doc: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(doc, |cur, key| cur.get(key))
}

/// Write a dotted path into a JSON document, creating objects on the way.
pub(crate) fn json_set(doc: &mut Value, path: &str, value: Value) {
    let keys: Vec<&str> = path.split('.').collect();
    let Some((last, parents)) = keys.split_last() else {
        return;
    };
    let mut cur = doc;
    for key in parents {
        if !cur.is_object() {
            *cur = Value::Object(Default::default());
        }
        cur = match cur {
            Value::Object(map) => map
                .entry(key.to_string())
                .or_insert_with(|| Value::Object(Default::default())),
            _ => return,
        };
    }
    if !cur.is_object() {
        *cur = Value::Object(Default::default());
    }
    if let Value::Object(map) = cur {
        map.insert(last.to_string(), value);
    }
}

/// Delete a dotted path from a JSON document.
pub(crate) fn json_remove(doc: &mut Value, path: &str) {
    let (parent, last) = match path.rsplit_once('.') {
        Some((parent, last)) => (Some(parent), last),
        None => (None, path),
    };
    let target = match parent {
        Some(p) => p.split('.').try_fold(&mut *doc, |cur, key| cur.get_mut(key)),
        None => Some(doc),
    };
    if let Some(Value::Object(map)) = target {
        map.remove(last);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    use crate::storage::memory::MemoryStorage;

    #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
    struct Inner {
        #[serde(default)]
        labels: BTreeMap<String, String>,
        #[serde(default)]
        tags: Vec<String>,
    }

    #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
    struct Sample {
        #[serde(default)]
        name: String,
        #[serde(default)]
        limit: i64,
        #[serde(default)]
        flag: Option<bool>,
        #[serde(default)]
        flag_inherited: bool,
        #[serde(default)]
        inner: Inner,
    }

    impl Merge for Inner {
        fn is_empty_value(&self, opts: &MergeOptions) -> bool {
            !opts.allow_empty && *self == Inner::default()
        }

        fn merge_from(&mut self, over: &Self, opts: &MergeOptions) -> bool {
            let a = merge_field(&mut self.labels, &over.labels, opts);
            let b = merge_field(&mut self.tags, &over.tags, opts);
            a || b
        }
    }

    impl Merge for Sample {
        fn is_empty_value(&self, opts: &MergeOptions) -> bool {
            !opts.allow_empty && *self == Sample::default()
        }

        fn merge_from(&mut self, over: &Self, opts: &MergeOptions) -> bool {
            let name = merge_field(&mut self.name, &over.name, opts);
            let limit = merge_field(&mut self.limit, &over.limit, opts);
            let flag = merge_field(&mut self.flag, &over.flag, opts);
            if opts.set_inherited {
                self.flag_inherited = !flag;
            }
            let inner = merge_field(&mut self.inner, &over.inner, opts);
            name || limit || flag || inner
        }
    }

    fn sample_config(storage: Arc<MemoryStorage>) -> ScopedConfig<Sample> {
        ScopedConfig::new(storage, "samples")
    }

    #[tokio::test]
    async fn test_load_merges_pool_over_base() {
        let storage = Arc::new(MemoryStorage::new());
        let conf = sample_config(storage);
        let mut base = Sample {
            name: "base".into(),
            limit: 10,
            flag: Some(true),
            ..Default::default()
        };
        base.inner.labels.insert("a".into(), "b".into());
        base.inner.labels.insert("c".into(), "d".into());
        conf.save_base(&base).await.unwrap();

        let mut pool = Sample {
            limit: 20,
            ..Default::default()
        };
        pool.inner.labels.insert("a".into(), "".into());
        pool.inner.labels.insert("e".into(), "f".into());
        conf.save("p1", &pool).await.unwrap();

        let loaded = conf.load("p1").await.unwrap();
        assert_eq!(loaded.name, "base");
        assert_eq!(loaded.limit, 20);
        assert_eq!(loaded.flag, Some(true));
        assert!(loaded.flag_inherited);
        let keys: Vec<_> = loaded.inner.labels.keys().cloned().collect();
        assert_eq!(keys, vec!["c", "e"]);

        let base_loaded = conf.load("").await.unwrap();
        assert_eq!(base_loaded, base);
    }

    #[tokio::test]
    async fn test_allow_map_empty_keeps_empty_values() {
        let storage = Arc::new(MemoryStorage::new());
        let conf = sample_config(storage).with_options(MergeOptions {
            allow_map_empty: true,
            ..Default::default()
        });
        let mut base = Sample::default();
        base.inner.labels.insert("a".into(), "b".into());
        conf.save_base(&base).await.unwrap();
        let mut pool = Sample::default();
        pool.inner.labels.insert("a".into(), "".into());
        conf.save("p1", &pool).await.unwrap();

        let loaded = conf.load("p1").await.unwrap();
        assert_eq!(loaded.inner.labels.get("a").map(String::as_str), Some(""));
    }

    #[tokio::test]
    async fn test_slice_add_appends() {
        let storage = Arc::new(MemoryStorage::new());
        let conf = sample_config(storage).with_options(MergeOptions {
            slice_add: true,
            ..Default::default()
        });
        let mut base = Sample::default();
        base.inner.tags = vec!["A=1".into(), "B=2".into()];
        conf.save_base(&base).await.unwrap();
        let mut pool = Sample::default();
        pool.inner.tags = vec!["C=3".into()];
        conf.save("p1", &pool).await.unwrap();

        let loaded = conf.load("p1").await.unwrap();
        assert_eq!(loaded.inner.tags, vec!["A=1", "B=2", "C=3"]);
    }

    #[tokio::test]
    async fn test_save_merge_keeps_previous_fields() {
        let storage = Arc::new(MemoryStorage::new());
        let conf = sample_config(storage);
        conf.save(
            "p1",
            &Sample {
                name: "one".into(),
                limit: 3,
                ..Default::default()
            },
        )
        .await
        .unwrap();
        conf.save_merge(
            "p1",
            &Sample {
                flag: Some(false),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        let all = conf.load_pools_merge(&[], false, false).await.unwrap();
        let stored = &all["p1"];
        assert_eq!(stored.name, "one");
        assert_eq!(stored.limit, 3);
        assert_eq!(stored.flag, Some(false));
        assert!(!stored.flag_inherited);
        assert!(!all.contains_key(""));
    }

    #[tokio::test]
    async fn test_set_field_atomic_single_winner() {
        let storage = Arc::new(MemoryStorage::new());
        let conf = sample_config(storage);
        assert!(conf.set_field_atomic("", "name", json!("first")).await.unwrap());
        assert!(!conf.set_field_atomic("", "name", json!("second")).await.unwrap());
        assert_eq!(conf.load_base().await.unwrap().name, "first");

        conf.set_field("", "name", json!("")).await.unwrap();
        assert!(conf.set_field_atomic("", "name", json!("third")).await.unwrap());
        assert_eq!(conf.load_base().await.unwrap().name, "third");
    }

    #[tokio::test]
    async fn test_remove_field_and_remove() {
        let storage = Arc::new(MemoryStorage::new());
        let conf = sample_config(storage);
        conf.save(
            "p1",
            &Sample {
                name: "x".into(),
                limit: 4,
                ..Default::default()
            },
        )
        .await
        .unwrap();
        conf.remove_field("p1", "LIMIT").await.unwrap();
        let loaded = conf.load("p1").await.unwrap();
        assert_eq!(loaded.limit, 0);
        assert_eq!(loaded.name, "x");

        assert!(conf.remove("p1").await.unwrap());
        assert!(!conf.remove("p1").await.unwrap());
        assert!(!conf.has_entry("p1").await.unwrap());
    }

    #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
    #[serde(rename_all = "camelCase")]
    struct Retry {
        #[serde(default)]
        max_retries: i64,
        #[serde(default)]
        backoff: i64,
    }

    impl Merge for Retry {
        fn is_empty_value(&self, opts: &MergeOptions) -> bool {
            !opts.allow_empty && *self == Retry::default()
        }

        fn merge_from(&mut self, over: &Self, opts: &MergeOptions) -> bool {
            let a = merge_field(&mut self.max_retries, &over.max_retries, opts);
            let b = merge_field(&mut self.backoff, &over.backoff, opts);
            a || b
        }
    }

    #[tokio::test]
    async fn test_remove_field_keeps_case_for_jsonfy() {
        let storage = Arc::new(MemoryStorage::new());
        let conf: ScopedConfig<Retry> =
            ScopedConfig::new(storage, "retries").with_options(MergeOptions {
                jsonfy: true,
                ..Default::default()
            });
        conf.save(
            "p1",
            &Retry {
                max_retries: 5,
                backoff: 2,
            },
        )
        .await
        .unwrap();

        conf.remove_field("p1", "maxRetries").await.unwrap();
        let loaded = conf.load("p1").await.unwrap();
        assert_eq!(loaded.max_retries, 0);
        assert_eq!(loaded.backoff, 2);
    }

    #[tokio::test]
    async fn test_load_all_includes_base() {
        let storage = Arc::new(MemoryStorage::new());
        let conf = sample_config(storage);
        conf.save("p1", &Sample::default()).await.unwrap();
        conf.save("p2", &Sample::default()).await.unwrap();
        let mut all = conf.load_all().await.unwrap();
        assert_eq!(all.len(), 3);
        filter_pools(&mut all, &["p2".to_string()]);
        let pools: Vec<_> = all.keys().cloned().collect();
        assert_eq!(pools, vec!["", "p2"]);
    }

    #[test]
    fn test_json_path_helpers() {
        let mut doc = json!({});
        json_set(&mut doc, "config.env", json!(["A=1"]));
        assert_eq!(json_get(&doc, "config.env"), Some(&json!(["A=1"])));
        json_remove(&mut doc, "config.env");
        assert_eq!(doc, json!({"config": {}}));
    }
}
