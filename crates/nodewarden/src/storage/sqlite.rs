// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! SQLite storage backend.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::sqlite::{SqlitePoolOptions, SqliteRow};
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};

use super::{
    ContainerStorage, EventStorage, ImageStorage, MachineStorage, NodeStatusStorage, NodeStorage,
    ScopedConfigStorage, StaleQuery, chrono_duration, from_millis, to_millis,
};
use crate::container::{Container, ContainerStatus};
use crate::error::{Error, Result};
use crate::events::{Event, EventFilter, Target, TargetKind};
use crate::iaas::Machine;
use crate::node::{HealingData, MAX_NODE_CHECKS, Node, NodeChecks, NodeStatusData};

pub(crate) static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations/sqlite");

/// Storage backend on a SQLite database.
#[derive(Clone)]
pub struct SqliteStorage {
    pool: SqlitePool,
}

impl SqliteStorage {
    /// Wrap an existing, already migrated pool.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Connect to a sqlx connection string and run migrations.
    pub async fn connect(url: &str) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(url)
            .await?;
        MIGRATOR.run(&pool).await?;
        Ok(Self { pool })
    }

    /// Open (creating if needed) a database file and run migrations.
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| {
                Error::Other(format!("Failed to create directory {:?}: {}", parent, e))
            })?;
        }
        Self::connect(&format!("sqlite:{}?mode=rwc", path.to_string_lossy())).await
    }

    /// Underlying pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

/// `config.env` becomes `$."config"."env"`.
fn json_path(path: &str) -> String {
    let mut out = String::from("$");
    for key in path.split('.') {
        out.push_str(".\"");
        out.push_str(&key.replace('"', "\\\""));
        out.push('"');
    }
    out
}

fn node_from_row(row: &SqliteRow) -> Result<Node> {
    let metadata: String = row.try_get("metadata")?;
    let creation_status: Option<String> = row.try_get("creation_status")?;
    let locked_until: i64 = row.try_get("locked_until")?;
    let is_failure: bool = row.try_get("is_failure")?;
    Ok(Node {
        address: row.try_get("address")?,
        metadata: serde_json::from_str::<BTreeMap<String, String>>(&metadata)?,
        creation_status: creation_status
            .filter(|s| !s.is_empty())
            .map(|s| s.parse().map_err(Error::Other))
            .transpose()?,
        healing: HealingData {
            locked_until: (locked_until > 0).then(|| from_millis(locked_until)),
            is_failure,
        },
    })
}

fn container_from_row(row: &SqliteRow) -> Result<Container> {
    let data: String = row.try_get("data")?;
    Ok(serde_json::from_str(&data)?)
}

fn event_from_row(row: &SqliteRow) -> Result<Event> {
    let target_kind: String = row.try_get("target_kind")?;
    let end_time: Option<i64> = row.try_get("end_time")?;
    let custom_data: String = row.try_get("custom_data")?;
    let end_custom_data: String = row.try_get("end_custom_data")?;
    Ok(Event {
        id: row.try_get("id")?,
        target: Target {
            kind: target_kind.parse().map_err(Error::Other)?,
            value: row.try_get("target_value")?,
        },
        kind: row.try_get("kind")?,
        start_time: from_millis(row.try_get("start_time")?),
        end_time: end_time.map(from_millis),
        custom_data: serde_json::from_str(&custom_data)?,
        end_custom_data: serde_json::from_str(&end_custom_data)?,
        error: row.try_get("error")?,
        successful: row.try_get("successful")?,
    })
}

fn node_status_from_row(row: &SqliteRow) -> Result<NodeStatusData> {
    let last_success: Option<i64> = row.try_get("last_success")?;
    let checks: String = row.try_get("checks")?;
    Ok(NodeStatusData {
        address: row.try_get("address")?,
        last_update: from_millis(row.try_get("last_update")?),
        last_success: last_success.map(from_millis),
        checks: serde_json::from_str(&checks)?,
    })
}

fn machine_from_row(row: &SqliteRow) -> Result<Machine> {
    let data: String = row.try_get("data")?;
    Ok(serde_json::from_str(&data)?)
}

#[async_trait]
impl NodeStorage for SqliteStorage {
    async fn store_node(&self, node: &Node) -> Result<()> {
        let result = sqlx::query(
            r#"
            INSERT INTO nodes (address, metadata, creation_status, locked_until, is_failure)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(&node.address)
        .bind(serde_json::to_string(&node.metadata)?)
        .bind(node.creation_status.map(|s| s.as_str()))
        .bind(node.healing.locked_until.map(to_millis).unwrap_or(0))
        .bind(node.healing.is_failure)
        .execute(&self.pool)
        .await;
        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => {
                Err(Error::DuplicateNode(node.address.clone()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn retrieve_nodes(&self) -> Result<Vec<Node>> {
        let rows = sqlx::query("SELECT * FROM nodes ORDER BY address")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(node_from_row).collect()
    }

    async fn retrieve_node(&self, address: &str) -> Result<Node> {
        let row = sqlx::query("SELECT * FROM nodes WHERE address = ?")
            .bind(address)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| Error::NodeNotFound(address.to_string()))?;
        node_from_row(&row)
    }

    async fn update_node(&self, node: &Node) -> Result<()> {
        let result = sqlx::query(
            "UPDATE nodes SET metadata = ?, creation_status = ? WHERE address = ?",
        )
        .bind(serde_json::to_string(&node.metadata)?)
        .bind(node.creation_status.map(|s| s.as_str()))
        .bind(&node.address)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(Error::NodeNotFound(node.address.clone()));
        }
        Ok(())
    }

    async fn remove_node(&self, address: &str) -> Result<()> {
        let result = sqlx::query("DELETE FROM nodes WHERE address = ?")
            .bind(address)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(Error::NodeNotFound(address.to_string()));
        }
        Ok(())
    }

    async fn lock_node_for_healing(
        &self,
        address: &str,
        is_failure: bool,
        timeout: Duration,
    ) -> Result<bool> {
        let now = Utc::now();
        let result = sqlx::query(
            r#"
            UPDATE nodes SET locked_until = ?, is_failure = ?
            WHERE address = ? AND locked_until <= ?
            "#,
        )
        .bind(to_millis(now + chrono_duration(timeout)))
        .bind(is_failure)
        .bind(address)
        .bind(to_millis(now))
        .execute(&self.pool)
        .await?;
        if result.rows_affected() > 0 {
            return Ok(true);
        }
        // Distinguish a held lock from a missing node.
        self.retrieve_node(address).await?;
        Ok(false)
    }

    async fn extend_node_lock(&self, address: &str, timeout: Duration) -> Result<()> {
        sqlx::query("UPDATE nodes SET locked_until = ? WHERE address = ?")
            .bind(to_millis(Utc::now() + chrono_duration(timeout)))
            .bind(address)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn unlock_node(&self, address: &str) -> Result<()> {
        sqlx::query("UPDATE nodes SET locked_until = 0, is_failure = 0 WHERE address = ?")
            .bind(address)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl ContainerStorage for SqliteStorage {
    async fn store_container(&self, container: &Container) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO containers
                (id, name, app_name, process_name, host_addr, host_port, status,
                 last_success_status_update, data)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                app_name = excluded.app_name,
                process_name = excluded.process_name,
                host_addr = excluded.host_addr,
                host_port = excluded.host_port,
                status = excluded.status,
                last_success_status_update = excluded.last_success_status_update,
                data = excluded.data
            "#,
        )
        .bind(&container.id)
        .bind(&container.name)
        .bind(&container.app_name)
        .bind(&container.process_name)
        .bind(&container.host_addr)
        .bind(&container.host_port)
        .bind(container.status.as_str())
        .bind(
            container
                .last_success_status_update
                .map(to_millis)
                .unwrap_or(0),
        )
        .bind(serde_json::to_string(container)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_container(&self, id_or_name: &str) -> Result<Container> {
        let row = sqlx::query(
            "SELECT data FROM containers WHERE id = ? OR name = ? ORDER BY id = ? DESC LIMIT 1",
        )
        .bind(id_or_name)
        .bind(id_or_name)
        .bind(id_or_name)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| Error::UnitNotFound(id_or_name.to_string()))?;
        container_from_row(&row)
    }

    async fn remove_container(&self, id: &str) -> Result<()> {
        let result = sqlx::query("DELETE FROM containers WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(Error::UnitNotFound(id.to_string()));
        }
        Ok(())
    }

    async fn list_containers_by_host(&self, host_addr: &str) -> Result<Vec<Container>> {
        let rows = sqlx::query("SELECT data FROM containers WHERE host_addr = ? ORDER BY id")
            .bind(host_addr)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(container_from_row).collect()
    }

    async fn list_all_containers(&self) -> Result<Vec<Container>> {
        let rows = sqlx::query("SELECT data FROM containers ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(container_from_row).collect()
    }

    async fn list_unresponsive_containers(&self, cutoff: DateTime<Utc>) -> Result<Vec<Container>> {
        let rows = sqlx::query(
            r#"
            SELECT data FROM containers
            WHERE id != '' AND app_name != ''
              AND last_success_status_update < ?
              AND (host_port != '' OR process_name != '')
              AND status NOT IN ('building', 'asleep')
            ORDER BY id
            "#,
        )
        .bind(to_millis(cutoff))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(container_from_row).collect()
    }

    async fn set_container_status(
        &self,
        id: &str,
        status: ContainerStatus,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let mut container = self.get_container(id).await?;
        if container.status == ContainerStatus::Building {
            return Ok(false);
        }
        container.set_status(status, now);
        // The status guard keeps a concurrent build from being overwritten.
        let result = sqlx::query(
            r#"
            UPDATE containers
            SET status = ?, last_success_status_update = ?, data = ?
            WHERE id = ? AND status != 'building'
            "#,
        )
        .bind(container.status.as_str())
        .bind(
            container
                .last_success_status_update
                .map(to_millis)
                .unwrap_or(0),
        )
        .bind(serde_json::to_string(&container)?)
        .bind(&container.id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }
}

#[async_trait]
impl NodeStatusStorage for SqliteStorage {
    async fn push_node_status(
        &self,
        address: &str,
        now: DateTime<Utc>,
        success: bool,
        checks: NodeChecks,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        let existing = sqlx::query("SELECT * FROM node_status WHERE address = ?")
            .bind(address)
            .fetch_optional(&mut *tx)
            .await?;
        let mut status = match existing {
            Some(row) => node_status_from_row(&row)?,
            None => NodeStatusData {
                address: address.to_string(),
                last_update: now,
                last_success: None,
                checks: vec![],
            },
        };
        status.last_update = now;
        if success {
            status.last_success = Some(now);
        }
        status.checks.push(checks);
        if status.checks.len() > MAX_NODE_CHECKS {
            let excess = status.checks.len() - MAX_NODE_CHECKS;
            status.checks.drain(..excess);
        }
        sqlx::query(
            r#"
            INSERT INTO node_status (address, last_update, last_success, checks)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(address) DO UPDATE SET
                last_update = excluded.last_update,
                last_success = excluded.last_success,
                checks = excluded.checks
            "#,
        )
        .bind(address)
        .bind(to_millis(status.last_update))
        .bind(status.last_success.map(to_millis))
        .bind(serde_json::to_string(&status.checks)?)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn get_node_status(&self, address: &str) -> Result<Option<NodeStatusData>> {
        let row = sqlx::query("SELECT * FROM node_status WHERE address = ?")
            .bind(address)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(node_status_from_row).transpose()
    }

    async fn find_stale_node_status(
        &self,
        addresses: &[String],
        query: &StaleQuery,
    ) -> Result<Vec<NodeStatusData>> {
        if addresses.is_empty() || query.is_empty() {
            return Ok(vec![]);
        }
        let rows = sqlx::query(
            r#"
            SELECT * FROM node_status
            WHERE address IN (SELECT value FROM json_each(?))
            ORDER BY address
            "#,
        )
        .bind(serde_json::to_string(addresses)?)
        .fetch_all(&self.pool)
        .await?;
        let mut found = Vec::new();
        for row in &rows {
            let status = node_status_from_row(row)?;
            if query.matches(&status) {
                found.push(status);
            }
        }
        Ok(found)
    }

    async fn remove_node_status(&self, address: &str) -> Result<()> {
        sqlx::query("DELETE FROM node_status WHERE address = ?")
            .bind(address)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl ScopedConfigStorage for SqliteStorage {
    async fn get_entry(&self, collection: &str, name: &str, pool: &str) -> Result<Option<Value>> {
        let val: Option<String> = sqlx::query_scalar(
            "SELECT val FROM scoped_configs WHERE collection = ? AND name = ? AND pool = ?",
        )
        .bind(collection)
        .bind(name)
        .bind(pool)
        .fetch_optional(&self.pool)
        .await?;
        Ok(val.map(|v| serde_json::from_str(&v)).transpose()?)
    }

    async fn list_entries(&self, collection: &str, name: &str) -> Result<Vec<(String, Value)>> {
        let rows = sqlx::query(
            "SELECT pool, val FROM scoped_configs WHERE collection = ? AND name = ? ORDER BY pool",
        )
        .bind(collection)
        .bind(name)
        .fetch_all(&self.pool)
        .await?;
        let mut entries = Vec::with_capacity(rows.len());
        for row in rows {
            let val: String = row.try_get("val")?;
            entries.push((row.try_get("pool")?, serde_json::from_str(&val)?));
        }
        Ok(entries)
    }

    async fn list_names(&self, collection: &str) -> Result<Vec<String>> {
        Ok(sqlx::query_scalar(
            "SELECT DISTINCT name FROM scoped_configs WHERE collection = ? ORDER BY name",
        )
        .bind(collection)
        .fetch_all(&self.pool)
        .await?)
    }

    async fn put_entry(
        &self,
        collection: &str,
        name: &str,
        pool: &str,
        value: Value,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO scoped_configs (collection, name, pool, val) VALUES (?, ?, ?, ?)
            ON CONFLICT(collection, name, pool) DO UPDATE SET val = excluded.val
            "#,
        )
        .bind(collection)
        .bind(name)
        .bind(pool)
        .bind(value.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn set_field(
        &self,
        collection: &str,
        name: &str,
        pool: &str,
        path: &str,
        value: Value,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO scoped_configs (collection, name, pool, val)
            VALUES (?1, ?2, ?3, json_set('{}', ?4, json(?5)))
            ON CONFLICT(collection, name, pool) DO UPDATE SET val = json_set(val, ?4, json(?5))
            "#,
        )
        .bind(collection)
        .bind(name)
        .bind(pool)
        .bind(json_path(path))
        .bind(value.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn set_field_if_empty(
        &self,
        collection: &str,
        name: &str,
        pool: &str,
        path: &str,
        value: Value,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO scoped_configs (collection, name, pool, val)
            VALUES (?1, ?2, ?3, json_set('{}', ?4, json(?5)))
            ON CONFLICT(collection, name, pool) DO UPDATE SET val = json_set(val, ?4, json(?5))
            WHERE json_extract(val, ?4) IS NULL OR json_extract(val, ?4) = ''
            "#,
        )
        .bind(collection)
        .bind(name)
        .bind(pool)
        .bind(json_path(path))
        .bind(value.to_string())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn remove_entry(&self, collection: &str, name: &str, pool: &str) -> Result<bool> {
        let result = sqlx::query(
            "DELETE FROM scoped_configs WHERE collection = ? AND name = ? AND pool = ?",
        )
        .bind(collection)
        .bind(name)
        .bind(pool)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn remove_field(
        &self,
        collection: &str,
        name: &str,
        pool: &str,
        path: &str,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE scoped_configs SET val = json_remove(val, ?)
            WHERE collection = ? AND name = ? AND pool = ?
            "#,
        )
        .bind(json_path(path))
        .bind(collection)
        .bind(name)
        .bind(pool)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl EventStorage for SqliteStorage {
    async fn insert_event(&self, event: &Event) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO events
                (id, target_kind, target_value, kind, start_time, end_time, running,
                 custom_data, end_custom_data, error, successful)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&event.id)
        .bind(event.target.kind.as_str())
        .bind(&event.target.value)
        .bind(&event.kind)
        .bind(to_millis(event.start_time))
        .bind(event.end_time.map(to_millis))
        .bind(event.is_running())
        .bind(event.custom_data.to_string())
        .bind(event.end_custom_data.to_string())
        .bind(&event.error)
        .bind(event.successful)
        .execute(&self.pool)
        .await;
        match result {
            Ok(_) => Ok(true),
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn running_event(&self, target: &Target) -> Result<Option<Event>> {
        let row = sqlx::query(
            "SELECT * FROM events WHERE target_kind = ? AND target_value = ? AND running = 1",
        )
        .bind(target.kind.as_str())
        .bind(&target.value)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(event_from_row).transpose()
    }

    async fn count_events_since(
        &self,
        target_kind: TargetKind,
        target_value: Option<&str>,
        kind: &str,
        since: DateTime<Utc>,
    ) -> Result<u64> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM events
            WHERE target_kind = ?1 AND kind = ?2 AND start_time >= ?3
              AND (?4 IS NULL OR target_value = ?4)
            "#,
        )
        .bind(target_kind.as_str())
        .bind(kind)
        .bind(to_millis(since))
        .bind(target_value)
        .fetch_one(&self.pool)
        .await?;
        Ok(count.max(0) as u64)
    }

    async fn finish_event(&self, event: &Event) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE events
            SET end_time = ?, running = ?, end_custom_data = ?, error = ?, successful = ?
            WHERE id = ?
            "#,
        )
        .bind(event.end_time.map(to_millis))
        .bind(event.is_running())
        .bind(event.end_custom_data.to_string())
        .bind(&event.error)
        .bind(event.successful)
        .bind(&event.id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn remove_event(&self, id: &str) -> Result<()> {
        sqlx::query("DELETE FROM events WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn list_events(&self, filter: &EventFilter) -> Result<Vec<Event>> {
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new("SELECT * FROM events WHERE 1 = 1");
        if let Some(target) = &filter.target {
            qb.push(" AND target_kind = ")
                .push_bind(target.kind.as_str())
                .push(" AND target_value = ")
                .push_bind(target.value.clone());
        }
        if let Some(kind) = filter.target_kind {
            qb.push(" AND target_kind = ").push_bind(kind.as_str());
        }
        if let Some(kind) = &filter.kind {
            qb.push(" AND kind = ").push_bind(kind.clone());
        }
        if let Some(running) = filter.running {
            qb.push(" AND running = ").push_bind(running);
        }
        qb.push(" ORDER BY start_time DESC");
        if filter.limit > 0 {
            qb.push(" LIMIT ").push_bind(filter.limit as i64);
        }
        let rows = qb.build().fetch_all(&self.pool).await?;
        rows.iter().map(event_from_row).collect()
    }
}

#[async_trait]
impl ImageStorage for SqliteStorage {
    async fn store_image_digest(&self, image: &str, digest: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO image_digests (image, digest, updated_at) VALUES (?, ?, ?)
            ON CONFLICT(image) DO UPDATE SET
                digest = excluded.digest,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(image)
        .bind(digest)
        .bind(to_millis(Utc::now()))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn image_digest(&self, image: &str) -> Result<Option<String>> {
        Ok(
            sqlx::query_scalar("SELECT digest FROM image_digests WHERE image = ?")
                .bind(image)
                .fetch_optional(&self.pool)
                .await?,
        )
    }
}

#[async_trait]
impl MachineStorage for SqliteStorage {
    async fn insert_machine(&self, machine: &Machine) -> Result<()> {
        sqlx::query("INSERT INTO machines (id, iaas, address, data) VALUES (?, ?, ?, ?)")
            .bind(&machine.id)
            .bind(&machine.iaas)
            .bind(&machine.address)
            .bind(serde_json::to_string(machine)?)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn find_machine_by_id(&self, id: &str) -> Result<Option<Machine>> {
        let row = sqlx::query("SELECT data FROM machines WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(machine_from_row).transpose()
    }

    async fn find_machine_by_address(&self, address: &str) -> Result<Option<Machine>> {
        let row = sqlx::query("SELECT data FROM machines WHERE address = ? LIMIT 1")
            .bind(address)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(machine_from_row).transpose()
    }

    async fn list_machines(&self) -> Result<Vec<Machine>> {
        let rows = sqlx::query("SELECT data FROM machines ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(machine_from_row).collect()
    }

    async fn remove_machine(&self, id: &str) -> Result<()> {
        sqlx::query("DELETE FROM machines WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use uuid::Uuid;

    async fn test_pool() -> SqlitePool {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .expect("Failed to create in-memory SQLite pool");

        MIGRATOR.run(&pool).await.expect("Failed to run migrations");

        pool
    }

    fn running_event(target: Target, start: DateTime<Utc>) -> Event {
        Event {
            id: Uuid::new_v4().to_string(),
            target,
            kind: "healer".into(),
            start_time: start,
            end_time: None,
            custom_data: json!({"reason": "test"}),
            end_custom_data: Value::Null,
            error: String::new(),
            successful: false,
        }
    }

    #[tokio::test]
    async fn test_node_crud_and_lock() {
        let storage = SqliteStorage::new(test_pool().await);
        let node = Node::new("http://n1:2375").with_metadata("pool", "p1");
        storage.store_node(&node).await.unwrap();
        assert!(matches!(
            storage.store_node(&node).await.unwrap_err(),
            Error::DuplicateNode(_)
        ));

        assert!(
            storage
                .lock_node_for_healing("http://n1:2375", true, Duration::from_secs(60))
                .await
                .unwrap()
        );
        assert!(
            !storage
                .lock_node_for_healing("http://n1:2375", true, Duration::from_secs(60))
                .await
                .unwrap()
        );
        let locked = storage.retrieve_node("http://n1:2375").await.unwrap();
        assert!(locked.healing.is_failure);
        assert!(locked.is_healing_at(Utc::now()));

        storage.unlock_node("http://n1:2375").await.unwrap();
        let unlocked = storage.retrieve_node("http://n1:2375").await.unwrap();
        assert_eq!(unlocked.healing, HealingData::default());
        assert_eq!(unlocked.pool(), "p1");

        assert!(matches!(
            storage
                .lock_node_for_healing("http://missing:2375", false, Duration::from_secs(1))
                .await
                .unwrap_err(),
            Error::NodeNotFound(_)
        ));

        storage.remove_node("http://n1:2375").await.unwrap();
        assert!(storage.retrieve_nodes().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unresponsive_containers_query() {
        let storage = SqliteStorage::new(test_pool().await);
        let now = Utc::now();
        let old = now - chrono::Duration::minutes(10);
        let make = |id: &str, status: ContainerStatus, port: &str, success| Container {
            id: id.into(),
            name: format!("name-{}", id),
            app_name: "myapp".into(),
            host_addr: "10.0.0.1".into(),
            host_port: port.into(),
            status,
            last_success_status_update: success,
            created_at: old,
            ..Default::default()
        };
        storage
            .store_container(&make("c1", ContainerStatus::Started, "8080", Some(old)))
            .await
            .unwrap();
        storage
            .store_container(&make("c2", ContainerStatus::Started, "8080", Some(now)))
            .await
            .unwrap();
        storage
            .store_container(&make("c3", ContainerStatus::Building, "8080", Some(old)))
            .await
            .unwrap();
        storage
            .store_container(&make("c4", ContainerStatus::Started, "", None))
            .await
            .unwrap();
        storage
            .store_container(&make("c5", ContainerStatus::Error, "8080", None))
            .await
            .unwrap();

        let found = storage
            .list_unresponsive_containers(now - chrono::Duration::minutes(5))
            .await
            .unwrap();
        let ids: Vec<_> = found.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["c1", "c5"]);

        let by_name = storage.get_container("name-c2").await.unwrap();
        assert_eq!(by_name.id, "c2");
    }

    #[tokio::test]
    async fn test_set_container_status_respects_building() {
        let storage = SqliteStorage::new(test_pool().await);
        let mut c = Container {
            id: "c1".into(),
            name: "n1".into(),
            app_name: "a".into(),
            status: ContainerStatus::Building,
            created_at: Utc::now(),
            ..Default::default()
        };
        storage.store_container(&c).await.unwrap();
        assert!(
            !storage
                .set_container_status("c1", ContainerStatus::Started, Utc::now())
                .await
                .unwrap()
        );
        c.status = ContainerStatus::Starting;
        storage.store_container(&c).await.unwrap();
        assert!(
            storage
                .set_container_status("c1", ContainerStatus::Error, Utc::now())
                .await
                .unwrap()
        );
        let stored = storage.get_container("c1").await.unwrap();
        assert_eq!(stored.status, ContainerStatus::Error);
    }

    #[tokio::test]
    async fn test_scoped_field_writes() {
        let storage = SqliteStorage::new(test_pool().await);
        storage
            .set_field("coll", "bs", "", "config.env", json!(["A=1"]))
            .await
            .unwrap();
        let entry = storage.get_entry("coll", "bs", "").await.unwrap().unwrap();
        assert_eq!(entry, json!({"config": {"env": ["A=1"]}}));

        assert!(
            storage
                .set_field_if_empty("coll", "bs", "", "config.image", json!("img:v1"))
                .await
                .unwrap()
        );
        assert!(
            !storage
                .set_field_if_empty("coll", "bs", "", "config.image", json!("img:v2"))
                .await
                .unwrap()
        );
        assert!(
            !storage
                .set_field_if_empty("coll", "bs", "", "config.env", json!(["B=2"]))
                .await
                .unwrap()
        );
        storage
            .remove_field("coll", "bs", "", "config.env")
            .await
            .unwrap();
        let entry = storage.get_entry("coll", "bs", "").await.unwrap().unwrap();
        assert_eq!(entry, json!({"config": {"image": "img:v1"}}));

        storage
            .put_entry("coll", "other", "p1", json!({"x": 1}))
            .await
            .unwrap();
        assert_eq!(
            storage.list_names("coll").await.unwrap(),
            vec!["bs".to_string(), "other".to_string()]
        );
        assert!(storage.remove_entry("coll", "other", "p1").await.unwrap());
        assert!(!storage.remove_entry("coll", "other", "p1").await.unwrap());
    }

    #[tokio::test]
    async fn test_single_running_event_per_target() {
        let storage = SqliteStorage::new(test_pool().await);
        let target = Target {
            kind: TargetKind::Node,
            value: "http://n1:2375".into(),
        };
        let start = Utc::now();
        let mut first = running_event(target.clone(), start);
        assert!(storage.insert_event(&first).await.unwrap());
        assert!(
            !storage
                .insert_event(&running_event(target.clone(), start))
                .await
                .unwrap()
        );
        let running = storage.running_event(&target).await.unwrap().unwrap();
        assert_eq!(running.id, first.id);
        assert_eq!(running.custom_data, json!({"reason": "test"}));

        first.end_time = Some(Utc::now());
        first.successful = true;
        storage.finish_event(&first).await.unwrap();
        assert!(storage.running_event(&target).await.unwrap().is_none());
        assert!(
            storage
                .insert_event(&running_event(target.clone(), start))
                .await
                .unwrap()
        );

        let count = storage
            .count_events_since(
                TargetKind::Node,
                Some("http://n1:2375"),
                "healer",
                start - chrono::Duration::seconds(1),
            )
            .await
            .unwrap();
        assert_eq!(count, 2);
        let none = storage
            .count_events_since(TargetKind::Container, None, "healer", start)
            .await
            .unwrap();
        assert_eq!(none, 0);
    }

    #[tokio::test]
    async fn test_node_status_window() {
        let storage = SqliteStorage::new(test_pool().await);
        let start = Utc::now();
        for i in 0..12 {
            let now = start + chrono::Duration::seconds(i);
            storage
                .push_node_status("n1", now, i < 3, NodeChecks { time: now, checks: vec![] })
                .await
                .unwrap();
        }
        let status = storage.get_node_status("n1").await.unwrap().unwrap();
        assert_eq!(status.checks.len(), MAX_NODE_CHECKS);
        assert_eq!(
            status.last_success.map(to_millis),
            Some(to_millis(start + chrono::Duration::seconds(2)))
        );

        let stale = storage
            .find_stale_node_status(
                &["n1".to_string(), "n2".to_string()],
                &StaleQuery {
                    last_success_before: Some(start + chrono::Duration::seconds(5)),
                    last_update_before: None,
                },
            )
            .await
            .unwrap();
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].address, "n1");
    }
}
