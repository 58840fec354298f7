//! Broker-local queue of submodule tasks.
//!
//! Rows are created from committed discovery results, stamped with
//! `scan_started` when dispensed and deleted once their result is persisted
//! or the timeout sweep gives up on them.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use rusqlite::types::Value;
use rusqlite::{params, Connection, OptionalExtension, Row};
use scanbroker_core::derive::DerivedTask;
use scanbroker_core::model::Module;
use scanbroker_core::{EpochMs, LIST_SEPARATOR};

use super::pool::{Pool, PoolOptions};
use super::{id_list, insert_batched};

const SCHEMA: &str = include_str!("../../migrations/broker.sql");
const INSERT_COLUMNS: [&str; 11] = [
    "id_t_scan_scope",
    "id_t_discovery_service",
    "label",
    "target",
    "ip",
    "dns_name",
    "other_names",
    "protocol",
    "port",
    "service",
    "service_product",
];
const SELECT_COLUMNS: &str = "id, id_t_scan_scope, id_t_discovery_service, label, target, ip, \
     dns_name, other_names, protocol, port, service, service_product, scan_started";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmoduleTask {
    pub id: u64,
    pub scope_id: u64,
    /// Originating row in the scope store's `t_discovery_service`.
    pub service_id: i64,
    pub module: Module,
    pub target: String,
    pub ip: String,
    pub dns_name: String,
    pub other_names: Vec<String>,
    pub protocol: String,
    pub port: u16,
    pub service: String,
    pub service_product: String,
    pub scan_started: Option<EpochMs>,
}

fn task_from_row(r: &Row<'_>) -> rusqlite::Result<SubmoduleTask> {
    let label: String = r.get(3)?;
    let module = label.parse::<Module>().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(3, rusqlite::types::Type::Text, Box::new(e))
    })?;
    let other_names: String = r.get(7)?;
    Ok(SubmoduleTask {
        id: r.get::<_, i64>(0)? as u64,
        scope_id: r.get::<_, i64>(1)? as u64,
        service_id: r.get(2)?,
        module,
        target: r.get(4)?,
        ip: r.get(5)?,
        dns_name: r.get(6)?,
        other_names: split_list(&other_names),
        protocol: r.get(8)?,
        port: r.get::<_, i64>(9)? as u16,
        service: r.get(10)?,
        service_product: r.get(11)?,
        scan_started: r.get(12)?,
    })
}

fn split_list(joined: &str) -> Vec<String> {
    joined
        .split(LIST_SEPARATOR)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

#[derive(Clone)]
pub struct TaskDb {
    pool: Arc<Pool>,
}

impl TaskDb {
    pub fn open(path: &Path, opts: PoolOptions) -> Result<Self> {
        let pool = Pool::open(path, opts, SCHEMA).context("open broker task store")?;
        Ok(Self { pool })
    }

    pub fn close(&self) {
        self.pool.close();
    }

    /// Queues derived tasks. Tasks already queued for the same scope, service
    /// and module are ignored. Returns the number of new rows.
    pub async fn add(&self, scope_id: u64, tasks: Vec<DerivedTask>) -> Result<usize> {
        if tasks.is_empty() {
            return Ok(0);
        }
        self.pool
            .run(move |conn| {
                let rows: Vec<Vec<Value>> = tasks
                    .iter()
                    .map(|t| {
                        vec![
                            Value::Integer(scope_id as i64),
                            Value::Integer(t.service_id),
                            Value::Text(t.module.label().to_string()),
                            Value::Text(t.target.clone()),
                            Value::Text(t.ip.clone()),
                            Value::Text(t.dns_name.clone()),
                            Value::Text(t.other_names.join(LIST_SEPARATOR)),
                            Value::Text(t.protocol.clone()),
                            Value::Integer(t.port as i64),
                            Value::Text(t.service.clone()),
                            Value::Text(t.service_product.clone()),
                        ]
                    })
                    .collect();
                let tx = conn.transaction()?;
                let inserted = insert_batched(&tx, "INSERT OR IGNORE INTO t_sub_input", &INSERT_COLUMNS, &rows)?;
                tx.commit()?;
                Ok(inserted)
            })
            .await
    }

    /// Up to `n` unstarted tasks of `module` for a scope, oldest first.
    pub async fn get_by_scope(&self, scope_id: u64, module: Module, n: usize) -> Result<Vec<SubmoduleTask>> {
        self.pool
            .run(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {SELECT_COLUMNS} FROM t_sub_input \
                     WHERE id_t_scan_scope = ?1 AND label = ?2 AND scan_started IS NULL \
                     ORDER BY id LIMIT ?3"
                ))?;
                let rows = stmt.query_map(
                    params![scope_id as i64, module.label(), n as i64],
                    task_from_row,
                )?;
                let tasks = rows.collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(tasks)
            })
            .await
    }

    pub async fn mark_started(&self, ids: Vec<u64>, started: EpochMs) -> Result<usize> {
        if ids.is_empty() {
            return Ok(0);
        }
        let ids = id_list(&ids)?;
        self.pool
            .run(move |conn| {
                let tx = conn.transaction()?;
                let n = tx.execute(
                    "UPDATE t_sub_input SET scan_started = ?1 \
                     WHERE id IN (SELECT value FROM json_each(?2))",
                    params![started, ids],
                )?;
                tx.commit()?;
                Ok(n)
            })
            .await
    }

    pub async fn get(&self, id: u64) -> Result<Option<SubmoduleTask>> {
        self.pool
            .run(move |conn| {
                Ok(conn
                    .query_row(
                        &format!("SELECT {SELECT_COLUMNS} FROM t_sub_input WHERE id = ?1"),
                        [id as i64],
                        task_from_row,
                    )
                    .optional()?)
            })
            .await
    }

    pub async fn delete(&self, id: u64) -> Result<bool> {
        self.pool
            .run(move |conn| Ok(conn.execute("DELETE FROM t_sub_input WHERE id = ?1", [id as i64])? > 0))
            .await
    }

    /// Drops dispensed tasks of `module` that started before `before`.
    pub async fn clean_timed_out(&self, scope_id: u64, module: Module, before: EpochMs) -> Result<usize> {
        self.pool
            .run(move |conn| {
                let tx = conn.transaction()?;
                let n = tx.execute(
                    "DELETE FROM t_sub_input \
                     WHERE id_t_scan_scope = ?1 AND label = ?2 \
                       AND scan_started IS NOT NULL AND scan_started < ?3",
                    params![scope_id as i64, module.label(), before],
                )?;
                tx.commit()?;
                Ok(n)
            })
            .await
    }

    /// Drops every task whose scope is not in `remaining`.
    pub async fn clean_scopes(&self, remaining: &[u64]) -> Result<usize> {
        let remaining = id_list(remaining)?;
        self.pool
            .run(move |conn| {
                let tx = conn.transaction()?;
                let n = tx.execute(
                    "DELETE FROM t_sub_input \
                     WHERE id_t_scan_scope NOT IN (SELECT value FROM json_each(?1))",
                    [remaining],
                )?;
                tx.commit()?;
                Ok(n)
            })
            .await
    }

    pub async fn count_unstarted(&self, scope_id: u64) -> Result<i64> {
        self.pool
            .run(move |conn| count_unstarted(conn, scope_id))
            .await
    }
}

fn count_unstarted(conn: &Connection, scope_id: u64) -> Result<i64> {
    Ok(conn.query_row(
        "SELECT COUNT(*) FROM t_sub_input WHERE id_t_scan_scope = ?1 AND scan_started IS NULL",
        [scope_id as i64],
        |r| r.get(0),
    )?)
}
