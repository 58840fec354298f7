//! SQLite access: the broker-local task queue and the per-scope stores.

pub mod pool;
pub mod scope;
pub mod tasks;

use anyhow::{anyhow, Result};
use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection};

/// SQLite's default bound-parameter limit.
pub const SQLITE_MAX_PARAMS: usize = 999;

/// Rows per multi-row statement for a table with `columns` bound columns.
pub fn rows_per_batch(columns: usize) -> usize {
    (SQLITE_MAX_PARAMS / columns.max(1)).max(1)
}

/// `(?,?,?),(?,?,?)` for `rows` rows of `columns` parameters.
pub fn values_placeholders(rows: usize, columns: usize) -> String {
    let row = format!("({})", vec!["?"; columns].join(","));
    vec![row; rows].join(",")
}

/// Multi-row insert of `rows` in batches that stay under the parameter limit.
/// `head` is the statement up to the table name, e.g. `INSERT INTO t_x`.
pub fn insert_batched(
    conn: &Connection,
    head: &str,
    columns: &[&str],
    rows: &[Vec<Value>],
) -> rusqlite::Result<usize> {
    let mut inserted = 0;
    for chunk in rows.chunks(rows_per_batch(columns.len())) {
        let sql = format!(
            "{head} ({}) VALUES {}",
            columns.join(", "),
            values_placeholders(chunk.len(), columns.len())
        );
        let mut stmt = conn.prepare_cached(&sql)?;
        inserted += stmt.execute(params_from_iter(chunk.iter().flatten()))?;
    }
    Ok(inserted)
}

/// Like [`insert_batched`] but returns the new row ids in the order of
/// `rows`. The table must have an `AUTOINCREMENT` id so ids grow with
/// insertion order; `RETURNING` itself emits rows in no defined order.
pub fn insert_batched_returning_ids(
    conn: &Connection,
    head: &str,
    columns: &[&str],
    rows: &[Vec<Value>],
) -> rusqlite::Result<Vec<i64>> {
    let mut ids = Vec::with_capacity(rows.len());
    for chunk in rows.chunks(rows_per_batch(columns.len())) {
        let sql = format!(
            "{head} ({}) VALUES {} RETURNING id",
            columns.join(", "),
            values_placeholders(chunk.len(), columns.len())
        );
        let mut stmt = conn.prepare_cached(&sql)?;
        let mut batch = stmt
            .query_map(params_from_iter(chunk.iter().flatten()), |r| r.get::<_, i64>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        batch.sort_unstable();
        ids.extend(batch);
    }
    Ok(ids)
}

/// Offloads rusqlite work from the async executor. A panic in `f` is
/// reported as an error.
pub async fn blocking<F, T>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| anyhow!("join error: {e}"))?
}

pub fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
                || e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY
    )
}

/// JSON array of ids, bound as a single parameter and read with `json_each`.
pub fn id_list<T: serde::Serialize>(ids: &[T]) -> Result<String> {
    Ok(serde_json::to_string(ids)?)
}
