//! r2d2 connection pools over SQLite files.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::Connection;

use super::blocking;

#[derive(Debug, Clone)]
pub struct PoolOptions {
    pub max_open: usize,
    /// Idle connections the pool keeps warm.
    pub min_idle: usize,
    pub idle_timeout: Duration,
    pub busy_timeout: Duration,
    /// How long a checkout waits for a free connection.
    pub checkout_timeout: Duration,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            max_open: 30,
            min_idle: 5,
            idle_timeout: Duration::from_secs(300),
            busy_timeout: Duration::from_secs(5),
            checkout_timeout: Duration::from_secs(30),
        }
    }
}

pub type DbConn = r2d2::PooledConnection<SqliteConnectionManager>;

pub struct Pool {
    path: PathBuf,
    inner: r2d2::Pool<SqliteConnectionManager>,
    closed: AtomicBool,
}

impl Pool {
    /// Opens the database, creating it if needed, and applies `schema`.
    pub fn open(path: &Path, opts: PoolOptions, schema: &str) -> Result<Arc<Self>> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("create dir {}", parent.display()))?;
            }
        }

        let busy = opts.busy_timeout;
        let manager = SqliteConnectionManager::file(path).with_init(move |conn| {
            conn.busy_timeout(busy)?;
            conn.pragma_update(None, "journal_mode", "WAL")?;
            conn.pragma_update(None, "synchronous", "NORMAL")?;
            conn.execute_batch("PRAGMA foreign_keys=ON;")
        });

        let max_open = u32::try_from(opts.max_open.max(1)).unwrap_or(u32::MAX);
        let min_idle = u32::try_from(opts.min_idle).unwrap_or(u32::MAX).min(max_open);
        let inner = r2d2::Pool::builder()
            .max_size(max_open)
            .min_idle(Some(min_idle))
            .idle_timeout(Some(opts.idle_timeout))
            .connection_timeout(opts.checkout_timeout)
            .build(manager)
            .with_context(|| format!("open sqlite db {}", path.display()))?;

        inner
            .get()?
            .execute_batch(schema)
            .with_context(|| format!("apply schema to {}", path.display()))?;

        Ok(Arc::new(Self {
            path: path.to_path_buf(),
            inner,
            closed: AtomicBool::new(false),
        }))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Runs `f` with a pooled connection on the blocking thread pool. The
    /// checkout itself waits there too, since r2d2 blocks.
    pub async fn run<F, T>(self: &Arc<Self>, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        if self.is_closed() {
            bail!("pool for {} is closed", self.path.display());
        }
        let pool = self.inner.clone();
        blocking(move || {
            let mut conn: DbConn = pool.get()?;
            f(&mut conn)
        })
        .await
    }

    pub async fn ping(self: &Arc<Self>) -> Result<()> {
        self.run(|conn| {
            conn.query_row("SELECT 1", [], |r| r.get::<_, i64>(0))?;
            Ok(())
        })
        .await
    }

    pub fn idle_count(&self) -> u32 {
        self.inner.state().idle_connections
    }

    /// Refuses new work. r2d2 closes the connections once the last handle
    /// to the pool is dropped.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}
