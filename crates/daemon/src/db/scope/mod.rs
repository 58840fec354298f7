//! Per-scope relational stores.
//!
//! Each scope owns one SQLite database holding its discovery inputs, the
//! hosts/services/scripts found by discovery and one info table per submodule.
//! [`ScopeDbs`] keeps one pooled handle per scope id and opens them lazily.

mod discovery;
mod modules;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use parking_lot::RwLock;
use rusqlite::types::Value;
use scanbroker_core::derive::ServiceHit;
use scanbroker_core::hours::TzRange;
use scanbroker_core::model::{Module, Scope};
use scanbroker_core::results::{DiscoveryResult, ScanResult};
use scanbroker_core::sanitize::sanitize;
use scanbroker_core::EpochMs;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use super::blocking;
use super::pool::{Pool, PoolOptions};

pub use discovery::{rationalize_service, CycleState, DiscoveryInput};
pub use modules::{info_table, webcrawler_status};

const SCHEMA: &str = include_str!("../../../migrations/scope.sql");

/// Result of writing a discovery result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryOutcome {
    /// The input row is gone or was reset while the agent was scanning.
    Vanished,
    /// The scan module failed; nothing was written.
    Exception,
    /// Rows were committed. Carries the services for task derivation.
    Stored(Vec<ServiceHit>),
}

/// Result of writing a submodule result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmoduleOutcome {
    /// No info row exists for the service any more.
    Vanished,
    /// The info row was already finished; only `scan_finished` was touched.
    Late,
    Stored,
}

pub struct ScopeDb {
    scope_id: u64,
    pool: Arc<Pool>,
}

impl ScopeDb {
    pub fn open(scope_id: u64, path: &Path, opts: PoolOptions) -> Result<Self> {
        let pool = Pool::open(path, opts, SCHEMA)
            .with_context(|| format!("open scope store for scope {scope_id}"))?;
        Ok(Self { scope_id, pool })
    }

    pub fn scope_id(&self) -> u64 {
        self.scope_id
    }

    pub fn path(&self) -> &Path {
        self.pool.path()
    }

    pub async fn ping(&self) -> Result<()> {
        self.pool.ping().await
    }

    pub fn close(&self) {
        self.pool.close();
    }

    /// Blocks up to `n` enabled, unstarted inputs inside `ranges` for the
    /// requesting agent.
    pub async fn claim_discovery(
        &self,
        n: usize,
        ranges: Vec<TzRange>,
        now: EpochMs,
        agent_ip: String,
        agent_host: String,
    ) -> Result<Vec<DiscoveryInput>> {
        self.pool
            .run(move |conn| discovery::claim(conn, n, &ranges, now, &agent_ip, &agent_host))
            .await
    }

    pub async fn persist_discovery(
        &self,
        discovery_id: u64,
        result: DiscoveryResult,
        now: EpochMs,
        cycle: u32,
    ) -> Result<DiscoveryOutcome> {
        self.pool
            .run(move |conn| discovery::persist(conn, discovery_id as i64, &result, now, cycle))
            .await
    }

    pub async fn cycle_state(&self) -> Result<CycleState> {
        self.pool.run(|conn| discovery::cycle_state(conn)).await
    }

    pub async fn clean_exceeded_discovery(
        &self,
        min_hostgroup: u32,
        host_timeout_minutes: u32,
        slack_minutes: u32,
        now: EpochMs,
    ) -> Result<usize> {
        self.pool
            .run(move |conn| {
                discovery::clean_exceeded(conn, min_hostgroup, host_timeout_minutes, slack_minutes, now)
            })
            .await
    }

    /// Creates `Running` info rows for dispensed submodule tasks. Rows that
    /// already exist are kept as they are.
    pub async fn prepare_result_rows(
        &self,
        module: Module,
        service_ids: Vec<i64>,
        started: EpochMs,
        agent_ip: String,
        agent_host: String,
    ) -> Result<usize> {
        if service_ids.is_empty() {
            return Ok(0);
        }
        self.pool
            .run(move |conn| {
                modules::prepare_rows(conn, module, &service_ids, started, &agent_ip, &agent_host)
            })
            .await
    }

    pub async fn persist_submodule(
        &self,
        module: Module,
        service_id: i64,
        result: ScanResult,
        now: EpochMs,
    ) -> Result<SubmoduleOutcome> {
        self.pool
            .run(move |conn| modules::persist(conn, module, service_id, &result, now))
            .await
    }

    pub async fn clean_exceeded(&self, module: Module, started_before: EpochMs, now: EpochMs) -> Result<usize> {
        self.pool
            .run(move |conn| modules::clean_exceeded(conn, module, started_before, now))
            .await
    }
}

/// Registry of open scope stores keyed by scope id.
pub struct ScopeDbs {
    root: PathBuf,
    opts: PoolOptions,
    dbs: RwLock<HashMap<u64, Arc<ScopeDb>>>,
}

impl ScopeDbs {
    pub fn new(root: impl Into<PathBuf>, opts: PoolOptions) -> Self {
        Self {
            root: root.into(),
            opts,
            dbs: RwLock::new(HashMap::new()),
        }
    }

    /// Location of a scope's store: `<root>/server-<id>/<file>.sqlite`.
    /// Names made of `[A-Za-z0-9_-]` are used as they are; any other name
    /// keeps its safe characters plus a digest of the raw name after a `.`,
    /// so distinct names never share a file.
    pub fn path_for(&self, scope: &Scope) -> PathBuf {
        let safe: String = scope
            .db_name
            .chars()
            .filter(|c| c.is_ascii_alphanumeric() || *c == '_' || *c == '-')
            .collect();
        let file = if scope.db_name.is_empty() {
            format!("_scope.{}", scope.id)
        } else if safe == scope.db_name {
            safe
        } else {
            let digest = Sha256::digest(scope.db_name.as_bytes());
            format!("{safe}.{}", &hex::encode(digest)[..16])
        };
        self.root
            .join(format!("server-{}", scope.db_server_id))
            .join(format!("{file}.sqlite"))
    }

    /// Returns the live handle for `scope`, opening it on first use and
    /// replacing it if it stopped answering.
    pub async fn get(&self, scope: &Scope) -> Result<Arc<ScopeDb>> {
        let path = self.path_for(scope);
        let existing = self.dbs.read().get(&scope.id).cloned();
        if let Some(db) = existing {
            if db.path() != path {
                info!(scope_id = scope.id, path = %path.display(), "scope store moved, reopening");
                self.evict_if_same(scope.id, &db);
            } else {
                match db.ping().await {
                    Ok(()) => return Ok(db),
                    Err(e) => {
                        warn!(scope_id = scope.id, error = %e, "scope store unresponsive, reopening");
                        self.evict_if_same(scope.id, &db);
                    }
                }
            }
        }

        let opts = self.opts.clone();
        let scope_id = scope.id;
        let opened = Arc::new(blocking(move || ScopeDb::open(scope_id, &path, opts)).await?);

        let mut dbs = self.dbs.write();
        if let Some(winner) = dbs.get(&scope.id) {
            opened.close();
            return Ok(winner.clone());
        }
        debug!(scope_id = scope.id, path = %opened.path().display(), "scope store opened");
        dbs.insert(scope.id, opened.clone());
        Ok(opened)
    }

    fn evict_if_same(&self, scope_id: u64, db: &Arc<ScopeDb>) {
        let mut dbs = self.dbs.write();
        if dbs.get(&scope_id).is_some_and(|cur| Arc::ptr_eq(cur, db)) {
            if let Some(old) = dbs.remove(&scope_id) {
                old.close();
            }
        }
    }

    /// Closes handles of scopes not in `remaining`.
    pub fn retain(&self, remaining: &[u64]) {
        let mut dbs = self.dbs.write();
        dbs.retain(|id, db| {
            let keep = remaining.contains(id);
            if !keep {
                info!(scope_id = *id, "scope store closed");
                db.close();
            }
            keep
        });
    }

    pub fn len(&self) -> usize {
        self.dbs.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn close_all(&self) {
        for (_, db) in self.dbs.write().drain() {
            db.close();
        }
    }
}

// Column value helpers shared by the discovery and module writers.

fn text(s: &str) -> Value {
    Value::Text(sanitize(s).into_owned())
}

fn list(items: &[String]) -> Value {
    Value::Text(scanbroker_core::sanitize::join(items, scanbroker_core::LIST_SEPARATOR))
}

fn int(v: impl Into<i64>) -> Value {
    Value::Integer(v.into())
}

fn opt_int(v: Option<i64>) -> Value {
    v.map(Value::Integer).unwrap_or(Value::Null)
}

fn flag(b: bool) -> Value {
    Value::Integer(b as i64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use scanbroker_core::model::status;
    use scanbroker_core::results::{
        AdInfo, Banner, BannerResult, DiscoveryHost, DiscoveryService, ScriptOutput,
    };

    fn scope() -> Scope {
        Scope {
            id: 7,
            db_server_id: 1,
            db_name: "acme".into(),
            ..Scope::default()
        }
    }

    async fn open() -> (tempfile::TempDir, ScopeDbs, Arc<ScopeDb>) {
        let dir = tempfile::tempdir().unwrap();
        let dbs = ScopeDbs::new(dir.path(), PoolOptions::default());
        let db = dbs.get(&scope()).await.unwrap();
        (dir, dbs, db)
    }

    fn seed(db: &ScopeDb, rows: &[(&str, f64, i64)]) {
        let conn = rusqlite::Connection::open(db.path()).unwrap();
        for (input, tz, priority) in rows {
            conn.execute(
                "INSERT INTO t_discovery (input, timezone, priority) VALUES (?1, ?2, ?3)",
                rusqlite::params![input, tz, priority],
            )
            .unwrap();
        }
    }

    fn host() -> DiscoveryHost {
        DiscoveryHost {
            ip: "10.0.0.5".into(),
            dns_name: "web.acme".into(),
            os_uptime: Some(60),
            ad: Some(AdInfo {
                critical_object: true,
                ..AdInfo::default()
            }),
            services: vec![
                DiscoveryService {
                    port: 443,
                    protocol: "TCP".into(),
                    service: "http".into(),
                    tunnel: "ssl".into(),
                    scripts: vec![ScriptOutput {
                        name: "http-title".into(),
                        output: "bad\0byte".into(),
                    }],
                    ..DiscoveryService::default()
                },
                DiscoveryService {
                    port: 22,
                    protocol: "tcp".into(),
                    service: "ssh".into(),
                    ..DiscoveryService::default()
                },
            ],
            ..DiscoveryHost::default()
        }
    }

    #[test]
    fn store_paths_are_distinct_per_name() {
        let dbs = ScopeDbs::new("/data", PoolOptions::default());
        let named = |id: u64, name: &str| {
            dbs.path_for(&Scope {
                id,
                db_server_id: 3,
                db_name: name.into(),
                ..Scope::default()
            })
        };

        assert_eq!(named(1, "acme_prod"), PathBuf::from("/data/server-3/acme_prod.sqlite"));
        let slashed = named(1, "a/b");
        assert_ne!(slashed, named(2, "a_b"));
        assert_ne!(slashed, named(2, "ab"));
        assert_ne!(slashed, named(2, "a\\b"));
        assert_eq!(slashed, named(9, "a/b"));
        assert_eq!(slashed.parent(), Some(Path::new("/data/server-3")));
        assert_ne!(named(5, ""), named(6, "scope-5"));
        assert_ne!(named(5, ""), named(6, ""));
    }

    #[tokio::test]
    async fn claim_respects_timezones_and_priority() {
        let (_dir, _dbs, db) = open().await;
        seed(&db, &[("a", 1.0, 0), ("b", 3.0, 5), ("c", 9.0, 9)]);

        let got = db
            .claim_discovery(5, vec![TzRange { from: 0, to: 4 }], 1_000, "10.1.1.1".into(), "agent".into())
            .await
            .unwrap();
        let inputs: Vec<_> = got.iter().map(|d| d.input.as_str()).collect();
        assert_eq!(inputs, vec!["b", "a"]);

        let again = db
            .claim_discovery(5, vec![TzRange { from: 0, to: 4 }], 2_000, "10.1.1.1".into(), "agent".into())
            .await
            .unwrap();
        assert!(again.is_empty());
        assert!(db.claim_discovery(5, vec![], 2_000, String::new(), String::new()).await.unwrap().is_empty());

        let state = db.cycle_state().await.unwrap();
        assert_eq!(state, CycleState { total: 3, unstarted: 1, unfinished: 3 });
    }

    #[tokio::test]
    async fn discovery_result_is_stored_with_hits() {
        let (_dir, _dbs, db) = open().await;
        seed(&db, &[("10.0.0.0/30", 0.0, 0)]);
        let claimed = db
            .claim_discovery(1, vec![TzRange { from: 0, to: 0 }], 1_000, "10.1.1.1".into(), "agent".into())
            .await
            .unwrap();
        let id = claimed[0].id as u64;

        let result = DiscoveryResult {
            status: status::COMPLETED.into(),
            exception: false,
            data: vec![host()],
        };
        let DiscoveryOutcome::Stored(hits) = db.persist_discovery(id, result, 3_600_000, 2).await.unwrap() else {
            panic!("expected stored outcome");
        };
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].service, "https");
        assert_eq!(hits[0].protocol, "tcp");
        assert_eq!(hits[0].address, "web.acme");

        let conn = rusqlite::Connection::open(db.path()).unwrap();
        let (critical, last_boot): (i64, i64) = conn
            .query_row("SELECT critical, os_last_boot FROM t_discovery_host", [], |r| Ok((r.get(0)?, r.get(1)?)))
            .unwrap();
        assert_eq!(critical, 1);
        assert_eq!(last_boot, 0);
        let output: String = conn
            .query_row("SELECT output FROM t_discovery_script", [], |r| r.get(0))
            .unwrap();
        assert!(!output.contains('\0'));
        let (count, finished): (i64, Option<i64>) = conn
            .query_row("SELECT scan_count, scan_finished FROM t_discovery", [], |r| Ok((r.get(0)?, r.get(1)?)))
            .unwrap();
        assert_eq!((count, finished), (1, Some(3_600_000)));
    }

    #[tokio::test]
    async fn large_discovery_keeps_services_on_their_hosts() {
        let (_dir, _dbs, db) = open().await;
        seed(&db, &[("10.0.0.0/24", 0.0, 0)]);
        let claimed = db
            .claim_discovery(1, vec![TzRange { from: 0, to: 0 }], 1_000, "10.1.1.1".into(), "agent".into())
            .await
            .unwrap();

        // More hosts and services than a single multi-row insert can carry.
        let hosts: Vec<DiscoveryHost> = (0..120u16)
            .map(|i| DiscoveryHost {
                ip: format!("10.0.{}.{}", i / 250, i % 250 + 1),
                services: (0..=(i % 3))
                    .map(|k| DiscoveryService {
                        port: 1_000 + i * 10 + k,
                        protocol: "tcp".into(),
                        service: "unknown".into(),
                        ..DiscoveryService::default()
                    })
                    .collect(),
                ..DiscoveryHost::default()
            })
            .collect();
        let expected: usize = hosts.iter().map(|h| h.services.len()).sum();
        let result = DiscoveryResult {
            status: status::COMPLETED.into(),
            exception: false,
            data: hosts,
        };

        let DiscoveryOutcome::Stored(hits) = db
            .persist_discovery(claimed[0].id as u64, result, 2_000, 1)
            .await
            .unwrap()
        else {
            panic!("expected stored outcome");
        };
        assert_eq!(hits.len(), expected);

        let conn = rusqlite::Connection::open(db.path()).unwrap();
        let hosts: i64 = conn.query_row("SELECT COUNT(*) FROM t_discovery_host", [], |r| r.get(0)).unwrap();
        assert_eq!(hosts, 120);
        for hit in &hits {
            let (port, service_ip, host_ip): (u16, String, String) = conn
                .query_row(
                    "SELECT s.port, s.ip, h.ip FROM t_discovery_service s \
                     JOIN t_discovery_host h ON h.id = s.id_t_discovery_host WHERE s.id = ?1",
                    [hit.service_id],
                    |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
                )
                .unwrap();
            assert_eq!(port, hit.port);
            assert_eq!(service_ip, hit.ip);
            assert_eq!(host_ip, hit.ip);
            assert_eq!((port - 1_000) / 10, {
                let octets: Vec<u16> = hit.ip.split('.').map(|o| o.parse().unwrap()).collect();
                octets[2] * 250 + octets[3] - 1
            });
        }
    }

    #[tokio::test]
    async fn unknown_or_failed_discovery_writes_nothing() {
        let (_dir, _dbs, db) = open().await;
        seed(&db, &[("a", 0.0, 0)]);
        let vanished = db
            .persist_discovery(99, DiscoveryResult::default(), 1, 1)
            .await
            .unwrap();
        assert_eq!(vanished, DiscoveryOutcome::Vanished);

        let claimed = db
            .claim_discovery(1, vec![TzRange { from: 0, to: 0 }], 1_000, String::new(), String::new())
            .await
            .unwrap();
        let failed = DiscoveryResult {
            status: status::FAILED.into(),
            exception: true,
            data: vec![host()],
        };
        let outcome = db.persist_discovery(claimed[0].id as u64, failed, 2_000, 1).await.unwrap();
        assert_eq!(outcome, DiscoveryOutcome::Exception);
    }

    #[tokio::test]
    async fn submodule_rows_prepare_persist_and_late() {
        let (_dir, _dbs, db) = open().await;
        seed(&db, &[("a", 0.0, 0)]);
        let claimed = db
            .claim_discovery(1, vec![TzRange { from: 0, to: 0 }], 1_000, String::new(), String::new())
            .await
            .unwrap();
        let result = DiscoveryResult {
            status: status::COMPLETED.into(),
            exception: false,
            data: vec![host()],
        };
        let DiscoveryOutcome::Stored(hits) = db.persist_discovery(claimed[0].id as u64, result, 2_000, 1).await.unwrap() else {
            panic!("expected stored outcome");
        };
        let ids: Vec<i64> = hits.iter().map(|h| h.service_id).collect();

        assert_eq!(db.prepare_result_rows(Module::Banner, ids.clone(), 3_000, "ip".into(), "h".into()).await.unwrap(), 2);
        // Second dispense of the same services keeps the existing rows.
        assert_eq!(db.prepare_result_rows(Module::Banner, ids.clone(), 4_000, "ip".into(), "h".into()).await.unwrap(), 0);

        let banner = ScanResult::Banner(BannerResult {
            status: status::COMPLETED.into(),
            exception: false,
            data: Banner {
                plain: "SSH-2.0".into(),
                hex: "5353".into(),
            },
        });
        let first = db.persist_submodule(Module::Banner, ids[1], banner.clone(), 5_000).await.unwrap();
        assert_eq!(first, SubmoduleOutcome::Stored);
        let late = db.persist_submodule(Module::Banner, ids[1], banner.clone(), 6_000).await.unwrap();
        assert_eq!(late, SubmoduleOutcome::Late);
        let gone = db.persist_submodule(Module::Banner, 12345, banner.clone(), 6_000).await.unwrap();
        assert_eq!(gone, SubmoduleOutcome::Vanished);
        assert!(db.persist_submodule(Module::Ssh, ids[1], banner, 6_000).await.is_err());

        assert_eq!(db.clean_exceeded(Module::Banner, 3_500, 7_000).await.unwrap(), 1);
        assert_eq!(db.clean_exceeded(Module::Banner, 3_500, 7_000).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn exceeded_discovery_is_failed() {
        let (_dir, _dbs, db) = open().await;
        seed(&db, &[("a", 0.0, 3)]);
        db.claim_discovery(1, vec![TzRange { from: 0, to: 0 }], 0, String::new(), String::new())
            .await
            .unwrap();
        // One hostgroup of 1 input: 10 minutes host timeout plus 5 minutes slack.
        assert_eq!(db.clean_exceeded_discovery(64, 10, 5, 15 * 60_000).await.unwrap(), 0);
        assert_eq!(db.clean_exceeded_discovery(64, 10, 5, 15 * 60_000 + 1).await.unwrap(), 1);
        let state = db.cycle_state().await.unwrap();
        assert_eq!(state.unfinished, 0);
    }

    #[tokio::test]
    async fn registry_reuses_and_drops_handles() {
        let (dir, dbs, db) = open().await;
        assert_eq!(db.path(), dir.path().join("server-1").join("acme.sqlite"));
        let again = dbs.get(&scope()).await.unwrap();
        assert!(Arc::ptr_eq(&db, &again));
        dbs.retain(&[1, 2]);
        assert!(dbs.is_empty());
    }
}
