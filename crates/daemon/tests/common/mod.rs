#![allow(dead_code)]

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveTime, TimeZone, Utc, Weekday};
use parking_lot::Mutex;
use rusqlite::{params, Connection};
use scanbroker_core::api::{
    AgentUpdate, ModuleData, RequestScanTasksArgs, SubmitScanResultArgs, COMPATIBILITY_LEVEL,
};
use scanbroker_core::model::{Module, ScanSettings, Scope};
use scanbroker_core::results::ScanResult;
use scanbroker_core::FixedClock;
use scanbroker_daemon::config::BrokerTimings;
use scanbroker_daemon::db::pool::PoolOptions;
use scanbroker_daemon::db::tasks::TaskDb;
use scanbroker_daemon::error::ManagerError;
use scanbroker_daemon::manager::{Manager, ManagerEvent};
use scanbroker_daemon::{Broker, BrokerOptions};
use tempfile::TempDir;
use tokio::sync::{broadcast, watch};

type CycleHook = Box<dyn Fn(u64) + Send + Sync>;

/// In-memory manager. Scopes are keyed by secret.
pub struct MockManager {
    scopes: Mutex<HashMap<String, Scope>>,
    pub resolve_calls: AtomicUsize,
    resolve_delay: Mutex<Duration>,
    connectivity_failures: AtomicUsize,
    unauthorized: Mutex<bool>,
    pub updates: Mutex<Vec<AgentUpdate>>,
    pub cycles: Mutex<Vec<u64>>,
    on_new_cycle: Mutex<Option<CycleHook>>,
    connected: watch::Sender<bool>,
    events: broadcast::Sender<ManagerEvent>,
}

impl MockManager {
    pub fn new() -> Arc<Self> {
        let (connected, _) = watch::channel(true);
        let (events, _) = broadcast::channel(16);
        Arc::new(Self {
            scopes: Mutex::new(HashMap::new()),
            resolve_calls: AtomicUsize::new(0),
            resolve_delay: Mutex::new(Duration::ZERO),
            connectivity_failures: AtomicUsize::new(0),
            unauthorized: Mutex::new(false),
            updates: Mutex::new(Vec::new()),
            cycles: Mutex::new(Vec::new()),
            on_new_cycle: Mutex::new(None),
            connected,
            events,
        })
    }

    pub fn add_scope(&self, scope: Scope) {
        self.scopes.lock().insert(scope.secret.clone(), scope);
    }

    pub fn resolve_calls(&self) -> usize {
        self.resolve_calls.load(Ordering::SeqCst)
    }

    pub fn set_resolve_delay(&self, delay: Duration) {
        *self.resolve_delay.lock() = delay;
    }

    /// The next `n` calls fail as if the manager were unreachable.
    pub fn fail_connectivity(&self, n: usize) {
        self.connectivity_failures.store(n, Ordering::SeqCst);
    }

    pub fn set_unauthorized(&self, on: bool) {
        *self.unauthorized.lock() = on;
    }

    pub fn on_new_cycle(&self, hook: impl Fn(u64) + Send + Sync + 'static) {
        *self.on_new_cycle.lock() = Some(Box::new(hook));
    }

    pub fn emit(&self, event: ManagerEvent) {
        let _ = self.events.send(event);
    }

    fn check_reachable(&self) -> Result<(), ManagerError> {
        let failed = self
            .connectivity_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(ManagerError::Connectivity("connection refused".into()));
        }
        if *self.unauthorized.lock() {
            return Err(ManagerError::Unauthorized);
        }
        Ok(())
    }
}

#[async_trait]
impl Manager for MockManager {
    async fn get_scope_full(&self, secret: &str) -> Result<Scope, ManagerError> {
        self.resolve_calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.resolve_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.check_reachable()?;
        Ok(self.scopes.lock().get(secret).cloned().unwrap_or_default())
    }

    async fn get_scope(&self, scope_id: u64) -> Result<Scope, ManagerError> {
        self.check_reachable()?;
        self.scopes
            .lock()
            .values()
            .find(|s| s.id == scope_id)
            .cloned()
            .ok_or(ManagerError::Status {
                status: 404,
                body: "no such scope".into(),
            })
    }

    async fn get_scopes(&self) -> Result<Vec<Scope>, ManagerError> {
        self.check_reachable()?;
        let mut scopes: Vec<Scope> = self.scopes.lock().values().cloned().collect();
        scopes.sort_by_key(|s| s.id);
        Ok(scopes)
    }

    async fn update_agents(&self, update: &AgentUpdate) -> Result<(), ManagerError> {
        self.check_reachable()?;
        self.updates.lock().push(update.clone());
        Ok(())
    }

    async fn new_cycle(&self, scope_id: u64) -> Result<(), ManagerError> {
        self.check_reachable()?;
        self.cycles.lock().push(scope_id);
        for scope in self.scopes.lock().values_mut().filter(|s| s.id == scope_id) {
            scope.cycle += 1;
        }
        if let Some(hook) = self.on_new_cycle.lock().as_ref() {
            hook(scope_id);
        }
        Ok(())
    }

    fn connected(&self) -> watch::Receiver<bool> {
        self.connected.subscribe()
    }

    fn subscribe(&self) -> broadcast::Receiver<ManagerEvent> {
        self.events.subscribe()
    }
}

pub struct Harness {
    pub dir: TempDir,
    pub broker: Arc<Broker>,
    pub manager: Arc<MockManager>,
    pub clock: Arc<FixedClock>,
}

/// Wednesday, 08:30 UTC.
pub fn wednesday_morning() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, 8, 30, 0).unwrap()
}

pub fn test_timings() -> BrokerTimings {
    BrokerTimings {
        startup_grace: Duration::ZERO,
        resolve_retry: Duration::from_millis(10),
        ..BrokerTimings::default()
    }
}

pub fn harness() -> Harness {
    harness_with(test_timings())
}

pub fn harness_with(timings: BrokerTimings) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let clock = Arc::new(FixedClock::new(wednesday_morning()));
    let manager = MockManager::new();
    let tasks = TaskDb::open(&dir.path().join("broker.sqlite"), PoolOptions::default()).unwrap();
    let broker = Broker::new(
        tasks,
        manager.clone(),
        clock.clone(),
        BrokerOptions {
            scope_db_root: dir.path().join("scopes"),
            pool: PoolOptions::default(),
            timings,
        },
    );
    Harness {
        dir,
        broker,
        manager,
        clock,
    }
}

pub fn office_hours() -> ScanSettings {
    ScanSettings {
        max_instances_discovery: 15,
        max_instances_banner: 10,
        max_instances_smb: 10,
        max_instances_ssh: 10,
        max_instances_ssl: 10,
        discovery_time_earliest: NaiveTime::from_hms_opt(9, 0, 0).unwrap(),
        discovery_time_latest: NaiveTime::from_hms_opt(17, 0, 0).unwrap(),
        discovery_skip_days: vec![Weekday::Sat, Weekday::Sun],
        discovery_nmap_args: "-Pn -sS --top-ports 100".into(),
        ..ScanSettings::default()
    }
}

pub fn scope(id: u64, secret: &str) -> Scope {
    Scope {
        id,
        name: format!("scope {id}"),
        secret: secret.into(),
        enabled: true,
        db_server_id: 1,
        db_name: format!("scope_{id}"),
        settings: office_hours(),
        ..Scope::default()
    }
}

impl Harness {
    /// Registers `scope` with the manager and creates its store.
    pub async fn add_scope(&self, scope: &Scope) -> PathBuf {
        self.manager.add_scope(scope.clone());
        self.broker.scope_dbs().get(scope).await.unwrap();
        self.broker.scope_dbs().path_for(scope)
    }

    pub fn now_ms(&self) -> i64 {
        scanbroker_core::Clock::now_ms(self.clock.as_ref())
    }

    pub fn submit(&self, secret: &str, id: u64, result: ScanResult) {
        self.broker.submit_result(SubmitScanResultArgs {
            name: "agent-1".into(),
            host: "scanner-1".into(),
            ip: "192.0.2.10".into(),
            scope_secret: secret.into(),
            id,
            result,
        });
    }
}

pub fn request(secret: &str, slots: &[(Module, i32)]) -> RequestScanTasksArgs {
    request_from("agent-1", secret, slots)
}

pub fn request_from(agent: &str, secret: &str, slots: &[(Module, i32)]) -> RequestScanTasksArgs {
    RequestScanTasksArgs {
        compatibility_level: COMPATIBILITY_LEVEL,
        name: agent.into(),
        host: "scanner-1".into(),
        ip: "192.0.2.10".into(),
        shared: false,
        limits: true,
        scope_secret: secret.into(),
        modules: slots
            .iter()
            .map(|(module, active)| ModuleData {
                label: module.label().into(),
                max_instances: 15,
                total_instances: 15,
                scope_instances: 15,
                active_tasks: *active,
            })
            .collect(),
        system: Default::default(),
    }
}

pub fn open(path: &Path) -> Connection {
    let conn = Connection::open(path).unwrap();
    conn.busy_timeout(Duration::from_secs(5)).unwrap();
    conn
}

/// Inserts a discovery input and returns its row id.
pub fn seed_input(path: &Path, input: &str, timezone: f64) -> i64 {
    let conn = open(path);
    conn.execute(
        "INSERT INTO t_discovery (input, timezone) VALUES (?1, ?2)",
        params![input, timezone],
    )
    .unwrap();
    conn.last_insert_rowid()
}

/// Inserts an input that was already scanned in the current cycle.
pub fn seed_scanned_input(path: &Path, input: &str, started: i64, finished: Option<i64>) -> i64 {
    let conn = open(path);
    conn.execute(
        "INSERT INTO t_discovery (input, scan_started, scan_finished, scan_status, scan_count)
         VALUES (?1, ?2, ?3, 'Completed', 1)",
        params![input, started, finished],
    )
    .unwrap();
    conn.last_insert_rowid()
}

pub fn query_i64(path: &Path, sql: &str) -> i64 {
    let conn = open(path);
    conn.query_row(sql, [], |r| r.get(0)).unwrap()
}

pub fn query_opt_i64(path: &Path, sql: &str) -> Option<i64> {
    let conn = open(path);
    conn.query_row(sql, [], |r| r.get(0)).unwrap()
}

pub fn query_text(path: &Path, sql: &str) -> String {
    let conn = open(path);
    conn.query_row(sql, [], |r| r.get(0)).unwrap()
}

pub fn execute(path: &Path, sql: &str) {
    let conn = open(path);
    conn.execute_batch(sql).unwrap();
}

/// Polls `cond` until it holds or two seconds pass.
pub async fn eventually(mut cond: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cond()
}
