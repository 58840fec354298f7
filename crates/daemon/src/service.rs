use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use scanbroker_core::api::{
    RequestScanTasksArgs, RequestScanTasksReply, SubmitScanResultArgs, Task, COMPATIBILITY_LEVEL,
};
use scanbroker_core::derive::derive_tasks;
use scanbroker_core::hours::timezones_between;
use scanbroker_core::model::{Module, Scope};
use scanbroker_core::results::ScanResult;
use scanbroker_core::{nmap, Clock, EpochMs};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::agents::AgentRegistry;
use crate::cache::{ScopeCache, ScopeResolver};
use crate::config::BrokerTimings;
use crate::db::pool::PoolOptions;
use crate::db::scope::{DiscoveryOutcome, ScopeDbs, SubmoduleOutcome};
use crate::db::tasks::TaskDb;
use crate::error::{ApiError, ResolveError};
use crate::locks::{NamedMutex, TimedLock};
use crate::manager::Manager;

/// How long shutdown waits for in-flight result writes.
const SHUTDOWN_DRAIN: Duration = Duration::from_secs(30);

type Prepares = JoinSet<Result<usize>>;

pub struct BrokerOptions {
    pub scope_db_root: PathBuf,
    pub pool: PoolOptions,
    pub timings: BrokerTimings,
}

/// Dispatches scan tasks to agents and persists their results.
pub struct Broker {
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) manager: Arc<dyn Manager>,
    pub(crate) cache: Arc<ScopeCache>,
    resolver: ScopeResolver,
    pub(crate) agents: AgentRegistry,
    pub(crate) tasks: TaskDb,
    pub(crate) scope_dbs: ScopeDbs,
    feed_locks: NamedMutex<(u64, Module)>,
    pub(crate) stats_lock: TimedLock,
    pub(crate) started_at: EpochMs,
    pub(crate) timings: BrokerTimings,
    pub(crate) shutdown: CancellationToken,
    stopped: AtomicBool,
    /// Result writes in flight.
    persists: TaskTracker,
    /// Background loops.
    pub(crate) loops: TaskTracker,
}

impl Broker {
    pub fn new(
        tasks: TaskDb,
        manager: Arc<dyn Manager>,
        clock: Arc<dyn Clock>,
        opts: BrokerOptions,
    ) -> Arc<Self> {
        let shutdown = CancellationToken::new();
        let cache = Arc::new(ScopeCache::new());
        let resolver = ScopeResolver::new(
            cache.clone(),
            manager.clone(),
            shutdown.clone(),
            opts.timings.resolve_retry,
        );
        let started_at = clock.now_ms();
        Arc::new(Self {
            clock,
            manager,
            cache,
            resolver,
            agents: AgentRegistry::new(),
            tasks,
            scope_dbs: ScopeDbs::new(opts.scope_db_root, opts.pool),
            feed_locks: NamedMutex::new(),
            stats_lock: TimedLock::new(opts.timings.stats_interval),
            started_at,
            timings: opts.timings,
            shutdown,
            stopped: AtomicBool::new(false),
            persists: TaskTracker::new(),
            loops: TaskTracker::new(),
        })
    }

    pub fn cache(&self) -> &ScopeCache {
        &self.cache
    }

    pub fn agents(&self) -> &AgentRegistry {
        &self.agents
    }

    pub fn tasks(&self) -> &TaskDb {
        &self.tasks
    }

    pub fn scope_dbs(&self) -> &ScopeDbs {
        &self.scope_dbs
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Fills the cache with every scope the manager knows. Best effort.
    pub async fn warm_cache(&self) {
        let generation = self.cache.generation();
        match self.manager.get_scopes().await {
            Ok(scopes) => {
                let n = scopes.len();
                for scope in scopes.into_iter().filter(|s| s.id != 0 && !s.secret.is_empty()) {
                    let secret = scope.secret.clone();
                    self.cache.insert_if_current(&secret, scope, generation);
                }
                info!(scopes = n, "scope cache warmed");
            }
            Err(e) => debug!(error = %e, "could not warm scope cache"),
        }
    }

    /// Hands out up to the free capacity the agent reports per module.
    pub async fn request_tasks(&self, args: RequestScanTasksArgs) -> Result<RequestScanTasksReply, ApiError> {
        if args.compatibility_level != COMPATIBILITY_LEVEL {
            warn!(
                agent = %args.name,
                host = %args.host,
                level = args.compatibility_level,
                "rejecting incompatible agent"
            );
            return Err(ApiError::Incompatible);
        }

        let scope = match self.resolver.resolve(&args.scope_secret).await {
            Ok(scope) => scope,
            Err(ResolveError::InvalidSecret) => return Err(ApiError::InvalidSecret),
            Err(ResolveError::Unavailable) => return Ok(RequestScanTasksReply::default()),
        };

        self.agents.update(scope.id, &args, self.clock.now_ms());

        if !scope.enabled {
            return Ok(RequestScanTasksReply::default());
        }

        let mut reply = RequestScanTasksReply::default();
        let mut prepares = Prepares::new();
        let mut failed = false;

        for data in &args.modules {
            let module = match data.label.parse::<Module>() {
                Ok(m) => m,
                Err(e) => {
                    debug!(agent = %args.name, error = %e, "ignoring unknown module slot");
                    continue;
                }
            };
            let available = i64::from(scope.settings.max_instances(module)) - i64::from(data.active_tasks);
            if available <= 0 {
                continue;
            }
            let n = available as usize;

            let fed = if module == Module::Discovery {
                self.feed_discovery(&scope, n, &args).await
            } else {
                self.feed_submodule(&scope, module, n, &args, &mut prepares).await
            };
            match fed {
                Ok(tasks) => reply.tasks.extend(tasks),
                Err(e) => {
                    error!(scope_id = scope.id, label = %module, error = %format!("{e:#}"), "feeding tasks failed");
                    failed = true;
                }
            }
        }

        // Info rows must exist before the agent can report against them.
        while let Some(joined) = prepares.join_next().await {
            match joined {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => error!(scope_id = scope.id, error = %format!("{e:#}"), "preparing info rows failed"),
                Err(e) => error!(scope_id = scope.id, error = %e, "info row preparation aborted"),
            }
        }

        if failed {
            return Err(ApiError::Internal);
        }
        if !reply.tasks.is_empty() {
            debug!(scope_id = scope.id, agent = %args.name, tasks = reply.tasks.len(), "tasks dispensed");
        }
        Ok(reply)
    }

    async fn feed_discovery(&self, scope: &Scope, n: usize, args: &RequestScanTasksArgs) -> Result<Vec<Task>> {
        let backlog = self.tasks.count_unstarted(scope.id).await?;
        if backlog > self.timings.backlog_limit {
            debug!(scope_id = scope.id, backlog, "submodule backlog too large, holding discovery");
            return Ok(Vec::new());
        }

        let _guard = self.feed_locks.lock((scope.id, Module::Discovery)).await;
        let db = self.scope_dbs.get(scope).await?;

        if scope.cycles {
            match self.check_cycle(scope, &db).await {
                Ok(outcome) => debug!(scope_id = scope.id, ?outcome, "cycle check"),
                Err(e) => warn!(scope_id = scope.id, error = %format!("{e:#}"), "cycle check failed"),
            }
        }

        let settings = &scope.settings;
        let ranges = timezones_between(
            self.clock.now(),
            settings.discovery_time_earliest,
            settings.discovery_time_latest,
            &settings.discovery_skip_days,
        );
        if ranges.is_empty() {
            return Ok(Vec::new());
        }

        let claimed = db
            .claim_discovery(n, ranges, self.clock.now_ms(), args.ip.clone(), args.host.clone())
            .await?;
        if claimed.is_empty() {
            return Ok(Vec::new());
        }

        let mut settings = scope.settings.clone();
        settings.discovery_nmap_args = nmap::with_defaults(&settings.discovery_nmap_args);
        Ok(claimed
            .into_iter()
            .map(|input| Task {
                secret: scope.secret.clone(),
                label: Module::Discovery,
                id: input.id as u64,
                target: input.input,
                protocol: String::new(),
                port: 0,
                other_names: Vec::new(),
                service: String::new(),
                service_product: String::new(),
                settings: settings.clone(),
            })
            .collect())
    }

    async fn feed_submodule(
        &self,
        scope: &Scope,
        module: Module,
        n: usize,
        args: &RequestScanTasksArgs,
        prepares: &mut Prepares,
    ) -> Result<Vec<Task>> {
        let _guard = self.feed_locks.lock((scope.id, module)).await;

        let queued = self.tasks.get_by_scope(scope.id, module, n).await?;
        if queued.is_empty() {
            return Ok(Vec::new());
        }
        let db = self.scope_dbs.get(scope).await?;

        let now = self.clock.now_ms();
        self.tasks
            .mark_started(queued.iter().map(|t| t.id).collect(), now)
            .await?;

        let service_ids = queued.iter().map(|t| t.service_id).collect();
        let (ip, host) = (args.ip.clone(), args.host.clone());
        prepares.spawn(async move { db.prepare_result_rows(module, service_ids, now, ip, host).await });

        Ok(queued
            .into_iter()
            .map(|t| Task {
                secret: scope.secret.clone(),
                label: module,
                id: t.id,
                target: t.target,
                protocol: t.protocol,
                port: t.port,
                other_names: t.other_names,
                service: t.service,
                service_product: t.service_product,
                settings: scope.settings.clone(),
            })
            .collect())
    }

    /// Queues a result for persistence and returns at once.
    pub fn submit_result(self: &Arc<Self>, args: SubmitScanResultArgs) {
        let label = args.result.module();
        let task_id = args.id;
        if self.is_shut_down() {
            warn!(label = %label, task_id, "broker shutting down, result dropped");
            return;
        }
        let this = self.clone();
        self.persists.spawn(async move {
            let inner = tokio::spawn(async move { this.persist_result(args).await });
            match inner.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!(label = %label, task_id, error = %format!("{e:#}"), "persisting result failed"),
                Err(e) if e.is_panic() => error!(label = %label, task_id, "persisting result panicked"),
                Err(e) => warn!(label = %label, task_id, error = %e, "persisting result cancelled"),
            }
        });
    }

    async fn persist_result(&self, args: SubmitScanResultArgs) -> Result<()> {
        let scope = match self.resolver.resolve(&args.scope_secret).await {
            Ok(scope) => scope,
            Err(e) => {
                info!(agent = %args.name, task_id = args.id, error = %e, "dropping result of unresolvable scope");
                return Ok(());
            }
        };
        let db = self.scope_dbs.get(&scope).await?;
        let now = self.clock.now_ms();

        match args.result {
            ScanResult::Discovery(result) => {
                match db.persist_discovery(args.id, result, now, scope.cycle).await? {
                    DiscoveryOutcome::Vanished => {
                        info!(scope_id = scope.id, discovery_id = args.id, "discovery input vanished, dropping result");
                    }
                    DiscoveryOutcome::Exception => {
                        warn!(
                            scope_id = scope.id,
                            discovery_id = args.id,
                            "discovery scan failed on the agent, input stays running until timeout"
                        );
                    }
                    DiscoveryOutcome::Stored(hits) => {
                        // Only after commit: tasks must not reference uncommitted services.
                        let derived = derive_tasks(&hits, &scope.settings);
                        let queued = self.tasks.add(scope.id, derived).await?;
                        debug!(
                            scope_id = scope.id,
                            discovery_id = args.id,
                            services = hits.len(),
                            queued,
                            "discovery result stored"
                        );
                    }
                }
            }
            result => {
                let module = result.module();
                let Some(task) = self.tasks.get(args.id).await? else {
                    info!(scope_id = scope.id, label = %module, task_id = args.id, "task already cleaned up, dropping result");
                    return Ok(());
                };
                if task.scope_id != scope.id || task.module != module {
                    error!(
                        scope_id = scope.id,
                        label = %module,
                        task_id = task.id,
                        task_scope = task.scope_id,
                        task_label = %task.module,
                        "result does not match its task, dropping"
                    );
                    return Ok(());
                }

                match db.persist_submodule(module, task.service_id, result, now).await? {
                    SubmoduleOutcome::Stored => {
                        debug!(scope_id = scope.id, label = %module, task_id = task.id, "result stored");
                    }
                    SubmoduleOutcome::Late => {
                        info!(scope_id = scope.id, label = %module, task_id = task.id, "late result, only finish time updated");
                    }
                    SubmoduleOutcome::Vanished => {
                        info!(scope_id = scope.id, label = %module, task_id = task.id, "info row vanished, dropping result");
                    }
                }
                self.tasks.delete(task.id).await?;
            }
        }
        Ok(())
    }

    /// Waits until every result submitted so far is persisted. The tracker
    /// stays closed once shutdown has begun.
    pub async fn drain_results(&self) {
        self.persists.close();
        self.persists.wait().await;
        if self.stopped.load(Ordering::Acquire) {
            return;
        }
        self.persists.reopen();
        // Shutdown may have closed the tracker between the check and reopen.
        if self.stopped.load(Ordering::Acquire) {
            self.persists.close();
        }
    }

    /// Stops background work and closes every store. Runs once.
    pub async fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("broker shutting down");
        self.shutdown.cancel();

        self.loops.close();
        self.persists.close();
        let drained = tokio::time::timeout(SHUTDOWN_DRAIN, async {
            self.loops.wait().await;
            self.persists.wait().await;
        })
        .await;
        if drained.is_err() {
            warn!("result writes still running at shutdown");
        }

        self.scope_dbs.close_all();
        self.tasks.close();
    }

    pub fn is_shut_down(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Whether result writes can still be queued.
    pub fn accepting_results(&self) -> bool {
        !self.is_shut_down() && !self.persists.is_closed()
    }
}
