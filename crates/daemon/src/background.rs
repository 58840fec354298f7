//! Periodic stats submit, timeout sweeps and manager notifications.

use std::sync::Arc;

use anyhow::Result;
use scanbroker_core::api::ScopeNotification;
use scanbroker_core::model::{Module, Scope};
use scanbroker_core::{nmap, EpochMs};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinSet;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::manager::ManagerEvent;
use crate::service::Broker;

/// What one timeout sweep changed.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub scopes: usize,
    pub discovery_failed: usize,
    pub info_rows_failed: usize,
    pub tasks_dropped: usize,
}

impl Broker {
    /// Starts the stats, sweep and notification loops. They stop on shutdown.
    pub fn spawn_background(self: &Arc<Self>) {
        let events = self.manager.subscribe();

        let this = self.clone();
        self.loops.spawn(async move {
            let mut tick = interval(this.timings.stats_interval);
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = this.shutdown.cancelled() => break,
                    _ = tick.tick() => {}
                }
                if let Err(e) = this.submit_stats().await {
                    warn!(error = %format!("{e:#}"), "agent stats submit failed");
                }
            }
        });

        let this = self.clone();
        self.loops.spawn(async move {
            let mut tick = interval(this.timings.gc_interval);
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = this.shutdown.cancelled() => break,
                    _ = tick.tick() => {}
                }
                let report = this.sweep_timeouts().await;
                if report != SweepReport::default() {
                    debug!(?report, "timeout sweep finished");
                }
            }
        });

        let this = self.clone();
        self.loops.spawn(async move { this.run_events(events).await });
    }

    /// Pushes everything agents reported since the last submit.
    pub async fn submit_stats(&self) -> Result<()> {
        let Some(_guard) = self.stats_lock.acquire().await else {
            debug!("previous stats submit still running");
            return Ok(());
        };
        let update = self.agents.take();
        if update.is_empty() {
            return Ok(());
        }
        match self.manager.update_agents(&update).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_connectivity() => {
                debug!(error = %e, "manager unreachable, agent stats skipped");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Fails stalled scans of every cached scope.
    pub async fn sweep_timeouts(self: &Arc<Self>) -> SweepReport {
        let now = self.clock.now_ms();
        let mut report = SweepReport::default();
        if self.in_startup_grace(now) {
            debug!("within startup grace, timeout sweep skipped");
            return report;
        }

        let mut sweeps = JoinSet::new();
        for scope in self.cache.scopes() {
            let this = self.clone();
            sweeps.spawn(async move {
                let scope_id = scope.id;
                (scope_id, this.sweep_scope(&scope, now).await)
            });
        }
        while let Some(joined) = sweeps.join_next().await {
            match joined {
                Ok((_, Ok(scope_report))) => {
                    report.scopes += 1;
                    report.discovery_failed += scope_report.discovery_failed;
                    report.info_rows_failed += scope_report.info_rows_failed;
                    report.tasks_dropped += scope_report.tasks_dropped;
                }
                Ok((scope_id, Err(e))) => {
                    error!(scope_id, error = %format!("{e:#}"), "timeout sweep failed");
                }
                Err(e) => error!(error = %e, "timeout sweep aborted"),
            }
        }
        report
    }

    async fn sweep_scope(&self, scope: &Scope, now: EpochMs) -> Result<SweepReport> {
        let db = self.scope_dbs.get(scope).await?;
        let args = &scope.settings.discovery_nmap_args;
        let mut report = SweepReport {
            discovery_failed: db
                .clean_exceeded_discovery(
                    nmap::min_hostgroup(args),
                    nmap::host_timeout_minutes(args),
                    self.timings.discovery_slack_minutes,
                    now,
                )
                .await?,
            ..SweepReport::default()
        };

        for module in Module::SUBMODULES {
            let timeout = scope
                .settings
                .timeout_minutes(module)
                .unwrap_or(self.timings.banner_timeout_minutes);
            let total = i64::from(timeout) + i64::from(self.timings.gc_slack_minutes);
            let started_before = now - total * 60_000;

            report.info_rows_failed += db.clean_exceeded(module, started_before, now).await?;
            report.tasks_dropped += self.tasks.clean_timed_out(scope.id, module, started_before).await?;
        }

        if report.discovery_failed + report.info_rows_failed + report.tasks_dropped > 0 {
            info!(
                scope_id = scope.id,
                discovery = report.discovery_failed,
                info_rows = report.info_rows_failed,
                tasks = report.tasks_dropped,
                "timed out scans failed"
            );
        }
        Ok(report)
    }

    async fn run_events(&self, mut events: broadcast::Receiver<ManagerEvent>) {
        loop {
            let event = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                ev = events.recv() => ev,
            };
            match event {
                Ok(ManagerEvent::Notification(n)) => self.apply_notification(&n).await,
                Ok(ManagerEvent::Reconnected) => {
                    info!("manager reconnected, dropping cached scopes");
                    self.cache.clear();
                }
                Err(RecvError::Lagged(missed)) => {
                    warn!(missed, "scope notifications lagged, dropping cached scopes");
                    self.cache.clear();
                }
                Err(RecvError::Closed) => break,
            }
        }
    }

    /// Applies a scope change pushed by the manager.
    pub async fn apply_notification(&self, notification: &ScopeNotification) {
        let evicted = self.cache.invalidate(notification);
        if !evicted.is_empty() {
            debug!(?evicted, "scopes evicted from cache");
        }
        let remaining = &notification.remaining_scope_ids;
        self.agents.retain_scopes(remaining);
        self.scope_dbs.retain(remaining);
        match self.tasks.clean_scopes(remaining).await {
            Ok(0) => {}
            Ok(n) => info!(tasks = n, "dropped tasks of removed scopes"),
            Err(e) => error!(error = %format!("{e:#}"), "dropping tasks of removed scopes failed"),
        }
    }
}
