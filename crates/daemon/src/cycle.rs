//! Scan cycle completion.

use anyhow::{Context, Result};
use scanbroker_core::model::Scope;
use scanbroker_core::EpochMs;
use tracing::{info, warn};

use crate::db::scope::ScopeDb;
use crate::service::Broker;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleCheck {
    /// The broker started too recently to judge.
    Grace,
    /// The scope store has no discovery inputs yet.
    NotInitialized,
    WorkRemaining,
    StillRunning,
    /// The manager started a new cycle.
    Initialized,
}

impl Broker {
    pub(crate) fn in_startup_grace(&self, now: EpochMs) -> bool {
        now - self.started_at < self.timings.startup_grace.as_millis() as EpochMs
    }

    /// Asks the manager for a new cycle once every enabled input of `scope`
    /// was scanned.
    pub async fn check_cycle(&self, scope: &Scope, db: &ScopeDb) -> Result<CycleCheck> {
        let now = self.clock.now_ms();
        if self.in_startup_grace(now) {
            return Ok(CycleCheck::Grace);
        }

        let state = db.cycle_state().await?;
        if state.total == 0 {
            return Ok(CycleCheck::NotInitialized);
        }
        if state.unstarted > 0 {
            return Ok(CycleCheck::WorkRemaining);
        }
        // Unfinished inputs only block while some agent still reports a
        // running discovery; otherwise the timeout sweep fails them.
        let active = self.agents.active_discovery(scope.id, now);
        if state.unfinished > 0 && active > 0 {
            return Ok(CycleCheck::StillRunning);
        }

        self.manager
            .new_cycle(scope.id)
            .await
            .with_context(|| format!("request new cycle for scope {}", scope.id))?;
        info!(scope_id = scope.id, previous_cycle = scope.cycle, "new scan cycle started");

        match self.manager.get_scope(scope.id).await {
            Ok(fresh) if fresh.id == scope.id => self.cache.replace(fresh),
            Ok(_) => warn!(scope_id = scope.id, "manager returned another scope after new cycle"),
            Err(e) => warn!(scope_id = scope.id, error = %e, "could not refresh scope after new cycle"),
        }
        Ok(CycleCheck::Initialized)
    }
}
