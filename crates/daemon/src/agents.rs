//! Agent statistics registry.
//!
//! Reports are kept per `(scope id, agent)` until the next stats submit takes
//! them. Discovery counts are tracked separately because the cycle
//! coordinator needs them between submits.

use std::collections::HashMap;

use parking_lot::Mutex;
use scanbroker_core::api::{AgentStatsRecord, AgentUpdate, RequestScanTasksArgs};
use scanbroker_core::model::{AgentIdentity, Module};
use scanbroker_core::EpochMs;

/// Discovery counts older than this no longer count as active.
pub const DISCOVERY_REPORT_TTL_MS: EpochMs = 10 * 60 * 1000;

type AgentKey = (u64, AgentIdentity);

#[derive(Debug, Clone, Copy)]
struct DiscoveryReport {
    active: i32,
    seen: EpochMs,
}

#[derive(Default)]
pub struct AgentRegistry {
    stats: Mutex<HashMap<AgentKey, AgentStatsRecord>>,
    discovery: Mutex<HashMap<AgentKey, DiscoveryReport>>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records an agent's latest report for `scope_id`.
    pub fn update(&self, scope_id: u64, args: &RequestScanTasksArgs, now: EpochMs) {
        let key = (scope_id, args.identity());

        let tasks = args
            .modules
            .iter()
            .map(|m| (m.label.clone(), m.active_tasks))
            .collect();
        let record = AgentStatsRecord {
            name: args.name.clone(),
            host: args.host.clone(),
            ip: args.ip.clone(),
            shared: args.shared,
            limits: args.limits,
            last_seen: now,
            tasks,
            cpu_rate: args.system.cpu_rate,
            memory_rate: args.system.memory_rate,
            platform: args.system.platform.clone(),
            platform_family: args.system.platform_family.clone(),
            platform_version: args.system.platform_version.clone(),
        };

        let discovery = args
            .modules
            .iter()
            .find(|m| m.label.parse::<Module>() == Ok(Module::Discovery))
            .map(|m| m.active_tasks);

        if let Some(active) = discovery {
            self.discovery
                .lock()
                .insert(key.clone(), DiscoveryReport { active, seen: now });
        }
        self.stats.lock().insert(key, record);
    }

    /// Swaps out everything reported since the last call, grouped by scope.
    pub fn take(&self) -> AgentUpdate {
        let drained = std::mem::take(&mut *self.stats.lock());
        let mut update = AgentUpdate::new();
        for ((scope_id, _), record) in drained {
            update.entry(scope_id).or_default().push(record);
        }
        for records in update.values_mut() {
            records.sort_by(|a, b| (&a.name, &a.host).cmp(&(&b.name, &b.host)));
        }
        update
    }

    /// Sum of discovery tasks agents reported running for `scope_id`.
    pub fn active_discovery(&self, scope_id: u64, now: EpochMs) -> i64 {
        self.discovery
            .lock()
            .iter()
            .filter(|((id, _), r)| *id == scope_id && now - r.seen <= DISCOVERY_REPORT_TTL_MS)
            .map(|(_, r)| r.active.max(0) as i64)
            .sum()
    }

    /// Drops every report bound to a scope not in `remaining`.
    pub fn retain_scopes(&self, remaining: &[u64]) {
        self.stats.lock().retain(|(id, _), _| remaining.contains(id));
        self.discovery.lock().retain(|(id, _), _| remaining.contains(id));
    }

    pub fn len(&self) -> usize {
        self.stats.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
