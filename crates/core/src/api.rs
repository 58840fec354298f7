use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::model::{AgentIdentity, Module, ScanSettings};
use crate::results::ScanResult;
use crate::util::EpochMs;

/// Protocol level agents must present. Anything else is rejected.
pub const COMPATIBILITY_LEVEL: i32 = 2;

/// Error sentinel returned when the scope secret is unknown.
pub const ERR_INVALID_SECRET: &str = "invalid secret";
/// Error sentinel returned when the agent speaks another protocol level.
pub const ERR_INCOMPATIBLE: &str = "incompatible agent";
/// Opaque error returned for any internal failure.
pub const ERR_INTERNAL: &str = "internal error";

/// Agent request for new scan tasks.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RequestScanTasksArgs {
    pub compatibility_level: i32,
    pub name: String,
    pub host: String,
    #[serde(default)]
    pub ip: String,
    #[serde(default)]
    pub shared: bool,
    #[serde(default)]
    pub limits: bool,
    pub scope_secret: String,
    #[serde(default)]
    pub modules: Vec<ModuleData>,
    #[serde(default)]
    pub system: SystemData,
}

impl RequestScanTasksArgs {
    pub fn identity(&self) -> AgentIdentity {
        AgentIdentity {
            name: self.name.clone(),
            host: self.host.clone(),
        }
    }
}

/// Agent's view of one of its scan modules.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModuleData {
    pub label: String,
    #[serde(default)]
    pub max_instances: i32,
    #[serde(default)]
    pub total_instances: i32,
    #[serde(default)]
    pub scope_instances: i32,
    #[serde(default)]
    pub active_tasks: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct SystemData {
    pub cpu_rate: f64,
    pub memory_rate: f64,
    pub platform: String,
    pub platform_family: String,
    pub platform_version: String,
}

/// A unit of work handed to an agent.
///
/// For discovery tasks `id` is the discovery input id and `target` the raw
/// input. For submodule tasks `id` is the broker-local task id.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Task {
    pub secret: String,
    pub label: Module,
    pub id: u64,
    pub target: String,
    #[serde(default)]
    pub protocol: String,
    #[serde(default)]
    pub port: u16,
    #[serde(default)]
    pub other_names: Vec<String>,
    #[serde(default)]
    pub service: String,
    #[serde(default)]
    pub service_product: String,
    pub settings: ScanSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct RequestScanTasksReply {
    pub tasks: Vec<Task>,
}

/// Agent submission of a finished scan.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SubmitScanResultArgs {
    pub name: String,
    pub host: String,
    #[serde(default)]
    pub ip: String,
    pub scope_secret: String,
    pub id: u64,
    pub result: ScanResult,
}

/// Error body returned by the broker's HTTP endpoints.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorBody {
    pub error: String,
}

// ---------------------------------------------------------------------------
// Manager API
// ---------------------------------------------------------------------------

/// `GetScopeFull` request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResolveScopeRequest {
    pub secret: String,
}

/// Scope change pushed by the manager.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ScopeNotification {
    #[serde(default)]
    pub update_scope_ids: Vec<u64>,
    #[serde(default)]
    pub remaining_scope_ids: Vec<u64>,
}

impl ScopeNotification {
    /// Whether a cached scope with `id` must be dropped.
    pub fn evicts(&self, id: u64) -> bool {
        self.update_scope_ids.contains(&id) || !self.remaining_scope_ids.contains(&id)
    }
}

/// One agent's aggregated report, as pushed to the manager.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct AgentStatsRecord {
    pub name: String,
    pub host: String,
    pub ip: String,
    pub shared: bool,
    pub limits: bool,
    pub last_seen: EpochMs,
    /// Active tasks per module label.
    pub tasks: BTreeMap<String, i32>,
    pub cpu_rate: f64,
    pub memory_rate: f64,
    pub platform: String,
    pub platform_family: String,
    pub platform_version: String,
}

/// `UpdateAgents` payload: scope id to that scope's agents.
pub type AgentUpdate = BTreeMap<u64, Vec<AgentStatsRecord>>;
