use std::fmt;
use std::str::FromStr;

use chrono::{NaiveTime, Weekday};
use serde::{Deserialize, Serialize};

/// Scan statuses written to `scan_status` columns and reported by agents.
pub mod status {
    pub const RUNNING: &str = "Running";
    pub const COMPLETED: &str = "Completed";
    pub const FAILED: &str = "Failed";
    pub const SKIPPED: &str = "Skipped";
    pub const NOT_REACHABLE: &str = "Not reachable";
    pub const DEADLINE: &str = "Deadline reached";
}

/// Scan module an agent can run. `Discovery` feeds every other module.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum Module {
    Discovery,
    Banner,
    Nfs,
    Smb,
    Ssh,
    Ssl,
    Webcrawler,
    Webenum,
}

impl Module {
    /// Every module that is fed from the broker-local queue.
    pub const SUBMODULES: [Module; 7] = [
        Module::Banner,
        Module::Nfs,
        Module::Smb,
        Module::Ssh,
        Module::Ssl,
        Module::Webcrawler,
        Module::Webenum,
    ];

    pub fn label(self) -> &'static str {
        match self {
            Module::Discovery => "discovery",
            Module::Banner => "banner",
            Module::Nfs => "nfs",
            Module::Smb => "smb",
            Module::Ssh => "ssh",
            Module::Ssl => "ssl",
            Module::Webcrawler => "webcrawler",
            Module::Webenum => "webenum",
        }
    }

    pub fn is_submodule(self) -> bool {
        self != Module::Discovery
    }
}

impl fmt::Display for Module {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown module label '{0}'")]
pub struct UnknownModule(pub String);

impl FromStr for Module {
    type Err = UnknownModule;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "discovery" => Ok(Module::Discovery),
            "banner" => Ok(Module::Banner),
            "nfs" => Ok(Module::Nfs),
            "smb" => Ok(Module::Smb),
            "ssh" => Ok(Module::Ssh),
            "ssl" => Ok(Module::Ssl),
            "webcrawler" => Ok(Module::Webcrawler),
            "webenum" => Ok(Module::Webenum),
            other => Err(UnknownModule(other.to_string())),
        }
    }
}

/// Scope metadata as confirmed by the manager.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Scope {
    /// Stable id. Zero means the manager did not recognise the secret.
    pub id: u64,
    pub name: String,
    pub secret: String,
    pub enabled: bool,

    /// Whether a new cycle starts once the current one completes.
    #[serde(default)]
    pub cycles: bool,
    #[serde(default)]
    pub cycles_retention: i32,
    #[serde(default)]
    pub cycle: u32,

    /// Database server holding the scope store.
    pub db_server_id: u64,
    /// Database name of the scope store on that server.
    pub db_name: String,

    #[serde(default)]
    pub settings: ScanSettings,
}

/// Per-scope scan configuration handed to agents with every task.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ScanSettings {
    pub max_instances_discovery: u32,
    pub max_instances_banner: u32,
    pub max_instances_nfs: u32,
    pub max_instances_smb: u32,
    pub max_instances_ssh: u32,
    pub max_instances_ssl: u32,
    pub max_instances_webcrawler: u32,
    pub max_instances_webenum: u32,

    pub sensitive_ports: Vec<u16>,

    pub discovery_time_earliest: NaiveTime,
    pub discovery_time_latest: NaiveTime,
    pub discovery_skip_days: Vec<Weekday>,
    pub discovery_nmap_args: String,
    pub discovery_exclude_domains: Vec<String>,

    pub nfs_scan_timeout_minutes: u32,
    pub nfs_depth: u32,
    pub nfs_threads: u32,
    pub nfs_exclude_shares: Vec<String>,

    pub smb_scan_timeout_minutes: u32,
    pub smb_depth: u32,
    pub smb_threads: u32,
    pub smb_exclude_shares: Vec<String>,

    pub ssh_scan_timeout_minutes: u32,

    pub ssl_scan_timeout_minutes: u32,

    pub webcrawler_scan_timeout_minutes: u32,
    pub webcrawler_depth: u32,
    pub webcrawler_max_threads: u32,
    pub webcrawler_follow_query_strings: bool,

    pub webenum_scan_timeout_minutes: u32,
    pub webenum_probe_robots: bool,
}

impl Default for ScanSettings {
    fn default() -> Self {
        Self {
            max_instances_discovery: 0,
            max_instances_banner: 0,
            max_instances_nfs: 0,
            max_instances_smb: 0,
            max_instances_ssh: 0,
            max_instances_ssl: 0,
            max_instances_webcrawler: 0,
            max_instances_webenum: 0,
            sensitive_ports: Vec::new(),
            discovery_time_earliest: NaiveTime::MIN,
            discovery_time_latest: NaiveTime::MIN,
            discovery_skip_days: Vec::new(),
            discovery_nmap_args: "-Pn -sS -sV -O --top-ports 1000".to_string(),
            discovery_exclude_domains: Vec::new(),
            nfs_scan_timeout_minutes: 60,
            nfs_depth: 1,
            nfs_threads: 5,
            nfs_exclude_shares: Vec::new(),
            smb_scan_timeout_minutes: 60,
            smb_depth: 1,
            smb_threads: 5,
            smb_exclude_shares: Vec::new(),
            ssh_scan_timeout_minutes: 20,
            ssl_scan_timeout_minutes: 60,
            webcrawler_scan_timeout_minutes: 120,
            webcrawler_depth: 1,
            webcrawler_max_threads: 5,
            webcrawler_follow_query_strings: false,
            webenum_scan_timeout_minutes: 120,
            webenum_probe_robots: true,
        }
    }
}

impl ScanSettings {
    /// Configured concurrent instances of `module` per agent. Zero disables it.
    pub fn max_instances(&self, module: Module) -> u32 {
        match module {
            Module::Discovery => self.max_instances_discovery,
            Module::Banner => self.max_instances_banner,
            Module::Nfs => self.max_instances_nfs,
            Module::Smb => self.max_instances_smb,
            Module::Ssh => self.max_instances_ssh,
            Module::Ssl => self.max_instances_ssl,
            Module::Webcrawler => self.max_instances_webcrawler,
            Module::Webenum => self.max_instances_webenum,
        }
    }

    pub fn is_enabled(&self, module: Module) -> bool {
        self.max_instances(module) > 0
    }

    /// Scope-configured scan timeout of a submodule. Banner and discovery have
    /// none; their timeouts are derived elsewhere.
    pub fn timeout_minutes(&self, module: Module) -> Option<u32> {
        match module {
            Module::Discovery | Module::Banner => None,
            Module::Nfs => Some(self.nfs_scan_timeout_minutes),
            Module::Smb => Some(self.smb_scan_timeout_minutes),
            Module::Ssh => Some(self.ssh_scan_timeout_minutes),
            Module::Ssl => Some(self.ssl_scan_timeout_minutes),
            Module::Webcrawler => Some(self.webcrawler_scan_timeout_minutes),
            Module::Webenum => Some(self.webenum_scan_timeout_minutes),
        }
    }

    pub fn is_sensitive_port(&self, port: u16) -> bool {
        self.sensitive_ports.contains(&port)
    }
}

/// Identifies an agent instance. The IP is informational only.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AgentIdentity {
    pub name: String,
    pub host: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn module_labels_round_trip_through_from_str() {
        for m in Module::SUBMODULES.iter().copied().chain([Module::Discovery]) {
            assert_eq!(m.label().parse::<Module>(), Ok(m));
        }
        assert!("ftp".parse::<Module>().is_err());
    }

    #[test]
    fn zero_instances_disables_module() {
        let mut s = ScanSettings::default();
        assert!(!s.is_enabled(Module::Ssh));
        s.max_instances_ssh = 2;
        assert!(s.is_enabled(Module::Ssh));
        assert_eq!(s.timeout_minutes(Module::Banner), None);
        assert_eq!(s.timeout_minutes(Module::Ssh), Some(20));
    }
}
