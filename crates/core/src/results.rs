//! Scan result payloads, one variant per module.
//!
//! The wire form is an explicit tagged union:
//! `{"label": "banner", "result": {...}}`.

use serde::{Deserialize, Serialize};

use crate::model::Module;
use crate::util::EpochMs;

/// Result submitted by an agent for a previously dispensed task.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "label", content = "result", rename_all = "snake_case")]
pub enum ScanResult {
    Discovery(DiscoveryResult),
    Banner(BannerResult),
    Nfs(NfsResult),
    Smb(SmbResult),
    Ssh(SshResult),
    Ssl(SslResult),
    Webcrawler(WebcrawlerResult),
    Webenum(WebenumResult),
}

impl ScanResult {
    pub fn module(&self) -> Module {
        match self {
            ScanResult::Discovery(_) => Module::Discovery,
            ScanResult::Banner(_) => Module::Banner,
            ScanResult::Nfs(_) => Module::Nfs,
            ScanResult::Smb(_) => Module::Smb,
            ScanResult::Ssh(_) => Module::Ssh,
            ScanResult::Ssl(_) => Module::Ssl,
            ScanResult::Webcrawler(_) => Module::Webcrawler,
            ScanResult::Webenum(_) => Module::Webenum,
        }
    }

    pub fn status(&self) -> &str {
        match self {
            ScanResult::Discovery(r) => &r.status,
            ScanResult::Banner(r) => &r.status,
            ScanResult::Nfs(r) => &r.status,
            ScanResult::Smb(r) => &r.status,
            ScanResult::Ssh(r) => &r.status,
            ScanResult::Ssl(r) => &r.status,
            ScanResult::Webcrawler(r) => &r.status,
            ScanResult::Webenum(r) => &r.status,
        }
    }

    /// True if the scan module reported an internal failure.
    pub fn exception(&self) -> bool {
        match self {
            ScanResult::Discovery(r) => r.exception,
            ScanResult::Banner(r) => r.exception,
            ScanResult::Nfs(r) => r.exception,
            ScanResult::Smb(r) => r.exception,
            ScanResult::Ssh(r) => r.exception,
            ScanResult::Ssl(r) => r.exception,
            ScanResult::Webcrawler(r) => r.exception,
            ScanResult::Webenum(r) => r.exception,
        }
    }
}

// ---------------------------------------------------------------------------
// Discovery
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct DiscoveryResult {
    pub status: String,
    #[serde(default)]
    pub exception: bool,
    #[serde(default)]
    pub data: Vec<DiscoveryHost>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct DiscoveryHost {
    pub ip: String,
    pub dns_name: String,
    pub other_names: Vec<String>,
    pub other_ips: Vec<String>,

    pub os_guess: String,
    pub os_smb: String,
    /// Uptime in minutes, if the scan could determine it.
    pub os_uptime: Option<i64>,
    pub os_last_boot: Option<EpochMs>,
    pub os_admin_users: Vec<String>,
    pub os_rdp_users: Vec<String>,

    pub critical: bool,
    pub ad: Option<AdInfo>,

    pub services: Vec<DiscoveryService>,
    pub host_scripts: Vec<ScriptOutput>,
}

/// Active Directory record of a discovered host.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct AdInfo {
    pub name: String,
    pub distinguished_name: String,
    pub os: String,
    pub os_version: String,
    pub description: String,
    pub managed_by: String,
    pub created: Option<EpochMs>,
    pub last_logon: Option<EpochMs>,
    pub critical_object: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct DiscoveryService {
    pub port: u16,
    pub protocol: String,
    pub service: String,
    pub product: String,
    pub version: String,
    pub device_type: String,
    pub cpes: Vec<String>,
    pub tunnel: String,
    pub extra_info: String,
    pub scripts: Vec<ScriptOutput>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct ScriptOutput {
    pub name: String,
    pub output: String,
}

// ---------------------------------------------------------------------------
// Submodules
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct BannerResult {
    pub status: String,
    #[serde(default)]
    pub exception: bool,
    #[serde(default)]
    pub data: Banner,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Banner {
    pub plain: String,
    pub hex: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct NfsResult {
    pub status: String,
    #[serde(default)]
    pub exception: bool,
    #[serde(default)]
    pub data: Vec<FileEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct SmbResult {
    pub status: String,
    #[serde(default)]
    pub exception: bool,
    #[serde(default)]
    pub data: Vec<FileEntry>,
}

/// A file or folder found on a network share.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct FileEntry {
    pub share: String,
    pub path: String,
    pub name: String,
    pub is_dir: bool,
    pub size: i64,
    pub last_modified: Option<EpochMs>,
    pub flags: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct SshResult {
    pub status: String,
    #[serde(default)]
    pub exception: bool,
    #[serde(default)]
    pub data: SshInfo,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct SshInfo {
    pub server_banner: String,
    pub protocol_version: String,
    pub auth_methods: Vec<String>,
    pub kex_algorithms: Vec<String>,
    pub host_key_algorithms: Vec<String>,
    pub encryption_algorithms: Vec<String>,
    pub mac_algorithms: Vec<String>,
    pub compression_algorithms: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct SslResult {
    pub status: String,
    #[serde(default)]
    pub exception: bool,
    #[serde(default)]
    pub data: Vec<SslTarget>,
}

/// TLS findings for one vhost/sni of the scanned endpoint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct SslTarget {
    pub vhost: String,
    pub issues: SslIssues,
    pub certificates: Vec<SslCertificate>,
    pub ciphers: Vec<SslCipher>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct SslIssues {
    pub any_chain_invalid: bool,
    pub any_chain_invalid_order: bool,
    pub lowest_protocol: String,
    pub min_strength: i32,
    pub insecure_renegotiation: bool,
    pub accepts_client_renegotiation: bool,
    pub no_perfect_forward_secrecy: bool,
    pub compression_supported: bool,
    pub tls_fallback_scsv_missing: bool,
    pub heartbleed: bool,
    pub ccs_injection: bool,
    pub early_data_supported: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct SslCertificate {
    pub deployment_id: i32,
    pub subject: String,
    pub issuer: String,
    pub serial: String,
    pub alternative_names: Vec<String>,
    pub valid_from: Option<EpochMs>,
    pub valid_to: Option<EpochMs>,
    pub public_key_algorithm: String,
    pub public_key_bits: i32,
    pub signature_algorithm: String,
    pub is_ca: bool,
    pub validated_by_os: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct SslCipher {
    pub protocol: String,
    pub cipher_id: String,
    pub name: String,
    pub key_exchange: String,
    pub key_exchange_bits: i32,
    pub authentication: String,
    pub encryption: String,
    pub encryption_bits: i32,
    pub mac: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct WebcrawlerResult {
    pub status: String,
    #[serde(default)]
    pub exception: bool,
    #[serde(default)]
    pub data: Vec<WebcrawlerVhost>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct WebcrawlerVhost {
    pub vhost: String,
    pub status: String,
    pub pages: Vec<WebcrawlerPage>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct WebcrawlerPage {
    pub depth: i32,
    pub url: String,
    pub redirect_url: String,
    pub auth_method: String,
    pub auth_success: bool,
    pub response_code: i32,
    pub response_message: String,
    pub response_content_type: String,
    pub response_content_length: i64,
    pub html_title: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct WebenumResult {
    pub status: String,
    #[serde(default)]
    pub exception: bool,
    #[serde(default)]
    pub data: Vec<WebenumEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct WebenumEntry {
    pub name: String,
    pub url: String,
    pub redirect_url: String,
    pub auth_method: String,
    pub auth_success: bool,
    pub response_code: i32,
    pub response_message: String,
    pub response_content_type: String,
    pub html_title: String,
}
