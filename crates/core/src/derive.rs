//! Turns discovered services into follow-up submodule tasks.

use std::collections::HashSet;

use crate::model::{Module, ScanSettings};

/// Ports on which a plain-text protocol may be upgraded via StartTLS.
pub const STARTTLS_PORTS: [u16; 13] = [
    21, 23, 25, 110, 119, 143, 389, 587, 3306, 3389, 5222, 5269, 5432,
];

/// A service row just committed to the scope store.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ServiceHit {
    /// Id of the row in `t_discovery_service`.
    pub service_id: i64,
    /// DNS name if known, IP otherwise.
    pub address: String,
    pub ip: String,
    pub dns_name: String,
    pub other_names: Vec<String>,
    pub protocol: String,
    pub port: u16,
    pub service: String,
    pub service_product: String,
}

/// A task to be staged in the broker-local queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DerivedTask {
    pub module: Module,
    pub service_id: i64,
    pub target: String,
    pub ip: String,
    pub dns_name: String,
    pub other_names: Vec<String>,
    pub protocol: String,
    pub port: u16,
    pub service: String,
    pub service_product: String,
}

/// Collects the addresses that expose 445/tcp within one discovery result.
pub fn addresses_with_445<'a>(hits: impl IntoIterator<Item = &'a ServiceHit>) -> HashSet<String> {
    hits.into_iter()
        .filter(|h| h.port == 445 && is_tcp(&h.protocol))
        .map(|h| h.address.clone())
        .collect()
}

/// Modules worth running against a single service. Only enabled modules are
/// returned, in module order.
pub fn modules_for(hit: &ServiceHit, settings: &ScanSettings, with_445: &HashSet<String>) -> Vec<Module> {
    if settings.is_sensitive_port(hit.port) || !is_tcp(&hit.protocol) {
        return Vec::new();
    }

    let service = hit.service.to_ascii_lowercase();
    let product = hit.service_product.to_ascii_lowercase();

    let mut out = Vec::new();
    let mut push = |m: Module| {
        if settings.is_enabled(m) {
            out.push(m);
        }
    };

    push(Module::Banner);

    if service.contains("nfs") || service.contains("mountd") {
        push(Module::Nfs);
    }

    if hit.port == 445 || (hit.port == 139 && !with_445.contains(&hit.address)) {
        push(Module::Smb);
    }

    if service.contains("ssh") {
        push(Module::Ssh);
    }

    let ssl = ["ssl", "tls", "https"].iter().any(|k| service.contains(k))
        || ["ssl", "tls"].iter().any(|k| product.contains(k))
        || STARTTLS_PORTS.contains(&hit.port);
    if ssl {
        push(Module::Ssl);
    }

    if service.contains("http") || product.contains("http") {
        push(Module::Webcrawler);
        push(Module::Webenum);
    }

    out
}

/// Derives every submodule task for the services of one discovery result.
pub fn derive_tasks(hits: &[ServiceHit], settings: &ScanSettings) -> Vec<DerivedTask> {
    let with_445 = addresses_with_445(hits);
    hits.iter()
        .flat_map(|hit| {
            modules_for(hit, settings, &with_445)
                .into_iter()
                .map(move |module| DerivedTask {
                    module,
                    service_id: hit.service_id,
                    target: hit.address.clone(),
                    ip: hit.ip.clone(),
                    dns_name: hit.dns_name.clone(),
                    other_names: hit.other_names.clone(),
                    protocol: hit.protocol.clone(),
                    port: hit.port,
                    service: hit.service.clone(),
                    service_product: hit.service_product.clone(),
                })
        })
        .collect()
}

fn is_tcp(protocol: &str) -> bool {
    protocol.eq_ignore_ascii_case("tcp")
}
