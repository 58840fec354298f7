use anyhow::{bail, Result};
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use scanbroker_core::derive::ServiceHit;
use scanbroker_core::hours::TzRange;
use scanbroker_core::model::status;
use scanbroker_core::results::{DiscoveryHost, DiscoveryResult, DiscoveryService};
use scanbroker_core::sanitize::sanitize;
use scanbroker_core::EpochMs;

use super::{flag, int, list, opt_int, text, DiscoveryOutcome};
use crate::db::{insert_batched, insert_batched_returning_ids};

/// A discovery target handed to an agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryInput {
    pub id: i64,
    pub input: String,
}

/// Counters the cycle coordinator decides on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CycleState {
    pub total: i64,
    /// Enabled inputs not yet dispensed.
    pub unstarted: i64,
    /// Enabled inputs without a finish time.
    pub unfinished: i64,
}

pub(super) fn claim(
    conn: &mut Connection,
    n: usize,
    ranges: &[TzRange],
    now: EpochMs,
    agent_ip: &str,
    agent_host: &str,
) -> Result<Vec<DiscoveryInput>> {
    if n == 0 || ranges.is_empty() {
        return Ok(Vec::new());
    }

    let tz_filter = vec!["timezone BETWEEN ? AND ?"; ranges.len()].join(" OR ");
    let sql = format!(
        "SELECT id, input FROM t_discovery \
         WHERE scan_started IS NULL AND enabled = 1 AND ({tz_filter}) \
         ORDER BY priority DESC, RANDOM() LIMIT ?"
    );
    let mut args: Vec<Value> = Vec::with_capacity(ranges.len() * 2 + 1);
    for r in ranges {
        args.push(Value::Real(r.from as f64));
        args.push(Value::Real(r.to as f64));
    }
    args.push(Value::Integer(n as i64));

    let tx = conn.transaction()?;
    let selected = {
        let mut stmt = tx.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(args), |r| {
            Ok(DiscoveryInput {
                id: r.get(0)?,
                input: r.get(1)?,
            })
        })?;
        rows.collect::<rusqlite::Result<Vec<_>>>()?
    };

    {
        let mut block = tx.prepare_cached(
            "UPDATE t_discovery \
             SET scan_started = ?1, scan_finished = NULL, scan_status = ?2, \
                 scan_ip = ?3, scan_hostname = ?4 \
             WHERE id = ?5 AND scan_started IS NULL",
        )?;
        for input in &selected {
            let changed = block.execute(params![now, status::RUNNING, agent_ip, agent_host, input.id])?;
            if changed != 1 {
                bail!("discovery input {} changed while being blocked", input.id);
            }
        }
    }

    tx.commit()?;
    Ok(selected)
}

pub(super) fn cycle_state(conn: &Connection) -> Result<CycleState> {
    Ok(conn.query_row(
        "SELECT COUNT(*), \
                COALESCE(SUM(enabled = 1 AND scan_started IS NULL), 0), \
                COALESCE(SUM(enabled = 1 AND scan_finished IS NULL), 0) \
         FROM t_discovery",
        [],
        |r| {
            Ok(CycleState {
                total: r.get(0)?,
                unstarted: r.get(1)?,
                unfinished: r.get(2)?,
            })
        },
    )?)
}

/// Fails running inputs that exceeded their expected duration: one host
/// timeout per hostgroup of the input, plus slack.
pub(super) fn clean_exceeded(
    conn: &mut Connection,
    min_hostgroup: u32,
    host_timeout_minutes: u32,
    slack_minutes: u32,
    now: EpochMs,
) -> Result<usize> {
    let tx = conn.transaction()?;
    let n = tx.execute(
        "UPDATE t_discovery \
         SET scan_finished = ?1, scan_status = ?2, priority = 0 \
         WHERE scan_started IS NOT NULL AND scan_finished IS NULL \
           AND scan_started < ?1 - ((((MAX(input_size, 1) + ?3 - 1) / ?3) * ?4) + ?5) * 60000",
        params![
            now,
            status::FAILED,
            min_hostgroup.max(1) as i64,
            host_timeout_minutes as i64,
            slack_minutes as i64
        ],
    )?;
    tx.commit()?;
    Ok(n)
}

/// Rewrites nmap's service/tunnel pair into a single service name.
pub fn rationalize_service(service: &str, tunnel: &str) -> String {
    if service.contains("https") || service == tunnel {
        service.to_string()
    } else if tunnel == "ssl" && service == "http" {
        "https".to_string()
    } else if !tunnel.is_empty() {
        format!("{tunnel}/{service}")
    } else {
        service.to_string()
    }
}

struct InputRow {
    input: String,
    input_size: i64,
    timezone: f64,
    company: String,
    department: String,
    manager: String,
    contact: String,
    comment: String,
    scan_started: Option<EpochMs>,
    scan_ip: String,
    scan_hostname: String,
}

fn load_input(conn: &Connection, id: i64) -> Result<Option<InputRow>> {
    Ok(conn
        .query_row(
            "SELECT input, input_size, timezone, input_company, input_department, input_manager, \
                    input_contact, input_comment, scan_started, scan_ip, scan_hostname \
             FROM t_discovery WHERE id = ?1",
            [id],
            |r| {
                Ok(InputRow {
                    input: r.get(0)?,
                    input_size: r.get(1)?,
                    timezone: r.get(2)?,
                    company: r.get(3)?,
                    department: r.get(4)?,
                    manager: r.get(5)?,
                    contact: r.get(6)?,
                    comment: r.get(7)?,
                    scan_started: r.get(8)?,
                    scan_ip: r.get(9)?,
                    scan_hostname: r.get(10)?,
                })
            },
        )
        .optional()?)
}

const HOST_COLUMNS: [&str; 36] = [
    "id_t_discovery",
    "address",
    "ip",
    "dns_name",
    "other_names",
    "other_ips",
    "critical",
    "os_guess",
    "os_smb",
    "os_last_boot",
    "os_uptime",
    "os_admin_users",
    "os_rdp_users",
    "ad_name",
    "ad_distinguished_name",
    "ad_os",
    "ad_os_version",
    "ad_description",
    "ad_managed_by",
    "ad_created",
    "ad_last_logon",
    "ad_critical_object",
    "input",
    "input_size",
    "timezone",
    "input_company",
    "input_department",
    "input_manager",
    "input_contact",
    "input_comment",
    "scan_cycle",
    "scan_started",
    "scan_finished",
    "scan_status",
    "scan_ip",
    "scan_hostname",
];

const SERVICE_COLUMNS: [&str; 27] = [
    "id_t_discovery_host",
    "id_t_discovery",
    "address",
    "ip",
    "dns_name",
    "other_names",
    "critical",
    "os_guess",
    "protocol",
    "port",
    "service",
    "service_product",
    "service_version",
    "service_device_type",
    "service_cpes",
    "service_tunnel",
    "service_extra_info",
    "input",
    "timezone",
    "input_company",
    "input_department",
    "scan_cycle",
    "scan_started",
    "scan_finished",
    "scan_status",
    "scan_ip",
    "scan_hostname",
];

const SCRIPT_COLUMNS: [&str; 9] = [
    "id_t_discovery_host",
    "id_t_discovery_service",
    "address",
    "ip",
    "port",
    "name",
    "output",
    "scan_cycle",
    "scan_finished",
];

/// Values every row of one result shares.
struct ScanColumns<'a> {
    discovery_id: i64,
    input: &'a InputRow,
    cycle: u32,
    now: EpochMs,
    status: String,
}

/// Per-host values reused by its services and scripts.
struct HostColumns {
    address: String,
    ip: String,
    dns_name: String,
    critical: bool,
    os_guess: String,
}

impl HostColumns {
    fn new(host: &DiscoveryHost) -> Self {
        let dns_name = sanitize(host.dns_name.trim()).into_owned();
        let ip = sanitize(host.ip.trim()).into_owned();
        let address = if dns_name.is_empty() { ip.clone() } else { dns_name.clone() };
        let critical = host.critical || host.ad.as_ref().is_some_and(|ad| ad.critical_object);
        Self {
            address,
            ip,
            dns_name,
            critical,
            os_guess: sanitize(&host.os_guess).into_owned(),
        }
    }
}

fn host_row(scan: &ScanColumns<'_>, cols: &HostColumns, host: &DiscoveryHost) -> Vec<Value> {
    let ad = host.ad.clone().unwrap_or_default();
    let last_boot = host
        .os_last_boot
        .or_else(|| host.os_uptime.map(|minutes| scan.now - minutes * 60_000));
    vec![
        int(scan.discovery_id),
        Value::Text(cols.address.clone()),
        Value::Text(cols.ip.clone()),
        Value::Text(cols.dns_name.clone()),
        list(&host.other_names),
        list(&host.other_ips),
        flag(cols.critical),
        Value::Text(cols.os_guess.clone()),
        text(&host.os_smb),
        opt_int(last_boot),
        opt_int(host.os_uptime),
        list(&host.os_admin_users),
        list(&host.os_rdp_users),
        text(&ad.name),
        text(&ad.distinguished_name),
        text(&ad.os),
        text(&ad.os_version),
        text(&ad.description),
        text(&ad.managed_by),
        opt_int(ad.created),
        opt_int(ad.last_logon),
        flag(ad.critical_object),
        text(&scan.input.input),
        int(scan.input.input_size),
        Value::Real(scan.input.timezone),
        text(&scan.input.company),
        text(&scan.input.department),
        text(&scan.input.manager),
        text(&scan.input.contact),
        text(&scan.input.comment),
        int(scan.cycle),
        opt_int(scan.input.scan_started),
        int(scan.now),
        Value::Text(scan.status.clone()),
        text(&scan.input.scan_ip),
        text(&scan.input.scan_hostname),
    ]
}

fn service_row(
    scan: &ScanColumns<'_>,
    cols: &HostColumns,
    host: &DiscoveryHost,
    host_id: i64,
    svc: &DiscoveryService,
    service_name: &str,
) -> Vec<Value> {
    vec![
        int(host_id),
        int(scan.discovery_id),
        Value::Text(cols.address.clone()),
        Value::Text(cols.ip.clone()),
        Value::Text(cols.dns_name.clone()),
        list(&host.other_names),
        flag(cols.critical),
        Value::Text(cols.os_guess.clone()),
        text(&svc.protocol.to_ascii_lowercase()),
        int(svc.port),
        text(service_name),
        text(&svc.product),
        text(&svc.version),
        text(&svc.device_type),
        list(&svc.cpes),
        text(&svc.tunnel),
        text(&svc.extra_info),
        text(&scan.input.input),
        Value::Real(scan.input.timezone),
        text(&scan.input.company),
        text(&scan.input.department),
        int(scan.cycle),
        opt_int(scan.input.scan_started),
        int(scan.now),
        Value::Text(scan.status.clone()),
        text(&scan.input.scan_ip),
        text(&scan.input.scan_hostname),
    ]
}

pub(super) fn persist(
    conn: &mut Connection,
    discovery_id: i64,
    result: &DiscoveryResult,
    now: EpochMs,
    cycle: u32,
) -> Result<DiscoveryOutcome> {
    let tx = conn.transaction()?;

    let input = match load_input(&tx, discovery_id)? {
        Some(row) if row.scan_started.is_some() => row,
        _ => return Ok(DiscoveryOutcome::Vanished),
    };
    if result.exception {
        return Ok(DiscoveryOutcome::Exception);
    }

    let scan = ScanColumns {
        discovery_id,
        input: &input,
        cycle,
        now,
        status: sanitize(&result.status).into_owned(),
    };

    // Hosts first, then services, then scripts, each in bounded batches.
    let kept: Vec<(&DiscoveryHost, HostColumns)> = result
        .data
        .iter()
        .filter(|h| !(h.ip.trim().is_empty() && h.dns_name.trim().is_empty()))
        .map(|h| (h, HostColumns::new(h)))
        .collect();
    let host_rows: Vec<Vec<Value>> = kept.iter().map(|(h, cols)| host_row(&scan, cols, h)).collect();
    let host_ids = insert_batched_returning_ids(&tx, "INSERT INTO t_discovery_host", &HOST_COLUMNS, &host_rows)?;

    let mut services: Vec<(&DiscoveryHost, &HostColumns, i64, &DiscoveryService, String)> = Vec::new();
    for ((host, cols), host_id) in kept.iter().zip(&host_ids) {
        for svc in &host.services {
            services.push((*host, cols, *host_id, svc, rationalize_service(&svc.service, &svc.tunnel)));
        }
    }
    let service_rows: Vec<Vec<Value>> = services
        .iter()
        .map(|(host, cols, host_id, svc, name)| service_row(&scan, cols, host, *host_id, svc, name))
        .collect();
    let service_ids =
        insert_batched_returning_ids(&tx, "INSERT INTO t_discovery_service", &SERVICE_COLUMNS, &service_rows)?;

    let mut hits = Vec::with_capacity(services.len());
    let mut scripts: Vec<Vec<Value>> = Vec::new();
    for ((host, cols, host_id, svc, name), service_id) in services.iter().zip(&service_ids) {
        hits.push(ServiceHit {
            service_id: *service_id,
            address: cols.address.clone(),
            ip: cols.ip.clone(),
            dns_name: cols.dns_name.clone(),
            other_names: host.other_names.iter().map(|n| sanitize(n).into_owned()).collect(),
            protocol: svc.protocol.to_ascii_lowercase(),
            port: svc.port,
            service: sanitize(name).into_owned(),
            service_product: sanitize(&svc.product).into_owned(),
        });
        for script in &svc.scripts {
            scripts.push(vec![
                int(*host_id),
                int(*service_id),
                Value::Text(cols.address.clone()),
                Value::Text(cols.ip.clone()),
                int(svc.port),
                text(&script.name),
                text(&script.output),
                int(cycle),
                int(now),
            ]);
        }
    }
    for ((host, cols), host_id) in kept.iter().zip(&host_ids) {
        for script in &host.host_scripts {
            scripts.push(vec![
                int(*host_id),
                Value::Null,
                Value::Text(cols.address.clone()),
                Value::Text(cols.ip.clone()),
                Value::Null,
                text(&script.name),
                text(&script.output),
                int(cycle),
                int(now),
            ]);
        }
    }
    insert_batched(&tx, "INSERT INTO t_discovery_script", &SCRIPT_COLUMNS, &scripts)?;

    tx.execute(
        "UPDATE t_discovery \
         SET scan_finished = ?1, scan_status = ?2, priority = 0, scan_count = scan_count + 1 \
         WHERE id = ?3",
        params![now, scan.status, discovery_id],
    )?;

    tx.commit()?;
    Ok(DiscoveryOutcome::Stored(hits))
}
