use anyhow::{bail, Result};
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Transaction};
use scanbroker_core::model::{status, Module};
use scanbroker_core::results::{FileEntry, ScanResult, SslTarget, WebcrawlerResult, WebenumEntry};
use scanbroker_core::sanitize::sanitize;
use scanbroker_core::EpochMs;
use tracing::debug;

use super::{flag, int, list, opt_int, text, SubmoduleOutcome};
use crate::db::{id_list, insert_batched, is_unique_violation};

/// Info table holding results of a submodule.
pub fn info_table(module: Module) -> Result<&'static str> {
    Ok(match module {
        Module::Banner => "t_banner",
        Module::Nfs => "t_nfs",
        Module::Smb => "t_smb",
        Module::Ssh => "t_ssh",
        Module::Ssl => "t_ssl",
        Module::Webcrawler => "t_webcrawler",
        Module::Webenum => "t_webenum",
        Module::Discovery => bail!("discovery has no info table"),
    })
}

/// Status stored for a webcrawler result: the distinct per-vhost statuses
/// when the crawl completed, the overall status otherwise.
pub fn webcrawler_status(result: &WebcrawlerResult) -> String {
    if result.status != status::COMPLETED {
        return result.status.clone();
    }
    let mut seen: Vec<&str> = Vec::new();
    for vhost in &result.data {
        let s = vhost.status.trim();
        if !s.is_empty() && !seen.contains(&s) {
            seen.push(s);
        }
    }
    if seen.is_empty() {
        result.status.clone()
    } else {
        seen.join(", ")
    }
}

fn prepare_sql(table: &str, filter: &str) -> String {
    format!(
        "INSERT INTO {table} (id_t_discovery_service, id_t_discovery_host, address, ip, dns_name, \
             other_names, critical, protocol, port, service, service_product, input, timezone, \
             scan_cycle, scan_started, scan_finished, scan_status, scan_ip, scan_hostname) \
         SELECT s.id, s.id_t_discovery_host, s.address, s.ip, s.dns_name, s.other_names, s.critical, \
             s.protocol, s.port, s.service, s.service_product, s.input, s.timezone, s.scan_cycle, \
             ?1, NULL, '{running}', ?2, ?3 \
         FROM t_discovery_service s WHERE {filter}",
        running = status::RUNNING,
    )
}

pub(super) fn prepare_rows(
    conn: &mut Connection,
    module: Module,
    service_ids: &[i64],
    started: EpochMs,
    agent_ip: &str,
    agent_host: &str,
) -> Result<usize> {
    let table = info_table(module)?;
    let ids = id_list(service_ids)?;

    let tx = conn.transaction()?;
    let bulk = tx.execute(
        &prepare_sql(table, "s.id IN (SELECT value FROM json_each(?4))"),
        params![started, agent_ip, agent_host, ids],
    );
    match bulk {
        Ok(n) => {
            tx.commit()?;
            return Ok(n);
        }
        Err(e) if is_unique_violation(&e) => drop(tx),
        Err(e) => return Err(e.into()),
    }

    // Some rows already exist; insert one by one and keep the existing ones.
    let tx = conn.transaction()?;
    let mut inserted = 0;
    {
        let mut stmt = tx.prepare(&prepare_sql(table, "s.id = ?4"))?;
        for id in service_ids {
            match stmt.execute(params![started, agent_ip, agent_host, id]) {
                Ok(n) => inserted += n,
                Err(e) if is_unique_violation(&e) => {
                    debug!(table, service_id = id, "info row already present");
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
    tx.commit()?;
    Ok(inserted)
}

pub(super) fn persist(
    conn: &mut Connection,
    module: Module,
    service_id: i64,
    result: &ScanResult,
    now: EpochMs,
) -> Result<SubmoduleOutcome> {
    if result.module() != module {
        bail!("{} result submitted for a {} task", result.module().label(), module.label());
    }
    let table = info_table(module)?;

    let tx = conn.transaction()?;
    let row: Option<(i64, Option<EpochMs>)> = tx
        .query_row(
            &format!("SELECT id, scan_finished FROM {table} WHERE id_t_discovery_service = ?1"),
            [service_id],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()?;
    let Some((info_id, finished)) = row else {
        return Ok(SubmoduleOutcome::Vanished);
    };

    let outcome = if finished.is_none() {
        if !result.exception() {
            write_payload(&tx, info_id, result)?;
        }
        let stored_status = match result {
            ScanResult::Webcrawler(r) => webcrawler_status(r),
            other => other.status().to_string(),
        };
        tx.execute(
            &format!("UPDATE {table} SET scan_status = ?1 WHERE id = ?2"),
            params![sanitize(&stored_status), info_id],
        )?;
        SubmoduleOutcome::Stored
    } else {
        SubmoduleOutcome::Late
    };

    tx.execute(
        &format!("UPDATE {table} SET scan_finished = ?1 WHERE id = ?2"),
        params![now, info_id],
    )?;
    tx.commit()?;
    Ok(outcome)
}

fn write_payload(tx: &Transaction<'_>, info_id: i64, result: &ScanResult) -> Result<()> {
    match result {
        ScanResult::Banner(r) => {
            tx.execute(
                "UPDATE t_banner SET banner_plain = ?1, banner_hex = ?2 WHERE id = ?3",
                params![sanitize(&r.data.plain), sanitize(&r.data.hex), info_id],
            )?;
        }
        ScanResult::Nfs(r) => write_files(tx, "t_nfs", info_id, &r.data)?,
        ScanResult::Smb(r) => write_files(tx, "t_smb", info_id, &r.data)?,
        ScanResult::Ssh(r) => {
            let d = &r.data;
            let values = vec![
                text(&d.server_banner),
                text(&d.protocol_version),
                list(&d.auth_methods),
                list(&d.kex_algorithms),
                list(&d.host_key_algorithms),
                list(&d.encryption_algorithms),
                list(&d.mac_algorithms),
                list(&d.compression_algorithms),
                int(info_id),
            ];
            tx.execute(
                "UPDATE t_ssh SET server_banner = ?, protocol_version = ?, auth_methods = ?, \
                     kex_algorithms = ?, host_key_algorithms = ?, encryption_algorithms = ?, \
                     mac_algorithms = ?, compression_algorithms = ? \
                 WHERE id = ?",
                params_from_iter(values),
            )?;
        }
        ScanResult::Ssl(r) => {
            for target in &r.data {
                write_ssl_target(tx, info_id, target)?;
            }
        }
        ScanResult::Webcrawler(r) => write_webcrawler(tx, info_id, r)?,
        ScanResult::Webenum(r) => write_webenum(tx, info_id, &r.data)?,
        ScanResult::Discovery(_) => bail!("discovery result has no info payload"),
    }
    Ok(())
}

const FILE_COLUMNS: [&str; 7] = ["share", "path", "name", "is_dir", "size", "last_modified", "flags"];

fn write_files(tx: &Transaction<'_>, table: &str, info_id: i64, files: &[FileEntry]) -> Result<()> {
    let parent = format!("id_{table}");
    let mut columns = vec![parent.as_str()];
    columns.extend(FILE_COLUMNS);
    let rows: Vec<Vec<Value>> = files
        .iter()
        .map(|f| {
            vec![
                int(info_id),
                text(&f.share),
                text(&f.path),
                text(&f.name),
                flag(f.is_dir),
                int(f.size),
                opt_int(f.last_modified),
                list(&f.flags),
            ]
        })
        .collect();
    insert_batched(tx, &format!("INSERT INTO {table}_file"), &columns, &rows)?;
    tx.execute(
        &format!("UPDATE {table} SET file_count = ?1 WHERE id = ?2"),
        params![files.len() as i64, info_id],
    )?;
    Ok(())
}

const SSL_ISSUE_COLUMNS: [&str; 14] = [
    "id_t_ssl",
    "vhost",
    "any_chain_invalid",
    "any_chain_invalid_order",
    "lowest_protocol",
    "min_strength",
    "insecure_renegotiation",
    "accepts_client_renegotiation",
    "no_perfect_forward_secrecy",
    "compression_supported",
    "tls_fallback_scsv_missing",
    "heartbleed",
    "ccs_injection",
    "early_data_supported",
];

const SSL_CERT_COLUMNS: [&str; 14] = [
    "id_t_ssl",
    "vhost",
    "deployment_id",
    "subject",
    "issuer",
    "serial",
    "alternative_names",
    "valid_from",
    "valid_to",
    "public_key_algorithm",
    "public_key_bits",
    "signature_algorithm",
    "is_ca",
    "validated_by_os",
];

const SSL_CIPHER_COLUMNS: [&str; 11] = [
    "id_t_ssl",
    "vhost",
    "protocol",
    "cipher_id",
    "name",
    "key_exchange",
    "key_exchange_bits",
    "authentication",
    "encryption",
    "encryption_bits",
    "mac",
];

fn write_ssl_target(tx: &Transaction<'_>, info_id: i64, target: &SslTarget) -> Result<()> {
    let vhost = text(&target.vhost);
    let i = &target.issues;
    let issue = vec![
        int(info_id),
        vhost.clone(),
        flag(i.any_chain_invalid),
        flag(i.any_chain_invalid_order),
        text(&i.lowest_protocol),
        int(i.min_strength),
        flag(i.insecure_renegotiation),
        flag(i.accepts_client_renegotiation),
        flag(i.no_perfect_forward_secrecy),
        flag(i.compression_supported),
        flag(i.tls_fallback_scsv_missing),
        flag(i.heartbleed),
        flag(i.ccs_injection),
        flag(i.early_data_supported),
    ];
    insert_batched(tx, "INSERT INTO t_ssl_issue", &SSL_ISSUE_COLUMNS, &[issue])?;

    let certs: Vec<Vec<Value>> = target
        .certificates
        .iter()
        .map(|c| {
            vec![
                int(info_id),
                vhost.clone(),
                int(c.deployment_id),
                text(&c.subject),
                text(&c.issuer),
                text(&c.serial),
                list(&c.alternative_names),
                opt_int(c.valid_from),
                opt_int(c.valid_to),
                text(&c.public_key_algorithm),
                int(c.public_key_bits),
                text(&c.signature_algorithm),
                flag(c.is_ca),
                flag(c.validated_by_os),
            ]
        })
        .collect();
    insert_batched(tx, "INSERT INTO t_ssl_certificate", &SSL_CERT_COLUMNS, &certs)?;

    let ciphers: Vec<Vec<Value>> = target
        .ciphers
        .iter()
        .map(|c| {
            vec![
                int(info_id),
                vhost.clone(),
                text(&c.protocol),
                text(&c.cipher_id),
                text(&c.name),
                text(&c.key_exchange),
                int(c.key_exchange_bits),
                text(&c.authentication),
                text(&c.encryption),
                int(c.encryption_bits),
                text(&c.mac),
            ]
        })
        .collect();
    insert_batched(tx, "INSERT INTO t_ssl_cipher", &SSL_CIPHER_COLUMNS, &ciphers)?;
    Ok(())
}

const PAGE_COLUMNS: [&str; 12] = [
    "id_t_webcrawler",
    "id_t_webcrawler_vhost",
    "depth",
    "url",
    "redirect_url",
    "auth_method",
    "auth_success",
    "response_code",
    "response_message",
    "response_content_type",
    "response_content_length",
    "html_title",
];

fn write_webcrawler(tx: &Transaction<'_>, info_id: i64, result: &WebcrawlerResult) -> Result<()> {
    for vhost in &result.data {
        tx.execute(
            "INSERT INTO t_webcrawler_vhost (id_t_webcrawler, vhost, status) VALUES (?1, ?2, ?3)",
            params![info_id, sanitize(&vhost.vhost), sanitize(&vhost.status)],
        )?;
        let vhost_id = tx.last_insert_rowid();
        let pages: Vec<Vec<Value>> = vhost
            .pages
            .iter()
            .map(|p| {
                vec![
                    int(info_id),
                    int(vhost_id),
                    int(p.depth),
                    text(&p.url),
                    text(&p.redirect_url),
                    text(&p.auth_method),
                    flag(p.auth_success),
                    int(p.response_code),
                    text(&p.response_message),
                    text(&p.response_content_type),
                    int(p.response_content_length),
                    text(&p.html_title),
                ]
            })
            .collect();
        insert_batched(tx, "INSERT INTO t_webcrawler_page", &PAGE_COLUMNS, &pages)?;
    }
    Ok(())
}

const WEBENUM_COLUMNS: [&str; 10] = [
    "id_t_webenum",
    "name",
    "url",
    "redirect_url",
    "auth_method",
    "auth_success",
    "response_code",
    "response_message",
    "response_content_type",
    "html_title",
];

fn write_webenum(tx: &Transaction<'_>, info_id: i64, entries: &[WebenumEntry]) -> Result<()> {
    let rows: Vec<Vec<Value>> = entries
        .iter()
        .map(|e| {
            vec![
                int(info_id),
                text(&e.name),
                text(&e.url),
                text(&e.redirect_url),
                text(&e.auth_method),
                flag(e.auth_success),
                int(e.response_code),
                text(&e.response_message),
                text(&e.response_content_type),
                text(&e.html_title),
            ]
        })
        .collect();
    insert_batched(tx, "INSERT INTO t_webenum_result", &WEBENUM_COLUMNS, &rows)?;
    Ok(())
}

/// Fails info rows of `module` still running since before `started_before`.
pub(super) fn clean_exceeded(
    conn: &mut Connection,
    module: Module,
    started_before: EpochMs,
    now: EpochMs,
) -> Result<usize> {
    let table = info_table(module)?;
    let tx = conn.transaction()?;
    let n = tx.execute(
        &format!(
            "UPDATE {table} SET scan_finished = ?1, scan_status = ?2 \
             WHERE scan_finished IS NULL AND scan_started IS NOT NULL AND scan_started < ?3"
        ),
        params![now, status::FAILED, started_before],
    )?;
    tx.commit()?;
    Ok(n)
}
