mod common;

use std::sync::Arc;
use std::time::Duration;

use common::*;
use scanbroker_core::api::RequestScanTasksArgs;
use scanbroker_core::derive::DerivedTask;
use scanbroker_core::model::{status, Module};
use scanbroker_daemon::error::ApiError;

#[tokio::test]
async fn unknown_secret_is_rejected_and_not_cached() {
    let h = harness();

    let err = h
        .broker
        .request_tasks(request("zzz-unknown", &[(Module::Discovery, 0)]))
        .await
        .unwrap_err();

    assert_eq!(err, ApiError::InvalidSecret);
    assert_eq!(err.to_string(), "invalid secret");
    assert!(h.broker.cache().is_empty());
    assert_eq!(h.manager.resolve_calls(), 1);
}

#[tokio::test]
async fn incompatible_agent_is_rejected_before_resolving() {
    let h = harness();
    let mut args = request("secret-a", &[]);
    args.compatibility_level = 1;

    let err = h.broker.request_tasks(args).await.unwrap_err();
    assert_eq!(err, ApiError::Incompatible);
    assert_eq!(h.manager.resolve_calls(), 0);
}

#[tokio::test]
async fn discovery_is_filtered_by_local_working_hours() {
    let h = harness();
    let a = scope(1, "secret-a");
    let path = h.add_scope(&a).await;

    let inside = seed_input(&path, "10.0.0.0/24", 1.0);
    let before_hours = seed_input(&path, "10.1.0.0/24", 0.0);
    let after_hours = seed_input(&path, "10.2.0.0/24", 9.0);

    let reply = h
        .broker
        .request_tasks(request("secret-a", &[(Module::Discovery, 0)]))
        .await
        .unwrap();

    assert_eq!(reply.tasks.len(), 1);
    let task = &reply.tasks[0];
    assert_eq!(task.label, Module::Discovery);
    assert_eq!(task.id, inside as u64);
    assert_eq!(task.target, "10.0.0.0/24");
    assert_eq!(task.secret, "secret-a");
    assert!(task.settings.discovery_nmap_args.starts_with("-Pn -sS --top-ports 100"));
    assert!(task.settings.discovery_nmap_args.contains("--min-hostgroup 64"));
    assert!(task.settings.discovery_nmap_args.contains("--host-timeout 720m"));

    let stamped = query_opt_i64(&path, &format!("SELECT scan_started FROM t_discovery WHERE id = {inside}"));
    assert_eq!(stamped, Some(h.now_ms()));
    assert_eq!(
        query_text(&path, &format!("SELECT scan_status FROM t_discovery WHERE id = {inside}")),
        status::RUNNING
    );
    assert_eq!(
        query_text(&path, &format!("SELECT scan_hostname FROM t_discovery WHERE id = {inside}")),
        "scanner-1"
    );
    for untouched in [before_hours, after_hours] {
        let started = query_opt_i64(&path, &format!("SELECT scan_started FROM t_discovery WHERE id = {untouched}"));
        assert_eq!(started, None);
    }

    // Claimed inputs are never handed out twice.
    let again = h
        .broker
        .request_tasks(request("secret-a", &[(Module::Discovery, 0)]))
        .await
        .unwrap();
    assert!(again.tasks.is_empty());
}

#[tokio::test]
async fn discovery_respects_free_capacity_and_priority() {
    let h = harness();
    let mut a = scope(1, "secret-a");
    a.settings.max_instances_discovery = 3;
    let path = h.add_scope(&a).await;

    for i in 0..5 {
        seed_input(&path, &format!("10.0.{i}.0/24"), 2.0);
    }
    execute(&path, "UPDATE t_discovery SET priority = 5 WHERE input = '10.0.4.0/24'");

    let busy = h
        .broker
        .request_tasks(request("secret-a", &[(Module::Discovery, 3)]))
        .await
        .unwrap();
    assert!(busy.tasks.is_empty());

    let reply = h
        .broker
        .request_tasks(request("secret-a", &[(Module::Discovery, 1)]))
        .await
        .unwrap();
    assert_eq!(reply.tasks.len(), 2);
    assert!(reply.tasks.iter().any(|t| t.target == "10.0.4.0/24"));
    assert_eq!(
        query_i64(&path, "SELECT COUNT(*) FROM t_discovery WHERE scan_started IS NOT NULL"),
        2
    );
}

#[tokio::test]
async fn weekend_skips_discovery() {
    let h = harness();
    let a = scope(1, "secret-a");
    let path = h.add_scope(&a).await;
    seed_input(&path, "10.0.0.0/24", 1.0);

    // Saturday, 10:00 UTC
    h.clock
        .set(chrono::TimeZone::with_ymd_and_hms(&chrono::Utc, 2024, 5, 4, 10, 0, 0).unwrap());
    let reply = h
        .broker
        .request_tasks(request("secret-a", &[(Module::Discovery, 0)]))
        .await
        .unwrap();
    assert!(reply.tasks.is_empty());
}

#[tokio::test]
async fn disabled_scope_yields_nothing_but_records_the_agent() {
    let h = harness();
    let mut a = scope(1, "secret-a");
    a.enabled = false;
    let path = h.add_scope(&a).await;
    seed_input(&path, "10.0.0.0/24", 1.0);

    let reply = h
        .broker
        .request_tasks(request("secret-a", &[(Module::Discovery, 0)]))
        .await
        .unwrap();
    assert!(reply.tasks.is_empty());
    assert_eq!(h.broker.agents().len(), 1);
}

#[tokio::test]
async fn unavailable_manager_yields_empty_reply() {
    let h = harness();
    h.manager.add_scope(scope(1, "secret-a"));
    h.manager.set_unauthorized(true);

    let reply = h
        .broker
        .request_tasks(request("secret-a", &[(Module::Discovery, 0)]))
        .await
        .unwrap();
    assert!(reply.tasks.is_empty());
    assert!(h.broker.cache().is_empty());
}

#[tokio::test]
async fn resolver_waits_out_connectivity_loss() {
    let h = harness();
    let a = scope(1, "secret-a");
    h.add_scope(&a).await;
    h.manager.fail_connectivity(2);

    let reply = h
        .broker
        .request_tasks(request("secret-a", &[]))
        .await
        .unwrap();
    assert!(reply.tasks.is_empty());
    assert_eq!(h.manager.resolve_calls(), 3);
    assert_eq!(h.broker.cache().get("secret-a").map(|s| s.id), Some(1));
}

#[tokio::test]
async fn shutdown_releases_waiting_resolvers() {
    let h = harness();
    h.manager.add_scope(scope(1, "secret-a"));
    h.manager.fail_connectivity(usize::MAX);

    let broker = h.broker.clone();
    let pending = tokio::spawn(async move { broker.request_tasks(request("secret-a", &[])).await });
    tokio::time::sleep(Duration::from_millis(50)).await;
    h.broker.shutdown().await;

    let reply = tokio::time::timeout(Duration::from_secs(2), pending)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert!(reply.tasks.is_empty());
    assert!(h.broker.is_shut_down());
}

#[tokio::test]
async fn concurrent_requests_resolve_once() {
    let h = harness();
    h.add_scope(&scope(1, "secret-a")).await;
    h.manager.set_resolve_delay(Duration::from_millis(100));

    let mut handles = Vec::new();
    for i in 0..8 {
        let broker = h.broker.clone();
        let args: RequestScanTasksArgs = request_from(&format!("agent-{i}"), "secret-a", &[]);
        handles.push(tokio::spawn(async move { broker.request_tasks(args).await }));
    }
    for handle in handles {
        assert!(handle.await.unwrap().is_ok());
    }

    assert_eq!(h.manager.resolve_calls(), 1);
    assert_eq!(h.broker.agents().len(), 8);
}

#[tokio::test]
async fn cached_scope_skips_the_manager() {
    let h = harness();
    h.add_scope(&scope(1, "secret-a")).await;

    for _ in 0..3 {
        h.broker.request_tasks(request("secret-a", &[])).await.unwrap();
    }
    assert_eq!(h.manager.resolve_calls(), 1);
}

fn banner_task(service_id: i64, port: u16) -> DerivedTask {
    DerivedTask {
        module: Module::Banner,
        service_id,
        target: "10.0.0.5".into(),
        ip: "10.0.0.5".into(),
        dns_name: String::new(),
        other_names: Vec::new(),
        protocol: "tcp".into(),
        port,
        service: "unknown".into(),
        service_product: String::new(),
    }
}

#[tokio::test]
async fn large_backlog_holds_discovery() {
    let h = harness_with(scanbroker_daemon::config::BrokerTimings {
        backlog_limit: 5,
        ..test_timings()
    });
    let a = scope(1, "secret-a");
    let path = h.add_scope(&a).await;
    seed_input(&path, "10.0.0.0/24", 1.0);

    let backlog: Vec<DerivedTask> = (1..=6).map(|i| banner_task(i, 1000 + i as u16)).collect();
    h.broker.tasks().add(a.id, backlog).await.unwrap();

    let held = h
        .broker
        .request_tasks(request("secret-a", &[(Module::Discovery, 0)]))
        .await
        .unwrap();
    assert!(held.tasks.is_empty());

    // Draining the backlog below the limit releases discovery again.
    let drained = h
        .broker
        .request_tasks(request("secret-a", &[(Module::Banner, 8)]))
        .await
        .unwrap();
    assert_eq!(drained.tasks.len(), 2);

    let released = h
        .broker
        .request_tasks(request("secret-a", &[(Module::Discovery, 0)]))
        .await
        .unwrap();
    assert_eq!(released.tasks.len(), 1);
}

#[tokio::test]
async fn unknown_module_slots_are_ignored() {
    let h = harness();
    let a = scope(1, "secret-a");
    let path = h.add_scope(&a).await;
    seed_input(&path, "10.0.0.0/24", 1.0);

    let mut args = request("secret-a", &[(Module::Discovery, 0)]);
    args.modules.push(scanbroker_core::api::ModuleData {
        label: "ftp".into(),
        max_instances: 1,
        total_instances: 1,
        scope_instances: 1,
        active_tasks: 0,
    });
    let reply = h.broker.request_tasks(args).await.unwrap();
    assert_eq!(reply.tasks.len(), 1);
}

#[tokio::test]
async fn feeds_for_one_scope_never_share_inputs() {
    let h = harness();
    let mut a = scope(1, "secret-a");
    a.settings.max_instances_discovery = 4;
    let path = h.add_scope(&a).await;
    for i in 0..10 {
        seed_input(&path, &format!("10.0.{i}.0/24"), 3.0);
    }

    let broker = Arc::clone(&h.broker);
    let mut handles = Vec::new();
    for i in 0..4 {
        let broker = broker.clone();
        let args = request_from(&format!("agent-{i}"), "secret-a", &[(Module::Discovery, 0)]);
        handles.push(tokio::spawn(async move { broker.request_tasks(args).await }));
    }
    let mut ids = Vec::new();
    for handle in handles {
        ids.extend(handle.await.unwrap().unwrap().tasks.into_iter().map(|t| t.id));
    }
    let total = ids.len();
    ids.sort_unstable();
    ids.dedup();
    assert_eq!(ids.len(), total);
    assert_eq!(total, 10);
}
