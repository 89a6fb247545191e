//! Integration tests for reconciliation and convergence.
//!
//! These tests drive a `DomainOrchestrator` against the in-memory cluster.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use dommesh_engine::{
    Collaborators, DomainOrchestrator, HardwareCategory, Host, HostSnapshot, MockCluster,
    Params, PollSettings, RecordingSink, RunMode,
};

fn p(pairs: &[(&str, &str)]) -> Params {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

fn hosts(names: &[&str]) -> BTreeSet<String> {
    names.iter().map(|n| n.to_string()).collect()
}

fn disk(target: &str, source: &str) -> Params {
    p(&[("target_dev", target), ("source", source), ("device", "disk")])
}

fn settings() -> PollSettings {
    PollSettings {
        interval: Duration::from_millis(10),
        action_timeout: 20,
    }
}

fn orchestrator(cluster: &Arc<MockCluster>, names: &[&str]) -> DomainOrchestrator {
    DomainOrchestrator::new(
        "web",
        names.iter().map(|n| Host::new(*n)).collect(),
        Collaborators::from_backend(Arc::clone(cluster), Arc::new(RecordingSink::new())),
        settings(),
    )
}

fn web_snapshot() -> HostSnapshot {
    HostSnapshot::defined()
        .with_device(HardwareCategory::Disk, "vda", disk("vda", "/images/web.qcow2"))
        .with_device(HardwareCategory::Disk, "vdb", disk("vdb", "/images/data.qcow2"))
        .with_device(
            HardwareCategory::Interface,
            "52:54:00:aa:bb:01",
            p(&[("mac", "52:54:00:aa:bb:01"), ("type", "network"), ("source", "default")]),
        )
}

/// Moving a definition from {h1, h2} to {h1, h3}.
#[tokio::test]
async fn test_convergence_scenario() {
    let cluster = Arc::new(MockCluster::new());
    cluster.seed("h1", "web", web_snapshot());
    cluster.seed("h2", "web", web_snapshot());
    let orchestrator = orchestrator(&cluster, &["h1", "h2", "h3"]);

    orchestrator.update_parameters().await.unwrap();
    assert_eq!(orchestrator.view().unwrap().defined_on, hosts(&["h1", "h2"]));

    orchestrator
        .set_param(HardwareCategory::Disk, "vdb", "source", "/images/data2.qcow2")
        .unwrap();
    cluster.reset_calls();

    let report = orchestrator
        .apply(RunMode::Live, &hosts(&["h1", "h3"]))
        .await
        .unwrap();

    assert_eq!(report.modified, hosts(&["h1"]));
    assert_eq!(report.created, hosts(&["h3"]));
    assert_eq!(report.undefined, hosts(&["h2"]));
    assert!(report.is_complete());
    assert_eq!(orchestrator.view().unwrap().defined_on, hosts(&["h1", "h3"]));

    // h2 only ever sees the undefine
    assert_eq!(cluster.calls("define_or_modify"), 2);
    assert!(cluster.device_writes().iter().all(|(host, _, _)| host != "h2"));

    let item = orchestrator.item(HardwareCategory::Disk, "vdb").unwrap().unwrap();
    assert_eq!(item.param("source"), Some("/images/data2.qcow2"));
    assert!(!item.is_changed());
}

/// Unchanged items are never written to an existing definition.
#[tokio::test]
async fn test_diff_only_apply() {
    let cluster = Arc::new(MockCluster::new());
    cluster.seed("h1", "web", web_snapshot());
    let orchestrator = orchestrator(&cluster, &["h1"]);
    orchestrator.update_parameters().await.unwrap();

    orchestrator
        .set_param(HardwareCategory::Disk, "vdb", "cache", "none")
        .unwrap();
    cluster.reset_calls();

    let report = orchestrator.apply(RunMode::Live, &hosts(&["h1"])).await.unwrap();
    assert_eq!(report.modified, hosts(&["h1"]));
    assert_eq!(cluster.calls("modify_device"), 1);
    assert_eq!(
        cluster.device_writes(),
        vec![("h1".to_string(), HardwareCategory::Disk, "vdb".to_string())]
    );

    // Nothing left to write
    cluster.reset_calls();
    let report = orchestrator.apply(RunMode::Live, &hosts(&["h1"])).await.unwrap();
    assert_eq!(report.unchanged, hosts(&["h1"]));
    assert_eq!(cluster.calls("define_or_modify"), 0);
    assert_eq!(cluster.calls("modify_device"), 0);
}

/// A failing host does not stop the others.
#[tokio::test]
async fn test_partial_failure_is_reported() {
    let cluster = Arc::new(MockCluster::new());
    cluster.seed("h1", "web", web_snapshot());
    cluster.fail_defines_on("h2");
    let orchestrator = DomainOrchestrator::new(
        "web",
        vec![Host::new("h1"), Host::new("h2"), Host::disconnected("h3")],
        Collaborators::from_backend(Arc::clone(&cluster), Arc::new(RecordingSink::new())),
        settings(),
    );
    orchestrator.update_parameters().await.unwrap();

    let report = orchestrator
        .apply(RunMode::Live, &hosts(&["h1", "h2", "h3"]))
        .await
        .unwrap();

    assert!(!report.is_complete());
    assert_eq!(report.unchanged, hosts(&["h1"]));
    let failed: BTreeSet<String> = report.failed.iter().map(|(h, _)| h.clone()).collect();
    assert_eq!(failed, hosts(&["h2", "h3"]));
    assert_eq!(orchestrator.view().unwrap().defined_on, hosts(&["h1"]));
}

/// A brand new domain is created with its full parameter set.
#[tokio::test]
async fn test_new_domain_is_created() {
    let cluster = Arc::new(MockCluster::new());
    let orchestrator = DomainOrchestrator::new_domain(
        "db",
        vec![Host::new("h1"), Host::new("h2")],
        Collaborators::from_backend(Arc::clone(&cluster), Arc::new(RecordingSink::new())),
        settings(),
        p(&[("vcpus", "2"), ("memory", "2048")]),
    );
    assert!(orchestrator.is_new());

    orchestrator
        .add_hardware(HardwareCategory::Disk, disk("vda", "/images/db.qcow2"))
        .unwrap();
    orchestrator
        .add_hardware(HardwareCategory::Interface, Params::new())
        .unwrap();

    let report = orchestrator
        .apply(RunMode::Live, &hosts(&["h1", "h2"]))
        .await
        .unwrap();

    assert_eq!(report.created, hosts(&["h1", "h2"]));
    assert!(!orchestrator.is_new());
    assert_eq!(orchestrator.view().unwrap().defined_on, hosts(&["h1", "h2"]));
    assert_eq!(orchestrator.domain_param("vcpus").unwrap().as_deref(), Some("2"));

    // Each host generated its own MAC: one binds the placeholder, the other is new
    let interfaces = orchestrator.items(HardwareCategory::Interface).unwrap();
    assert_eq!(interfaces.len(), 2);
    assert!(interfaces.iter().all(|i| !i.generate && !i.is_new));
    assert!(interfaces.iter().all(|i| i.key.starts_with("52:54:00:")));
}

/// Running a pass twice with the same host state changes nothing the second time.
#[tokio::test]
async fn test_update_is_idempotent() {
    let cluster = Arc::new(MockCluster::new());
    cluster.seed("h1", "web", web_snapshot());
    cluster.seed("h2", "web", web_snapshot());
    let orchestrator = orchestrator(&cluster, &["h1", "h2"]);

    assert!(orchestrator.update_parameters().await.unwrap());
    let layout = orchestrator.layout().unwrap();

    assert!(!orchestrator.update_parameters().await.unwrap());
    assert_eq!(orchestrator.layout().unwrap(), layout);
}

/// Categories keep their fixed order and keys stay sorted inside a category.
#[tokio::test]
async fn test_ordering_invariant() {
    let cluster = Arc::new(MockCluster::new());
    let snapshot = HostSnapshot::defined()
        .with_device(HardwareCategory::Video, "0", p(&[("model_type", "virtio")]))
        .with_device(HardwareCategory::Serial, "1", p(&[("type", "pty")]))
        .with_device(HardwareCategory::Serial, "0", p(&[("type", "pty")]))
        .with_device(HardwareCategory::Graphics, "0", p(&[("type", "vnc")]))
        .with_device(HardwareCategory::Disk, "vdc", disk("vdc", "/images/c.qcow2"))
        .with_device(HardwareCategory::Disk, "vda", disk("vda", "/images/a.qcow2"));
    cluster.seed("h1", "web", snapshot.clone());
    let orchestrator = orchestrator(&cluster, &["h1"]);
    orchestrator.update_parameters().await.unwrap();

    // A user placeholder, then a key the host reports later
    orchestrator
        .add_hardware(HardwareCategory::Disk, disk("vdz", "/images/z.qcow2"))
        .unwrap();
    cluster.seed(
        "h1",
        "web",
        snapshot
            .with_device(HardwareCategory::Disk, "vdb", disk("vdb", "/images/b.qcow2"))
            .with_device(HardwareCategory::Serial, "10", p(&[("type", "pty")])),
    );
    orchestrator.update_parameters().await.unwrap();

    let layout = orchestrator.layout().unwrap();
    let ranks: Vec<usize> = layout.iter().map(|(c, _)| c.rank()).collect();
    let mut sorted = ranks.clone();
    sorted.sort();
    assert_eq!(ranks, sorted);

    let disks: Vec<&str> = layout
        .iter()
        .filter(|(c, _)| *c == HardwareCategory::Disk)
        .map(|(_, k)| k.as_str())
        .collect();
    assert_eq!(disks, vec!["vda", "vdb", "vdc", "vdz"]);

    let serials: Vec<&str> = layout
        .iter()
        .filter(|(c, _)| *c == HardwareCategory::Serial)
        .map(|(_, k)| k.as_str())
        .collect();
    assert_eq!(serials, vec!["0", "1", "10"]);
}

/// Placeholders survive hosts that report nothing; observed items do not.
#[tokio::test]
async fn test_placeholders_survive_empty_snapshots() {
    let cluster = Arc::new(MockCluster::new());
    cluster.seed("h1", "web", web_snapshot());
    let orchestrator = orchestrator(&cluster, &["h1"]);
    orchestrator.update_parameters().await.unwrap();

    let sound = orchestrator
        .add_hardware(HardwareCategory::Sound, Params::new())
        .unwrap();
    let nic = orchestrator
        .add_hardware(HardwareCategory::Interface, Params::new())
        .unwrap();

    cluster.seed("h1", "web", HostSnapshot::default());
    assert!(orchestrator.update_parameters().await.unwrap());

    assert_eq!(
        orchestrator.layout().unwrap(),
        vec![
            (HardwareCategory::Interface, nic),
            (HardwareCategory::Sound, sound),
        ]
    );
}

/// A simulated pass validates and writes nothing.
#[tokio::test]
async fn test_simulate_rejects_invalid_item() {
    let cluster = Arc::new(MockCluster::new());
    cluster.seed("h1", "web", web_snapshot());
    let orchestrator = orchestrator(&cluster, &["h1"]);
    orchestrator.update_parameters().await.unwrap();

    let key = orchestrator
        .add_hardware(HardwareCategory::Graphics, Params::new())
        .unwrap();
    orchestrator
        .set_param(HardwareCategory::Graphics, &key, "type", "rdp")
        .unwrap();
    cluster.reset_calls();

    assert!(orchestrator.apply(RunMode::Simulate, &hosts(&["h1"])).await.is_err());
    assert!(orchestrator.apply(RunMode::Live, &hosts(&["h1"])).await.is_err());
    assert_eq!(cluster.calls("define_or_modify"), 0);
}

/// A placeholder that no host accepted stays pending and is sent again.
#[tokio::test]
async fn test_rejected_placeholder_stays_pending() {
    let cluster = Arc::new(MockCluster::new());
    cluster.seed("h1", "web", web_snapshot());
    cluster.fail_defines_on("h1");
    let orchestrator = orchestrator(&cluster, &["h1"]);
    orchestrator.update_parameters().await.unwrap();

    let key = orchestrator
        .add_hardware(HardwareCategory::Interface, p(&[("source", "lan")]))
        .unwrap();
    let report = orchestrator.apply(RunMode::Live, &hosts(&["h1"])).await.unwrap();
    assert!(!report.is_complete());
    assert!(report.modified.is_empty());

    let nic = orchestrator
        .item(HardwareCategory::Interface, &key)
        .unwrap()
        .unwrap();
    assert!(nic.is_new);
    assert!(nic.generate);
    assert!(nic.is_changed());

    cluster.reset_calls();
    let report = orchestrator.apply(RunMode::Live, &hosts(&["h1"])).await.unwrap();
    assert!(report.unchanged.is_empty());
    assert_eq!(cluster.calls("define_or_modify"), 1);
}
