//! Reconciler sweeps against a mock engine that drifts behind the store's back.

use chrono::{Duration as ChronoDuration, Utc};
use roost_core::{CreateRequest, LifecycleManager, Operator, Reconciler};
use roost_engine::{CreateSpec, EngineAdapter, MockEngine, MockOp};
use roost_schema::{
    container_name, Config, Instance, InstanceId, InstanceStatus, LifecycleAction, OperatorId,
    ReconcilerSection, ResourceSpec,
};
use roost_store::{InstanceFilter, InstanceStore, LegacyStore, SqliteStore};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

const LOCK_TIMEOUT: Duration = Duration::from_secs(5);

struct Fixture {
    store: Arc<dyn InstanceStore>,
    engine: Arc<MockEngine>,
    mgr: LifecycleManager,
    rec: Reconciler,
}

fn fixtures(dir: &Path, settings: &ReconcilerSection) -> Vec<Fixture> {
    let stores: Vec<Arc<dyn InstanceStore>> = vec![
        Arc::new(LegacyStore::open(dir.join("instances.json"), LOCK_TIMEOUT).unwrap()),
        Arc::new(SqliteStore::open(dir.join("roost.db"), LOCK_TIMEOUT).unwrap()),
    ];
    stores
        .into_iter()
        .map(|store| {
            let engine = Arc::new(MockEngine::new());
            let mgr = LifecycleManager::new(store.clone(), engine.clone(), Config::default());
            let rec = Reconciler::new(store.clone(), engine.clone(), settings.clone());
            Fixture {
                store,
                engine,
                mgr,
                rec,
            }
        })
        .collect()
}

fn alice() -> Operator {
    Operator::new("alice")
}

fn create(f: &Fixture, name: &str, ttl_hours: Option<u64>) -> Instance {
    let mut req = CreateRequest::new(name, ResourceSpec::new("ubuntu:22.04"));
    req.ttl_hours = ttl_hours;
    f.mgr.create(&alice(), req).unwrap()
}

fn reload(f: &Fixture, id: &InstanceId) -> Instance {
    f.store.get(id).unwrap().unwrap()
}

/// A pending record as left behind when the process died around the
/// engine call.
fn stranded_pending(f: &Fixture, id: &str, age: ChronoDuration) -> Instance {
    let inst = Instance::new_pending(
        InstanceId::new(id),
        OperatorId::new("alice"),
        "stranded",
        ResourceSpec::new("ubuntu:22.04"),
        Utc::now() - age,
        None,
    );
    let guard = f.store.lock(id).unwrap();
    f.store.put(&guard, &inst).unwrap();
    inst
}

#[test]
fn container_missing_from_engine_is_marked_removed() {
    let dir = tempfile::tempdir().unwrap();
    for f in fixtures(dir.path(), &ReconcilerSection::default()) {
        let inst = create(&f, "web", None);
        f.engine
            .remove_out_of_band(inst.engine_ref.as_ref().unwrap())
            .unwrap();

        let report = f.rec.sweep().unwrap();
        assert_eq!(report.checked, 1);
        assert_eq!(report.repaired, 1, "{}", f.store.backend());

        let after = reload(&f, &inst.id);
        assert_eq!(after.status, InstanceStatus::Removed);
        assert!(after.engine_ref.is_none());
        assert_eq!(f.store.count_active(None).unwrap(), 0);

        // nothing left to do
        assert_eq!(f.rec.sweep().unwrap().checked, 0);
    }
}

#[test]
fn run_state_follows_the_engine() {
    let dir = tempfile::tempdir().unwrap();
    for f in fixtures(dir.path(), &ReconcilerSection::default()) {
        let running = create(&f, "up", None);
        let stopped = create(&f, "down", None);
        f.mgr.stop(&alice(), &stopped.id).unwrap();

        f.engine
            .set_running_out_of_band(running.engine_ref.as_ref().unwrap(), false)
            .unwrap();
        f.engine
            .set_running_out_of_band(stopped.engine_ref.as_ref().unwrap(), true)
            .unwrap();

        let report = f.rec.sweep().unwrap();
        assert_eq!(report.repaired, 2);
        assert_eq!(reload(&f, &running.id).status, InstanceStatus::Stopped);
        assert_eq!(reload(&f, &stopped.id).status, InstanceStatus::Running);
    }
}

#[test]
fn expired_instance_goes_through_expired_to_removed() {
    let dir = tempfile::tempdir().unwrap();
    for f in fixtures(dir.path(), &ReconcilerSection::default()) {
        let inst = create(&f, "short", Some(1));
        let keep = create(&f, "long", Some(48));

        let report = f.rec.sweep_at(Utc::now() + ChronoDuration::hours(2)).unwrap();
        assert_eq!(report.expired, 1, "{}", f.store.backend());
        assert!(report.errors.is_empty());

        let after = reload(&f, &inst.id);
        assert_eq!(after.status, InstanceStatus::Removed);
        let path: Vec<_> = after.transitions.iter().map(|t| t.to).collect();
        assert_eq!(
            path,
            [
                InstanceStatus::Pending,
                InstanceStatus::Running,
                InstanceStatus::Expired,
                InstanceStatus::Removed
            ]
        );
        assert!(after.transitions.windows(2).all(|w| w[0].at <= w[1].at));

        let containers = f.engine.containers().unwrap();
        assert_eq!(containers.len(), 1);
        assert_eq!(reload(&f, &keep.id).status, InstanceStatus::Running);
    }
}

#[test]
fn failed_expiry_removal_leaves_instance_in_error() {
    let dir = tempfile::tempdir().unwrap();
    for f in fixtures(dir.path(), &ReconcilerSection::default()) {
        let inst = create(&f, "short", Some(1));
        f.engine.fail_next(MockOp::Remove, "device busy").unwrap();

        let report = f.rec.sweep_at(Utc::now() + ChronoDuration::hours(2)).unwrap();
        assert_eq!(report.expired, 0);
        assert_eq!(report.errors.len(), 1);
        assert_eq!(report.errors[0].id, inst.id.as_str());

        let after = reload(&f, &inst.id);
        assert_eq!(after.status, InstanceStatus::Error);
        assert_eq!(after.last_action, Some(LifecycleAction::Remove));
        assert!(after
            .transitions
            .iter()
            .any(|t| t.to == InstanceStatus::Expired));

        // the operator's retry finishes the removal
        let removed = f.mgr.retry(&alice(), &inst.id).unwrap();
        assert_eq!(removed.status, InstanceStatus::Removed);
    }
}

#[test]
fn busy_instances_are_skipped() {
    let dir = tempfile::tempdir().unwrap();
    for f in fixtures(dir.path(), &ReconcilerSection::default()) {
        let inst = create(&f, "web", None);
        f.engine
            .remove_out_of_band(inst.engine_ref.as_ref().unwrap())
            .unwrap();

        let guard = f.store.lock(inst.id.as_str()).unwrap();
        let report = f.rec.sweep().unwrap();
        assert_eq!(report.skipped_busy, 1);
        assert_eq!(report.checked, 0);
        assert_eq!(reload(&f, &inst.id).status, InstanceStatus::Running);
        drop(guard);

        assert_eq!(f.rec.sweep().unwrap().repaired, 1);
    }
}

#[test]
fn stale_pending_with_container_is_adopted() {
    let dir = tempfile::tempdir().unwrap();
    for f in fixtures(dir.path(), &ReconcilerSection::default()) {
        let inst = stranded_pending(&f, "00000000000000aa", ChronoDuration::hours(1));
        f.engine
            .create(&CreateSpec {
                name: container_name(&inst.id, &inst.name),
                owner: inst.owner.clone(),
                instance: inst.id.clone(),
                network: "bridge".to_owned(),
                resources: inst.resource_spec.clone(),
                extra_env: BTreeMap::new(),
            })
            .unwrap();

        let report = f.rec.sweep().unwrap();
        assert_eq!(report.adopted, 1, "{}", f.store.backend());
        let after = reload(&f, &inst.id);
        assert_eq!(after.status, InstanceStatus::Running);
        assert!(after.last_action.is_none());
    }
}

#[test]
fn stale_pending_without_container_becomes_retryable_error() {
    let dir = tempfile::tempdir().unwrap();
    for f in fixtures(dir.path(), &ReconcilerSection::default()) {
        let inst = stranded_pending(&f, "00000000000000bb", ChronoDuration::hours(1));

        let report = f.rec.sweep().unwrap();
        assert_eq!(report.interrupted, 1);
        let after = reload(&f, &inst.id);
        assert_eq!(after.status, InstanceStatus::Error);
        assert_eq!(after.last_action, Some(LifecycleAction::Create));
        assert_eq!(after.last_error.as_deref(), Some("creation interrupted"));

        let retried = f.mgr.retry(&alice(), &inst.id).unwrap();
        assert_eq!(retried.status, InstanceStatus::Running);
    }
}

#[test]
fn fresh_pending_is_left_alone() {
    let dir = tempfile::tempdir().unwrap();
    for f in fixtures(dir.path(), &ReconcilerSection::default()) {
        let inst = stranded_pending(&f, "00000000000000cc", ChronoDuration::seconds(5));
        let report = f.rec.sweep().unwrap();
        assert_eq!(report.changed(), 0);
        assert_eq!(reload(&f, &inst.id).status, InstanceStatus::Pending);
        assert_eq!(f.engine.call_count(MockOp::Inspect).unwrap(), 0);
    }
}

#[test]
fn one_failing_instance_does_not_abort_the_sweep() {
    let dir = tempfile::tempdir().unwrap();
    let settings = ReconcilerSection {
        batch_size: 1,
        ..ReconcilerSection::default()
    };
    for f in fixtures(dir.path(), &settings) {
        let first = create(&f, "first", None);
        let second = create(&f, "second", None);
        let third = create(&f, "third", None);
        for inst in [&second, &third] {
            f.engine
                .remove_out_of_band(inst.engine_ref.as_ref().unwrap())
                .unwrap();
        }
        f.engine.fail_next(MockOp::Inspect, "daemon hiccup").unwrap();

        let report = f.rec.sweep().unwrap();
        assert_eq!(report.checked, 3);
        assert_eq!(report.errors.len(), 1);
        assert_eq!(report.errors[0].id, first.id.as_str());
        assert_eq!(report.repaired, 2);
        assert_eq!(reload(&f, &first.id).status, InstanceStatus::Running);
    }
}

#[test]
fn sweeps_never_create_records() {
    let dir = tempfile::tempdir().unwrap();
    for f in fixtures(dir.path(), &ReconcilerSection::default()) {
        let inst = create(&f, "web", None);
        f.mgr.delete(&alice(), &inst.id).unwrap();
        for _ in 0..3 {
            f.rec.sweep().unwrap();
        }
        assert_eq!(f.store.list(&InstanceFilter::all()).unwrap().len(), 1);
        assert!(f.engine.containers().unwrap().is_empty());
    }
}

/// A second, independent handle on the fixture's store file, as the daemon
/// process holds it while a CLI command works on the first.
fn daemon_handle(dir: &Path, f: &Fixture) -> Arc<dyn InstanceStore> {
    match f.store.backend() {
        "legacy" => Arc::new(LegacyStore::open(dir.join("instances.json"), LOCK_TIMEOUT).unwrap()),
        _ => Arc::new(SqliteStore::open(dir.join("roost.db"), LOCK_TIMEOUT).unwrap()),
    }
}

#[test]
fn instances_busy_in_another_store_handle_are_skipped() {
    let dir = tempfile::tempdir().unwrap();
    for f in fixtures(dir.path(), &ReconcilerSection::default()) {
        let inst = create(&f, "web", None);
        f.engine
            .remove_out_of_band(inst.engine_ref.as_ref().unwrap())
            .unwrap();
        let daemon = Reconciler::new(
            daemon_handle(dir.path(), &f),
            f.engine.clone(),
            ReconcilerSection::default(),
        );

        let guard = f.store.lock(inst.id.as_str()).unwrap();
        let report = daemon.sweep().unwrap();
        assert_eq!(report.skipped_busy, 1, "{}", f.store.backend());
        assert_eq!(report.checked, 0);
        assert_eq!(reload(&f, &inst.id).status, InstanceStatus::Running);
        drop(guard);

        assert_eq!(daemon.sweep().unwrap().repaired, 1);
        assert_eq!(reload(&f, &inst.id).status, InstanceStatus::Removed);
    }
}

#[test]
fn stop_request_ends_sweep_at_batch_boundary() {
    let dir = tempfile::tempdir().unwrap();
    let settings = ReconcilerSection {
        batch_size: 1,
        ..ReconcilerSection::default()
    };
    for f in fixtures(dir.path(), &settings) {
        for name in ["a", "b", "c"] {
            create(&f, name, None);
        }

        let report = f.rec.sweep_until(Utc::now(), &|| true).unwrap();
        assert_eq!(report.checked, 1, "{}", f.store.backend());
        assert!(report.stopped_early);

        let full = f.rec.sweep_until(Utc::now(), &|| false).unwrap();
        assert_eq!(full.checked, 3);
        assert!(!full.stopped_early);
    }
}
