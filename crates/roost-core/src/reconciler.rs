//! Background correction of store records against engine truth.
//!
//! A sweep lists the ids of every non-removed instance, then loads and
//! corrects them a batch at a time, checking for a stop request between
//! batches. Instances whose per-id guard is held, by this process or another
//! handle on the same store, are skipped until the next sweep. Failures are
//! collected per instance and never abort the sweep.

use crate::lifecycle::validate_transition;
use crate::CoreError;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use roost_engine::{EngineAdapter, EngineStatus, RemoveOutcome};
use roost_schema::{Instance, InstanceStatus, LifecycleAction, ReconcilerSection};
use roost_store::{IdGuard, InstanceFilter, InstanceStore};
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

const STOP_POLL: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct SweepFailure {
    pub id: String,
    pub error: String,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct SweepReport {
    pub checked: usize,
    pub skipped_busy: usize,
    /// Store synced to what the engine reports.
    pub repaired: usize,
    /// Stale `pending` records the engine turned out to have created.
    pub adopted: usize,
    /// Stale `pending` records with no container, moved to `error`.
    pub interrupted: usize,
    pub expired: usize,
    pub errors: Vec<SweepFailure>,
    /// A stop request ended the sweep before its last batch.
    pub stopped_early: bool,
}

impl SweepReport {
    pub fn changed(&self) -> usize {
        self.repaired + self.adopted + self.interrupted + self.expired
    }
}

/// What happened to one instance during a sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Unchanged,
    Repaired,
    Adopted,
    Interrupted,
    Expired,
}

pub struct Reconciler {
    store: Arc<dyn InstanceStore>,
    engine: Arc<dyn EngineAdapter>,
    settings: ReconcilerSection,
}

impl Reconciler {
    pub fn new(
        store: Arc<dyn InstanceStore>,
        engine: Arc<dyn EngineAdapter>,
        settings: ReconcilerSection,
    ) -> Self {
        Self {
            store,
            engine,
            settings,
        }
    }

    pub fn sweep(&self) -> Result<SweepReport, CoreError> {
        self.sweep_at(Utc::now())
    }

    /// One full pass over the store as of `now`.
    pub fn sweep_at(&self, now: DateTime<Utc>) -> Result<SweepReport, CoreError> {
        self.sweep_until(now, &|| false)
    }

    /// One pass over the store as of `now`, abandoned at the next batch
    /// boundary once `stop` returns true. Only listing the store can fail the
    /// whole sweep.
    pub fn sweep_until(
        &self,
        now: DateTime<Utc>,
        stop: &dyn Fn() -> bool,
    ) -> Result<SweepReport, CoreError> {
        let ids = self.store.list_ids(&InstanceFilter::active())?;

        let batch_size = self.settings.batch_size.max(1);
        let mut report = SweepReport::default();
        for (n, batch) in ids.chunks(batch_size).enumerate() {
            if n > 0 && stop() {
                info!(
                    "sweep stopped after {n} batch(es), {} instance(s) left",
                    ids.len() - n * batch_size
                );
                report.stopped_early = true;
                break;
            }
            debug!("sweep batch {n}: {} instance(s)", batch.len());
            for id in batch {
                let guard = match self.store.try_lock(id.as_str()) {
                    Ok(Some(guard)) => guard,
                    Ok(None) => {
                        debug!("instance {id} is busy, skipping");
                        report.skipped_busy += 1;
                        continue;
                    }
                    Err(e) => {
                        warn!("cannot lock instance {id}: {e}");
                        report.errors.push(SweepFailure {
                            id: id.to_string(),
                            error: e.to_string(),
                        });
                        continue;
                    }
                };
                report.checked += 1;

                let result = match self.store.get(id) {
                    Ok(Some(inst)) if inst.is_active() => self.reconcile_one(&guard, inst, now),
                    Ok(_) => Ok(Outcome::Unchanged),
                    Err(e) => Err(e.into()),
                };
                match result {
                    Ok(Outcome::Unchanged) => {}
                    Ok(Outcome::Repaired) => report.repaired += 1,
                    Ok(Outcome::Adopted) => report.adopted += 1,
                    Ok(Outcome::Interrupted) => report.interrupted += 1,
                    Ok(Outcome::Expired) => report.expired += 1,
                    Err(e) => {
                        warn!("reconcile failed for instance {id}: {e}");
                        report.errors.push(SweepFailure {
                            id: id.to_string(),
                            error: e.to_string(),
                        });
                    }
                }
            }
        }

        if report.changed() > 0 || !report.errors.is_empty() {
            info!(
                "sweep: {} checked, {} changed, {} busy, {} failed",
                report.checked,
                report.changed(),
                report.skipped_busy,
                report.errors.len()
            );
        }
        Ok(report)
    }

    /// Sweep every `interval` until `stop` returns true. Returns the number
    /// of sweeps run. A failed sweep is logged and retried next interval.
    pub fn run(&self, interval: Duration, stop: impl Fn() -> bool) -> usize {
        let mut sweeps = 0;
        while !stop() {
            if let Err(e) = self.sweep_until(Utc::now(), &stop) {
                warn!("sweep failed: {e}");
            }
            sweeps += 1;

            let deadline = Instant::now() + interval;
            while Instant::now() < deadline {
                if stop() {
                    return sweeps;
                }
                let left = deadline.saturating_duration_since(Instant::now());
                std::thread::sleep(STOP_POLL.min(left));
            }
        }
        sweeps
    }

    fn reconcile_one(
        &self,
        guard: &IdGuard<'_>,
        mut inst: Instance,
        now: DateTime<Utc>,
    ) -> Result<Outcome, CoreError> {
        match inst.status {
            InstanceStatus::Pending => self.settle_pending(guard, &mut inst, now),
            InstanceStatus::Running | InstanceStatus::Stopped if inst.is_expired(now) => {
                self.apply(guard, &mut inst, InstanceStatus::Expired, "ttl elapsed", now)?;
                self.retire(guard, &mut inst, now)
            }
            InstanceStatus::Expired => self.retire(guard, &mut inst, now),
            InstanceStatus::Running | InstanceStatus::Stopped => {
                self.sync_with_engine(guard, &mut inst, now)
            }
            InstanceStatus::Error | InstanceStatus::Removed => Ok(Outcome::Unchanged),
        }
    }

    fn sync_with_engine(
        &self,
        guard: &IdGuard<'_>,
        inst: &mut Instance,
        now: DateTime<Utc>,
    ) -> Result<Outcome, CoreError> {
        let truth = self.inspect(inst)?;
        let (to, reason) = match (inst.status, truth) {
            (_, EngineStatus::Absent) => {
                (InstanceStatus::Removed, "container missing from engine")
            }
            (InstanceStatus::Stopped, EngineStatus::Running) => {
                (InstanceStatus::Running, "engine reports running")
            }
            (InstanceStatus::Running, EngineStatus::Stopped) => {
                (InstanceStatus::Stopped, "engine reports stopped")
            }
            _ => return Ok(Outcome::Unchanged),
        };
        warn!(
            "instance {} drifted: store says {}, engine says {truth}",
            inst.id, inst.status
        );
        self.apply(guard, inst, to, reason, now)?;
        Ok(Outcome::Repaired)
    }

    fn settle_pending(
        &self,
        guard: &IdGuard<'_>,
        inst: &mut Instance,
        now: DateTime<Utc>,
    ) -> Result<Outcome, CoreError> {
        let grace = i64::try_from(self.settings.pending_grace_secs)
            .ok()
            .and_then(ChronoDuration::try_seconds)
            .unwrap_or(ChronoDuration::MAX);
        if now.signed_duration_since(inst.updated_at) < grace {
            return Ok(Outcome::Unchanged);
        }

        match self.inspect(inst)? {
            EngineStatus::Running => {
                self.apply(guard, inst, InstanceStatus::Running, "adopted by reconciler", now)?;
                Ok(Outcome::Adopted)
            }
            EngineStatus::Stopped => {
                self.apply(guard, inst, InstanceStatus::Stopped, "adopted by reconciler", now)?;
                Ok(Outcome::Adopted)
            }
            EngineStatus::Absent => {
                validate_transition(inst.status, InstanceStatus::Error)?;
                warn!("instance {} never reached the engine", inst.id);
                inst.fail(LifecycleAction::Create, "creation interrupted", now);
                self.store.put(guard, inst)?;
                Ok(Outcome::Interrupted)
            }
        }
    }

    /// Remove the container of an `expired` instance and tombstone it.
    fn retire(
        &self,
        guard: &IdGuard<'_>,
        inst: &mut Instance,
        now: DateTime<Utc>,
    ) -> Result<Outcome, CoreError> {
        let Some(engine_ref) = inst.engine_ref.clone() else {
            return Ok(Outcome::Unchanged);
        };
        match self.engine.remove(&engine_ref) {
            Ok(outcome) => {
                if outcome == RemoveOutcome::AlreadyAbsent {
                    debug!("container {engine_ref} already gone");
                }
                info!("instance {} expired and removed", inst.id);
                self.apply(guard, inst, InstanceStatus::Removed, "expired", now)?;
                Ok(Outcome::Expired)
            }
            Err(e) => {
                inst.fail(LifecycleAction::Remove, e.to_string(), now);
                self.store.put(guard, inst)?;
                Err(e.into())
            }
        }
    }

    fn inspect(&self, inst: &Instance) -> Result<EngineStatus, CoreError> {
        match &inst.engine_ref {
            Some(engine_ref) => Ok(self.engine.inspect(engine_ref)?),
            None => Ok(EngineStatus::Absent),
        }
    }

    fn apply(
        &self,
        guard: &IdGuard<'_>,
        inst: &mut Instance,
        to: InstanceStatus,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<(), CoreError> {
        validate_transition(inst.status, to)?;
        info!("instance {}: {} -> {to} ({reason})", inst.id, inst.status);
        inst.succeed(to, reason, now);
        self.store.put(guard, inst)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use roost_engine::MockEngine;
    use roost_store::LegacyStore;
    use std::cell::Cell;

    #[test]
    fn empty_store_sweeps_cleanly() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(
            LegacyStore::open(dir.path().join("instances.json"), Duration::from_secs(1)).unwrap(),
        );
        let rec = Reconciler::new(
            store,
            Arc::new(MockEngine::new()),
            ReconcilerSection::default(),
        );
        assert_eq!(rec.sweep().unwrap(), SweepReport::default());
    }

    #[test]
    fn run_stops_when_asked() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(
            LegacyStore::open(dir.path().join("instances.json"), Duration::from_secs(1)).unwrap(),
        );
        let rec = Reconciler::new(
            store,
            Arc::new(MockEngine::new()),
            ReconcilerSection::default(),
        );
        let polls = Cell::new(0);
        let sweeps = rec.run(Duration::from_millis(10), || {
            polls.set(polls.get() + 1);
            polls.get() > 3
        });
        assert!(sweeps >= 1);
    }
}
