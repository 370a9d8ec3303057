//! Operator-driven instance transitions.
//!
//! Every mutating operation follows the same shape: take the per-id guard,
//! reload the record, check ownership and the requested transition, drive
//! the engine, then commit the outcome. Engine failures are committed as
//! `error` with the failed action so `retry` can re-attempt it.

use crate::lifecycle::check_action;
use crate::CoreError;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use roost_engine::{CreateSpec, EngineAdapter, EngineError, RemoveOutcome};
use roost_schema::{
    container_name, validate_instance_name, Config, EngineRef, Instance, InstanceId,
    InstanceStatus, LifecycleAction, OperatorId, RecordError, ResourceSpec,
};
use roost_store::{IdGuard, InstanceFilter, InstanceStore};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

const ID_LEN: usize = 16;

/// The identity a request is made under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Operator {
    pub id: OperatorId,
    /// Administrative capability. Only honoured when the policy allows
    /// overrides, and never bypasses quota.
    pub admin: bool,
}

impl Operator {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: OperatorId::new(id),
            admin: false,
        }
    }

    pub fn admin(id: impl Into<String>) -> Self {
        Self {
            id: OperatorId::new(id),
            admin: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateRequest {
    pub name: String,
    pub spec: ResourceSpec,
    /// Lifetime in hours. `None` falls back to `policy.default_ttl_hours`.
    pub ttl_hours: Option<u64>,
}

impl CreateRequest {
    pub fn new(name: impl Into<String>, spec: ResourceSpec) -> Self {
        Self {
            name: name.into(),
            spec,
            ttl_hours: None,
        }
    }
}

pub struct LifecycleManager {
    store: Arc<dyn InstanceStore>,
    engine: Arc<dyn EngineAdapter>,
    config: Config,
    sequence: AtomicU64,
}

impl LifecycleManager {
    pub fn new(
        store: Arc<dyn InstanceStore>,
        engine: Arc<dyn EngineAdapter>,
        config: Config,
    ) -> Self {
        Self {
            store,
            engine,
            config,
            sequence: AtomicU64::new(0),
        }
    }

    pub fn store(&self) -> &Arc<dyn InstanceStore> {
        &self.store
    }

    pub fn engine(&self) -> &Arc<dyn EngineAdapter> {
        &self.engine
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Validate, reserve quota, commit a `pending` record, then ask the
    /// engine for the container.
    ///
    /// The owner's quota guard is held from the count until the pending
    /// record is durable, so two concurrent creates cannot both pass the
    /// check. It is released before the engine call.
    pub fn create(&self, op: &Operator, req: CreateRequest) -> Result<Instance, CoreError> {
        self.check_request(&req)?;
        let now = Utc::now();
        let ttl = req.ttl_hours.or(self.config.policy.default_ttl_hours);
        let expires_at = match ttl {
            Some(0) => {
                return Err(CoreError::InvalidSpec(
                    "ttl must be at least one hour".to_owned(),
                ))
            }
            Some(hours) => Some(expiry_after(now, hours)?),
            None => None,
        };

        let quota_key = format!("quota:{}", op.id);
        let quota_guard = self.store.lock(&quota_key)?;
        self.check_quota(op, &req.name)?;

        let id = self.allocate_id(&op.id, &req.name, now)?;
        let guard = self.store.lock(id.as_str())?;
        let mut inst =
            Instance::new_pending(id, op.id.clone(), &req.name, req.spec, now, expires_at);
        self.store.put(&guard, &inst)?;
        drop(quota_guard);

        info!("creating instance {} '{}' for {}", inst.id, inst.name, op.id);
        self.create_in_engine(&guard, &mut inst)?;
        Ok(inst)
    }

    pub fn start(&self, op: &Operator, id: &InstanceId) -> Result<Instance, CoreError> {
        self.operate(op, id, LifecycleAction::Start)
    }

    pub fn stop(&self, op: &Operator, id: &InstanceId) -> Result<Instance, CoreError> {
        self.operate(op, id, LifecycleAction::Stop)
    }

    /// Remove the container and leave a `removed` tombstone. Deleting a
    /// tombstone is a no-op.
    pub fn delete(&self, op: &Operator, id: &InstanceId) -> Result<Instance, CoreError> {
        let guard = self.store.lock(id.as_str())?;
        let mut inst = self.load(id)?;
        self.authorize(op, &inst)?;
        if inst.status == InstanceStatus::Removed {
            debug!("instance {id} already removed");
            return Ok(inst);
        }
        check_action(inst.status, LifecycleAction::Remove)?;
        self.drive(&guard, &mut inst, LifecycleAction::Remove)?;
        Ok(inst)
    }

    /// Re-attempt the action that left an instance in `error`.
    pub fn retry(&self, op: &Operator, id: &InstanceId) -> Result<Instance, CoreError> {
        let guard = self.store.lock(id.as_str())?;
        let mut inst = self.load(id)?;
        self.authorize(op, &inst)?;

        let action = match (inst.status, inst.last_action) {
            (InstanceStatus::Error, Some(action)) => action,
            (status, _) => {
                return Err(CoreError::InvalidTransition {
                    from: status.to_string(),
                    to: "retry".to_owned(),
                })
            }
        };

        info!("retrying {action} for instance {id}");
        match action {
            LifecycleAction::Create => {
                if let Some(stale) = &inst.engine_ref {
                    // a half-created container would block the name
                    if self.engine.remove(stale)? == RemoveOutcome::Removed {
                        debug!("removed leftover container {stale} before retrying create");
                    }
                }
                inst.engine_ref = Some(EngineRef::new(container_name(&inst.id, &inst.name)));
                self.create_in_engine(&guard, &mut inst)?;
            }
            other => self.drive(&guard, &mut inst, other)?,
        }
        Ok(inst)
    }

    /// Push `expires_at` out by `hours`, counted from the later of now and
    /// the current expiry.
    pub fn renew(&self, op: &Operator, id: &InstanceId, hours: u64) -> Result<Instance, CoreError> {
        if hours == 0 {
            return Err(CoreError::InvalidSpec(
                "renewal must add at least one hour".to_owned(),
            ));
        }
        let guard = self.store.lock(id.as_str())?;
        let mut inst = self.load(id)?;
        self.authorize(op, &inst)?;
        if !inst.is_active() || inst.status == InstanceStatus::Expired {
            return Err(CoreError::InvalidTransition {
                from: inst.status.to_string(),
                to: "renew".to_owned(),
            });
        }

        let now = Utc::now();
        let base = inst.expires_at.map_or(now, |at| at.max(now));
        let until = expiry_after(base, hours)?;
        inst.expires_at = Some(until);
        inst.updated_at = now;
        self.store.put(&guard, &inst)?;
        info!("renewed instance {id} until {until}");
        Ok(inst)
    }

    pub fn get(&self, op: &Operator, id: &InstanceId) -> Result<Instance, CoreError> {
        let inst = self.load(id)?;
        self.authorize(op, &inst)?;
        Ok(inst)
    }

    /// List instances visible to `op`. Without an honoured admin override
    /// the owner filter is forced to the operator.
    pub fn list(&self, op: &Operator, filter: &InstanceFilter) -> Result<Vec<Instance>, CoreError> {
        let mut filter = filter.clone();
        if !self.admin_override(op) {
            filter.owner = Some(op.id.clone());
        }
        Ok(self.store.list(&filter)?)
    }

    fn check_request(&self, req: &CreateRequest) -> Result<(), CoreError> {
        let policy = &self.config.policy;
        validate_instance_name(&req.name).map_err(|e| CoreError::InvalidSpec(e.to_string()))?;
        req.spec
            .validate()
            .map_err(|e| CoreError::InvalidSpec(e.to_string()))?;

        if let Some(pattern) = policy.blocked_pattern(&req.spec.image) {
            warn!(
                "rejected image '{}': matches blocked pattern '{pattern}'",
                req.spec.image
            );
            return Err(CoreError::InvalidSpec(format!(
                "image '{}' is not allowed on this host",
                req.spec.image
            )));
        }
        if let (Some(max), Some(cpu)) = (policy.max_cpu_millis, req.spec.cpu_millis) {
            if cpu > max {
                return Err(CoreError::InvalidSpec(format!(
                    "cpu limit {cpu}m exceeds the host maximum of {max}m"
                )));
            }
        }
        if let (Some(max), Some(mem)) = (policy.max_memory_mb, req.spec.memory_mb) {
            if mem > max {
                return Err(CoreError::InvalidSpec(format!(
                    "memory limit {mem}MB exceeds the host maximum of {max}MB"
                )));
            }
        }
        Ok(())
    }

    fn check_quota(&self, op: &Operator, name: &str) -> Result<(), CoreError> {
        let policy = &self.config.policy;
        if self.store.count_active(Some(&op.id))? >= policy.max_instances_per_owner as usize {
            return Err(CoreError::QuotaExceeded {
                owner: op.id.to_string(),
                limit: policy.max_instances_per_owner,
            });
        }
        let owned = self
            .store
            .list(&InstanceFilter::owned_by(op.id.clone()))?;
        if owned.iter().any(|i| i.name.eq_ignore_ascii_case(name)) {
            return Err(CoreError::NameConflict {
                owner: op.id.to_string(),
                name: name.to_owned(),
            });
        }
        // Counted outside any host-wide guard, so concurrent creates by
        // different owners can overshoot the cap by a few.
        if self.store.count_active(None)? >= policy.max_instances_total as usize {
            return Err(CoreError::CapacityExhausted {
                limit: policy.max_instances_total,
            });
        }
        Ok(())
    }

    fn allocate_id(
        &self,
        owner: &OperatorId,
        name: &str,
        now: DateTime<Utc>,
    ) -> Result<InstanceId, CoreError> {
        loop {
            let seq = self.sequence.fetch_add(1, Ordering::Relaxed);
            let nanos = now.timestamp_nanos_opt().unwrap_or_default();
            let seed = format!("{owner}:{name}:{nanos}:{seq}:{}", std::process::id());
            let hex = blake3::hash(seed.as_bytes()).to_hex();
            let id = InstanceId::new(&hex.as_str()[..ID_LEN]);
            if !self.store.contains(&id)? {
                return Ok(id);
            }
            debug!("instance id {id} already taken, drawing again");
        }
    }

    fn create_in_engine(
        &self,
        guard: &IdGuard<'_>,
        inst: &mut Instance,
    ) -> Result<(), CoreError> {
        let spec = CreateSpec {
            name: container_name(&inst.id, &inst.name),
            owner: inst.owner.clone(),
            instance: inst.id.clone(),
            network: self.config.engine.network.clone(),
            resources: inst.resource_spec.clone(),
            extra_env: self.config.engine.env.clone(),
        };

        match self.engine.create(&spec) {
            Ok(engine_ref) => {
                debug!("engine created {engine_ref} for instance {}", inst.id);
                inst.engine_ref = Some(engine_ref);
                inst.succeed(InstanceStatus::Running, "created", Utc::now());
                self.commit(guard, inst)
            }
            Err(e) => {
                warn!("create failed for instance {}: {e}", inst.id);
                inst.fail(LifecycleAction::Create, e.to_string(), Utc::now());
                self.commit(guard, inst)?;
                Err(CoreError::EngineCreate {
                    id: inst.id.to_string(),
                    source: e,
                })
            }
        }
    }

    fn operate(
        &self,
        op: &Operator,
        id: &InstanceId,
        action: LifecycleAction,
    ) -> Result<Instance, CoreError> {
        let guard = self.store.lock(id.as_str())?;
        let mut inst = self.load(id)?;
        self.authorize(op, &inst)?;
        check_action(inst.status, action)?;
        self.drive(&guard, &mut inst, action)?;
        Ok(inst)
    }

    /// Run `action` against the engine and commit the result. Callers have
    /// already checked that the action is allowed from the current status.
    fn drive(
        &self,
        guard: &IdGuard<'_>,
        inst: &mut Instance,
        action: LifecycleAction,
    ) -> Result<(), CoreError> {
        let engine_ref = inst
            .engine_ref
            .clone()
            .ok_or(CoreError::Record(RecordError::MissingEngineRef(inst.status)))?;

        debug!("{action} {} via {}", inst.id, self.engine.name());
        let outcome = match action {
            LifecycleAction::Start => self.engine.start(&engine_ref),
            LifecycleAction::Stop => self.engine.stop(&engine_ref),
            LifecycleAction::Remove => self.engine.remove(&engine_ref).map(|outcome| {
                if outcome == RemoveOutcome::AlreadyAbsent {
                    debug!("container {engine_ref} was already gone");
                }
            }),
            LifecycleAction::Create => {
                return Err(CoreError::InvalidTransition {
                    from: inst.status.to_string(),
                    to: "create".to_owned(),
                })
            }
        };

        match outcome {
            Ok(()) => {
                let target = action.target_status();
                info!("instance {}: {} -> {target}", inst.id, inst.status);
                inst.succeed(target, past_tense(action), Utc::now());
                self.commit(guard, inst)
            }
            Err(e) => {
                warn!("{action} failed for instance {}: {e}", inst.id);
                inst.fail(action, e.to_string(), Utc::now());
                self.commit(guard, inst)?;
                Err(match e {
                    EngineError::NotFound(handle) => CoreError::EngineNotFound {
                        id: inst.id.to_string(),
                        engine_ref: handle,
                    },
                    source => CoreError::EngineOp {
                        id: inst.id.to_string(),
                        action,
                        source,
                    },
                })
            }
        }
    }

    /// Persist a record after the engine has acted on it.
    fn commit(&self, guard: &IdGuard<'_>, inst: &Instance) -> Result<(), CoreError> {
        self.store.put(guard, inst).map_err(|source| {
            error!(
                "instance {} is {} in the engine but the store write failed: {source}",
                inst.id, inst.status
            );
            CoreError::PersistenceInconsistency {
                id: inst.id.to_string(),
                source,
            }
        })
    }

    fn load(&self, id: &InstanceId) -> Result<Instance, CoreError> {
        self.store
            .get(id)?
            .ok_or_else(|| CoreError::InstanceNotFound(id.to_string()))
    }

    fn admin_override(&self, op: &Operator) -> bool {
        op.admin && self.config.policy.allow_admin_override
    }

    fn authorize(&self, op: &Operator, inst: &Instance) -> Result<(), CoreError> {
        if inst.owner == op.id {
            return Ok(());
        }
        if self.admin_override(op) {
            info!(
                "admin {} acting on instance {} owned by {}",
                op.id, inst.id, inst.owner
            );
            return Ok(());
        }
        Err(CoreError::NotOwner {
            operator: op.id.to_string(),
            id: inst.id.to_string(),
        })
    }
}

fn past_tense(action: LifecycleAction) -> &'static str {
    match action {
        LifecycleAction::Create => "created",
        LifecycleAction::Start => "started",
        LifecycleAction::Stop => "stopped",
        LifecycleAction::Remove => "deleted",
    }
}

/// `base` plus `hours`, or `InvalidSpec` when the result leaves chrono's range.
fn expiry_after(base: DateTime<Utc>, hours: u64) -> Result<DateTime<Utc>, CoreError> {
    i64::try_from(hours)
        .ok()
        .and_then(ChronoDuration::try_hours)
        .and_then(|ttl| base.checked_add_signed(ttl))
        .ok_or_else(|| CoreError::InvalidSpec(format!("{hours} hours is out of range")))
}
