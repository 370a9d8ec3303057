use crate::EngineError;
use roost_schema::{EngineRef, EngineSection, InstanceId, OperatorId, ResourceSpec};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Everything the engine needs to create one container.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CreateSpec {
    /// Container name, also used as its hostname.
    pub name: String,
    pub owner: OperatorId,
    pub instance: InstanceId,
    pub network: String,
    pub resources: ResourceSpec,
    /// Host-wide variables injected into every container. They take precedence
    /// over the per-instance environment.
    pub extra_env: BTreeMap<String, String>,
}

impl CreateSpec {
    /// Effective container environment.
    pub fn env(&self) -> BTreeMap<String, String> {
        let mut env = self.resources.env.clone();
        env.extend(
            self.extra_env
                .iter()
                .map(|(k, v)| (k.clone(), v.clone())),
        );
        env
    }
}

/// What the engine reports for a container handle.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum EngineStatus {
    Running,
    Stopped,
    /// The engine has no container under this handle.
    Absent,
}

impl std::fmt::Display for EngineStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineStatus::Running => write!(f, "running"),
            EngineStatus::Stopped => write!(f, "stopped"),
            EngineStatus::Absent => write!(f, "absent"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoveOutcome {
    Removed,
    /// Nothing to remove. Counts as success.
    AlreadyAbsent,
}

/// Narrow interface to the container engine.
///
/// Implementations never touch the instance store. Operations on containers
/// that are already in the requested state succeed.
pub trait EngineAdapter: Send + Sync {
    fn name(&self) -> &str;

    fn available(&self) -> bool;

    /// Create and start a container, returning its engine handle.
    fn create(&self, spec: &CreateSpec) -> Result<EngineRef, EngineError>;

    fn start(&self, engine_ref: &EngineRef) -> Result<(), EngineError>;

    fn stop(&self, engine_ref: &EngineRef) -> Result<(), EngineError>;

    fn remove(&self, engine_ref: &EngineRef) -> Result<RemoveOutcome, EngineError>;

    fn inspect(&self, engine_ref: &EngineRef) -> Result<EngineStatus, EngineError>;
}

/// Build the engine named in the `[engine]` config section. The mock engine
/// persists its container table under `state_dir`.
pub fn select_engine(
    section: &EngineSection,
    state_dir: &Path,
) -> Result<Arc<dyn EngineAdapter>, EngineError> {
    match section.backend.as_str() {
        "docker" => Ok(Arc::new(
            crate::docker::DockerEngine::new()
                .with_timeout(Duration::from_secs(section.timeout_secs))
                .with_stop_grace(section.stop_grace_secs),
        )),
        "mock" => Ok(Arc::new(crate::mock::MockEngine::with_state_file(
            state_dir.join(crate::mock::MOCK_STATE_FILE),
        )?)),
        other => Err(EngineError::Unavailable(other.to_owned())),
    }
}
