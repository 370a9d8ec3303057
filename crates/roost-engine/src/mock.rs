//! In-process engine for tests and dry runs.
//!
//! Keeps a container table keyed by name. With a state file the table is
//! reloaded and rewritten around every call, so separate processes (the CLI
//! and its tests) see the same containers. Faults can be queued per operation
//! and containers removed behind the manager's back to simulate drift.

use crate::backend::{CreateSpec, EngineAdapter, EngineStatus, RemoveOutcome};
use crate::EngineError;
use roost_schema::EngineRef;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Mutex, PoisonError};
use tempfile::NamedTempFile;

pub const MOCK_STATE_FILE: &str = "mock-engine.json";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum MockOp {
    Create,
    Start,
    Stop,
    Remove,
    Inspect,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MockFault {
    /// The operation fails with this message.
    Fail(String),
    /// The operation reports a timeout.
    Timeout,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MockContainer {
    pub id: String,
    pub name: String,
    pub image: String,
    pub owner: String,
    pub running: bool,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct MockState {
    #[serde(default)]
    containers: BTreeMap<String, MockContainer>,
    #[serde(default)]
    faults: Vec<(MockOp, MockFault)>,
    #[serde(default)]
    calls: BTreeMap<MockOp, u64>,
    #[serde(default)]
    created: u64,
}

impl MockState {
    /// Name of the container addressed by `handle`, which may be an id or a name.
    fn resolve(&self, handle: &str) -> Option<String> {
        if self.containers.contains_key(handle) {
            return Some(handle.to_owned());
        }
        self.containers
            .values()
            .find(|c| c.id == handle)
            .map(|c| c.name.clone())
    }

    fn take_fault(&mut self, op: MockOp) -> Option<MockFault> {
        let pos = self.faults.iter().position(|(o, _)| *o == op)?;
        Some(self.faults.remove(pos).1)
    }
}

#[derive(Default)]
pub struct MockEngine {
    state: Mutex<MockState>,
    state_file: Option<PathBuf>,
}

impl MockEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// A mock whose container table lives in `path`.
    pub fn with_state_file(path: impl Into<PathBuf>) -> Result<Self, EngineError> {
        let engine = Self {
            state: Mutex::new(MockState::default()),
            state_file: Some(path.into()),
        };
        engine.with_state(|_| Ok(()))?;
        Ok(engine)
    }

    fn load(&self) -> Result<Option<MockState>, EngineError> {
        let Some(path) = &self.state_file else {
            return Ok(None);
        };
        if !path.exists() {
            return Ok(Some(MockState::default()));
        }
        let content = std::fs::read_to_string(path)?;
        serde_json::from_str(&content)
            .map(Some)
            .map_err(|e| EngineError::State(format!("{}: {e}", path.display())))
    }

    fn save(&self, state: &MockState) -> Result<(), EngineError> {
        let Some(path) = &self.state_file else {
            return Ok(());
        };
        let dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| std::path::Path::new("."));
        std::fs::create_dir_all(dir)?;
        let content = serde_json::to_string_pretty(state)
            .map_err(|e| EngineError::State(e.to_string()))?;
        let mut tmp = NamedTempFile::new_in(dir)?;
        tmp.write_all(content.as_bytes())?;
        tmp.as_file().sync_all()?;
        tmp.persist(path).map_err(|e| EngineError::Io(e.error))?;
        Ok(())
    }

    fn with_state<T>(
        &self,
        f: impl FnOnce(&mut MockState) -> Result<T, EngineError>,
    ) -> Result<T, EngineError> {
        let mut guard = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(loaded) = self.load()? {
            *guard = loaded;
        }
        let result = f(&mut guard);
        self.save(&guard)?;
        result
    }

    /// Count the call, then apply any queued fault for `op`.
    fn enter(state: &mut MockState, op: MockOp, target: &str) -> Result<(), EngineError> {
        *state.calls.entry(op).or_insert(0) += 1;
        match state.take_fault(op) {
            None => Ok(()),
            Some(MockFault::Timeout) => Err(EngineError::Timeout {
                command: format!("mock {} {target}", op_name(op)),
                secs: 0,
            }),
            Some(MockFault::Fail(message)) if op == MockOp::Create => {
                Err(EngineError::Create(message))
            }
            Some(MockFault::Fail(message)) => Err(EngineError::Op {
                op: op_name(op),
                target: target.to_owned(),
                message,
            }),
        }
    }

    /// Queue a fault for the next call of `op`.
    pub fn inject(&self, op: MockOp, fault: MockFault) -> Result<(), EngineError> {
        self.with_state(|s| {
            s.faults.push((op, fault));
            Ok(())
        })
    }

    pub fn fail_next(&self, op: MockOp, message: &str) -> Result<(), EngineError> {
        self.inject(op, MockFault::Fail(message.to_owned()))
    }

    /// Delete a container without going through the adapter, as an
    /// operator running `docker rm` by hand would.
    pub fn remove_out_of_band(&self, handle: &str) -> Result<bool, EngineError> {
        self.with_state(|s| {
            Ok(match s.resolve(handle) {
                Some(name) => s.containers.remove(&name).is_some(),
                None => false,
            })
        })
    }

    /// Flip a container's run state without going through the adapter.
    pub fn set_running_out_of_band(
        &self,
        handle: &str,
        running: bool,
    ) -> Result<bool, EngineError> {
        self.with_state(|s| {
            let Some(name) = s.resolve(handle) else {
                return Ok(false);
            };
            if let Some(c) = s.containers.get_mut(&name) {
                c.running = running;
            }
            Ok(true)
        })
    }

    pub fn containers(&self) -> Result<Vec<MockContainer>, EngineError> {
        self.with_state(|s| Ok(s.containers.values().cloned().collect()))
    }

    pub fn call_count(&self, op: MockOp) -> Result<u64, EngineError> {
        self.with_state(|s| Ok(s.calls.get(&op).copied().unwrap_or(0)))
    }
}

fn op_name(op: MockOp) -> &'static str {
    match op {
        MockOp::Create => "create",
        MockOp::Start => "start",
        MockOp::Stop => "stop",
        MockOp::Remove => "remove",
        MockOp::Inspect => "inspect",
    }
}

impl EngineAdapter for MockEngine {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn available(&self) -> bool {
        true
    }

    fn create(&self, spec: &CreateSpec) -> Result<EngineRef, EngineError> {
        self.with_state(|s| {
            Self::enter(s, MockOp::Create, &spec.name)?;
            if s.containers.contains_key(&spec.name) {
                return Err(EngineError::Create(format!(
                    "container name '{}' is already in use",
                    spec.name
                )));
            }
            s.created += 1;
            let seed = format!("mock-container:{}:{}", spec.name, s.created);
            let id = blake3::hash(seed.as_bytes()).to_hex().to_string();
            s.containers.insert(
                spec.name.clone(),
                MockContainer {
                    id: id.clone(),
                    name: spec.name.clone(),
                    image: spec.resources.image.clone(),
                    owner: spec.owner.to_string(),
                    running: true,
                },
            );
            Ok(EngineRef::new(id))
        })
    }

    fn start(&self, engine_ref: &EngineRef) -> Result<(), EngineError> {
        self.with_state(|s| {
            Self::enter(s, MockOp::Start, engine_ref)?;
            let name = s
                .resolve(engine_ref)
                .ok_or_else(|| EngineError::NotFound(engine_ref.to_string()))?;
            if let Some(c) = s.containers.get_mut(&name) {
                c.running = true;
            }
            Ok(())
        })
    }

    fn stop(&self, engine_ref: &EngineRef) -> Result<(), EngineError> {
        self.with_state(|s| {
            Self::enter(s, MockOp::Stop, engine_ref)?;
            let name = s
                .resolve(engine_ref)
                .ok_or_else(|| EngineError::NotFound(engine_ref.to_string()))?;
            if let Some(c) = s.containers.get_mut(&name) {
                c.running = false;
            }
            Ok(())
        })
    }

    fn remove(&self, engine_ref: &EngineRef) -> Result<RemoveOutcome, EngineError> {
        self.with_state(|s| {
            Self::enter(s, MockOp::Remove, engine_ref)?;
            Ok(match s.resolve(engine_ref) {
                Some(name) => {
                    s.containers.remove(&name);
                    RemoveOutcome::Removed
                }
                None => RemoveOutcome::AlreadyAbsent,
            })
        })
    }

    fn inspect(&self, engine_ref: &EngineRef) -> Result<EngineStatus, EngineError> {
        self.with_state(|s| {
            Self::enter(s, MockOp::Inspect, engine_ref)?;
            Ok(match s.resolve(engine_ref).and_then(|n| s.containers.get(&n)) {
                Some(c) if c.running => EngineStatus::Running,
                Some(_) => EngineStatus::Stopped,
                None => EngineStatus::Absent,
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use roost_schema::{InstanceId, OperatorId, ResourceSpec};

    fn spec(name: &str) -> CreateSpec {
        CreateSpec {
            name: name.to_owned(),
            owner: OperatorId::new("alice"),
            instance: InstanceId::new("0123456789abcdef"),
            network: "bridge".to_owned(),
            resources: ResourceSpec::new("alpine"),
            extra_env: BTreeMap::new(),
        }
    }

    #[test]
    fn lifecycle_round_trip() {
        let engine = MockEngine::new();
        let r = engine.create(&spec("a")).unwrap();
        assert_eq!(engine.inspect(&r).unwrap(), EngineStatus::Running);
        engine.stop(&r).unwrap();
        assert_eq!(engine.inspect(&r).unwrap(), EngineStatus::Stopped);
        engine.start(&r).unwrap();
        assert_eq!(engine.remove(&r).unwrap(), RemoveOutcome::Removed);
        assert_eq!(engine.remove(&r).unwrap(), RemoveOutcome::AlreadyAbsent);
        assert_eq!(engine.inspect(&r).unwrap(), EngineStatus::Absent);
    }

    #[test]
    fn containers_are_addressable_by_name() {
        let engine = MockEngine::new();
        engine.create(&spec("by-name")).unwrap();
        assert_eq!(
            engine.inspect(&EngineRef::new("by-name")).unwrap(),
            EngineStatus::Running
        );
    }

    #[test]
    fn duplicate_names_fail_creation() {
        let engine = MockEngine::new();
        engine.create(&spec("dup")).unwrap();
        assert!(matches!(
            engine.create(&spec("dup")),
            Err(EngineError::Create(_))
        ));
    }

    #[test]
    fn operations_on_missing_container_report_not_found() {
        let engine = MockEngine::new();
        let r = EngineRef::new("ghost");
        assert!(matches!(engine.start(&r), Err(EngineError::NotFound(_))));
        assert!(matches!(engine.stop(&r), Err(EngineError::NotFound(_))));
    }

    #[test]
    fn injected_faults_fire_once() {
        let engine = MockEngine::new();
        engine.fail_next(MockOp::Create, "no space left").unwrap();
        assert!(matches!(
            engine.create(&spec("a")),
            Err(EngineError::Create(m)) if m == "no space left"
        ));
        let r = engine.create(&spec("a")).unwrap();

        engine.inject(MockOp::Stop, MockFault::Timeout).unwrap();
        assert!(matches!(engine.stop(&r), Err(EngineError::Timeout { .. })));
        engine.stop(&r).unwrap();
        assert_eq!(engine.call_count(MockOp::Create).unwrap(), 2);
    }

    #[test]
    fn out_of_band_removal_is_visible() {
        let engine = MockEngine::new();
        let r = engine.create(&spec("a")).unwrap();
        assert!(engine.remove_out_of_band(r.as_str()).unwrap());
        assert_eq!(engine.inspect(&r).unwrap(), EngineStatus::Absent);
    }

    #[test]
    fn state_file_is_shared_between_engines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(MOCK_STATE_FILE);
        let first = MockEngine::with_state_file(&path).unwrap();
        let r = first.create(&spec("shared")).unwrap();

        let second = MockEngine::with_state_file(&path).unwrap();
        assert_eq!(second.inspect(&r).unwrap(), EngineStatus::Running);
        second.stop(&r).unwrap();
        assert_eq!(first.inspect(&r).unwrap(), EngineStatus::Stopped);
        assert_eq!(first.containers().unwrap().len(), 1);
    }
}
