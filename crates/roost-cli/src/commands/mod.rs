pub mod completions;
pub mod control;
pub mod create;
pub mod inspect;
pub mod list;
pub mod migrate;
pub mod reconcile;
pub mod renew;

use indicatif::{ProgressBar, ProgressStyle};
use roost_core::{CoreError, LifecycleManager, Operator};
use roost_engine::{select_engine, EngineError};
use roost_schema::{Config, ConfigError, Instance, InstanceId};
use roost_store::{open_store, InstanceFilter, StoreError};
use std::fmt;
use std::time::Duration;

pub const EXIT_SUCCESS: u8 = 0;
pub const EXIT_FAILURE: u8 = 1;
pub const EXIT_POLICY_REJECTED: u8 = 2;
pub const EXIT_STORE_ERROR: u8 = 3;

/// A failed command: the message for stderr and the process exit code.
#[derive(Debug)]
pub struct CommandError {
    pub code: u8,
    pub message: String,
}

impl CommandError {
    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            code: EXIT_FAILURE,
            message: message.into(),
        }
    }
}

impl fmt::Display for CommandError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl From<CoreError> for CommandError {
    fn from(e: CoreError) -> Self {
        Self {
            code: u8::try_from(e.exit_code()).unwrap_or(EXIT_FAILURE),
            message: e.to_string(),
        }
    }
}

impl From<StoreError> for CommandError {
    fn from(e: StoreError) -> Self {
        Self {
            code: EXIT_STORE_ERROR,
            message: format!("store error: {e}"),
        }
    }
}

impl From<EngineError> for CommandError {
    fn from(e: EngineError) -> Self {
        Self::failure(format!("engine error: {e}"))
    }
}

impl From<ConfigError> for CommandError {
    fn from(e: ConfigError) -> Self {
        Self::failure(format!("config error: {e}"))
    }
}

pub type CommandResult = Result<u8, CommandError>;

/// Everything a command needs from the global flags.
pub struct Context {
    pub config: Config,
    pub operator: Option<Operator>,
    pub json: bool,
}

impl Context {
    pub fn operator(&self) -> Result<&Operator, CommandError> {
        self.operator.as_ref().ok_or_else(|| {
            CommandError::failure("no operator given: pass --operator or set ROOST_OPERATOR")
        })
    }

    /// Wire the configured store and engine into a lifecycle manager.
    pub fn manager(&self) -> Result<LifecycleManager, CommandError> {
        let store = open_store(&self.config.store)?;
        let engine = select_engine(&self.config.engine, &self.config.engine_state_dir())?;
        if !engine.available() {
            return Err(CommandError::failure(format!(
                "engine '{}' is not available on this host",
                engine.name()
            )));
        }
        Ok(LifecycleManager::new(store, engine, self.config.clone()))
    }
}

pub fn json_pretty(value: &impl serde::Serialize) -> Result<String, CommandError> {
    serde_json::to_string_pretty(value)
        .map_err(|e| CommandError::failure(format!("JSON serialization failed: {e}")))
}

fn plain_style() -> ProgressStyle {
    ProgressStyle::with_template("{msg}").unwrap_or_else(|_| ProgressStyle::default_spinner())
}

pub fn spinner(msg: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::with_template("{spinner:.cyan} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]),
    );
    pb.set_message(msg.to_owned());
    pb.enable_steady_tick(Duration::from_millis(80));
    pb
}

pub fn spin_ok(pb: &ProgressBar, msg: &str) {
    pb.set_style(plain_style());
    pb.finish_with_message(format!("✓ {msg}"));
}

pub fn spin_fail(pb: &ProgressBar, msg: &str) {
    pb.set_style(plain_style());
    pb.finish_with_message(format!("✗ {msg}"));
}

pub fn colorize_status(status: &str) -> String {
    use console::Style;
    match status {
        "running" => Style::new().green().bold().apply_to(status).to_string(),
        "pending" => Style::new().yellow().apply_to(status).to_string(),
        "stopped" => Style::new().blue().apply_to(status).to_string(),
        "error" => Style::new().red().bold().apply_to(status).to_string(),
        "expired" | "removed" => Style::new().dim().apply_to(status).to_string(),
        other => other.to_owned(),
    }
}

/// Resolve a full id, a unique id prefix, or an active instance name among
/// the instances visible to `op`.
pub fn resolve_instance(
    mgr: &LifecycleManager,
    op: &Operator,
    input: &str,
) -> Result<InstanceId, CommandError> {
    let visible = mgr.list(op, &InstanceFilter::all())?;

    if let Some(inst) = visible.iter().find(|i| i.id.as_str() == input) {
        return Ok(inst.id.clone());
    }
    if let Some(inst) = visible.iter().find(|i| i.is_active() && i.name == input) {
        return Ok(inst.id.clone());
    }

    let matches: Vec<&Instance> = visible
        .iter()
        .filter(|i| i.id.starts_with(input))
        .collect();
    match matches.as_slice() {
        [] => Ok(InstanceId::new(input)),
        [one] => Ok(one.id.clone()),
        many => Err(CommandError::failure(format!(
            "ambiguous instance prefix '{input}': matches {} instances",
            many.len()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use roost_core::CreateRequest;
    use roost_schema::{ResourceSpec, StoreBackend};

    fn mock_context(dir: &std::path::Path) -> Context {
        let mut config = Config::default();
        config.store.backend = StoreBackend::Sqlite;
        config.store.path = dir.to_path_buf();
        config.engine.backend = "mock".to_owned();
        Context {
            config,
            operator: Some(Operator::new("alice")),
            json: false,
        }
    }

    #[test]
    fn json_pretty_serializes_object() {
        let val = serde_json::json!({"key": "value"});
        let result = json_pretty(&val).unwrap();
        assert!(result.contains("\"key\""));
        assert!(result.contains("\"value\""));
    }

    #[test]
    fn colorize_status_keeps_text() {
        for status in ["running", "pending", "stopped", "error", "expired", "removed"] {
            assert!(colorize_status(status).contains(status));
        }
        assert_eq!(colorize_status("unknown"), "unknown");
    }

    #[test]
    fn exit_codes_are_distinct() {
        assert_ne!(EXIT_SUCCESS, EXIT_FAILURE);
        assert_ne!(EXIT_FAILURE, EXIT_POLICY_REJECTED);
        assert_ne!(EXIT_POLICY_REJECTED, EXIT_STORE_ERROR);
    }

    #[test]
    fn core_errors_keep_their_exit_code() {
        let err: CommandError = CoreError::NotOwner {
            operator: "bob".to_owned(),
            id: "x".to_owned(),
        }
        .into();
        assert_eq!(err.code, EXIT_POLICY_REJECTED);
        let err: CommandError = StoreError::ReadOnly.into();
        assert_eq!(err.code, EXIT_STORE_ERROR);
    }

    #[test]
    fn missing_operator_is_a_failure() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = mock_context(dir.path());
        ctx.operator = None;
        assert_eq!(ctx.operator().unwrap_err().code, EXIT_FAILURE);
    }

    #[test]
    fn resolve_by_name_and_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = mock_context(dir.path());
        let mgr = ctx.manager().unwrap();
        let op = ctx.operator().unwrap();
        let inst = mgr
            .create(op, CreateRequest::new("web", ResourceSpec::new("alpine")))
            .unwrap();

        assert_eq!(resolve_instance(&mgr, op, "web").unwrap(), inst.id);
        assert_eq!(resolve_instance(&mgr, op, &inst.id[..6]).unwrap(), inst.id);
        assert_eq!(
            resolve_instance(&mgr, op, "nothing-like-it").unwrap().as_str(),
            "nothing-like-it"
        );
    }

    #[test]
    fn spinner_finishes() {
        let pb = spinner("testing...");
        spin_ok(&pb, "done");
        let pb = spinner("testing...");
        spin_fail(&pb, "failed");
    }
}
