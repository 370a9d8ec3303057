//! Lifecycle orchestration for Roost instances.
//!
//! This crate ties the instance store and the container engine together. The
//! [`LifecycleManager`] is the only writer of operator-driven transitions: it
//! enforces ownership, quota and image policy, drives the engine, and commits
//! the resulting record. The [`Reconciler`] sweeps the store against the
//! engine to repair drift and retire expired instances.

pub mod concurrency;
pub mod lifecycle;
pub mod manager;
pub mod reconciler;

pub use concurrency::{install_signal_handler, shutdown_requested, DaemonLock};
pub use lifecycle::{check_action, validate_transition};
pub use manager::{CreateRequest, LifecycleManager, Operator};
pub use reconciler::{Reconciler, SweepFailure, SweepReport};

use roost_engine::EngineError;
use roost_schema::{ConfigError, LifecycleAction, RecordError};
use roost_store::StoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("operator '{operator}' does not own instance '{id}'")]
    NotOwner { operator: String, id: String },
    #[error("quota exceeded: '{owner}' already has {limit} active instance(s)")]
    QuotaExceeded { owner: String, limit: u32 },
    #[error("host capacity reached: {limit} active instance(s)")]
    CapacityExhausted { limit: u32 },
    #[error("invalid resource spec: {0}")]
    InvalidSpec(String),
    #[error("'{owner}' already has an active instance named '{name}'")]
    NameConflict { owner: String, name: String },
    #[error("instance not found: {0}")]
    InstanceNotFound(String),
    #[error("invalid state transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },
    #[error("engine failed to create instance '{id}': {source}")]
    EngineCreate {
        id: String,
        #[source]
        source: EngineError,
    },
    #[error("engine failed to {action} instance '{id}': {source}")]
    EngineOp {
        id: String,
        action: LifecycleAction,
        #[source]
        source: EngineError,
    },
    #[error("container '{engine_ref}' of instance '{id}' is gone from the engine")]
    EngineNotFound { id: String, engine_ref: String },
    #[error("engine state of '{id}' changed but the store write failed: {source}")]
    PersistenceInconsistency {
        id: String,
        #[source]
        source: StoreError,
    },
    #[error("another daemon already holds {0}")]
    DaemonRunning(std::path::PathBuf),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("engine error: {0}")]
    Engine(#[from] EngineError),
    #[error("config error: {0}")]
    Config(#[from] ConfigError),
    #[error("record error: {0}")]
    Record(#[from] RecordError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl CoreError {
    /// Rejections decided by policy before any side effect.
    pub fn is_policy_rejection(&self) -> bool {
        matches!(
            self,
            CoreError::NotOwner { .. }
                | CoreError::QuotaExceeded { .. }
                | CoreError::CapacityExhausted { .. }
                | CoreError::InvalidSpec(_)
                | CoreError::NameConflict { .. }
                | CoreError::Record(_)
        )
    }

    pub fn is_store_failure(&self) -> bool {
        matches!(
            self,
            CoreError::Store(_) | CoreError::PersistenceInconsistency { .. }
        )
    }

    /// Process exit code for the CLI: 2 for policy rejections, 3 for store
    /// failures, 1 for everything else.
    pub fn exit_code(&self) -> i32 {
        if self.is_policy_rejection() {
            2
        } else if self.is_store_failure() {
            3
        } else {
            1
        }
    }
}
