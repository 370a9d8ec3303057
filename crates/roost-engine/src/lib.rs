//! Container engine adapters for Roost.
//!
//! The [`EngineAdapter`] trait is the only way the rest of the system touches
//! containers. [`DockerEngine`] drives the local `docker` CLI with per-call
//! timeouts; [`MockEngine`] keeps an in-memory (optionally file-backed)
//! container table with fault injection for tests.

pub mod backend;
pub mod docker;
pub mod mock;

pub use backend::{select_engine, CreateSpec, EngineAdapter, EngineStatus, RemoveOutcome};
pub use docker::DockerEngine;
pub use mock::{MockContainer, MockEngine, MockFault, MockOp, MOCK_STATE_FILE};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("engine I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("engine backend '{0}' is not available on this system")]
    Unavailable(String),
    #[error("container creation failed: {0}")]
    Create(String),
    #[error("engine {op} failed for '{target}': {message}")]
    Op {
        op: &'static str,
        target: String,
        message: String,
    },
    #[error("container '{0}' not found")]
    NotFound(String),
    #[error("'{command}' timed out after {secs}s")]
    Timeout { command: String, secs: u64 },
    #[error("engine state error: {0}")]
    State(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engine_error_display_op() {
        let e = EngineError::Op {
            op: "stop",
            target: "abc".to_owned(),
            message: "boom".to_owned(),
        };
        let msg = e.to_string();
        assert!(msg.contains("stop"));
        assert!(msg.contains("abc"));
        assert!(msg.contains("boom"));
    }

    #[test]
    fn engine_error_display_timeout() {
        let e = EngineError::Timeout {
            command: "docker start x".to_owned(),
            secs: 120,
        };
        assert!(e.to_string().contains("120s"));
    }
}
