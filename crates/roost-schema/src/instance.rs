use crate::resources::ResourceSpec;
use crate::types::{EngineRef, InstanceId, OperatorId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RecordError {
    #[error("instance id must not be empty")]
    EmptyId,
    #[error("instance owner must not be empty")]
    EmptyOwner,
    #[error("invalid instance name: {0}")]
    InvalidName(String),
    #[error("status '{0}' requires an engine_ref")]
    MissingEngineRef(InstanceStatus),
    #[error("removed instance still carries engine_ref '{0}'")]
    StaleEngineRef(String),
    #[error("expires_at precedes created_at")]
    ExpiryBeforeCreation,
    #[error("invalid resource spec: {0}")]
    InvalidSpec(String),
    #[error("transition log ends in '{logged}' but status is '{status}'")]
    InconsistentLog {
        logged: InstanceStatus,
        status: InstanceStatus,
    },
    #[error("unknown status '{0}'")]
    UnknownStatus(String),
    #[error("unknown lifecycle action '{0}'")]
    UnknownAction(String),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum InstanceStatus {
    Pending,
    Running,
    Stopped,
    Expired,
    Removed,
    Error,
}

impl InstanceStatus {
    pub const ALL: [InstanceStatus; 6] = [
        InstanceStatus::Pending,
        InstanceStatus::Running,
        InstanceStatus::Stopped,
        InstanceStatus::Expired,
        InstanceStatus::Removed,
        InstanceStatus::Error,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            InstanceStatus::Pending => "pending",
            InstanceStatus::Running => "running",
            InstanceStatus::Stopped => "stopped",
            InstanceStatus::Expired => "expired",
            InstanceStatus::Removed => "removed",
            InstanceStatus::Error => "error",
        }
    }

    /// Everything except the `removed` tombstone counts toward quota.
    pub fn is_active(self) -> bool {
        self != InstanceStatus::Removed
    }

    /// Stable states that an instance settles in between operator requests.
    pub fn is_stable(self) -> bool {
        matches!(self, InstanceStatus::Running | InstanceStatus::Stopped)
    }
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for InstanceStatus {
    type Err = RecordError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        InstanceStatus::ALL
            .into_iter()
            .find(|st| st.as_str() == s)
            .ok_or_else(|| RecordError::UnknownStatus(s.to_owned()))
    }
}

/// Operator-level action that drives the engine. Recorded on failure so
/// `retry` knows what to re-attempt.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleAction {
    Create,
    Start,
    Stop,
    Remove,
}

impl LifecycleAction {
    pub fn as_str(self) -> &'static str {
        match self {
            LifecycleAction::Create => "create",
            LifecycleAction::Start => "start",
            LifecycleAction::Stop => "stop",
            LifecycleAction::Remove => "remove",
        }
    }

    /// Status the instance reaches when the action succeeds.
    pub fn target_status(self) -> InstanceStatus {
        match self {
            LifecycleAction::Create | LifecycleAction::Start => InstanceStatus::Running,
            LifecycleAction::Stop => InstanceStatus::Stopped,
            LifecycleAction::Remove => InstanceStatus::Removed,
        }
    }
}

impl fmt::Display for LifecycleAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LifecycleAction {
    type Err = RecordError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "create" => Ok(LifecycleAction::Create),
            "start" => Ok(LifecycleAction::Start),
            "stop" => Ok(LifecycleAction::Stop),
            "remove" => Ok(LifecycleAction::Remove),
            other => Err(RecordError::UnknownAction(other.to_owned())),
        }
    }
}

/// One entry of an instance's status history.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct Transition {
    pub from: Option<InstanceStatus>,
    pub to: InstanceStatus,
    pub at: DateTime<Utc>,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Instance {
    pub id: InstanceId,
    pub owner: OperatorId,
    pub name: String,
    #[serde(default)]
    pub engine_ref: Option<EngineRef>,
    pub status: InstanceStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    pub resource_spec: ResourceSpec,
    #[serde(default)]
    pub last_error: Option<String>,
    #[serde(default)]
    pub last_action: Option<LifecycleAction>,
    #[serde(default)]
    pub transitions: Vec<Transition>,
}

impl Instance {
    /// A freshly allocated record, before the engine has been asked for anything.
    ///
    /// `engine_ref` carries the container name the engine will be asked to
    /// create, so a crash mid-creation still leaves a handle to clean up.
    pub fn new_pending(
        id: InstanceId,
        owner: OperatorId,
        name: &str,
        resource_spec: ResourceSpec,
        now: DateTime<Utc>,
        expires_at: Option<DateTime<Utc>>,
    ) -> Self {
        let engine_ref = EngineRef::new(container_name(&id, name));
        Self {
            id,
            owner,
            name: name.to_owned(),
            engine_ref: Some(engine_ref),
            status: InstanceStatus::Pending,
            created_at: now,
            updated_at: now,
            expires_at,
            resource_spec,
            last_error: None,
            last_action: Some(LifecycleAction::Create),
            transitions: vec![Transition {
                from: None,
                to: InstanceStatus::Pending,
                at: now,
                reason: "create requested".to_owned(),
            }],
        }
    }

    /// Move to `to`, appending to the transition log. A no-op status change
    /// still refreshes `updated_at` but is not logged.
    pub fn transition(&mut self, to: InstanceStatus, reason: impl Into<String>, now: DateTime<Utc>) {
        if self.status != to {
            self.transitions.push(Transition {
                from: Some(self.status),
                to,
                at: now,
                reason: reason.into(),
            });
            self.status = to;
        }
        self.updated_at = now;
        if to == InstanceStatus::Removed {
            self.engine_ref = None;
        }
    }

    /// Record a successful transition: clears `last_error` and `last_action`.
    pub fn succeed(&mut self, to: InstanceStatus, reason: impl Into<String>, now: DateTime<Utc>) {
        self.transition(to, reason, now);
        self.last_error = None;
        self.last_action = None;
    }

    /// Record a failed engine action: moves to `error` and keeps the action for retry.
    pub fn fail(&mut self, action: LifecycleAction, message: impl Into<String>, now: DateTime<Utc>) {
        let message = message.into();
        self.transition(InstanceStatus::Error, format!("{action} failed"), now);
        self.last_error = Some(message);
        self.last_action = Some(action);
    }

    pub fn is_active(&self) -> bool {
        self.status.is_active()
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }

    /// The most recent stable status before the current one, if any.
    pub fn prior_stable_status(&self) -> Option<InstanceStatus> {
        self.transitions
            .iter()
            .rev()
            .filter_map(|t| t.from)
            .find(|s| s.is_stable())
    }

    pub fn validate(&self) -> Result<(), RecordError> {
        if self.id.is_blank() {
            return Err(RecordError::EmptyId);
        }
        if self.owner.is_blank() {
            return Err(RecordError::EmptyOwner);
        }
        validate_instance_name(&self.name)?;

        match (&self.engine_ref, self.status) {
            (Some(r), InstanceStatus::Removed) => {
                return Err(RecordError::StaleEngineRef(r.to_string()));
            }
            (None, status) if status != InstanceStatus::Removed => {
                return Err(RecordError::MissingEngineRef(status));
            }
            (Some(r), status) if r.is_blank() => {
                return Err(RecordError::MissingEngineRef(status));
            }
            _ => {}
        }

        if let Some(expires_at) = self.expires_at {
            if expires_at < self.created_at {
                return Err(RecordError::ExpiryBeforeCreation);
            }
        }

        if let Some(last) = self.transitions.last() {
            if last.to != self.status {
                return Err(RecordError::InconsistentLog {
                    logged: last.to,
                    status: self.status,
                });
            }
        }

        self.resource_spec.validate()
    }
}

pub fn validate_instance_name(name: &str) -> Result<(), RecordError> {
    if name.is_empty() || name.len() > 64 {
        return Err(RecordError::InvalidName(
            "instance name must be 1-64 characters".to_owned(),
        ));
    }
    if !name
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
    {
        return Err(RecordError::InvalidName(
            "instance name must match [a-zA-Z0-9_-]".to_owned(),
        ));
    }
    Ok(())
}

/// Name of the engine container backing an instance.
pub fn container_name(id: &InstanceId, name: &str) -> String {
    format!("roost-{}-{}", name.to_ascii_lowercase(), id.short())
}
