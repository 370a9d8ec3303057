use crate::CoreError;
use roost_schema::{InstanceStatus, LifecycleAction};

/// Whether the store may move an instance from `from` to `to`.
pub fn validate_transition(from: InstanceStatus, to: InstanceStatus) -> Result<(), CoreError> {
    let valid = matches!(
        (from, to),
        (
            InstanceStatus::Pending,
            InstanceStatus::Running | InstanceStatus::Stopped
        ) | (InstanceStatus::Running, InstanceStatus::Stopped)
            | (InstanceStatus::Stopped, InstanceStatus::Running)
            | (
                InstanceStatus::Running | InstanceStatus::Stopped,
                InstanceStatus::Expired
            )
            | (
                InstanceStatus::Pending
                    | InstanceStatus::Running
                    | InstanceStatus::Stopped
                    | InstanceStatus::Expired
                    | InstanceStatus::Error,
                InstanceStatus::Removed | InstanceStatus::Error
            )
            | (
                InstanceStatus::Error,
                InstanceStatus::Running | InstanceStatus::Stopped
            )
    );

    if valid {
        Ok(())
    } else {
        Err(CoreError::InvalidTransition {
            from: from.to_string(),
            to: to.to_string(),
        })
    }
}

/// Whether an operator may request `action` on an instance in `status`.
///
/// Recovery from `error` goes through retry, so plain start and stop are
/// refused there even though the target status would be reachable.
pub fn check_action(status: InstanceStatus, action: LifecycleAction) -> Result<(), CoreError> {
    let allowed = match action {
        LifecycleAction::Create => false,
        LifecycleAction::Start => status == InstanceStatus::Stopped,
        LifecycleAction::Stop => status == InstanceStatus::Running,
        LifecycleAction::Remove => status != InstanceStatus::Removed,
    };
    if allowed {
        Ok(())
    } else {
        Err(CoreError::InvalidTransition {
            from: status.to_string(),
            to: action.target_status().to_string(),
        })
    }
}
