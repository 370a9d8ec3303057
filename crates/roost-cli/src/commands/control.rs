use super::{
    colorize_status, json_pretty, resolve_instance, spin_fail, spin_ok, spinner, CommandResult,
    Context, EXIT_SUCCESS,
};
use roost_core::{CoreError, LifecycleManager, Operator};
use roost_schema::{Instance, InstanceId};

/// Operator actions that take a single instance and drive the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    Start,
    Stop,
    Delete,
    Retry,
}

impl Control {
    fn verb(self) -> &'static str {
        match self {
            Control::Start => "starting",
            Control::Stop => "stopping",
            Control::Delete => "deleting",
            Control::Retry => "retrying",
        }
    }

    fn apply(
        self,
        mgr: &LifecycleManager,
        op: &Operator,
        id: &InstanceId,
    ) -> Result<Instance, CoreError> {
        match self {
            Control::Start => mgr.start(op, id),
            Control::Stop => mgr.stop(op, id),
            Control::Delete => mgr.delete(op, id),
            Control::Retry => mgr.retry(op, id),
        }
    }
}

pub fn run(ctx: &Context, action: Control, target: &str) -> CommandResult {
    let op = ctx.operator()?;
    let mgr = ctx.manager()?;
    let id = resolve_instance(&mgr, op, target)?;

    let pb = (!ctx.json).then(|| spinner(&format!("{} {target}...", action.verb())));
    match action.apply(&mgr, op, &id) {
        Ok(inst) => {
            if ctx.json {
                println!("{}", json_pretty(&inst)?);
            } else if let Some(pb) = &pb {
                spin_ok(
                    pb,
                    &format!("{} is {}", inst.id, colorize_status(inst.status.as_str())),
                );
            }
            Ok(EXIT_SUCCESS)
        }
        Err(e) => {
            if let Some(pb) = &pb {
                spin_fail(pb, &format!("{} {target} failed", action.verb()));
            }
            Err(e.into())
        }
    }
}
