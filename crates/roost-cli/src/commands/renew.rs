use super::{json_pretty, resolve_instance, CommandResult, Context, EXIT_SUCCESS};

pub fn run(ctx: &Context, target: &str, hours: u64) -> CommandResult {
    let op = ctx.operator()?;
    let mgr = ctx.manager()?;
    let id = resolve_instance(&mgr, op, target)?;
    let inst = mgr.renew(op, &id, hours)?;

    if ctx.json {
        println!("{}", json_pretty(&inst)?);
    } else if let Some(at) = inst.expires_at {
        println!("renewed {} until {at}", inst.id);
    }
    Ok(EXIT_SUCCESS)
}
