use super::{colorize_status, json_pretty, resolve_instance, CommandResult, Context, EXIT_SUCCESS};

pub fn run(ctx: &Context, target: &str) -> CommandResult {
    let op = ctx.operator()?;
    let mgr = ctx.manager()?;
    let id = resolve_instance(&mgr, op, target)?;
    let inst = mgr.get(op, &id)?;

    if ctx.json {
        println!("{}", json_pretty(&inst)?);
        return Ok(EXIT_SUCCESS);
    }

    let spec = &inst.resource_spec;
    println!("id:          {}", inst.id);
    println!("name:        {}", inst.name);
    println!("owner:       {}", inst.owner);
    println!("status:      {}", colorize_status(inst.status.as_str()));
    println!(
        "engine_ref:  {}",
        inst.engine_ref.as_deref().unwrap_or("(none)")
    );
    println!("image:       {}", spec.image);
    if let Some(cpus) = spec.cpus_arg() {
        println!("cpus:        {cpus}");
    }
    if let Some(mem) = spec.memory_mb {
        println!("memory:      {mem}MB");
    }
    for port in &spec.ports {
        println!("port:        {port}");
    }
    println!("created_at:  {}", inst.created_at);
    println!("updated_at:  {}", inst.updated_at);
    match inst.expires_at {
        Some(at) => println!("expires_at:  {at}"),
        None => println!("expires_at:  never"),
    }
    if let Some(err) = &inst.last_error {
        let action = inst.last_action.map_or("-", |a| a.as_str());
        println!("last_error:  {err} (during {action})");
    }
    println!("history:");
    for t in &inst.transitions {
        let from = t.from.map_or("-", |s| s.as_str());
        println!("  {}  {from} -> {}  {}", t.at, t.to, t.reason);
    }
    Ok(EXIT_SUCCESS)
}
