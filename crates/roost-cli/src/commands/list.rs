use super::{colorize_status, json_pretty, CommandResult, Context, EXIT_SUCCESS};
use roost_schema::OperatorId;
use roost_store::InstanceFilter;

pub fn run(ctx: &Context, all: bool, owner: Option<&str>) -> CommandResult {
    let op = ctx.operator()?;
    let mgr = ctx.manager()?;

    let mut filter = if all {
        InstanceFilter::all()
    } else {
        InstanceFilter::active()
    };
    filter.owner = owner.map(OperatorId::new);
    let instances = mgr.list(op, &filter)?;

    if ctx.json {
        println!("{}", json_pretty(&instances)?);
    } else if instances.is_empty() {
        println!("no instances found");
    } else {
        println!(
            "{:<18} {:<20} {:<12} {:<10} EXPIRES",
            "ID", "NAME", "OWNER", "STATUS"
        );
        for inst in &instances {
            let expires = inst.expires_at.map_or_else(
                || "never".to_owned(),
                |at| at.format("%Y-%m-%d %H:%M").to_string(),
            );
            // pad outside the colour codes so columns stay aligned
            let status = inst.status.as_str();
            let pad = " ".repeat(10usize.saturating_sub(status.len()));
            println!(
                "{:<18} {:<20} {:<12} {}{pad} {expires}",
                inst.id,
                inst.name,
                inst.owner,
                colorize_status(status),
            );
        }
    }
    Ok(EXIT_SUCCESS)
}
