use super::{
    json_pretty, spin_fail, spin_ok, spinner, CommandError, CommandResult, Context,
    EXIT_POLICY_REJECTED, EXIT_SUCCESS,
};
use roost_core::CreateRequest;
use roost_schema::{parse_cpus, parse_memory, PortMapping, RecordError, ResourceSpec};
use std::collections::BTreeMap;

pub struct CreateArgs {
    pub name: String,
    pub image: Option<String>,
    pub memory: Option<String>,
    pub cpus: Option<String>,
    pub ports: Vec<PortMapping>,
    pub env: Vec<(String, String)>,
    pub ttl_hours: Option<u64>,
}

pub fn run(ctx: &Context, args: CreateArgs) -> CommandResult {
    let op = ctx.operator()?;
    let mgr = ctx.manager()?;

    let image = args
        .image
        .unwrap_or_else(|| ctx.config.engine.default_image.clone());
    let mut spec = ResourceSpec::new(image);
    spec.memory_mb = args
        .memory
        .as_deref()
        .map(parse_memory)
        .transpose()
        .map_err(rejected)?;
    spec.cpu_millis = args
        .cpus
        .as_deref()
        .map(parse_cpus)
        .transpose()
        .map_err(rejected)?;
    spec.ports = args.ports;
    spec.env = args.env.into_iter().collect::<BTreeMap<_, _>>();

    let request = CreateRequest {
        name: args.name.clone(),
        spec,
        ttl_hours: args.ttl_hours,
    };

    let pb = (!ctx.json).then(|| spinner(&format!("creating '{}'...", args.name)));
    match mgr.create(op, request) {
        Ok(inst) => {
            if ctx.json {
                println!("{}", json_pretty(&inst)?);
            } else if let Some(pb) = &pb {
                spin_ok(pb, &format!("created '{}' ({})", inst.name, inst.id));
            }
            Ok(EXIT_SUCCESS)
        }
        Err(e) => {
            if let Some(pb) = &pb {
                spin_fail(pb, &format!("create '{}' failed", args.name));
            }
            Err(e.into())
        }
    }
}

fn rejected(e: RecordError) -> CommandError {
    CommandError {
        code: EXIT_POLICY_REJECTED,
        message: format!("invalid resource spec: {e}"),
    }
}

/// Parse a `KEY=VALUE` pair from the command line.
pub fn parse_env_pair(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((k, v)) if !k.is_empty() => Ok((k.to_owned(), v.to_owned())),
        _ => Err(format!("expected KEY=VALUE, got '{s}'")),
    }
}
