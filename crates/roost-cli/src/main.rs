mod commands;

use clap::{Parser, Subcommand};
use clap_complete::Shell;
use commands::control::Control;
use commands::create::{parse_env_pair, CreateArgs};
use commands::{CommandError, Context};
use roost_core::Operator;
use roost_schema::{load_config_or_default, PortMapping};
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Debug, Parser)]
#[command(
    name = "roost",
    version,
    about = "Per-user VPS container lifecycle manager"
)]
struct Cli {
    /// Path to the TOML configuration file. A missing file means defaults.
    #[arg(long, default_value = "roost.toml", global = true)]
    config: PathBuf,

    /// Operator the request is made for.
    #[arg(long, env = "ROOST_OPERATOR", global = true)]
    operator: Option<String>,

    /// Act with the administrative capability (honoured only if the policy allows it).
    #[arg(long, default_value_t = false, global = true)]
    admin: bool,

    /// Output results as structured JSON.
    #[arg(long, default_value_t = false, global = true)]
    json: bool,

    /// Enable verbose (debug) logging output.
    #[arg(short, long, default_value_t = false, global = true)]
    verbose: bool,

    /// Enable trace-level logging (more detailed than --verbose).
    #[arg(long, default_value_t = false, global = true)]
    trace: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Create and start a new instance.
    Create {
        /// Instance name, unique among your active instances.
        name: String,
        /// Container image (defaults to engine.default_image).
        #[arg(long)]
        image: Option<String>,
        /// Memory limit, e.g. 512m or 2g.
        #[arg(long)]
        memory: Option<String>,
        /// CPU limit, e.g. 0.5 or 2.
        #[arg(long)]
        cpus: Option<String>,
        /// Port mapping host:container[/tcp|udp]. Repeatable.
        #[arg(long = "port")]
        ports: Vec<PortMapping>,
        /// Environment variable KEY=VALUE. Repeatable.
        #[arg(long = "env", value_parser = parse_env_pair)]
        env: Vec<(String, String)>,
        /// Lifetime in hours (defaults to policy.default_ttl_hours).
        #[arg(long)]
        ttl_hours: Option<u64>,
    },
    /// Start a stopped instance.
    Start {
        /// Instance id, id prefix, or name.
        id: String,
    },
    /// Stop a running instance.
    Stop {
        /// Instance id, id prefix, or name.
        id: String,
    },
    /// Remove an instance's container and keep its record as a tombstone.
    Delete {
        /// Instance id, id prefix, or name.
        id: String,
    },
    /// Re-attempt the action that left an instance in error.
    Retry {
        /// Instance id, id prefix, or name.
        id: String,
    },
    /// Show an instance record and its transition history.
    Inspect {
        /// Instance id, id prefix, or name.
        id: String,
    },
    /// Extend an instance's expiry.
    Renew {
        /// Instance id, id prefix, or name.
        id: String,
        /// Hours to add.
        #[arg(long)]
        hours: u64,
    },
    /// List instances.
    List {
        /// Include removed tombstones.
        #[arg(long, default_value_t = false)]
        all: bool,
        /// Only instances of this owner (admins only see others').
        #[arg(long)]
        owner: Option<String>,
    },
    /// Run one reconciliation sweep against the engine.
    Reconcile,
    /// Run reconciliation sweeps until interrupted.
    Daemon {
        /// Seconds between sweeps (defaults to reconciler.interval_secs).
        #[arg(long)]
        interval: Option<u64>,
    },
    /// Migrate a legacy JSON collection into the SQLite store.
    Migrate {
        /// Legacy instances.json file.
        #[arg(long)]
        legacy: PathBuf,
        /// Target SQLite file (defaults to the configured store).
        #[arg(long)]
        sqlite: Option<PathBuf>,
    },
    /// Import the Discord bot's container records into the configured store.
    ImportBot {
        /// JSON dump of the bot state, keyed by container name.
        #[arg(long, conflicts_with = "from_db", required_unless_present = "from_db")]
        from_json: Option<PathBuf>,
        /// SQLite file holding the bot's `vps` table.
        #[arg(long)]
        from_db: Option<PathBuf>,
    },
    /// Generate shell completions for bash, zsh, fish, elvish, or powershell.
    Completions {
        /// Shell to generate completions for.
        shell: Shell,
    },
}

fn main() -> ExitCode {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        let msg = info.to_string();
        if msg.contains("Broken pipe")
            || msg.contains("broken pipe")
            || msg.contains("os error 32")
            || msg.contains("failed printing to stdout")
        {
            std::process::exit(0);
        }
        default_hook(info);
    }));

    let cli = Cli::parse();

    let default_level = if cli.trace {
        "trace"
    } else if cli.verbose {
        "debug"
    } else {
        "warn"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_env("ROOST_LOG")
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with_target(false)
        .without_time()
        .with_writer(std::io::stderr)
        .init();

    match dispatch(cli) {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::from(e.code)
        }
    }
}

fn dispatch(cli: Cli) -> Result<u8, CommandError> {
    if let Commands::Completions { shell } = cli.command {
        return commands::completions::run::<Cli>(shell);
    }

    let config = load_config_or_default(&cli.config)?;
    let operator = cli
        .operator
        .filter(|o| !o.trim().is_empty())
        .map(|id| Operator {
            id: id.into(),
            admin: cli.admin,
        });
    let ctx = Context {
        config,
        operator,
        json: cli.json,
    };

    match cli.command {
        Commands::Create {
            name,
            image,
            memory,
            cpus,
            ports,
            env,
            ttl_hours,
        } => commands::create::run(
            &ctx,
            CreateArgs {
                name,
                image,
                memory,
                cpus,
                ports,
                env,
                ttl_hours,
            },
        ),
        Commands::Start { id } => commands::control::run(&ctx, Control::Start, &id),
        Commands::Stop { id } => commands::control::run(&ctx, Control::Stop, &id),
        Commands::Delete { id } => commands::control::run(&ctx, Control::Delete, &id),
        Commands::Retry { id } => commands::control::run(&ctx, Control::Retry, &id),
        Commands::Inspect { id } => commands::inspect::run(&ctx, &id),
        Commands::Renew { id, hours } => commands::renew::run(&ctx, &id, hours),
        Commands::List { all, owner } => commands::list::run(&ctx, all, owner.as_deref()),
        Commands::Reconcile => commands::reconcile::run_once(&ctx),
        Commands::Daemon { interval } => commands::reconcile::run_daemon(&ctx, interval),
        Commands::Migrate { legacy, sqlite } => {
            commands::migrate::run(&ctx, &legacy, sqlite.as_deref())
        }
        Commands::ImportBot { from_json, from_db } => {
            commands::migrate::run_bot_import(&ctx, from_json.as_deref(), from_db.as_deref())
        }
        Commands::Completions { shell } => commands::completions::run::<Cli>(shell),
    }
}
