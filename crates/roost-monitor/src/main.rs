use clap::Parser;
use roost_monitor::Monitor;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info};

#[derive(Parser)]
#[command(
    name = "roost-monitor",
    version,
    about = "Read-only web view of Roost instances"
)]
struct Cli {
    /// Port to listen on.
    #[arg(long, default_value_t = 8322)]
    port: u16,

    /// Address to bind.
    #[arg(long, default_value = "0.0.0.0")]
    bind: String,

    /// SQLite instance database to serve.
    #[arg(long, default_value = "./roost-data/roost.db")]
    db: PathBuf,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let monitor = match Monitor::open(&cli.db) {
        Ok(m) => m,
        Err(e) => {
            error!("cannot open {}: {e}", cli.db.display());
            return ExitCode::FAILURE;
        }
    };

    let addr = format!("{}:{}", cli.bind, cli.port);
    info!("starting roost-monitor on {addr}");
    info!("database: {}", monitor.db_path().display());

    match roost_monitor::run_server(&monitor, &addr) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("server failed: {e}");
            ExitCode::FAILURE
        }
    }
}
