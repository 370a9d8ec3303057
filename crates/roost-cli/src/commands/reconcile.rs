use super::{json_pretty, CommandError, CommandResult, Context, EXIT_SUCCESS};
use roost_core::{install_signal_handler, shutdown_requested, DaemonLock, Reconciler, SweepReport};
use roost_engine::select_engine;
use roost_store::open_store;
use std::time::Duration;
use tracing::info;

const DAEMON_LOCK: &str = "daemon.lock";

fn reconciler(ctx: &Context) -> Result<Reconciler, CommandError> {
    let store = open_store(&ctx.config.store)?;
    let engine = select_engine(&ctx.config.engine, &ctx.config.engine_state_dir())?;
    Ok(Reconciler::new(store, engine, ctx.config.reconciler.clone()))
}

fn print_report(report: &SweepReport) {
    println!(
        "checked {}, repaired {}, adopted {}, interrupted {}, expired {}, busy {}",
        report.checked,
        report.repaired,
        report.adopted,
        report.interrupted,
        report.expired,
        report.skipped_busy
    );
    for failure in &report.errors {
        println!("  failed {}: {}", failure.id, failure.error);
    }
}

/// Run a single sweep and report what changed.
pub fn run_once(ctx: &Context) -> CommandResult {
    let report = reconciler(ctx)?.sweep()?;
    if ctx.json {
        println!("{}", json_pretty(&report)?);
    } else {
        print_report(&report);
    }
    Ok(EXIT_SUCCESS)
}

/// Sweep on an interval until interrupted. Only one daemon may run per store.
pub fn run_daemon(ctx: &Context, interval_secs: Option<u64>) -> CommandResult {
    let lock = DaemonLock::acquire(&ctx.config.store.path.join(DAEMON_LOCK))?;
    let rec = reconciler(ctx)?;
    let interval =
        Duration::from_secs(interval_secs.unwrap_or(ctx.config.reconciler.interval_secs));

    install_signal_handler();
    info!(
        "reconciler daemon started (interval {}s, lock {})",
        interval.as_secs(),
        lock.path().display()
    );
    let sweeps = rec.run(interval, shutdown_requested);
    info!("reconciler daemon stopped after {sweeps} sweep(s)");
    if !ctx.json {
        println!("stopped after {sweeps} sweep(s)");
    }
    Ok(EXIT_SUCCESS)
}
