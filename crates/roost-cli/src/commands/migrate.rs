use super::{json_pretty, CommandError, CommandResult, Context, EXIT_SUCCESS};
use roost_store::{
    import_bot_state, migrate_legacy, open_store, BotDumpFormat, LegacyStore, MigrationReport,
    SqliteStore,
};
use std::path::Path;
use std::time::Duration;

fn report_json(report: &MigrationReport) -> serde_json::Value {
    serde_json::json!({
        "total": report.total,
        "migrated": report.migrated,
        "unchanged": report.unchanged,
        "invalid": report
            .invalid
            .iter()
            .map(|i| serde_json::json!({ "key": i.key, "error": i.error.to_string() }))
            .collect::<Vec<_>>(),
        "mismatched": report.mismatched,
        "backup": report.backup_path.as_ref().map(|p| p.display().to_string()),
        "clean": report.is_clean(),
    })
}

/// Copy the legacy JSON collection into the SQLite store. A report with
/// invalid or mismatched records exits with the store error code.
pub fn run(ctx: &Context, legacy: &Path, sqlite: Option<&Path>) -> CommandResult {
    if !legacy.is_file() {
        return Err(CommandError::failure(format!(
            "legacy collection {} not found",
            legacy.display()
        )));
    }
    let timeout = Duration::from_secs(ctx.config.store.lock_timeout_secs);
    let target_path = sqlite.map_or_else(|| ctx.config.store.sqlite_file(), Path::to_path_buf);

    let source = LegacyStore::open(legacy, timeout)?;
    let target = SqliteStore::open(&target_path, timeout)?;
    let report = migrate_legacy(&source, &target)?;
    finish(ctx, report, &target_path)
}

/// Import the bot's records from exactly one of a JSON dump or its SQLite
/// `vps` table into the configured store.
pub fn run_bot_import(ctx: &Context, json: Option<&Path>, db: Option<&Path>) -> CommandResult {
    let (dump, format) = match (json, db) {
        (Some(path), None) => (path, BotDumpFormat::Json),
        (None, Some(path)) => (path, BotDumpFormat::Sqlite),
        _ => return Err(CommandError::failure("pass exactly one of --from-json or --from-db")),
    };
    if !dump.is_file() {
        return Err(CommandError::failure(format!(
            "bot dump {} not found",
            dump.display()
        )));
    }

    let target = open_store(&ctx.config.store)?;
    let report = import_bot_state(dump, format, target.as_ref())?;
    finish(ctx, report, &ctx.config.store.path)
}

/// Print `report`, then fail with the store error code unless it is clean.
fn finish(ctx: &Context, report: MigrationReport, target: &Path) -> CommandResult {
    if ctx.json {
        println!("{}", json_pretty(&report_json(&report))?);
    } else {
        println!(
            "{} record(s): {} migrated, {} unchanged, {} invalid, {} mismatched",
            report.total,
            report.migrated,
            report.unchanged,
            report.invalid.len(),
            report.mismatched.len()
        );
        if let Some(backup) = &report.backup_path {
            println!("backup: {}", backup.display());
        }
        for issue in &report.invalid {
            println!("  invalid {}: {}", issue.key, issue.error);
        }
        for id in &report.mismatched {
            println!("  mismatch {id}");
        }
        println!("target: {}", target.display());
    }

    report.into_result()?;
    Ok(EXIT_SUCCESS)
}
