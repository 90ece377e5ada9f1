//! Forward migration command.

use anyhow::Result;
use colored::*;

use crate::backup::PgDumpBackup;
use crate::config::Config;
use crate::confirm::{AutoConfirm, Confirm, Prompt};
use crate::engine::{Orchestrator, RunOptions, RunSummary, TenantPhase};

/// Migrate the selected tenants into their own schemas.
pub async fn migrate_tenants(url: &str, config: &Config, options: &RunOptions) -> Result<RunSummary> {
    let title = if options.dry_run {
        "🏢 Tenant Migration (dry run)"
    } else {
        "🏢 Tenant Migration"
    };
    println!("{}", title.cyan().bold());
    println!();

    let settings = config.settings()?;
    let tables: Vec<&str> = settings.tables.iter().map(|t| t.table.as_str()).collect();
    println!("  Tables: {}", tables.join(", ").yellow());
    println!("  Batch size: {}", options.batch_size.to_string().yellow());
    if !options.tenants.is_empty() {
        let ids: Vec<String> = options.tenants.iter().map(|t| t.to_string()).collect();
        println!("  Tenants: {}", ids.join(", ").yellow());
    }
    println!();

    let mut db = super::connect(url, &settings).await?;
    let backup = PgDumpBackup::new(url, &config.backup_dir);
    // Under --force an existing schema fails the tenant without asking.
    let confirm: Box<dyn Confirm> = if options.force {
        Box::new(AutoConfirm(false))
    } else {
        Box::new(Prompt)
    };

    let mut orchestrator = Orchestrator::new(settings, Box::new(backup), confirm).echo(true);
    let summary = orchestrator.run(&mut db, options).await?;
    print_summary(&summary);
    Ok(summary)
}

/// Per-tenant lines plus totals.
pub fn print_summary(summary: &RunSummary) {
    println!();
    println!("{}", "Summary".cyan().bold());
    for outcome in &summary.tenants {
        let (marker, label) = match outcome.phase {
            TenantPhase::Completed => ("✓".green(), "completed".green()),
            TenantPhase::Failed => ("✗".red(), "failed".red()),
            _ => ("○".dimmed(), "skipped".dimmed()),
        };
        println!(
            "  {} tenant {} → {} {} ({} rows)",
            marker,
            outcome.tenant_id,
            outcome.namespace.as_deref().unwrap_or("-").yellow(),
            label,
            outcome.rows
        );
        if let Some(error) = &outcome.error {
            println!("      {}", error.dimmed());
        }
    }

    println!();
    println!("  Succeeded: {}", summary.succeeded.to_string().green());
    println!("  Failed:    {}", summary.failed.to_string().red());
    println!("  Skipped:   {}", summary.skipped);
    println!("  Rows:      {}", summary.rows_migrated);
    println!("  Elapsed:   {:.2?}", summary.elapsed);
    if let Some(path) = &summary.backup_path {
        println!("  Backup:    {}", path.display());
    }
    if let Some(path) = &summary.report_path {
        println!("  Report:    {}", path.display());
    }
    if summary.stopped_early {
        println!("  {} Stopped after the first failure", "!".yellow());
    }
    if summary.dry_run {
        println!();
        println!(
            "  Nothing was changed. Run without {} to apply.",
            "--dry-run".cyan()
        );
    }
}
