//! Single-tenant rollback command.

use anyhow::Result;
use colored::*;

use crate::config::Config;
use crate::confirm::{AutoConfirm, Confirm, Prompt};
use crate::engine::{RollbackEngine, RollbackOptions, RollbackReport};
use crate::report::LogStatus;
use crate::tenant::TenantId;

/// Move one tenant back into the shared tables.
pub async fn rollback_tenant(
    url: &str,
    config: &Config,
    tenant: TenantId,
    options: &RollbackOptions,
) -> Result<RollbackReport> {
    let title = if options.dry_run {
        "↩ Tenant Rollback (dry run)"
    } else {
        "↩ Tenant Rollback"
    };
    println!("{}", title.cyan().bold());
    println!();
    println!("  Tenant: {}", tenant.to_string().yellow());
    println!();

    let settings = config.settings()?;
    let mut db = super::connect(url, &settings).await?;
    let confirm: Box<dyn Confirm> = if options.force {
        Box::new(AutoConfirm(true))
    } else {
        Box::new(Prompt)
    };

    let mut engine = RollbackEngine::new(settings, confirm).echo(true);
    let report = engine.rollback(&mut db, tenant, options).await?;
    print_rollback(&report);
    Ok(report)
}

pub fn print_rollback(report: &RollbackReport) {
    println!();
    println!("{}", "Summary".cyan().bold());
    for table in &report.tables {
        let marker = match table.status {
            LogStatus::Success => "✓".green(),
            LogStatus::Failed => "✗".red(),
            LogStatus::Skipped => "○".dimmed(),
        };
        println!("  {} {}", marker, table.message);
    }
    println!();
    println!("  Rows restored: {}", report.rows_restored.to_string().green());
    println!("  Shared rows replaced: {}", report.rows_replaced);
    let schema = if report.namespace_dropped {
        "dropped".red()
    } else {
        "kept".green()
    };
    println!("  Schema {}: {}", report.namespace.yellow(), schema);
    println!("  Elapsed: {:.2?}", report.elapsed);
    if let Some(path) = &report.report_path {
        println!("  Report: {}", path.display());
    }
}
