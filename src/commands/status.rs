//! Tenant status listing.

use anyhow::Result;
use colored::*;

use crate::config::Config;
use crate::tenant::{MigrationStatus, Tenant, TenantDirectory, TenantFilter};

/// Show every tenant with its migration status and schema.
pub async fn tenant_status(url: &str, config: &Config) -> Result<()> {
    println!("{}", "📋 Tenant Status".cyan().bold());
    println!();

    let settings = config.settings()?;
    println!("  Tenant table: {}", settings.tenants.table.to_string().yellow());
    println!();

    let mut db = super::connect(url, &settings).await?;
    let tenants = db.list_tenants(&TenantFilter::All).await?;
    print_status(&tenants);
    Ok(())
}

pub fn print_status(tenants: &[Tenant]) {
    if tenants.is_empty() {
        println!("  {} No tenants found", "○".dimmed());
        return;
    }

    for tenant in tenants {
        let status = match tenant.status {
            MigrationStatus::Migrated => tenant.status.as_str().green(),
            MigrationStatus::Unmigrated => tenant.status.as_str().dimmed(),
            MigrationStatus::Migrating | MigrationStatus::RollbackInProgress => {
                tenant.status.as_str().red()
            }
        };
        println!(
            "  {:>8}  {:<24} {:<22} {}",
            tenant.id,
            tenant.slug.as_deref().unwrap_or("-"),
            status,
            tenant.namespace.as_deref().unwrap_or("")
        );
    }

    let migrated = tenants
        .iter()
        .filter(|t| t.status == MigrationStatus::Migrated)
        .count();
    println!();
    println!(
        "  {} of {} tenant(s) migrated",
        migrated.to_string().green(),
        tenants.len()
    );
    if migrated < tenants.len() {
        println!("  Run {} to migrate the rest", "qail-tenant migrate".cyan());
    }
}
