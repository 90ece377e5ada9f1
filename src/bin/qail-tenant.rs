//! `qail-tenant` command-line entry point.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand};
use colored::*;
use tracing_subscriber::EnvFilter;

use qail_tenant::commands;
use qail_tenant::engine::DEFAULT_BATCH_SIZE;
use qail_tenant::prelude::*;

#[derive(Parser, Debug)]
#[command(
    name = "qail-tenant",
    version,
    about = "Move shared-table tenants into their own PostgreSQL schemas"
)]
struct Cli {
    /// Configuration file (default: ./qail-tenant.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// PostgreSQL connection URL. Overrides database_url from the config.
    #[arg(long, env = "DATABASE_URL", global = true, hide_env_values = true)]
    url: Option<String>,

    /// Increase log verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Migrate tenants into their own schemas (or roll one back)
    Migrate(MigrateArgs),
    /// Show every tenant with its migration status
    Status,
}

#[derive(Args, Debug)]
struct MigrateArgs {
    /// Report what would happen without changing anything
    #[arg(long)]
    dry_run: bool,

    /// Only migrate this tenant id (repeatable)
    #[arg(long = "tenant", value_name = "ID", action = ArgAction::Append)]
    tenants: Vec<TenantId>,

    /// Rows copied per batch
    #[arg(long, default_value_t = DEFAULT_BATCH_SIZE)]
    batch_size: u64,

    /// Compare row counts after copying each tenant
    #[arg(long)]
    verify: bool,

    /// Also compare content checksums (implies --verify)
    #[arg(long)]
    checksum: bool,

    /// Never prompt
    #[arg(long)]
    force: bool,

    /// Do not take a pre-migration backup
    #[arg(long)]
    skip_backup: bool,

    /// Continue when the pre-migration backup fails
    #[arg(long)]
    allow_backup_failure: bool,

    /// Stop after the first failed tenant
    #[arg(long)]
    stop_on_failure: bool,

    /// Reuse a schema that already exists for an unmigrated tenant
    #[arg(long)]
    allow_existing_schema: bool,

    /// Roll this tenant back into the shared tables instead of migrating
    #[arg(long, value_name = "ID", conflicts_with = "tenants")]
    rollback_tenant: Option<TenantId>,

    /// Keep the tenant schema after a rollback
    #[arg(long, requires = "rollback_tenant")]
    preserve_schema: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match run(cli).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            eprintln!("{} {:#}", "error:".red().bold(), e);
            ExitCode::FAILURE
        }
    }
}

/// `RUST_LOG` wins; otherwise the verbosity flag picks the level.
fn init_tracing(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

/// `Ok(false)` when any tenant failed.
async fn run(cli: Cli) -> Result<bool> {
    let config = Config::load(cli.config.as_deref())?;
    let url = cli
        .url
        .or_else(|| config.database_url.clone())
        .context("no database URL: pass --url, set DATABASE_URL, or set database_url in the config")?;

    match cli.command {
        Commands::Status => {
            commands::tenant_status(&url, &config).await?;
            Ok(true)
        }
        Commands::Migrate(args) => match args.rollback_tenant {
            Some(tenant) => {
                let options = RollbackOptions {
                    dry_run: args.dry_run,
                    batch_size: args.batch_size,
                    checksum: args.checksum,
                    preserve_namespace: args.preserve_schema,
                    force: args.force,
                };
                commands::rollback_tenant(&url, &config, tenant, &options).await?;
                Ok(true)
            }
            None => {
                let options = RunOptions {
                    dry_run: args.dry_run,
                    tenants: args.tenants,
                    batch_size: args.batch_size,
                    verify: args.verify,
                    checksum: args.checksum,
                    force: args.force,
                    skip_backup: args.skip_backup,
                    require_backup: !args.allow_backup_failure,
                    stop_on_failure: args.stop_on_failure,
                    allow_existing_namespace: args.allow_existing_schema,
                };
                let summary = commands::migrate_tenants(&url, &config, &options).await?;
                Ok(summary.is_success())
            }
        },
    }
}
