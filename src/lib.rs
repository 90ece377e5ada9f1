//! QAIL Tenant - shared-table to schema-per-tenant migration engine.
//!
//! Moves every row a tenant owns in the shared, `tenant_id`-discriminated
//! tables into an isolated PostgreSQL schema, verifies the copy, and can
//! reverse the move for a single tenant.
//!
//! # Layers
//! - [`store`]: the database executor seam (`PgStore`, `MemoryStore`)
//! - [`engine`]: provisioner, table migrator, verifier, orchestrator, rollback
//! - [`report`]: append-only run log flushed to a JSON artifact
//! - [`commands`]: the `qail-tenant` command implementations
//!
//! # Example
//! ```no_run
//! use qail_tenant::prelude::*;
//!
//! async fn run(url: &str) -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::load(None)?;
//!     let settings = config.settings()?;
//!     let mut db = PgStore::connect(url, settings.tenants.clone()).await?;
//!     let backup = PgDumpBackup::new(url, &config.backup_dir);
//!     let mut orchestrator = Orchestrator::new(settings, Box::new(backup), Box::new(Prompt));
//!     let summary = orchestrator.run(&mut db, &RunOptions::default()).await?;
//!     println!("{} tenant(s) migrated", summary.succeeded);
//!     Ok(())
//! }
//! ```

pub mod backup;
pub mod commands;
pub mod config;
pub mod confirm;
pub mod engine;
pub mod error;
pub mod ident;
pub mod report;
pub mod store;
pub mod tenant;

/// Prelude for convenient imports.
pub mod prelude {
    pub use crate::backup::{BackupService, PgDumpBackup};
    pub use crate::config::{Config, EngineSettings};
    pub use crate::confirm::{AutoConfirm, Confirm, Prompt};
    pub use crate::engine::{
        Orchestrator, RollbackEngine, RollbackOptions, RollbackReport, RunOptions, RunSummary,
        TenantOutcome, TenantPhase,
    };
    pub use crate::error::{DbError, ErrorKind, MigrationError};
    pub use crate::ident::{Ident, NamespaceName, QualifiedTable, TableSpec};
    pub use crate::report::{LogEntry, LogStatus, MigrationLog};
    pub use crate::store::{Database, MemoryStore, PgStore};
    pub use crate::tenant::{MigrationStatus, Tenant, TenantDirectory, TenantFilter, TenantId};
}
