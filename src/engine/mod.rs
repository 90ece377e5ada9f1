//! Migration and rollback engines.
//!
//! The [`Orchestrator`] drives a forward run: prerequisites, collision
//! check, backup, then one transaction per tenant built from the
//! [`SchemaProvisioner`], [`TableMigrator`] and [`IntegrityVerifier`].
//! The [`RollbackEngine`] reverses a single tenant.

mod copy;
mod orchestrator;
mod provision;
mod rollback;
mod verify;

pub use copy::{BatchCursor, TableCopy, TableMigrator};
pub use orchestrator::{Orchestrator, RunOptions, RunSummary, TenantOutcome, TenantPhase};
pub use provision::SchemaProvisioner;
pub use rollback::{RollbackEngine, RollbackOptions, RollbackReport};
pub use verify::{IntegrityVerifier, TableCheck};

use serde::Serialize;

use crate::report::LogStatus;

/// Rows per page when none is given.
pub const DEFAULT_BATCH_SIZE: u64 = 1000;

/// Per-table line of a tenant outcome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TableOutcome {
    pub table: String,
    pub rows: u64,
    pub status: LogStatus,
    pub message: String,
}

impl TableOutcome {
    /// `verb` describes a completed copy, e.g. "migrated" or "restored".
    fn from_copy(table: &str, copy: TableCopy, verb: &str) -> Self {
        let (status, message) = match copy {
            TableCopy::Copied(n) => (LogStatus::Success, format!("{verb} {n} {table} rows")),
            TableCopy::WouldCopy(n) => (LogStatus::Skipped, format!("would migrate {n} {table} rows")),
            TableCopy::NoRows => (LogStatus::Skipped, format!("{table}: no rows for tenant")),
            TableCopy::MissingSource => {
                (LogStatus::Skipped, format!("{table}: source table does not exist"))
            }
            TableCopy::MissingDestination => {
                (LogStatus::Skipped, format!("{table}: destination table does not exist"))
            }
        };
        Self {
            table: table.to_string(),
            rows: copy.rows(),
            status,
            message,
        }
    }
}
