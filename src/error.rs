//! Error taxonomy for the migration engine.
//!
//! Every [`MigrationError`] carries an [`ErrorKind`] so the orchestrator can
//! decide between aborting the run and moving on to the next tenant without
//! inspecting messages.

use std::path::PathBuf;

use thiserror::Error;

use crate::tenant::{MigrationStatus, TenantId};

/// Errors raised by a database executor.
#[derive(Debug, Error)]
pub enum DbError {
    /// Driver-level failure (connection, SQL, constraint).
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
    /// Referenced table does not exist.
    #[error("table {0} does not exist")]
    MissingTable(String),
    /// Referenced schema does not exist.
    #[error("schema {0} does not exist")]
    MissingNamespace(String),
    /// The database returned an identifier the engine refuses to quote.
    #[error("unsupported identifier returned by database: {0:?}")]
    Identifier(String),
    /// A statement was rejected (constraint violation, permission, ...).
    #[error("{0}")]
    Rejected(String),
}

/// Result type for executor operations.
pub type DbResult<T> = Result<T, DbError>;

/// Whether an error ends the whole run or only the current tenant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Abort the run before (or instead of) touching further tenants.
    Fatal,
    /// Roll back the current tenant and continue with the next one.
    PerTenant,
}

/// Errors raised by the migration and rollback engines.
#[derive(Debug, Error)]
pub enum MigrationError {
    /// Missing metadata table, no DDL privilege, unsupported engine, ...
    #[error("prerequisite check failed: {0}")]
    Prerequisite(String),

    /// Two tenants derive the same schema name.
    #[error("schema name {namespace} is derived by more than one tenant ({tenants:?})")]
    NamespaceCollision {
        namespace: String,
        tenants: Vec<TenantId>,
    },

    /// Target schema already exists for a tenant that is not migrated.
    #[error("schema {namespace} already exists for unmigrated tenant {tenant}")]
    SchemaConflict { tenant: TenantId, namespace: String },

    /// A value failed the identifier allow-list.
    #[error("invalid identifier {value:?}: {reason}")]
    InvalidIdentifier { value: String, reason: &'static str },

    /// Schema-level DDL failed.
    #[error("schema operation on {namespace} failed: {source}")]
    Provision {
        namespace: String,
        #[source]
        source: DbError,
    },

    /// Reading or inserting rows failed mid-copy.
    #[error("copy of {table} failed after {rows} row(s): {source}")]
    Copy {
        table: String,
        rows: u64,
        #[source]
        source: DbError,
    },

    /// Destination row count differs from the source after the copy.
    #[error(
        "row count mismatch for {table}: source has {source_count}, destination has {dest_count}"
    )]
    VerificationMismatch {
        table: String,
        source_count: i64,
        dest_count: i64,
    },

    /// Destination content digest differs from the source.
    #[error("checksum mismatch for {table}: source {source_digest}, destination {dest_digest}")]
    ChecksumMismatch {
        table: String,
        source_digest: String,
        dest_digest: String,
    },

    /// Reverse verification failed during rollback.
    #[error(
        "rollback verification failed for {table}: schema has {namespace_count}, shared table has {shared_count}"
    )]
    RollbackIntegrity {
        table: String,
        namespace_count: i64,
        shared_count: i64,
    },

    /// Tenant id unknown to the tenant directory.
    #[error("tenant {0} not found")]
    TenantNotFound(TenantId),

    /// Rollback of a tenant whose status says its data is not in its schema.
    #[error("tenant {tenant} is {status}, not migrated; its shared rows were left untouched")]
    TenantNotMigrated {
        tenant: TenantId,
        status: MigrationStatus,
    },

    /// Tenant has no schema to roll back from.
    #[error("schema {namespace} for tenant {tenant} does not exist")]
    NamespaceMissing { tenant: TenantId, namespace: String },

    /// Pre-migration backup failed and the policy requires one.
    #[error("backup failed: {0}")]
    Backup(String),

    /// Configuration could not be loaded or is invalid.
    #[error("configuration error: {0}")]
    Config(String),

    /// Writing the run report failed.
    #[error("failed to write report {path}: {source}")]
    Report {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Any other executor failure inside a tenant boundary.
    #[error(transparent)]
    Database(#[from] DbError),
}

impl MigrationError {
    /// Classify the error for the continue-vs-abort decision.
    pub fn kind(&self) -> ErrorKind {
        match self {
            MigrationError::Prerequisite(_)
            | MigrationError::NamespaceCollision { .. }
            | MigrationError::InvalidIdentifier { .. }
            | MigrationError::Backup(_)
            | MigrationError::Config(_)
            | MigrationError::Report { .. } => ErrorKind::Fatal,
            MigrationError::SchemaConflict { .. }
            | MigrationError::Provision { .. }
            | MigrationError::Copy { .. }
            | MigrationError::VerificationMismatch { .. }
            | MigrationError::ChecksumMismatch { .. }
            | MigrationError::RollbackIntegrity { .. }
            | MigrationError::TenantNotFound(_)
            | MigrationError::TenantNotMigrated { .. }
            | MigrationError::NamespaceMissing { .. }
            | MigrationError::Database(_) => ErrorKind::PerTenant,
        }
    }

    /// Short stable name used in reports.
    pub fn name(&self) -> &'static str {
        match self {
            MigrationError::Prerequisite(_) => "prerequisite_error",
            MigrationError::NamespaceCollision { .. } | MigrationError::SchemaConflict { .. } => {
                "schema_conflict_error"
            }
            MigrationError::InvalidIdentifier { .. } => "invalid_identifier",
            MigrationError::Provision { .. } => "provision_error",
            MigrationError::Copy { .. } => "copy_error",
            MigrationError::VerificationMismatch { .. } | MigrationError::ChecksumMismatch { .. } => {
                "verification_mismatch_error"
            }
            MigrationError::RollbackIntegrity { .. } => "rollback_integrity_error",
            MigrationError::TenantNotFound(_) => "tenant_not_found",
            MigrationError::TenantNotMigrated { .. } => "tenant_not_migrated",
            MigrationError::NamespaceMissing { .. } => "namespace_missing",
            MigrationError::Backup(_) => "backup_error",
            MigrationError::Config(_) => "config_error",
            MigrationError::Report { .. } => "report_error",
            MigrationError::Database(_) => "database_error",
        }
    }
}
