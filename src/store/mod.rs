//! Database executor seam.
//!
//! The engine never builds SQL itself; it asks a [`Database`] for schema
//! DDL, counts and batched copies. Two executors exist:
//! - [`PgStore`]: PostgreSQL over a dedicated `sqlx` connection
//! - [`MemoryStore`]: in-process tables with snapshot transactions

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::{PgStore, TenantTable};

use async_trait::async_trait;

use crate::error::DbResult;
use crate::ident::{Ident, QualifiedTable};
use crate::tenant::TenantId;

/// `column = tenant` predicate (or assignment, when attaching).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TenantColumn {
    pub column: Ident,
    pub tenant: TenantId,
}

impl TenantColumn {
    pub fn new(column: &Ident, tenant: TenantId) -> Self {
        Self {
            column: column.clone(),
            tenant,
        }
    }
}

/// One page of an `INSERT INTO dest SELECT ... FROM source` copy.
#[derive(Debug, Clone)]
pub struct CopyBatch<'a> {
    pub source: &'a QualifiedTable,
    pub dest: &'a QualifiedTable,
    /// Columns read from `source` and written to `dest`, in this order.
    pub columns: &'a [Ident],
    /// Stable ordering key for offset pagination.
    pub order_by: &'a [Ident],
    /// Restrict source rows to one tenant.
    pub filter: Option<&'a TenantColumn>,
    /// Write this tenant into an extra destination column.
    pub attach: Option<&'a TenantColumn>,
    pub offset: u64,
    pub limit: u64,
}

/// Raw executor used by the provisioner, migrator, verifier and rollback.
#[async_trait]
pub trait Database: Send {
    /// Start a transaction scoping every following call.
    async fn begin(&mut self) -> DbResult<()>;
    async fn commit(&mut self) -> DbResult<()>;
    async fn rollback(&mut self) -> DbResult<()>;

    /// Server identification string, for logs.
    async fn server_version(&mut self) -> DbResult<String>;
    /// Whether the engine supports named schemas.
    async fn supports_namespaces(&mut self) -> DbResult<bool>;

    async fn namespace_exists(&mut self, namespace: &Ident) -> DbResult<bool>;
    /// `CREATE SCHEMA IF NOT EXISTS`.
    async fn create_namespace(&mut self, namespace: &Ident) -> DbResult<()>;
    /// Grant usage, create and row privileges on a schema to `role`.
    async fn grant_namespace(&mut self, namespace: &Ident, role: &Ident) -> DbResult<()>;
    /// `DROP SCHEMA IF EXISTS ... [CASCADE]`.
    async fn drop_namespace(&mut self, namespace: &Ident, cascade: bool) -> DbResult<()>;

    async fn table_exists(&mut self, table: &QualifiedTable) -> DbResult<bool>;
    /// Writable (non-generated) columns in ordinal order.
    async fn columns(&mut self, table: &QualifiedTable) -> DbResult<Vec<Ident>>;
    /// Primary key columns in key order; empty when there is none.
    async fn primary_key(&mut self, table: &QualifiedTable) -> DbResult<Vec<Ident>>;
    /// Create `dest` with the structure of `source` unless it exists,
    /// optionally dropping one column.
    async fn clone_structure(
        &mut self,
        source: &QualifiedTable,
        dest: &QualifiedTable,
        without: Option<&Ident>,
    ) -> DbResult<()>;
    /// Add a nullable discriminator column plus an index on it.
    async fn add_discriminator(&mut self, table: &QualifiedTable, column: &Ident) -> DbResult<()>;

    async fn count_rows(
        &mut self,
        table: &QualifiedTable,
        filter: Option<&TenantColumn>,
    ) -> DbResult<i64>;
    /// Copy one page; returns the number of rows inserted.
    async fn copy_batch(&mut self, batch: &CopyBatch<'_>) -> DbResult<u64>;
    async fn delete_rows(&mut self, table: &QualifiedTable, filter: &TenantColumn)
    -> DbResult<u64>;
    /// Order-independent digest over `columns` of the selected rows.
    async fn checksum(
        &mut self,
        table: &QualifiedTable,
        columns: &[Ident],
        filter: Option<&TenantColumn>,
    ) -> DbResult<String>;
}
