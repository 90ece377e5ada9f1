//! Batched table copy between the shared schema and a tenant schema.
//!
//! Rows are moved in pages of `batch_size`, ordered by the table's primary
//! key (minus the discriminator), so memory stays bounded and repeated
//! pages never overlap. Copying stops at the first short page.

use tracing::debug;

use crate::error::{DbError, MigrationError};
use crate::ident::{Ident, NamespaceName, QualifiedTable, TableSpec};
use crate::store::{CopyBatch, Database, TenantColumn};
use crate::tenant::TenantId;

/// Offset pagination state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchCursor {
    offset: u64,
    batch_size: u64,
}

impl BatchCursor {
    /// A batch size of zero is treated as one.
    pub fn new(batch_size: u64) -> Self {
        Self {
            offset: 0,
            batch_size: batch_size.max(1),
        }
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn batch_size(&self) -> u64 {
        self.batch_size
    }

    /// Whether a page of `fetched` rows was the final one.
    pub fn is_last(&self, fetched: u64) -> bool {
        fetched < self.batch_size
    }

    pub fn advance(&mut self) {
        self.offset += self.batch_size;
    }
}

/// What happened to one table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableCopy {
    Copied(u64),
    /// Dry run: rows that would be copied.
    WouldCopy(u64),
    NoRows,
    MissingSource,
    MissingDestination,
}

impl TableCopy {
    pub fn rows(&self) -> u64 {
        match self {
            TableCopy::Copied(n) | TableCopy::WouldCopy(n) => *n,
            _ => 0,
        }
    }
}

/// Moves one table's rows for one tenant.
#[derive(Debug, Clone, Copy)]
pub struct TableMigrator {
    batch_size: u64,
}

impl TableMigrator {
    pub fn new(batch_size: u64) -> Self {
        Self {
            batch_size: batch_size.max(1),
        }
    }

    /// Copy the tenant's rows of `spec` from the shared schema into its own
    /// schema, leaving the discriminator behind.
    ///
    /// The destination must exist and be empty whenever the tenant has
    /// rows to copy. With `dry_run` nothing is written and the would-be row
    /// count is returned instead.
    pub async fn migrate_table<D: Database>(
        &self,
        db: &mut D,
        tenant: TenantId,
        spec: &TableSpec,
        shared: &Ident,
        namespace: &NamespaceName,
        dry_run: bool,
    ) -> Result<TableCopy, MigrationError> {
        let source = QualifiedTable::new(shared, &spec.table);
        let dest = QualifiedTable::new(namespace.ident(), &spec.table);
        let filter = TenantColumn::new(&spec.discriminator, tenant);

        if !db.table_exists(&source).await? {
            return Ok(TableCopy::MissingSource);
        }
        let count = db.count_rows(&source, Some(&filter)).await?;
        if count == 0 {
            return Ok(TableCopy::NoRows);
        }
        if dry_run {
            return Ok(TableCopy::WouldCopy(count as u64));
        }
        if !db.table_exists(&dest).await? {
            return Err(MigrationError::Copy {
                table: dest.to_string(),
                rows: 0,
                source: DbError::MissingTable(dest.to_string()),
            });
        }

        let existing = db.count_rows(&dest, None).await?;
        if existing > 0 {
            return Err(MigrationError::Copy {
                table: dest.to_string(),
                rows: 0,
                source: DbError::Rejected(format!(
                    "destination already holds {existing} row(s)"
                )),
            });
        }

        let columns = without(db.columns(&source).await?, &spec.discriminator);
        if columns.is_empty() {
            return Err(MigrationError::Copy {
                table: dest.to_string(),
                rows: 0,
                source: DbError::Rejected(format!("{source} has no columns to copy")),
            });
        }
        let order_by = self
            .ordering(db, &source, &spec.discriminator, &columns)
            .await?;

        let rows = self
            .copy_all(
                db,
                CopyBatch {
                    source: &source,
                    dest: &dest,
                    columns: &columns,
                    order_by: &order_by,
                    filter: Some(&filter),
                    attach: None,
                    offset: 0,
                    limit: self.batch_size,
                },
            )
            .await?;
        Ok(TableCopy::Copied(rows))
    }

    /// Copy every row of the tenant schema's table back into the shared
    /// table, writing `tenant` into the discriminator column.
    pub async fn restore_table<D: Database>(
        &self,
        db: &mut D,
        tenant: TenantId,
        spec: &TableSpec,
        shared: &Ident,
        namespace: &NamespaceName,
    ) -> Result<TableCopy, MigrationError> {
        let source = QualifiedTable::new(namespace.ident(), &spec.table);
        let dest = QualifiedTable::new(shared, &spec.table);

        if !db.table_exists(&source).await? {
            return Ok(TableCopy::MissingSource);
        }
        if !db.table_exists(&dest).await? {
            return Ok(TableCopy::MissingDestination);
        }
        if db.count_rows(&source, None).await? == 0 {
            return Ok(TableCopy::NoRows);
        }

        let columns = without(db.columns(&source).await?, &spec.discriminator);
        let order_by = self
            .ordering(db, &source, &spec.discriminator, &columns)
            .await?;
        let attach = TenantColumn::new(&spec.discriminator, tenant);

        let rows = self
            .copy_all(
                db,
                CopyBatch {
                    source: &source,
                    dest: &dest,
                    columns: &columns,
                    order_by: &order_by,
                    filter: None,
                    attach: Some(&attach),
                    offset: 0,
                    limit: self.batch_size,
                },
            )
            .await?;
        Ok(TableCopy::Copied(rows))
    }

    /// Primary key minus the discriminator, else every copied column.
    async fn ordering<D: Database>(
        &self,
        db: &mut D,
        source: &QualifiedTable,
        discriminator: &Ident,
        columns: &[Ident],
    ) -> Result<Vec<Ident>, MigrationError> {
        let key = without(db.primary_key(source).await?, discriminator);
        Ok(if key.is_empty() { columns.to_vec() } else { key })
    }

    async fn copy_all<D: Database>(
        &self,
        db: &mut D,
        mut batch: CopyBatch<'_>,
    ) -> Result<u64, MigrationError> {
        let mut cursor = BatchCursor::new(self.batch_size);
        let mut total = 0u64;
        loop {
            batch.offset = cursor.offset();
            batch.limit = cursor.batch_size();
            let copied = db
                .copy_batch(&batch)
                .await
                .map_err(|source| MigrationError::Copy {
                    table: batch.dest.to_string(),
                    rows: total,
                    source,
                })?;
            total += copied;
            debug!(table = %batch.dest, offset = cursor.offset(), copied, "batch copied");
            if cursor.is_last(copied) {
                break;
            }
            cursor.advance();
        }
        Ok(total)
    }
}

fn without(columns: Vec<Ident>, discriminator: &Ident) -> Vec<Ident> {
    columns.into_iter().filter(|c| c != discriminator).collect()
}
