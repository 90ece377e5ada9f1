//! Post-copy integrity checks.

use serde::Serialize;
use tracing::debug;

use crate::error::MigrationError;
use crate::ident::{Ident, NamespaceName, QualifiedTable, TableSpec};
use crate::store::{Database, TenantColumn};
use crate::tenant::TenantId;

/// Result of one table check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TableCheck {
    pub table: String,
    pub source_count: i64,
    pub dest_count: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
}

/// Compares the tenant's shared rows with its schema's rows.
///
/// Row counts are always compared. With checksums enabled, an
/// order-independent digest of the copied columns is compared as well.
/// A table that does not exist counts as zero rows.
#[derive(Debug, Clone, Copy, Default)]
pub struct IntegrityVerifier {
    checksum: bool,
}

impl IntegrityVerifier {
    pub fn new(checksum: bool) -> Self {
        Self { checksum }
    }

    /// Forward check: `shared.table WHERE discriminator = tenant` against
    /// `namespace.table`.
    pub async fn verify<D: Database>(
        &self,
        db: &mut D,
        tenant: TenantId,
        spec: &TableSpec,
        shared: &Ident,
        namespace: &NamespaceName,
    ) -> Result<TableCheck, MigrationError> {
        let source = QualifiedTable::new(shared, &spec.table);
        let dest = QualifiedTable::new(namespace.ident(), &spec.table);
        let filter = TenantColumn::new(&spec.discriminator, tenant);

        let source_count = count_if_exists(db, &source, Some(&filter)).await?;
        let dest_count = count_if_exists(db, &dest, None).await?;
        debug!(table = %spec.table, source_count, dest_count, "row counts");
        if source_count != dest_count {
            return Err(MigrationError::VerificationMismatch {
                table: spec.table.to_string(),
                source_count,
                dest_count,
            });
        }

        let mut check = TableCheck {
            table: spec.table.to_string(),
            source_count,
            dest_count,
            checksum: None,
        };
        if self.checksum && source_count > 0 {
            let columns = copied_columns(db, &dest, &spec.discriminator).await?;
            let source_digest = db.checksum(&source, &columns, Some(&filter)).await?;
            let dest_digest = db.checksum(&dest, &columns, None).await?;
            if source_digest != dest_digest {
                return Err(MigrationError::ChecksumMismatch {
                    table: spec.table.to_string(),
                    source_digest,
                    dest_digest,
                });
            }
            check.checksum = Some(dest_digest);
        }
        Ok(check)
    }

    /// Reverse check after a rollback: every row of `namespace.table` must
    /// be back in the shared table under the tenant's discriminator.
    pub async fn verify_restored<D: Database>(
        &self,
        db: &mut D,
        tenant: TenantId,
        spec: &TableSpec,
        shared: &Ident,
        namespace: &NamespaceName,
    ) -> Result<TableCheck, MigrationError> {
        let origin = QualifiedTable::new(namespace.ident(), &spec.table);
        let restored = QualifiedTable::new(shared, &spec.table);
        let filter = TenantColumn::new(&spec.discriminator, tenant);

        let namespace_count = count_if_exists(db, &origin, None).await?;
        let shared_count = count_if_exists(db, &restored, Some(&filter)).await?;
        if namespace_count != shared_count {
            return Err(MigrationError::RollbackIntegrity {
                table: spec.table.to_string(),
                namespace_count,
                shared_count,
            });
        }

        let mut check = TableCheck {
            table: spec.table.to_string(),
            source_count: namespace_count,
            dest_count: shared_count,
            checksum: None,
        };
        if self.checksum && namespace_count > 0 {
            let columns = copied_columns(db, &origin, &spec.discriminator).await?;
            let source_digest = db.checksum(&origin, &columns, None).await?;
            let dest_digest = db.checksum(&restored, &columns, Some(&filter)).await?;
            if source_digest != dest_digest {
                return Err(MigrationError::ChecksumMismatch {
                    table: spec.table.to_string(),
                    source_digest,
                    dest_digest,
                });
            }
            check.checksum = Some(dest_digest);
        }
        Ok(check)
    }
}

async fn count_if_exists<D: Database>(
    db: &mut D,
    table: &QualifiedTable,
    filter: Option<&TenantColumn>,
) -> Result<i64, MigrationError> {
    if !db.table_exists(table).await? {
        return Ok(0);
    }
    Ok(db.count_rows(table, filter).await?)
}

/// Columns of the tenant-side table, which never carries the discriminator.
async fn copied_columns<D: Database>(
    db: &mut D,
    table: &QualifiedTable,
    discriminator: &Ident,
) -> Result<Vec<Ident>, MigrationError> {
    Ok(db
        .columns(table)
        .await?
        .into_iter()
        .filter(|c| c != discriminator)
        .collect())
}
