//! Schema provisioner: schema-level DDL only, never row data.

use tracing::{debug, info};

use crate::error::{DbError, MigrationError};
use crate::ident::{Ident, NamespaceName, QualifiedTable};
use crate::store::Database;

/// Creates, grants and drops tenant schemas.
#[derive(Debug, Clone)]
pub struct SchemaProvisioner {
    app_role: Option<Ident>,
}

impl SchemaProvisioner {
    pub fn new(app_role: Option<Ident>) -> Self {
        Self { app_role }
    }

    /// Create the schema if absent and grant the application role access.
    ///
    /// Idempotent: safe to re-run after a partial failure.
    pub async fn ensure_namespace<D: Database>(
        &self,
        db: &mut D,
        namespace: &NamespaceName,
    ) -> Result<(), MigrationError> {
        let fail = |source| MigrationError::Provision {
            namespace: namespace.to_string(),
            source,
        };
        db.create_namespace(namespace.ident()).await.map_err(fail)?;
        if let Some(role) = &self.app_role {
            db.grant_namespace(namespace.ident(), role)
                .await
                .map_err(fail)?;
        }
        info!(namespace = %namespace, role = ?self.app_role.as_ref().map(Ident::as_str), "schema ensured");
        Ok(())
    }

    /// Irreversibly drop the schema and everything in it.
    ///
    /// Callers obtain operator confirmation first.
    pub async fn drop_namespace<D: Database>(
        &self,
        db: &mut D,
        namespace: &NamespaceName,
    ) -> Result<(), MigrationError> {
        db.drop_namespace(namespace.ident(), true)
            .await
            .map_err(|source| MigrationError::Provision {
                namespace: namespace.to_string(),
                source,
            })?;
        info!(namespace = %namespace, "schema dropped");
        Ok(())
    }

    /// Give `dest` the structure of `source` (minus `without`) unless it
    /// already exists. Returns `false` when there is no source to copy from.
    pub async fn prepare_table<D: Database>(
        &self,
        db: &mut D,
        source: &QualifiedTable,
        dest: &QualifiedTable,
        without: Option<&Ident>,
    ) -> Result<bool, MigrationError> {
        if !db.table_exists(source).await? {
            debug!(table = %source, "no source table to clone");
            return Ok(false);
        }
        db.clone_structure(source, dest, without)
            .await
            .map_err(|source| MigrationError::Provision {
                namespace: dest.schema.to_string(),
                source,
            })?;
        Ok(true)
    }

    /// Check that the connection may create and drop schemas.
    ///
    /// Runs inside a transaction that is always rolled back, so nothing
    /// persists even when the probe succeeds.
    pub async fn probe_ddl<D: Database>(&self, db: &mut D) -> Result<(), DbError> {
        let probe = Ident::new(format!("_qail_tenant_probe_{}", std::process::id()))
            .map_err(|e| DbError::Identifier(e.to_string()))?;
        db.begin().await?;
        let attempt = async {
            db.create_namespace(&probe).await?;
            db.drop_namespace(&probe, true).await
        }
        .await;
        db.rollback().await?;
        attempt
    }
}
