//! Tenant records as seen by the migration engine.
//!
//! The platform owns tenants; the engine only reads identity and slug and
//! writes the migration status and the schema name.

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{DbError, DbResult};

/// Stable tenant identifier (the value stored in discriminator columns).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TenantId(pub i64);

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for TenantId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().parse().map(TenantId)
    }
}

/// Where a tenant's data currently lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationStatus {
    /// Shared tables only.
    #[default]
    Unmigrated,
    /// Forward migration in progress (only visible inside its transaction).
    Migrating,
    /// Data lives in the tenant schema.
    Migrated,
    /// Rollback in progress (only visible inside its transaction).
    RollbackInProgress,
}

impl MigrationStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            MigrationStatus::Unmigrated => "unmigrated",
            MigrationStatus::Migrating => "migrating",
            MigrationStatus::Migrated => "migrated",
            MigrationStatus::RollbackInProgress => "rollback_in_progress",
        }
    }
}

impl fmt::Display for MigrationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MigrationStatus {
    type Err = DbError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "" | "unmigrated" => Ok(MigrationStatus::Unmigrated),
            "migrating" => Ok(MigrationStatus::Migrating),
            "migrated" => Ok(MigrationStatus::Migrated),
            "rollback_in_progress" => Ok(MigrationStatus::RollbackInProgress),
            other => Err(DbError::Rejected(format!(
                "unknown tenant migration status {other:?}"
            ))),
        }
    }
}

/// One customer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tenant {
    pub id: TenantId,
    pub slug: Option<String>,
    pub status: MigrationStatus,
    /// Schema name, recorded once migrated.
    pub namespace: Option<String>,
}

impl Tenant {
    /// An unmigrated tenant.
    pub fn new(id: i64, slug: Option<&str>) -> Self {
        Self {
            id: TenantId(id),
            slug: slug.map(str::to_string),
            status: MigrationStatus::Unmigrated,
            namespace: None,
        }
    }
}

/// Which tenants to enumerate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TenantFilter {
    /// Every tenant whose status is not `migrated`.
    Unmigrated,
    /// Exactly these ids, whatever their status.
    Ids(Vec<TenantId>),
    /// Every tenant.
    All,
}

/// Tenant directory collaborator.
///
/// Implementations must run on the same connection as the [`Database`]
/// executor so status updates share the tenant transaction.
///
/// [`Database`]: crate::store::Database
#[async_trait]
pub trait TenantDirectory: Send {
    /// Tenants matching `filter`, in ascending id order.
    async fn list_tenants(&mut self, filter: &TenantFilter) -> DbResult<Vec<Tenant>>;

    /// Persist status and schema name.
    async fn update_tenant(&mut self, tenant: &Tenant) -> DbResult<()>;
}
