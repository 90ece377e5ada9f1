//! Command implementations behind the `qail-tenant` binary.
//!
//! Each command connects, runs one engine operation with progress echo
//! on, and prints a colored summary.

mod migrate;
mod rollback;
mod status;

pub use migrate::{migrate_tenants, print_summary};
pub use rollback::{print_rollback, rollback_tenant};
pub use status::{print_status, tenant_status};

use anyhow::{Context, Result};

use crate::config::EngineSettings;
use crate::store::PgStore;

async fn connect(url: &str, settings: &EngineSettings) -> Result<PgStore> {
    PgStore::connect(url, settings.tenants.clone())
        .await
        .context("Failed to connect")
}
