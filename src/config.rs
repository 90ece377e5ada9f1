//! Configuration file (`qail-tenant.toml`).
//!
//! ```toml
//! database_url = "postgres://app@localhost/saas"
//! app_role = "app"
//!
//! [tenants]
//! table = "businesses"
//! slug_column = "slug"
//!
//! [[tables]]
//! name = "students"
//!
//! [[tables]]
//! name = "enrollments"
//! discriminator = "business_id"
//! ```
//!
//! Lookup order: explicit path, `./qail-tenant.toml`,
//! `<config dir>/qail-tenant/config.toml`.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::MigrationError;
use crate::ident::{Ident, QualifiedTable, TableSpec};
use crate::store::TenantTable;

/// File name searched in the working directory.
pub const CONFIG_FILE: &str = "qail-tenant.toml";

/// Tenant directory mapping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TenantsConfig {
    pub table: String,
    pub id_column: String,
    pub slug_column: Option<String>,
    pub status_column: String,
    pub schema_column: String,
}

impl Default for TenantsConfig {
    fn default() -> Self {
        Self {
            table: "tenants".to_string(),
            id_column: "id".to_string(),
            slug_column: Some("slug".to_string()),
            status_column: "migration_status".to_string(),
            schema_column: "schema_name".to_string(),
        }
    }
}

/// Raw configuration as read from TOML.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub database_url: Option<String>,
    pub app_role: Option<String>,
    pub shared_schema: String,
    pub logs_dir: PathBuf,
    pub backup_dir: PathBuf,
    pub clone_structure: bool,
    pub tenants: TenantsConfig,
    pub tables: Vec<TableSpec>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: None,
            app_role: None,
            shared_schema: "public".to_string(),
            logs_dir: PathBuf::from("storage/logs/tenant-migrations"),
            backup_dir: PathBuf::from("storage/backups"),
            clone_structure: true,
            tenants: TenantsConfig::default(),
            tables: Vec::new(),
        }
    }
}

/// Validated settings handed to the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineSettings {
    pub shared_schema: Ident,
    pub app_role: Option<Ident>,
    /// Migration order.
    pub tables: Vec<TableSpec>,
    pub tenants: TenantTable,
    pub clone_structure: bool,
    pub logs_dir: PathBuf,
}

impl Config {
    /// Load from `explicit`, else the first file found in the search path,
    /// else defaults.
    pub fn load(explicit: Option<&Path>) -> Result<Self, MigrationError> {
        if let Some(path) = explicit {
            return Self::from_file(path);
        }
        for candidate in Self::search_path() {
            if candidate.is_file() {
                return Self::from_file(&candidate);
            }
        }
        warn!("no {} found, using defaults", CONFIG_FILE);
        Ok(Self::default())
    }

    /// Candidate locations in lookup order.
    pub fn search_path() -> Vec<PathBuf> {
        let mut paths = vec![PathBuf::from(CONFIG_FILE)];
        if let Some(dir) = dirs::config_dir() {
            paths.push(dir.join("qail-tenant").join("config.toml"));
        }
        paths
    }

    pub fn from_file(path: &Path) -> Result<Self, MigrationError> {
        debug!(path = %path.display(), "loading config");
        let content = std::fs::read_to_string(path)
            .map_err(|e| MigrationError::Config(format!("{}: {}", path.display(), e)))?;
        Self::parse(&content)
            .map_err(|e| MigrationError::Config(format!("{}: {}", path.display(), e)))
    }

    pub fn parse(content: &str) -> Result<Self, MigrationError> {
        toml::from_str(content).map_err(|e| MigrationError::Config(e.to_string()))
    }

    /// Validate identifiers and build the engine settings.
    pub fn settings(&self) -> Result<EngineSettings, MigrationError> {
        let shared_schema = Ident::new(self.shared_schema.as_str())?;
        let t = &self.tenants;
        let tenants = TenantTable {
            table: QualifiedTable::new(&shared_schema, &Ident::new(t.table.as_str())?),
            id_column: Ident::new(t.id_column.as_str())?,
            slug_column: t.slug_column.as_deref().map(Ident::new).transpose()?,
            status_column: Ident::new(t.status_column.as_str())?,
            namespace_column: Ident::new(t.schema_column.as_str())?,
        };

        let mut seen = std::collections::HashSet::new();
        for spec in &self.tables {
            if !seen.insert(spec.table.as_str()) {
                return Err(MigrationError::Config(format!(
                    "table {} is declared twice",
                    spec.table
                )));
            }
        }

        Ok(EngineSettings {
            shared_schema,
            app_role: self.app_role.as_deref().map(Ident::new).transpose()?,
            tables: self.tables.clone(),
            tenants,
            clone_structure: self.clone_structure,
            logs_dir: self.logs_dir.clone(),
        })
    }
}
