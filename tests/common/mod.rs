//! Shared fixtures: a small school database with two tenants.
#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use serde_json::{Value, json};

use qail_tenant::prelude::*;

pub const TABLES: &str = r#"
[[tables]]
name = "students"

[[tables]]
name = "courses"
"#;

/// Settings for `students` and `courses`, logging into `logs`.
pub fn settings(logs: &Path) -> EngineSettings {
    settings_from(TABLES, logs)
}

pub fn settings_from(toml: &str, logs: &Path) -> EngineSettings {
    let mut config = Config::parse(toml).unwrap();
    config.logs_dir = logs.to_path_buf();
    config.settings().unwrap()
}

/// Tenant 42 (`acme-corp`) owns three students and no courses; tenant 7
/// (`globex`) owns two students and one course.
pub fn school() -> MemoryStore {
    MemoryStore::new()
        .with_table("public", "students", &["id", "tenant_id", "name"], &["id"])
        .with_rows(
            "public",
            "students",
            [
                json!({"id": 1, "tenant_id": 42, "name": "Ann"}),
                json!({"id": 2, "tenant_id": 42, "name": "Bo"}),
                json!({"id": 3, "tenant_id": 42, "name": "Cy"}),
                json!({"id": 4, "tenant_id": 7, "name": "Di"}),
                json!({"id": 5, "tenant_id": 7, "name": "Ed"}),
            ],
        )
        .with_table("public", "courses", &["id", "tenant_id", "title"], &["id"])
        .with_rows(
            "public",
            "courses",
            [json!({"id": 1, "tenant_id": 7, "title": "Algebra"})],
        )
        .with_tenant(Tenant::new(42, Some("acme-corp")))
        .with_tenant(Tenant::new(7, Some("globex")))
}

/// Backup double that counts calls and can be told to fail.
#[derive(Clone, Default)]
pub struct FakeBackup {
    pub fail: bool,
    pub calls: Arc<AtomicUsize>,
}

impl FakeBackup {
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BackupService for FakeBackup {
    async fn create_backup(&mut self, tag: &str) -> Result<PathBuf, MigrationError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(MigrationError::Backup("pg_dump: disk full".to_string()));
        }
        Ok(PathBuf::from(format!("/backups/{tag}.dump")))
    }
}

pub fn orchestrator(logs: &Path) -> Orchestrator {
    Orchestrator::new(
        settings(logs),
        Box::new(FakeBackup::default()),
        Box::new(AutoConfirm(false)),
    )
}

pub fn only(tenant: i64) -> RunOptions {
    RunOptions {
        tenants: vec![TenantId(tenant)],
        ..RunOptions::default()
    }
}

/// The school with tenant 42 already migrated.
pub async fn migrated_school(logs: &Path) -> MemoryStore {
    let mut db = school();
    let summary = orchestrator(logs).run(&mut db, &only(42)).await.unwrap();
    assert_eq!(summary.succeeded, 1);
    db
}

/// Messages of every report entry written for `path`.
pub fn report_messages(path: &Path) -> Vec<String> {
    let report: Value = serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap();
    report["entries"]
        .as_array()
        .unwrap()
        .iter()
        .map(|e| e["message"].as_str().unwrap_or_default().to_string())
        .collect()
}

pub fn ids(db: &MemoryStore, schema: &str, table: &str) -> Vec<i64> {
    db.rows(schema, table)
        .unwrap()
        .iter()
        .map(|r| r["id"].as_i64().unwrap())
        .collect()
}
