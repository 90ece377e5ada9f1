//! Single-tenant rollback against the in-memory executor.

mod common;

use pretty_assertions::assert_eq;
use serde_json::json;

use common::*;
use qail_tenant::prelude::*;

fn engine(logs: &std::path::Path, answer: bool) -> RollbackEngine {
    RollbackEngine::new(settings(logs), Box::new(AutoConfirm(answer)))
}

fn forced() -> RollbackOptions {
    RollbackOptions {
        force: true,
        ..RollbackOptions::default()
    }
}

fn tenant_rows(db: &MemoryStore, table: &str, tenant: i64) -> Vec<i64> {
    db.rows("public", table)
        .unwrap()
        .iter()
        .filter(|r| r["tenant_id"] == json!(tenant))
        .map(|r| r["id"].as_i64().unwrap())
        .collect()
}

#[tokio::test]
async fn test_rollback_restores_rows_and_drops_schema() {
    let logs = tempfile::tempdir().unwrap();
    let mut db = migrated_school(logs.path()).await;

    let report = engine(logs.path(), false)
        .rollback(&mut db, TenantId(42), &forced())
        .await
        .unwrap();

    assert_eq!(report.rows_restored, 3);
    assert_eq!(report.rows_replaced, 3);
    assert!(report.namespace_dropped);
    assert_eq!(tenant_rows(&db, "students", 42), vec![1, 2, 3]);
    assert_eq!(tenant_rows(&db, "students", 7), vec![4, 5]);
    assert!(!db.has_namespace("tenant_acme_corp"));

    let tenant = db.tenant(42).unwrap();
    assert_eq!(tenant.status, MigrationStatus::Unmigrated);
    assert_eq!(tenant.namespace, None);

    let path = report.report_path.unwrap();
    assert!(path.file_name().unwrap().to_string_lossy().starts_with("tenant-rollback-"));
}

#[tokio::test]
async fn test_rollback_uses_schema_contents() {
    let logs = tempfile::tempdir().unwrap();
    let mut db = migrated_school(logs.path()).await;
    // written by the application after the migration
    db.insert_row("tenant_acme_corp", "students", json!({"id": 6, "name": "Fay"}))
        .unwrap();

    engine(logs.path(), false)
        .rollback(&mut db, TenantId(42), &forced())
        .await
        .unwrap();

    assert_eq!(tenant_rows(&db, "students", 42), vec![1, 2, 3, 6]);
}

#[tokio::test]
async fn test_preserve_schema_keeps_namespace() {
    let logs = tempfile::tempdir().unwrap();
    let mut db = migrated_school(logs.path()).await;
    let options = RollbackOptions {
        preserve_namespace: true,
        ..forced()
    };

    let report = engine(logs.path(), true)
        .rollback(&mut db, TenantId(42), &options)
        .await
        .unwrap();

    assert!(!report.namespace_dropped);
    assert!(db.has_namespace("tenant_acme_corp"));
    assert_eq!(db.tenant(42).unwrap().status, MigrationStatus::Unmigrated);
}

#[tokio::test]
async fn test_declined_drop_keeps_namespace() {
    let logs = tempfile::tempdir().unwrap();
    let mut db = migrated_school(logs.path()).await;

    let report = engine(logs.path(), false)
        .rollback(&mut db, TenantId(42), &RollbackOptions::default())
        .await
        .unwrap();

    assert!(!report.namespace_dropped);
    assert!(db.has_namespace("tenant_acme_corp"));
    assert_eq!(tenant_rows(&db, "students", 42), vec![1, 2, 3]);
}

#[tokio::test]
async fn test_unknown_tenant() {
    let logs = tempfile::tempdir().unwrap();
    let mut db = school();

    let err = engine(logs.path(), true)
        .rollback(&mut db, TenantId(999), &forced())
        .await
        .unwrap_err();
    assert!(matches!(err, MigrationError::TenantNotFound(TenantId(999))));
}

#[tokio::test]
async fn test_missing_schema() {
    let logs = tempfile::tempdir().unwrap();
    let mut db = school();

    let err = engine(logs.path(), true)
        .rollback(&mut db, TenantId(42), &forced())
        .await
        .unwrap_err();
    match err {
        MigrationError::NamespaceMissing { tenant, namespace } => {
            assert_eq!(tenant, TenantId(42));
            assert_eq!(namespace, "tenant_acme_corp");
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn test_unmigrated_tenant_needs_confirmation() {
    let logs = tempfile::tempdir().unwrap();
    let mut db = migrated_school(logs.path()).await;
    let preserve = RollbackOptions {
        preserve_namespace: true,
        ..forced()
    };
    engine(logs.path(), true)
        .rollback(&mut db, TenantId(42), &preserve)
        .await
        .unwrap();
    // written to the shared table after the first rollback
    db.insert_row("public", "students", json!({"id": 10, "tenant_id": 42, "name": "Gil"}))
        .unwrap();

    let err = engine(logs.path(), false)
        .rollback(&mut db, TenantId(42), &RollbackOptions::default())
        .await
        .unwrap_err();

    match err {
        MigrationError::TenantNotMigrated { tenant, status } => {
            assert_eq!(tenant, TenantId(42));
            assert_eq!(status, MigrationStatus::Unmigrated);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(tenant_rows(&db, "students", 42), vec![1, 2, 3, 10]);
    assert!(db.has_namespace("tenant_acme_corp"));

    let report = engine(logs.path(), true)
        .rollback(&mut db, TenantId(42), &RollbackOptions::default())
        .await
        .unwrap();
    assert_eq!(report.rows_replaced, 4);
    assert_eq!(tenant_rows(&db, "students", 42), vec![1, 2, 3]);
}

#[tokio::test]
async fn test_reverse_mismatch_keeps_everything() {
    let logs = tempfile::tempdir().unwrap();
    let mut db = migrated_school(logs.path()).await;
    db.plant_row_after_copy(
        "public",
        "students",
        json!({"id": 50, "tenant_id": 42, "name": "Ghost"}),
    );

    let err = engine(logs.path(), true)
        .rollback(&mut db, TenantId(42), &forced())
        .await
        .unwrap_err();

    match err {
        MigrationError::RollbackIntegrity {
            table,
            namespace_count,
            shared_count,
        } => {
            assert_eq!(table, "students");
            assert_eq!((namespace_count, shared_count), (3, 4));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(db.has_namespace("tenant_acme_corp"));
    assert_eq!(tenant_rows(&db, "students", 42), vec![1, 2, 3]);
    assert_eq!(db.tenant(42).unwrap().status, MigrationStatus::Migrated);
    assert!(!db.in_transaction());
}

#[tokio::test]
async fn test_dry_run_changes_nothing() {
    let logs = tempfile::tempdir().unwrap();
    let mut db = migrated_school(logs.path()).await;
    let options = RollbackOptions {
        dry_run: true,
        ..forced()
    };

    let report = engine(logs.path(), true)
        .rollback(&mut db, TenantId(42), &options)
        .await
        .unwrap();

    assert!(report.dry_run);
    assert_eq!(report.rows_restored, 3);
    assert!(!report.namespace_dropped);
    assert!(db.has_namespace("tenant_acme_corp"));
    assert_eq!(db.tenant(42).unwrap().status, MigrationStatus::Migrated);

    let messages = report_messages(&report.report_path.unwrap());
    assert!(messages.contains(
        &"would restore 3 students rows, replacing 3 shared row(s)".to_string()
    ));
}

#[tokio::test]
async fn test_failed_restore_is_atomic() {
    let logs = tempfile::tempdir().unwrap();
    let mut db = migrated_school(logs.path()).await;
    db.fail_inserts_into("public", "students");

    let err = engine(logs.path(), true)
        .rollback(&mut db, TenantId(42), &forced())
        .await
        .unwrap_err();

    assert!(matches!(err, MigrationError::Copy { .. }));
    assert_eq!(tenant_rows(&db, "students", 42), vec![1, 2, 3]);
    assert!(db.has_namespace("tenant_acme_corp"));
    assert_eq!(db.tenant(42).unwrap().status, MigrationStatus::Migrated);
    assert!(!db.in_transaction());
}

#[tokio::test]
async fn test_shared_table_regains_discriminator() {
    let logs = tempfile::tempdir().unwrap();
    let mut migrated = Tenant::new(42, Some("acme-corp"));
    migrated.status = MigrationStatus::Migrated;
    migrated.namespace = Some("tenant_acme_corp".to_string());

    // students lost its tenant_id column; courses no longer exists at all
    let mut db = MemoryStore::new()
        .with_table("public", "students", &["id", "name"], &["id"])
        .with_table("tenant_acme_corp", "students", &["id", "name"], &["id"])
        .with_rows(
            "tenant_acme_corp",
            "students",
            [json!({"id": 1, "name": "Ann"}), json!({"id": 2, "name": "Bo"})],
        )
        .with_table("tenant_acme_corp", "courses", &["id", "title"], &["id"])
        .with_rows("tenant_acme_corp", "courses", [json!({"id": 1, "title": "Art"})])
        .with_tenant(migrated);

    let report = engine(logs.path(), true)
        .rollback(&mut db, TenantId(42), &forced())
        .await
        .unwrap();

    assert_eq!(report.rows_restored, 3);
    assert_eq!(
        db.columns_of("public", "students").unwrap(),
        ["id", "name", "tenant_id"]
    );
    assert!(db.has_index("public", "students", "students_tenant_id_index"));
    assert_eq!(tenant_rows(&db, "students", 42), vec![1, 2]);
    assert!(db.has_table("public", "courses"));
    assert_eq!(tenant_rows(&db, "courses", 42), vec![1]);
}

#[tokio::test]
async fn test_round_trip_can_migrate_again() {
    let logs = tempfile::tempdir().unwrap();
    let mut db = migrated_school(logs.path()).await;

    engine(logs.path(), true)
        .rollback(&mut db, TenantId(42), &forced())
        .await
        .unwrap();
    let summary = orchestrator(logs.path())
        .run(&mut db, &only(42))
        .await
        .unwrap();

    assert!(summary.is_success());
    assert_eq!(ids(&db, "tenant_acme_corp", "students"), vec![1, 2, 3]);
    assert_eq!(db.tenant(42).unwrap().status, MigrationStatus::Migrated);
}
