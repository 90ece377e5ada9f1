//! Forward migration runs against the in-memory executor.

mod common;

use pretty_assertions::assert_eq;
use serde_json::json;

use common::*;
use qail_tenant::prelude::*;

#[tokio::test]
async fn test_migrates_tenant_into_its_schema() {
    let logs = tempfile::tempdir().unwrap();
    let mut db = school();
    let options = RunOptions {
        verify: true,
        ..only(42)
    };

    let summary = orchestrator(logs.path()).run(&mut db, &options).await.unwrap();

    assert!(summary.is_success());
    assert_eq!(summary.succeeded, 1);
    assert_eq!(summary.rows_migrated, 3);
    assert_eq!(ids(&db, "tenant_acme_corp", "students"), vec![1, 2, 3]);
    assert_eq!(
        db.columns_of("tenant_acme_corp", "students").unwrap(),
        ["id", "name"]
    );

    let outcome = summary.outcome(TenantId(42)).unwrap();
    assert_eq!(outcome.phase, TenantPhase::Completed);
    assert_eq!(outcome.namespace.as_deref(), Some("tenant_acme_corp"));
    let courses = outcome.tables.iter().find(|t| t.table == "courses").unwrap();
    assert_eq!(courses.status, LogStatus::Skipped);
    assert_eq!(courses.rows, 0);

    let tenant = db.tenant(42).unwrap();
    assert_eq!(tenant.status, MigrationStatus::Migrated);
    assert_eq!(tenant.namespace.as_deref(), Some("tenant_acme_corp"));
    assert_eq!(db.tenant(7).unwrap().status, MigrationStatus::Unmigrated);

    // shared rows stay where they were
    assert_eq!(db.rows("public", "students").unwrap().len(), 5);
    assert!(!db.in_transaction());

    let report = summary.report_path.unwrap();
    assert!(report.starts_with(logs.path()));
    assert!(report_messages(&report).contains(&"migrated 3 students rows".to_string()));
}

#[tokio::test]
async fn test_dry_run_changes_nothing() {
    let logs = tempfile::tempdir().unwrap();
    let mut db = school();
    let backup = FakeBackup::default();
    let mut orchestrator = Orchestrator::new(
        settings(logs.path()),
        Box::new(backup.clone()),
        Box::new(AutoConfirm(false)),
    );
    let options = RunOptions {
        dry_run: true,
        ..only(42)
    };

    let summary = orchestrator.run(&mut db, &options).await.unwrap();

    assert!(summary.dry_run);
    assert_eq!(summary.rows_migrated, 3);
    assert!(!db.has_namespace("tenant_acme_corp"));
    assert_eq!(db.tenant(42).unwrap().status, MigrationStatus::Unmigrated);
    assert_eq!(backup.calls(), 0);
    assert!(summary.backup_path.is_none());

    let messages = report_messages(&summary.report_path.unwrap());
    assert!(messages.contains(&"would migrate 3 students rows".to_string()));
    assert!(messages.contains(&"would create schema tenant_acme_corp".to_string()));
}

#[tokio::test]
async fn test_verification_mismatch_rolls_tenant_back() {
    let logs = tempfile::tempdir().unwrap();
    let mut db = school();
    db.plant_row_after_copy(
        "tenant_acme_corp",
        "students",
        json!({"id": 99, "name": "Ghost"}),
    );
    let options = RunOptions {
        verify: true,
        ..only(42)
    };

    let summary = orchestrator(logs.path()).run(&mut db, &options).await.unwrap();

    assert!(!summary.is_success());
    let outcome = summary.outcome(TenantId(42)).unwrap();
    assert_eq!(outcome.phase, TenantPhase::Failed);
    assert_eq!(outcome.failed_at, Some(TenantPhase::Verifying));
    assert_eq!(outcome.error_kind, Some("verification_mismatch_error"));
    assert_eq!(db.tenant(42).unwrap().status, MigrationStatus::Unmigrated);
    assert!(!db.has_namespace("tenant_acme_corp"));
    assert!(!db.in_transaction());
}

#[tokio::test]
async fn test_verification_only_runs_when_requested() {
    let logs = tempfile::tempdir().unwrap();
    let mut db = school();
    db.plant_row_after_copy(
        "tenant_acme_corp",
        "students",
        json!({"id": 99, "name": "Ghost"}),
    );

    let summary = orchestrator(logs.path()).run(&mut db, &only(42)).await.unwrap();

    assert!(summary.is_success());
    assert_eq!(ids(&db, "tenant_acme_corp", "students"), vec![1, 2, 3, 99]);
    let messages = report_messages(&summary.report_path.unwrap());
    assert!(messages.contains(&"verification not requested".to_string()));
}

#[tokio::test]
async fn test_checksum_implies_verification() {
    let logs = tempfile::tempdir().unwrap();
    let mut db = school();
    let options = RunOptions {
        checksum: true,
        ..only(42)
    };

    let summary = orchestrator(logs.path()).run(&mut db, &options).await.unwrap();

    assert!(summary.is_success());
    let report: serde_json::Value = serde_json::from_str(
        &std::fs::read_to_string(summary.report_path.unwrap()).unwrap(),
    )
    .unwrap();
    let checks: Vec<&serde_json::Value> = report["entries"]
        .as_array()
        .unwrap()
        .iter()
        .filter(|e| e["step"] == "verify_table")
        .collect();
    assert_eq!(checks.len(), 2);
    assert!(checks[0]["context"]["checksum"].is_string());
    assert!(checks[1]["context"]["checksum"].is_null());
}

#[tokio::test]
async fn test_copy_failure_is_atomic_and_run_continues() {
    let logs = tempfile::tempdir().unwrap();
    let mut db = school();
    db.fail_inserts_into("tenant_acme_corp", "students");

    let summary = orchestrator(logs.path())
        .run(&mut db, &RunOptions::default())
        .await
        .unwrap();

    assert_eq!((summary.succeeded, summary.failed), (1, 1));
    let failed = summary.outcome(TenantId(42)).unwrap();
    assert_eq!(failed.error_kind, Some("copy_error"));
    assert_eq!(failed.failed_at, Some(TenantPhase::CopyingTables));
    assert!(!db.has_namespace("tenant_acme_corp"));
    assert_eq!(db.tenant(42).unwrap().status, MigrationStatus::Unmigrated);

    assert_eq!(db.tenant(7).unwrap().status, MigrationStatus::Migrated);
    assert_eq!(ids(&db, "tenant_globex", "students"), vec![4, 5]);
    assert_eq!(ids(&db, "tenant_globex", "courses"), vec![1]);
}

#[tokio::test]
async fn test_missing_schema_table_fails_tenant() {
    let logs = tempfile::tempdir().unwrap();
    let mut db = school();
    let toml = format!("clone_structure = false\n{TABLES}");
    let mut orchestrator = Orchestrator::new(
        settings_from(&toml, logs.path()),
        Box::new(FakeBackup::default()),
        Box::new(AutoConfirm(false)),
    );

    let summary = orchestrator.run(&mut db, &only(42)).await.unwrap();

    let outcome = summary.outcome(TenantId(42)).unwrap();
    assert_eq!(outcome.phase, TenantPhase::Failed);
    assert_eq!(outcome.failed_at, Some(TenantPhase::CopyingTables));
    assert_eq!(outcome.error_kind, Some("copy_error"));
    assert_eq!(summary.rows_migrated, 0);
    assert_eq!(db.tenant(42).unwrap().status, MigrationStatus::Unmigrated);
    assert!(!db.has_table("tenant_acme_corp", "students"));
}

#[tokio::test]
async fn test_stop_on_failure_leaves_rest_untouched() {
    let logs = tempfile::tempdir().unwrap();
    let mut db = school();
    // tenants run in id order: 7 first
    db.fail_inserts_into("tenant_globex", "students");
    let options = RunOptions {
        stop_on_failure: true,
        ..RunOptions::default()
    };

    let summary = orchestrator(logs.path()).run(&mut db, &options).await.unwrap();

    assert!(summary.stopped_early);
    assert_eq!((summary.failed, summary.skipped), (1, 1));
    assert_eq!(
        summary.outcome(TenantId(42)).unwrap().phase,
        TenantPhase::Skipped
    );
    assert!(!db.has_namespace("tenant_acme_corp"));
    assert_eq!(db.tenant(42).unwrap().status, MigrationStatus::Unmigrated);
}

#[tokio::test]
async fn test_small_batches_copy_everything_in_order() {
    let logs = tempfile::tempdir().unwrap();
    let mut db = school();
    let options = RunOptions {
        batch_size: 1,
        verify: true,
        ..only(42)
    };

    let summary = orchestrator(logs.path()).run(&mut db, &options).await.unwrap();

    assert_eq!(summary.rows_migrated, 3);
    assert_eq!(ids(&db, "tenant_acme_corp", "students"), vec![1, 2, 3]);
}

#[tokio::test]
async fn test_namespace_collision_aborts_before_any_ddl() {
    let logs = tempfile::tempdir().unwrap();
    let mut db = school().with_tenant(Tenant::new(43, Some("Acme Corp")));
    let backup = FakeBackup::default();
    let mut orchestrator = Orchestrator::new(
        settings(logs.path()),
        Box::new(backup.clone()),
        Box::new(AutoConfirm(true)),
    );

    let err = orchestrator
        .run(&mut db, &RunOptions::default())
        .await
        .unwrap_err();

    match &err {
        MigrationError::NamespaceCollision { namespace, tenants } => {
            assert_eq!(namespace, "tenant_acme_corp");
            assert_eq!(tenants, &vec![TenantId(42), TenantId(43)]);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(err.kind(), ErrorKind::Fatal);
    assert_eq!(backup.calls(), 0);
    assert!(!db.has_namespace("tenant_acme_corp"));
    assert!(!db.has_namespace("tenant_globex"));

    // the aborted run still leaves a report behind
    assert_eq!(std::fs::read_dir(logs.path()).unwrap().count(), 1);
}

#[tokio::test]
async fn test_missing_tenant_table_is_prerequisite_failure() {
    let logs = tempfile::tempdir().unwrap();
    let mut db = school();
    db.drop_table("public", "tenants");

    let err = orchestrator(logs.path())
        .run(&mut db, &RunOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, MigrationError::Prerequisite(_)));
}

#[tokio::test]
async fn test_engine_without_schemas_is_rejected() {
    let logs = tempfile::tempdir().unwrap();
    let mut db = school();
    db.without_namespace_support();

    let err = orchestrator(logs.path())
        .run(&mut db, &RunOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, MigrationError::Prerequisite(_)));
}

#[tokio::test]
async fn test_missing_ddl_privilege_is_rejected() {
    let logs = tempfile::tempdir().unwrap();
    let mut db = school();
    db.deny_ddl();

    let err = orchestrator(logs.path())
        .run(&mut db, &RunOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, MigrationError::Prerequisite(_)));
    assert!(!db.in_transaction());
}

#[tokio::test]
async fn test_no_declared_tables_is_rejected() {
    let logs = tempfile::tempdir().unwrap();
    let mut db = school();
    let mut orchestrator = Orchestrator::new(
        settings_from("", logs.path()),
        Box::new(FakeBackup::default()),
        Box::new(AutoConfirm(false)),
    );

    let err = orchestrator
        .run(&mut db, &RunOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, MigrationError::Prerequisite(_)));
}

#[tokio::test]
async fn test_backup_failure_aborts_when_required() {
    let logs = tempfile::tempdir().unwrap();
    let mut db = school();
    let mut orchestrator = Orchestrator::new(
        settings(logs.path()),
        Box::new(FakeBackup::failing()),
        Box::new(AutoConfirm(false)),
    );

    let err = orchestrator
        .run(&mut db, &RunOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, MigrationError::Backup(_)));
    assert!(!db.has_namespace("tenant_acme_corp"));
}

#[tokio::test]
async fn test_backup_failure_tolerated_when_allowed() {
    let logs = tempfile::tempdir().unwrap();
    let mut db = school();
    let mut orchestrator = Orchestrator::new(
        settings(logs.path()),
        Box::new(FakeBackup::failing()),
        Box::new(AutoConfirm(false)),
    );
    let options = RunOptions {
        require_backup: false,
        ..only(42)
    };

    let summary = orchestrator.run(&mut db, &options).await.unwrap();
    assert!(summary.is_success());
    assert!(summary.backup_path.is_none());
    assert_eq!(db.tenant(42).unwrap().status, MigrationStatus::Migrated);
}

#[tokio::test]
async fn test_skip_backup_never_calls_backup() {
    let logs = tempfile::tempdir().unwrap();
    let mut db = school();
    let backup = FakeBackup::default();
    let mut orchestrator = Orchestrator::new(
        settings(logs.path()),
        Box::new(backup.clone()),
        Box::new(AutoConfirm(false)),
    );
    let options = RunOptions {
        skip_backup: true,
        ..only(42)
    };

    orchestrator.run(&mut db, &options).await.unwrap();
    assert_eq!(backup.calls(), 0);

    let summary = orchestrator.run(&mut db, &only(7)).await.unwrap();
    assert_eq!(backup.calls(), 1);
    assert!(summary.backup_path.is_some());
}

#[tokio::test]
async fn test_existing_schema_fails_under_force() {
    let logs = tempfile::tempdir().unwrap();
    let mut db = school().with_namespace("tenant_acme_corp");
    let options = RunOptions {
        force: true,
        ..only(42)
    };

    let summary = orchestrator(logs.path()).run(&mut db, &options).await.unwrap();

    let outcome = summary.outcome(TenantId(42)).unwrap();
    assert_eq!(outcome.phase, TenantPhase::Failed);
    assert_eq!(outcome.error_kind, Some("schema_conflict_error"));
    assert_eq!(db.tenant(42).unwrap().status, MigrationStatus::Unmigrated);
    assert!(db.has_namespace("tenant_acme_corp"));
}

#[tokio::test]
async fn test_existing_schema_reused_when_allowed() {
    let logs = tempfile::tempdir().unwrap();
    let mut db = school().with_namespace("tenant_acme_corp");
    let options = RunOptions {
        force: true,
        allow_existing_namespace: true,
        ..only(42)
    };

    let summary = orchestrator(logs.path()).run(&mut db, &options).await.unwrap();
    assert!(summary.is_success());
    assert_eq!(ids(&db, "tenant_acme_corp", "students"), vec![1, 2, 3]);
}

#[tokio::test]
async fn test_existing_schema_follows_operator_answer() {
    for (answer, expected) in [(true, TenantPhase::Completed), (false, TenantPhase::Failed)] {
        let logs = tempfile::tempdir().unwrap();
        let mut db = school().with_namespace("tenant_acme_corp");
        let mut orchestrator = Orchestrator::new(
            settings(logs.path()),
            Box::new(FakeBackup::default()),
            Box::new(AutoConfirm(answer)),
        );

        let summary = orchestrator.run(&mut db, &only(42)).await.unwrap();
        assert_eq!(summary.outcome(TenantId(42)).unwrap().phase, expected);
    }
}

#[tokio::test]
async fn test_dry_run_reports_schema_conflict() {
    let logs = tempfile::tempdir().unwrap();
    let mut db = school().with_namespace("tenant_acme_corp");
    let forced = RunOptions {
        dry_run: true,
        force: true,
        ..only(42)
    };

    let summary = orchestrator(logs.path()).run(&mut db, &forced).await.unwrap();

    let outcome = summary.outcome(TenantId(42)).unwrap();
    assert_eq!(outcome.phase, TenantPhase::Failed);
    assert_eq!(outcome.error_kind, Some("schema_conflict_error"));
    assert_eq!(db.tenant(42).unwrap().status, MigrationStatus::Unmigrated);

    let interactive = RunOptions {
        dry_run: true,
        ..only(42)
    };
    let summary = orchestrator(logs.path()).run(&mut db, &interactive).await.unwrap();
    let messages = report_messages(summary.report_path.as_ref().unwrap());
    assert!(messages.contains(
        &"schema tenant_acme_corp already exists; a real run asks before reusing it".to_string()
    ));
    assert_eq!(summary.outcome(TenantId(42)).unwrap().phase, TenantPhase::Completed);
}

#[tokio::test]
async fn test_migrated_and_unknown_tenants_are_skipped() {
    let logs = tempfile::tempdir().unwrap();
    let mut db = migrated_school(logs.path()).await;
    let options = RunOptions {
        tenants: vec![TenantId(42), TenantId(999)],
        ..RunOptions::default()
    };

    let summary = orchestrator(logs.path()).run(&mut db, &options).await.unwrap();

    assert_eq!((summary.succeeded, summary.failed, summary.skipped), (0, 0, 2));
    assert_eq!(
        summary.outcome(TenantId(999)).unwrap().error.as_deref(),
        Some("tenant not found")
    );
    assert_eq!(ids(&db, "tenant_acme_corp", "students"), vec![1, 2, 3]);
}

#[tokio::test]
async fn test_rerun_picks_up_only_unmigrated_tenants() {
    let logs = tempfile::tempdir().unwrap();
    let mut db = migrated_school(logs.path()).await;

    let summary = orchestrator(logs.path())
        .run(&mut db, &RunOptions::default())
        .await
        .unwrap();

    assert_eq!(summary.tenants.len(), 1);
    assert_eq!(summary.tenants[0].tenant_id, TenantId(7));
    assert_eq!(db.tenant(7).unwrap().status, MigrationStatus::Migrated);
}

#[tokio::test]
async fn test_schema_is_granted_to_app_role() {
    let logs = tempfile::tempdir().unwrap();
    let mut db = school();
    let toml = format!("app_role = \"app\"\n{TABLES}");
    let mut orchestrator = Orchestrator::new(
        settings_from(&toml, logs.path()),
        Box::new(FakeBackup::default()),
        Box::new(AutoConfirm(false)),
    );

    orchestrator.run(&mut db, &only(42)).await.unwrap();
    assert!(db.is_granted("tenant_acme_corp", "app"));
}
