//! Reverse migration of a single tenant.
//!
//! Data moves back from the tenant schema into the shared tables inside one
//! transaction: the tenant's shared rows are replaced by the schema's rows
//! with the discriminator re-attached, then counts are verified and the
//! tenant is marked unmigrated. The schema itself is dropped only after the
//! commit, only when confirmed, and never when preservation is requested.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use serde::Serialize;
use serde_json::json;
use tracing::{error, info, warn};

use super::{DEFAULT_BATCH_SIZE, IntegrityVerifier, SchemaProvisioner, TableCopy, TableMigrator, TableOutcome};
use crate::config::EngineSettings;
use crate::confirm::Confirm;
use crate::error::MigrationError;
use crate::ident::{NamespaceName, QualifiedTable, TableSpec};
use crate::report::{LogEntry, LogStatus, MigrationLog, RunKind};
use crate::store::{Database, TenantColumn};
use crate::tenant::{MigrationStatus, Tenant, TenantDirectory, TenantFilter, TenantId};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RollbackOptions {
    pub dry_run: bool,
    pub batch_size: u64,
    /// Compare content digests in addition to row counts.
    pub checksum: bool,
    /// Keep the tenant schema after the data is restored.
    pub preserve_namespace: bool,
    /// Drop the schema without asking.
    pub force: bool,
}

impl Default for RollbackOptions {
    fn default() -> Self {
        Self {
            dry_run: false,
            batch_size: DEFAULT_BATCH_SIZE,
            checksum: false,
            preserve_namespace: false,
            force: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RollbackReport {
    pub run_id: String,
    pub tenant_id: TenantId,
    pub namespace: String,
    pub dry_run: bool,
    pub tables: Vec<TableOutcome>,
    pub rows_restored: u64,
    /// Shared rows of the tenant deleted before the restore.
    pub rows_replaced: u64,
    pub namespace_dropped: bool,
    pub elapsed: Duration,
    pub report_path: Option<PathBuf>,
}

impl RollbackReport {
    fn new(log: &MigrationLog, tenant_id: TenantId, namespace: &NamespaceName, dry_run: bool) -> Self {
        Self {
            run_id: log.run_id().to_string(),
            tenant_id,
            namespace: namespace.to_string(),
            dry_run,
            tables: Vec::new(),
            rows_restored: 0,
            rows_replaced: 0,
            namespace_dropped: false,
            elapsed: Duration::ZERO,
            report_path: None,
        }
    }
}

/// Moves one tenant back into the shared tables.
pub struct RollbackEngine {
    settings: EngineSettings,
    provisioner: SchemaProvisioner,
    confirm: Box<dyn Confirm>,
    echo: bool,
}

impl RollbackEngine {
    pub fn new(settings: EngineSettings, confirm: Box<dyn Confirm>) -> Self {
        Self {
            provisioner: SchemaProvisioner::new(settings.app_role.clone()),
            settings,
            confirm,
            echo: false,
        }
    }

    pub fn echo(mut self, on: bool) -> Self {
        self.echo = on;
        self
    }

    /// Roll back `tenant_id`. The report file is written whatever happens.
    pub async fn rollback<S>(
        &mut self,
        db: &mut S,
        tenant_id: TenantId,
        options: &RollbackOptions,
    ) -> Result<RollbackReport, MigrationError>
    where
        S: Database + TenantDirectory,
    {
        let clock = Instant::now();
        let mut log = MigrationLog::new(
            RunKind::Rollback,
            &json!({ "tenant_id": tenant_id, "options": options }),
        )
        .echo(self.echo);
        info!(run_id = log.run_id(), tenant = tenant_id.0, dry_run = options.dry_run, "tenant rollback started");

        let result = self.execute(db, tenant_id, options, &mut log).await;
        if let Err(e) = &result {
            error!(tenant = tenant_id.0, error = %e, "tenant rollback failed");
            log.log(
                LogEntry::failed(Some(tenant_id), "rollback", e.to_string())
                    .with_context(json!({ "error": e.name() })),
            );
        }

        let report_path = match log.flush(&self.settings.logs_dir) {
            Ok(path) => Some(path),
            Err(e) => {
                warn!(error = %e, "could not write rollback report");
                None
            }
        };

        let mut report = result?;
        report.elapsed = clock.elapsed();
        report.report_path = report_path;
        info!(
            tenant = tenant_id.0,
            rows = report.rows_restored,
            dropped = report.namespace_dropped,
            "tenant rollback finished"
        );
        Ok(report)
    }

    async fn execute<S>(
        &mut self,
        db: &mut S,
        tenant_id: TenantId,
        options: &RollbackOptions,
        log: &mut MigrationLog,
    ) -> Result<RollbackReport, MigrationError>
    where
        S: Database + TenantDirectory,
    {
        let tenant = db
            .list_tenants(&TenantFilter::Ids(vec![tenant_id]))
            .await?
            .into_iter()
            .next()
            .ok_or(MigrationError::TenantNotFound(tenant_id))?;
        let namespace = NamespaceName::resolve(&tenant)?;
        if !db.namespace_exists(namespace.ident()).await? {
            return Err(MigrationError::NamespaceMissing {
                tenant: tenant_id,
                namespace: namespace.to_string(),
            });
        }
        self.check_status(&tenant, &namespace, options, log)?;
        log.log(LogEntry::success(
            Some(tenant_id),
            "validate",
            format!("schema {namespace}, status {}", tenant.status),
        ));

        let mut report = RollbackReport::new(log, tenant_id, &namespace, options.dry_run);
        if options.dry_run {
            self.simulate(db, &tenant, &namespace, options, log, &mut report)
                .await?;
            return Ok(report);
        }

        db.begin().await?;
        match self
            .restore_steps(db, &tenant, &namespace, options, log, &mut report)
            .await
        {
            Ok(()) => db.commit().await?,
            Err(e) => {
                if let Err(rollback) = db.rollback().await {
                    error!(tenant = tenant_id.0, error = %rollback, "transaction rollback failed");
                }
                log.log(LogEntry::failed(
                    Some(tenant_id),
                    "rollback_transaction",
                    "restore rolled back, shared tables unchanged",
                ));
                return Err(e);
            }
        }

        self.drop_step(db, &namespace, options, log, &mut report)
            .await?;
        Ok(report)
    }

    /// A tenant that is not migrated keeps live shared rows; replacing them
    /// needs `force` or an explicit yes.
    fn check_status(
        &mut self,
        tenant: &Tenant,
        namespace: &NamespaceName,
        options: &RollbackOptions,
        log: &mut MigrationLog,
    ) -> Result<(), MigrationError> {
        if matches!(
            tenant.status,
            MigrationStatus::Migrated | MigrationStatus::RollbackInProgress
        ) {
            return Ok(());
        }
        warn!(tenant = tenant.id.0, status = %tenant.status, "rolling back a tenant that is not marked migrated");
        if options.dry_run {
            log.log(LogEntry::skipped(
                Some(tenant.id),
                "validate",
                format!(
                    "tenant is {}; a real rollback replaces its shared rows only when forced or confirmed",
                    tenant.status
                ),
            ));
            return Ok(());
        }

        let question = format!(
            "Tenant {} is {}, not migrated. Replace its shared rows with the contents of {namespace}?",
            tenant.id, tenant.status
        );
        if options.force || self.confirm.confirm(&question) {
            log.log(LogEntry::success(
                Some(tenant.id),
                "validate",
                format!("replacing shared rows of {} tenant", tenant.status),
            ));
            return Ok(());
        }
        Err(MigrationError::TenantNotMigrated {
            tenant: tenant.id,
            status: tenant.status,
        })
    }

    async fn restore_steps<S>(
        &self,
        db: &mut S,
        tenant: &Tenant,
        namespace: &NamespaceName,
        options: &RollbackOptions,
        log: &mut MigrationLog,
        report: &mut RollbackReport,
    ) -> Result<(), MigrationError>
    where
        S: Database + TenantDirectory,
    {
        let id = Some(tenant.id);
        let shared = &self.settings.shared_schema;
        let mut record = tenant.clone();
        record.status = MigrationStatus::RollbackInProgress;
        db.update_tenant(&record).await?;

        let mut restorable: Vec<&TableSpec> = Vec::new();
        for spec in &self.settings.tables {
            let origin = QualifiedTable::new(namespace.ident(), &spec.table);
            if !db.table_exists(&origin).await? {
                let line = TableOutcome::from_copy(spec.table.as_str(), TableCopy::MissingSource, "restored");
                log.log(LogEntry::new(id, "restore_table", line.status, line.message.clone()));
                report.tables.push(line);
                continue;
            }
            self.prepare_shared(db, &origin, spec, log, id).await?;
            restorable.push(spec);
        }

        let migrator = TableMigrator::new(options.batch_size);
        for spec in &restorable {
            let target = QualifiedTable::new(shared, &spec.table);
            let filter = TenantColumn::new(&spec.discriminator, tenant.id);
            let replaced = db.delete_rows(&target, &filter).await?;
            let copy = migrator
                .restore_table(db, tenant.id, spec, shared, namespace)
                .await?;
            let line = TableOutcome::from_copy(spec.table.as_str(), copy, "restored");
            log.log(
                LogEntry::new(id, "restore_table", line.status, line.message.clone()).with_context(
                    json!({ "table": line.table, "rows": line.rows, "replaced": replaced }),
                ),
            );
            report.rows_restored += line.rows;
            report.rows_replaced += replaced;
            report.tables.push(line);
        }

        let verifier = IntegrityVerifier::new(options.checksum);
        for spec in &restorable {
            let check = verifier
                .verify_restored(db, tenant.id, spec, shared, namespace)
                .await?;
            log.log(LogEntry::success(
                id,
                "verify_table",
                format!("{}: {} row(s) match", check.table, check.dest_count),
            ));
        }

        record.status = MigrationStatus::Unmigrated;
        record.namespace = None;
        db.update_tenant(&record).await?;
        log.log(LogEntry::success(id, "update_tenant", "status set to unmigrated"));
        Ok(())
    }

    /// Make sure the shared table exists and carries the discriminator.
    async fn prepare_shared<D: Database>(
        &self,
        db: &mut D,
        origin: &QualifiedTable,
        spec: &TableSpec,
        log: &mut MigrationLog,
        id: Option<TenantId>,
    ) -> Result<(), MigrationError> {
        let shared = &self.settings.shared_schema;
        let target = QualifiedTable::new(shared, &spec.table);
        let provision = |source| MigrationError::Provision {
            namespace: shared.to_string(),
            source,
        };

        if !db.table_exists(&target).await? {
            db.clone_structure(origin, &target, None)
                .await
                .map_err(provision)?;
            log.log(LogEntry::success(
                id,
                "prepare_shared_table",
                format!("recreated {target} from {origin}"),
            ));
        }
        if !db.columns(&target).await?.contains(&spec.discriminator) {
            db.add_discriminator(&target, &spec.discriminator)
                .await
                .map_err(provision)?;
            log.log(LogEntry::success(
                id,
                "prepare_shared_table",
                format!("added {} to {target}", spec.discriminator),
            ));
        }
        Ok(())
    }

    async fn drop_step<D: Database>(
        &mut self,
        db: &mut D,
        namespace: &NamespaceName,
        options: &RollbackOptions,
        log: &mut MigrationLog,
        report: &mut RollbackReport,
    ) -> Result<(), MigrationError> {
        let id = Some(report.tenant_id);
        if options.preserve_namespace {
            log.log(LogEntry::skipped(id, "drop_schema", format!("schema {namespace} preserved")));
            return Ok(());
        }

        let question = format!("Drop schema {namespace} and everything in it? This cannot be undone.");
        if !options.force && !self.confirm.confirm(&question) {
            log.log(LogEntry::skipped(
                id,
                "drop_schema",
                format!("declined, schema {namespace} preserved"),
            ));
            return Ok(());
        }

        match self.provisioner.drop_namespace(db, namespace).await {
            Ok(()) => {
                report.namespace_dropped = true;
                log.log(LogEntry::success(id, "drop_schema", format!("schema {namespace} dropped")));
                Ok(())
            }
            Err(e) => {
                log.log(LogEntry::failed(id, "drop_schema", e.to_string()));
                Err(e)
            }
        }
    }

    async fn simulate<D: Database>(
        &self,
        db: &mut D,
        tenant: &Tenant,
        namespace: &NamespaceName,
        options: &RollbackOptions,
        log: &mut MigrationLog,
        report: &mut RollbackReport,
    ) -> Result<(), MigrationError> {
        let id = Some(tenant.id);
        let shared = &self.settings.shared_schema;
        for spec in &self.settings.tables {
            let origin = QualifiedTable::new(namespace.ident(), &spec.table);
            let target = QualifiedTable::new(shared, &spec.table);
            let table = spec.table.as_str();
            if !db.table_exists(&origin).await? {
                log.log(LogEntry::skipped(id, "restore_table", format!("{table}: not in {namespace}")));
                continue;
            }

            let rows = u64::try_from(db.count_rows(&origin, None).await?).unwrap_or(0);
            let replaced = if db.table_exists(&target).await? {
                if !db.columns(&target).await?.contains(&spec.discriminator) {
                    log.log(LogEntry::skipped(
                        id,
                        "prepare_shared_table",
                        format!("would add {} to {target}", spec.discriminator),
                    ));
                    0
                } else {
                    let filter = TenantColumn::new(&spec.discriminator, tenant.id);
                    db.count_rows(&target, Some(&filter)).await?
                }
            } else {
                log.log(LogEntry::skipped(id, "prepare_shared_table", format!("would recreate {target}")));
                0
            };

            let message = format!("would restore {rows} {table} rows, replacing {replaced} shared row(s)");
            log.log(
                LogEntry::skipped(id, "restore_table", message.clone())
                    .with_context(json!({ "table": table, "rows": rows, "replaced": replaced, "dry_run": true })),
            );
            report.rows_restored += rows;
            report.tables.push(TableOutcome {
                table: table.to_string(),
                rows,
                status: LogStatus::Skipped,
                message,
            });
        }

        let drop = if options.preserve_namespace {
            format!("schema {namespace} would be preserved")
        } else {
            format!("would drop schema {namespace}")
        };
        log.log(LogEntry::skipped(id, "drop_schema", drop));
        Ok(())
    }
}
