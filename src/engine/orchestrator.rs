//! Forward migration run.
//!
//! ```text
//! prerequisites -> tenant selection + collision check -> backup
//!   -> for each tenant: BEGIN
//!        status = migrating
//!        provision schema (+ clone table structure)
//!        copy every declared table in batches
//!        verify every declared table (when requested)
//!        status = migrated, schema recorded
//!      COMMIT  (any per-tenant error: ROLLBACK, record, continue)
//! -> summary + report file
//! ```

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use tracing::{error, info, warn};

use super::{DEFAULT_BATCH_SIZE, IntegrityVerifier, SchemaProvisioner, TableMigrator, TableOutcome};
use crate::backup::BackupService;
use crate::config::EngineSettings;
use crate::confirm::Confirm;
use crate::error::{DbError, ErrorKind, MigrationError};
use crate::ident::{NamespaceName, QualifiedTable};
use crate::report::{LogEntry, MigrationLog, RunKind};
use crate::store::Database;
use crate::tenant::{MigrationStatus, Tenant, TenantDirectory, TenantFilter, TenantId};

/// Knobs for one forward run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunOptions {
    /// Inspect and report only; no DDL, no DML.
    pub dry_run: bool,
    /// Restrict the run to these tenants (empty: every unmigrated tenant).
    pub tenants: Vec<TenantId>,
    pub batch_size: u64,
    /// Compare row counts of every table after copying.
    pub verify: bool,
    /// Also compare content digests. Implies `verify`.
    pub checksum: bool,
    /// Never prompt; an existing schema fails the tenant.
    pub force: bool,
    pub skip_backup: bool,
    /// Abort the run when the backup fails.
    pub require_backup: bool,
    /// Stop after the first failed tenant.
    pub stop_on_failure: bool,
    /// Reuse a schema that already exists for an unmigrated tenant.
    pub allow_existing_namespace: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            dry_run: false,
            tenants: Vec::new(),
            batch_size: DEFAULT_BATCH_SIZE,
            verify: false,
            checksum: false,
            force: false,
            skip_backup: false,
            require_backup: true,
            stop_on_failure: false,
            allow_existing_namespace: false,
        }
    }
}

/// Where a tenant's attempt stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TenantPhase {
    Pending,
    Provisioning,
    CopyingTables,
    Verifying,
    Completed,
    Failed,
    Skipped,
}

/// Result of one tenant's attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TenantOutcome {
    pub tenant_id: TenantId,
    pub namespace: Option<String>,
    pub phase: TenantPhase,
    /// Phase in which the attempt failed.
    pub failed_at: Option<TenantPhase>,
    pub tables: Vec<TableOutcome>,
    /// Rows copied (or, in a dry run, that would be copied).
    pub rows: u64,
    pub error: Option<String>,
    pub error_kind: Option<&'static str>,
}

impl TenantOutcome {
    pub fn new(tenant_id: TenantId) -> Self {
        Self {
            tenant_id,
            namespace: None,
            phase: TenantPhase::Pending,
            failed_at: None,
            tables: Vec::new(),
            rows: 0,
            error: None,
            error_kind: None,
        }
    }

    fn skipped(tenant_id: TenantId, reason: &str) -> Self {
        Self {
            phase: TenantPhase::Skipped,
            error: Some(reason.to_string()),
            ..Self::new(tenant_id)
        }
    }

    fn fail(&mut self, error: &MigrationError) {
        self.failed_at = Some(self.phase);
        self.phase = TenantPhase::Failed;
        self.rows = 0;
        self.error = Some(error.to_string());
        self.error_kind = Some(error.name());
    }
}

/// What a run did.
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub run_id: String,
    pub dry_run: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub elapsed: Duration,
    pub tenants: Vec<TenantOutcome>,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    pub rows_migrated: u64,
    /// Set when `stop_on_failure` cut the run short.
    pub stopped_early: bool,
    pub backup_path: Option<PathBuf>,
    pub report_path: Option<PathBuf>,
}

impl RunSummary {
    fn new(log: &MigrationLog, dry_run: bool) -> Self {
        Self {
            run_id: log.run_id().to_string(),
            dry_run,
            started_at: log.started_at(),
            finished_at: log.started_at(),
            elapsed: Duration::ZERO,
            tenants: Vec::new(),
            succeeded: 0,
            failed: 0,
            skipped: 0,
            rows_migrated: 0,
            stopped_early: false,
            backup_path: None,
            report_path: None,
        }
    }

    fn record(&mut self, outcome: TenantOutcome) {
        match outcome.phase {
            TenantPhase::Completed => {
                self.succeeded += 1;
                self.rows_migrated += outcome.rows;
            }
            TenantPhase::Failed => self.failed += 1,
            _ => self.skipped += 1,
        }
        self.tenants.push(outcome);
    }

    /// No tenant failed.
    pub fn is_success(&self) -> bool {
        self.failed == 0
    }

    pub fn outcome(&self, tenant: TenantId) -> Option<&TenantOutcome> {
        self.tenants.iter().find(|o| o.tenant_id == tenant)
    }
}

/// Drives a forward migration run.
pub struct Orchestrator {
    settings: EngineSettings,
    provisioner: SchemaProvisioner,
    backup: Box<dyn BackupService>,
    confirm: Box<dyn Confirm>,
    echo: bool,
}

impl Orchestrator {
    pub fn new(
        settings: EngineSettings,
        backup: Box<dyn BackupService>,
        confirm: Box<dyn Confirm>,
    ) -> Self {
        Self {
            provisioner: SchemaProvisioner::new(settings.app_role.clone()),
            settings,
            backup,
            confirm,
            echo: false,
        }
    }

    /// Print progress lines as steps are logged.
    pub fn echo(mut self, on: bool) -> Self {
        self.echo = on;
        self
    }

    /// Run a migration.
    ///
    /// Returns `Err` only for run-level (fatal) failures; per-tenant
    /// failures are recorded in the summary. The report file is written
    /// either way.
    pub async fn run<S>(
        &mut self,
        db: &mut S,
        options: &RunOptions,
    ) -> Result<RunSummary, MigrationError>
    where
        S: Database + TenantDirectory,
    {
        let clock = Instant::now();
        let mut log = MigrationLog::new(RunKind::Migration, options).echo(self.echo);
        info!(run_id = log.run_id(), dry_run = options.dry_run, "tenant migration started");

        let result = self.execute(db, options, &mut log).await;
        if let Err(e) = &result {
            error!(error = %e, "tenant migration aborted");
            log.log(
                LogEntry::failed(None, "run", format!("aborted: {e}"))
                    .with_context(json!({ "error": e.name() })),
            );
        }

        let report_path = match log.flush(&self.settings.logs_dir) {
            Ok(path) => Some(path),
            Err(e) => {
                warn!(error = %e, "could not write migration report");
                None
            }
        };

        let mut summary = result?;
        summary.finished_at = Utc::now();
        summary.elapsed = clock.elapsed();
        summary.report_path = report_path;
        info!(
            run_id = %summary.run_id,
            succeeded = summary.succeeded,
            failed = summary.failed,
            skipped = summary.skipped,
            rows = summary.rows_migrated,
            "tenant migration finished"
        );
        Ok(summary)
    }

    async fn execute<S>(
        &mut self,
        db: &mut S,
        options: &RunOptions,
        log: &mut MigrationLog,
    ) -> Result<RunSummary, MigrationError>
    where
        S: Database + TenantDirectory,
    {
        self.check_prerequisites(db, log).await?;
        let (tenants, unknown) = self.select_tenants(db, options, log).await?;
        let backup_path = self.create_backup(options, log).await?;

        let mut summary = RunSummary::new(log, options.dry_run);
        summary.backup_path = backup_path;
        for id in unknown {
            summary.record(TenantOutcome::skipped(id, "tenant not found"));
        }

        let total = tenants.len();
        let mut pending = tenants.into_iter().enumerate();
        while let Some((index, tenant)) = pending.next() {
            info!(tenant = tenant.id.0, "tenant {}/{}", index + 1, total);
            let outcome = self.migrate_tenant(db, tenant, options, log).await?;
            let failed = outcome.phase == TenantPhase::Failed;
            summary.record(outcome);

            if failed && options.stop_on_failure {
                summary.stopped_early = true;
                let rest: Vec<TenantId> = pending.by_ref().map(|(_, t)| t.id).collect();
                log.log(LogEntry::skipped(
                    None,
                    "run",
                    format!(
                        "stopping after first failure; {} tenant(s) not attempted",
                        rest.len()
                    ),
                ));
                for id in rest {
                    summary.record(TenantOutcome::skipped(id, "not attempted"));
                }
            }
        }

        let verb = if options.dry_run { "would be migrated" } else { "migrated" };
        let message = format!(
            "{} succeeded, {} failed, {} skipped, {} row(s) {}",
            summary.succeeded, summary.failed, summary.skipped, summary.rows_migrated, verb
        );
        let entry = if summary.is_success() {
            LogEntry::success(None, "summary", message)
        } else {
            LogEntry::failed(None, "summary", message)
        };
        log.log(entry.with_context(json!({
            "succeeded": summary.succeeded,
            "failed": summary.failed,
            "skipped": summary.skipped,
            "rows": summary.rows_migrated,
        })));
        Ok(summary)
    }

    async fn check_prerequisites<D: Database>(
        &self,
        db: &mut D,
        log: &mut MigrationLog,
    ) -> Result<(), MigrationError> {
        if self.settings.tables.is_empty() {
            return Err(MigrationError::Prerequisite(
                "no tenant-scoped tables are declared".to_string(),
            ));
        }

        let version = db
            .server_version()
            .await
            .map_err(|e| unmet("cannot reach the database", e))?;
        let namespaces = db
            .supports_namespaces()
            .await
            .map_err(|e| unmet("cannot inspect the database", e))?;
        if !namespaces {
            return Err(MigrationError::Prerequisite(format!(
                "{version} does not support schemas"
            )));
        }

        let directory = &self.settings.tenants;
        let exists = db
            .table_exists(&directory.table)
            .await
            .map_err(|e| unmet("cannot inspect the tenant table", e))?;
        if !exists {
            return Err(MigrationError::Prerequisite(format!(
                "tenant table {} does not exist",
                directory.table
            )));
        }
        let columns = db
            .columns(&directory.table)
            .await
            .map_err(|e| unmet("cannot inspect the tenant table", e))?;
        for required in [
            &directory.id_column,
            &directory.status_column,
            &directory.namespace_column,
        ] {
            if !columns.contains(required) {
                return Err(MigrationError::Prerequisite(format!(
                    "tenant table {} has no column {}",
                    directory.table, required
                )));
            }
        }

        self.provisioner
            .probe_ddl(db)
            .await
            .map_err(|e| unmet("cannot create schemas", e))?;

        let tables: Vec<&str> = self.settings.tables.iter().map(|t| t.table.as_str()).collect();
        log.log(
            LogEntry::success(
                None,
                "prerequisites",
                format!("{} table(s) declared, server {}", tables.len(), version),
            )
            .with_context(json!({ "server_version": version, "tables": tables })),
        );
        Ok(())
    }

    /// Selected tenants plus requested ids that do not exist.
    async fn select_tenants<S: TenantDirectory>(
        &self,
        db: &mut S,
        options: &RunOptions,
        log: &mut MigrationLog,
    ) -> Result<(Vec<Tenant>, Vec<TenantId>), MigrationError> {
        let filter = if options.tenants.is_empty() {
            TenantFilter::Unmigrated
        } else {
            TenantFilter::Ids(options.tenants.clone())
        };
        let selected = db
            .list_tenants(&filter)
            .await
            .map_err(|e| unmet("cannot read the tenant table", e))?;

        let mut unknown: Vec<TenantId> = options
            .tenants
            .iter()
            .filter(|id| !selected.iter().any(|t| t.id == **id))
            .copied()
            .collect();
        unknown.sort();
        unknown.dedup();
        for id in &unknown {
            log.log(LogEntry::skipped(Some(*id), "select_tenants", "tenant not found"));
        }

        let everyone = db
            .list_tenants(&TenantFilter::All)
            .await
            .map_err(|e| unmet("cannot read the tenant table", e))?;
        check_collisions(&selected, &everyone)?;

        log.log(LogEntry::success(
            None,
            "select_tenants",
            format!("{} tenant(s) selected", selected.len()),
        ));
        Ok((selected, unknown))
    }

    async fn create_backup(
        &mut self,
        options: &RunOptions,
        log: &mut MigrationLog,
    ) -> Result<Option<PathBuf>, MigrationError> {
        if options.dry_run {
            log.log(LogEntry::skipped(None, "backup", "dry run, no backup taken"));
            return Ok(None);
        }
        if options.skip_backup {
            warn!("pre-migration backup skipped by operator");
            log.log(LogEntry::skipped(None, "backup", "skipped by operator"));
            return Ok(None);
        }

        match self.backup.create_backup("pre-tenant-migration").await {
            Ok(path) => {
                log.log(
                    LogEntry::success(None, "backup", format!("written to {}", path.display()))
                        .with_context(json!({ "path": path.display().to_string() })),
                );
                Ok(Some(path))
            }
            Err(e) if options.require_backup => {
                log.log(LogEntry::failed(None, "backup", e.to_string()));
                Err(e)
            }
            Err(e) => {
                log.log(LogEntry::failed(
                    None,
                    "backup",
                    format!("{e}; continuing without a backup"),
                ));
                Ok(None)
            }
        }
    }

    /// One tenant. `Err` only for fatal errors.
    async fn migrate_tenant<S>(
        &mut self,
        db: &mut S,
        tenant: Tenant,
        options: &RunOptions,
        log: &mut MigrationLog,
    ) -> Result<TenantOutcome, MigrationError>
    where
        S: Database + TenantDirectory,
    {
        let mut outcome = TenantOutcome::new(tenant.id);
        if tenant.status == MigrationStatus::Migrated {
            log.log(LogEntry::skipped(Some(tenant.id), "tenant", "already migrated"));
            outcome.phase = TenantPhase::Skipped;
            outcome.namespace = tenant.namespace.clone();
            return Ok(outcome);
        }

        let namespace = NamespaceName::resolve(&tenant)?;
        outcome.namespace = Some(namespace.to_string());

        let result = if options.dry_run {
            self.simulate_tenant(db, &tenant, &namespace, options, log, &mut outcome)
                .await
        } else {
            match self.check_existing(db, &tenant, &namespace, options, log).await {
                Ok(()) => {
                    self.migrate_in_transaction(db, &tenant, &namespace, options, log, &mut outcome)
                        .await
                }
                Err(e) => Err(e),
            }
        };

        match result {
            Ok(()) => {
                outcome.phase = TenantPhase::Completed;
                let verb = if options.dry_run { "would migrate" } else { "migrated" };
                log.log(LogEntry::success(
                    Some(tenant.id),
                    "tenant",
                    format!("{verb} {} row(s) into {namespace}", outcome.rows),
                ));
            }
            Err(e) if e.kind() == ErrorKind::Fatal => return Err(e),
            Err(e) => {
                log.log(
                    LogEntry::failed(Some(tenant.id), "tenant", e.to_string())
                        .with_context(json!({ "error": e.name(), "phase": outcome.phase })),
                );
                outcome.fail(&e);
            }
        }
        Ok(outcome)
    }

    /// Existing schema for a tenant that is not migrated yet.
    async fn check_existing<D: Database>(
        &mut self,
        db: &mut D,
        tenant: &Tenant,
        namespace: &NamespaceName,
        options: &RunOptions,
        log: &mut MigrationLog,
    ) -> Result<(), MigrationError> {
        if !db.namespace_exists(namespace.ident()).await? {
            return Ok(());
        }
        let conflict = MigrationError::SchemaConflict {
            tenant: tenant.id,
            namespace: namespace.to_string(),
        };

        if options.allow_existing_namespace {
            log.log(LogEntry::success(
                Some(tenant.id),
                "schema_conflict",
                format!("reusing existing schema {namespace}"),
            ));
            return Ok(());
        }
        if options.force {
            return Err(conflict);
        }

        let question = format!(
            "Schema {namespace} already exists but tenant {} is not migrated. Reuse it?",
            tenant.id
        );
        if self.confirm.confirm(&question) {
            log.log(LogEntry::success(
                Some(tenant.id),
                "schema_conflict",
                format!("reusing existing schema {namespace} (confirmed)"),
            ));
            Ok(())
        } else {
            Err(conflict)
        }
    }

    async fn migrate_in_transaction<S>(
        &self,
        db: &mut S,
        tenant: &Tenant,
        namespace: &NamespaceName,
        options: &RunOptions,
        log: &mut MigrationLog,
        outcome: &mut TenantOutcome,
    ) -> Result<(), MigrationError>
    where
        S: Database + TenantDirectory,
    {
        db.begin().await?;
        match self
            .migrate_steps(db, tenant, namespace, options, log, outcome)
            .await
        {
            Ok(()) => {
                db.commit().await?;
                Ok(())
            }
            Err(e) => {
                match db.rollback().await {
                    Ok(()) => log.log(LogEntry::success(
                        Some(tenant.id),
                        "rollback_transaction",
                        "all changes for this tenant were rolled back",
                    )),
                    Err(rollback) => {
                        error!(tenant = tenant.id.0, error = %rollback, "transaction rollback failed");
                        log.log(LogEntry::failed(
                            Some(tenant.id),
                            "rollback_transaction",
                            rollback.to_string(),
                        ));
                    }
                }
                Err(e)
            }
        }
    }

    async fn migrate_steps<S>(
        &self,
        db: &mut S,
        tenant: &Tenant,
        namespace: &NamespaceName,
        options: &RunOptions,
        log: &mut MigrationLog,
        outcome: &mut TenantOutcome,
    ) -> Result<(), MigrationError>
    where
        S: Database + TenantDirectory,
    {
        let id = Some(tenant.id);
        let shared = &self.settings.shared_schema;
        let mut record = tenant.clone();
        record.status = MigrationStatus::Migrating;
        db.update_tenant(&record).await?;

        outcome.phase = TenantPhase::Provisioning;
        self.provisioner.ensure_namespace(db, namespace).await?;
        if self.settings.clone_structure {
            for spec in &self.settings.tables {
                let source = QualifiedTable::new(shared, &spec.table);
                let dest = QualifiedTable::new(namespace.ident(), &spec.table);
                self.provisioner
                    .prepare_table(db, &source, &dest, Some(&spec.discriminator))
                    .await?;
            }
        }
        log.log(LogEntry::success(
            id,
            "provision_schema",
            format!("schema {namespace} ready"),
        ));

        outcome.phase = TenantPhase::CopyingTables;
        let migrator = TableMigrator::new(options.batch_size);
        for spec in &self.settings.tables {
            let copy = migrator
                .migrate_table(db, tenant.id, spec, shared, namespace, false)
                .await?;
            let line = TableOutcome::from_copy(spec.table.as_str(), copy, "migrated");
            log.log(
                LogEntry::new(id, "copy_table", line.status, line.message.clone())
                    .with_context(json!({ "table": line.table, "rows": line.rows })),
            );
            outcome.rows += line.rows;
            outcome.tables.push(line);
        }

        if options.verify || options.checksum {
            outcome.phase = TenantPhase::Verifying;
            self.verify_tables(db, tenant.id, namespace, options.checksum, log)
                .await?;
        } else {
            log.log(LogEntry::skipped(id, "verify_table", "verification not requested"));
        }

        record.status = MigrationStatus::Migrated;
        record.namespace = Some(namespace.to_string());
        db.update_tenant(&record).await?;
        log.log(LogEntry::success(id, "update_tenant", "status set to migrated"));
        Ok(())
    }

    async fn verify_tables<D: Database>(
        &self,
        db: &mut D,
        tenant: TenantId,
        namespace: &NamespaceName,
        checksum: bool,
        log: &mut MigrationLog,
    ) -> Result<(), MigrationError> {
        let verifier = IntegrityVerifier::new(checksum);
        for spec in &self.settings.tables {
            let check = verifier
                .verify(db, tenant, spec, &self.settings.shared_schema, namespace)
                .await?;
            log.log(
                LogEntry::success(
                    Some(tenant),
                    "verify_table",
                    format!("{}: {} row(s) match", check.table, check.dest_count),
                )
                .with_context(json!({
                    "table": check.table,
                    "source_count": check.source_count,
                    "dest_count": check.dest_count,
                    "checksum": check.checksum,
                })),
            );
        }
        Ok(())
    }

    /// Dry run: report what a real run would do without writing anything.
    async fn simulate_tenant<D: Database>(
        &self,
        db: &mut D,
        tenant: &Tenant,
        namespace: &NamespaceName,
        options: &RunOptions,
        log: &mut MigrationLog,
        outcome: &mut TenantOutcome,
    ) -> Result<(), MigrationError> {
        let id = Some(tenant.id);
        if db.namespace_exists(namespace.ident()).await? {
            // same policy as check_existing, without prompting
            if options.allow_existing_namespace {
                log.log(LogEntry::skipped(
                    id,
                    "schema_conflict",
                    format!("schema {namespace} already exists and would be reused"),
                ));
            } else if options.force {
                return Err(MigrationError::SchemaConflict {
                    tenant: tenant.id,
                    namespace: namespace.to_string(),
                });
            } else {
                log.log(LogEntry::failed(
                    id,
                    "schema_conflict",
                    format!(
                        "schema {namespace} already exists; a real run asks before reusing it"
                    ),
                ));
            }
        } else {
            log.log(LogEntry::skipped(
                id,
                "provision_schema",
                format!("would create schema {namespace}"),
            ));
        }

        outcome.phase = TenantPhase::CopyingTables;
        let migrator = TableMigrator::new(options.batch_size);
        for spec in &self.settings.tables {
            let copy = migrator
                .migrate_table(db, tenant.id, spec, &self.settings.shared_schema, namespace, true)
                .await?;
            let line = TableOutcome::from_copy(spec.table.as_str(), copy, "would migrate");
            log.log(
                LogEntry::new(id, "copy_table", line.status, line.message.clone())
                    .with_context(json!({ "table": line.table, "rows": line.rows, "dry_run": true })),
            );
            outcome.rows += line.rows;
            outcome.tables.push(line);
        }
        Ok(())
    }
}

fn unmet(what: &str, source: DbError) -> MigrationError {
    MigrationError::Prerequisite(format!("{what}: {source}"))
}

/// Fail when a selected, not yet migrated tenant would land in a schema
/// name that another tenant derives or already owns.
fn check_collisions(selected: &[Tenant], everyone: &[Tenant]) -> Result<(), MigrationError> {
    let mut owners: BTreeMap<String, Vec<TenantId>> = BTreeMap::new();
    for tenant in everyone {
        if let Ok(namespace) = NamespaceName::resolve(tenant) {
            owners.entry(namespace.to_string()).or_default().push(tenant.id);
        }
    }

    for tenant in selected.iter().filter(|t| t.status != MigrationStatus::Migrated) {
        let namespace = NamespaceName::resolve(tenant)?;
        if let Some(tenants) = owners.get(namespace.as_str()) {
            if tenants.len() > 1 {
                return Err(MigrationError::NamespaceCollision {
                    namespace: namespace.to_string(),
                    tenants: tenants.clone(),
                });
            }
        }
    }
    Ok(())
}
