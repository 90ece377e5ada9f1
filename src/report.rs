//! Migration log and report artifact.
//!
//! One [`MigrationLog`] per run. Entries are append-only; [`MigrationLog::flush`]
//! writes the run metadata and the full ordered entry list as JSON to
//! `<logs_dir>/<kind>-<run_id>.json`.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use colored::*;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};

use crate::error::MigrationError;
use crate::tenant::TenantId;

/// Outcome of one logged step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogStatus {
    Success,
    Failed,
    Skipped,
}

/// One meaningful step of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    /// `None` for run-level events.
    pub tenant_id: Option<TenantId>,
    pub step: String,
    pub status: LogStatus,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<Value>,
}

impl LogEntry {
    pub fn new(
        tenant_id: Option<TenantId>,
        step: &str,
        status: LogStatus,
        message: impl Into<String>,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            tenant_id,
            step: step.to_string(),
            status,
            message: message.into(),
            context: None,
        }
    }

    pub fn success(tenant_id: Option<TenantId>, step: &str, message: impl Into<String>) -> Self {
        Self::new(tenant_id, step, LogStatus::Success, message)
    }

    pub fn failed(tenant_id: Option<TenantId>, step: &str, message: impl Into<String>) -> Self {
        Self::new(tenant_id, step, LogStatus::Failed, message)
    }

    pub fn skipped(tenant_id: Option<TenantId>, step: &str, message: impl Into<String>) -> Self {
        Self::new(tenant_id, step, LogStatus::Skipped, message)
    }

    /// Attach structured context.
    pub fn with_context(mut self, context: Value) -> Self {
        self.context = Some(context);
        self
    }
}

/// What kind of run produced the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunKind {
    Migration,
    Rollback,
}

impl RunKind {
    fn file_prefix(self) -> &'static str {
        match self {
            RunKind::Migration => "tenant-migration",
            RunKind::Rollback => "tenant-rollback",
        }
    }
}

/// The serialized artifact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Report {
    pub run_id: String,
    pub kind: RunKind,
    pub options: Value,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub entries: Vec<LogEntry>,
}

/// Append-only log of one run.
#[derive(Debug)]
pub struct MigrationLog {
    report: Report,
    echo: bool,
}

impl MigrationLog {
    /// Start a log; the run id is derived from the start time.
    pub fn new(kind: RunKind, options: &impl Serialize) -> Self {
        let started_at = Utc::now();
        Self {
            report: Report {
                run_id: started_at.format("%Y%m%d_%H%M%S_%3f").to_string(),
                kind,
                options: serde_json::to_value(options).unwrap_or(Value::Null),
                started_at,
                finished_at: None,
                entries: Vec::new(),
            },
            echo: false,
        }
    }

    /// Also print each entry as a progress line on stdout.
    pub fn echo(mut self, on: bool) -> Self {
        self.echo = on;
        self
    }

    pub fn run_id(&self) -> &str {
        &self.report.run_id
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.report.started_at
    }

    pub fn entries(&self) -> &[LogEntry] {
        &self.report.entries
    }

    /// Append an entry.
    pub fn log(&mut self, entry: LogEntry) {
        let tenant = entry.tenant_id.map(|t| t.0);
        match entry.status {
            LogStatus::Failed => warn!(tenant, step = %entry.step, "{}", entry.message),
            LogStatus::Success | LogStatus::Skipped => {
                info!(tenant, step = %entry.step, status = ?entry.status, "{}", entry.message)
            }
        }

        if self.echo {
            let marker = match entry.status {
                LogStatus::Success => "✓".green(),
                LogStatus::Failed => "✗".red(),
                LogStatus::Skipped => "○".dimmed(),
            };
            let scope = entry
                .tenant_id
                .map_or_else(|| "run".to_string(), |t| format!("tenant {t}"));
            println!(
                "  {} {} {} {}",
                marker,
                format!("[{scope}]").cyan(),
                entry.step.yellow(),
                entry.message
            );
        }

        self.report.entries.push(entry);
    }

    /// Write the artifact and return its path.
    pub fn flush(&mut self, dir: &Path) -> Result<PathBuf, MigrationError> {
        self.report.finished_at = Some(Utc::now());
        let path = dir.join(format!(
            "{}-{}.json",
            self.report.kind.file_prefix(),
            self.report.run_id
        ));
        let io_err = |source| MigrationError::Report {
            path: path.clone(),
            source,
        };

        fs::create_dir_all(dir).map_err(io_err)?;
        let json = serde_json::to_string_pretty(&self.report)
            .map_err(|e| io_err(std::io::Error::other(e)))?;
        fs::write(&path, json).map_err(io_err)?;
        Ok(path)
    }
}
