//! Pre-migration backup collaborator.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::process::Command;
use tracing::info;

use crate::error::MigrationError;

/// Creates a restorable copy of the database before any change is made.
#[async_trait]
pub trait BackupService: Send {
    /// Create a backup tagged with `tag`; returns where it was written.
    async fn create_backup(&mut self, tag: &str) -> Result<PathBuf, MigrationError>;
}

/// Backup via `pg_dump --format=custom`.
pub struct PgDumpBackup {
    database_url: String,
    dir: PathBuf,
    program: PathBuf,
}

impl PgDumpBackup {
    pub fn new(database_url: &str, dir: &Path) -> Self {
        Self {
            database_url: database_url.to_string(),
            dir: dir.to_path_buf(),
            program: PathBuf::from("pg_dump"),
        }
    }

    /// Use a specific `pg_dump` binary.
    pub fn program(mut self, program: impl Into<PathBuf>) -> Self {
        self.program = program.into();
        self
    }

    fn target(&self, tag: &str) -> PathBuf {
        let stamp = chrono::Utc::now().format("%Y%m%d_%H%M%S");
        let tag: String = tag
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
            .collect();
        self.dir.join(format!("{tag}_{stamp}.dump"))
    }
}

#[async_trait]
impl BackupService for PgDumpBackup {
    async fn create_backup(&mut self, tag: &str) -> Result<PathBuf, MigrationError> {
        tokio::fs::create_dir_all(&self.dir).await.map_err(|e| {
            MigrationError::Backup(format!("cannot create {}: {}", self.dir.display(), e))
        })?;

        let path = self.target(tag);
        info!(path = %path.display(), "running pg_dump");

        let output = Command::new(&self.program)
            .arg("--format=custom")
            .arg("--file")
            .arg(&path)
            .arg(&self.database_url)
            .output()
            .await
            .map_err(|e| {
                MigrationError::Backup(format!("failed to run {}: {}", self.program.display(), e))
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(MigrationError::Backup(format!(
                "{} exited with {}: {}",
                self.program.display(),
                output.status,
                stderr.trim()
            )));
        }
        Ok(path)
    }
}
