use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use tracing::warn;
use uuid::Uuid;

use crate::job::{Job, JobSpec, JobStatus, Progress};

#[derive(Debug)]
struct PersistedJobRow {
    id: String,
    status: JobStatus,
    spec_json: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    progress_json: Option<String>,
    error: Option<String>,
    output_path: Option<String>,
}

/// SQLite-backed job history. Each queue mutation is written through so a
/// restart can list past runs; queued and running jobs found at startup
/// are marked cancelled because their in-memory state is gone.
#[derive(Debug, Clone)]
pub struct JobsPersistence {
    db_path: PathBuf,
}

impl JobsPersistence {
    pub fn new(data_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(data_dir).with_context(|| {
            format!(
                "failed to create data directory for jobs db: {}",
                data_dir.display()
            )
        })?;

        let persistence = Self {
            db_path: data_dir.join("jobs.db"),
        };
        persistence.initialize_schema()?;
        Ok(persistence)
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    pub fn upsert_job(&self, job: &Job) -> Result<()> {
        let row = Self::row_from_job(job)?;
        self.with_connection(|conn| upsert_row(conn, &row))
    }

    pub fn delete_job(&self, job_id: Uuid) -> Result<usize> {
        self.with_connection(|conn| {
            let deleted = conn
                .execute(
                    "DELETE FROM jobs WHERE id = ?1",
                    params![job_id.to_string()],
                )
                .with_context(|| format!("failed to delete persisted job {job_id}"))?;
            Ok(deleted)
        })
    }

    /// Load all persisted jobs, reconciling interrupted ones to
    /// `cancelled`. Rows that no longer parse are skipped with a warning
    /// rather than failing startup.
    pub fn load_jobs_for_startup(&self) -> Result<Vec<Job>> {
        self.with_connection(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, status, spec_json, created_at, updated_at,
                        progress_json, error, output_path
                 FROM jobs
                 ORDER BY created_at ASC, id ASC",
            )?;

            let raw_rows = stmt.query_map([], |row| {
                let status_raw: String = row.get(1)?;
                let status = parse_status(&status_raw).ok_or_else(|| {
                    invalid_column(1, format!("unknown persisted status: {status_raw}"))
                })?;

                Ok(PersistedJobRow {
                    id: row.get(0)?,
                    status,
                    spec_json: row.get(2)?,
                    created_at: parse_timestamp(row.get::<_, String>(3)?.as_str())
                        .map_err(|e| invalid_column(3, e.to_string()))?,
                    updated_at: parse_timestamp(row.get::<_, String>(4)?.as_str())
                        .map_err(|e| invalid_column(4, e.to_string()))?,
                    progress_json: row.get(5)?,
                    error: row.get(6)?,
                    output_path: row.get(7)?,
                })
            })?;

            let startup_now = Utc::now();
            let mut jobs = Vec::new();

            for row_result in raw_rows {
                let mut row = match row_result {
                    Ok(row) => row,
                    Err(err) => {
                        warn!(error = %err, "Skipping invalid persisted job row");
                        continue;
                    }
                };

                if matches!(row.status, JobStatus::Queued | JobStatus::Running) {
                    let previous_status = row.status;
                    row.status = JobStatus::Cancelled;
                    row.updated_at = startup_now;
                    row.error = Some(startup_reconciliation_error(
                        previous_status,
                        row.error.as_deref(),
                    ));

                    upsert_row(conn, &row).with_context(|| {
                        format!("failed to reconcile startup status for job {}", row.id)
                    })?;
                }

                let id = match Uuid::parse_str(&row.id) {
                    Ok(id) => id,
                    Err(err) => {
                        warn!(job_id = %row.id, error = %err, "Skipping persisted job with invalid id");
                        continue;
                    }
                };

                let spec: JobSpec = match serde_json::from_str(&row.spec_json) {
                    Ok(spec) => spec,
                    Err(err) => {
                        warn!(job_id = %row.id, error = %err, "Skipping persisted job with invalid settings snapshot");
                        continue;
                    }
                };

                let progress: Progress = match row.progress_json.as_deref() {
                    Some(encoded) => match serde_json::from_str(encoded) {
                        Ok(parsed) => parsed,
                        Err(err) => {
                            warn!(job_id = %row.id, error = %err, "Dropping invalid persisted progress snapshot");
                            Progress::default()
                        }
                    },
                    None => Progress::default(),
                };

                jobs.push(Job {
                    id,
                    spec,
                    status: row.status,
                    progress,
                    created_at: row.created_at,
                    updated_at: row.updated_at,
                    error: row.error,
                    output_path: row.output_path,
                });
            }

            Ok(jobs)
        })
    }

    fn initialize_schema(&self) -> Result<()> {
        self.with_connection(|conn| {
            conn.execute_batch(
                "PRAGMA journal_mode = WAL;
                 CREATE TABLE IF NOT EXISTS jobs (
                    id TEXT PRIMARY KEY,
                    status TEXT NOT NULL,
                    spec_json TEXT NOT NULL,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL,
                    progress_json TEXT,
                    error TEXT,
                    output_path TEXT
                 );
                 CREATE INDEX IF NOT EXISTS idx_jobs_created_at ON jobs(created_at DESC);
                 CREATE INDEX IF NOT EXISTS idx_jobs_status ON jobs(status);",
            )
            .with_context(|| {
                format!(
                    "failed to initialize jobs persistence schema: {}",
                    self.db_path.display()
                )
            })?;
            Ok(())
        })
    }

    fn with_connection<T>(&self, op: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let conn = Connection::open(&self.db_path)
            .with_context(|| format!("failed to open jobs db: {}", self.db_path.display()))?;
        conn.busy_timeout(std::time::Duration::from_secs(5))
            .context("failed to set jobs db busy timeout")?;
        op(&conn)
    }

    fn row_from_job(job: &Job) -> Result<PersistedJobRow> {
        Ok(PersistedJobRow {
            id: job.id.to_string(),
            status: job.status,
            spec_json: serde_json::to_string(&job.spec)
                .context("failed to serialize settings snapshot")?,
            created_at: job.created_at,
            updated_at: job.updated_at,
            progress_json: Some(
                serde_json::to_string(&job.progress)
                    .context("failed to serialize progress snapshot")?,
            ),
            error: job.error.clone(),
            output_path: job.output_path.clone(),
        })
    }
}

fn upsert_row(conn: &Connection, row: &PersistedJobRow) -> Result<()> {
    conn.execute(
        "INSERT INTO jobs (
            id, status, spec_json, created_at, updated_at,
            progress_json, error, output_path
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
         ON CONFLICT(id) DO UPDATE SET
            status = excluded.status,
            spec_json = excluded.spec_json,
            created_at = excluded.created_at,
            updated_at = excluded.updated_at,
            progress_json = excluded.progress_json,
            error = excluded.error,
            output_path = excluded.output_path",
        params![
            row.id,
            row.status.as_str(),
            row.spec_json,
            row.created_at.to_rfc3339(),
            row.updated_at.to_rfc3339(),
            row.progress_json,
            row.error,
            row.output_path,
        ],
    )
    .with_context(|| format!("failed to upsert persisted job {}", row.id))?;

    Ok(())
}

fn invalid_column(index: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        index,
        rusqlite::types::Type::Text,
        Box::new(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            message,
        )),
    )
}

fn parse_timestamp(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .with_context(|| format!("invalid RFC3339 timestamp: {value}"))
        .map(|ts| ts.with_timezone(&Utc))
}

fn parse_status(value: &str) -> Option<JobStatus> {
    match value {
        "queued" => Some(JobStatus::Queued),
        "running" => Some(JobStatus::Running),
        "completed" => Some(JobStatus::Completed),
        "failed" => Some(JobStatus::Failed),
        "cancelled" => Some(JobStatus::Cancelled),
        _ => None,
    }
}

fn startup_reconciliation_error(
    previous_status: JobStatus,
    existing_error: Option<&str>,
) -> String {
    let base = format!(
        "job restored from persisted '{status}' state at startup and transitioned to 'cancelled' for retry safety",
        status = previous_status.as_str()
    );

    match existing_error {
        Some(existing) if !existing.trim().is_empty() => {
            format!("{base}; previous_error={existing}")
        }
        _ => base,
    }
}
