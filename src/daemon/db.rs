//! Daemon job/repo store on SQLite.
//!
//! One connection, serialized behind a mutex. Queries are short and the
//! daemon is the only writer, so a pool would buy nothing here. Artifact and
//! kernel descriptors are stored as JSON blobs in their job row; the schema
//! only indexes what the daemon filters on.

use std::path::Path;
use std::sync::{Arc, Mutex};

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

use crate::artifact::Artifact;
use crate::kernel::KernelInfo;

// ---------------------------------------------------------------------------
// Job model
// ---------------------------------------------------------------------------

/// Lifecycle of one queued job. Transitions are forward-only:
/// NEW → WAITING → RUNNING → {SUCCESS, FAILURE}.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    New,
    Waiting,
    Running,
    Success,
    Failure,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::New => "new",
            JobStatus::Waiting => "waiting",
            JobStatus::Running => "running",
            JobStatus::Success => "success",
            JobStatus::Failure => "failure",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "new" => Ok(JobStatus::New),
            "waiting" => Ok(JobStatus::Waiting),
            "running" => Ok(JobStatus::Running),
            "success" => Ok(JobStatus::Success),
            "failure" => Ok(JobStatus::Failure),
            other => bail!("unknown job status {other:?}"),
        }
    }

    /// True when a job is done and will never change again.
    pub fn terminal(&self) -> bool {
        matches!(self, JobStatus::Success | JobStatus::Failure)
    }

    fn rank(&self) -> u8 {
        match self {
            JobStatus::New => 0,
            JobStatus::Waiting => 1,
            JobStatus::Running => 2,
            JobStatus::Success | JobStatus::Failure => 3,
        }
    }

    /// Forward-only ordering; terminal states accept nothing.
    pub fn can_advance_to(&self, next: JobStatus) -> bool {
        !self.terminal() && next.rank() == self.rank() + 1
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: i64,
    pub uuid: String,
    /// Ties together the jobs of one matrix submission.
    pub group_uuid: String,
    pub repo: String,
    pub commit: String,
    pub artifact: Artifact,
    pub kernel: KernelInfo,
    pub status: JobStatus,
    pub created: DateTime<Utc>,
    pub started: Option<DateTime<Utc>>,
    pub finished: Option<DateTime<Utc>>,
}

/// Filters for job listing; empty fields match everything.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobFilter {
    pub group_uuid: Option<String>,
    pub repo: Option<String>,
    pub commit: Option<String>,
    pub status: Option<JobStatus>,
    /// Only jobs created/updated within the last N hours.
    pub updated_hours: Option<u32>,
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct Db {
    conn: Arc<Mutex<Connection>>,
}

impl Db {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("open job database {}", path.display()))?;
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.ensure_schema()?;
        Ok(db)
    }

    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.ensure_schema()?;
        Ok(db)
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow::anyhow!("job database mutex poisoned"))
    }

    fn ensure_schema(&self) -> Result<()> {
        let conn = self.lock()?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS jobs (
                 id         INTEGER PRIMARY KEY AUTOINCREMENT,
                 uuid       TEXT NOT NULL UNIQUE,
                 group_uuid TEXT NOT NULL,
                 repo       TEXT NOT NULL,
                 commit_id  TEXT NOT NULL,
                 artifact   TEXT NOT NULL,
                 kernel     TEXT NOT NULL,
                 status     TEXT NOT NULL,
                 created    TEXT NOT NULL,
                 started    TEXT,
                 finished   TEXT
             );
             CREATE INDEX IF NOT EXISTS jobs_status ON jobs(status);
             CREATE INDEX IF NOT EXISTS jobs_group ON jobs(group_uuid);
             CREATE TABLE IF NOT EXISTS repos (
                 id   INTEGER PRIMARY KEY AUTOINCREMENT,
                 name TEXT NOT NULL UNIQUE,
                 path TEXT NOT NULL
             );",
        )
        .context("create daemon schema")?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Jobs
    // -----------------------------------------------------------------------

    /// Insert a NEW job; returns it with the assigned row id.
    pub fn add_job(&self, mut job: Job) -> Result<Job> {
        let artifact = serde_json::to_string(&job.artifact)?;
        let kernel = serde_json::to_string(&job.kernel)?;
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO jobs (uuid, group_uuid, repo, commit_id, artifact, kernel,
                               status, created, started, finished)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, NULL, NULL)",
            params![
                job.uuid,
                job.group_uuid,
                job.repo,
                job.commit,
                artifact,
                kernel,
                job.status.as_str(),
                job.created.to_rfc3339(),
            ],
        )
        .context("insert job")?;
        job.id = conn.last_insert_rowid();
        Ok(job)
    }

    /// Advance a job's status, enforcing the forward-only state machine.
    pub fn set_job_status(&self, uuid: &str, next: JobStatus) -> Result<()> {
        let job = self
            .job_by_uuid(uuid)?
            .with_context(|| format!("no job with uuid {uuid}"))?;
        if !job.status.can_advance_to(next) {
            bail!(
                "illegal job transition {} -> {} for {uuid}",
                job.status.as_str(),
                next.as_str()
            );
        }

        let now = Utc::now().to_rfc3339();
        let conn = self.lock()?;
        match next {
            JobStatus::Running => conn.execute(
                "UPDATE jobs SET status = ?1, started = ?2 WHERE uuid = ?3",
                params![next.as_str(), now, uuid],
            )?,
            s if s.terminal() => conn.execute(
                "UPDATE jobs SET status = ?1, finished = ?2 WHERE uuid = ?3",
                params![next.as_str(), now, uuid],
            )?,
            _ => conn.execute(
                "UPDATE jobs SET status = ?1 WHERE uuid = ?2",
                params![next.as_str(), uuid],
            )?,
        };
        Ok(())
    }

    /// Requeue jobs stuck in RUNNING from a previous daemon life. Bypasses
    /// the forward-only check deliberately; only meaningful at startup,
    /// before any worker has started.
    pub fn requeue_stale_running(&self) -> Result<usize> {
        let conn = self.lock()?;
        let n = conn.execute(
            "UPDATE jobs SET status = 'waiting', started = NULL WHERE status = 'running'",
            [],
        )?;
        Ok(n)
    }

    pub fn job_by_uuid(&self, uuid: &str) -> Result<Option<Job>> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT id, uuid, group_uuid, repo, commit_id, artifact, kernel,
                    status, created, started, finished
             FROM jobs WHERE uuid = ?1",
            params![uuid],
            row_to_job,
        )
        .optional()
        .context("query job by uuid")
    }

    pub fn jobs(&self, filter: &JobFilter) -> Result<Vec<Job>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT id, uuid, group_uuid, repo, commit_id, artifact, kernel,
                    status, created, started, finished
             FROM jobs ORDER BY id",
        )?;
        let rows = stmt.query_map([], row_to_job)?;

        let cutoff = filter
            .updated_hours
            .map(|hours| Utc::now() - chrono::Duration::hours(hours as i64));

        let mut jobs = Vec::new();
        for row in rows {
            let job = row?;
            if let Some(group) = &filter.group_uuid {
                if &job.group_uuid != group {
                    continue;
                }
            }
            if let Some(repo) = &filter.repo {
                if &job.repo != repo {
                    continue;
                }
            }
            if let Some(commit) = &filter.commit {
                if &job.commit != commit {
                    continue;
                }
            }
            if let Some(status) = filter.status {
                if job.status != status {
                    continue;
                }
            }
            if let Some(cutoff) = cutoff {
                let updated = job.finished.or(job.started).unwrap_or(job.created);
                if updated < cutoff {
                    continue;
                }
            }
            jobs.push(job);
        }
        Ok(jobs)
    }

    // -----------------------------------------------------------------------
    // Repos
    // -----------------------------------------------------------------------

    pub fn add_repo(&self, name: &str, path: &str) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO repos (name, path) VALUES (?1, ?2)",
            params![name, path],
        )
        .with_context(|| format!("insert repo {name}"))?;
        Ok(())
    }

    pub fn repo_exists(&self, name: &str) -> Result<bool> {
        let conn = self.lock()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM repos WHERE name = ?1",
            params![name],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    pub fn repos(&self) -> Result<Vec<String>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare("SELECT name FROM repos ORDER BY name")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut names = Vec::new();
        for row in rows {
            names.push(row?);
        }
        Ok(names)
    }
}

fn row_to_job(row: &rusqlite::Row<'_>) -> rusqlite::Result<Job> {
    let artifact_json: String = row.get(5)?;
    let kernel_json: String = row.get(6)?;
    let status_str: String = row.get(7)?;
    let created_str: String = row.get(8)?;
    let started_str: Option<String> = row.get(9)?;
    let finished_str: Option<String> = row.get(10)?;

    Ok(Job {
        id: row.get(0)?,
        uuid: row.get(1)?,
        group_uuid: row.get(2)?,
        repo: row.get(3)?,
        commit: row.get(4)?,
        artifact: serde_json::from_str(&artifact_json).map_err(json_err)?,
        kernel: serde_json::from_str(&kernel_json).map_err(json_err)?,
        status: JobStatus::parse(&status_str).map_err(any_err)?,
        created: parse_time(&created_str)?,
        started: started_str.as_deref().map(parse_time).transpose()?,
        finished: finished_str.as_deref().map(parse_time).transpose()?,
    })
}

fn parse_time(s: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))
}

fn json_err(e: serde_json::Error) -> rusqlite::Error {
    rusqlite::Error::ToSqlConversionFailure(Box::new(e))
}

fn any_err(e: anyhow::Error) -> rusqlite::Error {
    rusqlite::Error::ToSqlConversionFailure(e.into())
}
