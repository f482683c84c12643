use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use std::sync::Mutex;

use crate::types::{ChangeRequest, ChangeRequestId, Comment, PipelineStatus, Run, Step, SubJob};

const SCHEMA_SQL: &str = include_str!("../../../schema.sql");

/// Relational event log. Every write is a single idempotent upsert keyed by
/// the entity's natural key, so concurrent pollers for different change
/// requests never contend.
pub struct Db {
    conn: Mutex<Connection>,
}

// ── Auxiliary types ───────────────────────────────────────────────────────

/// A failed sub-job joined with its run, for the `errors` command.
#[derive(Debug, Clone, Serialize)]
pub struct FailedJobRow {
    pub run_name: String,
    pub run_url: String,
    pub run_attempt: i64,
    pub job_name: String,
    pub job_url: String,
    pub error_message: Option<String>,
    pub failed_steps: Vec<Step>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ActivityRow {
    pub kind: String,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

// ── Timestamp helpers ─────────────────────────────────────────────────────

fn parse_ts(s: &str) -> DateTime<Utc> {
    NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
        .map(|ndt| ndt.and_utc())
        .unwrap_or_else(|_| Utc::now())
}

// ── Row mappers ───────────────────────────────────────────────────────────

fn row_to_failed_job(row: &rusqlite::Row<'_>) -> rusqlite::Result<FailedJobRow> {
    let steps_json: String = row.get(6)?;
    Ok(FailedJobRow {
        run_name: row.get(0)?,
        run_url: row.get(1)?,
        run_attempt: row.get(2)?,
        job_name: row.get(3)?,
        job_url: row.get(4)?,
        error_message: row.get(5)?,
        failed_steps: serde_json::from_str(&steps_json).unwrap_or_default(),
    })
}

fn row_to_activity(row: &rusqlite::Row<'_>) -> rusqlite::Result<ActivityRow> {
    let created_at: String = row.get(2)?;
    Ok(ActivityRow {
        kind: row.get(0)?,
        message: row.get(1)?,
        created_at: parse_ts(&created_at),
    })
}

// ── Db impl ───────────────────────────────────────────────────────────────

impl Db {
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open SQLite database at {path:?}"))?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON; PRAGMA busy_timeout=5000;")
            .context("failed to set PRAGMAs")?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn migrate(&mut self) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute_batch(SCHEMA_SQL)
            .context("failed to apply schema migrations")?;
        Ok(())
    }

    // ── Change requests ───────────────────────────────────────────────────

    /// Insert or refresh a change request; returns its row id.
    pub fn upsert_change_request(&self, cr: &ChangeRequest) -> Result<i64> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.query_row(
            "INSERT INTO change_requests (repo, number, title, state, merged, head_sha, head_ref, url) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8) \
             ON CONFLICT (repo, number) DO UPDATE SET \
               title = excluded.title, state = excluded.state, merged = excluded.merged, \
               head_sha = excluded.head_sha, head_ref = excluded.head_ref, url = excluded.url, \
               updated_at = datetime('now') \
             RETURNING id",
            params![
                cr.id.repo,
                cr.id.number as i64,
                cr.title,
                cr.state.as_str(),
                cr.merged,
                cr.head_sha,
                cr.head_ref,
                cr.url,
            ],
            |row| row.get(0),
        )
        .context("upsert_change_request")
    }

    pub fn change_request_row_id(&self, id: &ChangeRequestId) -> Result<Option<i64>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.query_row(
            "SELECT id FROM change_requests WHERE repo = ?1 AND number = ?2",
            params![id.repo, id.number as i64],
            |row| row.get(0),
        )
        .optional()
        .context("change_request_row_id")
    }

    // ── Comments ──────────────────────────────────────────────────────────

    /// Record a comment the first time it is seen. Returns true if it was new.
    /// Never touches the `addressed` columns.
    pub fn upsert_comment(&self, cr_row: i64, comment: &Comment) -> Result<bool> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let created_at = comment
            .created_at
            .unwrap_or_else(Utc::now)
            .format("%Y-%m-%d %H:%M:%S")
            .to_string();
        let n = conn
            .execute(
                "INSERT OR IGNORE INTO comments \
                 (provider_id, change_request_id, kind, author, body, path, created_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    comment.provider_id,
                    cr_row,
                    comment.kind.as_str(),
                    comment.author,
                    comment.body,
                    comment.path,
                    created_at,
                ],
            )
            .context("upsert_comment")?;
        Ok(n > 0)
    }

    /// Reviewer action: mark a comment handled.
    pub fn set_comment_addressed(&self, cr_row: i64, provider_id: i64, notes: Option<&str>) -> Result<bool> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let n = conn
            .execute(
                "UPDATE comments SET addressed = 1, addressed_notes = ?3 \
                 WHERE change_request_id = ?1 AND provider_id = ?2",
                params![cr_row, provider_id, notes],
            )
            .context("set_comment_addressed")?;
        Ok(n > 0)
    }

    pub fn unaddressed_comment_count(&self, cr_row: i64) -> Result<i64> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.query_row(
            "SELECT COUNT(*) FROM comments WHERE change_request_id = ?1 AND addressed = 0",
            params![cr_row],
            |row| row.get(0),
        )
        .context("unaddressed_comment_count")
    }

    // ── Runs and jobs ─────────────────────────────────────────────────────

    /// Insert or refresh a run; returns its row id.
    pub fn upsert_run(&self, cr_row: i64, run: &Run) -> Result<i64> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.query_row(
            "INSERT INTO runs \
             (provider_id, change_request_id, name, status, conclusion, head_sha, url, run_number, run_attempt) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9) \
             ON CONFLICT (provider_id, change_request_id) DO UPDATE SET \
               name = excluded.name, status = excluded.status, conclusion = excluded.conclusion, \
               head_sha = excluded.head_sha, url = excluded.url, run_number = excluded.run_number, \
               run_attempt = excluded.run_attempt, updated_at = datetime('now') \
             RETURNING id",
            params![
                run.provider_id,
                cr_row,
                run.name,
                run.status.as_str(),
                run.conclusion.map(|c| c.as_str()),
                run.head_sha,
                run.url,
                run.run_number,
                run.run_attempt,
            ],
            |row| row.get(0),
        )
        .context("upsert_run")
    }

    pub fn upsert_job(&self, run_row: i64, job: &SubJob) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let steps = serde_json::to_string(&job.failed_steps).context("serialize failed steps")?;
        conn.execute(
            "INSERT INTO jobs \
             (provider_id, run_id, name, status, conclusion, failed_steps, error_message, url) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8) \
             ON CONFLICT (provider_id, run_id) DO UPDATE SET \
               name = excluded.name, status = excluded.status, conclusion = excluded.conclusion, \
               failed_steps = excluded.failed_steps, error_message = excluded.error_message, \
               url = excluded.url, updated_at = datetime('now')",
            params![
                job.provider_id,
                run_row,
                job.name,
                job.status.as_str(),
                job.conclusion.map(|c| c.as_str()),
                steps,
                job.error_message,
                job.url,
            ],
        )
        .context("upsert_job")?;
        Ok(())
    }

    /// Failed jobs of runs on the change request's current head revision.
    pub fn failed_jobs(&self, id: &ChangeRequestId) -> Result<Vec<FailedJobRow>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let mut stmt = conn.prepare(
            "SELECT r.name, r.url, r.run_attempt, j.name, j.url, j.error_message, j.failed_steps \
             FROM jobs j \
             JOIN runs r ON r.id = j.run_id \
             JOIN change_requests c ON c.id = r.change_request_id \
             WHERE c.repo = ?1 AND c.number = ?2 \
               AND r.head_sha = c.head_sha \
               AND j.conclusion IN ('failure', 'timed_out', 'action_required', 'startup_failure') \
             ORDER BY r.name, j.name",
        )?;
        let rows = stmt
            .query_map(params![id.repo, id.number as i64], row_to_failed_job)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("failed_jobs")?;
        Ok(rows)
    }

    // ── Activity / history ────────────────────────────────────────────────

    pub fn log_activity(&self, cr_row: i64, kind: &str, message: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "INSERT INTO activity (change_request_id, kind, message) VALUES (?1, ?2, ?3)",
            params![cr_row, kind, message],
        )
        .context("log_activity")?;
        Ok(())
    }

    pub fn recent_activity(&self, id: &ChangeRequestId, limit: i64) -> Result<Vec<ActivityRow>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let mut stmt = conn.prepare(
            "SELECT a.kind, a.message, a.created_at FROM activity a \
             JOIN change_requests c ON c.id = a.change_request_id \
             WHERE c.repo = ?1 AND c.number = ?2 \
             ORDER BY a.id DESC LIMIT ?3",
        )?;
        let rows = stmt
            .query_map(params![id.repo, id.number as i64, limit], row_to_activity)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("recent_activity")?;
        Ok(rows)
    }

    pub fn record_check(
        &self,
        cr_row: i64,
        status: PipelineStatus,
        run_count: usize,
        notified: bool,
    ) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "INSERT INTO check_history (change_request_id, pipeline_status, run_count, notified) \
             VALUES (?1, ?2, ?3, ?4)",
            params![cr_row, status.as_str(), run_count as i64, notified],
        )
        .context("record_check")?;
        Ok(())
    }

    pub fn check_count(&self, cr_row: i64) -> Result<i64> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.query_row(
            "SELECT COUNT(*) FROM check_history WHERE change_request_id = ?1",
            params![cr_row],
            |row| row.get(0),
        )
        .context("check_count")
    }
}
