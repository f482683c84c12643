//! The per-change-request polling loop.
//!
//! One `Poller` owns one change request for the lifetime of its process.
//! State is loaded once on construction and kept in memory; every cycle ends
//! with a best-effort save, so a store outage degrades durability but never
//! dedup within the running process.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::aggregate::aggregate;
use crate::db::Db;
use crate::github::{DataSource, FetchError};
use crate::notify::{Notifier, Priority};
use crate::remediation::{FailureContext, Remediator};
use crate::state::{PollerState, StateRepository};
use crate::types::{ChangeRequest, ChangeRequestId, Comment, PipelineStatus, Run, SubJob};

/// What one cycle observed and did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleOutcome {
    pub status: PipelineStatus,
    /// A pipeline-level notification went out this cycle.
    pub notification_sent: bool,
    pub new_comments: usize,
    /// Runs a remediation agent was launched for this cycle.
    pub dispatched_run_ids: Vec<i64>,
    /// The change request is closed; the loop should end.
    pub closed: bool,
}

pub struct Poller {
    id: ChangeRequestId,
    source: Arc<dyn DataSource>,
    store: Arc<dyn StateRepository>,
    notifier: Arc<dyn Notifier>,
    db: Arc<Db>,
    remediator: Option<Arc<dyn Remediator>>,
    interval: Duration,
    state: PollerState,
}

impl Poller {
    pub fn new(
        id: ChangeRequestId,
        source: Arc<dyn DataSource>,
        store: Arc<dyn StateRepository>,
        notifier: Arc<dyn Notifier>,
        db: Arc<Db>,
        interval: Duration,
    ) -> Self {
        let state = match store.load(&id) {
            Ok(s) => s,
            Err(e) => {
                warn!(%id, "could not load poller state, starting fresh: {e}");
                PollerState::default()
            }
        };
        Self {
            id,
            source,
            store,
            notifier,
            db,
            remediator: None,
            interval,
            state,
        }
    }

    /// Without a remediator, failed runs are still recorded as dispatched
    /// so enabling one later does not replay old failures.
    pub fn with_remediator(mut self, remediator: Arc<dyn Remediator>) -> Self {
        self.remediator = Some(remediator);
        self
    }

    pub fn state(&self) -> &PollerState {
        &self.state
    }

    /// Poll until the change request closes. Fetch errors skip the cycle.
    pub async fn run(&mut self) {
        info!(id = %self.id, interval_s = self.interval.as_secs(), "poller started");
        loop {
            match self.poll_once().await {
                Ok(outcome) if outcome.closed => {
                    info!(id = %self.id, "change request closed, poller exiting");
                    return;
                }
                Ok(outcome) => {
                    debug!(id = %self.id, status = %outcome.status, "cycle complete");
                }
                Err(e) if e.is_auth() => {
                    error!(id = %self.id, "credentials rejected, skipping cycle: {e}");
                }
                Err(e) => {
                    warn!(id = %self.id, "fetch failed, skipping cycle: {e}");
                }
            }
            tokio::time::sleep(self.interval).await;
        }
    }

    pub async fn poll_once(&mut self) -> Result<CycleOutcome, FetchError> {
        let cr = self.source.fetch_change_request(&self.id).await?;
        let cr_row = self.persist(|db| db.upsert_change_request(&cr));

        if cr.is_closed() {
            self.finish(&cr, cr_row).await;
            return Ok(CycleOutcome {
                status: self.state.pipeline_status,
                closed: true,
                ..Default::default()
            });
        }

        let comments = self.source.fetch_comments(&self.id).await?;
        let new_comments = self.handle_comments(cr_row, &comments).await;

        let runs = self.source.fetch_runs(&self.id, &cr.head_sha).await?;
        let jobs = self.record_runs(cr_row, &runs).await;

        let status = aggregate(&runs);
        let previous = self.state.pipeline_status;
        let mut notification_sent = false;
        if let Some(n) = self.state.advance_pipeline(status) {
            info!(id = %self.id, %previous, %status, "pipeline reached terminal state");
            self.notify(&n.title(&cr), &n.body(&cr, &runs), n.priority).await;
            notification_sent = true;
        } else if status != previous {
            info!(id = %self.id, %previous, %status, "pipeline status changed");
        }

        let dispatched_run_ids = self.handle_failures(&cr, cr_row, &runs, &jobs).await;

        if let Some(row) = cr_row {
            self.persist(|db| db.record_check(row, status, runs.len(), notification_sent));
        }
        self.save();

        Ok(CycleOutcome {
            status,
            notification_sent,
            new_comments,
            dispatched_run_ids,
            closed: false,
        })
    }

    // ── Cycle steps ──────────────────────────────────────────────────────

    async fn finish(&mut self, cr: &ChangeRequest, cr_row: Option<i64>) {
        if self.state.closed_notified {
            debug!(id = %self.id, "closure already reported");
            return;
        }
        let verb = if cr.merged { "merged" } else { "closed" };
        self.notify(
            &format!("PR {verb}: {}", cr.id),
            &format!("{}\n{}", cr.title, cr.url),
            Priority::Normal,
        )
        .await;
        self.state.closed_notified = true;
        if let Some(row) = cr_row {
            let msg = format!("pull request {verb}, monitoring stopped");
            self.persist(|db| db.log_activity(row, "closed", &msg));
        }
        self.save();
    }

    /// Record every comment and send one batched notification for the ones
    /// not seen before. Returns how many were new.
    async fn handle_comments(&mut self, cr_row: Option<i64>, comments: &[Comment]) -> usize {
        if let Some(row) = cr_row {
            for c in comments {
                self.persist(|db| db.upsert_comment(row, c));
            }
        }
        self.state.last_comment_count = comments.len() as u64;

        let fresh: Vec<&Comment> = comments
            .iter()
            .filter(|c| !self.state.notified_comment_ids.contains(&c.provider_id))
            .collect();
        if fresh.is_empty() {
            return 0;
        }
        let title = format!("{} new comment(s) on {}", fresh.len(), self.id);
        let body = fresh
            .iter()
            .map(|c| format!("{}: {}", c.author, first_line(&c.body, 120)))
            .collect::<Vec<_>>()
            .join("\n");
        self.notify(&title, &body, Priority::Normal).await;
        self.state
            .notified_comment_ids
            .extend(fresh.iter().map(|c| c.provider_id));
        fresh.len()
    }

    /// Fetch and record the sub-jobs of every run. Runs whose jobs could not
    /// be fetched are missing from the returned map.
    async fn record_runs(&self, cr_row: Option<i64>, runs: &[Run]) -> HashMap<i64, Vec<SubJob>> {
        let mut by_run = HashMap::new();
        for run in runs {
            let run_row = cr_row.and_then(|row| self.persist(|db| db.upsert_run(row, run)));
            match self.source.fetch_sub_jobs(&self.id, run.provider_id).await {
                Ok(jobs) => {
                    if let Some(run_row) = run_row {
                        for job in &jobs {
                            self.persist(|db| db.upsert_job(run_row, job));
                        }
                    }
                    by_run.insert(run.provider_id, jobs);
                }
                Err(e) => warn!(id = %self.id, run = run.provider_id, "failed to fetch jobs: {e}"),
            }
        }
        by_run
    }

    /// One-shot analysis and dispatch for every run newly seen as failed.
    async fn handle_failures(
        &mut self,
        cr: &ChangeRequest,
        cr_row: Option<i64>,
        runs: &[Run],
        jobs: &HashMap<i64, Vec<SubJob>>,
    ) -> Vec<i64> {
        let mut dispatched = Vec::new();
        let mut diff: Option<String> = None;

        for run in runs.iter().filter(|r| r.is_failed()) {
            if !self.state.mark_failure_analyzed(run.provider_id) {
                continue;
            }
            let run_jobs = jobs.get(&run.provider_id).map(Vec::as_slice).unwrap_or_default();
            if diff.is_none() {
                diff = Some(self.source.fetch_diff(&cr.id).await.unwrap_or_else(|e| {
                    warn!(id = %self.id, "failed to fetch diff, dispatching without it: {e}");
                    String::new()
                }));
            }
            let ctx = FailureContext::build(&cr.id, run, run_jobs, diff.clone().unwrap_or_default());
            info!(
                id = %self.id,
                run = run.provider_id,
                run_name = %run.name,
                category = %ctx.category,
                "run failed"
            );
            if let Some(row) = cr_row {
                let msg = format!("{} [{}]: {}", run.name, ctx.category, ctx.analysis);
                self.persist(|db| db.log_activity(row, "run_failed", &msg));
            }

            if !self.state.mark_agent_dispatched(run.provider_id) {
                continue;
            }
            match &self.remediator {
                Some(r) => {
                    info!(id = %self.id, run = run.provider_id, category = %ctx.category, "dispatching remediation agent");
                    r.dispatch(ctx);
                    dispatched.push(run.provider_id);
                }
                None => debug!(id = %self.id, run = run.provider_id, "remediation disabled"),
            }
        }
        dispatched
    }

    // ── Helpers ──────────────────────────────────────────────────────────

    async fn notify(&self, title: &str, body: &str, priority: Priority) {
        if let Err(e) = self.notifier.send(title, body, priority).await {
            warn!(id = %self.id, title, "notification failed: {e:#}");
        }
    }

    /// Run one event-log write; failures only warn.
    fn persist<T>(&self, f: impl FnOnce(&Db) -> anyhow::Result<T>) -> Option<T> {
        match f(&self.db) {
            Ok(v) => Some(v),
            Err(e) => {
                warn!(id = %self.id, "event log write failed: {e:#}");
                None
            }
        }
    }

    fn save(&self) {
        if let Err(e) = self.store.save(&self.id, &self.state) {
            warn!(id = %self.id, "failed to save poller state: {e}");
        }
    }
}

fn first_line(s: &str, max_chars: usize) -> String {
    let line = s.lines().next().unwrap_or_default();
    if line.chars().count() <= max_chars {
        return line.to_string();
    }
    let mut out: String = line.chars().take(max_chars).collect();
    out.push('…');
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_line_truncates_on_chars() {
        assert_eq!(first_line("hello\nworld", 10), "hello");
        assert_eq!(first_line("ééééé", 3), "ééé…");
        assert_eq!(first_line("", 3), "");
    }
}
