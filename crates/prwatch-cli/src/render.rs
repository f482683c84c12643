use anyhow::Result;
use chrono::Local;
use prwatch_core::db::{ActivityRow, FailedJobRow};
use prwatch_core::supervisor::MonitorProcess;
use prwatch_core::ChangeRequestId;
use serde::Serialize;

#[derive(Serialize)]
struct ErrorsReport<'a> {
    change_request: String,
    failed_jobs: &'a [FailedJobRow],
}

pub fn errors_json(id: &ChangeRequestId, rows: &[FailedJobRow]) -> Result<String> {
    let report = ErrorsReport {
        change_request: id.to_string(),
        failed_jobs: rows,
    };
    Ok(serde_json::to_string_pretty(&report)?)
}

/// Failed jobs grouped under their run, one failed step per line.
pub fn errors_human(id: &ChangeRequestId, rows: &[FailedJobRow]) -> String {
    if rows.is_empty() {
        return format!("{id}: no failed jobs on the current revision\n");
    }
    let mut out = format!("{id}: {} failed job(s)\n", rows.len());
    let mut current_run: Option<(&str, i64)> = None;
    for row in rows {
        let key = (row.run_name.as_str(), row.run_attempt);
        if current_run != Some(key) {
            out.push_str(&format!(
                "\n{} (attempt {})  {}\n",
                row.run_name, row.run_attempt, row.run_url
            ));
            current_run = Some(key);
        }
        out.push_str(&format!("  x {}  {}\n", row.job_name, row.job_url));
        if row.failed_steps.is_empty() {
            if let Some(msg) = &row.error_message {
                out.push_str(&format!("      {msg}\n"));
            }
        }
        for step in &row.failed_steps {
            out.push_str(&format!("      step {}: {}\n", step.number, step.name));
        }
    }
    out
}

/// What `prwatch activity` reports for one pull request.
pub struct ActivitySummary {
    pub checks: i64,
    pub unaddressed_comments: i64,
    pub entries: Vec<ActivityRow>,
}

pub fn activity_human(id: &ChangeRequestId, summary: &ActivitySummary) -> String {
    let mut out = format!(
        "{id}: {} check(s), {} unaddressed comment(s)\n",
        summary.checks, summary.unaddressed_comments
    );
    for a in &summary.entries {
        out.push_str(&format!(
            "{}  {:<10} {}\n",
            a.created_at.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S"),
            a.kind,
            a.message.lines().next().unwrap_or_default()
        ));
    }
    out
}

#[derive(Serialize)]
struct ActivityReport<'a> {
    change_request: String,
    checks: i64,
    unaddressed_comments: i64,
    activity: Vec<ActivityEntry<'a>>,
}

#[derive(Serialize)]
struct ActivityEntry<'a> {
    kind: &'a str,
    message: &'a str,
    created_at: String,
}

pub fn activity_json(id: &ChangeRequestId, summary: &ActivitySummary) -> Result<String> {
    let report = ActivityReport {
        change_request: id.to_string(),
        checks: summary.checks,
        unaddressed_comments: summary.unaddressed_comments,
        activity: summary
            .entries
            .iter()
            .map(|a| ActivityEntry {
                kind: &a.kind,
                message: &a.message,
                created_at: a.created_at.to_rfc3339(),
            })
            .collect(),
    };
    Ok(serde_json::to_string_pretty(&report)?)
}

pub fn list_human(procs: &[MonitorProcess]) -> String {
    if procs.is_empty() {
        return "no pollers running\n".to_string();
    }
    let mut out = format!("{:<8} {:<20} {}\n", "PID", "STARTED", "TARGET");
    for p in procs {
        out.push_str(&format!(
            "{:<8} {:<20} {}\n",
            p.pid,
            p.started_at.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S"),
            p.target
        ));
    }
    out
}

#[derive(Serialize)]
struct ProcessRow {
    pid: u32,
    started_at: String,
    target: String,
}

pub fn list_json(procs: &[MonitorProcess]) -> Result<String> {
    let rows: Vec<ProcessRow> = procs
        .iter()
        .map(|p| ProcessRow {
            pid: p.pid,
            started_at: p.started_at.to_rfc3339(),
            target: p.target.to_string(),
        })
        .collect();
    Ok(serde_json::to_string_pretty(&rows)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use prwatch_core::{Conclusion, RunStatus, Step};

    fn row(run: &str, job: &str, steps: &[&str]) -> FailedJobRow {
        FailedJobRow {
            run_name: run.into(),
            run_url: format!("https://ci/{run}"),
            run_attempt: 1,
            job_name: job.into(),
            job_url: format!("https://ci/{run}/{job}"),
            error_message: steps.first().map(|s| s.to_string()),
            failed_steps: steps
                .iter()
                .enumerate()
                .map(|(i, s)| Step {
                    name: s.to_string(),
                    number: i as i64 + 1,
                    status: RunStatus::Completed,
                    conclusion: Some(Conclusion::Failure),
                    started_at: None,
                    completed_at: None,
                })
                .collect(),
        }
    }

    fn id() -> ChangeRequestId {
        ChangeRequestId::new("acme/widgets", 7)
    }

    #[test]
    fn human_errors_group_by_run() {
        let rows = vec![
            row("CI", "lint", &["eslint"]),
            row("CI", "test", &["unit", "e2e"]),
            row("Deploy", "preview", &[]),
        ];
        let out = errors_human(&id(), &rows);
        assert!(out.starts_with("acme/widgets#7: 3 failed job(s)"));
        assert_eq!(out.matches("(attempt 1)").count(), 2);
        assert!(out.contains("  x test  https://ci/CI/test\n      step 1: unit\n      step 2: e2e\n"));
    }

    #[test]
    fn human_errors_when_clean() {
        assert!(errors_human(&id(), &[]).contains("no failed jobs"));
    }

    #[test]
    fn json_errors_are_machine_readable() {
        let rows = vec![row("CI", "lint", &["eslint"])];
        let v: serde_json::Value = serde_json::from_str(&errors_json(&id(), &rows).unwrap()).unwrap();
        assert_eq!(v["change_request"], "acme/widgets#7");
        assert_eq!(v["failed_jobs"][0]["job_name"], "lint");
        assert_eq!(v["failed_jobs"][0]["failed_steps"][0]["name"], "eslint");
    }

    #[test]
    fn activity_renders_counts_and_first_lines() {
        let summary = ActivitySummary {
            checks: 5,
            unaddressed_comments: 1,
            entries: vec![ActivityRow {
                kind: "run_failed".into(),
                message: "Unit Tests [test]: Run 'Unit Tests' failed\n- test: cargo test".into(),
                created_at: Utc.with_ymd_and_hms(2026, 10, 19, 10, 0, 0).unwrap(),
            }],
        };
        let out = activity_human(&id(), &summary);
        assert!(out.starts_with("acme/widgets#7: 5 check(s), 1 unaddressed comment(s)\n"));
        assert!(out.contains("run_failed"));
        assert!(!out.contains("cargo test"));

        let v: serde_json::Value = serde_json::from_str(&activity_json(&id(), &summary).unwrap()).unwrap();
        assert_eq!(v["checks"], 5);
        assert_eq!(v["activity"][0]["kind"], "run_failed");
        assert_eq!(v["activity"][0]["created_at"], "2026-10-19T10:00:00+00:00");
    }

    #[test]
    fn list_renders_each_process() {
        let procs = vec![MonitorProcess {
            pid: 4242,
            started_at: Utc.with_ymd_and_hms(2026, 10, 19, 10, 0, 0).unwrap(),
            target: id(),
        }];
        let out = list_human(&procs);
        assert!(out.lines().nth(1).unwrap().starts_with("4242"));
        assert!(out.contains("acme/widgets#7"));
        assert!(list_human(&[]).contains("no pollers"));

        let v: serde_json::Value = serde_json::from_str(&list_json(&procs).unwrap()).unwrap();
        assert_eq!(v[0]["pid"], 4242);
        assert_eq!(v[0]["started_at"], "2026-10-19T10:00:00+00:00");
    }
}
