use serde::{Deserialize, Serialize};

use crate::classify::{classify, AgentCategory};
use crate::types::{ChangeRequestId, Run, SubJob};

const MAX_DIFF_BYTES: usize = 200_000;

/// Failed-step summary for one sub-job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobFailure {
    pub job_name: String,
    pub url: String,
    pub failed_steps: Vec<String>,
}

/// Everything a remediation agent is told about one failed run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureContext {
    pub change_request: ChangeRequestId,
    pub head_sha: String,
    pub run_id: i64,
    pub run_name: String,
    pub run_url: String,
    pub category: AgentCategory,
    pub jobs: Vec<JobFailure>,
    /// Plain-text summary of what failed.
    pub analysis: String,
    pub diff: String,
}

impl FailureContext {
    pub fn build(change_request: &ChangeRequestId, run: &Run, jobs: &[SubJob], diff: String) -> Self {
        let jobs: Vec<JobFailure> = jobs
            .iter()
            .filter(|j| j.is_failed())
            .map(|j| JobFailure {
                job_name: j.name.clone(),
                url: j.url.clone(),
                failed_steps: j.failed_steps.iter().map(|s| s.name.clone()).collect(),
            })
            .collect();
        let analysis = summarize_failure(&run.name, &jobs);
        Self {
            change_request: change_request.clone(),
            head_sha: run.head_sha.clone(),
            run_id: run.provider_id,
            run_name: run.name.clone(),
            run_url: run.url.clone(),
            category: classify(&run.name),
            jobs,
            analysis,
            diff: truncate_diff(diff),
        }
    }
}

/// One line per failed job naming the steps that broke.
pub fn summarize_failure(run_name: &str, jobs: &[JobFailure]) -> String {
    if jobs.is_empty() {
        return format!("Run '{run_name}' failed without a failed job record (setup error or cancelled matrix).");
    }
    let mut lines = vec![format!("Run '{run_name}' failed in {} job(s):", jobs.len())];
    for job in jobs {
        if job.failed_steps.is_empty() {
            lines.push(format!("- {}: no failed step reported", job.job_name));
        } else {
            lines.push(format!("- {}: failed at {}", job.job_name, job.failed_steps.join(", ")));
        }
    }
    lines.join("\n")
}

fn truncate_diff(mut diff: String) -> String {
    if diff.len() <= MAX_DIFF_BYTES {
        return diff;
    }
    let mut cut = MAX_DIFF_BYTES;
    while !diff.is_char_boundary(cut) {
        cut -= 1;
    }
    diff.truncate(cut);
    diff.push_str("\n[diff truncated]\n");
    diff
}

/// Launches a remediation agent for a failed run without blocking the
/// caller. Outcome is reported through logs only.
pub trait Remediator: Send + Sync {
    fn dispatch(&self, ctx: FailureContext);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Conclusion, RunStatus, Step};

    fn failed_job(name: &str, steps: &[&str]) -> SubJob {
        SubJob {
            provider_id: 1,
            run_provider_id: 9,
            name: name.into(),
            status: RunStatus::Completed,
            conclusion: Some(Conclusion::Failure),
            failed_steps: steps
                .iter()
                .enumerate()
                .map(|(i, s)| Step {
                    name: (*s).into(),
                    number: i as i64,
                    status: RunStatus::Completed,
                    conclusion: Some(Conclusion::Failure),
                    started_at: None,
                    completed_at: None,
                })
                .collect(),
            error_message: steps.first().map(|s| (*s).to_string()),
            url: format!("https://ci/{name}"),
        }
    }

    #[test]
    fn context_keeps_only_failed_jobs_and_classifies() {
        let run = Run {
            provider_id: 9,
            name: "API Integration Tests".into(),
            status: RunStatus::Completed,
            conclusion: Some(Conclusion::Failure),
            head_sha: "abc".into(),
            url: "https://ci/9".into(),
            run_number: 1,
            run_attempt: 1,
        };
        let mut ok = failed_job("lint", &[]);
        ok.conclusion = Some(Conclusion::Success);
        let jobs = vec![failed_job("suite (pg)", &["Run suite"]), ok];
        let ctx = FailureContext::build(&ChangeRequestId::new("a/b", 1), &run, &jobs, "diff".into());
        assert_eq!(ctx.category, AgentCategory::Integration);
        assert_eq!(ctx.jobs.len(), 1);
        assert_eq!(ctx.jobs[0].failed_steps, vec!["Run suite".to_string()]);
        assert!(ctx.analysis.contains("suite (pg): failed at Run suite"));
    }

    #[test]
    fn summary_without_jobs_is_explicit() {
        assert!(summarize_failure("CI", &[]).contains("without a failed job record"));
    }

    #[test]
    fn oversized_diff_is_truncated_on_char_boundary() {
        let diff = "é".repeat(MAX_DIFF_BYTES);
        let out = truncate_diff(diff);
        assert!(out.ends_with("[diff truncated]\n"));
        assert!(out.len() < MAX_DIFF_BYTES + 32);
    }
}
