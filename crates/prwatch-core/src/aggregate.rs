use crate::notify::Priority;
use crate::types::{ChangeRequest, Conclusion, PipelineStatus, Run};

/// Reduce every run observed for the current head revision to one status.
///
/// A single incomplete run keeps the whole pipeline `in_progress`, whatever
/// the other runs concluded.
pub fn aggregate(runs: &[Run]) -> PipelineStatus {
    if runs.is_empty() {
        return PipelineStatus::NoRuns;
    }
    if runs.iter().any(|r| !r.is_completed()) {
        return PipelineStatus::InProgress;
    }
    if runs.iter().any(Run::is_failed) {
        return PipelineStatus::Failed;
    }
    PipelineStatus::Success
}

/// A pipeline-level notification that is due this cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineNotification {
    pub previous: PipelineStatus,
    pub status: PipelineStatus,
    pub priority: Priority,
}

pub(crate) fn notification_for(
    previous: PipelineStatus,
    status: PipelineStatus,
) -> Option<PipelineNotification> {
    let priority = match status {
        PipelineStatus::Failed => Priority::High,
        PipelineStatus::Success => Priority::Normal,
        _ => return None,
    };
    Some(PipelineNotification {
        previous,
        status,
        priority,
    })
}

impl PipelineNotification {
    pub fn title(&self, cr: &ChangeRequest) -> String {
        match self.status {
            PipelineStatus::Failed => format!("CI failed: {}", cr.id),
            _ => format!("CI passed: {}", cr.id),
        }
    }

    pub fn body(&self, cr: &ChangeRequest, runs: &[Run]) -> String {
        let mut body = format!("{}\n", cr.title);
        let failed: Vec<&Run> = runs.iter().filter(|r| r.is_failed()).collect();
        let all_succeeded = runs.iter().all(|r| r.conclusion == Some(Conclusion::Success));
        if failed.is_empty() && all_succeeded {
            body.push_str(&format!("All {} run(s) passed", runs.len()));
        } else if failed.is_empty() {
            body.push_str(&format!("{} run(s) completed, none failed", runs.len()));
        } else {
            body.push_str(&format!("{} of {} run(s) failed:", failed.len(), runs.len()));
            for run in failed {
                body.push_str(&format!("\n- {}", run.name));
            }
        }
        body.push_str(&format!("\n{}", cr.url));
        body
    }
}
