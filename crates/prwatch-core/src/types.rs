use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ── Change request identity ──────────────────────────────────────────────

/// Identifies one pull request: `owner/name#number`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChangeRequestId {
    /// `owner/name`
    pub repo: String,
    pub number: u64,
}

impl ChangeRequestId {
    pub fn new(repo: impl Into<String>, number: u64) -> Self {
        Self {
            repo: repo.into(),
            number,
        }
    }

    pub fn owner(&self) -> &str {
        self.repo.split_once('/').map(|(o, _)| o).unwrap_or(&self.repo)
    }

    pub fn name(&self) -> &str {
        self.repo.split_once('/').map(|(_, n)| n).unwrap_or(&self.repo)
    }

    /// Filesystem-safe key used for state and log file names.
    pub fn slug(&self) -> String {
        format!("{}__{}", self.repo.replace('/', "__"), self.number)
    }
}

impl fmt::Display for ChangeRequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.repo, self.number)
    }
}

impl FromStr for ChangeRequestId {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (repo, number) = s
            .rsplit_once('#')
            .ok_or_else(|| anyhow::anyhow!("expected owner/name#number, got {s:?}"))?;
        if repo.split('/').count() != 2 || repo.split('/').any(str::is_empty) {
            anyhow::bail!("expected owner/name in {s:?}");
        }
        let number = number
            .parse()
            .map_err(|_| anyhow::anyhow!("invalid pull request number in {s:?}"))?;
        Ok(Self::new(repo, number))
    }
}

// ── Change request ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleState {
    Open,
    Closed,
}

impl LifecycleState {
    pub fn from_github(s: &str) -> Self {
        match s {
            "closed" => Self::Closed,
            _ => Self::Open,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Closed => "closed",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeRequest {
    pub id: ChangeRequestId,
    pub title: String,
    pub state: LifecycleState,
    pub merged: bool,
    /// Latest known head revision.
    pub head_sha: String,
    pub head_ref: String,
    pub url: String,
}

impl ChangeRequest {
    pub fn is_closed(&self) -> bool {
        self.state == LifecycleState::Closed
    }
}

// ── CI runs ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Queued,
    InProgress,
    Completed,
}

impl RunStatus {
    /// GitHub also reports `waiting`, `requested` and `pending`; all of them
    /// are "not completed yet".
    pub fn from_github(s: &str) -> Self {
        match s {
            "completed" => Self::Completed,
            "in_progress" => Self::InProgress,
            _ => Self::Queued,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Conclusion {
    Success,
    Failure,
    Cancelled,
    Skipped,
    Neutral,
    TimedOut,
    ActionRequired,
    StartupFailure,
    Stale,
}

impl Conclusion {
    pub fn from_github(s: &str) -> Option<Self> {
        Some(match s {
            "success" => Self::Success,
            "failure" => Self::Failure,
            "cancelled" => Self::Cancelled,
            "skipped" => Self::Skipped,
            "neutral" => Self::Neutral,
            "timed_out" => Self::TimedOut,
            "action_required" => Self::ActionRequired,
            "startup_failure" => Self::StartupFailure,
            "stale" => Self::Stale,
            _ => return None,
        })
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failure => "failure",
            Self::Cancelled => "cancelled",
            Self::Skipped => "skipped",
            Self::Neutral => "neutral",
            Self::TimedOut => "timed_out",
            Self::ActionRequired => "action_required",
            Self::StartupFailure => "startup_failure",
            Self::Stale => "stale",
        }
    }

    /// Conclusions that mean the work did not succeed and needs attention.
    /// `cancelled`, `skipped`, `neutral` and `stale` do not count.
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            Self::Failure | Self::TimedOut | Self::ActionRequired | Self::StartupFailure
        )
    }
}

/// One CI pipeline execution against a revision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub provider_id: i64,
    pub name: String,
    pub status: RunStatus,
    /// Only meaningful once `status == Completed`.
    pub conclusion: Option<Conclusion>,
    pub head_sha: String,
    pub url: String,
    pub run_number: i64,
    pub run_attempt: i64,
}

impl Run {
    pub fn is_completed(&self) -> bool {
        self.status == RunStatus::Completed
    }

    pub fn is_failed(&self) -> bool {
        self.is_completed() && self.conclusion.is_some_and(|c| c.is_failure())
    }
}

/// One step inside a sub-job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub name: String,
    pub number: i64,
    pub status: RunStatus,
    pub conclusion: Option<Conclusion>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// A unit of work inside a [`Run`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubJob {
    pub provider_id: i64,
    pub run_provider_id: i64,
    pub name: String,
    pub status: RunStatus,
    pub conclusion: Option<Conclusion>,
    /// Steps that concluded `failure`, in execution order.
    pub failed_steps: Vec<Step>,
    /// Name of the first failed step, if any.
    pub error_message: Option<String>,
    pub url: String,
}

impl SubJob {
    pub fn is_failed(&self) -> bool {
        self.conclusion.is_some_and(|c| c.is_failure())
    }
}

// ── Comments ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommentKind {
    /// Inline comment attached to a file in the diff.
    Review,
    /// Top-level conversation comment.
    General,
}

impl CommentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Review => "review",
            Self::General => "general",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Comment {
    pub provider_id: i64,
    pub kind: CommentKind,
    pub author: String,
    pub body: String,
    pub path: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
}

// ── Pipeline status ──────────────────────────────────────────────────────

/// Aggregate state of every run for the current head revision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStatus {
    #[default]
    Unknown,
    NoRuns,
    InProgress,
    Success,
    Failed,
}

impl PipelineStatus {
    /// Terminal statuses are the only ones that can page the user.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::NoRuns => "no_runs",
            Self::InProgress => "in_progress",
            Self::Success => "success",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for PipelineStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
