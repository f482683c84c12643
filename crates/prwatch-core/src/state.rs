//! Durable per-change-request poller state.
//!
//! A restarted poller reloads this record to avoid re-notifying for a
//! terminal pipeline state it already reported, and to avoid dispatching a
//! second remediation agent for a run it already handled. Writes are always
//! whole-record overwrites.

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::aggregate::{self, PipelineNotification};
use crate::types::{ChangeRequestId, PipelineStatus};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollerState {
    pub last_comment_count: u64,
    pub notified_comment_ids: BTreeSet<i64>,
    /// Runs whose failure has already been analysed.
    pub notified_failed_run_ids: BTreeSet<i64>,
    /// Runs a remediation agent has been launched for (at most once each).
    pub agent_dispatched_run_ids: BTreeSet<i64>,
    pub pipeline_status: PipelineStatus,
    /// True only while `pipeline_status` is terminal and unchanged since the
    /// notification for it went out.
    pub pipeline_notification_sent: bool,
    /// The merged/closed notification has gone out.
    pub closed_notified: bool,
}

impl PollerState {
    /// Move to `new_status` and decide whether a pipeline-level notification
    /// is due. Any transition clears the sent flag first.
    pub fn advance_pipeline(&mut self, new_status: PipelineStatus) -> Option<PipelineNotification> {
        let previous = self.pipeline_status;
        if new_status != previous {
            self.pipeline_notification_sent = false;
        }
        self.pipeline_status = new_status;

        if self.pipeline_notification_sent || !new_status.is_terminal() {
            return None;
        }
        self.pipeline_notification_sent = true;
        aggregate::notification_for(previous, new_status)
    }

    /// Record a failed run for analysis. Returns false if it was already seen.
    pub fn mark_failure_analyzed(&mut self, run_id: i64) -> bool {
        self.notified_failed_run_ids.insert(run_id)
    }

    /// Record a remediation dispatch. Returns false if one already happened.
    pub fn mark_agent_dispatched(&mut self, run_id: i64) -> bool {
        self.agent_dispatched_run_ids.insert(run_id)
    }
}

// ── Repository ───────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum StateError {
    #[error("state io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("corrupt state record at {path}: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Keyed load/save of [`PollerState`] records.
pub trait StateRepository: Send + Sync {
    /// Returns a default-valued record when none exists yet.
    fn load(&self, id: &ChangeRequestId) -> Result<PollerState, StateError>;

    /// Atomically replaces the whole record.
    fn save(&self, id: &ChangeRequestId, state: &PollerState) -> Result<(), StateError>;
}

/// One JSON file per change request under `<dir>/<slug>.json`.
pub struct FileStateRepository {
    dir: PathBuf,
}

impl FileStateRepository {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path_for(&self, id: &ChangeRequestId) -> PathBuf {
        self.dir.join(format!("{}.json", id.slug()))
    }
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> StateError + '_ {
    move |source| StateError::Io {
        path: path.to_path_buf(),
        source,
    }
}

impl StateRepository for FileStateRepository {
    fn load(&self, id: &ChangeRequestId) -> Result<PollerState, StateError> {
        let path = self.path_for(id);
        let data = match std::fs::read_to_string(&path) {
            Ok(d) => d,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(PollerState::default()),
            Err(e) => return Err(io_err(&path)(e)),
        };
        serde_json::from_str(&data).map_err(|source| StateError::Corrupt { path, source })
    }

    fn save(&self, id: &ChangeRequestId, state: &PollerState) -> Result<(), StateError> {
        std::fs::create_dir_all(&self.dir).map_err(io_err(&self.dir))?;
        let path = self.path_for(id);
        let tmp = path.with_extension("json.tmp");
        let json = serde_json::to_vec_pretty(state).map_err(|source| StateError::Corrupt {
            path: path.clone(),
            source,
        })?;
        std::fs::write(&tmp, json).map_err(io_err(&tmp))?;
        std::fs::rename(&tmp, &path).map_err(io_err(&path))?;
        Ok(())
    }
}

/// Process-local repository for tests and dry runs.
#[derive(Default)]
pub struct MemoryStateRepository {
    records: Mutex<HashMap<ChangeRequestId, PollerState>>,
}

impl MemoryStateRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StateRepository for MemoryStateRepository {
    fn load(&self, id: &ChangeRequestId) -> Result<PollerState, StateError> {
        let records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        Ok(records.get(id).cloned().unwrap_or_default())
    }

    fn save(&self, id: &ChangeRequestId, state: &PollerState) -> Result<(), StateError> {
        let mut records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        records.insert(id.clone(), state.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::Priority;

    fn id() -> ChangeRequestId {
        ChangeRequestId::new("acme/widgets", 7)
    }

    #[test]
    fn default_state_is_unknown_and_unsent() {
        let s = PollerState::default();
        assert_eq!(s.pipeline_status, PipelineStatus::Unknown);
        assert!(!s.pipeline_notification_sent);
        assert!(s.notified_failed_run_ids.is_empty());
    }

    #[test]
    fn terminal_status_notifies_once() {
        let mut s = PollerState::default();
        assert!(s.advance_pipeline(PipelineStatus::InProgress).is_none());
        let n = s.advance_pipeline(PipelineStatus::Success).expect("first success notifies");
        assert_eq!(n.priority, Priority::Normal);
        assert!(s.pipeline_notification_sent);
        assert!(s.advance_pipeline(PipelineStatus::Success).is_none());
        assert!(s.advance_pipeline(PipelineStatus::Success).is_none());
    }

    #[test]
    fn in_progress_rearms_the_flag() {
        let mut s = PollerState::default();
        assert!(s.advance_pipeline(PipelineStatus::Failed).is_some());
        assert!(s.advance_pipeline(PipelineStatus::InProgress).is_none());
        assert!(!s.pipeline_notification_sent);
        let n = s.advance_pipeline(PipelineStatus::Failed).expect("re-armed");
        assert_eq!(n.priority, Priority::High);
    }

    #[test]
    fn direct_terminal_to_terminal_transition_notifies() {
        let mut s = PollerState::default();
        assert!(s.advance_pipeline(PipelineStatus::Failed).is_some());
        assert!(s.advance_pipeline(PipelineStatus::Success).is_some());
        assert_eq!(s.pipeline_status, PipelineStatus::Success);
    }

    #[test]
    fn no_runs_never_notifies() {
        let mut s = PollerState::default();
        assert!(s.advance_pipeline(PipelineStatus::NoRuns).is_none());
        assert!(!s.pipeline_notification_sent);
    }

    #[test]
    fn failure_analysis_and_dispatch_marks_are_one_shot() {
        let mut s = PollerState::default();
        assert!(s.mark_failure_analyzed(10));
        assert!(!s.mark_failure_analyzed(10));
        assert!(s.mark_agent_dispatched(10));
        assert!(!s.mark_agent_dispatched(10));
    }

    #[test]
    fn file_repository_round_trips_and_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let repo = FileStateRepository::new(dir.path().join("state"));
        assert_eq!(repo.load(&id()).unwrap(), PollerState::default());

        let mut s = PollerState::default();
        s.advance_pipeline(PipelineStatus::Failed);
        s.mark_agent_dispatched(99);
        repo.save(&id(), &s).unwrap();

        assert_eq!(repo.load(&id()).unwrap(), s);
        assert!(!repo.path_for(&id()).with_extension("json.tmp").exists());
    }

    #[test]
    fn missing_fields_default_on_load() {
        let dir = tempfile::tempdir().unwrap();
        let repo = FileStateRepository::new(dir.path());
        std::fs::write(
            repo.path_for(&id()),
            r#"{"pipeline_status":"success","pipeline_notification_sent":true,"extra":1}"#,
        )
        .unwrap();
        let s = repo.load(&id()).unwrap();
        assert_eq!(s.pipeline_status, PipelineStatus::Success);
        assert!(s.pipeline_notification_sent);
        assert!(s.notified_comment_ids.is_empty());
        assert_eq!(s.last_comment_count, 0);
    }

    #[test]
    fn corrupt_record_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let repo = FileStateRepository::new(dir.path());
        std::fs::write(repo.path_for(&id()), "not json").unwrap();
        assert!(matches!(repo.load(&id()), Err(StateError::Corrupt { .. })));
    }
}
