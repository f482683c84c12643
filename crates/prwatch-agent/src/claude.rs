use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use prwatch_core::git::Git;
use prwatch_core::remediation::{FailureContext, Remediator};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::command::AgentCommand;
use crate::event::{describe_line, final_output};
use crate::instruction::build_prompt;

/// How one agent run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentOutcome {
    pub exit_ok: bool,
    pub timed_out: bool,
    /// A new local commit that looks like a fix appeared during the run.
    pub fix_committed: bool,
    pub output: String,
}

/// Runs Claude Code (or any CLI with the same stdin/stream-json contract)
/// as the remediation agent, one detached task per failed run.
///
/// Clones share one workdir lock, so runs dispatched from the same
/// remediator execute one at a time and each fix check only sees its own
/// commits.
#[derive(Debug, Clone)]
pub struct ClaudeRemediator {
    /// Path to the agent binary.
    pub agent_bin: String,
    /// Local checkout of the change request's branch.
    pub workdir: PathBuf,
    /// Kill the agent after this long (zero means no limit).
    pub timeout: Duration,
    /// Extra arguments placed before the defaults.
    pub extra_args: Vec<String>,
    workdir_lock: Arc<Mutex<()>>,
}

impl ClaudeRemediator {
    pub fn new(agent_bin: impl Into<String>, workdir: impl Into<PathBuf>) -> Self {
        Self {
            agent_bin: agent_bin.into(),
            workdir: workdir.into(),
            timeout: Duration::ZERO,
            extra_args: Vec::new(),
            workdir_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.extra_args.extend(args.into_iter().map(Into::into));
        self
    }

    fn command(&self) -> AgentCommand {
        AgentCommand::new(&self.agent_bin, &self.workdir)
            .args(self.extra_args.iter().cloned())
            .args([
                "--print",
                "--output-format",
                "stream-json",
                "--verbose",
                "--allowedTools",
                "Read,Glob,Grep,Write,Edit,Bash",
                "--max-turns",
                "200",
            ])
    }

    /// Run the agent to completion for one failed run.
    pub async fn run(&self, ctx: &FailureContext) -> Result<AgentOutcome> {
        let _workdir = self.workdir_lock.lock().await;
        let base = match with_git(&self.workdir, |git| git.rev_parse_head()).await {
            Ok(sha) => Some(sha),
            Err(e) => {
                warn!(workdir = %self.workdir.display(), "cannot read HEAD, fix detection disabled: {e}");
                None
            }
        };

        let prompt = build_prompt(ctx, &self.workdir);
        let run_id = ctx.run_id;
        info!(
            id = %ctx.change_request,
            run_id,
            category = %ctx.category,
            bin = %self.agent_bin,
            prompt_len = prompt.len(),
            "spawning remediation agent"
        );

        let mut stream = self.command().spawn(&prompt).await?;
        let io_future = async move {
            let mut raw = String::new();
            while let Some(line) = stream.next_line().await? {
                if let Some(summary) = describe_line(&line) {
                    info!(target: "prwatch_agent", run_id, "{summary}");
                }
                raw.push_str(&line);
                raw.push('\n');
            }
            let status = stream.wait().await?;
            anyhow::Ok((raw, status.success()))
        };

        let (raw, exit_ok, timed_out) = if self.timeout.is_zero() {
            let (raw, ok) = io_future.await?;
            (raw, ok, false)
        } else {
            match tokio::time::timeout(self.timeout, io_future).await {
                Ok(res) => {
                    let (raw, ok) = res?;
                    (raw, ok, false)
                }
                Err(_elapsed) => {
                    warn!(run_id, timeout_s = self.timeout.as_secs(), "remediation agent timed out");
                    (String::new(), false, true)
                }
            }
        };

        let fix_committed = match base {
            Some(base) => with_git(&self.workdir, move |git| fix_commit_created(git, &base))
                .await
                .unwrap_or_else(|e| {
                    warn!(run_id, "could not inspect new commits: {e:#}");
                    false
                }),
            None => false,
        };

        Ok(AgentOutcome {
            exit_ok,
            timed_out,
            fix_committed,
            output: final_output(&raw),
        })
    }
}

impl Remediator for ClaudeRemediator {
    fn dispatch(&self, ctx: FailureContext) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!(run_id = ctx.run_id, "no async runtime, remediation agent not started");
            return;
        };
        let agent = self.clone();
        handle.spawn(async move {
            let run_id = ctx.run_id;
            match agent.run(&ctx).await {
                Ok(o) if o.exit_ok && o.fix_committed => {
                    info!(run_id, "remediation agent committed a fix");
                }
                Ok(o) if o.exit_ok => {
                    warn!(run_id, "remediation agent finished without a fix commit");
                }
                Ok(o) => {
                    warn!(run_id, timed_out = o.timed_out, fix_committed = o.fix_committed, "remediation agent failed");
                }
                Err(e) => {
                    warn!(run_id, "remediation agent could not run: {e:#}");
                }
            }
        });
    }
}

/// Git shells out synchronously; keep it off the async workers.
async fn with_git<T, F>(workdir: &Path, f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce(&Git) -> Result<T> + Send + 'static,
{
    let git = Git::new(workdir.to_string_lossy());
    tokio::task::spawn_blocking(move || f(&git))
        .await
        .context("git task panicked")?
}

/// Whether any commit made since `base` has a subject mentioning "fix".
///
/// This is a heuristic: the agent is asked to prefix its commit with
/// `fix:`, but nothing verifies that the commit actually fixes the run.
pub fn fix_commit_created(git: &Git, base: &str) -> Result<bool> {
    let subjects = git
        .commit_subjects_since(base)
        .context("listing commits since agent start")?;
    Ok(looks_like_fix_commit(&subjects))
}

pub fn looks_like_fix_commit(subjects: &[String]) -> bool {
    subjects.iter().any(|s| s.to_lowercase().contains("fix"))
}
