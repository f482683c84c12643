//! Keeps at most one poller alive per change request.
//!
//! Pollers are discovered by their command line, so there is no lock file to
//! go stale: a poller that dies simply stops showing up in `list()`.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Local, NaiveDateTime, TimeZone, Utc};
use thiserror::Error;
use tracing::{info, warn};

use crate::types::ChangeRequestId;

/// Subcommand that marks a process as a poller.
pub const POLL_SUBCOMMAND: &str = "poll";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitorProcess {
    pub pid: u32,
    pub started_at: DateTime<Utc>,
    pub target: ChangeRequestId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Terminate,
    Kill,
}

/// Enumerates, launches and signals poller processes.
pub trait ProcessRegistry: Send + Sync {
    fn list(&self) -> Result<Vec<MonitorProcess>>;
    fn spawn(&self, id: &ChangeRequestId) -> Result<u32>;
    fn signal(&self, pid: u32, signal: Signal) -> Result<()>;
    fn is_alive(&self, pid: u32) -> bool;
}

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("a poller for {id} is already running (pid {})", pids_str(.pids))]
    AlreadyRunning { id: ChangeRequestId, pids: Vec<u32> },
    #[error("poller for {id} still running after SIGKILL (pid {})", pids_str(.pids))]
    StillRunning { id: ChangeRequestId, pids: Vec<u32> },
    #[error(transparent)]
    Registry(#[from] anyhow::Error),
}

fn pids_str(pids: &[u32]) -> String {
    pids.iter().map(u32::to_string).collect::<Vec<_>>().join(", ")
}

pub struct Supervisor<R> {
    registry: R,
    grace: Duration,
    poll_every: Duration,
}

impl<R: ProcessRegistry> Supervisor<R> {
    pub fn new(registry: R, grace: Duration) -> Self {
        Self {
            registry,
            grace,
            poll_every: Duration::from_millis(200).min(grace),
        }
    }

    pub fn registry(&self) -> &R {
        &self.registry
    }

    pub fn list(&self) -> Result<Vec<MonitorProcess>> {
        let mut procs = self.registry.list()?;
        procs.sort_by(|a, b| (&a.target, a.started_at, a.pid).cmp(&(&b.target, b.started_at, b.pid)));
        Ok(procs)
    }

    fn matching(&self, id: &ChangeRequestId) -> Result<Vec<MonitorProcess>> {
        Ok(self.registry.list()?.into_iter().filter(|p| &p.target == id).collect())
    }

    pub fn is_running(&self, id: &ChangeRequestId) -> Result<bool> {
        Ok(!self.matching(id)?.is_empty())
    }

    /// Launch a poller unless one already exists for `id`.
    pub fn start(&self, id: &ChangeRequestId) -> Result<u32, SupervisorError> {
        let existing = self.matching(id)?;
        if !existing.is_empty() {
            return Err(SupervisorError::AlreadyRunning {
                id: id.clone(),
                pids: existing.iter().map(|p| p.pid).collect(),
            });
        }
        let pid = self.registry.spawn(id)?;
        info!(%id, pid, "started poller");
        Ok(pid)
    }

    /// Terminate every poller for `id`. Returns how many were stopped.
    pub async fn stop(&self, id: &ChangeRequestId) -> Result<usize, SupervisorError> {
        let pids: Vec<u32> = self.matching(id)?.iter().map(|p| p.pid).collect();
        if pids.is_empty() {
            return Ok(0);
        }
        self.terminate_all(&pids).await?;
        let survivors: Vec<u32> = self.matching(id)?.iter().map(|p| p.pid).collect();
        if !survivors.is_empty() {
            return Err(SupervisorError::StillRunning {
                id: id.clone(),
                pids: survivors,
            });
        }
        info!(%id, count = pids.len(), "stopped poller(s)");
        Ok(pids.len())
    }

    /// For every id with duplicate pollers, keep the earliest-started one
    /// and terminate the rest. Returns the terminated pids.
    pub async fn cleanup(&self) -> Result<Vec<u32>, SupervisorError> {
        let mut by_id: BTreeMap<ChangeRequestId, Vec<MonitorProcess>> = BTreeMap::new();
        for p in self.registry.list()? {
            by_id.entry(p.target.clone()).or_default().push(p);
        }

        let mut doomed = Vec::new();
        for (id, mut procs) in by_id {
            if procs.len() < 2 {
                continue;
            }
            procs.sort_by_key(|p| (p.started_at, p.pid));
            let keep = procs[0].pid;
            let extra: Vec<u32> = procs[1..].iter().map(|p| p.pid).collect();
            warn!(%id, keep, terminating = ?extra, "duplicate pollers found");
            doomed.extend(extra);
        }
        if !doomed.is_empty() {
            self.terminate_all(&doomed).await?;
        }
        Ok(doomed)
    }

    /// SIGTERM, wait out the grace period, SIGKILL whatever is left.
    async fn terminate_all(&self, pids: &[u32]) -> Result<()> {
        for &pid in pids {
            if let Err(e) = self.registry.signal(pid, Signal::Terminate) {
                warn!(pid, "SIGTERM failed: {e}");
            }
        }
        let deadline = tokio::time::Instant::now() + self.grace;
        while pids.iter().any(|&p| self.registry.is_alive(p)) {
            if tokio::time::Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(self.poll_every).await;
        }
        for &pid in pids.iter().filter(|&&p| self.registry.is_alive(p)) {
            warn!(pid, "poller ignored SIGTERM, sending SIGKILL");
            self.registry.signal(pid, Signal::Kill)?;
        }
        Ok(())
    }
}

// ── Lease view ───────────────────────────────────────────────────────────

/// Single-holder lease per change request. Process discovery is one backend;
/// a file lock or an external lease service would satisfy the same contract.
#[async_trait::async_trait]
pub trait MonitorLease: Send + Sync {
    /// Acquire the lease by launching a holder. `AlreadyRunning` if held.
    async fn try_acquire(&self, id: &ChangeRequestId) -> Result<u32, SupervisorError>;
    /// Release every holder of the lease.
    async fn release(&self, id: &ChangeRequestId) -> Result<usize, SupervisorError>;
    async fn list_holders(&self) -> Result<Vec<MonitorProcess>, SupervisorError>;
}

#[async_trait::async_trait]
impl<R: ProcessRegistry> MonitorLease for Supervisor<R> {
    async fn try_acquire(&self, id: &ChangeRequestId) -> Result<u32, SupervisorError> {
        self.start(id)
    }

    async fn release(&self, id: &ChangeRequestId) -> Result<usize, SupervisorError> {
        self.stop(id).await
    }

    async fn list_holders(&self) -> Result<Vec<MonitorProcess>, SupervisorError> {
        Ok(self.list()?)
    }
}

// ── OS process backend ───────────────────────────────────────────────────

/// Discovers pollers with `ps` and launches them as detached children of
/// the current executable.
pub struct PsProcessRegistry {
    exe: PathBuf,
    log_dir: PathBuf,
}

impl PsProcessRegistry {
    pub fn new(exe: impl Into<PathBuf>, log_dir: impl Into<PathBuf>) -> Self {
        Self {
            exe: exe.into(),
            log_dir: log_dir.into(),
        }
    }

    pub fn log_path(&self, id: &ChangeRequestId) -> PathBuf {
        self.log_dir.join(format!("{}.log", id.slug()))
    }
}

impl ProcessRegistry for PsProcessRegistry {
    fn list(&self) -> Result<Vec<MonitorProcess>> {
        let output = Command::new("ps")
            .args(["-eo", "pid=,lstart=,args="])
            .env("LC_ALL", "C")
            .output()
            .context("failed to run ps")?;
        if !output.status.success() {
            anyhow::bail!("ps exited with {}", output.status);
        }
        let me = std::process::id();
        Ok(String::from_utf8_lossy(&output.stdout)
            .lines()
            .filter_map(parse_ps_line)
            .filter(|p| p.pid != me)
            .collect())
    }

    fn spawn(&self, id: &ChangeRequestId) -> Result<u32> {
        use std::os::unix::process::CommandExt;

        std::fs::create_dir_all(&self.log_dir)
            .with_context(|| format!("create log dir {}", self.log_dir.display()))?;
        let log_path = self.log_path(id);
        let log = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .with_context(|| format!("open {}", log_path.display()))?;
        let log_err = log.try_clone().context("clone log handle")?;

        let child = Command::new(&self.exe)
            .args([POLL_SUBCOMMAND, &id.repo, &id.number.to_string()])
            .stdin(Stdio::null())
            .stdout(log)
            .stderr(log_err)
            .process_group(0)
            .spawn()
            .with_context(|| format!("failed to spawn {}", self.exe.display()))?;
        Ok(child.id())
    }

    fn signal(&self, pid: u32, signal: Signal) -> Result<()> {
        let sig = match signal {
            Signal::Terminate => libc::SIGTERM,
            Signal::Kill => libc::SIGKILL,
        };
        let pid = libc::pid_t::try_from(pid).context("pid out of range")?;
        // SAFETY: kill(2) has no memory-safety preconditions.
        let rc = unsafe { libc::kill(pid, sig) };
        if rc != 0 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::ESRCH) {
                return Err(err).with_context(|| format!("kill({pid}, {sig})"));
            }
        }
        Ok(())
    }

    fn is_alive(&self, pid: u32) -> bool {
        let Ok(pid) = libc::pid_t::try_from(pid) else {
            return false;
        };
        // SAFETY: signal 0 only checks for existence and permission.
        unsafe { libc::kill(pid, 0) == 0 }
    }
}

/// Parse one `ps -eo pid=,lstart=,args=` line into a poller record, or
/// `None` if the process is not a poller.
///
/// `lstart` is always five whitespace-separated fields in the C locale,
/// e.g. `Mon Oct 19 10:00:00 2026`.
pub fn parse_ps_line(line: &str) -> Option<MonitorProcess> {
    let mut fields = line.split_whitespace();
    let pid: u32 = fields.next()?.parse().ok()?;
    let lstart: Vec<&str> = fields.by_ref().take(5).collect();
    if lstart.len() != 5 {
        return None;
    }
    let started = NaiveDateTime::parse_from_str(&lstart.join(" "), "%a %b %e %H:%M:%S %Y").ok()?;
    let started_at = Local
        .from_local_datetime(&started)
        .earliest()
        .map(|d| d.with_timezone(&Utc))
        .unwrap_or_else(|| started.and_utc());

    let args: Vec<&str> = fields.collect();
    let target = parse_poll_args(&args)?;
    Some(MonitorProcess {
        pid,
        started_at,
        target,
    })
}

/// Match the invocation signature `<exe> poll <owner/name> <number>`.
fn parse_poll_args(args: &[&str]) -> Option<ChangeRequestId> {
    let exe = args.first()?;
    let exe_name = exe.rsplit('/').next().unwrap_or(exe);
    if !exe_name.starts_with("prwatch") {
        return None;
    }
    let pos = args.iter().position(|a| *a == POLL_SUBCOMMAND)?;
    let repo = args.get(pos + 1)?;
    let number = args.get(pos + 2)?.parse().ok()?;
    if !repo.contains('/') {
        return None;
    }
    Some(ChangeRequestId::new(*repo, number))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_poller_ps_line() {
        let line = "  4242 Mon Oct 19 10:00:05 2026 /usr/local/bin/prwatch poll acme/widgets 17";
        let p = parse_ps_line(line).unwrap();
        assert_eq!(p.pid, 4242);
        assert_eq!(p.target, ChangeRequestId::new("acme/widgets", 17));
    }

    #[test]
    fn parses_single_digit_day() {
        let line = "77 Sun Oct  4 09:01:02 2026 prwatch poll acme/widgets 3";
        let p = parse_ps_line(line).unwrap();
        assert_eq!(p.pid, 77);
        assert_eq!(p.target.number, 3);
    }

    #[test]
    fn ignores_non_pollers() {
        assert!(parse_ps_line("1 Mon Oct 19 10:00:05 2026 /sbin/init").is_none());
        assert!(parse_ps_line("2 Mon Oct 19 10:00:05 2026 prwatch list").is_none());
        assert!(parse_ps_line("3 Mon Oct 19 10:00:05 2026 vim poll acme/widgets 1").is_none());
        assert!(parse_ps_line("4 Mon Oct 19 10:00:05 2026 prwatch poll widgets 1").is_none());
        assert!(parse_ps_line("garbage").is_none());
    }
}
