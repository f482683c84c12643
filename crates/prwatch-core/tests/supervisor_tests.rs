use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::Result;
use chrono::{TimeZone, Utc};
use prwatch_core::supervisor::{
    MonitorLease, MonitorProcess, ProcessRegistry, Signal, Supervisor, SupervisorError,
};
use prwatch_core::ChangeRequestId;

// ── fake registry ────────────────────────────────────────────────────────────

struct FakeProc {
    target: ChangeRequestId,
    started: i64,
    /// Stubborn processes ignore SIGTERM.
    stubborn: bool,
    /// Zombies survive even SIGKILL.
    zombie: bool,
}

#[derive(Default)]
struct FakeRegistry {
    procs: Mutex<BTreeMap<u32, FakeProc>>,
    next_pid: Mutex<u32>,
    signals: Mutex<Vec<(u32, Signal)>>,
}

impl FakeRegistry {
    fn with(procs: &[(u32, &ChangeRequestId, i64)]) -> Self {
        let reg = Self::default();
        for (pid, target, started) in procs {
            reg.insert(*pid, target, *started, false);
        }
        *reg.next_pid.lock().unwrap() = 1000;
        reg
    }

    fn insert(&self, pid: u32, target: &ChangeRequestId, started: i64, stubborn: bool) {
        self.procs.lock().unwrap().insert(
            pid,
            FakeProc {
                target: target.clone(),
                started,
                stubborn,
                zombie: false,
            },
        );
    }

    fn live_pids(&self) -> Vec<u32> {
        self.procs.lock().unwrap().keys().copied().collect()
    }
}

impl ProcessRegistry for FakeRegistry {
    fn list(&self) -> Result<Vec<MonitorProcess>> {
        Ok(self
            .procs
            .lock()
            .unwrap()
            .iter()
            .map(|(pid, p)| MonitorProcess {
                pid: *pid,
                started_at: Utc.timestamp_opt(p.started, 0).unwrap(),
                target: p.target.clone(),
            })
            .collect())
    }

    fn spawn(&self, id: &ChangeRequestId) -> Result<u32> {
        let mut next = self.next_pid.lock().unwrap();
        *next += 1;
        let pid = *next;
        self.insert(pid, id, 2_000_000_000, false);
        Ok(pid)
    }

    fn signal(&self, pid: u32, signal: Signal) -> Result<()> {
        self.signals.lock().unwrap().push((pid, signal));
        let mut procs = self.procs.lock().unwrap();
        let remove = match procs.get(&pid) {
            Some(p) if p.zombie => false,
            Some(p) => signal == Signal::Kill || !p.stubborn,
            None => false,
        };
        if remove {
            procs.remove(&pid);
        }
        Ok(())
    }

    fn is_alive(&self, pid: u32) -> bool {
        self.procs.lock().unwrap().contains_key(&pid)
    }
}

fn cr(n: u64) -> ChangeRequestId {
    ChangeRequestId::new("acme/widgets", n)
}

fn supervisor(reg: FakeRegistry) -> Supervisor<FakeRegistry> {
    Supervisor::new(reg, Duration::from_millis(50))
}

// ── tests ────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn start_refuses_when_a_poller_exists() {
    let sup = supervisor(FakeRegistry::with(&[(10, &cr(1), 100)]));
    assert!(sup.is_running(&cr(1)).unwrap());

    let err = sup.start(&cr(1)).unwrap_err();
    match err {
        SupervisorError::AlreadyRunning { id, pids } => {
            assert_eq!(id, cr(1));
            assert_eq!(pids, vec![10]);
        }
        other => panic!("expected AlreadyRunning, got {other}"),
    }
    assert_eq!(sup.registry().live_pids(), vec![10]);
}

#[tokio::test]
async fn start_spawns_when_idle() {
    let sup = supervisor(FakeRegistry::with(&[(10, &cr(1), 100)]));
    let pid = sup.start(&cr(2)).unwrap();
    assert!(sup.is_running(&cr(2)).unwrap());
    assert_eq!(sup.registry().live_pids(), vec![10, pid]);
}

#[tokio::test]
async fn cleanup_keeps_only_the_earliest_started() {
    let sup = supervisor(FakeRegistry::with(&[
        (30, &cr(1), 300),
        (20, &cr(1), 100),
        (40, &cr(1), 200),
        (50, &cr(2), 50),
    ]));
    let mut killed = sup.cleanup().await.unwrap();
    killed.sort();
    assert_eq!(killed, vec![30, 40]);
    assert_eq!(sup.registry().live_pids(), vec![20, 50]);
}

#[tokio::test]
async fn cleanup_tie_breaks_on_lowest_pid() {
    let sup = supervisor(FakeRegistry::with(&[(31, &cr(1), 100), (17, &cr(1), 100)]));
    assert_eq!(sup.cleanup().await.unwrap(), vec![31]);
    assert_eq!(sup.registry().live_pids(), vec![17]);
}

#[tokio::test]
async fn stop_terminates_all_matches_and_escalates() {
    let reg = FakeRegistry::with(&[(10, &cr(1), 100), (50, &cr(2), 100)]);
    reg.insert(11, &cr(1), 200, true);
    let sup = supervisor(reg);

    assert_eq!(sup.stop(&cr(1)).await.unwrap(), 2);
    assert_eq!(sup.registry().live_pids(), vec![50]);

    let signals = sup.registry().signals.lock().unwrap().clone();
    assert!(signals.contains(&(10, Signal::Terminate)));
    assert!(signals.contains(&(11, Signal::Terminate)));
    assert!(signals.contains(&(11, Signal::Kill)));
    assert!(!signals.contains(&(10, Signal::Kill)));
}

#[tokio::test]
async fn stop_reports_survivors() {
    let reg = FakeRegistry::with(&[]);
    reg.insert(10, &cr(1), 100, true);
    reg.procs.lock().unwrap().get_mut(&10).unwrap().zombie = true;
    let sup = supervisor(reg);

    let err = sup.stop(&cr(1)).await.unwrap_err();
    assert!(matches!(err, SupervisorError::StillRunning { ref pids, .. } if pids == &vec![10]));
}

#[tokio::test]
async fn stop_with_nothing_running_is_a_noop() {
    let sup = supervisor(FakeRegistry::with(&[]));
    assert_eq!(sup.stop(&cr(1)).await.unwrap(), 0);
}

#[tokio::test]
async fn lease_view_follows_supervisor() {
    let sup = supervisor(FakeRegistry::with(&[]));
    let lease: &dyn MonitorLease = &sup;
    lease.try_acquire(&cr(3)).await.unwrap();
    assert!(matches!(
        lease.try_acquire(&cr(3)).await,
        Err(SupervisorError::AlreadyRunning { .. })
    ));
    assert_eq!(lease.list_holders().await.unwrap().len(), 1);
    assert_eq!(lease.release(&cr(3)).await.unwrap(), 1);
    assert!(lease.list_holders().await.unwrap().is_empty());
}
