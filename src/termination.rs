use std::collections::HashMap;
use std::fs;
use std::thread;
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use tracing::{debug, info, warn};

use crate::process_tree::ProcessSet;

/// What happened to one process during shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationOutcome {
    /// Exited (or vanished) within the grace period.
    ExitedNormally,
    /// Needed the forceful signal.
    KilledForcefully,
    /// Reparented away from us; not waitable, tracked by existence probing
    /// until it disappears. No exit status is ever observed for these.
    ReparentedPending,
}

/// Escalating shutdown over a discovered process set.
///
/// Sends the graceful signal once to every member, polls with bounded sleeps
/// until the grace period elapses, then forcefully kills the survivors. The
/// poll loop sleeps the plain thread rather than the event loop so cleanup
/// still works when the loop is stuck.
#[derive(Debug, Clone)]
pub struct TerminationProtocol {
    pub graceful: Signal,
    pub forceful: Signal,
    pub poll_interval: Duration,
    pub kill_retry_interval: Duration,
    pub kill_retries: u32,
}

impl Default for TerminationProtocol {
    fn default() -> Self {
        Self {
            graceful: Signal::SIGTERM,
            forceful: Signal::SIGKILL,
            poll_interval: Duration::from_millis(100),
            kill_retry_interval: Duration::from_millis(100),
            kill_retries: 50,
        }
    }
}

impl TerminationProtocol {
    /// Shuts down every process in `set`, returning the pids that survived
    /// the graceful signal and had to be killed forcefully.
    ///
    /// An empty return value means the clean path succeeded; anything else is
    /// always treated as a scenario-level failure by the caller.
    pub fn shutdown(&self, set: &ProcessSet, grace: Duration) -> Vec<Pid> {
        if set.is_empty() {
            return Vec::new();
        }

        let mut outcomes: HashMap<Pid, TerminationOutcome> = HashMap::new();
        let mut pending: Vec<Pid> = Vec::new();

        info!(root = %set.root(), count = set.len(), ?grace, "shutting down process set");
        for pid in set.pids() {
            match kill(pid, self.graceful) {
                Ok(()) => pending.push(pid),
                Err(Errno::ESRCH) => {
                    // Gone before we signalled; that is success.
                    outcomes.insert(pid, TerminationOutcome::ExitedNormally);
                }
                Err(err) => {
                    warn!(%pid, %err, "failed to send graceful signal");
                    pending.push(pid);
                }
            }
        }

        let deadline = Instant::now() + grace;
        while !pending.is_empty() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            thread::sleep(remaining.min(self.poll_interval));
            pending.retain(|&pid| match probe(pid) {
                Probe::Alive => true,
                Probe::AliveReparented => {
                    outcomes.insert(pid, TerminationOutcome::ReparentedPending);
                    true
                }
                Probe::Gone => {
                    debug!(%pid, "exited within grace period");
                    outcomes.insert(pid, TerminationOutcome::ExitedNormally);
                    false
                }
            });
        }

        if pending.is_empty() {
            debug!(?outcomes, "graceful shutdown complete");
            return Vec::new();
        }

        // Grace elapsed; capture diagnostics, then escalate.
        for &pid in &pending {
            log_stuck_process(pid);
        }

        let unresponsive = pending.clone();
        for attempt in 0..self.kill_retries {
            pending.retain(|&pid| {
                match kill(pid, self.forceful) {
                    Ok(()) => {}
                    Err(Errno::ESRCH) => return false,
                    Err(err) => warn!(%pid, %err, "failed to send forceful signal"),
                }
                match probe(pid) {
                    Probe::Gone => false,
                    _ => true,
                }
            });
            if pending.is_empty() {
                break;
            }
            debug!(attempt, survivors = pending.len(), "retrying forceful kill");
            thread::sleep(self.kill_retry_interval);
        }

        for &pid in &unresponsive {
            outcomes.insert(pid, TerminationOutcome::KilledForcefully);
        }
        if pending.is_empty() {
            warn!(?unresponsive, "processes required forceful kill");
        } else {
            warn!(?pending, "processes survived forceful kill retries");
        }
        debug!(?outcomes, "shutdown outcomes");
        unresponsive
    }
}

enum Probe {
    Alive,
    AliveReparented,
    Gone,
}

/// Existence check that never treats a vanished process as an error.
///
/// True children are reaped with a non-blocking `waitpid`; grandchildren are
/// not waitable, so their liveness is probed with a null signal instead.
fn probe(pid: Pid) -> Probe {
    match waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
        Ok(WaitStatus::StillAlive) => Probe::Alive,
        Ok(_) => Probe::Gone,
        Err(Errno::ECHILD) => match kill(pid, None) {
            Ok(()) => Probe::AliveReparented,
            Err(Errno::ESRCH) => Probe::Gone,
            // EPERM still proves existence.
            Err(_) => Probe::AliveReparented,
        },
        Err(Errno::ESRCH) => Probe::Gone,
        Err(_) => Probe::Alive,
    }
}

/// Best-effort diagnostic for a process that ignored the graceful signal,
/// taken before it is killed and the evidence disappears.
fn log_stuck_process(pid: Pid) {
    let wchan = fs::read_to_string(format!("/proc/{pid}/wchan")).unwrap_or_default();
    let stat = fs::read_to_string(format!("/proc/{pid}/stat")).unwrap_or_default();
    let state = stat
        .rfind(')')
        .and_then(|i| stat[i + 1..].split_whitespace().next())
        .unwrap_or("?")
        .to_string();
    let cmdline = fs::read(format!("/proc/{pid}/cmdline"))
        .map(|raw| String::from_utf8_lossy(&raw).replace('\0', " "))
        .unwrap_or_default();
    warn!(
        %pid,
        %state,
        wchan = wchan.trim(),
        cmdline = cmdline.trim(),
        "process ignored graceful signal"
    );
}
