use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use eyre::eyre;
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::{getpgid, getpid, Pid};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::oneshot;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::Result;
use crate::error::ScenarioError;
use crate::process_tree::{discover, ProcInspector, ProcessInspector};
use crate::termination::TerminationProtocol;

/// Configuration for one supervised service instance.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Command to execute (may be a wrapper script around the real service).
    pub command: String,
    /// Arguments for the command.
    pub args: Vec<String>,
    /// Environment variables to set on top of the inherited environment.
    pub environment: HashMap<String, String>,
    /// Working directory for the service.
    pub working_directory: Option<PathBuf>,
    /// Executable-name fragment identifying the real service among the
    /// launch handle's descendants. When unset the launch pid is the service.
    pub executable_signature: Option<String>,
    /// Bound on the readiness wait.
    pub readiness_timeout: Duration,
    /// Grace period for tracked auxiliary side-processes, shorter than the
    /// service's own.
    pub aux_grace: Duration,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            command: String::new(),
            args: Vec::new(),
            environment: HashMap::new(),
            working_directory: None,
            executable_signature: None,
            readiness_timeout: Duration::from_secs(20),
            aux_grace: Duration::from_secs(2),
        }
    }
}

/// Owns one external service instance: start, readiness wait, stop.
///
/// The service is started in its own process group so its descendants remain
/// discoverable and killable as a unit even after reparenting. Stopping
/// delegates to [`TerminationProtocol`] over the discovered process tree.
pub struct ServiceSupervisor {
    config: ServiceConfig,
    protocol: TerminationProtocol,
    child: Option<Child>,
    launch_pid: Option<Pid>,
    exit_status: Option<std::process::ExitStatus>,
    output: Arc<Mutex<Vec<String>>>,
    ready_rx: Option<oneshot::Receiver<()>>,
    ready: bool,
    aux_pids: Vec<Pid>,
}

impl ServiceSupervisor {
    pub fn new(config: ServiceConfig) -> Self {
        Self {
            config,
            protocol: TerminationProtocol::default(),
            child: None,
            launch_pid: None,
            exit_status: None,
            output: Arc::new(Mutex::new(Vec::new())),
            ready_rx: None,
            ready: false,
            aux_pids: Vec::new(),
        }
    }

    pub fn with_protocol(mut self, protocol: TerminationProtocol) -> Self {
        self.protocol = protocol;
        self
    }

    /// Spawns the service in a new process group with captured output.
    pub async fn start(&mut self) -> Result<()> {
        if self.child.is_some() {
            return Err(eyre!("service already started"));
        }

        info!("starting service: {} {:?}", self.config.command, self.config.args);

        let mut env_vars = std::env::vars().collect::<HashMap<_, _>>();
        for (key, value) in &self.config.environment {
            env_vars.insert(key.clone(), value.clone());
        }

        let mut command = Command::new(&self.config.command);
        command.args(&self.config.args);

        // New process group with the service as leader: descendants stay
        // discoverable and killable as a unit, and our own signals do not
        // reach the service by accident.
        command.process_group(0);
        command.kill_on_drop(true);
        command.stdin(Stdio::null());
        command.stdout(Stdio::piped());
        command.stderr(Stdio::piped());

        if let Some(ref work_dir) = self.config.working_directory {
            command.current_dir(work_dir);
        }

        command.env_clear();
        for (key, value) in env_vars {
            command.env(key, value);
        }

        let mut child = command.spawn()?;
        let launch_pid = match child.id() {
            Some(pid) => Pid::from_raw(pid.try_into()?),
            None => return Err(eyre!("failed to get service pid")),
        };

        let (ready_tx, ready_rx) = oneshot::channel();
        if let Some(stdout) = child.stdout.take() {
            let output = self.output.clone();
            tokio::spawn(capture_lines(stdout, output, Some(ready_tx)));
        }
        if let Some(stderr) = child.stderr.take() {
            let output = self.output.clone();
            tokio::spawn(capture_lines(stderr, output, None));
        }

        self.child = Some(child);
        self.launch_pid = Some(launch_pid);
        self.exit_status = None;
        self.ready_rx = Some(ready_rx);
        self.ready = false;

        info!("service launched with pid {}", launch_pid);
        Ok(())
    }

    /// Waits for the default readiness precondition: the first line the
    /// service writes to stdout, bounded by the configured timeout.
    pub async fn wait_ready(&mut self) -> Result<()> {
        if self.ready {
            return Ok(());
        }
        let rx = self
            .ready_rx
            .take()
            .ok_or_else(|| eyre!("service not started"))?;
        let started = Instant::now();
        match timeout(self.config.readiness_timeout, rx).await {
            Ok(Ok(())) => {
                self.ready = true;
                debug!(waited = ?started.elapsed(), "service ready");
                Ok(())
            }
            Ok(Err(_)) => {
                // Output stream closed without a single line.
                let code = self
                    .child
                    .as_mut()
                    .and_then(|child| child.try_wait().ok().flatten())
                    .and_then(|status| status.code());
                Err(ScenarioError::ServiceExited { code }.into())
            }
            Err(_) => Err(ScenarioError::ReadinessTimeout {
                waited: started.elapsed(),
            }
            .into()),
        }
    }

    /// Waits for readiness via a caller-supplied probe (typically a trivial
    /// remote call), retried until it succeeds or the timeout elapses.
    pub async fn wait_ready_with<F, Fut>(&mut self, mut probe: F) -> Result<()>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<()>>,
    {
        let started = Instant::now();
        loop {
            if probe().await.is_ok() {
                self.ready = true;
                self.ready_rx = None;
                debug!(waited = ?started.elapsed(), "service ready (probe)");
                return Ok(());
            }
            if started.elapsed() >= self.config.readiness_timeout {
                return Err(ScenarioError::ReadinessTimeout {
                    waited: started.elapsed(),
                }
                .into());
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    pub fn pid(&self) -> Option<Pid> {
        self.launch_pid
    }

    pub fn is_running(&mut self) -> bool {
        match self.child {
            Some(ref mut child) => match child.try_wait() {
                Ok(Some(status)) => {
                    self.exit_status = Some(status);
                    false
                }
                Ok(None) => true,
                Err(_) => false,
            },
            None => false,
        }
    }

    /// Exit status observed for the launch handle, if it has been reaped.
    pub fn exit_status(&self) -> Option<std::process::ExitStatus> {
        self.exit_status
    }

    /// Lines the service has written so far, in arrival order.
    pub fn captured_output(&self) -> Vec<String> {
        self.output.lock().expect("output buffer poisoned").clone()
    }

    /// Registers a separately-launched side-process (log capture and the
    /// like) to be torn down with the shorter auxiliary grace period.
    pub fn track_aux_pid(&mut self, pid: Pid) {
        self.aux_pids.push(pid);
    }

    /// Stops the service and everything it owns.
    ///
    /// Tracked auxiliary pids come down first with their own grace period.
    /// The real service pid is resolved by executable signature (the launch
    /// handle may be a wrapper script), its tree discovered, and the
    /// escalation protocol run on a blocking thread so a stuck event loop
    /// cannot stall cleanup. Returns every pid that needed a forceful kill.
    pub async fn stop(&mut self, grace: Duration) -> Result<Vec<Pid>> {
        // launch_pid stays set until the protocol has run, so an early error
        // below still leaves Drop able to reach the whole group.
        let Some(launch_pid) = self.launch_pid else {
            return Ok(Vec::new());
        };

        let mut unresponsive = Vec::new();
        let harness_pid = getpid();
        let aux_pids = std::mem::take(&mut self.aux_pids);

        for &aux_pid in &aux_pids {
            let set = discover(&ProcInspector, aux_pid, &[], &[harness_pid])?;
            let protocol = self.protocol.clone();
            let aux_grace = self.config.aux_grace;
            let killed =
                tokio::task::spawn_blocking(move || protocol.shutdown(&set, aux_grace)).await?;
            unresponsive.extend(killed);
        }

        let service_pid = self.resolve_service_pid(&ProcInspector, launch_pid)?;
        let launch_group = getpgid(Some(launch_pid)).unwrap_or(launch_pid);
        let mut excluded = aux_pids;
        excluded.push(harness_pid);
        let set = discover(
            &ProcInspector,
            service_pid,
            &[launch_pid, launch_group],
            &excluded,
        )?;

        let protocol = self.protocol.clone();
        let killed = tokio::task::spawn_blocking(move || protocol.shutdown(&set, grace)).await?;
        unresponsive.extend(killed);

        // Reap the launch handle; after the protocol ran it is either exited
        // or already gone.
        if let Some(mut child) = self.child.take() {
            if let Ok(Ok(status)) = timeout(Duration::from_secs(1), child.wait()).await {
                self.exit_status = Some(status);
            }
        }
        self.launch_pid = None;

        if unresponsive.is_empty() {
            info!("service stopped cleanly");
        } else {
            warn!(?unresponsive, "service shutdown needed forceful kills");
        }
        Ok(unresponsive)
    }

    /// Resolves the real service pid beneath a wrapper script by matching the
    /// executable signature against descendant command lines.
    fn resolve_service_pid(
        &self,
        inspector: &dyn ProcessInspector,
        launch_pid: Pid,
    ) -> Result<Pid> {
        let Some(ref signature) = self.config.executable_signature else {
            return Ok(launch_pid);
        };
        let set = discover(inspector, launch_pid, &[], &[])?;
        for record in set.records() {
            let matches = record
                .cmdline
                .split_whitespace()
                .next()
                .map_or(false, |exe| exe.contains(signature.as_str()));
            if matches {
                if record.pid != launch_pid {
                    debug!(
                        launch = %launch_pid,
                        resolved = %record.pid,
                        "resolved service pid beneath wrapper"
                    );
                }
                return Ok(record.pid);
            }
        }
        warn!(%signature, "no process matched executable signature, using launch pid");
        Ok(launch_pid)
    }
}

impl Drop for ServiceSupervisor {
    fn drop(&mut self) {
        // Emergency cleanup when the supervisor is dropped with a live
        // service: SIGKILL the whole group, no graceful escalation in Drop.
        if let Some(pid) = self.launch_pid {
            if self.exit_status.is_none() {
                match kill(Pid::from_raw(-pid.as_raw()), Signal::SIGKILL) {
                    Ok(()) | Err(Errno::ESRCH) => {}
                    Err(err) => {
                        eprintln!("emergency kill of service group {pid} failed: {err}");
                    }
                }
            }
        }
    }
}

/// Appends each line of `reader` to the shared capture buffer; the first
/// line also resolves the readiness signal.
async fn capture_lines<R>(
    reader: R,
    output: Arc<Mutex<Vec<String>>>,
    mut ready_tx: Option<oneshot::Sender<()>>,
) where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        debug!(target: "svharness::service_output", "{line}");
        output
            .lock()
            .expect("output buffer poisoned")
            .push(line);
        if let Some(tx) = ready_tx.take() {
            let _ = tx.send(());
        }
    }
}
