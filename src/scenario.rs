use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use nix::unistd::Pid;
use tokio::sync::Notify;
use tokio::time::{timeout, Instant};
use tracing::{error, info, warn};

use super::Result;
use crate::bus::SessionEvent;
use crate::error::ScenarioError;
use crate::events::{EventAggregator, QuitCondition};
use crate::supervisor::ServiceSupervisor;
use crate::timer::{TimerBackend, TimerWheel};

/// Extra time granted to cleanup beyond the grace period, covering the
/// forceful-kill retries. Cleanup itself must never hang.
const CLEANUP_SLACK: Duration = Duration::from_secs(15);

/// How a scenario ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScenarioOutcome {
    Passed,
    Failed(String),
    DeadlineExpired,
}

/// Everything a scenario leaves behind.
///
/// Captured service output and the event log are attached when the scenario
/// failed or the service exited abnormally; they feed the report-generation
/// collaborator downstream.
#[derive(Debug)]
pub struct ScenarioReport {
    pub name: String,
    pub outcome: ScenarioOutcome,
    /// Pids that ignored the graceful signal. Empty on a clean run; any
    /// entry is a failure annotation in its own right.
    pub unresponsive: Vec<Pid>,
    /// Set when teardown itself errored out or exceeded its time bound.
    /// Processes may still be alive in that case, so this fails the scenario
    /// even when the body passed.
    pub cleanup_failure: Option<String>,
    pub service_output: Vec<String>,
    pub events: Vec<SessionEvent>,
    pub timer_panics: Vec<String>,
    pub duration: Duration,
}

impl ScenarioReport {
    pub fn passed(&self) -> bool {
        self.outcome == ScenarioOutcome::Passed
            && self.unresponsive.is_empty()
            && self.cleanup_failure.is_none()
            && self.timer_panics.is_empty()
    }
}

/// Per-scenario bundle handed to the scenario body.
///
/// Replaces process-wide shared state: the timer wheel, aggregator and
/// supervisor all live and die with this context, so nothing from one
/// scenario can leak into the next.
pub struct ScenarioContext {
    pub timers: TimerWheel,
    pub aggregator: EventAggregator,
    pub supervisor: ServiceSupervisor,
    deadline_at: Instant,
}

impl ScenarioContext {
    /// The whole-scenario deadline, for callers arming their own waits.
    pub fn deadline(&self) -> Instant {
        self.deadline_at
    }

    /// Waits on the aggregator, bounded by the scenario deadline.
    pub async fn collect_until(
        &mut self,
        conditions: &[QuitCondition],
        may_block: bool,
    ) -> Result<usize> {
        self.aggregator
            .collect_until(conditions, may_block, self.deadline_at)
            .await
    }
}

pub type ScenarioFuture<'a> = Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;

/// Composes supervisor, aggregator and timer wheel for one test scenario.
///
/// The body runs under a whole-scenario deadline. Whether the body succeeds,
/// fails, or is aborted by the deadline, the timer is cancelled and the
/// service torn down, with the teardown itself time-bounded.
pub struct ScenarioRunner {
    name: String,
    deadline: Duration,
    grace: Duration,
    wait_ready: bool,
}

impl ScenarioRunner {
    pub fn new(name: impl Into<String>, deadline: Duration, grace: Duration) -> Self {
        Self {
            name: name.into(),
            deadline,
            grace,
            wait_ready: true,
        }
    }

    /// Skips the readiness wait, for services with no output or bus surface.
    pub fn skip_readiness(mut self) -> Self {
        self.wait_ready = false;
        self
    }

    /// Runs one scenario to completion and reports what happened.
    ///
    /// Bodies are written as `fn body(cx: &mut ScenarioContext) ->
    /// ScenarioFuture<'_>` returning `Box::pin(async move { ... })`.
    pub async fn run<B>(
        &self,
        supervisor: ServiceSupervisor,
        aggregator: EventAggregator,
        body: B,
    ) -> ScenarioReport
    where
        B: for<'a> FnOnce(&'a mut ScenarioContext) -> ScenarioFuture<'a>,
    {
        let started = std::time::Instant::now();
        info!(scenario = %self.name, "starting scenario");

        let mut ctx = ScenarioContext {
            timers: TimerWheel::new(),
            aggregator,
            supervisor,
            deadline_at: Instant::now() + self.deadline,
        };

        let outcome = match self.start_service(&mut ctx).await {
            Err(err) => ScenarioOutcome::Failed(format!("service start failed: {err:#}")),
            Ok(()) => {
                // The deadline goes on the thread backend so it fires even if
                // the cooperative loop wedges.
                let expired = Arc::new(Notify::new());
                let notify = expired.clone();
                let deadline_handle =
                    ctx.timers
                        .after(self.deadline, TimerBackend::Thread, move || {
                            notify.notify_one();
                        });

                let body_result = {
                    let fut = body(&mut ctx);
                    tokio::select! {
                        result = fut => Some(result),
                        _ = expired.notified() => None,
                    }
                };
                ctx.timers.cancel(&deadline_handle);

                match body_result {
                    Some(Ok(())) => ScenarioOutcome::Passed,
                    Some(Err(err)) => classify_failure(err),
                    None => {
                        warn!(scenario = %self.name, "scenario deadline fired, aborting body");
                        ScenarioOutcome::DeadlineExpired
                    }
                }
            }
        };

        // Unconditional cleanup, on every exit path, itself time-bounded.
        let exited_early = !ctx.supervisor.is_running();
        let early_status = ctx.supervisor.exit_status();
        let (unresponsive, cleanup_failure) = match timeout(
            self.grace + CLEANUP_SLACK,
            ctx.supervisor.stop(self.grace),
        )
        .await
        {
            Ok(Ok(pids)) => (pids, None),
            Ok(Err(err)) => {
                error!(scenario = %self.name, %err, "service stop failed");
                (Vec::new(), Some(format!("service stop failed: {err:#}")))
            }
            Err(_) => {
                error!(scenario = %self.name, "service stop exceeded its time bound");
                (
                    Vec::new(),
                    Some("service stop exceeded its time bound".to_string()),
                )
            }
        };
        ctx.aggregator.unsubscribe();

        let abnormal_exit = exited_early && early_status.map_or(true, |status| !status.success());
        let failed = outcome != ScenarioOutcome::Passed || cleanup_failure.is_some();
        let (service_output, events) = if failed || abnormal_exit {
            (
                ctx.supervisor.captured_output(),
                ctx.aggregator.events().to_vec(),
            )
        } else {
            (Vec::new(), Vec::new())
        };

        let timer_panics = ctx.timers.take_panics();
        if !unresponsive.is_empty() {
            warn!(scenario = %self.name, ?unresponsive, "processes needed forceful kill");
        }

        let report = ScenarioReport {
            name: self.name.clone(),
            outcome,
            unresponsive,
            cleanup_failure,
            service_output,
            events,
            timer_panics,
            duration: started.elapsed(),
        };
        info!(
            scenario = %report.name,
            outcome = ?report.outcome,
            duration = ?report.duration,
            "scenario finished"
        );
        report
    }

    async fn start_service(&self, ctx: &mut ScenarioContext) -> Result<()> {
        ctx.supervisor.start().await?;
        if self.wait_ready {
            ctx.supervisor.wait_ready().await?;
        }
        Ok(())
    }
}

fn classify_failure(err: eyre::Report) -> ScenarioOutcome {
    match err.downcast_ref::<ScenarioError>() {
        Some(ScenarioError::DeadlineExpired { events, waited }) => {
            warn!(
                ?waited,
                buffered = events.len(),
                "wait hit the scenario deadline"
            );
            ScenarioOutcome::DeadlineExpired
        }
        _ => ScenarioOutcome::Failed(format!("{err:#}")),
    }
}
