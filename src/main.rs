type Result<T> = color_eyre::eyre::Result<T>;

mod cli;

use clap::Parser;
use eyre::eyre;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use svharness::{
    EventAggregator, LoopbackBus, ScenarioContext, ScenarioError, ScenarioFuture, ScenarioRunner,
    ServiceSupervisor,
};

use cli::{Cli, Config};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize error handling and logging
    color_eyre::install()?;

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = Config::from_cli(cli)?;

    info!("svharness starting scenario '{}'", config.name);

    let bus = LoopbackBus::new();
    let aggregator = EventAggregator::subscribe(&bus, "/svharness/session")?;
    let supervisor = ServiceSupervisor::new(config.service.clone());

    let mut runner = ScenarioRunner::new(config.name.clone(), config.deadline, config.grace);
    if config.skip_ready {
        runner = runner.skip_readiness();
    }

    let report = runner.run(supervisor, aggregator, await_service_exit).await;

    if report.passed() {
        info!(
            scenario = %report.name,
            duration = ?report.duration,
            "scenario passed"
        );
        Ok(())
    } else {
        error!(
            scenario = %report.name,
            outcome = ?report.outcome,
            unresponsive = ?report.unresponsive,
            cleanup_failure = ?report.cleanup_failure,
            "scenario failed"
        );
        for line in &report.service_output {
            warn!(target: "svharness::service_output", "{line}");
        }
        for event in &report.events {
            warn!(target: "svharness::bus_traffic", ?event, "buffered event");
        }
        Err(eyre!("scenario '{}' failed: {:?}", report.name, report.outcome))
    }
}

/// Scenario body for the CLI: the service is expected to finish on its own,
/// successfully, before the deadline.
fn await_service_exit(cx: &mut ScenarioContext) -> ScenarioFuture<'_> {
    Box::pin(async move {
        loop {
            if !cx.supervisor.is_running() {
                let code = cx.supervisor.exit_status().and_then(|status| status.code());
                return match code {
                    Some(0) => Ok(()),
                    code => Err(ScenarioError::ServiceExited { code }.into()),
                };
            }
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
    })
}
