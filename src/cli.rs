use clap::Parser;
use eyre::eyre;
use std::collections::HashMap;
use std::time::Duration;

use svharness::ServiceConfig;

type Result<T> = color_eyre::eyre::Result<T>;

/// Runs one supervised test scenario against a service command
#[derive(Parser)]
#[command(name = "svharness")]
#[command(about = "Runs one supervised test scenario against a service command")]
#[command(version)]
pub struct Cli {
    /// Scenario name used in the report
    #[arg(long, default_value = "cli-scenario")]
    pub name: String,

    /// Whole-scenario deadline (seconds)
    #[arg(long, default_value = "60")]
    pub deadline_secs: u64,

    /// Graceful shutdown grace period (seconds)
    #[arg(long, default_value = "5")]
    pub grace_secs: u64,

    /// Readiness wait bound (seconds)
    #[arg(long, default_value = "20")]
    pub ready_timeout_secs: u64,

    /// Skip the readiness wait (for services that print nothing)
    #[arg(long)]
    pub skip_ready: bool,

    /// Executable-name fragment identifying the real service beneath a
    /// wrapper script
    #[arg(long)]
    pub signature: Option<String>,

    /// Environment variables for the service (may repeat)
    #[arg(long = "env", value_name = "KEY=VALUE")]
    pub env: Vec<String>,

    /// Command to execute
    pub command: String,

    /// Arguments for the command
    pub args: Vec<String>,
}

/// Configuration for one scenario run.
#[derive(Debug, Clone)]
pub struct Config {
    pub name: String,
    pub deadline: Duration,
    pub grace: Duration,
    pub skip_ready: bool,
    pub service: ServiceConfig,
}

impl Config {
    /// Parse command line arguments into configuration
    pub fn from_cli(cli: Cli) -> Result<Self> {
        let mut environment = HashMap::new();
        for pair in &cli.env {
            let (key, value) = pair.split_once('=').ok_or_else(|| {
                eyre!("invalid environment variable '{}': expected KEY=VALUE", pair)
            })?;
            environment.insert(key.to_string(), value.to_string());
        }

        Ok(Config {
            name: cli.name,
            deadline: Duration::from_secs(cli.deadline_secs),
            grace: Duration::from_secs(cli.grace_secs),
            skip_ready: cli.skip_ready,
            service: ServiceConfig {
                command: cli.command,
                args: cli.args,
                environment,
                executable_signature: cli.signature,
                readiness_timeout: Duration::from_secs(cli.ready_timeout_secs),
                ..Default::default()
            },
        })
    }
}
