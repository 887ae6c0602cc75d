//! Load test runner binary
//!
//! Runs the configured load test against a fleet, once per disruption
//! pattern (the control run first, when enabled), and prints one JSON report
//! per run.
//!
//! Usage: loadtest <CONFIG> [--pattern NAME] [--report FILE]
//!
//! A pattern whose run cannot start (failed reset or resync) is reported as
//! aborted and the remaining patterns still run. Exits non-zero when any run
//! fails its verdict or is aborted.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use serde::Serialize;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use ledger_loadtest::collab::{DockerActuator, HttpConnector};
use ledger_loadtest::{LoadTestConfig, RunCoordinator, RunResult};

#[derive(Parser, Debug)]
#[command(name = "loadtest", about = "Load and disruption testing for ledger fleets")]
struct Cli {
    /// Run configuration file (TOML), merged over the built-in defaults
    config: PathBuf,

    /// Only run the named pattern ("control" selects the control run)
    #[arg(long)]
    pattern: Option<String>,

    /// Also write every report, and every aborted pattern, to this file as JSON
    #[arg(long)]
    report: Option<PathBuf>,
}

/// A pattern whose run never started
#[derive(Serialize, Debug)]
struct AbortedRun {
    pattern: String,
    error: String,
}

/// Contents of the `--report` file
#[derive(Serialize)]
struct SessionReport<'a> {
    runs: &'a [RunResult],
    aborted: &'a [AbortedRun],
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::from(2)
        }
    }
}

/// Returns whether every run passed
async fn run(cli: Cli) -> Result<bool> {
    let config = LoadTestConfig::load(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    let coordinator_config = config.coordinator_config();

    let directory = Arc::new(config.directory()?);
    let connector = Arc::new(HttpConnector::new(
        coordinator_config.execution_timeout,
        config.fleet.operator.clone(),
    )?);
    let actuator = Arc::new(DockerActuator::new(config.containers()));
    let coordinator = RunCoordinator::new(directory, connector, actuator, coordinator_config);

    let mut patterns = config.patterns();
    if let Some(name) = &cli.pattern {
        patterns.retain(|p| &p.name == name);
        if patterns.is_empty() {
            bail!("no pattern named '{}'", name);
        }
    }

    let test = config.test.build();
    let mut reports: Vec<RunResult> = Vec::with_capacity(patterns.len());
    let mut aborted: Vec<AbortedRun> = Vec::new();
    for pattern in &patterns {
        match coordinator.run(test.clone(), &config.run, pattern).await {
            Ok(result) => {
                println!("{}", serde_json::to_string_pretty(&result)?);
                reports.push(result);
            }
            Err(e) => {
                error!(pattern = %pattern.name, error = %e, "run aborted");
                aborted.push(AbortedRun {
                    pattern: pattern.name.clone(),
                    error: e.to_string(),
                });
            }
        }
    }

    let failed: Vec<&str> = reports
        .iter()
        .filter(|r| !r.passed)
        .map(|r| r.pattern.as_str())
        .collect();
    info!(
        runs = reports.len(),
        failed = failed.len(),
        aborted = aborted.len(),
        "all runs finished"
    );
    if !failed.is_empty() {
        error!(patterns = ?failed, "runs failed");
    }

    if let Some(path) = &cli.report {
        let session = SessionReport {
            runs: &reports,
            aborted: &aborted,
        };
        let json = serde_json::to_string_pretty(&session)?;
        std::fs::write(path, json).with_context(|| format!("writing {}", path.display()))?;
    }

    Ok(failed.is_empty() && aborted.is_empty())
}
