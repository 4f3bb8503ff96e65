use std::io;

use tracing::{error, info, warn};

pub mod config;
pub mod errors;
pub mod harness;
pub mod logging;
pub mod mcp;
pub mod report;

#[cfg(test)]
mod test_support;

use config::Config;
use errors::HarnessError;
use harness::StdioHarness;
use mcp::scenarios::{default_scenarios, Scenario};
use report::{RunReport, ScenarioOutcome};

/// Runs the default probe script against the configured server.
pub async fn run(config: &Config) -> Result<RunReport, HarnessError> {
    run_scenarios(config, &default_scenarios(config)).await
}

/// Launches the server, runs `scenarios` in order and always shuts the server down.
///
/// Only a launch failure is returned as an error; everything after launch ends up
/// in the report. The first failing scenario stops the script and the remaining
/// ones are reported as skipped.
pub async fn run_scenarios(
    config: &Config,
    scenarios: &[Box<dyn Scenario>],
) -> Result<RunReport, HarnessError> {
    if !config.server_script.exists() {
        return Err(HarnessError::launch(
            config.server_script.display().to_string(),
            io::Error::new(io::ErrorKind::NotFound, "server script not found"),
        ));
    }

    let mut harness = StdioHarness::start(&config.interpreter, [&config.server_script])?
        .with_policy(config.stdout_policy);
    let mut report = RunReport::new(config.diagnostics_display);
    let mut stopped = false;

    for scenario in scenarios {
        if stopped {
            report.push(ScenarioOutcome::skipped(scenario.name()));
            continue;
        }

        match scenario.run(&mut harness, config.response_timeout).await {
            Ok(detail) => {
                info!(scenario = scenario.name(), "scenario passed");
                report.push(ScenarioOutcome::passed(scenario.name(), detail));
            }
            Err(failure) => {
                warn!(
                    scenario = scenario.name(),
                    kind = failure.kind(),
                    error = %failure,
                    "scenario failed"
                );
                report.push(ScenarioOutcome::failed(
                    scenario.name(),
                    failure.kind(),
                    failure.to_string(),
                ));
                stopped = true;
            }
        }
    }

    match harness.shutdown(config.shutdown_grace).await {
        Ok(shutdown) => {
            report.diagnostics = shutdown.diagnostics.clone();
            report.shutdown = Some(shutdown);
        }
        Err(err) => {
            error!(error = %err, "server shutdown failed");
            report.diagnostics = err.diagnostics().unwrap_or_default().to_string();
            report.shutdown_error = Some(err.to_string());
        }
    }

    Ok(report)
}
