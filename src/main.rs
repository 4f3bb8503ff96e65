use std::process::ExitCode;

use mcp_stdio_probe::{config::Config, logging, run};
use tracing::info;

#[tokio::main]
async fn main() -> Result<ExitCode, Box<dyn std::error::Error>> {
    logging::init_logging();

    let config = Config::from_env()?;

    info!(
        interpreter = %config.interpreter,
        server_script = %config.server_script.display(),
        response_timeout_ms = config.response_timeout.as_millis(),
        "probing MCP server"
    );

    let report = run(&config).await?;
    println!("{report}");

    Ok(report.exit_code())
}
