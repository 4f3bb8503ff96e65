use std::{env, path::PathBuf, time::Duration};

use serde_json::{Map, Value};
use thiserror::Error;

use crate::harness::StdoutPolicy;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiagnosticsDisplay {
    OnFailure,
    Always,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub interpreter: String,
    pub server_script: PathBuf,
    pub expected_server_name: String,
    pub response_timeout: Duration,
    pub shutdown_grace: Duration,
    pub stdout_policy: StdoutPolicy,
    pub probe_tool: String,
    pub probe_tool_args: Map<String, Value>,
    pub diagnostics_display: DiagnosticsDisplay,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("MCP_SERVER_INTERPRETER must not be empty")]
    EmptyInterpreter,
    #[error("MCP_RESPONSE_TIMEOUT_MS must be a positive integer")]
    InvalidResponseTimeout,
    #[error("MCP_SHUTDOWN_GRACE_MS must be a non-negative integer")]
    InvalidShutdownGrace,
    #[error("MCP_STDOUT_POLICY must be one of: strict, skip-non-json")]
    InvalidStdoutPolicy,
    #[error("MCP_PROBE_TOOL must not be empty")]
    EmptyProbeTool,
    #[error("MCP_PROBE_TOOL_ARGS must be a JSON object")]
    InvalidProbeToolArgs,
    #[error("MCP_PROBE_SHOW_DIAGNOSTICS must be one of: on-failure, always")]
    InvalidDiagnosticsDisplay,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let read = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        let interpreter = match lookup("MCP_SERVER_INTERPRETER") {
            Some(value) if value.trim().is_empty() => return Err(ConfigError::EmptyInterpreter),
            Some(value) => value.trim().to_string(),
            None => "python3".to_string(),
        };
        let server_script = read("MCP_SERVER_SCRIPT")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("bin").join("mcp-server.py"));
        let expected_server_name =
            read("MCP_EXPECTED_SERVER_NAME").unwrap_or_else(|| "mcp-conductor".to_string());

        let response_timeout = read("MCP_RESPONSE_TIMEOUT_MS")
            .map(|value| {
                value
                    .parse::<u64>()
                    .ok()
                    .filter(|millis| *millis > 0)
                    .ok_or(ConfigError::InvalidResponseTimeout)
            })
            .transpose()?
            .map(Duration::from_millis)
            .unwrap_or(Duration::from_secs(10));
        let shutdown_grace = read("MCP_SHUTDOWN_GRACE_MS")
            .map(|value| {
                value
                    .parse::<u64>()
                    .map_err(|_| ConfigError::InvalidShutdownGrace)
            })
            .transpose()?
            .map(Duration::from_millis)
            .unwrap_or(Duration::from_secs(5));

        let stdout_policy = match read("MCP_STDOUT_POLICY")
            .map(|value| value.to_ascii_lowercase())
            .as_deref()
        {
            None | Some("strict") => StdoutPolicy::Strict,
            Some("skip-non-json") => StdoutPolicy::SkipNonJson,
            Some(_) => return Err(ConfigError::InvalidStdoutPolicy),
        };

        let probe_tool = match lookup("MCP_PROBE_TOOL") {
            Some(value) if value.trim().is_empty() => return Err(ConfigError::EmptyProbeTool),
            Some(value) => value.trim().to_string(),
            None => "get_system_info".to_string(),
        };
        let probe_tool_args = match read("MCP_PROBE_TOOL_ARGS") {
            Some(raw) => match serde_json::from_str::<Value>(&raw) {
                Ok(Value::Object(map)) => map,
                _ => return Err(ConfigError::InvalidProbeToolArgs),
            },
            None => {
                let mut map = Map::new();
                map.insert(
                    "serverName".to_string(),
                    Value::String("localhost".to_string()),
                );
                map
            }
        };

        let diagnostics_display = match read("MCP_PROBE_SHOW_DIAGNOSTICS")
            .map(|value| value.to_ascii_lowercase())
            .as_deref()
        {
            None | Some("on-failure") => DiagnosticsDisplay::OnFailure,
            Some("always") => DiagnosticsDisplay::Always,
            Some(_) => return Err(ConfigError::InvalidDiagnosticsDisplay),
        };

        Ok(Self {
            interpreter,
            server_script,
            expected_server_name,
            response_timeout,
            shutdown_grace,
            stdout_policy,
            probe_tool,
            probe_tool_args,
            diagnostics_display,
        })
    }
}
