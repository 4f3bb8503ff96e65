//! Scripted probe scenarios
//!
//! Each scenario issues one request over the harness and checks the shape of the
//! result. The default script runs `initialize`, `tools/list` and `tools/call`.

use std::time::Duration;

use async_trait::async_trait;
use rust_mcp_sdk::schema::ProtocolVersion;
use serde_json::{json, Map, Value};
use thiserror::Error;

use crate::{
    config::Config,
    errors::HarnessError,
    harness::StdioHarness,
    mcp::rpc::{Response, RpcErrorPayload},
};

pub const CLIENT_NAME: &str = "test-client";
pub const CLIENT_VERSION: &str = "1.0.0";
const PREVIEW_CHARS: usize = 100;

static NULL: Value = Value::Null;

#[derive(Debug, Error)]
pub enum ScenarioFailure {
    #[error(transparent)]
    Harness(#[from] HarnessError),
    #[error("server answered with error: {0}")]
    ErrorResponse(RpcErrorPayload),
    #[error("unexpected response: expected {expected}, received {received}")]
    UnexpectedShape { expected: String, received: Value },
}

impl ScenarioFailure {
    fn unexpected(expected: impl Into<String>, received: &Value) -> Self {
        Self::UnexpectedShape {
            expected: expected.into(),
            received: received.clone(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Harness(err) => err.kind(),
            Self::ErrorResponse(_) => "error_response",
            Self::UnexpectedShape { .. } => "unexpected_shape",
        }
    }
}

#[async_trait]
pub trait Scenario: Send + Sync {
    fn name(&self) -> &str;

    /// Runs the check and returns a human-readable detail line on success.
    async fn run(
        &self,
        harness: &mut StdioHarness,
        timeout: Duration,
    ) -> Result<String, ScenarioFailure>;
}

pub fn default_scenarios(config: &Config) -> Vec<Box<dyn Scenario>> {
    vec![
        Box::new(InitializeScenario::new(config.expected_server_name.clone())),
        Box::new(ListToolsScenario),
        Box::new(CallToolScenario::new(
            config.probe_tool.clone(),
            config.probe_tool_args.clone(),
        )),
    ]
}

fn into_result(response: Response) -> Result<Value, ScenarioFailure> {
    response.into_result().map_err(ScenarioFailure::ErrorResponse)
}

fn non_empty_str<'a>(value: &'a Value, key: &str) -> Option<&'a str> {
    value
        .get(key)
        .and_then(Value::as_str)
        .filter(|text| !text.is_empty())
}

pub struct InitializeScenario {
    expected_server_name: String,
}

impl InitializeScenario {
    pub fn new(expected_server_name: impl Into<String>) -> Self {
        Self {
            expected_server_name: expected_server_name.into(),
        }
    }

    pub fn params() -> Map<String, Value> {
        let protocol_version: String = ProtocolVersion::V2024_11_05.into();
        let mut params = Map::new();
        params.insert("protocolVersion".to_string(), Value::String(protocol_version));
        params.insert("capabilities".to_string(), json!({}));
        params.insert(
            "clientInfo".to_string(),
            json!({ "name": CLIENT_NAME, "version": CLIENT_VERSION }),
        );
        params
    }
}

#[async_trait]
impl Scenario for InitializeScenario {
    fn name(&self) -> &str {
        "initialize"
    }

    async fn run(
        &self,
        harness: &mut StdioHarness,
        timeout: Duration,
    ) -> Result<String, ScenarioFailure> {
        let response = harness
            .call("initialize", Some(Self::params()), timeout)
            .await?;
        let result = into_result(response)?;

        let server_info = result.get("serverInfo").unwrap_or(&NULL);
        if non_empty_str(server_info, "name") != Some(self.expected_server_name.as_str()) {
            return Err(ScenarioFailure::unexpected(
                format!("result.serverInfo.name == {:?}", self.expected_server_name),
                &result,
            ));
        }

        harness.notify("notifications/initialized", None).await?;

        Ok(format!(
            "server {} {} speaks protocol {}",
            self.expected_server_name,
            non_empty_str(server_info, "version").unwrap_or("(no version)"),
            non_empty_str(&result, "protocolVersion").unwrap_or("(unspecified)"),
        ))
    }
}

pub struct ListToolsScenario;

#[async_trait]
impl Scenario for ListToolsScenario {
    fn name(&self) -> &str {
        "tools/list"
    }

    async fn run(
        &self,
        harness: &mut StdioHarness,
        timeout: Duration,
    ) -> Result<String, ScenarioFailure> {
        let response = harness.call("tools/list", None, timeout).await?;
        let result = into_result(response)?;

        let Some(tools) = result.get("tools").and_then(Value::as_array) else {
            return Err(ScenarioFailure::unexpected("result.tools array", &result));
        };

        let mut detail = format!("found {} tools", tools.len());
        for tool in tools {
            let (Some(name), Some(description)) =
                (non_empty_str(tool, "name"), non_empty_str(tool, "description"))
            else {
                return Err(ScenarioFailure::unexpected(
                    "every tool to have a non-empty name and description",
                    tool,
                ));
            };
            detail.push_str(&format!("\n  - {name}: {description}"));
        }

        Ok(detail)
    }
}

pub struct CallToolScenario {
    tool: String,
    arguments: Map<String, Value>,
}

impl CallToolScenario {
    pub fn new(tool: impl Into<String>, arguments: Map<String, Value>) -> Self {
        Self {
            tool: tool.into(),
            arguments,
        }
    }
}

#[async_trait]
impl Scenario for CallToolScenario {
    fn name(&self) -> &str {
        "tools/call"
    }

    async fn run(
        &self,
        harness: &mut StdioHarness,
        timeout: Duration,
    ) -> Result<String, ScenarioFailure> {
        let mut params = Map::new();
        params.insert("name".to_string(), Value::String(self.tool.clone()));
        params.insert(
            "arguments".to_string(),
            Value::Object(self.arguments.clone()),
        );

        let response = harness.call("tools/call", Some(params), timeout).await?;
        let result = into_result(response)?;

        if result.get("isError").and_then(Value::as_bool) == Some(true) {
            return Err(ScenarioFailure::unexpected(
                format!("tool `{}` to succeed", self.tool),
                &result,
            ));
        }

        let first = result
            .get("content")
            .and_then(Value::as_array)
            .and_then(|content| content.first())
            .unwrap_or(&NULL);
        let Some(text) = non_empty_str(first, "text") else {
            return Err(ScenarioFailure::unexpected(
                "non-empty result.content[0].text",
                &result,
            ));
        };

        let mut preview: String = text.chars().take(PREVIEW_CHARS).collect();
        if text.chars().count() > PREVIEW_CHARS {
            preview.push_str("...");
        }
        Ok(format!("tool `{}` answered: {preview}", self.tool))
    }
}
