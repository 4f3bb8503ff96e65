//! JSON-RPC message representations for the line-delimited stdio transport
//!
//! Outgoing messages are serialized one per line; incoming lines are classified
//! into responses, server notifications, or blank reads.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::errors::HarnessError;

pub const JSONRPC_VERSION: &str = "2.0";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub jsonrpc: String,
    pub id: u64,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Map<String, Value>>,
}

impl Request {
    pub fn new(id: u64, method: impl Into<String>, params: Option<Map<String, Value>>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            method: method.into(),
            params,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub jsonrpc: String,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Map<String, Value>>,
}

impl Notification {
    pub fn new(method: impl Into<String>, params: Option<Map<String, Value>>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: method.into(),
            params,
        }
    }
}

/// Error member of a JSON-RPC response. Only `message` is mandatory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcErrorPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<i64>,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl fmt::Display for RpcErrorPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.code {
            Some(code) => write!(f, "{} (code {code})", self.message),
            None => f.write_str(&self.message),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ResponseOutcome {
    Result(Value),
    Error(RpcErrorPayload),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub id: u64,
    pub outcome: ResponseOutcome,
}

impl Response {
    pub fn result(&self) -> Option<&Value> {
        match &self.outcome {
            ResponseOutcome::Result(value) => Some(value),
            ResponseOutcome::Error(_) => None,
        }
    }

    pub fn into_result(self) -> Result<Value, RpcErrorPayload> {
        match self.outcome {
            ResponseOutcome::Result(value) => Ok(value),
            ResponseOutcome::Error(error) => Err(error),
        }
    }
}

/// Classification of one line read from the child's stdout.
#[derive(Debug, Clone, PartialEq)]
pub enum Incoming {
    Response(Response),
    Notification { method: String },
    Blank,
}

pub fn serialize_line<T: Serialize>(message: &T) -> Result<String, serde_json::Error> {
    let mut line = serde_json::to_string(message)?;
    line.push('\n');
    Ok(line)
}

pub fn parse_line(line: &str) -> Result<Incoming, HarnessError> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Ok(Incoming::Blank);
    }

    let value: Value = serde_json::from_str(trimmed)
        .map_err(|err| HarnessError::protocol(format!("invalid JSON: {err}"), trimmed))?;
    let Some(object) = value.as_object() else {
        return Err(HarnessError::protocol("message is not a JSON object", trimmed));
    };

    if object.get("jsonrpc").and_then(Value::as_str) != Some(JSONRPC_VERSION) {
        return Err(HarnessError::protocol(
            "missing or unsupported jsonrpc version",
            trimmed,
        ));
    }

    if let Some(method) = object.get("method") {
        let method = method.as_str().unwrap_or_default().to_string();
        if object.contains_key("id") {
            return Err(HarnessError::protocol(
                format!("unexpected server-to-client request `{method}`"),
                trimmed,
            ));
        }
        return Ok(Incoming::Notification { method });
    }

    let id = object
        .get("id")
        .and_then(Value::as_u64)
        .ok_or_else(|| HarnessError::protocol("response id must be a non-negative integer", trimmed))?;

    let outcome = match (object.get("result"), object.get("error")) {
        (Some(result), None) => ResponseOutcome::Result(result.clone()),
        (None, Some(error)) => {
            let payload = serde_json::from_value::<RpcErrorPayload>(error.clone()).map_err(|_| {
                HarnessError::protocol("error member must carry a string message", trimmed)
            })?;
            ResponseOutcome::Error(payload)
        }
        (Some(_), Some(_)) => {
            return Err(HarnessError::protocol(
                "response carries both result and error",
                trimmed,
            ))
        }
        (None, None) => {
            return Err(HarnessError::protocol(
                "response carries neither result nor error",
                trimmed,
            ))
        }
    };

    Ok(Incoming::Response(Response { id, outcome }))
}
