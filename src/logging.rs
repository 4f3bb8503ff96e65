use std::time::Instant;

use serde_json::Value;
use tracing::{debug, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

pub fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .compact()
        .init();
}

pub fn log_outgoing(id: Option<u64>, method: &str, params: Option<&Value>) {
    debug!(
        id = ?id,
        method = %method,
        params = %redact_params(params),
        "message sent"
    );
}

pub fn exchange_summary(id: u64, method: &str, started_at: Instant, outcome: &str) {
    let elapsed_ms = started_at.elapsed().as_millis();

    info!(
        id = id,
        method = %method,
        outcome = outcome,
        duration_ms = elapsed_ms,
        "exchange summary"
    );

    if outcome == "timeout" {
        warn!(id = id, method = %method, "child did not answer in time");
    }
}

/// Key fragments whose values never reach the logs. Keys are compared with
/// case and separators removed, so `api_key`, `apiKey` and `API-KEY` all match.
const SECRET_KEY_FRAGMENTS: &[&str] = &[
    "apikey",
    "authorization",
    "bearer",
    "credential",
    "password",
    "secret",
    "token",
];

const REDACTED: &str = "[REDACTED]";

pub fn redact_params(params: Option<&Value>) -> Value {
    let mut redacted = params.cloned().unwrap_or(Value::Null);
    mask_secrets(&mut redacted);
    redacted
}

fn mask_secrets(value: &mut Value) {
    match value {
        Value::Object(map) => {
            for (key, item) in map.iter_mut() {
                if is_sensitive_key(key) {
                    *item = Value::String(REDACTED.to_string());
                } else {
                    mask_secrets(item);
                }
            }
        }
        Value::Array(items) => items.iter_mut().for_each(mask_secrets),
        _ => {}
    }
}

pub fn is_sensitive_key(key: &str) -> bool {
    let folded: String = key
        .chars()
        .filter(char::is_ascii_alphanumeric)
        .map(|c| c.to_ascii_lowercase())
        .collect();
    SECRET_KEY_FRAGMENTS
        .iter()
        .any(|fragment| folded.contains(fragment))
}
