use std::{fmt, process::ExitCode};

use chrono::{DateTime, SecondsFormat, Utc};

use crate::{config::DiagnosticsDisplay, harness::ShutdownReport};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScenarioStatus {
    Passed { detail: String },
    Failed { kind: &'static str, reason: String },
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScenarioOutcome {
    pub name: String,
    pub status: ScenarioStatus,
}

impl ScenarioOutcome {
    pub fn passed(name: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: ScenarioStatus::Passed {
                detail: detail.into(),
            },
        }
    }

    pub fn failed(name: impl Into<String>, kind: &'static str, reason: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: ScenarioStatus::Failed {
                kind,
                reason: reason.into(),
            },
        }
    }

    pub fn skipped(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: ScenarioStatus::Skipped,
        }
    }

    pub fn is_passed(&self) -> bool {
        matches!(self.status, ScenarioStatus::Passed { .. })
    }
}

/// Aggregate result of one probe run.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub started_at: DateTime<Utc>,
    pub outcomes: Vec<ScenarioOutcome>,
    pub shutdown: Option<ShutdownReport>,
    pub shutdown_error: Option<String>,
    /// Child stderr collected at shutdown, whether or not the stop succeeded.
    pub diagnostics: String,
    pub diagnostics_display: DiagnosticsDisplay,
}

impl RunReport {
    pub fn new(diagnostics_display: DiagnosticsDisplay) -> Self {
        Self {
            started_at: Utc::now(),
            outcomes: Vec::new(),
            shutdown: None,
            shutdown_error: None,
            diagnostics: String::new(),
            diagnostics_display,
        }
    }

    pub fn push(&mut self, outcome: ScenarioOutcome) {
        self.outcomes.push(outcome);
    }

    pub fn passed(&self) -> bool {
        !self.outcomes.is_empty()
            && self.outcomes.iter().all(ScenarioOutcome::is_passed)
            && self.shutdown_error.is_none()
    }

    pub fn exit_code(&self) -> ExitCode {
        if self.passed() {
            ExitCode::SUCCESS
        } else {
            ExitCode::FAILURE
        }
    }

    pub fn diagnostics(&self) -> &str {
        &self.diagnostics
    }

    fn show_diagnostics(&self) -> bool {
        !self.diagnostics().trim().is_empty()
            && (!self.passed() || self.diagnostics_display == DiagnosticsDisplay::Always)
    }
}

impl fmt::Display for RunReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "MCP stdio probe started {}",
            self.started_at.to_rfc3339_opts(SecondsFormat::Millis, true)
        )?;

        for outcome in &self.outcomes {
            match &outcome.status {
                ScenarioStatus::Passed { detail } => {
                    writeln!(f, "[PASS] {}: {detail}", outcome.name)?
                }
                ScenarioStatus::Failed { kind, reason } => {
                    writeln!(f, "[FAIL] {} ({kind}): {reason}", outcome.name)?
                }
                ScenarioStatus::Skipped => writeln!(f, "[SKIP] {}", outcome.name)?,
            }
        }

        if let Some(shutdown) = &self.shutdown {
            let how = if shutdown.forced { "killed" } else { "exited" };
            writeln!(f, "server {how}: {}", shutdown.status)?;
        }
        if let Some(error) = &self.shutdown_error {
            writeln!(f, "server shutdown failed: {error}")?;
        }

        let passed = self.outcomes.iter().filter(|outcome| outcome.is_passed()).count();
        write!(
            f,
            "{passed}/{} scenarios passed: {}",
            self.outcomes.len(),
            if self.passed() { "OK" } else { "FAILED" }
        )?;

        if self.show_diagnostics() {
            write!(f, "\n\nserver stderr:\n{}", self.diagnostics().trim_end())?;
        }
        Ok(())
    }
}
