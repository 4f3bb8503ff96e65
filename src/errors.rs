use std::{io, time::Duration};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum HarnessError {
    #[error("failed to launch `{program}`: {source}")]
    Launch {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("failed to write to child stdin: {0}")]
    Write(#[source] io::Error),
    #[error("child closed its output without responding")]
    NoResponse,
    #[error("protocol violation: {reason}")]
    Protocol { reason: String, line: String },
    #[error("no response within {0:?}")]
    Timeout(Duration),
    #[error("request {0} is still awaiting a response")]
    RequestInFlight(u64),
    #[error("failed to stop child process: {source}")]
    Shutdown {
        #[source]
        source: io::Error,
        diagnostics: String,
    },
    #[error("child process i/o failed: {0}")]
    Io(#[from] io::Error),
}

impl HarnessError {
    pub fn launch(program: impl Into<String>, source: io::Error) -> Self {
        Self::Launch {
            program: program.into(),
            source,
        }
    }

    pub fn protocol(reason: impl Into<String>, line: impl Into<String>) -> Self {
        Self::Protocol {
            reason: reason.into(),
            line: line.into(),
        }
    }

    /// Stderr captured before the error, when the error carries any.
    pub fn diagnostics(&self) -> Option<&str> {
        match self {
            Self::Shutdown { diagnostics, .. } => Some(diagnostics.as_str()),
            _ => None,
        }
    }

    /// Short stable label used in exchange logs and reports.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Launch { .. } => "launch_error",
            Self::Write(_) => "write_error",
            Self::NoResponse => "no_response",
            Self::Protocol { .. } => "protocol_error",
            Self::Timeout(_) => "timeout",
            Self::RequestInFlight(_) => "request_in_flight",
            Self::Shutdown { .. } => "shutdown_error",
            Self::Io(_) => "io_error",
        }
    }
}
