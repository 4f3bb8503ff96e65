//! Child process harness for line-delimited JSON-RPC over stdio
//!
//! Owns the spawned server, exchanges one request at a time with it, and tears it
//! down with a terminate-then-kill sequence while keeping its stderr for reporting.

pub mod diagnostics;
pub mod stdio;

pub use stdio::{Reply, ShutdownReport, StdioHarness, StdoutPolicy};
