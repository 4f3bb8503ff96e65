//! Model Context Protocol client side: JSON-RPC message types and probe scenarios
//!
//! Provides the wire representations exchanged with the server and the scripted
//! checks run against it.

pub mod rpc;
pub mod scenarios;
