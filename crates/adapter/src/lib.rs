//! mcp-mux
//!
//! Multiplex stdio MCP servers (and remote MCP endpoints) behind one HTTP + SSE front door.

pub mod backend;
pub mod config;
pub mod correlator;
pub mod env;
pub mod error;
pub mod health;
pub mod http;
pub mod manager;
pub mod registry;
pub mod remote;
pub mod session;
pub mod stdio_bridge;
pub mod supervisor;
pub mod timeouts;

#[cfg(test)]
mod testing;

pub use error::{GatewayError, Result};
