//! JSON-RPC 2.0 over newline-delimited stdio.
//!
//! [`Message`] models a single JSON-RPC message; [`LineCodec`] frames them on a byte stream the
//! way stdio MCP servers speak: one JSON document per `\n`-terminated line.

mod codec;
mod error;
mod message;

pub use codec::{DEFAULT_MAX_FRAME_BYTES, Decoded, LineCodec, encode};
pub use error::ProtocolError;
pub use message::{
    JSONRPC_VERSION, JsonRpcError, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, Message,
    RequestId,
};

/// MCP protocol revision the gateway announces when it initializes a backend.
pub const MCP_PROTOCOL_VERSION: &str = "2024-11-05";

/// MCP method names the gateway itself needs to recognise.
pub mod methods {
    pub const INITIALIZE: &str = "initialize";
    pub const INITIALIZED: &str = "notifications/initialized";
    pub const PING: &str = "ping";
    pub const TOOLS_LIST: &str = "tools/list";
    pub const TOOLS_LIST_CHANGED: &str = "notifications/tools/list_changed";
}
