//! MCP (Model Context Protocol) client
//!
//! - **Types**: `types.rs` - JSON-RPC envelopes and tool descriptors
//! - **Client**: `client.rs` - half-duplex JSON-RPC over a child's stdio
//! - **Registry**: `registry.rs` - lazily spawned, cached clients keyed by server name

pub mod client;
pub mod registry;
pub mod types;

pub use client::McpClient;
pub use registry::{McpLaunch, McpRegistry};
pub use types::{JsonRpcError, JsonRpcRequest, JsonRpcResponse, McpTool};
