//! MCP Client — JSON-RPC over stdio transport for tool server management.
//!
//! This module handles:
//! - Spawning and owning one subprocess-backed session per configured server
//! - JSON-RPC 2.0 communication over process stdio
//! - Tool discovery and aggregation across all servers
//! - Routing and argument validation for tool calls
//! - Server lifecycle (parallel start, restart with backoff, graceful shutdown)

pub mod client;
pub mod errors;
pub mod registry;
pub mod session;
pub mod transport;
pub mod types;

// Re-exports for convenience
pub use client::{McpClient, ServerHandle};
pub use errors::McpError;
pub use registry::{CollisionPolicy, RegisteredTool, ToolRegistry};
pub use session::{McpSession, ToolServer};
pub use types::{McpToolDefinition, ServerConfig, ToolCallResult, ToolDescriptor, TransportKind};
