//! Agent Core — request execution over MCP tools.
//!
//! Submodules:
//! - `reasoning`: Bounded reason-act loop (ReasoningAgent)
//! - `tool_router`: Dispatches model tool calls to the owning servers
//! - `conversation`: Per-request message history
//! - `interpreter`: Second model pass producing the final answer
//! - `session`: AgentSession and the factories that build it
//! - `cache`: One lazily built session per model identifier
//! - `driver`: ExecutionDriver, the inbound `run` / `query` entry point
//! - `observer`: Tracing hooks (verbose mode)
//! - `tokens`: Token estimation and tool-result truncation
//! - `types`: Shared types across the agent core
//! - `errors`: Agent-level error types

pub mod cache;
pub mod conversation;
pub mod driver;
pub mod errors;
pub mod interpreter;
pub mod observer;
pub mod reasoning;
pub mod session;
pub mod tokens;
pub mod tool_router;
pub mod types;

// Re-exports for convenience
pub use cache::{AgentCache, SlotStatus};
pub use driver::ExecutionDriver;
pub use errors::{AgentError, RequestError};
pub use interpreter::ResponseInterpreter;
pub use observer::{AgentEvent, ExecutionObserver, NoopObserver, TraceEvent, TraceRecorder};
pub use reasoning::ReasoningAgent;
pub use session::{AgentSession, McpSessionFactory, SessionFactory};
pub use tool_router::ToolRouter;
pub use types::{
    AgentLimits, ExecutionTrace, LoopState, QueryResponse, RequestResult, TraceEntry, UsageMeter,
};
