//! MCP tool dispatcher
//!
//! JSON-RPC 2.0 request routing to registered tool handlers. Tools declare
//! typed parameter schemas (type, range, required); the dispatcher validates
//! arguments before a handler runs, bounds concurrency, enforces per-call
//! deadlines and emits exactly one response per request id.

pub mod dispatcher;
pub mod property;
pub mod registry;

pub use dispatcher::{McpDispatcher, JSONRPC_VERSION, MCP_PROTOCOL_VERSION};
pub use property::{Property, PropertyKind, PropertyList, PropertyValue};
pub use registry::{FnTool, Tool, ToolOutput, ToolRegistry};
