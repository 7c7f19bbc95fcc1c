//! Tool registry
//!
//! Registration happens at startup; the registry is sealed before the
//! dispatcher starts serving and rejects later additions. Tools keep their
//! registration order so `tools/list` pagination is stable.

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use sona_core::ToolError;

use crate::property::{PropertyList, PropertyValue};

/// Structured result a tool hands back to the peer.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolOutput {
    pub text: String,
    pub is_error: bool,
}

impl ToolOutput {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            is_error: false,
        }
    }

    pub fn error(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            is_error: true,
        }
    }

    /// MCP content envelope.
    pub fn to_json(&self) -> Value {
        json!({
            "content": [{ "type": "text", "text": self.text }],
            "isError": self.is_error,
        })
    }
}

/// A named, typed operation the remote model may invoke.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    fn properties(&self) -> &PropertyList;

    /// Run with validated arguments. Handlers are cancel-safe: the
    /// dispatcher drops the future on deadline expiry.
    async fn execute(
        &self,
        arguments: HashMap<String, PropertyValue>,
    ) -> Result<ToolOutput, ToolError>;

    /// MCP descriptor for `tools/list`.
    fn descriptor(&self) -> Value {
        json!({
            "name": self.name(),
            "description": self.description(),
            "inputSchema": self.properties().schema_json(),
        })
    }
}

type HandlerFuture = Pin<Box<dyn Future<Output = Result<ToolOutput, ToolError>> + Send>>;
type Handler = Arc<dyn Fn(HashMap<String, PropertyValue>) -> HandlerFuture + Send + Sync>;

/// Closure-backed tool, the common registration path.
pub struct FnTool {
    name: String,
    description: String,
    properties: PropertyList,
    handler: Handler,
}

impl FnTool {
    pub fn new<F, Fut>(
        name: impl Into<String>,
        description: impl Into<String>,
        properties: PropertyList,
        handler: F,
    ) -> Self
    where
        F: Fn(HashMap<String, PropertyValue>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<ToolOutput, ToolError>> + Send + 'static,
    {
        let handler: Handler = Arc::new(move |args| Box::pin(handler(args)));
        Self {
            name: name.into(),
            description: description.into(),
            properties,
            handler,
        }
    }
}

#[async_trait]
impl Tool for FnTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn properties(&self) -> &PropertyList {
        &self.properties
    }

    async fn execute(
        &self,
        arguments: HashMap<String, PropertyValue>,
    ) -> Result<ToolOutput, ToolError> {
        (self.handler)(arguments).await
    }
}

/// Write-once tool table, ordered by registration.
pub struct ToolRegistry {
    tools: RwLock<Vec<Arc<dyn Tool>>>,
    index: RwLock<HashMap<String, usize>>,
    sealed: RwLock<bool>,
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: RwLock::new(Vec::new()),
            index: RwLock::new(HashMap::new()),
            sealed: RwLock::new(false),
        }
    }

    /// Register a tool. Names are globally unique; registration after
    /// sealing is forbidden.
    pub fn register<T: Tool + 'static>(&self, tool: T) -> Result<(), ToolError> {
        self.register_arc(Arc::new(tool))
    }

    pub fn register_arc(&self, tool: Arc<dyn Tool>) -> Result<(), ToolError> {
        if *self.sealed.read() {
            return Err(ToolError::Execution(
                "registry sealed, post-startup registration forbidden".into(),
            ));
        }

        let name = tool.name().to_string();
        let mut index = self.index.write();
        if index.contains_key(&name) {
            return Err(ToolError::Execution(format!("duplicate tool name: {name}")));
        }

        let mut tools = self.tools.write();
        index.insert(name.clone(), tools.len());
        tools.push(tool);
        tracing::info!(tool = %name, "tool registered");
        Ok(())
    }

    /// Freeze the table. Called once at startup, before dispatch begins.
    pub fn seal(&self) {
        *self.sealed.write() = true;
    }

    pub fn is_sealed(&self) -> bool {
        *self.sealed.read()
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        let index = self.index.read();
        let tools = self.tools.read();
        index.get(name).and_then(|&i| tools.get(i).cloned())
    }

    pub fn len(&self) -> usize {
        self.tools.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.read().is_empty()
    }

    /// Descriptors in registration order, starting at `cursor` (inclusive),
    /// at most `page_size` entries. Returns the next cursor if more remain.
    pub fn page(&self, cursor: Option<&str>, page_size: usize) -> (Vec<Value>, Option<String>) {
        let tools = self.tools.read();

        let start = match cursor {
            Some(cursor) => {
                let index = self.index.read();
                match index.get(cursor) {
                    Some(&i) => i,
                    None => return (Vec::new(), None),
                }
            }
            None => 0,
        };

        let end = (start + page_size).min(tools.len());
        let descriptors = tools[start..end].iter().map(|t| t.descriptor()).collect();
        let next = tools.get(end).map(|t| t.name().to_string());
        (descriptors, next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::property::{Property, PropertyKind};

    fn echo_tool(name: &str) -> FnTool {
        FnTool::new(
            name,
            "echoes its input",
            PropertyList::new(vec![Property::new("text", PropertyKind::String)]),
            |args| async move {
                let text = args["text"].as_str().unwrap_or_default().to_string();
                Ok(ToolOutput::text(text))
            },
        )
    }

    #[test]
    fn test_register_and_get() {
        let registry = ToolRegistry::new();
        registry.register(echo_tool("echo")).unwrap();
        assert_eq!(registry.len(), 1);
        assert!(registry.get("echo").is_some());
        assert!(registry.get("missing").is_none());
    }

    #[test]
    fn test_duplicate_name_rejected() {
        let registry = ToolRegistry::new();
        registry.register(echo_tool("echo")).unwrap();
        assert!(registry.register(echo_tool("echo")).is_err());
    }

    #[test]
    fn test_sealed_registry_rejects_registration() {
        let registry = ToolRegistry::new();
        registry.register(echo_tool("echo")).unwrap();
        registry.seal();
        assert!(registry.register(echo_tool("late")).is_err());
        assert!(registry.is_sealed());
    }

    #[test]
    fn test_pagination() {
        let registry = ToolRegistry::new();
        for i in 0..5 {
            registry.register(echo_tool(&format!("tool_{i}"))).unwrap();
        }

        let (first, next) = registry.page(None, 2);
        assert_eq!(first.len(), 2);
        assert_eq!(next.as_deref(), Some("tool_2"));

        let (second, next) = registry.page(next.as_deref(), 2);
        assert_eq!(second[0]["name"], "tool_2");
        assert_eq!(next.as_deref(), Some("tool_4"));

        let (last, next) = registry.page(next.as_deref(), 2);
        assert_eq!(last.len(), 1);
        assert!(next.is_none());
    }

    #[tokio::test]
    async fn test_fn_tool_executes() {
        let tool = echo_tool("echo");
        let args = tool
            .properties()
            .parse_arguments(Some(&serde_json::json!({"text": "hi"})))
            .unwrap();
        let output = tool.execute(args).await.unwrap();
        assert_eq!(output, ToolOutput::text("hi"));
    }
}
