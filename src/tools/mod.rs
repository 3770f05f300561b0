//! Tool executor trait and registry
//!
//! Tools live on a remote tool server. Discovery turns each remote tool into
//! a [`ToolDescriptor`] plus an executor; the registry is read-only once built
//! and can be shared across concurrent runs.

use crate::error::OrchestrationError;
use crate::models::ToolDescriptor;
use crate::Result;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, warn};

pub mod mcp;
mod sse;
pub use mcp::{McpHttpClient, Transport};

/// Trait for a single invocable tool
#[async_trait::async_trait]
pub trait ToolExecutor: Send + Sync {
    async fn execute(&self, arguments: Value) -> Result<Value>;
}

/// The consumed tool discovery/invocation protocol.
#[async_trait::async_trait]
pub trait ToolServer: Send + Sync {
    async fn list_tools(&self) -> Result<Vec<ToolDescriptor>>;
    async fn call_tool(&self, name: &str, arguments: Value) -> Result<Value>;
}

/// Executor that forwards to a named tool on a [`ToolServer`].
pub struct RemoteTool {
    server: Arc<dyn ToolServer>,
    name: String,
}

impl RemoteTool {
    pub fn new(server: Arc<dyn ToolServer>, name: impl Into<String>) -> Self {
        Self {
            server,
            name: name.into(),
        }
    }
}

#[async_trait::async_trait]
impl ToolExecutor for RemoteTool {
    async fn execute(&self, arguments: Value) -> Result<Value> {
        self.server.call_tool(&self.name, arguments).await
    }
}

struct RegisteredTool {
    descriptor: ToolDescriptor,
    executor: Arc<dyn ToolExecutor>,
}

/// Tool registry for looking up and executing tools, kept in name order
#[derive(Default)]
pub struct ToolRegistry {
    tools: BTreeMap<String, RegisteredTool>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate the descriptor and add it. Schema problems are caught here,
    /// never at call time.
    pub fn register(
        &mut self,
        mut descriptor: ToolDescriptor,
        executor: Arc<dyn ToolExecutor>,
    ) -> Result<()> {
        let name = descriptor.name.trim();
        if name.is_empty() {
            return Err(OrchestrationError::InvalidToolSchema(
                "tool name must not be empty".to_string(),
            ));
        }
        if self.tools.contains_key(name) {
            return Err(OrchestrationError::InvalidToolSchema(format!(
                "duplicate tool name: {}",
                name
            )));
        }

        descriptor.name = name.to_string();
        descriptor.parameters = normalize_schema(&descriptor.name, descriptor.parameters)?;

        self.tools.insert(
            descriptor.name.clone(),
            RegisteredTool {
                descriptor,
                executor,
            },
        );
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn ToolExecutor>> {
        self.tools.get(name).map(|t| t.executor.clone())
    }

    /// Sorted tool names.
    pub fn names(&self) -> Vec<String> {
        self.tools.keys().cloned().collect()
    }

    pub fn descriptors(&self) -> Vec<ToolDescriptor> {
        self.tools.values().map(|t| t.descriptor.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

fn normalize_schema(name: &str, schema: Value) -> Result<Value> {
    match schema {
        Value::Null => Ok(json!({ "type": "object", "properties": {} })),
        Value::Object(map) => match map.get("type") {
            None => Ok(Value::Object(map)),
            Some(Value::String(t)) if t == "object" => Ok(Value::Object(map)),
            Some(other) => Err(OrchestrationError::InvalidToolSchema(format!(
                "{}: parameter schema type must be \"object\", got {}",
                name, other
            ))),
        },
        other => Err(OrchestrationError::InvalidToolSchema(format!(
            "{}: parameter schema must be a JSON object, got {}",
            name, other
        ))),
    }
}

/// Build a registry from everything the server advertises.
///
/// Unreachable servers are a fatal connectivity error; individual tools with
/// invalid schemas are skipped.
pub async fn discover(server: Arc<dyn ToolServer>) -> Result<ToolRegistry> {
    let advertised = server.list_tools().await.map_err(|e| match e {
        OrchestrationError::Connectivity(_) => e,
        other => OrchestrationError::Connectivity(format!("tool discovery failed: {}", other)),
    })?;

    let mut registry = ToolRegistry::new();
    for descriptor in advertised {
        let name = descriptor.name.trim().to_string();
        let executor = Arc::new(RemoteTool::new(server.clone(), name.clone()));
        if let Err(e) = registry.register(descriptor, executor) {
            warn!(tool = %name, error = %e, "Skipping tool with invalid descriptor");
        }
    }

    info!(tools = registry.len(), "Tool discovery complete");
    Ok(registry)
}
