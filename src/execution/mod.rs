//! Execution engine for one step's tool calls
//!
//! Calls within a step are independent, so they run concurrently. The engine
//! returns only after every call finished (join barrier), and results come
//! back in the order the model issued the calls, not completion order.
//! No failure here is fatal: every outcome is a [`ToolResult`].

use crate::models::{ToolCall, ToolResult};
use crate::tools::ToolRegistry;
use futures::future::join_all;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

pub struct ExecutionEngine {
    tool_registry: Arc<ToolRegistry>,
}

impl ExecutionEngine {
    pub fn new(tool_registry: Arc<ToolRegistry>) -> Self {
        Self { tool_registry }
    }

    /// Run all calls of a step and return one result per call, in call order.
    pub async fn execute_step(&self, step: u32, calls: &[ToolCall]) -> Vec<ToolResult> {
        debug!(step, calls = calls.len(), "Dispatching tool calls");

        let results = join_all(calls.iter().map(|call| self.execute_call(step, call))).await;

        debug!(
            step,
            failed = results.iter().filter(|r| r.is_error()).count(),
            "Tool calls complete"
        );
        results
    }

    async fn execute_call(&self, step: u32, call: &ToolCall) -> ToolResult {
        let Some(executor) = self.tool_registry.get(&call.name) else {
            warn!(step, tool = %call.name, "Tool not registered");
            return ToolResult::unresolved(call, self.tool_registry.names());
        };

        if let Some(err) = call.argument_error() {
            warn!(step, tool = %call.name, error = %err, "Forwarding raw tool arguments");
        }

        let start = Instant::now();
        let result = match executor.execute(call.executor_input()).await {
            Ok(output) => ToolResult::success(call, output),
            Err(e) => {
                warn!(step, tool = %call.name, error = %e, "Tool execution failed");
                ToolResult::failure(call, &e)
            }
        };

        debug!(
            step,
            tool = %call.name,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Tool call finished"
        );
        result
    }
}
