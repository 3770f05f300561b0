//! One query end to end: announce the run, discover tools, then drive the loop.
//!
//! Both the command-line client and the web bridge run queries this way, so
//! their event streams share one shape:
//! `meta, status, tools, request, response, ... , terminal`.

use super::{Orchestrator, RunOutcome, RunReport};
use crate::events::{Emitter, EventSink, StepEvent};
use crate::llm::{tool_schema, LlmGateway};
use crate::models::OrchestrationConfig;
use crate::tools::{discover, McpHttpClient, ToolRegistry, Transport};
use crate::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Endpoints reported in the `meta` event and used for discovery.
#[derive(Debug, Clone)]
pub struct SessionTarget {
    pub server_url: String,
    pub base_url: String,
    pub tool_timeout: Duration,
    pub transport: Transport,
}

pub async fn run_session<S: EventSink>(
    gateway: Arc<dyn LlmGateway>,
    target: &SessionTarget,
    config: OrchestrationConfig,
    query: &str,
    emitter: &mut Emitter<S>,
    cancel: &CancellationToken,
) -> RunReport {
    emitter
        .emit(StepEvent::Meta {
            server_url: target.server_url.clone(),
            base_url: target.base_url.clone(),
            model: config.model.clone(),
            max_steps: config.max_steps,
        })
        .await;
    emitter
        .emit(StepEvent::Status {
            message: format!("connecting to tool server {} and listing tools", target.server_url),
        })
        .await;

    let discovered = tokio::select! {
        biased;
        discovered = connect_tools(target) => discovered,
        _ = cancel.cancelled() => {
            emitter.emit(StepEvent::Cancelled { step: 1 }).await;
            return aborted(RunOutcome::Cancelled { step: 1 });
        }
    };

    let registry = match discovered {
        Ok(registry) => Arc::new(registry),
        Err(e) => {
            warn!(server_url = %target.server_url, error = %e, "Tool discovery failed");
            emitter.emit(StepEvent::error(None, &e)).await;
            return aborted(RunOutcome::Failed(e));
        }
    };

    info!(server_url = %target.server_url, tools = registry.len(), "Tools ready");
    emitter
        .emit(StepEvent::Tools {
            count: registry.len(),
            tools: config
                .verbose
                .then(|| tool_schema(&registry.descriptors())),
        })
        .await;

    Orchestrator::new(gateway, registry, config)
        .run(query, emitter, cancel)
        .await
}

async fn connect_tools(target: &SessionTarget) -> Result<ToolRegistry> {
    let client = Arc::new(
        McpHttpClient::new(&target.server_url, target.tool_timeout)?
            .with_transport(target.transport),
    );
    discover(client).await
}

fn aborted(outcome: RunOutcome) -> RunReport {
    RunReport {
        outcome,
        transcript: Vec::new(),
        steps: 0,
    }
}
