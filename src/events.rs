//! Step events and their delivery
//!
//! The orchestrator reports every lifecycle point as a [`StepEvent`]. An
//! [`Emitter`] stamps each one with a sequence number and timestamp, hands it
//! to an [`EventSink`], and guarantees a single terminal event per run.

use crate::error::OrchestrationError;
use crate::models::{Message, ToolCall, ToolResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepEvent {
    Meta {
        server_url: String,
        base_url: String,
        model: String,
        max_steps: u32,
    },
    Status {
        message: String,
    },
    Tools {
        count: usize,
        #[serde(skip_serializing_if = "Option::is_none")]
        tools: Option<Value>,
    },
    Request {
        step: u32,
        preview: Value,
    },
    Response {
        step: u32,
        message: Value,
    },
    ToolCall {
        step: u32,
        call_id: String,
        name: String,
        arguments: Value,
        raw_arguments: String,
    },
    ToolResult {
        step: u32,
        call_id: String,
        name: String,
        result: Value,
    },
    Final {
        step: u32,
        content: String,
    },
    Error {
        #[serde(skip_serializing_if = "Option::is_none")]
        step: Option<u32>,
        kind: String,
        message: String,
    },
    Cancelled {
        step: u32,
    },
}

impl StepEvent {
    pub fn error(step: Option<u32>, err: &OrchestrationError) -> Self {
        Self::Error {
            step,
            kind: err.kind().to_string(),
            message: err.to_string(),
        }
    }

    pub fn tool_call(step: u32, call: &ToolCall) -> Self {
        Self::ToolCall {
            step,
            call_id: call.id.clone(),
            name: call.name.clone(),
            arguments: call.executor_input(),
            raw_arguments: call.raw_arguments.clone(),
        }
    }

    pub fn tool_result(step: u32, result: &ToolResult, payload: Value) -> Self {
        Self::ToolResult {
            step,
            call_id: result.call_id.clone(),
            name: result.name.clone(),
            result: payload,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Final { .. } | Self::Error { .. } | Self::Cancelled { .. }
        )
    }

    /// Wire discriminator, identical to the serialized `type` field.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Meta { .. } => "meta",
            Self::Status { .. } => "status",
            Self::Tools { .. } => "tools",
            Self::Request { .. } => "request",
            Self::Response { .. } => "response",
            Self::ToolCall { .. } => "tool_call",
            Self::ToolResult { .. } => "tool_result",
            Self::Final { .. } => "final",
            Self::Error { .. } => "error",
            Self::Cancelled { .. } => "cancelled",
        }
    }

    pub fn step(&self) -> Option<u32> {
        match self {
            Self::Request { step, .. }
            | Self::Response { step, .. }
            | Self::ToolCall { step, .. }
            | Self::ToolResult { step, .. }
            | Self::Final { step, .. }
            | Self::Cancelled { step } => Some(*step),
            Self::Error { step, .. } => *step,
            Self::Meta { .. } | Self::Status { .. } | Self::Tools { .. } => None,
        }
    }
}

/// One event as delivered: `{"seq", "timestamp", "type", ...}`.
#[derive(Debug, Clone, Serialize)]
pub struct EventEnvelope {
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub event: StepEvent,
}

//
// ================= Payload Previews =================
//

/// Request summary. Never contains credentials: only the model name,
/// counts and (when verbose) the transcript.
pub fn request_preview(model: &str, messages: &[Message], tools_count: usize, verbose: bool) -> Value {
    if verbose {
        json!({
            "model": model,
            "messages": messages,
            "tools_count": tools_count,
            "tool_choice": "auto",
        })
    } else {
        json!({
            "model": model,
            "messages_count": messages.len(),
            "tools_count": tools_count,
        })
    }
}

pub fn response_preview(message: &Message, verbose: bool) -> Value {
    if verbose {
        return serde_json::to_value(message).unwrap_or(Value::Null);
    }

    let names: Vec<&str> = message.tool_calls.iter().map(|c| c.name.as_str()).collect();
    json!({
        "role": message.role,
        "content": message.content,
        "tool_calls": names,
    })
}

//
// ================= Sinks =================
//

/// Destination for stamped events.
#[async_trait]
pub trait EventSink: Send {
    async fn deliver(&mut self, envelope: EventEnvelope);
}

/// Stamps events and enforces the single-terminal-event rule.
pub struct Emitter<S: EventSink> {
    sink: S,
    seq: u64,
    terminated: bool,
}

impl<S: EventSink> Emitter<S> {
    pub fn new(sink: S) -> Self {
        Self {
            sink,
            seq: 0,
            terminated: false,
        }
    }

    /// Returns `false` when the event was dropped because the run already ended.
    pub async fn emit(&mut self, event: StepEvent) -> bool {
        if self.terminated {
            warn!(event = event.kind(), "Dropping event emitted after terminal event");
            return false;
        }

        self.terminated = event.is_terminal();
        let envelope = EventEnvelope {
            seq: self.seq,
            timestamp: Utc::now(),
            event,
        };
        self.seq += 1;

        debug!(seq = envelope.seq, event = envelope.event.kind(), "Emitting event");
        self.sink.deliver(envelope).await;
        true
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn into_sink(self) -> S {
        self.sink
    }
}

/// Buffered sink: the caller inspects everything after the run returns.
#[derive(Debug, Default)]
pub struct EventLog {
    events: Vec<EventEnvelope>,
}

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> &[EventEnvelope] {
        &self.events
    }

    pub fn kinds(&self) -> Vec<&'static str> {
        self.events.iter().map(|e| e.event.kind()).collect()
    }
}

#[async_trait]
impl EventSink for EventLog {
    async fn deliver(&mut self, envelope: EventEnvelope) {
        self.events.push(envelope);
    }
}

/// Pushes events to a live subscriber. A closed receiver cancels the run.
pub struct ChannelSink {
    tx: mpsc::Sender<EventEnvelope>,
    cancel: CancellationToken,
}

impl ChannelSink {
    pub fn new(tx: mpsc::Sender<EventEnvelope>, cancel: CancellationToken) -> Self {
        Self { tx, cancel }
    }
}

#[async_trait]
impl EventSink for ChannelSink {
    async fn deliver(&mut self, envelope: EventEnvelope) {
        if self.tx.send(envelope).await.is_err() {
            debug!("Event subscriber disconnected");
            self.cancel.cancel();
        }
    }
}

/// Renders events as text lines on stdout for the command-line client.
pub struct ConsoleSink {
    verbose: bool,
}

impl ConsoleSink {
    pub fn new(verbose: bool) -> Self {
        Self { verbose }
    }
}

#[async_trait]
impl EventSink for ConsoleSink {
    async fn deliver(&mut self, envelope: EventEnvelope) {
        println!("{}", render(&envelope.event, self.verbose));
    }
}

fn pretty(value: &Value) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
}

/// Plain-text rendering of one event.
pub fn render(event: &StepEvent, verbose: bool) -> String {
    let mut out = match event {
        StepEvent::Meta {
            server_url,
            base_url,
            model,
            max_steps,
        } => format!(
            "tool server: {} | llm: {} | model: {} | max steps: {}",
            server_url, base_url, model, max_steps
        ),
        StepEvent::Status { message } => format!("[status] {}", message),
        StepEvent::Tools { count, .. } => format!("Discovered {} tool(s)", count),
        StepEvent::Request { step, .. } => {
            format!("{}\n[step {}] requesting chat completion", "-".repeat(80), step)
        }
        StepEvent::Response { step, message } => {
            let calls = message
                .get("tool_calls")
                .and_then(Value::as_array)
                .map_or(0, Vec::len);
            if calls == 0 {
                format!("[step {}] model answered without tool calls", step)
            } else {
                format!("[step {}] model requested {} tool call(s)", step, calls)
            }
        }
        StepEvent::ToolCall {
            name,
            raw_arguments,
            ..
        } => format!("  - {} {}", name, raw_arguments),
        StepEvent::ToolResult { name, result, .. } => {
            let status = result
                .get("status")
                .and_then(Value::as_str)
                .unwrap_or("unknown");
            format!("  -> {} [{}]", name, status)
        }
        StepEvent::Final { content, .. } => format!("{}\nFinal answer:\n{}", "=".repeat(80), content),
        StepEvent::Error { kind, message, .. } => format!("error [{}]: {}", kind, message),
        StepEvent::Cancelled { step } => format!("run cancelled at step {}", step),
    };

    if verbose {
        let detail = match event {
            StepEvent::Tools { tools: Some(tools), .. } => Some(tools),
            StepEvent::Request { preview, .. } => Some(preview),
            StepEvent::Response { message, .. } => Some(message),
            StepEvent::ToolResult { result, .. } => Some(result),
            _ => None,
        };
        if let Some(detail) = detail {
            out.push('\n');
            out.push_str(&pretty(detail));
        }
    }

    out
}
