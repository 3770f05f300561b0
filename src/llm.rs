//! Chat-completion gateway
//!
//! Sends the transcript and tool schema to an OpenAI-compatible
//! `/chat/completions` endpoint and normalizes the reply into a [`Message`].
//! Uses a long-lived reqwest::Client for connection pooling.

use crate::config::LlmSettings;
use crate::error::OrchestrationError;
use crate::models::{Message, Role, ToolCall, ToolDescriptor};
use crate::Result;
use async_trait::async_trait;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, error, info};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ToolChoice {
    #[default]
    Auto,
    None,
    Required,
}

/// Everything one completion call needs. Borrowed from the run.
#[derive(Debug, Clone, Copy)]
pub struct CompletionRequest<'a> {
    pub model: &'a str,
    pub messages: &'a [Message],
    pub tools: &'a [ToolDescriptor],
    pub tool_choice: ToolChoice,
    pub temperature: f32,
}

/// Trait for the model endpoint
#[async_trait]
pub trait LlmGateway: Send + Sync {
    /// Returns `Ok(None)` when the endpoint answered without any assistant message.
    async fn complete(&self, request: CompletionRequest<'_>) -> Result<Option<Message>>;
}

/// Reusable chat-completions client (connection-pooled)
pub struct ChatCompletionsClient {
    client: Client,
    api_key: SecretString,
    base_url: String,
}

impl ChatCompletionsClient {
    pub fn new(settings: LlmSettings) -> Result<Self> {
        let client = Client::builder()
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(8)
            .timeout(settings.timeout)
            .build()?;

        Ok(Self {
            client,
            api_key: settings.api_key,
            base_url: settings.base_url,
        })
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.base_url.trim_end_matches('/'))
    }
}

#[async_trait]
impl LlmGateway for ChatCompletionsClient {
    async fn complete(&self, request: CompletionRequest<'_>) -> Result<Option<Message>> {
        let body = build_request(&request);

        info!(
            model = request.model,
            messages = request.messages.len(),
            tools = request.tools.len(),
            "Calling chat completions"
        );

        let response = self
            .client
            .post(self.endpoint())
            .bearer_auth(self.api_key.expose_secret())
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                error!("Chat completion request failed: {}", e);
                OrchestrationError::from_transport("chat completion request failed", e)
            })?;

        let status = response.status();
        let text = response.text().await.map_err(|e| {
            OrchestrationError::from_transport("reading chat completion response", e)
        })?;

        if !status.is_success() {
            error!(status = status.as_u16(), "Chat completion error response: {}", text);
            return Err(OrchestrationError::UpstreamProtocol {
                status: status.as_u16(),
                body: text,
            });
        }

        debug!(bytes = text.len(), "Chat completion response received");
        parse_completion(status.as_u16(), &text)
    }
}

// =============================
// Request Wire Format
// =============================

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<WireMessage<'a>>,
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<WireTool<'a>>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_choice: Option<ToolChoice>,
}

#[derive(Debug, Serialize)]
struct WireMessage<'a> {
    role: Role,
    content: Option<&'a str>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tool_calls: Vec<WireToolCallOut<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<&'a str>,
}

#[derive(Debug, Serialize)]
struct WireToolCallOut<'a> {
    id: &'a str,
    #[serde(rename = "type")]
    kind: &'static str,
    function: WireFunctionOut<'a>,
}

#[derive(Debug, Serialize)]
struct WireFunctionOut<'a> {
    name: &'a str,
    arguments: &'a str,
}

#[derive(Debug, Serialize)]
struct WireTool<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    function: WireFunctionDef<'a>,
}

#[derive(Debug, Serialize)]
struct WireFunctionDef<'a> {
    name: &'a str,
    description: &'a str,
    parameters: &'a Value,
}

/// Tools and `tool_choice` are omitted entirely when no tools are registered.
fn build_request<'a>(request: &CompletionRequest<'a>) -> ChatRequest<'a> {
    let messages = request
        .messages
        .iter()
        .map(|m| WireMessage {
            role: m.role,
            content: m.content.as_deref(),
            tool_calls: m
                .tool_calls
                .iter()
                .map(|c| WireToolCallOut {
                    id: &c.id,
                    kind: "function",
                    function: WireFunctionOut {
                        name: &c.name,
                        arguments: &c.raw_arguments,
                    },
                })
                .collect(),
            tool_call_id: m.tool_call_id.as_deref(),
        })
        .collect();

    let (tools, tool_choice) = if request.tools.is_empty() {
        (None, None)
    } else {
        let tools = request
            .tools
            .iter()
            .map(|t| WireTool {
                kind: "function",
                function: WireFunctionDef {
                    name: &t.name,
                    description: &t.description,
                    parameters: &t.parameters,
                },
            })
            .collect();
        (Some(tools), Some(request.tool_choice))
    };

    ChatRequest {
        model: request.model,
        messages,
        temperature: request.temperature,
        tools,
        tool_choice,
    }
}

/// OpenAI-style tool schema for the given descriptors (used for verbose previews).
pub fn tool_schema(tools: &[ToolDescriptor]) -> Value {
    let request = CompletionRequest {
        model: "",
        messages: &[],
        tools,
        tool_choice: ToolChoice::Auto,
        temperature: 0.0,
    };
    serde_json::to_value(build_request(&request).tools.unwrap_or_default())
        .unwrap_or(Value::Null)
}

// =============================
// Response Wire Format
// =============================

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    #[serde(default)]
    message: Option<WireAssistantMessage>,
}

#[derive(Debug, Default, Deserialize)]
struct WireAssistantMessage {
    #[serde(default)]
    role: Option<String>,
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<WireToolCall>>,
    #[serde(default)]
    function_call: Option<WireFunctionCall>,
}

#[derive(Debug, Deserialize)]
struct WireToolCall {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    function: Option<WireFunctionCall>,
}

#[derive(Debug, Deserialize)]
struct WireFunctionCall {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<Value>,
}

fn parse_completion(status: u16, body: &str) -> Result<Option<Message>> {
    let parsed: ChatResponse =
        serde_json::from_str(body).map_err(|_| OrchestrationError::UpstreamProtocol {
            status,
            body: body.to_string(),
        })?;

    Ok(parsed
        .choices
        .into_iter()
        .next()
        .and_then(|choice| choice.message)
        .and_then(normalize_message))
}

/// Fold both wire shapes (multi-call `tool_calls` and the legacy single
/// `function_call`) into one ToolCall list.
fn normalize_message(wire: WireAssistantMessage) -> Option<Message> {
    let modern = wire.tool_calls.unwrap_or_default();

    let tool_calls: Vec<ToolCall> = if !modern.is_empty() {
        modern
            .into_iter()
            .map(|call| {
                let (name, arguments) = split_function(call.function);
                ToolCall::new(call.id.unwrap_or_default(), name, arguments)
            })
            .collect()
    } else {
        match wire.function_call {
            Some(legacy) if legacy.name.as_deref().is_some_and(|n| !n.is_empty()) => {
                let (name, arguments) = split_function(Some(legacy));
                let id = format!("legacy_{}", Uuid::new_v4().simple());
                vec![ToolCall::new(id, name, arguments)]
            }
            _ => Vec::new(),
        }
    };

    if wire.role.is_none() && wire.content.is_none() && tool_calls.is_empty() {
        return None;
    }

    Some(Message::assistant(wire.content, tool_calls))
}

fn split_function(function: Option<WireFunctionCall>) -> (String, String) {
    let Some(function) = function else {
        return (String::new(), "{}".to_string());
    };

    let arguments = match function.arguments {
        None | Some(Value::Null) => "{}".to_string(),
        Some(Value::String(s)) => s,
        Some(other) => other.to_string(),
    };

    (function.name.unwrap_or_default(), arguments)
}
