//! Core data models for the tool-calling loop

use crate::error::OrchestrationError;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;

/// Key under which malformed tool arguments are preserved verbatim.
pub const RAW_ARGUMENTS_KEY: &str = "_raw";

pub const DEFAULT_MAX_STEPS: u32 = 8;
pub const DEFAULT_TEMPERATURE: f32 = 0.2;
pub const DEFAULT_MODEL: &str = "deepseek-chat";

//
// ================= Messages =================
//

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// One transcript entry. Never mutated after it is appended.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub role: Role,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: Some(content.into()),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: Some(content.into()),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }

    pub fn assistant(content: Option<String>, tool_calls: Vec<ToolCall>) -> Self {
        Self {
            role: Role::Assistant,
            content,
            tool_calls,
            tool_call_id: None,
        }
    }

    pub fn tool(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: Role::Tool,
            content: Some(content.into()),
            tool_calls: Vec::new(),
            tool_call_id: Some(tool_call_id.into()),
        }
    }

    pub fn has_tool_calls(&self) -> bool {
        !self.tool_calls.is_empty()
    }

    /// Text content with surrounding whitespace removed ("" when absent).
    pub fn text(&self) -> &str {
        self.content.as_deref().map(str::trim).unwrap_or_default()
    }
}

//
// ================= Tool Calls =================
//

/// A model-issued request to run one tool.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub raw_arguments: String,
    /// Parsed argument object; `None` when `raw_arguments` is not a JSON object.
    pub arguments: Option<Value>,
}

impl ToolCall {
    pub fn new(id: impl Into<String>, name: impl Into<String>, raw_arguments: impl Into<String>) -> Self {
        let raw_arguments = raw_arguments.into();
        let arguments = parse_arguments(&raw_arguments);
        Self {
            id: id.into(),
            name: name.into(),
            raw_arguments,
            arguments,
        }
    }

    pub fn is_malformed(&self) -> bool {
        self.arguments.is_none()
    }

    /// Why the arguments could not be used as an object. The call still runs
    /// with [`executor_input`](Self::executor_input).
    pub fn argument_error(&self) -> Option<OrchestrationError> {
        self.is_malformed().then(|| {
            OrchestrationError::ToolArgument(format!(
                "{} expects a JSON object, got {:?}",
                self.name, self.raw_arguments
            ))
        })
    }

    /// The object handed to the executor: parsed arguments, or the raw
    /// string wrapped under [`RAW_ARGUMENTS_KEY`].
    pub fn executor_input(&self) -> Value {
        match &self.arguments {
            Some(args) => args.clone(),
            None => {
                let mut wrapped = serde_json::Map::new();
                wrapped.insert(
                    RAW_ARGUMENTS_KEY.to_string(),
                    Value::String(self.raw_arguments.clone()),
                );
                Value::Object(wrapped)
            }
        }
    }
}

/// Best-effort parse. Empty input is an empty object; anything that is not a
/// JSON object counts as malformed.
fn parse_arguments(raw: &str) -> Option<Value> {
    if raw.trim().is_empty() {
        return Some(json!({}));
    }

    match serde_json::from_str::<Value>(raw) {
        Ok(value) if value.is_object() => Some(value),
        _ => None,
    }
}

//
// ================= Tool Descriptors =================
//

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolDescriptor {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub parameters: Value,
}

impl ToolDescriptor {
    pub fn new(name: impl Into<String>, description: impl Into<String>, parameters: Value) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters,
        }
    }
}

//
// ================= Tool Results =================
//

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ToolErrorKind {
    #[serde(rename = "tool_resolution")]
    Resolution,
    #[serde(rename = "tool_execution")]
    Execution,
    #[serde(rename = "tool_server")]
    Server,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolFailure {
    pub kind: ToolErrorKind,
    pub error: String,
    /// Known tool names, filled in when the requested name did not resolve.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub available: Vec<String>,
}

/// Tool failure is data: the loop never aborts on it.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ToolOutcome {
    Success { result: Value },
    Error(ToolFailure),
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ToolResult {
    pub call_id: String,
    pub name: String,
    #[serde(flatten)]
    pub outcome: ToolOutcome,
    #[serde(rename = "_raw", skip_serializing_if = "Option::is_none")]
    pub raw_arguments: Option<String>,
}

impl ToolResult {
    fn for_call(call: &ToolCall, outcome: ToolOutcome) -> Self {
        Self {
            call_id: call.id.clone(),
            name: call.name.clone(),
            outcome,
            raw_arguments: call.is_malformed().then(|| call.raw_arguments.clone()),
        }
    }

    pub fn success(call: &ToolCall, result: Value) -> Self {
        Self::for_call(call, ToolOutcome::Success { result })
    }

    pub fn failure(call: &ToolCall, err: &OrchestrationError) -> Self {
        let kind = match err {
            OrchestrationError::ToolResolution(_) => ToolErrorKind::Resolution,
            OrchestrationError::ToolServer { .. } => ToolErrorKind::Server,
            _ => ToolErrorKind::Execution,
        };

        Self::for_call(
            call,
            ToolOutcome::Error(ToolFailure {
                kind,
                error: err.to_string(),
                available: Vec::new(),
            }),
        )
    }

    pub fn unresolved(call: &ToolCall, available: Vec<String>) -> Self {
        Self::for_call(
            call,
            ToolOutcome::Error(ToolFailure {
                kind: ToolErrorKind::Resolution,
                error: OrchestrationError::ToolResolution(call.name.clone()).to_string(),
                available,
            }),
        )
    }

    pub fn is_error(&self) -> bool {
        matches!(self.outcome, ToolOutcome::Error(_))
    }

    /// JSON payload placed in the tool-role message and the `tool_result` event.
    pub fn to_value(&self) -> crate::Result<Value> {
        Ok(serde_json::to_value(self)?)
    }
}

//
// ================= Run Configuration =================
//

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OrchestrationConfig {
    pub max_steps: u32,
    pub temperature: f32,
    pub model: String,
    pub verbose: bool,
    /// End the run with a configuration error when discovery found no tools.
    #[serde(default)]
    pub require_tools: bool,
}

impl Default for OrchestrationConfig {
    fn default() -> Self {
        Self {
            max_steps: DEFAULT_MAX_STEPS,
            temperature: DEFAULT_TEMPERATURE,
            model: DEFAULT_MODEL.to_string(),
            verbose: false,
            require_tools: false,
        }
    }
}

impl OrchestrationConfig {
    pub fn validate(&self) -> crate::Result<()> {
        if self.max_steps == 0 {
            return Err(OrchestrationError::Config(
                "max_steps must be at least 1".to_string(),
            ));
        }
        if self.model.trim().is_empty() {
            return Err(OrchestrationError::Config(
                "model identifier must not be empty".to_string(),
            ));
        }
        if !self.temperature.is_finite() || self.temperature < 0.0 {
            return Err(OrchestrationError::Config(format!(
                "invalid temperature: {}",
                self.temperature
            )));
        }
        Ok(())
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        };
        write!(f, "{}", s)
    }
}
