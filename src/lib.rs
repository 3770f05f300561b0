//! Finance Tool Orchestrator
//!
//! Lets a chat-completion model answer free-text queries by calling tools
//! hosted on a remote tool server until it can produce a final answer:
//! - Discovers tools from the server and validates their schemas up front
//! - Drives a bounded request / tool-call / result loop per query
//! - Dispatches a step's tool calls concurrently, appending results in call order
//! - Treats tool failures as data fed back to the model, never as aborts
//! - Streams every step as an ordered event with exactly one terminal event
//! - Supports cancellation from the caller at step boundaries
//!
//! LOOP:
//! REQUEST → RESPONSE → (FINAL | TOOL CALLS → RESULTS → REQUEST ...)

pub mod agent;
pub mod api;
pub mod config;
pub mod error;
pub mod events;
pub mod execution;
pub mod llm;
pub mod models;
pub mod tools;

pub use error::{OrchestrationError, Result};

// Re-export common types
pub use agent::{Orchestrator, RunOutcome, RunReport};
pub use events::{Emitter, EventEnvelope, EventSink, StepEvent};
pub use models::*;
