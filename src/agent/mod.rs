//! Main orchestrator - implements the tool-calling loop
//!
//! REQUEST → RESPONSE → (FINAL | DISPATCH → APPEND RESULTS → next step)
//!
//! Each step sends the full transcript and tool schema to the model. A reply
//! without tool calls ends the run; otherwise every call is dispatched, the
//! results are appended in call order, and the next step begins. The loop is
//! bounded by `max_steps` and honours a cancellation token at step boundaries
//! and while waiting on the model or the tools.

use crate::error::OrchestrationError;
use crate::events::{request_preview, response_preview, Emitter, EventLog, EventSink, StepEvent};
use crate::execution::ExecutionEngine;
use crate::llm::{CompletionRequest, LlmGateway, ToolChoice};
use crate::models::{Message, OrchestrationConfig, Role, ToolCall, ToolDescriptor};
use crate::tools::ToolRegistry;
use crate::Result;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub mod session;
pub use session::{run_session, SessionTarget};

/// Instruction seeded at the head of every transcript.
pub const SYSTEM_PROMPT: &str = "You are a finance assistant. Available tools provide live quotes, \
news, risk scores, anomaly detection and forecasts. When external data is needed, call a tool \
first and draw conclusions only from its results. Answer in the language of the user's question \
and keep the output clearly structured.";

/// How a run ended.
#[derive(Debug)]
pub enum RunOutcome {
    Final { content: String },
    Failed(OrchestrationError),
    Cancelled { step: u32 },
}

impl RunOutcome {
    /// Process exit status for command-line surfaces.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Final { .. } => 0,
            Self::Failed(OrchestrationError::Config(_)) => 2,
            Self::Failed(_) => 1,
            Self::Cancelled { .. } => 130,
        }
    }
}

#[derive(Debug)]
pub struct RunReport {
    pub outcome: RunOutcome,
    pub transcript: Vec<Message>,
    /// Number of completion requests issued.
    pub steps: u32,
}

impl RunReport {
    pub fn into_result(self) -> Result<String> {
        match self.outcome {
            RunOutcome::Final { content } => Ok(content),
            RunOutcome::Failed(err) => Err(err),
            RunOutcome::Cancelled { step } => Err(OrchestrationError::Cancelled { step }),
        }
    }
}

/// Internal exit state, carrying what the terminal event needs.
enum Exit {
    Final { step: u32, content: String },
    Failed { step: Option<u32>, error: OrchestrationError },
    Cancelled { step: u32 },
}

/// Main orchestrator that drives one query to a terminal state
pub struct Orchestrator {
    gateway: Arc<dyn LlmGateway>,
    execution_engine: ExecutionEngine,
    tools: Vec<ToolDescriptor>,
    config: OrchestrationConfig,
}

impl Orchestrator {
    pub fn new(
        gateway: Arc<dyn LlmGateway>,
        tool_registry: Arc<ToolRegistry>,
        config: OrchestrationConfig,
    ) -> Self {
        let tools = tool_registry.descriptors();
        Self {
            gateway,
            execution_engine: ExecutionEngine::new(tool_registry),
            tools,
            config,
        }
    }

    /// Run one query, emitting every lifecycle event and exactly one
    /// terminal event (`final`, `error` or `cancelled`).
    pub async fn run<S: EventSink>(
        &self,
        query: &str,
        emitter: &mut Emitter<S>,
        cancel: &CancellationToken,
    ) -> RunReport {
        let start_time = Instant::now();
        let mut transcript = vec![Message::system(SYSTEM_PROMPT), Message::user(query)];
        let mut requests = 0;

        info!(
            model = %self.config.model,
            max_steps = self.config.max_steps,
            tools = self.tools.len(),
            "Orchestrator: starting run"
        );

        let exit = self
            .drive(&mut transcript, &mut requests, emitter, cancel)
            .await;

        let (event, outcome) = match exit {
            Exit::Final { step, content } => {
                info!(step, "Run finished with final answer");
                (
                    StepEvent::Final {
                        step,
                        content: content.clone(),
                    },
                    RunOutcome::Final { content },
                )
            }
            Exit::Failed { step, error } => {
                warn!(step = ?step, kind = error.kind(), error = %error, "Run failed");
                (StepEvent::error(step, &error), RunOutcome::Failed(error))
            }
            Exit::Cancelled { step } => {
                info!(step, "Run cancelled");
                (StepEvent::Cancelled { step }, RunOutcome::Cancelled { step })
            }
        };
        emitter.emit(event).await;

        debug!(
            requests,
            elapsed_ms = start_time.elapsed().as_millis() as u64,
            "Orchestrator: run complete"
        );

        RunReport {
            outcome,
            transcript,
            steps: requests,
        }
    }

    /// Run with a private event log and no external cancellation.
    pub async fn run_to_completion(&self, query: &str) -> Result<String> {
        let mut emitter = Emitter::new(EventLog::new());
        self.run(query, &mut emitter, &CancellationToken::new())
            .await
            .into_result()
    }

    async fn drive<S: EventSink>(
        &self,
        transcript: &mut Vec<Message>,
        requests: &mut u32,
        emitter: &mut Emitter<S>,
        cancel: &CancellationToken,
    ) -> Exit {
        if let Err(error) = self.config.validate() {
            return Exit::Failed { step: None, error };
        }
        if self.config.require_tools && self.tools.is_empty() {
            return Exit::Failed {
                step: None,
                error: OrchestrationError::Config(
                    "no tools discovered: check that the tool server is running and the server URL is correct"
                        .to_string(),
                ),
            };
        }

        let verbose = self.config.verbose;

        for step in 1..=self.config.max_steps {
            if cancel.is_cancelled() {
                return Exit::Cancelled { step };
            }

            emitter
                .emit(StepEvent::Request {
                    step,
                    preview: request_preview(&self.config.model, transcript.as_slice(), self.tools.len(), verbose),
                })
                .await;

            let request = CompletionRequest {
                model: &self.config.model,
                messages: transcript.as_slice(),
                tools: &self.tools,
                tool_choice: ToolChoice::Auto,
                temperature: self.config.temperature,
            };
            *requests += 1;

            // Work is polled first so an already-finished call wins over a
            // cancellation that raced it.
            let reply = tokio::select! {
                biased;
                reply = self.gateway.complete(request) => reply,
                _ = cancel.cancelled() => return Exit::Cancelled { step },
            };

            let message = match reply {
                Ok(Some(message)) => assign_missing_ids(step, message),
                Ok(None) => {
                    return Exit::Failed {
                        step: Some(step),
                        error: OrchestrationError::EmptyResponse,
                    }
                }
                Err(error) => {
                    return Exit::Failed {
                        step: Some(step),
                        error,
                    }
                }
            };

            emitter
                .emit(StepEvent::Response {
                    step,
                    message: response_preview(&message, verbose),
                })
                .await;

            if !message.has_tool_calls() {
                return Exit::Final {
                    step,
                    content: message.text().to_string(),
                };
            }

            let calls = message.tool_calls.clone();
            transcript.push(message);
            debug!(step, calls = calls.len(), "Model requested tool calls");

            for call in &calls {
                emitter.emit(StepEvent::tool_call(step, call)).await;
            }

            let results = tokio::select! {
                biased;
                results = self.execution_engine.execute_step(step, &calls) => results,
                _ = cancel.cancelled() => return Exit::Cancelled { step },
            };

            for result in &results {
                let payload = match result.to_value() {
                    Ok(payload) => payload,
                    Err(error) => {
                        return Exit::Failed {
                            step: Some(step),
                            error,
                        }
                    }
                };
                transcript.push(Message::tool(&result.call_id, payload.to_string()));
                emitter
                    .emit(StepEvent::tool_result(step, result, payload))
                    .await;
            }
        }

        Exit::Failed {
            step: Some(self.config.max_steps),
            error: OrchestrationError::BudgetExceeded {
                max_steps: self.config.max_steps,
            },
        }
    }
}

/// Give every id-less call a stable `call_{step}_{index}` id (1-based).
fn assign_missing_ids(step: u32, mut message: Message) -> Message {
    for (idx, call) in message.tool_calls.iter_mut().enumerate() {
        if call.id.trim().is_empty() {
            call.id = format!("call_{}_{}", step, idx + 1);
        }
    }
    message
}

/// Tool calls that have no tool-role reply later in the transcript.
pub fn unanswered_calls(transcript: &[Message]) -> Vec<&ToolCall> {
    let mut open = Vec::new();
    for (pos, message) in transcript.iter().enumerate() {
        for call in &message.tool_calls {
            let answered = transcript[pos + 1..]
                .iter()
                .any(|m| m.tool_call_id.as_deref() == Some(call.id.as_str()));
            if !answered {
                open.push(call);
            }
        }
    }
    open
}

/// Tool-role messages whose id was not issued by the assistant message that
/// opened their reply block.
pub fn misplaced_replies(transcript: &[Message]) -> Vec<&Message> {
    let mut issued: Vec<&str> = Vec::new();
    let mut misplaced = Vec::new();

    for message in transcript {
        match message.role {
            Role::Assistant => {
                issued = message.tool_calls.iter().map(|c| c.id.as_str()).collect();
            }
            Role::Tool => {
                let id = message.tool_call_id.as_deref().unwrap_or_default();
                if !issued.contains(&id) {
                    misplaced.push(message);
                }
            }
            Role::System | Role::User => issued.clear(),
        }
    }
    misplaced
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::ToolExecutor;
    use serde_json::{json, Value};
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::time::Duration;

    /// Replays canned replies and records each transcript it was sent.
    struct ScriptedGateway {
        replies: Mutex<VecDeque<Result<Option<Message>>>>,
        /// Returned once the script runs out.
        fallback: Option<Message>,
        seen: Mutex<Vec<Vec<Message>>>,
        /// Cancel this token while serving the given (1-based) request.
        cancel_on: Option<(usize, CancellationToken)>,
        /// Delay before each reply.
        latency: Duration,
    }

    impl ScriptedGateway {
        fn new(replies: Vec<Result<Option<Message>>>) -> Self {
            Self {
                replies: Mutex::new(replies.into()),
                fallback: None,
                seen: Mutex::new(Vec::new()),
                cancel_on: None,
                latency: Duration::ZERO,
            }
        }

        fn looping(message: Message) -> Self {
            let mut gateway = Self::new(Vec::new());
            gateway.fallback = Some(message);
            gateway
        }

        fn requests(&self) -> usize {
            self.seen.lock().unwrap().len()
        }

        fn transcript(&self, request: usize) -> Vec<Message> {
            self.seen.lock().unwrap()[request].clone()
        }
    }

    #[async_trait::async_trait]
    impl LlmGateway for ScriptedGateway {
        async fn complete(&self, request: CompletionRequest<'_>) -> Result<Option<Message>> {
            let count = {
                let mut seen = self.seen.lock().unwrap();
                seen.push(request.messages.to_vec());
                seen.len()
            };
            if let Some((at, token)) = &self.cancel_on {
                if *at == count {
                    token.cancel();
                }
            }
            if !self.latency.is_zero() {
                tokio::time::sleep(self.latency).await;
            }

            let next = self.replies.lock().unwrap().pop_front();
            match next {
                Some(reply) => reply,
                None => Ok(Some(self.fallback.clone().expect("script exhausted"))),
            }
        }
    }

    struct Echo;

    #[async_trait::async_trait]
    impl ToolExecutor for Echo {
        async fn execute(&self, arguments: Value) -> Result<Value> {
            if let Some(delay) = arguments.get("delay_ms").and_then(Value::as_u64) {
                tokio::time::sleep(Duration::from_millis(delay)).await;
            }
            Ok(arguments)
        }
    }

    struct Broken;

    #[async_trait::async_trait]
    impl ToolExecutor for Broken {
        async fn execute(&self, _arguments: Value) -> Result<Value> {
            Err(OrchestrationError::ToolExecution("quote feed timed out".into()))
        }
    }

    fn registry() -> Arc<ToolRegistry> {
        let mut registry = ToolRegistry::new();
        registry
            .register(
                ToolDescriptor::new("echo", "Echo arguments", json!({"type": "object"})),
                Arc::new(Echo),
            )
            .unwrap();
        registry
            .register(
                ToolDescriptor::new("broken", "Always fails", json!({"type": "object"})),
                Arc::new(Broken),
            )
            .unwrap();
        Arc::new(registry)
    }

    fn config(max_steps: u32) -> OrchestrationConfig {
        OrchestrationConfig {
            max_steps,
            ..OrchestrationConfig::default()
        }
    }

    fn calls(calls: Vec<ToolCall>) -> Result<Option<Message>> {
        Ok(Some(Message::assistant(None, calls)))
    }

    fn answer(text: &str) -> Result<Option<Message>> {
        Ok(Some(Message::assistant(Some(text.to_string()), Vec::new())))
    }

    async fn run_with(
        gateway: Arc<ScriptedGateway>,
        config: OrchestrationConfig,
        cancel: &CancellationToken,
    ) -> (RunReport, EventLog) {
        let orchestrator = Orchestrator::new(gateway, registry(), config);
        let mut emitter = Emitter::new(EventLog::new());
        let report = orchestrator.run("what is x?", &mut emitter, cancel).await;
        (report, emitter.into_sink())
    }

    fn assert_single_terminal(log: &EventLog) {
        let terminals = log.events().iter().filter(|e| e.event.is_terminal()).count();
        assert_eq!(terminals, 1);
        assert!(log.events().last().unwrap().event.is_terminal());
    }

    #[tokio::test]
    async fn test_echo_round_trip_event_order() {
        let gateway = Arc::new(ScriptedGateway::new(vec![
            calls(vec![ToolCall::new("c1", "echo", r#"{"x":1}"#)]),
            answer("done"),
        ]));

        let (report, log) = run_with(gateway.clone(), config(8), &CancellationToken::new()).await;

        assert_eq!(
            log.kinds(),
            vec!["request", "response", "tool_call", "tool_result", "request", "response", "final"]
        );
        assert_single_terminal(&log);
        assert_eq!(report.steps, 2);
        assert!(matches!(&report.outcome, RunOutcome::Final { content } if content == "done"));

        match &log.events()[2].event {
            StepEvent::ToolCall { step, arguments, .. } => {
                assert_eq!(*step, 1);
                assert_eq!(arguments, &json!({"x": 1}));
            }
            other => panic!("unexpected event {other:?}"),
        }
        match &log.events()[3].event {
            StepEvent::ToolResult { result, .. } => {
                assert_eq!(result["status"], "success");
                assert_eq!(result["result"], json!({"x": 1}));
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert_eq!(log.events()[6].event.step(), Some(2));

        // The second request carries the tool reply for c1.
        let second = gateway.transcript(1);
        let reply = second.last().unwrap();
        assert_eq!(reply.role, Role::Tool);
        assert_eq!(reply.tool_call_id.as_deref(), Some("c1"));
        assert!(unanswered_calls(&report.transcript).is_empty());
    }

    #[tokio::test]
    async fn test_immediate_answer_has_no_tool_events() {
        let gateway = Arc::new(ScriptedGateway::new(vec![answer("  AAPL is up 2%  ")]));
        let (report, log) = run_with(gateway, config(8), &CancellationToken::new()).await;

        assert_eq!(log.kinds(), vec!["request", "response", "final"]);
        assert_eq!(report.into_result().unwrap(), "AAPL is up 2%");
    }

    #[tokio::test]
    async fn test_budget_exhaustion_after_exactly_max_steps() {
        let gateway = Arc::new(ScriptedGateway::looping(Message::assistant(
            None,
            vec![ToolCall::new("loop", "echo", "{}")],
        )));

        let (report, log) = run_with(gateway.clone(), config(3), &CancellationToken::new()).await;

        assert_eq!(gateway.requests(), 3);
        assert_eq!(report.steps, 3);
        assert_single_terminal(&log);
        match &log.events().last().unwrap().event {
            StepEvent::Error { kind, step, .. } => {
                assert_eq!(kind, "budget_exceeded");
                assert_eq!(*step, Some(3));
            }
            other => panic!("unexpected terminal {other:?}"),
        }
        assert_eq!(report.outcome.exit_code(), 1);
    }

    #[tokio::test]
    async fn test_unknown_tool_is_fed_back_and_run_continues() {
        let gateway = Arc::new(ScriptedGateway::new(vec![
            calls(vec![ToolCall::new("c1", "nonexistent_tool", "{}")]),
            answer("sorry, that tool does not exist"),
        ]));

        let (report, log) = run_with(gateway.clone(), config(8), &CancellationToken::new()).await;

        assert_eq!(gateway.requests(), 2);
        assert!(matches!(report.outcome, RunOutcome::Final { .. }));
        assert!(!log.kinds().contains(&"error"));

        let reply: Value =
            serde_json::from_str(report.transcript[3].content.as_deref().unwrap()).unwrap();
        assert_eq!(reply["status"], "error");
        assert_eq!(reply["kind"], "tool_resolution");
        assert!(reply["error"].as_str().unwrap().contains("nonexistent_tool"));
        assert_eq!(reply["available"], json!(["broken", "echo"]));
    }

    #[tokio::test]
    async fn test_malformed_arguments_preserved_raw() {
        let gateway = Arc::new(ScriptedGateway::new(vec![
            calls(vec![ToolCall::new("c1", "echo", "{not json")]),
            answer("done"),
        ]));

        let (report, log) = run_with(gateway, config(8), &CancellationToken::new()).await;

        assert!(matches!(report.outcome, RunOutcome::Final { .. }));
        match &log.events()[2].event {
            StepEvent::ToolCall { arguments, raw_arguments, .. } => {
                assert_eq!(arguments, &json!({"_raw": "{not json"}));
                assert_eq!(raw_arguments, "{not json");
            }
            other => panic!("unexpected event {other:?}"),
        }

        let reply: Value =
            serde_json::from_str(report.transcript[3].content.as_deref().unwrap()).unwrap();
        assert_eq!(reply["_raw"], "{not json");
    }

    #[tokio::test]
    async fn test_executor_failure_is_not_fatal() {
        let gateway = Arc::new(ScriptedGateway::new(vec![
            calls(vec![ToolCall::new("c1", "broken", "{}")]),
            answer("the quote service is unavailable"),
        ]));

        let (report, _log) = run_with(gateway, config(8), &CancellationToken::new()).await;

        let reply: Value =
            serde_json::from_str(report.transcript[3].content.as_deref().unwrap()).unwrap();
        assert_eq!(reply["status"], "error");
        assert!(reply["error"].as_str().unwrap().contains("quote feed timed out"));
        assert_eq!(report.outcome.exit_code(), 0);
    }

    #[tokio::test]
    async fn test_cancel_between_steps() {
        let cancel = CancellationToken::new();
        let mut gateway = ScriptedGateway::looping(Message::assistant(
            None,
            vec![ToolCall::new("loop", "echo", "{}")],
        ));
        gateway.cancel_on = Some((2, cancel.clone()));
        let gateway = Arc::new(gateway);

        let (report, log) = run_with(gateway.clone(), config(8), &cancel).await;

        assert_eq!(gateway.requests(), 2);
        assert_single_terminal(&log);
        assert!(matches!(report.outcome, RunOutcome::Cancelled { .. }));
        assert_eq!(report.outcome.exit_code(), 130);
        assert!(!log
            .events()
            .iter()
            .any(|e| e.event.kind() == "request" && e.event.step() == Some(3)));
        assert!(unanswered_calls(&report.transcript).is_empty());
    }

    fn cancel_after(cancel: &CancellationToken, delay: Duration) {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            cancel.cancel();
        });
    }

    #[tokio::test]
    async fn test_cancel_while_tools_run_discards_results() {
        let cancel = CancellationToken::new();
        let gateway = Arc::new(ScriptedGateway::new(vec![
            calls(vec![ToolCall::new("slow", "echo", r#"{"delay_ms":300}"#)]),
            answer("too late"),
        ]));

        cancel_after(&cancel, Duration::from_millis(50));
        let (report, log) = run_with(gateway.clone(), config(8), &cancel).await;

        assert_eq!(log.kinds(), vec!["request", "response", "tool_call", "cancelled"]);
        assert!(matches!(report.outcome, RunOutcome::Cancelled { step: 1 }));
        assert_eq!(gateway.requests(), 1);
        assert!(!report.transcript.iter().any(|m| m.role == Role::Tool));
    }

    #[tokio::test]
    async fn test_cancel_while_model_is_thinking() {
        let cancel = CancellationToken::new();
        let mut gateway = ScriptedGateway::new(vec![answer("too late")]);
        gateway.latency = Duration::from_millis(300);
        let gateway = Arc::new(gateway);

        cancel_after(&cancel, Duration::from_millis(50));
        let (report, log) = run_with(gateway.clone(), config(8), &cancel).await;

        assert_eq!(log.kinds(), vec!["request", "cancelled"]);
        assert!(matches!(report.outcome, RunOutcome::Cancelled { step: 1 }));
        assert_eq!(report.outcome.exit_code(), 130);
    }

    #[tokio::test]
    async fn test_tool_replies_answer_the_preceding_assistant() {
        let gateway = Arc::new(ScriptedGateway::new(vec![
            calls(vec![
                ToolCall::new("c1", "missing_tool", "{}"),
                ToolCall::new("c2", "echo", "{not json"),
            ]),
            calls(vec![ToolCall::new("", "echo", r#"{"x":2}"#)]),
            answer("done"),
        ]));

        let (report, _log) = run_with(gateway, config(8), &CancellationToken::new()).await;

        assert!(matches!(report.outcome, RunOutcome::Final { .. }));
        let tool_ids: Vec<&str> = report
            .transcript
            .iter()
            .filter_map(|m| m.tool_call_id.as_deref())
            .collect();
        assert_eq!(tool_ids, vec!["c1", "c2", "call_2_1"]);
        assert!(misplaced_replies(&report.transcript).is_empty());
        assert!(unanswered_calls(&report.transcript).is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let gateway = Arc::new(ScriptedGateway::new(vec![answer("never")]));

        let (report, log) = run_with(gateway.clone(), config(8), &cancel).await;

        assert_eq!(gateway.requests(), 0);
        assert_eq!(log.kinds(), vec!["cancelled"]);
        assert!(matches!(report.outcome, RunOutcome::Cancelled { step: 1 }));
    }

    #[tokio::test]
    async fn test_empty_response_is_fatal() {
        let gateway = Arc::new(ScriptedGateway::new(vec![Ok(None)]));
        let (report, log) = run_with(gateway, config(8), &CancellationToken::new()).await;

        assert_eq!(log.kinds(), vec!["request", "error"]);
        assert!(matches!(
            report.outcome,
            RunOutcome::Failed(OrchestrationError::EmptyResponse)
        ));
    }

    #[tokio::test]
    async fn test_upstream_error_ends_run_with_error_event() {
        let gateway = Arc::new(ScriptedGateway::new(vec![Err(
            OrchestrationError::UpstreamProtocol {
                status: 401,
                body: "invalid api key".into(),
            },
        )]));

        let (_report, log) = run_with(gateway, config(8), &CancellationToken::new()).await;

        match &log.events().last().unwrap().event {
            StepEvent::Error { kind, message, step } => {
                assert_eq!(kind, "upstream_protocol");
                assert!(message.contains("invalid api key"));
                assert_eq!(*step, Some(1));
            }
            other => panic!("unexpected terminal {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_missing_call_ids_are_generated() {
        let gateway = Arc::new(ScriptedGateway::new(vec![
            calls(vec![
                ToolCall::new("", "echo", r#"{"a":1}"#),
                ToolCall::new("", "echo", r#"{"b":2}"#),
            ]),
            answer("done"),
        ]));

        let (report, _log) = run_with(gateway, config(8), &CancellationToken::new()).await;

        let ids: Vec<_> = report.transcript[2]
            .tool_calls
            .iter()
            .map(|c| c.id.as_str())
            .collect();
        assert_eq!(ids, ["call_1_1", "call_1_2"]);
        assert_eq!(report.transcript[3].tool_call_id.as_deref(), Some("call_1_1"));
        assert_eq!(report.transcript[4].tool_call_id.as_deref(), Some("call_1_2"));
    }

    #[tokio::test]
    async fn test_tool_replies_follow_call_order() {
        let gateway = Arc::new(ScriptedGateway::new(vec![
            calls(vec![
                ToolCall::new("slow", "echo", r#"{"delay_ms": 50}"#),
                ToolCall::new("fast", "echo", "{}"),
            ]),
            answer("done"),
        ]));

        let (report, log) = run_with(gateway, config(8), &CancellationToken::new()).await;

        let replies: Vec<_> = report
            .transcript
            .iter()
            .filter_map(|m| m.tool_call_id.as_deref())
            .collect();
        assert_eq!(replies, ["slow", "fast"]);

        let result_ids: Vec<_> = log
            .events()
            .iter()
            .filter_map(|e| match &e.event {
                StepEvent::ToolResult { call_id, .. } => Some(call_id.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(result_ids, ["slow", "fast"]);
    }

    #[tokio::test]
    async fn test_required_tools_missing_is_config_error() {
        let gateway = Arc::new(ScriptedGateway::new(vec![answer("unused")]));
        let orchestrator = Orchestrator::new(
            gateway.clone(),
            Arc::new(ToolRegistry::new()),
            OrchestrationConfig {
                require_tools: true,
                ..OrchestrationConfig::default()
            },
        );

        let mut emitter = Emitter::new(EventLog::new());
        let report = orchestrator
            .run("price of AAPL", &mut emitter, &CancellationToken::new())
            .await;

        assert_eq!(gateway.requests(), 0);
        assert_eq!(emitter.sink().kinds(), vec!["error"]);
        assert_eq!(report.outcome.exit_code(), 2);
    }

    #[tokio::test]
    async fn test_invalid_config_rejected_before_first_request() {
        let gateway = Arc::new(ScriptedGateway::new(vec![answer("unused")]));
        let (report, _log) = run_with(gateway.clone(), config(0), &CancellationToken::new()).await;

        assert_eq!(gateway.requests(), 0);
        assert!(matches!(
            report.outcome,
            RunOutcome::Failed(OrchestrationError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_run_to_completion_returns_text() {
        let gateway = Arc::new(ScriptedGateway::new(vec![
            calls(vec![ToolCall::new("c1", "echo", "{}")]),
            answer("finished"),
        ]));
        let orchestrator = Orchestrator::new(gateway, registry(), config(4));

        assert_eq!(orchestrator.run_to_completion("hi").await.unwrap(), "finished");
    }

    #[test]
    fn test_unanswered_calls_detects_orphans() {
        let transcript = vec![
            Message::user("q"),
            Message::assistant(None, vec![ToolCall::new("a", "echo", "{}"), ToolCall::new("b", "echo", "{}")]),
            Message::tool("a", "{}"),
        ];
        let open = unanswered_calls(&transcript);
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].id, "b");

        let stray = vec![
            Message::user("q"),
            Message::assistant(None, vec![ToolCall::new("a", "echo", "{}")]),
            Message::tool("a", "{}"),
            Message::user("again"),
            Message::tool("a", "{}"),
        ];
        let misplaced = misplaced_replies(&stray);
        assert_eq!(misplaced.len(), 1);
        assert!(std::ptr::eq(misplaced[0], &stray[4]));
    }
}
