//! Tool server client over HTTP
//!
//! Two transports carry the same JSON-RPC 2.0 messages. Streamable HTTP
//! POSTs each request to the server URL and reads the reply from the body,
//! either plain JSON or an event stream whose `data:` lines hold the
//! message. Legacy SSE keeps a GET event stream open, POSTs requests to the
//! endpoint the stream announces and reads replies off the stream.

use super::sse::{decode_all, SseDecoder, SseEvent};
use super::ToolServer;
use crate::error::OrchestrationError;
use crate::models::ToolDescriptor;
use crate::Result;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use reqwest::{Client, IntoUrl, Response, StatusCode, Url};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Mutex, OnceCell};
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, info, warn};

const PROTOCOL_VERSION: &str = "2025-03-26";
const SESSION_HEADER: &str = "mcp-session-id";
const MAX_LIST_PAGES: usize = 100;

#[derive(Debug, Serialize)]
struct RpcRequest<'a> {
    jsonrpc: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<u64>,
    method: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    params: Option<Value>,
}

impl<'a> RpcRequest<'a> {
    fn call(id: u64, method: &'a str, params: Value) -> Self {
        Self {
            jsonrpc: "2.0",
            id: Some(id),
            method,
            params: Some(params),
        }
    }
}

#[derive(Debug, Deserialize)]
struct RpcResponse {
    #[serde(default)]
    id: Option<Value>,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcError>,
}

impl RpcResponse {
    fn into_result(self) -> Result<Value> {
        if let Some(err) = self.error {
            return Err(OrchestrationError::ToolServer {
                code: err.code,
                message: err.message,
            });
        }
        Ok(self.result.unwrap_or(Value::Null))
    }
}

#[derive(Debug, Deserialize)]
struct RpcError {
    code: i64,
    message: String,
}

#[derive(Debug, Deserialize)]
struct ListToolsResult {
    #[serde(default)]
    tools: Vec<RemoteToolDef>,
    #[serde(default, rename = "nextCursor")]
    next_cursor: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RemoteToolDef {
    name: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default, rename = "inputSchema")]
    input_schema: Value,
}

#[derive(Debug, Deserialize)]
struct CallToolResult {
    #[serde(default)]
    content: Vec<ContentBlock>,
    #[serde(default, rename = "structuredContent")]
    structured_content: Option<Value>,
    #[serde(default, rename = "isError")]
    is_error: bool,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum ContentBlock {
    Text { text: String },
    #[serde(other)]
    Other,
}

/// How JSON-RPC messages reach the tool server.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Transport {
    /// Try streamable HTTP first and fall back to SSE when the server
    /// rejects a POST to its URL.
    #[default]
    Auto,
    /// Every request is a POST to the server URL.
    StreamableHttp,
    /// GET the server URL as an event stream, POST to the endpoint it
    /// announces and read replies from the stream.
    Sse,
}

impl FromStr for Transport {
    type Err = OrchestrationError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "http" | "streamable-http" => Ok(Self::StreamableHttp),
            "sse" => Ok(Self::Sse),
            other => Err(OrchestrationError::Config(format!(
                "unknown tool server transport: {} (expected auto, http or sse)",
                other
            ))),
        }
    }
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Auto => "auto",
            Self::StreamableHttp => "http",
            Self::Sse => "sse",
        })
    }
}

enum Session {
    /// Streamable HTTP with the optional session id header.
    Http(Option<String>),
    Sse(EventChannel),
}

impl Session {
    fn transport(&self) -> Transport {
        match self {
            Self::Http(_) => Transport::StreamableHttp,
            Self::Sse(_) => Transport::Sse,
        }
    }
}

/// Connection-pooled tool server client. Connects lazily on first use.
pub struct McpHttpClient {
    client: Client,
    url: String,
    timeout: Duration,
    transport: Transport,
    next_id: AtomicU64,
    session: OnceCell<Session>,
}

impl McpHttpClient {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self> {
        // No total timeout on the client: the SSE stream stays open for the
        // life of the session. Requests carry their own.
        let client = Client::builder()
            .pool_idle_timeout(Duration::from_secs(60))
            .pool_max_idle_per_host(8)
            .connect_timeout(timeout)
            .build()?;

        Ok(Self {
            client,
            url: url.into(),
            timeout,
            transport: Transport::Auto,
            next_id: AtomicU64::new(1),
            session: OnceCell::new(),
        })
    }

    pub fn with_transport(mut self, transport: Transport) -> Self {
        self.transport = transport;
        self
    }

    async fn session(&self) -> Result<&Session> {
        self.session.get_or_try_init(|| self.connect()).await
    }

    async fn connect(&self) -> Result<Session> {
        if self.transport != Transport::Sse {
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            let body = RpcRequest::call(id, "initialize", initialize_params());
            let reply = self.post(self.url.as_str(), &body, None).await?;

            let rejected = matches!(
                reply.status,
                StatusCode::NOT_FOUND | StatusCode::METHOD_NOT_ALLOWED
            );
            if !(rejected && self.transport == Transport::Auto) {
                let session = Session::Http(reply.session_id.clone());
                let result = reply.into_response("initialize", id)?.into_result()?;
                self.initialized(&session, &result).await;
                return Ok(session);
            }
            debug!(url = %self.url, status = %reply.status, "Streamable HTTP rejected, trying SSE");
        }

        let session = Session::Sse(self.open_event_stream().await?);
        let result = self
            .call(&session, "initialize", Some(initialize_params()))
            .await?;
        self.initialized(&session, &result).await;
        Ok(session)
    }

    async fn initialized(&self, session: &Session, result: &Value) {
        let server = result.get("serverInfo").cloned().unwrap_or_default();
        info!(
            url = %self.url,
            transport = %session.transport(),
            server = %server,
            "Tool server initialized"
        );
        self.notify(session, "notifications/initialized").await;
    }

    async fn notify(&self, session: &Session, method: &str) {
        let body = RpcRequest {
            jsonrpc: "2.0",
            id: None,
            method,
            params: None,
        };

        let sent = match session {
            Session::Http(session_id) => {
                self.post(self.url.as_str(), &body, session_id.as_deref()).await
            }
            Session::Sse(channel) => self.post(channel.endpoint.clone(), &body, None).await,
        };
        if let Err(e) = sent {
            warn!(method, error = %e, "Tool server notification failed");
        }
    }

    async fn call(&self, session: &Session, method: &str, params: Option<Value>) -> Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let body = RpcRequest {
            jsonrpc: "2.0",
            id: Some(id),
            method,
            params,
        };

        let reply = match session {
            Session::Http(session_id) => self
                .post(self.url.as_str(), &body, session_id.as_deref())
                .await?
                .into_response(method, id)?,
            Session::Sse(channel) => self.exchange_over_stream(channel, &body, id).await?,
        };

        debug!(method, id, "Tool server replied");
        reply.into_result()
    }

    async fn post(
        &self,
        url: impl IntoUrl,
        body: &RpcRequest<'_>,
        session: Option<&str>,
    ) -> Result<HttpReply> {
        let mut request = self
            .client
            .post(url)
            .timeout(self.timeout)
            .header(ACCEPT, "application/json, text/event-stream")
            .json(body);
        if let Some(session) = session {
            request = request.header(SESSION_HEADER, session);
        }

        let response = request.send().await.map_err(|e| {
            OrchestrationError::from_transport(&format!("tool server {} failed", body.method), e)
        })?;

        let status = response.status();
        let session_id = response
            .headers()
            .get(SESSION_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let is_event_stream = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|ct| ct.starts_with("text/event-stream"));

        let text = response.text().await.map_err(|e| {
            OrchestrationError::from_transport("reading tool server response", e)
        })?;

        Ok(HttpReply {
            status,
            session_id,
            is_event_stream,
            text,
        })
    }

    /// GET the server URL and wait for the `endpoint` event.
    async fn open_event_stream(&self) -> Result<EventChannel> {
        let response = self
            .client
            .get(self.url.as_str())
            .header(ACCEPT, "text/event-stream")
            .send()
            .await
            .map_err(|e| OrchestrationError::from_transport("tool server event stream failed", e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(OrchestrationError::Connectivity(format!(
                "tool server returned {} for event stream",
                status
            )));
        }

        let (endpoint_tx, endpoint_rx) = oneshot::channel();
        let inbox = Arc::new(Mutex::new(Inbox::default()));
        let cancel = CancellationToken::new();
        let reader = StreamReader {
            endpoint: Some(endpoint_tx),
            inbox: inbox.clone(),
        };
        tokio::spawn(reader.run(response, cancel.clone()));

        let endpoint = match tokio::time::timeout(self.timeout, endpoint_rx).await {
            Ok(Ok(endpoint)) => endpoint,
            Ok(Err(_)) => {
                return Err(OrchestrationError::Connectivity(
                    "tool server closed the event stream before announcing an endpoint".to_string(),
                ))
            }
            Err(_) => {
                return Err(OrchestrationError::Connectivity(
                    "timed out waiting for the tool server endpoint event".to_string(),
                ))
            }
        };

        let endpoint = Url::parse(&self.url)
            .and_then(|base| base.join(&endpoint))
            .map_err(|e| {
                OrchestrationError::Connectivity(format!(
                    "tool server announced an invalid endpoint {}: {}",
                    endpoint, e
                ))
            })?;

        debug!(url = %self.url, endpoint = %endpoint, "Tool server event stream open");
        Ok(EventChannel {
            endpoint,
            inbox,
            _reader: cancel.drop_guard(),
        })
    }

    /// POST to the announced endpoint and wait for the reply on the stream.
    async fn exchange_over_stream(
        &self,
        channel: &EventChannel,
        body: &RpcRequest<'_>,
        id: u64,
    ) -> Result<RpcResponse> {
        let pending = channel.inbox.lock().await.subscribe(id)?;

        let accepted = match self.post(channel.endpoint.clone(), body, None).await {
            Ok(reply) if reply.status.is_success() => Ok(()),
            Ok(reply) => Err(OrchestrationError::ToolExecution(format!(
                "tool server returned {} for {}: {}",
                reply.status, body.method, reply.text
            ))),
            Err(e) => Err(e),
        };
        if let Err(e) = accepted {
            channel.inbox.lock().await.forget(id);
            return Err(e);
        }

        match tokio::time::timeout(self.timeout, pending).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(OrchestrationError::Connectivity(format!(
                "tool server event stream closed before replying to {}",
                body.method
            ))),
            Err(_) => {
                channel.inbox.lock().await.forget(id);
                Err(OrchestrationError::Connectivity(format!(
                    "timed out waiting for the {} reply",
                    body.method
                )))
            }
        }
    }
}

fn initialize_params() -> Value {
    json!({
        "protocolVersion": PROTOCOL_VERSION,
        "capabilities": {},
        "clientInfo": {
            "name": env!("CARGO_PKG_NAME"),
            "version": env!("CARGO_PKG_VERSION"),
        }
    })
}

/// Raw HTTP reply to a POSTed JSON-RPC message.
struct HttpReply {
    status: StatusCode,
    session_id: Option<String>,
    is_event_stream: bool,
    text: String,
}

impl HttpReply {
    fn into_response(self, method: &str, id: u64) -> Result<RpcResponse> {
        if !self.status.is_success() {
            return Err(OrchestrationError::ToolExecution(format!(
                "tool server returned {} for {}: {}",
                self.status, method, self.text
            )));
        }

        if self.is_event_stream {
            response_from_event_stream(&self.text, id)
        } else {
            Ok(serde_json::from_str(&self.text)?)
        }
    }
}

/// An open SSE session. Dropping it stops the stream reader.
struct EventChannel {
    endpoint: Url,
    inbox: Arc<Mutex<Inbox>>,
    _reader: DropGuard,
}

/// Replies read off the stream, matched to requests by id.
#[derive(Default)]
struct Inbox {
    waiting: HashMap<u64, oneshot::Sender<RpcResponse>>,
    arrived: HashMap<u64, RpcResponse>,
    closed: bool,
}

impl Inbox {
    /// Register interest in reply `id`. A reply can land before the POST
    /// that asked for it returns.
    fn subscribe(&mut self, id: u64) -> Result<oneshot::Receiver<RpcResponse>> {
        let (tx, rx) = oneshot::channel();
        if let Some(reply) = self.arrived.remove(&id) {
            let _ = tx.send(reply);
        } else if self.closed {
            return Err(OrchestrationError::Connectivity(
                "tool server event stream is closed".to_string(),
            ));
        } else {
            self.waiting.insert(id, tx);
        }
        Ok(rx)
    }

    fn forget(&mut self, id: u64) {
        self.waiting.remove(&id);
    }

    fn deliver(&mut self, reply: RpcResponse) {
        let Some(id) = reply.id.as_ref().and_then(Value::as_u64) else {
            debug!("Ignoring server message without a request id");
            return;
        };
        match self.waiting.remove(&id) {
            Some(tx) => {
                let _ = tx.send(reply);
            }
            None => {
                self.arrived.insert(id, reply);
            }
        }
    }

    fn close(&mut self) {
        self.closed = true;
        self.waiting.clear();
    }
}

struct StreamReader {
    endpoint: Option<oneshot::Sender<String>>,
    inbox: Arc<Mutex<Inbox>>,
}

impl StreamReader {
    async fn run(mut self, mut response: Response, cancel: CancellationToken) {
        let mut decoder = SseDecoder::default();

        loop {
            let chunk = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                chunk = response.chunk() => chunk,
            };
            match chunk {
                Ok(Some(bytes)) => {
                    for event in decoder.push(&bytes) {
                        self.handle(event).await;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "Tool server event stream failed");
                    break;
                }
            }
        }

        if let Some(event) = decoder.finish() {
            self.handle(event).await;
        }
        self.inbox.lock().await.close();
        debug!("Tool server event stream closed");
    }

    async fn handle(&mut self, event: SseEvent) {
        match event.event.as_str() {
            "endpoint" => {
                if let Some(tx) = self.endpoint.take() {
                    let _ = tx.send(event.data.trim().to_string());
                }
            }
            "message" => match serde_json::from_str::<RpcResponse>(&event.data) {
                Ok(reply) => self.inbox.lock().await.deliver(reply),
                Err(e) => debug!(error = %e, "Ignoring unparseable stream message"),
            },
            other => debug!(event = other, "Ignoring stream event"),
        }
    }
}

/// Pick the JSON-RPC reply with the matching id out of an event-stream body.
fn response_from_event_stream(body: &str, id: u64) -> Result<RpcResponse> {
    let mut fallback = None;

    for event in decode_all(body) {
        let Ok(reply) = serde_json::from_str::<RpcResponse>(&event.data) else {
            continue;
        };
        if reply.id.as_ref().and_then(Value::as_u64) == Some(id) {
            return Ok(reply);
        }
        if reply.result.is_some() || reply.error.is_some() {
            fallback = Some(reply);
        }
    }

    fallback.ok_or_else(|| {
        OrchestrationError::ToolExecution("no JSON-RPC reply in event stream".to_string())
    })
}

#[async_trait::async_trait]
impl ToolServer for McpHttpClient {
    async fn list_tools(&self) -> Result<Vec<ToolDescriptor>> {
        let session = self.session().await?;
        let mut descriptors = Vec::new();
        let mut cursor: Option<String> = None;

        for _ in 0..MAX_LIST_PAGES {
            let params = cursor.as_ref().map(|c| json!({ "cursor": c }));
            let result = self.call(session, "tools/list", params).await?;
            let page: ListToolsResult = serde_json::from_value(result)?;

            descriptors.extend(page.tools.into_iter().map(|t| {
                ToolDescriptor::new(t.name, t.description.unwrap_or_default(), t.input_schema)
            }));

            match page.next_cursor {
                Some(next) if !next.is_empty() => cursor = Some(next),
                _ => break,
            }
        }

        Ok(descriptors)
    }

    async fn call_tool(&self, name: &str, arguments: Value) -> Result<Value> {
        let session = self.session().await?;
        let result = self
            .call(
                session,
                "tools/call",
                Some(json!({ "name": name, "arguments": arguments })),
            )
            .await?;
        let result: CallToolResult = serde_json::from_value(result)?;

        let text = result
            .content
            .iter()
            .filter_map(|block| match block {
                ContentBlock::Text { text } => Some(text.as_str()),
                ContentBlock::Other => None,
            })
            .collect::<Vec<_>>()
            .join("\n");

        if result.is_error {
            let message = if text.is_empty() {
                format!("{} reported an error", name)
            } else {
                text
            };
            return Err(OrchestrationError::ToolExecution(message));
        }

        Ok(match result.structured_content {
            Some(structured) => structured,
            None => serde_json::from_str(&text).unwrap_or(Value::String(text)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;

    async fn mock_handshake(server: &mut mockito::ServerGuard) -> (mockito::Mock, mockito::Mock) {
        let init = server
            .mock("POST", "/")
            .match_body(Matcher::PartialJson(json!({"method": "initialize"})))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_header(SESSION_HEADER, "sess-1")
            .with_body(r#"{"jsonrpc":"2.0","id":1,"result":{"serverInfo":{"name":"finance"}}}"#)
            .create_async()
            .await;
        let initialized = server
            .mock("POST", "/")
            .match_body(Matcher::PartialJson(json!({"method": "notifications/initialized"})))
            .match_header(SESSION_HEADER, "sess-1")
            .with_status(202)
            .create_async()
            .await;
        (init, initialized)
    }

    fn client_for(server: &mockito::ServerGuard) -> McpHttpClient {
        McpHttpClient::new(format!("{}/", server.url()), Duration::from_secs(5)).unwrap()
    }

    #[tokio::test]
    async fn test_list_tools_after_handshake() {
        let mut server = mockito::Server::new_async().await;
        let (init, initialized) = mock_handshake(&mut server).await;
        let list = server
            .mock("POST", "/")
            .match_body(Matcher::PartialJson(json!({"method": "tools/list"})))
            .match_header(SESSION_HEADER, "sess-1")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                json!({
                    "jsonrpc": "2.0",
                    "id": 2,
                    "result": {"tools": [
                        {"name": "get_stock_info", "description": "quote",
                         "inputSchema": {"type": "object", "properties": {"symbol": {"type": "string"}}}},
                        {"name": "get_news"}
                    ]}
                })
                .to_string(),
            )
            .create_async()
            .await;

        let client = client_for(&server);
        let tools = client.list_tools().await.unwrap();

        assert_eq!(tools.len(), 2);
        assert_eq!(tools[0].name, "get_stock_info");
        assert_eq!(tools[0].parameters["type"], "object");
        assert_eq!(tools[1].description, "");
        assert_eq!(tools[1].parameters, Value::Null);

        init.assert_async().await;
        initialized.assert_async().await;
        list.assert_async().await;
    }

    #[tokio::test]
    async fn test_call_tool_reads_event_stream_reply() {
        let mut server = mockito::Server::new_async().await;
        let _handshake = mock_handshake(&mut server).await;
        let body = concat!(
            "event: message\n",
            "data: {\"jsonrpc\":\"2.0\",\"id\":2,\"result\":{\"content\":",
            "[{\"type\":\"text\",\"text\":\"{\\\"price\\\": 187.5}\"}]}}\n\n"
        );
        let _call = server
            .mock("POST", "/")
            .match_body(Matcher::PartialJson(json!({
                "method": "tools/call",
                "params": {"name": "get_stock_info", "arguments": {"symbol": "AAPL"}}
            })))
            .with_status(200)
            .with_header("content-type", "text/event-stream")
            .with_body(body)
            .create_async()
            .await;

        let client = client_for(&server);
        let value = client
            .call_tool("get_stock_info", json!({"symbol": "AAPL"}))
            .await
            .unwrap();

        assert_eq!(value, json!({"price": 187.5}));
    }

    #[tokio::test]
    async fn test_call_tool_error_flags() {
        let mut server = mockito::Server::new_async().await;
        let _handshake = mock_handshake(&mut server).await;
        let _failing = server
            .mock("POST", "/")
            .match_body(Matcher::PartialJson(json!({"params": {"name": "risky"}})))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"jsonrpc":"2.0","id":2,"result":{"isError":true,"content":[{"type":"text","text":"symbol not found"}]}}"#)
            .create_async()
            .await;
        let _rpc_error = server
            .mock("POST", "/")
            .match_body(Matcher::PartialJson(json!({"params": {"name": "unknown"}})))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"jsonrpc":"2.0","id":3,"error":{"code":-32602,"message":"Unknown tool"}}"#)
            .create_async()
            .await;

        let client = client_for(&server);

        let err = client.call_tool("risky", json!({})).await.unwrap_err();
        assert!(matches!(err, OrchestrationError::ToolExecution(ref m) if m == "symbol not found"));

        let err = client.call_tool("unknown", json!({})).await.unwrap_err();
        assert!(matches!(err, OrchestrationError::ToolServer { code: -32602, .. }));
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_event_stream_prefers_matching_id() {
        let body = "data: {\"jsonrpc\":\"2.0\",\"id\":7,\"result\":1}\n\n\
                    data: {\"jsonrpc\":\"2.0\",\"id\":8,\"result\":2}\n\n";
        let reply = response_from_event_stream(body, 8).unwrap();
        assert_eq!(reply.result, Some(json!(2)));

        assert!(response_from_event_stream(": keepalive\n\n", 1).is_err());
    }

    #[test]
    fn test_event_stream_with_crlf_and_notification() {
        let body = "event: message\r\n\
                    data: {\"jsonrpc\":\"2.0\",\"method\":\"notifications/message\",\"params\":{\"level\":\"info\"}}\r\n\r\n\
                    event: message\r\n\
                    data: {\"jsonrpc\":\"2.0\",\"id\":2,\"result\":{\"ok\":true}}\r\n\r\n";
        let reply = response_from_event_stream(body, 2).unwrap();
        assert_eq!(reply.result, Some(json!({"ok": true})));
    }

    fn legacy_stream(replies: &[Value]) -> String {
        let mut body = String::from("event: endpoint\r\ndata: /messages/?session_id=abc\r\n\r\n");
        for reply in replies {
            body.push_str(&format!("event: message\r\ndata: {}\r\n\r\n", reply));
        }
        body
    }

    #[tokio::test]
    async fn test_falls_back_to_sse_when_post_is_rejected() {
        let mut server = mockito::Server::new_async().await;
        let rejected = server
            .mock("POST", "/")
            .with_status(405)
            .create_async()
            .await;
        // The rejected streamable POST used id 1, so the SSE handshake starts at 2.
        let stream = server
            .mock("GET", "/")
            .match_header("accept", "text/event-stream")
            .with_status(200)
            .with_header("content-type", "text/event-stream")
            .with_body(legacy_stream(&[
                json!({"jsonrpc": "2.0", "id": 2, "result": {"serverInfo": {"name": "finance"}}}),
                json!({"jsonrpc": "2.0", "id": 3, "result": {"tools": [
                    {"name": "get_stock_info", "inputSchema": {"type": "object"}}
                ]}}),
            ]))
            .create_async()
            .await;
        let messages = server
            .mock("POST", "/messages/?session_id=abc")
            .with_status(202)
            .expect(3)
            .create_async()
            .await;

        let client = client_for(&server);
        let tools = client.list_tools().await.unwrap();

        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].name, "get_stock_info");
        rejected.assert_async().await;
        stream.assert_async().await;
        messages.assert_async().await;
    }

    #[tokio::test]
    async fn test_sse_transport_calls_tool() {
        let mut server = mockito::Server::new_async().await;
        let _stream = server
            .mock("GET", "/")
            .with_status(200)
            .with_header("content-type", "text/event-stream")
            .with_body(legacy_stream(&[
                json!({"jsonrpc": "2.0", "id": 1, "result": {}}),
                json!({"jsonrpc": "2.0", "method": "notifications/progress", "params": {}}),
                json!({"jsonrpc": "2.0", "id": 2, "result": {
                    "content": [{"type": "text", "text": "{\"price\": 187.5}"}]
                }}),
            ]))
            .create_async()
            .await;
        let call = server
            .mock("POST", "/messages/?session_id=abc")
            .match_body(Matcher::PartialJson(json!({
                "method": "tools/call",
                "params": {"name": "get_stock_info"}
            })))
            .with_status(202)
            .create_async()
            .await;
        let _handshake = server
            .mock("POST", "/messages/?session_id=abc")
            .with_status(202)
            .create_async()
            .await;

        let client = client_for(&server).with_transport(Transport::Sse);
        let value = client
            .call_tool("get_stock_info", json!({"symbol": "AAPL"}))
            .await
            .unwrap();

        assert_eq!(value, json!({"price": 187.5}));
        call.assert_async().await;
    }

    #[tokio::test]
    async fn test_sse_stream_without_reply_fails() {
        let mut server = mockito::Server::new_async().await;
        let _stream = server
            .mock("GET", "/")
            .with_status(200)
            .with_header("content-type", "text/event-stream")
            .with_body(legacy_stream(&[]))
            .create_async()
            .await;
        let _messages = server
            .mock("POST", "/messages/?session_id=abc")
            .with_status(202)
            .create_async()
            .await;

        let client = client_for(&server).with_transport(Transport::Sse);
        let err = client.list_tools().await.unwrap_err();
        assert_eq!(err.kind(), "connectivity");
    }

    #[test]
    fn test_transport_parse() {
        assert_eq!("SSE".parse::<Transport>().unwrap(), Transport::Sse);
        assert_eq!("http".parse::<Transport>().unwrap(), Transport::StreamableHttp);
        assert_eq!("auto".parse::<Transport>().unwrap(), Transport::Auto);
        assert_eq!("websocket".parse::<Transport>().unwrap_err().kind(), "config");
        assert_eq!(Transport::Sse.to_string(), "sse");
    }

    #[tokio::test]
    async fn test_unreachable_server_is_connectivity_error() {
        let client = McpHttpClient::new("http://127.0.0.1:1/", Duration::from_secs(2)).unwrap();
        let err = client.list_tools().await.unwrap_err();
        assert_eq!(err.kind(), "connectivity");
    }
}
