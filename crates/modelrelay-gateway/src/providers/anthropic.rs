//! Anthropic Messages API adapter.
//!
//! This dialect differs from chat completions in every place that matters
//! here: the system prompt is a top-level field, assistant output is a list
//! of content blocks, tool calls arrive as `tool_use` blocks, tool results
//! go back as `tool_result` blocks inside a user message, and streaming
//! events are typed (`message_start`, `content_block_delta`, ...) with
//! tool input JSON split across `input_json_delta` fragments.

use std::sync::RwLock;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header::{CONTENT_TYPE, HeaderMap, HeaderValue};
use serde_json::{Value, json};
use uuid::Uuid;

use crate::error::{GatewayError, Result};
use crate::providers::{
    ContentCallback, DEFAULT_TIMEOUT_SECS, ProviderClient, ProviderOverrides, ProviderSpec,
    ProviderStyle, env_api_key,
};
use crate::sse::SseLineDecoder;
use crate::types::{
    ChatMessage, ChatOptions, FinishReason, LlmResponse, Role, ToolCall, ToolChoice,
    ToolDefinition, Usage,
};

/// Messages API version header value.
const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Default maximum tokens per response when the caller does not choose.
const DEFAULT_MAX_TOKENS: u32 = 4096;

/// Adapter for the Anthropic Messages API.
#[derive(Debug)]
pub struct AnthropicProvider {
    spec: &'static ProviderSpec,
    base_url: String,
    default_model: String,
    config_key: Option<String>,
    key_override: RwLock<Option<String>>,
    http: reqwest::Client,
}

impl AnthropicProvider {
    pub fn new(spec: &'static ProviderSpec, overrides: ProviderOverrides) -> Result<Self> {
        let config_key = overrides.api_key.or_else(|| env_api_key(spec));
        let timeout = overrides.timeout_secs.unwrap_or(DEFAULT_TIMEOUT_SECS);

        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout))
            .build()
            .map_err(|e| GatewayError::transport(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            spec,
            base_url: overrides
                .base_url
                .unwrap_or_else(|| spec.base_url.to_owned()),
            default_model: overrides
                .model
                .unwrap_or_else(|| "claude-sonnet-4-20250514".to_owned()),
            config_key,
            key_override: RwLock::new(None),
            http,
        })
    }

    fn current_api_key(&self) -> Option<String> {
        self.key_override
            .read()
            .ok()
            .and_then(|o| o.clone())
            .or_else(|| self.config_key.clone())
    }

    fn require_configured(&self) -> Result<()> {
        if self.is_configured() {
            Ok(())
        } else {
            Err(GatewayError::Configuration {
                provider: self.spec.name.to_owned(),
                reason: format!("missing api key (set {})", self.spec.env_key),
            })
        }
    }

    fn build_request_body(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolDefinition],
        options: &ChatOptions,
        stream: bool,
    ) -> Value {
        let (system, wire_messages) = messages_to_anthropic(messages);
        let model = options
            .model
            .clone()
            .filter(|m| !m.is_empty())
            .unwrap_or_else(|| self.default_model.clone());

        let mut body = json!({
            "model": model,
            "max_tokens": options.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
            "messages": wire_messages,
        });

        if let Some(system) = system {
            body["system"] = json!(system);
        }
        if let Some(temp) = options.temperature {
            body["temperature"] = json!(temp);
        }
        if !tools.is_empty() {
            body["tools"] = self.format_tools(tools);
            if let Some(choice) = &options.tool_choice {
                body["tool_choice"] = tool_choice_to_anthropic(choice);
            }
        }
        if stream {
            body["stream"] = json!(true);
        }

        body
    }

    async fn send(&self, body: &Value) -> Result<reqwest::Response> {
        let url = format!("{}/messages", self.base_url);

        let api_key = self.current_api_key().unwrap_or_default();
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-api-key",
            HeaderValue::from_str(&api_key)
                .map_err(|e| GatewayError::transport(format!("invalid api key header: {e}")))?,
        );
        headers.insert(
            "anthropic-version",
            HeaderValue::from_static(ANTHROPIC_VERSION),
        );
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        tracing::debug!(url = %url, model = %body["model"], provider = %self.spec.name, "sending chat request");

        self.http
            .post(&url)
            .headers(headers)
            .json(body)
            .send()
            .await
            .map_err(GatewayError::from)
    }
}

#[async_trait]
impl ProviderClient for AnthropicProvider {
    fn name(&self) -> &str {
        self.spec.name
    }

    fn style(&self) -> ProviderStyle {
        ProviderStyle::Anthropic
    }

    fn is_configured(&self) -> bool {
        self.spec.no_auth || self.current_api_key().is_some()
    }

    fn default_model(&self) -> String {
        self.default_model.clone()
    }

    fn models(&self) -> Vec<String> {
        [
            "claude-sonnet-4-20250514",
            "claude-3-5-sonnet-20241022",
            "claude-3-5-haiku-20241022",
            "claude-3-opus-20240229",
        ]
        .iter()
        .map(|m| (*m).to_owned())
        .collect()
    }

    fn format_tools(&self, tools: &[ToolDefinition]) -> Value {
        tools_to_anthropic(tools)
    }

    fn format_messages(&self, messages: &[ChatMessage]) -> Value {
        let (system, wire) = messages_to_anthropic(messages);
        json!({
            "messages": wire,
            "system": system,
        })
    }

    fn set_key_override(&self, api_key: Option<String>) {
        if let Ok(mut o) = self.key_override.write() {
            *o = api_key;
        }
    }

    async fn chat(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolDefinition],
        options: &ChatOptions,
    ) -> Result<LlmResponse> {
        self.require_configured()?;

        let body = self.build_request_body(messages, tools, options, false);
        let resp = self.send(&body).await?;

        let status = resp.status();
        let text = resp
            .text()
            .await
            .map_err(|e| GatewayError::transport(format!("failed to read response body: {e}")))?;

        if !status.is_success() {
            return Err(transport_error(status.as_u16(), &text));
        }

        let v: Value = serde_json::from_str(&text)
            .map_err(|e| GatewayError::protocol(format!("invalid JSON response: {e}")))?;

        parse_anthropic_response(&v)
    }

    async fn chat_stream(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolDefinition],
        options: &ChatOptions,
        on_content: &mut ContentCallback<'_>,
    ) -> Result<LlmResponse> {
        self.require_configured()?;

        let body = self.build_request_body(messages, tools, options, true);
        let resp = self.send(&body).await?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(transport_error(status.as_u16(), &text));
        }

        let mut decoder = SseLineDecoder::new();
        let mut accumulator = AnthropicStreamAccumulator::new();
        let mut byte_stream = resp.bytes_stream();

        while let Some(chunk) = byte_stream.next().await {
            let chunk =
                chunk.map_err(|e| GatewayError::transport(format!("stream read error: {e}")))?;

            for payload in decoder.feed(&chunk) {
                if let Some(delta) = accumulator.feed_json(&payload) {
                    on_content(&delta);
                }
            }

            if accumulator.is_done() || decoder.is_done() {
                break;
            }
        }

        Ok(accumulator.into_response())
    }
}

// ───────────────────────────────────────────────────────────────────────
// Wire conversion (free functions)
// ───────────────────────────────────────────────────────────────────────

/// Split the system prompt out (the Messages API wants it as a top-level
/// field) and convert the remaining canonical messages to wire shape.
pub fn messages_to_anthropic(messages: &[ChatMessage]) -> (Option<String>, Vec<Value>) {
    let mut system: Option<String> = None;
    let mut wire: Vec<Value> = Vec::with_capacity(messages.len());

    for msg in messages {
        match msg.role {
            Role::System => match &mut system {
                Some(existing) => {
                    existing.push_str("\n\n");
                    existing.push_str(&msg.content);
                }
                None => system = Some(msg.content.clone()),
            },
            Role::User => wire.push(json!({"role": "user", "content": msg.content})),
            Role::Assistant => {
                if msg.tool_calls.is_empty() {
                    wire.push(json!({"role": "assistant", "content": msg.content}));
                } else {
                    let mut content: Vec<Value> = Vec::new();
                    if !msg.content.is_empty() {
                        content.push(json!({"type": "text", "text": msg.content}));
                    }
                    for tc in &msg.tool_calls {
                        content.push(tc.to_anthropic_format());
                    }
                    wire.push(json!({"role": "assistant", "content": content}));
                }
            }
            // Tool results are user messages with a tool_result block.
            Role::Tool => wire.push(json!({
                "role": "user",
                "content": [{
                    "type": "tool_result",
                    "tool_use_id": msg.tool_call_id,
                    "content": msg.content,
                }],
            })),
        }
    }

    (system, wire)
}

/// Convert canonical tool definitions into the Messages API shape.
pub fn tools_to_anthropic(tools: &[ToolDefinition]) -> Value {
    let wire: Vec<Value> = tools
        .iter()
        .map(|t| {
            json!({
                "name": t.name,
                "description": t.description,
                "input_schema": t.parameters,
            })
        })
        .collect();
    json!(wire)
}

fn tool_choice_to_anthropic(choice: &ToolChoice) -> Value {
    match choice {
        ToolChoice::Auto => json!({"type": "auto"}),
        ToolChoice::Any => json!({"type": "any"}),
        ToolChoice::Tool(name) => json!({"type": "tool", "name": name}),
    }
}

/// Map a Messages API stop reason onto the canonical enum.  Unknown values
/// map to [`FinishReason::Stop`], never to `Error`.
pub fn map_anthropic_finish(stop_reason: Option<&str>) -> FinishReason {
    match stop_reason {
        Some("tool_use") => FinishReason::ToolCalls,
        Some("max_tokens") => FinishReason::Length,
        _ => FinishReason::Stop,
    }
}

/// Parse a non-streaming Messages API response.
pub fn parse_anthropic_response(v: &Value) -> Result<LlmResponse> {
    let blocks = v["content"]
        .as_array()
        .ok_or_else(|| GatewayError::protocol("missing `content` array in response"))?;

    let mut content = String::new();
    let mut tool_calls: Vec<ToolCall> = Vec::new();

    for block in blocks {
        match block["type"].as_str() {
            Some("text") => content.push_str(block["text"].as_str().unwrap_or_default()),
            Some("tool_use") => tool_calls.push(ToolCall::from_anthropic(block)),
            _ => {}
        }
    }

    let usage = &v["usage"];
    Ok(LlmResponse {
        content,
        finish_reason: map_anthropic_finish(v["stop_reason"].as_str()),
        model: v["model"].as_str().map(String::from),
        usage: Usage::new(
            usage["input_tokens"].as_u64().unwrap_or(0),
            usage["output_tokens"].as_u64().unwrap_or(0),
        ),
        tool_calls,
        raw: v.clone(),
    })
}

/// Build a transport error carrying the most specific message available.
fn transport_error(status: u16, body: &str) -> GatewayError {
    let message = serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| {
            v["error"]["message"]
                .as_str()
                .or_else(|| v["message"].as_str())
                .map(String::from)
        })
        .unwrap_or_else(|| body.trim().to_owned());

    GatewayError::Transport {
        status: Some(status),
        message,
    }
}

// ───────────────────────────────────────────────────────────────────────
// Stream accumulator
// ───────────────────────────────────────────────────────────────────────

/// Accumulates Messages API stream events into a complete response.
///
/// Tool input arrives as `input_json_delta` fragments scoped to the open
/// content block; a call is finalized only at `content_block_stop`, so a
/// cancelled stream discards its partial call instead of emitting it.
#[derive(Debug, Default)]
pub struct AnthropicStreamAccumulator {
    content: String,
    current: Option<ToolUseBuilder>,
    tool_calls: Vec<ToolCall>,
    finish_reason: Option<FinishReason>,
    model: Option<String>,
    usage: Usage,
    done: bool,
}

#[derive(Debug)]
struct ToolUseBuilder {
    id: String,
    name: String,
    input_json: String,
}

impl AnthropicStreamAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// True once `message_stop` has been seen.
    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Feed one decoded `data:` payload.  Returns the text delta when the
    /// event carried one.  A malformed payload is skipped.
    pub fn feed_json(&mut self, payload: &str) -> Option<String> {
        let v: Value = match serde_json::from_str(payload) {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(error = %e, "skipping malformed stream payload");
                return None;
            }
        };

        match v["type"].as_str() {
            Some("message_start") => {
                let message = &v["message"];
                if let Some(model) = message["model"].as_str() {
                    self.model = Some(model.to_owned());
                }
                self.usage.prompt_tokens = message["usage"]["input_tokens"].as_u64().unwrap_or(0);
                None
            }

            Some("content_block_start") => {
                let block = &v["content_block"];
                if block["type"] == "tool_use" {
                    self.current = Some(ToolUseBuilder {
                        id: block["id"]
                            .as_str()
                            .map(String::from)
                            .unwrap_or_else(|| format!("tu_{}", Uuid::now_v7().simple())),
                        name: block["name"].as_str().unwrap_or_default().to_owned(),
                        input_json: String::new(),
                    });
                }
                None
            }

            Some("content_block_delta") => {
                let delta = &v["delta"];
                match delta["type"].as_str() {
                    Some("text_delta") => {
                        let text = delta["text"].as_str().unwrap_or_default().to_owned();
                        self.content.push_str(&text);
                        Some(text)
                    }
                    Some("input_json_delta") => {
                        if let Some(builder) = &mut self.current {
                            builder
                                .input_json
                                .push_str(delta["partial_json"].as_str().unwrap_or_default());
                        }
                        None
                    }
                    other => {
                        tracing::trace!(delta_type = ?other, "ignoring unknown delta type");
                        None
                    }
                }
            }

            Some("content_block_stop") => {
                if let Some(builder) = self.current.take() {
                    let arguments: Value = if builder.input_json.is_empty() {
                        json!({})
                    } else {
                        serde_json::from_str(&builder.input_json).unwrap_or_else(|e| {
                            tracing::warn!(tool = %builder.name, error = %e, "tool input never became valid JSON");
                            json!({})
                        })
                    };
                    self.tool_calls
                        .push(ToolCall::from_parts(builder.id, builder.name, arguments));
                }
                None
            }

            Some("message_delta") => {
                if let Some(stop) = v["delta"]["stop_reason"].as_str() {
                    self.finish_reason = Some(map_anthropic_finish(Some(stop)));
                }
                if let Some(output) = v["usage"]["output_tokens"].as_u64() {
                    self.usage = Usage::new(self.usage.prompt_tokens, output);
                }
                None
            }

            Some("message_stop") => {
                self.done = true;
                None
            }

            // ping and anything newer
            other => {
                tracing::trace!(event_type = ?other, "ignoring stream event");
                None
            }
        }
    }

    /// Finalize into an [`LlmResponse`].  A still-open tool block (stream
    /// cut before `content_block_stop`) is discarded, not emitted.
    pub fn into_response(self) -> LlmResponse {
        let finish_reason = self.finish_reason.unwrap_or(if self.tool_calls.is_empty() {
            FinishReason::Stop
        } else {
            FinishReason::ToolCalls
        });

        LlmResponse {
            content: self.content,
            tool_calls: self.tool_calls,
            finish_reason,
            model: self.model,
            usage: self.usage,
            raw: Value::Null,
        }
    }
}

// ───────────────────────────────────────────────────────────────────────
// Tests
// ───────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::provider_spec;

    fn provider() -> AnthropicProvider {
        AnthropicProvider::new(
            provider_spec("anthropic").unwrap(),
            ProviderOverrides {
                api_key: Some("sk-ant-test".into()),
                ..Default::default()
            },
        )
        .unwrap()
    }

    #[test]
    fn system_messages_become_top_level_field() {
        let p = provider();
        let messages = vec![
            ChatMessage::system("You are helpful."),
            ChatMessage::user("Hello"),
        ];
        let body = p.build_request_body(&messages, &[], &ChatOptions::default(), false);

        assert_eq!(body["system"], "You are helpful.");
        let wire = body["messages"].as_array().unwrap();
        assert_eq!(wire.len(), 1);
        assert_eq!(wire[0]["role"], "user");
    }

    #[test]
    fn multiple_system_messages_are_joined() {
        let (system, _) = messages_to_anthropic(&[
            ChatMessage::system("First."),
            ChatMessage::system("Second."),
        ]);
        assert_eq!(system.as_deref(), Some("First.\n\nSecond."));
    }

    #[test]
    fn tool_round_trip_in_messages() {
        let messages = vec![
            ChatMessage::user("Read test.txt"),
            ChatMessage::assistant_tool_calls(
                "",
                vec![ToolCall::from_parts("tu_01", "read_file", json!({"path": "test.txt"}))],
            ),
            ChatMessage::tool_result("tu_01", "file contents here"),
        ];
        let (_, wire) = messages_to_anthropic(&messages);

        assert_eq!(wire[1]["role"], "assistant");
        assert_eq!(wire[1]["content"][0]["type"], "tool_use");
        assert_eq!(wire[1]["content"][0]["id"], "tu_01");
        assert_eq!(wire[2]["role"], "user");
        assert_eq!(wire[2]["content"][0]["type"], "tool_result");
        assert_eq!(wire[2]["content"][0]["tool_use_id"], "tu_01");
    }

    #[test]
    fn tools_use_input_schema() {
        let wire = tools_to_anthropic(&[ToolDefinition::new(
            "read_file",
            "Read a file",
            json!({"type": "object", "properties": {"path": {"type": "string"}}}),
        )]);
        assert_eq!(wire[0]["name"], "read_file");
        assert!(wire[0]["input_schema"]["properties"]["path"].is_object());
        assert!(wire[0].get("parameters").is_none());
    }

    #[test]
    fn tool_choice_shapes() {
        assert_eq!(tool_choice_to_anthropic(&ToolChoice::Auto), json!({"type": "auto"}));
        assert_eq!(tool_choice_to_anthropic(&ToolChoice::Any), json!({"type": "any"}));
        assert_eq!(
            tool_choice_to_anthropic(&ToolChoice::Tool("read_file".into())),
            json!({"type": "tool", "name": "read_file"})
        );
    }

    #[test]
    fn parse_text_response() {
        let v = json!({
            "id": "msg_01",
            "model": "claude-sonnet-4-20250514",
            "content": [{"type": "text", "text": "Hello, world!"}],
            "stop_reason": "end_turn",
            "usage": {"input_tokens": 10, "output_tokens": 5},
        });

        let resp = parse_anthropic_response(&v).unwrap();
        assert_eq!(resp.content, "Hello, world!");
        assert_eq!(resp.finish_reason, FinishReason::Stop);
        assert_eq!(resp.usage.total_tokens, 15);
    }

    #[test]
    fn parse_tool_use_response() {
        let v = json!({
            "content": [{
                "type": "tool_use",
                "id": "toolu_01",
                "name": "read_file",
                "input": {"path": "/tmp/test.txt"},
            }],
            "stop_reason": "tool_use",
            "usage": {"input_tokens": 20, "output_tokens": 15},
        });

        let resp = parse_anthropic_response(&v).unwrap();
        assert_eq!(resp.finish_reason, FinishReason::ToolCalls);
        assert_eq!(resp.tool_calls.len(), 1);
        assert_eq!(resp.tool_calls[0].id, "toolu_01");
        assert_eq!(resp.tool_calls[0].arguments["path"], "/tmp/test.txt");
    }

    #[test]
    fn missing_content_is_protocol_error() {
        let err = parse_anthropic_response(&json!({"id": "msg_01"})).unwrap_err();
        assert!(matches!(err, GatewayError::Protocol { .. }));
    }

    #[test]
    fn unknown_stop_reason_maps_to_stop() {
        assert_eq!(map_anthropic_finish(Some("pause_turn")), FinishReason::Stop);
        assert_eq!(map_anthropic_finish(None), FinishReason::Stop);
    }

    // ── accumulator ──────────────────────────────────────────────────

    #[test]
    fn text_deltas_stream_through() {
        let mut acc = AnthropicStreamAccumulator::new();
        acc.feed_json(r#"{"type":"message_start","message":{"id":"msg_01","model":"claude-sonnet-4-20250514","usage":{"input_tokens":12}}}"#);
        let d1 = acc.feed_json(
            r#"{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"Hel"}}"#,
        );
        assert_eq!(d1.as_deref(), Some("Hel"));
        let d2 = acc.feed_json(
            r#"{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"lo"}}"#,
        );
        assert_eq!(d2.as_deref(), Some("lo"));
        acc.feed_json(r#"{"type":"message_delta","delta":{"stop_reason":"end_turn"},"usage":{"output_tokens":4}}"#);
        acc.feed_json(r#"{"type":"message_stop"}"#);

        assert!(acc.is_done());
        let resp = acc.into_response();
        assert_eq!(resp.content, "Hello");
        assert_eq!(resp.model.as_deref(), Some("claude-sonnet-4-20250514"));
        assert_eq!(resp.usage.prompt_tokens, 12);
        assert_eq!(resp.usage.completion_tokens, 4);
    }

    #[test]
    fn tool_use_input_reassembles_across_deltas() {
        let mut acc = AnthropicStreamAccumulator::new();
        acc.feed_json(r#"{"type":"content_block_start","index":1,"content_block":{"type":"tool_use","id":"toolu_01","name":"write_file"}}"#);
        acc.feed_json(r#"{"type":"content_block_delta","index":1,"delta":{"type":"input_json_delta","partial_json":"{\"path\":"}}"#);
        acc.feed_json(r#"{"type":"content_block_delta","index":1,"delta":{"type":"input_json_delta","partial_json":"\"a.txt\"}"}}"#);
        acc.feed_json(r#"{"type":"content_block_stop","index":1}"#);
        acc.feed_json(r#"{"type":"message_delta","delta":{"stop_reason":"tool_use"},"usage":{"output_tokens":9}}"#);
        acc.feed_json(r#"{"type":"message_stop"}"#);

        let resp = acc.into_response();
        assert_eq!(resp.finish_reason, FinishReason::ToolCalls);
        assert_eq!(resp.tool_calls.len(), 1);
        assert_eq!(resp.tool_calls[0].id, "toolu_01");
        assert_eq!(resp.tool_calls[0].arguments["path"], "a.txt");
    }

    #[test]
    fn unterminated_tool_block_is_discarded() {
        let mut acc = AnthropicStreamAccumulator::new();
        acc.feed_json(r#"{"type":"content_block_start","index":0,"content_block":{"type":"tool_use","id":"toolu_01","name":"write_file"}}"#);
        acc.feed_json(r#"{"type":"content_block_delta","index":0,"delta":{"type":"input_json_delta","partial_json":"{\"pa"}}"#);

        let resp = acc.into_response();
        assert!(resp.tool_calls.is_empty());
    }

    #[test]
    fn malformed_payload_is_skipped_not_fatal() {
        let mut acc = AnthropicStreamAccumulator::new();
        assert!(acc.feed_json("{broken").is_none());
        let d = acc.feed_json(
            r#"{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"ok"}}"#,
        );
        assert_eq!(d.as_deref(), Some("ok"));
    }

    #[test]
    fn ping_events_are_ignored() {
        let mut acc = AnthropicStreamAccumulator::new();
        assert!(acc.feed_json(r#"{"type":"ping"}"#).is_none());
        assert!(!acc.is_done());
    }
}
