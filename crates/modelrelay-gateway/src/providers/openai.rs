//! OpenAI-compatible provider adapter.
//!
//! Speaks the Chat Completions dialect used by OpenAI, Groq, Cerebras,
//! Together, Fireworks, and most self-hosted inference servers: `tools`
//! with a `function` wrapper, `tool_calls` on assistant messages, and
//! `data:` SSE lines whose deltas are keyed by tool-call index.

use std::sync::RwLock;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderValue};
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

/// Default maximum tokens per response when the caller does not choose.
const DEFAULT_MAX_TOKENS: u32 = 4096;

/// Adapter for OpenAI-style chat completion endpoints.
#[derive(Debug)]
pub struct OpenAiCompatProvider {
    spec: &'static ProviderSpec,
    base_url: String,
    default_model: String,
    /// Credential resolved at construction (override → environment).
    config_key: Option<String>,
    /// Rotation hot-swap; `None` falls back to `config_key`.
    key_override: RwLock<Option<String>>,
    http: reqwest::Client,
}

impl OpenAiCompatProvider {
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
                .unwrap_or_else(|| default_model_for(spec.name).to_owned()),
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
        let model = options
            .model
            .clone()
            .filter(|m| !m.is_empty())
            .unwrap_or_else(|| self.default_model.clone());

        let mut body = json!({
            "model": model,
            "max_tokens": options.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
            "messages": messages_to_openai(messages),
        });

        if let Some(temp) = options.temperature {
            body["temperature"] = json!(temp);
        }

        if !tools.is_empty() && self.spec.supports_tools {
            body["tools"] = self.format_tools(tools);
            body["tool_choice"] = tool_choice_to_openai(options.tool_choice.as_ref());
        }

        if stream {
            body["stream"] = json!(true);
        }

        body
    }

    async fn send(&self, body: &Value) -> Result<reqwest::Response> {
        let url = format!("{}/chat/completions", self.base_url);

        let mut headers = HeaderMap::new();
        if let Some(api_key) = self.current_api_key() {
            let auth = format!("Bearer {api_key}");
            headers.insert(
                AUTHORIZATION,
                HeaderValue::from_str(&auth).map_err(|e| {
                    GatewayError::transport(format!("invalid authorization header: {e}"))
                })?,
            );
        }
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
impl ProviderClient for OpenAiCompatProvider {
    fn name(&self) -> &str {
        self.spec.name
    }

    fn style(&self) -> ProviderStyle {
        ProviderStyle::OpenAi
    }

    fn is_configured(&self) -> bool {
        self.spec.no_auth || self.current_api_key().is_some()
    }

    fn default_model(&self) -> String {
        self.default_model.clone()
    }

    fn models(&self) -> Vec<String> {
        models_for(self.spec.name)
    }

    fn format_tools(&self, tools: &[ToolDefinition]) -> Value {
        tools_to_openai(tools)
    }

    fn format_messages(&self, messages: &[ChatMessage]) -> Value {
        Value::Array(messages_to_openai(messages))
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

        parse_openai_response(&v)
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
        let mut accumulator = OpenAiStreamAccumulator::new();
        let mut byte_stream = resp.bytes_stream();

        while let Some(chunk) = byte_stream.next().await {
            let chunk =
                chunk.map_err(|e| GatewayError::transport(format!("stream read error: {e}")))?;

            for payload in decoder.feed(&chunk) {
                if let Some(delta) = accumulator.feed_json(&payload) {
                    on_content(&delta);
                }
            }

            if decoder.is_done() {
                break;
            }
        }

        Ok(accumulator.into_response())
    }
}

// ───────────────────────────────────────────────────────────────────────
// Wire conversion (free functions)
// ───────────────────────────────────────────────────────────────────────

/// Convert canonical messages to the Chat Completions wire format.
///
/// System messages stay in the `messages` array, tool calls ride on
/// assistant messages, and tool results use `role: "tool"` with a
/// `tool_call_id`.
pub fn messages_to_openai(messages: &[ChatMessage]) -> Vec<Value> {
    let mut wire: Vec<Value> = Vec::with_capacity(messages.len());

    for msg in messages {
        match msg.role {
            Role::System => wire.push(json!({"role": "system", "content": msg.content})),
            Role::User => wire.push(json!({"role": "user", "content": msg.content})),
            Role::Assistant => {
                if msg.tool_calls.is_empty() {
                    wire.push(json!({"role": "assistant", "content": msg.content}));
                } else {
                    let tool_calls: Vec<Value> =
                        msg.tool_calls.iter().map(ToolCall::to_openai_format).collect();
                    let mut m = json!({"role": "assistant", "tool_calls": tool_calls});
                    if !msg.content.is_empty() {
                        m["content"] = json!(msg.content);
                    }
                    wire.push(m);
                }
            }
            Role::Tool => wire.push(json!({
                "role": "tool",
                "tool_call_id": msg.tool_call_id,
                "content": msg.content,
            })),
        }
    }

    wire
}

/// Convert canonical tool definitions into the `function` wrapper shape.
pub fn tools_to_openai(tools: &[ToolDefinition]) -> Value {
    let wire: Vec<Value> = tools
        .iter()
        .map(|t| {
            json!({
                "type": "function",
                "function": {
                    "name": t.name,
                    "description": t.description,
                    "parameters": t.parameters,
                },
            })
        })
        .collect();
    json!(wire)
}

fn tool_choice_to_openai(choice: Option<&ToolChoice>) -> Value {
    match choice {
        None | Some(ToolChoice::Auto) => json!("auto"),
        Some(ToolChoice::Any) => json!("required"),
        Some(ToolChoice::Tool(name)) => json!({
            "type": "function",
            "function": {"name": name},
        }),
    }
}

/// Map a Chat Completions finish reason onto the canonical enum.  Unknown
/// values map to [`FinishReason::Stop`], never to `Error`.
pub fn map_openai_finish(reason: Option<&str>) -> FinishReason {
    match reason {
        Some("tool_calls") => FinishReason::ToolCalls,
        Some("length") => FinishReason::Length,
        _ => FinishReason::Stop,
    }
}

/// Parse a non-streaming Chat Completions response.
pub fn parse_openai_response(v: &Value) -> Result<LlmResponse> {
    let choice = &v["choices"][0];
    let message = &choice["message"];
    if message.is_null() {
        return Err(GatewayError::protocol(
            "missing `choices[0].message` in response",
        ));
    }

    let tool_calls: Vec<ToolCall> = message["tool_calls"]
        .as_array()
        .map(|calls| calls.iter().map(ToolCall::from_openai).collect())
        .unwrap_or_default();

    let usage = &v["usage"];
    Ok(LlmResponse {
        content: message["content"].as_str().unwrap_or_default().to_owned(),
        finish_reason: map_openai_finish(choice["finish_reason"].as_str()),
        model: v["model"].as_str().map(String::from),
        usage: Usage::new(
            usage["prompt_tokens"].as_u64().unwrap_or(0),
            usage["completion_tokens"].as_u64().unwrap_or(0),
        ),
        tool_calls,
        raw: v.clone(),
    })
}

/// Build a transport error carrying the most specific message available:
/// `error.message`, then `message`, then the raw body.
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

/// Accumulates Chat Completions stream fragments into a complete response.
///
/// Text deltas concatenate; tool-call deltas are correlated by `index` and
/// assembled across chunks (the id and name usually arrive first, argument
/// fragments follow).
#[derive(Debug, Default)]
pub struct OpenAiStreamAccumulator {
    content: String,
    builders: Vec<ToolCallBuilder>,
    finish_reason: Option<FinishReason>,
    model: Option<String>,
    usage: Usage,
}

#[derive(Debug, Default)]
struct ToolCallBuilder {
    id: String,
    name: String,
    /// Accumulated argument JSON string.
    arguments: String,
}

impl OpenAiStreamAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one decoded `data:` payload.  Returns the text delta when the
    /// payload carried one.  A malformed payload is skipped — one corrupt
    /// event must not lose the rest of the response.
    pub fn feed_json(&mut self, payload: &str) -> Option<String> {
        let v: Value = match serde_json::from_str(payload) {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(error = %e, "skipping malformed stream payload");
                return None;
            }
        };

        if let Some(model) = v["model"].as_str() {
            self.model = Some(model.to_owned());
        }

        // Some OpenAI-compatible servers attach usage to the final chunk.
        let usage = &v["usage"];
        if usage.is_object() {
            self.usage = Usage::new(
                usage["prompt_tokens"].as_u64().unwrap_or(0),
                usage["completion_tokens"].as_u64().unwrap_or(0),
            );
        }

        let choice = &v["choices"][0];
        if let Some(reason) = choice["finish_reason"].as_str() {
            self.finish_reason = Some(map_openai_finish(Some(reason)));
        }

        let delta = &choice["delta"];
        if delta.is_null() {
            return None;
        }

        if let Some(tool_calls) = delta["tool_calls"].as_array() {
            for tc in tool_calls {
                let index = tc["index"].as_u64().unwrap_or(0) as usize;
                while self.builders.len() <= index {
                    self.builders.push(ToolCallBuilder::default());
                }
                let builder = &mut self.builders[index];

                if let Some(id) = tc["id"].as_str() {
                    builder.id = id.to_owned();
                }
                let func = &tc["function"];
                if let Some(name) = func["name"].as_str() {
                    builder.name.push_str(name);
                }
                if let Some(args) = func["arguments"].as_str() {
                    builder.arguments.push_str(args);
                }
            }
        }

        delta["content"].as_str().map(|content| {
            self.content.push_str(content);
            content.to_owned()
        })
    }

    /// Finalize into an [`LlmResponse`].
    ///
    /// Accumulated argument strings are decoded defensively: arguments that
    /// never became valid JSON are replaced with an empty object rather
    /// than dropping the call.
    pub fn into_response(self) -> LlmResponse {
        let tool_calls: Vec<ToolCall> = self
            .builders
            .into_iter()
            .filter(|b| !b.name.is_empty())
            .map(|b| {
                let arguments: Value = if b.arguments.is_empty() {
                    json!({})
                } else {
                    serde_json::from_str(&b.arguments).unwrap_or_else(|e| {
                        tracing::warn!(tool = %b.name, error = %e, "tool call arguments never became valid JSON");
                        json!({})
                    })
                };
                let id = if b.id.is_empty() {
                    format!("tc_{}", Uuid::now_v7().simple())
                } else {
                    b.id
                };
                ToolCall::from_parts(id, b.name, arguments)
            })
            .collect();

        let finish_reason = self.finish_reason.unwrap_or(if tool_calls.is_empty() {
            FinishReason::Stop
        } else {
            FinishReason::ToolCalls
        });

        LlmResponse {
            content: self.content,
            tool_calls,
            finish_reason,
            model: self.model,
            usage: self.usage,
            raw: Value::Null,
        }
    }
}

/// Per-provider default models.
pub(crate) fn default_model_for(provider: &str) -> &'static str {
    match provider {
        "openai" => "gpt-4o",
        "groq" => "llama-3.3-70b-versatile",
        "cerebras" => "openai/gpt-oss-120b",
        "together" => "meta-llama/Meta-Llama-3.1-70B-Instruct-Turbo",
        "fireworks" => "accounts/fireworks/models/llama-v3p1-70b-instruct",
        "local" => "local-default",
        _ => "gpt-4o",
    }
}

/// Per-provider known model identifiers.
pub(crate) fn models_for(provider: &str) -> Vec<String> {
    let models: &[&str] = match provider {
        "openai" => &["gpt-4o", "gpt-4o-mini", "gpt-4-turbo", "o1-mini"],
        "groq" => &[
            "llama-3.3-70b-versatile",
            "llama-3.1-8b-instant",
            "openai/gpt-oss-120b",
            "moonshotai/kimi-k2-instruct-0905",
            "llama-3.2-11b-vision-preview",
        ],
        "cerebras" => &["openai/gpt-oss-120b", "llama-3.3-70b", "qwen-3-32b"],
        "together" => &[
            "meta-llama/Meta-Llama-3.1-70B-Instruct-Turbo",
            "mistralai/Mixtral-8x7B-Instruct-v0.1",
            "Qwen/Qwen2.5-72B-Instruct-Turbo",
        ],
        "fireworks" => &[
            "accounts/fireworks/models/llama-v3p1-70b-instruct",
            "accounts/fireworks/models/mixtral-8x7b-instruct",
        ],
        "local" => &["local-default"],
        _ => &[],
    };
    models.iter().map(|m| (*m).to_owned()).collect()
}

// ───────────────────────────────────────────────────────────────────────
// Tests
// ───────────────────────────────────────────────────────────────────────
