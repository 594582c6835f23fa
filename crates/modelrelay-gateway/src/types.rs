//! Canonical types for chat and tool calling.
//!
//! These types give every other component one shape to reason about,
//! regardless of provider dialect.  The [`crate::providers`] modules
//! translate them into the OpenAI or Anthropic wire formats at request
//! build time.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use uuid::Uuid;

// ───────────────────────────────────────────────────────────────────────
// Messages
// ───────────────────────────────────────────────────────────────────────

/// The role of a participant in a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// System-level instructions that shape model behavior.
    System,
    /// Input from the human user.
    User,
    /// Output from the model.
    Assistant,
    /// Result of a tool invocation, fed back to the model.
    Tool,
}

/// A single message in a conversation history.
///
/// Order within a history is semantically significant: messages are
/// strictly appended in causal order and never reordered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Who produced this message.
    pub role: Role,

    /// The textual content.  For [`Role::Tool`] messages this is the
    /// serialized tool result; for assistant messages that only carry tool
    /// calls it may be empty.
    #[serde(default)]
    pub content: String,

    /// Tool calls requested by the assistant (assistant messages only).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,

    /// Which tool call this message answers (tool messages only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl ChatMessage {
    /// Create a system message.
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }

    /// Create a user message.
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }

    /// Create an assistant text message.
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }

    /// Create an assistant message that carries tool calls (and possibly
    /// leading text).
    pub fn assistant_tool_calls(content: impl Into<String>, tool_calls: Vec<ToolCall>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            tool_calls,
            tool_call_id: None,
        }
    }

    /// Create a tool result message.
    pub fn tool_result(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: Role::Tool,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: Some(tool_call_id.into()),
        }
    }
}

// ───────────────────────────────────────────────────────────────────────
// Tool definitions
// ───────────────────────────────────────────────────────────────────────

/// A normalized tool definition, immutable once discovered.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    /// Unique tool name within a registry.
    pub name: String,

    /// Human-readable description of what the tool does.
    #[serde(default)]
    pub description: String,

    /// JSON-schema-like object describing the tool's parameters.
    pub parameters: Value,

    /// Where the definition was discovered (registry-defined, opaque here).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,

    /// Weak back-reference to the registry's handler.  Never owned or
    /// interpreted by the gateway beyond presence.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handler: Option<String>,
}

/// The schema used when a tool declares no parameters.
pub fn empty_parameters() -> Value {
    json!({
        "type": "object",
        "properties": {},
        "required": [],
    })
}

impl ToolDefinition {
    pub fn new(name: impl Into<String>, description: impl Into<String>, parameters: Value) -> Self {
        let parameters = if parameters.is_object() {
            parameters
        } else {
            empty_parameters()
        };
        Self {
            name: name.into(),
            description: description.into(),
            parameters,
            source: None,
            handler: None,
        }
    }

    /// Build a definition from any known raw shape: the OpenAI
    /// `{type:"function", function:{...}}` wrapper, the Anthropic
    /// `input_schema` shape, or the canonical shape itself.
    pub fn from_value(data: &Value) -> Self {
        // OpenAI format with a `function` wrapper.
        if data["type"] == "function"
            && let Some(func) = data["function"].as_object()
        {
            let mut def = Self::new(
                func.get("name").and_then(Value::as_str).unwrap_or_default(),
                func.get("description")
                    .and_then(Value::as_str)
                    .unwrap_or_default(),
                func.get("parameters").cloned().unwrap_or(Value::Null),
            );
            def.source = data["source"].as_str().map(String::from);
            def.handler = data["handler"].as_str().map(String::from);
            return def;
        }

        // Anthropic format with `input_schema`.
        if let Some(schema) = data.get("input_schema") {
            let mut def = Self::new(
                data["name"].as_str().unwrap_or_default(),
                data["description"].as_str().unwrap_or_default(),
                schema.clone(),
            );
            def.source = data["source"].as_str().map(String::from);
            def.handler = data["handler"].as_str().map(String::from);
            return def;
        }

        // Canonical shape (allow `schema` as a parameters alias).
        let parameters = data
            .get("parameters")
            .or_else(|| data.get("schema"))
            .cloned()
            .unwrap_or(Value::Null);
        let mut def = Self::new(
            data["name"]
                .as_str()
                .or_else(|| data["id"].as_str())
                .unwrap_or_default(),
            data["description"].as_str().unwrap_or_default(),
            parameters,
        );
        def.source = data["source"].as_str().map(String::from);
        def.handler = data["handler"].as_str().map(String::from);
        def
    }

    /// Canonical JSON shape.
    pub fn to_value(&self) -> Value {
        let mut v = json!({
            "name": self.name,
            "description": self.description,
            "parameters": self.parameters,
        });
        if let Some(source) = &self.source {
            v["source"] = json!(source);
        }
        if let Some(handler) = &self.handler {
            v["handler"] = json!(handler);
        }
        v
    }

    /// Names listed as required by the parameter schema.
    pub fn required_parameters(&self) -> Vec<&str> {
        self.parameters["required"]
            .as_array()
            .map(|names| names.iter().filter_map(Value::as_str).collect())
            .unwrap_or_default()
    }
}

/// Normalize a list of raw tool values into the canonical shape.
///
/// Canonical input passes through untouched, the OpenAI `function` wrapper
/// and the Anthropic `input_schema` shape are unwrapped, and anything
/// unrecognized passes through unchanged so callers stay forward-compatible
/// with shapes this gateway does not know yet.  Idempotent.
pub fn normalize_tools(raw: &[Value]) -> Vec<Value> {
    raw.iter()
        .map(|tool| {
            let recognized = (tool["type"] == "function" && tool["function"].is_object())
                || tool.get("input_schema").is_some()
                || tool.get("name").is_some();
            if recognized {
                ToolDefinition::from_value(tool).to_value()
            } else {
                tool.clone()
            }
        })
        .collect()
}

// ───────────────────────────────────────────────────────────────────────
// Tool calls
// ───────────────────────────────────────────────────────────────────────

/// A tool invocation requested by the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    /// Provider-issued identifier; synthesized when absent.
    pub id: String,

    /// The name of the tool to invoke.
    pub name: String,

    /// Arguments as a JSON object.
    pub arguments: Value,
}

impl ToolCall {
    /// Build from an already-normalized triple, filling common argument
    /// aliases so downstream handlers can rely on canonical keys.
    pub fn from_parts(id: impl Into<String>, name: impl Into<String>, arguments: Value) -> Self {
        let mut arguments = if arguments.is_object() {
            arguments
        } else {
            json!({})
        };
        fill_argument_aliases(&mut arguments);
        Self {
            id: id.into(),
            name: name.into(),
            arguments,
        }
    }

    /// Build from an OpenAI-style payload
    /// (`function.name` / `function.arguments`).
    ///
    /// `function.arguments` usually arrives as a JSON string; it is decoded
    /// defensively — undecodable arguments become an empty object rather
    /// than failing the whole response.
    pub fn from_openai(data: &Value) -> Self {
        let id = data["id"]
            .as_str()
            .map(String::from)
            .unwrap_or_else(|| format!("tc_{}", Uuid::now_v7().simple()));
        let name = data["function"]["name"]
            .as_str()
            .or_else(|| data["name"].as_str())
            .unwrap_or_default()
            .to_owned();

        let raw_args = data["function"]
            .get("arguments")
            .or_else(|| data.get("arguments"));
        let arguments = match raw_args {
            Some(Value::String(s)) => serde_json::from_str(s).unwrap_or_else(|_| json!({})),
            Some(v) if v.is_object() => v.clone(),
            _ => json!({}),
        };

        Self {
            id,
            name,
            arguments,
        }
    }

    /// Build from an Anthropic-style `tool_use` block (`name` / `input`).
    pub fn from_anthropic(data: &Value) -> Self {
        let id = data["id"]
            .as_str()
            .map(String::from)
            .unwrap_or_else(|| format!("tu_{}", Uuid::now_v7().simple()));
        Self {
            id,
            name: data["name"].as_str().unwrap_or_default().to_owned(),
            arguments: data
                .get("input")
                .filter(|v| v.is_object())
                .cloned()
                .unwrap_or_else(|| json!({})),
        }
    }

    /// Build from any format, auto-detecting the source dialect.
    pub fn from_value(data: &Value) -> Self {
        // OpenAI format detection.
        if data.get("function").is_some() || data["type"] == "function" {
            return Self::from_openai(data);
        }

        // Anthropic format detection.
        if data.get("input").is_some() || data["type"] == "tool_use" {
            return Self::from_anthropic(data);
        }

        // Normalized format.
        let id = data["id"]
            .as_str()
            .map(String::from)
            .unwrap_or_else(|| format!("tc_{}", Uuid::now_v7().simple()));
        Self::from_parts(
            id,
            data["name"].as_str().unwrap_or_default(),
            data.get("arguments").cloned().unwrap_or_else(|| json!({})),
        )
    }

    /// A single argument by name.
    pub fn argument(&self, name: &str) -> Option<&Value> {
        self.arguments.get(name)
    }

    /// OpenAI wire shape for conversation history.
    pub fn to_openai_format(&self) -> Value {
        json!({
            "id": self.id,
            "type": "function",
            "function": {
                "name": self.name,
                "arguments": self.arguments.to_string(),
            },
        })
    }

    /// Anthropic wire shape for conversation history.
    pub fn to_anthropic_format(&self) -> Value {
        json!({
            "type": "tool_use",
            "id": self.id,
            "name": self.name,
            "input": self.arguments,
        })
    }
}

/// Fill alias keys in a tool-call argument object without deleting the
/// original key: `path`/`filepath` → `file_path`, `contents` → `content`.
/// A `files` argument that arrived as a JSON string is decoded in place
/// when possible.
fn fill_argument_aliases(arguments: &mut Value) {
    let Some(map) = arguments.as_object_mut() else {
        return;
    };

    if !map.contains_key("file_path") {
        if let Some(path) = map.get("path").cloned() {
            map.insert("file_path".into(), path);
        } else if let Some(path) = map.get("filepath").cloned() {
            map.insert("file_path".into(), path);
        }
    }
    if !map.contains_key("content")
        && let Some(contents) = map.get("contents").cloned()
    {
        map.insert("content".into(), contents);
    }
    let files_str = map.get("files").and_then(Value::as_str).map(String::from);
    if let Some(files) = files_str
        && let Ok(decoded @ Value::Array(_)) = serde_json::from_str::<Value>(&files)
    {
        map.insert("files".into(), decoded);
    }
}

// ───────────────────────────────────────────────────────────────────────
// Tool results
// ───────────────────────────────────────────────────────────────────────

/// The result of executing a tool, ready to feed back to the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    /// The [`ToolCall::id`] this result corresponds to.
    pub tool_call_id: String,

    /// Arbitrary result value.
    pub result: Value,

    /// Whether the tool invocation failed.
    #[serde(default)]
    pub is_error: bool,
}

impl ToolResult {
    /// Result of a successful tool execution.
    pub fn success(tool_call_id: impl Into<String>, result: Value) -> Self {
        Self {
            tool_call_id: tool_call_id.into(),
            result,
            is_error: false,
        }
    }

    /// Result of a failed tool execution.
    pub fn error(tool_call_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            tool_call_id: tool_call_id.into(),
            result: json!({ "error": message.into() }),
            is_error: true,
        }
    }

    /// The result serialized for message content: strings pass through,
    /// everything else becomes compact JSON.
    pub fn result_string(&self) -> String {
        match &self.result {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }

    /// Convert into the canonical tool message appended to history.
    pub fn into_message(self) -> ChatMessage {
        let content = self.result_string();
        ChatMessage::tool_result(self.tool_call_id, content)
    }
}

// ───────────────────────────────────────────────────────────────────────
// Responses
// ───────────────────────────────────────────────────────────────────────

/// Why the model stopped generating.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    /// Natural end of turn.
    #[default]
    Stop,
    /// The model wants tools executed before continuing.
    ToolCalls,
    /// The response was cut off by the token limit.
    Length,
    /// The provider signaled an in-band error.
    Error,
}

/// Token usage reported by the provider.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

impl Usage {
    pub fn new(prompt_tokens: u64, completion_tokens: u64) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
        }
    }
}

/// The normalized terminal value of one model turn, whatever the provider
/// dialect.
#[derive(Debug, Clone, Default)]
pub struct LlmResponse {
    /// Text content (may be empty when only tool calls were produced).
    pub content: String,

    /// Normalized tool calls (possibly empty).
    pub tool_calls: Vec<ToolCall>,

    /// Canonical finish reason.
    pub finish_reason: FinishReason,

    /// The model that produced the response.
    pub model: Option<String>,

    /// Token accounting.
    pub usage: Usage,

    /// Raw provider payload, kept opaque for diagnostics.
    pub raw: Value,
}

impl LlmResponse {
    /// True when the model requested tool execution.
    pub fn has_tool_calls(&self) -> bool {
        !self.tool_calls.is_empty()
    }

    /// True when the provider signaled an in-band error.
    pub fn is_error(&self) -> bool {
        self.finish_reason == FinishReason::Error
    }

    /// An in-band error response carrying the provider's message as content.
    pub fn from_error(message: impl Into<String>, raw: Value) -> Self {
        Self {
            content: message.into(),
            finish_reason: FinishReason::Error,
            raw,
            ..Default::default()
        }
    }

    /// The assistant message to append to conversation history.
    pub fn to_assistant_message(&self) -> ChatMessage {
        if self.has_tool_calls() {
            ChatMessage::assistant_tool_calls(self.content.clone(), self.tool_calls.clone())
        } else {
            ChatMessage::assistant(self.content.clone())
        }
    }
}

// ───────────────────────────────────────────────────────────────────────
// Request options
// ───────────────────────────────────────────────────────────────────────

/// How the model may choose tools.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolChoice {
    /// The model decides (default).
    Auto,
    /// The model must call some tool.
    Any,
    /// The model must call the named tool.
    Tool(String),
}

/// Per-call options accepted by every provider adapter.
#[derive(Debug, Clone, Default)]
pub struct ChatOptions {
    /// Model override; the adapter's default model when empty.
    pub model: Option<String>,

    /// Sampling temperature.
    pub temperature: Option<f32>,

    /// Maximum tokens the model may generate this turn.
    pub max_tokens: Option<u32>,

    /// Tool choice constraint, when tools are attached.
    pub tool_choice: Option<ToolChoice>,
}

// ───────────────────────────────────────────────────────────────────────
// Tests
// ───────────────────────────────────────────────────────────────────────
