//! The orchestration loop.
//!
//! One [`ChatSession`] runs per inbound request: it owns the conversation
//! history, gates entry on the quota service, drives the provider through
//! bounded tool-calling iterations, executes tool calls through the
//! external registry, and rotates pooled credentials when a provider
//! signals a rate limit.
//!
//! Error policy at the provider boundary: full detail goes to the
//! operator log, the caller only ever sees a fixed generic message.  Tool
//! failures are different — they are fed back into the conversation as
//! error results so the model can adapt or apologize.

use std::sync::Arc;
use std::time::Instant;

use serde_json::{Value, json};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use modelrelay_store::{DEFAULT_COOLDOWN_SECS, KeyStore, UsageEvent, UsageStore};

use crate::error::Result;
use crate::extract::extract_tool_call;
use crate::providers::ProviderClient;
use crate::quota::{QuotaDecision, QuotaDenial, QuotaService, Tier};
use crate::registry::ToolRegistry;
use crate::sanitize::sanitize_tool_result;
use crate::types::{ChatMessage, ChatOptions, LlmResponse, ToolCall, ToolDefinition, ToolResult};

/// Default bound on model-call iterations per turn.
pub const DEFAULT_MAX_ITERATIONS: u32 = 10;

/// What the caller sees when a provider call fails for any internal reason.
const PROVIDER_FAILURE_MESSAGE: &str =
    "An internal error occurred while contacting the language model. The incident has been logged.";

/// Returned when the iteration cap is reached without a final answer.
const TOO_COMPLEX_MESSAGE: &str = "Request too complex; exceeded maximum tool iterations.";

/// Tool names whose effect on disk is verified after execution.
const FILE_WRITE_TOOLS: &[&str] = &["create_file", "write_file", "replace_in_file"];

/// How much of the written content the verification step checks for.
const VERIFY_PREFIX_CHARS: usize = 128;

// ───────────────────────────────────────────────────────────────────────
// Session surface
// ───────────────────────────────────────────────────────────────────────

/// Who is asking.
#[derive(Debug, Clone)]
pub struct CallerInfo {
    /// User id, or session id for anonymous callers.
    pub id: String,
    pub tier: Tier,
}

impl CallerInfo {
    pub fn new(id: impl Into<String>, tier: Tier) -> Self {
        Self {
            id: id.into(),
            tier,
        }
    }
}

/// Per-session configuration.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Maximum model-call iterations per turn.
    pub max_iterations: u32,
    /// Options forwarded to every provider call.
    pub options: ChatOptions,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_iterations: DEFAULT_MAX_ITERATIONS,
            options: ChatOptions::default(),
        }
    }
}

/// Events forwarded to a streaming caller as the turn progresses.
#[derive(Debug, Clone)]
pub enum ChatEvent {
    /// A content delta, forwarded the moment it arrives.
    Content(String),
    /// A tool invocation is starting (arguments already sanitized).
    ToolStarted { name: String, arguments: Value },
    /// A tool invocation finished (result already sanitized).
    ToolCompleted {
        name: String,
        arguments: Value,
        result: Value,
        is_error: bool,
    },
}

/// Callback receiving [`ChatEvent`]s during a streaming turn.
pub type EventCallback<'a> = dyn FnMut(ChatEvent) + Send + 'a;

/// The caller-facing result of one turn.
#[derive(Debug, Clone)]
pub enum ChatOutcome {
    /// The final text answer.
    Answer(String),
    /// Quota-blocked before any model call was attempted.
    Denied {
        denial: QuotaDenial,
        /// Tier-appropriate message (empty for silent denials).
        message: String,
    },
}

impl ChatOutcome {
    /// The text a plain-text caller should display.
    pub fn text(&self) -> &str {
        match self {
            Self::Answer(text) => text,
            Self::Denied { message, .. } => message,
        }
    }
}

/// One conversation's orchestration state.
pub struct ChatSession {
    provider: Arc<dyn ProviderClient>,
    fallback: Option<Arc<dyn ProviderClient>>,
    registry: Arc<dyn ToolRegistry>,
    quota: Option<QuotaService>,
    keys: Option<KeyStore>,
    usage: Option<UsageStore>,
    caller: CallerInfo,
    config: SessionConfig,
    history: Vec<ChatMessage>,
}

impl ChatSession {
    pub fn new(
        provider: Arc<dyn ProviderClient>,
        registry: Arc<dyn ToolRegistry>,
        caller: CallerInfo,
    ) -> Self {
        Self {
            provider,
            fallback: None,
            registry,
            quota: None,
            keys: None,
            usage: None,
            caller,
            config: SessionConfig::default(),
            history: Vec::new(),
        }
    }

    /// Secondary provider preferred when the primary nears its org limit.
    pub fn with_fallback(mut self, fallback: Arc<dyn ProviderClient>) -> Self {
        self.fallback = Some(fallback);
        self
    }

    pub fn with_quota(mut self, quota: QuotaService) -> Self {
        self.quota = Some(quota);
        self
    }

    pub fn with_keys(mut self, keys: KeyStore) -> Self {
        self.keys = Some(keys);
        self
    }

    pub fn with_usage(mut self, usage: UsageStore) -> Self {
        self.usage = Some(usage);
        self
    }

    pub fn with_config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    /// Prepend a system prompt.
    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.history.insert(0, ChatMessage::system(prompt));
        self
    }

    /// Resume from prior history.
    pub fn with_history(mut self, history: Vec<ChatMessage>) -> Self {
        self.history = history;
        self
    }

    pub fn history(&self) -> &[ChatMessage] {
        &self.history
    }

    /// Drop the conversation so far.
    pub fn reset(&mut self) {
        self.history.clear();
    }

    /// Run one non-streaming turn.
    pub async fn chat(&mut self, user_message: &str) -> Result<ChatOutcome> {
        self.run(user_message, false, &mut |_| {}).await
    }

    /// Run one streaming turn, forwarding [`ChatEvent`]s as they happen.
    pub async fn chat_stream(
        &mut self,
        user_message: &str,
        on_event: &mut EventCallback<'_>,
    ) -> Result<ChatOutcome> {
        self.run(user_message, true, on_event).await
    }

    // ── the loop ─────────────────────────────────────────────────────

    async fn run(
        &mut self,
        user_message: &str,
        streaming: bool,
        on_event: &mut EventCallback<'_>,
    ) -> Result<ChatOutcome> {
        let model = self.requested_model();

        // Quota gate, before any model call.
        if let Some(quota) = &self.quota {
            let decision = quota
                .can_make_request(
                    &self.caller.id,
                    self.caller.tier,
                    self.provider.name(),
                    &model,
                )
                .await?;
            if let QuotaDecision::Denied(denial) = decision {
                let message = denial_message(&denial);
                return Ok(ChatOutcome::Denied { denial, message });
            }
        }

        self.push_user_deduped(user_message);

        let tools = match self.registry.list_tools().await {
            Ok(tools) => tools,
            Err(e) => {
                warn!(error = %e, "tool discovery failed; continuing without tools");
                Vec::new()
            }
        };

        let (client, is_fallback) = self.select_client(&model).await;

        info!(
            provider = client.name(),
            is_fallback,
            caller = %self.caller.id,
            tool_count = tools.len(),
            "starting chat turn"
        );

        for iteration in 1..=self.config.max_iterations {
            debug!(iteration, "model call");

            let response = match self
                .call_with_rotation(&client, &tools, streaming, is_fallback, on_event)
                .await
            {
                Ok(response) => response,
                Err(e) => {
                    // Full detail for operators, generic text for the caller.
                    error!(
                        provider = client.name(),
                        caller = %self.caller.id,
                        error = %e,
                        "provider call failed"
                    );
                    return Ok(ChatOutcome::Answer(PROVIDER_FAILURE_MESSAGE.to_owned()));
                }
            };

            if response.is_error() {
                error!(
                    provider = client.name(),
                    caller = %self.caller.id,
                    detail = %response.content,
                    "provider returned an error payload"
                );
                return Ok(ChatOutcome::Answer(PROVIDER_FAILURE_MESSAGE.to_owned()));
            }

            self.history.push(response.to_assistant_message());

            let tool_calls: Vec<ToolCall> = if response.has_tool_calls() {
                response.tool_calls.clone()
            } else if let Some(call) = self.extract_inline_call(&response.content).await {
                // Fallback for models that emit the call inline as text
                // instead of through the structured channel.
                debug!(tool = %call.name, "recovered inline tool call from response text");
                vec![call]
            } else {
                return Ok(ChatOutcome::Answer(response.content));
            };

            for raw_call in &tool_calls {
                // Re-normalize so alias keys are filled whatever path the
                // call arrived through.
                let call = ToolCall::from_parts(
                    raw_call.id.clone(),
                    raw_call.name.clone(),
                    raw_call.arguments.clone(),
                );
                let shown_arguments = sanitize_tool_result(&call.arguments);

                on_event(ChatEvent::ToolStarted {
                    name: call.name.clone(),
                    arguments: shown_arguments.clone(),
                });

                let result = self.execute_tool_call(&call).await;
                let sanitized = sanitize_tool_result(&result.result);

                on_event(ChatEvent::ToolCompleted {
                    name: call.name.clone(),
                    arguments: shown_arguments,
                    result: sanitized.clone(),
                    is_error: result.is_error,
                });

                // History gets the sanitized form so the model never sees
                // internal layout either.
                self.history.push(
                    ToolResult {
                        result: sanitized,
                        ..result
                    }
                    .into_message(),
                );
            }
        }

        Ok(ChatOutcome::Answer(TOO_COMPLEX_MESSAGE.to_owned()))
    }

    /// Try to recover a tool call the model emitted as plain text.  Only
    /// names the registry actually knows are accepted.
    async fn extract_inline_call(&self, content: &str) -> Option<ToolCall> {
        let extracted = extract_tool_call(content)?;
        match self.registry.find_tool(&extracted.name).await {
            Ok(Some(_)) => Some(ToolCall::from_parts(
                format!("tc_{}", Uuid::now_v7().simple()),
                extracted.name,
                extracted.arguments,
            )),
            _ => None,
        }
    }

    fn requested_model(&self) -> String {
        self.config
            .options
            .model
            .clone()
            .filter(|m| !m.is_empty())
            .unwrap_or_else(|| self.provider.default_model())
    }

    /// Append the user message unless it duplicates the most recent entry
    /// (tolerates retried client submissions).
    fn push_user_deduped(&mut self, user_message: &str) {
        let candidate = ChatMessage::user(user_message);
        if self.history.last() == Some(&candidate) {
            debug!("duplicate user message suppressed");
            return;
        }
        self.history.push(candidate);
    }

    /// Pick the client for this turn: the fallback when the org-level check
    /// says the primary is near its limit and a configured fallback exists.
    async fn select_client(&self, model: &str) -> (Arc<dyn ProviderClient>, bool) {
        if let (Some(quota), Some(fallback)) = (&self.quota, &self.fallback) {
            match quota.should_use_fallback(self.provider.name(), model).await {
                Ok(decision) if decision.use_fallback => {
                    if fallback.is_configured() {
                        info!(
                            primary = self.provider.name(),
                            fallback = fallback.name(),
                            reason = decision.reason.as_deref().unwrap_or(""),
                            "routing turn to fallback provider"
                        );
                        return (Arc::clone(fallback), true);
                    }
                    warn!(
                        fallback = fallback.name(),
                        "fallback indicated but fallback provider is not configured"
                    );
                }
                Ok(_) => {}
                Err(e) => warn!(error = %e, "fallback check failed; staying on primary"),
            }
        }
        (Arc::clone(&self.provider), false)
    }

    /// One provider call with credential rotation on 429s.
    ///
    /// Selection happens here, fresh from the store, for every call: the
    /// lowest-id available pooled key, else the environment credential.  A
    /// rate-limited key is marked (cool-down + error count) and the next
    /// key is tried; when the pool is exhausted the environment credential
    /// gets the final attempt.
    async fn call_with_rotation(
        &self,
        client: &Arc<dyn ProviderClient>,
        tools: &[ToolDefinition],
        streaming: bool,
        is_fallback: bool,
        on_event: &mut EventCallback<'_>,
    ) -> Result<LlmResponse> {
        let mut current_key: Option<i64> = None;

        if let Some(keys) = &self.keys {
            match keys.first_available_for(client.name()).await {
                Ok(Some(key)) => {
                    debug!(key_id = key.id, provider = client.name(), "using pooled key");
                    client.set_key_override(Some(key.api_key));
                    current_key = Some(key.id);
                }
                Ok(None) => client.set_key_override(None),
                Err(e) => {
                    warn!(error = %e, "key selection failed; using environment credential");
                    client.set_key_override(None);
                }
            }
        }

        loop {
            let started = Instant::now();
            let result = if streaming {
                let mut forward = |delta: &str| on_event(ChatEvent::Content(delta.to_owned()));
                client
                    .chat_stream(&self.history, tools, &self.config.options, &mut forward)
                    .await
            } else {
                client.chat(&self.history, tools, &self.config.options).await
            };

            match result {
                Ok(response) => {
                    if let (Some(keys), Some(id)) = (&self.keys, current_key)
                        && let Err(e) = keys.mark_used(id).await
                    {
                        warn!(key_id = id, error = %e, "failed to record key use");
                    }
                    self.record_usage(&response, is_fallback, started.elapsed().as_millis() as u64)
                        .await;
                    return Ok(response);
                }

                Err(e) if e.is_rate_limited() && self.keys.is_some() => {
                    let Some(keys) = &self.keys else {
                        return Err(e);
                    };
                    let Some(exhausted_id) = current_key else {
                        // Already on the environment credential: nothing
                        // left to rotate to.
                        return Err(e);
                    };

                    warn!(key_id = exhausted_id, "key rate-limited; rotating");
                    if let Err(mark_err) = keys
                        .mark_rate_limited(exhausted_id, DEFAULT_COOLDOWN_SECS)
                        .await
                    {
                        warn!(key_id = exhausted_id, error = %mark_err, "failed to mark key rate-limited");
                    }

                    match keys.next_available_after(exhausted_id).await {
                        Ok(Some(next)) => {
                            debug!(key_id = next.id, "trying next pooled key");
                            client.set_key_override(Some(next.api_key));
                            current_key = Some(next.id);
                        }
                        Ok(None) | Err(_) => {
                            debug!("key pool exhausted; falling back to environment credential");
                            client.set_key_override(None);
                            current_key = None;
                        }
                    }
                }

                Err(e) => return Err(e),
            }
        }
    }

    async fn record_usage(
        &self,
        response: &LlmResponse,
        is_fallback: bool,
        latency_ms: u64,
    ) {
        let Some(usage) = &self.usage else {
            return;
        };
        let model = response
            .model
            .clone()
            .unwrap_or_else(|| self.requested_model());
        let event = UsageEvent::chat(
            self.caller.id.clone(),
            self.caller.tier.as_str(),
            self.provider.name(),
            model,
        )
        .with_tokens(
            response.usage.prompt_tokens,
            response.usage.completion_tokens,
        )
        .with_fallback(is_fallback)
        .with_latency_ms(latency_ms);

        if let Err(e) = usage.record(event).await {
            warn!(error = %e, "failed to record usage");
        }
    }

    // ── tool execution ───────────────────────────────────────────────

    /// Execute one tool call through the registry.
    ///
    /// Failures never escalate: every path returns a [`ToolResult`], with
    /// `is_error` set when the tool is unknown, arguments are missing, the
    /// handler failed, or write verification did not confirm.
    async fn execute_tool_call(&self, call: &ToolCall) -> ToolResult {
        let definition = match self.registry.find_tool(&call.name).await {
            Ok(def) => def,
            Err(e) => {
                warn!(tool = %call.name, error = %e, "tool lookup failed");
                None
            }
        };

        // When the registry advertises a direct handler, bind the declared
        // required parameters before invoking and fail closed on a miss.
        if let Some(def) = &definition
            && def.handler.is_some()
        {
            for required in def.required_parameters() {
                if call.argument(required).is_none() {
                    return ToolResult::error(
                        &call.id,
                        format!("Missing required argument for handler: {required}"),
                    );
                }
            }
        }

        debug!(tool = %call.name, "executing tool");
        let raw = match self
            .registry
            .invoke(&call.name, call.arguments.clone())
            .await
        {
            Ok(raw) => raw,
            Err(e) => {
                // Log the internal failure for operators; the conversation
                // only learns that the tool failed.
                warn!(tool = %call.name, error = %e, "tool execution failed");
                return ToolResult::error(&call.id, "Tool execution failed (internal error)");
            }
        };

        if self.is_file_write(call) {
            return self.verify_write(call, raw).await;
        }

        ToolResult::success(&call.id, raw)
    }

    fn is_file_write(&self, call: &ToolCall) -> bool {
        FILE_WRITE_TOOLS.contains(&call.name.as_str()) && self.write_path(call).is_some()
    }

    fn write_path(&self, call: &ToolCall) -> Option<String> {
        call.argument("path")
            .or_else(|| call.argument("file_path"))
            .and_then(Value::as_str)
            .map(String::from)
    }

    /// Re-check a file write through the registry and treat the write as
    /// failed when the check does not confirm it.
    async fn verify_write(&self, call: &ToolCall, write_result: Value) -> ToolResult {
        let Some(path) = self.write_path(call) else {
            return ToolResult::success(&call.id, write_result);
        };
        let content = call.argument("content").and_then(Value::as_str);

        let verification = match content.filter(|c| !c.is_empty()) {
            Some(content) => {
                let expected: String = content.chars().take(VERIFY_PREFIX_CHARS).collect();
                let args = json!({
                    "path": path,
                    "expectedSubstring": expected,
                    "checkLine": 0,
                });
                match self.registry.invoke("verify_file_content", args).await {
                    Ok(v) if v["verified"].as_bool().unwrap_or(false) => v,
                    Ok(_) => {
                        return ToolResult::error(
                            &call.id,
                            "File verification failed: expected content not found or file missing.",
                        );
                    }
                    Err(e) => {
                        return ToolResult::error(&call.id, format!("Verification failed: {e}"));
                    }
                }
            }
            None => {
                let args = json!({"path": path, "startLine": 1, "endLine": 10});
                match self.registry.invoke("read_file", args).await {
                    Ok(v) if v["content"].as_str().is_some_and(|c| !c.is_empty()) => v,
                    Ok(_) => {
                        return ToolResult::error(
                            &call.id,
                            "File verification failed: file missing or empty.",
                        );
                    }
                    Err(e) => {
                        return ToolResult::error(&call.id, format!("Verification failed: {e}"));
                    }
                }
            }
        };

        ToolResult::success(
            &call.id,
            json!({
                "write_result": write_result,
                "verification": verification,
            }),
        )
    }
}

/// Tier-appropriate denial text.  Visitors get an upgrade nudge; silent
/// denials carry no message at all (the capability just looks unavailable).
fn denial_message(denial: &QuotaDenial) -> String {
    if denial.silent {
        return String::new();
    }
    match denial.tier {
        Tier::Visitor => format!(
            "You've reached the free usage limit ({}). Try again in {} seconds, or create an account for a larger allowance.",
            denial.reason, denial.retry_after_secs
        ),
        Tier::User => format!(
            "Rate limit reached ({}): {} of {} used. Try again in {} seconds.",
            denial.reason, denial.current, denial.limit, denial.retry_after_secs
        ),
        Tier::Admin => format!(
            "Rate limit reached ({}): {} of {} used; retry in {} seconds.",
            denial.reason, denial.current, denial.limit, denial.retry_after_secs
        ),
    }
}

// ───────────────────────────────────────────────────────────────────────
// Tests
// ───────────────────────────────────────────────────────────────────────
