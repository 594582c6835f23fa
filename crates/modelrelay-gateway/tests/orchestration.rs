//! Integration tests for the orchestration loop.
//!
//! These exercise the full tool-calling loop against scripted providers
//! and an in-memory tool registry — no live LLM connection required.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{Value, json};

use modelrelay_gateway::providers::ContentCallback;
use modelrelay_gateway::{
    CallerInfo, ChatEvent, ChatMessage, ChatOptions, ChatOutcome, ChatSession, FinishReason,
    GatewayError, LlmResponse, ProviderClient, ProviderStyle, QuotaConfig, QuotaService, Result,
    Role, SessionConfig, Tier, ToolCall, ToolDefinition, ToolRegistry, Usage,
};
use modelrelay_store::{Database, KeyStore, NewProviderKey, UsageEvent, UsageStore};

// ═══════════════════════════════════════════════════════════════════════
//  Scripted provider
// ═══════════════════════════════════════════════════════════════════════

#[derive(Debug)]
enum Script {
    /// Return this response.
    Respond(Box<LlmResponse>),
    /// Emit these content deltas, then return this response.
    Stream(Vec<&'static str>, Box<LlmResponse>),
    /// Fail with a transport error.
    Fail(Option<u16>, &'static str),
}

#[derive(Debug)]
struct ScriptedProvider {
    name: &'static str,
    script: Mutex<VecDeque<Script>>,
    /// When the script runs dry, keep returning a tool-call response.
    repeat_tool_calls: bool,
    calls: AtomicU32,
    current_key: Mutex<Option<String>>,
    keys_used: Mutex<Vec<Option<String>>>,
}

impl ScriptedProvider {
    fn new(script: Vec<Script>) -> Arc<Self> {
        Arc::new(Self {
            name: "groq",
            script: Mutex::new(script.into()),
            repeat_tool_calls: false,
            calls: AtomicU32::new(0),
            current_key: Mutex::new(None),
            keys_used: Mutex::new(Vec::new()),
        })
    }

    fn always_tool_calls() -> Arc<Self> {
        Arc::new(Self {
            name: "groq",
            script: Mutex::new(VecDeque::new()),
            repeat_tool_calls: true,
            calls: AtomicU32::new(0),
            current_key: Mutex::new(None),
            keys_used: Mutex::new(Vec::new()),
        })
    }

    fn named(self: Arc<Self>, name: &'static str) -> Arc<Self> {
        let mut inner = Arc::into_inner(self).expect("sole owner");
        inner.name = name;
        Arc::new(inner)
    }

    fn call_count(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    fn keys_used(&self) -> Vec<Option<String>> {
        self.keys_used.lock().unwrap().clone()
    }

    fn next(&self, on_content: Option<&mut ContentCallback<'_>>) -> Result<LlmResponse> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.keys_used
            .lock()
            .unwrap()
            .push(self.current_key.lock().unwrap().clone());

        let entry = self.script.lock().unwrap().pop_front();
        match entry {
            Some(Script::Respond(response)) => Ok(*response),
            Some(Script::Stream(deltas, response)) => {
                if let Some(cb) = on_content {
                    for delta in deltas {
                        cb(delta);
                    }
                }
                Ok(*response)
            }
            Some(Script::Fail(status, message)) => Err(GatewayError::Transport {
                status,
                message: message.to_owned(),
            }),
            None if self.repeat_tool_calls => Ok(tool_call_response("list_files", json!({}))),
            None => Ok(text_response("script exhausted")),
        }
    }
}

#[async_trait]
impl ProviderClient for ScriptedProvider {
    fn name(&self) -> &str {
        self.name
    }

    fn style(&self) -> ProviderStyle {
        ProviderStyle::OpenAi
    }

    fn is_configured(&self) -> bool {
        true
    }

    fn default_model(&self) -> String {
        "scripted-model".into()
    }

    fn models(&self) -> Vec<String> {
        vec!["scripted-model".into()]
    }

    fn format_tools(&self, _tools: &[ToolDefinition]) -> Value {
        json!([])
    }

    fn format_messages(&self, _messages: &[ChatMessage]) -> Value {
        json!([])
    }

    fn set_key_override(&self, api_key: Option<String>) {
        *self.current_key.lock().unwrap() = api_key;
    }

    async fn chat(
        &self,
        _messages: &[ChatMessage],
        _tools: &[ToolDefinition],
        _options: &ChatOptions,
    ) -> Result<LlmResponse> {
        self.next(None)
    }

    async fn chat_stream(
        &self,
        _messages: &[ChatMessage],
        _tools: &[ToolDefinition],
        _options: &ChatOptions,
        on_content: &mut ContentCallback<'_>,
    ) -> Result<LlmResponse> {
        self.next(Some(on_content))
    }
}

fn text_response(content: &str) -> LlmResponse {
    LlmResponse {
        content: content.to_owned(),
        finish_reason: FinishReason::Stop,
        usage: Usage::new(10, 5),
        ..Default::default()
    }
}

fn tool_call_response(name: &str, arguments: Value) -> LlmResponse {
    LlmResponse {
        tool_calls: vec![ToolCall::from_parts("tc_1", name, arguments)],
        finish_reason: FinishReason::ToolCalls,
        usage: Usage::new(10, 5),
        ..Default::default()
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Mock registry
// ═══════════════════════════════════════════════════════════════════════

#[derive(Default)]
struct MockRegistry {
    tools: Vec<ToolDefinition>,
    results: HashMap<String, Value>,
    failing: HashSet<String>,
    invocations: Mutex<Vec<(String, Value)>>,
}

impl MockRegistry {
    fn new() -> Self {
        Self::default()
    }

    fn with_tool(mut self, name: &str, result: Value) -> Self {
        self.tools
            .push(ToolDefinition::new(name, "", json!({"type": "object"})));
        self.results.insert(name.to_owned(), result);
        self
    }

    fn with_result(mut self, name: &str, result: Value) -> Self {
        self.results.insert(name.to_owned(), result);
        self
    }

    fn with_failing_tool(mut self, name: &str) -> Self {
        self.tools
            .push(ToolDefinition::new(name, "", json!({"type": "object"})));
        self.failing.insert(name.to_owned());
        self
    }

    fn invocations(&self) -> Vec<(String, Value)> {
        self.invocations.lock().unwrap().clone()
    }
}

#[async_trait]
impl ToolRegistry for MockRegistry {
    async fn list_tools(&self) -> Result<Vec<ToolDefinition>> {
        Ok(self.tools.clone())
    }

    async fn invoke(&self, name: &str, arguments: Value) -> Result<Value> {
        self.invocations
            .lock()
            .unwrap()
            .push((name.to_owned(), arguments));
        if self.failing.contains(name) {
            return Err(GatewayError::ToolExecution {
                tool: name.to_owned(),
                reason: "handler exploded".into(),
            });
        }
        Ok(self
            .results
            .get(name)
            .cloned()
            .unwrap_or_else(|| json!({"ok": true})))
    }
}

fn caller() -> CallerInfo {
    CallerInfo::new("u1", Tier::User)
}

// ═══════════════════════════════════════════════════════════════════════
//  Loop behavior
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn happy_path_two_iterations() {
    let provider = ScriptedProvider::new(vec![
        Script::Respond(Box::new(tool_call_response("list_files", json!({})))),
        Script::Respond(Box::new(text_response("Here are your files: a.txt, b.txt"))),
    ]);
    let registry = Arc::new(
        MockRegistry::new().with_tool("list_files", json!({"files": ["a.txt", "b.txt"]})),
    );

    let mut session = ChatSession::new(provider.clone(), registry.clone(), caller());
    let outcome = session.chat("list files").await.unwrap();

    match outcome {
        ChatOutcome::Answer(text) => assert_eq!(text, "Here are your files: a.txt, b.txt"),
        other => panic!("expected answer, got {other:?}"),
    }
    assert_eq!(provider.call_count(), 2);
    assert_eq!(registry.invocations().len(), 1);

    // History: user -> assistant(tool_calls) -> tool -> assistant.
    let history = session.history();
    assert_eq!(history.len(), 4);
    assert_eq!(history[0].role, Role::User);
    assert_eq!(history[1].role, Role::Assistant);
    assert_eq!(history[1].tool_calls.len(), 1);
    assert_eq!(history[2].role, Role::Tool);
    assert_eq!(history[2].tool_call_id.as_deref(), Some("tc_1"));
    assert_eq!(history[3].role, Role::Assistant);
}

#[tokio::test]
async fn loop_terminates_at_exactly_the_iteration_cap() {
    let provider = ScriptedProvider::always_tool_calls();
    let registry = Arc::new(MockRegistry::new().with_tool("list_files", json!({"files": []})));

    let mut session = ChatSession::new(provider.clone(), registry, caller());
    let outcome = session.chat("loop forever").await.unwrap();

    match outcome {
        ChatOutcome::Answer(text) => {
            assert_eq!(text, "Request too complex; exceeded maximum tool iterations.");
        }
        other => panic!("expected answer, got {other:?}"),
    }
    assert_eq!(provider.call_count(), 10, "exactly the cap, never more");
}

#[tokio::test]
async fn custom_iteration_cap_is_honored() {
    let provider = ScriptedProvider::always_tool_calls();
    let registry = Arc::new(MockRegistry::new().with_tool("list_files", json!({"files": []})));

    let mut session = ChatSession::new(provider.clone(), registry, caller()).with_config(
        SessionConfig {
            max_iterations: 3,
            options: ChatOptions::default(),
        },
    );
    session.chat("loop").await.unwrap();
    assert_eq!(provider.call_count(), 3);
}

#[tokio::test]
async fn inline_tool_call_text_is_recovered_and_executed() {
    // A poorly structured model answers with the call written out as text.
    let provider = ScriptedProvider::new(vec![
        Script::Respond(Box::new(text_response(
            "<function>list_files</function>{\"path\": \".\"}",
        ))),
        Script::Respond(Box::new(text_response("You have one file: a.txt"))),
    ]);
    let registry =
        Arc::new(MockRegistry::new().with_tool("list_files", json!({"files": ["a.txt"]})));

    let mut session = ChatSession::new(provider.clone(), registry.clone(), caller());
    let outcome = session.chat("list files").await.unwrap();

    assert_eq!(outcome.text(), "You have one file: a.txt");
    assert_eq!(registry.invocations().len(), 1);
    assert_eq!(registry.invocations()[0].0, "list_files");
}

#[tokio::test]
async fn inline_text_naming_an_unknown_tool_is_left_alone() {
    let provider = ScriptedProvider::new(vec![Script::Respond(Box::new(text_response(
        "{\"name\": \"not_registered\", \"arguments\": {}}",
    )))]);
    let registry = Arc::new(MockRegistry::new());

    let mut session = ChatSession::new(provider.clone(), registry.clone(), caller());
    let outcome = session.chat("hello").await.unwrap();

    // No registry hit; the text is returned as the answer.
    assert!(registry.invocations().is_empty());
    assert!(outcome.text().contains("not_registered"));
}

#[tokio::test]
async fn duplicate_user_message_is_not_appended_twice() {
    let provider = ScriptedProvider::new(vec![Script::Respond(Box::new(text_response("hi")))]);
    let registry = Arc::new(MockRegistry::new());

    let mut session = ChatSession::new(provider, registry, caller())
        .with_history(vec![ChatMessage::user("hello")]);
    session.chat("hello").await.unwrap();

    let user_count = session
        .history()
        .iter()
        .filter(|m| m.role == Role::User)
        .count();
    assert_eq!(user_count, 1);
}

#[tokio::test]
async fn tool_failure_feeds_back_into_conversation() {
    let provider = ScriptedProvider::new(vec![
        Script::Respond(Box::new(tool_call_response("run_command", json!({"cmd": "ls"})))),
        Script::Respond(Box::new(text_response("Sorry, that tool failed."))),
    ]);
    let registry = Arc::new(MockRegistry::new().with_failing_tool("run_command"));

    let mut session = ChatSession::new(provider.clone(), registry, caller());
    let outcome = session.chat("run ls").await.unwrap();

    // The failure is not a hard error; the model got to respond to it.
    assert_eq!(outcome.text(), "Sorry, that tool failed.");
    let tool_message = &session.history()[2];
    assert_eq!(tool_message.role, Role::Tool);
    assert!(tool_message.content.contains("Tool execution failed"));
    assert!(!tool_message.content.contains("handler exploded"));
}

#[tokio::test]
async fn provider_failure_is_logged_not_leaked() {
    let provider = ScriptedProvider::new(vec![Script::Fail(
        Some(500),
        "postgres password is hunter2",
    )]);
    let registry = Arc::new(MockRegistry::new());

    let mut session = ChatSession::new(provider, registry, caller());
    let outcome = session.chat("hello").await.unwrap();

    let text = outcome.text();
    assert!(text.contains("internal error"));
    assert!(!text.contains("hunter2"));
}

#[tokio::test]
async fn in_band_error_response_is_also_generic() {
    let provider = ScriptedProvider::new(vec![Script::Respond(Box::new(LlmResponse::from_error(
        "upstream stack trace",
        json!({}),
    )))]);
    let registry = Arc::new(MockRegistry::new());

    let mut session = ChatSession::new(provider, registry, caller());
    let outcome = session.chat("hello").await.unwrap();
    assert!(!outcome.text().contains("stack trace"));
}

// ═══════════════════════════════════════════════════════════════════════
//  Sanitization
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn tool_results_are_sanitized_before_history() {
    let provider = ScriptedProvider::new(vec![
        Script::Respond(Box::new(tool_call_response("stat_file", json!({})))),
        Script::Respond(Box::new(text_response("done"))),
    ]);
    let registry = Arc::new(MockRegistry::new().with_tool(
        "stat_file",
        json!({"path": "/home/alice/project/secret/.env"}),
    ));

    let mut session = ChatSession::new(provider, registry, caller());
    session.chat("stat it").await.unwrap();

    let tool_message = &session.history()[2];
    assert!(tool_message.content.contains("secret/.env"));
    assert!(!tool_message.content.contains("/home/alice"));
}

#[tokio::test]
async fn streamed_tool_events_carry_sanitized_results() {
    let provider = ScriptedProvider::new(vec![
        Script::Stream(
            vec![],
            Box::new(tool_call_response("list_files", json!({}))),
        ),
        Script::Stream(vec!["All", " done"], Box::new(text_response("All done"))),
    ]);
    let registry = Arc::new(MockRegistry::new().with_tool(
        "list_files",
        json!({"files": ["a.txt", ".git/HEAD", ".env"]}),
    ));

    let mut session = ChatSession::new(provider, registry, caller());
    let events: Arc<Mutex<Vec<ChatEvent>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = events.clone();

    let outcome = session
        .chat_stream("list", &mut move |event| sink.lock().unwrap().push(event))
        .await
        .unwrap();
    assert_eq!(outcome.text(), "All done");

    let events = events.lock().unwrap();
    let mut saw_started = false;
    let mut saw_completed = false;
    let mut content = String::new();
    for event in events.iter() {
        match event {
            ChatEvent::ToolStarted { name, .. } => {
                assert_eq!(name, "list_files");
                saw_started = true;
            }
            ChatEvent::ToolCompleted { result, is_error, .. } => {
                assert!(!*is_error);
                let files = result["files"].as_array().unwrap();
                assert_eq!(files.len(), 1, "internals filtered: {files:?}");
                saw_completed = true;
            }
            ChatEvent::Content(delta) => content.push_str(delta),
        }
    }
    assert!(saw_started && saw_completed);
    assert_eq!(content, "All done");
}

// ═══════════════════════════════════════════════════════════════════════
//  Write verification
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn verified_write_succeeds() {
    let provider = ScriptedProvider::new(vec![
        Script::Respond(Box::new(tool_call_response(
            "write_file",
            json!({"path": "index.html", "content": "<html></html>"}),
        ))),
        Script::Respond(Box::new(text_response("written"))),
    ]);
    let registry = Arc::new(
        MockRegistry::new()
            .with_tool("write_file", json!({"success": true}))
            .with_result("verify_file_content", json!({"verified": true})),
    );

    let mut session = ChatSession::new(provider, registry.clone(), caller());
    let outcome = session.chat("write the file").await.unwrap();
    assert_eq!(outcome.text(), "written");

    let names: Vec<String> = registry.invocations().iter().map(|(n, _)| n.clone()).collect();
    assert_eq!(names, vec!["write_file", "verify_file_content"]);

    let tool_message = &session.history()[2];
    assert!(tool_message.content.contains("write_result"));
    assert!(tool_message.content.contains("verification"));
}

#[tokio::test]
async fn unverified_write_is_reported_as_failure() {
    let provider = ScriptedProvider::new(vec![
        Script::Respond(Box::new(tool_call_response(
            "write_file",
            json!({"path": "index.html", "content": "<html></html>"}),
        ))),
        Script::Respond(Box::new(text_response("hmm"))),
    ]);
    let registry = Arc::new(
        MockRegistry::new()
            .with_tool("write_file", json!({"success": true}))
            .with_result("verify_file_content", json!({"verified": false})),
    );

    let mut session = ChatSession::new(provider, registry, caller());
    session.chat("write the file").await.unwrap();

    let tool_message = &session.history()[2];
    assert!(tool_message.content.contains("File verification failed"));
}

#[tokio::test]
async fn empty_write_is_verified_by_reading_back() {
    let provider = ScriptedProvider::new(vec![
        Script::Respond(Box::new(tool_call_response(
            "create_file",
            json!({"path": "notes.txt"}),
        ))),
        Script::Respond(Box::new(text_response("created"))),
    ]);
    let registry = Arc::new(
        MockRegistry::new()
            .with_tool("create_file", json!({"success": true}))
            .with_result("read_file", json!({"content": ""})),
    );

    let mut session = ChatSession::new(provider, registry.clone(), caller());
    session.chat("create the file").await.unwrap();

    let names: Vec<String> = registry.invocations().iter().map(|(n, _)| n.clone()).collect();
    assert_eq!(names, vec!["create_file", "read_file"]);
    let tool_message = &session.history()[2];
    assert!(tool_message.content.contains("file missing or empty"));
}

// ═══════════════════════════════════════════════════════════════════════
//  Quota gating
// ═══════════════════════════════════════════════════════════════════════

async fn stores() -> (Database, KeyStore, UsageStore) {
    let db = Database::open_in_memory().unwrap();
    db.run_migrations().await.unwrap();
    (db.clone(), KeyStore::new(db.clone()), UsageStore::new(db))
}

#[tokio::test]
async fn quota_denial_prevents_any_model_call() {
    let (_db, _keys, usage) = stores().await;
    let provider = ScriptedProvider::new(vec![Script::Respond(Box::new(text_response("nope")))]);
    let registry = Arc::new(MockRegistry::new());

    // Visitor rpm floor is 5.  Fill the current and the next minute bucket
    // so the check trips whichever minute it lands in.
    let now = chrono::Utc::now();
    for offset in [0, 60] {
        for _ in 0..5 {
            usage
                .record_at(
                    UsageEvent::chat("v9", "visitor", "groq", "scripted-model"),
                    now + chrono::Duration::seconds(offset),
                )
                .await
                .unwrap();
        }
    }

    let quota = QuotaService::new(usage, QuotaConfig::default());
    let mut session =
        ChatSession::new(provider.clone(), registry, CallerInfo::new("v9", Tier::Visitor))
            .with_quota(quota);

    let outcome = session.chat("one more?").await.unwrap();
    match outcome {
        ChatOutcome::Denied { denial, message } => {
            assert_eq!(denial.reason, "rate_limit_rpm");
            assert_eq!(denial.retry_after_secs, 60);
            assert!(message.contains("create an account"), "visitor upgrade nudge");
        }
        other => panic!("expected denial, got {other:?}"),
    }
    assert_eq!(provider.call_count(), 0, "no model call after a denial");
    assert!(session.history().is_empty());
}

#[tokio::test]
async fn fallback_provider_takes_over_near_the_org_limit() {
    let (_db, _keys, usage) = stores().await;

    // Saturate the primary's org minute budget (conservative default: 30).
    let now = chrono::Utc::now();
    for i in 0..30 {
        for offset in [0, 60] {
            usage
                .record_at(
                    UsageEvent::chat(format!("u{i}"), "user", "groq", "scripted-model"),
                    now + chrono::Duration::seconds(offset),
                )
                .await
                .unwrap();
        }
    }

    let primary = ScriptedProvider::new(vec![Script::Respond(Box::new(text_response("primary")))]);
    let fallback = ScriptedProvider::new(vec![Script::Respond(Box::new(text_response(
        "fallback answer",
    )))])
    .named("cerebras");
    let registry = Arc::new(MockRegistry::new());

    let quota = QuotaService::new(usage, QuotaConfig::default());
    let mut session = ChatSession::new(
        primary.clone(),
        registry,
        CallerInfo::new("admin-1", Tier::Admin),
    )
    .with_fallback(fallback.clone())
    .with_quota(quota);

    let outcome = session.chat("hello").await.unwrap();
    assert_eq!(outcome.text(), "fallback answer");
    assert_eq!(primary.call_count(), 0);
    assert_eq!(fallback.call_count(), 1);
}

// ═══════════════════════════════════════════════════════════════════════
//  Credential rotation
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn rate_limited_key_rotates_to_the_next() {
    let (_db, keys, _usage) = stores().await;
    let id1 = keys.add_key(NewProviderKey::new("groq", "gsk_one")).await.unwrap();
    let id2 = keys.add_key(NewProviderKey::new("groq", "gsk_two")).await.unwrap();

    let provider = ScriptedProvider::new(vec![
        Script::Fail(Some(429), "rate limit exceeded"),
        Script::Respond(Box::new(text_response("made it"))),
    ]);
    let registry = Arc::new(MockRegistry::new());

    let mut session =
        ChatSession::new(provider.clone(), registry, caller()).with_keys(keys.clone());
    let outcome = session.chat("hello").await.unwrap();
    assert_eq!(outcome.text(), "made it");

    // First attempt on key 1, retry on key 2.
    assert_eq!(
        provider.keys_used(),
        vec![Some("gsk_one".to_owned()), Some("gsk_two".to_owned())]
    );

    let key1 = keys.get(id1).await.unwrap();
    assert_eq!(key1.error_count, 1);
    assert!(key1.rate_limit_reset_at.is_some());

    let key2 = keys.get(id2).await.unwrap();
    assert_eq!(key2.error_count, 0);
    assert!(key2.last_used_at.is_some());
}

#[tokio::test]
async fn exhausted_pool_falls_back_to_environment_credential() {
    let (_db, keys, _usage) = stores().await;
    keys.add_key(NewProviderKey::new("groq", "gsk_only")).await.unwrap();

    let provider = ScriptedProvider::new(vec![
        Script::Fail(Some(429), "rate limit exceeded"),
        Script::Respond(Box::new(text_response("env worked"))),
    ]);
    let registry = Arc::new(MockRegistry::new());

    let mut session = ChatSession::new(provider.clone(), registry, caller()).with_keys(keys);
    let outcome = session.chat("hello").await.unwrap();
    assert_eq!(outcome.text(), "env worked");
    assert_eq!(
        provider.keys_used(),
        vec![Some("gsk_only".to_owned()), None],
        "pool first, then the environment credential"
    );
}

#[tokio::test]
async fn non_rate_limit_errors_do_not_rotate() {
    let (_db, keys, _usage) = stores().await;
    keys.add_key(NewProviderKey::new("groq", "gsk_one")).await.unwrap();
    keys.add_key(NewProviderKey::new("groq", "gsk_two")).await.unwrap();

    let provider = ScriptedProvider::new(vec![Script::Fail(Some(500), "boom")]);
    let registry = Arc::new(MockRegistry::new());

    let mut session = ChatSession::new(provider.clone(), registry, caller()).with_keys(keys);
    let outcome = session.chat("hello").await.unwrap();
    assert!(outcome.text().contains("internal error"));
    assert_eq!(provider.call_count(), 1);
}

// ═══════════════════════════════════════════════════════════════════════
//  Usage recording
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn completed_calls_are_recorded() {
    let (_db, _keys, usage) = stores().await;
    let provider = ScriptedProvider::new(vec![Script::Respond(Box::new(text_response("hi")))]);
    let registry = Arc::new(MockRegistry::new());

    let mut session =
        ChatSession::new(provider, registry, caller()).with_usage(usage.clone());
    session.chat("hello").await.unwrap();

    let totals = usage
        .caller_usage("u1", "groq", "scripted-model", modelrelay_store::Window::Day)
        .await
        .unwrap();
    assert_eq!(totals.requests, 1);
    assert_eq!(totals.tokens, 15);
}
