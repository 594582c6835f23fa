//! Provider adapters.
//!
//! One [`ProviderClient`] implementation exists per wire dialect:
//! [`openai::OpenAiCompatProvider`] for OpenAI-style chat completions
//! (OpenAI, Groq, Cerebras, Together, Fireworks), [`anthropic::AnthropicProvider`]
//! for the Anthropic Messages API, and [`local::LocalProvider`] for an
//! offline OpenAI-compatible server that needs no credential.
//!
//! Message framing always switches on the [`ProviderStyle`] value an
//! adapter carries — never on the concrete type behind the trait object.

pub mod anthropic;
pub mod local;
pub mod openai;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{GatewayError, Result};
use crate::types::{ChatMessage, ChatOptions, LlmResponse, ToolDefinition};

pub use anthropic::AnthropicProvider;
pub use local::LocalProvider;
pub use openai::OpenAiCompatProvider;

/// Default timeout applied to every outbound provider call.
pub const DEFAULT_TIMEOUT_SECS: u64 = 60;

// ───────────────────────────────────────────────────────────────────────
// Styles and specs
// ───────────────────────────────────────────────────────────────────────

/// The wire dialect an adapter speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderStyle {
    /// OpenAI chat completions: `tools` + `tool_calls`, system messages in
    /// the messages array.
    OpenAi,
    /// Anthropic messages: content blocks, `tool_use` / `tool_result`,
    /// system prompt as a top-level field.
    Anthropic,
}

/// Static description of a known provider endpoint.
#[derive(Debug, Clone, Copy)]
pub struct ProviderSpec {
    pub name: &'static str,
    pub display_name: &'static str,
    /// Base URL without a trailing slash.
    pub base_url: &'static str,
    /// Environment variable holding the default credential.
    pub env_key: &'static str,
    pub style: ProviderStyle,
    /// True for providers that work without a credential (local servers).
    pub no_auth: bool,
    pub supports_tools: bool,
}

/// Every provider this gateway knows how to talk to.
pub static KNOWN_PROVIDERS: &[ProviderSpec] = &[
    ProviderSpec {
        name: "groq",
        display_name: "Groq",
        base_url: "https://api.groq.com/openai/v1",
        env_key: "GROQ_API_KEY",
        style: ProviderStyle::OpenAi,
        no_auth: false,
        supports_tools: true,
    },
    ProviderSpec {
        name: "cerebras",
        display_name: "Cerebras",
        base_url: "https://api.cerebras.ai/v1",
        env_key: "CEREBRAS_API_KEY",
        style: ProviderStyle::OpenAi,
        no_auth: false,
        supports_tools: true,
    },
    ProviderSpec {
        name: "openai",
        display_name: "OpenAI",
        base_url: "https://api.openai.com/v1",
        env_key: "OPENAI_API_KEY",
        style: ProviderStyle::OpenAi,
        no_auth: false,
        supports_tools: true,
    },
    ProviderSpec {
        name: "anthropic",
        display_name: "Anthropic",
        base_url: "https://api.anthropic.com/v1",
        env_key: "ANTHROPIC_API_KEY",
        style: ProviderStyle::Anthropic,
        no_auth: false,
        supports_tools: true,
    },
    ProviderSpec {
        name: "together",
        display_name: "Together",
        base_url: "https://api.together.xyz/v1",
        env_key: "TOGETHER_API_KEY",
        style: ProviderStyle::OpenAi,
        no_auth: false,
        supports_tools: true,
    },
    ProviderSpec {
        name: "fireworks",
        display_name: "Fireworks",
        base_url: "https://api.fireworks.ai/inference/v1",
        env_key: "FIREWORKS_API_KEY",
        style: ProviderStyle::OpenAi,
        no_auth: false,
        supports_tools: true,
    },
    ProviderSpec {
        name: "local",
        display_name: "Local inference server",
        base_url: "http://127.0.0.1:8034/v1",
        env_key: "LOCAL_LLM_API_KEY",
        style: ProviderStyle::OpenAi,
        no_auth: true,
        supports_tools: false,
    },
];

/// Look up a provider spec by name, resolving common model-name aliases
/// (`gpt` → openai, `claude` → anthropic, `llama`/`mixtral` → groq).
pub fn provider_spec(name: &str) -> Option<&'static ProviderSpec> {
    let name = name.to_ascii_lowercase();
    let resolved = match name.as_str() {
        "gpt" | "gpt-4" | "gpt-4o" => "openai",
        "claude" => "anthropic",
        "llama" | "llama-3" | "mixtral" => "groq",
        other => other,
    };
    KNOWN_PROVIDERS.iter().find(|s| s.name == resolved)
}

/// Read a spec's credential from the environment.
pub(crate) fn env_api_key(spec: &ProviderSpec) -> Option<String> {
    std::env::var(spec.env_key).ok().filter(|v| !v.is_empty())
}

// ───────────────────────────────────────────────────────────────────────
// Client contract
// ───────────────────────────────────────────────────────────────────────

/// Construction-time overrides for a provider adapter.
#[derive(Debug, Clone, Default)]
pub struct ProviderOverrides {
    /// Credential override; the spec's environment variable otherwise.
    pub api_key: Option<String>,
    /// Default model override.
    pub model: Option<String>,
    /// Base URL override (self-hosted gateways, test servers).
    pub base_url: Option<String>,
    /// Request timeout override in seconds.
    pub timeout_secs: Option<u64>,
}

/// Callback invoked with each streamed content delta.
pub type ContentCallback<'a> = dyn FnMut(&str) + Send + 'a;

/// The one contract every provider adapter implements.
#[async_trait]
pub trait ProviderClient: Send + Sync + std::fmt::Debug {
    /// Provider name identifier (e.g. `"groq"`).
    fn name(&self) -> &str;

    /// The wire dialect; callers switch on this value.
    fn style(&self) -> ProviderStyle;

    /// Whether a usable credential (or `no_auth`) is present.  A client that
    /// is not configured fails calls with [`GatewayError::Configuration`]
    /// without touching the network.
    fn is_configured(&self) -> bool;

    /// The model used when the caller does not pick one.
    fn default_model(&self) -> String;

    /// Known model identifiers for this provider.
    fn models(&self) -> Vec<String>;

    /// Serialize canonical tool definitions into this dialect's shape.
    fn format_tools(&self, tools: &[ToolDefinition]) -> Value;

    /// Serialize canonical messages into this dialect's shape.
    ///
    /// For the Anthropic dialect the result is
    /// `{"messages": [...], "system": ...}`; for the OpenAI dialect it is
    /// the messages array itself.
    fn format_messages(&self, messages: &[ChatMessage]) -> Value;

    /// Swap the credential used for subsequent calls.  `None` reverts to
    /// the construction-time credential.  Used by rotation after a 429.
    fn set_key_override(&self, api_key: Option<String>);

    /// One non-streaming model turn.
    async fn chat(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolDefinition],
        options: &ChatOptions,
    ) -> Result<LlmResponse>;

    /// One streaming model turn; `on_content` fires for every content delta
    /// as it arrives.
    async fn chat_stream(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolDefinition],
        options: &ChatOptions,
        on_content: &mut ContentCallback<'_>,
    ) -> Result<LlmResponse>;
}

// ───────────────────────────────────────────────────────────────────────
// Factory
// ───────────────────────────────────────────────────────────────────────

/// Why a candidate was passed over during auto-detection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    /// No credential found and the provider requires one.
    NotConfigured,
    /// The adapter could not be built.
    BuildFailed(String),
}

/// Typed outcome of one auto-detection attempt, kept so failure reasons
/// stay inspectable instead of being swallowed.
#[derive(Debug, Clone)]
pub struct DetectAttempt {
    pub provider: &'static str,
    pub outcome: std::result::Result<(), SkipReason>,
}

/// Builds provider adapters.  Constructed once at startup and passed by
/// reference into whatever owns sessions; holds no hidden state.
#[derive(Debug, Clone, Default)]
pub struct ProviderFactory;

impl ProviderFactory {
    pub fn new() -> Self {
        Self
    }

    /// Build an adapter for a named provider.
    pub fn create(
        &self,
        provider: &str,
        overrides: ProviderOverrides,
    ) -> Result<Arc<dyn ProviderClient>> {
        let spec = provider_spec(provider).ok_or_else(|| GatewayError::Configuration {
            provider: provider.to_owned(),
            reason: "unknown provider".into(),
        })?;

        let client: Arc<dyn ProviderClient> = match spec.style {
            ProviderStyle::Anthropic => Arc::new(AnthropicProvider::new(spec, overrides)?),
            ProviderStyle::OpenAi if spec.no_auth => {
                Arc::new(LocalProvider::new(spec, overrides)?)
            }
            ProviderStyle::OpenAi => Arc::new(OpenAiCompatProvider::new(spec, overrides)?),
        };
        Ok(client)
    }

    /// Try providers in priority order and return the first configured one,
    /// along with the typed outcome of every attempt.
    pub fn auto_detect(
        &self,
        overrides: ProviderOverrides,
    ) -> (Option<Arc<dyn ProviderClient>>, Vec<DetectAttempt>) {
        const PRIORITY: &[&str] = &["groq", "openai", "anthropic", "together", "fireworks"];

        let mut attempts = Vec::with_capacity(PRIORITY.len());
        let mut selected: Option<Arc<dyn ProviderClient>> = None;

        for &candidate in PRIORITY {
            if selected.is_some() {
                break;
            }
            match self.create(candidate, overrides.clone()) {
                Ok(client) if client.is_configured() => {
                    attempts.push(DetectAttempt {
                        provider: candidate,
                        outcome: Ok(()),
                    });
                    selected = Some(client);
                }
                Ok(_) => attempts.push(DetectAttempt {
                    provider: candidate,
                    outcome: Err(SkipReason::NotConfigured),
                }),
                Err(e) => attempts.push(DetectAttempt {
                    provider: candidate,
                    outcome: Err(SkipReason::BuildFailed(e.to_string())),
                }),
            }
        }

        (selected, attempts)
    }

    /// Build a client from `LLM_PROVIDER` / `LLM_MODEL`, auto-detecting
    /// when no provider is named.
    pub fn from_env(&self) -> Result<Arc<dyn ProviderClient>> {
        let overrides = ProviderOverrides {
            model: std::env::var("LLM_MODEL").ok().filter(|m| !m.is_empty()),
            ..Default::default()
        };

        if let Ok(provider) = std::env::var("LLM_PROVIDER")
            && !provider.is_empty()
        {
            return self.create(&provider, overrides);
        }

        let (selected, attempts) = self.auto_detect(overrides);
        selected.ok_or_else(|| GatewayError::Configuration {
            provider: "any".into(),
            reason: format!(
                "no provider configured; tried {}",
                attempts
                    .iter()
                    .map(|a| a.provider)
                    .collect::<Vec<_>>()
                    .join(", ")
            ),
        })
    }
}

// ───────────────────────────────────────────────────────────────────────
// Model capabilities
// ───────────────────────────────────────────────────────────────────────

/// Coarse capabilities inferred from a model identifier.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ModelCapabilities {
    pub vision: bool,
    pub thinking: bool,
    pub speech: bool,
    pub transcription: bool,
}

const VISION_PATTERNS: &[&str] = &[
    "vision", "-vl", "visual", "multimodal", "gpt-4o", "claude-3", "llava", "llama-4-scout",
    "llama-4-maverick", "pixtral",
];

const THINKING_PATTERNS: &[&str] = &["o1", "o3", "deepseek-r1", "qwq", "thinking", "reason"];

const SPEECH_PATTERNS: &[&str] = &["tts", "speech", "playai", "orpheus", "voice"];

const TRANSCRIPTION_PATTERNS: &[&str] = &["whisper", "stt", "transcribe"];

/// Pattern-match a model id against the known capability markers.
pub fn detect_capabilities(model_id: &str) -> ModelCapabilities {
    let id = model_id.to_ascii_lowercase();
    let matches = |patterns: &[&str]| patterns.iter().any(|p| id.contains(p));
    ModelCapabilities {
        vision: matches(VISION_PATTERNS),
        thinking: matches(THINKING_PATTERNS),
        speech: matches(SPEECH_PATTERNS),
        transcription: matches(TRANSCRIPTION_PATTERNS),
    }
}

// ── tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spec_lookup_resolves_aliases() {
        assert_eq!(provider_spec("claude").map(|s| s.name), Some("anthropic"));
        assert_eq!(provider_spec("GPT-4o").map(|s| s.name), Some("openai"));
        assert_eq!(provider_spec("llama").map(|s| s.name), Some("groq"));
        assert!(provider_spec("nonsense").is_none());
    }

    #[test]
    fn local_spec_requires_no_auth() {
        let spec = provider_spec("local").unwrap();
        assert!(spec.no_auth);
        assert_eq!(spec.style, ProviderStyle::OpenAi);
    }

    #[test]
    fn factory_rejects_unknown_provider() {
        let factory = ProviderFactory::new();
        let err = factory
            .create("no-such-provider", ProviderOverrides::default())
            .unwrap_err();
        assert!(matches!(err, GatewayError::Configuration { .. }));
    }

    #[test]
    fn auto_detect_records_typed_outcomes() {
        let factory = ProviderFactory::new();
        let overrides = ProviderOverrides {
            // Force deterministic behavior regardless of ambient env vars.
            api_key: Some("test-key".into()),
            ..Default::default()
        };
        let (selected, attempts) = factory.auto_detect(overrides);

        // With an explicit key the first candidate wins immediately.
        assert_eq!(selected.map(|c| c.name().to_owned()), Some("groq".into()));
        assert_eq!(attempts.len(), 1);
        assert!(attempts[0].outcome.is_ok());
    }

    #[test]
    fn capability_detection() {
        assert!(detect_capabilities("llama-3.2-11b-vision-preview").vision);
        assert!(detect_capabilities("deepseek-r1-distill-llama-70b").thinking);
        assert!(detect_capabilities("playai-tts").speech);
        assert!(detect_capabilities("whisper-large-v3").transcription);
        assert_eq!(
            detect_capabilities("llama-3.3-70b-versatile"),
            ModelCapabilities::default()
        );
    }
}
