//! # modelrelay-gateway
//!
//! A provider-agnostic LLM gateway: one canonical shape for chat and tool
//! calling, whatever wire dialect the provider behind it speaks.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────┐     ┌──────────────┐     ┌───────────────┐
//! │  ChatSession  │────>│  Provider    │────>│ SseLineDecoder│
//! │  (agent loop) │     │  Adapters    │     │ (streaming)   │
//! └───────┬───────┘     └──────┬───────┘     └───────────────┘
//!         │                    │
//!   ┌─────┴──────┐      ┌──────┴───────┐
//!   │ QuotaService│      │  KeyStore    │
//!   │ (tiers)     │      │  (rotation)  │
//!   └────────────┘      └──────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`types`] -- canonical messages, tool definitions/calls/results,
//!   responses.
//! - [`sse`] -- chunk-boundary-safe event-stream decoding.
//! - [`providers`] -- OpenAI-style, Anthropic-style, and local adapters
//!   behind one [`providers::ProviderClient`] contract.
//! - [`extract`] -- best-effort free-text tool-call extraction.
//! - [`quota`] -- tier shares, floors, and the fallback decision.
//! - [`sanitize`] -- tool result scrubbing.
//! - [`registry`] -- the external tool registry contract.
//! - [`session`] -- the bounded tool-calling orchestration loop.
//! - [`error`] -- the gateway error taxonomy.

pub mod error;
pub mod extract;
pub mod providers;
pub mod quota;
pub mod registry;
pub mod sanitize;
pub mod session;
pub mod sse;
pub mod types;

// Re-export the most commonly used types at the crate root.
pub use error::{GatewayError, Result};
pub use extract::{ExtractedCall, extract_tool_call, lenient_json};
pub use providers::{
    AnthropicProvider, DetectAttempt, LocalProvider, ModelCapabilities, OpenAiCompatProvider,
    ProviderClient, ProviderFactory, ProviderOverrides, ProviderSpec, ProviderStyle, SkipReason,
    detect_capabilities, provider_spec,
};
pub use quota::{
    FallbackDecision, QuotaConfig, QuotaDecision, QuotaDenial, QuotaService, RateLimits,
    SpeechLimits, Tier, default_limits,
};
pub use registry::ToolRegistry;
pub use sanitize::sanitize_tool_result;
pub use session::{
    CallerInfo, ChatEvent, ChatOutcome, ChatSession, DEFAULT_MAX_ITERATIONS, SessionConfig,
};
pub use sse::SseLineDecoder;
pub use types::{
    ChatMessage, ChatOptions, FinishReason, LlmResponse, Role, ToolCall, ToolChoice,
    ToolDefinition, ToolResult, Usage, normalize_tools,
};
