//! Gateway error types.
//!
//! All gateway subsystems surface errors through [`GatewayError`].  The
//! taxonomy separates failures by where they can be handled: configuration
//! problems abort before any network call, transport/protocol problems are
//! logged in full and surfaced generically, tool failures flow back into
//! the conversation, and quota denials return before the model is reached.

use thiserror::Error;

/// Unified error type for the gateway.
#[derive(Debug, Error)]
pub enum GatewayError {
    // ── provider boundary ────────────────────────────────────────────
    /// No usable credential for a provider that requires one.
    #[error("provider `{provider}` is not configured: {reason}")]
    Configuration { provider: String, reason: String },

    /// Network failure, timeout, or non-2xx response from a provider.
    #[error("transport error{}: {message}", match .status { Some(s) => format!(" (HTTP {s})"), None => String::new() })]
    Transport {
        /// HTTP status when the provider responded at all.
        status: Option<u16>,
        message: String,
    },

    /// The provider responded, but the body could not be decoded into the
    /// expected shape.
    #[error("protocol error: {message}")]
    Protocol { message: String },

    // ── tool execution ───────────────────────────────────────────────
    /// A tool invocation failed: unknown tool, argument mismatch, handler
    /// error, or write verification failure.
    #[error("tool `{tool}` failed: {reason}")]
    ToolExecution { tool: String, reason: String },

    // ── quota ────────────────────────────────────────────────────────
    /// A tier or organization limit was hit before the model call.
    #[error("quota exceeded: {reason}")]
    QuotaExceeded { reason: String },

    // ── ambient ──────────────────────────────────────────────────────
    /// JSON serialization or deserialization failed.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// An error propagated from the persistence layer.
    #[error("store error: {0}")]
    Store(#[from] modelrelay_store::StoreError),
}

/// Convenience alias used throughout the gateway crate.
pub type Result<T> = std::result::Result<T, GatewayError>;

impl GatewayError {
    /// True when this is a 429-class transport error, i.e. the signal that
    /// drives credential rotation.
    pub fn is_rate_limited(&self) -> bool {
        matches!(
            self,
            Self::Transport {
                status: Some(429),
                ..
            }
        )
    }

    /// Shorthand for a transport error without an HTTP status (connection
    /// failures, timeouts).
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            status: None,
            message: message.into(),
        }
    }

    /// Shorthand for a protocol (undecodable body) error.
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }
}

impl From<reqwest::Error> for GatewayError {
    fn from(err: reqwest::Error) -> Self {
        Self::Transport {
            status: err.status().map(|s| s.as_u16()),
            message: err.to_string(),
        }
    }
}
