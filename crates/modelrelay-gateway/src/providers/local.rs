//! Local inference server adapter.
//!
//! Wraps the OpenAI-compatible dialect for an offline server (llama.cpp,
//! vLLM, Ollama's compatibility endpoint) running next to the gateway.
//! The provider is `no_auth`: no credential is required or sent, so
//! rotation and key configuration never apply.  Whether the server is
//! actually up is a runtime question answered by [`LocalProvider::health_check`],
//! not a configuration one.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::Result;
use crate::providers::openai::OpenAiCompatProvider;
use crate::providers::{
    ContentCallback, ProviderClient, ProviderOverrides, ProviderSpec, ProviderStyle,
};
use crate::types::{ChatMessage, ChatOptions, LlmResponse, ToolDefinition};

/// Timeout for the health probe; a local server answers fast or not at all.
const HEALTH_TIMEOUT_SECS: u64 = 2;

/// Adapter for a no-auth local OpenAI-compatible server.
#[derive(Debug)]
pub struct LocalProvider {
    inner: OpenAiCompatProvider,
    base_url: String,
}

impl LocalProvider {
    pub fn new(spec: &'static ProviderSpec, overrides: ProviderOverrides) -> Result<Self> {
        let base_url = overrides
            .base_url
            .clone()
            .unwrap_or_else(|| spec.base_url.to_owned());
        Ok(Self {
            inner: OpenAiCompatProvider::new(spec, overrides)?,
            base_url,
        })
    }

    /// Probe the server's model listing endpoint.  Returns `false` on any
    /// failure — an offline server is an expected state, not an error.
    pub async fn health_check(&self) -> bool {
        let client = match reqwest::Client::builder()
            .timeout(Duration::from_secs(HEALTH_TIMEOUT_SECS))
            .build()
        {
            Ok(c) => c,
            Err(_) => return false,
        };

        let url = format!("{}/models", self.base_url);
        match client.get(&url).send().await {
            Ok(resp) => resp.status().is_success(),
            Err(e) => {
                tracing::debug!(url = %url, error = %e, "local server health probe failed");
                false
            }
        }
    }
}

#[async_trait]
impl ProviderClient for LocalProvider {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn style(&self) -> ProviderStyle {
        ProviderStyle::OpenAi
    }

    fn is_configured(&self) -> bool {
        // No credential needed; readiness is a health_check concern.
        true
    }

    fn default_model(&self) -> String {
        self.inner.default_model()
    }

    fn models(&self) -> Vec<String> {
        self.inner.models()
    }

    fn format_tools(&self, tools: &[ToolDefinition]) -> Value {
        self.inner.format_tools(tools)
    }

    fn format_messages(&self, messages: &[ChatMessage]) -> Value {
        self.inner.format_messages(messages)
    }

    fn set_key_override(&self, api_key: Option<String>) {
        self.inner.set_key_override(api_key);
    }

    async fn chat(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolDefinition],
        options: &ChatOptions,
    ) -> Result<LlmResponse> {
        self.inner.chat(messages, tools, options).await
    }

    async fn chat_stream(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolDefinition],
        options: &ChatOptions,
        on_content: &mut ContentCallback<'_>,
    ) -> Result<LlmResponse> {
        self.inner.chat_stream(messages, tools, options, on_content).await
    }
}

// ── tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::provider_spec;

    fn provider() -> LocalProvider {
        LocalProvider::new(provider_spec("local").unwrap(), ProviderOverrides::default()).unwrap()
    }

    #[test]
    fn configured_without_any_credential() {
        let p = provider();
        assert!(p.is_configured());
        assert_eq!(p.name(), "local");
        assert_eq!(p.style(), ProviderStyle::OpenAi);
    }

    #[test]
    fn speaks_the_openai_dialect() {
        let p = provider();
        let wire = p.format_messages(&[ChatMessage::system("sys"), ChatMessage::user("hi")]);
        let arr = wire.as_array().unwrap();
        assert_eq!(arr[0]["role"], "system");
        assert_eq!(arr[1]["role"], "user");
    }

    #[tokio::test]
    async fn health_check_fails_cleanly_when_offline() {
        let p = LocalProvider::new(
            provider_spec("local").unwrap(),
            ProviderOverrides {
                // A port that should refuse connections immediately.
                base_url: Some("http://127.0.0.1:9".into()),
                ..Default::default()
            },
        )
        .unwrap();
        assert!(!p.health_check().await);
    }
}
