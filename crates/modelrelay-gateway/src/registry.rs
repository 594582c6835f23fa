//! External tool registry contract.
//!
//! The gateway never inspects how tools are implemented: it lists and looks
//! up definitions, and invokes by name with a JSON argument object.  Tool
//! timeouts, sandboxing, and execution policy are the registry's problem.

use async_trait::async_trait;
use serde_json::Value;

use crate::error::Result;
use crate::types::ToolDefinition;

/// The contract an external tool registry fulfils for the gateway.
#[async_trait]
pub trait ToolRegistry: Send + Sync {
    /// Every tool the registry exposes.
    async fn list_tools(&self) -> Result<Vec<ToolDefinition>>;

    /// Look up one tool by name.  The default implementation scans
    /// [`ToolRegistry::list_tools`].
    async fn find_tool(&self, name: &str) -> Result<Option<ToolDefinition>> {
        Ok(self
            .list_tools()
            .await?
            .into_iter()
            .find(|tool| tool.name == name))
    }

    /// Invoke a tool with named arguments, returning its raw result value.
    async fn invoke(&self, name: &str, arguments: Value) -> Result<Value>;
}

// ── tests ────────────────────────────────────────────────────────────
