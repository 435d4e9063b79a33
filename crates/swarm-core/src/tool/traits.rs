//! Tool trait definition

use async_trait::async_trait;
use serde_json::Value as JsonValue;

use crate::Result;
use crate::context::RunContext;

/// Tool execution result
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolResult {
    /// Output string from tool execution
    pub output: String,
    /// Whether the execution resulted in an error
    pub is_error: bool,
}

impl ToolResult {
    /// Create a successful tool result
    pub fn success(output: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            is_error: false,
        }
    }

    /// Create an error tool result
    pub fn error(output: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            is_error: true,
        }
    }
}

/// A named capability the model can invoke
#[async_trait]
pub trait Tool: Send + Sync {
    /// Get the tool name (used in tool definitions)
    fn name(&self) -> &str;

    /// Get the tool description (shown to the model when selecting tools)
    fn description(&self) -> &str;

    /// Get the JSON schema for the tool's input parameters
    fn input_schema(&self) -> JsonValue;

    /// Execute the tool on behalf of the run described by `ctx`
    async fn execute(&self, ctx: &RunContext, input: JsonValue) -> Result<ToolResult>;
}
