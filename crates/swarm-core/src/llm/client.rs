//! Anthropic Messages API HTTP client

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::provider::LlmProvider;
use super::types::{ChatRequest, ChatResponse, Role, ToolCall, ToolDefinition, Usage};
use crate::config::LlmConfig;
use crate::error::{Error, Result};

const DEFAULT_BASE_URL: &str = "https://api.anthropic.com/v1";
const API_VERSION: &str = "2023-06-01";

/// LLM client speaking the Anthropic Messages API
#[derive(Clone)]
pub struct ClaudeClient {
    client: Client,
    api_key: String,
    model: String,
    base_url: String,
    max_tokens: u64,
}

impl ClaudeClient {
    /// Create a new client from the `[llm]` configuration section
    pub fn new(config: &LlmConfig) -> Result<Self> {
        if config.api_key.is_empty() {
            return Err(Error::Config("LLM api_key is empty".to_string()));
        }

        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(120))
            .build()
            .map_err(Error::Http)?;

        Ok(Self {
            client,
            api_key: config.api_key.clone(),
            model: config.model.clone(),
            base_url: config
                .base_url
                .clone()
                .unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            max_tokens: config.max_tokens,
        })
    }

    /// Get the model name
    pub fn model(&self) -> &str {
        &self.model
    }

    fn build_wire_request(&self, request: ChatRequest) -> WireRequest {
        let mut system = Vec::new();
        let mut messages: Vec<WireMessage> = Vec::new();

        for msg in request.messages {
            match msg.role {
                Role::System => system.push(msg.content),
                Role::User => push_blocks(&mut messages, "user", vec![WireBlock::Text {
                    text: msg.content,
                }]),
                Role::Assistant => {
                    let mut blocks = Vec::new();
                    if !msg.content.is_empty() {
                        blocks.push(WireBlock::Text { text: msg.content });
                    }
                    blocks.extend(msg.tool_calls.into_iter().map(|call| WireBlock::ToolUse {
                        id: call.id,
                        name: call.name,
                        input: call.arguments,
                    }));
                    push_blocks(&mut messages, "assistant", blocks);
                }
                // Tool results travel as user-role content blocks
                Role::Tool => push_blocks(&mut messages, "user", vec![WireBlock::ToolResult {
                    tool_use_id: msg.tool_call_id.unwrap_or_default(),
                    content: msg.content,
                    is_error: msg.is_error,
                }]),
            }
        }

        WireRequest {
            model: request.model.unwrap_or_else(|| self.model.clone()),
            max_tokens: request.options.max_tokens.unwrap_or(self.max_tokens),
            system: if system.is_empty() {
                None
            } else {
                Some(system.join("\n\n"))
            },
            messages,
            tools: if request.tools.is_empty() {
                None
            } else {
                Some(request.tools)
            },
            temperature: request.options.temperature,
        }
    }
}

/// Consecutive messages with the same role are merged into one wire message
fn push_blocks(messages: &mut Vec<WireMessage>, role: &str, blocks: Vec<WireBlock>) {
    if blocks.is_empty() {
        return;
    }
    match messages.last_mut() {
        Some(last) if last.role == role => last.content.extend(blocks),
        _ => messages.push(WireMessage {
            role: role.to_string(),
            content: blocks,
        }),
    }
}

#[async_trait]
impl LlmProvider for ClaudeClient {
    fn name(&self) -> &str {
        "anthropic"
    }

    fn default_model(&self) -> &str {
        &self.model
    }

    async fn chat(&self, request: ChatRequest) -> Result<ChatResponse> {
        let url = format!("{}/messages", self.base_url);
        let wire = self.build_wire_request(request);

        debug!("Sending request to Messages API: {} (model={})", url, wire.model);

        let response = self
            .client
            .post(&url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .header("content-type", "application/json")
            .json(&wire)
            .send()
            .await
            .map_err(Error::Http)?;

        let status = response.status();
        let body = response.text().await.map_err(Error::Http)?;

        if !status.is_success() {
            warn!("Messages API error: {} - {}", status, body);
            return Err(Error::LlmApi(format!("{}: {}", status, body)));
        }

        let parsed: WireResponse = serde_json::from_str(&body)
            .map_err(|e| Error::LlmApi(format!("Failed to parse response: {} - {}", e, body)))?;

        info!(
            "Messages API response: stop_reason={}, tokens={}",
            parsed.stop_reason,
            parsed.usage.map(|u| u.output_tokens).unwrap_or(0)
        );

        Ok(parsed.into_chat_response())
    }
}

#[derive(Debug, Serialize)]
struct WireRequest {
    model: String,
    max_tokens: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    messages: Vec<WireMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<ToolDefinition>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
}

#[derive(Debug, Serialize, Deserialize)]
struct WireMessage {
    role: String,
    content: Vec<WireBlock>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WireBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },
    ToolResult {
        tool_use_id: String,
        content: String,
        #[serde(default)]
        is_error: bool,
    },
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Deserialize)]
struct WireResponse {
    content: Vec<WireBlock>,
    #[serde(default)]
    stop_reason: String,
    #[serde(default)]
    usage: Option<Usage>,
}

impl WireResponse {
    fn into_chat_response(self) -> ChatResponse {
        let mut text = Vec::new();
        let mut tool_calls = Vec::new();
        for block in self.content {
            match block {
                WireBlock::Text { text: t } => text.push(t),
                WireBlock::ToolUse { id, name, input } => {
                    tool_calls.push(ToolCall::new(id, name, input))
                }
                WireBlock::ToolResult { .. } | WireBlock::Unknown => {}
            }
        }
        ChatResponse {
            content: text.join("\n"),
            tool_calls,
            usage: self.usage,
            finish_reason: self.stop_reason,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::Message;
    use serde_json::json;

    fn test_client() -> ClaudeClient {
        ClaudeClient::new(&LlmConfig {
            api_key: "test-key".to_string(),
            ..LlmConfig::default()
        })
        .unwrap()
    }

    #[test]
    fn test_new_rejects_empty_key() {
        assert!(ClaudeClient::new(&LlmConfig::default()).is_err());
    }

    #[test]
    fn test_wire_request_extracts_system_and_merges_tool_results() {
        let client = test_client();
        let request = ChatRequest {
            messages: vec![
                Message::system("be brief"),
                Message::user("list files"),
                Message::assistant_with_tools(
                    "",
                    vec![
                        ToolCall::new("a", "exec", json!({"cmd": "ls"})),
                        ToolCall::new("b", "read_file", json!({"path": "x"})),
                    ],
                ),
                Message::tool_result("a", "file.txt", false),
                Message::tool_result("b", "missing", true),
            ],
            ..Default::default()
        };

        let wire = client.build_wire_request(request);
        assert_eq!(wire.system.as_deref(), Some("be brief"));
        assert_eq!(wire.messages.len(), 3);
        assert_eq!(wire.messages[1].content.len(), 2);
        // Both tool results land in a single user message
        assert_eq!(wire.messages[2].role, "user");
        assert_eq!(wire.messages[2].content.len(), 2);
        assert!(wire.tools.is_none());
    }

    #[test]
    fn test_wire_response_conversion() {
        let body = json!({
            "content": [
                {"type": "text", "text": "checking"},
                {"type": "tool_use", "id": "t1", "name": "exec", "input": {"cmd": "pwd"}},
                {"type": "thinking", "thinking": "..."}
            ],
            "stop_reason": "tool_use",
            "usage": {"input_tokens": 10, "output_tokens": 4}
        });
        let parsed: WireResponse = serde_json::from_value(body).unwrap();
        let resp = parsed.into_chat_response();
        assert_eq!(resp.content, "checking");
        assert_eq!(resp.tool_calls.len(), 1);
        assert_eq!(resp.tool_calls[0].name, "exec");
        assert_eq!(resp.usage.map(|u| u.output_tokens), Some(4));
    }
}
