use futures::future::BoxFuture;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::warn;

use troupe_core::chat::{
    ChatMessage, CompletionRequest, CompletionResponse, Role, ToolCall, ToolDefinition,
};
use troupe_core::error::{Result, TroupeError};
use troupe_core::traits::LlmClient;

/// OpenAI-compatible chat-completions client. Works against OpenAI,
/// OpenRouter, Ollama, vLLM, Groq and anything else speaking the same
/// wire format.
pub struct HttpChatClient {
    http: Client,
    base_url: String,
    model: String,
    api_key: String,
}

impl HttpChatClient {
    pub fn new(
        base_url: impl Into<String>,
        model: impl Into<String>,
        api_key: impl Into<String>,
    ) -> Self {
        Self {
            http: Client::new(),
            base_url: base_url.into(),
            model: model.into(),
            api_key: api_key.into(),
        }
    }
}

// Wire types

#[derive(Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<WireMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<WireTool>,
}

#[derive(Serialize)]
struct WireMessage {
    role: &'static str,
    content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
}

#[derive(Serialize)]
struct WireTool {
    r#type: &'static str,
    function: WireToolDef,
}

#[derive(Serialize)]
struct WireToolDef {
    name: String,
    description: String,
    parameters: serde_json::Value,
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<WireToolCall>,
}

#[derive(Deserialize)]
struct WireToolCall {
    id: String,
    function: WireFunctionCall,
}

#[derive(Deserialize)]
struct WireFunctionCall {
    name: String,
    #[serde(default)]
    arguments: String,
}

fn wire_role(role: Role) -> &'static str {
    match role {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
        Role::Tool => "tool",
    }
}

fn to_wire(messages: &[ChatMessage]) -> Vec<WireMessage> {
    messages
        .iter()
        .map(|m| WireMessage {
            role: wire_role(m.role),
            content: m.content.clone(),
            tool_call_id: m.tool_call_id.clone(),
        })
        .collect()
}

fn convert_tools(tools: &[ToolDefinition]) -> Vec<WireTool> {
    tools
        .iter()
        .map(|t| WireTool {
            r#type: "function",
            function: WireToolDef {
                name: t.name.clone(),
                description: t.description.clone(),
                parameters: t.input_schema.clone(),
            },
        })
        .collect()
}

impl LlmClient for HttpChatClient {
    fn complete(&self, request: CompletionRequest) -> BoxFuture<'_, Result<CompletionResponse>> {
        Box::pin(async move {
            let body = ChatRequest {
                model: self.model.clone(),
                messages: to_wire(&request.messages),
                temperature: Some(request.temperature),
                max_tokens: request.max_tokens,
                tools: convert_tools(&request.tools),
            };

            let response = self
                .http
                .post(&self.base_url)
                .bearer_auth(&self.api_key)
                .json(&body)
                .send()
                .await
                .map_err(|e| TroupeError::LlmRequest(format!("connection error: {e}")))?;

            let status = response.status();
            if !status.is_success() {
                let text = response.text().await.unwrap_or_default();
                warn!(status = status.as_u16(), model = %self.model, "chat completion failed");
                return Err(TroupeError::LlmRequest(format!(
                    "HTTP {}: {}",
                    status.as_u16(),
                    text
                )));
            }

            let parsed: ChatResponse = response
                .json()
                .await
                .map_err(|e| TroupeError::LlmParse(e.to_string()))?;

            let choice = parsed
                .choices
                .into_iter()
                .next()
                .ok_or_else(|| TroupeError::LlmParse("response has no choices".into()))?;

            let tool_calls = choice
                .message
                .tool_calls
                .into_iter()
                .map(|tc| {
                    let arguments = serde_json::from_str(&tc.function.arguments)
                        .unwrap_or(serde_json::Value::Null);
                    ToolCall {
                        id: tc.id,
                        name: tc.function.name,
                        arguments,
                    }
                })
                .collect();

            Ok(CompletionResponse {
                text: choice.message.content.unwrap_or_default(),
                tool_calls,
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_serializes_tools_as_functions() {
        let body = ChatRequest {
            model: "gpt-4o-mini".into(),
            messages: to_wire(&[ChatMessage::system("be brief"), ChatMessage::user("hi")]),
            temperature: Some(0.2),
            max_tokens: None,
            tools: convert_tools(&[ToolDefinition {
                name: "utc_now".into(),
                description: "current time".into(),
                input_schema: serde_json::json!({"type": "object"}),
            }]),
        };
        let value = serde_json::to_value(&body).unwrap();
        assert_eq!(value["messages"][0]["role"], "system");
        assert_eq!(value["tools"][0]["type"], "function");
        assert_eq!(value["tools"][0]["function"]["name"], "utc_now");
        assert!(value.get("max_tokens").is_none());
    }

    #[test]
    fn response_parses_tool_calls() {
        let raw = serde_json::json!({
            "choices": [{
                "message": {
                    "content": null,
                    "tool_calls": [{
                        "id": "call_1",
                        "function": {"name": "utc_now", "arguments": "{\"tz\":\"utc\"}"}
                    }]
                }
            }]
        });
        let parsed: ChatResponse = serde_json::from_value(raw).unwrap();
        let choice = &parsed.choices[0];
        assert_eq!(choice.message.tool_calls.len(), 1);
        assert_eq!(choice.message.tool_calls[0].function.name, "utc_now");
    }
}
