//! OpenAI Chat Completions Client
//!
//! Thin client over the chat completions endpoint, used three ways:
//! - plain chat (memory answer synthesis, meal extraction)
//! - chat with function-calling tools (the agent loop)
//! - intent classification of incoming messages

use anyhow::Result;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

const OPENAI_API_URL: &str = "https://api.openai.com/v1";

/// Classification of an incoming message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Intent {
    Save,
    Retrieve,
    Unknown,
}

impl Intent {
    /// Map a raw classifier reply onto an intent.
    /// "save" wins over "retrieve" when both appear.
    pub fn parse(reply: &str) -> Self {
        let reply = reply.trim().to_lowercase();

        if reply.contains("save") {
            return Intent::Save;
        }
        if reply.contains("retrieve") {
            return Intent::Retrieve;
        }

        Intent::Unknown
    }
}

/// One turn in a chat completion conversation.
///
/// The same shape is sent and received; assistant turns may carry tool calls,
/// tool turns carry the id of the call they answer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCallRequest>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self::plain("system", content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::plain("user", content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::plain("assistant", content)
    }

    /// A tool result turn answering a specific tool call
    pub fn tool(tool_call_id: &str, content: impl Into<String>) -> Self {
        Self {
            role: "tool".to_string(),
            content: Some(content.into()),
            tool_calls: None,
            tool_call_id: Some(tool_call_id.to_string()),
        }
    }

    fn plain(role: &str, content: impl Into<String>) -> Self {
        Self {
            role: role.to_string(),
            content: Some(content.into()),
            tool_calls: None,
            tool_call_id: None,
        }
    }

    /// Text of this turn, empty if the model returned none
    pub fn text(&self) -> &str {
        self.content.as_deref().unwrap_or_default()
    }
}

/// A tool invocation requested by the model
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallRequest {
    pub id: String,
    pub r#type: String,
    pub function: FunctionCall,
}

/// Function name plus its arguments as a JSON-encoded string
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionCall {
    pub name: String,
    pub arguments: String,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<&'a [Value]>,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize, Default)]
struct Usage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

/// Seam for everything that talks to the chat model, so services and the
/// dispatch logic can be exercised against a scripted fake.
#[async_trait]
pub trait ChatModel: Send + Sync {
    /// Plain chat completion
    async fn chat(&self, messages: &[ChatMessage]) -> Result<ChatMessage>;

    /// Chat completion with function-calling tools attached
    async fn chat_with_tools(
        &self,
        messages: &[ChatMessage],
        tools: &[Value],
    ) -> Result<ChatMessage>;

    /// Classify the intent of a user message
    async fn identify_intent(&self, message: &str) -> Result<Intent> {
        let messages = vec![
            ChatMessage::system(
                "You are a intent classifier. Classify the intent of user message. \
                 Respond with either \"save\" or \"retrieve\".",
            ),
            ChatMessage::user(message),
        ];

        let reply = self.chat(&messages).await?;
        Ok(Intent::parse(reply.text()))
    }
}

/// OpenAI chat completions client
#[derive(Clone)]
pub struct OpenAiClient {
    client: Client,
    api_key: String,
    model: String,
}

impl OpenAiClient {
    pub fn new(api_key: &str, model: &str) -> Self {
        Self {
            client: Client::new(),
            api_key: api_key.to_string(),
            model: model.to_string(),
        }
    }

    /// Create from config
    pub fn from_config(config: &crate::config::Config) -> Self {
        Self::new(&config.openai_api_key, &config.chat_model)
    }

    async fn request(
        &self,
        messages: &[ChatMessage],
        tools: Option<&[Value]>,
        temperature: Option<f32>,
    ) -> Result<ChatMessage> {
        let request = ChatRequest {
            model: &self.model,
            messages,
            temperature,
            tools,
        };

        debug!(
            "Calling OpenAI: model={}, messages={}, tools={}",
            self.model,
            messages.len(),
            tools.map(|t| t.len()).unwrap_or(0)
        );

        let response = self
            .client
            .post(format!("{}/chat/completions", OPENAI_API_URL))
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await?;
            anyhow::bail!("OpenAI API error {}: {}", status, text);
        }

        let result: ChatResponse = response.json().await?;

        let usage = result.usage.unwrap_or_default();
        info!(
            "OpenAI response: model={}, prompt_tokens={}, completion_tokens={}",
            self.model, usage.prompt_tokens, usage.completion_tokens
        );

        result
            .choices
            .into_iter()
            .next()
            .map(|c| c.message)
            .ok_or_else(|| anyhow::anyhow!("OpenAI returned no choices"))
    }
}

#[async_trait]
impl ChatModel for OpenAiClient {
    async fn chat(&self, messages: &[ChatMessage]) -> Result<ChatMessage> {
        self.request(messages, None, None).await
    }

    async fn chat_with_tools(
        &self,
        messages: &[ChatMessage],
        tools: &[Value],
    ) -> Result<ChatMessage> {
        // Tool selection is deterministic at temperature 0
        self.request(messages, Some(tools), Some(0.0)).await
    }
}
