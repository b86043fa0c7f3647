//! LLM provider client.
//!
//! HTTP client for an OpenAI-compatible chat-completions + embeddings API,
//! extended to also carry tool-call turns (for the Agent Kernel) and a
//! structured-parse helper (for the document store's `smart_query` term
//! extraction).

use std::time::Duration;

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("LLM API error: {0}")]
    Api(String),
    #[error("LLM response parsing error: {0}")]
    Parse(String),
    #[error("LLM request timed out after {0}s")]
    Timeout(u64),
    #[error("LLM rate limited, retry after {0}s")]
    RateLimited(u64),
    #[error("request error: {0}")]
    Request(#[from] reqwest::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self { role: "system".into(), content: content.into(), tool_call_id: None, tool_calls: None }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self { role: "user".into(), content: content.into(), tool_call_id: None, tool_calls: None }
    }

    pub fn tool_result(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: "tool".into(),
            content: content.into(),
            tool_call_id: Some(tool_call_id.into()),
            tool_calls: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub function: ToolCallFunction,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallFunction {
    pub name: String,
    pub arguments: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ToolDefinition {
    #[serde(rename = "type")]
    pub kind: String,
    pub function: ToolFunctionDefinition,
}

#[derive(Debug, Clone, Serialize)]
pub struct ToolFunctionDefinition {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<&'a [ToolDefinition]>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<ResponseFormat>,
    temperature: f64,
}

#[derive(Debug, Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatCompletionChoice>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionChoice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<ToolCall>,
}

#[derive(Debug, Deserialize)]
struct Usage {
    prompt_tokens: u32,
    completion_tokens: u32,
}

/// Either a free-text reply or a batch of tool calls the agent loop must
/// dispatch before the turn can continue.
#[derive(Debug, Clone)]
pub enum ChatTurn {
    Message { content: String, input_tokens: u32, output_tokens: u32 },
    ToolCalls { calls: Vec<ToolCall>, input_tokens: u32, output_tokens: u32 },
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingDatum>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingDatum {
    embedding: Vec<f32>,
}

#[derive(Debug, Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

pub struct LlmClient {
    http: reqwest::Client,
    api_base: String,
    api_key: String,
    inference_model: String,
    embedding_model: String,
    request_timeout: Duration,
}

impl LlmClient {
    pub fn new(
        api_base: impl Into<String>,
        api_key: impl Into<String>,
        inference_model: impl Into<String>,
        embedding_model: impl Into<String>,
        request_timeout: Duration,
    ) -> Self {
        Self {
            http: reqwest::Client::new(),
            api_base: api_base.into(),
            api_key: api_key.into(),
            inference_model: inference_model.into(),
            embedding_model: embedding_model.into(),
            request_timeout,
        }
    }

    /// One chat-completion turn, optionally exposing a tool list. Returns
    /// either the assistant's text reply or the tool calls it chose to make.
    pub async fn chat(
        &self,
        messages: &[ChatMessage],
        tools: Option<&[ToolDefinition]>,
    ) -> Result<ChatTurn, LlmError> {
        let request = ChatCompletionRequest {
            model: &self.inference_model,
            messages,
            tools,
            response_format: None,
            temperature: 0.0,
        };
        let response = self.post("/chat/completions", &request).await?;
        let parsed: ChatCompletionResponse =
            response.json().await.map_err(|e| LlmError::Parse(e.to_string()))?;

        let choice = parsed
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| LlmError::Parse("empty choices array".to_string()))?;
        let input_tokens = parsed.usage.as_ref().map(|u| u.prompt_tokens).unwrap_or(0);
        let output_tokens = parsed.usage.as_ref().map(|u| u.completion_tokens).unwrap_or(0);

        if !choice.message.tool_calls.is_empty() {
            Ok(ChatTurn::ToolCalls { calls: choice.message.tool_calls, input_tokens, output_tokens })
        } else {
            Ok(ChatTurn::Message {
                content: choice.message.content.unwrap_or_default(),
                input_tokens,
                output_tokens,
            })
        }
    }

    /// Chat completion constrained to return JSON matching `T`, using the
    /// parsing model for cheaper/faster structured extraction (mirrors the
    /// source's `responses.parse` calls with a Pydantic `text_format`).
    pub async fn parse_structured<T: DeserializeOwned>(
        &self,
        model: &str,
        system_prompt: &str,
        user_content: &str,
    ) -> Result<T, LlmError> {
        let messages =
            vec![ChatMessage::system(system_prompt), ChatMessage::user(user_content)];
        let request = ChatCompletionRequest {
            model,
            messages: &messages,
            tools: None,
            response_format: Some(ResponseFormat { kind: "json_object" }),
            temperature: 0.0,
        };
        let response = self.post("/chat/completions", &request).await?;
        let parsed: ChatCompletionResponse =
            response.json().await.map_err(|e| LlmError::Parse(e.to_string()))?;
        let content = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| LlmError::Parse("empty structured response".to_string()))?;
        serde_json::from_str(&content).map_err(|e| LlmError::Parse(e.to_string()))
    }

    /// Batch-embeds `texts`, one embedding vector per input in the same order.
    pub async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, LlmError> {
        let request = EmbeddingRequest { model: &self.embedding_model, input: texts };
        let response = self.post("/embeddings", &request).await?;
        let parsed: EmbeddingResponse =
            response.json().await.map_err(|e| LlmError::Parse(e.to_string()))?;
        Ok(parsed.data.into_iter().map(|d| d.embedding).collect())
    }

    async fn post(
        &self,
        path: &str,
        body: &impl Serialize,
    ) -> Result<reqwest::Response, LlmError> {
        let url = format!("{}{path}", self.api_base.trim_end_matches('/'));
        let response = self
            .http
            .post(url)
            .bearer_auth(&self.api_key)
            .timeout(self.request_timeout)
            .json(body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    LlmError::Timeout(self.request_timeout.as_secs())
                } else {
                    LlmError::Api(e.to_string())
                }
            })?;

        let status = response.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            let retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .unwrap_or(60);
            return Err(LlmError::RateLimited(retry_after));
        }
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(LlmError::Api(format!("{status}: {text}")));
        }
        Ok(response)
    }
}
