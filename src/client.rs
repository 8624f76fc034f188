//! OpenAI-compatible chat client for llama-server
//!
//! Streaming responses are Server-Sent Events: one `data: {json}` line per
//! delta, terminated by `data: [DONE]`. Malformed event lines are skipped.

use crate::error::{SupervisorError, SupervisorResult};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

/// Message content: plain text or multimodal parts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    ImageUrl { image_url: ImageUrl },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageUrl {
    pub url: String,
}

impl ContentPart {
    pub fn text(text: impl Into<String>) -> Self {
        ContentPart::Text { text: text.into() }
    }

    /// Inline JPEG as a data URL
    pub fn jpeg_base64(data: &str) -> Self {
        ContentPart::ImageUrl {
            image_url: ImageUrl {
                url: format!("data:image/jpeg;base64,{}", data),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: MessageContent,
}

impl ChatMessage {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: MessageContent::Text(content.into()),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new("system", content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new("user", content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new("assistant", content)
    }

    pub fn multimodal(role: impl Into<String>, parts: Vec<ContentPart>) -> Self {
        Self {
            role: role.into(),
            content: MessageContent::Parts(parts),
        }
    }

    /// Text of a plain message, or the concatenated text parts
    pub fn text(&self) -> String {
        match &self.content {
            MessageContent::Text(text) => text.clone(),
            MessageContent::Parts(parts) => parts
                .iter()
                .filter_map(|p| match p {
                    ContentPart::Text { text } => Some(text.as_str()),
                    ContentPart::ImageUrl { .. } => None,
                })
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }
}

/// Sampling parameters; zero values fall back to the defaults
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SamplingParams {
    pub temperature: f64,
    pub top_p: f64,
    pub max_tokens: u32,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            top_p: 0.9,
            max_tokens: 4096,
        }
    }
}

impl SamplingParams {
    pub fn normalized(self) -> Self {
        let defaults = Self::default();
        Self {
            temperature: if self.temperature == 0.0 {
                defaults.temperature
            } else {
                self.temperature
            },
            top_p: if self.top_p == 0.0 {
                defaults.top_p
            } else {
                self.top_p
            },
            max_tokens: if self.max_tokens == 0 {
                defaults.max_tokens
            } else {
                self.max_tokens
            },
        }
    }
}

/// Function-calling tool definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tool {
    #[serde(rename = "type")]
    pub kind: String,
    pub function: ToolFunction,
}

impl Tool {
    pub fn function(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: serde_json::Value,
    ) -> Self {
        Self {
            kind: "function".to_string(),
            function: ToolFunction {
                name: name.into(),
                description: description.into(),
                parameters,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolFunction {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    #[serde(default)]
    pub id: String,
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub function: ToolCallFunction,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolCallFunction {
    #[serde(default)]
    pub name: String,
    /// JSON-encoded arguments
    #[serde(default)]
    pub arguments: String,
}

/// Collected result of a streamed completion
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ChatResponse {
    pub content: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    pub finish_reason: String,
}

// ============================================================================
// Message adapters
// ============================================================================

/// Rewrites the message list for model families with template quirks
pub trait MessageAdapter: Send + Sync {
    fn adapt(&self, model_name: &str, messages: Vec<ChatMessage>) -> Vec<ChatMessage>;
}

/// Sends messages unchanged
#[derive(Debug, Default)]
pub struct PassThrough;

impl MessageAdapter for PassThrough {
    fn adapt(&self, _model_name: &str, messages: Vec<ChatMessage>) -> Vec<ChatMessage> {
        messages
    }
}

/// Folds the system prompt into the first user turn for families whose chat
/// template has no system role
#[derive(Debug, Clone)]
pub struct SystemPromptEmbedding {
    families: Vec<String>,
}

impl SystemPromptEmbedding {
    pub fn new(families: Vec<String>) -> Self {
        Self {
            families: families.into_iter().map(|f| f.to_lowercase()).collect(),
        }
    }

    fn applies_to(&self, model_name: &str) -> bool {
        let name = model_name.to_lowercase();
        self.families.iter().any(|f| name.contains(f.as_str()))
    }
}

impl Default for SystemPromptEmbedding {
    fn default() -> Self {
        Self::new(vec!["gemma".to_string()])
    }
}

impl MessageAdapter for SystemPromptEmbedding {
    fn adapt(&self, model_name: &str, messages: Vec<ChatMessage>) -> Vec<ChatMessage> {
        if !self.applies_to(model_name) {
            return messages;
        }

        let (system, rest): (Vec<_>, Vec<_>) =
            messages.iter().cloned().partition(|m| m.role == "system");
        let Some(system_prompt) = system.last().map(ChatMessage::text) else {
            return messages;
        };
        if system_prompt.is_empty() {
            return messages;
        }

        let mut embedded = false;
        let mut result = Vec::with_capacity(rest.len() + 1);
        for message in rest {
            if message.role == "user" && !embedded {
                embedded = true;
                result.push(embed_into(&system_prompt, message));
            } else {
                result.push(message);
            }
        }

        if !embedded {
            result.insert(
                0,
                ChatMessage::user(format!(
                    "[SYSTEM INSTRUCTIONS]\n{}\n[END]",
                    system_prompt
                )),
            );
        }

        tracing::debug!(
            model = %model_name,
            prompt_chars = system_prompt.len(),
            "Embedded system prompt into first user message"
        );
        result
    }
}

fn embed_into(system_prompt: &str, message: ChatMessage) -> ChatMessage {
    let header = format!(
        "[SYSTEM INSTRUCTIONS - YOU MUST FOLLOW THESE]\n{}\n[END OF SYSTEM INSTRUCTIONS]\n\nUser message: ",
        system_prompt
    );
    let content = match message.content {
        MessageContent::Text(text) => MessageContent::Text(format!("{}{}", header, text)),
        MessageContent::Parts(mut parts) => {
            parts.insert(0, ContentPart::text(header));
            MessageContent::Parts(parts)
        }
    };
    ChatMessage {
        role: message.role,
        content,
    }
}

// ============================================================================
// SSE parsing
// ============================================================================

#[derive(Debug, Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: StreamDelta,
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<ToolCall>,
}

/// One decoded event line
#[derive(Debug, PartialEq)]
pub enum SseEvent {
    Delta {
        content: String,
        tool_calls: Vec<ToolCall>,
        finish_reason: Option<String>,
    },
    Done,
}

/// Decode a single SSE line; `None` for blank, comment or malformed lines
pub fn parse_sse_line(line: &str) -> Option<SseEvent> {
    let data = line.trim().strip_prefix("data: ")?;
    if data == "[DONE]" {
        return Some(SseEvent::Done);
    }

    let chunk: StreamChunk = serde_json::from_str(data).ok()?;
    let choice = chunk.choices.into_iter().next()?;
    Some(SseEvent::Delta {
        content: choice.delta.content.unwrap_or_default(),
        tool_calls: choice.delta.tool_calls,
        finish_reason: choice.finish_reason,
    })
}

/// Splits a byte stream into lines across chunk boundaries
#[derive(Debug, Default)]
struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(bytes);
        let mut lines = Vec::new();
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=pos).collect();
            lines.push(String::from_utf8_lossy(&line).into_owned());
        }
        lines
    }

    fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let rest = std::mem::take(&mut self.pending);
        Some(String::from_utf8_lossy(&rest).into_owned())
    }
}

// ============================================================================
// Client
// ============================================================================

/// Chat client bound to one llama-server endpoint
#[derive(Clone)]
pub struct ChatClient {
    http: reqwest::Client,
    base_url: String,
    model_name: String,
    adapter: Arc<dyn MessageAdapter>,
}

impl ChatClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Self {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_default();
        Self {
            http,
            base_url: base_url.into(),
            model_name: String::new(),
            adapter: Arc::new(PassThrough),
        }
    }

    /// Model name the adapter sees
    pub fn with_model_name(mut self, model_name: impl Into<String>) -> Self {
        self.model_name = model_name.into();
        self
    }

    pub fn with_adapter(mut self, adapter: Arc<dyn MessageAdapter>) -> Self {
        self.adapter = adapter;
        self
    }

    fn completions_url(&self) -> String {
        format!(
            "{}/v1/chat/completions",
            self.base_url.trim_end_matches('/')
        )
    }

    async fn post(&self, body: serde_json::Value) -> SupervisorResult<reqwest::Response> {
        let response = self
            .http
            .post(self.completions_url())
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SupervisorError::Upstream {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }

    /// Stream a completion, calling `on_chunk(content, done)` per delta
    pub async fn stream_chat<F>(
        &self,
        messages: Vec<ChatMessage>,
        params: SamplingParams,
        mut on_chunk: F,
    ) -> SupervisorResult<()>
    where
        F: FnMut(&str, bool) + Send,
    {
        let params = params.normalized();
        let messages = self.adapter.adapt(&self.model_name, messages);
        let body = json!({
            "messages": messages,
            "stream": true,
            "temperature": params.temperature,
            "top_p": params.top_p,
            "max_tokens": params.max_tokens,
        });

        let response = self.post(body).await?;
        read_events(response, |event| match event {
            SseEvent::Done => {
                on_chunk("", true);
                false
            }
            SseEvent::Delta {
                content,
                finish_reason,
                ..
            } => {
                let done = finish_reason.is_some();
                if !content.is_empty() || done {
                    on_chunk(&content, done);
                }
                true
            }
        })
        .await
    }

    /// Stream a completion with function calling, collecting the result
    pub async fn stream_chat_with_tools<F>(
        &self,
        messages: Vec<ChatMessage>,
        tools: &[Tool],
        mut on_chunk: F,
    ) -> SupervisorResult<ChatResponse>
    where
        F: FnMut(&str, bool) + Send,
    {
        let params = SamplingParams::default();
        let messages = self.adapter.adapt(&self.model_name, messages);
        let mut body = json!({
            "messages": messages,
            "stream": true,
            "temperature": params.temperature,
            "top_p": params.top_p,
            "max_tokens": params.max_tokens,
        });
        if !tools.is_empty() {
            body["tools"] = serde_json::to_value(tools)
                .map_err(|e| SupervisorError::InvalidResponse(e.to_string()))?;
            body["tool_choice"] = json!("auto");
        }

        let response = self.post(body).await?;
        let mut collected = ChatResponse::default();
        read_events(response, |event| match event {
            SseEvent::Done => {
                on_chunk("", true);
                false
            }
            SseEvent::Delta {
                content,
                tool_calls,
                finish_reason,
            } => {
                if !content.is_empty() {
                    collected.content.push_str(&content);
                    on_chunk(&content, false);
                }
                collected.tool_calls.extend(tool_calls);
                if let Some(reason) = finish_reason {
                    collected.finish_reason = reason;
                }
                true
            }
        })
        .await?;

        Ok(collected)
    }

    /// Single system+user exchange, returned trimmed
    pub async fn quick_chat(&self, system_prompt: &str, user_message: &str) -> SupervisorResult<String> {
        let messages = vec![
            ChatMessage::system(system_prompt),
            ChatMessage::user(user_message),
        ];

        let mut result = String::new();
        self.stream_chat(messages, SamplingParams::default(), |content, _| {
            result.push_str(content)
        })
        .await?;

        Ok(result.trim().to_string())
    }

    pub async fn quick_chat_with_timeout(
        &self,
        system_prompt: &str,
        user_message: &str,
        timeout: Duration,
    ) -> SupervisorResult<String> {
        tokio::time::timeout(timeout, self.quick_chat(system_prompt, user_message))
            .await
            .map_err(|_| SupervisorError::Timeout(timeout))?
    }

    /// Non-streaming completion, returning the first choice's text
    pub async fn complete(
        &self,
        messages: Vec<ChatMessage>,
        max_tokens: u32,
        timeout: Duration,
    ) -> SupervisorResult<String> {
        let body = json!({
            "messages": messages,
            "max_tokens": max_tokens,
            "stream": false,
        });

        let response = self
            .http
            .post(self.completions_url())
            .timeout(timeout)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SupervisorError::Upstream {
                status: status.as_u16(),
                body,
            });
        }

        let value: serde_json::Value = response.json().await?;
        value["choices"][0]["message"]["content"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| SupervisorError::InvalidResponse("no choices in completion".to_string()))
    }
}

/// Feed SSE events to `handle` until it returns false or the body ends
async fn read_events<H>(response: reqwest::Response, mut handle: H) -> SupervisorResult<()>
where
    H: FnMut(SseEvent) -> bool,
{
    let mut stream = response.bytes_stream();
    let mut buffer = LineBuffer::default();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        for line in buffer.push(&chunk) {
            if let Some(event) = parse_sse_line(&line)
                && !handle(event)
            {
                return Ok(());
            }
        }
    }

    if let Some(line) = buffer.finish()
        && let Some(event) = parse_sse_line(&line)
    {
        handle(event);
    }

    Ok(())
}
