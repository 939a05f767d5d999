//! Chat-completion provider abstraction and its rig-core adapter.
//!
//! The proposer talks to `LlmProvider`; `RigAdapter` bridges any rig
//! `CompletionModel` (OpenAI, Anthropic) to it.

use async_trait::async_trait;
use rig::completion::{AssistantContent, CompletionModel, Message};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::ProposerError;

/// Role of a chat message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// One message in a chat completion request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// A completion request.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub messages: Vec<ChatMessage>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
}

impl CompletionRequest {
    pub fn new(messages: Vec<ChatMessage>) -> Self {
        Self {
            messages,
            temperature: None,
            max_tokens: None,
        }
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }
}

/// A completion response.
#[derive(Debug, Clone)]
pub struct CompletionResponse {
    pub content: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
}

/// Anything that can complete a chat.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    fn model_name(&self) -> &str;

    async fn complete(&self, request: CompletionRequest)
    -> Result<CompletionResponse, ProposerError>;
}

/// A request reshaped for rig: system text, prior turns, final user prompt.
#[derive(Debug, Clone, PartialEq)]
struct PromptParts {
    preamble: Option<String>,
    history: Vec<ChatMessage>,
    prompt: String,
}

/// System messages become the preamble; the last user message is the prompt.
fn split_messages(messages: &[ChatMessage]) -> Option<PromptParts> {
    let last_user = messages.iter().rposition(|m| m.role == Role::User)?;

    let system: Vec<&str> = messages
        .iter()
        .filter(|m| m.role == Role::System)
        .map(|m| m.content.as_str())
        .collect();
    let history = messages[..last_user]
        .iter()
        .filter(|m| m.role != Role::System)
        .cloned()
        .collect();

    Some(PromptParts {
        preamble: (!system.is_empty()).then(|| system.join("\n\n")),
        history,
        prompt: messages[last_user].content.clone(),
    })
}

fn to_rig_message(message: &ChatMessage) -> Message {
    match message.role {
        Role::Assistant => Message::assistant(message.content.clone()),
        _ => Message::user(message.content.clone()),
    }
}

/// Bridges a rig `CompletionModel` to `LlmProvider`.
pub struct RigAdapter<M> {
    model: M,
    model_name: String,
}

impl<M> RigAdapter<M> {
    pub fn new(model: M, model_name: &str) -> Self {
        Self {
            model,
            model_name: model_name.to_string(),
        }
    }

    fn request_failed(&self, reason: impl Into<String>) -> ProposerError {
        ProposerError::RequestFailed {
            provider: self.model_name.clone(),
            reason: reason.into(),
        }
    }
}

#[async_trait]
impl<M> LlmProvider for RigAdapter<M>
where
    M: CompletionModel + 'static,
{
    fn model_name(&self) -> &str {
        &self.model_name
    }

    async fn complete(
        &self,
        request: CompletionRequest,
    ) -> Result<CompletionResponse, ProposerError> {
        let parts = split_messages(&request.messages)
            .ok_or_else(|| self.request_failed("request has no user message"))?;

        let mut builder = self.model.completion_request(Message::user(parts.prompt));
        if let Some(preamble) = parts.preamble {
            builder = builder.preamble(preamble);
        }
        if !parts.history.is_empty() {
            builder = builder.messages(parts.history.iter().map(to_rig_message).collect());
        }
        if let Some(temperature) = request.temperature {
            builder = builder.temperature(f64::from(temperature));
        }
        if let Some(max_tokens) = request.max_tokens {
            builder = builder.max_tokens(u64::from(max_tokens));
        }

        debug!(model = %self.model_name, messages = request.messages.len(), "Sending completion request");
        let response = builder
            .send()
            .await
            .map_err(|e| self.request_failed(e.to_string()))?;

        let content: String = response
            .choice
            .iter()
            .filter_map(|c| match c {
                AssistantContent::Text(text) => Some(text.text.as_str()),
                _ => None,
            })
            .collect();

        Ok(CompletionResponse {
            content,
            input_tokens: response.usage.input_tokens,
            output_tokens: response.usage.output_tokens,
        })
    }
}
