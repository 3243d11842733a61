use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

/// A single message in a conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self { role: Role::User, content: content.into() }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    System,
    User,
    Assistant,
}

/// LLM completion request.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub messages: Vec<ChatMessage>,
    pub max_tokens: u32,
    pub temperature: f32,
}

impl CompletionRequest {
    /// Single free-text prompt with the defaults the loop uses for every stage.
    pub fn prompt(text: impl Into<String>) -> Self {
        Self {
            messages: vec![ChatMessage::user(text)],
            max_tokens: 8192,
            temperature: 0.7,
        }
    }
}

/// LLM completion response.
#[derive(Debug, Clone)]
pub struct CompletionResponse {
    pub content: String,
    pub input_tokens: u32,
    pub output_tokens: u32,
}

/// Error type for LLM operations.
///
/// The variants map onto the backend's HTTP contract: 429 is a spent daily
/// quota, 503 a transient overload, everything else a hard failure.
#[derive(Debug, Clone, thiserror::Error)]
pub enum LlmError {
    #[error("quota exhausted (HTTP 429)")]
    QuotaExhausted,
    #[error("backend overloaded (HTTP 503)")]
    Overloaded,
    #[error("request failed: {0}")]
    RequestFailed(String),
    #[error("empty response")]
    EmptyResponse,
}

impl LlmError {
    /// Classify a non-success HTTP status.
    pub fn from_status(status: u16, body: &str) -> Self {
        match status {
            429 => Self::QuotaExhausted,
            503 => Self::Overloaded,
            _ => Self::RequestFailed(format!("{status}: {body}")),
        }
    }
}

/// Trait for generative-text backends.
pub trait LlmProvider: Send + Sync {
    fn name(&self) -> &str;

    fn complete(
        &self,
        request: CompletionRequest,
    ) -> Pin<Box<dyn Future<Output = Result<CompletionResponse, LlmError>> + Send + '_>>;
}

/// Provider that replays a fixed script of outcomes, one per call.
/// Once the script runs out every call fails with `RequestFailed`.
#[derive(Debug)]
pub struct ScriptedProvider {
    name: String,
    script: Mutex<VecDeque<Result<String, LlmError>>>,
    calls: AtomicUsize,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedProvider {
    pub fn new(name: impl Into<String>, script: Vec<Result<String, LlmError>>) -> Self {
        Self {
            name: name.into(),
            script: Mutex::new(script.into()),
            calls: AtomicUsize::new(0),
            prompts: Mutex::new(Vec::new()),
        }
    }

    /// A provider that answers every call with the same text.
    pub fn repeating(name: impl Into<String>, text: &str, times: usize) -> Self {
        Self::new(name, (0..times).map(|_| Ok(text.to_owned())).collect())
    }

    /// Number of `complete` calls seen so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Prompts received, in call order.
    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().map(|p| p.clone()).unwrap_or_default()
    }
}

impl LlmProvider for ScriptedProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn complete(
        &self,
        request: CompletionRequest,
    ) -> Pin<Box<dyn Future<Output = Result<CompletionResponse, LlmError>> + Send + '_>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut prompts) = self.prompts.lock() {
            let text: String = request.messages.iter().map(|m| m.content.as_str()).collect();
            prompts.push(text);
        }
        let next = self
            .script
            .lock()
            .ok()
            .and_then(|mut s| s.pop_front())
            .unwrap_or_else(|| Err(LlmError::RequestFailed("script exhausted".into())));
        Box::pin(async move {
            next.map(|content| CompletionResponse { content, input_tokens: 0, output_tokens: 0 })
        })
    }
}
