use std::{collections::VecDeque, fmt, pin::Pin, sync::Arc};

use async_openai::{
    config::OpenAIConfig,
    types::{
        ChatCompletionRequestAssistantMessageArgs, ChatCompletionRequestMessage,
        ChatCompletionRequestSystemMessage, ChatCompletionRequestUserMessage,
        CreateChatCompletionRequest, CreateChatCompletionRequestArgs,
    },
    Client,
};
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::{Mutex, RwLock};

use crate::error::AppError;

pub type TokenStream = Pin<Box<dyn Stream<Item = Result<String, AppError>> + Send>>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ChatRole {
    System,
    Human,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::System,
            content: content.into(),
        }
    }

    pub fn human(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Human,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: content.into(),
        }
    }
}

impl fmt::Display for ChatRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChatRole::System => write!(f, "System"),
            ChatRole::Human => write!(f, "Human"),
            ChatRole::Assistant => write!(f, "Assistant"),
        }
    }
}

impl fmt::Display for ChatMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.role, self.content)
    }
}

// helper function to format a vector of messages
pub fn format_history(history: &[ChatMessage]) -> String {
    history
        .iter()
        .map(|msg| format!("{msg}"))
        .collect::<Vec<String>>()
        .join("\n")
}

/// Generation parameters applied to the next completion call.
#[derive(Debug, Clone)]
pub struct ChatSettings {
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
}

/// Chat-completion client with swappable generation settings.
///
/// Settings changes never touch an in-flight call; every call snapshots the
/// settings when it builds its request.
pub struct LlmClient {
    backend: LlmBackend,
    settings: RwLock<ChatSettings>,
    available_models: Vec<String>,
}

enum LlmBackend {
    OpenAI {
        client: Arc<Client<OpenAIConfig>>,
    },
    /// Deterministic backend for tests, mirrors the hashed embedding backend.
    Canned {
        responses: Mutex<VecDeque<String>>,
        fallback: String,
    },
}

impl LlmClient {
    pub fn new_openai(
        client: Arc<Client<OpenAIConfig>>,
        settings: ChatSettings,
        available_models: Vec<String>,
    ) -> Self {
        Self {
            backend: LlmBackend::OpenAI { client },
            settings: RwLock::new(settings),
            available_models,
        }
    }

    pub fn new_canned(fallback: impl Into<String>) -> Self {
        let settings = ChatSettings {
            model: "canned".to_string(),
            temperature: 0.0,
            max_tokens: 512,
        };
        Self {
            backend: LlmBackend::Canned {
                responses: Mutex::new(VecDeque::new()),
                fallback: fallback.into(),
            },
            settings: RwLock::new(settings),
            available_models: vec!["canned".to_string()],
        }
    }

    /// Queues a response for the canned backend; no-op for real backends.
    pub fn push_canned_response(&self, response: impl Into<String>) {
        if let LlmBackend::Canned { responses, .. } = &self.backend {
            if let Ok(mut queue) = responses.lock() {
                queue.push_back(response.into());
            }
        }
    }

    pub fn settings(&self) -> ChatSettings {
        match self.settings.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn available_models(&self) -> &[String] {
        &self.available_models
    }

    pub fn switch_model(&self, model: &str) -> Result<(), AppError> {
        if !self.available_models.iter().any(|m| m == model) {
            return Err(AppError::Validation(format!(
                "unknown model '{model}', expected one of: {}",
                self.available_models.join(", ")
            )));
        }
        if let Ok(mut guard) = self.settings.write() {
            guard.model = model.to_string();
        }
        Ok(())
    }

    pub fn update_parameters(&self, temperature: Option<f32>, max_tokens: Option<u32>) {
        if let Ok(mut guard) = self.settings.write() {
            if let Some(temperature) = temperature {
                guard.temperature = temperature;
            }
            if let Some(max_tokens) = max_tokens {
                guard.max_tokens = max_tokens;
            }
        }
    }

    pub async fn complete(&self, messages: &[ChatMessage]) -> Result<String, AppError> {
        match &self.backend {
            LlmBackend::Canned {
                responses,
                fallback,
            } => {
                let next = responses
                    .lock()
                    .ok()
                    .and_then(|mut queue| queue.pop_front());
                Ok(next.unwrap_or_else(|| fallback.clone()))
            }
            LlmBackend::OpenAI { client } => {
                let request = self.build_request(messages, false)?;
                let response = client.chat().create(request).await?;
                response
                    .choices
                    .first()
                    .and_then(|choice| choice.message.content.clone())
                    .ok_or_else(|| {
                        AppError::LLMParsing("No content found in LLM response".into())
                    })
            }
        }
    }

    pub async fn complete_stream(&self, messages: &[ChatMessage]) -> Result<TokenStream, AppError> {
        match &self.backend {
            LlmBackend::Canned { .. } => {
                let full = self.complete(messages).await?;
                let tokens: Vec<Result<String, AppError>> = full
                    .split_inclusive(char::is_whitespace)
                    .map(|piece| Ok(piece.to_owned()))
                    .collect();
                Ok(Box::pin(futures::stream::iter(tokens)))
            }
            LlmBackend::OpenAI { client } => {
                let request = self.build_request(messages, true)?;
                let stream = client.chat().create_stream(request).await?;
                let mapped = stream.filter_map(|item| async move {
                    match item {
                        Ok(response) => response
                            .choices
                            .first()
                            .and_then(|choice| choice.delta.content.clone())
                            .filter(|token| !token.is_empty())
                            .map(Ok),
                        Err(e) => Some(Err(AppError::from(e))),
                    }
                });
                Ok(Box::pin(mapped))
            }
        }
    }

    fn build_request(
        &self,
        messages: &[ChatMessage],
        stream: bool,
    ) -> Result<CreateChatCompletionRequest, AppError> {
        let settings = self.settings();

        let mut request_messages: Vec<ChatCompletionRequestMessage> =
            Vec::with_capacity(messages.len());
        for message in messages {
            let converted = match message.role {
                ChatRole::System => {
                    ChatCompletionRequestSystemMessage::from(message.content.clone()).into()
                }
                ChatRole::Human => {
                    ChatCompletionRequestUserMessage::from(message.content.clone()).into()
                }
                ChatRole::Assistant => ChatCompletionRequestAssistantMessageArgs::default()
                    .content(message.content.clone())
                    .build()?
                    .into(),
            };
            request_messages.push(converted);
        }

        CreateChatCompletionRequestArgs::default()
            .model(&settings.model)
            .temperature(settings.temperature)
            .max_tokens(settings.max_tokens)
            .messages(request_messages)
            .stream(stream)
            .build()
            .map_err(AppError::from)
    }
}
