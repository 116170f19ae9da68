//! Model gateway
//!
//! The loop never talks to a model directly. It sends a [`ModelRequest`] to
//! any service implementing [`ModelService`] and gets raw text back in a
//! [`ProviderResponse`]. Swapping the hosted model for a deterministic stub is
//! a matter of passing a different service to the builder.
//!
//! Implementations
//! - [`OpenAIProvider`]: hosted chat completions through `async-openai`
//! - [`FixedProvider`]: always answers with the same text
//! - [`ScriptedProvider`]: answers from a queue and records every request
//!
//! Failures propagate. Nothing in this module retries.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use async_openai::{
    config::OpenAIConfig,
    types::{
        ChatCompletionRequestAssistantMessageArgs, ChatCompletionRequestMessage,
        ChatCompletionRequestSystemMessageArgs, ChatCompletionRequestUserMessageArgs,
        CreateChatCompletionRequestArgs,
    },
    Client,
};
use serde::{Deserialize, Serialize};
use tower::{BoxError, Service};
use tracing::debug;

use crate::error::TriageError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// One role-tagged message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
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

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelRequest {
    pub messages: Vec<ChatMessage>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
}

/// Raw completion text plus token accounting.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProviderResponse {
    pub content: String,
    pub prompt_tokens: usize,
    pub completion_tokens: usize,
}

/// Anything that turns a [`ModelRequest`] into a [`ProviderResponse`].
pub trait ModelService: Service<ModelRequest, Response = ProviderResponse, Error = BoxError> {}
impl<T> ModelService for T where T: Service<ModelRequest, Response = ProviderResponse, Error = BoxError> {}

/// Hosted chat-completion adapter.
#[derive(Clone)]
pub struct OpenAIProvider {
    client: Arc<Client<OpenAIConfig>>,
    model: String,
}

impl OpenAIProvider {
    pub fn new(client: Arc<Client<OpenAIConfig>>, model: impl Into<String>) -> Self {
        Self {
            client,
            model: model.into(),
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }
}

fn to_openai_message(msg: &ChatMessage) -> Result<ChatCompletionRequestMessage, BoxError> {
    let converted: ChatCompletionRequestMessage = match msg.role {
        Role::System => ChatCompletionRequestSystemMessageArgs::default()
            .content(msg.content.as_str())
            .build()?
            .into(),
        Role::User => ChatCompletionRequestUserMessageArgs::default()
            .content(msg.content.as_str())
            .build()?
            .into(),
        Role::Assistant => ChatCompletionRequestAssistantMessageArgs::default()
            .content(msg.content.as_str())
            .build()?
            .into(),
    };
    Ok(converted)
}

impl Service<ModelRequest> for OpenAIProvider {
    type Response = ProviderResponse;
    type Error = BoxError;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(
        &mut self,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: ModelRequest) -> Self::Future {
        let client = self.client.clone();
        let model = self.model.clone();
        Box::pin(async move {
            let messages = req
                .messages
                .iter()
                .map(to_openai_message)
                .collect::<Result<Vec<_>, _>>()?;

            let mut builder = CreateChatCompletionRequestArgs::default();
            builder.model(&model).messages(messages);
            if let Some(t) = req.temperature {
                builder.temperature(t);
            }
            if let Some(mt) = req.max_tokens {
                builder.max_completion_tokens(mt);
            }
            let request = builder.build().map_err(TriageError::from)?;

            let response = client
                .chat()
                .create(request)
                .await
                .map_err(TriageError::from)?;
            let (prompt_tokens, completion_tokens) = response
                .usage
                .as_ref()
                .map(|u| (u.prompt_tokens as usize, u.completion_tokens as usize))
                .unwrap_or((0, 0));
            let choice = response.choices.into_iter().next().ok_or_else(|| {
                BoxError::from(TriageError::ModelBehavior {
                    message: "no choices in completion".to_string(),
                })
            })?;
            Ok(ProviderResponse {
                content: choice.message.content.unwrap_or_default(),
                prompt_tokens,
                completion_tokens,
            })
        })
    }
}

/// A provider that answers every request with the same text.
#[derive(Debug, Clone)]
pub struct FixedProvider {
    content: Arc<str>,
}

impl FixedProvider {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: Arc::from(content.into()),
        }
    }
}

impl Service<ModelRequest> for FixedProvider {
    type Response = ProviderResponse;
    type Error = BoxError;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(
        &mut self,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn call(&mut self, _req: ModelRequest) -> Self::Future {
        let content = self.content.to_string();
        Box::pin(async move {
            Ok(ProviderResponse {
                content,
                prompt_tokens: 0,
                completion_tokens: 0,
            })
        })
    }
}

/// A provider that replays a script of responses in order.
///
/// Clones share the same script and request log, so a test can keep one
/// handle and hand another to the builder.
#[derive(Debug, Clone, Default)]
pub struct ScriptedProvider {
    script: Arc<Mutex<VecDeque<ProviderResponse>>>,
    requests: Arc<Mutex<Vec<ModelRequest>>>,
}

impl ScriptedProvider {
    pub fn new<I, S>(replies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::from_responses(replies.into_iter().map(|r| ProviderResponse {
            content: r.into(),
            prompt_tokens: 0,
            completion_tokens: 0,
        }))
    }

    pub fn from_responses(responses: impl IntoIterator<Item = ProviderResponse>) -> Self {
        Self {
            script: Arc::new(Mutex::new(responses.into_iter().collect())),
            requests: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Every request received so far, oldest first.
    pub fn requests(&self) -> Vec<ModelRequest> {
        self.requests
            .lock()
            .map(|r| r.clone())
            .unwrap_or_default()
    }

    pub fn remaining(&self) -> usize {
        self.script.lock().map(|s| s.len()).unwrap_or(0)
    }
}

impl Service<ModelRequest> for ScriptedProvider {
    type Response = ProviderResponse;
    type Error = BoxError;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(
        &mut self,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: ModelRequest) -> Self::Future {
        let next = match (self.script.lock(), self.requests.lock()) {
            (Ok(mut script), Ok(mut requests)) => {
                requests.push(req);
                script.pop_front()
            }
            _ => None,
        };
        debug!(exhausted = next.is_none(), "scripted provider call");
        Box::pin(async move {
            next.ok_or_else(|| {
                BoxError::from(TriageError::ModelBehavior {
                    message: "scripted provider exhausted".to_string(),
                })
            })
        })
    }
}
