//! Completion service
//!
//! Sends a conversation to an OpenAI-compatible chat completions endpoint and
//! returns the assistant text.

use crate::config::CompletionConfig;
use crate::error::CompletionError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

/// Result type for completion operations
type Result<T> = std::result::Result<T, CompletionError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// One message of a conversation
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

/// Anything that can turn a conversation into the next assistant message
#[async_trait]
pub trait CompletionService: Send + Sync {
    async fn complete(&self, messages: &[ChatMessage]) -> Result<String>;
}

/// HTTP client for chat completions
pub struct HttpCompletionService {
    config: CompletionConfig,
    api_key: Option<String>,
    client: reqwest::Client,
}

impl HttpCompletionService {
    pub fn new(config: CompletionConfig, api_key: Option<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout))
            .build()
            .map_err(|e| CompletionError::Unavailable(format!("failed to create HTTP client: {}", e)))?;

        Ok(Self {
            config,
            api_key,
            client,
        })
    }
}

#[async_trait]
impl CompletionService for HttpCompletionService {
    async fn complete(&self, messages: &[ChatMessage]) -> Result<String> {
        let api_key = self.api_key.as_deref().ok_or_else(|| {
            CompletionError::Unavailable(format!(
                "API key not found in {}",
                self.config.api_key_env
            ))
        })?;

        let request_body = serde_json::json!({
            "model": self.config.model,
            "messages": messages,
            "max_tokens": self.config.max_tokens,
            "temperature": self.config.temperature,
        });

        debug!("Sending completion request with {} messages", messages.len());

        let response = self
            .client
            .post(&self.config.endpoint)
            .header("Authorization", format!("Bearer {}", api_key))
            .header("Content-Type", "application/json")
            .json(&request_body)
            .send()
            .await
            .map_err(|e| CompletionError::Network(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(CompletionError::Api {
                status: status.as_u16(),
                message: error_text,
            });
        }

        let response_json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| CompletionError::Parse(e.to_string()))?;

        // OpenAI format
        let content = response_json["choices"][0]["message"]["content"]
            .as_str()
            .ok_or_else(|| CompletionError::Parse("No content in response".to_string()))?;

        Ok(content.to_string())
    }
}
