//! Backend adapters for the supported providers.
//!
//! Every adapter exposes the same capability (send one message plus bounded
//! history, get reply text back) and fails only with [`BackendError`], so
//! the dispatcher can treat all upstreams uniformly while walking the
//! failover chain. Wire shapes are adapter-internal: OpenAI-compatible chat
//! completions with bearer auth (openai, deepseek), the Anthropic messages
//! API with `x-api-key`, Gemini `generateContent` with key-in-query, and
//! unauthenticated Ollama for local models.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};

use crate::errors::{BackendError, BackendFault};
use crate::memory::Turn;
use crate::providers::registry::ProviderProfile;

/// Uniform invocation capability implemented by the HTTP adapters and by
/// scripted test doubles.
#[async_trait]
pub trait ChatBackend: Send + Sync {
    async fn invoke(
        &self,
        profile: &ProviderProfile,
        message: &str,
        history: &[Turn],
        credential: Option<&str>,
        timeout: Duration,
    ) -> Result<String, BackendError>;
}

pub struct HttpBackends {
    client: Client,
}

impl HttpBackends {
    pub fn new() -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .user_agent("FederationCore/0.1")
            .build()
            .context("failed to construct HTTP client")?;
        Ok(Self { client })
    }

    async fn chat_openai_like(
        &self,
        profile: &ProviderProfile,
        message: &str,
        history: &[Turn],
        credential: Option<&str>,
        timeout: Duration,
        default_base: &str,
    ) -> Result<String, BackendError> {
        let provider = profile.provider.id.as_str();
        let secret = require_credential(provider, credential)?;
        let base_url = profile
            .provider
            .base_url
            .clone()
            .unwrap_or_else(|| default_base.to_string());
        let url = format!("{}/v1/chat/completions", base_url.trim_end_matches('/'));

        let payload = json!({
            "model": profile.model,
            "messages": build_messages(history, message),
            "temperature": profile.temperature,
            "max_tokens": profile.max_tokens,
        });

        let request = self.client.post(url).timeout(timeout).bearer_auth(secret);
        let body = self.post_json(provider, request, &payload).await?;
        reply_or_payload_error(provider, openai_reply(&body))
    }

    async fn chat_anthropic(
        &self,
        profile: &ProviderProfile,
        message: &str,
        history: &[Turn],
        credential: Option<&str>,
        timeout: Duration,
    ) -> Result<String, BackendError> {
        let provider = profile.provider.id.as_str();
        let secret = require_credential(provider, credential)?;
        let base_url = profile
            .provider
            .base_url
            .clone()
            .unwrap_or_else(|| "https://api.anthropic.com".to_string());
        let url = format!("{}/v1/messages", base_url.trim_end_matches('/'));

        let mut messages: Vec<Value> = history
            .iter()
            .filter(|turn| turn.role == "user" || turn.role == "assistant")
            .map(|turn| {
                json!({
                    "role": turn.role,
                    "content": [{"type": "text", "text": turn.content}],
                })
            })
            .collect();
        messages.push(json!({
            "role": "user",
            "content": [{"type": "text", "text": message}],
        }));

        let payload = json!({
            "model": profile.model,
            "max_tokens": profile.max_tokens,
            "messages": messages,
            "temperature": profile.temperature,
        });

        let request = self
            .client
            .post(url)
            .timeout(timeout)
            .header("x-api-key", secret)
            .header("anthropic-version", "2023-06-01");
        let body = self.post_json(provider, request, &payload).await?;
        reply_or_payload_error(provider, anthropic_reply(&body))
    }

    async fn chat_gemini(
        &self,
        profile: &ProviderProfile,
        message: &str,
        history: &[Turn],
        credential: Option<&str>,
        timeout: Duration,
    ) -> Result<String, BackendError> {
        let provider = profile.provider.id.as_str();
        let secret = require_credential(provider, credential)?;
        let base_url = profile
            .provider
            .base_url
            .clone()
            .unwrap_or_else(|| "https://generativelanguage.googleapis.com/v1beta".to_string());
        let url = format!(
            "{}/models/{}:generateContent",
            base_url.trim_end_matches('/'),
            profile.model
        );

        let payload = json!({
            "contents": [
                {
                    "role": "user",
                    "parts": [{"text": conversation_prompt(history, message)}]
                }
            ],
            "generationConfig": {
                "temperature": profile.temperature,
                "maxOutputTokens": profile.max_tokens,
            }
        });

        let request = self
            .client
            .post(url)
            .timeout(timeout)
            .query(&[("key", secret)]);
        let body = self.post_json(provider, request, &payload).await?;
        reply_or_payload_error(provider, gemini_reply(&body))
    }

    async fn chat_ollama(
        &self,
        profile: &ProviderProfile,
        message: &str,
        history: &[Turn],
        timeout: Duration,
    ) -> Result<String, BackendError> {
        let provider = profile.provider.id.as_str();
        let base_url = profile
            .provider
            .base_url
            .clone()
            .unwrap_or_else(|| "http://127.0.0.1:11434".to_string());
        let url = format!("{}/api/chat", base_url.trim_end_matches('/'));

        let payload = json!({
            "model": local_model_name(&profile.model),
            "messages": build_messages(history, message),
            "stream": false,
            "options": {
                "temperature": profile.temperature,
                "num_predict": profile.max_tokens,
            }
        });

        let request = self.client.post(url).timeout(timeout);
        let body = self.post_json(provider, request, &payload).await?;
        reply_or_payload_error(provider, ollama_reply(&body))
    }

    async fn post_json(
        &self,
        provider: &str,
        request: reqwest::RequestBuilder,
        payload: &Value,
    ) -> Result<Value, BackendError> {
        let response = request
            .json(payload)
            .send()
            .await
            .map_err(|err| transport_error(provider, err))?;
        let status = response.status();
        if !status.is_success() {
            return Err(BackendError::new(
                provider,
                BackendFault::Status(status.as_u16()),
                format!("upstream answered {status}"),
            ));
        }
        response
            .json::<Value>()
            .await
            .map_err(|err| transport_error(provider, err))
    }
}

#[async_trait]
impl ChatBackend for HttpBackends {
    async fn invoke(
        &self,
        profile: &ProviderProfile,
        message: &str,
        history: &[Turn],
        credential: Option<&str>,
        timeout: Duration,
    ) -> Result<String, BackendError> {
        match profile.provider.id.as_str() {
            "openai" => {
                self.chat_openai_like(profile, message, history, credential, timeout, "https://api.openai.com")
                    .await
            }
            "deepseek" => {
                self.chat_openai_like(profile, message, history, credential, timeout, "https://api.deepseek.com")
                    .await
            }
            "anthropic" => {
                self.chat_anthropic(profile, message, history, credential, timeout)
                    .await
            }
            "gemini" => {
                self.chat_gemini(profile, message, history, credential, timeout)
                    .await
            }
            "ollama" => self.chat_ollama(profile, message, history, timeout).await,
            other => Err(BackendError::new(
                other,
                BackendFault::Transport,
                "unsupported provider",
            )),
        }
    }
}

fn require_credential<'a>(
    provider: &str,
    credential: Option<&'a str>,
) -> Result<&'a str, BackendError> {
    credential.ok_or_else(|| {
        BackendError::new(provider, BackendFault::Transport, "API key not supplied")
    })
}

fn transport_error(provider: &str, err: reqwest::Error) -> BackendError {
    if err.is_timeout() {
        BackendError::new(provider, BackendFault::Timeout, "request timed out")
    } else {
        // strip the URL so query-string credentials never reach a log line
        BackendError::new(provider, BackendFault::Transport, err.without_url().to_string())
    }
}

fn reply_or_payload_error(
    provider: &str,
    reply: Option<String>,
) -> Result<String, BackendError> {
    reply.ok_or_else(|| {
        BackendError::new(
            provider,
            BackendFault::Payload,
            "upstream payload carried no reply text",
        )
    })
}

fn build_messages(history: &[Turn], message: &str) -> Vec<Value> {
    let mut messages: Vec<Value> = history
        .iter()
        .map(|turn| {
            let role = match turn.role.to_lowercase().as_str() {
                "system" => "system",
                "assistant" => "assistant",
                _ => "user",
            };
            json!({ "role": role, "content": turn.content })
        })
        .collect();
    messages.push(json!({ "role": "user", "content": message }));
    messages
}

fn conversation_prompt(history: &[Turn], message: &str) -> String {
    let mut sections: Vec<String> = history
        .iter()
        .map(|turn| format!("{}: {}", turn.role.to_uppercase(), turn.content.trim()))
        .collect();
    sections.push(format!("USER: {}", message.trim()));
    sections.join("\n\n")
}

/// Local model names may arrive with an `ollama-` routing prefix.
fn local_model_name(model: &str) -> &str {
    model.strip_prefix("ollama-").unwrap_or(model)
}

fn openai_reply(body: &Value) -> Option<String> {
    non_empty(
        body.get("choices")?
            .get(0)?
            .get("message")?
            .get("content")?
            .as_str()?,
    )
}

fn anthropic_reply(body: &Value) -> Option<String> {
    non_empty(body.get("content")?.get(0)?.get("text")?.as_str()?)
}

fn gemini_reply(body: &Value) -> Option<String> {
    non_empty(
        body.get("candidates")?
            .get(0)?
            .get("content")?
            .get("parts")?
            .get(0)?
            .get("text")?
            .as_str()?,
    )
}

fn ollama_reply(body: &Value) -> Option<String> {
    non_empty(body.get("message")?.get("content")?.as_str()?)
}

fn non_empty(text: &str) -> Option<String> {
    let trimmed = text.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}
