use crate::error::{GenerationError, RagError};
use crate::models::ChatMessage;
use crate::traits::Generator;
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Serialize;
use serde_json::Value;
use tracing::warn;

/// Generator backed by an OpenAI-compatible `/chat/completions` endpoint.
pub struct ChatCompletionsGenerator {
    client: Client,
    endpoint: url::Url,
    model: String,
    api_key: Option<String>,
}

#[derive(Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    temperature: f32,
    messages: Vec<WireMessage<'a>>,
    stream: bool,
}

#[derive(Serialize)]
struct WireMessage<'a> {
    role: &'a str,
    content: &'a str,
}

impl ChatCompletionsGenerator {
    pub fn new(
        base_url: &str,
        model: impl Into<String>,
        api_key: Option<String>,
    ) -> Result<Self, RagError> {
        let endpoint = url::Url::parse(&format!(
            "{}/chat/completions",
            base_url.trim_end_matches('/')
        ))?;
        Ok(Self {
            client: Client::new(),
            endpoint,
            model: model.into(),
            api_key: api_key.filter(|key| !key.trim().is_empty()),
        })
    }

    pub fn is_configured(&self) -> bool {
        self.api_key.is_some()
    }
}

#[async_trait]
impl Generator for ChatCompletionsGenerator {
    async fn generate(
        &self,
        messages: &[ChatMessage],
        temperature: f32,
    ) -> Result<String, GenerationError> {
        let Some(api_key) = &self.api_key else {
            return Err(GenerationError::NotConfigured);
        };

        let body = ChatCompletionRequest {
            model: &self.model,
            temperature,
            messages: messages
                .iter()
                .map(|message| WireMessage {
                    role: message.role.as_str(),
                    content: &message.content,
                })
                .collect(),
            stream: false,
        };

        let response = self
            .client
            .post(self.endpoint.clone())
            .bearer_auth(api_key.trim())
            .json(&body)
            .send()
            .await
            .map_err(|error| GenerationError::Unknown(error.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            warn!(status = %status, "generation request failed");
            return Err(classify_status(status, &text));
        }

        let payload: Value = response
            .json()
            .await
            .map_err(|error| GenerationError::Unknown(error.to_string()))?;
        extract_content(&payload)
    }
}

pub fn classify_status(status: StatusCode, body: &str) -> GenerationError {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => GenerationError::Unauthorized,
        StatusCode::PAYMENT_REQUIRED | StatusCode::TOO_MANY_REQUESTS => {
            GenerationError::QuotaExceeded
        }
        _ => GenerationError::Unknown(format!("{status}: {body}")),
    }
}

fn extract_content(payload: &Value) -> Result<String, GenerationError> {
    payload
        .pointer("/choices/0/message/content")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| GenerationError::Unknown("response has no message content".to_string()))
}
