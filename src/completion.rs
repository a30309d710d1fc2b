use async_trait::async_trait;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::debug;

use crate::{
    config::AppConfig,
    error::{AppError, Result},
};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PromptMessage {
    pub role: &'static str,
    pub content: String,
}

impl PromptMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system",
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user",
            content: content.into(),
        }
    }

    pub fn new(role: &'static str, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

/// Black-box text generation. `Ok(None)` means the backend answered with no content.
#[async_trait]
pub trait CompletionService: Send + Sync {
    async fn generate(&self, messages: &[PromptMessage]) -> Result<Option<String>>;
}

pub struct OpenAiCompletion {
    client: reqwest::Client,
    api_key: String,
    model: String,
    base_url: String,
    temperature: f32,
}

impl OpenAiCompletion {
    pub fn new(config: &AppConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.completion_timeout)
            .build()
            .map_err(|err| AppError::config(format!("failed to build http client: {err}")))?;
        Ok(Self {
            client,
            api_key: config.openai_api_key.clone(),
            model: config.openai_model.clone(),
            base_url: config.openai_base_url.clone(),
            temperature: config.openai_temperature,
        })
    }
}

#[async_trait]
impl CompletionService for OpenAiCompletion {
    async fn generate(&self, messages: &[PromptMessage]) -> Result<Option<String>> {
        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&json!({
                "model": self.model,
                "messages": messages,
                "temperature": self.temperature,
            }))
            .send()
            .await
            .map_err(|err| AppError::upstream(format!("openai request failed: {err}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(AppError::upstream(format!("openai returned {status}: {body}")));
        }

        let payload = response
            .json::<Value>()
            .await
            .map_err(|err| AppError::upstream(format!("openai parse failed: {err}")))?;
        let text = payload
            .get("choices")
            .and_then(Value::as_array)
            .and_then(|choices| choices.first())
            .and_then(|choice| choice.get("message"))
            .and_then(|msg| msg.get("content"))
            .and_then(Value::as_str)
            .map(str::trim)
            .unwrap_or("");

        if text.is_empty() {
            debug!(model = %self.model, "completion returned empty content");
            return Ok(None);
        }
        Ok(Some(text.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(base_url: &str) -> OpenAiCompletion {
        let config = AppConfig::from_lookup(|key| match key {
            "OPENAI_API_KEY" => Some("sk-test".to_string()),
            "OPENAI_BASE_URL" => Some(base_url.to_string()),
            "OPENAI_MODEL" => Some("gpt-test".to_string()),
            _ => None,
        })
        .unwrap();
        OpenAiCompletion::new(&config).unwrap()
    }

    #[tokio::test]
    async fn returns_first_choice_content() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .and(header("authorization", "Bearer sk-test"))
            .and(body_partial_json(json!({
                "model": "gpt-test",
                "messages": [{"role": "user", "content": "Do you have size M?"}]
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "choices": [{"message": {"role": "assistant", "content": "  Yes, size M is in stock. "}}]
            })))
            .mount(&server)
            .await;

        let reply = client(&server.uri())
            .generate(&[PromptMessage::user("Do you have size M?")])
            .await
            .unwrap();
        assert_eq!(reply.as_deref(), Some("Yes, size M is in stock."));
    }

    #[tokio::test]
    async fn empty_content_is_none() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "choices": [{"message": {"role": "assistant", "content": null}}]
            })))
            .mount(&server)
            .await;

        let reply = client(&server.uri())
            .generate(&[PromptMessage::user("hi")])
            .await
            .unwrap();
        assert!(reply.is_none());
    }

    #[tokio::test]
    async fn non_success_status_is_an_upstream_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503).set_body_string("overloaded"))
            .mount(&server)
            .await;

        let err = client(&server.uri())
            .generate(&[PromptMessage::user("hi")])
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Upstream { .. }));
        assert!(err.to_string().contains("503"));
    }

    #[tokio::test]
    async fn slow_backend_hits_the_request_timeout() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_delay(Duration::from_secs(3))
                    .set_body_json(json!({"choices": []})),
            )
            .mount(&server)
            .await;

        let config = AppConfig::from_lookup(|key| match key {
            "OPENAI_API_KEY" => Some("sk-test".to_string()),
            "OPENAI_BASE_URL" => Some(server.uri()),
            "COMPLETION_TIMEOUT_SECS" => Some("1".to_string()),
            _ => None,
        })
        .unwrap();
        let err = OpenAiCompletion::new(&config)
            .unwrap()
            .generate(&[PromptMessage::user("hi")])
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Upstream { .. }));
    }
}
