//! OpenAI-compatible chat completions backend (Mistral, Groq, OpenAI, vLLM).

use std::time::Duration;

use async_trait::async_trait;
use coordination::{Backend, BackendError};
use tracing::debug;

use super::{error_body, transport_error};
use crate::config::BackendConfig;

pub struct OpenAiCompatibleBackend {
    name: String,
    model: String,
    endpoint: String,
    api_key: String,
    max_tokens: u32,
    temperature: f32,
    timeout: Duration,
    client: reqwest::Client,
}

impl OpenAiCompatibleBackend {
    pub fn new(config: &BackendConfig, timeout: Duration) -> Result<Self, BackendError> {
        let api_key = config
            .api_key
            .clone()
            .ok_or_else(|| BackendError::NotConfigured(format!("{} has no API key", config.name)))?;
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| BackendError::Transport(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            name: config.name.clone(),
            model: config.model.clone(),
            endpoint: format!("{}/chat/completions", config.base_url.trim_end_matches('/')),
            api_key,
            max_tokens: config.max_tokens,
            temperature: config.temperature,
            timeout,
            client,
        })
    }
}

#[async_trait]
impl Backend for OpenAiCompatibleBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn model(&self) -> &str {
        &self.model
    }

    async fn call(
        &self,
        prompt: &str,
        system_prompt: Option<&str>,
    ) -> Result<String, BackendError> {
        let mut messages = Vec::with_capacity(2);
        if let Some(system) = system_prompt {
            messages.push(serde_json::json!({ "role": "system", "content": system }));
        }
        messages.push(serde_json::json!({ "role": "user", "content": prompt }));

        let request_body = serde_json::json!({
            "model": self.model,
            "messages": messages,
            "temperature": self.temperature,
            "max_tokens": self.max_tokens,
        });

        debug!(backend = %self.name, model = %self.model, "sending chat completion");
        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&request_body)
            .send()
            .await
            .map_err(|e| transport_error(e, self.timeout))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(BackendError::from_status(
                status.as_u16(),
                format!("{} API error ({}): {}", self.name, status, error_body(&body)),
            ));
        }

        let resp_json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| BackendError::InvalidResponse(e.to_string()))?;

        resp_json["choices"][0]["message"]["content"]
            .as_str()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .ok_or_else(|| {
                BackendError::InvalidResponse(format!(
                    "{} returned no choices[0].message.content",
                    self.name
                ))
            })
    }
}
