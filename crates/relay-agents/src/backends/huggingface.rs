//! HuggingFace Inference API backend.

use std::time::Duration;

use async_trait::async_trait;
use coordination::{Backend, BackendError};
use tracing::debug;

use super::{error_body, transport_error};
use crate::config::BackendConfig;

pub struct HuggingFaceBackend {
    name: String,
    model: String,
    endpoint: String,
    api_key: String,
    max_tokens: u32,
    temperature: f32,
    timeout: Duration,
    client: reqwest::Client,
}

impl HuggingFaceBackend {
    pub fn new(config: &BackendConfig, timeout: Duration) -> Result<Self, BackendError> {
        let api_key = config
            .api_key
            .clone()
            .ok_or_else(|| {
                BackendError::NotConfigured(format!("{} has no API token", config.name))
            })?;
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| BackendError::Transport(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            name: config.name.clone(),
            model: config.model.clone(),
            endpoint: format!(
                "{}/models/{}",
                config.base_url.trim_end_matches('/'),
                config.model
            ),
            api_key,
            max_tokens: config.max_tokens,
            temperature: config.temperature,
            timeout,
            client,
        })
    }
}

/// Text-generation models take a single flat prompt.
fn format_inputs(prompt: &str, system_prompt: Option<&str>) -> String {
    match system_prompt {
        Some(system) => format!("{system}\n\nUser: {prompt}\nAssistant:"),
        None => format!("User: {prompt}\nAssistant:"),
    }
}

#[async_trait]
impl Backend for HuggingFaceBackend {
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
        let request_body = serde_json::json!({
            "inputs": format_inputs(prompt, system_prompt),
            "parameters": {
                "max_new_tokens": self.max_tokens,
                "temperature": self.temperature,
                "return_full_text": false,
            }
        });

        debug!(backend = %self.name, model = %self.model, "sending inference request");
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

        // Either `[{"generated_text": ...}]` or `{"generated_text": ...}`.
        let text = resp_json[0]["generated_text"]
            .as_str()
            .or_else(|| resp_json["generated_text"].as_str());

        text.map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .ok_or_else(|| {
                BackendError::InvalidResponse(format!("{} returned no generated_text", self.name))
            })
    }
}
