use crate::config::LlmSettings;
use crate::error::{EngineError, Result};
use async_trait::async_trait;
use tracing::{debug, warn};

/// Black-box text generation used by the generative synthesis tier.
///
/// Output is untrusted text. Nothing returned from here is executed without
/// passing the SQL validator.
#[async_trait]
pub trait TextGenerator: Send + Sync {
    async fn generate(&self, prompt: &str) -> Result<String>;
}

/// OpenAI-compatible chat-completions client
#[derive(Clone)]
pub struct LlmClient {
    api_key: String,
    base_url: String,
    model: String,
    http: reqwest::Client,
}

impl LlmClient {
    pub fn new(api_key: String, model: String, base_url: String) -> Self {
        Self {
            api_key,
            base_url,
            model,
            http: reqwest::Client::new(),
        }
    }

    pub fn from_settings(settings: &LlmSettings) -> Self {
        Self::new(
            settings.api_key.clone(),
            settings.model.clone(),
            settings.base_url.clone(),
        )
    }

    async fn call_llm(&self, prompt: &str) -> Result<String> {
        // Offline mode: no completion, the engine reports a synthesis failure
        if self.api_key == "dummy-api-key" {
            warn!("No LLM API key configured, generative tier disabled");
            return Ok(String::new());
        }

        let body = serde_json::json!({
            "model": self.model,
            "messages": [
                {"role": "system", "content": "You translate analytics questions into a single read-only SQL SELECT statement. Return only SQL, no other text."},
                {"role": "user", "content": prompt}
            ],
            "temperature": 0.0,
            "max_tokens": 800
        });

        let response = self
            .http
            .post(format!("{}/chat/completions", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| EngineError::Generation(format!("LLM API call failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(EngineError::Generation(format!(
                "LLM API returned status {}",
                status
            )));
        }

        let response_json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| EngineError::Generation(format!("Failed to parse LLM response: {}", e)))?;

        let content = response_json["choices"][0]["message"]["content"]
            .as_str()
            .ok_or_else(|| EngineError::Generation("No content in LLM response".to_string()))?;

        debug!("LLM returned {} chars", content.len());
        Ok(content.to_string())
    }
}

#[async_trait]
impl TextGenerator for LlmClient {
    async fn generate(&self, prompt: &str) -> Result<String> {
        self.call_llm(prompt).await
    }
}
