use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, warn};

use convoy_core::config::BackendConfig;

use crate::backend::{BackendError, CompletionBackend};

/// HTTP client for an OpenAI-style completions endpoint.
///
/// POSTs `{model, prompt}` to `{base_url}/v1/completions` and reads the
/// first choice's text. Connection failures surface as `Unavailable` so
/// callers can tell "backend down" apart from "backend rejected us".
pub struct HttpCompletionBackend {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    model: Option<String>,
}

impl HttpCompletionBackend {
    pub fn new(base_url: String, api_key: Option<String>, model: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url,
            api_key,
            model,
        }
    }

    pub fn from_config(config: &BackendConfig) -> Self {
        Self::new(
            config.base_url.clone(),
            config.api_key.clone(),
            config.model.clone(),
        )
    }
}

#[async_trait]
impl CompletionBackend for HttpCompletionBackend {
    fn name(&self) -> &str {
        "http"
    }

    async fn complete(&self, content: &str) -> Result<String, BackendError> {
        let body = build_request_body(content, self.model.as_deref());
        let url = format!("{}/v1/completions", self.base_url);

        debug!(url = %url, bytes = content.len(), "sending completion request");

        let mut builder = self
            .client
            .post(&url)
            .header("content-type", "application/json")
            .json(&body);
        if let Some(ref key) = self.api_key {
            builder = builder.header("authorization", format!("Bearer {key}"));
        }

        let resp = builder.send().await.map_err(|e| {
            // Connection-level failures surface as Unavailable, not Http
            if e.is_connect() || e.is_timeout() {
                BackendError::Unavailable(e.to_string())
            } else {
                BackendError::Http(e)
            }
        })?;

        let status = resp.status().as_u16();
        if !resp.status().is_success() {
            let text = resp.text().await.unwrap_or_default();
            warn!(status, body = %text, "completion API error");
            return Err(BackendError::Api {
                status,
                message: text,
            });
        }

        let api_resp: ApiResponse = resp
            .json()
            .await
            .map_err(|e| BackendError::Parse(e.to_string()))?;

        let text = api_resp
            .choices
            .into_iter()
            .next()
            .map(|c| c.text)
            .ok_or_else(|| BackendError::Parse("response contained no choices".to_string()))?;

        Ok(text)
    }
}

fn build_request_body(content: &str, model: Option<&str>) -> serde_json::Value {
    match model {
        Some(m) => serde_json::json!({ "model": m, "prompt": content }),
        None => serde_json::json!({ "prompt": content }),
    }
}

// Completion API response types (private; deserialization only)

#[derive(Deserialize)]
struct ApiResponse {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    text: String,
}
