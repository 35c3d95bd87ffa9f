//! OpenAI-compatible chat-completions backend, following the teacher's
//! `OpenAICompatibleProvider` wire format (`crates/tandem-providers`):
//! `POST {base_url}/chat/completions` with a single user message, bearer
//! auth when a credential is configured, and token usage read back from the
//! response's `usage` object.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::Client;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use crate::{Backend, BackendError, GenerateOptions, GenerateResult};

pub struct HttpBackend {
    id: String,
    base_url: String,
    model: String,
    credential: Option<String>,
    client: Client,
}

impl HttpBackend {
    pub fn new(id: impl Into<String>, base_url: impl Into<String>, model: impl Into<String>, credential: Option<String>) -> Self {
        let base_url = base_url.into();
        Self {
            id: id.into(),
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.into(),
            credential,
            client: Client::new(),
        }
    }
}

#[async_trait]
impl Backend for HttpBackend {
    fn id(&self) -> &str {
        &self.id
    }

    async fn generate(
        &self,
        prompt: &str,
        options: &GenerateOptions,
        cancel: &CancellationToken,
    ) -> Result<GenerateResult, BackendError> {
        if cancel.is_cancelled() {
            return Err(BackendError::Transient("cancelled before dispatch".to_string()));
        }

        let url = format!("{}/chat/completions", self.base_url);
        let mut request = self.client.post(url).json(&json!({
            "model": self.model,
            "messages": [{"role": "user", "content": prompt}],
            "max_tokens": options.max_tokens,
            "temperature": options.temperature,
            "stop": options.stop_sequences,
            "stream": false,
        }));
        if let Some(credential) = &self.credential {
            request = request.bearer_auth(credential);
        }

        let started = Instant::now();
        let send = request.send();
        let response = tokio::select! {
            result = send => result.map_err(|err| classify_transport_error(&err))?,
            _ = cancel.cancelled() => return Err(BackendError::Transient("cancelled in flight".to_string())),
        };

        let status = response.status();
        if status.as_u16() == 429 {
            let retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .map(Duration::from_secs);
            return Err(BackendError::RateLimited { retry_after });
        }
        if status.is_server_error() {
            return Err(BackendError::Transient(format!("server error {status}")));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(BackendError::Permanent(format!("{status}: {body}")));
        }

        let value: serde_json::Value = response
            .json()
            .await
            .map_err(|err| BackendError::Permanent(format!("invalid response body: {err}")))?;

        let text = value["choices"][0]["message"]["content"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| BackendError::Permanent("no completion content in response".to_string()))?;
        let in_tokens = value["usage"]["prompt_tokens"].as_u64().unwrap_or(0);
        let out_tokens = value["usage"]["completion_tokens"].as_u64().unwrap_or(0);

        Ok(GenerateResult {
            text,
            in_tokens,
            out_tokens,
            backend_id: self.id.clone(),
            latency: started.elapsed(),
        })
    }
}

fn classify_transport_error(err: &reqwest::Error) -> BackendError {
    if err.is_builder() {
        BackendError::Permanent(err.to_string())
    } else {
        BackendError::Transient(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_url_trailing_slash_is_trimmed() {
        let backend = HttpBackend::new("local", "http://127.0.0.1:11434/v1/", "llama3", None);
        assert_eq!(backend.base_url, "http://127.0.0.1:11434/v1");
    }
}
