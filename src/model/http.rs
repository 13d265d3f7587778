//! OpenAI-compatible chat completions backend.
use super::{BackendError, BackendErrorKind, ModelBackend, ModelRequest};
use crate::util::preview;
use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::env;

/// Provider settings injected from config; the key itself never lives in config.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HttpBackendConfig {
    /// Full URL of the chat completions endpoint.
    pub endpoint: String,
    pub model: String,
    /// Name of the environment variable holding the bearer token.
    #[serde(default)]
    pub api_key_env: Option<String>,
    #[serde(default)]
    pub temperature: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct HttpBackend {
    config: HttpBackendConfig,
    api_key: Option<String>,
    label: String,
}

impl HttpBackend {
    pub fn from_config(config: &HttpBackendConfig) -> Result<Self> {
        let api_key = match config.api_key_env.as_deref() {
            Some(var) => Some(
                env::var(var)
                    .map_err(|_| anyhow!("environment variable {var} (api_key_env) is not set"))?,
            ),
            None => None,
        };
        Ok(Self {
            config: config.clone(),
            api_key,
            label: format!("http:{}", config.model),
        })
    }

    fn body(&self, prompt: &str) -> Value {
        let mut body = json!({
            "model": self.config.model,
            "messages": [{"role": "user", "content": prompt}],
            "response_format": {"type": "json_object"},
        });
        if let Some(temperature) = self.config.temperature {
            body["temperature"] = json!(temperature);
        }
        body
    }
}

impl ModelBackend for HttpBackend {
    fn name(&self) -> &str {
        &self.label
    }

    fn complete(&self, request: &ModelRequest<'_>) -> Result<String, BackendError> {
        let agent: ureq::Agent = ureq::Agent::config_builder()
            .timeout_global(Some(request.timeout))
            .http_status_as_error(false)
            .build()
            .into();

        let mut call = agent
            .post(&self.config.endpoint)
            .header("Content-Type", "application/json");
        if let Some(key) = &self.api_key {
            call = call.header("Authorization", &format!("Bearer {key}"));
        }
        let mut response = call
            .send_json(self.body(request.prompt))
            .map_err(transport_error)?;
        let status = response.status().as_u16();
        let text = response
            .body_mut()
            .read_to_string()
            .map_err(transport_error)?;

        if !(200..300).contains(&status) {
            return Err(BackendError::new(
                classify_status(status, &text),
                format!("HTTP {status}: {}", preview(text.trim(), 400)),
            ));
        }
        extract_content(&text)
    }
}

fn transport_error(err: ureq::Error) -> BackendError {
    let kind = match &err {
        ureq::Error::Timeout(_) => BackendErrorKind::Timeout,
        ureq::Error::StatusCode(code) => classify_status(*code, ""),
        ureq::Error::Io(_) | ureq::Error::ConnectionFailed | ureq::Error::HostNotFound => {
            BackendErrorKind::ServerError
        }
        _ => BackendErrorKind::MalformedRequest,
    };
    BackendError::new(kind, format!("HTTP transport: {err}"))
}

fn classify_status(status: u16, body: &str) -> BackendErrorKind {
    match status {
        429 => BackendErrorKind::RateLimited,
        408 | 504 => BackendErrorKind::Timeout,
        500..=599 => BackendErrorKind::ServerError,
        401 | 403 => BackendErrorKind::Auth,
        400 if mentions_content_policy(body) => BackendErrorKind::ContentPolicy,
        _ => BackendErrorKind::MalformedRequest,
    }
}

fn mentions_content_policy(body: &str) -> bool {
    let lower = body.to_ascii_lowercase();
    ["content_policy", "content_filter", "content policy", "safety"]
        .iter()
        .any(|marker| lower.contains(marker))
}

fn extract_content(text: &str) -> Result<String, BackendError> {
    let value: Value = serde_json::from_str(text).map_err(|err| {
        BackendError::new(
            BackendErrorKind::ServerError,
            format!("decode completion body: {err}"),
        )
    })?;
    let choice = &value["choices"][0];
    if choice["finish_reason"].as_str() == Some("content_filter") {
        return Err(BackendError::new(
            BackendErrorKind::ContentPolicy,
            "completion stopped by content filter",
        ));
    }
    match choice["message"]["content"].as_str() {
        Some(content) if !content.trim().is_empty() => Ok(content.to_string()),
        _ => Err(BackendError::new(
            BackendErrorKind::EmptyOutput,
            "completion has no message content",
        )),
    }
}
