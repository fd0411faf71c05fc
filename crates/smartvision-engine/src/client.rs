use std::sync::OnceLock;

use anyhow::Context;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use reqwest::blocking::{Client as HttpClient, Response as HttpResponse};
use reqwest::header::CONTENT_TYPE;
use serde_json::{json, Value};
use smartvision_contracts::FatalError;
use thiserror::Error;

use crate::config::EngineConfig;
use crate::credentials::ApiKeySource;

/// What one description call sends: the image, the instruction and optional caption context.
#[derive(Debug, Clone, Copy)]
pub struct DescriptionRequest<'a> {
    pub image_bytes: &'a [u8],
    pub prompt: &'a str,
    pub caption: Option<&'a str>,
}

impl DescriptionRequest<'_> {
    pub fn instruction(&self) -> String {
        compose_instruction(self.prompt, self.caption)
    }

    pub fn mime_type(&self) -> &'static str {
        image::guess_format(self.image_bytes)
            .map(|format| format.to_mime_type())
            .unwrap_or("image/jpeg")
    }
}

pub fn compose_instruction(prompt: &str, caption: Option<&str>) -> String {
    match caption.map(str::trim).filter(|caption| !caption.is_empty()) {
        Some(caption) => format!(
            "{}. Use the following context to enhance your response: {caption}",
            prompt.trim()
        ),
        None => prompt.trim().to_string(),
    }
}

#[derive(Debug, Error)]
pub enum ClientError {
    /// Every later call would fail the same way.
    #[error(transparent)]
    Fatal(#[from] FatalError),
    /// The service answered, but not with something usable for this item.
    #[error("{0}")]
    Service(String),
}

/// Boundary to the external vision model.
pub trait DescriptionClient: Send + Sync {
    fn name(&self) -> &str;

    /// Checked once before the first item; a failure aborts the batch.
    fn ensure_ready(&self) -> Result<(), FatalError> {
        Ok(())
    }

    fn describe(&self, request: &DescriptionRequest<'_>) -> Result<Value, ClientError>;
}

/// Chat-completions client with inline base64 image input.
pub struct OpenAiVisionClient {
    api_base: String,
    model: String,
    max_tokens: u64,
    http: HttpClient,
    keys: ApiKeySource,
    api_key: OnceLock<String>,
}

impl OpenAiVisionClient {
    pub fn new(config: &EngineConfig, keys: ApiKeySource) -> anyhow::Result<Self> {
        let http = HttpClient::builder()
            .timeout(config.request_timeout)
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            api_base: config.api_base.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            max_tokens: config.max_tokens,
            http,
            keys,
            api_key: OnceLock::new(),
        })
    }

    fn api_key(&self) -> Result<&str, FatalError> {
        if let Some(key) = self.api_key.get() {
            return Ok(key.as_str());
        }
        let key = self.keys.resolve()?;
        Ok(self.api_key.get_or_init(|| key).as_str())
    }

    pub fn build_payload(&self, request: &DescriptionRequest<'_>) -> Value {
        let data_url = format!(
            "data:{};base64,{}",
            request.mime_type(),
            BASE64.encode(request.image_bytes)
        );
        json!({
            "model": self.model,
            "messages": [{
                "role": "user",
                "content": [
                    {"type": "text", "text": request.instruction()},
                    {"type": "image_url", "image_url": {"url": data_url}},
                ],
            }],
            "max_tokens": self.max_tokens,
        })
    }
}

impl DescriptionClient for OpenAiVisionClient {
    fn name(&self) -> &str {
        "openai"
    }

    fn ensure_ready(&self) -> Result<(), FatalError> {
        self.api_key().map(|_| ())
    }

    fn describe(&self, request: &DescriptionRequest<'_>) -> Result<Value, ClientError> {
        let api_key = self.api_key()?;
        let endpoint = format!("{}/chat/completions", self.api_base);
        let response = self
            .http
            .post(&endpoint)
            .bearer_auth(api_key)
            .header(CONTENT_TYPE, "application/json")
            .json(&self.build_payload(request))
            .send()
            .map_err(|err| classify_transport_error(&endpoint, err))?;
        response_json_or_error("OpenAI", response)
    }
}

fn classify_transport_error(endpoint: &str, err: reqwest::Error) -> ClientError {
    if err.is_connect() || err.is_builder() {
        return ClientError::Fatal(FatalError::ServiceUnreachable {
            reason: format!("{endpoint}: {}", error_chain_text(&err, 512)),
        });
    }
    ClientError::Service(format!(
        "OpenAI request failed ({endpoint}): {}",
        error_chain_text(&err, 512)
    ))
}

fn response_json_or_error(provider: &str, response: HttpResponse) -> Result<Value, ClientError> {
    let status = response.status();
    let code = status.as_u16();
    let body = response
        .text()
        .map_err(|err| ClientError::Service(format!("{provider} response body read failed: {err}")))?;
    if !status.is_success() {
        return Err(ClientError::Service(format!(
            "{provider} request failed ({code}): {}",
            truncate_text(&body, 512)
        )));
    }
    serde_json::from_str(&body)
        .map_err(|err| ClientError::Service(format!("{provider} returned invalid JSON payload: {err}")))
}

fn error_chain_text(err: &(dyn std::error::Error + 'static), max_chars: usize) -> String {
    let mut parts: Vec<String> = Vec::new();
    let mut cause: Option<&(dyn std::error::Error + 'static)> = Some(err);
    while let Some(current) = cause {
        let text = current.to_string();
        let trimmed = text.trim();
        if !trimmed.is_empty() && parts.last().map(|last| last != trimmed).unwrap_or(true) {
            parts.push(trimmed.to_string());
        }
        cause = current.source();
    }
    truncate_text(&parts.join(" | caused by: "), max_chars)
}

fn truncate_text(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    value.chars().take(max_chars).collect::<String>() + "…"
}
