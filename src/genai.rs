use crate::config::Config;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use base64::Engine;
use log::warn;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use std::time::Duration;

/// The two capabilities the pipeline consumes from the generative service.
/// Retry and backoff for transient failures live behind this boundary;
/// callers only ever see a success value or a terminal error.
#[async_trait]
pub trait GenAiClient: Send + Sync + Debug {
    async fn generate_text(&self, system: &str, user: &str) -> Result<String>;

    /// Reference images are sent in order ahead of the prompt and bias the
    /// generation towards their content and style.
    async fn generate_image(
        &self,
        prompt: &str,
        reference_images: &[Vec<u8>],
        aspect_ratio: &str,
    ) -> Result<Vec<u8>>;
}

pub fn create_client(config: &Config) -> Result<std::sync::Arc<dyn GenAiClient>> {
    Ok(std::sync::Arc::new(GeminiClient::new(config)))
}

/// Bounded retry: `max_attempts` tries, base delay doubling per attempt with
/// random jitter on top.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: usize,
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub fn delay_for(&self, attempt: usize) -> Duration {
        let base = self.base_delay.as_millis() as u64;
        let backoff = base.saturating_mul(1u64 << attempt.min(6));
        let jitter = rand::rng().random_range(0..=backoff / 2 + 1);
        Duration::from_millis(backoff + jitter)
    }
}

#[derive(Debug, thiserror::Error)]
enum RequestError {
    #[error("transient service error: {0}")]
    Transient(String),
    #[error("{0}")]
    Terminal(String),
}

fn transient_status(status: reqwest::StatusCode) -> bool {
    status.as_u16() == 429 || status.is_server_error()
}

// --- Gemini ---

#[derive(Debug)]
pub struct GeminiClient {
    api_key: String,
    text_model: String,
    image_model: String,
    retry: RetryPolicy,
    client: reqwest::Client,
}

impl GeminiClient {
    pub fn new(config: &Config) -> Self {
        Self {
            api_key: config.gemini.api_key.clone(),
            text_model: config.gemini.text_model.clone(),
            image_model: config.gemini.image_model.clone(),
            retry: RetryPolicy {
                max_attempts: config.retry_count.max(1),
                base_delay: Duration::from_secs(config.retry_delay_seconds),
            },
            client: reqwest::Client::new(),
        }
    }

    fn endpoint(&self, model: &str) -> String {
        format!(
            "https://generativelanguage.googleapis.com/v1beta/models/{}:generateContent?key={}",
            model, self.api_key
        )
    }

    async fn request(&self, url: &str, body: &GeminiRequest) -> Result<GeminiResponse> {
        let mut attempt = 0;
        loop {
            match self.try_request(url, body).await {
                Ok(resp) => return Ok(resp),
                Err(RequestError::Transient(msg)) if attempt + 1 < self.retry.max_attempts => {
                    let delay = self.retry.delay_for(attempt);
                    warn!(
                        "Transient Gemini error (attempt {}/{}): {}. Retrying in {:?}",
                        attempt + 1,
                        self.retry.max_attempts,
                        msg,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(anyhow!("Gemini API error: {}", e)),
            }
        }
    }

    async fn try_request(&self, url: &str, body: &GeminiRequest) -> Result<GeminiResponse, RequestError> {
        let resp = self
            .client
            .post(url)
            .json(body)
            .send()
            .await
            .map_err(|e| {
                if e.is_connect() || e.is_timeout() {
                    RequestError::Transient(e.to_string())
                } else {
                    RequestError::Terminal(e.to_string())
                }
            })?;

        let status = resp.status();
        let response_text = resp
            .text()
            .await
            .map_err(|e| RequestError::Transient(e.to_string()))?;

        if !status.is_success() {
            if transient_status(status) {
                return Err(RequestError::Transient(format!("{}: {}", status, response_text)));
            }
            return Err(RequestError::Terminal(format!("{}: {}", status, response_text)));
        }

        let result: GeminiResponse = serde_json::from_str(&response_text).map_err(|e| {
            RequestError::Terminal(format!(
                "Failed to parse Gemini response: {}. Body: {}",
                e, response_text
            ))
        })?;

        if let Some(err) = &result.error {
            return Err(RequestError::Terminal(err.message.clone()));
        }

        Ok(result)
    }
}

#[async_trait]
impl GenAiClient for GeminiClient {
    async fn generate_text(&self, system: &str, user: &str) -> Result<String> {
        let request_body = GeminiRequest {
            contents: vec![GeminiContent {
                role: "user".to_string(),
                parts: vec![GeminiPart::text(user)],
            }],
            system_instruction: Some(GeminiSystemInstruction {
                parts: vec![GeminiPart::text(system)],
            }),
            generation_config: None,
        };

        let result = self
            .request(&self.endpoint(&self.text_model), &request_body)
            .await?;

        for part in result.first_parts() {
            if let Some(text) = &part.text {
                return Ok(text.clone());
            }
        }

        Err(anyhow!(
            "Gemini text response empty. Finish reason: {}",
            result.finish_reason()
        ))
    }

    async fn generate_image(
        &self,
        prompt: &str,
        reference_images: &[Vec<u8>],
        aspect_ratio: &str,
    ) -> Result<Vec<u8>> {
        let mut parts = vec![GeminiPart::text(prompt)];
        for image in reference_images {
            parts.push(GeminiPart::jpeg(image));
        }

        let request_body = GeminiRequest {
            contents: vec![GeminiContent {
                role: "user".to_string(),
                parts,
            }],
            system_instruction: None,
            generation_config: Some(GenerationConfig {
                response_modalities: vec!["IMAGE".to_string()],
                image_config: Some(ImageConfig {
                    aspect_ratio: aspect_ratio.to_string(),
                }),
            }),
        };

        let result = self
            .request(&self.endpoint(&self.image_model), &request_body)
            .await?;

        for part in result.first_parts() {
            if let Some(blob) = &part.inline_data {
                let bytes = base64::engine::general_purpose::STANDARD
                    .decode(&blob.data)
                    .map_err(|e| anyhow!("Failed to decode image payload: {}", e))?;
                return Ok(bytes);
            }
        }

        Err(anyhow!(
            "Gemini generation returned no image. Finish reason: {}",
            result.finish_reason()
        ))
    }
}

#[derive(Serialize)]
struct GeminiRequest {
    contents: Vec<GeminiContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<GeminiSystemInstruction>,
    #[serde(rename = "generationConfig", skip_serializing_if = "Option::is_none")]
    generation_config: Option<GenerationConfig>,
}

#[derive(Serialize)]
struct GeminiContent {
    role: String,
    parts: Vec<GeminiPart>,
}

#[derive(Serialize)]
struct GeminiSystemInstruction {
    parts: Vec<GeminiPart>,
}

#[derive(Serialize)]
struct GeminiPart {
    #[serde(skip_serializing_if = "Option::is_none")]
    text: Option<String>,
    #[serde(rename = "inlineData", skip_serializing_if = "Option::is_none")]
    inline_data: Option<GeminiBlob>,
}

impl GeminiPart {
    fn text(text: &str) -> Self {
        Self {
            text: Some(text.to_string()),
            inline_data: None,
        }
    }

    fn jpeg(bytes: &[u8]) -> Self {
        Self {
            text: None,
            inline_data: Some(GeminiBlob {
                mime_type: "image/jpeg".to_string(),
                data: base64::engine::general_purpose::STANDARD.encode(bytes),
            }),
        }
    }
}

#[derive(Serialize)]
struct GeminiBlob {
    #[serde(rename = "mimeType")]
    mime_type: String,
    data: String,
}

#[derive(Serialize)]
struct GenerationConfig {
    #[serde(rename = "responseModalities")]
    response_modalities: Vec<String>,
    #[serde(rename = "imageConfig", skip_serializing_if = "Option::is_none")]
    image_config: Option<ImageConfig>,
}

#[derive(Serialize)]
struct ImageConfig {
    #[serde(rename = "aspectRatio")]
    aspect_ratio: String,
}

#[derive(Deserialize)]
struct GeminiResponse {
    candidates: Option<Vec<GeminiCandidate>>,
    error: Option<GeminiError>,
}

impl GeminiResponse {
    fn first_parts(&self) -> &[GeminiPartResponse] {
        self.candidates
            .as_deref()
            .and_then(|c| c.first())
            .and_then(|c| c.content.as_ref())
            .map(|c| c.parts.as_slice())
            .unwrap_or(&[])
    }

    fn finish_reason(&self) -> &str {
        self.candidates
            .as_deref()
            .and_then(|c| c.first())
            .and_then(|c| c.finish_reason.as_deref())
            .unwrap_or("UNKNOWN")
    }
}

#[derive(Deserialize)]
struct GeminiCandidate {
    content: Option<GeminiContentResponse>,
    #[serde(rename = "finishReason")]
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct GeminiContentResponse {
    #[serde(default)]
    parts: Vec<GeminiPartResponse>,
}

#[derive(Deserialize)]
struct GeminiPartResponse {
    text: Option<String>,
    #[serde(rename = "inlineData")]
    inline_data: Option<GeminiBlobResponse>,
}

#[derive(Deserialize)]
struct GeminiBlobResponse {
    data: String,
}

#[derive(Deserialize, Debug)]
struct GeminiError {
    message: String,
}
