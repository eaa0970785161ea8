use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use log::{debug, info};
use serde::Serialize;
use std::time::Duration;

use super::SpeechSynthesizer;
use crate::core::config::{AudioConfig, AudioFormat};
use crate::core::error::SynthesisError;

/// Client for OpenAI-compatible speech servers (Kokoro-FastAPI, Orpheus).
pub struct OpenAiSpeechClient {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
    speed: f32,
    format: AudioFormat,
}

#[derive(Serialize)]
struct SpeechRequest<'a> {
    model: &'a str,
    input: &'a str,
    voice: &'a str,
    response_format: &'a str,
    speed: f32,
}

impl OpenAiSpeechClient {
    pub fn new(config: &AudioConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            model: config.model.clone().unwrap_or_else(|| config.engine.clone()),
            speed: config.speed,
            format: config.format,
        })
    }

    fn endpoint(&self) -> String {
        format!("{}/audio/speech", self.base_url)
    }

    /// Synthesizes a short probe so a dead service is reported before any
    /// chapter work starts.
    pub async fn check_health(&self, voice_id: &str) -> Result<()> {
        let audio = self
            .synthesize("Test.", voice_id)
            .await
            .map_err(|e| anyhow!("TTS service at {} is not usable: {}", self.base_url, e))?;
        if audio.is_empty() {
            return Err(anyhow!("TTS service answered but produced no audio"));
        }
        info!("TTS service healthy ({} byte probe)", audio.len());
        Ok(())
    }
}

/// Maps an HTTP error status onto the retry taxonomy.
pub fn classify_status(status: u16, body: &str) -> SynthesisError {
    let detail = format!("HTTP {}: {}", status, body.trim());
    match status {
        408 | 429 | 500..=599 => SynthesisError::Transient(detail),
        400..=499 if body.to_lowercase().contains("voice") => SynthesisError::InvalidVoice(detail),
        _ => SynthesisError::Rejected(detail),
    }
}

fn classify_transport(e: reqwest::Error) -> SynthesisError {
    if e.is_timeout() || e.is_connect() || e.is_request() || e.is_body() {
        SynthesisError::Transient(e.to_string())
    } else {
        SynthesisError::Rejected(e.to_string())
    }
}

#[async_trait]
impl SpeechSynthesizer for OpenAiSpeechClient {
    async fn synthesize(&self, text: &str, voice_id: &str) -> Result<Vec<u8>, SynthesisError> {
        let body = SpeechRequest {
            model: &self.model,
            input: text,
            voice: voice_id,
            response_format: self.format.extension(),
            speed: self.speed,
        };
        let resp = self
            .client
            .post(self.endpoint())
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(classify_transport)?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(classify_status(status.as_u16(), &text));
        }
        let bytes = resp.bytes().await.map_err(classify_transport)?;
        if bytes.is_empty() {
            return Err(SynthesisError::Transient("empty audio body".to_string()));
        }
        debug!("Synthesized {} chars with {} -> {} bytes", text.len(), voice_id, bytes.len());
        Ok(bytes.to_vec())
    }
}
