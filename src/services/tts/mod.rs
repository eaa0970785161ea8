use anyhow::Result;
use async_trait::async_trait;
use log::info;

use crate::core::config::AudioConfig;
use crate::core::error::SynthesisError;

/// Speech collaborator: one span of text, one voice, raw audio back.
/// Voice ids may be composite blends such as `af_heart+af_bella`.
#[async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    async fn synthesize(&self, text: &str, voice_id: &str) -> Result<Vec<u8>, SynthesisError>;
}

/// Every supported engine is served behind an OpenAI-compatible
/// `/audio/speech` endpoint; the engine only changes model and voices.
pub fn create_speech_client(config: &AudioConfig) -> Result<openai::OpenAiSpeechClient> {
    info!(
        "Initializing speech client for engine {} at {}",
        config.engine, config.base_url
    );
    openai::OpenAiSpeechClient::new(config)
}

pub mod openai;
pub mod retry;
