use log::{debug, warn};
use std::sync::Arc;
use std::time::Duration;

use super::SpeechSynthesizer;
use crate::core::cancel::CancelToken;
use crate::core::config::{AudioConfig, RetryConfig};
use crate::core::error::SynthesisError;
use crate::core::state::{AudioSegment, TextSpan};
use crate::utils::audio;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Fraction of the delay added at random, 0.0..=1.0.
    pub jitter: f64,
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
            jitter: if config.jitter.is_finite() {
                config.jitter.clamp(0.0, 1.0)
            } else {
                0.0
            },
        }
    }
}

/// Capped exponential backoff with jitter. Successive delays never shrink,
/// even once the cap is reached and only the jitter varies.
#[derive(Debug)]
pub struct Backoff {
    policy: RetryPolicy,
    retry: u32,
    last: Duration,
}

impl Backoff {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            retry: 0,
            last: Duration::ZERO,
        }
    }

    pub fn next_delay(&mut self) -> Duration {
        let exp = self
            .policy
            .base_delay
            .saturating_mul(2u32.saturating_pow(self.retry))
            .min(self.policy.max_delay);
        let jitter = exp.mul_f64(rand::random::<f64>() * self.policy.jitter);
        self.retry += 1;
        self.last = self.last.max(exp + jitter);
        self.last
    }
}

/// Wraps one span synthesis call with bounded retry and voice fallback.
pub struct SynthesisRetryEngine {
    synthesizer: Arc<dyn SpeechSynthesizer>,
    policy: RetryPolicy,
    fallback_voice: Option<String>,
    words_per_minute: u32,
    cancel: CancelToken,
}

impl SynthesisRetryEngine {
    pub fn new(synthesizer: Arc<dyn SpeechSynthesizer>, config: &AudioConfig, cancel: CancelToken) -> Self {
        Self {
            synthesizer,
            policy: RetryPolicy::from(&config.retry),
            fallback_voice: config.fallback_voice.clone(),
            words_per_minute: config.words_per_minute.max(1),
            cancel,
        }
    }

    /// Transient failures are retried with backoff up to `max_attempts`
    /// calls in total. A rejected voice switches to the fallback voice once;
    /// any other permanent failure is returned immediately.
    pub async fn synthesize(&self, span_index: usize, span: &TextSpan) -> Result<AudioSegment, SynthesisError> {
        let mut backoff = Backoff::new(self.policy.clone());
        let mut voice = span.voice_id.as_str();
        let mut attempts = 0;

        loop {
            if self.cancel.is_cancelled() {
                return Err(SynthesisError::Cancelled);
            }
            attempts += 1;
            let err = match self.synthesizer.synthesize(&span.content, voice).await {
                Ok(bytes) => {
                    if attempts > 1 {
                        debug!("Span {} synthesized after {} attempts", span_index, attempts);
                    }
                    let duration = audio::wav_duration(&bytes)
                        .unwrap_or_else(|| audio::estimate_duration(&span.content, self.words_per_minute));
                    return Ok(AudioSegment {
                        span_index,
                        bytes,
                        duration,
                        placeholder: false,
                    });
                }
                Err(e) => e,
            };

            if matches!(err, SynthesisError::InvalidVoice(_)) {
                match self.fallback_voice.as_deref() {
                    Some(fallback) if fallback != voice && attempts < self.policy.max_attempts => {
                        warn!(
                            "Voice {} rejected for span {}, falling back to {}",
                            voice, span_index, fallback
                        );
                        voice = fallback;
                        continue;
                    }
                    _ => return Err(err),
                }
            }
            if err.is_permanent() {
                return Err(err);
            }

            if attempts >= self.policy.max_attempts {
                warn!("Span {} failed after {} attempts: {}", span_index, attempts, err);
                return Err(SynthesisError::Exhausted {
                    attempts,
                    last: Box::new(err),
                });
            }
            let delay = backoff.next_delay();
            warn!(
                "Synthesis attempt {}/{} for span {} failed ({}), retrying in {:?}",
                attempts, self.policy.max_attempts, span_index, err, delay
            );
            tokio::time::sleep(delay).await;
        }
    }
}
