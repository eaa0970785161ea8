use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::core::error::ConfigError;
use crate::services::language::AudiobookSize;
use crate::services::llm::LlmConfig;
use crate::services::voice_map::Gender;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Config {
    #[serde(default = "default_language")]
    pub language: String,

    #[serde(default = "default_output")]
    pub output_folder: String,

    #[serde(default = "default_build")]
    pub build_folder: String,

    #[serde(default)]
    pub unattended: bool,

    pub llm: LlmConfig,

    #[serde(default)]
    pub workflow: WorkflowConfig,

    #[serde(default)]
    pub audio: AudioConfig,
}

/// How per-chapter scores are folded into the workflow's pass/fail score.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum AggregatePolicy {
    #[default]
    Mean,
    Minimum,
}

impl AggregatePolicy {
    pub fn aggregate(&self, scores: &[f64]) -> f64 {
        if scores.is_empty() {
            return 0.0;
        }
        match self {
            AggregatePolicy::Mean => scores.iter().sum::<f64>() / scores.len() as f64,
            AggregatePolicy::Minimum => scores.iter().cloned().fold(f64::INFINITY, f64::min),
        }
    }
}

/// Which of the parallel drafts of a chapter goes to the evaluator.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum DraftSelection {
    /// Highest self-reported confidence; first-listed when nobody reports one.
    #[default]
    HighestConfidence,
    FirstListed,
    Longest,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct WorkflowConfig {
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
    #[serde(default = "default_quality_threshold")]
    pub quality_threshold: f64,
    #[serde(default)]
    pub aggregate: AggregatePolicy,
    #[serde(default)]
    pub draft_selection: DraftSelection,
    #[serde(default = "default_generators")]
    pub generators: usize,
    #[serde(default)]
    pub size: AudiobookSize,
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_agent_timeout")]
    pub agent_timeout_seconds: u64,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
            quality_threshold: default_quality_threshold(),
            aggregate: AggregatePolicy::default(),
            draft_selection: DraftSelection::default(),
            generators: default_generators(),
            size: AudiobookSize::default(),
            concurrency: default_concurrency(),
            agent_timeout_seconds: default_agent_timeout(),
        }
    }
}

impl WorkflowConfig {
    pub fn agent_timeout(&self) -> Duration {
        Duration::from_secs(self.agent_timeout_seconds)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum AudioFormat {
    #[default]
    Wav,
    Mp3,
}

impl AudioFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            AudioFormat::Wav => "wav",
            AudioFormat::Mp3 => "mp3",
        }
    }
}

/// What the assembler does with a span that still fails after all retries.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum SpanFailurePolicy {
    #[default]
    Silence,
    #[serde(alias = "abort")]
    AbortChapter,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Upper bound of the random extra delay, as a fraction of the delay.
    #[serde(default = "default_jitter")]
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            jitter: default_jitter(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AudioConfig {
    #[serde(default = "default_engine")]
    pub engine: String,
    #[serde(default)]
    pub narrator_gender: Gender,
    /// Path to a voice map JSON file; the built-in tables are used when unset.
    pub voice_map: Option<String>,
    #[serde(default)]
    pub format: AudioFormat,
    #[serde(default = "default_tts_base_url")]
    pub base_url: String,
    #[serde(default = "default_tts_api_key")]
    pub api_key: String,
    /// Model name sent to the speech service; defaults to the engine name.
    pub model: Option<String>,
    #[serde(default = "default_speed")]
    pub speed: f32,
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_words_per_minute")]
    pub words_per_minute: u32,
    #[serde(default)]
    pub on_span_failure: SpanFailurePolicy,
    #[serde(default = "default_silence_ms")]
    pub silence_ms: u64,
    pub heading_marker: Option<String>,
    /// Voice used when the service reports the requested one as invalid.
    pub fallback_voice: Option<String>,
    #[serde(default = "default_tts_timeout")]
    pub timeout_seconds: u64,
    #[serde(default)]
    pub retry: RetryConfig,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            engine: default_engine(),
            narrator_gender: Gender::default(),
            voice_map: None,
            format: AudioFormat::default(),
            base_url: default_tts_base_url(),
            api_key: default_tts_api_key(),
            model: None,
            speed: default_speed(),
            concurrency: default_concurrency(),
            words_per_minute: default_words_per_minute(),
            on_span_failure: SpanFailurePolicy::default(),
            silence_ms: default_silence_ms(),
            heading_marker: None,
            fallback_voice: None,
            timeout_seconds: default_tts_timeout(),
            retry: RetryConfig::default(),
        }
    }
}

fn default_language() -> String {
    "es".to_string()
}
fn default_output() -> String {
    "output".to_string()
}
fn default_build() -> String {
    "build".to_string()
}
fn default_max_iterations() -> u32 {
    3
}
fn default_quality_threshold() -> f64 {
    70.0
}
fn default_generators() -> usize {
    2
}
fn default_concurrency() -> usize {
    4
}
fn default_agent_timeout() -> u64 {
    300
}
fn default_engine() -> String {
    "kokoro".to_string()
}
fn default_tts_base_url() -> String {
    "http://localhost:8880/v1".to_string()
}
fn default_tts_api_key() -> String {
    "not-needed".to_string()
}
fn default_speed() -> f32 {
    0.85
}
fn default_words_per_minute() -> u32 {
    150
}
fn default_silence_ms() -> u64 {
    500
}
fn default_tts_timeout() -> u64 {
    600
}
fn default_max_attempts() -> u32 {
    4
}
fn default_base_delay_ms() -> u64 {
    100
}
fn default_max_delay_ms() -> u64 {
    10_000
}
fn default_jitter() -> f64 {
    0.1
}

impl Config {
    pub fn load() -> Result<Self> {
        Self::load_from("config.yml")
    }

    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            anyhow::bail!("{} not found. Please create one.", path.display());
        }

        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let mut config: Config = serde_yaml_ng::from_str(&content)
            .with_context(|| format!("Failed to parse {}", path.display()))?;
        config.apply_env_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Applies `MAX_ITERATIONS`, `QUALITY_THRESHOLD` and `DEFAULT_LANGUAGE`.
    /// The lookup is injected so tests do not touch the process environment.
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(raw) = lookup("MAX_ITERATIONS") {
            self.workflow.max_iterations = raw
                .trim()
                .parse()
                .map_err(|_| ConfigError::new(format!("MAX_ITERATIONS is not an integer: {}", raw)))?;
        }
        if let Some(raw) = lookup("QUALITY_THRESHOLD") {
            self.workflow.quality_threshold = raw
                .trim()
                .parse()
                .map_err(|_| ConfigError::new(format!("QUALITY_THRESHOLD is not a number: {}", raw)))?;
        }
        if let Some(raw) = lookup("DEFAULT_LANGUAGE") {
            let lang = raw.trim();
            if !lang.is_empty() {
                self.language = lang.to_lowercase();
            }
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let wf = &self.workflow;
        if wf.max_iterations == 0 {
            return Err(ConfigError::new("max_iterations must be a positive integer"));
        }
        if !(0.0..=100.0).contains(&wf.quality_threshold) {
            return Err(ConfigError::new(format!(
                "quality_threshold must be within 0-100, got {}",
                wf.quality_threshold
            )));
        }
        if wf.generators == 0 {
            return Err(ConfigError::new("at least one generator is required"));
        }
        if wf.concurrency == 0 || self.audio.concurrency == 0 {
            return Err(ConfigError::new("concurrency must be at least 1"));
        }
        if self.audio.retry.max_attempts == 0 {
            return Err(ConfigError::new("retry.max_attempts must be at least 1"));
        }
        if !(0.0..=1.0).contains(&self.audio.retry.jitter) {
            return Err(ConfigError::new("retry.jitter must be within 0.0-1.0"));
        }
        if self.audio.words_per_minute == 0 {
            return Err(ConfigError::new("words_per_minute must be at least 1"));
        }
        url::Url::parse(&self.audio.base_url).map_err(|e| {
            ConfigError::new(format!("invalid audio.base_url {}: {}", self.audio.base_url, e))
        })?;
        if self.audio.on_span_failure == SpanFailurePolicy::Silence
            && self.audio.format != AudioFormat::Wav
        {
            return Err(ConfigError::new(
                "silence substitution needs wav output; use on_span_failure: abort_chapter for mp3",
            ));
        }
        Ok(())
    }

    pub fn ensure_directories(&self) -> Result<()> {
        fs::create_dir_all(&self.output_folder)?;
        fs::create_dir_all(&self.build_folder)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = "llm:\n  provider: openai\n  openai:\n    api_key: k\n    model: m\n";

    fn parse(yaml: &str) -> Config {
        serde_yaml_ng::from_str(yaml).unwrap()
    }

    #[test]
    fn test_defaults() {
        let config = parse(MINIMAL);
        assert_eq!(config.language, "es");
        assert_eq!(config.workflow.max_iterations, 3);
        assert_eq!(config.workflow.quality_threshold, 70.0);
        assert_eq!(config.workflow.generators, 2);
        assert_eq!(config.audio.engine, "kokoro");
        assert_eq!(config.audio.on_span_failure, SpanFailurePolicy::Silence);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_env_overrides() {
        let mut config = parse(MINIMAL);
        config
            .apply_env_overrides(|key| match key {
                "MAX_ITERATIONS" => Some("5".to_string()),
                "QUALITY_THRESHOLD" => Some("82.5".to_string()),
                "DEFAULT_LANGUAGE" => Some("EN".to_string()),
                _ => None,
            })
            .unwrap();
        assert_eq!(config.workflow.max_iterations, 5);
        assert_eq!(config.workflow.quality_threshold, 82.5);
        assert_eq!(config.language, "en");
    }

    #[test]
    fn test_env_override_rejects_garbage() {
        let mut config = parse(MINIMAL);
        let err = config
            .apply_env_overrides(|key| (key == "MAX_ITERATIONS").then(|| "three".to_string()))
            .unwrap_err();
        assert!(err.to_string().contains("MAX_ITERATIONS"));
    }

    #[test]
    fn test_validate_fails_fast() {
        let mut config = parse(MINIMAL);
        config.workflow.max_iterations = 0;
        assert!(config.validate().is_err());

        let mut config = parse(MINIMAL);
        config.workflow.quality_threshold = 101.0;
        assert!(config.validate().is_err());

        let mut config = parse(MINIMAL);
        config.audio.format = AudioFormat::Mp3;
        assert!(config.validate().is_err());
        config.audio.on_span_failure = SpanFailurePolicy::AbortChapter;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_aggregate_policy() {
        let scores = [80.0, 60.0, 100.0];
        assert_eq!(AggregatePolicy::Mean.aggregate(&scores), 80.0);
        assert_eq!(AggregatePolicy::Minimum.aggregate(&scores), 60.0);
        assert_eq!(AggregatePolicy::Mean.aggregate(&[]), 0.0);
    }

    #[test]
    fn test_load_from_file() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("config.yml");
        fs::write(
            &path,
            format!("{}workflow:\n  aggregate: minimum\n  draft_selection: longest\n", MINIMAL),
        )?;
        let config = Config::load_from(&path)?;
        assert_eq!(config.workflow.aggregate, AggregatePolicy::Minimum);
        assert_eq!(config.workflow.draft_selection, DraftSelection::Longest);
        Ok(())
    }
}
