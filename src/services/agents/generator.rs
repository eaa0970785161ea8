use async_trait::async_trait;
use log::{debug, info};
use regex::Regex;
use std::sync::{Arc, LazyLock};

use super::{strip_code_blocks, unavailable, Generator};
use crate::core::error::AgentError;
use crate::core::state::{ChapterDraft, ChapterSpec};
use crate::services::language::{self, Language};
use crate::services::llm::LlmClient;

static CONFIDENCE_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?im)^\s*\**(?:confidence|confianza)\**\s*:\s*\**\s*(\d{1,3}(?:\.\d+)?)\s*%?\s*$")
        .unwrap()
});

pub struct LlmGenerator {
    id: String,
    llm: Arc<dyn LlmClient>,
    language: Language,
}

impl LlmGenerator {
    pub fn new(id: impl Into<String>, llm: Arc<dyn LlmClient>, language: Language) -> Self {
        Self {
            id: id.into(),
            llm,
            language,
        }
    }
}

/// Splits a trailing `Confidence: NN` line off the chapter text.
/// Returns the cleaned text and the confidence scaled to 0.0..=1.0.
pub fn split_confidence(text: &str) -> (String, Option<f32>) {
    let Some(caps) = CONFIDENCE_LINE.captures_iter(text).last() else {
        return (text.trim().to_string(), None);
    };
    let Some(whole) = caps.get(0) else {
        return (text.trim().to_string(), None);
    };
    // Only a line at the very end counts; a mid-text mention is prose.
    if !text[whole.end()..].trim().is_empty() {
        return (text.trim().to_string(), None);
    }
    let confidence = caps
        .get(1)
        .and_then(|m| m.as_str().parse::<f32>().ok())
        .map(|v| (v / 100.0).clamp(0.0, 1.0));
    (text[..whole.start()].trim().to_string(), confidence)
}

#[async_trait]
impl Generator for LlmGenerator {
    fn id(&self) -> &str {
        &self.id
    }

    async fn generate(
        &self,
        chapter_index: usize,
        spec: &ChapterSpec,
        topic: &str,
        feedback: Option<&str>,
    ) -> Result<ChapterDraft, AgentError> {
        if feedback.is_some() {
            info!("[{}] Revising chapter {}: {}", self.id, spec.number, spec.title);
        } else {
            info!("[{}] Writing chapter {}: {}", self.id, spec.number, spec.title);
        }
        let prompt = language::chapter_prompt(self.language, topic, spec, feedback);
        let response = self
            .llm
            .chat(language::generator_system_prompt(self.language), &prompt)
            .await
            .map_err(unavailable)?;

        let (text, confidence) = split_confidence(&strip_code_blocks(&response));
        if text.is_empty() {
            return Err(AgentError::Malformed(format!(
                "{} returned an empty chapter",
                self.id
            )));
        }
        debug!(
            "[{}] chapter {}: {} words, confidence {:?}",
            self.id,
            spec.number,
            text.split_whitespace().count(),
            confidence
        );
        Ok(ChapterDraft {
            chapter_index,
            text,
            generator_id: self.id.clone(),
            confidence,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::{anyhow, Result};

    #[derive(Debug)]
    struct FixedLlm(Option<String>);

    #[async_trait]
    impl LlmClient for FixedLlm {
        async fn chat(&self, _system: &str, _user: &str) -> Result<String> {
            self.0.clone().ok_or_else(|| anyhow!("connection refused"))
        }
    }

    fn spec() -> ChapterSpec {
        ChapterSpec {
            number: 1,
            title: "Atoms".to_string(),
            summary: String::new(),
            topics: vec![],
            target_length: 300,
        }
    }

    #[test]
    fn test_split_confidence() {
        let (text, conf) = split_confidence("Body text.\n\nConfidence: 85");
        assert_eq!(text, "Body text.");
        assert_eq!(conf, Some(0.85));

        let (text, conf) = split_confidence("Texto.\n**Confianza:** 120%\n");
        assert_eq!(text, "Texto.");
        assert_eq!(conf, Some(1.0));

        let (text, conf) = split_confidence("Confidence: 40\nThen the story went on.");
        assert!(text.ends_with("went on."));
        assert_eq!(conf, None);
    }

    #[tokio::test]
    async fn test_generate_builds_draft() {
        let generator = LlmGenerator::new(
            "generator1",
            Arc::new(FixedLlm(Some("Once there were atoms.\nConfidence: 70".to_string()))),
            Language::En,
        );
        let draft = generator.generate(3, &spec(), "Materialism", None).await.unwrap();
        assert_eq!(draft.chapter_index, 3);
        assert_eq!(draft.generator_id, "generator1");
        assert_eq!(draft.text, "Once there were atoms.");
        assert_eq!(draft.confidence, Some(0.7));
    }

    #[tokio::test]
    async fn test_generate_maps_failures() {
        let down = LlmGenerator::new("g", Arc::new(FixedLlm(None)), Language::En);
        assert!(matches!(
            down.generate(0, &spec(), "t", None).await,
            Err(AgentError::Unavailable(_))
        ));

        let empty = LlmGenerator::new("g", Arc::new(FixedLlm(Some("Confidence: 90".to_string()))), Language::En);
        assert!(matches!(
            empty.generate(0, &spec(), "t", None).await,
            Err(AgentError::Malformed(_))
        ));
    }
}
