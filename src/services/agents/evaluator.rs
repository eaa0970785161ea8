use async_trait::async_trait;
use log::{debug, info};
use serde::Deserialize;
use std::sync::Arc;

use super::{extract_json_object, strip_code_blocks, unavailable, Assessment, Evaluator};
use crate::core::error::AgentError;
use crate::core::state::{ChapterDraft, ChapterSpec};
use crate::services::language::{self, Language};
use crate::services::llm::LlmClient;

pub struct LlmEvaluator {
    llm: Arc<dyn LlmClient>,
    language: Language,
}

impl LlmEvaluator {
    pub fn new(llm: Arc<dyn LlmClient>, language: Language) -> Self {
        Self { llm, language }
    }
}

#[derive(Deserialize)]
struct EvaluationResponse {
    #[serde(alias = "score")]
    overall_score: f64,
    #[serde(default, alias = "feedback")]
    improvement_instructions: String,
    #[serde(default)]
    strengths: Vec<String>,
    #[serde(default)]
    weaknesses: Vec<String>,
}

/// Turns an evaluator reply into a score and a revision note. Weaknesses are
/// folded into the note so the generator sees them on the next round.
pub fn parse_assessment(response: &str) -> Result<(Assessment, Vec<String>), AgentError> {
    let clean = strip_code_blocks(response);
    let json = extract_json_object(&clean)
        .ok_or_else(|| AgentError::Malformed("no JSON object in evaluator reply".to_string()))?;
    let parsed: EvaluationResponse = serde_json::from_str(json)
        .map_err(|e| AgentError::Malformed(format!("evaluation JSON: {}", e)))?;
    if !parsed.overall_score.is_finite() {
        return Err(AgentError::Malformed("score is not a number".to_string()));
    }

    let mut feedback = parsed.improvement_instructions.trim().to_string();
    for weakness in &parsed.weaknesses {
        if !feedback.is_empty() {
            feedback.push('\n');
        }
        feedback.push_str("- ");
        feedback.push_str(weakness.trim());
    }
    Ok((
        Assessment {
            score: parsed.overall_score.clamp(0.0, 100.0),
            feedback,
        },
        parsed.strengths,
    ))
}

#[async_trait]
impl Evaluator for LlmEvaluator {
    async fn evaluate(
        &self,
        spec: &ChapterSpec,
        draft: &ChapterDraft,
    ) -> Result<Assessment, AgentError> {
        let prompt = language::evaluation_prompt(self.language, spec, &draft.text);
        let response = self
            .llm
            .chat(language::evaluator_system_prompt(self.language), &prompt)
            .await
            .map_err(unavailable)?;

        let (assessment, strengths) = parse_assessment(&response)?;
        info!(
            "Chapter {} ({}) scored {:.1}/100",
            spec.number, draft.generator_id, assessment.score
        );
        for s in strengths.iter().take(3) {
            debug!("  + {}", s);
        }
        Ok(assessment)
    }
}
