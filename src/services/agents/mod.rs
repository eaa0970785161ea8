pub mod evaluator;
pub mod generator;
pub mod planner;

use async_trait::async_trait;

use crate::core::error::AgentError;
use crate::core::state::{ChapterDraft, ChapterPlan, ChapterSpec};

pub use evaluator::LlmEvaluator;
pub use generator::LlmGenerator;
pub use planner::LlmPlanner;

#[async_trait]
pub trait Planner: Send + Sync {
    async fn plan(&self, topic: &str) -> Result<ChapterPlan, AgentError>;
}

#[async_trait]
pub trait Generator: Send + Sync {
    fn id(&self) -> &str;

    /// Writes one chapter. `feedback` is the evaluator's note on the
    /// previous draft of this chapter, present only on revision rounds.
    async fn generate(
        &self,
        chapter_index: usize,
        spec: &ChapterSpec,
        topic: &str,
        feedback: Option<&str>,
    ) -> Result<ChapterDraft, AgentError>;
}

/// Score (0-100) and feedback for one draft.
#[derive(Debug, Clone, PartialEq)]
pub struct Assessment {
    pub score: f64,
    pub feedback: String,
}

#[async_trait]
pub trait Evaluator: Send + Sync {
    async fn evaluate(
        &self,
        spec: &ChapterSpec,
        draft: &ChapterDraft,
    ) -> Result<Assessment, AgentError>;
}

pub fn strip_code_blocks(s: &str) -> String {
    let s = s.trim();
    if s.starts_with("```json") {
        s.trim_start_matches("```json").trim_end_matches("```").trim().to_string()
    } else if s.starts_with("```") {
        s.trim_start_matches("```").trim_end_matches("```").trim().to_string()
    } else {
        s.to_string()
    }
}

/// The JSON object between the first `{` and the last `}`, if any.
pub fn extract_json_object(response: &str) -> Option<&str> {
    let start = response.find('{')?;
    let end = response.rfind('}')?;
    (end > start).then(|| &response[start..=end])
}

pub(crate) fn unavailable(err: anyhow::Error) -> AgentError {
    AgentError::Unavailable(format!("{:#}", err))
}
