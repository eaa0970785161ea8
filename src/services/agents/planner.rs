use async_trait::async_trait;
use log::{debug, info};
use serde::Deserialize;
use std::sync::Arc;

use super::{extract_json_object, strip_code_blocks, unavailable, Planner};
use crate::core::error::AgentError;
use crate::core::state::{ChapterPlan, ChapterSpec};
use crate::services::language::{self, AudiobookSize, Language};
use crate::services::llm::LlmClient;

pub struct LlmPlanner {
    llm: Arc<dyn LlmClient>,
    language: Language,
    size: AudiobookSize,
}

impl LlmPlanner {
    pub fn new(llm: Arc<dyn LlmClient>, language: Language, size: AudiobookSize) -> Self {
        Self {
            llm,
            language,
            size,
        }
    }
}

#[derive(Deserialize)]
struct PlanResponse {
    #[serde(default)]
    chapters: Vec<ChapterSpec>,
}

/// Parses a planner reply. Chapters are renumbered in listed order when the
/// model leaves numbers out or repeats them.
pub fn parse_plan(response: &str) -> Result<ChapterPlan, AgentError> {
    let clean = strip_code_blocks(response);
    let json = extract_json_object(&clean)
        .ok_or_else(|| AgentError::Malformed("no JSON object in planner reply".to_string()))?;
    let parsed: PlanResponse = serde_json::from_str(json)
        .map_err(|e| AgentError::Malformed(format!("plan JSON: {}", e)))?;

    let mut chapters: Vec<ChapterSpec> = parsed
        .chapters
        .into_iter()
        .filter(|c| !c.title.trim().is_empty())
        .collect();
    if chapters.is_empty() {
        return Err(AgentError::Malformed("plan has no chapters".to_string()));
    }

    let mut numbers: Vec<u32> = chapters.iter().map(|c| c.number).collect();
    numbers.sort_unstable();
    numbers.dedup();
    if numbers.len() != chapters.len() || numbers.contains(&0) {
        for (i, chapter) in chapters.iter_mut().enumerate() {
            chapter.number = i as u32 + 1;
        }
    }
    chapters.sort_by_key(|c| c.number);
    Ok(ChapterPlan { chapters })
}

#[async_trait]
impl Planner for LlmPlanner {
    async fn plan(&self, topic: &str) -> Result<ChapterPlan, AgentError> {
        info!("Planning audiobook structure for: {}", topic);
        let prompt = language::planning_prompt(self.language, topic, self.size);
        let response = self
            .llm
            .chat(language::planner_system_prompt(self.language), &prompt)
            .await
            .map_err(unavailable)?;
        debug!("Planner reply: {}", response);

        let plan = parse_plan(&response)?;
        for chapter in &plan.chapters {
            info!(
                "  {} {}: {} ({} topics)",
                self.language.chapter_prefix(),
                chapter.number,
                chapter.title,
                chapter.topics.len()
            );
        }
        Ok(plan)
    }
}
