use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;

use crate::core::cancel::CancelToken;
use crate::core::config::Config;
use crate::core::error::{AudiobookError, ConfigError};
use crate::core::io::Storage;
use crate::core::state::{ApprovedChapter, ChapterSpans};
use crate::services::agents::{Generator, LlmEvaluator, LlmGenerator, LlmPlanner};
use crate::services::assembler::{AssemblyReport, AudiobookAssembler};
use crate::services::formatter::ContentFormatter;
use crate::services::language::Language;
use crate::services::llm::LlmClient;
use crate::services::text::preprocess::TextPreprocessor;
use crate::services::text::segmenter::{HeadingRules, TextSegmenter};
use crate::services::tts::retry::SynthesisRetryEngine;
use crate::services::tts::SpeechSynthesizer;
use crate::services::voice_map::VoiceMap;
use crate::services::workflow::{GeneratedBook, GenerationWorkflow, WorkflowOutcome};
use crate::utils::audio;

/// Chapters kept in the build folder so a failed synthesis run does not
/// pay for generation again.
#[derive(Serialize, Deserialize)]
struct CachedBook {
    topic: String,
    chapters: Vec<ApprovedChapter>,
    aggregate_score: f64,
    rounds: u32,
    degraded: bool,
}

#[derive(Debug, Clone)]
pub struct AudiobookResult {
    pub report: AssemblyReport,
    /// Set when the quality gate was never cleared.
    pub degraded: bool,
    pub aggregate_score: f64,
    pub rounds: u32,
}

/// File-name friendly form of a topic.
pub fn slugify(topic: &str) -> String {
    let mut slug = String::new();
    for c in topic.trim().chars().flat_map(char::to_lowercase) {
        if c.is_alphanumeric() {
            slug.push(c);
        } else if !slug.is_empty() && !slug.ends_with('_') {
            slug.push('_');
        }
        if slug.chars().count() >= 60 {
            break;
        }
    }
    let slug = slug.trim_end_matches('_').to_string();
    if slug.is_empty() {
        "audiobook".to_string()
    } else {
        slug
    }
}

/// Topic in, audio file out: generation workflow, formatting,
/// preprocessing, segmentation and assembly.
pub struct AudiobookPipeline {
    config: Config,
    language: Language,
    llm: Arc<dyn LlmClient>,
    synthesizer: Arc<dyn SpeechSynthesizer>,
    voice_map: VoiceMap,
    storage: Arc<dyn Storage>,
    cancel: CancelToken,
}

impl AudiobookPipeline {
    pub fn new(
        config: Config,
        llm: Arc<dyn LlmClient>,
        synthesizer: Arc<dyn SpeechSynthesizer>,
        voice_map: VoiceMap,
        storage: Arc<dyn Storage>,
        cancel: CancelToken,
    ) -> Result<Self, ConfigError> {
        if !voice_map.has_engine(&config.audio.engine) {
            return Err(ConfigError::new(format!(
                "engine {:?} missing from voice map",
                config.audio.engine
            )));
        }
        Ok(Self {
            language: Language::from_tag(&config.language),
            config,
            llm,
            synthesizer,
            voice_map,
            storage,
            cancel,
        })
    }

    fn heading_rules(&self) -> HeadingRules {
        HeadingRules::new(self.language, self.config.audio.heading_marker.clone())
    }

    fn build_dir(&self, topic: &str) -> String {
        Path::new(&self.config.build_folder)
            .join(slugify(topic))
            .to_string_lossy()
            .to_string()
    }

    pub fn output_path(&self, topic: &str) -> String {
        Path::new(&self.config.output_folder)
            .join(format!("{}.{}", slugify(topic), self.config.audio.format.extension()))
            .to_string_lossy()
            .to_string()
    }

    pub fn build_workflow(&self) -> GenerationWorkflow {
        let wf = &self.config.workflow;
        let planner = Arc::new(LlmPlanner::new(self.llm.clone(), self.language, wf.size));
        let generators: Vec<Arc<dyn Generator>> = (1..=wf.generators)
            .map(|i| {
                Arc::new(LlmGenerator::new(format!("generator{}", i), self.llm.clone(), self.language))
                    as Arc<dyn Generator>
            })
            .collect();
        let evaluator = Arc::new(LlmEvaluator::new(self.llm.clone(), self.language));
        GenerationWorkflow::new(planner, generators, evaluator, wf.clone(), self.cancel.clone())
    }

    /// Runs the generation workflow, or reuses chapters cached for the same
    /// topic by an earlier run.
    pub async fn generate(&self, topic: &str) -> Result<WorkflowOutcome, AudiobookError> {
        let build_dir = self.build_dir(topic);
        let cache_path = format!("{}/chapters.json", build_dir);

        if self.storage.exists(&cache_path).await? {
            let raw = self.storage.read(&cache_path).await?;
            match serde_json::from_slice::<CachedBook>(&raw) {
                Ok(cached) if cached.topic == topic && !cached.chapters.is_empty() => {
                    info!("Reusing {} cached chapters from {}", cached.chapters.len(), cache_path);
                    let book = GeneratedBook {
                        topic: cached.topic,
                        chapters: cached.chapters,
                        aggregate_score: cached.aggregate_score,
                        rounds: cached.rounds,
                    };
                    return Ok(if cached.degraded {
                        WorkflowOutcome::QualityGateExhausted(book)
                    } else {
                        WorkflowOutcome::Completed(book)
                    });
                }
                Ok(_) => info!("Cached chapters belong to another topic, regenerating"),
                Err(e) => warn!("Ignoring unreadable chapter cache {}: {}", cache_path, e),
            }
        }

        let outcome = self.build_workflow().run(topic).await?;
        let book = outcome.book();
        let cached = CachedBook {
            topic: book.topic.clone(),
            chapters: book.chapters.clone(),
            aggregate_score: book.aggregate_score,
            rounds: book.rounds,
            degraded: outcome.is_degraded(),
        };
        let json = serde_json::to_vec_pretty(&cached).map_err(anyhow::Error::from)?;
        // Fresh text invalidates any audio synthesized for an older version.
        self.storage.delete(&format!("{}/chunks", build_dir)).await?;
        self.storage.write(&cache_path, &json).await?;
        Ok(outcome)
    }

    /// Formatted transcript plus the spans to synthesize, chapter by chapter.
    pub fn prepare(&self, book: &GeneratedBook) -> Result<(String, Vec<ChapterSpans>), ConfigError> {
        let rules = self.heading_rules();
        let transcript = ContentFormatter::new(self.language, rules.clone()).format(&book.chapters);
        let speech_text = TextPreprocessor::new(self.language, rules.clone()).preprocess(&transcript);

        let (narrator, dialogue) = self
            .voice_map
            .voices_for(&self.config.audio.engine, self.config.audio.narrator_gender)?;
        info!("Voices: narrator {}, dialogue {}", narrator, dialogue);
        let chapters = TextSegmenter::new(rules, narrator, dialogue).segment_chapters(&speech_text);
        Ok((transcript, chapters))
    }

    /// Synthesizes a generated book into the output folder.
    pub async fn produce(&self, outcome: WorkflowOutcome) -> Result<AudiobookResult, AudiobookError> {
        let degraded = outcome.is_degraded();
        let book = outcome.into_book();
        let (transcript, chapters) = self.prepare(&book)?;

        let words: usize = book.chapters.iter().map(|c| c.draft.word_count()).sum();
        info!(
            "{} chapters, {} words, about {:.1} minutes of audio",
            chapters.len(),
            words,
            audio::estimate_duration(&transcript, self.config.audio.words_per_minute).as_secs_f64() / 60.0
        );

        let engine = Arc::new(SynthesisRetryEngine::new(
            self.synthesizer.clone(),
            &self.config.audio,
            self.cancel.clone(),
        ));
        let assembler = AudiobookAssembler::new(engine, self.storage.clone(), &self.config.audio, self.cancel.clone())
            .with_progress(!self.config.unattended)
            .with_cache_dir(format!("{}/chunks", self.build_dir(&book.topic)));
        let report = assembler
            .assemble(&chapters, &self.output_path(&book.topic), Some(&transcript))
            .await?;

        Ok(AudiobookResult {
            report,
            degraded,
            aggregate_score: book.aggregate_score,
            rounds: book.rounds,
        })
    }

    /// Whole run. A below-threshold book is still produced and flagged.
    pub async fn run(&self, topic: &str) -> Result<AudiobookResult, AudiobookError> {
        let outcome = self.generate(topic).await?;
        if outcome.is_degraded() {
            warn!(
                "Quality gate not reached (aggregate {:.1}); producing best-effort audio",
                outcome.book().aggregate_score
            );
        }
        self.produce(outcome).await
    }
}
