use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ChapterSpec {
    #[serde(default)]
    pub number: u32,
    pub title: String,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub topics: Vec<String>,
    #[serde(default = "default_target_length", alias = "estimated_length")]
    pub target_length: u32,
}

fn default_target_length() -> u32 {
    1000
}

/// Ordered chapter skeleton. Built once per topic and shared read-only.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct ChapterPlan {
    pub chapters: Vec<ChapterSpec>,
}

impl ChapterPlan {
    pub fn len(&self) -> usize {
        self.chapters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chapters.is_empty()
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ChapterDraft {
    pub chapter_index: usize,
    pub text: String,
    pub generator_id: String,
    /// Self-reported confidence in 0.0..=1.0, when the generator gives one.
    #[serde(default)]
    pub confidence: Option<f32>,
}

impl ChapterDraft {
    pub fn placeholder(chapter_index: usize) -> Self {
        Self {
            chapter_index,
            text: String::new(),
            generator_id: "placeholder".to_string(),
            confidence: None,
        }
    }

    pub fn word_count(&self) -> usize {
        self.text.split_whitespace().count()
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct EvaluationResult {
    pub score: f64,
    pub feedback: String,
    pub passed: bool,
}

impl EvaluationResult {
    pub fn new(score: f64, feedback: impl Into<String>, threshold: f64) -> Self {
        let score = score.clamp(0.0, 100.0);
        Self {
            score,
            feedback: feedback.into(),
            passed: score >= threshold,
        }
    }

    /// Automatic non-pass used when the evaluator could not be reached.
    pub fn unavailable(reason: impl Into<String>) -> Self {
        Self {
            score: 0.0,
            feedback: reason.into(),
            passed: false,
        }
    }
}

/// Mutable state of one generation run. Only the coordinating task writes it.
#[derive(Clone, Debug)]
pub struct WorkflowState {
    pub plan: Arc<ChapterPlan>,
    pub drafts: BTreeMap<usize, ChapterDraft>,
    pub evaluations: BTreeMap<usize, EvaluationResult>,
    pub iteration: u32,
    /// Chapters whose generators all failed last round.
    pub forced_revision: BTreeSet<usize>,
    best: BTreeMap<usize, (ChapterDraft, EvaluationResult)>,
}

impl WorkflowState {
    pub fn new(plan: Arc<ChapterPlan>) -> Self {
        Self {
            plan,
            drafts: BTreeMap::new(),
            evaluations: BTreeMap::new(),
            iteration: 0,
            forced_revision: BTreeSet::new(),
            best: BTreeMap::new(),
        }
    }

    /// Replaces the draft of every chapter present in `drafts`; chapters
    /// without a new draft keep their previous one (or get an empty
    /// placeholder on the first round) and are flagged for revision.
    pub fn commit_drafts(&mut self, attempted: &[usize], mut drafts: BTreeMap<usize, ChapterDraft>) {
        for &idx in attempted {
            match drafts.remove(&idx) {
                Some(draft) => {
                    self.forced_revision.remove(&idx);
                    self.drafts.insert(idx, draft);
                }
                None => {
                    self.forced_revision.insert(idx);
                    self.drafts
                        .entry(idx)
                        .or_insert_with(|| ChapterDraft::placeholder(idx));
                }
            }
        }
    }

    pub fn record_evaluation(&mut self, idx: usize, evaluation: EvaluationResult) {
        if let Some(draft) = self.drafts.get(&idx) {
            let replace = match self.best.get(&idx) {
                Some((_, best)) => evaluation.score >= best.score,
                None => true,
            };
            if replace {
                self.best.insert(idx, (draft.clone(), evaluation.clone()));
            }
        }
        self.evaluations.insert(idx, evaluation);
    }

    /// Chapters that did not pass, or whose generators all failed.
    pub fn chapters_needing_revision(&self) -> Vec<usize> {
        (0..self.plan.len())
            .filter(|idx| {
                self.forced_revision.contains(idx)
                    || !self.evaluations.get(idx).map(|e| e.passed).unwrap_or(false)
            })
            .collect()
    }

    pub fn scores(&self) -> Vec<f64> {
        (0..self.plan.len())
            .map(|idx| self.evaluations.get(&idx).map(|e| e.score).unwrap_or(0.0))
            .collect()
    }

    /// Current drafts in chapter order, paired with their latest evaluation.
    pub fn current_chapters(&self) -> Vec<ApprovedChapter> {
        self.collect_chapters(|idx| {
            self.drafts
                .get(&idx)
                .map(|d| (d.clone(), self.evaluations.get(&idx).cloned()))
        })
    }

    /// Best-scoring draft seen for each chapter (ties go to the newer draft).
    pub fn best_chapters(&self) -> Vec<ApprovedChapter> {
        self.collect_chapters(|idx| match self.best.get(&idx) {
            Some((d, e)) => Some((d.clone(), Some(e.clone()))),
            None => self
                .drafts
                .get(&idx)
                .map(|d| (d.clone(), self.evaluations.get(&idx).cloned())),
        })
    }

    fn collect_chapters<F>(&self, pick: F) -> Vec<ApprovedChapter>
    where
        F: Fn(usize) -> Option<(ChapterDraft, Option<EvaluationResult>)>,
    {
        self.plan
            .chapters
            .iter()
            .enumerate()
            .map(|(idx, spec)| {
                let (draft, evaluation) =
                    pick(idx).unwrap_or_else(|| (ChapterDraft::placeholder(idx), None));
                ApprovedChapter {
                    spec: spec.clone(),
                    draft,
                    evaluation: evaluation
                        .unwrap_or_else(|| EvaluationResult::unavailable("not evaluated")),
                }
            })
            .collect()
    }
}

/// A chapter as handed from the workflow to the formatter.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct ApprovedChapter {
    pub spec: ChapterSpec,
    pub draft: ChapterDraft,
    pub evaluation: EvaluationResult,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum SpanKind {
    Narration,
    Dialogue,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct TextSpan {
    pub content: String,
    pub kind: SpanKind,
    pub voice_id: String,
}

/// Chapter text ready for synthesis: spans in playback order.
#[derive(Clone, Debug)]
pub struct ChapterSpans {
    pub title: String,
    pub spans: Vec<TextSpan>,
}

#[derive(Clone, Debug)]
pub struct AudioSegment {
    pub span_index: usize,
    pub bytes: Vec<u8>,
    pub duration: Duration,
    /// Silence substituted for a span that could not be synthesized.
    pub placeholder: bool,
}
