use futures_util::stream::{self, StreamExt};
use log::{info, warn};
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::core::cancel::CancelToken;
use crate::core::config::{DraftSelection, WorkflowConfig};
use crate::core::error::{AgentError, AudiobookError, ConfigError};
use crate::core::state::{
    ApprovedChapter, ChapterDraft, ChapterPlan, EvaluationResult, WorkflowState,
};
use crate::services::agents::{Evaluator, Generator, Planner};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureReason {
    PlanRejected,
    QualityGateExhausted,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Planning,
    Generating { iteration: u32 },
    Evaluating { iteration: u32 },
    Revising { iteration: u32 },
    Done { iteration: u32 },
    Failed(FailureReason),
}

impl Phase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Phase::Done { .. } | Phase::Failed(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Event {
    PlanReady,
    PlanInvalid,
    DraftsReady,
    Scored { aggregate: f64 },
    FeedbackApplied,
    Cancelled,
}

/// Pass/fail rule of the revise loop.
#[derive(Debug, Clone, Copy)]
pub struct QualityGate {
    pub threshold: f64,
    pub max_iterations: u32,
}

impl QualityGate {
    /// Pure transition function. Pairs that make no sense leave the phase
    /// unchanged; terminal phases never move.
    pub fn transition(&self, phase: Phase, event: Event) -> Phase {
        match (phase, event) {
            (p, _) if p.is_terminal() => p,
            (_, Event::Cancelled) => Phase::Failed(FailureReason::Cancelled),
            (Phase::Planning, Event::PlanReady) => Phase::Generating { iteration: 0 },
            (Phase::Planning, Event::PlanInvalid) => Phase::Failed(FailureReason::PlanRejected),
            (Phase::Generating { iteration }, Event::DraftsReady) => Phase::Evaluating { iteration },
            (Phase::Evaluating { iteration }, Event::Scored { aggregate }) => {
                if aggregate >= self.threshold {
                    Phase::Done { iteration }
                } else if iteration < self.max_iterations {
                    Phase::Revising {
                        iteration: iteration + 1,
                    }
                } else {
                    Phase::Failed(FailureReason::QualityGateExhausted)
                }
            }
            (Phase::Revising { iteration }, Event::FeedbackApplied) => {
                Phase::Generating { iteration }
            }
            (p, _) => p,
        }
    }
}

/// Approved (or best-effort) chapters in plan order.
#[derive(Debug, Clone)]
pub struct GeneratedBook {
    pub topic: String,
    pub chapters: Vec<ApprovedChapter>,
    pub aggregate_score: f64,
    /// Evaluation rounds run, including the first.
    pub rounds: u32,
}

#[derive(Debug, Clone)]
pub enum WorkflowOutcome {
    Completed(GeneratedBook),
    /// Iterations ran out below the threshold; carries the best draft seen
    /// for every chapter.
    QualityGateExhausted(GeneratedBook),
}

impl WorkflowOutcome {
    pub fn book(&self) -> &GeneratedBook {
        match self {
            WorkflowOutcome::Completed(b) | WorkflowOutcome::QualityGateExhausted(b) => b,
        }
    }

    pub fn into_book(self) -> GeneratedBook {
        match self {
            WorkflowOutcome::Completed(b) | WorkflowOutcome::QualityGateExhausted(b) => b,
        }
    }

    pub fn is_degraded(&self) -> bool {
        matches!(self, WorkflowOutcome::QualityGateExhausted(_))
    }
}

pub struct GenerationWorkflow {
    planner: Arc<dyn Planner>,
    generators: Vec<Arc<dyn Generator>>,
    evaluator: Arc<dyn Evaluator>,
    config: WorkflowConfig,
    agent_timeout: Duration,
    cancel: CancelToken,
}

impl GenerationWorkflow {
    pub fn new(
        planner: Arc<dyn Planner>,
        generators: Vec<Arc<dyn Generator>>,
        evaluator: Arc<dyn Evaluator>,
        config: WorkflowConfig,
        cancel: CancelToken,
    ) -> Self {
        let agent_timeout = config.agent_timeout();
        Self {
            planner,
            generators,
            evaluator,
            config,
            agent_timeout,
            cancel,
        }
    }

    pub fn with_agent_timeout(mut self, timeout: Duration) -> Self {
        self.agent_timeout = timeout;
        self
    }

    fn gate(&self) -> QualityGate {
        QualityGate {
            threshold: self.config.quality_threshold,
            max_iterations: self.config.max_iterations,
        }
    }

    /// One agent call: refused once cancelled, bounded by the per-call timeout.
    async fn call<T, F>(&self, fut: F) -> Result<T, AgentError>
    where
        F: Future<Output = Result<T, AgentError>>,
    {
        if self.cancel.is_cancelled() {
            return Err(AgentError::Cancelled);
        }
        match tokio::time::timeout(self.agent_timeout, fut).await {
            Ok(res) => res,
            Err(_) => Err(AgentError::Timeout(self.agent_timeout)),
        }
    }

    pub async fn run(&self, topic: &str) -> Result<WorkflowOutcome, AudiobookError> {
        if self.generators.is_empty() {
            return Err(ConfigError::new("no generators configured").into());
        }
        let gate = self.gate();
        let mut phase = Phase::Planning;
        let mut state: Option<WorkflowState> = None;
        let mut plan_error = String::new();
        let mut pending: Vec<usize> = Vec::new();
        let mut rounds = 0;

        loop {
            let event = match phase {
                Phase::Planning => match self.call(self.planner.plan(topic)).await {
                    Ok(plan) if !plan.is_empty() => {
                        info!("Plan ready: {} chapter(s)", plan.len());
                        state = Some(WorkflowState::new(Arc::new(plan)));
                        Event::PlanReady
                    }
                    Ok(_) => {
                        plan_error = "planner returned no chapters".to_string();
                        Event::PlanInvalid
                    }
                    Err(AgentError::Cancelled) => Event::Cancelled,
                    Err(e) => {
                        plan_error = e.to_string();
                        Event::PlanInvalid
                    }
                },
                Phase::Generating { iteration } => {
                    let Some(st) = state.as_mut() else {
                        return Err(AudiobookError::PlanningFailure("no plan".to_string()));
                    };
                    st.iteration = iteration;
                    pending = if iteration == 0 {
                        (0..st.plan.len()).collect()
                    } else {
                        st.chapters_needing_revision()
                    };
                    if pending.is_empty() {
                        pending = (0..st.plan.len()).collect();
                    }
                    info!(
                        "Round {}: generating {} chapter(s) with {} generator(s)",
                        iteration + 1,
                        pending.len(),
                        self.generators.len()
                    );
                    let drafts = self.generate_round(st, topic, &pending).await;
                    st.commit_drafts(&pending, drafts);
                    if self.cancel.is_cancelled() {
                        Event::Cancelled
                    } else {
                        Event::DraftsReady
                    }
                }
                Phase::Evaluating { iteration } => {
                    let Some(st) = state.as_mut() else {
                        return Err(AudiobookError::PlanningFailure("no plan".to_string()));
                    };
                    rounds += 1;
                    self.evaluate_round(st, &pending).await;
                    let scores = st.scores();
                    let aggregate = self.config.aggregate.aggregate(&scores);
                    info!(
                        "Round {}: scores {:?}, aggregate {:.1} (threshold {:.1})",
                        iteration + 1,
                        scores,
                        aggregate,
                        gate.threshold
                    );
                    if self.cancel.is_cancelled() {
                        Event::Cancelled
                    } else {
                        Event::Scored { aggregate }
                    }
                }
                Phase::Revising { iteration } => {
                    if let Some(st) = state.as_ref() {
                        for idx in st.chapters_needing_revision() {
                            let note = st
                                .evaluations
                                .get(&idx)
                                .map(|e| e.feedback.as_str())
                                .unwrap_or("");
                            info!(
                                "Revision {} for chapter {}: {}",
                                iteration,
                                idx + 1,
                                note.lines().next().unwrap_or("(no feedback)")
                            );
                        }
                    }
                    Event::FeedbackApplied
                }
                Phase::Done { .. } | Phase::Failed(_) => break,
            };
            let next = gate.transition(phase, event);
            info!("Workflow: {:?} --{:?}--> {:?}", phase, event, next);
            phase = next;
        }

        match (phase, state) {
            (Phase::Done { .. }, Some(st)) => {
                let chapters = st.current_chapters();
                Ok(WorkflowOutcome::Completed(self.book(topic, chapters, rounds)))
            }
            (Phase::Failed(FailureReason::QualityGateExhausted), Some(st)) => {
                warn!(
                    "Quality gate not reached after {} round(s); returning best drafts",
                    rounds
                );
                let chapters = st.best_chapters();
                Ok(WorkflowOutcome::QualityGateExhausted(
                    self.book(topic, chapters, rounds),
                ))
            }
            (Phase::Failed(FailureReason::Cancelled), _) => Err(AudiobookError::Cancelled),
            _ => Err(AudiobookError::PlanningFailure(plan_error)),
        }
    }

    fn book(&self, topic: &str, chapters: Vec<ApprovedChapter>, rounds: u32) -> GeneratedBook {
        let scores: Vec<f64> = chapters.iter().map(|c| c.evaluation.score).collect();
        GeneratedBook {
            topic: topic.to_string(),
            aggregate_score: self.config.aggregate.aggregate(&scores),
            chapters,
            rounds,
        }
    }

    /// Fans out every (chapter, generator) pair. Each task owns one result
    /// slot; chapters with no successful draft are simply absent.
    async fn generate_round(
        &self,
        state: &WorkflowState,
        topic: &str,
        targets: &[usize],
    ) -> BTreeMap<usize, ChapterDraft> {
        let plan: &ChapterPlan = &state.plan;
        let revising = state.iteration > 0;
        let jobs: Vec<(usize, usize)> = targets
            .iter()
            .flat_map(|&c| (0..self.generators.len()).map(move |g| (c, g)))
            .collect();

        let results: Vec<(usize, usize, Result<ChapterDraft, AgentError>)> = stream::iter(jobs)
            .map(|(c, g)| {
                let generator = self.generators[g].clone();
                let spec = &plan.chapters[c];
                let feedback = if revising {
                    state
                        .evaluations
                        .get(&c)
                        .map(|e| e.feedback.clone())
                        .filter(|f| !f.is_empty())
                } else {
                    None
                };
                async move {
                    let res = self
                        .call(generator.generate(c, spec, topic, feedback.as_deref()))
                        .await;
                    (c, g, res)
                }
            })
            .buffer_unordered(self.config.concurrency.max(1))
            .collect()
            .await;

        let mut slots: BTreeMap<usize, Vec<Option<ChapterDraft>>> = targets
            .iter()
            .map(|&c| (c, vec![None; self.generators.len()]))
            .collect();
        for (c, g, res) in results {
            match res {
                Ok(draft) => {
                    if let Some(slot) = slots.get_mut(&c) {
                        slot[g] = Some(draft);
                    }
                }
                Err(e) => warn!(
                    "Generator {} failed on chapter {}: {}",
                    self.generators[g].id(),
                    c + 1,
                    e
                ),
            }
        }

        slots
            .into_iter()
            .filter_map(|(c, candidates)| {
                let chosen = select_draft(self.config.draft_selection, candidates);
                if chosen.is_none() {
                    warn!("All generators failed on chapter {}; keeping previous draft", c + 1);
                }
                chosen.map(|d| (c, d))
            })
            .collect()
    }

    async fn evaluate_round(&self, state: &mut WorkflowState, targets: &[usize]) {
        let threshold = self.config.quality_threshold;
        let jobs: Vec<(usize, _, _)> = targets
            .iter()
            .filter(|c| !state.forced_revision.contains(c))
            .filter_map(|&c| {
                let spec = state.plan.chapters.get(c)?;
                let draft = state.drafts.get(&c)?;
                Some((c, spec, draft))
            })
            .collect();

        let results: Vec<(usize, EvaluationResult)> = stream::iter(jobs)
            .map(|(c, spec, draft)| async move {
                let evaluation = match self.call(self.evaluator.evaluate(spec, draft)).await {
                    Ok(a) => EvaluationResult::new(a.score, a.feedback, threshold),
                    Err(e) => {
                        warn!("Evaluation of chapter {} failed: {}", c + 1, e);
                        EvaluationResult::unavailable("")
                    }
                };
                (c, evaluation)
            })
            .buffer_unordered(self.config.concurrency.max(1))
            .collect()
            .await;

        for (c, evaluation) in results {
            state.record_evaluation(c, evaluation);
        }
        // Chapters whose generators all failed keep their last verdict.
        for &c in targets {
            if state.forced_revision.contains(&c) && !state.evaluations.contains_key(&c) {
                state.record_evaluation(c, EvaluationResult::unavailable(""));
            }
        }
    }
}

/// Picks one draft per chapter; candidates are in generator order.
pub fn select_draft(
    policy: DraftSelection,
    candidates: Vec<Option<ChapterDraft>>,
) -> Option<ChapterDraft> {
    let mut drafts = candidates.into_iter().flatten();
    let first = drafts.next()?;
    Some(match policy {
        DraftSelection::FirstListed => first,
        DraftSelection::HighestConfidence => drafts.fold(first, |best, d| {
            match (d.confidence, best.confidence) {
                (Some(c), Some(b)) if c > b => d,
                (Some(_), None) => d,
                _ => best,
            }
        }),
        DraftSelection::Longest => drafts.fold(first, |best, d| {
            if d.word_count() > best.word_count() {
                d
            } else {
                best
            }
        }),
    })
}
