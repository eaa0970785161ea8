use std::time::Duration;

/// Failure of a single agent invocation (planner, generator or evaluator).
#[derive(Debug, Clone, thiserror::Error)]
pub enum AgentError {
    /// The language model could not be reached or returned an error status.
    #[error("language model unavailable: {0}")]
    Unavailable(String),
    #[error("malformed agent output: {0}")]
    Malformed(String),
    #[error("agent call timed out after {0:?}")]
    Timeout(Duration),
    #[error("cancelled before the call was issued")]
    Cancelled,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum SynthesisError {
    /// Network error, 5xx, 429 or timeout. Worth retrying.
    #[error("transient synthesis failure: {0}")]
    Transient(String),
    #[error("voice rejected by the speech service: {0}")]
    InvalidVoice(String),
    /// Content or request rejected for a reason retrying cannot fix.
    #[error("synthesis request rejected: {0}")]
    Rejected(String),
    #[error("synthesis failed after {attempts} attempt(s): {last}")]
    Exhausted {
        attempts: u32,
        last: Box<SynthesisError>,
    },
    #[error("synthesis cancelled")]
    Cancelled,
}

impl SynthesisError {
    pub fn is_transient(&self) -> bool {
        matches!(self, SynthesisError::Transient(_))
    }

    /// Retrying the same request cannot succeed.
    pub fn is_permanent(&self) -> bool {
        !self.is_transient()
    }
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("configuration error: {0}")]
pub struct ConfigError(pub String);

impl ConfigError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

/// Fatal errors surfaced to whoever drives the pipeline.
#[derive(Debug, thiserror::Error)]
pub enum AudiobookError {
    #[error("planning failed: {0}")]
    PlanningFailure(String),
    #[error(transparent)]
    Configuration(#[from] ConfigError),
    #[error("chapter {chapter} aborted: {source}")]
    ChapterAborted {
        chapter: usize,
        #[source]
        source: SynthesisError,
    },
    #[error("no audio was produced")]
    NoAudio,
    #[error("run cancelled")]
    Cancelled,
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_synthesis_error_classes() {
        assert!(SynthesisError::Transient("503".to_string()).is_transient());
        assert!(SynthesisError::Rejected("too long".to_string()).is_permanent());
        assert!(SynthesisError::InvalidVoice("x".to_string()).is_permanent());
        assert!(SynthesisError::Cancelled.is_permanent());
    }
}
