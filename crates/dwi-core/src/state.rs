//! Primary / fallback state machine
//!
//! The pipeline only moves through `StateTracker::advance`, which rejects any
//! transition not listed in `allowed_transitions`.

use serde::{Deserialize, Serialize};

use crate::error::PipelineError;

/// Per-subject pipeline state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SubjectState {
    /// Nothing done yet
    Init,
    /// Inputs resolved, sanitized and checked
    IntegrityChecked,
    /// Engine invoked in direct or preprocessing mode
    PrimaryAttempted,
    /// Engine produced a result
    PrimarySucceeded,
    /// Engine failed or was skipped
    PrimaryFailed,
    /// Mask derivation, tensor fit and from-maps invocation running
    FallbackAttempted,
    /// From-maps invocation produced a result
    FallbackSucceeded,
    /// Fallback produced nothing
    FallbackFailed,
    /// Aborted before the primary stage
    Failed,
    /// Terminal
    Done,
}

impl SubjectState {
    /// Terminal states accept no further transitions
    #[inline]
    #[must_use]
    pub fn is_terminal(self) -> bool {
        allowed_transitions(self).is_empty()
    }
}

/// Validates a state transition
pub fn validate_transition(from: SubjectState, to: SubjectState) -> Result<(), PipelineError> {
    if allowed_transitions(from).contains(&to) {
        Ok(())
    } else {
        Err(PipelineError::IllegalTransition { from, to })
    }
}

/// States reachable from `from` in one step
#[must_use]
pub fn allowed_transitions(from: SubjectState) -> &'static [SubjectState] {
    use SubjectState::*;
    match from {
        Init => &[IntegrityChecked, Failed],
        // Dependency precheck failure skips the invocation entirely.
        IntegrityChecked => &[PrimaryAttempted, PrimaryFailed, Failed],
        PrimaryAttempted => &[PrimarySucceeded, PrimaryFailed],
        PrimarySucceeded => &[Done],
        PrimaryFailed => &[FallbackAttempted],
        FallbackAttempted => &[FallbackSucceeded, FallbackFailed],
        FallbackSucceeded => &[Done],
        FallbackFailed => &[Done],
        Failed => &[Done],
        Done => &[],
    }
}

/// Tracks the current state and the path taken
#[derive(Debug, Clone)]
pub struct StateTracker {
    current: SubjectState,
    history: Vec<SubjectState>,
}

impl StateTracker {
    /// Start at `Init`
    #[must_use]
    pub fn new() -> Self {
        Self {
            current: SubjectState::Init,
            history: vec![SubjectState::Init],
        }
    }

    /// Move to `to` if allowed
    pub fn advance(&mut self, to: SubjectState) -> Result<SubjectState, PipelineError> {
        validate_transition(self.current, to)?;
        let from = self.current;
        self.current = to;
        self.history.push(to);
        Ok(from)
    }

    /// Current state
    #[inline]
    #[must_use]
    pub fn current(&self) -> SubjectState {
        self.current
    }

    /// Every state visited, in order
    #[inline]
    #[must_use]
    pub fn history(&self) -> &[SubjectState] {
        &self.history
    }
}

impl Default for StateTracker {
    fn default() -> Self {
        Self::new()
    }
}
