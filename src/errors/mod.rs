// Module: Errors
// Step-level failure classification and engine-level abort errors.

use crate::report::{RunStatus, StepErrorInfo, StepResult};
use crate::validation::ValidationError;

// ============================================================================
// STEP FAILURE
// ============================================================================

/// How a step went wrong. Drives the result status:
/// assertion -> `failed`, error -> `error`, cancelled -> `skipped`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// An expected condition did not hold (or timed out waiting for it).
    Assertion,
    /// Execution itself broke: missing input, driver failure, bad document.
    Error,
    /// The cancel signal was observed.
    Cancelled,
}

/// Failure value returned by block executors.
///
/// Carries the structured `{expected, actual, stepType}` payload for
/// assertion-style failures, and any child step results produced before
/// the failure (control-flow branches, procedure expansions).
#[derive(Debug, Clone)]
pub struct StepFailure {
    pub kind: FailureKind,
    pub message: String,
    pub expected: Option<String>,
    pub actual: Option<String>,
    pub step_type: Option<String>,
    pub children: Vec<StepResult>,
}

impl StepFailure {
    pub fn assertion(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Assertion,
            message: message.into(),
            expected: None,
            actual: None,
            step_type: None,
            children: Vec::new(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Error,
            message: message.into(),
            expected: None,
            actual: None,
            step_type: None,
            children: Vec::new(),
        }
    }

    pub fn cancelled() -> Self {
        Self {
            kind: FailureKind::Cancelled,
            message: "cancelled".to_string(),
            expected: None,
            actual: None,
            step_type: None,
            children: Vec::new(),
        }
    }

    pub fn with_expected(mut self, expected: impl Into<String>) -> Self {
        self.expected = Some(expected.into());
        self
    }

    pub fn with_actual(mut self, actual: impl Into<String>) -> Self {
        self.actual = Some(actual.into());
        self
    }

    pub fn with_step_type(mut self, step_type: impl Into<String>) -> Self {
        self.step_type = Some(step_type.into());
        self
    }

    pub fn with_children(mut self, children: Vec<StepResult>) -> Self {
        self.children = children;
        self
    }

    /// Result status this failure maps to.
    pub fn status(&self) -> RunStatus {
        match self.kind {
            FailureKind::Assertion => RunStatus::Failed,
            FailureKind::Error => RunStatus::Error,
            FailureKind::Cancelled => RunStatus::Skipped,
        }
    }

    pub fn to_error_info(&self) -> StepErrorInfo {
        StepErrorInfo {
            message: self.message.clone(),
            expected: self.expected.clone(),
            actual: self.actual.clone(),
            step_type: self.step_type.clone(),
        }
    }
}

// ============================================================================
// ENGINE ERROR
// ============================================================================

/// Errors that abort the run before (or instead of) executing tests.
/// These map to CLI exit code 2.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("document validation failed with {} error(s)", .0.len())]
    InvalidDocument(Vec<ValidationError>),
}
