// Module: Report
// Result tree emitted by the engine: per-step, per-test, per-suite, with
// rollup counts. Rendering (HTML, JUnit) is a downstream consumer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

// ============================================================================
// STATUS
// ============================================================================

/// Outcome of a step, a test, or a whole suite.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    /// Executed and every assertion held.
    Passed,
    /// An assertion did not hold (including elapsed auto-wait timeouts).
    Failed,
    /// Execution itself broke: unknown block, missing input, driver error.
    Error,
    /// Not executed: disabled, cancelled, or a prerequisite failed.
    Skipped,
}

impl RunStatus {
    /// Severity for worst-wins aggregation: error > failed > skipped > passed.
    fn severity(self) -> u8 {
        match self {
            RunStatus::Error => 3,
            RunStatus::Failed => 2,
            RunStatus::Skipped => 1,
            RunStatus::Passed => 0,
        }
    }

    pub fn worst(self, other: RunStatus) -> RunStatus {
        if other.severity() > self.severity() {
            other
        } else {
            self
        }
    }

    /// Worst status across an iterator, `Passed` when empty.
    pub fn combine<I: IntoIterator<Item = RunStatus>>(statuses: I) -> RunStatus {
        statuses
            .into_iter()
            .fold(RunStatus::Passed, RunStatus::worst)
    }

    pub fn is_failing(self) -> bool {
        matches!(self, RunStatus::Failed | RunStatus::Error)
    }
}

// ============================================================================
// ERRORS & LOGS ATTACHED TO RESULTS
// ============================================================================

/// Structured error carried by a failed or errored step.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepErrorInfo {
    pub message: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub expected: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub actual: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub step_type: Option<String>,
}

/// One accumulated soft-assertion failure. Insertion order is preserved
/// within a test and the buffer never leaks across tests.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SoftAssertionError {
    pub message: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub step_type: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub expected: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub actual: Option<String>,

    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// A line captured by the context logger, attributed to the step that
/// emitted it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogLine {
    pub level: LogLevel,
    pub message: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,

    pub timestamp: DateTime<Utc>,
}

// ============================================================================
// STEP RESULT
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepResult {
    pub step_id: String,

    #[serde(rename = "type")]
    pub block_type: String,

    pub status: RunStatus,

    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: u64,

    /// Short human string describing what the step did.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,

    /// Block output; value-producing blocks carry the value under `_value`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<StepErrorInfo>,

    /// Nested results from statement slots and procedure expansions.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<StepResult>,

    /// Soft-assertion failures accumulated while this step ran.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub soft_assertion_errors: Vec<SoftAssertionError>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub logs: Vec<LogLine>,
}

// ============================================================================
// TEST RESULT
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IterationInfo {
    /// Zero-based row index within the test's data table.
    pub index: usize,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    pub values: Map<String, Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum LifecycleType {
    BeforeAll,
    AfterAll,
    BeforeEach,
    AfterEach,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestResult {
    pub test_id: String,
    pub test_name: String,

    pub status: RunStatus,

    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: u64,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub steps: Vec<StepResult>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub iteration: Option<IterationInfo>,

    /// True for hook executions surfaced in the report.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_lifecycle: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub lifecycle_type: Option<LifecycleType>,

    /// Test-level diagnostic, e.g. why the body was skipped.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub soft_assertion_errors: Vec<SoftAssertionError>,
}

// ============================================================================
// SUITE REPORT
// ============================================================================

/// Rollup counts over the suite's test entries (lifecycle entries are
/// surfaced in `tests` but not counted here).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub errors: usize,
    pub skipped: usize,
}

impl RunSummary {
    pub fn from_results(results: &[TestResult]) -> Self {
        let tests = results.iter().filter(|r| !r.is_lifecycle);

        let mut summary = Self {
            total: 0,
            passed: 0,
            failed: 0,
            errors: 0,
            skipped: 0,
        };
        for result in tests {
            summary.total += 1;
            match result.status {
                RunStatus::Passed => summary.passed += 1,
                RunStatus::Failed => summary.failed += 1,
                RunStatus::Error => summary.errors += 1,
                RunStatus::Skipped => summary.skipped += 1,
            }
        }
        summary
    }

    pub fn all_passed(&self) -> bool {
        self.failed == 0 && self.errors == 0
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SuiteReport {
    /// Unique id of this engine invocation.
    pub execution_id: String,

    pub file_name: String,

    pub status: RunStatus,

    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: u64,

    pub summary: RunSummary,

    /// Test and lifecycle results in scheduler order.
    pub tests: Vec<TestResult>,
}

impl SuiteReport {
    /// Suite status: worst status across hook and test entries.
    pub fn aggregate_status(results: &[TestResult]) -> RunStatus {
        RunStatus::combine(results.iter().map(|r| r.status))
    }
}
