// Module: Context
// Per-unit execution state: the variable scope chain, browser page and
// HTTP session handles, captured logger, soft-assertion buffer, and the
// cooperative cancel signal.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::capability::http::{HttpResponseData, HttpSession};
use crate::capability::{BrowserPage, PageFactory};
use crate::errors::StepFailure;
use crate::protocol::{RunOptions, TestStep, DEFAULT_TEST_ID_ATTRIBUTE};
use crate::report::{LogLevel, LogLine, SoftAssertionError};

// ============================================================================
// SCOPE CHAIN
// ============================================================================

/// Kind of a variable frame. Lookup ignores kinds; writes use them to
/// pick the innermost writable target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeKind {
    /// Process-wide globals, read-only during execution.
    Global,
    File,
    Procedure,
    DataRow,
    Loop,
}

#[derive(Debug, Clone)]
pub struct ScopeFrame {
    pub kind: ScopeKind,
    pub vars: Map<String, Value>,
}

/// Ordered stack of variable frames; resolution walks innermost first.
/// The chain always holds at least the global frame.
#[derive(Debug, Clone)]
pub struct ScopeChain {
    frames: Vec<ScopeFrame>,
}

impl ScopeChain {
    pub fn new(globals: Map<String, Value>) -> Self {
        Self {
            frames: vec![ScopeFrame {
                kind: ScopeKind::Global,
                vars: globals,
            }],
        }
    }

    pub fn push(&mut self, kind: ScopeKind, vars: Map<String, Value>) {
        self.frames.push(ScopeFrame { kind, vars });
    }

    /// Pops the innermost frame; the global frame is never popped.
    pub fn pop(&mut self) -> Option<ScopeFrame> {
        if self.frames.len() > 1 {
            self.frames.pop()
        } else {
            None
        }
    }

    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    /// Resolves a dotted path: the innermost frame binding the first
    /// segment wins, then the remaining segments index into that value.
    /// A missing intermediate resolves the whole path to nothing.
    pub fn resolve_path(&self, path: &[String]) -> Option<&Value> {
        let (first, rest) = path.split_first()?;
        for frame in self.frames.iter().rev() {
            if let Some(root) = frame.vars.get(first) {
                let mut current = root;
                for segment in rest {
                    current = current.get(segment)?;
                }
                return Some(current);
            }
        }
        None
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.frames.iter().rev().find_map(|frame| frame.vars.get(name))
    }

    /// Writes to the innermost non-global frame already binding `name`;
    /// otherwise to the innermost file frame. Never to the global frame.
    pub fn set(&mut self, name: &str, value: Value) {
        for frame in self.frames.iter_mut().rev() {
            if frame.kind != ScopeKind::Global && frame.vars.contains_key(name) {
                frame.vars.insert(name.to_string(), value);
                return;
            }
        }
        if let Some(frame) = self
            .frames
            .iter_mut()
            .rev()
            .find(|f| f.kind == ScopeKind::File)
        {
            frame.vars.insert(name.to_string(), value);
            return;
        }
        // No file frame on the chain (engine-internal use only): fall back
        // to the innermost frame so the write is at least visible.
        if let Some(frame) = self.frames.last_mut() {
            frame.vars.insert(name.to_string(), value);
        }
    }

    /// Pops frames until the chain is `depth` frames deep again. Used by
    /// the scheduler to rebalance after a test, whatever the body did.
    pub fn truncate(&mut self, depth: usize) {
        while self.frames.len() > depth.max(1) {
            self.frames.pop();
        }
    }
}

// ============================================================================
// STEP LOGGER
// ============================================================================

/// Captures log lines with step attribution for the report, mirroring
/// them to `tracing`.
#[derive(Debug, Default)]
pub struct StepLogger {
    lines: Vec<LogLine>,
    current_step: Option<String>,
}

impl StepLogger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_step(&mut self, step_id: Option<String>) {
        self.current_step = step_id;
    }

    pub fn log(&mut self, level: LogLevel, message: impl Into<String>) {
        let message = message.into();
        let step = self.current_step.as_deref().unwrap_or("-");
        match level {
            LogLevel::Debug => debug!(step_id = %step, "{message}"),
            LogLevel::Info => info!(step_id = %step, "{message}"),
            LogLevel::Warn => warn!(step_id = %step, "{message}"),
            LogLevel::Error => error!(step_id = %step, "{message}"),
        }
        self.lines.push(LogLine {
            level,
            message,
            step_id: self.current_step.clone(),
            timestamp: Utc::now(),
        });
    }

    pub fn info(&mut self, message: impl Into<String>) {
        self.log(LogLevel::Info, message);
    }

    pub fn warn(&mut self, message: impl Into<String>) {
        self.log(LogLevel::Warn, message);
    }

    pub fn error(&mut self, message: impl Into<String>) {
        self.log(LogLevel::Error, message);
    }

    pub fn debug(&mut self, message: impl Into<String>) {
        self.log(LogLevel::Debug, message);
    }

    pub fn mark(&self) -> usize {
        self.lines.len()
    }

    /// Takes the lines recorded since `mark`, leaving earlier ones.
    pub fn take_since(&mut self, mark: usize) -> Vec<LogLine> {
        if mark >= self.lines.len() {
            Vec::new()
        } else {
            self.lines.split_off(mark)
        }
    }
}

// ============================================================================
// EXECUTION CONTEXT
// ============================================================================

/// Mutable state threaded through every block of a scheduling unit.
///
/// The browser page and HTTP session are acquired lazily on first use
/// and live until the unit releases them; the soft-assertion buffer and
/// skip/failure-handler state are reset per test by the scheduler.
pub struct ExecutionContext {
    pub scopes: ScopeChain,
    pub logger: StepLogger,

    pub soft_assertions: bool,
    pub soft_assertion_errors: Vec<SoftAssertionError>,

    /// Attribute used by the `testid:` selector shorthand.
    pub test_id_attribute: String,

    /// Default per-operation timeout for web blocks.
    pub web_timeout: Duration,

    pub cancellation: CancellationToken,

    pub last_response: Option<HttpResponseData>,

    /// Set by `skip_if`; short-circuits the remainder of the test.
    pub skip_requested: Option<String>,

    /// Bodies registered by `on_failure`, run at teardown when the test
    /// body is failing.
    pub failure_handlers: Vec<TestStep>,

    /// Active procedure call chain, for recursion diagnostics.
    pub procedure_stack: Vec<String>,
    pub max_recursion_depth: u32,

    headless: bool,
    page_factory: Arc<dyn PageFactory>,
    page: Option<Box<dyn BrowserPage>>,
    http: Option<HttpSession>,
}

impl ExecutionContext {
    pub fn new(
        globals: Map<String, Value>,
        test_id_attribute: Option<String>,
        options: &RunOptions,
        page_factory: Arc<dyn PageFactory>,
    ) -> Self {
        Self {
            scopes: ScopeChain::new(globals),
            logger: StepLogger::new(),
            soft_assertions: false,
            soft_assertion_errors: Vec::new(),
            test_id_attribute: test_id_attribute
                .unwrap_or_else(|| DEFAULT_TEST_ID_ATTRIBUTE.to_string()),
            web_timeout: Duration::from_millis(options.web_timeout_ms),
            cancellation: options.cancel.clone(),
            last_response: None,
            skip_requested: None,
            failure_handlers: Vec::new(),
            procedure_stack: Vec::new(),
            max_recursion_depth: options.max_recursion_depth,
            headless: options.headless,
            page_factory,
            page: None,
            http: None,
        }
    }

    /// Fails fast when the unit's cancel signal is set.
    pub fn check_cancelled(&self) -> Result<(), StepFailure> {
        if self.cancellation.is_cancelled() {
            Err(StepFailure::cancelled())
        } else {
            Ok(())
        }
    }

    /// The unit's browser page, opened on first use.
    pub async fn page(&mut self) -> Result<&mut (dyn BrowserPage + '_), StepFailure> {
        if self.page.is_none() {
            let factory = Arc::clone(&self.page_factory);
            let page = factory
                .open(self.headless)
                .await
                .map_err(|e| StepFailure::error(e.to_string()))?;
            self.page = Some(page);
        }
        match self.page.as_deref_mut() {
            Some(page) => Ok(page),
            None => Err(StepFailure::error("browser page unavailable")),
        }
    }

    pub fn has_page(&self) -> bool {
        self.page.is_some()
    }

    /// The unit's HTTP session, created on first use.
    pub fn http(&mut self) -> Result<&mut HttpSession, StepFailure> {
        if self.http.is_none() {
            let session = HttpSession::new(self.web_timeout)
                .map_err(|e| StepFailure::error(e.to_string()))?;
            self.http = Some(session);
        }
        match self.http.as_mut() {
            Some(session) => Ok(session),
            None => Err(StepFailure::error("http session unavailable")),
        }
    }

    pub fn record_soft_failure(&mut self, failure: &StepFailure) {
        self.soft_assertion_errors.push(SoftAssertionError {
            message: failure.message.clone(),
            step_type: failure.step_type.clone(),
            expected: failure.expected.clone(),
            actual: failure.actual.clone(),
            timestamp: Utc::now(),
        });
    }

    pub fn soft_mark(&self) -> usize {
        self.soft_assertion_errors.len()
    }

    /// Clears per-test state. The page, HTTP session, and unit-level
    /// variable frames deliberately survive (hooks share them).
    pub fn reset_for_test(&mut self, soft_assertions: bool) {
        self.soft_assertions = soft_assertions;
        self.soft_assertion_errors.clear();
        self.skip_requested = None;
        self.failure_handlers.clear();
        self.procedure_stack.clear();
    }

    /// Releases unit-owned resources; called once when the unit ends.
    pub async fn release(&mut self) {
        if let Some(mut page) = self.page.take() {
            if let Err(e) = page.close().await {
                warn!(error = %e, "failed to close browser page");
            }
        }
        self.http = None;
        self.last_response = None;
    }
}
