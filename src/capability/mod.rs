// Module: Capability
// Narrow driver surfaces the engine depends on: a browser page and an
// HTTP session. Concrete browser drivers live in the host process; the
// engine owns selector rewriting, timeouts, and assertion semantics.

pub mod http;

#[cfg(test)]
pub mod mock;

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;

// ============================================================================
// ERRORS
// ============================================================================

#[derive(Debug, Clone, thiserror::Error)]
pub enum PageError {
    /// The element condition did not hold within the allotted time.
    #[error("timed out after {timeout_ms}ms waiting for {condition} on '{selector}'")]
    Timeout {
        selector: String,
        condition: String,
        timeout_ms: u64,
    },

    /// The underlying driver failed (navigation error, crashed page, ...).
    #[error("browser driver error: {0}")]
    Driver(String),

    #[error("operation cancelled")]
    Cancelled,
}

impl PageError {
    pub fn timeout(selector: &str, condition: &str, timeout: Duration) -> Self {
        PageError::Timeout {
            selector: selector.to_string(),
            condition: condition.to_string(),
            timeout_ms: timeout.as_millis() as u64,
        }
    }
}

// ============================================================================
// BROWSER PAGE
// ============================================================================

/// Element readiness states for explicit waits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElementState {
    Attached,
    Visible,
    Hidden,
}

impl fmt::Display for ElementState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ElementState::Attached => write!(f, "attached"),
            ElementState::Visible => write!(f, "visible"),
            ElementState::Hidden => write!(f, "hidden"),
        }
    }
}

/// One browser page. Locator operations take the selector directly and
/// auto-wait for the target element up to the given timeout; an elapsed
/// wait surfaces as `PageError::Timeout` with the failed condition.
#[async_trait]
pub trait BrowserPage: Send {
    async fn goto(&mut self, url: &str, timeout: Duration) -> Result<(), PageError>;
    async fn title(&mut self) -> Result<String, PageError>;
    async fn current_url(&mut self) -> Result<String, PageError>;
    async fn wait_for_url(&mut self, pattern: &str, timeout: Duration) -> Result<(), PageError>;
    async fn wait_for_timeout(&mut self, duration: Duration);
    async fn press(&mut self, key: &str, timeout: Duration) -> Result<(), PageError>;
    async fn screenshot(&mut self) -> Result<Vec<u8>, PageError>;
    async fn close(&mut self) -> Result<(), PageError>;

    async fn click(&mut self, selector: &str, timeout: Duration) -> Result<(), PageError>;
    async fn fill(&mut self, selector: &str, value: &str, timeout: Duration)
        -> Result<(), PageError>;
    /// Keystroke-by-keystroke input, unlike `fill` which replaces.
    async fn type_text(
        &mut self,
        selector: &str,
        value: &str,
        timeout: Duration,
    ) -> Result<(), PageError>;
    async fn set_checked(
        &mut self,
        selector: &str,
        checked: bool,
        timeout: Duration,
    ) -> Result<(), PageError>;
    async fn hover(&mut self, selector: &str, timeout: Duration) -> Result<(), PageError>;
    async fn focus(&mut self, selector: &str, timeout: Duration) -> Result<(), PageError>;
    async fn drag_to(
        &mut self,
        source: &str,
        target: &str,
        timeout: Duration,
    ) -> Result<(), PageError>;
    async fn scroll_into_view(&mut self, selector: &str, timeout: Duration)
        -> Result<(), PageError>;
    async fn select_option(
        &mut self,
        selector: &str,
        value: &str,
        timeout: Duration,
    ) -> Result<(), PageError>;
    async fn wait_for(
        &mut self,
        selector: &str,
        state: ElementState,
        timeout: Duration,
    ) -> Result<(), PageError>;

    async fn text_content(
        &mut self,
        selector: &str,
        timeout: Duration,
    ) -> Result<String, PageError>;
    async fn get_attribute(
        &mut self,
        selector: &str,
        name: &str,
        timeout: Duration,
    ) -> Result<Option<String>, PageError>;
    async fn input_value(&mut self, selector: &str, timeout: Duration)
        -> Result<String, PageError>;
    async fn element_count(&mut self, selector: &str) -> Result<usize, PageError>;
}

/// Opens pages on demand; the scheduler acquires a page lazily on the
/// first web block of a scheduling unit.
#[async_trait]
pub trait PageFactory: Send + Sync {
    async fn open(&self, headless: bool) -> Result<Box<dyn BrowserPage>, PageError>;
}

/// Factory for hosts that run without a wired browser driver (e.g. the
/// bare CLI); every web block then reports a driver error.
pub struct NoBrowser;

#[async_trait]
impl PageFactory for NoBrowser {
    async fn open(&self, _headless: bool) -> Result<Box<dyn BrowserPage>, PageError> {
        Err(PageError::Driver(
            "no browser driver configured for this host".to_string(),
        ))
    }
}
