// Web blocks: navigation, interaction, assertions, retrieval. Selector
// rewriting, auto-wait polling, and timeout handling all live here; the
// BrowserPage capability stays a thin driver surface.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde_json::json;

use super::check;
use crate::capability::{ElementState, PageError};
use crate::context::ExecutionContext;
use crate::errors::StepFailure;
use crate::registry::{
    BlockCall, BlockCategory, BlockExecutor, BlockOutput, BlockRegistry, BlockSpec, Dispatcher,
    InputSpec,
};

/// How often assertion probes re-sample the page.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Driver-side wait per probe; the assertion loop owns the full timeout.
const PROBE_TIMEOUT: Duration = Duration::from_millis(250);

pub fn register(registry: &mut BlockRegistry) {
    let sel = || InputSpec::text("SELECTOR").required();
    let timeout = || InputSpec::number("TIMEOUT");

    registry.register(
        BlockSpec::statement(
            "web_navigate",
            BlockCategory::Web,
            vec![InputSpec::text("URL").required(), timeout()],
        ),
        Arc::new(NavigateBlock),
    );
    registry.register(
        BlockSpec::statement(
            "web_wait_for_url",
            BlockCategory::Web,
            vec![InputSpec::text("PATTERN").required(), timeout()],
        ),
        Arc::new(WaitForUrlBlock),
    );
    registry.register(
        BlockSpec::statement(
            "web_wait_for_timeout",
            BlockCategory::Web,
            vec![InputSpec::number("DURATION_MS").required()],
        ),
        Arc::new(WaitForTimeoutBlock),
    );
    registry.register(
        BlockSpec::statement("web_screenshot", BlockCategory::Web, vec![]),
        Arc::new(ScreenshotBlock),
    );

    // interactions
    let interactions: &[(&str, PageOp, Vec<InputSpec>)] = &[
        ("web_click", PageOp::Click, vec![sel(), timeout()]),
        (
            "web_fill",
            PageOp::Fill,
            vec![sel(), InputSpec::text("VALUE").required(), timeout()],
        ),
        (
            "web_type",
            PageOp::Type,
            vec![sel(), InputSpec::text("VALUE").required(), timeout()],
        ),
        (
            "web_press",
            PageOp::Press,
            vec![InputSpec::text("KEY").required(), timeout()],
        ),
        ("web_check", PageOp::Check, vec![sel(), timeout()]),
        ("web_uncheck", PageOp::Uncheck, vec![sel(), timeout()]),
        ("web_hover", PageOp::Hover, vec![sel(), timeout()]),
        ("web_focus", PageOp::Focus, vec![sel(), timeout()]),
        (
            "web_drag_to",
            PageOp::DragTo,
            vec![sel(), InputSpec::text("TARGET").required(), timeout()],
        ),
        (
            "web_scroll_into_view",
            PageOp::ScrollIntoView,
            vec![sel(), timeout()],
        ),
        (
            "web_select_option",
            PageOp::SelectOption,
            vec![sel(), InputSpec::text("VALUE").required(), timeout()],
        ),
        (
            "web_wait_for",
            PageOp::WaitFor,
            vec![
                sel(),
                InputSpec::dropdown("STATE").with_default(json!("visible")),
                timeout(),
            ],
        ),
    ];
    for (block_type, op, inputs) in interactions {
        registry.register(
            BlockSpec::statement(block_type, BlockCategory::Web, inputs.clone()),
            Arc::new(InteractionBlock { op: *op }),
        );
    }

    // assertions
    let probes: &[(&str, ProbeKind, Vec<InputSpec>)] = &[
        (
            "web_assert_text_equals",
            ProbeKind::TextEquals,
            vec![sel(), InputSpec::text("TEXT").required(), timeout()],
        ),
        (
            "web_assert_text_contains",
            ProbeKind::TextContains,
            vec![sel(), InputSpec::text("TEXT").required(), timeout()],
        ),
        (
            "web_assert_attribute",
            ProbeKind::Attribute,
            vec![
                sel(),
                InputSpec::text("NAME").required(),
                InputSpec::text("VALUE").required(),
                timeout(),
            ],
        ),
        (
            "web_assert_input_value",
            ProbeKind::InputValue,
            vec![sel(), InputSpec::text("VALUE").required(), timeout()],
        ),
        (
            "web_assert_count",
            ProbeKind::Count,
            vec![sel(), InputSpec::number("COUNT").required(), timeout()],
        ),
        (
            "web_assert_title",
            ProbeKind::Title,
            vec![InputSpec::text("TITLE").required(), timeout()],
        ),
        (
            "web_assert_url_contains",
            ProbeKind::UrlContains,
            vec![InputSpec::text("TEXT").required(), timeout()],
        ),
    ];
    for (block_type, kind, inputs) in probes {
        registry.register(
            BlockSpec::statement(block_type, BlockCategory::Web, inputs.clone()),
            Arc::new(WebAssertBlock { kind: *kind }),
        );
    }
    registry.register(
        BlockSpec::statement("web_assert_visible", BlockCategory::Web, vec![sel(), timeout()]),
        Arc::new(StateAssertBlock {
            state: ElementState::Visible,
        }),
    );
    registry.register(
        BlockSpec::statement("web_assert_hidden", BlockCategory::Web, vec![sel(), timeout()]),
        Arc::new(StateAssertBlock {
            state: ElementState::Hidden,
        }),
    );

    // retrieval (value-producing)
    let retrievals: &[(&str, RetrieveKind, Vec<InputSpec>)] = &[
        ("web_get_text", RetrieveKind::Text, vec![sel(), timeout()]),
        (
            "web_get_attribute",
            RetrieveKind::Attribute,
            vec![sel(), InputSpec::text("NAME").required(), timeout()],
        ),
        (
            "web_get_input_value",
            RetrieveKind::InputValue,
            vec![sel(), timeout()],
        ),
        ("web_get_count", RetrieveKind::Count, vec![sel()]),
        ("web_get_title", RetrieveKind::Title, vec![]),
        ("web_get_url", RetrieveKind::Url, vec![]),
    ];
    for (block_type, kind, inputs) in retrievals {
        registry.register(
            BlockSpec::value(block_type, BlockCategory::Web, inputs.clone()),
            Arc::new(RetrieveBlock { kind: *kind }),
        );
    }
}

// ============================================================================
// SHARED HELPERS
// ============================================================================

/// `testid:<value>` rewrites to `[<attribute>="<value>"]`; anything else
/// passes through as a native selector.
pub fn rewrite_selector(selector: &str, test_id_attribute: &str) -> String {
    match selector.strip_prefix("testid:") {
        Some(value) => format!("[{test_id_attribute}=\"{value}\"]"),
        None => selector.to_string(),
    }
}

fn op_timeout(call: &BlockCall<'_>, ctx: &ExecutionContext) -> Duration {
    call.params
        .opt_number("TIMEOUT")
        .map(|ms| Duration::from_millis(ms.max(0.0) as u64))
        .unwrap_or(ctx.web_timeout)
}

fn selector_of(call: &BlockCall<'_>, ctx: &ExecutionContext) -> Result<String, StepFailure> {
    Ok(rewrite_selector(
        call.params.text("SELECTOR")?,
        &ctx.test_id_attribute,
    ))
}

/// Interactions and retrievals fail hard; timeouts become assertion-style
/// failures carrying the unmet condition.
fn page_failure(error: PageError, block_type: &str) -> StepFailure {
    match error {
        PageError::Timeout {
            ref selector,
            ref condition,
            timeout_ms,
        } => StepFailure::assertion(error.to_string())
            .with_expected(format!("{condition} on '{selector}'"))
            .with_actual(format!("timed out after {timeout_ms}ms"))
            .with_step_type(block_type),
        PageError::Driver(message) => StepFailure::error(message).with_step_type(block_type),
        PageError::Cancelled => StepFailure::cancelled(),
    }
}

// ============================================================================
// NAVIGATION
// ============================================================================

struct NavigateBlock;

#[async_trait]
impl BlockExecutor for NavigateBlock {
    async fn execute(
        &self,
        call: &BlockCall<'_>,
        ctx: &mut ExecutionContext,
        _dispatcher: &Dispatcher,
    ) -> Result<BlockOutput, StepFailure> {
        let url = call.params.text("URL")?.to_string();
        let timeout = op_timeout(call, ctx);
        let block_type = call.block_type().to_string();

        let page = ctx.page().await?;
        page.goto(&url, timeout)
            .await
            .map_err(|e| page_failure(e, &block_type))?;

        Ok(BlockOutput::of(json!({ "_summary": format!("navigated to {url}") })))
    }
}

struct WaitForUrlBlock;

#[async_trait]
impl BlockExecutor for WaitForUrlBlock {
    async fn execute(
        &self,
        call: &BlockCall<'_>,
        ctx: &mut ExecutionContext,
        _dispatcher: &Dispatcher,
    ) -> Result<BlockOutput, StepFailure> {
        let pattern = call.params.text("PATTERN")?.to_string();
        let timeout = op_timeout(call, ctx);
        let block_type = call.block_type().to_string();

        let page = ctx.page().await?;
        page.wait_for_url(&pattern, timeout)
            .await
            .map_err(|e| page_failure(e, &block_type))?;

        Ok(BlockOutput::of(json!({ "_summary": format!("url matched {pattern}") })))
    }
}

struct WaitForTimeoutBlock;

#[async_trait]
impl BlockExecutor for WaitForTimeoutBlock {
    async fn execute(
        &self,
        call: &BlockCall<'_>,
        ctx: &mut ExecutionContext,
        _dispatcher: &Dispatcher,
    ) -> Result<BlockOutput, StepFailure> {
        let duration_ms = call.params.number("DURATION_MS")?.max(0.0) as u64;
        let duration = Duration::from_millis(duration_ms);
        let cancel = ctx.cancellation.clone();

        let page = ctx.page().await?;
        tokio::select! {
            _ = cancel.cancelled() => return Err(StepFailure::cancelled()),
            _ = page.wait_for_timeout(duration) => {}
        }
        Ok(BlockOutput::of(json!({ "_summary": format!("waited {duration_ms}ms") })))
    }
}

struct ScreenshotBlock;

#[async_trait]
impl BlockExecutor for ScreenshotBlock {
    async fn execute(
        &self,
        call: &BlockCall<'_>,
        ctx: &mut ExecutionContext,
        _dispatcher: &Dispatcher,
    ) -> Result<BlockOutput, StepFailure> {
        let block_type = call.block_type().to_string();
        let page = ctx.page().await?;
        let bytes = page
            .screenshot()
            .await
            .map_err(|e| page_failure(e, &block_type))?;

        Ok(BlockOutput::of(json!({
            "_summary": format!("screenshot ({} bytes)", bytes.len()),
            "_value": BASE64.encode(&bytes),
        })))
    }
}

// ============================================================================
// INTERACTIONS
// ============================================================================

#[derive(Debug, Clone, Copy)]
enum PageOp {
    Click,
    Fill,
    Type,
    Press,
    Check,
    Uncheck,
    Hover,
    Focus,
    DragTo,
    ScrollIntoView,
    SelectOption,
    WaitFor,
}

/// One executor for every element interaction; the driver auto-waits
/// for the target element up to the operation timeout.
struct InteractionBlock {
    op: PageOp,
}

#[async_trait]
impl BlockExecutor for InteractionBlock {
    async fn execute(
        &self,
        call: &BlockCall<'_>,
        ctx: &mut ExecutionContext,
        _dispatcher: &Dispatcher,
    ) -> Result<BlockOutput, StepFailure> {
        let timeout = op_timeout(call, ctx);
        let block_type = call.block_type().to_string();

        let selector = if matches!(self.op, PageOp::Press) {
            String::new()
        } else {
            selector_of(call, ctx)?
        };

        let summary = match self.op {
            PageOp::Press => {
                let key = call.params.text("KEY")?.to_string();
                let page = ctx.page().await?;
                page.press(&key, timeout)
                    .await
                    .map_err(|e| page_failure(e, &block_type))?;
                format!("pressed {key}")
            }
            PageOp::Click => {
                let page = ctx.page().await?;
                page.click(&selector, timeout)
                    .await
                    .map_err(|e| page_failure(e, &block_type))?;
                format!("clicked {selector}")
            }
            PageOp::Fill => {
                let value = call.params.text("VALUE")?.to_string();
                let page = ctx.page().await?;
                page.fill(&selector, &value, timeout)
                    .await
                    .map_err(|e| page_failure(e, &block_type))?;
                format!("filled {selector}")
            }
            PageOp::Type => {
                let value = call.params.text("VALUE")?.to_string();
                let page = ctx.page().await?;
                page.type_text(&selector, &value, timeout)
                    .await
                    .map_err(|e| page_failure(e, &block_type))?;
                format!("typed into {selector}")
            }
            PageOp::Check => {
                let page = ctx.page().await?;
                page.set_checked(&selector, true, timeout)
                    .await
                    .map_err(|e| page_failure(e, &block_type))?;
                format!("checked {selector}")
            }
            PageOp::Uncheck => {
                let page = ctx.page().await?;
                page.set_checked(&selector, false, timeout)
                    .await
                    .map_err(|e| page_failure(e, &block_type))?;
                format!("unchecked {selector}")
            }
            PageOp::Hover => {
                let page = ctx.page().await?;
                page.hover(&selector, timeout)
                    .await
                    .map_err(|e| page_failure(e, &block_type))?;
                format!("hovered {selector}")
            }
            PageOp::Focus => {
                let page = ctx.page().await?;
                page.focus(&selector, timeout)
                    .await
                    .map_err(|e| page_failure(e, &block_type))?;
                format!("focused {selector}")
            }
            PageOp::DragTo => {
                let target =
                    rewrite_selector(call.params.text("TARGET")?, &ctx.test_id_attribute);
                let page = ctx.page().await?;
                page.drag_to(&selector, &target, timeout)
                    .await
                    .map_err(|e| page_failure(e, &block_type))?;
                format!("dragged {selector} to {target}")
            }
            PageOp::ScrollIntoView => {
                let page = ctx.page().await?;
                page.scroll_into_view(&selector, timeout)
                    .await
                    .map_err(|e| page_failure(e, &block_type))?;
                format!("scrolled {selector} into view")
            }
            PageOp::SelectOption => {
                let value = call.params.text("VALUE")?.to_string();
                let page = ctx.page().await?;
                page.select_option(&selector, &value, timeout)
                    .await
                    .map_err(|e| page_failure(e, &block_type))?;
                format!("selected '{value}' in {selector}")
            }
            PageOp::WaitFor => {
                let state = parse_state(call.params.opt_text("STATE").unwrap_or("visible"))?;
                let page = ctx.page().await?;
                page.wait_for(&selector, state, timeout)
                    .await
                    .map_err(|e| page_failure(e, &block_type))?;
                format!("{selector} is {state}")
            }
        };

        Ok(BlockOutput::of(json!({ "_summary": summary })))
    }
}

fn parse_state(text: &str) -> Result<ElementState, StepFailure> {
    match text {
        "attached" => Ok(ElementState::Attached),
        "visible" => Ok(ElementState::Visible),
        "hidden" => Ok(ElementState::Hidden),
        other => Err(StepFailure::error(format!("unknown element state '{other}'"))),
    }
}

// ============================================================================
// ASSERTIONS
// ============================================================================

#[derive(Debug, Clone, Copy)]
enum ProbeKind {
    TextEquals,
    TextContains,
    Attribute,
    InputValue,
    Count,
    Title,
    UrlContains,
}

/// Polling assertions: re-sample the page until the condition holds or
/// the timeout elapses, then route the failure through the soft/hard
/// assertion gate.
struct WebAssertBlock {
    kind: ProbeKind,
}

impl WebAssertBlock {
    fn expected_of(&self, call: &BlockCall<'_>) -> Result<String, StepFailure> {
        let text = match self.kind {
            ProbeKind::TextEquals | ProbeKind::TextContains | ProbeKind::UrlContains => {
                call.params.text("TEXT")?
            }
            ProbeKind::Attribute | ProbeKind::InputValue => call.params.text("VALUE")?,
            ProbeKind::Count => return Ok(format!("{}", call.params.number("COUNT")? as i64)),
            ProbeKind::Title => call.params.text("TITLE")?,
        };
        Ok(text.to_string())
    }

    fn condition(&self, expected: &str) -> String {
        match self.kind {
            ProbeKind::TextEquals => format!("text == '{expected}'"),
            ProbeKind::TextContains => format!("text contains '{expected}'"),
            ProbeKind::Attribute => format!("attribute == '{expected}'"),
            ProbeKind::InputValue => format!("input value == '{expected}'"),
            ProbeKind::Count => format!("count == {expected}"),
            ProbeKind::Title => format!("title == '{expected}'"),
            ProbeKind::UrlContains => format!("url contains '{expected}'"),
        }
    }
}

#[async_trait]
impl BlockExecutor for WebAssertBlock {
    async fn execute(
        &self,
        call: &BlockCall<'_>,
        ctx: &mut ExecutionContext,
        _dispatcher: &Dispatcher,
    ) -> Result<BlockOutput, StepFailure> {
        let needs_selector = !matches!(self.kind, ProbeKind::Title | ProbeKind::UrlContains);
        let selector = if needs_selector {
            selector_of(call, ctx)?
        } else {
            String::new()
        };
        let expected = self.expected_of(call)?;
        let attribute = match self.kind {
            ProbeKind::Attribute => call.params.text("NAME")?.to_string(),
            _ => String::new(),
        };
        let timeout = op_timeout(call, ctx);
        let block_type = call.block_type().to_string();
        let deadline = Instant::now() + timeout;
        let kind = self.kind;

        loop {
            ctx.check_cancelled()?;

            let probe = {
                let page = ctx.page().await?;
                let sampled: Result<String, PageError> = match kind {
                    ProbeKind::TextEquals | ProbeKind::TextContains => {
                        page.text_content(&selector, PROBE_TIMEOUT).await
                    }
                    ProbeKind::Attribute => page
                        .get_attribute(&selector, &attribute, PROBE_TIMEOUT)
                        .await
                        .map(|v| v.unwrap_or_default()),
                    ProbeKind::InputValue => page.input_value(&selector, PROBE_TIMEOUT).await,
                    ProbeKind::Count => {
                        page.element_count(&selector).await.map(|n| n.to_string())
                    }
                    ProbeKind::Title => page.title().await,
                    ProbeKind::UrlContains => page.current_url().await,
                };
                sampled
            };

            let actual = match probe {
                Ok(value) => value,
                // element not there yet: keep polling until the deadline
                Err(PageError::Timeout { .. }) => "<element not found>".to_string(),
                Err(PageError::Driver(message)) => {
                    return Err(StepFailure::error(message).with_step_type(block_type.as_str()))
                }
                Err(PageError::Cancelled) => return Err(StepFailure::cancelled()),
            };

            let passed = match kind {
                ProbeKind::TextEquals | ProbeKind::Attribute | ProbeKind::InputValue
                | ProbeKind::Title => actual == expected,
                ProbeKind::TextContains | ProbeKind::UrlContains => actual.contains(&expected),
                ProbeKind::Count => actual == expected,
            };

            if passed {
                return Ok(BlockOutput::of(json!({
                    "_summary": self.condition(&expected)
                })));
            }

            if Instant::now() >= deadline {
                let condition = self.condition(&expected);
                let summary = condition.clone();
                let expected_text = expected.clone();
                let block_type_owned = block_type.clone();
                let selector_owned = selector.clone();
                let timeout_ms = timeout.as_millis() as u64;
                check(ctx, false, move || {
                    let location = if selector_owned.is_empty() {
                        String::new()
                    } else {
                        format!(" on '{selector_owned}'")
                    };
                    StepFailure::assertion(format!(
                        "expected {condition}{location}, got '{actual}' after {timeout_ms}ms"
                    ))
                    .with_expected(expected_text)
                    .with_actual(actual)
                    .with_step_type(block_type_owned)
                })?;
                // soft mode: the failure is buffered and the step proceeds
                return Ok(BlockOutput::of(json!({ "_summary": summary })));
            }

            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }
}

/// Visibility assertions lean on the driver's own state wait.
struct StateAssertBlock {
    state: ElementState,
}

#[async_trait]
impl BlockExecutor for StateAssertBlock {
    async fn execute(
        &self,
        call: &BlockCall<'_>,
        ctx: &mut ExecutionContext,
        _dispatcher: &Dispatcher,
    ) -> Result<BlockOutput, StepFailure> {
        let selector = selector_of(call, ctx)?;
        let timeout = op_timeout(call, ctx);
        let block_type = call.block_type().to_string();
        let state = self.state;

        let waited = {
            let page = ctx.page().await?;
            page.wait_for(&selector, state, timeout).await
        };

        match waited {
            Ok(()) => Ok(BlockOutput::of(json!({
                "_summary": format!("{selector} is {state}")
            }))),
            Err(PageError::Timeout { timeout_ms, .. }) => {
                let selector_owned = selector.clone();
                check(ctx, false, move || {
                    StepFailure::assertion(format!(
                        "expected '{selector_owned}' to be {state}, still not after {timeout_ms}ms"
                    ))
                    .with_expected(format!("{state}"))
                    .with_actual(format!("not {state} after {timeout_ms}ms"))
                    .with_step_type(block_type)
                })?;
                Ok(BlockOutput::of(json!({
                    "_summary": format!("{selector} is {state}")
                })))
            }
            Err(error) => Err(page_failure(error, &block_type)),
        }
    }
}

// ============================================================================
// RETRIEVAL
// ============================================================================

#[derive(Debug, Clone, Copy)]
enum RetrieveKind {
    Text,
    Attribute,
    InputValue,
    Count,
    Title,
    Url,
}

/// Value-producing blocks; the retrieved value rides in `output._value`.
struct RetrieveBlock {
    kind: RetrieveKind,
}

#[async_trait]
impl BlockExecutor for RetrieveBlock {
    async fn execute(
        &self,
        call: &BlockCall<'_>,
        ctx: &mut ExecutionContext,
        _dispatcher: &Dispatcher,
    ) -> Result<BlockOutput, StepFailure> {
        let timeout = op_timeout(call, ctx);
        let block_type = call.block_type().to_string();

        let (value, summary) = match self.kind {
            RetrieveKind::Text => {
                let selector = selector_of(call, ctx)?;
                let page = ctx.page().await?;
                let text = page
                    .text_content(&selector, timeout)
                    .await
                    .map_err(|e| page_failure(e, &block_type))?;
                (json!(text), format!("text of {selector}"))
            }
            RetrieveKind::Attribute => {
                let selector = selector_of(call, ctx)?;
                let name = call.params.text("NAME")?.to_string();
                let page = ctx.page().await?;
                let attr = page
                    .get_attribute(&selector, &name, timeout)
                    .await
                    .map_err(|e| page_failure(e, &block_type))?;
                (json!(attr), format!("attribute {name} of {selector}"))
            }
            RetrieveKind::InputValue => {
                let selector = selector_of(call, ctx)?;
                let page = ctx.page().await?;
                let value = page
                    .input_value(&selector, timeout)
                    .await
                    .map_err(|e| page_failure(e, &block_type))?;
                (json!(value), format!("value of {selector}"))
            }
            RetrieveKind::Count => {
                let selector = selector_of(call, ctx)?;
                let page = ctx.page().await?;
                let count = page
                    .element_count(&selector)
                    .await
                    .map_err(|e| page_failure(e, &block_type))?;
                (json!(count), format!("count of {selector}"))
            }
            RetrieveKind::Title => {
                let page = ctx.page().await?;
                let title = page
                    .title()
                    .await
                    .map_err(|e| page_failure(e, &block_type))?;
                (json!(title), "page title".to_string())
            }
            RetrieveKind::Url => {
                let page = ctx.page().await?;
                let url = page
                    .current_url()
                    .await
                    .map_err(|e| page_failure(e, &block_type))?;
                (json!(url), "page url".to_string())
            }
        };

        Ok(BlockOutput::of(json!({
            "_value": value,
            "_summary": summary,
        })))
    }
}
