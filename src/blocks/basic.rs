// Basic blocks: log, set_variable, wait, assert_equals.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use super::check;
use crate::context::ExecutionContext;
use crate::errors::StepFailure;
use crate::registry::{
    BlockCall, BlockCategory, BlockExecutor, BlockOutput, BlockRegistry, BlockSpec, Dispatcher,
    InputSpec,
};

pub fn register(registry: &mut BlockRegistry) {
    registry.register(
        BlockSpec::statement(
            "log",
            BlockCategory::Basic,
            vec![InputSpec::text("MESSAGE").required()],
        ),
        Arc::new(LogBlock),
    );
    registry.register(
        BlockSpec::statement(
            "set_variable",
            BlockCategory::Basic,
            vec![
                InputSpec::text("NAME").required(),
                InputSpec::text("VALUE").required(),
            ],
        ),
        Arc::new(SetVariableBlock),
    );
    registry.register(
        BlockSpec::statement(
            "wait",
            BlockCategory::Basic,
            vec![InputSpec::number("DURATION_MS").required()],
        ),
        Arc::new(WaitBlock),
    );
    registry.register(
        BlockSpec::statement(
            "assert_equals",
            BlockCategory::Basic,
            vec![
                InputSpec::text("A").required(),
                InputSpec::text("B").required(),
            ],
        ),
        Arc::new(AssertEqualsBlock),
    );
}

// ============================================================================
// LOG
// ============================================================================

/// Writes a resolved message to the captured logger; the message doubles
/// as the step summary.
struct LogBlock;

#[async_trait]
impl BlockExecutor for LogBlock {
    async fn execute(
        &self,
        call: &BlockCall<'_>,
        ctx: &mut ExecutionContext,
        _dispatcher: &Dispatcher,
    ) -> Result<BlockOutput, StepFailure> {
        let message = call.params.text("MESSAGE")?.to_string();
        ctx.logger.info(message.clone());
        Ok(BlockOutput::of(json!({ "_summary": message })))
    }
}

// ============================================================================
// SET VARIABLE
// ============================================================================

/// Writes to the innermost scope already binding the name, else the file
/// scope. The value string is JSON-aware: `123`, `true`, `[1,2]` coerce
/// to their JSON types, anything else stays a string.
struct SetVariableBlock;

#[async_trait]
impl BlockExecutor for SetVariableBlock {
    async fn execute(
        &self,
        call: &BlockCall<'_>,
        ctx: &mut ExecutionContext,
        _dispatcher: &Dispatcher,
    ) -> Result<BlockOutput, StepFailure> {
        let name = call.params.text("NAME")?.to_string();
        let text = call.params.text("VALUE")?.to_string();
        let value: Value = serde_json::from_str(&text).unwrap_or(Value::String(text.clone()));

        ctx.scopes.set(&name, value);
        Ok(BlockOutput::of(json!({
            "_summary": format!("{name} = {text}")
        })))
    }
}

// ============================================================================
// WAIT
// ============================================================================

/// Suspends for a fixed duration, observing the cancel signal.
struct WaitBlock;

#[async_trait]
impl BlockExecutor for WaitBlock {
    async fn execute(
        &self,
        call: &BlockCall<'_>,
        ctx: &mut ExecutionContext,
        _dispatcher: &Dispatcher,
    ) -> Result<BlockOutput, StepFailure> {
        let duration_ms = call.params.number("DURATION_MS")?.max(0.0) as u64;
        let duration = Duration::from_millis(duration_ms);

        tokio::select! {
            _ = ctx.cancellation.cancelled() => Err(StepFailure::cancelled()),
            _ = tokio::time::sleep(duration) => Ok(BlockOutput::of(json!({
                "_summary": format!("waited {duration_ms}ms")
            }))),
        }
    }
}

// ============================================================================
// ASSERT EQUALS
// ============================================================================

/// Compares two resolved operands; numeric when both parse as numbers,
/// string equality otherwise. `B` is the expected side.
struct AssertEqualsBlock;

#[async_trait]
impl BlockExecutor for AssertEqualsBlock {
    async fn execute(
        &self,
        call: &BlockCall<'_>,
        ctx: &mut ExecutionContext,
        _dispatcher: &Dispatcher,
    ) -> Result<BlockOutput, StepFailure> {
        let a = call.params.text("A")?.to_string();
        let b = call.params.text("B")?.to_string();

        let passed = match (a.trim().parse::<f64>(), b.trim().parse::<f64>()) {
            (Ok(left), Ok(right)) => left == right,
            _ => a == b,
        };

        let block_type = call.block_type().to_string();
        check(ctx, passed, || {
            StepFailure::assertion(format!("expected '{b}', got '{a}'"))
                .with_expected(b.as_str())
                .with_actual(a.as_str())
                .with_step_type(block_type.as_str())
        })?;

        Ok(BlockOutput::of(json!({
            "_summary": format!("{a} == {b}")
        })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::NoBrowser;
    use crate::context::ScopeKind;
    use crate::procedures::ProcedureTable;
    use crate::protocol::{RunOptions, TestStep};
    use crate::registry::BlockRegistry;
    use crate::report::RunStatus;
    use serde_json::Map;

    fn dispatcher() -> Dispatcher {
        let mut registry = BlockRegistry::new();
        register(&mut registry);
        Dispatcher::new(registry, ProcedureTable::new())
    }

    fn ctx() -> ExecutionContext {
        let mut ctx = ExecutionContext::new(
            Map::new(),
            None,
            &RunOptions::default(),
            Arc::new(NoBrowser),
        );
        ctx.scopes.push(ScopeKind::File, Map::new());
        ctx
    }

    fn step(id: &str, block_type: &str, params: Value) -> TestStep {
        serde_json::from_value(json!({"id": id, "type": block_type, "params": params})).unwrap()
    }

    #[tokio::test]
    async fn log_resolves_variables_into_summary() {
        let dispatcher = dispatcher();
        let mut ctx = ctx();
        ctx.scopes.set("user", json!("alice"));

        let result = dispatcher
            .run_step(
                &step("s1", "log", json!({"MESSAGE": "hello ${user}"})),
                &mut ctx,
            )
            .await;

        assert_eq!(result.status, RunStatus::Passed);
        assert_eq!(result.summary.as_deref(), Some("hello alice"));
        assert_eq!(result.logs.len(), 1);
    }

    #[tokio::test]
    async fn set_variable_is_json_aware() {
        let dispatcher = dispatcher();
        let mut ctx = ctx();

        dispatcher
            .run_step(
                &step("s1", "set_variable", json!({"NAME": "n", "VALUE": "42"})),
                &mut ctx,
            )
            .await;
        dispatcher
            .run_step(
                &step("s2", "set_variable", json!({"NAME": "s", "VALUE": "plain"})),
                &mut ctx,
            )
            .await;

        assert_eq!(ctx.scopes.get("n"), Some(&json!(42)));
        assert_eq!(ctx.scopes.get("s"), Some(&json!("plain")));
    }

    #[tokio::test]
    async fn assert_equals_compares_numerically() {
        let dispatcher = dispatcher();
        let mut ctx = ctx();

        let result = dispatcher
            .run_step(
                &step("s1", "assert_equals", json!({"A": "1.0", "B": "1"})),
                &mut ctx,
            )
            .await;
        assert_eq!(result.status, RunStatus::Passed);

        let result = dispatcher
            .run_step(
                &step("s2", "assert_equals", json!({"A": "2", "B": "1"})),
                &mut ctx,
            )
            .await;
        assert_eq!(result.status, RunStatus::Failed);
        let error = result.error.unwrap();
        assert_eq!(error.expected.as_deref(), Some("1"));
        assert_eq!(error.actual.as_deref(), Some("2"));
        assert_eq!(error.step_type.as_deref(), Some("assert_equals"));
    }

    #[tokio::test]
    async fn soft_mode_buffers_assert_failures() {
        let dispatcher = dispatcher();
        let mut ctx = ctx();
        ctx.soft_assertions = true;

        let result = dispatcher
            .run_step(
                &step("s1", "assert_equals", json!({"A": "x", "B": "y"})),
                &mut ctx,
            )
            .await;

        assert_eq!(result.status, RunStatus::Passed);
        assert_eq!(result.soft_assertion_errors.len(), 1);
        assert_eq!(ctx.soft_assertion_errors.len(), 1);
        assert_eq!(
            ctx.soft_assertion_errors[0].expected.as_deref(),
            Some("y")
        );
    }

    #[tokio::test]
    async fn wait_observes_cancellation() {
        let dispatcher = dispatcher();
        let mut ctx = ctx();
        ctx.cancellation.cancel();

        // cancel is checked at block entry, before the timer starts
        let result = dispatcher
            .run_step(
                &step("s1", "wait", json!({"DURATION_MS": 60000})),
                &mut ctx,
            )
            .await;
        assert_eq!(result.status, RunStatus::Skipped);
    }
}
