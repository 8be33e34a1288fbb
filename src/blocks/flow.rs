// Control-flow blocks: if, compare, repeat, for_each, try_catch, retry,
// skip_if, on_failure. All containers run their statement slots through
// the dispatcher inside a pushed loop-local scope.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use serde_json::{json, Map, Value};
use tracing::info;

use super::{eval_value_step, list_failure, truthy};
use crate::context::{ExecutionContext, ScopeKind};
use crate::errors::StepFailure;
use crate::registry::{
    BlockCall, BlockCategory, BlockExecutor, BlockOutput, BlockRegistry, BlockSpec, Dispatcher,
    InputSpec, ListOutcome,
};
use crate::report::StepResult;

pub fn register(registry: &mut BlockRegistry) {
    registry.register(
        BlockSpec::statement(
            "if",
            BlockCategory::Flow,
            vec![
                InputSpec::value("CONDITION").required(),
                InputSpec::statement("THEN"),
                InputSpec::statement("ELSE"),
            ],
        ),
        Arc::new(IfBlock),
    );
    registry.register(
        BlockSpec::value(
            "compare",
            BlockCategory::Flow,
            vec![
                InputSpec::text("A").required(),
                InputSpec::text("B").required(),
                InputSpec::dropdown("OPERATOR").with_default(json!("eq")),
            ],
        ),
        Arc::new(CompareBlock),
    );
    registry.register(
        BlockSpec::statement(
            "repeat",
            BlockCategory::Flow,
            vec![
                InputSpec::number("TIMES").required(),
                InputSpec::statement("BODY"),
            ],
        ),
        Arc::new(RepeatBlock),
    );
    registry.register(
        BlockSpec::statement(
            "for_each",
            BlockCategory::Flow,
            vec![
                InputSpec::text("ITEMS").required(),
                InputSpec::statement("BODY"),
            ],
        ),
        Arc::new(ForEachBlock),
    );
    registry.register(
        BlockSpec::statement(
            "try_catch",
            BlockCategory::Flow,
            vec![
                InputSpec::statement("TRY"),
                InputSpec::statement("CATCH"),
            ],
        ),
        Arc::new(TryCatchBlock),
    );
    registry.register(
        BlockSpec::statement(
            "retry",
            BlockCategory::Flow,
            vec![
                InputSpec::number("MAX_ATTEMPTS").with_default(json!(3)),
                InputSpec::number("BACKOFF_MS").with_default(json!(500)),
                InputSpec::number("BACKOFF_FACTOR").with_default(json!(2.0)),
                InputSpec::statement("BODY"),
            ],
        ),
        Arc::new(RetryBlock),
    );
    registry.register(
        BlockSpec::statement(
            "skip_if",
            BlockCategory::Flow,
            vec![
                InputSpec::value("CONDITION").required(),
                InputSpec::text("REASON"),
            ],
        ),
        Arc::new(SkipIfBlock),
    );
    registry.register(
        BlockSpec::statement(
            "on_failure",
            BlockCategory::Flow,
            vec![InputSpec::statement("BODY")],
        ),
        Arc::new(OnFailureBlock),
    );
}

/// Runs a slot inside a fresh loop-local frame, rebalancing the scope
/// chain whatever the body did.
async fn run_slot(
    dispatcher: &Dispatcher,
    steps: &[crate::protocol::TestStep],
    ctx: &mut ExecutionContext,
    bindings: Map<String, Value>,
) -> (Vec<StepResult>, ListOutcome) {
    let depth = ctx.scopes.depth();
    ctx.scopes.push(ScopeKind::Loop, bindings);
    let outcome = dispatcher.run_steps(steps, ctx).await;
    ctx.scopes.truncate(depth);
    outcome
}

// ============================================================================
// IF
// ============================================================================

/// Evaluates its condition value and runs the THEN slot, or the ELSE
/// slot when the condition is falsy.
struct IfBlock;

#[async_trait]
impl BlockExecutor for IfBlock {
    async fn execute(
        &self,
        call: &BlockCall<'_>,
        ctx: &mut ExecutionContext,
        dispatcher: &Dispatcher,
    ) -> Result<BlockOutput, StepFailure> {
        let condition = call
            .params
            .value_step("CONDITION")?
            .ok_or_else(|| StepFailure::error("required input 'CONDITION' is missing"))?;

        let (value, condition_result) = eval_value_step(&condition, ctx, dispatcher).await?;
        let mut children = vec![condition_result];

        let branch = if truthy(&value) { "THEN" } else { "ELSE" };
        let (results, outcome) =
            run_slot(dispatcher, call.step.slot(branch), ctx, Map::new()).await;
        children.extend(results);

        match outcome {
            ListOutcome::Completed | ListOutcome::Skipped => Ok(BlockOutput::of(json!({
                "_summary": format!("took {} branch", branch)
            }))
            .with_children(children)),
            ListOutcome::Aborted => Err(list_failure("if branch", children)),
            ListOutcome::Cancelled => Err(StepFailure::cancelled().with_children(children)),
        }
    }
}

// ============================================================================
// COMPARE (value block)
// ============================================================================

/// Compares two resolved operands; numeric when both parse as numbers,
/// string comparison otherwise.
struct CompareBlock;

#[async_trait]
impl BlockExecutor for CompareBlock {
    async fn execute(
        &self,
        call: &BlockCall<'_>,
        _ctx: &mut ExecutionContext,
        _dispatcher: &Dispatcher,
    ) -> Result<BlockOutput, StepFailure> {
        let a = call.params.text("A")?.to_string();
        let b = call.params.text("B")?.to_string();
        let operator = call.params.text("OPERATOR")?.to_string();

        let numeric = (a.trim().parse::<f64>(), b.trim().parse::<f64>());
        let result = match (&operator[..], numeric) {
            ("eq", (Ok(x), Ok(y))) => x == y,
            ("neq", (Ok(x), Ok(y))) => x != y,
            ("lt", (Ok(x), Ok(y))) => x < y,
            ("gt", (Ok(x), Ok(y))) => x > y,
            ("lte" | "le", (Ok(x), Ok(y))) => x <= y,
            ("gte" | "ge", (Ok(x), Ok(y))) => x >= y,
            ("eq", _) => a == b,
            ("neq", _) => a != b,
            ("lt", _) => a < b,
            ("gt", _) => a > b,
            ("lte" | "le", _) => a <= b,
            ("gte" | "ge", _) => a >= b,
            ("contains", _) => a.contains(&b),
            (other, _) => {
                return Err(StepFailure::error(format!("unknown operator '{other}'")))
            }
        };

        Ok(BlockOutput::of(json!({
            "_value": result,
            "_summary": format!("{a} {operator} {b} -> {result}")
        })))
    }
}

// ============================================================================
// REPEAT
// ============================================================================

/// Runs the body a fixed number of times, aborting on first failure.
struct RepeatBlock;

#[async_trait]
impl BlockExecutor for RepeatBlock {
    async fn execute(
        &self,
        call: &BlockCall<'_>,
        ctx: &mut ExecutionContext,
        dispatcher: &Dispatcher,
    ) -> Result<BlockOutput, StepFailure> {
        let times = call.params.number("TIMES")?.max(0.0) as u64;
        let body = call.step.slot("BODY");
        let mut children = Vec::new();

        for _ in 0..times {
            let (results, outcome) = run_slot(dispatcher, body, ctx, Map::new()).await;
            children.extend(results);
            match outcome {
                ListOutcome::Completed => {}
                ListOutcome::Skipped => break,
                ListOutcome::Aborted => return Err(list_failure("repeat body", children)),
                ListOutcome::Cancelled => {
                    return Err(StepFailure::cancelled().with_children(children))
                }
            }
        }

        Ok(BlockOutput::of(json!({
            "_summary": format!("{times} iterations")
        }))
        .with_children(children))
    }
}

// ============================================================================
// FOR EACH
// ============================================================================

/// Iterates an array (or an object's values), binding `item` and `index`
/// into a loop-local frame per element. The frame does not outlive the
/// loop.
struct ForEachBlock;

#[async_trait]
impl BlockExecutor for ForEachBlock {
    async fn execute(
        &self,
        call: &BlockCall<'_>,
        ctx: &mut ExecutionContext,
        dispatcher: &Dispatcher,
    ) -> Result<BlockOutput, StepFailure> {
        let items_text = call.params.text("ITEMS")?;
        let parsed: Value = serde_json::from_str(items_text).map_err(|_| {
            StepFailure::error(format!("input 'ITEMS' is not iterable: '{items_text}'"))
        })?;
        let items: Vec<Value> = match parsed {
            Value::Array(items) => items,
            Value::Object(map) => map.into_iter().map(|(_, v)| v).collect(),
            other => {
                return Err(StepFailure::error(format!(
                    "input 'ITEMS' is not iterable: {other}"
                )))
            }
        };

        let body = call.step.slot("BODY");
        let total = items.len();
        let mut children = Vec::new();

        for (index, item) in items.into_iter().enumerate() {
            let mut bindings = Map::new();
            bindings.insert("item".to_string(), item);
            bindings.insert("index".to_string(), json!(index));

            let (results, outcome) = run_slot(dispatcher, body, ctx, bindings).await;
            children.extend(results);
            match outcome {
                ListOutcome::Completed => {}
                ListOutcome::Skipped => break,
                ListOutcome::Aborted => return Err(list_failure("for_each body", children)),
                ListOutcome::Cancelled => {
                    return Err(StepFailure::cancelled().with_children(children))
                }
            }
        }

        Ok(BlockOutput::of(json!({
            "_summary": format!("{total} items")
        }))
        .with_children(children))
    }
}

// ============================================================================
// TRY / CATCH
// ============================================================================

/// Runs TRY; on failure binds `errorInfo` into a loop-local frame and
/// runs CATCH. The block passes when CATCH succeeds.
struct TryCatchBlock;

#[async_trait]
impl BlockExecutor for TryCatchBlock {
    async fn execute(
        &self,
        call: &BlockCall<'_>,
        ctx: &mut ExecutionContext,
        dispatcher: &Dispatcher,
    ) -> Result<BlockOutput, StepFailure> {
        let (try_results, outcome) =
            run_slot(dispatcher, call.step.slot("TRY"), ctx, Map::new()).await;
        let mut children = try_results;

        match outcome {
            ListOutcome::Completed | ListOutcome::Skipped => Ok(BlockOutput::of(json!({
                "_summary": "try succeeded"
            }))
            .with_children(children)),
            ListOutcome::Cancelled => Err(StepFailure::cancelled().with_children(children)),
            ListOutcome::Aborted => {
                let error_info = children
                    .iter()
                    .rev()
                    .find(|c| c.status.is_failing())
                    .map(|failed| {
                        let error = failed.error.clone();
                        json!({
                            "message": error.as_ref().map(|e| e.message.clone())
                                .unwrap_or_else(|| "step failed".to_string()),
                            "stepType": failed.block_type,
                            "expected": error.as_ref().and_then(|e| e.expected.clone()),
                            "actual": error.as_ref().and_then(|e| e.actual.clone()),
                        })
                    })
                    .unwrap_or_else(|| json!({"message": "unknown failure"}));
                let caught = error_info
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown failure")
                    .to_string();

                let mut bindings = Map::new();
                bindings.insert("errorInfo".to_string(), error_info);
                let (catch_results, catch_outcome) =
                    run_slot(dispatcher, call.step.slot("CATCH"), ctx, bindings).await;
                children.extend(catch_results);

                match catch_outcome {
                    ListOutcome::Completed | ListOutcome::Skipped => {
                        Ok(BlockOutput::of(json!({
                            "_summary": format!("caught: {caught}")
                        }))
                        .with_children(children))
                    }
                    ListOutcome::Aborted => Err(list_failure("catch body", children)),
                    ListOutcome::Cancelled => {
                        Err(StepFailure::cancelled().with_children(children))
                    }
                }
            }
        }
    }
}

// ============================================================================
// RETRY
// ============================================================================

/// Re-runs the body with exponential backoff until it passes or the
/// attempt budget is spent; the final status is the last attempt's.
struct RetryBlock;

#[async_trait]
impl BlockExecutor for RetryBlock {
    async fn execute(
        &self,
        call: &BlockCall<'_>,
        ctx: &mut ExecutionContext,
        dispatcher: &Dispatcher,
    ) -> Result<BlockOutput, StepFailure> {
        let max_attempts = (call.params.number("MAX_ATTEMPTS")?.max(1.0)) as u32;
        let backoff_ms = call.params.number("BACKOFF_MS")?.max(0.0);
        let backoff_factor = call.params.number("BACKOFF_FACTOR")?.max(1.0);
        let body = call.step.slot("BODY");

        let mut children = Vec::new();
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            let (results, outcome) = run_slot(dispatcher, body, ctx, Map::new()).await;
            children.extend(results);

            match outcome {
                ListOutcome::Completed | ListOutcome::Skipped => {
                    return Ok(BlockOutput::of(json!({
                        "_summary": format!("passed on attempt {attempt}")
                    }))
                    .with_children(children));
                }
                ListOutcome::Cancelled => {
                    return Err(StepFailure::cancelled().with_children(children))
                }
                ListOutcome::Aborted => {
                    if attempt >= max_attempts {
                        return Err(list_failure(
                            &format!("retry ({attempt} of {max_attempts} attempts)"),
                            children,
                        ));
                    }
                    let backoff = (backoff_ms * backoff_factor.powi(attempt as i32 - 1)) as u64;
                    let jitter = if backoff >= 10 {
                        rand::thread_rng().gen_range(0..=backoff / 10)
                    } else {
                        0
                    };
                    info!(
                        attempt = attempt,
                        max_attempts = max_attempts,
                        backoff_ms = backoff + jitter,
                        "retrying after backoff"
                    );
                    tokio::select! {
                        _ = ctx.cancellation.cancelled() => {
                            return Err(StepFailure::cancelled().with_children(children))
                        }
                        _ = tokio::time::sleep(Duration::from_millis(backoff + jitter)) => {}
                    }
                }
            }
        }
    }
}

// ============================================================================
// SKIP IF
// ============================================================================

/// When the condition is truthy, short-circuits the remainder of the
/// enclosing test with status skipped.
struct SkipIfBlock;

#[async_trait]
impl BlockExecutor for SkipIfBlock {
    async fn execute(
        &self,
        call: &BlockCall<'_>,
        ctx: &mut ExecutionContext,
        dispatcher: &Dispatcher,
    ) -> Result<BlockOutput, StepFailure> {
        let condition = call
            .params
            .value_step("CONDITION")?
            .ok_or_else(|| StepFailure::error("required input 'CONDITION' is missing"))?;

        let (value, condition_result) = eval_value_step(&condition, ctx, dispatcher).await?;
        let children = vec![condition_result];

        if truthy(&value) {
            let reason = call
                .params
                .opt_text("REASON")
                .unwrap_or("skip_if condition met")
                .to_string();
            ctx.skip_requested = Some(reason.clone());
            Ok(BlockOutput::of(json!({
                "_summary": format!("skipping: {reason}")
            }))
            .with_children(children))
        } else {
            Ok(BlockOutput::of(json!({"_summary": "condition not met"})).with_children(children))
        }
    }
}

// ============================================================================
// ON FAILURE
// ============================================================================

/// Registers its body with the context; the scheduler runs registered
/// handlers at teardown when the test body is failing.
struct OnFailureBlock;

#[async_trait]
impl BlockExecutor for OnFailureBlock {
    async fn execute(
        &self,
        call: &BlockCall<'_>,
        ctx: &mut ExecutionContext,
        _dispatcher: &Dispatcher,
    ) -> Result<BlockOutput, StepFailure> {
        ctx.failure_handlers
            .extend(call.step.slot("BODY").iter().cloned());
        Ok(BlockOutput::of(json!({
            "_summary": "failure handler registered"
        })))
    }
}
