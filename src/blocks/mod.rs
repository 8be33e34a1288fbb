// Module: Blocks
// Built-in block families: basic, control-flow, web, and http.

pub mod basic;
pub mod flow;
pub mod http;
pub mod web;

use serde_json::Value;

use crate::context::ExecutionContext;
use crate::errors::{FailureKind, StepFailure};
use crate::protocol::TestStep;
use crate::registry::{BlockRegistry, Dispatcher};
use crate::report::{RunStatus, StepResult};

/// Registers every built-in block family.
pub fn register_builtins(registry: &mut BlockRegistry) {
    basic::register(registry);
    flow::register(registry);
    web::register(registry);
    http::register(registry);
}

// ============================================================================
// SHARED HELPERS
// ============================================================================

/// The one soft/hard assertion gate. Assertion blocks never fail any
/// other way: in soft mode the failure lands in the context buffer and
/// the step proceeds as passed.
pub fn check(
    ctx: &mut ExecutionContext,
    passed: bool,
    failure: impl FnOnce() -> StepFailure,
) -> Result<(), StepFailure> {
    if passed {
        return Ok(());
    }
    let failure = failure();
    if ctx.soft_assertions && failure.kind == FailureKind::Assertion {
        ctx.record_soft_failure(&failure);
        Ok(())
    } else {
        Err(failure)
    }
}

/// Truthiness of a condition value: `true`, a non-zero number, or a
/// non-empty string.
pub fn truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => !s.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
        Value::Null => false,
    }
}

/// Runs a nested value-producing step (e.g. a `compare` condition) and
/// extracts its `_value`. The step's own result is returned so callers
/// can surface it among their children.
pub async fn eval_value_step(
    step: &TestStep,
    ctx: &mut ExecutionContext,
    dispatcher: &Dispatcher,
) -> Result<(Value, StepResult), StepFailure> {
    let result = dispatcher.run_step(step, ctx).await;
    match result.status {
        RunStatus::Passed => {
            let value = result
                .output
                .as_ref()
                .and_then(|o| o.get("_value"))
                .cloned()
                .unwrap_or(Value::Null);
            Ok((value, result))
        }
        RunStatus::Skipped => Err(StepFailure::cancelled().with_children(vec![result])),
        RunStatus::Error => Err(StepFailure::error(format!(
            "condition step '{}' errored",
            result.step_id
        ))
        .with_children(vec![result])),
        RunStatus::Failed => Err(StepFailure::assertion(format!(
            "condition step '{}' failed",
            result.step_id
        ))
        .with_children(vec![result])),
    }
}

/// Maps an aborted child list into the enclosing block's failure,
/// preserving the children for the report.
pub fn list_failure(context: &str, children: Vec<StepResult>) -> StepFailure {
    let worst = RunStatus::combine(children.iter().map(|c| c.status));
    let failed_step = children
        .iter()
        .rev()
        .find(|c| c.status.is_failing())
        .map(|c| c.step_id.clone())
        .unwrap_or_default();
    let message = format!("{context} failed at step '{failed_step}'");
    let failure = if worst == RunStatus::Error {
        StepFailure::error(message)
    } else {
        StepFailure::assertion(message)
    };
    failure.with_children(children)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn truthiness_rule() {
        assert!(truthy(&json!(true)));
        assert!(truthy(&json!(1)));
        assert!(truthy(&json!(-2.5)));
        assert!(truthy(&json!("no")));
        assert!(!truthy(&json!(false)));
        assert!(!truthy(&json!(0)));
        assert!(!truthy(&json!("")));
        assert!(!truthy(&Value::Null));
    }
}
