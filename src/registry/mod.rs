// Module: Registry
// Block registry and dispatcher. The registry maps block type keys to
// executors with declared input shapes; the dispatcher resolves inputs,
// times execution, classifies outcomes, and attaches soft-assertion
// errors and captured logs to each step result.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{Map, Number, Value};
use tracing::debug;

use crate::context::ExecutionContext;
use crate::errors::StepFailure;
use crate::procedures::{ProcedureInvoker, ProcedureTable, PROCEDURE_TYPE_PREFIX};
use crate::protocol::TestStep;
use crate::report::{RunStatus, StepResult};
use crate::template;

// ============================================================================
// BLOCK SPECS
// ============================================================================

/// Editor-facing kind of a declared input field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputKind {
    Text,
    Number,
    Checkbox,
    Dropdown,
    Multiline,
    /// An ordered child step list; lives in `TestStep.children`.
    Statement,
    /// A nested value-producing step inside `params`.
    Value,
}

#[derive(Debug, Clone)]
pub struct InputSpec {
    pub name: &'static str,
    pub kind: InputKind,
    pub required: bool,
    pub default: Option<Value>,
}

impl InputSpec {
    pub fn new(name: &'static str, kind: InputKind) -> Self {
        Self {
            name,
            kind,
            required: false,
            default: None,
        }
    }

    pub fn text(name: &'static str) -> Self {
        Self::new(name, InputKind::Text)
    }

    pub fn number(name: &'static str) -> Self {
        Self::new(name, InputKind::Number)
    }

    pub fn checkbox(name: &'static str) -> Self {
        Self::new(name, InputKind::Checkbox)
    }

    pub fn dropdown(name: &'static str) -> Self {
        Self::new(name, InputKind::Dropdown)
    }

    pub fn multiline(name: &'static str) -> Self {
        Self::new(name, InputKind::Multiline)
    }

    pub fn statement(name: &'static str) -> Self {
        Self::new(name, InputKind::Statement)
    }

    pub fn value(name: &'static str) -> Self {
        Self::new(name, InputKind::Value)
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn with_default(mut self, default: Value) -> Self {
        self.default = Some(default);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockCategory {
    Basic,
    Flow,
    Web,
    Http,
    Procedure,
}

#[derive(Debug, Clone)]
pub struct BlockSpec {
    pub block_type: String,
    pub category: BlockCategory,
    pub inputs: Vec<InputSpec>,
    /// Whether the block chains after a predecessor (statement blocks do;
    /// value blocks don't).
    pub has_prev: bool,
    pub has_next: bool,
    pub produces_value: bool,
}

impl BlockSpec {
    pub fn statement(
        block_type: &str,
        category: BlockCategory,
        inputs: Vec<InputSpec>,
    ) -> Self {
        Self {
            block_type: block_type.to_string(),
            category,
            inputs,
            has_prev: true,
            has_next: true,
            produces_value: false,
        }
    }

    pub fn value(block_type: &str, category: BlockCategory, inputs: Vec<InputSpec>) -> Self {
        Self {
            block_type: block_type.to_string(),
            category,
            inputs,
            has_prev: false,
            has_next: false,
            produces_value: true,
        }
    }

    pub fn producing_value(mut self) -> Self {
        self.produces_value = true;
        self
    }
}

// ============================================================================
// RESOLVED PARAMS
// ============================================================================

/// Declared inputs after default application, variable resolution, and
/// type coercion. The raw params survive for value-kind lookups.
#[derive(Debug, Clone, Default)]
pub struct ResolvedParams {
    values: Map<String, Value>,
    raw: Map<String, Value>,
}

impl ResolvedParams {
    pub fn from_raw(raw: Map<String, Value>) -> Self {
        Self {
            values: Map::new(),
            raw,
        }
    }

    pub fn text(&self, name: &str) -> Result<&str, StepFailure> {
        self.values
            .get(name)
            .and_then(Value::as_str)
            .ok_or_else(|| StepFailure::error(format!("required input '{name}' is missing")))
    }

    pub fn opt_text(&self, name: &str) -> Option<&str> {
        self.values.get(name).and_then(Value::as_str)
    }

    pub fn number(&self, name: &str) -> Result<f64, StepFailure> {
        self.values
            .get(name)
            .and_then(Value::as_f64)
            .ok_or_else(|| StepFailure::error(format!("required input '{name}' is missing")))
    }

    pub fn opt_number(&self, name: &str) -> Option<f64> {
        self.values.get(name).and_then(Value::as_f64)
    }

    /// Unset checkboxes read as false.
    pub fn boolean(&self, name: &str) -> bool {
        self.values
            .get(name)
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    /// The raw (uncoerced) param value, for value-kind inputs.
    pub fn raw(&self, name: &str) -> Option<&Value> {
        self.raw.get(name)
    }

    /// Deserializes a value-kind input into its nested step.
    pub fn value_step(&self, name: &str) -> Result<Option<TestStep>, StepFailure> {
        match self.raw.get(name) {
            None | Some(Value::Null) => Ok(None),
            Some(value) => serde_json::from_value(value.clone())
                .map(Some)
                .map_err(|e| {
                    StepFailure::error(format!("input '{name}' is not a valid nested step: {e}"))
                }),
        }
    }
}

// ============================================================================
// BLOCK EXECUTOR
// ============================================================================

/// A dispatched invocation handed to an executor.
pub struct BlockCall<'a> {
    pub step: &'a TestStep,
    pub params: ResolvedParams,
}

impl BlockCall<'_> {
    pub fn block_type(&self) -> &str {
        &self.step.block_type
    }
}

/// What a block produced: its value (with optional `_summary` key) and
/// any nested step results (control-flow branches, procedure bodies).
#[derive(Debug, Default)]
pub struct BlockOutput {
    pub value: Value,
    pub children: Vec<StepResult>,
}

impl BlockOutput {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn of(value: Value) -> Self {
        Self {
            value,
            children: Vec::new(),
        }
    }

    pub fn with_children(mut self, children: Vec<StepResult>) -> Self {
        self.children = children;
        self
    }
}

/// Contract for block implementations, the registry's unit of dispatch.
/// One executor may back several registered types.
#[async_trait]
pub trait BlockExecutor: Send + Sync {
    async fn execute(
        &self,
        call: &BlockCall<'_>,
        ctx: &mut ExecutionContext,
        dispatcher: &Dispatcher,
    ) -> Result<BlockOutput, StepFailure>;
}

// ============================================================================
// REGISTRY
// ============================================================================

struct RegisteredBlock {
    spec: BlockSpec,
    executor: Arc<dyn BlockExecutor>,
}

/// Process-wide mapping from block type key to spec + executor.
#[derive(Default)]
pub struct BlockRegistry {
    blocks: HashMap<String, RegisteredBlock>,
}

impl BlockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// All built-in block families registered.
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        crate::blocks::register_builtins(&mut registry);
        registry
    }

    pub fn register(&mut self, spec: BlockSpec, executor: Arc<dyn BlockExecutor>) {
        self.blocks
            .insert(spec.block_type.clone(), RegisteredBlock { spec, executor });
    }

    pub fn contains(&self, block_type: &str) -> bool {
        self.blocks.contains_key(block_type)
    }

    pub fn spec(&self, block_type: &str) -> Option<&BlockSpec> {
        self.blocks.get(block_type).map(|b| &b.spec)
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }
}

// ============================================================================
// DISPATCHER
// ============================================================================

/// Outcome of running a step list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListOutcome {
    /// Every step ran and none aborted the list.
    Completed,
    /// A step failed or errored; the rest of the list did not run.
    Aborted,
    /// The cancel signal stopped the list.
    Cancelled,
    /// A `skip_if` condition short-circuited the list.
    Skipped,
}

/// Runs steps against the registry, one scheduling unit at a time. The
/// procedure table is fixed for the unit's duration.
pub struct Dispatcher {
    registry: BlockRegistry,
    procedures: ProcedureTable,
    procedure_invoker: Arc<dyn BlockExecutor>,
}

impl Dispatcher {
    pub fn new(registry: BlockRegistry, procedures: ProcedureTable) -> Self {
        Self {
            registry,
            procedures,
            procedure_invoker: Arc::new(ProcedureInvoker),
        }
    }

    pub fn registry(&self) -> &BlockRegistry {
        &self.registry
    }

    pub fn procedures(&self) -> &ProcedureTable {
        &self.procedures
    }

    /// Runs one step: input resolution, guarded execution, outcome
    /// classification, soft-assertion and log attribution.
    pub async fn run_step(&self, step: &TestStep, ctx: &mut ExecutionContext) -> StepResult {
        let started_at = Utc::now();
        let timer = Instant::now();
        let log_mark = ctx.logger.mark();
        let soft_mark = ctx.soft_mark();
        ctx.logger.set_step(Some(step.id.clone()));

        debug!(step_id = %step.id, block = %step.block_type, "running step");
        let outcome = self.execute_guarded(step, ctx).await;

        ctx.logger.set_step(None);
        let duration_ms = timer.elapsed().as_millis() as u64;
        let finished_at = Utc::now();

        let mut result = match outcome {
            Ok(output) => {
                let (summary, value) = split_summary(output.value);
                StepResult {
                    step_id: step.id.clone(),
                    block_type: step.block_type.clone(),
                    status: RunStatus::Passed,
                    started_at,
                    finished_at,
                    duration_ms,
                    summary,
                    output: value,
                    error: None,
                    children: output.children,
                    soft_assertion_errors: Vec::new(),
                    logs: Vec::new(),
                }
            }
            Err(failure) => StepResult {
                step_id: step.id.clone(),
                block_type: step.block_type.clone(),
                status: failure.status(),
                started_at,
                finished_at,
                duration_ms,
                summary: None,
                output: None,
                error: Some(failure.to_error_info()),
                children: failure.children,
                soft_assertion_errors: Vec::new(),
                logs: Vec::new(),
            },
        };

        result.soft_assertion_errors = ctx.soft_assertion_errors[soft_mark..].to_vec();
        result.logs = ctx.logger.take_since(log_mark);
        debug!(step_id = %step.id, status = ?result.status, duration_ms, "step finished");
        result
    }

    async fn execute_guarded(
        &self,
        step: &TestStep,
        ctx: &mut ExecutionContext,
    ) -> Result<BlockOutput, StepFailure> {
        ctx.check_cancelled()?;

        // Procedure table first: a registered procedure shadows any
        // built-in sharing its `custom_*` key (last registration wins).
        if let Some(slug) = step.block_type.strip_prefix(PROCEDURE_TYPE_PREFIX) {
            if self.procedures.contains(slug) {
                let call = BlockCall {
                    step,
                    params: ResolvedParams::from_raw(step.params.clone()),
                };
                return self.procedure_invoker.execute(&call, ctx, self).await;
            }
        }

        let registered = self.registry.blocks.get(&step.block_type).ok_or_else(|| {
            StepFailure::error(format!("unknown block type '{}'", step.block_type))
                .with_step_type(step.block_type.as_str())
        })?;

        let params = resolve_inputs(&registered.spec, step, ctx)?;
        let call = BlockCall { step, params };
        registered.executor.execute(&call, ctx, self).await
    }

    /// Runs a step list strictly sequentially. A step's successor begins
    /// only after its result is recorded; a failing step aborts the rest.
    pub async fn run_steps(
        &self,
        steps: &[TestStep],
        ctx: &mut ExecutionContext,
    ) -> (Vec<StepResult>, ListOutcome) {
        let mut results = Vec::with_capacity(steps.len());
        for step in steps {
            if ctx.cancellation.is_cancelled() {
                return (results, ListOutcome::Cancelled);
            }
            if ctx.skip_requested.is_some() {
                return (results, ListOutcome::Skipped);
            }

            let result = self.run_step(step, ctx).await;
            let status = result.status;
            results.push(result);

            if status.is_failing() {
                return (results, ListOutcome::Aborted);
            }
            if status == RunStatus::Skipped {
                // a skipped step mid-list means the cancel signal fired
                return (results, ListOutcome::Cancelled);
            }
            if ctx.skip_requested.is_some() {
                return (results, ListOutcome::Skipped);
            }
        }
        (results, ListOutcome::Completed)
    }
}

// ============================================================================
// INPUT RESOLUTION
// ============================================================================

/// Peels the `_summary` key off an output object.
fn split_summary(value: Value) -> (Option<String>, Option<Value>) {
    match value {
        Value::Object(mut map) => {
            let summary = map.remove("_summary").map(|v| template::stringify(&v));
            let output = if map.is_empty() {
                None
            } else {
                Some(Value::Object(map))
            };
            (summary, output)
        }
        Value::Null => (None, None),
        other => (None, Some(other)),
    }
}

/// Applies defaults, enforces `required`, coerces to the declared kind,
/// and variable-resolves text-like fields.
fn resolve_inputs(
    spec: &BlockSpec,
    step: &TestStep,
    ctx: &ExecutionContext,
) -> Result<ResolvedParams, StepFailure> {
    let mut params = ResolvedParams::from_raw(step.params.clone());

    for input in &spec.inputs {
        // statement slots live in children, not params
        if input.kind == InputKind::Statement {
            continue;
        }

        let raw = match step.params.get(input.name) {
            Some(value) if !value.is_null() => value.clone(),
            _ => match &input.default {
                Some(default) => default.clone(),
                None => {
                    if input.required {
                        return Err(StepFailure::error(format!(
                            "required input '{}' is missing",
                            input.name
                        ))
                        .with_step_type(step.block_type.as_str()));
                    }
                    continue;
                }
            },
        };

        let coerced = match input.kind {
            InputKind::Text | InputKind::Multiline | InputKind::Dropdown => Value::String(
                template::resolve_str(&template::stringify(&raw), &ctx.scopes),
            ),
            InputKind::Number => coerce_number(&raw, input.name, ctx)
                .map_err(|f| f.with_step_type(step.block_type.as_str()))?,
            InputKind::Checkbox => coerce_boolean(&raw, input.name, ctx)
                .map_err(|f| f.with_step_type(step.block_type.as_str()))?,
            InputKind::Value => raw,
            InputKind::Statement => continue,
        };
        params.values.insert(input.name.to_string(), coerced);
    }

    Ok(params)
}

fn coerce_number(raw: &Value, name: &str, ctx: &ExecutionContext) -> Result<Value, StepFailure> {
    match raw {
        Value::Number(_) => Ok(raw.clone()),
        Value::String(text) => {
            let resolved = template::resolve_str(text, &ctx.scopes);
            let parsed: f64 = resolved.trim().parse().map_err(|_| {
                StepFailure::error(format!("input '{name}' expects a number, got '{resolved}'"))
            })?;
            Number::from_f64(parsed)
                .map(Value::Number)
                .ok_or_else(|| StepFailure::error(format!("input '{name}' is not a finite number")))
        }
        other => Err(StepFailure::error(format!(
            "input '{name}' expects a number, got {other}"
        ))),
    }
}

fn coerce_boolean(raw: &Value, name: &str, ctx: &ExecutionContext) -> Result<Value, StepFailure> {
    match raw {
        Value::Bool(_) => Ok(raw.clone()),
        Value::Number(n) => Ok(Value::Bool(n.as_f64().unwrap_or(0.0) != 0.0)),
        Value::String(text) => {
            let resolved = template::resolve_str(text, &ctx.scopes);
            match resolved.trim() {
                "true" => Ok(Value::Bool(true)),
                "false" | "" => Ok(Value::Bool(false)),
                other => Err(StepFailure::error(format!(
                    "input '{name}' expects a boolean, got '{other}'"
                ))),
            }
        }
        other => Err(StepFailure::error(format!(
            "input '{name}' expects a boolean, got {other}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::NoBrowser;
    use crate::protocol::RunOptions;
    use serde_json::json;

    struct EchoBlock;

    #[async_trait]
    impl BlockExecutor for EchoBlock {
        async fn execute(
            &self,
            call: &BlockCall<'_>,
            _ctx: &mut ExecutionContext,
            _dispatcher: &Dispatcher,
        ) -> Result<BlockOutput, StepFailure> {
            let message = call.params.text("MESSAGE")?;
            Ok(BlockOutput::of(json!({"_summary": message})))
        }
    }

    fn ctx() -> ExecutionContext {
        let mut ctx = ExecutionContext::new(
            Map::new(),
            None,
            &RunOptions::default(),
            Arc::new(NoBrowser),
        );
        ctx.scopes
            .push(crate::context::ScopeKind::File, Map::new());
        ctx
    }

    fn dispatcher() -> Dispatcher {
        let mut registry = BlockRegistry::new();
        registry.register(
            BlockSpec::statement(
                "echo",
                BlockCategory::Basic,
                vec![InputSpec::text("MESSAGE").required()],
            ),
            Arc::new(EchoBlock),
        );
        Dispatcher::new(registry, ProcedureTable::new())
    }

    fn step(block_type: &str, params: Value) -> TestStep {
        serde_json::from_value(json!({
            "id": "s1",
            "type": block_type,
            "params": params
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn unknown_block_type_is_an_error() {
        let dispatcher = dispatcher();
        let mut ctx = ctx();

        let result = dispatcher
            .run_step(&step("does_not_exist", json!({})), &mut ctx)
            .await;

        assert_eq!(result.status, RunStatus::Error);
        let error = result.error.unwrap();
        assert!(error.message.contains("unknown block type"));
    }

    #[tokio::test]
    async fn missing_required_input_is_an_error() {
        let dispatcher = dispatcher();
        let mut ctx = ctx();

        let result = dispatcher.run_step(&step("echo", json!({})), &mut ctx).await;

        assert_eq!(result.status, RunStatus::Error);
        assert!(result
            .error
            .unwrap()
            .message
            .contains("required input 'MESSAGE'"));
    }

    #[tokio::test]
    async fn summary_is_peeled_off_the_output() {
        let dispatcher = dispatcher();
        let mut ctx = ctx();

        let result = dispatcher
            .run_step(&step("echo", json!({"MESSAGE": "hi"})), &mut ctx)
            .await;

        assert_eq!(result.status, RunStatus::Passed);
        assert_eq!(result.summary.as_deref(), Some("hi"));
        assert!(result.output.is_none());
    }

    #[tokio::test]
    async fn text_inputs_are_variable_resolved() {
        let dispatcher = dispatcher();
        let mut ctx = ctx();
        ctx.scopes.set("user", json!("alice"));

        let result = dispatcher
            .run_step(&step("echo", json!({"MESSAGE": "hello ${user}"})), &mut ctx)
            .await;

        assert_eq!(result.summary.as_deref(), Some("hello alice"));
    }

    #[tokio::test]
    async fn cancellation_skips_the_step() {
        let dispatcher = dispatcher();
        let mut ctx = ctx();
        ctx.cancellation.cancel();

        let result = dispatcher
            .run_step(&step("echo", json!({"MESSAGE": "hi"})), &mut ctx)
            .await;

        assert_eq!(result.status, RunStatus::Skipped);
    }

    #[tokio::test]
    async fn failing_step_aborts_the_list() {
        let dispatcher = dispatcher();
        let mut ctx = ctx();

        let steps = vec![
            step("echo", json!({"MESSAGE": "one"})),
            step("echo", json!({})),
            step("echo", json!({"MESSAGE": "never"})),
        ];
        let (results, outcome) = dispatcher.run_steps(&steps, &mut ctx).await;

        assert_eq!(results.len(), 2);
        assert_eq!(outcome, ListOutcome::Aborted);
    }

    #[tokio::test]
    async fn empty_list_completes() {
        let dispatcher = dispatcher();
        let mut ctx = ctx();
        let (results, outcome) = dispatcher.run_steps(&[], &mut ctx).await;
        assert!(results.is_empty());
        assert_eq!(outcome, ListOutcome::Completed);
    }
}
