// Module: Procedures
// User-authored reusable step lists ("custom blocks"). A procedure is
// invoked through a step typed `custom_<slug>`; its declared parameters
// bind into a procedure-local scope visible only to the expansion.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use tracing::debug;

use crate::context::{ExecutionContext, ScopeKind};
use crate::errors::StepFailure;
use crate::protocol::{GlobalsDoc, ParamKind, ProcedureDefinition, ProcedureParam, TestFile};
use crate::registry::{BlockCall, BlockExecutor, BlockOutput, Dispatcher, ListOutcome};
use crate::report::RunStatus;
use crate::template;

/// Type-key prefix that routes a step to the procedure table.
pub const PROCEDURE_TYPE_PREFIX: &str = "custom_";

/// Lower-cases a procedure name and folds non-alphanumerics to `_`.
pub fn slugify(name: &str) -> String {
    name.to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

/// The full block type key a procedure registers under.
pub fn block_type_for(name: &str) -> String {
    format!("{PROCEDURE_TYPE_PREFIX}{}", slugify(name))
}

// ============================================================================
// PROCEDURE TABLE
// ============================================================================

/// Procedures available to one scheduling unit, keyed by slug. Built at
/// unit start and immutable while blocks execute.
#[derive(Default, Clone)]
pub struct ProcedureTable {
    procs: HashMap<String, Arc<ProcedureDefinition>>,
}

impl ProcedureTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Globals first, then the file's own procedures; a file-local
    /// definition shadows a globals one with the same slug.
    pub fn from_sources(globals: Option<&GlobalsDoc>, file: &TestFile) -> Self {
        let mut table = Self::new();
        if let Some(globals) = globals {
            for def in globals.procedures.values() {
                table.register(def.clone());
            }
        }
        for def in file.procedures.values() {
            table.register(def.clone());
        }
        table
    }

    pub fn register(&mut self, def: ProcedureDefinition) {
        self.procs.insert(slugify(&def.name), Arc::new(def));
    }

    pub fn contains(&self, slug: &str) -> bool {
        self.procs.contains_key(slug)
    }

    pub fn get(&self, slug: &str) -> Option<Arc<ProcedureDefinition>> {
        self.procs.get(slug).cloned()
    }

    pub fn slugs(&self) -> impl Iterator<Item = &str> {
        self.procs.keys().map(String::as_str)
    }
}

// ============================================================================
// INVOCATION
// ============================================================================

/// Executor behind every `custom_*` dispatch.
pub struct ProcedureInvoker;

#[async_trait]
impl BlockExecutor for ProcedureInvoker {
    async fn execute(
        &self,
        call: &BlockCall<'_>,
        ctx: &mut ExecutionContext,
        dispatcher: &Dispatcher,
    ) -> Result<BlockOutput, StepFailure> {
        let slug = call
            .block_type()
            .strip_prefix(PROCEDURE_TYPE_PREFIX)
            .ok_or_else(|| {
                StepFailure::error(format!(
                    "'{}' is not a procedure invocation",
                    call.block_type()
                ))
            })?;
        let def = dispatcher.procedures().get(slug).ok_or_else(|| {
            StepFailure::error(format!("unknown procedure '{slug}'"))
        })?;

        if ctx.procedure_stack.len() as u32 >= ctx.max_recursion_depth {
            let chain = ctx.procedure_stack.join(" -> ");
            return Err(StepFailure::error(format!(
                "procedure recursion depth {} exceeded entering '{}' (call chain: {chain})",
                ctx.max_recursion_depth, def.name
            )));
        }

        let bindings = bind_params(&def, call, ctx)?;
        debug!(procedure = %def.name, params = bindings.len(), "invoking procedure");

        ctx.scopes.push(ScopeKind::Procedure, bindings);
        ctx.procedure_stack.push(def.name.clone());

        let (children, outcome) = dispatcher.run_steps(&def.steps, ctx).await;

        ctx.procedure_stack.pop();
        ctx.scopes.pop();

        match outcome {
            ListOutcome::Completed | ListOutcome::Skipped => Ok(BlockOutput::of(json!({
                "_summary": format!("{} ({} steps)", def.name, children.len())
            }))
            .with_children(children)),
            ListOutcome::Aborted => {
                let worst = RunStatus::combine(children.iter().map(|c| c.status));
                let failed_step = children
                    .last()
                    .map(|c| c.step_id.clone())
                    .unwrap_or_default();
                let message = format!(
                    "procedure '{}' failed at step '{failed_step}'",
                    def.name
                );
                let failure = if worst == RunStatus::Error {
                    StepFailure::error(message)
                } else {
                    StepFailure::assertion(message)
                };
                Err(failure.with_children(children))
            }
            ListOutcome::Cancelled => Err(StepFailure::cancelled().with_children(children)),
        }
    }
}

/// Resolves each declared parameter from the call site. The call-site
/// field name is the upper-cased parameter name; an absent field falls
/// back to the declared default, then to null.
fn bind_params(
    def: &ProcedureDefinition,
    call: &BlockCall<'_>,
    ctx: &ExecutionContext,
) -> Result<Map<String, Value>, StepFailure> {
    let mut bindings = Map::with_capacity(def.params.len());
    for param in &def.params {
        let field = param.name.to_uppercase();
        let value = match call.params.raw(&field) {
            Some(raw) if !raw.is_null() => coerce_param(raw, param, ctx)?,
            _ => param.default.clone().unwrap_or(Value::Null),
        };
        bindings.insert(param.name.clone(), value);
    }
    Ok(bindings)
}

fn coerce_param(
    raw: &Value,
    param: &ProcedureParam,
    ctx: &ExecutionContext,
) -> Result<Value, StepFailure> {
    let resolved = template::resolve_value(raw, &ctx.scopes);
    match param.kind {
        ParamKind::Any => Ok(resolved),
        ParamKind::String => Ok(Value::String(template::stringify(&resolved))),
        ParamKind::Number => match &resolved {
            Value::Number(_) => Ok(resolved.clone()),
            Value::String(text) => {
                let parsed: f64 = text.trim().parse().map_err(|_| {
                    StepFailure::error(format!(
                        "parameter '{}' expects a number, got '{text}'",
                        param.name
                    ))
                })?;
                serde_json::Number::from_f64(parsed)
                    .map(Value::Number)
                    .ok_or_else(|| {
                        StepFailure::error(format!(
                            "parameter '{}' is not a finite number",
                            param.name
                        ))
                    })
            }
            other => Err(StepFailure::error(format!(
                "parameter '{}' expects a number, got {other}",
                param.name
            ))),
        },
        ParamKind::Boolean => match &resolved {
            Value::Bool(_) => Ok(resolved.clone()),
            Value::String(text) => match text.trim() {
                "true" => Ok(Value::Bool(true)),
                "false" => Ok(Value::Bool(false)),
                other => Err(StepFailure::error(format!(
                    "parameter '{}' expects a boolean, got '{other}'",
                    param.name
                ))),
            },
            other => Err(StepFailure::error(format!(
                "parameter '{}' expects a boolean, got {other}",
                param.name
            ))),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slugify_folds_non_alphanumerics() {
        assert_eq!(slugify("Login"), "login");
        assert_eq!(slugify("Create User!"), "create_user_");
        assert_eq!(slugify("fill-form 2"), "fill_form_2");
    }

    #[test]
    fn block_type_carries_prefix() {
        assert_eq!(block_type_for("Login"), "custom_login");
    }

    #[test]
    fn file_procedure_shadows_globals() {
        let make = |name: &str, step_count: usize| ProcedureDefinition {
            name: name.to_string(),
            description: None,
            params: Vec::new(),
            steps: (0..step_count)
                .map(|i| {
                    serde_json::from_value(json!({"id": format!("s{i}"), "type": "log"})).unwrap()
                })
                .collect(),
        };

        let globals = GlobalsDoc {
            procedures: [("login".to_string(), make("login", 1))].into_iter().collect(),
            ..GlobalsDoc::default()
        };
        let file: TestFile = serde_json::from_value(json!({
            "name": "suite",
            "procedures": {"login": {
                "name": "login",
                "steps": [
                    {"id": "a", "type": "log"},
                    {"id": "b", "type": "log"}
                ]
            }},
            "tests": []
        }))
        .unwrap();

        let table = ProcedureTable::from_sources(Some(&globals), &file);
        assert_eq!(table.get("login").unwrap().steps.len(), 2);
    }
}
