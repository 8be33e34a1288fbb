// Module: Scheduler
// Runs one scheduling unit: a test file plus its folder-hook chain.
// Owns lifecycle ordering, data-driven expansion, per-test scope
// hygiene, teardown guarantees, and cancellation.

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use serde_json::{Map, Value};
use tracing::{info, warn};
use uuid::Uuid;

use crate::capability::PageFactory;
use crate::context::{ExecutionContext, ScopeKind};
use crate::errors::EngineError;
use crate::hooks::HookChain;
use crate::procedures::ProcedureTable;
use crate::protocol::{DataRow, RunRequest, TestCase, TestFile, TestStep};
use crate::registry::{BlockRegistry, Dispatcher, ListOutcome};
use crate::report::{
    IterationInfo, LifecycleType, RunStatus, RunSummary, SuiteReport, TestResult,
};
use crate::validation;

// ============================================================================
// ENTRY POINT
// ============================================================================

/// Executes a run request end to end and returns the suite report.
///
/// The document is validated before anything runs; a validation failure
/// aborts with `EngineError::InvalidDocument` and no test executes.
pub async fn run_suite(
    request: RunRequest,
    page_factory: Arc<dyn PageFactory>,
) -> Result<SuiteReport, EngineError> {
    let RunRequest {
        test_file,
        folder_hooks,
        globals,
        options,
    } = request;

    let registry = BlockRegistry::builtin();
    let procedures = ProcedureTable::from_sources(globals.as_ref(), &test_file);
    validation::validate_file(&test_file, &registry, &procedures)
        .map_err(EngineError::InvalidDocument)?;

    let global_vars = globals
        .as_ref()
        .map(|g| g.variables.clone())
        .unwrap_or_default();
    let test_id_attribute = globals.as_ref().and_then(|g| g.test_id_attribute.clone());

    let mut ctx = ExecutionContext::new(global_vars, test_id_attribute, &options, page_factory);
    let dispatcher = Dispatcher::new(registry, procedures);
    let chain = HookChain::compose(&folder_hooks, &test_file);
    let file_defaults = file_variable_defaults(&test_file);

    // unit-level file frame: beforeAll writes land here and stay visible
    // to every test in the unit
    ctx.scopes.push(ScopeKind::File, file_defaults.clone());

    let execution_id = Uuid::new_v4().to_string();
    info!(execution_id = %execution_id, file = %test_file.name, "scheduling unit starting");
    let started_at = Utc::now();
    let timer = Instant::now();
    let mut results: Vec<TestResult> = Vec::new();

    // beforeAll, exactly once
    let before_all_steps = chain.before_all();
    let mut before_all_failed = false;
    if !before_all_steps.is_empty() {
        let hook = run_hook_list(
            &dispatcher,
            &mut ctx,
            &before_all_steps,
            LifecycleType::BeforeAll,
            "beforeAll",
            "hook:beforeAll",
            &test_file.name,
        )
        .await;
        before_all_failed = hook.status.is_failing();
        results.push(hook);
    }

    for test in &test_file.tests {
        if ctx.cancellation.is_cancelled() {
            results.push(skipped_result(test, &test_file.name, "run cancelled"));
            continue;
        }
        if before_all_failed {
            results.push(skipped_result(test, &test_file.name, "beforeAll hook failed"));
            continue;
        }
        if test.disabled {
            results.push(skipped_result(test, &test_file.name, "test disabled"));
            continue;
        }

        match &test.data {
            Some(rows) if !rows.is_empty() => {
                for (index, row) in rows.iter().enumerate() {
                    let entries = run_single_test(
                        &dispatcher,
                        &mut ctx,
                        &chain,
                        test,
                        &test_file.name,
                        &file_defaults,
                        Some((index, row)),
                    )
                    .await;
                    results.extend(entries);
                }
            }
            _ => {
                let entries = run_single_test(
                    &dispatcher,
                    &mut ctx,
                    &chain,
                    test,
                    &test_file.name,
                    &file_defaults,
                    None,
                )
                .await;
                results.extend(entries);
            }
        }
    }

    // afterAll is guaranteed, failures and cancellation included
    let after_all_steps = chain.after_all();
    if !after_all_steps.is_empty() {
        let hook = run_hook_list(
            &dispatcher,
            &mut ctx,
            &after_all_steps,
            LifecycleType::AfterAll,
            "afterAll",
            "hook:afterAll",
            &test_file.name,
        )
        .await;
        results.push(hook);
    }

    ctx.release().await;

    // under cancellation, teardown failures are recorded but do not
    // decide the unit's status
    let status = if ctx.cancellation.is_cancelled() {
        RunStatus::combine(
            results
                .iter()
                .filter(|r| !r.is_lifecycle)
                .map(|r| r.status),
        )
    } else {
        SuiteReport::aggregate_status(&results)
    };
    let summary = RunSummary::from_results(&results);
    info!(
        execution_id = %execution_id,
        status = ?status,
        passed = summary.passed,
        failed = summary.failed,
        "scheduling unit finished"
    );

    Ok(SuiteReport {
        execution_id,
        file_name: test_file.name.clone(),
        status,
        started_at,
        finished_at: Utc::now(),
        duration_ms: timer.elapsed().as_millis() as u64,
        summary,
        tests: results,
    })
}

// ============================================================================
// SINGLE TEST
// ============================================================================

/// Runs one test (or one data iteration of it) with its composed hooks.
/// Returns the lifecycle and test entries in execution order.
async fn run_single_test(
    dispatcher: &Dispatcher,
    ctx: &mut ExecutionContext,
    chain: &HookChain,
    test: &TestCase,
    file_name: &str,
    file_defaults: &Map<String, Value>,
    iteration: Option<(usize, &DataRow)>,
) -> Vec<TestResult> {
    let display_name = match iteration {
        Some((index, row)) => {
            let label = row
                .name
                .clone()
                .unwrap_or_else(|| format!("Row {}", index + 1));
            format!("{} [{}]", test.name, label)
        }
        None => test.name.clone(),
    };
    info!(test_id = %test.id, name = %display_name, "running test");

    let base_depth = ctx.scopes.depth();
    ctx.reset_for_test(test.soft_assertions);

    // fresh file frame per test so writes do not leak across tests, then
    // the iteration's data frame inside it
    ctx.scopes.push(ScopeKind::File, file_defaults.clone());
    let iteration_info = iteration.map(|(index, row)| {
        let mut frame = Map::new();
        frame.insert("data".to_string(), Value::Object(row.values.clone()));
        ctx.scopes.push(ScopeKind::DataRow, frame);
        IterationInfo {
            index,
            name: row.name.clone(),
            values: row.values.clone(),
        }
    });

    let started_at = Utc::now();
    let timer = Instant::now();
    let mut entries = Vec::new();
    let mut hook_failed = false;
    let mut body_skip_reason: Option<String> = None;

    // beforeEach
    let before_steps = chain.before_each(test);
    if !before_steps.is_empty() {
        let hook = run_hook_list(
            dispatcher,
            ctx,
            &before_steps,
            LifecycleType::BeforeEach,
            &display_name,
            &format!("hook:beforeEach:{}", test.id),
            file_name,
        )
        .await;
        if hook.status.is_failing() {
            hook_failed = true;
            body_skip_reason = Some("beforeEach hook failed".to_string());
        }
        entries.push(hook);
    }

    // body
    let mut body_results = Vec::new();
    let mut body_status = RunStatus::Passed;
    let mut test_error = body_skip_reason.clone();
    if body_skip_reason.is_none() {
        let (step_results, outcome) = dispatcher.run_steps(&test.steps, ctx).await;
        body_status = match outcome {
            ListOutcome::Completed | ListOutcome::Aborted => {
                RunStatus::combine(step_results.iter().map(|r| r.status))
            }
            ListOutcome::Cancelled => RunStatus::Skipped,
            ListOutcome::Skipped => {
                test_error = ctx.skip_requested.clone();
                RunStatus::Skipped
            }
        };
        body_results = step_results;
    }
    // a pending skip request must not swallow teardown
    ctx.skip_requested = None;

    // afterEach always runs; on_failure handlers run first when the body
    // is failing
    let mut after_steps = chain.after_each(test);
    if body_status.is_failing() && !ctx.failure_handlers.is_empty() {
        let mut guarded = std::mem::take(&mut ctx.failure_handlers);
        guarded.extend(after_steps);
        after_steps = guarded;
    }
    let after_entry = if after_steps.is_empty() {
        None
    } else {
        let hook = run_hook_list(
            dispatcher,
            ctx,
            &after_steps,
            LifecycleType::AfterEach,
            &display_name,
            &format!("hook:afterEach:{}", test.id),
            file_name,
        )
        .await;
        if hook.status.is_failing() {
            hook_failed = true;
        }
        Some(hook)
    };

    // finalize: body failure, any accumulated soft error, or any hook
    // failure downgrades the test
    let soft_errors = ctx.soft_assertion_errors.clone();
    let mut status = body_status;
    if hook_failed || !soft_errors.is_empty() {
        status = status.worst(RunStatus::Failed);
    }

    entries.push(TestResult {
        test_id: test.id.clone(),
        test_name: display_name,
        status,
        started_at,
        finished_at: Utc::now(),
        duration_ms: timer.elapsed().as_millis() as u64,
        steps: body_results,
        iteration: iteration_info,
        is_lifecycle: false,
        lifecycle_type: None,
        error: test_error,
        file_name: Some(file_name.to_string()),
        soft_assertion_errors: soft_errors,
    });
    if let Some(after) = after_entry {
        entries.push(after);
    }

    // scope hygiene: the data frame, the per-test file frame, and any
    // frame a misbehaving block left behind all go
    ctx.scopes.truncate(base_depth);
    ctx.soft_assertion_errors.clear();
    ctx.soft_assertions = false;
    ctx.skip_requested = None;

    entries
}

// ============================================================================
// HELPERS
// ============================================================================

async fn run_hook_list(
    dispatcher: &Dispatcher,
    ctx: &mut ExecutionContext,
    steps: &[TestStep],
    lifecycle: LifecycleType,
    display_name: &str,
    entry_id: &str,
    file_name: &str,
) -> TestResult {
    let started_at = Utc::now();
    let timer = Instant::now();

    let (step_results, outcome) = dispatcher.run_steps(steps, ctx).await;
    let status = RunStatus::combine(step_results.iter().map(|r| r.status));
    if status.is_failing() {
        warn!(entry = %entry_id, status = ?status, "lifecycle hook failed");
    }
    let error = match outcome {
        ListOutcome::Aborted => step_results
            .iter()
            .rev()
            .find(|r| r.status.is_failing())
            .and_then(|r| r.error.as_ref().map(|e| e.message.clone())),
        _ => None,
    };

    TestResult {
        test_id: entry_id.to_string(),
        test_name: display_name.to_string(),
        status,
        started_at,
        finished_at: Utc::now(),
        duration_ms: timer.elapsed().as_millis() as u64,
        steps: step_results,
        iteration: None,
        is_lifecycle: true,
        lifecycle_type: Some(lifecycle),
        error,
        file_name: Some(file_name.to_string()),
        soft_assertion_errors: Vec::new(),
    }
}

fn skipped_result(test: &TestCase, file_name: &str, reason: &str) -> TestResult {
    let now = Utc::now();
    TestResult {
        test_id: test.id.clone(),
        test_name: test.name.clone(),
        status: RunStatus::Skipped,
        started_at: now,
        finished_at: now,
        duration_ms: 0,
        steps: Vec::new(),
        iteration: None,
        is_lifecycle: false,
        lifecycle_type: None,
        error: Some(reason.to_string()),
        file_name: Some(file_name.to_string()),
        soft_assertion_errors: Vec::new(),
    }
}

fn file_variable_defaults(file: &TestFile) -> Map<String, Value> {
    file.variables
        .iter()
        .map(|(name, def)| (name.clone(), def.default.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::mock::{MockElement, MockPageFactory};
    use crate::capability::NoBrowser;
    use crate::protocol::{GlobalsDoc, RunOptions};
    use serde_json::json;

    async fn run(file: Value) -> SuiteReport {
        run_request(RunRequest::new(serde_json::from_value(file).unwrap())).await
    }

    async fn run_request(request: RunRequest) -> SuiteReport {
        run_suite(request, Arc::new(NoBrowser)).await.unwrap()
    }

    fn test_entries(report: &SuiteReport) -> Vec<&TestResult> {
        report.tests.iter().filter(|r| !r.is_lifecycle).collect()
    }

    // S1: passing test with file variables
    #[tokio::test]
    async fn passing_test_resolves_file_variables() {
        let report = run(json!({
            "name": "suite",
            "variables": {"user": {"default": "alice"}},
            "tests": [{
                "id": "t1",
                "name": "hi",
                "steps": [{"id": "s1", "type": "log", "params": {"MESSAGE": "hello ${user}"}}]
            }]
        }))
        .await;

        assert_eq!(report.status, RunStatus::Passed);
        let tests = test_entries(&report);
        assert_eq!(tests.len(), 1);
        assert_eq!(tests[0].status, RunStatus::Passed);
        assert_eq!(tests[0].steps.len(), 1);
        assert_eq!(tests[0].steps[0].summary.as_deref(), Some("hello alice"));
    }

    // S2: failed hard assertion against the page
    #[tokio::test]
    async fn failed_web_assertion_is_structured() {
        let factory = MockPageFactory::new();
        factory.seed("#title", MockElement::with_text("Hi"));
        let file: TestFile = serde_json::from_value(json!({
            "name": "suite",
            "tests": [{
                "id": "t1",
                "name": "title check",
                "steps": [{"id": "s1", "type": "web_assert_text_equals",
                    "params": {"SELECTOR": "#title", "TEXT": "Welcome", "TIMEOUT": 0}}]
            }]
        }))
        .unwrap();

        let report = run_suite(RunRequest::new(file), Arc::new(factory))
            .await
            .unwrap();

        let tests = test_entries(&report);
        assert_eq!(tests[0].status, RunStatus::Failed);
        let error = tests[0].steps[0].error.clone().unwrap();
        assert_eq!(error.expected.as_deref(), Some("Welcome"));
        assert_eq!(error.actual.as_deref(), Some("Hi"));
        assert_eq!(error.step_type.as_deref(), Some("web_assert_text_equals"));
    }

    // S3: soft assertions aggregate, steps stay passed, test fails
    #[tokio::test]
    async fn soft_assertions_aggregate_in_order() {
        let report = run(json!({
            "name": "suite",
            "tests": [{
                "id": "t1",
                "name": "soft",
                "softAssertions": true,
                "steps": [
                    {"id": "a", "type": "assert_equals", "params": {"A": "1", "B": "1"}},
                    {"id": "b", "type": "assert_equals", "params": {"A": "x", "B": "foo"}},
                    {"id": "c", "type": "assert_equals", "params": {"A": "y", "B": "bar"}}
                ]
            }]
        }))
        .await;

        let tests = test_entries(&report);
        assert_eq!(tests[0].status, RunStatus::Failed);
        assert_eq!(tests[0].steps.len(), 3);
        assert!(tests[0].steps.iter().all(|s| s.status == RunStatus::Passed));

        let soft = &tests[0].soft_assertion_errors;
        assert_eq!(soft.len(), 2);
        assert_eq!(soft[0].expected.as_deref(), Some("foo"));
        assert_eq!(soft[1].expected.as_deref(), Some("bar"));
    }

    // S4: beforeEach failure skips the body, afterEach still runs
    #[tokio::test]
    async fn before_each_failure_skips_body_but_not_after_each() {
        let report = run(json!({
            "name": "suite",
            "beforeEach": [{"id": "x", "type": "assert_equals", "params": {"A": "1", "B": "2"}}],
            "afterEach": [{"id": "z", "type": "log", "params": {"MESSAGE": "teardown"}}],
            "tests": [{
                "id": "t1",
                "name": "t",
                "steps": [{"id": "y", "type": "log", "params": {"MESSAGE": "body"}}]
            }]
        }))
        .await;

        let hooks: Vec<&TestResult> = report.tests.iter().filter(|r| r.is_lifecycle).collect();
        assert_eq!(hooks.len(), 2);
        assert_eq!(hooks[0].lifecycle_type, Some(LifecycleType::BeforeEach));
        assert_eq!(hooks[0].status, RunStatus::Failed);
        assert_eq!(hooks[1].lifecycle_type, Some(LifecycleType::AfterEach));
        assert_eq!(hooks[1].status, RunStatus::Passed);
        assert_eq!(hooks[1].steps.len(), 1);

        let tests = test_entries(&report);
        assert_eq!(tests[0].status, RunStatus::Failed);
        assert!(tests[0].steps.is_empty(), "body must not have executed");
        assert_eq!(tests[0].error.as_deref(), Some("beforeEach hook failed"));
    }

    // S5: data-driven expansion
    #[tokio::test]
    async fn data_rows_expand_into_iterations() {
        let report = run(json!({
            "name": "suite",
            "tests": [{
                "id": "t1",
                "name": "rows",
                "data": [{"values": {"n": 1}}, {"values": {"n": 2}}],
                "steps": [{"id": "s1", "type": "assert_equals",
                    "params": {"A": "${data.n}", "B": "1"}}]
            }]
        }))
        .await;

        let tests = test_entries(&report);
        assert_eq!(tests.len(), 2);
        assert_eq!(tests[0].status, RunStatus::Passed);
        assert_eq!(tests[0].iteration.as_ref().unwrap().index, 0);
        assert_eq!(tests[0].test_name, "rows [Row 1]");

        assert_eq!(tests[1].status, RunStatus::Failed);
        assert_eq!(tests[1].iteration.as_ref().unwrap().index, 1);
        let error = tests[1].steps[0].error.clone().unwrap();
        assert_eq!(error.expected.as_deref(), Some("1"));
        assert_eq!(error.actual.as_deref(), Some("2"));
    }

    // S6: procedure invocation binds parameters into a child scope
    #[tokio::test]
    async fn procedure_call_expands_with_bound_params() {
        let factory = MockPageFactory::new();
        factory.seed("#u", MockElement::default());
        let handle = factory.handle();
        let file: TestFile = serde_json::from_value(json!({
            "name": "suite",
            "procedures": {
                "login": {
                    "name": "login",
                    "params": [{"name": "u"}],
                    "steps": [{"id": "p1", "type": "web_fill",
                        "params": {"SELECTOR": "#u", "VALUE": "${u}"}}]
                }
            },
            "tests": [{
                "id": "t1",
                "name": "login test",
                "steps": [{"id": "s1", "type": "custom_login", "params": {"U": "alice"}}]
            }]
        }))
        .unwrap();

        let report = run_suite(RunRequest::new(file), Arc::new(factory))
            .await
            .unwrap();

        let tests = test_entries(&report);
        assert_eq!(tests[0].status, RunStatus::Passed);
        let call = &tests[0].steps[0];
        assert_eq!(call.status, RunStatus::Passed);
        assert_eq!(call.children.len(), 1);
        assert_eq!(call.children[0].block_type, "web_fill");

        let state = handle.lock().unwrap();
        assert_eq!(state.elements.get("#u").unwrap().value, "alice");
    }

    #[tokio::test]
    async fn disabled_test_emits_one_skipped_result() {
        let report = run(json!({
            "name": "suite",
            "tests": [{
                "id": "t1",
                "name": "off",
                "disabled": true,
                "steps": [{"id": "s1", "type": "log", "params": {"MESSAGE": "never"}}]
            }]
        }))
        .await;

        let tests = test_entries(&report);
        assert_eq!(tests.len(), 1);
        assert_eq!(tests[0].status, RunStatus::Skipped);
        assert!(tests[0].steps.is_empty());
        assert_eq!(report.summary.skipped, 1);
    }

    #[tokio::test]
    async fn before_all_failure_skips_all_tests_but_after_all_runs() {
        let report = run(json!({
            "name": "suite",
            "beforeAll": [{"id": "ba", "type": "assert_equals", "params": {"A": "1", "B": "2"}}],
            "afterAll": [{"id": "aa", "type": "log", "params": {"MESSAGE": "cleanup"}}],
            "tests": [
                {"id": "t1", "name": "one", "steps": []},
                {"id": "t2", "name": "two", "steps": []}
            ]
        }))
        .await;

        let tests = test_entries(&report);
        assert_eq!(tests.len(), 2);
        assert!(tests.iter().all(|t| t.status == RunStatus::Skipped));
        assert!(tests
            .iter()
            .all(|t| t.error.as_deref() == Some("beforeAll hook failed")));

        let after_all = report
            .tests
            .iter()
            .find(|r| r.lifecycle_type == Some(LifecycleType::AfterAll))
            .expect("afterAll must have run");
        assert_eq!(after_all.status, RunStatus::Passed);
        assert_eq!(report.status, RunStatus::Failed);
    }

    #[tokio::test]
    async fn after_all_runs_after_body_failure() {
        let report = run(json!({
            "name": "suite",
            "afterAll": [{"id": "aa", "type": "log", "params": {"MESSAGE": "cleanup"}}],
            "tests": [{
                "id": "t1",
                "name": "failing",
                "steps": [{"id": "s1", "type": "assert_equals", "params": {"A": "1", "B": "2"}}]
            }]
        }))
        .await;

        assert!(report
            .tests
            .iter()
            .any(|r| r.lifecycle_type == Some(LifecycleType::AfterAll)
                && r.status == RunStatus::Passed));
        assert_eq!(report.status, RunStatus::Failed);
    }

    #[tokio::test]
    async fn hook_chain_runs_in_documented_order() {
        let folder: crate::protocol::FolderHooks = serde_json::from_value(json!({
            "beforeAll": [{"id": "f-ba", "type": "log", "params": {"MESSAGE": "f-ba"}}],
            "afterAll": [{"id": "f-aa", "type": "log", "params": {"MESSAGE": "f-aa"}}],
            "beforeEach": [{"id": "f-be", "type": "log", "params": {"MESSAGE": "f-be"}}],
            "afterEach": [{"id": "f-ae", "type": "log", "params": {"MESSAGE": "f-ae"}}]
        }))
        .unwrap();
        let file: TestFile = serde_json::from_value(json!({
            "name": "suite",
            "beforeEach": [{"id": "file-be", "type": "log", "params": {"MESSAGE": "file-be"}}],
            "afterEach": [{"id": "file-ae", "type": "log", "params": {"MESSAGE": "file-ae"}}],
            "tests": [{
                "id": "t1",
                "name": "t",
                "beforeEach": [{"id": "test-be", "type": "log", "params": {"MESSAGE": "test-be"}}],
                "afterEach": [{"id": "test-ae", "type": "log", "params": {"MESSAGE": "test-ae"}}],
                "steps": [{"id": "body", "type": "log", "params": {"MESSAGE": "body"}}]
            }]
        }))
        .unwrap();

        let mut request = RunRequest::new(file);
        request.folder_hooks = vec![folder];
        let report = run_request(request).await;

        // entry order: folder beforeAll, beforeEach, test, afterEach, folder afterAll
        let kinds: Vec<Option<LifecycleType>> =
            report.tests.iter().map(|r| r.lifecycle_type).collect();
        assert_eq!(
            kinds,
            vec![
                Some(LifecycleType::BeforeAll),
                Some(LifecycleType::BeforeEach),
                None,
                Some(LifecycleType::AfterEach),
                Some(LifecycleType::AfterAll),
            ]
        );

        let before_each = &report.tests[1];
        let ids: Vec<&str> = before_each.steps.iter().map(|s| s.step_id.as_str()).collect();
        assert_eq!(ids, ["f-be", "file-be", "test-be"]);

        let after_each = &report.tests[3];
        let ids: Vec<&str> = after_each.steps.iter().map(|s| s.step_id.as_str()).collect();
        assert_eq!(ids, ["test-ae", "file-ae", "f-ae"]);
    }

    #[tokio::test]
    async fn variable_writes_do_not_leak_across_tests() {
        let report = run(json!({
            "name": "suite",
            "variables": {"user": {"default": "alice"}},
            "tests": [
                {
                    "id": "t1",
                    "name": "writer",
                    "steps": [
                        {"id": "w", "type": "set_variable", "params": {"NAME": "user", "VALUE": "bob"}},
                        {"id": "r", "type": "assert_equals", "params": {"A": "${user}", "B": "bob"}}
                    ]
                },
                {
                    "id": "t2",
                    "name": "reader",
                    "steps": [{"id": "r2", "type": "assert_equals",
                        "params": {"A": "${user}", "B": "alice"}}]
                }
            ]
        }))
        .await;

        let tests = test_entries(&report);
        assert_eq!(tests[0].status, RunStatus::Passed);
        assert_eq!(tests[1].status, RunStatus::Passed);
    }

    #[tokio::test]
    async fn before_all_writes_are_visible_to_tests() {
        let report = run(json!({
            "name": "suite",
            "beforeAll": [{"id": "ba", "type": "set_variable",
                "params": {"NAME": "token", "VALUE": "t-123"}}],
            "tests": [{
                "id": "t1",
                "name": "uses token",
                "steps": [{"id": "s1", "type": "assert_equals",
                    "params": {"A": "${token}", "B": "t-123"}}]
            }]
        }))
        .await;

        assert_eq!(test_entries(&report)[0].status, RunStatus::Passed);
    }

    #[tokio::test]
    async fn cancel_before_first_step_skips_everything() {
        let file: TestFile = serde_json::from_value(json!({
            "name": "suite",
            "afterAll": [{"id": "aa", "type": "log", "params": {"MESSAGE": "teardown"}}],
            "tests": [
                {"id": "t1", "name": "one", "steps": [
                    {"id": "s1", "type": "log", "params": {"MESSAGE": "x"}}]},
                {"id": "t2", "name": "two", "steps": []}
            ]
        }))
        .unwrap();

        let mut request = RunRequest::new(file);
        request.options = RunOptions::default();
        request.options.cancel.cancel();
        let report = run_request(request).await;

        let tests = test_entries(&report);
        assert_eq!(tests.len(), 2);
        assert!(tests.iter().all(|t| t.status == RunStatus::Skipped));
        assert_eq!(report.status, RunStatus::Skipped);
        // afterAll still surfaced, its outcome recorded but not decisive
        assert!(report
            .tests
            .iter()
            .any(|r| r.lifecycle_type == Some(LifecycleType::AfterAll)));
    }

    #[tokio::test]
    async fn skip_if_short_circuits_the_test_as_skipped() {
        let report = run(json!({
            "name": "suite",
            "tests": [{
                "id": "t1",
                "name": "conditional",
                "steps": [
                    {"id": "s1", "type": "skip_if", "params": {
                        "CONDITION": {"id": "c1", "type": "compare",
                            "params": {"A": "1", "B": "1", "OPERATOR": "eq"}},
                        "REASON": "not applicable"
                    }},
                    {"id": "s2", "type": "log", "params": {"MESSAGE": "never"}}
                ]
            }]
        }))
        .await;

        let tests = test_entries(&report);
        assert_eq!(tests[0].status, RunStatus::Skipped);
        assert_eq!(tests[0].error.as_deref(), Some("not applicable"));
        assert_eq!(tests[0].steps.len(), 1);
    }

    #[tokio::test]
    async fn on_failure_handlers_run_at_teardown_only_when_failing() {
        let report = run(json!({
            "name": "suite",
            "tests": [
                {
                    "id": "t1",
                    "name": "failing with handler",
                    "steps": [
                        {"id": "h", "type": "on_failure", "children": {
                            "BODY": [{"id": "cleanup", "type": "log",
                                "params": {"MESSAGE": "recovered"}}]
                        }},
                        {"id": "s1", "type": "assert_equals", "params": {"A": "1", "B": "2"}}
                    ]
                },
                {
                    "id": "t2",
                    "name": "passing with handler",
                    "steps": [
                        {"id": "h2", "type": "on_failure", "children": {
                            "BODY": [{"id": "cleanup2", "type": "log",
                                "params": {"MESSAGE": "should not run"}}]
                        }},
                        {"id": "s2", "type": "log", "params": {"MESSAGE": "fine"}}
                    ]
                }
            ]
        }))
        .await;

        // failing test: an afterEach entry appears carrying the handler
        let handler_runs: Vec<&TestResult> = report
            .tests
            .iter()
            .filter(|r| r.lifecycle_type == Some(LifecycleType::AfterEach))
            .collect();
        assert_eq!(handler_runs.len(), 1);
        assert_eq!(handler_runs[0].steps[0].step_id, "cleanup");
    }

    #[tokio::test]
    async fn globals_feed_scope_and_testid_attribute() {
        let factory = MockPageFactory::new();
        factory.seed("[data-qa=\"go\"]", MockElement::with_text("Go"));
        let handle = factory.handle();

        let file: TestFile = serde_json::from_value(json!({
            "name": "suite",
            "tests": [{
                "id": "t1",
                "name": "uses globals",
                "steps": [
                    {"id": "s1", "type": "assert_equals",
                        "params": {"A": "${env}", "B": "staging"}},
                    {"id": "s2", "type": "web_click", "params": {"SELECTOR": "testid:go"}}
                ]
            }]
        }))
        .unwrap();

        let mut request = RunRequest::new(file);
        request.globals = Some(GlobalsDoc {
            variables: json!({"env": "staging"}).as_object().cloned().unwrap(),
            test_id_attribute: Some("data-qa".to_string()),
            procedures: Default::default(),
        });
        let report = run_suite(request, Arc::new(factory)).await.unwrap();

        assert_eq!(test_entries(&report)[0].status, RunStatus::Passed);
        let state = handle.lock().unwrap();
        assert!(state.actions.iter().any(|a| a.contains("data-qa")));
    }

    #[tokio::test]
    async fn invalid_document_aborts_before_execution() {
        let file: TestFile = serde_json::from_value(json!({
            "name": "suite",
            "version": "2.0.0",
            "tests": [{"id": "t1", "name": "t", "steps": []}]
        }))
        .unwrap();

        let result = run_suite(RunRequest::new(file), Arc::new(NoBrowser)).await;
        assert!(matches!(result, Err(EngineError::InvalidDocument(_))));
    }

    #[tokio::test]
    async fn unknown_block_type_is_rejected_up_front() {
        let file: TestFile = serde_json::from_value(json!({
            "name": "suite",
            "tests": [{
                "id": "t1",
                "name": "t",
                "steps": [{"id": "s1", "type": "definitely_not_a_block", "params": {}}]
            }]
        }))
        .unwrap();

        let result = run_suite(RunRequest::new(file), Arc::new(NoBrowser)).await;
        assert!(matches!(result, Err(EngineError::InvalidDocument(_))));
    }

    #[tokio::test]
    async fn empty_step_list_passes() {
        let report = run(json!({
            "name": "suite",
            "tests": [{"id": "t1", "name": "empty", "steps": []}]
        }))
        .await;

        let tests = test_entries(&report);
        assert_eq!(tests[0].status, RunStatus::Passed);
        assert!(tests[0].steps.is_empty());
    }

    #[tokio::test]
    async fn recursion_cap_produces_an_error() {
        let file: TestFile = serde_json::from_value(json!({
            "name": "suite",
            "procedures": {
                "loop": {
                    "name": "loop",
                    "steps": [{"id": "p1", "type": "custom_loop", "params": {}}]
                }
            },
            "tests": [{
                "id": "t1",
                "name": "recursive",
                "steps": [{"id": "s1", "type": "custom_loop", "params": {}}]
            }]
        }))
        .unwrap();

        let mut request = RunRequest::new(file);
        request.options.max_recursion_depth = 4;
        let report = run_request(request).await;

        let tests = test_entries(&report);
        assert_eq!(tests[0].status, RunStatus::Error);
        // the diagnostic names the procedure chain
        fn find_error(results: &[crate::report::StepResult]) -> Option<String> {
            for r in results {
                if let Some(e) = &r.error {
                    if e.message.contains("recursion depth") {
                        return Some(e.message.clone());
                    }
                }
                if let Some(found) = find_error(&r.children) {
                    return Some(found);
                }
            }
            None
        }
        let message = find_error(&tests[0].steps).expect("recursion diagnostic");
        assert!(message.contains("loop -> loop"));
    }
}
