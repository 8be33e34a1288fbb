// HTTP blocks: request methods, session header management, auth
// helpers, JSONPath extraction, and response assertions. The transport
// lives in the HttpSession capability; response inspection happens here
// against `ctx.last_response`.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use reqwest::Method;
use serde_json::{json, Value};

use super::check;
use crate::capability::http::{HttpError, RequestOptions};
use crate::context::ExecutionContext;
use crate::errors::StepFailure;
use crate::registry::{
    BlockCall, BlockCategory, BlockExecutor, BlockOutput, BlockRegistry, BlockSpec, Dispatcher,
    InputSpec,
};
use crate::template;

pub fn register(registry: &mut BlockRegistry) {
    let methods: &[(&str, Method, bool)] = &[
        ("http_get", Method::GET, false),
        ("http_post", Method::POST, true),
        ("http_put", Method::PUT, true),
        ("http_patch", Method::PATCH, true),
        ("http_delete", Method::DELETE, false),
    ];
    for (block_type, method, has_body) in methods {
        let mut inputs = vec![
            InputSpec::text("URL").required(),
            InputSpec::multiline("QUERY"),
            InputSpec::multiline("HEADERS"),
        ];
        if *has_body {
            inputs.insert(1, InputSpec::multiline("BODY"));
        }
        registry.register(
            BlockSpec::statement(block_type, BlockCategory::Http, inputs),
            Arc::new(RequestBlock {
                method: method.clone(),
            }),
        );
    }

    registry.register(
        BlockSpec::statement(
            "http_set_base_url",
            BlockCategory::Http,
            vec![InputSpec::text("URL").required()],
        ),
        Arc::new(SessionBlock {
            op: SessionOp::SetBaseUrl,
        }),
    );
    registry.register(
        BlockSpec::statement(
            "http_set_header",
            BlockCategory::Http,
            vec![
                InputSpec::text("NAME").required(),
                InputSpec::text("VALUE").required(),
            ],
        ),
        Arc::new(SessionBlock {
            op: SessionOp::SetHeader,
        }),
    );
    registry.register(
        BlockSpec::statement(
            "http_remove_header",
            BlockCategory::Http,
            vec![InputSpec::text("NAME").required()],
        ),
        Arc::new(SessionBlock {
            op: SessionOp::RemoveHeader,
        }),
    );
    registry.register(
        BlockSpec::statement(
            "http_set_headers",
            BlockCategory::Http,
            vec![InputSpec::multiline("HEADERS").required()],
        ),
        Arc::new(SessionBlock {
            op: SessionOp::SetHeaders,
        }),
    );
    registry.register(
        BlockSpec::statement(
            "http_auth_bearer",
            BlockCategory::Http,
            vec![InputSpec::text("TOKEN").required()],
        ),
        Arc::new(SessionBlock {
            op: SessionOp::AuthBearer,
        }),
    );
    registry.register(
        BlockSpec::statement(
            "http_auth_basic",
            BlockCategory::Http,
            vec![
                InputSpec::text("USERNAME").required(),
                InputSpec::text("PASSWORD").required(),
            ],
        ),
        Arc::new(SessionBlock {
            op: SessionOp::AuthBasic,
        }),
    );
    registry.register(
        BlockSpec::statement(
            "http_auth_api_key",
            BlockCategory::Http,
            vec![
                InputSpec::text("NAME").with_default(json!("X-API-Key")),
                InputSpec::text("VALUE").required(),
            ],
        ),
        Arc::new(SessionBlock {
            op: SessionOp::AuthApiKey,
        }),
    );

    registry.register(
        BlockSpec::statement(
            "http_extract",
            BlockCategory::Http,
            vec![
                InputSpec::text("PATH").required(),
                InputSpec::text("VARIABLE").required(),
            ],
        )
        .producing_value(),
        Arc::new(ExtractBlock),
    );
    registry.register(
        BlockSpec::statement(
            "http_assert_status",
            BlockCategory::Http,
            vec![InputSpec::text("STATUS").required()],
        ),
        Arc::new(AssertStatusBlock),
    );
    registry.register(
        BlockSpec::statement(
            "http_assert_body_contains",
            BlockCategory::Http,
            vec![
                InputSpec::text("TEXT"),
                InputSpec::text("PATH"),
                InputSpec::text("VALUE"),
            ],
        ),
        Arc::new(AssertBodyBlock),
    );
}

// ============================================================================
// JSON PATH
// ============================================================================

/// Looks up a JSONPath-style dotted path (`$.a.b[0].c`) in a value.
/// Supports object keys and `[n]` array indexes; anything missing along
/// the way resolves to nothing.
pub fn json_path<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    let mut trimmed = path.trim();
    trimmed = trimmed.strip_prefix('$').unwrap_or(trimmed);
    trimmed = trimmed.strip_prefix('.').unwrap_or(trimmed);
    if trimmed.is_empty() {
        return Some(root);
    }

    let mut current = root;
    for segment in trimmed.split('.') {
        let name_end = segment.find('[').unwrap_or(segment.len());
        let name = &segment[..name_end];
        if !name.is_empty() {
            current = current.get(name)?;
        }

        let mut rest = &segment[name_end..];
        while let Some(stripped) = rest.strip_prefix('[') {
            let close = stripped.find(']')?;
            let index: usize = stripped[..close].trim().parse().ok()?;
            current = current.get(index)?;
            rest = &stripped[close + 1..];
        }
        if !rest.is_empty() {
            return None;
        }
    }
    Some(current)
}

fn http_failure(error: HttpError) -> StepFailure {
    match error {
        HttpError::Cancelled => StepFailure::cancelled(),
        other => StepFailure::error(other.to_string()),
    }
}

fn parse_json_object(
    text: &str,
    input: &str,
) -> Result<serde_json::Map<String, Value>, StepFailure> {
    match serde_json::from_str::<Value>(text) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(other) => Err(StepFailure::error(format!(
            "input '{input}' expects a JSON object, got {other}"
        ))),
        Err(e) => Err(StepFailure::error(format!(
            "input '{input}' is not valid JSON: {e}"
        ))),
    }
}

// ============================================================================
// REQUEST METHODS
// ============================================================================

/// One executor behind GET/POST/PUT/PATCH/DELETE. The response lands in
/// `ctx.last_response` for the extract and assert blocks.
struct RequestBlock {
    method: Method,
}

#[async_trait]
impl BlockExecutor for RequestBlock {
    async fn execute(
        &self,
        call: &BlockCall<'_>,
        ctx: &mut ExecutionContext,
        _dispatcher: &Dispatcher,
    ) -> Result<BlockOutput, StepFailure> {
        let url = call.params.text("URL")?.to_string();

        let mut options = RequestOptions::default();
        if let Some(body_text) = call.params.opt_text("BODY") {
            if !body_text.trim().is_empty() {
                let body: Value = serde_json::from_str(body_text).map_err(|e| {
                    StepFailure::error(format!("input 'BODY' is not valid JSON: {e}"))
                })?;
                options.body = Some(body);
            }
        }
        if let Some(query_text) = call.params.opt_text("QUERY") {
            if !query_text.trim().is_empty() {
                let query = parse_json_object(query_text, "QUERY")?;
                options.query = query
                    .into_iter()
                    .map(|(k, v)| (k, template::stringify(&v)))
                    .collect();
            }
        }
        if let Some(headers_text) = call.params.opt_text("HEADERS") {
            if !headers_text.trim().is_empty() {
                let headers = parse_json_object(headers_text, "HEADERS")?;
                options.headers = headers
                    .into_iter()
                    .map(|(k, v)| (k, template::stringify(&v)))
                    .collect::<BTreeMap<_, _>>();
            }
        }

        let cancel = ctx.cancellation.clone();
        let method = self.method.clone();
        let response = {
            let session = ctx.http()?;
            session.request(method, &url, options, &cancel).await
        }
        .map_err(http_failure)?;

        let summary = format!("{} {url} -> {}", self.method, response.status);
        let output = json!({
            "_summary": summary,
            "status": response.status,
            "durationMs": response.duration_ms,
        });
        ctx.last_response = Some(response);

        Ok(BlockOutput::of(output))
    }
}

// ============================================================================
// SESSION STATE
// ============================================================================

#[derive(Debug, Clone, Copy)]
enum SessionOp {
    SetBaseUrl,
    SetHeader,
    RemoveHeader,
    SetHeaders,
    AuthBearer,
    AuthBasic,
    AuthApiKey,
}

/// Mutates the unit's HTTP session: base URL, persistent headers, and
/// the authorization helpers.
struct SessionBlock {
    op: SessionOp,
}

#[async_trait]
impl BlockExecutor for SessionBlock {
    async fn execute(
        &self,
        call: &BlockCall<'_>,
        ctx: &mut ExecutionContext,
        _dispatcher: &Dispatcher,
    ) -> Result<BlockOutput, StepFailure> {
        let summary = match self.op {
            SessionOp::SetBaseUrl => {
                let url = call.params.text("URL")?.to_string();
                ctx.http()?.set_base_url(&url);
                format!("base url = {url}")
            }
            SessionOp::SetHeader => {
                let name = call.params.text("NAME")?.to_string();
                let value = call.params.text("VALUE")?.to_string();
                ctx.http()?.set_header(&name, value);
                format!("header {name} set")
            }
            SessionOp::RemoveHeader => {
                let name = call.params.text("NAME")?.to_string();
                ctx.http()?.remove_header(&name);
                format!("header {name} removed")
            }
            SessionOp::SetHeaders => {
                let headers = parse_json_object(call.params.text("HEADERS")?, "HEADERS")?;
                let count = headers.len();
                let session = ctx.http()?;
                for (name, value) in headers {
                    session.set_header(name, template::stringify(&value));
                }
                format!("{count} headers set")
            }
            SessionOp::AuthBearer => {
                let token = call.params.text("TOKEN")?.to_string();
                ctx.http()?
                    .set_header("Authorization", format!("Bearer {token}"));
                "bearer authorization set".to_string()
            }
            SessionOp::AuthBasic => {
                let username = call.params.text("USERNAME")?;
                let password = call.params.text("PASSWORD")?;
                let encoded = BASE64.encode(format!("{username}:{password}"));
                ctx.http()?
                    .set_header("Authorization", format!("Basic {encoded}"));
                "basic authorization set".to_string()
            }
            SessionOp::AuthApiKey => {
                let name = call.params.text("NAME")?.to_string();
                let value = call.params.text("VALUE")?.to_string();
                ctx.http()?.set_header(&name, value);
                format!("api key header {name} set")
            }
        };

        Ok(BlockOutput::of(json!({ "_summary": summary })))
    }
}

// ============================================================================
// EXTRACT
// ============================================================================

/// Pulls a value out of the last response body and writes it to the
/// innermost writable scope.
struct ExtractBlock;

#[async_trait]
impl BlockExecutor for ExtractBlock {
    async fn execute(
        &self,
        call: &BlockCall<'_>,
        ctx: &mut ExecutionContext,
        _dispatcher: &Dispatcher,
    ) -> Result<BlockOutput, StepFailure> {
        let path = call.params.text("PATH")?.to_string();
        let variable = call.params.text("VARIABLE")?.to_string();
        let block_type = call.block_type().to_string();

        let response = ctx
            .last_response
            .as_ref()
            .ok_or_else(|| StepFailure::error("no http response available to extract from"))?;

        let value = json_path(&response.body, &path).cloned().ok_or_else(|| {
            StepFailure::assertion(format!("path '{path}' not found in response body"))
                .with_expected(format!("value at {path}"))
                .with_actual("<missing>")
                .with_step_type(block_type)
        })?;

        ctx.scopes.set(&variable, value.clone());
        Ok(BlockOutput::of(json!({
            "_summary": format!("{variable} = {}", template::stringify(&value)),
            "_value": value,
        })))
    }
}

// ============================================================================
// ASSERTIONS
// ============================================================================

/// Status assertion: exact (`200`) or a comma set (`200,204`).
struct AssertStatusBlock;

#[async_trait]
impl BlockExecutor for AssertStatusBlock {
    async fn execute(
        &self,
        call: &BlockCall<'_>,
        ctx: &mut ExecutionContext,
        _dispatcher: &Dispatcher,
    ) -> Result<BlockOutput, StepFailure> {
        let status_text = call.params.text("STATUS")?.to_string();
        let block_type = call.block_type().to_string();

        let expected: Vec<u16> = status_text
            .split(',')
            .map(|s| s.trim().parse::<u16>())
            .collect::<Result<_, _>>()
            .map_err(|_| {
                StepFailure::error(format!("input 'STATUS' is not a status set: '{status_text}'"))
            })?;

        let actual = ctx
            .last_response
            .as_ref()
            .ok_or_else(|| StepFailure::error("no http response available to assert on"))?
            .status;

        let passed = expected.contains(&actual);
        check(ctx, passed, || {
            StepFailure::assertion(format!("expected status {status_text}, got {actual}"))
                .with_expected(status_text.as_str())
                .with_actual(actual.to_string())
                .with_step_type(block_type)
        })?;

        Ok(BlockOutput::of(json!({
            "_summary": format!("status {actual}")
        })))
    }
}

/// Body assertion: substring over the raw text, or JSONPath equality
/// when PATH is given.
struct AssertBodyBlock;

#[async_trait]
impl BlockExecutor for AssertBodyBlock {
    async fn execute(
        &self,
        call: &BlockCall<'_>,
        ctx: &mut ExecutionContext,
        _dispatcher: &Dispatcher,
    ) -> Result<BlockOutput, StepFailure> {
        let block_type = call.block_type().to_string();
        let path = call.params.opt_text("PATH").map(str::to_string);
        let response = ctx
            .last_response
            .as_ref()
            .ok_or_else(|| StepFailure::error("no http response available to assert on"))?;

        if let Some(path) = path {
            let expected_text = call.params.text("VALUE")?.to_string();
            let expected: Value = serde_json::from_str(&expected_text)
                .unwrap_or(Value::String(expected_text.clone()));

            let found = json_path(&response.body, &path).cloned();
            let actual_text = found
                .as_ref()
                .map(template::stringify)
                .unwrap_or_else(|| "<missing>".to_string());
            let passed = match &found {
                Some(actual) => *actual == expected || actual_text == expected_text,
                None => false,
            };

            check(ctx, passed, || {
                StepFailure::assertion(format!(
                    "expected '{expected_text}' at {path}, got '{actual_text}'"
                ))
                .with_expected(expected_text)
                .with_actual(actual_text)
                .with_step_type(block_type)
            })?;
            Ok(BlockOutput::of(json!({
                "_summary": format!("body matches at {path}")
            })))
        } else {
            let needle = call.params.text("TEXT")?.to_string();
            let passed = response.body_text.contains(&needle);
            let body_excerpt: String = response.body_text.chars().take(200).collect();

            check(ctx, passed, || {
                StepFailure::assertion(format!("response body does not contain '{needle}'"))
                    .with_expected(format!("body contains '{needle}'"))
                    .with_actual(body_excerpt)
                    .with_step_type(block_type)
            })?;
            Ok(BlockOutput::of(json!({
                "_summary": format!("body contains '{needle}'")
            })))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blocks;
    use crate::capability::http::HttpResponseData;
    use crate::capability::NoBrowser;
    use crate::context::ScopeKind;
    use crate::procedures::ProcedureTable;
    use crate::protocol::{RunOptions, TestStep};
    use crate::registry::BlockRegistry;
    use crate::report::RunStatus;
    use serde_json::Map;

    fn dispatcher() -> Dispatcher {
        let mut registry = BlockRegistry::new();
        blocks::http::register(&mut registry);
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

    fn seed_response(ctx: &mut ExecutionContext, status: u16, body: Value) {
        ctx.last_response = Some(HttpResponseData {
            status,
            headers: BTreeMap::new(),
            body_text: body.to_string(),
            body,
            duration_ms: 12,
        });
    }

    fn step(value: Value) -> TestStep {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn json_path_walks_objects_and_arrays() {
        let body = json!({"data": {"users": [{"id": 7}, {"id": 9}]}});
        assert_eq!(json_path(&body, "$.data.users[1].id"), Some(&json!(9)));
        assert_eq!(json_path(&body, "data.users[0].id"), Some(&json!(7)));
        assert_eq!(json_path(&body, "$"), Some(&body));
        assert_eq!(json_path(&body, "$.data.missing"), None);
        assert_eq!(json_path(&body, "$.data.users[5]"), None);
    }

    #[tokio::test]
    async fn extract_writes_the_variable() {
        let dispatcher = dispatcher();
        let mut ctx = ctx();
        seed_response(&mut ctx, 200, json!({"data": {"token": "abc123"}}));

        let result = dispatcher
            .run_step(
                &step(json!({"id": "s1", "type": "http_extract",
                    "params": {"PATH": "$.data.token", "VARIABLE": "auth_token"}})),
                &mut ctx,
            )
            .await;

        assert_eq!(result.status, RunStatus::Passed);
        assert_eq!(ctx.scopes.get("auth_token"), Some(&json!("abc123")));
    }

    #[tokio::test]
    async fn extract_missing_path_fails() {
        let dispatcher = dispatcher();
        let mut ctx = ctx();
        seed_response(&mut ctx, 200, json!({"data": {}}));

        let result = dispatcher
            .run_step(
                &step(json!({"id": "s1", "type": "http_extract",
                    "params": {"PATH": "$.data.token", "VARIABLE": "t"}})),
                &mut ctx,
            )
            .await;

        assert_eq!(result.status, RunStatus::Failed);
    }

    #[tokio::test]
    async fn assert_status_accepts_a_set() {
        let dispatcher = dispatcher();
        let mut ctx = ctx();
        seed_response(&mut ctx, 204, json!(null));

        let passing = dispatcher
            .run_step(
                &step(json!({"id": "s1", "type": "http_assert_status",
                    "params": {"STATUS": "200,204"}})),
                &mut ctx,
            )
            .await;
        assert_eq!(passing.status, RunStatus::Passed);

        let failing = dispatcher
            .run_step(
                &step(json!({"id": "s2", "type": "http_assert_status",
                    "params": {"STATUS": "200"}})),
                &mut ctx,
            )
            .await;
        assert_eq!(failing.status, RunStatus::Failed);
        let error = failing.error.unwrap();
        assert_eq!(error.actual.as_deref(), Some("204"));
    }

    #[tokio::test]
    async fn assert_body_contains_substring() {
        let dispatcher = dispatcher();
        let mut ctx = ctx();
        seed_response(&mut ctx, 200, json!({"message": "user created"}));

        let result = dispatcher
            .run_step(
                &step(json!({"id": "s1", "type": "http_assert_body_contains",
                    "params": {"TEXT": "created"}})),
                &mut ctx,
            )
            .await;
        assert_eq!(result.status, RunStatus::Passed);
    }

    #[tokio::test]
    async fn assert_body_compares_at_path() {
        let dispatcher = dispatcher();
        let mut ctx = ctx();
        seed_response(&mut ctx, 200, json!({"data": {"id": 42}}));

        let passing = dispatcher
            .run_step(
                &step(json!({"id": "s1", "type": "http_assert_body_contains",
                    "params": {"PATH": "$.data.id", "VALUE": "42"}})),
                &mut ctx,
            )
            .await;
        assert_eq!(passing.status, RunStatus::Passed);

        let failing = dispatcher
            .run_step(
                &step(json!({"id": "s2", "type": "http_assert_body_contains",
                    "params": {"PATH": "$.data.id", "VALUE": "41"}})),
                &mut ctx,
            )
            .await;
        assert_eq!(failing.status, RunStatus::Failed);
    }

    #[tokio::test]
    async fn auth_helpers_set_session_headers() {
        let dispatcher = dispatcher();
        let mut ctx = ctx();

        dispatcher
            .run_step(
                &step(json!({"id": "s1", "type": "http_auth_bearer",
                    "params": {"TOKEN": "tok"}})),
                &mut ctx,
            )
            .await;
        assert_eq!(
            ctx.http().unwrap().headers().get("Authorization").map(String::as_str),
            Some("Bearer tok")
        );

        dispatcher
            .run_step(
                &step(json!({"id": "s2", "type": "http_auth_basic",
                    "params": {"USERNAME": "user", "PASSWORD": "pass"}})),
                &mut ctx,
            )
            .await;
        // "user:pass" base64-encoded
        assert_eq!(
            ctx.http().unwrap().headers().get("Authorization").map(String::as_str),
            Some("Basic dXNlcjpwYXNz")
        );

        dispatcher
            .run_step(
                &step(json!({"id": "s3", "type": "http_remove_header",
                    "params": {"NAME": "Authorization"}})),
                &mut ctx,
            )
            .await;
        assert!(!ctx.http().unwrap().headers().contains_key("Authorization"));
    }

    #[tokio::test]
    async fn soft_mode_buffers_http_assert_failures() {
        let dispatcher = dispatcher();
        let mut ctx = ctx();
        ctx.soft_assertions = true;
        seed_response(&mut ctx, 500, json!({"error": "boom"}));

        let result = dispatcher
            .run_step(
                &step(json!({"id": "s1", "type": "http_assert_status",
                    "params": {"STATUS": "200"}})),
                &mut ctx,
            )
            .await;

        assert_eq!(result.status, RunStatus::Passed);
        assert_eq!(ctx.soft_assertion_errors.len(), 1);
    }
}
