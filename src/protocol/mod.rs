// Module: Protocol
// Data model for suite documents: test files, steps, procedures, hooks,
// globals, and the host-facing run request.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;

// ============================================================================
// TEST STEP
// ============================================================================

/// One invocation of a block.
///
/// `params` maps field names to scalar values or, for value-kind inputs,
/// to a nested step object. Statement slots (ordered child step lists)
/// live in `children`, keyed by slot name (`THEN`, `ELSE`, `BODY`, ...).
/// Steps are immutable during execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestStep {
    /// Unique within the enclosing step list.
    pub id: String,

    /// Registered block type key, e.g. `web_click` or `custom_login`.
    #[serde(rename = "type")]
    pub block_type: String,

    #[serde(default)]
    pub params: Map<String, Value>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub children: BTreeMap<String, Vec<TestStep>>,
}

impl TestStep {
    /// The ordered steps of a statement slot, or an empty list when the
    /// slot is absent.
    pub fn slot(&self, name: &str) -> &[TestStep] {
        self.children.get(name).map(Vec::as_slice).unwrap_or(&[])
    }
}

// ============================================================================
// TEST CASE
// ============================================================================

/// One row of a data-driven test.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataRow {
    #[serde(default)]
    pub name: Option<String>,

    /// Bound under the `data` scope name for the iteration, so steps can
    /// reference `${data.field}`.
    pub values: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestCase {
    pub id: String,
    pub name: String,

    #[serde(default)]
    pub description: Option<String>,

    #[serde(default)]
    pub steps: Vec<TestStep>,

    /// Per-test hook overrides, appended after the file-level hooks.
    #[serde(default)]
    pub before_each: Option<Vec<TestStep>>,
    #[serde(default)]
    pub after_each: Option<Vec<TestStep>>,

    #[serde(default)]
    pub tags: Vec<String>,

    /// A disabled test is reported as skipped without executing anything.
    #[serde(default)]
    pub disabled: bool,

    /// When present, the test expands into one independent run per row.
    #[serde(default)]
    pub data: Option<Vec<DataRow>>,

    /// When true, assertion failures accumulate instead of aborting.
    #[serde(default)]
    pub soft_assertions: bool,
}

// ============================================================================
// VARIABLES & PROCEDURES
// ============================================================================

/// A file-level variable declaration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VariableDef {
    pub default: Value,

    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
}

/// Declared type of a procedure parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ParamKind {
    String,
    Number,
    Boolean,
    #[default]
    Any,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcedureParam {
    pub name: String,

    #[serde(rename = "type", default)]
    pub kind: ParamKind,

    #[serde(default)]
    pub default: Option<Value>,

    #[serde(default)]
    pub description: Option<String>,
}

/// A reusable, user-authored step list with typed parameters.
///
/// Invoked through a step whose type is `custom_<slug>` where the slug is
/// the lower-cased procedure name with non-alphanumerics folded to `_`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcedureDefinition {
    pub name: String,

    #[serde(default)]
    pub description: Option<String>,

    #[serde(default)]
    pub params: Vec<ProcedureParam>,

    pub steps: Vec<TestStep>,
}

// ============================================================================
// TEST FILE
// ============================================================================

/// A suite document: one scheduling unit for the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestFile {
    /// Semver document version; the engine accepts any `1.x`.
    #[serde(default = "default_version")]
    pub version: String,

    pub name: String,

    #[serde(default)]
    pub description: Option<String>,

    #[serde(default)]
    pub variables: BTreeMap<String, VariableDef>,

    #[serde(default)]
    pub procedures: BTreeMap<String, ProcedureDefinition>,

    #[serde(default)]
    pub before_all: Option<Vec<TestStep>>,
    #[serde(default)]
    pub after_all: Option<Vec<TestStep>>,
    #[serde(default)]
    pub before_each: Option<Vec<TestStep>>,
    #[serde(default)]
    pub after_each: Option<Vec<TestStep>>,

    #[serde(default)]
    pub tests: Vec<TestCase>,
}

fn default_version() -> String {
    "1.0.0".to_string()
}

// ============================================================================
// FOLDER HOOKS & GLOBALS
// ============================================================================

/// Hooks contributed by one folder level, ordered outermost to innermost
/// by the caller. Discovery is the file-tree loader's job; the engine
/// accepts a pre-resolved chain.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FolderHooks {
    #[serde(default)]
    pub before_all: Option<Vec<TestStep>>,
    #[serde(default)]
    pub after_all: Option<Vec<TestStep>>,
    #[serde(default)]
    pub before_each: Option<Vec<TestStep>>,
    #[serde(default)]
    pub after_each: Option<Vec<TestStep>>,
}

/// Project-level globals document. The engine consumes `variables`
/// (frozen into the global scope), `testIdAttribute`, and `procedures`
/// (file-local procedures win on name collision). Other keys are
/// accepted and ignored.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GlobalsDoc {
    #[serde(default)]
    pub variables: Map<String, Value>,

    #[serde(default)]
    pub test_id_attribute: Option<String>,

    #[serde(default)]
    pub procedures: BTreeMap<String, ProcedureDefinition>,
}

// ============================================================================
// RUN REQUEST
// ============================================================================

/// Default per-operation web timeout (30s).
pub const DEFAULT_WEB_TIMEOUT_MS: u64 = 30_000;

/// Default procedure recursion cap.
pub const DEFAULT_MAX_RECURSION_DEPTH: u32 = 64;

/// Default selector attribute behind the `testid:` shorthand.
pub const DEFAULT_TEST_ID_ATTRIBUTE: &str = "data-testid";

/// Engine tuning knobs supplied by the host.
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub headless: bool,

    /// Default per-operation timeout in milliseconds.
    pub web_timeout_ms: u64,

    /// Procedure nesting cap; exceeding it is a step error.
    pub max_recursion_depth: u32,

    /// Cooperative cancel signal for the whole scheduling unit.
    pub cancel: CancellationToken,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            headless: true,
            web_timeout_ms: DEFAULT_WEB_TIMEOUT_MS,
            max_recursion_depth: DEFAULT_MAX_RECURSION_DEPTH,
            cancel: CancellationToken::new(),
        }
    }
}

/// Host-to-engine run request: one test file plus its ambient chain.
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub test_file: TestFile,

    /// Outermost folder first.
    pub folder_hooks: Vec<FolderHooks>,

    pub globals: Option<GlobalsDoc>,

    pub options: RunOptions,
}

impl RunRequest {
    pub fn new(test_file: TestFile) -> Self {
        Self {
            test_file,
            folder_hooks: Vec::new(),
            globals: None,
            options: RunOptions::default(),
        }
    }
}
