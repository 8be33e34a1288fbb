// Module: Validation
// Pre-execution document checks. All problems are collected and
// reported together; a failing document never starts executing.

use std::collections::HashSet;

use serde_json::Value;
use thiserror::Error;

use crate::procedures::{ProcedureTable, PROCEDURE_TYPE_PREFIX};
use crate::protocol::{TestFile, TestStep};
use crate::registry::BlockRegistry;

#[derive(Debug, Error)]
pub enum ValidationError {
    /// The engine accepts any 1.x document.
    #[error("document version '{version}' is not supported (expected 1.x)")]
    UnsupportedVersion { version: String },

    #[error("{path}: step id must not be empty")]
    EmptyStepId { path: String },

    #[error("{path}: duplicate step id '{id}'")]
    DuplicateStepId { path: String, id: String },

    #[error("step '{step_id}': unknown block type '{block_type}'")]
    UnknownBlockType { step_id: String, block_type: String },

    #[error("test at index {index}: id must not be empty")]
    EmptyTestId { index: usize },

    #[error("procedure '{name}': parameter name must not be empty")]
    EmptyParamName { name: String },
}

pub type ValidationResult = Result<(), Vec<ValidationError>>;

/// Validates a suite document against the registry and the unit's
/// procedure table. Collects every error instead of stopping at the
/// first.
pub fn validate_file(
    file: &TestFile,
    registry: &BlockRegistry,
    procedures: &ProcedureTable,
) -> ValidationResult {
    let mut errors = Vec::new();

    if !version_supported(&file.version) {
        errors.push(ValidationError::UnsupportedVersion {
            version: file.version.clone(),
        });
    }

    for (hook_name, steps) in [
        ("beforeAll", &file.before_all),
        ("afterAll", &file.after_all),
        ("beforeEach", &file.before_each),
        ("afterEach", &file.after_each),
    ] {
        if let Some(steps) = steps {
            validate_step_list(steps, hook_name, registry, procedures, &mut errors);
        }
    }

    for (name, procedure) in &file.procedures {
        for param in &procedure.params {
            if param.name.trim().is_empty() {
                errors.push(ValidationError::EmptyParamName { name: name.clone() });
            }
        }
        validate_step_list(
            &procedure.steps,
            &format!("procedures[{name}].steps"),
            registry,
            procedures,
            &mut errors,
        );
    }

    for (index, test) in file.tests.iter().enumerate() {
        if test.id.trim().is_empty() {
            errors.push(ValidationError::EmptyTestId { index });
        }
        let base = format!("tests[{}]", test.id);
        validate_step_list(
            &test.steps,
            &format!("{base}.steps"),
            registry,
            procedures,
            &mut errors,
        );
        for (hook_name, steps) in [
            ("beforeEach", &test.before_each),
            ("afterEach", &test.after_each),
        ] {
            if let Some(steps) = steps {
                validate_step_list(
                    steps,
                    &format!("{base}.{hook_name}"),
                    registry,
                    procedures,
                    &mut errors,
                );
            }
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

/// Any `1.x` semver string is accepted.
fn version_supported(version: &str) -> bool {
    version.split('.').next() == Some("1")
}

fn validate_step_list(
    steps: &[TestStep],
    path: &str,
    registry: &BlockRegistry,
    procedures: &ProcedureTable,
    errors: &mut Vec<ValidationError>,
) {
    let mut seen: HashSet<&str> = HashSet::new();
    for step in steps {
        if step.id.trim().is_empty() {
            errors.push(ValidationError::EmptyStepId {
                path: path.to_string(),
            });
        } else if !seen.insert(step.id.as_str()) {
            errors.push(ValidationError::DuplicateStepId {
                path: path.to_string(),
                id: step.id.clone(),
            });
        }

        validate_step(step, path, registry, procedures, errors);
    }
}

fn validate_step(
    step: &TestStep,
    path: &str,
    registry: &BlockRegistry,
    procedures: &ProcedureTable,
    errors: &mut Vec<ValidationError>,
) {
    let known = registry.contains(&step.block_type)
        || step
            .block_type
            .strip_prefix(PROCEDURE_TYPE_PREFIX)
            .map(|slug| procedures.contains(slug))
            .unwrap_or(false);
    if !known {
        errors.push(ValidationError::UnknownBlockType {
            step_id: step.id.clone(),
            block_type: step.block_type.clone(),
        });
    }

    // nested value steps inside params
    for value in step.params.values() {
        if let Some(nested) = as_nested_step(value) {
            validate_step(&nested, &format!("{path}.{}", step.id), registry, procedures, errors);
        }
    }

    // statement slots
    for (slot, children) in &step.children {
        validate_step_list(
            children,
            &format!("{path}.{}.{slot}", step.id),
            registry,
            procedures,
            errors,
        );
    }
}

/// A params entry shaped like `{id, type, ...}` is a nested value step.
fn as_nested_step(value: &Value) -> Option<TestStep> {
    let object = value.as_object()?;
    if object.contains_key("id") && object.contains_key("type") {
        serde_json::from_value(value.clone()).ok()
    } else {
        None
    }
}
