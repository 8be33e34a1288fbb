// Module: Loader
// Reads suite documents, folder-hook files, and the globals document
// from disk. The raw JSON is checked against the embedded schema before
// typed deserialization, so malformed documents abort with one
// diagnostic instead of failing mid-run.

use std::path::Path;

use anyhow::{bail, Context, Result};
use jsonschema::JSONSchema;
use once_cell::sync::Lazy;
use serde_json::Value;

use crate::protocol::{FolderHooks, GlobalsDoc, TestFile};

static TEST_FILE_SCHEMA: Lazy<JSONSchema> = Lazy::new(|| {
    let schema: Value = serde_json::from_str(include_str!("../../schemas/testfile.schema.json"))
        .expect("embedded schema is valid JSON");
    JSONSchema::compile(&schema).expect("embedded schema compiles")
});

pub fn load_test_file<P: AsRef<Path>>(path: P) -> Result<TestFile> {
    let content = std::fs::read_to_string(&path)
        .with_context(|| format!("failed to read suite file {:?}", path.as_ref()))?;
    let raw: Value = serde_json::from_str(&content)
        .with_context(|| format!("suite file {:?} is not valid JSON", path.as_ref()))?;

    if let Err(errors) = TEST_FILE_SCHEMA.validate(&raw) {
        let messages: Vec<String> = errors
            .map(|e| format!("{} (at {})", e, e.instance_path))
            .collect();
        bail!(
            "suite file {:?} does not match the document schema:\n  {}",
            path.as_ref(),
            messages.join("\n  ")
        );
    }

    let file = serde_json::from_value(raw)
        .with_context(|| format!("failed to parse suite file {:?}", path.as_ref()))?;
    Ok(file)
}

/// Loads folder-hook files, outermost folder first, preserving the
/// order the host discovered them in.
pub fn load_folder_hooks<P: AsRef<Path>>(paths: &[P]) -> Result<Vec<FolderHooks>> {
    paths
        .iter()
        .map(|path| {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read hooks file {:?}", path.as_ref()))?;
            serde_json::from_str(&content)
                .with_context(|| format!("failed to parse hooks file {:?}", path.as_ref()))
        })
        .collect()
}

pub fn load_globals<P: AsRef<Path>>(path: P) -> Result<GlobalsDoc> {
    let content = std::fs::read_to_string(&path)
        .with_context(|| format!("failed to read globals file {:?}", path.as_ref()))?;
    serde_json::from_str(&content)
        .with_context(|| format!("failed to parse globals file {:?}", path.as_ref()))
}
