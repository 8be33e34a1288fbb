// Module: Hooks
// Composes folder-chain, file, and per-test hooks into the ordered
// step lists the scheduler executes around each test.

use crate::protocol::{FolderHooks, TestCase, TestFile, TestStep};

/// Pre-composed hook chain for one scheduling unit.
///
/// Ordering rules:
/// - beforeAll: outermost folder -> innermost folder -> file
/// - afterAll: file -> innermost folder -> outermost folder
/// - beforeEach: folders outermost-in -> file -> test
/// - afterEach: test -> file -> folders innermost-out
#[derive(Debug, Clone, Default)]
pub struct HookChain {
    folders: Vec<FolderHooks>,
    file_before_all: Vec<TestStep>,
    file_after_all: Vec<TestStep>,
    file_before_each: Vec<TestStep>,
    file_after_each: Vec<TestStep>,
}

impl HookChain {
    pub fn compose(folders: &[FolderHooks], file: &TestFile) -> Self {
        Self {
            folders: folders.to_vec(),
            file_before_all: file.before_all.clone().unwrap_or_default(),
            file_after_all: file.after_all.clone().unwrap_or_default(),
            file_before_each: file.before_each.clone().unwrap_or_default(),
            file_after_each: file.after_each.clone().unwrap_or_default(),
        }
    }

    pub fn before_all(&self) -> Vec<TestStep> {
        let mut steps = Vec::new();
        for folder in &self.folders {
            steps.extend(folder.before_all.clone().unwrap_or_default());
        }
        steps.extend(self.file_before_all.clone());
        steps
    }

    pub fn after_all(&self) -> Vec<TestStep> {
        let mut steps = self.file_after_all.clone();
        for folder in self.folders.iter().rev() {
            steps.extend(folder.after_all.clone().unwrap_or_default());
        }
        steps
    }

    pub fn before_each(&self, test: &TestCase) -> Vec<TestStep> {
        let mut steps = Vec::new();
        for folder in &self.folders {
            steps.extend(folder.before_each.clone().unwrap_or_default());
        }
        steps.extend(self.file_before_each.clone());
        steps.extend(test.before_each.clone().unwrap_or_default());
        steps
    }

    pub fn after_each(&self, test: &TestCase) -> Vec<TestStep> {
        let mut steps = test.after_each.clone().unwrap_or_default();
        steps.extend(self.file_after_each.clone());
        for folder in self.folders.iter().rev() {
            steps.extend(folder.after_each.clone().unwrap_or_default());
        }
        steps
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn marker(id: &str) -> TestStep {
        serde_json::from_value(json!({
            "id": id,
            "type": "log",
            "params": {"MESSAGE": id}
        }))
        .unwrap()
    }

    fn folder(prefix: &str) -> FolderHooks {
        FolderHooks {
            before_all: Some(vec![marker(&format!("{prefix}-ba"))]),
            after_all: Some(vec![marker(&format!("{prefix}-aa"))]),
            before_each: Some(vec![marker(&format!("{prefix}-be"))]),
            after_each: Some(vec![marker(&format!("{prefix}-ae"))]),
        }
    }

    fn file() -> TestFile {
        serde_json::from_value(json!({
            "name": "suite",
            "beforeAll": [{"id": "file-ba", "type": "log", "params": {"MESSAGE": "x"}}],
            "afterAll": [{"id": "file-aa", "type": "log", "params": {"MESSAGE": "x"}}],
            "beforeEach": [{"id": "file-be", "type": "log", "params": {"MESSAGE": "x"}}],
            "afterEach": [{"id": "file-ae", "type": "log", "params": {"MESSAGE": "x"}}],
            "tests": []
        }))
        .unwrap()
    }

    fn test_with_hooks() -> TestCase {
        serde_json::from_value(json!({
            "id": "t1",
            "name": "t",
            "steps": [],
            "beforeEach": [{"id": "test-be", "type": "log", "params": {"MESSAGE": "x"}}],
            "afterEach": [{"id": "test-ae", "type": "log", "params": {"MESSAGE": "x"}}]
        }))
        .unwrap()
    }

    fn ids(steps: &[TestStep]) -> Vec<&str> {
        steps.iter().map(|s| s.id.as_str()).collect()
    }

    #[test]
    fn before_all_runs_outermost_first() {
        let chain = HookChain::compose(&[folder("outer"), folder("inner")], &file());
        assert_eq!(ids(&chain.before_all()), ["outer-ba", "inner-ba", "file-ba"]);
    }

    #[test]
    fn after_all_reverses_the_chain() {
        let chain = HookChain::compose(&[folder("outer"), folder("inner")], &file());
        assert_eq!(ids(&chain.after_all()), ["file-aa", "inner-aa", "outer-aa"]);
    }

    #[test]
    fn before_each_ends_with_the_test_override() {
        let chain = HookChain::compose(&[folder("outer"), folder("inner")], &file());
        assert_eq!(
            ids(&chain.before_each(&test_with_hooks())),
            ["outer-be", "inner-be", "file-be", "test-be"]
        );
    }

    #[test]
    fn after_each_starts_with_the_test_override() {
        let chain = HookChain::compose(&[folder("outer"), folder("inner")], &file());
        assert_eq!(
            ids(&chain.after_each(&test_with_hooks())),
            ["test-ae", "file-ae", "inner-ae", "outer-ae"]
        );
    }

    #[test]
    fn absent_hooks_compose_to_empty_lists() {
        let bare: TestFile =
            serde_json::from_value(json!({"name": "s", "tests": []})).unwrap();
        let chain = HookChain::compose(&[], &bare);
        let test: TestCase =
            serde_json::from_value(json!({"id": "t", "name": "t", "steps": []})).unwrap();

        assert!(chain.before_all().is_empty());
        assert!(chain.after_all().is_empty());
        assert!(chain.before_each(&test).is_empty());
        assert!(chain.after_each(&test).is_empty());
    }
}
