// Module: Template
// `${path.to.value}` placeholder resolution. A string is parsed once
// into literal/placeholder chunks, so templates reused across many
// steps resolve without re-scanning.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Map, Value};

use crate::context::ScopeChain;

/// Placeholder grammar: `${ident(.ident)*}` where `ident` is
/// `[A-Za-z_][A-Za-z0-9_]*`. Anything else inside `${...}` is left
/// untouched.
static PLACEHOLDER_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*(?:\.[A-Za-z_][A-Za-z0-9_]*)*)\}")
        .expect("valid placeholder regex")
});

// ============================================================================
// TEMPLATE
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
enum Segment {
    Literal(String),
    /// A parsed placeholder: the dotted path plus the raw `${...}` text,
    /// kept so unresolvable placeholders stay literal.
    Placeholder { path: Vec<String>, raw: String },
}

/// A pre-parsed interpolation template.
#[derive(Debug, Clone)]
pub struct Template {
    segments: Vec<Segment>,
}

impl Template {
    /// Single pass over the input, splitting it into chunks.
    pub fn parse(input: &str) -> Self {
        let mut segments = Vec::new();
        let mut last_index = 0;

        for capture in PLACEHOLDER_RE.captures_iter(input) {
            let matched = match capture.get(0) {
                Some(m) => m,
                None => continue,
            };
            if matched.start() > last_index {
                segments.push(Segment::Literal(input[last_index..matched.start()].to_string()));
            }
            let path = capture
                .get(1)
                .map(|m| m.as_str())
                .unwrap_or_default()
                .split('.')
                .map(str::to_string)
                .collect();
            segments.push(Segment::Placeholder {
                path,
                raw: matched.as_str().to_string(),
            });
            last_index = matched.end();
        }
        if last_index < input.len() {
            segments.push(Segment::Literal(input[last_index..].to_string()));
        }

        Self { segments }
    }

    /// True when the input contained no placeholders at all.
    pub fn is_literal(&self) -> bool {
        self.segments
            .iter()
            .all(|s| matches!(s, Segment::Literal(_)))
    }

    /// Substitutes every placeholder the scope chain can resolve;
    /// unresolved ones are preserved verbatim.
    pub fn resolve(&self, scopes: &ScopeChain) -> String {
        let mut result = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => result.push_str(text),
                Segment::Placeholder { path, raw } => match scopes.resolve_path(path) {
                    Some(value) => result.push_str(&stringify(value)),
                    None => result.push_str(raw),
                },
            }
        }
        result
    }
}

// ============================================================================
// CONVENIENCE HELPERS
// ============================================================================

/// One-shot parse + resolve.
pub fn resolve_str(input: &str, scopes: &ScopeChain) -> String {
    Template::parse(input).resolve(scopes)
}

/// Recursively resolves placeholders in every string of a JSON value.
pub fn resolve_value(value: &Value, scopes: &ScopeChain) -> Value {
    match value {
        Value::String(s) => Value::String(resolve_str(s, scopes)),
        Value::Array(items) => Value::Array(items.iter().map(|v| resolve_value(v, scopes)).collect()),
        Value::Object(map) => {
            let mut resolved = Map::with_capacity(map.len());
            for (key, item) in map {
                resolved.insert(key.clone(), resolve_value(item, scopes));
            }
            Value::Object(resolved)
        }
        _ => value.clone(),
    }
}

/// Text form of a resolved value: strings substitute as-is, everything
/// else (numbers, booleans, arrays, objects, null) as JSON.
pub fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
