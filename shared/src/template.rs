//! Path extraction and token substitution for request/response shaping.
//!
//! Two primitives, both pure:
//!
//! - [`get_by_path`] walks a JSON value along a dot/bracket path such as
//!   `choices[0].message.content` and returns `None` as soon as a link is
//!   missing or `null`.
//! - [`build_body`] deep-clones a JSON template and substitutes `${name}` /
//!   `{{name}}` tokens. A string leaf that is *exactly* one token receives the
//!   raw typed value; anything else gets inline, stringified substitution.

use regex::{Captures, Regex};
use serde_json::Value;
use std::sync::OnceLock;

fn exact_token() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^(?:\$\{\s*([\w.\[\]]+)\s*\}|\{\{\s*([\w.\[\]]+)\s*\}\})$")
            .expect("valid exact token pattern")
    })
}

fn inline_token() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"\$\{\s*([\w.\[\]]+)\s*\}|\{\{\s*([\w.\[\]]+)\s*\}\}")
            .expect("valid inline token pattern")
    })
}

/// Split `a.b[0].c` (or `a["x.y"]`) into its segments.
pub fn tokenize(path: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut chars = path.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '.' => {
                if !current.is_empty() {
                    tokens.push(std::mem::take(&mut current));
                }
            }
            '[' => {
                if !current.is_empty() {
                    tokens.push(std::mem::take(&mut current));
                }
                let mut inner = String::new();
                for next in chars.by_ref() {
                    if next == ']' {
                        break;
                    }
                    inner.push(next);
                }
                let inner = inner.trim().trim_matches(|q| q == '"' || q == '\'');
                if !inner.is_empty() {
                    tokens.push(inner.to_string());
                }
            }
            _ => current.push(c),
        }
    }

    if !current.is_empty() {
        tokens.push(current);
    }
    tokens
}

/// Walk `value` along `path`. Missing links and `null` yield `None`.
pub fn get_by_path<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = value;
    for token in tokenize(path) {
        current = match current {
            Value::Object(map) => map.get(&token)?,
            Value::Array(items) => items.get(token.parse::<usize>().ok()?)?,
            _ => return None,
        };
        if current.is_null() {
            return None;
        }
    }
    if current.is_null() {
        None
    } else {
        Some(current)
    }
}

/// Render a value for inline substitution: strings as-is, `null` as empty,
/// everything else in JSON form.
fn stringify(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    }
}

fn token_name<'c>(captures: &'c Captures) -> &'c str {
    captures
        .get(1)
        .or_else(|| captures.get(2))
        .map(|m| m.as_str())
        .unwrap_or_default()
}

/// Inline substitution on a single string.
pub fn render_str(template: &str, vars: &Value) -> String {
    inline_token()
        .replace_all(template, |captures: &Captures| {
            stringify(get_by_path(vars, token_name(captures)))
        })
        .into_owned()
}

fn substitute_leaf(template: &str, vars: &Value) -> Value {
    if let Some(captures) = exact_token().captures(template) {
        return get_by_path(vars, token_name(&captures))
            .cloned()
            .unwrap_or(Value::Null);
    }
    Value::String(render_str(template, vars))
}

/// Build a request body from a template.
pub fn build_body(template: &Value, vars: &Value) -> Value {
    match template {
        Value::String(s) => substitute_leaf(s, vars),
        Value::Array(items) => Value::Array(items.iter().map(|item| build_body(item, vars)).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(key, item)| (key.clone(), build_body(item, vars)))
                .collect(),
        ),
        other => other.clone(),
    }
}
