//! Tiny predicate expression language for `if`/`elseIf`/`while` conditions.
//!
//! Predicates are dotted paths into the run context, optionally compared
//! against a literal with one of `== != > >= < <=`, e.g. `"amount>120"` or
//! `"steps.check-amount.approved==true"`. A bare path with no operator is
//! evaluated for truthiness. This is intentionally small: handler bodies
//! are opaque, so only the branch condition itself needs evaluating here,
//! never a full expression language.

use std::sync::OnceLock;

use regex::Regex;
use serde_json::Value;

use crate::context::Context;

fn comparison_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^\s*([A-Za-z_][\w.\[\]]*)\s*(==|!=|>=|<=|>|<)\s*(.+?)\s*$").unwrap())
}

/// Evaluate a predicate string against `ctx`, returning its boolean result
/// or a human-readable error (surfaced as `InterpreterError::PredicateError`).
pub fn evaluate(expr: &str, ctx: &Context) -> Result<bool, String> {
    let trimmed = expr.trim();
    if trimmed.eq_ignore_ascii_case("true") {
        return Ok(true);
    }
    if trimmed.eq_ignore_ascii_case("false") {
        return Ok(false);
    }

    if let Some(captures) = comparison_pattern().captures(trimmed) {
        let path = &captures[1];
        let op = &captures[2];
        let literal = captures[3].trim();
        let lhs = resolve(path, ctx).ok_or_else(|| format!("unknown field '{path}'"))?;
        let rhs = parse_literal(literal, ctx);
        return compare(&lhs, op, &rhs);
    }

    // Bare path: truthy check.
    match resolve(trimmed, ctx) {
        Some(value) => Ok(is_truthy(&value)),
        None => Err(format!("unknown field '{trimmed}'")),
    }
}

/// Resolve a dotted path against the context: `steps.<name>.<field...>`,
/// `last`/`last.<field...>`, or otherwise a path into the trigger payload.
pub fn resolve(path: &str, ctx: &Context) -> Option<Value> {
    let mut parts = path.split('.');
    let head = parts.next()?;
    let rest: Vec<&str> = parts.collect();

    let root = match head {
        "last" => ctx.last.clone()?,
        "steps" => {
            let (step_name, field_path) = rest.split_first()?;
            let value = ctx.steps.get(*step_name)?.clone();
            return Some(traverse(&value, field_path));
        }
        "payload" => ctx.payload.clone(),
        other => ctx.payload.get(other)?.clone(),
    };

    if head == "last" {
        Some(traverse(&root, &rest))
    } else {
        Some(root)
    }
}

fn traverse(value: &Value, path: &[&str]) -> Value {
    let mut current = value.clone();
    for segment in path {
        current = match current.get(segment) {
            Some(v) => v.clone(),
            None => return Value::Null,
        };
    }
    current
}

fn parse_literal(literal: &str, ctx: &Context) -> Value {
    if let Ok(n) = literal.parse::<f64>() {
        return Value::from(n);
    }
    if literal.eq_ignore_ascii_case("true") {
        return Value::Bool(true);
    }
    if literal.eq_ignore_ascii_case("false") {
        return Value::Bool(false);
    }
    if literal.eq_ignore_ascii_case("null") {
        return Value::Null;
    }
    if (literal.starts_with('"') && literal.ends_with('"') && literal.len() >= 2)
        || (literal.starts_with('\'') && literal.ends_with('\'') && literal.len() >= 2)
    {
        return Value::String(literal[1..literal.len() - 1].to_string());
    }
    // Bare word: try resolving it as another path (field-to-field
    // comparison); fall back to treating it as a string literal.
    resolve(literal, ctx).unwrap_or_else(|| Value::String(literal.to_string()))
}

fn compare(lhs: &Value, op: &str, rhs: &Value) -> Result<bool, String> {
    match op {
        "==" => Ok(values_equal(lhs, rhs)),
        "!=" => Ok(!values_equal(lhs, rhs)),
        ">" | ">=" | "<" | "<=" => {
            let (l, r) = (as_f64(lhs), as_f64(rhs));
            match (l, r) {
                (Some(l), Some(r)) => Ok(match op {
                    ">" => l > r,
                    ">=" => l >= r,
                    "<" => l < r,
                    "<=" => l <= r,
                    _ => unreachable!(),
                }),
                _ => Err(format!("cannot order-compare non-numeric values {lhs} {op} {rhs}")),
            }
        }
        _ => Err(format!("unsupported operator '{op}'")),
    }
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (as_f64(a), as_f64(b)) {
        (Some(a), Some(b)) => a == b,
        _ => a == b,
    }
}

fn as_f64(value: &Value) -> Option<f64> {
    value.as_f64()
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::StateKv;
    use crate::store::MemoryStore;
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::Arc;
    use tokio_util::sync::CancellationToken;

    fn ctx(payload: Value) -> Context {
        let store = Arc::new(MemoryStore::new());
        let kv = StateKv::new(store);
        Context {
            run_id: uuid::Uuid::now_v7(),
            workflow_id: "wf".into(),
            step_name: String::new(),
            payload,
            steps: HashMap::new(),
            last: None,
            services: Vec::new(),
            trigger_headers: HashMap::new(),
            state: kv.scoped_to_run(uuid::Uuid::now_v7()),
            cancel: CancellationToken::new(),
            error: None,
        }
    }

    #[test]
    fn numeric_greater_than() {
        assert!(evaluate("amount>120", &ctx(json!({"amount": 500}))).unwrap());
        assert!(!evaluate("amount>120", &ctx(json!({"amount": 50}))).unwrap());
    }

    #[test]
    fn equality_against_string_literal() {
        let c = ctx(json!({"status": "approved"}));
        assert!(evaluate("status==\"approved\"", &c).unwrap());
    }

    #[test]
    fn bare_path_truthy_check() {
        assert!(evaluate("enabled", &ctx(json!({"enabled": true}))).unwrap());
        assert!(!evaluate("enabled", &ctx(json!({"enabled": false}))).unwrap());
    }

    #[test]
    fn literal_true_false() {
        assert!(evaluate("true", &ctx(json!({}))).unwrap());
        assert!(!evaluate("false", &ctx(json!({}))).unwrap());
    }

    #[test]
    fn unknown_field_is_an_error() {
        assert!(evaluate("missing>1", &ctx(json!({}))).is_err());
    }

    #[test]
    fn steps_path_reads_prior_output() {
        let mut c = ctx(json!({}));
        c.steps.insert("check".to_string(), json!({"amount": 300}));
        assert!(evaluate("steps.check.amount>=300", &c).unwrap());
    }
}
