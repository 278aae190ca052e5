//! The predicate engine deciding which messages a dispatch item takes.
//!
//! Condition sets are OR'ed; keys within a set are AND'ed. A value may be a
//! list (membership), an ordering string (`'<30'`, `'>=50'` compared as
//! numbers), or a scalar (equality). A nested `except` map negates. A
//! metadata key missing from the message fails the whole set, `except`
//! included.

use serde_json::Value;
use tracing::warn;

use crate::config::DispatchItem;

/// Does `data` satisfy the item's conditions? No conditions means yes.
pub fn check_conditions(data: &Value, item: &DispatchItem) -> bool {
    let Some(conditions) = &item.conditions else {
        return true;
    };
    conditions
        .iter()
        .any(|set| check_condition_set(data, set, false))
}

fn check_condition_set(data: &Value, set: &Value, negate: bool) -> bool {
    let Some(set) = set.as_object() else {
        warn!("condition set is not a mapping, refusing the match");
        return false;
    };
    for (key, value) in set {
        if key == "except" {
            if !check_condition_set(data, value, true) {
                return negate;
            }
        } else {
            match check_condition(data, key, value) {
                Some(true) => {}
                Some(false) => return negate,
                None => {
                    warn!(key = %key, "missing metadata info to check condition");
                    return false;
                }
            }
        }
    }
    !negate
}

/// One key check. `None` when the metadata key is absent.
fn check_condition(data: &Value, key: &str, expected: &Value) -> Option<bool> {
    let actual = data.get(key)?;
    match expected {
        Value::Array(choices) => Some(choices.contains(actual)),
        Value::String(text) if starts_with_operator(text) => {
            Some(compare_numeric(actual, text).unwrap_or(false))
        }
        other => Some(actual == other),
    }
}

fn starts_with_operator(text: &str) -> bool {
    text.starts_with(['<', '>', '=', '!'])
}

/// `actual <op> rhs` with both sides as floats, e.g. `daylight: '<30'`.
fn compare_numeric(actual: &Value, expr: &str) -> Option<bool> {
    let lhs = match actual {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => s.parse::<f64>().ok()?,
        _ => return None,
    };
    let (op, rhs) = split_operator(expr)?;
    let rhs: f64 = rhs.trim().parse().ok()?;
    Some(match op {
        "<" => lhs < rhs,
        "<=" => lhs <= rhs,
        ">" => lhs > rhs,
        ">=" => lhs >= rhs,
        "==" | "=" => lhs == rhs,
        "!=" => lhs != rhs,
        _ => return None,
    })
}

fn split_operator(expr: &str) -> Option<(&str, &str)> {
    for op in ["<=", ">=", "==", "!=", "<", ">", "="] {
        if let Some(rest) = expr.strip_prefix(op) {
            return Some((op, rest));
        }
    }
    None
}
