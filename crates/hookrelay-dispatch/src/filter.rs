//! Subscription filter evaluation.
//!
//! A predicate is a JSON object mapping dot-separated field paths to either
//! an expected value, a nested predicate, or an operator object:
//!
//! ```json
//! {"data.amount": {"$gte": 100}, "data.currency": {"$in": ["EUR", "USD"]},
//!  "$or": [{"type": "refund"}, {"data.flagged": true}]}
//! ```
//!
//! Arrays match when any element matches, and numeric path segments index
//! into arrays. Evaluation is pure.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::LazyLock;

use moka::sync::Cache;
use regex::Regex;
use serde_json::{Map, Value};

use crate::error::FieldErrors;
use crate::models::{Event, SubscriptionFilter, WILDCARD_EVENT_TYPE};

const OPERATORS: &[&str] = &[
    "$eq", "$neq", "$gt", "$gte", "$lt", "$lte", "$in", "$nin", "$exist", "$regex", "$or", "$and",
];

const REGEX_CACHE_CAPACITY: u64 = 1024;

/// Compiled `$regex` operands, shared by every evaluation in the process.
static REGEX_CACHE: LazyLock<Cache<String, Regex>> =
    LazyLock::new(|| Cache::new(REGEX_CACHE_CAPACITY));

/// Compile `pattern` once and reuse it. Invalid patterns are not cached.
fn cached_regex(pattern: &str) -> Option<Regex> {
    if let Some(re) = REGEX_CACHE.get(pattern) {
        return Some(re);
    }
    let re = Regex::new(pattern).ok()?;
    REGEX_CACHE.insert(pattern.to_string(), re.clone());
    Some(re)
}

/// Does `event` pass the subscription's filter?
#[must_use]
pub fn matches(filter: &SubscriptionFilter, event: &Event) -> bool {
    if !event_type_allowed(&filter.event_types, &event.event_type) {
        return false;
    }

    if !is_empty_predicate(&filter.headers) {
        let headers = headers_value(&event.headers);
        if !evaluate(&lowercase_keys(&filter.headers), &headers) {
            return false;
        }
    }

    if !is_empty_predicate(&filter.body) {
        let Some(body) = event.payload_json() else {
            return false;
        };
        if !evaluate(&filter.body, &body) {
            return false;
        }
    }

    true
}

/// Event-type allow-list check. An empty list or `*` admits every type.
#[must_use]
pub fn event_type_allowed(allowed: &[String], event_type: &str) -> bool {
    allowed.is_empty()
        || allowed
            .iter()
            .any(|t| t == WILDCARD_EVENT_TYPE || t == event_type)
}

/// Evaluate a predicate object against a JSON document.
#[must_use]
pub fn evaluate(predicate: &Value, actual: &Value) -> bool {
    let Value::Object(fields) = predicate else {
        return is_empty_predicate(predicate) || predicate == actual;
    };

    fields.iter().all(|(key, expected)| match key.as_str() {
        "$or" => expected
            .as_array()
            .is_some_and(|branches| branches.iter().any(|b| evaluate(b, actual))),
        "$and" => expected
            .as_array()
            .is_some_and(|branches| branches.iter().all(|b| evaluate(b, actual))),
        op if op.starts_with('$') => apply_operator(op, expected, Some(actual)),
        path => {
            let segments: Vec<&str> = path.split('.').collect();
            match_path(&segments, expected, actual)
        }
    })
}

fn is_empty_predicate(predicate: &Value) -> bool {
    match predicate {
        Value::Null => true,
        Value::Object(map) => map.is_empty(),
        _ => false,
    }
}

fn headers_value(headers: &BTreeMap<String, String>) -> Value {
    Value::Object(
        headers
            .iter()
            .map(|(k, v)| (k.clone(), Value::String(v.clone())))
            .collect(),
    )
}

/// Lowercase header names, descending into `$or`/`$and` branches.
/// Operands are left untouched.
fn lowercase_keys(predicate: &Value) -> Value {
    match predicate {
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| match (k.as_str(), v) {
                    ("$or" | "$and", Value::Array(branches)) => (
                        k.clone(),
                        Value::Array(branches.iter().map(lowercase_keys).collect()),
                    ),
                    (op, _) if op.starts_with('$') => (k.clone(), v.clone()),
                    (name, _) => (name.to_ascii_lowercase(), v.clone()),
                })
                .collect(),
        ),
        other => other.clone(),
    }
}

fn match_path(segments: &[&str], expected: &Value, actual: &Value) -> bool {
    let Some((head, rest)) = segments.split_first() else {
        return match_value(expected, Some(actual));
    };

    match actual {
        Value::Object(map) => match map.get(*head) {
            Some(next) => match_path(rest, expected, next),
            None => match_value(expected, None),
        },
        Value::Array(items) => match head.parse::<usize>() {
            Ok(index) => match items.get(index) {
                Some(next) => match_path(rest, expected, next),
                None => match_value(expected, None),
            },
            Err(_) => items.iter().any(|item| match_path(segments, expected, item)),
        },
        _ => match_value(expected, None),
    }
}

fn is_operator_object(map: &Map<String, Value>) -> bool {
    !map.is_empty() && map.keys().all(|k| k.starts_with('$'))
}

/// Compare an expected value or operator object with the value found at a path.
fn match_value(expected: &Value, actual: Option<&Value>) -> bool {
    match expected {
        Value::Object(map) if is_operator_object(map) => map
            .iter()
            .all(|(op, operand)| apply_operator(op, operand, actual)),
        Value::Object(_) => actual.is_some_and(|value| match value {
            Value::Array(items) => items.iter().any(|item| evaluate(expected, item)),
            other => evaluate(expected, other),
        }),
        _ => actual.is_some_and(|value| equals(expected, value)),
    }
}

/// Equality with any-element semantics for array values.
fn equals(expected: &Value, actual: &Value) -> bool {
    if expected == actual {
        return true;
    }
    match (expected, actual) {
        (Value::Number(a), Value::Number(b)) => a.as_f64() == b.as_f64(),
        (Value::Array(_), _) => false,
        (_, Value::Array(items)) => items.iter().any(|item| equals(expected, item)),
        _ => false,
    }
}

fn compare(actual: &Value, operand: &Value) -> Option<Ordering> {
    match (actual, operand) {
        (Value::Number(a), Value::Number(b)) => a.as_f64()?.partial_cmp(&b.as_f64()?),
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        _ => None,
    }
}

fn ordered(actual: Option<&Value>, operand: &Value, accept: fn(Ordering) -> bool) -> bool {
    match actual {
        Some(Value::Array(items)) => items
            .iter()
            .any(|item| compare(item, operand).is_some_and(accept)),
        Some(value) => compare(value, operand).is_some_and(accept),
        None => false,
    }
}

fn apply_operator(op: &str, operand: &Value, actual: Option<&Value>) -> bool {
    match op {
        "$eq" => actual.is_some_and(|value| equals(operand, value)),
        "$neq" => !actual.is_some_and(|value| equals(operand, value)),
        "$gt" => ordered(actual, operand, |o| o == Ordering::Greater),
        "$gte" => ordered(actual, operand, |o| o != Ordering::Less),
        "$lt" => ordered(actual, operand, |o| o == Ordering::Less),
        "$lte" => ordered(actual, operand, |o| o != Ordering::Greater),
        "$in" => match (operand.as_array(), actual) {
            (Some(candidates), Some(value)) => candidates.iter().any(|c| equals(c, value)),
            _ => false,
        },
        "$nin" => match (operand.as_array(), actual) {
            (Some(candidates), Some(value)) => !candidates.iter().any(|c| equals(c, value)),
            (Some(_), None) => true,
            _ => false,
        },
        "$exist" => {
            let present = actual.is_some_and(|value| !value.is_null());
            operand.as_bool().is_some_and(|want| want == present)
        }
        "$regex" => match (operand.as_str(), actual) {
            (Some(pattern), Some(value)) => cached_regex(pattern).is_some_and(|re| match value {
                Value::String(s) => re.is_match(s),
                Value::Array(items) => items
                    .iter()
                    .filter_map(Value::as_str)
                    .any(|s| re.is_match(s)),
                _ => false,
            }),
            _ => false,
        },
        "$or" => operand
            .as_array()
            .is_some_and(|branches| branches.iter().any(|b| match_value(b, actual))),
        "$and" => operand
            .as_array()
            .is_some_and(|branches| branches.iter().all(|b| match_value(b, actual))),
        _ => false,
    }
}

/// Check a subscription filter for unknown operators, bad operand shapes and
/// invalid regular expressions.
#[must_use]
pub fn validate_filter(filter: &SubscriptionFilter) -> FieldErrors {
    let mut errors = FieldErrors::default();
    if filter.event_types.iter().any(|t| t.trim().is_empty()) {
        errors.push("filter.event_types", "event types must not be empty");
    }
    validate_predicate("filter.headers", &filter.headers, &mut errors);
    validate_predicate("filter.body", &filter.body, &mut errors);
    errors
}

fn validate_predicate(field: &str, predicate: &Value, errors: &mut FieldErrors) {
    match predicate {
        Value::Null => {}
        Value::Object(map) => {
            for (key, value) in map {
                let path = format!("{field}.{key}");
                if key.starts_with('$') {
                    validate_operator(&path, key, value, errors);
                } else if let Value::Object(_) = value {
                    validate_predicate(&path, value, errors);
                }
            }
        }
        _ => errors.push(field, "predicate must be an object"),
    }
}

fn validate_operator(path: &str, op: &str, operand: &Value, errors: &mut FieldErrors) {
    if !OPERATORS.contains(&op) {
        errors.push(path, format!("unknown operator {op}"));
        return;
    }
    match op {
        "$in" | "$nin" if !operand.is_array() => errors.push(path, "operand must be an array"),
        "$or" | "$and" => match operand.as_array() {
            Some(branches) => {
                for (i, branch) in branches.iter().enumerate() {
                    validate_predicate(&format!("{path}[{i}]"), branch, errors);
                }
            }
            None => errors.push(path, "operand must be an array"),
        },
        "$exist" if !operand.is_boolean() => errors.push(path, "operand must be a boolean"),
        "$regex" => match operand.as_str() {
            Some(pattern) => {
                if let Err(e) = Regex::new(pattern) {
                    errors.push(path, format!("invalid regular expression: {e}"));
                }
            }
            None => errors.push(path, "operand must be a string"),
        },
        _ => {}
    }
}
