//! Filter expression model and the in-process predicate evaluator.
//!
//! Filters are parsed from nested JSON into a closed set of clauses and
//! operators; unknown `$` keys are rejected up front. `Filter::matches` is
//! the semantic ground truth: whenever the query compiler produces native
//! SQL, that SQL must select exactly the documents `matches` would.

use std::cmp::Ordering;

use serde_json::{Map, Value};

use crate::bytes;
use crate::document::lookup_path;
use crate::error::{Error, Result};

/// A parsed filter: a conjunction of top-level clauses. The empty filter
/// matches every document.
#[derive(Debug, Clone, Default)]
pub struct Filter {
    pub clauses: Vec<Clause>,
}

/// One top-level clause of a filter.
#[derive(Debug, Clone)]
pub enum Clause {
    And(Vec<Filter>),
    Or(Vec<Filter>),
    Nor(Vec<Filter>),
    Not(Filter),
    /// `$text: {$search: s}`
    Text(String),
    /// A field path with one or more operator conditions.
    Field { path: String, conds: Vec<FieldCond> },
}

/// Field-level conditions. Closed set: adding an operator means adding a
/// variant here plus its evaluator arm and its SQL template.
#[derive(Debug, Clone)]
pub enum FieldCond {
    Eq(Value),
    Ne(Value),
    Gt(Value),
    Gte(Value),
    Lt(Value),
    Lte(Value),
    In(Vec<Value>),
    Nin(Vec<Value>),
    Exists(bool),
    Mod { divisor: i64, remainder: i64 },
    Size(u64),
    Contains(String),
}

/// What the evaluator needs to know about the collection: the field paths
/// covered by full-text indexes, used by `$text`.
#[derive(Debug, Clone, Default)]
pub struct EvalContext {
    pub text_paths: Vec<String>,
}

impl Filter {
    /// Parse a JSON filter expression.
    pub fn parse(filter: &Value) -> Result<Filter> {
        let map = filter
            .as_object()
            .ok_or_else(|| Error::MalformedQuery("filter must be an object".to_string()))?;

        let mut clauses = Vec::with_capacity(map.len());
        for (key, value) in map {
            match key.as_str() {
                "$and" => clauses.push(Clause::And(parse_filter_list(value, "$and")?)),
                "$or" => clauses.push(Clause::Or(parse_filter_list(value, "$or")?)),
                "$nor" => clauses.push(Clause::Nor(parse_filter_list(value, "$nor")?)),
                "$not" => clauses.push(Clause::Not(Filter::parse(value)?)),
                "$text" => clauses.push(parse_text(value)?),
                key if key.starts_with('$') => {
                    return Err(Error::MalformedQuery(format!("unknown operator: {key}")))
                }
                path => clauses.push(parse_field(path, value)?),
            }
        }
        Ok(Filter { clauses })
    }

    /// Decide whether a document (with `_id` injected) matches this filter.
    pub fn matches(&self, data: &Map<String, Value>, ctx: &EvalContext) -> bool {
        self.clauses.iter().all(|clause| clause.matches(data, ctx))
    }
}

impl Clause {
    fn matches(&self, data: &Map<String, Value>, ctx: &EvalContext) -> bool {
        match self {
            Clause::And(filters) => filters.iter().all(|f| f.matches(data, ctx)),
            Clause::Or(filters) => filters.iter().any(|f| f.matches(data, ctx)),
            Clause::Nor(filters) => !filters.iter().any(|f| f.matches(data, ctx)),
            Clause::Not(filter) => !filter.matches(data, ctx),
            Clause::Text(search) => text_matches(data, search, ctx),
            Clause::Field { path, conds } => {
                let value = present(lookup_path(data, path));
                conds.iter().all(|cond| cond.holds(value))
            }
        }
    }
}

impl FieldCond {
    fn holds(&self, value: Option<&Value>) -> bool {
        match self {
            FieldCond::Eq(expected) => equals(value, expected),
            FieldCond::Ne(expected) => !equals(value, expected),
            FieldCond::Gt(expected) => {
                ordering(value, expected) == Some(Ordering::Greater)
            }
            FieldCond::Gte(expected) => matches!(
                ordering(value, expected),
                Some(Ordering::Greater | Ordering::Equal)
            ),
            FieldCond::Lt(expected) => ordering(value, expected) == Some(Ordering::Less),
            FieldCond::Lte(expected) => matches!(
                ordering(value, expected),
                Some(Ordering::Less | Ordering::Equal)
            ),
            FieldCond::In(candidates) => candidates.iter().any(|c| equals(value, c)),
            FieldCond::Nin(candidates) => !candidates.iter().any(|c| equals(value, c)),
            FieldCond::Exists(expected) => value.is_some() == *expected,
            FieldCond::Mod { divisor, remainder } => {
                if *divisor == 0 {
                    return false;
                }
                match value.and_then(number_as_i64) {
                    Some(n) => n % divisor == *remainder,
                    None => false,
                }
            }
            FieldCond::Size(expected) => value
                .and_then(Value::as_array)
                .map_or(false, |items| items.len() as u64 == *expected),
            FieldCond::Contains(needle) => value
                .and_then(Value::as_str)
                .map_or(false, |s| s.contains(needle.as_str())),
        }
    }
}

/// Fold explicit JSON `null` into the missing sentinel. SQLite's
/// `json_extract` returns SQL NULL for both, and the two paths must agree.
pub fn present(value: Option<&Value>) -> Option<&Value> {
    match value {
        Some(Value::Null) | None => None,
        other => other,
    }
}

fn equals(value: Option<&Value>, expected: &Value) -> bool {
    match value {
        Some(actual) => values_equal(actual, expected),
        // A `null` operand matches a missing (or explicitly null) field.
        None => expected.is_null(),
    }
}

fn ordering(value: Option<&Value>, expected: &Value) -> Option<Ordering> {
    compare_values(value?, expected)
}

/// Deep structural equality with int/float coercion, mirroring SQLite's
/// numeric comparison (`1 = 1.0` holds on both paths).
pub fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => match (x.as_i64(), y.as_i64()) {
            (Some(i), Some(j)) => i == j,
            _ => x.as_f64() == y.as_f64(),
        },
        (Value::Array(x), Value::Array(y)) => {
            x.len() == y.len() && x.iter().zip(y).all(|(v, w)| values_equal(v, w))
        }
        (Value::Object(x), Value::Object(y)) => {
            x.len() == y.len()
                && x.iter()
                    .all(|(k, v)| y.get(k).map_or(false, |w| values_equal(v, w)))
        }
        _ => a == b,
    }
}

/// Same-type comparison for the range operators. Cross-type comparisons are
/// undefined and never match, which is what the compiled SQL's type guards
/// produce as well.
pub fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

/// Total ordering over values, ranked the way SQLite orders the extracted
/// values in ORDER BY: missing/null first, then numbers (booleans extract as
/// 0/1), then text — where an array or object compares by its JSON text,
/// since that is what `json_extract` hands the native sort. Used for `$sort`
/// and the `$min`/`$max` mutators and accumulators.
pub fn order_values(a: &Value, b: &Value) -> Ordering {
    fn rank(value: &Value) -> u8 {
        match value {
            Value::Null => 0,
            Value::Bool(_) | Value::Number(_) => 1,
            Value::String(_) | Value::Array(_) | Value::Object(_) => 2,
        }
    }
    fn numeric(value: &Value) -> f64 {
        match value {
            Value::Bool(b) => *b as i64 as f64,
            Value::Number(n) => n.as_f64().unwrap_or(0.0),
            _ => 0.0,
        }
    }
    fn text(value: &Value) -> String {
        match value {
            Value::String(s) => s.clone(),
            other => serde_json::to_string(other).unwrap_or_default(),
        }
    }

    match rank(a).cmp(&rank(b)) {
        Ordering::Equal => match (a, b) {
            (Value::Null, Value::Null) => Ordering::Equal,
            (Value::Bool(_) | Value::Number(_), _) => numeric(a)
                .partial_cmp(&numeric(b))
                .unwrap_or(Ordering::Equal),
            (Value::String(x), Value::String(y)) => x.cmp(y),
            _ => text(a).cmp(&text(b)),
        },
        unequal => unequal,
    }
}

fn number_as_i64(value: &Value) -> Option<i64> {
    match value {
        // SQLite's % casts real operands to integer, so mirror the truncation.
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        _ => None,
    }
}

fn text_matches(data: &Map<String, Value>, search: &str, ctx: &EvalContext) -> bool {
    if ctx.text_paths.is_empty() {
        // No full-text index: substring scan over any string-valued field.
        let needle = search.to_lowercase();
        data.values().any(|v| any_string_contains(v, &needle))
    } else {
        // With indexes, mirror the compiled quoted-phrase MATCH: the search
        // terms must appear as consecutive whole tokens, not as a substring.
        let phrase = tokenize(search);
        if phrase.is_empty() {
            return false;
        }
        ctx.text_paths.iter().any(|path| {
            lookup_path(data, path)
                .and_then(Value::as_str)
                .map_or(false, |s| contains_phrase(&tokenize(s), &phrase))
        })
    }
}

/// Lower-cased alphanumeric tokens, the same splits the default `unicode61`
/// tokenizer makes for plain ASCII input.
fn tokenize(s: &str) -> Vec<String> {
    s.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}

fn contains_phrase(tokens: &[String], phrase: &[String]) -> bool {
    tokens.len() >= phrase.len() && tokens.windows(phrase.len()).any(|w| w == phrase)
}

fn any_string_contains(value: &Value, needle: &str) -> bool {
    match value {
        Value::String(s) => s.to_lowercase().contains(needle),
        Value::Array(items) => items.iter().any(|v| any_string_contains(v, needle)),
        Value::Object(map) => map.values().any(|v| any_string_contains(v, needle)),
        _ => false,
    }
}

fn parse_filter_list(value: &Value, op: &str) -> Result<Vec<Filter>> {
    let items = value
        .as_array()
        .ok_or_else(|| Error::MalformedQuery(format!("{op} expects an array of filters")))?;
    items.iter().map(Filter::parse).collect()
}

fn parse_text(value: &Value) -> Result<Clause> {
    let search = value
        .as_object()
        .and_then(|map| map.get("$search"))
        .and_then(Value::as_str)
        .ok_or_else(|| {
            Error::MalformedQuery("$text expects {\"$search\": <string>}".to_string())
        })?;
    Ok(Clause::Text(search.to_string()))
}

fn parse_field(path: &str, value: &Value) -> Result<Clause> {
    if let Value::Object(map) = value {
        let operator_keys = map.keys().filter(|k| k.starts_with('$')).count();
        if operator_keys > 0 && !bytes::is_binary(value) {
            if operator_keys != map.len() {
                return Err(Error::MalformedQuery(format!(
                    "field {path:?} mixes operators and literal keys"
                )));
            }
            let mut conds = Vec::with_capacity(map.len());
            for (op, operand) in map {
                conds.push(parse_cond(op, operand)?);
            }
            return Ok(Clause::Field {
                path: path.to_string(),
                conds,
            });
        }
    }
    Ok(Clause::Field {
        path: path.to_string(),
        conds: vec![FieldCond::Eq(value.clone())],
    })
}

fn parse_cond(op: &str, operand: &Value) -> Result<FieldCond> {
    match op {
        "$eq" => Ok(FieldCond::Eq(operand.clone())),
        "$ne" => Ok(FieldCond::Ne(operand.clone())),
        "$gt" => Ok(FieldCond::Gt(operand.clone())),
        "$gte" => Ok(FieldCond::Gte(operand.clone())),
        "$lt" => Ok(FieldCond::Lt(operand.clone())),
        "$lte" => Ok(FieldCond::Lte(operand.clone())),
        "$in" => Ok(FieldCond::In(parse_value_list(operand, "$in")?)),
        "$nin" => Ok(FieldCond::Nin(parse_value_list(operand, "$nin")?)),
        "$exists" => operand
            .as_bool()
            .map(FieldCond::Exists)
            .ok_or_else(|| Error::MalformedQuery("$exists expects a boolean".to_string())),
        "$mod" => {
            let pair = operand.as_array().filter(|a| a.len() == 2);
            let divisor = pair.and_then(|a| a[0].as_i64());
            let remainder = pair.and_then(|a| a[1].as_i64());
            match (divisor, remainder) {
                (Some(divisor), Some(remainder)) => Ok(FieldCond::Mod { divisor, remainder }),
                _ => Err(Error::MalformedQuery(
                    "$mod expects [divisor, remainder]".to_string(),
                )),
            }
        }
        "$size" => operand
            .as_u64()
            .map(FieldCond::Size)
            .ok_or_else(|| Error::MalformedQuery("$size expects a non-negative integer".to_string())),
        "$contains" => operand
            .as_str()
            .map(|s| FieldCond::Contains(s.to_string()))
            .ok_or_else(|| Error::MalformedQuery("$contains expects a string".to_string())),
        other => Err(Error::MalformedQuery(format!("unknown operator: {other}"))),
    }
}

fn parse_value_list(operand: &Value, op: &str) -> Result<Vec<Value>> {
    operand
        .as_array()
        .cloned()
        .ok_or_else(|| Error::MalformedQuery(format!("{op} expects an array")))
}
