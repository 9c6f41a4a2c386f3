//! Update document model, SQL compilation, and the in-process applier.
//!
//! An update parses into a closed list of actions. Compilation produces at
//! most two statements worth of fragments (a `json_remove` for unsets, a
//! `json_set` for everything else); actions with no faithful JSON1 form fall
//! back to `apply_update`, which is also what upserts and the fallback write
//! path use.

use serde_json::{Map, Value};

use crate::bytes;
use crate::document::{
    get_path_mut, lookup_path, path_literal, remove_path, set_path, ID_FIELD,
};
use crate::error::{Error, Result};
use crate::filter::{order_values, values_equal};
use crate::compile::{SqlFragment, SqlParam, Translation};

/// A parsed update document.
#[derive(Debug, Clone)]
pub struct Update {
    pub ops: Vec<UpdateAction>,
}

/// One update operator with its field assignments, in document order.
#[derive(Debug, Clone)]
pub enum UpdateAction {
    Set(Vec<(String, Value)>),
    Unset(Vec<String>),
    Inc(Vec<(String, Value)>),
    Mul(Vec<(String, Value)>),
    Min(Vec<(String, Value)>),
    Max(Vec<(String, Value)>),
    Push(Vec<(String, Value)>),
    Pull(Vec<(String, Value)>),
    Pop(Vec<(String, i64)>),
    Rename(Vec<(String, String)>),
}

impl Update {
    /// Parse an update document. Every key must be a known `$` operator and
    /// every target path must stay clear of `_id`.
    pub fn parse(update: &Value) -> Result<Update> {
        let map = update
            .as_object()
            .ok_or_else(|| Error::MalformedQuery("update must be an object".to_string()))?;
        if map.is_empty() {
            return Err(Error::MalformedQuery("update has no operators".to_string()));
        }

        let mut ops = Vec::with_capacity(map.len());
        for (key, operand) in map {
            let fields = operand.as_object().ok_or_else(|| {
                Error::MalformedQuery(format!("{key} expects an object of fields"))
            })?;
            if fields.is_empty() {
                return Err(Error::MalformedQuery(format!("{key} with nothing to apply")));
            }
            for path in fields.keys() {
                if path == ID_FIELD || path.starts_with("_id.") {
                    return Err(Error::MalformedQuery("_id is immutable".to_string()));
                }
            }

            let op = match key.as_str() {
                "$set" => UpdateAction::Set(pairs(fields)),
                "$unset" => UpdateAction::Unset(fields.keys().cloned().collect()),
                "$inc" => UpdateAction::Inc(numeric_pairs(key, fields)?),
                "$mul" => UpdateAction::Mul(numeric_pairs(key, fields)?),
                "$min" => UpdateAction::Min(pairs(fields)),
                "$max" => UpdateAction::Max(pairs(fields)),
                "$push" => UpdateAction::Push(pairs(fields)),
                "$pull" => UpdateAction::Pull(pairs(fields)),
                "$pop" => {
                    let mut out = Vec::with_capacity(fields.len());
                    for (path, operand) in fields {
                        match operand.as_i64() {
                            Some(direction @ (1 | -1)) => out.push((path.clone(), direction)),
                            _ => {
                                return Err(Error::MalformedQuery(
                                    "$pop expects 1 or -1".to_string(),
                                ))
                            }
                        }
                    }
                    UpdateAction::Pop(out)
                }
                "$rename" => {
                    let mut out = Vec::with_capacity(fields.len());
                    for (path, operand) in fields {
                        let target = operand.as_str().ok_or_else(|| {
                            Error::MalformedQuery("$rename expects a string target".to_string())
                        })?;
                        if target == ID_FIELD || target.starts_with("_id.") {
                            return Err(Error::MalformedQuery("_id is immutable".to_string()));
                        }
                        out.push((path.clone(), target.to_string()));
                    }
                    UpdateAction::Rename(out)
                }
                other => {
                    return Err(Error::MalformedQuery(format!(
                        "unknown update operator: {other}"
                    )))
                }
            };
            ops.push(op);
        }
        Ok(Update { ops })
    }
}

fn pairs(fields: &Map<String, Value>) -> Vec<(String, Value)> {
    fields.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
}

fn numeric_pairs(op: &str, fields: &Map<String, Value>) -> Result<Vec<(String, Value)>> {
    for operand in fields.values() {
        if !operand.is_number() {
            return Err(Error::MalformedQuery(format!("{op} expects numeric operands")));
        }
    }
    Ok(pairs(fields))
}

/// Compile an update into full-payload expressions, one UPDATE statement
/// each (`data = json_remove(data, ...)`, `data = json_set(data, ...)`,
/// `data = CASE ... END`), applied sequentially in operator order with
/// `$unset` first.
///
/// The numeric mutators guard on `json_type` so a non-numeric stored value
/// is left untouched, exactly as `apply_update` leaves it; without the guard
/// SQLite would coerce text to 0 and rewrite booleans as integers. Array
/// mutators and `$rename` have no faithful JSON1 form, and binary payloads
/// must round-trip through the wrapper codec, so those fall back.
pub fn compile_update(update: &Update) -> Translation<Vec<SqlFragment>> {
    let mut removes: Vec<String> = Vec::new();
    let mut fragments: Vec<SqlFragment> = Vec::new();

    for op in &update.ops {
        match op {
            UpdateAction::Set(fields) => {
                let mut sql = String::from("json_set(data");
                let mut params = Vec::new();
                for (path, value) in fields {
                    if bytes::contains_binary(value) {
                        return Translation::Evaluator;
                    }
                    let (expr, expr_params) = value_expr(value);
                    sql.push_str(&format!(", '{}', {expr}", path_literal(path)));
                    params.extend(expr_params);
                }
                sql.push(')');
                fragments.push(SqlFragment { sql, params });
            }
            UpdateAction::Unset(paths) => removes.extend(paths.iter().cloned()),
            UpdateAction::Inc(fields) => {
                for (path, value) in fields {
                    fragments.push(arith_fragment(path, value, "+"));
                }
            }
            UpdateAction::Mul(fields) => {
                for (path, value) in fields {
                    fragments.push(arith_fragment(path, value, "*"));
                }
            }
            UpdateAction::Min(fields) => {
                for (path, value) in fields {
                    match min_max_fragment(path, value, true) {
                        Some(fragment) => fragments.push(fragment),
                        None => return Translation::Evaluator,
                    }
                }
            }
            UpdateAction::Max(fields) => {
                for (path, value) in fields {
                    match min_max_fragment(path, value, false) {
                        Some(fragment) => fragments.push(fragment),
                        None => return Translation::Evaluator,
                    }
                }
            }
            UpdateAction::Push(_)
            | UpdateAction::Pull(_)
            | UpdateAction::Pop(_)
            | UpdateAction::Rename(_) => return Translation::Evaluator,
        }
    }

    let mut out = Vec::new();
    if !removes.is_empty() {
        let paths: Vec<String> = removes
            .iter()
            .map(|path| format!("'{}'", path_literal(path)))
            .collect();
        out.push(SqlFragment {
            sql: format!("json_remove(data, {})", paths.join(", ")),
            params: vec![],
        });
    }
    out.extend(fragments);
    Translation::Native(out)
}

/// `$inc`/`$mul`: arithmetic on numeric (or missing, starting from 0)
/// targets only. Booleans, text, and composites pass through unchanged.
fn arith_fragment(path: &str, value: &Value, op: &str) -> SqlFragment {
    let p = path_literal(path);
    SqlFragment {
        sql: format!(
            "CASE WHEN COALESCE(json_type(data, '{p}'), 'integer') IN ('integer', 'real') \
             THEN json_set(data, '{p}', COALESCE(json_extract(data, '{p}'), 0) {op} ?) \
             ELSE data END"
        ),
        params: vec![numeric_param(value)],
    }
}

/// `$min`/`$max` replace the stored value with the operand exactly when the
/// evaluator's value ordering says so (nulls below numbers below text, with
/// booleans as 0/1 and composites compared by their JSON text), and
/// otherwise leave the payload byte-for-byte alone.
fn min_max_fragment(path: &str, value: &Value, is_min: bool) -> Option<SqlFragment> {
    let p = path_literal(path);
    let param = match value {
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                SqlParam::Integer(i)
            } else {
                SqlParam::Real(n.as_f64()?)
            }
        }
        Value::String(s) => SqlParam::Text(s.clone()),
        _ => return None,
    };
    let set = format!("json_set(data, '{p}', ?)");
    let kind = format!("json_type(data, '{p}')");

    let (sql, count) = match (value, is_min) {
        (Value::Number(_), true) => (
            format!(
                "CASE WHEN {kind} IS NULL THEN {set} \
                 WHEN {kind} IN ('integer', 'real', 'true', 'false') AND json_extract(data, '{p}') > ? THEN {set} \
                 WHEN {kind} IN ('text', 'array', 'object') THEN {set} \
                 ELSE data END"
            ),
            4,
        ),
        (Value::Number(_), false) => (
            format!(
                "CASE WHEN {kind} IS NULL OR {kind} = 'null' THEN {set} \
                 WHEN {kind} IN ('integer', 'real', 'true', 'false') AND json_extract(data, '{p}') < ? THEN {set} \
                 ELSE data END"
            ),
            3,
        ),
        (Value::String(_), true) => (
            format!(
                "CASE WHEN {kind} IS NULL THEN {set} \
                 WHEN {kind} IN ('text', 'array', 'object') AND json_extract(data, '{p}') > ? THEN {set} \
                 ELSE data END"
            ),
            3,
        ),
        (Value::String(_), false) => (
            format!(
                "CASE WHEN {kind} IS NULL THEN {set} \
                 WHEN {kind} IN ('text', 'array', 'object') AND json_extract(data, '{p}') < ? THEN {set} \
                 WHEN {kind} IN ('null', 'integer', 'real', 'true', 'false') THEN {set} \
                 ELSE data END"
            ),
            4,
        ),
        _ => return None,
    };
    Some(SqlFragment {
        sql,
        params: vec![param; count],
    })
}

/// Render a JSON value as a json_set argument expression.
fn value_expr(value: &Value) -> (String, Vec<SqlParam>) {
    match value {
        Value::Null => ("json('null')".to_string(), vec![]),
        Value::Bool(true) => ("json('true')".to_string(), vec![]),
        Value::Bool(false) => ("json('false')".to_string(), vec![]),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                ("?".to_string(), vec![SqlParam::Integer(i)])
            } else {
                ("?".to_string(), vec![SqlParam::Real(n.as_f64().unwrap_or(0.0))])
            }
        }
        Value::String(s) => ("?".to_string(), vec![SqlParam::Text(s.clone())]),
        composite => (
            "json(?)".to_string(),
            vec![SqlParam::Text(
                serde_json::to_string(composite).unwrap_or_default(),
            )],
        ),
    }
}

fn numeric_param(value: &Value) -> SqlParam {
    match value.as_i64() {
        Some(i) => SqlParam::Integer(i),
        None => SqlParam::Real(value.as_f64().unwrap_or(0.0)),
    }
}

/// Apply an update to a document payload in memory. Operators never raise
/// here; type mismatches degrade to no-ops the same way the SQL forms do.
pub fn apply_update(update: &Update, data: &Map<String, Value>) -> Result<Map<String, Value>> {
    let mut out = data.clone();
    for op in &update.ops {
        match op {
            UpdateAction::Set(fields) => {
                for (path, value) in fields {
                    set_path(&mut out, path, value.clone());
                }
            }
            UpdateAction::Unset(paths) => {
                for path in paths {
                    remove_path(&mut out, path);
                }
            }
            UpdateAction::Inc(fields) => {
                for (path, operand) in fields {
                    apply_arith(&mut out, path, operand, |a, b| a + b, |a, b| a + b);
                }
            }
            UpdateAction::Mul(fields) => {
                for (path, operand) in fields {
                    apply_arith(&mut out, path, operand, |a, b| a * b, |a, b| a * b);
                }
            }
            UpdateAction::Min(fields) => {
                for (path, operand) in fields {
                    apply_min_max(&mut out, path, operand, std::cmp::Ordering::Less);
                }
            }
            UpdateAction::Max(fields) => {
                for (path, operand) in fields {
                    apply_min_max(&mut out, path, operand, std::cmp::Ordering::Greater);
                }
            }
            UpdateAction::Push(fields) => {
                for (path, value) in fields {
                    match get_path_mut(&mut out, path) {
                        Some(Value::Array(items)) => items.push(value.clone()),
                        Some(_) => {}
                        None => set_path(&mut out, path, Value::Array(vec![value.clone()])),
                    }
                }
            }
            UpdateAction::Pull(fields) => {
                for (path, value) in fields {
                    if let Some(Value::Array(items)) = get_path_mut(&mut out, path) {
                        items.retain(|item| !values_equal(item, value));
                    }
                }
            }
            UpdateAction::Pop(fields) => {
                for (path, direction) in fields {
                    if let Some(Value::Array(items)) = get_path_mut(&mut out, path) {
                        if items.is_empty() {
                            continue;
                        }
                        if *direction == -1 {
                            items.remove(0);
                        } else {
                            items.pop();
                        }
                    }
                }
            }
            UpdateAction::Rename(fields) => {
                for (path, target) in fields {
                    if let Some(value) = remove_path(&mut out, path) {
                        set_path(&mut out, target, value);
                    }
                }
            }
        }
    }
    Ok(out)
}

fn apply_arith(
    data: &mut Map<String, Value>,
    path: &str,
    operand: &Value,
    int_op: fn(i64, i64) -> i64,
    float_op: fn(f64, f64) -> f64,
) {
    let current = match lookup_path(data, path) {
        Some(Value::Number(n)) => n.clone(),
        Some(_) => return,
        None => serde_json::Number::from(0),
    };
    let result = match (current.as_i64(), operand.as_i64()) {
        (Some(a), Some(b)) => Value::from(int_op(a, b)),
        _ => {
            let a = current.as_f64().unwrap_or(0.0);
            let b = operand.as_f64().unwrap_or(0.0);
            Value::from(float_op(a, b))
        }
    };
    set_path(data, path, result);
}

fn apply_min_max(data: &mut Map<String, Value>, path: &str, operand: &Value, keep: std::cmp::Ordering) {
    match lookup_path(data, path) {
        Some(current) => {
            if order_values(operand, current) == keep {
                set_path(data, path, operand.clone());
            }
        }
        None => set_path(data, path, operand.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn map(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    fn apply(update: Value, document: Value) -> Value {
        let parsed = Update::parse(&update).unwrap();
        Value::Object(apply_update(&parsed, &map(document)).unwrap())
    }

    #[test]
    fn test_set_and_unset() {
        assert_eq!(
            apply(json!({"$set": {"a.b": 2, "c": "x"}}), json!({"a": {"b": 1}})),
            json!({"a": {"b": 2}, "c": "x"})
        );
        assert_eq!(
            apply(json!({"$unset": {"a": 1, "ghost": 1}}), json!({"a": 1, "b": 2})),
            json!({"b": 2})
        );
    }

    #[test]
    fn test_inc_and_mul() {
        assert_eq!(apply(json!({"$inc": {"n": 5}}), json!({"n": 2})), json!({"n": 7}));
        // missing field starts from zero
        assert_eq!(apply(json!({"$inc": {"n": 5}}), json!({})), json!({"n": 5}));
        // non-numeric target is left alone
        assert_eq!(apply(json!({"$inc": {"n": 5}}), json!({"n": "x"})), json!({"n": "x"}));
        assert_eq!(apply(json!({"$mul": {"n": 3}}), json!({"n": 2})), json!({"n": 6}));
        assert_eq!(apply(json!({"$mul": {"n": 1.5}}), json!({"n": 2})), json!({"n": 3.0}));
    }

    #[test]
    fn test_min_max() {
        assert_eq!(apply(json!({"$min": {"n": 1}}), json!({"n": 5})), json!({"n": 1}));
        assert_eq!(apply(json!({"$min": {"n": 9}}), json!({"n": 5})), json!({"n": 5}));
        assert_eq!(apply(json!({"$max": {"n": 9}}), json!({"n": 5})), json!({"n": 9}));
        assert_eq!(apply(json!({"$max": {"n": 9}}), json!({})), json!({"n": 9}));
    }

    #[test]
    fn test_array_mutators() {
        assert_eq!(
            apply(json!({"$push": {"tags": "new"}}), json!({"tags": ["old"]})),
            json!({"tags": ["old", "new"]})
        );
        assert_eq!(apply(json!({"$push": {"tags": 1}}), json!({})), json!({"tags": [1]}));
        assert_eq!(
            apply(json!({"$pull": {"tags": 2}}), json!({"tags": [1, 2, 3, 2]})),
            json!({"tags": [1, 3]})
        );
        assert_eq!(
            apply(json!({"$pop": {"tags": 1}}), json!({"tags": [1, 2, 3]})),
            json!({"tags": [1, 2]})
        );
        assert_eq!(
            apply(json!({"$pop": {"tags": -1}}), json!({"tags": [1, 2, 3]})),
            json!({"tags": [2, 3]})
        );
        assert_eq!(apply(json!({"$pop": {"tags": 1}}), json!({"tags": []})), json!({"tags": []}));
    }

    #[test]
    fn test_rename() {
        assert_eq!(
            apply(json!({"$rename": {"old": "fresh"}}), json!({"old": 1, "x": 2})),
            json!({"x": 2, "fresh": 1})
        );
        assert_eq!(apply(json!({"$rename": {"ghost": "g"}}), json!({"x": 1})), json!({"x": 1}));
    }

    #[test]
    fn test_parse_rejections() {
        assert!(Update::parse(&json!({})).is_err());
        assert!(Update::parse(&json!({"$setx": {"a": 1}})).is_err());
        assert!(Update::parse(&json!({"$set": {"_id": 9}})).is_err());
        assert!(Update::parse(&json!({"$rename": {"a": "_id"}})).is_err());
        assert!(Update::parse(&json!({"$pop": {"a": 2}})).is_err());
        assert!(Update::parse(&json!({"$inc": {"a": "x"}})).is_err());
        assert!(Update::parse(&json!({"$unset": {}})).is_err());
    }

    #[test]
    fn test_compile_set_and_unset() {
        let update = Update::parse(&json!({"$unset": {"old": 1}, "$set": {"a.b": 2}})).unwrap();
        match compile_update(&update) {
            Translation::Native(fragments) => {
                assert_eq!(fragments.len(), 2);
                assert_eq!(fragments[0].sql, "json_remove(data, '$.old')");
                assert_eq!(fragments[1].sql, "json_set(data, '$.a.b', ?)");
                assert_eq!(fragments[1].params, vec![SqlParam::Integer(2)]);
            }
            Translation::Evaluator => panic!("expected native translation"),
        }
    }

    #[test]
    fn test_compile_inc_guards_on_stored_type() {
        let update = Update::parse(&json!({"$inc": {"n": 5}})).unwrap();
        match compile_update(&update) {
            Translation::Native(fragments) => {
                assert_eq!(
                    fragments[0].sql,
                    "CASE WHEN COALESCE(json_type(data, '$.n'), 'integer') IN ('integer', 'real') \
                     THEN json_set(data, '$.n', COALESCE(json_extract(data, '$.n'), 0) + ?) \
                     ELSE data END"
                );
                assert_eq!(fragments[0].params, vec![SqlParam::Integer(5)]);
            }
            Translation::Evaluator => panic!("expected native translation"),
        }
    }

    #[test]
    fn test_compile_min_max_preserve_payload_outside_set_branches() {
        // every branch either writes the operand or returns `data` whole, so
        // booleans and composites are never re-encoded through json_extract
        for (update, set_branches) in [
            (json!({"$min": {"n": 2}}), 3),
            (json!({"$max": {"n": 2}}), 2),
            (json!({"$min": {"n": "m"}}), 2),
            (json!({"$max": {"n": "m"}}), 3),
        ] {
            let parsed = Update::parse(&update).unwrap();
            match compile_update(&parsed) {
                Translation::Native(fragments) => {
                    let sql = &fragments[0].sql;
                    assert!(sql.ends_with("ELSE data END"), "no passthrough in {sql}");
                    assert_eq!(
                        sql.matches("json_set(data, '$.n', ?)").count(),
                        set_branches,
                        "unexpected shape: {sql}"
                    );
                }
                Translation::Evaluator => panic!("expected native translation"),
            }
        }
    }

    #[test]
    fn test_compile_emits_fragments_in_operator_order() {
        // $inc reads the value the preceding $set wrote, as the executor does
        let update = Update::parse(&json!({"$set": {"n": 5}, "$inc": {"n": 1}})).unwrap();
        match compile_update(&update) {
            Translation::Native(fragments) => {
                assert_eq!(fragments.len(), 2);
                assert!(fragments[0].sql.starts_with("json_set"));
                assert!(fragments[1].sql.starts_with("CASE WHEN"));
            }
            Translation::Evaluator => panic!("expected native translation"),
        }
    }

    #[test]
    fn test_compile_fallbacks() {
        for update in [
            json!({"$push": {"tags": 1}}),
            json!({"$pull": {"tags": 1}}),
            json!({"$pop": {"tags": 1}}),
            json!({"$rename": {"a": "b"}}),
            json!({"$set": {"blob": crate::bytes::encode(b"x")}}),
        ] {
            let parsed = Update::parse(&update).unwrap();
            assert!(matches!(compile_update(&parsed), Translation::Evaluator));
        }
    }

    #[test]
    fn test_compile_composite_set_uses_json() {
        let update = Update::parse(&json!({"$set": {"a": {"k": [1, 2]}}})).unwrap();
        match compile_update(&update) {
            Translation::Native(fragments) => {
                assert_eq!(fragments[0].sql, "json_set(data, '$.a', json(?))");
                assert_eq!(
                    fragments[0].params,
                    vec![SqlParam::Text("{\"k\":[1,2]}".to_string())]
                );
            }
            Translation::Evaluator => panic!("expected native translation"),
        }
    }
}
