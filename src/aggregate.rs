//! Aggregation pipelines: stage parsing, native prefix compilation, and the
//! in-process pipeline interpreter.
//!
//! A pipeline runs in two halves. A greedy prefix of `$match`/`$sort`/
//! `$skip`/`$limit` stages folds into one SELECT; everything from the first
//! unfoldable stage onward runs through `interpret` over the documents the
//! prefix produced.

use std::collections::HashMap;

use serde_json::{Map, Value};

use crate::compile::{compile_filter, CompileContext, SqlFragment, Translation};
use crate::document::{extract_expr, lookup_path, set_path, ID_FIELD};
use crate::error::{Error, Result};
use crate::filter::{order_values, EvalContext, Filter};

/// One parsed pipeline stage.
#[derive(Debug, Clone)]
pub enum Stage {
    Match(Filter),
    Sort(Vec<(String, SortOrder)>),
    Skip(u64),
    Limit(u64),
    Project(Projection),
    Group(GroupSpec),
    Unwind(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    Ascending,
    Descending,
}

/// A `$project` specification. Inclusion and exclusion are mutually
/// exclusive; `_id` is the only field allowed to cross modes.
#[derive(Debug, Clone)]
pub struct Projection {
    pub mode: ProjectionMode,
    pub fields: Vec<String>,
    pub include_id: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProjectionMode {
    Include,
    Exclude,
}

/// A `$group` specification: the bucket key and named accumulators.
#[derive(Debug, Clone)]
pub struct GroupSpec {
    pub key: Operand,
    pub accumulators: Vec<(String, Accumulator)>,
}

#[derive(Debug, Clone)]
pub enum Accumulator {
    Sum(Operand),
    Avg(Operand),
    Min(Operand),
    Max(Operand),
    Push(Operand),
}

/// An accumulator or group-key operand: a `"$field"` path reference or a
/// literal value.
#[derive(Debug, Clone)]
pub enum Operand {
    Path(String),
    Literal(Value),
}

impl Operand {
    fn parse(value: &Value) -> Operand {
        match value.as_str() {
            Some(s) if s.starts_with('$') => Operand::Path(s[1..].to_string()),
            _ => Operand::Literal(value.clone()),
        }
    }

    fn resolve<'a>(&'a self, doc: &'a Map<String, Value>) -> Option<&'a Value> {
        match self {
            Operand::Path(path) => lookup_path(doc, path),
            Operand::Literal(value) => Some(value),
        }
    }
}

/// Parse a pipeline: an array of single-key stage documents.
pub fn parse_pipeline(pipeline: &Value) -> Result<Vec<Stage>> {
    let stages = pipeline
        .as_array()
        .ok_or_else(|| Error::MalformedQuery("pipeline must be an array".to_string()))?;

    let mut out = Vec::with_capacity(stages.len());
    for stage in stages {
        let map = stage.as_object().filter(|m| m.len() == 1).ok_or_else(|| {
            Error::MalformedQuery("each stage must be a single-key object".to_string())
        })?;
        let (name, body) = map.iter().next().expect("len checked above");

        let stage = match name.as_str() {
            "$match" => Stage::Match(Filter::parse(body)?),
            "$sort" => Stage::Sort(parse_sort(body)?),
            "$skip" => Stage::Skip(parse_count(body, "$skip")?),
            "$limit" => Stage::Limit(parse_count(body, "$limit")?),
            "$project" => Stage::Project(Projection::parse(body)?),
            "$group" => Stage::Group(parse_group(body)?),
            "$unwind" => {
                let path = body.as_str().filter(|s| s.starts_with('$')).ok_or_else(|| {
                    Error::MalformedQuery("$unwind expects a \"$field\" path".to_string())
                })?;
                Stage::Unwind(path[1..].to_string())
            }
            other => {
                return Err(Error::MalformedQuery(format!("unknown stage: {other}")))
            }
        };
        out.push(stage);
    }
    Ok(out)
}

fn parse_sort(body: &Value) -> Result<Vec<(String, SortOrder)>> {
    let map = body
        .as_object()
        .filter(|m| !m.is_empty())
        .ok_or_else(|| Error::MalformedQuery("$sort expects a non-empty object".to_string()))?;
    let mut keys = Vec::with_capacity(map.len());
    for (path, direction) in map {
        let order = match direction.as_i64() {
            Some(1) => SortOrder::Ascending,
            Some(-1) => SortOrder::Descending,
            _ => {
                return Err(Error::MalformedQuery(format!(
                    "$sort direction for {path:?} must be 1 or -1"
                )))
            }
        };
        keys.push((path.clone(), order));
    }
    Ok(keys)
}

fn parse_count(body: &Value, stage: &str) -> Result<u64> {
    body.as_u64()
        .ok_or_else(|| Error::MalformedQuery(format!("{stage} expects a non-negative integer")))
}

impl Projection {
    pub fn parse(body: &Value) -> Result<Projection> {
        let map = body
            .as_object()
            .ok_or_else(|| Error::MalformedQuery("projection must be an object".to_string()))?;

        let mut include_id = true;
        let mut id_listed = false;
        let mut mode = None;
        let mut fields = Vec::new();
        for (path, flag) in map {
            let included = match flag.as_i64() {
                Some(0) => false,
                Some(1) => true,
                _ => flag.as_bool().ok_or_else(|| {
                    Error::MalformedQuery(format!("projection value for {path:?} must be 0 or 1"))
                })?,
            };
            if path == ID_FIELD {
                include_id = included;
                id_listed = true;
                continue;
            }
            let field_mode = if included {
                ProjectionMode::Include
            } else {
                ProjectionMode::Exclude
            };
            match mode {
                None => mode = Some(field_mode),
                Some(existing) if existing != field_mode => {
                    return Err(Error::MalformedQuery(
                        "projection cannot mix inclusion and exclusion".to_string(),
                    ))
                }
                Some(_) => {}
            }
            fields.push(path.clone());
        }

        // With no non-`_id` fields: `{"_id": 1}` keeps only `_id`,
        // `{"_id": 0}` drops only `_id`, `{}` is the identity.
        let mode = mode.unwrap_or(if id_listed && include_id {
            ProjectionMode::Include
        } else {
            ProjectionMode::Exclude
        });
        Ok(Projection {
            mode,
            fields,
            include_id,
        })
    }

    pub fn apply(&self, doc: &Map<String, Value>) -> Map<String, Value> {
        match self.mode {
            ProjectionMode::Include => {
                let mut out = Map::new();
                if self.include_id {
                    if let Some(id) = doc.get(ID_FIELD) {
                        out.insert(ID_FIELD.to_string(), id.clone());
                    }
                }
                for path in &self.fields {
                    if let Some(value) = lookup_path(doc, path) {
                        set_path(&mut out, path, value.clone());
                    }
                }
                out
            }
            ProjectionMode::Exclude => {
                let mut out = doc.clone();
                for path in &self.fields {
                    crate::document::remove_path(&mut out, path);
                }
                if !self.include_id {
                    out.shift_remove(ID_FIELD);
                }
                out
            }
        }
    }
}

fn parse_group(body: &Value) -> Result<GroupSpec> {
    let map = body
        .as_object()
        .ok_or_else(|| Error::MalformedQuery("$group expects an object".to_string()))?;
    let key = map
        .get(ID_FIELD)
        .map(Operand::parse)
        .ok_or_else(|| Error::MalformedQuery("$group requires an _id key".to_string()))?;

    let mut accumulators = Vec::new();
    for (name, spec) in map {
        if name == ID_FIELD {
            continue;
        }
        let inner = spec.as_object().filter(|m| m.len() == 1).ok_or_else(|| {
            Error::MalformedQuery(format!("accumulator {name:?} must be a single-key object"))
        })?;
        let (op, operand) = inner.iter().next().expect("len checked above");
        let operand = Operand::parse(operand);
        let accumulator = match op.as_str() {
            "$sum" => Accumulator::Sum(operand),
            "$avg" => Accumulator::Avg(operand),
            "$min" => Accumulator::Min(operand),
            "$max" => Accumulator::Max(operand),
            "$push" => Accumulator::Push(operand),
            other => {
                return Err(Error::MalformedQuery(format!("unknown accumulator: {other}")))
            }
        };
        accumulators.push((name.clone(), accumulator));
    }
    Ok(GroupSpec { key, accumulators })
}

/// The native half of a compiled pipeline: an optional SELECT covering the
/// first `consumed` stages.
#[derive(Debug)]
pub struct CompiledPrefix {
    pub select: Option<SqlFragment>,
    pub consumed: usize,
}

/// Greedily fold a pipeline prefix into one SELECT.
///
/// Folding is phase-ordered (WHERE, then ORDER BY, then OFFSET, then LIMIT):
/// a stage that would have to precede an already-folded phase stops the fold,
/// since SQL applies the clauses in fixed order regardless of stage order.
pub fn compile_pipeline(stages: &[Stage], table: &str, ctx: &CompileContext) -> CompiledPrefix {
    let mut where_clause: Option<SqlFragment> = None;
    let mut order_by: Vec<String> = Vec::new();
    let mut offset: Option<u64> = None;
    let mut limit: Option<u64> = None;
    // phases: 0 = match, 1 = sort, 2 = skip, 3 = limit
    let mut phase = 0;
    let mut consumed = 0;

    for stage in stages {
        match stage {
            Stage::Match(filter) if phase == 0 => {
                match compile_filter(filter, ctx) {
                    Translation::Native(fragment) => {
                        where_clause = Some(fragment);
                        phase = 1;
                    }
                    Translation::Evaluator => break,
                }
            }
            Stage::Sort(keys) if phase <= 1 => {
                order_by = keys
                    .iter()
                    .map(|(path, order)| {
                        let expr = if path == ID_FIELD {
                            "id".to_string()
                        } else {
                            extract_expr(path)
                        };
                        let direction = match order {
                            SortOrder::Ascending => "ASC",
                            SortOrder::Descending => "DESC",
                        };
                        format!("{expr} {direction}")
                    })
                    .collect();
                phase = 2;
            }
            Stage::Skip(n) if phase <= 2 => {
                offset = Some(*n);
                phase = 3;
            }
            Stage::Limit(n) if phase <= 3 => {
                limit = Some(*n);
                phase = 4;
            }
            _ => break,
        }
        consumed += 1;
    }

    if consumed == 0 {
        return CompiledPrefix {
            select: None,
            consumed: 0,
        };
    }

    let mut sql = format!("SELECT id, data FROM \"{table}\"");
    let mut params = Vec::new();
    if let Some(fragment) = where_clause {
        if !fragment.sql.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&fragment.sql);
        }
        params.extend(fragment.params);
    }
    if !order_by.is_empty() {
        sql.push_str(" ORDER BY ");
        sql.push_str(&order_by.join(", "));
    }
    match (limit, offset) {
        (Some(l), Some(o)) => sql.push_str(&format!(" LIMIT {l} OFFSET {o}")),
        (Some(l), None) => sql.push_str(&format!(" LIMIT {l}")),
        // OFFSET needs a LIMIT clause; -1 means unbounded
        (None, Some(o)) => sql.push_str(&format!(" LIMIT -1 OFFSET {o}")),
        (None, None) => {}
    }

    CompiledPrefix {
        select: Some(SqlFragment { sql, params }),
        consumed,
    }
}

/// Run pipeline stages over in-memory documents.
pub fn interpret(
    stages: &[Stage],
    docs: Vec<Map<String, Value>>,
    ctx: &EvalContext,
) -> Result<Vec<Map<String, Value>>> {
    let mut docs = docs;
    for stage in stages {
        docs = match stage {
            Stage::Match(filter) => docs
                .into_iter()
                .filter(|doc| filter.matches(doc, ctx))
                .collect(),
            Stage::Sort(keys) => {
                let mut docs = docs;
                docs.sort_by(|a, b| {
                    for (path, order) in keys {
                        // missing sorts first ascending, as SQL NULLs do
                        let null = Value::Null;
                        let left = lookup_path(a, path).unwrap_or(&null);
                        let right = lookup_path(b, path).unwrap_or(&null);
                        let cmp = match order {
                            SortOrder::Ascending => order_values(left, right),
                            SortOrder::Descending => order_values(right, left),
                        };
                        if cmp != std::cmp::Ordering::Equal {
                            return cmp;
                        }
                    }
                    std::cmp::Ordering::Equal
                });
                docs
            }
            Stage::Skip(n) => docs.into_iter().skip(*n as usize).collect(),
            Stage::Limit(n) => docs.into_iter().take(*n as usize).collect(),
            Stage::Project(projection) => {
                docs.iter().map(|doc| projection.apply(doc)).collect()
            }
            Stage::Group(spec) => group(spec, &docs)?,
            Stage::Unwind(path) => {
                let mut out = Vec::with_capacity(docs.len());
                for doc in docs {
                    match lookup_path(&doc, path).cloned() {
                        Some(Value::Array(items)) => {
                            for item in items {
                                let mut clone = doc.clone();
                                set_path(&mut clone, path, item);
                                out.push(clone);
                            }
                        }
                        _ => out.push(doc),
                    }
                }
                out
            }
        };
    }
    Ok(docs)
}

struct Bucket {
    key: Value,
    sums: Vec<f64>,
    counts: Vec<u64>,
    values: Vec<Option<Value>>,
    arrays: Vec<Vec<Value>>,
}

fn group(spec: &GroupSpec, docs: &[Map<String, Value>]) -> Result<Vec<Map<String, Value>>> {
    let n = spec.accumulators.len();
    let mut order: Vec<String> = Vec::new();
    let mut buckets: HashMap<String, Bucket> = HashMap::new();

    for doc in docs {
        let key = spec.key.resolve(doc).cloned().unwrap_or(Value::Null);
        let tag = serde_json::to_string(&key)?;
        let bucket = buckets.entry(tag.clone()).or_insert_with(|| {
            order.push(tag);
            Bucket {
                key,
                sums: vec![0.0; n],
                counts: vec![0; n],
                values: vec![None; n],
                arrays: vec![Vec::new(); n],
            }
        });

        for (i, (_, accumulator)) in spec.accumulators.iter().enumerate() {
            match accumulator {
                Accumulator::Sum(operand) | Accumulator::Avg(operand) => {
                    if let Some(value) = operand.resolve(doc) {
                        if let Some(x) = value.as_f64() {
                            bucket.sums[i] += x;
                            bucket.counts[i] += 1;
                        }
                    }
                }
                Accumulator::Min(operand) => {
                    if let Some(value) = operand.resolve(doc) {
                        let replace = match &bucket.values[i] {
                            Some(current) => {
                                order_values(value, current) == std::cmp::Ordering::Less
                            }
                            None => true,
                        };
                        if replace {
                            bucket.values[i] = Some(value.clone());
                        }
                    }
                }
                Accumulator::Max(operand) => {
                    if let Some(value) = operand.resolve(doc) {
                        let replace = match &bucket.values[i] {
                            Some(current) => {
                                order_values(value, current) == std::cmp::Ordering::Greater
                            }
                            None => true,
                        };
                        if replace {
                            bucket.values[i] = Some(value.clone());
                        }
                    }
                }
                Accumulator::Push(operand) => {
                    if let Some(value) = operand.resolve(doc) {
                        bucket.arrays[i].push(value.clone());
                    }
                }
            }
        }
    }

    let mut out = Vec::with_capacity(order.len());
    for tag in order {
        let bucket = buckets.remove(&tag).expect("bucket recorded in order");
        let mut doc = Map::new();
        doc.insert(ID_FIELD.to_string(), bucket.key);
        for (i, (name, accumulator)) in spec.accumulators.iter().enumerate() {
            let value = match accumulator {
                Accumulator::Sum(_) => number(bucket.sums[i]),
                Accumulator::Avg(_) => {
                    if bucket.counts[i] == 0 {
                        Value::Null
                    } else {
                        number(bucket.sums[i] / bucket.counts[i] as f64)
                    }
                }
                Accumulator::Min(_) | Accumulator::Max(_) => {
                    bucket.values[i].clone().unwrap_or(Value::Null)
                }
                Accumulator::Push(_) => Value::Array(bucket.arrays[i].clone()),
            };
            doc.insert(name.clone(), value);
        }
        out.push(doc);
    }
    Ok(out)
}

/// Collapse whole floats back to integers so `$sum` over integers stays
/// integral.
fn number(x: f64) -> Value {
    if x.fract() == 0.0 && x.abs() < (i64::MAX as f64) {
        Value::from(x as i64)
    } else {
        Value::from(x)
    }
}
