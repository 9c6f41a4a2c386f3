//! Filter-to-SQL compilation.
//!
//! The compiler turns a parsed filter into a WHERE fragment over the JSON1
//! functions whenever it can prove the fragment selects exactly the rows the
//! evaluator would. Anything it cannot prove falls back wholesale: a filter
//! compiles entirely to SQL or not at all, never piecewise.

use serde_json::Value;

use crate::bytes;
use crate::document::{extract_expr, path_literal, ID_FIELD};
use crate::filter::{Clause, FieldCond, Filter};

/// Outcome of compiling a query construct: either native SQL, or a directive
/// to run the in-process evaluator instead.
#[derive(Debug, Clone, PartialEq)]
pub enum Translation<T> {
    Native(T),
    Evaluator,
}

/// A SQL snippet plus its positional parameters.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SqlFragment {
    pub sql: String,
    pub params: Vec<SqlParam>,
}

/// Owned parameter values bound into compiled statements.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlParam {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
}

impl rusqlite::ToSql for SqlParam {
    fn to_sql(&self) -> rusqlite::Result<rusqlite::types::ToSqlOutput<'_>> {
        use rusqlite::types::{ToSqlOutput, Value as SqliteValue};
        Ok(match self {
            SqlParam::Null => ToSqlOutput::Owned(SqliteValue::Null),
            SqlParam::Integer(i) => ToSqlOutput::Owned(SqliteValue::Integer(*i)),
            SqlParam::Real(f) => ToSqlOutput::Owned(SqliteValue::Real(*f)),
            SqlParam::Text(s) => ToSqlOutput::Owned(SqliteValue::Text(s.clone())),
        })
    }
}

/// What the compiler needs to know about the collection: the full-text
/// virtual tables available to `$text`.
#[derive(Debug, Clone, Default)]
pub struct CompileContext {
    pub fts_tables: Vec<String>,
}

/// Compile a filter into a WHERE fragment, or decide to fall back.
///
/// Logical operators always fall back: their SQL renditions of missing-field
/// and NULL semantics are not worth proving equivalent clause by clause.
pub fn compile_filter(filter: &Filter, ctx: &CompileContext) -> Translation<SqlFragment> {
    if filter.clauses.is_empty() {
        return Translation::Native(SqlFragment::default());
    }

    let mut parts = Vec::with_capacity(filter.clauses.len());
    let mut params = Vec::new();
    for clause in &filter.clauses {
        match clause {
            Clause::And(_) | Clause::Or(_) | Clause::Nor(_) | Clause::Not(_) => {
                return Translation::Evaluator
            }
            Clause::Text(search) => match compile_text(search, ctx) {
                Translation::Native(fragment) => {
                    parts.push(fragment.sql);
                    params.extend(fragment.params);
                }
                Translation::Evaluator => return Translation::Evaluator,
            },
            Clause::Field { path, conds } => {
                for cond in conds {
                    match compile_cond(path, cond) {
                        Translation::Native(fragment) => {
                            parts.push(fragment.sql);
                            params.extend(fragment.params);
                        }
                        Translation::Evaluator => return Translation::Evaluator,
                    }
                }
            }
        }
    }

    Translation::Native(SqlFragment {
        sql: parts.join(" AND "),
        params,
    })
}

fn compile_cond(path: &str, cond: &FieldCond) -> Translation<SqlFragment> {
    if path == ID_FIELD {
        return compile_id_cond(cond);
    }
    let col = extract_expr(path);
    let p = path_literal(path);

    let fragment = match cond {
        FieldCond::Eq(operand) => match scalar_param(operand) {
            Some(param) => SqlFragment {
                sql: format!("{col} = ?"),
                params: vec![param],
            },
            None if operand.is_null() => SqlFragment {
                sql: format!("{col} IS NULL"),
                params: vec![],
            },
            None => return Translation::Evaluator,
        },
        FieldCond::Ne(operand) => match scalar_param(operand) {
            // a missing field satisfies $ne, so NULL rows must pass
            Some(param) => SqlFragment {
                sql: format!("({col} IS NULL OR {col} != ?)"),
                params: vec![param],
            },
            None if operand.is_null() => SqlFragment {
                sql: format!("{col} IS NOT NULL"),
                params: vec![],
            },
            None => return Translation::Evaluator,
        },
        FieldCond::Gt(operand) => return compile_ordering(&col, &p, ">", operand),
        FieldCond::Gte(operand) => return compile_ordering(&col, &p, ">=", operand),
        FieldCond::Lt(operand) => return compile_ordering(&col, &p, "<", operand),
        FieldCond::Lte(operand) => return compile_ordering(&col, &p, "<=", operand),
        FieldCond::In(candidates) => match compile_in(&col, candidates) {
            Translation::Native(fragment) => fragment,
            Translation::Evaluator => return Translation::Evaluator,
        },
        FieldCond::Nin(candidates) => match compile_in(&col, candidates) {
            Translation::Native(inner) => SqlFragment {
                sql: format!("({col} IS NULL OR NOT {})", inner.sql),
                params: inner.params,
            },
            Translation::Evaluator => return Translation::Evaluator,
        },
        FieldCond::Exists(true) => SqlFragment {
            sql: format!("{col} IS NOT NULL"),
            params: vec![],
        },
        FieldCond::Exists(false) => SqlFragment {
            sql: format!("{col} IS NULL"),
            params: vec![],
        },
        FieldCond::Mod { divisor, remainder } => {
            if *divisor == 0 {
                SqlFragment {
                    sql: "0 = 1".to_string(),
                    params: vec![],
                }
            } else {
                SqlFragment {
                    sql: format!(
                        "(json_type(data, '{p}') IN ('integer', 'real') AND {col} % ? = ?)"
                    ),
                    params: vec![SqlParam::Integer(*divisor), SqlParam::Integer(*remainder)],
                }
            }
        }
        FieldCond::Size(expected) => SqlFragment {
            sql: format!(
                "(json_type(data, '{p}') = 'array' AND json_array_length(data, '{p}') = ?)"
            ),
            params: vec![SqlParam::Integer(*expected as i64)],
        },
        FieldCond::Contains(needle) => SqlFragment {
            sql: format!("(json_type(data, '{p}') = 'text' AND instr({col}, ?) > 0)"),
            params: vec![SqlParam::Text(needle.clone())],
        },
    };
    Translation::Native(fragment)
}

/// Range operators need a type guard: SQLite orders TEXT above all numbers,
/// while the evaluator only compares like with like.
fn compile_ordering(col: &str, p: &str, op: &str, operand: &Value) -> Translation<SqlFragment> {
    match operand {
        Value::Number(n) => {
            let param = if let Some(i) = n.as_i64() {
                SqlParam::Integer(i)
            } else if let Some(f) = n.as_f64() {
                SqlParam::Real(f)
            } else {
                return Translation::Evaluator;
            };
            Translation::Native(SqlFragment {
                sql: format!(
                    "(json_type(data, '{p}') IN ('integer', 'real') AND {col} {op} ?)"
                ),
                params: vec![param],
            })
        }
        Value::String(s) => Translation::Native(SqlFragment {
            sql: format!("(json_type(data, '{p}') = 'text' AND {col} {op} ?)"),
            params: vec![SqlParam::Text(s.clone())],
        }),
        _ => Translation::Evaluator,
    }
}

fn compile_in(col: &str, candidates: &[Value]) -> Translation<SqlFragment> {
    if candidates.is_empty() {
        return Translation::Native(SqlFragment {
            sql: "0 = 1".to_string(),
            params: vec![],
        });
    }
    let mut params = Vec::with_capacity(candidates.len());
    for candidate in candidates {
        match scalar_param(candidate) {
            Some(param) => params.push(param),
            // null candidates match missing fields; composites need
            // structural equality
            None => return Translation::Evaluator,
        }
    }
    let placeholders = vec!["?"; params.len()].join(", ");
    Translation::Native(SqlFragment {
        sql: format!("{col} IN ({placeholders})"),
        params,
    })
}

/// `_id` conditions run against the integer primary key directly.
fn compile_id_cond(cond: &FieldCond) -> Translation<SqlFragment> {
    let int = |operand: &Value| operand.as_i64().map(SqlParam::Integer);
    let fragment = match cond {
        FieldCond::Eq(operand) => match int(operand) {
            Some(param) => SqlFragment {
                sql: "id = ?".to_string(),
                params: vec![param],
            },
            None => return Translation::Evaluator,
        },
        FieldCond::Ne(operand) => match int(operand) {
            Some(param) => SqlFragment {
                sql: "id != ?".to_string(),
                params: vec![param],
            },
            None => return Translation::Evaluator,
        },
        FieldCond::Gt(operand) | FieldCond::Gte(operand) | FieldCond::Lt(operand)
        | FieldCond::Lte(operand) => {
            let op = match cond {
                FieldCond::Gt(_) => ">",
                FieldCond::Gte(_) => ">=",
                FieldCond::Lt(_) => "<",
                _ => "<=",
            };
            match int(operand) {
                Some(param) => SqlFragment {
                    sql: format!("id {op} ?"),
                    params: vec![param],
                },
                None => return Translation::Evaluator,
            }
        }
        FieldCond::In(candidates) => {
            let params: Option<Vec<SqlParam>> = candidates.iter().map(int).collect();
            match params {
                Some(params) if params.is_empty() => SqlFragment {
                    sql: "0 = 1".to_string(),
                    params: vec![],
                },
                Some(params) => {
                    let placeholders = vec!["?"; params.len()].join(", ");
                    SqlFragment {
                        sql: format!("id IN ({placeholders})"),
                        params,
                    }
                }
                None => return Translation::Evaluator,
            }
        }
        FieldCond::Nin(candidates) => {
            let params: Option<Vec<SqlParam>> = candidates.iter().map(int).collect();
            match params {
                Some(params) if params.is_empty() => SqlFragment {
                    sql: "1 = 1".to_string(),
                    params: vec![],
                },
                Some(params) => {
                    let placeholders = vec!["?"; params.len()].join(", ");
                    SqlFragment {
                        sql: format!("id NOT IN ({placeholders})"),
                        params,
                    }
                }
                None => return Translation::Evaluator,
            }
        }
        // a stored row always has an id
        FieldCond::Exists(true) => SqlFragment {
            sql: "1 = 1".to_string(),
            params: vec![],
        },
        FieldCond::Exists(false) => SqlFragment {
            sql: "0 = 1".to_string(),
            params: vec![],
        },
        _ => return Translation::Evaluator,
    };
    Translation::Native(fragment)
}

/// Bind a filter operand as a SQL parameter. `None` means the operand has no
/// faithful scalar binding and the whole filter must fall back.
fn scalar_param(operand: &Value) -> Option<SqlParam> {
    match operand {
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Some(SqlParam::Integer(i))
            } else {
                n.as_f64().map(SqlParam::Real)
            }
        }
        Value::String(s) => Some(SqlParam::Text(s.clone())),
        // json_extract of a sub-object yields its compact serialization, so a
        // binary wrapper compares as text
        Value::Object(_) if bytes::is_binary(operand) => {
            serde_json::to_string(operand).ok().map(SqlParam::Text)
        }
        // stored true/false extract as 1/0, which would also equal integer
        // 1/0; the evaluator keeps booleans distinct, so bail
        _ => None,
    }
}

/// `$text` over the collection's FTS5 tables: one MATCH subquery per table,
/// unioned. The search string is bound as a quoted phrase so user input
/// cannot inject MATCH syntax.
fn compile_text(search: &str, ctx: &CompileContext) -> Translation<SqlFragment> {
    if ctx.fts_tables.is_empty() {
        return Translation::Evaluator;
    }
    let phrase = format!("\"{}\"", search.to_lowercase().replace('"', "\"\""));
    let subqueries: Vec<String> = ctx
        .fts_tables
        .iter()
        .map(|table| format!("SELECT rowid FROM \"{table}\" WHERE \"{table}\" MATCH ?"))
        .collect();
    Translation::Native(SqlFragment {
        sql: format!("id IN ({})", subqueries.join(" UNION ")),
        params: vec![SqlParam::Text(phrase); ctx.fts_tables.len()],
    })
}
