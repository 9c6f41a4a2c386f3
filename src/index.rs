//! Index management: functional indexes over JSON paths, FTS5 companion
//! tables, and the registry that records both.
//!
//! Every index is written to the `_doclite_indexes` registry table when it is
//! created. Lookups (which FTS tables serve `$text`, what `drop_index`
//! should reverse) read the registry rather than pattern-matching the
//! engine's catalog.

use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::document::{extract_expr, path_literal, validate_field_path};
use crate::error::{Error, Result};

/// The index registry table.
pub const REGISTRY_TABLE: &str = "_doclite_indexes";

const DEFAULT_TOKENIZER: &str = "unicode61";
const TOKENIZERS: &[&str] = &["unicode61", "ascii", "porter", "trigram"];

/// A stored index definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexDescriptor {
    pub name: String,
    pub fields: Vec<String>,
    pub unique: bool,
    pub fts: bool,
    pub tokenizer: Option<String>,
}

/// Options accepted by `create_index`.
#[derive(Debug, Clone, Default)]
pub struct IndexOptions {
    pub unique: bool,
    pub fts: bool,
    pub tokenizer: Option<String>,
}

/// Deterministic name for a functional index.
pub fn functional_index_name(collection: &str, fields: &[String]) -> String {
    let joined: Vec<String> = fields.iter().map(|f| f.replace('.', "_")).collect();
    format!("idx_{collection}_{}", joined.join("_"))
}

/// Deterministic name for an FTS companion table.
pub fn fts_table_name(collection: &str, field: &str) -> String {
    format!("{collection}_{}_fts", field.replace('.', "_"))
}

/// Create an index on a collection. Re-creating an index with the same
/// derived name returns the stored descriptor instead of erroring.
pub fn create_index(
    conn: &Connection,
    collection: &str,
    fields: &[String],
    options: &IndexOptions,
) -> Result<IndexDescriptor> {
    if fields.is_empty() {
        return Err(Error::MalformedQuery("index needs at least one field".to_string()));
    }
    for field in fields {
        validate_field_path(field)?;
    }

    let descriptor = if options.fts {
        if fields.len() != 1 {
            return Err(Error::MalformedQuery(
                "full-text indexes cover exactly one field".to_string(),
            ));
        }
        if options.unique {
            return Err(Error::MalformedQuery(
                "full-text indexes cannot be unique".to_string(),
            ));
        }
        let tokenizer = options
            .tokenizer
            .clone()
            .unwrap_or_else(|| DEFAULT_TOKENIZER.to_string());
        if !TOKENIZERS.contains(&tokenizer.as_str()) {
            return Err(Error::MalformedQuery(format!("unknown tokenizer: {tokenizer}")));
        }
        IndexDescriptor {
            name: fts_table_name(collection, &fields[0]),
            fields: fields.to_vec(),
            unique: false,
            fts: true,
            tokenizer: Some(tokenizer),
        }
    } else {
        IndexDescriptor {
            name: functional_index_name(collection, fields),
            fields: fields.to_vec(),
            unique: options.unique,
            fts: false,
            tokenizer: None,
        }
    };

    if let Some(existing) = find_index(conn, collection, &descriptor.name)? {
        debug!(collection, index = %descriptor.name, "index already exists");
        return Ok(existing);
    }

    if descriptor.fts {
        create_fts(conn, collection, &descriptor)?;
    } else {
        create_functional(conn, collection, &descriptor)?;
    }
    register(conn, collection, &descriptor)?;
    debug!(collection, index = %descriptor.name, fts = descriptor.fts, "created index");
    Ok(descriptor)
}

fn create_functional(
    conn: &Connection,
    collection: &str,
    descriptor: &IndexDescriptor,
) -> Result<()> {
    let exprs: Vec<String> = descriptor.fields.iter().map(|f| extract_expr(f)).collect();
    let unique = if descriptor.unique { "UNIQUE " } else { "" };
    conn.execute(
        &format!(
            "CREATE {unique}INDEX IF NOT EXISTS \"{}\" ON \"{collection}\" ({})",
            descriptor.name,
            exprs.join(", ")
        ),
        [],
    )?;
    Ok(())
}

/// The virtual table, its three sync triggers, and the backfill run as one
/// batch. Indexed text is lower-cased on the way in; `$text` lower-cases the
/// query side to match.
fn create_fts(conn: &Connection, collection: &str, descriptor: &IndexDescriptor) -> Result<()> {
    let table = &descriptor.name;
    let field = &descriptor.fields[0];
    let path = path_literal(field);
    let column = field.replace('.', "_");
    let tokenizer = descriptor.tokenizer.as_deref().unwrap_or(DEFAULT_TOKENIZER);

    conn.execute_batch(&format!(
        "CREATE VIRTUAL TABLE IF NOT EXISTS \"{table}\" USING fts5(\"{column}\", tokenize = '{tokenizer}');
         CREATE TRIGGER IF NOT EXISTS \"{table}_ai\" AFTER INSERT ON \"{collection}\" BEGIN
           INSERT INTO \"{table}\" (rowid, \"{column}\")
             VALUES (new.id, lower(json_extract(new.data, '{path}')));
         END;
         CREATE TRIGGER IF NOT EXISTS \"{table}_ad\" AFTER DELETE ON \"{collection}\" BEGIN
           DELETE FROM \"{table}\" WHERE rowid = old.id;
         END;
         CREATE TRIGGER IF NOT EXISTS \"{table}_au\" AFTER UPDATE ON \"{collection}\" BEGIN
           DELETE FROM \"{table}\" WHERE rowid = old.id;
           INSERT INTO \"{table}\" (rowid, \"{column}\")
             VALUES (new.id, lower(json_extract(new.data, '{path}')));
         END;
         INSERT INTO \"{table}\" (rowid, \"{column}\")
           SELECT id, lower(json_extract(data, '{path}')) FROM \"{collection}\";"
    ))?;
    Ok(())
}

fn register(conn: &Connection, collection: &str, descriptor: &IndexDescriptor) -> Result<()> {
    conn.execute(
        &format!(
            "INSERT INTO {REGISTRY_TABLE} (collection, name, fields, uniq, fts, tokenizer)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)"
        ),
        params![
            collection,
            descriptor.name,
            serde_json::to_string(&descriptor.fields)?,
            descriptor.unique,
            descriptor.fts,
            descriptor.tokenizer,
        ],
    )?;
    Ok(())
}

fn row_to_descriptor(row: &rusqlite::Row<'_>) -> rusqlite::Result<IndexDescriptor> {
    let fields_json: String = row.get(1)?;
    Ok(IndexDescriptor {
        name: row.get(0)?,
        fields: serde_json::from_str(&fields_json).unwrap_or_default(),
        unique: row.get(2)?,
        fts: row.get(3)?,
        tokenizer: row.get(4)?,
    })
}

fn find_index(
    conn: &Connection,
    collection: &str,
    name: &str,
) -> Result<Option<IndexDescriptor>> {
    let descriptor = conn
        .query_row(
            &format!(
                "SELECT name, fields, uniq, fts, tokenizer
                 FROM {REGISTRY_TABLE} WHERE collection = ?1 AND name = ?2"
            ),
            params![collection, name],
            row_to_descriptor,
        )
        .optional()?;
    Ok(descriptor)
}

/// All indexes registered for a collection.
pub fn list_indexes(conn: &Connection, collection: &str) -> Result<Vec<IndexDescriptor>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT name, fields, uniq, fts, tokenizer
         FROM {REGISTRY_TABLE} WHERE collection = ?1 ORDER BY name"
    ))?;
    let rows = stmt.query_map(params![collection], row_to_descriptor)?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}

/// Drop an index by its name or by the single field path it covers.
pub fn drop_index(conn: &Connection, collection: &str, target: &str) -> Result<()> {
    let indexes = list_indexes(conn, collection)?;
    let descriptor = indexes
        .into_iter()
        .find(|d| d.name == target || (d.fields.len() == 1 && d.fields[0] == target))
        .ok_or_else(|| Error::IndexNotFound(format!("{collection}.{target}")))?;
    drop_one(conn, collection, &descriptor)
}

/// Drop every index on a collection.
pub fn drop_indexes(conn: &Connection, collection: &str) -> Result<()> {
    for descriptor in list_indexes(conn, collection)? {
        drop_one(conn, collection, &descriptor)?;
    }
    Ok(())
}

fn drop_one(conn: &Connection, collection: &str, descriptor: &IndexDescriptor) -> Result<()> {
    let name = &descriptor.name;
    if descriptor.fts {
        conn.execute_batch(&format!(
            "DROP TRIGGER IF EXISTS \"{name}_ai\";
             DROP TRIGGER IF EXISTS \"{name}_ad\";
             DROP TRIGGER IF EXISTS \"{name}_au\";
             DROP TABLE IF EXISTS \"{name}\";"
        ))?;
    } else {
        conn.execute(&format!("DROP INDEX IF EXISTS \"{name}\""), [])?;
    }
    conn.execute(
        &format!("DELETE FROM {REGISTRY_TABLE} WHERE collection = ?1 AND name = ?2"),
        params![collection, name],
    )?;
    debug!(collection, index = %name, "dropped index");
    Ok(())
}

/// The FTS tables and their indexed paths for a collection, for `$text`
/// compilation and evaluation.
pub fn text_indexes(conn: &Connection, collection: &str) -> Result<Vec<(String, String)>> {
    Ok(list_indexes(conn, collection)?
        .into_iter()
        .filter(|d| d.fts)
        .filter_map(|d| {
            let field = d.fields.first().cloned()?;
            Some((d.name, field))
        })
        .collect())
}
