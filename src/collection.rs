//! The public operation surface of a collection.
//!
//! Every operation follows the same shape: parse the caller's filter/update/
//! pipeline, ask the compiler for a native statement, and run either that
//! statement or the in-process fallback. Falling back is ordinary control
//! flow, not an error; it is logged at debug level and nothing else.

use rusqlite::{params, params_from_iter, Connection};
use serde_json::{Map, Value};
use tracing::debug;

use crate::aggregate::{self, parse_pipeline, Projection};
use crate::compile::{compile_filter, CompileContext, SqlParam, Translation};
use crate::database::{with_savepoint, Database};
use crate::document::{normalize_payload, Document};
use crate::error::Result;
use crate::filter::{Clause, EvalContext, FieldCond, Filter};
use crate::index::{self, IndexDescriptor, IndexOptions};
use crate::update::{apply_update, compile_update, Update};

/// A handle to one collection. Cheap to clone.
#[derive(Clone)]
pub struct Collection {
    db: Database,
    name: String,
}

/// Counts reported by the update family of operations.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpdateOutcome {
    pub matched: u64,
    pub modified: u64,
    pub upserted_id: Option<i64>,
}

/// One request in a `bulk_write` batch.
#[derive(Debug, Clone)]
pub enum WriteOp {
    InsertOne {
        document: Value,
    },
    UpdateOne {
        filter: Value,
        update: Value,
        upsert: bool,
    },
    UpdateMany {
        filter: Value,
        update: Value,
        upsert: bool,
    },
    ReplaceOne {
        filter: Value,
        replacement: Value,
        upsert: bool,
    },
    DeleteOne {
        filter: Value,
    },
    DeleteMany {
        filter: Value,
    },
}

/// Aggregate counts for a `bulk_write` batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BulkOutcome {
    pub inserted: u64,
    pub matched: u64,
    pub modified: u64,
    pub deleted: u64,
    pub upserted: u64,
}

impl Collection {
    pub(crate) fn new(db: Database, name: String) -> Self {
        Self { db, name }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    // ----- reads -----

    /// Documents matching a filter, optionally projected.
    pub fn find(&self, filter: &Value, projection: Option<&Value>) -> Result<Vec<Value>> {
        let filter = Filter::parse(filter)?;
        let projection = projection.map(Projection::parse).transpose()?;
        let conn = self.db.conn()?;
        let (cctx, ectx) = self.contexts(&conn)?;
        let docs = self.load_matching(&conn, &filter, &cctx, &ectx, None)?;
        Ok(docs
            .iter()
            .map(|doc| {
                let full = doc.to_map();
                match &projection {
                    Some(projection) => Value::Object(projection.apply(&full)),
                    None => Value::Object(full),
                }
            })
            .collect())
    }

    /// The first matching document, if any.
    pub fn find_one(&self, filter: &Value) -> Result<Option<Value>> {
        let filter = Filter::parse(filter)?;
        let conn = self.db.conn()?;
        let (cctx, ectx) = self.contexts(&conn)?;
        let docs = self.load_matching(&conn, &filter, &cctx, &ectx, Some(1))?;
        Ok(docs.first().map(Document::to_value))
    }

    /// How many documents match a filter.
    pub fn count_documents(&self, filter: &Value) -> Result<u64> {
        let filter = Filter::parse(filter)?;
        let conn = self.db.conn()?;
        let (cctx, ectx) = self.contexts(&conn)?;
        match compile_filter(&filter, &cctx) {
            Translation::Native(fragment) => {
                let mut sql = format!("SELECT count(*) FROM \"{}\"", self.name);
                if !fragment.sql.is_empty() {
                    sql.push_str(" WHERE ");
                    sql.push_str(&fragment.sql);
                }
                let count: i64 =
                    conn.query_row(&sql, params_from_iter(fragment.params.iter()), |row| {
                        row.get(0)
                    })?;
                Ok(count as u64)
            }
            Translation::Evaluator => {
                Ok(self.load_matching(&conn, &filter, &cctx, &ectx, None)?.len() as u64)
            }
        }
    }

    /// Distinct values at a field path among matching documents, in
    /// first-seen order.
    pub fn distinct(&self, key: &str, filter: &Value) -> Result<Vec<Value>> {
        let filter = Filter::parse(filter)?;
        let conn = self.db.conn()?;
        let (cctx, ectx) = self.contexts(&conn)?;
        let docs = self.load_matching(&conn, &filter, &cctx, &ectx, None)?;

        let mut seen = std::collections::HashSet::new();
        let mut out = Vec::new();
        for doc in &docs {
            let full = doc.to_map();
            if let Some(value) = crate::document::lookup_path(&full, key) {
                let tag = serde_json::to_string(value)?;
                if seen.insert(tag) {
                    out.push(value.clone());
                }
            }
        }
        Ok(out)
    }

    // ----- writes -----

    /// Insert one document, returning its assigned `_id`.
    pub fn insert_one(&self, document: Value) -> Result<i64> {
        let conn = self.db.conn()?;
        self.insert_on(&conn, document)
    }

    /// Insert a batch atomically: either every document lands or none do.
    pub fn insert_many(&self, documents: Vec<Value>) -> Result<Vec<i64>> {
        // validate everything before touching the table
        let payloads = documents
            .into_iter()
            .map(normalize_payload)
            .collect::<Result<Vec<_>>>()?;

        let conn = self.db.conn()?;
        with_savepoint(&conn, "doclite_insert_many", |conn| {
            let mut ids = Vec::with_capacity(payloads.len());
            for payload in &payloads {
                ids.push(self.insert_payload(conn, payload)?);
            }
            Ok(ids)
        })
    }

    /// Update the first matching document.
    pub fn update_one(&self, filter: &Value, update: &Value, upsert: bool) -> Result<UpdateOutcome> {
        let conn = self.db.conn()?;
        self.update_on(&conn, filter, update, false, upsert)
    }

    /// Update every matching document.
    pub fn update_many(
        &self,
        filter: &Value,
        update: &Value,
        upsert: bool,
    ) -> Result<UpdateOutcome> {
        let conn = self.db.conn()?;
        self.update_on(&conn, filter, update, true, upsert)
    }

    /// Replace the first matching document's payload wholesale.
    pub fn replace_one(
        &self,
        filter: &Value,
        replacement: Value,
        upsert: bool,
    ) -> Result<UpdateOutcome> {
        let conn = self.db.conn()?;
        self.replace_on(&conn, filter, replacement, upsert)
    }

    /// Delete the first matching document. Returns the number deleted (0 or 1).
    pub fn delete_one(&self, filter: &Value) -> Result<u64> {
        let conn = self.db.conn()?;
        self.delete_on(&conn, filter, false)
    }

    /// Delete every matching document. Returns the number deleted.
    pub fn delete_many(&self, filter: &Value) -> Result<u64> {
        let conn = self.db.conn()?;
        self.delete_on(&conn, filter, true)
    }

    /// Apply a batch of write requests atomically. `ordered` stops at the
    /// first failure; unordered attempts every request and reports the first
    /// failure afterwards. Either way a failed batch leaves nothing behind.
    pub fn bulk_write(&self, ops: Vec<WriteOp>, ordered: bool) -> Result<BulkOutcome> {
        let conn = self.db.conn()?;
        with_savepoint(&conn, "doclite_bulk", |conn| {
            let mut outcome = BulkOutcome::default();
            let mut first_error = None;
            for op in &ops {
                match self.apply_write(conn, op, &mut outcome) {
                    Ok(()) => {}
                    Err(err) if ordered => return Err(err),
                    Err(err) => {
                        if first_error.is_none() {
                            first_error = Some(err);
                        }
                    }
                }
            }
            match first_error {
                Some(err) => Err(err),
                None => Ok(outcome),
            }
        })
    }

    // ----- aggregation -----

    /// Run an aggregation pipeline.
    pub fn aggregate(&self, pipeline: &Value) -> Result<Vec<Value>> {
        let stages = parse_pipeline(pipeline)?;
        let conn = self.db.conn()?;
        let (cctx, ectx) = self.contexts(&conn)?;

        let prefix = aggregate::compile_pipeline(&stages, &self.name, &cctx);
        let docs = match &prefix.select {
            Some(fragment) => self.query_documents(&conn, &fragment.sql, &fragment.params)?,
            None => {
                debug!(collection = %self.name, "pipeline has no native prefix, scanning");
                self.scan_all(&conn)?
            }
        };
        let maps = docs.iter().map(Document::to_map).collect();
        let out = aggregate::interpret(&stages[prefix.consumed..], maps, &ectx)?;
        Ok(out.into_iter().map(Value::Object).collect())
    }

    // ----- indexes -----

    /// Create one index over the given field path(s).
    pub fn create_index(&self, fields: &[&str], options: IndexOptions) -> Result<IndexDescriptor> {
        let fields: Vec<String> = fields.iter().map(|f| f.to_string()).collect();
        let conn = self.db.conn()?;
        index::create_index(&conn, &self.name, &fields, &options)
    }

    /// Create several single-field indexes at once.
    pub fn create_indexes(&self, specs: &[(&str, IndexOptions)]) -> Result<Vec<IndexDescriptor>> {
        let conn = self.db.conn()?;
        specs
            .iter()
            .map(|(field, options)| {
                index::create_index(&conn, &self.name, &[field.to_string()], options)
            })
            .collect()
    }

    /// Drop one index by name or single-field path.
    pub fn drop_index(&self, target: &str) -> Result<()> {
        let conn = self.db.conn()?;
        index::drop_index(&conn, &self.name, target)
    }

    /// Drop every index on this collection.
    pub fn drop_indexes(&self) -> Result<()> {
        let conn = self.db.conn()?;
        index::drop_indexes(&conn, &self.name)
    }

    pub fn list_indexes(&self) -> Result<Vec<IndexDescriptor>> {
        let conn = self.db.conn()?;
        index::list_indexes(&conn, &self.name)
    }

    // ----- internals -----

    fn contexts(&self, conn: &Connection) -> Result<(CompileContext, EvalContext)> {
        let text = index::text_indexes(conn, &self.name)?;
        let (tables, paths) = text.into_iter().unzip();
        Ok((
            CompileContext { fts_tables: tables },
            EvalContext { text_paths: paths },
        ))
    }

    fn query_documents(
        &self,
        conn: &Connection,
        sql: &str,
        params: &[SqlParam],
    ) -> Result<Vec<Document>> {
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt.query_map(params_from_iter(params.iter()), |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
        })?;
        let mut docs = Vec::new();
        for row in rows {
            let (id, raw) = row?;
            docs.push(Document::load(id, &raw)?);
        }
        Ok(docs)
    }

    fn scan_all(&self, conn: &Connection) -> Result<Vec<Document>> {
        self.query_documents(
            conn,
            &format!("SELECT id, data FROM \"{}\" ORDER BY id", self.name),
            &[],
        )
    }

    /// Documents matching a filter, by whichever path applies, in `_id`
    /// order.
    fn load_matching(
        &self,
        conn: &Connection,
        filter: &Filter,
        cctx: &CompileContext,
        ectx: &EvalContext,
        limit: Option<u64>,
    ) -> Result<Vec<Document>> {
        match compile_filter(filter, cctx) {
            Translation::Native(fragment) => {
                let mut sql = format!("SELECT id, data FROM \"{}\"", self.name);
                if !fragment.sql.is_empty() {
                    sql.push_str(" WHERE ");
                    sql.push_str(&fragment.sql);
                }
                sql.push_str(" ORDER BY id");
                if let Some(n) = limit {
                    sql.push_str(&format!(" LIMIT {n}"));
                }
                self.query_documents(conn, &sql, &fragment.params)
            }
            Translation::Evaluator => {
                debug!(collection = %self.name, "filter not translatable, using evaluator");
                let mut out = Vec::new();
                for doc in self.scan_all(conn)? {
                    if filter.matches(&doc.to_map(), ectx) {
                        out.push(doc);
                        if limit.map_or(false, |n| out.len() as u64 >= n) {
                            break;
                        }
                    }
                }
                Ok(out)
            }
        }
    }

    fn insert_on(&self, conn: &Connection, document: Value) -> Result<i64> {
        let payload = normalize_payload(document)?;
        self.insert_payload(conn, &payload)
    }

    fn insert_payload(&self, conn: &Connection, payload: &Map<String, Value>) -> Result<i64> {
        conn.execute(
            &format!("INSERT INTO \"{}\" (data) VALUES (?1)", self.name),
            params![serde_json::to_string(payload)?],
        )?;
        Ok(conn.last_insert_rowid())
    }

    fn update_on(
        &self,
        conn: &Connection,
        filter: &Value,
        update: &Value,
        many: bool,
        upsert: bool,
    ) -> Result<UpdateOutcome> {
        let filter = Filter::parse(filter)?;
        let update = Update::parse(update)?;
        let (cctx, ectx) = self.contexts(conn)?;
        let limit = if many { None } else { Some(1) };
        let targets = self.load_matching(conn, &filter, &cctx, &ectx, limit)?;

        if targets.is_empty() {
            if upsert {
                return self.upsert(conn, &filter, &update);
            }
            return Ok(UpdateOutcome::default());
        }

        match compile_update(&update) {
            Translation::Native(fragments) => {
                let ids: Vec<SqlParam> =
                    targets.iter().map(|d| SqlParam::Integer(d.id)).collect();
                let placeholders = vec!["?"; ids.len()].join(", ");
                let run = |conn: &Connection| -> Result<()> {
                    for fragment in &fragments {
                        let sql = format!(
                            "UPDATE \"{}\" SET data = {} WHERE id IN ({placeholders})",
                            self.name, fragment.sql
                        );
                        let params = fragment.params.iter().chain(ids.iter());
                        conn.execute(&sql, params_from_iter(params))?;
                    }
                    Ok(())
                };
                if fragments.len() > 1 {
                    with_savepoint(conn, "doclite_update", run)?;
                } else {
                    run(conn)?;
                }
                Ok(UpdateOutcome {
                    matched: targets.len() as u64,
                    modified: targets.len() as u64,
                    upserted_id: None,
                })
            }
            Translation::Evaluator => {
                debug!(collection = %self.name, "update not translatable, using executor");
                let mut modified = 0;
                for target in &targets {
                    let next = apply_update(&update, &target.data)?;
                    if next != target.data {
                        conn.execute(
                            &format!("UPDATE \"{}\" SET data = ?1 WHERE id = ?2", self.name),
                            params![serde_json::to_string(&next)?, target.id],
                        )?;
                        modified += 1;
                    }
                }
                Ok(UpdateOutcome {
                    matched: targets.len() as u64,
                    modified,
                    upserted_id: None,
                })
            }
        }
    }

    /// Build the upsert seed from the filter's equality conditions, run the
    /// update executor over it once, and insert the result.
    fn upsert(&self, conn: &Connection, filter: &Filter, update: &Update) -> Result<UpdateOutcome> {
        let seed = equality_seed(filter);
        let payload = apply_update(update, &seed)?;
        let id = self.insert_payload(conn, &payload)?;
        Ok(UpdateOutcome {
            matched: 0,
            modified: 0,
            upserted_id: Some(id),
        })
    }

    fn replace_on(
        &self,
        conn: &Connection,
        filter: &Value,
        replacement: Value,
        upsert: bool,
    ) -> Result<UpdateOutcome> {
        let filter = Filter::parse(filter)?;
        let payload = normalize_payload(replacement)?;
        let (cctx, ectx) = self.contexts(conn)?;
        let targets = self.load_matching(conn, &filter, &cctx, &ectx, Some(1))?;

        match targets.first() {
            Some(target) => {
                let modified = payload != target.data;
                if modified {
                    conn.execute(
                        &format!("UPDATE \"{}\" SET data = ?1 WHERE id = ?2", self.name),
                        params![serde_json::to_string(&payload)?, target.id],
                    )?;
                }
                Ok(UpdateOutcome {
                    matched: 1,
                    modified: modified as u64,
                    upserted_id: None,
                })
            }
            None if upsert => {
                let id = self.insert_payload(conn, &payload)?;
                Ok(UpdateOutcome {
                    matched: 0,
                    modified: 0,
                    upserted_id: Some(id),
                })
            }
            None => Ok(UpdateOutcome::default()),
        }
    }

    fn delete_on(&self, conn: &Connection, filter: &Value, many: bool) -> Result<u64> {
        let filter = Filter::parse(filter)?;
        let (cctx, ectx) = self.contexts(conn)?;

        if many {
            if let Translation::Native(fragment) = compile_filter(&filter, &cctx) {
                let mut sql = format!("DELETE FROM \"{}\"", self.name);
                if !fragment.sql.is_empty() {
                    sql.push_str(" WHERE ");
                    sql.push_str(&fragment.sql);
                }
                let deleted = conn.execute(&sql, params_from_iter(fragment.params.iter()))?;
                return Ok(deleted as u64);
            }
        }

        let limit = if many { None } else { Some(1) };
        let targets = self.load_matching(conn, &filter, &cctx, &ectx, limit)?;
        if targets.is_empty() {
            return Ok(0);
        }
        let ids: Vec<SqlParam> = targets.iter().map(|d| SqlParam::Integer(d.id)).collect();
        let placeholders = vec!["?"; ids.len()].join(", ");
        conn.execute(
            &format!("DELETE FROM \"{}\" WHERE id IN ({placeholders})", self.name),
            params_from_iter(ids.iter()),
        )?;
        Ok(targets.len() as u64)
    }

    fn apply_write(
        &self,
        conn: &Connection,
        op: &WriteOp,
        outcome: &mut BulkOutcome,
    ) -> Result<()> {
        match op {
            WriteOp::InsertOne { document } => {
                self.insert_on(conn, document.clone())?;
                outcome.inserted += 1;
            }
            WriteOp::UpdateOne {
                filter,
                update,
                upsert,
            } => {
                let result = self.update_on(conn, filter, update, false, *upsert)?;
                absorb(outcome, &result);
            }
            WriteOp::UpdateMany {
                filter,
                update,
                upsert,
            } => {
                let result = self.update_on(conn, filter, update, true, *upsert)?;
                absorb(outcome, &result);
            }
            WriteOp::ReplaceOne {
                filter,
                replacement,
                upsert,
            } => {
                let result = self.replace_on(conn, filter, replacement.clone(), *upsert)?;
                absorb(outcome, &result);
            }
            WriteOp::DeleteOne { filter } => {
                outcome.deleted += self.delete_on(conn, filter, false)?;
            }
            WriteOp::DeleteMany { filter } => {
                outcome.deleted += self.delete_on(conn, filter, true)?;
            }
        }
        Ok(())
    }
}

fn absorb(outcome: &mut BulkOutcome, result: &UpdateOutcome) {
    outcome.matched += result.matched;
    outcome.modified += result.modified;
    if result.upserted_id.is_some() {
        outcome.upserted += 1;
    }
}

/// The upsert seed: every top-level field with a plain equality condition,
/// set at its path. Logical clauses and non-equality operators contribute
/// nothing.
fn equality_seed(filter: &Filter) -> Map<String, Value> {
    let mut seed = Map::new();
    for clause in &filter.clauses {
        if let Clause::Field { path, conds } = clause {
            if path == crate::document::ID_FIELD {
                continue;
            }
            for cond in conds {
                if let FieldCond::Eq(value) = cond {
                    crate::document::set_path(&mut seed, path, value.clone());
                }
            }
        }
    }
    seed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::Database;
    use crate::error::Error;
    use serde_json::json;

    fn collection() -> Collection {
        let db = Database::in_memory().unwrap();
        db.collection("items").unwrap()
    }

    #[test]
    fn test_insert_and_find_round_trip() {
        let items = collection();
        let id = items.insert_one(json!({"x": 1, "nested": {"y": [1, 2]}})).unwrap();

        let found = items.find_one(&json!({"x": {"$gt": 0}})).unwrap().unwrap();
        assert_eq!(
            found,
            json!({"_id": id, "x": 1, "nested": {"y": [1, 2]}})
        );
        assert!(items.insert_one(json!("not an object")).is_err());
    }

    #[test]
    fn test_push_falls_back_and_appends() {
        let items = collection();
        items.insert_one(json!({"x": 1})).unwrap();

        let outcome = items
            .update_one(&json!({"x": 1}), &json!({"$push": {"tags": "t"}}), false)
            .unwrap();
        assert_eq!(outcome.matched, 1);
        assert_eq!(outcome.modified, 1);

        let found = items.find_one(&json!({"x": 1})).unwrap().unwrap();
        assert_eq!(found["tags"], json!(["t"]));
    }

    #[test]
    fn test_update_many_native_path() {
        let items = collection();
        items
            .insert_many(vec![
                json!({"kind": "a", "n": 1}),
                json!({"kind": "a", "n": 2}),
                json!({"kind": "b", "n": 3}),
            ])
            .unwrap();

        let outcome = items
            .update_many(
                &json!({"kind": "a"}),
                &json!({"$inc": {"n": 10}, "$set": {"seen": true}}),
                false,
            )
            .unwrap();
        assert_eq!(outcome.matched, 2);

        let values = items.distinct("n", &json!({"kind": "a"})).unwrap();
        assert_eq!(values, vec![json!(11), json!(12)]);
        assert_eq!(items.count_documents(&json!({"seen": true})).unwrap(), 2);
    }

    #[test]
    fn test_numeric_mutators_agree_with_fallback() {
        // run the same update natively and through the in-process executor
        // (an extra $push forces that path) over mixed stored types
        let docs = vec![
            json!({"v": 1}),
            json!({"v": 2.5}),
            json!({"v": "x"}),
            json!({"v": true}),
            json!({"v": null}),
            json!({"v": [1]}),
            json!({"v": {"k": 1}}),
            json!({"w": 0}),
        ];
        let updates = vec![
            json!({"$inc": {"v": 5}}),
            json!({"$mul": {"v": 2}}),
            json!({"$min": {"v": 2}}),
            json!({"$max": {"v": 2}}),
            json!({"$min": {"v": "m"}}),
            json!({"$max": {"v": "m"}}),
        ];

        for update in updates {
            let native = collection();
            native.insert_many(docs.clone()).unwrap();
            native.update_many(&json!({}), &update, false).unwrap();

            let fallback = collection();
            fallback.insert_many(docs.clone()).unwrap();
            let mut forced = update.clone();
            forced
                .as_object_mut()
                .unwrap()
                .insert("$push".to_string(), json!({"zz": 1}));
            fallback.update_many(&json!({}), &forced, false).unwrap();
            fallback
                .update_many(&json!({}), &json!({"$unset": {"zz": ""}}), false)
                .unwrap();

            assert_eq!(
                native.find(&json!({}), Some(&json!({"_id": 0}))).unwrap(),
                fallback.find(&json!({}), Some(&json!({"_id": 0}))).unwrap(),
                "paths disagree for {update}"
            );
        }
    }

    #[test]
    fn test_update_idempotence() {
        let items = collection();
        items.insert_one(json!({"n": 0})).unwrap();

        items.update_one(&json!({}), &json!({"$set": {"a": 1}}), false).unwrap();
        items.update_one(&json!({}), &json!({"$set": {"a": 1}}), false).unwrap();
        items.update_one(&json!({}), &json!({"$inc": {"n": 1}}), false).unwrap();
        items.update_one(&json!({}), &json!({"$inc": {"n": 1}}), false).unwrap();

        let doc = items.find_one(&json!({})).unwrap().unwrap();
        assert_eq!(doc["a"], json!(1));
        assert_eq!(doc["n"], json!(2));
    }

    #[test]
    fn test_upsert_seeds_from_equality_fields() {
        let items = collection();
        let outcome = items
            .update_one(
                &json!({"sku": "a-1", "warehouse.zone": 4, "qty": {"$gt": 0}}),
                &json!({"$set": {"qty": 10}}),
                true,
            )
            .unwrap();
        let id = outcome.upserted_id.unwrap();

        let doc = items.find_one(&json!({"_id": id})).unwrap().unwrap();
        assert_eq!(doc["sku"], json!("a-1"));
        assert_eq!(doc["warehouse"]["zone"], json!(4));
        assert_eq!(doc["qty"], json!(10));
    }

    #[test]
    fn test_replace_one() {
        let items = collection();
        let id = items.insert_one(json!({"x": 1, "junk": true})).unwrap();

        let outcome = items
            .replace_one(&json!({"x": 1}), json!({"x": 2}), false)
            .unwrap();
        assert_eq!(outcome.matched, 1);
        assert_eq!(outcome.modified, 1);
        let doc = items.find_one(&json!({"_id": id})).unwrap().unwrap();
        assert_eq!(doc, json!({"_id": id, "x": 2}));

        // no match, no upsert
        let outcome = items
            .replace_one(&json!({"x": 99}), json!({"x": 3}), false)
            .unwrap();
        assert_eq!(outcome, UpdateOutcome::default());
    }

    #[test]
    fn test_delete_one_and_many() {
        let items = collection();
        items
            .insert_many(vec![json!({"x": 1}), json!({"x": 1}), json!({"x": 2})])
            .unwrap();

        assert_eq!(items.delete_one(&json!({"x": 1})).unwrap(), 1);
        assert_eq!(items.count_documents(&json!({"x": 1})).unwrap(), 1);
        assert_eq!(items.delete_many(&json!({})).unwrap(), 2);
        assert_eq!(items.count_documents(&json!({})).unwrap(), 0);
    }

    #[test]
    fn test_delete_many_on_evaluator_path() {
        let items = collection();
        items
            .insert_many(vec![json!({"x": 1}), json!({"x": 2}), json!({"x": 3})])
            .unwrap();
        // $or forces the evaluator
        let deleted = items
            .delete_many(&json!({"$or": [{"x": 1}, {"x": 3}]}))
            .unwrap();
        assert_eq!(deleted, 2);
        assert_eq!(items.count_documents(&json!({})).unwrap(), 1);
    }

    #[test]
    fn test_insert_many_is_atomic() {
        let items = collection();
        let result = items.insert_many(vec![json!({"ok": 1}), json!(42)]);
        assert!(result.is_err());
        assert_eq!(items.count_documents(&json!({})).unwrap(), 0);
    }

    #[test]
    fn test_bulk_write_rolls_back_on_failure() {
        let items = collection();
        items.insert_one(json!({"x": 1})).unwrap();

        let result = items.bulk_write(
            vec![
                WriteOp::InsertOne {
                    document: json!({"x": 2}),
                },
                WriteOp::UpdateOne {
                    filter: json!({"x": 1}),
                    update: json!({"$bogus": {"a": 1}}),
                    upsert: false,
                },
            ],
            true,
        );
        assert!(matches!(result, Err(Error::MalformedQuery(_))));
        // the insert before the failure was rolled back
        assert_eq!(items.count_documents(&json!({})).unwrap(), 1);
    }

    #[test]
    fn test_bulk_write_counts() {
        let items = collection();
        let outcome = items
            .bulk_write(
                vec![
                    WriteOp::InsertOne {
                        document: json!({"x": 1}),
                    },
                    WriteOp::InsertOne {
                        document: json!({"x": 2}),
                    },
                    WriteOp::UpdateMany {
                        filter: json!({}),
                        update: json!({"$set": {"seen": true}}),
                        upsert: false,
                    },
                    WriteOp::DeleteOne {
                        filter: json!({"x": 1}),
                    },
                    WriteOp::UpdateOne {
                        filter: json!({"x": 9}),
                        update: json!({"$set": {"x": 9}}),
                        upsert: true,
                    },
                ],
                true,
            )
            .unwrap();
        assert_eq!(outcome.inserted, 2);
        assert_eq!(outcome.matched, 2);
        assert_eq!(outcome.deleted, 1);
        assert_eq!(outcome.upserted, 1);
    }

    #[test]
    fn test_aggregate_group() {
        let items = collection();
        items
            .insert_many(vec![json!({"x": 1}), json!({"x": 1}), json!({"x": 2})])
            .unwrap();

        let out = items
            .aggregate(&json!([
                {"$match": {"x": {"$gte": 1}}},
                {"$group": {"_id": "$x", "c": {"$sum": 1}}}
            ]))
            .unwrap();
        assert_eq!(
            out,
            vec![json!({"_id": 1, "c": 2}), json!({"_id": 2, "c": 1})]
        );
    }

    #[test]
    fn test_projection_exclusivity() {
        let items = collection();
        let id = items.insert_one(json!({"a": 1, "b": 2})).unwrap();

        let only_a = items
            .find(&json!({}), Some(&json!({"_id": 0, "a": 1})))
            .unwrap();
        assert_eq!(only_a, vec![json!({"a": 1})]);

        let without_a = items.find(&json!({}), Some(&json!({"a": 0}))).unwrap();
        assert_eq!(without_a, vec![json!({"_id": id, "b": 2})]);

        assert!(items.find(&json!({}), Some(&json!({"a": 0, "b": 1}))).is_err());
    }

    #[test]
    fn test_text_search_through_fts_index() {
        let items = collection();
        items
            .create_index(
                &["a"],
                IndexOptions {
                    fts: true,
                    ..Default::default()
                },
            )
            .unwrap();
        let id = items.insert_one(json!({"a": "Hello World"})).unwrap();
        items.insert_one(json!({"a": "nothing here"})).unwrap();

        let found = items.find(&json!({"$text": {"$search": "hello"}}), None).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0]["_id"], json!(id));
    }

    #[test]
    fn test_dual_path_equivalence_on_mixed_types() {
        let items = collection();
        items
            .insert_many(vec![
                json!({"v": 1}),
                json!({"v": 2.5}),
                json!({"v": "3"}),
                json!({"v": null}),
                json!({"w": 0}),
                json!({"v": [1, 2]}),
            ])
            .unwrap();

        for filter in [
            json!({"v": {"$gt": 1}}),
            json!({"v": {"$lte": 2.5}}),
            json!({"v": {"$ne": 1}}),
            json!({"v": {"$exists": false}}),
            json!({"v": null}),
            json!({"v": {"$in": [1, "3"]}}),
            json!({"v": {"$nin": [1]}}),
            json!({"v": {"$size": 2}}),
            json!({"v": {"$mod": [2, 0]}}),
        ] {
            // the same filter under $and is forced onto the evaluator
            let native = items.find(&filter, None).unwrap();
            let fallback = items.find(&json!({"$and": [filter]}), None).unwrap();
            assert_eq!(native, fallback, "paths diverged");
        }
    }
}
