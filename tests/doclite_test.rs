use doclite::{Database, IndexOptions, WriteOp};
use serde_json::json;
use tempfile::tempdir;

#[test]
fn test_insert_then_find_one() {
    let db = Database::in_memory().unwrap();
    let items = db.collection("items").unwrap();

    let id = items.insert_one(json!({"x": 1})).unwrap();
    let found = items.find_one(&json!({"x": {"$gt": 0}})).unwrap().unwrap();
    assert_eq!(found, json!({"_id": id, "x": 1}));
}

#[test]
fn test_push_through_fallback_path() {
    let db = Database::in_memory().unwrap();
    let items = db.collection("items").unwrap();
    items.insert_one(json!({"x": 1})).unwrap();

    items
        .update_one(&json!({"x": 1}), &json!({"$push": {"tags": "t"}}), false)
        .unwrap();
    let doc = items.find_one(&json!({"x": 1})).unwrap().unwrap();
    assert_eq!(doc["x"], json!(1));
    assert_eq!(doc["tags"], json!(["t"]));
}

#[test]
fn test_aggregate_group_counts() {
    let db = Database::in_memory().unwrap();
    let items = db.collection("items").unwrap();
    items
        .insert_many(vec![json!({"x": 1}), json!({"x": 1}), json!({"x": 2})])
        .unwrap();

    let mut out = items
        .aggregate(&json!([
            {"$match": {"x": {"$exists": true}}},
            {"$group": {"_id": "$x", "c": {"$sum": 1}}}
        ]))
        .unwrap();
    out.sort_by_key(|d| d["_id"].as_i64());
    assert_eq!(out, vec![json!({"_id": 1, "c": 2}), json!({"_id": 2, "c": 1})]);
}

#[test]
fn test_text_search_over_fts_index() {
    let db = Database::in_memory().unwrap();
    let items = db.collection("items").unwrap();
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
    items.insert_one(json!({"a": "unrelated text"})).unwrap();
    items.insert_one(json!({"b": 42})).unwrap();

    let found = items
        .find(&json!({"$text": {"$search": "hello"}}), None)
        .unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0]["_id"], json!(id));

    // updates keep the index in sync through the triggers
    items
        .update_one(&json!({"_id": id}), &json!({"$set": {"a": "goodbye"}}), false)
        .unwrap();
    assert!(items
        .find(&json!({"$text": {"$search": "hello"}}), None)
        .unwrap()
        .is_empty());
}

#[test]
fn test_store_survives_reopen() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("docs.db");

    {
        let db = Database::open(&path).unwrap();
        let books = db.collection("books").unwrap();
        books
            .insert_many(vec![
                json!({"title": "Dune", "year": 1965}),
                json!({"title": "Neuromancer", "year": 1984}),
            ])
            .unwrap();
        books.create_index(&["year"], IndexOptions::default()).unwrap();
    }

    let db = Database::open(&path).unwrap();
    let books = db.collection("books").unwrap();
    assert_eq!(books.count_documents(&json!({})).unwrap(), 2);
    assert_eq!(books.list_indexes().unwrap().len(), 1);
    let old = books.find_one(&json!({"year": {"$lt": 1980}})).unwrap().unwrap();
    assert_eq!(old["title"], json!("Dune"));
}

#[test]
fn test_dual_path_equivalence_per_filter() {
    let db = Database::in_memory().unwrap();
    let items = db.collection("items").unwrap();
    items
        .insert_many(vec![
            json!({"n": 1, "s": "alpha", "tags": ["x"]}),
            json!({"n": 2.5, "s": "beta"}),
            json!({"n": "2", "tags": ["x", "y"]}),
            json!({"n": null}),
            json!({"s": "alpha beta"}),
        ])
        .unwrap();

    for filter in [
        json!({"n": 1}),
        json!({"n": {"$gte": 1}}),
        json!({"n": {"$lt": 3}}),
        json!({"n": {"$ne": 2.5}}),
        json!({"n": {"$in": [1, "2"]}}),
        json!({"n": {"$nin": [1, "2"]}}),
        json!({"n": {"$exists": true}}),
        json!({"n": null}),
        json!({"s": {"$contains": "alpha"}}),
        json!({"tags": {"$size": 2}}),
        json!({"n": {"$mod": [2, 1]}}),
    ] {
        let native = items.find(&filter, None).unwrap();
        // wrapping in $and forces the whole filter onto the evaluator
        let evaluated = items.find(&json!({"$and": [filter.clone()]}), None).unwrap();
        assert_eq!(native, evaluated, "diverged on {filter}");
    }
}

#[test]
fn test_unique_index_surfaces_constraint_errors() {
    let db = Database::in_memory().unwrap();
    let users = db.collection("users").unwrap();
    users
        .create_index(
            &["email"],
            IndexOptions {
                unique: true,
                ..Default::default()
            },
        )
        .unwrap();

    users.insert_one(json!({"email": "a@example.com"})).unwrap();
    assert!(users.insert_one(json!({"email": "a@example.com"})).is_err());
    users.insert_one(json!({"email": "b@example.com"})).unwrap();
}

#[test]
fn test_bulk_write_unordered_reports_first_error() {
    let db = Database::in_memory().unwrap();
    let items = db.collection("items").unwrap();

    let result = items.bulk_write(
        vec![
            WriteOp::InsertOne {
                document: json!({"x": 1}),
            },
            WriteOp::DeleteMany {
                filter: json!({"$bad": 1}),
            },
            WriteOp::InsertOne {
                document: json!({"x": 2}),
            },
        ],
        false,
    );
    assert!(result.is_err());
    // all-or-nothing even when unordered
    assert_eq!(items.count_documents(&json!({})).unwrap(), 0);
}

#[test]
fn test_binary_round_trip_and_equality() {
    let db = Database::in_memory().unwrap();
    let files = db.collection("files").unwrap();

    let blob = doclite::bytes::encode(&[0u8, 159, 146, 150]);
    let id = files
        .insert_one(json!({"name": "raw.bin", "body": blob.clone()}))
        .unwrap();

    let found = files.find_one(&json!({ "body": blob })).unwrap().unwrap();
    assert_eq!(found["_id"], json!(id));
    assert_eq!(
        doclite::bytes::decode(&found["body"]).unwrap(),
        vec![0u8, 159, 146, 150]
    );
}

#[test]
fn test_pipeline_prefix_and_interpreter_agree_on_order() {
    let db = Database::in_memory().unwrap();
    let events = db.collection("events").unwrap();
    events
        .insert_many(vec![
            json!({"kind": "a", "n": 3}),
            json!({"kind": "a", "n": 1}),
            json!({"kind": "b", "n": 9}),
            json!({"kind": "a", "n": 2}),
        ])
        .unwrap();

    // native: $match/$sort/$skip/$limit fold into one statement
    let native = events
        .aggregate(&json!([
            {"$match": {"kind": "a"}},
            {"$sort": {"n": 1}},
            {"$skip": 1},
            {"$limit": 1},
            {"$project": {"_id": 0, "n": 1}}
        ]))
        .unwrap();
    assert_eq!(native, vec![json!({"n": 2})]);

    // evaluator: the $or match keeps the whole pipeline in-process
    let interpreted = events
        .aggregate(&json!([
            {"$match": {"$or": [{"kind": "a"}]}},
            {"$sort": {"n": 1}},
            {"$skip": 1},
            {"$limit": 1},
            {"$project": {"_id": 0, "n": 1}}
        ]))
        .unwrap();
    assert_eq!(interpreted, native);
}

#[test]
fn test_unwind_and_distinct() {
    let db = Database::in_memory().unwrap();
    let posts = db.collection("posts").unwrap();
    posts
        .insert_many(vec![
            json!({"title": "p1", "tags": ["rust", "db"]}),
            json!({"title": "p2", "tags": ["rust"]}),
            json!({"title": "p3"}),
        ])
        .unwrap();

    let unwound = posts
        .aggregate(&json!([{"$unwind": "$tags"}, {"$project": {"_id": 0, "tags": 1}}]))
        .unwrap();
    assert_eq!(
        unwound,
        vec![
            json!({"tags": "rust"}),
            json!({"tags": "db"}),
            json!({"tags": "rust"}),
            json!({})
        ]
    );

    let distinct = posts.distinct("title", &json!({})).unwrap();
    assert_eq!(distinct, vec![json!("p1"), json!("p2"), json!("p3")]);
}
