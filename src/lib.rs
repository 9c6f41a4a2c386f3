//! MongoDB-style document collections on SQLite.
//!
//! Documents are JSON objects stored in plain `(id, data)` rows. Filters,
//! updates, and aggregation pipelines use the familiar `$` operator grammar;
//! wherever an expression has an exact JSON1 rendition it runs as native SQL,
//! and everything else runs through an in-process evaluator with identical
//! semantics.
//!
//! ```no_run
//! use doclite::Database;
//! use serde_json::json;
//!
//! # fn main() -> doclite::Result<()> {
//! let db = Database::open("app.db")?;
//! let users = db.collection("users")?;
//!
//! users.insert_one(json!({"name": "Alice", "age": 34}))?;
//! let adults = users.find(&json!({"age": {"$gte": 18}}), None)?;
//! # let _ = adults;
//! # Ok(())
//! # }
//! ```

pub mod aggregate;
pub mod bytes;
pub mod collection;
pub mod compile;
pub mod database;
pub mod document;
pub mod error;
pub mod filter;
pub mod index;
pub mod update;

pub use collection::{BulkOutcome, Collection, UpdateOutcome, WriteOp};
pub use database::Database;
pub use document::Document;
pub use error::{Error, Result};
pub use index::{IndexDescriptor, IndexOptions};
