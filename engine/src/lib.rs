//! # Stash Engine
//!
//! A small record store with field-level versioning and last-writer-wins
//! synchronization.
//!
//! ## Core Concepts
//!
//! ### Records and fields
//!
//! A [`Record`] is an identified bundle of [`Field`]s declared by a
//! [`Schema`] (the record prototype). Every field carries the time it was
//! last written, and a record's modification time follows its most recent
//! field write. Values written while a record is still being constructed
//! are not timestamped.
//!
//! ### Store
//!
//! The [`Store`] keeps records and per-remote sync watermarks behind one
//! mutex, answers [`Store::query`] with owned snapshots, and persists the
//! whole state on [`Store::commit`] in one of two XML [`Dialect`]s.
//!
//! ### Merge
//!
//! [`reconcile::merge`] reconciles a local and a remote copy: records on
//! both sides are resolved field by field, records on one side only are
//! either propagated or deleted depending on the watermark of the last
//! sync.
//!
//! ## Quick Start
//!
//! ```rust
//! use stash_engine::{Schema, Store, Value};
//!
//! let local = Store::new(Schema::tasks());
//! let task = local.new_record("task-1").with("title", "buy milk").unwrap();
//! local.add(task);
//! local.set_field("task-1", "done", true).unwrap();
//!
//! let remote = Store::new(Schema::tasks());
//! local.add_sync_source("laptop");
//! let report = local.sync(&remote, "laptop").unwrap();
//!
//! assert_eq!(report.added_to_remote, vec!["task-1".to_string()]);
//! assert_eq!(remote.get("task-1").unwrap().get("done").unwrap(), &Value::Bool(true));
//! ```

pub mod clock;
pub mod codec;
pub mod error;
pub mod field;
pub mod query;
pub mod reconcile;
pub mod record;
pub mod schema;
pub mod snapshot;
pub mod store;

// Re-export main types at crate root
pub use clock::{Clock, ManualClock, SystemClock};
pub use codec::Dialect;
pub use error::Error;
pub use field::{Field, Value};
pub use query::QueryResult;
pub use reconcile::{FieldChange, MergeReport, Side};
pub use record::Record;
pub use schema::{FieldDef, FieldType, Schema};
pub use snapshot::{StoreSnapshot, NEVER_SYNCED, SNAPSHOT_FORMAT_VERSION};
pub use store::{MergeOutcome, Store};

/// Type aliases for clarity
pub type RecordId = String;
/// Milliseconds since the Unix epoch
pub type Timestamp = i64;
