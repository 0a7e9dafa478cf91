//! Atomic, idempotent replacement of a dataset living in a shared
//! Postgres instance.
//!
//! Each import lands in its own schema; a bookkeeping table points at the
//! schemas holding successful imports, most recent first. The coordinator
//! serializes concurrent runs with a database-level lock, skips the whole
//! import when the feed digest is unchanged, commits the new schema's
//! record atomically, and sweeps schemas the retention policy no longer
//! keeps.

pub mod bookkeeping;
pub mod config;
pub mod coordinator;
pub mod digest;
pub mod error;
pub mod post_commit;
pub mod retention;
pub mod schema;
pub mod subprocess;

pub use coordinator::{ImportCoordinator, ImportOutcome};
pub use error::{ImportError, Result};
