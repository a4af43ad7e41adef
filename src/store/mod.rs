//! Persistence layer, libSQL-backed storage for conversations, the ledger and drafts.

pub mod libsql_backend;
pub mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlBackend;
pub use traits::{CommitOutcome, Database, RetryStatus, RetryTask};
