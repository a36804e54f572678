//! Persistence layer: libSQL-backed storage for tasks, runs, transcripts
//! and backend sessions.

pub mod libsql_backend;
pub mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlStore;
pub use traits::Store;
