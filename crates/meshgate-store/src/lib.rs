//! meshgate-store — SQLite schema and batched transactional persistence
//! for the events the ingest pipeline admits.

pub mod schema;
pub mod writer;

pub use schema::{SchemaError, CURRENT_SCHEMA_VERSION};
pub use writer::{run, BatchWriter, WriterCommand, WriterError, WriterStats};
