//! Durable storage. [`LogDb`] is a crash-consistent, append-only,
//! log-structured key/value store with an in-memory index.

mod logdb;

pub use logdb::{LogDb, Status};
