//! Persistence: the SQLite pool, schema migrations and the feed position store.
//!
//! - `repo`: SQL-only functions over the `pipeline_position` table.
//! - `store`: the `PositionStore` contract and its SQLite / in-memory implementations.

pub mod repo;
pub mod store;

pub use repo::*;
pub use store::{MemoryPositionStore, PositionStore, SqlitePositionStore};
