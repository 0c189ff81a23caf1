//! Metastore implementations for persisting key version history
//!
//! - In-memory metastore for tests and single-process deployments
//! - File metastore writing one JSON document per key version
//! - Other backends can be added by implementing the `Metastore` trait

pub mod file;
pub mod memory;

pub use file::FileMetastore;
pub use memory::InMemoryMetastore;
