//! Storage backends for memvault

pub mod index;
pub mod sqlite;

pub use index::{BlobVectorIndex, VectorIndex};
pub use sqlite::MemoryStore;
