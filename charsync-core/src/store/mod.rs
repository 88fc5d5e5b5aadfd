//! Durable local content: the hash-addressed cache and its index

mod content_store;
mod hasher;
mod index_log;

pub use content_store::ContentStore;
pub use hasher::{Blake3Hasher, ContentHasher};
pub use index_log::{IndexEntry, IndexLog};
