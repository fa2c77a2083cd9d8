//! feed-sync/crates/storage-adapters/src/lib.rs
//!
//! `BlobStore` implementations: a process-local map for tests and
//! short-lived sessions, and a directory of JSON files for everything else.

pub mod file;
pub mod memory;

pub use file::FileBlobStore;
pub use memory::MemoryBlobStore;
