//! Test doubles for collaborators

mod memory_backend;

pub use memory_backend::MemoryCollectionBackend;
