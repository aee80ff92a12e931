//! Write-once artifact storage.
//!
//! This crate provides:
//! - The `ArtifactStore` contract used by the scheduler and assembly
//! - Deterministic key layout for scene artifacts and final videos
//! - A local directory store (default when no bucket is configured)
//! - An in-memory store for tests and dry runs
//! - A Cloudflare R2 store

pub mod error;
pub mod keys;
pub mod local;
pub mod memory;
pub mod r2;
pub mod store;

pub use error::{StorageError, StorageOp, StorageResult};
pub use keys::{final_key, outline_key, run_prefix, scene_key, validate_key};
pub use local::LocalStore;
pub use memory::MemoryStore;
pub use r2::{R2Config, R2Store};
pub use store::ArtifactStore;
