//! # protonet-cache
//!
//! Object reference tracking for protonet serialization graphs.
//!
//! This crate provides:
//! - Stable small integer keys for object instances (by identity) and strings (by value)
//! - A single distinguished root object at key 0
//! - Append-only sharded storage that grows without moving existing keys
//! - Forward-reference ("trapped object") resolution during deserialization

pub mod cache;
pub mod error;
pub mod shard;

pub use cache::{CacheConfig, CachedValue, NetObjectCache, ObjectRef};
pub use error::CacheError;
pub use shard::{Shard, ShardSet, Slot};

/// Key reserved for the root object.
pub const ROOT_KEY: u32 = 0;

/// Default number of slots per shard (64 Ki entries).
pub const DEFAULT_SHARD_CAPACITY: usize = 64 * 1024;
