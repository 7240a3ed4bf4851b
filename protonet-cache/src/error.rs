//! Cache error types.

use thiserror::Error;

/// Consistency errors raised by the object cache.
///
/// Every variant indicates either a corrupt stream or a bug in the calling
/// layer; none of them is recoverable within a single operation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CacheError {
    #[error("the root object cannot be reassigned")]
    RootReassigned,

    #[error("reference-tracked objects cannot change reference (key {key})")]
    ReferenceChanged { key: u32 },

    #[error("no root object assigned")]
    NoRoot,

    #[error("a deferred key does not have a value yet (key {key})")]
    DeferredKey { key: u32 },

    #[error("a missing key occurred (key {key})")]
    MissingKey { key: u32 },

    #[error("object cache key space exhausted")]
    KeyOverflow,
}
