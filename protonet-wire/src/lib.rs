//! # protonet-wire
//!
//! Protocol Buffers binary wire engine.
//!
//! This crate provides:
//! - Varint, zig-zag and fixed-width primitives
//! - Field header encoding with wire-type dispatch
//! - [`ProtoWriter`]: length-prefixed and group sub-item framing with
//!   backpatching, streaming and measure modes
//! - [`ProtoReader`]: bounded, depth-limited decoding with unknown-field skipping
//! - A scoped buffer pool shared by readers and writers
//!
//! Schema mapping (which field number means what) belongs to the caller; this
//! crate only knows field numbers and wire types.

pub mod config;
pub mod error;
pub mod pool;
pub mod reader;
pub mod wire;
pub mod writer;

pub use config::{ReaderConfig, WriteMode, WriterConfig};
pub use error::{ErrorCategory, ProtoError};
pub use pool::{BufferPool, PooledBuffer};
pub use reader::ProtoReader;
pub use wire::{FieldHeader, SubItemToken, WireType, MAX_FIELD_NUMBER, MAX_VARINT_LEN};
pub use writer::ProtoWriter;

pub use protonet_cache::{CachedValue, NetObjectCache};

/// Default maximum sub-item nesting depth.
pub const DEFAULT_MAX_DEPTH: usize = 512;

/// Default maximum message size (2 GiB - 1, the protobuf limit).
pub const DEFAULT_MAX_MESSAGE_SIZE: u64 = i32::MAX as u64;

/// Nesting depth beyond which the writer checks for reference cycles.
pub const DEFAULT_RECURSION_CHECK_DEPTH: usize = 25;
