//! Reader and writer configuration.

use crate::{
    DEFAULT_MAX_DEPTH, DEFAULT_MAX_MESSAGE_SIZE, DEFAULT_RECURSION_CHECK_DEPTH,
};
use protonet_cache::{CacheConfig, DEFAULT_SHARD_CAPACITY};
use serde::{Deserialize, Serialize};

/// Default read chunk size for streaming sources.
pub const DEFAULT_READ_BUFFER_SIZE: usize = 4096;

/// Default number of buffered bytes before the writer flushes to its sink.
pub const DEFAULT_FLUSH_THRESHOLD: usize = 1024;

/// How a writer frames length-prefixed sub-items.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteMode {
    /// Reserve a placeholder and backpatch the length once the payload is
    /// written. Output is held in memory while any such sub-item is open.
    #[default]
    Buffered,
    /// Flush freely; length-prefixed sub-items need their length up front
    /// (see `ProtoWriter::measure`).
    Streaming,
}

/// Reader configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReaderConfig {
    /// Maximum sub-item nesting depth.
    pub max_depth: usize,
    /// Maximum number of bytes one reader will consume.
    pub max_message_size: u64,
    /// Chunk size used when pulling from the source.
    pub buffer_size: usize,
    /// Slots per shard for the reader's object cache.
    pub shard_capacity: usize,
}

impl Default for ReaderConfig {
    fn default() -> Self {
        Self {
            max_depth: DEFAULT_MAX_DEPTH,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            buffer_size: DEFAULT_READ_BUFFER_SIZE,
            shard_capacity: DEFAULT_SHARD_CAPACITY,
        }
    }
}

impl ReaderConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_depth(mut self, depth: usize) -> Self {
        self.max_depth = depth;
        self
    }

    pub fn with_max_message_size(mut self, size: u64) -> Self {
        self.max_message_size = size;
        self
    }

    pub fn with_buffer_size(mut self, size: usize) -> Self {
        self.buffer_size = size.max(1);
        self
    }

    pub fn with_shard_capacity(mut self, capacity: usize) -> Self {
        self.shard_capacity = capacity;
        self
    }

    pub(crate) fn cache_config(&self) -> CacheConfig {
        CacheConfig::default().with_shard_capacity(self.shard_capacity)
    }
}

/// Writer configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WriterConfig {
    /// Sub-item framing strategy.
    pub mode: WriteMode,
    /// Buffered bytes that trigger a flush when no sub-item pins the buffer.
    pub flush_threshold: usize,
    /// Depth beyond which each new sub-item is checked against the open
    /// stack for a repeated instance.
    pub recursion_check_depth: usize,
    /// Maximum sub-item nesting depth.
    pub max_depth: usize,
    /// Largest length prefix the writer will emit.
    pub max_message_size: u64,
    /// Slots per shard for the writer's object cache.
    pub shard_capacity: usize,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            mode: WriteMode::default(),
            flush_threshold: DEFAULT_FLUSH_THRESHOLD,
            recursion_check_depth: DEFAULT_RECURSION_CHECK_DEPTH,
            max_depth: DEFAULT_MAX_DEPTH,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            shard_capacity: DEFAULT_SHARD_CAPACITY,
        }
    }
}

impl WriterConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_mode(mut self, mode: WriteMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_flush_threshold(mut self, threshold: usize) -> Self {
        self.flush_threshold = threshold;
        self
    }

    pub fn with_recursion_check_depth(mut self, depth: usize) -> Self {
        self.recursion_check_depth = depth;
        self
    }

    pub fn with_max_depth(mut self, depth: usize) -> Self {
        self.max_depth = depth;
        self
    }

    pub fn with_max_message_size(mut self, size: u64) -> Self {
        self.max_message_size = size;
        self
    }

    pub fn with_shard_capacity(mut self, capacity: usize) -> Self {
        self.shard_capacity = capacity;
        self
    }

    pub(crate) fn cache_config(&self) -> CacheConfig {
        CacheConfig::default().with_shard_capacity(self.shard_capacity)
    }
}
