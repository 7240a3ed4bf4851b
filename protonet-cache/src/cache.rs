//! Reference-tracking object cache.
//!
//! The cache hands out small integer keys for values seen during one
//! serialize or deserialize operation:
//!
//! - key `0` is the root object; it is bound once and never changes
//! - every other value gets `key = slot index + 1`, in insertion order
//! - objects are matched by identity (the address behind the `Arc`), strings
//!   by value, so two equal strings collapse to one key while two equal but
//!   distinct objects do not
//!
//! A cache lives exactly as long as its operation and is not shared between
//! threads while in use.

use crate::error::CacheError;
use crate::shard::{ShardSet, Slot};
use crate::{DEFAULT_SHARD_CAPACITY, ROOT_KEY};
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

/// A shared, type-erased object reference.
pub type ObjectRef = Arc<dyn Any + Send + Sync>;

/// A value tracked by the cache.
#[derive(Debug, Clone)]
pub enum CachedValue {
    /// An object compared by identity.
    Object(ObjectRef),
    /// A string compared by value.
    Str(Arc<str>),
}

impl CachedValue {
    /// Wraps a fresh object.
    pub fn object<T: Any + Send + Sync>(value: T) -> Self {
        CachedValue::Object(Arc::new(value))
    }

    /// Tracks an existing shared object; clones of the same `Arc` share a key.
    pub fn shared<T: Any + Send + Sync>(value: &Arc<T>) -> Self {
        CachedValue::Object(value.clone())
    }

    pub fn string(value: impl Into<Arc<str>>) -> Self {
        CachedValue::Str(value.into())
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            CachedValue::Str(s) => Some(s),
            CachedValue::Object(_) => None,
        }
    }

    /// Returns the object as `Arc<T>` if it is one.
    pub fn downcast<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        match self {
            CachedValue::Object(object) => object.clone().downcast::<T>().ok(),
            CachedValue::Str(_) => None,
        }
    }

    fn identity(object: &ObjectRef) -> usize {
        Arc::as_ptr(object) as *const () as usize
    }

    /// Identity for objects, value equality for strings.
    pub fn same_as(&self, other: &CachedValue) -> bool {
        match (self, other) {
            (CachedValue::Object(a), CachedValue::Object(b)) => {
                Self::identity(a) == Self::identity(b)
            }
            (CachedValue::Str(a), CachedValue::Str(b)) => a == b,
            _ => false,
        }
    }
}

impl From<&str> for CachedValue {
    fn from(value: &str) -> Self {
        CachedValue::Str(value.into())
    }
}

impl From<String> for CachedValue {
    fn from(value: String) -> Self {
        CachedValue::Str(value.into())
    }
}

/// Object cache configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Slots per shard.
    pub shard_capacity: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            shard_capacity: DEFAULT_SHARD_CAPACITY,
        }
    }
}

impl CacheConfig {
    pub fn with_shard_capacity(mut self, capacity: usize) -> Self {
        self.shard_capacity = capacity;
        self
    }
}

/// Per-operation object reference cache.
#[derive(Debug)]
pub struct NetObjectCache {
    root: Option<CachedValue>,
    slots: ShardSet<CachedValue>,
    /// String value -> key.
    string_keys: HashMap<Arc<str>, u32>,
    /// Object address -> key. Addresses stay unique because the cache holds
    /// a strong reference to every object it indexes.
    object_keys: HashMap<usize, u32>,
    /// Every slot before this index is known to be occupied.
    trap_start: usize,
}

impl Default for NetObjectCache {
    fn default() -> Self {
        Self::new()
    }
}

impl NetObjectCache {
    pub fn new() -> Self {
        Self::with_config(&CacheConfig::default())
    }

    pub fn with_config(config: &CacheConfig) -> Self {
        Self {
            root: None,
            slots: ShardSet::new(config.shard_capacity),
            string_keys: HashMap::new(),
            object_keys: HashMap::new(),
            trap_start: 0,
        }
    }

    /// Returns the root object, if bound.
    pub fn root(&self) -> Option<&CachedValue> {
        self.root.as_ref()
    }

    /// Number of non-root slots, including reserved empty ones.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.root.is_none() && self.slots.is_empty()
    }

    pub fn shard_count(&self) -> usize {
        self.slots.shard_count()
    }

    /// Returns the key for `value`, assigning a new one if it was not seen.
    ///
    /// The boolean is `true` when the value already had a key. On a cache
    /// with no root, the first value added becomes the root.
    pub fn add_object_key(&mut self, value: &CachedValue) -> Result<(u32, bool), CacheError> {
        match &self.root {
            None => {
                self.root = Some(value.clone());
                return Ok((ROOT_KEY, false));
            }
            Some(root) if root.same_as(value) => return Ok((ROOT_KEY, true)),
            Some(_) => {}
        }

        if let Some(key) = self.lookup(value) {
            return Ok((key, true));
        }

        let key = self.append(Slot::occupied(value.clone()))?;
        self.index(value, key);
        Ok((key, false))
    }

    /// Reserves the next key with an empty slot, to be bound later by
    /// [`set_keyed_object`](Self::set_keyed_object) or
    /// [`register_trapped_object`](Self::register_trapped_object).
    pub fn reserve_key(&mut self) -> Result<u32, CacheError> {
        self.append(Slot::empty())
    }

    /// Binds `key` to a materialized value.
    ///
    /// Binding the same value twice is a no-op; binding a different value to
    /// an occupied key is an error.
    pub fn set_keyed_object(&mut self, key: u32, value: CachedValue) -> Result<(), CacheError> {
        if key == ROOT_KEY {
            return match &self.root {
                None => {
                    self.root = Some(value);
                    Ok(())
                }
                Some(root) if root.same_as(&value) => Ok(()),
                Some(_) => Err(CacheError::RootReassigned),
            };
        }

        let index = (key - 1) as usize;
        let len = self.slots.len();

        if index == len {
            self.append(Slot::occupied(value.clone()))?;
            self.index(&value, key);
            return Ok(());
        }
        if index > len {
            return Err(CacheError::MissingKey { key });
        }

        match self.slots.fill(index, value) {
            Ok(stored) => {
                let stored = stored.clone();
                self.index(&stored, key);
                Ok(())
            }
            Err(value) => match self.slots.get(index).and_then(Slot::get) {
                Some(existing) if existing.same_as(&value) => Ok(()),
                _ => Err(CacheError::ReferenceChanged { key }),
            },
        }
    }

    /// Resolves a key to its value.
    pub fn get_keyed_object(&self, key: u32) -> Result<&CachedValue, CacheError> {
        if key == ROOT_KEY {
            return self.root.as_ref().ok_or(CacheError::NoRoot);
        }

        let index = (key - 1) as usize;
        match self.slots.get(index) {
            None => Err(CacheError::MissingKey { key }),
            Some(slot) => slot.get().ok_or(CacheError::DeferredKey { key }),
        }
    }

    /// Registers a value whose key was reserved before it existed.
    ///
    /// The first trapped value with no root bound becomes the root. After
    /// that, the value fills the first empty slot at or after the trap
    /// cursor. Returns the key filled, or `None` when no reserved slot is
    /// left.
    pub fn register_trapped_object(&mut self, value: CachedValue) -> Option<u32> {
        if self.root.is_none() {
            self.root = Some(value);
            return Some(ROOT_KEY);
        }

        let Some(index) = self.slots.first_empty_from(self.trap_start) else {
            // Everything scanned is occupied, and occupancy never reverts.
            self.trap_start = self.slots.len();
            return None;
        };
        self.trap_start = index + 1;

        let key = u32::try_from(index + 1).ok()?;
        let stored = self.slots.fill(index, value).ok()?.clone();
        self.index(&stored, key);
        Some(key)
    }

    /// Iterates all bound non-root entries as `(key, value)`.
    pub fn entries(&self) -> impl Iterator<Item = (u32, &CachedValue)> + '_ {
        self.slots
            .occupied()
            .map(|(index, value)| ((index + 1) as u32, value))
    }

    fn lookup(&self, value: &CachedValue) -> Option<u32> {
        match value {
            CachedValue::Str(s) => self.string_keys.get(s).copied(),
            CachedValue::Object(object) => self
                .object_keys
                .get(&CachedValue::identity(object))
                .copied(),
        }
    }

    fn index(&mut self, value: &CachedValue, key: u32) {
        match value {
            CachedValue::Str(s) => {
                self.string_keys.entry(s.clone()).or_insert(key);
            }
            CachedValue::Object(object) => {
                self.object_keys
                    .entry(CachedValue::identity(object))
                    .or_insert(key);
            }
        }
    }

    fn append(&mut self, slot: Slot<CachedValue>) -> Result<u32, CacheError> {
        let key = u32::try_from(self.slots.len() + 1).map_err(|_| CacheError::KeyOverflow)?;
        self.slots.push(slot);
        Ok(key)
    }
}
