//! Persistence Boundary
//!
//! A stored node can be backed by a [`Backend`]. The node calls `load` once
//! when it is built and `save` after every write. Backend failures stay on
//! this side of the boundary: they are logged and the in-memory value wins.
//!
//! [`KeyedBackend`] adapts any byte-oriented [`KeyValueStore`] by encoding
//! values with a [`Codec`].

use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::BackendError;

/// Durable storage for a single stored node's value.
pub trait Backend<T>: Send + Sync {
    /// Fetch the persisted value. `Ok(None)` means nothing was saved yet.
    fn load(&self) -> Result<Option<T>, BackendError>;

    /// Persist a new value.
    fn save(&self, value: &T) -> Result<(), BackendError>;
}

/// A byte-oriented key-value store.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, BackendError>;

    fn set(&self, key: &str, bytes: Vec<u8>) -> Result<(), BackendError>;
}

/// In-process [`KeyValueStore`], shared by clones.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    entries: Arc<RwLock<HashMap<String, Vec<u8>>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.read().contains_key(key)
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, BackendError> {
        Ok(self.entries.read().get(key).cloned())
    }

    fn set(&self, key: &str, bytes: Vec<u8>) -> Result<(), BackendError> {
        self.entries.write().insert(key.to_string(), bytes);
        Ok(())
    }
}

/// Value encoding used by [`KeyedBackend`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Codec {
    /// Compact binary encoding.
    #[default]
    MessagePack,
    /// Human-readable encoding.
    Json,
}

impl Codec {
    pub fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, BackendError> {
        match self {
            Codec::MessagePack => Ok(rmp_serde::to_vec(value)?),
            Codec::Json => {
                serde_json::to_vec(value).map_err(|e| BackendError::Encode(e.to_string()))
            }
        }
    }

    pub fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, BackendError> {
        match self {
            Codec::MessagePack => Ok(rmp_serde::from_slice(bytes)?),
            Codec::Json => {
                serde_json::from_slice(bytes).map_err(|e| BackendError::Decode(e.to_string()))
            }
        }
    }
}

/// Stores one value under one key of a [`KeyValueStore`].
pub struct KeyedBackend<S, T> {
    store: S,
    key: String,
    codec: Codec,
    _marker: PhantomData<fn() -> T>,
}

impl<S, T> KeyedBackend<S, T>
where
    S: KeyValueStore,
{
    pub fn new(store: S, key: impl Into<String>) -> Self {
        Self {
            store,
            key: key.into(),
            codec: Codec::default(),
            _marker: PhantomData,
        }
    }

    pub fn with_codec(mut self, codec: Codec) -> Self {
        self.codec = codec;
        self
    }

    pub fn key(&self) -> &str {
        &self.key
    }
}

impl<S, T> Backend<T> for KeyedBackend<S, T>
where
    S: KeyValueStore,
    T: Serialize + DeserializeOwned,
{
    fn load(&self) -> Result<Option<T>, BackendError> {
        match self.store.get(&self.key)? {
            Some(bytes) => self.codec.decode(&bytes).map(Some),
            None => Ok(None),
        }
    }

    fn save(&self, value: &T) -> Result<(), BackendError> {
        let bytes = self.codec.encode(value)?;
        self.store.set(&self.key, bytes)
    }
}
