use std::collections::HashMap;

use thiserror::Error;

use crate::WatchHandle;

#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum HandleMapError {
    #[error("Duplicate key")]
    DuplicateKey,
    #[error("Invalid key")]
    InvalidKey,
}

/// Associates caller owned tokens with watch handles
///
/// Map never interprets stored tokens. They are dropped when removed,
/// when map is cleared or when map itself is dropped.
#[derive(Debug)]
pub struct HandleMap<T> {
    map: HashMap<WatchHandle, T>,
}

impl<T> HandleMap<T> {
    pub fn new() -> Self {
        HandleMap {
            map: HashMap::new(),
        }
    }

    /// Stores token for given handle
    ///
    /// Fails if handle already has a token, existing token is kept in that case
    pub fn add(&mut self, handle: WatchHandle, token: T) -> Result<(), HandleMapError> {
        if self.map.contains_key(&handle) {
            return Err(HandleMapError::DuplicateKey);
        }
        self.map.insert(handle, token);
        Ok(())
    }

    pub fn get(&self, handle: WatchHandle) -> Result<&T, HandleMapError> {
        self.map.get(&handle).ok_or(HandleMapError::InvalidKey)
    }

    pub fn get_mut(&mut self, handle: WatchHandle) -> Result<&mut T, HandleMapError> {
        self.map.get_mut(&handle).ok_or(HandleMapError::InvalidKey)
    }

    pub fn has(&self, handle: WatchHandle) -> bool {
        self.map.contains_key(&handle)
    }

    /// Removes handle and returns token that was stored for it
    pub fn remove(&mut self, handle: WatchHandle) -> Result<T, HandleMapError> {
        self.map.remove(&handle).ok_or(HandleMapError::InvalidKey)
    }

    /// Returns all stored tokens in no particular order
    pub fn values(&self) -> Vec<&T> {
        self.map.values().collect()
    }

    pub fn handles(&self) -> Vec<WatchHandle> {
        self.map.keys().copied().collect()
    }

    /// Drops every stored token
    pub fn clear(&mut self) {
        self.map.clear();
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

impl<T> Default for HandleMap<T> {
    fn default() -> Self {
        HandleMap::new()
    }
}
