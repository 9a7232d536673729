// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Object storage seam.
//!
//! Uploads go straight from the client to object storage; this crate only
//! needs to remove objects when a route is deleted.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::Mutex;

/// Errors from object-store operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ObjectStoreError {
    /// The backend could not be reached or refused the request.
    #[error("Object store unavailable: {0}")]
    Unavailable(String),
}

/// Trait for object stores holding uploaded originals and renditions.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Store type identifier (e.g., "memory").
    fn store_type(&self) -> &'static str;

    /// Delete `keys`. Missing keys are not an error.
    ///
    /// Returns how many objects were actually removed.
    async fn delete_objects(&self, keys: &[String]) -> Result<u64, ObjectStoreError>;
}

/// In-memory object store for testing and local runs.
#[derive(Default, Clone)]
pub struct MemoryObjectStore {
    objects: Arc<Mutex<HashMap<String, Vec<u8>>>>,
}

impl MemoryObjectStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Store an object.
    pub async fn put(&self, key: &str, bytes: Vec<u8>) {
        self.objects.lock().await.insert(key.to_string(), bytes);
    }

    /// Whether `key` exists.
    pub async fn contains(&self, key: &str) -> bool {
        self.objects.lock().await.contains_key(key)
    }

    /// Number of stored objects.
    pub async fn len(&self) -> usize {
        self.objects.lock().await.len()
    }

    /// Whether the store is empty.
    pub async fn is_empty(&self) -> bool {
        self.objects.lock().await.is_empty()
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    fn store_type(&self) -> &'static str {
        "memory"
    }

    async fn delete_objects(&self, keys: &[String]) -> Result<u64, ObjectStoreError> {
        let mut objects = self.objects.lock().await;
        let removed = keys
            .iter()
            .filter(|key| objects.remove(key.as_str()).is_some())
            .count();
        Ok(removed as u64)
    }
}
