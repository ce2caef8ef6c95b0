// Copyright 2025 Staffetta Contributors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//
// SPDX-License-Identifier: Apache-2.0

//! In-memory checkpoint and failure stores.
//!
//! Thread-safe, zero-dependency backends for local development and tests.
//! Nothing survives a process restart, so neither store provides the
//! durability the relay's delivery guarantee rests on; production
//! deployments use the `MongoDB` stores in [`crate::mongo`] instead.
//!
//! # Example
//!
//! ```rust
//! use staffetta_stores::memory::MemoryCheckpointStore;
//! use staffetta_core::checkpoint::{Checkpoint, CheckpointStore};
//! use bson::doc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let store = MemoryCheckpointStore::new();
//!
//! let checkpoint = Checkpoint::new("orders-relay", doc! { "_data": "abc123" });
//! store.save(&checkpoint).await?;
//!
//! let loaded = store.load("orders-relay").await?;
//! assert!(loaded.is_some());
//! # Ok(())
//! # }
//! ```

use staffetta_core::checkpoint::{Checkpoint, CheckpointStore, CheckpointStoreError};
use staffetta_core::failure::{FailedMessageRecord, FailureStore, FailureStoreError};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, trace};

/// In-memory checkpoint store keyed by watch identifier.
#[derive(Debug, Clone, Default)]
pub struct MemoryCheckpointStore {
    checkpoints: Arc<RwLock<HashMap<String, Checkpoint>>>,
}

impl MemoryCheckpointStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of stored checkpoints.
    pub async fn len(&self) -> usize {
        self.checkpoints.read().await.len()
    }

    /// Returns `true` if the store holds no checkpoints.
    pub async fn is_empty(&self) -> bool {
        self.checkpoints.read().await.is_empty()
    }
}

#[async_trait::async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn save(&self, checkpoint: &Checkpoint) -> Result<(), CheckpointStoreError> {
        trace!(watch_id = %checkpoint.watch_id, "saving checkpoint to memory");
        let mut checkpoints = self.checkpoints.write().await;
        checkpoints.insert(checkpoint.watch_id.clone(), checkpoint.clone());
        Ok(())
    }

    async fn load(&self, watch_id: &str) -> Result<Option<Checkpoint>, CheckpointStoreError> {
        let checkpoints = self.checkpoints.read().await;
        let checkpoint = checkpoints.get(watch_id).cloned();
        debug!(watch_id, found = checkpoint.is_some(), "loaded checkpoint from memory");
        Ok(checkpoint)
    }

    async fn delete(&self, watch_id: &str) -> Result<(), CheckpointStoreError> {
        let mut checkpoints = self.checkpoints.write().await;
        checkpoints.remove(watch_id);
        debug!(watch_id, "deleted checkpoint from memory");
        Ok(())
    }
}

/// In-memory failure store preserving insertion order.
#[derive(Debug, Clone, Default)]
pub struct MemoryFailureStore {
    records: Arc<RwLock<Vec<FailedMessageRecord>>>,
}

impl MemoryFailureStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of stored records.
    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    /// Returns `true` if the store holds no records.
    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }
}

#[async_trait::async_trait]
impl FailureStore for MemoryFailureStore {
    async fn record(&self, record: &FailedMessageRecord) -> Result<(), FailureStoreError> {
        trace!(id = %record.id, destination = %record.destination, "recording publish failure in memory");
        let mut records = self.records.write().await;
        records.push(record.clone());
        Ok(())
    }

    async fn list_oldest_first(&self) -> Result<Vec<FailedMessageRecord>, FailureStoreError> {
        let records = self.records.read().await;
        let mut out = records.clone();
        // Insertion order already matches recording time, but recorded_at is
        // the contract.
        out.sort_by(|a, b| a.recorded_at.cmp(&b.recorded_at));
        Ok(out)
    }

    async fn remove(&self, id: &str) -> Result<(), FailureStoreError> {
        let mut records = self.records.write().await;
        records.retain(|r| r.id != id);
        debug!(id, remaining = records.len(), "removed failure record from memory");
        Ok(())
    }

    async fn clear(&self) -> Result<(), FailureStoreError> {
        let mut records = self.records.write().await;
        let count = records.len();
        records.clear();
        debug!(cleared = count, "cleared failure records from memory");
        Ok(())
    }
}
