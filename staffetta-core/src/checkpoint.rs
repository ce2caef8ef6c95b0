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

//! Durable resume-point tracking.
//!
//! The [`CheckpointStore`] trait persists the last successfully relayed
//! resume token per logical watch identifier, so a restarted watcher can
//! resume the change feed strictly after the last event it fully processed.
//!
//! Checkpoints are keyed by a stable watch identifier and upserted in
//! place: for a given `watch_id` at most one checkpoint is current.
//! Only the watcher that owns a `watch_id` ever writes its checkpoint,
//! and only after every destination for the corresponding event has been
//! attempted.

use bson::Document;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Persisted resume-point record for one watch session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Stable identifier of the watch session that owns this record
    #[serde(rename = "watchId")]
    pub watch_id: String,

    /// Opaque resume token of the last fully relayed event
    #[serde(rename = "resumeToken")]
    pub resume_token: Document,

    /// When the checkpoint was written
    #[serde(rename = "observedAt")]
    pub observed_at: DateTime<Utc>,
}

impl Checkpoint {
    /// Creates a checkpoint stamped with the current time.
    #[must_use]
    pub fn new(watch_id: impl Into<String>, resume_token: Document) -> Self {
        Self {
            watch_id: watch_id.into(),
            resume_token,
            observed_at: Utc::now(),
        }
    }
}

/// Trait for checkpoint storage backends.
///
/// Implementations must upsert by `watch_id` so that repeated saves for the
/// same watch replace the previous record rather than accumulating history.
#[async_trait::async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Saves (upserts) the checkpoint for a watch identifier.
    ///
    /// # Errors
    ///
    /// Returns an error if the record cannot be persisted. Callers on the
    /// feed path treat this as best-effort: the failure is logged and the
    /// feed continues.
    async fn save(&self, checkpoint: &Checkpoint) -> Result<(), CheckpointStoreError>;

    /// Loads the current checkpoint for a watch identifier.
    ///
    /// Returns `None` when the watch has never checkpointed.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot be read.
    async fn load(&self, watch_id: &str) -> Result<Option<Checkpoint>, CheckpointStoreError>;

    /// Deletes the checkpoint for a watch identifier.
    ///
    /// # Errors
    ///
    /// Returns an error if the record cannot be deleted.
    async fn delete(&self, watch_id: &str) -> Result<(), CheckpointStoreError>;
}

/// Errors from checkpoint store operations.
#[derive(Debug, thiserror::Error)]
pub enum CheckpointStoreError {
    /// Connection to the backing store failed
    #[error("connection error: {0}")]
    Connection(String),

    /// Record could not be encoded or decoded
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Other backend errors
    #[error("checkpoint store error: {0}")]
    Other(String),
}
