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

//! Durable holding area for messages that could not be published.
//!
//! The publisher writes exactly one [`FailedMessageRecord`] per failed
//! publish attempt. Records survive process restarts and are consumed by
//! the replay pass at startup and after every broker recovery
//! (see [`crate::publish::replay_failed`]).
//!
//! Replay removes a record only after its republish succeeded; a record
//! whose republish fails again stays in the store for the next pass.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Persisted record of a publish failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedMessageRecord {
    /// Unique record identifier
    pub id: String,

    /// Destination name the payload was bound for
    pub destination: String,

    /// The payload that failed to publish, as sent
    pub payload: Value,

    /// Human-readable description of the failure
    pub error: String,

    /// When the failure was recorded
    #[serde(rename = "recordedAt")]
    pub recorded_at: DateTime<Utc>,
}

impl FailedMessageRecord {
    /// Creates a record for a payload that failed to reach `destination`.
    #[must_use]
    pub fn new(destination: impl Into<String>, payload: Value, error: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            destination: destination.into(),
            payload,
            error: error.into(),
            recorded_at: Utc::now(),
        }
    }
}

/// Trait for failure store backends.
#[async_trait::async_trait]
pub trait FailureStore: Send + Sync {
    /// Appends a failure record.
    ///
    /// # Errors
    ///
    /// Returns an error if the record cannot be persisted.
    async fn record(&self, record: &FailedMessageRecord) -> Result<(), FailureStoreError>;

    /// Lists all records, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot be read.
    async fn list_oldest_first(&self) -> Result<Vec<FailedMessageRecord>, FailureStoreError>;

    /// Removes a single record by id.
    ///
    /// Removing an id that no longer exists is not an error.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot be written.
    async fn remove(&self, id: &str) -> Result<(), FailureStoreError>;

    /// Removes every record.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot be written.
    async fn clear(&self) -> Result<(), FailureStoreError>;
}

/// Errors from failure store operations.
#[derive(Debug, thiserror::Error)]
pub enum FailureStoreError {
    /// Connection to the backing store failed
    #[error("connection error: {0}")]
    Connection(String),

    /// Record could not be encoded or decoded
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Other backend errors
    #[error("failure store error: {0}")]
    Other(String),
}
