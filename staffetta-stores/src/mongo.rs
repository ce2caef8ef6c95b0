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

//! `MongoDB`-backed checkpoint and failure stores.
//!
//! Both stores live in the relay's events database, the one database the
//! change feed is configured to ignore, so the relay never observes its own
//! bookkeeping writes. Checkpoints go to the `checkpoints` collection
//! (one document per watch identifier, upserted in place) and failure
//! records to `failed_messages` (append-only until replayed).
//!
//! Using the watched deployment itself as the backing store means the
//! delivery guarantee needs no third system: if the deployment is up enough
//! to produce events, it is up enough to persist their checkpoints.

use bson::{doc, Bson, Document};
use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use mongodb::{Client, Collection};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use staffetta_core::checkpoint::{Checkpoint, CheckpointStore, CheckpointStoreError};
use staffetta_core::failure::{FailedMessageRecord, FailureStore, FailureStoreError};
use tracing::{debug, trace};

const CHECKPOINTS_COLLECTION: &str = "checkpoints";
const FAILURES_COLLECTION: &str = "failed_messages";

#[derive(Debug, Serialize, Deserialize)]
struct CheckpointDoc {
    #[serde(rename = "watchId")]
    watch_id: String,

    #[serde(rename = "resumeToken")]
    resume_token: Document,

    #[serde(
        rename = "observedAt",
        with = "bson::serde_helpers::chrono_datetime_as_bson_datetime"
    )]
    observed_at: DateTime<Utc>,
}

impl From<&Checkpoint> for CheckpointDoc {
    fn from(checkpoint: &Checkpoint) -> Self {
        Self {
            watch_id: checkpoint.watch_id.clone(),
            resume_token: checkpoint.resume_token.clone(),
            observed_at: checkpoint.observed_at,
        }
    }
}

impl From<CheckpointDoc> for Checkpoint {
    fn from(doc: CheckpointDoc) -> Self {
        Self {
            watch_id: doc.watch_id,
            resume_token: doc.resume_token,
            observed_at: doc.observed_at,
        }
    }
}

/// Checkpoint store backed by a `MongoDB` collection.
///
/// One document per watch identifier; saves upsert in place so the
/// collection never grows with feed progress.
#[derive(Debug, Clone)]
pub struct MongoCheckpointStore {
    collection: Collection<CheckpointDoc>,
}

impl MongoCheckpointStore {
    /// Creates a store over `events_database.checkpoints`.
    #[must_use]
    pub fn new(client: &Client, events_database: &str) -> Self {
        Self {
            collection: client
                .database(events_database)
                .collection(CHECKPOINTS_COLLECTION),
        }
    }
}

#[async_trait::async_trait]
impl CheckpointStore for MongoCheckpointStore {
    async fn save(&self, checkpoint: &Checkpoint) -> Result<(), CheckpointStoreError> {
        trace!(watch_id = %checkpoint.watch_id, "upserting checkpoint");

        self.collection
            .replace_one(
                doc! { "watchId": &checkpoint.watch_id },
                CheckpointDoc::from(checkpoint),
            )
            .upsert(true)
            .await
            .map_err(|e| CheckpointStoreError::Connection(e.to_string()))?;

        Ok(())
    }

    async fn load(&self, watch_id: &str) -> Result<Option<Checkpoint>, CheckpointStoreError> {
        let found = self
            .collection
            .find_one(doc! { "watchId": watch_id })
            .await
            .map_err(|e| CheckpointStoreError::Connection(e.to_string()))?;

        debug!(watch_id, found = found.is_some(), "loaded checkpoint");
        Ok(found.map(Checkpoint::from))
    }

    async fn delete(&self, watch_id: &str) -> Result<(), CheckpointStoreError> {
        self.collection
            .delete_one(doc! { "watchId": watch_id })
            .await
            .map_err(|e| CheckpointStoreError::Connection(e.to_string()))?;

        debug!(watch_id, "deleted checkpoint");
        Ok(())
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct FailureDoc {
    #[serde(rename = "_id")]
    id: String,

    destination: String,

    payload: Bson,

    error: String,

    #[serde(
        rename = "recordedAt",
        with = "bson::serde_helpers::chrono_datetime_as_bson_datetime"
    )]
    recorded_at: DateTime<Utc>,
}

impl FailureDoc {
    fn from_record(record: &FailedMessageRecord) -> Result<Self, FailureStoreError> {
        let payload = bson::to_bson(&record.payload)
            .map_err(|e| FailureStoreError::Serialization(e.to_string()))?;
        Ok(Self {
            id: record.id.clone(),
            destination: record.destination.clone(),
            payload,
            error: record.error.clone(),
            recorded_at: record.recorded_at,
        })
    }

    fn into_record(self) -> Result<FailedMessageRecord, FailureStoreError> {
        let payload: Value = bson::from_bson(self.payload)
            .map_err(|e| FailureStoreError::Serialization(e.to_string()))?;
        Ok(FailedMessageRecord {
            id: self.id,
            destination: self.destination,
            payload,
            error: self.error,
            recorded_at: self.recorded_at,
        })
    }
}

/// Failure store backed by a `MongoDB` collection.
#[derive(Debug, Clone)]
pub struct MongoFailureStore {
    collection: Collection<FailureDoc>,
}

impl MongoFailureStore {
    /// Creates a store over `events_database.failed_messages`.
    #[must_use]
    pub fn new(client: &Client, events_database: &str) -> Self {
        Self {
            collection: client
                .database(events_database)
                .collection(FAILURES_COLLECTION),
        }
    }
}

#[async_trait::async_trait]
impl FailureStore for MongoFailureStore {
    async fn record(&self, record: &FailedMessageRecord) -> Result<(), FailureStoreError> {
        trace!(id = %record.id, destination = %record.destination, "recording publish failure");

        let doc = FailureDoc::from_record(record)?;
        self.collection
            .insert_one(doc)
            .await
            .map_err(|e| FailureStoreError::Connection(e.to_string()))?;

        Ok(())
    }

    async fn list_oldest_first(&self) -> Result<Vec<FailedMessageRecord>, FailureStoreError> {
        let mut cursor = self
            .collection
            .find(doc! {})
            .sort(doc! { "recordedAt": 1 })
            .await
            .map_err(|e| FailureStoreError::Connection(e.to_string()))?;

        let mut records = Vec::new();
        while let Some(doc) = cursor
            .try_next()
            .await
            .map_err(|e| FailureStoreError::Connection(e.to_string()))?
        {
            records.push(doc.into_record()?);
        }

        debug!(count = records.len(), "listed failure records");
        Ok(records)
    }

    async fn remove(&self, id: &str) -> Result<(), FailureStoreError> {
        self.collection
            .delete_one(doc! { "_id": id })
            .await
            .map_err(|e| FailureStoreError::Connection(e.to_string()))?;

        debug!(id, "removed failure record");
        Ok(())
    }

    async fn clear(&self) -> Result<(), FailureStoreError> {
        self.collection
            .delete_many(doc! {})
            .await
            .map_err(|e| FailureStoreError::Connection(e.to_string()))?;

        debug!("cleared failure records");
        Ok(())
    }
}
