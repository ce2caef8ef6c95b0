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

//! MongoDB change stream event representation.
//!
//! A [`ChangeEvent`] is the store-supplied fact describing one mutation.
//! Events are produced by the change feed watcher and consumed exactly once
//! by the message formatter before publication.
//!
//! # Example
//!
//! ```rust
//! use staffetta_core::event::{ChangeEvent, Namespace, OperationType};
//! use bson::doc;
//!
//! let event = ChangeEvent {
//!     operation: OperationType::Insert,
//!     namespace: Namespace::new("shop", "orders"),
//!     document_key: Some(doc! { "_id": "A" }),
//!     full_document: Some(doc! { "_id": "A", "total": 42 }),
//!     update_description: None,
//!     resume_token: doc! { "_data": "T1" },
//! };
//!
//! assert!(event.is_insert());
//! assert_eq!(event.namespace.full_name(), "shop.orders");
//! ```

use bson::Document;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::warn;

/// Error raised while converting a driver event into a [`ChangeEvent`].
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConversionError {
    /// The resume token could not be serialized to a BSON document.
    #[error("failed to convert resume token: {0}")]
    ResumeToken(String),
}

/// Change stream operation kinds.
///
/// The `Unknown` variant preserves operation type strings from newer MongoDB
/// versions so they can be logged and relayed instead of dropped.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[non_exhaustive]
pub enum OperationType {
    /// A document was inserted into a collection
    Insert,

    /// A document was updated in place
    Update,

    /// A document was replaced entirely
    Replace,

    /// A document was deleted
    Delete,

    /// An operation type this library does not recognize
    #[serde(untagged)]
    Unknown(String),
}

impl OperationType {
    /// Returns true if this operation carries a full resulting document.
    #[inline]
    pub fn has_full_document(&self) -> bool {
        matches!(
            self,
            OperationType::Insert | OperationType::Update | OperationType::Replace
        )
    }

    /// Returns true if this is an unrecognized operation kind.
    #[inline]
    pub fn is_unknown(&self) -> bool {
        matches!(self, OperationType::Unknown(_))
    }
}

impl fmt::Display for OperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperationType::Insert => write!(f, "insert"),
            OperationType::Update => write!(f, "update"),
            OperationType::Replace => write!(f, "replace"),
            OperationType::Delete => write!(f, "delete"),
            OperationType::Unknown(s) => write!(f, "{s}"),
        }
    }
}

/// MongoDB namespace (database + collection) affected by an operation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Namespace {
    /// Database name
    #[serde(rename = "db")]
    pub database: String,

    /// Collection name
    #[serde(rename = "coll")]
    pub collection: String,
}

impl Namespace {
    /// Creates a new namespace from database and collection names.
    pub fn new(database: impl Into<String>, collection: impl Into<String>) -> Self {
        Self {
            database: database.into(),
            collection: collection.into(),
        }
    }

    /// Returns the fully qualified namespace as "database.collection".
    pub fn full_name(&self) -> String {
        format!("{}.{}", self.database, self.collection)
    }
}

/// Field-level description of an update operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateDescription {
    /// Fields that were added or modified
    #[serde(rename = "updatedFields")]
    pub updated_fields: Document,

    /// Names of fields that were removed
    #[serde(rename = "removedFields")]
    pub removed_fields: Vec<String>,
}

impl UpdateDescription {
    /// An update description with no changed and no removed fields.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            updated_fields: Document::new(),
            removed_fields: Vec::new(),
        }
    }
}

/// A single change stream event.
///
/// Immutable once constructed; owned data throughout so events can move
/// freely between tasks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    /// Kind of operation that occurred
    #[serde(rename = "operationType")]
    pub operation: OperationType,

    /// Namespace where the operation occurred
    #[serde(rename = "ns")]
    pub namespace: Namespace,

    /// Document key (`_id` plus shard key if sharded)
    #[serde(rename = "documentKey", skip_serializing_if = "Option::is_none")]
    pub document_key: Option<Document>,

    /// Full resulting document, when the operation produces one
    #[serde(rename = "fullDocument", skip_serializing_if = "Option::is_none")]
    pub full_document: Option<Document>,

    /// What changed, for update operations
    #[serde(rename = "updateDescription", skip_serializing_if = "Option::is_none")]
    pub update_description: Option<UpdateDescription>,

    /// Opaque resume token positioning this event in the feed
    #[serde(rename = "_id")]
    pub resume_token: Document,
}

impl ChangeEvent {
    /// Returns true if this is an insert operation.
    #[inline]
    pub fn is_insert(&self) -> bool {
        self.operation == OperationType::Insert
    }

    /// Returns true if this is an update operation.
    #[inline]
    pub fn is_update(&self) -> bool {
        self.operation == OperationType::Update
    }

    /// Returns true if this is a delete operation.
    #[inline]
    pub fn is_delete(&self) -> bool {
        self.operation == OperationType::Delete
    }

    /// Returns the subject identifier (`_id`) if present.
    pub fn document_id(&self) -> Option<&bson::Bson> {
        self.document_key.as_ref()?.get("_id")
    }
}

/// Conversion from the MongoDB driver's change stream event.
///
/// Unknown operation kinds are preserved as [`OperationType::Unknown`] and
/// logged; they are never dropped.
impl TryFrom<mongodb::change_stream::event::ChangeStreamEvent<Document>> for ChangeEvent {
    type Error = ConversionError;

    fn try_from(
        event: mongodb::change_stream::event::ChangeStreamEvent<Document>,
    ) -> Result<Self, Self::Error> {
        use mongodb::change_stream::event::OperationType as MongoOpType;

        let operation = match event.operation_type {
            MongoOpType::Insert => OperationType::Insert,
            MongoOpType::Update => OperationType::Update,
            MongoOpType::Replace => OperationType::Replace,
            MongoOpType::Delete => OperationType::Delete,
            other => {
                let op = format!("{other:?}").to_lowercase();
                warn!(operation = %op, "unknown change stream operation type");
                OperationType::Unknown(op)
            }
        };

        let namespace = event
            .ns
            .map(|ns| Namespace {
                database: ns.db,
                collection: ns.coll.unwrap_or_default(),
            })
            .unwrap_or_else(|| Namespace::new("", ""));

        let update_description = event.update_description.map(|ud| UpdateDescription {
            updated_fields: ud.updated_fields,
            removed_fields: ud.removed_fields,
        });

        let resume_token = bson::to_document(&event.id)
            .map_err(|e| ConversionError::ResumeToken(e.to_string()))?;

        Ok(Self {
            operation,
            namespace,
            document_key: event.document_key,
            full_document: event.full_document,
            update_description,
            resume_token,
        })
    }
}
