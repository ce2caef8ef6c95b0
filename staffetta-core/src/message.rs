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

//! Event-to-message normalization.
//!
//! [`format_event`] turns a raw [`ChangeEvent`] into the relay's canonical
//! [`OutboundMessage`] shape. The transformation is pure and total: it never
//! fails, and unknown operation kinds map to the `"unknown"` sentinel rather
//! than being dropped.
//!
//! A destination may carry a [`Middleware`] post-processing step, applied
//! after normalization. Middleware can rewrite a message, fan one message
//! out into several, or suppress publication entirely. Because middleware
//! operates on the normalized shape, it is only valid when normalization is
//! enabled; the relay rejects the combination at configuration time.
//!
//! # Example
//!
//! ```rust
//! use staffetta_core::event::{ChangeEvent, Namespace, OperationType};
//! use staffetta_core::message::format_event;
//! use bson::doc;
//!
//! let event = ChangeEvent {
//!     operation: OperationType::Insert,
//!     namespace: Namespace::new("shop", "orders"),
//!     document_key: Some(doc! { "_id": "A" }),
//!     full_document: Some(doc! { "_id": "A", "x": 1 }),
//!     update_description: None,
//!     resume_token: doc! { "_data": "T1" },
//! };
//!
//! let msg = format_event(&event);
//! assert_eq!(msg.operation, OperationType::Insert);
//! assert_eq!(msg.id, "A");
//! assert!(msg.full_document.is_some());
//! assert!(msg.update_description.updated_fields.is_empty());
//! ```

use crate::event::{ChangeEvent, OperationType, UpdateDescription};
use bson::Document;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::warn;

/// Normalized payload derived from a [`ChangeEvent`].
///
/// This is the shape consumers see on the broker when normalization is
/// enabled. Owned transiently by the publisher for one publish attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundMessage {
    /// Kind of operation, `"unknown"` for unrecognized kinds
    pub operation: OperationType,

    /// Subject identifier, `"null"` when the event carried no document key
    pub id: String,

    /// Database where the change occurred
    pub db: String,

    /// Collection where the change occurred
    pub coll: String,

    /// Full resulting document, empty for operations without one
    #[serde(rename = "fullDocument")]
    pub full_document: Option<Document>,

    /// Field-level update description, empty for non-update operations
    #[serde(rename = "updateDescription")]
    pub update_description: UpdateDescription,
}

/// Result of a middleware invocation.
///
/// `Many` fans out to one publish per element; `Skip` publishes nothing
/// for that destination.
#[derive(Debug, Clone)]
pub enum MiddlewareOutput {
    /// Publish this single message
    One(OutboundMessage),

    /// Publish each message independently
    Many(Vec<OutboundMessage>),

    /// Publish nothing for this destination
    Skip,
}

/// Pure post-processing step applied per destination after normalization.
///
/// Receives the normalized message and the source collection name.
pub type Middleware =
    Arc<dyn Fn(OutboundMessage, &str) -> MiddlewareOutput + Send + Sync + 'static>;

/// Normalizes a change event into an [`OutboundMessage`].
///
/// Population rules by operation kind:
///
/// | operation | full document | update description |
/// |-----------|---------------|--------------------|
/// | insert    | yes           | empty              |
/// | replace   | yes           | empty              |
/// | update    | yes           | as supplied        |
/// | delete    | no            | empty              |
/// | unknown   | no            | empty (logged)     |
#[must_use]
pub fn format_event(event: &ChangeEvent) -> OutboundMessage {
    let id = event
        .document_id()
        .map(bson_id_to_string)
        .unwrap_or_else(|| "null".to_string());

    let mut message = OutboundMessage {
        operation: event.operation.clone(),
        id,
        db: event.namespace.database.clone(),
        coll: event.namespace.collection.clone(),
        full_document: None,
        update_description: UpdateDescription::empty(),
    };

    match &event.operation {
        OperationType::Insert | OperationType::Replace => {
            message.full_document = event.full_document.clone();
        }
        OperationType::Update => {
            message.full_document = event.full_document.clone();
            if let Some(ud) = &event.update_description {
                message.update_description = ud.clone();
            }
        }
        OperationType::Delete => {}
        OperationType::Unknown(op) => {
            warn!(operation = %op, namespace = %event.namespace.full_name(), "formatting event with unknown operation kind");
        }
    }

    message
}

/// Applies a destination's middleware to a normalized message.
///
/// With no middleware configured the message passes through unchanged.
#[must_use]
pub fn apply_middleware(
    message: OutboundMessage,
    collection: &str,
    middleware: Option<&Middleware>,
) -> MiddlewareOutput {
    match middleware {
        Some(mw) => mw(message, collection),
        None => MiddlewareOutput::One(message),
    }
}

/// Renders a BSON `_id` as a plain string, matching how consumers key
/// deduplication on the subject identifier.
fn bson_id_to_string(id: &bson::Bson) -> String {
    match id {
        bson::Bson::String(s) => s.clone(),
        bson::Bson::ObjectId(oid) => oid.to_hex(),
        other => other.to_string(),
    }
}
