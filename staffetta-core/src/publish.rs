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

//! Broker publication with bounded timeouts and failure routing.
//!
//! Every publish races the broker send against a timer; the caller never
//! blocks indefinitely. A timeout counts as a failure even if the
//! underlying send completes later.
//!
//! Two failure contracts exist:
//!
//! - [`Publisher::publish`] (the default, used by the normalized relay path
//!   and manual sends): a failure writes exactly one
//!   [`FailedMessageRecord`](crate::failure::FailedMessageRecord) to the
//!   failure store and never propagates into the caller's control flow.
//! - [`Publisher::publish_strict`] (the raw relay path only): a failure is
//!   returned to the caller so checkpoint advancement for that event is
//!   blocked and the event is naturally re-delivered on restart. No failure
//!   record is written; re-delivery is the recovery mechanism.
//!
//! [`replay_failed`] republishes stored failures oldest-first, removing each
//! record only after its republish succeeded.

use crate::broker::{Broker, BrokerError};
use crate::failure::{FailedMessageRecord, FailureStore};
use crate::metrics;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Errors from a single publish attempt.
#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    /// The send did not complete within the configured timeout
    #[error("publish timed out after {0:?}")]
    Timeout(Duration),

    /// The broker client rejected the send or is not connected
    #[error(transparent)]
    Broker(#[from] BrokerError),

    /// The payload could not be serialized
    #[error("payload serialization failed: {0}")]
    Serialization(String),
}

/// Result of a failure-routed publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    /// The broker accepted the message
    Delivered,

    /// The attempt failed and the payload was recorded for replay
    RoutedToFailureStore,
}

/// Publishes messages to named destinations over the shared broker
/// connection.
#[derive(Clone)]
pub struct Publisher {
    broker: Arc<dyn Broker>,
    failures: Arc<dyn FailureStore>,
    send_timeout: Duration,
}

impl Publisher {
    /// Creates a publisher with the given send timeout.
    #[must_use]
    pub fn new(
        broker: Arc<dyn Broker>,
        failures: Arc<dyn FailureStore>,
        send_timeout: Duration,
    ) -> Self {
        Self {
            broker,
            failures,
            send_timeout,
        }
    }

    /// Publishes a payload, routing failures to the failure store.
    ///
    /// Messages are marked durable. The error never reaches the caller;
    /// a failed attempt leaves exactly one record behind.
    pub async fn publish(&self, destination: &str, payload: &Value) -> PublishOutcome {
        match self.try_send(destination, payload).await {
            Ok(()) => {
                debug!(destination, "message published");
                PublishOutcome::Delivered
            }
            Err(e) => {
                error!(destination, error = %e, "publish failed, routing to failure store");
                metrics::record_publish_failure(destination);

                let record = FailedMessageRecord::new(destination, payload.clone(), e.to_string());
                if let Err(store_err) = self.failures.record(&record).await {
                    // The message is now only in memory; log loudly.
                    error!(
                        destination,
                        error = %store_err,
                        "failed to persist failure record, message may be lost"
                    );
                }
                PublishOutcome::RoutedToFailureStore
            }
        }
    }

    /// Publishes a payload, propagating failures to the caller.
    ///
    /// Used by the raw relay path, where a failure must block checkpoint
    /// advancement: the event is re-delivered on restart instead of being
    /// recorded for replay.
    ///
    /// # Errors
    ///
    /// Returns the publish error on timeout or broker rejection.
    pub async fn publish_strict(&self, destination: &str, payload: &Value) -> Result<(), PublishError> {
        self.try_send(destination, payload).await?;
        debug!(destination, "message published");
        Ok(())
    }

    /// One time-bounded send attempt.
    async fn try_send(&self, destination: &str, payload: &Value) -> Result<(), PublishError> {
        let body =
            serde_json::to_vec(payload).map_err(|e| PublishError::Serialization(e.to_string()))?;

        match tokio::time::timeout(self.send_timeout, self.broker.send(destination, &body, true))
            .await
        {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(PublishError::Broker(e)),
            Err(_) => Err(PublishError::Timeout(self.send_timeout)),
        }
    }
}

/// Republishes every stored failure to its original destination.
///
/// Records are replayed oldest-first so original failure order is
/// preserved within one pass. A record is removed only after its republish
/// succeeded; one that fails again stays in the store for the next pass.
/// Runs at startup (after broker connection and topology are ready) and
/// after every broker recovery.
pub async fn replay_failed(failures: Arc<dyn FailureStore>, publisher: Publisher) {
    let records = match failures.list_oldest_first().await {
        Ok(records) => records,
        Err(e) => {
            error!(error = %e, "could not read failure store for replay");
            return;
        }
    };

    if records.is_empty() {
        debug!("no failed messages to replay");
        return;
    }

    info!(count = records.len(), "replaying failed messages");

    for record in records {
        match publisher
            .publish_strict(&record.destination, &record.payload)
            .await
        {
            Ok(()) => {
                metrics::record_replayed(&record.destination);
                if let Err(e) = failures.remove(&record.id).await {
                    warn!(id = %record.id, error = %e, "replayed message could not be removed from failure store");
                }
            }
            Err(e) => {
                // Retained for the next replay pass.
                warn!(
                    id = %record.id,
                    destination = %record.destination,
                    error = %e,
                    "replay attempt failed, record retained"
                );
            }
        }
    }
}
