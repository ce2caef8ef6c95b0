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

//! Change feed consumption and per-event relay.
//!
//! The [`Watcher`] owns one change stream subscription. On start it loads
//! the checkpoint for its watch identifier and resumes the feed strictly
//! after that token; with no checkpoint it starts at the feed's current
//! position (no historical backfill). The events database (where
//! checkpoints and failure records live) is excluded from the feed, so the
//! relay never observes its own bookkeeping writes.
//!
//! Events are processed strictly in feed-delivery order: one event is fully
//! handled (formatted and published to every destination) before the next
//! is pulled. Publishes to different destinations for the same event run
//! concurrently, and one destination's failure never blocks the others.
//! The checkpoint advances only after every destination has been attempted;
//! the write itself is best-effort.
//!
//! Lifecycle: `Idle -> Subscribing -> Streaming -> (Error -> Subscribing) |
//! Stopped`. Feed-level errors re-enter the subscribe sequence from the
//! last checkpoint; `Stopped` is reached only on explicit shutdown.

use crate::broker::Destination;
use crate::checkpoint::{Checkpoint, CheckpointStore};
use crate::event::ChangeEvent;
use crate::message::{apply_middleware, format_event, MiddlewareOutput};
use crate::metrics;
use crate::publish::Publisher;
use crate::relay::RelayOptions;
use bson::{doc, Document};
use futures::future::join_all;
use futures::StreamExt;
use mongodb::change_stream::event::{ChangeStreamEvent, ResumeToken};
use mongodb::change_stream::ChangeStream;
use mongodb::options::{ChangeStreamOptions, FullDocumentType};
use mongodb::Client;
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tracing::{debug, error, info, warn};

/// Scope of the change feed subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchTarget {
    /// Watch every database in the deployment
    Deployment,

    /// Watch all collections in one database
    Database(String),

    /// Watch a single collection
    Collection {
        /// Database name
        database: String,
        /// Collection name
        collection: String,
    },
}

/// Watcher lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatcherState {
    /// Created, not yet started
    Idle,
    /// Establishing the change stream
    Subscribing,
    /// Consuming events
    Streaming,
    /// Shut down explicitly; never entered on transient errors
    Stopped,
}

/// Errors raised while establishing a subscription.
#[derive(Debug, thiserror::Error)]
pub enum WatcherError {
    /// The change stream could not be opened
    #[error("change stream error: {0}")]
    ChangeStream(String),
}

/// Consumes one change feed and relays every event to the configured
/// destinations.
pub struct Watcher {
    watch_id: String,
    target: WatchTarget,
    events_database: String,
    client: Client,
    checkpoints: Arc<dyn CheckpointStore>,
    publisher: Publisher,
    destinations: Arc<Vec<Destination>>,
    options: RelayOptions,
    state: watch::Sender<WatcherState>,
}

impl Watcher {
    /// Creates a watcher in the `Idle` state.
    #[allow(clippy::too_many_arguments)]
    #[must_use]
    pub fn new(
        watch_id: impl Into<String>,
        target: WatchTarget,
        events_database: impl Into<String>,
        client: Client,
        checkpoints: Arc<dyn CheckpointStore>,
        publisher: Publisher,
        destinations: Arc<Vec<Destination>>,
        options: RelayOptions,
    ) -> Self {
        Self {
            watch_id: watch_id.into(),
            target,
            events_database: events_database.into(),
            client,
            checkpoints,
            publisher,
            destinations,
            options,
            state: watch::channel(WatcherState::Idle).0,
        }
    }

    /// Subscribes to lifecycle state transitions.
    ///
    /// Call before handing the watcher to [`Watcher::run`]; the receiver
    /// stays live for the watcher's whole lifetime.
    #[must_use]
    pub fn state(&self) -> watch::Receiver<WatcherState> {
        self.state.subscribe()
    }

    fn set_state(&self, state: WatcherState) {
        self.state.send_replace(state);
    }

    /// Runs until shutdown, re-subscribing on feed errors and on recovery
    /// signals from the health monitor.
    ///
    /// No error escapes this loop; every failure is logged and converted to
    /// a re-subscription after a fixed interval.
    pub async fn run(
        self,
        mut resubscribe: broadcast::Receiver<()>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            if *shutdown.borrow() {
                break;
            }

            self.set_state(WatcherState::Subscribing);
            info!(watch_id = %self.watch_id, target = ?self.target, "subscribing to change feed");

            let mut stream = match self.subscribe().await {
                Ok(stream) => stream,
                Err(e) => {
                    error!(watch_id = %self.watch_id, error = %e, "change feed subscription failed, retrying");
                    tokio::select! {
                        () = tokio::time::sleep(self.options.health_check_interval) => {}
                        _ = shutdown.changed() => {}
                    }
                    continue;
                }
            };

            self.set_state(WatcherState::Streaming);
            info!(watch_id = %self.watch_id, "change feed streaming");

            loop {
                tokio::select! {
                    _ = shutdown.changed() => {
                        self.set_state(WatcherState::Stopped);
                        info!(watch_id = %self.watch_id, "watcher stopped");
                        return;
                    }

                    signal = resubscribe.recv() => {
                        match signal {
                            Ok(()) | Err(broadcast::error::RecvError::Lagged(_)) => {
                                info!(watch_id = %self.watch_id, "re-subscribe requested by recovery path");
                                metrics::record_feed_resubscribe(&self.watch_id);
                                break;
                            }
                            Err(broadcast::error::RecvError::Closed) => {
                                self.set_state(WatcherState::Stopped);
                                info!(watch_id = %self.watch_id, "relay gone, watcher stopped");
                                return;
                            }
                        }
                    }

                    next = stream.next() => {
                        match next {
                            Some(Ok(raw)) => self.handle_event(raw).await,
                            Some(Err(e)) => {
                                error!(watch_id = %self.watch_id, error = %e, "change feed error, re-subscribing from last checkpoint");
                                metrics::record_feed_resubscribe(&self.watch_id);
                                break;
                            }
                            None => {
                                warn!(watch_id = %self.watch_id, "change feed ended, re-subscribing");
                                metrics::record_feed_resubscribe(&self.watch_id);
                                break;
                            }
                        }
                    }
                }
            }
        }

        self.set_state(WatcherState::Stopped);
        info!(watch_id = %self.watch_id, "watcher stopped");
    }

    /// Formats, publishes, and checkpoints a single feed event.
    async fn handle_event(&self, raw: ChangeStreamEvent<Document>) {
        let token = match bson::to_document(&raw.id) {
            Ok(token) => token,
            Err(e) => {
                error!(watch_id = %self.watch_id, error = %e, "resume token conversion failed, skipping event");
                return;
            }
        };

        let event = match ChangeEvent::try_from(raw) {
            Ok(event) => event,
            Err(e) => {
                error!(watch_id = %self.watch_id, error = %e, "event conversion failed, skipping event");
                return;
            }
        };

        if self.options.silent {
            debug!(watch_id = %self.watch_id, operation = %event.operation, namespace = %event.namespace.full_name(), "change event received");
        } else {
            info!(watch_id = %self.watch_id, operation = %event.operation, namespace = %event.namespace.full_name(), "change event received");
        }

        let advance =
            relay_event(&event, &self.destinations, &self.publisher, &self.options).await;

        if advance {
            let checkpoint = Checkpoint::new(&self.watch_id, token);
            if let Err(e) = self.checkpoints.save(&checkpoint).await {
                // Best-effort: re-delivery on restart is acceptable.
                error!(watch_id = %self.watch_id, error = %e, "checkpoint write failed, feed continues");
            }
        }
    }

    /// Opens the change stream, resuming strictly after the stored
    /// checkpoint when one exists.
    async fn subscribe(&self) -> Result<ChangeStream<ChangeStreamEvent<Document>>, WatcherError> {
        let checkpoint = match self.checkpoints.load(&self.watch_id).await {
            Ok(checkpoint) => checkpoint,
            Err(e) => {
                warn!(watch_id = %self.watch_id, error = %e, "checkpoint load failed, starting from current position");
                None
            }
        };

        let mut options = ChangeStreamOptions::default();
        options.full_document = Some(FullDocumentType::UpdateLookup);

        if let Some(ref checkpoint) = checkpoint {
            if let Some(token) = decode_resume_token(&checkpoint.resume_token) {
                info!(watch_id = %self.watch_id, "resuming change feed after stored checkpoint");
                options.start_after = Some(token);
            } else {
                warn!(watch_id = %self.watch_id, "stored resume token undecodable, starting from current position");
            }
        }

        // The relay's own checkpoint and failure writes must never be
        // observed by the feed.
        let pipeline = vec![doc! { "$match": { "ns.db": { "$ne": &self.events_database } } }];

        let stream = match &self.target {
            WatchTarget::Deployment => {
                self.client
                    .watch()
                    .pipeline(pipeline)
                    .with_options(options)
                    .await
            }
            WatchTarget::Database(database) => {
                self.client
                    .database(database)
                    .watch()
                    .pipeline(pipeline)
                    .with_options(options)
                    .await
            }
            WatchTarget::Collection {
                database,
                collection,
            } => {
                self.client
                    .database(database)
                    .collection::<Document>(collection)
                    .watch()
                    .pipeline(pipeline)
                    .with_options(options)
                    .await
            }
        }
        .map_err(|e| WatcherError::ChangeStream(e.to_string()))?;

        Ok(stream)
    }
}

/// Relays one event to every destination and reports whether the
/// checkpoint may advance.
///
/// Normalized mode: the event is formatted once, each destination's
/// middleware is applied, and all destination publishes run concurrently
/// through the failure-routed path. The checkpoint always advances; failed
/// publishes are recorded for replay.
///
/// Raw mode: the event passes through unformatted via the strict path, and
/// any publish failure withholds the checkpoint so the event is
/// re-delivered on restart.
pub async fn relay_event(
    event: &ChangeEvent,
    destinations: &[Destination],
    publisher: &Publisher,
    options: &RelayOptions,
) -> bool {
    if options.normalize {
        let message = format_event(event);

        let attempts = destinations.iter().map(|destination| {
            let message = message.clone();
            async move {
                let output = apply_middleware(
                    message,
                    &event.namespace.collection,
                    destination.middleware.as_ref(),
                );
                match output {
                    MiddlewareOutput::One(msg) => {
                        publish_value(publisher, destination.name(), &msg).await;
                    }
                    MiddlewareOutput::Many(msgs) => {
                        for msg in msgs {
                            publish_value(publisher, destination.name(), &msg).await;
                        }
                    }
                    MiddlewareOutput::Skip => {
                        debug!(destination = destination.name(), "middleware skipped publication");
                    }
                }
            }
        });
        join_all(attempts).await;

        metrics::record_event_relayed(&event.operation);
        true
    } else {
        let payload = match serde_json::to_value(event) {
            Ok(payload) => payload,
            Err(e) => {
                error!(error = %e, "raw event serialization failed, skipping event");
                return true;
            }
        };

        let results = join_all(
            destinations
                .iter()
                .map(|destination| publisher.publish_strict(destination.name(), &payload)),
        )
        .await;

        let all_delivered = results.iter().all(Result::is_ok);
        if all_delivered {
            metrics::record_event_relayed(&event.operation);
        } else {
            error!(
                namespace = %event.namespace.full_name(),
                "raw publish failed, checkpoint withheld for re-delivery"
            );
        }
        all_delivered
    }
}

async fn publish_value(
    publisher: &Publisher,
    destination: &str,
    message: &crate::message::OutboundMessage,
) {
    match serde_json::to_value(message) {
        Ok(payload) => {
            publisher.publish(destination, &payload).await;
        }
        Err(e) => {
            error!(destination, error = %e, "outbound message serialization failed");
        }
    }
}

/// Decodes a persisted resume token document into the driver's token type.
fn decode_resume_token(token: &Document) -> Option<ResumeToken> {
    let bytes = bson::to_vec(token).ok()?;
    bson::from_slice::<ResumeToken>(&bytes).ok()
}
