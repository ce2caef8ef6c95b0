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

//! Relay configuration and lifecycle.
//!
//! [`RelayConfig`] describes one relay: the database deployment to watch,
//! the broker to publish to, the destination layout, and tuning options.
//! [`Relay::start`] connects both sides, declares the topology, drains the
//! failure store, and spawns the watcher and the health monitor; it returns
//! once the relay is running.
//!
//! ```no_run
//! use staffetta_core::broker::{Destination, ExchangeType};
//! use staffetta_core::checkpoint::CheckpointStore;
//! use staffetta_core::failure::FailureStore;
//! use staffetta_core::relay::{Relay, RelayConfig};
//! use staffetta_core::watcher::WatchTarget;
//! use std::sync::Arc;
//!
//! # async fn run(
//! #     checkpoints: Arc<dyn CheckpointStore>,
//! #     failures: Arc<dyn FailureStore>,
//! # ) -> Result<(), Box<dyn std::error::Error>> {
//! let config = RelayConfig::new("mongodb://localhost:27017", "amqp://localhost:5672")
//!     .watch(WatchTarget::Database("shop".into()))
//!     .destination(Destination::exchange("orders", ExchangeType::Fanout).with_queue("audit"));
//!
//! let relay = Relay::start(config, checkpoints, failures).await?;
//! relay.shutdown().await;
//! # Ok(())
//! # }
//! ```

use crate::broker::{AmqpBroker, Broker, BrokerError, Destination, TopologyManager};
use crate::checkpoint::CheckpointStore;
use crate::failure::FailureStore;
use crate::metrics;
use crate::publish::{replay_failed, PublishOutcome, Publisher};
use crate::watcher::{WatchTarget, Watcher, WatcherState};
use bson::doc;
use mongodb::Client;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Database name reserved for the relay's own bookkeeping (checkpoints and
/// failure records). Excluded from the change feed.
pub const DEFAULT_EVENTS_DATABASE: &str = "staffetta_events";

/// Tuning options for a relay.
#[derive(Debug, Clone)]
pub struct RelayOptions {
    /// Log each relayed event at debug instead of info level
    pub silent: bool,

    /// Reshape raw feed events into the outbound message format.
    /// When disabled, publish failures withhold the checkpoint instead of
    /// writing failure records, and middleware is unavailable.
    pub normalize: bool,

    /// Interval between broker health probes, and the retry interval for
    /// reconnect attempts
    pub health_check_interval: Duration,

    /// Upper bound on a single publish attempt
    pub send_timeout: Duration,

    /// Initial broker connection attempts before startup fails; zero means
    /// retry forever
    pub max_connect_attempts: u32,
}

impl Default for RelayOptions {
    fn default() -> Self {
        Self {
            silent: true,
            normalize: true,
            health_check_interval: Duration::from_secs(30),
            send_timeout: Duration::from_secs(30),
            max_connect_attempts: 0,
        }
    }
}

/// Configuration for one relay instance.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    mongo_uri: String,
    amqp_uri: String,
    events_database: String,
    watch_id: String,
    target: WatchTarget,
    destinations: Vec<Destination>,
    options: RelayOptions,
}

impl RelayConfig {
    /// Creates a configuration watching the whole deployment with default
    /// options and no destinations.
    #[must_use]
    pub fn new(mongo_uri: impl Into<String>, amqp_uri: impl Into<String>) -> Self {
        Self {
            mongo_uri: mongo_uri.into(),
            amqp_uri: amqp_uri.into(),
            events_database: DEFAULT_EVENTS_DATABASE.to_string(),
            watch_id: "default".to_string(),
            target: WatchTarget::Deployment,
            destinations: Vec::new(),
            options: RelayOptions::default(),
        }
    }

    /// Sets the change feed scope.
    #[must_use]
    pub fn watch(mut self, target: WatchTarget) -> Self {
        self.target = target;
        self
    }

    /// Sets the identifier the checkpoint is stored under. Two relays with
    /// the same id share (and fight over) one checkpoint.
    #[must_use]
    pub fn watch_id(mut self, id: impl Into<String>) -> Self {
        self.watch_id = id.into();
        self
    }

    /// Sets the bookkeeping database name.
    #[must_use]
    pub fn events_database(mut self, name: impl Into<String>) -> Self {
        self.events_database = name.into();
        self
    }

    /// Adds a publication destination.
    #[must_use]
    pub fn destination(mut self, destination: Destination) -> Self {
        self.destinations.push(destination);
        self
    }

    /// Replaces the tuning options.
    #[must_use]
    pub fn options(mut self, options: RelayOptions) -> Self {
        self.options = options;
        self
    }

    /// The configured events database name.
    #[must_use]
    pub fn events_database_name(&self) -> &str {
        &self.events_database
    }

    /// The configured MongoDB URI.
    #[must_use]
    pub fn mongo_uri_str(&self) -> &str {
        &self.mongo_uri
    }

    fn validate(&mut self) -> Result<(), RelayError> {
        if self.destinations.is_empty() {
            return Err(RelayError::Config(
                "at least one destination is required".into(),
            ));
        }

        // Middleware operates on normalized messages only.
        if !self.options.normalize {
            for destination in &mut self.destinations {
                if destination.middleware.take().is_some() {
                    error!(
                        destination = destination.spec.name(),
                        "middleware requires normalization and was removed from this destination"
                    );
                }
            }
        }

        Ok(())
    }
}

/// Errors from relay startup and health checks.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    /// The configuration is unusable
    #[error("configuration error: {0}")]
    Config(String),

    /// The database deployment is unreachable or unhealthy
    #[error(transparent)]
    Mongo(#[from] mongodb::error::Error),

    /// The broker is unreachable after the configured attempts
    #[error(transparent)]
    Broker(#[from] BrokerError),
}

/// A running relay.
///
/// Dropping the handle does not stop the relay; call [`Relay::shutdown`].
pub struct Relay {
    client: Client,
    broker: Arc<dyn Broker>,
    publisher: Publisher,
    shutdown: watch::Sender<bool>,
    watcher_state: watch::Receiver<WatcherState>,
    watcher_handle: JoinHandle<()>,
    monitor_handle: JoinHandle<()>,
}

impl Relay {
    /// Starts a relay over a fresh AMQP connection.
    ///
    /// Connects both sides, declares the broker topology, replays stored
    /// failures, and spawns the watcher and the health monitor. Returns
    /// once all of that is running.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid, the deployment is
    /// unreachable, or the broker stays unreachable past the configured
    /// connection attempts.
    pub async fn start(
        config: RelayConfig,
        checkpoints: Arc<dyn CheckpointStore>,
        failures: Arc<dyn FailureStore>,
    ) -> Result<Self, RelayError> {
        let broker: Arc<dyn Broker> = Arc::new(AmqpBroker::new(&config.amqp_uri));
        Self::start_with_broker(config, broker, checkpoints, failures).await
    }

    /// Starts a relay over a caller-supplied broker client.
    ///
    /// # Errors
    ///
    /// Same conditions as [`Relay::start`].
    pub async fn start_with_broker(
        mut config: RelayConfig,
        broker: Arc<dyn Broker>,
        checkpoints: Arc<dyn CheckpointStore>,
        failures: Arc<dyn FailureStore>,
    ) -> Result<Self, RelayError> {
        config.validate()?;
        metrics::describe_metrics();

        info!(
            watch_id = %config.watch_id,
            target = ?config.target,
            destinations = config.destinations.len(),
            "starting relay"
        );

        let client = Client::with_uri_str(&config.mongo_uri).await?;

        connect_with_retry(
            broker.as_ref(),
            config.options.max_connect_attempts,
            config.options.health_check_interval,
        )
        .await?;

        let topology = Arc::new(TopologyManager::new(config.destinations.clone()));
        topology.ensure(broker.as_ref()).await?;

        let publisher = Publisher::new(
            Arc::clone(&broker),
            Arc::clone(&failures),
            config.options.send_timeout,
        );

        // Drain anything left over from a previous run, off the startup path.
        {
            let failures = Arc::clone(&failures);
            let publisher = publisher.clone();
            tokio::spawn(async move {
                replay_failed(failures, publisher).await;
            });
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (resubscribe_tx, resubscribe_rx) = broadcast::channel(8);

        let monitor = crate::health::HealthMonitor::new(
            Arc::clone(&broker),
            Arc::clone(&topology),
            publisher.clone(),
            Arc::clone(&failures),
            resubscribe_tx,
            config.options.health_check_interval,
        );
        let monitor_handle = monitor.spawn(shutdown_rx.clone());

        let watcher = Watcher::new(
            config.watch_id.clone(),
            config.target.clone(),
            config.events_database.clone(),
            client.clone(),
            checkpoints,
            publisher.clone(),
            Arc::new(config.destinations.clone()),
            config.options.clone(),
        );
        let watcher_state = watcher.state();
        let watcher_handle = tokio::spawn(watcher.run(resubscribe_rx, shutdown_rx));

        info!(watch_id = %config.watch_id, "relay started");

        Ok(Self {
            client,
            broker,
            publisher,
            shutdown: shutdown_tx,
            watcher_state,
            watcher_handle,
            monitor_handle,
        })
    }

    /// Pings the database deployment.
    ///
    /// # Errors
    ///
    /// Returns an error if the deployment does not answer the ping.
    pub async fn store_health(&self) -> Result<(), RelayError> {
        self.client
            .database("admin")
            .run_command(doc! { "ping": 1 })
            .await?;
        Ok(())
    }

    /// Returns true if the broker connection is established and usable.
    #[must_use]
    pub fn broker_health(&self) -> bool {
        self.broker.is_ready() && !self.broker.is_closed()
    }

    /// The watcher's current lifecycle state.
    #[must_use]
    pub fn watcher_state(&self) -> WatcherState {
        *self.watcher_state.borrow()
    }

    /// Publishes an arbitrary payload to a destination outside the change
    /// feed, with the same timeout and failure routing as relayed events.
    pub async fn send(&self, destination: &str, payload: &Value) -> PublishOutcome {
        self.publisher.publish(destination, payload).await
    }

    /// Stops the watcher and the health monitor, then closes the broker
    /// connection. The checkpoint keeps its last value; a later start
    /// resumes from it.
    pub async fn shutdown(self) {
        info!("relay shutting down");
        let _ = self.shutdown.send(true);

        if self.watcher_handle.await.is_err() {
            warn!("watcher task ended abnormally");
        }
        if self.monitor_handle.await.is_err() {
            warn!("health monitor task ended abnormally");
        }

        self.broker.close().await;
        info!("relay stopped");
    }
}

/// Connects the broker, retrying at a fixed interval.
///
/// `max_attempts` of zero retries forever.
async fn connect_with_retry(
    broker: &dyn Broker,
    max_attempts: u32,
    retry_interval: Duration,
) -> Result<(), BrokerError> {
    let mut attempt: u32 = 0;
    loop {
        attempt += 1;
        match broker.connect().await {
            Ok(()) => return Ok(()),
            Err(e) => {
                if max_attempts > 0 && attempt >= max_attempts {
                    error!(attempts = attempt, error = %e, "broker unreachable, giving up");
                    return Err(e);
                }
                warn!(attempt, error = %e, "broker connection failed, retrying");
                tokio::time::sleep(retry_interval).await;
            }
        }
    }
}
