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

//! Broker connection supervision.
//!
//! The [`HealthMonitor`] is the only component that closes and replaces the
//! shared broker connection. It probes at a fixed interval; a probe that
//! finds the connection closed or unusable triggers the full recovery
//! sequence:
//!
//! 1. close whatever remains of the old connection,
//! 2. reconnect, retrying at the probe interval until it succeeds,
//! 3. re-declare the topology from a clean slate,
//! 4. signal watchers to re-subscribe from their checkpoints,
//! 5. replay stored failures in the background.
//!
//! Publishes issued during the recovery window fail fast and are routed to
//! the failure store; step 5 drains them once the broker is back.

use crate::broker::{Broker, TopologyManager};
use crate::failure::FailureStore;
use crate::metrics;
use crate::publish::{replay_failed, Publisher};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Periodically probes the broker connection and runs the recovery
/// sequence when a probe fails.
pub struct HealthMonitor {
    broker: Arc<dyn Broker>,
    topology: Arc<TopologyManager>,
    publisher: Publisher,
    failures: Arc<dyn FailureStore>,
    resubscribe: broadcast::Sender<()>,
    interval: Duration,
}

impl HealthMonitor {
    /// Creates a monitor probing at `interval`.
    #[must_use]
    pub fn new(
        broker: Arc<dyn Broker>,
        topology: Arc<TopologyManager>,
        publisher: Publisher,
        failures: Arc<dyn FailureStore>,
        resubscribe: broadcast::Sender<()>,
        interval: Duration,
    ) -> Self {
        Self {
            broker,
            topology,
            publisher,
            failures,
            resubscribe,
            interval,
        }
    }

    /// Spawns the probe loop on the current runtime.
    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }

    async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(interval = ?self.interval, "broker health monitor started");

        loop {
            tokio::select! {
                () = tokio::time::sleep(self.interval) => {}
                _ = shutdown.changed() => {}
            }
            if *shutdown.borrow() {
                break;
            }

            if self.broker.is_ready() && !self.broker.is_closed() {
                debug!("broker health probe ok");
                continue;
            }

            warn!("broker connection unhealthy, starting recovery");
            if !self.recover(&mut shutdown).await {
                break;
            }
        }

        info!("broker health monitor stopped");
    }

    /// Runs the recovery sequence. Returns false if shutdown was requested
    /// while reconnecting.
    async fn recover(&self, shutdown: &mut watch::Receiver<bool>) -> bool {
        self.broker.close().await;

        loop {
            if *shutdown.borrow() {
                return false;
            }

            match self.broker.connect().await {
                Ok(()) => {
                    // New connection, clean slate: the full layout must be
                    // declared again.
                    self.topology.reset();
                    match self.topology.ensure(self.broker.as_ref()).await {
                        Ok(()) => break,
                        Err(e) => {
                            error!(error = %e, "topology re-declaration failed, reconnecting");
                            self.broker.close().await;
                        }
                    }
                }
                Err(e) => {
                    warn!(error = %e, "broker reconnect failed, retrying");
                }
            }

            tokio::select! {
                () = tokio::time::sleep(self.interval) => {}
                _ = shutdown.changed() => {}
            }
        }

        metrics::record_broker_reconnect();
        info!("broker connection recovered");

        // Watchers resume from their checkpoints on the new connection. An
        // error here means no watcher is running yet, which is fine.
        let _ = self.resubscribe.send(());

        let failures = Arc::clone(&self.failures);
        let publisher = self.publisher.clone();
        tokio::spawn(async move {
            replay_failed(failures, publisher).await;
        });

        true
    }
}
