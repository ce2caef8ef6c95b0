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

//! Broker connection, destinations, and topology management.
//!
//! The [`Broker`] trait is the seam between the relay and the AMQP client:
//! everything above it (publisher, health monitor, replay) is broker-agnostic
//! and testable against an in-memory fake. [`AmqpBroker`] is the production
//! implementation over `lapin`, holding one shared connection and channel.
//!
//! The broker connection is a single shared resource. Any component may send
//! or declare on it, but only the health monitor closes and replaces it;
//! publishes issued during a reconnection window fail fast and are routed to
//! the failure store by the publisher.
//!
//! [`TopologyManager`] declares the exchange/queue/binding layout a
//! destination set requires. It remembers what it has already declared on
//! the current connection and declares only the missing subset, so calling
//! [`TopologyManager::ensure`] repeatedly (after every reconnection) is
//! cheap and idempotent.

use crate::message::Middleware;
use lapin::{
    options::{ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions},
    types::FieldTable,
    BasicProperties, Channel, Connection, ConnectionProperties,
};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Errors from broker operations.
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    /// No live connection; the caller should expect a reconnect soon
    #[error("broker not connected")]
    NotConnected,

    /// Connection establishment failed
    #[error("connection error: {0}")]
    Connection(String),

    /// The broker rejected a publish
    #[error("publish rejected: {0}")]
    Rejected(String),

    /// Topology declaration failed
    #[error("topology declaration failed: {0}")]
    Topology(String),
}

/// Exchange types supported for destinations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExchangeType {
    /// Deliver to every bound queue
    Fanout,
    /// Deliver to queues bound with a matching routing key
    Direct,
    /// Deliver to queues bound with a matching routing pattern
    Topic,
}

impl ExchangeType {
    fn to_lapin(self) -> lapin::ExchangeKind {
        match self {
            ExchangeType::Fanout => lapin::ExchangeKind::Fanout,
            ExchangeType::Direct => lapin::ExchangeKind::Direct,
            ExchangeType::Topic => lapin::ExchangeKind::Topic,
        }
    }
}

impl fmt::Display for ExchangeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExchangeType::Fanout => write!(f, "fanout"),
            ExchangeType::Direct => write!(f, "direct"),
            ExchangeType::Topic => write!(f, "topic"),
        }
    }
}

/// Broker-side target of a destination: a typed exchange with bound queues,
/// or a bare durable queue.
#[derive(Debug, Clone, PartialEq)]
pub enum DestinationSpec {
    /// A named exchange with queues bound to it
    Exchange {
        /// Exchange name, used as the publish target
        name: String,
        /// Exchange type
        kind: ExchangeType,
        /// Routing key used when publishing and binding
        routing_key: Option<String>,
        /// Queues bound to this exchange
        queues: Vec<String>,
    },

    /// A bare named queue, published to via the default exchange
    Queue {
        /// Queue name
        name: String,
    },
}

impl DestinationSpec {
    /// Returns the name messages are published under.
    pub fn name(&self) -> &str {
        match self {
            DestinationSpec::Exchange { name, .. } | DestinationSpec::Queue { name } => name,
        }
    }
}

/// A configured publication target, optionally carrying a middleware
/// post-processing step (valid only with normalization enabled).
#[derive(Clone)]
pub struct Destination {
    /// Broker-side layout of this destination
    pub spec: DestinationSpec,

    /// Optional post-processing applied after normalization
    pub middleware: Option<Middleware>,
}

impl Destination {
    /// A typed exchange destination with no bound queues yet.
    #[must_use]
    pub fn exchange(name: impl Into<String>, kind: ExchangeType) -> Self {
        Self {
            spec: DestinationSpec::Exchange {
                name: name.into(),
                kind,
                routing_key: None,
                queues: Vec::new(),
            },
            middleware: None,
        }
    }

    /// A bare queue destination.
    #[must_use]
    pub fn queue(name: impl Into<String>) -> Self {
        Self {
            spec: DestinationSpec::Queue { name: name.into() },
            middleware: None,
        }
    }

    /// Binds a queue to this exchange destination. No-op for bare queues.
    #[must_use]
    pub fn with_queue(mut self, queue: impl Into<String>) -> Self {
        if let DestinationSpec::Exchange { queues, .. } = &mut self.spec {
            queues.push(queue.into());
        }
        self
    }

    /// Sets the routing key for this exchange destination.
    #[must_use]
    pub fn with_routing_key(mut self, key: impl Into<String>) -> Self {
        if let DestinationSpec::Exchange { routing_key, .. } = &mut self.spec {
            *routing_key = Some(key.into());
        }
        self
    }

    /// Attaches a middleware post-processing step.
    #[must_use]
    pub fn with_middleware(mut self, middleware: Middleware) -> Self {
        self.middleware = Some(middleware);
        self
    }

    /// Returns the name messages are published under.
    pub fn name(&self) -> &str {
        self.spec.name()
    }
}

impl fmt::Debug for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Destination")
            .field("spec", &self.spec)
            .field("middleware", &self.middleware.as_ref().map(|_| "<fn>"))
            .finish()
    }
}

/// An exchange to declare.
#[derive(Debug, Clone, PartialEq)]
pub struct ExchangeDecl {
    pub name: String,
    pub kind: ExchangeType,
}

/// A queue to declare. Queues are always durable.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueDecl {
    pub name: String,
    pub durable: bool,
}

/// An exchange-to-queue binding to declare.
#[derive(Debug, Clone, PartialEq)]
pub struct BindingDecl {
    pub exchange: String,
    pub queue: String,
    pub routing_key: String,
}

/// The batched set of declarations one [`TopologyManager::ensure`] pass
/// issues against the broker.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TopologyPlan {
    pub exchanges: Vec<ExchangeDecl>,
    pub queues: Vec<QueueDecl>,
    pub bindings: Vec<BindingDecl>,
}

impl TopologyPlan {
    /// Returns true if the plan declares nothing.
    pub fn is_empty(&self) -> bool {
        self.exchanges.is_empty() && self.queues.is_empty() && self.bindings.is_empty()
    }
}

/// Abstraction over the broker client.
///
/// Implemented by [`AmqpBroker`] in production and by in-memory fakes in
/// tests.
#[async_trait::async_trait]
pub trait Broker: Send + Sync {
    /// Establishes (or re-establishes) the connection and channel.
    ///
    /// # Errors
    ///
    /// Returns an error if the broker is unreachable; callers retry at a
    /// fixed interval.
    async fn connect(&self) -> Result<(), BrokerError>;

    /// Declares the given topology in one batched pass.
    ///
    /// # Errors
    ///
    /// Returns an error if any declaration is refused or the connection is
    /// down.
    async fn declare_topology(&self, plan: &TopologyPlan) -> Result<(), BrokerError>;

    /// Publishes a payload to a named destination.
    ///
    /// `durable` marks the message persistent so it survives a broker
    /// restart.
    ///
    /// # Errors
    ///
    /// Returns an error on rejection or when not connected. Timeouts are
    /// enforced by the caller, not here.
    async fn send(&self, destination: &str, payload: &[u8], durable: bool)
        -> Result<(), BrokerError>;

    /// Returns true if the underlying connection reports itself closed.
    fn is_closed(&self) -> bool;

    /// Returns true if the connection is established and usable.
    fn is_ready(&self) -> bool;

    /// Closes the connection. Safe to call when already closed.
    async fn close(&self);
}

/// How a destination name maps onto an AMQP publish call.
#[derive(Debug, Clone)]
struct PublishRoute {
    exchange: String,
    routing_key: String,
}

/// AMQP broker client over a single shared `lapin` connection.
///
/// Created unconnected; [`Broker::connect`] establishes the connection and
/// channel. Publish routes (destination name to exchange/routing-key pair)
/// are learned from topology declarations.
pub struct AmqpBroker {
    uri: String,
    connection: RwLock<Option<Connection>>,
    channel: RwLock<Option<Channel>>,
    routes: Mutex<HashMap<String, PublishRoute>>,
    ready: AtomicBool,
}

impl AmqpBroker {
    /// Creates an unconnected broker client for the given AMQP URI.
    #[must_use]
    pub fn new(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            connection: RwLock::new(None),
            channel: RwLock::new(None),
            routes: Mutex::new(HashMap::new()),
            ready: AtomicBool::new(false),
        }
    }

    fn route_for(&self, destination: &str) -> PublishRoute {
        let routes = self.routes.lock().expect("route table lock poisoned");
        routes.get(destination).cloned().unwrap_or_else(|| {
            // Unknown names publish through the default exchange, which
            // reaches the queue of the same name.
            PublishRoute {
                exchange: String::new(),
                routing_key: destination.to_string(),
            }
        })
    }

    fn register_routes(&self, plan: &TopologyPlan) {
        let mut routes = self.routes.lock().expect("route table lock poisoned");
        for exchange in &plan.exchanges {
            let routing_key = plan
                .bindings
                .iter()
                .find(|b| b.exchange == exchange.name)
                .map(|b| b.routing_key.clone())
                .unwrap_or_default();
            routes.insert(
                exchange.name.clone(),
                PublishRoute {
                    exchange: exchange.name.clone(),
                    routing_key,
                },
            );
        }
        for queue in &plan.queues {
            // Bound queues are reached via their exchange; only bare queues
            // get a default-exchange route.
            if plan.bindings.iter().all(|b| b.queue != queue.name) {
                routes.insert(
                    queue.name.clone(),
                    PublishRoute {
                        exchange: String::new(),
                        routing_key: queue.name.clone(),
                    },
                );
            }
        }
    }
}

#[async_trait::async_trait]
impl Broker for AmqpBroker {
    async fn connect(&self) -> Result<(), BrokerError> {
        info!(uri = %self.uri, "connecting to AMQP broker");

        let connection = Connection::connect(
            &self.uri,
            ConnectionProperties::default().with_connection_name("staffetta-relay".into()),
        )
        .await
        .map_err(|e| BrokerError::Connection(e.to_string()))?;

        let channel = connection
            .create_channel()
            .await
            .map_err(|e| BrokerError::Connection(e.to_string()))?;

        *self.connection.write().await = Some(connection);
        *self.channel.write().await = Some(channel);
        self.ready.store(true, Ordering::SeqCst);

        info!(uri = %self.uri, "connected to AMQP broker");
        Ok(())
    }

    async fn declare_topology(&self, plan: &TopologyPlan) -> Result<(), BrokerError> {
        let channel_guard = self.channel.read().await;
        let channel = channel_guard.as_ref().ok_or(BrokerError::NotConnected)?;

        for exchange in &plan.exchanges {
            channel
                .exchange_declare(
                    &exchange.name,
                    exchange.kind.to_lapin(),
                    ExchangeDeclareOptions {
                        durable: true,
                        ..Default::default()
                    },
                    FieldTable::default(),
                )
                .await
                .map_err(|e| BrokerError::Topology(e.to_string()))?;
        }

        for queue in &plan.queues {
            channel
                .queue_declare(
                    &queue.name,
                    QueueDeclareOptions {
                        durable: queue.durable,
                        ..Default::default()
                    },
                    FieldTable::default(),
                )
                .await
                .map_err(|e| BrokerError::Topology(e.to_string()))?;
        }

        for binding in &plan.bindings {
            channel
                .queue_bind(
                    &binding.queue,
                    &binding.exchange,
                    &binding.routing_key,
                    QueueBindOptions::default(),
                    FieldTable::default(),
                )
                .await
                .map_err(|e| BrokerError::Topology(e.to_string()))?;
        }

        self.register_routes(plan);

        debug!(
            exchanges = plan.exchanges.len(),
            queues = plan.queues.len(),
            bindings = plan.bindings.len(),
            "declared broker topology"
        );

        Ok(())
    }

    async fn send(
        &self,
        destination: &str,
        payload: &[u8],
        durable: bool,
    ) -> Result<(), BrokerError> {
        let route = self.route_for(destination);

        let channel_guard = self.channel.read().await;
        let channel = channel_guard.as_ref().ok_or(BrokerError::NotConnected)?;

        let mut properties = BasicProperties::default().with_content_type("application/json".into());
        if durable {
            // Delivery mode 2: the broker writes the message to disk.
            properties = properties.with_delivery_mode(2);
        }

        channel
            .basic_publish(
                &route.exchange,
                &route.routing_key,
                lapin::options::BasicPublishOptions::default(),
                payload,
                properties,
            )
            .await
            .map_err(|e| BrokerError::Rejected(e.to_string()))?
            .await
            .map_err(|e| BrokerError::Rejected(e.to_string()))?;

        Ok(())
    }

    fn is_closed(&self) -> bool {
        match self.connection.try_read() {
            Ok(guard) => guard.as_ref().map_or(true, |c| !c.status().connected()),
            // Lock briefly held by a reconnect in progress.
            Err(_) => true,
        }
    }

    fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst) && !self.is_closed()
    }

    async fn close(&self) {
        self.ready.store(false, Ordering::SeqCst);

        if let Some(channel) = self.channel.write().await.take() {
            let _ = channel.close(200, "reconnect").await;
        }
        if let Some(connection) = self.connection.write().await.take() {
            let _ = connection.close(200, "reconnect").await;
        }

        info!(uri = %self.uri, "closed AMQP connection");
    }
}

/// Tracks which broker objects have been declared on the current connection
/// and declares only what is missing.
pub struct TopologyManager {
    destinations: Vec<Destination>,
    declared_exchanges: Mutex<HashSet<String>>,
    declared_queues: Mutex<HashSet<String>>,
    declared_bindings: Mutex<HashSet<(String, String)>>,
}

impl TopologyManager {
    /// Creates a manager for the configured destination set.
    #[must_use]
    pub fn new(destinations: Vec<Destination>) -> Self {
        Self {
            destinations,
            declared_exchanges: Mutex::new(HashSet::new()),
            declared_queues: Mutex::new(HashSet::new()),
            declared_bindings: Mutex::new(HashSet::new()),
        }
    }

    /// Computes the declarations still missing on the current connection.
    #[must_use]
    pub fn missing(&self) -> TopologyPlan {
        let exchanges = self
            .declared_exchanges
            .lock()
            .expect("topology lock poisoned");
        let queues = self.declared_queues.lock().expect("topology lock poisoned");
        let bindings = self
            .declared_bindings
            .lock()
            .expect("topology lock poisoned");

        let mut plan = TopologyPlan::default();
        let mut planned_exchanges: HashSet<&str> = HashSet::new();
        let mut planned_queues: HashSet<&str> = HashSet::new();

        for destination in &self.destinations {
            match &destination.spec {
                DestinationSpec::Exchange {
                    name,
                    kind,
                    routing_key,
                    queues: bound,
                } => {
                    if !exchanges.contains(name) && planned_exchanges.insert(name) {
                        plan.exchanges.push(ExchangeDecl {
                            name: name.clone(),
                            kind: *kind,
                        });
                    }
                    for queue in bound {
                        if !queues.contains(queue) && planned_queues.insert(queue) {
                            plan.queues.push(QueueDecl {
                                name: queue.clone(),
                                durable: true,
                            });
                        }
                        let key = (name.clone(), queue.clone());
                        if !bindings.contains(&key) {
                            plan.bindings.push(BindingDecl {
                                exchange: name.clone(),
                                queue: queue.clone(),
                                routing_key: routing_key.clone().unwrap_or_default(),
                            });
                        }
                    }
                }
                DestinationSpec::Queue { name } => {
                    if !queues.contains(name) && planned_queues.insert(name) {
                        plan.queues.push(QueueDecl {
                            name: name.clone(),
                            durable: true,
                        });
                    }
                }
            }
        }

        plan
    }

    /// Declares whatever part of the required topology is missing.
    ///
    /// Safe to call repeatedly; a second call with the same destination set
    /// issues zero declarations. Never deletes or modifies pre-existing
    /// broker-side objects.
    ///
    /// # Errors
    ///
    /// Returns an error if the broker refuses a declaration; already
    /// declared objects stay marked as declared.
    pub async fn ensure(&self, broker: &dyn Broker) -> Result<(), BrokerError> {
        let plan = self.missing();
        if plan.is_empty() {
            debug!("broker topology already declared");
            return Ok(());
        }

        broker.declare_topology(&plan).await?;

        let mut exchanges = self
            .declared_exchanges
            .lock()
            .expect("topology lock poisoned");
        let mut queues = self.declared_queues.lock().expect("topology lock poisoned");
        let mut bindings = self
            .declared_bindings
            .lock()
            .expect("topology lock poisoned");
        for exchange in &plan.exchanges {
            exchanges.insert(exchange.name.clone());
        }
        for queue in &plan.queues {
            queues.insert(queue.name.clone());
        }
        for binding in &plan.bindings {
            bindings.insert((binding.exchange.clone(), binding.queue.clone()));
        }

        info!(
            exchanges = plan.exchanges.len(),
            queues = plan.queues.len(),
            bindings = plan.bindings.len(),
            "ensured broker topology"
        );

        Ok(())
    }

    /// Forgets everything declared so far.
    ///
    /// Called after a reconnection: the new connection starts from a clean
    /// slate, so the next [`TopologyManager::ensure`] re-declares the full
    /// layout.
    pub fn reset(&self) {
        self.declared_exchanges
            .lock()
            .expect("topology lock poisoned")
            .clear();
        self.declared_queues
            .lock()
            .expect("topology lock poisoned")
            .clear();
        self.declared_bindings
            .lock()
            .expect("topology lock poisoned")
            .clear();
    }

    /// The configured destinations.
    pub fn destinations(&self) -> &[Destination] {
        &self.destinations
    }
}
