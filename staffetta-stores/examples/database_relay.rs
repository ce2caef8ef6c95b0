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

//! Database-Level Relay Example
//!
//! Relays every change in one database to a fanout exchange with a bound
//! audit queue, plus a bare queue fed through middleware that drops deletes.
//! Checkpoints and failure records are kept in the deployment itself, so a
//! restarted relay resumes where it left off.
//!
//! # Prerequisites
//!
//! Start MongoDB (replica set required for change streams) and RabbitMQ:
//! ```bash
//! docker run -d --name mongodb -p 27017:27017 mongo:7.0 --replSet rs0
//! docker exec mongodb mongosh --eval "rs.initiate()"
//! docker run -d --name rabbitmq -p 5672:5672 rabbitmq:3
//! ```
//!
//! # Running the Example
//!
//! ```bash
//! cargo run --example database_relay
//! ```
//!
//! # Generate Test Data
//!
//! In another terminal:
//! ```bash
//! docker exec mongodb mongosh shop --eval '
//!   db.orders.insertOne({product: "Widget", quantity: 5})
//! '
//! ```

use mongodb::Client;
use staffetta_core::broker::{Destination, ExchangeType};
use staffetta_core::event::OperationType;
use staffetta_core::message::{Middleware, MiddlewareOutput};
use staffetta_core::relay::{Relay, RelayConfig, RelayOptions, DEFAULT_EVENTS_DATABASE};
use staffetta_core::watcher::WatchTarget;
use staffetta_stores::{MongoCheckpointStore, MongoFailureStore};
use std::error::Error;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let mongo_uri = "mongodb://localhost:27017";

    let drop_deletes: Middleware = Arc::new(|msg, _collection| {
        if msg.operation == OperationType::Delete {
            MiddlewareOutput::Skip
        } else {
            MiddlewareOutput::One(msg)
        }
    });

    let mut options = RelayOptions::default();
    options.silent = false;
    options.health_check_interval = Duration::from_secs(10);

    let config = RelayConfig::new(mongo_uri, "amqp://localhost:5672")
        .watch(WatchTarget::Database("shop".into()))
        .watch_id("shop-relay")
        .destination(
            Destination::exchange("shop-events", ExchangeType::Fanout).with_queue("shop-audit"),
        )
        .destination(Destination::queue("shop-live").with_middleware(drop_deletes))
        .options(options);

    let store_client = Client::with_uri_str(mongo_uri).await?;
    let checkpoints = Arc::new(MongoCheckpointStore::new(
        &store_client,
        DEFAULT_EVENTS_DATABASE,
    ));
    let failures = Arc::new(MongoFailureStore::new(
        &store_client,
        DEFAULT_EVENTS_DATABASE,
    ));

    let relay = Relay::start(config, checkpoints, failures).await?;

    info!("relay running, press Ctrl+C to stop");
    signal::ctrl_c().await?;

    relay.shutdown().await;
    Ok(())
}
