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

//! Watcher lifecycle and change feed resume behavior.
//!
//! The resume test requires a real `MongoDB` replica set and is ignored by
//! default:
//!
//! ```bash
//! MONGODB_URI=mongodb://localhost:27017 \
//!   cargo test -p staffetta-core --test watcher_stream_tests -- --ignored
//! ```

mod common;

use bson::{doc, Document};
use common::{FakeCheckpoints, FakeFailures, RecordingBroker};
use mongodb::Client;
use staffetta_core::broker::Destination;
use staffetta_core::publish::Publisher;
use staffetta_core::relay::RelayOptions;
use staffetta_core::watcher::{WatchTarget, Watcher, WatcherState};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::time::timeout;

const EVENTS_DATABASE: &str = "staffetta_events_test";
const TEST_DATABASE: &str = "staffetta_core_it";
const TEST_COLLECTION: &str = "resume_orders";
const DESTINATION: &str = "resume-orders";

fn options() -> RelayOptions {
    let mut options = RelayOptions::default();
    options.health_check_interval = Duration::from_millis(50);
    options.send_timeout = Duration::from_secs(1);
    options
}

fn watcher(
    client: &Client,
    checkpoints: &Arc<FakeCheckpoints>,
    broker: &Arc<RecordingBroker>,
    failures: &Arc<FakeFailures>,
) -> Watcher {
    let publisher = Publisher::new(
        Arc::clone(broker) as Arc<dyn staffetta_core::broker::Broker>,
        Arc::clone(failures) as Arc<dyn staffetta_core::failure::FailureStore>,
        Duration::from_secs(1),
    );

    Watcher::new(
        "resume-watch",
        WatchTarget::Collection {
            database: TEST_DATABASE.into(),
            collection: TEST_COLLECTION.into(),
        },
        EVENTS_DATABASE,
        client.clone(),
        Arc::clone(checkpoints) as Arc<dyn staffetta_core::checkpoint::CheckpointStore>,
        publisher,
        Arc::new(vec![Destination::queue(DESTINATION)]),
        options(),
    )
}

async fn wait_for_sent(broker: &RecordingBroker, count: usize) {
    timeout(Duration::from_secs(10), async {
        while broker.sent_to(DESTINATION).len() < count {
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    })
    .await
    .expect("expected messages within the deadline");
}

fn sent_ids(broker: &RecordingBroker) -> Vec<String> {
    broker
        .sent_to(DESTINATION)
        .iter()
        .map(|payload| {
            let value: serde_json::Value = serde_json::from_slice(payload).unwrap();
            value["id"].as_str().unwrap().to_string()
        })
        .collect()
}

#[tokio::test]
async fn state_transitions_are_observable() {
    // No server behind this address; the watcher stays in the
    // subscribe/retry cycle until told to stop.
    let client = Client::with_uri_str(
        "mongodb://127.0.0.1:9/?serverSelectionTimeoutMS=100&connectTimeoutMS=100&directConnection=true",
    )
    .await
    .unwrap();

    let checkpoints = Arc::new(FakeCheckpoints::new());
    let broker = Arc::new(RecordingBroker::new());
    let failures = Arc::new(FakeFailures::new());
    let watcher = watcher(&client, &checkpoints, &broker, &failures);

    let mut state = watcher.state();
    assert_eq!(*state.borrow(), WatcherState::Idle);

    let (_resub_tx, resub_rx) = broadcast::channel(4);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(watcher.run(resub_rx, shutdown_rx));

    timeout(
        Duration::from_secs(5),
        state.wait_for(|s| *s == WatcherState::Subscribing),
    )
    .await
    .expect("watcher should enter Subscribing")
    .unwrap();

    shutdown_tx.send(true).unwrap();
    timeout(
        Duration::from_secs(5),
        state.wait_for(|s| *s == WatcherState::Stopped),
    )
    .await
    .expect("watcher should stop on shutdown")
    .unwrap();

    handle.await.unwrap();
}

#[tokio::test]
#[ignore = "requires a running MongoDB replica set"]
async fn restart_resumes_strictly_after_checkpoint() {
    let uri = std::env::var("MONGODB_URI")
        .unwrap_or_else(|_| "mongodb://localhost:27017".to_string());
    let client = Client::with_uri_str(&uri).await.unwrap();
    let collection = client
        .database(TEST_DATABASE)
        .collection::<Document>(TEST_COLLECTION);
    collection.drop().await.ok();

    let checkpoints = Arc::new(FakeCheckpoints::new());
    let broker = Arc::new(RecordingBroker::new());
    let failures = Arc::new(FakeFailures::new());

    // First session: observe one event and checkpoint it.
    let first_watcher = watcher(&client, &checkpoints, &broker, &failures);
    let mut state = first_watcher.state();
    let (_resub_tx, resub_rx) = broadcast::channel(4);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(first_watcher.run(resub_rx, shutdown_rx));

    timeout(
        Duration::from_secs(10),
        state.wait_for(|s| *s == WatcherState::Streaming),
    )
    .await
    .expect("first watcher should stream")
    .unwrap();

    collection
        .insert_one(doc! { "_id": "first", "n": 1 })
        .await
        .unwrap();
    wait_for_sent(&broker, 1).await;

    // The checkpoint for the relayed event lands before shutdown.
    timeout(Duration::from_secs(10), async {
        while checkpoints.get("resume-watch").is_none() {
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    })
    .await
    .expect("checkpoint persisted for the first event");

    shutdown_tx.send(true).unwrap();
    handle.await.unwrap();

    // Written while no watcher is running; the resumed feed must still
    // deliver it.
    collection
        .insert_one(doc! { "_id": "second", "n": 2 })
        .await
        .unwrap();

    // Second session resumes from the persisted checkpoint.
    let second_watcher = watcher(&client, &checkpoints, &broker, &failures);
    let (_resub_tx, resub_rx) = broadcast::channel(4);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(second_watcher.run(resub_rx, shutdown_rx));

    wait_for_sent(&broker, 2).await;
    shutdown_tx.send(true).unwrap();
    handle.await.unwrap();

    // Strictly after the token: the checkpointed event is not re-delivered.
    let ids = sent_ids(&broker);
    assert_eq!(ids, vec!["first".to_string(), "second".to_string()]);
    assert_eq!(
        ids.iter().filter(|id| id.as_str() == "first").count(),
        1,
        "checkpointed event must not be re-delivered on resume"
    );
}
