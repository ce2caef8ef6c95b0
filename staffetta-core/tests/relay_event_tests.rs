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

//! Per-event fan-out and checkpoint advancement rules.

mod common;

use bson::doc;
use common::{FakeFailures, RecordingBroker};
use serde_json::json;
use staffetta_core::broker::{Destination, ExchangeType};
use staffetta_core::event::{ChangeEvent, Namespace, OperationType};
use staffetta_core::message::{Middleware, MiddlewareOutput};
use staffetta_core::publish::Publisher;
use staffetta_core::relay::RelayOptions;
use staffetta_core::watcher::relay_event;
use std::sync::Arc;
use std::time::Duration;

fn insert_event() -> ChangeEvent {
    ChangeEvent {
        operation: OperationType::Insert,
        namespace: Namespace::new("shop", "orders"),
        document_key: Some(doc! { "_id": "A" }),
        full_document: Some(doc! { "_id": "A", "total": 3 }),
        update_description: None,
        resume_token: doc! { "_data": "T1" },
    }
}

fn publisher(broker: &Arc<RecordingBroker>, failures: &Arc<FakeFailures>) -> Publisher {
    Publisher::new(
        Arc::clone(broker) as Arc<dyn staffetta_core::broker::Broker>,
        Arc::clone(failures) as Arc<dyn staffetta_core::failure::FailureStore>,
        Duration::from_secs(1),
    )
}

#[tokio::test]
async fn normalized_event_reaches_every_destination() {
    let broker = Arc::new(RecordingBroker::new());
    let failures = Arc::new(FakeFailures::new());
    let publisher = publisher(&broker, &failures);

    let destinations = vec![
        Destination::exchange("orders", ExchangeType::Fanout),
        Destination::queue("audit"),
    ];

    let advance = relay_event(
        &insert_event(),
        &destinations,
        &publisher,
        &RelayOptions::default(),
    )
    .await;

    assert!(advance);
    assert_eq!(broker.sent_to("orders").len(), 1);
    assert_eq!(broker.sent_to("audit").len(), 1);

    let payload: serde_json::Value =
        serde_json::from_slice(&broker.sent_to("orders")[0]).unwrap();
    assert_eq!(payload["operation"], "insert");
    assert_eq!(payload["id"], "A");
    assert_eq!(payload["db"], "shop");
    assert_eq!(payload["coll"], "orders");
    assert_eq!(payload["fullDocument"], json!({ "_id": "A", "total": 3 }));
    assert_eq!(
        payload["updateDescription"],
        json!({ "updatedFields": {}, "removedFields": [] })
    );
}

#[tokio::test]
async fn one_failing_destination_does_not_block_the_others() {
    let broker = Arc::new(RecordingBroker::new());
    broker.reject("audit");
    let failures = Arc::new(FakeFailures::new());
    let publisher = publisher(&broker, &failures);

    let destinations = vec![
        Destination::queue("orders"),
        Destination::queue("audit"),
    ];

    let advance = relay_event(
        &insert_event(),
        &destinations,
        &publisher,
        &RelayOptions::default(),
    )
    .await;

    // The failed publish is parked for replay; the checkpoint still moves.
    assert!(advance);
    assert_eq!(broker.sent_to("orders").len(), 1);
    assert_eq!(failures.count(), 1);
    assert_eq!(failures.all()[0].destination, "audit");
}

#[tokio::test]
async fn middleware_skip_suppresses_one_destination_only() {
    let broker = Arc::new(RecordingBroker::new());
    let failures = Arc::new(FakeFailures::new());
    let publisher = publisher(&broker, &failures);

    let skip_all: Middleware = Arc::new(|_, _| MiddlewareOutput::Skip);
    let destinations = vec![
        Destination::queue("orders"),
        Destination::queue("audit").with_middleware(skip_all),
    ];

    let advance = relay_event(
        &insert_event(),
        &destinations,
        &publisher,
        &RelayOptions::default(),
    )
    .await;

    assert!(advance);
    assert_eq!(broker.sent_to("orders").len(), 1);
    assert!(broker.sent_to("audit").is_empty());
}

#[tokio::test]
async fn middleware_fan_out_publishes_each_message() {
    let broker = Arc::new(RecordingBroker::new());
    let failures = Arc::new(FakeFailures::new());
    let publisher = publisher(&broker, &failures);

    let duplicate: Middleware = Arc::new(|msg, _| {
        let mut copy = msg.clone();
        copy.id = format!("{}-copy", msg.id);
        MiddlewareOutput::Many(vec![msg, copy])
    });
    let destinations = vec![Destination::queue("orders").with_middleware(duplicate)];

    let advance = relay_event(
        &insert_event(),
        &destinations,
        &publisher,
        &RelayOptions::default(),
    )
    .await;

    assert!(advance);
    let sent = broker.sent_to("orders");
    assert_eq!(sent.len(), 2);
    let second: serde_json::Value = serde_json::from_slice(&sent[1]).unwrap();
    assert_eq!(second["id"], "A-copy");
}

#[tokio::test]
async fn middleware_receives_source_collection() {
    let broker = Arc::new(RecordingBroker::new());
    let failures = Arc::new(FakeFailures::new());
    let publisher = publisher(&broker, &failures);

    let orders_only: Middleware = Arc::new(|msg, collection| {
        if collection == "orders" {
            MiddlewareOutput::One(msg)
        } else {
            MiddlewareOutput::Skip
        }
    });
    let destinations = vec![Destination::queue("filtered").with_middleware(orders_only)];

    let advance = relay_event(
        &insert_event(),
        &destinations,
        &publisher,
        &RelayOptions::default(),
    )
    .await;

    assert!(advance);
    assert_eq!(broker.sent_to("filtered").len(), 1);
}

#[tokio::test]
async fn raw_mode_passes_event_through_unformatted() {
    let broker = Arc::new(RecordingBroker::new());
    let failures = Arc::new(FakeFailures::new());
    let publisher = publisher(&broker, &failures);

    let mut options = RelayOptions::default();
    options.normalize = false;
    let destinations = vec![Destination::queue("orders")];

    let advance = relay_event(&insert_event(), &destinations, &publisher, &options).await;

    assert!(advance);
    let payload: serde_json::Value =
        serde_json::from_slice(&broker.sent_to("orders")[0]).unwrap();
    // Raw events keep the feed's field names, not the normalized shape.
    assert_eq!(payload["operationType"], "insert");
    assert_eq!(payload["ns"]["db"], "shop");
}

#[tokio::test]
async fn raw_mode_failure_withholds_checkpoint_and_records_nothing() {
    let broker = Arc::new(RecordingBroker::new());
    broker.reject("audit");
    let failures = Arc::new(FakeFailures::new());
    let publisher = publisher(&broker, &failures);

    let mut options = RelayOptions::default();
    options.normalize = false;
    let destinations = vec![
        Destination::queue("orders"),
        Destination::queue("audit"),
    ];

    let advance = relay_event(&insert_event(), &destinations, &publisher, &options).await;

    assert!(!advance);
    assert_eq!(failures.count(), 0);
    // The healthy destination still got the event; re-delivery after
    // restart is the raw path's recovery mechanism.
    assert_eq!(broker.sent_to("orders").len(), 1);
}
