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

//! Integration tests against a live `MongoDB` deployment.
//!
//! Ignored by default; run with a deployment available:
//!
//! ```text
//! MONGODB_URI=mongodb://localhost:27017 cargo test -p staffetta-stores -- --ignored
//! ```

use bson::doc;
use mongodb::Client;
use serde_json::json;
use staffetta_core::checkpoint::{Checkpoint, CheckpointStore};
use staffetta_core::failure::{FailedMessageRecord, FailureStore};
use staffetta_stores::mongo::{MongoCheckpointStore, MongoFailureStore};

const TEST_DATABASE: &str = "staffetta_events_test";

async fn client() -> Client {
    let uri = std::env::var("MONGODB_URI")
        .unwrap_or_else(|_| "mongodb://localhost:27017".to_string());
    Client::with_uri_str(&uri)
        .await
        .expect("mongodb connection")
}

#[tokio::test]
#[ignore = "requires a running MongoDB deployment"]
async fn checkpoint_upsert_and_resume() {
    let client = client().await;
    let store = MongoCheckpointStore::new(&client, TEST_DATABASE);
    let watch_id = format!("it-{}", uuid_like());

    assert!(store.load(&watch_id).await.unwrap().is_none());

    store
        .save(&Checkpoint::new(&watch_id, doc! { "_data": "first" }))
        .await
        .unwrap();
    store
        .save(&Checkpoint::new(&watch_id, doc! { "_data": "second" }))
        .await
        .unwrap();

    let loaded = store.load(&watch_id).await.unwrap().expect("checkpoint");
    assert_eq!(loaded.resume_token, doc! { "_data": "second" });

    store.delete(&watch_id).await.unwrap();
    assert!(store.load(&watch_id).await.unwrap().is_none());
}

#[tokio::test]
#[ignore = "requires a running MongoDB deployment"]
async fn failures_survive_and_replay_in_order() {
    let client = client().await;
    let store = MongoFailureStore::new(&client, TEST_DATABASE);
    store.clear().await.unwrap();

    let first = FailedMessageRecord::new("orders", json!({ "n": 1 }), "timeout");
    let second = FailedMessageRecord::new("orders", json!({ "n": 2 }), "timeout");
    store.record(&first).await.unwrap();
    store.record(&second).await.unwrap();

    let listed = store.list_oldest_first().await.unwrap();
    assert_eq!(listed.len(), 2);
    assert_eq!(listed[0].id, first.id);
    assert_eq!(listed[1].id, second.id);
    assert_eq!(listed[0].payload, json!({ "n": 1 }));

    store.remove(&first.id).await.unwrap();
    let listed = store.list_oldest_first().await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].id, second.id);

    store.clear().await.unwrap();
    assert!(store.list_oldest_first().await.unwrap().is_empty());
}

fn uuid_like() -> String {
    // Enough uniqueness for concurrent test runs against a shared database.
    format!("{:x}", std::time::UNIX_EPOCH.elapsed().unwrap().as_nanos())
}
