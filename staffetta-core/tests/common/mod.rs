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

//! In-memory fakes shared by the integration tests.

// Each test binary compiles its own copy and uses a different subset.
#![allow(dead_code)]

use staffetta_core::broker::{Broker, BrokerError, TopologyPlan};
use staffetta_core::checkpoint::{Checkpoint, CheckpointStore, CheckpointStoreError};
use staffetta_core::failure::{FailedMessageRecord, FailureStore, FailureStoreError};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

/// Broker fake that records every declaration and publish.
///
/// Sends to a destination listed in `rejected` fail with a rejection;
/// sends to one listed in `hanging` never complete, exercising the
/// publisher's timeout.
#[derive(Default)]
pub struct RecordingBroker {
    connected: AtomicBool,
    pub sent: Mutex<Vec<(String, Vec<u8>)>>,
    pub declared_plans: Mutex<Vec<TopologyPlan>>,
    rejected: Mutex<HashSet<String>>,
    hanging: Mutex<HashSet<String>>,
    refuse_declarations: AtomicBool,
}

impl RecordingBroker {
    pub fn new() -> Self {
        let broker = Self::default();
        broker.connected.store(true, Ordering::SeqCst);
        broker
    }

    pub fn reject(&self, destination: &str) {
        self.rejected.lock().unwrap().insert(destination.to_string());
    }

    pub fn accept(&self, destination: &str) {
        self.rejected.lock().unwrap().remove(destination);
    }

    pub fn hang(&self, destination: &str) {
        self.hanging.lock().unwrap().insert(destination.to_string());
    }

    pub fn refuse_declarations(&self, refuse: bool) {
        self.refuse_declarations.store(refuse, Ordering::SeqCst);
    }

    pub fn sent_to(&self, destination: &str) -> Vec<Vec<u8>> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter(|(dest, _)| dest == destination)
            .map(|(_, payload)| payload.clone())
            .collect()
    }

    pub fn declaration_count(&self) -> usize {
        self.declared_plans.lock().unwrap().len()
    }
}

#[async_trait::async_trait]
impl Broker for RecordingBroker {
    async fn connect(&self) -> Result<(), BrokerError> {
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn declare_topology(&self, plan: &TopologyPlan) -> Result<(), BrokerError> {
        if self.refuse_declarations.load(Ordering::SeqCst) {
            return Err(BrokerError::Topology("declaration refused".into()));
        }
        self.declared_plans.lock().unwrap().push(plan.clone());
        Ok(())
    }

    async fn send(
        &self,
        destination: &str,
        payload: &[u8],
        _durable: bool,
    ) -> Result<(), BrokerError> {
        if self.hanging.lock().unwrap().contains(destination) {
            futures::future::pending::<()>().await;
        }
        if self.rejected.lock().unwrap().contains(destination) {
            return Err(BrokerError::Rejected(format!("{destination} unavailable")));
        }
        self.sent
            .lock()
            .unwrap()
            .push((destination.to_string(), payload.to_vec()));
        Ok(())
    }

    fn is_closed(&self) -> bool {
        !self.connected.load(Ordering::SeqCst)
    }

    fn is_ready(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }
}

/// Checkpoint store fake over a plain map.
#[derive(Default)]
pub struct FakeCheckpoints {
    checkpoints: Mutex<HashMap<String, Checkpoint>>,
}

impl FakeCheckpoints {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, watch_id: &str) -> Option<Checkpoint> {
        self.checkpoints.lock().unwrap().get(watch_id).cloned()
    }
}

#[async_trait::async_trait]
impl CheckpointStore for FakeCheckpoints {
    async fn save(&self, checkpoint: &Checkpoint) -> Result<(), CheckpointStoreError> {
        self.checkpoints
            .lock()
            .unwrap()
            .insert(checkpoint.watch_id.clone(), checkpoint.clone());
        Ok(())
    }

    async fn load(&self, watch_id: &str) -> Result<Option<Checkpoint>, CheckpointStoreError> {
        Ok(self.checkpoints.lock().unwrap().get(watch_id).cloned())
    }

    async fn delete(&self, watch_id: &str) -> Result<(), CheckpointStoreError> {
        self.checkpoints.lock().unwrap().remove(watch_id);
        Ok(())
    }
}

/// Failure store fake preserving insertion order.
#[derive(Default)]
pub struct FakeFailures {
    records: Mutex<Vec<FailedMessageRecord>>,
}

impl FakeFailures {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn all(&self) -> Vec<FailedMessageRecord> {
        self.records.lock().unwrap().clone()
    }

    pub fn count(&self) -> usize {
        self.records.lock().unwrap().len()
    }
}

#[async_trait::async_trait]
impl FailureStore for FakeFailures {
    async fn record(&self, record: &FailedMessageRecord) -> Result<(), FailureStoreError> {
        self.records.lock().unwrap().push(record.clone());
        Ok(())
    }

    async fn list_oldest_first(&self) -> Result<Vec<FailedMessageRecord>, FailureStoreError> {
        let mut records = self.records.lock().unwrap().clone();
        records.sort_by(|a, b| a.recorded_at.cmp(&b.recorded_at));
        Ok(records)
    }

    async fn remove(&self, id: &str) -> Result<(), FailureStoreError> {
        self.records.lock().unwrap().retain(|r| r.id != id);
        Ok(())
    }

    async fn clear(&self) -> Result<(), FailureStoreError> {
        self.records.lock().unwrap().clear();
        Ok(())
    }
}
