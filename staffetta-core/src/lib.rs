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

//! Staffetta - MongoDB change feed to message broker relay.
//!
//! Staffetta watches a `MongoDB` deployment's change streams and republishes
//! every event to AMQP destinations with at-least-once delivery. Resume
//! tokens are checkpointed durably so a restarted relay picks up where it
//! left off; publishes that fail are parked in a failure store and replayed
//! once the broker recovers.
//!
//! # Key Components
//!
//! - **Events**: [`event`] defines the normalized change feed event
//! - **Messages**: [`message`] formats events into the outbound shape and
//!   applies per-destination middleware
//! - **Broker**: [`broker`] holds the AMQP connection, destinations, and
//!   idempotent topology declaration
//! - **Publishing**: [`publish`] adds send timeouts, failure routing, and
//!   replay
//! - **Watching**: [`watcher`] consumes the change feed and drives
//!   checkpoints
//! - **Supervision**: [`health`] probes the broker and runs recovery
//! - **Entry point**: [`relay`] wires it all together
//!
//! Checkpoint and failure persistence are trait seams ([`checkpoint`] and
//! [`failure`]); production backends live in the `staffetta-stores` crate.
//!
//! # Example
//!
//! ```rust
//! use staffetta_core::event::{ChangeEvent, OperationType};
//!
//! fn process_event(event: &ChangeEvent) {
//!     match event.operation {
//!         OperationType::Insert => println!("new document"),
//!         OperationType::Delete => println!("document removed"),
//!         _ => println!("other operation"),
//!     }
//! }
//! ```

pub mod broker;
pub mod checkpoint;
pub mod event;
pub mod failure;
pub mod health;
pub mod message;
pub mod metrics;
pub mod publish;
pub mod relay;
pub mod watcher;
