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

//! Store backends for the Staffetta relay.
//!
//! This crate implements the
//! [`CheckpointStore`](staffetta_core::checkpoint::CheckpointStore) and
//! [`FailureStore`](staffetta_core::failure::FailureStore) traits.
//!
//! # Available Stores
//!
//! - **MongoDB** ([`mongo`]): durable stores inside the watched deployment's
//!   events database; the production choice, since the relay's delivery
//!   guarantee depends on checkpoints surviving restarts
//! - **Memory** ([`memory`]): process-local stores for development and tests
//!
//! # Example
//!
//! ```rust,no_run
//! use staffetta_stores::mongo::{MongoCheckpointStore, MongoFailureStore};
//! use mongodb::Client;
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = Client::with_uri_str("mongodb://localhost:27017").await?;
//!
//! let checkpoints = Arc::new(MongoCheckpointStore::new(&client, "staffetta_events"));
//! let failures = Arc::new(MongoFailureStore::new(&client, "staffetta_events"));
//! # Ok(())
//! # }
//! ```

pub mod memory;
pub mod mongo;

pub use memory::{MemoryCheckpointStore, MemoryFailureStore};
pub use mongo::{MongoCheckpointStore, MongoFailureStore};
