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

//! Relay metrics, emitted through the `metrics` facade.
//!
//! The embedding application chooses the exporter (Prometheus, statsd, or
//! none at all); without an installed recorder these calls are no-ops.
//! Call [`describe_metrics`] once at startup if the exporter supports
//! metadata.

use ::metrics::{counter, describe_counter, Unit};

/// Change events relayed to at least one destination.
pub const EVENTS_RELAYED_TOTAL: &str = "staffetta_events_relayed_total";

/// Publish attempts that failed and were routed to the failure store.
pub const PUBLISH_FAILURES_TOTAL: &str = "staffetta_publish_failures_total";

/// Failure records successfully republished by a replay pass.
pub const REPLAYED_MESSAGES_TOTAL: &str = "staffetta_replayed_messages_total";

/// Broker connections re-established by the health monitor.
pub const BROKER_RECONNECTS_TOTAL: &str = "staffetta_broker_reconnects_total";

/// Watcher re-subscriptions after feed-level errors or recovery signals.
pub const FEED_RESUBSCRIBES_TOTAL: &str = "staffetta_feed_resubscribes_total";

/// Registers metric descriptions with the installed recorder.
pub fn describe_metrics() {
    describe_counter!(
        EVENTS_RELAYED_TOTAL,
        Unit::Count,
        "Change events relayed to the broker"
    );
    describe_counter!(
        PUBLISH_FAILURES_TOTAL,
        Unit::Count,
        "Publish attempts routed to the failure store"
    );
    describe_counter!(
        REPLAYED_MESSAGES_TOTAL,
        Unit::Count,
        "Failure records republished successfully"
    );
    describe_counter!(
        BROKER_RECONNECTS_TOTAL,
        Unit::Count,
        "Broker connections re-established after failed health probes"
    );
    describe_counter!(
        FEED_RESUBSCRIBES_TOTAL,
        Unit::Count,
        "Change feed re-subscriptions"
    );
}

/// Records one relayed change event.
pub fn record_event_relayed(operation: &crate::event::OperationType) {
    counter!(EVENTS_RELAYED_TOTAL, "operation" => operation.to_string()).increment(1);
}

/// Records one publish failure routed to the failure store.
pub fn record_publish_failure(destination: &str) {
    counter!(PUBLISH_FAILURES_TOTAL, "destination" => destination.to_string()).increment(1);
}

/// Records one successfully replayed failure record.
pub fn record_replayed(destination: &str) {
    counter!(REPLAYED_MESSAGES_TOTAL, "destination" => destination.to_string()).increment(1);
}

/// Records one broker reconnection.
pub fn record_broker_reconnect() {
    counter!(BROKER_RECONNECTS_TOTAL).increment(1);
}

/// Records one feed re-subscription.
pub fn record_feed_resubscribe(watch_id: &str) {
    counter!(FEED_RESUBSCRIBES_TOTAL, "watch_id" => watch_id.to_string()).increment(1);
}
