// OPCUA for Rust
// SPDX-License-Identifier: MPL-2.0
// Copyright (C) 2017-2024 Adam Lock

//! Provides diagnostics structures for gathering information about the running state of the
//! subscriptions of a server, and the channel through which observers learn about subscription
//! lifecycle events.

use std::collections::BTreeMap;

use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

use crate::sync::Mutex;

/// A snapshot of the counters of one subscription.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SubscriptionDiagnostics {
    pub subscription_id: u32,
    /// Session currently owning the subscription, `None` when abandoned
    pub session_id: Option<u32>,
    pub priority: u8,
    pub publishing_interval: f64,
    pub max_keep_alive_count: u32,
    pub max_lifetime_count: u32,
    pub max_notifications_per_publish: u32,
    pub publishing_enabled: bool,
    pub modify_count: u32,
    pub enable_count: u32,
    pub disable_count: u32,
    pub republish_request_count: u32,
    pub republish_message_count: u32,
    pub transfer_request_count: u32,
    pub publish_request_count: u32,
    pub data_change_notifications_count: u32,
    pub event_notifications_count: u32,
    pub notifications_count: u32,
    pub current_keep_alive_count: u32,
    pub current_lifetime_count: u32,
    pub unacknowledged_message_count: u32,
    pub discarded_message_count: u32,
    pub monitored_item_count: u32,
    pub disabled_monitored_item_count: u32,
    pub next_sequence_number: u32,
}

/// Server wide subscription counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ServerDiagnosticsSummary {
    /// The number of subscriptions currently established in the server.
    pub current_subscription_count: u32,
    /// The number of subscriptions established since the server was started.
    pub cumulated_subscription_count: u32,
    /// The number of distinct publishing intervals currently in use.
    pub publishing_interval_count: u32,
    /// Number of subscriptions per publishing interval, keyed by interval in milliseconds
    pub publishing_intervals: BTreeMap<u64, u32>,
    /// The number of subscriptions that expired since the server was started.
    pub expired_subscription_count: u32,
}

/// Structure that captures diagnostics information for the subscriptions of the server
#[derive(Debug, Default)]
pub struct ServerDiagnostics {
    summary: ServerDiagnosticsSummary,
}

impl ServerDiagnostics {
    /// Return a summary of the server diagnostics as they stand.
    pub fn summary(&self) -> ServerDiagnosticsSummary {
        self.summary.clone()
    }

    /// Increment the number of subscriptions currently established in the server.
    pub(crate) fn on_create_subscription(&mut self, publishing_interval: f64) {
        self.summary.current_subscription_count += 1;
        self.summary.cumulated_subscription_count += 1;
        self.add_publishing_interval(publishing_interval);
    }

    /// Decrement the number of subscriptions currently established in the server.
    pub(crate) fn on_destroy_subscription(&mut self, publishing_interval: f64) {
        self.summary.current_subscription_count =
            self.summary.current_subscription_count.saturating_sub(1);
        self.remove_publishing_interval(publishing_interval);
    }

    pub(crate) fn on_expire_subscription(&mut self) {
        self.summary.expired_subscription_count += 1;
    }

    pub(crate) fn on_modify_subscription(&mut self, old_interval: f64, new_interval: f64) {
        if old_interval != new_interval {
            self.remove_publishing_interval(old_interval);
            self.add_publishing_interval(new_interval);
        }
    }

    fn add_publishing_interval(&mut self, publishing_interval: f64) {
        *self
            .summary
            .publishing_intervals
            .entry(publishing_interval as u64)
            .or_insert(0) += 1;
        self.summary.publishing_interval_count = self.summary.publishing_intervals.len() as u32;
    }

    fn remove_publishing_interval(&mut self, publishing_interval: f64) {
        let key = publishing_interval as u64;
        if let Some(count) = self.summary.publishing_intervals.get_mut(&key) {
            *count -= 1;
            if *count == 0 {
                self.summary.publishing_intervals.remove(&key);
            }
        }
        self.summary.publishing_interval_count = self.summary.publishing_intervals.len() as u32;
    }
}

/// Lifecycle events of subscriptions, delivered to observers through a channel.
#[derive(Debug, Clone, PartialEq)]
pub enum SubscriptionEvent {
    Created {
        subscription_id: u32,
        session_id: u32,
    },
    Deleted {
        subscription_id: u32,
    },
    Expired {
        subscription_id: u32,
    },
    Transferred {
        subscription_id: u32,
        from_session_id: Option<u32>,
        to_session_id: u32,
    },
}

/// Fans subscription events out to every registered observer. Observers that dropped their
/// receiver are removed on the next event.
#[derive(Default)]
pub struct SubscriptionObservers {
    senders: Mutex<Vec<UnboundedSender<SubscriptionEvent>>>,
}

impl SubscriptionObservers {
    pub fn subscribe(&self) -> UnboundedReceiver<SubscriptionEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        trace_lock!(self.senders).push(tx);
        rx
    }

    pub fn notify(&self, event: SubscriptionEvent) {
        let mut senders = trace_lock!(self.senders);
        senders.retain(|tx| tx.send(event.clone()).is_ok());
    }
}
