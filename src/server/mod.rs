// OPCUA for Rust
// SPDX-License-Identifier: MPL-2.0
// Copyright (C) 2017-2024 Adam Lock

//! The server side of the engine: subscriptions, session publish queues and the manager
//! that coordinates them, plus the collaborator traits an application implements.

pub mod config;
pub mod diagnostics;
pub mod events;
pub mod monitored_item;
pub mod node_manager;
pub mod session;
pub mod subscriptions;

#[cfg(test)]
mod tests;

pub use config::{Config, SubscriptionConfig};
pub use diagnostics::{ServerDiagnosticsSummary, SubscriptionDiagnostics, SubscriptionEvent};
pub use monitored_item::{MonitoredItem, MonitoredItemKind, QueuedMonitoredItem};
pub use node_manager::NodeManager;
pub use session::{OperationContext, Session, UserSecurityKey, UserToken};
pub use subscriptions::{
    publish_operation::{AsyncPublishOperation, PublishWaiter, PublishWake},
    session_queue::{PublishTicket, SessionPublishQueue},
    subscription::{PublishedMessage, PublishingState, Subscription, SubscriptionSettings},
    StatusMessage, SubscriptionManager,
};

pub mod prelude {
    pub use super::{
        config::*, diagnostics::*, events::*, monitored_item::*, node_manager::*, session::*,
        subscriptions::*,
    };
    pub use super::subscriptions::{
        publish_operation::*, session_queue::*, subscription::*,
    };
}

/// Contains constants for default configuration values.
/// These are for the most part possible to override through configuration.
pub mod constants {
    /// Minimum publishing interval for subscriptions
    pub const MIN_PUBLISHING_INTERVAL_MS: f64 = 100.0;
    /// Maximum publishing interval for subscriptions, one hour
    pub const MAX_PUBLISHING_INTERVAL_MS: f64 = 3_600_000.0;
    /// Granularity of negotiated publishing intervals, also the rate of the publish timer
    pub const PUBLISHING_RESOLUTION_MS: f64 = 50.0;
    /// Minimum lifetime of a subscription without publish requests
    pub const MIN_SUBSCRIPTION_LIFETIME_MS: f64 = 10_000.0;
    /// Maximum lifetime of a subscription without publish requests, one hour
    pub const MAX_SUBSCRIPTION_LIFETIME_MS: f64 = 3_600_000.0;
    /// Default keep alive count
    pub const DEFAULT_KEEP_ALIVE_COUNT: u32 = 3;
    /// Number of sent messages retained by each subscription for republishing
    pub const MAX_MESSAGE_COUNT: usize = 10;
    /// Server ceiling on notifications in one message, 0 for none
    pub const MAX_NOTIFICATIONS_PER_PUBLISH: u32 = 0;
    /// Maximum number of subscriptions in the server
    pub const MAX_SUBSCRIPTION_COUNT: usize = 1000;
    /// Maximum number of publish requests queued by one session
    pub const MAX_PUBLISH_REQUEST_COUNT: usize = 20;
    /// Default maximum number of monitored items per subscription
    pub const DEFAULT_MAX_MONITORED_ITEMS_PER_SUB: usize = 1000;
    /// Maximum number of monitored items in one call
    pub const MAX_MONITORED_ITEMS_PER_CALL: usize = 1000;
    /// Minimum sampling interval on monitored items
    pub const MIN_SAMPLING_INTERVAL_MS: f64 = PUBLISHING_RESOLUTION_MS;
    /// Maximum data change queue allowed by clients on monitored items
    pub const MAX_DATA_CHANGE_QUEUE_SIZE: usize = 10;
}
