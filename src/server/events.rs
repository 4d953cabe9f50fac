// OPCUA for Rust
// SPDX-License-Identifier: MPL-2.0
// Copyright (C) 2017-2024 Adam Lock

//! Events delivered to event monitored items. The engine itself raises only the refresh start
//! and end events that bracket a condition refresh, other events come from node managers.

use std::sync::atomic::{AtomicU32, Ordering};

use crate::types::{DateTime, NodeId, Variant};

/// Type ids of the system events raised by the engine
pub const REFRESH_START_EVENT_TYPE: u32 = 2787;
pub const REFRESH_END_EVENT_TYPE: u32 = 2788;
/// The Server object, source of system events
pub const SERVER_OBJECT: u32 = 2253;

/// Anything that can be reported through an event monitored item. Fields are looked up by the
/// browse name used in the select clauses of the item's event filter.
pub trait Event: Send + Sync {
    fn get_field(&self, browse_name: &str) -> Variant;

    fn event_type(&self) -> &NodeId;

    fn time(&self) -> &DateTime;
}

#[derive(Debug, Clone, Default)]
/// This corresponds to BaseEventType definition in OPC UA Part 5
pub struct BaseEventType {
    /// A unique identifier for an event
    pub event_id: String,
    /// Event type describes the type of event
    pub event_type: NodeId,
    /// Source node identifies the node that the event originated from or null.
    pub source_node: NodeId,
    /// Source name provides the description of the source of the event
    pub source_name: String,
    /// Time provides the time the event occurred.
    pub time: DateTime,
    /// Receive time provides the time the OPC UA server received the event.
    pub receive_time: DateTime,
    /// Message provides a human readable description of the event.
    pub message: String,
    /// Severity is an indication of the urgency of the event. Values from 1 to 1000, with 1 as the lowest
    /// severity and 1000 being the highest.
    pub severity: u16,
}

impl Event for BaseEventType {
    fn get_field(&self, browse_name: &str) -> Variant {
        match browse_name {
            "EventId" => Variant::from(self.event_id.as_str()),
            "EventType" => Variant::from(self.event_type.clone()),
            "SourceNode" => Variant::from(self.source_node.clone()),
            "SourceName" => Variant::from(self.source_name.as_str()),
            "Time" => Variant::from(self.time),
            "ReceiveTime" => Variant::from(self.receive_time),
            "Message" => Variant::from(self.message.as_str()),
            "Severity" => Variant::from(self.severity as u32),
            _ => Variant::Empty,
        }
    }

    fn event_type(&self) -> &NodeId {
        &self.event_type
    }

    fn time(&self) -> &DateTime {
        &self.time
    }
}

static NEXT_EVENT_ID: AtomicU32 = AtomicU32::new(1);

impl BaseEventType {
    pub fn new(event_type: impl Into<NodeId>, source_node: NodeId, message: &str) -> Self {
        let now = DateTime::now();
        Self {
            event_id: format!("{}", NEXT_EVENT_ID.fetch_add(1, Ordering::Relaxed)),
            event_type: event_type.into(),
            source_node,
            source_name: "Server".to_string(),
            time: now,
            receive_time: now,
            message: message.to_string(),
            severity: 100,
        }
    }

    /// The event that opens a condition refresh on a subscription
    pub fn refresh_start() -> Self {
        Self::new(
            NodeId::new(0, REFRESH_START_EVENT_TYPE),
            NodeId::new(0, SERVER_OBJECT),
            "Condition refresh started",
        )
    }

    /// The event that closes a condition refresh on a subscription
    pub fn refresh_end() -> Self {
        Self::new(
            NodeId::new(0, REFRESH_END_EVENT_TYPE),
            NodeId::new(0, SERVER_OBJECT),
            "Condition refresh ended",
        )
    }

    pub fn is_refresh_start(&self) -> bool {
        self.event_type.as_u32() == Some(REFRESH_START_EVENT_TYPE) && self.event_type.namespace == 0
    }

    pub fn is_refresh_end(&self) -> bool {
        self.event_type.as_u32() == Some(REFRESH_END_EVENT_TYPE) && self.event_type.namespace == 0
    }
}
