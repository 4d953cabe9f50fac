// OPCUA for Rust
// SPDX-License-Identifier: MPL-2.0
// Copyright (C) 2017-2024 Adam Lock

//! Request / response bodies of the Subscription and MonitoredItem service sets. Request
//! headers and the wire encoding are owned by the transport, so only the fields the engine
//! reads or fills in appear here.

use crate::types::{
    node_id::NodeId, notification_message::NotificationMessage, status_code::StatusCode,
};

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageSecurityMode {
    Invalid,
    None,
    Sign,
    SignAndEncrypt,
}

impl Default for MessageSecurityMode {
    fn default() -> Self {
        MessageSecurityMode::None
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MonitoringMode {
    Disabled = 0,
    Sampling = 1,
    Reporting = 2,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimestampsToReturn {
    Source = 0,
    Server = 1,
    Both = 2,
    Neither = 3,
    Invalid = 4,
}

/// The attributes a monitored item may watch.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AttributeId {
    EventNotifier = 12,
    Value = 13,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataChangeTrigger {
    Status = 0,
    StatusValue = 1,
    StatusValueTimestamp = 2,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataChangeFilter {
    pub trigger: DataChangeTrigger,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventFilter {
    /// Browse names of the event fields to select, in order
    pub select_clauses: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MonitoringFilter {
    None,
    DataChange(DataChangeFilter),
    Event(EventFilter),
}

impl Default for MonitoringFilter {
    fn default() -> Self {
        MonitoringFilter::None
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReadValueId {
    pub node_id: NodeId,
    pub attribute_id: AttributeId,
    pub index_range: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitoringParameters {
    pub client_handle: u32,
    pub sampling_interval: f64,
    pub filter: MonitoringFilter,
    pub queue_size: u32,
    pub discard_oldest: bool,
}

impl Default for MonitoringParameters {
    fn default() -> Self {
        MonitoringParameters {
            client_handle: 0,
            sampling_interval: -1.0,
            filter: MonitoringFilter::None,
            queue_size: 1,
            discard_oldest: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitoredItemCreateRequest {
    pub item_to_monitor: ReadValueId,
    pub monitoring_mode: MonitoringMode,
    pub requested_parameters: MonitoringParameters,
}

impl MonitoredItemCreateRequest {
    pub fn new(
        item_to_monitor: ReadValueId,
        monitoring_mode: MonitoringMode,
        requested_parameters: MonitoringParameters,
    ) -> Self {
        Self {
            item_to_monitor,
            monitoring_mode,
            requested_parameters,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitoredItemCreateResult {
    pub status_code: StatusCode,
    pub monitored_item_id: u32,
    pub revised_sampling_interval: f64,
    pub revised_queue_size: u32,
}

impl MonitoredItemCreateResult {
    /// Result slot for an item that could not be created
    pub fn error(status_code: StatusCode) -> Self {
        Self {
            status_code,
            monitored_item_id: 0,
            revised_sampling_interval: 0.0,
            revised_queue_size: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitoredItemModifyRequest {
    pub monitored_item_id: u32,
    pub requested_parameters: MonitoringParameters,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitoredItemModifyResult {
    pub status_code: StatusCode,
    pub revised_sampling_interval: f64,
    pub revised_queue_size: u32,
}

impl MonitoredItemModifyResult {
    pub fn error(status_code: StatusCode) -> Self {
        Self {
            status_code,
            revised_sampling_interval: 0.0,
            revised_queue_size: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SetTriggeringResult {
    pub add_results: Vec<StatusCode>,
    pub remove_results: Vec<StatusCode>,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionAcknowledgement {
    pub subscription_id: u32,
    pub sequence_number: u32,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PublishRequest {
    pub subscription_acknowledgements: Option<Vec<SubscriptionAcknowledgement>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublishResponse {
    pub subscription_id: u32,
    pub available_sequence_numbers: Option<Vec<u32>>,
    pub more_notifications: bool,
    pub notification_message: NotificationMessage,
    pub results: Option<Vec<StatusCode>>,
}

#[derive(Debug, Copy, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateSubscriptionRequest {
    pub requested_publishing_interval: f64,
    pub requested_lifetime_count: u32,
    pub requested_max_keep_alive_count: u32,
    pub max_notifications_per_publish: u32,
    pub publishing_enabled: bool,
    pub priority: u8,
}

impl Default for CreateSubscriptionRequest {
    fn default() -> Self {
        CreateSubscriptionRequest {
            requested_publishing_interval: 1000.0,
            requested_lifetime_count: 60,
            requested_max_keep_alive_count: 10,
            max_notifications_per_publish: 0,
            publishing_enabled: true,
            priority: 0,
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateSubscriptionResponse {
    pub subscription_id: u32,
    pub revised_publishing_interval: f64,
    pub revised_lifetime_count: u32,
    pub revised_max_keep_alive_count: u32,
}

#[derive(Debug, Copy, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModifySubscriptionRequest {
    pub subscription_id: u32,
    pub requested_publishing_interval: f64,
    pub requested_lifetime_count: u32,
    pub requested_max_keep_alive_count: u32,
    pub max_notifications_per_publish: u32,
    pub priority: u8,
}

#[derive(Debug, Copy, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModifySubscriptionResponse {
    pub revised_publishing_interval: f64,
    pub revised_lifetime_count: u32,
    pub revised_max_keep_alive_count: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferResult {
    pub status_code: StatusCode,
    pub available_sequence_numbers: Option<Vec<u32>>,
}

impl TransferResult {
    pub fn error(status_code: StatusCode) -> Self {
        Self {
            status_code,
            available_sequence_numbers: None,
        }
    }
}
