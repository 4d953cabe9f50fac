// OPCUA for Rust
// SPDX-License-Identifier: MPL-2.0
// Copyright (C) 2017-2024 Adam Lock

//! The `NotificationMessage` and the notification payloads it carries. This is the one
//! structure whose shape clients depend upon, so its layout follows the OPC UA schema.

use crate::types::{
    data_value::DataValue, date_time::DateTime, status_code::StatusCode, variant::Variant,
};

/// A data change reported by one monitored item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitoredItemNotification {
    pub client_handle: u32,
    pub value: DataValue,
}

/// The selected fields of one event reported by one monitored item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventFieldList {
    pub client_handle: u32,
    pub event_fields: Option<Vec<Variant>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataChangeNotification {
    pub monitored_items: Option<Vec<MonitoredItemNotification>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventNotificationList {
    pub events: Option<Vec<EventFieldList>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusChangeNotification {
    pub status: StatusCode,
}

/// One element of the notification data of a message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum NotificationData {
    Events(EventNotificationList),
    DataChange(DataChangeNotification),
    StatusChange(StatusChangeNotification),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationMessage {
    pub sequence_number: u32,
    pub publish_time: DateTime,
    pub notification_data: Option<Vec<NotificationData>>,
}

impl NotificationMessage {
    /// Create a notification message which contains data change AND / OR events. Calling this with
    /// neither will panic. Notification data can have up to 2 elements to covers the case in
    /// table 158 where a subscription contains monitored items for events and data. The event
    /// batch always precedes the data change batch.
    pub fn data_change(
        sequence_number: u32,
        publish_time: DateTime,
        data_change_notifications: Vec<MonitoredItemNotification>,
        event_notifications: Vec<EventFieldList>,
    ) -> NotificationMessage {
        if data_change_notifications.is_empty() && event_notifications.is_empty() {
            panic!("No notifications supplied to data_change()");
        }

        let mut notification_data = Vec::with_capacity(2);
        if !event_notifications.is_empty() {
            let event_notification_list = EventNotificationList {
                events: Some(event_notifications),
            };
            trace!("event notification = {:?}", event_notification_list);
            notification_data.push(NotificationData::Events(event_notification_list));
        }
        if !data_change_notifications.is_empty() {
            let data_change_notification = DataChangeNotification {
                monitored_items: Some(data_change_notifications),
            };
            trace!("data change notification = {:?}", data_change_notification);
            notification_data.push(NotificationData::DataChange(data_change_notification));
        }

        NotificationMessage {
            sequence_number,
            publish_time,
            notification_data: Some(notification_data),
        }
    }

    /// Create a status change notification message
    pub fn status_change(
        sequence_number: u32,
        publish_time: DateTime,
        status: StatusCode,
    ) -> NotificationMessage {
        NotificationMessage {
            sequence_number,
            publish_time,
            notification_data: Some(vec![NotificationData::StatusChange(
                StatusChangeNotification { status },
            )]),
        }
    }

    /// Create a keep-alive notification message
    pub fn keep_alive(sequence_number: u32, publish_time: DateTime) -> NotificationMessage {
        NotificationMessage {
            sequence_number,
            publish_time,
            notification_data: None,
        }
    }

    /// Tests if the message carries no notification data at all
    pub fn is_keep_alive(&self) -> bool {
        self.notification_data
            .as_ref()
            .map_or(true, |data| data.is_empty())
    }

    /// Returns the status of a status change message
    pub fn status_change_status(&self) -> Option<StatusCode> {
        self.notification_data.as_ref().and_then(|data| {
            data.iter().find_map(|n| match n {
                NotificationData::StatusChange(s) => Some(s.status),
                _ => None,
            })
        })
    }

    /// Extract the data change and event notifications from the message. If there are none,
    /// the function will return `None`.
    pub fn notifications(
        &self,
    ) -> Option<(Vec<MonitoredItemNotification>, Vec<EventFieldList>)> {
        let notification_data = self.notification_data.as_ref()?;
        let mut data_changes = Vec::new();
        let mut events = Vec::new();
        for n in notification_data {
            match n {
                NotificationData::DataChange(d) => {
                    if let Some(ref items) = d.monitored_items {
                        data_changes.extend(items.iter().cloned());
                    }
                }
                NotificationData::Events(e) => {
                    if let Some(ref items) = e.events {
                        events.extend(items.iter().cloned());
                    }
                }
                NotificationData::StatusChange(_) => {
                    debug!("Ignoring a StatusChangeNotification");
                }
            }
        }
        if data_changes.is_empty() && events.is_empty() {
            None
        } else {
            Some((data_changes, events))
        }
    }

    /// The number of data change and event notifications carried by the message
    pub fn notification_count(&self) -> usize {
        self.notifications()
            .map_or(0, |(data_changes, events)| data_changes.len() + events.len())
    }
}
