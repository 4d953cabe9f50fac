// OPCUA for Rust
// SPDX-License-Identifier: MPL-2.0
// Copyright (C) 2017-2024 Adam Lock

//! Monitored items as seen by a subscription, and `QueuedMonitoredItem`, a ready made
//! implementation node managers can hand out.

use std::collections::VecDeque;

use crate::{
    server::events::Event,
    sync::Mutex,
    types::{
        AttributeId, DataChangeFilter, DataChangeTrigger, DataValue, DateTime, EventFieldList,
        EventFilter, MonitoredItemCreateRequest, MonitoredItemModifyRequest,
        MonitoredItemModifyResult, MonitoredItemNotification, MonitoringFilter, MonitoringMode,
        ReadValueId, StatusCode, TimestampsToReturn, Variant,
    },
};

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum MonitoredItemKind {
    DataChange,
    Event,
}

/// A monitored item owned by a subscription. Items are created by the node manager, the
/// subscription only polls them for readiness and drains their notifications. All methods
/// take `&self` since items are shared between the subscription and the node manager that
/// feeds them values.
pub trait MonitoredItem: Send + Sync {
    fn id(&self) -> u32;

    fn client_handle(&self) -> u32;

    fn kind(&self) -> MonitoredItemKind;

    fn monitoring_mode(&self) -> MonitoringMode;

    /// Changes the monitoring mode. Switching to `Disabled` discards queued notifications.
    fn set_monitoring_mode(&self, monitoring_mode: MonitoringMode);

    fn sampling_interval(&self) -> f64;

    fn queue_size(&self) -> usize;

    /// True if the item has something to report on the next publish: queued notifications in
    /// reporting mode, queued notifications after being triggered, or a pending resend.
    fn is_ready_to_publish(&self) -> bool;

    /// True if the item sampled a new value since the flag was last cleared, and so should
    /// trigger the items linked to it.
    fn is_ready_to_trigger(&self) -> bool;

    fn clear_ready_to_trigger(&self);

    /// Called on an item linked to a triggering item that fired. Returns true if the item now
    /// has something to report.
    fn set_triggered(&self) -> bool;

    fn is_resend_data(&self) -> bool;

    /// Requeue the last value so it is reported again on the next publish.
    fn set_resend_data(&self);

    /// Moves the queued notifications of the item onto the end of the supplied queues.
    /// Returns true if anything was moved.
    fn publish(
        &self,
        data_changes: &mut VecDeque<MonitoredItemNotification>,
        events: &mut VecDeque<EventFieldList>,
    ) -> bool;

    /// Queue an event on the item. Data change items ignore events.
    fn queue_event(&self, event: &dyn Event) -> bool;
}

/// Takes the requested sampling interval value supplied by client and ensures it is within
/// the range supported by the server
pub fn sanitize_sampling_interval(
    min_sampling_interval_ms: f64,
    publishing_interval_ms: f64,
    requested_sampling_interval: f64,
) -> f64 {
    if requested_sampling_interval < 0.0 {
        // Any negative sampling interval is treated as -1
        // -1 means monitored item's sampling interval defaults to the subscription's publishing interval
        publishing_interval_ms
    } else if requested_sampling_interval < min_sampling_interval_ms {
        min_sampling_interval_ms
    } else {
        requested_sampling_interval
    }
}

/// Takes the requested queue size and ensures it is within the range supported by the server
pub fn sanitize_queue_size(max_queue_size: usize, requested_queue_size: usize) -> usize {
    if requested_queue_size <= 1 {
        1
    } else if max_queue_size > 0 && requested_queue_size > max_queue_size {
        max_queue_size
    } else {
        requested_queue_size
    }
}

#[derive(Debug, Clone)]
enum FilterType {
    None,
    DataChangeFilter(DataChangeFilter),
    EventFilter(EventFilter),
}

impl FilterType {
    fn from_filter(kind: MonitoredItemKind, filter: &MonitoringFilter) -> Result<Self, StatusCode> {
        match (kind, filter) {
            (MonitoredItemKind::DataChange, MonitoringFilter::None) => Ok(FilterType::None),
            (MonitoredItemKind::DataChange, MonitoringFilter::DataChange(f)) => {
                Ok(FilterType::DataChangeFilter(f.clone()))
            }
            (MonitoredItemKind::Event, MonitoringFilter::Event(f)) => {
                if f.select_clauses.is_empty() {
                    error!("Event filter has no select clauses");
                    Err(StatusCode::BadMonitoredItemFilterInvalid)
                } else {
                    Ok(FilterType::EventFilter(f.clone()))
                }
            }
            (MonitoredItemKind::DataChange, MonitoringFilter::Event(_)) => {
                error!("Event filter supplied for a data change monitored item");
                Err(StatusCode::BadFilterNotAllowed)
            }
            (MonitoredItemKind::Event, _) => {
                error!("Event monitored item requires an event filter");
                Err(StatusCode::BadMonitoredItemFilterInvalid)
            }
        }
    }
}

#[derive(Debug)]
enum Notification {
    DataChange(MonitoredItemNotification),
    Event(EventFieldList),
}

#[derive(Debug)]
struct QueuedState {
    monitoring_mode: MonitoringMode,
    client_handle: u32,
    sampling_interval: f64,
    filter: FilterType,
    discard_oldest: bool,
    queue_size: usize,
    notification_queue: VecDeque<Notification>,
    timestamps_to_return: TimestampsToReturn,
    last_data_value: Option<DataValue>,
    ready_to_trigger: bool,
    triggered: bool,
    resend_data: bool,
}

/// A monitored item that queues the values and events pushed into it by a node manager, with
/// a bounded queue that discards the oldest or newest entry on overflow.
#[derive(Debug)]
pub struct QueuedMonitoredItem {
    id: u32,
    item_to_monitor: ReadValueId,
    kind: MonitoredItemKind,
    state: Mutex<QueuedState>,
}

impl QueuedMonitoredItem {
    /// Creates the item from a client request. The sampling interval and queue size should
    /// already be sanitized by the caller.
    pub fn new(
        id: u32,
        request: &MonitoredItemCreateRequest,
        timestamps_to_return: TimestampsToReturn,
        sampling_interval: f64,
        queue_size: usize,
    ) -> Result<Self, StatusCode> {
        let kind = match request.item_to_monitor.attribute_id {
            AttributeId::EventNotifier => MonitoredItemKind::Event,
            AttributeId::Value => MonitoredItemKind::DataChange,
        };
        let filter = FilterType::from_filter(kind, &request.requested_parameters.filter)?;
        Ok(Self {
            id,
            item_to_monitor: request.item_to_monitor.clone(),
            kind,
            state: Mutex::new(QueuedState {
                monitoring_mode: request.monitoring_mode,
                client_handle: request.requested_parameters.client_handle,
                sampling_interval,
                filter,
                discard_oldest: request.requested_parameters.discard_oldest,
                queue_size: queue_size.max(1),
                notification_queue: VecDeque::new(),
                timestamps_to_return,
                last_data_value: None,
                ready_to_trigger: false,
                triggered: false,
                resend_data: false,
            }),
        })
    }

    pub fn item_to_monitor(&self) -> &ReadValueId {
        &self.item_to_monitor
    }

    /// Modifies the existing item with the values of the modify request.
    pub fn modify(
        &self,
        timestamps_to_return: TimestampsToReturn,
        request: &MonitoredItemModifyRequest,
        sampling_interval: f64,
        queue_size: usize,
    ) -> MonitoredItemModifyResult {
        let filter = match FilterType::from_filter(self.kind, &request.requested_parameters.filter)
        {
            Ok(filter) => filter,
            Err(e) => return MonitoredItemModifyResult::error(e),
        };
        let mut state = trace_lock!(self.state);
        state.filter = filter;
        state.timestamps_to_return = timestamps_to_return;
        state.sampling_interval = sampling_interval;
        state.queue_size = queue_size.max(1);
        state.client_handle = request.requested_parameters.client_handle;
        state.discard_oldest = request.requested_parameters.discard_oldest;

        // Shrink the notification queue to the new threshold
        while state.notification_queue.len() > state.queue_size {
            if state.discard_oldest {
                let _ = state.notification_queue.pop_front();
            } else {
                let _ = state.notification_queue.pop_back();
            }
        }
        MonitoredItemModifyResult {
            status_code: StatusCode::Good,
            revised_sampling_interval: state.sampling_interval,
            revised_queue_size: state.queue_size as u32,
        }
    }

    /// Pushes a new sample of the monitored value into the item. Returns true if the sample
    /// passed the filter and was queued.
    pub fn notify_data_value(&self, mut value: DataValue) -> bool {
        if self.kind != MonitoredItemKind::DataChange {
            return false;
        }
        let mut state = trace_lock!(self.state);
        if state.monitoring_mode == MonitoringMode::Disabled {
            return false;
        }

        let data_change = match (&state.last_data_value, &state.filter) {
            (Some(last_dv), FilterType::DataChangeFilter(filter)) => {
                Self::is_changed(filter, last_dv, &value)
            }
            (Some(last_dv), _) => last_dv.value_or_status_changed(&value),
            (None, _) => true,
        };
        if !data_change {
            return false;
        }

        state.last_data_value = Some(value.clone());
        Self::filter_timestamps(state.timestamps_to_return, &mut value);

        let client_handle = state.client_handle;
        Self::enqueue_notification(
            &mut state,
            Notification::DataChange(MonitoredItemNotification {
                client_handle,
                value,
            }),
        );
        true
    }

    /// Pushes an event into the item, selecting the fields named by its event filter.
    pub fn notify_event(&self, event: &dyn Event) -> bool {
        let mut state = trace_lock!(self.state);
        if state.monitoring_mode == MonitoringMode::Disabled {
            return false;
        }
        let FilterType::EventFilter(filter) = &state.filter else {
            return false;
        };
        let event_fields: Vec<Variant> = filter
            .select_clauses
            .iter()
            .map(|c| event.get_field(c))
            .collect();
        let client_handle = state.client_handle;
        Self::enqueue_notification(
            &mut state,
            Notification::Event(EventFieldList {
                client_handle,
                event_fields: Some(event_fields),
            }),
        );
        true
    }

    fn is_changed(filter: &DataChangeFilter, old: &DataValue, new: &DataValue) -> bool {
        match filter.trigger {
            DataChangeTrigger::Status => old.status() != new.status(),
            DataChangeTrigger::StatusValue => old.value_or_status_changed(new),
            DataChangeTrigger::StatusValueTimestamp => {
                old.value_or_status_changed(new) || old.source_timestamp != new.source_timestamp
            }
        }
    }

    fn filter_timestamps(timestamps_to_return: TimestampsToReturn, value: &mut DataValue) {
        match timestamps_to_return {
            TimestampsToReturn::Neither | TimestampsToReturn::Invalid => {
                value.source_timestamp = None;
                value.server_timestamp = None;
            }
            TimestampsToReturn::Server => {
                value.source_timestamp = None;
                if value.server_timestamp.is_none() {
                    value.server_timestamp = Some(DateTime::now());
                }
            }
            TimestampsToReturn::Source => {
                value.server_timestamp = None;
            }
            TimestampsToReturn::Both => {
                // DO NOTHING
            }
        }
    }

    fn enqueue_notification(state: &mut QueuedState, mut notification: Notification) {
        state.ready_to_trigger = true;
        let overflow = state.notification_queue.len() >= state.queue_size;
        if overflow {
            if state.discard_oldest {
                state.notification_queue.pop_front();
            } else {
                state.notification_queue.pop_back();
            }
            // Queue size 1 never reports overflow
            if state.queue_size > 1 {
                if let Notification::DataChange(n) = &mut notification {
                    n.value.status = Some(n.value.status() | StatusCode::OVERFLOW);
                }
            }
        }
        state.notification_queue.push_back(notification);
    }
}

impl MonitoredItem for QueuedMonitoredItem {
    fn id(&self) -> u32 {
        self.id
    }

    fn client_handle(&self) -> u32 {
        trace_lock!(self.state).client_handle
    }

    fn kind(&self) -> MonitoredItemKind {
        self.kind
    }

    fn monitoring_mode(&self) -> MonitoringMode {
        trace_lock!(self.state).monitoring_mode
    }

    fn set_monitoring_mode(&self, monitoring_mode: MonitoringMode) {
        let mut state = trace_lock!(self.state);
        if monitoring_mode == MonitoringMode::Disabled {
            state.notification_queue.clear();
            state.triggered = false;
            state.ready_to_trigger = false;
            state.resend_data = false;
        }
        state.monitoring_mode = monitoring_mode;
    }

    fn sampling_interval(&self) -> f64 {
        trace_lock!(self.state).sampling_interval
    }

    fn queue_size(&self) -> usize {
        trace_lock!(self.state).queue_size
    }

    fn is_ready_to_publish(&self) -> bool {
        let state = trace_lock!(self.state);
        if state.resend_data {
            return true;
        }
        if state.notification_queue.is_empty() {
            return false;
        }
        match state.monitoring_mode {
            MonitoringMode::Reporting => true,
            MonitoringMode::Sampling => state.triggered,
            MonitoringMode::Disabled => false,
        }
    }

    fn is_ready_to_trigger(&self) -> bool {
        let state = trace_lock!(self.state);
        state.ready_to_trigger && state.monitoring_mode != MonitoringMode::Disabled
    }

    fn clear_ready_to_trigger(&self) {
        trace_lock!(self.state).ready_to_trigger = false;
    }

    fn set_triggered(&self) -> bool {
        let mut state = trace_lock!(self.state);
        if state.monitoring_mode == MonitoringMode::Sampling
            && !state.notification_queue.is_empty()
        {
            state.triggered = true;
            true
        } else {
            false
        }
    }

    fn is_resend_data(&self) -> bool {
        trace_lock!(self.state).resend_data
    }

    fn set_resend_data(&self) {
        let mut state = trace_lock!(self.state);
        if state.monitoring_mode == MonitoringMode::Disabled {
            return;
        }
        let Some(mut value) = state.last_data_value.clone() else {
            return;
        };
        // Check if the last value is already enqueued
        let already_queued = state.notification_queue.iter().any(|n| match n {
            Notification::DataChange(it) => Some(&it.value) == state.last_data_value.as_ref(),
            _ => false,
        });
        if !already_queued {
            Self::filter_timestamps(state.timestamps_to_return, &mut value);
            let client_handle = state.client_handle;
            Self::enqueue_notification(
                &mut state,
                Notification::DataChange(MonitoredItemNotification {
                    client_handle,
                    value,
                }),
            );
        }
        state.resend_data = true;
    }

    fn publish(
        &self,
        data_changes: &mut VecDeque<MonitoredItemNotification>,
        events: &mut VecDeque<EventFieldList>,
    ) -> bool {
        let mut state = trace_lock!(self.state);
        state.resend_data = false;
        state.triggered = false;
        if state.monitoring_mode == MonitoringMode::Disabled {
            return false;
        }
        let mut any = false;
        while let Some(notification) = state.notification_queue.pop_front() {
            any = true;
            match notification {
                Notification::DataChange(n) => data_changes.push_back(n),
                Notification::Event(e) => events.push_back(e),
            }
        }
        any
    }

    fn queue_event(&self, event: &dyn Event) -> bool {
        self.notify_event(event)
    }
}
