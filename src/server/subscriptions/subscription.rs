// OPCUA for Rust
// SPDX-License-Identifier: MPL-2.0
// Copyright (C) 2017-2024 Adam Lock

use std::{
    collections::VecDeque,
    sync::Arc,
    time::{Duration, Instant},
};

use hashbrown::HashMap;

use crate::{
    core::handle::Handle,
    server::{
        diagnostics::SubscriptionDiagnostics,
        events::BaseEventType,
        monitored_item::{MonitoredItem, MonitoredItemKind},
        node_manager::NodeManager,
        session::{OperationContext, Session, UserSecurityKey},
    },
    sync::Mutex,
    types::{
        DateTime, EventFieldList, MonitoredItemCreateRequest, MonitoredItemCreateResult,
        MonitoredItemModifyRequest, MonitoredItemModifyResult, MonitoredItemNotification,
        MonitoringMode, NotificationMessage, SetTriggeringResult, StatusCode, TimestampsToReturn,
    },
};

/// The outcome of a publishing timer tick.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PublishingState {
    /// Nothing to send
    Idle,
    /// An earlier tick found something to send but no publish request has taken it yet
    WaitingForPublish,
    /// Notifications or a keep alive are ready to be matched to a publish request
    NotificationsAvailable,
    /// The lifetime count was reached. Reported once, the subscription must be deleted.
    Expired,
}

/// The negotiated parameters of a subscription.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct SubscriptionSettings {
    /// Publishing interval in milliseconds
    pub publishing_interval: f64,
    pub max_keep_alive_count: u32,
    pub max_lifetime_count: u32,
    /// Maximum number of notifications in one message, 0 for unlimited
    pub max_notifications_per_publish: u32,
    pub priority: u8,
    pub publishing_enabled: bool,
    /// Number of sent messages retained for republishing
    pub max_message_count: usize,
    /// Maximum number of monitored items, 0 for unlimited
    pub max_monitored_items: usize,
}

/// A message produced by `Subscription::publish`.
#[derive(Debug, Clone, PartialEq)]
pub struct PublishedMessage {
    pub message: NotificationMessage,
    /// True if further messages are queued and the subscription should be published again
    /// straight away
    pub more_notifications: bool,
    /// Sequence numbers of the sent messages still held for republishing
    pub available_sequence_numbers: Vec<u32>,
}

type NotificationBatch = (Vec<MonitoredItemNotification>, Vec<EventFieldList>);

struct SubscriptionInner {
    /// The owning session, `None` while the subscription is abandoned
    session: Option<Arc<Session>>,
    /// Identity of the current or last owner, checked on transfer
    owner: UserSecurityKey,
    settings: SubscriptionSettings,
    /// Ticks since the last message was sent, a keep alive is due once it reaches the max
    keep_alive_counter: u32,
    /// Ticks spent waiting for a publish request, the subscription expires once it reaches
    /// the max
    lifetime_counter: u32,
    publish_timer_expiry: Instant,
    waiting_for_publish: bool,
    expired: bool,
    deleted: bool,
    /// The next sequence number to be sent
    sequence_number: Handle,
    /// Retransmission cache. Messages at and after `last_sent_message` are produced but not
    /// yet sent.
    sent_messages: VecDeque<NotificationMessage>,
    last_sent_message: usize,
    monitored_items: HashMap<u32, Arc<dyn MonitoredItem>>,
    items_to_check: Vec<Arc<dyn MonitoredItem>>,
    items_to_publish: Vec<Arc<dyn MonitoredItem>>,
    /// Triggering item id to the items it triggers
    items_to_trigger: HashMap<u32, Vec<Arc<dyn MonitoredItem>>>,
    diagnostics: SubscriptionDiagnostics,
}

/// One subscription: its monitored items, its timing counters and its retransmission cache.
/// The subscription knows nothing about other subscriptions or about publish requests, it is
/// driven by `publish_timer_expired` and drained by `publish`.
pub struct Subscription {
    id: u32,
    node_manager: Arc<dyn NodeManager>,
    inner: Mutex<SubscriptionInner>,
}

fn interval_duration(publishing_interval: f64) -> Duration {
    Duration::from_nanos((publishing_interval.max(1.0) * 1_000_000.0).round() as u64)
}

impl SubscriptionInner {
    /// Moves the publish timer deadline forward by whole publishing intervals until it is in
    /// the future again.
    fn advance_publish_timer(&mut self, now: Instant) {
        let interval = interval_duration(self.settings.publishing_interval);
        let late_by = now.saturating_duration_since(self.publish_timer_expiry);
        let periods = late_by.as_nanos() / interval.as_nanos().max(1) + 1;
        self.publish_timer_expiry += interval * u32::try_from(periods).unwrap_or(u32::MAX);
    }

    fn restart_publish_timer(&mut self) {
        self.publish_timer_expiry =
            Instant::now() + interval_duration(self.settings.publishing_interval);
    }

    fn reset_counters(&mut self) {
        self.keep_alive_counter = 0;
        self.lifetime_counter = 0;
    }

    /// Moves items that are ready to report from the check list to the publish list. Items
    /// that sampled a new value trigger their linked items first, and since that can make an
    /// item already passed over ready, a second pass runs when anything was triggered.
    fn check_monitored_items(&mut self) {
        let items = std::mem::take(&mut self.items_to_check);
        let mut remaining = Vec::with_capacity(items.len());
        let mut triggered = false;
        for item in items {
            if item.is_ready_to_trigger() {
                if let Some(links) = self.items_to_trigger.get(&item.id()) {
                    for link in links {
                        if link.set_triggered() {
                            triggered = true;
                        }
                    }
                }
                item.clear_ready_to_trigger();
            }
            if item.is_ready_to_publish() {
                self.items_to_publish.push(item);
            } else {
                remaining.push(item);
            }
        }
        if triggered {
            let items = std::mem::take(&mut remaining);
            for item in items {
                if item.is_ready_to_publish() {
                    self.items_to_publish.push(item);
                } else {
                    remaining.push(item);
                }
            }
        }
        self.items_to_check = remaining;
    }

    /// Splits notifications into message sized batches. Events are placed ahead of data
    /// changes in every batch.
    fn batch_notifications(
        &self,
        mut data_changes: VecDeque<MonitoredItemNotification>,
        mut events: VecDeque<EventFieldList>,
    ) -> Vec<NotificationBatch> {
        let max = self.settings.max_notifications_per_publish as usize;
        let mut batches = Vec::new();
        while !data_changes.is_empty() || !events.is_empty() {
            if max == 0 {
                batches.push((data_changes.drain(..).collect(), events.drain(..).collect()));
            } else {
                let event_count = events.len().min(max);
                let batch_events: Vec<_> = events.drain(..event_count).collect();
                let data_change_count = data_changes.len().min(max - event_count);
                let batch_data_changes: Vec<_> = data_changes.drain(..data_change_count).collect();
                batches.push((batch_data_changes, batch_events));
            }
        }
        batches
    }

    fn available_sequence_numbers(&self) -> Vec<u32> {
        self.sent_messages
            .iter()
            .take(self.last_sent_message)
            .map(|m| m.sequence_number)
            .collect()
    }

    /// Takes the next produced but unsent message, if any.
    fn next_queued_message(&mut self) -> Option<PublishedMessage> {
        let message = self.sent_messages.get(self.last_sent_message)?.clone();
        self.last_sent_message += 1;
        let more_notifications = self.last_sent_message < self.sent_messages.len();
        self.waiting_for_publish = more_notifications;
        self.reset_counters();
        Some(PublishedMessage {
            message,
            more_notifications,
            available_sequence_numbers: self.available_sequence_numbers(),
        })
    }

    fn remove_monitored_item(&mut self, id: u32) -> Option<Arc<dyn MonitoredItem>> {
        let item = self.monitored_items.remove(&id)?;
        self.items_to_check.retain(|i| i.id() != id);
        self.items_to_publish.retain(|i| i.id() != id);
        self.items_to_trigger.remove(&id);
        self.items_to_trigger.retain(|_, links| {
            links.retain(|i| i.id() != id);
            !links.is_empty()
        });
        Some(item)
    }

    fn validate_session(&self, context: &OperationContext) -> Result<(), StatusCode> {
        match self.session {
            Some(ref session) if session.session_id() == context.session_id() => Ok(()),
            _ => Err(StatusCode::BadSubscriptionIdInvalid),
        }
    }
}

impl Subscription {
    pub fn new(
        id: u32,
        session: Arc<Session>,
        node_manager: Arc<dyn NodeManager>,
        settings: SubscriptionSettings,
    ) -> Self {
        let owner = session.security_key().clone();
        let diagnostics = SubscriptionDiagnostics {
            subscription_id: id,
            ..Default::default()
        };
        Self {
            id,
            node_manager,
            inner: Mutex::new(SubscriptionInner {
                session: Some(session),
                owner,
                settings,
                keep_alive_counter: 0,
                lifetime_counter: 0,
                publish_timer_expiry: Instant::now()
                    + interval_duration(settings.publishing_interval),
                waiting_for_publish: false,
                expired: false,
                deleted: false,
                sequence_number: Handle::new(1),
                sent_messages: VecDeque::with_capacity(settings.max_message_count),
                last_sent_message: 0,
                monitored_items: HashMap::new(),
                items_to_check: Vec::new(),
                items_to_publish: Vec::new(),
                items_to_trigger: HashMap::new(),
                diagnostics,
            }),
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn session(&self) -> Option<Arc<Session>> {
        trace_lock!(self.inner).session.clone()
    }

    pub fn session_id(&self) -> Option<u32> {
        trace_lock!(self.inner)
            .session
            .as_ref()
            .map(|s| s.session_id())
    }

    /// The identity of the current owner, or of the last owner of an abandoned subscription
    pub fn owner(&self) -> UserSecurityKey {
        trace_lock!(self.inner).owner.clone()
    }

    pub fn priority(&self) -> u8 {
        trace_lock!(self.inner).settings.priority
    }

    pub fn publishing_interval(&self) -> f64 {
        trace_lock!(self.inner).settings.publishing_interval
    }

    pub fn settings(&self) -> SubscriptionSettings {
        trace_lock!(self.inner).settings
    }

    pub fn is_expired(&self) -> bool {
        trace_lock!(self.inner).expired
    }

    pub fn monitored_item_count(&self) -> usize {
        trace_lock!(self.inner).monitored_items.len()
    }

    /// Checks that the request came from the session that owns the subscription.
    pub fn validate_session(&self, context: &OperationContext) -> Result<(), StatusCode> {
        trace_lock!(self.inner).validate_session(context)
    }

    #[cfg(test)]
    pub(crate) fn set_publish_timer_expiry(&self, expiry: Instant) {
        trace_lock!(self.inner).publish_timer_expiry = expiry;
    }

    pub fn publish_timer_expired(&self) -> PublishingState {
        self.publish_timer_expired_at(Instant::now())
    }

    /// Advances the state machine of the subscription. Must be called at least once per
    /// publishing interval, calls before the publish timer deadline have no effect.
    pub fn publish_timer_expired_at(&self, now: Instant) -> PublishingState {
        let mut inner = trace_lock!(self.inner);
        if inner.expired {
            return PublishingState::Idle;
        }
        if inner.publish_timer_expiry > now {
            return if inner.waiting_for_publish {
                PublishingState::WaitingForPublish
            } else {
                PublishingState::Idle
            };
        }
        inner.advance_publish_timer(now);

        if inner.waiting_for_publish {
            inner.lifetime_counter += 1;
            trace!(
                "Subscription {} lifetime counter {} of {}",
                self.id,
                inner.lifetime_counter,
                inner.settings.max_lifetime_count
            );
            if inner.lifetime_counter >= inner.settings.max_lifetime_count {
                info!(
                    "Subscription {} has expired after {} publishing intervals without a publish request",
                    self.id, inner.lifetime_counter
                );
                inner.expired = true;
                inner.waiting_for_publish = false;
                return PublishingState::Expired;
            }
        }

        inner.keep_alive_counter = inner.keep_alive_counter.saturating_add(1);

        if inner.settings.publishing_enabled && inner.session.is_some() {
            inner.check_monitored_items();
            if !inner.items_to_publish.is_empty() {
                inner.waiting_for_publish = true;
                return PublishingState::NotificationsAvailable;
            }
        }

        if inner.keep_alive_counter >= inner.settings.max_keep_alive_count {
            inner.waiting_for_publish = true;
            return PublishingState::NotificationsAvailable;
        }

        PublishingState::Idle
    }

    /// Produces the next message of the subscription. Returns `None` if there is nothing to
    /// send, which happens when a tick reported notifications but the monitored items yielded
    /// none. The caller should then wait for the next tick.
    pub fn publish(
        &self,
        context: &OperationContext,
    ) -> Result<Option<PublishedMessage>, StatusCode> {
        let mut inner = trace_lock!(self.inner);
        if inner.deleted {
            return Err(StatusCode::BadSubscriptionIdInvalid);
        }
        if inner.expired {
            return Ok(None);
        }
        inner.diagnostics.publish_request_count += 1;

        let keep_alive_if_no_data =
            inner.keep_alive_counter >= inner.settings.max_keep_alive_count;

        // Messages produced by an earlier publish go out first
        if let Some(published) = inner.next_queued_message() {
            trace!(
                "Subscription {} sending queued message {}",
                self.id,
                published.message.sequence_number
            );
            return Ok(Some(published));
        }

        let mut data_changes = VecDeque::new();
        let mut events = VecDeque::new();
        let items = std::mem::take(&mut inner.items_to_publish);
        for item in items {
            item.publish(&mut data_changes, &mut events);
            inner.items_to_check.push(item);
        }
        inner.diagnostics.data_change_notifications_count += data_changes.len() as u32;
        inner.diagnostics.event_notifications_count += events.len() as u32;
        inner.diagnostics.notifications_count += (data_changes.len() + events.len()) as u32;

        let batches = inner.batch_notifications(data_changes, events);

        if batches.is_empty() {
            if !keep_alive_if_no_data {
                error!(
                    "Subscription {} has monitored items queued but no notifications",
                    self.id
                );
                inner.waiting_for_publish = false;
                return Ok(None);
            }
            // Keep alive carries the next sequence number without consuming it
            let message =
                NotificationMessage::keep_alive(inner.sequence_number.peek(), DateTime::now());
            debug!(
                "Subscription {} sending keep alive {}",
                self.id, message.sequence_number
            );
            inner.waiting_for_publish = false;
            inner.reset_counters();
            return Ok(Some(PublishedMessage {
                message,
                more_notifications: false,
                available_sequence_numbers: inner.available_sequence_numbers(),
            }));
        }

        let publish_time = DateTime::now();
        for (data_changes, events) in batches {
            let sequence_number = inner.sequence_number.next();
            let message =
                NotificationMessage::data_change(sequence_number, publish_time, data_changes, events);
            inner.sent_messages.push_back(message);
        }

        // Evict the oldest messages, sent or not
        let max_message_count = inner.settings.max_message_count.max(1);
        let overflow = inner.sent_messages.len().saturating_sub(max_message_count);
        if overflow > 0 {
            warn!(
                "Subscription {} retransmission queue overflow, discarding {} oldest messages",
                self.id, overflow
            );
            inner.sent_messages.drain(..overflow);
            inner.last_sent_message = inner.last_sent_message.saturating_sub(overflow);
            inner.diagnostics.discarded_message_count += overflow as u32;
        }

        inner
            .next_queued_message()
            .map(Some)
            .ok_or(StatusCode::BadInternalError)
    }

    /// Called when the subscription expired. Marks it expired and returns the status message
    /// to send to the owning session.
    pub fn publish_timeout(&self) -> NotificationMessage {
        let mut inner = trace_lock!(self.inner);
        inner.expired = true;
        inner.waiting_for_publish = false;
        NotificationMessage::status_change(
            inner.sequence_number.peek(),
            DateTime::now(),
            StatusCode::BadTimeout,
        )
    }

    /// Returns the status message telling the previous owning session that the subscription
    /// was transferred away from it.
    pub fn subscription_transferred(&self) -> NotificationMessage {
        let inner = trace_lock!(self.inner);
        NotificationMessage::status_change(
            inner.sequence_number.peek(),
            DateTime::now(),
            StatusCode::GoodSubscriptionTransferred,
        )
    }

    /// Removes an acknowledged message from the retransmission cache.
    pub fn acknowledge(&self, sequence_number: u32) -> Result<(), StatusCode> {
        if sequence_number == 0 {
            return Err(StatusCode::BadSequenceNumberInvalid);
        }
        let mut inner = trace_lock!(self.inner);
        let Some(idx) = inner
            .sent_messages
            .iter()
            .position(|m| m.sequence_number == sequence_number)
        else {
            debug!(
                "Subscription {} cannot acknowledge unknown sequence number {}",
                self.id, sequence_number
            );
            return Err(StatusCode::BadSequenceNumberUnknown);
        };
        inner.sent_messages.remove(idx);
        if idx < inner.last_sent_message {
            inner.last_sent_message -= 1;
        }
        inner.lifetime_counter = 0;
        Ok(())
    }

    /// Returns a copy of a message from the retransmission cache.
    pub fn republish(&self, sequence_number: u32) -> Result<NotificationMessage, StatusCode> {
        let mut inner = trace_lock!(self.inner);
        inner.diagnostics.republish_request_count += 1;
        inner.lifetime_counter = 0;
        let message = inner
            .sent_messages
            .iter()
            .find(|m| m.sequence_number == sequence_number)
            .cloned()
            .ok_or(StatusCode::BadMessageNotAvailable)?;
        inner.diagnostics.republish_message_count += 1;
        Ok(message)
    }

    pub fn available_sequence_numbers(&self) -> Vec<u32> {
        trace_lock!(self.inner).available_sequence_numbers()
    }

    /// Applies renegotiated parameters. Counters and the publish timer restart.
    pub fn modify(
        &self,
        publishing_interval: f64,
        max_keep_alive_count: u32,
        max_lifetime_count: u32,
        max_notifications_per_publish: u32,
        priority: u8,
    ) {
        let mut inner = trace_lock!(self.inner);
        inner.settings.publishing_interval = publishing_interval;
        inner.settings.max_keep_alive_count = max_keep_alive_count;
        inner.settings.max_lifetime_count = max_lifetime_count;
        inner.settings.max_notifications_per_publish = max_notifications_per_publish;
        inner.settings.priority = priority;
        inner.reset_counters();
        inner.restart_publish_timer();
        inner.diagnostics.modify_count += 1;
    }

    pub fn set_publishing_mode(&self, publishing_enabled: bool) {
        let mut inner = trace_lock!(self.inner);
        if inner.settings.publishing_enabled != publishing_enabled {
            if publishing_enabled {
                inner.diagnostics.enable_count += 1;
            } else {
                inner.diagnostics.disable_count += 1;
            }
        }
        inner.settings.publishing_enabled = publishing_enabled;
        inner.lifetime_counter = 0;
    }

    pub fn create_monitored_items(
        &self,
        context: &OperationContext,
        timestamps_to_return: TimestampsToReturn,
        requests: &[MonitoredItemCreateRequest],
    ) -> Result<Vec<MonitoredItemCreateResult>, StatusCode> {
        let mut inner = trace_lock!(self.inner);
        inner.validate_session(context)?;
        if requests.is_empty() {
            return Err(StatusCode::BadNothingToDo);
        }

        let capacity = if inner.settings.max_monitored_items == 0 {
            requests.len()
        } else {
            inner
                .settings
                .max_monitored_items
                .saturating_sub(inner.monitored_items.len())
        };
        let accepted = requests.len().min(capacity);

        let created = if accepted > 0 {
            self.node_manager.create_monitored_items(
                context,
                self.id,
                inner.settings.publishing_interval,
                timestamps_to_return,
                &requests[..accepted],
            )
        } else {
            Vec::new()
        };

        let mut results = Vec::with_capacity(requests.len());
        for result in created {
            match result {
                Ok(item) => {
                    let id = item.id();
                    results.push(MonitoredItemCreateResult {
                        status_code: StatusCode::Good,
                        monitored_item_id: id,
                        revised_sampling_interval: item.sampling_interval(),
                        revised_queue_size: item.queue_size() as u32,
                    });
                    inner.items_to_check.push(item.clone());
                    if let Some(old) = inner.monitored_items.insert(id, item) {
                        error!(
                            "Node manager reused monitored item id {} in subscription {}",
                            old.id(),
                            self.id
                        );
                    }
                }
                Err(status_code) => results.push(MonitoredItemCreateResult::error(status_code)),
            }
        }
        // Anything the node manager did not answer for, or over the limit
        while results.len() < requests.len() {
            let status_code = if results.len() < accepted {
                StatusCode::BadInternalError
            } else {
                StatusCode::BadTooManyMonitoredItems
            };
            results.push(MonitoredItemCreateResult::error(status_code));
        }
        debug!(
            "Subscription {} now has {} monitored items",
            self.id,
            inner.monitored_items.len()
        );
        Ok(results)
    }

    pub fn modify_monitored_items(
        &self,
        context: &OperationContext,
        timestamps_to_return: TimestampsToReturn,
        requests: &[MonitoredItemModifyRequest],
    ) -> Result<Vec<MonitoredItemModifyResult>, StatusCode> {
        let inner = trace_lock!(self.inner);
        inner.validate_session(context)?;
        if requests.is_empty() {
            return Err(StatusCode::BadNothingToDo);
        }
        let mut results = vec![None; requests.len()];
        let mut to_modify = Vec::with_capacity(requests.len());
        let mut positions = Vec::with_capacity(requests.len());
        for (idx, request) in requests.iter().enumerate() {
            match inner.monitored_items.get(&request.monitored_item_id) {
                Some(item) => {
                    to_modify.push((item.clone(), request.clone()));
                    positions.push(idx);
                }
                None => {
                    results[idx] = Some(MonitoredItemModifyResult::error(
                        StatusCode::BadMonitoredItemIdInvalid,
                    ))
                }
            }
        }
        if !to_modify.is_empty() {
            let modified = self.node_manager.modify_monitored_items(
                context,
                self.id,
                inner.settings.publishing_interval,
                timestamps_to_return,
                &to_modify,
            );
            for (idx, result) in positions.into_iter().zip(modified) {
                results[idx] = Some(result);
            }
        }
        Ok(results
            .into_iter()
            .map(|r| r.unwrap_or_else(|| MonitoredItemModifyResult::error(StatusCode::BadInternalError)))
            .collect())
    }

    pub fn delete_monitored_items(
        &self,
        context: &OperationContext,
        ids: &[u32],
    ) -> Result<Vec<StatusCode>, StatusCode> {
        let mut inner = trace_lock!(self.inner);
        inner.validate_session(context)?;
        if ids.is_empty() {
            return Err(StatusCode::BadNothingToDo);
        }
        let mut results = vec![StatusCode::BadMonitoredItemIdInvalid; ids.len()];
        let mut removed = Vec::with_capacity(ids.len());
        let mut positions = Vec::with_capacity(ids.len());
        for (idx, id) in ids.iter().enumerate() {
            if let Some(item) = inner.remove_monitored_item(*id) {
                removed.push(item);
                positions.push(idx);
            }
        }
        if !removed.is_empty() {
            let deleted =
                self.node_manager
                    .delete_monitored_items(Some(context), self.id, &removed);
            for (idx, status) in positions.into_iter().zip(deleted) {
                results[idx] = status;
            }
        }
        Ok(results)
    }

    pub fn set_monitoring_mode(
        &self,
        context: &OperationContext,
        monitoring_mode: MonitoringMode,
        ids: &[u32],
    ) -> Result<Vec<StatusCode>, StatusCode> {
        let inner = trace_lock!(self.inner);
        inner.validate_session(context)?;
        if ids.is_empty() {
            return Err(StatusCode::BadNothingToDo);
        }
        let mut results = vec![StatusCode::BadMonitoredItemIdInvalid; ids.len()];
        let mut items = Vec::with_capacity(ids.len());
        let mut positions = Vec::with_capacity(ids.len());
        for (idx, id) in ids.iter().enumerate() {
            if let Some(item) = inner.monitored_items.get(id) {
                items.push(item.clone());
                positions.push(idx);
            }
        }
        if !items.is_empty() {
            let statuses =
                self.node_manager
                    .set_monitoring_mode(context, self.id, monitoring_mode, &items);
            for (idx, status) in positions.into_iter().zip(statuses) {
                results[idx] = status;
            }
        }
        Ok(results)
    }

    /// Adds and removes links from a triggering item to the items it triggers. Removes are
    /// processed before adds.
    pub fn set_triggering(
        &self,
        context: &OperationContext,
        triggering_item_id: u32,
        links_to_add: &[u32],
        links_to_remove: &[u32],
    ) -> Result<SetTriggeringResult, StatusCode> {
        let mut inner = trace_lock!(self.inner);
        inner.validate_session(context)?;
        if links_to_add.is_empty() && links_to_remove.is_empty() {
            return Err(StatusCode::BadNothingToDo);
        }
        if !inner.monitored_items.contains_key(&triggering_item_id) {
            return Err(StatusCode::BadMonitoredItemIdInvalid);
        }

        let mut links = inner
            .items_to_trigger
            .remove(&triggering_item_id)
            .unwrap_or_default();

        let remove_results = links_to_remove
            .iter()
            .map(|id| {
                let before = links.len();
                links.retain(|i| i.id() != *id);
                if links.len() < before {
                    StatusCode::Good
                } else {
                    StatusCode::BadMonitoredItemIdInvalid
                }
            })
            .collect();

        let add_results = links_to_add
            .iter()
            .map(|id| match inner.monitored_items.get(id) {
                Some(item) => {
                    if !links.iter().any(|i| i.id() == *id) {
                        links.push(item.clone());
                    }
                    StatusCode::Good
                }
                None => StatusCode::BadMonitoredItemIdInvalid,
            })
            .collect();

        if !links.is_empty() {
            inner.items_to_trigger.insert(triggering_item_id, links);
        }

        Ok(SetTriggeringResult {
            add_results,
            remove_results,
        })
    }

    /// Checks a condition refresh can run on the subscription. An item id of 0 refreshes the
    /// whole subscription, otherwise the id must name an event item.
    pub fn validate_condition_refresh(&self, monitored_item_id: u32) -> Result<(), StatusCode> {
        let inner = trace_lock!(self.inner);
        if inner.expired {
            return Err(StatusCode::BadSubscriptionIdInvalid);
        }
        if monitored_item_id == 0 {
            return Ok(());
        }
        match inner.monitored_items.get(&monitored_item_id) {
            Some(item) if item.kind() == MonitoredItemKind::Event => Ok(()),
            _ => Err(StatusCode::BadMonitoredItemIdInvalid),
        }
    }

    /// Runs a condition refresh. The event items are sent a refresh start event, then the node
    /// manager queues the current conditions, then a refresh end event follows.
    pub fn condition_refresh(
        &self,
        context: &OperationContext,
        monitored_item_id: u32,
    ) -> Result<(), StatusCode> {
        let inner = trace_lock!(self.inner);
        let items: Vec<_> = if monitored_item_id == 0 {
            inner
                .monitored_items
                .values()
                .filter(|i| i.kind() == MonitoredItemKind::Event)
                .cloned()
                .collect()
        } else {
            match inner.monitored_items.get(&monitored_item_id) {
                Some(item) if item.kind() == MonitoredItemKind::Event => vec![item.clone()],
                _ => return Err(StatusCode::BadMonitoredItemIdInvalid),
            }
        };

        let start = BaseEventType::refresh_start();
        items.iter().for_each(|i| {
            i.queue_event(&start);
        });
        let result = self.node_manager.condition_refresh(context, self.id, &items);
        let end = BaseEventType::refresh_end();
        items.iter().for_each(|i| {
            i.queue_event(&end);
        });
        if let Err(e) = result {
            error!(
                "Condition refresh of subscription {} failed, {}",
                self.id, e
            );
        }
        result
    }

    /// Hands the subscription to another session. The retransmission cache is kept so the new
    /// session can republish. Returns the sequence numbers available for republishing.
    pub fn transfer_session(
        &self,
        context: &OperationContext,
        session: Arc<Session>,
        send_initial_values: bool,
    ) -> Vec<u32> {
        let mut inner = trace_lock!(self.inner);
        inner.owner = session.security_key().clone();
        inner.session = Some(session);
        inner.lifetime_counter = 0;
        inner.diagnostics.transfer_request_count += 1;
        let items: Vec<_> = inner.monitored_items.values().cloned().collect();
        if !items.is_empty() {
            let results = self.node_manager.transfer_monitored_items(
                context,
                self.id,
                send_initial_values,
                &items,
            );
            for (item, status) in items.iter().zip(results) {
                if status.is_bad() {
                    warn!(
                        "Monitored item {} of subscription {} could not be transferred, {}",
                        item.id(),
                        self.id,
                        status
                    );
                }
            }
        }
        inner.available_sequence_numbers()
    }

    /// The owning session closed without deleting the subscription.
    pub fn session_closed(&self) {
        let mut inner = trace_lock!(self.inner);
        inner.session = None;
        inner.waiting_for_publish = false;
    }

    /// Deletes the subscription and all of its monitored items.
    pub fn delete(&self, context: Option<&OperationContext>) {
        let items: Vec<_> = {
            let mut inner = trace_lock!(self.inner);
            if inner.deleted {
                return;
            }
            inner.deleted = true;
            inner.expired = true;
            inner.items_to_check.clear();
            inner.items_to_publish.clear();
            inner.items_to_trigger.clear();
            inner.sent_messages.clear();
            inner.last_sent_message = 0;
            inner.monitored_items.drain().map(|(_, item)| item).collect()
        };
        if !items.is_empty() {
            let results = self
                .node_manager
                .delete_monitored_items(context, self.id, &items);
            for (item, status) in items.iter().zip(results) {
                if status.is_bad() {
                    warn!(
                        "Monitored item {} of subscription {} could not be deleted, {}",
                        item.id(),
                        self.id,
                        status
                    );
                }
            }
        }
        debug!("Subscription {} deleted", self.id);
    }

    /// Releases everything held by the subscription without involving the node manager, used
    /// at shutdown.
    pub fn dispose(&self) {
        let mut inner = trace_lock!(self.inner);
        inner.deleted = true;
        inner.expired = true;
        inner.session = None;
        inner.monitored_items.clear();
        inner.items_to_check.clear();
        inner.items_to_publish.clear();
        inner.items_to_trigger.clear();
        inner.sent_messages.clear();
        inner.last_sent_message = 0;
    }

    pub fn diagnostics(&self) -> SubscriptionDiagnostics {
        let inner = trace_lock!(self.inner);
        let mut diagnostics = inner.diagnostics.clone();
        diagnostics.session_id = inner.session.as_ref().map(|s| s.session_id());
        diagnostics.priority = inner.settings.priority;
        diagnostics.publishing_interval = inner.settings.publishing_interval;
        diagnostics.max_keep_alive_count = inner.settings.max_keep_alive_count;
        diagnostics.max_lifetime_count = inner.settings.max_lifetime_count;
        diagnostics.max_notifications_per_publish = inner.settings.max_notifications_per_publish;
        diagnostics.publishing_enabled = inner.settings.publishing_enabled;
        diagnostics.current_keep_alive_count = inner.keep_alive_counter;
        diagnostics.current_lifetime_count = inner.lifetime_counter;
        diagnostics.unacknowledged_message_count = inner.sent_messages.len() as u32;
        diagnostics.monitored_item_count = inner.monitored_items.len() as u32;
        diagnostics.disabled_monitored_item_count = inner
            .monitored_items
            .values()
            .filter(|i| i.monitoring_mode() == MonitoringMode::Disabled)
            .count() as u32;
        diagnostics.next_sequence_number = inner.sequence_number.peek();
        diagnostics
    }
}
