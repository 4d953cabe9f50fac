// OPCUA for Rust
// SPDX-License-Identifier: MPL-2.0
// Copyright (C) 2017-2024 Adam Lock

use std::{collections::VecDeque, sync::Arc, time::Instant};

use crate::{
    server::{
        session::{OperationContext, Session},
        subscriptions::{
            publish_operation::{PublishCompletion, PublishWaiter, PublishWake},
            subscription::{PublishingState, Subscription},
        },
    },
    sync::Mutex,
    types::{StatusCode, SubscriptionAcknowledgement},
};

/// The result of asking a session queue for a subscription to publish.
pub enum PublishTicket {
    /// A subscription was ready. It is marked as publishing until `publish_completed`.
    Ready(Arc<Subscription>),
    /// Nothing was ready, the request was parked and the waiter completes when a subscription
    /// is assigned to it or it fails.
    Pending(PublishWaiter),
}

struct QueuedSubscription {
    subscription: Arc<Subscription>,
    ready_to_publish: bool,
    publishing: bool,
    /// When the subscription last became ready, the oldest wait wins between equal priorities
    timestamp: Instant,
}

struct QueuedRequest {
    secure_channel_id: u32,
    deadline: Instant,
    completion: PublishCompletion,
}

impl QueuedRequest {
    fn fail(self, status_code: StatusCode) {
        // The receiver may have gone away, nothing is waiting then
        let _ = self.completion.send(Err(status_code));
    }
}

struct SessionPublishQueueInner {
    subscriptions: Vec<QueuedSubscription>,
    requests: VecDeque<QueuedRequest>,
    closed: bool,
}

impl SessionPublishQueueInner {
    /// Index of the ready subscription with the highest priority, the oldest wait breaking
    /// ties.
    fn select_ready(&self) -> Option<usize> {
        self.subscriptions
            .iter()
            .enumerate()
            .filter(|(_, s)| s.ready_to_publish && !s.publishing)
            .max_by(|(_, a), (_, b)| {
                a.subscription
                    .priority()
                    .cmp(&b.subscription.priority())
                    .then_with(|| b.timestamp.cmp(&a.timestamp))
            })
            .map(|(idx, _)| idx)
    }

    fn find(&self, subscription_id: u32) -> Option<usize> {
        self.subscriptions
            .iter()
            .position(|s| s.subscription.id() == subscription_id)
    }

    /// Fails requests that timed out or whose secure channel is gone.
    fn purge_requests(&mut self, session: &Session, now: Instant) {
        let requests = std::mem::take(&mut self.requests);
        for request in requests {
            if request.completion.is_closed() {
                continue;
            }
            if request.deadline <= now {
                debug!(
                    "Publish request of session {} timed out in the queue",
                    session.session_id()
                );
                request.fail(StatusCode::BadTimeout);
            } else if !session.is_secure_channel_valid(request.secure_channel_id) {
                request.fail(StatusCode::BadSecureChannelIdInvalid);
            } else {
                self.requests.push_back(request);
            }
        }
    }

    /// Takes the first pending request that is still usable, failing the ones that are not.
    fn next_valid_request(&mut self, session: &Session, now: Instant) -> Option<QueuedRequest> {
        while let Some(request) = self.requests.pop_front() {
            if request.completion.is_closed() {
                continue;
            }
            if request.deadline <= now {
                request.fail(StatusCode::BadTimeout);
            } else if !session.is_secure_channel_valid(request.secure_channel_id) {
                request.fail(StatusCode::BadSecureChannelIdInvalid);
            } else {
                return Some(request);
            }
        }
        None
    }

    /// Hands the subscription at `idx` to the oldest usable pending request. If there is none
    /// the subscription is left ready so the next publish request takes it. Returns true if a
    /// request was woken.
    fn assign_subscription_to_request(
        &mut self,
        session: &Session,
        idx: usize,
        now: Instant,
    ) -> bool {
        while let Some(request) = self.next_valid_request(session, now) {
            let entry = &mut self.subscriptions[idx];
            entry.publishing = true;
            let wake = PublishWake::Assigned(entry.subscription.clone());
            if request.completion.send(Ok(wake)).is_ok() {
                return true;
            }
            entry.publishing = false;
        }
        if let Some(entry) = self.subscriptions.get_mut(idx) {
            entry.ready_to_publish = true;
        }
        false
    }

    fn fail_all_requests(&mut self, status_code: StatusCode) {
        for request in self.requests.drain(..) {
            request.fail(status_code);
        }
    }
}

/// Matches the publish requests of one session against the subscriptions of that session.
pub struct SessionPublishQueue {
    session: Arc<Session>,
    max_publish_request_count: usize,
    inner: Mutex<SessionPublishQueueInner>,
}

impl SessionPublishQueue {
    pub fn new(session: Arc<Session>, max_publish_request_count: usize) -> Self {
        Self {
            session,
            max_publish_request_count,
            inner: Mutex::new(SessionPublishQueueInner {
                subscriptions: Vec::new(),
                requests: VecDeque::new(),
                closed: false,
            }),
        }
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    pub fn add(&self, subscription: Arc<Subscription>) {
        let mut inner = trace_lock!(self.inner);
        if inner.closed {
            warn!(
                "Subscription {} cannot be added to the closed queue of session {}",
                subscription.id(),
                self.session.session_id()
            );
            return;
        }
        if inner.find(subscription.id()).is_none() {
            inner.subscriptions.push(QueuedSubscription {
                subscription,
                ready_to_publish: false,
                publishing: false,
                timestamp: Instant::now(),
            });
        }
    }

    pub fn remove(&self, subscription_id: u32) -> Option<Arc<Subscription>> {
        let mut inner = trace_lock!(self.inner);
        let idx = inner.find(subscription_id)?;
        Some(inner.subscriptions.remove(idx).subscription)
    }

    pub fn contains(&self, subscription_id: u32) -> bool {
        trace_lock!(self.inner).find(subscription_id).is_some()
    }

    pub fn subscription_count(&self) -> usize {
        trace_lock!(self.inner).subscriptions.len()
    }

    pub fn request_count(&self) -> usize {
        trace_lock!(self.inner).requests.len()
    }

    pub fn is_closed(&self) -> bool {
        trace_lock!(self.inner).closed
    }

    /// The session ended. Every pending request fails with `BadSessionClosed` and the
    /// subscriptions are handed back so the caller can delete or abandon them.
    pub fn close(&self) -> Vec<Arc<Subscription>> {
        let mut inner = trace_lock!(self.inner);
        inner.closed = true;
        inner.fail_all_requests(StatusCode::BadSessionClosed);
        inner
            .subscriptions
            .drain(..)
            .map(|s| s.subscription)
            .collect()
    }

    /// Server shutdown. Every pending request fails with `BadServerHalted`.
    pub fn dispose(&self) {
        let mut inner = trace_lock!(self.inner);
        inner.closed = true;
        inner.fail_all_requests(StatusCode::BadServerHalted);
        inner.subscriptions.clear();
    }

    /// Asks for a subscription to publish. If one is ready it is returned at once, otherwise
    /// the request is parked. A requeued request goes to the front of the pending list since
    /// it has already waited.
    pub fn publish(
        &self,
        context: &OperationContext,
        requeue: bool,
    ) -> Result<PublishTicket, StatusCode> {
        let mut inner = trace_lock!(self.inner);
        if inner.closed {
            return Err(StatusCode::BadSessionClosed);
        }
        if inner.subscriptions.is_empty() {
            return Err(StatusCode::BadNoSubscription);
        }

        if let Some(idx) = inner.select_ready() {
            let entry = &mut inner.subscriptions[idx];
            entry.publishing = true;
            return Ok(PublishTicket::Ready(entry.subscription.clone()));
        }

        let now = Instant::now();
        inner.purge_requests(&self.session, now);

        if self.max_publish_request_count > 0
            && inner.requests.len() >= self.max_publish_request_count
        {
            warn!(
                "Session {} has too many queued publish requests, failing the oldest",
                self.session.session_id()
            );
            if let Some(oldest) = inner.requests.pop_front() {
                oldest.fail(StatusCode::BadTooManyPublishRequests);
            }
        }

        let (completion, waiter) = PublishWaiter::new();
        let request = QueuedRequest {
            secure_channel_id: context.secure_channel_id,
            deadline: context.deadline,
            completion,
        };
        if requeue {
            inner.requests.push_front(request);
        } else {
            inner.requests.push_back(request);
        }
        trace!(
            "Session {} has {} queued publish requests",
            self.session.session_id(),
            inner.requests.len()
        );
        Ok(PublishTicket::Pending(waiter))
    }

    /// A subscription finished publishing. With more messages queued it goes straight to the
    /// next pending request, otherwise it waits for its next tick.
    pub fn publish_completed(&self, subscription: &Subscription, more_notifications: bool) {
        let mut inner = trace_lock!(self.inner);
        let Some(idx) = inner.find(subscription.id()) else {
            return;
        };
        let now = Instant::now();
        inner.subscriptions[idx].publishing = false;
        if more_notifications {
            inner.assign_subscription_to_request(&self.session, idx, now);
        } else {
            let entry = &mut inner.subscriptions[idx];
            entry.ready_to_publish = false;
            entry.timestamp = now;
        }
    }

    pub fn publish_timer_expired(&self) -> Vec<Arc<Subscription>> {
        self.publish_timer_expired_at(Instant::now())
    }

    /// Ticks every subscription of the session, then hands ready subscriptions to pending
    /// requests. Subscriptions that expired are removed from the queue and returned.
    pub fn publish_timer_expired_at(&self, now: Instant) -> Vec<Arc<Subscription>> {
        let mut inner = trace_lock!(self.inner);
        if inner.closed {
            return Vec::new();
        }

        let mut expired = Vec::new();
        let mut idx = 0;
        while idx < inner.subscriptions.len() {
            let state = inner.subscriptions[idx]
                .subscription
                .publish_timer_expired_at(now);
            match state {
                PublishingState::Expired => {
                    expired.push(inner.subscriptions.remove(idx).subscription);
                    continue;
                }
                PublishingState::NotificationsAvailable | PublishingState::WaitingForPublish => {
                    let entry = &mut inner.subscriptions[idx];
                    if !entry.ready_to_publish {
                        entry.ready_to_publish = true;
                        entry.timestamp = now;
                    }
                }
                PublishingState::Idle => {}
            }
            idx += 1;
        }

        inner.purge_requests(&self.session, now);

        while !inner.requests.is_empty() {
            let Some(idx) = inner.select_ready() else {
                break;
            };
            if !inner.assign_subscription_to_request(&self.session, idx, now) {
                break;
            }
        }

        expired
    }

    /// Wakes one pending request to pick up a status message. Returns false if no request
    /// was waiting.
    pub fn try_publish_custom_status(&self) -> bool {
        let mut inner = trace_lock!(self.inner);
        let now = Instant::now();
        while let Some(request) = inner.next_valid_request(&self.session, now) {
            if request
                .completion
                .send(Ok(PublishWake::StatusMessage))
                .is_ok()
            {
                return true;
            }
        }
        false
    }

    /// Fails every pending request with `BadNoSubscription`, called once the session has no
    /// subscriptions left to serve them.
    pub fn remove_queued_requests(&self) {
        let mut inner = trace_lock!(self.inner);
        if !inner.requests.is_empty() {
            debug!(
                "Session {} has no subscriptions, failing {} queued publish requests",
                self.session.session_id(),
                inner.requests.len()
            );
        }
        inner.fail_all_requests(StatusCode::BadNoSubscription);
    }

    /// Applies the acknowledgements of a publish request, one result per acknowledgement.
    pub fn acknowledge(&self, acknowledgements: &[SubscriptionAcknowledgement]) -> Vec<StatusCode> {
        let subscriptions: Vec<_> = {
            let inner = trace_lock!(self.inner);
            inner
                .subscriptions
                .iter()
                .map(|s| s.subscription.clone())
                .collect()
        };
        acknowledgements
            .iter()
            .map(|ack| {
                match subscriptions
                    .iter()
                    .find(|s| s.id() == ack.subscription_id)
                {
                    Some(subscription) => match subscription.acknowledge(ack.sequence_number) {
                        Ok(()) => StatusCode::Good,
                        Err(status_code) => status_code,
                    },
                    None => StatusCode::BadSubscriptionIdInvalid,
                }
            })
            .collect()
    }
}
