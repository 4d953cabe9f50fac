// OPCUA for Rust
// SPDX-License-Identifier: MPL-2.0
// Copyright (C) 2017-2024 Adam Lock

//! The subscription manager owns every subscription of the server and one publish queue per
//! session. It negotiates subscription parameters, routes service calls to the subscription
//! they name, drives the publish timer and answers publish requests.
//!
//! The manager lock is only held to look things up. It is never held while a queue or a
//! subscription is locked, so the lock order is always queue before subscription, and the
//! manager is free of both.

pub mod condition_refresh;
pub mod publish_operation;
pub mod session_queue;
pub mod subscription;

use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use hashbrown::HashMap;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::{
    core::handle::AtomicHandle,
    server::{
        config::{Config, SubscriptionConfig},
        diagnostics::{
            ServerDiagnostics, ServerDiagnosticsSummary, SubscriptionDiagnostics,
            SubscriptionEvent, SubscriptionObservers,
        },
        node_manager::NodeManager,
        session::OperationContext,
    },
    sync::{Mutex, RwLock},
    types::{
        CreateSubscriptionRequest, CreateSubscriptionResponse, MonitoredItemCreateRequest,
        MonitoredItemCreateResult, MonitoredItemModifyRequest, MonitoredItemModifyResult,
        ModifySubscriptionRequest, ModifySubscriptionResponse, MonitoringMode,
        NotificationMessage, PublishRequest, PublishResponse, SetTriggeringResult, StatusCode,
        TimestampsToReturn, TransferResult,
    },
};

use self::{
    condition_refresh::ConditionRefreshQueue,
    publish_operation::{AsyncPublishOperation, PublishWake},
    session_queue::{PublishTicket, SessionPublishQueue},
    subscription::{PublishingState, Subscription, SubscriptionSettings},
};

/// A message for a session that does not come from one of its subscriptions' monitored
/// items, e.g. the notice that a subscription expired or was transferred away. Status messages
/// are delivered ahead of ordinary notifications.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusMessage {
    pub subscription_id: u32,
    pub message: NotificationMessage,
}

/// Clamps the requested publishing interval to the configured range and rounds it up to a
/// multiple of the publishing resolution.
pub fn calculate_publishing_interval(config: &SubscriptionConfig, requested: f64) -> f64 {
    let interval = if requested.is_nan() || requested < config.min_publishing_interval_ms {
        config.min_publishing_interval_ms
    } else if requested > config.max_publishing_interval_ms {
        config.max_publishing_interval_ms
    } else {
        requested
    };
    let resolution = config.publishing_resolution_ms;
    if resolution > 0.0 {
        (interval / resolution).ceil() * resolution
    } else {
        interval
    }
}

/// The keep alive count, reduced so a keep alive period never exceeds the maximum subscription
/// lifetime or the maximum publishing interval.
pub fn calculate_keep_alive_count(
    config: &SubscriptionConfig,
    publishing_interval: f64,
    requested: u32,
) -> u32 {
    let mut count = if requested == 0 {
        config.default_keep_alive_count
    } else {
        requested
    };
    if publishing_interval > 0.0 {
        let limit = config
            .max_subscription_lifetime_ms
            .min(config.max_publishing_interval_ms);
        if count as f64 * publishing_interval > limit {
            count = (limit / publishing_interval).ceil() as u32;
        }
    }
    count.max(1)
}

/// The lifetime count, reduced to respect the maximum subscription lifetime, then forced to
/// at least three keep alive periods and to the minimum subscription lifetime.
pub fn calculate_lifetime_count(
    config: &SubscriptionConfig,
    publishing_interval: f64,
    keep_alive_count: u32,
    requested: u32,
) -> u32 {
    let mut count = requested;
    if publishing_interval > 0.0 {
        if count as f64 * publishing_interval > config.max_subscription_lifetime_ms {
            count = (config.max_subscription_lifetime_ms / publishing_interval) as u32;
        }
    }
    let minimum = keep_alive_count.saturating_mul(3);
    if count < minimum {
        count = minimum;
    }
    if publishing_interval > 0.0
        && (count as f64 * publishing_interval) < config.min_subscription_lifetime_ms
    {
        count = (config.min_subscription_lifetime_ms / publishing_interval).ceil() as u32;
    }
    count
}

/// The notifications per message, where 0 or anything above the server ceiling becomes the
/// ceiling. A ceiling of 0 means the server imposes none.
pub fn calculate_max_notifications_per_publish(config: &SubscriptionConfig, requested: u32) -> u32 {
    let ceiling = config.max_notifications_per_publish;
    if ceiling == 0 {
        requested
    } else if requested == 0 || requested > ceiling {
        ceiling
    } else {
        requested
    }
}

struct SubscriptionManagerInner {
    /// Every live subscription, including abandoned ones
    subscriptions: HashMap<u32, Arc<Subscription>>,
    session_queues: HashMap<u32, Arc<SessionPublishQueue>>,
    status_messages: HashMap<u32, VecDeque<StatusMessage>>,
    /// Subscriptions whose session closed without deleting them. They tick until they expire
    /// or a transfer claims them.
    abandoned: Vec<Arc<Subscription>>,
    shutdown: bool,
}

pub struct SubscriptionManager {
    config: SubscriptionConfig,
    node_manager: Arc<dyn NodeManager>,
    subscription_ids: AtomicHandle,
    inner: RwLock<SubscriptionManagerInner>,
    diagnostics: RwLock<ServerDiagnostics>,
    observers: SubscriptionObservers,
    condition_refresh: Arc<ConditionRefreshQueue>,
    token: CancellationToken,
    started: AtomicBool,
    runtime: Mutex<Option<tokio::runtime::Handle>>,
}

impl SubscriptionManager {
    pub fn new(config: SubscriptionConfig, node_manager: Arc<dyn NodeManager>) -> Self {
        if !config.is_valid() {
            warn!("Subscription configuration is invalid, limits may not be enforced as expected");
        }
        Self {
            config,
            node_manager,
            subscription_ids: AtomicHandle::new(1),
            inner: RwLock::new(SubscriptionManagerInner {
                subscriptions: HashMap::new(),
                session_queues: HashMap::new(),
                status_messages: HashMap::new(),
                abandoned: Vec::new(),
                shutdown: false,
            }),
            diagnostics: RwLock::new(ServerDiagnostics::default()),
            observers: SubscriptionObservers::default(),
            condition_refresh: Arc::new(ConditionRefreshQueue::default()),
            token: CancellationToken::new(),
            started: AtomicBool::new(false),
            runtime: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &SubscriptionConfig {
        &self.config
    }

    /// Starts the publish ticker and the condition refresh worker on the current tokio runtime.
    pub fn startup(self: &Arc<Self>) -> Result<(), StatusCode> {
        if self.is_shutdown() {
            return Err(StatusCode::BadServerHalted);
        }
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let runtime = tokio::runtime::Handle::try_current().map_err(|e| {
            error!("Subscription manager must be started from a tokio runtime, {}", e);
            self.started.store(false, Ordering::SeqCst);
            StatusCode::BadInternalError
        })?;
        *trace_lock!(self.runtime) = Some(runtime.clone());

        runtime.spawn(Self::run_publish_ticker(self.clone(), self.token.clone()));
        runtime.spawn(self.condition_refresh.clone().run(self.token.clone()));
        Ok(())
    }

    async fn run_publish_ticker(manager: Arc<Self>, token: CancellationToken) {
        let resolution = manager.config.publishing_resolution_ms.max(1.0);
        let mut tick = tokio::time::interval(Duration::from_secs_f64(resolution / 1000.0));
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!("Publish ticker started, resolution {} ms", resolution);
        loop {
            tokio::select! {
                _ = tick.tick() => manager.publish_timer_expired(),
                _ = token.cancelled() => break,
            }
        }
        info!("Publish ticker stopped");
    }

    /// Stops the workers, fails every outstanding publish request with `BadServerHalted` and
    /// disposes of every subscription. The manager rejects all calls afterwards.
    pub fn shutdown(&self) {
        self.token.cancel();
        let (queues, subscriptions) = {
            let mut inner = trace_write_lock!(self.inner);
            if inner.shutdown {
                return;
            }
            inner.shutdown = true;
            inner.status_messages.clear();
            inner.abandoned.clear();
            let queues: Vec<_> = inner.session_queues.drain().map(|(_, q)| q).collect();
            let subscriptions: Vec<_> = inner.subscriptions.drain().map(|(_, s)| s).collect();
            (queues, subscriptions)
        };
        for queue in queues {
            queue.dispose();
        }
        for subscription in &subscriptions {
            subscription.dispose();
        }
        self.condition_refresh.clear();
        info!(
            "Subscription manager shut down, disposed of {} subscriptions",
            subscriptions.len()
        );
    }

    pub fn is_shutdown(&self) -> bool {
        trace_read_lock!(self.inner).shutdown
    }

    /// Receives lifecycle events of subscriptions.
    pub fn subscribe_events(&self) -> tokio::sync::mpsc::UnboundedReceiver<SubscriptionEvent> {
        self.observers.subscribe()
    }

    pub fn diagnostics_summary(&self) -> ServerDiagnosticsSummary {
        trace_read_lock!(self.diagnostics).summary()
    }

    pub fn subscription_diagnostics(&self, subscription_id: u32) -> Option<SubscriptionDiagnostics> {
        let subscription = trace_read_lock!(self.inner)
            .subscriptions
            .get(&subscription_id)
            .cloned()?;
        Some(subscription.diagnostics())
    }

    pub fn subscription_count(&self) -> usize {
        trace_read_lock!(self.inner).subscriptions.len()
    }

    pub fn abandoned_subscription_count(&self) -> usize {
        trace_read_lock!(self.inner).abandoned.len()
    }

    pub fn session_queue(&self, session_id: u32) -> Option<Arc<SessionPublishQueue>> {
        trace_read_lock!(self.inner)
            .session_queues
            .get(&session_id)
            .cloned()
    }

    pub fn status_message_count(&self, session_id: u32) -> usize {
        trace_read_lock!(self.inner)
            .status_messages
            .get(&session_id)
            .map(|m| m.len())
            .unwrap_or(0)
    }

    fn find_subscription(&self, subscription_id: u32) -> Result<Arc<Subscription>, StatusCode> {
        let inner = trace_read_lock!(self.inner);
        if inner.shutdown {
            return Err(StatusCode::BadServerHalted);
        }
        inner
            .subscriptions
            .get(&subscription_id)
            .cloned()
            .ok_or(StatusCode::BadSubscriptionIdInvalid)
    }

    /// Finds a subscription owned by the session making the request.
    fn find_owned(
        &self,
        context: &OperationContext,
        subscription_id: u32,
    ) -> Result<Arc<Subscription>, StatusCode> {
        let subscription = self.find_subscription(subscription_id)?;
        subscription.validate_session(context)?;
        Ok(subscription)
    }

    fn check_operation_count(&self, count: usize) -> Result<(), StatusCode> {
        if count == 0 {
            Err(StatusCode::BadNothingToDo)
        } else if self.config.max_monitored_items_per_call > 0
            && count > self.config.max_monitored_items_per_call
        {
            Err(StatusCode::BadTooManyOperations)
        } else {
            Ok(())
        }
    }

    fn get_or_create_queue(
        &self,
        context: &OperationContext,
    ) -> Result<Arc<SessionPublishQueue>, StatusCode> {
        let mut inner = trace_write_lock!(self.inner);
        if inner.shutdown {
            return Err(StatusCode::BadServerHalted);
        }
        let queue = inner
            .session_queues
            .entry(context.session_id())
            .or_insert_with(|| {
                Arc::new(SessionPublishQueue::new(
                    context.session.clone(),
                    self.config.max_publish_request_count,
                ))
            });
        Ok(queue.clone())
    }

    pub fn create_subscription(
        &self,
        context: &OperationContext,
        request: &CreateSubscriptionRequest,
    ) -> Result<CreateSubscriptionResponse, StatusCode> {
        let publishing_interval =
            calculate_publishing_interval(&self.config, request.requested_publishing_interval);
        let max_keep_alive_count = calculate_keep_alive_count(
            &self.config,
            publishing_interval,
            request.requested_max_keep_alive_count,
        );
        let max_lifetime_count = calculate_lifetime_count(
            &self.config,
            publishing_interval,
            max_keep_alive_count,
            request.requested_lifetime_count,
        );
        let settings = SubscriptionSettings {
            publishing_interval,
            max_keep_alive_count,
            max_lifetime_count,
            max_notifications_per_publish: calculate_max_notifications_per_publish(
                &self.config,
                request.max_notifications_per_publish,
            ),
            priority: request.priority,
            publishing_enabled: request.publishing_enabled,
            max_message_count: self.config.max_message_count,
            max_monitored_items: self.config.max_monitored_items_per_subscription,
        };

        let (subscription, queue) = {
            let mut inner = trace_write_lock!(self.inner);
            if inner.shutdown {
                return Err(StatusCode::BadServerHalted);
            }
            if self.config.max_subscription_count > 0
                && inner.subscriptions.len() >= self.config.max_subscription_count
            {
                warn!(
                    "Session {} cannot create a subscription, the server has reached its limit of {}",
                    context.session_id(),
                    self.config.max_subscription_count
                );
                return Err(StatusCode::BadTooManySubscriptions);
            }
            let subscription_id = self.subscription_ids.next();
            let subscription = Arc::new(Subscription::new(
                subscription_id,
                context.session.clone(),
                self.node_manager.clone(),
                settings,
            ));
            inner
                .subscriptions
                .insert(subscription_id, subscription.clone());
            let queue = inner
                .session_queues
                .entry(context.session_id())
                .or_insert_with(|| {
                    Arc::new(SessionPublishQueue::new(
                        context.session.clone(),
                        self.config.max_publish_request_count,
                    ))
                })
                .clone();
            (subscription, queue)
        };
        queue.add(subscription.clone());

        trace_write_lock!(self.diagnostics).on_create_subscription(publishing_interval);
        info!(
            "Created subscription {} for session {}, publishing interval {} ms",
            subscription.id(),
            context.session_id(),
            publishing_interval
        );
        self.observers.notify(SubscriptionEvent::Created {
            subscription_id: subscription.id(),
            session_id: context.session_id(),
        });

        Ok(CreateSubscriptionResponse {
            subscription_id: subscription.id(),
            revised_publishing_interval: publishing_interval,
            revised_lifetime_count: max_lifetime_count,
            revised_max_keep_alive_count: max_keep_alive_count,
        })
    }

    pub fn modify_subscription(
        &self,
        context: &OperationContext,
        request: &ModifySubscriptionRequest,
    ) -> Result<ModifySubscriptionResponse, StatusCode> {
        let subscription = self.find_owned(context, request.subscription_id)?;
        let publishing_interval =
            calculate_publishing_interval(&self.config, request.requested_publishing_interval);
        let max_keep_alive_count = calculate_keep_alive_count(
            &self.config,
            publishing_interval,
            request.requested_max_keep_alive_count,
        );
        let max_lifetime_count = calculate_lifetime_count(
            &self.config,
            publishing_interval,
            max_keep_alive_count,
            request.requested_lifetime_count,
        );
        let max_notifications_per_publish = calculate_max_notifications_per_publish(
            &self.config,
            request.max_notifications_per_publish,
        );

        let old_interval = subscription.publishing_interval();
        subscription.modify(
            publishing_interval,
            max_keep_alive_count,
            max_lifetime_count,
            max_notifications_per_publish,
            request.priority,
        );
        trace_write_lock!(self.diagnostics)
            .on_modify_subscription(old_interval, publishing_interval);
        debug!(
            "Modified subscription {}, publishing interval {} ms",
            subscription.id(),
            publishing_interval
        );

        Ok(ModifySubscriptionResponse {
            revised_publishing_interval: publishing_interval,
            revised_lifetime_count: max_lifetime_count,
            revised_max_keep_alive_count: max_keep_alive_count,
        })
    }

    pub fn set_publishing_mode(
        &self,
        context: &OperationContext,
        publishing_enabled: bool,
        subscription_ids: &[u32],
    ) -> Result<Vec<StatusCode>, StatusCode> {
        if subscription_ids.is_empty() {
            return Err(StatusCode::BadNothingToDo);
        }
        if self.is_shutdown() {
            return Err(StatusCode::BadServerHalted);
        }
        Ok(subscription_ids
            .iter()
            .map(|id| match self.find_owned(context, *id) {
                Ok(subscription) => {
                    subscription.set_publishing_mode(publishing_enabled);
                    StatusCode::Good
                }
                Err(status_code) => status_code,
            })
            .collect())
    }

    pub fn delete_subscription(
        &self,
        context: &OperationContext,
        subscription_id: u32,
    ) -> Result<(), StatusCode> {
        let subscription = self.find_owned(context, subscription_id)?;
        self.remove_subscription(&subscription, Some(context.session_id()), Some(context));
        Ok(())
    }

    pub fn delete_subscriptions(
        &self,
        context: &OperationContext,
        subscription_ids: &[u32],
    ) -> Result<Vec<StatusCode>, StatusCode> {
        if subscription_ids.is_empty() {
            return Err(StatusCode::BadNothingToDo);
        }
        if self.is_shutdown() {
            return Err(StatusCode::BadServerHalted);
        }
        Ok(subscription_ids
            .iter()
            .map(|id| match self.delete_subscription(context, *id) {
                Ok(()) => StatusCode::Good,
                Err(status_code) => status_code,
            })
            .collect())
    }

    /// Unregisters a subscription, detaches it from its session queue and deletes its
    /// monitored items.
    fn remove_subscription(
        &self,
        subscription: &Arc<Subscription>,
        session_id: Option<u32>,
        context: Option<&OperationContext>,
    ) {
        if !self.unregister_subscription(subscription, session_id) {
            return;
        }
        subscription.delete(context);
        self.on_subscription_deleted(subscription);
    }

    /// Removes an expired subscription from the registry. Its monitored items are deleted
    /// on the blocking pool of the runtime the manager was started on, or inline when the
    /// manager is ticked by hand.
    fn reap_expired_subscription(&self, subscription: Arc<Subscription>) {
        if !self.unregister_subscription(&subscription, None) {
            return;
        }
        self.on_subscription_deleted(&subscription);
        let runtime = trace_lock!(self.runtime).clone();
        match runtime {
            Some(runtime) => {
                runtime.spawn_blocking(move || subscription.delete(None));
            }
            None => subscription.delete(None),
        }
    }

    /// Takes a subscription out of the registry and out of its session queue. Returns false if
    /// it was already gone.
    fn unregister_subscription(&self, subscription: &Subscription, session_id: Option<u32>) -> bool {
        let subscription_id = subscription.id();
        let queue = {
            let mut inner = trace_write_lock!(self.inner);
            if inner.subscriptions.remove(&subscription_id).is_none() {
                return false;
            }
            inner.abandoned.retain(|s| s.id() != subscription_id);
            session_id.and_then(|id| inner.session_queues.get(&id).cloned())
        };
        if let Some(queue) = queue {
            queue.remove(subscription_id);
            if queue.subscription_count() == 0 {
                queue.remove_queued_requests();
            }
        }
        true
    }

    fn on_subscription_deleted(&self, subscription: &Subscription) {
        let subscription_id = subscription.id();
        trace_write_lock!(self.diagnostics)
            .on_destroy_subscription(subscription.publishing_interval());
        info!("Deleted subscription {}", subscription_id);
        self.observers
            .notify(SubscriptionEvent::Deleted { subscription_id });
    }

    fn take_status_message(&self, session_id: u32) -> Option<StatusMessage> {
        let mut inner = trace_write_lock!(self.inner);
        let messages = inner.status_messages.get_mut(&session_id)?;
        let message = messages.pop_front();
        if messages.is_empty() {
            inner.status_messages.remove(&session_id);
        }
        message
    }

    fn push_status_message(&self, session_id: u32, status_message: StatusMessage) {
        trace_write_lock!(self.inner)
            .status_messages
            .entry(session_id)
            .or_default()
            .push_back(status_message);
    }

    /// Answers a publish request, blocking the calling thread until a message is available,
    /// the request times out or the server shuts down.
    pub fn publish(
        &self,
        context: &OperationContext,
        request: &PublishRequest,
    ) -> Result<PublishResponse, StatusCode> {
        futures::executor::block_on(self.publish_async(context, request))
    }

    /// Answers a publish request. Acknowledgements are applied first, then any status
    /// message for the session is sent, else the request is matched to a subscription of the
    /// session, waiting in the session queue if none is ready.
    pub async fn publish_async(
        &self,
        context: &OperationContext,
        request: &PublishRequest,
    ) -> Result<PublishResponse, StatusCode> {
        let session_id = context.session_id();
        let queue = {
            let inner = trace_read_lock!(self.inner);
            if inner.shutdown {
                return Err(StatusCode::BadServerHalted);
            }
            inner
                .session_queues
                .get(&session_id)
                .cloned()
                .ok_or(StatusCode::BadNoSubscription)?
        };

        let results = request
            .subscription_acknowledgements
            .as_ref()
            .filter(|acks| !acks.is_empty())
            .map(|acks| queue.acknowledge(acks));

        let mut requeue = false;
        loop {
            if let Some(status_message) = self.take_status_message(session_id) {
                debug!(
                    "Sending status message of subscription {} to session {}",
                    status_message.subscription_id, session_id
                );
                return Ok(PublishResponse {
                    subscription_id: status_message.subscription_id,
                    available_sequence_numbers: None,
                    more_notifications: false,
                    notification_message: status_message.message,
                    results,
                });
            }

            let subscription = match queue.publish(context, requeue)? {
                PublishTicket::Ready(subscription) => subscription,
                PublishTicket::Pending(waiter) => match waiter.wait().await? {
                    PublishWake::Assigned(subscription) => subscription,
                    PublishWake::StatusMessage => {
                        requeue = true;
                        continue;
                    }
                },
            };

            match subscription.publish(context) {
                Ok(Some(published)) => {
                    queue.publish_completed(&subscription, published.more_notifications);
                    let available_sequence_numbers = if published.available_sequence_numbers.is_empty() {
                        None
                    } else {
                        Some(published.available_sequence_numbers)
                    };
                    return Ok(PublishResponse {
                        subscription_id: subscription.id(),
                        available_sequence_numbers,
                        more_notifications: published.more_notifications,
                        notification_message: published.message,
                        results,
                    });
                }
                Ok(None) => {
                    // Nothing to send after all, wait for the next subscription to be ready
                    queue.publish_completed(&subscription, false);
                    requeue = true;
                }
                Err(status_code) => {
                    debug!(
                        "Subscription {} could not publish, {}",
                        subscription.id(),
                        status_code
                    );
                    queue.publish_completed(&subscription, false);
                    requeue = true;
                }
            }
        }
    }

    /// Answers a publish request without blocking the caller. The operation runs as a task on
    /// the runtime the manager was started on, or the current runtime, and reports through its
    /// callback.
    pub fn begin_publish(self: &Arc<Self>, operation: AsyncPublishOperation) {
        if self.is_shutdown() {
            operation.fail(StatusCode::BadServerHalted);
            return;
        }
        let runtime = trace_lock!(self.runtime)
            .clone()
            .or_else(|| tokio::runtime::Handle::try_current().ok());
        match runtime {
            Some(runtime) => {
                runtime.spawn(operation.complete_publish(self.clone()));
            }
            None => {
                error!("Asynchronous publish needs a tokio runtime");
                operation.fail(StatusCode::BadInternalError);
            }
        }
    }

    pub fn republish(
        &self,
        context: &OperationContext,
        subscription_id: u32,
        retransmit_sequence_number: u32,
    ) -> Result<NotificationMessage, StatusCode> {
        let subscription = self.find_owned(context, subscription_id)?;
        subscription.republish(retransmit_sequence_number)
    }

    /// Moves subscriptions to the session making the request. Each subscription gets its own
    /// result.
    pub fn transfer_subscriptions(
        &self,
        context: &OperationContext,
        subscription_ids: &[u32],
        send_initial_values: bool,
    ) -> Result<Vec<TransferResult>, StatusCode> {
        if subscription_ids.is_empty() {
            return Err(StatusCode::BadNothingToDo);
        }
        let target_queue = self.get_or_create_queue(context)?;
        Ok(subscription_ids
            .iter()
            .map(|id| {
                match self.transfer_subscription(context, &target_queue, *id, send_initial_values)
                {
                    Ok(available_sequence_numbers) => TransferResult {
                        status_code: StatusCode::Good,
                        available_sequence_numbers: Some(available_sequence_numbers),
                    },
                    Err(status_code) => TransferResult::error(status_code),
                }
            })
            .collect())
    }

    fn transfer_subscription(
        &self,
        context: &OperationContext,
        target_queue: &Arc<SessionPublishQueue>,
        subscription_id: u32,
        send_initial_values: bool,
    ) -> Result<Vec<u32>, StatusCode> {
        let subscription = self.find_subscription(subscription_id)?;
        let from_session_id = subscription.session_id();
        if from_session_id == Some(context.session_id()) {
            return Err(StatusCode::BadNothingToDo);
        }
        if !subscription
            .owner()
            .is_equivalent_for_transfer(context.session.security_key())
        {
            warn!(
                "Session {} is not allowed to take over subscription {}",
                context.session_id(),
                subscription_id
            );
            return Err(StatusCode::BadUserAccessDenied);
        }

        let old_queue = {
            let mut inner = trace_write_lock!(self.inner);
            inner.abandoned.retain(|s| s.id() != subscription_id);
            from_session_id.and_then(|id| inner.session_queues.get(&id).cloned())
        };
        if let Some(ref old_queue) = old_queue {
            old_queue.remove(subscription_id);
        }

        let status_message = subscription.subscription_transferred();
        let available_sequence_numbers =
            subscription.transfer_session(context, context.session.clone(), send_initial_values);
        target_queue.add(subscription.clone());

        if let (Some(from_session_id), Some(old_queue)) = (from_session_id, old_queue) {
            self.push_status_message(
                from_session_id,
                StatusMessage {
                    subscription_id,
                    message: status_message,
                },
            );
            old_queue.try_publish_custom_status();
            if old_queue.subscription_count() == 0 {
                old_queue.remove_queued_requests();
            }
        }

        info!(
            "Transferred subscription {} from session {:?} to session {}",
            subscription_id,
            from_session_id,
            context.session_id()
        );
        self.observers.notify(SubscriptionEvent::Transferred {
            subscription_id,
            from_session_id,
            to_session_id: context.session_id(),
        });
        Ok(available_sequence_numbers)
    }

    /// The session is closing. Its queued requests fail with `BadSessionClosed` and its
    /// subscriptions are either deleted or abandoned, to be claimed by a transfer or to expire.
    pub fn session_closing(&self, session_id: u32, delete_subscriptions: bool) {
        let queue = {
            let mut inner = trace_write_lock!(self.inner);
            inner.status_messages.remove(&session_id);
            inner.session_queues.remove(&session_id)
        };
        let Some(queue) = queue else {
            return;
        };
        for subscription in queue.close() {
            if delete_subscriptions {
                self.remove_subscription(&subscription, None, None);
            } else {
                subscription.session_closed();
                info!(
                    "Subscription {} abandoned by session {}",
                    subscription.id(),
                    session_id
                );
                trace_write_lock!(self.inner).abandoned.push(subscription);
            }
        }
    }

    pub fn create_monitored_items(
        &self,
        context: &OperationContext,
        subscription_id: u32,
        timestamps_to_return: TimestampsToReturn,
        items: &[MonitoredItemCreateRequest],
    ) -> Result<Vec<MonitoredItemCreateResult>, StatusCode> {
        self.check_operation_count(items.len())?;
        let subscription = self.find_owned(context, subscription_id)?;
        subscription.create_monitored_items(context, timestamps_to_return, items)
    }

    pub fn modify_monitored_items(
        &self,
        context: &OperationContext,
        subscription_id: u32,
        timestamps_to_return: TimestampsToReturn,
        items: &[MonitoredItemModifyRequest],
    ) -> Result<Vec<MonitoredItemModifyResult>, StatusCode> {
        self.check_operation_count(items.len())?;
        let subscription = self.find_owned(context, subscription_id)?;
        subscription.modify_monitored_items(context, timestamps_to_return, items)
    }

    pub fn delete_monitored_items(
        &self,
        context: &OperationContext,
        subscription_id: u32,
        monitored_item_ids: &[u32],
    ) -> Result<Vec<StatusCode>, StatusCode> {
        self.check_operation_count(monitored_item_ids.len())?;
        let subscription = self.find_owned(context, subscription_id)?;
        subscription.delete_monitored_items(context, monitored_item_ids)
    }

    pub fn set_monitoring_mode(
        &self,
        context: &OperationContext,
        subscription_id: u32,
        monitoring_mode: MonitoringMode,
        monitored_item_ids: &[u32],
    ) -> Result<Vec<StatusCode>, StatusCode> {
        self.check_operation_count(monitored_item_ids.len())?;
        let subscription = self.find_owned(context, subscription_id)?;
        subscription.set_monitoring_mode(context, monitoring_mode, monitored_item_ids)
    }

    pub fn set_triggering(
        &self,
        context: &OperationContext,
        subscription_id: u32,
        triggering_item_id: u32,
        links_to_add: &[u32],
        links_to_remove: &[u32],
    ) -> Result<SetTriggeringResult, StatusCode> {
        let subscription = self.find_owned(context, subscription_id)?;
        subscription.set_triggering(context, triggering_item_id, links_to_add, links_to_remove)
    }

    /// Queues a refresh of every event item of the subscription.
    pub fn condition_refresh(
        &self,
        context: &OperationContext,
        subscription_id: u32,
    ) -> Result<(), StatusCode> {
        self.condition_refresh2(context, subscription_id, 0)
    }

    /// Queues a refresh of one event item of the subscription.
    pub fn condition_refresh2(
        &self,
        context: &OperationContext,
        subscription_id: u32,
        monitored_item_id: u32,
    ) -> Result<(), StatusCode> {
        let subscription = self.find_owned(context, subscription_id)?;
        subscription.validate_condition_refresh(monitored_item_id)?;
        self.condition_refresh
            .enqueue(context.clone(), subscription, monitored_item_id)
    }

    /// Runs queued condition refreshes on the calling thread. The worker started by `startup`
    /// does this in the background.
    pub fn run_condition_refreshes(&self) -> usize {
        self.condition_refresh.run_pending()
    }

    pub fn publish_timer_expired(&self) {
        self.publish_timer_expired_at(Instant::now())
    }

    /// One cycle of the publish ticker. Ticks every session queue and every abandoned
    /// subscription, then reaps the subscriptions that expired.
    pub fn publish_timer_expired_at(&self, now: Instant) {
        let (queues, abandoned) = {
            let inner = trace_read_lock!(self.inner);
            if inner.shutdown {
                return;
            }
            (
                inner.session_queues.values().cloned().collect::<Vec<_>>(),
                inner.abandoned.clone(),
            )
        };

        for queue in queues {
            for subscription in queue.publish_timer_expired_at(now) {
                self.on_subscription_expired(&queue, subscription);
            }
        }

        for subscription in abandoned {
            if subscription.publish_timer_expired_at(now) == PublishingState::Expired {
                info!("Abandoned subscription {} has expired", subscription.id());
                trace_write_lock!(self.diagnostics).on_expire_subscription();
                self.observers.notify(SubscriptionEvent::Expired {
                    subscription_id: subscription.id(),
                });
                self.reap_expired_subscription(subscription);
            }
        }
    }

    /// A subscription of the session expired. The session is told through a status message
    /// and one of its pending requests is woken to carry it.
    fn on_subscription_expired(&self, queue: &SessionPublishQueue, subscription: Arc<Subscription>) {
        let session_id = queue.session().session_id();
        let status_message = StatusMessage {
            subscription_id: subscription.id(),
            message: subscription.publish_timeout(),
        };
        info!(
            "Subscription {} of session {} has expired",
            subscription.id(),
            session_id
        );
        self.push_status_message(session_id, status_message);
        queue.try_publish_custom_status();

        trace_write_lock!(self.diagnostics).on_expire_subscription();
        self.observers.notify(SubscriptionEvent::Expired {
            subscription_id: subscription.id(),
        });
        // Already out of the queue, so only the registry and the monitored items remain
        self.reap_expired_subscription(subscription);
        if queue.subscription_count() == 0 {
            queue.remove_queued_requests();
        }
    }
}

impl Drop for SubscriptionManager {
    fn drop(&mut self) {
        self.token.cancel();
    }
}
