use std::{thread, time::Instant};

use tokio::sync::oneshot;

use super::*;
use crate::server::{
    config::SubscriptionConfig,
    diagnostics::SubscriptionEvent,
    subscriptions::{publish_operation::AsyncPublishOperation, SubscriptionManager},
};

fn manager_with_config(config: SubscriptionConfig) -> (Arc<SubscriptionManager>, Arc<TestNodeManager>) {
    let nm = TestNodeManager::new();
    let manager = Arc::new(SubscriptionManager::new(config, nm.clone()));
    (manager, nm)
}

fn manager() -> (Arc<SubscriptionManager>, Arc<TestNodeManager>) {
    manager_with_config(SubscriptionConfig::default())
}

/// A configuration without a minimum lifetime so subscriptions can expire within a few ticks
fn short_lived_config() -> SubscriptionConfig {
    SubscriptionConfig {
        min_subscription_lifetime_ms: 0.0,
        ..Default::default()
    }
}

fn create(
    manager: &SubscriptionManager,
    ctx: &OperationContext,
    max_keep_alive_count: u32,
    lifetime_count: u32,
) -> u32 {
    manager
        .create_subscription(
            ctx,
            &CreateSubscriptionRequest {
                requested_publishing_interval: PUBLISHING_INTERVAL,
                requested_lifetime_count: lifetime_count,
                requested_max_keep_alive_count: max_keep_alive_count,
                max_notifications_per_publish: 0,
                publishing_enabled: true,
                priority: 0,
            },
        )
        .unwrap()
        .subscription_id
}

fn publish_request() -> PublishRequest {
    PublishRequest::default()
}

/// Polls until the condition holds, panicking if it never does.
fn wait_until(condition: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(Instant::now() < deadline, "Timed out waiting for a condition");
        thread::sleep(Duration::from_millis(5));
    }
}

fn queued_requests(manager: &SubscriptionManager, session_id: u32) -> usize {
    manager
        .session_queue(session_id)
        .map(|q| q.request_count())
        .unwrap_or(0)
}

fn events(rx: &mut tokio::sync::mpsc::UnboundedReceiver<SubscriptionEvent>) -> Vec<SubscriptionEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

#[test]
fn create_subscription_revises_parameters() {
    let (manager, _) = manager();
    let mut rx = manager.subscribe_events();
    let session = session(1);
    let ctx = context(&session);

    let response = manager
        .create_subscription(&ctx, &CreateSubscriptionRequest::default())
        .unwrap();
    assert_eq!(response.subscription_id, 1);
    assert_eq!(response.revised_publishing_interval, 1000.0);
    assert_eq!(response.revised_max_keep_alive_count, 10);
    assert_eq!(response.revised_lifetime_count, 60);

    assert_eq!(manager.subscription_count(), 1);
    assert!(manager.session_queue(1).is_some());
    assert_eq!(
        events(&mut rx),
        vec![SubscriptionEvent::Created {
            subscription_id: 1,
            session_id: 1
        }]
    );
    let summary = manager.diagnostics_summary();
    assert_eq!(summary.current_subscription_count, 1);
    assert_eq!(summary.publishing_intervals.get(&1000), Some(&1));
}

#[test]
fn subscription_limit() {
    let (manager, _) = manager_with_config(SubscriptionConfig {
        max_subscription_count: 2,
        ..Default::default()
    });
    let session = session(1);
    let ctx = context(&session);
    let request = CreateSubscriptionRequest::default();
    manager.create_subscription(&ctx, &request).unwrap();
    manager.create_subscription(&ctx, &request).unwrap();
    assert_eq!(
        manager.create_subscription(&ctx, &request).err(),
        Some(StatusCode::BadTooManySubscriptions)
    );
}

#[test]
fn modify_subscription_revises_parameters() {
    let (manager, _) = manager();
    let session = session(1);
    let ctx = context(&session);
    let id = create(&manager, &ctx, 3, 100);

    let request = ModifySubscriptionRequest {
        subscription_id: id,
        requested_publishing_interval: 500.0,
        requested_lifetime_count: 10,
        requested_max_keep_alive_count: 5,
        max_notifications_per_publish: 0,
        priority: 7,
    };
    let response = manager.modify_subscription(&ctx, &request).unwrap();
    assert_eq!(response.revised_publishing_interval, 500.0);
    assert_eq!(response.revised_max_keep_alive_count, 5);
    // Three keep alives, then raised to the 10 second minimum lifetime
    assert_eq!(response.revised_lifetime_count, 20);

    let diagnostics = manager.subscription_diagnostics(id).unwrap();
    assert_eq!(diagnostics.priority, 7);
    assert_eq!(diagnostics.modify_count, 1);
    let summary = manager.diagnostics_summary();
    assert_eq!(summary.publishing_intervals.get(&500), Some(&1));
    assert_eq!(summary.publishing_intervals.get(&100), None);

    let other = super::session(2);
    assert_eq!(
        manager
            .modify_subscription(&context(&other), &request)
            .err(),
        Some(StatusCode::BadSubscriptionIdInvalid)
    );
}

#[test]
fn delete_subscriptions() {
    let (manager, _) = manager();
    let mut rx = manager.subscribe_events();
    let session = session(1);
    let ctx = context(&session);
    let id = create(&manager, &ctx, 3, 100);

    let other = super::session(2);
    assert_eq!(
        manager.delete_subscription(&context(&other), id).err(),
        Some(StatusCode::BadSubscriptionIdInvalid)
    );
    assert_eq!(
        manager.delete_subscriptions(&ctx, &[]).err(),
        Some(StatusCode::BadNothingToDo)
    );
    assert_eq!(
        manager.delete_subscriptions(&ctx, &[id, 99]).unwrap(),
        vec![StatusCode::Good, StatusCode::BadSubscriptionIdInvalid]
    );
    assert_eq!(manager.subscription_count(), 0);
    assert_eq!(
        manager.publish(&ctx, &publish_request()).err(),
        Some(StatusCode::BadNoSubscription)
    );
    assert_eq!(
        events(&mut rx),
        vec![
            SubscriptionEvent::Created {
                subscription_id: id,
                session_id: 1
            },
            SubscriptionEvent::Deleted { subscription_id: id }
        ]
    );
}

#[test]
fn set_publishing_mode_results() {
    let (manager, _) = manager();
    let session = session(1);
    let ctx = context(&session);
    let id = create(&manager, &ctx, 3, 100);

    assert_eq!(
        manager.set_publishing_mode(&ctx, false, &[id, 99]).unwrap(),
        vec![StatusCode::Good, StatusCode::BadSubscriptionIdInvalid]
    );
    assert!(!manager.subscription_diagnostics(id).unwrap().publishing_enabled);
    assert_eq!(
        manager.set_publishing_mode(&ctx, true, &[]).err(),
        Some(StatusCode::BadNothingToDo)
    );
}

#[test]
fn publish_without_session_queue() {
    let (manager, _) = manager();
    let session = session(1);
    assert_eq!(
        manager.publish(&context(&session), &publish_request()).err(),
        Some(StatusCode::BadNoSubscription)
    );
}

#[test]
fn keep_alive_through_the_manager() {
    let (manager, _) = manager();
    let session = session(1);
    let ctx = context(&session);
    let id = create(&manager, &ctx, 3, 100);
    let base = Instant::now();
    for i in 1..=3 {
        manager.publish_timer_expired_at(tick(base, i));
    }

    let response = manager.publish(&ctx, &publish_request()).unwrap();
    assert_eq!(response.subscription_id, id);
    assert!(response.notification_message.is_keep_alive());
    assert_eq!(response.notification_message.sequence_number, 1);
    assert_eq!(response.available_sequence_numbers, None);
    assert!(!response.more_notifications);
    assert_eq!(response.results, None);
}

#[test]
fn data_change_ack_and_republish() {
    let (manager, nm) = manager();
    let session = session(1);
    let ctx = context(&session);
    let id = create(&manager, &ctx, 3, 100);
    nm.set_value(&node("v"), 7);
    let results = manager
        .create_monitored_items(
            &ctx,
            id,
            TimestampsToReturn::Both,
            &[data_item_request(1, node("v"), MonitoringMode::Reporting)],
        )
        .unwrap();
    assert!(results[0].status_code.is_good());

    let base = Instant::now();
    manager.publish_timer_expired_at(tick(base, 1));
    let response = manager.publish(&ctx, &publish_request()).unwrap();
    assert_eq!(response.notification_message.sequence_number, 1);
    assert_eq!(response.notification_message.notification_count(), 1);
    assert_eq!(response.available_sequence_numbers, Some(vec![1]));

    let message = manager.republish(&ctx, id, 1).unwrap();
    assert_eq!(message, response.notification_message);
    assert_eq!(
        manager.republish(&ctx, 99, 1).err(),
        Some(StatusCode::BadSubscriptionIdInvalid)
    );

    // Wait for the next keep alive, carrying the acknowledgement
    for i in 2..=4 {
        manager.publish_timer_expired_at(tick(base, i));
    }
    let request = PublishRequest {
        subscription_acknowledgements: Some(vec![
            SubscriptionAcknowledgement {
                subscription_id: id,
                sequence_number: 1,
            },
            SubscriptionAcknowledgement {
                subscription_id: id,
                sequence_number: 1,
            },
        ]),
    };
    let response = manager.publish(&ctx, &request).unwrap();
    assert!(response.notification_message.is_keep_alive());
    assert_eq!(response.notification_message.sequence_number, 2);
    assert_eq!(
        response.results,
        Some(vec![
            StatusCode::Good,
            StatusCode::BadSequenceNumberUnknown
        ])
    );
    assert_eq!(
        manager.republish(&ctx, id, 1).err(),
        Some(StatusCode::BadMessageNotAvailable)
    );
}

#[test]
fn monitored_item_calls_are_limited() {
    let (manager, _) = manager_with_config(SubscriptionConfig {
        max_monitored_items_per_call: 2,
        ..Default::default()
    });
    let session = session(1);
    let ctx = context(&session);
    let id = create(&manager, &ctx, 3, 100);

    let requests: Vec<_> = (1..=3)
        .map(|i| data_item_request(i, node("v"), MonitoringMode::Reporting))
        .collect();
    assert_eq!(
        manager
            .create_monitored_items(&ctx, id, TimestampsToReturn::Both, &requests)
            .err(),
        Some(StatusCode::BadTooManyOperations)
    );
    assert_eq!(
        manager
            .create_monitored_items(&ctx, id, TimestampsToReturn::Both, &[])
            .err(),
        Some(StatusCode::BadNothingToDo)
    );
    assert_eq!(
        manager.delete_monitored_items(&ctx, id, &[1, 2, 3]).err(),
        Some(StatusCode::BadTooManyOperations)
    );

    let results = manager
        .create_monitored_items(&ctx, id, TimestampsToReturn::Both, &requests[..2])
        .unwrap();
    let ids: Vec<_> = results.iter().map(|r| r.monitored_item_id).collect();
    assert_eq!(
        manager
            .set_monitoring_mode(&ctx, id, MonitoringMode::Disabled, &ids)
            .unwrap(),
        vec![StatusCode::Good, StatusCode::Good]
    );
    assert_eq!(
        manager
            .set_monitoring_mode(&ctx, 99, MonitoringMode::Disabled, &ids)
            .err(),
        Some(StatusCode::BadSubscriptionIdInvalid)
    );
    let result = manager.set_triggering(&ctx, id, ids[0], &[ids[1]], &[]).unwrap();
    assert_eq!(result.add_results, vec![StatusCode::Good]);
}

#[test]
fn expired_subscription_sends_status_message() {
    let (manager, _) = manager_with_config(short_lived_config());
    let mut rx = manager.subscribe_events();
    let session = session(1);
    let ctx = context(&session);
    let id = create(&manager, &ctx, 1, 3);

    let base = Instant::now();
    for i in 1..=4 {
        manager.publish_timer_expired_at(tick(base, i));
    }
    assert_eq!(manager.subscription_count(), 0);
    assert_eq!(manager.status_message_count(1), 1);
    assert_eq!(manager.diagnostics_summary().expired_subscription_count, 1);
    assert_eq!(
        events(&mut rx),
        vec![
            SubscriptionEvent::Created {
                subscription_id: id,
                session_id: 1
            },
            SubscriptionEvent::Expired { subscription_id: id },
            SubscriptionEvent::Deleted { subscription_id: id },
        ]
    );

    let response = manager.publish(&ctx, &publish_request()).unwrap();
    assert_eq!(response.subscription_id, id);
    assert_eq!(
        response.notification_message.status_change_status(),
        Some(StatusCode::BadTimeout)
    );
    assert_eq!(manager.status_message_count(1), 0);
    assert_eq!(
        manager.publish(&ctx, &publish_request()).err(),
        Some(StatusCode::BadNoSubscription)
    );
}

#[test]
fn transfer_notifies_the_previous_session() {
    let (manager, _) = manager();
    let mut rx = manager.subscribe_events();
    let session_a = session(1);
    let session_b = session(2);
    let ctx_a = context(&session_a);
    let ctx_b = context(&session_b);
    let id = create(&manager, &ctx_a, 3, 100);

    let publisher = {
        let manager = manager.clone();
        let ctx = ctx_a.clone();
        thread::spawn(move || manager.publish(&ctx, &publish_request()))
    };
    wait_until(|| queued_requests(&manager, 1) == 1);

    let results = manager
        .transfer_subscriptions(&ctx_b, &[id], false)
        .unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].status_code, StatusCode::Good);
    assert_eq!(results[0].available_sequence_numbers, Some(vec![]));

    let response = publisher.join().unwrap().unwrap();
    assert_eq!(response.subscription_id, id);
    assert_eq!(
        response.notification_message.status_change_status(),
        Some(StatusCode::GoodSubscriptionTransferred)
    );
    assert_eq!(
        manager.publish(&ctx_a, &publish_request()).err(),
        Some(StatusCode::BadNoSubscription)
    );

    assert_eq!(manager.subscription_diagnostics(id).unwrap().session_id, Some(2));
    assert_eq!(manager.session_queue(2).unwrap().subscription_count(), 1);
    assert!(events(&mut rx).contains(&SubscriptionEvent::Transferred {
        subscription_id: id,
        from_session_id: Some(1),
        to_session_id: 2,
    }));

    // The new session now receives the keep alives
    let base = Instant::now();
    for i in 1..=3 {
        manager.publish_timer_expired_at(tick(base, i));
    }
    let response = manager.publish(&ctx_b, &publish_request()).unwrap();
    assert_eq!(response.subscription_id, id);
    assert!(response.notification_message.is_keep_alive());
}

#[test]
fn transfer_status_message_waits_for_the_next_request() {
    let (manager, _) = manager();
    let session_a = session(1);
    let ctx_a = context(&session_a);
    let id = create(&manager, &ctx_a, 3, 100);

    let session_b = session(2);
    manager
        .transfer_subscriptions(&context(&session_b), &[id], true)
        .unwrap();
    assert_eq!(manager.status_message_count(1), 1);

    let response = manager.publish(&ctx_a, &publish_request()).unwrap();
    assert_eq!(
        response.notification_message.status_change_status(),
        Some(StatusCode::GoodSubscriptionTransferred)
    );
    assert_eq!(manager.status_message_count(1), 0);
}

#[test]
fn transfer_errors() {
    let (manager, _) = manager();
    let session_a = session(1);
    let ctx_a = context(&session_a);
    let id = create(&manager, &ctx_a, 3, 100);

    assert_eq!(
        manager.transfer_subscriptions(&ctx_a, &[], false).err(),
        Some(StatusCode::BadNothingToDo)
    );

    let results = manager
        .transfer_subscriptions(&ctx_a, &[id, 99], false)
        .unwrap();
    assert_eq!(results[0].status_code, StatusCode::BadNothingToDo);
    assert_eq!(results[1].status_code, StatusCode::BadSubscriptionIdInvalid);
    assert_eq!(results[1].available_sequence_numbers, None);

    let stranger = session_with_key(3, user_key("user2"));
    let results = manager
        .transfer_subscriptions(&context(&stranger), &[id], false)
        .unwrap();
    assert_eq!(results[0].status_code, StatusCode::BadUserAccessDenied);
    assert_eq!(manager.subscription_diagnostics(id).unwrap().session_id, Some(1));
}

#[test]
fn anonymous_transfer_needs_a_signed_channel() {
    let (manager, _) = manager();
    let anonymous = |mode| UserSecurityKey::new(UserToken::anonymous(), mode, "urn:test-client");
    let owner = session_with_key(1, anonymous(MessageSecurityMode::Sign));
    let id = create(&manager, &context(&owner), 3, 100);

    let unsigned = session_with_key(2, anonymous(MessageSecurityMode::None));
    let results = manager
        .transfer_subscriptions(&context(&unsigned), &[id], false)
        .unwrap();
    assert_eq!(results[0].status_code, StatusCode::BadUserAccessDenied);

    let signed = session_with_key(3, anonymous(MessageSecurityMode::SignAndEncrypt));
    let results = manager
        .transfer_subscriptions(&context(&signed), &[id], false)
        .unwrap();
    assert_eq!(results[0].status_code, StatusCode::Good);
}

#[test]
fn abandoned_subscription_can_be_claimed() {
    let (manager, _) = manager();
    let mut rx = manager.subscribe_events();
    let session_a = session(1);
    let id = create(&manager, &context(&session_a), 3, 100);

    manager.session_closing(1, false);
    assert_eq!(manager.subscription_count(), 1);
    assert_eq!(manager.abandoned_subscription_count(), 1);
    assert!(manager.session_queue(1).is_none());
    assert_eq!(manager.subscription_diagnostics(id).unwrap().session_id, None);

    let session_b = session(2);
    let results = manager
        .transfer_subscriptions(&context(&session_b), &[id], false)
        .unwrap();
    assert_eq!(results[0].status_code, StatusCode::Good);
    assert_eq!(manager.abandoned_subscription_count(), 0);
    assert_eq!(manager.status_message_count(1), 0);
    assert!(events(&mut rx).contains(&SubscriptionEvent::Transferred {
        subscription_id: id,
        from_session_id: None,
        to_session_id: 2,
    }));
}

#[test]
fn abandoned_subscription_expires() {
    let (manager, nm) = manager_with_config(short_lived_config());
    let session = session(1);
    let ctx = context(&session);
    let id = create(&manager, &ctx, 1, 3);
    create_monitored_item(&manager, &ctx, id);
    manager.session_closing(1, false);

    let base = Instant::now();
    for i in 1..=10 {
        manager.publish_timer_expired_at(tick(base, i));
    }
    assert_eq!(manager.subscription_count(), 0);
    assert_eq!(manager.abandoned_subscription_count(), 0);
    assert_eq!(nm.item_count(), 0);
    assert_eq!(manager.diagnostics_summary().expired_subscription_count, 1);
}

fn create_monitored_item(manager: &SubscriptionManager, ctx: &OperationContext, id: u32) -> u32 {
    manager
        .create_monitored_items(
            ctx,
            id,
            TimestampsToReturn::Both,
            &[data_item_request(1, node("v"), MonitoringMode::Reporting)],
        )
        .unwrap()[0]
        .monitored_item_id
}

#[test]
fn session_close_can_delete_subscriptions() {
    let (manager, nm) = manager();
    let session = session(1);
    let ctx = context(&session);
    let id = create(&manager, &ctx, 3, 100);
    let item_id = create_monitored_item(&manager, &ctx, id);

    let publisher = {
        let manager = manager.clone();
        let ctx = ctx.clone();
        thread::spawn(move || manager.publish(&ctx, &publish_request()))
    };
    wait_until(|| queued_requests(&manager, 1) == 1);

    manager.session_closing(1, true);
    assert_eq!(
        publisher.join().unwrap().err(),
        Some(StatusCode::BadSessionClosed)
    );
    assert_eq!(manager.subscription_count(), 0);
    assert_eq!(manager.abandoned_subscription_count(), 0);
    assert_eq!(nm.deleted(), vec![item_id]);
}

#[test]
fn shutdown_halts_waiting_requests() {
    let (manager, _) = manager();
    let publishers: Vec<_> = (1..=3)
        .map(|session_id| {
            let session = session(session_id);
            let ctx = context(&session);
            create(&manager, &ctx, 3, 100);
            let manager = manager.clone();
            thread::spawn(move || manager.publish(&ctx, &publish_request()))
        })
        .collect();
    wait_until(|| (1..=3).all(|session_id| queued_requests(&manager, session_id) == 1));

    manager.shutdown();
    for publisher in publishers {
        assert_eq!(
            publisher.join().unwrap().err(),
            Some(StatusCode::BadServerHalted)
        );
    }
    assert!(manager.is_shutdown());
    assert_eq!(manager.subscription_count(), 0);

    let session = session(1);
    let ctx = context(&session);
    assert_eq!(
        manager
            .create_subscription(&ctx, &CreateSubscriptionRequest::default())
            .err(),
        Some(StatusCode::BadServerHalted)
    );
    assert_eq!(
        manager.publish(&ctx, &publish_request()).err(),
        Some(StatusCode::BadServerHalted)
    );
    assert_eq!(
        manager.republish(&ctx, 1, 1).err(),
        Some(StatusCode::BadServerHalted)
    );
    // A second shutdown is harmless
    manager.shutdown();
}

#[test]
fn condition_refresh_is_deduplicated() {
    let (manager, nm) = manager();
    let session = session(1);
    let ctx = context(&session);
    let id = create(&manager, &ctx, 3, 100);
    let results = manager
        .create_monitored_items(
            &ctx,
            id,
            TimestampsToReturn::Both,
            &[
                event_item_request(1),
                data_item_request(2, node("v"), MonitoringMode::Reporting),
            ],
        )
        .unwrap();
    let event_item = results[0].monitored_item_id;
    let data_item = results[1].monitored_item_id;
    nm.add_condition(BaseEventType::new(
        NodeId::new(2, "AlarmType"),
        NodeId::new(2, "Boiler"),
        "Too hot",
    ));

    assert_eq!(
        manager.condition_refresh2(&ctx, id, data_item).err(),
        Some(StatusCode::BadMonitoredItemIdInvalid)
    );
    manager.condition_refresh(&ctx, id).unwrap();
    assert_eq!(
        manager.condition_refresh(&ctx, id).err(),
        Some(StatusCode::BadRefreshInProgress)
    );
    // A refresh of a single item is a different request
    manager.condition_refresh2(&ctx, id, event_item).unwrap();
    assert_eq!(manager.run_condition_refreshes(), 2);
    assert_eq!(manager.run_condition_refreshes(), 0);

    manager.publish_timer_expired_at(tick(Instant::now(), 1));
    let response = manager.publish(&ctx, &publish_request()).unwrap();
    let (_, events) = response.notification_message.notifications().unwrap();
    // Two refreshes, each a start event, the condition and an end event
    assert_eq!(events.len(), 6);

    // Once done the same refresh can be requested again
    manager.condition_refresh(&ctx, id).unwrap();
}

#[tokio::test]
async fn begin_publish_reports_through_the_callback() {
    let (manager, nm) = manager();
    let session = session(1);
    let ctx = context(&session);
    let id = create(&manager, &ctx, 3, 100);
    nm.set_value(&node("v"), 3);
    create_monitored_item(&manager, &ctx, id);
    manager.publish_timer_expired_at(tick(Instant::now(), 1));

    let (tx, rx) = oneshot::channel();
    manager.begin_publish(AsyncPublishOperation::new(
        ctx.clone(),
        publish_request(),
        move |result| {
            let _ = tx.send(result);
        },
    ));
    let response = rx.await.unwrap().unwrap();
    assert_eq!(response.subscription_id, id);
    assert_eq!(response.notification_message.notification_count(), 1);

    manager.shutdown();
    let (tx, rx) = oneshot::channel();
    manager.begin_publish(AsyncPublishOperation::new(
        ctx,
        publish_request(),
        move |result| {
            let _ = tx.send(result);
        },
    ));
    assert_eq!(rx.await.unwrap().err(), Some(StatusCode::BadServerHalted));
}

/// An item that always claims to be ready but never has anything to report
struct SilentItem {
    id: u32,
}

impl MonitoredItem for SilentItem {
    fn id(&self) -> u32 {
        self.id
    }

    fn client_handle(&self) -> u32 {
        self.id
    }

    fn kind(&self) -> MonitoredItemKind {
        MonitoredItemKind::DataChange
    }

    fn monitoring_mode(&self) -> MonitoringMode {
        MonitoringMode::Reporting
    }

    fn set_monitoring_mode(&self, _monitoring_mode: MonitoringMode) {}

    fn sampling_interval(&self) -> f64 {
        PUBLISHING_INTERVAL
    }

    fn queue_size(&self) -> usize {
        1
    }

    fn is_ready_to_publish(&self) -> bool {
        true
    }

    fn is_ready_to_trigger(&self) -> bool {
        false
    }

    fn clear_ready_to_trigger(&self) {}

    fn set_triggered(&self) -> bool {
        false
    }

    fn is_resend_data(&self) -> bool {
        false
    }

    fn set_resend_data(&self) {}

    fn publish(
        &self,
        _data_changes: &mut std::collections::VecDeque<MonitoredItemNotification>,
        _events: &mut std::collections::VecDeque<EventFieldList>,
    ) -> bool {
        false
    }

    fn queue_event(&self, _event: &dyn crate::server::events::Event) -> bool {
        false
    }
}

struct SilentNodeManager {
    next_item_id: AtomicHandle,
}

impl NodeManager for SilentNodeManager {
    fn create_monitored_items(
        &self,
        _context: &OperationContext,
        _subscription_id: u32,
        _publishing_interval: f64,
        _timestamps_to_return: TimestampsToReturn,
        items: &[MonitoredItemCreateRequest],
    ) -> Vec<Result<Arc<dyn MonitoredItem>, StatusCode>> {
        items
            .iter()
            .map(|_| {
                Ok(Arc::new(SilentItem {
                    id: self.next_item_id.next(),
                }) as Arc<dyn MonitoredItem>)
            })
            .collect()
    }

    fn modify_monitored_items(
        &self,
        _context: &OperationContext,
        _subscription_id: u32,
        _publishing_interval: f64,
        _timestamps_to_return: TimestampsToReturn,
        items: &[(Arc<dyn MonitoredItem>, MonitoredItemModifyRequest)],
    ) -> Vec<MonitoredItemModifyResult> {
        items
            .iter()
            .map(|_| MonitoredItemModifyResult::error(StatusCode::BadMonitoredItemIdInvalid))
            .collect()
    }
}

#[test]
fn false_alarm_keeps_the_request_queued() {
    let manager = Arc::new(SubscriptionManager::new(
        SubscriptionConfig::default(),
        Arc::new(SilentNodeManager {
            next_item_id: AtomicHandle::new(1),
        }),
    ));
    let session = session(1);
    let ctx = context(&session);
    // Keep alive far enough away that it never covers for the silent item
    let subscription_id = create(&manager, &ctx, 100, 300);
    manager
        .create_monitored_items(
            &ctx,
            subscription_id,
            TimestampsToReturn::Both,
            &[data_item_request(1, node("v1"), MonitoringMode::Reporting)],
        )
        .unwrap();

    let publisher = {
        let manager = manager.clone();
        let ctx = ctx.clone();
        thread::spawn(move || manager.publish(&ctx, &publish_request()))
    };
    wait_until(|| queued_requests(&manager, 1) == 1);

    let base = Instant::now();
    for i in 1..=5u32 {
        manager.publish_timer_expired_at(tick(base, i));
        // The subscription was handed the request, found nothing and gave it back
        wait_until(|| {
            manager
                .subscription_diagnostics(subscription_id)
                .map(|d| d.publish_request_count >= i)
                .unwrap_or(false)
                && queued_requests(&manager, 1) == 1
        });
    }
    assert!(!publisher.is_finished());

    manager.shutdown();
    assert_eq!(
        publisher.join().unwrap().err(),
        Some(StatusCode::BadServerHalted)
    );
}
