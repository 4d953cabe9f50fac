use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use hashbrown::HashMap;

use crate::{
    core::handle::AtomicHandle,
    server::{
        constants,
        events::BaseEventType,
        monitored_item::{
            sanitize_queue_size, sanitize_sampling_interval, MonitoredItem, MonitoredItemKind,
            QueuedMonitoredItem,
        },
        node_manager::NodeManager,
        session::{OperationContext, Session, UserSecurityKey, UserToken},
        subscriptions::subscription::{Subscription, SubscriptionSettings},
    },
    sync::Mutex,
    types::*,
};

mod manager;

/// A node manager holding values in memory. Tests push values and events into it and it
/// forwards them to the monitored items watching them.
pub struct TestNodeManager {
    next_item_id: AtomicHandle,
    items: Mutex<HashMap<u32, Arc<QueuedMonitoredItem>>>,
    values: Mutex<HashMap<NodeId, DataValue>>,
    deleted: Mutex<Vec<u32>>,
    /// Active conditions queued on event items during a condition refresh
    conditions: Mutex<Vec<BaseEventType>>,
}

impl TestNodeManager {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            next_item_id: AtomicHandle::new(1),
            items: Mutex::new(HashMap::new()),
            values: Mutex::new(HashMap::new()),
            deleted: Mutex::new(Vec::new()),
            conditions: Mutex::new(Vec::new()),
        })
    }

    pub fn set_value(&self, node_id: &NodeId, value: impl Into<DataValue>) {
        let value = value.into();
        trace_lock!(self.values).insert(node_id.clone(), value.clone());
        let items: Vec<_> = trace_lock!(self.items).values().cloned().collect();
        for item in items {
            if &item.item_to_monitor().node_id == node_id {
                item.notify_data_value(value.clone());
            }
        }
    }

    pub fn raise_event(&self, event: &BaseEventType) {
        let items: Vec<_> = trace_lock!(self.items).values().cloned().collect();
        for item in items {
            item.notify_event(event);
        }
    }

    pub fn add_condition(&self, condition: BaseEventType) {
        trace_lock!(self.conditions).push(condition);
    }

    pub fn deleted(&self) -> Vec<u32> {
        trace_lock!(self.deleted).clone()
    }

    /// Drops an item without telling its subscription, so deleting it later fails
    pub fn forget_item(&self, id: u32) {
        trace_lock!(self.items).remove(&id);
    }

    pub fn item_count(&self) -> usize {
        trace_lock!(self.items).len()
    }
}

impl NodeManager for TestNodeManager {
    fn create_monitored_items(
        &self,
        _context: &OperationContext,
        _subscription_id: u32,
        publishing_interval: f64,
        timestamps_to_return: TimestampsToReturn,
        items: &[MonitoredItemCreateRequest],
    ) -> Vec<Result<Arc<dyn MonitoredItem>, StatusCode>> {
        items
            .iter()
            .map(|request| {
                let sampling_interval = sanitize_sampling_interval(
                    constants::MIN_SAMPLING_INTERVAL_MS,
                    publishing_interval,
                    request.requested_parameters.sampling_interval,
                );
                let queue_size = sanitize_queue_size(
                    constants::MAX_DATA_CHANGE_QUEUE_SIZE,
                    request.requested_parameters.queue_size as usize,
                );
                let item = Arc::new(QueuedMonitoredItem::new(
                    self.next_item_id.next(),
                    request,
                    timestamps_to_return,
                    sampling_interval,
                    queue_size,
                )?);
                if item.kind() == MonitoredItemKind::DataChange {
                    let value = trace_lock!(self.values)
                        .get(&request.item_to_monitor.node_id)
                        .cloned();
                    if let Some(value) = value {
                        item.notify_data_value(value);
                    }
                }
                trace_lock!(self.items).insert(item.id(), item.clone());
                Ok(item as Arc<dyn MonitoredItem>)
            })
            .collect()
    }

    fn modify_monitored_items(
        &self,
        _context: &OperationContext,
        _subscription_id: u32,
        publishing_interval: f64,
        timestamps_to_return: TimestampsToReturn,
        items: &[(Arc<dyn MonitoredItem>, MonitoredItemModifyRequest)],
    ) -> Vec<MonitoredItemModifyResult> {
        let known = trace_lock!(self.items);
        items
            .iter()
            .map(|(item, request)| match known.get(&item.id()) {
                Some(item) => item.modify(
                    timestamps_to_return,
                    request,
                    sanitize_sampling_interval(
                        constants::MIN_SAMPLING_INTERVAL_MS,
                        publishing_interval,
                        request.requested_parameters.sampling_interval,
                    ),
                    sanitize_queue_size(
                        constants::MAX_DATA_CHANGE_QUEUE_SIZE,
                        request.requested_parameters.queue_size as usize,
                    ),
                ),
                None => MonitoredItemModifyResult::error(StatusCode::BadMonitoredItemIdInvalid),
            })
            .collect()
    }

    fn delete_monitored_items(
        &self,
        _context: Option<&OperationContext>,
        _subscription_id: u32,
        items: &[Arc<dyn MonitoredItem>],
    ) -> Vec<StatusCode> {
        let mut known = trace_lock!(self.items);
        let mut deleted = trace_lock!(self.deleted);
        items
            .iter()
            .map(|item| {
                deleted.push(item.id());
                if known.remove(&item.id()).is_some() {
                    StatusCode::Good
                } else {
                    StatusCode::BadMonitoredItemIdInvalid
                }
            })
            .collect()
    }

    fn condition_refresh(
        &self,
        _context: &OperationContext,
        _subscription_id: u32,
        items: &[Arc<dyn MonitoredItem>],
    ) -> Result<(), StatusCode> {
        let conditions = trace_lock!(self.conditions);
        for item in items {
            for condition in conditions.iter() {
                item.queue_event(condition);
            }
        }
        Ok(())
    }
}

pub const PUBLISHING_INTERVAL: f64 = 100.0;

pub fn interval() -> Duration {
    Duration::from_millis(PUBLISHING_INTERVAL as u64)
}

/// The instant `ticks` publishing intervals after `base`
pub fn tick(base: Instant, ticks: u32) -> Instant {
    base + interval() * ticks
}

pub fn user_key(user: &str) -> UserSecurityKey {
    UserSecurityKey::new(
        UserToken(user.to_string()),
        MessageSecurityMode::SignAndEncrypt,
        "urn:test-client",
    )
}

pub fn session(session_id: u32) -> Arc<Session> {
    session_with_key(session_id, user_key("user1"))
}

pub fn session_with_key(session_id: u32, key: UserSecurityKey) -> Arc<Session> {
    Arc::new(Session::new(session_id, session_id + 100, key))
}

pub fn context(session: &Arc<Session>) -> OperationContext {
    OperationContext::new(session.clone(), 1, Duration::from_secs(30))
}

pub fn settings() -> SubscriptionSettings {
    SubscriptionSettings {
        publishing_interval: PUBLISHING_INTERVAL,
        max_keep_alive_count: 3,
        max_lifetime_count: 9,
        max_notifications_per_publish: 0,
        priority: 0,
        publishing_enabled: true,
        max_message_count: 10,
        max_monitored_items: 100,
    }
}

pub fn subscription(
    id: u32,
    session: &Arc<Session>,
    node_manager: &Arc<TestNodeManager>,
    settings: SubscriptionSettings,
) -> Arc<Subscription> {
    Arc::new(Subscription::new(
        id,
        session.clone(),
        node_manager.clone(),
        settings,
    ))
}

pub fn node(name: &str) -> NodeId {
    NodeId::new(2, name.to_string())
}

pub fn data_item_request(
    client_handle: u32,
    node_id: NodeId,
    monitoring_mode: MonitoringMode,
) -> MonitoredItemCreateRequest {
    MonitoredItemCreateRequest::new(
        ReadValueId {
            node_id,
            attribute_id: AttributeId::Value,
            index_range: None,
        },
        monitoring_mode,
        MonitoringParameters {
            client_handle,
            sampling_interval: -1.0,
            filter: MonitoringFilter::None,
            queue_size: 5,
            discard_oldest: true,
        },
    )
}

pub fn event_item_request(client_handle: u32) -> MonitoredItemCreateRequest {
    MonitoredItemCreateRequest::new(
        ReadValueId {
            node_id: NodeId::new(0, crate::server::events::SERVER_OBJECT),
            attribute_id: AttributeId::EventNotifier,
            index_range: None,
        },
        MonitoringMode::Reporting,
        MonitoringParameters {
            client_handle,
            sampling_interval: 0.0,
            filter: MonitoringFilter::Event(EventFilter {
                select_clauses: vec!["EventType".to_string(), "Message".to_string()],
            }),
            queue_size: 10,
            discard_oldest: true,
        },
    )
}

/// Creates monitored items and returns their ids, panicking if any fails.
pub fn create_items(
    subscription: &Subscription,
    context: &OperationContext,
    requests: &[MonitoredItemCreateRequest],
) -> Vec<u32> {
    subscription
        .create_monitored_items(context, TimestampsToReturn::Both, requests)
        .unwrap()
        .into_iter()
        .map(|r| {
            assert!(r.status_code.is_good(), "{}", r.status_code);
            r.monitored_item_id
        })
        .collect()
}
