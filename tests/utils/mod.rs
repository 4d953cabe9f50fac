use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use opcua_subscriptions::{prelude::*, sync::Mutex};

/// An address space of variables held in memory. Setting a value notifies every data change
/// item watching the variable, the way a sampling node manager would.
pub struct MemoryNodeManager {
    next_item_id: AtomicHandle,
    values: Mutex<HashMap<NodeId, DataValue>>,
    items: Mutex<Vec<Arc<QueuedMonitoredItem>>>,
    conditions: Mutex<Vec<BaseEventType>>,
    /// While set, deleting monitored items blocks the calling thread
    hold_deletes: AtomicBool,
    deleted: AtomicUsize,
}

impl MemoryNodeManager {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            next_item_id: AtomicHandle::new(1),
            values: Mutex::new(HashMap::new()),
            items: Mutex::new(Vec::new()),
            conditions: Mutex::new(Vec::new()),
            hold_deletes: AtomicBool::new(false),
            deleted: AtomicUsize::new(0),
        })
    }

    pub fn set_value(&self, node_id: &NodeId, value: impl Into<DataValue>) {
        let value = value.into();
        self.values
            .lock()
            .insert(node_id.clone(), value.clone());
        for item in self.items.lock().iter() {
            if &item.item_to_monitor().node_id == node_id {
                item.notify_data_value(value.clone());
            }
        }
    }

    pub fn add_condition(&self, condition: BaseEventType) {
        self.conditions.lock().push(condition);
    }

    pub fn hold_deletes(&self, hold: bool) {
        self.hold_deletes.store(hold, Ordering::SeqCst);
    }

    /// Number of monitored items deleted so far
    pub fn deleted(&self) -> usize {
        self.deleted.load(Ordering::SeqCst)
    }
}

impl NodeManager for MemoryNodeManager {
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
                let item = Arc::new(QueuedMonitoredItem::new(
                    self.next_item_id.next(),
                    request,
                    timestamps_to_return,
                    sanitize_sampling_interval(
                        50.0,
                        publishing_interval,
                        request.requested_parameters.sampling_interval,
                    ),
                    sanitize_queue_size(10, request.requested_parameters.queue_size as usize),
                )?);
                if let Some(value) = self
                    .values
                    .lock()
                    .get(&request.item_to_monitor.node_id)
                {
                    item.notify_data_value(value.clone());
                }
                self.items.lock().push(item.clone());
                Ok(item as Arc<dyn MonitoredItem>)
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

    fn delete_monitored_items(
        &self,
        _context: Option<&OperationContext>,
        _subscription_id: u32,
        items: &[Arc<dyn MonitoredItem>],
    ) -> Vec<StatusCode> {
        while self.hold_deletes.load(Ordering::SeqCst) {
            std::thread::sleep(Duration::from_millis(10));
        }
        let mut known = self.items.lock();
        known.retain(|i| !items.iter().any(|d| d.id() == i.id()));
        self.deleted.fetch_add(items.len(), Ordering::SeqCst);
        vec![StatusCode::Good; items.len()]
    }

    fn condition_refresh(
        &self,
        _context: &OperationContext,
        _subscription_id: u32,
        items: &[Arc<dyn MonitoredItem>],
    ) -> Result<(), StatusCode> {
        for condition in self.conditions.lock().iter() {
            for item in items {
                item.queue_event(condition);
            }
        }
        Ok(())
    }
}

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn session(session_id: u32) -> Arc<Session> {
    Arc::new(Session::new(
        session_id,
        session_id,
        UserSecurityKey::new(
            UserToken("sample".to_string()),
            MessageSecurityMode::SignAndEncrypt,
            "urn:sample-client",
        ),
    ))
}

pub fn context(session: &Arc<Session>) -> OperationContext {
    OperationContext::new(session.clone(), 1, Duration::from_secs(30))
}

/// Starts a manager with its publish ticker on the current runtime.
pub fn start_manager(node_manager: Arc<MemoryNodeManager>) -> Arc<SubscriptionManager> {
    start_manager_with_config(node_manager, SubscriptionConfig::default())
}

pub fn start_manager_with_config(
    node_manager: Arc<MemoryNodeManager>,
    config: SubscriptionConfig,
) -> Arc<SubscriptionManager> {
    init_logging();
    let manager = Arc::new(SubscriptionManager::new(config, node_manager));
    manager.startup().unwrap();
    manager
}

pub fn create_subscription(
    manager: &SubscriptionManager,
    context: &OperationContext,
    max_keep_alive_count: u32,
) -> u32 {
    create_subscription_with_lifetime(manager, context, max_keep_alive_count, 300)
}

pub fn create_subscription_with_lifetime(
    manager: &SubscriptionManager,
    context: &OperationContext,
    max_keep_alive_count: u32,
    lifetime_count: u32,
) -> u32 {
    manager
        .create_subscription(
            context,
            &CreateSubscriptionRequest {
                requested_publishing_interval: 100.0,
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

pub fn value_item(client_handle: u32, node_id: NodeId) -> MonitoredItemCreateRequest {
    MonitoredItemCreateRequest::new(
        ReadValueId {
            node_id,
            attribute_id: AttributeId::Value,
            index_range: None,
        },
        MonitoringMode::Reporting,
        MonitoringParameters {
            client_handle,
            sampling_interval: 100.0,
            filter: MonitoringFilter::None,
            queue_size: 1,
            discard_oldest: true,
        },
    )
}

pub fn event_item(client_handle: u32) -> MonitoredItemCreateRequest {
    MonitoredItemCreateRequest::new(
        ReadValueId {
            node_id: NodeId::new(0, SERVER_OBJECT),
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
