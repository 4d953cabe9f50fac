// OPCUA for Rust
// SPDX-License-Identifier: MPL-2.0
// Copyright (C) 2017-2024 Adam Lock

//! The node manager is the collaborator that owns the address space. The engine asks it to
//! create monitored items and tells it about changes to them. All methods take and return
//! parallel lists, one result per item.
//!
//! The engine calls into the node manager while holding the lock of the subscription the
//! items belong to, so implementations must not call back into the engine.

use std::sync::Arc;

use crate::{
    server::{monitored_item::MonitoredItem, session::OperationContext},
    types::{
        MonitoredItemCreateRequest, MonitoredItemModifyRequest, MonitoredItemModifyResult,
        MonitoringMode, StatusCode, TimestampsToReturn,
    },
};

pub trait NodeManager: Send + Sync {
    /// Create monitored items for a subscription. Each item gets its own result, a failed item
    /// does not fail the others. The initial value of a data change item should be queued on
    /// the item before it is returned.
    fn create_monitored_items(
        &self,
        context: &OperationContext,
        subscription_id: u32,
        publishing_interval: f64,
        timestamps_to_return: TimestampsToReturn,
        items: &[MonitoredItemCreateRequest],
    ) -> Vec<Result<Arc<dyn MonitoredItem>, StatusCode>>;

    /// Apply new parameters to existing monitored items.
    fn modify_monitored_items(
        &self,
        context: &OperationContext,
        subscription_id: u32,
        publishing_interval: f64,
        timestamps_to_return: TimestampsToReturn,
        items: &[(Arc<dyn MonitoredItem>, MonitoredItemModifyRequest)],
    ) -> Vec<MonitoredItemModifyResult>;

    /// Stop sampling and forget the monitored items. There is no request context when the
    /// items are deleted because their subscription expired.
    fn delete_monitored_items(
        &self,
        _context: Option<&OperationContext>,
        _subscription_id: u32,
        items: &[Arc<dyn MonitoredItem>],
    ) -> Vec<StatusCode> {
        vec![StatusCode::Good; items.len()]
    }

    /// Pause or resume sampling. The node manager should keep sampling so long as the mode is
    /// not `Disabled`.
    fn set_monitoring_mode(
        &self,
        _context: &OperationContext,
        _subscription_id: u32,
        monitoring_mode: MonitoringMode,
        items: &[Arc<dyn MonitoredItem>],
    ) -> Vec<StatusCode> {
        items
            .iter()
            .map(|item| {
                item.set_monitoring_mode(monitoring_mode);
                StatusCode::Good
            })
            .collect()
    }

    /// The subscription owning the items moved to another session. If `send_initial_values` is
    /// set, each item must report its current value again on the next publish.
    fn transfer_monitored_items(
        &self,
        _context: &OperationContext,
        _subscription_id: u32,
        send_initial_values: bool,
        items: &[Arc<dyn MonitoredItem>],
    ) -> Vec<StatusCode> {
        items
            .iter()
            .map(|item| {
                if send_initial_values {
                    item.set_resend_data();
                }
                StatusCode::Good
            })
            .collect()
    }

    /// Queue the current state of every active condition on the supplied event items. The
    /// engine brackets the call with refresh start and end events.
    fn condition_refresh(
        &self,
        _context: &OperationContext,
        _subscription_id: u32,
        _items: &[Arc<dyn MonitoredItem>],
    ) -> Result<(), StatusCode> {
        Ok(())
    }
}
