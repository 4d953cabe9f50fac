// OPCUA for Rust
// SPDX-License-Identifier: MPL-2.0
// Copyright (C) 2017-2024 Adam Lock

//! Condition refreshes run on their own worker, one at a time, so the refresh start and end
//! events of one refresh never interleave with those of another.

use std::{collections::VecDeque, sync::Arc};

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::{
    server::{session::OperationContext, subscriptions::subscription::Subscription},
    sync::Mutex,
    types::StatusCode,
};

#[derive(Clone)]
struct RefreshTask {
    context: OperationContext,
    subscription: Arc<Subscription>,
    /// 0 refreshes every event item of the subscription
    monitored_item_id: u32,
}

impl RefreshTask {
    fn is_same(&self, subscription_id: u32, monitored_item_id: u32) -> bool {
        self.subscription.id() == subscription_id && self.monitored_item_id == monitored_item_id
    }
}

/// Work queue of pending condition refreshes. A task stays at the front of the queue while it
/// runs, so a duplicate request is rejected until the refresh has finished.
#[derive(Default)]
pub struct ConditionRefreshQueue {
    tasks: Mutex<VecDeque<RefreshTask>>,
    notify: Notify,
}

impl ConditionRefreshQueue {
    pub fn enqueue(
        &self,
        context: OperationContext,
        subscription: Arc<Subscription>,
        monitored_item_id: u32,
    ) -> Result<(), StatusCode> {
        {
            let mut tasks = trace_lock!(self.tasks);
            if tasks
                .iter()
                .any(|t| t.is_same(subscription.id(), monitored_item_id))
            {
                debug!(
                    "Condition refresh of subscription {}, item {} is already in progress",
                    subscription.id(),
                    monitored_item_id
                );
                return Err(StatusCode::BadRefreshInProgress);
            }
            tasks.push_back(RefreshTask {
                context,
                subscription,
                monitored_item_id,
            });
        }
        self.notify.notify_one();
        Ok(())
    }

    pub fn len(&self) -> usize {
        trace_lock!(self.tasks).len()
    }

    pub fn is_empty(&self) -> bool {
        trace_lock!(self.tasks).is_empty()
    }

    pub fn clear(&self) {
        trace_lock!(self.tasks).clear();
    }

    /// Runs queued refreshes in order until the queue is empty. Returns how many ran.
    pub fn run_pending(&self) -> usize {
        let mut count = 0;
        loop {
            let Some(task) = trace_lock!(self.tasks).front().cloned() else {
                break;
            };
            let subscription_id = task.subscription.id();
            if let Err(status_code) = task
                .subscription
                .condition_refresh(&task.context, task.monitored_item_id)
            {
                warn!(
                    "Condition refresh of subscription {} did not complete, {}",
                    subscription_id, status_code
                );
            }
            count += 1;
            let mut tasks = trace_lock!(self.tasks);
            if tasks
                .front()
                .map(|t| t.is_same(subscription_id, task.monitored_item_id))
                .unwrap_or(false)
            {
                tasks.pop_front();
            }
        }
        count
    }

    /// Worker loop. Drains the queue on the blocking pool, then sleeps until a refresh is
    /// queued or the token is cancelled.
    pub async fn run(self: Arc<Self>, token: CancellationToken) {
        info!("Condition refresh worker started");
        loop {
            let queue = self.clone();
            if let Err(e) = tokio::task::spawn_blocking(move || queue.run_pending()).await {
                error!("Condition refresh worker failed, {}", e);
                break;
            }
            tokio::select! {
                _ = self.notify.notified() => {}
                _ = token.cancelled() => break,
            }
        }
        info!("Condition refresh worker stopped");
    }
}
