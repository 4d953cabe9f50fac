// OPCUA for Rust
// SPDX-License-Identifier: MPL-2.0
// Copyright (C) 2017-2024 Adam Lock

//! Completion of queued publish requests.
//!
//! A publish request that cannot be answered straight away is parked in its session queue as
//! the sending half of a oneshot channel. Whoever later finds work for it, the ticker or a
//! subscription finishing a publish with more to send, completes the channel. The blocking
//! and the asynchronous flavours of publish both wait on the receiving half, the blocking one
//! through `futures::executor::block_on`.

use std::sync::Arc;

use tokio::sync::oneshot;

use crate::{
    server::{
        session::OperationContext,
        subscriptions::{subscription::Subscription, SubscriptionManager},
    },
    types::{PublishRequest, PublishResponse, StatusCode},
};

/// Why a parked publish request was woken.
pub enum PublishWake {
    /// The subscription was selected to answer the request and is marked as publishing
    Assigned(Arc<Subscription>),
    /// A status message is waiting for the session
    StatusMessage,
}

pub(crate) type PublishCompletion = oneshot::Sender<Result<PublishWake, StatusCode>>;

/// The waiting half of a parked publish request.
pub struct PublishWaiter {
    receiver: oneshot::Receiver<Result<PublishWake, StatusCode>>,
}

impl PublishWaiter {
    pub(crate) fn new() -> (PublishCompletion, PublishWaiter) {
        let (sender, receiver) = oneshot::channel();
        (sender, PublishWaiter { receiver })
    }

    pub async fn wait(self) -> Result<PublishWake, StatusCode> {
        // The queue dropping the request without completing it means it is being torn down
        self.receiver
            .await
            .unwrap_or(Err(StatusCode::BadServerHalted))
    }

    pub fn wait_blocking(self) -> Result<PublishWake, StatusCode> {
        futures::executor::block_on(self.wait())
    }
}

pub type PublishCallback = Box<dyn FnOnce(Result<PublishResponse, StatusCode>) + Send>;

/// A publish request answered through a callback instead of by blocking the caller. The
/// operation runs as a task and invokes the callback exactly once, either with the response
/// or with the reason the request failed.
pub struct AsyncPublishOperation {
    context: OperationContext,
    request: PublishRequest,
    callback: PublishCallback,
}

impl AsyncPublishOperation {
    pub fn new<F>(context: OperationContext, request: PublishRequest, callback: F) -> Self
    where
        F: FnOnce(Result<PublishResponse, StatusCode>) + Send + 'static,
    {
        Self {
            context,
            request,
            callback: Box::new(callback),
        }
    }

    pub fn context(&self) -> &OperationContext {
        &self.context
    }

    /// Runs the request through the manager and hands the outcome to the callback.
    pub async fn complete_publish(self, manager: Arc<SubscriptionManager>) {
        let result = manager.publish_async(&self.context, &self.request).await;
        if let Err(status_code) = result {
            debug!(
                "Publish request {} of session {} failed, {}",
                self.context.request_handle,
                self.context.session_id(),
                status_code
            );
        }
        (self.callback)(result);
    }

    pub fn fail(self, status_code: StatusCode) {
        debug!(
            "Publish request {} of session {} failed before it was queued, {}",
            self.context.request_handle,
            self.context.session_id(),
            status_code
        );
        (self.callback)(Err(status_code));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dropped_completion_reports_halted() {
        let (sender, waiter) = PublishWaiter::new();
        drop(sender);
        assert_eq!(
            waiter.wait_blocking().err(),
            Some(StatusCode::BadServerHalted)
        );
    }

    #[test]
    fn completion_delivers_status() {
        let (sender, waiter) = PublishWaiter::new();
        let _ = sender.send(Err(StatusCode::BadTimeout));
        assert_eq!(waiter.wait_blocking().err(), Some(StatusCode::BadTimeout));
    }
}
