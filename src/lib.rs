// OPCUA for Rust
// SPDX-License-Identifier: MPL-2.0
// Copyright (C) 2017-2024 Adam Lock

//! The publish / subscribe engine of an OPC UA server.
//!
//! The engine turns irregular client `Publish` requests into timely delivery of the
//! data change and event notifications accumulated by each subscription, with
//! retransmission, keep-alive and lifetime semantics as described in OPC UA Part 4.
//!
//! The entry point is [`server::SubscriptionManager`]. It owns one
//! [`server::SessionPublishQueue`] per session, which matches outstanding publish
//! requests against the [`server::Subscription`]s of that session. Monitored item values
//! are produced by a [`server::NodeManager`] supplied by the application.

#![allow(clippy::bool_assert_comparison)]
#![allow(clippy::float_cmp)]
#![allow(clippy::result_unit_err)]

#[macro_use]
extern crate bitflags;
#[macro_use]
extern crate log;
#[macro_use]
extern crate serde_derive;

/// Tracing macro for obtaining a lock on a `Mutex`. Sometimes deadlocks can happen in code,
/// and if they do, this macro is useful for finding out where they happened.
#[macro_export]
macro_rules! trace_lock {
    ( $x:expr ) => {
        {
//            use std::thread;
//            trace!("Thread {:?}, {} locking at {}, line {}", thread::current().id(), stringify!($x), file!(), line!());
            let v = $x.lock();
//            trace!("Thread {:?}, {} lock completed", thread::current().id(), stringify!($x));
            v
        }
    }
}

/// Tracing macro for obtaining a read lock on a `RwLock`.
#[macro_export]
macro_rules! trace_read_lock {
    ( $x:expr ) => {
        {
//            use std::thread;
//            trace!("Thread {:?}, {} read locking at {}, line {}", thread::current().id(), stringify!($x), file!(), line!());
            let v = $x.read();
//            trace!("Thread {:?}, {} read lock completed", thread::current().id(), stringify!($x));
            v
        }
    }
}

/// Tracing macro for obtaining a write lock on a `RwLock`.
#[macro_export]
macro_rules! trace_write_lock {
    ( $x:expr ) => {
        {
//            use std::thread;
//            trace!("Thread {:?}, {} write locking at {}, line {}", thread::current().id(), stringify!($x), file!(), line!());
            let v = $x.write();
//            trace!("Thread {:?}, {} write lock completed", thread::current().id(), stringify!($x));
            v
        }
    }
}

pub mod core;
pub mod server;
pub mod sync;
pub mod types;

pub mod prelude {
    pub use crate::core::handle::{AtomicHandle, Handle};
    pub use crate::server::prelude::*;
    pub use crate::types::*;
}
