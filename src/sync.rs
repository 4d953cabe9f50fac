// OPCUA for Rust
// SPDX-License-Identifier: MPL-2.0
// Copyright (C) 2017-2024 Adam Lock

//! Lock types used throughout the engine. Every component owns its own lock and locks are
//! always taken from the outside in: manager registry, then session queue, then subscription.
//! The manager registry lock is never held while a queue or subscription lock is acquired.

pub type Mutex<T> = parking_lot::Mutex<T>;
pub type RwLock<T> = parking_lot::RwLock<T>;
