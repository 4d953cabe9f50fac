// OPCUA for Rust
// SPDX-License-Identifier: MPL-2.0
// Copyright (C) 2017-2024 Adam Lock

//! The OPC UA value and service types that flow through the publish / subscribe engine.

pub mod data_value;
pub mod date_time;
pub mod node_id;
pub mod notification_message;
pub mod service_types;
pub mod status_code;
pub mod variant;

pub use crate::types::{
    data_value::*, date_time::*, node_id::*, notification_message::*, service_types::*,
    status_code::StatusCode, variant::*,
};
