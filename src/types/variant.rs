// OPCUA for Rust
// SPDX-License-Identifier: MPL-2.0
// Copyright (C) 2017-2024 Adam Lock

//! Contains the `Variant` carried by data values and event fields.

use std::fmt;

use crate::types::{date_time::DateTime, node_id::NodeId, status_code::StatusCode};

/// A `Variant` holds the built-in types a monitored item can report. The engine never
/// inspects the contents, it only moves them from node managers to notification messages.
#[derive(PartialEq, Debug, Clone, Serialize, Deserialize)]
pub enum Variant {
    Empty,
    Boolean(bool),
    Int32(i32),
    UInt32(u32),
    Int64(i64),
    Double(f64),
    String(String),
    DateTime(Box<DateTime>),
    NodeId(Box<NodeId>),
    StatusCode(StatusCode),
}

impl Default for Variant {
    fn default() -> Self {
        Variant::Empty
    }
}

impl fmt::Display for Variant {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Variant::Empty => write!(f, "empty"),
            Variant::Boolean(v) => write!(f, "{}", v),
            Variant::Int32(v) => write!(f, "{}", v),
            Variant::UInt32(v) => write!(f, "{}", v),
            Variant::Int64(v) => write!(f, "{}", v),
            Variant::Double(v) => write!(f, "{}", v),
            Variant::String(v) => write!(f, "{}", v),
            Variant::DateTime(v) => write!(f, "{}", v),
            Variant::NodeId(v) => write!(f, "{}", v),
            Variant::StatusCode(v) => write!(f, "{}", v),
        }
    }
}

impl Variant {
    pub fn is_empty(&self) -> bool {
        matches!(self, Variant::Empty)
    }
}

macro_rules! from_variant_impl {
    ( $t:ty, $v:ident ) => {
        impl From<$t> for Variant {
            fn from(v: $t) -> Self {
                Variant::$v(v)
            }
        }
    };
}

from_variant_impl!(bool, Boolean);
from_variant_impl!(i32, Int32);
from_variant_impl!(u32, UInt32);
from_variant_impl!(i64, Int64);
from_variant_impl!(f64, Double);
from_variant_impl!(String, String);
from_variant_impl!(StatusCode, StatusCode);

impl<'a> From<&'a str> for Variant {
    fn from(v: &'a str) -> Self {
        Variant::String(v.to_string())
    }
}

impl From<DateTime> for Variant {
    fn from(v: DateTime) -> Self {
        Variant::DateTime(Box::new(v))
    }
}

impl From<NodeId> for Variant {
    fn from(v: NodeId) -> Self {
        Variant::NodeId(Box::new(v))
    }
}
