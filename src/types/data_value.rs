// OPCUA for Rust
// SPDX-License-Identifier: MPL-2.0
// Copyright (C) 2017-2024 Adam Lock

//! Contains the implementation of `DataValue`.

use crate::types::{date_time::DateTime, status_code::StatusCode, variant::Variant};

/// A data value is a value of a variable in the OPC UA server and contains information about its
/// value, status and change timestamps.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DataValue {
    /// The value. BaseDataType
    pub value: Option<Variant>,
    /// The status associated with the value.
    pub status: Option<StatusCode>,
    /// The source timestamp associated with the value.
    pub source_timestamp: Option<DateTime>,
    /// The Server timestamp associated with the value.
    pub server_timestamp: Option<DateTime>,
}

macro_rules! from_data_value_impl {
    ( $( $t:ty ),* ) => {
        $(
            impl From<$t> for DataValue {
                fn from(v: $t) -> Self {
                    Self::from(Variant::from(v))
                }
            }
        )*
    };
}

from_data_value_impl!(bool, i32, u32, i64, f64, String, DateTime, StatusCode);

impl<'a> From<&'a str> for DataValue {
    fn from(v: &'a str) -> Self {
        Self::from(Variant::from(v))
    }
}

impl From<Variant> for DataValue {
    fn from(v: Variant) -> Self {
        DataValue::value_only(v)
    }
}

impl From<(Variant, StatusCode)> for DataValue {
    fn from(v: (Variant, StatusCode)) -> Self {
        DataValue {
            value: Some(v.0),
            status: Some(v.1),
            ..Default::default()
        }
    }
}

impl DataValue {
    /// Creates a `DataValue` from the supplied value with nothing else.
    pub fn value_only<V>(value: V) -> DataValue
    where
        V: Into<Variant>,
    {
        DataValue {
            value: Some(value.into()),
            ..Default::default()
        }
    }

    /// Creates a `DataValue` from the supplied value AND a timestamp for now.
    pub fn new_now<V>(value: V) -> DataValue
    where
        V: Into<Variant>,
    {
        let now = DateTime::now();
        DataValue {
            value: Some(value.into()),
            status: Some(StatusCode::Good),
            source_timestamp: Some(now),
            server_timestamp: Some(now),
        }
    }

    /// Returns the status code or Good if there is no code on the value
    pub fn status(&self) -> StatusCode {
        self.status.map_or(StatusCode::Good, |s| s)
    }

    /// Test if the value held by this data value is known to be good
    pub fn is_valid(&self) -> bool {
        self.status().status().is_good()
    }

    /// Compares the value and status of two data values, ignoring timestamps. Used to decide
    /// whether a sample is a change worth reporting.
    pub fn value_or_status_changed(&self, other: &DataValue) -> bool {
        self.value != other.value || self.status() != other.status()
    }
}
