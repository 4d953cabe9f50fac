// OPCUA for Rust
// SPDX-License-Identifier: MPL-2.0
// Copyright (C) 2017-2024 Adam Lock

//! The subset of OPC UA status codes produced and consumed by the publish / subscribe engine.
//! Status codes double as the error type of every fallible engine operation.

#![allow(non_upper_case_globals)]

use std::{error::Error, fmt};

use serde::{Deserialize, Deserializer, Serialize, Serializer};

bitflags! {
    pub struct StatusCode: u32 {
        // Severity bits
        const IS_ERROR                          = 0x8000_0000;
        const IS_UNCERTAIN                      = 0x4000_0000;
        // Mask for the status code section
        const STATUS_MASK                       = 0xffff_0000;
        // Mask for the bits section
        const BIT_MASK                          = 0x0000_ffff;
        // Overflow bit 7, set on a data value when its monitored item queue discarded values
        const OVERFLOW                          = 0x0000_0080;

        const Good                              = 0;
        const GoodSubscriptionTransferred       = 0x002D_0000;
        const BadUnexpectedError                = 0x8001_0000;
        const BadInternalError                  = 0x8002_0000;
        const BadTimeout                        = 0x800A_0000;
        const BadServerHalted                   = 0x800E_0000;
        const BadNothingToDo                    = 0x800F_0000;
        const BadTooManyOperations              = 0x8010_0000;
        const BadUserAccessDenied               = 0x801F_0000;
        const BadSecureChannelIdInvalid         = 0x8022_0000;
        const BadSessionIdInvalid               = 0x8025_0000;
        const BadSessionClosed                  = 0x8026_0000;
        const BadSubscriptionIdInvalid          = 0x8028_0000;
        const BadNodeIdUnknown                  = 0x8034_0000;
        const BadMonitoringModeInvalid          = 0x8041_0000;
        const BadMonitoredItemIdInvalid         = 0x8042_0000;
        const BadMonitoredItemFilterInvalid     = 0x8043_0000;
        const BadFilterNotAllowed               = 0x8045_0000;
        const BadTooManySubscriptions           = 0x8077_0000;
        const BadTooManyPublishRequests         = 0x8078_0000;
        const BadNoSubscription                 = 0x8079_0000;
        const BadSequenceNumberUnknown          = 0x807A_0000;
        const BadMessageNotAvailable            = 0x807B_0000;
        const BadSequenceNumberInvalid          = 0x8088_0000;
        const BadRefreshInProgress              = 0x8097_0000;
        const BadInvalidArgument                = 0x80AB_0000;
        const BadTooManyMonitoredItems          = 0x80DB_0000;
    }
}

impl Default for StatusCode {
    fn default() -> Self {
        StatusCode::Good
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        // Displays the StatusCode as it's name, or its name+bitflags
        let bits = self.bitflags();
        if bits.is_empty() {
            write!(f, "{}", self.name())
        } else {
            write!(f, "{}+{:#06x}", self.name(), bits.bits())
        }
    }
}

impl Error for StatusCode {}

impl StatusCode {
    /// Returns the bit flags of the status code, i.e. it masks out the actual status code value
    pub fn bitflags(&self) -> StatusCode {
        *self & StatusCode::BIT_MASK
    }

    /// Returns the status only, i.e. it masks out any bit flags that come with the status code
    pub fn status(&self) -> StatusCode {
        *self & StatusCode::STATUS_MASK
    }

    /// Tests if the status code is bad
    pub fn is_bad(&self) -> bool {
        self.contains(StatusCode::IS_ERROR)
    }

    /// Tests if the status code is uncertain
    pub fn is_uncertain(&self) -> bool {
        self.contains(StatusCode::IS_UNCERTAIN)
    }

    /// Tests if the status code is good (i.e. not bad or uncertain)
    pub fn is_good(&self) -> bool {
        !self.is_bad() && !self.is_uncertain()
    }

    /// Returns the symbolic name of the status, ignoring any bit flags.
    pub fn name(&self) -> &'static str {
        match self.status().bits() {
            0 => "Good",
            0x002D_0000 => "GoodSubscriptionTransferred",
            0x8001_0000 => "BadUnexpectedError",
            0x8002_0000 => "BadInternalError",
            0x800A_0000 => "BadTimeout",
            0x800E_0000 => "BadServerHalted",
            0x800F_0000 => "BadNothingToDo",
            0x8010_0000 => "BadTooManyOperations",
            0x801F_0000 => "BadUserAccessDenied",
            0x8022_0000 => "BadSecureChannelIdInvalid",
            0x8025_0000 => "BadSessionIdInvalid",
            0x8026_0000 => "BadSessionClosed",
            0x8028_0000 => "BadSubscriptionIdInvalid",
            0x8034_0000 => "BadNodeIdUnknown",
            0x8041_0000 => "BadMonitoringModeInvalid",
            0x8042_0000 => "BadMonitoredItemIdInvalid",
            0x8043_0000 => "BadMonitoredItemFilterInvalid",
            0x8045_0000 => "BadFilterNotAllowed",
            0x8077_0000 => "BadTooManySubscriptions",
            0x8078_0000 => "BadTooManyPublishRequests",
            0x8079_0000 => "BadNoSubscription",
            0x807A_0000 => "BadSequenceNumberUnknown",
            0x807B_0000 => "BadMessageNotAvailable",
            0x8088_0000 => "BadSequenceNumberInvalid",
            0x8097_0000 => "BadRefreshInProgress",
            0x80AB_0000 => "BadInvalidArgument",
            0x80DB_0000 => "BadTooManyMonitoredItems",
            _ => "Unrecognized",
        }
    }
}

// Serialize / Deserialize are manually implemented because bitflags! doesn't do it.

impl Serialize for StatusCode {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u32(self.bits())
    }
}

impl<'de> Deserialize<'de> for StatusCode {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(StatusCode::from_bits_truncate(u32::deserialize(
            deserializer,
        )?))
    }
}

#[test]
fn status_code() {
    assert!(StatusCode::Good.is_good());
    assert!(!StatusCode::Good.is_bad());
    assert!(StatusCode::GoodSubscriptionTransferred.is_good());

    assert!(StatusCode::BadTimeout.is_bad());
    assert!(!StatusCode::BadTimeout.is_uncertain());
    assert!(!StatusCode::BadTimeout.is_good());

    let overflowed = StatusCode::Good | StatusCode::OVERFLOW;
    assert!(overflowed.is_good());
    assert_eq!(overflowed.status(), StatusCode::Good);
    assert_eq!(overflowed.bitflags(), StatusCode::OVERFLOW);
}

#[test]
fn status_code_display() {
    assert_eq!(
        format!("{}", StatusCode::BadSequenceNumberUnknown),
        "BadSequenceNumberUnknown"
    );
    assert_eq!(
        format!("{}", StatusCode::Good | StatusCode::OVERFLOW),
        "Good+0x0080"
    );
}
