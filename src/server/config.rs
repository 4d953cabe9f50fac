// OPCUA for Rust
// SPDX-License-Identifier: MPL-2.0
// Copyright (C) 2017-2024 Adam Lock

//! Configuration of the publish / subscribe engine. The configuration can be built in code,
//! or loaded from / saved to a YAML file.

use std::{
    fs::File,
    io::{Read, Write},
    path::Path,
};

/// A configuration that can be serialized to and from YAML.
pub trait Config: serde::Serialize {
    fn save(&self, path: &Path) -> Result<(), String> {
        if !self.is_valid() {
            error!("Config isn't valid and won't be saved");
            return Err("Config isn't valid".to_string());
        }
        let s = serde_yaml::to_string(&self)
            .map_err(|err| format!("Cannot serialize configuration, reason: {}", err))?;
        let mut f = File::create(path).map_err(|err| {
            format!(
                "Cannot create the path {} to save the config, reason: {}",
                path.to_string_lossy(),
                err
            )
        })?;
        f.write_all(s.as_bytes()).map_err(|err| {
            error!("Could not save config - error = {:?}", err);
            format!("Could not save config, reason: {}", err)
        })
    }

    fn load<A>(path: &Path) -> Result<A, String>
    where
        for<'de> A: Config + serde::Deserialize<'de>,
    {
        let mut f = File::open(path).map_err(|err| {
            format!(
                "Cannot open configuration file {}, reason: {}",
                path.to_string_lossy(),
                err
            )
        })?;
        let mut s = String::new();
        f.read_to_string(&mut s).map_err(|err| {
            format!(
                "Cannot read configuration file {} to string, reason: {}",
                path.to_string_lossy(),
                err
            )
        })?;
        serde_yaml::from_str(&s).map_err(|err| {
            error!(
                "Cannot deserialize configuration from {}, error reason: {}",
                path.to_string_lossy(),
                err
            );
            format!(
                "Cannot deserialize configuration from {}, reason: {}",
                path.to_string_lossy(),
                err
            )
        })
    }

    fn is_valid(&self) -> bool;
}

/// Server-wide limits and timing of subscriptions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionConfig {
    /// Smallest publishing interval a client can negotiate, in milliseconds.
    #[serde(default = "defaults::min_publishing_interval_ms")]
    pub min_publishing_interval_ms: f64,
    /// Largest publishing interval a client can negotiate, in milliseconds.
    #[serde(default = "defaults::max_publishing_interval_ms")]
    pub max_publishing_interval_ms: f64,
    /// Negotiated publishing intervals are multiples of this value. It is also the cadence of
    /// the publish timer.
    #[serde(default = "defaults::publishing_resolution_ms")]
    pub publishing_resolution_ms: f64,
    #[serde(default = "defaults::min_subscription_lifetime_ms")]
    pub min_subscription_lifetime_ms: f64,
    #[serde(default = "defaults::max_subscription_lifetime_ms")]
    pub max_subscription_lifetime_ms: f64,
    /// Keep alive count used when a client asks for 0.
    #[serde(default = "defaults::default_keep_alive_count")]
    pub default_keep_alive_count: u32,
    /// Number of sent messages each subscription retains for republishing.
    #[serde(default = "defaults::max_message_count")]
    pub max_message_count: usize,
    /// Maximum number of notifications per publish message, 0 for unlimited.
    #[serde(default = "defaults::max_notifications_per_publish")]
    pub max_notifications_per_publish: u32,
    /// Maximum number of subscriptions in the server.
    #[serde(default = "defaults::max_subscription_count")]
    pub max_subscription_count: usize,
    /// Maximum number of publish requests queued per session.
    #[serde(default = "defaults::max_publish_request_count")]
    pub max_publish_request_count: usize,
    /// Maximum number of monitored items per subscription, 0 for no limit
    #[serde(default = "defaults::max_monitored_items_per_subscription")]
    pub max_monitored_items_per_subscription: usize,
    /// Maximum number of monitored items in one create / modify / delete call, 0 for no limit
    #[serde(default = "defaults::max_monitored_items_per_call")]
    pub max_monitored_items_per_call: usize,
}

impl Default for SubscriptionConfig {
    fn default() -> Self {
        Self {
            min_publishing_interval_ms: defaults::min_publishing_interval_ms(),
            max_publishing_interval_ms: defaults::max_publishing_interval_ms(),
            publishing_resolution_ms: defaults::publishing_resolution_ms(),
            min_subscription_lifetime_ms: defaults::min_subscription_lifetime_ms(),
            max_subscription_lifetime_ms: defaults::max_subscription_lifetime_ms(),
            default_keep_alive_count: defaults::default_keep_alive_count(),
            max_message_count: defaults::max_message_count(),
            max_notifications_per_publish: defaults::max_notifications_per_publish(),
            max_subscription_count: defaults::max_subscription_count(),
            max_publish_request_count: defaults::max_publish_request_count(),
            max_monitored_items_per_subscription: defaults::max_monitored_items_per_subscription(
            ),
            max_monitored_items_per_call: defaults::max_monitored_items_per_call(),
        }
    }
}

impl Config for SubscriptionConfig {
    fn is_valid(&self) -> bool {
        let mut valid = true;
        if self.publishing_resolution_ms <= 0.0 {
            error!("Publishing resolution must be greater than zero");
            valid = false;
        }
        if self.min_publishing_interval_ms <= 0.0
            || self.min_publishing_interval_ms > self.max_publishing_interval_ms
        {
            error!(
                "Publishing interval range {} - {} is invalid",
                self.min_publishing_interval_ms, self.max_publishing_interval_ms
            );
            valid = false;
        }
        if self.min_subscription_lifetime_ms > self.max_subscription_lifetime_ms {
            error!(
                "Subscription lifetime range {} - {} is invalid",
                self.min_subscription_lifetime_ms, self.max_subscription_lifetime_ms
            );
            valid = false;
        }
        if self.default_keep_alive_count == 0 {
            error!("Default keep alive count must be greater than zero");
            valid = false;
        }
        if self.max_message_count == 0 {
            error!("Max message count must be greater than zero");
            valid = false;
        }
        if self.max_publish_request_count == 0 {
            error!("Max publish request count must be greater than zero");
            valid = false;
        }
        valid
    }
}

mod defaults {
    use crate::server::constants;

    pub fn min_publishing_interval_ms() -> f64 {
        constants::MIN_PUBLISHING_INTERVAL_MS
    }
    pub fn max_publishing_interval_ms() -> f64 {
        constants::MAX_PUBLISHING_INTERVAL_MS
    }
    pub fn publishing_resolution_ms() -> f64 {
        constants::PUBLISHING_RESOLUTION_MS
    }
    pub fn min_subscription_lifetime_ms() -> f64 {
        constants::MIN_SUBSCRIPTION_LIFETIME_MS
    }
    pub fn max_subscription_lifetime_ms() -> f64 {
        constants::MAX_SUBSCRIPTION_LIFETIME_MS
    }
    pub fn default_keep_alive_count() -> u32 {
        constants::DEFAULT_KEEP_ALIVE_COUNT
    }
    pub fn max_message_count() -> usize {
        constants::MAX_MESSAGE_COUNT
    }
    pub fn max_notifications_per_publish() -> u32 {
        constants::MAX_NOTIFICATIONS_PER_PUBLISH
    }
    pub fn max_subscription_count() -> usize {
        constants::MAX_SUBSCRIPTION_COUNT
    }
    pub fn max_publish_request_count() -> usize {
        constants::MAX_PUBLISH_REQUEST_COUNT
    }
    pub fn max_monitored_items_per_subscription() -> usize {
        constants::DEFAULT_MAX_MONITORED_ITEMS_PER_SUB
    }
    pub fn max_monitored_items_per_call() -> usize {
        constants::MAX_MONITORED_ITEMS_PER_CALL
    }
}
