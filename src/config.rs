// Copyright (c) 2026 IoT Runtime Team. All rights reserved.
// Use of this source is governed by the Apache License, Version 2.0 that can
// be found in the LICENSE file.

//! Typed configuration surface (§4.I, §6 "Configuration keys recognized").
//!
//! Loading these values from a file or watching them for changes is an
//! external collaborator's job (§1); this crate only ever consumes an
//! already-parsed [`Config`] and the [`ConfigChange`] notifications the
//! embedder forwards to [`crate::connection_manager::ConnectionManager::configuration_changed`].

use serde::Deserialize;

use crate::spooler::StorageType;

/// Which MQTT protocol version the logical session speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MqttVersion {
    Mqtt3,
    Mqtt5,
}

impl Default for MqttVersion {
    fn default() -> Self {
        MqttVersion::Mqtt5
    }
}

/// `mqtt.*` recognized keys.
#[derive(Debug, Clone, Deserialize)]
pub struct MqttConfig {
    #[serde(default = "MqttConfig::default_keep_alive_timeout_ms")]
    pub keep_alive_timeout_ms: u64,

    #[serde(default = "MqttConfig::default_ping_timeout_ms")]
    pub ping_timeout_ms: u64,

    #[serde(default = "MqttConfig::default_operation_timeout_ms")]
    pub operation_timeout_ms: u64,

    #[serde(default = "MqttConfig::default_max_in_flight_publishes")]
    pub max_in_flight_publishes: u32,

    #[serde(default = "MqttConfig::default_max_message_size_bytes")]
    pub max_message_size_bytes: u64,

    #[serde(default)]
    pub version: MqttVersion,
}

impl MqttConfig {
    const fn default_keep_alive_timeout_ms() -> u64 {
        30_000
    }

    const fn default_ping_timeout_ms() -> u64 {
        10_000
    }

    const fn default_operation_timeout_ms() -> u64 {
        10_000
    }

    const fn default_max_in_flight_publishes() -> u32 {
        20
    }

    const fn default_max_message_size_bytes() -> u64 {
        128 * 1024
    }

    /// Validates the keepalive/ping-timeout relationship (§6 "ping-timeout
    /// must be strictly less than keepalive or the client refuses to
    /// connect").
    ///
    /// # Errors
    /// `InvalidArguments` if `ping_timeout_ms >= keep_alive_timeout_ms`.
    pub fn validate(&self) -> Result<(), crate::Error> {
        if self.ping_timeout_ms >= self.keep_alive_timeout_ms {
            return Err(crate::Error::new(
                crate::ErrorKind::InvalidArguments,
                "mqtt.pingTimeoutMs must be strictly less than mqtt.keepAliveTimeoutMs",
            ));
        }
        Ok(())
    }
}

impl Default for MqttConfig {
    fn default() -> Self {
        MqttConfig {
            keep_alive_timeout_ms: Self::default_keep_alive_timeout_ms(),
            ping_timeout_ms: Self::default_ping_timeout_ms(),
            operation_timeout_ms: Self::default_operation_timeout_ms(),
            max_in_flight_publishes: Self::default_max_in_flight_publishes(),
            max_message_size_bytes: Self::default_max_message_size_bytes(),
            version: MqttVersion::default(),
        }
    }
}

/// `spooler.*` recognized keys, mirroring [`crate::spooler::SpoolerConfig`]
/// but in the wire/serde vocabulary of §6.
#[derive(Debug, Clone, Deserialize)]
pub struct SpoolerSection {
    #[serde(default = "SpoolerSection::default_max_size_bytes")]
    pub max_size_bytes: u64,

    #[serde(default = "SpoolerSection::default_keep_qos0_when_offline")]
    pub keep_qos0_when_offline: bool,

    #[serde(default = "SpoolerSection::default_max_retries")]
    pub max_retries: u32,

    #[serde(default)]
    pub storage_type: StorageType,
}

impl SpoolerSection {
    const fn default_max_size_bytes() -> u64 {
        10 * 1024 * 1024
    }

    const fn default_keep_qos0_when_offline() -> bool {
        true
    }

    const fn default_max_retries() -> u32 {
        3
    }
}

impl Default for SpoolerSection {
    fn default() -> Self {
        SpoolerSection {
            max_size_bytes: Self::default_max_size_bytes(),
            keep_qos0_when_offline: Self::default_keep_qos0_when_offline(),
            max_retries: Self::default_max_retries(),
            storage_type: StorageType::Memory,
        }
    }
}

impl From<&SpoolerSection> for crate::spooler::SpoolerConfig {
    fn from(section: &SpoolerSection) -> Self {
        crate::spooler::SpoolerConfig {
            keep_qos0_when_offline: section.keep_qos0_when_offline,
            max_retries: section.max_retries,
            max_bytes: section.max_size_bytes,
            storage: section.storage_type,
        }
    }
}

/// The full recognized configuration surface (§6).
#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub mqtt: MqttConfig,

    #[serde(default)]
    pub spooler: SpoolerSection,
}

/// Keys that, when changed, force every link to reconnect (§4.D
/// "Configuration-driven reconnects"). Listed exactly as the manager
/// compares them: dotted paths into the session identity/TLS material.
pub const RECONNECT_TRIGGER_KEYS: &[&str] = &[
    "mqtt.namespaceRoot",
    "mqtt.endpoint",
    "mqtt.thingName",
    "mqtt.privateKeyPath",
    "mqtt.certificatePath",
    "mqtt.rootCaPath",
    "mqtt.proxy.awsRegion",
];

/// A notification that one or more configuration keys changed, forwarded by
/// the embedder's configuration-loading collaborator (§1, §4.I).
#[derive(Debug, Clone)]
pub struct ConfigChange {
    pub keys: Vec<String>,
}

impl ConfigChange {
    #[must_use]
    pub fn new(keys: Vec<String>) -> Self {
        ConfigChange { keys }
    }

    /// True iff any changed key is one of [`RECONNECT_TRIGGER_KEYS`]
    /// (§4.D).
    #[must_use]
    pub fn triggers_reconnect(&self) -> bool {
        self.keys
            .iter()
            .any(|k| RECONNECT_TRIGGER_KEYS.contains(&k.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_self_consistent() {
        let config = Config::default();
        assert!(config.mqtt.validate().is_ok());
    }

    #[test]
    fn ping_timeout_must_be_strictly_less_than_keepalive() {
        let mut mqtt = MqttConfig::default();
        mqtt.ping_timeout_ms = mqtt.keep_alive_timeout_ms;
        assert!(mqtt.validate().is_err());
    }

    #[test]
    fn unrelated_key_does_not_trigger_reconnect() {
        let change = ConfigChange::new(vec!["spooler.maxRetries".to_owned()]);
        assert!(!change.triggers_reconnect());
    }

    #[test]
    fn endpoint_change_triggers_reconnect() {
        let change = ConfigChange::new(vec!["mqtt.endpoint".to_owned()]);
        assert!(change.triggers_reconnect());
    }

    #[test]
    fn deserializes_partial_overrides_leaving_the_rest_at_defaults() {
        let json = r#"{"mqtt": {"keep_alive_timeout_ms": 60000}}"#;
        let config: Config = serde_json::from_str(json).unwrap();
        assert_eq!(config.mqtt.keep_alive_timeout_ms, 60_000);
        assert_eq!(
            config.mqtt.ping_timeout_ms,
            MqttConfig::default_ping_timeout_ms()
        );
        assert_eq!(config.spooler.max_retries, SpoolerSection::default_max_retries());
    }
}
