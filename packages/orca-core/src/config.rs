//! # Broker Configuration
//!
//! Connection settings for the MQTT broker, read from the process
//! environment. Every field has a working local default so a bare
//! `BusConfig::from_env()` talks to a broker on `localhost:1883`.

use std::env;

/// Default QoS when neither `MQTT_QOS` nor `QOS` is set.
pub const DEFAULT_QOS: u8 = 1;

/// Topic root under which all transfer topics live.
pub const DEFAULT_TOPIC_PREFIX: &str = "orca/iot";

/// MQTT broker connection settings.
#[derive(Debug, Clone)]
pub struct BusConfig {
    /// Broker hostname (`MQTT_BROKER_HOST`, default `localhost`).
    pub broker_host: String,
    /// Broker port (`MQTT_BROKER_PORT`, default `1883`).
    pub broker_port: u16,
    /// Base client identifier (`MQTT_CLIENT_ID`). Subscriber connections
    /// append `_sub` to avoid colliding with a publisher using the same id.
    pub client_id: String,
    /// Optional username (`MQTT_USERNAME`).
    pub username: Option<String>,
    /// Optional password (`MQTT_PASSWORD`).
    pub password: Option<String>,
    /// Seconds between keepalive pings (`MQTT_KEEPALIVE`, default `60`).
    pub keepalive_secs: u64,
    /// Topic root (`TOPIC_PREFIX`, default `orca/iot`).
    pub topic_prefix: String,
    /// Default QoS 0/1/2 (`MQTT_QOS`, falling back to `QOS`, default `1`).
    pub qos: u8,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            broker_host: "localhost".to_string(),
            broker_port: 1883,
            client_id: "orca_iot_publisher".to_string(),
            username: None,
            password: None,
            keepalive_secs: 60,
            topic_prefix: DEFAULT_TOPIC_PREFIX.to_string(),
            qos: DEFAULT_QOS,
        }
    }
}

impl BusConfig {
    /// Build a configuration from the process environment.
    ///
    /// Unset variables use the defaults above; malformed numeric values fall
    /// back to the default rather than aborting.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            broker_host: env::var("MQTT_BROKER_HOST").unwrap_or(defaults.broker_host),
            broker_port: parse_env("MQTT_BROKER_PORT", defaults.broker_port),
            client_id: env::var("MQTT_CLIENT_ID").unwrap_or(defaults.client_id),
            username: env::var("MQTT_USERNAME").ok(),
            password: env::var("MQTT_PASSWORD").ok(),
            keepalive_secs: parse_env("MQTT_KEEPALIVE", defaults.keepalive_secs),
            topic_prefix: env::var("TOPIC_PREFIX").unwrap_or(defaults.topic_prefix),
            qos: env::var("MQTT_QOS")
                .or_else(|_| env::var("QOS"))
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(DEFAULT_QOS),
        }
    }

    /// Client id for subscriber connections (`<client_id>_sub`).
    pub fn subscriber_client_id(&self) -> String {
        format!("{}_sub", self.client_id)
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = BusConfig::default();
        assert_eq!(config.broker_host, "localhost");
        assert_eq!(config.broker_port, 1883);
        assert_eq!(config.client_id, "orca_iot_publisher");
        assert_eq!(config.keepalive_secs, 60);
        assert_eq!(config.topic_prefix, "orca/iot");
        assert_eq!(config.qos, 1);
        assert!(config.username.is_none());
        assert!(config.password.is_none());
    }

    #[test]
    fn test_subscriber_client_id_suffix() {
        let config = BusConfig::default();
        assert_eq!(config.subscriber_client_id(), "orca_iot_publisher_sub");
    }
}
