//! Pure connection configuration and state for MQTT sessions
//!
//! This module contains the pure half of session management: translating a
//! broker URI into client options, the connection state model, and the
//! reconnect backoff configuration. No I/O happens here.

use crate::error::RegistryError;
use chrono::Utc;
use rumqttc::v5::mqttbytes::QoS;
use rumqttc::v5::MqttOptions;
use rumqttc::Transport as RumqttcTransport;
use std::time::Duration;
use tracing::debug;
use url::Url;

/// Connection state for a registry session
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionState {
    /// Initial state - attempting to connect
    Connecting,
    /// Successfully connected and ready for operations
    Connected,
    /// Disconnected with reason
    Disconnected(String),
    /// Attempting to reconnect (attempt count)
    Reconnecting(u32),
    /// Permanently disconnected - max reconnection attempts exceeded
    PermanentlyDisconnected(String),
}

/// Reconnection backoff configuration
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Maximum number of reconnection attempts (None = unlimited)
    pub max_attempts: Option<u32>,
    /// Backoff pattern in milliseconds, walked once per attempt
    pub backoff_pattern: Vec<u64>,
    /// Delay used after the pattern is exhausted
    pub sustained_delay: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: None,
            backoff_pattern: vec![25, 50, 100, 250],
            sustained_delay: 250,
        }
    }
}

impl ReconnectConfig {
    /// Backoff delay in milliseconds for the given 1-based attempt
    pub fn backoff_delay(&self, attempt: u32) -> u64 {
        if self.backoff_pattern.is_empty() {
            return self.sustained_delay;
        }
        let index = attempt.saturating_sub(1) as usize;
        if index < self.backoff_pattern.len() {
            self.backoff_pattern[index]
        } else {
            self.sustained_delay
        }
    }
}

/// Everything a session needs to open and supervise one connection
pub struct BrokerOptions {
    pub(crate) mqtt_options: MqttOptions,
    /// Whether the supervisor keeps the connection alive and replays
    /// subscriptions after a loss
    pub auto_reconnect: bool,
    /// Backoff applied between reconnection attempts
    pub reconnect: ReconnectConfig,
}

/// Default keep-alive when the URI does not override it
const DEFAULT_KEEP_ALIVE: Duration = Duration::from_secs(60);

/// Build [`BrokerOptions`] from a broker URI
///
/// URI shape: `scheme://[user[:pass]@]host[:port][?autoreconnect=true|false][&keepalive=<secs>]`.
/// The port defaults to 8883 for `mqtts` (which also enables TLS) and 1883
/// otherwise. An absent password is treated as empty. A missing or empty
/// client id is replaced with a timestamp-derived unique id.
pub fn broker_options(uri: &str, client_id: Option<&str>) -> Result<BrokerOptions, RegistryError> {
    let url = Url::parse(uri).map_err(|_| RegistryError::InvalidBrokerUrl(uri.to_string()))?;

    let host = match url.host_str() {
        Some(host) if !host.is_empty() => host,
        _ => return Err(RegistryError::InvalidBrokerUrl(uri.to_string())),
    };
    let port = url
        .port()
        .unwrap_or(if url.scheme() == "mqtts" { 8883 } else { 1883 });

    let client_id = match client_id {
        Some(id) if !id.is_empty() => id.to_string(),
        _ => generated_client_id(),
    };
    debug!(client_id = %client_id, host, port, "building mqtt client options");

    let mut mqtt_options = MqttOptions::new(client_id, host, port);

    if url.scheme() == "mqtts" {
        mqtt_options.set_transport(RumqttcTransport::tls_with_default_config());
    }

    if !url.username().is_empty() {
        mqtt_options.set_credentials(url.username(), url.password().unwrap_or_default());
    }

    let query: Vec<(String, String)> = url
        .query_pairs()
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();

    let keep_alive = parse_keepalive(query_value(&query, "keepalive")).unwrap_or(DEFAULT_KEEP_ALIVE);
    mqtt_options.set_keep_alive(keep_alive);

    let auto_reconnect = parse_autoreconnect(query_value(&query, "autoreconnect"));
    if auto_reconnect {
        debug!("auto reconnect enabled");
    }

    Ok(BrokerOptions {
        mqtt_options,
        auto_reconnect,
        reconnect: ReconnectConfig::default(),
    })
}

fn query_value<'a>(query: &'a [(String, String)], name: &str) -> Option<&'a str> {
    query
        .iter()
        .find(|(k, _)| k == name)
        .map(|(_, v)| v.as_str())
}

/// Parse the `autoreconnect` query value; anything but an explicit
/// `"false"`/`"true"` leaves the default (enabled) in place
pub(crate) fn parse_autoreconnect(value: Option<&str>) -> bool {
    match value {
        Some("true") => true,
        Some("false") => false,
        _ => true,
    }
}

/// Parse the `keepalive` query value as whole seconds
///
/// Non-positive values disable keep-alive (a zero duration); unparsable
/// values are ignored and yield `None` so the default applies.
pub(crate) fn parse_keepalive(value: Option<&str>) -> Option<Duration> {
    let seconds: i64 = value?.parse().ok()?;
    if seconds < 1 {
        debug!("keep alive disabled");
        Some(Duration::ZERO)
    } else {
        Some(Duration::from_secs(seconds as u64))
    }
}

/// Timestamp-derived client id for connections that did not name one
fn generated_client_id() -> String {
    format!("mqtt-registry-{}", Utc::now().timestamp_millis())
}

/// Map an integer QoS level to the transport's QoS type
pub fn qos_from_level(level: u8) -> Result<QoS, RegistryError> {
    match level {
        0 => Ok(QoS::AtMostOnce),
        1 => Ok(QoS::AtLeastOnce),
        2 => Ok(QoS::ExactlyOnce),
        other => Err(RegistryError::InvalidQos(other)),
    }
}
