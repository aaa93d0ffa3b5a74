//! Keyed connection registry
//!
//! A [`Registry`] maps string keys to live [`MqttSession`]s. Applications
//! that want process-wide connections use the free functions at the bottom
//! of this module, which operate on a lazily-created default registry; code
//! that needs isolated instances (tests, multi-tenant services) owns its
//! `Registry` directly.

use crate::config::RegistryConfig;
use crate::error::RegistryError;
use crate::session::{broker_options, BrokerOptions, MqttSession};
use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Key used when a caller does not name a connection
pub const DEFAULT_KEY: &str = "default";

/// Connect timeout used when a caller does not supply one
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(3);

/// Keyed map of live MQTT sessions
#[derive(Default)]
pub struct Registry {
    connections: RwLock<HashMap<String, Arc<MqttSession>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Connect to a broker and store the session under `key`
    ///
    /// The key defaults to [`DEFAULT_KEY`] and, when given, doubles as the
    /// client id. Replacing an existing key disconnects the session it
    /// displaces.
    pub async fn connect(
        &self,
        uri: &str,
        timeout: Option<Duration>,
        key: Option<&str>,
    ) -> Result<Arc<MqttSession>, RegistryError> {
        let options = broker_options(uri, key)?;
        self.connect_with_options(options, timeout, key).await
    }

    /// Connect with pre-built options, for callers that tune settings the
    /// URI cannot carry (reconnect backoff, attempt limits)
    pub async fn connect_with_options(
        &self,
        options: BrokerOptions,
        timeout: Option<Duration>,
        key: Option<&str>,
    ) -> Result<Arc<MqttSession>, RegistryError> {
        let timeout = timeout.unwrap_or(DEFAULT_CONNECT_TIMEOUT);
        let session = MqttSession::establish(options, timeout).await?;

        self.install(key.unwrap_or(DEFAULT_KEY), session.clone())
            .await;
        Ok(session)
    }

    /// Connect every broker named in a configuration, keyed by its table key
    pub async fn connect_from_config(&self, config: &RegistryConfig) -> Result<(), RegistryError> {
        config.validate()?;
        for (key, broker) in &config.brokers {
            let timeout = Duration::from_secs(broker.connect_timeout_secs);
            let options = broker_options(&broker.url, broker.client_id.as_deref())?;
            let session = MqttSession::establish(options, timeout).await?;
            self.install(key, session).await;
        }
        Ok(())
    }

    async fn install(&self, key: &str, session: Arc<MqttSession>) {
        let replaced = self
            .connections
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_string(), session);

        if let Some(old) = replaced {
            info!(key, "replacing existing connection");
            if let Err(e) = old.disconnect(DEFAULT_CONNECT_TIMEOUT).await {
                debug!(key, error = %e, "failed to close replaced connection");
            }
        }
        info!(key, "mqtt connection registered");
    }

    /// Look up the session stored under `key`
    ///
    /// An unknown key is a normal outcome, not an error; callers must handle
    /// `None` before using a session.
    pub fn client(&self, key: Option<&str>) -> Option<Arc<MqttSession>> {
        self.connections
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key.unwrap_or(DEFAULT_KEY))
            .cloned()
    }

    /// Keys of every registered connection
    pub fn keys(&self) -> Vec<String> {
        self.connections
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }

    /// Subscribe a topic on the named connection
    ///
    /// Fails with [`RegistryError::UnknownClient`] when no session exists
    /// under `key`, without touching any subscription state.
    pub async fn subscribe<F>(
        &self,
        topic: &str,
        qos: u8,
        handler: F,
        key: Option<&str>,
    ) -> Result<(), RegistryError>
    where
        F: Fn(&[u8]) + Send + Sync + 'static,
    {
        let session = self
            .client(key)
            .ok_or_else(|| RegistryError::UnknownClient(key.unwrap_or(DEFAULT_KEY).to_string()))?;
        session.subscribe(topic, qos, handler).await
    }

    /// Close one connection, or every connection when `key` is `None`
    ///
    /// Closed entries are removed from the registry. Keyed close of an
    /// unknown key is an error; close-all logs individual failures and
    /// keeps going.
    pub async fn close(&self, timeout: Duration, key: Option<&str>) -> Result<(), RegistryError> {
        match key {
            Some(key) => {
                let session = {
                    self.connections
                        .write()
                        .unwrap_or_else(PoisonError::into_inner)
                        .remove(key)
                }
                .ok_or_else(|| RegistryError::UnknownClient(key.to_string()))?;
                info!(key, "closing mqtt connection");
                session.disconnect(timeout).await
            }
            None => {
                let drained: Vec<(String, Arc<MqttSession>)> = {
                    self.connections
                        .write()
                        .unwrap_or_else(PoisonError::into_inner)
                        .drain()
                        .collect()
                };
                for (key, session) in drained {
                    info!(key = %key, "closing mqtt connection");
                    if let Err(e) = session.disconnect(timeout).await {
                        warn!(key = %key, error = %e, "close failed");
                    }
                }
                Ok(())
            }
        }
    }
}

static DEFAULT_REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

/// The process-wide registry backing the free functions
pub fn default_registry() -> &'static Registry {
    &DEFAULT_REGISTRY
}

/// Connect on the process-wide registry; see [`Registry::connect`]
pub async fn connect(
    uri: &str,
    timeout: Option<Duration>,
    key: Option<&str>,
) -> Result<Arc<MqttSession>, RegistryError> {
    DEFAULT_REGISTRY.connect(uri, timeout, key).await
}

/// Look up on the process-wide registry; see [`Registry::client`]
pub fn client(key: Option<&str>) -> Option<Arc<MqttSession>> {
    DEFAULT_REGISTRY.client(key)
}

/// Subscribe on the process-wide registry; see [`Registry::subscribe`]
pub async fn subscribe<F>(
    topic: &str,
    qos: u8,
    handler: F,
    key: Option<&str>,
) -> Result<(), RegistryError>
where
    F: Fn(&[u8]) + Send + Sync + 'static,
{
    DEFAULT_REGISTRY.subscribe(topic, qos, handler, key).await
}

/// Close on the process-wide registry; see [`Registry::close`]
pub async fn close(timeout: Duration, key: Option<&str>) -> Result<(), RegistryError> {
    DEFAULT_REGISTRY.close(timeout, key).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_of_unknown_key_is_none() {
        let registry = Registry::new();

        assert!(registry.client(None).is_none());
        assert!(registry.client(Some("never-connected")).is_none());
    }

    #[tokio::test]
    async fn test_connect_rejects_malformed_uri() {
        let registry = Registry::new();

        let result = registry.connect(":::malformed", None, None).await;

        assert!(matches!(result, Err(RegistryError::InvalidBrokerUrl(_))));
        // Nothing was stored under the default key
        assert!(registry.client(None).is_none());
    }

    #[tokio::test]
    async fn test_subscribe_on_unknown_key_is_an_error() {
        let registry = Registry::new();

        let result = registry
            .subscribe("sensors/temp", 1, |_payload| {}, Some("primary"))
            .await;

        match result {
            Err(RegistryError::UnknownClient(key)) => assert_eq!(key, "primary"),
            other => panic!("expected UnknownClient, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_subscribe_without_key_names_the_default() {
        let registry = Registry::new();

        let result = registry.subscribe("sensors/temp", 0, |_| {}, None).await;

        assert!(
            matches!(result, Err(RegistryError::UnknownClient(key)) if key == DEFAULT_KEY)
        );
    }

    #[tokio::test]
    async fn test_keyed_close_of_unknown_key_is_an_error() {
        let registry = Registry::new();

        let result = registry
            .close(Duration::from_millis(100), Some("missing"))
            .await;

        assert!(matches!(result, Err(RegistryError::UnknownClient(_))));
    }

    #[tokio::test]
    async fn test_close_all_on_empty_registry_is_ok() {
        let registry = Registry::new();
        assert!(registry.close(Duration::from_millis(100), None).await.is_ok());
    }

    #[tokio::test]
    async fn test_connect_from_config_rejects_bad_url() {
        let registry = Registry::new();
        let config = crate::config::RegistryConfig::from_toml_str(
            "[brokers.default]\nurl = \":::malformed\"",
        )
        .unwrap();

        let result = registry.connect_from_config(&config).await;

        assert!(matches!(result, Err(RegistryError::InvalidBrokerUrl(_))));
        assert!(registry.keys().is_empty());
    }

    #[test]
    fn test_default_registry_is_shared() {
        let a = default_registry() as *const Registry;
        let b = default_registry() as *const Registry;
        assert_eq!(a, b);
    }
}
