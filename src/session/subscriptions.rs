//! Subscription bookkeeping and reconnect replay
//!
//! Each session owns one [`SubscriptionTable`]: topic filter -> recorded
//! subscription. The table is consulted twice: on every delivered message
//! (dispatch to the matching handlers) and after a reconnect (replay every
//! recorded subscription against the restored connection).
//!
//! Replay talks to the broker through the [`TopicControl`] seam so it can be
//! exercised in tests without a live connection.

use crate::error::RegistryError;
use async_trait::async_trait;
use rumqttc::v5::mqttbytes::QoS;
use rumqttc::v5::AsyncClient;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tracing::{debug, warn};

/// Callback invoked with the raw payload bytes of each delivered message
pub type SubscribeHandler = Arc<dyn Fn(&[u8]) + Send + Sync>;

/// One recorded subscription: topic filter, QoS, handler
#[derive(Clone)]
pub struct Subscription {
    pub topic: String,
    pub qos: QoS,
    pub handler: SubscribeHandler,
}

impl Subscription {
    pub fn new(topic: impl Into<String>, qos: QoS, handler: SubscribeHandler) -> Self {
        Self {
            topic: topic.into(),
            qos,
            handler,
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("topic", &self.topic)
            .field("qos", &self.qos)
            .finish_non_exhaustive()
    }
}

/// Topic-keyed subscription records for one session
///
/// Registering a topic that is already present replaces the record, so only
/// the latest handler fires for subsequent messages on that topic.
#[derive(Default)]
pub struct SubscriptionTable {
    entries: RwLock<HashMap<String, Subscription>>,
}

impl SubscriptionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a record, returning the one it replaced (if any)
    pub fn insert(&self, subscription: Subscription) -> Option<Subscription> {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(subscription.topic.clone(), subscription)
    }

    /// Remove the record for a topic, returning it (if present)
    pub fn remove(&self, topic: &str) -> Option<Subscription> {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(topic)
    }

    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Clone out every record; replay works on this snapshot so the lock is
    /// never held across an await point
    pub fn snapshot(&self) -> Vec<Subscription> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    /// Invoke every handler whose filter matches `topic`, passing only the
    /// payload bytes. Returns the number of handlers invoked.
    pub fn dispatch(&self, topic: &str, payload: &[u8]) -> usize {
        let handlers: Vec<SubscribeHandler> = {
            let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
            entries
                .values()
                .filter(|entry| topic_filter_matches(&entry.topic, topic))
                .map(|entry| entry.handler.clone())
                .collect()
        };

        for handler in &handlers {
            handler(payload);
        }
        handlers.len()
    }
}

impl fmt::Debug for SubscriptionTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionTable")
            .field("len", &self.len())
            .finish()
    }
}

/// Match an MQTT topic filter against a concrete topic name
///
/// Standard wildcard semantics: `+` matches exactly one level, `#` matches
/// the remaining levels (including none). Filters starting with a wildcard
/// do not match `$`-prefixed topics.
pub fn topic_filter_matches(filter: &str, topic: &str) -> bool {
    if topic.starts_with('$') && (filter.starts_with('+') || filter.starts_with('#')) {
        return false;
    }

    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');
    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => {}
            (Some(expected), Some(level)) if expected == level => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

/// Subscribe/unsubscribe surface of a live connection
///
/// Replay is written against this trait instead of the concrete client so
/// tests can observe the exact sequence of broker requests.
#[async_trait]
pub trait TopicControl: Send + Sync {
    async fn subscribe(&self, topic: &str, qos: QoS) -> Result<(), RegistryError>;
    async fn unsubscribe(&self, topic: &str) -> Result<(), RegistryError>;
}

#[async_trait]
impl TopicControl for AsyncClient {
    async fn subscribe(&self, topic: &str, qos: QoS) -> Result<(), RegistryError> {
        AsyncClient::subscribe(self, topic, qos)
            .await
            .map_err(RegistryError::client)
    }

    async fn unsubscribe(&self, topic: &str) -> Result<(), RegistryError> {
        AsyncClient::unsubscribe(self, topic)
            .await
            .map_err(RegistryError::client)
    }
}

/// Bound on each unsubscribe/subscribe step during replay
pub(crate) const REPLAY_STEP_TIMEOUT: Duration = Duration::from_secs(5);

/// Replay every recorded subscription against a (re)established connection
///
/// For each record: unsubscribe, then subscribe again with the recorded
/// topic and QoS. Each step is bounded by [`REPLAY_STEP_TIMEOUT`].
/// Best-effort: per-topic failures are logged and replay continues with the
/// remaining topics.
pub async fn replay_subscriptions<C>(control: &C, table: &SubscriptionTable)
where
    C: TopicControl + ?Sized,
{
    let entries = table.snapshot();
    if entries.is_empty() {
        debug!("no subscriptions to replay");
        return;
    }
    debug!(count = entries.len(), "replaying subscriptions");

    for entry in entries {
        match tokio::time::timeout(REPLAY_STEP_TIMEOUT, control.unsubscribe(&entry.topic)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(topic = %entry.topic, error = %e, "replay unsubscribe failed"),
            Err(_) => warn!(topic = %entry.topic, "replay unsubscribe timed out"),
        }

        match tokio::time::timeout(
            REPLAY_STEP_TIMEOUT,
            control.subscribe(&entry.topic, entry.qos),
        )
        .await
        {
            Ok(Ok(())) => debug!(topic = %entry.topic, "resubscribed"),
            Ok(Err(e)) => warn!(topic = %entry.topic, error = %e, "replay subscribe failed"),
            Err(_) => warn!(topic = %entry.topic, "replay subscribe timed out"),
        }
    }
}
