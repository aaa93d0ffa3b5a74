//! One supervised MQTT connection
//!
//! [`MqttSession`] owns a rumqttc [`AsyncClient`] and the supervisor task
//! that drives its event loop. The supervisor broadcasts connection state
//! over a watch channel, dispatches delivered messages to the session's
//! subscription table, and on re-connect spawns a replay of every recorded
//! subscription. Replay runs on its own task so a slow broker cannot stall
//! event processing.

use super::connection::{qos_from_level, BrokerOptions, ConnectionState, ReconnectConfig};
use super::subscriptions::{
    replay_subscriptions, Subscription, SubscriptionTable, TopicControl,
};
use crate::error::RegistryError;
use bytes::Bytes;
use rumqttc::v5::mqttbytes::v5::Packet;
use rumqttc::v5::{AsyncClient, Event, EventLoop};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

/// Capacity of the rumqttc request channel
const REQUEST_CHANNEL_CAPACITY: usize = 10;

/// A live, supervised connection to one broker
pub struct MqttSession {
    client: AsyncClient,
    subscriptions: Arc<SubscriptionTable>,
    state_rx: watch::Receiver<ConnectionState>,
    shutdown_tx: watch::Sender<bool>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl MqttSession {
    /// Open a connection and block until it is confirmed, fails, or times out
    ///
    /// The wait is a single bounded wait on the connection state, retried
    /// exactly once on timeout. A definitive failure during the initial
    /// connect is returned as [`RegistryError::ConnectionFailed`]; a second
    /// timeout as [`RegistryError::ConnectTimeout`]. On failure the
    /// half-started session is shut down before the error is returned.
    pub(crate) async fn establish(
        options: BrokerOptions,
        timeout: Duration,
    ) -> Result<Arc<Self>, RegistryError> {
        let BrokerOptions {
            mqtt_options,
            auto_reconnect,
            reconnect,
        } = options;

        let (client, event_loop) = AsyncClient::new(mqtt_options, REQUEST_CHANNEL_CAPACITY);
        let ((state_tx, state_rx), (shutdown_tx, shutdown_rx)) = setup_session_channels();
        let subscriptions = Arc::new(SubscriptionTable::new());

        let supervisor = Supervisor {
            event_loop,
            client: client.clone(),
            subscriptions: subscriptions.clone(),
            state_tx,
            shutdown_rx,
            auto_reconnect,
            reconnect,
        };
        let handle = tokio::spawn(supervisor.run());

        let session = Arc::new(MqttSession {
            client,
            subscriptions,
            state_rx: state_rx.clone(),
            shutdown_tx,
            supervisor: Mutex::new(Some(handle)),
        });

        if let Err(e) = wait_for_connected(state_rx, timeout).await {
            let _ = session.disconnect(Duration::from_secs(1)).await;
            return Err(e);
        }
        if !session.is_connected() {
            let state = session.state();
            let _ = session.disconnect(Duration::from_secs(1)).await;
            return Err(RegistryError::NotConnected { state });
        }

        Ok(session)
    }

    /// Record a subscription and issue it on the connection
    ///
    /// The record is inserted first so no delivered message can slip past an
    /// unrecorded handler; if the underlying subscribe fails the insert is
    /// rolled back (restoring a replaced record), keeping the table in step
    /// with what the broker holds.
    pub async fn subscribe<F>(&self, topic: &str, qos: u8, handler: F) -> Result<(), RegistryError>
    where
        F: Fn(&[u8]) + Send + Sync + 'static,
    {
        let qos = qos_from_level(qos)?;
        let previous = self
            .subscriptions
            .insert(Subscription::new(topic, qos, Arc::new(handler)));

        if let Err(e) = TopicControl::subscribe(&self.client, topic, qos).await {
            match previous {
                Some(prev) => {
                    self.subscriptions.insert(prev);
                }
                None => {
                    self.subscriptions.remove(topic);
                }
            }
            return Err(e);
        }

        debug!(topic, "subscription recorded");
        Ok(())
    }

    /// Replay every recorded subscription against the current connection
    ///
    /// Invoked automatically after a reconnect; exposed for callers that
    /// need to force a replay.
    pub async fn resubscribe_all(&self) {
        replay_subscriptions(&self.client, &self.subscriptions).await;
    }

    /// Current connection state
    pub fn state(&self) -> ConnectionState {
        self.state_rx.borrow().clone()
    }

    /// Whether the connection is currently confirmed
    pub fn is_connected(&self) -> bool {
        matches!(self.state(), ConnectionState::Connected)
    }

    /// Watch receiver for connection state changes
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    /// Topics currently recorded for replay
    pub fn subscribed_topics(&self) -> Vec<String> {
        self.subscriptions
            .snapshot()
            .into_iter()
            .map(|entry| entry.topic)
            .collect()
    }

    /// Disconnect and stop the supervisor
    ///
    /// Disconnecting an already-disconnected session is a no-op. The
    /// supervisor is given `timeout` to stop on its own, then aborted.
    pub async fn disconnect(&self, timeout: Duration) -> Result<(), RegistryError> {
        if self.is_connected() {
            if let Err(e) = self.client.disconnect().await {
                debug!(error = %e, "disconnect request not delivered");
            }
        } else {
            debug!("session already disconnected");
        }

        let _ = self.shutdown_tx.send(true);

        let handle = self
            .supervisor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            let aborter = handle.abort_handle();
            match tokio::time::timeout(timeout, handle).await {
                Ok(Ok(())) => debug!("session supervisor stopped"),
                Ok(Err(e)) if !e.is_cancelled() => {
                    warn!(error = %e, "session supervisor ended with error");
                }
                Ok(Err(_)) => {}
                Err(_) => {
                    warn!("session supervisor did not stop in time, aborting");
                    aborter.abort();
                }
            }
        }

        Ok(())
    }
}

impl Drop for MqttSession {
    fn drop(&mut self) {
        // Stop the background task; graceful shutdown needs an explicit
        // disconnect() call, which cannot happen in Drop
        let _ = self.shutdown_tx.send(true);
        if let Some(handle) = self
            .supervisor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            handle.abort();
        }
    }
}

/// State and shutdown channels for one session
#[allow(clippy::type_complexity)]
fn setup_session_channels() -> (
    (
        watch::Sender<ConnectionState>,
        watch::Receiver<ConnectionState>,
    ),
    (watch::Sender<bool>, watch::Receiver<bool>),
) {
    (
        watch::channel(ConnectionState::Connecting),
        watch::channel(false),
    )
}

/// Single bounded wait for `Connected`, retried exactly once on timeout
async fn wait_for_connected(
    mut state_rx: watch::Receiver<ConnectionState>,
    timeout: Duration,
) -> Result<(), RegistryError> {
    match wait_once(&mut state_rx, timeout).await {
        Err(RegistryError::ConnectTimeout(_)) => {
            debug!("connect wait timed out, retrying once");
            wait_once(&mut state_rx, timeout).await
        }
        other => other,
    }
}

async fn wait_once(
    state_rx: &mut watch::Receiver<ConnectionState>,
    timeout: Duration,
) -> Result<(), RegistryError> {
    let wait = async {
        loop {
            let state = state_rx.borrow_and_update().clone();
            match state {
                ConnectionState::Connected => return Ok(()),
                ConnectionState::Disconnected(reason) => {
                    return Err(RegistryError::ConnectionFailed(reason));
                }
                ConnectionState::PermanentlyDisconnected(reason) => {
                    return Err(RegistryError::ConnectionFailed(format!(
                        "permanently disconnected: {reason}"
                    )));
                }
                ConnectionState::Connecting | ConnectionState::Reconnecting(_) => {}
            }
            if state_rx.changed().await.is_err() {
                return Err(RegistryError::ConnectionFailed(
                    "state channel closed".to_string(),
                ));
            }
        }
    };

    match tokio::time::timeout(timeout, wait).await {
        Ok(result) => result,
        Err(_) => Err(RegistryError::ConnectTimeout(timeout)),
    }
}

/// Routing decision for one event-loop result
#[derive(Debug)]
enum SessionEvent {
    /// ConnAck received - connection confirmed
    Connected,
    /// Message delivered on a subscribed topic
    Message { topic: String, payload: Bytes },
    /// Broker-initiated disconnect
    Disconnected,
    /// Anything else (acks, pings, outgoing events)
    Other,
}

fn route_event(event: &Event) -> SessionEvent {
    match event {
        Event::Incoming(incoming) => match incoming {
            Packet::ConnAck(_) => SessionEvent::Connected,
            Packet::Publish(publish) => SessionEvent::Message {
                topic: String::from_utf8_lossy(&publish.topic).to_string(),
                payload: publish.payload.clone(),
            },
            Packet::Disconnect(_) => SessionEvent::Disconnected,
            other => {
                trace!(packet = ?other, "mqtt event");
                SessionEvent::Other
            }
        },
        Event::Outgoing(_) => SessionEvent::Other,
    }
}

/// Background task that drives the event loop for one session
struct Supervisor {
    event_loop: EventLoop,
    client: AsyncClient,
    subscriptions: Arc<SubscriptionTable>,
    state_tx: watch::Sender<ConnectionState>,
    shutdown_rx: watch::Receiver<bool>,
    auto_reconnect: bool,
    reconnect: ReconnectConfig,
}

impl Supervisor {
    async fn run(mut self) {
        debug!("session supervisor started");
        let mut reconnect_attempts = 0u32;
        let mut ever_connected = false;

        loop {
            tokio::select! {
                _ = self.shutdown_rx.changed() => {
                    if *self.shutdown_rx.borrow() {
                        debug!("shutdown signal received, stopping session supervisor");
                        break;
                    }
                }

                polled = self.event_loop.poll() => match polled {
                    Ok(event) => match route_event(&event) {
                        SessionEvent::Connected => {
                            let _ = self.state_tx.send(ConnectionState::Connected);
                            reconnect_attempts = 0;
                            if ever_connected {
                                info!("mqtt connection re-established");
                                self.spawn_replay();
                            } else {
                                info!("mqtt connection established");
                            }
                            ever_connected = true;
                        }
                        SessionEvent::Message { topic, payload } => {
                            let delivered = self.subscriptions.dispatch(&topic, &payload);
                            trace!(topic = %topic, handlers = delivered, "message dispatched");
                        }
                        SessionEvent::Disconnected => {
                            warn!("mqtt connection lost: broker disconnected");
                            let _ = self.state_tx.send(ConnectionState::Disconnected(
                                "broker disconnected".to_string(),
                            ));
                            if !self.auto_reconnect {
                                break;
                            }
                        }
                        SessionEvent::Other => {}
                    },
                    Err(e) => {
                        warn!(error = %e, "mqtt connection lost");
                        let _ = self.state_tx.send(ConnectionState::Disconnected(e.to_string()));

                        if !self.auto_reconnect {
                            break;
                        }
                        reconnect_attempts += 1;
                        if let Some(max) = self.reconnect.max_attempts {
                            if reconnect_attempts > max {
                                let reason =
                                    format!("max reconnection attempts ({max}) exceeded");
                                let _ = self.state_tx.send(
                                    ConnectionState::PermanentlyDisconnected(reason),
                                );
                                break;
                            }
                        }

                        let delay = self.reconnect.backoff_delay(reconnect_attempts);
                        let _ = self
                            .state_tx
                            .send(ConnectionState::Reconnecting(reconnect_attempts));
                        debug!(attempt = reconnect_attempts, delay_ms = delay, "reconnecting");
                        if !interruptible_sleep(self.shutdown_rx.clone(), delay).await {
                            break;
                        }
                        // Polling again drives the client's own reconnect
                    }
                }
            }
        }
        debug!("session supervisor stopped");
    }

    /// Run replay on its own task so slow per-topic replay cannot starve
    /// event processing
    fn spawn_replay(&self) {
        let client = self.client.clone();
        let subscriptions = self.subscriptions.clone();
        tokio::spawn(async move {
            replay_subscriptions(&client, &subscriptions).await;
        });
    }
}

/// Sleep that stops early when shutdown is signalled
///
/// Returns true if the sleep completed, false on shutdown.
async fn interruptible_sleep(mut shutdown_rx: watch::Receiver<bool>, delay_ms: u64) -> bool {
    tokio::select! {
        _ = shutdown_rx.changed() => !*shutdown_rx.borrow(),
        _ = tokio::time::sleep(Duration::from_millis(delay_ms)) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rumqttc::v5::mqttbytes::v5::{ConnAck, ConnectReturnCode, Publish};
    use rumqttc::v5::mqttbytes::QoS;

    #[test]
    fn test_setup_session_channels() {
        let ((state_tx, state_rx), (shutdown_tx, shutdown_rx)) = setup_session_channels();

        assert_eq!(*state_rx.borrow(), ConnectionState::Connecting);
        assert!(!(*shutdown_rx.borrow()));

        state_tx.send(ConnectionState::Connected).unwrap();
        assert_eq!(*state_rx.borrow(), ConnectionState::Connected);

        shutdown_tx.send(true).unwrap();
        assert!(*shutdown_rx.borrow());
    }

    #[tokio::test]
    async fn test_wait_for_connected_success() {
        let ((state_tx, state_rx), _) = setup_session_channels();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            let _ = state_tx.send(ConnectionState::Connected);
        });

        let result = wait_for_connected(state_rx, Duration::from_millis(200)).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_wait_for_connected_reports_failure_reason() {
        let ((state_tx, state_rx), _) = setup_session_channels();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            let _ = state_tx.send(ConnectionState::Disconnected("refused".to_string()));
        });

        let result = wait_for_connected(state_rx, Duration::from_millis(200)).await;
        match result {
            Err(RegistryError::ConnectionFailed(reason)) => assert_eq!(reason, "refused"),
            other => panic!("expected ConnectionFailed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_wait_for_connected_retries_once_on_timeout() {
        // First wait times out, the single retry then observes Connected
        let ((state_tx, state_rx), _) = setup_session_channels();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(60)).await;
            let _ = state_tx.send(ConnectionState::Connected);
        });

        let result = wait_for_connected(state_rx, Duration::from_millis(40)).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_wait_for_connected_times_out_after_retry() {
        // Keep the sender alive but never signal Connected
        let ((state_tx, state_rx), _) = setup_session_channels();
        let _keep_alive = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            drop(state_tx);
        });

        let timeout = Duration::from_millis(10);
        let result = wait_for_connected(state_rx, timeout).await;
        assert!(matches!(result, Err(RegistryError::ConnectTimeout(t)) if t == timeout));
    }

    #[tokio::test]
    async fn test_interruptible_sleep_completes() {
        let (_, (_, shutdown_rx)) = setup_session_channels();
        assert!(interruptible_sleep(shutdown_rx, 10).await);
    }

    #[tokio::test]
    async fn test_interruptible_sleep_interrupted() {
        let (_, (shutdown_tx, shutdown_rx)) = setup_session_channels();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            let _ = shutdown_tx.send(true);
        });

        assert!(!interruptible_sleep(shutdown_rx, 500).await);
    }

    #[test]
    fn test_route_event() {
        let connack = Event::Incoming(Packet::ConnAck(ConnAck {
            session_present: false,
            code: ConnectReturnCode::Success,
            properties: None,
        }));
        assert!(matches!(route_event(&connack), SessionEvent::Connected));

        let publish = Event::Incoming(Packet::Publish(Publish {
            dup: false,
            qos: QoS::AtLeastOnce,
            retain: false,
            topic: Bytes::from("sensors/temp"),
            pkid: 1,
            payload: Bytes::from("22.5"),
            properties: None,
        }));
        match route_event(&publish) {
            SessionEvent::Message { topic, payload } => {
                assert_eq!(topic, "sensors/temp");
                assert_eq!(payload.as_ref(), b"22.5");
            }
            other => panic!("expected Message, got {other:?}"),
        }
    }
}
