//! Supervised MQTT sessions
//!
//! A session is one live broker connection plus the bookkeeping that makes
//! it survive reconnects. The module is split into a pure half and an I/O
//! half:
//!
//! - [`connection`] - URI-to-options translation, connection state, backoff
//! - [`subscriptions`] - subscription records, dispatch, reconnect replay
//! - [`client`] - the supervised connection itself
//!
//! Sessions are normally created and owned through
//! [`Registry`](crate::registry::Registry) rather than directly.

pub mod client;
pub mod connection;
pub mod subscriptions;

pub use client::MqttSession;
pub use connection::{broker_options, BrokerOptions, ConnectionState, ReconnectConfig};
pub use subscriptions::{
    replay_subscriptions, topic_filter_matches, SubscribeHandler, Subscription,
    SubscriptionTable, TopicControl,
};
