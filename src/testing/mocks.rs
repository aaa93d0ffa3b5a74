//! Mock implementations for testing
//!
//! Provides a mock [`TopicControl`] so subscription replay can be exercised
//! without a broker: tests observe the exact sequence of subscribe and
//! unsubscribe requests a replay issues.

use crate::error::RegistryError;
use crate::session::TopicControl;
use async_trait::async_trait;
use rumqttc::v5::mqttbytes::QoS;
use std::sync::{Mutex, PoisonError};

/// One recorded broker request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlCall {
    Subscribe { topic: String, qos: u8 },
    Unsubscribe { topic: String },
}

/// Recording mock for the subscribe/unsubscribe surface
#[derive(Debug, Default)]
pub struct MockTopicControl {
    calls: Mutex<Vec<ControlCall>>,
    fail_topic: Option<String>,
}

impl MockTopicControl {
    pub fn new() -> Self {
        Self::default()
    }

    /// A mock whose requests fail for one specific topic
    pub fn failing_for(topic: impl Into<String>) -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            fail_topic: Some(topic.into()),
        }
    }

    /// Every request recorded so far, in order
    pub fn calls(&self) -> Vec<ControlCall> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn record(&self, call: ControlCall) {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(call);
    }

    fn result_for(&self, topic: &str) -> Result<(), RegistryError> {
        match &self.fail_topic {
            Some(failing) if failing == topic => Err(RegistryError::ConnectionFailed(
                "mock request failure".to_string(),
            )),
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl TopicControl for MockTopicControl {
    async fn subscribe(&self, topic: &str, qos: QoS) -> Result<(), RegistryError> {
        self.record(ControlCall::Subscribe {
            topic: topic.to_string(),
            qos: qos as u8,
        });
        self.result_for(topic)
    }

    async fn unsubscribe(&self, topic: &str) -> Result<(), RegistryError> {
        self.record(ControlCall::Unsubscribe {
            topic: topic.to_string(),
        });
        self.result_for(topic)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_records_calls_in_order() {
        let control = MockTopicControl::new();

        control.subscribe("a", QoS::AtMostOnce).await.unwrap();
        control.unsubscribe("a").await.unwrap();

        assert_eq!(
            control.calls(),
            vec![
                ControlCall::Subscribe {
                    topic: "a".to_string(),
                    qos: 0,
                },
                ControlCall::Unsubscribe {
                    topic: "a".to_string(),
                },
            ]
        );
    }

    #[tokio::test]
    async fn test_mock_fails_only_the_named_topic() {
        let control = MockTopicControl::failing_for("bad");

        assert!(control.subscribe("good", QoS::AtMostOnce).await.is_ok());
        assert!(control.subscribe("bad", QoS::AtMostOnce).await.is_err());
    }
}
