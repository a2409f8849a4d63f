//! MQTT side of the bridge: broker client, subscription registry and the
//! detection processor.

pub mod client;
pub mod processor;
pub mod registry;
pub mod topic;

use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use rumqttc::QoS;

use crate::error::{BridgeError, Result};

pub use client::MqttClient;
pub use processor::{PipelineStats, Processor, StatsSnapshot};
pub use registry::{MessageHandler, Subscription, SubscriptionRegistry};

/// Something that can bind a handler to a topic.
///
/// Implemented by [`MqttClient`]; the processor only depends on this trait.
#[async_trait]
pub trait Subscriber: Send + Sync {
    async fn subscribe(
        &self,
        topic: &str,
        qos: QoS,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<()>;
}

/// Convert a configured QoS level.
pub fn qos_from_u8(qos: u8) -> Result<QoS> {
    match qos {
        0 => Ok(QoS::AtMostOnce),
        1 => Ok(QoS::AtLeastOnce),
        2 => Ok(QoS::ExactlyOnce),
        other => Err(BridgeError::Config(format!(
            "QoS must be 0, 1 or 2, got {other}"
        ))),
    }
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}
