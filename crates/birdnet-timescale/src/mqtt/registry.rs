//! Subscription bookkeeping for replay after reconnects.
//!
//! Brokers forget subscriptions when a clean session is dropped, so the
//! client keeps every acknowledged `(topic, qos, handler)` binding here and
//! re-issues them after each CONNACK. Inbound publishes are routed through the
//! same table.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use rumqttc::QoS;

use super::topic::filter_matches;
use crate::error::Result;

/// Consumer of raw payloads delivered on a subscribed topic.
///
/// Handlers may run concurrently with handlers of other topics and must not
/// rely on ordering beyond what the subscription QoS provides.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, topic: &str, payload: &[u8]);
}

/// A topic filter bound to a QoS level and a handler.
#[derive(Clone)]
pub struct Subscription {
    pub topic: String,
    pub qos: QoS,
    pub handler: Arc<dyn MessageHandler>,
}

impl Subscription {
    pub fn new(topic: impl Into<String>, qos: QoS, handler: Arc<dyn MessageHandler>) -> Self {
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

/// Topic-keyed subscription table, safe to share between the event loop,
/// replay tasks and callers of `subscribe`.
#[derive(Default)]
pub struct SubscriptionRegistry {
    entries: Mutex<HashMap<String, Subscription>>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Subscription>> {
        // Entries are replaced whole, so a poisoned map is still consistent.
        super::lock(&self.entries)
    }

    /// Insert or replace the binding for `subscription.topic`.
    /// Returns the binding it replaced, if any.
    pub fn register(&self, subscription: Subscription) -> Option<Subscription> {
        self.lock()
            .insert(subscription.topic.clone(), subscription)
    }

    /// Snapshot of all bindings, for replay.
    pub fn all(&self) -> Vec<Subscription> {
        self.lock().values().cloned().collect()
    }

    pub fn remove(&self, topic: &str) -> Option<Subscription> {
        self.lock().remove(topic)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Find the handler for an inbound publish.
    ///
    /// An exact topic binding wins over wildcard filters.
    pub fn route(&self, topic: &str) -> Option<Arc<dyn MessageHandler>> {
        let entries = self.lock();
        if let Some(sub) = entries.get(topic) {
            return Some(sub.handler.clone());
        }
        entries
            .values()
            .find(|sub| filter_matches(&sub.topic, topic))
            .map(|sub| sub.handler.clone())
    }
}

/// Re-issues a SUBSCRIBE for an already registered binding.
#[async_trait]
pub trait SubscribeTransport: Send + Sync {
    async fn resubscribe(&self, subscription: &Subscription) -> Result<()>;
}

/// Replay every binding in `subscriptions`, one request per topic.
///
/// A failure is logged and does not stop the remaining topics.
/// Returns how many topics were re-subscribed.
pub async fn resubscribe_all<T>(transport: &T, subscriptions: Vec<Subscription>) -> usize
where
    T: SubscribeTransport + ?Sized,
{
    let mut restored = 0;
    for subscription in &subscriptions {
        match transport.resubscribe(subscription).await {
            Ok(()) => {
                restored += 1;
                log::info!("Re-subscribed to topic: {}", subscription.topic);
            }
            Err(e) => {
                log::error!(
                    "Failed to re-subscribe to topic '{}': {e}",
                    subscription.topic
                );
            }
        }
    }
    restored
}
