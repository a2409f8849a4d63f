//! Test doubles standing in for the broker and TimescaleDB.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use birdnet_timescale::birdnet::DetectionEvent;
use birdnet_timescale::error::{BridgeError, Result};
use birdnet_timescale::mqtt::{MessageHandler, Subscriber};
use birdnet_timescale::timescale::EventSink;
use rumqttc::QoS;

/// Broker double: keeps the latest handler per topic and delivers on demand.
#[derive(Default)]
pub struct FakeBroker {
    handlers: Mutex<HashMap<String, (QoS, Arc<dyn MessageHandler>)>>,
    pub subscribe_calls: Mutex<Vec<String>>,
}

impl FakeBroker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Deliver `payload` to the handler bound to `topic`.
    /// Returns `false` when nothing is subscribed.
    pub async fn deliver(&self, topic: &str, payload: &[u8]) -> bool {
        let handler = self
            .handlers
            .lock()
            .unwrap()
            .get(topic)
            .map(|(_, h)| h.clone());
        match handler {
            Some(handler) => {
                handler.handle(topic, payload).await;
                true
            }
            None => false,
        }
    }

    pub fn qos(&self, topic: &str) -> Option<QoS> {
        self.handlers.lock().unwrap().get(topic).map(|(q, _)| *q)
    }
}

#[async_trait]
impl Subscriber for FakeBroker {
    async fn subscribe(
        &self,
        topic: &str,
        qos: QoS,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<()> {
        self.subscribe_calls.lock().unwrap().push(topic.to_string());
        self.handlers
            .lock()
            .unwrap()
            .insert(topic.to_string(), (qos, handler));
        Ok(())
    }
}

/// Sink double recording every insert.
#[derive(Default)]
pub struct RecordingSink {
    pub rows: Mutex<Vec<DetectionEvent>>,
    pub fail: Mutex<bool>,
}

impl RecordingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn rows(&self) -> Vec<DetectionEvent> {
        self.rows.lock().unwrap().clone()
    }

    pub fn set_failing(&self, failing: bool) {
        *self.fail.lock().unwrap() = failing;
    }
}

#[async_trait]
impl EventSink for RecordingSink {
    async fn store(&self, event: &DetectionEvent) -> Result<()> {
        if *self.fail.lock().unwrap() {
            return Err(BridgeError::Persistence(sqlx::Error::PoolClosed));
        }
        self.rows.lock().unwrap().push(event.clone());
        Ok(())
    }
}

pub const ROBIN: &str = r#"{"Date":"2024-05-01","Time":"06:15:00","SpeciesCode":"AMRO","ScientificName":"Turdus migratorius","CommonName":"American Robin","Confidence":0.87}"#;
