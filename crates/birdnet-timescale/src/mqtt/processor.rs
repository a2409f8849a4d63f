//! Detection pipeline: decode → transform → persist, one message at a time.
//!
//! Every failure is logged and the message dropped. Nothing is retried or
//! requeued; QoS redelivery by the broker is the only second chance.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use rumqttc::QoS;

use super::registry::MessageHandler;
use super::Subscriber;
use crate::birdnet::DetectionRecord;
use crate::error::Result;
use crate::timescale::EventSink;

/// Per-stage message counters.
#[derive(Debug, Default)]
pub struct PipelineStats {
    received: AtomicU64,
    stored: AtomicU64,
    decode_failures: AtomicU64,
    transform_failures: AtomicU64,
    persist_failures: AtomicU64,
}

/// Point-in-time copy of [`PipelineStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub received: u64,
    pub stored: u64,
    pub decode_failures: u64,
    pub transform_failures: u64,
    pub persist_failures: u64,
}

impl StatsSnapshot {
    pub fn dropped(&self) -> u64 {
        self.decode_failures + self.transform_failures + self.persist_failures
    }
}

impl PipelineStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            received: self.received.load(Ordering::Relaxed),
            stored: self.stored.load(Ordering::Relaxed),
            decode_failures: self.decode_failures.load(Ordering::Relaxed),
            transform_failures: self.transform_failures.load(Ordering::Relaxed),
            persist_failures: self.persist_failures.load(Ordering::Relaxed),
        }
    }

    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// The handler bound to the detection topic.
struct DetectionPipeline {
    sink: Arc<dyn EventSink>,
    timezone: String,
    stats: PipelineStats,
}

#[async_trait]
impl MessageHandler for DetectionPipeline {
    async fn handle(&self, topic: &str, payload: &[u8]) {
        PipelineStats::bump(&self.stats.received);

        let record = match DetectionRecord::from_payload(payload) {
            Ok(record) => record,
            Err(e) => {
                PipelineStats::bump(&self.stats.decode_failures);
                log::error!(
                    "Dropping message on '{topic}' ({} bytes): {e}",
                    payload.len()
                );
                return;
            }
        };

        let event = match record.to_event(&self.timezone) {
            Ok(event) => event,
            Err(e) => {
                PipelineStats::bump(&self.stats.transform_failures);
                log::error!(
                    "Failed to convert bird detection to event: {e} (species: {}, confidence: {:.2})",
                    record.common_name,
                    record.confidence
                );
                return;
            }
        };

        if let Err(e) = self.sink.store(&event).await {
            PipelineStats::bump(&self.stats.persist_failures);
            log::error!(
                "Failed to store bird detection: {e} (species: {}, confidence: {:.2}, time: {})",
                event.common_name,
                event.confidence,
                event.time.to_rfc3339()
            );
            return;
        }

        PipelineStats::bump(&self.stats.stored);
        log::info!(
            "Stored bird detection: {} ({}) confidence {:.2}",
            event.common_name,
            event.scientific_name,
            event.confidence
        );
    }
}

/// Binds the detection pipeline to one topic.
pub struct Processor {
    subscriber: Arc<dyn Subscriber>,
    pipeline: Arc<DetectionPipeline>,
}

impl Processor {
    pub fn new(
        subscriber: Arc<dyn Subscriber>,
        sink: Arc<dyn EventSink>,
        timezone: impl Into<String>,
    ) -> Self {
        Self {
            subscriber,
            pipeline: Arc::new(DetectionPipeline {
                sink,
                timezone: timezone.into(),
                stats: PipelineStats::default(),
            }),
        }
    }

    /// Subscribe the pipeline to `topic`. Calling again replaces the handler.
    pub async fn start(&self, topic: &str, qos: QoS) -> Result<()> {
        self.subscriber
            .subscribe(topic, qos, self.pipeline.clone())
            .await
    }

    /// Run one payload through the pipeline, as a delivery would.
    pub async fn process(&self, topic: &str, payload: &[u8]) {
        self.pipeline.handle(topic, payload).await;
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.pipeline.stats.snapshot()
    }
}
