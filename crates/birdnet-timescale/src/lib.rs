//! BirdNET → TimescaleDB bridge
//!
//! Subscribes to the MQTT topic BirdNET publishes detections on, resolves each
//! detection's local date and time against the station's timezone, and writes
//! one row per detection into a TimescaleDB hypertable.
//!
//! # Architecture
//!
//! ```text
//! MQTT broker ──► MqttClient ──► Processor ──► DetectionRecord::to_event ──► TimescaleClient
//!                    │  ▲
//!                    │  └─ SubscriptionRegistry (replayed on every CONNACK)
//!                    └─ auto-reconnect
//! ```
//!
//! # Modules
//!
//! - [`birdnet`] — Detection payloads and timezone normalization.
//! - [`config`] — YAML configuration with environment overrides.
//! - [`error`] — Unified error type for the bridge.
//! - [`mqtt`] — Broker client, subscription registry and detection processor.
//! - [`timescale`] — TimescaleDB sink.

pub mod birdnet;
pub mod config;
pub mod error;
pub mod mqtt;
pub mod timescale;
