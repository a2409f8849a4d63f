use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::Connection;

use crate::birdnet::DetectionEvent;
use crate::config::TimescaleConfig;
use crate::error::Result;

const INSERT_BIRD_DETECTION: &str = include_str!("../queries/insert_bird_detection.sql");
const CREATE_BIRD_DETECTIONS: &str = include_str!("../queries/create_bird_detections.sql");

/// Destination for normalized detections.
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Persist one event. Every call writes a new row; nothing is deduplicated.
    async fn store(&self, event: &DetectionEvent) -> Result<()>;
}

/// TimescaleDB client writing to the `bird_detections` hypertable.
pub struct TimescaleClient {
    pool: PgPool,
}

impl TimescaleClient {
    /// Open the pool and ping the database once.
    pub async fn connect(config: &TimescaleConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(config.acquire_timeout())
            .connect(&config.conn_string)
            .await?;

        let mut conn = pool.acquire().await?;
        conn.ping().await?;
        drop(conn);

        log::info!(
            "Connected to TimescaleDB (max {} connections)",
            config.max_connections
        );
        Ok(Self { pool })
    }

    /// Create the `bird_detections` hypertable if it does not exist yet.
    pub async fn ensure_schema(&self) -> Result<()> {
        sqlx::raw_sql(CREATE_BIRD_DETECTIONS)
            .execute(&self.pool)
            .await?;
        log::info!("Ensured 'bird_detections' hypertable");
        Ok(())
    }

    pub async fn store_detection(&self, event: &DetectionEvent) -> Result<()> {
        sqlx::query(INSERT_BIRD_DETECTION)
            .bind(event.time)
            .bind(event.source_node.as_str())
            .bind(event.source.as_str())
            .bind(event.begin_time)
            .bind(event.end_time)
            .bind(event.species_code.as_str())
            .bind(event.scientific_name.as_str())
            .bind(event.common_name.as_str())
            .bind(event.confidence)
            .bind(event.latitude)
            .bind(event.longitude)
            .bind(event.threshold)
            .bind(event.sensitivity)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[async_trait]
impl EventSink for TimescaleClient {
    async fn store(&self, event: &DetectionEvent) -> Result<()> {
        self.store_detection(event).await
    }
}
