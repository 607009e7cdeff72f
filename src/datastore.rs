use crate::config::DatabaseConfig;
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// One raw webhook event row
#[derive(Debug, Clone, Serialize)]
pub struct WebhookEventRecord {
    pub id: i64,
    pub event_id: String,
    pub timestamp: DateTime<Utc>,
    pub event_type: Option<String>,
    pub data: Option<Value>,
    pub image_filename: Option<String>,
    pub vehicle_data: Option<Value>,
    pub created_at: DateTime<Utc>,
}

/// One structured detection row for a tollgate-style event
#[derive(Debug, Clone, Serialize)]
pub struct VehicleDetectionRecord {
    pub id: i64,
    pub event_id: String,
    pub license_plate: Option<String>,
    pub vehicle_type: Option<String>,
    pub confidence: Option<f64>,
    pub detection_data: Option<Value>,
    pub image_url: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Write/read surface shared by both backends.
///
/// The datastore is an index on top of the file layout, not the system of
/// record; every caller treats these operations as best-effort.
#[async_trait]
pub trait Datastore: Send + Sync {
    /// Name of the active backend, for diagnostics
    fn backend_name(&self) -> &'static str;

    /// Record a raw webhook event. Idempotent on `event_id`.
    async fn add_webhook_event(
        &self,
        event_id: Uuid,
        event_type: &str,
        data: Option<&Value>,
        vehicle_data: Option<&Value>,
        image_filename: Option<&str>,
    ) -> Result<()>;

    /// Record a structured vehicle detection
    async fn add_vehicle_detection(
        &self,
        event_id: Uuid,
        license_plate: &str,
        detection_data: Option<&Value>,
        image_url: &str,
    ) -> Result<()>;

    /// True when a detection row already exists for the event. The table
    /// has no unique constraint, so reconciliation checks before inserting.
    async fn has_vehicle_detection(&self, event_id: Uuid) -> Result<bool>;

    /// Most recent webhook events, newest first
    async fn get_webhook_events(&self, limit: i64) -> Result<Vec<WebhookEventRecord>>;

    /// Most recent vehicle detections, newest first
    async fn get_vehicle_detections(&self, limit: i64) -> Result<Vec<VehicleDetectionRecord>>;

    /// Every detection recorded for one plate, newest first
    async fn get_vehicle_by_plate(&self, plate: &str) -> Result<Vec<VehicleDetectionRecord>>;
}

/// Construct the process-lifetime datastore.
///
/// The primary (PostgreSQL) backend is attempted first; if construction or
/// connection fails the embedded SQLite backend takes over. The choice is
/// fixed for the process lifetime, there is no mid-run failover.
pub async fn connect(config: &DatabaseConfig) -> Result<Arc<dyn Datastore>> {
    match PostgresDatastore::connect(config).await {
        Ok(store) => {
            info!(backend = store.backend_name(), "Datastore ready");
            Ok(Arc::new(store))
        }
        Err(e) => {
            warn!(
                error = %e,
                sqlite_path = %config.sqlite_path,
                "Primary datastore unavailable, falling back to embedded SQLite"
            );
            let store = SqliteDatastore::connect(&config.sqlite_path)
                .await
                .context("Failed to open fallback SQLite datastore")?;
            info!(backend = store.backend_name(), "Datastore ready");
            Ok(Arc::new(store))
        }
    }
}

/// PostgreSQL-backed datastore (primary)
pub struct PostgresDatastore {
    pool: PgPool,
}

impl PostgresDatastore {
    /// Connect and ensure the schema exists
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(Duration::from_secs(config.connect_timeout_secs))
            .connect(&config.url)
            .await
            .context("Failed to connect to PostgreSQL")?;

        let store = Self { pool };
        store.ensure_schema().await?;

        info!("Connected to PostgreSQL datastore");
        Ok(store)
    }

    async fn ensure_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS webhook_events (
                id BIGSERIAL PRIMARY KEY,
                event_id TEXT UNIQUE NOT NULL,
                timestamp TIMESTAMPTZ NOT NULL,
                event_type TEXT,
                data JSONB,
                image_filename TEXT,
                vehicle_data JSONB,
                created_at TIMESTAMPTZ NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("Failed to create webhook_events table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS vehicle_detections (
                id BIGSERIAL PRIMARY KEY,
                event_id TEXT NOT NULL,
                license_plate TEXT,
                vehicle_type TEXT,
                confidence DOUBLE PRECISION,
                detection_data JSONB,
                image_url TEXT,
                created_at TIMESTAMPTZ NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("Failed to create vehicle_detections table")?;

        Ok(())
    }
}

#[async_trait]
impl Datastore for PostgresDatastore {
    fn backend_name(&self) -> &'static str {
        "postgresql"
    }

    async fn add_webhook_event(
        &self,
        event_id: Uuid,
        event_type: &str,
        data: Option<&Value>,
        vehicle_data: Option<&Value>,
        image_filename: Option<&str>,
    ) -> Result<()> {
        let now = Utc::now();
        sqlx::query(
            r#"
            INSERT INTO webhook_events (event_id, timestamp, event_type, data, vehicle_data, image_filename, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (event_id) DO NOTHING
            "#,
        )
        .bind(event_id.to_string())
        .bind(now)
        .bind(event_type)
        .bind(data)
        .bind(vehicle_data)
        .bind(image_filename)
        .bind(now)
        .execute(&self.pool)
        .await
        .context("Failed to insert webhook event")?;

        debug!(event_id = %event_id, event_type, "Webhook event recorded");
        Ok(())
    }

    async fn add_vehicle_detection(
        &self,
        event_id: Uuid,
        license_plate: &str,
        detection_data: Option<&Value>,
        image_url: &str,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO vehicle_detections (event_id, license_plate, detection_data, image_url, created_at)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(event_id.to_string())
        .bind(license_plate)
        .bind(detection_data)
        .bind(image_url)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .context("Failed to insert vehicle detection")?;

        debug!(event_id = %event_id, license_plate, "Vehicle detection recorded");
        Ok(())
    }

    async fn has_vehicle_detection(&self, event_id: Uuid) -> Result<bool> {
        let row = sqlx::query("SELECT 1 FROM vehicle_detections WHERE event_id = $1 LIMIT 1")
            .bind(event_id.to_string())
            .fetch_optional(&self.pool)
            .await
            .context("Failed to check for existing detection")?;

        Ok(row.is_some())
    }

    async fn get_webhook_events(&self, limit: i64) -> Result<Vec<WebhookEventRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT id, event_id, timestamp, event_type, data, image_filename, vehicle_data, created_at
            FROM webhook_events
            ORDER BY created_at DESC
            LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("Failed to query webhook events")?;

        rows.into_iter()
            .map(|row| {
                Ok(WebhookEventRecord {
                    id: row.try_get("id")?,
                    event_id: row.try_get("event_id")?,
                    timestamp: row.try_get("timestamp")?,
                    event_type: row.try_get("event_type")?,
                    data: row.try_get("data")?,
                    image_filename: row.try_get("image_filename")?,
                    vehicle_data: row.try_get("vehicle_data")?,
                    created_at: row.try_get("created_at")?,
                })
            })
            .collect()
    }

    async fn get_vehicle_detections(&self, limit: i64) -> Result<Vec<VehicleDetectionRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT id, event_id, license_plate, vehicle_type, confidence, detection_data, image_url, created_at
            FROM vehicle_detections
            ORDER BY created_at DESC
            LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("Failed to query vehicle detections")?;

        rows.into_iter().map(pg_detection_record).collect()
    }

    async fn get_vehicle_by_plate(&self, plate: &str) -> Result<Vec<VehicleDetectionRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT id, event_id, license_plate, vehicle_type, confidence, detection_data, image_url, created_at
            FROM vehicle_detections
            WHERE license_plate = $1
            ORDER BY created_at DESC
            "#,
        )
        .bind(plate)
        .fetch_all(&self.pool)
        .await
        .context("Failed to query detections by plate")?;

        rows.into_iter().map(pg_detection_record).collect()
    }
}

fn pg_detection_record(row: sqlx::postgres::PgRow) -> Result<VehicleDetectionRecord> {
    Ok(VehicleDetectionRecord {
        id: row.try_get("id")?,
        event_id: row.try_get("event_id")?,
        license_plate: row.try_get("license_plate")?,
        vehicle_type: row.try_get("vehicle_type")?,
        confidence: row.try_get("confidence")?,
        detection_data: row.try_get("detection_data")?,
        image_url: row.try_get("image_url")?,
        created_at: row.try_get("created_at")?,
    })
}

/// Embedded SQLite datastore (fallback).
///
/// Same logical schema as the primary; JSON columns are stored as TEXT.
pub struct SqliteDatastore {
    pool: SqlitePool,
}

impl SqliteDatastore {
    /// Open (creating if missing) and ensure the schema exists.
    /// `":memory:"` opens an in-memory database.
    pub async fn connect(path: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(&format!("sqlite://{path}"))
            .context("Invalid SQLite path")?
            .create_if_missing(true);

        // An in-memory database exists per connection; cap the pool at one
        // so every query sees the same database.
        let max_connections = if path == ":memory:" { 1 } else { 4 };

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await
            .context("Failed to open SQLite database")?;

        let store = Self { pool };
        store.ensure_schema().await?;

        info!(path, "Opened embedded SQLite datastore");
        Ok(store)
    }

    async fn ensure_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS webhook_events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                event_id TEXT UNIQUE NOT NULL,
                timestamp TEXT NOT NULL,
                event_type TEXT,
                data TEXT,
                image_filename TEXT,
                vehicle_data TEXT,
                created_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("Failed to create webhook_events table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS vehicle_detections (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                event_id TEXT NOT NULL,
                license_plate TEXT,
                vehicle_type TEXT,
                confidence REAL,
                detection_data TEXT,
                image_url TEXT,
                created_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("Failed to create vehicle_detections table")?;

        Ok(())
    }
}

#[async_trait]
impl Datastore for SqliteDatastore {
    fn backend_name(&self) -> &'static str {
        "sqlite"
    }

    async fn add_webhook_event(
        &self,
        event_id: Uuid,
        event_type: &str,
        data: Option<&Value>,
        vehicle_data: Option<&Value>,
        image_filename: Option<&str>,
    ) -> Result<()> {
        let now = Utc::now();
        sqlx::query(
            r#"
            INSERT INTO webhook_events (event_id, timestamp, event_type, data, vehicle_data, image_filename, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            ON CONFLICT (event_id) DO NOTHING
            "#,
        )
        .bind(event_id.to_string())
        .bind(now)
        .bind(event_type)
        .bind(data.map(Value::to_string))
        .bind(vehicle_data.map(Value::to_string))
        .bind(image_filename)
        .bind(now)
        .execute(&self.pool)
        .await
        .context("Failed to insert webhook event")?;

        Ok(())
    }

    async fn add_vehicle_detection(
        &self,
        event_id: Uuid,
        license_plate: &str,
        detection_data: Option<&Value>,
        image_url: &str,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO vehicle_detections (event_id, license_plate, detection_data, image_url, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
        )
        .bind(event_id.to_string())
        .bind(license_plate)
        .bind(detection_data.map(Value::to_string))
        .bind(image_url)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .context("Failed to insert vehicle detection")?;

        Ok(())
    }

    async fn has_vehicle_detection(&self, event_id: Uuid) -> Result<bool> {
        let row = sqlx::query("SELECT 1 FROM vehicle_detections WHERE event_id = ?1 LIMIT 1")
            .bind(event_id.to_string())
            .fetch_optional(&self.pool)
            .await
            .context("Failed to check for existing detection")?;

        Ok(row.is_some())
    }

    async fn get_webhook_events(&self, limit: i64) -> Result<Vec<WebhookEventRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT id, event_id, timestamp, event_type, data, image_filename, vehicle_data, created_at
            FROM webhook_events
            ORDER BY created_at DESC, id DESC
            LIMIT ?1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("Failed to query webhook events")?;

        rows.into_iter()
            .map(|row| {
                Ok(WebhookEventRecord {
                    id: row.try_get("id")?,
                    event_id: row.try_get("event_id")?,
                    timestamp: row.try_get("timestamp")?,
                    event_type: row.try_get("event_type")?,
                    data: parse_json_column(row.try_get("data")?),
                    image_filename: row.try_get("image_filename")?,
                    vehicle_data: parse_json_column(row.try_get("vehicle_data")?),
                    created_at: row.try_get("created_at")?,
                })
            })
            .collect()
    }

    async fn get_vehicle_detections(&self, limit: i64) -> Result<Vec<VehicleDetectionRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT id, event_id, license_plate, vehicle_type, confidence, detection_data, image_url, created_at
            FROM vehicle_detections
            ORDER BY created_at DESC, id DESC
            LIMIT ?1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("Failed to query vehicle detections")?;

        rows.into_iter().map(sqlite_detection_record).collect()
    }

    async fn get_vehicle_by_plate(&self, plate: &str) -> Result<Vec<VehicleDetectionRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT id, event_id, license_plate, vehicle_type, confidence, detection_data, image_url, created_at
            FROM vehicle_detections
            WHERE license_plate = ?1
            ORDER BY created_at DESC, id DESC
            "#,
        )
        .bind(plate)
        .fetch_all(&self.pool)
        .await
        .context("Failed to query detections by plate")?;

        rows.into_iter().map(sqlite_detection_record).collect()
    }
}

fn sqlite_detection_record(row: sqlx::sqlite::SqliteRow) -> Result<VehicleDetectionRecord> {
    Ok(VehicleDetectionRecord {
        id: row.try_get("id")?,
        event_id: row.try_get("event_id")?,
        license_plate: row.try_get("license_plate")?,
        vehicle_type: row.try_get("vehicle_type")?,
        confidence: row.try_get("confidence")?,
        detection_data: parse_json_column(row.try_get("detection_data")?),
        image_url: row.try_get("image_url")?,
        created_at: row.try_get("created_at")?,
    })
}

fn parse_json_column(text: Option<String>) -> Option<Value> {
    text.and_then(|t| serde_json::from_str(&t).ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn memory_store() -> SqliteDatastore {
        SqliteDatastore::connect(":memory:").await.unwrap()
    }

    #[tokio::test]
    async fn test_webhook_event_round_trip() {
        let store = memory_store().await;
        let event_id = Uuid::new_v4();
        let data = json!({ "Plate": "KA51AB1234" });

        store
            .add_webhook_event(event_id, "tollgate", Some(&data), None, Some("cutout.jpg"))
            .await
            .unwrap();

        let events = store.get_webhook_events(10).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_id, event_id.to_string());
        assert_eq!(events[0].event_type.as_deref(), Some("tollgate"));
        assert_eq!(events[0].data, Some(data));
        assert_eq!(events[0].image_filename.as_deref(), Some("cutout.jpg"));
    }

    #[tokio::test]
    async fn test_webhook_event_idempotent_on_event_id() {
        let store = memory_store().await;
        let event_id = Uuid::new_v4();

        for _ in 0..3 {
            store
                .add_webhook_event(event_id, "webhook", None, None, None)
                .await
                .unwrap();
        }

        let events = store.get_webhook_events(10).await.unwrap();
        assert_eq!(events.len(), 1);
    }

    #[tokio::test]
    async fn test_detection_query_by_plate() {
        let store = memory_store().await;
        let detection = json!({ "Picture": { "Plate": { "PlateNumber": "MH12XY9999" } } });

        store
            .add_vehicle_detection(Uuid::new_v4(), "MH12XY9999", Some(&detection), "downloads/a")
            .await
            .unwrap();
        store
            .add_vehicle_detection(Uuid::new_v4(), "KA51AB1234", None, "downloads/b")
            .await
            .unwrap();

        let matches = store.get_vehicle_by_plate("MH12XY9999").await.unwrap();
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].image_url.as_deref(), Some("downloads/a"));
        assert_eq!(matches[0].detection_data, Some(detection));

        let all = store.get_vehicle_detections(10).await.unwrap();
        assert_eq!(all.len(), 2);
    }

    #[tokio::test]
    async fn test_webhook_events_newest_first_and_limited() {
        let store = memory_store().await;
        let ids: Vec<Uuid> = (0..5).map(|_| Uuid::new_v4()).collect();

        for id in &ids {
            store
                .add_webhook_event(*id, "webhook", None, None, None)
                .await
                .unwrap();
        }

        let events = store.get_webhook_events(3).await.unwrap();
        assert_eq!(events.len(), 3);
        assert_eq!(events[0].event_id, ids[4].to_string());
    }
}
