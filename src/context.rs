use crate::config::Config;
use crate::datastore::Datastore;
use crate::event_log::EventLog;
use crate::normalize::Event;
use crate::persist::{PersistOutcome, PersistenceGateway};
use anyhow::{Context as _, Result};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use uuid::Uuid;

/// Compact event view kept in the in-memory ring buffer; serves the
/// events-query endpoint when the datastore is unavailable
#[derive(Debug, Clone, Serialize)]
pub struct EventSummary {
    pub event_id: Uuid,
    pub received_at: DateTime<Utc>,
    pub camera: String,
    pub plate: String,
    pub folder: Option<String>,
    pub images: usize,
}

impl EventSummary {
    pub fn new(event: &Event, outcome: &PersistOutcome) -> Self {
        Self {
            event_id: event.event_id,
            received_at: event.received_at,
            camera: event.source_camera.clone(),
            plate: event.plate_number.clone(),
            folder: Some(outcome.folder.clone()),
            images: outcome.saved_images.len(),
        }
    }
}

/// Process-scoped ingestion context, constructed once at startup and shared
/// by every request handler.
///
/// Counters and the ring buffer are volatile diagnostics; the datastore and
/// the file layout are the system of record.
pub struct IngestContext {
    pub config: Config,
    pub datastore: Arc<dyn Datastore>,
    pub gateway: PersistenceGateway,
    pub event_log: EventLog,
    /// Per-camera monotonically increasing counters, reset on restart
    counters: RwLock<HashMap<String, AtomicU64>>,
    recent: Mutex<VecDeque<EventSummary>>,
}

impl IngestContext {
    pub fn new(config: Config, datastore: Arc<dyn Datastore>) -> Result<Self> {
        let gateway = PersistenceGateway::new(
            &config.storage.download_dir,
            &config.storage.json_dir,
            datastore.clone(),
        )
        .context("Failed to prepare storage directories")?;

        let event_log =
            EventLog::new(&config.storage.log_dir).context("Failed to prepare log directory")?;

        Ok(Self {
            config,
            datastore,
            gateway,
            event_log,
            counters: RwLock::new(HashMap::new()),
            recent: Mutex::new(VecDeque::new()),
        })
    }

    /// Increment the camera's counter and return its new value
    pub fn record_event(&self, camera: &str) -> u64 {
        {
            let counters = self.counters.read();
            if let Some(counter) = counters.get(camera) {
                return counter.fetch_add(1, Ordering::SeqCst) + 1;
            }
        }

        let mut counters = self.counters.write();
        counters
            .entry(camera.to_string())
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(1, Ordering::SeqCst)
            + 1
    }

    /// Snapshot of all per-camera counts
    pub fn counts(&self) -> HashMap<String, u64> {
        self.counters
            .read()
            .iter()
            .map(|(camera, count)| (camera.clone(), count.load(Ordering::SeqCst)))
            .collect()
    }

    /// Sum of all per-camera counts
    pub fn total_count(&self) -> u64 {
        self.counters
            .read()
            .values()
            .map(|count| count.load(Ordering::SeqCst))
            .sum()
    }

    /// Push a summary into the ring buffer, newest first
    pub fn push_recent(&self, summary: EventSummary) {
        let mut recent = self.recent.lock();
        recent.push_front(summary);
        let capacity = self.config.cameras.recent_events_capacity;
        while recent.len() > capacity {
            recent.pop_back();
        }
    }

    /// Most recent summaries, newest first
    pub fn recent_events(&self, limit: usize) -> Vec<EventSummary> {
        self.recent.lock().iter().take(limit).cloned().collect()
    }

    pub fn ip_map(&self) -> &HashMap<String, String> {
        &self.config.cameras.ip_map
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datastore::SqliteDatastore;
    use tempfile::TempDir;

    async fn context(dir: &TempDir) -> IngestContext {
        let mut config = Config {
            service: Default::default(),
            http: Default::default(),
            storage: Default::default(),
            database: Default::default(),
            cameras: Default::default(),
        };
        config.storage.download_dir = dir.path().join("downloads").display().to_string();
        config.storage.json_dir = dir.path().join("json_data").display().to_string();
        config.storage.log_dir = dir.path().join("logs").display().to_string();
        config.cameras.recent_events_capacity = 3;

        let store = Arc::new(SqliteDatastore::connect(":memory:").await.unwrap());
        IngestContext::new(config, store).unwrap()
    }

    #[tokio::test]
    async fn test_counters_are_per_camera() {
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir).await;

        assert_eq!(ctx.record_event("camera1"), 1);
        assert_eq!(ctx.record_event("camera1"), 2);
        assert_eq!(ctx.record_event("camera2"), 1);
        assert_eq!(ctx.total_count(), 3);
        assert_eq!(ctx.counts().get("camera1"), Some(&2));
    }

    #[tokio::test]
    async fn test_concurrent_increments_are_atomic() {
        let dir = TempDir::new().unwrap();
        let ctx = Arc::new(context(&dir).await);

        let mut handles = Vec::new();
        for _ in 0..8 {
            let ctx = ctx.clone();
            handles.push(tokio::spawn(async move {
                for _ in 0..50 {
                    ctx.record_event("camera1");
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(ctx.counts().get("camera1"), Some(&400));
    }

    #[tokio::test]
    async fn test_ring_buffer_is_bounded_and_newest_first() {
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir).await;

        for i in 0..5u64 {
            ctx.push_recent(EventSummary {
                event_id: Uuid::new_v4(),
                received_at: Utc::now(),
                camera: "cam".to_string(),
                plate: format!("PLATE{i}"),
                folder: None,
                images: 0,
            });
        }

        let recent = ctx.recent_events(10);
        assert_eq!(recent.len(), 3);
        assert_eq!(recent[0].plate, "PLATE4");
        assert_eq!(recent[2].plate, "PLATE2");
    }
}
