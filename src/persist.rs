use crate::datastore::Datastore;
use crate::layout::StorageLayout;
use crate::normalize::{Event, UNKNOWN_PLATE};
use crate::payload::RawPayload;
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// What kind of event is being persisted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// Structured tollgate crossing; gets a vehicle_detections row
    Tollgate,
    /// Generic webhook capture
    Webhook,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Tollgate => "tollgate",
            EventKind::Webhook => "webhook",
        }
    }
}

/// Result of persisting one event. Always produced: individual write
/// failures degrade the outcome instead of failing it.
#[derive(Debug, Clone)]
pub struct PersistOutcome {
    /// Folder name under the download root (may not exist on disk if
    /// creation failed)
    pub folder: String,
    /// Image filenames actually written
    pub saved_images: Vec<String>,
    /// JSON artifact filename, if the write succeeded
    pub json_artifact: Option<String>,
}

/// Writes extracted images and the JSON artifact to disk and upserts rows
/// into the datastore.
///
/// The file system is the durability guarantee of record; the datastore is
/// an index on top of it, so datastore failures are logged and swallowed.
pub struct PersistenceGateway {
    download_dir: PathBuf,
    json_dir: PathBuf,
    datastore: Arc<dyn Datastore>,
}

impl PersistenceGateway {
    pub fn new(
        download_dir: impl Into<PathBuf>,
        json_dir: impl Into<PathBuf>,
        datastore: Arc<dyn Datastore>,
    ) -> std::io::Result<Self> {
        let download_dir = download_dir.into();
        let json_dir = json_dir.into();
        std::fs::create_dir_all(&download_dir)?;
        std::fs::create_dir_all(&json_dir)?;
        Ok(Self {
            download_dir,
            json_dir,
            datastore,
        })
    }

    /// Persist one event: folder, images, JSON artifact, datastore rows.
    /// Each step is independent of the others' failure.
    #[instrument(skip(self, event, layout), fields(event_id = %event.event_id, plate = %event.plate_number))]
    pub async fn persist_event(
        &self,
        event: &Event,
        layout: &StorageLayout,
        kind: EventKind,
    ) -> PersistOutcome {
        let folder_path = self.download_dir.join(&layout.folder);

        // 1. Folder creation is idempotent; already-exists is not an error
        let folder_ok = match tokio::fs::create_dir_all(&folder_path).await {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, folder = %layout.folder, "Failed to create event folder");
                false
            }
        };

        // 2. Image writes; an individual failure never aborts the rest
        let mut saved_images = Vec::new();
        if folder_ok {
            for (artifact, name) in event.images.iter().zip(&layout.image_names) {
                match tokio::fs::write(folder_path.join(name), &artifact.data).await {
                    Ok(()) => {
                        debug!(file = %name, size_bytes = artifact.data.len(), "Image saved");
                        metrics::counter!("gateway.images.saved").increment(1);
                        saved_images.push(name.clone());
                    }
                    Err(e) => {
                        warn!(error = %e, file = %name, "Failed to write image, skipping");
                        metrics::counter!("gateway.images.write_failed").increment(1);
                    }
                }
            }
        }

        // 3. JSON artifact for audit/replay
        let artifact = self.build_artifact(event, layout, kind, &saved_images);
        let json_artifact = match self.write_artifact(&layout.json_artifact_name, &artifact).await {
            Ok(()) => Some(layout.json_artifact_name.clone()),
            Err(e) => {
                warn!(error = %e, artifact = %layout.json_artifact_name, "Failed to write JSON artifact");
                None
            }
        };

        // 4. Best-effort datastore upserts
        self.index_event(event, layout, kind, &saved_images).await;

        info!(
            folder = %layout.folder,
            images = saved_images.len(),
            "Event persisted"
        );

        PersistOutcome {
            folder: layout.folder.clone(),
            saved_images,
            json_artifact,
        }
    }

    fn build_artifact(
        &self,
        event: &Event,
        layout: &StorageLayout,
        kind: EventKind,
        saved_images: &[String],
    ) -> Value {
        json!({
            "event_id": event.event_id,
            "event_type": kind.as_str(),
            "camera": event.source_camera,
            "plate": event.plate_number,
            "plate_color": event.plate_color,
            "vehicle_color": event.vehicle_color,
            "accurate_time": event.accurate_time,
            "received_at": event.received_at,
            "folder": layout.folder,
            "saved_images": saved_images,
            "payload": payload_value(&event.raw_payload),
        })
    }

    async fn write_artifact(&self, name: &str, artifact: &Value) -> anyhow::Result<()> {
        use tokio::io::AsyncWriteExt;

        let bytes = serde_json::to_vec_pretty(artifact)?;
        let mut file = tokio::fs::File::create(self.json_dir.join(name)).await?;
        file.write_all(&bytes).await?;
        file.sync_all().await?;
        Ok(())
    }

    async fn index_event(
        &self,
        event: &Event,
        layout: &StorageLayout,
        kind: EventKind,
        saved_images: &[String],
    ) {
        let data = payload_value(&event.raw_payload);
        let vehicle_data = vehicle_summary(event);

        if let Err(e) = self
            .datastore
            .add_webhook_event(
                event.event_id,
                kind.as_str(),
                Some(&data),
                Some(&vehicle_data),
                saved_images.first().map(String::as_str),
            )
            .await
        {
            warn!(error = %e, event_id = %event.event_id, "Datastore webhook-event write failed");
            metrics::counter!("gateway.datastore.errors").increment(1);
        }

        if kind == EventKind::Tollgate {
            let image_url = format!("{}/{}", self.download_dir.display(), layout.folder);
            if let Err(e) = self
                .datastore
                .add_vehicle_detection(event.event_id, &event.plate_number, Some(&data), &image_url)
                .await
            {
                warn!(error = %e, event_id = %event.event_id, "Datastore detection write failed");
                metrics::counter!("gateway.datastore.errors").increment(1);
            }
        }
    }

    /// Rescan the JSON-artifact directory and re-upsert rows missing from
    /// the datastore. Idempotent: webhook_events is unique on event_id, so
    /// running this repeatedly is safe. Reconciles the expected
    /// "file persisted but datastore row missing" inconsistency.
    #[instrument(skip(self))]
    pub async fn resync(&self) -> anyhow::Result<usize> {
        let mut entries = tokio::fs::read_dir(&self.json_dir).await?;
        let mut upserted = 0usize;

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }

            let artifact: Value = match tokio::fs::read(&path).await {
                Ok(bytes) => match serde_json::from_slice(&bytes) {
                    Ok(value) => value,
                    Err(e) => {
                        warn!(error = %e, path = %path.display(), "Skipping unparseable artifact");
                        continue;
                    }
                },
                Err(e) => {
                    warn!(error = %e, path = %path.display(), "Skipping unreadable artifact");
                    continue;
                }
            };

            let Some(event_id) = artifact
                .get("event_id")
                .and_then(Value::as_str)
                .and_then(|s| Uuid::parse_str(s).ok())
            else {
                continue;
            };

            let event_type = artifact
                .get("event_type")
                .and_then(Value::as_str)
                .unwrap_or("webhook");
            let image_filename = artifact
                .get("saved_images")
                .and_then(Value::as_array)
                .and_then(|a| a.first())
                .and_then(Value::as_str);
            let payload = artifact.get("payload");

            match self
                .datastore
                .add_webhook_event(event_id, event_type, payload, None, image_filename)
                .await
            {
                Ok(()) => upserted += 1,
                Err(e) => {
                    warn!(error = %e, event_id = %event_id, "Resync upsert failed");
                    metrics::counter!("gateway.datastore.errors").increment(1);
                }
            }

            if event_type == EventKind::Tollgate.as_str() {
                self.resync_detection(event_id, &artifact).await;
            }
        }

        info!(upserted, "Artifact resync finished");
        metrics::counter!("gateway.resync.rows").increment(upserted as u64);
        Ok(upserted)
    }

    /// Rebuild the detection row for a tollgate artifact when the datastore
    /// lost it. vehicle_detections has no unique key, so an existence check
    /// keeps repeated runs idempotent.
    async fn resync_detection(&self, event_id: Uuid, artifact: &Value) {
        match self.datastore.has_vehicle_detection(event_id).await {
            Ok(true) => return,
            Ok(false) => {}
            Err(e) => {
                warn!(error = %e, event_id = %event_id, "Detection existence check failed");
                metrics::counter!("gateway.datastore.errors").increment(1);
                return;
            }
        }

        let plate = artifact
            .get("plate")
            .and_then(Value::as_str)
            .unwrap_or(UNKNOWN_PLATE);
        let image_url = match artifact.get("folder").and_then(Value::as_str) {
            Some(folder) => format!("{}/{}", self.download_dir.display(), folder),
            None => self.download_dir.display().to_string(),
        };

        if let Err(e) = self
            .datastore
            .add_vehicle_detection(event_id, plate, artifact.get("payload"), &image_url)
            .await
        {
            warn!(error = %e, event_id = %event_id, "Resync detection insert failed");
            metrics::counter!("gateway.datastore.errors").increment(1);
        }
    }
}

fn payload_value(payload: &RawPayload) -> Value {
    match payload {
        RawPayload::Json(value) => value.clone(),
        RawPayload::Multipart(parts) => json!({
            "parts": parts
                .iter()
                .map(|p| {
                    json!({
                        "field": p.field,
                        "filename": p.file_name,
                        "size_bytes": p.data.len(),
                    })
                })
                .collect::<Vec<_>>(),
        }),
        RawPayload::Raw(bytes) => json!({
            "raw": String::from_utf8_lossy(bytes),
        }),
    }
}

fn vehicle_summary(event: &Event) -> Value {
    json!({
        "plate": event.plate_number,
        "plate_color": event.plate_color,
        "vehicle_color": event.vehicle_color,
        "camera": event.source_camera,
    })
}
