use crate::normalize::Event;

/// Filesystem layout derived deterministically from one event; recomputed
/// per event, never persisted itself
#[derive(Debug, Clone)]
pub struct StorageLayout {
    /// Folder name under the download root:
    /// `{camera}_{plate}_{event-id fragment}`
    pub folder: String,
    /// Artifact name under the JSON root: `{camera}_{timestamp}.json`
    pub json_artifact_name: String,
    /// Per-image filenames, index-aligned with `Event::images`
    pub image_names: Vec<String>,
}

impl StorageLayout {
    /// Derive the layout for an event.
    ///
    /// The folder always embeds the first 8 hex characters of the event id,
    /// so two events with identical plate and camera arriving within the
    /// same second still land in distinct folders. Image names honor a
    /// sanitized declared name when the payload provides one, but the
    /// extension is always the sniffed one.
    pub fn for_event(event: &Event) -> Self {
        let camera = sanitize(&event.source_camera);
        let plate = sanitize(&event.plate_number);
        let id_hex = event.event_id.simple().to_string();
        let id_fragment = &id_hex[..8];

        let folder = format!("{camera}_{plate}_{id_fragment}");

        let json_artifact_name = format!(
            "{camera}_{}.json",
            event.received_at.format("%Y%m%d_%H%M%S_%f")
        );

        let image_names = event
            .images
            .iter()
            .map(|artifact| {
                let stem = artifact
                    .declared_name
                    .as_deref()
                    .map(|name| {
                        let stem = name.rsplit_once('.').map(|(s, _)| s).unwrap_or(name);
                        sanitize(stem)
                    })
                    .filter(|s| !s.is_empty() && s.chars().any(|c| c != '_'))
                    .unwrap_or_else(|| artifact.role.default_stem().to_string());
                format!("{stem}{}", artifact.sniffed_extension)
            })
            .collect();

        Self {
            folder,
            json_artifact_name,
            image_names,
        }
    }
}

/// Sanitize a path component to prevent path traversal.
///
/// Plate strings and declared filenames are attacker- or
/// firmware-controlled; everything outside `[A-Za-z0-9_-]` becomes `_`.
pub fn sanitize(component: &str) -> String {
    component
        .chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '_' => c,
            _ => '_',
        })
        .collect()
}
