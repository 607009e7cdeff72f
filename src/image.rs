use crate::payload::RawPayload;
use base64::{engine::general_purpose::STANDARD, Engine};
use serde_json::Value;
use tracing::trace;

/// Vendor-specific image roles carried by tollgate payloads
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ImageRole {
    /// Cropped plate image
    Cutout,
    /// Full scene image
    Normal,
    /// Vehicle-focused image
    Vehicle,
    /// Flat-payload or multipart image with no declared role
    Generic,
}

impl ImageRole {
    /// Default filename stem when the payload declares no name
    pub fn default_stem(&self) -> &'static str {
        match self {
            ImageRole::Cutout => "cutout",
            ImageRole::Normal => "normal",
            ImageRole::Vehicle => "vehicle",
            ImageRole::Generic => "image",
        }
    }
}

/// One decoded image extracted from a payload
#[derive(Debug, Clone)]
pub struct ImageArtifact {
    pub role: ImageRole,
    /// Decoded image bytes
    pub data: Vec<u8>,
    /// Name declared by the payload (`PicName` or a multipart filename);
    /// never trusted for format detection
    pub declared_name: Option<String>,
    /// File extension derived from magic bytes, including the dot
    pub sniffed_extension: &'static str,
}

impl ImageArtifact {
    fn new(role: ImageRole, data: Vec<u8>, declared_name: Option<String>) -> Self {
        let sniffed_extension = sniff_extension(&data);
        Self {
            role,
            data,
            declared_name,
            sniffed_extension,
        }
    }
}

/// Nested-payload picture keys and the roles they map to
const PICTURE_ROLES: &[(&str, ImageRole)] = &[
    ("CutoutPic", ImageRole::Cutout),
    ("NormalPic", ImageRole::Normal),
    ("VehiclePic", ImageRole::Vehicle),
];

/// Content-bearing keys tried in order inside a picture object. Which one a
/// camera uses depends on its firmware revision.
const CONTENT_KEYS: &[&str] = &["Content", "PicData", "Data", "ContentBase64"];

/// Extract every image the payload carries, regardless of shape.
///
/// Nested `Picture.{CutoutPic,NormalPic,VehiclePic}` objects are tried
/// independently; the absence or corruption of one role never blocks the
/// others. The flat/legacy shape contributes a single top-level `Image`
/// field, and multipart file parts arrive as already-decoded bytes.
pub fn extract_all(payload: &RawPayload) -> Vec<ImageArtifact> {
    let mut artifacts = Vec::new();

    match payload {
        RawPayload::Json(value) => {
            if let Some(picture) = value.get("Picture") {
                for (key, role) in PICTURE_ROLES {
                    if let Some(artifact) = extract_from_picture(picture.get(*key), *role) {
                        artifacts.push(artifact);
                    }
                }
            }

            // Flat/legacy shape: a single base64 image at the top level
            if let Some(content) = value.get("Image").and_then(Value::as_str) {
                if let Some(data) = decode_base64_image(content) {
                    artifacts.push(ImageArtifact::new(ImageRole::Generic, data, None));
                }
            }
        }
        RawPayload::Multipart(parts) => {
            for part in parts {
                if part.data.is_empty() {
                    continue;
                }
                let declared = part
                    .file_name
                    .clone()
                    .or_else(|| Some(part.field.clone()));
                artifacts.push(ImageArtifact::new(
                    ImageRole::Generic,
                    part.data.to_vec(),
                    declared,
                ));
            }
        }
        RawPayload::Raw(_) => {}
    }

    artifacts
}

/// Extract zero-or-one image from a nested picture object.
///
/// Each content-bearing key is tried in order; a key whose value fails to
/// decode falls through to the next candidate before the picture object is
/// given up on entirely.
pub fn extract_from_picture(picture: Option<&Value>, role: ImageRole) -> Option<ImageArtifact> {
    let obj = picture?.as_object()?;

    for key in CONTENT_KEYS {
        let Some(content) = obj.get(*key).and_then(Value::as_str) else {
            continue;
        };
        match decode_base64_image(content) {
            Some(data) => {
                let declared = obj.get("PicName").and_then(Value::as_str).map(str::to_owned);
                return Some(ImageArtifact::new(role, data, declared));
            }
            None => {
                trace!(key = *key, role = ?role, "picture content key failed to decode");
            }
        }
    }

    None
}

/// Decode a base64 image string, tolerating the quirks vendor firmware
/// produces: a `data:*;base64,` URI prefix, JSON-escaped `\/` sequences,
/// and surrounding whitespace. Returns `None` instead of erroring.
pub fn decode_base64_image(content: &str) -> Option<Vec<u8>> {
    let mut content = content.trim();

    if content.starts_with("data:") {
        if let Some((_, rest)) = content.split_once(',') {
            content = rest;
        }
    }

    let unescaped;
    let content = if content.contains("\\/") {
        unescaped = content.replace("\\/", "/");
        unescaped.as_str()
    } else {
        content
    };

    STANDARD.decode(content).ok()
}

/// Derive a file extension from magic bytes, ignoring any claimed name.
///
/// Unrecognized content defaults to `.jpg`: the camera fleet overwhelmingly
/// sends JPEG, and mislabeling beats rejecting the image.
pub fn sniff_extension(data: &[u8]) -> &'static str {
    if data.starts_with(&[0xFF, 0xD8, 0xFF]) {
        ".jpg"
    } else if data.starts_with(&[0x89, 0x50, 0x4E, 0x47]) {
        ".png"
    } else if data.starts_with(b"GIF87a") || data.starts_with(b"GIF89a") {
        ".gif"
    } else if data.len() >= 12 && data.starts_with(b"RIFF") && &data[8..12] == b"WEBP" {
        ".webp"
    } else {
        ".jpg"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payload::MultipartPart;
    use bytes::Bytes;
    use serde_json::json;

    const JPEG_MAGIC: &[u8] = &[0xFF, 0xD8, 0xFF, 0xE0, 0x00, 0x10];
    const PNG_MAGIC: &[u8] = &[0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A];

    #[test]
    fn test_sniff_precedence_over_declared_name() {
        // PNG magic bytes are classified .png even when the payload's
        // declared filename says .jpg
        let picture = json!({
            "Content": STANDARD.encode(PNG_MAGIC),
            "PicName": "plate.jpg",
        });
        let artifact = extract_from_picture(Some(&picture), ImageRole::Cutout).unwrap();
        assert_eq!(artifact.sniffed_extension, ".png");
        assert_eq!(artifact.declared_name.as_deref(), Some("plate.jpg"));
    }

    #[test]
    fn test_sniff_all_formats() {
        assert_eq!(sniff_extension(JPEG_MAGIC), ".jpg");
        assert_eq!(sniff_extension(PNG_MAGIC), ".png");
        assert_eq!(sniff_extension(b"GIF89a..."), ".gif");
        assert_eq!(sniff_extension(b"RIFF\x00\x00\x00\x00WEBPVP8 "), ".webp");
        assert_eq!(sniff_extension(b"garbage"), ".jpg");
        assert_eq!(sniff_extension(&[]), ".jpg");
    }

    #[test]
    fn test_base64_round_trip() {
        let original: Vec<u8> = (0u8..=255).collect();
        let plain = STANDARD.encode(&original);

        assert_eq!(decode_base64_image(&plain).unwrap(), original);

        let with_prefix = format!("data:image/jpeg;base64,{plain}");
        assert_eq!(decode_base64_image(&with_prefix).unwrap(), original);

        let escaped = plain.replace('/', "\\/");
        assert_eq!(decode_base64_image(&escaped).unwrap(), original);

        let both = format!("data:image/png;base64,{}", plain.replace('/', "\\/"));
        assert_eq!(decode_base64_image(&both).unwrap(), original);
    }

    #[test]
    fn test_decode_failure_returns_none() {
        assert!(decode_base64_image("not!!valid@@base64").is_none());
    }

    #[test]
    fn test_content_key_fallback_order() {
        // A corrupt first key falls through to the next candidate
        let picture = json!({
            "Content": "%%%not-base64%%%",
            "PicData": STANDARD.encode(JPEG_MAGIC),
        });
        let artifact = extract_from_picture(Some(&picture), ImageRole::Normal).unwrap();
        assert_eq!(artifact.data, JPEG_MAGIC);
    }

    #[test]
    fn test_missing_role_never_blocks_others() {
        let payload = RawPayload::Json(json!({
            "Picture": {
                "CutoutPic": { "Content": STANDARD.encode(JPEG_MAGIC) },
                "VehiclePic": { "Content": "###corrupt###" },
            }
        }));
        let artifacts = extract_all(&payload);
        assert_eq!(artifacts.len(), 1);
        assert_eq!(artifacts[0].role, ImageRole::Cutout);
    }

    #[test]
    fn test_flat_image_field() {
        let payload = RawPayload::Json(json!({
            "Plate": "KA01AB1234",
            "Image": STANDARD.encode(JPEG_MAGIC),
        }));
        let artifacts = extract_all(&payload);
        assert_eq!(artifacts.len(), 1);
        assert_eq!(artifacts[0].role, ImageRole::Generic);
        assert_eq!(artifacts[0].sniffed_extension, ".jpg");
    }

    #[test]
    fn test_multipart_parts_become_generic_artifacts() {
        let payload = RawPayload::Multipart(vec![
            MultipartPart {
                field: "snapshot".to_string(),
                file_name: Some("snap.png".to_string()),
                data: Bytes::from_static(PNG_MAGIC),
            },
            MultipartPart {
                field: "empty".to_string(),
                file_name: None,
                data: Bytes::new(),
            },
        ]);
        let artifacts = extract_all(&payload);
        assert_eq!(artifacts.len(), 1);
        assert_eq!(artifacts[0].declared_name.as_deref(), Some("snap.png"));
        assert_eq!(artifacts[0].sniffed_extension, ".png");
    }

    #[test]
    fn test_raw_payload_yields_nothing() {
        let payload = RawPayload::Raw(Bytes::from_static(b"opaque"));
        assert!(extract_all(&payload).is_empty());
    }
}
