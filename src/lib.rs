//! ANPR Gateway
//!
//! HTTP ingestion gateway for ANPR (number-plate recognition) cameras. The
//! gateway accepts vendor webhook notifications in whatever shape the camera
//! sends them, normalizes each one into a uniform event, extracts and decodes
//! embedded plate images, and persists everything to a per-event folder on
//! disk plus a queryable datastore index.
//!
//! ## Features
//!
//! - **Tolerant Decoding**: JSON, multipart, and raw bodies all become a
//!   `RawPayload`; malformed input degrades instead of erroring
//! - **Field Normalization**: plate, colors, camera, and timestamp resolved
//!   through ordered path chains with `UNKNOWN` sentinels
//! - **Image Extraction**: base64 images located under vendor key variants,
//!   decoded, and typed by magic-byte sniffing
//! - **Durable Layout**: one folder per event with images and a JSON
//!   artifact; the datastore (PostgreSQL, SQLite fallback) is an index that
//!   can be rebuilt from the artifacts
//!
//! ## Architecture
//!
//! ```text
//! Camera POST               Gateway                    Storage
//! ┌──────────────┐         ┌──────────────┐          ┌──────────────────┐
//! │ /Notification│         │ payload      │          │ downloads/       │
//! │ Info/Tollgate│────────▶│   decode     │          │   {cam}_{plate}_ │
//! │ Info         │         └──────┬───────┘          │   {id}/          │
//! └──────────────┘                │                  ├──────────────────┤
//! ┌──────────────┐         ┌──────▼───────┐          │ json_data/       │
//! │ /webhook     │────────▶│ normalize +  │          │   *.json         │
//! └──────────────┘         │ image extract│          ├──────────────────┤
//!                          └──────┬───────┘          │ logs/            │
//!                                 │                  │   {src}_{date}   │
//!                          ┌──────▼───────┐          └──────────────────┘
//!                          │ persistence  │                  │
//!                          │ gateway      │──────────────────┘
//!                          └──────┬───────┘
//!                                 │
//!                          ┌──────▼───────┐
//!                          │ datastore    │  PostgreSQL / SQLite
//!                          └──────────────┘
//! ```

pub mod config;
pub mod context;
pub mod datastore;
pub mod event_log;
pub mod image;
pub mod layout;
pub mod normalize;
pub mod payload;
pub mod persist;
pub mod server;

pub use config::Config;
pub use context::IngestContext;
pub use normalize::Event;
pub use payload::RawPayload;
