use crate::context::{EventSummary, IngestContext};
use crate::layout::StorageLayout;
use crate::normalize::Event;
use crate::payload::{MultipartPart, RawPayload};
use crate::persist::EventKind;
use anyhow::{Context, Result};
use axum::body::to_bytes;
use axum::extract::{ConnectInfo, FromRequest, Multipart, Query, Request, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, instrument, warn};
use uuid::Uuid;

/// Shared handler state
pub type SharedContext = Arc<IngestContext>;

/// Upper bound on a buffered request body. Tollgate payloads embed several
/// base64 images, so this is generous.
const BODY_LIMIT: usize = 64 * 1024 * 1024;

/// Failures surfaced to the caller; everything else in the pipeline
/// degrades instead of erroring
#[derive(Debug, Error)]
pub enum RequestError {
    #[error("request body is not a JSON object")]
    NotJson,
    #[error("failed to read request body")]
    BodyRead,
}

impl IntoResponse for RequestError {
    fn into_response(self) -> Response {
        let body = Json(ErrorResponse {
            status: "error",
            message: self.to_string(),
        });
        (StatusCode::BAD_REQUEST, body).into_response()
    }
}

/// Error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub status: &'static str,
    pub message: String,
}

/// Response for a processed tollgate event
#[derive(Debug, Serialize)]
pub struct TollgateResponse {
    pub status: &'static str,
    pub request_id: Uuid,
    pub folder: String,
    pub saved_images: Vec<String>,
    pub plate: String,
    pub camera: String,
    pub count: u64,
}

/// Response for a generic webhook capture
#[derive(Debug, Serialize)]
pub struct WebhookResponse {
    pub status: &'static str,
    pub total_count: u64,
}

/// Create the gateway router
pub fn create_router(ctx: SharedContext) -> Router {
    let cors = if ctx.config.http.cors_enabled {
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any)
    } else {
        CorsLayer::new()
    };

    Router::new()
        .route("/NotificationInfo/TollgateInfo", post(tollgate_event))
        .route("/webhook", post(generic_webhook))
        .route("/webhook/events", get(recent_events))
        .route("/vehicle/count", get(vehicle_count))
        .route("/health", get(health_check))
        .fallback(unmatched)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(ctx)
}

/// Start the HTTP server
pub async fn start_server(ctx: SharedContext, host: &str, port: u16) -> Result<()> {
    let router = create_router(ctx);
    let addr = format!("{host}:{port}");

    info!(address = %addr, "Starting ANPR gateway HTTP server");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;

    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .context("HTTP server error")?;

    Ok(())
}

/// Structured tollgate notification from an ANPR camera
#[instrument(skip(ctx, req))]
async fn tollgate_event(
    State(ctx): State<SharedContext>,
    req: Request,
) -> Result<Json<TollgateResponse>, RequestError> {
    let source_ip = source_ip_of(&req);
    let payload = read_payload(req).await?;

    if !payload.is_json_object() {
        return Err(RequestError::NotJson);
    }

    let event = Event::from_payload(payload, source_ip.as_deref(), ctx.ip_map());
    let layout = StorageLayout::for_event(&event);
    let count = ctx.record_event(&event.source_camera);

    let outcome = ctx
        .gateway
        .persist_event(&event, &layout, EventKind::Tollgate)
        .await;

    ctx.event_log.append(
        &event.source_camera,
        &format!(
            "POST /NotificationInfo/TollgateInfo - VEHICLE #{count} - Plate: {}, Camera: {}, Saved: {} images",
            event.plate_number,
            event.source_camera,
            outcome.saved_images.len()
        ),
    );
    ctx.push_recent(EventSummary::new(&event, &outcome));
    metrics::counter!("gateway.events.tollgate").increment(1);

    Ok(Json(TollgateResponse {
        status: "success",
        request_id: event.event_id,
        folder: outcome.folder,
        saved_images: outcome.saved_images,
        plate: event.plate_number,
        camera: event.source_camera,
        count,
    }))
}

/// Generic webhook: accepts JSON, multipart, or raw bytes and never rejects
#[instrument(skip(ctx, req))]
async fn generic_webhook(State(ctx): State<SharedContext>, req: Request) -> Json<WebhookResponse> {
    let source_ip = source_ip_of(&req);
    let payload = match read_payload(req).await {
        Ok(payload) => payload,
        // An unreadable body still counts as an (empty) event
        Err(_) => RawPayload::Raw(Bytes::new()),
    };

    let event = Event::from_payload(payload, source_ip.as_deref(), ctx.ip_map());
    let layout = StorageLayout::for_event(&event);
    let count = ctx.record_event(&event.source_camera);

    let outcome = ctx
        .gateway
        .persist_event(&event, &layout, EventKind::Webhook)
        .await;

    ctx.event_log.append(
        &event.source_camera,
        &format!(
            "POST /webhook - VEHICLE #{count} - Plate: {}, Source: {}",
            event.plate_number, event.source_camera
        ),
    );
    ctx.push_recent(EventSummary::new(&event, &outcome));
    metrics::counter!("gateway.events.webhook").increment(1);

    Json(WebhookResponse {
        status: "ok",
        total_count: ctx.total_count(),
    })
}

/// Query parameters for the recent-events endpoint
#[derive(Debug, Deserialize)]
struct EventsQuery {
    #[serde(default = "default_events_limit")]
    limit: i64,
}

fn default_events_limit() -> i64 {
    20
}

/// Most recent normalized events; datastore-backed with an in-memory
/// ring-buffer fallback
#[instrument(skip(ctx))]
async fn recent_events(
    State(ctx): State<SharedContext>,
    Query(params): Query<EventsQuery>,
) -> Json<Value> {
    let limit = params.limit.clamp(1, 500);

    match ctx.datastore.get_webhook_events(limit).await {
        Ok(events) => Json(json!({ "source": "datastore", "events": events })),
        Err(e) => {
            warn!(error = %e, "Datastore query failed, serving in-memory ring buffer");
            metrics::counter!("gateway.datastore.errors").increment(1);
            Json(json!({
                "source": "memory",
                "events": ctx.recent_events(limit as usize),
            }))
        }
    }
}

/// Per-camera counters plus the active backend
async fn vehicle_count(State(ctx): State<SharedContext>) -> Json<Value> {
    Json(json!({
        "counts": ctx.counts(),
        "total": ctx.total_count(),
        "db": ctx.datastore.backend_name(),
    }))
}

/// Health check endpoint
async fn health_check(State(ctx): State<SharedContext>) -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "service": ctx.config.service.name,
        "counts": ctx.counts(),
        "total": ctx.total_count(),
    }))
}

/// Structured 404 that still logs method, path, and a bounded body snippet.
/// Cameras with misconfigured notification URLs post here constantly; the
/// log line is how operators find them.
async fn unmatched(State(ctx): State<SharedContext>, req: Request) -> (StatusCode, Json<Value>) {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let limit = ctx.config.storage.max_logged_body_bytes;

    let declared_length: usize = req
        .headers()
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);

    let snippet = if declared_length > limit {
        format!("<payload too large to log: {declared_length} bytes>")
    } else {
        match to_bytes(req.into_body(), limit).await {
            Ok(body) => String::from_utf8_lossy(&body).into_owned(),
            Err(_) => "<payload too large to log>".to_string(),
        }
    };

    ctx.event_log
        .append("server", &format!("404 {method} {path} | Body: {snippet}"));
    metrics::counter!("gateway.requests.unmatched").increment(1);
    warn!(%method, %path, "Unmatched request");

    (
        StatusCode::NOT_FOUND,
        Json(json!({ "error": "resource not found", "path": path })),
    )
}

/// Source IP of the request: `X-Forwarded-For` first, then the peer address
fn source_ip_of(req: &Request) -> Option<String> {
    if let Some(forwarded) = req
        .headers()
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
    {
        if let Some(first) = forwarded.split(',').next() {
            let first = first.trim();
            if !first.is_empty() {
                return Some(first.to_string());
            }
        }
    }

    req.extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0.ip().to_string())
}

/// Buffer and decode the request body into a `RawPayload`
async fn read_payload(req: Request) -> Result<RawPayload, RequestError> {
    let content_type = req
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();

    if content_type.starts_with("multipart/") {
        let mut multipart = Multipart::from_request(req, &())
            .await
            .map_err(|_| RequestError::BodyRead)?;

        let mut parts = Vec::new();
        loop {
            match multipart.next_field().await {
                Ok(Some(field)) => {
                    let name = field.name().unwrap_or("part").to_string();
                    let file_name = field.file_name().map(str::to_owned);
                    let data = field.bytes().await.map_err(|_| RequestError::BodyRead)?;
                    parts.push(MultipartPart {
                        field: name,
                        file_name,
                        data,
                    });
                }
                Ok(None) => break,
                Err(_) => return Err(RequestError::BodyRead),
            }
        }
        return Ok(RawPayload::Multipart(parts));
    }

    let body = to_bytes(req.into_body(), BODY_LIMIT)
        .await
        .map_err(|_| RequestError::BodyRead)?;
    Ok(RawPayload::from_bytes(&content_type, body))
}

/// Wait for shutdown signal (SIGINT or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        }
        _ = terminate => {
            info!("Received SIGTERM signal");
        }
    }
}
