//! HTTP surface: routes, shared state and the mapping from pipeline errors to responses.

use crate::events::{append_button_down, ButtonEventRequest};
use crate::images::load_image;
use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, Multipart, Query, State},
    http::{header, Method, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use convoscope_core::{
    parse_custom_data_csv, poll, CustomDataStore, IngestRequest, IngestionGateway, PipelineError,
    PollRequest, PollResponse, ResultStore,
};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::path::PathBuf;
use std::sync::Arc;
use tower_http::cors::{AllowHeaders, AllowOrigin, CorsLayer};

#[derive(Clone)]
pub struct AppState {
    pub ingest: Arc<IngestionGateway>,
    pub results: Arc<dyn ResultStore>,
    pub custom_data: Arc<dyn CustomDataStore>,
    pub image_dir: PathBuf,
    pub fallback_image: PathBuf,
    pub event_log_dir: PathBuf,
}

type ApiResult<T> = Result<T, (StatusCode, String)>;

/// Validation problems are the caller's fault (400, message as body); everything else is ours.
fn reject(e: PipelineError) -> (StatusCode, String) {
    if e.is_validation() {
        tracing::debug!(error = %e, "request rejected");
        (StatusCode::BAD_REQUEST, e.to_string())
    } else {
        tracing::error!(error = %e, "request failed");
        (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
    }
}

/// Decode a JSON body regardless of the declared content type.
fn parse_json<T: DeserializeOwned>(body: &Bytes) -> ApiResult<T> {
    serde_json::from_slice(body)
        .map_err(|e| reject(PipelineError::Validation(format!("invalid JSON body: {}", e))))
}

fn bad_part(name: &str, e: impl std::fmt::Display) -> (StatusCode, String) {
    reject(PipelineError::Validation(format!("bad {} part: {}", name, e)))
}

pub fn build_app(state: AppState, max_upload_bytes: usize) -> Router {
    // Any origin; credentials require mirroring instead of a wildcard.
    let cors = CorsLayer::new()
        .allow_origin(AllowOrigin::mirror_request())
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(AllowHeaders::mirror_request())
        .allow_credentials(true);

    Router::new()
        .route("/health", get(health))
        .route("/chat", post(chat_handler))
        .route("/button_event", post(button_handler))
        .route("/ui_poll", post(ui_poll_handler))
        .route("/upload_userdata", post(upload_userdata_handler))
        .route("/image", get(image_handler))
        .with_state(state)
        .layer(DefaultBodyLimit::max(max_upload_bytes))
        .layer(cors)
}

async fn health() -> &'static str {
    "OK"
}

/// POST /chat: one transcript fragment. Debounced fragments still get a success response.
async fn chat_handler(
    State(state): State<AppState>,
    body: Bytes,
) -> ApiResult<Json<serde_json::Value>> {
    let req: IngestRequest = parse_json(&body)?;
    let outcome = state.ingest.ingest(req).map_err(reject)?;
    Ok(Json(serde_json::json!({
        "success": true,
        "accepted": outcome.accepted,
    })))
}

/// POST /button_event: log presses; releases are acknowledged only.
async fn button_handler(
    State(state): State<AppState>,
    body: Bytes,
) -> ApiResult<Json<serde_json::Value>> {
    let req: ButtonEventRequest = parse_json(&body)?;
    let event = req.validate().map_err(reject)?;
    tracing::info!(
        user_id = %event.user_id,
        button = %event.button_num,
        pressed = event.pressed,
        "button event"
    );
    let message = if event.pressed {
        append_button_down(&state.event_log_dir, &event).await.map_err(reject)?;
        "button down activity detected"
    } else {
        "button up activity detected"
    };
    Ok(Json(serde_json::json!({ "message": message })))
}

/// POST /ui_poll: results this device has not seen yet.
async fn ui_poll_handler(
    State(state): State<AppState>,
    body: Bytes,
) -> ApiResult<Json<PollResponse>> {
    let req: PollRequest = parse_json(&body)?;
    let resp = poll(state.results.as_ref(), &req).map_err(reject)?;
    Ok(Json(resp))
}

/// POST /upload_userdata: multipart with a `custom-file` CSV part and a `userId` part.
async fn upload_userdata_handler(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> ApiResult<Json<serde_json::Value>> {
    let mut user_id: Option<String> = None;
    let mut file: Option<(Option<String>, Bytes)> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| reject(PipelineError::Validation(format!("bad multipart body: {}", e))))?
    {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "userId" => {
                let text = field
                    .text()
                    .await
                    .map_err(|e| bad_part("userId", e))?;
                user_id = Some(text.trim().to_string()).filter(|u| !u.is_empty());
            }
            "custom-file" => {
                let content_type = field.content_type().map(str::to_string);
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|e| bad_part("custom-file", e))?;
                file = Some((content_type, bytes));
            }
            _ => {}
        }
    }

    let (user_id, (content_type, bytes)) = match (user_id, file) {
        (Some(user_id), Some(file)) => (user_id, file),
        _ => {
            return Err(reject(PipelineError::Validation(
                "Missing user file or user ID in the received data".to_string(),
            )))
        }
    };
    if !content_type.as_deref().is_some_and(|ct| ct.starts_with("text/csv")) {
        return Err(reject(PipelineError::Validation("Uploaded file is not a CSV".to_string())));
    }

    let entries = parse_custom_data_csv(&bytes).map_err(reject)?;
    state
        .custom_data
        .replace_custom_data(&user_id, &entries)
        .map_err(reject)?;
    tracing::info!(user_id = %user_id, entries = entries.len(), "custom data uploaded");

    Ok(Json(serde_json::json!({
        "accepted": true,
        "entries": entries.len(),
    })))
}

#[derive(Debug, Deserialize)]
struct ImageQuery {
    img: Option<String>,
}

/// GET /image?img=<name>: a missing image is answered with the fallback image.
async fn image_handler(
    State(state): State<AppState>,
    Query(query): Query<ImageQuery>,
) -> ApiResult<impl IntoResponse> {
    let bytes = load_image(&state.image_dir, &state.fallback_image, query.img.as_deref())
        .await
        .map_err(reject)?;
    Ok(([(header::CONTENT_TYPE, "image/jpeg")], bytes))
}
