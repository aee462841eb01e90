//! REST API handlers

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;

use crate::api::server::AppState;
use crate::error::{DeliveryError, Error};
use crate::pipeline::SpeakerSnapshot;
use crate::protocol::{LanguageCode, TranslatedCaption};
use crate::stats::StatsSnapshot;

/// API response wrapper
#[derive(serde::Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T> ApiResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(msg: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(msg.into()),
        }
    }
}

/// Aggregate pipeline counters.
pub async fn get_status(State(state): State<Arc<AppState>>) -> Json<ApiResponse<StatsSnapshot>> {
    Json(ApiResponse::ok(state.pipeline.stats_snapshot()))
}

/// Speaker roster with per-speaker framing counters.
pub async fn get_speakers(
    State(state): State<Arc<AppState>>,
) -> Json<ApiResponse<Vec<SpeakerSnapshot>>> {
    Json(ApiResponse::ok(state.pipeline.speakers()))
}

/// Distinct display languages currently subscribed.
pub async fn get_languages(State(state): State<Arc<AppState>>) -> Json<ApiResponse<Vec<String>>> {
    let languages = state
        .pipeline
        .active_languages()
        .into_iter()
        .map(|language| language.as_str().to_string())
        .collect();
    Json(ApiResponse::ok(languages))
}

/// Captions currently visible to one listener, for initial render or
/// reattachment after a pause.
pub async fn get_captions(
    State(state): State<Arc<AppState>>,
    Path(listener_id): Path<String>,
) -> (StatusCode, Json<ApiResponse<Vec<TranslatedCaption>>>) {
    match state.pipeline.listener_snapshot(&listener_id) {
        Ok(captions) => (StatusCode::OK, Json(ApiResponse::ok(captions))),
        Err(e) => (status_for(&e), Json(ApiResponse::error(e.to_string()))),
    }
}

#[derive(serde::Deserialize)]
pub struct LanguageRequest {
    pub language: LanguageCode,
}

/// Live display-language switch for one listener.
pub async fn set_language(
    State(state): State<Arc<AppState>>,
    Path(listener_id): Path<String>,
    Json(req): Json<LanguageRequest>,
) -> (StatusCode, Json<ApiResponse<()>>) {
    match state
        .pipeline
        .set_listener_language(&listener_id, req.language)
    {
        Ok(()) => (StatusCode::OK, Json(ApiResponse::ok(()))),
        Err(e) => (status_for(&e), Json(ApiResponse::error(e.to_string()))),
    }
}

fn status_for(error: &Error) -> StatusCode {
    match error {
        Error::Delivery(DeliveryError::UnknownListener(_)) => StatusCode::NOT_FOUND,
        Error::Delivery(DeliveryError::AlreadySubscribed(_)) => StatusCode::CONFLICT,
        _ => StatusCode::BAD_REQUEST,
    }
}
