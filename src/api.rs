// Copyright (C) 2025 Matías Salinas (support@fenden.com)
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use axum::{
    Json, Router,
    extract::{Path, State},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::get,
};
use bytes::Bytes;
use std::sync::Arc;
use tracing::error;

use crate::aggregate::AggregateError;
use crate::registry::MirrorRegistry;

/// Shared handler state: the registry is the only dependency the HTTP
/// surface needs.
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<MirrorRegistry>,
}

/// Builds the gateway router. Routing and encoding only; every decision
/// lives behind the registry.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/_health", get(healthcheck))
        .route("/d/:beatmapset_id", get(download_archive))
        .route("/media/background/:beatmap_id", get(background_image))
        .route("/api/v1/b/:beatmap_id", get(beatmap_metadata))
        .route("/api/v1/s/:beatmapset_id", get(beatmapset_metadata))
        .with_state(state)
}

async fn healthcheck() -> StatusCode {
    StatusCode::OK
}

async fn download_archive(
    State(state): State<AppState>,
    Path(beatmapset_id): Path<u32>,
) -> Response {
    match state.registry.fetch_archive(beatmapset_id).await {
        Ok(Some(data)) => archive_response(beatmapset_id, data),
        Ok(None) => StatusCode::NOT_FOUND.into_response(),
        Err(e) => internal_error(e),
    }
}

async fn background_image(
    State(state): State<AppState>,
    Path(beatmap_id): Path<u32>,
) -> Response {
    match state.registry.fetch_background_image(beatmap_id).await {
        Ok(Some(data)) => (
            [(header::CONTENT_TYPE, "application/octet-stream")],
            data,
        )
            .into_response(),
        Ok(None) => StatusCode::NOT_FOUND.into_response(),
        Err(e) => internal_error(e),
    }
}

async fn beatmap_metadata(
    State(state): State<AppState>,
    Path(beatmap_id): Path<u32>,
) -> Response {
    match state.registry.fetch_metadata_beatmap(beatmap_id).await {
        Ok(Some(value)) => Json(value).into_response(),
        Ok(None) => StatusCode::NOT_FOUND.into_response(),
        Err(e) => internal_error(e),
    }
}

async fn beatmapset_metadata(
    State(state): State<AppState>,
    Path(beatmapset_id): Path<u32>,
) -> Response {
    match state.registry.fetch_metadata_beatmapset(beatmapset_id).await {
        Ok(Some(value)) => Json(value).into_response(),
        Ok(None) => StatusCode::NOT_FOUND.into_response(),
        Err(e) => internal_error(e),
    }
}

fn archive_response(beatmapset_id: u32, data: Bytes) -> Response {
    (
        [
            (header::CONTENT_TYPE, "application/octet-stream".to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{beatmapset_id}.osz\""),
            ),
        ],
        data,
    )
        .into_response()
}

fn internal_error(e: AggregateError) -> Response {
    error!("❌ Fatal aggregation error: {e}");
    StatusCode::INTERNAL_SERVER_ERROR.into_response()
}
