// Copyright 2025 Lablup Inc. and Jeongkyu Shin
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

use std::sync::Arc;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures_util::StreamExt;
use serde_json::json;
use tokio::sync::OwnedSemaphorePermit;

use crate::api::session::run_session;
use crate::app_state::{AppState, ReadyStatus};

pub type SharedState = Arc<AppState>;

pub async fn healthz() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

pub async fn readyz(State(state): State<SharedState>) -> Response {
    let readiness = state.readiness();
    let code = if readiness.status == ReadyStatus::Ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(readiness)).into_response()
}

pub async fn list_gpus(State(state): State<SharedState>) -> Response {
    Json(state.registry.descriptors().to_vec()).into_response()
}

pub async fn gpu_metrics(
    State(state): State<SharedState>,
    Path(gpu_id): Path<String>,
) -> Response {
    if !state.registry.contains(&gpu_id) {
        return (StatusCode::NOT_FOUND, "unknown gpu").into_response();
    }
    match state.sampler.latest(&gpu_id) {
        Some(snapshot) => Json(snapshot).into_response(),
        None => (StatusCode::SERVICE_UNAVAILABLE, "no sample available").into_response(),
    }
}

pub async fn gpu_procs(State(state): State<SharedState>, Path(gpu_id): Path<String>) -> Response {
    if !state.registry.contains(&gpu_id) {
        return (StatusCode::NOT_FOUND, "unknown gpu").into_response();
    }
    if !state.procs.enabled() {
        return (StatusCode::SERVICE_UNAVAILABLE, "process scanner unavailable").into_response();
    }
    match state.procs.latest(&gpu_id) {
        Some(snapshot) => Json(snapshot).into_response(),
        None => (StatusCode::SERVICE_UNAVAILABLE, "no process data available").into_response(),
    }
}

/// Origin check and session admission, both decided before the handshake.
pub fn admit(
    state: &AppState,
    headers: &HeaderMap,
) -> Result<OwnedSemaphorePermit, (StatusCode, &'static str)> {
    let origin = headers
        .get(header::ORIGIN)
        .and_then(|value| value.to_str().ok());
    if !state.config.origin_allowed(origin) {
        tracing::warn!(origin = ?origin, "websocket rejected: origin not allowed");
        return Err((StatusCode::FORBIDDEN, "origin not allowed"));
    }
    state.sessions.clone().try_acquire_owned().map_err(|_| {
        tracing::warn!(
            max_clients = state.config.ws.max_clients,
            "websocket rejected: capacity"
        );
        (StatusCode::SERVICE_UNAVAILABLE, "websocket capacity reached")
    })
}

pub async fn ws_handler(
    State(state): State<SharedState>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let permit = match admit(&state, &headers) {
        Ok(permit) => permit,
        Err(rejection) => return rejection.into_response(),
    };

    let session_id = state.session_ids.next();
    let ctx = state.session_context();
    let shutdown = state.shutdown.clone();
    ws.on_failed_upgrade(move |e| {
        tracing::warn!(session_id, error = %e, "websocket upgrade failed");
    })
    .on_upgrade(move |socket| async move {
        let (sink, source) = socket.split();
        run_session(ctx, session_id, source, sink, shutdown).await;
        drop(permit);
    })
}
