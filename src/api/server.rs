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

use axum::http::{HeaderValue, Method};
use axum::{routing::get, Router};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::api::handlers::{
    gpu_metrics, gpu_procs, healthz, list_gpus, readyz, ws_handler, SharedState,
};
use crate::error::Result;

/// Build the HTTP surface over `state`.
pub fn router(state: SharedState) -> Router {
    let cors = cors_layer(&state.config.allowed_origins);
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/api/gpus", get(list_gpus))
        .route("/api/gpus/{id}/metrics", get(gpu_metrics))
        .route("/api/gpus/{id}/procs", get(gpu_procs))
        .route("/ws", get(ws_handler))
        .with_state(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    let allow_origin = if origins.iter().any(|origin| origin == "*") {
        AllowOrigin::from(Any)
    } else {
        AllowOrigin::list(
            origins
                .iter()
                .filter_map(|origin| HeaderValue::from_str(origin).ok()),
        )
    };
    CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods([Method::GET])
        .allow_headers(Any)
}

/// Bind the configured address and serve until `cancel` fires.
pub async fn serve(state: SharedState, cancel: CancellationToken) -> Result<()> {
    let listener = TcpListener::bind(state.config.bind_addr()).await?;
    serve_on(listener, state, cancel).await
}

/// Serve on an already bound listener until `cancel` fires.
pub async fn serve_on(
    listener: TcpListener,
    state: SharedState,
    cancel: CancellationToken,
) -> Result<()> {
    tracing::info!(addr = %listener.local_addr()?, "HTTP server listening");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await?;
    tracing::info!("HTTP server stopped");
    Ok(())
}
