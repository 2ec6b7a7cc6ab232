// Copyright 2026 The Metasync Authors
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

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post, put};
use axum::{Json, Router};
use metasync_common::node::NodeDescriptor;
use metasync_meta::ClusterMapStore;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::error::{Result, ServiceError};
use crate::receive::ReceiveHandler;

#[derive(Clone)]
pub struct AppState {
    pub receive_handler: Arc<ReceiveHandler>,
    pub cms_store: Arc<ClusterMapStore>,
}

/// Builds the route table described by the wire contract:
/// `/v1/metasync` (PUT for sync, POST for notify), `/v1/cluster` and
/// `/v1/cluster/proxy` for the registration handshake, and `/v1/health`.
/// Every request is traced via `TraceLayer` so a span covers each call.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/v1/metasync", put(metasync).post(metasync))
        .route("/v1/cluster", post(register))
        .route("/v1/cluster/proxy", post(register))
        .route("/v1/health", get(health))
        .with_state(state)
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
}

async fn metasync(State(state): State<AppState>, Json(payload): Json<HashMap<String, String>>) -> StatusCode {
    let outcomes = state.receive_handler.handle(&payload).await;
    if outcomes.iter().all(|o| o.is_accepted()) {
        StatusCode::OK
    } else {
        StatusCode::CONFLICT
    }
}

async fn register(State(state): State<AppState>, Json(descriptor): Json<NodeDescriptor>) -> Result<StatusCode> {
    info!(peer = %descriptor.id, "registering new node");
    let mut guard = state.cms_store.begin_update().await;
    guard.draft_mut().upsert(descriptor);
    guard.commit().await.map_err(ServiceError::from)?;
    Ok(StatusCode::OK)
}

async fn health() -> StatusCode {
    StatusCode::OK
}
