// Copyright (c) 2026 Myco
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//     http://www.apache.org/licenses/LICENSE-2.0
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

//! Admin HTTP surface (spec.md §4.12 / §6): a small axum service, local to
//! the node, for deploys, peer management, and status/metrics scraping. It
//! never touches [`crate::node::state::NodeState`] directly — every route
//! goes through a [`crate::node::NodeHandle`] and waits for the tick loop's
//! reply, so the admin server and the tick loop never share mutable state.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::core::clock::HlcTimestamp;
use crate::core::types::{ExecName, FlakeUri, NodeId, ServiceName, ServiceRecord};
use crate::monitoring::metrics::Metrics;
use crate::networking::peer_book::PeerBookEntry;
use crate::node::{NodeHandle, StatusSnapshot};

/// Admin surface errors, mapped to HTTP status codes at the edge.
#[derive(Debug, Error)]
pub enum AdminError {
    /// A request field violated a bounded-string capacity or was malformed.
    #[error("bad request: {0}")]
    BadRequest(String),
    /// The node's tick loop is not accepting commands (shutting down).
    #[error("node unavailable: {0}")]
    Unavailable(String),
}

impl IntoResponse for AdminError {
    fn into_response(self) -> Response {
        let status = match &self {
            AdminError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AdminError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        };
        (status, self.to_string()).into_response()
    }
}

#[derive(Clone)]
struct AdminState {
    node: NodeHandle,
    metrics: Arc<Metrics>,
}

/// Body of `POST /deploy`.
#[derive(Debug, Deserialize)]
pub struct DeployRequest {
    /// Catalog key.
    pub name: String,
    /// Writer-maintained version; the caller owns version bumps.
    pub version: u64,
    /// Artifact descriptor.
    pub flake_uri: String,
    /// Executor token.
    pub exec_name: String,
    /// Tombstone this service instead of deploying it.
    #[serde(default)]
    pub tombstone: bool,
}

/// Body of `POST /peers`.
#[derive(Debug, Deserialize)]
pub struct PeerAddRequest {
    /// Human-readable alias.
    pub alias: String,
    /// Network address ("host:port").
    pub address: String,
    /// Hex-encoded Ed25519 public key.
    pub pubkey_hex: String,
}

/// Body of a successful write response.
#[derive(Debug, Serialize)]
pub struct Ack {
    /// Always `true` on success (errors short-circuit to [`AdminError`]).
    pub ok: bool,
}

async fn get_status(State(state): State<AdminState>) -> Result<Json<StatusSnapshot>, AdminError> {
    let snapshot = state.node.status().await.map_err(AdminError::Unavailable)?;
    Ok(Json(snapshot))
}

async fn get_metrics(State(state): State<AdminState>) -> Result<String, AdminError> {
    use prometheus::{Encoder, TextEncoder};
    let encoder = TextEncoder::new();
    let families = state.metrics.registry.gather();
    let mut buf = Vec::new();
    encoder
        .encode(&families, &mut buf)
        .map_err(|e| AdminError::Unavailable(e.to_string()))?;
    String::from_utf8(buf).map_err(|e| AdminError::Unavailable(e.to_string()))
}

async fn post_deploy(State(state): State<AdminState>, Json(req): Json<DeployRequest>) -> Result<Json<Ack>, AdminError> {
    let name = ServiceName::new(&req.name).map_err(|e| AdminError::BadRequest(e.to_string()))?;
    let flake_uri = FlakeUri::new(&req.flake_uri).map_err(|e| AdminError::BadRequest(e.to_string()))?;
    let exec_name = ExecName::new(&req.exec_name).map_err(|e| AdminError::BadRequest(e.to_string()))?;

    // Placeholder hlc: the tick loop's Command::Deploy handler stamps the
    // real timestamp before merging, so this value is never observed.
    let record = ServiceRecord {
        name,
        version: req.version,
        hlc: HlcTimestamp::zero(NodeId::from_bytes([0; 32])),
        flake_uri,
        exec_name,
        tombstone: req.tombstone,
    };

    state.node.deploy(record).await.map_err(AdminError::Unavailable)?;
    info!(name = %req.name, version = req.version, "deploy accepted");
    Ok(Json(Ack { ok: true }))
}

async fn post_peer(State(state): State<AdminState>, Json(req): Json<PeerAddRequest>) -> Result<Json<Ack>, AdminError> {
    if hex::decode(&req.pubkey_hex).map(|b| b.len()) != Ok(32) {
        return Err(AdminError::BadRequest("pubkey_hex must decode to 32 bytes".to_string()));
    }
    let entry = PeerBookEntry::new(&req.alias, &req.address, &req.pubkey_hex)
        .map_err(|_| AdminError::BadRequest("alias/address exceed the 64-byte peer book buffer".to_string()))?;
    state.node.peer_add(entry).await.map_err(AdminError::Unavailable)?;
    Ok(Json(Ack { ok: true }))
}

async fn delete_peer(State(state): State<AdminState>, Path(alias): Path<String>) -> Result<Json<Ack>, AdminError> {
    let removed = state.node.peer_remove(alias).await.map_err(AdminError::Unavailable)?;
    Ok(Json(Ack { ok: removed }))
}

/// Build the admin router.
pub fn router(node: NodeHandle, metrics: Arc<Metrics>) -> Router {
    let state = AdminState { node, metrics };
    Router::new()
        .route("/status", get(get_status))
        .route("/metrics", get(get_metrics))
        .route("/deploy", post(post_deploy))
        .route("/peers", post(post_peer))
        .route("/peers/:alias", axum::routing::delete(delete_peer))
        .with_state(state)
}

/// Bind and serve the admin surface at `addr` until the process is told to
/// stop. Returns only on a bind failure or when the server future completes.
pub async fn serve(addr: SocketAddr, node: NodeHandle, metrics: Arc<Metrics>) -> std::io::Result<()> {
    let app = router(node, metrics);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "admin surface listening");
    axum::serve(listener, app).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::bootstrap;
    use crate::node::config::Settings;

    async fn test_state() -> AdminState {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = Settings::from_env().unwrap();
        settings.state_dir = dir.path().to_path_buf();
        settings.psk = b"test-psk".to_vec();
        settings.port = 0;
        let (node, handle) = bootstrap(settings).unwrap();
        let metrics = node.metrics();
        // Keep the temp dir alive for the test process; it is cleaned up
        // when the process exits.
        std::mem::forget(dir);
        tokio::task::spawn_blocking(move || {
            let _ = node.run();
        });
        AdminState { node: handle, metrics }
    }

    #[tokio::test]
    async fn status_route_reports_empty_catalog() {
        let state = test_state().await;
        let Json(snapshot) = get_status(State(state)).await.unwrap();
        assert_eq!(snapshot.catalog_size, 0);
    }

    #[tokio::test]
    async fn deploy_then_status_reflects_one_service() {
        let state = test_state().await;
        let req = DeployRequest {
            name: "redis".to_string(),
            version: 1,
            flake_uri: "github:nixos/nixpkgs#redis".to_string(),
            exec_name: "redis".to_string(),
            tombstone: false,
        };
        post_deploy(State(state.clone()), Json(req)).await.unwrap();

        // Give the tick loop a moment to drain the command queue.
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;

        let Json(snapshot) = get_status(State(state)).await.unwrap();
        assert_eq!(snapshot.catalog_size, 1);
    }

    #[tokio::test]
    async fn deploy_rejects_oversized_name() {
        let state = test_state().await;
        let req = DeployRequest {
            name: "x".repeat(500),
            version: 1,
            flake_uri: "github:nixos/nixpkgs#redis".to_string(),
            exec_name: "redis".to_string(),
            tombstone: false,
        };
        let err = post_deploy(State(state), Json(req)).await.unwrap_err();
        assert!(matches!(err, AdminError::BadRequest(_)));
    }
}
