//! vitals-api — HTTP ingress for the collector.
//!
//! Provides axum route handlers over the storage engine plus the
//! ingress middleware stack (outermost first): trusted-subnet check,
//! integrity verification, request decompression.
//!
//! # Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | POST | `/updates` | Batch ingest (gzip JSON array, signed or encrypted) |
//! | POST | `/update` | Single metric ingest (JSON) |
//! | POST | `/update/{kind}/{name}/{value}` | Path-parameter ingest |
//! | POST | `/value` | Metric query (JSON `{id, type}`) |
//! | GET | `/value/{kind}/{name}` | Plain-text current value |
//! | GET | `/ping` | Storage liveness |
//!
//! The batch ingest surface is mirrored as a gRPC unary call in
//! [`rpc`], with the subnet and signature checks as interceptors.

pub mod handlers;
pub mod middleware;
pub mod rpc;

use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};
use rsa::RsaPrivateKey;

use vitals_storage::Storage;

pub use middleware::Subnet;

/// Shared state for handlers and middleware.
#[derive(Clone)]
pub struct ApiState {
    pub store: Arc<dyn Storage>,
    /// Shared HMAC key; signature checks only run when it is set.
    pub hmac_key: Option<Vec<u8>>,
    /// Private key for encrypted batches on `/updates`.
    pub private_key: Option<RsaPrivateKey>,
    /// CIDR allow-list for inbound requests.
    pub trusted_subnet: Option<Subnet>,
}

impl ApiState {
    pub fn new(store: Arc<dyn Storage>) -> Self {
        Self {
            store,
            hmac_key: None,
            private_key: None,
            trusted_subnet: None,
        }
    }
}

/// Build the collector router with the full middleware stack.
pub fn build_router(state: ApiState) -> Router {
    Router::new()
        .route("/updates", post(handlers::store_batch))
        .route("/update", post(handlers::store_metric))
        .route("/update/{kind}/{name}/{value}", post(handlers::store_metric_path))
        .route("/value", post(handlers::query_metric))
        .route("/value/{kind}/{name}", get(handlers::get_metric_path))
        .route("/ping", get(handlers::ping))
        // Layers run top-down for a request, so list the innermost first.
        .layer(axum::middleware::from_fn(middleware::decompress))
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            middleware::verify_signature,
        ))
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            middleware::check_subnet,
        ))
        .with_state(state)
}
