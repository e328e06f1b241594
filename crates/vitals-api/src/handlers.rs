//! Route handlers over the storage engine.
//!
//! Bodies are parsed by hand from raw bytes so every rejection goes
//! out as the same JSON error envelope, `{"error": "..."}`.

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use serde::Deserialize;
use serde_json::json;
use std::io::Read;
use tracing::{debug, error};

use vitals_core::{Metric, MetricKind, MetricValue, crypto};

use crate::ApiState;

/// gzip stream magic bytes.
const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Uniform JSON error envelope.
pub(crate) fn error_response(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({ "error": message }))).into_response()
}

fn storage_failure(err: vitals_storage::StorageError) -> Response {
    error!(%err, "storage operation failed");
    error_response(StatusCode::INTERNAL_SERVER_ERROR, "storage failure")
}

/// Recover the JSON plaintext of a `/updates` body: decrypt when a
/// private key is configured, then inflate if the result is gzip.
/// Signed bodies arrive already inflated by the decompress layer.
fn open_batch(state: &ApiState, body: &[u8]) -> Result<Vec<u8>, Response> {
    let mut plain = match &state.private_key {
        Some(key) => crypto::decrypt(key, body).map_err(|err| {
            debug!(%err, "failed to decrypt batch");
            error_response(StatusCode::BAD_REQUEST, "undecryptable body")
        })?,
        None => body.to_vec(),
    };
    if plain.starts_with(&GZIP_MAGIC) {
        let mut decoded = Vec::new();
        flate2::read::GzDecoder::new(&plain[..])
            .read_to_end(&mut decoded)
            .map_err(|err| {
                error_response(StatusCode::BAD_REQUEST, &format!("invalid gzip body: {err}"))
            })?;
        plain = decoded;
    }
    Ok(plain)
}

/// POST `/updates` — ingest a batch of metrics.
pub async fn store_batch(State(state): State<ApiState>, body: Bytes) -> Response {
    let plain = match open_batch(&state, &body) {
        Ok(plain) => plain,
        Err(resp) => return resp,
    };
    let metrics: Vec<Metric> = match serde_json::from_slice(&plain) {
        Ok(metrics) => metrics,
        Err(err) => {
            return error_response(StatusCode::BAD_REQUEST, &format!("invalid batch: {err}"));
        }
    };
    debug!(count = metrics.len(), "ingesting batch");
    match state.store.store_batch(&metrics).await {
        Ok(()) => (StatusCode::OK, Json(metrics)).into_response(),
        Err(err) => storage_failure(err),
    }
}

/// POST `/update` — ingest a single metric.
pub async fn store_metric(State(state): State<ApiState>, body: Bytes) -> Response {
    let metric: Metric = match serde_json::from_slice(&body) {
        Ok(metric) => metric,
        Err(err) => {
            return error_response(StatusCode::BAD_REQUEST, &format!("invalid metric: {err}"));
        }
    };
    let identity = (metric.kind(), metric.id.clone());
    if let Err(err) = state.store.store(metric).await {
        return storage_failure(err);
    }
    // Echo the stored state, with counters accumulated.
    match state.store.load(identity.0, &identity.1).await {
        Ok(stored) => (StatusCode::OK, Json(stored)).into_response(),
        Err(err) => storage_failure(err),
    }
}

/// POST `/update/{kind}/{name}/{value}` — path-parameter ingest.
pub async fn store_metric_path(
    State(state): State<ApiState>,
    Path((kind, name, value)): Path<(String, String, String)>,
) -> Response {
    let kind = match MetricKind::parse(&kind) {
        Ok(kind) => kind,
        Err(err) => return error_response(StatusCode::BAD_REQUEST, &err.to_string()),
    };
    let metric = match kind {
        MetricKind::Gauge => match value.parse::<f64>() {
            Ok(v) => Metric::gauge(name, v),
            Err(_) => {
                return error_response(StatusCode::BAD_REQUEST, "invalid gauge value");
            }
        },
        MetricKind::Counter => match value.parse::<i64>() {
            Ok(d) => Metric::counter(name, d),
            Err(_) => {
                return error_response(StatusCode::BAD_REQUEST, "invalid counter delta");
            }
        },
    };
    match state.store.store(metric).await {
        Ok(()) => StatusCode::OK.into_response(),
        Err(err) => storage_failure(err),
    }
}

#[derive(Debug, Deserialize)]
struct MetricQuery {
    id: String,
    #[serde(rename = "type")]
    kind: String,
}

/// POST `/value` — query one metric as JSON.
pub async fn query_metric(State(state): State<ApiState>, body: Bytes) -> Response {
    let query: MetricQuery = match serde_json::from_slice(&body) {
        Ok(query) => query,
        Err(err) => {
            return error_response(StatusCode::BAD_REQUEST, &format!("invalid query: {err}"));
        }
    };
    let kind = match MetricKind::parse(&query.kind) {
        Ok(kind) => kind,
        Err(err) => return error_response(StatusCode::BAD_REQUEST, &err.to_string()),
    };
    match state.store.load(kind, &query.id).await {
        Ok(metric) => Json(metric).into_response(),
        Err(err) if err.is_not_found() => {
            error_response(StatusCode::NOT_FOUND, "metric not found")
        }
        Err(err) => storage_failure(err),
    }
}

/// GET `/value/{kind}/{name}` — current value as plain text.
pub async fn get_metric_path(
    State(state): State<ApiState>,
    Path((kind, name)): Path<(String, String)>,
) -> Response {
    let kind = match MetricKind::parse(&kind) {
        Ok(kind) => kind,
        Err(err) => return error_response(StatusCode::BAD_REQUEST, &err.to_string()),
    };
    match state.store.load(kind, &name).await {
        Ok(metric) => match metric.value {
            MetricValue::Gauge(v) => v.to_string().into_response(),
            MetricValue::Counter(d) => d.to_string().into_response(),
        },
        Err(err) if err.is_not_found() => {
            error_response(StatusCode::NOT_FOUND, "metric not found")
        }
        Err(err) => storage_failure(err),
    }
}

/// GET `/ping` — storage liveness.
pub async fn ping(State(state): State<ApiState>) -> Response {
    match state.store.ping().await {
        Ok(()) => StatusCode::OK.into_response(),
        Err(err) => storage_failure(err),
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::sync::Arc;
    use std::time::Duration;

    use axum::body::Body;
    use axum::http::{Request, StatusCode, header};
    use flate2::Compression;
    use flate2::write::GzEncoder;
    use tower::ServiceExt;

    use vitals_core::crypto;
    use vitals_storage::{MemoryStore, Storage};

    use crate::middleware::{REAL_IP_HEADER, SIGNATURE_HEADER};
    use crate::{ApiState, build_router};

    fn test_state() -> (ApiState, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = MemoryStore::new(dir.path().join("snapshot.json"), Duration::from_secs(300));
        (ApiState::new(Arc::new(store)), dir)
    }

    fn gzip(data: &[u8]) -> Vec<u8> {
        let mut enc = GzEncoder::new(Vec::new(), Compression::default());
        enc.write_all(data).unwrap();
        enc.finish().unwrap()
    }

    async fn body_string(resp: axum::response::Response) -> String {
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn batch_roundtrip_through_router() {
        let (state, _dir) = test_state();
        let router = build_router(state.clone());

        let batch = r#"[{"id":"Alloc","type":"gauge","value":1.5},
                        {"id":"PollCount","type":"counter","delta":3}]"#;
        let resp = router
            .oneshot(
                Request::post("/updates")
                    .header(header::CONTENT_ENCODING, "gzip")
                    .body(Body::from(gzip(batch.as_bytes())))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let stored = state.store.load_all().await.unwrap();
        assert_eq!(
            stored["gauge"]["Alloc"].gauge_value(),
            Some(1.5)
        );
        assert_eq!(stored["counter"]["PollCount"].counter_delta(), Some(3));
    }

    #[tokio::test]
    async fn counter_accumulates_across_single_updates() {
        let (state, _dir) = test_state();
        let router = build_router(state.clone());

        for delta in [5, 7] {
            let body = format!(r#"{{"id":"hits","type":"counter","delta":{delta}}}"#);
            let resp = router
                .clone()
                .oneshot(Request::post("/update").body(Body::from(body)).unwrap())
                .await
                .unwrap();
            assert_eq!(resp.status(), StatusCode::OK);
        }

        let resp = build_router(state)
            .oneshot(
                Request::get("/value/counter/hits")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_string(resp).await, "12");
    }

    #[tokio::test]
    async fn path_update_and_query() {
        let (state, _dir) = test_state();
        let router = build_router(state);

        let resp = router
            .clone()
            .oneshot(
                Request::post("/update/gauge/Temp/36.6")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let resp = router
            .clone()
            .oneshot(
                Request::post("/value")
                    .body(Body::from(r#"{"id":"Temp","type":"gauge"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_string(resp).await;
        assert!(body.contains(r#""value":36.6"#), "body: {body}");

        let resp = router
            .oneshot(
                Request::post("/update/histogram/x/1")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn unknown_metric_is_404() {
        let (state, _dir) = test_state();
        let resp = build_router(state)
            .oneshot(
                Request::get("/value/gauge/Nope")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        assert!(body_string(resp).await.contains("error"));
    }

    #[tokio::test]
    async fn signature_accept_and_tamper_reject() {
        let (mut state, _dir) = test_state();
        state.hmac_key = Some(b"shared-secret".to_vec());
        let router = build_router(state.clone());

        let payload = gzip(br#"[{"id":"Alloc","type":"gauge","value":1.0}]"#);
        let signature = crypto::sign(b"shared-secret", &payload);

        let resp = router
            .clone()
            .oneshot(
                Request::post("/updates")
                    .header(header::CONTENT_ENCODING, "gzip")
                    .header(SIGNATURE_HEADER, &signature)
                    .body(Body::from(payload.clone()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        // Flip one byte of the body; the original signature must fail.
        let mut tampered = payload;
        tampered[0] ^= 0xff;
        let resp = router
            .oneshot(
                Request::post("/updates")
                    .header(header::CONTENT_ENCODING, "gzip")
                    .header(SIGNATURE_HEADER, &signature)
                    .body(Body::from(tampered))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn unsigned_request_passes_when_key_set() {
        let (mut state, _dir) = test_state();
        state.hmac_key = Some(b"shared-secret".to_vec());
        let resp = build_router(state)
            .oneshot(
                Request::post("/update")
                    .body(Body::from(r#"{"id":"g","type":"gauge","value":2.0}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn encrypted_batch_roundtrip() {
        let mut rng = rand::thread_rng();
        let private = rsa::RsaPrivateKey::new(&mut rng, 2048).unwrap();
        let public = private.to_public_key();

        let (mut state, _dir) = test_state();
        state.private_key = Some(private);
        let router = build_router(state.clone());

        let payload = gzip(br#"[{"id":"PollCount","type":"counter","delta":9}]"#);
        let ciphertext = crypto::encrypt(&public, &payload).unwrap();

        let resp = router
            .oneshot(
                Request::post("/updates")
                    .body(Body::from(ciphertext))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(
            state.store.load_all().await.unwrap()["counter"]["PollCount"].counter_delta(),
            Some(9)
        );
    }

    #[tokio::test]
    async fn encrypted_batch_without_key_is_rejected() {
        let mut rng = rand::thread_rng();
        let private = rsa::RsaPrivateKey::new(&mut rng, 2048).unwrap();
        let public = private.to_public_key();

        // Server configured without a private key.
        let (state, _dir) = test_state();
        let router = build_router(state.clone());

        let payload = gzip(br#"[{"id":"PollCount","type":"counter","delta":9}]"#);
        let ciphertext = crypto::encrypt(&public, &payload).unwrap();

        let resp = router
            .oneshot(
                Request::post("/updates")
                    .body(Body::from(ciphertext))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert!(state.store.load_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn bad_gzip_body_is_rejected() {
        let (state, _dir) = test_state();
        let resp = build_router(state)
            .oneshot(
                Request::post("/updates")
                    .header(header::CONTENT_ENCODING, "gzip")
                    .body(Body::from(&b"not gzip at all"[..]))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn trusted_subnet_filtering() {
        let (mut state, _dir) = test_state();
        state.trusted_subnet = Some("10.0.0.0/8".parse().unwrap());
        let router = build_router(state);

        let ping = |ip: Option<&'static str>| {
            let mut req = Request::get("/ping");
            if let Some(ip) = ip {
                req = req.header(REAL_IP_HEADER, ip);
            }
            req.body(Body::empty()).unwrap()
        };

        let resp = router.clone().oneshot(ping(Some("10.1.2.3"))).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let resp = router.clone().oneshot(ping(Some("192.0.2.1"))).await.unwrap();
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);

        let resp = router.oneshot(ping(None)).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }
}
