//! Ingress middleware: trusted-subnet filtering, signature
//! verification, and gzip request decompression.

use std::io::Read;
use std::net::IpAddr;
use std::str::FromStr;

use axum::body::{Body, to_bytes};
use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::http::header::CONTENT_ENCODING;
use axum::middleware::Next;
use axum::response::Response;
use flate2::read::GzDecoder;
use tracing::debug;

use vitals_core::crypto;

use crate::ApiState;
use crate::handlers::error_response;

/// Header carrying the hex HMAC-SHA256 of the request body.
pub const SIGNATURE_HEADER: &str = "HashSHA256";
/// Header the fronting proxy sets to the originating client address.
pub const REAL_IP_HEADER: &str = "X-Real-IP";

/// Cap on buffered request bodies.
const BODY_LIMIT: usize = 16 * 1024 * 1024;

/// CIDR block used to restrict ingest to trusted agents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Subnet {
    network: IpAddr,
    prefix: u8,
}

#[derive(Debug, thiserror::Error)]
#[error("invalid CIDR notation: {0}")]
pub struct SubnetParseError(String);

impl Subnet {
    pub fn contains(&self, addr: IpAddr) -> bool {
        match (self.network, addr) {
            (IpAddr::V4(net), IpAddr::V4(ip)) => {
                let mask = mask_v4(self.prefix);
                u32::from(net) & mask == u32::from(ip) & mask
            }
            (IpAddr::V6(net), IpAddr::V6(ip)) => {
                let mask = mask_v6(self.prefix);
                u128::from(net) & mask == u128::from(ip) & mask
            }
            // Mixed address families never match.
            _ => false,
        }
    }
}

impl FromStr for Subnet {
    type Err = SubnetParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (addr, prefix) = s
            .split_once('/')
            .ok_or_else(|| SubnetParseError(s.to_string()))?;
        let network: IpAddr = addr.parse().map_err(|_| SubnetParseError(s.to_string()))?;
        let prefix: u8 = prefix.parse().map_err(|_| SubnetParseError(s.to_string()))?;
        let max = if network.is_ipv4() { 32 } else { 128 };
        if prefix > max {
            return Err(SubnetParseError(s.to_string()));
        }
        Ok(Self { network, prefix })
    }
}

fn mask_v4(prefix: u8) -> u32 {
    if prefix == 0 {
        0
    } else {
        u32::MAX << (32 - u32::from(prefix))
    }
}

fn mask_v6(prefix: u8) -> u128 {
    if prefix == 0 {
        0
    } else {
        u128::MAX << (128 - u32::from(prefix))
    }
}

/// Reject requests originating outside the trusted subnet.
///
/// Passes everything through when no subnet is configured. The client
/// address is read from `X-Real-IP`; a missing or unparseable header
/// is a 400, an address outside the subnet a 403.
pub async fn check_subnet(State(state): State<ApiState>, req: Request, next: Next) -> Response {
    let Some(subnet) = state.trusted_subnet else {
        return next.run(req).await;
    };
    let ip = req
        .headers()
        .get(REAL_IP_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<IpAddr>().ok());
    match ip {
        None => error_response(
            StatusCode::BAD_REQUEST,
            "missing or invalid X-Real-IP header",
        ),
        Some(ip) if !subnet.contains(ip) => {
            debug!(%ip, "request from outside trusted subnet");
            error_response(StatusCode::FORBIDDEN, "address not in trusted subnet")
        }
        Some(_) => next.run(req).await,
    }
}

/// Verify the `HashSHA256` header against the raw request body.
///
/// Runs only when both the shared key and the header are present;
/// otherwise the request passes through untouched. The body is
/// buffered and reinstalled so downstream extractors still see it.
pub async fn verify_signature(
    State(state): State<ApiState>,
    req: Request,
    next: Next,
) -> Response {
    let Some(key) = state.hmac_key.as_deref() else {
        return next.run(req).await;
    };
    let Some(header) = req.headers().get(SIGNATURE_HEADER) else {
        return next.run(req).await;
    };
    let signature = match header.to_str() {
        Ok(s) => s.to_owned(),
        Err(_) => return error_response(StatusCode::BAD_REQUEST, "malformed signature header"),
    };
    let (parts, body) = req.into_parts();
    let bytes = match to_bytes(body, BODY_LIMIT).await {
        Ok(bytes) => bytes,
        Err(err) => {
            return error_response(
                StatusCode::BAD_REQUEST,
                &format!("failed to read request body: {err}"),
            );
        }
    };
    if !crypto::verify(key, &bytes, &signature) {
        debug!("request signature mismatch");
        return error_response(StatusCode::BAD_REQUEST, "signature mismatch");
    }
    next.run(Request::from_parts(parts, Body::from(bytes))).await
}

/// Transparently inflate `Content-Encoding: gzip` request bodies.
///
/// A body that fails to inflate is a 400. The header is stripped so
/// handlers always see plain bytes.
pub async fn decompress(req: Request, next: Next) -> Response {
    let is_gzip = req
        .headers()
        .get(CONTENT_ENCODING)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("gzip"));
    if !is_gzip {
        return next.run(req).await;
    }
    let (mut parts, body) = req.into_parts();
    let bytes = match to_bytes(body, BODY_LIMIT).await {
        Ok(bytes) => bytes,
        Err(err) => {
            return error_response(
                StatusCode::BAD_REQUEST,
                &format!("failed to read request body: {err}"),
            );
        }
    };
    let mut decoded = Vec::new();
    if let Err(err) = GzDecoder::new(&bytes[..]).read_to_end(&mut decoded) {
        return error_response(StatusCode::BAD_REQUEST, &format!("invalid gzip body: {err}"));
    }
    parts.headers.remove(CONTENT_ENCODING);
    next.run(Request::from_parts(parts, Body::from(decoded)))
        .await
}
