//! vitals-core — shared types for the vitals telemetry pipeline.
//!
//! Holds the metric data model with its wire format (shared by the
//! agent and the collector server) and the transport-level crypto
//! primitives: HMAC-SHA256 signatures and RSA-OAEP payload encryption.

pub mod crypto;
pub mod model;

pub use crypto::CryptoError;
pub use model::{Metric, MetricKind, MetricValue, ModelError};
