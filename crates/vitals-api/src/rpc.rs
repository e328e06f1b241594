//! gRPC mirror of the batch ingest surface.
//!
//! One unary call, `vitals.Metrics/PostMetrics`, carrying a repeated
//! metric message. The ingress checks mirror the HTTP middleware:
//! the trusted-subnet allow-list runs as an interceptor over the
//! `x-real-ip` metadata, and the `hashsha256` metadata carries an
//! HMAC-SHA256 over the proto-encoded request message, verified in
//! constant time before anything is stored.
//!
//! The message and service glue are written out by hand in the shape
//! `tonic`'s generator produces, so the build needs no protoc.

use std::net::IpAddr;

use prost::Message;
use tonic::{Request, Response, Status};
use tracing::{debug, error};

use vitals_core::{Metric, MetricKind, crypto};

use crate::middleware::Subnet;
use crate::ApiState;

/// One metric on the RPC wire; mirrors the JSON wire object.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct MetricMessage {
    #[prost(string, tag = "1")]
    pub id: ::prost::alloc::string::String,
    #[prost(string, tag = "2")]
    pub kind: ::prost::alloc::string::String,
    #[prost(double, tag = "3")]
    pub value: f64,
    #[prost(sint64, tag = "4")]
    pub delta: i64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PostMetricsRequest {
    #[prost(message, repeated, tag = "1")]
    pub metrics: ::prost::alloc::vec::Vec<MetricMessage>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PostMetricsResponse {
    #[prost(string, tag = "1")]
    pub response: ::prost::alloc::string::String,
}

impl From<&Metric> for MetricMessage {
    fn from(metric: &Metric) -> Self {
        MetricMessage {
            id: metric.id.clone(),
            kind: metric.kind().as_str().to_string(),
            value: metric.gauge_value().unwrap_or_default(),
            delta: metric.counter_delta().unwrap_or_default(),
        }
    }
}

fn decode_metric(message: MetricMessage) -> Result<Metric, Status> {
    match MetricKind::parse(&message.kind) {
        Ok(MetricKind::Gauge) => Ok(Metric::gauge(message.id, message.value)),
        Ok(MetricKind::Counter) => Ok(Metric::counter(message.id, message.delta)),
        Err(err) => Err(Status::invalid_argument(err.to_string())),
    }
}

/// Unary service over the storage engine.
pub struct MetricsService {
    state: ApiState,
}

impl MetricsService {
    pub fn new(state: ApiState) -> Self {
        Self { state }
    }

    /// Verify the `hashsha256` metadata against the proto-encoded
    /// request message. Runs only when both the shared key and the
    /// metadata entry are present.
    fn verify_signature(&self, request: &Request<PostMetricsRequest>) -> Result<(), Status> {
        let Some(key) = self.state.hmac_key.as_deref() else {
            return Ok(());
        };
        let Some(value) = request.metadata().get("hashsha256") else {
            return Ok(());
        };
        let signature = value
            .to_str()
            .map_err(|_| Status::invalid_argument("malformed signature metadata"))?;
        let payload = request.get_ref().encode_to_vec();
        if !crypto::verify(key, &payload, signature) {
            debug!("rpc request signature mismatch");
            return Err(Status::invalid_argument("signature mismatch"));
        }
        Ok(())
    }
}

#[tonic::async_trait]
impl metrics_server::Metrics for MetricsService {
    async fn post_metrics(
        &self,
        request: Request<PostMetricsRequest>,
    ) -> Result<Response<PostMetricsResponse>, Status> {
        self.verify_signature(&request)?;

        let metrics = request
            .into_inner()
            .metrics
            .into_iter()
            .map(decode_metric)
            .collect::<Result<Vec<Metric>, Status>>()?;

        debug!(count = metrics.len(), "ingesting rpc batch");
        self.state.store.store_batch(&metrics).await.map_err(|err| {
            error!(%err, "storage operation failed");
            Status::internal("storage failure")
        })?;

        Ok(Response::new(PostMetricsResponse {
            response: "OK".to_string(),
        }))
    }
}

/// Interceptor mirroring the HTTP trusted-subnet check over the
/// `x-real-ip` metadata entry.
pub fn subnet_interceptor(
    subnet: Option<Subnet>,
) -> impl FnMut(Request<()>) -> Result<Request<()>, Status> + Clone {
    move |request: Request<()>| {
        let Some(subnet) = subnet else {
            return Ok(request);
        };
        let ip = request
            .metadata()
            .get("x-real-ip")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<IpAddr>().ok());
        match ip {
            None => Err(Status::invalid_argument(
                "missing or invalid x-real-ip metadata",
            )),
            Some(ip) if !subnet.contains(ip) => {
                Err(Status::permission_denied("address not in trusted subnet"))
            }
            Some(_) => Ok(request),
        }
    }
}

/// Server glue in the shape `tonic-build` generates.
pub mod metrics_server {
    use tonic::codegen::*;

    #[async_trait]
    pub trait Metrics: Send + Sync + 'static {
        async fn post_metrics(
            &self,
            request: tonic::Request<super::PostMetricsRequest>,
        ) -> std::result::Result<tonic::Response<super::PostMetricsResponse>, tonic::Status>;
    }

    #[derive(Debug)]
    pub struct MetricsServer<T> {
        inner: Arc<T>,
    }

    impl<T> MetricsServer<T> {
        pub fn new(inner: T) -> Self {
            Self {
                inner: Arc::new(inner),
            }
        }
    }

    impl<T, B> tonic::codegen::Service<http::Request<B>> for MetricsServer<T>
    where
        T: Metrics,
        B: Body + Send + 'static,
        B::Error: Into<StdError> + Send + 'static,
    {
        type Response = http::Response<tonic::body::BoxBody>;
        type Error = std::convert::Infallible;
        type Future = BoxFuture<Self::Response, Self::Error>;

        fn poll_ready(
            &mut self,
            _cx: &mut Context<'_>,
        ) -> Poll<std::result::Result<(), Self::Error>> {
            Poll::Ready(Ok(()))
        }

        fn call(&mut self, req: http::Request<B>) -> Self::Future {
            match req.uri().path() {
                "/vitals.Metrics/PostMetrics" => {
                    struct PostMetricsSvc<T: Metrics>(Arc<T>);
                    impl<T: Metrics> tonic::server::UnaryService<super::PostMetricsRequest>
                        for PostMetricsSvc<T>
                    {
                        type Response = super::PostMetricsResponse;
                        type Future = BoxFuture<tonic::Response<Self::Response>, tonic::Status>;
                        fn call(
                            &mut self,
                            request: tonic::Request<super::PostMetricsRequest>,
                        ) -> Self::Future {
                            let inner = Arc::clone(&self.0);
                            Box::pin(async move { inner.post_metrics(request).await })
                        }
                    }
                    let inner = self.inner.clone();
                    Box::pin(async move {
                        let method = PostMetricsSvc(inner);
                        let codec = tonic::codec::ProstCodec::default();
                        let mut grpc = tonic::server::Grpc::new(codec);
                        Ok(grpc.unary(method, req).await)
                    })
                }
                _ => Box::pin(async move {
                    Ok(http::Response::builder()
                        .status(200)
                        .header("grpc-status", "12")
                        .header("content-type", "application/grpc")
                        .body(empty_body())
                        .unwrap())
                }),
            }
        }
    }

    impl<T> Clone for MetricsServer<T> {
        fn clone(&self) -> Self {
            Self {
                inner: self.inner.clone(),
            }
        }
    }

    impl<T> tonic::server::NamedService for MetricsServer<T> {
        const NAME: &'static str = "vitals.Metrics";
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use metrics_server::Metrics;
    use std::sync::Arc;
    use std::time::Duration;

    use vitals_storage::{MemoryStore, Storage};

    fn test_state() -> (ApiState, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = MemoryStore::new(dir.path().join("snapshot.json"), Duration::from_secs(300));
        (ApiState::new(Arc::new(store)), dir)
    }

    fn sample_request() -> PostMetricsRequest {
        PostMetricsRequest {
            metrics: vec![
                MetricMessage {
                    id: "Memory".to_string(),
                    kind: "gauge".to_string(),
                    value: 1.5,
                    delta: 0,
                },
                MetricMessage {
                    id: "PollCount".to_string(),
                    kind: "counter".to_string(),
                    value: 0.0,
                    delta: 4,
                },
            ],
        }
    }

    #[tokio::test]
    async fn unary_call_stores_the_batch() {
        let (state, _dir) = test_state();
        let service = MetricsService::new(state.clone());

        let response = service
            .post_metrics(Request::new(sample_request()))
            .await
            .unwrap();
        assert_eq!(response.get_ref().response, "OK");

        let stored = state.store.load_all().await.unwrap();
        assert_eq!(stored["gauge"]["Memory"].gauge_value(), Some(1.5));
        assert_eq!(stored["counter"]["PollCount"].counter_delta(), Some(4));
    }

    #[tokio::test]
    async fn unknown_kind_rejects_the_whole_batch() {
        let (state, _dir) = test_state();
        let service = MetricsService::new(state.clone());

        let mut request = sample_request();
        request.metrics[1].kind = "histogram".to_string();

        let status = service
            .post_metrics(Request::new(request))
            .await
            .unwrap_err();
        assert_eq!(status.code(), tonic::Code::InvalidArgument);
        assert!(state.store.load_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn signature_metadata_accept_and_tamper_reject() {
        let (mut state, _dir) = test_state();
        state.hmac_key = Some(b"shared-secret".to_vec());
        let service = MetricsService::new(state);

        let message = sample_request();
        let signature = crypto::sign(b"shared-secret", &message.encode_to_vec());

        let mut request = Request::new(message.clone());
        request
            .metadata_mut()
            .insert("hashsha256", signature.parse().unwrap());
        assert!(service.post_metrics(request).await.is_ok());

        let mut tampered = message;
        tampered.metrics[0].value = 9000.0;
        let mut request = Request::new(tampered);
        request
            .metadata_mut()
            .insert("hashsha256", signature.parse().unwrap());
        let status = service.post_metrics(request).await.unwrap_err();
        assert_eq!(status.code(), tonic::Code::InvalidArgument);
    }

    #[tokio::test]
    async fn unsigned_call_passes_when_key_set() {
        let (mut state, _dir) = test_state();
        state.hmac_key = Some(b"shared-secret".to_vec());
        let service = MetricsService::new(state);

        assert!(
            service
                .post_metrics(Request::new(sample_request()))
                .await
                .is_ok()
        );
    }

    #[test]
    fn subnet_interceptor_mirrors_the_http_check() {
        let subnet: Subnet = "10.0.0.0/8".parse().unwrap();
        let mut intercept = subnet_interceptor(Some(subnet));

        let mut inside = Request::new(());
        inside
            .metadata_mut()
            .insert("x-real-ip", "10.1.2.3".parse().unwrap());
        assert!(intercept(inside).is_ok());

        let mut outside = Request::new(());
        outside
            .metadata_mut()
            .insert("x-real-ip", "192.0.2.1".parse().unwrap());
        assert_eq!(
            intercept(outside).unwrap_err().code(),
            tonic::Code::PermissionDenied
        );

        assert_eq!(
            intercept(Request::new(())).unwrap_err().code(),
            tonic::Code::InvalidArgument
        );

        let mut no_subnet = subnet_interceptor(None);
        assert!(no_subnet(Request::new(())).is_ok());
    }

    #[test]
    fn metric_message_round_trips_through_conversion() {
        let gauge = Metric::gauge("Temp", 36.6);
        let message = MetricMessage::from(&gauge);
        assert_eq!(decode_metric(message).unwrap(), gauge);

        let counter = Metric::counter("hits", 12);
        let message = MetricMessage::from(&counter);
        assert_eq!(decode_metric(message).unwrap(), counter);
    }
}
