//! Batch delivery over HTTP.
//!
//! `deliver` serializes the batch to a JSON array, gzip-compresses it,
//! then takes exactly one of two security paths: RSA-OAEP encryption
//! of the compressed bytes (when a public key is configured) or an
//! HMAC-SHA256 signature over them in the `HashSHA256` header. The
//! gzip footer is flushed before the buffer is ever read —
//! `GzEncoder::finish` consumes the encoder, so a truncated stream is
//! unrepresentable. On the encrypted path the ciphertext replaces the
//! compressed buffer, which is recycled through a small pool; on the
//! signed path the buffer itself becomes the request body.
//!
//! Delivery workers share the batch channel; each runs its own retry
//! loop and failure of one never takes down the process.

use std::io::Write;
use std::sync::{Arc, Mutex, PoisonError};

use flate2::Compression;
use flate2::write::GzEncoder;
use reqwest::header::{CONTENT_ENCODING, CONTENT_TYPE};
use rsa::RsaPublicKey;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

use vitals_core::{Metric, crypto};

use crate::error::AgentError;
use crate::retry::{RetryPolicy, retry};

/// Header carrying the hex HMAC-SHA256 of the compressed payload.
pub const SIGNATURE_HEADER: &str = "HashSHA256";

const POOL_LIMIT: usize = 8;

/// Recycles compression output buffers between deliveries.
struct BufferPool {
    buffers: Mutex<Vec<Vec<u8>>>,
}

impl BufferPool {
    fn new() -> Self {
        Self {
            buffers: Mutex::new(Vec::new()),
        }
    }

    fn get(&self) -> Vec<u8> {
        self.buffers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop()
            .unwrap_or_default()
    }

    fn put(&self, mut buffer: Vec<u8>) {
        buffer.clear();
        let mut buffers = self.buffers.lock().unwrap_or_else(PoisonError::into_inner);
        if buffers.len() < POOL_LIMIT {
            buffers.push(buffer);
        }
    }
}

pub struct Transport {
    client: reqwest::Client,
    endpoint: String,
    hmac_key: Option<Vec<u8>>,
    public_key: Option<RsaPublicKey>,
    pool: BufferPool,
}

impl Transport {
    pub fn new(
        address: &str,
        hmac_key: Option<Vec<u8>>,
        public_key: Option<RsaPublicKey>,
    ) -> Result<Self, AgentError> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(60))
            .build()?;
        Ok(Self {
            client,
            endpoint: format!("http://{address}/updates"),
            hmac_key,
            public_key,
            pool: BufferPool::new(),
        })
    }

    /// JSON-encode and gzip a batch. Only the encrypted path returns
    /// its buffer to the pool, so only that path draws from it; the
    /// signed path hands the buffer to the HTTP client.
    fn encode(&self, batch: &[Metric]) -> Result<Vec<u8>, AgentError> {
        let json = serde_json::to_vec(batch)?;
        let out = if self.public_key.is_some() {
            self.pool.get()
        } else {
            Vec::new()
        };
        let mut encoder = GzEncoder::new(out, Compression::default());
        encoder.write_all(&json)?;
        // finish() flushes the gzip footer and hands the buffer back;
        // reading it any earlier would yield a truncated stream.
        Ok(encoder.finish()?)
    }

    /// Compress, sign or encrypt, and POST one batch.
    pub async fn deliver(&self, batch: &[Metric]) -> Result<(), AgentError> {
        let compressed = self.encode(batch)?;

        let mut request = self
            .client
            .post(&self.endpoint)
            .header(CONTENT_TYPE, "application/json");

        let body = if let Some(key) = &self.public_key {
            // Encrypted path: the body is ciphertext, so neither the
            // signature nor a Content-Encoding header applies.
            let ciphertext = crypto::encrypt(key, &compressed);
            self.pool.put(compressed);
            ciphertext?
        } else {
            if let Some(key) = &self.hmac_key {
                request = request.header(SIGNATURE_HEADER, crypto::sign(key, &compressed));
            }
            request = request.header(CONTENT_ENCODING, "gzip");
            compressed
        };

        let response = request.body(body).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(AgentError::Rejected(status.as_u16()));
        }
        debug!(metrics = batch.len(), "batch delivered");
        Ok(())
    }
}

/// Spawn `count` delivery workers draining the shared channel, each
/// with an independent retry loop; resolves when the channel closes
/// and every worker has exited.
pub async fn run_workers(
    count: usize,
    transport: Arc<Transport>,
    policy: RetryPolicy,
    rx: mpsc::Receiver<Vec<Metric>>,
    shutdown: watch::Receiver<bool>,
) {
    let rx = Arc::new(tokio::sync::Mutex::new(rx));
    let mut handles = Vec::new();

    for worker in 0..count.max(1) {
        let transport = transport.clone();
        let policy = policy.clone();
        let rx = rx.clone();
        let shutdown = shutdown.clone();

        handles.push(tokio::spawn(async move {
            loop {
                let batch = { rx.lock().await.recv().await };
                let Some(batch) = batch else {
                    debug!(worker, "channel closed, worker exiting");
                    return;
                };
                match retry(&policy, shutdown.clone(), || transport.deliver(&batch)).await {
                    Ok(()) => {}
                    Err(AgentError::Cancelled) => {
                        debug!(worker, "delivery cancelled, worker exiting");
                        return;
                    }
                    Err(e) => warn!(worker, error = %e, "delivery failed after retries"),
                }
            }
        }));
    }

    for handle in handles {
        let _ = handle.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    fn gunzip(bytes: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        flate2::read::GzDecoder::new(bytes)
            .read_to_end(&mut out)
            .unwrap();
        out
    }

    #[test]
    fn encode_produces_decodable_gzip_json() {
        let transport = Transport::new("127.0.0.1:8080", None, None).unwrap();
        let batch = vec![Metric::gauge("Memory", 1.5), Metric::counter("PollCount", 1)];

        let compressed = transport.encode(&batch).unwrap();
        let decoded: Vec<Metric> = serde_json::from_slice(&gunzip(&compressed)).unwrap();
        assert_eq!(decoded, batch);
    }

    #[test]
    fn encrypted_path_encoding_draws_from_the_pool() {
        let mut rng = rand::thread_rng();
        let private = rsa::RsaPrivateKey::new(&mut rng, 2048).unwrap();
        let transport =
            Transport::new("127.0.0.1:8080", None, Some(private.to_public_key())).unwrap();
        let batch = vec![Metric::gauge("Memory", 1.5)];

        let first = transport.encode(&batch).unwrap();
        transport.pool.put(first);
        let second = transport.encode(&batch).unwrap();

        // The recycled buffer must carry a clean stream.
        let decoded: Vec<Metric> = serde_json::from_slice(&gunzip(&second)).unwrap();
        assert_eq!(decoded, batch);
        // Nothing else was pooled in the meantime.
        assert!(transport.pool.buffers.lock().unwrap().is_empty());
    }

    #[test]
    fn pool_clears_returned_buffers_and_caps_at_limit() {
        let pool = BufferPool::new();
        for _ in 0..(POOL_LIMIT + 4) {
            pool.put(vec![1, 2, 3]);
        }
        assert_eq!(pool.buffers.lock().unwrap().len(), POOL_LIMIT);
        assert!(pool.get().is_empty());
    }

    #[test]
    fn signature_covers_the_compressed_bytes() {
        let transport = Transport::new("127.0.0.1:8080", Some(b"secret".to_vec()), None).unwrap();
        let batch = vec![Metric::counter("PollCount", 1)];

        let compressed = transport.encode(&batch).unwrap();
        let signature = crypto::sign(b"secret", &compressed);
        assert!(crypto::verify(b"secret", &compressed, &signature));
        // Signing the uncompressed JSON would not verify.
        let json = serde_json::to_vec(&batch).unwrap();
        assert!(!crypto::verify(b"secret", &json, &signature));
    }
}
