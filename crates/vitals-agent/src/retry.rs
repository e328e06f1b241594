//! Fixed-schedule retry with cooperative cancellation.
//!
//! The delay schedule is a named policy value rather than a positional
//! list: the op runs once, then once more after each listed delay,
//! returning on the first success. Shutdown cancels immediately,
//! whether it lands mid-wait or mid-attempt.

use std::future::Future;
use std::time::Duration;

use tokio::sync::watch;
use tracing::debug;

use crate::error::AgentError;

/// Ordered wait durations between retry attempts.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub delays: Vec<Duration>,
}

impl RetryPolicy {
    pub fn new(delays: Vec<Duration>) -> Self {
        Self { delays }
    }

    /// The schedule used by delivery workers: 1s, 3s, 5s.
    pub fn standard() -> Self {
        Self::new(vec![
            Duration::from_secs(1),
            Duration::from_secs(3),
            Duration::from_secs(5),
        ])
    }

    /// Single attempt, no retries.
    pub fn none() -> Self {
        Self::new(Vec::new())
    }

    /// Total invocations when every attempt fails.
    pub fn max_attempts(&self) -> usize {
        self.delays.len() + 1
    }
}

/// Run `op` under `policy`. Returns the first success, `Cancelled` as
/// soon as the shutdown signal fires, or the last error once the
/// schedule is exhausted.
pub async fn retry<T, F, Fut>(
    policy: &RetryPolicy,
    mut shutdown: watch::Receiver<bool>,
    mut op: F,
) -> Result<T, AgentError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, AgentError>>,
{
    if *shutdown.borrow() {
        return Err(AgentError::Cancelled);
    }

    let mut last = match attempt(&mut shutdown, op()).await {
        Ok(value) => return Ok(value),
        Err(AgentError::Cancelled) => return Err(AgentError::Cancelled),
        Err(e) => e,
    };

    for (index, delay) in policy.delays.iter().enumerate() {
        debug!(attempt = index + 1, delay_ms = delay.as_millis() as u64, "retrying");
        tokio::select! {
            _ = tokio::time::sleep(*delay) => {}
            _ = shutdown.changed() => return Err(AgentError::Cancelled),
        }
        match attempt(&mut shutdown, op()).await {
            Ok(value) => return Ok(value),
            Err(AgentError::Cancelled) => return Err(AgentError::Cancelled),
            Err(e) => last = e,
        }
    }
    Err(last)
}

async fn attempt<T>(
    shutdown: &mut watch::Receiver<bool>,
    fut: impl Future<Output = Result<T, AgentError>>,
) -> Result<T, AgentError> {
    tokio::select! {
        result = fut => result,
        _ = shutdown.changed() => Err(AgentError::Cancelled),
    }
}
