//! vitals-agent — the sampling and delivery side of the pipeline.
//!
//! Two samplers (process runtime and host memory) write into disjoint
//! slot ranges of a shared [`SnapshotBuffer`] on independent tickers.
//! The [`Emitter`] copies the buffer on its own schedule and publishes
//! batches to a capacity-1 channel; N delivery workers drain it, each
//! compressing, optionally signing or encrypting, and POSTing with an
//! independent fixed-schedule retry loop.
//!
//! ```text
//! RuntimeSampler ─┐
//!                 ├─> SnapshotBuffer ─> Emitter ─> channel ─> workers ─> HTTP
//! HostSampler ────┘
//! ```

pub mod buffer;
pub mod collector;
pub mod emitter;
pub mod error;
pub mod retry;
pub mod transport;

pub use buffer::SnapshotBuffer;
pub use collector::{HostSampler, RuntimeSampler};
pub use emitter::Emitter;
pub use error::AgentError;
pub use retry::{retry, RetryPolicy};
pub use transport::{run_workers, Transport};
