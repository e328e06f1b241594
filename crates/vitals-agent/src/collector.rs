//! Metric samplers.
//!
//! The runtime sampler reads an allow-list of process fields each poll
//! tick, plus a random liveness gauge and a PollCount increment. The
//! host sampler reads host memory statistics on its own schedule into
//! a disjoint slot range. Both run until the shutdown signal; a field
//! that cannot be mapped stops that sampler silently.

use std::sync::Arc;
use std::time::Duration;

use sysinfo::{Process, ProcessesToUpdate, System};
use tokio::sync::watch;
use tracing::{debug, info};

use vitals_core::Metric;

use crate::buffer::{HOST_BASE, RANDOM_SLOT, RUNTIME_GAUGES, SnapshotBuffer};

/// Samples process runtime fields into slots `[0, HOST_BASE)`.
pub struct RuntimeSampler {
    buffer: Arc<SnapshotBuffer>,
    interval: Duration,
}

impl RuntimeSampler {
    pub fn new(buffer: Arc<SnapshotBuffer>, interval: Duration) -> Self {
        Self { buffer, interval }
    }

    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let Ok(pid) = sysinfo::get_current_pid() else {
            debug!("cannot resolve own pid, runtime sampler stopping");
            return;
        };
        let mut system = System::new();
        info!(interval_secs = self.interval.as_secs(), "runtime sampler started");

        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {
                    system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
                    let Some(process) = system.process(pid) else {
                        debug!("own process missing from snapshot, runtime sampler stopping");
                        return;
                    };
                    for (slot, name) in RUNTIME_GAUGES.iter().enumerate() {
                        let Some(value) = sample_field(process, name) else {
                            debug!(field = name, "unmapped runtime field, runtime sampler stopping");
                            return;
                        };
                        self.buffer.put(slot, Metric::gauge(*name, value));
                    }
                    self.buffer.put(RANDOM_SLOT, Metric::gauge("RandomValue", rand::random::<f64>()));
                    self.buffer.record_poll();
                }
                _ = shutdown.changed() => {
                    info!("runtime sampler stopping");
                    return;
                }
            }
        }
    }
}

/// Map an allow-listed field name to its current value.
fn sample_field(process: &Process, name: &str) -> Option<f64> {
    match name {
        "Memory" => Some(process.memory() as f64),
        "VirtualMemory" => Some(process.virtual_memory() as f64),
        "CpuUsage" => Some(process.cpu_usage() as f64),
        "RunTime" => Some(process.run_time() as f64),
        "DiskReadBytes" => Some(process.disk_usage().total_read_bytes as f64),
        "DiskWrittenBytes" => Some(process.disk_usage().total_written_bytes as f64),
        _ => None,
    }
}

/// Samples host memory statistics into slots `[HOST_BASE, SLOT_COUNT)`.
pub struct HostSampler {
    buffer: Arc<SnapshotBuffer>,
    interval: Duration,
}

impl HostSampler {
    pub fn new(buffer: Arc<SnapshotBuffer>, interval: Duration) -> Self {
        Self { buffer, interval }
    }

    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut system = System::new();
        info!(interval_secs = self.interval.as_secs(), "host sampler started");

        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {
                    system.refresh_memory();
                    let total = system.total_memory();
                    let free = system.free_memory();
                    let utilization = if total > 0 {
                        system.used_memory() as f64 * 100.0 / total as f64
                    } else {
                        0.0
                    };
                    self.buffer.put(HOST_BASE, Metric::gauge("TotalMemory", total as f64));
                    self.buffer.put(HOST_BASE + 1, Metric::gauge("FreeMemory", free as f64));
                    self.buffer.put(HOST_BASE + 2, Metric::gauge("MemoryUtilization", utilization));
                }
                _ = shutdown.changed() => {
                    info!("host sampler stopping");
                    return;
                }
            }
        }
    }
}
