//! Fixed-slot snapshot buffer shared by the samplers and the emitter.
//!
//! Each sampler owns a disjoint index range and overwrites its slots
//! in place every tick; the emitter never aliases the slots — a
//! snapshot clones whatever is currently present. The interior lock
//! makes the sharing explicit rather than relying on tick timing.
//!
//! Poll ticks accumulate in a separate atomic counter that a snapshot
//! drains: each emitted PollCount delta equals the polls since the
//! previous snapshot, so the server-side total equals total polls even
//! when sampling runs faster than reporting.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{PoisonError, RwLock};

use vitals_core::Metric;

/// Allow-listed process runtime fields, one buffer slot each.
pub const RUNTIME_GAUGES: [&str; 6] = [
    "Memory",
    "VirtualMemory",
    "CpuUsage",
    "RunTime",
    "DiskReadBytes",
    "DiskWrittenBytes",
];

/// Slot for the per-tick random liveness gauge.
pub const RANDOM_SLOT: usize = RUNTIME_GAUGES.len();
/// First slot of the host sampler's range (3 slots).
pub const HOST_BASE: usize = RUNTIME_GAUGES.len() + 1;
/// Total slot count.
pub const SLOT_COUNT: usize = HOST_BASE + 3;

pub struct SnapshotBuffer {
    slots: RwLock<Vec<Option<Metric>>>,
    polls: AtomicI64,
}

impl SnapshotBuffer {
    pub fn new() -> Self {
        Self {
            slots: RwLock::new(vec![None; SLOT_COUNT]),
            polls: AtomicI64::new(0),
        }
    }

    /// Overwrite one slot. Slots are assigned statically, so writers
    /// on different ranges never contend on the same index.
    pub fn put(&self, slot: usize, metric: Metric) {
        debug_assert!(slot < SLOT_COUNT, "slot {slot} out of range");
        let mut slots = self.slots.write().unwrap_or_else(PoisonError::into_inner);
        slots[slot] = Some(metric);
    }

    /// Count one completed poll tick toward the next PollCount delta.
    pub fn record_poll(&self) {
        self.polls.fetch_add(1, Ordering::AcqRel);
    }

    /// Copy the populated slots into an owned batch, appending a
    /// PollCount counter carrying the polls recorded since the last
    /// snapshot (and resetting that count).
    pub fn snapshot(&self) -> Vec<Metric> {
        let slots = self.slots.read().unwrap_or_else(PoisonError::into_inner);
        let mut batch: Vec<Metric> = slots.iter().flatten().cloned().collect();
        drop(slots);

        let polls = self.polls.swap(0, Ordering::AcqRel);
        if polls > 0 {
            batch.push(Metric::counter("PollCount", polls));
        }
        batch
    }
}

impl Default for SnapshotBuffer {
    fn default() -> Self {
        Self::new()
    }
}
