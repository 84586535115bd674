//! Plugin Delay Compensation (PDC)
//!
//! Every track is delayed by `max_latency - own_latency` so all tracks reach
//! the output bus with equal total delay.
//!
//! ```text
//!   Track A  lat 0    ──► comp 25 ──┐
//!   Track B  lat 10   ──► comp 15 ──┼──► bus   (max latency 25)
//!   Track C  lat 25   ──► comp 0  ──┘
//! ```
//!
//! The compensation table is rebuilt on the control thread and swapped into
//! an [`RtShared`]; the render thread looks entries up with `try_with`.

use parking_lot::Mutex;
use std::collections::HashMap;

use stori_core::TrackId;

use crate::rt::{RtFlag, RtShared};

/// Latency in samples
pub type LatencySamples = u64;

// ═══════════════════════════════════════════════════════════════════════════
// CALCULATION
// ═══════════════════════════════════════════════════════════════════════════

/// Per-track compensation derived from a latency table
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompensationTable {
    pub delays: HashMap<TrackId, LatencySamples>,
    pub max_latency: LatencySamples,
}

impl CompensationTable {
    #[inline]
    pub fn delay_for(&self, track: TrackId) -> LatencySamples {
        self.delays.get(&track).copied().unwrap_or(0)
    }
}

/// `compensation = max(all) - own` for every track
pub fn calculate_compensation(latencies: &HashMap<TrackId, LatencySamples>) -> CompensationTable {
    let max_latency = latencies.values().copied().max().unwrap_or(0);
    let delays = latencies
        .iter()
        .map(|(&track, &own)| (track, max_latency - own))
        .collect();

    CompensationTable {
        delays,
        max_latency,
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// PDC MANAGER
// ═══════════════════════════════════════════════════════════════════════════

pub struct PdcManager {
    latencies: Mutex<HashMap<TrackId, LatencySamples>>,
    table: RtShared<CompensationTable>,
    enabled: RtFlag,
    /// Largest delay a compensation line can apply
    max_compensation: LatencySamples,
}

impl PdcManager {
    pub fn new(max_compensation: LatencySamples) -> Self {
        Self {
            latencies: Mutex::new(HashMap::new()),
            table: RtShared::new(CompensationTable::default()),
            enabled: RtFlag::new(true),
            max_compensation,
        }
    }

    /// Update one track's latency; recomputes only on change
    pub fn set_track_latency(&self, track: TrackId, samples: LatencySamples) {
        let mut latencies = self.latencies.lock();
        if latencies.get(&track) == Some(&samples) {
            return;
        }
        latencies.insert(track, samples);
        self.publish(&latencies);
    }

    /// Purge a deleted track
    pub fn remove_track(&self, track: TrackId) {
        let mut latencies = self.latencies.lock();
        if latencies.remove(&track).is_some() {
            self.publish(&latencies);
        }
    }

    pub fn clear(&self) {
        let mut latencies = self.latencies.lock();
        latencies.clear();
        self.publish(&latencies);
    }

    fn publish(&self, latencies: &HashMap<TrackId, LatencySamples>) {
        let mut table = calculate_compensation(latencies);
        for (track, delay) in table.delays.iter_mut() {
            if *delay > self.max_compensation {
                log::warn!(
                    "[PDC] {} needs {} samples, clamped to {}",
                    track,
                    delay,
                    self.max_compensation
                );
                *delay = self.max_compensation;
            }
        }
        log::debug!(
            "[PDC] Recalculated: {} tracks, max latency {} samples",
            table.delays.len(),
            table.max_latency
        );
        self.table.replace(table);
    }

    /// Compensation for a track (control thread)
    pub fn compensation_for(&self, track: TrackId) -> LatencySamples {
        if !self.enabled.get() {
            return 0;
        }
        self.table.with(|t| t.delay_for(track))
    }

    /// Compensation for a track, `None` if the table is being swapped
    #[inline]
    pub fn try_compensation_for(&self, track: TrackId) -> Option<LatencySamples> {
        if !self.enabled.get() {
            return Some(0);
        }
        self.table.try_with(|t| t.delay_for(track))
    }

    pub fn max_latency(&self) -> LatencySamples {
        self.table.with(|t| t.max_latency)
    }

    pub fn track_latency(&self, track: TrackId) -> LatencySamples {
        self.latencies.lock().get(&track).copied().unwrap_or(0)
    }

    /// Copy of the current table (diagnostics)
    pub fn table(&self) -> CompensationTable {
        self.table.with(|t| t.clone())
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.set(enabled);
        log::info!("[PDC] {}", if enabled { "Enabled" } else { "Disabled" });
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.get()
    }
}

impl std::fmt::Debug for PdcManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PdcManager")
            .field("enabled", &self.is_enabled())
            .field("max_latency", &self.max_latency())
            .finish()
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// COMPENSATION DELAY LINE
// ═══════════════════════════════════════════════════════════════════════════

/// Pre-allocated delay line applied to one track channel
///
/// Capacity is fixed at construction; `set_delay` never reallocates so it is
/// safe to call between render blocks.
#[derive(Debug, Clone)]
pub struct CompensationDelay {
    buffer: Box<[f32]>,
    write_pos: usize,
    delay: usize,
}

impl CompensationDelay {
    pub fn new(max_delay: usize) -> Self {
        Self {
            buffer: vec![0.0; max_delay + 1].into_boxed_slice(),
            write_pos: 0,
            delay: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.buffer.len() - 1
    }

    /// Set the delay, clamped to capacity
    pub fn set_delay(&mut self, samples: usize) {
        if samples > self.capacity() {
            log::warn!(
                "[PDC] Delay {} exceeds line capacity {}, clamping",
                samples,
                self.capacity()
            );
        }
        self.delay = samples.min(self.capacity());
    }

    #[inline]
    pub fn delay(&self) -> usize {
        self.delay
    }

    pub fn process(&mut self, block: &mut [f32]) {
        if self.delay == 0 {
            return;
        }
        let len = self.buffer.len();
        for sample in block.iter_mut() {
            let read_pos = (self.write_pos + len - self.delay) % len;
            let out = self.buffer[read_pos];
            self.buffer[self.write_pos] = *sample;
            self.write_pos = (self.write_pos + 1) % len;
            *sample = out;
        }
    }

    pub fn clear(&mut self) {
        self.buffer.fill(0.0);
        self.write_pos = 0;
    }
}
