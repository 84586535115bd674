//! Recording buffer pool and capture path
//!
//! ```text
//!   capture callback ──acquire──► copy ──push──► [rtrb queue] ──► writer thread ──► sink
//!          ▲                                                            │
//!          └──────────────────────── release ◄─────────────────────────┘
//! ```
//!
//! The free list is a bounded channel sized to the hard limit, so acquire
//! and release never allocate. Crossing the high-water mark asks the
//! maintenance thread to pre-allocate overflow buffers; if the callback
//! outruns it an emergency allocation is made on the spot rather than
//! dropping samples. Past the hard limit `acquire` returns `None`.
//!
//! The callback never logs. Emergency allocations and exhaustion are
//! counted there and reported to the error tracker from `report_health`,
//! which the maintenance thread and the control loop call.

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, bounded};
use rtrb::{Consumer, Producer, RingBuffer};
use std::collections::HashMap;
use std::fmt;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use stori_core::{RecordingPoolSettings, TrackId};

use crate::error::{EngineError, EngineResult};
use crate::health::{ErrorComponent, ErrorSeverity, ErrorTracker};
use crate::rt::{RtCounter, RtMaxTracker};

// ═══════════════════════════════════════════════════════════════════════════
// BUFFER
// ═══════════════════════════════════════════════════════════════════════════

/// Fixed-capacity sample buffer
pub struct RecordingBuffer {
    data: Box<[f32]>,
    len: usize,
}

impl RecordingBuffer {
    fn new(capacity: usize) -> Self {
        Self {
            data: vec![0.0; capacity].into_boxed_slice(),
            len: 0,
        }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Copy as many samples as fit; returns the count copied
    #[inline]
    pub fn write(&mut self, samples: &[f32]) -> usize {
        let n = samples.len().min(self.capacity());
        self.data[..n].copy_from_slice(&samples[..n]);
        self.len = n;
        n
    }

    #[inline]
    pub fn as_slice(&self) -> &[f32] {
        &self.data[..self.len]
    }

    fn clear(&mut self) {
        self.len = 0;
    }
}

impl fmt::Debug for RecordingBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RecordingBuffer({}/{})", self.len, self.capacity())
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// POOL
// ═══════════════════════════════════════════════════════════════════════════

/// Pool statistics
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PoolStats {
    pub buffer_capacity: usize,
    pub baseline: usize,
    pub hard_limit: usize,
    pub total: usize,
    pub in_use: usize,
    pub available: usize,
    pub peak_in_use: u64,
    pub acquired: u64,
    pub emergency_allocations: u64,
    pub exhausted: u64,
    pub preallocated: u64,
    pub trimmed: u64,
}

impl PoolStats {
    pub fn occupancy(&self) -> f64 {
        if self.total == 0 {
            return 1.0;
        }
        self.in_use as f64 / self.total as f64
    }
}

impl fmt::Display for PoolStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{} in use (peak {}, limit {}), {} acquired, {} emergency, {} exhausted, {} preallocated, {} trimmed",
            self.in_use,
            self.total,
            self.peak_in_use,
            self.hard_limit,
            self.acquired,
            self.emergency_allocations,
            self.exhausted,
            self.preallocated,
            self.trimmed
        )
    }
}

pub struct BufferPool {
    buffer_capacity: usize,
    baseline: usize,
    hard_limit: usize,
    overflow_batch: usize,
    high_water: f64,
    low_water: f64,
    free_tx: Sender<RecordingBuffer>,
    free_rx: Receiver<RecordingBuffer>,
    prealloc_tx: Sender<()>,
    prealloc_rx: Receiver<()>,
    total: AtomicUsize,
    in_use: AtomicUsize,
    /// Overflow slots counted in `total` whose buffer is not yet on the free list
    in_flight: AtomicUsize,
    peak: RtMaxTracker,
    acquired: RtCounter,
    emergency: RtCounter,
    exhausted: RtCounter,
    preallocated: RtCounter,
    trimmed: RtCounter,
    errors: Option<Arc<ErrorTracker>>,
    reported_emergency: AtomicU64,
    reported_exhausted: AtomicU64,
}

impl BufferPool {
    pub fn new(settings: &RecordingPoolSettings) -> Self {
        let hard_limit = settings.hard_limit().max(1);
        let baseline = settings.baseline_buffers.min(hard_limit);
        let (free_tx, free_rx) = bounded(hard_limit);
        let (prealloc_tx, prealloc_rx) = bounded(1);

        for _ in 0..baseline {
            // Capacity is hard_limit >= baseline
            let _ = free_tx.try_send(RecordingBuffer::new(settings.buffer_capacity));
        }
        log::info!(
            "[Pool] {} buffers x {} samples (hard limit {})",
            baseline,
            settings.buffer_capacity,
            hard_limit
        );

        Self {
            buffer_capacity: settings.buffer_capacity,
            baseline,
            hard_limit,
            overflow_batch: settings.overflow_batch.max(1),
            high_water: settings.high_water,
            low_water: settings.low_water,
            free_tx,
            free_rx,
            prealloc_tx,
            prealloc_rx,
            total: AtomicUsize::new(baseline),
            in_use: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            peak: RtMaxTracker::new(),
            acquired: RtCounter::new(),
            emergency: RtCounter::new(),
            exhausted: RtCounter::new(),
            preallocated: RtCounter::new(),
            trimmed: RtCounter::new(),
            errors: None,
            reported_emergency: AtomicU64::new(0),
            reported_exhausted: AtomicU64::new(0),
        }
    }

    /// Report pool pressure to `errors` (see `report_health`)
    pub fn with_error_tracker(mut self, errors: Arc<ErrorTracker>) -> Self {
        self.errors = Some(errors);
        self
    }

    /// Claim up to `n` slots under the hard limit
    fn reserve(&self, n: usize) -> usize {
        let mut total = self.total.load(Ordering::Acquire);
        loop {
            let granted = n.min(self.hard_limit.saturating_sub(total));
            if granted == 0 {
                return 0;
            }
            match self.total.compare_exchange_weak(
                total,
                total + granted,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return granted,
                Err(actual) => total = actual,
            }
        }
    }

    /// Take a buffer (capture callback)
    ///
    /// O(1) from the free list. Below the hard limit an empty free list
    /// falls back to an emergency allocation; at the limit returns `None`.
    pub fn acquire(&self) -> Option<RecordingBuffer> {
        let buffer = match self.free_rx.try_recv() {
            Ok(buffer) => buffer,
            Err(_) => match self.reserve(1) {
                0 => match self.await_in_flight() {
                    Some(buffer) => buffer,
                    None => {
                        self.exhausted.increment();
                        return None;
                    }
                },
                _ => {
                    self.emergency.increment();
                    RecordingBuffer::new(self.buffer_capacity)
                }
            },
        };

        let in_use = self.in_use.fetch_add(1, Ordering::AcqRel) + 1;
        self.peak.try_observe(in_use as u64);
        self.acquired.increment();

        if in_use as f64 >= self.high_water * self.total.load(Ordering::Acquire) as f64 {
            let _ = self.prealloc_tx.try_send(());
        }
        Some(buffer)
    }

    /// Slots at the hard limit may still be on their way to the free list
    fn await_in_flight(&self) -> Option<RecordingBuffer> {
        while self.in_flight.load(Ordering::Acquire) > 0 {
            if let Ok(buffer) = self.free_rx.try_recv() {
                return Some(buffer);
            }
            std::hint::spin_loop();
        }
        self.free_rx.try_recv().ok()
    }

    /// Return a buffer to the free list
    pub fn release(&self, mut buffer: RecordingBuffer) {
        buffer.clear();
        if self.free_tx.try_send(buffer).is_err() {
            self.total.fetch_sub(1, Ordering::AcqRel);
        }
        self.in_use.fetch_sub(1, Ordering::AcqRel);
    }

    /// Count one overflow slot against the hard limit before its buffer lands
    fn claim_overflow_slot(&self) -> bool {
        self.in_flight.fetch_add(1, Ordering::AcqRel);
        if self.reserve(1) == 1 {
            return true;
        }
        self.in_flight.fetch_sub(1, Ordering::AcqRel);
        false
    }

    fn fill_overflow_slot(&self, buffer: RecordingBuffer) {
        if self.free_tx.try_send(buffer).is_err() {
            self.total.fetch_sub(1, Ordering::AcqRel);
        }
        self.in_flight.fetch_sub(1, Ordering::AcqRel);
    }

    /// Add one batch of overflow buffers (background thread)
    ///
    /// Each buffer is allocated before its slot is claimed, so a slot
    /// counted in `total` is never more than a channel send away from the
    /// free list.
    pub fn preallocate_overflow(&self) -> usize {
        let mut granted = 0;
        while granted < self.overflow_batch && self.total.load(Ordering::Acquire) < self.hard_limit {
            let buffer = RecordingBuffer::new(self.buffer_capacity);
            if !self.claim_overflow_slot() {
                break;
            }
            self.fill_overflow_slot(buffer);
            granted += 1;
        }
        if granted > 0 {
            self.preallocated.add(granted as u64);
            log::info!(
                "[Pool] Pre-allocated {} overflow buffers ({} total)",
                granted,
                self.total.load(Ordering::Relaxed)
            );
        }
        granted
    }

    /// Shrink back towards the baseline once occupancy is under the low-water mark
    pub fn trim(&self) -> usize {
        if self.occupancy() > self.low_water {
            return 0;
        }
        let mut removed = 0;
        while self.total.load(Ordering::Acquire) > self.baseline {
            match self.free_rx.try_recv() {
                Ok(buffer) => {
                    drop(buffer);
                    self.total.fetch_sub(1, Ordering::AcqRel);
                    removed += 1;
                }
                Err(_) => break,
            }
        }
        if removed > 0 {
            self.trimmed.add(removed as u64);
            log::debug!("[Pool] Trimmed {} overflow buffers", removed);
        }
        removed
    }

    /// Forward pressure events since the last call to the error tracker
    /// (maintenance or control thread, never the callback)
    ///
    /// Emergency allocations are warnings; refusals at the hard limit are
    /// critical. Returns the number of records made.
    pub fn report_health(&self) -> usize {
        self.peak.observe(self.in_use.load(Ordering::Acquire) as u64);
        let Some(errors) = &self.errors else {
            return 0;
        };
        let mut recorded = 0;

        let emergency = self.emergency.get();
        let previous = self.reported_emergency.swap(emergency, Ordering::AcqRel);
        if emergency > previous {
            errors.record(
                ErrorSeverity::Warning,
                ErrorComponent::Resource,
                format!(
                    "Recording pool made {} emergency allocations ({} buffers total)",
                    emergency - previous,
                    self.total.load(Ordering::Acquire)
                ),
            );
            recorded += 1;
        }

        let exhausted = self.exhausted.get();
        let previous = self.reported_exhausted.swap(exhausted, Ordering::AcqRel);
        if exhausted > previous {
            errors.record(
                ErrorSeverity::Critical,
                ErrorComponent::Resource,
                format!(
                    "Recording pool exhausted at its hard limit of {}: {} buffers refused",
                    self.hard_limit,
                    exhausted - previous
                ),
            );
            recorded += 1;
        }
        recorded
    }

    /// Wait for a pre-allocation request
    fn wait_for_request(&self, timeout: Duration) -> Result<(), RecvTimeoutError> {
        self.prealloc_rx.recv_timeout(timeout)
    }

    pub fn occupancy(&self) -> f64 {
        let total = self.total.load(Ordering::Acquire);
        if total == 0 {
            return 1.0;
        }
        self.in_use.load(Ordering::Acquire) as f64 / total as f64
    }

    pub fn buffer_capacity(&self) -> usize {
        self.buffer_capacity
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            buffer_capacity: self.buffer_capacity,
            baseline: self.baseline,
            hard_limit: self.hard_limit,
            total: self.total.load(Ordering::Acquire),
            in_use: self.in_use.load(Ordering::Acquire),
            available: self.free_rx.len(),
            peak_in_use: self.peak.get(),
            acquired: self.acquired.get(),
            emergency_allocations: self.emergency.get(),
            exhausted: self.exhausted.get(),
            preallocated: self.preallocated.get(),
            trimmed: self.trimmed.get(),
        }
    }
}

impl fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("BufferPool").field(&self.stats()).finish()
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// MAINTENANCE THREAD
// ═══════════════════════════════════════════════════════════════════════════

/// Background pre-allocation and trimming
pub struct PoolMaintenance {
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl PoolMaintenance {
    /// `interval` bounds how long trimming waits between checks
    pub fn spawn(pool: Arc<BufferPool>, interval: Duration) -> EngineResult<Self> {
        let running = Arc::new(AtomicBool::new(true));
        let thread_running = running.clone();

        let handle = thread::Builder::new()
            .name("stori-pool".into())
            .spawn(move || {
                while thread_running.load(Ordering::Relaxed) {
                    match pool.wait_for_request(interval) {
                        Ok(()) => {
                            pool.preallocate_overflow();
                        }
                        Err(RecvTimeoutError::Timeout) => {
                            pool.trim();
                        }
                        Err(RecvTimeoutError::Disconnected) => break,
                    }
                    pool.report_health();
                }
                log::debug!("[Pool] Maintenance thread exiting");
            })?;

        Ok(Self {
            running,
            handle: Some(handle),
        })
    }

    pub fn stop(&mut self) {
        self.running.store(false, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for PoolMaintenance {
    fn drop(&mut self) {
        self.stop();
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// CAPTURE
// ═══════════════════════════════════════════════════════════════════════════

/// Destination for captured audio (disk writer)
pub trait RecordingSink: Send {
    fn write_block(&mut self, track: TrackId, samples: &[f32]) -> EngineResult<()>;

    fn finish(&mut self) -> EngineResult<()>;
}

/// Block in flight between callback and writer
pub struct CapturedBlock {
    pub track: TrackId,
    pub buffer: RecordingBuffer,
}

/// Totals reported when a capture session ends
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CaptureSummary {
    pub blocks_written: u64,
    pub samples_written: u64,
    /// Blocks lost to pool exhaustion or a full queue
    pub blocks_dropped: u64,
}

/// Live capture: callback side plus its writer thread
pub struct CaptureSession {
    producer: Producer<CapturedBlock>,
    pool: Arc<BufferPool>,
    running: Arc<AtomicBool>,
    writer: Option<JoinHandle<EngineResult<(u64, u64)>>>,
    dropped: RtCounter,
}

impl CaptureSession {
    pub fn start(pool: Arc<BufferPool>, mut sink: Box<dyn RecordingSink>, queue_depth: usize) -> EngineResult<Self> {
        let (producer, mut consumer): (Producer<CapturedBlock>, Consumer<CapturedBlock>) =
            RingBuffer::new(queue_depth.max(1));
        let running = Arc::new(AtomicBool::new(true));
        let writer_running = running.clone();
        let writer_pool = pool.clone();

        let writer = thread::Builder::new()
            .name("stori-rec-writer".into())
            .spawn(move || {
                let mut blocks = 0u64;
                let mut samples = 0u64;
                let mut first_error = None;
                loop {
                    match consumer.pop() {
                        Ok(block) => {
                            if first_error.is_none() {
                                match sink.write_block(block.track, block.buffer.as_slice()) {
                                    Ok(()) => {
                                        blocks += 1;
                                        samples += block.buffer.len() as u64;
                                    }
                                    Err(e) => {
                                        log::error!("[Pool] Recording writer failed: {}", e);
                                        first_error = Some(e);
                                    }
                                }
                            }
                            writer_pool.release(block.buffer);
                        }
                        Err(_) => {
                            if !writer_running.load(Ordering::Acquire) && consumer.is_empty() {
                                break;
                            }
                            thread::sleep(Duration::from_millis(1));
                        }
                    }
                }
                if let Some(e) = first_error {
                    return Err(e);
                }
                sink.finish()?;
                Ok((blocks, samples))
            })?;

        Ok(Self {
            producer,
            pool,
            running,
            writer: Some(writer),
            dropped: RtCounter::new(),
        })
    }

    /// Capture one callback's samples (capture thread)
    ///
    /// Returns `false` if any part of the block was lost.
    pub fn capture(&mut self, track: TrackId, samples: &[f32]) -> bool {
        let chunk = self.pool.buffer_capacity().max(1);
        let mut complete = true;
        for part in samples.chunks(chunk) {
            let Some(mut buffer) = self.pool.acquire() else {
                self.dropped.increment();
                complete = false;
                continue;
            };
            buffer.write(part);
            if let Err(rtrb::PushError::Full(block)) = self.producer.push(CapturedBlock { track, buffer }) {
                self.pool.release(block.buffer);
                self.dropped.increment();
                complete = false;
            }
        }
        complete
    }

    pub fn dropped_blocks(&self) -> u64 {
        self.dropped.get()
    }

    /// Drain the queue, finish the sink and join the writer
    pub fn finish(mut self) -> EngineResult<CaptureSummary> {
        self.running.store(false, Ordering::Release);
        let result = match self.writer.take() {
            Some(handle) => handle
                .join()
                .map_err(|_| EngineError::Render("recording writer panicked".into()))?,
            None => Ok((0, 0)),
        };
        let (blocks_written, samples_written) = result?;
        let summary = CaptureSummary {
            blocks_written,
            samples_written,
            blocks_dropped: self.dropped.get(),
        };
        log::info!(
            "[Pool] Capture finished: {} blocks, {} samples, {} dropped",
            summary.blocks_written,
            summary.samples_written,
            summary.blocks_dropped
        );
        Ok(summary)
    }
}

impl Drop for CaptureSession {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(handle) = self.writer.take() {
            let _ = handle.join();
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// RAW PCM SINK
// ═══════════════════════════════════════════════════════════════════════════

/// Writes little-endian f32 samples, one file per track
pub struct RawPcmSink {
    dir: PathBuf,
    files: HashMap<TrackId, BufWriter<File>>,
}

impl RawPcmSink {
    pub fn new(dir: &Path) -> EngineResult<Self> {
        fs::create_dir_all(dir)?;
        Ok(Self {
            dir: dir.to_path_buf(),
            files: HashMap::new(),
        })
    }

    pub fn path_for(dir: &Path, track: TrackId) -> PathBuf {
        dir.join(format!("track-{}.f32", track.0))
    }
}

impl RecordingSink for RawPcmSink {
    fn write_block(&mut self, track: TrackId, samples: &[f32]) -> EngineResult<()> {
        let writer = match self.files.get_mut(&track) {
            Some(writer) => writer,
            None => {
                let file = File::create(Self::path_for(&self.dir, track))?;
                self.files.entry(track).or_insert(BufWriter::new(file))
            }
        };
        for sample in samples {
            writer.write_all(&sample.to_le_bytes())?;
        }
        Ok(())
    }

    fn finish(&mut self) -> EngineResult<()> {
        for writer in self.files.values_mut() {
            writer.flush()?;
        }
        Ok(())
    }
}
