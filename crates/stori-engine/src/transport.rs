//! Transport clock
//!
//! The playback position is never counted up tick by tick. A small anchor
//! `{start_beat, start_wall_time, tempo, is_playing}` is written as one unit
//! on every play, pause, stop, seek, jump and tempo change, and the current
//! beat is derived from it on read:
//!
//! ```text
//!   beat = start_beat + (now - start_wall_time) * tempo / 60
//! ```
//!
//! [`TransportAnchor::beat_at`] is the only place that formula lives. The
//! position publisher, `pause` and `current_beat` all go through it.
//!
//! Control operations are serialized by an internal mutex. The render thread
//! only uses `current_beat`/`is_playing`, which never block.

use parking_lot::Mutex;
use portable_atomic::AtomicF64;
use std::fmt;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use stori_core::{CycleRegion, PlaybackPosition, SchedulingContext, TimeSignature, TransportSettings};

use crate::context::EngineContext;
use crate::error::EngineResult;
use crate::rt::{RtCell, RtCounter};

/// Cycle start and jump target are considered equal within this distance
const CYCLE_START_TOLERANCE: f64 = 1e-9;

// ═══════════════════════════════════════════════════════════════════════════
// STATE
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum TransportState {
    #[default]
    Stopped = 0,
    Playing = 1,
    Paused = 2,
    Recording = 3,
}

impl TransportState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => TransportState::Playing,
            2 => TransportState::Paused,
            3 => TransportState::Recording,
            _ => TransportState::Stopped,
        }
    }

    /// Playing or recording
    #[inline]
    pub fn is_rolling(self) -> bool {
        matches!(self, TransportState::Playing | TransportState::Recording)
    }
}

impl fmt::Display for TransportState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TransportState::Stopped => "stopped",
            TransportState::Playing => "playing",
            TransportState::Paused => "paused",
            TransportState::Recording => "recording",
        };
        f.write_str(s)
    }
}

/// Minimal state needed to reconstruct the current beat
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TransportAnchor {
    pub start_beat: f64,
    /// Clock reading at `start_beat` (seconds)
    pub start_wall_time: f64,
    pub tempo: f64,
    pub is_playing: bool,
}

impl TransportAnchor {
    pub fn frozen(beat: f64, now: f64, tempo: f64) -> Self {
        Self {
            start_beat: beat,
            start_wall_time: now,
            tempo,
            is_playing: false,
        }
    }

    pub fn running(beat: f64, now: f64, tempo: f64) -> Self {
        Self {
            start_beat: beat,
            start_wall_time: now,
            tempo,
            is_playing: true,
        }
    }

    /// Beat at clock reading `now`
    #[inline]
    pub fn beat_at(&self, now: f64) -> f64 {
        if !self.is_playing {
            return self.start_beat;
        }
        let elapsed = (now - self.start_wall_time).max(0.0);
        self.start_beat + elapsed * self.tempo / 60.0
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// COLLABORATORS
// ═══════════════════════════════════════════════════════════════════════════

/// Starts and stops the playback nodes
pub trait PlaybackDriver: Send + Sync {
    /// Schedule playback from `from_beat`. Returns `true` when the cycle
    /// region was scheduled ahead, so a wrap to its start needs no restart.
    fn start_playback(&self, from_beat: f64, cycle: Option<CycleRegion>) -> bool;

    fn stop_playback(&self);
}

/// Transport observer, registered as a non-owning handle
///
/// Called while the transport's control lock is held: implementations must
/// not call back into transport control operations.
pub trait TransportListener: Send + Sync {
    fn on_jump(&self, _from_beat: f64, _to_beat: f64) {}

    fn on_state_change(&self, _state: TransportState) {}
}

/// Position sampled by the publisher, not yet published
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PendingTick {
    generation: u64,
    anchor: TransportAnchor,
    pub beat: f64,
}

/// Result of one position publisher tick
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TickOutcome {
    /// Not playing, nothing published
    Idle,
    /// Published a new position
    Advanced(f64),
    /// Cycle end reached, jumped back to the start
    Wrapped { from: f64, to: f64 },
    /// Transport changed while the tick was computed; discarded
    Stale,
}

// ═══════════════════════════════════════════════════════════════════════════
// TRANSPORT
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Default)]
struct ControlState {
    cycle: CycleRegion,
    /// Last `start_playback` scheduled the cycle region ahead
    cycle_prescheduled: bool,
}

pub struct Transport {
    ctx: Arc<EngineContext>,
    driver: Arc<dyn PlaybackDriver>,
    anchor: RtCell<TransportAnchor>,
    scheduling: RtCell<SchedulingContext>,
    state: AtomicU8,
    /// Last published beat, fallback for contended reads
    position: AtomicF64,
    jump_generation: AtomicU64,
    jump_count: RtCounter,
    restart_count: RtCounter,
    cycle_epsilon: f64,
    control: Mutex<ControlState>,
    listeners: Mutex<Vec<Weak<dyn TransportListener>>>,
}

impl Transport {
    pub fn new(
        ctx: Arc<EngineContext>,
        driver: Arc<dyn PlaybackDriver>,
        scheduling: SchedulingContext,
        settings: &TransportSettings,
    ) -> Self {
        let now = ctx.now();
        Self {
            ctx,
            driver,
            anchor: RtCell::new(TransportAnchor::frozen(0.0, now, scheduling.tempo())),
            scheduling: RtCell::new(scheduling),
            state: AtomicU8::new(TransportState::Stopped as u8),
            position: AtomicF64::new(0.0),
            jump_generation: AtomicU64::new(0),
            jump_count: RtCounter::new(),
            restart_count: RtCounter::new(),
            cycle_epsilon: settings.cycle_epsilon_beats,
            control: Mutex::new(ControlState::default()),
            listeners: Mutex::new(Vec::new()),
        }
    }

    // ─── Listeners ──────────────────────────────────────────────────────────

    /// Register a listener without taking ownership of it
    pub fn subscribe<L: TransportListener + 'static>(&self, listener: &Arc<L>) {
        let weak = Arc::downgrade(listener);
        let weak: Weak<dyn TransportListener> = weak;
        self.listeners.lock().push(weak);
    }

    /// Live listener count; dropped listeners are pruned
    pub fn listener_count(&self) -> usize {
        let mut listeners = self.listeners.lock();
        listeners.retain(|l| l.strong_count() > 0);
        listeners.len()
    }

    fn notify(&self, f: impl Fn(&dyn TransportListener)) {
        let mut listeners = self.listeners.lock();
        listeners.retain(|weak| match weak.upgrade() {
            Some(listener) => {
                f(listener.as_ref());
                true
            }
            None => false,
        });
    }

    fn set_state(&self, state: TransportState) {
        let previous = self.state.swap(state as u8, Ordering::AcqRel);
        if previous != state as u8 {
            log::debug!("[Transport] {} -> {}", TransportState::from_u8(previous), state);
            self.notify(|l| l.on_state_change(state));
        }
    }

    fn publish(&self, beat: f64) {
        self.position.store(beat, Ordering::Release);
    }

    fn cycle_for_driver(control: &ControlState) -> Option<CycleRegion> {
        control.cycle.enabled.then_some(control.cycle)
    }

    fn gate(&self, op: &str) -> bool {
        if self.ctx.flags.transport_allowed() {
            return true;
        }
        log::debug!(
            "[Transport] {} ignored (plugin install: {}, graph stable: {})",
            op,
            self.ctx.flags.plugin_install_in_progress.get(),
            self.ctx.flags.graph_stable.get()
        );
        false
    }

    // ─── Control operations ─────────────────────────────────────────────────

    /// Start playback from the resume beat (0 after stop)
    pub fn play(&self) {
        self.start_rolling(TransportState::Playing, "play");
    }

    /// Start playback with capture armed
    pub fn record(&self) {
        self.start_rolling(TransportState::Recording, "record");
    }

    fn start_rolling(&self, target: TransportState, op: &str) {
        if !self.gate(op) {
            return;
        }
        let mut control = self.control.lock();
        if self.state().is_rolling() {
            self.set_state(target);
            return;
        }

        let now = self.ctx.now();
        let current = self.anchor.read();
        let beat = current.start_beat;
        self.anchor.write(TransportAnchor::running(beat, now, current.tempo));
        self.publish(beat);
        self.set_state(target);

        control.cycle_prescheduled = self
            .driver
            .start_playback(beat, Self::cycle_for_driver(&control));
        log::info!("[Transport] {} from beat {:.3}", op, beat);
    }

    /// Freeze at the exact beat derived from elapsed wall time
    pub fn pause(&self) {
        let mut control = self.control.lock();
        if !self.state().is_rolling() {
            return;
        }

        let now = self.ctx.now();
        let current = self.anchor.read();
        let beat = current.beat_at(now);
        self.anchor.write(TransportAnchor::frozen(beat, now, current.tempo));
        self.publish(beat);

        self.driver.stop_playback();
        control.cycle_prescheduled = false;
        self.set_state(TransportState::Paused);
        log::info!("[Transport] Paused at beat {:.3}", beat);
    }

    /// Stop and return to beat 0
    pub fn stop(&self) {
        let mut control = self.control.lock();
        if self.state().is_rolling() {
            self.driver.stop_playback();
        }

        let tempo = self.anchor.read().tempo;
        self.anchor.write(TransportAnchor::frozen(0.0, self.ctx.now(), tempo));
        self.publish(0.0);
        control.cycle_prescheduled = false;
        self.set_state(TransportState::Stopped);
    }

    /// Move the playhead; while rolling this is a transport-safe jump
    pub fn seek_to_beat(&self, beat: f64) {
        if !self.gate("seek") {
            return;
        }
        let mut control = self.control.lock();
        let beat = beat.max(0.0);

        if self.state().is_rolling() {
            self.jump_locked(&mut control, beat);
        } else {
            let tempo = self.anchor.read().tempo;
            self.anchor.write(TransportAnchor::frozen(beat, self.ctx.now(), tempo));
            self.publish(beat);
        }
    }

    /// Set the loop region, keeping its enabled state
    pub fn set_cycle_region(&self, start: f64, end: f64) -> EngineResult<()> {
        let mut region = CycleRegion::new(start, end)?;
        let mut control = self.control.lock();
        region.enabled = control.cycle.enabled;
        control.cycle = region;
        control.cycle_prescheduled = false;
        log::debug!("[Transport] Cycle region {:.3}..{:.3}", start, end);
        Ok(())
    }

    pub fn set_cycle_enabled(&self, enabled: bool) {
        let mut control = self.control.lock();
        control.cycle.enabled = enabled;
        control.cycle_prescheduled = false;
    }

    /// Change tempo without moving the playhead
    pub fn set_tempo(&self, bpm: f64) -> EngineResult<()> {
        let scheduling = self.scheduling.read().with_tempo(bpm)?;
        let _control = self.control.lock();

        let now = self.ctx.now();
        let current = self.anchor.read();
        let beat = current.beat_at(now);
        self.anchor.write(TransportAnchor {
            start_beat: beat,
            start_wall_time: now,
            tempo: bpm,
            is_playing: current.is_playing,
        });
        self.scheduling.write(scheduling);
        log::info!("[Transport] Tempo {:.2} BPM at beat {:.3}", bpm, beat);
        Ok(())
    }

    pub fn set_time_signature(&self, time_signature: TimeSignature) -> EngineResult<()> {
        let scheduling = self.scheduling.read().with_time_signature(time_signature)?;
        self.scheduling.write(scheduling);
        Ok(())
    }

    /// Replace the scheduling context after a format change
    pub fn set_scheduling_context(&self, scheduling: SchedulingContext) -> EngineResult<()> {
        if (scheduling.tempo() - self.tempo()).abs() > f64::EPSILON {
            self.set_tempo(scheduling.tempo())?;
        }
        self.scheduling.write(scheduling);
        Ok(())
    }

    /// Jump without an audible gap where possible
    pub fn transport_safe_jump(&self, to_beat: f64) {
        let mut control = self.control.lock();
        self.jump_locked(&mut control, to_beat.max(0.0));
    }

    fn jump_locked(&self, control: &mut ControlState, to_beat: f64) {
        let now = self.ctx.now();
        let previous = self.anchor.read();
        let from_beat = previous.beat_at(now);

        self.jump_generation.fetch_add(1, Ordering::AcqRel);
        self.anchor.write(TransportAnchor {
            start_beat: to_beat,
            start_wall_time: now,
            tempo: previous.tempo,
            is_playing: previous.is_playing,
        });
        self.publish(to_beat);
        self.notify(|l| l.on_jump(from_beat, to_beat));

        if previous.is_playing {
            let seamless = control.cycle.enabled
                && control.cycle_prescheduled
                && (to_beat - control.cycle.start).abs() < CYCLE_START_TOLERANCE;
            if seamless {
                log::debug!("[Transport] Cycle wrap {:.3} -> {:.3}", from_beat, to_beat);
            } else {
                self.driver.stop_playback();
                control.cycle_prescheduled = self
                    .driver
                    .start_playback(to_beat, Self::cycle_for_driver(control));
                self.restart_count.increment();
                log::debug!("[Transport] Jump {:.3} -> {:.3} (restarted)", from_beat, to_beat);
            }
        }
        self.jump_count.increment();
    }

    // ─── Position publisher step ────────────────────────────────────────────

    /// Sample the position without touching shared state
    pub fn sample_tick(&self) -> Option<PendingTick> {
        let generation = self.jump_generation.load(Ordering::Acquire);
        let anchor = self.anchor.read();
        if !anchor.is_playing {
            return None;
        }
        Some(PendingTick {
            generation,
            anchor,
            beat: anchor.beat_at(self.ctx.now()),
        })
    }

    /// Publish a sampled position or wrap the cycle
    ///
    /// A sample whose jump generation or anchor changed in the meantime
    /// publishes nothing.
    pub fn commit_tick(&self, pending: PendingTick) -> TickOutcome {
        let mut control = self.control.lock();
        if self.jump_generation.load(Ordering::Acquire) != pending.generation
            || self.anchor.read() != pending.anchor
        {
            log::trace!("[Transport] Discarded stale tick at beat {:.3}", pending.beat);
            return TickOutcome::Stale;
        }

        let beat = pending.beat;
        if control.cycle.should_wrap(beat, self.cycle_epsilon) {
            let to = control.cycle.start;
            self.jump_locked(&mut control, to);
            return TickOutcome::Wrapped { from: beat, to };
        }

        self.publish(beat);
        TickOutcome::Advanced(beat)
    }

    /// One publisher step
    pub fn tick(&self) -> TickOutcome {
        match self.sample_tick() {
            Some(pending) => self.commit_tick(pending),
            None => TickOutcome::Idle,
        }
    }

    // ─── Queries (any thread) ───────────────────────────────────────────────

    /// Current beat; never blocks
    #[inline]
    pub fn current_beat(&self) -> f64 {
        match self.anchor.try_read() {
            Some(anchor) => anchor.beat_at(self.ctx.now()),
            None => self.position.load(Ordering::Acquire),
        }
    }

    #[inline]
    pub fn is_playing(&self) -> bool {
        self.state().is_rolling()
    }

    #[inline]
    pub fn state(&self) -> TransportState {
        TransportState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn position(&self) -> PlaybackPosition {
        PlaybackPosition::new(self.current_beat())
    }

    /// Beat last written by the publisher or a control operation
    pub fn published_beat(&self) -> f64 {
        self.position.load(Ordering::Acquire)
    }

    pub fn anchor(&self) -> TransportAnchor {
        self.anchor.read()
    }

    pub fn try_anchor(&self) -> Option<TransportAnchor> {
        self.anchor.try_read()
    }

    pub fn scheduling(&self) -> SchedulingContext {
        self.scheduling.read()
    }

    pub fn tempo(&self) -> f64 {
        self.anchor.read().tempo
    }

    pub fn cycle(&self) -> CycleRegion {
        self.control.lock().cycle
    }

    pub fn jump_generation(&self) -> u64 {
        self.jump_generation.load(Ordering::Acquire)
    }

    pub fn jump_count(&self) -> u64 {
        self.jump_count.get()
    }

    /// Jumps that stopped and rescheduled playback
    pub fn restart_count(&self) -> u64 {
        self.restart_count.get()
    }
}

impl fmt::Debug for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transport")
            .field("state", &self.state())
            .field("beat", &self.published_beat())
            .field("jumps", &self.jump_count())
            .finish()
    }
}
