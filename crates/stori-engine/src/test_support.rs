//! Test doubles for unit tests

use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use stori_core::{CycleRegion, EngineConfig, InstrumentKind, PluginDescriptor, TrackId};

use crate::clock::ManualClock;
use crate::context::EngineContext;
use crate::error::{EngineError, EngineResult};
use crate::plugin::{Instrument, InstrumentSlot, PluginUnit, UnitFactory};
use crate::transport::{PlaybackDriver, TransportListener, TransportState};

pub fn test_context() -> (Arc<ManualClock>, Arc<EngineContext>) {
    let clock = Arc::new(ManualClock::new());
    let ctx = Arc::new(EngineContext::new(clock.clone(), &EngineConfig::default()));
    (clock, ctx)
}

#[derive(Default)]
pub struct CountingDriver {
    starts: AtomicU64,
    stops: AtomicU64,
    last_start: Mutex<Option<f64>>,
}

impl CountingDriver {
    pub fn starts(&self) -> u64 {
        self.starts.load(Ordering::SeqCst)
    }

    pub fn stops(&self) -> u64 {
        self.stops.load(Ordering::SeqCst)
    }

    pub fn last_start_beat(&self) -> Option<f64> {
        *self.last_start.lock()
    }
}

impl PlaybackDriver for CountingDriver {
    fn start_playback(&self, from_beat: f64, cycle: Option<CycleRegion>) -> bool {
        self.starts.fetch_add(1, Ordering::SeqCst);
        *self.last_start.lock() = Some(from_beat);
        cycle.is_some()
    }

    fn stop_playback(&self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Default)]
pub struct JumpRecorder {
    jumps: Mutex<Vec<(f64, f64)>>,
    states: Mutex<Vec<TransportState>>,
}

impl JumpRecorder {
    pub fn jumps(&self) -> Vec<(f64, f64)> {
        self.jumps.lock().clone()
    }

    pub fn states(&self) -> Vec<TransportState> {
        self.states.lock().clone()
    }
}

impl TransportListener for JumpRecorder {
    fn on_jump(&self, from_beat: f64, to_beat: f64) {
        self.jumps.lock().push((from_beat, to_beat));
    }

    fn on_state_change(&self, state: TransportState) {
        self.states.lock().push(state);
    }
}

pub struct FixedLatencyPlugin {
    name: String,
    latency: f64,
    resets: AtomicU64,
}

impl FixedLatencyPlugin {
    pub fn new(name: &str, latency: f64) -> Self {
        Self {
            name: name.to_string(),
            latency,
            resets: AtomicU64::new(0),
        }
    }

    pub fn resets(&self) -> u64 {
        self.resets.load(Ordering::SeqCst)
    }
}

impl PluginUnit for FixedLatencyPlugin {
    fn name(&self) -> &str {
        &self.name
    }

    fn latency_seconds(&self) -> f64 {
        self.latency
    }

    fn reset(&self) {
        self.resets.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Default)]
pub struct NoteCounter {
    on: AtomicU64,
    off: AtomicU64,
    all_off: AtomicU64,
    resets: AtomicU64,
}

impl NoteCounter {
    pub fn notes_on(&self) -> u64 {
        self.on.load(Ordering::SeqCst)
    }

    pub fn notes_off(&self) -> u64 {
        self.off.load(Ordering::SeqCst)
    }

    pub fn all_off_count(&self) -> u64 {
        self.all_off.load(Ordering::SeqCst)
    }

    pub fn resets(&self) -> u64 {
        self.resets.load(Ordering::SeqCst)
    }
}

impl Instrument for NoteCounter {
    fn reset(&self) {
        self.resets.fetch_add(1, Ordering::SeqCst);
    }

    fn note_on(&self, _note: u8, _velocity: u8) {
        self.on.fetch_add(1, Ordering::SeqCst);
    }

    fn note_off(&self, _note: u8) {
        self.off.fetch_add(1, Ordering::SeqCst);
    }

    fn all_notes_off(&self) {
        self.all_off.fetch_add(1, Ordering::SeqCst);
    }
}

/// Plugins get latency by component name (seconds, default 0)
#[derive(Default)]
pub struct TestFactory {
    latencies: HashMap<String, f64>,
    failing: Mutex<HashSet<String>>,
    pub instantiated: AtomicU64,
}

impl TestFactory {
    pub fn with_latency(mut self, component: &str, seconds: f64) -> Self {
        self.latencies.insert(component.to_string(), seconds);
        self
    }

    pub fn fail(&self, component: &str) {
        self.failing.lock().insert(component.to_string());
    }
}

impl UnitFactory for TestFactory {
    fn instantiate_plugin(&self, descriptor: &PluginDescriptor) -> EngineResult<Arc<dyn PluginUnit>> {
        if self.failing.lock().contains(&descriptor.component) {
            return Err(EngineError::Plugin(format!("{} failed to load", descriptor.component)));
        }
        self.instantiated.fetch_add(1, Ordering::SeqCst);
        let latency = self.latencies.get(&descriptor.component).copied().unwrap_or(0.0);
        Ok(Arc::new(FixedLatencyPlugin::new(&descriptor.name, latency)))
    }

    fn instantiate_instrument(&self, kind: InstrumentKind, _track: TrackId) -> EngineResult<InstrumentSlot> {
        let unit: Arc<dyn Instrument> = Arc::new(NoteCounter::default());
        Ok(match kind {
            InstrumentKind::Sampler => InstrumentSlot::Sampler(unit),
            InstrumentKind::DrumKit => InstrumentSlot::DrumKit(unit),
            InstrumentKind::AudioUnit => InstrumentSlot::AudioUnit(unit),
            InstrumentKind::None => InstrumentSlot::None,
        })
    }
}
