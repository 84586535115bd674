//! Plugin and instrument boundary
//!
//! Units are opaque: the core sequences their lifecycle (instantiate, reset,
//! connect) and reads their reported latency, never their DSP.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use stori_core::{InstrumentKind, PluginDescriptor, TrackId};

use crate::error::EngineResult;
use crate::render::{NodeKey, NodeRole};
use crate::transport::{TransportListener, TransportState};

/// Identifies a plugin slot across chain edits
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PluginSlotId(pub u64);

impl fmt::Display for PluginSlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "slot#{}", self.0)
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// UNIT TRAITS
// ═══════════════════════════════════════════════════════════════════════════

/// Effect plugin instance
pub trait PluginUnit: Send + Sync {
    fn name(&self) -> &str;

    /// Processing latency (seconds)
    fn latency_seconds(&self) -> f64;

    /// Clear internal DSP state (delay lines, filters)
    fn reset(&self);
}

/// Instrument instance driven by note events
pub trait Instrument: Send + Sync {
    fn reset(&self);

    fn note_on(&self, note: u8, velocity: u8);

    fn note_off(&self, note: u8);

    fn all_notes_off(&self);
}

/// Creates units from project descriptors
pub trait UnitFactory: Send + Sync {
    fn instantiate_plugin(&self, descriptor: &PluginDescriptor) -> EngineResult<Arc<dyn PluginUnit>>;

    fn instantiate_instrument(&self, kind: InstrumentKind, track: TrackId) -> EngineResult<InstrumentSlot>;
}

// ═══════════════════════════════════════════════════════════════════════════
// INSTRUMENT SLOT
// ═══════════════════════════════════════════════════════════════════════════

/// Instrument feeding a track, one variant per kind
#[derive(Clone, Default)]
pub enum InstrumentSlot {
    Sampler(Arc<dyn Instrument>),
    DrumKit(Arc<dyn Instrument>),
    AudioUnit(Arc<dyn Instrument>),
    /// Audio track: the region player is the source
    #[default]
    None,
}

impl InstrumentSlot {
    pub fn kind(&self) -> InstrumentKind {
        match self {
            InstrumentSlot::Sampler(_) => InstrumentKind::Sampler,
            InstrumentSlot::DrumKit(_) => InstrumentKind::DrumKit,
            InstrumentSlot::AudioUnit(_) => InstrumentKind::AudioUnit,
            InstrumentSlot::None => InstrumentKind::None,
        }
    }

    pub fn instrument(&self) -> Option<&Arc<dyn Instrument>> {
        match self {
            InstrumentSlot::Sampler(unit)
            | InstrumentSlot::DrumKit(unit)
            | InstrumentSlot::AudioUnit(unit) => Some(unit),
            InstrumentSlot::None => None,
        }
    }

    /// Node the track's signal starts from
    pub fn source_node(&self, track: TrackId) -> NodeKey {
        NodeKey::new(track, NodeRole::Source(self.kind()))
    }

    pub fn reset(&self) {
        if let Some(unit) = self.instrument() {
            unit.reset();
        }
    }
}

impl fmt::Debug for InstrumentSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "InstrumentSlot({})", self.kind().label())
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// EFFECTS CHAIN
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Clone)]
pub struct PluginSlot {
    pub id: PluginSlotId,
    pub unit: Arc<dyn PluginUnit>,
    pub bypassed: bool,
}

impl PluginSlot {
    pub fn node(&self, track: TrackId) -> NodeKey {
        NodeKey::new(track, NodeRole::Plugin(self.id))
    }

    /// Latency contributed to the track; zero when bypassed
    pub fn latency_samples(&self, sample_rate: f64) -> u64 {
        if self.bypassed {
            return 0;
        }
        (self.unit.latency_seconds().max(0.0) * sample_rate).round() as u64
    }
}

impl fmt::Debug for PluginSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginSlot")
            .field("id", &self.id)
            .field("name", &self.unit.name())
            .field("bypassed", &self.bypassed)
            .finish()
    }
}

/// Ordered insert chain; `realized` while the bracketing mixers exist
#[derive(Debug, Clone, Default)]
pub struct EffectsChain {
    pub slots: Vec<PluginSlot>,
    pub realized: bool,
}

impl EffectsChain {
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn has_active(&self) -> bool {
        self.slots.iter().any(|s| !s.bypassed)
    }

    pub fn active(&self) -> impl Iterator<Item = &PluginSlot> {
        self.slots.iter().filter(|s| !s.bypassed)
    }

    pub fn slot(&self, id: PluginSlotId) -> Option<&PluginSlot> {
        self.slots.iter().find(|s| s.id == id)
    }

    pub fn slot_mut(&mut self, id: PluginSlotId) -> Option<&mut PluginSlot> {
        self.slots.iter_mut().find(|s| s.id == id)
    }

    /// Cumulative latency of active plugins (samples)
    pub fn latency_samples(&self, sample_rate: f64) -> u64 {
        self.slots.iter().map(|s| s.latency_samples(sample_rate)).sum()
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// INSTRUMENT REGISTRY
// ═══════════════════════════════════════════════════════════════════════════

/// Track → instrument lookup for note routing
#[derive(Default)]
pub struct InstrumentRegistry {
    instruments: RwLock<HashMap<TrackId, Arc<dyn Instrument>>>,
}

impl InstrumentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, track: TrackId, instrument: Arc<dyn Instrument>) {
        self.instruments.write().insert(track, instrument);
    }

    pub fn unregister(&self, track: TrackId) -> Option<Arc<dyn Instrument>> {
        self.instruments.write().remove(&track)
    }

    pub fn get(&self, track: TrackId) -> Option<Arc<dyn Instrument>> {
        self.instruments.read().get(&track).cloned()
    }

    pub fn len(&self) -> usize {
        self.instruments.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.instruments.read().is_empty()
    }

    pub fn clear(&self) {
        self.instruments.write().clear();
    }

    /// Route a note-on; `false` if the track has no instrument
    pub fn note_on(&self, track: TrackId, note: u8, velocity: u8) -> bool {
        match self.instruments.read().get(&track) {
            Some(instrument) => {
                instrument.note_on(note, velocity);
                true
            }
            None => false,
        }
    }

    pub fn note_off(&self, track: TrackId, note: u8) -> bool {
        match self.instruments.read().get(&track) {
            Some(instrument) => {
                instrument.note_off(note);
                true
            }
            None => false,
        }
    }

    pub fn all_notes_off(&self) {
        for instrument in self.instruments.read().values() {
            instrument.all_notes_off();
        }
    }
}

impl TransportListener for InstrumentRegistry {
    fn on_jump(&self, _from_beat: f64, _to_beat: f64) {
        self.all_notes_off();
    }

    fn on_state_change(&self, state: TransportState) {
        if matches!(state, TransportState::Stopped | TransportState::Paused) {
            self.all_notes_off();
        }
    }
}

impl fmt::Debug for InstrumentRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstrumentRegistry")
            .field("instruments", &self.len())
            .finish()
    }
}
