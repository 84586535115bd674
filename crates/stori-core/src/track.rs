//! Track and project records
//!
//! Immutable-per-read data handed to the core by the project layer. The core
//! reacts to these records but never persists them.

use serde::{Deserialize, Serialize};

use crate::time::TimeSignature;

/// Unique track identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TrackId(pub u64);

impl std::fmt::Display for TrackId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "track#{}", self.0)
    }
}

/// Output bus identifier (0 = master)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BusId(pub u32);

impl BusId {
    pub const MASTER: Self = Self(0);
}

impl Default for BusId {
    fn default() -> Self {
        Self::MASTER
    }
}

/// Instrument kind feeding a track's source node
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub enum InstrumentKind {
    Sampler,
    DrumKit,
    AudioUnit,
    /// Audio track: regions are played directly
    #[default]
    None,
}

impl InstrumentKind {
    pub fn is_instrument(self) -> bool {
        !matches!(self, InstrumentKind::None)
    }

    pub fn label(self) -> &'static str {
        match self {
            InstrumentKind::Sampler => "sampler",
            InstrumentKind::DrumKit => "drum kit",
            InstrumentKind::AudioUnit => "audio unit",
            InstrumentKind::None => "none",
        }
    }
}

/// Insert plugin as stored in the project
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginDescriptor {
    /// Component identifier understood by the plugin host
    pub component: String,
    /// Display name
    pub name: String,
    #[serde(default)]
    pub bypassed: bool,
}

impl PluginDescriptor {
    pub fn new(component: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            component: component.into(),
            name: name.into(),
            bypassed: false,
        }
    }

    pub fn bypassed(mut self) -> Self {
        self.bypassed = true;
        self
    }
}

/// Track as stored in the project
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackRecord {
    pub id: TrackId,
    pub name: String,
    #[serde(default)]
    pub instrument: InstrumentKind,
    #[serde(default)]
    pub plugins: Vec<PluginDescriptor>,
    #[serde(default)]
    pub output_bus: BusId,
}

impl TrackRecord {
    pub fn new(id: u64, name: impl Into<String>) -> Self {
        Self {
            id: TrackId(id),
            name: name.into(),
            instrument: InstrumentKind::None,
            plugins: Vec::new(),
            output_bus: BusId::MASTER,
        }
    }

    pub fn with_instrument(mut self, kind: InstrumentKind) -> Self {
        self.instrument = kind;
        self
    }

    pub fn with_plugin(mut self, plugin: PluginDescriptor) -> Self {
        self.plugins.push(plugin);
        self
    }
}

/// Project snapshot consumed by the load state machine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectData {
    pub name: String,
    pub tempo: f64,
    #[serde(default)]
    pub time_signature: TimeSignature,
    #[serde(default)]
    pub tracks: Vec<TrackRecord>,
}

impl ProjectData {
    pub fn new(name: impl Into<String>, tempo: f64) -> Self {
        Self {
            name: name.into(),
            tempo,
            time_signature: TimeSignature::COMMON,
            tracks: Vec::new(),
        }
    }

    pub fn with_track(mut self, track: TrackRecord) -> Self {
        self.tracks.push(track);
        self
    }

    pub fn plugin_count(&self) -> usize {
        self.tracks.iter().map(|t| t.plugins.len()).sum()
    }
}
