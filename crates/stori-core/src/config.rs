//! Engine configuration
//!
//! Tunables for the coordination core, persisted as JSON. Every section is
//! `#[serde(default)]` so older files keep loading when fields are added.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::error::{CoreError, CoreResult};
use crate::time::{SchedulingContext, TimeSignature};

/// Top-level engine configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub audio: AudioSettings,
    pub transport: TransportSettings,
    pub graph: GraphSettings,
    pub recording: RecordingPoolSettings,
    pub load: LoadSettings,
    pub health: HealthSettings,
}

/// Sample format and initial timing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioSettings {
    pub sample_rate: u32,
    pub channels: u16,
    pub tempo: f64,
    pub time_signature: TimeSignature,
}

impl Default for AudioSettings {
    fn default() -> Self {
        Self {
            sample_rate: 48000,
            channels: 2,
            tempo: 120.0,
            time_signature: TimeSignature::COMMON,
        }
    }
}

/// Transport clock settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportSettings {
    /// Position publisher tick interval (ms)
    pub publisher_interval_ms: u64,
    /// Distance before the cycle end at which the loop wraps (beats)
    pub cycle_epsilon_beats: f64,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            publisher_interval_ms: 5,
            cycle_epsilon_beats: 0.001,
        }
    }
}

impl TransportSettings {
    pub fn publisher_interval(&self) -> Duration {
        Duration::from_millis(self.publisher_interval_ms.max(1))
    }
}

/// Graph coordinator settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GraphSettings {
    /// Debounce window for coalescing rebuild requests (ms)
    pub rebuild_debounce_ms: u64,
    /// Maximum compensation delay a track can receive (samples)
    pub max_compensation_samples: usize,
}

impl Default for GraphSettings {
    fn default() -> Self {
        Self {
            rebuild_debounce_ms: 30,
            max_compensation_samples: 48000,
        }
    }
}

impl GraphSettings {
    pub fn rebuild_debounce(&self) -> Duration {
        Duration::from_millis(self.rebuild_debounce_ms)
    }
}

/// Recording buffer pool sizing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecordingPoolSettings {
    /// Buffers allocated up front
    pub baseline_buffers: usize,
    /// Samples per buffer
    pub buffer_capacity: usize,
    /// Hard cap on buffers allocated beyond the baseline
    pub overflow_cap: usize,
    /// Buffers added per background pre-allocation pass
    pub overflow_batch: usize,
    /// Occupancy that triggers background pre-allocation (0.0 - 1.0)
    pub high_water: f64,
    /// Occupancy under which overflow buffers are trimmed (0.0 - 1.0)
    pub low_water: f64,
    /// Capture queue depth between callback and writer thread
    pub writer_queue_depth: usize,
}

impl Default for RecordingPoolSettings {
    fn default() -> Self {
        Self {
            baseline_buffers: 32,
            buffer_capacity: 4096,
            overflow_cap: 64,
            overflow_batch: 8,
            high_water: 0.75,
            low_water: 0.25,
            writer_queue_depth: 256,
        }
    }
}

impl RecordingPoolSettings {
    /// Absolute maximum number of buffers the pool may own
    pub fn hard_limit(&self) -> usize {
        self.baseline_buffers + self.overflow_cap
    }
}

/// Project load settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoadSettings {
    /// Attempts to observe the render engine running
    pub engine_start_attempts: u32,
    /// Pause between attempts (ms)
    pub engine_start_poll_ms: u64,
}

impl Default for LoadSettings {
    fn default() -> Self {
        Self {
            engine_start_attempts: 10,
            engine_start_poll_ms: 50,
        }
    }
}

impl LoadSettings {
    pub fn engine_start_poll(&self) -> Duration {
        Duration::from_millis(self.engine_start_poll_ms)
    }
}

/// Health tracking window
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthSettings {
    /// Rolling window used to derive health (seconds)
    pub window_secs: f64,
    /// Error records kept for diagnostics
    pub max_history: usize,
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self {
            window_secs: 60.0,
            max_history: 256,
        }
    }
}

impl EngineConfig {
    /// Load configuration from a JSON file
    pub fn load(path: &Path) -> CoreResult<Self> {
        let contents = fs::read_to_string(path)?;
        let config = Self::from_json(&contents)?;
        log::info!("Loaded engine config from {:?}", path);
        Ok(config)
    }

    /// Save configuration as pretty JSON, creating parent directories
    pub fn save(&self, path: &Path) -> CoreResult<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn from_json(json: &str) -> CoreResult<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Check values that would make the core misbehave
    pub fn validate(&self) -> CoreResult<()> {
        self.scheduling_context()?;
        if self.recording.high_water <= self.recording.low_water {
            log::warn!(
                "Recording pool high water ({}) not above low water ({}), trimming may thrash",
                self.recording.high_water,
                self.recording.low_water
            );
        }
        if self.recording.buffer_capacity == 0 {
            return Err(CoreError::InvalidConfig(
                "recording.buffer_capacity must be non-zero".into(),
            ));
        }
        Ok(())
    }

    /// Initial scheduling context described by the audio section
    pub fn scheduling_context(&self) -> CoreResult<SchedulingContext> {
        SchedulingContext::new(
            self.audio.sample_rate as f64,
            self.audio.tempo,
            self.audio.time_signature,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_json_uses_defaults() {
        let config = EngineConfig::from_json(r#"{ "audio": { "tempo": 90.0 } }"#).unwrap();

        assert_eq!(config.audio.tempo, 90.0);
        assert_eq!(config.audio.sample_rate, 48000);
        assert_eq!(config.graph.rebuild_debounce_ms, 30);
        assert_eq!(config.recording.hard_limit(), 96);
    }

    #[test]
    fn test_invalid_tempo_rejected() {
        assert!(EngineConfig::from_json(r#"{ "audio": { "tempo": 0.0 } }"#).is_err());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("engine.json");

        let mut config = EngineConfig::default();
        config.load.engine_start_attempts = 3;
        config.save(&path).unwrap();

        let loaded = EngineConfig::load(&path).unwrap();
        assert_eq!(loaded, config);
    }
}
