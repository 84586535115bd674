//! Scheduling context and musical time
//!
//! [`SchedulingContext`] bundles sample rate, tempo and time signature with
//! precomputed conversion factors. It is a plain `Copy` value: a tempo or
//! format change builds a new context instead of mutating shared timing
//! state, so the render thread can hold a copy without synchronization.

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};

/// Lowest tempo the transport accepts
pub const MIN_TEMPO: f64 = 1.0;

/// Standard MIDI resolution used for display positions
pub const TICKS_PER_BEAT: u32 = 960;

// ═══════════════════════════════════════════════════════════════════════════
// TIME SIGNATURE
// ═══════════════════════════════════════════════════════════════════════════

/// Musical time signature
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeSignature {
    /// Numerator (beats per bar)
    pub numerator: u8,
    /// Denominator (note value that gets one beat)
    pub denominator: u8,
}

impl Default for TimeSignature {
    fn default() -> Self {
        Self::COMMON
    }
}

impl TimeSignature {
    /// Common time (4/4)
    pub const COMMON: Self = Self {
        numerator: 4,
        denominator: 4,
    };

    /// Waltz time (3/4)
    pub const WALTZ: Self = Self {
        numerator: 3,
        denominator: 4,
    };

    /// Create a validated time signature
    pub fn new(numerator: u8, denominator: u8) -> CoreResult<Self> {
        if numerator == 0 || denominator == 0 || !denominator.is_power_of_two() {
            return Err(CoreError::InvalidTimeSignature(numerator, denominator));
        }
        Ok(Self {
            numerator,
            denominator,
        })
    }

    /// Beats in one bar
    #[inline]
    pub fn beats_per_bar(self) -> f64 {
        self.numerator as f64
    }
}

impl std::fmt::Display for TimeSignature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.numerator, self.denominator)
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// SCHEDULING CONTEXT
// ═══════════════════════════════════════════════════════════════════════════

/// Immutable timing bundle with precomputed beat/sample/second factors
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SchedulingContext {
    sample_rate: f64,
    tempo: f64,
    time_signature: TimeSignature,
    seconds_per_beat: f64,
    samples_per_beat: f64,
    seconds_per_bar: f64,
    samples_per_bar: f64,
}

impl SchedulingContext {
    pub fn new(sample_rate: f64, tempo: f64, time_signature: TimeSignature) -> CoreResult<Self> {
        if !sample_rate.is_finite() || sample_rate <= 0.0 {
            return Err(CoreError::InvalidSampleRate(sample_rate));
        }
        if !tempo.is_finite() || tempo < MIN_TEMPO {
            return Err(CoreError::InvalidTempo(tempo));
        }

        let seconds_per_beat = 60.0 / tempo;
        let samples_per_beat = seconds_per_beat * sample_rate;
        let beats_per_bar = time_signature.beats_per_bar();

        Ok(Self {
            sample_rate,
            tempo,
            time_signature,
            seconds_per_beat,
            samples_per_beat,
            seconds_per_bar: seconds_per_beat * beats_per_bar,
            samples_per_bar: samples_per_beat * beats_per_bar,
        })
    }

    /// Same format, new tempo
    pub fn with_tempo(&self, tempo: f64) -> CoreResult<Self> {
        Self::new(self.sample_rate, tempo, self.time_signature)
    }

    /// Same tempo, new sample rate
    pub fn with_sample_rate(&self, sample_rate: f64) -> CoreResult<Self> {
        Self::new(sample_rate, self.tempo, self.time_signature)
    }

    pub fn with_time_signature(&self, time_signature: TimeSignature) -> CoreResult<Self> {
        Self::new(self.sample_rate, self.tempo, time_signature)
    }

    #[inline]
    pub fn sample_rate(&self) -> f64 {
        self.sample_rate
    }

    #[inline]
    pub fn tempo(&self) -> f64 {
        self.tempo
    }

    #[inline]
    pub fn time_signature(&self) -> TimeSignature {
        self.time_signature
    }

    #[inline]
    pub fn seconds_per_beat(&self) -> f64 {
        self.seconds_per_beat
    }

    #[inline]
    pub fn samples_per_beat(&self) -> f64 {
        self.samples_per_beat
    }

    #[inline]
    pub fn seconds_per_bar(&self) -> f64 {
        self.seconds_per_bar
    }

    #[inline]
    pub fn samples_per_bar(&self) -> f64 {
        self.samples_per_bar
    }

    #[inline]
    pub fn beats_to_samples(&self, beats: f64) -> f64 {
        beats * self.samples_per_beat
    }

    #[inline]
    pub fn samples_to_beats(&self, samples: f64) -> f64 {
        samples / self.samples_per_beat
    }

    #[inline]
    pub fn beats_to_seconds(&self, beats: f64) -> f64 {
        beats * self.seconds_per_beat
    }

    #[inline]
    pub fn seconds_to_beats(&self, seconds: f64) -> f64 {
        seconds / self.seconds_per_beat
    }

    #[inline]
    pub fn seconds_to_samples(&self, seconds: f64) -> f64 {
        seconds * self.sample_rate
    }
}

impl Default for SchedulingContext {
    fn default() -> Self {
        let seconds_per_beat = 0.5;
        Self {
            sample_rate: 48000.0,
            tempo: 120.0,
            time_signature: TimeSignature::COMMON,
            seconds_per_beat,
            samples_per_beat: 24000.0,
            seconds_per_bar: 2.0,
            samples_per_bar: 96000.0,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// POSITIONS
// ═══════════════════════════════════════════════════════════════════════════

/// Authoritative playback position in beats
#[derive(Debug, Clone, Copy, Default, PartialEq, PartialOrd, Serialize, Deserialize)]
pub struct PlaybackPosition {
    pub beats: f64,
}

impl PlaybackPosition {
    pub const ZERO: Self = Self { beats: 0.0 };

    pub fn new(beats: f64) -> Self {
        Self { beats }
    }

    #[inline]
    pub fn seconds(&self, ctx: &SchedulingContext) -> f64 {
        ctx.beats_to_seconds(self.beats)
    }

    #[inline]
    pub fn samples(&self, ctx: &SchedulingContext) -> u64 {
        ctx.beats_to_samples(self.beats.max(0.0)).round() as u64
    }

    /// Bars/beats/ticks form for display
    pub fn display(&self, ctx: &SchedulingContext) -> MusicalPosition {
        MusicalPosition::from_beats(self.beats, ctx.time_signature())
    }
}

/// Musical position (bars, beats, ticks), 0-indexed internally
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MusicalPosition {
    pub bar: u32,
    pub beat: u8,
    pub tick: u16,
}

impl MusicalPosition {
    pub fn from_beats(beats: f64, time_signature: TimeSignature) -> Self {
        let total_ticks = (beats.max(0.0) * TICKS_PER_BEAT as f64).round() as u64;
        let ticks_per_bar = TICKS_PER_BEAT as u64 * time_signature.numerator as u64;

        let bar = (total_ticks / ticks_per_bar) as u32;
        let remaining = total_ticks % ticks_per_bar;

        Self {
            bar,
            beat: (remaining / TICKS_PER_BEAT as u64) as u8,
            tick: (remaining % TICKS_PER_BEAT as u64) as u16,
        }
    }
}

impl std::fmt::Display for MusicalPosition {
    /// 1-indexed `bar.beat.tick`
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{:03}", self.bar + 1, self.beat + 1, self.tick)
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// CYCLE REGION
// ═══════════════════════════════════════════════════════════════════════════

/// Loop (cycle) region in beats, `start..end`
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct CycleRegion {
    pub start: f64,
    pub end: f64,
    pub enabled: bool,
}

impl CycleRegion {
    pub fn new(start: f64, end: f64) -> CoreResult<Self> {
        if !start.is_finite() || !end.is_finite() || start < 0.0 || end <= start {
            return Err(CoreError::InvalidCycleRegion { start, end });
        }
        Ok(Self {
            start,
            end,
            enabled: false,
        })
    }

    #[inline]
    pub fn length(&self) -> f64 {
        self.end - self.start
    }

    /// Whether `beat` has reached the wrap point
    #[inline]
    pub fn should_wrap(&self, beat: f64, epsilon: f64) -> bool {
        self.enabled && self.end > self.start && beat >= self.end - epsilon
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_context_derived_factors() {
        let ctx = SchedulingContext::new(48000.0, 120.0, TimeSignature::COMMON).unwrap();

        assert_relative_eq!(ctx.seconds_per_beat(), 0.5);
        assert_relative_eq!(ctx.samples_per_beat(), 24000.0);
        assert_relative_eq!(ctx.seconds_per_bar(), 2.0);
        assert_relative_eq!(ctx.samples_per_bar(), 96000.0);
        assert_eq!(ctx, SchedulingContext::default());
    }

    #[test]
    fn test_context_rejects_bad_input() {
        assert!(SchedulingContext::new(48000.0, 0.5, TimeSignature::COMMON).is_err());
        assert!(SchedulingContext::new(0.0, 120.0, TimeSignature::COMMON).is_err());
        assert!(SchedulingContext::new(48000.0, f64::NAN, TimeSignature::COMMON).is_err());
        assert!(TimeSignature::new(4, 3).is_err());
        assert!(TimeSignature::new(0, 4).is_err());
    }

    #[test]
    fn test_with_tempo_builds_new_value() {
        let ctx = SchedulingContext::default();
        let faster = ctx.with_tempo(240.0).unwrap();

        assert_relative_eq!(ctx.seconds_per_beat(), 0.5);
        assert_relative_eq!(faster.seconds_per_beat(), 0.25);
        assert_relative_eq!(faster.beats_to_samples(2.0), 24000.0);
    }

    #[test]
    fn test_conversions_round_trip_through_seconds() {
        let ctx = SchedulingContext::new(44100.0, 90.0, TimeSignature::WALTZ).unwrap();
        let beats = 7.25;
        let samples = ctx.beats_to_samples(beats);

        assert_relative_eq!(ctx.samples_to_beats(samples), beats, epsilon = 1e-9);
        assert_relative_eq!(ctx.seconds_to_samples(ctx.beats_to_seconds(beats)), samples, epsilon = 1e-6);
        assert_relative_eq!(ctx.seconds_per_bar(), 2.0);
    }

    #[test]
    fn test_musical_position_display() {
        let ctx = SchedulingContext::default();
        let pos = PlaybackPosition::new(5.5);
        let display = pos.display(&ctx);

        assert_eq!(display.bar, 1);
        assert_eq!(display.beat, 1);
        assert_eq!(display.tick, 480);
        assert_eq!(display.to_string(), "2.2.480");
        assert_eq!(pos.samples(&ctx), 132000);
    }

    #[test]
    fn test_cycle_region_wrap_point() {
        let mut cycle = CycleRegion::new(0.0, 4.0).unwrap();
        assert!(!cycle.should_wrap(3.9995, 0.001));

        cycle.enabled = true;
        assert!(!cycle.should_wrap(3.998, 0.001));
        assert!(cycle.should_wrap(3.9995, 0.001));
        assert!(CycleRegion::new(4.0, 4.0).is_err());
    }
}
