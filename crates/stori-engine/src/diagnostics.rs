//! Diagnostics report for support and debugging

use std::fmt;

use stori_core::TrackId;

use crate::health::{ErrorRecord, HealthStatus};
use crate::load::LoadState;
use crate::recording::PoolStats;
use crate::transport::TransportState;

/// Per-track latency line
#[derive(Debug, Clone, PartialEq)]
pub struct TrackLatencyInfo {
    pub track: TrackId,
    pub latency_samples: u64,
    pub compensation_samples: u64,
}

/// Snapshot of the engine for support/debugging
#[derive(Debug, Clone)]
pub struct DiagnosticsReport {
    pub engine_running: bool,
    pub sample_rate: f64,
    pub attached_nodes: usize,
    pub tracks: usize,
    pub graph_generation: u64,
    pub graph_mutations: u64,
    pub graph_stable: bool,
    pub project_ready: bool,
    pub load_state: LoadState,
    pub transport_state: TransportState,
    pub beat: f64,
    pub jump_count: u64,
    pub max_latency_samples: u64,
    pub latencies: Vec<TrackLatencyInfo>,
    pub validation_issues: Vec<(TrackId, String)>,
    pub recent_errors: Vec<ErrorRecord>,
    pub health: HealthStatus,
    pub pool: PoolStats,
}

impl DiagnosticsReport {
    /// Anything a user should look at
    pub fn has_problems(&self) -> bool {
        !self.engine_running
            || !self.graph_stable
            || !self.validation_issues.is_empty()
            || self.health != HealthStatus::Healthy
    }
}

impl fmt::Display for DiagnosticsReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "=== Stori audio core ===")?;
        writeln!(
            f,
            "Engine: {} @ {} Hz, {} nodes attached",
            if self.engine_running { "running" } else { "STOPPED" },
            self.sample_rate,
            self.attached_nodes
        )?;
        writeln!(
            f,
            "Graph: {} tracks, generation {}, {} rebuilds, {}",
            self.tracks,
            self.graph_generation,
            self.graph_mutations,
            if self.graph_stable { "stable" } else { "UNSTABLE" }
        )?;
        writeln!(
            f,
            "Project: {} ({})",
            if self.project_ready { "ready" } else { "not ready" },
            self.load_state
        )?;
        writeln!(
            f,
            "Transport: {} at beat {:.3}, {} jumps",
            self.transport_state, self.beat, self.jump_count
        )?;

        writeln!(f, "PDC: max latency {} samples", self.max_latency_samples)?;
        for info in self.latencies.iter().filter(|i| i.latency_samples > 0 || i.compensation_samples > 0) {
            writeln!(
                f,
                "  {}: latency {}, compensation {}",
                info.track, info.latency_samples, info.compensation_samples
            )?;
        }

        writeln!(f, "Pool: {}", self.pool)?;
        writeln!(f, "Health: {}", self.health)?;

        if !self.validation_issues.is_empty() {
            writeln!(f, "Validation issues:")?;
            for (track, issue) in &self.validation_issues {
                writeln!(f, "  {track}: {issue}")?;
            }
        }
        if !self.recent_errors.is_empty() {
            writeln!(f, "Recent errors:")?;
            for record in &self.recent_errors {
                writeln!(f, "  {record}")?;
            }
        }
        Ok(())
    }
}
