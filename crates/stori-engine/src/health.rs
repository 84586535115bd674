//! Error and health tracking
//!
//! Severity-tagged error log with a health status derived from a rolling
//! window of recent records. Critical conditions latch until a caller
//! acknowledges recovery (graph rebuilt, engine restarted).

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use crate::clock::Clock;

/// Errors in the window needed to report `Unhealthy`
pub const UNHEALTHY_ERROR_COUNT: usize = 3;
/// Warnings in the window needed to report `Degraded`
pub const DEGRADED_WARNING_COUNT: usize = 3;

// ═══════════════════════════════════════════════════════════════════════════
// TYPES
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ErrorSeverity {
    Info,
    Warning,
    Error,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorComponent {
    Engine,
    Format,
    Node,
    Track,
    File,
    Plugin,
    Midi,
    Resource,
    Operation,
}

impl ErrorComponent {
    pub fn label(self) -> &'static str {
        match self {
            ErrorComponent::Engine => "engine",
            ErrorComponent::Format => "format",
            ErrorComponent::Node => "node",
            ErrorComponent::Track => "track",
            ErrorComponent::File => "file",
            ErrorComponent::Plugin => "plugin",
            ErrorComponent::Midi => "midi",
            ErrorComponent::Resource => "resource",
            ErrorComponent::Operation => "operation",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
    Critical,
}

impl HealthStatus {
    /// Requires an explicit recovery action
    pub fn needs_recovery(self) -> bool {
        matches!(self, HealthStatus::Critical)
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Degraded => "degraded",
            HealthStatus::Unhealthy => "unhealthy",
            HealthStatus::Critical => "critical",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ErrorRecord {
    pub severity: ErrorSeverity,
    pub component: ErrorComponent,
    pub message: String,
    /// Clock reading when recorded (seconds)
    pub at: f64,
}

impl fmt::Display for ErrorRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{:>9.3}s] {:?} {}: {}",
            self.at,
            self.severity,
            self.component.label(),
            self.message
        )
    }
}

/// Per-severity totals since creation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ErrorCounts {
    pub info: u64,
    pub warning: u64,
    pub error: u64,
    pub critical: u64,
}

// ═══════════════════════════════════════════════════════════════════════════
// TRACKER
// ═══════════════════════════════════════════════════════════════════════════

struct TrackerState {
    history: VecDeque<ErrorRecord>,
    counts: ErrorCounts,
    critical_latched: bool,
    /// Records older than this are ignored for health after a recovery
    recovered_at: f64,
}

pub struct ErrorTracker {
    clock: Arc<dyn Clock>,
    window_secs: f64,
    max_history: usize,
    state: Mutex<TrackerState>,
}

impl ErrorTracker {
    pub fn new(clock: Arc<dyn Clock>, window_secs: f64, max_history: usize) -> Self {
        Self {
            clock,
            window_secs,
            max_history: max_history.max(1),
            state: Mutex::new(TrackerState {
                history: VecDeque::new(),
                counts: ErrorCounts::default(),
                critical_latched: false,
                recovered_at: f64::NEG_INFINITY,
            }),
        }
    }

    /// Record an error and mirror it to the log
    pub fn record(&self, severity: ErrorSeverity, component: ErrorComponent, message: impl Into<String>) {
        let message = message.into();
        match severity {
            ErrorSeverity::Info => log::info!("[Health] {}: {}", component.label(), message),
            ErrorSeverity::Warning => log::warn!("[Health] {}: {}", component.label(), message),
            ErrorSeverity::Error | ErrorSeverity::Critical => {
                log::error!("[Health] {:?} {}: {}", severity, component.label(), message)
            }
        }

        let record = ErrorRecord {
            severity,
            component,
            message,
            at: self.clock.now(),
        };

        let mut state = self.state.lock();
        match severity {
            ErrorSeverity::Info => state.counts.info += 1,
            ErrorSeverity::Warning => state.counts.warning += 1,
            ErrorSeverity::Error => state.counts.error += 1,
            ErrorSeverity::Critical => {
                state.counts.critical += 1;
                state.critical_latched = true;
            }
        }
        if state.history.len() == self.max_history {
            state.history.pop_front();
        }
        state.history.push_back(record);
    }

    /// Health derived from the rolling window
    pub fn health(&self) -> HealthStatus {
        let now = self.clock.now();
        let state = self.state.lock();
        if state.critical_latched {
            return HealthStatus::Critical;
        }

        let since = (now - self.window_secs).max(state.recovered_at);
        let (mut errors, mut warnings) = (0usize, 0usize);
        for record in state.history.iter().rev().take_while(|r| r.at >= since) {
            match record.severity {
                ErrorSeverity::Critical => return HealthStatus::Critical,
                ErrorSeverity::Error => errors += 1,
                ErrorSeverity::Warning => warnings += 1,
                ErrorSeverity::Info => {}
            }
        }

        if errors >= UNHEALTHY_ERROR_COUNT {
            HealthStatus::Unhealthy
        } else if errors > 0 || warnings >= DEGRADED_WARNING_COUNT {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        }
    }

    /// Most recent records, newest last
    pub fn recent(&self, limit: usize) -> Vec<ErrorRecord> {
        let state = self.state.lock();
        let skip = state.history.len().saturating_sub(limit);
        state.history.iter().skip(skip).cloned().collect()
    }

    pub fn counts(&self) -> ErrorCounts {
        self.state.lock().counts
    }

    /// Clear the critical latch after a recovery action succeeded
    pub fn acknowledge_recovery(&self) {
        let now = self.clock.now();
        let mut state = self.state.lock();
        if state.critical_latched {
            log::info!("[Health] Recovery acknowledged");
        }
        state.critical_latched = false;
        state.recovered_at = now;
    }
}

impl fmt::Debug for ErrorTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ErrorTracker")
            .field("window_secs", &self.window_secs)
            .field("counts", &self.counts())
            .finish()
    }
}
