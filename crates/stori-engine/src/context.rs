//! Explicit engine context
//!
//! Shared services handed to every component at construction: clock,
//! coordination flags, error tracker, PDC manager and instrument registry.
//! There are no process-wide singletons; tests build their own context.

use std::fmt;
use std::sync::Arc;

use stori_core::EngineConfig;

use crate::clock::Clock;
use crate::error::{EngineError, EngineResult};
use crate::health::ErrorTracker;
use crate::pdc::PdcManager;
use crate::plugin::InstrumentRegistry;
use crate::rt::RtFlag;

// ═══════════════════════════════════════════════════════════════════════════
// FLAGS
// ═══════════════════════════════════════════════════════════════════════════

/// Cross-component coordination flags
#[derive(Debug)]
pub struct EngineFlags {
    /// Cleared by render failures and project loads
    pub graph_stable: RtFlag,
    pub plugin_install_in_progress: RtFlag,
    pub project_ready: RtFlag,
    pub loading: RtFlag,
}

impl Default for EngineFlags {
    fn default() -> Self {
        Self {
            graph_stable: RtFlag::new(true),
            plugin_install_in_progress: RtFlag::new(false),
            project_ready: RtFlag::new(false),
            loading: RtFlag::new(false),
        }
    }
}

impl EngineFlags {
    /// Transport start and seek are allowed
    pub fn transport_allowed(&self) -> bool {
        self.graph_stable.get() && !self.plugin_install_in_progress.get()
    }

    /// Mark a plugin install; the flag clears when the guard drops
    pub fn begin_plugin_install(&self) -> EngineResult<PluginInstallGuard<'_>> {
        if self.plugin_install_in_progress.raise() {
            return Err(EngineError::PluginInstallInProgress);
        }
        Ok(PluginInstallGuard { flags: self })
    }
}

pub struct PluginInstallGuard<'a> {
    flags: &'a EngineFlags,
}

impl Drop for PluginInstallGuard<'_> {
    fn drop(&mut self) {
        self.flags.plugin_install_in_progress.set(false);
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// CONTEXT
// ═══════════════════════════════════════════════════════════════════════════

pub struct EngineContext {
    pub clock: Arc<dyn Clock>,
    pub flags: EngineFlags,
    pub errors: Arc<ErrorTracker>,
    pub pdc: Arc<PdcManager>,
    pub instruments: Arc<InstrumentRegistry>,
}

impl EngineContext {
    pub fn new(clock: Arc<dyn Clock>, config: &EngineConfig) -> Self {
        let errors = Arc::new(ErrorTracker::new(
            clock.clone(),
            config.health.window_secs,
            config.health.max_history,
        ));
        Self {
            clock,
            flags: EngineFlags::default(),
            errors,
            pdc: Arc::new(PdcManager::new(config.graph.max_compensation_samples as u64)),
            instruments: Arc::new(InstrumentRegistry::new()),
        }
    }

    #[inline]
    pub fn now(&self) -> f64 {
        self.clock.now()
    }
}

impl fmt::Debug for EngineContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineContext")
            .field("flags", &self.flags)
            .field("pdc", &self.pdc)
            .finish()
    }
}
