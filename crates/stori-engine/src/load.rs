//! Project load state machine
//!
//! ```text
//! Idle ─► PreparingEngine ─► SettingUpTracks ─► RestoringPlugins
//!              │                                      │
//!              ▼                                      ▼
//!           Failed            Ready ◄─ Validating ◄─ ConnectingInstruments
//! ```
//!
//! Every load is tagged with a generation. `begin` bumps it, so any older
//! load notices on its next step and returns `Stale` without touching the
//! graph. Stages and `begin` share the stage lock: the generation check and
//! the mutation it guards are one atomic section.

use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;

use stori_core::{LoadSettings, ProjectData};

use crate::context::EngineContext;
use crate::error::{EngineError, EngineResult};
use crate::graph::GraphCoordinator;
use crate::health::{ErrorComponent, ErrorSeverity};
use crate::transport::Transport;

// ═══════════════════════════════════════════════════════════════════════════
// STATE
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum LoadState {
    #[default]
    Idle,
    PreparingEngine,
    SettingUpTracks,
    RestoringPlugins,
    ConnectingInstruments,
    Validating,
    Ready,
    Failed,
}

impl LoadState {
    /// Share of total load progress this stage accounts for
    pub fn weight(self) -> f64 {
        match self {
            LoadState::Idle | LoadState::Failed => 0.0,
            LoadState::PreparingEngine => 0.10,
            LoadState::SettingUpTracks => 0.30,
            LoadState::RestoringPlugins => 0.30,
            LoadState::ConnectingInstruments => 0.15,
            LoadState::Validating => 0.10,
            LoadState::Ready => 0.05,
        }
    }

    /// Progress (0.0 - 1.0) once this stage has completed
    pub fn progress(self) -> f64 {
        let mut total = 0.0;
        let mut state = LoadState::Idle;
        while let Some(next) = state.next() {
            total += next.weight();
            if next == self {
                return total.min(1.0);
            }
            state = next;
        }
        0.0
    }

    pub fn description(self) -> &'static str {
        match self {
            LoadState::Idle => "Idle",
            LoadState::PreparingEngine => "Starting audio engine",
            LoadState::SettingUpTracks => "Creating tracks",
            LoadState::RestoringPlugins => "Restoring plugins",
            LoadState::ConnectingInstruments => "Connecting instruments",
            LoadState::Validating => "Validating audio graph",
            LoadState::Ready => "Ready",
            LoadState::Failed => "Load failed",
        }
    }

    /// Following stage, `None` once terminal
    pub fn next(self) -> Option<LoadState> {
        match self {
            LoadState::Idle => Some(LoadState::PreparingEngine),
            LoadState::PreparingEngine => Some(LoadState::SettingUpTracks),
            LoadState::SettingUpTracks => Some(LoadState::RestoringPlugins),
            LoadState::RestoringPlugins => Some(LoadState::ConnectingInstruments),
            LoadState::ConnectingInstruments => Some(LoadState::Validating),
            LoadState::Validating => Some(LoadState::Ready),
            LoadState::Ready | LoadState::Failed => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        self.next().is_none()
    }
}

impl fmt::Display for LoadState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.description())
    }
}

/// Final result of a load
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadOutcome {
    Ready,
    /// Superseded by a newer load; nothing was applied after that point
    Stale,
    /// Render engine never came up
    Failed,
}

/// Result of a single `step`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadStep {
    Advanced(LoadState),
    Finished(LoadOutcome),
}

/// Observable loader status
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LoadStatus {
    pub generation: u64,
    pub state: LoadState,
    pub project: Option<String>,
}

// ═══════════════════════════════════════════════════════════════════════════
// TICKET
// ═══════════════════════════════════════════════════════════════════════════

/// Handle for one load generation
///
/// Dropping a ticket that is still current without reaching `Ready`
/// restores the graph-stable flag so a retry can run.
pub struct LoadTicket<'a> {
    loader: &'a ProjectLoader,
    generation: u64,
    project: ProjectData,
    state: LoadState,
}

impl LoadTicket<'_> {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn state(&self) -> LoadState {
        self.state
    }

    pub fn project(&self) -> &ProjectData {
        &self.project
    }
}

impl fmt::Debug for LoadTicket<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoadTicket")
            .field("generation", &self.generation)
            .field("project", &self.project.name)
            .field("state", &self.state)
            .finish()
    }
}

impl Drop for LoadTicket<'_> {
    fn drop(&mut self) {
        if self.state == LoadState::Ready {
            return;
        }
        let _stage = self.loader.stage_lock.lock();
        if !self.loader.is_current(self.generation) {
            return;
        }

        let flags = &self.loader.ctx.flags;
        flags.loading.set(false);
        flags.graph_stable.set(true);
        if self.state != LoadState::Failed {
            self.loader.status.lock().state = LoadState::Idle;
        }
        log::info!(
            "[Load] '{}' (generation {}) ended in {:?}, graph unlocked",
            self.project.name,
            self.generation,
            self.state
        );
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// LOADER
// ═══════════════════════════════════════════════════════════════════════════

pub struct ProjectLoader {
    ctx: Arc<EngineContext>,
    coordinator: Arc<GraphCoordinator>,
    transport: Arc<Transport>,
    settings: LoadSettings,
    generation: AtomicU64,
    stage_lock: Mutex<()>,
    status: Mutex<LoadStatus>,
}

impl ProjectLoader {
    pub fn new(
        ctx: Arc<EngineContext>,
        coordinator: Arc<GraphCoordinator>,
        transport: Arc<Transport>,
        settings: &LoadSettings,
    ) -> Self {
        Self {
            ctx,
            coordinator,
            transport,
            settings: settings.clone(),
            generation: AtomicU64::new(0),
            stage_lock: Mutex::new(()),
            status: Mutex::new(LoadStatus::default()),
        }
    }

    #[inline]
    fn is_current(&self, generation: u64) -> bool {
        self.generation.load(Ordering::Acquire) == generation
    }

    pub fn current_generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    pub fn status(&self) -> LoadStatus {
        self.status.lock().clone()
    }

    pub fn state(&self) -> LoadState {
        self.status.lock().state
    }

    /// Progress (0.0 - 1.0) of the current load
    pub fn progress(&self) -> f64 {
        self.state().progress()
    }

    fn set_state(&self, generation: u64, state: LoadState) {
        let mut status = self.status.lock();
        if status.generation == generation {
            status.state = state;
        }
    }

    /// Supersede any running load and tear down the current project
    ///
    /// Transport and scheduled rebuilds stop before this returns.
    pub fn begin(&self, project: ProjectData) -> LoadTicket<'_> {
        let _stage = self.stage_lock.lock();
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;

        let flags = &self.ctx.flags;
        flags.loading.set(true);
        flags.graph_stable.set(false);
        flags.project_ready.set(false);

        self.transport.stop();
        self.coordinator.cancel_scheduled();
        self.coordinator.clear();

        *self.status.lock() = LoadStatus {
            generation,
            state: LoadState::Idle,
            project: Some(project.name.clone()),
        };
        log::info!(
            "[Load] Loading '{}' ({} tracks, {} plugins), generation {}",
            project.name,
            project.tracks.len(),
            project.plugin_count(),
            generation
        );

        LoadTicket {
            loader: self,
            generation,
            project,
            state: LoadState::Idle,
        }
    }

    /// Run the next stage
    pub fn step(&self, ticket: &mut LoadTicket<'_>) -> LoadStep {
        let Some(next) = ticket.state.next() else {
            return LoadStep::Finished(match ticket.state {
                LoadState::Failed => LoadOutcome::Failed,
                _ => LoadOutcome::Ready,
            });
        };

        if next == LoadState::PreparingEngine {
            match self.wait_for_engine(ticket.generation) {
                Ok(true) => {}
                Ok(false) => return self.stale(ticket),
                Err(e) => return self.fail(ticket, e),
            }
        }

        let _stage = self.stage_lock.lock();
        if !self.is_current(ticket.generation) {
            return self.stale(ticket);
        }

        let result = match next {
            LoadState::PreparingEngine => self.prepare_engine(&ticket.project),
            LoadState::SettingUpTracks => self.set_up_tracks(&ticket.project),
            LoadState::RestoringPlugins => self.restore_plugins(&ticket.project),
            LoadState::ConnectingInstruments => self.connect_instruments(&ticket.project),
            LoadState::Validating => self.validate(),
            LoadState::Ready => {
                self.finish_ready();
                Ok(())
            }
            LoadState::Idle | LoadState::Failed => Ok(()),
        };
        if let Err(e) = result {
            // Only generation races surface as stage errors
            log::warn!("[Load] {} aborted: {}", next.description(), e);
            return self.stale(ticket);
        }

        ticket.state = next;
        self.set_state(ticket.generation, next);
        log::debug!(
            "[Load] {} done ({:.0}%)",
            next.description(),
            next.progress() * 100.0
        );

        if next == LoadState::Ready {
            LoadStep::Finished(LoadOutcome::Ready)
        } else {
            LoadStep::Advanced(next)
        }
    }

    /// Step until the ticket finishes
    pub fn run(&self, ticket: &mut LoadTicket<'_>) -> LoadOutcome {
        loop {
            if let LoadStep::Finished(outcome) = self.step(ticket) {
                return outcome;
            }
        }
    }

    /// Begin and run a load to completion
    pub fn load_project(&self, project: ProjectData) -> LoadOutcome {
        let mut ticket = self.begin(project);
        self.run(&mut ticket)
    }

    fn stale(&self, ticket: &LoadTicket<'_>) -> LoadStep {
        log::debug!(
            "[Load] '{}' generation {} superseded by {}",
            ticket.project.name,
            ticket.generation,
            self.current_generation()
        );
        LoadStep::Finished(LoadOutcome::Stale)
    }

    fn fail(&self, ticket: &mut LoadTicket<'_>, error: EngineError) -> LoadStep {
        self.ctx.errors.record(
            ErrorSeverity::Critical,
            ErrorComponent::Engine,
            format!("Loading '{}' failed: {error}", ticket.project.name),
        );
        ticket.state = LoadState::Failed;
        self.set_state(ticket.generation, LoadState::Failed);
        LoadStep::Finished(LoadOutcome::Failed)
    }

    // ─── Stages ─────────────────────────────────────────────────────────────

    /// Poll the render engine, asking it to start while it is down.
    /// `Ok(false)` means the load went stale while waiting.
    fn wait_for_engine(&self, generation: u64) -> EngineResult<bool> {
        let render = self.coordinator.render();
        let attempts = self.settings.engine_start_attempts.max(1);
        for attempt in 1..=attempts {
            if !self.is_current(generation) {
                return Ok(false);
            }
            if render.is_running() {
                return Ok(true);
            }
            if let Err(e) = render.start() {
                log::warn!("[Load] Engine start attempt {}/{} failed: {}", attempt, attempts, e);
            }
            thread::sleep(self.settings.engine_start_poll());
        }
        if !self.is_current(generation) {
            return Ok(false);
        }
        if render.is_running() {
            return Ok(true);
        }
        Err(EngineError::EngineNotRunning(attempts))
    }

    fn prepare_engine(&self, project: &ProjectData) -> EngineResult<()> {
        if let Err(e) = self.transport.set_tempo(project.tempo) {
            self.ctx.errors.record(
                ErrorSeverity::Warning,
                ErrorComponent::Format,
                format!("Project tempo rejected: {e}"),
            );
        }
        if let Err(e) = self.transport.set_time_signature(project.time_signature) {
            self.ctx.errors.record(
                ErrorSeverity::Warning,
                ErrorComponent::Format,
                format!("Project time signature rejected: {e}"),
            );
        }
        Ok(())
    }

    fn set_up_tracks(&self, project: &ProjectData) -> EngineResult<()> {
        for record in &project.tracks {
            if let Err(e) = self
                .coordinator
                .add_track(record.id, &record.name, record.output_bus)
            {
                self.ctx.errors.record(
                    ErrorSeverity::Error,
                    ErrorComponent::Track,
                    format!("Could not set up {} '{}': {e}", record.id, record.name),
                );
            }
        }
        Ok(())
    }

    fn restore_plugins(&self, project: &ProjectData) -> EngineResult<()> {
        for record in &project.tracks {
            for descriptor in &record.plugins {
                match self.coordinator.install_plugin(record.id, descriptor, None) {
                    Ok(_) => {}
                    Err(e @ EngineError::StaleGeneration { .. }) => return Err(e),
                    Err(e) => self.ctx.errors.record(
                        ErrorSeverity::Error,
                        ErrorComponent::Plugin,
                        format!("Could not restore '{}' on {}: {e}", descriptor.name, record.id),
                    ),
                }
            }
        }
        Ok(())
    }

    fn connect_instruments(&self, project: &ProjectData) -> EngineResult<()> {
        for record in project.tracks.iter().filter(|t| t.instrument.is_instrument()) {
            match self.coordinator.set_instrument(record.id, record.instrument) {
                Ok(()) => {}
                Err(e @ EngineError::StaleGeneration { .. }) => return Err(e),
                Err(e) => self.ctx.errors.record(
                    ErrorSeverity::Error,
                    ErrorComponent::Plugin,
                    format!("Could not load {} on {}: {e}", record.instrument.label(), record.id),
                ),
            }
        }
        Ok(())
    }

    fn validate(&self) -> EngineResult<()> {
        if let Err(e) = self.coordinator.rebuild_all(false) {
            log::warn!("[Load] Rebuild during validation failed: {}", e);
        }
        let mut issues = 0;
        for track in self.coordinator.track_ids() {
            issues += self.coordinator.validate_connections(track)?.len();
        }
        if issues > 0 {
            log::warn!("[Load] {} connection issues, continuing degraded", issues);
        }
        Ok(())
    }

    fn finish_ready(&self) {
        let flags = &self.ctx.flags;
        flags.loading.set(false);
        flags.graph_stable.set(true);
        flags.project_ready.set(true);
        log::info!(
            "[Load] Ready: {} tracks, max latency {} samples",
            self.coordinator.track_count(),
            self.ctx.pdc.max_latency()
        );
    }
}

impl fmt::Debug for ProjectLoader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProjectLoader")
            .field("status", &self.status())
            .finish()
    }
}
