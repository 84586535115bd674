//! Composition root
//!
//! Builds the explicit [`EngineContext`] and hands it to every component.
//! Collaborators (render graph, playback driver, unit factory, clock) come
//! in from the host, so tests swap any of them.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use stori_core::{EngineConfig, ProjectData, TrackId};

use crate::clock::Clock;
use crate::context::EngineContext;
use crate::diagnostics::{DiagnosticsReport, TrackLatencyInfo};
use crate::error::EngineResult;
use crate::graph::GraphCoordinator;
use crate::load::{LoadOutcome, ProjectLoader};
use crate::pdc::{LatencySamples, PdcManager};
use crate::plugin::UnitFactory;
use crate::publisher::PositionPublisher;
use crate::recording::{BufferPool, CaptureSession, PoolMaintenance, RecordingSink};
use crate::render::RenderGraph;
use crate::transport::{PlaybackDriver, Transport};

/// Errors shown in a diagnostics report
const DIAGNOSTIC_ERROR_LIMIT: usize = 10;

/// Trim check interval of the pool maintenance thread
const POOL_MAINTENANCE_INTERVAL: Duration = Duration::from_millis(500);

pub struct AudioCore {
    config: EngineConfig,
    ctx: Arc<EngineContext>,
    transport: Arc<Transport>,
    coordinator: Arc<GraphCoordinator>,
    loader: ProjectLoader,
    pool: Arc<BufferPool>,
    publisher: Option<PositionPublisher>,
    maintenance: Option<PoolMaintenance>,
}

impl AudioCore {
    pub fn new(
        config: EngineConfig,
        render: Arc<dyn RenderGraph>,
        driver: Arc<dyn PlaybackDriver>,
        factory: Arc<dyn UnitFactory>,
        clock: Arc<dyn Clock>,
    ) -> EngineResult<Self> {
        config.validate()?;
        let ctx = Arc::new(EngineContext::new(clock, &config));

        let scheduling = config
            .scheduling_context()?
            .with_sample_rate(render.format().sample_rate)?;
        let transport = Arc::new(Transport::new(
            ctx.clone(),
            driver,
            scheduling,
            &config.transport,
        ));
        transport.subscribe(&ctx.instruments);

        let coordinator = Arc::new(GraphCoordinator::new(
            ctx.clone(),
            render,
            factory,
            config.graph.rebuild_debounce(),
        ));
        let loader = ProjectLoader::new(
            ctx.clone(),
            coordinator.clone(),
            transport.clone(),
            &config.load,
        );
        let pool = Arc::new(BufferPool::new(&config.recording).with_error_tracker(ctx.errors.clone()));

        log::info!(
            "[Engine] Core ready: {} Hz, {:.1} BPM",
            scheduling.sample_rate(),
            scheduling.tempo()
        );
        Ok(Self {
            config,
            ctx,
            transport,
            coordinator,
            loader,
            pool,
            publisher: None,
            maintenance: None,
        })
    }

    // ─── Components ─────────────────────────────────────────────────────────

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn ctx(&self) -> &Arc<EngineContext> {
        &self.ctx
    }

    pub fn transport(&self) -> &Arc<Transport> {
        &self.transport
    }

    pub fn coordinator(&self) -> &Arc<GraphCoordinator> {
        &self.coordinator
    }

    pub fn loader(&self) -> &ProjectLoader {
        &self.loader
    }

    pub fn pool(&self) -> &Arc<BufferPool> {
        &self.pool
    }

    // ─── Background threads ─────────────────────────────────────────────────

    /// Start the position publisher at the configured interval
    pub fn start_position_publisher(&mut self) -> EngineResult<()> {
        if self.publisher.is_some() {
            return Ok(());
        }
        self.publisher = Some(PositionPublisher::spawn(
            self.transport.clone(),
            self.config.transport.publisher_interval(),
        )?);
        Ok(())
    }

    pub fn stop_position_publisher(&mut self) {
        if let Some(mut publisher) = self.publisher.take() {
            publisher.stop();
        }
    }

    pub fn publisher(&self) -> Option<&PositionPublisher> {
        self.publisher.as_ref()
    }

    /// Start background pool pre-allocation and trimming
    pub fn start_pool_maintenance(&mut self) -> EngineResult<()> {
        if self.maintenance.is_none() {
            self.maintenance = Some(PoolMaintenance::spawn(
                self.pool.clone(),
                POOL_MAINTENANCE_INTERVAL,
            )?);
        }
        Ok(())
    }

    /// Open a capture session on the shared pool
    pub fn start_capture(&self, sink: Box<dyn RecordingSink>) -> EngineResult<CaptureSession> {
        CaptureSession::start(self.pool.clone(), sink, self.config.recording.writer_queue_depth)
    }

    // ─── Control ────────────────────────────────────────────────────────────

    /// Fire the debounced rebuild timer and forward pool pressure to the
    /// error tracker; call from the control loop
    pub fn service(&self) -> usize {
        self.pool.report_health();
        self.coordinator.poll_scheduled()
    }

    pub fn load_project(&self, project: ProjectData) -> LoadOutcome {
        self.loader.load_project(project)
    }

    /// Read handle for the render callback
    pub fn render_view(&self) -> RenderView {
        RenderView {
            transport: self.transport.clone(),
            pdc: self.ctx.pdc.clone(),
        }
    }

    pub fn diagnostics(&self) -> DiagnosticsReport {
        self.pool.report_health();
        let render = self.coordinator.render();
        let table = self.ctx.pdc.table();
        let mut latencies: Vec<TrackLatencyInfo> = self
            .coordinator
            .track_ids()
            .into_iter()
            .map(|track| TrackLatencyInfo {
                track,
                latency_samples: self.ctx.pdc.track_latency(track),
                compensation_samples: table.delay_for(track),
            })
            .collect();
        latencies.sort_by_key(|info| info.track);

        DiagnosticsReport {
            engine_running: render.is_running(),
            sample_rate: render.format().sample_rate,
            attached_nodes: render.attached_count(),
            tracks: self.coordinator.track_count(),
            graph_generation: self.coordinator.generation(),
            graph_mutations: self.coordinator.mutation_count(),
            graph_stable: self.ctx.flags.graph_stable.get(),
            project_ready: self.ctx.flags.project_ready.get(),
            load_state: self.loader.state(),
            transport_state: self.transport.state(),
            beat: self.transport.current_beat(),
            jump_count: self.transport.jump_count(),
            max_latency_samples: table.max_latency,
            latencies,
            validation_issues: self.coordinator.validation_issues(),
            recent_errors: self.ctx.errors.recent(DIAGNOSTIC_ERROR_LIMIT),
            health: self.ctx.errors.health(),
            pool: self.pool.stats(),
        }
    }
}

impl Drop for AudioCore {
    fn drop(&mut self) {
        self.stop_position_publisher();
        if let Some(mut maintenance) = self.maintenance.take() {
            maintenance.stop();
        }
    }
}

impl fmt::Debug for AudioCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AudioCore")
            .field("transport", &self.transport)
            .field("coordinator", &self.coordinator)
            .field("loader", &self.loader)
            .finish()
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// RENDER VIEW
// ═══════════════════════════════════════════════════════════════════════════

/// What the render callback may read; every call is non-blocking
#[derive(Clone)]
pub struct RenderView {
    transport: Arc<Transport>,
    pdc: Arc<PdcManager>,
}

impl RenderView {
    #[inline]
    pub fn current_beat(&self) -> f64 {
        self.transport.current_beat()
    }

    #[inline]
    pub fn is_playing(&self) -> bool {
        self.transport.is_playing()
    }

    /// Compensation delay, `None` if the table is being rewritten
    #[inline]
    pub fn compensation_for(&self, track: TrackId) -> Option<LatencySamples> {
        self.pdc.try_compensation_for(track)
    }
}
