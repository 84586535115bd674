//! Concurrency stress tests
//!
//! - Competing project loads: superseded loads must never double-attach or
//!   double-connect, and the last load wins
//! - Position publisher vs. seeks: a tick sampled before a jump never lands
//! - Capture under pool pressure with the maintenance thread running

use serial_test::serial;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use stori_core::{
    CycleRegion, EngineConfig, InstrumentKind, PluginDescriptor, ProjectData,
    RecordingPoolSettings, SchedulingContext, TrackId, TrackRecord, TransportSettings,
};
use stori_engine::{
    AudioCore, BufferPool, CaptureSession, EngineContext, EngineResult, Instrument, InstrumentSlot,
    LoadOutcome, MemoryGraph, PlaybackDriver, PluginUnit, PoolMaintenance, PositionPublisher,
    RecordingSink, RenderGraph, StreamFormat, SystemClock, Transport, UnitFactory,
};

// ═══════════════════════════════════════════════════════════════════════════════
// TEST DOUBLES
// ═══════════════════════════════════════════════════════════════════════════════

struct NullDriver;

impl PlaybackDriver for NullDriver {
    fn start_playback(&self, _from_beat: f64, cycle: Option<CycleRegion>) -> bool {
        cycle.is_some()
    }

    fn stop_playback(&self) {}
}

struct Unit(String);

impl PluginUnit for Unit {
    fn name(&self) -> &str {
        &self.0
    }

    fn latency_seconds(&self) -> f64 {
        0.002
    }

    fn reset(&self) {}
}

struct Synth;

impl Instrument for Synth {
    fn reset(&self) {}
    fn note_on(&self, _note: u8, _velocity: u8) {}
    fn note_off(&self, _note: u8) {}
    fn all_notes_off(&self) {}
}

/// Yields inside instantiation to widen race windows
struct SlowFactory;

impl UnitFactory for SlowFactory {
    fn instantiate_plugin(&self, descriptor: &PluginDescriptor) -> EngineResult<Arc<dyn PluginUnit>> {
        thread::yield_now();
        Ok(Arc::new(Unit(descriptor.name.clone())))
    }

    fn instantiate_instrument(&self, kind: InstrumentKind, _track: TrackId) -> EngineResult<InstrumentSlot> {
        thread::yield_now();
        Ok(match kind {
            InstrumentKind::None => InstrumentSlot::None,
            _ => InstrumentSlot::Sampler(Arc::new(Synth)),
        })
    }
}

/// Projects share track ids so a stale load would collide with the live one
fn project(variant: u64) -> ProjectData {
    let mut project = ProjectData::new(format!("Project {variant}"), 100.0 + variant as f64);
    for id in 1..=3 {
        let mut track = TrackRecord::new(id, format!("Track {id}"));
        if (id + variant) % 2 == 0 {
            track = track.with_plugin(PluginDescriptor::new("fx", "FX"));
        }
        if (id + variant) % 3 == 0 {
            track = track.with_instrument(InstrumentKind::Sampler);
        }
        project = project.with_track(track);
    }
    project
}

// ═══════════════════════════════════════════════════════════════════════════════
// LOAD GENERATION RACE
// ═══════════════════════════════════════════════════════════════════════════════

#[test]
fn test_competing_loads_never_duplicate_graph_ops() {
    let _ = env_logger::builder().is_test(true).try_init();
    let graph = Arc::new(MemoryGraph::running(StreamFormat::default()));
    let mut config = EngineConfig::default();
    config.load.engine_start_poll_ms = 1;
    let core = AudioCore::new(
        config,
        graph.clone(),
        Arc::new(NullDriver),
        Arc::new(SlowFactory),
        Arc::new(SystemClock::new()),
    )
    .unwrap();

    thread::scope(|scope| {
        for worker in 0..4u64 {
            let core = &core;
            scope.spawn(move || {
                for round in 0..25u64 {
                    let variant = worker * 100 + round;
                    if round % 4 == 3 {
                        // Abandon part way through
                        let mut ticket = core.loader().begin(project(variant));
                        core.loader().step(&mut ticket);
                        core.loader().step(&mut ticket);
                    } else {
                        let outcome = core.load_project(project(variant));
                        assert_ne!(outcome, LoadOutcome::Failed);
                    }
                }
            });
        }
    });

    assert_eq!(graph.duplicate_attaches(), 0);
    assert_eq!(graph.duplicate_connects(), 0);

    let last = project(7);
    assert_eq!(core.load_project(last.clone()), LoadOutcome::Ready);
    let ids: BTreeSet<TrackId> = core.coordinator().track_ids().into_iter().collect();
    let expected: BTreeSet<TrackId> = last.tracks.iter().map(|t| t.id).collect();
    assert_eq!(ids, expected);

    // 4 nodes per plain track, 3 more for a realized single-plugin chain
    let plugin_tracks = last.tracks.iter().filter(|t| !t.plugins.is_empty()).count();
    let expected_nodes = last.tracks.len() * 4 + plugin_tracks * 3;
    assert_eq!(graph.attached_count(), expected_nodes);
    assert_eq!(graph.connection_count(), expected_nodes);
    assert_eq!(graph.duplicate_attaches(), 0);
    assert_eq!(graph.duplicate_connects(), 0);
    assert!(core.ctx().flags.project_ready.get());
    assert!(core.coordinator().validation_issues().is_empty());
}

// ═══════════════════════════════════════════════════════════════════════════════
// PUBLISHER VS SEEK
// ═══════════════════════════════════════════════════════════════════════════════

#[test]
#[serial]
fn test_stale_ticks_never_overwrite_seek() {
    let _ = env_logger::builder().is_test(true).try_init();
    let ctx = Arc::new(EngineContext::new(
        Arc::new(SystemClock::new()),
        &EngineConfig::default(),
    ));
    let transport = Arc::new(Transport::new(
        ctx,
        Arc::new(NullDriver),
        SchedulingContext::default(),
        &TransportSettings::default(),
    ));
    transport.play();
    let mut publisher = PositionPublisher::spawn(transport.clone(), Duration::from_millis(1)).unwrap();

    for i in 0..200 {
        if i % 2 == 0 {
            transport.seek_to_beat(1000.0);
            assert!(transport.published_beat() >= 1000.0);
        } else {
            transport.seek_to_beat(0.0);
            assert!(transport.published_beat() < 500.0);
        }
        thread::sleep(Duration::from_micros(300));
        let beat = transport.published_beat();
        if i % 2 == 0 {
            assert!(beat >= 1000.0, "stale tick landed after seek: {beat}");
        } else {
            assert!(beat < 500.0, "stale tick landed after seek: {beat}");
        }
    }

    publisher.stop();
    assert_eq!(transport.jump_count(), 200);
}

// ═══════════════════════════════════════════════════════════════════════════════
// CAPTURE UNDER PRESSURE
// ═══════════════════════════════════════════════════════════════════════════════

struct SlowSink {
    samples: u64,
}

impl RecordingSink for SlowSink {
    fn write_block(&mut self, _track: TrackId, samples: &[f32]) -> EngineResult<()> {
        thread::sleep(Duration::from_micros(50));
        self.samples += samples.len() as u64;
        Ok(())
    }

    fn finish(&mut self) -> EngineResult<()> {
        Ok(())
    }
}

#[test]
#[serial]
fn test_capture_with_maintenance_thread() {
    let _ = env_logger::builder().is_test(true).try_init();
    let settings = RecordingPoolSettings {
        baseline_buffers: 4,
        buffer_capacity: 128,
        overflow_cap: 60,
        overflow_batch: 8,
        writer_queue_depth: 64,
        ..Default::default()
    };
    let pool = Arc::new(BufferPool::new(&settings));
    let mut maintenance = PoolMaintenance::spawn(pool.clone(), Duration::from_millis(5)).unwrap();

    let mut session = CaptureSession::start(
        pool.clone(),
        Box::new(SlowSink { samples: 0 }),
        settings.writer_queue_depth,
    )
    .unwrap();

    let block = vec![0.5f32; 128];
    for i in 0..500u64 {
        session.capture(TrackId(i % 4), &block);
        if i % 50 == 0 {
            thread::sleep(Duration::from_millis(1));
        }
    }
    let summary = session.finish().unwrap();
    maintenance.stop();

    let stats = pool.stats();
    assert!(stats.total <= settings.hard_limit());
    assert_eq!(stats.in_use, 0);
    assert_eq!(summary.blocks_written + summary.blocks_dropped, 500);
    assert_eq!(summary.samples_written, summary.blocks_written * 128);
    assert_eq!(stats.acquired + stats.exhausted, 500);
}
