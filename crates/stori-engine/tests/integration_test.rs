//! Coordination core integration tests
//!
//! Drives the public API end to end with a manual clock and the in-memory
//! render graph:
//! - Transport position, pause and cycle behaviour
//! - Snapshot-gated rebuilds and the lazy chain
//! - Plugin delay compensation
//! - Recording pool pressure
//! - Generation-tagged project loads

use approx::assert_relative_eq;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use stori_core::{
    BusId, CycleRegion, EngineConfig, InstrumentKind, PluginDescriptor, ProjectData,
    RecordingPoolSettings, TrackId, TrackRecord,
};
use stori_engine::{
    AudioCore, BufferPool, EngineResult, GraphOp, Instrument, InstrumentSlot, LoadOutcome,
    LoadState, LoadStep, ManualClock, MemoryGraph, NodeKey, NodeRole, PdcManager, PlaybackDriver,
    PluginUnit, RenderGraph, StreamFormat, TickOutcome, UnitFactory, calculate_compensation,
};

// ═══════════════════════════════════════════════════════════════════════════════
// TEST DOUBLES
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Default)]
struct TestDriver {
    starts: AtomicU64,
    stops: AtomicU64,
}

impl PlaybackDriver for TestDriver {
    fn start_playback(&self, _from_beat: f64, cycle: Option<CycleRegion>) -> bool {
        self.starts.fetch_add(1, Ordering::SeqCst);
        cycle.is_some()
    }

    fn stop_playback(&self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
    }
}

struct Unit {
    name: String,
    latency: f64,
}

impl PluginUnit for Unit {
    fn name(&self) -> &str {
        &self.name
    }

    fn latency_seconds(&self) -> f64 {
        self.latency
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

#[derive(Default)]
struct Factory {
    latencies: HashMap<String, f64>,
}

impl Factory {
    fn with_latency(mut self, component: &str, seconds: f64) -> Self {
        self.latencies.insert(component.to_string(), seconds);
        self
    }
}

impl UnitFactory for Factory {
    fn instantiate_plugin(&self, descriptor: &PluginDescriptor) -> EngineResult<Arc<dyn PluginUnit>> {
        Ok(Arc::new(Unit {
            name: descriptor.name.clone(),
            latency: self.latencies.get(&descriptor.component).copied().unwrap_or(0.0),
        }))
    }

    fn instantiate_instrument(&self, kind: InstrumentKind, _track: TrackId) -> EngineResult<InstrumentSlot> {
        Ok(match kind {
            InstrumentKind::Sampler => InstrumentSlot::Sampler(Arc::new(Synth)),
            InstrumentKind::DrumKit => InstrumentSlot::DrumKit(Arc::new(Synth)),
            InstrumentKind::AudioUnit => InstrumentSlot::AudioUnit(Arc::new(Synth)),
            InstrumentKind::None => InstrumentSlot::None,
        })
    }
}

struct Rig {
    clock: Arc<ManualClock>,
    graph: Arc<MemoryGraph>,
    driver: Arc<TestDriver>,
    core: AudioCore,
}

fn rig() -> Rig {
    let _ = env_logger::builder().is_test(true).try_init();
    let clock = Arc::new(ManualClock::new());
    let graph = Arc::new(MemoryGraph::running(StreamFormat::default()));
    let driver = Arc::new(TestDriver::default());
    let mut config = EngineConfig::default();
    config.load.engine_start_poll_ms = 1;

    let core = AudioCore::new(
        config,
        graph.clone(),
        driver.clone(),
        Arc::new(Factory::default().with_latency("lookahead", 0.01)),
        clock.clone(),
    )
    .unwrap();
    Rig {
        clock,
        graph,
        driver,
        core,
    }
}

fn song() -> ProjectData {
    ProjectData::new("Song", 120.0)
        .with_track(TrackRecord::new(1, "Drums").with_instrument(InstrumentKind::DrumKit))
        .with_track(TrackRecord::new(2, "Bass").with_plugin(PluginDescriptor::new("lookahead", "Limiter")))
        .with_track(TrackRecord::new(3, "Vox"))
}

const TICK: Duration = Duration::from_millis(5);

// ═══════════════════════════════════════════════════════════════════════════════
// TRANSPORT
// ═══════════════════════════════════════════════════════════════════════════════

#[test]
fn test_beat_is_monotonic_while_playing() {
    let rig = rig();
    let transport = rig.core.transport();
    transport.play();

    let mut last = transport.current_beat();
    for step in 0..500u64 {
        rig.clock.advance(Duration::from_micros(700 + (step * 37) % 4000));
        if step % 3 == 0 {
            transport.tick();
        }
        let beat = transport.current_beat();
        assert!(beat >= last, "beat went backwards: {last} -> {beat}");
        last = beat;
    }
    assert!(transport.is_playing());
}

#[test]
fn test_pause_uses_elapsed_wall_time() {
    let rig = rig();
    let transport = rig.core.transport();
    transport.set_tempo(90.0).unwrap();
    transport.seek_to_beat(2.0);
    transport.play();

    rig.clock.advance_secs(1.0);
    transport.tick();
    rig.clock.advance_secs(0.37);
    transport.pause();

    // 2 + 1.37 s * 90 / 60
    assert_relative_eq!(transport.current_beat(), 4.055, epsilon = 1e-6);
    assert_relative_eq!(transport.published_beat(), 4.055, epsilon = 1e-6);

    rig.clock.advance_secs(5.0);
    assert_relative_eq!(transport.current_beat(), 4.055, epsilon = 1e-6);
}

#[test]
fn test_cycle_jump_to_start_skips_restart() {
    let rig = rig();
    let transport = rig.core.transport();
    transport.set_cycle_region(0.0, 4.0).unwrap();
    transport.set_cycle_enabled(true);
    transport.play();
    let starts = rig.driver.starts.load(Ordering::SeqCst);

    transport.transport_safe_jump(0.0);
    assert_eq!(rig.driver.starts.load(Ordering::SeqCst), starts);
    assert_eq!(rig.driver.stops.load(Ordering::SeqCst), 0);
    assert_eq!(transport.restart_count(), 0);

    transport.transport_safe_jump(2.5);
    assert_eq!(rig.driver.stops.load(Ordering::SeqCst), 1);
    assert_eq!(rig.driver.starts.load(Ordering::SeqCst), starts + 1);
    assert_eq!(transport.restart_count(), 1);
    assert_eq!(transport.jump_count(), 2);
}

#[test]
fn test_jump_without_cycle_restarts() {
    let rig = rig();
    let transport = rig.core.transport();
    transport.set_cycle_region(0.0, 4.0).unwrap();
    transport.play();

    transport.transport_safe_jump(0.0);
    assert_eq!(transport.restart_count(), 1);
    assert_eq!(rig.driver.stops.load(Ordering::SeqCst), 1);
}

#[test]
fn test_transport_refuses_while_graph_unstable() {
    let rig = rig();
    let flags = &rig.core.ctx().flags;
    flags.graph_stable.set(false);

    rig.core.transport().play();
    assert!(!rig.core.transport().is_playing());
    rig.core.transport().seek_to_beat(8.0);
    assert_eq!(rig.core.transport().current_beat(), 0.0);

    flags.graph_stable.set(true);
    rig.core.transport().play();
    assert!(rig.core.transport().is_playing());
}

// ═══════════════════════════════════════════════════════════════════════════════
// GRAPH
// ═══════════════════════════════════════════════════════════════════════════════

#[test]
fn test_repeated_rebuild_if_needed_mutates_once() {
    let rig = rig();
    let coordinator = rig.core.coordinator();
    coordinator.add_track(TrackId(1), "A", BusId::MASTER).unwrap();
    coordinator.invalidate_snapshot(TrackId(1));
    rig.graph.take_ops();
    let before = coordinator.mutation_count();

    assert!(coordinator.rebuild_if_needed(TrackId(1), false).unwrap());
    let first = rig.graph.take_ops();
    assert!(!coordinator.rebuild_if_needed(TrackId(1), false).unwrap());

    assert_eq!(coordinator.mutation_count(), before + 1);
    assert!(!first.is_empty());
    assert!(rig.graph.take_ops().is_empty());
}

#[test]
fn test_lazy_chain_lifecycle() {
    let rig = rig();
    let coordinator = rig.core.coordinator();
    let t = TrackId(5);
    let node = |role| NodeKey::new(t, role);
    coordinator.add_track(t, "Keys", BusId::MASTER).unwrap();

    assert!(!coordinator.cached_snapshot(t).unwrap().is_realized);
    assert!(!rig.graph.is_attached(node(NodeRole::ChainInput)));

    let slot = coordinator
        .insert_plugin(t, &PluginDescriptor::new("eq", "EQ"), None)
        .unwrap();
    assert!(coordinator.cached_snapshot(t).unwrap().is_realized);
    for role in [NodeRole::ChainInput, NodeRole::ChainOutput] {
        assert!(rig.graph.has_input(node(role)));
        assert!(rig.graph.has_output(node(role)));
    }

    coordinator.remove_plugin(t, slot).unwrap();
    assert!(!coordinator.cached_snapshot(t).unwrap().is_realized);
    assert!(!rig.graph.is_attached(node(NodeRole::ChainInput)));
    assert!(!rig.graph.is_attached(node(NodeRole::ChainOutput)));
    assert_eq!(
        coordinator.wired_path(t),
        vec![
            node(NodeRole::Source(InstrumentKind::None)),
            node(NodeRole::Eq),
            node(NodeRole::Volume),
            node(NodeRole::Pan),
        ]
    );
    assert!(coordinator.validation_issues().is_empty());
}

#[test]
fn test_rebuild_leaves_other_tracks_untouched() {
    let rig = rig();
    assert_eq!(rig.core.load_project(song()), LoadOutcome::Ready);
    rig.graph.take_ops();

    rig.core
        .coordinator()
        .insert_plugin(TrackId(3), &PluginDescriptor::new("eq", "EQ"), Some(0))
        .unwrap();
    let ops = rig.graph.take_ops();
    assert!(!ops.is_empty());
    assert!(ops.iter().all(|op| op.track() == Some(TrackId(3))));
    assert!(!ops.iter().any(|op| matches!(op, GraphOp::Start)));
}

#[test]
fn test_debounced_rebuilds_fire_from_service() {
    let rig = rig();
    assert_eq!(rig.core.load_project(song()), LoadOutcome::Ready);
    let coordinator = rig.core.coordinator();
    coordinator.invalidate_snapshot(TrackId(1));
    coordinator.invalidate_snapshot(TrackId(2));
    let before = coordinator.mutation_count();

    for _ in 0..10 {
        coordinator.schedule_rebuild(TrackId(1));
        coordinator.schedule_rebuild(TrackId(2));
        rig.clock.advance(Duration::from_millis(5));
        assert_eq!(rig.core.service(), 0);
    }
    rig.clock.advance(Duration::from_millis(40));
    assert_eq!(rig.core.service(), 2);
    assert_eq!(coordinator.mutation_count(), before + 2);
}

// ═══════════════════════════════════════════════════════════════════════════════
// PDC
// ═══════════════════════════════════════════════════════════════════════════════

#[test]
fn test_compensation_equalizes_latency() {
    let latencies = HashMap::from([(TrackId(1), 0), (TrackId(2), 10), (TrackId(3), 25)]);
    let table = calculate_compensation(&latencies);
    assert_eq!(table.max_latency, 25);
    assert_eq!(table.delay_for(TrackId(1)), 25);
    assert_eq!(table.delay_for(TrackId(2)), 15);
    assert_eq!(table.delay_for(TrackId(3)), 0);

    let pdc = PdcManager::new(48000);
    for (track, latency) in latencies {
        pdc.set_track_latency(track, latency);
    }
    assert_eq!(pdc.max_latency(), 25);
    assert_eq!(pdc.try_compensation_for(TrackId(2)), Some(15));
}

#[test]
fn test_loaded_plugin_latency_reaches_render_view() {
    let rig = rig();
    assert_eq!(rig.core.load_project(song()), LoadOutcome::Ready);
    let view = rig.core.render_view();

    assert_eq!(view.compensation_for(TrackId(1)), Some(480));
    assert_eq!(view.compensation_for(TrackId(2)), Some(0));
    assert_eq!(view.compensation_for(TrackId(3)), Some(480));
}

// ═══════════════════════════════════════════════════════════════════════════════
// RECORDING POOL
// ═══════════════════════════════════════════════════════════════════════════════

#[test]
fn test_pool_never_fails_below_hard_cap() {
    let settings = RecordingPoolSettings {
        baseline_buffers: 8,
        buffer_capacity: 256,
        overflow_cap: 24,
        overflow_batch: 4,
        ..Default::default()
    };
    let pool = BufferPool::new(&settings);

    let mut held = Vec::new();
    for i in 0..settings.hard_limit() {
        if i % 5 == 0 {
            pool.preallocate_overflow();
        }
        held.push(pool.acquire().expect("acquire below the hard cap"));
    }
    let stats = pool.stats();
    assert_eq!(stats.acquired, 32);
    assert_eq!(stats.total, 32);
    assert_eq!(stats.emergency_allocations + stats.preallocated, 24);
    assert_eq!(stats.exhausted, 0);

    assert!(pool.acquire().is_none());
    assert_eq!(pool.stats().exhausted, 1);

    for buffer in held.drain(..) {
        pool.release(buffer);
    }
    assert!(pool.acquire().is_some());
}

// ═══════════════════════════════════════════════════════════════════════════════
// PROJECT LOAD
// ═══════════════════════════════════════════════════════════════════════════════

#[test]
fn test_stale_load_cannot_mutate() {
    let rig = rig();
    let loader = rig.core.loader();

    let mut old = loader.begin(song());
    assert_eq!(loader.step(&mut old), LoadStep::Advanced(LoadState::PreparingEngine));
    assert_eq!(loader.step(&mut old), LoadStep::Advanced(LoadState::SettingUpTracks));
    assert_eq!(rig.core.coordinator().track_count(), 3);

    let other = ProjectData::new("Other", 100.0).with_track(TrackRecord::new(7, "Pad"));
    let mut current = loader.begin(other);
    assert_eq!(rig.core.coordinator().track_count(), 0);
    rig.graph.take_ops();

    assert_eq!(loader.step(&mut old), LoadStep::Finished(LoadOutcome::Stale));
    assert!(rig.graph.take_ops().is_empty());
    drop(old);

    assert_eq!(loader.run(&mut current), LoadOutcome::Ready);
    assert_eq!(rig.core.coordinator().track_ids(), vec![TrackId(7)]);
    assert_eq!(rig.core.transport().tempo(), 100.0);
    assert_eq!(rig.graph.duplicate_attaches(), 0);
    assert_eq!(rig.graph.duplicate_connects(), 0);
}

// ═══════════════════════════════════════════════════════════════════════════════
// END TO END
// ═══════════════════════════════════════════════════════════════════════════════

#[test]
fn test_cycle_wraps_once_after_four_beats() {
    let rig = rig();
    assert_eq!(rig.core.load_project(song()), LoadOutcome::Ready);
    let transport = rig.core.transport();
    let coordinator = rig.core.coordinator();

    transport.set_cycle_region(0.0, 4.0).unwrap();
    transport.set_cycle_enabled(true);
    transport.play();

    let rebuilds: Vec<u64> = coordinator
        .track_ids()
        .into_iter()
        .map(|t| coordinator.rebuild_count(t))
        .collect();
    let mutations = coordinator.mutation_count();
    let jumps = transport.jump_count();
    rig.graph.take_ops();

    let mut wraps = Vec::new();
    // 2.0 s at 120 BPM is four beats, then a little past the loop point
    for _ in 0..420 {
        rig.clock.advance(TICK);
        if let TickOutcome::Wrapped { from, to } = transport.tick() {
            wraps.push((from, to));
        }
        assert!(transport.current_beat() < 4.0);
    }

    assert_eq!(wraps.len(), 1);
    assert!(wraps[0].0 >= 4.0 - 0.001);
    assert_eq!(wraps[0].1, 0.0);
    assert_eq!(transport.jump_count(), jumps + 1);
    assert_eq!(transport.restart_count(), 0);
    assert_relative_eq!(transport.current_beat(), 0.2, epsilon = 1e-6);

    let after: Vec<u64> = coordinator
        .track_ids()
        .into_iter()
        .map(|t| coordinator.rebuild_count(t))
        .collect();
    assert_eq!(after, rebuilds);
    assert_eq!(coordinator.mutation_count(), mutations);
    assert!(rig.graph.take_ops().is_empty());
}
