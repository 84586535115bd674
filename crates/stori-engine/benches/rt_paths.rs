//! Render-callback read path benchmarks

use criterion::{Criterion, black_box, criterion_group, criterion_main};
use std::sync::Arc;
use stori_core::{CycleRegion, EngineConfig, RecordingPoolSettings, SchedulingContext, TrackId};
use stori_engine::{BufferPool, EngineContext, PlaybackDriver, SystemClock, Transport};

struct NullDriver;

impl PlaybackDriver for NullDriver {
    fn start_playback(&self, _from_beat: f64, cycle: Option<CycleRegion>) -> bool {
        cycle.is_some()
    }

    fn stop_playback(&self) {}
}

fn context() -> Arc<EngineContext> {
    Arc::new(EngineContext::new(Arc::new(SystemClock::new()), &EngineConfig::default()))
}

fn bench_current_beat(c: &mut Criterion) {
    let config = EngineConfig::default();
    let transport = Transport::new(
        context(),
        Arc::new(NullDriver),
        SchedulingContext::default(),
        &config.transport,
    );
    transport.play();

    c.bench_function("transport_current_beat", |b| {
        b.iter(|| black_box(transport.current_beat()))
    });
}

fn bench_compensation_lookup(c: &mut Criterion) {
    let ctx = context();
    for i in 0..64 {
        ctx.pdc.set_track_latency(TrackId(i), i * 16);
    }

    c.bench_function("pdc_try_compensation_64_tracks", |b| {
        b.iter(|| black_box(ctx.pdc.try_compensation_for(black_box(TrackId(17)))))
    });
}

fn bench_pool_cycle(c: &mut Criterion) {
    let pool = BufferPool::new(&RecordingPoolSettings::default());
    let block = vec![0.25f32; 512];

    c.bench_function("pool_acquire_write_release_512", |b| {
        b.iter(|| {
            if let Some(mut buffer) = pool.acquire() {
                buffer.write(black_box(&block));
                pool.release(buffer);
            }
        })
    });
}

criterion_group!(benches, bench_current_beat, bench_compensation_lookup, bench_pool_cycle);
criterion_main!(benches);
