//! Position publisher thread
//!
//! Ticks the transport on its own timer, independent of any UI loop. Each
//! tick recomputes the beat from the anchor and wraps the cycle when due.
//! The thread asks for elevated scheduling on start; a refusal only costs
//! tick jitter.

use crossbeam_channel::{RecvTimeoutError, Sender, bounded};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::error::EngineResult;
use crate::priority::{PriorityResult, elevate_timing_thread};
use crate::rt::{RtCounter, RtFlag};
use crate::transport::{TickOutcome, Transport};

/// Tick outcome totals
#[derive(Debug, Default)]
pub struct PublisherStats {
    pub ticks: RtCounter,
    pub wraps: RtCounter,
    pub stale: RtCounter,
    /// Whether the thread runs at elevated priority
    pub elevated: RtFlag,
}

pub struct PositionPublisher {
    shutdown: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
    stats: Arc<PublisherStats>,
    interval: Duration,
}

impl PositionPublisher {
    pub fn spawn(transport: Arc<Transport>, interval: Duration) -> EngineResult<Self> {
        let (shutdown, shutdown_rx) = bounded::<()>(1);
        let stats = Arc::new(PublisherStats::default());
        let thread_stats = stats.clone();

        let handle = thread::Builder::new()
            .name("stori-position".into())
            .spawn(move || {
                let priority = elevate_timing_thread();
                thread_stats.elevated.set(priority.is_elevated());
                if priority == PriorityResult::Failed {
                    log::warn!("[Transport] Position publisher at default priority, ticks may jitter");
                }
                loop {
                    match shutdown_rx.recv_timeout(interval) {
                        Err(RecvTimeoutError::Timeout) => match transport.tick() {
                            TickOutcome::Idle => {}
                            TickOutcome::Advanced(_) => {
                                thread_stats.ticks.increment();
                            }
                            TickOutcome::Wrapped { .. } => {
                                thread_stats.ticks.increment();
                                thread_stats.wraps.increment();
                            }
                            TickOutcome::Stale => {
                                thread_stats.stale.increment();
                            }
                        },
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                log::debug!("[Transport] Position publisher exiting");
            })?;

        log::info!("[Transport] Position publisher started ({:?} interval)", interval);
        Ok(Self {
            shutdown: Some(shutdown),
            handle: Some(handle),
            stats,
            interval,
        })
    }

    pub fn stats(&self) -> &PublisherStats {
        &self.stats
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    pub fn stop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.try_send(());
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for PositionPublisher {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::context::EngineContext;
    use crate::test_support::CountingDriver;
    use serial_test::serial;
    use stori_core::{EngineConfig, SchedulingContext, TransportSettings};

    #[test]
    #[serial]
    fn test_publisher_advances_and_stops() {
        let ctx = Arc::new(EngineContext::new(
            Arc::new(SystemClock::new()),
            &EngineConfig::default(),
        ));
        let transport = Arc::new(Transport::new(
            ctx,
            Arc::new(CountingDriver::default()),
            SchedulingContext::default(),
            &TransportSettings::default(),
        ));
        transport.play();

        let mut publisher = PositionPublisher::spawn(transport.clone(), Duration::from_millis(2)).unwrap();
        thread::sleep(Duration::from_millis(60));
        assert!(publisher.is_running());
        publisher.stop();
        assert!(!publisher.is_running());

        assert!(publisher.stats().ticks.get() > 0);
        // Same permissions as any other thread of this process
        let expected = thread::spawn(elevate_timing_thread).join().unwrap();
        assert_eq!(publisher.stats().elevated.get(), expected.is_elevated());
        assert!(transport.published_beat() > 0.0);
    }
}
