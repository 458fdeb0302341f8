use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::arbiter::{IdentificationControl, LoopState, ModeArbiter, Poll};
use crate::errors::{AppError, AppResult};
use crate::events::{EventSink, IdentificationEvent};
use crate::record::timestamp_now;
use crate::store::IdentityStore;

pub const IDENTIFY_THREAD_NAME: &str = "fingergate-identify";
pub const SCAN_TARGET: &str = "fingergate::scan";

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(200);
pub const DEFAULT_ENROLLMENT_IDLE: Duration = Duration::from_millis(100);
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(2000);
pub const DEFAULT_STOP_GRACE: Duration = Duration::from_millis(2000);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdentificationTiming {
    /// Backoff after a poll that found no finger.
    pub poll_interval: Duration,
    /// Recheck interval while an enrollment owns the reader.
    pub enrollment_idle: Duration,
    /// Pause after every successful capture.
    pub debounce: Duration,
    /// Upper bound `stop` waits for the worker to exit.
    pub stop_grace: Duration,
}

impl Default for IdentificationTiming {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            enrollment_idle: DEFAULT_ENROLLMENT_IDLE,
            debounce: DEFAULT_DEBOUNCE,
            stop_grace: DEFAULT_STOP_GRACE,
        }
    }
}

/// Bookkeeping for one running worker thread, kept in the arbiter state.
pub(crate) struct WorkerControl {
    generation: u64,
    stop_tx: Sender<()>,
    done_rx: Receiver<()>,
    handle: JoinHandle<()>,
}

impl WorkerControl {
    pub(crate) fn generation(&self) -> u64 {
        self.generation
    }
}

/// Called once when the worker retires because the reader is gone.
pub type SensorLostHook = Arc<dyn Fn(AppError) + Send + Sync>;

/// What one locked poll produced.
enum Scan {
    NoFinger,
    Captured(Option<(String, i32)>),
}

/// Background identification: at most one worker thread per arbiter.
#[derive(Clone)]
pub struct IdentificationLoop {
    arbiter: Arc<ModeArbiter>,
    store: Arc<dyn IdentityStore>,
    sinks: Arc<[Arc<dyn EventSink>]>,
    timing: IdentificationTiming,
    sensor_lost: Arc<Mutex<Option<SensorLostHook>>>,
}

impl IdentificationLoop {
    pub fn new(
        arbiter: Arc<ModeArbiter>,
        store: Arc<dyn IdentityStore>,
        sinks: Vec<Arc<dyn EventSink>>,
        timing: IdentificationTiming,
    ) -> Self {
        Self {
            arbiter,
            store,
            sinks: sinks.into(),
            timing,
            sensor_lost: Arc::new(Mutex::new(None)),
        }
    }

    /// Replaces the callback run when the reader disappears mid-loop.
    pub fn set_sensor_lost_hook(&self, hook: SensorLostHook) {
        *self
            .sensor_lost
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(hook);
    }

    pub fn is_running(&self) -> bool {
        self.arbiter.loop_state().is_active()
    }

    /// Spawns the worker. Returns `false` when already running or the
    /// service is not initialized.
    pub fn start(&self) -> AppResult<bool> {
        let mut state = self.arbiter.lock();
        if !state.initialized || state.loop_state.is_active() {
            return Ok(false);
        }

        state.loop_state = LoopState::Starting;
        state.generation += 1;
        let generation = state.generation;
        let (stop_tx, stop_rx) = mpsc::channel();
        let (done_tx, done_rx) = mpsc::channel();
        let worker = self.clone();

        let spawned = thread::Builder::new()
            .name(IDENTIFY_THREAD_NAME.into())
            .spawn(move || {
                worker.run(generation, &stop_rx);
                let _ = done_tx.send(());
            });
        let handle = match spawned {
            Ok(handle) => handle,
            Err(err) => {
                state.loop_state = LoopState::Stopped;
                return Err(err.into());
            }
        };

        state.worker = Some(WorkerControl {
            generation,
            stop_tx,
            done_rx,
            handle,
        });
        state.loop_state = LoopState::Running;
        info!(generation, "identification started");
        Ok(true)
    }

    /// Signals the worker and waits up to the stop grace period. A worker
    /// that overruns is detached; it can no longer reach the reader.
    pub fn stop(&self) {
        let control = {
            let mut state = self.arbiter.lock();
            if !state.loop_state.is_active() {
                return;
            }
            state.loop_state = LoopState::Stopping;
            state.worker.take()
        };

        if let Some(control) = control {
            let _ = control.stop_tx.send(());
            match control.done_rx.recv_timeout(self.timing.stop_grace) {
                Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                    if control.handle.join().is_err() {
                        warn!("identification worker panicked");
                    }
                }
                Err(RecvTimeoutError::Timeout) => {
                    warn!(
                        grace_ms = self.timing.stop_grace.as_millis() as u64,
                        "identification worker did not stop in time; detaching it"
                    );
                }
            }
        }

        let mut state = self.arbiter.lock();
        if state.worker.is_none() && state.loop_state == LoopState::Stopping {
            state.loop_state = LoopState::Stopped;
        }
        info!("identification stopped");
    }

    fn run(&self, generation: u64, stop_rx: &Receiver<()>) {
        debug!(generation, "identification worker running");
        loop {
            let scanned = self.arbiter.poll_when_idle(generation, |device| {
                let Some(sample) = device.sensor.acquire()? else {
                    return Ok(Scan::NoFinger);
                };
                let matched = device.sensor.identify(&sample.template)?;
                let resolved = matched.and_then(|(handle, score)| {
                    device
                        .index
                        .resolve(handle)
                        .map(|id| (id.to_string(), score))
                });
                Ok(Scan::Captured(resolved))
            });

            let pause = match scanned {
                Ok(Poll::Retired) => break,
                Ok(Poll::Yielded) => self.timing.enrollment_idle,
                Ok(Poll::Ready(Scan::NoFinger)) => self.timing.poll_interval,
                Ok(Poll::Ready(Scan::Captured(matched))) => {
                    self.dispatch(matched);
                    self.timing.debounce
                }
                Err(err) if err.is_device_lost() => {
                    error!(error = %err, "sensor lost; identification stopped");
                    self.retire(generation);
                    self.report_lost(err);
                    break;
                }
                Err(err) => {
                    warn!(error = %err, "identification poll failed");
                    self.timing.poll_interval
                }
            };

            if wait_for_stop(stop_rx, pause) {
                break;
            }
        }
        debug!(generation, "identification worker exiting");
    }

    fn dispatch(&self, matched: Option<(String, i32)>) {
        let at = timestamp_now();
        let record = match &matched {
            Some((id, _)) => match self.store.find_by_id(id) {
                Ok(record) => record,
                Err(err) => {
                    warn!(id = %id, error = %err, "failed to load matched identity");
                    None
                }
            },
            None => None,
        };

        let event = match (record, matched) {
            (Some(record), Some((_, score))) => {
                info!(
                    target: SCAN_TARGET,
                    id = %record.id,
                    name = %record.name,
                    role = %record.role,
                    score,
                    "IDENTIFIED"
                );
                IdentificationEvent::Identified { record, score, at }
            }
            _ => {
                info!(target: SCAN_TARGET, "UNIDENTIFIED | no match found");
                IdentificationEvent::Unidentified { at }
            }
        };

        for sink in self.sinks.iter() {
            sink.notify(&event);
        }
    }

    fn report_lost(&self, err: AppError) {
        let hook = self
            .sensor_lost
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(hook) = hook {
            hook(err);
        }
    }

    fn retire(&self, generation: u64) {
        let mut state = self.arbiter.lock();
        if state.worker_generation() == Some(generation) {
            state.worker = None;
            state.loop_state = LoopState::Stopped;
        }
    }
}

impl IdentificationControl for IdentificationLoop {
    fn start(&self) -> AppResult<bool> {
        IdentificationLoop::start(self)
    }

    fn stop(&self) {
        IdentificationLoop::stop(self)
    }
}

/// Sleeps for `pause`, returning early with `true` once a stop is signalled.
fn wait_for_stop(stop_rx: &Receiver<()>, pause: Duration) -> bool {
    match stop_rx.recv_timeout(pause) {
        Ok(()) | Err(RecvTimeoutError::Disconnected) => true,
        Err(RecvTimeoutError::Timeout) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wait_for_stop_returns_early_on_signal() {
        let (tx, rx) = mpsc::channel();
        tx.send(()).unwrap();
        let started = std::time::Instant::now();
        assert!(wait_for_stop(&rx, Duration::from_secs(5)));
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn wait_for_stop_times_out_without_signal() {
        let (_tx, rx) = mpsc::channel::<()>();
        assert!(!wait_for_stop(&rx, Duration::from_millis(10)));
    }

    #[test]
    fn dropped_sender_counts_as_stop() {
        let (tx, rx) = mpsc::channel::<()>();
        drop(tx);
        assert!(wait_for_stop(&rx, Duration::from_secs(5)));
    }
}
