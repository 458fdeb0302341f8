use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::Serialize;
use tracing::debug;

use crate::errors::{AppError, AppResult};
use crate::identification::WorkerControl;
use crate::index::MatchIndex;
use crate::sensor::{ImageGeometry, Sensor};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

impl LoopState {
    pub fn is_active(self) -> bool {
        matches!(self, LoopState::Starting | LoopState::Running)
    }
}

/// Exclusive view of the reader and its matching database.
pub struct Device<'a> {
    pub sensor: &'a mut dyn Sensor,
    pub index: &'a mut MatchIndex,
    pub geometry: ImageGeometry,
}

pub(crate) struct ArbiterState {
    sensor: Box<dyn Sensor>,
    index: MatchIndex,
    geometry: ImageGeometry,
    pub(crate) initialized: bool,
    pub(crate) enrollment_in_flight: bool,
    pub(crate) loop_state: LoopState,
    pub(crate) worker: Option<WorkerControl>,
    pub(crate) generation: u64,
}

impl ArbiterState {
    fn device(&mut self) -> Device<'_> {
        Device {
            sensor: self.sensor.as_mut(),
            index: &mut self.index,
            geometry: self.geometry,
        }
    }

    pub(crate) fn worker_generation(&self) -> Option<u64> {
        self.worker.as_ref().map(WorkerControl::generation)
    }
}

/// Result of an identification poll attempt.
#[derive(Debug)]
pub enum Poll<T> {
    Ready(T),
    /// An enrollment owns the reader.
    Yielded,
    /// The calling worker is no longer the active identification run.
    Retired,
}

/// Start/stop surface the arbiter uses to pause identification around an
/// enrollment.
pub trait IdentificationControl: Send + Sync {
    fn start(&self) -> AppResult<bool>;
    fn stop(&self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ArbiterSnapshot {
    pub initialized: bool,
    pub identification_running: bool,
    pub enrollment_in_progress: bool,
    pub indexed_count: usize,
}

/// Single lock over the reader, the matching index and the mode flags.
pub struct ModeArbiter {
    state: Mutex<ArbiterState>,
}

impl ModeArbiter {
    pub fn new(sensor: Box<dyn Sensor>, index: MatchIndex, geometry: ImageGeometry) -> Self {
        Self {
            state: Mutex::new(ArbiterState {
                sensor,
                index,
                geometry,
                initialized: true,
                enrollment_in_flight: false,
                loop_state: LoopState::Stopped,
                worker: None,
                generation: 0,
            }),
        }
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, ArbiterState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn ensure_initialized(&self) -> AppResult<()> {
        if self.lock().initialized {
            Ok(())
        } else {
            Err(AppError::NotInitialized)
        }
    }

    /// Runs `op` with the reader. Used by the enrollment holder and by
    /// housekeeping that may interleave with it (delete).
    pub fn with_device<T>(&self, op: impl FnOnce(&mut Device<'_>) -> AppResult<T>) -> AppResult<T> {
        let mut state = self.lock();
        if !state.initialized {
            return Err(AppError::NotInitialized);
        }
        op(&mut state.device())
    }

    /// Like `with_device`, but refused with `Busy` while an enrollment owns
    /// the reader.
    pub fn with_idle_device<T>(
        &self,
        op: impl FnOnce(&mut Device<'_>) -> AppResult<T>,
    ) -> AppResult<T> {
        let mut state = self.lock();
        if !state.initialized {
            return Err(AppError::NotInitialized);
        }
        if state.enrollment_in_flight {
            return Err(AppError::Busy);
        }
        op(&mut state.device())
    }

    /// Identification entry point: the flag check and the sensor calls share
    /// one lock hold.
    pub(crate) fn poll_when_idle<T>(
        &self,
        generation: u64,
        op: impl FnOnce(&mut Device<'_>) -> AppResult<T>,
    ) -> AppResult<Poll<T>> {
        let mut state = self.lock();
        if !state.initialized
            || state.loop_state != LoopState::Running
            || state.worker_generation() != Some(generation)
        {
            return Ok(Poll::Retired);
        }
        if state.enrollment_in_flight {
            return Ok(Poll::Yielded);
        }
        op(&mut state.device()).map(Poll::Ready)
    }

    /// Claims the reader for one enrollment, pausing identification if it
    /// was running. The returned lease restores it on drop.
    pub fn begin_enrollment<'a>(
        &'a self,
        identification: &'a dyn IdentificationControl,
    ) -> AppResult<EnrollmentLease<'a>> {
        let resume = {
            let mut state = self.lock();
            if !state.initialized {
                return Err(AppError::NotInitialized);
            }
            if state.enrollment_in_flight {
                return Err(AppError::Busy);
            }
            state.enrollment_in_flight = true;
            state.loop_state.is_active()
        };

        if resume {
            debug!("pausing identification for enrollment");
            identification.stop();
        }

        Ok(EnrollmentLease {
            arbiter: self,
            identification,
            resume,
        })
    }

    pub fn snapshot(&self) -> ArbiterSnapshot {
        let state = self.lock();
        ArbiterSnapshot {
            initialized: state.initialized,
            identification_running: state.loop_state.is_active(),
            enrollment_in_progress: state.enrollment_in_flight,
            indexed_count: state.index.len(),
        }
    }

    pub fn loop_state(&self) -> LoopState {
        self.lock().loop_state
    }

    pub fn geometry(&self) -> ImageGeometry {
        self.lock().geometry
    }

    /// Marks the arbiter uninitialized and closes the reader. Idempotent.
    pub fn shutdown(&self) -> AppResult<()> {
        let mut state = self.lock();
        if !state.initialized {
            return Ok(());
        }
        state.initialized = false;
        state.sensor.close()
    }
}

/// Held for the duration of one enrollment.
pub struct EnrollmentLease<'a> {
    arbiter: &'a ModeArbiter,
    identification: &'a dyn IdentificationControl,
    resume: bool,
}

impl EnrollmentLease<'_> {
    pub fn resumes_identification(&self) -> bool {
        self.resume
    }
}

impl Drop for EnrollmentLease<'_> {
    fn drop(&mut self) {
        self.arbiter.lock().enrollment_in_flight = false;
        if self.resume {
            debug!("resuming identification after enrollment");
            if let Err(err) = self.identification.start() {
                tracing::error!(error = %err, "failed to resume identification");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sensor::{MatchHandle, Sample};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct IdleSensor;

    impl Sensor for IdleSensor {
        fn open(&mut self) -> AppResult<()> {
            Ok(())
        }
        fn close(&mut self) -> AppResult<()> {
            Ok(())
        }
        fn parameter(&mut self, _code: u32) -> AppResult<[u8; 4]> {
            Ok([0; 4])
        }
        fn acquire(&mut self) -> AppResult<Option<Sample>> {
            Ok(None)
        }
        fn match_pair(&mut self, _first: &[u8], _second: &[u8]) -> AppResult<i32> {
            Ok(0)
        }
        fn merge(&mut self, first: &[u8], _second: &[u8], _third: &[u8]) -> AppResult<Vec<u8>> {
            Ok(first.to_vec())
        }
        fn identify(&mut self, _template: &[u8]) -> AppResult<Option<(MatchHandle, i32)>> {
            Ok(None)
        }
        fn add_to_index(&mut self, _handle: MatchHandle, _template: &[u8]) -> AppResult<()> {
            Ok(())
        }
        fn remove_from_index(&mut self, _handle: MatchHandle) -> AppResult<()> {
            Ok(())
        }
        fn encode_template(&self, _template: &[u8]) -> String {
            String::new()
        }
        fn decode_template(&self, _text: &str) -> AppResult<Vec<u8>> {
            Ok(Vec::new())
        }
    }

    #[derive(Default)]
    struct CountingControl {
        starts: AtomicUsize,
        stops: AtomicUsize,
    }

    impl IdentificationControl for CountingControl {
        fn start(&self) -> AppResult<bool> {
            self.starts.fetch_add(1, Ordering::SeqCst);
            Ok(true)
        }
        fn stop(&self) {
            self.stops.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn arbiter() -> ModeArbiter {
        ModeArbiter::new(
            Box::new(IdleSensor),
            MatchIndex::default(),
            ImageGeometry {
                width: 1,
                height: 1,
            },
        )
    }

    #[test]
    fn second_enrollment_is_busy() {
        let arbiter = arbiter();
        let control = CountingControl::default();
        let lease = arbiter.begin_enrollment(&control).unwrap();
        assert!(arbiter.snapshot().enrollment_in_progress);
        assert!(matches!(
            arbiter.begin_enrollment(&control),
            Err(AppError::Busy)
        ));
        drop(lease);
        assert!(!arbiter.snapshot().enrollment_in_progress);
        assert!(arbiter.begin_enrollment(&control).is_ok());
    }

    #[test]
    fn lease_pauses_and_resumes_active_identification() {
        let arbiter = arbiter();
        arbiter.lock().loop_state = LoopState::Running;
        let control = CountingControl::default();

        let lease = arbiter.begin_enrollment(&control).unwrap();
        assert!(lease.resumes_identification());
        assert_eq!(control.stops.load(Ordering::SeqCst), 1);
        assert_eq!(control.starts.load(Ordering::SeqCst), 0);
        drop(lease);
        assert_eq!(control.starts.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn lease_leaves_stopped_identification_alone() {
        let arbiter = arbiter();
        let control = CountingControl::default();
        drop(arbiter.begin_enrollment(&control).unwrap());
        assert_eq!(control.stops.load(Ordering::SeqCst), 0);
        assert_eq!(control.starts.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn idle_device_is_refused_during_enrollment() {
        let arbiter = arbiter();
        let control = CountingControl::default();
        let _lease = arbiter.begin_enrollment(&control).unwrap();
        assert!(matches!(
            arbiter.with_idle_device(|_| Ok(())),
            Err(AppError::Busy)
        ));
        assert!(arbiter.with_device(|_| Ok(())).is_ok());
    }

    #[test]
    fn shutdown_rejects_further_use() {
        let arbiter = arbiter();
        arbiter.shutdown().unwrap();
        assert!(matches!(
            arbiter.with_device(|_| Ok(())),
            Err(AppError::NotInitialized)
        ));
        let control = CountingControl::default();
        assert!(matches!(
            arbiter.begin_enrollment(&control),
            Err(AppError::NotInitialized)
        ));
        arbiter.shutdown().unwrap();
    }
}
