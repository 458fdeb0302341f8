#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use base64::{engine::general_purpose, Engine as _};
use fingergate_core::capture::FileCaptureSink;
use fingergate_core::enrollment::EnrollmentTiming;
use fingergate_core::errors::{AppError, AppResult};
use fingergate_core::identification::{IdentificationTiming, IDENTIFY_THREAD_NAME};
use fingergate_core::sensor::matcher::encode_features;
use fingergate_core::sensor::{
    FeatureMatcher, ImageGeometry, MatchHandle, Sample, Sensor, PARAM_IMAGE_HEIGHT,
    PARAM_IMAGE_WIDTH,
};
use fingergate_core::store::JsonIdentityStore;
use fingergate_core::{
    ChannelEventSink, EventSink, FingerprintService, IdentificationEvent, ServiceConfig, ServiceParts,
};
use tempfile::TempDir;

pub const GEOMETRY: ImageGeometry = ImageGeometry {
    width: 2,
    height: 2,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Caller {
    Enrollment,
    Identification,
}

/// Shared script the test drives while the service owns the sensor.
#[derive(Default)]
pub struct SensorScript {
    enrollment: Mutex<VecDeque<Sample>>,
    identification: Mutex<VecDeque<Sample>>,
    calls: Mutex<Vec<Caller>>,
    lost: AtomicBool,
    fail_merge: AtomicBool,
    failing_acquires: AtomicUsize,
}

impl SensorScript {
    pub fn push_enrollment(&self, template: Vec<u8>) {
        self.enrollment.lock().unwrap().push_back(sample(template));
    }

    pub fn push_identification(&self, template: Vec<u8>) {
        self.identification.lock().unwrap().push_back(sample(template));
    }

    pub fn calls(&self) -> Vec<Caller> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, caller: Caller) -> usize {
        self.calls().into_iter().filter(|c| *c == caller).count()
    }

    pub fn pending_identification(&self) -> usize {
        self.identification.lock().unwrap().len()
    }

    pub fn set_lost(&self, lost: bool) {
        self.lost.store(lost, Ordering::SeqCst);
    }

    /// The next `count` acquire calls fail with a recoverable device error.
    pub fn fail_acquires(&self, count: usize) {
        self.failing_acquires.store(count, Ordering::SeqCst);
    }

    pub fn fail_merge(&self) {
        self.fail_merge.store(true, Ordering::SeqCst);
    }
}

fn sample(template: Vec<u8>) -> Sample {
    Sample {
        image: vec![10, 20, 30, 40],
        template,
    }
}

/// One-hot feature vector; distinct fingers never match each other.
pub fn finger(n: usize) -> Vec<u8> {
    let mut features = vec![0.0f32; 4];
    features[n % 4] = 1.0;
    encode_features(&features)
}

pub fn finger_base64(n: usize) -> String {
    general_purpose::STANDARD.encode(finger(n))
}

pub struct ScriptedSensor {
    script: Arc<SensorScript>,
    matcher: FeatureMatcher,
}

impl ScriptedSensor {
    pub fn new(script: Arc<SensorScript>) -> Self {
        Self {
            script,
            matcher: FeatureMatcher::new(50),
        }
    }
}

impl Sensor for ScriptedSensor {
    fn open(&mut self) -> AppResult<()> {
        Ok(())
    }

    fn close(&mut self) -> AppResult<()> {
        Ok(())
    }

    fn parameter(&mut self, code: u32) -> AppResult<[u8; 4]> {
        match code {
            PARAM_IMAGE_WIDTH => Ok(GEOMETRY.width.to_le_bytes()),
            PARAM_IMAGE_HEIGHT => Ok(GEOMETRY.height.to_le_bytes()),
            _ => Err(AppError::Device {
                operation: "parameter",
                code: -3,
            }),
        }
    }

    fn acquire(&mut self) -> AppResult<Option<Sample>> {
        let caller = if thread::current().name() == Some(IDENTIFY_THREAD_NAME) {
            Caller::Identification
        } else {
            Caller::Enrollment
        };
        self.script.calls.lock().unwrap().push(caller);
        if self.script.lost.load(Ordering::SeqCst) {
            return Err(AppError::DeviceLost("unplugged".into()));
        }
        let failing = &self.script.failing_acquires;
        if failing
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(AppError::Device {
                operation: "acquire",
                code: -5,
            });
        }
        let queue = match caller {
            Caller::Enrollment => &self.script.enrollment,
            Caller::Identification => &self.script.identification,
        };
        Ok(queue.lock().unwrap().pop_front())
    }

    fn match_pair(&mut self, first: &[u8], second: &[u8]) -> AppResult<i32> {
        self.matcher.score(first, second)
    }

    fn merge(&mut self, first: &[u8], second: &[u8], third: &[u8]) -> AppResult<Vec<u8>> {
        if self.script.fail_merge.load(Ordering::SeqCst) {
            return Err(AppError::MergeFailed { code: -7 });
        }
        self.matcher.merge(first, second, third)
    }

    fn identify(&mut self, template: &[u8]) -> AppResult<Option<(MatchHandle, i32)>> {
        self.matcher.identify(template)
    }

    fn add_to_index(&mut self, handle: MatchHandle, template: &[u8]) -> AppResult<()> {
        self.matcher.insert(handle, template)
    }

    fn remove_from_index(&mut self, handle: MatchHandle) -> AppResult<()> {
        self.matcher.remove(handle);
        Ok(())
    }

    fn encode_template(&self, template: &[u8]) -> String {
        general_purpose::STANDARD.encode(template)
    }

    fn decode_template(&self, text: &str) -> AppResult<Vec<u8>> {
        general_purpose::STANDARD
            .decode(text)
            .map_err(|err| AppError::InvalidInput(err.to_string()))
    }
}

pub fn fast_config() -> ServiceConfig {
    ServiceConfig {
        enrollment_timeout: Duration::from_secs(2),
        enrollment: EnrollmentTiming {
            poll_interval: Duration::from_millis(2),
            capture_pause: Duration::from_millis(1),
        },
        identification: IdentificationTiming {
            poll_interval: Duration::from_millis(5),
            enrollment_idle: Duration::from_millis(5),
            debounce: Duration::from_millis(50),
            stop_grace: Duration::from_secs(1),
        },
    }
}

pub struct Harness {
    pub service: FingerprintService,
    pub script: Arc<SensorScript>,
    pub store: Arc<JsonIdentityStore>,
    pub events: Receiver<IdentificationEvent>,
    pub dir: TempDir,
}

pub fn harness() -> Harness {
    harness_with(fast_config(), TempDir::new().unwrap())
}

pub fn harness_with(config: ServiceConfig, dir: TempDir) -> Harness {
    harness_with_sinks(config, dir, Vec::new())
}

/// Like `harness_with`; `extra` sinks run after the channel sink.
pub fn harness_with_sinks(
    config: ServiceConfig,
    dir: TempDir,
    extra: Vec<Arc<dyn EventSink>>,
) -> Harness {
    let script = Arc::new(SensorScript::default());
    let store = Arc::new(JsonIdentityStore::open(dir.path()).unwrap());
    let (tx, events) = mpsc::sync_channel(64);
    let sink: Arc<dyn EventSink> = Arc::new(ChannelEventSink::new(tx));
    let mut sinks = vec![sink];
    sinks.extend(extra);
    let service = FingerprintService::start(
        config,
        ServiceParts {
            sensor: Box::new(ScriptedSensor::new(Arc::clone(&script))),
            store: store.clone(),
            capture: Arc::new(FileCaptureSink::new(store.records_dir())),
            sinks,
        },
    )
    .unwrap();
    Harness {
        service,
        script,
        store,
        events,
        dir,
    }
}

/// Polls `condition` until it holds or `timeout` elapses.
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(2));
    }
    condition()
}

pub fn enroll_finger(harness: &Harness, name: &str, n: usize) -> fingergate_core::IdentityRecord {
    for _ in 0..3 {
        harness.script.push_enrollment(finger(n));
    }
    harness
        .service
        .enroll(name, None, None)
        .expect("enrollment succeeds")
        .record
}
