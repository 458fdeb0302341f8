use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::arbiter::ModeArbiter;
use crate::capture::CaptureSink;
use crate::enrollment::{
    self, EnrollmentContext, EnrollmentOutcome, EnrollmentRequest, EnrollmentTiming,
    ImportRequest, DEFAULT_ENROLLMENT_TIMEOUT,
};
use crate::errors::{AppError, AppResult};
use crate::events::EventSink;
use crate::identification::{IdentificationLoop, IdentificationTiming};
use crate::index::MatchIndex;
use crate::record::{ExportEnvelope, IdentityRecord, IdentityRef, EXPORT_VERSION};
use crate::sensor::{ImageGeometry, Sensor};
use crate::store::IdentityStore;
use crate::template;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServiceConfig {
    pub enrollment_timeout: Duration,
    pub enrollment: EnrollmentTiming,
    pub identification: IdentificationTiming,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            enrollment_timeout: DEFAULT_ENROLLMENT_TIMEOUT,
            enrollment: EnrollmentTiming::default(),
            identification: IdentificationTiming::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceStatus {
    pub initialized: bool,
    pub identification_running: bool,
    pub enrollment_in_progress: bool,
    pub registered_count: usize,
    pub indexed_count: usize,
    pub image_width: u32,
    pub image_height: u32,
}

/// Collaborators handed to [`FingerprintService::start`].
pub struct ServiceParts {
    pub sensor: Box<dyn Sensor>,
    pub store: Arc<dyn IdentityStore>,
    pub capture: Arc<dyn CaptureSink>,
    pub sinks: Vec<Arc<dyn EventSink>>,
}

struct ServiceInner {
    arbiter: Arc<ModeArbiter>,
    store: Arc<dyn IdentityStore>,
    capture: Arc<dyn CaptureSink>,
    identification: IdentificationLoop,
    config: ServiceConfig,
}

impl Drop for ServiceInner {
    fn drop(&mut self) {
        self.identification.stop();
        if let Err(err) = self.arbiter.shutdown() {
            warn!(error = %err, "failed to close sensor");
        }
    }
}

/// Cheap-to-clone handle over the enrollment and identification core.
#[derive(Clone)]
pub struct FingerprintService {
    inner: Arc<ServiceInner>,
}

impl FingerprintService {
    /// Opens the sensor and rebuilds the matching index from the store.
    /// Identification is not started.
    pub fn start(config: ServiceConfig, parts: ServiceParts) -> AppResult<Self> {
        let ServiceParts {
            mut sensor,
            store,
            capture,
            sinks,
        } = parts;

        sensor.open()?;
        let geometry = match template::read_geometry(sensor.as_mut()) {
            Ok(geometry) => geometry,
            Err(err) => {
                let _ = sensor.close();
                return Err(err);
            }
        };

        let records = match store.list() {
            Ok(records) => records,
            Err(err) => {
                let _ = sensor.close();
                return Err(err);
            }
        };
        let mut index = MatchIndex::default();
        let mut skipped = 0usize;
        for record in &records {
            let registered = template::decode(sensor.as_ref(), &record.template_base64)
                .and_then(|bytes| index.register(sensor.as_mut(), &record.id, &bytes));
            if let Err(err) = registered {
                skipped += 1;
                warn!(
                    id = %record.id,
                    name = %record.name,
                    error = %err,
                    "identity excluded from matching index"
                );
            }
        }
        info!(
            width = geometry.width,
            height = geometry.height,
            indexed = index.len(),
            skipped,
            "fingerprint service initialized"
        );

        let arbiter = Arc::new(ModeArbiter::new(sensor, index, geometry));
        let identification = IdentificationLoop::new(
            Arc::clone(&arbiter),
            Arc::clone(&store),
            sinks,
            config.identification,
        );

        Ok(Self {
            inner: Arc::new(ServiceInner {
                arbiter,
                store,
                capture,
                identification,
                config,
            }),
        })
    }

    fn context(&self) -> EnrollmentContext<'_> {
        EnrollmentContext {
            arbiter: &self.inner.arbiter,
            store: self.inner.store.as_ref(),
            capture: self.inner.capture.as_ref(),
            identification: &self.inner.identification,
            timing: self.inner.config.enrollment,
        }
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.inner.config
    }

    pub fn geometry(&self) -> ImageGeometry {
        self.inner.arbiter.geometry()
    }

    /// Blocks the caller for up to `timeout` (the configured default when
    /// `None`) while three captures are taken.
    pub fn enroll(
        &self,
        name: &str,
        role: Option<&str>,
        timeout: Option<Duration>,
    ) -> AppResult<EnrollmentOutcome> {
        let request = EnrollmentRequest {
            name: name.to_string(),
            role: role.map(str::to_string),
            timeout: timeout.unwrap_or(self.inner.config.enrollment_timeout),
        };
        enrollment::run_enrollment(&self.context(), &request)
    }

    pub fn import_fingerprint(&self, request: &ImportRequest) -> AppResult<IdentityRecord> {
        enrollment::run_import(&self.context(), request)
    }

    pub fn import_envelope(&self, envelope: &ExportEnvelope) -> AppResult<IdentityRecord> {
        if envelope.version != EXPORT_VERSION {
            return Err(AppError::InvalidInput(format!(
                "unsupported export version '{}'",
                envelope.version
            )));
        }
        let fingerprint = envelope.fingerprint.as_ref().ok_or_else(|| {
            AppError::InvalidInput("export envelope has no fingerprint".into())
        })?;
        if fingerprint.template_base64.trim().is_empty() {
            return Err(AppError::InvalidInput("exported template is empty".into()));
        }
        self.import_fingerprint(&ImportRequest {
            name: fingerprint.name.clone(),
            role: fingerprint.role.clone(),
            template_base64: fingerprint.template_base64.clone(),
            original_created_at: fingerprint.original_created_at.clone(),
        })
    }

    pub fn export(&self, id: &str) -> AppResult<ExportEnvelope> {
        let record = self.get(id)?;
        Ok(ExportEnvelope::from_record(&record))
    }

    /// Matches a stored-format template against the enrolled population.
    pub fn identify_template(
        &self,
        template_base64: &str,
    ) -> AppResult<Option<(IdentityRecord, i32)>> {
        let matched = self.inner.arbiter.with_idle_device(|device| {
            let template = template::decode(&*device.sensor, template_base64)?;
            Ok(device
                .sensor
                .identify(&template)?
                .and_then(|(handle, score)| {
                    device.index.resolve(handle).map(|id| (id.to_string(), score))
                }))
        })?;
        match matched {
            Some((id, score)) => Ok(self
                .inner
                .store
                .find_by_id(&id)?
                .map(|record| (record, score))),
            None => Ok(None),
        }
    }

    pub fn check_duplicate(&self, template_base64: &str) -> AppResult<Option<IdentityRef>> {
        Ok(self
            .identify_template(template_base64)?
            .map(|(record, _)| record.reference()))
    }

    pub fn list(&self) -> AppResult<Vec<IdentityRecord>> {
        self.inner.store.list()
    }

    pub fn get(&self, id: &str) -> AppResult<IdentityRecord> {
        self.inner
            .store
            .find_by_id(id)?
            .ok_or_else(|| AppError::NotFound { id: id.to_string() })
    }

    /// Removes the record, its artifacts and its matching-index entry.
    pub fn delete(&self, id: &str) -> AppResult<IdentityRecord> {
        let store = self.inner.store.as_ref();
        let record = self.inner.arbiter.with_device(|device| {
            let record = store
                .find_by_id(id)?
                .ok_or_else(|| AppError::NotFound { id: id.to_string() })?;
            if !store.delete(id)? {
                return Err(AppError::NotFound { id: id.to_string() });
            }
            if let Err(err) = device.index.remove_identity(&mut *device.sensor, id) {
                warn!(id = %id, error = %err, "failed to remove identity from matching index");
            }
            Ok(record)
        })?;
        info!(id = %record.id, name = %record.name, "identity deleted");
        Ok(record)
    }

    pub fn start_identification(&self) -> AppResult<bool> {
        self.inner.arbiter.ensure_initialized()?;
        self.inner.identification.start()
    }

    pub fn stop_identification(&self) {
        self.inner.identification.stop();
    }

    /// Registers `hook` to receive the error when identification stops
    /// because the reader is gone. The service stays up; callers decide
    /// whether to shut it down.
    pub fn on_sensor_lost(&self, hook: impl Fn(AppError) + Send + Sync + 'static) {
        self.inner
            .identification
            .set_sensor_lost_hook(Arc::new(hook));
    }

    pub fn is_identification_running(&self) -> bool {
        self.inner.identification.is_running()
    }

    pub fn is_enrollment_in_progress(&self) -> bool {
        self.inner.arbiter.snapshot().enrollment_in_progress
    }

    pub fn status(&self) -> AppResult<ServiceStatus> {
        let snapshot = self.inner.arbiter.snapshot();
        let geometry = self.inner.arbiter.geometry();
        Ok(ServiceStatus {
            initialized: snapshot.initialized,
            identification_running: snapshot.identification_running,
            enrollment_in_progress: snapshot.enrollment_in_progress,
            registered_count: self.inner.store.count()?,
            indexed_count: snapshot.indexed_count,
            image_width: geometry.width,
            image_height: geometry.height,
        })
    }

    /// Stops identification and closes the sensor. Later operations that
    /// need the reader fail with `NotInitialized`.
    pub fn shutdown(&self) -> AppResult<()> {
        self.inner.identification.stop();
        self.inner.arbiter.shutdown()?;
        info!("fingerprint service shut down");
        Ok(())
    }
}
