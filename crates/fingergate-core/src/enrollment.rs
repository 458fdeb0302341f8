use std::thread::sleep;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::arbiter::{Device, IdentificationControl, ModeArbiter};
use crate::capture::CaptureSink;
use crate::errors::{AppError, AppResult, ConflictReason};
use crate::record::{timestamp_now, IdentityRecord, IdentityRef, Role};
use crate::sensor::Sample;
use crate::store::IdentityStore;
use crate::template;

pub const REQUIRED_CAPTURES: usize = 3;
pub const DEFAULT_ENROLLMENT_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_CAPTURE_POLL: Duration = Duration::from_millis(100);
pub const DEFAULT_CAPTURE_PAUSE: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnrollmentTiming {
    /// Backoff after a poll that found no finger.
    pub poll_interval: Duration,
    /// Pause after an accepted capture so the finger can be lifted.
    pub capture_pause: Duration,
}

impl Default for EnrollmentTiming {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_CAPTURE_POLL,
            capture_pause: DEFAULT_CAPTURE_PAUSE,
        }
    }
}

#[derive(Debug, Clone)]
pub struct EnrollmentRequest {
    pub name: String,
    pub role: Option<String>,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct ImportRequest {
    pub name: String,
    pub role: Option<String>,
    pub template_base64: String,
    pub original_created_at: Option<String>,
}

#[derive(Debug)]
pub struct EnrollmentOutcome {
    pub record: IdentityRecord,
    pub rejected_captures: usize,
    pub logs: Vec<String>,
}

pub(crate) struct EnrollmentContext<'a> {
    pub arbiter: &'a ModeArbiter,
    pub store: &'a dyn IdentityStore,
    pub capture: &'a dyn CaptureSink,
    pub identification: &'a dyn IdentificationControl,
    pub timing: EnrollmentTiming,
}

enum CaptureStep {
    NoFinger,
    Accepted(Sample),
    DifferentFinger(i32),
    Duplicate(IdentityRef),
}

pub fn validate_name(name: &str) -> AppResult<String> {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return Err(AppError::InvalidInput("name must not be empty".into()));
    }
    Ok(trimmed.to_string())
}

fn ensure_name_available(store: &dyn IdentityStore, name: &str) -> AppResult<()> {
    match store.find_by_name(name)? {
        Some(existing) => Err(AppError::Conflict {
            reason: ConflictReason::Name,
            existing: existing.reference(),
        }),
        None => Ok(()),
    }
}

/// Identity already enrolled with `template`. A match whose record has
/// been removed from the store does not count.
fn enrolled_match(
    device: &mut Device<'_>,
    store: &dyn IdentityStore,
    template: &[u8],
) -> AppResult<Option<IdentityRef>> {
    let Some((handle, score)) = device.sensor.identify(template)? else {
        return Ok(None);
    };
    let Some(id) = device.index.resolve(handle) else {
        return Ok(None);
    };
    match store.find_by_id(id)? {
        Some(record) => {
            debug!(score, id = %record.id, "template matches an enrolled identity");
            Ok(Some(record.reference()))
        }
        None => {
            warn!(id = %id, "matched identity has no stored record; ignoring match");
            Ok(None)
        }
    }
}

fn fingerprint_conflict(existing: IdentityRef) -> AppError {
    AppError::Conflict {
        reason: ConflictReason::Fingerprint,
        existing,
    }
}

/// Three-capture enrollment of one finger for a new identity.
pub(crate) fn run_enrollment(
    ctx: &EnrollmentContext<'_>,
    request: &EnrollmentRequest,
) -> AppResult<EnrollmentOutcome> {
    let name = validate_name(&request.name)?;
    let role = Role::parse_optional(request.role.as_deref())?;
    if request.timeout.is_zero() {
        return Err(AppError::InvalidInput(
            "timeout must be greater than zero".into(),
        ));
    }
    ctx.arbiter.ensure_initialized()?;
    ensure_name_available(ctx.store, &name)?;

    let _lease = ctx.arbiter.begin_enrollment(ctx.identification)?;
    let id = ctx.store.next_id();
    info!(id = %id, name = %name, role = %role, "enrollment started");

    let mut logs = vec![format!("Enrolling '{name}' as {role} (id {id})")];
    let result = collect_and_persist(ctx, &id, &name, role, request.timeout, &mut logs);
    match result {
        Ok((record, rejected_captures)) => {
            info!(id = %record.id, name = %record.name, "enrollment completed");
            logs.push(format!("Enrollment successful: {} ({})", record.name, record.id));
            Ok(EnrollmentOutcome {
                record,
                rejected_captures,
                logs,
            })
        }
        Err(err) => {
            warn!(id = %id, error = %err, "enrollment failed");
            if let Err(cleanup) = ctx.capture.discard(&id) {
                warn!(id = %id, error = %cleanup, "failed to remove capture images");
            }
            Err(err)
        }
    }
}

fn collect_and_persist(
    ctx: &EnrollmentContext<'_>,
    id: &str,
    name: &str,
    role: Role,
    timeout: Duration,
    logs: &mut Vec<String>,
) -> AppResult<(IdentityRecord, usize)> {
    let deadline = Instant::now() + timeout;
    let mut accepted: Vec<Vec<u8>> = Vec::with_capacity(REQUIRED_CAPTURES);
    let mut rejected = 0usize;

    while accepted.len() < REQUIRED_CAPTURES {
        if Instant::now() >= deadline {
            return Err(AppError::Timeout {
                captured: accepted.len(),
                required: REQUIRED_CAPTURES,
            });
        }

        let previous = accepted.last().map(Vec::as_slice);
        let (step, geometry) = ctx.arbiter.with_device(|device| {
            Ok((capture_step(device, ctx.store, previous)?, device.geometry))
        })?;

        match step {
            CaptureStep::NoFinger => pause_until(ctx.timing.poll_interval, deadline),
            CaptureStep::Duplicate(existing) => return Err(fingerprint_conflict(existing)),
            CaptureStep::DifferentFinger(score) => {
                rejected += 1;
                debug!(score, accepted = accepted.len(), "capture rejected: different finger");
                logs.push(format!(
                    "Capture rejected (score {score}); place the same finger again"
                ));
                pause_until(ctx.timing.poll_interval, deadline);
            }
            CaptureStep::Accepted(sample) => {
                let number = accepted.len() + 1;
                if !sample.image.is_empty() {
                    match ctx.capture.save(id, number, &sample.image, geometry) {
                        Ok(path) => logs.push(format!(
                            "Capture {number}/{REQUIRED_CAPTURES} saved to {}",
                            path.display()
                        )),
                        Err(err) => warn!(capture = number, error = %err, "capture image not saved"),
                    }
                } else {
                    logs.push(format!("Capture {number}/{REQUIRED_CAPTURES} accepted"));
                }
                accepted.push(sample.template);
                if accepted.len() < REQUIRED_CAPTURES {
                    pause_until(ctx.timing.capture_pause, deadline);
                }
            }
        }
    }

    let record = ctx.arbiter.with_device(|device| {
        let merged = device
            .sensor
            .merge(&accepted[0], &accepted[1], &accepted[2])?;
        let record = IdentityRecord {
            id: id.to_string(),
            name: name.to_string(),
            role,
            template_base64: template::encode(&*device.sensor, &merged),
            created_at: timestamp_now(),
        };
        persist_and_index(device, ctx.store, record, &merged)
    })?;
    Ok((record, rejected))
}

fn capture_step(
    device: &mut Device<'_>,
    store: &dyn IdentityStore,
    previous: Option<&[u8]>,
) -> AppResult<CaptureStep> {
    let Some(sample) = device.sensor.acquire()? else {
        return Ok(CaptureStep::NoFinger);
    };

    match previous {
        None => match enrolled_match(device, store, &sample.template)? {
            Some(existing) => Ok(CaptureStep::Duplicate(existing)),
            None => Ok(CaptureStep::Accepted(sample)),
        },
        Some(previous) => {
            let score = device.sensor.match_pair(previous, &sample.template)?;
            if score <= 0 {
                Ok(CaptureStep::DifferentFinger(score))
            } else {
                Ok(CaptureStep::Accepted(sample))
            }
        }
    }
}

/// Stores the record and registers its template; the store write is undone
/// if the sensor refuses the template.
fn persist_and_index(
    device: &mut Device<'_>,
    store: &dyn IdentityStore,
    record: IdentityRecord,
    template: &[u8],
) -> AppResult<IdentityRecord> {
    store.add(record.clone())?;
    if let Err(err) = device.index.register(&mut *device.sensor, &record.id, template) {
        if let Err(rollback) = store.delete(&record.id) {
            warn!(id = %record.id, error = %rollback, "failed to roll back identity");
        }
        return Err(err);
    }
    Ok(record)
}

/// Imports a template captured elsewhere. The record is stamped with the
/// current time; `original_created_at` is informational only.
pub(crate) fn run_import(
    ctx: &EnrollmentContext<'_>,
    request: &ImportRequest,
) -> AppResult<IdentityRecord> {
    let name = validate_name(&request.name)?;
    let role = Role::parse_optional(request.role.as_deref())?;
    ctx.arbiter.ensure_initialized()?;
    ensure_name_available(ctx.store, &name)?;

    let record = ctx.arbiter.with_idle_device(|device| {
        let template = template::decode(&*device.sensor, &request.template_base64)?;
        if let Some(existing) = enrolled_match(device, ctx.store, &template)? {
            return Err(fingerprint_conflict(existing));
        }
        let record = IdentityRecord {
            id: ctx.store.next_id(),
            name: name.clone(),
            role,
            template_base64: template::encode(&*device.sensor, &template),
            created_at: timestamp_now(),
        };
        persist_and_index(device, ctx.store, record, &template)
    })?;

    info!(
        id = %record.id,
        name = %record.name,
        original_created_at = request.original_created_at.as_deref().unwrap_or("-"),
        "fingerprint imported"
    );
    Ok(record)
}

fn pause_until(interval: Duration, deadline: Instant) {
    let remaining = deadline.saturating_duration_since(Instant::now());
    sleep(interval.min(remaining));
}
