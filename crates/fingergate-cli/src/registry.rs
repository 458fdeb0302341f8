use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use fingergate_core::enrollment::EnrollmentOutcome;
use fingergate_core::store::{write_json_atomic, IdentityStore};
use fingergate_core::{AppError, ExportEnvelope, IdentityRecord, ServiceStatus};
use serde::Serialize;
use tracing::{info, warn};

use crate::cli::{EnrollArgs, ExportArgs, IdentifyCommands};
use crate::config::Settings;
use crate::control::{self, ControlReply, ControlRequest};
use crate::errors::AppResult;
use crate::runtime;

#[derive(Debug, Clone, PartialEq)]
pub enum RegistryOutcome {
    Listed(Vec<IdentityRecord>),
    Shown(IdentityRecord),
    Deleted(IdentityRecord),
    Exported(ExportOutcome),
    Imported(IdentityRecord),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExportOutcome {
    pub id: String,
    pub envelope: ExportEnvelope,
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusReport {
    #[serde(flatten)]
    pub service: ServiceStatus,
    pub data_dir: String,
    pub config_source: Option<String>,
    pub webhook_enabled: bool,
    pub sensor_error: Option<String>,
    /// A `serve` process answered on the control socket.
    pub serving: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct IdentificationOutcome {
    pub running: bool,
    pub changed: bool,
}

/// Enrolls through the running service when one is listening; otherwise
/// opens the sensor for this one enrollment.
pub fn run_enroll(args: &EnrollArgs, settings: &Settings) -> AppResult<EnrollmentOutcome> {
    info!(name = %args.name, "place the same finger on the sensor three times");
    let timeout = args.timeout.map(Duration::from_secs);
    let request = ControlRequest::Enroll {
        name: args.name.clone(),
        role: args.role.clone(),
        timeout_secs: args.timeout,
    };
    let expected =
        timeout.unwrap_or(settings.resolved.enrollment_timeout) + settings.resolved.stop_grace;
    match control::forward(settings, &request, expected)? {
        Some(ControlReply::Enrolled {
            record,
            rejected_captures,
            logs,
        }) => {
            return Ok(EnrollmentOutcome {
                record,
                rejected_captures,
                logs,
            })
        }
        Some(other) => return Err(other.unexpected()),
        None => {}
    }

    let service = runtime::start_service(settings, Vec::new())?;
    let result = service.enroll(&args.name, args.role.as_deref(), timeout);
    if let Err(err) = service.shutdown() {
        warn!(error = %err, "failed to close sensor after enrollment");
    }
    result
}

pub fn run_list(settings: &Settings) -> AppResult<Vec<IdentityRecord>> {
    runtime::open_store(settings)?.list()
}

pub fn run_show(id: &str, settings: &Settings) -> AppResult<IdentityRecord> {
    runtime::open_store(settings)?
        .find_by_id(id)?
        .ok_or_else(|| AppError::NotFound { id: id.to_string() })
}

/// Deletes through the running service so its matching index drops the
/// identity too; works on the store alone when no service is listening.
pub fn run_delete(id: &str, settings: &Settings) -> AppResult<IdentityRecord> {
    let request = ControlRequest::Delete { id: id.to_string() };
    match control::forward(settings, &request, settings.resolved.stop_grace)? {
        Some(ControlReply::Deleted { record }) => return Ok(record),
        Some(other) => return Err(other.unexpected()),
        None => {}
    }

    let store = runtime::open_store(settings)?;
    let record = store
        .find_by_id(id)?
        .ok_or_else(|| AppError::NotFound { id: id.to_string() })?;
    if !store.delete(id)? {
        return Err(AppError::NotFound { id: id.to_string() });
    }
    info!(id = %record.id, name = %record.name, "identity deleted");
    Ok(record)
}

pub fn run_export(args: &ExportArgs, settings: &Settings) -> AppResult<ExportOutcome> {
    let record = run_show(&args.id, settings)?;
    let envelope = ExportEnvelope::from_record(&record);
    if let Some(path) = args.output.as_deref() {
        write_json_atomic(path, &envelope)?;
        info!(id = %record.id, path = %path.display(), "identity exported");
    }
    Ok(ExportOutcome {
        id: record.id,
        envelope,
        path: args.output.clone(),
    })
}

/// Imports an exported envelope. The sensor matches the template against
/// enrolled identities, so a running service handles it when available.
pub fn run_import(file: &Path, settings: &Settings) -> AppResult<IdentityRecord> {
    let envelope = read_envelope(file)?;
    let request = ControlRequest::Import {
        envelope: envelope.clone(),
    };
    match control::forward(settings, &request, settings.resolved.stop_grace)? {
        Some(ControlReply::Imported { record }) => return Ok(record),
        Some(other) => return Err(other.unexpected()),
        None => {}
    }

    let service = runtime::start_service(settings, Vec::new())?;
    let result = service.import_envelope(&envelope);
    if let Err(err) = service.shutdown() {
        warn!(error = %err, "failed to close sensor after import");
    }
    result
}

pub fn read_envelope(file: &Path) -> AppResult<ExportEnvelope> {
    let contents = fs::read_to_string(file)?;
    serde_json::from_str(&contents).map_err(|err| {
        AppError::InvalidInput(format!(
            "{} is not an export envelope: {err}",
            file.display()
        ))
    })
}

/// Reports the running service's live state, or opens the sensor briefly
/// when none is listening. Registry counts are reported even when the
/// sensor cannot be opened.
pub fn run_status(settings: &Settings) -> AppResult<StatusReport> {
    let remote = match control::forward(settings, &ControlRequest::Status, Duration::ZERO)? {
        Some(ControlReply::Status { status }) => Some(status),
        Some(other) => return Err(other.unexpected()),
        None => None,
    };
    let serving = remote.is_some();

    let (service, sensor_error) = match remote {
        Some(status) => (status, None),
        None => match runtime::start_service(settings, Vec::new()) {
            Ok(service) => {
                let status = service.status()?;
                service.shutdown()?;
                (status, None)
            }
            Err(err) if err.is_device_lost() || matches!(err, AppError::SensorInUse(_)) => {
                let geometry = settings.sensor_config().geometry;
                let status = ServiceStatus {
                    initialized: false,
                    identification_running: false,
                    enrollment_in_progress: false,
                    registered_count: runtime::open_store(settings)?.count()?,
                    indexed_count: 0,
                    image_width: geometry.width,
                    image_height: geometry.height,
                };
                (status, Some(err.human_message()))
            }
            Err(err) => return Err(err),
        },
    };
    Ok(StatusReport {
        service,
        data_dir: settings.data_dir().display().to_string(),
        config_source: settings
            .source
            .as_ref()
            .map(|path| path.display().to_string()),
        webhook_enabled: settings.webhook_config().is_some(),
        sensor_error,
        serving,
    })
}

/// Starts or stops identification in the running service.
pub fn run_identification(
    command: &IdentifyCommands,
    settings: &Settings,
) -> AppResult<IdentificationOutcome> {
    let request = match command {
        IdentifyCommands::Start => ControlRequest::StartIdentification,
        IdentifyCommands::Stop => ControlRequest::StopIdentification,
    };
    match control::forward(settings, &request, settings.resolved.stop_grace)? {
        Some(ControlReply::Identification { running, changed }) => {
            Ok(IdentificationOutcome { running, changed })
        }
        Some(other) => Err(other.unexpected()),
        None => Err(AppError::NotServing {
            path: settings.control_socket(),
        }),
    }
}
