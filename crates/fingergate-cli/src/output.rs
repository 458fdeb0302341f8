use std::error::Error;
use std::io::{self, Write};

use fingergate_core::enrollment::EnrollmentOutcome;
use fingergate_core::IdentityRecord;
use serde::Serialize;
use serde_json::{json, Value};

use crate::cli::OutputMode;
use crate::errors::{AppError, AppResult};
use crate::registry::{IdentificationOutcome, RegistryOutcome, StatusReport};
use crate::serve::ServeOutcome;
use crate::webhook::WebhookTestOutcome;

fn write_json_line<T: Serialize + ?Sized>(value: &T) -> AppResult<()> {
    let stdout = io::stdout();
    let mut handle = stdout.lock();
    let payload = serde_json::to_string(value)?;
    handle.write_all(payload.as_bytes())?;
    handle.write_all(b"\n")?;
    Ok(())
}

fn describe(record: &IdentityRecord) -> String {
    format!(
        "{}  {}  {}  {}",
        record.id, record.name, record.role, record.created_at
    )
}

pub fn render_serve(outcome: &ServeOutcome, mode: OutputMode) -> AppResult<()> {
    match mode {
        OutputMode::Human => {
            println!(
                "Received {}; fingerprint service stopped ({} identities indexed)",
                outcome.signal, outcome.indexed
            );
            println!("Control socket {} closed", outcome.control_socket);
        }
        OutputMode::Json => write_json_line(outcome)?,
    }
    Ok(())
}

pub fn render_enroll(outcome: &EnrollmentOutcome, mode: OutputMode, verbose: bool) -> AppResult<()> {
    match mode {
        OutputMode::Human => {
            if verbose {
                for line in &outcome.logs {
                    tracing::info!("{line}");
                }
            }
            println!(
                "Enrollment successful: {} ({}) registered as id {}",
                outcome.record.name, outcome.record.role, outcome.record.id
            );
            if outcome.rejected_captures > 0 {
                println!(
                    "{} capture(s) rejected as a different finger",
                    outcome.rejected_captures
                );
            }
        }
        OutputMode::Json => write_json_line(&enroll_json_payload(outcome))?,
    }
    Ok(())
}

pub fn enroll_json_payload(outcome: &EnrollmentOutcome) -> Value {
    json!({
        "success": true,
        "id": outcome.record.id,
        "name": outcome.record.name,
        "role": outcome.record.role,
        "createdAt": outcome.record.created_at,
        "rejectedCaptures": outcome.rejected_captures,
    })
}

pub fn render_registry(outcome: &RegistryOutcome, mode: OutputMode) -> AppResult<()> {
    match (outcome, mode) {
        (RegistryOutcome::Listed(records), OutputMode::Human) => {
            if records.is_empty() {
                println!("No identities registered");
            }
            for record in records {
                println!("{}", describe(record));
            }
        }
        (RegistryOutcome::Listed(records), OutputMode::Json) => write_json_line(records)?,
        (RegistryOutcome::Shown(record), OutputMode::Human) => println!("{}", describe(record)),
        (RegistryOutcome::Shown(record), OutputMode::Json) => write_json_line(record)?,
        (RegistryOutcome::Deleted(record), OutputMode::Human) => {
            println!("Deleted {} ({})", record.name, record.id);
        }
        (RegistryOutcome::Deleted(record), OutputMode::Json) => write_json_line(&json!({
            "success": true,
            "deleted": record.id,
            "name": record.name,
        }))?,
        (RegistryOutcome::Exported(export), OutputMode::Human) => match &export.path {
            Some(path) => println!("Exported {} to {}", export.id, path.display()),
            None => {
                let payload = serde_json::to_string_pretty(&export.envelope)?;
                println!("{payload}");
            }
        },
        (RegistryOutcome::Exported(export), OutputMode::Json) => match &export.path {
            Some(path) => write_json_line(&json!({
                "success": true,
                "id": export.id,
                "path": path.display().to_string(),
            }))?,
            None => write_json_line(&export.envelope)?,
        },
        (RegistryOutcome::Imported(record), OutputMode::Human) => {
            println!("Imported {} as id {}", record.name, record.id);
        }
        (RegistryOutcome::Imported(record), OutputMode::Json) => write_json_line(&json!({
            "success": true,
            "id": record.id,
            "name": record.name,
            "role": record.role,
            "createdAt": record.created_at,
        }))?,
    }
    Ok(())
}

pub fn render_status(report: &StatusReport, mode: OutputMode) -> AppResult<()> {
    match mode {
        OutputMode::Human => {
            let status = &report.service;
            println!(
                "Service: {}",
                if report.serving {
                    "running"
                } else {
                    "not running"
                }
            );
            if report.serving {
                println!(
                    "Identification: {}{}",
                    if status.identification_running {
                        "running"
                    } else {
                        "stopped"
                    },
                    if status.enrollment_in_progress {
                        " (enrollment in progress)"
                    } else {
                        ""
                    }
                );
            }
            println!(
                "Sensor: {} ({}x{})",
                if status.initialized {
                    "ready"
                } else {
                    "unavailable"
                },
                status.image_width,
                status.image_height
            );
            if let Some(err) = &report.sensor_error {
                println!("Sensor error: {err}");
            }
            println!(
                "Identities: {} registered, {} indexed",
                status.registered_count, status.indexed_count
            );
            println!("Data directory: {}", report.data_dir);
            println!(
                "Configuration: {}",
                report.config_source.as_deref().unwrap_or("defaults")
            );
            println!(
                "Webhook: {}",
                if report.webhook_enabled {
                    "enabled"
                } else {
                    "disabled"
                }
            );
        }
        OutputMode::Json => write_json_line(report)?,
    }
    Ok(())
}

pub fn render_webhook_test(outcome: &WebhookTestOutcome, mode: OutputMode) -> AppResult<()> {
    match mode {
        OutputMode::Human => {
            if outcome.delivered {
                println!("Webhook test delivered to {} (HTTP {})", outcome.url, outcome.status);
            } else {
                println!("Webhook test rejected by {} (HTTP {})", outcome.url, outcome.status);
            }
        }
        OutputMode::Json => write_json_line(outcome)?,
    }
    Ok(())
}

pub fn render_identification(outcome: &IdentificationOutcome, mode: OutputMode) -> AppResult<()> {
    match mode {
        OutputMode::Human => {
            let state = if outcome.running { "running" } else { "stopped" };
            if outcome.changed {
                println!("Identification {state}");
            } else {
                println!("Identification already {state}");
            }
        }
        OutputMode::Json => write_json_line(outcome)?,
    }
    Ok(())
}

/// Operator guidance for failures that usually mean a setup problem.
pub fn operator_hint(err: &AppError) -> Option<&'static str> {
    match err {
        AppError::DeviceLost(_) => {
            Some("check that the fingerprint reader is connected and sensor_spool_dir exists")
        }
        AppError::SensorInUse(_) => Some(
            "another fingergate process holds the reader; check control_socket so commands reach the running serve",
        ),
        AppError::NotServing { .. } => Some("start `fingergate serve` first"),
        AppError::NotInitialized => Some("the sensor was closed; restart the service"),
        AppError::StoreRead { .. } | AppError::StoreWrite { .. } => {
            Some("check that data_dir exists and is writable by this user")
        }
        AppError::InvalidStore { .. } => {
            Some("restore fingerprints.json from a backup or move it aside")
        }
        AppError::Config(_) => Some(
            "check /etc/fingergate/config.toml or the file passed with --config",
        ),
        AppError::Busy => Some("wait for the running enrollment to finish"),
        _ => None,
    }
}

pub fn error_json_payload(err: &AppError) -> Value {
    let mut payload = json!({
        "success": false,
        "error": err.human_message(),
    });
    if let Some((reason, existing)) = err.conflict() {
        payload["conflict"] = json!({
            "reason": reason,
            "existingId": existing.id,
            "existingName": existing.name,
        });
    }
    if let Some(hint) = operator_hint(err) {
        payload["hint"] = json!(hint);
    }
    payload
}

pub fn render_error(err: &AppError, mode: OutputMode) {
    match mode {
        OutputMode::Human => {
            eprintln!("error: {}", err.human_message());
            if let Some(source) = err.source() {
                eprintln!("cause: {source}");
            }
            if let Some(hint) = operator_hint(err) {
                eprintln!("hint: {hint}");
            }
        }
        OutputMode::Json => {
            if let Ok(json) = serde_json::to_string(&error_json_payload(err)) {
                println!("{json}");
            }
            if let Some(source) = err.source() {
                eprintln!("cause: {source}");
            }
        }
    }
}
