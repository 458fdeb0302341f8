use std::fs::{self, Permissions};
use std::io::{self, BufRead, BufReader, Read, Write};
use std::net::Shutdown;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use fingergate_core::{
    AppError, ConflictReason, ExportEnvelope, FingerprintService, IdentityRecord, IdentityRef,
    ServiceStatus,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::Settings;
use crate::errors::AppResult;

pub const CONTROL_THREAD_NAME: &str = "fingergate-control";
const CONNECTION_THREAD_NAME: &str = "fingergate-client";
const REQUEST_READ_TIMEOUT: Duration = Duration::from_secs(5);
/// Added to the expected duration of a request when waiting for its reply.
pub const REPLY_MARGIN: Duration = Duration::from_secs(10);

/// Operations a running `serve` performs on behalf of other invocations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ControlRequest {
    Enroll {
        name: String,
        role: Option<String>,
        timeout_secs: Option<u64>,
    },
    Import {
        envelope: ExportEnvelope,
    },
    Delete {
        id: String,
    },
    Status,
    StartIdentification,
    StopIdentification,
}

impl ControlRequest {
    pub fn op(&self) -> &'static str {
        match self {
            ControlRequest::Enroll { .. } => "enroll",
            ControlRequest::Import { .. } => "import",
            ControlRequest::Delete { .. } => "delete",
            ControlRequest::Status => "status",
            ControlRequest::StartIdentification => "start_identification",
            ControlRequest::StopIdentification => "stop_identification",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ControlReply {
    Enrolled {
        record: IdentityRecord,
        rejected_captures: usize,
        logs: Vec<String>,
    },
    Imported {
        record: IdentityRecord,
    },
    Deleted {
        record: IdentityRecord,
    },
    Status {
        status: ServiceStatus,
    },
    Identification {
        running: bool,
        changed: bool,
    },
}

impl ControlReply {
    /// Error for a reply that does not answer the request that was sent.
    pub fn unexpected(self) -> AppError {
        AppError::Remote {
            message: format!("unexpected reply from fingergate service: {self:?}"),
            status: 1,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
enum WireMessage {
    Ok { reply: ControlReply },
    Error { error: WireError },
}

/// Errors that cross the socket with enough detail to keep exit codes and
/// conflict reports intact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum WireError {
    InvalidInput {
        message: String,
    },
    Conflict {
        reason: ConflictReason,
        existing: IdentityRef,
    },
    Timeout {
        captured: usize,
        required: usize,
    },
    DeviceLost {
        message: String,
    },
    NotInitialized,
    Busy,
    NotFound {
        id: String,
    },
    Failed {
        message: String,
        exit_status: u8,
    },
}

impl From<&AppError> for WireError {
    fn from(err: &AppError) -> Self {
        match err {
            AppError::InvalidInput(message) => WireError::InvalidInput {
                message: message.clone(),
            },
            AppError::Conflict { reason, existing } => WireError::Conflict {
                reason: *reason,
                existing: existing.clone(),
            },
            AppError::Timeout { captured, required } => WireError::Timeout {
                captured: *captured,
                required: *required,
            },
            AppError::DeviceLost(message) => WireError::DeviceLost {
                message: message.clone(),
            },
            AppError::NotInitialized => WireError::NotInitialized,
            AppError::Busy => WireError::Busy,
            AppError::NotFound { id } => WireError::NotFound { id: id.clone() },
            other => WireError::Failed {
                message: other.human_message(),
                exit_status: other.exit_status(),
            },
        }
    }
}

impl From<WireError> for AppError {
    fn from(err: WireError) -> Self {
        match err {
            WireError::InvalidInput { message } => AppError::InvalidInput(message),
            WireError::Conflict { reason, existing } => AppError::Conflict { reason, existing },
            WireError::Timeout { captured, required } => AppError::Timeout { captured, required },
            WireError::DeviceLost { message } => AppError::DeviceLost(message),
            WireError::NotInitialized => AppError::NotInitialized,
            WireError::Busy => AppError::Busy,
            WireError::NotFound { id } => AppError::NotFound { id },
            WireError::Failed {
                message,
                exit_status,
            } => AppError::Remote {
                message,
                status: exit_status,
            },
        }
    }
}

fn write_message<T: Serialize>(mut stream: &UnixStream, message: &T) -> io::Result<()> {
    let mut body = serde_json::to_vec(message)?;
    body.push(b'\n');
    stream.write_all(&body)
}

/// Serves [`ControlRequest`]s against one service on a unix socket.
pub struct ControlServer {
    path: PathBuf,
    stopping: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl ControlServer {
    /// Binds `path`, replacing a stale socket file, and accepts connections
    /// on a background thread.
    pub fn bind(path: &Path, service: FingerprintService) -> AppResult<Self> {
        if path.exists() {
            if UnixStream::connect(path).is_ok() {
                return Err(AppError::SensorInUse(format!(
                    "another fingergate service answers on {}",
                    path.display()
                )));
            }
            debug!(path = %path.display(), "removing stale control socket");
            fs::remove_file(path)?;
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let listener = UnixListener::bind(path)?;
        fs::set_permissions(path, Permissions::from_mode(0o600))?;

        let stopping = Arc::new(AtomicBool::new(false));
        let handle = thread::Builder::new()
            .name(CONTROL_THREAD_NAME.into())
            .spawn({
                let stopping = Arc::clone(&stopping);
                move || accept_loop(&listener, &service, &stopping)
            })?;
        info!(path = %path.display(), "control socket listening");

        Ok(Self {
            path: path.to_path_buf(),
            stopping,
            handle: Some(handle),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Stops accepting connections and removes the socket file. Requests
    /// already accepted finish on their own threads.
    pub fn shutdown(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        self.stopping.store(true, Ordering::SeqCst);
        match UnixStream::connect(&self.path) {
            Ok(_) => {
                if handle.join().is_err() {
                    warn!("control socket thread panicked");
                }
            }
            Err(err) => {
                warn!(error = %err, "control socket unreachable; detaching its thread");
            }
        }
        match fs::remove_file(&self.path) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => warn!(error = %err, "failed to remove control socket"),
        }
        info!(path = %self.path.display(), "control socket closed");
    }
}

impl Drop for ControlServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn accept_loop(listener: &UnixListener, service: &FingerprintService, stopping: &AtomicBool) {
    for stream in listener.incoming() {
        if stopping.load(Ordering::SeqCst) {
            break;
        }
        match stream {
            Ok(stream) => {
                let service = service.clone();
                let spawned = thread::Builder::new()
                    .name(CONNECTION_THREAD_NAME.into())
                    .spawn(move || serve_connection(stream, &service));
                if let Err(err) = spawned {
                    warn!(error = %err, "failed to start control connection thread");
                }
            }
            Err(err) => warn!(error = %err, "control socket accept failed"),
        }
    }
    debug!("control socket no longer accepting");
}

fn serve_connection(stream: UnixStream, service: &FingerprintService) {
    let message = match read_request(&stream) {
        Ok(request) => {
            debug!(op = request.op(), "control request");
            match dispatch(service, request) {
                Ok(reply) => WireMessage::Ok { reply },
                Err(err) => {
                    debug!(error = %err, "control request failed");
                    WireMessage::Error {
                        error: WireError::from(&err),
                    }
                }
            }
        }
        Err(err) => WireMessage::Error {
            error: WireError::from(&err),
        },
    };
    if let Err(err) = write_message(&stream, &message) {
        warn!(error = %err, "failed to write control reply");
    }
    let _ = stream.shutdown(Shutdown::Both);
}

fn read_request(stream: &UnixStream) -> AppResult<ControlRequest> {
    stream.set_read_timeout(Some(REQUEST_READ_TIMEOUT))?;
    let mut line = String::new();
    BufReader::new(stream).read_line(&mut line)?;
    serde_json::from_str(line.trim())
        .map_err(|err| AppError::InvalidInput(format!("malformed control request: {err}")))
}

/// Runs one request against the service.
pub fn dispatch(service: &FingerprintService, request: ControlRequest) -> AppResult<ControlReply> {
    match request {
        ControlRequest::Enroll {
            name,
            role,
            timeout_secs,
        } => {
            let outcome = service.enroll(
                &name,
                role.as_deref(),
                timeout_secs.map(Duration::from_secs),
            )?;
            Ok(ControlReply::Enrolled {
                record: outcome.record,
                rejected_captures: outcome.rejected_captures,
                logs: outcome.logs,
            })
        }
        ControlRequest::Import { envelope } => service
            .import_envelope(&envelope)
            .map(|record| ControlReply::Imported { record }),
        ControlRequest::Delete { id } => service
            .delete(&id)
            .map(|record| ControlReply::Deleted { record }),
        ControlRequest::Status => service
            .status()
            .map(|status| ControlReply::Status { status }),
        ControlRequest::StartIdentification => {
            let changed = service.start_identification()?;
            Ok(ControlReply::Identification {
                running: service.is_identification_running(),
                changed,
            })
        }
        ControlRequest::StopIdentification => {
            let changed = service.is_identification_running();
            service.stop_identification();
            Ok(ControlReply::Identification {
                running: service.is_identification_running(),
                changed,
            })
        }
    }
}

/// One request/reply exchange with a running `serve`.
pub struct ControlClient {
    stream: UnixStream,
}

impl ControlClient {
    /// `Ok(None)` when nothing listens on `path`.
    pub fn connect(path: &Path) -> AppResult<Option<Self>> {
        match UnixStream::connect(path) {
            Ok(stream) => Ok(Some(Self { stream })),
            Err(err)
                if matches!(
                    err.kind(),
                    io::ErrorKind::NotFound | io::ErrorKind::ConnectionRefused
                ) =>
            {
                Ok(None)
            }
            Err(err) => Err(err.into()),
        }
    }

    pub fn call(self, request: &ControlRequest, timeout: Duration) -> AppResult<ControlReply> {
        let mut stream = self.stream;
        stream.set_read_timeout(Some(timeout))?;
        write_message(&stream, request)?;
        stream.shutdown(Shutdown::Write)?;

        let mut buffer = Vec::new();
        match stream.read_to_end(&mut buffer) {
            Ok(_) => {}
            Err(err)
                if err.kind() == io::ErrorKind::WouldBlock
                    || err.kind() == io::ErrorKind::TimedOut =>
            {
                return Err(AppError::Remote {
                    message: format!("fingergate service did not reply within {timeout:?}"),
                    status: 1,
                });
            }
            Err(err) => return Err(err.into()),
        }
        if buffer.is_empty() {
            return Err(AppError::Remote {
                message: "fingergate service closed the connection without replying".into(),
                status: 1,
            });
        }

        match serde_json::from_slice::<WireMessage>(&buffer)? {
            WireMessage::Ok { reply } => Ok(reply),
            WireMessage::Error { error } => Err(error.into()),
        }
    }
}

/// Sends `request` to the running service. `Ok(None)` means no service is
/// listening and the caller should work locally.
pub fn forward(
    settings: &Settings,
    request: &ControlRequest,
    expected: Duration,
) -> AppResult<Option<ControlReply>> {
    let path = settings.control_socket();
    let Some(client) = ControlClient::connect(&path)? else {
        return Ok(None);
    };
    debug!(op = request.op(), path = %path.display(), "forwarding to running service");
    client.call(request, expected + REPLY_MARGIN).map(Some)
}
