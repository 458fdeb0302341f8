use std::io;
use std::sync::mpsc::{self, Sender};
use std::sync::Arc;
use std::thread;

use fingergate_core::{AppError, EventSink, FingerprintService};
use nix::sys::signal::{SigSet, Signal};
use serde::Serialize;
use tracing::{error, info, warn};

use crate::cli::ServeArgs;
use crate::config::Settings;
use crate::control::ControlServer;
use crate::errors::AppResult;
use crate::runtime;

const SIGNAL_THREAD_NAME: &str = "fingergate-signals";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServeOutcome {
    pub signal: String,
    pub identification_started: bool,
    pub webhook_enabled: bool,
    pub indexed: usize,
    pub control_socket: String,
}

/// Why `serve` stops.
#[derive(Debug)]
pub enum ServeStop {
    Signal(Signal),
    /// The reader went away or the signal wait failed.
    Fault(AppError),
}

/// Forwards a reader loss reported by the identification loop to `stop`.
pub fn watch_sensor(service: &FingerprintService, stop: Sender<ServeStop>) {
    service.on_sensor_lost(move |err| {
        let _ = stop.send(ServeStop::Fault(err));
    });
}

fn spawn_signal_waiter(mask: SigSet, stop: Sender<ServeStop>) -> AppResult<()> {
    thread::Builder::new()
        .name(SIGNAL_THREAD_NAME.into())
        .spawn(move || {
            let stopped = match mask.wait() {
                Ok(signal) => ServeStop::Signal(signal),
                Err(errno) => ServeStop::Fault(io::Error::from(errno).into()),
            };
            let _ = stop.send(stopped);
        })?;
    Ok(())
}

/// Shuts the service down. A fault is returned as the error so the process
/// exits with its status; a supervisor is expected to restart `serve`.
pub fn conclude(stop: ServeStop, service: &FingerprintService) -> AppResult<Signal> {
    let closed = service.shutdown();
    match stop {
        ServeStop::Signal(signal) => {
            closed?;
            Ok(signal)
        }
        ServeStop::Fault(err) => {
            error!(error = %err, "fingergate serve stopping after sensor failure");
            if let Err(close) = closed {
                warn!(error = %close, "failed to close sensor");
            }
            Err(err)
        }
    }
}

/// Runs the service until SIGINT or SIGTERM arrives or the reader is lost,
/// answering control requests from other invocations meanwhile.
pub fn run_serve(args: &ServeArgs, settings: &Settings) -> AppResult<ServeOutcome> {
    // Blocked before any worker thread exists so every thread inherits the mask.
    let mut mask = SigSet::empty();
    mask.add(Signal::SIGINT);
    mask.add(Signal::SIGTERM);
    mask.thread_block().map_err(io::Error::from)?;

    let notifier = runtime::open_webhook(settings)?;
    let sinks: Vec<Arc<dyn EventSink>> = notifier
        .iter()
        .map(|notifier| Arc::clone(notifier) as Arc<dyn EventSink>)
        .collect();
    let service = runtime::start_service(settings, sinks)?;

    let (stop_tx, stop_rx) = mpsc::channel();
    watch_sensor(&service, stop_tx.clone());
    let mut control = ControlServer::bind(&settings.control_socket(), service.clone())?;
    spawn_signal_waiter(mask, stop_tx)?;

    let identification_started =
        if settings.resolved.auto_start_identification && !args.no_identify {
            service.start_identification()?
        } else {
            info!("identification not started; sensor held idle");
            false
        };
    let indexed = service.status()?.indexed_count;
    info!(
        indexed,
        identification = identification_started,
        control_socket = %control.path().display(),
        "fingergate serving; waiting for SIGINT or SIGTERM"
    );

    let stop = stop_rx.recv().unwrap_or_else(|_| {
        ServeStop::Fault(
            io::Error::new(io::ErrorKind::BrokenPipe, "serve stop channel closed").into(),
        )
    });
    if let ServeStop::Signal(signal) = &stop {
        info!(signal = signal.as_str(), "shutting down");
    }

    control.shutdown();
    let concluded = conclude(stop, &service);
    if let Some(notifier) = notifier.as_ref() {
        notifier.shutdown();
    }
    let signal = concluded?;

    Ok(ServeOutcome {
        signal: signal.as_str().to_string(),
        identification_started,
        webhook_enabled: notifier.is_some(),
        indexed,
        control_socket: control.path().display().to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use fingergate_config::ResolvedConfig;
    use std::fs;
    use std::process::ExitCode;
    use std::time::Duration;
    use tempfile::tempdir;

    #[test]
    fn lost_reader_stops_serve_with_device_lost() {
        let dir = tempdir().unwrap();
        let mut resolved = ResolvedConfig::default();
        resolved.data_dir = dir.path().join("data");
        resolved.sensor_spool_dir = dir.path().join("spool");
        resolved.identify_poll = Duration::from_millis(5);
        fs::create_dir_all(&resolved.sensor_spool_dir).unwrap();
        let settings = Settings::from_resolved(resolved);

        let service = runtime::start_service(&settings, Vec::new()).unwrap();
        let (tx, rx) = mpsc::channel();
        watch_sensor(&service, tx);
        assert!(service.start_identification().unwrap());
        fs::remove_dir_all(&settings.resolved.sensor_spool_dir).unwrap();

        let stop = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert!(matches!(stop, ServeStop::Fault(ref err) if err.is_device_lost()));

        let err = conclude(stop, &service).unwrap_err();
        assert_eq!(err.exit_code(), ExitCode::from(4));
        assert!(!service.status().unwrap().initialized);
    }

    #[test]
    fn signal_stop_shuts_down_cleanly() {
        let dir = tempdir().unwrap();
        let mut resolved = ResolvedConfig::default();
        resolved.data_dir = dir.path().join("data");
        resolved.sensor_spool_dir = dir.path().join("spool");
        fs::create_dir_all(&resolved.sensor_spool_dir).unwrap();
        let settings = Settings::from_resolved(resolved);

        let service = runtime::start_service(&settings, Vec::new()).unwrap();
        let signal = conclude(ServeStop::Signal(Signal::SIGTERM), &service).unwrap();
        assert_eq!(signal, Signal::SIGTERM);
        assert!(!service.status().unwrap().initialized);
    }
}
