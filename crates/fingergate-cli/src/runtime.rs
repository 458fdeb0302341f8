use std::sync::Arc;

use fingergate_core::capture::FileCaptureSink;
use fingergate_core::notify::WebhookNotifier;
use fingergate_core::sensor::SpoolSensor;
use fingergate_core::store::{IdentityStore, JsonIdentityStore};
use fingergate_core::{EventSink, FingerprintService, ServiceParts};
use tracing::debug;

use crate::config::Settings;
use crate::errors::AppResult;

pub fn open_store(settings: &Settings) -> AppResult<Arc<JsonIdentityStore>> {
    let store = JsonIdentityStore::open(settings.data_dir())?;
    debug!(path = %store.registry_path().display(), "identity store opened");
    Ok(Arc::new(store))
}

/// Starts the delivery thread when a webhook URL is configured.
pub fn open_webhook(settings: &Settings) -> AppResult<Option<Arc<WebhookNotifier>>> {
    settings
        .webhook_config()
        .map(|config| WebhookNotifier::new(config).map(Arc::new))
        .transpose()
}

/// Opens the sensor and rebuilds the matching index. Identification is left
/// stopped.
pub fn start_service(
    settings: &Settings,
    sinks: Vec<Arc<dyn EventSink>>,
) -> AppResult<FingerprintService> {
    let store = open_store(settings)?;
    let capture = Arc::new(FileCaptureSink::new(store.records_dir()));
    let store: Arc<dyn IdentityStore> = store;
    FingerprintService::start(
        settings.service_config(),
        ServiceParts {
            sensor: Box::new(SpoolSensor::new(settings.sensor_config())),
            store,
            capture,
            sinks,
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use fingergate_config::ResolvedConfig;
    use fingergate_core::AppError;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn second_service_on_one_spool_is_refused() {
        let dir = tempdir().unwrap();
        let mut resolved = ResolvedConfig::default();
        resolved.data_dir = dir.path().join("data");
        resolved.sensor_spool_dir = dir.path().join("spool");
        fs::create_dir_all(&resolved.sensor_spool_dir).unwrap();
        let settings = Settings::from_resolved(resolved);

        let first = start_service(&settings, Vec::new()).unwrap();
        match start_service(&settings, Vec::new()) {
            Err(err) => {
                assert!(matches!(err, AppError::SensorInUse(_)));
                assert_eq!(err.exit_status(), 3);
            }
            Ok(_) => panic!("second service opened a spool that is in use"),
        }

        first.shutdown().unwrap();
        let again = start_service(&settings, Vec::new()).unwrap();
        again.shutdown().unwrap();
    }
}
