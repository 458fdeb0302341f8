use std::path::{Path, PathBuf};

use fingergate_config::{self as loader, ResolvedConfig, DEFAULT_ENV_FILE};
use fingergate_core::enrollment::EnrollmentTiming;
use fingergate_core::identification::IdentificationTiming;
use fingergate_core::notify::WebhookConfig;
use fingergate_core::sensor::{ImageGeometry, SpoolSensorConfig};
use fingergate_core::ServiceConfig;
use tracing::{debug, info};

use crate::errors::{config_error, AppResult};

/// Configuration resolved for one invocation, plus where it came from.
#[derive(Debug, Clone)]
pub struct Settings {
    pub resolved: ResolvedConfig,
    pub source: Option<PathBuf>,
    pub env_file: Option<PathBuf>,
}

impl Settings {
    pub fn from_resolved(resolved: ResolvedConfig) -> Self {
        Self {
            resolved,
            source: None,
            env_file: None,
        }
    }

    pub fn service_config(&self) -> ServiceConfig {
        let config = &self.resolved;
        ServiceConfig {
            enrollment_timeout: config.enrollment_timeout,
            enrollment: EnrollmentTiming {
                poll_interval: config.enrollment_poll,
                capture_pause: config.capture_pause,
            },
            identification: IdentificationTiming {
                poll_interval: config.identify_poll,
                enrollment_idle: config.enrollment_idle,
                debounce: config.debounce,
                stop_grace: config.stop_grace,
            },
        }
    }

    pub fn sensor_config(&self) -> SpoolSensorConfig {
        let config = &self.resolved;
        SpoolSensorConfig {
            spool_dir: config.sensor_spool_dir.clone(),
            geometry: ImageGeometry {
                width: config.sensor_image_width,
                height: config.sensor_image_height,
            },
            match_threshold: config.match_threshold,
        }
    }

    /// `None` when no usable webhook URL is configured.
    pub fn webhook_config(&self) -> Option<WebhookConfig> {
        let config = &self.resolved;
        WebhookConfig::new(
            config.webhook_url.clone(),
            config.webhook_token.clone(),
            config.webhook_timeout,
        )
        .map(|webhook| webhook.with_queue_capacity(config.webhook_queue_capacity))
    }

    pub fn data_dir(&self) -> &Path {
        &self.resolved.data_dir
    }

    pub fn control_socket(&self) -> PathBuf {
        self.resolved.control_socket_path()
    }
}

/// Loads the `.env` file and configuration for this invocation.
pub fn load_settings(config: Option<&Path>, env_file: Option<&Path>) -> AppResult<Settings> {
    let env_path = env_file.unwrap_or_else(|| Path::new(DEFAULT_ENV_FILE));
    let env_loaded = loader::load_env_file(env_path).map_err(config_error)?;
    if env_file.is_some() && !env_loaded {
        return Err(config_error(loader::ConfigError::Missing {
            path: env_path.to_path_buf(),
        }));
    }

    let loaded = loader::load_resolved_config(config).map_err(config_error)?;
    Ok(Settings {
        resolved: loaded.resolved,
        source: loaded.source,
        env_file: env_loaded.then(|| env_path.to_path_buf()),
    })
}

/// Logs where configuration came from once tracing is ready.
pub fn log_sources(settings: &Settings) {
    match &settings.source {
        Some(path) => info!(path = %path.display(), "configuration loaded"),
        None => info!("no configuration file found; using defaults"),
    }
    if let Some(path) = &settings.env_file {
        debug!(path = %path.display(), "environment file loaded");
    }
}
