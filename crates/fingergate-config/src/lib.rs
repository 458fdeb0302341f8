use std::env;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

pub const PRIMARY_CONFIG_PATH: &str = "/etc/fingergate/config.toml";
pub const SECONDARY_CONFIG_PATH: &str = "/usr/local/etc/fingergate/config.toml";
pub const DEFAULT_ENV_FILE: &str = ".env";

pub const DATA_DIR_ENV: &str = "FINGERGATE_DATA_DIR";
pub const WEBHOOK_URL_ENV: &str = "FINGERGATE_WEBHOOK_URL";
pub const WEBHOOK_TOKEN_ENV: &str = "FINGERGATE_WEBHOOK_TOKEN";
pub const CONTROL_SOCKET_ENV: &str = "FINGERGATE_CONTROL_SOCKET";

pub const DEFAULT_DATA_DIR: &str = "./data";
pub const DEFAULT_LOG_DIR: &str = "./logs";
pub const DEFAULT_SPOOL_DIR: &str = "./spool";
/// Control socket file name, placed in the data directory unless configured.
pub const DEFAULT_CONTROL_SOCKET_NAME: &str = "control.sock";
pub const DEFAULT_ENROLLMENT_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_ENROLLMENT_POLL_MILLIS: u64 = 100;
pub const DEFAULT_CAPTURE_PAUSE_MILLIS: u64 = 500;
pub const DEFAULT_IDENTIFY_POLL_MILLIS: u64 = 200;
pub const DEFAULT_ENROLLMENT_IDLE_MILLIS: u64 = 100;
pub const DEFAULT_DEBOUNCE_MILLIS: u64 = 2000;
pub const DEFAULT_STOP_GRACE_MILLIS: u64 = 2000;
pub const DEFAULT_IMAGE_WIDTH: u32 = 256;
pub const DEFAULT_IMAGE_HEIGHT: u32 = 360;
pub const DEFAULT_MATCH_THRESHOLD: i32 = 70;
pub const DEFAULT_WEBHOOK_TIMEOUT_MILLIS: u64 = 5000;
pub const DEFAULT_WEBHOOK_QUEUE_CAPACITY: usize = 32;

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct ConfigFile {
    pub data_dir: Option<PathBuf>,
    pub log_dir: Option<PathBuf>,
    pub enrollment_timeout_secs: Option<u64>,
    pub enrollment_poll_millis: Option<u64>,
    pub capture_pause_millis: Option<u64>,
    pub identify_poll_millis: Option<u64>,
    pub enrollment_idle_millis: Option<u64>,
    pub debounce_millis: Option<u64>,
    pub stop_grace_millis: Option<u64>,
    pub auto_start_identification: Option<bool>,
    pub sensor_spool_dir: Option<PathBuf>,
    pub sensor_image_width: Option<u32>,
    pub sensor_image_height: Option<u32>,
    pub match_threshold: Option<i32>,
    pub webhook_url: Option<String>,
    pub webhook_token: Option<String>,
    pub webhook_timeout_millis: Option<u64>,
    pub webhook_queue_capacity: Option<usize>,
    pub control_socket: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedConfig {
    pub data_dir: PathBuf,
    pub log_dir: PathBuf,
    pub enrollment_timeout: Duration,
    pub enrollment_poll: Duration,
    pub capture_pause: Duration,
    pub identify_poll: Duration,
    pub enrollment_idle: Duration,
    pub debounce: Duration,
    pub stop_grace: Duration,
    pub auto_start_identification: bool,
    pub sensor_spool_dir: PathBuf,
    pub sensor_image_width: u32,
    pub sensor_image_height: u32,
    pub match_threshold: i32,
    pub webhook_url: Option<String>,
    pub webhook_token: Option<String>,
    pub webhook_timeout: Duration,
    pub webhook_queue_capacity: usize,
    pub control_socket: Option<PathBuf>,
}

impl ResolvedConfig {
    pub fn from_raw(raw: ConfigFile) -> Self {
        Self {
            data_dir: raw
                .data_dir
                .unwrap_or_else(|| PathBuf::from(DEFAULT_DATA_DIR)),
            log_dir: raw.log_dir.unwrap_or_else(|| PathBuf::from(DEFAULT_LOG_DIR)),
            enrollment_timeout: Duration::from_secs(
                raw.enrollment_timeout_secs
                    .unwrap_or(DEFAULT_ENROLLMENT_TIMEOUT_SECS)
                    .max(1),
            ),
            enrollment_poll: Duration::from_millis(
                raw.enrollment_poll_millis
                    .unwrap_or(DEFAULT_ENROLLMENT_POLL_MILLIS),
            ),
            capture_pause: Duration::from_millis(
                raw.capture_pause_millis
                    .unwrap_or(DEFAULT_CAPTURE_PAUSE_MILLIS),
            ),
            identify_poll: Duration::from_millis(
                raw.identify_poll_millis
                    .unwrap_or(DEFAULT_IDENTIFY_POLL_MILLIS),
            ),
            enrollment_idle: Duration::from_millis(
                raw.enrollment_idle_millis
                    .unwrap_or(DEFAULT_ENROLLMENT_IDLE_MILLIS),
            ),
            debounce: Duration::from_millis(raw.debounce_millis.unwrap_or(DEFAULT_DEBOUNCE_MILLIS)),
            stop_grace: Duration::from_millis(
                raw.stop_grace_millis.unwrap_or(DEFAULT_STOP_GRACE_MILLIS),
            ),
            auto_start_identification: raw.auto_start_identification.unwrap_or(true),
            sensor_spool_dir: raw
                .sensor_spool_dir
                .unwrap_or_else(|| PathBuf::from(DEFAULT_SPOOL_DIR)),
            sensor_image_width: raw.sensor_image_width.unwrap_or(DEFAULT_IMAGE_WIDTH),
            sensor_image_height: raw.sensor_image_height.unwrap_or(DEFAULT_IMAGE_HEIGHT),
            match_threshold: raw
                .match_threshold
                .unwrap_or(DEFAULT_MATCH_THRESHOLD)
                .clamp(1, 100),
            webhook_url: non_blank(raw.webhook_url),
            webhook_token: non_blank(raw.webhook_token),
            webhook_timeout: Duration::from_millis(
                raw.webhook_timeout_millis
                    .unwrap_or(DEFAULT_WEBHOOK_TIMEOUT_MILLIS),
            ),
            webhook_queue_capacity: raw
                .webhook_queue_capacity
                .unwrap_or(DEFAULT_WEBHOOK_QUEUE_CAPACITY)
                .max(1),
            control_socket: raw.control_socket,
        }
    }

    /// Socket `serve` listens on; `<data_dir>/control.sock` by default.
    pub fn control_socket_path(&self) -> PathBuf {
        self.control_socket
            .clone()
            .unwrap_or_else(|| self.data_dir.join(DEFAULT_CONTROL_SOCKET_NAME))
    }

    /// Applies `FINGERGATE_*` overrides from `lookup`.
    pub fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(dir) = non_blank(lookup(DATA_DIR_ENV)) {
            self.data_dir = PathBuf::from(dir);
        }
        if let Some(url) = lookup(WEBHOOK_URL_ENV) {
            self.webhook_url = non_blank(Some(url));
        }
        if let Some(token) = lookup(WEBHOOK_TOKEN_ENV) {
            self.webhook_token = non_blank(Some(token));
        }
        if let Some(socket) = non_blank(lookup(CONTROL_SOCKET_ENV)) {
            self.control_socket = Some(PathBuf::from(socket));
        }
    }
}

impl Default for ResolvedConfig {
    fn default() -> Self {
        Self::from_raw(ConfigFile::default())
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|text| text.trim().to_string())
        .filter(|text| !text.is_empty())
}

#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub contents: ConfigFile,
    pub source: PathBuf,
}

impl LoadedConfig {
    pub fn new(contents: ConfigFile, source: PathBuf) -> Self {
        Self { contents, source }
    }

    pub fn source(&self) -> &Path {
        &self.source
    }
}

#[derive(Debug, Clone)]
pub struct ResolvedConfigWithSource {
    pub resolved: ResolvedConfig,
    pub source: Option<PathBuf>,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to parse {path}: {message}")]
    Parse { path: PathBuf, message: String },
    #[error("configuration file {path} does not exist")]
    Missing { path: PathBuf },
    #[error("failed to load environment file {path}: {source}")]
    EnvFile {
        path: PathBuf,
        #[source]
        source: dotenvy::Error,
    },
}

pub fn default_paths() -> [PathBuf; 2] {
    [
        PathBuf::from(PRIMARY_CONFIG_PATH),
        PathBuf::from(SECONDARY_CONFIG_PATH),
    ]
}

/// Loads `path` into the process environment without overriding variables
/// that are already set. A missing file is not an error.
pub fn load_env_file(path: &Path) -> Result<bool, ConfigError> {
    dotenvy::from_path(path)
        .map(|_| true)
        .or_else(|err| match err {
            dotenvy::Error::Io(_) => Ok(false),
            _ => Err(ConfigError::EnvFile {
                path: path.to_path_buf(),
                source: err,
            }),
        })
}

/// Resolves configuration from an explicit file or the default search path,
/// then applies environment overrides.
pub fn load_resolved_config(
    explicit: Option<&Path>,
) -> Result<ResolvedConfigWithSource, ConfigError> {
    let mut resolved = match explicit {
        Some(path) => {
            if !path.exists() {
                return Err(ConfigError::Missing {
                    path: path.to_path_buf(),
                });
            }
            load_resolved_from_paths(&[path.to_path_buf()])?
        }
        None => load_resolved_from_paths(&default_paths())?,
    };
    resolved
        .resolved
        .apply_env_overrides(|key| env::var(key).ok());
    Ok(resolved)
}

pub fn load_from_paths(paths: &[PathBuf]) -> Result<Option<LoadedConfig>, ConfigError> {
    for path in paths {
        match fs::read_to_string(path) {
            Ok(contents) => {
                let parsed =
                    toml::from_str::<ConfigFile>(&contents).map_err(|err| ConfigError::Parse {
                        path: path.clone(),
                        message: err.to_string(),
                    })?;
                return Ok(Some(LoadedConfig::new(parsed, path.clone())));
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => continue,
            Err(err) => {
                return Err(ConfigError::Read {
                    path: path.clone(),
                    source: err,
                })
            }
        }
    }

    Ok(None)
}

pub fn load_resolved_from_paths(
    paths: &[PathBuf],
) -> Result<ResolvedConfigWithSource, ConfigError> {
    match load_from_paths(paths)? {
        Some(entry) => {
            let path = entry.source.clone();
            Ok(ResolvedConfigWithSource {
                resolved: ResolvedConfig::from_raw(entry.contents),
                source: Some(path),
            })
        }
        None => Ok(ResolvedConfigWithSource {
            resolved: ResolvedConfig::default(),
            source: None,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::tempdir;

    #[test]
    fn primary_path_wins() {
        let dir = tempdir().unwrap();
        let primary = dir.path().join("primary.toml");
        let secondary = dir.path().join("secondary.toml");
        fs::write(&secondary, "debounce_millis = 100").unwrap();
        fs::write(&primary, "debounce_millis = 500").unwrap();

        let loaded = load_from_paths(&[primary.clone(), secondary.clone()])
            .unwrap()
            .expect("config expected");
        assert_eq!(loaded.source(), primary.as_path());
        assert_eq!(loaded.contents.debounce_millis, Some(500));
    }

    #[test]
    fn secondary_used_when_primary_missing() {
        let dir = tempdir().unwrap();
        let missing = dir.path().join("missing.toml");
        let secondary = dir.path().join("secondary.toml");
        fs::write(&secondary, "data_dir = \"/srv/fingergate\"").unwrap();

        let loaded = load_from_paths(&[missing, secondary.clone()])
            .unwrap()
            .expect("config expected");
        assert_eq!(loaded.source, secondary);
        assert_eq!(
            loaded.contents.data_dir.as_deref(),
            Some(Path::new("/srv/fingergate"))
        );
    }

    #[test]
    fn parse_errors_are_reported() {
        let dir = tempdir().unwrap();
        let broken = dir.path().join("broken.toml");
        fs::write(&broken, "data_dir = { invalid = true }").unwrap();

        let err = load_from_paths(&[broken.clone()]).unwrap_err();
        match err {
            ConfigError::Parse { path, .. } => assert_eq!(path, broken),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("typo.toml");
        fs::write(&path, "debounce_milis = 10").unwrap();
        assert!(matches!(
            load_from_paths(&[path]),
            Err(ConfigError::Parse { .. })
        ));
    }

    #[test]
    fn io_errors_are_reported() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("dir.toml");
        fs::create_dir_all(&path).unwrap();

        let err = load_from_paths(&[path.clone()]).unwrap_err();
        match err {
            ConfigError::Read { path: err_path, .. } => assert_eq!(err_path, path),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn resolved_defaults_apply_when_missing() {
        let resolved = load_resolved_from_paths(&[]).unwrap();
        assert!(resolved.source.is_none());
        let config = resolved.resolved;
        assert_eq!(config.data_dir, PathBuf::from(DEFAULT_DATA_DIR));
        assert_eq!(config.enrollment_timeout, Duration::from_secs(30));
        assert_eq!(config.identify_poll, Duration::from_millis(200));
        assert_eq!(config.debounce, Duration::from_millis(2000));
        assert_eq!(config.stop_grace, Duration::from_millis(2000));
        assert_eq!(config.webhook_timeout, Duration::from_millis(5000));
        assert!(config.auto_start_identification);
        assert!(config.webhook_url.is_none());
    }

    #[test]
    fn zero_timeout_is_raised_and_blank_webhook_dropped() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(
            &path,
            "enrollment_timeout_secs = 0\nwebhook_url = \"  \"\nmatch_threshold = 400\n",
        )
        .unwrap();

        let resolved = load_resolved_from_paths(&[path.clone()]).unwrap();
        assert_eq!(resolved.source, Some(path));
        assert_eq!(resolved.resolved.enrollment_timeout, Duration::from_secs(1));
        assert!(resolved.resolved.webhook_url.is_none());
        assert_eq!(resolved.resolved.match_threshold, 100);
    }

    #[test]
    fn env_overrides_replace_file_values() {
        let mut config = ResolvedConfig::from_raw(ConfigFile {
            webhook_url: Some("http://file.example/hook".into()),
            ..ConfigFile::default()
        });
        let vars: HashMap<&str, &str> = HashMap::from([
            (DATA_DIR_ENV, "/var/lib/fingergate"),
            (WEBHOOK_URL_ENV, ""),
            (WEBHOOK_TOKEN_ENV, "abc"),
        ]);
        config.apply_env_overrides(|key| vars.get(key).map(|value| value.to_string()));

        assert_eq!(config.data_dir, PathBuf::from("/var/lib/fingergate"));
        assert!(config.webhook_url.is_none());
        assert_eq!(config.webhook_token.as_deref(), Some("abc"));
        assert_eq!(
            config.control_socket_path(),
            PathBuf::from("/var/lib/fingergate/control.sock")
        );

        let vars = HashMap::from([(CONTROL_SOCKET_ENV, "/run/fingergate.sock")]);
        config.apply_env_overrides(|key| vars.get(key).map(|value| value.to_string()));
        assert_eq!(
            config.control_socket_path(),
            PathBuf::from("/run/fingergate.sock")
        );
    }

    #[test]
    fn explicit_missing_path_is_an_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("absent.toml");
        assert!(matches!(
            load_resolved_config(Some(&path)),
            Err(ConfigError::Missing { .. })
        ));
    }

    #[test]
    fn missing_env_file_is_not_an_error() {
        let dir = tempdir().unwrap();
        assert!(!load_env_file(&dir.path().join(".env")).unwrap());
    }

    #[test]
    fn env_file_is_loaded() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(".env");
        fs::write(&path, "FINGERGATE_CONFIG_TEST_MARKER=loaded\n").unwrap();
        assert!(load_env_file(&path).unwrap());
        assert_eq!(
            env::var("FINGERGATE_CONFIG_TEST_MARKER").as_deref(),
            Ok("loaded")
        );
    }
}
