use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use base64::{engine::general_purpose, Engine as _};
use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};
use tracing::debug;

use crate::errors::{AppError, AppResult};
use crate::sensor::{
    FeatureMatcher, ImageGeometry, MatchHandle, Sample, Sensor, PARAM_IMAGE_HEIGHT,
    PARAM_IMAGE_WIDTH,
};
use crate::template::le_u32_bytes;

const TEMPLATE_EXTENSION: &str = "tpl";
const IMAGE_EXTENSION: &str = "raw";
/// Held with an exclusive `flock` while the reader is open.
pub const LOCK_FILE: &str = ".fingergate.lock";
const CODE_NOT_OPEN: i32 = -2;
const CODE_UNKNOWN_PARAMETER: i32 = -3;

#[derive(Debug, Clone)]
pub struct SpoolSensorConfig {
    pub spool_dir: PathBuf,
    pub geometry: ImageGeometry,
    pub match_threshold: i32,
}

/// Reader backed by a directory of dropped samples.
///
/// Each `<stem>.tpl` file is one finger placement; an optional `<stem>.raw`
/// holds the grayscale image. Files are consumed oldest first. Only one
/// process can have the spool open at a time.
pub struct SpoolSensor {
    config: SpoolSensorConfig,
    matcher: FeatureMatcher,
    lock: Option<Flock<File>>,
}

impl fmt::Debug for SpoolSensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpoolSensor")
            .field("config", &self.config)
            .field("opened", &self.lock.is_some())
            .finish()
    }
}

impl SpoolSensor {
    pub fn new(config: SpoolSensorConfig) -> Self {
        let matcher = FeatureMatcher::new(config.match_threshold);
        Self {
            config,
            matcher,
            lock: None,
        }
    }

    pub fn spool_dir(&self) -> &Path {
        &self.config.spool_dir
    }

    fn ensure_open(&self, operation: &'static str) -> AppResult<()> {
        if self.lock.is_some() {
            Ok(())
        } else {
            Err(AppError::Device {
                operation,
                code: CODE_NOT_OPEN,
            })
        }
    }

    fn oldest_template(&self) -> AppResult<Option<PathBuf>> {
        let entries = fs::read_dir(&self.config.spool_dir).map_err(|err| self.lost(err))?;
        let mut candidates: Vec<(SystemTime, PathBuf)> = Vec::new();
        for entry in entries {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some(TEMPLATE_EXTENSION) {
                continue;
            }
            let modified = entry
                .metadata()
                .and_then(|meta| meta.modified())
                .unwrap_or(SystemTime::UNIX_EPOCH);
            candidates.push((modified, path));
        }
        candidates.sort();
        Ok(candidates.into_iter().next().map(|(_, path)| path))
    }

    fn claim(&self) -> AppResult<Flock<File>> {
        let path = self.config.spool_dir.join(LOCK_FILE);
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .map_err(|err| self.lost(err))?;
        Flock::lock(file, FlockArg::LockExclusiveNonblock).map_err(|(_, errno)| {
            if errno == Errno::EWOULDBLOCK {
                AppError::SensorInUse(format!(
                    "{} is held by another fingergate process",
                    self.config.spool_dir.display()
                ))
            } else {
                AppError::Io(io::Error::from(errno))
            }
        })
    }

    fn lost(&self, err: io::Error) -> AppError {
        AppError::DeviceLost(format!(
            "spool directory {} unavailable: {err}",
            self.config.spool_dir.display()
        ))
    }
}

impl Sensor for SpoolSensor {
    fn open(&mut self) -> AppResult<()> {
        if !self.config.spool_dir.is_dir() {
            return Err(AppError::DeviceLost(format!(
                "spool directory {} does not exist",
                self.config.spool_dir.display()
            )));
        }
        if self.lock.is_none() {
            self.lock = Some(self.claim()?);
        }
        debug!(spool_dir = %self.config.spool_dir.display(), "spool sensor opened");
        Ok(())
    }

    fn close(&mut self) -> AppResult<()> {
        if let Some(lock) = self.lock.take() {
            lock.unlock().map_err(|(_, errno)| io::Error::from(errno))?;
        }
        Ok(())
    }

    fn parameter(&mut self, code: u32) -> AppResult<[u8; 4]> {
        self.ensure_open("parameter")?;
        match code {
            PARAM_IMAGE_WIDTH => Ok(le_u32_bytes(self.config.geometry.width)),
            PARAM_IMAGE_HEIGHT => Ok(le_u32_bytes(self.config.geometry.height)),
            _ => Err(AppError::Device {
                operation: "parameter",
                code: CODE_UNKNOWN_PARAMETER,
            }),
        }
    }

    fn acquire(&mut self) -> AppResult<Option<Sample>> {
        self.ensure_open("acquire")?;
        let Some(template_path) = self.oldest_template()? else {
            return Ok(None);
        };

        let template = fs::read(&template_path)?;
        fs::remove_file(&template_path)?;

        let image_path = template_path.with_extension(IMAGE_EXTENSION);
        let image = match fs::read(&image_path) {
            Ok(bytes) => {
                fs::remove_file(&image_path)?;
                bytes
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => Vec::new(),
            Err(err) => return Err(err.into()),
        };

        debug!(sample = %template_path.display(), "spool sample consumed");
        Ok(Some(Sample { image, template }))
    }

    fn match_pair(&mut self, first: &[u8], second: &[u8]) -> AppResult<i32> {
        self.ensure_open("match")?;
        self.matcher.score(first, second)
    }

    fn merge(&mut self, first: &[u8], second: &[u8], third: &[u8]) -> AppResult<Vec<u8>> {
        self.ensure_open("merge")?;
        self.matcher.merge(first, second, third)
    }

    fn identify(&mut self, template: &[u8]) -> AppResult<Option<(MatchHandle, i32)>> {
        self.ensure_open("identify")?;
        self.matcher.identify(template)
    }

    fn add_to_index(&mut self, handle: MatchHandle, template: &[u8]) -> AppResult<()> {
        self.ensure_open("add")?;
        self.matcher.insert(handle, template)
    }

    fn remove_from_index(&mut self, handle: MatchHandle) -> AppResult<()> {
        self.ensure_open("remove")?;
        self.matcher.remove(handle);
        Ok(())
    }

    fn encode_template(&self, template: &[u8]) -> String {
        general_purpose::STANDARD.encode(template)
    }

    fn decode_template(&self, text: &str) -> AppResult<Vec<u8>> {
        general_purpose::STANDARD
            .decode(text)
            .map_err(|err| AppError::InvalidInput(format!("template is not valid base64: {err}")))
    }
}
