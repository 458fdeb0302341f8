use std::fs;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::errors::{AppError, AppResult, ConflictReason};
use crate::record::IdentityRecord;

pub const REGISTRY_FILE: &str = "fingerprints.json";
pub const RECORDS_DIR: &str = "fingerprints";
pub const DETAIL_FILE: &str = "user_detail.json";

pub trait IdentityStore: Send + Sync {
    fn next_id(&self) -> String;
    /// Case-insensitive name lookup.
    fn exists(&self, name: &str) -> AppResult<bool> {
        Ok(self.find_by_name(name)?.is_some())
    }
    fn find_by_name(&self, name: &str) -> AppResult<Option<IdentityRecord>>;
    fn find_by_id(&self, id: &str) -> AppResult<Option<IdentityRecord>>;
    fn list(&self) -> AppResult<Vec<IdentityRecord>>;
    /// Fails with `Conflict` when the name is already taken.
    fn add(&self, record: IdentityRecord) -> AppResult<()>;
    fn delete(&self, id: &str) -> AppResult<bool>;
    fn count(&self) -> AppResult<usize> {
        Ok(self.list()?.len())
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct RegistryFile {
    #[serde(default)]
    registrations: Vec<IdentityRecord>,
}

/// Identity records in `<data_dir>/fingerprints.json`, with a per-identity
/// directory under `<data_dir>/fingerprints/<id>/`.
#[derive(Debug)]
pub struct JsonIdentityStore {
    registry_path: PathBuf,
    records_dir: PathBuf,
    records: Mutex<Vec<IdentityRecord>>,
}

impl JsonIdentityStore {
    pub fn open(data_dir: &Path) -> AppResult<Self> {
        let records_dir = data_dir.join(RECORDS_DIR);
        fs::create_dir_all(&records_dir).map_err(|source| AppError::StoreWrite {
            path: records_dir.clone(),
            source,
        })?;

        let registry_path = data_dir.join(REGISTRY_FILE);
        let records = if registry_path.exists() {
            read_registry(&registry_path)?
        } else {
            write_json_atomic(&registry_path, &RegistryFile::default())?;
            Vec::new()
        };
        debug!(
            path = %registry_path.display(),
            count = records.len(),
            "identity store loaded"
        );

        Ok(Self {
            registry_path,
            records_dir,
            records: Mutex::new(records),
        })
    }

    pub fn registry_path(&self) -> &Path {
        &self.registry_path
    }

    pub fn records_dir(&self) -> &Path {
        &self.records_dir
    }

    pub fn identity_dir(&self, id: &str) -> PathBuf {
        self.records_dir.join(id)
    }

    fn lock(&self) -> MutexGuard<'_, Vec<IdentityRecord>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn persist(&self, records: &[IdentityRecord]) -> AppResult<()> {
        let registry = RegistryFile {
            registrations: records.to_vec(),
        };
        write_json_atomic(&self.registry_path, &registry)
    }
}

impl IdentityStore for JsonIdentityStore {
    fn next_id(&self) -> String {
        Uuid::new_v4().to_string()
    }

    fn find_by_name(&self, name: &str) -> AppResult<Option<IdentityRecord>> {
        Ok(self
            .lock()
            .iter()
            .find(|record| record.name_matches(name))
            .cloned())
    }

    fn find_by_id(&self, id: &str) -> AppResult<Option<IdentityRecord>> {
        Ok(self.lock().iter().find(|record| record.id == id).cloned())
    }

    fn list(&self) -> AppResult<Vec<IdentityRecord>> {
        Ok(self.lock().clone())
    }

    fn add(&self, record: IdentityRecord) -> AppResult<()> {
        let mut records = self.lock();
        if let Some(existing) = records.iter().find(|r| r.name_matches(&record.name)) {
            return Err(AppError::Conflict {
                reason: ConflictReason::Name,
                existing: existing.reference(),
            });
        }
        if records.iter().any(|r| r.id == record.id) {
            return Err(AppError::InvalidInput(format!(
                "identity id {} already in use",
                record.id
            )));
        }

        records.push(record.clone());
        if let Err(err) = self.persist(&records) {
            records.pop();
            return Err(err);
        }

        let detail_path = self.identity_dir(&record.id).join(DETAIL_FILE);
        if let Err(err) = write_json_atomic(&detail_path, &record) {
            warn!(path = %detail_path.display(), error = %err, "failed to write identity detail file");
        }
        Ok(())
    }

    fn delete(&self, id: &str) -> AppResult<bool> {
        let mut records = self.lock();
        let Some(position) = records.iter().position(|record| record.id == id) else {
            return Ok(false);
        };

        let removed = records.remove(position);
        if let Err(err) = self.persist(&records) {
            records.insert(position, removed);
            return Err(err);
        }

        let dir = self.identity_dir(id);
        match fs::remove_dir_all(&dir) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => {
                warn!(path = %dir.display(), error = %err, "failed to remove identity directory")
            }
        }
        Ok(true)
    }

    fn count(&self) -> AppResult<usize> {
        Ok(self.lock().len())
    }
}

fn read_registry(path: &Path) -> AppResult<Vec<IdentityRecord>> {
    let data = fs::read(path).map_err(|source| AppError::StoreRead {
        path: path.to_path_buf(),
        source,
    })?;
    let registry: RegistryFile =
        serde_json::from_slice(&data).map_err(|err| AppError::InvalidStore {
            path: path.to_path_buf(),
            message: err.to_string(),
        })?;
    Ok(registry.registrations)
}

pub fn write_json_atomic<T: Serialize + ?Sized>(path: &Path, value: &T) -> AppResult<()> {
    let write_error = |source: io::Error| AppError::StoreWrite {
        path: path.to_path_buf(),
        source,
    };

    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent).map_err(write_error)?;
    let mut tmp = NamedTempFile::new_in(parent).map_err(write_error)?;

    {
        let file = tmp.as_file_mut();
        {
            let mut writer = BufWriter::new(&mut *file);
            let serialized = serde_json::to_vec_pretty(value)?;
            writer.write_all(&serialized).map_err(write_error)?;
            writer.write_all(b"\n").map_err(write_error)?;
            writer.flush().map_err(write_error)?;
        }
        file.sync_all().map_err(write_error)?;
    }

    let file = tmp.persist(path).map_err(|err| write_error(err.error))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut perms = file.metadata().map_err(write_error)?.permissions();
        perms.set_mode(0o600);
        file.set_permissions(perms).map_err(write_error)?;
    }
    #[cfg(not(unix))]
    drop(file);

    Ok(())
}
