use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use image::{GrayImage, ImageFormat};
use tracing::debug;

use crate::errors::{AppError, AppResult};
use crate::sensor::ImageGeometry;

/// Destination for the diagnostic images of accepted enrollment captures.
pub trait CaptureSink: Send + Sync {
    fn save(
        &self,
        identity_id: &str,
        capture_number: usize,
        image: &[u8],
        geometry: ImageGeometry,
    ) -> AppResult<PathBuf>;

    /// Removes every artifact written for `identity_id`.
    fn discard(&self, identity_id: &str) -> AppResult<()>;
}

/// Writes `capture_<n>.bmp` files under `<root>/<identity id>/`.
#[derive(Debug, Clone)]
pub struct FileCaptureSink {
    root: PathBuf,
}

impl FileCaptureSink {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

pub fn capture_file_name(capture_number: usize) -> String {
    format!("capture_{capture_number}.bmp")
}

impl CaptureSink for FileCaptureSink {
    fn save(
        &self,
        identity_id: &str,
        capture_number: usize,
        image: &[u8],
        geometry: ImageGeometry,
    ) -> AppResult<PathBuf> {
        let gray = GrayImage::from_raw(geometry.width, geometry.height, image.to_vec())
            .ok_or(AppError::CaptureGeometry {
                width: geometry.width,
                height: geometry.height,
                actual: image.len(),
            })?;

        let dir = self.root.join(identity_id);
        fs::create_dir_all(&dir)?;
        let path = dir.join(capture_file_name(capture_number));
        gray.save_with_format(&path, ImageFormat::Bmp)
            .map_err(|source| AppError::CaptureWrite {
                path: path.clone(),
                source,
            })?;
        debug!(path = %path.display(), "capture image written");
        Ok(path)
    }

    fn discard(&self, identity_id: &str) -> AppResult<()> {
        let dir = self.root.join(identity_id);
        match fs::remove_dir_all(&dir) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}
