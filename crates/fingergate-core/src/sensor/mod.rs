pub mod matcher;
pub mod spool;

use serde::Serialize;

use crate::errors::AppResult;

pub use matcher::FeatureMatcher;
pub use spool::{SpoolSensor, SpoolSensorConfig};

/// Device parameter code for the image width.
pub const PARAM_IMAGE_WIDTH: u32 = 1;
/// Device parameter code for the image height.
pub const PARAM_IMAGE_HEIGHT: u32 = 2;

/// One acquisition from the reader: the raw grayscale image and its template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sample {
    pub image: Vec<u8>,
    pub template: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ImageGeometry {
    pub width: u32,
    pub height: u32,
}

impl ImageGeometry {
    pub fn pixel_count(&self) -> usize {
        self.width as usize * self.height as usize
    }
}

/// Key into the sensor's matching database. Process-local; never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MatchHandle(u32);

impl MatchHandle {
    pub fn new(value: u32) -> Self {
        Self(value)
    }

    pub fn value(self) -> u32 {
        self.0
    }
}

/// Blocking fingerprint reader plus its template matching database.
///
/// Implementations are driven by exactly one caller at a time; the arbiter
/// owns the only instance behind its lock.
pub trait Sensor: Send {
    fn open(&mut self) -> AppResult<()>;
    fn close(&mut self) -> AppResult<()>;
    fn parameter(&mut self, code: u32) -> AppResult<[u8; 4]>;
    /// `Ok(None)` means no finger is on the reader.
    fn acquire(&mut self) -> AppResult<Option<Sample>>;
    /// Similarity of two templates; zero or below means a different finger.
    fn match_pair(&mut self, first: &[u8], second: &[u8]) -> AppResult<i32>;
    fn merge(&mut self, first: &[u8], second: &[u8], third: &[u8]) -> AppResult<Vec<u8>>;
    fn identify(&mut self, template: &[u8]) -> AppResult<Option<(MatchHandle, i32)>>;
    fn add_to_index(&mut self, handle: MatchHandle, template: &[u8]) -> AppResult<()>;
    fn remove_from_index(&mut self, handle: MatchHandle) -> AppResult<()>;
    fn encode_template(&self, template: &[u8]) -> String;
    fn decode_template(&self, text: &str) -> AppResult<Vec<u8>>;
}
