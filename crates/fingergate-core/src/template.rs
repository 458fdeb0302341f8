use crate::errors::{AppError, AppResult};
use crate::sensor::{ImageGeometry, Sensor, PARAM_IMAGE_HEIGHT, PARAM_IMAGE_WIDTH};

/// Decodes a 4-byte little-endian device parameter buffer.
pub fn le_u32(buffer: [u8; 4]) -> u32 {
    u32::from(buffer[0])
        | (u32::from(buffer[1]) << 8)
        | (u32::from(buffer[2]) << 16)
        | (u32::from(buffer[3]) << 24)
}

pub fn le_u32_bytes(value: u32) -> [u8; 4] {
    [
        (value & 0xff) as u8,
        ((value >> 8) & 0xff) as u8,
        ((value >> 16) & 0xff) as u8,
        ((value >> 24) & 0xff) as u8,
    ]
}

pub fn read_geometry(sensor: &mut dyn Sensor) -> AppResult<ImageGeometry> {
    let width = le_u32(sensor.parameter(PARAM_IMAGE_WIDTH)?);
    let height = le_u32(sensor.parameter(PARAM_IMAGE_HEIGHT)?);
    Ok(ImageGeometry { width, height })
}

pub fn encode(sensor: &dyn Sensor, template: &[u8]) -> String {
    sensor.encode_template(template)
}

/// Decodes a stored template, rejecting blank text and empty payloads.
pub fn decode(sensor: &dyn Sensor, text: &str) -> AppResult<Vec<u8>> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Err(AppError::InvalidInput("template is empty".into()));
    }
    let template = sensor.decode_template(trimmed)?;
    if template.is_empty() {
        return Err(AppError::InvalidInput(
            "template decodes to zero bytes".into(),
        ));
    }
    Ok(template)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn le_u32_reads_little_endian() {
        assert_eq!(le_u32([0x00, 0x01, 0x00, 0x00]), 256);
        assert_eq!(le_u32([0x68, 0x01, 0x00, 0x00]), 360);
        assert_eq!(le_u32([0xff, 0xff, 0xff, 0xff]), u32::MAX);
    }

    #[test]
    fn le_u32_bytes_matches_std() {
        assert_eq!(le_u32_bytes(0x1234_5678), 0x1234_5678u32.to_le_bytes());
        assert_eq!(le_u32(le_u32_bytes(288)), 288);
    }
}
