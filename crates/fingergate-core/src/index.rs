use std::collections::HashMap;

use crate::errors::AppResult;
use crate::sensor::{MatchHandle, Sensor};

const FIRST_HANDLE: u32 = 1;

/// Maps sensor match handles back to identity ids.
///
/// Handles are allocated sequentially from 1 and never reused, even when a
/// registration fails or an identity is removed.
#[derive(Debug)]
pub struct MatchIndex {
    next: u32,
    entries: HashMap<MatchHandle, String>,
}

impl Default for MatchIndex {
    fn default() -> Self {
        Self {
            next: FIRST_HANDLE,
            entries: HashMap::new(),
        }
    }
}

impl MatchIndex {
    pub fn register(
        &mut self,
        sensor: &mut dyn Sensor,
        identity_id: &str,
        template: &[u8],
    ) -> AppResult<MatchHandle> {
        let handle = MatchHandle::new(self.next);
        self.next += 1;
        sensor.add_to_index(handle, template)?;
        self.entries.insert(handle, identity_id.to_string());
        Ok(handle)
    }

    pub fn resolve(&self, handle: MatchHandle) -> Option<&str> {
        self.entries.get(&handle).map(String::as_str)
    }

    pub fn handle_for(&self, identity_id: &str) -> Option<MatchHandle> {
        self.entries
            .iter()
            .find(|(_, id)| id.as_str() == identity_id)
            .map(|(handle, _)| *handle)
    }

    /// Drops the identity from both this map and the sensor database.
    pub fn remove_identity(
        &mut self,
        sensor: &mut dyn Sensor,
        identity_id: &str,
    ) -> AppResult<bool> {
        let Some(handle) = self.handle_for(identity_id) else {
            return Ok(false);
        };
        sensor.remove_from_index(handle)?;
        self.entries.remove(&handle);
        Ok(true)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::AppError;
    use crate::sensor::Sample;

    #[derive(Default)]
    struct RecordingSensor {
        added: Vec<MatchHandle>,
        removed: Vec<MatchHandle>,
        reject_next_add: bool,
    }

    impl Sensor for RecordingSensor {
        fn open(&mut self) -> AppResult<()> {
            Ok(())
        }
        fn close(&mut self) -> AppResult<()> {
            Ok(())
        }
        fn parameter(&mut self, _code: u32) -> AppResult<[u8; 4]> {
            Ok([0; 4])
        }
        fn acquire(&mut self) -> AppResult<Option<Sample>> {
            Ok(None)
        }
        fn match_pair(&mut self, _first: &[u8], _second: &[u8]) -> AppResult<i32> {
            Ok(0)
        }
        fn merge(&mut self, first: &[u8], _second: &[u8], _third: &[u8]) -> AppResult<Vec<u8>> {
            Ok(first.to_vec())
        }
        fn identify(&mut self, _template: &[u8]) -> AppResult<Option<(MatchHandle, i32)>> {
            Ok(None)
        }
        fn add_to_index(&mut self, handle: MatchHandle, _template: &[u8]) -> AppResult<()> {
            if std::mem::take(&mut self.reject_next_add) {
                return Err(AppError::Device {
                    operation: "add",
                    code: -9,
                });
            }
            self.added.push(handle);
            Ok(())
        }
        fn remove_from_index(&mut self, handle: MatchHandle) -> AppResult<()> {
            self.removed.push(handle);
            Ok(())
        }
        fn encode_template(&self, _template: &[u8]) -> String {
            String::new()
        }
        fn decode_template(&self, _text: &str) -> AppResult<Vec<u8>> {
            Ok(Vec::new())
        }
    }

    #[test]
    fn handles_start_at_one_and_increase() {
        let mut sensor = RecordingSensor::default();
        let mut index = MatchIndex::default();
        let first = index.register(&mut sensor, "a", &[1]).unwrap();
        let second = index.register(&mut sensor, "b", &[2]).unwrap();
        assert_eq!(first.value(), 1);
        assert_eq!(second.value(), 2);
        assert_eq!(index.resolve(second), Some("b"));
    }

    #[test]
    fn handles_are_not_reused_after_failure_or_removal() {
        let mut sensor = RecordingSensor {
            reject_next_add: true,
            ..Default::default()
        };
        let mut index = MatchIndex::default();
        assert!(index.register(&mut sensor, "a", &[1]).is_err());
        let handle = index.register(&mut sensor, "a", &[1]).unwrap();
        assert_eq!(handle.value(), 2);

        assert!(index.remove_identity(&mut sensor, "a").unwrap());
        assert_eq!(sensor.removed, vec![handle]);
        assert!(index.resolve(handle).is_none());

        let next = index.register(&mut sensor, "b", &[2]).unwrap();
        assert_eq!(next.value(), 3);
        assert!(!index.remove_identity(&mut sensor, "missing").unwrap());
    }
}
