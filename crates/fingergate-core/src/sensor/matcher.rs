use std::collections::BTreeMap;

use crate::errors::{AppError, AppResult};
use crate::sensor::MatchHandle;

pub const DEFAULT_MATCH_THRESHOLD: i32 = 70;
pub const MERGE_LENGTH_MISMATCH: i32 = -1;

/// Templates are little-endian `f32` feature vectors compared by cosine
/// similarity scaled to 0..=100.
#[derive(Debug, Clone)]
pub struct FeatureMatcher {
    threshold: i32,
    entries: BTreeMap<MatchHandle, Vec<f32>>,
}

impl Default for FeatureMatcher {
    fn default() -> Self {
        Self::new(DEFAULT_MATCH_THRESHOLD)
    }
}

impl FeatureMatcher {
    pub fn new(threshold: i32) -> Self {
        Self {
            threshold: threshold.clamp(1, 100),
            entries: BTreeMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Scores below the threshold are reported as zero.
    pub fn score(&self, first: &[u8], second: &[u8]) -> AppResult<i32> {
        let lhs = parse_features(first)?;
        let rhs = parse_features(second)?;
        if lhs.len() != rhs.len() {
            return Ok(0);
        }
        Ok(self.thresholded(&lhs, &rhs))
    }

    pub fn merge(&self, first: &[u8], second: &[u8], third: &[u8]) -> AppResult<Vec<u8>> {
        let vectors = [
            parse_features(first)?,
            parse_features(second)?,
            parse_features(third)?,
        ];
        let dim = vectors[0].len();
        if vectors.iter().any(|vector| vector.len() != dim) {
            return Err(AppError::MergeFailed {
                code: MERGE_LENGTH_MISMATCH,
            });
        }

        let merged: Vec<f32> = (0..dim)
            .map(|i| vectors.iter().map(|vector| vector[i]).sum::<f32>() / 3.0)
            .collect();
        Ok(encode_features(&merged))
    }

    pub fn insert(&mut self, handle: MatchHandle, template: &[u8]) -> AppResult<()> {
        let features = parse_features(template)?;
        self.entries.insert(handle, features);
        Ok(())
    }

    pub fn remove(&mut self, handle: MatchHandle) -> bool {
        self.entries.remove(&handle).is_some()
    }

    /// Best-scoring indexed handle at or above the threshold.
    pub fn identify(&self, template: &[u8]) -> AppResult<Option<(MatchHandle, i32)>> {
        let candidate = parse_features(template)?;
        let mut best: Option<(MatchHandle, i32)> = None;
        for (handle, features) in &self.entries {
            if features.len() != candidate.len() {
                continue;
            }
            let score = self.thresholded(&candidate, features);
            if score <= 0 {
                continue;
            }
            match best {
                Some((_, best_score)) if best_score >= score => {}
                _ => best = Some((*handle, score)),
            }
        }
        Ok(best)
    }

    fn thresholded(&self, lhs: &[f32], rhs: &[f32]) -> i32 {
        let similarity = cosine_similarity(lhs, rhs);
        if !similarity.is_finite() {
            return 0;
        }
        let score = (similarity.clamp(0.0, 1.0) * 100.0).round() as i32;
        if score >= self.threshold {
            score
        } else {
            0
        }
    }
}

pub fn cosine_similarity(lhs: &[f32], rhs: &[f32]) -> f64 {
    let mut dot = 0.0;
    let mut norm_lhs = 0.0;
    let mut norm_rhs = 0.0;

    for (l, r) in lhs.iter().zip(rhs.iter()) {
        let (l, r) = (f64::from(*l), f64::from(*r));
        dot += l * r;
        norm_lhs += l * l;
        norm_rhs += r * r;
    }

    dot / (norm_lhs.sqrt() * norm_rhs.sqrt())
}

pub fn parse_features(template: &[u8]) -> AppResult<Vec<f32>> {
    if template.is_empty() || template.len() % 4 != 0 {
        return Err(AppError::InvalidInput(format!(
            "template of {} bytes is not a feature vector",
            template.len()
        )));
    }
    Ok(template
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect())
}

pub fn encode_features(features: &[f32]) -> Vec<u8> {
    features
        .iter()
        .flat_map(|value| value.to_le_bytes())
        .collect()
}
