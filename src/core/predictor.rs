//! Access-time prediction
//!
//! Keeps a bounded timestamp history per path and forecasts the next access
//! through a pluggable [`AccessModel`]. The built-in model is a weighted mean
//! of recent inter-access intervals, where each step toward the present
//! doubles the weight.

use crate::error::{PixelMapError, Result};
use ahash::AHashMap;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};

pub const DEFAULT_HISTORY_SIZE: usize = 100;
pub const HOT_FILES_LIMIT: usize = 100;
pub const HISTORY_VERSION: &str = "1.0";

/// Inputs handed to an [`AccessModel`]
#[derive(Debug, Clone, PartialEq)]
pub struct AccessFeatures {
    pub access_count: usize,
    pub last_access: f64,
    /// Intervals between consecutive accesses, oldest first
    pub intervals: Vec<f64>,
}

/// Forecasts the delay until the next access
pub trait AccessModel: Send + Sync {
    /// Seconds after `features.last_access` until the next expected access
    fn predict(&self, features: &AccessFeatures) -> Option<f64>;
}

/// Exponentially weighted mean of inter-access intervals
#[derive(Debug, Clone, Copy, Default)]
pub struct WeightedIntervalModel;

impl AccessModel for WeightedIntervalModel {
    fn predict(&self, features: &AccessFeatures) -> Option<f64> {
        let n = features.intervals.len();
        if n == 0 {
            return None;
        }

        let mut weighted = 0.0;
        let mut total_weight = 0.0;
        for (i, interval) in features.intervals.iter().enumerate() {
            // Oldest gets 2^0, newest gets 2^(n-1)
            let weight = 2f64.powi(i as i32);
            weighted += interval * weight;
            total_weight += weight;
        }
        Some(weighted / total_weight)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PredictorStats {
    pub total_accesses: usize,
    pub unique_paths: usize,
    pub mean_interval: f64,
}

/// Versioned export of the raw history
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryDocument {
    pub version: String,
    pub exported_at: String,
    pub history_size: usize,
    pub entries: BTreeMap<String, Vec<f64>>,
}

pub struct AccessPredictor {
    history_size: usize,
    history: AHashMap<String, VecDeque<f64>>,
    model: Box<dyn AccessModel>,
}

impl AccessPredictor {
    pub fn new(history_size: usize) -> Self {
        Self::with_model(history_size, Box::new(WeightedIntervalModel))
    }

    pub fn with_model(history_size: usize, model: Box<dyn AccessModel>) -> Self {
        AccessPredictor {
            history_size: history_size.max(2),
            history: AHashMap::new(),
            model,
        }
    }

    pub fn history_size(&self) -> usize {
        self.history_size
    }

    pub fn record_access(&mut self, path: &str, timestamp: f64) {
        let entry = self.history.entry(path.to_string()).or_default();
        entry.push_back(timestamp);
        while entry.len() > self.history_size {
            entry.pop_front();
        }
    }

    pub fn features(&self, path: &str) -> Option<AccessFeatures> {
        let history = self.history.get(path)?;
        let last_access = *history.back()?;
        let intervals = history
            .iter()
            .zip(history.iter().skip(1))
            .map(|(a, b)| b - a)
            .collect();
        Some(AccessFeatures {
            access_count: history.len(),
            last_access,
            intervals,
        })
    }

    /// Predicted timestamp of the next access; needs two recorded accesses
    pub fn predict_next_access(&self, path: &str) -> Option<f64> {
        let features = self.features(path)?;
        if features.access_count < 2 {
            return None;
        }
        let delay = self.model.predict(&features)?;
        Some(features.last_access + delay)
    }

    pub fn last_access(&self, path: &str) -> Option<f64> {
        self.history.get(path).and_then(|h| h.back().copied())
    }

    pub fn access_count(&self, path: &str) -> usize {
        self.history.get(path).map_or(0, VecDeque::len)
    }

    /// Paths expected within `threshold` seconds of `now`, or touched that recently
    pub fn get_hot_files(&self, threshold: f64, now: f64) -> Vec<(String, f64)> {
        self.get_hot_files_limited(threshold, now, HOT_FILES_LIMIT)
    }

    pub fn get_hot_files_limited(
        &self,
        threshold: f64,
        now: f64,
        limit: usize,
    ) -> Vec<(String, f64)> {
        let mut hot: Vec<(String, f64)> = self
            .history
            .iter()
            .filter_map(|(path, history)| {
                let predicted = self.predict_next_access(path);
                if let Some(at) = predicted.filter(|at| (at - now).abs() <= threshold) {
                    return Some((path.clone(), at));
                }
                let last = *history.back()?;
                (now - last <= threshold).then(|| (path.clone(), now))
            })
            .collect();

        hot.sort_by(|a, b| a.1.total_cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
        hot.truncate(limit);
        hot
    }

    pub fn forget(&mut self, path: &str) {
        self.history.remove(path);
    }

    pub fn rename(&mut self, old: &str, new: &str) {
        if let Some(history) = self.history.remove(old) {
            self.history.insert(new.to_string(), history);
        }
    }

    pub fn statistics(&self) -> PredictorStats {
        let total_accesses = self.history.values().map(VecDeque::len).sum();
        let (sum, count) = self
            .history
            .values()
            .flat_map(|h| h.iter().zip(h.iter().skip(1)).map(|(a, b)| b - a))
            .fold((0.0, 0usize), |(sum, count), interval| {
                (sum + interval, count + 1)
            });

        PredictorStats {
            total_accesses,
            unique_paths: self.history.len(),
            mean_interval: if count == 0 { 0.0 } else { sum / count as f64 },
        }
    }

    pub fn export_history(&self) -> HistoryDocument {
        HistoryDocument {
            version: HISTORY_VERSION.to_string(),
            exported_at: chrono::Utc::now().to_rfc3339(),
            history_size: self.history_size,
            entries: self
                .history
                .iter()
                .map(|(path, h)| (path.clone(), h.iter().copied().collect()))
                .collect(),
        }
    }

    /// Replace the history of every path in `doc`; returns the path count
    pub fn import_history(&mut self, doc: HistoryDocument) -> Result<usize> {
        if doc.version != HISTORY_VERSION {
            return Err(PixelMapError::VersionMismatch {
                expected: HISTORY_VERSION.to_string(),
                found: doc.version,
            });
        }

        let count = doc.entries.len();
        for (path, timestamps) in doc.entries {
            let skip = timestamps.len().saturating_sub(self.history_size);
            self.history
                .insert(path, timestamps.into_iter().skip(skip).collect());
        }
        Ok(count)
    }

    pub fn export_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(&self.export_history())?)
    }

    pub fn import_json(&mut self, json: &str) -> Result<usize> {
        let doc: HistoryDocument = serde_json::from_str(json)?;
        self.import_history(doc)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const T: f64 = 1_700_000_000.0;

    #[test]
    fn test_needs_two_accesses() {
        let mut predictor = AccessPredictor::new(100);
        assert!(predictor.predict_next_access("a").is_none());
        predictor.record_access("a", T);
        assert!(predictor.predict_next_access("a").is_none());
    }

    #[test]
    fn test_regular_interval() {
        let mut predictor = AccessPredictor::new(100);
        for i in 0..3 {
            predictor.record_access("a", T + 10.0 * i as f64);
        }
        let predicted = predictor.predict_next_access("a").unwrap();
        assert!((predicted - (T + 30.0)).abs() < 1e-6);
    }

    #[test]
    fn test_recent_intervals_dominate() {
        let mut predictor = AccessPredictor::new(100);
        // Intervals: 100, 100, 10 -> weights 1, 2, 4
        for ts in [T, T + 100.0, T + 200.0, T + 210.0] {
            predictor.record_access("a", ts);
        }
        let predicted = predictor.predict_next_access("a").unwrap();
        let expected = T + 210.0 + (100.0 + 200.0 + 40.0) / 7.0;
        assert!((predicted - expected).abs() < 1e-6);

        // Closer to the last interval than a plain mean (70s) would be
        let naive = T + 210.0 + 70.0;
        assert!((predicted - (T + 220.0)).abs() < (naive - (T + 220.0)).abs());
    }

    #[test]
    fn test_history_is_capped() {
        let mut predictor = AccessPredictor::new(5);
        for i in 0..20 {
            predictor.record_access("a", T + i as f64);
        }
        assert_eq!(predictor.access_count("a"), 5);
        assert_eq!(predictor.last_access("a"), Some(T + 19.0));
    }

    #[test]
    fn test_hot_files() {
        let mut predictor = AccessPredictor::new(100);
        let now = T + 10_000.0;

        predictor.record_access("stale", T - 20.0);
        predictor.record_access("stale", T - 10.0);
        predictor.record_access("stale", T);

        predictor.record_access("fresh", now - 2.0);

        predictor.record_access("due", now - 20.0);
        predictor.record_access("due", now - 10.0);

        let hot = predictor.get_hot_files(5.0, now);
        let paths: Vec<_> = hot.iter().map(|(p, _)| p.as_str()).collect();
        assert_eq!(paths, vec!["due", "fresh"]);
        assert!((hot[0].1 - now).abs() < 1e-6);
    }

    #[test]
    fn test_hot_files_limit_and_order() {
        let mut predictor = AccessPredictor::new(100);
        for i in 0..150 {
            predictor.record_access(&format!("f{}", i), T - i as f64);
        }
        let hot = predictor.get_hot_files(1000.0, T);
        assert_eq!(hot.len(), HOT_FILES_LIMIT);
        assert!(hot.windows(2).all(|w| w[0].1 <= w[1].1));
    }

    struct FixedDelay(f64);

    impl AccessModel for FixedDelay {
        fn predict(&self, _features: &AccessFeatures) -> Option<f64> {
            Some(self.0)
        }
    }

    #[test]
    fn test_custom_model() {
        let mut predictor = AccessPredictor::with_model(10, Box::new(FixedDelay(5.0)));
        predictor.record_access("a", T);
        predictor.record_access("a", T + 100.0);
        assert_eq!(predictor.predict_next_access("a"), Some(T + 105.0));
    }

    #[test]
    fn test_statistics() {
        let mut predictor = AccessPredictor::new(100);
        predictor.record_access("a", T);
        predictor.record_access("a", T + 10.0);
        predictor.record_access("b", T);
        predictor.record_access("b", T + 30.0);

        let stats = predictor.statistics();
        assert_eq!(stats.total_accesses, 4);
        assert_eq!(stats.unique_paths, 2);
        assert!((stats.mean_interval - 20.0).abs() < 1e-9);
    }

    #[test]
    fn test_export_import() {
        let mut predictor = AccessPredictor::new(100);
        predictor.record_access("a", T);
        predictor.record_access("a", T + 10.0);
        let json = predictor.export_json().unwrap();

        let mut restored = AccessPredictor::new(100);
        assert_eq!(restored.import_json(&json).unwrap(), 1);
        assert_eq!(restored.predict_next_access("a"), Some(T + 20.0));
    }

    #[test]
    fn test_import_rejects_version() {
        let mut predictor = AccessPredictor::new(100);
        let mut doc = predictor.export_history();
        doc.version = "2.0".to_string();
        assert!(matches!(
            predictor.import_history(doc),
            Err(PixelMapError::VersionMismatch { .. })
        ));
    }
}
