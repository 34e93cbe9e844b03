//! Best-object tracking.
//!
//! Keeps, per label, the highest scoring recent detection of a camera and an
//! independent copy of the (annotated) frame it was seen on. A record is
//! replaced by a better scoring candidate, or by any candidate once the record
//! is older than the staleness window. Records are never removed.

use std::collections::HashMap;
use std::sync::Arc;

use crate::frame::Frame;
use crate::TrackedObject;

/// Default staleness window in seconds.
pub const DEFAULT_BEST_STALE_SECS: f64 = 60.0;

/// Best recent detection for one label.
#[derive(Debug)]
pub struct BestObjectRecord {
    pub label: String,
    pub object: TrackedObject,
    /// Copy of the camera frame at the time of replacement. Never aliases the
    /// camera's current frame.
    pub frame: Arc<Frame>,
    /// Observation time of `object`, epoch seconds.
    pub last_update: f64,
}

impl BestObjectRecord {
    pub fn score(&self) -> f64 {
        self.object.score
    }
}

/// Per-camera table of best records keyed by label.
pub struct BestObjectTracker {
    records: HashMap<String, Arc<BestObjectRecord>>,
    stale_after_secs: f64,
}

impl BestObjectTracker {
    pub fn new(stale_after_secs: f64) -> Self {
        Self {
            records: HashMap::new(),
            stale_after_secs,
        }
    }

    /// Offer a candidate seen on the current frame.
    ///
    /// Returns true when the candidate became the label's best record. `current`
    /// is copied only on replacement.
    pub fn consider(&mut self, candidate: &TrackedObject, current: &Frame, now: f64) -> bool {
        let replace = match self.records.get(&candidate.label) {
            None => true,
            Some(existing) => self.should_replace(existing, candidate, now),
        };
        if !replace {
            return false;
        }

        let record = BestObjectRecord {
            label: candidate.label.clone(),
            object: candidate.clone(),
            frame: Arc::new(current.clone()),
            last_update: candidate.frame_time,
        };
        log::debug!(
            "best {} updated: score={:.2} frame_time={:.3}",
            record.label,
            record.object.score,
            record.last_update
        );
        self.records.insert(candidate.label.clone(), Arc::new(record));
        true
    }

    fn should_replace(
        &self,
        existing: &BestObjectRecord,
        candidate: &TrackedObject,
        now: f64,
    ) -> bool {
        candidate.score > existing.object.score
            || (now - existing.last_update) > self.stale_after_secs
    }

    pub fn get(&self, label: &str) -> Option<Arc<BestObjectRecord>> {
        self.records.get(label).cloned()
    }

    pub fn labels(&self) -> Vec<String> {
        let mut labels: Vec<String> = self.records.keys().cloned().collect();
        labels.sort();
        labels
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl Default for BestObjectTracker {
    fn default() -> Self {
        Self::new(DEFAULT_BEST_STALE_SECS)
    }
}
