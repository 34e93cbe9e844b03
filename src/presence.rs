//! Presence debouncing.
//!
//! Each label of a camera is either ON or OFF. A label counts as detected in a
//! batch only when at least one of its tracked objects has been observed on
//! `min_history_len` frames, which filters single-frame detection noise.
//! State changes are reported exactly once, as `PresenceChange`s.

use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;

use crate::best::DEFAULT_BEST_STALE_SECS;
use crate::TrackedObject;

/// Default minimum history length for an object to count as present.
pub const DEFAULT_MIN_HISTORY_LEN: usize = 2;

/// Thresholds for presence and best-object tracking.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PresenceSettings {
    /// Objects with a shorter history are ignored for presence.
    pub min_history_len: usize,
    /// Age in seconds after which a best record yields to any candidate.
    pub best_stale_secs: f64,
}

impl Default for PresenceSettings {
    fn default() -> Self {
        Self {
            min_history_len: DEFAULT_MIN_HISTORY_LEN,
            best_stale_secs: DEFAULT_BEST_STALE_SECS,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PresenceState {
    #[default]
    Off,
    On,
}

impl PresenceState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PresenceState::Off => "OFF",
            PresenceState::On => "ON",
        }
    }
}

impl fmt::Display for PresenceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A committed state change for one label.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PresenceChange {
    pub label: String,
    pub state: PresenceState,
}

/// Count, per label, the objects whose history reaches `min_history_len`.
///
/// Labels with no qualifying object are absent from the result.
pub fn count_confirmed(
    objects: &[TrackedObject],
    min_history_len: usize,
) -> BTreeMap<String, usize> {
    let mut counts = BTreeMap::new();
    for obj in objects {
        if obj.history_len >= min_history_len {
            *counts.entry(obj.label.clone()).or_insert(0) += 1;
        }
    }
    counts
}

/// Per-camera ON/OFF state machine keyed by label.
#[derive(Default)]
pub struct PresenceDebouncer {
    states: BTreeMap<String, PresenceState>,
}

impl PresenceDebouncer {
    pub fn new() -> Self {
        Self::default()
    }

    /// State of a label; labels never seen are OFF.
    pub fn state(&self, label: &str) -> PresenceState {
        self.states.get(label).copied().unwrap_or_default()
    }

    /// Labels currently ON, sorted.
    pub fn active_labels(&self) -> Vec<String> {
        self.states
            .iter()
            .filter(|(_, state)| **state == PresenceState::On)
            .map(|(label, _)| label.clone())
            .collect()
    }

    /// Apply one batch worth of counts and return the resulting changes.
    ///
    /// OFF->ON changes come first, then ON->OFF, each in label order.
    pub fn update(&mut self, counts: &BTreeMap<String, usize>) -> Vec<PresenceChange> {
        let mut changes = Vec::new();

        for (label, count) in counts {
            if *count == 0 || self.state(label) == PresenceState::On {
                continue;
            }
            self.states.insert(label.clone(), PresenceState::On);
            changes.push(PresenceChange {
                label: label.clone(),
                state: PresenceState::On,
            });
        }

        for (label, state) in self.states.iter_mut() {
            let detected = counts.get(label).is_some_and(|count| *count > 0);
            if *state == PresenceState::On && !detected {
                *state = PresenceState::Off;
                changes.push(PresenceChange {
                    label: label.clone(),
                    state: PresenceState::Off,
                });
            }
        }

        changes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counts(entries: &[(&str, usize)]) -> BTreeMap<String, usize> {
        entries
            .iter()
            .map(|(label, count)| (label.to_string(), *count))
            .collect()
    }

    fn obj(label: &str, history_len: usize) -> TrackedObject {
        TrackedObject {
            id: format!("{}-{}", label, history_len),
            label: label.to_string(),
            score: 0.5,
            bbox: [0, 0, 1, 1],
            region: [0, 0, 1, 1],
            area: 1.0,
            frame_time: 1.0,
            history_len,
        }
    }

    #[test]
    fn unseen_labels_are_off() {
        let debouncer = PresenceDebouncer::new();
        assert_eq!(debouncer.state("person"), PresenceState::Off);
    }

    #[test]
    fn single_frame_objects_do_not_count() {
        let objects = vec![obj("person", 1), obj("car", 2), obj("car", 3)];
        let counted = count_confirmed(&objects, DEFAULT_MIN_HISTORY_LEN);
        assert_eq!(counted.get("person"), None);
        assert_eq!(counted.get("car"), Some(&2));
    }

    #[test]
    fn turns_on_once_across_consecutive_batches() {
        let mut debouncer = PresenceDebouncer::new();
        let first = debouncer.update(&counts(&[("person", 1)]));
        let second = debouncer.update(&counts(&[("person", 1)]));
        assert_eq!(
            first,
            vec![PresenceChange {
                label: "person".to_string(),
                state: PresenceState::On
            }]
        );
        assert!(second.is_empty());
        assert_eq!(debouncer.state("person"), PresenceState::On);
    }

    #[test]
    fn turns_off_once_when_absent() {
        let mut debouncer = PresenceDebouncer::new();
        debouncer.update(&counts(&[("person", 1)]));
        let off = debouncer.update(&counts(&[]));
        let again = debouncer.update(&counts(&[]));
        assert_eq!(off.len(), 1);
        assert_eq!(off[0].state, PresenceState::Off);
        assert!(again.is_empty());
    }

    #[test]
    fn zero_count_is_treated_as_absent() {
        let mut debouncer = PresenceDebouncer::new();
        debouncer.update(&counts(&[("dog", 1)]));
        let changes = debouncer.update(&counts(&[("dog", 0)]));
        assert_eq!(changes[0].state, PresenceState::Off);
    }

    #[test]
    fn mixed_batch_reports_on_then_off() {
        let mut debouncer = PresenceDebouncer::new();
        debouncer.update(&counts(&[("car", 1)]));
        let changes = debouncer.update(&counts(&[("person", 2)]));
        assert_eq!(
            changes,
            vec![
                PresenceChange {
                    label: "person".to_string(),
                    state: PresenceState::On
                },
                PresenceChange {
                    label: "car".to_string(),
                    state: PresenceState::Off
                },
            ]
        );
        assert_eq!(debouncer.active_labels(), vec!["person".to_string()]);
    }

    #[test]
    fn state_serializes_uppercase() {
        assert_eq!(
            serde_json::to_string(&PresenceState::On).unwrap(),
            r#""ON""#
        );
        assert_eq!(PresenceState::Off.to_string(), "OFF");
    }
}
