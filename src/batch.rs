//! Tracked-object batch wire format.
//!
//! The tracker publishes one JSON document per processed frame:
//!
//! ```json
//! {
//!   "camera": "front",
//!   "frame_time": 1600000000.25,
//!   "objects": {
//!     "1600000000.0-abc": {
//!       "label": "person", "score": 0.82,
//!       "box": [10, 20, 110, 220], "region": [0, 0, 300, 300],
//!       "area": 20000, "frame_time": 1600000000.25,
//!       "history": [{...}, {...}]
//!     }
//!   }
//! }
//! ```
//!
//! Only the length of `history` is used. Missing fields or out-of-range values
//! reject the whole batch; nothing is applied to the camera in that case.

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;

use crate::TrackedObject;

/// One batch of tracked objects for a single camera frame.
#[derive(Clone, Debug, PartialEq)]
pub struct Batch {
    pub camera: String,
    /// Epoch seconds of the frame this batch describes.
    pub frame_time: f64,
    pub objects: Vec<TrackedObject>,
}

impl Batch {
    /// Check the invariants the aggregator relies on.
    pub fn validate(&self) -> Result<()> {
        if self.camera.trim().is_empty() {
            return Err(anyhow!("malformed batch: empty camera name"));
        }
        if !self.frame_time.is_finite() {
            return Err(anyhow!("malformed batch: frame_time is not finite"));
        }
        for obj in &self.objects {
            if obj.label.trim().is_empty() {
                return Err(anyhow!("malformed batch: object {} has no label", obj.id));
            }
            if !obj.score.is_finite() || !(0.0..=1.0).contains(&obj.score) {
                return Err(anyhow!(
                    "malformed batch: object {} score {} outside 0..=1",
                    obj.id,
                    obj.score
                ));
            }
            if !obj.frame_time.is_finite() {
                return Err(anyhow!(
                    "malformed batch: object {} frame_time is not finite",
                    obj.id
                ));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct WireBatch {
    camera: String,
    frame_time: f64,
    #[serde(default)]
    objects: BTreeMap<String, WireObject>,
}

#[derive(Debug, Deserialize)]
struct WireObject {
    label: String,
    score: f64,
    #[serde(rename = "box")]
    bbox: [i32; 4],
    region: [i32; 4],
    area: f64,
    frame_time: f64,
    #[serde(default)]
    history: Vec<serde_json::Value>,
}

/// Parse and validate a JSON batch.
pub fn parse_batch(payload: &[u8]) -> Result<Batch> {
    let wire: WireBatch =
        serde_json::from_slice(payload).context("malformed batch: invalid JSON")?;
    let objects = wire
        .objects
        .into_iter()
        .map(|(id, obj)| TrackedObject {
            id,
            label: obj.label,
            score: obj.score,
            bbox: obj.bbox,
            region: obj.region,
            area: obj.area,
            frame_time: obj.frame_time,
            history_len: obj.history.len(),
        })
        .collect();
    let batch = Batch {
        camera: wire.camera,
        frame_time: wire.frame_time,
        objects,
    };
    batch.validate()?;
    Ok(batch)
}

#[cfg(test)]
mod tests {
    use super::*;

    const BATCH: &str = r#"{
        "camera": "front",
        "frame_time": 100.0,
        "objects": {
            "b-2": {
                "label": "car",
                "score": 0.55,
                "box": [5, 5, 50, 50],
                "region": [0, 0, 100, 100],
                "area": 2025,
                "frame_time": 99.0,
                "history": [{"frame_time": 98.0}, {"frame_time": 99.0}]
            },
            "a-1": {
                "label": "person",
                "score": 0.82,
                "box": [10, 20, 110, 220],
                "region": [0, 0, 300, 300],
                "area": 20000,
                "frame_time": 100.0,
                "history": [{}, {}, {}]
            }
        }
    }"#;

    #[test]
    fn parses_objects_in_id_order() {
        let batch = parse_batch(BATCH.as_bytes()).unwrap();
        assert_eq!(batch.camera, "front");
        assert_eq!(batch.objects.len(), 2);
        assert_eq!(batch.objects[0].id, "a-1");
        assert_eq!(batch.objects[0].bbox, [10, 20, 110, 220]);
        assert_eq!(batch.objects[0].history_len, 3);
        assert_eq!(batch.objects[1].history_len, 2);
    }

    #[test]
    fn empty_objects_are_allowed() {
        let batch = parse_batch(br#"{"camera": "front", "frame_time": 101.0}"#).unwrap();
        assert!(batch.objects.is_empty());
    }

    #[test]
    fn missing_field_is_rejected() {
        let payload = r#"{"camera": "front", "frame_time": 1.0,
            "objects": {"x": {"label": "person", "score": 0.5}}}"#;
        let err = parse_batch(payload.as_bytes()).unwrap_err();
        assert!(err.to_string().contains("malformed batch"));
    }

    #[test]
    fn out_of_range_score_is_rejected() {
        let payload = r#"{"camera": "front", "frame_time": 1.0,
            "objects": {"x": {"label": "person", "score": 1.5, "box": [0,0,1,1],
            "region": [0,0,1,1], "area": 1, "frame_time": 1.0}}}"#;
        assert!(parse_batch(payload.as_bytes()).is_err());
    }

    #[test]
    fn empty_camera_is_rejected() {
        assert!(parse_batch(br#"{"camera": " ", "frame_time": 1.0}"#).is_err());
    }
}
