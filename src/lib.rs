//! Object presence aggregation.
//!
//! This crate turns per-frame batches of tracked objects into two kinds of
//! per-camera state:
//!
//! 1. **Best snapshots**: for every object label, the highest scoring recent
//!    detection together with an annotated copy of the frame it was seen on.
//! 2. **Debounced presence**: an ON/OFF indicator per label that flips exactly
//!    once per real change and produces one transition event per flip.
//!
//! # Module Structure
//!
//! - `frame`: Frame buffers, frame keys, external frame stores, `SharedFrameHandle`
//! - `best`: Best-object records and the replacement policy
//! - `presence`: Presence debouncing
//! - `camera`: Per-camera aggregation (`CameraAggregator`)
//! - `engine`: Camera registry (`AggregationEngine`) and the batch `Pipeline`
//! - `batch`: Wire format and validation for incoming batches
//! - `render`: Frame annotation
//! - `notify`: Delivery of transition events (MQTT, snapshots, event endpoints)
//! - `api`: Loopback HTTP snapshot server
//! - `config`: Processor configuration
//! - `transport`: MQTT connection helpers

use anyhow::Result;
use serde::Serialize;
use std::time::{SystemTime, UNIX_EPOCH};

pub mod api;
pub mod batch;
pub mod best;
pub mod camera;
pub mod config;
pub mod engine;
pub mod frame;
pub mod notify;
pub mod presence;
pub mod render;
pub mod transport;

pub use api::{SnapshotApiConfig, SnapshotApiHandle, SnapshotServer};
pub use batch::{parse_batch, Batch};
pub use best::{BestObjectRecord, BestObjectTracker};
pub use camera::{CameraAggregator, TransitionEvent};
pub use config::ProcessorConfig;
pub use engine::{AggregationEngine, BatchSender, Pipeline, PipelineHandle, TransitionSink};
pub use frame::{
    DirectoryFrameStore, Frame, FrameKey, FrameStore, InMemoryFrameStore, SharedFrameHandle,
};
pub use notify::{
    EventBoundaryNotifier, EventEndpoints, FilesystemSnapshotStore, HttpEventBoundaryNotifier,
    MqttNotifier, Notifier, SnapshotStore, TransitionDispatcher,
};
pub use presence::{PresenceChange, PresenceDebouncer, PresenceSettings, PresenceState};
pub use render::{load_font, BoxRenderer, RenderOptions, Renderer};

// -------------------- Tracked Objects --------------------

/// One tracked object as reported by the upstream tracker for a single frame.
///
/// `frame_time` is the last time the tracker actually observed the object. Objects
/// carried over from earlier frames keep their old `frame_time`.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct TrackedObject {
    /// Tracker-assigned identifier (stable while the object is tracked).
    pub id: String,
    pub label: String,
    /// Detection confidence (0..=1).
    pub score: f64,
    /// Bounding box as (x_min, y_min, x_max, y_max) in pixels.
    pub bbox: [i32; 4],
    /// Detection region the object was found in, same layout as `bbox`.
    pub region: [i32; 4],
    pub area: f64,
    /// Epoch seconds of the last observation.
    pub frame_time: f64,
    /// Number of prior observations in the tracker history.
    pub history_len: usize,
}

impl TrackedObject {
    /// True when the object was observed on the frame taken at `frame_time`.
    pub fn seen_at(&self, frame_time: f64) -> bool {
        self.frame_time == frame_time
    }
}

/// Wall-clock time in epoch seconds.
pub fn now_s() -> Result<f64> {
    Ok(SystemTime::now().duration_since(UNIX_EPOCH)?.as_secs_f64())
}
