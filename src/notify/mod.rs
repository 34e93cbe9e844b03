//! Delivery of presence transitions.
//!
//! The aggregator commits state before anything here runs. Delivery is best
//! effort: every collaborator failure is logged and the remaining steps still
//! run, and nothing is rolled back.
//!
//! For each `TransitionEvent` the dispatcher:
//! 1. Encodes the paired best frame as JPEG
//! 2. Publishes the new state (and snapshot) through the `Notifier`
//! 3. Persists the snapshot through the `SnapshotStore`
//! 4. Signals the camera's event endpoint through the `EventBoundaryNotifier`

mod boundary;
mod mqtt;
mod snapshot;

use anyhow::{Context, Result};
use image::codecs::jpeg::JpegEncoder;
use image::{ExtendedColorType, ImageEncoder};
use std::sync::Arc;

use crate::camera::TransitionEvent;
use crate::engine::TransitionSink;
use crate::frame::Frame;
use crate::presence::PresenceState;

pub use boundary::{boundary_urls, EventEndpoints, HttpEventBoundaryNotifier};
pub use mqtt::MqttNotifier;
pub use snapshot::FilesystemSnapshotStore;

/// JPEG quality used for snapshots.
pub const SNAPSHOT_JPEG_QUALITY: u8 = 90;

/// Publishes state changes to subscribers.
pub trait Notifier: Send + Sync {
    /// `snapshot` is `None` when the label has no best record yet.
    fn publish(
        &self,
        camera: &str,
        label: &str,
        state: PresenceState,
        snapshot: Option<&[u8]>,
    ) -> Result<()>;
}

/// Durable storage for snapshot images.
pub trait SnapshotStore: Send + Sync {
    fn store(&self, camera: &str, label: &str, snapshot: &[u8], frame_time: f64) -> Result<()>;
}

/// Starts/stops recording on an external system when presence changes.
pub trait EventBoundaryNotifier: Send + Sync {
    fn notify(&self, camera: &str, label: &str, state: PresenceState) -> Result<()>;
}

/// Encode an RGB frame as JPEG.
pub fn encode_jpeg(frame: &Frame) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    JpegEncoder::new_with_quality(&mut out, SNAPSHOT_JPEG_QUALITY)
        .write_image(
            frame.as_rgb(),
            frame.width(),
            frame.height(),
            ExtendedColorType::Rgb8,
        )
        .context("encode jpeg snapshot")?;
    Ok(out)
}

pub struct TransitionDispatcher {
    notifier: Arc<dyn Notifier>,
    snapshots: Option<Arc<dyn SnapshotStore>>,
    boundary: Option<Arc<dyn EventBoundaryNotifier>>,
}

impl TransitionDispatcher {
    pub fn new(notifier: Arc<dyn Notifier>) -> Self {
        Self {
            notifier,
            snapshots: None,
            boundary: None,
        }
    }

    pub fn with_snapshot_store(mut self, store: Arc<dyn SnapshotStore>) -> Self {
        self.snapshots = Some(store);
        self
    }

    pub fn with_event_boundary(mut self, boundary: Arc<dyn EventBoundaryNotifier>) -> Self {
        self.boundary = Some(boundary);
        self
    }

    /// Deliver one transition to every configured collaborator.
    pub fn dispatch(&self, event: &TransitionEvent) {
        let snapshot = match &event.best {
            Some(best) => match encode_jpeg(&best.frame) {
                Ok(jpeg) => Some(jpeg),
                Err(err) => {
                    log::warn!(
                        "snapshot encode failed camera={} label={}: {:#}",
                        event.camera,
                        event.label,
                        err
                    );
                    None
                }
            },
            None => None,
        };

        if let Some(best) = &event.best {
            log::info!(
                "{} {} on camera {} (best score {}%)",
                event.label,
                event.state,
                event.camera,
                (best.object.score * 100.0) as u32
            );
        }

        if let Err(err) = self.notifier.publish(
            &event.camera,
            &event.label,
            event.state,
            snapshot.as_deref(),
        ) {
            log::warn!(
                "publish failed camera={} label={}: {:#}",
                event.camera,
                event.label,
                err
            );
        }

        if let Some(store) = &self.snapshots {
            match &snapshot {
                Some(jpeg) => {
                    if let Err(err) =
                        store.store(&event.camera, &event.label, jpeg, event.frame_time)
                    {
                        log::warn!(
                            "snapshot store failed camera={} label={}: {:#}",
                            event.camera,
                            event.label,
                            err
                        );
                    }
                }
                None => log::debug!(
                    "no snapshot to store camera={} label={}",
                    event.camera,
                    event.label
                ),
            }
        }

        if let Some(boundary) = &self.boundary {
            if let Err(err) = boundary.notify(&event.camera, &event.label, event.state) {
                log::warn!(
                    "event endpoint failed camera={} label={}: {:#}",
                    event.camera,
                    event.label,
                    err
                );
            }
        }
    }
}

impl TransitionSink for TransitionDispatcher {
    fn deliver(&self, events: Vec<TransitionEvent>) {
        for event in &events {
            self.dispatch(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::best::BestObjectRecord;
    use crate::TrackedObject;
    use anyhow::anyhow;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        calls: Mutex<Vec<String>>,
        fail: bool,
    }

    impl Recorder {
        fn failing() -> Self {
            Self {
                calls: Mutex::new(Vec::new()),
                fail: true,
            }
        }

        fn record(&self, entry: String) -> Result<()> {
            self.calls.lock().unwrap().push(entry);
            if self.fail {
                return Err(anyhow!("collaborator down"));
            }
            Ok(())
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl Notifier for Recorder {
        fn publish(
            &self,
            camera: &str,
            label: &str,
            state: PresenceState,
            snapshot: Option<&[u8]>,
        ) -> Result<()> {
            self.record(format!(
                "publish {}/{} {} snapshot={}",
                camera,
                label,
                state,
                snapshot.is_some()
            ))
        }
    }

    impl SnapshotStore for Recorder {
        fn store(
            &self,
            camera: &str,
            label: &str,
            snapshot: &[u8],
            _frame_time: f64,
        ) -> Result<()> {
            assert_eq!(&snapshot[..2], &[0xFF, 0xD8]);
            self.record(format!("store {}/{}", camera, label))
        }
    }

    impl EventBoundaryNotifier for Recorder {
        fn notify(&self, camera: &str, label: &str, state: PresenceState) -> Result<()> {
            self.record(format!("boundary {}/{} {}", camera, label, state))
        }
    }

    fn event(with_best: bool) -> TransitionEvent {
        let object = TrackedObject {
            id: "1".to_string(),
            label: "person".to_string(),
            score: 0.9,
            bbox: [0, 0, 4, 4],
            region: [0, 0, 8, 8],
            area: 16.0,
            frame_time: 5.0,
            history_len: 2,
        };
        let best = with_best.then(|| {
            Arc::new(BestObjectRecord {
                label: "person".to_string(),
                object,
                frame: Arc::new(Frame::blank(8, 8)),
                last_update: 5.0,
            })
        });
        TransitionEvent {
            camera: "front".to_string(),
            label: "person".to_string(),
            state: PresenceState::On,
            frame_time: 5.0,
            best,
        }
    }

    #[test]
    fn encode_jpeg_produces_jpeg() {
        let jpeg = encode_jpeg(&Frame::blank(16, 8)).unwrap();
        assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);
    }

    #[test]
    fn dispatch_calls_every_collaborator_once() {
        let notifier = Arc::new(Recorder::default());
        let store = Arc::new(Recorder::default());
        let boundary = Arc::new(Recorder::default());
        let dispatcher = TransitionDispatcher::new(notifier.clone())
            .with_snapshot_store(store.clone())
            .with_event_boundary(boundary.clone());

        dispatcher.deliver(vec![event(true)]);

        assert_eq!(
            notifier.calls(),
            vec!["publish front/person ON snapshot=true"]
        );
        assert_eq!(store.calls(), vec!["store front/person"]);
        assert_eq!(boundary.calls(), vec!["boundary front/person ON"]);
    }

    #[test]
    fn missing_best_record_skips_snapshot_only() {
        let notifier = Arc::new(Recorder::default());
        let store = Arc::new(Recorder::default());
        let boundary = Arc::new(Recorder::default());
        let dispatcher = TransitionDispatcher::new(notifier.clone())
            .with_snapshot_store(store.clone())
            .with_event_boundary(boundary.clone());

        dispatcher.dispatch(&event(false));

        assert_eq!(
            notifier.calls(),
            vec!["publish front/person ON snapshot=false"]
        );
        assert!(store.calls().is_empty());
        assert_eq!(boundary.calls().len(), 1);
    }

    #[test]
    fn failures_do_not_stop_later_steps() {
        let notifier = Arc::new(Recorder::failing());
        let store = Arc::new(Recorder::failing());
        let boundary = Arc::new(Recorder::failing());
        let dispatcher = TransitionDispatcher::new(notifier.clone())
            .with_snapshot_store(store.clone())
            .with_event_boundary(boundary.clone());

        dispatcher.deliver(vec![event(true), event(true)]);

        assert_eq!(notifier.calls().len(), 2);
        assert_eq!(store.calls().len(), 2);
        assert_eq!(boundary.calls().len(), 2);
    }
}
