//! Per-camera aggregation.
//!
//! A `CameraAggregator` owns everything the processor knows about one camera:
//! the latest tracked set, the current frame handle, the best-object table and
//! the presence table. Ingestion is the only writer; readers take a shared lock
//! and always see either the state before a batch or the state after it.

use anyhow::{anyhow, Result};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::best::{BestObjectRecord, BestObjectTracker};
use crate::frame::{acquire, Frame, FrameStore, SharedFrameHandle};
use crate::presence::{count_confirmed, PresenceDebouncer, PresenceSettings, PresenceState};
use crate::render::Renderer;
use crate::TrackedObject;

/// One committed presence transition, paired with the label's best record as
/// it stood when the transition was committed.
#[derive(Clone, Debug)]
pub struct TransitionEvent {
    pub camera: String,
    pub label: String,
    pub state: PresenceState,
    /// Frame time of the batch that caused the transition.
    pub frame_time: f64,
    pub best: Option<Arc<BestObjectRecord>>,
}

struct CameraState {
    tracked: Arc<Vec<TrackedObject>>,
    frame: SharedFrameHandle,
    best: BestObjectTracker,
    presence: PresenceDebouncer,
}

pub struct CameraAggregator {
    camera: String,
    settings: PresenceSettings,
    placeholder: Arc<Frame>,
    state: RwLock<CameraState>,
}

impl CameraAggregator {
    pub fn new(
        camera: impl Into<String>,
        settings: PresenceSettings,
        placeholder: Arc<Frame>,
    ) -> Self {
        let camera = camera.into();
        Self {
            state: RwLock::new(CameraState {
                tracked: Arc::new(Vec::new()),
                frame: SharedFrameHandle::new(camera.clone()),
                best: BestObjectTracker::new(settings.best_stale_secs),
                presence: PresenceDebouncer::new(),
            }),
            camera,
            settings,
            placeholder,
        }
    }

    pub fn camera(&self) -> &str {
        &self.camera
    }

    /// Process one batch for this camera.
    ///
    /// 1. Poll the frame store; annotate the frame if it arrived.
    /// 2. Under the camera lock: store the tracked set, install the frame
    ///    (releasing the previous one), update best records from objects seen
    ///    on this frame, and run presence debouncing.
    /// 3. Return the committed transitions.
    ///
    /// When the frame is unavailable the previous frame stays current and best
    /// records are copied from it.
    pub fn ingest(
        &self,
        store: &dyn FrameStore,
        renderer: &dyn Renderer,
        frame_time: f64,
        objects: Vec<TrackedObject>,
        now: f64,
    ) -> Result<Vec<TransitionEvent>> {
        let acquired = acquire(store, &self.camera, frame_time).map(|mut acquired| {
            renderer.annotate(&self.camera, &mut acquired.frame, &objects, frame_time);
            acquired
        });

        let mut state = self.write_state()?;
        let state = &mut *state;

        state.tracked = Arc::new(objects);
        let current = match acquired {
            Some(acquired) => state.frame.install(acquired, store),
            None => state
                .frame
                .frame()
                .unwrap_or_else(|| self.placeholder.clone()),
        };

        for obj in state.tracked.iter().filter(|obj| obj.seen_at(frame_time)) {
            state.best.consider(obj, &current, now);
        }

        let counts = count_confirmed(&state.tracked, self.settings.min_history_len);
        let changes = state.presence.update(&counts);

        let events = changes
            .into_iter()
            .map(|change| {
                let best = state.best.get(&change.label);
                if best.is_none() {
                    log::warn!(
                        "camera={} label={} turned {} without a best snapshot",
                        self.camera,
                        change.label,
                        change.state
                    );
                }
                TransitionEvent {
                    camera: self.camera.clone(),
                    label: change.label,
                    state: change.state,
                    frame_time,
                    best,
                }
            })
            .collect();
        Ok(events)
    }

    /// Current annotated frame, or the placeholder before the first frame.
    pub fn current_frame(&self) -> Arc<Frame> {
        self.read_state()
            .frame
            .frame()
            .unwrap_or_else(|| self.placeholder.clone())
    }

    pub fn best_frame(&self, label: &str) -> Option<Arc<Frame>> {
        self.read_state()
            .best
            .get(label)
            .map(|record| record.frame.clone())
    }

    pub fn best_record(&self, label: &str) -> Option<Arc<BestObjectRecord>> {
        self.read_state().best.get(label)
    }

    /// Current frame and every best record, read under one lock.
    pub fn snapshot(&self) -> (Arc<Frame>, Vec<Arc<BestObjectRecord>>) {
        let state = self.read_state();
        let frame = state
            .frame
            .frame()
            .unwrap_or_else(|| self.placeholder.clone());
        let records = state
            .best
            .labels()
            .iter()
            .filter_map(|label| state.best.get(label))
            .collect();
        (frame, records)
    }

    pub fn tracked_objects(&self) -> Arc<Vec<TrackedObject>> {
        self.read_state().tracked.clone()
    }

    pub fn presence(&self, label: &str) -> PresenceState {
        self.read_state().presence.state(label)
    }

    pub fn active_labels(&self) -> Vec<String> {
        self.read_state().presence.active_labels()
    }

    /// Release the held frame back to the store.
    pub fn release_frame(&self, store: &dyn FrameStore) -> Result<()> {
        self.write_state()?.frame.release(store);
        Ok(())
    }

    fn write_state(&self) -> Result<RwLockWriteGuard<'_, CameraState>> {
        self.state
            .write()
            .map_err(|_| anyhow!("camera {} state lock poisoned", self.camera))
    }

    // Readers keep working on the last committed state even after a writer panicked.
    fn read_state(&self) -> RwLockReadGuard<'_, CameraState> {
        self.state
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
