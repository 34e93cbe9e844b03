//! Camera registry and batch pipeline.
//!
//! `AggregationEngine` maps camera names to their `CameraAggregator`. The map
//! itself is only locked to look up or create an aggregator; all per-batch
//! work happens under the camera's own lock, so unrelated cameras never wait
//! on each other.
//!
//! `Pipeline` is the message-passing boundary between batch producers and the
//! engine: batches are routed to one of N worker threads by camera, which keeps
//! every camera's batches strictly ordered while different cameras proceed in
//! parallel.

use anyhow::{anyhow, Result};
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, RwLock};
use std::thread::JoinHandle;

use crate::batch::Batch;
use crate::best::BestObjectRecord;
use crate::camera::{CameraAggregator, TransitionEvent};
use crate::frame::{Frame, FrameStore, DEFAULT_FRAME_HEIGHT, DEFAULT_FRAME_WIDTH};
use crate::presence::{PresenceSettings, PresenceState};
use crate::render::Renderer;

pub struct AggregationEngine {
    cameras: RwLock<HashMap<String, Arc<CameraAggregator>>>,
    store: Arc<dyn FrameStore>,
    renderer: Arc<dyn Renderer>,
    settings: PresenceSettings,
    placeholder: Arc<Frame>,
}

impl AggregationEngine {
    pub fn new(
        store: Arc<dyn FrameStore>,
        renderer: Arc<dyn Renderer>,
        settings: PresenceSettings,
    ) -> Self {
        Self::with_placeholder(
            store,
            renderer,
            settings,
            Frame::blank(DEFAULT_FRAME_WIDTH, DEFAULT_FRAME_HEIGHT),
        )
    }

    /// Like `new`, with a custom frame returned for cameras without frames.
    pub fn with_placeholder(
        store: Arc<dyn FrameStore>,
        renderer: Arc<dyn Renderer>,
        settings: PresenceSettings,
        placeholder: Frame,
    ) -> Self {
        Self {
            cameras: RwLock::new(HashMap::new()),
            store,
            renderer,
            settings,
            placeholder: Arc::new(placeholder),
        }
    }

    pub fn settings(&self) -> PresenceSettings {
        self.settings
    }

    /// Ingest a batch using the wall clock as "now".
    pub fn ingest(&self, batch: Batch) -> Result<Vec<TransitionEvent>> {
        let now = crate::now_s()?;
        self.ingest_at(batch, now)
    }

    /// Ingest a batch with an explicit "now" (epoch seconds).
    ///
    /// Malformed batches are rejected before any camera state is touched.
    pub fn ingest_at(&self, batch: Batch, now: f64) -> Result<Vec<TransitionEvent>> {
        batch.validate()?;
        let aggregator = self.aggregator(&batch.camera)?;
        let events = aggregator.ingest(
            self.store.as_ref(),
            self.renderer.as_ref(),
            batch.frame_time,
            batch.objects,
            now,
        )?;
        for event in &events {
            log::info!(
                "camera={} label={} -> {} (frame_time={:.3})",
                event.camera,
                event.label,
                event.state,
                event.frame_time
            );
        }
        Ok(events)
    }

    /// Best frame for (camera, label), if that label was ever a candidate.
    pub fn best_frame(&self, camera: &str, label: &str) -> Option<Arc<Frame>> {
        self.camera(camera)?.best_frame(label)
    }

    pub fn best_record(&self, camera: &str, label: &str) -> Option<Arc<BestObjectRecord>> {
        self.camera(camera)?.best_record(label)
    }

    /// Current frame of a camera. Unknown cameras get the placeholder frame.
    pub fn current_frame(&self, camera: &str) -> Arc<Frame> {
        match self.camera(camera) {
            Some(aggregator) => aggregator.current_frame(),
            None => self.placeholder.clone(),
        }
    }

    pub fn presence(&self, camera: &str, label: &str) -> PresenceState {
        self.camera(camera)
            .map(|aggregator| aggregator.presence(label))
            .unwrap_or_default()
    }

    pub fn camera(&self, camera: &str) -> Option<Arc<CameraAggregator>> {
        self.cameras
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(camera)
            .cloned()
    }

    /// Known camera names, sorted.
    pub fn cameras(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .cameras
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    /// Release every camera's held frame back to the store.
    pub fn release_all(&self) {
        for name in self.cameras() {
            if let Some(aggregator) = self.camera(&name) {
                if let Err(err) = aggregator.release_frame(self.store.as_ref()) {
                    log::warn!("failed to release frame for camera {}: {:#}", name, err);
                }
            }
        }
    }

    fn aggregator(&self, camera: &str) -> Result<Arc<CameraAggregator>> {
        if let Some(existing) = self.camera(camera) {
            return Ok(existing);
        }
        let mut cameras = self
            .cameras
            .write()
            .map_err(|_| anyhow!("camera registry lock poisoned"))?;
        let aggregator = cameras.entry(camera.to_string()).or_insert_with(|| {
            log::info!("tracking new camera {}", camera);
            Arc::new(CameraAggregator::new(
                camera,
                self.settings,
                self.placeholder.clone(),
            ))
        });
        Ok(aggregator.clone())
    }
}

// ----------------------------------------------------------------------------
// Pipeline: producers -> per-camera shards -> engine -> sink
// ----------------------------------------------------------------------------

/// Receives the transitions of each processed batch, in commit order.
pub trait TransitionSink: Send + Sync {
    fn deliver(&self, events: Vec<TransitionEvent>);
}

/// Cloneable producer handle. Routes each batch to its camera's shard.
#[derive(Clone)]
pub struct BatchSender {
    shards: Vec<Sender<Batch>>,
}

impl BatchSender {
    pub fn send(&self, batch: Batch) -> Result<()> {
        let shard = shard_for(&batch.camera, self.shards.len());
        self.shards[shard]
            .send(batch)
            .map_err(|_| anyhow!("pipeline worker {} has stopped", shard))
    }
}

pub struct PipelineHandle {
    workers: Vec<JoinHandle<()>>,
}

impl PipelineHandle {
    /// Wait for all workers. They exit once every `BatchSender` is dropped and
    /// their queues are drained.
    pub fn join(self) -> Result<()> {
        for worker in self.workers {
            worker
                .join()
                .map_err(|_| anyhow!("pipeline worker panicked"))?;
        }
        Ok(())
    }
}

pub struct Pipeline;

impl Pipeline {
    pub fn spawn(
        engine: Arc<AggregationEngine>,
        sink: Arc<dyn TransitionSink>,
        workers: usize,
    ) -> Result<(BatchSender, PipelineHandle)> {
        if workers == 0 {
            return Err(anyhow!("pipeline needs at least one worker"));
        }
        let mut shards = Vec::with_capacity(workers);
        let mut handles = Vec::with_capacity(workers);
        for index in 0..workers {
            let (tx, rx) = mpsc::channel();
            let engine = engine.clone();
            let sink = sink.clone();
            let handle = std::thread::Builder::new()
                .name(format!("presence-worker-{}", index))
                .spawn(move || run_worker(index, rx, engine, sink))?;
            shards.push(tx);
            handles.push(handle);
        }
        log::info!("pipeline started with {} worker(s)", workers);
        Ok((
            BatchSender { shards },
            PipelineHandle { workers: handles },
        ))
    }
}

fn run_worker(
    index: usize,
    rx: Receiver<Batch>,
    engine: Arc<AggregationEngine>,
    sink: Arc<dyn TransitionSink>,
) {
    for batch in rx {
        let camera = batch.camera.clone();
        match engine.ingest(batch) {
            Ok(events) if events.is_empty() => {}
            Ok(events) => sink.deliver(events),
            Err(err) => log::warn!("batch rejected camera={}: {:#}", camera, err),
        }
    }
    log::debug!("pipeline worker {} stopped", index);
}

fn shard_for(camera: &str, shards: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    camera.hash(&mut hasher);
    (hasher.finish() % shards as u64) as usize
}
