use anyhow::Result;
use object_presence::{
    AggregationEngine, BoxRenderer, Frame, FrameKey, InMemoryFrameStore, Notifier,
    PresenceSettings, PresenceState, SnapshotStore, TrackedObject, TransitionDispatcher,
    TransitionSink,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

const CAMERA: &str = "cam1";

fn engine(store: Arc<InMemoryFrameStore>) -> AggregationEngine {
    AggregationEngine::with_placeholder(
        store,
        Arc::new(BoxRenderer::new()),
        PresenceSettings::default(),
        Frame::blank(8, 8),
    )
}

fn person(score: f64, frame_time: f64) -> TrackedObject {
    TrackedObject {
        id: "100.0-person".to_string(),
        label: "person".to_string(),
        score,
        bbox: [4, 4, 6, 6],
        region: [3, 3, 7, 7],
        area: 4.0,
        frame_time,
        history_len: 2,
    }
}

// Frame whose top-left pixel identifies the batch it belongs to.
fn marked_frame(marker: u8) -> Frame {
    let mut frame = Frame::blank(8, 8);
    frame.put_pixel(0, 0, [marker, marker, marker]);
    frame
}

fn batch(frame_time: f64, objects: Vec<TrackedObject>) -> object_presence::Batch {
    object_presence::Batch {
        camera: CAMERA.to_string(),
        frame_time,
        objects,
    }
}

#[test]
fn presence_cycles_on_off_on() {
    let store = Arc::new(InMemoryFrameStore::new());
    for t in [100.0, 101.0, 200.0] {
        store.insert(FrameKey::derive(CAMERA, t), Frame::blank(8, 8));
    }
    let engine = engine(store);

    let events = engine
        .ingest_at(batch(100.0, vec![person(0.4, 100.0)]), 100.0)
        .unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].label, "person");
    assert_eq!(events[0].state, PresenceState::On);
    let best = events[0].best.as_ref().expect("best record on ON");
    assert_eq!(best.object.score, 0.4);

    let events = engine.ingest_at(batch(101.0, vec![]), 101.0).unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].state, PresenceState::Off);
    assert_eq!(engine.presence(CAMERA, "person"), PresenceState::Off);

    let events = engine
        .ingest_at(batch(200.0, vec![person(0.4, 200.0)]), 200.0)
        .unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].state, PresenceState::On);
    // Stale record yields to the new sighting even at an equal score.
    let best = engine.best_record(CAMERA, "person").unwrap();
    assert_eq!(best.last_update, 200.0);
}

#[test]
fn repeated_detection_turns_on_once() {
    let engine = engine(Arc::new(InMemoryFrameStore::new()));
    let first = engine
        .ingest_at(batch(1.0, vec![person(0.5, 1.0)]), 1.0)
        .unwrap();
    let second = engine
        .ingest_at(batch(2.0, vec![person(0.5, 2.0)]), 2.0)
        .unwrap();
    assert_eq!(first.len(), 1);
    assert!(second.is_empty());
}

#[test]
fn unseen_label_has_no_best_frame_and_is_off() {
    let engine = engine(Arc::new(InMemoryFrameStore::new()));
    engine
        .ingest_at(batch(1.0, vec![person(0.5, 1.0)]), 1.0)
        .unwrap();
    assert!(engine.best_frame(CAMERA, "car").is_none());
    assert_eq!(engine.presence(CAMERA, "car"), PresenceState::Off);
}

#[test]
fn each_frame_is_released_exactly_once() {
    let store = Arc::new(InMemoryFrameStore::new());
    let times: Vec<f64> = (1..=5).map(f64::from).collect();
    for &t in &times {
        store.insert(FrameKey::derive(CAMERA, t), Frame::blank(8, 8));
    }
    let engine = engine(store.clone());

    for &t in &times {
        engine.ingest_at(batch(t, vec![]), t).unwrap();
    }
    // A cycle without a frame keeps the current one.
    engine.ingest_at(batch(6.0, vec![]), 6.0).unwrap();

    let expected: Vec<FrameKey> = times[..4]
        .iter()
        .map(|&t| FrameKey::derive(CAMERA, t))
        .collect();
    assert_eq!(store.releases(), expected);

    engine.release_all();
    engine.release_all();
    let releases = store.releases();
    assert_eq!(releases.len(), 5);
    assert_eq!(releases[4], FrameKey::derive(CAMERA, 5.0));
}

#[test]
fn readers_see_frame_and_best_record_together() {
    const BATCHES: u8 = 120;
    let store = Arc::new(InMemoryFrameStore::new());
    for i in 1..=BATCHES {
        store.insert(FrameKey::derive(CAMERA, f64::from(i)), marked_frame(i));
    }
    let engine = Arc::new(engine(store));
    // Create the aggregator before readers start.
    engine.ingest_at(batch(0.0, vec![]), 0.0).unwrap();
    let aggregator = engine.camera(CAMERA).unwrap();

    let done = Arc::new(AtomicBool::new(false));
    let readers: Vec<_> = (0..3)
        .map(|_| {
            let aggregator = aggregator.clone();
            let done = done.clone();
            std::thread::spawn(move || {
                let mut checked = 0usize;
                while !done.load(Ordering::SeqCst) {
                    let (current, records) = aggregator.snapshot();
                    if let Some(best) = records.first() {
                        // Every batch raises the score, so the best record is
                        // always taken from the current frame.
                        let marker = current.pixel(0, 0).unwrap()[0];
                        assert_eq!(best.frame.pixel(0, 0).unwrap()[0], marker);
                        assert_eq!(best.object.frame_time, f64::from(marker));
                        assert_eq!(best.frame.as_rgb(), current.as_rgb());
                        checked += 1;
                    }
                }
                checked
            })
        })
        .collect();

    for i in 1..=BATCHES {
        let t = f64::from(i);
        let score = t / f64::from(BATCHES + 1);
        engine
            .ingest_at(batch(t, vec![person(score, t)]), t)
            .unwrap();
    }
    done.store(true, Ordering::SeqCst);
    for reader in readers {
        reader.join().expect("reader panicked");
    }

    let best = engine.best_record(CAMERA, "person").unwrap();
    assert_eq!(best.object.frame_time, f64::from(BATCHES));
}

#[derive(Default)]
struct Recorder {
    published: Mutex<Vec<(String, PresenceState, Option<Vec<u8>>)>>,
    stored: Mutex<Vec<(String, f64)>>,
}

impl Notifier for Recorder {
    fn publish(
        &self,
        _camera: &str,
        label: &str,
        state: PresenceState,
        snapshot: Option<&[u8]>,
    ) -> Result<()> {
        self.published
            .lock()
            .unwrap()
            .push((label.to_string(), state, snapshot.map(|s| s.to_vec())));
        Ok(())
    }
}

impl SnapshotStore for Recorder {
    fn store(&self, _camera: &str, label: &str, _snapshot: &[u8], frame_time: f64) -> Result<()> {
        self.stored
            .lock()
            .unwrap()
            .push((label.to_string(), frame_time));
        Ok(())
    }
}

struct FailingNotifier;

impl Notifier for FailingNotifier {
    fn publish(
        &self,
        _camera: &str,
        _label: &str,
        _state: PresenceState,
        _snapshot: Option<&[u8]>,
    ) -> Result<()> {
        Err(anyhow::anyhow!("broker unavailable"))
    }
}

#[test]
fn dispatcher_publishes_and_stores_each_transition() {
    let store = Arc::new(InMemoryFrameStore::new());
    store.insert(FrameKey::derive(CAMERA, 10.0), Frame::blank(8, 8));
    let engine = engine(store);
    let recorder = Arc::new(Recorder::default());
    let dispatcher =
        TransitionDispatcher::new(recorder.clone()).with_snapshot_store(recorder.clone());

    let on = engine
        .ingest_at(batch(10.0, vec![person(0.7, 10.0)]), 10.0)
        .unwrap();
    dispatcher.deliver(on);
    let off = engine.ingest_at(batch(11.0, vec![]), 11.0).unwrap();
    dispatcher.deliver(off);

    let published = recorder.published.lock().unwrap();
    assert_eq!(published.len(), 2);
    assert_eq!(published[0].1, PresenceState::On);
    assert_eq!(published[1].1, PresenceState::Off);
    let jpeg = published[0].2.as_ref().expect("snapshot attached");
    assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);

    let stored = recorder.stored.lock().unwrap();
    assert_eq!(
        *stored,
        vec![("person".to_string(), 10.0), ("person".to_string(), 11.0)]
    );
}

#[test]
fn delivery_failure_does_not_undo_state() {
    let engine = engine(Arc::new(InMemoryFrameStore::new()));
    let recorder = Arc::new(Recorder::default());
    let dispatcher =
        TransitionDispatcher::new(Arc::new(FailingNotifier)).with_snapshot_store(recorder.clone());

    let events = engine
        .ingest_at(batch(1.0, vec![person(0.5, 1.0)]), 1.0)
        .unwrap();
    dispatcher.deliver(events);

    assert_eq!(engine.presence(CAMERA, "person"), PresenceState::On);
    assert_eq!(recorder.stored.lock().unwrap().len(), 1);
}
