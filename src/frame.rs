//! Frame buffers and the shared frame handle.
//!
//! Raw frames are written by the capture side into an external store, keyed by a
//! digest of (camera, frame time). The processor never waits for a frame: it polls
//! the store once per batch, keeps at most one handle per camera, and releases the
//! previous handle as soon as a newer frame replaces it.
//!
//! - `Frame`: Owned RGB8 pixel buffer.
//! - `FrameKey`: Deterministic key shared by producers and the processor.
//! - `FrameStore`: Non-blocking store interface (`try_get` / `release`).
//! - `SharedFrameHandle`: Per-camera holder enforcing the single-handle rule.

use anyhow::{anyhow, Context, Result};
use image::RgbImage;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// Placeholder width used before a camera has produced any frame.
pub const DEFAULT_FRAME_WIDTH: u32 = 1280;
/// Placeholder height used before a camera has produced any frame.
pub const DEFAULT_FRAME_HEIGHT: u32 = 720;

const BYTES_PER_PIXEL: usize = 3;
const FRAME_FILE_EXTENSION: &str = "rgb";

// ----------------------------------------------------------------------------
// Frame: RGB8 pixel buffer
// ----------------------------------------------------------------------------

/// Owned RGB8 frame. Rows are packed, no padding.
#[derive(Clone, PartialEq, Eq)]
pub struct Frame {
    width: u32,
    height: u32,
    data: Vec<u8>,
}

impl Frame {
    /// Wrap packed RGB8 bytes. The length must match the dimensions exactly.
    pub fn from_rgb(width: u32, height: u32, data: Vec<u8>) -> Result<Self> {
        let expected = rgb_len(width, height);
        if data.len() != expected {
            return Err(anyhow!(
                "frame size mismatch: {}x{} needs {} bytes, got {}",
                width,
                height,
                expected,
                data.len()
            ));
        }
        Ok(Self {
            width,
            height,
            data,
        })
    }

    /// All-black frame, used as the placeholder for cameras without frames.
    pub fn blank(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            data: vec![0u8; rgb_len(width, height)],
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn as_rgb(&self) -> &[u8] {
        &self.data
    }

    pub fn byte_len(&self) -> usize {
        self.data.len()
    }

    pub fn pixel(&self, x: u32, y: u32) -> Option<[u8; 3]> {
        let offset = self.offset(x, y)?;
        Some([
            self.data[offset],
            self.data[offset + 1],
            self.data[offset + 2],
        ])
    }

    /// Set a pixel. Coordinates outside the frame are ignored.
    pub fn put_pixel(&mut self, x: u32, y: u32, rgb: [u8; 3]) {
        if let Some(offset) = self.offset(x, y) {
            self.data[offset..offset + BYTES_PER_PIXEL].copy_from_slice(&rgb);
        }
    }

    /// Run `draw` over the pixels as an `RgbImage` without copying them.
    pub fn with_image<R>(&mut self, draw: impl FnOnce(&mut RgbImage) -> R) -> Option<R> {
        if self.data.len() != rgb_len(self.width, self.height) {
            return None;
        }
        let data = std::mem::take(&mut self.data);
        let mut image = RgbImage::from_raw(self.width, self.height, data)?;
        let out = draw(&mut image);
        self.data = image.into_raw();
        Some(out)
    }

    fn offset(&self, x: u32, y: u32) -> Option<usize> {
        if x >= self.width || y >= self.height {
            return None;
        }
        Some((y as usize * self.width as usize + x as usize) * BYTES_PER_PIXEL)
    }
}

// Pixel dumps are useless in logs.
impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("width", &self.width)
            .field("height", &self.height)
            .finish_non_exhaustive()
    }
}

fn rgb_len(width: u32, height: u32) -> usize {
    width as usize * height as usize * BYTES_PER_PIXEL
}

// ----------------------------------------------------------------------------
// FrameKey: (camera, frame time) digest
// ----------------------------------------------------------------------------

/// Content-independent key for a frame in the external store.
///
/// The key is SHA-256 over `"{camera}{frame_time:.6}"`. Producers writing frames
/// into the store must derive keys the same way.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct FrameKey([u8; 32]);

impl FrameKey {
    pub fn derive(camera: &str, frame_time: f64) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(format!("{}{:.6}", camera, frame_time).as_bytes());
        Self(hasher.finalize().into())
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for FrameKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for FrameKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FrameKey({})", self.to_hex())
    }
}

// ----------------------------------------------------------------------------
// FrameStore: external frame storage
// ----------------------------------------------------------------------------

/// External store holding raw frames written by the capture side.
///
/// Implementations MUST NOT block in `try_get`: a frame that has not arrived yet
/// is reported as `Ok(None)` immediately. `release` MUST be idempotent.
pub trait FrameStore: Send + Sync {
    /// Poll for a frame. `Ok(None)` means unavailable this cycle.
    fn try_get(&self, key: &FrameKey) -> Result<Option<Frame>>;

    /// Drop the store's copy of a frame. Unknown keys are a no-op.
    fn release(&self, key: &FrameKey) -> Result<()>;
}

/// In-process frame store. Records every release call for inspection.
#[derive(Default)]
pub struct InMemoryFrameStore {
    frames: Mutex<HashMap<FrameKey, Frame>>,
    releases: Mutex<Vec<FrameKey>>,
}

impl InMemoryFrameStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, key: FrameKey, frame: Frame) {
        lock_recover(&self.frames).insert(key, frame);
    }

    pub fn contains(&self, key: &FrameKey) -> bool {
        lock_recover(&self.frames).contains_key(key)
    }

    pub fn len(&self) -> usize {
        lock_recover(&self.frames).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Every key passed to `release`, in call order.
    pub fn releases(&self) -> Vec<FrameKey> {
        lock_recover(&self.releases).clone()
    }
}

impl FrameStore for InMemoryFrameStore {
    fn try_get(&self, key: &FrameKey) -> Result<Option<Frame>> {
        Ok(lock_recover(&self.frames).get(key).cloned())
    }

    fn release(&self, key: &FrameKey) -> Result<()> {
        lock_recover(&self.releases).push(*key);
        lock_recover(&self.frames).remove(key);
        Ok(())
    }
}

/// Frame store backed by a directory of raw RGB8 files, typically on a tmpfs
/// such as `/dev/shm`. Each frame lives in `<hex key>.rgb`.
#[derive(Clone, Debug)]
pub struct DirectoryFrameStore {
    dir: PathBuf,
    width: u32,
    height: u32,
}

impl DirectoryFrameStore {
    pub fn new(dir: impl Into<PathBuf>, width: u32, height: u32) -> Result<Self> {
        let dir = dir.into();
        if width == 0 || height == 0 {
            return Err(anyhow!("frame dimensions must be non-zero"));
        }
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("create frame directory {}", dir.display()))?;
        Ok(Self { dir, width, height })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, key: &FrameKey) -> PathBuf {
        self.dir
            .join(format!("{}.{}", key.to_hex(), FRAME_FILE_EXTENSION))
    }

    /// Producer side: publish a frame under `key`.
    ///
    /// The file is written under a temporary name and renamed into place so a
    /// concurrent `try_get` never reads a partial frame.
    pub fn write(&self, key: &FrameKey, frame: &Frame) -> Result<()> {
        if frame.width() != self.width || frame.height() != self.height {
            return Err(anyhow!(
                "frame is {}x{}, store expects {}x{}",
                frame.width(),
                frame.height(),
                self.width,
                self.height
            ));
        }
        let path = self.path_for(key);
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, frame.as_rgb())
            .with_context(|| format!("write frame {}", tmp.display()))?;
        std::fs::rename(&tmp, &path)
            .with_context(|| format!("publish frame {}", path.display()))?;
        Ok(())
    }
}

impl FrameStore for DirectoryFrameStore {
    fn try_get(&self, key: &FrameKey) -> Result<Option<Frame>> {
        let path = self.path_for(key);
        let data = match std::fs::read(&path) {
            Ok(data) => data,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(anyhow!("failed to read frame {}: {}", path.display(), err));
            }
        };
        let frame = Frame::from_rgb(self.width, self.height, data)
            .with_context(|| format!("corrupt frame {}", path.display()))?;
        Ok(Some(frame))
    }

    fn release(&self, key: &FrameKey) -> Result<()> {
        let path = self.path_for(key);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(anyhow!(
                "failed to release frame {}: {}",
                path.display(),
                err
            )),
        }
    }
}

// ----------------------------------------------------------------------------
// SharedFrameHandle: at most one outstanding frame per camera
// ----------------------------------------------------------------------------

/// A frame fetched from the store but not yet installed as a camera's current
/// frame. The renderer annotates it in this state.
#[derive(Debug)]
pub struct AcquiredFrame {
    pub key: FrameKey,
    pub frame: Frame,
}

/// Poll the store for the frame of (camera, frame time).
///
/// Never waits. Store errors are logged and reported as unavailable so the
/// caller keeps its previous frame for this cycle.
pub fn acquire(store: &dyn FrameStore, camera: &str, frame_time: f64) -> Option<AcquiredFrame> {
    let key = FrameKey::derive(camera, frame_time);
    match store.try_get(&key) {
        Ok(Some(frame)) => Some(AcquiredFrame { key, frame }),
        Ok(None) => {
            log::debug!(
                "frame unavailable camera={} frame_time={:.6} key={}",
                camera,
                frame_time,
                key
            );
            None
        }
        Err(err) => {
            log::warn!("frame store error camera={} key={}: {:#}", camera, key, err);
            None
        }
    }
}

/// Holds a camera's current frame and the store key it came from.
///
/// Installing a new frame releases the previous key first, so a camera never
/// has more than one frame outstanding in the store.
pub struct SharedFrameHandle {
    camera: String,
    held: Option<HeldFrame>,
}

struct HeldFrame {
    key: FrameKey,
    frame: Arc<Frame>,
}

impl SharedFrameHandle {
    pub fn new(camera: impl Into<String>) -> Self {
        Self {
            camera: camera.into(),
            held: None,
        }
    }

    pub fn camera(&self) -> &str {
        &self.camera
    }

    /// Current frame, if one has ever been installed.
    pub fn frame(&self) -> Option<Arc<Frame>> {
        self.held.as_ref().map(|held| held.frame.clone())
    }

    pub fn key(&self) -> Option<FrameKey> {
        self.held.as_ref().map(|held| held.key)
    }

    /// Install a freshly acquired frame, releasing the previously held key.
    ///
    /// Re-acquiring the key already held (a duplicate batch) swaps the pixels
    /// without releasing, since the store entry is still the live one.
    pub fn install(&mut self, acquired: AcquiredFrame, store: &dyn FrameStore) -> Arc<Frame> {
        let frame = Arc::new(acquired.frame);
        let previous = self.held.replace(HeldFrame {
            key: acquired.key,
            frame: frame.clone(),
        });
        if let Some(previous) = previous {
            if previous.key != acquired.key {
                release_logged(store, &self.camera, &previous.key);
            }
        }
        frame
    }

    /// Release the held frame, if any. Safe to call repeatedly.
    pub fn release(&mut self, store: &dyn FrameStore) {
        if let Some(held) = self.held.take() {
            release_logged(store, &self.camera, &held.key);
        }
    }
}

fn release_logged(store: &dyn FrameStore, camera: &str, key: &FrameKey) {
    if let Err(err) = store.release(key) {
        log::warn!(
            "failed to release frame camera={} key={}: {:#}",
            camera,
            key,
            err
        );
    }
}

fn lock_recover<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
