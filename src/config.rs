use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use crate::best::DEFAULT_BEST_STALE_SECS;
use crate::frame::{DEFAULT_FRAME_HEIGHT, DEFAULT_FRAME_WIDTH};
use crate::notify::EventEndpoints;
use crate::presence::{PresenceSettings, DEFAULT_MIN_HISTORY_LEN};
use crate::render::{RenderOptions, DEFAULT_FONT_PATH};

const DEFAULT_TOPIC_PREFIX: &str = "frigate";
const DEFAULT_FRAME_DIR: &str = "/dev/shm/frames";
const DEFAULT_API_ADDR: &str = "127.0.0.1:5055";
const DEFAULT_WORKERS: usize = 2;

#[derive(Debug, Deserialize, Default)]
struct ProcessorConfigFile {
    topic_prefix: Option<String>,
    snapshot_dir: Option<PathBuf>,
    api_addr: Option<String>,
    workers: Option<usize>,
    font_path: Option<PathBuf>,
    frames: Option<FrameConfigFile>,
    presence: Option<PresenceConfigFile>,
    cameras: Option<BTreeMap<String, CameraConfigFile>>,
}

#[derive(Debug, Deserialize, Default)]
struct FrameConfigFile {
    dir: Option<PathBuf>,
    width: Option<u32>,
    height: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct PresenceConfigFile {
    min_history_len: Option<usize>,
    best_stale_secs: Option<f64>,
}

#[derive(Debug, Deserialize, Default)]
struct CameraConfigFile {
    event_endpoint: Option<String>,
    show_timestamp: Option<bool>,
}

#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    /// Root of the published topics, `{topic_prefix}/{camera}/{label}`.
    pub topic_prefix: String,
    pub frames: FrameSettings,
    pub presence: PresenceSettings,
    /// Snapshots are only written to disk when set.
    pub snapshot_dir: Option<PathBuf>,
    pub api_addr: String,
    pub workers: usize,
    pub event_endpoints: EventEndpoints,
    /// Font for box captions and timestamps.
    pub font_path: PathBuf,
    /// Overlay options for cameras listed in the config file.
    pub render_options: BTreeMap<String, RenderOptions>,
}

/// Where the decoder leaves raw frames and how large they are.
#[derive(Debug, Clone)]
pub struct FrameSettings {
    pub dir: PathBuf,
    pub width: u32,
    pub height: u32,
}

impl ProcessorConfig {
    /// Load from `PRESENCE_CONFIG` (if set), then apply env overrides.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("PRESENCE_CONFIG").ok();
        let file_cfg = match config_path.as_deref() {
            Some(path) if !path.trim().is_empty() => Some(read_config_file(Path::new(path))?),
            _ => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default())?;
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: ProcessorConfigFile) -> Result<Self> {
        let frames = FrameSettings {
            dir: file
                .frames
                .as_ref()
                .and_then(|frames| frames.dir.clone())
                .unwrap_or_else(|| PathBuf::from(DEFAULT_FRAME_DIR)),
            width: file
                .frames
                .as_ref()
                .and_then(|frames| frames.width)
                .unwrap_or(DEFAULT_FRAME_WIDTH),
            height: file
                .frames
                .as_ref()
                .and_then(|frames| frames.height)
                .unwrap_or(DEFAULT_FRAME_HEIGHT),
        };
        let presence = PresenceSettings {
            min_history_len: file
                .presence
                .as_ref()
                .and_then(|presence| presence.min_history_len)
                .unwrap_or(DEFAULT_MIN_HISTORY_LEN),
            best_stale_secs: file
                .presence
                .as_ref()
                .and_then(|presence| presence.best_stale_secs)
                .unwrap_or(DEFAULT_BEST_STALE_SECS),
        };
        let mut event_endpoints = EventEndpoints::new();
        let mut render_options = BTreeMap::new();
        for (camera, camera_cfg) in file.cameras.unwrap_or_default() {
            if let Some(endpoint) = camera_cfg.event_endpoint {
                event_endpoints.insert(camera.clone(), &endpoint)?;
            }
            let options = RenderOptions {
                show_timestamp: camera_cfg.show_timestamp.unwrap_or(false),
            };
            render_options.insert(camera, options);
        }
        Ok(Self {
            topic_prefix: file
                .topic_prefix
                .unwrap_or_else(|| DEFAULT_TOPIC_PREFIX.to_string()),
            frames,
            presence,
            snapshot_dir: file.snapshot_dir,
            api_addr: file
                .api_addr
                .unwrap_or_else(|| DEFAULT_API_ADDR.to_string()),
            workers: file.workers.unwrap_or(DEFAULT_WORKERS),
            event_endpoints,
            font_path: file
                .font_path
                .unwrap_or_else(|| PathBuf::from(DEFAULT_FONT_PATH)),
            render_options,
        })
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(prefix) = std::env::var("PRESENCE_TOPIC_PREFIX") {
            if !prefix.trim().is_empty() {
                self.topic_prefix = prefix.trim().to_string();
            }
        }
        if let Ok(dir) = std::env::var("PRESENCE_SNAPSHOT_DIR") {
            if !dir.trim().is_empty() {
                self.snapshot_dir = Some(PathBuf::from(dir));
            }
        }
        if let Ok(dir) = std::env::var("PRESENCE_FRAME_DIR") {
            if !dir.trim().is_empty() {
                self.frames.dir = PathBuf::from(dir);
            }
        }
        if let Ok(addr) = std::env::var("PRESENCE_API_ADDR") {
            if !addr.trim().is_empty() {
                self.api_addr = addr;
            }
        }
        if let Ok(path) = std::env::var("PRESENCE_FONT_PATH") {
            if !path.trim().is_empty() {
                self.font_path = PathBuf::from(path);
            }
        }
        if let Ok(value) = std::env::var("PRESENCE_MIN_HISTORY") {
            self.presence.min_history_len = value
                .trim()
                .parse()
                .map_err(|_| anyhow!("PRESENCE_MIN_HISTORY must be a positive integer"))?;
        }
        if let Ok(value) = std::env::var("PRESENCE_STALE_SECS") {
            self.presence.best_stale_secs = value
                .trim()
                .parse()
                .map_err(|_| anyhow!("PRESENCE_STALE_SECS must be a number of seconds"))?;
        }
        if let Ok(value) = std::env::var("PRESENCE_WORKERS") {
            self.workers = value
                .trim()
                .parse()
                .map_err(|_| anyhow!("PRESENCE_WORKERS must be a positive integer"))?;
        }
        Ok(())
    }

    fn validate(&mut self) -> Result<()> {
        let prefix = self.topic_prefix.trim_matches('/');
        if prefix.is_empty() || prefix.contains(|c: char| c == '+' || c == '#') {
            return Err(anyhow!(
                "topic prefix '{}' must be non-empty and free of MQTT wildcards",
                self.topic_prefix
            ));
        }
        self.topic_prefix = prefix.to_string();

        if self.frames.width == 0 || self.frames.height == 0 {
            return Err(anyhow!("frame dimensions must be greater than zero"));
        }
        if self.presence.min_history_len == 0 {
            return Err(anyhow!("min_history_len must be greater than zero"));
        }
        if !self.presence.best_stale_secs.is_finite() || self.presence.best_stale_secs <= 0.0 {
            return Err(anyhow!("best_stale_secs must be greater than zero"));
        }
        if self.workers == 0 {
            return Err(anyhow!("workers must be greater than zero"));
        }
        self.api_addr
            .parse::<SocketAddr>()
            .map_err(|e| anyhow!("invalid api_addr '{}': {}", self.api_addr, e))?;
        Ok(())
    }

    /// Topic filter matching tracked-object batches for every camera.
    pub fn batch_topic(&self) -> String {
        format!("{}/tracked/+", self.topic_prefix)
    }
}

fn read_config_file(path: &Path) -> Result<ProcessorConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let cfg = serde_json::from_str(&raw)
        .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?;
    Ok(cfg)
}
