//! Frame annotation.
//!
//! The aggregator hands every freshly acquired frame to a `Renderer` before the
//! frame becomes visible to readers, so snapshots always carry the boxes of the
//! batch they belong to.

use ab_glyph::{FontVec, PxScale};
use anyhow::{anyhow, Context, Result};
use chrono::{Local, TimeZone};
use image::{Rgb, RgbImage};
use imageproc::drawing::{draw_filled_rect_mut, draw_hollow_rect_mut, draw_text_mut, text_size};
use imageproc::rect::Rect;
use std::collections::BTreeMap;
use std::path::Path;

use crate::frame::Frame;
use crate::TrackedObject;

/// Annotates a frame in place with the objects of one batch.
pub trait Renderer: Send + Sync {
    fn annotate(
        &self,
        camera: &str,
        frame: &mut Frame,
        objects: &[TrackedObject],
        frame_time: f64,
    );
}

/// Font used for box labels and timestamps unless configured otherwise.
pub const DEFAULT_FONT_PATH: &str = "/usr/share/fonts/truetype/dejavu/DejaVuSans.ttf";

const STALE_COLOR: [u8; 3] = [255, 0, 0];
const REGION_COLOR: [u8; 3] = [0, 255, 0];
const LABEL_TEXT_COLOR: [u8; 3] = [0, 0, 0];
const TIMESTAMP_COLOR: [u8; 3] = [255, 255, 255];
const LABEL_SCALE: f32 = 16.0;
const TIMESTAMP_SCALE: f32 = 24.0;
const TIMESTAMP_ORIGIN: (i32, i32) = (10, 10);

// tab10
const LABEL_PALETTE: [[u8; 3]; 10] = [
    [31, 119, 180],
    [255, 127, 14],
    [44, 160, 44],
    [214, 39, 40],
    [148, 103, 189],
    [140, 86, 75],
    [227, 119, 194],
    [127, 127, 127],
    [188, 189, 34],
    [23, 190, 207],
];

/// Per-camera overlay switches.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RenderOptions {
    /// Stamp the local frame time in the top-left corner.
    pub show_timestamp: bool,
}

/// Draws box and region outlines, with text when a font is loaded.
///
/// - Objects seen on this frame: 2 px outline in the label's palette colour.
/// - Objects carried over from an earlier frame: 1 px red outline.
/// - Detection regions: 1 px green outline.
/// - With a font: `"{label} {score}% {area}"` above each box, and the frame
///   time on cameras with `show_timestamp`.
#[derive(Default)]
pub struct BoxRenderer {
    font: Option<FontVec>,
    cameras: BTreeMap<String, RenderOptions>,
}

impl BoxRenderer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_font(mut self, font: FontVec) -> Self {
        self.font = Some(font);
        self
    }

    pub fn with_camera_options(
        mut self,
        camera: impl Into<String>,
        options: RenderOptions,
    ) -> Self {
        self.cameras.insert(camera.into(), options);
        self
    }

    pub fn has_font(&self) -> bool {
        self.font.is_some()
    }

    pub fn options(&self, camera: &str) -> RenderOptions {
        self.cameras.get(camera).copied().unwrap_or_default()
    }

    /// Palette colour for a label. Stable across runs.
    pub fn label_color(label: &str) -> [u8; 3] {
        let sum = label
            .bytes()
            .fold(0usize, |acc, b| acc.wrapping_mul(31).wrapping_add(b as usize));
        LABEL_PALETTE[sum % LABEL_PALETTE.len()]
    }
}

/// Load a TrueType/OpenType font for overlays.
pub fn load_font(path: &Path) -> Result<FontVec> {
    let bytes = std::fs::read(path)
        .with_context(|| format!("failed to read font {}", path.display()))?;
    FontVec::try_from_vec(bytes)
        .map_err(|e| anyhow!("invalid font {}: {}", path.display(), e))
}

impl Renderer for BoxRenderer {
    fn annotate(
        &self,
        camera: &str,
        frame: &mut Frame,
        objects: &[TrackedObject],
        frame_time: f64,
    ) {
        let show_timestamp = self.options(camera).show_timestamp;
        let drawn = frame.with_image(|canvas| {
            for obj in objects {
                let (color, thickness) = if obj.seen_at(frame_time) {
                    (Self::label_color(&obj.label), 2)
                } else {
                    (STALE_COLOR, 1)
                };
                draw_outline(canvas, obj.bbox, color, thickness);
                if let Some(font) = &self.font {
                    draw_label(canvas, font, obj.bbox, color, &label_text(obj));
                }
                draw_outline(canvas, obj.region, REGION_COLOR, 1);
            }
            if !show_timestamp {
                return;
            }
            if let (Some(font), Some(text)) = (&self.font, timestamp_text(frame_time)) {
                draw_text_mut(
                    canvas,
                    Rgb(TIMESTAMP_COLOR),
                    TIMESTAMP_ORIGIN.0,
                    TIMESTAMP_ORIGIN.1,
                    PxScale::from(TIMESTAMP_SCALE),
                    font,
                    &text,
                );
            }
        });
        if drawn.is_none() {
            log::warn!("camera={} frame buffer does not match its size", camera);
        }
    }
}

fn label_text(obj: &TrackedObject) -> String {
    format!(
        "{} {}% {}",
        obj.label,
        (obj.score * 100.0) as u32,
        obj.area as i64
    )
}

fn timestamp_text(frame_time: f64) -> Option<String> {
    Local
        .timestamp_opt(frame_time.floor() as i64, 0)
        .single()
        .map(|t| t.format("%m/%d/%Y %H:%M:%S").to_string())
}

/// `rect` (x_min, y_min, x_max, y_max) clamped to the canvas, inclusive.
fn clamped_rect(rect: [i32; 4], width: u32, height: u32) -> Option<Rect> {
    if width == 0 || height == 0 {
        return None;
    }
    let max_x = width as i64 - 1;
    let max_y = height as i64 - 1;
    let x0 = (rect[0] as i64).clamp(0, max_x);
    let y0 = (rect[1] as i64).clamp(0, max_y);
    let x1 = (rect[2] as i64).clamp(0, max_x);
    let y1 = (rect[3] as i64).clamp(0, max_y);
    if x1 < x0 || y1 < y0 {
        return None;
    }
    let (w, h) = ((x1 - x0 + 1) as u32, (y1 - y0 + 1) as u32);
    Some(Rect::at(x0 as i32, y0 as i32).of_size(w, h))
}

/// Outline growing inwards by `thickness`.
fn draw_outline(canvas: &mut RgbImage, rect: [i32; 4], color: [u8; 3], thickness: u32) {
    let Some(mut rect) = clamped_rect(rect, canvas.width(), canvas.height()) else {
        return;
    };
    for _ in 0..thickness {
        if rect.width() <= 2 || rect.height() <= 2 {
            draw_filled_rect_mut(canvas, rect, Rgb(color));
            break;
        }
        draw_hollow_rect_mut(canvas, rect, Rgb(color));
        let (w, h) = (rect.width() - 2, rect.height() - 2);
        rect = Rect::at(rect.left() + 1, rect.top() + 1).of_size(w, h);
    }
}

/// Filled caption above the box (inside it when the box touches the top edge).
fn draw_label(
    canvas: &mut RgbImage,
    font: &FontVec,
    bbox: [i32; 4],
    color: [u8; 3],
    text: &str,
) {
    let scale = PxScale::from(LABEL_SCALE);
    let (text_w, text_h) = text_size(scale, font, text);
    let Some(anchor) = clamped_rect(bbox, canvas.width(), canvas.height()) else {
        return;
    };
    let box_h = text_h as i32 + 2;
    let top = if anchor.top() >= box_h {
        anchor.top() - box_h
    } else {
        anchor.top()
    };
    let background = Rect::at(anchor.left(), top).of_size(text_w + 4, box_h as u32);
    draw_filled_rect_mut(canvas, background, Rgb(color));
    draw_text_mut(
        canvas,
        Rgb(LABEL_TEXT_COLOR),
        anchor.left() + 2,
        top + 1,
        scale,
        font,
        text,
    );
}
