use anyhow::{anyhow, Result};
use crossbeam::channel::Sender;
use image::{ImageBuffer, Rgb, RgbImage};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, RwLock};
use std::time::Instant;
use tokio::sync::watch;

/// A decoded frame: `width * height * 3` bytes in BGR order, row-major.
#[derive(Clone, PartialEq, Eq)]
pub struct FrameBuffer {
    width: u32,
    height: u32,
    data: Vec<u8>,
}

impl FrameBuffer {
    pub fn new(width: u32, height: u32, data: Vec<u8>) -> Result<Self> {
        let expected = width as usize * height as usize * 3;
        if data.len() != expected {
            return Err(anyhow!(
                "Frame buffer size mismatch: got {} bytes, expected {} for {}x{}",
                data.len(),
                expected,
                width,
                height
            ));
        }
        Ok(Self {
            width,
            height,
            data,
        })
    }

    pub fn filled(width: u32, height: u32, bgr: [u8; 3]) -> Self {
        let data = bgr
            .iter()
            .copied()
            .cycle()
            .take(width as usize * height as usize * 3)
            .collect();
        Self {
            width,
            height,
            data,
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }

    pub fn pixel(&self, x: u32, y: u32) -> [u8; 3] {
        let i = self.offset(x, y);
        [self.data[i], self.data[i + 1], self.data[i + 2]]
    }

    pub fn set_pixel(&mut self, x: u32, y: u32, bgr: [u8; 3]) {
        let i = self.offset(x, y);
        self.data[i..i + 3].copy_from_slice(&bgr);
    }

    #[inline]
    fn offset(&self, x: u32, y: u32) -> usize {
        (y as usize * self.width as usize + x as usize) * 3
    }

    /// Convert to an RGB `image` buffer (for model input and previews).
    pub fn to_rgb_image(&self) -> Result<RgbImage> {
        let rgb: Vec<u8> = self
            .data
            .chunks_exact(3)
            .flat_map(|bgr| [bgr[2], bgr[1], bgr[0]])
            .collect();
        ImageBuffer::<Rgb<u8>, _>::from_vec(self.width, self.height, rgb)
            .ok_or_else(|| anyhow!("Failed to create ImageBuffer from frame data"))
    }
}

impl fmt::Debug for FrameBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameBuffer")
            .field("width", &self.width)
            .field("height", &self.height)
            .finish_non_exhaustive()
    }
}

/// Pixel-space box, `x2`/`y2` exclusive.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct PixelBox {
    pub x1: i32,
    pub y1: i32,
    pub x2: i32,
    pub y2: i32,
}

impl PixelBox {
    pub fn new(x1: i32, y1: i32, x2: i32, y2: i32) -> Self {
        Self { x1, y1, x2, y2 }
    }

    pub fn width(&self) -> i32 {
        self.x2 - self.x1
    }

    pub fn height(&self) -> i32 {
        self.y2 - self.y1
    }

    pub fn is_empty(&self) -> bool {
        self.width() <= 0 || self.height() <= 0
    }

    pub fn contains(&self, x: i32, y: i32) -> bool {
        x >= self.x1 && x < self.x2 && y >= self.y1 && y < self.y2
    }

    /// Intersection with a `width x height` frame.
    pub fn clamp_to(&self, width: u32, height: u32) -> Self {
        Self {
            x1: self.x1.max(0),
            y1: self.y1.max(0),
            x2: self.x2.min(width as i32),
            y2: self.y2.min(height as i32),
        }
    }
}

/// Which detector instance produced a region.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum DetectionCategory {
    Face,
    LicensePlate,
}

impl DetectionCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Face => "face",
            Self::LicensePlate => "license_plate",
        }
    }
}

impl fmt::Display for DetectionCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single detection in pixel coordinates
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct DetectedRegion {
    pub class_id: u32,
    pub bbox: PixelBox,
    pub confidence: f32,
}

/// Pipeline step. Exactly one is active at a time.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum PipelineState {
    Init,
    OpenSource,
    ProcessFrames,
    EncodeWait,
    Reencode,
    ExtractAudio,
    ShiftAudio,
    FallbackExtract,
    FallbackShift,
    FinalMerge,
    Done,
    Failed,
    Cancelled,
}

impl PipelineState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::OpenSource => "open_source",
            Self::ProcessFrames => "process_frames",
            Self::EncodeWait => "encode_wait",
            Self::Reencode => "reencode",
            Self::ExtractAudio => "extract_audio",
            Self::ShiftAudio => "shift_audio",
            Self::FallbackExtract => "fallback_extract",
            Self::FallbackShift => "fallback_shift",
            Self::FinalMerge => "final_merge",
            Self::Done => "done",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    fn ordinal(self) -> u8 {
        self as u8
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Failed | Self::Cancelled)
    }

    /// Transitions only move forward (stages may be skipped); any live state may fail or be cancelled.
    pub fn can_advance_to(self, next: PipelineState) -> bool {
        if self.is_terminal() {
            return false;
        }
        match next {
            Self::Failed | Self::Cancelled => true,
            _ => next.ordinal() > self.ordinal(),
        }
    }
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Serialize, Clone)]
pub struct StageProgress {
    pub current: usize,
    pub total: usize,
    pub ms_per_frame: f64,
}

/// Processing state shared between the controller, the frame worker and observers
#[derive(Debug)]
pub struct ProcessingState {
    pub run_id: String,
    pub total_frames: RwLock<usize>,
    pub current_step: RwLock<PipelineState>,
    pub error: RwLock<Option<String>>,
    /// Progress per stage ("detect", "encode")
    pub stages: RwLock<BTreeMap<String, StageProgress>>,
    pub start_time: Instant,
}

impl ProcessingState {
    pub fn new(run_id: String) -> Self {
        let mut stages = BTreeMap::new();
        for stage in ["detect", "encode"] {
            stages.insert(
                stage.to_string(),
                StageProgress {
                    current: 0,
                    total: 0,
                    ms_per_frame: 0.0,
                },
            );
        }

        Self {
            run_id,
            total_frames: RwLock::new(0),
            current_step: RwLock::new(PipelineState::Init),
            error: RwLock::new(None),
            stages: RwLock::new(stages),
            start_time: Instant::now(),
        }
    }

    pub fn step(&self) -> PipelineState {
        self.current_step
            .read()
            .map(|s| *s)
            .unwrap_or(PipelineState::Failed)
    }

    pub fn set_total_frames(&self, total: usize) {
        if let Ok(mut t) = self.total_frames.write() {
            *t = total;
        }
        if let Ok(mut stages) = self.stages.write() {
            for progress in stages.values_mut() {
                progress.total = total;
            }
        }
    }

    pub fn set_error(&self, message: String) {
        if let Ok(mut e) = self.error.write() {
            *e = Some(message);
        }
    }

    pub fn update_stage(&self, stage: &str, current: usize, ms_per_frame: f64) {
        if let Ok(mut stages) = self.stages.write() {
            if let Some(progress) = stages.get_mut(stage) {
                progress.current = current;
                // Exponential moving average to smooth per-frame durations
                if progress.ms_per_frame == 0.0 {
                    progress.ms_per_frame = ms_per_frame;
                } else {
                    progress.ms_per_frame = progress.ms_per_frame * 0.9 + ms_per_frame * 0.1;
                }
            }
        }
    }

    pub fn stage_current(&self, stage: &str) -> usize {
        self.stages
            .read()
            .ok()
            .and_then(|s| s.get(stage).map(|p| p.current))
            .unwrap_or(0)
    }

    pub fn to_progress_json(&self) -> serde_json::Value {
        let stages = self
            .stages
            .read()
            .map(|s| s.clone())
            .unwrap_or_default();

        let encoded = stages.get("encode").map(|s| s.current).unwrap_or(0);
        let elapsed = self.start_time.elapsed().as_secs_f64();
        let effective_fps = if elapsed > 0.0 {
            encoded as f64 / elapsed
        } else {
            0.0
        };

        let stages_json: BTreeMap<String, serde_json::Value> = stages
            .iter()
            .map(|(k, v)| {
                (
                    k.clone(),
                    serde_json::json!({
                        "current": v.current,
                        "total": v.total,
                        "ms_per_frame": v.ms_per_frame,
                        "fps": if v.ms_per_frame > 0.0 { 1000.0 / v.ms_per_frame } else { 0.0 }
                    }),
                )
            })
            .collect();

        serde_json::json!({
            "run_id": self.run_id,
            "total_frames": self.total_frames.read().map(|t| *t).unwrap_or(0),
            "current_step": self.step(),
            "error": self.error.read().ok().and_then(|e| e.clone()),
            "stages": stages_json,
            "elapsed_secs": elapsed,
            "effective_fps": effective_fps,
        })
    }
}

/// Events delivered to whoever drives the pipeline
#[derive(Debug, Clone, PartialEq)]
pub enum PipelineEvent {
    Progress(String),
    FrameProgress { frames: usize, total: usize, fps: f64 },
    StateChanged(PipelineState),
    Error(String),
    Finished(i32),
}

/// Sending half of the event bus. Sends never block and are dropped once the receiver is gone.
#[derive(Clone)]
pub struct EventSink {
    tx: Sender<PipelineEvent>,
}

impl EventSink {
    pub fn new(tx: Sender<PipelineEvent>) -> Self {
        Self { tx }
    }

    pub fn send(&self, event: PipelineEvent) {
        let _ = self.tx.send(event);
    }

    pub fn progress(&self, message: impl Into<String>) {
        self.send(PipelineEvent::Progress(message.into()));
    }

    pub fn error(&self, message: impl Into<String>) {
        self.send(PipelineEvent::Error(message.into()));
    }
}

/// Cancellation flag for one job. Cloning shares the flag.
#[derive(Clone)]
pub struct CancelHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl CancelHandle {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Request cancellation. Returns false if the job was already cancelled.
    pub fn cancel(&self) -> bool {
        self.tx.send_if_modified(|cancelled| {
            if *cancelled {
                false
            } else {
                *cancelled = true;
                true
            }
        })
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves once `cancel` has been called.
    pub async fn cancelled(&self) {
        let mut rx = self.tx.subscribe();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                // The sender lives as long as any handle, so this cannot happen while we hold `self`.
                std::future::pending::<()>().await;
            }
        }
    }
}

impl Default for CancelHandle {
    fn default() -> Self {
        Self::new()
    }
}
