pub mod ffmpeg_reader;
#[cfg(feature = "opencv")]
pub mod opencv_reader;

use crate::pipeline::types::FrameBuffer;
use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;

/// What the encoder needs to know about the source stream.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SourceInfo {
    pub width: u32,
    pub height: u32,
    pub fps: f64,
    /// Rate as handed to the encoder's `-r` (e.g. `30000/1001`).
    pub fps_expr: String,
    /// May be an estimate from the container duration.
    pub frame_count: usize,
    /// `None` when the backend cannot tell.
    pub has_audio: Option<bool>,
}

impl SourceInfo {
    pub fn new(width: u32, height: u32, fps: f64) -> Self {
        Self {
            width,
            height,
            fps,
            fps_expr: format_fps(fps),
            frame_count: 0,
            has_audio: None,
        }
    }

    pub fn frame_bytes(&self) -> usize {
        self.width as usize * self.height as usize * 3
    }
}

fn format_fps(fps: f64) -> String {
    if fps.fract() == 0.0 {
        format!("{}", fps as u64)
    } else {
        format!("{:.3}", fps)
    }
}

pub trait VideoSource: Send {
    fn info(&self) -> &SourceInfo;
    /// Next decoded frame, or `None` once the stream is exhausted.
    fn next_frame(&mut self) -> Result<Option<FrameBuffer>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceBackend {
    #[default]
    Ffmpeg,
    Opencv,
}

impl FromStr for SourceBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "ffmpeg" => Ok(Self::Ffmpeg),
            "opencv" => Ok(Self::Opencv),
            other => Err(anyhow!("Unknown video backend: {}", other)),
        }
    }
}

impl fmt::Display for SourceBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Ffmpeg => "ffmpeg",
            Self::Opencv => "opencv",
        })
    }
}

pub fn open_source(
    backend: SourceBackend,
    path: &Path,
    ffmpeg: &Path,
) -> Result<Box<dyn VideoSource>> {
    match backend {
        SourceBackend::Ffmpeg => Ok(Box::new(ffmpeg_reader::FfmpegPipeReader::open(
            path, ffmpeg,
        )?)),
        #[cfg(feature = "opencv")]
        SourceBackend::Opencv => Ok(Box::new(opencv_reader::OpencvReader::new(path)?)),
        #[cfg(not(feature = "opencv"))]
        SourceBackend::Opencv => Err(anyhow!(
            "Unsupported or disabled backend: {} (build with --features opencv)",
            backend
        )),
    }
}

/// Frames generated in memory, for tests.
#[cfg(test)]
pub(crate) struct SyntheticSource {
    info: SourceInfo,
    remaining: usize,
    next_id: usize,
}

#[cfg(test)]
impl SyntheticSource {
    pub fn new(width: u32, height: u32, fps: f64, frames: usize) -> Self {
        let mut info = SourceInfo::new(width, height, fps);
        info.frame_count = frames;
        Self {
            info,
            remaining: frames,
            next_id: 0,
        }
    }

    pub fn with_audio(mut self, has_audio: Option<bool>) -> Self {
        self.info.has_audio = has_audio;
        self
    }

    /// Deterministic content for frame `id`.
    pub fn frame(width: u32, height: u32, id: usize) -> FrameBuffer {
        let mut frame = FrameBuffer::filled(width, height, [0, 0, 0]);
        for y in 0..height {
            for x in 0..width {
                let v = (x as usize * 7 + y as usize * 13 + id * 31) as u8;
                frame.set_pixel(x, y, [v, v.wrapping_mul(3), 255 - v]);
            }
        }
        frame
    }
}

#[cfg(test)]
impl VideoSource for SyntheticSource {
    fn info(&self) -> &SourceInfo {
        &self.info
    }

    fn next_frame(&mut self) -> Result<Option<FrameBuffer>> {
        if self.remaining == 0 {
            return Ok(None);
        }
        self.remaining -= 1;
        let frame = Self::frame(self.info.width, self.info.height, self.next_id);
        self.next_id += 1;
        Ok(Some(frame))
    }
}
