use crate::pipeline::blur::BlurKind;
use crate::pipeline::error::PipelineError;
use crate::pipeline::reader::PreviewSettings;
use crate::pipeline::types::DetectionCategory;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::time::Duration;

pub const BLUR_STRENGTH_RANGE: (u32, u32) = (21, 101);
pub const PITCH_RANGE: (f64, f64) = (-12.0, 12.0);
pub const MAX_QUALITY: u32 = 51;
/// Ceiling applied to the quality parameter on GPU devices.
pub const GPU_QUALITY_CAP: u32 = 28;

/// Compute device the detectors run on. Only affects the encoder quality here.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Device {
    #[default]
    Cpu,
    Cuda,
    Mps,
    Auto,
}

impl Device {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Cpu => "cpu",
            Self::Cuda => "cuda",
            Self::Mps => "mps",
            Self::Auto => "auto",
        }
    }

    pub fn is_gpu(self) -> bool {
        matches!(self, Self::Cuda | Self::Mps)
    }

    /// Replace `auto` with what this machine has.
    pub fn resolve(self) -> Self {
        if self != Self::Auto {
            return self;
        }
        let has_nvidia = Command::new("nvidia-smi")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map(|s| s.success())
            .unwrap_or(false);
        let resolved = if has_nvidia {
            Self::Cuda
        } else if cfg!(all(target_os = "macos", target_arch = "aarch64")) {
            Self::Mps
        } else {
            Self::Cpu
        };
        tracing::info!("Auto-selected device: {}", resolved);
        resolved
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One processing request. Immutable once the pipeline starts.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct Job {
    pub input: PathBuf,
    pub output: PathBuf,
    /// Encoder executable; also used for every audio step.
    pub ffmpeg: PathBuf,
    pub confidence: f32,
    pub blur_kind: BlurKind,
    pub blur_strength: u32,
    pub face_padding: f32,
    pub blur_faces: bool,
    pub blur_plates: bool,
    pub pitch_semitones: f64,
    pub quality: u32,
    pub reencode: bool,
    pub device: Device,
}

impl Default for Job {
    fn default() -> Self {
        Self {
            input: PathBuf::new(),
            output: PathBuf::new(),
            ffmpeg: PathBuf::from("ffmpeg"),
            confidence: 0.15,
            blur_kind: BlurKind::Gaussian,
            blur_strength: 51,
            face_padding: 0.2,
            blur_faces: true,
            blur_plates: true,
            pitch_semitones: 0.0,
            quality: 22,
            reencode: true,
            device: Device::Cpu,
        }
    }
}

impl Job {
    pub fn new(input: impl Into<PathBuf>, output: impl Into<PathBuf>) -> Self {
        Self {
            input: input.into(),
            output: output.into(),
            ..Default::default()
        }
    }

    pub fn validate(&self) -> Result<(), PipelineError> {
        let invalid = |msg: String| Err(PipelineError::InvalidJob(msg));

        if self.input.as_os_str().is_empty() {
            return invalid("no input file".into());
        }
        if self.output.as_os_str().is_empty() {
            return invalid("no output file".into());
        }
        if self.input == self.output {
            return invalid("output must differ from input".into());
        }
        if !(0.0..=1.0).contains(&self.confidence) {
            return invalid(format!("confidence {} outside 0..=1", self.confidence));
        }
        let (lo, hi) = BLUR_STRENGTH_RANGE;
        if !(lo..=hi).contains(&self.blur_strength) {
            return invalid(format!(
                "blur strength {} outside {}..={}",
                self.blur_strength, lo, hi
            ));
        }
        if !(0.0..=1.0).contains(&self.face_padding) {
            return invalid(format!("face padding {} outside 0..=1", self.face_padding));
        }
        let (lo, hi) = PITCH_RANGE;
        if !(lo..=hi).contains(&self.pitch_semitones) {
            return invalid(format!(
                "pitch shift {} outside {}..={} semitones",
                self.pitch_semitones, lo, hi
            ));
        }
        if self.quality > MAX_QUALITY {
            return invalid(format!("quality {} above {}", self.quality, MAX_QUALITY));
        }
        Ok(())
    }

    /// Quality handed to the encoder. GPU runs trade a little quality for speed.
    pub fn effective_quality(&self) -> u32 {
        if self.device.is_gpu() {
            (self.quality + 3).min(GPU_QUALITY_CAP)
        } else {
            self.quality
        }
    }

    /// Whether regions of `category` are redacted for this job.
    pub fn blurs(&self, category: DetectionCategory) -> bool {
        match category {
            DetectionCategory::Face => self.blur_faces,
            DetectionCategory::LicensePlate => self.blur_plates,
        }
    }
}

/// Runtime tunables that are not part of the request itself.
#[derive(Debug, Clone)]
pub struct PipelineOptions {
    pub queue_capacity: usize,
    pub batch_size: usize,
    pub progress_every: usize,
    pub grace: Duration,
    pub preview: Option<PreviewSettings>,
    pub detection_log: Option<PathBuf>,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            queue_capacity: 32,
            batch_size: 5,
            progress_every: 5,
            grace: Duration::from_millis(2000),
            preview: None,
            detection_log: None,
        }
    }
}
