use crate::job::{Device, Job, PipelineOptions};
use crate::pipeline::blur::BlurKind;
use crate::pipeline::detection::{FrameDetector, ReplayDetector};
use crate::pipeline::processor::CategoryDetector;
use crate::pipeline::reader::PreviewSettings;
use crate::pipeline::types::DetectionCategory;
use crate::video::SourceBackend;
use anyhow::{bail, Context, Result};
use clap::{Parser, ValueEnum};
use std::path::PathBuf;
use std::time::Duration;

/// Where detections come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum DetectorKind {
    /// RT-DETR models (requires the `rtdetr` feature)
    Rtdetr,
    /// Detections recorded by an earlier run with --record-detections
    Replay,
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Blur faces and licence plates in a video", long_about = None)]
pub struct Args {
    /// Video to redact
    #[arg(short, long, env = "DEFACEIT_INPUT")]
    pub input: PathBuf,

    /// Where the redacted video is written
    #[arg(short, long, env = "DEFACEIT_OUTPUT")]
    pub output: PathBuf,

    /// ffmpeg executable used for encoding and every audio step
    #[arg(long, env = "DEFACEIT_FFMPEG", default_value = "ffmpeg")]
    pub ffmpeg: PathBuf,

    /// Minimum detector score
    #[arg(long, env = "DEFACEIT_CONFIDENCE", default_value_t = 0.15)]
    pub confidence: f32,

    /// gaussian or pixelate; anything else means gaussian
    #[arg(long, env = "DEFACEIT_BLUR", default_value = "gaussian")]
    pub blur: String,

    /// Gaussian kernel size (21-101, made odd)
    #[arg(long, env = "DEFACEIT_BLUR_STRENGTH", default_value_t = 51)]
    pub blur_strength: u32,

    /// Extra margin around faces, as a fraction of the box size
    #[arg(long, env = "DEFACEIT_FACE_PADDING", default_value_t = 0.2)]
    pub face_padding: f32,

    /// Leave faces untouched
    #[arg(long, env = "DEFACEIT_NO_FACES")]
    pub no_faces: bool,

    /// Leave licence plates untouched
    #[arg(long, env = "DEFACEIT_NO_PLATES")]
    pub no_plates: bool,

    /// Audio pitch shift in semitones (-12 to 12)
    #[arg(long, env = "DEFACEIT_PITCH", default_value_t = 0.0, allow_hyphen_values = true)]
    pub pitch: f64,

    /// Encoder CRF, lower is better (0-51)
    #[arg(long, env = "DEFACEIT_QUALITY", default_value_t = 22)]
    pub quality: u32,

    /// Keep the single-pass encode instead of re-encoding at the end
    #[arg(long, env = "DEFACEIT_NO_REENCODE")]
    pub no_reencode: bool,

    /// Compute device for detection
    #[arg(long, env = "DEFACEIT_DEVICE", value_enum, default_value_t = Device::Cpu)]
    pub device: Device,

    /// Frame decoder: ffmpeg or opencv
    #[arg(long, env = "DEFACEIT_BACKEND", default_value = "ffmpeg")]
    pub backend: SourceBackend,

    /// Detection backend
    #[arg(long, env = "DEFACEIT_DETECTOR", value_enum, default_value_t = DetectorKind::Rtdetr)]
    pub detector: DetectorKind,

    /// Face model for the rtdetr backend
    #[arg(long, env = "DEFACEIT_FACE_MODEL")]
    pub face_model: Option<String>,

    /// Licence plate model for the rtdetr backend
    #[arg(long, env = "DEFACEIT_PLATE_MODEL")]
    pub plate_model: Option<String>,

    /// Detection log to replay with --detector replay
    #[arg(long, env = "DEFACEIT_DETECTIONS")]
    pub detections: Option<PathBuf>,

    /// Write every frame's detections to this JSON Lines file
    #[arg(long, env = "DEFACEIT_RECORD_DETECTIONS")]
    pub record_detections: Option<PathBuf>,

    /// Write a JSON run report here
    #[arg(long, env = "DEFACEIT_REPORT")]
    pub report: Option<PathBuf>,

    /// Save redacted preview frames to this directory
    #[arg(long, env = "DEFACEIT_PREVIEW_DIR")]
    pub preview_dir: Option<PathBuf>,

    /// Save one preview every N frames
    #[arg(long, env = "DEFACEIT_PREVIEW_EVERY", default_value_t = 30)]
    pub preview_every: usize,

    /// Frames buffered between the detector and the encoder
    #[arg(long, env = "DEFACEIT_QUEUE_SIZE", default_value_t = 32)]
    pub queue_size: usize,

    /// Milliseconds a cancelled subprocess gets before it is killed
    #[arg(long, env = "DEFACEIT_GRACE_MS", default_value_t = 2000)]
    pub grace_ms: u64,
}

impl Args {
    pub fn parse_args() -> Self {
        Self::parse()
    }

    pub fn to_job(&self) -> Job {
        Job {
            input: self.input.clone(),
            output: self.output.clone(),
            ffmpeg: self.ffmpeg.clone(),
            confidence: self.confidence,
            blur_kind: BlurKind::parse_lenient(&self.blur),
            blur_strength: self.blur_strength,
            face_padding: self.face_padding,
            blur_faces: !self.no_faces,
            blur_plates: !self.no_plates,
            pitch_semitones: self.pitch,
            quality: self.quality,
            reencode: !self.no_reencode,
            device: self.device,
        }
    }

    pub fn pipeline_options(&self) -> PipelineOptions {
        PipelineOptions {
            queue_capacity: self.queue_size.max(1),
            grace: Duration::from_millis(self.grace_ms),
            preview: self.preview_dir.as_ref().map(|dir| PreviewSettings {
                dir: dir.clone(),
                every: self.preview_every.max(1),
            }),
            detection_log: self.record_detections.clone(),
            ..Default::default()
        }
    }

    fn categories(&self) -> Vec<DetectionCategory> {
        let mut categories = Vec::new();
        if !self.no_faces {
            categories.push(DetectionCategory::Face);
        }
        if !self.no_plates {
            categories.push(DetectionCategory::LicensePlate);
        }
        categories
    }

    /// One detector per enabled category, bound to `device`.
    pub fn build_detectors(&self, device: Device) -> Result<Vec<CategoryDetector>> {
        let mut detectors = Vec::new();
        for category in self.categories() {
            let detector: Box<dyn FrameDetector> = match self.detector {
                DetectorKind::Replay => {
                    let Some(path) = &self.detections else {
                        bail!("--detector replay needs --detections <file>");
                    };
                    Box::new(ReplayDetector::load(path, category).with_context(|| {
                        format!("Failed to load {} detections", category)
                    })?)
                }
                DetectorKind::Rtdetr => self.rtdetr_detector(category, device)?,
            };
            tracing::info!("{} detector: {:?} on {}", category, self.detector, device);
            detectors.push(CategoryDetector::new(category, detector));
        }
        Ok(detectors)
    }

    #[cfg(feature = "rtdetr")]
    fn rtdetr_detector(
        &self,
        category: DetectionCategory,
        device: Device,
    ) -> Result<Box<dyn FrameDetector>> {
        let (model, flag) = match category {
            DetectionCategory::Face => (&self.face_model, "--face-model"),
            DetectionCategory::LicensePlate => (&self.plate_model, "--plate-model"),
        };
        let Some(model) = model else {
            bail!("{} detection needs {} <path>", category, flag);
        };
        Ok(Box::new(crate::pipeline::detection::RtdetrDetector::new(
            model, device,
        )?))
    }

    #[cfg(not(feature = "rtdetr"))]
    fn rtdetr_detector(
        &self,
        category: DetectionCategory,
        _device: Device,
    ) -> Result<Box<dyn FrameDetector>> {
        bail!(
            "{} detection with rtdetr is not compiled in; rebuild with --features rtdetr or use --detector replay",
            category
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::detection::{DetectionRecorder, FrameDetections};

    fn parse(extra: &[&str]) -> Args {
        let mut argv = vec!["defaceit", "-i", "in.mp4", "-o", "out.mp4"];
        argv.extend_from_slice(extra);
        Args::try_parse_from(argv).unwrap()
    }

    #[test]
    fn test_defaults_map_to_job_defaults() {
        let job = parse(&[]).to_job();
        let defaults = Job::new("in.mp4", "out.mp4");
        assert_eq!(job.confidence, defaults.confidence);
        assert_eq!(job.blur_strength, defaults.blur_strength);
        assert_eq!(job.face_padding, defaults.face_padding);
        assert_eq!(job.quality, defaults.quality);
        assert_eq!(job.blur_kind, BlurKind::Gaussian);
        assert!(job.reencode && job.blur_faces && job.blur_plates);
        job.validate().unwrap();
    }

    #[test]
    fn test_flags() {
        let args = parse(&[
            "--blur",
            "Pixelate",
            "--pitch",
            "-3.5",
            "--no-plates",
            "--no-reencode",
            "--device",
            "cuda",
            "--preview-dir",
            "previews",
            "--preview-every",
            "0",
        ]);
        let job = args.to_job();
        assert_eq!(job.blur_kind, BlurKind::Pixelate);
        assert_eq!(job.pitch_semitones, -3.5);
        assert!(!job.blur_plates);
        assert!(!job.reencode);
        assert_eq!(job.device, Device::Cuda);

        let options = args.pipeline_options();
        assert_eq!(options.preview.unwrap().every, 1);
        assert_eq!(options.batch_size, 5);
        assert_eq!(args.categories(), vec![DetectionCategory::Face]);
    }

    #[test]
    fn test_unknown_blur_is_gaussian() {
        assert_eq!(parse(&["--blur", "swirl"]).to_job().blur_kind, BlurKind::Gaussian);
    }

    #[test]
    fn test_replay_requires_log() {
        let args = parse(&["--detector", "replay"]);
        assert!(args.build_detectors(Device::Cpu).is_err());
    }

    #[test]
    fn test_replay_detectors_per_category() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("detections.jsonl");
        let mut recorder = DetectionRecorder::create(&log).unwrap();
        recorder.record(&FrameDetections::default()).unwrap();
        recorder.flush().unwrap();

        let log_arg = log.to_str().unwrap();
        let args = parse(&["--detector", "replay", "--detections", log_arg]);
        let detectors = args.build_detectors(Device::Cpu).unwrap();
        let categories: Vec<_> = detectors.iter().map(|d| d.category).collect();
        assert_eq!(
            categories,
            vec![DetectionCategory::Face, DetectionCategory::LicensePlate]
        );
    }
}
