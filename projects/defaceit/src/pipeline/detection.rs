use crate::pipeline::types::{DetectedRegion, DetectionCategory, FrameBuffer};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

/// Produces labelled boxes for a frame. Implementations own their model state.
pub trait FrameDetector: Send {
    fn detect(
        &mut self,
        frame: &FrameBuffer,
        confidence: f32,
        iou_threshold: f32,
    ) -> Result<Vec<DetectedRegion>>;
}

/// Any closure with the right signature is a detector.
impl<F> FrameDetector for F
where
    F: FnMut(&FrameBuffer, f32, f32) -> Result<Vec<DetectedRegion>> + Send,
{
    fn detect(
        &mut self,
        frame: &FrameBuffer,
        confidence: f32,
        iou_threshold: f32,
    ) -> Result<Vec<DetectedRegion>> {
        self(frame, confidence, iou_threshold)
    }
}

/// Apply Non-Maximum Suppression to remove duplicate detections
pub fn nms(detections: Vec<DetectedRegion>, iou_threshold: f32) -> Vec<DetectedRegion> {
    if detections.is_empty() {
        return detections;
    }

    // Sort by confidence (highest first)
    let mut sorted = detections;
    sorted.sort_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut keep = Vec::new();
    let mut suppressed = vec![false; sorted.len()];

    for i in 0..sorted.len() {
        if suppressed[i] {
            continue;
        }

        keep.push(sorted[i]);

        for j in (i + 1)..sorted.len() {
            if !suppressed[j] && compute_iou(&sorted[i], &sorted[j]) > iou_threshold {
                suppressed[j] = true;
            }
        }
    }

    keep
}

/// Compute Intersection over Union between two boxes
fn compute_iou(a: &DetectedRegion, b: &DetectedRegion) -> f32 {
    let x1 = a.bbox.x1.max(b.bbox.x1);
    let y1 = a.bbox.y1.max(b.bbox.y1);
    let x2 = a.bbox.x2.min(b.bbox.x2);
    let y2 = a.bbox.y2.min(b.bbox.y2);

    if x2 <= x1 || y2 <= y1 {
        return 0.0;
    }

    let intersection = ((x2 - x1) * (y2 - y1)) as f32;
    let area_a = (a.bbox.width() * a.bbox.height()) as f32;
    let area_b = (b.bbox.width() * b.bbox.height()) as f32;
    let union = area_a + area_b - intersection;

    if union <= 0.0 {
        0.0
    } else {
        intersection / union
    }
}

/// One line of a detection log
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct FrameDetections {
    pub id: usize,
    pub detections: BTreeMap<DetectionCategory, Vec<DetectedRegion>>,
}

/// Writes one JSON line per processed frame.
pub struct DetectionRecorder {
    writer: BufWriter<File>,
}

impl DetectionRecorder {
    pub fn create(path: &Path) -> Result<Self> {
        let file = File::create(path)
            .with_context(|| format!("Failed to create detection log {}", path.display()))?;
        Ok(Self {
            writer: BufWriter::new(file),
        })
    }

    pub fn record(&mut self, frame: &FrameDetections) -> Result<()> {
        serde_json::to_writer(&mut self.writer, frame)?;
        self.writer.write_all(b"\n")?;
        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }
}

/// Serves detections from a log written by [`DetectionRecorder`], one frame per call.
pub struct ReplayDetector {
    category: DetectionCategory,
    frames: HashMap<usize, Vec<DetectedRegion>>,
    next_frame: usize,
}

impl ReplayDetector {
    pub fn load(path: &Path, category: DetectionCategory) -> Result<Self> {
        let file = File::open(path)
            .with_context(|| format!("Failed to open detection log {}", path.display()))?;
        let mut frames = HashMap::new();
        for (line_no, line) in BufReader::new(file).lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let record: FrameDetections = serde_json::from_str(&line)
                .with_context(|| format!("Malformed detection log line {}", line_no + 1))?;
            let regions = record
                .detections
                .get(&category)
                .cloned()
                .unwrap_or_default();
            frames.insert(record.id, regions);
        }

        tracing::info!(
            "Loaded {} recorded frames of {} detections from {}",
            frames.len(),
            category,
            path.display()
        );

        Ok(Self {
            category,
            frames,
            next_frame: 0,
        })
    }

    pub fn category(&self) -> DetectionCategory {
        self.category
    }
}

impl FrameDetector for ReplayDetector {
    fn detect(
        &mut self,
        _frame: &FrameBuffer,
        confidence: f32,
        iou_threshold: f32,
    ) -> Result<Vec<DetectedRegion>> {
        let id = self.next_frame;
        self.next_frame += 1;
        let regions = self
            .frames
            .get(&id)
            .map(|r| {
                r.iter()
                    .filter(|d| d.confidence >= confidence)
                    .copied()
                    .collect()
            })
            .unwrap_or_default();
        Ok(nms(regions, iou_threshold))
    }
}

#[cfg(feature = "rtdetr")]
pub use rtdetr::RtdetrDetector;

#[cfg(feature = "rtdetr")]
mod rtdetr {
    use super::{nms, FrameDetector};
    use crate::job::Device;
    use crate::pipeline::types::{DetectedRegion, FrameBuffer, PixelBox};
    use anyhow::Result;
    use image::DynamicImage;
    use usls::models::RTDETR;
    use usls::{Config, Image};

    /// RT-DETR through usls, with the aspect-ratio correction the model output needs.
    pub struct RtdetrDetector {
        model: RTDETR,
    }

    impl RtdetrDetector {
        pub fn new(model_path: &str, device: Device) -> Result<Self> {
            let config = Config::default()
                .with_model_file(model_path)
                .with_class_names(&usls::NAMES_COCO_80);

            #[cfg(target_os = "macos")]
            let config = match device {
                Device::Mps => config.with_model_device(usls::Device::CoreMl),
                _ => config,
            };
            #[cfg(not(target_os = "macos"))]
            let config = match device {
                Device::Cuda => config.with_model_device(usls::Device::Cuda(0)),
                _ => config,
            };

            let config = config.commit()?;
            let model = RTDETR::new(config)?;
            tracing::info!("Loaded RT-DETR model {} on {}", model_path, device);
            Ok(Self { model })
        }
    }

    impl FrameDetector for RtdetrDetector {
        fn detect(
            &mut self,
            frame: &FrameBuffer,
            confidence: f32,
            iou_threshold: f32,
        ) -> Result<Vec<DetectedRegion>> {
            let img_w = frame.width() as f32;
            let img_h = frame.height() as f32;
            let (x_corr, y_corr) = if img_w > img_h {
                (img_w / img_h, 1.0)
            } else if img_h > img_w {
                (1.0, img_h / img_w)
            } else {
                (1.0, 1.0)
            };

            let image = Image::from(DynamicImage::ImageRgb8(frame.to_rgb_image()?));
            let results = self.model.forward(&[image])?;

            let regions = results
                .into_iter()
                .next()
                .map(|y| y.hbbs)
                .unwrap_or_default()
                .into_iter()
                .filter(|hbb| hbb.confidence().unwrap_or(0.0) >= confidence)
                .map(|hbb| {
                    let x1 = hbb.xmin() * x_corr;
                    let y1 = hbb.ymin() * y_corr;
                    let x2 = x1 + hbb.width() * x_corr;
                    let y2 = y1 + hbb.height() * y_corr;
                    DetectedRegion {
                        class_id: hbb.id().unwrap_or(0) as u32,
                        bbox: PixelBox::new(x1 as i32, y1 as i32, x2 as i32, y2 as i32),
                        confidence: hbb.confidence().unwrap_or(0.0),
                    }
                })
                .collect();

            Ok(nms(regions, iou_threshold))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::types::PixelBox;

    fn region(x1: i32, y1: i32, x2: i32, y2: i32, confidence: f32) -> DetectedRegion {
        DetectedRegion {
            class_id: 0,
            bbox: PixelBox::new(x1, y1, x2, y2),
            confidence,
        }
    }

    #[test]
    fn test_nms_basic() {
        let d1 = region(10, 10, 50, 50, 0.9);
        let d2 = region(15, 15, 55, 55, 0.8);
        let d3 = region(100, 100, 120, 120, 0.7);
        let result = nms(vec![d2, d3, d1], 0.5);
        assert_eq!(result, vec![d1, d3]);
    }

    #[test]
    fn test_replay_round_trips_recorder_output() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("detections.jsonl");

        let mut recorder = DetectionRecorder::create(&path).unwrap();
        for id in 0..3 {
            let mut frame = FrameDetections {
                id,
                ..Default::default()
            };
            if id == 1 {
                frame.detections.insert(
                    DetectionCategory::Face,
                    vec![region(1, 2, 3, 4, 0.9), region(5, 6, 7, 8, 0.1)],
                );
                frame
                    .detections
                    .insert(DetectionCategory::LicensePlate, vec![region(9, 9, 20, 14, 0.8)]);
            }
            recorder.record(&frame).unwrap();
        }
        recorder.flush().unwrap();

        let mut faces = ReplayDetector::load(&path, DetectionCategory::Face).unwrap();
        let blank = FrameBuffer::filled(4, 4, [0, 0, 0]);
        assert!(faces.detect(&blank, 0.5, 0.5).unwrap().is_empty());
        assert_eq!(
            faces.detect(&blank, 0.5, 0.5).unwrap(),
            vec![region(1, 2, 3, 4, 0.9)]
        );
        assert!(faces.detect(&blank, 0.5, 0.5).unwrap().is_empty());
        // Past the end of the log
        assert!(faces.detect(&blank, 0.5, 0.5).unwrap().is_empty());

        let mut plates = ReplayDetector::load(&path, DetectionCategory::LicensePlate).unwrap();
        plates.detect(&blank, 0.5, 0.5).unwrap();
        assert_eq!(plates.detect(&blank, 0.5, 0.5).unwrap().len(), 1);
    }

    #[test]
    fn test_closure_detector() {
        let mut calls = 0;
        let mut detector = |_: &FrameBuffer, conf: f32, iou: f32| {
            calls += 1;
            assert_eq!(iou, 0.5);
            Ok::<_, anyhow::Error>(vec![region(0, 0, 2, 2, conf)])
        };
        let frame = FrameBuffer::filled(2, 2, [0, 0, 0]);
        let found = FrameDetector::detect(&mut detector, &frame, 0.3, 0.5).unwrap();
        assert_eq!(found[0].confidence, 0.3);
        drop(detector);
        assert_eq!(calls, 1);
    }
}
