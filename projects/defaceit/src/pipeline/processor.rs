use crate::pipeline::blur::RegionBlur;
use crate::pipeline::detection::{DetectionRecorder, FrameDetections, FrameDetector};
use crate::pipeline::types::{DetectedRegion, DetectionCategory, FrameBuffer, PixelBox};
use anyhow::{Context, Result};

/// Overlap threshold handed to every detector call.
pub const NMS_IOU_THRESHOLD: f32 = 0.5;
/// Plates ignore the job's padding and always use this.
pub const PLATE_PADDING: f32 = 0.1;
/// COCO "person"; a face is approximated from the top of the body box.
pub const PERSON_CLASS_ID: u32 = 0;

pub struct CategoryDetector {
    pub category: DetectionCategory,
    pub detector: Box<dyn FrameDetector>,
}

impl CategoryDetector {
    pub fn new(category: DetectionCategory, detector: Box<dyn FrameDetector>) -> Self {
        Self { category, detector }
    }
}

/// Box to blur and padding to apply for one detection.
pub fn blur_target(
    category: DetectionCategory,
    region: &DetectedRegion,
    frame_width: u32,
    face_padding: f32,
) -> (PixelBox, f32) {
    let bbox = region.bbox;
    match category {
        DetectionCategory::Face if region.class_id == PERSON_CLASS_ID => {
            let widen = (bbox.width() as f32 * 0.1) as i32;
            let upper = PixelBox::new(
                (bbox.x1 - widen).max(0),
                bbox.y1,
                (bbox.x2 + widen).min(frame_width as i32),
                bbox.y1 + (bbox.height() as f32 * 0.5) as i32,
            );
            (upper, face_padding)
        }
        DetectionCategory::Face => (bbox, face_padding),
        DetectionCategory::LicensePlate => (bbox, PLATE_PADDING),
    }
}

/// Runs every enabled detector on a frame and blurs what they find.
pub struct FrameProcessor {
    detectors: Vec<CategoryDetector>,
    blur: RegionBlur,
    confidence: f32,
    face_padding: f32,
    recorder: Option<DetectionRecorder>,
    frame_id: usize,
}

impl FrameProcessor {
    pub fn new(
        detectors: Vec<CategoryDetector>,
        blur: RegionBlur,
        confidence: f32,
        face_padding: f32,
    ) -> Self {
        Self {
            detectors,
            blur,
            confidence,
            face_padding,
            recorder: None,
            frame_id: 0,
        }
    }

    pub fn with_recorder(mut self, recorder: DetectionRecorder) -> Self {
        self.recorder = Some(recorder);
        self
    }

    pub fn frames_processed(&self) -> usize {
        self.frame_id
    }

    pub fn process(&mut self, mut frame: FrameBuffer) -> Result<FrameBuffer> {
        let mut record = FrameDetections {
            id: self.frame_id,
            ..Default::default()
        };

        for entry in self.detectors.iter_mut() {
            let regions = entry
                .detector
                .detect(&frame, self.confidence, NMS_IOU_THRESHOLD)
                .with_context(|| format!("{} detector failed on frame {}", entry.category, self.frame_id))?;

            for region in &regions {
                let (bbox, padding) =
                    blur_target(entry.category, region, frame.width(), self.face_padding);
                if self.blur.apply(&mut frame, bbox, padding).is_none() {
                    tracing::debug!(
                        "Skipping degenerate {} region {:?} on frame {}",
                        entry.category,
                        bbox,
                        self.frame_id
                    );
                }
            }

            if self.recorder.is_some() {
                record.detections.insert(entry.category, regions);
            }
        }

        if let Some(recorder) = self.recorder.as_mut() {
            recorder.record(&record)?;
        }

        self.frame_id += 1;
        Ok(frame)
    }

    /// Flush the detection log, if any.
    pub fn finish(&mut self) -> Result<()> {
        if let Some(recorder) = self.recorder.as_mut() {
            recorder.flush()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::blur::BlurKind;
    use crate::pipeline::detection::ReplayDetector;

    fn noise_frame(width: u32, height: u32) -> FrameBuffer {
        let mut seed: u32 = 0x1234_5678;
        let data = (0..width * height * 3)
            .map(|_| {
                seed ^= seed << 13;
                seed ^= seed >> 17;
                seed ^= seed << 5;
                (seed >> 24) as u8
            })
            .collect();
        FrameBuffer::new(width, height, data).unwrap()
    }

    fn fixed(region: DetectedRegion) -> Box<dyn FrameDetector> {
        Box::new(move |_: &FrameBuffer, _: f32, _: f32| Ok::<_, anyhow::Error>(vec![region]))
    }

    #[test]
    fn test_person_box_blurs_only_upper_widened_padded_region() {
        let source = noise_frame(64, 64);
        let region = DetectedRegion {
            class_id: PERSON_CLASS_ID,
            bbox: PixelBox::new(10, 10, 30, 40),
            confidence: 0.9,
        };
        let mut processor = FrameProcessor::new(
            vec![CategoryDetector::new(DetectionCategory::Face, fixed(region))],
            RegionBlur::new(BlurKind::Gaussian, 51),
            0.15,
            0.2,
        );

        let out = processor.process(source.clone()).unwrap();

        // upper half (10..25), widened by 2 (8..32), padded by 4/3
        let expected = PixelBox::new(4, 7, 36, 28);
        let mut changed_inside = false;
        for y in 0..64 {
            for x in 0..64 {
                let before = source.pixel(x, y);
                let after = out.pixel(x, y);
                if expected.contains(x as i32, y as i32) {
                    changed_inside |= before != after;
                } else {
                    assert_eq!(before, after, "pixel ({x},{y}) outside the region changed");
                }
            }
        }
        assert!(changed_inside);
    }

    #[test]
    fn test_blur_target_rules() {
        let person = DetectedRegion {
            class_id: PERSON_CLASS_ID,
            bbox: PixelBox::new(0, 0, 50, 40),
            confidence: 0.5,
        };
        let (bbox, padding) = blur_target(DetectionCategory::Face, &person, 52, 0.3);
        assert_eq!(bbox, PixelBox::new(0, 0, 52, 20));
        assert_eq!(padding, 0.3);

        let face = DetectedRegion { class_id: 1, ..person };
        assert_eq!(
            blur_target(DetectionCategory::Face, &face, 52, 0.3),
            (person.bbox, 0.3)
        );

        let plate = DetectedRegion { class_id: 0, ..person };
        assert_eq!(
            blur_target(DetectionCategory::LicensePlate, &plate, 52, 0.3),
            (person.bbox, PLATE_PADDING)
        );
    }

    #[test]
    fn test_degenerate_detection_is_skipped() {
        let source = noise_frame(16, 16);
        let region = DetectedRegion {
            class_id: 3,
            bbox: PixelBox::new(20, 20, 30, 30),
            confidence: 0.9,
        };
        let mut processor = FrameProcessor::new(
            vec![CategoryDetector::new(DetectionCategory::LicensePlate, fixed(region))],
            RegionBlur::new(BlurKind::Pixelate, 21),
            0.15,
            0.2,
        );
        assert_eq!(processor.process(source.clone()).unwrap(), source);
        assert_eq!(processor.frames_processed(), 1);
    }

    #[test]
    fn test_recorded_detections_replay() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("faces.jsonl");
        let region = DetectedRegion {
            class_id: 1,
            bbox: PixelBox::new(2, 2, 12, 12),
            confidence: 0.7,
        };

        let mut recording = FrameProcessor::new(
            vec![CategoryDetector::new(DetectionCategory::Face, fixed(region))],
            RegionBlur::new(BlurKind::Pixelate, 21),
            0.15,
            0.0,
        )
        .with_recorder(DetectionRecorder::create(&log).unwrap());
        let first = recording.process(noise_frame(16, 16)).unwrap();
        recording.finish().unwrap();

        let replay = ReplayDetector::load(&log, DetectionCategory::Face).unwrap();
        let mut replaying = FrameProcessor::new(
            vec![CategoryDetector::new(DetectionCategory::Face, Box::new(replay))],
            RegionBlur::new(BlurKind::Pixelate, 21),
            0.15,
            0.0,
        );
        assert_eq!(replaying.process(noise_frame(16, 16)).unwrap(), first);
    }
}
