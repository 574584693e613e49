use crate::pipeline::types::{FrameBuffer, PixelBox};
use image::imageops::{self, FilterType, GaussianBlurParameters};
use image::{GenericImageView, ImageBuffer, Rgb, RgbImage};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Linear downsample factor used by pixelation.
pub const PIXELATE_FACTOR: u32 = 10;

/// Redaction filter. Unrecognised names fall back to Gaussian.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(from = "String", rename_all = "lowercase")]
pub enum BlurKind {
    #[default]
    Gaussian,
    Pixelate,
}

impl BlurKind {
    pub fn parse_lenient(name: &str) -> Self {
        match name.trim().to_ascii_lowercase().as_str() {
            "pixelate" => Self::Pixelate,
            "gaussian" => Self::Gaussian,
            other => {
                tracing::warn!("Unknown blur kind '{}', using gaussian", other);
                Self::Gaussian
            }
        }
    }
}

impl From<String> for BlurKind {
    fn from(name: String) -> Self {
        Self::parse_lenient(&name)
    }
}

impl fmt::Display for BlurKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Gaussian => f.write_str("gaussian"),
            Self::Pixelate => f.write_str("pixelate"),
        }
    }
}

/// Gaussian kernels must have odd size; even strengths are bumped by one.
pub fn odd_kernel_size(strength: u32) -> u32 {
    if strength % 2 == 0 {
        strength + 1
    } else {
        strength
    }
}

/// Packed BGR frame seen through `image`. The filters are per-channel, so the
/// channel order does not matter.
type FrameView<'a> = ImageBuffer<Rgb<u8>, &'a mut [u8]>;

/// Obscures rectangular regions of a frame in place.
pub struct RegionBlur {
    kind: BlurKind,
    kernel_size: u32,
    params: GaussianBlurParameters,
}

impl RegionBlur {
    pub fn new(kind: BlurKind, strength: u32) -> Self {
        let kernel_size = odd_kernel_size(strength);
        Self {
            kind,
            kernel_size,
            params: GaussianBlurParameters::new_from_kernel_size(kernel_size as f32),
        }
    }

    pub fn kind(&self) -> BlurKind {
        self.kind
    }

    pub fn kernel_size(&self) -> u32 {
        self.kernel_size
    }

    /// Expands `bbox` by `padding` of its own size on each side and clamps it to the frame.
    /// Returns `None` for a degenerate result.
    pub fn padded_region(bbox: PixelBox, padding: f32, width: u32, height: u32) -> Option<PixelBox> {
        let mut region = bbox;
        if padding > 0.0 {
            let pad_x = (bbox.width() as f32 * padding) as i32;
            let pad_y = (bbox.height() as f32 * padding) as i32;
            region = PixelBox::new(
                bbox.x1 - pad_x,
                bbox.y1 - pad_y,
                bbox.x2 + pad_x,
                bbox.y2 + pad_y,
            );
        }

        let region = region.clamp_to(width, height);
        if region.is_empty() {
            None
        } else {
            Some(region)
        }
    }

    /// Blurs `bbox` (plus padding) in place. Returns the region actually modified,
    /// or `None` when the clamped box is degenerate and the frame is left untouched.
    pub fn apply(&self, frame: &mut FrameBuffer, bbox: PixelBox, padding: f32) -> Option<PixelBox> {
        let region = Self::padded_region(bbox, padding, frame.width(), frame.height())?;
        let (width, height) = (frame.width(), frame.height());
        let mut view = FrameView::from_raw(width, height, frame.as_bytes_mut())?;

        let (x, y) = (region.x1 as u32, region.y1 as u32);
        let (w, h) = (region.width() as u32, region.height() as u32);
        let roi = imageops::crop_imm(&view, x, y, w, h);
        let redacted = match self.kind {
            BlurKind::Gaussian => imageops::blur_advanced(&*roi, self.params),
            BlurKind::Pixelate => pixelate(&*roi),
        };
        imageops::replace(&mut view, &redacted, x as i64, y as i64);
        Some(region)
    }
}

/// Samples the region at 1/`PIXELATE_FACTOR` with bilinear interpolation, then scales
/// back up with nearest-neighbour so each sample becomes a solid block.
fn pixelate<I: GenericImageView<Pixel = Rgb<u8>>>(roi: &I) -> RgbImage {
    let (w, h) = roi.dimensions();
    let sw = (w / PIXELATE_FACTOR).max(1);
    let sh = (h / PIXELATE_FACTOR).max(1);

    // Two-tap sampling at block centres keeps both taps inside one block on re-application.
    let small = RgbImage::from_fn(sw, sh, |sx, sy| {
        let u = (sx as f32 + 0.5) / sw as f32;
        let v = (sy as f32 + 0.5) / sh as f32;
        imageops::sample_bilinear(roi, u, v)
            .unwrap_or_else(|| roi.get_pixel(sx * w / sw, sy * h / sh))
    });

    imageops::resize(&small, w, h, FilterType::Nearest)
}
