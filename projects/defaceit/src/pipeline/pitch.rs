// In-process pitch shift: WSOLA time-stretch followed by a sinc resample back to the original length

use crate::pipeline::stage::Flow;
use crate::pipeline::types::CancelHandle;
use anyhow::{anyhow, Context, Result};
use hound::{SampleFormat, WavReader, WavSpec, WavWriter};
use rubato::{
    Resampler, SincFixedIn, SincInterpolationParameters, SincInterpolationType, WindowFunction,
};
use std::fs;
use std::path::Path;

/// Output frames written between cancellation checks.
const WRITE_CHUNK: usize = 4096;

/// Frequency multiplier for a semitone offset.
pub fn pitch_ratio(semitones: f64) -> f64 {
    2f64.powf(semitones / 12.0)
}

/// Shift every channel by `semitones`, keeping the duration.
/// Returns `None` if `cancel` fires before the stretch finishes.
pub fn shift_channels(
    channels: &[Vec<f32>],
    sample_rate: u32,
    semitones: f64,
    cancel: &CancelHandle,
) -> Result<Option<Vec<Vec<f32>>>> {
    let len = channels.first().map(Vec::len).unwrap_or(0);
    let ratio = pitch_ratio(semitones);
    if len == 0 || (ratio - 1.0).abs() < 1e-9 {
        return Ok(Some(channels.to_vec()));
    }

    // ~25ms analysis frames
    let frame = ((sample_rate / 40).max(64) as usize).next_power_of_two();
    let Some(stretched) = time_stretch(channels, ratio, frame, cancel) else {
        return Ok(None);
    };
    let resampled = resample(&stretched, 1.0 / ratio)?;

    Ok(Some(
        resampled
            .into_iter()
            .map(|mut ch| {
                ch.resize(len, 0.0);
                ch
            })
            .collect(),
    ))
}

fn hann(n: usize) -> Vec<f32> {
    (0..n)
        .map(|i| 0.5 - 0.5 * (2.0 * std::f32::consts::PI * i as f32 / n as f32).cos())
        .collect()
}

#[inline]
fn at(buf: &[f32], idx: isize) -> f32 {
    if idx < 0 {
        0.0
    } else {
        buf.get(idx as usize).copied().unwrap_or(0.0)
    }
}

fn correlation(mono: &[f32], a: isize, b: isize, len: usize) -> f32 {
    (0..len)
        .step_by(2)
        .map(|i| at(mono, a + i as isize) * at(mono, b + i as isize))
        .sum()
}

/// Waveform-similarity overlap-add: output is `ratio` times as long at the same pitch.
fn time_stretch(
    channels: &[Vec<f32>],
    ratio: f64,
    frame: usize,
    cancel: &CancelHandle,
) -> Option<Vec<Vec<f32>>> {
    let len = channels[0].len();
    let out_len = (len as f64 * ratio).round() as usize;
    let synthesis_hop = frame / 2;
    let analysis_hop = synthesis_hop as f64 / ratio;
    // A frame may slide up to an eighth of its length from its nominal position.
    let tolerance = (frame / 8) as isize;
    let frames = out_len.div_ceil(synthesis_hop) + 1;

    // Alignment is searched on the mixdown so every channel uses the same positions.
    let mono: Vec<f32> = (0..len)
        .map(|i| channels.iter().map(|c| c[i]).sum::<f32>() / channels.len() as f32)
        .collect();

    let window = hann(frame);
    let total = frames * synthesis_hop + frame;
    let mut out = vec![vec![0.0f32; total]; channels.len()];
    let mut weight = vec![0.0f32; total];
    let mut prev: Option<isize> = None;

    for k in 0..frames {
        if cancel.is_cancelled() {
            return None;
        }
        let nominal = (k as f64 * analysis_hop).round() as isize;
        let pos = match prev {
            None => nominal,
            Some(p) => {
                let natural = p + synthesis_hop as isize;
                let score = |delta: isize| correlation(&mono, natural, nominal + delta, frame);

                // Coarse pass every 4th offset across the whole window.
                let mut best = (-tolerance..=tolerance)
                    .step_by(4)
                    .map(|d| (d, score(d)))
                    .fold((0, f32::MIN), |acc, c| if c.1 > acc.1 { c } else { acc });
                // Then every offset between the coarse neighbours, still inside the window.
                for d in (best.0 - 3)..=(best.0 + 3) {
                    if d.abs() > tolerance {
                        continue;
                    }
                    let s = score(d);
                    if s > best.1 {
                        best = (d, s);
                    }
                }
                nominal + best.0
            }
        };

        let offset = k * synthesis_hop;
        for (ch, input) in channels.iter().enumerate() {
            for (i, w) in window.iter().enumerate() {
                out[ch][offset + i] += at(input, pos + i as isize) * w;
            }
        }
        for (i, w) in window.iter().enumerate() {
            weight[offset + i] += w;
        }
        prev = Some(pos);
    }

    for ch in out.iter_mut() {
        for (sample, w) in ch.iter_mut().zip(&weight) {
            if *w > 1e-3 {
                *sample /= w;
            }
        }
        ch.truncate(out_len);
    }
    Some(out)
}

fn resample(channels: &[Vec<f32>], ratio: f64) -> Result<Vec<Vec<f32>>> {
    let params = SincInterpolationParameters {
        sinc_len: 256,
        f_cutoff: 0.95,
        interpolation: SincInterpolationType::Linear,
        oversampling_factor: 256,
        window: WindowFunction::BlackmanHarris2,
    };

    // Trailing silence so the filter delay can be trimmed without losing the tail.
    let pad = params.sinc_len * 2;
    let waves_in: Vec<Vec<f32>> = channels
        .iter()
        .map(|c| {
            let mut padded = c.clone();
            padded.resize(c.len() + pad, 0.0);
            padded
        })
        .collect();
    let chunk = waves_in[0].len();

    let mut resampler = SincFixedIn::<f32>::new(ratio, 2.0, params, chunk, channels.len())
        .map_err(|e| anyhow!("Failed to build resampler: {}", e))?;
    let delay = resampler.output_delay();
    let waves_out = resampler
        .process(&waves_in, None)
        .map_err(|e| anyhow!("Resampling failed: {}", e))?;

    let target = (channels[0].len() as f64 * ratio).round() as usize;
    Ok(waves_out
        .into_iter()
        .map(|ch| ch.into_iter().skip(delay).take(target).collect())
        .collect())
}

/// Read a WAV, shift it, and write 16-bit PCM with the same layout.
///
/// `cancel` is polled once per analysis frame and while writing. A cancelled shift
/// returns [`Flow::Cancelled`] and leaves no file at `output`.
pub fn shift_wav_file(
    input: &Path,
    output: &Path,
    semitones: f64,
    cancel: &CancelHandle,
) -> Result<Flow> {
    let mut reader = WavReader::open(input)
        .with_context(|| format!("Failed to open {}", input.display()))?;
    let spec = reader.spec();
    let channel_count = spec.channels.max(1) as usize;

    let samples: Vec<f32> = match (spec.sample_format, spec.bits_per_sample) {
        (SampleFormat::Float, 32) => reader.samples::<f32>().collect::<Result<Vec<_>, _>>()?,
        (SampleFormat::Int, bits) if (8..=32).contains(&bits) => {
            let scale = (1i64 << (bits - 1)) as f32;
            reader
                .samples::<i32>()
                .map(|s| s.map(|v| v as f32 / scale))
                .collect::<Result<Vec<_>, _>>()?
        }
        (format, bits) => {
            return Err(anyhow!("Unsupported WAV format: {:?} {}-bit", format, bits));
        }
    };

    let frames = samples.len() / channel_count;
    let mut channels = vec![Vec::with_capacity(frames); channel_count];
    for chunk in samples.chunks_exact(channel_count) {
        for (ch, s) in chunk.iter().enumerate() {
            channels[ch].push(*s);
        }
    }

    tracing::info!(
        "Shifting {} by {:+.1} semitones ({} channels, {} Hz, {} frames)",
        input.display(),
        semitones,
        channel_count,
        spec.sample_rate,
        frames
    );
    let Some(shifted) = shift_channels(&channels, spec.sample_rate, semitones, cancel)? else {
        tracing::info!("Pitch shift of {} cancelled", input.display());
        return Ok(Flow::Cancelled);
    };
    if cancel.is_cancelled() {
        return Ok(Flow::Cancelled);
    }

    let out_spec = WavSpec {
        channels: spec.channels,
        sample_rate: spec.sample_rate,
        bits_per_sample: 16,
        sample_format: SampleFormat::Int,
    };
    let mut writer = WavWriter::create(output, out_spec)
        .with_context(|| format!("Failed to create {}", output.display()))?;
    for i in 0..frames {
        if i % WRITE_CHUNK == 0 && cancel.is_cancelled() {
            drop(writer);
            discard(output);
            return Ok(Flow::Cancelled);
        }
        for ch in &shifted {
            let v = (ch[i].clamp(-1.0, 1.0) * i16::MAX as f32).round() as i16;
            writer.write_sample(v)?;
        }
    }
    writer.finalize()?;

    if cancel.is_cancelled() {
        discard(output);
        return Ok(Flow::Cancelled);
    }
    Ok(Flow::Completed)
}

fn discard(path: &Path) {
    if let Err(e) = fs::remove_file(path) {
        tracing::warn!("Failed to remove {}: {}", path.display(), e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sine(freq: f32, sample_rate: u32, len: usize) -> Vec<f32> {
        (0..len)
            .map(|i| 0.5 * (2.0 * std::f32::consts::PI * freq * i as f32 / sample_rate as f32).sin())
            .collect()
    }

    /// Frequency estimate from rising zero crossings over the middle half.
    fn dominant_frequency(samples: &[f32], sample_rate: u32) -> f32 {
        let start = samples.len() / 4;
        let end = samples.len() * 3 / 4;
        let crossings = samples[start..end]
            .windows(2)
            .filter(|w| w[0] < 0.0 && w[1] >= 0.0)
            .count();
        crossings as f32 * sample_rate as f32 / (end - start) as f32
    }

    #[test]
    fn test_pitch_ratio() {
        assert!((pitch_ratio(7.0) - 1.4983).abs() < 1e-4);
        assert_eq!(pitch_ratio(-12.0), 0.5);
        assert_eq!(pitch_ratio(12.0), 2.0);
        assert_eq!(pitch_ratio(0.0), 1.0);
    }

    #[test]
    fn test_octave_up_doubles_frequency_and_keeps_length() {
        let sr = 8000;
        let input = sine(440.0, sr, sr as usize);
        let out = shift_channels(&[input.clone()], sr, 12.0, &CancelHandle::new())
            .unwrap()
            .unwrap();
        assert_eq!(out[0].len(), input.len());

        let freq = dominant_frequency(&out[0], sr);
        assert!((freq - 880.0).abs() < 880.0 * 0.08, "got {freq} Hz");
    }

    #[test]
    fn test_octave_down_halves_frequency() {
        let sr = 8000;
        let input = sine(440.0, sr, sr as usize);
        let out = shift_channels(&[input.clone(), input], sr, -12.0, &CancelHandle::new())
            .unwrap()
            .unwrap();
        assert_eq!(out.len(), 2);
        let freq = dominant_frequency(&out[1], sr);
        assert!((freq - 220.0).abs() < 220.0 * 0.08, "got {freq} Hz");
    }

    fn write_stereo_sine(path: &Path, sample_rate: u32, len: usize) {
        let spec = WavSpec {
            channels: 2,
            sample_rate,
            bits_per_sample: 16,
            sample_format: SampleFormat::Int,
        };
        let mut writer = WavWriter::create(path, spec).unwrap();
        for s in sine(300.0, sample_rate, len) {
            let v = (s * i16::MAX as f32) as i16;
            writer.write_sample(v).unwrap();
            writer.write_sample(v).unwrap();
        }
        writer.finalize().unwrap();
    }

    #[test]
    fn test_wav_round_trip_keeps_layout() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("in.wav");
        let output = dir.path().join("out.wav");
        write_stereo_sine(&input, 8000, 4000);

        let flow = shift_wav_file(&input, &output, 5.0, &CancelHandle::new()).unwrap();
        assert_eq!(flow, Flow::Completed);

        let reader = WavReader::open(&output).unwrap();
        assert_eq!(reader.spec().channels, 2);
        assert_eq!(reader.spec().sample_rate, 8000);
        assert_eq!(reader.len(), 8000);
    }

    #[test]
    fn test_cancelled_shift_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("in.wav");
        let output = dir.path().join("out.wav");
        write_stereo_sine(&input, 8000, 8000);

        let cancel = CancelHandle::new();
        cancel.cancel();
        let flow = shift_wav_file(&input, &output, 4.0, &cancel).unwrap();
        assert_eq!(flow, Flow::Cancelled);
        assert!(!output.exists());

        let channels = vec![sine(300.0, 8000, 8000)];
        assert!(shift_channels(&channels, 8000, 4.0, &cancel).unwrap().is_none());
    }
}
