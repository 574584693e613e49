use super::{SourceInfo, VideoSource};
use crate::pipeline::types::FrameBuffer;
use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use std::io::{BufRead, BufReader, Read};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdout, Command, Stdio};

#[derive(Deserialize, Debug, Default)]
struct ProbeOutput {
    #[serde(default)]
    streams: Vec<ProbeStream>,
    #[serde(default)]
    format: Option<ProbeFormat>,
}

#[derive(Deserialize, Debug, Default)]
struct ProbeStream {
    #[serde(default)]
    codec_type: String,
    width: Option<u32>,
    height: Option<u32>,
    avg_frame_rate: Option<String>,
    r_frame_rate: Option<String>,
    nb_frames: Option<String>,
    #[serde(default)]
    tags: Option<ProbeTags>,
    #[serde(default)]
    side_data_list: Vec<ProbeSideData>,
}

#[derive(Deserialize, Debug, Default)]
struct ProbeTags {
    rotate: Option<String>,
}

#[derive(Deserialize, Debug, Default)]
struct ProbeSideData {
    rotation: Option<f64>,
}

impl ProbeStream {
    /// Display rotation in degrees, normalised to `0..360`. The display matrix wins over
    /// the legacy `rotate` tag.
    fn rotation(&self) -> i32 {
        let degrees = self
            .side_data_list
            .iter()
            .find_map(|d| d.rotation)
            .or_else(|| {
                self.tags
                    .as_ref()
                    .and_then(|t| t.rotate.as_deref())
                    .and_then(|r| r.trim().parse::<f64>().ok())
            })
            .unwrap_or(0.0);
        (degrees.round() as i32).rem_euclid(360)
    }
}

#[derive(Deserialize, Debug, Default)]
struct ProbeFormat {
    duration: Option<String>,
}

/// `ffprobe` next to the given `ffmpeg`, or from `PATH`.
pub fn ffprobe_for(ffmpeg: &Path) -> PathBuf {
    let name = ffmpeg.file_name().and_then(|s| s.to_str()).unwrap_or("");
    let probe = match name {
        "ffmpeg" => "ffprobe",
        "ffmpeg.exe" => "ffprobe.exe",
        _ => return PathBuf::from("ffprobe"),
    };
    ffmpeg.with_file_name(probe)
}

/// Parse an ffprobe rate such as `30000/1001`. Returns the value and the expression to reuse.
fn parse_rate(rate: &str) -> Option<(f64, String)> {
    let (num, den) = match rate.split_once('/') {
        Some((n, d)) => (n.trim().parse::<f64>().ok()?, d.trim().parse::<f64>().ok()?),
        None => (rate.trim().parse::<f64>().ok()?, 1.0),
    };
    if num <= 0.0 || den <= 0.0 {
        return None;
    }
    let expr = if den == 1.0 {
        format!("{}", num)
    } else {
        rate.trim().to_string()
    };
    Some((num / den, expr))
}

fn source_info_from_probe(json: &str) -> Result<SourceInfo> {
    let probe: ProbeOutput = serde_json::from_str(json).context("Malformed ffprobe output")?;

    let video = probe
        .streams
        .iter()
        .find(|s| s.codec_type == "video")
        .ok_or_else(|| anyhow!("No video stream found"))?;
    let has_audio = probe.streams.iter().any(|s| s.codec_type == "audio");

    let width = video.width.ok_or_else(|| anyhow!("Video stream has no width"))?;
    let height = video
        .height
        .ok_or_else(|| anyhow!("Video stream has no height"))?;
    if width == 0 || height == 0 {
        return Err(anyhow!("Invalid video dimensions {}x{}", width, height));
    }
    // The decoder autorotates, so frames arrive in display orientation.
    let rotation = video.rotation();
    let (width, height) = if rotation == 90 || rotation == 270 {
        tracing::info!(
            "FfmpegPipeReader: stream rotated {} degrees, frames are {}x{}",
            rotation,
            height,
            width
        );
        (height, width)
    } else {
        (width, height)
    };

    let rate = video
        .avg_frame_rate
        .as_deref()
        .and_then(parse_rate)
        .or_else(|| video.r_frame_rate.as_deref().and_then(parse_rate));
    let mut info = match rate {
        Some((fps, expr)) => {
            let mut info = SourceInfo::new(width, height, fps);
            info.fps_expr = expr;
            info
        }
        None => {
            tracing::warn!("FfmpegPipeReader: could not determine FPS, defaulting to 30.0");
            SourceInfo::new(width, height, 30.0)
        }
    };

    let declared = video
        .nb_frames
        .as_deref()
        .and_then(|n| n.parse::<usize>().ok())
        .unwrap_or(0);
    let duration_secs = probe
        .format
        .as_ref()
        .and_then(|f| f.duration.as_deref())
        .and_then(|d| d.parse::<f64>().ok())
        .unwrap_or(0.0);
    info.frame_count = if declared == 0 {
        (duration_secs * info.fps).round() as usize
    } else {
        declared
    };
    info.has_audio = Some(has_audio);

    tracing::info!(
        "FfmpegPipeReader: duration={:.2}s, fps={:.2}, stream_frames={}, estimated_total={}, audio={}",
        duration_secs,
        info.fps,
        declared,
        info.frame_count,
        has_audio
    );

    Ok(info)
}

/// Read one frame of `len` bytes. Clean EOF before the first byte ends the stream.
fn read_frame<R: Read>(reader: &mut R, width: u32, height: u32) -> Result<Option<FrameBuffer>> {
    let len = width as usize * height as usize * 3;
    let mut data = vec![0u8; len];
    let mut filled = 0;
    while filled < len {
        match reader.read(&mut data[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }

    match filled {
        0 => Ok(None),
        n if n == len => Ok(Some(FrameBuffer::new(width, height, data)?)),
        n => Err(anyhow!("Truncated frame: got {} of {} bytes", n, len)),
    }
}

/// Decodes through an `ffmpeg` subprocess emitting raw `bgr24` frames on stdout.
pub struct FfmpegPipeReader {
    info: SourceInfo,
    child: Child,
    stdout: ChildStdout,
    finished: bool,
}

impl FfmpegPipeReader {
    pub fn open(path: &Path, ffmpeg: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(anyhow!("Video file not found: {}", path.display()));
        }

        let ffprobe = ffprobe_for(ffmpeg);
        let output = Command::new(&ffprobe)
            .args(["-v", "error", "-print_format", "json", "-show_streams", "-show_format"])
            .arg(path)
            .stdin(Stdio::null())
            .output()
            .with_context(|| format!("Failed to run {}", ffprobe.display()))?;
        if !output.status.success() {
            return Err(anyhow!(
                "ffprobe failed on {}: {}",
                path.display(),
                String::from_utf8_lossy(&output.stderr).trim()
            ));
        }
        let info = source_info_from_probe(&String::from_utf8_lossy(&output.stdout))?;

        let mut child = Command::new(ffmpeg)
            .args(["-hide_banner", "-loglevel", "error", "-i"])
            .arg(path)
            .args(["-map", "0:v:0", "-f", "rawvideo", "-pix_fmt", "bgr24", "pipe:1"])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("Failed to start decoder {}", ffmpeg.display()))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow!("Decoder stdout not captured"))?;
        if let Some(stderr) = child.stderr.take() {
            std::thread::spawn(move || {
                for line in BufReader::new(stderr).lines().map_while(Result::ok) {
                    tracing::debug!("[decoder] {}", line);
                }
            });
        }

        tracing::info!(
            "FfmpegPipeReader: decoding {} ({}x{})",
            path.display(),
            info.width,
            info.height
        );

        Ok(Self {
            info,
            child,
            stdout,
            finished: false,
        })
    }
}

impl VideoSource for FfmpegPipeReader {
    fn info(&self) -> &SourceInfo {
        &self.info
    }

    fn next_frame(&mut self) -> Result<Option<FrameBuffer>> {
        if self.finished {
            return Ok(None);
        }

        match read_frame(&mut self.stdout, self.info.width, self.info.height)? {
            Some(frame) => Ok(Some(frame)),
            None => {
                self.finished = true;
                let status = self.child.wait()?;
                if !status.success() {
                    return Err(anyhow!("Decoder exited with {}", status));
                }
                Ok(None)
            }
        }
    }
}

impl Drop for FfmpegPipeReader {
    fn drop(&mut self) {
        if !self.finished {
            let _ = self.child.kill();
            let _ = self.child.wait();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    const PROBE: &str = r#"{
        "streams": [
            {"index": 0, "codec_type": "video", "width": 64, "height": 48,
             "avg_frame_rate": "30000/1001", "r_frame_rate": "30000/1001"},
            {"index": 1, "codec_type": "audio", "sample_rate": "44100"}
        ],
        "format": {"duration": "2.002000"}
    }"#;

    #[test]
    fn test_probe_parsing() {
        let info = source_info_from_probe(PROBE).unwrap();
        assert_eq!((info.width, info.height), (64, 48));
        assert_eq!(info.fps_expr, "30000/1001");
        assert!((info.fps - 29.97).abs() < 0.01);
        assert_eq!(info.frame_count, 60);
        assert_eq!(info.has_audio, Some(true));
    }

    #[test]
    fn test_probe_defaults_fps_and_uses_declared_count() {
        let json = r#"{"streams": [{"codec_type": "video", "width": 8, "height": 8,
            "avg_frame_rate": "0/0", "nb_frames": "12"}]}"#;
        let info = source_info_from_probe(json).unwrap();
        assert_eq!(info.fps, 30.0);
        assert_eq!(info.fps_expr, "30");
        assert_eq!(info.frame_count, 12);
        assert_eq!(info.has_audio, Some(false));
    }

    #[test]
    fn test_rotated_stream_reports_display_size() {
        let side_data = r#"{"streams": [{"codec_type": "video", "width": 1920, "height": 1080,
            "avg_frame_rate": "30/1", "nb_frames": "3",
            "side_data_list": [{"side_data_type": "Display Matrix", "rotation": -90}]}]}"#;
        let info = source_info_from_probe(side_data).unwrap();
        assert_eq!((info.width, info.height), (1080, 1920));

        let tagged = r#"{"streams": [{"codec_type": "video", "width": 1920, "height": 1080,
            "avg_frame_rate": "30/1", "tags": {"rotate": "90"}}]}"#;
        let info = source_info_from_probe(tagged).unwrap();
        assert_eq!((info.width, info.height), (1080, 1920));

        let flipped = r#"{"streams": [{"codec_type": "video", "width": 1920, "height": 1080,
            "avg_frame_rate": "30/1", "tags": {"rotate": "180"}}]}"#;
        let info = source_info_from_probe(flipped).unwrap();
        assert_eq!((info.width, info.height), (1920, 1080));
    }

    #[test]
    fn test_probe_without_video_fails() {
        let json = r#"{"streams": [{"codec_type": "audio"}]}"#;
        assert!(source_info_from_probe(json).is_err());
    }

    #[test]
    fn test_ffprobe_path() {
        assert_eq!(
            ffprobe_for(Path::new("/opt/ff/bin/ffmpeg")),
            PathBuf::from("/opt/ff/bin/ffprobe")
        );
        assert_eq!(ffprobe_for(Path::new("ffmpeg")), PathBuf::from("ffprobe"));
        assert_eq!(ffprobe_for(Path::new("/usr/bin/avconv")), PathBuf::from("ffprobe"));
    }

    #[test]
    fn test_read_frame_boundaries() {
        let mut cursor = Cursor::new(vec![7u8; 2 * 12]);
        assert!(read_frame(&mut cursor, 2, 2).unwrap().is_some());
        assert!(read_frame(&mut cursor, 2, 2).unwrap().is_some());
        assert!(read_frame(&mut cursor, 2, 2).unwrap().is_none());

        let mut short = Cursor::new(vec![7u8; 13]);
        assert!(read_frame(&mut short, 2, 2).unwrap().is_some());
        assert!(read_frame(&mut short, 2, 2).is_err());
    }
}
