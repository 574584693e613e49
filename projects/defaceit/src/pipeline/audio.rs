// Audio post-processing: extract, pitch shift (with in-process fallback), merge

use crate::pipeline::error::PipelineError;
use crate::pipeline::pitch::{self, pitch_ratio};
use crate::pipeline::stage::{Flow, StageContext};
use crate::pipeline::tool::{ToolCommand, ToolExit};
use crate::pipeline::types::PipelineState;
use crate::run_context::Artifact;
use std::fs;
use std::path::Path;

/// Shifts smaller than this leave the audio untouched.
pub const MIN_PITCH_SHIFT: f64 = 0.1;

pub fn extract_command(ffmpeg: &Path, input: &Path, wav: &Path) -> ToolCommand {
    ToolCommand::new("audio extract", ffmpeg)
        .arg("-i")
        .path_arg(input)
        .args(["-vn", "-acodec", "pcm_s16le", "-y"])
        .path_arg(wav)
}

pub fn shift_command(ffmpeg: &Path, wav: &Path, shifted: &Path, semitones: f64) -> ToolCommand {
    ToolCommand::new("pitch shift", ffmpeg)
        .arg("-i")
        .path_arg(wav)
        .arg("-af")
        .arg(format!("rubberband=pitch={}", pitch_ratio(semitones)))
        .arg("-y")
        .path_arg(shifted)
}

/// Stereo PCM for the in-process shift.
pub fn fallback_extract_command(ffmpeg: &Path, input: &Path, wav: &Path) -> ToolCommand {
    ToolCommand::new("fallback extract", ffmpeg)
        .arg("-i")
        .path_arg(input)
        .args(["-acodec", "pcm_s16le", "-vn", "-ac", "2", "-y"])
        .path_arg(wav)
}

/// Copy the video stream, encode the audio, stop at the shorter of the two.
pub fn merge_command(ffmpeg: &Path, video: &Path, audio: &Path, merged: &Path) -> ToolCommand {
    ToolCommand::new("final merge", ffmpeg)
        .arg("-i")
        .path_arg(video)
        .arg("-i")
        .path_arg(audio)
        .args([
            "-c:v", "copy", "-c:a", "aac", "-map", "0:v:0", "-map", "1:a:0", "-shortest", "-y",
        ])
        .path_arg(merged)
}

/// Transcode the piped encode at final quality, without audio.
pub fn reencode_command(ffmpeg: &Path, video: &Path, quality: u32, reencoded: &Path) -> ToolCommand {
    ToolCommand::new("re-encode", ffmpeg)
        .args(["-y", "-i"])
        .path_arg(video)
        .args(["-c:v", "libx264", "-preset", "medium", "-crf"])
        .arg(quality.to_string())
        .args(["-pix_fmt", "yuv420p", "-movflags", "+faststart", "-an"])
        .path_arg(reencoded)
}

/// Runs after the video is encoded at `output`. On success `output` carries the new audio.
pub struct AudioChain<'a> {
    ffmpeg: &'a Path,
    input: &'a Path,
    output: &'a Path,
    semitones: f64,
}

impl<'a> AudioChain<'a> {
    pub fn new(ffmpeg: &'a Path, input: &'a Path, output: &'a Path, semitones: f64) -> Self {
        Self {
            ffmpeg,
            input,
            output,
            semitones,
        }
    }

    pub async fn run(&self, ctx: &mut StageContext) -> Result<Flow, PipelineError> {
        ctx.enter(PipelineState::ExtractAudio);
        ctx.events.progress("Extracting audio...");
        let temp_audio = ctx.artifacts.track(self.output, Artifact::TempAudio);
        match ctx
            .run_tool(&extract_command(self.ffmpeg, self.input, &temp_audio))
            .await?
        {
            ToolExit::Cancelled => return Ok(Flow::Cancelled),
            ToolExit::Exited(0) => {}
            ToolExit::Exited(code) => return Err(PipelineError::AudioExtractFailed(code)),
        }

        let audio = if self.semitones.abs() < MIN_PITCH_SHIFT {
            temp_audio
        } else {
            let shifted = ctx.artifacts.track(self.output, Artifact::ShiftedAudio);
            match self.shift(ctx, &temp_audio, &shifted).await? {
                Flow::Cancelled => return Ok(Flow::Cancelled),
                Flow::Completed => shifted,
            }
        };

        ctx.enter(PipelineState::FinalMerge);
        ctx.events.progress("Merging audio...");
        let merged = ctx.artifacts.track(self.output, Artifact::FinalMerge);
        match ctx
            .run_tool(&merge_command(self.ffmpeg, self.output, &audio, &merged))
            .await?
        {
            ToolExit::Cancelled => Ok(Flow::Cancelled),
            ToolExit::Exited(0) => {
                fs::rename(&merged, self.output)?;
                ctx.events.progress("Processing complete!");
                Ok(Flow::Completed)
            }
            ToolExit::Exited(code) => Err(PipelineError::AudioMergeFailed {
                code,
                retained: self.output.to_path_buf(),
            }),
        }
    }

    /// Filter shift, or the in-process fallback when the filter fails. Writes `shifted` either way.
    async fn shift(
        &self,
        ctx: &mut StageContext,
        temp_audio: &Path,
        shifted: &Path,
    ) -> Result<Flow, PipelineError> {
        ctx.enter(PipelineState::ShiftAudio);
        ctx.events.progress(format!(
            "Shifting pitch by {:+.1} semitones...",
            self.semitones
        ));
        let code = match ctx
            .run_tool(&shift_command(self.ffmpeg, temp_audio, shifted, self.semitones))
            .await?
        {
            ToolExit::Cancelled => return Ok(Flow::Cancelled),
            ToolExit::Exited(0) => return Ok(Flow::Completed),
            ToolExit::Exited(code) => code,
        };

        let err = PipelineError::PitchShiftFailed(code);
        tracing::warn!("{}; falling back to in-process pitch shift", err);
        ctx.events
            .progress("Pitch shift filter failed. Falling back to in-process pitch shift...");

        ctx.enter(PipelineState::FallbackExtract);
        let raw = ctx.artifacts.track(self.output, Artifact::FallbackRaw);
        match ctx
            .run_tool(&fallback_extract_command(self.ffmpeg, self.input, &raw))
            .await?
        {
            ToolExit::Cancelled => return Ok(Flow::Cancelled),
            ToolExit::Exited(0) if raw.exists() => {}
            ToolExit::Exited(code) => {
                return Err(PipelineError::FallbackPitchShiftFailed(format!(
                    "audio re-extraction failed (code {})",
                    code
                )))
            }
        }

        ctx.enter(PipelineState::FallbackShift);
        ctx.events.progress("Applying in-process pitch shift (fallback)...");
        let (input, output, semitones) = (raw.clone(), shifted.to_path_buf(), self.semitones);
        let cancel = ctx.cancel.clone();
        let mut task = tokio::task::spawn_blocking(move || {
            pitch::shift_wav_file(&input, &output, semitones, &cancel)
        });

        let result = tokio::select! {
            r = &mut task => r,
            _ = ctx.cancel.cancelled() => {
                // The shift stops at its next frame and removes anything it wrote.
                if tokio::time::timeout(ctx.grace, &mut task).await.is_err() {
                    tracing::warn!("In-process pitch shift still running after cancellation");
                }
                return Ok(Flow::Cancelled);
            }
        };

        match result {
            Ok(Ok(Flow::Cancelled)) => Ok(Flow::Cancelled),
            Ok(Ok(Flow::Completed)) => {
                ctx.events.progress("Fallback pitch shift complete.");
                Ok(Flow::Completed)
            }
            Ok(Err(e)) => Err(PipelineError::FallbackPitchShiftFailed(format!("{:#}", e))),
            Err(e) => Err(PipelineError::FallbackPitchShiftFailed(e.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_audio_command_lines() {
        let ff = Path::new("ffmpeg");
        assert_eq!(
            extract_command(ff, Path::new("in.mp4"), Path::new("o.temp_audio.wav")).to_string(),
            "ffmpeg -i in.mp4 -vn -acodec pcm_s16le -y o.temp_audio.wav"
        );
        assert_eq!(
            shift_command(ff, Path::new("a.wav"), Path::new("b.wav"), -12.0).to_string(),
            "ffmpeg -i a.wav -af rubberband=pitch=0.5 -y b.wav"
        );
        assert_eq!(
            fallback_extract_command(ff, Path::new("in.mp4"), Path::new("raw.wav")).to_string(),
            "ffmpeg -i in.mp4 -acodec pcm_s16le -vn -ac 2 -y raw.wav"
        );
        assert_eq!(
            merge_command(ff, Path::new("v.mp4"), Path::new("a.wav"), Path::new("f.mp4"))
                .to_string(),
            "ffmpeg -i v.mp4 -i a.wav -c:v copy -c:a aac -map 0:v:0 -map 1:a:0 -shortest -y f.mp4"
        );
        assert_eq!(
            reencode_command(ff, Path::new("v.mp4"), 22, Path::new("r.mp4")).to_string(),
            "ffmpeg -y -i v.mp4 -c:v libx264 -preset medium -crf 22 -pix_fmt yuv420p -movflags +faststart -an r.mp4"
        );
    }
}
