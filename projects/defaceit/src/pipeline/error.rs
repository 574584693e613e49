use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("invalid job: {0}")]
    InvalidJob(String),
    #[error("could not open video source: {0}")]
    SourceOpenFailed(String),
    #[error("failed to read frame from source: {0}")]
    SourceReadFailed(String),
    #[error("detection failed: {0}")]
    DetectionFailed(String),
    #[error("failed to start {program}: {source}")]
    SubprocessSpawnError {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("pipe write error: {0}")]
    PipeWriteFailed(String),
    #[error("encoding failed (code {0})")]
    EncodeFailed(i32),
    #[error("re-encode failed (code {0})")]
    ReencodeFailed(i32),
    #[error("audio extraction failed (code {0})")]
    AudioExtractFailed(i32),
    #[error("pitch shift filter failed (code {0})")]
    PitchShiftFailed(i32),
    #[error("fallback pitch shift failed: {0}")]
    FallbackPitchShiftFailed(String),
    #[error("audio merge failed (code {code}); video without audio kept at {}", .retained.display())]
    AudioMergeFailed { code: i32, retained: PathBuf },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl PipelineError {
    /// Completion code reported for this failure. Never 0.
    pub fn exit_code(&self) -> i32 {
        let code = match self {
            Self::EncodeFailed(code)
            | Self::ReencodeFailed(code)
            | Self::AudioExtractFailed(code)
            | Self::PitchShiftFailed(code)
            | Self::AudioMergeFailed { code, .. } => *code,
            _ => 1,
        };
        if code == 0 {
            1
        } else {
            code
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_code_carries_subprocess_code() {
        assert_eq!(PipelineError::EncodeFailed(3).exit_code(), 3);
        assert_eq!(
            PipelineError::AudioMergeFailed {
                code: 2,
                retained: PathBuf::from("out.mp4")
            }
            .exit_code(),
            2
        );
        assert_eq!(PipelineError::PipeWriteFailed("x".into()).exit_code(), 1);
        assert_eq!(PipelineError::AudioExtractFailed(0).exit_code(), 1);
    }

    #[test]
    fn test_merge_failure_names_retained_path() {
        let err = PipelineError::AudioMergeFailed {
            code: 1,
            retained: PathBuf::from("/tmp/out.mp4"),
        };
        assert!(err.to_string().contains("/tmp/out.mp4"));
    }
}
