use crate::job::Job;
use crate::pipeline::types::PipelineState;
use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Intermediate files a run may create next to its output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Artifact {
    TempAudio,
    ShiftedAudio,
    FallbackRaw,
    Reencoded,
    FinalMerge,
}

/// `<stem>.<suffix>` beside `output`, keeping the container extension for video artifacts.
pub fn artifact_path(output: &Path, artifact: Artifact) -> PathBuf {
    let stem = output
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("output");
    let ext = output
        .extension()
        .and_then(|s| s.to_str())
        .unwrap_or("mp4");
    let name = match artifact {
        Artifact::TempAudio => format!("{}.temp_audio.wav", stem),
        Artifact::ShiftedAudio => format!("{}.temp_audio.shifted.wav", stem),
        Artifact::FallbackRaw => format!("{}.fallback_raw.wav", stem),
        Artifact::Reencoded => format!("{}.reencoded.{}", stem, ext),
        Artifact::FinalMerge => format!("{}.final.{}", stem, ext),
    };
    output.with_file_name(name)
}

/// Every path registered here is removed when the run ends, however it ends.
#[derive(Debug, Default)]
pub struct TempArtifacts {
    paths: Vec<PathBuf>,
}

impl TempArtifacts {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the artifact's path for cleanup and return it.
    pub fn track(&mut self, output: &Path, artifact: Artifact) -> PathBuf {
        let path = artifact_path(output, artifact);
        if !self.paths.contains(&path) {
            self.paths.push(path.clone());
        }
        path
    }

    pub fn paths(&self) -> &[PathBuf] {
        &self.paths
    }

    /// Remove every tracked file that exists. Failures are logged, not returned.
    pub fn cleanup(&mut self) {
        for path in self.paths.drain(..) {
            if !path.exists() {
                continue;
            }
            match fs::remove_file(&path) {
                Ok(()) => tracing::debug!("Removed {}", path.display()),
                Err(e) => tracing::warn!("Failed to remove {}: {}", path.display(), e),
            }
        }
    }
}

impl Drop for TempArtifacts {
    fn drop(&mut self) {
        self.cleanup();
    }
}

/// Summary of one run, written as JSON when requested.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct RunReport {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub state: PipelineState,
    pub exit_code: i32,
    pub frames: usize,
    pub error: Option<String>,
    pub job: Job,
}

impl RunReport {
    pub fn write(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }
}

/// Run identifier derived from the output name.
pub fn run_id_for(output: &Path) -> String {
    output
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("run")
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_artifact_names() {
        let out = Path::new("/videos/clip.mov");
        assert_eq!(
            artifact_path(out, Artifact::TempAudio),
            PathBuf::from("/videos/clip.temp_audio.wav")
        );
        assert_eq!(
            artifact_path(out, Artifact::ShiftedAudio),
            PathBuf::from("/videos/clip.temp_audio.shifted.wav")
        );
        assert_eq!(
            artifact_path(out, Artifact::FallbackRaw),
            PathBuf::from("/videos/clip.fallback_raw.wav")
        );
        assert_eq!(
            artifact_path(out, Artifact::Reencoded),
            PathBuf::from("/videos/clip.reencoded.mov")
        );
        assert_eq!(
            artifact_path(Path::new("clip"), Artifact::FinalMerge),
            PathBuf::from("clip.final.mp4")
        );
    }

    #[test]
    fn test_cleanup_removes_tracked_files() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("out.mp4");
        let mut artifacts = TempArtifacts::new();
        let audio = artifacts.track(&output, Artifact::TempAudio);
        let never_created = artifacts.track(&output, Artifact::FinalMerge);
        artifacts.track(&output, Artifact::TempAudio);
        assert_eq!(artifacts.paths().len(), 2);

        fs::write(&audio, b"RIFF").unwrap();
        artifacts.cleanup();
        assert!(!audio.exists());
        assert!(!never_created.exists());
        assert!(artifacts.paths().is_empty());
    }

    #[test]
    fn test_drop_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("out.mp4");
        let path = {
            let mut artifacts = TempArtifacts::new();
            let path = artifacts.track(&output, Artifact::Reencoded);
            fs::write(&path, b"x").unwrap();
            path
        };
        assert!(!path.exists());
    }

    #[test]
    fn test_report_written_as_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("reports/run.json");
        let now = Utc::now();
        let report = RunReport {
            run_id: "clip".into(),
            started_at: now,
            finished_at: now,
            state: PipelineState::Done,
            exit_code: 0,
            frames: 60,
            error: None,
            job: Job::new("in.mp4", "out.mp4"),
        };
        report.write(&path).unwrap();
        let back: RunReport = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(back.state, PipelineState::Done);
        assert_eq!(back.frames, 60);
    }
}
