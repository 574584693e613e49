// Terminal progress display driven by pipeline events

use crate::pipeline::types::PipelineEvent;
use anyhow::Result;
use crossbeam::channel::Receiver;
use indicatif::{ProgressBar, ProgressStyle};
use std::thread::{self, JoinHandle};

pub struct ProgressRenderer {
    pb: ProgressBar,
}

impl ProgressRenderer {
    pub fn new(pb: ProgressBar) -> Result<Self> {
        pb.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({msg}, {eta})")?
                .progress_chars("#>-"),
        );
        Ok(Self { pb })
    }

    /// Apply one event. Returns the completion code once the run has finished.
    pub fn handle(&self, event: PipelineEvent) -> Option<i32> {
        match event {
            PipelineEvent::FrameProgress { frames, total, fps } => {
                if total > 0 {
                    self.pb.set_length(total.max(frames) as u64);
                }
                self.pb.set_position(frames as u64);
                self.pb.set_message(format!("{:.1} fps", fps));
            }
            PipelineEvent::Progress(message) => {
                tracing::debug!("{}", message);
            }
            PipelineEvent::StateChanged(state) => {
                self.pb.println(format!("[{}]", state));
            }
            PipelineEvent::Error(message) => {
                self.pb.println(format!("Error: {}", message));
            }
            PipelineEvent::Finished(code) => {
                if code == 0 {
                    self.pb.finish_with_message("done");
                } else {
                    self.pb.abandon_with_message(format!("failed ({})", code));
                }
                return Some(code);
            }
        }
        None
    }

    pub fn position(&self) -> u64 {
        self.pb.position()
    }
}

/// Render events on a background thread until `Finished` arrives or the channel closes.
pub fn spawn_renderer(events: Receiver<PipelineEvent>) -> Result<JoinHandle<Option<i32>>> {
    let renderer = ProgressRenderer::new(ProgressBar::new(0))?;
    Ok(thread::spawn(move || {
        for event in events.iter() {
            if let Some(code) = renderer.handle(event) {
                return Some(code);
            }
        }
        None
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::types::PipelineState;

    #[test]
    fn test_renderer_tracks_frames_until_finished() {
        let renderer = ProgressRenderer::new(ProgressBar::hidden()).unwrap();
        assert_eq!(
            renderer.handle(PipelineEvent::StateChanged(PipelineState::ProcessFrames)),
            None
        );
        renderer.handle(PipelineEvent::FrameProgress {
            frames: 10,
            total: 60,
            fps: 24.0,
        });
        assert_eq!(renderer.position(), 10);
        assert_eq!(renderer.handle(PipelineEvent::Finished(0)), Some(0));
    }

    #[test]
    fn test_spawned_renderer_returns_code() {
        let (tx, rx) = crossbeam::channel::unbounded();
        let handle = spawn_renderer(rx).unwrap();
        tx.send(PipelineEvent::Progress("Opening video...".into())).unwrap();
        tx.send(PipelineEvent::Finished(3)).unwrap();
        assert_eq!(handle.join().unwrap(), Some(3));

        let (tx, rx) = crossbeam::channel::unbounded::<PipelineEvent>();
        let handle = spawn_renderer(rx).unwrap();
        drop(tx);
        assert_eq!(handle.join().unwrap(), None);
    }
}
