// Frame worker: reads, redacts and queues frames on a blocking thread

use crate::pipeline::encode::FrameSender;
use crate::pipeline::error::PipelineError;
use crate::pipeline::processor::FrameProcessor;
use crate::pipeline::types::{CancelHandle, EventSink, FrameBuffer, PipelineEvent, ProcessingState};
use crate::video::VideoSource;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

/// Why the worker stopped producing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProducerExit {
    /// Source ran out after this many frames.
    Exhausted(usize),
    /// Cancellation was observed before the next frame.
    Cancelled(usize),
    /// The queue's consumer went away.
    Stopped(usize),
}

/// Every Nth redacted frame is written as a JPEG.
#[derive(Debug, Clone)]
pub struct PreviewSettings {
    pub dir: PathBuf,
    pub every: usize,
}

pub struct WorkerContext {
    pub cancel: CancelHandle,
    pub events: EventSink,
    pub state: Arc<ProcessingState>,
    pub progress_every: usize,
    pub preview: Option<PreviewSettings>,
}

/// Reads frames until the source is exhausted, redacting each one and queueing it for the encoder.
/// Blocks; run it on a blocking thread.
pub fn frame_worker(
    mut source: Box<dyn VideoSource>,
    mut processor: FrameProcessor,
    tx: FrameSender,
    ctx: WorkerContext,
) -> Result<ProducerExit, PipelineError> {
    let total = source.info().frame_count;
    let every = ctx.progress_every.max(1);
    let started = Instant::now();
    let mut frames = 0usize;

    loop {
        if ctx.cancel.is_cancelled() {
            tracing::info!("Frame worker observed cancellation after {} frames", frames);
            return Ok(ProducerExit::Cancelled(frames));
        }

        let frame = match source.next_frame() {
            Ok(Some(frame)) => frame,
            Ok(None) => break,
            Err(e) => return Err(PipelineError::SourceReadFailed(format!("{:#}", e))),
        };

        let start = Instant::now();
        let redacted = processor
            .process(frame)
            .map_err(|e| PipelineError::DetectionFailed(format!("{:#}", e)))?;
        ctx.state.update_stage(
            "detect",
            frames + 1,
            start.elapsed().as_secs_f64() * 1000.0,
        );

        if let Some(preview) = &ctx.preview {
            if preview.every > 0 && frames % preview.every == 0 {
                write_preview(&redacted, preview, frames);
            }
        }

        if tx.send_blocking(redacted).is_err() {
            tracing::debug!("Frame queue closed, stopping after {} frames", frames);
            return Ok(ProducerExit::Stopped(frames));
        }
        frames += 1;

        if frames % every == 0 {
            let elapsed = started.elapsed().as_secs_f64();
            let fps = if elapsed > 0.0 {
                frames as f64 / elapsed
            } else {
                0.0
            };
            ctx.events.progress(format!(
                "Processing frame {}/{} ({:.1} FPS)",
                frames, total, fps
            ));
            ctx.events.send(PipelineEvent::FrameProgress { frames, total, fps });
        }
    }

    processor
        .finish()
        .map_err(|e| PipelineError::DetectionFailed(format!("{:#}", e)))?;
    ctx.events
        .progress("All frames processed. Waiting for encoding...");
    tracing::info!("Frame worker finished: {} frames", frames);
    Ok(ProducerExit::Exhausted(frames))
}

fn write_preview(frame: &FrameBuffer, preview: &PreviewSettings, id: usize) {
    let path = preview.dir.join(format!("frame_{:06}.jpg", id));
    let result = frame
        .to_rgb_image()
        .and_then(|img| img.save(&path).map_err(anyhow::Error::from));
    if let Err(e) = result {
        tracing::warn!("Failed to write preview {}: {:#}", path.display(), e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::blur::{BlurKind, RegionBlur};
    use crate::pipeline::encode::frame_queue;
    use crate::video::SyntheticSource;

    fn context(cancel: CancelHandle, events: EventSink) -> WorkerContext {
        WorkerContext {
            cancel,
            events,
            state: Arc::new(ProcessingState::new("test".into())),
            progress_every: 5,
            preview: None,
        }
    }

    fn passthrough() -> FrameProcessor {
        FrameProcessor::new(Vec::new(), RegionBlur::new(BlurKind::Gaussian, 21), 0.15, 0.2)
    }

    #[tokio::test]
    async fn test_worker_reports_progress_every_fifth_frame() {
        let (tx, mut queue) = frame_queue(32, 5);
        let (etx, erx) = crossbeam::channel::unbounded();
        let ctx = context(CancelHandle::new(), EventSink::new(etx));

        let worker = tokio::task::spawn_blocking(move || {
            frame_worker(
                Box::new(SyntheticSource::new(8, 8, 30.0, 12)),
                passthrough(),
                tx,
                ctx,
            )
        });

        let mut received = 0;
        while let Some(batch) = queue.next_batch().await {
            received += batch.len();
        }
        assert_eq!(worker.await.unwrap().unwrap(), ProducerExit::Exhausted(12));
        assert_eq!(received, 12);

        let counts: Vec<usize> = erx
            .try_iter()
            .filter_map(|e| match e {
                PipelineEvent::FrameProgress { frames, total, .. } => {
                    assert_eq!(total, 12);
                    Some(frames)
                }
                _ => None,
            })
            .collect();
        assert_eq!(counts, vec![5, 10]);
    }

    #[tokio::test]
    async fn test_worker_stops_when_cancelled() {
        let (tx, _queue) = frame_queue(32, 5);
        let (etx, _erx) = crossbeam::channel::unbounded();
        let cancel = CancelHandle::new();
        cancel.cancel();
        let ctx = context(cancel, EventSink::new(etx));

        let exit = tokio::task::spawn_blocking(move || {
            frame_worker(
                Box::new(SyntheticSource::new(8, 8, 30.0, 12)),
                passthrough(),
                tx,
                ctx,
            )
        })
        .await
        .unwrap()
        .unwrap();
        assert_eq!(exit, ProducerExit::Cancelled(0));
    }

    #[tokio::test]
    async fn test_worker_writes_previews() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, mut queue) = frame_queue(32, 5);
        let (etx, _erx) = crossbeam::channel::unbounded();
        let mut ctx = context(CancelHandle::new(), EventSink::new(etx));
        ctx.preview = Some(PreviewSettings {
            dir: dir.path().to_path_buf(),
            every: 4,
        });

        let worker = tokio::task::spawn_blocking(move || {
            frame_worker(
                Box::new(SyntheticSource::new(8, 8, 30.0, 9)),
                passthrough(),
                tx,
                ctx,
            )
        });
        while queue.next_batch().await.is_some() {}
        worker.await.unwrap().unwrap();

        for id in [0, 4, 8] {
            assert!(dir.path().join(format!("frame_{:06}.jpg", id)).exists());
        }
        assert!(!dir.path().join("frame_000001.jpg").exists());
    }
}
