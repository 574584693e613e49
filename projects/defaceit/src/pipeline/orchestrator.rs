// Pipeline controller: sequences the stages of one job
//
// open_source -> process_frames -> encode_wait -> [reencode] -> audio chain -> done,
// with failure and cancellation possible from any live state.

use crate::job::{Job, PipelineOptions};
use crate::pipeline::audio::{reencode_command, AudioChain};
use crate::pipeline::blur::RegionBlur;
use crate::pipeline::detection::DetectionRecorder;
use crate::pipeline::encode::{encoder_command, frame_queue, EncodePipe, FAST_PRESET, FINAL_PRESET};
use crate::pipeline::error::PipelineError;
use crate::pipeline::processor::{CategoryDetector, FrameProcessor};
use crate::pipeline::reader::{frame_worker, ProducerExit, WorkerContext};
use crate::pipeline::stage::{Flow, StageContext};
use crate::pipeline::tool::ToolExit;
pub use crate::pipeline::types::ProcessingState;
use crate::pipeline::types::{CancelHandle, EventSink, PipelineEvent, PipelineState};
use crate::run_context::{run_id_for, Artifact, TempArtifacts};
use crate::video::VideoSource;
use crossbeam::channel::{self, Receiver};
use serde::Serialize;
use std::fs;
use std::sync::Arc;

/// Opens the video source. Runs on a blocking thread.
pub type SourceOpener = Box<dyn FnOnce() -> anyhow::Result<Box<dyn VideoSource>> + Send>;

/// Terminal result of one run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobOutcome {
    pub state: PipelineState,
    /// 0 for success and for cancellation.
    pub exit_code: i32,
    pub frames: usize,
    pub error: Option<String>,
}

#[derive(Debug, Default)]
struct RunProgress {
    frames: usize,
    /// The encoder has been started on the output path.
    output_written: bool,
    /// The encoder exited cleanly.
    encoded: bool,
}

/// Owns one job from start to terminal state.
pub struct PipelineController {
    job: Job,
    options: PipelineOptions,
    opener: Option<SourceOpener>,
    detectors: Vec<CategoryDetector>,
    cancel: CancelHandle,
    events: EventSink,
    state: Arc<ProcessingState>,
}

impl PipelineController {
    /// Returns the controller and the receiving end of its event stream.
    pub fn new(
        job: Job,
        opener: SourceOpener,
        detectors: Vec<CategoryDetector>,
        options: PipelineOptions,
    ) -> (Self, Receiver<PipelineEvent>) {
        let (tx, rx) = channel::unbounded();
        let state = Arc::new(ProcessingState::new(run_id_for(&job.output)));
        let controller = Self {
            job,
            options,
            opener: Some(opener),
            detectors,
            cancel: CancelHandle::new(),
            events: EventSink::new(tx),
            state,
        };
        (controller, rx)
    }

    /// Share an existing cancellation flag instead of a fresh one.
    pub fn with_cancel_handle(mut self, cancel: CancelHandle) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// Idempotent. Returns false if the job was already cancelled.
    pub fn cancel(&self) -> bool {
        self.cancel.cancel()
    }

    pub fn state(&self) -> Arc<ProcessingState> {
        self.state.clone()
    }

    /// Drive the job to a terminal state. `Finished` is emitted exactly once.
    pub async fn run(mut self) -> JobOutcome {
        let mut ctx = StageContext {
            artifacts: TempArtifacts::new(),
            state: self.state.clone(),
            events: self.events.clone(),
            cancel: self.cancel.clone(),
            grace: self.options.grace,
        };
        let mut progress = RunProgress::default();

        let result = if self.cancel.is_cancelled() {
            tracing::info!("Job cancelled before start");
            Ok(Flow::Cancelled)
        } else {
            self.execute(&mut ctx, &mut progress).await
        };

        let result = match result {
            Err(e) if self.cancel.is_cancelled() => {
                tracing::info!("Ignoring error after cancellation: {}", e);
                Ok(Flow::Cancelled)
            }
            other => other,
        };

        self.finalize(ctx, progress, result)
    }

    async fn execute(
        &mut self,
        ctx: &mut StageContext,
        progress: &mut RunProgress,
    ) -> Result<Flow, PipelineError> {
        self.job.validate()?;
        let job = self.job.clone();
        let options = self.options.clone();
        let opener = self
            .opener
            .take()
            .ok_or_else(|| PipelineError::InvalidJob("controller already ran".into()))?;

        // --- open_source ---
        ctx.enter(PipelineState::OpenSource);
        ctx.events.progress("Opening video...");
        if !job.input.exists() {
            return Err(PipelineError::SourceOpenFailed(format!(
                "input not found: {}",
                job.input.display()
            )));
        }
        let source = tokio::task::spawn_blocking(opener)
            .await
            .map_err(|e| PipelineError::SourceOpenFailed(e.to_string()))?
            .map_err(|e| PipelineError::SourceOpenFailed(format!("{:#}", e)))?;
        let info = source.info().clone();
        ctx.state.set_total_frames(info.frame_count);
        tracing::info!(
            "Opened {}: {}x{} @ {} fps, ~{} frames",
            job.input.display(),
            info.width,
            info.height,
            info.fps_expr,
            info.frame_count
        );
        ctx.events
            .progress(format!("Processing {} frames...", info.frame_count));
        if ctx.cancel.is_cancelled() {
            return Ok(Flow::Cancelled);
        }

        // --- process_frames ---
        ctx.enter(PipelineState::ProcessFrames);
        let detectors: Vec<CategoryDetector> = std::mem::take(&mut self.detectors)
            .into_iter()
            .filter(|d| {
                let enabled = job.blurs(d.category);
                if !enabled {
                    tracing::info!("{} redaction disabled, dropping its detector", d.category);
                }
                enabled
            })
            .collect();
        let mut processor = FrameProcessor::new(
            detectors,
            RegionBlur::new(job.blur_kind, job.blur_strength),
            job.confidence,
            job.face_padding,
        );
        if let Some(path) = &options.detection_log {
            let recorder = DetectionRecorder::create(path)
                .map_err(|e| PipelineError::DetectionFailed(format!("{:#}", e)))?;
            processor = processor.with_recorder(recorder);
        }
        if let Some(preview) = &options.preview {
            fs::create_dir_all(&preview.dir)?;
        }

        let quality = job.effective_quality();
        let preset = if job.reencode { FAST_PRESET } else { FINAL_PRESET };
        let cmd = encoder_command(&job.ffmpeg, &info, quality, preset, &job.output);
        let mut pipe = EncodePipe::launch(&cmd, &ctx.events, ctx.state.clone())?;
        progress.output_written = true;

        let (tx, mut queue) = frame_queue(options.queue_capacity, options.batch_size);
        let worker_ctx = WorkerContext {
            cancel: ctx.cancel.clone(),
            events: ctx.events.clone(),
            state: ctx.state.clone(),
            progress_every: options.progress_every,
            preview: options.preview.clone(),
        };
        let worker =
            tokio::task::spawn_blocking(move || frame_worker(source, processor, tx, worker_ctx));

        let fed = tokio::select! {
            r = pipe.feed(&mut queue) => Some(r),
            _ = ctx.cancel.cancelled() => None,
        };
        let fed = match fed {
            Some(r) => r,
            None => {
                queue.close();
                pipe.abort(ctx.grace).await;
                let _ = worker.await;
                return Ok(Flow::Cancelled);
            }
        };
        if let Err(e) = fed {
            // Releases a producer blocked on a full queue.
            queue.close();
            pipe.abort(ctx.grace).await;
            let _ = worker.await;
            return Err(e);
        }

        let exit = worker.await.unwrap_or_else(|e| {
            Err(PipelineError::SourceReadFailed(format!(
                "frame worker failed: {}",
                e
            )))
        });
        match exit {
            Ok(ProducerExit::Exhausted(frames)) => progress.frames = frames,
            Ok(ProducerExit::Cancelled(_)) => {
                pipe.abort(ctx.grace).await;
                return Ok(Flow::Cancelled);
            }
            Ok(ProducerExit::Stopped(frames)) => {
                pipe.abort(ctx.grace).await;
                return Err(PipelineError::PipeWriteFailed(format!(
                    "frame queue closed after {} frames",
                    frames
                )));
            }
            Err(e) => {
                pipe.abort(ctx.grace).await;
                return Err(e);
            }
        }

        // --- encode_wait ---
        ctx.enter(PipelineState::EncodeWait);
        tokio::select! {
            r = pipe.finish() => r?,
            _ = ctx.cancel.cancelled() => {
                pipe.abort(ctx.grace).await;
                return Ok(Flow::Cancelled);
            }
        }
        progress.encoded = true;
        tracing::info!("Encoded {} frames to {}", pipe.frames_written(), job.output.display());
        ctx.events.progress("Encoding complete.");

        // --- reencode ---
        if job.reencode {
            ctx.enter(PipelineState::Reencode);
            ctx.events.progress("Re-encoding to H.264...");
            let reencoded = ctx.artifacts.track(&job.output, Artifact::Reencoded);
            let cmd = reencode_command(&job.ffmpeg, &job.output, quality, &reencoded);
            match ctx.run_tool(&cmd).await? {
                ToolExit::Cancelled => return Ok(Flow::Cancelled),
                ToolExit::Exited(0) => fs::rename(&reencoded, &job.output)?,
                ToolExit::Exited(code) => return Err(PipelineError::ReencodeFailed(code)),
            }
        }

        if info.has_audio == Some(false) {
            tracing::info!("Source has no audio stream, skipping audio stages");
            ctx.events.progress("Processing complete!");
            return Ok(Flow::Completed);
        }

        AudioChain::new(&job.ffmpeg, &job.input, &job.output, job.pitch_semitones)
            .run(ctx)
            .await
    }

    fn finalize(
        &self,
        mut ctx: StageContext,
        progress: RunProgress,
        result: Result<Flow, PipelineError>,
    ) -> JobOutcome {
        let (state, exit_code, error) = match &result {
            Ok(Flow::Completed) => (PipelineState::Done, 0, None),
            Ok(Flow::Cancelled) => (PipelineState::Cancelled, 0, None),
            Err(e @ PipelineError::AudioMergeFailed { .. }) => {
                (PipelineState::Failed, e.exit_code(), Some(e.to_string()))
            }
            Err(e) if progress.encoded => (
                PipelineState::Failed,
                e.exit_code(),
                Some(format!(
                    "{} (encoded video kept at {})",
                    e,
                    self.job.output.display()
                )),
            ),
            Err(e) => (PipelineState::Failed, e.exit_code(), Some(e.to_string())),
        };

        ctx.artifacts.cleanup();

        let discard_output = progress.output_written
            && match state {
                PipelineState::Cancelled => true,
                PipelineState::Failed => !progress.encoded,
                _ => false,
            };
        if discard_output && self.job.output.exists() {
            match fs::remove_file(&self.job.output) {
                Ok(()) => tracing::info!("Removed partial output {}", self.job.output.display()),
                Err(e) => tracing::warn!(
                    "Failed to remove partial output {}: {}",
                    self.job.output.display(),
                    e
                ),
            }
        }

        if let Some(message) = &error {
            tracing::error!("Pipeline failed: {}", message);
            ctx.state.set_error(message.clone());
            ctx.events.error(message.clone());
        }
        if state == PipelineState::Cancelled {
            ctx.events.progress("Processing cancelled");
        }

        ctx.enter(state);
        ctx.events.send(PipelineEvent::Finished(exit_code));
        tracing::info!("Pipeline finished: {} (code {})", state, exit_code);

        JobOutcome {
            state,
            exit_code,
            frames: progress.frames,
            error,
        }
    }
}
