// Streaming encoder: bounded frame queue feeding an encoder's stdin

use crate::pipeline::error::PipelineError;
use crate::pipeline::tool::{SubprocessHandle, ToolCommand};
use crate::pipeline::types::{EventSink, FrameBuffer, ProcessingState};
use crate::video::SourceInfo;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio::process::ChildStdin;
use tokio::sync::mpsc;

/// Preset when the piped result is re-encoded afterwards.
pub const FAST_PRESET: &str = "ultrafast";
/// Preset for a final-quality encode.
pub const FINAL_PRESET: &str = "medium";

/// Raw `bgr24` frames on stdin, H.264 out.
pub fn encoder_command(
    ffmpeg: &Path,
    info: &SourceInfo,
    quality: u32,
    preset: &str,
    output: &Path,
) -> ToolCommand {
    ToolCommand::new("encoder", ffmpeg)
        .args(["-y", "-f", "rawvideo", "-vcodec", "rawvideo", "-pix_fmt", "bgr24"])
        .arg("-s")
        .arg(format!("{}x{}", info.width, info.height))
        .arg("-r")
        .arg(info.fps_expr.clone())
        .args(["-i", "-", "-c:v", "libx264", "-preset", preset])
        .arg("-crf")
        .arg(quality.to_string())
        .args(["-threads", "0", "-pix_fmt", "yuv420p", "-movflags", "+faststart"])
        .path_arg(output)
}

/// Producer half of the frame queue. Blocks while the queue is full.
#[derive(Clone)]
pub struct FrameSender {
    tx: mpsc::Sender<FrameBuffer>,
}

impl FrameSender {
    /// Hands the frame back if the consumer has gone away.
    pub fn send_blocking(&self, frame: FrameBuffer) -> Result<(), FrameBuffer> {
        self.tx.blocking_send(frame).map_err(|e| e.0)
    }
}

/// Consumer half of the frame queue, drained in FIFO batches.
pub struct FrameQueue {
    rx: mpsc::Receiver<FrameBuffer>,
    batch: usize,
}

pub fn frame_queue(capacity: usize, batch: usize) -> (FrameSender, FrameQueue) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (
        FrameSender { tx },
        FrameQueue {
            rx,
            batch: batch.max(1),
        },
    )
}

impl FrameQueue {
    /// Waits for at least one frame, then takes whatever else is ready up to the batch size.
    /// `None` once every sender is gone and the queue is empty.
    pub async fn next_batch(&mut self) -> Option<Vec<FrameBuffer>> {
        let first = self.rx.recv().await?;
        let mut batch = Vec::with_capacity(self.batch);
        batch.push(first);
        while batch.len() < self.batch {
            match self.rx.try_recv() {
                Ok(frame) => batch.push(frame),
                Err(_) => break,
            }
        }
        Some(batch)
    }

    /// Stop accepting frames; a blocked producer is released with an error.
    pub fn close(&mut self) {
        self.rx.close();
    }
}

/// The running encoder and the write side of its pipe.
pub struct EncodePipe {
    handle: SubprocessHandle,
    stdin: Option<ChildStdin>,
    state: Arc<ProcessingState>,
    written: usize,
}

impl EncodePipe {
    pub fn launch(
        cmd: &ToolCommand,
        events: &EventSink,
        state: Arc<ProcessingState>,
    ) -> Result<Self, PipelineError> {
        let mut handle = SubprocessHandle::spawn(cmd, events, true)?;
        let stdin = handle.take_stdin();
        Ok(Self {
            handle,
            stdin,
            state,
            written: 0,
        })
    }

    pub fn frames_written(&self) -> usize {
        self.written
    }

    /// Write every queued frame, then close the pipe. Returns the number of frames written.
    pub async fn feed(&mut self, queue: &mut FrameQueue) -> Result<usize, PipelineError> {
        let mut stdin = self
            .stdin
            .take()
            .ok_or_else(|| PipelineError::PipeWriteFailed("encoder stdin already closed".into()))?;

        while let Some(batch) = queue.next_batch().await {
            for frame in batch {
                if let Some(code) = self.handle.try_exit_code() {
                    return Err(early_exit(code));
                }

                let start = Instant::now();
                if let Err(e) = stdin.write_all(frame.as_bytes()).await {
                    return Err(self.write_error(e).await);
                }
                self.written += 1;
                self.state.update_stage(
                    "encode",
                    self.written,
                    start.elapsed().as_secs_f64() * 1000.0,
                );
            }
        }

        if let Err(e) = stdin.flush().await {
            return Err(self.write_error(e).await);
        }
        if let Err(e) = stdin.shutdown().await {
            tracing::debug!("Closing encoder stdin: {}", e);
        }
        drop(stdin);

        tracing::info!("Frame source exhausted after {} frames, encoder input closed", self.written);
        Ok(self.written)
    }

    /// A write failed. If the encoder died, its exit code is the better error.
    async fn write_error(&mut self, err: std::io::Error) -> PipelineError {
        match tokio::time::timeout(Duration::from_millis(500), self.handle.wait()).await {
            Ok(Ok(code)) if code != 0 => PipelineError::EncodeFailed(code),
            _ => PipelineError::PipeWriteFailed(err.to_string()),
        }
    }

    /// Await encoder exit after the input has been closed.
    pub async fn finish(&mut self) -> Result<(), PipelineError> {
        self.stdin.take();
        match self.handle.wait().await? {
            0 => Ok(()),
            code => Err(PipelineError::EncodeFailed(code)),
        }
    }

    /// Close the pipe and stop the encoder.
    pub async fn abort(&mut self, grace: Duration) {
        self.stdin.take();
        self.handle.terminate(grace).await;
    }
}

fn early_exit(code: i32) -> PipelineError {
    if code != 0 {
        PipelineError::EncodeFailed(code)
    } else {
        PipelineError::PipeWriteFailed("encoder exited before the end of the stream".into())
    }
}
