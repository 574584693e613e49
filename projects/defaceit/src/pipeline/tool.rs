// External tool invocation: spawn, forward output, await exit, terminate on cancel

use crate::pipeline::error::PipelineError;
use crate::pipeline::types::{CancelHandle, EventSink};
use std::ffi::OsString;
use std::fmt;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::task::JoinHandle;

/// One external program invocation.
#[derive(Debug, Clone)]
pub struct ToolCommand {
    pub label: String,
    pub program: OsString,
    pub args: Vec<OsString>,
}

impl ToolCommand {
    pub fn new(label: impl Into<String>, program: impl AsRef<Path>) -> Self {
        Self {
            label: label.into(),
            program: program.as_ref().as_os_str().to_owned(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn path_arg(self, path: &Path) -> Self {
        self.arg(path.as_os_str().to_owned())
    }

    pub fn has_arg(&self, needle: &str) -> bool {
        self.args.iter().any(|a| a == needle)
    }
}

impl fmt::Display for ToolCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program.to_string_lossy())?;
        for arg in &self.args {
            write!(f, " {}", arg.to_string_lossy())?;
        }
        Ok(())
    }
}

/// How a tool run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolExit {
    Exited(i32),
    Cancelled,
}

/// A running external process owned by exactly one stage.
pub struct SubprocessHandle {
    label: String,
    child: Child,
    stdin: Option<ChildStdin>,
    forwarders: Vec<JoinHandle<()>>,
}

impl SubprocessHandle {
    /// Launch `cmd`. Stdout and stderr are forwarded line by line as progress events.
    pub fn spawn(
        cmd: &ToolCommand,
        events: &EventSink,
        pipe_stdin: bool,
    ) -> Result<Self, PipelineError> {
        tracing::info!("Starting {}: {}", cmd.label, cmd);

        let mut child = Command::new(&cmd.program)
            .args(&cmd.args)
            .stdin(if pipe_stdin {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| PipelineError::SubprocessSpawnError {
                program: cmd.program.to_string_lossy().into_owned(),
                source,
            })?;

        let mut forwarders = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            forwarders.push(forward_output(stdout, cmd.label.clone(), events.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            forwarders.push(forward_output(stderr, cmd.label.clone(), events.clone()));
        }

        Ok(Self {
            label: cmd.label.clone(),
            stdin: child.stdin.take(),
            child,
            forwarders,
        })
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn take_stdin(&mut self) -> Option<ChildStdin> {
        self.stdin.take()
    }

    /// Exit code if the process has already exited. Never blocks.
    pub fn try_exit_code(&mut self) -> Option<i32> {
        match self.child.try_wait() {
            Ok(Some(status)) => Some(status.code().unwrap_or(-1)),
            Ok(None) => None,
            Err(e) => {
                tracing::warn!("Failed to poll {}: {}", self.label, e);
                None
            }
        }
    }

    /// Await exit and the end of its output. Signal deaths report -1.
    pub async fn wait(&mut self) -> Result<i32, PipelineError> {
        // Closing our end first lets a reader of stdin see EOF.
        self.stdin.take();
        let status = self.child.wait().await?;
        for forwarder in self.forwarders.drain(..) {
            let _ = forwarder.await;
        }
        let code = status.code().unwrap_or(-1);
        tracing::info!("{} exited with code {}", self.label, code);
        Ok(code)
    }

    /// Ask the process to stop, force-killing it once `grace` has passed.
    pub async fn terminate(&mut self, grace: Duration) {
        self.stdin.take();

        if self.try_exit_code().is_none() {
            request_stop(&mut self.child);
            match tokio::time::timeout(grace, self.child.wait()).await {
                Ok(_) => tracing::info!("{} stopped", self.label),
                Err(_) => {
                    tracing::warn!(
                        "{} still running after {:?}, killing it",
                        self.label,
                        grace
                    );
                    if let Err(e) = self.child.kill().await {
                        tracing::warn!("Failed to kill {}: {}", self.label, e);
                    }
                }
            }
        }

        // Grandchildren may still hold the pipes open.
        for forwarder in self.forwarders.drain(..) {
            forwarder.abort();
        }
    }
}

#[cfg(unix)]
fn request_stop(child: &mut Child) {
    if let Some(pid) = child.id() {
        // SAFETY: plain kill(2) on a pid we spawned and have not reaped yet.
        let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
        if rc != 0 {
            tracing::debug!(
                "SIGTERM to {} failed: {}",
                pid,
                std::io::Error::last_os_error()
            );
        }
    }
}

#[cfg(not(unix))]
fn request_stop(child: &mut Child) {
    if let Err(e) = child.start_kill() {
        tracing::debug!("Failed to stop child: {}", e);
    }
}

fn forward_output<R>(reader: R, label: String, events: EventSink) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(reader);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match read_segment(&mut reader, &mut buf).await {
                Ok(0) => break,
                Ok(_) => {
                    let line = String::from_utf8_lossy(&buf);
                    let line = line.trim();
                    if !line.is_empty() {
                        tracing::debug!("[{}] {}", label, line);
                        events.progress(line);
                    }
                }
                Err(e) => {
                    tracing::debug!("[{}] output closed: {}", label, e);
                    break;
                }
            }
        }
    })
}

/// Read up to the next `\n` or `\r` (ffmpeg redraws its status line with `\r`).
async fn read_segment<R>(reader: &mut R, out: &mut Vec<u8>) -> std::io::Result<usize>
where
    R: AsyncBufRead + Unpin,
{
    let mut read = 0;
    loop {
        let available = reader.fill_buf().await?;
        if available.is_empty() {
            return Ok(read);
        }
        if let Some(pos) = available.iter().position(|b| *b == b'\n' || *b == b'\r') {
            out.extend_from_slice(&available[..pos]);
            reader.consume(pos + 1);
            return Ok(read + pos + 1);
        }
        let len = available.len();
        out.extend_from_slice(available);
        reader.consume(len);
        read += len;
    }
}

/// Run a tool to completion unless the job is cancelled first.
pub async fn run_tool(
    cmd: &ToolCommand,
    cancel: &CancelHandle,
    events: &EventSink,
    grace: Duration,
) -> Result<ToolExit, PipelineError> {
    if cancel.is_cancelled() {
        return Ok(ToolExit::Cancelled);
    }

    let mut handle = SubprocessHandle::spawn(cmd, events, false)?;
    tokio::select! {
        code = handle.wait() => Ok(ToolExit::Exited(code?)),
        _ = cancel.cancelled() => {
            tracing::info!("Cancelling {}", handle.label());
            handle.terminate(grace).await;
            Ok(ToolExit::Cancelled)
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::pipeline::types::PipelineEvent;
    use std::time::Instant;

    fn sh(script: &str) -> ToolCommand {
        ToolCommand::new("test", "/bin/sh").arg("-c").arg(script)
    }

    #[tokio::test]
    async fn test_run_tool_reports_exit_code_and_output() {
        let (tx, rx) = crossbeam::channel::unbounded();
        let events = EventSink::new(tx);
        let cancel = CancelHandle::new();

        let exit = run_tool(
            &sh("echo hello; printf 'a\\rb\\n' >&2; exit 3"),
            &cancel,
            &events,
            Duration::from_millis(100),
        )
        .await
        .unwrap();
        assert_eq!(exit, ToolExit::Exited(3));

        let lines: Vec<_> = rx
            .try_iter()
            .filter_map(|e| match e {
                PipelineEvent::Progress(line) => Some(line),
                _ => None,
            })
            .collect();
        assert!(lines.contains(&"hello".to_string()));
        assert!(lines.contains(&"a".to_string()));
        assert!(lines.contains(&"b".to_string()));
    }

    #[tokio::test]
    async fn test_missing_program_is_spawn_error() {
        let (tx, _rx) = crossbeam::channel::unbounded();
        let err = run_tool(
            &ToolCommand::new("missing", "/nonexistent/defaceit-tool"),
            &CancelHandle::new(),
            &EventSink::new(tx),
            Duration::from_millis(100),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, PipelineError::SubprocessSpawnError { .. }));
    }

    #[tokio::test]
    async fn test_cancel_terminates_running_tool() {
        let (tx, _rx) = crossbeam::channel::unbounded();
        let cancel = CancelHandle::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let started = Instant::now();
        let exit = run_tool(
            &sh("sleep 5"),
            &cancel,
            &EventSink::new(tx),
            Duration::from_millis(2000),
        )
        .await
        .unwrap();
        assert_eq!(exit, ToolExit::Cancelled);
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[tokio::test]
    async fn test_terminate_kills_after_grace() {
        let (tx, _rx) = crossbeam::channel::unbounded();
        let mut handle =
            SubprocessHandle::spawn(&sh("trap '' TERM; sleep 5"), &EventSink::new(tx), false)
                .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let started = Instant::now();
        handle.terminate(Duration::from_millis(200)).await;
        assert!(started.elapsed() < Duration::from_secs(3));
        assert!(handle.try_exit_code().is_some());
    }

    #[test]
    fn test_command_display() {
        let cmd = ToolCommand::new("merge", "ffmpeg")
            .args(["-i", "a.mp4"])
            .path_arg(Path::new("out.mp4"));
        assert_eq!(cmd.to_string(), "ffmpeg -i a.mp4 out.mp4");
        assert!(cmd.has_arg("-i"));
    }
}
