use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use super::{CameraSource, CaptureError, StillRequest};
use crate::broadcaster::FrameBroadcaster;

const SOI: [u8; 2] = [0xFF, 0xD8];
const EOI: [u8; 2] = [0xFF, 0xD9];

/// Largest frame accepted from the stream command before resynchronising
const MAX_FRAME_SIZE: usize = 8 * 1024 * 1024;
const RESTART_DELAY: Duration = Duration::from_secs(2);

/// Cuts a raw MJPEG byte stream into individual JPEG images.
#[derive(Default)]
pub struct JpegSplitter {
    buf: BytesMut,
}

fn find(haystack: &[u8], needle: [u8; 2], from: usize) -> Option<usize> {
    haystack
        .get(from..)?
        .windows(2)
        .position(|w| w == needle)
        .map(|p| p + from)
}

impl JpegSplitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk of stdout, get back every frame it completed
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Bytes> {
        self.buf.extend_from_slice(chunk);
        let mut frames = Vec::new();

        loop {
            let Some(start) = find(&self.buf, SOI, 0) else {
                // Keep a trailing 0xFF, it may be the first half of a marker
                let keep = usize::from(self.buf.last() == Some(&0xFF));
                let discard = self.buf.len() - keep;
                let _ = self.buf.split_to(discard);
                break;
            };
            if start > 0 {
                let _ = self.buf.split_to(start);
            }

            match find(&self.buf, EOI, SOI.len()) {
                Some(end) => {
                    frames.push(self.buf.split_to(end + EOI.len()).freeze());
                }
                None => {
                    if self.buf.len() > MAX_FRAME_SIZE {
                        warn!(
                            size = self.buf.len(),
                            "frame exceeds limit without end marker, dropping"
                        );
                        self.buf.clear();
                    }
                    break;
                }
            }
        }
        frames
    }
}

fn split_command(command: &str) -> Result<(String, Vec<String>), CaptureError> {
    let mut args = shellwords::split(command)
        .map_err(|e| CaptureError::Unavailable(format!("invalid command {:?}: {}", command, e)))?;
    if args.is_empty() {
        return Err(CaptureError::Unavailable("empty command".to_string()));
    }
    let program = args.remove(0);
    Ok((program, args))
}

/// Fill `{width}`, `{height}` and `{quality}` in a still template
pub fn still_command(template: &str, request: &StillRequest) -> String {
    template
        .replace("{width}", &request.resolution.width.to_string())
        .replace("{height}", &request.resolution.height.to_string())
        .replace("{quality}", &request.quality.to_string())
}

/// Camera driven by external programs writing JPEG data to stdout,
/// e.g. `rpicam-vid -t 0 --codec mjpeg -o -` and `rpicam-still -o -`.
pub struct CommandSource {
    stream_command: String,
    still_command: String,
}

impl CommandSource {
    pub fn new(stream_command: String, still_command: String) -> Self {
        Self {
            stream_command,
            still_command,
        }
    }

    async fn stream_once(
        &self,
        broadcaster: &FrameBroadcaster,
        shutdown: &mut broadcast::Receiver<()>,
    ) -> Result<bool, CaptureError> {
        let (program, args) = split_command(&self.stream_command)?;
        let mut child = Command::new(&program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| CaptureError::Spawn {
                command: self.stream_command.clone(),
                source,
            })?;
        info!(pid = ?child.id(), "stream command started");

        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| CaptureError::Unavailable("stream command has no stdout".to_string()))?;
        let mut splitter = JpegSplitter::new();
        let mut chunk = vec![0u8; 64 * 1024];

        loop {
            tokio::select! {
                read = stdout.read(&mut chunk) => {
                    match read {
                        Ok(0) => {
                            let status = child.wait().await.ok();
                            warn!(?status, "stream command ended");
                            return Ok(false);
                        }
                        Ok(n) => {
                            for frame in splitter.push(&chunk[..n]) {
                                broadcaster.publish(frame);
                            }
                        }
                        Err(e) => {
                            error!(error = %e, "failed to read stream command output");
                            return Ok(false);
                        }
                    }
                }
                _ = shutdown.recv() => {
                    if let Err(e) = child.kill().await {
                        warn!(error = %e, "failed to stop stream command");
                    }
                    debug!("stream command stopped");
                    return Ok(true);
                }
            }
        }
    }
}

#[async_trait]
impl CameraSource for CommandSource {
    fn name(&self) -> &'static str {
        "command"
    }

    async fn run_frames(
        &self,
        broadcaster: Arc<FrameBroadcaster>,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<(), CaptureError> {
        if self.stream_command.trim().is_empty() {
            warn!("no stream command configured, live stream stays empty");
            let _ = shutdown.recv().await;
            return Ok(());
        }

        loop {
            match self.stream_once(&broadcaster, &mut shutdown).await {
                Ok(true) => return Ok(()),
                Ok(false) => {}
                Err(e) => error!(error = %e, "stream command failed"),
            }
            tokio::select! {
                _ = tokio::time::sleep(RESTART_DELAY) => {
                    info!("restarting stream command");
                }
                _ = shutdown.recv() => return Ok(()),
            }
        }
    }

    async fn capture_still(&self, request: &StillRequest) -> Result<Bytes, CaptureError> {
        if self.still_command.trim().is_empty() {
            return Err(CaptureError::Unavailable(
                "no still command configured".to_string(),
            ));
        }
        let command = still_command(&self.still_command, request);
        let (program, args) = split_command(&command)?;
        debug!(%command, "running still command");

        let output = Command::new(&program)
            .args(args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|source| CaptureError::Spawn {
                command: command.clone(),
                source,
            })?;

        if !output.status.success() {
            return Err(CaptureError::CommandFailed {
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        if output.stdout.is_empty() {
            return Err(CaptureError::Empty);
        }
        Ok(Bytes::from(output.stdout))
    }
}
