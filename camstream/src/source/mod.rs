use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::info;

use crate::broadcaster::FrameBroadcaster;
use crate::config::Config;

mod command;
mod pattern;

pub use command::{CommandSource, JpegSplitter};
pub use pattern::TestPatternSource;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

impl std::fmt::Display for Resolution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Size of the image as seen upright once the camera is mounted at `rotation` degrees
pub fn output_dimensions(sensor: Resolution, rotation: u32) -> Resolution {
    match rotation % 360 {
        90 | 270 => Resolution::new(sensor.height, sensor.width),
        _ => sensor,
    }
}

/// One still at the sensor's native orientation; rotation for display is
/// applied after capture
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StillRequest {
    pub resolution: Resolution,
    pub quality: u8,
}

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("camera unavailable: {0}")]
    Unavailable(String),

    #[error("failed to spawn `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("camera command exited with {status}: {stderr}")]
    CommandFailed { status: String, stderr: String },

    #[error("camera returned no image data")]
    Empty,

    #[error("camera returned an unreadable image: {0}")]
    InvalidImage(String),

    #[error("capture timed out after {0:?}")]
    Timeout(Duration),

    #[error("capture task aborted: {0}")]
    Aborted(String),
}

/// The camera driver seen from the server: a live frame feed plus one-shot
/// high resolution stills. Stills never go through the live frame slot.
#[async_trait]
pub trait CameraSource: Send + Sync {
    fn name(&self) -> &'static str;

    /// Push frames into `broadcaster` until `shutdown` fires
    async fn run_frames(
        &self,
        broadcaster: Arc<FrameBroadcaster>,
        shutdown: broadcast::Receiver<()>,
    ) -> Result<(), CaptureError>;

    async fn capture_still(&self, request: &StillRequest) -> Result<Bytes, CaptureError>;
}

/// Command-driven camera when any command is configured, test pattern otherwise
pub fn from_config(config: &Config) -> Arc<dyn CameraSource> {
    if config.stream.command.trim().is_empty() && config.still.command.trim().is_empty() {
        info!("no camera command configured, serving the test pattern");
        Arc::new(TestPatternSource::new(config.stream.clone()))
    } else {
        info!(
            stream = %config.stream.command,
            still = %config.still.command,
            "using camera commands"
        );
        Arc::new(CommandSource::new(
            config.stream.command.clone(),
            config.still.command.clone(),
        ))
    }
}

#[cfg(test)]
pub(crate) fn pattern_jpeg(width: u32, height: u32) -> Vec<u8> {
    pattern::encode_jpeg(pattern::gradient(width, height, 0), 80)
        .unwrap()
        .to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_output_dimensions() {
        let sensor = Resolution::new(1920, 1080);
        assert_eq!(output_dimensions(sensor, 0), sensor);
        assert_eq!(output_dimensions(sensor, 180), sensor);
        assert_eq!(output_dimensions(sensor, 90), Resolution::new(1080, 1920));
        assert_eq!(output_dimensions(sensor, 270), Resolution::new(1080, 1920));
    }

    #[test]
    fn test_from_config_picks_pattern_without_commands() {
        let config = Config::default();
        assert_eq!(from_config(&config).name(), "test-pattern");

        let mut config = Config::default();
        config.stream.command = "rpicam-vid -t 0 --codec mjpeg -o -".to_string();
        assert_eq!(from_config(&config).name(), "command");
    }
}
