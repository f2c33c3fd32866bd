use async_trait::async_trait;
use bytes::Bytes;
use image::codecs::jpeg::JpegEncoder;
use image::{DynamicImage, Rgb, RgbImage};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use super::{CameraSource, CaptureError, StillRequest};
use crate::broadcaster::FrameBroadcaster;
use crate::config::StreamConfig;

/// Synthetic camera: a diagonal gradient that drifts a little every frame
pub struct TestPatternSource {
    stream: StreamConfig,
}

pub(crate) fn gradient(width: u32, height: u32, tick: u32) -> RgbImage {
    let w = width.max(1);
    let h = height.max(1);
    RgbImage::from_fn(width, height, |x, y| {
        let r = ((x + tick) * 255 / w) as u8;
        let g = (y * 255 / h) as u8;
        let b = (tick.wrapping_mul(3) % 256) as u8;
        Rgb([r, g, b])
    })
}

pub(crate) fn encode_jpeg(image: RgbImage, quality: u8) -> Result<Bytes, image::ImageError> {
    let mut buf = Vec::new();
    DynamicImage::ImageRgb8(image)
        .write_with_encoder(JpegEncoder::new_with_quality(&mut buf, quality.clamp(1, 100)))?;
    Ok(Bytes::from(buf))
}

impl TestPatternSource {
    pub fn new(stream: StreamConfig) -> Self {
        Self { stream }
    }
}

#[async_trait]
impl CameraSource for TestPatternSource {
    fn name(&self) -> &'static str {
        "test-pattern"
    }

    async fn run_frames(
        &self,
        broadcaster: Arc<FrameBroadcaster>,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<(), CaptureError> {
        let period = Duration::from_secs(1) / self.stream.fps.max(1);
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let (width, height, quality) = (self.stream.width, self.stream.height, self.stream.quality);
        let mut tick = 0u32;

        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = shutdown.recv() => {
                    debug!("test pattern stopped");
                    return Ok(());
                }
            }

            let frame = tokio::task::spawn_blocking(move || {
                encode_jpeg(gradient(width, height, tick % width.max(1)), quality)
            })
            .await;
            match frame {
                Ok(Ok(frame)) => {
                    broadcaster.publish(frame);
                }
                Ok(Err(e)) => warn!(error = %e, "failed to encode test pattern"),
                Err(e) => return Err(CaptureError::Aborted(e.to_string())),
            }
            tick = tick.wrapping_add(4);
        }
    }

    async fn capture_still(&self, request: &StillRequest) -> Result<Bytes, CaptureError> {
        let request = request.clone();
        tokio::task::spawn_blocking(move || {
            let image = gradient(request.resolution.width, request.resolution.height, 0);
            encode_jpeg(image, request.quality)
        })
        .await
        .map_err(|e| CaptureError::Aborted(e.to_string()))?
        .map_err(|e| CaptureError::InvalidImage(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::Resolution;

    #[tokio::test]
    async fn test_still_has_requested_size() {
        let source = TestPatternSource::new(StreamConfig::default());
        let request = StillRequest {
            resolution: Resolution::new(120, 80),
            quality: 75,
        };
        let bytes = source.capture_still(&request).await.unwrap();
        assert_eq!(&bytes[..2], &[0xFF, 0xD8]);

        let decoded = image::load_from_memory(&bytes).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (120, 80));
    }

    #[tokio::test]
    async fn test_frames_published_until_shutdown() {
        let stream = StreamConfig {
            width: 32,
            height: 24,
            fps: 50,
            ..Default::default()
        };
        let source = TestPatternSource::new(stream);
        let broadcaster = Arc::new(FrameBroadcaster::new());
        let (tx, rx) = broadcast::channel(1);

        let task = {
            let broadcaster = broadcaster.clone();
            tokio::spawn(async move { source.run_frames(broadcaster, rx).await })
        };

        let (frame, sequence) =
            tokio::time::timeout(Duration::from_secs(5), broadcaster.wait_next(0))
                .await
                .unwrap();
        assert!(sequence >= 1);
        assert_eq!(&frame.bytes()[..2], &[0xFF, 0xD8]);

        tx.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }
}
