use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Local, TimeZone};
use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::PngEncoder;
use image::imageops::{self, FilterType};
use image::{DynamicImage, RgbaImage};
use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use thiserror::Error;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, error, info, warn};
use transfer::{Credentials, Destination, TransferError, TransferReceipt, TransferTask};

use crate::config::{Config, StillConfig};
use crate::orientation::{embed_orientation, exif_orientation, native, upright};
use crate::overlay::{OverlayCompositor, label_text};
use crate::source::{CameraSource, CaptureError, StillRequest, output_dimensions};

const FILE_TIMESTAMP_FORMAT: &str = "%Y%m%d_%H%M%S";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StillStatus {
    Requested,
    Captured,
    Composited,
    Saved,
    Transferring,
    Done,
    Failed,
}

impl StillStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, StillStatus::Done | StillStatus::Failed)
    }

    /// Forward by exactly one step, or to `Failed` from any live state
    pub fn can_advance_to(self, next: StillStatus) -> bool {
        use StillStatus::*;
        if self.is_terminal() {
            return false;
        }
        matches!(
            (self, next),
            (_, Failed)
                | (Requested, Captured)
                | (Captured, Composited)
                | (Composited, Saved)
                | (Saved, Transferring)
                | (Transferring, Done)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    CaptureError,
    SaveError,
    TransferError,
}

#[derive(Debug, Error)]
pub enum SaveError {
    #[error("failed to create output directory {}: {source}", path.display())]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write {}: {source}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to encode still: {0}")]
    Encode(String),
}

#[derive(Debug, Error)]
pub enum StageError {
    #[error(transparent)]
    Capture(#[from] CaptureError),
    #[error(transparent)]
    Save(#[from] SaveError),
    #[error(transparent)]
    Transfer(#[from] TransferError),
}

impl StageError {
    pub fn reason(&self) -> FailureReason {
        match self {
            StageError::Capture(_) => FailureReason::CaptureError,
            StageError::Save(_) => FailureReason::SaveError,
            StageError::Transfer(_) => FailureReason::TransferError,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TransferStatus {
    NotAttempted,
    Skipped,
    Sent {
        protocol: String,
        host: String,
        remote_path: String,
        bytes: u64,
    },
    Failed {
        reason: String,
        message: String,
    },
}

impl From<TransferReceipt> for TransferStatus {
    fn from(receipt: TransferReceipt) -> Self {
        TransferStatus::Sent {
            protocol: receipt.protocol.to_string(),
            host: receipt.host,
            remote_path: receipt.remote_path,
            bytes: receipt.bytes,
        }
    }
}

/// What the capture endpoint answers with once a job is finished
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaptureReport {
    pub success: bool,
    pub job: u64,
    pub status: StillStatus,
    pub reason: Option<FailureReason>,
    pub error: Option<String>,
    /// File name of the saved still
    pub file: Option<String>,
    pub path: Option<PathBuf>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub orientation: Option<u16>,
    pub transfer: TransferStatus,
    pub warnings: Vec<String>,
    pub history: Vec<StillStatus>,
    pub captured_at: String,
}

/// One still capture from request to terminal state
#[derive(Debug, Clone)]
pub struct StillJob {
    pub id: u64,
    pub output_path: PathBuf,
    pub overlay_text: String,
    pub quality: u8,
    pub captured_at: DateTime<Local>,
    status: StillStatus,
    history: Vec<StillStatus>,
}

impl StillJob {
    pub fn new(id: u64, config: &Config, captured_at: DateTime<Local>) -> Self {
        let file_name = still_file_name(
            &config.still.file_name,
            &config.camera.name,
            &captured_at,
            &config.still.extension,
        );
        let overlay_text = label_text(
            &config.camera.name,
            config.still.embed_timestamp.then_some(&captured_at),
        );
        Self {
            id,
            output_path: config.still.output_dir.join(file_name),
            overlay_text,
            quality: config.still.quality,
            captured_at,
            status: StillStatus::Requested,
            history: vec![StillStatus::Requested],
        }
    }

    pub fn status(&self) -> StillStatus {
        self.status
    }

    pub fn history(&self) -> &[StillStatus] {
        &self.history
    }

    pub fn file_name(&self) -> String {
        self.output_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    fn advance(&mut self, next: StillStatus) {
        debug_assert!(
            self.status.can_advance_to(next),
            "illegal still transition {:?} -> {:?}",
            self.status,
            next
        );
        debug!(job = self.id, from = ?self.status, to = ?next, "still job advanced");
        self.status = next;
        self.history.push(next);
    }
}

fn sanitize(value: &str) -> String {
    value
        .trim()
        .chars()
        .filter(|c| !c.is_control())
        .map(|c| match c {
            '/' | '\\' | ':' => '_',
            c if c.is_whitespace() => '_',
            c => c,
        })
        .collect()
}

/// `{name}` and `{timestamp}` are filled in, then `.{extension}` appended
pub fn still_file_name<Tz>(pattern: &str, name: &str, at: &DateTime<Tz>, extension: &str) -> String
where
    Tz: TimeZone,
    Tz::Offset: Display,
{
    let stem = pattern
        .replace("{name}", name)
        .replace("{timestamp}", &at.format(FILE_TIMESTAMP_FORMAT).to_string());
    format!("{}.{}", sanitize(&stem), extension)
}

/// Remote delivery of a saved still
#[async_trait]
pub trait Uploader: Send + Sync {
    async fn upload(&self, task: TransferTask) -> Result<TransferReceipt, TransferError>;
}

/// SFTP/FTP delivery through the transfer crate
pub struct RemoteUploader;

#[async_trait]
impl Uploader for RemoteUploader {
    async fn upload(&self, task: TransferTask) -> Result<TransferReceipt, TransferError> {
        transfer::send(task).await
    }
}

#[derive(Debug, Error)]
#[error("a still capture is already in progress")]
pub struct Busy;

/// Held for the whole life of a job; only one exists at a time
pub struct JobPermit {
    busy: Arc<AtomicBool>,
    _guard: OwnedMutexGuard<()>,
}

impl Drop for JobPermit {
    fn drop(&mut self) {
        self.busy.store(false, Ordering::SeqCst);
    }
}

#[derive(Default)]
struct Outcome {
    warnings: Vec<String>,
    saved: Option<PathBuf>,
    width: Option<u32>,
    height: Option<u32>,
    orientation: Option<u16>,
    transfer: Option<TransferStatus>,
}

pub struct StillPipeline {
    source: Arc<dyn CameraSource>,
    uploader: Arc<dyn Uploader>,
    gate: Arc<Mutex<()>>,
    busy: Arc<AtomicBool>,
    next_id: AtomicU64,
    last: std::sync::Mutex<Option<CaptureReport>>,
}

impl StillPipeline {
    pub fn new(source: Arc<dyn CameraSource>, uploader: Arc<dyn Uploader>) -> Self {
        Self {
            source,
            uploader,
            gate: Arc::new(Mutex::new(())),
            busy: Arc::new(AtomicBool::new(false)),
            next_id: AtomicU64::new(1),
            last: std::sync::Mutex::new(None),
        }
    }

    /// Claim the pipeline, or fail straight away if a job is running
    pub fn try_start(&self) -> Result<JobPermit, Busy> {
        let guard = self.gate.clone().try_lock_owned().map_err(|_| Busy)?;
        self.busy.store(true, Ordering::SeqCst);
        Ok(JobPermit {
            busy: self.busy.clone(),
            _guard: guard,
        })
    }

    /// Read only; never contends with [`StillPipeline::try_start`]
    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::SeqCst)
    }

    pub fn last_report(&self) -> Option<CaptureReport> {
        self.last.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Run one job to completion against a configuration snapshot
    pub async fn run(&self, _permit: JobPermit, config: Config) -> CaptureReport {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut job = StillJob::new(id, &config, Local::now());
        info!(job = id, path = %job.output_path.display(), "still capture requested");

        let mut outcome = Outcome::default();
        let result = self.execute(&mut job, &config, &mut outcome).await;

        let (reason, error) = match &result {
            Ok(()) => {
                info!(job = id, path = %job.output_path.display(), "still capture done");
                (None, None)
            }
            Err(e) => {
                job.advance(StillStatus::Failed);
                match e {
                    StageError::Transfer(_) => {
                        warn!(job = id, error = %e, "still saved locally but transfer failed")
                    }
                    _ => error!(job = id, error = %e, "still capture failed"),
                }
                (Some(e.reason()), Some(e.to_string()))
            }
        };

        let report = CaptureReport {
            success: result.is_ok(),
            job: id,
            status: job.status(),
            reason,
            error,
            file: outcome.saved.as_ref().map(|_| job.file_name()),
            path: outcome.saved,
            width: outcome.width,
            height: outcome.height,
            orientation: outcome.orientation,
            transfer: outcome.transfer.unwrap_or(TransferStatus::NotAttempted),
            warnings: outcome.warnings,
            history: job.history().to_vec(),
            captured_at: job.captured_at.to_rfc3339(),
        };
        *self.last.lock().unwrap_or_else(|e| e.into_inner()) = Some(report.clone());
        report
    }

    async fn execute(
        &self,
        job: &mut StillJob,
        config: &Config,
        outcome: &mut Outcome,
    ) -> Result<(), StageError> {
        let raw = self.capture(config).await?;
        job.advance(StillStatus::Captured);

        let (image, warnings) = compose(raw, config, job.overlay_text.clone()).await?;
        outcome.width = Some(image.width());
        outcome.height = Some(image.height());
        outcome.warnings = warnings;
        job.advance(StillStatus::Composited);

        let (data, orientation) = encode(image, config).await?;
        write_atomic(&job.output_path, &data).await?;
        outcome.orientation = orientation;
        outcome.saved = Some(job.output_path.clone());
        info!(job = job.id, path = %job.output_path.display(), bytes = data.len(), "still saved");
        job.advance(StillStatus::Saved);

        job.advance(StillStatus::Transferring);
        if !config.transfer.is_active() {
            debug!(job = job.id, "transfer disabled, keeping still local only");
            outcome.transfer = Some(TransferStatus::Skipped);
        } else {
            let task = upload_task(config, &job.output_path, &job.captured_at);
            match self.uploader.upload(task).await {
                Ok(receipt) => outcome.transfer = Some(receipt.into()),
                Err(e) => {
                    outcome.transfer = Some(TransferStatus::Failed {
                        reason: e.reason().to_string(),
                        message: e.to_string(),
                    });
                    return Err(e.into());
                }
            }
        }
        job.advance(StillStatus::Done);
        Ok(())
    }

    async fn capture(&self, config: &Config) -> Result<Bytes, CaptureError> {
        let request = StillRequest {
            resolution: config.camera.sensor(),
            quality: config.still.quality,
        };
        let warmup = config.still.warmup();
        if !warmup.is_zero() {
            debug!(?warmup, "waiting for the sensor to settle");
            tokio::time::sleep(warmup).await;
        }

        let timeout = config.still.capture_timeout();
        debug!(
            resolution = %request.resolution,
            upright = %output_dimensions(request.resolution, config.camera.rotation),
            source = self.source.name(),
            "capturing still"
        );
        match tokio::time::timeout(timeout, self.source.capture_still(&request)).await {
            Ok(result) => result,
            Err(_) => Err(CaptureError::Timeout(timeout)),
        }
    }
}

/// Upload of `source` as configured in `config`. With dated directories the
/// date of `captured_at` picks the remote folder.
pub fn upload_task(config: &Config, source: &Path, captured_at: &DateTime<Local>) -> TransferTask {
    let t = &config.transfer;
    let file_name = source
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let remote_path = if t.dated_dirs {
        transfer::dated_remote_path(&t.destination, captured_at, &file_name)
    } else {
        transfer::remote_path(&t.destination, &file_name)
    };
    TransferTask {
        source: source.to_path_buf(),
        destination: Destination {
            host: t.host.trim().to_string(),
            port: t.port,
            remote_path,
        },
        credentials: Credentials {
            username: t.username.clone(),
            password: t.password.clone(),
        },
        protocol: t.protocol,
        timeout: t.timeout(),
    }
}

/// Scale to the configured output size, keeping the aspect ratio when only
/// one side is given
fn resize_for_output(image: RgbaImage, still: &StillConfig) -> RgbaImage {
    let (width, height) = image.dimensions();
    let scaled = |side: u32, to: u32, from: u32| {
        ((side as u64 * to as u64 + from as u64 / 2) / from.max(1) as u64).max(1) as u32
    };
    let target = match (still.output_width, still.output_height) {
        (None, None) => return image,
        (Some(w), Some(h)) => (w, h),
        (Some(w), None) => (w, scaled(height, w, width)),
        (None, Some(h)) => (scaled(width, h, height), h),
    };
    if target == (width, height) {
        return image;
    }
    debug!(from = ?(width, height), to = ?target, "resizing still");
    imageops::resize(&image, target.0, target.1, FilterType::Triangle)
}

/// Decode the camera output, turn it upright, draw the label in the
/// top-left corner and scale it to the output size. An undecodable still
/// counts as a failed capture; overlay trouble only adds warnings.
async fn compose(
    raw: Bytes,
    config: &Config,
    text: String,
) -> Result<(RgbaImage, Vec<String>), CaptureError> {
    let overlay = config.overlay.clone();
    let still = config.still.clone();
    let rotation = config.camera.rotation;
    tokio::task::spawn_blocking(move || -> Result<(RgbaImage, Vec<String>), CaptureError> {
        let decoded = image::load_from_memory(&raw)
            .map_err(|e| CaptureError::InvalidImage(e.to_string()))?
            .to_rgba8();
        let base = upright(decoded, rotation);

        let mut warnings = Vec::new();
        let labelled = if overlay.enabled {
            let compositor = OverlayCompositor::from_config(&overlay);
            let rendered = compositor.render(
                &text,
                overlay.font_size,
                &overlay.text_color,
                &overlay.text_background,
            );
            warnings.extend(rendered.warnings.iter().map(|w| w.to_string()));
            OverlayCompositor::composite(base, &rendered.canvas, (0, 0))
        } else {
            base
        };

        Ok((resize_for_output(labelled, &still), warnings))
    })
    .await
    .map_err(|e| CaptureError::Aborted(e.to_string()))?
}

async fn encode(image: RgbaImage, config: &Config) -> Result<(Vec<u8>, Option<u16>), SaveError> {
    let still = config.still.clone();
    let rotation = config.camera.rotation;
    tokio::task::spawn_blocking(move || encode_still(image, &still, rotation))
        .await
        .map_err(|e| SaveError::Encode(e.to_string()))?
}

/// PNG carries no orientation marker, so it is stored upright. JPEG goes
/// back to the sensor's orientation and is tagged so viewers turn it upright.
fn encode_still(
    image: RgbaImage,
    still: &StillConfig,
    rotation: u32,
) -> Result<(Vec<u8>, Option<u16>), SaveError> {
    let mut buf = Vec::new();
    if still.is_png() {
        DynamicImage::ImageRgba8(image)
            .write_with_encoder(PngEncoder::new(&mut buf))
            .map_err(|e| SaveError::Encode(e.to_string()))?;
        return Ok((buf, None));
    }

    let rgb = DynamicImage::ImageRgba8(native(image, rotation)).to_rgb8();
    DynamicImage::ImageRgb8(rgb)
        .write_with_encoder(JpegEncoder::new_with_quality(&mut buf, still.quality))
        .map_err(|e| SaveError::Encode(e.to_string()))?;
    let tagged = embed_orientation(&buf, rotation).map_err(|e| SaveError::Encode(e.to_string()))?;
    Ok((tagged, Some(exif_orientation(rotation))))
}

/// Write next to the target and rename, so the final path is always complete
async fn write_atomic(path: &Path, data: &[u8]) -> Result<(), SaveError> {
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    tokio::fs::create_dir_all(dir)
        .await
        .map_err(|source| SaveError::CreateDir {
            path: dir.to_path_buf(),
            source,
        })?;

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let temp = dir.join(format!(".{}.part", file_name));

    if let Err(source) = tokio::fs::write(&temp, data).await {
        let _ = tokio::fs::remove_file(&temp).await;
        return Err(SaveError::Write { path: temp, source });
    }
    tokio::fs::rename(&temp, path)
        .await
        .map_err(|source| SaveError::Write {
            path: path.to_path_buf(),
            source,
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::orientation::read_orientation;
    use crate::source::TestPatternSource;
    use chrono::FixedOffset;
    use std::sync::Mutex as StdMutex;
    use tokio::sync::broadcast;

    #[derive(Default)]
    struct RecordingUploader {
        tasks: StdMutex<Vec<TransferTask>>,
        fail: bool,
    }

    impl RecordingUploader {
        fn failing() -> Self {
            Self {
                fail: true,
                ..Default::default()
            }
        }

        fn tasks(&self) -> Vec<TransferTask> {
            self.tasks.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Uploader for RecordingUploader {
        async fn upload(&self, task: TransferTask) -> Result<TransferReceipt, TransferError> {
            self.tasks.lock().unwrap().push(task.clone());
            if self.fail {
                return Err(TransferError::Connect {
                    host: task.destination.host,
                    port: 22,
                    message: "connection refused".to_string(),
                });
            }
            let bytes = std::fs::metadata(&task.source).unwrap().len();
            Ok(TransferReceipt {
                protocol: task.protocol,
                host: task.destination.host,
                remote_path: task.destination.remote_path,
                bytes,
            })
        }
    }

    struct BrokenCamera;

    #[async_trait]
    impl CameraSource for BrokenCamera {
        fn name(&self) -> &'static str {
            "broken"
        }

        async fn run_frames(
            &self,
            _broadcaster: Arc<crate::broadcaster::FrameBroadcaster>,
            mut shutdown: broadcast::Receiver<()>,
        ) -> Result<(), CaptureError> {
            let _ = shutdown.recv().await;
            Ok(())
        }

        async fn capture_still(&self, _request: &StillRequest) -> Result<Bytes, CaptureError> {
            Err(CaptureError::Unavailable("camera not detected".to_string()))
        }
    }

    fn test_config(dir: &Path) -> Config {
        let mut config = Config::default();
        config.camera.name = "yard cam".to_string();
        config.camera.sensor_width = 320;
        config.camera.sensor_height = 240;
        config.still.output_dir = dir.join("stills");
        config.transfer.enabled = true;
        config.transfer.host = "files.example.com".to_string();
        config.transfer.username = "cam".to_string();
        config.transfer.password = "secret".to_string();
        config.transfer.destination = "cams".to_string();
        config.validate().unwrap();
        config
    }

    fn pipeline(uploader: Arc<RecordingUploader>) -> StillPipeline {
        let source = Arc::new(TestPatternSource::new(Default::default()));
        StillPipeline::new(source, uploader)
    }

    fn files_in(dir: &Path) -> Vec<PathBuf> {
        match std::fs::read_dir(dir) {
            Ok(entries) => entries.map(|e| e.unwrap().path()).collect(),
            Err(_) => Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_successful_capture_is_saved_and_sent() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let uploader = Arc::new(RecordingUploader::default());
        let pipeline = pipeline(uploader.clone());

        let permit = pipeline.try_start().unwrap();
        let report = pipeline.run(permit, config).await;

        assert!(report.success, "{report:?}");
        assert_eq!(report.status, StillStatus::Done);
        assert_eq!(
            report.history,
            vec![
                StillStatus::Requested,
                StillStatus::Captured,
                StillStatus::Composited,
                StillStatus::Saved,
                StillStatus::Transferring,
                StillStatus::Done,
            ]
        );
        let path = report.path.clone().unwrap();
        assert!(path.exists());
        let file = report.file.clone().unwrap();
        assert!(file.starts_with("yard_cam_"));
        assert!(file.ends_with(".jpg"));
        assert_eq!((report.width, report.height), (Some(320), Some(240)));

        let tasks = uploader.tasks();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].source, path);
        assert_eq!(tasks[0].destination.remote_path, format!("cams/{}", file));
        assert_eq!(tasks[0].credentials.password, "secret");
        assert!(matches!(report.transfer, TransferStatus::Sent { .. }));

        // No temp files left behind
        assert_eq!(files_in(&dir.path().join("stills")), vec![path]);
        assert_eq!(pipeline.last_report(), Some(report));
    }

    #[tokio::test]
    async fn test_overlay_is_drawn_top_left() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path());
        config.transfer.enabled = false;
        config.still.extension = "png".to_string();
        config.overlay.text_background = "#ff0000".to_string();

        let pipeline = pipeline(Arc::new(RecordingUploader::default()));
        let report = pipeline.run(pipeline.try_start().unwrap(), config).await;
        assert!(report.success);
        assert_eq!(report.orientation, None);

        let saved = image::open(report.path.unwrap()).unwrap().to_rgba8();
        assert_eq!(saved.get_pixel(0, 0).0, [255, 0, 0, 255]);
        assert_eq!(saved.get_pixel(2, 2).0, [255, 0, 0, 255]);
    }

    #[tokio::test]
    async fn test_transfer_disabled_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path());
        config.transfer.enabled = false;
        let uploader = Arc::new(RecordingUploader::default());
        let pipeline = pipeline(uploader.clone());

        let report = pipeline.run(pipeline.try_start().unwrap(), config).await;

        assert!(report.success);
        assert_eq!(report.status, StillStatus::Done);
        assert_eq!(report.transfer, TransferStatus::Skipped);
        assert!(uploader.tasks().is_empty());
    }

    #[tokio::test]
    async fn test_capture_failure_produces_no_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let uploader = Arc::new(RecordingUploader::default());
        let pipeline = StillPipeline::new(Arc::new(BrokenCamera), uploader.clone());

        let report = pipeline.run(pipeline.try_start().unwrap(), config).await;

        assert!(!report.success);
        assert_eq!(report.reason, Some(FailureReason::CaptureError));
        assert_eq!(
            report.history,
            vec![StillStatus::Requested, StillStatus::Failed]
        );
        assert!(report.file.is_none());
        assert!(files_in(&dir.path().join("stills")).is_empty());
        assert!(uploader.tasks().is_empty());
        assert_eq!(report.transfer, TransferStatus::NotAttempted);
    }

    #[tokio::test]
    async fn test_save_failure_never_transfers() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path());
        // A regular file where the output directory should be
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, b"x").unwrap();
        config.still.output_dir = blocker;

        let uploader = Arc::new(RecordingUploader::default());
        let pipeline = pipeline(uploader.clone());
        let report = pipeline.run(pipeline.try_start().unwrap(), config).await;

        assert!(!report.success);
        assert_eq!(report.status, StillStatus::Failed);
        assert_eq!(report.reason, Some(FailureReason::SaveError));
        assert_eq!(
            report.history,
            vec![
                StillStatus::Requested,
                StillStatus::Captured,
                StillStatus::Composited,
                StillStatus::Failed,
            ]
        );
        assert!(uploader.tasks().is_empty());
    }

    #[tokio::test]
    async fn test_transfer_failure_keeps_local_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let uploader = Arc::new(RecordingUploader::failing());
        let pipeline = pipeline(uploader.clone());

        let report = pipeline.run(pipeline.try_start().unwrap(), config).await;

        assert!(!report.success);
        assert_eq!(report.status, StillStatus::Failed);
        assert_eq!(report.reason, Some(FailureReason::TransferError));
        assert_eq!(
            report.history,
            vec![
                StillStatus::Requested,
                StillStatus::Captured,
                StillStatus::Composited,
                StillStatus::Saved,
                StillStatus::Transferring,
                StillStatus::Failed,
            ]
        );
        match &report.transfer {
            TransferStatus::Failed { reason, .. } => assert_eq!(reason, "connect_error"),
            other => panic!("unexpected transfer status {other:?}"),
        }

        let path = report.path.unwrap();
        let data = std::fs::read(&path).unwrap();
        assert!(image::load_from_memory(&data).is_ok());
        assert_eq!(uploader.tasks().len(), 1);
    }

    #[tokio::test]
    async fn test_second_job_is_rejected_while_busy() {
        let pipeline = pipeline(Arc::new(RecordingUploader::default()));

        let permit = pipeline.try_start().unwrap();
        assert!(pipeline.is_busy());
        assert!(pipeline.try_start().is_err());

        drop(permit);
        assert!(!pipeline.is_busy());
        assert!(pipeline.try_start().is_ok());
    }

    #[test]
    fn test_busy_polling_never_rejects_a_job() {
        let pipeline = Arc::new(pipeline(Arc::new(RecordingUploader::default())));
        let stop = Arc::new(AtomicBool::new(false));

        let poller = {
            let pipeline = pipeline.clone();
            let stop = stop.clone();
            std::thread::spawn(move || {
                while !stop.load(Ordering::Relaxed) {
                    let _ = pipeline.is_busy();
                }
            })
        };

        for _ in 0..10_000 {
            let permit = pipeline.try_start();
            assert!(permit.is_ok(), "idle pipeline rejected a job");
        }
        stop.store(true, Ordering::Relaxed);
        poller.join().unwrap();
    }

    #[tokio::test]
    async fn test_rotated_mount_is_displayed_upright() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path());
        config.transfer.enabled = false;
        config.camera.sensor_width = 1920;
        config.camera.sensor_height = 1080;
        config.camera.rotation = 270;
        config.overlay.text_background = "#ff0000".to_string();

        let pipeline = pipeline(Arc::new(RecordingUploader::default()));
        let report = pipeline.run(pipeline.try_start().unwrap(), config).await;

        assert!(report.success, "{report:?}");
        assert_eq!((report.width, report.height), (Some(1080), Some(1920)));
        assert_eq!(report.orientation, Some(8));

        // Stored at sensor orientation, tagged so viewers rotate it once
        let data = std::fs::read(report.path.unwrap()).unwrap();
        assert_eq!(read_orientation(&data), Some(8));
        let stored = image::load_from_memory(&data).unwrap().to_rgba8();
        assert_eq!(stored.dimensions(), (1920, 1080));

        let shown = upright(stored, 270);
        assert_eq!(shown.dimensions(), (1080, 1920));
        let [r, g, b, _] = shown.get_pixel(2, 2).0;
        assert!(r > 200 && g < 60 && b < 60, "label not top-left: {:?}", (r, g, b));
    }

    #[tokio::test]
    async fn test_png_on_rotated_mount_is_stored_upright() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path());
        config.transfer.enabled = false;
        config.camera.rotation = 90;
        config.still.extension = "png".to_string();

        let pipeline = pipeline(Arc::new(RecordingUploader::default()));
        let report = pipeline.run(pipeline.try_start().unwrap(), config).await;

        assert!(report.success, "{report:?}");
        assert_eq!(report.orientation, None);
        let saved = image::open(report.path.unwrap()).unwrap();
        assert_eq!((saved.width(), saved.height()), (240, 320));
    }

    #[tokio::test]
    async fn test_output_size_scales_final_still() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path());
        config.transfer.enabled = false;
        config.still.output_width = Some(160);

        let pipeline = pipeline(Arc::new(RecordingUploader::default()));
        let report = pipeline.run(pipeline.try_start().unwrap(), config.clone()).await;
        assert_eq!((report.width, report.height), (Some(160), Some(120)));
        let saved = image::open(report.path.unwrap()).unwrap();
        assert_eq!((saved.width(), saved.height()), (160, 120));

        config.still.output_width = Some(100);
        config.still.output_height = Some(100);
        config.still.file_name = "{name}_square".to_string();
        let report = pipeline.run(pipeline.try_start().unwrap(), config).await;
        assert_eq!((report.width, report.height), (Some(100), Some(100)));
    }

    #[tokio::test]
    async fn test_warmup_delays_the_exposure() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path());
        config.transfer.enabled = false;
        config.still.warmup_ms = 300;

        let pipeline = pipeline(Arc::new(RecordingUploader::default()));
        let started = std::time::Instant::now();
        let report = pipeline.run(pipeline.try_start().unwrap(), config).await;

        assert!(report.success);
        assert!(started.elapsed() >= std::time::Duration::from_millis(300));
    }

    #[tokio::test]
    async fn test_dated_remote_directories() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path());
        config.transfer.dated_dirs = true;
        config.transfer.destination = "/srv/cams".to_string();
        let uploader = Arc::new(RecordingUploader::default());
        let pipeline = pipeline(uploader.clone());

        let report = pipeline.run(pipeline.try_start().unwrap(), config).await;
        assert!(report.success);

        let remote = uploader.tasks()[0].destination.remote_path.clone();
        let captured = DateTime::parse_from_rfc3339(&report.captured_at).unwrap();
        assert_eq!(
            remote,
            format!(
                "/srv/cams/{}/{}",
                captured.format("%Y/%m/%d"),
                report.file.unwrap()
            )
        );
    }

    #[test]
    fn test_still_file_name() {
        let at = FixedOffset::east_opt(0)
            .unwrap()
            .with_ymd_and_hms(2024, 1, 15, 8, 30, 5)
            .unwrap();
        assert_eq!(
            still_file_name("{name}_{timestamp}", "front door", &at, "jpg"),
            "front_door_20240115_083005.jpg"
        );
        assert_eq!(
            still_file_name("{timestamp}-{name}", "a/b", &at, "png"),
            "20240115_083005-a_b.png"
        );
    }

    #[test]
    fn test_status_transitions() {
        use StillStatus::*;
        assert!(Requested.can_advance_to(Captured));
        assert!(Captured.can_advance_to(Failed));
        assert!(Transferring.can_advance_to(Done));
        assert!(!Requested.can_advance_to(Composited));
        assert!(!Saved.can_advance_to(Done));
        assert!(!Done.can_advance_to(Failed));
        assert!(!Failed.can_advance_to(Failed));
    }
}
