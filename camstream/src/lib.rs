use axum::Router;
use axum::http::{StatusCode, header};
use axum::response::IntoResponse;
use axum::routing::get;
use chrono::{DateTime, Local};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicUsize;
use std::sync::{Arc, RwLock};
use tokio::net::TcpListener;
use tokio::sync::{Mutex, broadcast};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use self::broadcaster::FrameBroadcaster;
use self::config::Config;
use self::source::CameraSource;
use self::still::{CaptureReport, RemoteUploader, StillPipeline, Uploader};

pub mod api;
pub mod broadcaster;
pub mod config;
pub mod error;
pub mod orientation;
pub mod overlay;
pub mod source;
pub mod still;
pub mod stream;
pub mod utils;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<RwLock<Config>>,
    pub broadcaster: Arc<FrameBroadcaster>,
    pub pipeline: Arc<StillPipeline>,
    pub viewers: Arc<AtomicUsize>,
    pub shutdown: broadcast::Sender<()>,
    /// Target of `POST /api/config`
    pub save_path: Arc<PathBuf>,
    /// Held across read, validate, save and swap of a config update
    pub config_writer: Arc<Mutex<()>>,
}

impl AppState {
    pub fn new(
        config: Config,
        source: Arc<dyn CameraSource>,
        uploader: Arc<dyn Uploader>,
        save_path: PathBuf,
    ) -> Self {
        let (shutdown, _) = broadcast::channel(1);
        Self {
            config: Arc::new(RwLock::new(config)),
            broadcaster: Arc::new(FrameBroadcaster::new()),
            pipeline: Arc::new(StillPipeline::new(source, uploader)),
            viewers: Arc::new(AtomicUsize::new(0)),
            shutdown,
            save_path: Arc::new(save_path),
            config_writer: Arc::new(Mutex::new(())),
        }
    }
}

async fn health_check() -> impl IntoResponse {
    use serde_json::json;
    axum::Json(json!({
        "status": "ok",
        "service": "picast",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "version": env!("CARGO_PKG_VERSION")
    }))
}

async fn index() -> impl IntoResponse {
    (
        StatusCode::MOVED_PERMANENTLY,
        [(header::LOCATION, "/stream.mjpg")],
    )
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/stream.mjpg", get(stream::stream_handler))
        .route("/snapshot.jpg", get(stream::snapshot_handler))
        .route("/api/health", get(health_check))
        .merge(api::create_api_router())
        .fallback(|| async { (StatusCode::NOT_FOUND, "404 Not Found") })
        .with_state(state)
}

pub async fn serve(
    mut cfg: Config,
    save_path: PathBuf,
    listener: TcpListener,
    shutdown_signal: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    cfg.validate()?;
    let cors = cfg.http.cors;
    let source = source::from_config(&cfg);
    let state = AppState::new(cfg, source.clone(), Arc::new(RemoteUploader), save_path);

    let frames = {
        let broadcaster = state.broadcaster.clone();
        let shutdown = state.shutdown.subscribe();
        tokio::spawn(async move {
            if let Err(e) = source.run_frames(broadcaster, shutdown).await {
                error!(source = source.name(), error = %e, "camera source stopped");
            }
        })
    };

    let mut app = create_router(state.clone()).layer(TraceLayer::new_for_http());
    if cors {
        app = app.layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(vec![header::CONTENT_TYPE]),
        );
    }

    info!("picast listening on {}", listener.local_addr()?);
    let shutdown = state.shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal.await;
            info!("shutdown signal received, closing streams");
            let _ = shutdown.send(());
        })
        .await?;

    if let Err(e) = frames.await {
        error!(error = %e, "camera source task failed");
    }
    Ok(())
}

/// One still job outside the server, for `picast capture`
pub async fn capture_once(mut cfg: Config) -> anyhow::Result<CaptureReport> {
    cfg.validate()?;
    let pipeline = StillPipeline::new(source::from_config(&cfg), Arc::new(RemoteUploader));
    let permit = pipeline.try_start()?;
    Ok(pipeline.run(permit, cfg).await)
}

/// Push an already saved still again, for `picast upload`
pub async fn upload_file(
    mut cfg: Config,
    file: &Path,
) -> anyhow::Result<transfer::TransferReceipt> {
    cfg.validate()?;
    if !cfg.transfer.is_active() {
        anyhow::bail!("transfer is disabled or has no host configured");
    }
    // Dated folders follow the file's own timestamp, not today's date
    let modified: DateTime<Local> = std::fs::metadata(file)?.modified()?.into();
    let task = still::upload_task(&cfg, file, &modified);
    Ok(RemoteUploader.upload(task).await?)
}
