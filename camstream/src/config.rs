use serde::{Deserialize, Serialize};
use std::{env, fmt, net::SocketAddr, path::PathBuf, str::FromStr, time::Duration};
use tracing::{info, warn};
use transfer::Protocol;

use crate::source::Resolution;

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct Config {
    #[serde(default)]
    pub http: Http,
    #[serde(default)]
    pub log: Log,
    #[serde(default)]
    pub camera: CameraConfig,
    #[serde(default)]
    pub stream: StreamConfig,
    #[serde(default)]
    pub still: StillConfig,
    #[serde(default)]
    pub overlay: OverlayConfig,
    #[serde(default)]
    pub transfer: TransferConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Http {
    #[serde(default = "default_http_listen")]
    pub listen: SocketAddr,
    #[serde(default)]
    pub cors: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Log {
    #[serde(default = "default_log_level")]
    pub level: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CameraConfig {
    #[serde(default = "default_camera_name")]
    pub name: String,
    /// Mount rotation in degrees, one of 0, 90, 180, 270
    #[serde(default = "default_rotation")]
    pub rotation: u32,
    #[serde(default = "default_sensor_width")]
    pub sensor_width: u32,
    #[serde(default = "default_sensor_height")]
    pub sensor_height: u32,
}

/// Live preview settings. An empty command selects the built-in test pattern.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StreamConfig {
    #[serde(default)]
    pub command: String,
    #[serde(default = "default_stream_width")]
    pub width: u32,
    #[serde(default = "default_stream_height")]
    pub height: u32,
    #[serde(default = "default_fps")]
    pub fps: u32,
    #[serde(default = "default_quality")]
    pub quality: u8,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StillConfig {
    /// Command printing one encoded still on stdout, unrotated. Supports the
    /// `{width}`, `{height}` and `{quality}` placeholders.
    #[serde(default)]
    pub command: String,
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    #[serde(default = "default_extension")]
    pub extension: String,
    #[serde(default = "default_quality")]
    pub quality: u8,
    /// `{name}` and `{timestamp}` are substituted, the extension is appended
    #[serde(default = "default_file_name")]
    pub file_name: String,
    #[serde(default = "default_true")]
    pub embed_timestamp: bool,
    #[serde(default = "default_capture_timeout")]
    pub capture_timeout_secs: u64,
    /// Pause between the request and the exposure so the sensor can settle
    #[serde(default)]
    pub warmup_ms: u64,
    /// Final size of the saved still. With one side set the other follows
    /// the aspect ratio; unset keeps the captured size.
    #[serde(default)]
    pub output_width: Option<u32>,
    #[serde(default)]
    pub output_height: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OverlayConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_text_color")]
    pub text_color: String,
    #[serde(default = "default_text_background")]
    pub text_background: String,
    #[serde(default = "default_font_size")]
    pub font_size: u32,
    /// TrueType/OpenType font; the built-in bitmap font is used when unset or unreadable
    #[serde(default)]
    pub font_path: Option<PathBuf>,
}

#[derive(Clone, Serialize, Deserialize, PartialEq)]
pub struct TransferConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub protocol: Protocol,
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub destination: String,
    /// Append {year}/{month}/{day} below the destination
    #[serde(default)]
    pub dated_dirs: bool,
    #[serde(default = "default_transfer_timeout")]
    pub timeout_secs: u64,
}

fn default_http_listen() -> SocketAddr {
    SocketAddr::from_str(&format!(
        "0.0.0.0:{}",
        env::var("PORT").unwrap_or(String::from("8000"))
    ))
    .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], 8000)))
}

fn default_log_level() -> String {
    env::var("LOG_LEVEL").unwrap_or_else(|_| {
        if cfg!(debug_assertions) {
            "debug".to_string()
        } else {
            "info".to_string()
        }
    })
}

fn default_camera_name() -> String {
    "picast".to_string()
}

fn default_rotation() -> u32 {
    0
}

fn default_sensor_width() -> u32 {
    1920
}

fn default_sensor_height() -> u32 {
    1080
}

fn default_stream_width() -> u32 {
    640
}

fn default_stream_height() -> u32 {
    480
}

fn default_fps() -> u32 {
    24
}

fn default_quality() -> u8 {
    85
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("image_dir")
}

fn default_extension() -> String {
    "jpg".to_string()
}

fn default_file_name() -> String {
    "{name}_{timestamp}".to_string()
}

fn default_true() -> bool {
    true
}

fn default_capture_timeout() -> u64 {
    30
}

fn default_text_color() -> String {
    "white".to_string()
}

fn default_text_background() -> String {
    "black".to_string()
}

fn default_font_size() -> u32 {
    18
}

pub const MAX_FONT_SIZE: u32 = 256;
pub const MAX_OUTPUT_SIDE: u32 = 16384;
const MAX_WARMUP_MS: u64 = 60_000;

fn default_transfer_timeout() -> u64 {
    60
}

impl Default for Http {
    fn default() -> Self {
        Self {
            listen: default_http_listen(),
            cors: Default::default(),
        }
    }
}

impl Default for Log {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            name: default_camera_name(),
            rotation: default_rotation(),
            sensor_width: default_sensor_width(),
            sensor_height: default_sensor_height(),
        }
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            command: String::new(),
            width: default_stream_width(),
            height: default_stream_height(),
            fps: default_fps(),
            quality: default_quality(),
        }
    }
}

impl Default for StillConfig {
    fn default() -> Self {
        Self {
            command: String::new(),
            output_dir: default_output_dir(),
            extension: default_extension(),
            quality: default_quality(),
            file_name: default_file_name(),
            embed_timestamp: default_true(),
            capture_timeout_secs: default_capture_timeout(),
            warmup_ms: 0,
            output_width: None,
            output_height: None,
        }
    }
}

impl Default for OverlayConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            text_color: default_text_color(),
            text_background: default_text_background(),
            font_size: default_font_size(),
            font_path: None,
        }
    }
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            protocol: Protocol::default(),
            host: String::new(),
            port: None,
            username: String::new(),
            password: String::new(),
            destination: String::new(),
            dated_dirs: false,
            timeout_secs: default_transfer_timeout(),
        }
    }
}

impl CameraConfig {
    pub fn sensor(&self) -> Resolution {
        Resolution::new(self.sensor_width, self.sensor_height)
    }
}

impl StillConfig {
    pub fn capture_timeout(&self) -> Duration {
        Duration::from_secs(self.capture_timeout_secs)
    }

    pub fn warmup(&self) -> Duration {
        Duration::from_millis(self.warmup_ms)
    }

    pub fn is_png(&self) -> bool {
        self.extension == "png"
    }
}

impl fmt::Debug for TransferConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransferConfig")
            .field("enabled", &self.enabled)
            .field("protocol", &self.protocol)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &"***")
            .field("destination", &self.destination)
            .field("dated_dirs", &self.dated_dirs)
            .field("timeout_secs", &self.timeout_secs)
            .finish()
    }
}

impl TransferConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Enabled and pointing somewhere
    pub fn is_active(&self) -> bool {
        self.enabled && !self.host.trim().is_empty()
    }
}

/// The user-editable part of the configuration, as exposed over HTTP
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Settings {
    pub camera: CameraConfig,
    pub still: StillConfig,
    pub overlay: OverlayConfig,
    pub transfer: TransferConfig,
}

impl Settings {
    /// Copy with the transfer password blanked out
    pub fn redacted(mut self) -> Self {
        if !self.transfer.password.is_empty() {
            self.transfer.password = String::new();
        }
        self
    }
}

impl Config {
    pub fn settings(&self) -> Settings {
        Settings {
            camera: self.camera.clone(),
            still: self.still.clone(),
            overlay: self.overlay.clone(),
            transfer: self.transfer.clone(),
        }
    }

    /// Replace the editable sections. An empty password keeps the stored one.
    pub fn apply_settings(&mut self, mut settings: Settings) {
        if settings.transfer.password.is_empty() {
            settings.transfer.password = std::mem::take(&mut self.transfer.password);
        }
        self.camera = settings.camera;
        self.still = settings.still;
        self.overlay = settings.overlay;
        self.transfer = settings.transfer;
    }

    pub fn validate(&mut self) -> anyhow::Result<()> {
        if !matches!(self.camera.rotation, 0 | 90 | 180 | 270) {
            anyhow::bail!(
                "unsupported rotation {}; use 0, 90, 180 or 270",
                self.camera.rotation
            );
        }
        if self.camera.sensor_width == 0 || self.camera.sensor_height == 0 {
            anyhow::bail!("camera sensor size must be non-zero");
        }
        if self.stream.fps == 0 || self.stream.fps > 60 {
            anyhow::bail!("stream fps must be between 1 and 60");
        }

        self.stream.quality = self.stream.quality.clamp(1, 100);
        self.still.quality = self.still.quality.clamp(1, 100);

        let ext = self
            .still
            .extension
            .trim()
            .trim_start_matches('.')
            .to_ascii_lowercase();
        self.still.extension = match ext.as_str() {
            "jpg" | "jpeg" | "png" => ext,
            other => {
                warn!("unsupported still extension {:?}, using jpg", other);
                default_extension()
            }
        };

        if self.still.file_name.trim().is_empty() {
            self.still.file_name = default_file_name();
        }

        for side in [&mut self.still.output_width, &mut self.still.output_height] {
            let value = *side;
            match value {
                Some(0) => *side = None,
                Some(n) if n > MAX_OUTPUT_SIDE => {
                    anyhow::bail!("still output size {} exceeds {}", n, MAX_OUTPUT_SIDE)
                }
                _ => {}
            }
        }
        if self.still.warmup_ms > MAX_WARMUP_MS {
            warn!(
                "still.warmup_ms {} too long, using {}",
                self.still.warmup_ms, MAX_WARMUP_MS
            );
            self.still.warmup_ms = MAX_WARMUP_MS;
        }

        let font_size = self.overlay.font_size.clamp(1, MAX_FONT_SIZE);
        if font_size != self.overlay.font_size {
            warn!(
                "overlay.font_size {} out of range, using {}",
                self.overlay.font_size, font_size
            );
            self.overlay.font_size = font_size;
        }

        self.transfer.destination = transfer::normalize_destination(&self.transfer.destination);
        if self.transfer.enabled && self.transfer.host.trim().is_empty() {
            warn!("transfer.enabled is set but transfer.host is empty; stills stay local");
        }

        if self.camera.name.trim().is_empty() {
            self.camera.name = default_camera_name();
            info!("camera.name empty, using {}", self.camera.name);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_validation() {
        let mut config = Config {
            still: StillConfig {
                extension: ".JPEG".to_string(),
                quality: 0,
                ..Default::default()
            },
            transfer: TransferConfig {
                destination: "./cams/front/".to_string(),
                ..Default::default()
            },
            ..Default::default()
        };

        assert!(config.validate().is_ok());
        assert_eq!(config.still.extension, "jpeg");
        assert_eq!(config.still.quality, 1);
        assert_eq!(config.transfer.destination, "cams/front");
    }

    #[test]
    fn test_invalid_rotation_rejected() {
        let mut config = Config::default();
        config.camera.rotation = 45;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_unknown_extension_falls_back() {
        let mut config = Config::default();
        config.still.extension = "tiff".to_string();
        config.validate().unwrap();
        assert_eq!(config.still.extension, "jpg");
    }

    #[test]
    fn test_font_size_is_clamped() {
        let mut config = Config::default();
        config.overlay.font_size = u32::MAX;
        config.validate().unwrap();
        assert_eq!(config.overlay.font_size, MAX_FONT_SIZE);

        config.overlay.font_size = 0;
        config.validate().unwrap();
        assert_eq!(config.overlay.font_size, 1);
    }

    #[test]
    fn test_output_size_validation() {
        let mut config = Config::default();
        config.still.output_width = Some(0);
        config.still.output_height = Some(600);
        config.validate().unwrap();
        assert_eq!(config.still.output_width, None);
        assert_eq!(config.still.output_height, Some(600));

        config.still.output_width = Some(MAX_OUTPUT_SIDE + 1);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_transfer_debug_hides_password() {
        let mut config = Config::default();
        config.transfer.username = "cam".to_string();
        config.transfer.password = "hunter2".to_string();

        let printed = format!("{:?}", config);
        assert!(printed.contains("cam"));
        assert!(!printed.contains("hunter2"));
        assert!(!format!("{:?}", config.settings()).contains("hunter2"));
    }

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.camera.rotation, 0);
        assert_eq!(config.overlay.font_size, 18);
        assert_eq!(config.overlay.text_color, "white");
        assert_eq!(config.overlay.text_background, "black");
        assert_eq!(config.still.file_name, "{name}_{timestamp}");
        assert!(!config.transfer.is_active());
        assert_eq!(config.transfer.protocol, Protocol::Sftp);
    }

    #[test]
    fn test_settings_keep_password_when_blank() {
        let mut config = Config::default();
        config.transfer.password = "secret".to_string();

        let settings = config.settings().redacted();
        assert!(settings.transfer.password.is_empty());

        config.apply_settings(settings);
        assert_eq!(config.transfer.password, "secret");
    }

    #[test]
    fn test_parse_toml_sections() {
        let config: Config = toml::from_str(
            r#"
            [camera]
            name = "yard"
            rotation = 270

            [transfer]
            enabled = true
            protocol = "ftp"
            host = "files.example.com"
            "#,
        )
        .unwrap();

        assert_eq!(config.camera.name, "yard");
        assert_eq!(config.camera.rotation, 270);
        assert_eq!(config.transfer.protocol, Protocol::Ftp);
        assert!(config.transfer.is_active());
        assert_eq!(config.still.extension, "jpg");
    }
}
