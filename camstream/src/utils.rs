use anyhow::Context;
use config::{Config as ConfigRs, File};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

const ETC_CONFIG_PATH: &str = "/etc/picast/";
const VAR_CONFIG_PATH: &str = "/var/lib/picast/";

/// Files `load` layers on top of the built-in defaults, lowest first
struct Layers {
    current: PathBuf,
    etc: PathBuf,
    /// Where HTTP edits are persisted unless an explicit `.toml` is given
    var: PathBuf,
}

impl Layers {
    fn system(name: &str) -> anyhow::Result<Self> {
        let file = format!("{}.toml", name);
        Ok(Self {
            current: std::env::current_dir()
                .context("Failed to get current working directory")?
                .join(&file),
            etc: Path::new(ETC_CONFIG_PATH).join(&file),
            var: Path::new(VAR_CONFIG_PATH).join(file),
        })
    }
}

/// An explicit `.toml` is written back in place; anything else is read only
fn is_writable_override(path: &str) -> bool {
    Path::new(path)
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"))
}

/// Layered load: built-in defaults, then `./{name}.toml`,
/// `/etc/picast/{name}.toml`, `/var/lib/picast/{name}.toml` and finally an
/// explicit path whose format follows its extension (`.toml`, `.ini`).
///
/// When the explicit file is read only, the `/var/lib` layer holding saved
/// edits goes on top of it instead.
pub fn load<T: DeserializeOwned>(
    name: &str,
    config_path_override: Option<String>,
) -> anyhow::Result<T> {
    load_layers(&Layers::system(name)?, config_path_override)
}

fn load_layers<T: DeserializeOwned>(
    layers: &Layers,
    config_path_override: Option<String>,
) -> anyhow::Result<T> {
    let mut builder = ConfigRs::builder()
        .set_default("log.level", "info")?
        .set_default("camera.name", "picast")?;

    if layers.current.exists() {
        builder = builder.add_source(File::from(layers.current.clone()).required(false));
        info!(
            "Loaded config from current directory: {}",
            layers.current.display()
        );
    }

    if layers.etc.exists() {
        builder = builder.add_source(File::from(layers.etc.clone()).required(false));
        info!("Loaded base config from {}", layers.etc.display());
    } else {
        warn!(
            "Base config not found at {}, using internal defaults.",
            layers.etc.display()
        );
    }

    let edits_last = config_path_override
        .as_deref()
        .is_some_and(|path| !is_writable_override(path));

    if layers.var.exists() && !edits_last {
        builder = builder.add_source(File::from(layers.var.clone()).required(false));
        info!("Loaded user override config from {}", layers.var.display());
    }

    if let Some(path) = config_path_override {
        builder = builder.add_source(File::with_name(&path).required(true));
        info!("Loaded override config from command line: {}", path);
    }

    if layers.var.exists() && edits_last {
        builder = builder.add_source(File::from(layers.var.clone()).required(false));
        info!("Loaded saved edits from {}", layers.var.display());
    }

    builder
        .build()
        .context("Failed to build configuration")?
        .try_deserialize()
        .context("Failed to deserialize configuration")
}

/// Where `POST /api/config` persists to: the explicit `.toml` given on the
/// command line, otherwise `/var/lib/picast/{name}.toml`
pub fn save_path(name: &str, config_path_override: Option<&str>) -> PathBuf {
    match config_path_override {
        Some(path) if is_writable_override(path) => PathBuf::from(path),
        _ => Path::new(VAR_CONFIG_PATH).join(format!("{}.toml", name)),
    }
}

pub fn save_config_to<T: Serialize>(path: &Path, config: &T) -> anyhow::Result<()> {
    if let Some(dir) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir)?;
    }

    let mut temp_path = path.as_os_str().to_owned();
    temp_path.push(".tmp");
    let temp_path = PathBuf::from(temp_path);

    let toml_string = toml::to_string_pretty(config)?;

    std::fs::write(&temp_path, toml_string)?;
    std::fs::rename(&temp_path, path)?;

    info!("Configuration saved to {}", path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use std::io::Write;

    #[test]
    fn test_load_ini_override() {
        let mut file = tempfile::Builder::new().suffix(".ini").tempfile().unwrap();
        writeln!(file, "[camera]\nname = porch\nrotation = 90").unwrap();
        writeln!(file, "[transfer]\nhost = 10.0.0.2\nprotocol = ftp").unwrap();

        let config: Config =
            load("picast-test-missing", Some(file.path().display().to_string())).unwrap();

        assert_eq!(config.camera.name, "porch");
        assert_eq!(config.camera.rotation, 90);
        assert_eq!(config.transfer.host, "10.0.0.2");
        assert_eq!(config.transfer.protocol, transfer::Protocol::Ftp);
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("picast.toml");

        let mut config = Config::default();
        config.camera.name = "garage".to_string();
        config.transfer.dated_dirs = true;
        save_config_to(&path, &config).unwrap();

        let loaded: Config = load("picast-test-missing", Some(path.display().to_string())).unwrap();
        assert_eq!(loaded.camera.name, "garage");
        assert!(loaded.transfer.dated_dirs);
        assert!(!dir.path().join("nested").join("picast.toml.tmp").exists());
    }

    fn layers_in(dir: &Path) -> Layers {
        Layers {
            current: dir.join("cwd").join("picast.toml"),
            etc: dir.join("etc").join("picast.toml"),
            var: dir.join("var").join("picast.toml"),
        }
    }

    #[test]
    fn test_saved_edits_win_over_ini_override() {
        let dir = tempfile::tempdir().unwrap();
        let layers = layers_in(dir.path());

        let ini = dir.path().join("cam_config.ini");
        std::fs::write(&ini, "[camera]\nname = porch\nrotation = 90\n").unwrap();
        let ini = ini.display().to_string();

        let target = save_path("picast", Some(&ini));
        assert_eq!(target, Path::new(VAR_CONFIG_PATH).join("picast.toml"));

        let mut edited: Config = load_layers(&layers, Some(ini.clone())).unwrap();
        assert_eq!(edited.camera.name, "porch");
        edited.camera.name = "garage".to_string();
        edited.camera.rotation = 180;
        save_config_to(&layers.var, &edited).unwrap();

        let reloaded: Config = load_layers(&layers, Some(ini)).unwrap();
        assert_eq!(reloaded.camera.name, "garage");
        assert_eq!(reloaded.camera.rotation, 180);
    }

    #[test]
    fn test_toml_override_is_its_own_save_target() {
        let dir = tempfile::tempdir().unwrap();
        let layers = layers_in(dir.path());

        let mut stale = Config::default();
        stale.camera.name = "stale".to_string();
        save_config_to(&layers.var, &stale).unwrap();

        let explicit = dir.path().join("picast.toml");
        let mut edited = Config::default();
        edited.camera.name = "garage".to_string();
        save_config_to(&explicit, &edited).unwrap();
        let explicit = explicit.display().to_string();

        assert_eq!(save_path("picast", Some(&explicit)), PathBuf::from(&explicit));
        let loaded: Config = load_layers(&layers, Some(explicit)).unwrap();
        assert_eq!(loaded.camera.name, "garage");
    }

    #[test]
    fn test_missing_override_is_an_error() {
        let result: anyhow::Result<Config> =
            load("picast-test-missing", Some("/nonexistent/picast.toml".to_string()));
        assert!(result.is_err());
    }
}
