//! Settings persistence on top of the `config-model` file formats.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::{Context, anyhow};
use config_model::{
    AppConfig, CONFIG_FILE_NAME, DEVICE_LIST_FILE_NAME, parse_device_list, render_device_list,
};
use tracing::{debug, info};

use crate::error::{Error, Result};

pub trait SettingsStore: Send + Sync {
    /// Prepares backing storage. Idempotent.
    fn initialize(&self) -> Result<()>;
    /// Missing files yield defaults.
    fn load(&self) -> Result<AppConfig>;
    fn save(&self, config: &AppConfig) -> Result<()>;
}

/// `config.ini` and `devices.txt` in one directory.
#[derive(Debug, Clone)]
pub struct FileSettingsStore {
    dir: PathBuf,
}

impl FileSettingsStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// `~/.config/aerodomigue/MonitorSwitch` on Linux.
    pub fn default_dir() -> Result<PathBuf> {
        dirs::config_dir()
            .map(|dir| dir.join("aerodomigue").join("MonitorSwitch"))
            .ok_or_else(|| Error::Persistence(anyhow!("no user config directory")))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn config_path(&self) -> PathBuf {
        self.dir.join(CONFIG_FILE_NAME)
    }

    pub fn device_list_path(&self) -> PathBuf {
        self.dir.join(DEVICE_LIST_FILE_NAME)
    }
}

impl SettingsStore for FileSettingsStore {
    fn initialize(&self) -> Result<()> {
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("failed to create settings dir {}", self.dir.display()))
            .map_err(Error::Persistence)?;
        debug!(dir = %self.dir.display(), "settings directory ready");
        Ok(())
    }

    fn load(&self) -> Result<AppConfig> {
        let config_path = self.config_path();
        let mut config = match read_optional(&config_path).map_err(Error::Persistence)? {
            Some(text) => AppConfig::from_ini_str(&text)
                .with_context(|| format!("failed to parse {}", config_path.display()))
                .map_err(Error::Persistence)?,
            None => {
                info!(path = %config_path.display(), "no settings file; using defaults");
                AppConfig::default()
            }
        };
        if let Some(text) = read_optional(&self.device_list_path()).map_err(Error::Persistence)? {
            config.known_devices = parse_device_list(&text);
        }
        debug!(
            selected = config.selected_device_id.as_deref().unwrap_or(""),
            delay_secs = config.screen_off_delay_secs,
            known = config.known_devices.len(),
            "settings loaded"
        );
        Ok(config)
    }

    fn save(&self, config: &AppConfig) -> Result<()> {
        self.initialize()?;
        write_file(&self.config_path(), &config.to_ini_string()).map_err(Error::Persistence)?;
        write_file(
            &self.device_list_path(),
            &render_device_list(&config.known_devices),
        )
        .map_err(Error::Persistence)?;
        debug!(dir = %self.dir.display(), "settings saved");
        Ok(())
    }
}

fn read_optional(path: &Path) -> anyhow::Result<Option<String>> {
    match fs::read_to_string(path) {
        Ok(text) => Ok(Some(text)),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err).with_context(|| format!("failed to read {}", path.display())),
    }
}

fn write_file(path: &Path, contents: &str) -> anyhow::Result<()> {
    fs::write(path, contents).with_context(|| format!("failed to write {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_files_load_defaults() {
        let tmp = tempfile::tempdir().unwrap();
        let store = FileSettingsStore::new(tmp.path().join("MonitorSwitch"));
        assert_eq!(store.load().unwrap(), AppConfig::default());
    }

    #[test]
    fn save_creates_directory_and_reloads() {
        let tmp = tempfile::tempdir().unwrap();
        let store = FileSettingsStore::new(tmp.path().join("nested/MonitorSwitch"));
        let mut config = AppConfig {
            selected_device_id: Some("USB_VID_046d&PID_c534".into()),
            screen_off_delay_secs: 25,
            ..AppConfig::default()
        };
        config.remember_device("USB_VID_046d&PID_c534");
        config.remember_device("USB_VID_0781&PID_5581");

        store.save(&config).unwrap();
        assert!(store.config_path().is_file());
        assert!(store.device_list_path().is_file());
        assert_eq!(store.load().unwrap(), config);
    }

    #[test]
    fn corrupt_settings_are_a_persistence_error() {
        let tmp = tempfile::tempdir().unwrap();
        let store = FileSettingsStore::new(tmp.path());
        fs::write(store.config_path(), "startOnBoot=maybe\n").unwrap();
        assert!(matches!(store.load(), Err(Error::Persistence(_))));
    }

    #[test]
    fn zero_delay_on_disk_is_a_persistence_error() {
        let tmp = tempfile::tempdir().unwrap();
        let store = FileSettingsStore::new(tmp.path());
        fs::write(store.config_path(), "screenOffDelay=0\n").unwrap();
        let err = store.load().unwrap_err();
        assert!(matches!(err, Error::Persistence(_)));
        assert!(err.to_string().contains("at least one second"), "{err}");
    }

    #[test]
    fn device_list_without_settings_file_is_still_read() {
        let tmp = tempfile::tempdir().unwrap();
        let store = FileSettingsStore::new(tmp.path());
        fs::write(store.device_list_path(), "# Known USB Devices\nUSB_VID_1&PID_2\n").unwrap();
        let config = store.load().unwrap();
        assert_eq!(config.known_devices, ["USB_VID_1&PID_2"]);
        assert!(config.start_on_boot);
    }
}
