//! Persisted settings shared by the monitor-switch daemon and its front ends.
//!
//! Settings live in two plain-text files: `config.ini` holds `key=value`
//! scalars and `devices.txt` holds one known device id per line. Both accept
//! `#` comments and blank lines.

use std::fmt::Write as _;

use anyhow::{Context, Result, bail, ensure};
use serde::{Deserialize, Serialize};

pub const CONFIG_FILE_NAME: &str = "config.ini";
pub const DEVICE_LIST_FILE_NAME: &str = "devices.txt";

const KEY_START_ON_BOOT: &str = "startOnBoot";
const KEY_START_MINIMIZED: &str = "startMinimized";
const KEY_SELECTED_DEVICE: &str = "selectedDeviceId";
const KEY_SCREEN_OFF_DELAY: &str = "screenOffDelay";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct AppConfig {
    pub start_on_boot: bool,
    pub start_minimized: bool,
    pub selected_device_id: Option<String>,
    pub screen_off_delay_secs: u64,
    pub known_devices: Vec<String>,
}

impl AppConfig {
    pub const fn default_screen_off_delay_secs() -> u64 {
        10
    }

    /// Parses the scalar settings file. Device ids are read separately with
    /// [`parse_device_list`].
    pub fn from_ini_str(text: &str) -> Result<Self> {
        let mut config = Self::default();
        for (index, raw) in text.lines().enumerate() {
            let line = raw.trim_end_matches('\r');
            if line.trim().is_empty() || line.trim_start().starts_with('#') {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            let line_no = index + 1;
            match key.trim() {
                KEY_START_ON_BOOT => {
                    config.start_on_boot = parse_flag(value)
                        .with_context(|| format!("line {line_no}: invalid {KEY_START_ON_BOOT}"))?;
                }
                KEY_START_MINIMIZED => {
                    config.start_minimized = parse_flag(value).with_context(|| {
                        format!("line {line_no}: invalid {KEY_START_MINIMIZED}")
                    })?;
                }
                KEY_SELECTED_DEVICE => {
                    let value = value.trim();
                    config.selected_device_id =
                        (!value.is_empty()).then(|| value.to_string());
                }
                KEY_SCREEN_OFF_DELAY => {
                    let secs: u64 = value.trim().parse().with_context(|| {
                        format!("line {line_no}: invalid {KEY_SCREEN_OFF_DELAY} '{value}'")
                    })?;
                    ensure!(
                        secs > 0,
                        "line {line_no}: {KEY_SCREEN_OFF_DELAY} must be at least one second"
                    );
                    config.screen_off_delay_secs = secs;
                }
                _ => {}
            }
        }
        Ok(config)
    }

    pub fn to_ini_string(&self) -> String {
        let mut out = String::new();
        out.push_str("# MonitorSwitch Configuration File\n");
        out.push_str("# Generated automatically - do not edit manually\n\n");
        let _ = writeln!(out, "{KEY_START_ON_BOOT}={}", self.start_on_boot);
        let _ = writeln!(out, "{KEY_START_MINIMIZED}={}", self.start_minimized);
        let _ = writeln!(
            out,
            "{KEY_SELECTED_DEVICE}={}",
            self.selected_device_id.as_deref().unwrap_or("")
        );
        let _ = writeln!(out, "{KEY_SCREEN_OFF_DELAY}={}", self.screen_off_delay_secs);
        out
    }

    /// Records `id` as known. Returns `false` when it was already listed.
    pub fn remember_device(&mut self, id: &str) -> bool {
        if self.known_devices.iter().any(|known| known == id) {
            return false;
        }
        self.known_devices.push(id.to_string());
        true
    }

    pub fn forget_device(&mut self, id: &str) -> bool {
        let before = self.known_devices.len();
        self.known_devices.retain(|known| known != id);
        self.known_devices.len() != before
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            start_on_boot: true,
            start_minimized: false,
            selected_device_id: None,
            screen_off_delay_secs: Self::default_screen_off_delay_secs(),
            known_devices: Vec::new(),
        }
    }
}

pub fn parse_device_list(text: &str) -> Vec<String> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .collect()
}

pub fn render_device_list(devices: &[String]) -> String {
    let mut out = String::from("# Known USB Devices\n");
    for device in devices {
        out.push_str(device);
        out.push('\n');
    }
    out
}

fn parse_flag(value: &str) -> Result<bool> {
    match value.trim() {
        "true" | "1" => Ok(true),
        "false" | "0" => Ok(false),
        other => bail!("expected true/false, got '{other}'"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_keys_fall_back_to_defaults() {
        let cfg = AppConfig::from_ini_str("# only a comment\n\n").unwrap();
        assert_eq!(cfg, AppConfig::default());
        assert!(cfg.start_on_boot);
        assert_eq!(cfg.screen_off_delay_secs, 10);
    }

    #[test]
    fn parses_written_settings() {
        let cfg = AppConfig::from_ini_str(
            "startOnBoot=0\nstartMinimized=true\nselectedDeviceId=USB_VID_1234&PID_5678\nscreenOffDelay=42\nunknownKey=ignored\n",
        )
        .unwrap();
        assert!(!cfg.start_on_boot);
        assert!(cfg.start_minimized);
        assert_eq!(
            cfg.selected_device_id.as_deref(),
            Some("USB_VID_1234&PID_5678")
        );
        assert_eq!(cfg.screen_off_delay_secs, 42);
    }

    #[test]
    fn scalar_settings_survive_a_write_and_reload() {
        let cfg = AppConfig {
            start_on_boot: false,
            start_minimized: true,
            selected_device_id: Some("USB_VID_046d&PID_c534".into()),
            screen_off_delay_secs: 3,
            known_devices: Vec::new(),
        };
        let reloaded = AppConfig::from_ini_str(&cfg.to_ini_string()).unwrap();
        assert_eq!(reloaded, cfg);
    }

    #[test]
    fn empty_selection_reads_back_as_none() {
        let cfg = AppConfig::default();
        let text = cfg.to_ini_string();
        assert!(text.contains("selectedDeviceId=\n"));
        assert_eq!(AppConfig::from_ini_str(&text).unwrap().selected_device_id, None);
    }

    #[test]
    fn rejects_non_numeric_delay() {
        let err = AppConfig::from_ini_str("screenOffDelay=soon\n").unwrap_err();
        assert!(format!("{err:#}").contains("screenOffDelay"));
    }

    #[test]
    fn rejects_zero_delay_with_line_number() {
        let err = AppConfig::from_ini_str("startOnBoot=true\nscreenOffDelay=0\n").unwrap_err();
        let message = format!("{err:#}");
        assert!(message.contains("line 2"), "{message}");
        assert!(message.contains("screenOffDelay"), "{message}");
    }

    #[test]
    fn device_list_skips_comments_and_blanks() {
        let devices = vec!["USB_VID_1&PID_2".to_string(), "USB_VID_3&PID_4".to_string()];
        let text = render_device_list(&devices);
        assert!(text.starts_with("# Known USB Devices"));
        assert_eq!(parse_device_list(&format!("{text}\n   \n# trailing\n")), devices);
    }

    #[test]
    fn remember_device_deduplicates() {
        let mut cfg = AppConfig::default();
        assert!(cfg.remember_device("a"));
        assert!(!cfg.remember_device("a"));
        assert!(cfg.forget_device("a"));
        assert!(!cfg.forget_device("a"));
        assert!(cfg.known_devices.is_empty());
    }

    #[test]
    fn serializes_with_kebab_case_keys() {
        let json = serde_json::to_value(AppConfig::default()).unwrap();
        assert_eq!(json["screen-off-delay-secs"], 10);
        assert_eq!(json["selected-device-id"], serde_json::Value::Null);
    }
}
