//! Daemon configuration loaded from an optional YAML file.
//!
//! User-facing settings (selected device, delay, autostart) are not here;
//! they are persisted by [`crate::storage`].

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, ensure};
use serde::Deserialize;

use crate::device::{EnumerationFailurePolicy, MonitorOptions, SysfsEnumerator, TriggerSource};
use crate::platform::display_power::DisplayPowerPlan;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct Configuration {
    /// Directory holding `config.ini` and `devices.txt`. Defaults to the
    /// per-user config directory.
    pub data_dir: Option<PathBuf>,
    /// Off-to-on gap used by the screen test.
    #[serde(with = "humantime_serde")]
    pub screen_test_interval: Duration,
    pub monitor: MonitorConfig,
    pub display_power: DisplayPowerPlan,
    pub autostart: AutostartConfig,
}

impl Configuration {
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let s = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        serde_yaml::from_str(&s).with_context(|| format!("failed to parse {}", path.display()))
    }

    pub fn validated(self) -> Result<Self> {
        ensure!(
            !self.screen_test_interval.is_zero(),
            "screen-test-interval must be greater than zero"
        );
        self.monitor.validate()?;
        let plan = &self.display_power;
        ensure!(
            plan.sysfs.is_some() || plan.sleep_command.is_some() || plan.wake_command.is_some(),
            "display-power needs a sysfs path or at least one command"
        );
        Ok(self)
    }
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            data_dir: None,
            screen_test_interval: Duration::from_secs(1),
            monitor: MonitorConfig::default(),
            display_power: DisplayPowerPlan::default(),
            autostart: AutostartConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TriggerKind {
    Poll,
    Watch,
    Manual,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct MonitorConfig {
    pub trigger: TriggerKind,
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
    /// Device node tree watched by the `watch` trigger.
    pub watch_path: PathBuf,
    #[serde(with = "humantime_serde")]
    pub settle_delay: Duration,
    #[serde(with = "humantime_serde")]
    pub fallback_interval: Duration,
    pub sysfs_root: PathBuf,
    pub on_enumeration_error: EnumerationFailurePolicy,
}

impl MonitorConfig {
    fn validate(&self) -> Result<()> {
        match self.trigger {
            TriggerKind::Poll => ensure!(
                !self.poll_interval.is_zero(),
                "monitor.poll-interval must be greater than zero"
            ),
            TriggerKind::Watch => ensure!(
                !self.fallback_interval.is_zero(),
                "monitor.fallback-interval must be greater than zero"
            ),
            TriggerKind::Manual => {}
        }
        Ok(())
    }

    pub fn options(&self) -> MonitorOptions {
        let trigger = match self.trigger {
            TriggerKind::Poll => TriggerSource::Poll {
                interval: self.poll_interval,
            },
            TriggerKind::Watch => TriggerSource::Watch {
                path: self.watch_path.clone(),
                settle: self.settle_delay,
                fallback_interval: self.fallback_interval,
            },
            TriggerKind::Manual => TriggerSource::Manual,
        };
        MonitorOptions {
            trigger,
            on_enumeration_error: self.on_enumeration_error,
        }
    }

    pub fn enumerator(&self) -> SysfsEnumerator {
        SysfsEnumerator::new(&self.sysfs_root)
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            trigger: TriggerKind::Poll,
            poll_interval: TriggerSource::DEFAULT_POLL_INTERVAL,
            watch_path: PathBuf::from("/dev/bus/usb"),
            settle_delay: Duration::from_millis(250),
            fallback_interval: Duration::from_secs(30),
            sysfs_root: PathBuf::from(SysfsEnumerator::DEFAULT_ROOT),
            on_enumeration_error: EnumerationFailurePolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct AutostartConfig {
    /// Overrides `~/.config/autostart/MonitorSwitch.desktop`.
    pub desktop_file: Option<PathBuf>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_uses_defaults() {
        let cfg: Configuration = serde_yaml::from_str("{}").unwrap();
        let cfg = cfg.validated().unwrap();
        assert_eq!(cfg.screen_test_interval, Duration::from_secs(1));
        assert_eq!(cfg.monitor.trigger, TriggerKind::Poll);
        assert_eq!(
            cfg.monitor.options().trigger,
            TriggerSource::Poll {
                interval: Duration::from_secs(1)
            }
        );
        assert_eq!(
            cfg.display_power.sleep_command.as_deref(),
            Some("xset dpms force off")
        );
        assert!(cfg.data_dir.is_none());
    }

    #[test]
    fn parses_watch_trigger_and_overrides() {
        let yaml = r#"
data-dir: /var/lib/monitor-switch
screen-test-interval: 2s
monitor:
  trigger: watch
  settle-delay: 500ms
  fallback-interval: 1m
  on-enumeration-error: treat-as-empty
display-power:
  sleep-command: "wlr-randr --output @OUTPUT@ --off"
  wake-command: "wlr-randr --output @OUTPUT@ --on"
  sysfs:
    path: /sys/class/backlight/rpi_backlight/bl_power
    sleep-value: "1"
    wake-value: "0"
autostart:
  desktop-file: /tmp/MonitorSwitch.desktop
"#;
        let cfg: Configuration = serde_yaml::from_str(yaml).unwrap();
        let cfg = cfg.validated().unwrap();
        assert_eq!(cfg.data_dir, Some(PathBuf::from("/var/lib/monitor-switch")));
        assert_eq!(cfg.screen_test_interval, Duration::from_secs(2));
        let options = cfg.monitor.options();
        assert_eq!(
            options.trigger,
            TriggerSource::Watch {
                path: PathBuf::from("/dev/bus/usb"),
                settle: Duration::from_millis(500),
                fallback_interval: Duration::from_secs(60),
            }
        );
        assert_eq!(
            options.on_enumeration_error,
            EnumerationFailurePolicy::TreatAsEmpty
        );
        let sysfs = cfg.display_power.sysfs.unwrap();
        assert_eq!(sysfs.sleep_value, "1");
        assert_eq!(
            cfg.autostart.desktop_file,
            Some(PathBuf::from("/tmp/MonitorSwitch.desktop"))
        );
    }

    #[test]
    fn rejects_zero_poll_interval() {
        let cfg: Configuration =
            serde_yaml::from_str("monitor:\n  poll-interval: 0s\n").unwrap();
        assert!(cfg.validated().is_err());
    }

    #[test]
    fn rejects_display_power_without_any_action() {
        let cfg: Configuration = serde_yaml::from_str(
            "display-power:\n  sleep-command: null\n  wake-command: null\n",
        )
        .unwrap();
        assert!(cfg.validated().is_err());
    }

    #[test]
    fn reads_from_file() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(tmp.path(), "monitor:\n  trigger: manual\n").unwrap();
        let cfg = Configuration::from_yaml_file(tmp.path()).unwrap();
        assert_eq!(cfg.monitor.options().trigger, TriggerSource::Manual);
    }
}
