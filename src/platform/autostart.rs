use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::{Context, anyhow};
use tracing::{debug, info};

use crate::error::{Error, Result};

pub const APP_NAME: &str = "MonitorSwitch";

/// Registers the program to start at user login.
pub trait Autostart: Send + Sync {
    fn enable(&self, program: &Path) -> Result<()>;
    fn disable(&self) -> Result<()>;
    fn is_enabled(&self) -> bool;
}

/// XDG autostart entry under `~/.config/autostart`.
#[derive(Debug, Clone)]
pub struct XdgAutostart {
    desktop_file: PathBuf,
}

impl XdgAutostart {
    pub fn new(desktop_file: impl Into<PathBuf>) -> Self {
        Self {
            desktop_file: desktop_file.into(),
        }
    }

    pub fn default_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| Error::Autostart(anyhow!("no user config directory")))?;
        Ok(config_dir
            .join("autostart")
            .join(format!("{APP_NAME}.desktop")))
    }

    pub fn desktop_file(&self) -> &Path {
        &self.desktop_file
    }
}

impl Autostart for XdgAutostart {
    fn enable(&self, program: &Path) -> Result<()> {
        let path = &self.desktop_file;
        let write = || -> anyhow::Result<()> {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("failed to create {}", parent.display()))?;
            }
            fs::write(path, desktop_entry(program))
                .with_context(|| format!("failed to write {}", path.display()))
        };
        write().map_err(Error::Autostart)?;
        info!(path = %path.display(), program = %program.display(), "autostart entry written");
        Ok(())
    }

    fn disable(&self) -> Result<()> {
        match fs::remove_file(&self.desktop_file) {
            Ok(()) => {
                info!(path = %self.desktop_file.display(), "autostart entry removed");
                Ok(())
            }
            Err(err) if err.kind() == ErrorKind::NotFound => {
                debug!(path = %self.desktop_file.display(), "autostart entry already absent");
                Ok(())
            }
            Err(err) => Err(Error::Autostart(anyhow::Error::new(err).context(format!(
                "failed to remove {}",
                self.desktop_file.display()
            )))),
        }
    }

    fn is_enabled(&self) -> bool {
        self.desktop_file.is_file()
    }
}

fn desktop_entry(program: &Path) -> String {
    let program = program.display().to_string();
    let exec = if program.contains(char::is_whitespace) {
        format!("\"{program}\"")
    } else {
        program
    };
    format!(
        "[Desktop Entry]\n\
         Type=Application\n\
         Name={APP_NAME}\n\
         Comment=USB Device Monitor & Screen Controller\n\
         Exec={exec} run\n\
         Terminal=false\n\
         Hidden=false\n\
         X-GNOME-Autostart-enabled=true\n\
         StartupNotify=false\n"
    )
}
