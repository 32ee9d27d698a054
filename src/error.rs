use std::path::PathBuf;

use thiserror::Error;

use crate::platform::display_power::PowerAction;

/// Library error type for monitor-switch operations.
#[derive(Debug, Error)]
pub enum Error {
    /// The USB device listing could not be read.
    #[error("failed to enumerate USB devices under {}: {source}", root.display())]
    Enumeration {
        root: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The display driver reported failure.
    #[error("display power action {0:?} failed")]
    DisplayControl(PowerAction),

    /// Persisted settings could not be read or written.
    #[error("settings persistence failed: {0:#}")]
    Persistence(anyhow::Error),

    /// A platform resource needed at startup is unavailable.
    #[error("initialization failed: {0}")]
    Initialization(String),

    #[error("device monitor has not been initialized")]
    NotInitialized,

    #[error("device monitor is already running")]
    AlreadyMonitoring,

    #[error("screen-off delay must be at least one second")]
    InvalidDelay,

    /// The startup entry could not be registered or removed.
    #[error("autostart update failed: {0:#}")]
    Autostart(anyhow::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
