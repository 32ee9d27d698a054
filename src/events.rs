use std::sync::Arc;

use crate::device::DeviceDescriptor;

/// Human-readable status channel for front ends. Observation only.
pub type ActivityLog = Arc<dyn Fn(&str) + Send + Sync>;

/// Invoked once per appeared or vanished device.
pub type DeviceCallback = Arc<dyn Fn(&DeviceDescriptor) + Send + Sync>;

/// Receives the result of a deferred display operation.
pub type CompletionCallback = Box<dyn FnOnce(bool) + Send + 'static>;

pub fn silent_activity() -> ActivityLog {
    Arc::new(|_: &str| {})
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceEvent {
    Connected(DeviceDescriptor),
    Disconnected(DeviceDescriptor),
}

impl DeviceEvent {
    pub fn descriptor(&self) -> &DeviceDescriptor {
        match self {
            Self::Connected(device) | Self::Disconnected(device) => device,
        }
    }
}
