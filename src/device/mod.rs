//! USB device presence: identities, snapshots, enumeration and monitoring.

pub mod diff;
pub mod enumerate;
pub mod monitor;

use std::collections::HashSet;
use std::fmt;

use serde::Serialize;

pub use diff::{SnapshotDiff, diff};
pub use enumerate::{DeviceEnumerator, SysfsEnumerator};
pub use monitor::{DeviceMonitor, EnumerationFailurePolicy, MonitorOptions, TriggerSource};

/// Platform-stable key for one physical USB device.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct DeviceIdentity(String);

impl DeviceIdentity {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Identity format used by the sysfs enumerator.
    pub fn from_vid_pid(vendor_id: &str, product_id: &str) -> Self {
        Self(format!("USB_VID_{vendor_id}&PID_{product_id}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeviceIdentity {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for DeviceIdentity {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Display-only description of a device; presence is keyed on `identity`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct DeviceDescriptor {
    pub identity: DeviceIdentity,
    pub display_name: String,
    pub vendor_id: String,
    pub product_id: String,
}

impl DeviceDescriptor {
    pub fn new(
        identity: impl Into<DeviceIdentity>,
        display_name: impl Into<String>,
        vendor_id: impl Into<String>,
        product_id: impl Into<String>,
    ) -> Self {
        Self {
            identity: identity.into(),
            display_name: display_name.into(),
            vendor_id: vendor_id.into(),
            product_id: product_id.into(),
        }
    }
}

impl fmt::Display for DeviceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.display_name, self.identity)
    }
}

/// Devices present at one observation instant, in enumeration order.
///
/// Duplicate identities collapse onto the first descriptor seen.
#[derive(Debug, Clone, Default)]
pub struct DeviceSnapshot {
    devices: Vec<DeviceDescriptor>,
    identities: HashSet<DeviceIdentity>,
}

impl DeviceSnapshot {
    pub fn from_devices(devices: impl IntoIterator<Item = DeviceDescriptor>) -> Self {
        let mut snapshot = Self::default();
        for device in devices {
            if snapshot.identities.insert(device.identity.clone()) {
                snapshot.devices.push(device);
            }
        }
        snapshot
    }

    pub fn identities(&self) -> &HashSet<DeviceIdentity> {
        &self.identities
    }

    pub fn contains(&self, id: &DeviceIdentity) -> bool {
        self.identities.contains(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &DeviceDescriptor> {
        self.devices.iter()
    }

    pub(crate) fn len(&self) -> usize {
        self.devices.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_keeps_first_descriptor_per_identity() {
        let snapshot = DeviceSnapshot::from_devices([
            DeviceDescriptor::new("USB_VID_1&PID_2", "first", "1", "2"),
            DeviceDescriptor::new("USB_VID_3&PID_4", "other", "3", "4"),
            DeviceDescriptor::new("USB_VID_1&PID_2", "second", "1", "2"),
        ]);
        assert_eq!(snapshot.len(), 2);
        let names: Vec<_> = snapshot.iter().map(|d| d.display_name.as_str()).collect();
        assert_eq!(names, ["first", "other"]);
    }

    #[test]
    fn identity_from_vid_pid_matches_persisted_format() {
        let id = DeviceIdentity::from_vid_pid("1234", "5678");
        assert_eq!(id.as_str(), "USB_VID_1234&PID_5678");
    }
}
