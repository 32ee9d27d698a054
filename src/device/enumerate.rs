use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, trace};

use super::{DeviceDescriptor, DeviceIdentity};
use crate::error::{Error, Result};

/// Lists the USB devices currently attached to the machine.
pub trait DeviceEnumerator: Send + Sync {
    fn enumerate(&self) -> Result<Vec<DeviceDescriptor>>;
}

/// Reads `idVendor`/`idProduct` attributes from the kernel's USB sysfs tree.
#[derive(Debug, Clone)]
pub struct SysfsEnumerator {
    root: PathBuf,
}

impl SysfsEnumerator {
    pub const DEFAULT_ROOT: &'static str = "/sys/bus/usb/devices";

    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl Default for SysfsEnumerator {
    fn default() -> Self {
        Self::new(Self::DEFAULT_ROOT)
    }
}

impl DeviceEnumerator for SysfsEnumerator {
    fn enumerate(&self) -> Result<Vec<DeviceDescriptor>> {
        let to_error = |source| Error::Enumeration {
            root: self.root.clone(),
            source,
        };

        let mut entries = Vec::new();
        for entry in fs::read_dir(&self.root).map_err(to_error)? {
            let entry = entry.map_err(to_error)?;
            if entry.file_name().to_string_lossy().starts_with('.') {
                continue;
            }
            entries.push(entry.path());
        }
        entries.sort();

        let devices: Vec<_> = entries
            .iter()
            .filter_map(|path| read_device(path))
            .collect();
        debug!(root = %self.root.display(), count = devices.len(), "enumerated USB devices");
        Ok(devices)
    }
}

fn read_device(dir: &Path) -> Option<DeviceDescriptor> {
    // Interfaces and hubs' ports carry no idVendor; they are not devices.
    let vendor_id = read_attr(dir, "idVendor")?;
    let product_id = read_attr(dir, "idProduct")?;
    let display_name = match (read_attr(dir, "manufacturer"), read_attr(dir, "product")) {
        (Some(manufacturer), Some(product)) => format!("{manufacturer} {product}"),
        (None, Some(product)) => product,
        _ => "Unknown USB Device".to_string(),
    };
    trace!(path = %dir.display(), vendor_id, product_id, "found USB device");
    Some(DeviceDescriptor {
        identity: DeviceIdentity::from_vid_pid(&vendor_id, &product_id),
        display_name,
        vendor_id,
        product_id,
    })
}

fn read_attr(dir: &Path, name: &str) -> Option<String> {
    let value = fs::read_to_string(dir.join(name)).ok()?;
    let value = value.trim();
    (!value.is_empty()).then(|| value.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_device(root: &Path, name: &str, attrs: &[(&str, &str)]) {
        let dir = root.join(name);
        fs::create_dir_all(&dir).unwrap();
        for (attr, value) in attrs {
            fs::write(dir.join(attr), format!("{value}\n")).unwrap();
        }
    }

    #[test]
    fn reads_devices_and_skips_interfaces() {
        let tmp = tempfile::tempdir().unwrap();
        write_device(
            tmp.path(),
            "1-1",
            &[
                ("idVendor", "046d"),
                ("idProduct", "c534"),
                ("manufacturer", "Logitech"),
                ("product", "USB Receiver"),
            ],
        );
        write_device(tmp.path(), "1-1:1.0", &[("bInterfaceClass", "03")]);
        write_device(
            tmp.path(),
            "2-1",
            &[("idVendor", "0781"), ("idProduct", "5581"), ("product", "Ultra")],
        );

        let devices = SysfsEnumerator::new(tmp.path()).enumerate().unwrap();
        assert_eq!(devices.len(), 2);
        assert_eq!(devices[0].identity.as_str(), "USB_VID_046d&PID_c534");
        assert_eq!(devices[0].display_name, "Logitech USB Receiver");
        assert_eq!(devices[1].display_name, "Ultra");
        assert_eq!(devices[1].vendor_id, "0781");
    }

    #[test]
    fn unnamed_devices_get_a_placeholder_name() {
        let tmp = tempfile::tempdir().unwrap();
        write_device(tmp.path(), "3-2", &[("idVendor", "1234"), ("idProduct", "5678")]);
        let devices = SysfsEnumerator::new(tmp.path()).enumerate().unwrap();
        assert_eq!(devices[0].display_name, "Unknown USB Device");
    }

    #[test]
    fn missing_root_is_an_enumeration_error() {
        let tmp = tempfile::tempdir().unwrap();
        let err = SysfsEnumerator::new(tmp.path().join("absent"))
            .enumerate()
            .unwrap_err();
        assert!(matches!(err, Error::Enumeration { .. }));
    }
}
