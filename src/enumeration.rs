//! Device discovery through sysfs.
//!
//! Scans `/sys/bus/usb/devices` for device entries, reads the identification
//! attributes the kernel exports, and maps each device to its usbfs node.

use std::fs;
use std::io;
use std::num::ParseIntError;
use std::path::PathBuf;
use std::str::FromStr;

use log::debug;

use crate::descriptors::CLASS_VIDEO;
use crate::Error;

#[derive(Debug, Clone)]
pub(crate) struct SysfsPath(pub(crate) PathBuf);

impl SysfsPath {
    fn read_attr<T: FromStr>(&self, attr: &str) -> Result<T, io::Error>
    where
        T::Err: std::error::Error + Send + Sync + 'static,
    {
        fs::read_to_string(self.0.join(attr))?
            .trim()
            .parse()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }

    fn read_attr_hex<T: FromHexStr>(&self, attr: &str) -> Result<T, io::Error> {
        let s = self.read_attr::<String>(attr)?;
        T::from_hex_str(s.trim()).map_err(|_| {
            io::Error::new(io::ErrorKind::InvalidData, "invalid hex attribute")
        })
    }
}

trait FromHexStr: Sized {
    fn from_hex_str(s: &str) -> Result<Self, ParseIntError>;
}

impl FromHexStr for u8 {
    fn from_hex_str(s: &str) -> Result<Self, ParseIntError> {
        u8::from_str_radix(s, 16)
    }
}

impl FromHexStr for u16 {
    fn from_hex_str(s: &str) -> Result<Self, ParseIntError> {
        u16::from_str_radix(s, 16)
    }
}

const SYSFS_PREFIX: &str = "/sys/bus/usb/devices/";

/// Identification of a connected USB device, read from sysfs.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub(crate) path: SysfsPath,
    pub(crate) bus_number: u8,
    pub(crate) device_address: u8,
    pub(crate) vendor_id: u16,
    pub(crate) product_id: u16,
    pub(crate) class: u8,
    pub(crate) manufacturer: Option<String>,
    pub(crate) product: Option<String>,
    pub(crate) serial_number: Option<String>,
}

impl DeviceInfo {
    pub fn bus_number(&self) -> u8 {
        self.bus_number
    }

    pub fn device_address(&self) -> u8 {
        self.device_address
    }

    pub fn vendor_id(&self) -> u16 {
        self.vendor_id
    }

    pub fn product_id(&self) -> u16 {
        self.product_id
    }

    pub fn serial_number(&self) -> Option<&str> {
        self.serial_number.as_deref()
    }

    /// Human-readable one-line summary.
    pub fn describe(&self) -> String {
        format!(
            "{} {} (S/N {})",
            self.manufacturer
                .clone()
                .unwrap_or_else(|| format!("VID_{:04x}", self.vendor_id)),
            self.product
                .clone()
                .unwrap_or_else(|| format!("PID_{:04x}", self.product_id)),
            self.serial_number.as_deref().unwrap_or("?")
        )
    }

    /// Path of the usbfs character device node.
    pub(crate) fn usbfs_path(&self) -> PathBuf {
        PathBuf::from(format!(
            "/dev/bus/usb/{:03}/{:03}",
            self.bus_number, self.device_address
        ))
    }

    /// Whether any interface of this device is video-class.
    ///
    /// UVC cameras usually report a miscellaneous device class and put the
    /// video class on their interfaces, so the device-level class alone is
    /// not enough to identify them.
    pub(crate) fn has_video_interface(&self) -> bool {
        if self.class == CLASS_VIDEO {
            return true;
        }
        let Ok(children) = fs::read_dir(&self.path.0) else {
            return false;
        };
        for entry in children.flatten() {
            let child = SysfsPath(entry.path());
            if let Ok(class) = child.read_attr_hex::<u8>("bInterfaceClass") {
                if class == CLASS_VIDEO {
                    return true;
                }
            }
        }
        false
    }
}

/// List all connected USB devices.
pub fn list_devices() -> Result<impl Iterator<Item = DeviceInfo>, Error> {
    Ok(fs::read_dir(SYSFS_PREFIX)
        .map_err(Error::Io)?
        .flat_map(|entry| {
            let path = SysfsPath(entry.ok()?.path());
            let res = probe_device(&path);
            if let Err(e) = &res {
                debug!("skipping {:?}: {e}", path.0);
            }
            res.ok()
        }))
}

/// List connected devices that expose a video-class interface, optionally
/// narrowed by vendor/product ID and serial number.
pub fn find_uvc_devices(
    vendor_id: Option<u16>,
    product_id: Option<u16>,
    serial_number: Option<&str>,
) -> Result<Vec<DeviceInfo>, Error> {
    Ok(list_devices()?
        .filter(|d| vendor_id.map_or(true, |vid| d.vendor_id == vid))
        .filter(|d| product_id.map_or(true, |pid| d.product_id == pid))
        .filter(|d| serial_number.map_or(true, |sn| d.serial_number.as_deref() == Some(sn)))
        .filter(|d| d.has_video_interface())
        .collect())
}

fn probe_device(path: &SysfsPath) -> Result<DeviceInfo, io::Error> {
    Ok(DeviceInfo {
        bus_number: path.read_attr("busnum")?,
        device_address: path.read_attr("devnum")?,
        vendor_id: path.read_attr_hex("idVendor")?,
        product_id: path.read_attr_hex("idProduct")?,
        class: path.read_attr_hex("bDeviceClass")?,
        manufacturer: path.read_attr("manufacturer").ok(),
        product: path.read_attr("product").ok(),
        serial_number: path.read_attr("serial").ok(),
        path: path.clone(),
    })
}
