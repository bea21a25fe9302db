//! Opening a camera and talking to its Video Control interface.
//!
//! A [`UvcDevice`] owns the usbfs file descriptor for the lifetime of the
//! session. The kernel's own video driver normally claims the interfaces of
//! any UVC camera, so claiming goes through a detach/claim guard: the bound
//! kernel driver is detached and the interface claimed in a single
//! `DISCONNECT_CLAIM` ioctl (two separate calls on kernels without it), the
//! driver is reattached when the claim is released, and the device is reset
//! when the session closes if anything was detached along the way. Control
//! transfers are synchronous ioctls with a configurable timeout.

use std::fs::File;
use std::io::Read;
use std::mem::ManuallyDrop;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use log::{debug, warn};
use rustix::fd::{AsRawFd, FromRawFd, OwnedFd};
use rustix::fs::{Mode, OFlags};
use rustix::io::Errno;

use crate::controls::{self, ControlEntry, Query, SET_CUR};
use crate::descriptors::{parse_configuration, UvcModel};
use crate::enumeration::{find_uvc_devices, DeviceInfo};
use crate::error::{ControlError, ControlErrorKind, Error};
use crate::quirks::QuirkRegistry;
use crate::usbfs;

/// Length of the device descriptor preceding the configuration descriptors
/// in the blob usbfs returns when reading the device node.
const DESCRIPTOR_LEN_DEVICE: usize = 18;

/// Environment variable overriding the kernel-driver auto-detach default.
const AUTO_DETACH_ENV: &str = "UVC_HOST_AUTO_DETACH_VC";

fn auto_detach_default() -> bool {
    match std::env::var(AUTO_DETACH_ENV) {
        Ok(v) => !matches!(
            v.trim().to_ascii_lowercase().as_str(),
            "0" | "false" | "no" | "off"
        ),
        Err(_) => true,
    }
}

/// Device selection and session configuration for [`UvcDevice::open`].
#[derive(Debug, Clone)]
pub struct OpenOptions {
    pub vendor_id: Option<u16>,
    pub product_id: Option<u16>,
    /// Disambiguates among devices with identical VID/PID.
    pub serial_number: Option<String>,
    /// Which Video Streaming interface to use on multi-sensor devices;
    /// `None` selects the first one.
    pub streaming_interface: Option<u8>,
    /// Detach the kernel driver before claiming interfaces and reattach it
    /// afterwards. Defaults to on, overridable via `UVC_HOST_AUTO_DETACH_VC`.
    pub auto_detach_vc: bool,
    /// Timeout for each synchronous control transfer.
    pub control_timeout_ms: u32,
    /// Directory holding per-GUID quirk JSON files.
    pub quirks_dir: Option<PathBuf>,
}

impl Default for OpenOptions {
    fn default() -> Self {
        OpenOptions {
            vendor_id: None,
            product_id: None,
            serial_number: None,
            streaming_interface: None,
            auto_detach_vc: auto_detach_default(),
            control_timeout_ms: 2000,
            quirks_dir: None,
        }
    }
}

impl OpenOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn vendor_id(mut self, vid: u16) -> Self {
        self.vendor_id = Some(vid);
        self
    }

    pub fn product_id(mut self, pid: u16) -> Self {
        self.product_id = Some(pid);
        self
    }

    pub fn serial_number(mut self, serial: impl Into<String>) -> Self {
        self.serial_number = Some(serial.into());
        self
    }
}

/// State shared between the device session and a running stream's I/O
/// thread.
pub(crate) struct DeviceShared {
    fd: OwnedFd,
    needs_reset: AtomicBool,
}

impl DeviceShared {
    pub(crate) fn fd(&self) -> &OwnedFd {
        &self.fd
    }

    pub(crate) fn mark_needs_reset(&self) {
        self.needs_reset.store(true, Ordering::Relaxed);
    }
}

/// Scoped interface ownership with kernel-driver coordination.
///
/// Dropping the claim releases the interface and reattaches the kernel
/// driver if one was detached on the way in. The release path runs on every
/// exit, including unwinds.
pub(crate) struct InterfaceClaim {
    shared: Arc<DeviceShared>,
    interface: u8,
    reattach: bool,
}

impl InterfaceClaim {
    pub(crate) fn acquire(
        shared: &Arc<DeviceShared>,
        interface: u8,
        auto_detach: bool,
    ) -> Result<InterfaceClaim, Error> {
        if auto_detach {
            // Detach and claim in one ioctl so the kernel driver cannot
            // rebind in between. Whether a driver was actually bound is not
            // reported, so the release path always reattaches and the device
            // is reset at close.
            match usbfs::detach_and_claim_interface(shared.fd(), interface) {
                Ok(()) => {
                    debug!("detached kernel driver from interface {interface} and claimed it");
                    shared.mark_needs_reset();
                    return Ok(InterfaceClaim {
                        shared: shared.clone(),
                        interface,
                        reattach: true,
                    });
                }
                Err(Errno::NOTTY) => {
                    // Kernel predates DISCONNECT_CLAIM.
                    debug!("DISCONNECT_CLAIM unsupported, detaching separately");
                }
                Err(e) => {
                    warn!("failed to claim interface {interface}: {e}");
                    return Err(Error::from(e));
                }
            }
        }

        let mut reattach = false;
        if auto_detach {
            match usbfs::detach_kernel_driver(shared.fd(), interface) {
                Ok(()) => {
                    debug!("detached kernel driver from interface {interface}");
                    shared.mark_needs_reset();
                    reattach = true;
                }
                Err(Errno::NODATA) => {} // no driver bound
                Err(e) => debug!("detach on interface {interface} failed: {e}"),
            }
        }
        usbfs::claim_interface(shared.fd(), interface).map_err(|e| {
            warn!("failed to claim interface {interface}: {e}");
            Error::from(e)
        })?;
        Ok(InterfaceClaim {
            shared: shared.clone(),
            interface,
            reattach,
        })
    }
}

impl Drop for InterfaceClaim {
    fn drop(&mut self) {
        if let Err(e) = usbfs::release_interface(self.shared.fd(), self.interface) {
            debug!("failed to release interface {}: {e}", self.interface);
        }
        if self.reattach {
            if let Err(e) = usbfs::attach_kernel_driver(self.shared.fd(), self.interface) {
                debug!(
                    "failed to reattach kernel driver on interface {}: {e}",
                    self.interface
                );
            }
        }
    }
}

/// An open UVC camera session.
pub struct UvcDevice {
    shared: Arc<DeviceShared>,
    info: DeviceInfo,
    model: UvcModel,
    quirks: QuirkRegistry,
    controls: OnceLock<Vec<ControlEntry>>,
    vc_claim: Option<InterfaceClaim>,
    pub(crate) auto_detach: bool,
    pub(crate) streaming_interface: Option<u8>,
    control_timeout_ms: u32,
}

impl UvcDevice {
    /// Open the first device matching `options`.
    pub fn open(options: &OpenOptions) -> Result<UvcDevice, Error> {
        let info = find_uvc_devices(
            options.vendor_id,
            options.product_id,
            options.serial_number.as_deref(),
        )?
        .into_iter()
        .next()
        .ok_or(Error::DeviceNotFound)?;
        Self::open_device(info, options)
    }

    /// Open a specific enumerated device.
    pub fn open_device(info: DeviceInfo, options: &OpenOptions) -> Result<UvcDevice, Error> {
        let path = info.usbfs_path();
        debug!("opening usbfs device {}", path.display());
        let fd = rustix::fs::open(&path, OFlags::RDWR | OFlags::CLOEXEC, Mode::empty())
            .map_err(Error::from)?;

        // Reading the device node yields the device descriptor followed by
        // the configuration descriptors.
        let descriptors = {
            let mut file = unsafe { ManuallyDrop::new(File::from_raw_fd(fd.as_raw_fd())) };
            let mut buf = Vec::new();
            file.read_to_end(&mut buf).map_err(Error::Io)?;
            buf
        };
        if descriptors.len() < DESCRIPTOR_LEN_DEVICE {
            return Err(Error::Descriptor(crate::error::DescriptorError {
                offset: 0,
                reason: "descriptor blob shorter than a device descriptor",
            }));
        }

        let model = parse_configuration(&descriptors[DESCRIPTOR_LEN_DEVICE..])?;
        debug!(
            "parsed UVC model: {} unit(s), {} streaming interface(s), bcdUVC 0x{:04x}",
            model.video_control.units.len(),
            model.streaming.len(),
            model.video_control.uvc_version,
        );

        let quirks = match &options.quirks_dir {
            Some(dir) => QuirkRegistry::load_dir(dir),
            None => QuirkRegistry::empty(),
        };

        let shared = Arc::new(DeviceShared {
            fd,
            needs_reset: AtomicBool::new(false),
        });

        let vc_claim = InterfaceClaim::acquire(
            &shared,
            model.video_control.interface_number,
            options.auto_detach_vc,
        )?;

        let dev = UvcDevice {
            shared,
            info,
            model,
            quirks,
            controls: OnceLock::new(),
            vc_claim: Some(vc_claim),
            auto_detach: options.auto_detach_vc,
            streaming_interface: options.streaming_interface,
            control_timeout_ms: options.control_timeout_ms,
        };

        // Validate every advertised control up front. Firmware lies about
        // bmControls; the GET_INFO sweep marks the liars unsupported.
        debug!("validated {} control(s)", dev.controls().len());

        Ok(dev)
    }

    pub fn info(&self) -> &DeviceInfo {
        &self.info
    }

    /// The parsed descriptor tree. Immutable for the session lifetime.
    pub fn model(&self) -> &UvcModel {
        &self.model
    }

    pub(crate) fn shared(&self) -> &Arc<DeviceShared> {
        &self.shared
    }

    // ------------------------------------------------------------------
    // Class-specific control transfers
    // ------------------------------------------------------------------

    fn map_control_errno(e: Errno, unit: u8, selector: u8) -> ControlError {
        let kind = match e {
            Errno::PIPE => ControlErrorKind::Stall,
            Errno::TIMEDOUT => ControlErrorKind::Timeout,
            Errno::INVAL => ControlErrorKind::InvalidLength,
            _ => ControlErrorKind::NotSupported,
        };
        ControlError::new(kind, unit, selector)
    }

    /// Class-specific GET_* on `interface` addressing `unit` (0 for the
    /// interface itself).
    pub(crate) fn class_get(
        &self,
        interface: u8,
        unit: u8,
        selector: u8,
        query: Query,
        len: u16,
    ) -> Result<Vec<u8>, ControlError> {
        let mut buf = vec![0u8; len as usize];
        let n = usbfs::control(
            self.shared.fd(),
            usbfs::CtrlTransfer {
                bRequestType: 0xa1,
                bRequest: query as u8,
                wValue: u16::from(selector) << 8,
                wIndex: u16::from(unit) << 8 | u16::from(interface),
                wLength: len,
                timeout: self.control_timeout_ms,
                data: buf.as_mut_ptr().cast(),
            },
        )
        .map_err(|e| Self::map_control_errno(e, unit, selector).log_debug())?;
        buf.truncate(n);
        Ok(buf)
    }

    /// Class-specific SET_CUR on `interface` addressing `unit`.
    pub(crate) fn class_set(
        &self,
        interface: u8,
        unit: u8,
        selector: u8,
        payload: &[u8],
    ) -> Result<(), ControlError> {
        let mut data = payload.to_vec();
        usbfs::control(
            self.shared.fd(),
            usbfs::CtrlTransfer {
                bRequestType: 0x21,
                bRequest: SET_CUR,
                wValue: u16::from(selector) << 8,
                wIndex: u16::from(unit) << 8 | u16::from(interface),
                wLength: data.len() as u16,
                timeout: self.control_timeout_ms,
                data: data.as_mut_ptr().cast(),
            },
        )
        .map_err(|e| Self::map_control_errno(e, unit, selector).log_debug())?;
        Ok(())
    }

    /// GET_* addressed to a Video Control unit.
    pub(crate) fn vc_get(
        &self,
        unit: u8,
        selector: u8,
        query: Query,
        len: u16,
    ) -> Result<Vec<u8>, ControlError> {
        self.class_get(
            self.model.video_control.interface_number,
            unit,
            selector,
            query,
            len,
        )
    }

    /// SET_CUR addressed to a Video Control unit.
    pub(crate) fn vc_set_cur(
        &self,
        unit: u8,
        selector: u8,
        payload: &[u8],
    ) -> Result<(), ControlError> {
        self.class_set(
            self.model.video_control.interface_number,
            unit,
            selector,
            payload,
        )
    }

    // ------------------------------------------------------------------
    // High-level control API
    // ------------------------------------------------------------------

    /// The validated controls of this device.
    ///
    /// The first call performs the GET_INFO sweep over every advertised
    /// control and caches the result; the cache is immutable afterwards.
    pub fn controls(&self) -> &[ControlEntry] {
        self.controls
            .get_or_init(|| controls::enumerate(self, &self.quirks))
    }

    /// Look up a control by its human-readable name, case-insensitively.
    pub fn control_named(&self, name: &str) -> Option<&ControlEntry> {
        self.controls()
            .iter()
            .find(|c| c.name.eq_ignore_ascii_case(name))
    }

    fn require_control(&self, name: &str) -> Result<ControlEntry, Error> {
        self.control_named(name).cloned().ok_or_else(|| {
            Error::Control(ControlError::new(ControlErrorKind::NotSupported, 0, 0))
        })
    }

    /// Read a control's current value as an integer.
    pub fn get_control(&self, entry: &ControlEntry) -> Result<i64, Error> {
        if !entry.is_readable() {
            return Err(Error::Control(ControlError::new(
                ControlErrorKind::NotSupported,
                entry.unit_id,
                entry.selector,
            )));
        }
        let data = self.vc_get(entry.unit_id, entry.selector, Query::Cur, entry.len)?;
        controls::decode_value(&data, entry.signed).ok_or_else(|| {
            Error::Control(ControlError::new(
                ControlErrorKind::InvalidLength,
                entry.unit_id,
                entry.selector,
            ))
        })
    }

    /// Read a control's raw payload with an arbitrary GET_* query.
    pub fn get_control_raw(&self, entry: &ControlEntry, query: Query) -> Result<Vec<u8>, Error> {
        Ok(self.vc_get(entry.unit_id, entry.selector, query, entry.len)?)
    }

    /// Write a control value. The device clamps to its advertised range and
    /// resolution; [`ControlEntry::clip`] predicts the settled value.
    pub fn set_control(&self, entry: &ControlEntry, value: i64) -> Result<(), Error> {
        if !entry.is_writable() {
            return Err(Error::Control(ControlError::new(
                ControlErrorKind::NotSupported,
                entry.unit_id,
                entry.selector,
            )));
        }
        let payload = controls::encode_value(value, entry.len);
        Ok(self.vc_set_cur(entry.unit_id, entry.selector, &payload)?)
    }

    /// Write a raw control payload.
    pub fn set_control_raw(&self, entry: &ControlEntry, payload: &[u8]) -> Result<(), Error> {
        Ok(self.vc_set_cur(entry.unit_id, entry.selector, payload)?)
    }

    /// [`get_control`][Self::get_control] by control name.
    pub fn get_control_by_name(&self, name: &str) -> Result<i64, Error> {
        let entry = self.require_control(name)?;
        self.get_control(&entry)
    }

    /// [`set_control`][Self::set_control] by control name.
    pub fn set_control_by_name(&self, name: &str, value: i64) -> Result<(), Error> {
        let entry = self.require_control(name)?;
        self.set_control(&entry, value)
    }
}

impl Drop for UvcDevice {
    fn drop(&mut self) {
        // Release and reattach before the reset so the kernel re-probes a
        // consistent device.
        drop(self.vc_claim.take());
        if self.shared.needs_reset.load(Ordering::Relaxed) {
            debug!("resetting device to restore kernel driver state");
            if let Err(e) = usbfs::reset(self.shared.fd()) {
                warn!("device reset failed: {e}");
            }
        }
    }
}
