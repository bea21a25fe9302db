//! Wrappers for the [usbfs] character-device ioctls used by this crate,
//! translated from the [C structures and ioctl definitions][uapi].
//!
//! [usbfs]: https://www.kernel.org/doc/html/latest/driver-api/usb/usb.html#the-usb-character-device-nodes
//! [uapi]: https://github.com/torvalds/linux/blob/master/tools/include/uapi/linux/usbdevice_fs.h

use std::ffi::{c_int, c_uchar, c_uint, c_void};

use rustix::{
    fd::AsFd,
    io,
    ioctl::{self, Ioctl, IoctlOutput, Opcode},
};

pub fn claim_interface<Fd: AsFd>(fd: Fd, interface: u8) -> io::Result<()> {
    unsafe {
        let ctl = ioctl::Setter::<{ ioctl::opcode::read::<c_uint>(b'U', 15) }, c_uint>::new(
            interface.into(),
        );
        ioctl::ioctl(fd, ctl)
    }
}

pub fn release_interface<Fd: AsFd>(fd: Fd, interface: u8) -> io::Result<()> {
    unsafe {
        let ctl = ioctl::Setter::<{ ioctl::opcode::read::<c_uint>(b'U', 16) }, c_uint>::new(
            interface.into(),
        );
        ioctl::ioctl(fd, ctl)
    }
}

#[repr(C)]
struct DetachAndClaim {
    interface: c_uint,
    flags: c_uint,
    driver: [c_uchar; 255 + 1],
}

const USBDEVFS_DISCONNECT_CLAIM: Opcode = ioctl::opcode::read::<DetachAndClaim>(b'U', 27);

/// `USBDEVFS_DISCONNECT_CLAIM` flag: detach whichever driver is bound except
/// the one named in `driver`.
const USBDEVFS_DISCONNECT_CLAIM_EXCEPT_DRIVER: c_uint = 0x02;

/// Atomically detach the kernel driver bound to `interface` (if it is not
/// usbfs itself) and claim the interface, leaving no window for the driver
/// to rebind in between.
///
/// The video class driver re-probes aggressively, so the separate
/// detach-then-claim sequence can lose the race; this is the path the
/// kernel-coordination contract requires. Fails with `ENOTTY` on kernels
/// predating the ioctl.
pub fn detach_and_claim_interface<Fd: AsFd>(fd: Fd, interface: u8) -> io::Result<()> {
    let mut dc = DetachAndClaim {
        interface: interface.into(),
        flags: USBDEVFS_DISCONNECT_CLAIM_EXCEPT_DRIVER,
        driver: [0; 256],
    };
    dc.driver[0..6].copy_from_slice(b"usbfs\0");
    unsafe {
        let ctl = ioctl::Setter::<{ USBDEVFS_DISCONNECT_CLAIM }, DetachAndClaim>::new(dc);
        ioctl::ioctl(&fd, ctl)
    }
}

#[repr(C)]
struct UsbFsIoctl {
    interface: c_uint,
    ioctl_code: c_uint,
    data: *mut c_void,
}

/// Opcodes nested inside a `USBDEVFS_IOCTL` operation, dispatched to the
/// kernel driver bound to an interface.
#[allow(non_camel_case_types)]
mod nested {
    use super::*;

    pub const USBDEVFS_DISCONNECT: Opcode = ioctl::opcode::none(b'U', 22);
    pub const USBDEVFS_CONNECT: Opcode = ioctl::opcode::none(b'U', 23);
}

const USBDEVFS_IOCTL: Opcode = ioctl::opcode::read_write::<UsbFsIoctl>(b'U', 18);

/// Ask the kernel driver bound to `interface` to unbind.
///
/// Fails with `ENODATA` when no driver is bound.
pub fn detach_kernel_driver<Fd: AsFd>(fd: Fd, interface: u8) -> io::Result<()> {
    let command = UsbFsIoctl {
        interface: interface.into(),
        ioctl_code: nested::USBDEVFS_DISCONNECT as _,
        data: std::ptr::null_mut(),
    };
    unsafe {
        let ctl = ioctl::Setter::<{ USBDEVFS_IOCTL }, UsbFsIoctl>::new(command);
        ioctl::ioctl(fd, ctl)
    }
}

/// Ask the kernel to re-probe drivers for `interface`.
pub fn attach_kernel_driver<Fd: AsFd>(fd: Fd, interface: u8) -> io::Result<()> {
    let command = UsbFsIoctl {
        interface: interface.into(),
        ioctl_code: nested::USBDEVFS_CONNECT as _,
        data: std::ptr::null_mut(),
    };
    unsafe {
        let ctl = ioctl::Setter::<{ USBDEVFS_IOCTL }, UsbFsIoctl>::new(command);
        ioctl::ioctl(fd, ctl)
    }
}

#[repr(C)]
struct SetAltSetting {
    interface: c_int,
    alt_setting: c_int,
}

pub fn set_interface<Fd: AsFd>(fd: Fd, interface: u8, alt_setting: u8) -> io::Result<()> {
    unsafe {
        let ctl =
            ioctl::Setter::<{ ioctl::opcode::read::<SetAltSetting>(b'U', 4) }, SetAltSetting>::new(
                SetAltSetting {
                    interface: interface.into(),
                    alt_setting: alt_setting.into(),
                },
            );
        ioctl::ioctl(fd, ctl)
    }
}

pub fn clear_halt<Fd: AsFd>(fd: Fd, endpoint: u8) -> io::Result<()> {
    unsafe {
        let ctl = ioctl::Setter::<{ ioctl::opcode::read::<c_uint>(b'U', 21) }, c_uint>::new(
            endpoint.into(),
        );
        ioctl::ioctl(fd, ctl)
    }
}

pub fn reset<Fd: AsFd>(fd: Fd) -> io::Result<()> {
    unsafe {
        let ctl = ioctl::NoArg::<{ ioctl::opcode::none(b'U', 20) }>::new();
        ioctl::ioctl(fd, ctl)
    }
}

/// Ioctl passing a raw pointer whose pointee the kernel holds on to (URB
/// submission and discard).
struct PassPtr<const OPCODE: Opcode, Input> {
    input: *mut Input,
}

impl<const OPCODE: Opcode, Input> PassPtr<OPCODE, Input> {
    /// # Safety
    ///
    /// `OPCODE` must be valid for this fd and `Input` must be the type the
    /// kernel expects behind the pointer.
    unsafe fn new(input: *mut Input) -> Self {
        Self { input }
    }
}

unsafe impl<const OPCODE: Opcode, Input> Ioctl for PassPtr<OPCODE, Input> {
    type Output = ();

    const IS_MUTATING: bool = false;

    fn opcode(&self) -> Opcode {
        OPCODE
    }

    fn as_ptr(&mut self) -> *mut c_void {
        self.input as *mut c_void
    }

    unsafe fn output_from_ptr(_: IoctlOutput, _: *mut c_void) -> io::Result<Self::Output> {
        Ok(())
    }
}

/// Submit a URB. The kernel owns the URB and its buffer until the URB is
/// reaped or discarded and the discard's reap is observed.
///
/// # Safety
///
/// `urb` and the buffers it points to must stay alive and unaliased until the
/// URB comes back out of [`reap_urb_ndelay`].
pub unsafe fn submit_urb<Fd: AsFd>(fd: Fd, urb: *mut Urb) -> io::Result<()> {
    unsafe {
        let ctl = PassPtr::<{ ioctl::opcode::read::<Urb>(b'U', 10) }, Urb>::new(urb);
        ioctl::ioctl(fd, ctl)
    }
}

/// Reap the next completed URB without blocking. `EAGAIN` when none is ready.
pub fn reap_urb_ndelay<Fd: AsFd>(fd: Fd) -> io::Result<*mut Urb> {
    unsafe {
        let ctl = ioctl::Getter::<{ ioctl::opcode::write::<*mut Urb>(b'U', 13) }, *mut Urb>::new();
        ioctl::ioctl(fd, ctl)
    }
}

/// Cancel a submitted URB. The URB still completes (with `-ENOENT`) and must
/// be reaped.
///
/// # Safety
///
/// `urb` must be a URB previously passed to [`submit_urb`] on this fd.
pub unsafe fn discard_urb<Fd: AsFd>(fd: Fd, urb: *mut Urb) -> io::Result<()> {
    unsafe {
        let ctl = PassPtr::<{ ioctl::opcode::none(b'U', 11) }, Urb>::new(urb);
        ioctl::ioctl(fd, ctl)
    }
}

pub const USBDEVFS_URB_TYPE_ISO: c_uchar = 0;

pub const USBDEVFS_URB_ISO_ASAP: c_uint = 0x02;

#[repr(C)]
#[derive(Debug)]
pub struct Urb {
    pub ep_type: c_uchar,
    pub endpoint: c_uchar,
    pub status: c_int,
    pub flags: c_uint,
    pub buffer: *mut u8,
    pub buffer_length: c_int,
    pub actual_length: c_int,
    pub start_frame: c_int,
    pub number_of_packets_or_stream_id: c_uint, // a union in C
    pub error_count: c_int,
    pub signr: c_uint,
    pub usercontext: *mut c_void,
    // + variable length array of IsoPacketDesc
}

/// Per-packet descriptor trailing an isochronous URB.
///
/// `status` carries a negative errno despite the unsigned C type.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct IsoPacketDesc {
    pub length: c_uint,
    pub actual_length: c_uint,
    pub status: c_uint,
}

struct ControlIoctl<const OPCODE: Opcode, Input> {
    input: Input,
}

unsafe impl<const OPCODE: Opcode, Input> Ioctl for ControlIoctl<OPCODE, Input> {
    type Output = usize;

    const IS_MUTATING: bool = true;

    fn opcode(&self) -> Opcode {
        OPCODE
    }

    fn as_ptr(&mut self) -> *mut c_void {
        &mut self.input as *mut Input as *mut c_void
    }

    unsafe fn output_from_ptr(r: IoctlOutput, _: *mut c_void) -> io::Result<usize> {
        Ok(r as usize)
    }
}

#[repr(C)]
#[allow(non_snake_case)]
pub struct CtrlTransfer {
    pub bRequestType: u8,
    pub bRequest: u8,
    pub wValue: u16,
    pub wIndex: u16,
    pub wLength: u16,
    pub timeout: u32, /* in milliseconds */
    pub data: *mut c_void,
}

/// Perform a synchronous control transfer; returns the number of bytes moved
/// in the data stage.
pub fn control<Fd: AsFd>(fd: Fd, transfer: CtrlTransfer) -> io::Result<usize> {
    unsafe {
        let ctl = ControlIoctl::<
            { ioctl::opcode::read_write::<CtrlTransfer>(b'U', 0) },
            CtrlTransfer,
        > {
            input: transfer,
        };
        ioctl::ioctl(fd, ctl)
    }
}
