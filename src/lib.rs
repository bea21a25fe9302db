//! User-space UVC camera streaming over Linux usbfs.
//!
//! This crate opens a USB Video Class camera directly through
//! `/dev/bus/usb`, parses its class-specific descriptors into a typed model,
//! validates and exposes its controls, negotiates a stream configuration
//! with the PROBE/COMMIT handshake, and reassembles video frames from
//! isochronous transfers. It targets the quirky end of the consumer webcam
//! spectrum: firmware that over-advertises controls, lies about its UVC
//! version, stalls optional requests, or omits H.264 parameter sets gets
//! the same workarounds the kernel driver applies.
//!
//! The kernel's `uvcvideo` driver normally owns these interfaces; by default
//! the crate detaches it for the session, reattaches it on close, and resets
//! the device so the kernel sees a consistent state.
//!
//! ```no_run
//! use std::time::Duration;
//! use uvc_host::{Codec, OpenOptions, StreamConfig, UvcDevice};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let device = UvcDevice::open(&OpenOptions::new().vendor_id(0x0408).product_id(0x5473))?;
//!
//! for control in device.controls() {
//!     println!("{} (unit {})", control.name, control.unit_id);
//! }
//! device.set_control_by_name("Exposure Time, Absolute", 200)?;
//!
//! let mut stream = device.stream(&StreamConfig::new(1920, 1080).fps(30.0).codec(Codec::Mjpeg))?;
//! for _ in 0..10 {
//!     let frame = stream.next_frame(Duration::from_secs(2))?;
//!     println!("frame #{}: {} bytes", frame.sequence(), frame.payload().len());
//! }
//! stream.stop();
//! # Ok(())
//! # }
//! ```
//!
//! Only Linux is supported; all device I/O goes through usbfs ioctls.

mod bitstream;
pub mod controls;
pub mod descriptors;
mod device;
mod enumeration;
pub mod error;
mod frame;
pub mod quirks;
pub mod streaming;
mod usbfs;

pub use device::{OpenOptions, UvcDevice};
pub use enumeration::{find_uvc_devices, list_devices, DeviceInfo};
pub use error::{Error, StreamError};
pub use frame::{FourCc, Frame};
pub use streaming::{Codec, Stream, StreamConfig, StreamStats, StreamingControl};

/// Make the descriptor parser reachable when fuzzing.
#[cfg(fuzzing)]
pub fn fuzz_parse_configuration(data: &[u8]) {
    let _ = descriptors::parse_configuration(data);
}
