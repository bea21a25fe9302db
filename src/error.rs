//! Error types for device access, negotiation, and streaming.

use std::{fmt::Display, io};

use rustix::io::Errno;

/// Top-level error returned by device-level operations.
#[derive(Debug)]
pub enum Error {
    /// The configuration descriptor could not be parsed.
    Descriptor(DescriptorError),

    /// A class-specific control transfer failed.
    Control(ControlError),

    /// Stream negotiation (PROBE/COMMIT or alternate-setting selection) failed.
    Negotiation(NegotiationError),

    /// A USB transfer failed at the endpoint level.
    Transfer(TransferError),

    /// No device matched the requested selection criteria.
    DeviceNotFound,

    /// Underlying OS or USB stack error not covered by the other variants.
    Io(io::Error),
}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::Descriptor(e) => write!(f, "{e}"),
            Error::Control(e) => write!(f, "{e}"),
            Error::Negotiation(e) => write!(f, "{e}"),
            Error::Transfer(e) => write!(f, "{e}"),
            Error::DeviceNotFound => write!(f, "no matching UVC device found"),
            Error::Io(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Descriptor(e) => Some(e),
            Error::Control(e) => Some(e),
            Error::Negotiation(e) => Some(e),
            Error::Transfer(e) => Some(e),
            Error::DeviceNotFound => None,
            Error::Io(e) => Some(e),
        }
    }
}

impl From<DescriptorError> for Error {
    fn from(e: DescriptorError) -> Self {
        Error::Descriptor(e)
    }
}

impl From<ControlError> for Error {
    fn from(e: ControlError) -> Self {
        Error::Control(e)
    }
}

impl From<NegotiationError> for Error {
    fn from(e: NegotiationError) -> Self {
        Error::Negotiation(e)
    }
}

impl From<TransferError> for Error {
    fn from(e: TransferError) -> Self {
        Error::Transfer(e)
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e)
    }
}

impl From<Errno> for Error {
    fn from(e: Errno) -> Self {
        Error::Io(io::Error::from_raw_os_error(e.raw_os_error()))
    }
}

/// Malformed configuration descriptor data. Fatal to `open`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DescriptorError {
    /// Byte offset into the configuration descriptor where parsing failed.
    pub offset: usize,
    /// Human-readable reason.
    pub reason: &'static str,
}

impl Display for DescriptorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "malformed descriptor at offset {}: {}",
            self.offset, self.reason
        )
    }
}

impl std::error::Error for DescriptorError {}

/// Failure category of a single control transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlErrorKind {
    /// The device stalled the request.
    Stall,

    /// The request timed out.
    Timeout,

    /// The device answered with an unexpected payload length.
    InvalidLength,

    /// The control is not implemented by the device, or the unit/selector
    /// pair is unknown to the host.
    NotSupported,
}

/// A class-specific control transfer failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlError {
    pub kind: ControlErrorKind,
    /// Unit or terminal ID the request addressed (0 for the streaming interface).
    pub unit: u8,
    /// Control selector.
    pub selector: u8,
}

impl ControlError {
    pub(crate) fn new(kind: ControlErrorKind, unit: u8, selector: u8) -> Self {
        ControlError {
            kind,
            unit,
            selector,
        }
    }

    #[track_caller]
    pub(crate) fn log_debug(self) -> Self {
        log::debug!("{}", self);
        self
    }
}

impl Display for ControlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let what = match self.kind {
            ControlErrorKind::Stall => "stalled",
            ControlErrorKind::Timeout => "timed out",
            ControlErrorKind::InvalidLength => "returned an invalid length",
            ControlErrorKind::NotSupported => "is not supported",
        };
        write!(
            f,
            "control request (unit {}, selector 0x{:02x}) {}",
            self.unit, self.selector, what
        )
    }
}

impl std::error::Error for ControlError {}

/// Stream negotiation failure. Fatal to `configure`/`stream`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationError {
    /// No advertised format/frame pair matches the request.
    NoMatchingFormat,

    /// The PROBE payload did not stabilise within the allowed rounds.
    ProbeUnstable,

    /// The device stalled the COMMIT request.
    CommitStalled,

    /// No alternate setting's isochronous endpoint can carry the negotiated
    /// payload transfer size.
    NoAltSettingFits,
}

impl Display for NegotiationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NegotiationError::NoMatchingFormat => {
                write!(f, "no advertised format matches the requested stream")
            }
            NegotiationError::ProbeUnstable => {
                write!(f, "PROBE negotiation did not stabilise")
            }
            NegotiationError::CommitStalled => write!(f, "device rejected COMMIT"),
            NegotiationError::NoAltSettingFits => {
                write!(
                    f,
                    "no alternate setting provides enough isochronous bandwidth"
                )
            }
        }
    }
}

impl std::error::Error for NegotiationError {}

/// Transfer-level error reported by the USB stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferError {
    /// The transfer was cancelled.
    Cancelled,

    /// The endpoint stalled.
    Stall,

    /// The device delivered more data than the buffer could hold.
    Overflow,

    /// The device is gone. Terminal for the stream.
    NoDevice,

    /// Unknown or OS-specific error code (negative errno from the URB).
    Unknown(i32),
}

impl TransferError {
    /// Whether this error terminates the stream (as opposed to corrupting a
    /// single frame).
    pub fn is_fatal(&self) -> bool {
        matches!(self, TransferError::NoDevice)
    }
}

pub(crate) fn errno_to_transfer_error(e: Errno) -> TransferError {
    match e {
        Errno::NODEV | Errno::SHUTDOWN => TransferError::NoDevice,
        Errno::PIPE => TransferError::Stall,
        Errno::NOENT | Errno::CONNRESET | Errno::TIMEDOUT => TransferError::Cancelled,
        Errno::OVERFLOW => TransferError::Overflow,
        e => TransferError::Unknown(e.raw_os_error()),
    }
}

impl Display for TransferError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransferError::Cancelled => write!(f, "transfer was cancelled"),
            TransferError::Stall => write!(f, "endpoint stalled"),
            TransferError::Overflow => write!(f, "buffer overflow"),
            TransferError::NoDevice => write!(f, "device disconnected"),
            TransferError::Unknown(e) => write!(f, "transfer error (errno {e})"),
        }
    }
}

impl std::error::Error for TransferError {}

/// Why a reassembled frame was discarded instead of delivered.
///
/// Frame errors never terminate the stream; they are counted in the stream
/// statistics and the affected frame's sequence number is skipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameError {
    /// An uncompressed frame completed short of the negotiated size.
    Truncated,

    /// An MJPEG frame did not start with the JPEG SOI marker.
    BadMagic,

    /// An H.264/H.265 frame carried an IDR with no parameter sets available.
    ParameterSetMissing,
}

impl Display for FrameError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FrameError::Truncated => write!(f, "frame truncated"),
            FrameError::BadMagic => write!(f, "missing JPEG SOI marker"),
            FrameError::ParameterSetMissing => write!(f, "no SPS/PPS available for IDR"),
        }
    }
}

impl std::error::Error for FrameError {}

/// Error returned from [`Stream::next_frame`][crate::streaming::Stream::next_frame].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamError {
    /// No frame arrived within the requested timeout. The stream is still live.
    TimedOut,

    /// The stream was stopped. Terminal.
    Stopped,

    /// The USB stack reported a fatal transfer error. Terminal.
    Transfer(TransferError),
}

impl Display for StreamError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StreamError::TimedOut => write!(f, "timed out waiting for a frame"),
            StreamError::Stopped => write!(f, "stream stopped"),
            StreamError::Transfer(e) => write!(f, "stream failed: {e}"),
        }
    }
}

impl std::error::Error for StreamError {}
