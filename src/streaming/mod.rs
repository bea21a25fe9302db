//! Stream configuration, negotiation, and the public stream handle.
//!
//! [`UvcDevice::stream`] resolves the requested resolution/codec against the
//! advertised formats, runs PROBE/COMMIT, reserves isochronous bandwidth by
//! selecting an alternate setting, and hands the transfer machinery to a
//! dedicated I/O thread. The returned [`Stream`] yields completed frames
//! from a bounded queue and stops the stream when dropped.

mod engine;
mod negotiate;
mod queue;
mod reassembly;
mod transfer;

pub use negotiate::StreamingControl;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use log::{debug, info};

use crate::descriptors::{FormatKind, FrameInfo, StreamFormat, VideoStreaming};
use crate::device::{InterfaceClaim, UvcDevice};
use crate::error::{Error, FrameError, NegotiationError, StreamError};
use crate::frame::{FourCc, Frame};
use crate::usbfs;

use queue::FrameQueue;
use reassembly::{FrameReassembler, ReassemblyConfig};

/// Codec preference for stream selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Codec {
    /// Uncompressed first, then MJPEG, then frame-based codecs.
    #[default]
    Auto,
    Mjpeg,
    Yuyv,
    H264,
    H265,
    /// Any frame-based format, regardless of codec tag.
    FrameBased,
}

/// Stream request and scheduler tuning.
#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// Requested frame width; 0 accepts the format's default frame.
    pub width: u16,
    /// Requested frame height; 0 accepts the format's default frame.
    pub height: u16,
    /// Requested frame rate; `None` keeps the frame's default interval.
    pub fps: Option<f64>,
    pub codec: Codec,
    /// Concurrently submitted isochronous transfers.
    pub num_transfers: usize,
    /// Isochronous packets per transfer.
    pub packets_per_transfer: usize,
    /// Completed frames buffered between the I/O thread and the consumer.
    pub frame_queue_size: usize,
    /// Deliver short uncompressed frames instead of discarding them.
    pub deliver_partial: bool,
    /// When the frame queue is full, drop the oldest frame (live preview)
    /// instead of pausing transfer resubmission.
    pub drop_on_overflow: bool,
    /// Completed frames to discard at stream start.
    pub skip_initial: u32,
}

impl Default for StreamConfig {
    fn default() -> Self {
        StreamConfig {
            width: 0,
            height: 0,
            fps: None,
            codec: Codec::Auto,
            num_transfers: 12,
            packets_per_transfer: 32,
            frame_queue_size: 4,
            deliver_partial: false,
            drop_on_overflow: true,
            skip_initial: 0,
        }
    }
}

impl StreamConfig {
    pub fn new(width: u16, height: u16) -> StreamConfig {
        StreamConfig {
            width,
            height,
            ..Default::default()
        }
    }

    pub fn fps(mut self, fps: f64) -> Self {
        self.fps = Some(fps);
        self
    }

    pub fn codec(mut self, codec: Codec) -> Self {
        self.codec = codec;
        self
    }
}

/// Counters accumulated by a running stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamStats {
    /// Non-empty isochronous packets seen.
    pub packets: u64,
    /// Frames that reached a completion boundary, delivered or not.
    pub frames_completed: u64,
    pub frames_delivered: u64,
    /// Dropped: a packet-level error poisoned the frame.
    pub dropped_errored: u64,
    /// Dropped: uncompressed frame completed short of the negotiated size.
    pub dropped_truncated: u64,
    /// Dropped: MJPEG frame without the JPEG SOI marker.
    pub dropped_bad_magic: u64,
    /// Dropped: H.264/H.265 IDR arrived before any parameter sets.
    pub dropped_parameter_set: u64,
    /// Dropped: consumer fell behind and the overflow policy discarded the
    /// oldest queued frame.
    pub dropped_overflow: u64,
    /// Transfer-level data errors absorbed into frame error flags.
    pub transfer_errors: u64,
}

impl StreamStats {
    /// Frames dropped for one particular frame-level reason.
    pub fn dropped(&self, reason: FrameError) -> u64 {
        match reason {
            FrameError::Truncated => self.dropped_truncated,
            FrameError::BadMagic => self.dropped_bad_magic,
            FrameError::ParameterSetMissing => self.dropped_parameter_set,
        }
    }
}

#[derive(Default)]
pub(crate) struct StatsShared {
    pub packets: AtomicU64,
    pub frames_completed: AtomicU64,
    pub frames_delivered: AtomicU64,
    pub dropped_errored: AtomicU64,
    pub dropped_truncated: AtomicU64,
    pub dropped_bad_magic: AtomicU64,
    pub dropped_parameter_set: AtomicU64,
    pub dropped_overflow: AtomicU64,
    pub transfer_errors: AtomicU64,
}

impl StatsShared {
    fn snapshot(&self) -> StreamStats {
        StreamStats {
            packets: self.packets.load(Ordering::Relaxed),
            frames_completed: self.frames_completed.load(Ordering::Relaxed),
            frames_delivered: self.frames_delivered.load(Ordering::Relaxed),
            dropped_errored: self.dropped_errored.load(Ordering::Relaxed),
            dropped_truncated: self.dropped_truncated.load(Ordering::Relaxed),
            dropped_bad_magic: self.dropped_bad_magic.load(Ordering::Relaxed),
            dropped_parameter_set: self.dropped_parameter_set.load(Ordering::Relaxed),
            dropped_overflow: self.dropped_overflow.load(Ordering::Relaxed),
            transfer_errors: self.transfer_errors.load(Ordering::Relaxed),
        }
    }
}

/// Resolve a codec preference to an ordered list of format filters.
fn preference_order(codec: Codec) -> &'static [(FormatKind, Option<FourCc>)] {
    match codec {
        Codec::Auto => &[
            (FormatKind::Uncompressed, None),
            (FormatKind::Mjpeg, None),
            (FormatKind::FrameBased, None),
        ],
        Codec::Yuyv => &[(FormatKind::Uncompressed, None)],
        Codec::Mjpeg => &[(FormatKind::Mjpeg, None)],
        Codec::H264 => &[(FormatKind::FrameBased, Some(FourCc::H264))],
        Codec::H265 => &[(FormatKind::FrameBased, Some(FourCc::H265))],
        Codec::FrameBased => &[(FormatKind::FrameBased, None)],
    }
}

fn select_format(
    vs: &VideoStreaming,
    width: u16,
    height: u16,
    codec: Codec,
) -> Option<(&StreamFormat, &FrameInfo)> {
    for (kind, fourcc) in preference_order(codec) {
        let formats = vs
            .formats
            .iter()
            .filter(|fmt| fmt.kind == *kind)
            .filter(|fmt| fourcc.map_or(true, |fcc| fmt.fourcc == fcc));
        for fmt in formats {
            if width == 0 || height == 0 {
                let frame = fmt
                    .frame_by_index(fmt.default_frame_index)
                    .or_else(|| fmt.frames.first());
                if let Some(frame) = frame {
                    return Some((fmt, frame));
                }
                continue;
            }
            if let Some(frame) = fmt
                .frames
                .iter()
                .find(|fr| fr.width == width && fr.height == height)
            {
                return Some((fmt, frame));
            }
        }
    }
    None
}

impl UvcDevice {
    /// Negotiate and start a video stream.
    pub fn stream(&self, config: &StreamConfig) -> Result<Stream, Error> {
        let vs = match self.streaming_interface {
            Some(n) => self.model().streaming_interface(n),
            None => self.model().streaming.first(),
        }
        .ok_or(Error::Negotiation(NegotiationError::NoMatchingFormat))?;

        let (format, frame) = select_format(vs, config.width, config.height, config.codec)
            .ok_or(Error::Negotiation(NegotiationError::NoMatchingFormat))?;
        info!(
            "selected {} {}x{} (format {}, frame {}) on interface {}",
            format.fourcc,
            frame.width,
            frame.height,
            format.format_index,
            frame.frame_index,
            vs.interface_number
        );

        let claim = InterfaceClaim::acquire(self.shared(), vs.interface_number, self.auto_detach)?;

        let control = negotiate::probe_commit(self, vs, format, frame, config.fps)?;

        let required_payload = if control.max_payload_transfer_size > 0 {
            control.max_payload_transfer_size
        } else {
            frame.max_frame_size.max(1)
        };
        let alt = vs
            .select_alt_for_payload(required_payload)
            .ok_or(Error::Negotiation(NegotiationError::NoAltSettingFits))?;
        let endpoint = alt
            .endpoint
            .ok_or(Error::Negotiation(NegotiationError::NoAltSettingFits))?;
        usbfs::set_interface(self.shared().fd(), vs.interface_number, alt.alternate_setting)
            .map_err(Error::from)?;
        info!(
            "streaming on alternate setting {} (endpoint 0x{:02x}, {} bytes per microframe)",
            alt.alternate_setting, endpoint.address, endpoint.packet_capacity
        );
        if let Err(e) = usbfs::clear_halt(self.shared().fd(), endpoint.address) {
            debug!("clear halt on endpoint 0x{:02x} failed: {e}", endpoint.address);
        }

        let max_video_frame_size = if control.max_video_frame_size > 0 {
            control.max_video_frame_size
        } else {
            frame.max_frame_size
        } as usize;

        let stats = Arc::new(StatsShared::default());
        let reassembler = FrameReassembler::new(
            ReassemblyConfig {
                fourcc: format.fourcc,
                width: frame.width,
                height: frame.height,
                kind: format.kind,
                max_video_frame_size,
                deliver_partial: config.deliver_partial,
                skip_initial: config.skip_initial,
            },
            stats.clone(),
        );
        let frame_queue = Arc::new(FrameQueue::new(config.frame_queue_size));
        let stop = Arc::new(AtomicBool::new(false));

        let engine_cfg = engine::EngineConfig {
            interface_number: vs.interface_number,
            endpoint: endpoint.address,
            num_transfers: config.num_transfers.max(1),
            packets_per_transfer: config.packets_per_transfer.max(1),
            packet_size: endpoint.packet_capacity as usize,
            drop_on_overflow: config.drop_on_overflow,
        };
        let thread = std::thread::Builder::new()
            .name("uvc-stream".into())
            .spawn({
                let shared = self.shared().clone();
                let queue = frame_queue.clone();
                let stop = stop.clone();
                let stats = stats.clone();
                move || engine::run(shared, engine_cfg, reassembler, queue, stop, stats)
            })
            .map_err(Error::Io)?;

        Ok(Stream {
            queue: frame_queue,
            stop,
            engine: Some(thread),
            claim: Some(claim),
            stats,
            control,
            alt_setting: alt.alternate_setting,
            fourcc: format.fourcc,
            width: frame.width,
            height: frame.height,
        })
    }
}

/// A running video stream.
pub struct Stream {
    queue: Arc<FrameQueue>,
    stop: Arc<AtomicBool>,
    engine: Option<JoinHandle<()>>,
    claim: Option<InterfaceClaim>,
    stats: Arc<StatsShared>,
    control: StreamingControl,
    alt_setting: u8,
    fourcc: FourCc,
    width: u16,
    height: u16,
}

impl Stream {
    /// Wait for the next completed frame.
    ///
    /// Safe to call from any thread, but the stream is a single logical
    /// consumer: concurrent callers compete for frames. After [`stop`]
    /// (or a fatal transfer error) the queued frames drain and every further
    /// call reports the terminal state.
    ///
    /// [`stop`]: Stream::stop
    pub fn next_frame(&self, timeout: Duration) -> Result<Frame, StreamError> {
        self.queue.pop(timeout)
    }

    /// Stop the stream: cancel the outstanding transfers, wait for their
    /// completions, and release the isochronous bandwidth. The frame being
    /// assembled is discarded. Idempotent.
    pub fn stop(&mut self) {
        if let Some(thread) = self.engine.take() {
            self.stop.store(true, Ordering::Release);
            if thread.join().is_err() {
                log::error!("stream I/O thread panicked");
                self.queue.push_terminal(StreamError::Stopped);
            }
        }
        // Releases the interface and reattaches the kernel driver.
        self.claim.take();
    }

    pub fn stats(&self) -> StreamStats {
        self.stats.snapshot()
    }

    /// The streaming control committed during negotiation.
    pub fn streaming_control(&self) -> &StreamingControl {
        &self.control
    }

    pub fn alt_setting(&self) -> u8 {
        self.alt_setting
    }

    pub fn fourcc(&self) -> FourCc {
        self.fourcc
    }

    pub fn width(&self) -> u16 {
        self.width
    }

    pub fn height(&self) -> u16 {
        self.height
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptors::{AltSetting, FrameIntervals, IsoEndpoint};

    fn test_frame(index: u8, width: u16, height: u16) -> FrameInfo {
        FrameInfo {
            frame_index: index,
            width,
            height,
            min_bit_rate: 0,
            max_bit_rate: 0,
            max_frame_size: width as u32 * height as u32 * 2,
            default_interval: 333_333,
            intervals: FrameIntervals::Discrete(vec![333_333]),
            still_supported: false,
        }
    }

    fn test_format(index: u8, kind: FormatKind, fourcc: FourCc, frames: Vec<FrameInfo>) -> StreamFormat {
        StreamFormat {
            format_index: index,
            kind,
            guid: None,
            fourcc,
            bits_per_pixel: 16,
            default_frame_index: 1,
            frames,
            still_frames: Vec::new(),
        }
    }

    fn test_interface() -> VideoStreaming {
        VideoStreaming {
            interface_number: 1,
            endpoint_address: Some(0x81),
            formats: vec![
                test_format(
                    1,
                    FormatKind::Mjpeg,
                    FourCc::MJPG,
                    vec![test_frame(1, 1920, 1080), test_frame(2, 1280, 720)],
                ),
                test_format(
                    2,
                    FormatKind::Uncompressed,
                    FourCc::YUY2,
                    vec![test_frame(1, 1280, 720)],
                ),
                test_format(3, FormatKind::FrameBased, FourCc::H264, vec![test_frame(1, 1920, 1080)]),
            ],
            alt_settings: vec![AltSetting {
                alternate_setting: 1,
                endpoint: Some(IsoEndpoint {
                    address: 0x81,
                    packet_capacity: 3072,
                }),
            }],
        }
    }

    #[test]
    fn auto_prefers_uncompressed_over_mjpeg() {
        let vs = test_interface();
        let (fmt, _) = select_format(&vs, 1280, 720, Codec::Auto).unwrap();
        assert_eq!(fmt.kind, FormatKind::Uncompressed);
    }

    #[test]
    fn auto_falls_back_to_mjpeg_for_unmatched_resolutions() {
        let vs = test_interface();
        let (fmt, frame) = select_format(&vs, 1920, 1080, Codec::Auto).unwrap();
        assert_eq!(fmt.kind, FormatKind::Mjpeg);
        assert_eq!(frame.frame_index, 1);
    }

    #[test]
    fn explicit_codec_is_not_substituted() {
        let vs = test_interface();
        assert!(select_format(&vs, 1920, 1080, Codec::Yuyv).is_none());
        let (fmt, _) = select_format(&vs, 1920, 1080, Codec::H264).unwrap();
        assert_eq!(fmt.fourcc, FourCc::H264);
        assert!(select_format(&vs, 1920, 1080, Codec::H265).is_none());
    }

    #[test]
    fn zero_resolution_selects_default_frame() {
        let vs = test_interface();
        let (fmt, frame) = select_format(&vs, 0, 0, Codec::Mjpeg).unwrap();
        assert_eq!(fmt.format_index, 1);
        assert_eq!(frame.frame_index, 1);
    }

    #[test]
    fn config_defaults_match_scheduler_sizing() {
        let cfg = StreamConfig::default();
        assert_eq!(cfg.num_transfers, 12);
        assert_eq!(cfg.packets_per_transfer, 32);
        assert_eq!(cfg.frame_queue_size, 4);
        assert!(cfg.drop_on_overflow);
        assert!(!cfg.deliver_partial);
    }
}
