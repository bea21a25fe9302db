//! The PROBE/COMMIT handshake.
//!
//! The host proposes a format/frame/interval in a streaming-control payload,
//! the device writes back its constraints (most importantly
//! `dwMaxPayloadTransferSize`), and the agreed payload is committed. The
//! payload is 26, 34, or 48 bytes depending on the UVC version the device
//! reports; firmware that lies about its version gets the other sizes
//! retried before the handshake fails.

use log::{debug, warn};

use crate::controls::Query;
use crate::descriptors::{FrameInfo, StreamFormat, VideoStreaming};
use crate::device::UvcDevice;
use crate::error::{ControlError, ControlErrorKind, Error, NegotiationError};

/// VideoStreaming interface control selectors.
const VS_PROBE_CONTROL: u8 = 0x01;
const VS_COMMIT_CONTROL: u8 = 0x02;

/// SET_CUR/GET_CUR rounds allowed before the handshake is abandoned.
const PROBE_ROUNDS: usize = 3;

/// The streaming-control payload exchanged during PROBE/COMMIT.
///
/// Fields beyond the 26-byte UVC 1.0 core decode as zero when the device
/// uses a shorter payload.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamingControl {
    pub hint: u16,
    pub format_index: u8,
    pub frame_index: u8,
    /// Frame interval in 100 ns units.
    pub frame_interval: u32,
    pub key_frame_rate: u16,
    pub p_frame_rate: u16,
    pub comp_quality: u16,
    pub comp_window_size: u16,
    pub delay: u16,
    pub max_video_frame_size: u32,
    pub max_payload_transfer_size: u32,
    // UVC 1.1 additions.
    pub clock_frequency: u32,
    pub framing_info: u8,
    pub preferred_version: u8,
    pub min_version: u8,
    pub max_version: u8,
    // UVC 1.5 additions.
    pub usage: u8,
    pub bit_depth_luma: u8,
    pub settings: u8,
    pub max_number_of_ref_frames: u8,
    pub rate_control_modes: u16,
    pub layout_per_stream: [u16; 4],
}

impl StreamingControl {
    /// Payload size mandated by the device's `bcdUVC`.
    pub fn size_for_version(bcd_uvc: u16) -> usize {
        if bcd_uvc < 0x0110 {
            26
        } else if bcd_uvc < 0x0150 {
            34
        } else {
            48
        }
    }

    pub fn encode(&self, size: usize) -> Vec<u8> {
        let mut buf = vec![0u8; size];
        let mut w = |off: usize, bytes: &[u8]| {
            if off + bytes.len() <= buf.len() {
                buf[off..off + bytes.len()].copy_from_slice(bytes);
            }
        };
        w(0, &self.hint.to_le_bytes());
        w(2, &[self.format_index]);
        w(3, &[self.frame_index]);
        w(4, &self.frame_interval.to_le_bytes());
        w(8, &self.key_frame_rate.to_le_bytes());
        w(10, &self.p_frame_rate.to_le_bytes());
        w(12, &self.comp_quality.to_le_bytes());
        w(14, &self.comp_window_size.to_le_bytes());
        w(16, &self.delay.to_le_bytes());
        w(18, &self.max_video_frame_size.to_le_bytes());
        w(22, &self.max_payload_transfer_size.to_le_bytes());
        w(26, &self.clock_frequency.to_le_bytes());
        w(30, &[self.framing_info]);
        w(31, &[self.preferred_version]);
        w(32, &[self.min_version]);
        w(33, &[self.max_version]);
        w(34, &[self.usage]);
        w(35, &[self.bit_depth_luma]);
        w(36, &[self.settings]);
        w(37, &[self.max_number_of_ref_frames]);
        w(38, &self.rate_control_modes.to_le_bytes());
        for (i, layout) in self.layout_per_stream.iter().enumerate() {
            w(40 + 2 * i, &layout.to_le_bytes());
        }
        buf
    }

    pub fn decode(data: &[u8]) -> StreamingControl {
        let u8_at = |off: usize| data.get(off).copied().unwrap_or(0);
        let u16_at = |off: usize| {
            data.get(off..off + 2)
                .map(|b| u16::from_le_bytes(b.try_into().unwrap()))
                .unwrap_or(0)
        };
        let u32_at = |off: usize| {
            data.get(off..off + 4)
                .map(|b| u32::from_le_bytes(b.try_into().unwrap()))
                .unwrap_or(0)
        };
        StreamingControl {
            hint: u16_at(0),
            format_index: u8_at(2),
            frame_index: u8_at(3),
            frame_interval: u32_at(4),
            key_frame_rate: u16_at(8),
            p_frame_rate: u16_at(10),
            comp_quality: u16_at(12),
            comp_window_size: u16_at(14),
            delay: u16_at(16),
            max_video_frame_size: u32_at(18),
            max_payload_transfer_size: u32_at(22),
            clock_frequency: u32_at(26),
            framing_info: u8_at(30),
            preferred_version: u8_at(31),
            min_version: u8_at(32),
            max_version: u8_at(33),
            usage: u8_at(34),
            bit_depth_luma: u8_at(35),
            settings: u8_at(36),
            max_number_of_ref_frames: u8_at(37),
            rate_control_modes: u16_at(38),
            layout_per_stream: [u16_at(40), u16_at(42), u16_at(44), u16_at(46)],
        }
    }
}

/// Sizes to attempt, most credible first: the device's announced `GET_LEN`,
/// then the `bcdUVC`-derived size, then the remaining standard sizes.
fn candidate_sizes(bcd_uvc: u16, announced: Option<usize>) -> Vec<usize> {
    let mut sizes = Vec::with_capacity(4);
    let mut push = |size: usize| {
        if !sizes.contains(&size) {
            sizes.push(size);
        }
    };
    if let Some(len) = announced.filter(|len| matches!(len, 26 | 34 | 48)) {
        push(len);
    }
    push(StreamingControl::size_for_version(bcd_uvc));
    push(48);
    push(34);
    push(26);
    sizes
}

fn is_stall(e: &ControlError) -> bool {
    matches!(
        e.kind,
        ControlErrorKind::Stall | ControlErrorKind::InvalidLength
    )
}

/// Run PROBE/COMMIT on `vs` for the chosen format/frame and return the
/// committed streaming control.
pub(crate) fn probe_commit(
    dev: &UvcDevice,
    vs: &VideoStreaming,
    format: &StreamFormat,
    frame: &FrameInfo,
    fps: Option<f64>,
) -> Result<StreamingControl, Error> {
    let interface = vs.interface_number;
    let interval = frame.pick_interval(fps);

    let announced = dev
        .class_get(interface, 0, VS_PROBE_CONTROL, Query::Len, 2)
        .ok()
        .and_then(|d| d.get(..2).map(|b| u16::from_le_bytes(b.try_into().unwrap())))
        .map(usize::from);
    if let Some(len) = announced {
        debug!("device announces a {len}-byte streaming control");
    }

    let bcd_uvc = dev.model().video_control.uvc_version;
    let mut last_stall: Option<ControlError> = None;
    for size in candidate_sizes(bcd_uvc, announced) {
        debug!(
            "PROBE fmt={} frame={} interval={} size={size}",
            format.format_index, frame.frame_index, interval
        );
        match probe_commit_with_size(dev, interface, format, frame, interval, size) {
            Ok(ctrl) => return Ok(ctrl),
            Err(ProbeFailure::SizeRejected(e)) => {
                warn!("device rejected a {size}-byte PROBE, trying the next size");
                last_stall = Some(e);
            }
            Err(ProbeFailure::Control(e)) => return Err(e.into()),
            Err(ProbeFailure::Negotiation(e)) => return Err(e.into()),
        }
    }
    match last_stall {
        Some(e) => Err(e.into()),
        None => Err(NegotiationError::ProbeUnstable.into()),
    }
}

enum ProbeFailure {
    /// First SET_CUR stalled; the size is likely wrong.
    SizeRejected(ControlError),
    Control(ControlError),
    Negotiation(NegotiationError),
}

fn probe_commit_with_size(
    dev: &UvcDevice,
    interface: u8,
    format: &StreamFormat,
    frame: &FrameInfo,
    interval: u32,
    size: usize,
) -> Result<StreamingControl, ProbeFailure> {
    // Seed the payload from the device's current or default settings so
    // fields this host does not manage keep their device values.
    let template = dev
        .class_get(interface, 0, VS_PROBE_CONTROL, Query::Cur, size as u16)
        .or_else(|_| dev.class_get(interface, 0, VS_PROBE_CONTROL, Query::Def, size as u16))
        .unwrap_or_default();

    let mut ctrl = StreamingControl::decode(&template);
    ctrl.hint = 0x0001; // dwFrameInterval is fixed by the host
    ctrl.format_index = format.format_index;
    ctrl.frame_index = frame.frame_index;
    ctrl.frame_interval = interval;

    let mut payload = ctrl.encode(size);
    let mut previous: Option<Vec<u8>> = None;
    let mut stable = false;

    for round in 0..PROBE_ROUNDS {
        if let Err(e) = dev.class_set(interface, 0, VS_PROBE_CONTROL, &payload) {
            if round == 0 && is_stall(&e) {
                return Err(ProbeFailure::SizeRejected(e));
            }
            return Err(ProbeFailure::Control(e));
        }

        // Devices that stall GET_CUR still stream with the host payload.
        let negotiated = match dev.class_get(interface, 0, VS_PROBE_CONTROL, Query::Cur, size as u16)
        {
            Ok(data) if !data.is_empty() => data,
            Ok(_) | Err(_) => {
                debug!("PROBE GET_CUR unavailable, keeping the host payload");
                payload.clone()
            }
        };

        if previous.as_deref() == Some(&negotiated[..]) {
            payload = negotiated;
            stable = true;
            break;
        }
        previous = Some(negotiated.clone());
        payload = negotiated;
    }

    if !stable {
        return Err(ProbeFailure::Negotiation(NegotiationError::ProbeUnstable));
    }

    debug!("COMMIT payload: {}", hex_dump(&payload));
    if let Err(e) = dev.class_set(interface, 0, VS_COMMIT_CONTROL, &payload) {
        if is_stall(&e) {
            return Err(ProbeFailure::Negotiation(NegotiationError::CommitStalled));
        }
        return Err(ProbeFailure::Control(e));
    }

    let ctrl = StreamingControl::decode(&payload);
    debug!(
        "committed fmt={} frame={} interval={} maxFrame={} maxPayload={}",
        ctrl.format_index,
        ctrl.frame_index,
        ctrl.frame_interval,
        ctrl.max_video_frame_size,
        ctrl.max_payload_transfer_size
    );
    Ok(ctrl)
}

fn hex_dump(data: &[u8]) -> String {
    let mut out = String::with_capacity(data.len() * 2);
    for b in data.iter().take(64) {
        out.push_str(&format!("{b:02x}"));
    }
    if data.len() > 64 {
        out.push_str("...");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn size_follows_uvc_version() {
        assert_eq!(StreamingControl::size_for_version(0x0100), 26);
        assert_eq!(StreamingControl::size_for_version(0x0110), 34);
        assert_eq!(StreamingControl::size_for_version(0x0150), 48);
        assert_eq!(StreamingControl::size_for_version(0x0160), 48);
    }

    #[test]
    fn encode_layout_matches_wire_offsets() {
        let ctrl = StreamingControl {
            hint: 0x0001,
            format_index: 2,
            frame_index: 1,
            frame_interval: 333_333,
            max_payload_transfer_size: 3060,
            ..Default::default()
        };
        let buf = ctrl.encode(26);
        assert_eq!(buf.len(), 26);
        assert_eq!(&buf[0..2], &[0x01, 0x00]);
        assert_eq!(buf[2], 2);
        assert_eq!(buf[3], 1);
        assert_eq!(&buf[4..8], &333_333u32.to_le_bytes());
        assert_eq!(&buf[22..26], &3060u32.to_le_bytes());
    }

    #[test]
    fn decode_reads_device_updated_fields() {
        let mut buf = vec![0u8; 34];
        buf[0] = 0x01;
        buf[2] = 2;
        buf[3] = 1;
        buf[4..8].copy_from_slice(&333_333u32.to_le_bytes());
        buf[18..22].copy_from_slice(&4_147_200u32.to_le_bytes());
        buf[22..26].copy_from_slice(&3060u32.to_le_bytes());
        buf[26..30].copy_from_slice(&48_000_000u32.to_le_bytes());
        let ctrl = StreamingControl::decode(&buf);
        assert_eq!(ctrl.hint, 1);
        assert_eq!(ctrl.format_index, 2);
        assert_eq!(ctrl.frame_index, 1);
        assert_eq!(ctrl.frame_interval, 333_333);
        assert_eq!(ctrl.max_video_frame_size, 4_147_200);
        assert_eq!(ctrl.max_payload_transfer_size, 3060);
        assert_eq!(ctrl.clock_frequency, 48_000_000);
    }

    #[test]
    fn round_trip_all_sizes() {
        let ctrl = StreamingControl {
            hint: 1,
            format_index: 3,
            frame_index: 2,
            frame_interval: 166_666,
            delay: 32,
            max_video_frame_size: 1_000_000,
            max_payload_transfer_size: 3072,
            clock_frequency: 27_000_000,
            framing_info: 0x03,
            usage: 1,
            rate_control_modes: 0x0002,
            ..Default::default()
        };
        for size in [26usize, 34, 48] {
            let decoded = StreamingControl::decode(&ctrl.encode(size));
            assert_eq!(decoded.format_index, 3);
            assert_eq!(decoded.frame_interval, 166_666);
            if size >= 34 {
                assert_eq!(decoded.clock_frequency, 27_000_000);
                assert_eq!(decoded.framing_info, 0x03);
            } else {
                assert_eq!(decoded.clock_frequency, 0);
            }
            if size >= 48 {
                assert_eq!(decoded.usage, 1);
                assert_eq!(decoded.rate_control_modes, 0x0002);
            }
        }
    }

    #[test]
    fn candidate_sizes_prefer_announced_then_version() {
        assert_eq!(candidate_sizes(0x0110, None), vec![34, 48, 26]);
        assert_eq!(candidate_sizes(0x0100, None), vec![26, 48, 34]);
        assert_eq!(candidate_sizes(0x0150, Some(26)), vec![26, 48, 34]);
        // Nonsense GET_LEN answers are ignored.
        assert_eq!(candidate_sizes(0x0110, Some(12)), vec![34, 48, 26]);
    }
}
