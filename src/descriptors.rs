//! Parsing of UVC class-specific descriptors into a typed model.
//!
//! The entry point is [`parse_configuration`], which walks a raw USB
//! configuration descriptor (as returned by `GET_DESCRIPTOR(CONFIGURATION)`)
//! and builds the Video Control and Video Streaming interface model used by
//! the rest of the crate. The walk is a linear scan over
//! `bLength`/`bDescriptorType` records; class-specific interface descriptors
//! (`0x24`) carry a `bDescriptorSubtype` that selects the parse schema.

use std::fmt::{self, Debug, Display};

use log::{debug, warn};

use crate::error::DescriptorError;
use crate::frame::FourCc;

pub(crate) const DESCRIPTOR_TYPE_CONFIGURATION: u8 = 0x02;
pub(crate) const DESCRIPTOR_TYPE_INTERFACE: u8 = 0x04;
pub(crate) const DESCRIPTOR_TYPE_ENDPOINT: u8 = 0x05;
pub(crate) const DESCRIPTOR_TYPE_CS_INTERFACE: u8 = 0x24;

pub(crate) const DESCRIPTOR_LEN_CONFIGURATION: usize = 9;
pub(crate) const DESCRIPTOR_LEN_INTERFACE: usize = 9;
pub(crate) const DESCRIPTOR_LEN_ENDPOINT: usize = 7;

/// USB video interface class and subclasses.
pub(crate) const CLASS_VIDEO: u8 = 0x0e;
pub(crate) const SUBCLASS_VIDEO_CONTROL: u8 = 0x01;
pub(crate) const SUBCLASS_VIDEO_STREAMING: u8 = 0x02;

// Video Control interface descriptor subtypes.
const VC_HEADER: u8 = 0x01;
const VC_INPUT_TERMINAL: u8 = 0x02;
const VC_OUTPUT_TERMINAL: u8 = 0x03;
const VC_SELECTOR_UNIT: u8 = 0x04;
const VC_PROCESSING_UNIT: u8 = 0x05;
const VC_EXTENSION_UNIT: u8 = 0x06;

// Video Streaming interface descriptor subtypes.
const VS_INPUT_HEADER: u8 = 0x01;
const VS_STILL_IMAGE_FRAME: u8 = 0x03;
const VS_FORMAT_UNCOMPRESSED: u8 = 0x04;
const VS_FRAME_UNCOMPRESSED: u8 = 0x05;
const VS_FORMAT_MJPEG: u8 = 0x06;
const VS_FRAME_MJPEG: u8 = 0x07;
const VS_COLORFORMAT: u8 = 0x0d;
const VS_FORMAT_FRAME_BASED: u8 = 0x10;
const VS_FRAME_FRAME_BASED: u8 = 0x11;

/// Camera terminal type (`ITT_CAMERA`).
const TERMINAL_TYPE_CAMERA: u16 = 0x0201;

/// A 16-byte format or extension-unit GUID, stored in wire (little-endian
/// mixed) byte order.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Guid(pub [u8; 16]);

impl Guid {
    /// Parse the canonical hyphenated form, e.g.
    /// `"ca9b465c-82f9-4c3c-b1a5-6c7f8d2e3a10"`.
    pub fn parse(s: &str) -> Option<Guid> {
        let hex: Vec<u8> = s
            .chars()
            .filter(|c| *c != '-')
            .map(|c| c.to_digit(16).map(|d| d as u8))
            .collect::<Option<_>>()?;
        if hex.len() != 32 || s.chars().filter(|c| *c == '-').count() != 4 {
            return None;
        }
        let mut canonical = [0u8; 16];
        for (i, pair) in hex.chunks_exact(2).enumerate() {
            canonical[i] = pair[0] << 4 | pair[1];
        }
        // The canonical text form stores the first three groups big-endian;
        // the wire form stores them little-endian.
        let mut wire = canonical;
        wire[0..4].reverse();
        wire[4..6].reverse();
        wire[6..8].reverse();
        Some(Guid(wire))
    }
}

impl Display for Guid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = &self.0;
        write!(
            f,
            "{:02x}{:02x}{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}{:02x}{:02x}{:02x}{:02x}",
            b[3], b[2], b[1], b[0], b[5], b[4], b[7], b[6], b[8], b[9], b[10], b[11], b[12], b[13],
            b[14], b[15]
        )
    }
}

impl Debug for Guid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Guid({self})")
    }
}

/// Set of advertised controls, as a bitmap whose bit positions map to
/// UVC-defined selector codes.
#[derive(Clone, Copy, Default, PartialEq, Eq)]
pub struct ControlBitmap(pub u64);

impl ControlBitmap {
    fn from_le_bytes(bytes: &[u8]) -> ControlBitmap {
        let mut v = 0u64;
        for (i, b) in bytes.iter().take(8).enumerate() {
            v |= (*b as u64) << (8 * i);
        }
        ControlBitmap(v)
    }

    pub fn has_bit(&self, bit: u32) -> bool {
        bit < 64 && self.0 >> bit & 1 != 0
    }

    /// Iterate the set bit positions, lowest first.
    pub fn bits(&self) -> impl Iterator<Item = u32> + '_ {
        (0..64).filter(|bit| self.has_bit(*bit))
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }
}

impl Debug for ControlBitmap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ControlBitmap({:#x})", self.0)
    }
}

/// One entity in the Video Control topology.
#[derive(Debug, Clone)]
pub struct Unit {
    /// Unit/terminal ID, unique within the interface.
    pub id: u8,
    /// Byte offset of the descriptor within the configuration blob.
    pub offset: usize,
    pub kind: UnitKind,
}

/// Discriminated unit payload, keyed by the descriptor subtype.
#[derive(Debug, Clone)]
pub enum UnitKind {
    /// An input terminal; camera terminals carry the CT control bitmap.
    InputTerminal {
        terminal_type: u16,
        controls: ControlBitmap,
    },
    OutputTerminal {
        terminal_type: u16,
        source_id: u8,
    },
    SelectorUnit {
        input_pins: Vec<u8>,
    },
    ProcessingUnit {
        source_id: u8,
        controls: ControlBitmap,
    },
    ExtensionUnit {
        guid: Guid,
        num_controls: u8,
        input_pins: Vec<u8>,
        controls: ControlBitmap,
    },
}

impl Unit {
    /// Whether this unit is a camera input terminal.
    pub fn is_camera_terminal(&self) -> bool {
        matches!(
            self.kind,
            UnitKind::InputTerminal { terminal_type, .. } if terminal_type == TERMINAL_TYPE_CAMERA
        )
    }
}

/// The Video Control interface: the device's unit topology plus the header
/// fields that drive protocol details elsewhere.
#[derive(Debug, Clone)]
pub struct VideoControl {
    pub interface_number: u8,
    /// `bcdUVC` from the VC header; selects the streaming-control size.
    pub uvc_version: u16,
    /// Device clock frequency in Hz, from the VC header.
    pub clock_frequency: u32,
    pub units: Vec<Unit>,
    /// Address of the status interrupt IN endpoint, if one is advertised.
    pub interrupt_endpoint: Option<u8>,
}

impl VideoControl {
    pub fn unit_by_id(&self, id: u8) -> Option<&Unit> {
        self.units.iter().find(|u| u.id == id)
    }

    pub fn extension_units(&self) -> impl Iterator<Item = (&Unit, &Guid)> {
        self.units.iter().filter_map(|u| match &u.kind {
            UnitKind::ExtensionUnit { guid, .. } => Some((u, guid)),
            _ => None,
        })
    }
}

/// Codec family of a streaming format descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FormatKind {
    Uncompressed,
    Mjpeg,
    /// Frame-based compressed payloads (H.264, H.265, ...).
    FrameBased,
}

/// One Video Streaming format and its advertised frames.
#[derive(Debug, Clone)]
pub struct StreamFormat {
    /// 1-based format index, as used in the PROBE/COMMIT payload.
    pub format_index: u8,
    pub kind: FormatKind,
    /// Format GUID for uncompressed and frame-based formats.
    pub guid: Option<Guid>,
    pub fourcc: FourCc,
    pub bits_per_pixel: u8,
    pub default_frame_index: u8,
    pub frames: Vec<FrameInfo>,
    pub still_frames: Vec<StillFrame>,
}

impl StreamFormat {
    pub fn frame_by_index(&self, index: u8) -> Option<&FrameInfo> {
        self.frames.iter().find(|f| f.frame_index == index)
    }
}

/// Supported frame intervals of one frame descriptor, in 100 ns units.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameIntervals {
    Discrete(Vec<u32>),
    Continuous { min: u32, max: u32, step: u32 },
}

/// One supported (width, height) pair of a format.
#[derive(Debug, Clone)]
pub struct FrameInfo {
    /// 1-based frame index, as used in the PROBE/COMMIT payload.
    pub frame_index: u8,
    pub width: u16,
    pub height: u16,
    pub min_bit_rate: u32,
    pub max_bit_rate: u32,
    /// `dwMaxVideoFrameBufferSize`; 0 for frame-based formats, which report
    /// the frame size only through PROBE.
    pub max_frame_size: u32,
    /// Default frame interval in 100 ns units.
    pub default_interval: u32,
    pub intervals: FrameIntervals,
    /// `bmCapabilities` bit 0: still images supported via method 2/3.
    pub still_supported: bool,
}

impl FrameInfo {
    /// Frame rate in Hz for a given interval.
    pub fn interval_to_hz(interval_100ns: u32) -> f64 {
        if interval_100ns == 0 {
            0.0
        } else {
            1e7 / interval_100ns as f64
        }
    }

    /// Choose the advertised interval closest to the requested frame rate.
    ///
    /// Preference order: the largest interval not exceeding the requested one
    /// (the nearest rate at or above the request), otherwise the smallest
    /// advertised interval. With no requested rate the default interval wins.
    pub fn pick_interval(&self, fps: Option<f64>) -> u32 {
        let target = match fps {
            Some(fps) if fps > 0.0 => (1e7 / fps).round() as u32,
            _ => return self.default_interval,
        };
        match &self.intervals {
            FrameIntervals::Discrete(list) => {
                if list.is_empty() {
                    return self.default_interval;
                }
                list.iter()
                    .copied()
                    .filter(|iv| *iv <= target)
                    .max()
                    .unwrap_or_else(|| list.iter().copied().min().unwrap())
            }
            FrameIntervals::Continuous { min, max, step } => {
                let clamped = target.clamp(*min, *max);
                if *step == 0 {
                    clamped
                } else {
                    min + (clamped - min) / step * step
                }
            }
        }
    }
}

/// A still-image size pattern from a method-2 still frame descriptor.
#[derive(Debug, Clone)]
pub struct StillFrame {
    pub width: u16,
    pub height: u16,
    pub compression_indices: Vec<u8>,
}

/// One alternate setting of a streaming interface.
#[derive(Debug, Clone)]
pub struct AltSetting {
    pub alternate_setting: u8,
    pub endpoint: Option<IsoEndpoint>,
}

/// An isochronous IN endpoint of a streaming alternate setting.
#[derive(Debug, Clone, Copy)]
pub struct IsoEndpoint {
    pub address: u8,
    /// Payload bytes the endpoint can move per (micro)frame: the base
    /// `wMaxPacketSize` multiplied by the additional-transaction count.
    pub packet_capacity: u32,
}

/// One Video Streaming interface: its formats and alternate settings.
#[derive(Debug, Clone)]
pub struct VideoStreaming {
    pub interface_number: u8,
    /// `bEndpointAddress` from the VS input header.
    pub endpoint_address: Option<u8>,
    pub formats: Vec<StreamFormat>,
    pub alt_settings: Vec<AltSetting>,
}

impl VideoStreaming {
    pub fn format_by_index(&self, index: u8) -> Option<&StreamFormat> {
        self.formats.iter().find(|f| f.format_index == index)
    }

    /// Find a format/frame pair matching a resolution, optionally restricted
    /// to one codec family.
    pub fn find_frame(
        &self,
        width: u16,
        height: u16,
        kind: Option<FormatKind>,
    ) -> Option<(&StreamFormat, &FrameInfo)> {
        self.formats
            .iter()
            .filter(|fmt| kind.map_or(true, |k| fmt.kind == k))
            .find_map(|fmt| {
                fmt.frames
                    .iter()
                    .find(|fr| fr.width == width && fr.height == height)
                    .map(|fr| (fmt, fr))
            })
    }

    /// Select the smallest alternate setting whose isochronous endpoint can
    /// carry `required_payload` bytes per (micro)frame.
    pub fn select_alt_for_payload(&self, required_payload: u32) -> Option<&AltSetting> {
        self.alt_settings
            .iter()
            .filter(|alt| {
                alt.endpoint
                    .map_or(false, |ep| ep.packet_capacity >= required_payload)
            })
            .min_by_key(|alt| alt.endpoint.map(|ep| ep.packet_capacity).unwrap_or(0))
    }

    fn alt_mut(&mut self, alternate_setting: u8) -> &mut AltSetting {
        if let Some(i) = self
            .alt_settings
            .iter()
            .position(|a| a.alternate_setting == alternate_setting)
        {
            return &mut self.alt_settings[i];
        }
        self.alt_settings.push(AltSetting {
            alternate_setting,
            endpoint: None,
        });
        self.alt_settings.last_mut().unwrap()
    }
}

/// The parsed UVC descriptor tree of one device configuration.
#[derive(Debug, Clone)]
pub struct UvcModel {
    pub video_control: VideoControl,
    pub streaming: Vec<VideoStreaming>,
}

impl UvcModel {
    pub fn streaming_interface(&self, interface_number: u8) -> Option<&VideoStreaming> {
        self.streaming
            .iter()
            .find(|vs| vs.interface_number == interface_number)
    }
}

fn le16(d: &[u8], off: usize) -> Option<u16> {
    d.get(off..off + 2)
        .map(|b| u16::from_le_bytes(b.try_into().unwrap()))
}

fn le32(d: &[u8], off: usize) -> Option<u32> {
    d.get(off..off + 4)
        .map(|b| u32::from_le_bytes(b.try_into().unwrap()))
}

/// Effective per-(micro)frame capacity of an isochronous endpoint: the base
/// packet size times the 11-bit additional-transaction multiplier.
fn iso_packet_capacity(w_max_packet_size: u16) -> u32 {
    let base = (w_max_packet_size & 0x7ff) as u32;
    let transactions = ((w_max_packet_size >> 11) & 0x3) as u32 + 1;
    base * transactions
}

struct Walker<'a> {
    buf: &'a [u8],
    offset: usize,
}

impl<'a> Walker<'a> {
    /// Yield the next descriptor as `(offset, bytes)`, enforcing that every
    /// record advances and fits the buffer.
    fn next(&mut self) -> Result<Option<(usize, &'a [u8])>, DescriptorError> {
        if self.offset == self.buf.len() {
            return Ok(None);
        }
        let offset = self.offset;
        let remaining = &self.buf[offset..];
        if remaining.len() < 2 {
            return Err(DescriptorError {
                offset,
                reason: "descriptor shorter than two bytes",
            });
        }
        let len = remaining[0] as usize;
        if len < 2 {
            return Err(DescriptorError {
                offset,
                reason: "bLength cannot reach the next descriptor",
            });
        }
        if len > remaining.len() {
            return Err(DescriptorError {
                offset,
                reason: "bLength exceeds the remaining buffer",
            });
        }
        self.offset += len;
        Ok(Some((offset, &remaining[..len])))
    }
}

/// Which interface the walk is currently inside.
enum Section {
    None,
    VideoControl,
    VideoStreaming { interface: u8, alt: u8 },
    Other,
}

/// Parse a full configuration descriptor into the typed UVC model.
///
/// Unknown but well-formed descriptors are skipped; truncation and impossible
/// `bLength` values fail with a [`DescriptorError`] carrying the offending
/// offset.
pub fn parse_configuration(buf: &[u8]) -> Result<UvcModel, DescriptorError> {
    if buf.len() < DESCRIPTOR_LEN_CONFIGURATION || buf[1] != DESCRIPTOR_TYPE_CONFIGURATION {
        return Err(DescriptorError {
            offset: 0,
            reason: "not a configuration descriptor",
        });
    }
    let total_len = le16(buf, 2).unwrap() as usize;
    if total_len < DESCRIPTOR_LEN_CONFIGURATION || total_len > buf.len() {
        return Err(DescriptorError {
            offset: 2,
            reason: "wTotalLength inconsistent with the buffer",
        });
    }

    let mut walker = Walker {
        buf: &buf[..total_len],
        offset: 0,
    };

    let mut video_control: Option<VideoControl> = None;
    let mut streaming: Vec<VideoStreaming> = Vec::new();
    let mut section = Section::None;

    while let Some((offset, d)) = walker.next()? {
        let dtype = d[1];
        match dtype {
            DESCRIPTOR_TYPE_INTERFACE => {
                if d.len() < DESCRIPTOR_LEN_INTERFACE {
                    warn!("interface descriptor at {offset} too short, skipping");
                    section = Section::Other;
                    continue;
                }
                let number = d[2];
                let alt = d[3];
                let class = d[5];
                let subclass = d[6];
                section = match (class, subclass) {
                    (CLASS_VIDEO, SUBCLASS_VIDEO_CONTROL) => {
                        if alt == 0 && video_control.is_none() {
                            video_control = Some(VideoControl {
                                interface_number: number,
                                uvc_version: 0x0100,
                                clock_frequency: 0,
                                units: Vec::new(),
                                interrupt_endpoint: None,
                            });
                        }
                        Section::VideoControl
                    }
                    (CLASS_VIDEO, SUBCLASS_VIDEO_STREAMING) => {
                        if !streaming.iter().any(|vs| vs.interface_number == number) {
                            streaming.push(VideoStreaming {
                                interface_number: number,
                                endpoint_address: None,
                                formats: Vec::new(),
                                alt_settings: Vec::new(),
                            });
                        }
                        let vs = streaming
                            .iter_mut()
                            .find(|vs| vs.interface_number == number)
                            .unwrap();
                        vs.alt_mut(alt);
                        Section::VideoStreaming {
                            interface: number,
                            alt,
                        }
                    }
                    _ => Section::Other,
                };
            }
            DESCRIPTOR_TYPE_CS_INTERFACE => match section {
                Section::VideoControl => {
                    if let Some(vc) = video_control.as_mut() {
                        parse_vc_descriptor(vc, offset, d);
                    }
                }
                Section::VideoStreaming { interface, alt: 0 } => {
                    let vs = streaming
                        .iter_mut()
                        .find(|vs| vs.interface_number == interface)
                        .unwrap();
                    parse_vs_descriptor(vs, offset, d);
                }
                _ => {}
            },
            DESCRIPTOR_TYPE_ENDPOINT => {
                if d.len() < DESCRIPTOR_LEN_ENDPOINT {
                    warn!("endpoint descriptor at {offset} too short, skipping");
                    continue;
                }
                let address = d[2];
                let attributes = d[3];
                let max_packet = le16(d, 4).unwrap();
                match section {
                    Section::VideoControl => {
                        // Status interrupt endpoint.
                        if address & 0x80 != 0 && attributes & 0x03 == 0x03 {
                            if let Some(vc) = video_control.as_mut() {
                                vc.interrupt_endpoint = Some(address);
                            }
                        }
                    }
                    Section::VideoStreaming { interface, alt } => {
                        if address & 0x80 != 0 && attributes & 0x03 == 0x01 {
                            let vs = streaming
                                .iter_mut()
                                .find(|vs| vs.interface_number == interface)
                                .unwrap();
                            vs.alt_mut(alt).endpoint = Some(IsoEndpoint {
                                address,
                                packet_capacity: iso_packet_capacity(max_packet),
                            });
                        }
                    }
                    _ => {}
                }
            }
            other => {
                debug!("skipping descriptor type 0x{other:02x} at offset {offset}");
            }
        }
    }

    let mut video_control = video_control.ok_or(DescriptorError {
        offset: 0,
        reason: "no Video Control interface found",
    })?;

    // Dense secondary index: units are looked up by ID after parsing, so
    // duplicated IDs (seen on fw that clones units across revisions) keep the
    // first occurrence.
    video_control.units.sort_by_key(|u| u.id);
    video_control.units.dedup_by_key(|u| u.id);

    for vs in &mut streaming {
        vs.alt_settings.sort_by_key(|a| a.alternate_setting);
        for (i, fmt) in vs.formats.iter().enumerate() {
            if fmt.format_index as usize != i + 1 {
                warn!(
                    "interface {}: format at position {} reports bFormatIndex {}",
                    vs.interface_number,
                    i + 1,
                    fmt.format_index
                );
            }
        }
    }

    Ok(UvcModel {
        video_control,
        streaming,
    })
}

fn parse_vc_descriptor(vc: &mut VideoControl, offset: usize, d: &[u8]) {
    let subtype = if d.len() > 2 { d[2] } else { 0 };
    match subtype {
        VC_HEADER => {
            if let (Some(version), Some(clock)) = (le16(d, 3), le32(d, 7)) {
                vc.uvc_version = version;
                vc.clock_frequency = clock;
            }
        }
        VC_INPUT_TERMINAL => {
            if d.len() < 8 {
                warn!("input terminal at {offset} too short, skipping");
                return;
            }
            let terminal_type = le16(d, 4).unwrap();
            // Camera terminals carry bControlSize at 14 and bmControls after.
            let controls = if terminal_type == TERMINAL_TYPE_CAMERA && d.len() > 15 {
                let size = d[14] as usize;
                d.get(15..15 + size)
                    .map(ControlBitmap::from_le_bytes)
                    .unwrap_or_default()
            } else {
                ControlBitmap::default()
            };
            vc.units.push(Unit {
                id: d[3],
                offset,
                kind: UnitKind::InputTerminal {
                    terminal_type,
                    controls,
                },
            });
        }
        VC_OUTPUT_TERMINAL => {
            if d.len() < 9 {
                warn!("output terminal at {offset} too short, skipping");
                return;
            }
            vc.units.push(Unit {
                id: d[3],
                offset,
                kind: UnitKind::OutputTerminal {
                    terminal_type: le16(d, 4).unwrap(),
                    source_id: d[7],
                },
            });
        }
        VC_SELECTOR_UNIT => {
            if d.len() < 5 {
                warn!("selector unit at {offset} too short, skipping");
                return;
            }
            let pins = d[4] as usize;
            vc.units.push(Unit {
                id: d[3],
                offset,
                kind: UnitKind::SelectorUnit {
                    input_pins: d.get(5..5 + pins).map(|p| p.to_vec()).unwrap_or_default(),
                },
            });
        }
        VC_PROCESSING_UNIT => {
            if d.len() < 9 {
                warn!("processing unit at {offset} too short, skipping");
                return;
            }
            let size = d[7] as usize;
            let controls = d
                .get(8..8 + size)
                .map(ControlBitmap::from_le_bytes)
                .unwrap_or_default();
            vc.units.push(Unit {
                id: d[3],
                offset,
                kind: UnitKind::ProcessingUnit {
                    source_id: d[4],
                    controls,
                },
            });
        }
        VC_EXTENSION_UNIT => {
            if d.len() < 23 {
                warn!("extension unit at {offset} too short, skipping");
                return;
            }
            let guid = Guid(d[4..20].try_into().unwrap());
            let num_controls = d[20];
            let pins = d[21] as usize;
            let input_pins = d.get(22..22 + pins).map(|p| p.to_vec()).unwrap_or_default();
            let controls = d
                .get(22 + pins)
                .map(|size| {
                    let start = 23 + pins;
                    d.get(start..start + *size as usize)
                        .map(ControlBitmap::from_le_bytes)
                        .unwrap_or_default()
                })
                .unwrap_or_default();
            vc.units.push(Unit {
                id: d[3],
                offset,
                kind: UnitKind::ExtensionUnit {
                    guid,
                    num_controls,
                    input_pins,
                    controls,
                },
            });
        }
        other => {
            debug!("skipping VC descriptor subtype 0x{other:02x} at offset {offset}");
        }
    }
}

fn parse_vs_descriptor(vs: &mut VideoStreaming, offset: usize, d: &[u8]) {
    let subtype = if d.len() > 2 { d[2] } else { 0 };
    match subtype {
        VS_INPUT_HEADER => {
            if d.len() >= 7 {
                vs.endpoint_address = Some(d[6]);
            }
        }
        VS_FORMAT_UNCOMPRESSED | VS_FORMAT_FRAME_BASED => {
            if d.len() < 23 {
                warn!("format descriptor at {offset} too short, skipping");
                return;
            }
            let guid = Guid(d[5..21].try_into().unwrap());
            vs.formats.push(StreamFormat {
                format_index: d[3],
                kind: if subtype == VS_FORMAT_UNCOMPRESSED {
                    FormatKind::Uncompressed
                } else {
                    FormatKind::FrameBased
                },
                fourcc: FourCc::from_guid(&guid.0),
                guid: Some(guid),
                bits_per_pixel: d[21],
                default_frame_index: d[22],
                frames: Vec::new(),
                still_frames: Vec::new(),
            });
        }
        VS_FORMAT_MJPEG => {
            if d.len() < 7 {
                warn!("MJPEG format descriptor at {offset} too short, skipping");
                return;
            }
            vs.formats.push(StreamFormat {
                format_index: d[3],
                kind: FormatKind::Mjpeg,
                fourcc: FourCc::MJPG,
                guid: None,
                bits_per_pixel: 0,
                default_frame_index: d[6],
                frames: Vec::new(),
                still_frames: Vec::new(),
            });
        }
        VS_FRAME_UNCOMPRESSED | VS_FRAME_MJPEG | VS_FRAME_FRAME_BASED => {
            let Some(fmt) = vs.formats.last_mut() else {
                warn!("frame descriptor at {offset} with no preceding format, skipping");
                return;
            };
            let frame_based = subtype == VS_FRAME_FRAME_BASED;
            if let Some(frame) = parse_frame_descriptor(d, frame_based) {
                fmt.frames.push(frame);
            } else {
                warn!("frame descriptor at {offset} too short, skipping");
            }
        }
        VS_STILL_IMAGE_FRAME => {
            let Some(fmt) = vs.formats.last_mut() else {
                warn!("still frame descriptor at {offset} with no preceding format, skipping");
                return;
            };
            fmt.still_frames.extend(parse_still_frame_descriptor(d));
        }
        VS_COLORFORMAT => {}
        other => {
            debug!("skipping VS descriptor subtype 0x{other:02x} at offset {offset}");
        }
    }
}

/// Frame descriptor layouts share the first 17 bytes; uncompressed and MJPEG
/// frames then carry `dwMaxVideoFrameBufferSize`, while frame-based frames go
/// straight to the default interval and carry `dwBytesPerLine` instead.
fn parse_frame_descriptor(d: &[u8], frame_based: bool) -> Option<FrameInfo> {
    if d.len() < 26 {
        return None;
    }
    let (max_frame_size, default_interval, interval_type_off, intervals_off) = if frame_based {
        (0, le32(d, 17)?, 21, 26)
    } else {
        (le32(d, 17)?, le32(d, 21)?, 25, 26)
    };
    let interval_type = d[interval_type_off] as usize;

    let intervals = if interval_type == 0 {
        let min = le32(d, intervals_off)?;
        let max = le32(d, intervals_off + 4)?;
        let step = le32(d, intervals_off + 8)?;
        FrameIntervals::Continuous { min, max, step }
    } else {
        let mut list = Vec::with_capacity(interval_type);
        for i in 0..interval_type {
            match le32(d, intervals_off + 4 * i) {
                Some(v) if v != 0 => list.push(v),
                Some(_) => {}
                None => break,
            }
        }
        FrameIntervals::Discrete(list)
    };

    Some(FrameInfo {
        frame_index: d[3],
        width: le16(d, 5)?,
        height: le16(d, 7)?,
        min_bit_rate: le32(d, 9)?,
        max_bit_rate: le32(d, 13)?,
        max_frame_size,
        default_interval,
        intervals,
        still_supported: d[4] & 0x01 != 0,
    })
}

fn parse_still_frame_descriptor(d: &[u8]) -> Vec<StillFrame> {
    if d.len() < 5 {
        return Vec::new();
    }
    let num_sizes = d[4] as usize;
    let mut frames = Vec::new();
    let mut off = 5;
    for _ in 0..num_sizes {
        let (Some(width), Some(height)) = (le16(d, off), le16(d, off + 2)) else {
            break;
        };
        frames.push(StillFrame {
            width,
            height,
            compression_indices: Vec::new(),
        });
        off += 4;
    }
    if let Some(&num_compression) = d.get(off) {
        let indices: Vec<u8> = d
            .get(off + 1..off + 1 + num_compression as usize)
            .map(|c| c.to_vec())
            .unwrap_or_default();
        if !indices.is_empty() {
            for frame in &mut frames {
                frame.compression_indices = indices.clone();
            }
        }
    }
    frames
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Assemble a configuration descriptor from raw records, fixing up
    /// `wTotalLength`.
    fn config(descriptors: &[&[u8]]) -> Vec<u8> {
        let mut buf = vec![
            DESCRIPTOR_LEN_CONFIGURATION as u8,
            DESCRIPTOR_TYPE_CONFIGURATION,
            0,
            0,
            2,
            1,
            0,
            0x80,
            0xfa,
        ];
        for d in descriptors {
            buf.extend_from_slice(d);
        }
        let total = buf.len() as u16;
        buf[2..4].copy_from_slice(&total.to_le_bytes());
        buf
    }

    fn interface(number: u8, alt: u8, class: u8, subclass: u8, endpoints: u8) -> Vec<u8> {
        vec![9, 0x04, number, alt, endpoints, class, subclass, 0, 0]
    }

    fn iso_endpoint(address: u8, max_packet: u16) -> Vec<u8> {
        let mp = max_packet.to_le_bytes();
        vec![7, 0x05, address, 0x05, mp[0], mp[1], 1]
    }

    fn vc_header(version: u16, clock: u32) -> Vec<u8> {
        let v = version.to_le_bytes();
        let c = clock.to_le_bytes();
        vec![
            13, 0x24, 0x01, v[0], v[1], 13, 0, c[0], c[1], c[2], c[3], 1, 1,
        ]
    }

    fn camera_terminal(id: u8, controls: u32) -> Vec<u8> {
        let c = controls.to_le_bytes();
        vec![
            18, 0x24, 0x02, id, 0x01, 0x02, 0, 0, 0, 0, 0, 0, 0, 0, 3, c[0], c[1], c[2],
        ]
    }

    fn processing_unit(id: u8, source: u8, controls: u32) -> Vec<u8> {
        let c = controls.to_le_bytes();
        vec![11, 0x24, 0x05, id, source, 0, 0, 3, c[0], c[1], c[2]]
    }

    fn extension_unit(id: u8, guid: &[u8; 16], num_controls: u8, controls: u8) -> Vec<u8> {
        let mut d = vec![26, 0x24, 0x06, id];
        d.extend_from_slice(guid);
        // bNumControls, bNrInPins, baSourceID, bControlSize, bmControls, iExtension
        d.extend_from_slice(&[num_controls, 1, 2, 1, controls, 0]);
        d
    }

    fn output_terminal(id: u8, source: u8) -> Vec<u8> {
        vec![9, 0x24, 0x03, id, 0x01, 0x01, 0, source, 0]
    }

    fn vs_input_header(num_formats: u8, endpoint: u8) -> Vec<u8> {
        let mut d = vec![
            13 + num_formats,
            0x24,
            0x01,
            num_formats,
            0,
            0,
            endpoint,
            0,
            2,
            1,
            0,
            0,
            1,
        ];
        d.extend(std::iter::repeat(0).take(num_formats as usize));
        d
    }

    fn mjpeg_format(index: u8) -> Vec<u8> {
        vec![11, 0x24, 0x06, index, 1, 1, 1, 0, 0, 0, 0]
    }

    fn yuy2_format(index: u8) -> Vec<u8> {
        let mut d = vec![27, 0x24, 0x04, index, 1];
        d.extend_from_slice(b"YUY2");
        d.extend_from_slice(&[
            0x00, 0x00, 0x10, 0x00, 0x80, 0x00, 0x00, 0xaa, 0x00, 0x38, 0x9b, 0x71,
        ]);
        d.extend_from_slice(&[16, 1, 0, 0, 0, 0]);
        d
    }

    fn h264_format(index: u8) -> Vec<u8> {
        let mut d = vec![28, 0x24, 0x10, index, 1];
        d.extend_from_slice(b"H264");
        d.extend_from_slice(&[
            0x00, 0x00, 0x10, 0x00, 0x80, 0x00, 0x00, 0xaa, 0x00, 0x38, 0x9b, 0x71,
        ]);
        d.extend_from_slice(&[16, 1, 0, 0, 0, 0, 1]);
        d
    }

    fn frame_common(
        subtype: u8,
        index: u8,
        caps: u8,
        width: u16,
        height: u16,
    ) -> Vec<u8> {
        let w = width.to_le_bytes();
        let h = height.to_le_bytes();
        let mut d = vec![0, 0x24, subtype, index, caps, w[0], w[1], h[0], h[1]];
        d.extend_from_slice(&1_000_000u32.to_le_bytes());
        d.extend_from_slice(&10_000_000u32.to_le_bytes());
        d
    }

    fn mjpeg_frame(index: u8, width: u16, height: u16, intervals: &[u32]) -> Vec<u8> {
        let mut d = frame_common(0x07, index, 0x01, width, height);
        d.extend_from_slice(&(width as u32 * height as u32 * 2).to_le_bytes());
        d.extend_from_slice(&intervals[0].to_le_bytes());
        d.push(intervals.len() as u8);
        for iv in intervals {
            d.extend_from_slice(&iv.to_le_bytes());
        }
        d[0] = d.len() as u8;
        d
    }

    fn yuy2_frame_continuous(index: u8, width: u16, height: u16, min: u32, max: u32, step: u32) -> Vec<u8> {
        let mut d = frame_common(0x05, index, 0x00, width, height);
        d.extend_from_slice(&(width as u32 * height as u32 * 2).to_le_bytes());
        d.extend_from_slice(&min.to_le_bytes());
        d.push(0);
        d.extend_from_slice(&min.to_le_bytes());
        d.extend_from_slice(&max.to_le_bytes());
        d.extend_from_slice(&step.to_le_bytes());
        d[0] = d.len() as u8;
        d
    }

    fn h264_frame(index: u8, width: u16, height: u16, intervals: &[u32]) -> Vec<u8> {
        let mut d = frame_common(0x11, index, 0x00, width, height);
        d.extend_from_slice(&intervals[0].to_le_bytes());
        d.push(intervals.len() as u8);
        d.extend_from_slice(&0u32.to_le_bytes()); // dwBytesPerLine
        for iv in intervals {
            d.extend_from_slice(&iv.to_le_bytes());
        }
        d[0] = d.len() as u8;
        d
    }

    fn still_frame(endpoint: u8, sizes: &[(u16, u16)], compressions: &[u8]) -> Vec<u8> {
        let mut d = vec![0, 0x24, 0x03, endpoint, sizes.len() as u8];
        for (w, h) in sizes {
            d.extend_from_slice(&w.to_le_bytes());
            d.extend_from_slice(&h.to_le_bytes());
        }
        d.push(compressions.len() as u8);
        d.extend_from_slice(compressions);
        d[0] = d.len() as u8;
        d
    }

    const XU_GUID: [u8; 16] = [
        0x70, 0x33, 0xf0, 0x28, 0x11, 0x63, 0x2e, 0x4a, 0xba, 0x2c, 0x68, 0x90, 0xeb, 0x33, 0x40,
        0x16,
    ];

    fn webcam_config() -> Vec<u8> {
        config(&[
            &interface(0, 0, 0x0e, 0x01, 1),
            &vc_header(0x0110, 48_000_000),
            &camera_terminal(1, 0b0000_0000_0000_1110),
            &processing_unit(2, 1, 0b0111_0000_0011),
            &extension_unit(3, &XU_GUID, 2, 0b11),
            &output_terminal(4, 2),
            &[7, 0x05, 0x83, 0x03, 16, 0, 6],
            &interface(1, 0, 0x0e, 0x02, 0),
            &vs_input_header(3, 0x81),
            &yuy2_format(1),
            &yuy2_frame_continuous(1, 640, 480, 333_333, 2_000_000, 333_333),
            &mjpeg_format(2),
            &mjpeg_frame(1, 1920, 1080, &[333_333, 666_666]),
            &mjpeg_frame(2, 1280, 720, &[166_666, 333_333]),
            &still_frame(0x81, &[(1920, 1080)], &[1]),
            &h264_format(3),
            &h264_frame(1, 1920, 1080, &[333_333]),
            &interface(1, 1, 0x0e, 0x02, 1),
            &iso_endpoint(0x81, 512),
            &interface(1, 2, 0x0e, 0x02, 1),
            // 1024 bytes base + 2 extra transactions = 3072 per microframe
            &iso_endpoint(0x81, 0x1400),
            &interface(1, 3, 0x0e, 0x02, 1),
            // 1020 bytes base + 2 extra transactions = 3060 per microframe
            &iso_endpoint(0x81, 0x13fc),
        ])
    }

    #[test]
    fn parses_video_control_topology() {
        let model = parse_configuration(&webcam_config()).unwrap();
        let vc = &model.video_control;
        assert_eq!(vc.interface_number, 0);
        assert_eq!(vc.uvc_version, 0x0110);
        assert_eq!(vc.clock_frequency, 48_000_000);
        assert_eq!(vc.interrupt_endpoint, Some(0x83));
        assert_eq!(vc.units.len(), 4);

        let camera = vc.unit_by_id(1).unwrap();
        assert!(camera.is_camera_terminal());
        let UnitKind::InputTerminal { controls, .. } = &camera.kind else {
            panic!("unit 1 should be an input terminal");
        };
        assert_eq!(controls.bits().collect::<Vec<_>>(), vec![1, 2, 3]);

        let UnitKind::ProcessingUnit { source_id, controls } = &vc.unit_by_id(2).unwrap().kind
        else {
            panic!("unit 2 should be a processing unit");
        };
        assert_eq!(*source_id, 1);
        assert!(controls.has_bit(0));

        let UnitKind::ExtensionUnit {
            guid,
            num_controls,
            input_pins,
            controls,
        } = &vc.unit_by_id(3).unwrap().kind
        else {
            panic!("unit 3 should be an extension unit");
        };
        assert_eq!(guid.0, XU_GUID);
        assert_eq!(*num_controls, 2);
        assert_eq!(input_pins, &[2]);
        assert_eq!(controls.bits().collect::<Vec<_>>(), vec![0, 1]);
    }

    #[test]
    fn parses_streaming_formats_and_frames() {
        let model = parse_configuration(&webcam_config()).unwrap();
        assert_eq!(model.streaming.len(), 1);
        let vs = &model.streaming[0];
        assert_eq!(vs.interface_number, 1);
        assert_eq!(vs.endpoint_address, Some(0x81));
        assert_eq!(vs.formats.len(), 3);

        // Format indices are the 1-based positions of the formats.
        for (i, fmt) in vs.formats.iter().enumerate() {
            assert_eq!(fmt.format_index as usize, i + 1);
        }

        let yuy2 = &vs.formats[0];
        assert_eq!(yuy2.kind, FormatKind::Uncompressed);
        assert_eq!(yuy2.fourcc, FourCc::YUY2);
        assert_eq!(yuy2.bits_per_pixel, 16);
        assert_eq!(
            yuy2.frames[0].intervals,
            FrameIntervals::Continuous {
                min: 333_333,
                max: 2_000_000,
                step: 333_333
            }
        );
        assert_eq!(yuy2.frames[0].max_frame_size, 640 * 480 * 2);

        let mjpeg = &vs.formats[1];
        assert_eq!(mjpeg.kind, FormatKind::Mjpeg);
        assert_eq!(mjpeg.fourcc, FourCc::MJPG);
        assert_eq!(mjpeg.frames.len(), 2);
        let full = &mjpeg.frames[0];
        assert_eq!((full.width, full.height), (1920, 1080));
        assert_eq!(full.default_interval, 333_333);
        assert!(full.still_supported);
        assert_eq!(
            full.intervals,
            FrameIntervals::Discrete(vec![333_333, 666_666])
        );
        assert_eq!(mjpeg.still_frames.len(), 1);
        assert_eq!(mjpeg.still_frames[0].compression_indices, vec![1]);

        let h264 = &vs.formats[2];
        assert_eq!(h264.kind, FormatKind::FrameBased);
        assert_eq!(h264.fourcc, FourCc::H264);
        // Frame-based frames report no buffer size; it comes from PROBE.
        assert_eq!(h264.frames[0].max_frame_size, 0);
        assert_eq!(h264.frames[0].default_interval, 333_333);
    }

    #[test]
    fn parses_alt_settings_with_transaction_multiplier() {
        let model = parse_configuration(&webcam_config()).unwrap();
        let vs = &model.streaming[0];
        assert_eq!(vs.alt_settings.len(), 4);
        assert!(vs.alt_settings[0].endpoint.is_none());
        assert_eq!(vs.alt_settings[1].endpoint.unwrap().packet_capacity, 512);
        assert_eq!(vs.alt_settings[2].endpoint.unwrap().packet_capacity, 3072);
        assert_eq!(vs.alt_settings[3].endpoint.unwrap().packet_capacity, 3060);
    }

    #[test]
    fn selects_smallest_sufficient_alt() {
        let model = parse_configuration(&webcam_config()).unwrap();
        let vs = &model.streaming[0];
        assert_eq!(
            vs.select_alt_for_payload(3060).unwrap().alternate_setting,
            3
        );
        assert_eq!(vs.select_alt_for_payload(400).unwrap().alternate_setting, 1);
        assert!(vs.select_alt_for_payload(4000).is_none());
    }

    #[test]
    fn finds_frames_by_resolution_and_kind() {
        let model = parse_configuration(&webcam_config()).unwrap();
        let vs = &model.streaming[0];
        let (fmt, frame) = vs.find_frame(1920, 1080, Some(FormatKind::Mjpeg)).unwrap();
        assert_eq!(fmt.format_index, 2);
        assert_eq!(frame.frame_index, 1);
        assert!(vs.find_frame(640, 480, Some(FormatKind::Mjpeg)).is_none());
        let (fmt, _) = vs.find_frame(640, 480, None).unwrap();
        assert_eq!(fmt.kind, FormatKind::Uncompressed);
    }

    #[test]
    fn interval_selection_prefers_fastest_at_or_below_request() {
        let frame = FrameInfo {
            frame_index: 1,
            width: 1280,
            height: 720,
            min_bit_rate: 0,
            max_bit_rate: 0,
            max_frame_size: 0,
            default_interval: 333_333,
            intervals: FrameIntervals::Discrete(vec![166_666, 333_333, 666_666]),
            still_supported: false,
        };
        // 30 fps -> 333333; exact match.
        assert_eq!(frame.pick_interval(Some(30.0)), 333_333);
        // 45 fps -> target 222222; the largest interval at or below is 166666.
        assert_eq!(frame.pick_interval(Some(45.0)), 166_666);
        // 10 fps -> target 1000000; nothing at or below, so 666666 applies.
        assert_eq!(frame.pick_interval(Some(10.0)), 666_666);
        // 120 fps -> target 83333; smaller than every interval, smallest wins.
        assert_eq!(frame.pick_interval(Some(120.0)), 166_666);
        assert_eq!(frame.pick_interval(None), 333_333);
    }

    #[test]
    fn interval_selection_snaps_continuous_ranges() {
        let frame = FrameInfo {
            frame_index: 1,
            width: 640,
            height: 480,
            min_bit_rate: 0,
            max_bit_rate: 0,
            max_frame_size: 0,
            default_interval: 333_333,
            intervals: FrameIntervals::Continuous {
                min: 333_333,
                max: 2_000_000,
                step: 333_333,
            },
            still_supported: false,
        };
        assert_eq!(frame.pick_interval(Some(15.0)), 666_666);
        assert_eq!(frame.pick_interval(Some(60.0)), 333_333);
        assert_eq!(frame.pick_interval(Some(1.0)), 1_999_998);
    }

    #[test]
    fn rejects_blength_that_cannot_advance() {
        let cfg = config(&[&[1, 0x24, 0x01]]);
        let err = parse_configuration(&cfg).unwrap_err();
        assert_eq!(err.offset, DESCRIPTOR_LEN_CONFIGURATION);
    }

    #[test]
    fn rejects_truncated_descriptor() {
        let mut cfg = config(&[&interface(0, 0, 0x0e, 0x01, 0), &vc_header(0x0100, 1)]);
        // Claim one byte more than the remaining buffer.
        let last = cfg.len() - 13;
        cfg[last] = 14;
        let total = cfg.len() as u16;
        cfg[2..4].copy_from_slice(&total.to_le_bytes());
        assert!(parse_configuration(&cfg).is_err());
    }

    #[test]
    fn rejects_missing_video_control() {
        let cfg = config(&[&interface(0, 0, 0xff, 0x01, 0)]);
        assert!(parse_configuration(&cfg).is_err());
    }

    #[test]
    fn skips_unknown_descriptors() {
        let cfg = config(&[
            // Vendor blob ahead of anything video-related.
            &[6, 0xff, 1, 2, 3, 4],
            &interface(0, 0, 0x0e, 0x01, 0),
            &vc_header(0x0100, 1_000_000),
            // Unknown VC subtype, length respected.
            &[5, 0x24, 0x42, 0, 0],
            &camera_terminal(1, 0),
        ])
        ;
        let model = parse_configuration(&cfg).unwrap();
        assert_eq!(model.video_control.units.len(), 1);
        assert_eq!(model.video_control.uvc_version, 0x0100);
    }

    #[test]
    fn frame_without_format_is_skipped() {
        let cfg = config(&[
            &interface(0, 0, 0x0e, 0x01, 0),
            &vc_header(0x0100, 1_000_000),
            &interface(1, 0, 0x0e, 0x02, 0),
            &mjpeg_frame(1, 640, 480, &[333_333]),
        ]);
        let model = parse_configuration(&cfg).unwrap();
        assert!(model.streaming[0].formats.is_empty());
    }

    #[test]
    fn guid_round_trips_through_display_and_parse() {
        let guid = Guid(XU_GUID);
        let text = guid.to_string();
        assert_eq!(text, "28f03370-6311-4a2e-ba2c-6890eb334016");
        assert_eq!(Guid::parse(&text), Some(guid));
        assert_eq!(Guid::parse("not-a-guid"), None);
    }
}
