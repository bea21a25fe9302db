//! The Video Control request layer: query codes, standard control tables,
//! capability validation, and typed control values.
//!
//! On startup every advertised control bit is validated with a `GET_INFO`
//! round trip. Firmware routinely advertises controls it does not implement;
//! a stall on `GET_INFO` marks the control unsupported instead of failing
//! enumeration. Supported controls are enriched with their MIN/MAX/RES/DEF
//! ranges and, for extension units, with quirk annotations keyed by GUID.

use log::{debug, warn};

use crate::descriptors::{Unit, UnitKind};
use crate::device::UvcDevice;
use crate::error::{ControlError, ControlErrorKind};
use crate::quirks::{QuirkRegistry, QuirkType};

/// UVC class-specific request codes.
pub const SET_CUR: u8 = 0x01;

/// GET_* request selector for [`UvcDevice::get_control_raw`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Query {
    Cur = 0x81,
    Min = 0x82,
    Max = 0x83,
    Res = 0x84,
    Len = 0x85,
    Info = 0x86,
    Def = 0x87,
}

/// GET_INFO capability byte.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ControlCaps(pub u8);

impl ControlCaps {
    pub fn supports_get(&self) -> bool {
        self.0 & 0x01 != 0
    }

    pub fn supports_set(&self) -> bool {
        self.0 & 0x02 != 0
    }

    pub fn disabled_by_automatic(&self) -> bool {
        self.0 & 0x04 != 0
    }

    pub fn autoupdate(&self) -> bool {
        self.0 & 0x08 != 0
    }

    pub fn asynchronous(&self) -> bool {
        self.0 & 0x10 != 0
    }

    pub fn disabled_by_commit(&self) -> bool {
        self.0 & 0x20 != 0
    }
}

/// Which kind of unit owns a control.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlOwner {
    CameraTerminal,
    ProcessingUnit,
    ExtensionUnit,
}

struct StdControl {
    bit: u32,
    selector: u8,
    name: &'static str,
    len: u16,
    signed: bool,
}

const fn ctl(bit: u32, selector: u8, name: &'static str, len: u16, signed: bool) -> StdControl {
    StdControl {
        bit,
        selector,
        name,
        len,
        signed,
    }
}

/// Camera terminal controls, by `bmControls` bit position.
static CT_CONTROLS: &[StdControl] = &[
    ctl(0, 0x01, "Scanning Mode", 1, false),
    ctl(1, 0x02, "Auto Exposure Mode", 1, false),
    ctl(2, 0x03, "Auto Exposure Priority", 1, false),
    ctl(3, 0x04, "Exposure Time, Absolute", 4, false),
    ctl(4, 0x05, "Exposure Time, Relative", 1, true),
    ctl(5, 0x06, "Focus, Absolute", 2, false),
    ctl(6, 0x07, "Focus, Relative", 2, true),
    ctl(7, 0x09, "Iris, Absolute", 2, false),
    ctl(8, 0x0a, "Iris, Relative", 1, true),
    ctl(9, 0x0b, "Zoom, Absolute", 2, false),
    ctl(10, 0x0c, "Zoom, Relative", 3, true),
    ctl(11, 0x0d, "PanTilt, Absolute", 8, true),
    ctl(12, 0x0e, "PanTilt, Relative", 4, true),
    ctl(13, 0x0f, "Roll, Absolute", 2, true),
    ctl(14, 0x10, "Roll, Relative", 2, true),
    ctl(17, 0x08, "Focus, Auto", 1, false),
    ctl(18, 0x11, "Privacy", 1, false),
];

/// Processing unit controls, by `bmControls` bit position.
static PU_CONTROLS: &[StdControl] = &[
    ctl(0, 0x02, "Brightness", 2, true),
    ctl(1, 0x03, "Contrast", 2, false),
    ctl(2, 0x06, "Hue", 2, true),
    ctl(3, 0x07, "Saturation", 2, false),
    ctl(4, 0x08, "Sharpness", 2, false),
    ctl(5, 0x09, "Gamma", 2, false),
    ctl(6, 0x0a, "White Balance Temperature", 2, false),
    ctl(7, 0x0c, "White Balance Component", 4, false),
    ctl(8, 0x01, "Backlight Compensation", 2, false),
    ctl(9, 0x04, "Gain", 2, false),
    ctl(10, 0x05, "Power Line Frequency", 1, false),
    ctl(11, 0x10, "Hue, Auto", 1, false),
    ctl(12, 0x0b, "White Balance Temperature, Auto", 1, false),
    ctl(13, 0x0d, "White Balance Component, Auto", 1, false),
    ctl(14, 0x0e, "Digital Multiplier", 2, false),
    ctl(15, 0x0f, "Digital Multiplier Limit", 2, false),
];

fn std_control_for_bit(table: &'static [StdControl], bit: u32) -> Option<&'static StdControl> {
    table.iter().find(|c| c.bit == bit)
}

/// A validated control with live range metadata.
#[derive(Debug, Clone)]
pub struct ControlEntry {
    pub unit_id: u8,
    pub selector: u8,
    pub owner: ControlOwner,
    pub name: String,
    /// Quirk-supplied value-type hint, when one exists.
    pub kind: Option<QuirkType>,
    pub notes: Option<String>,
    pub caps: ControlCaps,
    /// Payload length in bytes for CUR/MIN/MAX/RES/DEF.
    pub len: u16,
    pub signed: bool,
    pub min: Option<i64>,
    pub max: Option<i64>,
    pub res: Option<i64>,
    pub default: Option<i64>,
}

impl ControlEntry {
    pub fn is_readable(&self) -> bool {
        self.caps.supports_get()
    }

    pub fn is_writable(&self) -> bool {
        self.caps.supports_set()
    }

    /// The value the device is expected to settle on after writing `value`:
    /// clamped into `[min, max]` and rounded down to the resolution grid.
    pub fn clip(&self, value: i64) -> i64 {
        let mut v = value;
        if let Some(min) = self.min {
            v = v.max(min);
        }
        if let Some(max) = self.max {
            v = v.min(max);
        }
        if let (Some(res), Some(min)) = (self.res, self.min) {
            if res > 0 {
                v = min + (v - min) / res * res;
            }
        }
        v
    }
}

/// Decode a little-endian control payload into an integer.
///
/// Returns `None` for payloads longer than eight bytes, which are opaque.
pub(crate) fn decode_value(data: &[u8], signed: bool) -> Option<i64> {
    if data.is_empty() || data.len() > 8 {
        return None;
    }
    let mut buf = [0u8; 8];
    buf[..data.len()].copy_from_slice(data);
    let raw = u64::from_le_bytes(buf);
    if signed {
        let shift = 64 - data.len() as u32 * 8;
        Some(((raw << shift) as i64) >> shift)
    } else {
        Some(raw as i64)
    }
}

/// Encode an integer as a little-endian control payload of `len` bytes.
pub(crate) fn encode_value(value: i64, len: u16) -> Vec<u8> {
    value.to_le_bytes()[..usize::from(len).min(8)].to_vec()
}

/// Signedness heuristic for controls without a table entry: treat the range
/// as signed when reading it unsigned turns the minimum greater than the
/// maximum. Only meaningful for 2- and 4-byte payloads.
fn infer_signed(min_raw: Option<&[u8]>, max_raw: Option<&[u8]>) -> bool {
    let (Some(min), Some(max)) = (min_raw, max_raw) else {
        return false;
    };
    if min.len() != max.len() || !matches!(min.len(), 2 | 4) {
        return false;
    }
    decode_value(min, false) > decode_value(max, false)
}

/// Run the `GET_INFO` validation sweep over every advertised control of
/// every unit, returning the supported controls enriched with range data and
/// quirk annotations.
pub(crate) fn enumerate(dev: &UvcDevice, quirks: &QuirkRegistry) -> Vec<ControlEntry> {
    let mut entries = Vec::new();
    let units: Vec<Unit> = dev.model().video_control.units.clone();
    for unit in &units {
        match &unit.kind {
            UnitKind::InputTerminal { controls, .. } if unit.is_camera_terminal() => {
                for bit in controls.bits() {
                    let Some(std) = std_control_for_bit(CT_CONTROLS, bit) else {
                        debug!("camera terminal {}: unknown control bit {bit}", unit.id);
                        continue;
                    };
                    if let Some(entry) =
                        validate_std(dev, unit.id, ControlOwner::CameraTerminal, std)
                    {
                        entries.push(entry);
                    }
                }
            }
            UnitKind::ProcessingUnit { controls, .. } => {
                for bit in controls.bits() {
                    let Some(std) = std_control_for_bit(PU_CONTROLS, bit) else {
                        debug!("processing unit {}: unknown control bit {bit}", unit.id);
                        continue;
                    };
                    if let Some(entry) =
                        validate_std(dev, unit.id, ControlOwner::ProcessingUnit, std)
                    {
                        entries.push(entry);
                    }
                }
            }
            UnitKind::ExtensionUnit { guid, controls, .. } => {
                for bit in controls.bits() {
                    let selector = bit as u8 + 1;
                    if let Some(entry) = validate_xu(dev, unit.id, selector, guid, quirks) {
                        entries.push(entry);
                    }
                }
            }
            _ => {}
        }
    }
    entries
}

fn read_info(dev: &UvcDevice, unit: u8, selector: u8) -> Option<ControlCaps> {
    match dev.vc_get(unit, selector, Query::Info, 1) {
        Ok(data) if !data.is_empty() => Some(ControlCaps(data[0])),
        Ok(_) => None,
        Err(e @ ControlError { kind: ControlErrorKind::Stall, .. }) => {
            // The unit advertised this control but does not implement it.
            debug!("control marked unsupported: {e}");
            None
        }
        Err(e) => {
            warn!("GET_INFO failed: {e}");
            None
        }
    }
}

fn read_range(dev: &UvcDevice, unit: u8, selector: u8, query: Query, len: u16) -> Option<Vec<u8>> {
    dev.vc_get(unit, selector, query, len).ok()
}

fn validate_std(
    dev: &UvcDevice,
    unit: u8,
    owner: ControlOwner,
    std: &StdControl,
) -> Option<ControlEntry> {
    let caps = read_info(dev, unit, std.selector)?;
    let (min_raw, max_raw, res_raw, def_raw) = if caps.supports_get() {
        (
            read_range(dev, unit, std.selector, Query::Min, std.len),
            read_range(dev, unit, std.selector, Query::Max, std.len),
            read_range(dev, unit, std.selector, Query::Res, std.len),
            read_range(dev, unit, std.selector, Query::Def, std.len),
        )
    } else {
        (None, None, None, None)
    };
    let signed = std.signed || infer_signed(min_raw.as_deref(), max_raw.as_deref());
    Some(ControlEntry {
        unit_id: unit,
        selector: std.selector,
        owner,
        name: std.name.to_string(),
        kind: None,
        notes: None,
        caps,
        len: std.len,
        signed,
        min: min_raw.as_deref().and_then(|d| decode_value(d, signed)),
        max: max_raw.as_deref().and_then(|d| decode_value(d, signed)),
        res: res_raw.as_deref().and_then(|d| decode_value(d, signed)),
        default: def_raw.as_deref().and_then(|d| decode_value(d, signed)),
    })
}

fn validate_xu(
    dev: &UvcDevice,
    unit: u8,
    selector: u8,
    guid: &crate::descriptors::Guid,
    quirks: &QuirkRegistry,
) -> Option<ControlEntry> {
    let caps = read_info(dev, unit, selector)?;

    // XU payload sizes are variable and come from GET_LEN.
    let len = dev
        .vc_get(unit, selector, Query::Len, 2)
        .ok()
        .and_then(|d| decode_value(&d, false))
        .filter(|len| *len > 0)
        .map(|len| len as u16);

    let quirk = quirks.control(guid, selector);
    if let Some(q) = quirk {
        if let Some(expect) = q.get_info_expect {
            if expect != caps.0 {
                warn!(
                    "XU {guid} selector {selector}: GET_INFO 0x{:02x} does not match quirk expectation 0x{expect:02x}",
                    caps.0
                );
            }
        }
        if let (Some(expect), Some(len)) = (q.payload_len, len) {
            if expect != len {
                warn!(
                    "XU {guid} selector {selector}: GET_LEN {len} does not match quirk expectation {expect}"
                );
            }
        }
    }

    let len = match (len, quirk.and_then(|q| q.payload_len)) {
        (Some(len), _) => len,
        (None, Some(from_quirk)) => from_quirk,
        (None, None) => {
            debug!("XU {guid} selector {selector}: no usable GET_LEN, skipping");
            return None;
        }
    };

    let readable_int = caps.supports_get() && len <= 8;
    let (min_raw, max_raw, res_raw, def_raw) = if readable_int {
        (
            read_range(dev, unit, selector, Query::Min, len),
            read_range(dev, unit, selector, Query::Max, len),
            read_range(dev, unit, selector, Query::Res, len),
            read_range(dev, unit, selector, Query::Def, len),
        )
    } else {
        (None, None, None, None)
    };
    let signed = infer_signed(min_raw.as_deref(), max_raw.as_deref());

    Some(ControlEntry {
        unit_id: unit,
        selector,
        owner: ControlOwner::ExtensionUnit,
        name: quirk
            .map(|q| q.name.clone())
            .unwrap_or_else(|| format!("Selector {selector}")),
        kind: quirk.map(|q| q.kind),
        notes: quirk.and_then(|q| q.notes.clone()),
        caps,
        len,
        signed,
        min: min_raw.as_deref().and_then(|d| decode_value(d, signed)),
        max: max_raw.as_deref().and_then(|d| decode_value(d, signed)),
        res: res_raw.as_deref().and_then(|d| decode_value(d, signed)),
        default: def_raw.as_deref().and_then(|d| decode_value(d, signed)),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_unsigned_and_signed() {
        assert_eq!(decode_value(&[0xc8, 0x00], false), Some(200));
        assert_eq!(decode_value(&[0xff, 0xff], false), Some(65535));
        assert_eq!(decode_value(&[0xff, 0xff], true), Some(-1));
        assert_eq!(decode_value(&[0x00, 0x80], true), Some(-32768));
        assert_eq!(decode_value(&[0x2c, 0x01, 0x00, 0x00], false), Some(300));
        assert_eq!(decode_value(&[], false), None);
        assert_eq!(decode_value(&[0u8; 9], false), None);
    }

    #[test]
    fn encode_matches_length() {
        assert_eq!(encode_value(200, 2), vec![0xc8, 0x00]);
        assert_eq!(encode_value(-1, 2), vec![0xff, 0xff]);
        assert_eq!(encode_value(333_333, 4), vec![0x15, 0x16, 0x05, 0x00]);
        assert_eq!(encode_value(1, 1), vec![0x01]);
    }

    #[test]
    fn round_trip_preserves_signed_values() {
        for v in [-32768i64, -1, 0, 1, 12345, 32767] {
            let bytes = encode_value(v, 2);
            assert_eq!(decode_value(&bytes, true), Some(v));
        }
    }

    #[test]
    fn signedness_inferred_from_inverted_range() {
        // Brightness-style range -64..=64: unsigned read yields min > max.
        let min = encode_value(-64, 2);
        let max = encode_value(64, 2);
        assert!(infer_signed(Some(&min), Some(&max)));

        let min = encode_value(0, 2);
        let max = encode_value(255, 2);
        assert!(!infer_signed(Some(&min), Some(&max)));

        // Lengths outside 2/4 bytes never trigger the heuristic.
        assert!(!infer_signed(Some(&[0xff]), Some(&[0x00])));
    }

    #[test]
    fn standard_tables_map_bits_to_selectors() {
        let exposure = std_control_for_bit(CT_CONTROLS, 3).unwrap();
        assert_eq!(exposure.selector, 0x04);
        assert_eq!(exposure.name, "Exposure Time, Absolute");
        assert_eq!(exposure.len, 4);

        let focus_auto = std_control_for_bit(CT_CONTROLS, 17).unwrap();
        assert_eq!(focus_auto.selector, 0x08);

        let wb_auto = std_control_for_bit(PU_CONTROLS, 12).unwrap();
        assert_eq!(wb_auto.selector, 0x0b);
        assert_eq!(wb_auto.name, "White Balance Temperature, Auto");

        assert!(std_control_for_bit(CT_CONTROLS, 15).is_none());
    }

    #[test]
    fn clip_applies_bounds_and_resolution() {
        let entry = ControlEntry {
            unit_id: 1,
            selector: 0x04,
            owner: ControlOwner::CameraTerminal,
            name: "Exposure Time, Absolute".into(),
            kind: None,
            notes: None,
            caps: ControlCaps(0x03),
            len: 4,
            signed: false,
            min: Some(10),
            max: Some(1000),
            res: Some(10),
            default: Some(100),
        };
        assert_eq!(entry.clip(200), 200);
        assert_eq!(entry.clip(205), 200);
        assert_eq!(entry.clip(5), 10);
        assert_eq!(entry.clip(5000), 1000);
    }

    #[test]
    fn caps_bits() {
        let caps = ControlCaps(0b0011_0101);
        assert!(caps.supports_get());
        assert!(!caps.supports_set());
        assert!(caps.disabled_by_automatic());
        assert!(!caps.autoupdate());
        assert!(caps.asynchronous());
        assert!(caps.disabled_by_commit());
    }
}
