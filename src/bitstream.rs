//! H.264/H.265 bitstream normalisation.
//!
//! UVC 1.5 frame-based payloads may omit SPS/PPS from every frame and may
//! use length-prefixed (AVC) NAL framing instead of Annex B start codes.
//! Decoders need the parameter sets ahead of the first IDR they see. The
//! normaliser rewrites each frame to Annex B, caches the most recent
//! parameter sets, and prepends them to IDR frames that arrive without
//! them. Frames that cannot initialise a decoder (an IDR with no parameter
//! sets available anywhere, or a predicted frame before the first IDR) are
//! dropped and counted.
//!
//! The framing layout is a heuristic over the first frame and holds for the
//! stream; a new normaliser is created per stream configuration.

use log::debug;

use crate::frame::FourCc;

const START_CODE: [u8; 4] = [0, 0, 0, 1];

/// How many leading payload bytes the layout heuristic inspects.
const DETECT_WINDOW: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NalCodec {
    H264,
    H265,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PayloadLayout {
    AnnexB,
    /// AVC-style framing: each NAL is preceded by a big-endian length of
    /// `size` bytes.
    LengthPrefixed { size: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NalKind {
    Vps,
    Sps,
    Pps,
    Idr,
    Other,
}

pub(crate) struct BitstreamNormalizer {
    codec: NalCodec,
    layout: Option<PayloadLayout>,
    vps: Option<Vec<u8>>,
    sps: Option<Vec<u8>>,
    pps: Option<Vec<u8>>,
    /// An IDR has been delivered; predicted frames are decodable now.
    seen_idr: bool,
    dropped: u64,
}

impl BitstreamNormalizer {
    pub(crate) fn new(fourcc: FourCc) -> BitstreamNormalizer {
        let codec = if fourcc == FourCc::H265 {
            NalCodec::H265
        } else {
            NalCodec::H264
        };
        BitstreamNormalizer {
            codec,
            layout: None,
            vps: None,
            sps: None,
            pps: None,
            seen_idr: false,
            dropped: 0,
        }
    }

    /// Frames dropped because a decoder could not have used them.
    #[cfg_attr(not(test), allow(dead_code))]
    pub(crate) fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Rewrite one frame. `None` means the frame must be discarded.
    pub(crate) fn normalize(&mut self, payload: &[u8]) -> Option<Vec<u8>> {
        if payload.is_empty() {
            self.dropped += 1;
            return None;
        }

        let layout = *self.layout.get_or_insert_with(|| {
            let layout = detect_layout(payload);
            debug!("frame-based payload layout: {layout:?}");
            layout
        });

        let nals = match layout {
            PayloadLayout::AnnexB => split_annex_b(payload),
            PayloadLayout::LengthPrefixed { size } => split_length_prefixed(payload, size),
        };
        if nals.is_empty() {
            self.dropped += 1;
            return None;
        }

        // Refresh the caches from anything in-band before deciding what the
        // frame is missing.
        let mut first_idr = None;
        let mut params_before_idr = ParamsSeen::default();
        for (i, nal) in nals.iter().enumerate() {
            match self.classify(nal) {
                NalKind::Vps => {
                    self.vps = Some(nal.to_vec());
                    if first_idr.is_none() {
                        params_before_idr.vps = true;
                    }
                }
                NalKind::Sps => {
                    self.sps = Some(nal.to_vec());
                    if first_idr.is_none() {
                        params_before_idr.sps = true;
                    }
                }
                NalKind::Pps => {
                    self.pps = Some(nal.to_vec());
                    if first_idr.is_none() {
                        params_before_idr.pps = true;
                    }
                }
                NalKind::Idr => {
                    if first_idr.is_none() {
                        first_idr = Some(i);
                    }
                }
                NalKind::Other => {}
            }
        }

        let needs_vps = self.codec == NalCodec::H265;
        let prepend = match first_idr {
            Some(_) => {
                let complete = params_before_idr.sps
                    && params_before_idr.pps
                    && (!needs_vps || params_before_idr.vps);
                if complete {
                    Vec::new()
                } else {
                    let missing = self.sps.is_none()
                        || self.pps.is_none()
                        || (needs_vps && self.vps.is_none());
                    if missing {
                        self.count_drop("IDR without parameter sets available");
                        return None;
                    }
                    // Cached sets (possibly refreshed from this very frame)
                    // stand in for whatever is missing up front.
                    let mut sets: Vec<&[u8]> = Vec::new();
                    if needs_vps {
                        if let Some(vps) = self.vps.as_deref() {
                            sets.push(vps);
                        }
                    }
                    if let Some(sps) = self.sps.as_deref() {
                        sets.push(sps);
                    }
                    if let Some(pps) = self.pps.as_deref() {
                        sets.push(pps);
                    }
                    sets
                }
            }
            None => {
                if !self.seen_idr {
                    self.count_drop("predicted frame before the first IDR");
                    return None;
                }
                Vec::new()
            }
        };

        let mut out = Vec::with_capacity(
            payload.len() + prepend.iter().map(|s| s.len() + 4).sum::<usize>() + 16,
        );
        for set in prepend {
            out.extend_from_slice(&START_CODE);
            out.extend_from_slice(set);
        }
        for nal in &nals {
            out.extend_from_slice(&START_CODE);
            out.extend_from_slice(nal);
        }

        if first_idr.is_some() {
            self.seen_idr = true;
        }
        Some(out)
    }

    fn count_drop(&mut self, why: &str) {
        debug!("dropping frame: {why}");
        self.dropped += 1;
    }

    fn classify(&self, nal: &[u8]) -> NalKind {
        let Some(&first) = nal.first() else {
            return NalKind::Other;
        };
        match self.codec {
            NalCodec::H264 => match first & 0x1f {
                5 => NalKind::Idr,
                7 => NalKind::Sps,
                8 => NalKind::Pps,
                _ => NalKind::Other,
            },
            NalCodec::H265 => match (first >> 1) & 0x3f {
                19 | 20 => NalKind::Idr,
                32 => NalKind::Vps,
                33 => NalKind::Sps,
                34 => NalKind::Pps,
                _ => NalKind::Other,
            },
        }
    }
}

#[derive(Default)]
struct ParamsSeen {
    vps: bool,
    sps: bool,
    pps: bool,
}

/// Position of the next `00 00 01` start code at or after `from`, returned
/// as (prefix start, payload start). A `00 00 00 01` prefix is recognised by
/// its trailing three bytes.
fn find_start_code(data: &[u8], from: usize) -> Option<(usize, usize)> {
    let mut i = from;
    while i + 3 <= data.len() {
        if data[i] == 0 && data[i + 1] == 0 && data[i + 2] == 1 {
            let prefix_start = if i > 0 && data[i - 1] == 0 { i - 1 } else { i };
            return Some((prefix_start, i + 3));
        }
        i += 1;
    }
    None
}

fn split_annex_b(data: &[u8]) -> Vec<&[u8]> {
    let mut nals = Vec::new();
    let Some((_, mut start)) = find_start_code(data, 0) else {
        return nals;
    };
    while start < data.len() {
        match find_start_code(data, start) {
            Some((end, next)) => {
                if end > start {
                    nals.push(&data[start..end]);
                }
                start = next;
            }
            None => {
                nals.push(&data[start..]);
                break;
            }
        }
    }
    nals
}

fn split_length_prefixed(data: &[u8], size: usize) -> Vec<&[u8]> {
    let mut nals = Vec::new();
    let mut offset = 0;
    while offset + size <= data.len() {
        let mut len = 0usize;
        for &b in &data[offset..offset + size] {
            len = len << 8 | b as usize;
        }
        offset += size;
        if len == 0 || offset + len > data.len() {
            break;
        }
        nals.push(&data[offset..offset + len]);
        offset += len;
    }
    nals
}

fn detect_layout(payload: &[u8]) -> PayloadLayout {
    let window = &payload[..payload.len().min(DETECT_WINDOW)];
    if find_start_code(window, 0).is_some() {
        return PayloadLayout::AnnexB;
    }
    for size in [4usize, 3, 2, 1] {
        if payload.len() <= size {
            continue;
        }
        let mut len = 0usize;
        for &b in &payload[..size] {
            len = len << 8 | b as usize;
        }
        if len > 0 && len <= payload.len() - size {
            return PayloadLayout::LengthPrefixed { size };
        }
    }
    PayloadLayout::AnnexB
}

#[cfg(test)]
mod tests {
    use super::*;

    const SPS: &[u8] = &[0x67, 0xde, 0xad];
    const PPS: &[u8] = &[0x68, 0xbe, 0xef];
    const IDR: &[u8] = &[0x65, 0x11, 0x22];
    const P_SLICE: &[u8] = &[0x41, 0x33];

    fn annex_b(nals: &[&[u8]]) -> Vec<u8> {
        let mut out = Vec::new();
        for nal in nals {
            out.extend_from_slice(&START_CODE);
            out.extend_from_slice(nal);
        }
        out
    }

    fn avc(nals: &[&[u8]]) -> Vec<u8> {
        let mut out = Vec::new();
        for nal in nals {
            out.extend_from_slice(&(nal.len() as u32).to_be_bytes());
            out.extend_from_slice(nal);
        }
        out
    }

    fn nal_positions(payload: &[u8], nal: &[u8]) -> Vec<usize> {
        let mut needle = START_CODE.to_vec();
        needle.extend_from_slice(nal);
        payload
            .windows(needle.len())
            .enumerate()
            .filter(|(_, w)| *w == &needle[..])
            .map(|(i, _)| i)
            .collect()
    }

    #[test]
    fn detects_annex_b_with_both_prefix_lengths() {
        assert_eq!(detect_layout(&annex_b(&[SPS])), PayloadLayout::AnnexB);
        let mut three_byte = vec![0, 0, 1];
        three_byte.extend_from_slice(SPS);
        assert_eq!(detect_layout(&three_byte), PayloadLayout::AnnexB);
    }

    #[test]
    fn detects_length_prefixed_payloads() {
        assert_eq!(
            detect_layout(&avc(&[IDR])),
            PayloadLayout::LengthPrefixed { size: 4 }
        );
    }

    #[test]
    fn splits_three_byte_start_codes() {
        let mut data = vec![0, 0, 1];
        data.extend_from_slice(SPS);
        data.extend_from_slice(&[0, 0, 1]);
        data.extend_from_slice(PPS);
        let nals = split_annex_b(&data);
        assert_eq!(nals, vec![SPS, PPS]);
    }

    #[test]
    fn parameter_sets_pass_through_when_already_in_band() {
        let mut n = BitstreamNormalizer::new(FourCc::H264);
        let out = n.normalize(&annex_b(&[SPS, PPS, IDR])).unwrap();
        // No duplicates: one SPS, one PPS, ahead of the IDR.
        assert_eq!(nal_positions(&out, SPS).len(), 1);
        assert_eq!(nal_positions(&out, PPS).len(), 1);
        let idr_at = nal_positions(&out, IDR)[0];
        assert!(nal_positions(&out, SPS)[0] < idr_at);
        assert!(nal_positions(&out, PPS)[0] < idr_at);
    }

    #[test]
    fn cached_sets_are_prepended_to_bare_idr_frames() {
        let mut n = BitstreamNormalizer::new(FourCc::H264);
        n.normalize(&annex_b(&[SPS, PPS, IDR])).unwrap();
        let out = n.normalize(&annex_b(&[IDR])).unwrap();
        let sps_at = nal_positions(&out, SPS);
        let pps_at = nal_positions(&out, PPS);
        let idr_at = nal_positions(&out, IDR);
        assert_eq!(sps_at.len(), 1);
        assert_eq!(pps_at.len(), 1);
        assert!(sps_at[0] < idr_at[0] && pps_at[0] < idr_at[0]);
    }

    #[test]
    fn idr_without_any_parameter_sets_is_dropped_until_they_appear() {
        let mut n = BitstreamNormalizer::new(FourCc::H264);
        assert!(n.normalize(&annex_b(&[IDR])).is_none());
        assert!(n.normalize(&annex_b(&[IDR])).is_none());
        assert_eq!(n.dropped(), 2);
        // Parameter sets finally arrive; streaming recovers.
        assert!(n.normalize(&annex_b(&[SPS, PPS, IDR])).is_some());
        assert!(n.normalize(&annex_b(&[IDR])).is_some());
        assert_eq!(n.dropped(), 2);
    }

    #[test]
    fn predicted_frames_before_the_first_idr_are_dropped() {
        let mut n = BitstreamNormalizer::new(FourCc::H264);
        assert!(n.normalize(&annex_b(&[P_SLICE])).is_none());
        n.normalize(&annex_b(&[SPS, PPS, IDR])).unwrap();
        let out = n.normalize(&annex_b(&[P_SLICE])).unwrap();
        assert_eq!(nal_positions(&out, P_SLICE).len(), 1);
    }

    #[test]
    fn avc_framing_is_converted_to_annex_b() {
        let mut n = BitstreamNormalizer::new(FourCc::H264);
        let out = n.normalize(&avc(&[SPS, PPS, IDR])).unwrap();
        assert!(out.starts_with(&START_CODE));
        assert_eq!(nal_positions(&out, IDR).len(), 1);
    }

    #[test]
    fn layout_is_decided_once_per_stream() {
        let mut n = BitstreamNormalizer::new(FourCc::H264);
        n.normalize(&annex_b(&[SPS, PPS, IDR])).unwrap();
        // This also parses as a plausible length prefix, but the stream is
        // already known to be Annex B.
        let out = n.normalize(&annex_b(&[IDR])).unwrap();
        assert_eq!(nal_positions(&out, IDR).len(), 1);
    }

    #[test]
    fn h265_requires_and_prepends_vps() {
        const H265_VPS: &[u8] = &[32 << 1, 0x01];
        const H265_SPS: &[u8] = &[33 << 1, 0x02];
        const H265_PPS: &[u8] = &[34 << 1, 0x03];
        const H265_IDR: &[u8] = &[19 << 1, 0x04];

        let mut n = BitstreamNormalizer::new(FourCc::H265);
        n.normalize(&annex_b(&[H265_VPS, H265_SPS, H265_PPS, H265_IDR]))
            .unwrap();
        let out = n.normalize(&annex_b(&[H265_IDR])).unwrap();
        let idr_at = nal_positions(&out, H265_IDR)[0];
        assert!(nal_positions(&out, H265_VPS)[0] < idr_at);
        assert!(nal_positions(&out, H265_SPS)[0] < idr_at);
        assert!(nal_positions(&out, H265_PPS)[0] < idr_at);
    }

    #[test]
    fn h265_idr_n_lp_is_recognised() {
        const H265_IDR_N_LP: &[u8] = &[20 << 1, 0x09];
        let n = BitstreamNormalizer::new(FourCc::H265);
        assert_eq!(n.classify(H265_IDR_N_LP), NalKind::Idr);
    }

    #[test]
    fn empty_and_garbage_payloads_are_dropped() {
        let mut n = BitstreamNormalizer::new(FourCc::H264);
        assert!(n.normalize(&[]).is_none());
        assert!(n.normalize(&[0xff; 3]).is_none());
        assert!(n.dropped() >= 2);
    }
}
