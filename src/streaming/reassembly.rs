//! Reassembling frames from UVC payload packets.
//!
//! Every non-empty isochronous packet starts with a payload header:
//! `bHeaderLength` (always at least 2), a flag byte (Frame ID toggle,
//! End-of-Frame, PTS/SCR presence, error, end-of-header), then the optional
//! PTS and SCR fields. The reassembler concatenates payload bytes into the
//! frame in progress, completes it on the EOF bit or an FID toggle, and
//! absorbs per-packet errors into the frame's error flag.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;

use log::debug;

use crate::bitstream::BitstreamNormalizer;
use crate::descriptors::FormatKind;
use crate::frame::{FourCc, Frame};

use super::StatsShared;

const BH_FID: u8 = 0x01;
const BH_EOF: u8 = 0x02;
const BH_PTS: u8 = 0x04;
const BH_ERR: u8 = 0x40;

/// Static parameters of one stream's reassembly.
pub(crate) struct ReassemblyConfig {
    pub fourcc: FourCc,
    pub width: u16,
    pub height: u16,
    pub kind: FormatKind,
    /// `dwMaxVideoFrameSize` from COMMIT: the exact size of an uncompressed
    /// frame and the upper bound for every other kind. 0 disables the bound.
    pub max_video_frame_size: usize,
    pub deliver_partial: bool,
    /// Completed frames to discard at stream start before delivery begins.
    pub skip_initial: u32,
}

enum Boundary {
    FidToggle,
    EndOfFrame,
}

pub(crate) struct FrameReassembler {
    cfg: ReassemblyConfig,
    normalizer: Option<BitstreamNormalizer>,
    stats: Arc<StatsShared>,

    buf: Vec<u8>,
    fid: Option<bool>,
    errored: bool,
    /// A transfer-level error arrived while no frame was in progress; the
    /// next frame to start is missing data and begins errored.
    pending_error: bool,
    pts: Option<u32>,
    sequence: u64,
    skip_remaining: u32,
}

impl FrameReassembler {
    pub(crate) fn new(cfg: ReassemblyConfig, stats: Arc<StatsShared>) -> FrameReassembler {
        let normalizer = if cfg.kind == FormatKind::FrameBased && cfg.fourcc.is_h26x() {
            Some(BitstreamNormalizer::new(cfg.fourcc))
        } else {
            None
        };
        let capacity = cfg.max_video_frame_size.min(16 << 20).max(4096);
        FrameReassembler {
            skip_remaining: cfg.skip_initial,
            cfg,
            normalizer,
            stats,
            buf: Vec::with_capacity(capacity),
            fid: None,
            errored: false,
            pending_error: false,
            pts: None,
            sequence: 0,
        }
    }

    /// Record a transfer-level data error. The frame in progress (or the
    /// next one to start) is marked errored; the stream continues.
    pub(crate) fn note_transfer_error(&mut self) {
        if self.fid.is_some() {
            self.errored = true;
        } else {
            self.pending_error = true;
        }
    }

    /// Feed one packet (header + payload). Completed frames, if any, are
    /// appended to `out` — an FID toggle and an EOF bit in the same packet
    /// can complete two frames at once.
    pub(crate) fn push_packet(&mut self, packet: &[u8], out: &mut Vec<Frame>) {
        self.stats.packets.fetch_add(1, Ordering::Relaxed);
        if packet.is_empty() {
            return;
        }

        let header_len = packet[0] as usize;
        if header_len < 2 || header_len > packet.len() {
            debug!("malformed payload header (bHeaderLength {header_len})");
            self.note_transfer_error();
            return;
        }

        let flags = packet[1];
        let fid = flags & BH_FID != 0;
        let eof = flags & BH_EOF != 0;
        let err = flags & BH_ERR != 0;
        let payload = &packet[header_len..];

        match self.fid {
            None => {
                // Header-only packets keep the line alive between frames and
                // never start one.
                if payload.is_empty() {
                    return;
                }
                self.start_frame(fid, err);
            }
            Some(current) if current != fid => {
                // Implicit boundary: the device toggled FID without an EOF on
                // the previous packet.
                if let Some(frame) = self.finalize(Boundary::FidToggle) {
                    out.push(frame);
                }
                self.start_frame(fid, err);
            }
            Some(_) => {
                if err {
                    self.errored = true;
                }
            }
        }

        if !payload.is_empty() {
            if self.pts.is_none() && flags & BH_PTS != 0 && header_len >= 6 {
                self.pts = Some(u32::from_le_bytes(packet[2..6].try_into().unwrap()));
            }
            self.buf.extend_from_slice(payload);
            if self.cfg.max_video_frame_size != 0 && self.buf.len() > self.cfg.max_video_frame_size
            {
                debug!(
                    "frame exceeds negotiated size ({} > {})",
                    self.buf.len(),
                    self.cfg.max_video_frame_size
                );
                self.errored = true;
            }
        }

        if eof && self.fid.is_some() {
            if let Some(frame) = self.finalize(Boundary::EndOfFrame) {
                out.push(frame);
            }
        }
    }

    /// Discard the frame in progress, e.g. when the stream stops.
    pub(crate) fn discard_in_progress(&mut self) {
        self.reset_frame_state();
    }

    fn start_frame(&mut self, fid: bool, err: bool) {
        self.fid = Some(fid);
        self.errored = err || self.pending_error;
        self.pending_error = false;
        self.buf.clear();
        self.pts = None;
    }

    fn reset_frame_state(&mut self) {
        self.fid = None;
        self.errored = false;
        self.buf.clear();
        self.pts = None;
    }

    fn finalize(&mut self, boundary: Boundary) -> Option<Frame> {
        if self.buf.is_empty() {
            self.reset_frame_state();
            return None;
        }

        self.stats.frames_completed.fetch_add(1, Ordering::Relaxed);
        let sequence = self.sequence;
        self.sequence += 1;

        let errored = self.errored;
        let pts = self.pts;
        let len = self.buf.len();
        let payload = std::mem::take(&mut self.buf);
        self.reset_frame_state();

        if errored {
            debug!("dropping frame #{sequence}: errored ({len} bytes)");
            self.stats.dropped_errored.fetch_add(1, Ordering::Relaxed);
            return None;
        }

        let payload = match self.cfg.kind {
            FormatKind::Uncompressed => {
                let expected = self.cfg.max_video_frame_size;
                if expected != 0 && len != expected && !self.cfg.deliver_partial {
                    let how = match boundary {
                        Boundary::FidToggle => "FID toggle",
                        Boundary::EndOfFrame => "EOF",
                    };
                    debug!("dropping frame #{sequence}: {len} of {expected} bytes at {how}");
                    self.stats.dropped_truncated.fetch_add(1, Ordering::Relaxed);
                    return None;
                }
                payload
            }
            FormatKind::Mjpeg => {
                if !payload.starts_with(&[0xff, 0xd8]) {
                    debug!("dropping frame #{sequence}: missing JPEG SOI marker");
                    self.stats.dropped_bad_magic.fetch_add(1, Ordering::Relaxed);
                    return None;
                }
                payload
            }
            FormatKind::FrameBased => match &mut self.normalizer {
                Some(normalizer) => match normalizer.normalize(&payload) {
                    Some(rewritten) => rewritten,
                    None => {
                        debug!("dropping frame #{sequence}: waiting for parameter sets");
                        self.stats
                            .dropped_parameter_set
                            .fetch_add(1, Ordering::Relaxed);
                        return None;
                    }
                },
                None => payload,
            },
        };

        // Warm-up frames are deliberately discarded without consuming
        // sequence numbers, so a fresh stream delivers 0, 1, 2, ...
        if self.skip_remaining > 0 {
            self.skip_remaining -= 1;
            self.sequence = sequence;
            return None;
        }

        self.stats.frames_delivered.fetch_add(1, Ordering::Relaxed);
        Some(Frame {
            payload,
            fourcc: self.cfg.fourcc,
            width: self.cfg.width,
            height: self.cfg.height,
            sequence,
            pts,
            completed_at: Instant::now(),
        })
    }
}
