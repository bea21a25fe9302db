//! The dedicated I/O thread driving a stream.
//!
//! One thread owns every transfer slot and the reassembler. It keeps the
//! fleet of isochronous URBs submitted, waits for completions with poll(2)
//! (usbfs signals reapable URBs as `POLLOUT`), drains them with
//! `REAPURBNDELAY`, hands the packets to the reassembler, and resubmits.
//! Stopping cancels the URBs in reverse submission order, waits for every
//! cancellation to reap, drops the isochronous bandwidth reservation by
//! selecting alternate setting 0, and posts the terminal event. Once the
//! thread exits, nothing touches stream state again.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, warn};
use rustix::event::{poll, PollFd, PollFlags, Timespec};
use rustix::io::Errno;

use crate::device::DeviceShared;
use crate::error::{errno_to_transfer_error, StreamError, TransferError};
use crate::frame::Frame;
use crate::usbfs;

use super::queue::FrameQueue;
use super::reassembly::FrameReassembler;
use super::transfer::TransferSlot;
use super::StatsShared;

pub(crate) struct EngineConfig {
    pub interface_number: u8,
    pub endpoint: u8,
    pub num_transfers: usize,
    pub packets_per_transfer: usize,
    pub packet_size: usize,
    pub drop_on_overflow: bool,
}

struct Engine {
    shared: Arc<DeviceShared>,
    cfg: EngineConfig,
    reassembler: FrameReassembler,
    queue: Arc<FrameQueue>,
    stats: Arc<StatsShared>,
    slots: Vec<TransferSlot>,
    /// Completed slots held back while the consumer is behind.
    parked: Vec<usize>,
    fatal: Option<TransferError>,
    stopping: bool,
    frames_out: Vec<Frame>,
}

pub(crate) fn run(
    shared: Arc<DeviceShared>,
    cfg: EngineConfig,
    reassembler: FrameReassembler,
    queue: Arc<FrameQueue>,
    stop: Arc<AtomicBool>,
    stats: Arc<StatsShared>,
) {
    let slots = (0..cfg.num_transfers)
        .map(|i| TransferSlot::new(cfg.endpoint, cfg.packets_per_transfer, cfg.packet_size, i))
        .collect();
    let mut engine = Engine {
        shared,
        cfg,
        reassembler,
        queue,
        stats,
        slots,
        parked: Vec::new(),
        fatal: None,
        stopping: false,
        frames_out: Vec::new(),
    };
    engine.run(&stop);
}

impl Engine {
    fn run(&mut self, stop: &AtomicBool) {
        for index in 0..self.slots.len() {
            self.submit_slot(index);
            if self.fatal.is_some() {
                break;
            }
        }

        loop {
            if (stop.load(Ordering::Acquire) || self.fatal.is_some()) && !self.stopping {
                self.begin_stop();
            }

            let in_flight = self.in_flight();
            if self.stopping && in_flight == 0 {
                break;
            }

            if !self.stopping && !self.parked.is_empty() && self.may_submit() {
                for index in std::mem::take(&mut self.parked) {
                    self.submit_slot(index);
                }
            }

            if in_flight > 0 {
                self.wait_for_completions();
                self.reap_all();
            } else {
                // Everything is parked on backpressure; wait for the
                // consumer to drain.
                std::thread::sleep(Duration::from_millis(10));
            }
        }

        // The endpoint keeps its bandwidth reservation until alt 0 is
        // selected again.
        if !matches!(self.fatal, Some(TransferError::NoDevice)) {
            if let Err(e) =
                usbfs::set_interface(self.shared.fd(), self.cfg.interface_number, 0)
            {
                debug!("failed to restore alternate setting 0: {e}");
            }
        }

        match self.fatal {
            Some(e) => self.queue.push_terminal(StreamError::Transfer(e)),
            None => self.queue.push_terminal(StreamError::Stopped),
        }
        debug!("stream I/O thread exiting");
    }

    fn in_flight(&self) -> usize {
        self.slots.iter().filter(|s| s.is_submitted()).count()
    }

    fn may_submit(&self) -> bool {
        self.cfg.drop_on_overflow || !self.queue.is_saturated()
    }

    fn begin_stop(&mut self) {
        self.stopping = true;
        self.reassembler.discard_in_progress();
        // Cancel in reverse submission order so later transfers cannot
        // slip in and complete while earlier ones are being cancelled.
        for slot in self.slots.iter().rev().filter(|s| s.is_submitted()) {
            match slot.discard(self.shared.fd()) {
                Ok(()) => {}
                // EINVAL: the URB completed before the cancel landed.
                Err(Errno::INVAL) | Err(Errno::NODEV) => {}
                Err(e) => debug!("failed to discard a transfer: {e}"),
            }
        }
    }

    fn submit_slot(&mut self, index: usize) {
        match self.slots[index].submit(self.shared.fd()) {
            Ok(()) => {}
            Err(e) => {
                let err = errno_to_transfer_error(e);
                if err.is_fatal() {
                    error!("transfer submission failed: {e}");
                    self.fatal = Some(err);
                } else {
                    warn!("transfer submission failed, retrying later: {e}");
                    self.parked.push(index);
                }
            }
        }
    }

    fn wait_for_completions(&self) {
        let timeout = Timespec {
            tv_sec: 0,
            tv_nsec: 100_000_000,
        };
        let mut fds = [PollFd::new(self.shared.fd(), PollFlags::OUT)];
        match poll(&mut fds, Some(&timeout)) {
            Ok(_) | Err(Errno::INTR) => {}
            Err(e) => error!("poll on the usbfs fd failed: {e}"),
        }
    }

    fn reap_all(&mut self) {
        loop {
            match usbfs::reap_urb_ndelay(self.shared.fd()) {
                Ok(urb) => self.handle_completion(urb),
                Err(Errno::AGAIN) => break,
                Err(Errno::NODEV) => {
                    debug!("device disconnected");
                    self.fatal = Some(TransferError::NoDevice);
                    // The kernel has already completed every outstanding URB
                    // for a disconnected device; nothing further will reap.
                    for slot in &mut self.slots {
                        if slot.is_submitted() {
                            slot.mark_reaped();
                        }
                    }
                    break;
                }
                Err(e) => {
                    error!("unexpected error from REAPURBNDELAY: {e}");
                    break;
                }
            }
        }
    }

    fn handle_completion(&mut self, urb: *mut usbfs::Urb) {
        let index = unsafe { (*urb).usercontext as usize };
        if index >= self.slots.len() || self.slots[index].urb_ptr() != urb {
            // Out-of-order or foreign completions are not expected on a
            // single endpoint; treat the data gap as a frame error.
            warn!("reaped a URB that matches no transfer slot");
            self.reassembler.note_transfer_error();
            return;
        }
        self.slots[index].mark_reaped();

        let status = self.slots[index].status();
        let transfer_error = if status == 0 {
            None
        } else {
            Some(errno_to_transfer_error(Errno::from_raw_os_error(
                status.abs(),
            )))
        };

        match transfer_error {
            Some(TransferError::NoDevice) => {
                self.fatal = Some(TransferError::NoDevice);
                return;
            }
            Some(TransferError::Cancelled) => return,
            Some(e) => {
                // URB-level data errors poison the frame in progress but do
                // not stop the stream.
                debug!("transfer completed with {e}");
                self.stats.transfer_errors.fetch_add(1, Ordering::Relaxed);
                self.reassembler.note_transfer_error();
            }
            None => {}
        }

        if !self.stopping {
            self.process_packets(index);
        }

        if !self.stopping && self.fatal.is_none() {
            if self.may_submit() {
                self.submit_slot(index);
            } else {
                self.parked.push(index);
            }
        }
    }

    fn process_packets(&mut self, index: usize) {
        let slot = &self.slots[index];
        for (status, data) in slot.packets() {
            if status != 0 {
                self.stats.transfer_errors.fetch_add(1, Ordering::Relaxed);
                self.reassembler.note_transfer_error();
            } else if !data.is_empty() {
                self.reassembler.push_packet(data, &mut self.frames_out);
            }
        }
        for frame in self.frames_out.drain(..) {
            if self
                .queue
                .push_frame(frame, self.cfg.drop_on_overflow)
                .is_some()
            {
                self.stats.dropped_overflow.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}
