//! Isochronous URB ownership.
//!
//! A [`TransferSlot`] is one in-flight isochronous transfer: the URB header
//! and its variable-length packet-descriptor tail live in a single manual
//! allocation (the layout usbfs expects), next to a data buffer of
//! `packets × packet_size` bytes. While submitted, the kernel owns both; the
//! slot hands out packet views only after the URB has been reaped.

use std::alloc::{alloc_zeroed, dealloc, handle_alloc_error, Layout};
use std::ffi::c_void;

use log::error;
use rustix::fd::OwnedFd;
use rustix::io;

use crate::usbfs::{self, IsoPacketDesc, Urb, USBDEVFS_URB_ISO_ASAP, USBDEVFS_URB_TYPE_ISO};

pub(crate) struct TransferSlot {
    urb: *mut Urb,
    layout: Layout,
    buffer: Vec<u8>,
    num_packets: usize,
    packet_size: usize,
    submitted: bool,
}

// The raw URB pointer is only touched from the I/O thread that owns the
// slot; the type exists to move the slot onto that thread.
unsafe impl Send for TransferSlot {}

impl TransferSlot {
    /// Allocate an idle slot. `index` is stored in the URB's user context to
    /// match reaped URBs back to their slot.
    pub(crate) fn new(
        endpoint: u8,
        num_packets: usize,
        packet_size: usize,
        index: usize,
    ) -> TransferSlot {
        assert!(num_packets > 0 && packet_size > 0);
        let (layout, descs_offset) = Layout::new::<Urb>()
            .extend(Layout::array::<IsoPacketDesc>(num_packets).unwrap())
            .unwrap();
        debug_assert_eq!(descs_offset, std::mem::size_of::<Urb>());

        let mut buffer = vec![0u8; num_packets * packet_size];
        let urb = unsafe {
            let ptr = alloc_zeroed(layout) as *mut Urb;
            if ptr.is_null() {
                handle_alloc_error(layout);
            }
            ptr.write(Urb {
                ep_type: USBDEVFS_URB_TYPE_ISO,
                endpoint,
                status: 0,
                flags: USBDEVFS_URB_ISO_ASAP,
                buffer: buffer.as_mut_ptr(),
                buffer_length: buffer.len() as i32,
                actual_length: 0,
                start_frame: 0,
                number_of_packets_or_stream_id: num_packets as u32,
                error_count: 0,
                signr: 0,
                usercontext: index as *mut c_void,
            });
            let descs = ptr.add(1) as *mut IsoPacketDesc;
            for i in 0..num_packets {
                descs.add(i).write(IsoPacketDesc {
                    length: packet_size as u32,
                    actual_length: 0,
                    status: 0,
                });
            }
            ptr
        };

        TransferSlot {
            urb,
            layout,
            buffer,
            num_packets,
            packet_size,
            submitted: false,
        }
    }

    pub(crate) fn urb_ptr(&self) -> *mut Urb {
        self.urb
    }

    pub(crate) fn is_submitted(&self) -> bool {
        self.submitted
    }

    /// URB-level completion status as a negative errno (0 on success).
    pub(crate) fn status(&self) -> i32 {
        unsafe { (*self.urb).status }
    }

    pub(crate) fn submit(&mut self, fd: &OwnedFd) -> io::Result<()> {
        debug_assert!(!self.submitted);
        unsafe { usbfs::submit_urb(fd, self.urb) }?;
        self.submitted = true;
        Ok(())
    }

    /// Ask the kernel to cancel the URB; it still completes and must be
    /// reaped.
    pub(crate) fn discard(&self, fd: &OwnedFd) -> io::Result<()> {
        debug_assert!(self.submitted);
        unsafe { usbfs::discard_urb(fd, self.urb) }
    }

    /// Mark the URB as handed back by the kernel.
    pub(crate) fn mark_reaped(&mut self) {
        self.submitted = false;
    }

    fn descs(&self) -> &[IsoPacketDesc] {
        debug_assert!(!self.submitted);
        unsafe {
            std::slice::from_raw_parts(self.urb.add(1) as *const IsoPacketDesc, self.num_packets)
        }
    }

    /// Per-packet completion views: `(status, received bytes)` in iso packet
    /// order. Only valid after the URB was reaped.
    pub(crate) fn packets(&self) -> impl Iterator<Item = (i32, &[u8])> {
        let packet_size = self.packet_size;
        let buffer = &self.buffer;
        self.descs().iter().enumerate().map(move |(i, desc)| {
            let status = desc.status as i32;
            let actual = (desc.actual_length as usize).min(packet_size);
            let start = i * packet_size;
            (status, &buffer[start..start + actual])
        })
    }
}

impl Drop for TransferSlot {
    fn drop(&mut self) {
        if self.submitted {
            // The kernel still owns the allocation; freeing it would hand the
            // DMA target to the allocator. Leak the buffers instead.
            error!("leaking a transfer slot that was never reaped");
            std::mem::forget(std::mem::take(&mut self.buffer));
            return;
        }
        unsafe {
            dealloc(self.urb as *mut u8, self.layout);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slot_layout_places_descriptors_after_urb() {
        let slot = TransferSlot::new(0x81, 8, 1024, 3);
        assert_eq!(slot.descs().len(), 8);
        assert!(slot.descs().iter().all(|d| d.length == 1024));
        let urb = unsafe { &*slot.urb_ptr() };
        assert_eq!(urb.endpoint, 0x81);
        assert_eq!(urb.number_of_packets_or_stream_id, 8);
        assert_eq!(urb.buffer_length, 8 * 1024);
        assert_eq!(urb.usercontext as usize, 3);
    }

    #[test]
    fn packets_respect_actual_lengths() {
        let mut slot = TransferSlot::new(0x81, 2, 4, 0);
        slot.buffer[..4].copy_from_slice(&[1, 2, 3, 4]);
        slot.buffer[4..8].copy_from_slice(&[5, 6, 7, 8]);
        unsafe {
            let descs = slot.urb.add(1) as *mut IsoPacketDesc;
            (*descs).actual_length = 2;
            (*descs.add(1)).actual_length = 4;
            (*descs.add(1)).status = (-32i32) as u32; // -EPIPE
        }
        let packets: Vec<(i32, Vec<u8>)> = slot
            .packets()
            .map(|(status, data)| (status, data.to_vec()))
            .collect();
        assert_eq!(packets[0], (0, vec![1, 2]));
        assert_eq!(packets[1], (-32, vec![5, 6, 7, 8]));
    }
}
