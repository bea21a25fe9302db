//! Bounded hand-off queue between the I/O thread and frame consumers.
//!
//! A single mutex-guarded queue carries completed frames plus at most one
//! terminal event. The terminal event is sticky: once the stream stops or
//! fails, every `pop` after the queued frames drain reports it. Capacity
//! bounds only frames; under the drop-oldest policy the oldest queued frame
//! makes room, otherwise the queue grows past capacity by the handful of
//! in-flight completions while the engine pauses resubmission.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use log::debug;

use crate::error::StreamError;
use crate::frame::Frame;

struct Inner {
    frames: VecDeque<Frame>,
    terminal: Option<StreamError>,
}

pub(crate) struct FrameQueue {
    inner: Mutex<Inner>,
    cond: Condvar,
    capacity: usize,
}

impl FrameQueue {
    pub(crate) fn new(capacity: usize) -> FrameQueue {
        FrameQueue {
            inner: Mutex::new(Inner {
                frames: VecDeque::new(),
                terminal: None,
            }),
            cond: Condvar::new(),
            capacity: capacity.max(1),
        }
    }

    /// Queue a completed frame. Returns the frame that was displaced to make
    /// room, if the drop-oldest policy applied.
    pub(crate) fn push_frame(&self, frame: Frame, drop_oldest: bool) -> Option<Frame> {
        let mut inner = self.inner.lock().unwrap();
        let displaced = if inner.frames.len() >= self.capacity && drop_oldest {
            let displaced = inner.frames.pop_front();
            if let Some(old) = &displaced {
                debug!("frame queue full, dropping frame #{}", old.sequence());
            }
            displaced
        } else {
            None
        };
        inner.frames.push_back(frame);
        self.cond.notify_one();
        displaced
    }

    /// Record the stream's terminal state. The first terminal event wins.
    pub(crate) fn push_terminal(&self, terminal: StreamError) {
        let mut inner = self.inner.lock().unwrap();
        if inner.terminal.is_none() {
            inner.terminal = Some(terminal);
        }
        self.cond.notify_all();
    }

    /// Whether the queue holds at least `capacity` frames. The engine uses
    /// this to pause resubmission when overflow must not drop frames.
    pub(crate) fn is_saturated(&self) -> bool {
        self.inner.lock().unwrap().frames.len() >= self.capacity
    }

    /// Wait for the next frame, draining queued frames before reporting a
    /// terminal state.
    pub(crate) fn pop(&self, timeout: Duration) -> Result<Frame, StreamError> {
        let deadline = Instant::now() + timeout;
        let mut inner = self.inner.lock().unwrap();
        loop {
            if let Some(frame) = inner.frames.pop_front() {
                return Ok(frame);
            }
            if let Some(terminal) = inner.terminal {
                return Err(terminal);
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(StreamError::TimedOut);
            }
            let (guard, _) = self.cond.wait_timeout(inner, deadline - now).unwrap();
            inner = guard;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::FourCc;
    use std::sync::Arc;
    use std::time::Instant;

    fn frame(sequence: u64) -> Frame {
        Frame {
            payload: vec![0u8; 4],
            fourcc: FourCc::MJPG,
            width: 1,
            height: 1,
            sequence,
            pts: None,
            completed_at: Instant::now(),
        }
    }

    #[test]
    fn delivers_in_order() {
        let q = FrameQueue::new(4);
        q.push_frame(frame(0), true);
        q.push_frame(frame(1), true);
        assert_eq!(q.pop(Duration::from_millis(1)).unwrap().sequence(), 0);
        assert_eq!(q.pop(Duration::from_millis(1)).unwrap().sequence(), 1);
        assert_eq!(
            q.pop(Duration::from_millis(1)).unwrap_err(),
            StreamError::TimedOut
        );
    }

    #[test]
    fn drop_oldest_displaces_front() {
        let q = FrameQueue::new(2);
        assert!(q.push_frame(frame(0), true).is_none());
        assert!(q.push_frame(frame(1), true).is_none());
        let displaced = q.push_frame(frame(2), true).unwrap();
        assert_eq!(displaced.sequence(), 0);
        assert_eq!(q.pop(Duration::from_millis(1)).unwrap().sequence(), 1);
        assert_eq!(q.pop(Duration::from_millis(1)).unwrap().sequence(), 2);
    }

    #[test]
    fn without_drop_oldest_queue_grows() {
        let q = FrameQueue::new(1);
        assert!(q.push_frame(frame(0), false).is_none());
        assert!(q.push_frame(frame(1), false).is_none());
        assert!(q.is_saturated());
        assert_eq!(q.pop(Duration::from_millis(1)).unwrap().sequence(), 0);
        assert_eq!(q.pop(Duration::from_millis(1)).unwrap().sequence(), 1);
    }

    #[test]
    fn terminal_is_sticky_after_drain() {
        let q = FrameQueue::new(4);
        q.push_frame(frame(0), true);
        q.push_terminal(StreamError::Stopped);
        // Queued frames still drain first.
        assert_eq!(q.pop(Duration::from_millis(1)).unwrap().sequence(), 0);
        assert_eq!(
            q.pop(Duration::from_millis(1)).unwrap_err(),
            StreamError::Stopped
        );
        assert_eq!(
            q.pop(Duration::from_millis(1)).unwrap_err(),
            StreamError::Stopped
        );
    }

    #[test]
    fn first_terminal_wins() {
        let q = FrameQueue::new(4);
        q.push_terminal(StreamError::Transfer(crate::error::TransferError::NoDevice));
        q.push_terminal(StreamError::Stopped);
        assert_eq!(
            q.pop(Duration::from_millis(1)).unwrap_err(),
            StreamError::Transfer(crate::error::TransferError::NoDevice)
        );
    }

    #[test]
    fn pop_wakes_on_push_from_another_thread() {
        let q = Arc::new(FrameQueue::new(4));
        let producer = Arc::clone(&q);
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(10));
            producer.push_frame(frame(7), true);
        });
        let got = q.pop(Duration::from_secs(5)).unwrap();
        assert_eq!(got.sequence(), 7);
        handle.join().unwrap();
    }
}
