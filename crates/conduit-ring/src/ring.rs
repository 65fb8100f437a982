//! Single-producer/single-consumer ring over a [`SharedRegion`].
//!
//! Cursors are one byte each and wrap modulo 256, so the ring holds at most
//! 255 occupied segments: empty is `head == tail`, full is
//! `tail + 1 == head (mod 256)`. The producer only advances `tail`, the
//! consumer only advances `head`; each side re-polls the other's cursor, so
//! a stale read just costs one more poll iteration.

use std::{io::Read, thread, time::Duration};

use tracing::warn;

use crate::{
    error::RingError,
    frame::{FRAME_LEN, FrameKind, RingFrame},
    region::SharedRegion,
};

/// Reference polling interval; tune via `with_poll_interval`.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_micros(10);

pub struct RingProducer {
    region: SharedRegion,
    poll_interval: Duration,
}

impl RingProducer {
    pub fn new(region: SharedRegion) -> Self {
        Self { region, poll_interval: DEFAULT_POLL_INTERVAL }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Zero both cursors. Called once by the producing side at boot, before
    /// any traffic; the peer only ever observes an empty ring.
    pub fn reset(&self) {
        self.region.set_head(0);
        self.region.set_tail(0);
    }

    pub fn payload_capacity(&self) -> usize {
        self.region.payload_capacity()
    }

    /// Sleep-poll until the ring has a free segment, returning the slot to
    /// fill. No timeout: a stalled peer stalls us, and the heartbeat is the
    /// one to notice.
    fn wait_space(&self) -> u8 {
        loop {
            let tail = self.region.tail();
            if tail.wrapping_add(1) != self.region.head() {
                return tail;
            }
            thread::sleep(self.poll_interval);
        }
    }

    fn commit(&self, tail: u8) {
        self.region.publish_segment(tail);
        self.region.set_tail(tail.wrapping_add(1));
    }

    /// Write one control frame.
    pub fn push(&mut self, frame: RingFrame) {
        let tail = self.wait_space();
        frame.encode(self.region.segment_mut(tail));
        self.commit(tail);
    }

    /// Stream `len` payload bytes out of `src` as a `Data` frame sequence,
    /// one segment at a time. Bytes land directly in the mapped segment; a
    /// frame is only published once its payload is fully in place.
    pub fn push_payload(
        &mut self,
        stream_id: u32,
        src: &mut impl Read,
        len: usize,
    ) -> Result<(), RingError> {
        let cap = self.region.payload_capacity();
        let mut remaining = len;
        while remaining > 0 {
            let tail = self.wait_space();
            let written = remaining.min(cap);
            let seg = self.region.segment_mut(tail);
            RingFrame::new(stream_id, FrameKind::Data, written as u32).encode(seg);
            src.read_exact(&mut seg[FRAME_LEN..FRAME_LEN + written])?;
            self.commit(tail);
            remaining -= written;
        }
        Ok(())
    }
}

/// Producer behind the per-direction writer mutex: every thread encoding
/// frames into one outbound region goes through the same [`RingWriter`], so
/// pushes are totally ordered and a multi-segment payload is emitted as one
/// unbroken call.
pub struct RingWriter {
    inner: spin::Mutex<RingProducer>,
}

impl RingWriter {
    pub fn new(producer: RingProducer) -> Self {
        Self { inner: spin::Mutex::new(producer) }
    }

    pub fn reset(&self) {
        self.inner.lock().reset();
    }

    pub fn payload_capacity(&self) -> usize {
        self.inner.lock().payload_capacity()
    }

    pub fn push(&self, frame: RingFrame) {
        self.inner.lock().push(frame);
    }

    pub fn push_payload(
        &self,
        stream_id: u32,
        src: &mut impl Read,
        len: usize,
    ) -> Result<(), RingError> {
        self.inner.lock().push_payload(stream_id, src, len)
    }
}

pub struct RingConsumer {
    region: SharedRegion,
    poll_interval: Duration,
}

impl RingConsumer {
    pub fn new(region: SharedRegion) -> Self {
        Self { region, poll_interval: DEFAULT_POLL_INTERVAL }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn occupancy(&self) -> u8 {
        self.region.tail().wrapping_sub(self.region.head())
    }

    /// Dispatch the frame at `head`, if any. A malformed frame is dropped
    /// with a diagnostic and counts as no frame; the medium is trusted, so
    /// there is no recovery beyond skipping the slot.
    pub fn try_pop<R>(&mut self, f: impl FnOnce(RingFrame, &[u8]) -> R) -> Option<R> {
        let head = self.region.head();
        if head == self.region.tail() {
            return None;
        }
        let seg = self.region.segment(head);
        let out = match RingFrame::decode(seg) {
            Ok(frame) => {
                let payload = if frame.kind == FrameKind::Data {
                    let len = (frame.arg1 as usize).min(self.region.payload_capacity());
                    conduit_utils::safe_assert!(
                        len == frame.arg1 as usize,
                        "data frame claims more payload than a segment holds"
                    );
                    &seg[FRAME_LEN..FRAME_LEN + len]
                } else {
                    &[][..]
                };
                Some(f(frame, payload))
            }
            Err(e) => {
                warn!(%e, slot = head, "dropping malformed ring frame");
                None
            }
        };
        self.region.set_head(head.wrapping_add(1));
        out
    }

    /// Sleep-poll until a well-formed frame arrives and dispatch it.
    pub fn pop<R>(&mut self, mut f: impl FnMut(RingFrame, &[u8]) -> R) -> R {
        loop {
            if let Some(r) = self.try_pop(&mut f) {
                return r;
            }
            thread::sleep(self.poll_interval);
        }
    }
}
