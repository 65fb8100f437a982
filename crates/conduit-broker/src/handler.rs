//! Outbound handler: one thread per local socket, turning the 12-byte
//! control frames an application writes into ring traffic.

use std::sync::Arc;

use conduit_ring::{Frame, FrameKind, RingFrame};
use tracing::{debug, warn};

use crate::{broker::Broker, stream::StreamRecord};

pub(crate) fn outbound_loop(broker: &Arc<Broker>, record: &Arc<StreamRecord>) {
    let id = record.id();
    loop {
        let frame = match record.socket().read_frame() {
            Ok(frame) => frame,
            Err(e) => {
                debug!(stream = id, %e, "local socket done");
                break;
            }
        };
        match frame.kind {
            FrameKind::Connect => {
                broker.ring.push(RingFrame::new(id, FrameKind::Connect, frame.arg1));
                if !record.wait_connected() {
                    debug!(stream = id, "stream closed while awaiting confirm");
                    break;
                }
                if let Err(e) = record.write_frame(Frame::new(FrameKind::Confirm, 0, 0)) {
                    debug!(stream = id, %e, "couldn't deliver confirm");
                    break;
                }
                record.mark_ready();
            }
            FrameKind::Write => {
                broker.ring.push(RingFrame::new(id, FrameKind::Write, frame.arg1));
                let mut src = record.socket();
                if let Err(e) = broker.ring.push_payload(id, &mut src, frame.arg1 as usize) {
                    debug!(stream = id, %e, "payload source died mid-write");
                    break;
                }
            }
            other => {
                warn!(stream = id, ?other, "ignoring unexpected frame kind on local socket");
            }
        }
    }
    // Covers every exit: sends Disconnect to the peer unless the peer
    // started this, and is a no-op if the pump already removed us.
    broker.streams.remove(id, &broker.ring);
}
