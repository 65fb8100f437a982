//! Inbound handler: the single thread draining the inbound ring.
//!
//! Dispatch is strictly in ring order. The `Disconnect` arm blocks on the
//! stream-table condvar until the record is gone, so no later frame for a
//! dead id can race its teardown.

use std::sync::Arc;

use conduit_ring::{Frame, FrameKind, RingConsumer, RingFrame};
use conduit_utils::{ThreadPriority, spawn_named, thread_boot};
use tracing::{debug, info, warn};

use crate::{
    backend::{connect_backend, get_backend},
    broker::Broker,
    handler,
    socket::LocalSocket,
    stream::StreamRecord,
};

pub(crate) fn pump_loop(broker: Arc<Broker>, mut consumer: RingConsumer) {
    thread_boot(broker.config.pump_core, ThreadPriority::Polling);
    loop {
        consumer.pop(|frame, payload| dispatch(&broker, frame, payload));
    }
}

fn dispatch(broker: &Arc<Broker>, frame: RingFrame, payload: &[u8]) {
    let id = frame.stream_id;
    match frame.kind {
        FrameKind::Connect => accept_remote(broker, id, frame.arg1),

        FrameKind::Confirm => match broker.streams.get(id) {
            Some(record) => record.mark_connected(),
            None => warn!(stream = id, "confirm for unknown stream"),
        },

        FrameKind::Write => {
            let Some(record) = broker.streams.get(id) else {
                debug!(stream = id, "write for dead stream");
                return;
            };
            record.await_ready();
            if let Err(e) = record.write_frame(Frame::new(FrameKind::Write, frame.arg1, 0)) {
                debug!(stream = id, %e, "local socket rejected write, tearing down");
                broker.streams.remove(id, &broker.ring);
            }
        }

        FrameKind::Data => {
            let Some(record) = broker.streams.get(id) else {
                debug!(stream = id, "data for dead stream");
                return;
            };
            record.await_ready();
            if let Err(e) = record.write_payload(payload) {
                debug!(stream = id, %e, "local socket rejected payload, tearing down");
                broker.streams.remove(id, &broker.ring);
            }
        }

        FrameKind::Disconnect => {
            let Some(record) = broker.streams.get(id) else {
                return;
            };
            record.mark_peer_closed();
            record.socket().shutdown();
            // The handler's error path does the removal; hold dispatch until
            // it has, so this is the last frame this id ever sees.
            broker.streams.await_removed(id);
        }
    }
}

/// Peer-initiated stream: pair the connect with its registered backend and
/// confirm back.
fn accept_remote(broker: &Arc<Broker>, id: u32, backend_id: u32) {
    if broker.streams.contains(id) {
        warn!(stream = id, "connect for an id that is still live");
        return;
    }
    let Some(backend) = get_backend(backend_id) else {
        warn!(stream = id, backend_id, "connect for unknown backend");
        return;
    };
    info!(stream = id, backend = backend.prefix, "inbound connect");

    let socket = connect_backend(&backend);
    let record = StreamRecord::new(id, LocalSocket::Tcp(socket));
    record.mark_connected();
    record.mark_ready();
    broker.streams.insert(record.clone());
    broker.ring.push(RingFrame::new(id, FrameKind::Confirm, 0));

    let broker = broker.clone();
    spawn_named(format!("stream-{id}"), move || handler::outbound_loop(&broker, &record));
}
