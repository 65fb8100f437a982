//! The per-peer broker context: one outbound ring writer, one stream table,
//! and the threads that feed them. Explicitly constructed and passed around;
//! nothing here is process-global.

use std::{
    io,
    os::unix::net::{UnixListener, UnixStream},
    sync::Arc,
    thread::JoinHandle,
};

use conduit_ring::{RegionError, RingConsumer, RingProducer, RingWriter, SharedRegion};
use conduit_utils::spawn_named;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::{
    config::BrokerConfig,
    handler, pump,
    socket::LocalSocket,
    stream::{StreamRecord, StreamTable},
};

#[derive(Error, Debug)]
pub enum BrokerError {
    #[error("region: {0}")]
    Region(#[from] RegionError),
    #[error("io: {0}")]
    Io(#[from] io::Error),
    #[error("another broker is listening on {0}")]
    AlreadyRunning(String),
}

pub struct Broker {
    pub(crate) config: BrokerConfig,
    pub(crate) streams: StreamTable,
    pub(crate) ring: RingWriter,
}

impl Broker {
    pub fn new(config: BrokerConfig) -> Result<Arc<Self>, BrokerError> {
        let region =
            SharedRegion::open(config.outbound_file(), config.region_len, config.sync_policy)?;
        let producer = RingProducer::new(region).with_poll_interval(config.poll_interval);
        // The producing side owns cursor init; the peer only ever sees an
        // empty ring at boot.
        producer.reset();
        let streams = StreamTable::new(config.is_guest);
        Ok(Arc::new(Self { config, streams, ring: RingWriter::new(producer) }))
    }

    /// Spawn the ring pump and the Broker-Socket acceptor. The returned
    /// handle is the acceptor's; both threads run for the process lifetime.
    pub fn start(self: &Arc<Self>) -> Result<JoinHandle<()>, BrokerError> {
        let inbound = SharedRegion::open(
            self.config.inbound_file(),
            self.config.region_len,
            self.config.sync_policy,
        )?;
        let consumer = RingConsumer::new(inbound).with_poll_interval(self.config.poll_interval);
        {
            let broker = self.clone();
            spawn_named("ring-pump", move || pump::pump_loop(broker, consumer));
        }

        let listener = self.bind_broker_socket()?;
        let broker = self.clone();
        Ok(spawn_named("acceptor", move || broker.accept_loop(listener)))
    }

    /// Bind the Broker Socket, clearing a stale inode from a dead instance
    /// first. A live listener answers the probe connect, in which case we
    /// refuse to start.
    fn bind_broker_socket(&self) -> Result<UnixListener, BrokerError> {
        let path = &self.config.socket_path;
        if path.exists() {
            match UnixStream::connect(path) {
                Ok(_) => return Err(BrokerError::AlreadyRunning(path.display().to_string())),
                Err(e) => {
                    debug!(?path, %e, "removing stale broker socket");
                    std::fs::remove_file(path)?;
                }
            }
        }
        let listener = UnixListener::bind(path)?;
        info!(?path, "broker socket ready");
        Ok(listener)
    }

    fn accept_loop(self: Arc<Self>, listener: UnixListener) {
        for incoming in listener.incoming() {
            match incoming {
                Ok(socket) => {
                    let id = self.streams.alloc_id();
                    let record = StreamRecord::new(id, LocalSocket::Unix(socket));
                    self.streams.insert(record.clone());
                    debug!(stream = id, "local client accepted");
                    let broker = self.clone();
                    spawn_named(format!("stream-{id}"), move || {
                        handler::outbound_loop(&broker, &record);
                    });
                }
                Err(e) => warn!(%e, "broker socket accept failed"),
            }
        }
    }
}
