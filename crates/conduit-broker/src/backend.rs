//! Registered backends, keyed by small integer id.
//!
//! The table is static; each record resolves its env overrides once, on
//! first use, under its own lock. The prefix-less `CONN_ADDRESS` /
//! `CONN_PORT` / `CONN_USE_TCP` variables win over the per-backend
//! `CONN_<PREFIX>_*` ones, which win over the defaults baked in here.

use std::net::{TcpStream, ToSocketAddrs};

use conduit_utils::env::{env_layered, env_layered_flag};
use tracing::{debug, warn};

pub const DEFAULT_BACKEND_ADDRESS: &str = "192.168.64.1";

struct BackendState {
    address: String,
    port: u16,
    use_tcp: bool,
    resolved: bool,
}

pub struct Backend {
    prefix: &'static str,
    compression: bool,
    state: spin::Mutex<BackendState>,
}

impl Backend {
    const fn new(prefix: &'static str, port: u16, compression: bool) -> Self {
        Self {
            prefix,
            compression,
            state: spin::Mutex::new(BackendState {
                address: String::new(),
                port,
                use_tcp: true,
                resolved: false,
            }),
        }
    }
}

/// Snapshot of a backend record after env resolution.
#[derive(Clone, Debug)]
pub struct ResolvedBackend {
    pub prefix: &'static str,
    pub address: String,
    pub port: u16,
    pub use_tcp: bool,
    pub compression: bool,
}

static BACKENDS: [Backend; 3] = [
    Backend::new("STREAM", 9000, true),
    Backend::new("CLIP", 9001, false),
    Backend::new("AV", 9002, false),
];

pub fn get_backend(id: u32) -> Option<ResolvedBackend> {
    let backend = BACKENDS.get(id as usize)?;
    let mut state = backend.state.lock();
    if !state.resolved {
        let prefix = backend.prefix;
        state.address = env_layered(
            "CONN_ADDRESS",
            &format!("CONN_{prefix}_ADDRESS"),
            DEFAULT_BACKEND_ADDRESS.to_string(),
        );
        state.port = env_layered("CONN_PORT", &format!("CONN_{prefix}_PORT"), state.port);
        state.use_tcp =
            env_layered_flag("CONN_USE_TCP", &format!("CONN_{prefix}_USE_TCP"), state.use_tcp);
        state.resolved = true;
        debug!(
            prefix,
            address = state.address,
            port = state.port,
            use_tcp = state.use_tcp,
            "resolved backend"
        );
    }
    Some(ResolvedBackend {
        prefix: backend.prefix,
        address: state.address.clone(),
        port: state.port,
        use_tcp: state.use_tcp,
        compression: backend.compression,
    })
}

/// Open a TCP connection to a backend listener. Retries forever with no
/// backoff: the link is intra-machine and the backend is expected to exist.
/// Sets `TCP_NODELAY`.
pub fn connect_backend(backend: &ResolvedBackend) -> TcpStream {
    loop {
        let addrs = match (backend.address.as_str(), backend.port).to_socket_addrs() {
            Ok(addrs) => addrs,
            Err(e) => {
                debug!(prefix = backend.prefix, %e, "backend resolve failed, retrying");
                continue;
            }
        };
        for addr in addrs {
            match TcpStream::connect(addr) {
                Ok(stream) => {
                    if let Err(e) = stream.set_nodelay(true) {
                        warn!(%e, "couldn't set TCP_NODELAY on backend connection");
                    }
                    return stream;
                }
                Err(e) => debug!(prefix = backend.prefix, %addr, %e, "backend connect failed"),
            }
        }
    }
}
